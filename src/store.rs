//! Message store with peek-lock delivery, delivery tracking, and a
//! dead-letter sub-queue per entity.
//!
//! Each queue and subscription gets a `MessageStore` that holds envelopes
//! (message + sequence number, enqueued time, delivery count, lock state).
//!
//! Delivery modes:
//! - **ReceiveAndDelete**: the message is removed on delivery.
//! - **PeekLock**: the message is locked for the entity's lock duration.
//!   The consumer must complete, abandon, or dead-letter it through the
//!   lock token before the lock expires. An expired lock behaves like an
//!   abandon: the message becomes available again, or is dead-lettered
//!   once the delivery count has reached the maximum.
//!
//! Expired locks and TTL-expired messages are processed at the start of
//! every store operation and by the broker's periodic [`MessageStore::sweep`],
//! so expiry is observed without another receive call.
//!
//! ## DLQ architecture
//!
//! Each `MessageStore` holds an `Arc<DlqStore>`. The `DlqStore` is a
//! separate, simpler type with no nested DLQ: dead-lettered messages are
//! terminal and never expire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::error::{BrokerError, Result};
use crate::lock::{LockTable, LockToken};
use crate::message::Message;

/// Monotonically increasing sequence number assigned to each enqueued message.
pub type SequenceNumber = u64;

/// Dead-letter reason recorded when the delivery count limit is exceeded.
pub const REASON_MAX_DELIVERY: &str = "MaxDeliveryCountExceeded";
/// Dead-letter reason recorded when a message expires with
/// dead-lettering-on-expiration enabled.
pub const REASON_EXPIRED: &str = "TTLExpiredException";

/// State of a message in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageState {
    /// Available for delivery.
    Available,
    /// Locked by a consumer until `locked_until`, settled via `token`.
    Locked {
        token: LockToken,
        locked_until: Instant,
    },
}

/// How a receive call takes messages from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    PeekLock,
    ReceiveAndDelete,
}

/// Outcome of a successful settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Abandoned,
    /// The message went to the dead-letter sub-queue (explicitly, or
    /// because the delivery count limit was reached on abandon).
    DeadLettered,
}

/// A message with broker-assigned metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    /// Broker-assigned sequence number (monotonically increasing per entity).
    pub sequence_number: SequenceNumber,
    /// When the message was enqueued (milliseconds since UNIX epoch).
    pub enqueued_time_utc: u64,
    /// Number of delivery attempts so far (incremented on peek-lock receive).
    pub delivery_count: u32,
    pub state: MessageState,
    /// Effective TTL (message TTL or the entity default).
    pub time_to_live: Option<Duration>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

impl Envelope {
    /// True if this message's TTL has elapsed at `now_epoch_ms`.
    pub fn is_expired(&self, now_epoch_ms: u64) -> bool {
        match self.time_to_live {
            Some(ttl) if !ttl.is_zero() => {
                now_epoch_ms >= self.enqueued_time_utc + ttl.as_millis() as u64
            }
            _ => false,
        }
    }

    /// The lock token, if this envelope is locked.
    pub fn lock_token(&self) -> Option<LockToken> {
        match &self.state {
            MessageState::Locked { token, .. } => Some(*token),
            MessageState::Available => None,
        }
    }
}

/// Runtime configuration for a message store entity.
#[derive(Debug, Clone)]
pub struct EntityConfig {
    /// Lock duration for peek-lock mode.
    pub lock_duration: Duration,
    /// Delivery attempts after which an abandon or lock expiry dead-letters.
    pub max_delivery_count: u32,
    /// Default TTL applied to messages that carry none.
    pub default_message_ttl: Option<Duration>,
    /// Dead-letter expired messages (true) or discard them (false).
    pub dead_lettering_on_expiration: bool,
    /// Maximum number of messages the store can hold. 0 = unbounded.
    pub max_size: usize,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            default_message_ttl: None,
            dead_lettering_on_expiration: false,
            max_size: 0,
        }
    }
}

/// Inner mutable state shared by both store types.
struct StoreInner {
    /// Message arena (available + locked messages) in sequence order.
    messages: VecDeque<Envelope>,
    /// Outstanding peek-locks.
    locks: LockTable,
}

impl StoreInner {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            locks: LockTable::new(),
        }
    }

    fn position(&self, sequence: SequenceNumber) -> Option<usize> {
        self.messages
            .iter()
            .position(|e| e.sequence_number == sequence)
    }
}

// ---------------------------------------------------------------------------
// MessageStore: the main message store for queues and subscriptions
// ---------------------------------------------------------------------------

/// A message store for a single queue or subscription.
///
/// Thread-safe and supports multiple concurrent consumers (competing
/// consumers). Uses `Notify` to wake waiting receivers when a message
/// arrives or an expired lock frees one.
pub struct MessageStore {
    /// Entity path this store belongs to (for logging and quota errors).
    name: String,
    inner: Mutex<StoreInner>,
    notify: Notify,
    next_sequence: AtomicU64,
    config: EntityConfig,
    dlq: Arc<DlqStore>,
}

impl MessageStore {
    pub fn new(name: impl Into<String>, config: EntityConfig, dlq: Arc<DlqStore>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(StoreInner::new()),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(1),
            config,
            dlq,
        }
    }

    /// Appends a message, assigning the next sequence number and the
    /// entity default TTL when the message carries none.
    ///
    /// Fails with `QuotaExceeded` when the store is at its configured
    /// capacity.
    pub async fn enqueue(&self, message: Message) -> Result<SequenceNumber> {
        let mut inner = self.inner.lock().await;
        // Expire stale messages first so they don't count against the quota.
        let (to_dlq, _) = self.process_expirations(&mut inner);

        if self.config.max_size > 0 && inner.messages.len() >= self.config.max_size {
            drop(inner);
            self.flush_dead_letters(to_dlq).await;
            debug!(
                entity = %self.name,
                max_size = self.config.max_size,
                "rejecting message, store at capacity"
            );
            return Err(BrokerError::QuotaExceeded(self.name.clone()));
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let time_to_live = message.time_to_live.or(self.config.default_message_ttl);
        inner.messages.push_back(Envelope {
            message,
            sequence_number: sequence,
            enqueued_time_utc: epoch_ms(),
            delivery_count: 0,
            state: MessageState::Available,
            time_to_live,
            dead_letter_reason: None,
            dead_letter_description: None,
        });
        drop(inner);
        self.notify.notify_one();
        self.flush_dead_letters(to_dlq).await;
        trace!(entity = %self.name, seq = sequence, "message enqueued");
        Ok(sequence)
    }

    /// Receives the earliest available message, waiting up to `timeout`
    /// for one to arrive. Returns `None` when the timeout elapses, which
    /// is a normal outcome, not an error.
    ///
    /// In peek-lock mode the returned envelope is locked for the entity's
    /// lock duration and its delivery count has been incremented. The wait
    /// holds no reservation, so cancelling the future releases nothing.
    pub async fn receive(&self, mode: ReceiveMode, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.try_receive(mode).await {
                return Some(envelope);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // A wake-up only means state may have changed; the loop re-checks.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    /// Non-blocking receive attempt.
    pub async fn try_receive(&self, mode: ReceiveMode) -> Option<Envelope> {
        let (result, to_dlq) = {
            let mut inner = self.inner.lock().await;
            let (to_dlq, _) = self.process_expirations(&mut inner);

            let idx = inner
                .messages
                .iter()
                .position(|e| matches!(e.state, MessageState::Available));

            let result = match idx {
                None => None,
                Some(idx) => match mode {
                    ReceiveMode::ReceiveAndDelete => inner.messages.remove(idx),
                    ReceiveMode::PeekLock => {
                        let sequence = inner.messages[idx].sequence_number;
                        let (token, locked_until) =
                            inner.locks.grant(sequence, self.config.lock_duration);
                        let envelope = &mut inner.messages[idx];
                        envelope.state = MessageState::Locked {
                            token,
                            locked_until,
                        };
                        envelope.delivery_count += 1;
                        trace!(
                            entity = %self.name,
                            seq = sequence,
                            token = %token,
                            delivery_count = envelope.delivery_count,
                            "message locked"
                        );
                        Some(envelope.clone())
                    }
                },
            };
            (result, to_dlq)
        };
        self.flush_dead_letters(to_dlq).await;
        result
    }

    /// Completes a locked message, removing it permanently.
    pub async fn complete(&self, token: LockToken) -> Result<Settlement> {
        let mut inner = self.inner.lock().await;
        let sequence = inner
            .locks
            .redeem(token)
            .ok_or(BrokerError::LockLost(token))?;
        let idx = inner
            .position(sequence)
            .ok_or(BrokerError::LockLost(token))?;
        inner.messages.remove(idx);
        debug!(entity = %self.name, seq = sequence, "message completed");
        Ok(Settlement::Completed)
    }

    /// Abandons a locked message: it becomes available again immediately.
    /// Once the delivery count has reached the maximum, the message is
    /// dead-lettered instead.
    pub async fn abandon(&self, token: LockToken) -> Result<Settlement> {
        let dead = {
            let mut inner = self.inner.lock().await;
            let sequence = inner
                .locks
                .redeem(token)
                .ok_or(BrokerError::LockLost(token))?;
            let idx = inner
                .position(sequence)
                .ok_or(BrokerError::LockLost(token))?;

            if inner.messages[idx].delivery_count >= self.config.max_delivery_count {
                let mut envelope = inner.messages.remove(idx).unwrap();
                envelope.dead_letter_reason = Some(REASON_MAX_DELIVERY.to_string());
                envelope.dead_letter_description = Some(format!(
                    "delivery count {} reached the limit of {}",
                    envelope.delivery_count, self.config.max_delivery_count
                ));
                Some(envelope)
            } else {
                inner.messages[idx].state = MessageState::Available;
                drop(inner);
                self.notify.notify_one();
                None
            }
        };

        match dead {
            Some(envelope) => {
                debug!(
                    entity = %self.name,
                    seq = envelope.sequence_number,
                    "abandon exceeded max delivery count, dead-lettering"
                );
                self.dlq.enqueue_envelope(envelope).await;
                Ok(Settlement::DeadLettered)
            }
            None => Ok(Settlement::Abandoned),
        }
    }

    /// Explicitly dead-letters a locked message.
    pub async fn dead_letter(
        &self,
        token: LockToken,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<Settlement> {
        let envelope = {
            let mut inner = self.inner.lock().await;
            let sequence = inner
                .locks
                .redeem(token)
                .ok_or(BrokerError::LockLost(token))?;
            let idx = inner
                .position(sequence)
                .ok_or(BrokerError::LockLost(token))?;
            let mut envelope = inner.messages.remove(idx).unwrap();
            envelope.dead_letter_reason = reason;
            envelope.dead_letter_description = description;
            envelope
        };
        debug!(entity = %self.name, seq = envelope.sequence_number, "message dead-lettered");
        self.dlq.enqueue_envelope(envelope).await;
        Ok(Settlement::DeadLettered)
    }

    /// Renews a live lock for another lock duration. Returns the new expiry.
    pub async fn renew_lock(&self, token: LockToken) -> Result<Instant> {
        let mut inner = self.inner.lock().await;
        let (sequence, expires_at) = inner
            .locks
            .renew(token, self.config.lock_duration)
            .ok_or(BrokerError::LockLost(token))?;
        if let Some(idx) = inner.position(sequence) {
            if let MessageState::Locked { locked_until, .. } = &mut inner.messages[idx].state {
                *locked_until = expires_at;
            }
        }
        Ok(expires_at)
    }

    /// Applies lock expiry and TTL processing once.
    ///
    /// The broker's maintenance task calls this periodically so expired
    /// locks become visible without another receive call; every store
    /// operation also runs the same processing on entry. Returns the
    /// number of messages that changed state.
    pub async fn sweep(&self) -> usize {
        let (to_dlq, freed) = {
            let mut inner = self.inner.lock().await;
            self.process_expirations(&mut inner)
        };
        let changed = to_dlq.len() + freed;
        if freed > 0 {
            // Wake waiting receivers; each re-checks under the store mutex.
            self.notify.notify_waiters();
            self.notify.notify_one();
        }
        self.flush_dead_letters(to_dlq).await;
        changed
    }

    /// Returns the number of messages available for delivery.
    pub async fn available_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .messages
            .iter()
            .filter(|e| matches!(e.state, MessageState::Available))
            .count()
    }

    /// Returns the total number of messages (available + locked).
    pub async fn total_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    /// The dead-letter sub-queue for this entity.
    pub fn dlq(&self) -> &Arc<DlqStore> {
        &self.dlq
    }

    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases expired locks (dead-lettering messages over the delivery
    /// limit) and removes TTL-expired available messages. Returns the
    /// envelopes destined for the DLQ and the number of messages made
    /// available again. Runs under the store mutex; the DLQ append happens
    /// afterwards via `flush_dead_letters`.
    fn process_expirations(&self, inner: &mut StoreInner) -> (Vec<Envelope>, usize) {
        let now = Instant::now();
        let now_ms = epoch_ms();
        let mut to_dlq = Vec::new();
        let mut freed = 0;

        for (_token, sequence) in inner.locks.drain_expired(now) {
            let Some(idx) = inner.position(sequence) else {
                continue;
            };
            if inner.messages[idx].delivery_count >= self.config.max_delivery_count {
                let mut envelope = inner.messages.remove(idx).unwrap();
                envelope.dead_letter_reason = Some(REASON_MAX_DELIVERY.to_string());
                envelope.dead_letter_description = Some(format!(
                    "lock expired after delivery {} of {}",
                    envelope.delivery_count, self.config.max_delivery_count
                ));
                to_dlq.push(envelope);
            } else {
                inner.messages[idx].state = MessageState::Available;
                freed += 1;
                trace!(
                    entity = %self.name,
                    seq = sequence,
                    "lock expired, message available again"
                );
            }
        }

        // TTL applies to available messages only; locked messages are
        // settled through their lock.
        let mut idx = 0;
        while idx < inner.messages.len() {
            let envelope = &inner.messages[idx];
            if matches!(envelope.state, MessageState::Available) && envelope.is_expired(now_ms) {
                let mut envelope = inner.messages.remove(idx).unwrap();
                if self.config.dead_lettering_on_expiration {
                    envelope.dead_letter_reason = Some(REASON_EXPIRED.to_string());
                    envelope.dead_letter_description =
                        Some("message expired before delivery".to_string());
                    to_dlq.push(envelope);
                } else {
                    trace!(
                        entity = %self.name,
                        seq = envelope.sequence_number,
                        "message expired, discarding"
                    );
                }
            } else {
                idx += 1;
            }
        }

        (to_dlq, freed)
    }

    async fn flush_dead_letters(&self, to_dlq: Vec<Envelope>) {
        for envelope in to_dlq {
            self.dlq.enqueue_envelope(envelope).await;
        }
    }
}

// ---------------------------------------------------------------------------
// DlqStore: dead-letter sub-queue (terminal, no nested DLQ)
// ---------------------------------------------------------------------------

/// A dead-letter sub-queue. Simpler than `MessageStore`: no TTL
/// processing, no auto-dead-lettering, no quota. Messages here are
/// terminal and leave only through an explicit dead-letter receive.
pub struct DlqStore {
    name: String,
    inner: Mutex<StoreInner>,
    notify: Notify,
    next_sequence: AtomicU64,
    lock_duration: Duration,
}

impl DlqStore {
    pub fn new(name: impl Into<String>, lock_duration: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(StoreInner::new()),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(1),
            lock_duration,
        }
    }

    /// Appends a dead-lettered envelope, assigning a fresh sequence number
    /// in this sub-queue. DLQ messages never expire.
    pub async fn enqueue_envelope(&self, mut envelope: Envelope) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        envelope.sequence_number = sequence;
        envelope.state = MessageState::Available;
        envelope.time_to_live = None;
        let mut inner = self.inner.lock().await;
        inner.messages.push_back(envelope);
        drop(inner);
        self.notify.notify_one();
        trace!(dlq = %self.name, seq = sequence, "dead-lettered message stored");
    }

    /// Receives from the dead-letter sub-queue, waiting up to `timeout`.
    pub async fn receive(&self, mode: ReceiveMode, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.try_receive(mode).await {
                return Some(envelope);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    /// Non-blocking receive attempt.
    pub async fn try_receive(&self, mode: ReceiveMode) -> Option<Envelope> {
        let mut inner = self.inner.lock().await;
        self.release_expired_locks(&mut inner);

        let idx = inner
            .messages
            .iter()
            .position(|e| matches!(e.state, MessageState::Available))?;

        match mode {
            ReceiveMode::ReceiveAndDelete => inner.messages.remove(idx),
            ReceiveMode::PeekLock => {
                let sequence = inner.messages[idx].sequence_number;
                let (token, locked_until) = inner.locks.grant(sequence, self.lock_duration);
                let envelope = &mut inner.messages[idx];
                envelope.state = MessageState::Locked {
                    token,
                    locked_until,
                };
                envelope.delivery_count += 1;
                Some(envelope.clone())
            }
        }
    }

    /// Completes a locked DLQ message, removing it permanently.
    pub async fn complete(&self, token: LockToken) -> Result<Settlement> {
        let mut inner = self.inner.lock().await;
        let sequence = inner
            .locks
            .redeem(token)
            .ok_or(BrokerError::LockLost(token))?;
        let idx = inner
            .position(sequence)
            .ok_or(BrokerError::LockLost(token))?;
        inner.messages.remove(idx);
        Ok(Settlement::Completed)
    }

    /// Renews a live lock on a DLQ message. Returns the new expiry.
    pub async fn renew_lock(&self, token: LockToken) -> Result<Instant> {
        let mut inner = self.inner.lock().await;
        let (sequence, expires_at) = inner
            .locks
            .renew(token, self.lock_duration)
            .ok_or(BrokerError::LockLost(token))?;
        if let Some(idx) = inner.position(sequence) {
            if let MessageState::Locked { locked_until, .. } = &mut inner.messages[idx].state {
                *locked_until = expires_at;
            }
        }
        Ok(expires_at)
    }

    /// Abandons a locked DLQ message. No delivery limit applies here
    /// since there is no nested DLQ.
    pub async fn abandon(&self, token: LockToken) -> Result<Settlement> {
        let mut inner = self.inner.lock().await;
        let sequence = inner
            .locks
            .redeem(token)
            .ok_or(BrokerError::LockLost(token))?;
        let idx = inner
            .position(sequence)
            .ok_or(BrokerError::LockLost(token))?;
        inner.messages[idx].state = MessageState::Available;
        drop(inner);
        self.notify.notify_one();
        Ok(Settlement::Abandoned)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.messages.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn release_expired_locks(&self, inner: &mut StoreInner) {
        let now = Instant::now();
        for (_token, sequence) in inner.locks.drain_expired(now) {
            if let Some(idx) = inner.position(sequence) {
                inner.messages[idx].state = MessageState::Available;
            }
        }
    }
}

/// Returns current time as milliseconds since UNIX epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
