//! Broker facade: the operation-level surface callers drive.
//!
//! Exposes the admin CRUD (queues, topics, subscriptions, rules) and the
//! data plane (send, receive, settle). Validates entity existence before
//! delegating and passes internal error kinds through unchanged.
//!
//! The facade also owns the background maintenance sweep that bounds how
//! long expired locks and TTL-expired messages can go unnoticed between
//! store operations.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::Topology;
use crate::dedup::DuplicateDetector;
use crate::entities::{
    EntityStore, NamespacePolicy, QueueOptions, RuleDescription, SendTarget, SubscriptionOptions,
    TopicOptions,
};
use crate::error::{BrokerError, Result};
use crate::lock::LockToken;
use crate::message::Message;
use crate::router::{self, DispatchReport};
use crate::store::{DlqStore, Envelope, MessageStore, ReceiveMode, SequenceNumber, Settlement};

/// Default interval for [`Broker::start_maintenance`]. Expired locks become
/// visible within roughly this bound even on otherwise idle entities.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);

/// Broker-wide options.
#[derive(Debug, Clone, Default)]
pub struct BrokerOptions {
    pub namespace_policy: NamespacePolicy,
}

/// Acknowledgement for a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendAck {
    /// The message was stored; for a topic, `copies` counts the matching
    /// subscriptions that received one.
    Enqueued { copies: usize },
    /// Duplicate message id within the detection window; nothing stored.
    /// Idempotent success, not an error.
    Duplicate,
}

#[derive(Clone)]
enum SettleTarget {
    Store(Arc<MessageStore>),
    Dlq(Arc<DlqStore>),
}

/// Opaque handle to a peek-locked message, used for settlement.
#[derive(Clone)]
pub struct LockHandle {
    entity_path: String,
    token: LockToken,
    target: SettleTarget,
}

impl LockHandle {
    pub fn token(&self) -> LockToken {
        self.token
    }

    /// The path of the entity (or its DLQ) the lock belongs to.
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("entity_path", &self.entity_path)
            .field("token", &self.token)
            .finish()
    }
}

/// A message as returned from a receive call.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    pub sequence_number: SequenceNumber,
    /// Milliseconds since UNIX epoch.
    pub enqueued_time_utc: u64,
    pub delivery_count: u32,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
    /// Present in peek-lock mode; settle through it.
    pub lock: Option<LockHandle>,
}

impl ReceivedMessage {
    fn from_envelope(envelope: Envelope, lock: Option<LockHandle>) -> Self {
        Self {
            message: envelope.message,
            sequence_number: envelope.sequence_number,
            enqueued_time_utc: envelope.enqueued_time_utc,
            delivery_count: envelope.delivery_count,
            dead_letter_reason: envelope.dead_letter_reason,
            dead_letter_description: envelope.dead_letter_description,
            lock,
        }
    }
}

/// The message broker engine.
///
/// Cheap to share behind an `Arc`; all operations take `&self`.
pub struct Broker {
    entities: Arc<EntityStore>,
    maintenance: StdMutex<Option<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            entities: Arc::new(EntityStore::new(options.namespace_policy)),
            maintenance: StdMutex::new(None),
        }
    }

    /// Creates a broker and provisions the entities a topology describes,
    /// through the same admin operations callers use.
    pub async fn from_topology(topology: &Topology, options: BrokerOptions) -> Result<Self> {
        let broker = Self::new(options);
        for queue in &topology.queues {
            broker.create_queue(&queue.name, queue.options()).await?;
        }
        for topic in &topology.topics {
            broker.create_topic(&topic.name, topic.options()).await?;
            for subscription in &topic.subscriptions {
                broker
                    .create_subscription(
                        &topic.name,
                        &subscription.name,
                        subscription.options(),
                        subscription.rule_descriptions(),
                    )
                    .await?;
            }
        }
        info!(
            queues = topology.queues.len(),
            topics = topology.topics.len(),
            "topology provisioned"
        );
        Ok(broker)
    }

    // ── Admin surface ────────────────────────────────────────────────

    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.entities.create_queue(name, options).await
    }

    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        self.entities.delete_queue(name).await
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.entities.queue_exists(name).await
    }

    pub async fn create_topic(&self, name: &str, options: TopicOptions) -> Result<()> {
        self.entities.create_topic(name, options).await
    }

    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        self.entities.delete_topic(name).await
    }

    pub async fn topic_exists(&self, name: &str) -> bool {
        self.entities.topic_exists(name).await
    }

    pub async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
        rules: Vec<RuleDescription>,
    ) -> Result<()> {
        self.entities
            .create_subscription(topic, name, options, rules)
            .await
    }

    pub async fn delete_subscription(&self, topic: &str, name: &str) -> Result<()> {
        self.entities.delete_subscription(topic, name).await
    }

    pub async fn subscription_exists(&self, topic: &str, name: &str) -> bool {
        self.entities.subscription_exists(topic, name).await
    }

    pub async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: RuleDescription,
    ) -> Result<()> {
        self.entities.create_rule(topic, subscription, rule).await
    }

    pub async fn delete_rule(&self, topic: &str, subscription: &str, rule: &str) -> Result<()> {
        self.entities.delete_rule(topic, subscription, rule).await
    }

    // ── Data plane ───────────────────────────────────────────────────

    /// Sends a message to a queue or topic.
    ///
    /// A duplicate message id within an enabled detection window is an
    /// idempotent success (`SendAck::Duplicate`). Topic dispatch that
    /// fails for some subscriptions reports `PartialFanout`; successful
    /// appends are not rolled back.
    pub async fn send(&self, entity: &str, message: Message) -> Result<SendAck> {
        match self.entities.send_target(entity).await? {
            SendTarget::Queue(queue) => {
                if is_duplicate(&queue.dedup, &message).await {
                    debug!(entity, "duplicate publish suppressed");
                    return Ok(SendAck::Duplicate);
                }
                queue.store.enqueue(message).await?;
                Ok(SendAck::Enqueued { copies: 1 })
            }
            SendTarget::Topic(topic) => {
                if is_duplicate(&topic.dedup, &message).await {
                    debug!(entity, "duplicate publish suppressed");
                    return Ok(SendAck::Duplicate);
                }
                let report = router::dispatch_to_topic(&topic, &message).await;
                self.ack_from_report(report)
            }
        }
    }

    fn ack_from_report(&self, report: DispatchReport) -> Result<SendAck> {
        if report.is_clean() {
            Ok(SendAck::Enqueued {
                copies: report.delivered.len(),
            })
        } else {
            Err(BrokerError::PartialFanout {
                delivered: report.delivered.into_iter().map(|(name, _)| name).collect(),
                failed: report.failed,
            })
        }
    }

    /// Receives from a queue (`subscription = None`) or from a topic
    /// subscription, waiting up to `timeout`. `Ok(None)` means the timeout
    /// elapsed with no message, a normal outcome.
    pub async fn receive(
        &self,
        entity: &str,
        subscription: Option<&str>,
        mode: ReceiveMode,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let (store, path) = self.resolve_store(entity, subscription).await?;
        let envelope = store.receive(mode, timeout).await;
        Ok(envelope.map(|envelope| {
            let lock = envelope.lock_token().map(|token| LockHandle {
                entity_path: path.clone(),
                token,
                target: SettleTarget::Store(store.clone()),
            });
            ReceivedMessage::from_envelope(envelope, lock)
        }))
    }

    /// Receives from an entity's dead-letter sub-queue. This is the only
    /// way dead-lettered messages leave the broker.
    pub async fn receive_dead_letter(
        &self,
        entity: &str,
        subscription: Option<&str>,
        mode: ReceiveMode,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        let (store, _) = self.resolve_store(entity, subscription).await?;
        let dlq = store.dlq().clone();
        let envelope = dlq.receive(mode, timeout).await;
        Ok(envelope.map(|envelope| {
            let lock = envelope.lock_token().map(|token| LockHandle {
                entity_path: dlq.name().to_string(),
                token,
                target: SettleTarget::Dlq(dlq.clone()),
            });
            ReceivedMessage::from_envelope(envelope, lock)
        }))
    }

    /// Completes a peek-locked message, removing it permanently.
    pub async fn complete(&self, handle: &LockHandle) -> Result<()> {
        match &handle.target {
            SettleTarget::Store(store) => store.complete(handle.token).await?,
            SettleTarget::Dlq(dlq) => dlq.complete(handle.token).await?,
        };
        Ok(())
    }

    /// Abandons a peek-locked message. Returns `Settlement::DeadLettered`
    /// when the abandon pushed the message over its delivery limit.
    pub async fn abandon(&self, handle: &LockHandle) -> Result<Settlement> {
        match &handle.target {
            SettleTarget::Store(store) => store.abandon(handle.token).await,
            SettleTarget::Dlq(dlq) => dlq.abandon(handle.token).await,
        }
    }

    /// Explicitly dead-letters a peek-locked message.
    pub async fn dead_letter(
        &self,
        handle: &LockHandle,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        match &handle.target {
            SettleTarget::Store(store) => {
                store.dead_letter(handle.token, reason, description).await?;
                Ok(())
            }
            // Dead-lettered messages are terminal; there is no nested DLQ.
            SettleTarget::Dlq(_) => Err(BrokerError::UnsupportedConfiguration(
                "cannot dead-letter from a dead-letter sub-queue".to_string(),
            )),
        }
    }

    /// Renews a live lock for another lock duration.
    pub async fn renew_lock(&self, handle: &LockHandle) -> Result<Instant> {
        match &handle.target {
            SettleTarget::Store(store) => store.renew_lock(handle.token).await,
            SettleTarget::Dlq(dlq) => dlq.renew_lock(handle.token).await,
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Starts the periodic sweep: expired locks are released (or
    /// dead-lettered past the delivery limit), TTL-expired messages are
    /// removed, and duplicate-detection windows are evicted. Expiry
    /// latency is bounded by `interval`; store operations additionally
    /// apply the same processing on entry, so correctness does not depend
    /// on this task running.
    ///
    /// Calling again replaces the running task. The task stops when the
    /// broker is dropped.
    pub fn start_maintenance(&self, interval: Duration) {
        let entities = self.entities.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for store in entities.stores().await {
                    store.sweep().await;
                }
                for detector in entities.detectors().await {
                    detector.sweep().await;
                }
            }
        });
        let mut guard = self.maintenance.lock().unwrap();
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    /// Stops the maintenance task, if running.
    pub fn stop_maintenance(&self) {
        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn resolve_store(
        &self,
        entity: &str,
        subscription: Option<&str>,
    ) -> Result<(Arc<MessageStore>, String)> {
        match subscription {
            Some(subscription) => {
                let subscription = self.entities.subscription(entity, subscription).await?;
                Ok((subscription.store.clone(), subscription.path()))
            }
            None => match self.entities.send_target(entity).await? {
                SendTarget::Queue(queue) => Ok((queue.store.clone(), queue.name.clone())),
                SendTarget::Topic(_) => Err(BrokerError::InvalidConfiguration(format!(
                    "receiving from topic '{entity}' requires a subscription"
                ))),
            },
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

async fn is_duplicate(dedup: &Option<Arc<DuplicateDetector>>, message: &Message) -> bool {
    match (dedup, &message.message_id) {
        (Some(detector), Some(id)) => detector.observe(id).await,
        // Detection disabled, or no message id to key on.
        _ => false,
    }
}
