//! In-memory topic/queue message broker engine.
//!
//! Implements the core a broker emulator sits on: FIFO queues, topics
//! with filter-based subscription routing, peek-lock delivery with
//! settlement (complete / abandon / dead-letter / renew), per-entity
//! dead-letter sub-queues, TTL handling, and duplicate detection over a
//! bounded time window.
//!
//! The crate ends at the operation boundary: wire protocols, HTTP admin
//! surfaces, and authentication are external collaborators. Callers drive
//! the [`Broker`] facade directly:
//!
//! ```
//! use std::time::Duration;
//! use embroker::{Broker, BrokerOptions, Message, QueueOptions, ReceiveMode};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> embroker::Result<()> {
//! let broker = Broker::new(BrokerOptions::default());
//! broker.create_queue("input-queue", QueueOptions::default()).await?;
//!
//! broker.send("input-queue", Message::new("hello")).await?;
//!
//! let received = broker
//!     .receive("input-queue", None, ReceiveMode::PeekLock, Duration::from_secs(1))
//!     .await?
//!     .expect("message is available");
//! broker.complete(received.lock.as_ref().unwrap()).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod dedup;
pub mod entities;
pub mod error;
pub mod filter;
pub mod lock;
pub mod message;
pub mod router;
pub mod store;

pub use broker::{
    Broker, BrokerOptions, LockHandle, ReceivedMessage, SendAck, DEFAULT_MAINTENANCE_INTERVAL,
};
pub use config::Topology;
pub use entities::{
    FilterDescription, NamespacePolicy, QueueOptions, RuleDescription, SubscriptionOptions,
    TopicOptions,
};
pub use error::{BrokerError, FanoutFailure, Result};
pub use filter::{CorrelationFilter, Filter, SqlAction, SqlFilter};
pub use lock::LockToken;
pub use message::{Message, MessageBuilder, PropertyValue};
pub use store::{ReceiveMode, SequenceNumber, Settlement};
