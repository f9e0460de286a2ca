//! Backend-agnostic queue contract.
//!
//! Two broker families sit behind [`QueueBackend`]:
//!
//! - **Stream** backends (Redis Streams, in-memory stream): an append-only
//!   log read through consumer groups. Unacknowledged entries stay in the
//!   group's pending list until acknowledged or reclaimed by a sweeper.
//! - **Broker** backends (AMQP, in-memory broker): classical queues where
//!   the broker itself requeues unacknowledged deliveries when a consumer's
//!   connection drops, and routes rejected messages through a retry queue
//!   and eventually a dead-letter queue.
//!
//! Workers only use `dequeue`/`acknowledge`/`reject`, so their logic is
//! identical across families; recovery mechanics stay inside the backend.

pub mod amqp;
pub mod memory;
pub mod redis_stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::SweepConfig;
use crate::error::QueueError;

pub use amqp::AmqpBrokerBackend;
pub use memory::{MemoryBroker, MemoryBrokerBackend, MemoryStream, MemoryStreamBackend};
pub use redis_stream::RedisStreamBackend;

/// Identifier assigned to a message by the backend.
pub type MessageId = String;

/// Backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Redis Streams with consumer groups.
    Stream,
    /// AMQP 0.9.1 broker (RabbitMQ).
    Broker,
    /// In-process stream simulation.
    MemoryStream,
    /// In-process broker simulation.
    MemoryBroker,
}

/// Recovery family a backend belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    /// Recovery through staleness-based reclamation.
    Stream,
    /// Recovery through native redelivery.
    Broker,
}

impl BackendKind {
    pub fn family(self) -> BackendFamily {
        match self {
            BackendKind::Stream | BackendKind::MemoryStream => BackendFamily::Stream,
            BackendKind::Broker | BackendKind::MemoryBroker => BackendFamily::Broker,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Stream => "stream",
            BackendKind::Broker => "broker",
            BackendKind::MemoryStream => "memory-stream",
            BackendKind::MemoryBroker => "memory-broker",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "redis" => Ok(BackendKind::Stream),
            "broker" | "amqp" | "rabbitmq" => Ok(BackendKind::Broker),
            "memory-stream" => Ok(BackendKind::MemoryStream),
            "memory-broker" => Ok(BackendKind::MemoryBroker),
            other => Err(QueueError::InvalidConfig(format!(
                "unknown backend '{}' (supported: stream, broker, memory-stream, memory-broker)",
                other
            ))),
        }
    }
}

/// Proof that a consumer currently owns an in-flight message.
///
/// Handles live only in the memory of the worker that received them and
/// are never serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryHandle {
    /// Stream entry claimed under a consumer group.
    Stream { entry_id: String, group: String },
    /// Broker delivery tag scoped to one channel.
    Broker { delivery_tag: u64, channel_id: u64 },
}

impl std::fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryHandle::Stream { entry_id, group } => write!(f, "{}@{}", entry_id, group),
            DeliveryHandle::Broker {
                delivery_tag,
                channel_id,
            } => write!(f, "tag {} on channel {}", delivery_tag, channel_id),
        }
    }
}

/// Message body plus the retry counter that travels with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    /// Number of times the message was routed back for another attempt.
    pub attempt: u32,
}

impl Envelope {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            attempt: 0,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// A message handed to one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub attempt: u32,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    pub handle: DeliveryHandle,
}

impl Delivery {
    /// Parses the payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Copies the body with the given attempt counter.
    pub fn envelope(&self, attempt: u32) -> Envelope {
        Envelope::new(self.payload.clone()).with_attempt(attempt)
    }
}

/// Where a rejected message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Routed through the retry channel for another attempt.
    Requeued { attempt: u32 },
    /// Retry budget exhausted or requeue declined; moved to the dead-letter channel.
    DeadLettered { attempt: u32 },
}

/// Queue operations shared by every backend.
///
/// All mutation of shared state goes through the broker's own atomic
/// primitives; implementations hold no cross-process locks.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Whether `reclaim_stale` is available.
    fn supports_reclaim(&self) -> bool {
        self.kind().family() == BackendFamily::Stream
    }

    /// Name of the dead-letter channel paired with `channel`.
    fn dead_letter_channel(&self, channel: &str) -> String;

    /// Creates the channel and consumer group if absent.
    ///
    /// Idempotent. Returns `ChannelAlreadyExists` only when the channel
    /// exists with an incompatible configuration; callers log and continue.
    async fn initialize(&self, channel: &str, group: &str) -> Result<(), QueueError>;

    /// Appends one message with a zero attempt counter.
    async fn enqueue(&self, channel: &str, payload: &[u8]) -> Result<MessageId, QueueError> {
        self.enqueue_envelope(channel, &Envelope::new(payload))
            .await
    }

    /// Appends one message carrying an explicit attempt counter.
    async fn enqueue_envelope(
        &self,
        channel: &str,
        envelope: &Envelope,
    ) -> Result<MessageId, QueueError>;

    /// Claims at most one message for `consumer_id`.
    ///
    /// Blocks up to `block_timeout`, then returns `Ok(None)`.
    async fn dequeue(
        &self,
        channel: &str,
        group: &str,
        consumer_id: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Marks a delivery as done.
    ///
    /// Returns `false` when the handle no longer owns the message
    /// (already acknowledged, reclaimed or expired); never an error.
    async fn acknowledge(
        &self,
        channel: &str,
        group: &str,
        handle: &DeliveryHandle,
    ) -> Result<bool, QueueError>;

    /// Negative acknowledgment. Broker family only.
    async fn reject(
        &self,
        _channel: &str,
        _handle: &DeliveryHandle,
        _requeue: bool,
    ) -> Result<RejectOutcome, QueueError> {
        Err(QueueError::Unsupported {
            backend: self.kind().as_str(),
            operation: "reject",
        })
    }

    /// Number of claimed but unacknowledged messages.
    async fn pending_count(&self, channel: &str, group: &str) -> Result<u64, QueueError>;

    /// Messages stored in the channel: log length for streams, ready count for brokers.
    async fn channel_depth(&self, channel: &str) -> Result<u64, QueueError>;

    /// Messages parked in the dead-letter channel for `channel`.
    async fn dead_letter_count(&self, channel: &str) -> Result<u64, QueueError> {
        self.channel_depth(&self.dead_letter_channel(channel)).await
    }

    /// Atomically reassigns entries idle for at least `staleness` to `new_consumer_id`.
    /// Stream family only.
    async fn reclaim_stale(
        &self,
        _channel: &str,
        _group: &str,
        _staleness: Duration,
        _new_consumer_id: &str,
        _max_entries: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        Err(QueueError::Unsupported {
            backend: self.kind().as_str(),
            operation: "reclaim_stale",
        })
    }

    /// Takes the lease that lets one worker populate the job.
    ///
    /// At most one caller holds a live lease per channel, and nobody gets
    /// one after [`mark_initialized`](Self::mark_initialized). A lease
    /// lapses after `lease` or when the holder's connection closes, so a
    /// claimant that dies before producing never blocks the job.
    async fn claim_initialization(
        &self,
        channel: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, QueueError>;

    /// Records that every chunk of the job was enqueued. Permanent.
    async fn mark_initialized(&self, channel: &str) -> Result<(), QueueError>;

    /// Whether [`mark_initialized`](Self::mark_initialized) ran for `channel`.
    async fn is_initialized(&self, channel: &str) -> Result<bool, QueueError>;
}

/// Opens a fresh backend connection for each worker.
///
/// In-memory variants hand out new handles onto one shared simulated
/// server, so every worker still owns its own "connection".
#[derive(Clone)]
pub enum Connector {
    Redis { url: String },
    Amqp {
        url: String,
        max_retries: u32,
        retry_delay: Duration,
    },
    MemoryStream(MemoryStream),
    MemoryBroker(MemoryBroker),
}

impl Connector {
    /// Builds a connector for the backend named in the configuration.
    ///
    /// In-memory backends get a fresh simulated server.
    pub fn from_config(config: &SweepConfig) -> Self {
        match config.backend {
            BackendKind::Stream => Connector::Redis {
                url: config.redis_url.clone(),
            },
            BackendKind::Broker => Connector::Amqp {
                url: config.amqp_url.clone(),
                max_retries: config.broker.max_retries,
                retry_delay: config.broker.retry_delay(),
            },
            BackendKind::MemoryStream => Connector::MemoryStream(MemoryStream::new()),
            BackendKind::MemoryBroker => Connector::MemoryBroker(MemoryBroker::new(
                config.broker.max_retries,
                config.broker.retry_delay(),
            )),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Connector::Redis { .. } => BackendKind::Stream,
            Connector::Amqp { .. } => BackendKind::Broker,
            Connector::MemoryStream(_) => BackendKind::MemoryStream,
            Connector::MemoryBroker(_) => BackendKind::MemoryBroker,
        }
    }

    /// Opens a connection owned by the caller.
    pub async fn connect(&self) -> Result<Arc<dyn QueueBackend>, QueueError> {
        match self {
            Connector::Redis { url } => Ok(Arc::new(RedisStreamBackend::connect(url).await?)),
            Connector::Amqp {
                url,
                max_retries,
                retry_delay,
            } => Ok(Arc::new(
                AmqpBrokerBackend::connect(url, *max_retries, *retry_delay).await?,
            )),
            Connector::MemoryStream(stream) => Ok(Arc::new(stream.connect())),
            Connector::MemoryBroker(broker) => Ok(Arc::new(broker.connect())),
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("kind", &self.kind())
            .finish()
    }
}
