//! AMQP 0.9.1 (RabbitMQ) backend using the `lapin` crate.
//!
//! # Topology
//!
//! For a channel named `tasks`:
//!
//! - `tasks`: main queue, dead-letters rejected messages to `tasks.dlq`
//! - `tasks.retry`: holding queue with `x-message-ttl = retry_delay`,
//!   dead-letters expired messages back to `tasks`
//! - `tasks.dlq`: terminal queue for poison messages
//! - `tasks.init-lock`: exclusive queue held by the worker populating the job
//! - `tasks.initialized`: durable marker declared once every chunk was enqueued
//!
//! The attempt counter travels in the `x-attempt-count` header. A rejected
//! message is republished with the incremented counter, or published to the
//! dead-letter queue, then the original delivery is acknowledged. Routing
//! never depends on the main queue's `x-dead-letter-*` arguments, which a
//! pre-existing declaration may lack.
//!
//! Unacknowledged deliveries return to the ready state as soon as the
//! connection that received them closes; no sweeper is involved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    BackendKind, Delivery, DeliveryHandle, Envelope, MessageId, QueueBackend, RejectOutcome,
};
use crate::error::QueueError;

/// Header carrying the number of retries a message has been through.
pub const ATTEMPT_HEADER: &str = "x-attempt-count";

/// Interval between `basic.get` polls while waiting for a message.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Session {
    generation: u64,
    connection: Connection,
    channel: Channel,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// A delivery this connection holds but has not settled.
struct InFlight {
    envelope: Envelope,
}

/// Queue backend on an AMQP broker.
///
/// Owns one connection. Delivery handles are tagged with the connection
/// generation, so handles issued before a reconnect report as expired.
pub struct AmqpBrokerBackend {
    url: String,
    max_retries: u32,
    retry_delay: Duration,
    session: RwLock<Session>,
    generations: AtomicU64,
    in_flight: Mutex<HashMap<u64, InFlight>>,
}

impl AmqpBrokerBackend {
    /// Connects to the broker and enables publisher confirms.
    pub async fn connect(
        url: &str,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Self, QueueError> {
        let session = open_session(url, 1).await?;
        info!(generation = 1, "Connected to AMQP broker");

        Ok(Self {
            url: url.to_string(),
            max_retries,
            retry_delay,
            session: RwLock::new(session),
            generations: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn retry_queue(channel: &str) -> String {
        format!("{}.retry", channel)
    }

    fn marker_queue(channel: &str) -> String {
        format!("{}.initialized", channel)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<u64, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the current channel, reconnecting if the connection dropped.
    async fn channel(&self) -> Result<(u64, Channel), QueueError> {
        {
            let session = self.session.read().await;
            if session.is_open() {
                return Ok((session.generation, session.channel.clone()));
            }
        }

        let mut session = self.session.write().await;
        if !session.is_open() {
            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(generation = generation, "AMQP connection lost, reconnecting");
            *session = open_session(&self.url, generation).await?;
            // Tags from the old channel are meaningless now.
            self.lock_in_flight().clear();
        }
        Ok((session.generation, session.channel.clone()))
    }

    /// Opens a short-lived channel for operations that may close it on error.
    async fn scratch_channel(&self) -> Result<Channel, QueueError> {
        self.channel().await?;
        let session = self.session.read().await;
        Ok(session.connection.create_channel().await?)
    }

    async fn declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), QueueError> {
        let scratch = self.scratch_channel().await?;
        let declared = scratch.queue_declare(name, options, arguments).await;
        match declared {
            Ok(_) => {
                let _ = scratch.close(200, "declared").await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(
        &self,
        channel: &Channel,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), QueueError> {
        let mut headers = FieldTable::default();
        headers.insert(ATTEMPT_HEADER.into(), AMQPValue::LongUInt(envelope.attempt));

        let confirmation = channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into())
                    .with_headers(headers),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(QueueError::Protocol(format!(
                "broker refused publish to '{}'",
                routing_key
            )));
        }
        Ok(())
    }

    /// Resolves a handle to its in-flight record if this connection still owns it.
    fn take_in_flight(&self, generation: u64, handle: &DeliveryHandle) -> Option<(u64, InFlight)> {
        let DeliveryHandle::Broker {
            delivery_tag,
            channel_id,
        } = handle
        else {
            return None;
        };
        if *channel_id != generation {
            return None;
        }
        self.lock_in_flight()
            .remove(delivery_tag)
            .map(|entry| (*delivery_tag, entry))
    }
}

async fn open_session(url: &str, generation: u64) -> Result<Session, QueueError> {
    let connection = Connection::connect(
        url,
        ConnectionProperties::default().with_connection_name("sweepq-worker".into()),
    )
    .await
    .map_err(|e| QueueError::BackendUnavailable(format!("AMQP connection failed: {}", e)))?;

    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;

    Ok(Session {
        generation,
        connection,
        channel,
    })
}

fn is_error_kind(err: &lapin::Error, kind: AMQPSoftError) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp_error) => {
            matches!(amqp_error.kind(), AMQPErrorKind::Soft(k) if *k == kind)
        }
        _ => false,
    }
}

/// Reads the attempt counter from message headers, defaulting to zero.
fn header_attempt(headers: Option<&FieldTable>) -> u32 {
    let Some(table) = headers else {
        return 0;
    };
    let value = table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == ATTEMPT_HEADER)
        .map(|(_, value)| value);

    match value {
        Some(AMQPValue::LongUInt(v)) => *v,
        Some(AMQPValue::ShortUInt(v)) => u32::from(*v),
        Some(AMQPValue::ShortShortUInt(v)) => u32::from(*v),
        Some(AMQPValue::LongInt(v)) => u32::try_from(*v).unwrap_or(0),
        Some(AMQPValue::LongLongInt(v)) => u32::try_from(*v).unwrap_or(0),
        _ => 0,
    }
}

fn dead_letter_arguments(exchange: &str, routing_key: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(exchange.into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(routing_key.into()),
    );
    args
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn passive() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: true,
        ..Default::default()
    }
}

#[async_trait]
impl QueueBackend for AmqpBrokerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Broker
    }

    fn dead_letter_channel(&self, channel: &str) -> String {
        format!("{}.dlq", channel)
    }

    async fn initialize(&self, channel: &str, _group: &str) -> Result<(), QueueError> {
        let dlq = self.dead_letter_channel(channel);
        let retry = Self::retry_queue(channel);

        let mut retry_args = dead_letter_arguments("", channel);
        retry_args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(self.retry_delay.as_millis().min(u32::MAX as u128) as u32),
        );

        let declarations = [
            (dlq.clone(), FieldTable::default()),
            (channel.to_string(), dead_letter_arguments("", &dlq)),
            (retry, retry_args),
        ];

        for (name, arguments) in declarations {
            match self.declare(&name, durable(), arguments).await {
                Ok(()) => debug!(queue = %name, "Declared queue"),
                Err(QueueError::ChannelAlreadyExists(reason)) => {
                    warn!(
                        queue = %name,
                        reason = %reason,
                        "Queue exists with different arguments, using it as-is"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn enqueue_envelope(
        &self,
        channel: &str,
        envelope: &Envelope,
    ) -> Result<MessageId, QueueError> {
        static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

        let (_, amqp_channel) = self.channel().await?;
        self.publish(&amqp_channel, channel, envelope).await?;
        Ok(MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed).to_string())
    }

    async fn dequeue(
        &self,
        channel: &str,
        _group: &str,
        _consumer_id: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + block_timeout;

        loop {
            let (generation, amqp_channel) = self.channel().await?;
            let message = amqp_channel
                .basic_get(channel, BasicGetOptions { no_ack: false })
                .await?;

            if let Some(message) = message {
                let delivery = message.delivery;
                let delivery_tag = delivery.delivery_tag;
                let redelivered = delivery.redelivered;
                let attempt = header_attempt(delivery.properties.headers().as_ref());
                let envelope = Envelope::new(delivery.data.clone()).with_attempt(attempt);

                self.lock_in_flight().insert(
                    delivery_tag,
                    InFlight {
                        envelope: envelope.clone(),
                    },
                );

                return Ok(Some(Delivery {
                    message_id: delivery_tag.to_string(),
                    payload: envelope.payload,
                    attempt,
                    redelivered,
                    handle: DeliveryHandle::Broker {
                        delivery_tag,
                        channel_id: generation,
                    },
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn acknowledge(
        &self,
        _channel: &str,
        _group: &str,
        handle: &DeliveryHandle,
    ) -> Result<bool, QueueError> {
        let (generation, amqp_channel) = self.channel().await?;
        let Some((tag, _)) = self.take_in_flight(generation, handle) else {
            return Ok(false);
        };

        match amqp_channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(QueueError::from)
        {
            Ok(()) => Ok(true),
            // The broker requeues everything on a dead channel.
            Err(e) if e.is_transient() => {
                warn!(delivery_tag = tag, error = %e, "Ack lost with the channel");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn reject(
        &self,
        channel: &str,
        handle: &DeliveryHandle,
        requeue: bool,
    ) -> Result<RejectOutcome, QueueError> {
        let (generation, amqp_channel) = self.channel().await?;
        let Some((tag, in_flight)) = self.take_in_flight(generation, handle) else {
            return Err(QueueError::DeliveryExpired(handle.to_string()));
        };
        let current = in_flight.envelope.attempt;

        let attempt = if requeue { current + 1 } else { current };
        let retried = in_flight.envelope.with_attempt(attempt);
        let (target, outcome) = if !requeue || attempt > self.max_retries {
            (
                self.dead_letter_channel(channel),
                RejectOutcome::DeadLettered { attempt },
            )
        } else if self.retry_delay.is_zero() {
            (channel.to_string(), RejectOutcome::Requeued { attempt })
        } else {
            (Self::retry_queue(channel), RejectOutcome::Requeued { attempt })
        };

        // Republish first: if the process dies in between, the original is
        // redelivered rather than lost.
        self.publish(&amqp_channel, &target, &retried).await?;
        amqp_channel.basic_ack(tag, BasicAckOptions::default()).await?;

        debug!(
            queue = %target,
            attempt = attempt,
            "Rejected delivery rerouted"
        );
        Ok(outcome)
    }

    async fn pending_count(&self, _channel: &str, _group: &str) -> Result<u64, QueueError> {
        // AMQP exposes no unacked count outside the management API.
        Ok(self.lock_in_flight().len() as u64)
    }

    async fn channel_depth(&self, channel: &str) -> Result<u64, QueueError> {
        let scratch = self.scratch_channel().await?;
        match scratch
            .queue_declare(channel, passive(), FieldTable::default())
            .await
        {
            Ok(queue) => {
                let _ = scratch.close(200, "inspected").await;
                Ok(u64::from(queue.message_count()))
            }
            Err(e) if is_error_kind(&e, AMQPSoftError::NOTFOUND) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// The exclusive lock queue lives as long as this connection; `lease`
    /// does not apply.
    async fn claim_initialization(
        &self,
        channel: &str,
        owner: &str,
        _lease: Duration,
    ) -> Result<bool, QueueError> {
        if self.is_initialized(channel).await? {
            return Ok(false);
        }

        // Exclusive queues belong to one connection; a second declare fails.
        let lock = format!("{}.init-lock", channel);
        let scratch = self.scratch_channel().await?;
        let exclusive = QueueDeclareOptions {
            exclusive: true,
            ..Default::default()
        };
        match scratch
            .queue_declare(&lock, exclusive, FieldTable::default())
            .await
        {
            Ok(_) => {
                let _ = scratch.close(200, "locked").await;
                info!(channel = %channel, owner = %owner, "Claimed job initialization");
                Ok(true)
            }
            Err(e) if is_error_kind(&e, AMQPSoftError::RESOURCELOCKED) => {
                debug!(channel = %channel, "Initialization lock held elsewhere");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_initialized(&self, channel: &str) -> Result<(), QueueError> {
        self.declare(&Self::marker_queue(channel), durable(), FieldTable::default())
            .await
    }

    async fn is_initialized(&self, channel: &str) -> Result<bool, QueueError> {
        let scratch = self.scratch_channel().await?;
        match scratch
            .queue_declare(&Self::marker_queue(channel), passive(), FieldTable::default())
            .await
        {
            Ok(_) => {
                let _ = scratch.close(200, "inspected").await;
                Ok(true)
            }
            Err(e) if is_error_kind(&e, AMQPSoftError::NOTFOUND) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
