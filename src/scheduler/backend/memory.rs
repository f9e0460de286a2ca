//! In-process simulations of both broker families.
//!
//! These share the exact delivery semantics of the networked backends and
//! are used for tests, local simulation and demos:
//!
//! - [`MemoryStream`] models a log with consumer groups, a pending entries
//!   list per group, and atomic stale-entry claiming.
//! - [`MemoryBroker`] models classical queues with per-connection delivery
//!   tags, requeue of unacknowledged deliveries when a connection handle is
//!   dropped, a delayed retry queue, and a dead-letter queue.
//!
//! Each `connect()` returns a handle that plays the role of one worker's
//! broker connection.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{
    BackendKind, Delivery, DeliveryHandle, Envelope, MessageId, QueueBackend, RejectOutcome,
};
use crate::error::QueueError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Waits on `notify` until `try_take` yields a value or `deadline` passes.
///
/// `wake_hint` may shorten a wait, e.g. when a delayed message becomes due.
async fn wait_for<T>(
    notify: &Notify,
    block_timeout: Duration,
    mut try_take: impl FnMut() -> Result<(Option<T>, Option<Instant>), QueueError>,
) -> Result<Option<T>, QueueError> {
    let deadline = Instant::now() + block_timeout;
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (taken, wake_hint) = try_take()?;
        if taken.is_some() {
            return Ok(taken);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let wake_at = wake_hint.map_or(deadline, |hint| hint.min(deadline));
        let _ = tokio::time::timeout_at(wake_at, notified).await;
    }
}

// ============================================================================
// Stream simulation
// ============================================================================

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    claimed_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: BTreeMap<u64, Envelope>,
    next_seq: u64,
    groups: HashMap<String, ConsumerGroup>,
}

impl StreamLog {
    fn append(&mut self, envelope: Envelope) -> u64 {
        self.next_seq += 1;
        self.entries.insert(self.next_seq, envelope);
        self.next_seq
    }
}

#[derive(Debug)]
struct InitLease {
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct StreamState {
    streams: HashMap<String, StreamLog>,
    init_claims: HashMap<String, InitLease>,
    initialized: HashSet<String>,
}

#[derive(Debug, Default)]
struct StreamInner {
    state: Mutex<StreamState>,
    notify: Notify,
}

fn entry_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_entry_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

/// Shared in-memory log store. Cloning yields another view of the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    inner: Arc<StreamInner>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection handle onto the store.
    pub fn connect(&self) -> MemoryStreamBackend {
        MemoryStreamBackend {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Identifiers of pending entries owned by `consumer`, for inspection.
    pub fn pending_for(&self, channel: &str, group: &str, consumer: &str) -> Vec<String> {
        let state = lock(&self.inner.state);
        state
            .streams
            .get(channel)
            .and_then(|log| log.groups.get(group))
            .map(|g| {
                g.pending
                    .iter()
                    .filter(|(_, p)| p.consumer == consumer)
                    .map(|(seq, _)| entry_id(*seq))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One connection onto a [`MemoryStream`].
#[derive(Debug, Clone)]
pub struct MemoryStreamBackend {
    inner: Arc<StreamInner>,
}

impl MemoryStreamBackend {
    fn read_next(
        &self,
        channel: &str,
        group: &str,
        consumer_id: &str,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut state = lock(&self.inner.state);
        let log = state.streams.get_mut(channel).ok_or_else(|| {
            QueueError::Protocol(format!("NOGROUP no such key '{}'", channel))
        })?;
        let StreamLog {
            entries, groups, ..
        } = log;
        let consumer_group = groups.get_mut(group).ok_or_else(|| {
            QueueError::Protocol(format!("NOGROUP no group '{}' on '{}'", group, channel))
        })?;

        let next = entries
            .range(consumer_group.last_delivered + 1..)
            .next()
            .map(|(seq, envelope)| (*seq, envelope.clone()));

        let Some((seq, envelope)) = next else {
            return Ok(None);
        };

        consumer_group.last_delivered = seq;
        consumer_group.pending.insert(
            seq,
            PendingEntry {
                consumer: consumer_id.to_string(),
                claimed_at: Instant::now(),
                delivery_count: 1,
            },
        );

        Ok(Some(Delivery {
            message_id: entry_id(seq),
            payload: envelope.payload,
            attempt: envelope.attempt,
            redelivered: false,
            handle: DeliveryHandle::Stream {
                entry_id: entry_id(seq),
                group: group.to_string(),
            },
        }))
    }
}

#[async_trait]
impl QueueBackend for MemoryStreamBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MemoryStream
    }

    fn dead_letter_channel(&self, channel: &str) -> String {
        format!("{}:dead", channel)
    }

    async fn initialize(&self, channel: &str, group: &str) -> Result<(), QueueError> {
        let mut state = lock(&self.inner.state);
        let log = state.streams.entry(channel.to_string()).or_default();
        if log.groups.contains_key(group) {
            debug!(channel = %channel, group = %group, "Consumer group already exists");
        } else {
            log.groups.insert(group.to_string(), ConsumerGroup::default());
        }
        Ok(())
    }

    async fn enqueue_envelope(
        &self,
        channel: &str,
        envelope: &Envelope,
    ) -> Result<MessageId, QueueError> {
        let seq = {
            let mut state = lock(&self.inner.state);
            state
                .streams
                .entry(channel.to_string())
                .or_default()
                .append(envelope.clone())
        };
        self.inner.notify.notify_waiters();
        Ok(entry_id(seq))
    }

    async fn dequeue(
        &self,
        channel: &str,
        group: &str,
        consumer_id: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        wait_for(&self.inner.notify, block_timeout, || {
            Ok((self.read_next(channel, group, consumer_id)?, None))
        })
        .await
    }

    async fn acknowledge(
        &self,
        channel: &str,
        group: &str,
        handle: &DeliveryHandle,
    ) -> Result<bool, QueueError> {
        let DeliveryHandle::Stream {
            entry_id,
            group: handle_group,
        } = handle
        else {
            return Err(QueueError::Protocol(format!(
                "stream backend cannot acknowledge {}",
                handle
            )));
        };
        if handle_group != group {
            return Ok(false);
        }
        let Some(seq) = parse_entry_id(entry_id) else {
            return Ok(false);
        };

        let mut state = lock(&self.inner.state);
        let removed = state
            .streams
            .get_mut(channel)
            .and_then(|log| log.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&seq))
            .is_some();
        Ok(removed)
    }

    async fn pending_count(&self, channel: &str, group: &str) -> Result<u64, QueueError> {
        let state = lock(&self.inner.state);
        Ok(state
            .streams
            .get(channel)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.pending.len() as u64))
    }

    async fn channel_depth(&self, channel: &str) -> Result<u64, QueueError> {
        let state = lock(&self.inner.state);
        Ok(state
            .streams
            .get(channel)
            .map_or(0, |log| log.entries.len() as u64))
    }

    async fn reclaim_stale(
        &self,
        channel: &str,
        group: &str,
        staleness: Duration,
        new_consumer_id: &str,
        max_entries: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut state = lock(&self.inner.state);
        let Some(log) = state.streams.get_mut(channel) else {
            return Ok(Vec::new());
        };
        let StreamLog {
            entries, groups, ..
        } = log;
        let Some(consumer_group) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut reclaimed = Vec::new();
        for (seq, pending) in consumer_group.pending.iter_mut() {
            if reclaimed.len() >= max_entries {
                break;
            }
            if now.duration_since(pending.claimed_at) < staleness {
                continue;
            }
            let Some(envelope) = entries.get(seq) else {
                continue;
            };

            debug!(
                entry_id = %entry_id(*seq),
                from = %pending.consumer,
                to = %new_consumer_id,
                deliveries = pending.delivery_count + 1,
                "Reclaiming stale entry"
            );
            pending.consumer = new_consumer_id.to_string();
            pending.claimed_at = now;
            pending.delivery_count += 1;

            reclaimed.push(Delivery {
                message_id: entry_id(*seq),
                payload: envelope.payload.clone(),
                attempt: envelope.attempt,
                redelivered: true,
                handle: DeliveryHandle::Stream {
                    entry_id: entry_id(*seq),
                    group: group.to_string(),
                },
            });
        }
        Ok(reclaimed)
    }

    async fn claim_initialization(
        &self,
        channel: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let mut state = lock(&self.inner.state);
        if state.initialized.contains(channel) {
            return Ok(false);
        }
        let now = Instant::now();
        if let Some(held) = state.init_claims.get(channel) {
            if held.expires_at > now {
                return Ok(false);
            }
            debug!(channel = %channel, previous = %held.owner, "Initialization lease expired");
        }
        state.init_claims.insert(
            channel.to_string(),
            InitLease {
                owner: owner.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn mark_initialized(&self, channel: &str) -> Result<(), QueueError> {
        let mut state = lock(&self.inner.state);
        state.initialized.insert(channel.to_string());
        state.init_claims.remove(channel);
        Ok(())
    }

    async fn is_initialized(&self, channel: &str) -> Result<bool, QueueError> {
        Ok(lock(&self.inner.state).initialized.contains(channel))
    }
}

// ============================================================================
// Broker simulation
// ============================================================================

#[derive(Debug, Clone)]
struct BrokerMessage {
    envelope: Envelope,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    channel: String,
    connection_id: u64,
    message: BrokerMessage,
}

#[derive(Debug)]
struct DelayedMessage {
    ready_at: Instant,
    target: String,
    message: BrokerMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<BrokerMessage>>,
    unacked: HashMap<u64, Unacked>,
    delayed: Vec<DelayedMessage>,
    next_tag: u64,
    /// Initialization locks by holding connection, like AMQP exclusive queues.
    init_claims: HashMap<String, u64>,
    initialized: HashSet<String>,
}

impl BrokerState {
    fn push_back(&mut self, channel: &str, message: BrokerMessage) {
        self.queues
            .entry(channel.to_string())
            .or_default()
            .push_back(message);
    }

    /// Moves due retry messages back to their target queues.
    fn promote_delayed(&mut self, now: Instant) -> Option<Instant> {
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].ready_at <= now {
                due.push(self.delayed.remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|d| d.ready_at);
        for delayed in due {
            self.push_back(&delayed.target, delayed.message);
        }
        self.delayed.iter().map(|d| d.ready_at).min()
    }
}

#[derive(Debug)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_connection: AtomicU64,
    max_retries: u32,
    retry_delay: Duration,
}

/// Shared in-memory broker. Cloning yields another view of the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Creates a broker whose retry policy allows `max_retries` redeliveries.
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                next_connection: AtomicU64::new(1),
                max_retries,
                retry_delay,
            }),
        }
    }

    /// Opens a new connection. Dropping it requeues its unacknowledged deliveries.
    pub fn connect(&self) -> MemoryBrokerBackend {
        MemoryBrokerBackend {
            inner: Arc::clone(&self.inner),
            connection_id: self.inner.next_connection.fetch_add(1, Ordering::SeqCst),
        }
    }
}

/// One connection onto a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryBrokerBackend {
    inner: Arc<BrokerInner>,
    connection_id: u64,
}

impl MemoryBrokerBackend {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn retry_channel(channel: &str) -> String {
        format!("{}.retry", channel)
    }

    fn take_next(&self, channel: &str) -> (Option<Delivery>, Option<Instant>) {
        let mut state = lock(&self.inner.state);
        let next_due = state.promote_delayed(Instant::now());

        let Some(message) = state.queues.get_mut(channel).and_then(|q| q.pop_front()) else {
            return (None, next_due);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            message_id: tag.to_string(),
            payload: message.envelope.payload.clone(),
            attempt: message.envelope.attempt,
            redelivered: message.redelivered,
            handle: DeliveryHandle::Broker {
                delivery_tag: tag,
                channel_id: self.connection_id,
            },
        };
        state.unacked.insert(
            tag,
            Unacked {
                channel: channel.to_string(),
                connection_id: self.connection_id,
                message,
            },
        );
        (Some(delivery), next_due)
    }

    fn take_owned(&self, state: &mut BrokerState, handle: &DeliveryHandle) -> Option<Unacked> {
        let DeliveryHandle::Broker {
            delivery_tag,
            channel_id,
        } = handle
        else {
            return None;
        };
        if *channel_id != self.connection_id {
            return None;
        }
        match state.unacked.get(delivery_tag) {
            Some(entry) if entry.connection_id == self.connection_id => {
                state.unacked.remove(delivery_tag)
            }
            _ => None,
        }
    }
}

impl Drop for MemoryBrokerBackend {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        state
            .init_claims
            .retain(|_, holder| *holder != self.connection_id);

        let mut orphaned: Vec<(u64, Unacked)> = Vec::new();
        state.unacked.retain(|tag, entry| {
            if entry.connection_id == self.connection_id {
                orphaned.push((
                    *tag,
                    Unacked {
                        channel: entry.channel.clone(),
                        connection_id: entry.connection_id,
                        message: entry.message.clone(),
                    },
                ));
                false
            } else {
                true
            }
        });
        if orphaned.is_empty() {
            return;
        }

        // Highest tag first so the oldest delivery ends up at the head.
        orphaned.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, entry) in orphaned {
            let mut message = entry.message;
            message.redelivered = true;
            state
                .queues
                .entry(entry.channel)
                .or_default()
                .push_front(message);
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

#[async_trait]
impl QueueBackend for MemoryBrokerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MemoryBroker
    }

    fn dead_letter_channel(&self, channel: &str) -> String {
        format!("{}.dlq", channel)
    }

    async fn initialize(&self, channel: &str, _group: &str) -> Result<(), QueueError> {
        let mut state = lock(&self.inner.state);
        for name in [
            channel.to_string(),
            Self::retry_channel(channel),
            self.dead_letter_channel(channel),
        ] {
            state.queues.entry(name).or_default();
        }
        Ok(())
    }

    async fn enqueue_envelope(
        &self,
        channel: &str,
        envelope: &Envelope,
    ) -> Result<MessageId, QueueError> {
        static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

        {
            let mut state = lock(&self.inner.state);
            state.push_back(
                channel,
                BrokerMessage {
                    envelope: envelope.clone(),
                    redelivered: false,
                },
            );
        }
        self.inner.notify.notify_waiters();
        Ok(MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed).to_string())
    }

    async fn dequeue(
        &self,
        channel: &str,
        _group: &str,
        _consumer_id: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        wait_for(&self.inner.notify, block_timeout, || Ok(self.take_next(channel))).await
    }

    async fn acknowledge(
        &self,
        _channel: &str,
        _group: &str,
        handle: &DeliveryHandle,
    ) -> Result<bool, QueueError> {
        let mut state = lock(&self.inner.state);
        Ok(self.take_owned(&mut state, handle).is_some())
    }

    async fn reject(
        &self,
        channel: &str,
        handle: &DeliveryHandle,
        requeue: bool,
    ) -> Result<RejectOutcome, QueueError> {
        let outcome = {
            let mut state = lock(&self.inner.state);
            let Some(entry) = self.take_owned(&mut state, handle) else {
                return Err(QueueError::DeliveryExpired(handle.to_string()));
            };

            let mut message = entry.message;
            message.redelivered = false;
            let current = message.envelope.attempt;

            if !requeue {
                state.push_back(&self.dead_letter_channel(channel), message);
                RejectOutcome::DeadLettered { attempt: current }
            } else {
                let attempt = current + 1;
                message.envelope.attempt = attempt;
                if attempt > self.inner.max_retries {
                    state.push_back(&self.dead_letter_channel(channel), message);
                    RejectOutcome::DeadLettered { attempt }
                } else if self.inner.retry_delay.is_zero() {
                    state.push_back(channel, message);
                    RejectOutcome::Requeued { attempt }
                } else {
                    state.delayed.push(DelayedMessage {
                        ready_at: Instant::now() + self.inner.retry_delay,
                        target: channel.to_string(),
                        message,
                    });
                    RejectOutcome::Requeued { attempt }
                }
            }
        };
        self.inner.notify.notify_waiters();
        Ok(outcome)
    }

    async fn pending_count(&self, channel: &str, _group: &str) -> Result<u64, QueueError> {
        let state = lock(&self.inner.state);
        Ok(state
            .unacked
            .values()
            .filter(|entry| entry.channel == channel)
            .count() as u64)
    }

    async fn channel_depth(&self, channel: &str) -> Result<u64, QueueError> {
        let state = lock(&self.inner.state);
        let ready = state.queues.get(channel).map_or(0, |q| q.len());
        let parked = state
            .delayed
            .iter()
            .filter(|d| Self::retry_channel(&d.target) == channel)
            .count();
        Ok((ready + parked) as u64)
    }

    /// The lock lives as long as this connection; `lease` does not apply.
    async fn claim_initialization(
        &self,
        channel: &str,
        _owner: &str,
        _lease: Duration,
    ) -> Result<bool, QueueError> {
        let mut state = lock(&self.inner.state);
        if state.initialized.contains(channel) {
            return Ok(false);
        }
        match state.init_claims.get(channel) {
            Some(holder) => Ok(*holder == self.connection_id),
            None => {
                state
                    .init_claims
                    .insert(channel.to_string(), self.connection_id);
                Ok(true)
            }
        }
    }

    async fn mark_initialized(&self, channel: &str) -> Result<(), QueueError> {
        lock(&self.inner.state)
            .initialized
            .insert(channel.to_string());
        Ok(())
    }

    async fn is_initialized(&self, channel: &str) -> Result<bool, QueueError> {
        Ok(lock(&self.inner.state).initialized.contains(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_stream_fifo_and_ack() {
        let stream = MemoryStream::new();
        let backend = stream.connect();
        backend.initialize("tasks", "workers").await.expect("init");

        backend.enqueue("tasks", b"a").await.expect("enqueue");
        backend.enqueue("tasks", b"b").await.expect("enqueue");

        let first = backend
            .dequeue("tasks", "workers", "c1", SHORT)
            .await
            .expect("dequeue")
            .expect("message");
        let second = backend
            .dequeue("tasks", "workers", "c2", SHORT)
            .await
            .expect("dequeue")
            .expect("message");
        assert_eq!(first.payload, b"a");
        assert_eq!(second.payload, b"b");
        assert_eq!(backend.pending_count("tasks", "workers").await.expect("pending"), 2);

        assert!(backend
            .acknowledge("tasks", "workers", &first.handle)
            .await
            .expect("ack"));
        assert!(!backend
            .acknowledge("tasks", "workers", &first.handle)
            .await
            .expect("second ack is a no-op"));
        assert_eq!(backend.pending_count("tasks", "workers").await.expect("pending"), 1);
        assert_eq!(backend.channel_depth("tasks").await.expect("depth"), 2);
    }

    #[tokio::test]
    async fn test_stream_dequeue_times_out_empty() {
        let backend = MemoryStream::new().connect();
        backend.initialize("tasks", "workers").await.expect("init");

        let started = std::time::Instant::now();
        let result = backend
            .dequeue("tasks", "workers", "c1", SHORT)
            .await
            .expect("dequeue");
        assert!(result.is_none());
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn test_stream_dequeue_wakes_on_enqueue() {
        let stream = MemoryStream::new();
        let consumer = stream.connect();
        let producer = stream.connect();
        consumer.initialize("tasks", "workers").await.expect("init");

        let waiter = tokio::spawn(async move {
            consumer
                .dequeue("tasks", "workers", "c1", Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.enqueue("tasks", b"late").await.expect("enqueue");

        let delivery = waiter
            .await
            .expect("join")
            .expect("dequeue")
            .expect("message");
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_stream_missing_group_is_error() {
        let backend = MemoryStream::new().connect();
        let result = backend.dequeue("tasks", "workers", "c1", SHORT).await;
        assert!(matches!(result, Err(QueueError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_stream_reclaim_is_exclusive() {
        let stream = MemoryStream::new();
        let backend = stream.connect();
        backend.initialize("tasks", "workers").await.expect("init");
        backend.enqueue("tasks", b"x").await.expect("enqueue");

        let original = backend
            .dequeue("tasks", "workers", "dead", SHORT)
            .await
            .expect("dequeue")
            .expect("message");

        let first = backend
            .reclaim_stale("tasks", "workers", Duration::ZERO, "sweeper-a", 10)
            .await
            .expect("reclaim");
        assert_eq!(first.len(), 1);
        assert!(first[0].redelivered);
        assert_eq!(stream.pending_for("tasks", "workers", "sweeper-a").len(), 1);

        let second = backend
            .reclaim_stale("tasks", "workers", Duration::from_secs(60), "sweeper-b", 10)
            .await
            .expect("reclaim");
        assert!(second.is_empty(), "freshly claimed entry must not be stale");

        // The old handle still names the entry; acking through it is harmless.
        assert!(backend
            .acknowledge("tasks", "workers", &original.handle)
            .await
            .expect("ack"));
        assert!(!backend
            .acknowledge("tasks", "workers", &first[0].handle)
            .await
            .expect("late ack is a no-op"));
    }

    #[tokio::test]
    async fn test_stream_claim_initialization_once() {
        let stream = MemoryStream::new();
        let a = stream.connect();
        let b = stream.connect();

        let lease = Duration::from_secs(60);

        assert!(a.claim_initialization("tasks", "a", lease).await.expect("claim"));
        assert!(!b.claim_initialization("tasks", "b", lease).await.expect("claim"));
        assert!(b.claim_initialization("other", "b", lease).await.expect("claim"));
    }

    #[tokio::test]
    async fn test_stream_init_lease_expires() {
        let stream = MemoryStream::new();
        let a = stream.connect();
        let b = stream.connect();

        assert!(a.claim_initialization("tasks", "a", SHORT).await.expect("claim"));
        assert!(!b.claim_initialization("tasks", "b", SHORT).await.expect("claim"));
        drop(a);

        tokio::time::sleep(SHORT * 2).await;
        assert!(b.claim_initialization("tasks", "b", SHORT).await.expect("claim after expiry"));
    }

    #[tokio::test]
    async fn test_stream_marked_initialized_refuses_claims() {
        let stream = MemoryStream::new();
        let a = stream.connect();
        let b = stream.connect();

        assert!(!a.is_initialized("tasks").await.expect("query"));
        assert!(a.claim_initialization("tasks", "a", SHORT).await.expect("claim"));
        a.mark_initialized("tasks").await.expect("mark");

        tokio::time::sleep(SHORT * 2).await;
        assert!(b.is_initialized("tasks").await.expect("query"));
        assert!(!b.claim_initialization("tasks", "b", SHORT).await.expect("claim"));
    }

    #[tokio::test]
    async fn test_broker_init_lock_released_on_connection_drop() {
        let broker = MemoryBroker::new(3, Duration::ZERO);
        let dying = broker.connect();
        let survivor = broker.connect();
        let lease = Duration::from_secs(60);

        assert!(dying.claim_initialization("tasks", "a", lease).await.expect("claim"));
        assert!(!survivor.claim_initialization("tasks", "b", lease).await.expect("claim"));
        drop(dying);

        assert!(survivor.claim_initialization("tasks", "b", lease).await.expect("claim"));
        survivor.mark_initialized("tasks").await.expect("mark");
        let late = broker.connect();
        assert!(!late.claim_initialization("tasks", "c", lease).await.expect("claim"));
        assert!(late.is_initialized("tasks").await.expect("query"));
    }

    #[tokio::test]
    async fn test_stream_reject_unsupported() {
        let backend = MemoryStream::new().connect();
        let handle = DeliveryHandle::Stream {
            entry_id: "1-0".into(),
            group: "g".into(),
        };
        let result = backend.reject("tasks", &handle, true).await;
        assert!(matches!(result, Err(QueueError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_broker_requeues_on_connection_drop() {
        let broker = MemoryBroker::new(3, Duration::ZERO);
        let dying = broker.connect();
        let survivor = broker.connect();
        survivor.initialize("tasks", "").await.expect("init");
        survivor.enqueue("tasks", b"one").await.expect("enqueue");
        survivor.enqueue("tasks", b"two").await.expect("enqueue");

        let claimed = dying
            .dequeue("tasks", "", "w1", SHORT)
            .await
            .expect("dequeue")
            .expect("message");
        assert_eq!(claimed.payload, b"one");
        assert_eq!(survivor.pending_count("tasks", "").await.expect("pending"), 1);

        drop(dying);

        assert_eq!(survivor.pending_count("tasks", "").await.expect("pending"), 0);
        let redelivered = survivor
            .dequeue("tasks", "", "w2", SHORT)
            .await
            .expect("dequeue")
            .expect("message");
        assert_eq!(redelivered.payload, b"one");
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_broker_ack_from_other_connection_is_noop() {
        let broker = MemoryBroker::new(3, Duration::ZERO);
        let a = broker.connect();
        let b = broker.connect();
        a.enqueue("tasks", b"m").await.expect("enqueue");

        let delivery = a
            .dequeue("tasks", "", "w", SHORT)
            .await
            .expect("dequeue")
            .expect("message");
        assert!(!b.acknowledge("tasks", "", &delivery.handle).await.expect("ack"));
        assert!(a.acknowledge("tasks", "", &delivery.handle).await.expect("ack"));
        assert!(!a.acknowledge("tasks", "", &delivery.handle).await.expect("ack"));
    }

    #[tokio::test]
    async fn test_broker_retry_then_dead_letter() {
        let broker = MemoryBroker::new(2, Duration::ZERO);
        let backend = broker.connect();
        backend.initialize("tasks", "").await.expect("init");
        backend.enqueue("tasks", b"poison").await.expect("enqueue");

        let mut outcomes = Vec::new();
        while let Some(delivery) = backend
            .dequeue("tasks", "", "w", SHORT)
            .await
            .expect("dequeue")
        {
            outcomes.push(
                backend
                    .reject("tasks", &delivery.handle, true)
                    .await
                    .expect("reject"),
            );
        }

        assert_eq!(
            outcomes,
            vec![
                RejectOutcome::Requeued { attempt: 1 },
                RejectOutcome::Requeued { attempt: 2 },
                RejectOutcome::DeadLettered { attempt: 3 },
            ]
        );
        assert_eq!(backend.dead_letter_count("tasks").await.expect("dlq"), 1);
        assert_eq!(backend.channel_depth("tasks").await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn test_broker_reject_without_requeue_dead_letters() {
        let broker = MemoryBroker::new(5, Duration::ZERO);
        let backend = broker.connect();
        backend.enqueue("tasks", b"bad").await.expect("enqueue");

        let delivery = backend
            .dequeue("tasks", "", "w", SHORT)
            .await
            .expect("dequeue")
            .expect("message");
        let outcome = backend
            .reject("tasks", &delivery.handle, false)
            .await
            .expect("reject");

        assert_eq!(outcome, RejectOutcome::DeadLettered { attempt: 0 });
        assert_eq!(backend.dead_letter_count("tasks").await.expect("dlq"), 1);
    }

    #[tokio::test]
    async fn test_broker_retry_delay_parks_message() {
        let broker = MemoryBroker::new(3, Duration::from_millis(40));
        let backend = broker.connect();
        backend.enqueue("tasks", b"later").await.expect("enqueue");

        let delivery = backend
            .dequeue("tasks", "", "w", SHORT)
            .await
            .expect("dequeue")
            .expect("message");
        backend
            .reject("tasks", &delivery.handle, true)
            .await
            .expect("reject");

        assert_eq!(backend.channel_depth("tasks.retry").await.expect("depth"), 1);
        assert!(backend
            .dequeue("tasks", "", "w", Duration::from_millis(5))
            .await
            .expect("dequeue")
            .is_none());

        let retried = backend
            .dequeue("tasks", "", "w", Duration::from_millis(500))
            .await
            .expect("dequeue")
            .expect("message after delay");
        assert_eq!(retried.attempt, 1);
    }
}
