//! In-process log engine implementing the driver contract.
//!
//! Streams are ordered segment maps with per-consumer durable cursors,
//! ack-pending redelivery, a dedup window, and the same deliver policies the
//! production engine offers.  Retention degrades to limits-based for the
//! interest and work-queue kinds; the configured kind is preserved in
//! `StreamInfo` so a real driver can honor it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::driver::BusDriver;
use crate::types::{
    AckKind, AckPolicy, BusError, ConsumerConfig, DeliverPolicy, DiscardPolicy, RawMessage,
    RawPublishAck, StreamConfig, StreamInfo,
};

const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Pending {
    delivery_count: u32,
    redeliver_at: Instant,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    /// Next stream sequence to consider for first delivery.
    cursor: u64,
    /// Initial delivery set for `last_per_subject`.
    backlog: VecDeque<u64>,
    pending: HashMap<u64, Pending>,
    consumer_sequence: u64,
}

struct ShardState {
    config: StreamConfig,
    messages: BTreeMap<u64, StoredMessage>,
    bytes: u64,
    next_sequence: u64,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: HashMap<String, ConsumerState>,
}

struct StreamShard {
    state: Mutex<ShardState>,
    notify: Notify,
}

/// Registry entry; subjects are frozen at creation so subject resolution
/// never needs the shard lock.
struct ShardEntry {
    name: String,
    subjects: Vec<String>,
    shard: Arc<StreamShard>,
}

/// In-memory bus engine.  Cheap to clone via `Arc`; all state is shared.
pub struct MemoryBus {
    shards: StdMutex<Vec<ShardEntry>>,
    dedup_window: Duration,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus {
            shards: StdMutex::new(Vec::new()),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }

    pub fn with_dedup_window(window: Duration) -> Self {
        MemoryBus {
            shards: StdMutex::new(Vec::new()),
            dedup_window: window,
        }
    }

    fn shard(&self, name: &str) -> Result<Arc<StreamShard>, BusError> {
        self.shards
            .lock()
            .expect("shard registry poisoned")
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.shard))
            .ok_or_else(|| BusError::StreamNotFound(name.to_owned()))
    }

    /// Shard whose subject set captures `subject`, in declaration order.
    fn shard_for_subject(&self, subject: &str) -> Option<Arc<StreamShard>> {
        self.shards
            .lock()
            .expect("shard registry poisoned")
            .iter()
            .find(|e| {
                e.subjects
                    .iter()
                    .any(|p| fb_core::subject::matches(p, subject))
            })
            .map(|e| Arc::clone(&e.shard))
    }
}

impl ShardState {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            messages: self.messages.len() as u64,
            bytes: self.bytes,
            first_sequence: self.messages.keys().next().copied().unwrap_or(0),
            last_sequence: self.next_sequence.saturating_sub(1),
        }
    }

    fn prune_expired(&mut self) {
        let Some(max_age) = self.config.max_age else { return };
        let Ok(age) = chrono::Duration::from_std(max_age) else { return };
        let cutoff = Utc::now() - age;
        let expired: Vec<u64> = self
            .messages
            .values()
            .take_while(|m| m.timestamp < cutoff)
            .map(|m| m.sequence)
            .collect();
        for seq in expired {
            if let Some(m) = self.messages.remove(&seq) {
                self.bytes -= m.payload.len() as u64;
            }
        }
    }

    fn enforce_limits(&mut self, incoming: usize) -> Result<(), BusError> {
        let over_count = |s: &ShardState| {
            s.config
                .max_messages
                .is_some_and(|max| s.messages.len() as u64 + 1 > max)
        };
        let over_bytes = |s: &ShardState| {
            s.config
                .max_bytes
                .is_some_and(|max| s.bytes + incoming as u64 > max)
        };
        match self.config.discard {
            DiscardPolicy::New => {
                if over_count(self) || over_bytes(self) {
                    return Err(BusError::StreamFull(self.config.name.clone()));
                }
            }
            DiscardPolicy::Old => {
                while over_count(self) || over_bytes(self) {
                    let Some((&seq, _)) = self.messages.iter().next() else { break };
                    if let Some(m) = self.messages.remove(&seq) {
                        self.bytes -= m.payload.len() as u64;
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BusDriver for MemoryBus {
    async fn ready(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamInfo, BusError> {
        if let Ok(shard) = self.shard(&config.name) {
            return Ok(shard.state.lock().await.info());
        }
        let shard = Arc::new(StreamShard {
            state: Mutex::new(ShardState {
                config: config.clone(),
                messages: BTreeMap::new(),
                bytes: 0,
                next_sequence: 1,
                dedup: HashMap::new(),
                consumers: HashMap::new(),
            }),
            notify: Notify::new(),
        });
        let race_winner = {
            let mut shards = self.shards.lock().expect("shard registry poisoned");
            if let Some(existing) = shards.iter().find(|e| e.name == config.name) {
                // Lost a creation race; adopt the winner.
                Some(Arc::clone(&existing.shard))
            } else {
                shards.push(ShardEntry {
                    name: config.name.clone(),
                    subjects: config.subjects.clone(),
                    shard,
                });
                None
            }
        };
        if let Some(shard) = race_winner {
            return Ok(shard.state.lock().await.info());
        }
        Ok(StreamInfo {
            config,
            messages: 0,
            bytes: 0,
            first_sequence: 0,
            last_sequence: 0,
        })
    }

    async fn get_stream(&self, name: &str) -> Result<Option<StreamInfo>, BusError> {
        match self.shard(name) {
            Ok(shard) => Ok(Some(shard.state.lock().await.info())),
            Err(_) => Ok(None),
        }
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError> {
        let shards: Vec<Arc<StreamShard>> = self
            .shards
            .lock()
            .expect("shard registry poisoned")
            .iter()
            .map(|e| Arc::clone(&e.shard))
            .collect();
        let mut infos = Vec::with_capacity(shards.len());
        for shard in shards {
            infos.push(shard.state.lock().await.info());
        }
        Ok(infos)
    }

    async fn delete_stream(&self, name: &str) -> Result<bool, BusError> {
        let Ok(shard) = self.shard(name) else { return Ok(false) };
        if shard.state.lock().await.config.deny_delete {
            return Err(BusError::Denied {
                stream: name.to_owned(),
                operation: "delete",
            });
        }
        let mut shards = self.shards.lock().expect("shard registry poisoned");
        shards.retain(|e| e.name != name);
        shard.notify.notify_waiters();
        Ok(true)
    }

    async fn purge_stream(&self, name: &str, filter: Option<&str>) -> Result<u64, BusError> {
        let shard = self.shard(name)?;
        let mut state = shard.state.lock().await;
        if state.config.deny_purge {
            return Err(BusError::Denied {
                stream: name.to_owned(),
                operation: "purge",
            });
        }
        let victims: Vec<u64> = state
            .messages
            .values()
            .filter(|m| filter.is_none_or(|f| fb_core::subject::matches(f, &m.subject)))
            .map(|m| m.sequence)
            .collect();
        for seq in &victims {
            if let Some(m) = state.messages.remove(seq) {
                state.bytes -= m.payload.len() as u64;
            }
        }
        Ok(victims.len() as u64)
    }

    async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        headers: &HashMap<String, String>,
        dedup_id: Option<&str>,
    ) -> Result<RawPublishAck, BusError> {
        if !fb_core::subject::valid_subject(subject) {
            return Err(BusError::Driver(format!("invalid subject '{subject}'")));
        }
        let Some(shard) = self.shard_for_subject(subject) else {
            return Err(BusError::NoResponders);
        };
        let mut state = shard.state.lock().await;

        if let Some(limit) = state.config.max_message_size {
            if payload.len() > limit {
                return Err(BusError::MessageTooLarge {
                    size: payload.len(),
                    limit,
                });
            }
        }

        let now = Instant::now();
        if let Some(id) = dedup_id {
            state
                .dedup
                .retain(|_, (_, stored_at)| now.duration_since(*stored_at) < self.dedup_window);
            if let Some(&(sequence, _)) = state.dedup.get(id) {
                return Ok(RawPublishAck {
                    stream: state.config.name.clone(),
                    sequence,
                    duplicate: true,
                });
            }
        }

        state.prune_expired();
        state.enforce_limits(payload.len())?;

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.bytes += payload.len() as u64;
        state.messages.insert(
            sequence,
            StoredMessage {
                sequence,
                subject: subject.to_owned(),
                payload: payload.to_vec(),
                headers: headers.clone(),
                timestamp: Utc::now(),
            },
        );
        if let Some(id) = dedup_id {
            state.dedup.insert(id.to_owned(), (sequence, now));
        }
        let stream = state.config.name.clone();
        drop(state);
        shard.notify.notify_waiters();
        Ok(RawPublishAck {
            stream,
            sequence,
            duplicate: false,
        })
    }

    async fn get_consumer(
        &self,
        stream: &str,
        name: &str,
    ) -> Result<Option<ConsumerConfig>, BusError> {
        let shard = self.shard(stream)?;
        let state = shard.state.lock().await;
        Ok(state.consumers.get(name).map(|c| c.config.clone()))
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), BusError> {
        let shard = self.shard(stream)?;
        let mut state = shard.state.lock().await;
        if state.consumers.contains_key(&config.durable_name) {
            return Err(BusError::Driver(format!(
                "consumer '{}' already exists on stream '{stream}'",
                config.durable_name
            )));
        }

        let filter = config.filter_subject.clone();
        let matches_filter = |m: &StoredMessage| {
            filter
                .as_deref()
                .is_none_or(|f| fb_core::subject::matches(f, &m.subject))
        };

        let mut backlog = VecDeque::new();
        let cursor = match config.deliver_policy {
            DeliverPolicy::All => state.messages.keys().next().copied().unwrap_or(1),
            DeliverPolicy::New => state.next_sequence,
            DeliverPolicy::Last => state
                .messages
                .values()
                .filter(|m| matches_filter(m))
                .next_back()
                .map_or(state.next_sequence, |m| m.sequence),
            DeliverPolicy::LastPerSubject => {
                let mut last_per_subject: HashMap<&str, u64> = HashMap::new();
                for m in state.messages.values().filter(|m| matches_filter(m)) {
                    last_per_subject.insert(m.subject.as_str(), m.sequence);
                }
                let mut seqs: Vec<u64> = last_per_subject.into_values().collect();
                seqs.sort_unstable();
                backlog = seqs.into();
                state.next_sequence
            }
            DeliverPolicy::BySequence(seq) => seq.max(1),
            DeliverPolicy::ByTime(t) => state
                .messages
                .values()
                .find(|m| m.timestamp >= t)
                .map_or(state.next_sequence, |m| m.sequence),
        };

        let name = config.durable_name.clone();
        state.consumers.insert(
            name,
            ConsumerState {
                config,
                cursor,
                backlog,
                pending: HashMap::new(),
                consumer_sequence: 0,
            },
        );
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<bool, BusError> {
        let Ok(shard) = self.shard(stream) else { return Ok(false) };
        let mut state = shard.state.lock().await;
        Ok(state.consumers.remove(name).is_some())
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BusError> {
        let shard = self.shard(stream)?;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = shard.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_redelivery;
            {
                let mut state = shard.state.lock().await;
                state.prune_expired();
                if !state.consumers.contains_key(consumer) {
                    return Err(BusError::ConsumerNotFound {
                        stream: stream.to_owned(),
                        consumer: consumer.to_owned(),
                    });
                }
                let delivered = collect_batch(&mut *state, consumer, batch);
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
                next_redelivery = state
                    .consumers
                    .get(consumer)
                    .and_then(|c| {
                        c.pending
                            .values()
                            .filter(|p| p.delivery_count < c.config.max_deliver)
                            .map(|p| p.redeliver_at)
                            .min()
                    });
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake = next_redelivery.map_or(deadline, |r| r.min(deadline));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake) => {
                    if wake == deadline {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    async fn acknowledge(
        &self,
        stream: &str,
        consumer: &str,
        stream_sequence: u64,
        kind: AckKind,
    ) -> Result<(), BusError> {
        let shard = self.shard(stream)?;
        let mut state = shard.state.lock().await;
        let Some(cons) = state.consumers.get_mut(consumer) else {
            return Err(BusError::ConsumerNotFound {
                stream: stream.to_owned(),
                consumer: consumer.to_owned(),
            });
        };
        match kind {
            AckKind::Ack | AckKind::Terminate => {
                cons.pending.remove(&stream_sequence);
            }
            AckKind::Nak(delay) => {
                if let Some(p) = cons.pending.get_mut(&stream_sequence) {
                    p.redeliver_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
                }
            }
            AckKind::InProgress => {
                let ack_wait = cons.config.ack_wait;
                if let Some(p) = cons.pending.get_mut(&stream_sequence) {
                    p.redeliver_at = Instant::now() + ack_wait;
                }
            }
        }
        drop(state);
        shard.notify.notify_waiters();
        Ok(())
    }
}

/// Gather one batch for a consumer: due redeliveries first, then the
/// last-per-subject backlog, then new messages from the cursor, all in
/// stream-sequence order.
fn collect_batch(state: &mut ShardState, consumer: &str, batch: usize) -> Vec<RawMessage> {
    let now = Instant::now();

    // Disjoint field borrows: the consumer entry and the message map.
    let messages = &state.messages;
    let Some(cons) = state.consumers.get_mut(consumer) else { return Vec::new() };

    let filter = cons.config.filter_subject.clone();
    let matches_filter = |subject: &str| {
        filter
            .as_deref()
            .is_none_or(|f| fb_core::subject::matches(f, subject))
    };

    let mut due: Vec<u64> = Vec::new();

    // Redeliveries whose deadline passed and that still have deliveries left.
    let mut stale: Vec<u64> = Vec::new();
    for (&seq, p) in &cons.pending {
        if !messages.contains_key(&seq) {
            stale.push(seq);
        } else if p.redeliver_at <= now && p.delivery_count < cons.config.max_deliver {
            due.push(seq);
        }
    }
    for seq in stale {
        cons.pending.remove(&seq);
    }
    due.sort_unstable();
    due.truncate(batch);

    // Initial backlog (last-per-subject starting set).
    while due.len() < batch {
        let Some(&seq) = cons.backlog.front() else { break };
        cons.backlog.pop_front();
        if messages.contains_key(&seq) {
            due.push(seq);
        }
    }

    // New messages from the cursor.
    if cons.config.max_ack_pending == 0 || cons.pending.len() < cons.config.max_ack_pending {
        let mut cursor = cons.cursor;
        for (&seq, msg) in messages.range(cursor..) {
            if due.len() >= batch {
                break;
            }
            cursor = seq + 1;
            if matches_filter(&msg.subject) {
                due.push(seq);
            }
        }
        cons.cursor = cursor.max(cons.cursor);
    }

    due.sort_unstable();
    let mut out = Vec::with_capacity(due.len());
    for seq in due {
        let Some(msg) = messages.get(&seq) else { continue };
        let delivery_count = match cons.pending.get_mut(&seq) {
            Some(p) => {
                p.delivery_count += 1;
                p.redeliver_at = now + cons.config.ack_wait;
                p.delivery_count
            }
            None => {
                cons.consumer_sequence += 1;
                if cons.config.ack_policy != AckPolicy::None {
                    cons.pending.insert(
                        seq,
                        Pending {
                            delivery_count: 1,
                            redeliver_at: now + cons.config.ack_wait,
                        },
                    );
                }
                1
            }
        };
        out.push(RawMessage {
            subject: msg.subject.clone(),
            payload: msg.payload.clone(),
            headers: msg.headers.clone(),
            stream_sequence: seq,
            consumer_sequence: cons.consumer_sequence,
            timestamp: msg.timestamp,
            delivery_count,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry_stream() -> StreamConfig {
        StreamConfig::new("telemetry", vec!["telemetry.>".to_owned()])
    }

    async fn bus_with_stream() -> MemoryBus {
        let bus = MemoryBus::new();
        bus.ensure_stream(telemetry_stream()).await.unwrap();
        bus
    }

    async fn publish_n(bus: &MemoryBus, subject: &str, n: usize) {
        for i in 0..n {
            bus.publish(subject, format!("m{i}").as_bytes(), &HashMap::new(), None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn publish_assigns_increasing_sequences() {
        let bus = bus_with_stream().await;
        let a = bus
            .publish("telemetry.s1.temp", b"a", &HashMap::new(), None)
            .await
            .unwrap();
        let b = bus
            .publish("telemetry.s1.temp", b"b", &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert!(!b.duplicate);
    }

    #[tokio::test]
    async fn publish_without_matching_stream_has_no_responders() {
        let bus = bus_with_stream().await;
        let err = bus
            .publish("commands.s1.restart", b"x", &HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, BusError::NoResponders);
        assert!(err.transient());
    }

    #[tokio::test]
    async fn dedup_id_suppresses_restore_within_window() {
        let bus = bus_with_stream().await;
        let first = bus
            .publish("telemetry.s1.temp", b"a", &HashMap::new(), Some("msg-1"))
            .await
            .unwrap();
        let second = bus
            .publish("telemetry.s1.temp", b"a", &HashMap::new(), Some("msg-1"))
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.sequence, first.sequence);

        let info = bus.get_stream("telemetry").await.unwrap().unwrap();
        assert_eq!(info.messages, 1);
    }

    #[tokio::test]
    async fn fetch_returns_messages_in_sequence_order() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 5).await;
        bus.create_consumer("telemetry", ConsumerConfig::pull("c1", None))
            .await
            .unwrap();
        let batch = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(50))
            .await
            .unwrap();
        let seqs: Vec<u64> = batch.iter().map(|m| m.stream_sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(batch.iter().all(|m| m.delivery_count == 1));
    }

    #[tokio::test]
    async fn fetch_timeout_empty_is_not_an_error() {
        let bus = bus_with_stream().await;
        bus.create_consumer("telemetry", ConsumerConfig::pull("c1", None))
            .await
            .unwrap();
        let batch = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered_after_ack_wait() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 1).await;
        let mut config = ConsumerConfig::pull("c1", None);
        config.ack_wait = Duration::from_millis(30);
        bus.create_consumer("telemetry", config).await.unwrap();

        let first = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);

        let redelivered = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn acked_messages_are_not_redelivered() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 1).await;
        let mut config = ConsumerConfig::pull("c1", None);
        config.ack_wait = Duration::from_millis(20);
        bus.create_consumer("telemetry", config).await.unwrap();

        let first = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(20))
            .await
            .unwrap();
        bus.acknowledge("telemetry", "c1", first[0].stream_sequence, AckKind::Ack)
            .await
            .unwrap();

        let again = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(80))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn terminate_stops_redelivery_and_nak_forces_it() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 2).await;
        bus.create_consumer("telemetry", ConsumerConfig::pull("c1", None))
            .await
            .unwrap();

        let batch = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        // ack_wait is 30s, so without a nak nothing would come back soon.
        bus.acknowledge("telemetry", "c1", 1, AckKind::Terminate)
            .await
            .unwrap();
        bus.acknowledge("telemetry", "c1", 2, AckKind::Nak(None))
            .await
            .unwrap();

        let again = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].stream_sequence, 2);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn max_deliver_caps_redeliveries() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 1).await;
        let mut config = ConsumerConfig::pull("c1", None);
        config.ack_wait = Duration::from_millis(10);
        config.max_deliver = 2;
        bus.create_consumer("telemetry", config).await.unwrap();

        for _ in 0..2 {
            let batch = bus
                .fetch("telemetry", "c1", 10, Duration::from_millis(100))
                .await
                .unwrap();
            assert_eq!(batch.len(), 1);
        }
        let exhausted = bus
            .fetch("telemetry", "c1", 10, Duration::from_millis(60))
            .await
            .unwrap();
        assert!(exhausted.is_empty());
    }

    #[tokio::test]
    async fn deliver_policy_new_skips_history() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 3).await;
        let mut config = ConsumerConfig::pull("c-new", None);
        config.deliver_policy = DeliverPolicy::New;
        bus.create_consumer("telemetry", config).await.unwrap();

        publish_n(&bus, "telemetry.s1.temp", 1).await;
        let batch = bus
            .fetch("telemetry", "c-new", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].stream_sequence, 4);
    }

    #[tokio::test]
    async fn deliver_policy_by_sequence_starts_mid_stream() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 5).await;
        let mut config = ConsumerConfig::pull("c-seq", None);
        config.deliver_policy = DeliverPolicy::BySequence(3);
        bus.create_consumer("telemetry", config).await.unwrap();

        let batch = bus
            .fetch("telemetry", "c-seq", 10, Duration::from_millis(50))
            .await
            .unwrap();
        let seqs: Vec<u64> = batch.iter().map(|m| m.stream_sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn deliver_policy_last_per_subject_seeds_backlog() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 2).await;
        publish_n(&bus, "telemetry.s2.temp", 3).await;
        let mut config = ConsumerConfig::pull("c-lps", None);
        config.deliver_policy = DeliverPolicy::LastPerSubject;
        bus.create_consumer("telemetry", config).await.unwrap();

        let batch = bus
            .fetch("telemetry", "c-lps", 10, Duration::from_millis(50))
            .await
            .unwrap();
        let seqs: Vec<u64> = batch.iter().map(|m| m.stream_sequence).collect();
        assert_eq!(seqs, vec![2, 5]);
    }

    #[tokio::test]
    async fn filter_subject_narrows_deliveries() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 2).await;
        publish_n(&bus, "telemetry.s2.temp", 2).await;
        bus.create_consumer(
            "telemetry",
            ConsumerConfig::pull("c-f", Some("telemetry.s2.>".to_owned())),
        )
        .await
        .unwrap();

        let batch = bus
            .fetch("telemetry", "c-f", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|m| m.subject == "telemetry.s2.temp"));
    }

    #[tokio::test]
    async fn discard_old_evicts_and_discard_new_rejects() {
        let bus = MemoryBus::new();
        let mut old_cfg = StreamConfig::new("old", vec!["old.>".to_owned()]);
        old_cfg.max_messages = Some(2);
        bus.ensure_stream(old_cfg).await.unwrap();
        publish_n(&bus, "old.a", 3).await;
        let info = bus.get_stream("old").await.unwrap().unwrap();
        assert_eq!(info.messages, 2);
        assert_eq!(info.first_sequence, 2);

        let mut new_cfg = StreamConfig::new("strict", vec!["strict.>".to_owned()]);
        new_cfg.max_messages = Some(1);
        new_cfg.discard = DiscardPolicy::New;
        bus.ensure_stream(new_cfg).await.unwrap();
        publish_n(&bus, "strict.a", 1).await;
        let err = bus
            .publish("strict.a", b"x", &HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, BusError::StreamFull("strict".to_owned()));
    }

    #[tokio::test]
    async fn purge_with_filter_counts_matches_only() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 2).await;
        publish_n(&bus, "telemetry.s2.temp", 3).await;
        let purged = bus
            .purge_stream("telemetry", Some("telemetry.s2.>"))
            .await
            .unwrap();
        assert_eq!(purged, 3);
        let info = bus.get_stream("telemetry").await.unwrap().unwrap();
        assert_eq!(info.messages, 2);
    }

    #[tokio::test]
    async fn deny_flags_are_enforced() {
        let bus = MemoryBus::new();
        let mut cfg = StreamConfig::new("locked", vec!["locked.>".to_owned()]);
        cfg.deny_delete = true;
        cfg.deny_purge = true;
        bus.ensure_stream(cfg).await.unwrap();

        assert!(matches!(
            bus.delete_stream("locked").await,
            Err(BusError::Denied { operation: "delete", .. })
        ));
        assert!(matches!(
            bus.purge_stream("locked", None).await,
            Err(BusError::Denied { operation: "purge", .. })
        ));
    }

    #[tokio::test]
    async fn ensure_stream_adopts_existing() {
        let bus = bus_with_stream().await;
        publish_n(&bus, "telemetry.s1.temp", 2).await;
        // Second ensure with a different subject set adopts, never redefines.
        let info = bus
            .ensure_stream(StreamConfig::new("telemetry", vec!["other.>".to_owned()]))
            .await
            .unwrap();
        assert_eq!(info.messages, 2);
        assert_eq!(info.config.subjects, vec!["telemetry.>".to_owned()]);
    }

    #[tokio::test]
    async fn message_size_cap_is_enforced() {
        let bus = MemoryBus::new();
        let mut cfg = StreamConfig::new("small", vec!["small.>".to_owned()]);
        cfg.max_message_size = Some(4);
        bus.ensure_stream(cfg).await.unwrap();
        let err = bus
            .publish("small.a", b"12345", &HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, BusError::MessageTooLarge { size: 5, limit: 4 });
        assert!(!err.transient());
    }
}
