//! Stream, consumer and message types shared by the adapter and drivers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::driver::BusDriver;

// ---------------------------------------------------------------------------
// Stream model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    Limits,
    Interest,
    WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardPolicy {
    Old,
    New,
}

/// Durable log partition definition.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    /// Subject patterns captured by this stream.
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageKind,
    pub max_age: Option<Duration>,
    pub max_messages: Option<u64>,
    pub max_bytes: Option<u64>,
    pub max_message_size: Option<usize>,
    pub replicas: u8,
    pub discard: DiscardPolicy,
    pub deny_delete: bool,
    pub deny_purge: bool,
    pub allow_direct: bool,
    pub allow_rollup: bool,
    pub description: Option<String>,
}

impl StreamConfig {
    /// Minimal config used by tests and ad-hoc streams.
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        StreamConfig {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::Limits,
            storage: StorageKind::Memory,
            max_age: None,
            max_messages: None,
            max_bytes: None,
            max_message_size: None,
            replicas: 1,
            discard: DiscardPolicy::Old,
            deny_delete: false,
            deny_purge: false,
            allow_direct: true,
            allow_rollup: false,
            description: None,
        }
    }

    /// True when any of this stream's patterns captures the concrete
    /// `subject`.
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects
            .iter()
            .any(|p| fb_core::subject::matches(p, subject))
    }

    /// True when any of this stream's patterns overlaps the (possibly
    /// wildcard) `pattern`.
    pub fn captures_pattern(&self, pattern: &str) -> bool {
        self.subjects
            .iter()
            .any(|p| fb_core::subject::overlaps(p, pattern))
    }
}

impl From<&fb_core::config::StreamSpec> for StreamConfig {
    fn from(spec: &fb_core::config::StreamSpec) -> Self {
        StreamConfig {
            name: spec.name.clone(),
            subjects: spec.subjects.clone(),
            retention: match spec.retention.as_str() {
                "interest" => RetentionPolicy::Interest,
                "work_queue" => RetentionPolicy::WorkQueue,
                _ => RetentionPolicy::Limits,
            },
            storage: match spec.storage.as_str() {
                "memory" => StorageKind::Memory,
                _ => StorageKind::File,
            },
            max_age: spec.max_age,
            max_messages: spec.max_messages,
            max_bytes: spec.max_bytes,
            max_message_size: spec.max_message_size,
            replicas: spec.replicas,
            discard: match spec.discard.as_str() {
                "new" => DiscardPolicy::New,
                _ => DiscardPolicy::Old,
            },
            deny_delete: spec.deny_delete,
            deny_purge: spec.deny_purge,
            allow_direct: spec.allow_direct,
            allow_rollup: spec.allow_rollup,
            description: spec.description.clone(),
        }
    }
}

/// A stream's definition plus its current shape.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

// ---------------------------------------------------------------------------
// Consumer model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    None,
    All,
    Explicit,
}

/// Where a consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    All,
    New,
    Last,
    LastPerSubject,
    BySequence(u64),
    ByTime(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPacing {
    Instant,
    Original,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerKind {
    Pull,
    Push {
        deliver_subject: String,
        deliver_group: Option<String>,
        idle_heartbeat: Option<Duration>,
        flow_control: bool,
    },
}

/// Durable cursor definition on a stream.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: Option<String>,
    pub ack_policy: AckPolicy,
    pub ack_wait: Duration,
    pub max_deliver: u32,
    pub max_ack_pending: usize,
    pub deliver_policy: DeliverPolicy,
    pub replay: ReplayPacing,
    pub kind: ConsumerKind,
}

impl ConsumerConfig {
    /// Explicit-ack pull consumer with common defaults.
    pub fn pull(durable_name: impl Into<String>, filter_subject: Option<String>) -> Self {
        ConsumerConfig {
            durable_name: durable_name.into(),
            filter_subject,
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            max_ack_pending: 1000,
            deliver_policy: DeliverPolicy::All,
            replay: ReplayPacing::Instant,
            kind: ConsumerKind::Pull,
        }
    }
}

impl From<&fb_core::config::ConsumerSpec> for ConsumerConfig {
    fn from(spec: &fb_core::config::ConsumerSpec) -> Self {
        ConsumerConfig {
            durable_name: spec.name.clone(),
            filter_subject: spec.filter_subject.clone(),
            ack_policy: match spec.ack_policy.as_str() {
                "none" => AckPolicy::None,
                "all" => AckPolicy::All,
                _ => AckPolicy::Explicit,
            },
            ack_wait: spec.ack_wait,
            max_deliver: spec.max_deliver,
            max_ack_pending: spec.max_ack_pending,
            deliver_policy: match spec.deliver_policy.as_str() {
                "new" => DeliverPolicy::New,
                "last" => DeliverPolicy::Last,
                "last_per_subject" => DeliverPolicy::LastPerSubject,
                _ => DeliverPolicy::All,
            },
            replay: match spec.replay_policy.as_str() {
                "original" => ReplayPacing::Original,
                _ => ReplayPacing::Instant,
            },
            kind: if spec.kind == "push" {
                ConsumerKind::Push {
                    deliver_subject: spec.deliver_subject.clone().unwrap_or_default(),
                    deliver_group: spec.deliver_group.clone(),
                    idle_heartbeat: spec.idle_heartbeat,
                    flow_control: spec.flow_control,
                }
            } else {
                ConsumerKind::Pull
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Messages and acknowledgement
// ---------------------------------------------------------------------------

/// Acknowledgement verbs understood by the log engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Final success; never redelivered.
    Ack,
    /// Negative ack; redeliver after the optional delay.
    Nak(Option<Duration>),
    /// Extend the ack deadline.
    InProgress,
    /// Final failure; never redelivered.
    Terminate,
}

/// Raw delivery as produced by a driver, before the adapter attaches the
/// acknowledgement handle.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub delivery_count: u32,
}

/// Raw publish acknowledgement from a driver.
#[derive(Debug, Clone)]
pub struct RawPublishAck {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
}

/// Opaque handle the adapter uses to acknowledge a delivery.
#[derive(Clone)]
pub struct AckHandle {
    pub(crate) driver: Arc<dyn BusDriver>,
    pub(crate) stream: String,
    pub(crate) consumer: String,
    pub(crate) stream_sequence: u64,
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("stream", &self.stream)
            .field("consumer", &self.consumer)
            .field("stream_sequence", &self.stream_sequence)
            .finish()
    }
}

/// One delivery from a consumer, with its acknowledgement family.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub delivery_count: u32,
    pub stream: String,
    pub consumer: String,
    pub(crate) ack_handle: AckHandle,
}

impl BusMessage {
    pub async fn ack(&self) -> Result<(), BusError> {
        self.acknowledge(AckKind::Ack).await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        self.acknowledge(AckKind::Nak(delay)).await
    }

    pub async fn in_progress(&self) -> Result<(), BusError> {
        self.acknowledge(AckKind::InProgress).await
    }

    pub async fn terminate(&self) -> Result<(), BusError> {
        self.acknowledge(AckKind::Terminate).await
    }

    async fn acknowledge(&self, kind: AckKind) -> Result<(), BusError> {
        self.ack_handle
            .driver
            .acknowledge(
                &self.ack_handle.stream,
                &self.ack_handle.consumer,
                self.ack_handle.stream_sequence,
                kind,
            )
            .await
    }
}

/// Successful publish outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub stream: String,
    pub sequence: u64,
    /// True when the dedup id was already stored within the dedup window.
    pub duplicate: bool,
    /// Transient-error retries spent before the publish landed.
    pub retries: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("no responders for the request")]
    NoResponders,
    #[error("bus request timed out")]
    Timeout,
    #[error("bus connection closed")]
    ConnectionClosed,
    #[error("stream '{0}' not found")]
    StreamNotFound(String),
    #[error("consumer '{consumer}' not found on stream '{stream}'")]
    ConsumerNotFound { stream: String, consumer: String },
    #[error("no stream captures subject '{0}'")]
    NoStreamForSubject(String),
    #[error("message of {size} bytes exceeds stream limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("stream '{0}' is full and discards new messages")]
    StreamFull(String),
    #[error("stream '{stream}' denies {operation}")]
    Denied {
        stream: String,
        operation: &'static str,
    },
    #[error("driver error: {0}")]
    Driver(String),
}

impl BusError {
    /// Transient errors are worth retrying; everything else is permanent.
    pub fn transient(&self) -> bool {
        matches!(
            self,
            BusError::NoResponders | BusError::Timeout | BusError::ConnectionClosed
        )
    }
}

/// Terminal publish failure after the retry policy is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("bus unavailable after {retries} retries: {source}")]
    Unavailable { retries: u32, source: BusError },
    #[error("publish rejected: {source}")]
    Rejected { source: BusError },
}

impl PublishError {
    /// The wire error code the session reports for this failure.
    pub fn wire_code(&self) -> &'static str {
        match self {
            PublishError::Unavailable { .. } => fb_protocol::error_codes::BUS_UNAVAILABLE,
            PublishError::Rejected { .. } => fb_protocol::error_codes::PUBLISH_FAILED,
        }
    }
}
