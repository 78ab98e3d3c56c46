//! The typed facade over a [`BusDriver`].
//!
//! Owns stream/consumer provisioning, publish with dedup + retry, batched
//! fetch, background subscription loops and shared-consumer device fanout.
//! Entities reference each other only by name; all maps are keyed on stable
//! identifiers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use fb_protocol::ReplayMode;
use futures::future::BoxFuture;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::BusDriver;
use crate::types::{
    AckHandle, BusError, BusMessage, ConsumerConfig, DeliverPolicy, PublishError, PublishReceipt,
    RawMessage, StreamConfig, StreamInfo,
};

/// Async per-message callback.  Returning Err negatively acknowledges the
/// message for redelivery.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type MessageHandler =
    Arc<dyn Fn(BusMessage) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Multiplicative backoff with a cap and optional ±25% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retries: u32,
    pub add_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
            max_retries: 5,
            add_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let with_jitter = if self.add_jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(with_jitter.max(0.0) as u64)
    }
}

impl From<&fb_core::config::PublishRetryConfig> for RetryPolicy {
    fn from(cfg: &fb_core::config::PublishRetryConfig) -> Self {
        RetryPolicy {
            initial_delay: cfg.initial_delay,
            max_delay: cfg.max_delay,
            backoff_multiplier: cfg.backoff_multiplier,
            max_retries: cfg.max_retries,
            add_jitter: cfg.add_jitter,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Declarative adapter configuration.
#[derive(Clone)]
pub struct BusSettings {
    pub client_name: String,
    /// Streams in declaration order; resolution order for subjects.
    pub streams: Vec<StreamConfig>,
    /// Durable consumers to provision at initialize, with their stream.
    pub consumers: Vec<(String, ConsumerConfig)>,
    pub default_batch_size: usize,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    /// Redelivery delay applied when a subscription handler fails.
    pub nak_delay: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        BusSettings {
            client_name: "fluxbridge".to_owned(),
            streams: Vec::new(),
            consumers: Vec::new(),
            default_batch_size: 64,
            fetch_timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
            nak_delay: Duration::from_secs(1),
        }
    }
}

impl From<&fb_core::config::BusConfig> for BusSettings {
    fn from(cfg: &fb_core::config::BusConfig) -> Self {
        BusSettings {
            client_name: cfg.client_name.clone(),
            streams: cfg.streams.iter().map(StreamConfig::from).collect(),
            consumers: cfg
                .consumers
                .iter()
                .map(|c| (c.stream.clone(), ConsumerConfig::from(c)))
                .collect(),
            default_batch_size: cfg.default_consumer.default_batch_size,
            fetch_timeout: cfg.default_consumer.fetch_timeout,
            retry: RetryPolicy::from(&cfg.publish_retry),
            nak_delay: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription bookkeeping
// ---------------------------------------------------------------------------

/// Handle for one active subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub stream: String,
    pub consumer: String,
    pub subject_pattern: String,
}

enum SubKind {
    Dedicated,
    Fanout { key: (String, String) },
}

struct SubEntry {
    stream: String,
    consumer: String,
    kind: SubKind,
    cancel: CancellationToken,
    active: Arc<AtomicBool>,
    last_acked: Arc<AtomicU64>,
}

type FanoutHandlers = Arc<StdRwLock<HashMap<Uuid, MessageHandler>>>;

struct FanoutEntry {
    consumer: String,
    handlers: FanoutHandlers,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct BusAdapter {
    driver: Arc<dyn BusDriver>,
    settings: BusSettings,
    /// Streams found on the bus at initialize that are not configured.
    adopted: StdRwLock<Vec<StreamConfig>>,
    subscriptions: StdMutex<HashMap<Uuid, SubEntry>>,
    fanouts: StdMutex<HashMap<(String, String), FanoutEntry>>,
}

impl BusAdapter {
    pub fn new(driver: Arc<dyn BusDriver>, settings: BusSettings) -> Self {
        BusAdapter {
            driver,
            settings,
            adopted: StdRwLock::new(Vec::new()),
            subscriptions: StdMutex::new(HashMap::new()),
            fanouts: StdMutex::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> Arc<dyn BusDriver> {
        Arc::clone(&self.driver)
    }

    /// Readiness of the underlying engine, for the health endpoint.
    pub async fn ready(&self) -> bool {
        self.driver.ready().await.is_ok()
    }

    /// Connect-time provisioning: create missing streams and consumers,
    /// adopt what already exists.  Idempotent.
    pub async fn initialize(&self) -> Result<(), BusError> {
        self.driver.ready().await?;

        for config in &self.settings.streams {
            match self.driver.get_stream(&config.name).await? {
                Some(existing) => {
                    if existing.config.subjects != config.subjects {
                        warn!(
                            stream = %config.name,
                            configured = ?config.subjects,
                            actual = ?existing.config.subjects,
                            "stream exists with a different subject set, using it as-is"
                        );
                    }
                    debug!(stream = %config.name, "adopted existing stream");
                }
                None => {
                    self.driver.ensure_stream(config.clone()).await?;
                    info!(stream = %config.name, "created stream");
                }
            }
        }

        // Remember unconfigured streams for subject resolution fallback.
        let configured: Vec<&str> = self.settings.streams.iter().map(|s| s.name.as_str()).collect();
        let mut adopted = Vec::new();
        for info in self.driver.list_streams().await? {
            if !configured.contains(&info.config.name.as_str()) {
                adopted.push(info.config);
            }
        }
        *self.adopted.write().expect("adopted lock poisoned") = adopted;

        for (stream, consumer) in &self.settings.consumers {
            self.get_or_create_consumer(stream, consumer.clone()).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stream operations
    // -----------------------------------------------------------------------

    pub async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamInfo, BusError> {
        self.driver.ensure_stream(config).await
    }

    pub async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>, BusError> {
        self.driver.get_stream(name).await
    }

    pub async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError> {
        self.driver.list_streams().await
    }

    pub async fn delete_stream(&self, name: &str) -> Result<bool, BusError> {
        self.driver.delete_stream(name).await
    }

    pub async fn purge_stream(&self, name: &str, filter: Option<&str>) -> Result<u64, BusError> {
        self.driver.purge_stream(name, filter).await
    }

    /// First configured stream whose subject set captures `subject` (which
    /// may itself be a wildcard pattern), falling back to adopted streams.
    pub fn resolve_stream(&self, subject: &str) -> Result<String, BusError> {
        if let Some(s) = self
            .settings
            .streams
            .iter()
            .find(|s| s.captures_pattern(subject))
        {
            return Ok(s.name.clone());
        }
        if let Some(s) = self
            .adopted
            .read()
            .expect("adopted lock poisoned")
            .iter()
            .find(|s| s.captures_pattern(subject))
        {
            return Ok(s.name.clone());
        }
        Err(BusError::NoStreamForSubject(subject.to_owned()))
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Publish with optional dedup id, retrying transient failures per the
    /// configured policy.  Permanent failures return immediately.
    pub async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        headers: HashMap<String, String>,
        dedup_id: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        let policy = &self.settings.retry;
        let mut retries = 0u32;
        loop {
            match self.driver.publish(subject, payload, &headers, dedup_id).await {
                Ok(raw) => {
                    return Ok(PublishReceipt {
                        stream: raw.stream,
                        sequence: raw.sequence,
                        duplicate: raw.duplicate,
                        retries,
                    });
                }
                Err(e) if e.transient() && retries < policy.max_retries => {
                    let delay = policy.delay(retries);
                    retries += 1;
                    debug!(
                        subject = %subject,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient publish failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.transient() => {
                    return Err(PublishError::Unavailable { retries, source: e });
                }
                Err(e) => return Err(PublishError::Rejected { source: e }),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Consumers and fetch
    // -----------------------------------------------------------------------

    pub async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), BusError> {
        self.driver.create_consumer(stream, config).await
    }

    /// Adopt an existing durable consumer (cursor preserved) or create it.
    pub async fn get_or_create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), BusError> {
        if self
            .driver
            .get_consumer(stream, &config.durable_name)
            .await?
            .is_some()
        {
            debug!(stream = %stream, consumer = %config.durable_name, "adopted existing consumer");
            return Ok(());
        }
        self.driver.create_consumer(stream, config).await
    }

    pub async fn delete_consumer(&self, stream: &str, name: &str) -> Result<bool, BusError> {
        self.driver.delete_consumer(stream, name).await
    }

    /// One explicit batched pull.  Timeout-empty is `Ok(vec![])`.
    pub async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let raw = self.driver.fetch(stream, consumer, batch, timeout).await?;
        Ok(raw
            .into_iter()
            .map(|m| self.wrap_message(stream, consumer, m))
            .collect())
    }

    fn wrap_message(&self, stream: &str, consumer: &str, raw: RawMessage) -> BusMessage {
        BusMessage {
            subject: raw.subject,
            payload: raw.payload,
            headers: raw.headers,
            stream_sequence: raw.stream_sequence,
            consumer_sequence: raw.consumer_sequence,
            timestamp: raw.timestamp,
            delivery_count: raw.delivery_count,
            stream: stream.to_owned(),
            consumer: consumer.to_owned(),
            ack_handle: AckHandle {
                driver: Arc::clone(&self.driver),
                stream: stream.to_owned(),
                consumer: consumer.to_owned(),
                stream_sequence: raw.stream_sequence,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Background fetch loop over an existing consumer.  Handler success
    /// acknowledges; handler failure negatively acknowledges with the
    /// configured delay.
    pub async fn subscribe(
        &self,
        stream: &str,
        consumer: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, BusError> {
        let config = self
            .driver
            .get_consumer(stream, consumer)
            .await?
            .ok_or_else(|| BusError::ConsumerNotFound {
                stream: stream.to_owned(),
                consumer: consumer.to_owned(),
            })?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicBool::new(true));
        let last_acked = Arc::new(AtomicU64::new(0));

        self.spawn_fetch_loop(
            stream.to_owned(),
            consumer.to_owned(),
            cancel.clone(),
            Arc::clone(&active),
            Arc::clone(&last_acked),
            FetchTarget::Single(handler),
        );

        self.subscriptions.lock().expect("subscriptions poisoned").insert(
            id,
            SubEntry {
                stream: stream.to_owned(),
                consumer: consumer.to_owned(),
                kind: SubKind::Dedicated,
                cancel,
                active,
                last_acked,
            },
        );

        Ok(Subscription {
            id,
            stream: stream.to_owned(),
            consumer: consumer.to_owned(),
            subject_pattern: config.filter_subject.unwrap_or_default(),
        })
    }

    /// Create a dedicated consumer positioned per `replay` and subscribe to
    /// it.  `resume_from_last_ack` adopts an existing durable cursor; every
    /// other mode starts from a fresh consumer.
    pub async fn subscribe_with_replay(
        &self,
        stream: &str,
        subject: &str,
        name_prefix: &str,
        replay: ReplayMode,
        handler: MessageHandler,
    ) -> Result<Subscription, BusError> {
        let durable_name = format!("{name_prefix}-{}", sanitize_subject(subject));
        let mut config = ConsumerConfig::pull(durable_name.clone(), Some(subject.to_owned()));
        config.deliver_policy = deliver_policy_for(&replay);

        if matches!(replay, ReplayMode::ResumeFromLastAck) {
            self.get_or_create_consumer(stream, config).await?;
        } else {
            let _ = self.driver.delete_consumer(stream, &durable_name).await;
            self.driver.create_consumer(stream, config).await?;
        }
        self.subscribe(stream, &durable_name, handler).await
    }

    /// Device-facing subscribe: resolve the stream by subject, then either
    /// attach to the shared consumer for `(stream, subject)` or create a
    /// dedicated one prefixed by the device id.
    ///
    /// Shared-consumer fanout shares one acknowledgement: a failing handler
    /// naks the message for every handler.  Prefer it for read-only
    /// observers.
    pub async fn subscribe_device(
        &self,
        device_id: &str,
        subject: &str,
        handler: MessageHandler,
        replay: Option<ReplayMode>,
    ) -> Result<Subscription, BusError> {
        let stream = self.resolve_stream(subject)?;
        let key = (stream.clone(), subject.to_owned());
        let id = Uuid::new_v4();

        // Attach to an existing fanout when one is already running.
        {
            let fanouts = self.fanouts.lock().expect("fanouts poisoned");
            if let Some(entry) = fanouts.get(&key) {
                entry
                    .handlers
                    .write()
                    .expect("fanout handlers poisoned")
                    .insert(id, handler);
                let consumer = entry.consumer.clone();
                drop(fanouts);
                self.subscriptions.lock().expect("subscriptions poisoned").insert(
                    id,
                    SubEntry {
                        stream: stream.clone(),
                        consumer: consumer.clone(),
                        kind: SubKind::Fanout { key },
                        cancel: CancellationToken::new(),
                        active: Arc::new(AtomicBool::new(true)),
                        last_acked: Arc::new(AtomicU64::new(0)),
                    },
                );
                return Ok(Subscription {
                    id,
                    stream,
                    consumer,
                    subject_pattern: subject.to_owned(),
                });
            }
        }

        let durable_name = format!("{device_id}-{}", sanitize_subject(subject));
        let mut config = ConsumerConfig::pull(durable_name.clone(), Some(subject.to_owned()));
        config.deliver_policy = deliver_policy_for(&replay.unwrap_or(ReplayMode::New));
        self.get_or_create_consumer(&stream, config).await?;

        let handlers: FanoutHandlers = Arc::new(StdRwLock::new(HashMap::new()));
        handlers
            .write()
            .expect("fanout handlers poisoned")
            .insert(id, handler);
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicBool::new(true));
        let last_acked = Arc::new(AtomicU64::new(0));

        self.spawn_fetch_loop(
            stream.clone(),
            durable_name.clone(),
            cancel.clone(),
            Arc::clone(&active),
            Arc::clone(&last_acked),
            FetchTarget::Fanout(Arc::clone(&handlers)),
        );

        self.fanouts.lock().expect("fanouts poisoned").insert(
            key.clone(),
            FanoutEntry {
                consumer: durable_name.clone(),
                handlers,
                cancel: cancel.clone(),
            },
        );
        self.subscriptions.lock().expect("subscriptions poisoned").insert(
            id,
            SubEntry {
                stream: stream.clone(),
                consumer: durable_name.clone(),
                kind: SubKind::Fanout { key },
                cancel,
                active,
                last_acked,
            },
        );

        Ok(Subscription {
            id,
            stream,
            consumer: durable_name,
            subject_pattern: subject.to_owned(),
        })
    }

    /// Stop a subscription.  Idempotent: unknown ids succeed with no effect.
    pub async fn unsubscribe(&self, id: Uuid, delete_consumer: bool) -> Result<(), BusError> {
        let Some(entry) = self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .remove(&id)
        else {
            return Ok(());
        };
        entry.active.store(false, Ordering::SeqCst);

        match entry.kind {
            SubKind::Dedicated => {
                entry.cancel.cancel();
                if delete_consumer {
                    let _ = self.driver.delete_consumer(&entry.stream, &entry.consumer).await;
                }
            }
            SubKind::Fanout { key } => {
                let (drained, fanout_cancel) = {
                    let mut fanouts = self.fanouts.lock().expect("fanouts poisoned");
                    let drained = if let Some(fanout) = fanouts.get(&key) {
                        let mut handlers =
                            fanout.handlers.write().expect("fanout handlers poisoned");
                        handlers.remove(&id);
                        handlers.is_empty()
                    } else {
                        false
                    };
                    let fanout_cancel = if drained {
                        fanouts.remove(&key).map(|fanout| fanout.cancel)
                    } else {
                        None
                    };
                    (drained, fanout_cancel)
                };
                if let Some(cancel) = fanout_cancel {
                    cancel.cancel();
                }
                if drained && delete_consumer {
                    let _ = self
                        .driver
                        .delete_consumer(&entry.stream, &entry.consumer)
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Whether a subscription is still running.
    pub fn is_active(&self, id: Uuid) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .get(&id)
            .map(|e| e.active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Highest stream sequence acknowledged by a subscription's loop.
    pub fn last_acked(&self, id: Uuid) -> u64 {
        self.subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .get(&id)
            .map(|e| e.last_acked.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Cancel every subscription loop (used at shutdown; consumers survive).
    pub fn shutdown(&self) {
        for entry in self
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .values()
        {
            entry.active.store(false, Ordering::SeqCst);
            entry.cancel.cancel();
        }
        for fanout in self.fanouts.lock().expect("fanouts poisoned").values() {
            fanout.cancel.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Fetch loop
    // -----------------------------------------------------------------------

    fn spawn_fetch_loop(
        &self,
        stream: String,
        consumer: String,
        cancel: CancellationToken,
        active: Arc<AtomicBool>,
        last_acked: Arc<AtomicU64>,
        target: FetchTarget,
    ) {
        let driver = Arc::clone(&self.driver);
        let batch = self.settings.default_batch_size;
        let timeout = self.settings.fetch_timeout;
        let nak_delay = self.settings.nak_delay;

        tokio::spawn(async move {
            loop {
                let fetched = tokio::select! {
                    () = cancel.cancelled() => break,
                    r = driver.fetch(&stream, &consumer, batch, timeout) => r,
                };
                let messages = match fetched {
                    Ok(m) => m,
                    Err(BusError::ConsumerNotFound { .. }) | Err(BusError::StreamNotFound(_)) => {
                        debug!(stream = %stream, consumer = %consumer, "consumer gone, ending fetch loop");
                        break;
                    }
                    Err(e) => {
                        warn!(stream = %stream, consumer = %consumer, error = %e, "fetch failed, backing off");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        }
                    }
                };

                for raw in messages {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let sequence = raw.stream_sequence;
                    let msg = BusMessage {
                        subject: raw.subject,
                        payload: raw.payload,
                        headers: raw.headers,
                        stream_sequence: raw.stream_sequence,
                        consumer_sequence: raw.consumer_sequence,
                        timestamp: raw.timestamp,
                        delivery_count: raw.delivery_count,
                        stream: stream.clone(),
                        consumer: consumer.clone(),
                        ack_handle: AckHandle {
                            driver: Arc::clone(&driver),
                            stream: stream.clone(),
                            consumer: consumer.clone(),
                            stream_sequence: raw.stream_sequence,
                        },
                    };

                    let outcome = match &target {
                        FetchTarget::Single(handler) => handler(msg).await,
                        FetchTarget::Fanout(handlers) => {
                            let snapshot: Vec<MessageHandler> = handlers
                                .read()
                                .expect("fanout handlers poisoned")
                                .values()
                                .cloned()
                                .collect();
                            let mut result = Ok(());
                            for handler in snapshot {
                                if let Err(e) = handler(msg.clone()).await {
                                    result = Err(e);
                                }
                            }
                            result
                        }
                    };

                    match outcome {
                        Ok(()) => {
                            if let Err(e) = driver
                                .acknowledge(&stream, &consumer, sequence, crate::types::AckKind::Ack)
                                .await
                            {
                                warn!(stream = %stream, sequence, error = %e, "ack failed");
                            } else {
                                last_acked.store(sequence, Ordering::SeqCst);
                            }
                        }
                        Err(e) => {
                            debug!(stream = %stream, sequence, error = %e, "handler failed, nak");
                            let _ = driver
                                .acknowledge(
                                    &stream,
                                    &consumer,
                                    sequence,
                                    crate::types::AckKind::Nak(Some(nak_delay)),
                                )
                                .await;
                        }
                    }
                }
            }
            active.store(false, Ordering::SeqCst);
        });
    }
}

enum FetchTarget {
    Single(MessageHandler),
    Fanout(FanoutHandlers),
}

fn deliver_policy_for(replay: &ReplayMode) -> DeliverPolicy {
    match replay {
        ReplayMode::All | ReplayMode::ResumeFromLastAck => DeliverPolicy::All,
        ReplayMode::New => DeliverPolicy::New,
        ReplayMode::Last => DeliverPolicy::Last,
        ReplayMode::LastPerSubject => DeliverPolicy::LastPerSubject,
        ReplayMode::FromSequence { sequence } => DeliverPolicy::BySequence(*sequence),
        ReplayMode::FromTime { time } => DeliverPolicy::ByTime(*time),
    }
}

/// Durable-name-safe rendering of a subject pattern.
fn sanitize_subject(subject: &str) -> String {
    subject
        .chars()
        .map(|c| match c {
            '.' => '_',
            '*' => 's',
            '>' => 't',
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => c,
            _ => '-',
        })
        .collect()
}
