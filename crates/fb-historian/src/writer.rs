//! Batching writers: one bounded channel and worker loop per payload family.
//!
//! A batch closes when `batch_size` records are queued or `batch_timeout`
//! elapses since the first record.  Each batch is one transactional
//! conflict-ignore insert, retried once; a second failure drops the batch
//! and counts it.  Bus-side persistence remains the authoritative record,
//! which is why dropping here is tolerable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::audit::{AuditAction, AuditChain, AuditEvent};
use crate::records::{EventRecord, QualityRecord, TelemetryRecord};
use crate::store::{HistorianStore, StoreError};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub queue_size: usize,
    pub enable_audit_logging: bool,
}

impl From<&fb_core::config::HistorianConfig> for WriterConfig {
    fn from(cfg: &fb_core::config::HistorianConfig) -> Self {
        WriterConfig {
            batch_size: cfg.batch_size,
            batch_timeout: cfg.batch_timeout,
            queue_size: cfg.writer_queue_size,
            enable_audit_logging: cfg.enable_audit_logging,
        }
    }
}

/// Writer throughput and loss counters, exported on the metrics surface.
#[derive(Debug, Default)]
pub struct WriterCounters {
    pub batches_written: AtomicU64,
    pub records_written: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub records_dropped: AtomicU64,
}

/// The three family channels plus their worker loops.
pub struct HistorianWriter {
    pub telemetry_tx: mpsc::Sender<TelemetryRecord>,
    pub event_tx: mpsc::Sender<EventRecord>,
    pub quality_tx: mpsc::Sender<QualityRecord>,
    counters: Arc<WriterCounters>,
    tasks: Vec<JoinHandle<()>>,
}

impl HistorianWriter {
    pub fn spawn(
        store: Arc<dyn HistorianStore>,
        audit: Option<Arc<AuditChain>>,
        config: WriterConfig,
        cancel: CancellationToken,
    ) -> Self {
        let counters = Arc::new(WriterCounters::default());

        let (telemetry_tx, telemetry_rx) = mpsc::channel(config.queue_size);
        let (event_tx, event_rx) = mpsc::channel(config.queue_size);
        let (quality_tx, quality_rx) = mpsc::channel(config.queue_size);

        let insert_telemetry: InsertFn<TelemetryRecord> = Arc::new(|store, batch| {
            Box::pin(async move { store.insert_telemetry(&batch).await })
        });
        let insert_events: InsertFn<EventRecord> =
            Arc::new(|store, batch| Box::pin(async move { store.insert_events(&batch).await }));
        let insert_quality: InsertFn<QualityRecord> =
            Arc::new(|store, batch| Box::pin(async move { store.insert_quality(&batch).await }));

        let tasks = vec![
            spawn_worker(
                "telemetry",
                telemetry_rx,
                config.clone(),
                Arc::clone(&store),
                audit.clone(),
                Arc::clone(&counters),
                cancel.clone(),
                insert_telemetry,
            ),
            spawn_worker(
                "events",
                event_rx,
                config.clone(),
                Arc::clone(&store),
                audit.clone(),
                Arc::clone(&counters),
                cancel.clone(),
                insert_events,
            ),
            spawn_worker(
                "quality_inspections",
                quality_rx,
                config,
                store,
                audit,
                Arc::clone(&counters),
                cancel,
                insert_quality,
            ),
        ];

        HistorianWriter {
            telemetry_tx,
            event_tx,
            quality_tx,
            counters,
            tasks,
        }
    }

    pub fn counters(&self) -> Arc<WriterCounters> {
        Arc::clone(&self.counters)
    }

    /// Wait for the worker loops to finish (after cancellation or channel
    /// closure).  Pending batches are flushed on the way out.
    pub async fn join(self) {
        drop(self.telemetry_tx);
        drop(self.event_tx);
        drop(self.quality_tx);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

type InsertFuture = futures::future::BoxFuture<'static, Result<u64, StoreError>>;
type InsertFn<T> =
    Arc<dyn Fn(Arc<dyn HistorianStore>, Vec<T>) -> InsertFuture + Send + Sync>;

#[allow(clippy::too_many_arguments)]
fn spawn_worker<T>(
    family: &'static str,
    mut rx: mpsc::Receiver<T>,
    config: WriterConfig,
    store: Arc<dyn HistorianStore>,
    audit: Option<Arc<AuditChain>>,
    counters: Arc<WriterCounters>,
    cancel: CancellationToken,
    insert: InsertFn<T>,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            // Wait for the batch-opening record.
            let first = tokio::select! {
                () = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + config.batch_timeout;

            // Fill until size or timeout.
            let mut closing = false;
            while batch.len() < config.batch_size {
                tokio::select! {
                    () = cancel.cancelled() => { closing = true; break; }
                    item = rx.recv() => match item {
                        Some(item) => batch.push(item),
                        None => { closing = true; break; }
                    },
                    () = tokio::time::sleep_until(deadline) => break,
                }
            }

            flush(family, batch, &config, &store, audit.as_deref(), &counters, &insert).await;
            if closing {
                break;
            }
        }
        // Channel may still hold records delivered before cancellation.
        let mut rest = Vec::new();
        while let Ok(item) = rx.try_recv() {
            rest.push(item);
        }
        if !rest.is_empty() {
            flush(family, rest, &config, &store, audit.as_deref(), &counters, &insert).await;
        }
        debug!(family, "writer worker stopped");
    })
}

async fn flush<T>(
    family: &'static str,
    batch: Vec<T>,
    config: &WriterConfig,
    store: &Arc<dyn HistorianStore>,
    audit: Option<&AuditChain>,
    counters: &WriterCounters,
    insert: &InsertFn<T>,
) where
    T: Clone + Send + 'static,
{
    if batch.is_empty() {
        return;
    }
    let count = batch.len() as u64;

    let written = match insert(Arc::clone(store), batch.clone()).await {
        Ok(written) => written,
        Err(e) => {
            warn!(family, error = %e, "batch insert failed, retrying once");
            match insert(Arc::clone(store), batch).await {
                Ok(written) => written,
                Err(e) => {
                    error!(family, records = count, error = %e, "batch dropped after retry");
                    counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    counters.records_dropped.fetch_add(count, Ordering::Relaxed);
                    return;
                }
            }
        }
    };

    counters.batches_written.fetch_add(1, Ordering::Relaxed);
    counters.records_written.fetch_add(written, Ordering::Relaxed);
    debug!(family, records = count, written, "batch committed");

    if config.enable_audit_logging {
        if let Some(audit) = audit {
            let event = AuditEvent::new(AuditAction::Ingest, family)
                .metadata(serde_json::json!({ "records": count, "written": written }));
            if let Err(e) = audit.append(event).await {
                // Integrity over availability: the append is halted and the
                // failure surfaces loudly instead of advancing the chain.
                error!(family, error = %e, "audit append failed for committed batch");
            }
        }
    }
}
