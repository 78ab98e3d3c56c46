//! Wiring: bus consumers → normalizer → writer channels.
//!
//! The normalizer hands records to the writer with a blocking send, so a
//! slow writer slows the fetch loop, delays acknowledgement, and eventually
//! triggers redelivery — at-least-once end to end.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fb_bus::adapter::MessageHandler;
use fb_bus::{BusAdapter, BusError, ConsumerConfig, Subscription};
use fb_core::config::{DataType, HistorianConfig};

use crate::audit::AuditChain;
use crate::normalize::Normalizer;
use crate::store::HistorianStore;
use crate::writer::{HistorianWriter, WriterConfig, WriterCounters};

/// The running ingestion side of the historian.
pub struct HistorianPipeline {
    subscriptions: Vec<Subscription>,
    writer: HistorianWriter,
    audit: Option<Arc<AuditChain>>,
}

impl HistorianPipeline {
    /// Provision the configured consumers and start one fetch loop per
    /// enabled family consumer plus the three writer workers.
    pub async fn start(
        adapter: Arc<BusAdapter>,
        store: Arc<dyn HistorianStore>,
        config: &HistorianConfig,
        cancel: CancellationToken,
    ) -> Result<Self, BusError> {
        let audit = config
            .enable_audit_logging
            .then(|| Arc::new(AuditChain::new(Arc::clone(&store))));
        let writer = HistorianWriter::spawn(
            Arc::clone(&store),
            audit.clone(),
            WriterConfig::from(config),
            cancel.clone(),
        );
        let normalizer = Normalizer::new(config.enable_integrity_checks);

        let mut subscriptions = Vec::new();
        for spec in config.consumers.iter().filter(|c| c.enabled) {
            adapter
                .get_or_create_consumer(
                    &spec.stream,
                    ConsumerConfig::pull(spec.name.clone(), spec.filter_subject.clone()),
                )
                .await?;

            let handler = family_handler(spec.data_type, normalizer, &writer);
            let subscription = adapter.subscribe(&spec.stream, &spec.name, handler).await?;
            info!(
                consumer = %spec.name,
                stream = %spec.stream,
                data_type = ?spec.data_type,
                "historian consumer started"
            );
            subscriptions.push(subscription);
        }

        Ok(HistorianPipeline {
            subscriptions,
            writer,
            audit,
        })
    }

    pub fn writer_counters(&self) -> Arc<WriterCounters> {
        self.writer.counters()
    }

    pub fn audit_chain(&self) -> Option<Arc<AuditChain>> {
        self.audit.clone()
    }

    /// Stop the fetch loops (durable consumers survive for resume) and
    /// flush the writers.
    pub async fn shutdown(self, adapter: &BusAdapter) {
        for sub in &self.subscriptions {
            let _ = adapter.unsubscribe(sub.id, false).await;
        }
        self.writer.join().await;
    }
}

/// Normalize-and-enqueue handler for one payload family.
///
/// Undecodable payloads are logged and acknowledged — redelivery cannot fix
/// a malformed message.  A closed writer channel fails the handler so the
/// message is redelivered once the writer is back.
fn family_handler(
    data_type: DataType,
    normalizer: Normalizer,
    writer: &HistorianWriter,
) -> MessageHandler {
    match data_type {
        DataType::Telemetry => {
            let tx = writer.telemetry_tx.clone();
            Arc::new(move |msg| {
                let tx = tx.clone();
                Box::pin(async move {
                    match normalizer.telemetry(&msg) {
                        Ok(records) => {
                            for record in records {
                                tx.send(record)
                                    .await
                                    .map_err(|_| "telemetry writer channel closed")?;
                            }
                            Ok(())
                        }
                        Err(e) => {
                            warn!(subject = %msg.subject, error = %e, "undecodable telemetry, skipping");
                            Ok(())
                        }
                    }
                })
            })
        }
        DataType::Event | DataType::Alert => {
            let tx = writer.event_tx.clone();
            Arc::new(move |msg| {
                let tx = tx.clone();
                Box::pin(async move {
                    match normalizer.event(&msg) {
                        Ok(record) => {
                            tx.send(record)
                                .await
                                .map_err(|_| "event writer channel closed")?;
                            Ok(())
                        }
                        Err(e) => {
                            warn!(subject = %msg.subject, error = %e, "undecodable event, skipping");
                            Ok(())
                        }
                    }
                })
            })
        }
        DataType::QualityInspection => {
            let tx = writer.quality_tx.clone();
            Arc::new(move |msg| {
                let tx = tx.clone();
                Box::pin(async move {
                    match normalizer.quality(&msg) {
                        Ok(record) => {
                            tx.send(record)
                                .await
                                .map_err(|_| "quality writer channel closed")?;
                            Ok(())
                        }
                        Err(e) => {
                            warn!(subject = %msg.subject, error = %e, "undecodable inspection, skipping");
                            Ok(())
                        }
                    }
                })
            })
        }
    }
}
