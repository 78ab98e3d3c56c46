// fb-historian: back-pressured ingestion from the bus into the time-series
// store.
//
// Consumer loops pull from the durable log, the normalizer decodes the three
// payload families into typed records, bounded channels feed batching
// writers, and every committed batch is recorded in a hash-chained audit
// log.

pub mod audit;
pub mod normalize;
pub mod pipeline;
pub mod records;
pub mod store;
pub mod writer;

pub use audit::{AuditActor, AuditAction, AuditChain, AuditEntry, AuditEvent, GENESIS};
pub use normalize::Normalizer;
pub use pipeline::HistorianPipeline;
pub use records::{EventRecord, QualityRecord, QualityResult, TelemetryRecord};
pub use store::{HistorianStore, MemoryStore, PgStore, StoreError};
pub use writer::HistorianWriter;
