//! Persistence seam for the historian.
//!
//! `PgStore` targets Postgres/Timescale through sqlx with conflict-ignore
//! batch inserts and an append-only audit table (UPDATE/DELETE rejected by
//! trigger).  `MemoryStore` implements the same contract in-process for
//! tests and the `memory` connection mode.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use crate::audit::AuditEntry;
use crate::records::{EventRecord, QualityRecord, TelemetryRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("audit log is append-only: {0}")]
    AppendOnly(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Batched, conflict-ignoring persistence for historian rows plus the audit
/// chain tail.
#[async_trait]
pub trait HistorianStore: Send + Sync {
    /// Insert a batch in one transaction; duplicate keys are skipped.
    /// Returns the number of rows actually written.
    async fn insert_telemetry(&self, batch: &[TelemetryRecord]) -> Result<u64, StoreError>;
    async fn insert_events(&self, batch: &[EventRecord]) -> Result<u64, StoreError>;
    async fn insert_quality(&self, batch: &[QualityRecord]) -> Result<u64, StoreError>;

    /// Checksum of the newest audit entry, None for an empty log.
    async fn audit_tail_checksum(&self) -> Result<Option<String>, StoreError>;

    /// Persist one audit entry (insert-only) and return it with its id.
    async fn append_audit(&self, entry: AuditEntry) -> Result<AuditEntry, StoreError>;

    /// Entries with `from_id <= id <= to_id`, ascending.  None bounds are
    /// open.
    async fn load_audit_range(
        &self,
        from_id: Option<i64>,
        to_id: Option<i64>,
    ) -> Result<Vec<AuditEntry>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(PgStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl HistorianStore for PgStore {
    async fn insert_telemetry(&self, batch: &[TelemetryRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for r in batch {
            let result = sqlx::query(
                r#"INSERT INTO telemetry
                       (time, device_id, line_id, batch_id, metric_name, value, unit, quality_code, checksum)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (time, device_id, metric_name) DO NOTHING"#,
            )
            .bind(r.time)
            .bind(&r.device_id)
            .bind(&r.line_id)
            .bind(&r.batch_id)
            .bind(&r.metric_name)
            .bind(r.value)
            .bind(&r.unit)
            .bind(r.quality_code)
            .bind(&r.checksum)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn insert_events(&self, batch: &[EventRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for r in batch {
            let result = sqlx::query(
                r#"INSERT INTO events
                       (id, time, device_id, line_id, batch_id, event_type, severity, payload,
                        correlation_id, causation_id, previous_hash, checksum)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                   ON CONFLICT (id, time) DO NOTHING"#,
            )
            .bind(r.id)
            .bind(r.time)
            .bind(&r.device_id)
            .bind(&r.line_id)
            .bind(&r.batch_id)
            .bind(&r.event_type)
            .bind(&r.severity)
            .bind(&r.payload)
            .bind(&r.correlation_id)
            .bind(&r.causation_id)
            .bind(&r.previous_hash)
            .bind(&r.checksum)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn insert_quality(&self, batch: &[QualityRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for r in batch {
            let result = sqlx::query(
                r#"INSERT INTO quality_inspections
                       (id, time, device_id, line_id, batch_id, product_id, result, defect_type,
                        measurements, image_ref, checksum)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                   ON CONFLICT (id, time) DO NOTHING"#,
            )
            .bind(r.id)
            .bind(r.time)
            .bind(&r.device_id)
            .bind(&r.line_id)
            .bind(&r.batch_id)
            .bind(&r.product_id)
            .bind(r.result.as_str())
            .bind(&r.defect_type)
            .bind(&r.measurements)
            .bind(&r.image_ref)
            .bind(&r.checksum)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn audit_tail_checksum(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT checksum FROM audit_log ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("checksum")))
    }

    async fn append_audit(&self, mut entry: AuditEntry) -> Result<AuditEntry, StoreError> {
        let actor_json = entry
            .actor
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let row = sqlx::query(
            r#"INSERT INTO audit_log
                   (timestamp, actor, action, resource_type, resource_id, old_value, new_value,
                    reason, metadata, checksum, previous_hash)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               RETURNING id"#,
        )
        .bind(entry.timestamp)
        .bind(actor_json)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(&entry.reason)
        .bind(&entry.metadata)
        .bind(&entry.checksum)
        .bind(&entry.previous_hash)
        .fetch_one(&self.pool)
        .await?;
        entry.id = row.get::<i64, _>("id");
        Ok(entry)
    }

    async fn load_audit_range(
        &self,
        from_id: Option<i64>,
        to_id: Option<i64>,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, timestamp, actor, action, resource_type, resource_id, old_value,
                      new_value, reason, metadata, checksum, previous_hash
               FROM audit_log
               WHERE ($1::bigint IS NULL OR id >= $1)
                 AND ($2::bigint IS NULL OR id <= $2)
               ORDER BY id ASC"#,
        )
        .bind(from_id)
        .bind(to_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let actor: Option<serde_json::Value> = row.get("actor");
            entries.push(AuditEntry {
                id: row.get("id"),
                timestamp: row.get("timestamp"),
                actor: actor
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| StoreError::Database(e.to_string()))?,
                action: row.get("action"),
                resource_type: row.get("resource_type"),
                resource_id: row.get("resource_id"),
                old_value: row.get("old_value"),
                new_value: row.get("new_value"),
                reason: row.get("reason"),
                metadata: row.get("metadata"),
                checksum: row.get("checksum"),
                previous_hash: row.get("previous_hash"),
            });
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    telemetry: Vec<TelemetryRecord>,
    telemetry_keys: HashSet<(i64, String, String)>,
    events: Vec<EventRecord>,
    event_ids: HashSet<uuid::Uuid>,
    quality: Vec<QualityRecord>,
    quality_ids: HashSet<uuid::Uuid>,
    audit: Vec<AuditEntry>,
    next_audit_id: i64,
}

/// Same contract as `PgStore`, in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: StdMutex<MemoryInner>,
    fail_next_inserts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Make the next `n` batch inserts fail, for retry-path tests.
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_next_inserts.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<(), StoreError> {
        if self
            .fail_next_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Database("injected failure".to_owned()));
        }
        Ok(())
    }

    pub fn telemetry_rows(&self) -> Vec<TelemetryRecord> {
        self.inner.lock().expect("store poisoned").telemetry.clone()
    }

    pub fn event_rows(&self) -> Vec<EventRecord> {
        self.inner.lock().expect("store poisoned").events.clone()
    }

    pub fn quality_rows(&self) -> Vec<QualityRecord> {
        self.inner.lock().expect("store poisoned").quality.clone()
    }

    pub fn audit_rows(&self) -> Vec<AuditEntry> {
        self.inner.lock().expect("store poisoned").audit.clone()
    }

    /// Out-of-band mutation, standing in for direct SQL tampering in the
    /// tamper-detection tests.
    pub fn tamper_audit_entry(&self, id: i64, mutate: impl FnOnce(&mut AuditEntry)) -> bool {
        let mut inner = self.inner.lock().expect("store poisoned");
        match inner.audit.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                mutate(entry);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl HistorianStore for MemoryStore {
    async fn insert_telemetry(&self, batch: &[TelemetryRecord]) -> Result<u64, StoreError> {
        self.maybe_fail()?;
        let mut inner = self.inner.lock().expect("store poisoned");
        let mut written = 0u64;
        for r in batch {
            let key = (
                r.time.timestamp_micros(),
                r.device_id.clone(),
                r.metric_name.clone(),
            );
            if inner.telemetry_keys.insert(key) {
                inner.telemetry.push(r.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn insert_events(&self, batch: &[EventRecord]) -> Result<u64, StoreError> {
        self.maybe_fail()?;
        let mut inner = self.inner.lock().expect("store poisoned");
        let mut written = 0u64;
        for r in batch {
            if inner.event_ids.insert(r.id) {
                inner.events.push(r.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn insert_quality(&self, batch: &[QualityRecord]) -> Result<u64, StoreError> {
        self.maybe_fail()?;
        let mut inner = self.inner.lock().expect("store poisoned");
        let mut written = 0u64;
        for r in batch {
            if inner.quality_ids.insert(r.id) {
                inner.quality.push(r.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn audit_tail_checksum(&self) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner.audit.last().map(|e| e.checksum.clone()))
    }

    async fn append_audit(&self, mut entry: AuditEntry) -> Result<AuditEntry, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.next_audit_id += 1;
        entry.id = inner.next_audit_id;
        inner.audit.push(entry.clone());
        Ok(entry)
    }

    async fn load_audit_range(
        &self,
        from_id: Option<i64>,
        to_id: Option<i64>,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .audit
            .iter()
            .filter(|e| from_id.is_none_or(|f| e.id >= f) && to_id.is_none_or(|t| e.id <= t))
            .cloned()
            .collect())
    }
}
