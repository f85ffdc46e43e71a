use crate::config::DatabaseConfig;
use crate::models::{CompressionRecord, CompressionStats, DetectedRegion, NewCompressionRecord};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Persistence for compression records.
///
/// Records are write-once: the store assigns `id` and `created_at` and
/// derives the compression ratio, and nothing updates or deletes them.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record and return it with its assigned identity
    async fn create(&self, record: NewCompressionRecord) -> Result<CompressionRecord>;

    /// Get a record by id
    async fn get(&self, id: Uuid) -> Result<Option<CompressionRecord>>;

    /// Get several records, in the order of `ids`. Unknown ids are skipped.
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<CompressionRecord>>;

    /// Most recent records, newest first
    async fn recent(&self, limit: i64) -> Result<Vec<CompressionRecord>>;

    /// Aggregate statistics
    async fn stats(&self) -> Result<CompressionStats>;

    /// Connectivity check for health reporting
    async fn ping(&self) -> Result<()>;

    /// Short backend name for health reporting
    fn backend(&self) -> &'static str;
}

/// Creation timestamp at the precision PostgreSQL keeps, so a record
/// compares equal before and after a round trip through the database.
fn created_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

const RECORD_COLUMNS: &str = r#"
    id, original_name, original_size, compressed_size, compression_ratio,
    original_path, compressed_path, detected_regions, format, quality,
    ai_suggestion, prompt_used, created_at
"#;

#[derive(Debug, FromRow)]
struct CompressionRecordRow {
    id: Uuid,
    original_name: String,
    original_size: i64,
    compressed_size: i64,
    compression_ratio: f64,
    original_path: String,
    compressed_path: String,
    detected_regions: Json<Vec<DetectedRegion>>,
    format: String,
    quality: i16,
    ai_suggestion: Option<String>,
    prompt_used: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CompressionRecordRow> for CompressionRecord {
    type Error = anyhow::Error;

    fn try_from(row: CompressionRecordRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            original_name: row.original_name,
            original_size: u64::try_from(row.original_size).context("negative original_size")?,
            compressed_size: u64::try_from(row.compressed_size)
                .context("negative compressed_size")?,
            compression_ratio: row.compression_ratio,
            original_path: row.original_path,
            compressed_path: row.compressed_path,
            detected_regions: row.detected_regions.0,
            format: row
                .format
                .parse()
                .map_err(|e| anyhow!("Corrupt record {}: {}", row.id, e))?,
            quality: u8::try_from(row.quality).context("quality out of range")?,
            ai_suggestion: row.ai_suggestion,
            prompt_used: row.prompt_used,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StatsRow {
    total_records: i64,
    total_original_bytes: i64,
    total_compressed_bytes: i64,
    average_ratio: f64,
}

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("database.url is not configured")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, record), fields(original_name = %record.original_name))]
    async fn create(&self, record: NewCompressionRecord) -> Result<CompressionRecord> {
        let record = record.into_record(Uuid::new_v4(), created_now());

        sqlx::query(
            r#"
            INSERT INTO compression_records (
                id, original_name, original_size, compressed_size, compression_ratio,
                original_path, compressed_path, detected_regions, format, quality,
                ai_suggestion, prompt_used, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                $11, $12, $13
            )
            "#,
        )
        .bind(record.id)
        .bind(&record.original_name)
        .bind(record.original_size as i64)
        .bind(record.compressed_size as i64)
        .bind(record.compression_ratio)
        .bind(&record.original_path)
        .bind(&record.compressed_path)
        .bind(Json(&record.detected_regions))
        .bind(record.format.as_str())
        .bind(i16::from(record.quality))
        .bind(&record.ai_suggestion)
        .bind(&record.prompt_used)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert compression record")?;

        debug!(
            record_id = %record.id,
            compression_ratio = record.compression_ratio,
            "Compression record stored"
        );

        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CompressionRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM compression_records WHERE id = $1");

        let row = sqlx::query_as::<_, CompressionRecordRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query compression record")?;

        row.map(CompressionRecord::try_from).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<CompressionRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!("SELECT {RECORD_COLUMNS} FROM compression_records WHERE id = ANY($1)");

        let rows = sqlx::query_as::<_, CompressionRecordRow>(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query compression records")?;

        let mut by_id: HashMap<Uuid, CompressionRecord> = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = CompressionRecord::try_from(row)?;
            by_id.insert(record.id, record);
        }

        Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<CompressionRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM compression_records \
             ORDER BY created_at DESC, id DESC LIMIT $1"
        );

        let rows = sqlx::query_as::<_, CompressionRecordRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query recent compression records")?;

        rows.into_iter().map(CompressionRecord::try_from).collect()
    }

    async fn stats(&self) -> Result<CompressionStats> {
        let stats: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*)::bigint as total_records,
                COALESCE(SUM(original_size), 0)::bigint as total_original_bytes,
                COALESCE(SUM(compressed_size), 0)::bigint as total_compressed_bytes,
                COALESCE(AVG(compression_ratio), 0)::float8 as average_ratio
            FROM compression_records
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to get compression stats")?;

        Ok(CompressionStats {
            total_records: stats.total_records,
            total_original_bytes: stats.total_original_bytes,
            total_compressed_bytes: stats.total_compressed_bytes,
            average_ratio: (stats.average_ratio * 100.0).round() / 100.0,
        })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Process-local record store, used when no database is configured and in tests
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<CompressionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: NewCompressionRecord) -> Result<CompressionRecord> {
        let record = record.into_record(Uuid::new_v4(), created_now());
        self.records.write().push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CompressionRecord>> {
        Ok(self.records.read().iter().find(|r| r.id == id).cloned())
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<CompressionRecord>> {
        let records = self.records.read();
        Ok(ids
            .iter()
            .filter_map(|id| records.iter().find(|r| r.id == *id).cloned())
            .collect())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<CompressionRecord>> {
        // Reverse insertion order breaks timestamp ties
        let mut records: Vec<CompressionRecord> =
            self.records.read().iter().rev().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(records)
    }

    async fn stats(&self) -> Result<CompressionStats> {
        let records = self.records.read();
        let total_records = records.len() as i64;
        let total_original_bytes = records.iter().map(|r| r.original_size as i64).sum();
        let total_compressed_bytes = records.iter().map(|r| r.compressed_size as i64).sum();
        let average_ratio = if records.is_empty() {
            0.0
        } else {
            let sum: f64 = records.iter().map(|r| r.compression_ratio).sum();
            (sum / records.len() as f64 * 100.0).round() / 100.0
        };

        Ok(CompressionStats {
            total_records,
            total_original_bytes,
            total_compressed_bytes,
            average_ratio,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutputFormat;

    fn new_record(name: &str, original_size: u64, compressed_size: u64) -> NewCompressionRecord {
        NewCompressionRecord {
            original_name: name.to_string(),
            original_size,
            compressed_size,
            original_path: format!("original-{name}"),
            compressed_path: format!("compressed-webp-{name}"),
            detected_regions: vec![],
            format: OutputFormat::Webp,
            quality: 70,
            ai_suggestion: None,
            prompt_used: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_ratio() {
        let store = MemoryRecordStore::new();
        let record = store.create(new_record("a.png", 400, 100)).await.unwrap();

        assert_eq!(record.compression_ratio, 75.0);
        assert_eq!(store.get(record.id).await.unwrap(), Some(record.clone()));
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_created_at_has_microsecond_precision() {
        let store = MemoryRecordStore::new();
        for i in 0..20 {
            let record = store
                .create(new_record(&format!("{i}.png"), 100, 50))
                .await
                .unwrap();
            assert_eq!(record.created_at.timestamp_subsec_nanos() % 1_000, 0);
        }
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_limited() {
        let store = MemoryRecordStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let record = store
                .create(new_record(&format!("{i}.png"), 100, 50))
                .await
                .unwrap();
            ids.push(record.id);
        }

        let recent = store.recent(3).await.unwrap();
        let recent_ids: Vec<Uuid> = recent.iter().map(|r| r.id).collect();
        assert_eq!(recent_ids, vec![ids[4], ids[3], ids[2]]);

        let again = store.recent(3).await.unwrap();
        assert_eq!(recent, again);
    }

    #[tokio::test]
    async fn test_get_many_keeps_request_order_and_skips_unknown() {
        let store = MemoryRecordStore::new();
        let a = store.create(new_record("a.png", 100, 50)).await.unwrap();
        let b = store.create(new_record("b.png", 100, 50)).await.unwrap();

        let found = store
            .get_many(&[b.id, Uuid::new_v4(), a.id])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, b.id);
        assert_eq!(found[1].id, a.id);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.stats().await.unwrap(), CompressionStats::default());

        store.create(new_record("a.png", 100, 50)).await.unwrap();
        store.create(new_record("b.png", 300, 75)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.total_original_bytes, 400);
        assert_eq!(stats.total_compressed_bytes, 125);
        assert_eq!(stats.average_ratio, 62.5);
    }
}
