use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use super::{Outage, SpeedtestSample, Storage, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS outages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    duration_seconds REAL
);
CREATE INDEX IF NOT EXISTS idx_outages_service_open ON outages(service, end_time);
CREATE TABLE IF NOT EXISTS latency_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    ts TEXT NOT NULL,
    success INTEGER NOT NULL,
    latency_ms REAL
);
CREATE INDEX IF NOT EXISTS idx_latency_service_id ON latency_samples(service, id);
CREATE TABLE IF NOT EXISTS speedtest_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    ts TEXT NOT NULL,
    download_mbps REAL NOT NULL,
    upload_mbps REAL NOT NULL,
    ping_ms REAL NOT NULL,
    server TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_speedtest_service_ts ON speedtest_samples(service, ts);
";

/// SQLite-backed store. Timestamps are persisted as RFC 3339 UTC strings.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).await?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;
        let store = Self { conn };
        store.init_schema().await?;
        info!(path = %path.display(), "Opened SQLite store");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        self.conn
            .call(|conn: &mut rusqlite::Connection| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All outages of a service, oldest first.
    pub async fn list_outages(&self, service: &str) -> Result<Vec<Outage>, StorageError> {
        let service = service.to_string();
        let rows = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT id, service, start_time, end_time, duration_seconds
                     FROM outages WHERE service = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![service], raw_outage)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawOutage::into_outage).collect()
    }

    pub async fn count_latency_samples(&self, service: &str) -> Result<usize, StorageError> {
        let service = service.to_string();
        let n = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM latency_samples WHERE service = ?1",
                    rusqlite::params![service],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

struct RawOutage {
    id: i64,
    service: String,
    start_time: String,
    end_time: Option<String>,
    duration_seconds: Option<f64>,
}

fn raw_outage(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawOutage> {
    Ok(RawOutage {
        id: row.get(0)?,
        service: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        duration_seconds: row.get(4)?,
    })
}

impl RawOutage {
    fn into_outage(self) -> Result<Outage, StorageError> {
        Ok(Outage {
            id: self.id,
            service: self.service,
            start_time: parse_ts(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_ts).transpose()?,
            duration_seconds: self.duration_seconds,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            table: "outages",
            message: format!("bad timestamp '{}': {}", s, e),
        })
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[async_trait]
impl Storage for SqliteStore {
    async fn create_outage(
        &self,
        service: &str,
        start_time: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let service = service.to_string();
        let start = ts(start_time);
        let id = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT INTO outages (service, start_time) VALUES (?1, ?2)",
                    rusqlite::params![service, start],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    async fn end_outage(
        &self,
        id: i64,
        end_time: DateTime<Utc>,
        duration_seconds: f64,
    ) -> Result<(), StorageError> {
        let end = ts(end_time);
        let updated = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let n = conn.execute(
                    "UPDATE outages SET end_time = ?1, duration_seconds = ?2 WHERE id = ?3",
                    rusqlite::params![end, duration_seconds, id],
                )?;
                Ok(n)
            })
            .await?;
        if updated == 0 {
            return Err(StorageError::OutageNotFound(id));
        }
        Ok(())
    }

    async fn get_open_outage(&self, service: &str) -> Result<Option<Outage>, StorageError> {
        let service = service.to_string();
        let raw = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let row = conn
                    .query_row(
                        "SELECT id, service, start_time, end_time, duration_seconds
                         FROM outages WHERE service = ?1 AND end_time IS NULL
                         ORDER BY id DESC LIMIT 1",
                        rusqlite::params![service],
                        raw_outage,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        raw.map(RawOutage::into_outage).transpose()
    }

    async fn append_latency_sample(
        &self,
        service: &str,
        timestamp: DateTime<Utc>,
        success: bool,
        latency_ms: Option<f64>,
    ) -> Result<(), StorageError> {
        let service = service.to_string();
        let at = ts(timestamp);
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT INTO latency_samples (service, ts, success, latency_ms)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![service, at, success, latency_ms],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn append_speedtest_sample(&self, sample: &SpeedtestSample) -> Result<(), StorageError> {
        let sample = sample.clone();
        self.conn
            .call(move |conn: &mut rusqlite::Connection| {
                conn.execute(
                    "INSERT INTO speedtest_samples
                     (service, ts, download_mbps, upload_mbps, ping_ms, server)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        sample.service,
                        ts(sample.timestamp),
                        sample.download_mbps,
                        sample.upload_mbps,
                        sample.ping_ms,
                        sample.server,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn prune_latency_samples(
        &self,
        service: &str,
        keep_count: usize,
    ) -> Result<usize, StorageError> {
        let owned = service.to_string();
        let keep = i64::try_from(keep_count).unwrap_or(i64::MAX);
        let removed = self
            .conn
            .call(move |conn: &mut rusqlite::Connection| {
                let service = owned;
                let cutoff: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM latency_samples WHERE service = ?1
                         ORDER BY id DESC LIMIT 1 OFFSET ?2",
                        rusqlite::params![service, keep],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(cutoff) = cutoff else {
                    return Ok(0);
                };
                let n = conn.execute(
                    "DELETE FROM latency_samples WHERE service = ?1 AND id <= ?2",
                    rusqlite::params![service, cutoff],
                )?;
                Ok(n)
            })
            .await?;
        debug!(service, removed, "Pruned latency samples");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn outage_lifecycle_round_trips_timestamps() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        let end = start + Duration::seconds(42);

        let id = store.create_outage("wan", start).await.unwrap();
        let open = store.get_open_outage("wan").await.unwrap().unwrap();
        assert_eq!(open.id, id);
        assert_eq!(open.start_time, start);
        assert!(open.is_open());

        store.end_outage(id, end, 42.0).await.unwrap();
        assert!(store.get_open_outage("wan").await.unwrap().is_none());

        let all = store.list_outages("wan").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].end_time, Some(end));
        assert_eq!(all[0].duration_seconds, Some(42.0));
    }

    #[tokio::test]
    async fn end_unknown_outage_is_not_found() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let err = store.end_outage(7, Utc::now(), 1.0).await.unwrap_err();
        assert!(matches!(err, StorageError::OutageNotFound(7)));
    }

    #[tokio::test]
    async fn prune_only_touches_one_service() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        for i in 0..6 {
            let at = t0 + Duration::seconds(i);
            store.append_latency_sample("a", at, true, Some(1.5)).await.unwrap();
            store.append_latency_sample("b", at, false, None).await.unwrap();
        }

        assert_eq!(store.prune_latency_samples("a", 4).await.unwrap(), 2);
        assert_eq!(store.count_latency_samples("a").await.unwrap(), 4);
        assert_eq!(store.count_latency_samples("b").await.unwrap(), 6);
        assert_eq!(store.prune_latency_samples("a", 4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_store_persists_open_outage_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upwatch.sqlite3");
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let id = {
            let store = SqliteStore::open(&path).await.unwrap();
            store.create_outage("dns", start).await.unwrap()
        };

        let store = SqliteStore::open(&path).await.unwrap();
        let open = store.get_open_outage("dns").await.unwrap().unwrap();
        assert_eq!(open.id, id);
        assert_eq!(open.start_time, start);
    }

    #[tokio::test]
    async fn speedtest_sample_insert_succeeds() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let sample = SpeedtestSample {
            timestamp: Utc::now(),
            service: "wan".into(),
            download_mbps: 93.4,
            upload_mbps: 11.2,
            ping_ms: 14.0,
            server: "Example ISP (Berlin)".into(),
        };
        store.append_speedtest_sample(&sample).await.unwrap();
    }
}
