use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::models::{AggregateMetadata, ServiceRequestRecord, TokenPair};

/// Persistence contract for referrals and the aggregate counter
///
/// Records are only ever inserted or stamped as notified; nothing here
/// updates or deletes an existing row otherwise.
pub trait RecordStore: Send + Sync {
    fn find_all_ids(&self) -> Result<HashSet<String>>;

    /// Insert records whose id is not stored yet; returns the ids actually inserted
    fn bulk_create(&self, records: &[ServiceRequestRecord]) -> Result<Vec<String>>;

    /// Stamp `notified_at` on records that do not have it yet; returns how many changed
    fn update_notified(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize>;

    fn find_by_id(&self, id: &str) -> Result<Option<ServiceRequestRecord>>;

    /// Most recently notified record, if any
    fn find_last_notified(&self) -> Result<Option<ServiceRequestRecord>>;

    fn count(&self) -> Result<u64>;

    fn upsert_metadata(&self, total_records_seen_upstream: u64) -> Result<AggregateMetadata>;

    fn metadata(&self) -> Result<Option<AggregateMetadata>>;
}

/// Persistence contract for session tokens
pub trait TokenRepository: Send + Sync {
    /// Persist a new pair; every older pair stops being a candidate for reuse
    fn insert_token(&self, pair: &TokenPair) -> Result<()>;

    /// Newest pair that was neither invalidated nor superseded. Expiry is the caller's call.
    fn latest_active_token(&self) -> Result<Option<TokenPair>>;

    /// Logically delete the pair holding `access_token`; returns how many rows changed
    fn invalidate_token(&self, access_token: &str, at: DateTime<Utc>) -> Result<usize>;
}

/// Store manager using SQLite
///
/// A single connection behind a mutex: the poll loop is the only writer and
/// SQLite handles readers from other processes on its own.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const RECORD_COLUMNS: &str = "id, status, patient_id, patient_name, provider_type, referral_type,
     referred_by_unit, referred_to_unit, created_on, referral_sent_at, response_received_at,
     requested_by_name, requested_by_email, requested_by_phone, notified_at";

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidRecord(format!(
                        "cannot create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        debug!(path = %path.display(), "opened record store");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS service_requests (
                id TEXT PRIMARY KEY,
                status TEXT,
                patient_id TEXT,
                patient_name TEXT NOT NULL,
                provider_type TEXT,
                referral_type TEXT,
                referred_by_unit TEXT,
                referred_to_unit TEXT,
                created_on TEXT,
                referral_sent_at TEXT,
                response_received_at TEXT,
                requested_by_name TEXT,
                requested_by_email TEXT,
                requested_by_phone TEXT,
                notified_at TEXT
            );

            CREATE TABLE IF NOT EXISTS tokens (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                invalidated_at TEXT,
                superseded_at TEXT
            );

            CREATE TABLE IF NOT EXISTS metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_records_seen_upstream INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceRequestRecord> {
    Ok(ServiceRequestRecord {
        id: row.get(0)?,
        status: row.get(1)?,
        patient_id: row.get(2)?,
        patient_name: row.get(3)?,
        provider_type: row.get(4)?,
        referral_type: row.get(5)?,
        referred_by_unit: row.get(6)?,
        referred_to_unit: row.get(7)?,
        created_on: row.get(8)?,
        referral_sent_at: row.get(9)?,
        response_received_at: row.get(10)?,
        requested_by_name: row.get(11)?,
        requested_by_email: row.get(12)?,
        requested_by_phone: row.get(13)?,
        notified_at: row.get(14)?,
    })
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<TokenPair> {
    Ok(TokenPair {
        id: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        expires_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<AggregateMetadata> {
    let total: i64 = row.get(0)?;
    Ok(AggregateMetadata {
        total_records_seen_upstream: total.max(0) as u64,
        updated_at: row.get(1)?,
    })
}

impl RecordStore for SqliteStore {
    fn find_all_ids(&self) -> Result<HashSet<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM service_requests")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    }

    fn bulk_create(&self, records: &[ServiceRequestRecord]) -> Result<Vec<String>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO service_requests ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                RECORD_COLUMNS
            ))?;

            for record in records {
                if record.id.is_empty() {
                    return Err(StoreError::InvalidRecord("empty service request id".into()));
                }
                let changed = stmt.execute(params![
                    record.id,
                    record.status,
                    record.patient_id,
                    record.patient_name,
                    record.provider_type,
                    record.referral_type,
                    record.referred_by_unit,
                    record.referred_to_unit,
                    record.created_on,
                    record.referral_sent_at,
                    record.response_received_at,
                    record.requested_by_name,
                    record.requested_by_email,
                    record.requested_by_phone,
                    record.notified_at,
                ])?;
                if changed > 0 {
                    inserted.push(record.id.clone());
                }
            }
        }
        tx.commit()?;

        Ok(inserted)
    }

    fn update_notified(&self, ids: &[String], at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE service_requests SET notified_at = ?1
                 WHERE id = ?2 AND notified_at IS NULL",
            )?;
            for id in ids {
                changed += stmt.execute(params![at, id])?;
            }
        }
        tx.commit()?;

        Ok(changed)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<ServiceRequestRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM service_requests WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn find_last_notified(&self) -> Result<Option<ServiceRequestRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM service_requests
                     WHERE notified_at IS NOT NULL
                     ORDER BY notified_at DESC LIMIT 1",
                    RECORD_COLUMNS
                ),
                [],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM service_requests", [], |row| {
            row.get(0)
        })?;
        Ok(count.max(0) as u64)
    }

    fn upsert_metadata(&self, total_records_seen_upstream: u64) -> Result<AggregateMetadata> {
        let metadata = AggregateMetadata {
            total_records_seen_upstream,
            updated_at: Utc::now(),
        };
        let total = i64::try_from(total_records_seen_upstream).map_err(|_| {
            StoreError::InvalidRecord(format!(
                "record total {} does not fit the counter column",
                total_records_seen_upstream
            ))
        })?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO metadata (id, total_records_seen_upstream, updated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                total_records_seen_upstream = excluded.total_records_seen_upstream,
                updated_at = excluded.updated_at",
            params![total, metadata.updated_at],
        )?;

        Ok(metadata)
    }

    fn metadata(&self) -> Result<Option<AggregateMetadata>> {
        let conn = self.lock()?;
        let metadata = conn
            .query_row(
                "SELECT total_records_seen_upstream, updated_at FROM metadata WHERE id = 1",
                [],
                metadata_from_row,
            )
            .optional()?;
        Ok(metadata)
    }
}

impl TokenRepository for SqliteStore {
    fn insert_token(&self, pair: &TokenPair) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE tokens SET superseded_at = ?1
             WHERE superseded_at IS NULL AND invalidated_at IS NULL",
            params![pair.created_at],
        )?;
        tx.execute(
            "INSERT INTO tokens (id, access_token, refresh_token, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pair.id,
                pair.access_token,
                pair.refresh_token,
                pair.expires_at,
                pair.created_at
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn latest_active_token(&self) -> Result<Option<TokenPair>> {
        let conn = self.lock()?;
        let pair = conn
            .query_row(
                "SELECT id, access_token, refresh_token, expires_at, created_at
                 FROM tokens
                 WHERE invalidated_at IS NULL AND superseded_at IS NULL
                 ORDER BY row_id DESC LIMIT 1",
                [],
                token_from_row,
            )
            .optional()?;
        Ok(pair)
    }

    fn invalidate_token(&self, access_token: &str, at: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tokens SET invalidated_at = ?1
             WHERE access_token = ?2 AND invalidated_at IS NULL",
            params![at, access_token],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str) -> ServiceRequestRecord {
        let mut record = ServiceRequestRecord::new(id, "Jane Doe");
        record.status = Some("Pending".into());
        record.referral_sent_at = Some(Utc::now());
        record
    }

    #[test]
    fn test_bulk_create_skips_existing_ids() {
        let store = SqliteStore::open_in_memory().unwrap();

        assert_eq!(store.bulk_create(&[record("A"), record("B")]).unwrap().len(), 2);
        assert_eq!(
            store.bulk_create(&[record("B"), record("C")]).unwrap(),
            vec!["C".to_string()]
        );

        let ids = store.find_all_ids().unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains("C"));
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_bulk_create_does_not_overwrite() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.bulk_create(&[record("A")]).unwrap();

        let mut changed = record("A");
        changed.patient_name = "Someone Else".into();
        store.bulk_create(&[changed]).unwrap();

        let stored = store.find_by_id("A").unwrap().unwrap();
        assert_eq!(stored.patient_name, "Jane Doe");
        assert_eq!(stored.status.as_deref(), Some("Pending"));
    }

    #[test]
    fn test_bulk_create_rejects_empty_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.bulk_create(&[record("")]);
        assert!(matches!(result, Err(StoreError::InvalidRecord(_))));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_update_notified_is_set_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.bulk_create(&[record("A"), record("B")]).unwrap();

        let first = Utc::now();
        assert_eq!(store.update_notified(&["A".to_string()], first).unwrap(), 1);

        let later = first + Duration::minutes(5);
        let ids = vec!["A".to_string(), "B".to_string()];
        assert_eq!(store.update_notified(&ids, later).unwrap(), 1);

        let a = store.find_by_id("A").unwrap().unwrap();
        let b = store.find_by_id("B").unwrap().unwrap();
        assert_eq!(a.notified_at, Some(first));
        assert_eq!(b.notified_at, Some(later));
        assert!(a.is_notified());
    }

    #[test]
    fn test_find_last_notified() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.bulk_create(&[record("A"), record("B")]).unwrap();
        assert!(store.find_last_notified().unwrap().is_none());

        let now = Utc::now();
        store.update_notified(&["A".to_string()], now).unwrap();
        store
            .update_notified(&["B".to_string()], now + Duration::seconds(30))
            .unwrap();

        let last = store.find_last_notified().unwrap().unwrap();
        assert_eq!(last.id, "B");
    }

    #[test]
    fn test_metadata_upsert_keeps_single_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.metadata().unwrap().is_none());

        store.upsert_metadata(10).unwrap();
        store.upsert_metadata(12).unwrap();

        let metadata = store.metadata().unwrap().unwrap();
        assert_eq!(metadata.total_records_seen_upstream, 12);
    }

    #[test]
    fn test_latest_token_ignores_invalidated_and_superseded() {
        let store = SqliteStore::open_in_memory().unwrap();
        let expires = Utc::now() + Duration::hours(1);

        let old = TokenPair::new("old-access", "old-refresh", expires);
        store.insert_token(&old).unwrap();
        let new = TokenPair::new("new-access", "new-refresh", expires);
        store.insert_token(&new).unwrap();

        assert_eq!(store.latest_active_token().unwrap(), Some(new.clone()));

        assert_eq!(store.invalidate_token("new-access", Utc::now()).unwrap(), 1);
        // The older pair was superseded, so nothing is current now
        assert!(store.latest_active_token().unwrap().is_none());
    }

    #[test]
    fn test_invalidate_unknown_token_is_noop() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.invalidate_token("nope", Utc::now()).unwrap(), 0);
    }

    #[test]
    fn test_file_backed_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("refwatch.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.bulk_create(&[record("A")]).unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.find_all_ids().unwrap().contains("A"));
    }
}
