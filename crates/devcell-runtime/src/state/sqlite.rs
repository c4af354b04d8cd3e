//! SQLite backend.
//!
//! Uniqueness of a user's container and of SSH ports is enforced by
//! `UNIQUE` constraints, so concurrent orchestrator processes sharing the
//! database cannot both win the same port.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use devcell_common::error::{DevcellError, Result};
use devcell_common::types::{
    ActivityEntry, ActivityKind, ContainerRecord, ContainerStatus, ResourceAllocation, RuntimeId,
    UsageSample, UserAccount, UserId,
};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{InsertOutcome, StateStore};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    username    TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS ssh_keys (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    public_key  TEXT NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS containers (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL UNIQUE,
    runtime_id  TEXT,
    name        TEXT NOT NULL,
    ssh_port    INTEGER NOT NULL UNIQUE,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS resource_allocations (
    user_id         TEXT PRIMARY KEY,
    cpu_cores       INTEGER NOT NULL,
    memory_mb       INTEGER NOT NULL,
    storage_ssd_gb  INTEGER NOT NULL,
    storage_hdd_gb  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS activity_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      TEXT NOT NULL,
    kind         TEXT NOT NULL,
    description  TEXT NOT NULL,
    recorded_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS usage_samples (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    container_record_id  TEXT NOT NULL,
    cpu_percent          REAL NOT NULL,
    memory_used_mb       INTEGER NOT NULL,
    memory_limit_mb      INTEGER NOT NULL,
    storage_ssd_used_gb  REAL NOT NULL,
    storage_hdd_used_gb  REAL NOT NULL,
    network_rx_bytes     INTEGER NOT NULL,
    network_tx_bytes     INTEGER NOT NULL,
    recorded_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_user ON activity_log(user_id, id);
CREATE INDEX IF NOT EXISTS idx_usage_record ON usage_samples(container_record_id, id);
";

/// State store backed by a SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DevcellError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            DevcellError::store(format!("cannot open database {}: {e}", path.display()))
        })?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))
            .map_err(|e| DevcellError::store(format!("cannot set WAL mode: {e}")))?;
        if mode != "wal" {
            tracing::warn!(mode = %mode, "database is not in WAL mode");
        }
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DevcellError::store)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| DevcellError::store(format!("cannot enable foreign keys: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(DevcellError::store)?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| DevcellError::store(format!("cannot apply schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DevcellError::store("database lock poisoned"))
    }
}

fn is_unique_violation(err: &rusqlite::Error, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(message)) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && message.contains("UNIQUE constraint failed")
                && message.contains(column)
        }
        _ => false,
    }
}

fn conversion_error(err: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, err)
}

fn parse_time(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(Box::new(e)))
}

fn parse_column<T>(value: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = DevcellError>,
{
    value
        .parse()
        .map_err(|e| conversion_error(Box::new(e)))
}

fn container_from_row(row: &Row<'_>) -> rusqlite::Result<ContainerRecord> {
    let runtime_id: Option<String> = row.get("runtime_id")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(ContainerRecord {
        id: row.get("id")?,
        user_id: UserId::new(row.get::<_, String>("user_id")?),
        runtime_id: runtime_id.map(RuntimeId::new),
        name: row.get("name")?,
        ssh_port: row.get("ssh_port")?,
        status: parse_column::<ContainerStatus>(&status)?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn usage_from_row(row: &Row<'_>) -> rusqlite::Result<UsageSample> {
    let recorded_at: String = row.get("recorded_at")?;
    Ok(UsageSample {
        container_record_id: row.get("container_record_id")?,
        cpu_percent: row.get("cpu_percent")?,
        memory_used_mb: row.get("memory_used_mb")?,
        memory_limit_mb: row.get("memory_limit_mb")?,
        storage_ssd_used_gb: row.get("storage_ssd_used_gb")?,
        storage_hdd_used_gb: row.get("storage_hdd_used_gb")?,
        network_rx_bytes: row.get("network_rx_bytes")?,
        network_tx_bytes: row.get("network_tx_bytes")?,
        recorded_at: parse_time(&recorded_at)?,
    })
}

const CONTAINER_COLUMNS: &str =
    "id, user_id, runtime_id, name, ssh_port, status, created_at, updated_at";

impl StateStore for SqliteStore {
    fn find_user(&self, id: &UserId) -> Result<Option<UserAccount>> {
        self.conn()?
            .query_row(
                "SELECT id, username FROM users WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(UserAccount {
                        id: UserId::new(row.get::<_, String>(0)?),
                        username: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(DevcellError::store)
    }

    fn insert_user(&self, user: &UserAccount) -> Result<()> {
        match self.conn()?.execute(
            "INSERT INTO users (id, username) VALUES (?1, ?2)",
            params![user.id.as_str(), user.username],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e, "users.") => Err(DevcellError::AlreadyExists {
                kind: "user",
                id: user.username.clone(),
            }),
            Err(e) => Err(DevcellError::store(e)),
        }
    }

    fn active_ssh_keys(&self, user_id: &UserId) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT public_key FROM ssh_keys WHERE user_id = ?1 AND active = 1 ORDER BY id")
            .map_err(DevcellError::store)?;
        let keys = stmt
            .query_map(params![user_id.as_str()], |row| row.get(0))
            .map_err(DevcellError::store)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(DevcellError::store)?;
        Ok(keys)
    }

    fn add_ssh_key(&self, user_id: &UserId, public_key: &str) -> Result<()> {
        match self.conn()?.execute(
            "INSERT INTO ssh_keys (user_id, public_key, active) VALUES (?1, ?2, 1)",
            params![user_id.as_str(), public_key],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(DevcellError::NotFound {
                    kind: "user",
                    id: user_id.to_string(),
                })
            }
            Err(e) => Err(DevcellError::store(e)),
        }
    }

    fn find_container(&self, user_id: &UserId) -> Result<Option<ContainerRecord>> {
        self.conn()?
            .query_row(
                &format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE user_id = ?1"),
                params![user_id.as_str()],
                container_from_row,
            )
            .optional()
            .map_err(DevcellError::store)
    }

    fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONTAINER_COLUMNS} FROM containers ORDER BY ssh_port"
            ))
            .map_err(DevcellError::store)?;
        let records = stmt
            .query_map([], container_from_row)
            .map_err(DevcellError::store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DevcellError::store)?;
        Ok(records)
    }

    fn insert_container(&self, record: &ContainerRecord) -> Result<InsertOutcome> {
        let result = self.conn()?.execute(
            &format!(
                "INSERT INTO containers ({CONTAINER_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                record.id,
                record.user_id.as_str(),
                record.runtime_id.as_ref().map(RuntimeId::as_str),
                record.name,
                record.ssh_port,
                record.status.as_str(),
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e, "containers.ssh_port") => Ok(InsertOutcome::PortTaken),
            Err(e) if is_unique_violation(&e, "containers.user_id") => Ok(InsertOutcome::UserTaken),
            Err(e) => Err(DevcellError::store(e)),
        }
    }

    fn update_container(&self, record: &ContainerRecord) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE containers SET runtime_id = ?2, name = ?3, ssh_port = ?4, status = ?5, \
                 updated_at = ?6 WHERE id = ?1",
                params![
                    record.id,
                    record.runtime_id.as_ref().map(RuntimeId::as_str),
                    record.name,
                    record.ssh_port,
                    record.status.as_str(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(DevcellError::store)?;
        if changed == 0 {
            return Err(DevcellError::NotFound {
                kind: "container",
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    fn delete_container(&self, user_id: &UserId) -> Result<()> {
        let _ = self
            .conn()?
            .execute(
                "DELETE FROM containers WHERE user_id = ?1",
                params![user_id.as_str()],
            )
            .map_err(DevcellError::store)?;
        Ok(())
    }

    fn allocated_ports(&self) -> Result<Vec<u16>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT ssh_port FROM containers ORDER BY ssh_port")
            .map_err(DevcellError::store)?;
        let ports = stmt
            .query_map([], |row| row.get(0))
            .map_err(DevcellError::store)?
            .collect::<rusqlite::Result<Vec<u16>>>()
            .map_err(DevcellError::store)?;
        Ok(ports)
    }

    fn find_allocation(&self, user_id: &UserId) -> Result<Option<ResourceAllocation>> {
        self.conn()?
            .query_row(
                "SELECT cpu_cores, memory_mb, storage_ssd_gb, storage_hdd_gb \
                 FROM resource_allocations WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| {
                    Ok(ResourceAllocation {
                        user_id: user_id.clone(),
                        cpu_cores: row.get(0)?,
                        memory_mb: row.get(1)?,
                        storage_ssd_gb: row.get(2)?,
                        storage_hdd_gb: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(DevcellError::store)
    }

    fn upsert_allocation(&self, allocation: &ResourceAllocation) -> Result<()> {
        let _ = self
            .conn()?
            .execute(
                "INSERT INTO resource_allocations \
                 (user_id, cpu_cores, memory_mb, storage_ssd_gb, storage_hdd_gb) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(user_id) DO UPDATE SET cpu_cores = excluded.cpu_cores, \
                 memory_mb = excluded.memory_mb, storage_ssd_gb = excluded.storage_ssd_gb, \
                 storage_hdd_gb = excluded.storage_hdd_gb",
                params![
                    allocation.user_id.as_str(),
                    allocation.cpu_cores,
                    allocation.memory_mb,
                    allocation.storage_ssd_gb,
                    allocation.storage_hdd_gb,
                ],
            )
            .map_err(DevcellError::store)?;
        Ok(())
    }

    fn append_activity(&self, entry: &ActivityEntry) -> Result<()> {
        let _ = self
            .conn()?
            .execute(
                "INSERT INTO activity_log (user_id, kind, description, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.user_id.as_str(),
                    entry.kind.as_str(),
                    entry.description,
                    entry.recorded_at.to_rfc3339(),
                ],
            )
            .map_err(DevcellError::store)?;
        Ok(())
    }

    fn recent_activity(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT kind, description, recorded_at FROM activity_log \
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(DevcellError::store)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![user_id.as_str(), limit], |row| {
                let kind: String = row.get(0)?;
                let recorded_at: String = row.get(2)?;
                Ok(ActivityEntry {
                    user_id: user_id.clone(),
                    kind: parse_column::<ActivityKind>(&kind)?,
                    description: row.get(1)?,
                    recorded_at: parse_time(&recorded_at)?,
                })
            })
            .map_err(DevcellError::store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DevcellError::store)?;
        Ok(entries)
    }

    fn record_usage(&self, sample: &UsageSample) -> Result<()> {
        let _ = self
            .conn()?
            .execute(
                "INSERT INTO usage_samples (container_record_id, cpu_percent, memory_used_mb, \
                 memory_limit_mb, storage_ssd_used_gb, storage_hdd_used_gb, network_rx_bytes, \
                 network_tx_bytes, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    sample.container_record_id,
                    sample.cpu_percent,
                    sample.memory_used_mb,
                    sample.memory_limit_mb,
                    sample.storage_ssd_used_gb,
                    sample.storage_hdd_used_gb,
                    sample.network_rx_bytes,
                    sample.network_tx_bytes,
                    sample.recorded_at.to_rfc3339(),
                ],
            )
            .map_err(DevcellError::store)?;
        Ok(())
    }

    fn latest_usage(&self, container_record_id: &str) -> Result<Option<UsageSample>> {
        self.conn()?
            .query_row(
                "SELECT * FROM usage_samples WHERE container_record_id = ?1 \
                 ORDER BY id DESC LIMIT 1",
                params![container_record_id],
                usage_from_row,
            )
            .optional()
            .map_err(DevcellError::store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: &str, port: u16) -> ContainerRecord {
        ContainerRecord::reserve(UserId::new(user), format!("devcell-{user}"), port)
    }

    #[test]
    fn unique_constraints_classify_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.insert_container(&record("a", 2230)).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_container(&record("b", 2230)).unwrap(), InsertOutcome::PortTaken);
        assert_eq!(store.insert_container(&record("a", 2231)).unwrap(), InsertOutcome::UserTaken);
        assert_eq!(store.allocated_ports().unwrap(), vec![2230]);
    }

    #[test]
    fn record_round_trips_status_and_runtime_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut r = record("a", 2233);
        let _ = store.insert_container(&r).unwrap();
        r.mark_running(RuntimeId::new("0123456789abcdef")).unwrap();
        store.update_container(&r).unwrap();

        let found = store.find_container(&UserId::new("a")).unwrap().unwrap();
        assert_eq!(found.status, ContainerStatus::Running);
        assert_eq!(found.runtime_id, Some(RuntimeId::new("0123456789abcdef")));
        assert_eq!(found.created_at.timestamp(), r.created_at.timestamp());
    }

    #[test]
    fn update_of_unknown_record_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.update_container(&record("a", 2230)).unwrap_err();
        assert!(matches!(err, DevcellError::NotFound { .. }));
    }

    #[test]
    fn allocation_upsert_replaces_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = UserId::new("a");
        let mut alloc = ResourceAllocation::defaults(user.clone());
        store.upsert_allocation(&alloc).unwrap();
        alloc.storage_ssd_gb = 10;
        store.upsert_allocation(&alloc).unwrap();
        assert_eq!(store.find_allocation(&user).unwrap(), Some(alloc));
    }

    #[test]
    fn ssh_key_for_unknown_user_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.add_ssh_key(&UserId::new("ghost"), "ssh-ed25519 AAA").unwrap_err();
        assert!(matches!(err, DevcellError::NotFound { .. }));
        let user = UserAccount::new(UserId::new("u1"), "alice").unwrap();
        store.insert_user(&user).unwrap();
        store.add_ssh_key(&user.id, "ssh-ed25519 AAA").unwrap();
        store.add_ssh_key(&user.id, "ssh-ed25519 BBB").unwrap();
        assert_eq!(store.active_ssh_keys(&user.id).unwrap().len(), 2);
        assert!(matches!(
            store.insert_user(&UserAccount::new(UserId::new("u2"), "alice").unwrap()),
            Err(DevcellError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn latest_usage_returns_newest_sample() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sample = UsageSample {
            container_record_id: "rec".into(),
            cpu_percent: 12.5,
            memory_used_mb: 100,
            memory_limit_mb: 8192,
            storage_ssd_used_gb: 1.5,
            storage_hdd_used_gb: 0.0,
            network_rx_bytes: 10,
            network_tx_bytes: 20,
            recorded_at: Utc::now(),
        };
        store.record_usage(&sample).unwrap();
        sample.memory_used_mb = 200;
        store.record_usage(&sample).unwrap();
        let latest = store.latest_usage("rec").unwrap().unwrap();
        assert_eq!(latest.memory_used_mb, 200);
        assert!(store.latest_usage("other").unwrap().is_none());
    }

    #[test]
    fn file_database_persists_across_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db/devcell.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let _ = store.insert_container(&record("a", 2240)).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_containers().unwrap().len(), 1);
    }
}
