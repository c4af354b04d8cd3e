//! Persistent state.
//!
//! Users, SSH keys, container records, resource allocations, the activity
//! log, and usage history live behind [`StateStore`]. Two backends exist:
//! a SQLite database with unique constraints ([`sqlite::SqliteStore`]) and
//! a JSON index file written atomically ([`json::JsonStore`]).
//!
//! Every mutation touches a single row. Multi-step operations are
//! serialized by the caller's per-user lock, not by the store.

pub mod json;
pub mod sqlite;

use std::sync::Arc;

use devcell_common::config::{StateBackend, StateConfig};
use devcell_common::error::Result;
use devcell_common::types::{
    ActivityEntry, ContainerRecord, ResourceAllocation, UsageSample, UserAccount, UserId,
};

/// Result of inserting a container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was stored.
    Inserted,
    /// Another record already holds the SSH port.
    PortTaken,
    /// The user already has a record.
    UserTaken,
}

/// Storage for everything the orchestrator persists.
pub trait StateStore: Send + Sync {
    /// Looks up a user.
    ///
    /// # Errors
    ///
    /// Returns [`devcell_common::error::DevcellError::Store`] on backend failure.
    fn find_user(&self, id: &UserId) -> Result<Option<UserAccount>>;

    /// Registers a user.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the id or username is taken.
    fn insert_user(&self, user: &UserAccount) -> Result<()>;

    /// Active public keys of a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn active_ssh_keys(&self, user_id: &UserId) -> Result<Vec<String>>;

    /// Adds an active public key for a user.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown user.
    fn add_ssh_key(&self, user_id: &UserId, public_key: &str) -> Result<()>;

    /// The container record of a user, if any.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn find_container(&self, user_id: &UserId) -> Result<Option<ContainerRecord>>;

    /// Every container record, ordered by SSH port.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn list_containers(&self) -> Result<Vec<ContainerRecord>>;

    /// Inserts a record unless its user or SSH port is already taken.
    ///
    /// Both checks and the insert are atomic with respect to other
    /// inserts, including from other processes sharing the store.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn insert_container(&self, record: &ContainerRecord) -> Result<InsertOutcome>;

    /// Replaces an existing record, matched by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record has this id.
    fn update_container(&self, record: &ContainerRecord) -> Result<()>;

    /// Deletes the record of a user. Deleting nothing is not an error.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn delete_container(&self, user_id: &UserId) -> Result<()>;

    /// SSH ports currently held by records.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn allocated_ports(&self) -> Result<Vec<u16>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .map(|r| r.ssh_port)
            .collect())
    }

    /// The desired allocation of a user, if one was stored.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn find_allocation(&self, user_id: &UserId) -> Result<Option<ResourceAllocation>>;

    /// Creates or replaces the allocation of a user.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn upsert_allocation(&self, allocation: &ResourceAllocation) -> Result<()>;

    /// Appends an entry to the activity log.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn append_activity(&self, entry: &ActivityEntry) -> Result<()>;

    /// Most recent activity of a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn recent_activity(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEntry>>;

    /// Appends a usage sample to the metrics history.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn record_usage(&self, sample: &UsageSample) -> Result<()>;

    /// Latest usage sample of a container record.
    ///
    /// # Errors
    ///
    /// Returns `Store` on backend failure.
    fn latest_usage(&self, container_record_id: &str) -> Result<Option<UsageSample>>;
}

/// Opens the configured backend.
///
/// # Errors
///
/// Returns an error if the database or index cannot be opened.
pub fn open(config: &StateConfig) -> Result<Arc<dyn StateStore>> {
    tracing::debug!(backend = ?config.backend, path = %config.path.display(), "opening state store");
    Ok(match config.backend {
        StateBackend::Sqlite => Arc::new(sqlite::SqliteStore::open(&config.path)?),
        StateBackend::Json => Arc::new(json::JsonStore::open(&config.path)?),
    })
}
