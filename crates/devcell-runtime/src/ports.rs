//! SSH port allocation.
//!
//! Ports come from a fixed inclusive range. A port is held by the container
//! record that carries it, so allocation and record insertion happen
//! together: [`PortAllocator::reserve`] walks the free candidates and lets
//! the store's uniqueness check pick the winner.

use devcell_common::config::PortRangeConfig;
use devcell_common::error::{DevcellError, Result};
use devcell_common::types::ContainerRecord;
use tokio::sync::Mutex;

use crate::state::{InsertOutcome, StateStore};

/// Hands out SSH ports from `[min, max]`.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    guard: Mutex<()>,
}

impl PortAllocator {
    /// Creates an allocator for the inclusive range `[min, max]`.
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            guard: Mutex::new(()),
        }
    }

    /// Creates an allocator for the configured range.
    #[must_use]
    pub fn from_config(config: &PortRangeConfig) -> Self {
        Self::new(config.min, config.max)
    }

    /// Lowest port in the range not held by any record.
    ///
    /// The answer is advisory: another caller may take the port before it is
    /// used. Use [`PortAllocator::reserve`] to claim one.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::PortExhaustion`] when every port is taken.
    pub fn allocate(&self, store: &dyn StateStore) -> Result<u16> {
        self.free_ports(store)?
            .into_iter()
            .next()
            .ok_or(DevcellError::PortExhaustion {
                min: self.min,
                max: self.max,
            })
    }

    /// Assigns the lowest free port to `record` and inserts it.
    ///
    /// Candidates are tried in ascending order. A candidate that another
    /// writer claimed in the meantime is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`DevcellError::AlreadyExists`] if the user already has a
    /// record, [`DevcellError::PortExhaustion`] if no candidate could be
    /// claimed.
    pub async fn reserve(
        &self,
        store: &dyn StateStore,
        mut record: ContainerRecord,
    ) -> Result<ContainerRecord> {
        let _guard = self.guard.lock().await;
        for port in self.free_ports(store)? {
            record.ssh_port = port;
            match store.insert_container(&record)? {
                InsertOutcome::Inserted => {
                    tracing::debug!(user = %record.user_id, port, "SSH port reserved");
                    return Ok(record);
                }
                InsertOutcome::PortTaken => {
                    tracing::debug!(port, "port claimed concurrently, trying next");
                }
                InsertOutcome::UserTaken => {
                    return Err(DevcellError::AlreadyExists {
                        kind: "container",
                        id: record.user_id.to_string(),
                    });
                }
            }
        }
        Err(DevcellError::PortExhaustion {
            min: self.min,
            max: self.max,
        })
    }

    fn free_ports(&self, store: &dyn StateStore) -> Result<Vec<u16>> {
        let taken = store.allocated_ports()?;
        Ok((self.min..=self.max)
            .filter(|port| !taken.contains(port))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use devcell_common::types::UserId;

    use super::*;
    use crate::state::sqlite::SqliteStore;

    fn record(user: &str) -> ContainerRecord {
        ContainerRecord::reserve(UserId::new(user), format!("devcell-{user}"), 0)
    }

    #[test]
    fn allocate_returns_lowest_free_port() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ports = PortAllocator::new(2230, 2232);
        assert_eq!(ports.allocate(&store).unwrap(), 2230);

        let mut taken = record("a");
        taken.ssh_port = 2230;
        let _ = store.insert_container(&taken).unwrap();
        assert_eq!(ports.allocate(&store).unwrap(), 2231);
    }

    #[tokio::test]
    async fn reserve_fills_range_then_exhausts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ports = PortAllocator::new(2230, 2231);
        let a = ports.reserve(&store, record("a")).await.unwrap();
        let b = ports.reserve(&store, record("b")).await.unwrap();
        assert_eq!((a.ssh_port, b.ssh_port), (2230, 2231));

        let err = ports.reserve(&store, record("c")).await.unwrap_err();
        assert!(matches!(
            err,
            DevcellError::PortExhaustion {
                min: 2230,
                max: 2231
            }
        ));
    }

    #[tokio::test]
    async fn reserve_rejects_second_record_for_user() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ports = PortAllocator::new(2230, 2240);
        let _ = ports.reserve(&store, record("a")).await.unwrap();
        let err = ports.reserve(&store, record("a")).await.unwrap_err();
        assert!(matches!(err, DevcellError::AlreadyExists { .. }));
        assert_eq!(store.allocated_ports().unwrap(), vec![2230]);
    }

    #[tokio::test]
    async fn released_port_is_reused() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ports = PortAllocator::new(2230, 2240);
        let _ = ports.reserve(&store, record("a")).await.unwrap();
        let _ = ports.reserve(&store, record("b")).await.unwrap();
        store.delete_container(&UserId::new("a")).unwrap();
        let c = ports.reserve(&store, record("c")).await.unwrap();
        assert_eq!(c.ssh_port, 2230);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_share_a_port() {
        let store = std::sync::Arc::new(SqliteStore::open_in_memory().unwrap());
        let ports = std::sync::Arc::new(PortAllocator::new(2230, 2250));
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = std::sync::Arc::clone(&store);
            let ports = std::sync::Arc::clone(&ports);
            handles.push(tokio::spawn(async move {
                ports
                    .reserve(store.as_ref(), record(&format!("user{i}")))
                    .await
                    .unwrap()
                    .ssh_port
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }
}
