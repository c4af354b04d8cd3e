//! JSON index backend.
//!
//! The whole state is one JSON document, rewritten atomically (temporary
//! file plus rename) on every mutation. Uniqueness of users and SSH ports
//! is enforced in code. Every read-modify-write holds an exclusive `flock`
//! on a sibling `.lock` file, so several orchestrator processes may share
//! one index.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use devcell_common::error::{DevcellError, Result};
use devcell_common::types::{
    ActivityEntry, ContainerRecord, ResourceAllocation, SshKey, UsageSample, UserAccount, UserId,
};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use super::{InsertOutcome, StateStore};

/// Samples kept per container record: one day at the default interval.
const USAGE_HISTORY_LIMIT: usize = 288;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StateIndex {
    users: Vec<UserAccount>,
    ssh_keys: Vec<SshKey>,
    containers: Vec<ContainerRecord>,
    allocations: Vec<ResourceAllocation>,
    activity: Vec<ActivityEntry>,
    usage: Vec<UsageSample>,
}

/// State store persisted as a JSON index file.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStore {
    /// Opens the index, creating an empty one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or the file cannot be
    /// created, or if an existing file is not a valid index.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DevcellError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let store = Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        };
        let _file_lock = store.lock_file()?;
        if path.exists() {
            let _ = store.load()?;
        } else {
            store.save(&StateIndex::default())?;
        }
        tracing::debug!(path = %path.display(), "opened JSON state index");
        Ok(store)
    }

    /// Exclusive lock shared with every process using this index.
    fn lock_file(&self) -> Result<Flock<File>> {
        let mut name = self.path.clone().into_os_string();
        name.push(".lock");
        let path = PathBuf::from(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| DevcellError::Io {
                path: path.clone(),
                source: e,
            })?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| DevcellError::Io {
            path,
            source: errno.into(),
        })
    }

    fn load(&self) -> Result<StateIndex> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| DevcellError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, index: &StateIndex) -> Result<()> {
        let content = serde_json::to_string_pretty(index)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, content).map_err(|e| DevcellError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| DevcellError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    fn read<T>(&self, f: impl FnOnce(&StateIndex) -> T) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| DevcellError::store("state index lock poisoned"))?;
        Ok(f(&self.load()?))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut StateIndex) -> Result<T>) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| DevcellError::store("state index lock poisoned"))?;
        let _file_lock = self.lock_file()?;
        let mut index = self.load()?;
        let value = f(&mut index)?;
        self.save(&index)?;
        Ok(value)
    }
}

impl StateStore for JsonStore {
    fn find_user(&self, id: &UserId) -> Result<Option<UserAccount>> {
        self.read(|index| index.users.iter().find(|u| u.id == *id).cloned())
    }

    fn insert_user(&self, user: &UserAccount) -> Result<()> {
        self.mutate(|index| {
            if index
                .users
                .iter()
                .any(|u| u.id == user.id || u.username == user.username)
            {
                return Err(DevcellError::AlreadyExists {
                    kind: "user",
                    id: user.username.clone(),
                });
            }
            index.users.push(user.clone());
            Ok(())
        })
    }

    fn active_ssh_keys(&self, user_id: &UserId) -> Result<Vec<String>> {
        self.read(|index| {
            index
                .ssh_keys
                .iter()
                .filter(|k| k.user_id == *user_id && k.active)
                .map(|k| k.public_key.clone())
                .collect()
        })
    }

    fn add_ssh_key(&self, user_id: &UserId, public_key: &str) -> Result<()> {
        self.mutate(|index| {
            if !index.users.iter().any(|u| u.id == *user_id) {
                return Err(DevcellError::NotFound {
                    kind: "user",
                    id: user_id.to_string(),
                });
            }
            index.ssh_keys.push(SshKey {
                user_id: user_id.clone(),
                public_key: public_key.to_string(),
                active: true,
            });
            Ok(())
        })
    }

    fn find_container(&self, user_id: &UserId) -> Result<Option<ContainerRecord>> {
        self.read(|index| {
            index
                .containers
                .iter()
                .find(|r| r.user_id == *user_id)
                .cloned()
        })
    }

    fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        self.read(|index| {
            let mut records = index.containers.clone();
            records.sort_by_key(|r| r.ssh_port);
            records
        })
    }

    fn insert_container(&self, record: &ContainerRecord) -> Result<InsertOutcome> {
        self.mutate(|index| {
            if index.containers.iter().any(|r| r.user_id == record.user_id) {
                return Ok(InsertOutcome::UserTaken);
            }
            if index.containers.iter().any(|r| r.ssh_port == record.ssh_port) {
                return Ok(InsertOutcome::PortTaken);
            }
            index.containers.push(record.clone());
            Ok(InsertOutcome::Inserted)
        })
    }

    fn update_container(&self, record: &ContainerRecord) -> Result<()> {
        self.mutate(|index| {
            let slot = index
                .containers
                .iter_mut()
                .find(|r| r.id == record.id)
                .ok_or_else(|| DevcellError::NotFound {
                    kind: "container",
                    id: record.id.clone(),
                })?;
            *slot = record.clone();
            Ok(())
        })
    }

    fn delete_container(&self, user_id: &UserId) -> Result<()> {
        self.mutate(|index| {
            index.containers.retain(|r| r.user_id != *user_id);
            Ok(())
        })
    }

    fn find_allocation(&self, user_id: &UserId) -> Result<Option<ResourceAllocation>> {
        self.read(|index| {
            index
                .allocations
                .iter()
                .find(|a| a.user_id == *user_id)
                .cloned()
        })
    }

    fn upsert_allocation(&self, allocation: &ResourceAllocation) -> Result<()> {
        self.mutate(|index| {
            match index
                .allocations
                .iter_mut()
                .find(|a| a.user_id == allocation.user_id)
            {
                Some(slot) => *slot = allocation.clone(),
                None => index.allocations.push(allocation.clone()),
            }
            Ok(())
        })
    }

    fn append_activity(&self, entry: &ActivityEntry) -> Result<()> {
        self.mutate(|index| {
            index.activity.push(entry.clone());
            Ok(())
        })
    }

    fn recent_activity(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEntry>> {
        self.read(|index| {
            index
                .activity
                .iter()
                .rev()
                .filter(|e| e.user_id == *user_id)
                .take(limit)
                .cloned()
                .collect()
        })
    }

    fn record_usage(&self, sample: &UsageSample) -> Result<()> {
        self.mutate(|index| {
            index.usage.push(sample.clone());
            let count = index
                .usage
                .iter()
                .filter(|s| s.container_record_id == sample.container_record_id)
                .count();
            if count > USAGE_HISTORY_LIMIT {
                if let Some(oldest) = index
                    .usage
                    .iter()
                    .position(|s| s.container_record_id == sample.container_record_id)
                {
                    let _ = index.usage.remove(oldest);
                }
            }
            Ok(())
        })
    }

    fn latest_usage(&self, container_record_id: &str) -> Result<Option<UsageSample>> {
        self.read(|index| {
            index
                .usage
                .iter()
                .rev()
                .find(|s| s.container_record_id == container_record_id)
                .cloned()
        })
    }
}

#[cfg(test)]
mod tests {
    use devcell_common::types::{ActivityKind, ContainerStatus};

    use super::*;

    fn store() -> (tempfile::TempDir, JsonStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::open(&dir.path().join("state/index.json")).unwrap();
        (dir, store)
    }

    fn alice() -> UserAccount {
        UserAccount::new(UserId::new("u-alice"), "alice").unwrap()
    }

    #[test]
    fn open_creates_empty_index() {
        let (dir, store) = store();
        assert!(dir.path().join("state/index.json").exists());
        assert!(store.list_containers().unwrap().is_empty());
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let (_dir, store) = store();
        store.insert_user(&alice()).unwrap();
        let dup = UserAccount::new(UserId::new("u-other"), "alice").unwrap();
        assert!(matches!(
            store.insert_user(&dup),
            Err(DevcellError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn insert_enforces_user_and_port_uniqueness() {
        let (_dir, store) = store();
        let first = ContainerRecord::reserve(UserId::new("a"), "devcell-a".into(), 2230);
        assert_eq!(store.insert_container(&first).unwrap(), InsertOutcome::Inserted);

        let same_port = ContainerRecord::reserve(UserId::new("b"), "devcell-b".into(), 2230);
        assert_eq!(store.insert_container(&same_port).unwrap(), InsertOutcome::PortTaken);

        let same_user = ContainerRecord::reserve(UserId::new("a"), "devcell-a".into(), 2231);
        assert_eq!(store.insert_container(&same_user).unwrap(), InsertOutcome::UserTaken);
        assert_eq!(store.allocated_ports().unwrap(), vec![2230]);
    }

    #[test]
    fn concurrent_writers_on_one_index_lose_no_inserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state/index.json");
        let _ = JsonStore::open(&path).unwrap();

        let writers: Vec<_> = (0..4u16)
            .map(|w| {
                let store = JsonStore::open(&path).unwrap();
                std::thread::spawn(move || {
                    for i in 0..10u16 {
                        let port = 2230 + w * 10 + i;
                        let user = UserId::new(format!("w{w}-{i}"));
                        let record = ContainerRecord::reserve(user, format!("devcell-{port}"), port);
                        assert_eq!(store.insert_container(&record).unwrap(), InsertOutcome::Inserted);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let reopened = JsonStore::open(&path).unwrap();
        assert_eq!(reopened.list_containers().unwrap().len(), 40);
        assert!(dir.path().join("state/index.json.lock").exists());
    }

    #[test]
    fn second_instance_sees_port_taken() {
        let (dir, first) = store();
        let second = JsonStore::open(&dir.path().join("state/index.json")).unwrap();
        let a = ContainerRecord::reserve(UserId::new("a"), "devcell-a".into(), 2230);
        assert_eq!(first.insert_container(&a).unwrap(), InsertOutcome::Inserted);
        let b = ContainerRecord::reserve(UserId::new("b"), "devcell-b".into(), 2230);
        assert_eq!(second.insert_container(&b).unwrap(), InsertOutcome::PortTaken);
    }

    #[test]
    fn records_survive_reopen() {
        let (dir, store) = store();
        let mut record = ContainerRecord::reserve(UserId::new("a"), "devcell-a".into(), 2232);
        let _ = store.insert_container(&record).unwrap();
        record.transition(ContainerStatus::Error).unwrap();
        store.update_container(&record).unwrap();
        drop(store);

        let reopened = JsonStore::open(&dir.path().join("state/index.json")).unwrap();
        let found = reopened.find_container(&UserId::new("a")).unwrap().unwrap();
        assert_eq!(found.status, ContainerStatus::Error);
    }

    #[test]
    fn keys_require_known_user() {
        let (_dir, store) = store();
        assert!(store.add_ssh_key(&UserId::new("ghost"), "ssh-ed25519 AAA").is_err());
        store.insert_user(&alice()).unwrap();
        store.add_ssh_key(&alice().id, "ssh-ed25519 AAA").unwrap();
        assert_eq!(store.active_ssh_keys(&alice().id).unwrap(), ["ssh-ed25519 AAA"]);
    }

    #[test]
    fn activity_is_returned_newest_first() {
        let (_dir, store) = store();
        let user = UserId::new("a");
        store
            .append_activity(&ActivityEntry::new(user.clone(), ActivityKind::ContainerCreate, "one"))
            .unwrap();
        store
            .append_activity(&ActivityEntry::new(user.clone(), ActivityKind::ContainerStop, "two"))
            .unwrap();
        let recent = store.recent_activity(&user, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, ActivityKind::ContainerStop);
    }
}
