//! Activity audit trail.
//!
//! Lifecycle operations record what they did in the store's activity log
//! and on the `devcell::audit` tracing target. Recording never fails the
//! operation that triggered it.

use devcell_common::types::{ActivityEntry, ActivityKind, UserId};

use crate::state::StateStore;

/// Records an activity entry, logging instead of failing on store errors.
pub fn record(store: &dyn StateStore, user_id: &UserId, kind: ActivityKind, description: &str) {
    tracing::info!(
        target: "devcell::audit",
        user = %user_id,
        kind = %kind,
        "{description}"
    );
    let entry = ActivityEntry::new(user_id.clone(), kind, description);
    if let Err(e) = store.append_activity(&entry) {
        tracing::warn!(user = %user_id, kind = %kind, error = %e, "failed to record activity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sqlite::SqliteStore;

    #[test]
    fn record_appends_to_activity_log() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = UserId::new("alice");
        record(&store, &user, ActivityKind::ContainerStart, "container started");
        let entries = store.recent_activity(&user, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ActivityKind::ContainerStart);
        assert_eq!(entries[0].description, "container started");
    }
}
