//! The process-wide user directory: a single mutex-guarded map from
//! username to [`UserRecord`].
//!
//! Grounded on the teacher's single-lock-guarded-state pattern
//! (`hub/state.rs`'s `SharedHubState = Arc<RwLock<HubState>>`), generalized
//! to a plain [`std::sync::Mutex`] — see `SPEC_FULL.md` §4.3 for why a
//! plain mutex was chosen over a read-write lock here: almost every
//! operation on this map touches `last_activity`, so reads are rare enough
//! that the split doesn't pay for itself.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::conn::OutboundHandle;

/// Presence of a user as observed by the directory. Replaces the original
/// `bool isActive` with a tagged four-state enum — do not recreate a
/// boolean projection over this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Disconnected,
    Active,
    Busy,
    Inactive,
}

impl PresenceState {
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            PresenceState::Disconnected => 0,
            PresenceState::Active => 1,
            PresenceState::Busy => 2,
            PresenceState::Inactive => 3,
        }
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PresenceState::Disconnected),
            1 => Some(PresenceState::Active),
            2 => Some(PresenceState::Busy),
            3 => Some(PresenceState::Inactive),
            _ => None,
        }
    }
}

/// A single user's authoritative record.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: String,
    pub state: PresenceState,
    /// Last value of `state` that was not `Disconnected`; used to restore
    /// presence on reconnect. Never `Disconnected`.
    pub previous_state: PresenceState,
    /// Live connection handle; `None` iff `state == Disconnected`.
    pub conn: Option<OutboundHandle>,
    pub address: String,
    pub last_activity: Instant,
}

/// Outcome of [`Directory::upsert_on_join`].
pub enum UpsertOutcome {
    /// No prior record existed; a fresh `Active` record was created.
    Created,
    /// A `Disconnected` record was found and reactivated.
    Reconnected,
    /// A live record already exists for this name; the directory refused
    /// to overwrite it. Admission should already have prevented this, but
    /// the directory enforces the invariant regardless.
    Rejected,
}

/// A snapshot entry used for broadcast fan-out — taken under the lock,
/// then iterated without it.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub state: PresenceState,
    pub conn: Option<OutboundHandle>,
}

/// The delta produced by a successful [`Directory::set_state`] call.
pub struct StateChange {
    pub name: String,
    pub old_state: PresenceState,
    pub new_state: PresenceState,
}

/// The process-wide authoritative mapping from username to [`UserRecord`].
#[derive(Default)]
pub struct Directory {
    users: Mutex<HashMap<String, UserRecord>>,
}

impl Directory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn upsert_on_join(
        &self,
        name: &str,
        conn: OutboundHandle,
        address: String,
    ) -> UpsertOutcome {
        let mut users = self.users.lock().expect("directory mutex poisoned");
        match users.get_mut(name) {
            Some(existing) if existing.state != PresenceState::Disconnected && existing.conn.is_some() => {
                UpsertOutcome::Rejected
            }
            Some(existing) => {
                // Reconnect: restore previous_state (mapping Inactive -> Active).
                let restored = match existing.previous_state {
                    PresenceState::Inactive => PresenceState::Active,
                    other => other,
                };
                existing.state = restored;
                existing.previous_state = restored;
                existing.conn = Some(conn);
                existing.address = address;
                existing.last_activity = Instant::now();
                UpsertOutcome::Reconnected
            }
            None => {
                users.insert(
                    name.to_string(),
                    UserRecord {
                        name: name.to_string(),
                        state: PresenceState::Active,
                        previous_state: PresenceState::Active,
                        conn: Some(conn),
                        address,
                        last_activity: Instant::now(),
                    },
                );
                UpsertOutcome::Created
            }
        }
    }

    pub fn mark_disconnected(&self, name: &str) {
        let mut users = self.users.lock().expect("directory mutex poisoned");
        if let Some(record) = users.get_mut(name) {
            if record.state != PresenceState::Disconnected {
                record.previous_state = record.state;
            }
            record.state = PresenceState::Disconnected;
            record.conn = None;
        }
    }

    /// No-op when `state == new_state` and not `force`. Returns the delta
    /// to broadcast, or `None` when nothing changed or the user is unknown.
    pub fn set_state(&self, name: &str, new_state: PresenceState, force: bool) -> Option<StateChange> {
        let mut users = self.users.lock().expect("directory mutex poisoned");
        let record = users.get_mut(name)?;
        if record.state == new_state && !force {
            return None;
        }
        let old_state = record.state;
        record.state = new_state;
        if new_state != PresenceState::Disconnected {
            record.previous_state = new_state;
        }
        Some(StateChange {
            name: name.to_string(),
            old_state,
            new_state,
        })
    }

    pub fn touch(&self, name: &str) {
        let mut users = self.users.lock().expect("directory mutex poisoned");
        if let Some(record) = users.get_mut(name) {
            record.last_activity = Instant::now();
        }
    }

    /// Current state of `name`, if known.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<PresenceState> {
        let users = self.users.lock().expect("directory mutex poisoned");
        users.get(name).map(|r| r.state)
    }

    /// Whether `name` exists and is not `Disconnected`.
    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        let users = self.users.lock().expect("directory mutex poisoned");
        users
            .get(name)
            .is_some_and(|r| r.state != PresenceState::Disconnected)
    }

    /// A single record's `(name, state)`, for `GET_USER` — restricted to
    /// non-`Disconnected` users.
    #[must_use]
    pub fn get_connected(&self, name: &str) -> Option<(String, PresenceState)> {
        let users = self.users.lock().expect("directory mutex poisoned");
        users.get(name).and_then(|r| {
            (r.state != PresenceState::Disconnected).then(|| (r.name.clone(), r.state))
        })
    }

    /// A single record's `(name, state)` regardless of presence, for
    /// `LIST_ALL_USERS`/debugging.
    #[must_use]
    pub fn get_any(&self, name: &str) -> Option<(String, PresenceState)> {
        let users = self.users.lock().expect("directory mutex poisoned");
        users.get(name).map(|r| (r.name.clone(), r.state))
    }

    /// A clone of the live outbound handle for `name`, if connected.
    #[must_use]
    pub fn conn_of(&self, name: &str) -> Option<OutboundHandle> {
        let users = self.users.lock().expect("directory mutex poisoned");
        users
            .get(name)
            .filter(|r| r.state != PresenceState::Disconnected)
            .and_then(|r| r.conn.clone())
    }

    /// Snapshot of every record suitable for iteration outside the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DirectoryEntry> {
        let users = self.users.lock().expect("directory mutex poisoned");
        users
            .values()
            .map(|r| DirectoryEntry {
                name: r.name.clone(),
                state: r.state,
                conn: r.conn.clone(),
            })
            .collect()
    }

    /// As [`Directory::snapshot`], restricted to records with
    /// `state != Disconnected`.
    #[must_use]
    pub fn snapshot_connected(&self) -> Vec<DirectoryEntry> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.state != PresenceState::Disconnected)
            .collect()
    }

    /// Candidates for the inactivity sweeper: `Active` users idle for at
    /// least `threshold`.
    #[must_use]
    pub fn active_idle_since(&self, threshold: std::time::Duration) -> Vec<String> {
        let users = self.users.lock().expect("directory mutex poisoned");
        let now = Instant::now();
        users
            .values()
            .filter(|r| r.state == PresenceState::Active && now.duration_since(r.last_activity) >= threshold)
            .map(|r| r.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::test_support::dummy_outbound;

    #[test]
    fn uniqueness_and_creation() {
        let dir = Directory::new();
        let outcome = dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        assert!(matches!(outcome, UpsertOutcome::Created));
        assert!(dir.is_connected("alice"));
    }

    #[test]
    fn no_live_overwrite() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        let outcome = dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        assert!(matches!(outcome, UpsertOutcome::Rejected));
    }

    #[test]
    fn reconnect_restores_previous_state() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        dir.set_state("alice", PresenceState::Busy, true);
        dir.mark_disconnected("alice");
        assert_eq!(dir.state_of("alice"), Some(PresenceState::Disconnected));

        let outcome = dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        assert!(matches!(outcome, UpsertOutcome::Reconnected));
        assert_eq!(dir.state_of("alice"), Some(PresenceState::Busy));
    }

    #[test]
    fn reconnect_maps_inactive_to_active() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        dir.set_state("alice", PresenceState::Inactive, true);
        dir.mark_disconnected("alice");

        dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        assert_eq!(dir.state_of("alice"), Some(PresenceState::Active));
    }

    #[test]
    fn set_state_force_false_is_noop_when_unchanged() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        let change = dir.set_state("alice", PresenceState::Active, false);
        assert!(change.is_none());
    }

    #[test]
    fn mark_disconnected_clears_conn_and_preserves_previous_state() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        dir.set_state("alice", PresenceState::Busy, true);
        dir.mark_disconnected("alice");
        let entries = dir.snapshot();
        let alice = entries.iter().find(|e| e.name == "alice").unwrap();
        assert_eq!(alice.state, PresenceState::Disconnected);
        assert!(alice.conn.is_none());
    }

    #[test]
    fn snapshot_connected_excludes_disconnected() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        dir.upsert_on_join("bob", dummy_outbound(), "127.0.0.1".into());
        dir.mark_disconnected("bob");
        let connected = dir.snapshot_connected();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].name, "alice");
    }

    #[test]
    fn presence_byte_round_trip() {
        for b in 0..=3u8 {
            let state = PresenceState::from_byte(b).unwrap();
            assert_eq!(state.to_byte(), b);
        }
        assert!(PresenceState::from_byte(4).is_none());
    }

    #[test]
    fn active_idle_since_respects_threshold() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "127.0.0.1".into());
        assert!(dir.active_idle_since(std::time::Duration::from_secs(25)).is_empty());
        assert!(dir
            .active_idle_since(std::time::Duration::from_secs(0))
            .contains(&"alice".to_string()));
    }
}
