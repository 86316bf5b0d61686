//! Inactivity sweeper: a single background task that periodically demotes
//! idle `Active` users to `Inactive`.
//!
//! Grounded on the teacher's `main.rs::run_headless` tick-loop shape
//! (`while !shutdown { tick(); sleep(..).await }`), adapted to
//! `tokio::time::interval` since this crate's core is fully async where
//! the teacher's headless loop is sync-blocking.

use std::sync::Arc;
use std::time::Duration;

use crate::directory::{Directory, PresenceState};
use crate::router;

/// Spawn the sweeper task. Wakes every `interval` and demotes to
/// `Inactive` any `Active` user idle for at least `threshold` (spec.md
/// §4.7). `Busy`, `Inactive`, and `Disconnected` users are never touched —
/// this is the presence-monotonicity invariant from spec.md §8.
pub fn spawn(directory: Arc<Directory>, interval: Duration, threshold: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so the very first
        // sweep happens one full interval after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_once(&directory, threshold);
        }
    })
}

fn sweep_once(directory: &Directory, threshold: Duration) {
    for name in directory.active_idle_since(threshold) {
        if directory.set_state(&name, PresenceState::Inactive, true).is_some() {
            log::info!("sweeper: demoting {name} to INACTIVE after {threshold:?} idle");
            router::broadcast_presence(directory, &name, PresenceState::Inactive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::test_support::dummy_outbound;

    #[test]
    fn sweep_demotes_only_idle_active_users() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "addr".into());
        dir.upsert_on_join("bob", dummy_outbound(), "addr".into());
        dir.set_state("bob", PresenceState::Busy, true);

        sweep_once(&dir, Duration::from_secs(0));

        assert_eq!(dir.state_of("alice"), Some(PresenceState::Inactive));
        assert_eq!(dir.state_of("bob"), Some(PresenceState::Busy));
    }

    #[test]
    fn sweep_never_touches_disconnected_or_inactive() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "addr".into());
        dir.set_state("alice", PresenceState::Inactive, true);
        dir.upsert_on_join("carol", dummy_outbound(), "addr".into());
        dir.mark_disconnected("carol");

        sweep_once(&dir, Duration::from_secs(0));

        assert_eq!(dir.state_of("alice"), Some(PresenceState::Inactive));
        assert_eq!(dir.state_of("carol"), Some(PresenceState::Disconnected));
    }

    #[test]
    fn sweep_respects_threshold() {
        let dir = Directory::new();
        dir.upsert_on_join("alice", dummy_outbound(), "addr".into());
        sweep_once(&dir, Duration::from_secs(3600));
        assert_eq!(dir.state_of("alice"), Some(PresenceState::Active));
    }
}
