//! Fixed-capacity revocation list for minted tokens.
//!
//! Each entry invalidates tokens minted for a `(user, app)` pair whose
//! issue time falls inside the entry's window. Zero-length ids are
//! wildcards. The list persists as a single blob through the host's
//! config store.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::provider::{unix_seconds, Clock, ConfigStore};

const REVOCATION_BLOB: &str = "revocation_list";
const CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub user_id: Vec<u8>,
    pub app_id: Vec<u8>,
    /// Tokens issued at or after this instant are revoked...
    pub revocation_ts: u64,
    /// ...until this instant (inclusive, unix seconds).
    pub expiration_ts: u64,
}

pub struct AccessRevocationManager {
    store: Option<Rc<dyn ConfigStore>>,
    clock: Rc<dyn Clock>,
    entries: RefCell<Vec<RevocationEntry>>,
}

impl AccessRevocationManager {
    pub fn new(store: Option<Rc<dyn ConfigStore>>, clock: Rc<dyn Clock>) -> Self {
        let mut entries = Vec::new();
        if let Some(store) = &store {
            if let Some(blob) = store.load(REVOCATION_BLOB) {
                match serde_json::from_str::<Vec<RevocationEntry>>(&blob) {
                    Ok(loaded) => entries = loaded,
                    Err(err) => warn!(%err, "revocation list blob unreadable, starting empty"),
                }
            }
        }
        Self {
            store,
            clock,
            entries: RefCell::new(entries),
        }
    }

    pub fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Insert or refresh an entry. Expired entries purge first; if the
    /// list is still full, the earliest-expiring entry is evicted.
    pub fn block(&self, user_id: &[u8], app_id: &[u8], expiration_ts: u64) {
        let now = unix_seconds(self.clock.now());
        {
            let mut entries = self.entries.borrow_mut();
            entries.retain(|entry| entry.expiration_ts >= now);

            if let Some(existing) = entries
                .iter_mut()
                .find(|entry| entry.user_id == user_id && entry.app_id == app_id)
            {
                existing.revocation_ts = now;
                existing.expiration_ts = expiration_ts;
            } else {
                if entries.len() >= CAPACITY {
                    if let Some((index, _)) = entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, entry)| entry.expiration_ts)
                    {
                        entries.remove(index);
                    }
                }
                entries.push(RevocationEntry {
                    user_id: user_id.to_vec(),
                    app_id: app_id.to_vec(),
                    revocation_ts: now,
                    expiration_ts,
                });
            }
        }
        self.persist();
    }

    /// True when a token minted for `(user_id, app_id)` at `issued_ts`
    /// matches a live entry's window.
    pub fn is_blocked(&self, user_id: &[u8], app_id: &[u8], issued_ts: u64) -> bool {
        self.entries.borrow().iter().any(|entry| {
            id_matches(&entry.user_id, user_id)
                && id_matches(&entry.app_id, app_id)
                && entry.revocation_ts <= issued_ts
                && issued_ts <= entry.expiration_ts
        })
    }

    /// The live (unexpired) entries.
    pub fn entries(&self) -> Vec<RevocationEntry> {
        let now = unix_seconds(self.clock.now());
        self.entries
            .borrow()
            .iter()
            .filter(|entry| entry.expiration_ts >= now)
            .cloned()
            .collect()
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            match serde_json::to_string(&*self.entries.borrow()) {
                Ok(blob) => store.save(REVOCATION_BLOB, &blob),
                Err(err) => warn!(%err, "revocation list serialization failed"),
            }
        }
    }
}

fn id_matches(entry_id: &[u8], query_id: &[u8]) -> bool {
    entry_id.is_empty() || entry_id == query_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test::{FakeClock, MemConfigStore};

    const NOW: u64 = 1_410_000_000;

    fn manager() -> AccessRevocationManager {
        AccessRevocationManager::new(None, FakeClock::at_unix(NOW))
    }

    #[test]
    fn blocks_within_window_only() {
        let manager = manager();
        manager.block(b"user", b"app", NOW + 100);
        assert!(manager.is_blocked(b"user", b"app", NOW));
        assert!(manager.is_blocked(b"user", b"app", NOW + 100));
        assert!(!manager.is_blocked(b"user", b"app", NOW - 1));
        assert!(!manager.is_blocked(b"user", b"app", NOW + 101));
        assert!(!manager.is_blocked(b"other", b"app", NOW));
        assert!(!manager.is_blocked(b"user", b"other", NOW));
    }

    #[test]
    fn empty_ids_are_wildcards() {
        let manager = manager();
        manager.block(b"", b"", NOW + 100);
        assert!(manager.is_blocked(b"anyone", b"anything", NOW + 50));
    }

    #[test]
    fn blocking_same_pair_refreshes_entry() {
        let manager = manager();
        manager.block(b"user", b"app", NOW + 100);
        manager.block(b"user", b"app", NOW + 500);
        assert_eq!(manager.entries().len(), 1);
        assert!(manager.is_blocked(b"user", b"app", NOW + 400));
    }

    #[test]
    fn full_list_evicts_earliest_expiring() {
        let manager = manager();
        for i in 0..manager.capacity() {
            manager.block(format!("user{i}").as_bytes(), b"app", NOW + 1_000 + i as u64);
        }
        assert_eq!(manager.entries().len(), manager.capacity());

        manager.block(b"latecomer", b"app", NOW + 10_000);
        assert_eq!(manager.entries().len(), manager.capacity());
        assert!(manager.is_blocked(b"latecomer", b"app", NOW + 1));
        // user0 had the earliest expiration and was evicted.
        assert!(!manager.is_blocked(b"user0", b"app", NOW + 1));
        assert!(manager.is_blocked(b"user1", b"app", NOW + 1));
    }

    #[test]
    fn mutations_purge_expired_entries() {
        let clock = FakeClock::at_unix(NOW);
        let manager = AccessRevocationManager::new(None, clock.clone());
        manager.block(b"short", b"app", NOW + 10);
        clock.set(std::time::UNIX_EPOCH + std::time::Duration::from_secs(NOW + 60));
        manager.block(b"fresh", b"app", NOW + 600);
        assert_eq!(manager.entries().len(), 1);
        assert_eq!(manager.entries()[0].user_id, b"fresh");
    }

    #[test]
    fn list_round_trips_through_store() {
        let store = MemConfigStore::new();
        let clock = FakeClock::at_unix(NOW);
        {
            let manager = AccessRevocationManager::new(Some(store.clone()), clock.clone());
            manager.block(b"user", b"app", NOW + 100);
        }
        let reloaded = AccessRevocationManager::new(Some(store), clock);
        assert!(reloaded.is_blocked(b"user", b"app", NOW + 10));
    }
}
