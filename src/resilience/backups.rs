//! Backup table — the leader's ordered set of elected backups.
//!
//! Entries are keyed by deviceID and carry a TTL in keeper ticks. Priorities
//! come from a monotonic counter that never decreases, not even across
//! removals or a table truncation, so takeover order stays stable across
//! churn. Iteration order is insertion (= election) order.

use parking_lot::Mutex;

/// One elected backup.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupEntry {
    pub device_id: String,
    pub device_ip: String,
    /// Election rank; 1 is the first backup to take over.
    pub priority: u32,
    /// Remaining keeper ticks; the entry expires when it drops below zero.
    pub ttl: i64,
}

struct TableInner {
    entries: Vec<BackupEntry>,
    next_priority: u32,
}

/// Mutex-serialized table of [`BackupEntry`] records.
pub struct BackupTable {
    inner: Mutex<TableInner>,
}

impl Default for BackupTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupTable {
    pub fn new() -> Self {
        BackupTable {
            inner: Mutex::new(TableInner { entries: Vec::new(), next_priority: 1 }),
        }
    }

    /// Look up an entry by deviceID.
    pub fn find(&self, device_id: &str) -> Option<BackupEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|e| e.device_id == device_id)
            .cloned()
    }

    /// Insert a new backup with the next monotonic priority and the given
    /// TTL. No-op returning `None` when the deviceID is already enrolled.
    pub fn insert(&self, device_id: &str, device_ip: &str, ttl: i64) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.entries.iter().any(|e| e.device_id == device_id) {
            return None;
        }
        let priority = inner.next_priority;
        inner.next_priority += 1;
        inner.entries.push(BackupEntry {
            device_id: device_id.to_string(),
            device_ip: device_ip.to_string(),
            priority,
            ttl,
        });
        Some(priority)
    }

    /// Remove an entry by deviceID. The priority counter is untouched.
    pub fn remove(&self, device_id: &str) -> Option<BackupEntry> {
        let mut inner = self.inner.lock();
        let pos = inner.entries.iter().position(|e| e.device_id == device_id)?;
        Some(inner.entries.remove(pos))
    }

    /// Reset the TTL of the given backup. Returns its priority when found.
    pub fn refresh_ttl(&self, device_id: &str, ttl: i64) -> Option<u32> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.iter_mut().find(|e| e.device_id == device_id)?;
        entry.ttl = ttl;
        Some(entry.priority)
    }

    /// Decrement every TTL by `decrement`; entries that drop below zero are
    /// removed and returned.
    pub fn tick_all(&self, decrement: i64) -> Vec<BackupEntry> {
        let mut inner = self.inner.lock();
        for entry in inner.entries.iter_mut() {
            entry.ttl -= decrement;
        }
        let mut expired = Vec::new();
        inner.entries.retain(|e| {
            if e.ttl < 0 {
                expired.push(e.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Number of entries whose TTL has not expired.
    pub fn alive_count(&self) -> usize {
        self.inner.lock().entries.iter().filter(|e| e.ttl >= 0).count()
    }

    /// Copy of the table in insertion order.
    pub fn snapshot(&self) -> Vec<BackupEntry> {
        self.inner.lock().entries.clone()
    }

    /// Drop every entry but keep the priority counter running.
    pub fn truncate(&self) {
        self.inner.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_assigns_increasing_priorities() {
        let table = BackupTable::new();
        assert_eq!(table.insert("agent/A", "10.0.0.1", 30), Some(1));
        assert_eq!(table.insert("agent/B", "10.0.0.2", 30), Some(2));
        assert_eq!(table.insert("agent/C", "10.0.0.3", 30), Some(3));
    }

    #[test]
    fn duplicate_device_id_is_a_noop() {
        let table = BackupTable::new();
        assert_eq!(table.insert("agent/A", "10.0.0.1", 30), Some(1));
        assert_eq!(table.insert("agent/A", "10.0.0.9", 30), None);
        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].device_ip, "10.0.0.1");
    }

    #[test]
    fn priorities_never_reuse_after_removal() {
        let table = BackupTable::new();
        table.insert("agent/A", "10.0.0.1", 30);
        table.insert("agent/B", "10.0.0.2", 30);
        assert!(table.remove("agent/A").is_some());
        // The freed rank 1 is gone for good.
        assert_eq!(table.insert("agent/C", "10.0.0.3", 30), Some(3));
    }

    #[test]
    fn truncate_keeps_the_counter_running() {
        let table = BackupTable::new();
        table.insert("agent/A", "10.0.0.1", 30);
        table.insert("agent/B", "10.0.0.2", 30);
        table.truncate();
        assert!(table.snapshot().is_empty());
        assert_eq!(table.insert("agent/C", "10.0.0.3", 30), Some(3));
    }

    #[test]
    fn iteration_is_insertion_order() {
        let table = BackupTable::new();
        table.insert("agent/C", "10.0.0.3", 30);
        table.insert("agent/A", "10.0.0.1", 30);
        table.insert("agent/B", "10.0.0.2", 30);
        let ids: Vec<String> = table.snapshot().into_iter().map(|e| e.device_id).collect();
        assert_eq!(ids, vec!["agent/C", "agent/A", "agent/B"]);
    }

    #[test]
    fn tick_all_expires_only_negative_ttls() {
        let table = BackupTable::new();
        table.insert("agent/A", "10.0.0.1", 0);
        table.insert("agent/B", "10.0.0.2", 5);
        // First tick: A goes to -1 and expires, B survives at 4.
        let expired = table.tick_all(1);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].device_id, "agent/A");
        assert_eq!(table.snapshot().len(), 1);
        assert_eq!(table.alive_count(), 1);
    }

    #[test]
    fn refresh_restores_ttl_and_reports_priority() {
        let table = BackupTable::new();
        table.insert("agent/A", "10.0.0.1", 30);
        for _ in 0..10 {
            table.tick_all(1);
        }
        assert_eq!(table.snapshot()[0].ttl, 20);
        assert_eq!(table.refresh_ttl("agent/A", 30), Some(1));
        assert_eq!(table.snapshot()[0].ttl, 30);
        assert_eq!(table.refresh_ttl("agent/X", 30), None);
    }

    #[test]
    fn refreshed_backup_survives_a_full_ttl_window() {
        // A backup refreshed before MAX_TTL ticks elapse is never demoted.
        let table = BackupTable::new();
        table.insert("agent/A", "10.0.0.1", 30);
        for round in 0..5 {
            for _ in 0..30 {
                assert!(table.tick_all(1).is_empty(), "expired in round {}", round);
            }
            assert_eq!(table.refresh_ttl("agent/A", 30), Some(1));
        }
        assert_eq!(table.alive_count(), 1);
    }
}
