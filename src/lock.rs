//! Per-entity table of outstanding peek-locks.
//!
//! Maps lock tokens to the locked message's sequence number and expiry.
//! The table lives inside its entity's store mutex; settlement validates
//! tokens here before touching the message arena.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Unique identifier for a locked message, used for settlement.
pub type LockToken = Uuid;

#[derive(Debug, Clone, Copy)]
pub(crate) struct LockEntry {
    pub sequence: u64,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    entries: HashMap<LockToken, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a fresh lock on the given sequence number.
    pub fn grant(&mut self, sequence: u64, duration: Duration) -> (LockToken, Instant) {
        let token = Uuid::new_v4();
        let expires_at = Instant::now() + duration;
        self.entries.insert(token, LockEntry { sequence, expires_at });
        (token, expires_at)
    }

    /// Removes and returns the sequence number for a live lock. Expired and
    /// unknown tokens yield `None`; expired entries are dropped on the way.
    pub fn redeem(&mut self, token: LockToken) -> Option<u64> {
        match self.entries.remove(&token) {
            Some(entry) if Instant::now() < entry.expires_at => Some(entry.sequence),
            _ => None,
        }
    }

    /// Extends a live lock by `duration` from now. Returns the sequence
    /// number and new expiry, or `None` for expired/unknown tokens.
    pub fn renew(&mut self, token: LockToken, duration: Duration) -> Option<(u64, Instant)> {
        let now = Instant::now();
        let entry = self.entries.get_mut(&token)?;
        if now >= entry.expires_at {
            self.entries.remove(&token);
            return None;
        }
        entry.expires_at = now + duration;
        Some((entry.sequence, entry.expires_at))
    }

    /// Removes all expired locks, returning their (token, sequence) pairs.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<(LockToken, u64)> {
        let expired: Vec<(LockToken, u64)> = self
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(token, entry)| (*token, entry.sequence))
            .collect();
        for (token, _) in &expired {
            self.entries.remove(token);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_redeem() {
        let mut table = LockTable::new();
        let (token, expires_at) = table.grant(7, Duration::from_secs(30));
        assert!(expires_at > Instant::now());
        assert_eq!(table.redeem(token), Some(7));
        // Second redeem fails: the lock is gone.
        assert_eq!(table.redeem(token), None);
    }

    #[test]
    fn test_redeem_expired_lock_fails() {
        let mut table = LockTable::new();
        let (token, _) = table.grant(1, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(table.redeem(token), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_renew_extends_expiry() {
        let mut table = LockTable::new();
        let (token, first) = table.grant(1, Duration::from_millis(50));
        let (sequence, renewed) = table.renew(token, Duration::from_secs(30)).unwrap();
        assert_eq!(sequence, 1);
        assert!(renewed > first);
        assert_eq!(table.redeem(token), Some(1));
    }

    #[test]
    fn test_drain_expired_leaves_live_locks() {
        let mut table = LockTable::new();
        let (dead, _) = table.grant(1, Duration::from_millis(0));
        let (live, _) = table.grant(2, Duration::from_secs(30));
        std::thread::sleep(Duration::from_millis(5));

        let drained = table.drain_expired(Instant::now());
        assert_eq!(drained, vec![(dead, 1)]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.redeem(live), Some(2));
    }
}
