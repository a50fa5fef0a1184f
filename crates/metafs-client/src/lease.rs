//! Dentry leases
//!
//! A lease is a short-lived right to trust a cached name → inode mapping.
//! The MDS grants one alongside reply traces and readdir entries, may revoke
//! it at any time, and extends it when the client asks before expiry.

use metafs_common::{Ino, MdsRank};
use metafs_proto::LeaseInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Cached lease terms for one dentry
#[derive(Clone, Debug)]
pub(crate) struct DentryLease {
    pub mds: MdsRank,
    /// Session cap generation at grant time; a stale session kills the lease
    pub gen: u32,
    pub seq: u64,
    pub expires: Instant,
    /// When a renewal should be requested
    pub renew_after: Option<Instant>,
    /// When the in-flight renewal was requested
    pub renew_from: Option<Instant>,
}

/// Lease cache keyed by (directory, name)
#[derive(Default)]
pub(crate) struct LeaseTable {
    map: Mutex<HashMap<(Ino, String), DentryLease>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lease granted in a reply trace.
    pub fn apply(&self, dir: Ino, name: &str, mds: MdsRank, gen: u32, info: LeaseInfo) {
        if info.duration_ms == 0 {
            return;
        }
        let now = Instant::now();
        let duration = Duration::from_millis(u64::from(info.duration_ms));
        self.map.lock().insert(
            (dir, name.to_string()),
            DentryLease {
                mds,
                gen,
                seq: info.seq,
                expires: now + duration,
                renew_after: Some(now + duration / 2),
                renew_from: None,
            },
        );
    }

    pub fn get(&self, dir: Ino, name: &str) -> Option<DentryLease> {
        self.map.lock().get(&(dir, name.to_string())).cloned()
    }

    /// Drop the lease if it was granted by `mds`; returns its seq for the
    /// revoke ack.
    pub fn revoke(&self, dir: Ino, name: &str, mds: MdsRank) -> Option<u64> {
        let mut map = self.map.lock();
        let key = (dir, name.to_string());
        match map.get(&key) {
            Some(lease) if lease.mds == mds => {
                let seq = lease.seq;
                map.remove(&key);
                Some(seq)
            }
            _ => None,
        }
    }

    /// Apply a renewal ack: only honored if the renewal is actually in
    /// flight and the lease still belongs to this session generation.
    pub fn renew_ack(&self, dir: Ino, name: &str, mds: MdsRank, gen: u32, seq: u64, duration_ms: u32) {
        let mut map = self.map.lock();
        let Some(lease) = map.get_mut(&(dir, name.to_string())) else {
            return;
        };
        if lease.mds != mds || lease.gen != gen {
            return;
        }
        let Some(from) = lease.renew_from else {
            return;
        };
        if lease.renew_after.is_some() {
            return;
        }
        let duration = Duration::from_millis(u64::from(duration_ms));
        lease.seq = seq;
        lease.expires = from + duration;
        lease.renew_after = Some(from + duration / 2);
        lease.renew_from = None;
    }

    /// Mark a renewal as requested. Returns the (mds, seq) to send, or
    /// `None` when no renewal is due.
    pub fn begin_renew(&self, dir: Ino, name: &str) -> Option<(MdsRank, u64)> {
        let mut map = self.map.lock();
        let lease = map.get_mut(&(dir, name.to_string()))?;
        let now = Instant::now();
        if lease.renew_from.is_some() || now >= lease.expires {
            return None;
        }
        match lease.renew_after {
            Some(after) if now >= after => {
                lease.renew_from = Some(now);
                lease.renew_after = None;
                Some((lease.mds, lease.seq))
            }
            _ => None,
        }
    }

    /// Take the lease for a preemptive release, if it is unexpired and was
    /// granted under the session's current cap generation.
    pub fn release(&self, dir: Ino, name: &str, current_gen: u32) -> Option<DentryLease> {
        let mut map = self.map.lock();
        let key = (dir, name.to_string());
        let lease = map.get(&key)?;
        if Instant::now() >= lease.expires || lease.gen != current_gen {
            return None;
        }
        map.remove(&key)
    }

    /// Drop expired leases.
    pub fn trim(&self) {
        let now = Instant::now();
        self.map.lock().retain(|_, lease| now < lease.expires);
    }

    /// Drop everything (umount).
    pub fn clear(&self) {
        self.map.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_lease(duration_ms: u32) -> LeaseTable {
        let table = LeaseTable::new();
        table.apply(
            Ino::ROOT,
            "etc",
            0,
            1,
            LeaseInfo {
                duration_ms,
                seq: 7,
            },
        );
        table
    }

    #[test]
    fn test_zero_duration_not_cached() {
        let table = table_with_lease(0);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_revoke_returns_seq() {
        let table = table_with_lease(30_000);
        // wrong mds leaves the lease alone
        assert_eq!(table.revoke(Ino::ROOT, "etc", 9), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.revoke(Ino::ROOT, "etc", 0), Some(7));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_renew_ack_requires_in_flight_renewal() {
        let table = table_with_lease(30_000);
        let before = table.get(Ino::ROOT, "etc").unwrap();
        // no renewal in flight: ignored
        table.renew_ack(Ino::ROOT, "etc", 0, 1, 9, 60_000);
        assert_eq!(table.get(Ino::ROOT, "etc").unwrap().seq, before.seq);
    }

    #[test]
    fn test_release_checks_generation() {
        let table = table_with_lease(30_000);
        assert!(table.release(Ino::ROOT, "etc", 2).is_none());
        assert!(table.release(Ino::ROOT, "etc", 1).is_some());
        assert_eq!(table.len(), 0);
    }
}
