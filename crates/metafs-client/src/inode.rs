//! The caps-relevant slice of the inode cache
//!
//! The client only models what capability handling needs: per-inode cap
//! state, dirty/flushing bookkeeping, the attributes echoed on reconnect,
//! and enough naming (a primary dentry per inode) to rebuild a path from the
//! root for a recovering MDS.

use crate::session::Session;
use metafs_common::{Ino, Tid};
use metafs_proto::{CapMask, FragInfo};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Open modes tracked per inode; each holds its own wanted-cap profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    Rd = 0,
    Wr = 1,
    RdWr = 2,
    Lazy = 3,
}

impl FileMode {
    /// Caps a file open in this mode wants issued. Writers also ask for the
    /// exclusive bit so size and mtime updates can stay local.
    #[must_use]
    pub fn wanted(&self) -> CapMask {
        match self {
            FileMode::Rd => CapMask::PIN | CapMask::RD | CapMask::RD_CACHE,
            FileMode::Wr => {
                CapMask::PIN | CapMask::WR | CapMask::WR_BUFFER | CapMask::WR_EXCL
            }
            FileMode::RdWr => {
                CapMask::PIN
                    | CapMask::RD
                    | CapMask::RD_CACHE
                    | CapMask::WR
                    | CapMask::WR_BUFFER
                    | CapMask::WR_EXCL
            }
            FileMode::Lazy => CapMask::PIN | CapMask::RD_LAZY,
        }
    }
}

/// One capability, held against one MDS
pub(crate) struct Cap {
    pub cap_id: u64,
    /// The granting session; strong so validity checks never race teardown
    pub session: Arc<Session>,
    pub issued: CapMask,
    /// Bits the MDS may still believe we use (not yet acked away)
    pub implemented: CapMask,
    pub seq: u64,
    pub issue_seq: u64,
    pub mseq: u64,
    /// Session cap generation at grant time
    pub gen: u32,
}

impl Cap {
    /// A cap is trusted only while its session generation matches and the
    /// session's cap lease has not expired.
    pub fn is_valid(&self, now: Instant) -> bool {
        let caps = self.session.caps.lock();
        self.gen == caps.cap_gen && caps.cap_ttl.is_some_and(|ttl| now < ttl)
    }

    /// Generation check alone; used when deciding whether the cap is dead
    /// (as opposed to merely stale-pending-renewal).
    pub fn is_current_gen(&self) -> bool {
        self.gen == self.session.caps.lock().cap_gen
    }
}

/// Caps-relevant inode state, guarded by the inode lock
pub(crate) struct InodeState {
    pub caps: HashMap<u32, Cap>,
    /// Rank of the authoritative cap, if any
    pub auth: Option<u32>,
    pub dirty: CapMask,
    pub flushing: CapMask,
    /// Coordinator flush sequence stamped when the current flush started
    pub flush_seq: u64,
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub symlink: Option<String>,
    pub frags: Vec<FragInfo>,
    pub snap_realm: Ino,
    pub is_dir: bool,
    /// Open file handles per mode
    pub open_by_mode: [u32; 4],
    /// Transient pins (in-flight requests referencing this inode)
    pub pins: u32,
    /// The page cache holds dirty data for this inode
    pub dirty_data: bool,
    /// Last known (parent, name) link, for path reconstruction
    pub primary_dentry: Option<(Ino, String)>,
    /// Tids of in-flight namespace mutations under this directory
    pub unsafe_ops: Vec<Tid>,
}

impl InodeState {
    fn new() -> Self {
        Self {
            caps: HashMap::new(),
            auth: None,
            dirty: CapMask::EMPTY,
            flushing: CapMask::EMPTY,
            flush_seq: 0,
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            atime: SystemTime::UNIX_EPOCH,
            symlink: None,
            frags: Vec::new(),
            snap_realm: Ino::ROOT,
            is_dir: false,
            open_by_mode: [0; 4],
            pins: 0,
            dirty_data: false,
            primary_dentry: None,
            unsafe_ops: Vec::new(),
        }
    }

    /// OR of issued bits across caps whose generation is current. Validity
    /// pruning of dead caps happens at the cap-cache layer.
    pub fn issued_raw(&self, now: Instant) -> CapMask {
        self.caps
            .values()
            .filter(|cap| cap.is_valid(now))
            .fold(CapMask::EMPTY, |acc, cap| acc | cap.issued)
    }

    /// Caps this inode wants, from its open modes and dirty page state.
    pub fn wanted(&self) -> CapMask {
        let modes = [FileMode::Rd, FileMode::Wr, FileMode::RdWr, FileMode::Lazy];
        let mut mask = CapMask::EMPTY;
        for mode in modes {
            if self.open_by_mode[mode as usize] > 0 {
                mask |= mode.wanted();
            }
        }
        if self.dirty_data {
            mask |= CapMask::WR_BUFFER;
        }
        mask
    }

    /// Caps actively in use (open handles, pins, dirty pages).
    pub fn used(&self) -> CapMask {
        let mut mask = self.wanted();
        if self.pins > 0 {
            mask |= CapMask::PIN;
        }
        mask
    }

    /// Nothing keeps this inode cached.
    pub fn is_evictable(&self) -> bool {
        self.caps.is_empty()
            && self.pins == 0
            && self.open_by_mode.iter().all(|&n| n == 0)
            && self.dirty.is_empty()
            && self.flushing.is_empty()
            && !self.dirty_data
            && self.unsafe_ops.is_empty()
    }

    /// Pick the fragment of a directory covering `hash`, if the fragment
    /// tree has been populated by a reply trace.
    pub fn choose_frag(&self, hash: u32) -> Option<&FragInfo> {
        self.frags.iter().find(|frag| {
            let mask = (1u32 << frag.bits).wrapping_sub(1);
            hash & mask == frag.value
        })
    }
}

/// A cached inode
pub(crate) struct Inode {
    pub ino: Ino,
    pub lock: Mutex<InodeState>,
    /// Wakes threads blocked waiting for cap grants
    pub cap_cv: Condvar,
}

impl Inode {
    fn new(ino: Ino) -> Arc<Self> {
        Arc::new(Self {
            ino,
            lock: Mutex::new(InodeState::new()),
            cap_cv: Condvar::new(),
        })
    }
}

/// The inode table
#[derive(Default)]
pub(crate) struct InodeCache {
    map: Mutex<HashMap<Ino, Arc<Inode>>>,
}

impl InodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ino: Ino) -> Option<Arc<Inode>> {
        self.map.lock().get(&ino).cloned()
    }

    pub fn get_or_insert(&self, ino: Ino) -> Arc<Inode> {
        self.map
            .lock()
            .entry(ino)
            .or_insert_with(|| Inode::new(ino))
            .clone()
    }

    pub fn contains(&self, ino: Ino) -> bool {
        self.map.lock().contains_key(&ino)
    }

    /// Evict the inode if nothing references it anymore. The caller must not
    /// hold the inode's lock.
    pub fn remove_if_evictable(&self, ino: Ino) -> bool {
        let mut map = self.map.lock();
        let evict = map
            .get(&ino)
            .is_some_and(|inode| inode.lock.lock().is_evictable());
        if evict {
            map.remove(&ino);
        }
        evict
    }

    /// Build the path of `ino` from the root, walking primary dentry links
    /// within `realm`. The walk stops at the root, at the first ancestor we
    /// have no name for, or at the first ancestor in a different snap realm;
    /// paths sent to a recovering MDS are relative to the realm boundary.
    /// Returns the base inode the path is relative to and the '/'-joined
    /// path.
    pub fn path_from_root(&self, ino: Ino, realm: Ino) -> (Ino, String) {
        let mut parts: Vec<String> = Vec::new();
        let mut cur = ino;
        // depth guard against dentry cycles from racing renames
        for _ in 0..256 {
            if cur == Ino::ROOT {
                break;
            }
            if cur != ino {
                let cur_realm = self.get(cur).map(|inode| inode.lock.lock().snap_realm);
                if cur_realm != Some(realm) {
                    break;
                }
            }
            let link = self
                .get(cur)
                .and_then(|inode| inode.lock.lock().primary_dentry.clone());
            match link {
                Some((parent, name)) => {
                    parts.push(name);
                    cur = parent;
                }
                None => break,
            }
        }
        parts.reverse();
        (cur, parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wanted_from_modes() {
        let mut state = InodeState::new();
        assert!(state.wanted().is_empty());
        state.open_by_mode[FileMode::Rd as usize] = 1;
        assert!(state.wanted().contains(CapMask::RD | CapMask::RD_CACHE));
        assert!(!state.wanted().contains(CapMask::WR));
        state.open_by_mode[FileMode::Wr as usize] = 1;
        assert!(state
            .wanted()
            .contains(CapMask::WR | CapMask::WR_BUFFER | CapMask::WR_EXCL));
        state.open_by_mode[FileMode::Wr as usize] = 0;
        state.dirty_data = true;
        assert!(state.wanted().contains(CapMask::WR_BUFFER));
    }

    #[test]
    fn test_evictable() {
        let mut state = InodeState::new();
        assert!(state.is_evictable());
        state.pins = 1;
        assert!(!state.is_evictable());
        state.pins = 0;
        state.dirty = CapMask::WR;
        assert!(!state.is_evictable());
    }

    #[test]
    fn test_choose_frag() {
        let mut state = InodeState::new();
        state.frags = vec![
            FragInfo {
                value: 0,
                bits: 1,
                auth: Some(0),
                dist: vec![],
            },
            FragInfo {
                value: 1,
                bits: 1,
                auth: Some(1),
                dist: vec![2, 3],
            },
        ];
        assert_eq!(state.choose_frag(4).unwrap().auth, Some(0));
        assert_eq!(state.choose_frag(5).unwrap().auth, Some(1));
    }

    #[test]
    fn test_path_from_root() {
        let cache = InodeCache::new();
        let a = Ino::new(10);
        let b = Ino::new(11);
        cache.get_or_insert(a).lock.lock().primary_dentry = Some((Ino::ROOT, "a".into()));
        cache.get_or_insert(b).lock.lock().primary_dentry = Some((a, "b".into()));
        let (base, path) = cache.path_from_root(b, Ino::ROOT);
        assert_eq!(base, Ino::ROOT);
        assert_eq!(path, "a/b");
        // unknown ancestor becomes the base
        let orphan = Ino::new(20);
        cache.get_or_insert(orphan);
        let (base, path) = cache.path_from_root(orphan, Ino::ROOT);
        assert_eq!(base, orphan);
        assert!(path.is_empty());
    }

    #[test]
    fn test_path_from_root_stops_at_snap_boundary() {
        let cache = InodeCache::new();
        let outer = Ino::new(0x20);
        let snapd = Ino::new(0x21);
        let leaf = Ino::new(0x22);
        cache.get_or_insert(outer).lock.lock().primary_dentry =
            Some((Ino::ROOT, "outer".into()));
        {
            let inode = cache.get_or_insert(snapd);
            let mut st = inode.lock.lock();
            st.primary_dentry = Some((outer, "snapd".into()));
            st.snap_realm = snapd;
        }
        {
            let inode = cache.get_or_insert(leaf);
            let mut st = inode.lock.lock();
            st.primary_dentry = Some((snapd, "f".into()));
            st.snap_realm = snapd;
        }

        // the walk leaves the snapped subtree at outer and stops there
        let (base, path) = cache.path_from_root(leaf, snapd);
        assert_eq!(base, outer);
        assert_eq!(path, "snapd/f");

        // within a single realm the walk still reaches the root
        let (base, path) = cache.path_from_root(outer, Ino::ROOT);
        assert_eq!(base, Ino::ROOT);
        assert_eq!(path, "outer");
    }
}
