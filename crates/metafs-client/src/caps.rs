//! Capability handling
//!
//! Caps are granted per (inode, MDS) and authorize what the client may cache
//! or mutate. A grant that shrinks the issued mask is a revoke: any dirty
//! bits being revoked are flushed first, then the reduced mask is acked.
//! Everything here runs under the owning session's mutex when driven by
//! inbound messages, which keeps per-MDS cap traffic ordered.

use crate::client::MdsClient;
use crate::inode::{Cap, FileMode, InodeState};
use crate::request::Request;
use crate::session::Session;
use metafs_common::{Error, Ino, MdsRank, MdsState, Result};
use metafs_proto::{
    CapMask, CapMessage, CapOp, CapReleaseItem, InodeInfo, Message, ReleaseRecord, ReplyDir,
    ReplyMessage, SessionMessage, SessionOp, TraceCap,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Dirty caps younger than this are left to accumulate before flushing.
const CAP_FLUSH_DELAY: Duration = Duration::from_secs(5);

/// Link a brand-new cap into both the inode and the session.
/// Caller holds the inode lock.
fn insert_cap_locked(
    st: &mut InodeState,
    session: &Arc<Session>,
    ino: Ino,
    cap_id: u64,
    issued: CapMask,
    seq: u64,
    issue_seq: u64,
    mseq: u64,
    auth: bool,
) {
    let gen = {
        let mut caps = session.caps.lock();
        caps.inos.insert(ino);
        caps.cap_gen
    };
    st.caps.insert(
        session.mds,
        Cap {
            cap_id,
            session: session.clone(),
            issued,
            implemented: issued,
            seq,
            issue_seq,
            mseq,
            gen,
        },
    );
    if auth || st.auth.is_none() {
        st.auth = Some(session.mds);
    }
}

impl MdsClient {
    /// Create-or-update a cap from a reply trace.
    pub(crate) fn add_cap(&self, session: &Arc<Session>, ino: Ino, grant: &TraceCap) {
        let inode = self.inodes.get_or_insert(ino);
        {
            let mut st = inode.lock.lock();
            if st.caps.contains_key(&session.mds) {
                let gen = session.caps.lock().cap_gen;
                let cap = st.caps.get_mut(&session.mds).expect("checked above");
                cap.gen = gen;
                cap.issued = grant.issued;
                cap.implemented = cap.implemented | grant.issued;
                cap.seq = grant.seq;
                cap.issue_seq = grant.seq;
                cap.mseq = grant.mseq;
            } else {
                debug!(%ino, mds = session.mds, issued = %grant.issued, "new cap");
                insert_cap_locked(
                    &mut st,
                    session,
                    ino,
                    grant.cap_id,
                    grant.issued,
                    grant.seq,
                    grant.seq,
                    grant.mseq,
                    grant.auth,
                );
            }
            if grant.auth {
                st.auth = Some(session.mds);
            }
        }
        inode.cap_cv.notify_all();
    }

    /// Unlink the cap from both the inode and its session; re-elect the auth
    /// cap if the removed one held that role. Caller holds the inode lock.
    pub(crate) fn remove_cap_locked(
        &self,
        ino: Ino,
        st: &mut InodeState,
        rank: MdsRank,
        queue_release: bool,
    ) {
        let Some(cap) = st.caps.remove(&rank) else {
            return;
        };
        debug!(%ino, mds = rank, issued = %cap.issued, "removing cap");
        {
            let mut caps = cap.session.caps.lock();
            caps.inos.remove(&ino);
            caps.flushing.retain(|i| *i != ino);
        }
        if queue_release {
            cap.session.queue_cap_release(
                CapReleaseItem {
                    ino,
                    cap_id: cap.cap_id,
                    migrate_seq: cap.mseq,
                    seq: cap.seq,
                },
                self.config.caps_per_release,
            );
        }
        if st.auth == Some(rank) {
            st.auth = st.caps.keys().min().copied();
        }
    }

    /// OR of issued bits across this inode's live caps. Caps minted under a
    /// stale session generation are removed on sight.
    #[must_use]
    pub fn caps_issued(&self, ino: Ino) -> CapMask {
        let Some(inode) = self.inodes.get(ino) else {
            return CapMask::EMPTY;
        };
        let mut st = inode.lock.lock();
        let dead: Vec<MdsRank> = st
            .caps
            .iter()
            .filter(|(_, cap)| !cap.is_current_gen())
            .map(|(rank, _)| *rank)
            .collect();
        for rank in dead {
            debug!(%ino, mds = rank, "dropping cap from stale generation");
            self.remove_cap_locked(ino, &mut st, rank, false);
        }
        st.issued_raw(Instant::now())
    }

    /// Caps this inode wants issued, from its open modes and page state.
    #[must_use]
    pub fn caps_wanted(&self, ino: Ino) -> CapMask {
        self.inodes
            .get(ino)
            .map_or(CapMask::EMPTY, |inode| inode.lock.lock().wanted())
    }

    // ---- inbound cap messages ----

    pub(crate) fn handle_caps(&self, from: MdsRank, msg: CapMessage) {
        let session = {
            let state = self.mutex.lock();
            self.lookup_session(&state, from)
        };
        let Some(session) = session else {
            error!(mds = from, "cap message but no session");
            return;
        };

        let mut flushed = false;
        {
            let mut core = session.mutex.lock();
            core.seq += 1;
            match msg.op {
                CapOp::Grant => self.handle_cap_grant(&session, &msg),
                CapOp::FlushAck => flushed = self.handle_flush_ack(&session, &msg),
                CapOp::Update => {
                    warn!(mds = from, "client-direction cap op from mds");
                }
            }
            drop(core);
        }
        if flushed {
            let _guard = self.flush_lock.lock();
            self.flush_cv.notify_all();
        }
    }

    /// Apply a grant. A shrinking mask is a revoke: flush dirty bits being
    /// revoked, then ack with the new mask. A growing mask wakes waiters.
    fn handle_cap_grant(&self, session: &Arc<Session>, msg: &CapMessage) {
        let inode = self.inodes.get_or_insert(msg.ino);
        let mut wake = false;
        let mut update: Option<CapMessage> = None;
        {
            let mut st = inode.lock.lock();
            if st.caps.contains_key(&session.mds) {
                let gen = session.caps.lock().cap_gen;
                let wanted = st.wanted();
                let (revoking, dirty_revoked) = {
                    let cap = st.caps.get(&session.mds).expect("checked above");
                    let revoking = cap.issued.difference(msg.caps);
                    (revoking, st.dirty & revoking)
                };

                if wanted.is_empty() {
                    debug!(ino = %msg.ino, mds = session.mds, "nothing wanted, acking grant");
                    let cap = st.caps.get_mut(&session.mds).expect("checked above");
                    cap.gen = gen;
                    cap.issued = msg.caps;
                    cap.implemented = msg.caps;
                    cap.seq = msg.seq;
                    cap.issue_seq = msg.issue_seq;
                    cap.mseq = msg.mseq;
                    update = self.build_cap_update(msg.ino, &st, session.mds, wanted, CapMask::EMPTY);
                } else if !revoking.is_empty() {
                    debug!(
                        ino = %msg.ino,
                        mds = session.mds,
                        revoking = %revoking,
                        dirty = %dirty_revoked,
                        "revoking caps"
                    );
                    {
                        let cap = st.caps.get_mut(&session.mds).expect("checked above");
                        cap.gen = gen;
                        cap.implemented = cap.issued | msg.caps;
                        cap.issued = msg.caps;
                        cap.seq = msg.seq;
                        cap.issue_seq = msg.issue_seq;
                        cap.mseq = msg.mseq;
                    }
                    if !dirty_revoked.is_empty() {
                        // dirty state covered by the revoked bits goes to
                        // the MDS before the ack
                        self.start_cap_flush_locked(session, msg.ino, &mut st, dirty_revoked);
                    }
                    update =
                        self.build_cap_update(msg.ino, &st, session.mds, wanted, dirty_revoked);
                } else {
                    debug!(ino = %msg.ino, mds = session.mds, issued = %msg.caps, "grant");
                    let cap = st.caps.get_mut(&session.mds).expect("checked above");
                    cap.gen = gen;
                    cap.issued = msg.caps;
                    cap.implemented = cap.implemented | msg.caps;
                    cap.seq = msg.seq;
                    cap.issue_seq = msg.issue_seq;
                    cap.mseq = msg.mseq;
                    wake = true;
                }
            } else {
                debug!(ino = %msg.ino, mds = session.mds, issued = %msg.caps, "grant from new mds");
                insert_cap_locked(
                    &mut st,
                    session,
                    msg.ino,
                    msg.cap_id,
                    msg.caps,
                    msg.seq,
                    msg.issue_seq,
                    msg.mseq,
                    false,
                );
                wake = true;
            }

            // while we hold the exclusive-writer bit our local size and
            // times are authoritative
            let exclusive = st.issued_raw(Instant::now()).contains(CapMask::WR_EXCL);
            if st.dirty.is_empty() && st.flushing.is_empty() && !exclusive {
                st.size = msg.size;
                st.mtime = msg.mtime;
                st.atime = msg.atime;
            }
        }
        if let Some(update) = update {
            session.send(Message::Caps(update));
        }
        if wake {
            inode.cap_cv.notify_all();
        }
    }

    /// The MDS has durably absorbed a flush.
    fn handle_flush_ack(&self, session: &Arc<Session>, msg: &CapMessage) -> bool {
        let Some(inode) = self.inodes.get(msg.ino) else {
            debug!(ino = %msg.ino, "flush ack for unknown inode");
            return false;
        };
        {
            let mut st = inode.lock.lock();
            st.flushing = st.flushing.difference(msg.dirty);
            debug!(
                ino = %msg.ino,
                acked = %msg.dirty,
                remaining = %st.flushing,
                "flush ack"
            );
            if st.flushing.is_empty() {
                session.caps.lock().flushing.retain(|i| *i != msg.ino);
            }
        }
        inode.cap_cv.notify_all();
        true
    }

    /// Client → MDS cap update (revoke ack, flush, or release-of-interest).
    fn build_cap_update(
        &self,
        ino: Ino,
        st: &InodeState,
        rank: MdsRank,
        wanted: CapMask,
        dirty: CapMask,
    ) -> Option<CapMessage> {
        let cap = st.caps.get(&rank)?;
        Some(CapMessage {
            op: CapOp::Update,
            ino,
            cap_id: cap.cap_id,
            seq: cap.seq,
            issue_seq: cap.issue_seq,
            mseq: cap.mseq,
            caps: cap.issued,
            wanted,
            dirty,
            size: st.size,
            mtime: st.mtime,
            atime: st.atime,
        })
    }

    // ---- dirty caps and flush sequencing ----

    /// Note locally modified metadata; the flush happens on a later tick (or
    /// immediately on sync/revoke).
    pub fn mark_dirty(&self, ino: Ino, mask: CapMask) {
        debug!(%ino, dirty = %mask, "marking caps dirty");
        {
            let mut state = self.mutex.lock();
            state.cap_dirty.entry(ino).or_insert_with(Instant::now);
        }
        self.inodes.get_or_insert(ino).lock.lock().dirty |= mask;
    }

    /// Flush dirty caps that have aged past the delay (all of them when
    /// `flush_all`).
    pub(crate) fn check_delayed_caps(&self, flush_all: bool) {
        let due: Vec<Ino> = {
            let mut state = self.mutex.lock();
            if flush_all {
                state.cap_dirty.drain().map(|(ino, _)| ino).collect()
            } else {
                let now = Instant::now();
                let due: Vec<Ino> = state
                    .cap_dirty
                    .iter()
                    .filter(|(_, since)| now.duration_since(**since) >= CAP_FLUSH_DELAY)
                    .map(|(ino, _)| *ino)
                    .collect();
                for ino in &due {
                    state.cap_dirty.remove(ino);
                }
                due
            }
        };
        for ino in due {
            self.flush_dirty_caps(ino);
        }
    }

    /// Start flushing everything dirty on `ino` through its auth session.
    pub fn flush_dirty_caps(&self, ino: Ino) {
        let Some(inode) = self.inodes.get(ino) else {
            return;
        };
        let mut st = inode.lock.lock();
        if st.dirty.is_empty() {
            return;
        }
        let Some(auth) = st.auth else {
            warn!(%ino, dirty = %st.dirty, "dirty caps but no auth cap");
            return;
        };
        let Some(session) = st.caps.get(&auth).map(|cap| cap.session.clone()) else {
            return;
        };
        let bits = st.dirty;
        self.start_cap_flush_locked(&session, ino, &mut st, bits);
        let wanted = st.wanted();
        let msg = self.build_cap_update(ino, &st, auth, wanted, bits);
        drop(st);
        if let Some(msg) = msg {
            debug!(%ino, mds = session.mds, flushing = %bits, "flushing dirty caps");
            session.send(Message::Caps(msg));
        }
    }

    /// Move `bits` from dirty to flushing, stamp the flush sequence, and put
    /// the inode on the session's flushing list. Caller holds the inode
    /// lock and sends the flush message itself.
    pub(crate) fn start_cap_flush_locked(
        &self,
        session: &Arc<Session>,
        ino: Ino,
        st: &mut InodeState,
        bits: CapMask,
    ) {
        st.flushing |= bits;
        st.dirty = st.dirty.difference(bits);
        st.flush_seq = self.cap_flush_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%ino, bits = %bits, seq = st.flush_seq, "cap flush started");
        let mut caps = session.caps.lock();
        if !caps.flushing.contains(&ino) {
            caps.flushing.push(ino);
        }
    }

    /// Resend flush messages for everything this session was flushing; used
    /// when its MDS comes back active.
    pub(crate) fn kick_flushing_caps(&self, session: &Arc<Session>) {
        let inos = session.caps.lock().flushing.clone();
        for ino in inos {
            let Some(inode) = self.inodes.get(ino) else {
                continue;
            };
            let st = inode.lock.lock();
            if st.flushing.is_empty() {
                continue;
            }
            let wanted = st.wanted();
            let msg = self.build_cap_update(ino, &st, session.mds, wanted, st.flushing);
            drop(st);
            if let Some(msg) = msg {
                debug!(%ino, mds = session.mds, "kicking cap flush");
                session.send(Message::Caps(msg));
            }
        }
    }

    /// True when every flush up to `want` has been acked: no session's
    /// oldest flushing inode carries a sequence at or below it.
    pub(crate) fn check_cap_flush(&self, want: u64) -> bool {
        let sessions: Vec<Arc<Session>> = {
            let state = self.mutex.lock();
            state.sessions.iter().flatten().cloned().collect()
        };
        for session in sessions {
            let head = session.caps.lock().flushing.first().copied();
            let Some(ino) = head else { continue };
            let Some(inode) = self.inodes.get(ino) else {
                continue;
            };
            let st = inode.lock.lock();
            if !st.flushing.is_empty() && st.flush_seq <= want {
                debug!(%ino, seq = st.flush_seq, want, mds = session.mds, "still flushing");
                return false;
            }
        }
        true
    }

    // ---- renewal and staleness ----

    /// Note the new cap ttl after an open or renew ack; a stale→fresh
    /// transition wakes every cap waiter on the session.
    pub(crate) fn renewed_caps(&self, session: &Arc<Session>, is_renew: bool, timeout: Duration) {
        let wake = {
            let mut caps = session.caps.lock();
            let now = Instant::now();
            let was_stale = is_renew && caps.cap_ttl.is_none_or(|ttl| now >= ttl);
            let base = caps.renew_requested.unwrap_or(now);
            caps.cap_ttl = Some(base + timeout);
            let fresh = caps.cap_ttl.is_some_and(|ttl| now < ttl);
            if was_stale {
                if fresh {
                    info!(mds = session.mds, "caps renewed");
                } else {
                    info!(mds = session.mds, "caps still stale");
                }
            }
            was_stale && fresh
        };
        if wake {
            self.wake_up_session_caps(session);
        }
    }

    /// Ask the MDS to renew everything issued on this session. Recovering
    /// ranks that have not reached reconnect are left alone.
    pub(crate) fn send_renew_caps(&self, session: &Arc<Session>, mstate: MdsState) {
        {
            let caps = session.caps.lock();
            if caps.cap_ttl.is_some_and(|ttl| Instant::now() >= ttl) {
                info!(mds = session.mds, "session caps stale");
            }
        }
        if mstate < MdsState::Reconnect {
            debug!(mds = session.mds, state = %mstate, "not renewing caps yet");
            return;
        }
        debug!(mds = session.mds, state = %mstate, "renewing caps");
        session.caps.lock().renew_requested = Some(Instant::now());
        session.send(Message::Session(SessionMessage {
            op: SessionOp::RequestRenewCaps,
            seq: 0,
            max_caps: None,
        }));
    }

    /// Wake every thread waiting on caps from this session; caps that did
    /// not survive a reconnect (stale generation) are removed first so the
    /// waiters observe the loss.
    pub(crate) fn wake_up_session_caps(&self, session: &Arc<Session>) {
        debug!(mds = session.mds, "waking session cap waiters");
        let gen = session.caps.lock().cap_gen;
        let inos: Vec<Ino> = session.caps.lock().inos.iter().copied().collect();
        for ino in inos {
            let Some(inode) = self.inodes.get(ino) else {
                continue;
            };
            {
                let mut st = inode.lock.lock();
                if st
                    .caps
                    .get(&session.mds)
                    .is_some_and(|cap| cap.gen != gen)
                {
                    error!(%ino, mds = session.mds, "cap did not survive reconnect, removing");
                    self.remove_cap_locked(ino, &mut st, session.mds, false);
                }
            }
            inode.cap_cv.notify_all();
        }
    }

    /// Drop every cap issued through this session (session teardown).
    pub(crate) fn remove_session_caps(&self, session: &Arc<Session>) {
        debug!(mds = session.mds, "removing session caps");
        let inos: Vec<Ino> = session.caps.lock().inos.iter().copied().collect();
        for ino in inos {
            let Some(inode) = self.inodes.get(ino) else {
                continue;
            };
            {
                let mut st = inode.lock.lock();
                self.remove_cap_locked(ino, &mut st, session.mds, false);
            }
            inode.cap_cv.notify_all();
            self.inodes.remove_if_evictable(ino);
        }
        let mut caps = session.caps.lock();
        caps.inos.clear();
        caps.flushing.clear();
        drop(caps);
        session.cleanup_cap_releases();
    }

    // ---- trimming ----

    /// Respond to MDS memory pressure: drop caps that are neither dirty nor
    /// needed until at most `max` remain. An unused sole cap lets the whole
    /// inode be evicted.
    pub(crate) fn trim_caps(&self, session: &Arc<Session>, max: usize) {
        let nr = session.nr_caps();
        if nr <= max {
            return;
        }
        let mut budget = nr - max;
        debug!(mds = session.mds, nr, max, "trimming caps");
        let inos: Vec<Ino> = session.caps.lock().inos.iter().copied().collect();
        for ino in inos {
            if budget == 0 {
                break;
            }
            let Some(inode) = self.inodes.get(ino) else {
                continue;
            };
            let mut st = inode.lock.lock();
            let Some(cap) = st.caps.get(&session.mds) else {
                continue;
            };
            let mine = cap.issued | cap.implemented;
            let oissued = st
                .caps
                .iter()
                .filter(|(rank, _)| **rank != session.mds)
                .fold(CapMask::EMPTY, |acc, (_, cap)| acc | cap.issued);
            let used = st.used();
            if !st.dirty.is_empty() {
                continue; // dirty caps stay
            }
            if !(used.difference(oissued) & mine).is_empty() {
                continue; // we need these caps
            }
            budget -= 1;
            if !oissued.is_empty() {
                // not the only cap; just drop ours
                self.remove_cap_locked(ino, &mut st, session.mds, true);
            } else if st.pins == 0 && st.open_by_mode.iter().all(|&n| n == 0) {
                self.remove_cap_locked(ino, &mut st, session.mds, true);
                drop(st);
                self.inodes.remove_if_evictable(ino);
            }
        }
        debug!(mds = session.mds, nr_caps = session.nr_caps(), "trim done");
    }

    // ---- open-mode bookkeeping and waiters ----

    /// Record a file handle opened in `mode`; feeds the wanted mask.
    pub fn note_open(&self, ino: Ino, mode: FileMode) {
        self.inodes.get_or_insert(ino).lock.lock().open_by_mode[mode as usize] += 1;
    }

    /// Record a file handle closing.
    pub fn note_close(&self, ino: Ino, mode: FileMode) {
        if let Some(inode) = self.inodes.get(ino) {
            let mut st = inode.lock.lock();
            let count = &mut st.open_by_mode[mode as usize];
            *count = count.saturating_sub(1);
        }
        self.inodes.remove_if_evictable(ino);
    }

    /// Tell the cap cache whether the page cache holds dirty data for the
    /// inode; modulates the wanted mask.
    pub fn set_dirty_data(&self, ino: Ino, dirty: bool) {
        if let Some(inode) = self.inodes.get(ino) {
            inode.lock.lock().dirty_data = dirty;
        }
    }

    /// Record a write performed locally under the exclusive-writer cap.
    /// With `WR | WR_EXCL` issued the client may extend the file and stamp
    /// the mtime itself instead of round-tripping to the MDS; the change is
    /// flushed later like any other dirty metadata. Returns false when the
    /// issued caps do not cover the write.
    pub fn note_local_write(&self, ino: Ino, size: u64, mtime: SystemTime) -> bool {
        let Some(inode) = self.inodes.get(ino) else {
            return false;
        };
        {
            let mut st = inode.lock.lock();
            let issued = st.issued_raw(Instant::now());
            if !issued.contains(CapMask::WR | CapMask::WR_EXCL) {
                return false;
            }
            debug!(%ino, size, "local write under exclusive cap");
            st.size = st.size.max(size);
            st.mtime = mtime;
            st.dirty |= CapMask::WR;
        }
        let mut state = self.mutex.lock();
        state.cap_dirty.entry(ino).or_insert_with(Instant::now);
        true
    }

    /// Block until `want` caps are issued, or the timeout passes. Waiters
    /// are woken by grants, flush acks, and invalidations.
    pub fn wait_caps(&self, ino: Ino, want: CapMask, timeout: Duration) -> bool {
        let inode = self.inodes.get_or_insert(ino);
        let deadline = Instant::now() + timeout;
        let mut st = inode.lock.lock();
        loop {
            if st.issued_raw(Instant::now()).contains(want) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = inode.cap_cv.wait_for(&mut st, deadline - now);
        }
    }

    // ---- request-embedded cap releases ----

    /// Encode the promise to drop `drop_mask` on the target inode, unless
    /// the client still wants any of the `unless` bits. Dirty bits are never
    /// dropped this way.
    pub(crate) fn encode_inode_release(
        &self,
        ino: Ino,
        mds: MdsRank,
        drop_mask: CapMask,
        unless: CapMask,
    ) -> Option<ReleaseRecord> {
        let inode = self.inodes.get(ino)?;
        let mut st = inode.lock.lock();
        let wanted = st.wanted();
        if unless.intersects(wanted) {
            return None;
        }
        if st.dirty.intersects(drop_mask) {
            return None;
        }
        let cap = st.caps.get_mut(&mds)?;
        if !cap.issued.intersects(drop_mask) {
            return None;
        }
        cap.issued = cap.issued.difference(drop_mask);
        cap.implemented = cap.implemented.difference(drop_mask);
        debug!(%ino, mds, dropping = %drop_mask, left = %cap.issued, "embedding cap release");
        Some(ReleaseRecord {
            ino,
            cap_id: cap.cap_id,
            caps: cap.issued,
            wanted,
            seq: cap.seq,
            issue_seq: cap.issue_seq,
            mseq: cap.mseq,
            dname: None,
        })
    }

    /// Encode the surrender of a dentry lease held from `mds`.
    pub(crate) fn encode_dentry_release(
        &self,
        dir: Ino,
        name: &str,
        mds: MdsRank,
    ) -> Option<ReleaseRecord> {
        let seq = self.leases.revoke(dir, name, mds)?;
        debug!(%dir, name, mds, "embedding dentry release");
        Some(ReleaseRecord {
            ino: dir,
            cap_id: 0,
            caps: CapMask::EMPTY,
            wanted: CapMask::EMPTY,
            seq,
            issue_seq: 0,
            mseq: 0,
            dname: Some(name.to_string()),
        })
    }

    // ---- reply trace fill ----

    /// Insert the dentry+inode trace of a reply into the cache. Runs under
    /// the replying session's mutex so traces apply in arrival order.
    pub(crate) fn fill_trace(
        &self,
        session: &Arc<Session>,
        req: &Arc<Request>,
        reply: &ReplyMessage,
    ) -> Result<()> {
        let Some(trace) = &reply.trace else {
            debug!(tid = reply.tid, "reply had no trace");
            return Ok(());
        };
        if trace.dname.is_some() && trace.dir.is_none() {
            return Err(Error::protocol("trace names a dentry but has no directory"));
        }

        if let Some(dir) = &trace.dir {
            self.update_inode(session, dir);
        }
        if let (Some(dir), Some(dname)) = (&trace.dir, &trace.dname) {
            if let Some(target) = &trace.target {
                self.inodes
                    .get_or_insert(target.ino)
                    .lock
                    .lock()
                    .primary_dentry = Some((dir.ino, dname.clone()));
            }
            if let Some(dlease) = trace.dlease {
                let gen = session.caps.lock().cap_gen;
                self.leases.apply(dir.ino, dname, session.mds, gen, dlease);
            }
        }
        if let Some(target) = &trace.target {
            self.update_inode(session, target);
            req.state.lock().target_ino = Some(target.ino);
        }
        Ok(())
    }

    /// Refresh one cached inode from trace attributes. Locally dirty
    /// attributes, and those of an exclusive writer, win over the server's
    /// copy until they flush.
    pub(crate) fn update_inode(&self, session: &Arc<Session>, info: &InodeInfo) {
        let inode = self.inodes.get_or_insert(info.ino);
        {
            let mut st = inode.lock.lock();
            st.is_dir = info.mode & 0o170_000 == 0o040_000;
            let exclusive = st.issued_raw(Instant::now()).contains(CapMask::WR_EXCL);
            if st.dirty.is_empty() && st.flushing.is_empty() && !exclusive {
                st.size = info.size;
                st.mtime = info.mtime;
                st.atime = info.atime;
            }
            st.symlink = info.symlink.clone();
            if !info.frags.is_empty() {
                st.frags = info.frags.clone();
            }
            st.snap_realm = info.snap_realm;
        }
        if let Some(cap) = &info.cap {
            self.add_cap(session, info.ino, cap);
        }
    }

    /// Seed the cache with a readdir page: child inodes, their name links,
    /// and their dentry leases.
    pub(crate) fn readdir_prepopulate(
        &self,
        session: &Arc<Session>,
        parent: Ino,
        dir: &ReplyDir,
    ) {
        debug!(
            %parent,
            entries = dir.entries.len(),
            complete = dir.complete,
            end = dir.end,
            "prepopulating readdir"
        );
        let gen = session.caps.lock().cap_gen;
        for entry in &dir.entries {
            self.update_inode(session, &entry.inode);
            self.inodes
                .get_or_insert(entry.inode.ino)
                .lock
                .lock()
                .primary_dentry = Some((parent, entry.name.clone()));
            self.leases.apply(parent, &entry.name, session.mds, gen, entry.lease);
        }
    }
}
