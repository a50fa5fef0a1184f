//! The metadata client coordinator
//!
//! A cluster of MDS daemons manages the file system namespace, partitioned
//! hierarchically across ranks, and the partition moves as the cluster
//! rebalances. This client submits synchronous metadata requests (lookup,
//! open, unlink, ...) to that cluster. When an MDS fails we find out through
//! a new cluster map and resubmit affected requests; for the most part the
//! lossless channel per MDS means requests are sent exactly once.
//!
//! The client keeps a stateful session with each MDS it talks to, renews the
//! capabilities and leases issued through that session before they expire,
//! and walks a recovering MDS back through everything it granted us.
//!
//! Lock hierarchy, outermost first. A thread may only acquire a lock that
//! comes after everything it already holds:
//!
//! 1. coordinator mutex (`MdsClient::mutex`)
//! 2. snap realm rwlock
//! 3. session mutex (`Session::mutex`)
//! 4. request state (`Request::state`)
//! 5. inode table / inode lock
//! 6. session cap lock (`Session::caps`)
//!
//! The lease table sits at level 5, connection handles and completions are
//! leaves. `sync` additionally uses `flush_lock`, taken only with nothing
//! else held.

use crate::completion::Completion;
use crate::inode::InodeCache;
use crate::lease::LeaseTable;
use crate::mdsmap::MdsMap;
use crate::messenger::{MapSource, Messenger};
use crate::request::{Request, RequestState, Target};
use crate::session::{Session, SessionState};
use crate::snap::SnapRealms;
use metafs_common::{types::errno, ClientConfig, Epoch, Error, Ino, MdsRank, Result, Tid};
use metafs_proto::{
    CapReconnect, ForwardMessage, LeaseAction, LeaseMessage, MdsMapPayload, Message, Op, OpArgs,
    ReconnectMessage, ReleaseRecord, ReplyMessage, RequestMessage, SessionMessage, SessionOp,
    SnapMessage, SnapRealmInfo,
};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Requests are rekicked in batches of this many tids at a time.
const KICK_BATCH: usize = 10;

/// Estimated fixed encoding size of one cap reconnect record.
pub(crate) const RECONNECT_CAP_RECORD: usize = 56;
/// Estimated encoding size of one snap realm reconnect record.
pub(crate) const RECONNECT_REALM_RECORD: usize = 24;
/// Per-cap overhead budgeted for the variable-length path.
const RECONNECT_PATH_GUESS: usize = 100;

struct TickHandle {
    stop: Arc<Completion>,
    thread: thread::JoinHandle<()>,
}

/// State guarded by the coordinator mutex
pub(crate) struct CoreState {
    pub mdsmap: Option<Arc<MdsMap>>,
    /// Rank-indexed session table, grown by powers of two
    pub sessions: Vec<Option<Arc<Session>>>,
    pub last_tid: Tid,
    /// In-flight requests by tid; ordered so oldest-tid and batched range
    /// scans are cheap
    pub requests: BTreeMap<Tid, Arc<Request>>,
    /// Requests parked until a usable cluster map arrives
    pub waiting_for_map: Vec<Arc<Request>>,
    pub stopping: bool,
    pub last_renew_caps: Instant,
    /// Inodes with dirty caps awaiting a flush, and when they got dirty
    pub cap_dirty: HashMap<Ino, Instant>,
    tick: Option<TickHandle>,
}

/// The metadata client core.
///
/// Owns the session table and the request map, dispatches every inbound
/// message, runs the periodic maintenance tick, and coordinates shutdown.
pub struct MdsClient {
    pub(crate) config: ClientConfig,
    messenger: Arc<dyn Messenger>,
    map_source: Arc<dyn MapSource>,
    pub(crate) mutex: Mutex<CoreState>,
    pub(crate) snap: RwLock<SnapRealms>,
    pub(crate) inodes: InodeCache,
    pub(crate) leases: LeaseTable,
    /// Monotonic sequence stamped on every cap flush
    pub(crate) cap_flush_seq: AtomicU64,
    max_file_size: AtomicU64,
    /// Pairs with `flush_cv`; see the lock hierarchy note above
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) flush_cv: Condvar,
    safe_umount: Completion,
    session_close: Completion,
}

impl MdsClient {
    pub fn new(
        config: ClientConfig,
        messenger: Arc<dyn Messenger>,
        map_source: Arc<dyn MapSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            messenger,
            map_source,
            mutex: Mutex::new(CoreState {
                mdsmap: None,
                sessions: Vec::new(),
                last_tid: 0,
                requests: BTreeMap::new(),
                waiting_for_map: Vec::new(),
                stopping: false,
                last_renew_caps: Instant::now(),
                cap_dirty: HashMap::new(),
                tick: None,
            }),
            snap: RwLock::new(SnapRealms::new()),
            inodes: InodeCache::new(),
            leases: LeaseTable::new(),
            cap_flush_seq: AtomicU64::new(0),
            max_file_size: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
            flush_cv: Condvar::new(),
            safe_umount: Completion::new(),
            session_close: Completion::new(),
        })
    }

    /// Largest file size the cluster allows, from the current map.
    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size.load(Ordering::Relaxed)
    }

    /// Current map epoch, 0 before the first map.
    #[must_use]
    pub fn map_epoch(&self) -> Epoch {
        self.mutex
            .lock()
            .mdsmap
            .as_ref()
            .map_or(0, |map| map.epoch())
    }

    /// Number of requests still registered (sent but not yet durable).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.mutex.lock().requests.len()
    }

    /// State of the session to `mds`, if one exists.
    #[must_use]
    pub fn session_state(&self, mds: MdsRank) -> Option<SessionState> {
        let state = self.mutex.lock();
        self.lookup_session(&state, mds).map(|session| session.state())
    }

    /// Whether the inode is present in the cache.
    #[must_use]
    pub fn is_cached(&self, ino: Ino) -> bool {
        self.inodes.contains(ino)
    }

    /// Whether a dentry lease is cached for (dir, name).
    #[must_use]
    pub fn has_lease(&self, dir: Ino, name: &str) -> bool {
        self.leases.get(dir, name).is_some()
    }

    // ---- sessions ----

    pub(crate) fn lookup_session(&self, state: &CoreState, mds: MdsRank) -> Option<Arc<Session>> {
        state.sessions.get(mds as usize).and_then(Clone::clone)
    }

    fn have_session(&self, state: &CoreState, mds: MdsRank) -> bool {
        state
            .sessions
            .get(mds as usize)
            .is_some_and(Option::is_some)
    }

    /// Create and register a session for `mds`, growing the table to the
    /// next power of two if the rank overflows it.
    pub(crate) fn register_session(&self, state: &mut CoreState, mds: MdsRank) -> Arc<Session> {
        let addr = state.mdsmap.as_ref().and_then(|map| map.addr_of(mds));
        let conn = addr.map(|addr| self.messenger.connect(mds, addr));
        let session = Session::new(mds, conn);
        if mds as usize >= state.sessions.len() {
            let newmax = (mds as usize + 1).next_power_of_two();
            debug!(newmax, "growing session table");
            state.sessions.resize(newmax, None);
        }
        debug!(mds, "registered session");
        state.sessions[mds as usize] = Some(session.clone());
        session
    }

    fn unregister_session(&self, state: &mut CoreState, mds: MdsRank) {
        debug!(mds, "unregistered session");
        if let Some(slot) = state.sessions.get_mut(mds as usize) {
            *slot = None;
        }
    }

    /// Send the session-open handshake.
    fn open_session(&self, state: &CoreState, session: &Arc<Session>) {
        let mstate = state
            .mdsmap
            .as_ref()
            .map(|map| map.state_of(session.mds));
        debug!(mds = session.mds, state = ?mstate, "opening session");
        let seq = {
            let mut core = session.mutex.lock();
            core.state = SessionState::Opening;
            core.seq
        };
        session.caps.lock().renew_requested = Some(Instant::now());
        session.send(Message::Session(SessionMessage {
            op: SessionOp::RequestOpen,
            seq,
            max_caps: None,
        }));
    }

    fn request_close_session(&self, session: &Arc<Session>) {
        let seq = session.mutex.lock().seq;
        debug!(
            mds = session.mds,
            state = %session.state(),
            seq,
            "requesting session close"
        );
        session.send(Message::Session(SessionMessage {
            op: SessionOp::RequestClose,
            seq,
            max_caps: None,
        }));
    }

    fn close_session(&self, session: &Arc<Session>) {
        {
            let mut core = session.mutex.lock();
            if matches!(core.state, SessionState::Closing) {
                return;
            }
            core.state = SessionState::Closing;
        }
        self.request_close_session(session);
    }

    /// Re-drive every request parked on the session.
    fn wake_session_waiters(&self, state: &mut CoreState, session: &Arc<Session>) {
        let parked: Vec<Arc<Request>> = session.mutex.lock().waiting.drain(..).collect();
        for req in parked {
            self.issue_request(state, &req);
        }
    }

    // ---- request registration ----

    /// Register an in-flight request and assign its tid. Links the request
    /// onto the directory's unsafe-ops list when it mutates one.
    fn register_request(&self, state: &mut CoreState, req: &Arc<Request>, dir: Option<Ino>) {
        state.last_tid += 1;
        let tid = state.last_tid;
        {
            let mut rs = req.state.lock();
            rs.tid = tid;
            rs.unsafe_dir = dir;
        }
        debug!(tid, op = %req.op, "registered request");
        state.requests.insert(tid, req.clone());
        if let Some(dir) = dir {
            self.inodes
                .get_or_insert(dir)
                .lock
                .lock()
                .unsafe_ops
                .push(tid);
        }
    }

    fn unregister_request(&self, state: &mut CoreState, req: &Arc<Request>) {
        let (tid, dir) = {
            let rs = req.state.lock();
            (rs.tid, rs.unsafe_dir)
        };
        debug!(tid, "unregistered request");
        state.requests.remove(&tid);
        if let Some(dir) = dir {
            if let Some(inode) = self.inodes.get(dir) {
                inode.lock.lock().unsafe_ops.retain(|t| *t != tid);
            }
        }
    }

    /// Lowest tid still in flight, 0 if none. Reported on every outgoing
    /// request so the MDS can trim its reply cache.
    pub(crate) fn oldest_tid(state: &CoreState) -> Tid {
        state.requests.keys().next().copied().unwrap_or(0)
    }

    // ---- target selection ----

    /// Choose the MDS to send a request to. A forward hint wins if it is
    /// still plausible; otherwise consult the fragment tree and caps of the
    /// target inode for locality, and fall back to a random active rank.
    fn choose_mds(&self, state: &CoreState, req: &Arc<Request>) -> Option<MdsRank> {
        let map = state.mdsmap.as_ref()?;

        let (hint, mode) = {
            let rs = req.state.lock();
            (rs.resend_mds, rs.mode)
        };
        if let Some(hint) = hint {
            if self.have_session(state, hint) || map.state_of(hint).is_up() {
                debug!(mds = hint, "choose_mds using resend hint");
                return Some(hint);
            }
        }

        if mode == crate::request::DirectMode::Random {
            return map.random_active_rank();
        }

        let (ino, mut hash) = match &req.target {
            Target::Inode(ino) => (*ino, None),
            Target::Dentry { dir, name } => (*dir, Some(name_hash(name))),
            Target::Path { ino, .. } => (*ino, None),
        };
        if let OpArgs::Readdir { frag } = &req.args {
            hash = Some(*frag);
        }

        let Some(inode) = self.inodes.get(ino) else {
            return map.random_active_rank();
        };
        let st = inode.lock.lock();

        let mut mode = mode;
        if let Some(hash) = hash {
            if st.is_dir {
                if let Some(frag) = st.choose_frag(hash) {
                    if mode == crate::request::DirectMode::Any && !frag.dist.is_empty() {
                        let pick = rand::thread_rng().gen_range(0..frag.dist.len());
                        let mds = frag.dist[pick];
                        debug!(%ino, mds, "choose_mds picked fragment replica");
                        return Some(mds);
                    }
                    // the fragment is not replicated; go for its auth mds
                    mode = crate::request::DirectMode::Auth;
                    if let Some(auth) = frag.auth {
                        debug!(%ino, mds = auth, "choose_mds picked fragment auth");
                        return Some(auth);
                    }
                }
            }
        }

        let mut rank = None;
        if mode == crate::request::DirectMode::Auth {
            rank = st.auth;
        }
        if rank.is_none() {
            rank = st.caps.keys().min().copied();
        }
        match rank {
            Some(mds) => {
                debug!(%ino, mds, auth = st.auth == Some(mds), "choose_mds by cap");
                Some(mds)
            }
            None => map.random_active_rank(),
        }
    }

    // ---- the request pipeline ----

    /// Send the request, or park it on the appropriate wait list.
    pub(crate) fn issue_request(&self, state: &mut CoreState, req: &Arc<Request>) {
        {
            let rs = req.state.lock();
            if rs.reply.is_some() || rs.err.is_some() {
                return;
            }
            if let Some(timeout) = req.timeout {
                if rs.started.elapsed() >= timeout {
                    debug!(tid = rs.tid, "request timed out before send");
                    drop(rs);
                    self.fail_request(req, Error::Timeout);
                    return;
                }
            }
        }

        let mds = self.choose_mds(state, req);
        let target_usable = mds.is_some_and(|mds| {
            state
                .mdsmap
                .as_ref()
                .is_some_and(|map| map.state_of(mds).is_serving())
        });
        if !target_usable {
            debug!(tid = req.tid(), "no usable mds, waiting for map");
            state.waiting_for_map.push(req.clone());
            self.ask_for_map(state);
            return;
        }
        let mds = mds.expect("usable target checked above");

        let session = match self.lookup_session(state, mds) {
            Some(session) => session,
            None => self.register_session(state, mds),
        };
        let sstate = session.state();
        debug!(tid = req.tid(), mds, state = %sstate, "issuing request");
        if !sstate.is_usable() {
            if matches!(sstate, SessionState::New | SessionState::Closing) {
                self.open_session(state, &session);
            }
            session.mutex.lock().waiting.push(req.clone());
            return;
        }

        {
            let mut rs = req.state.lock();
            rs.session = Some(session.clone());
            rs.resend_mds = None;
            rs.mds = Some(mds);
            if rs.request_started.is_none() {
                rs.request_started = Some(Instant::now());
            }
        }

        let msg = {
            let mut rs = req.state.lock();
            self.build_request_message(state, req, &mut rs, mds)
        };
        match msg {
            Ok(msg) => session.send(Message::Request(msg)),
            Err(err) => {
                warn!(tid = req.tid(), %err, "failed to encode request");
                self.fail_request(req, err);
            }
        }
    }

    fn build_request_message(
        &self,
        state: &CoreState,
        req: &Arc<Request>,
        rs: &mut RequestState,
        mds: MdsRank,
    ) -> Result<RequestMessage> {
        rs.attempts += 1;
        debug!(tid = rs.tid, op = %req.op, attempt = rs.attempts, "building request");

        if req.op == Op::Rename && req.target2.is_none() {
            return Err(Error::invalid_request("rename needs a second target"));
        }

        let mut releases: Vec<ReleaseRecord> = Vec::new();
        if !req.drops.inode_drop.is_empty() {
            if let Some(rec) = self.encode_inode_release(
                req.target.ino(),
                mds,
                req.drops.inode_drop,
                req.drops.inode_unless,
            ) {
                releases.push(rec);
            }
        }
        if req.drops.dentry_drop {
            if let Target::Dentry { dir, name } = &req.target {
                if let Some(rec) = self.encode_dentry_release(*dir, name, mds) {
                    releases.push(rec);
                }
            }
        }
        if let Some(target2) = &req.target2 {
            if !req.drops.old_inode_drop.is_empty() {
                if let Some(rec) = self.encode_inode_release(
                    target2.ino(),
                    mds,
                    req.drops.old_inode_drop,
                    req.drops.old_inode_unless,
                ) {
                    releases.push(rec);
                }
            }
            if req.drops.old_dentry_drop {
                if let Target::Dentry { dir, name } = target2 {
                    if let Some(rec) = self.encode_dentry_release(*dir, name, mds) {
                        releases.push(rec);
                    }
                }
            }
        }

        let epoch = state.mdsmap.as_ref().map_or(0, |map| map.epoch());
        Ok(RequestMessage {
            tid: rs.tid,
            oldest_client_tid: Self::oldest_tid(state),
            mdsmap_epoch: epoch,
            op: req.op,
            caller_uid: req.caller_uid,
            caller_gid: req.caller_gid,
            args: req.args.clone(),
            path1: req.target.to_filepath(),
            path2: req.target2.as_ref().map(Target::to_filepath),
            releases,
            replay: rs.got_unsafe,
            want_dentry: req.locked_dir.is_some(),
            num_fwd: rs.num_fwd,
            num_retry: rs.attempts - 1,
            ino_hint: if rs.got_unsafe { rs.target_ino } else { None },
        })
    }

    /// Complete the caller (callback or completion).
    fn complete_request(&self, req: &Arc<Request>) {
        match &req.callback {
            Some(callback) => callback(req),
            None => req.completion.complete(),
        }
    }

    fn fail_request(&self, req: &Arc<Request>, err: Error) {
        {
            let mut rs = req.state.lock();
            if rs.err.is_none() {
                rs.err = Some(err);
            }
        }
        self.complete_request(req);
    }

    fn ask_for_map(&self, state: &CoreState) {
        let epoch = state.mdsmap.as_ref().map_or(1, |map| map.epoch() + 1);
        self.map_source.request_map(epoch);
    }

    /// Register and send without waiting. The caller observes progress via
    /// the request's completion or callback.
    pub fn submit(&self, req: &Arc<Request>, dir: Option<Ino>) -> Result<()> {
        let mut state = self.mutex.lock();
        if state.stopping {
            return Err(Error::ShuttingDown);
        }
        self.register_request(&mut state, req, dir);
        self.issue_request(&mut state, req);
        Ok(())
    }

    /// Synchronously perform a metadata request: session setup, forwarding
    /// and retry details included. Returns the MDS result.
    pub fn execute(&self, req: &Arc<Request>, dir: Option<Ino>) -> Result<()> {
        debug_assert!(req.callback.is_none(), "callback requests use submit");
        let pinned = self.pin_request_inos(req);
        let result = self.execute_inner(req, dir);
        self.unpin_inos(&pinned);
        result
    }

    fn execute_inner(&self, req: &Arc<Request>, dir: Option<Ino>) -> Result<()> {
        self.submit(req, dir)?;

        match req.timeout {
            Some(timeout) => {
                req.completion.wait_timeout(timeout);
            }
            None => req.completion.wait(),
        }

        let mut state = self.mutex.lock();
        let outcome = {
            let mut rs = req.state.lock();
            if rs.reply.is_none() && rs.err.is_none() {
                // timed out locally; the MDS is not told, later replies are
                // dropped at the tid lookup
                rs.err = Some(Error::Timeout);
            }
            rs.err.clone()
        };

        if let Some(err) = outcome {
            // local failure: tear down our tracking of the request
            self.unregister_request(&mut state, req);
            let session = {
                let rs = req.state.lock();
                rs.session.clone()
            };
            if let Some(session) = session {
                let tid = req.tid();
                session.mutex.lock().unsafe_tids.retain(|t| *t != tid);
            }
            req.safe_completion.complete();
            debug!(tid = req.tid(), %err, "request finished with local error");
            return Err(err);
        }
        drop(state);

        let result = req
            .outcome()
            .expect("completion fired with neither reply nor error");
        debug!(tid = req.tid(), ok = result.is_ok(), "request done");
        result
    }

    fn pin_request_inos(&self, req: &Arc<Request>) -> Vec<Ino> {
        let mut inos = vec![req.target.ino()];
        if let Some(dir) = req.locked_dir {
            inos.push(dir);
        }
        if let Some(target2) = &req.target2 {
            inos.push(target2.ino());
        }
        for ino in &inos {
            self.inodes.get_or_insert(*ino).lock.lock().pins += 1;
        }
        inos
    }

    fn unpin_inos(&self, inos: &[Ino]) {
        for ino in inos {
            if let Some(inode) = self.inodes.get(*ino) {
                let mut st = inode.lock.lock();
                st.pins = st.pins.saturating_sub(1);
            }
            self.inodes.remove_if_evictable(*ino);
        }
    }

    /// Re-drive requests whose current session (or, if `all`, whose
    /// forwarder) is `mds`. Walks the request map in tid order, a batch at a
    /// time, so a huge in-flight set cannot pin the coordinator mutex.
    pub(crate) fn kick_requests(&self, state: &mut CoreState, mds: MdsRank, all: bool) {
        debug!(mds, all, "kicking requests");
        let mut next: Tid = 0;
        loop {
            let batch: Vec<Arc<Request>> = state
                .requests
                .range(next..)
                .take(KICK_BATCH)
                .map(|(_, req)| req.clone())
                .collect();
            let Some(last) = batch.last() else { break };
            next = last.tid() + 1;
            for req in batch {
                let matched = {
                    let mut rs = req.state.lock();
                    if rs.got_unsafe {
                        false
                    } else if rs.session.as_ref().is_some_and(|s| s.mds == mds)
                        || (all && rs.fwd_session.as_ref().is_some_and(|s| s.mds == mds))
                    {
                        Request::drop_sessions(&mut rs);
                        true
                    } else {
                        false
                    }
                };
                if matched {
                    debug!(tid = req.tid(), "kicking request");
                    self.issue_request(state, &req);
                }
            }
        }
    }

    // ---- reply handling ----

    /// Handle an MDS reply.
    ///
    /// The session mutex is held while the body is applied, which preserves
    /// the order the MDS sent replies, caps and leases in as they land in
    /// our cache.
    fn handle_reply(&self, from: MdsRank, reply: ReplyMessage) {
        let tid = reply.tid;
        let mut state = self.mutex.lock();
        let Some(req) = state.requests.get(&tid).cloned() else {
            debug!(tid, from, "reply for unknown tid, dropping");
            return;
        };

        {
            let rs = req.state.lock();
            if (rs.got_unsafe && !reply.safe) || (rs.got_safe && reply.safe) {
                warn!(
                    tid,
                    from,
                    safe = reply.safe,
                    "duplicate reply, dropping"
                );
                return;
            }
        }

        // Tolerate two consecutive stale-handle results from the same mds,
        // retargeting at the authoritative mds each time. Checked before the
        // safe bookkeeping so a retried request stays registered.
        if reply.result == errno::ESTALE {
            let retry = {
                let mut rs = req.state.lock();
                rs.mode = crate::request::DirectMode::Auth;
                rs.num_stale += 1;
                rs.num_stale <= 2
            };
            if retry {
                debug!(tid, from, "stale handle, retrying against auth mds");
                {
                    let mut rs = req.state.lock();
                    Request::drop_sessions(&mut rs);
                }
                self.issue_request(&mut state, &req);
                return;
            }
        } else {
            req.state.lock().num_stale = 0;
        }

        if reply.safe {
            let had_unsafe = {
                let mut rs = req.state.lock();
                rs.got_safe = true;
                rs.got_unsafe
            };
            self.unregister_request(&mut state, &req);
            req.safe_completion.complete();
            if had_unsafe {
                // the unsafe reply was already applied; this is just the
                // durability cleanup
                debug!(tid, from, "got safe reply");
                let session = req.state.lock().session.clone();
                if let Some(session) = session {
                    session.mutex.lock().unsafe_tids.retain(|t| *t != tid);
                }
                if state.stopping && state.requests.is_empty() {
                    self.safe_umount.complete();
                }
                return;
            }
        }

        // re-parent onto the session that actually replied; forwarding may
        // have raced our bookkeeping
        let session = {
            let cur = req.state.lock().session.clone();
            match cur {
                Some(session) if session.mds == from => session,
                _ => match self.lookup_session(&state, from) {
                    Some(session) => {
                        req.state.lock().session = Some(session.clone());
                        session
                    }
                    None => {
                        error!(tid, from, "reply but no session, dropping");
                        return;
                    }
                },
            }
        };

        if !reply.safe {
            req.state.lock().got_unsafe = true;
            session.mutex.lock().unsafe_tids.push(tid);
        }
        drop(state);

        // apply snap realm updates before anything derived from them
        let _snap_guard: RwLockReadGuard<'_, SnapRealms> = if reply.snap.is_empty() {
            self.snap.read()
        } else {
            let mut realms = self.snap.write();
            realms.update(&reply.snap);
            RwLockWriteGuard::downgrade(realms)
        };
        let core = session.mutex.lock();

        let result = reply.result;
        debug!(tid, from, result, safe = reply.safe, "handling reply");

        match self.fill_trace(&session, &req, &reply) {
            Ok(()) => {
                if result == 0 && reply.op == Op::Readdir {
                    if let Some(dir) = &reply.dir {
                        let parent = req
                            .state
                            .lock()
                            .target_ino
                            .unwrap_or_else(|| req.target.ino());
                        self.readdir_prepopulate(&session, parent, dir);
                    }
                }
                req.state.lock().reply = Some(reply);
            }
            Err(err) => {
                error!(tid, from, %err, "corrupt reply");
                req.state.lock().err = Some(err);
            }
        }

        session.add_cap_releases(self.config.cap_release_safety, self.config.caps_per_release);
        drop(core);
        drop(_snap_guard);

        self.complete_request(&req);
    }

    // ---- forwards ----

    /// An MDS either relayed our request to another rank (adjust our
    /// bookkeeping) or wants us to resend it there ourselves.
    fn handle_forward(&self, from: MdsRank, fwd: ForwardMessage) {
        let mut state = self.mutex.lock();
        let Some(req) = state.requests.get(&fwd.tid).cloned() else {
            debug!(tid = fwd.tid, "forward for unknown tid, dropping");
            return;
        };

        let next_session = self
            .lookup_session(&state, fwd.next_mds)
            .filter(|session| session.state().is_usable());
        let from_session = self.lookup_session(&state, from);

        let resend = {
            let mut rs = req.state.lock();
            if fwd.fwd_seq <= rs.num_fwd {
                debug!(
                    tid = fwd.tid,
                    fwd_seq = fwd.fwd_seq,
                    num_fwd = rs.num_fwd,
                    "old forward, ignoring"
                );
                return;
            }
            rs.num_fwd = fwd.fwd_seq;
            if !fwd.must_resend && next_session.is_some() {
                // the old mds relayed the request for us; track both peers
                // so failure of either rekicks us
                debug!(tid = fwd.tid, next = fwd.next_mds, from, "forward accepted");
                rs.session = next_session;
                rs.fwd_session = from_session;
                false
            } else {
                debug!(tid = fwd.tid, next = fwd.next_mds, "forward, we resend");
                rs.resend_mds = Some(fwd.next_mds);
                Request::drop_sessions(&mut rs);
                true
            }
        };
        if resend {
            self.issue_request(&mut state, &req);
        }
    }

    // ---- session control messages ----

    fn handle_session(&self, from: MdsRank, msg: SessionMessage) {
        let (session, map) = {
            let mut state = self.mutex.lock();
            let session = match self.lookup_session(&state, from) {
                Some(session) => session,
                None if msg.op == SessionOp::Open => {
                    debug!(mds = from, "creating session for unsolicited open");
                    self.register_session(&mut state, from)
                }
                None => {
                    debug!(mds = from, op = ?msg.op, "session message but no session");
                    return;
                }
            };
            (session, state.mdsmap.clone())
        };

        // any session traffic proves the mds is alive
        if let Some(map) = &map {
            let mut core = session.mutex.lock();
            core.ttl = Some(Instant::now() + map.session_autoclose());
            if core.state == SessionState::Hung {
                core.state = SessionState::Open;
                info!(mds = from, "session came back");
            }
        }
        debug!(mds = from, op = ?msg.op, state = %session.state(), seq = msg.seq, "session message");

        let mut wake = false;
        match msg.op {
            SessionOp::Open => {
                session.mutex.lock().state = SessionState::Open;
                if let Some(map) = &map {
                    self.renewed_caps(&session, false, map.session_timeout());
                }
                wake = true;
                let stopping = self.mutex.lock().stopping;
                if stopping {
                    self.close_session(&session);
                }
            }
            SessionOp::RenewCaps => {
                if let Some(map) = &map {
                    self.renewed_caps(&session, true, map.session_timeout());
                }
            }
            SessionOp::Close => {
                {
                    let mut state = self.mutex.lock();
                    self.unregister_session(&mut state, from);
                }
                self.remove_session_caps(&session);
                self.session_close.complete();
                let mut state = self.mutex.lock();
                self.kick_requests(&mut state, from, false);
                drop(state);
                wake = true;
            }
            SessionOp::Stale => {
                info!(mds = from, "caps went stale, renewing");
                {
                    let mut caps = session.caps.lock();
                    caps.cap_gen += 1;
                    caps.cap_ttl = None;
                }
                if let Some(map) = &map {
                    self.send_renew_caps(&session, map.state_of(from));
                }
            }
            SessionOp::RecallState => {
                let max = msg.max_caps.unwrap_or(0);
                self.trim_caps(&session, max);
            }
            SessionOp::RequestOpen | SessionOp::RequestRenewCaps | SessionOp::RequestClose => {
                warn!(mds = from, op = ?msg.op, "client-direction session op from mds");
            }
        }

        if wake {
            let mut state = self.mutex.lock();
            self.wake_session_waiters(&mut state, &session);
        }
    }

    // ---- reconnect ----

    /// An MDS failed and recovered; rebuild its view of the shared state.
    /// We replay every unsafe request and send a record for every cap and
    /// every snap realm we hold, because we cannot know what it lost.
    fn send_mds_reconnect(&self, state: &mut CoreState, mds: MdsRank) {
        info!(mds, "reconnect to recovering mds");
        let Some(session) = self.lookup_session(state, mds) else {
            // no shared state; tell the mds so with a bare reconnect
            let session = self.register_session(state, mds);
            session.send(Message::Reconnect(ReconnectMessage {
                was_closed: true,
                caps: Vec::new(),
                realms: Vec::new(),
            }));
            return;
        };

        let realms = self.snap.read();
        {
            // the session mutex is held through replay and encoding so cap
            // traffic cannot interleave with the snapshot we send
            let mut core = session.mutex.lock();
            core.state = SessionState::Reconnecting;
            core.seq = 0;

            // replay unsafe requests; the mds recognizes the tids
            let unsafe_tids = core.unsafe_tids.clone();
            for tid in unsafe_tids {
                let Some(req) = state.requests.get(&tid).cloned() else {
                    continue;
                };
                let msg = {
                    let mut rs = req.state.lock();
                    self.build_request_message(state, &req, &mut rs, mds)
                };
                if let Ok(msg) = msg {
                    debug!(tid, mds, "replaying unsafe request");
                    session.send(Message::Request(msg));
                }
            }

            let nr_caps = session.nr_caps();
            let mut len = 4 + 1 + nr_caps * (RECONNECT_PATH_GUESS + RECONNECT_CAP_RECORD);
            info!(mds, nr_caps, estimate = len, "encoding reconnect");

            let message = loop {
                let mut enc = ReconnectEncoder::new(len);
                match self.encode_reconnect(&session, &realms, &mut enc) {
                    Ok(()) => break enc.finish(),
                    Err(num_done) => {
                        // undersized; regrow proportionally to how far we got
                        let newlen = len * ((100 * (nr_caps + 3)) / (num_done + 1)) / 100;
                        info!(
                            mds,
                            guessed = len,
                            num_done,
                            nr_caps,
                            retry = newlen,
                            "reconnect buffer too small"
                        );
                        len = newlen;
                    }
                }
            };

            session.send(Message::Reconnect(message));
            core.state = SessionState::Open;
        }
        drop(realms);
        self.wake_session_waiters(state, &session);
    }

    /// Encode every cap and realm into `enc`, zeroing cap sequences as we
    /// go. Fails with the number of records done when the budget runs out.
    fn encode_reconnect(
        &self,
        session: &Arc<Session>,
        realms: &SnapRealms,
        enc: &mut ReconnectEncoder,
    ) -> std::result::Result<(), usize> {
        let mut inos: Vec<Ino> = session.caps.lock().inos.iter().copied().collect();
        inos.sort_unstable();
        for ino in inos {
            let Some(inode) = self.inodes.get(ino) else {
                continue;
            };
            let realm = inode.lock.lock().snap_realm;
            let (pathbase, path) = self.inodes.path_from_root(ino, realm);
            let mut st = inode.lock.lock();
            let wanted = st.wanted();
            let (size, mtime, atime, snap_realm) = (st.size, st.mtime, st.atime, st.snap_realm);
            let Some(cap) = st.caps.get_mut(&session.mds) else {
                continue;
            };
            cap.seq = 0;
            cap.issue_seq = 0;
            let record = CapReconnect {
                ino,
                pathbase,
                path,
                cap_id: cap.cap_id,
                wanted,
                issued: cap.issued,
                size,
                mtime,
                atime,
                snap_realm,
            };
            debug!(%ino, mds = session.mds, issued = %record.issued, "adding cap to reconnect");
            drop(st);
            enc.push_cap(record)?;
        }
        for record in realms.records() {
            debug!(ino = %record.ino, seq = record.seq, "adding snap realm to reconnect");
            enc.push_realm(record)?;
        }
        Ok(())
    }

    // ---- cluster map handling ----

    /// Compare old and new maps, kicking requests and closing out stale
    /// connections as needed.
    fn check_new_map(&self, state: &mut CoreState, old: &MdsMap, new: &MdsMap) {
        debug!(new = new.epoch(), old = old.epoch(), "checking new map");
        let nranks = old.max_rank().max(new.max_rank()).min(state.sessions.len());
        for rank in 0..nranks as MdsRank {
            let Some(session) = self.lookup_session(state, rank) else {
                continue;
            };
            let oldstate = old.state_of(rank);
            let newstate = new.state_of(rank);
            debug!(
                mds = rank,
                from = %oldstate,
                to = %newstate,
                session = %session.state(),
                "map transition"
            );

            if old.addr_of(rank) != new.addr_of(rank) {
                // the daemon moved; close out the old channel
                session.close_conn();
                session.set_conn(new.addr_of(rank).map(|addr| self.messenger.connect(rank, addr)));
                if session.state() == SessionState::Opening {
                    // the session never opened; drop it first so woken
                    // requests land on a fresh one
                    self.unregister_session(state, rank);
                    self.wake_session_waiters(state, &session);
                }
                self.kick_requests(state, rank, true);
            } else if oldstate == newstate {
                continue;
            }

            if newstate == metafs_common::MdsState::Reconnect {
                self.send_mds_reconnect(state, rank);
            }

            // An mds that came up active may have been forwarded requests we
            // cannot prove were delivered before the old rank died, so kick
            // on the forwarder link too.
            if !oldstate.is_serving() && newstate.is_serving() {
                self.kick_requests(state, rank, true);
                self.kick_flushing_caps(&session);
            }
        }
    }

    /// Install a new cluster map. Older or equal epochs are no-ops.
    pub fn handle_map(&self, payload: MdsMapPayload) {
        let epoch = payload.epoch;
        let mut state = self.mutex.lock();
        if let Some(current) = &state.mdsmap {
            if epoch <= current.epoch() {
                debug!(epoch, current = current.epoch(), "ignoring old map");
                return;
            }
        }
        let map = match MdsMap::decode(payload) {
            Ok(map) => Arc::new(map),
            Err(err) => {
                error!(%err, "failed to decode mds map");
                return;
            }
        };
        info!(epoch, max_rank = map.max_rank(), "new mds map");
        self.max_file_size.store(map.max_file_size(), Ordering::Relaxed);

        let old = state.mdsmap.replace(map.clone());
        if let Some(old) = old {
            self.check_new_map(&mut state, &old, &map);
        }

        let parked: Vec<Arc<Request>> = state.waiting_for_map.drain(..).collect();
        for req in parked {
            self.issue_request(&mut state, &req);
        }
    }

    // ---- leases ----

    fn handle_lease(&self, from: MdsRank, msg: LeaseMessage) {
        let session = {
            let state = self.mutex.lock();
            self.lookup_session(&state, from)
        };
        let Some(session) = session else {
            error!(mds = from, "lease message but no session");
            return;
        };

        let mut core = session.mutex.lock();
        core.seq += 1;
        debug!(mds = from, action = ?msg.action, ino = %msg.ino, dname = %msg.dname, "lease message");
        match msg.action {
            LeaseAction::Revoke => {
                let seq = self.leases.revoke(msg.ino, &msg.dname, from);
                let mut ack = msg;
                ack.action = LeaseAction::RevokeAck;
                if let Some(seq) = seq {
                    ack.seq = seq;
                }
                ack.more_to_follow = false;
                session.send(Message::Lease(ack));
            }
            LeaseAction::Renew => {
                let gen = session.caps.lock().cap_gen;
                self.leases
                    .renew_ack(msg.ino, &msg.dname, from, gen, msg.seq, msg.duration_ms);
            }
            LeaseAction::Release | LeaseAction::RevokeAck => {
                warn!(mds = from, action = ?msg.action, "client-direction lease op from mds");
            }
        }
        drop(core);
    }

    /// Preemptively return a dentry lease we are about to invalidate anyway,
    /// so the MDS can batch the release with the incoming request.
    pub fn lease_release(&self, dir: Ino, name: &str) {
        let Some(lease) = self.leases.get(dir, name) else {
            return;
        };
        let session = {
            let state = self.mutex.lock();
            self.lookup_session(&state, lease.mds)
        };
        let Some(session) = session else {
            return;
        };
        let gen = session.caps.lock().cap_gen;
        let Some(lease) = self.leases.release(dir, name, gen) else {
            debug!(%dir, name, "no valid lease to release");
            return;
        };
        debug!(%dir, name, mds = lease.mds, "releasing dentry lease");
        session.send(Message::Lease(LeaseMessage {
            action: LeaseAction::Release,
            mask: 1,
            ino: dir,
            first: 0,
            last: 0,
            seq: lease.seq,
            duration_ms: 0,
            dname: name.to_string(),
            more_to_follow: true,
        }));
    }

    /// Ask the MDS to extend a lease that is past its renewal point.
    pub fn renew_dentry_lease(&self, dir: Ino, name: &str) {
        let Some((mds, seq)) = self.leases.begin_renew(dir, name) else {
            return;
        };
        let session = {
            let state = self.mutex.lock();
            self.lookup_session(&state, mds)
        };
        let Some(session) = session else {
            return;
        };
        debug!(%dir, name, mds, "renewing dentry lease");
        session.send(Message::Lease(LeaseMessage {
            action: LeaseAction::Renew,
            mask: 1,
            ino: dir,
            first: 0,
            last: 0,
            seq,
            duration_ms: 0,
            dname: name.to_string(),
            more_to_follow: false,
        }));
    }

    // ---- snap messages ----

    fn handle_snap(&self, msg: SnapMessage) {
        self.snap.write().update(&msg.realms);
    }

    // ---- dispatch ----

    /// Entry point for all inbound messages; wire this to the messenger's
    /// receive callback.
    pub fn dispatch(&self, from: MdsRank, msg: Message) {
        match msg {
            Message::MdsMap(payload) => self.handle_map(payload),
            Message::Session(m) => self.handle_session(from, m),
            Message::Reply(m) => self.handle_reply(from, m),
            Message::Forward(m) => self.handle_forward(from, m),
            Message::Caps(m) => self.handle_caps(from, m),
            Message::Snap(m) => self.handle_snap(m),
            Message::Lease(m) => self.handle_lease(from, m),
            other => {
                warn!(from, kind = other.kind(), "unexpected inbound message, dropping");
            }
        }
    }

    /// The transport to `from` was torn down and re-established; our session
    /// there is gone as far as the MDS is concerned. Recovery happens when
    /// the next map shows the rank reconnecting.
    pub fn peer_reset(&self, from: MdsRank) {
        warn!(mds = from, "peer reset our session");
    }

    // ---- periodic tick ----

    /// One maintenance pass: flush delayed caps, detect hung sessions, renew
    /// caps or keepalive each live session, push out batched cap releases,
    /// and trim expired leases.
    pub fn tick_once(&self) {
        self.check_delayed_caps(false);

        let mut want_map: Option<Epoch> = None;
        {
            let mut state = self.mutex.lock();
            let Some(map) = state.mdsmap.clone() else {
                return;
            };
            let renew_interval = map.session_timeout() / 4;
            let renew = state.last_renew_caps.elapsed() >= renew_interval;
            if renew {
                state.last_renew_caps = Instant::now();
            }

            let sessions: Vec<Arc<Session>> =
                state.sessions.iter().flatten().cloned().collect();
            for session in sessions {
                let now = Instant::now();
                {
                    let mut core = session.mutex.lock();
                    if core.state == SessionState::Closing {
                        drop(core);
                        self.request_close_session(&session);
                        continue;
                    }
                    if core.ttl.is_some_and(|ttl| now > ttl) {
                        if core.state == SessionState::Open {
                            core.state = SessionState::Hung;
                            warn!(
                                mds = session.mds,
                                "session probably timed out, requesting mds map"
                            );
                        }
                        want_map = Some(map.epoch() + 1);
                    }
                    if matches!(core.state, SessionState::New | SessionState::Opening) {
                        // failed or recovering; just wait
                        continue;
                    }
                }
                if renew {
                    self.send_renew_caps(&session, map.state_of(session.mds));
                } else {
                    session.keepalive();
                }
                session
                    .add_cap_releases(self.config.cap_release_safety, self.config.caps_per_release);
                session.send_cap_releases();
            }
        }

        self.leases.trim();
        if let Some(epoch) = want_map {
            self.map_source.request_map(epoch);
        }
    }

    /// Start the jittered periodic tick.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.mutex.lock();
        if state.tick.is_some() {
            return;
        }
        let stop = Arc::new(Completion::new());
        let stop_flag = stop.clone();
        let weak: Weak<MdsClient> = Arc::downgrade(self);
        let interval = self.config.tick_interval;
        let thread = thread::Builder::new()
            .name("metafs-tick".into())
            .spawn(move || loop {
                let jitter_cap = (interval.as_millis() as u64 / 5).max(1);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
                if stop_flag.wait_timeout(interval + jitter) {
                    break;
                }
                let Some(client) = weak.upgrade() else {
                    break;
                };
                client.tick_once();
            })
            .expect("failed to spawn tick thread");
        state.tick = Some(TickHandle { stop, thread });
    }

    fn stop_tick(&self) {
        let handle = self.mutex.lock().tick.take();
        if let Some(handle) = handle {
            handle.stop.complete();
            let _ = handle.thread.join();
        }
    }

    // ---- shutdown ----

    /// Phase one of shutdown: stop accepting work, drop leases, flush dirty
    /// caps, and wait (bounded) for in-flight requests to become durable.
    pub fn pre_umount(&self) {
        info!("pre-umount: draining metadata requests");
        self.mutex.lock().stopping = true;
        self.leases.clear();
        self.check_delayed_caps(true);
        self.wait_requests();
    }

    /// Wait for safe replies on open requests; on timeout, tear the
    /// remainder down so nothing dangles.
    fn wait_requests(&self) {
        let pending = { Self::oldest_tid(&self.mutex.lock()) != 0 };
        if !pending {
            return;
        }
        debug!("waiting for in-flight requests");
        self.safe_umount.wait_timeout(self.config.mount_timeout);

        let mut state = self.mutex.lock();
        let leftover: Vec<Arc<Request>> = state.requests.values().cloned().collect();
        for req in leftover {
            warn!(tid = req.tid(), "tearing down request at umount");
            self.unregister_request(&mut state, &req);
            let session = {
                let mut rs = req.state.lock();
                if rs.reply.is_none() && rs.err.is_none() {
                    rs.err = Some(Error::ShuttingDown);
                }
                rs.session.clone()
            };
            if let Some(session) = session {
                let tid = req.tid();
                session.mutex.lock().unsafe_tids.retain(|t| *t != tid);
            }
            self.complete_request(&req);
            req.safe_completion.complete();
        }
    }

    /// Phase two of shutdown: close every session (with retries inside the
    /// mount timeout), then force-remove whatever is left and cancel the
    /// tick.
    pub fn close_sessions(&self) {
        debug!("closing sessions");
        let deadline = Instant::now() + self.config.mount_timeout;
        loop {
            let sessions: Vec<Arc<Session>> = {
                let state = self.mutex.lock();
                state.sessions.iter().flatten().cloned().collect()
            };
            if sessions.is_empty() {
                break;
            }
            for session in &sessions {
                self.close_session(session);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            debug!("waiting for sessions to close");
            self.session_close.wait_for_change_timeout(deadline - now);
        }

        // tear down remaining sessions
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.mutex.lock();
            let remaining: Vec<Arc<Session>> =
                state.sessions.iter().flatten().cloned().collect();
            for session in &remaining {
                state.sessions[session.mds as usize] = None;
            }
            remaining
        };
        for session in sessions {
            warn!(mds = session.mds, "forcing session teardown");
            self.remove_session_caps(&session);
            session.close_conn();
        }

        self.stop_tick();
        debug!("stopped");
    }

    /// Wait until every write request issued so far is durable and every cap
    /// flush started so far has been acked.
    pub fn sync(&self) {
        let (want_tid, want_flush) = {
            let state = self.mutex.lock();
            (state.last_tid, self.cap_flush_seq.load(Ordering::SeqCst))
        };
        debug!(want_tid, want_flush, "sync");
        self.check_delayed_caps(true);
        self.wait_unsafe_requests(want_tid);

        let mut guard = self.flush_lock.lock();
        while !self.check_cap_flush(want_flush) {
            let _ = self.flush_cv.wait_for(&mut guard, Duration::from_millis(500));
        }
    }

    fn wait_unsafe_requests(&self, want_tid: Tid) {
        debug!(want_tid, "waiting for unsafe requests");
        let mut next: Tid = 0;
        loop {
            let found = {
                let state = self.mutex.lock();
                state
                    .requests
                    .range(next..)
                    .next()
                    .map(|(tid, req)| (*tid, req.clone()))
            };
            let Some((tid, req)) = found else { break };
            if tid > want_tid {
                break;
            }
            next = tid + 1;
            if !req.op.is_write() {
                continue;
            }
            debug!(tid, want_tid, "waiting for safe reply");
            req.safe_completion.wait();
        }
    }
}

fn name_hash(name: &str) -> u32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish() as u32
}

/// Byte-budgeted builder for the reconnect payload. Message contents are
/// typed, but the size discipline of the wire encoding is kept so an
/// undersized first guess regrows instead of failing.
pub(crate) struct ReconnectEncoder {
    capacity: usize,
    used: usize,
    caps: Vec<CapReconnect>,
    realms: Vec<SnapRealmInfo>,
}

impl ReconnectEncoder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            // header: realm count + was_closed flag
            used: 4 + 1,
            caps: Vec::new(),
            realms: Vec::new(),
        }
    }

    fn records_done(&self) -> usize {
        self.caps.len() + self.realms.len()
    }

    pub fn push_cap(&mut self, record: CapReconnect) -> std::result::Result<(), usize> {
        let cost = 8 + 4 + record.path.len() + RECONNECT_CAP_RECORD;
        if self.used + cost > self.capacity {
            return Err(self.records_done());
        }
        self.used += cost;
        self.caps.push(record);
        Ok(())
    }

    pub fn push_realm(&mut self, record: SnapRealmInfo) -> std::result::Result<(), usize> {
        if self.used + RECONNECT_REALM_RECORD > self.capacity {
            return Err(self.records_done());
        }
        self.used += RECONNECT_REALM_RECORD;
        self.realms.push(record);
        Ok(())
    }

    pub fn finish(self) -> ReconnectMessage {
        ReconnectMessage {
            was_closed: false,
            caps: self.caps,
            realms: self.realms,
        }
    }
}
