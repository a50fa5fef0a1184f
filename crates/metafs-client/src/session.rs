//! Per-MDS sessions
//!
//! The client keeps one stateful session per MDS rank it talks to. A session
//! carries the capabilities issued through it, the requests parked on it, the
//! requests whose unsafe replies it still owes a safe commit for, and the
//! buffers of batched cap releases waiting to go out.
//!
//! Two locks guard a session. `mutex` is the big one: it serializes reply
//! parsing, cap handling and reconnect for this MDS, which is what keeps
//! cache updates in the order the MDS sent them. `caps` is a leaf lock for
//! the cap bookkeeping that gets touched from inode-side paths.

use crate::messenger::Connection;
use crate::request::Request;
use metafs_common::{Ino, MdsRank, Tid};
use metafs_proto::{CapReleaseItem, CapReleaseMessage, Message};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Session state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no open sent yet
    New,
    /// Open sent, waiting for the ack
    Opening,
    /// Established
    Open,
    /// Established but the MDS has not answered within its ttl
    Hung,
    /// Close sent, waiting for the ack
    Closing,
    /// Replaying shared state to a recovering MDS
    Reconnecting,
}

impl SessionState {
    /// States in which the session can carry requests.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Hung)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Hung => "hung",
            SessionState::Closing => "closing",
            SessionState::Reconnecting => "reconnecting",
        };
        write!(f, "{name}")
    }
}

/// State guarded by the session's main mutex
pub(crate) struct SessionCore {
    pub state: SessionState,
    /// Incoming message sequence, echoed back in acks
    pub seq: u64,
    /// Deadline after which an open session is considered hung
    pub ttl: Option<Instant>,
    /// Requests parked until the session opens
    pub waiting: Vec<Arc<Request>>,
    /// Requests with an unsafe but not yet safe reply from this MDS, in
    /// arrival order; replayed on reconnect
    pub unsafe_tids: Vec<Tid>,
}

/// Cap bookkeeping guarded by the session's leaf lock
pub(crate) struct SessionCaps {
    /// Bumped when the MDS declares our caps stale; caps minted under an
    /// older gen are dead
    pub cap_gen: u32,
    /// Deadline until which caps issued on this session are trusted
    pub cap_ttl: Option<Instant>,
    /// When the last renew request went out
    pub renew_requested: Option<Instant>,
    /// Inodes holding a cap from this session
    pub inos: HashSet<Ino>,
    /// Free record slots across all partial release messages
    pub release_slots: usize,
    /// Partially filled release messages, newest first
    pub partial: VecDeque<CapReleaseMessage>,
    /// Filled release messages awaiting the next flush
    pub ready: VecDeque<CapReleaseMessage>,
    /// Inodes flushing dirty caps through this session, oldest first
    pub flushing: Vec<Ino>,
}

/// A client's stateful relationship with one MDS
pub struct Session {
    pub mds: MdsRank,
    pub(crate) mutex: Mutex<SessionCore>,
    pub(crate) caps: Mutex<SessionCaps>,
    conn: Mutex<Option<Arc<dyn Connection>>>,
}

impl Session {
    pub(crate) fn new(mds: MdsRank, conn: Option<Arc<dyn Connection>>) -> Arc<Self> {
        Arc::new(Self {
            mds,
            mutex: Mutex::new(SessionCore {
                state: SessionState::New,
                seq: 0,
                ttl: None,
                waiting: Vec::new(),
                unsafe_tids: Vec::new(),
            }),
            caps: Mutex::new(SessionCaps {
                cap_gen: 0,
                cap_ttl: None,
                renew_requested: None,
                inos: HashSet::new(),
                release_slots: 0,
                partial: VecDeque::new(),
                ready: VecDeque::new(),
                flushing: Vec::new(),
            }),
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        self.mutex.lock().state
    }

    /// Number of caps held against this MDS.
    #[must_use]
    pub fn nr_caps(&self) -> usize {
        self.caps.lock().inos.len()
    }

    pub(crate) fn set_conn(&self, conn: Option<Arc<dyn Connection>>) {
        *self.conn.lock() = conn;
    }

    pub(crate) fn close_conn(&self) {
        if let Some(conn) = self.conn.lock().take() {
            conn.close();
        }
    }

    /// Send over the session's channel. The connection handle is cloned out
    /// so the messenger is never called with a lock held.
    pub(crate) fn send(&self, msg: Message) {
        let conn = self.conn.lock().clone();
        match conn {
            Some(conn) => conn.send(msg),
            None => warn!(mds = self.mds, kind = msg.kind(), "dropping send, no connection"),
        }
    }

    pub(crate) fn keepalive(&self) {
        if let Some(conn) = self.conn.lock().clone() {
            conn.keepalive();
        }
    }

    /// Top up the release buffers so at least `nr_caps + extra` record slots
    /// are reserved, then queue any partially filled head message for the
    /// next flush so pending releases do not linger.
    pub(crate) fn add_cap_releases(&self, extra: usize, per_msg: usize) {
        let mut caps = self.caps.lock();
        let mut extra = extra;
        if let Some(head) = caps.partial.front() {
            extra += per_msg - head.items.len();
        }
        while caps.release_slots < caps.inos.len() + extra {
            caps.partial.push_front(CapReleaseMessage::default());
            caps.release_slots += per_msg;
        }
        if caps.partial.front().is_some_and(|head| !head.items.is_empty()) {
            let msg = caps.partial.pop_front().expect("head checked above");
            caps.release_slots -= per_msg - msg.items.len();
            caps.ready.push_back(msg);
        }
    }

    /// Record a released cap in the buffered release stream.
    pub(crate) fn queue_cap_release(&self, item: CapReleaseItem, per_msg: usize) {
        let mut caps = self.caps.lock();
        if caps
            .partial
            .front()
            .is_none_or(|head| head.items.len() >= per_msg)
        {
            caps.partial.push_front(CapReleaseMessage::default());
            caps.release_slots += per_msg;
        }
        let head = caps.partial.front_mut().expect("allocated above");
        head.items.push(item);
        let full = head.items.len() >= per_msg;
        caps.release_slots -= 1;
        if full {
            let msg = caps.partial.pop_front().expect("head checked above");
            caps.ready.push_back(msg);
        }
    }

    /// Flush all release messages that are ready to go.
    pub(crate) fn send_cap_releases(&self) {
        loop {
            let msg = self.caps.lock().ready.pop_front();
            match msg {
                Some(msg) => self.send(Message::CapRelease(msg)),
                None => break,
            }
        }
    }

    /// Drop all buffered release messages (session teardown).
    pub(crate) fn cleanup_cap_releases(&self) {
        let mut caps = self.caps.lock();
        caps.partial.clear();
        caps.ready.clear();
        caps.release_slots = 0;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("mds", &self.mds)
            .field("state", &self.mutex.lock().state)
            .field("nr_caps", &self.caps.lock().inos.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PER_MSG: usize = 4;

    fn item(ino: u64) -> CapReleaseItem {
        CapReleaseItem {
            ino: Ino::new(ino),
            cap_id: 1,
            migrate_seq: 0,
            seq: 0,
        }
    }

    #[test]
    fn test_release_slot_reservation() {
        let s = Session::new(0, None);
        for i in 0..10u64 {
            s.caps.lock().inos.insert(Ino::new(i));
        }
        s.add_cap_releases(3, PER_MSG);
        let caps = s.caps.lock();
        assert!(caps.release_slots >= caps.inos.len() + 3);
    }

    #[test]
    fn test_full_message_moves_to_ready() {
        let s = Session::new(0, None);
        for i in 0..PER_MSG as u64 {
            s.queue_cap_release(item(i), PER_MSG);
        }
        let caps = s.caps.lock();
        assert_eq!(caps.ready.len(), 1);
        assert_eq!(caps.ready[0].items.len(), PER_MSG);
        assert!(caps.partial.is_empty());
    }

    #[test]
    fn test_partial_head_queued_by_top_up() {
        let s = Session::new(0, None);
        s.queue_cap_release(item(1), PER_MSG);
        s.add_cap_releases(0, PER_MSG);
        let caps = s.caps.lock();
        assert_eq!(caps.ready.len(), 1);
        assert_eq!(caps.ready[0].items.len(), 1);
    }

    #[test]
    fn test_session_state_names() {
        assert_eq!(SessionState::Reconnecting.to_string(), "reconnecting");
        assert!(SessionState::Hung.is_usable());
        assert!(!SessionState::Closing.is_usable());
    }
}
