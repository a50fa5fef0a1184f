//! Core type definitions for metafs
//!
//! This module defines the fundamental identifiers used throughout the
//! system: inode numbers, transaction ids, map epochs, and MDS ranks.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-local transaction id for a metadata request.
///
/// Assigned once at registration, strictly increasing, never reused.
pub type Tid = u64;

/// Monotonic version number on a cluster map.
pub type Epoch = u32;

/// Logical identity of a metadata server within the cluster.
///
/// Ranks are stable across restarts of a given MDS daemon and index the
/// client's session table.
pub type MdsRank = u32;

/// Inode number in the file system namespace
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Default,
)]
pub struct Ino(u64);

impl Ino {
    /// The root inode of the namespace
    pub const ROOT: Ino = Ino(1);

    /// Create from a raw inode number
    #[must_use]
    pub const fn new(ino: u64) -> Self {
        Self(ino)
    }

    /// Get the raw inode number
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ino({:#x})", self.0)
    }
}

impl fmt::Display for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// State of one MDS rank as published by the cluster map.
///
/// The ordering is meaningful: a recovering MDS progresses
/// `Replay → Reconnect → Rejoin → Active`, and several client decisions are
/// phrased as comparisons ("at least reconnect", "below active").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MdsState {
    /// Rank has no daemon at all
    Down,
    /// Daemon died and has not been replaced
    Failed,
    /// Recovering: replaying its journal
    Replay,
    /// Recovering: waiting for clients to reconnect
    Reconnect,
    /// Recovering: rejoining the cluster cache
    Rejoin,
    /// Serving metadata
    Active,
    /// Exporting its subtrees before shutdown, still serving
    Stopping,
}

impl MdsState {
    /// An "up" rank has a live daemon, possibly still recovering.
    #[must_use]
    pub fn is_up(&self) -> bool {
        !matches!(self, MdsState::Down | MdsState::Failed)
    }

    /// Can this rank serve requests right now?
    #[must_use]
    pub fn is_serving(&self) -> bool {
        *self >= MdsState::Active
    }
}

impl fmt::Display for MdsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MdsState::Down => "down",
            MdsState::Failed => "failed",
            MdsState::Replay => "up:replay",
            MdsState::Reconnect => "up:reconnect",
            MdsState::Rejoin => "up:rejoin",
            MdsState::Active => "up:active",
            MdsState::Stopping => "stopping",
        };
        write!(f, "{name}")
    }
}

/// Errno values used in MDS reply results.
///
/// Results are positive errno codes; zero means success.
pub mod errno {
    /// Operation not permitted
    pub const EPERM: i32 = 1;
    /// No such file or directory
    pub const ENOENT: i32 = 2;
    /// I/O error
    pub const EIO: i32 = 5;
    /// File exists
    pub const EEXIST: i32 = 17;
    /// Not a directory
    pub const ENOTDIR: i32 = 20;
    /// Stale file handle
    pub const ESTALE: i32 = 116;
}
