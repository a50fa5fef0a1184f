//! Cluster map view
//!
//! An immutable snapshot of MDS cluster state at one epoch: each rank's
//! state and address plus the cluster-wide timing constants. The coordinator
//! replaces its map atomically under its mutex; readers clone the `Arc` and
//! keep using the snapshot they saw.

use metafs_common::{Epoch, Error, MdsRank, MdsState, Result};
use metafs_proto::{MdsMapPayload, RankInfo};
use rand::seq::IteratorRandom;
use std::net::SocketAddr;
use std::time::Duration;

/// Immutable cluster map at one epoch
#[derive(Debug)]
pub struct MdsMap {
    epoch: Epoch,
    ranks: Vec<RankInfo>,
    session_timeout: Duration,
    session_autoclose: Duration,
    max_file_size: u64,
    root: MdsRank,
}

impl MdsMap {
    /// Validate and build a map from the decoded payload.
    pub fn decode(payload: MdsMapPayload) -> Result<Self> {
        for (rank, info) in payload.ranks.iter().enumerate() {
            if info.state.is_up() && info.addr.is_none() {
                return Err(Error::protocol(format!(
                    "mdsmap epoch {}: mds{rank} is {} but has no address",
                    payload.epoch, info.state
                )));
            }
        }
        if payload.session_timeout.is_zero() {
            return Err(Error::protocol(format!(
                "mdsmap epoch {}: zero session timeout",
                payload.epoch
            )));
        }
        Ok(Self {
            epoch: payload.epoch,
            ranks: payload.ranks,
            session_timeout: payload.session_timeout,
            session_autoclose: payload.session_autoclose,
            max_file_size: payload.max_file_size,
            root: payload.root,
        })
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Number of ranks the cluster is configured for.
    #[must_use]
    pub fn max_rank(&self) -> usize {
        self.ranks.len()
    }

    /// State of `rank`; ranks beyond the map are down.
    #[must_use]
    pub fn state_of(&self, rank: MdsRank) -> MdsState {
        self.ranks
            .get(rank as usize)
            .map_or(MdsState::Down, |info| info.state)
    }

    /// Address of `rank`, if it is up.
    #[must_use]
    pub fn addr_of(&self, rank: MdsRank) -> Option<SocketAddr> {
        self.ranks.get(rank as usize).and_then(|info| info.addr)
    }

    /// Pick a uniformly random rank that is currently serving.
    #[must_use]
    pub fn random_active_rank(&self) -> Option<MdsRank> {
        let mut rng = rand::thread_rng();
        self.ranks
            .iter()
            .enumerate()
            .filter(|(_, info)| info.state.is_serving())
            .map(|(rank, _)| rank as MdsRank)
            .choose(&mut rng)
    }

    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    #[must_use]
    pub fn session_autoclose(&self) -> Duration {
        self.session_autoclose
    }

    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    #[must_use]
    pub fn root(&self) -> MdsRank {
        self.root
    }
}
