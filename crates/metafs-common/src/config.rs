//! Configuration for the metadata client
//!
//! These are the mount-time tunables; everything else the client needs
//! (session timeouts, autoclose intervals, maximum file size) arrives with
//! the cluster map.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metadata client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// How long shutdown waits for in-flight requests to become durable and
    /// for sessions to close before tearing state down forcibly.
    pub mount_timeout: Duration,

    /// Extra cap-release slots kept reserved beyond the number of caps held,
    /// so a burst of releases never has to allocate while a revoke is being
    /// processed.
    pub cap_release_safety: usize,

    /// Number of release records carried by one cap-release message.
    pub caps_per_release: usize,

    /// Base interval of the maintenance tick (lease trim, cap renewal,
    /// session hang detection). The actual timer is jittered.
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mount_timeout: Duration::from_secs(30),
            cap_release_safety: 32,
            caps_per_release: 128,
            tick_interval: Duration::from_secs(5),
        }
    }
}
