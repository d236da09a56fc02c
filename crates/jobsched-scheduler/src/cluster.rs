use std::fmt;

use tokio::sync::watch;
use tracing::info;

/// Role of this process in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    Leader,
    Follower,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Leader => f.write_str("leader"),
            ClusterRole::Follower => f.write_str("follower"),
        }
    }
}

/// Leader/follower switch driven by whatever membership transport is in use.
///
/// Starts as follower. Daemons gated on leadership subscribe to the role
/// channel and only run while it reads [`ClusterRole::Leader`].
#[derive(Debug)]
pub struct ClusterGate {
    role: watch::Sender<ClusterRole>,
}

impl ClusterGate {
    pub fn new() -> Self {
        let (role, _) = watch::channel(ClusterRole::Follower);
        Self { role }
    }

    pub fn on_become_leader(&self) {
        if self.role.send_replace(ClusterRole::Leader) != ClusterRole::Leader {
            info!("became cluster leader");
        }
    }

    pub fn on_become_follower(&self) {
        if self.role.send_replace(ClusterRole::Follower) != ClusterRole::Follower {
            info!("became cluster follower");
        }
    }

    pub fn role(&self) -> ClusterRole {
        *self.role.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == ClusterRole::Leader
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterRole> {
        self.role.subscribe()
    }
}

impl Default for ClusterGate {
    fn default() -> Self {
        Self::new()
    }
}
