//! Connectivity tracking.
//!
//! The device network signal alone does not mean the remote store can be
//! reached, so the monitor distinguishes "online" from "reachable" and only
//! the latter allows a drain.
//!
//! ```text
//!            network down (any state)
//!        +---------------------------------+
//!        v                                 |
//!   Offline --network up--> OnlineUnverified <--probe fails-- OnlineReachable
//!                                 |                                ^
//!                                 +----------probe succeeds--------+
//! ```

use crate::RemoteStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Where the device stands with respect to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectivityState {
    /// No network
    Offline,
    /// Network is up but the remote store has not answered a probe
    OnlineUnverified,
    /// The remote store answered the last probe
    OnlineReachable,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        !matches!(self, ConnectivityState::Offline)
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, ConnectivityState::OnlineReachable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Offline => "offline",
            ConnectivityState::OnlineUnverified => "online_unverified",
            ConnectivityState::OnlineReachable => "online_reachable",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks connectivity and publishes every state change.
pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteStore>,
    state: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    /// Create a monitor. With the network up it starts unverified; call
    /// [`probe`](Self::probe) to find out whether the remote answers.
    pub fn new(remote: Arc<dyn RemoteStore>, network_available: bool) -> Self {
        let initial = if network_available {
            ConnectivityState::OnlineUnverified
        } else {
            ConnectivityState::Offline
        };
        let (state, _) = watch::channel(initial);
        Self { remote, state }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_reachable(&self) -> bool {
        self.state().is_reachable()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Feed the device network signal. Going online probes the remote
    /// straight away.
    pub async fn set_network_available(&self, available: bool) -> ConnectivityState {
        if !available {
            return self.transition(ConnectivityState::Offline);
        }

        if self.state() == ConnectivityState::Offline {
            self.transition(ConnectivityState::OnlineUnverified);
        }
        self.probe().await
    }

    /// Ask the remote store whether it is reachable and move accordingly.
    /// Does nothing while offline.
    pub async fn probe(&self) -> ConnectivityState {
        if self.state() == ConnectivityState::Offline {
            return ConnectivityState::Offline;
        }

        let reachable = self.remote.probe_reachable().await;

        // The network may have dropped while the probe was in flight
        if self.state() == ConnectivityState::Offline {
            return ConnectivityState::Offline;
        }

        self.transition(if reachable {
            ConnectivityState::OnlineReachable
        } else {
            ConnectivityState::OnlineUnverified
        })
    }

    /// A write failed for lack of connectivity: stop treating the remote as
    /// reachable until the next successful probe.
    pub fn report_unreachable(&self) -> ConnectivityState {
        self.state.send_if_modified(|state| {
            if *state == ConnectivityState::OnlineReachable {
                *state = ConnectivityState::OnlineUnverified;
                true
            } else {
                false
            }
        });
        self.state()
    }

    fn transition(&self, next: ConnectivityState) -> ConnectivityState {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });

        if changed {
            tracing::info!(from = %previous, to = %next, "Connectivity changed");
        }
        next
    }
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.state())
            .finish()
    }
}
