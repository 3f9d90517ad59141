//! # Connectivity Monitor
//!
//! Tracks whether the remote is reachable and turns the offline → online
//! transition into a sync trigger.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ReachabilityProbe ──(every probe_interval)──► Connectivity (watch)     │
//! │  platform callback ──set_reachable()────────►        │                  │
//! │                                                      ▼                  │
//! │                        spawn_reconnect_trigger: false → true            │
//! │                                                      │                  │
//! │                                                      ▼                  │
//! │                     SyncEngine::trigger_sync(ConnectivityRestored)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::engine::{SyncEngine, Trigger};
use crate::error::{SyncError, SyncResult};

/// Shared reachability flag.
///
/// Cloning is cheap; every clone observes the same flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(reachable: bool) -> Self {
        let (state, _) = watch::channel(reachable);
        Connectivity {
            state: Arc::new(state),
        }
    }

    pub fn is_reachable(&self) -> bool {
        *self.state.borrow()
    }

    /// Records the current reachability. Returns true if it changed.
    pub fn set_reachable(&self, reachable: bool) -> bool {
        self.state.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Triggers a sync every time the remote becomes reachable again.
pub fn spawn_reconnect_trigger(connectivity: &Connectivity, engine: SyncEngine) -> JoinHandle<()> {
    let mut changes = connectivity.subscribe();

    tokio::spawn(async move {
        let mut was_reachable = *changes.borrow_and_update();

        while changes.changed().await.is_ok() {
            let reachable = *changes.borrow_and_update();
            if reachable && !was_reachable {
                info!("Remote reachable again, triggering sync");
                engine.trigger_sync(Trigger::ConnectivityRestored);
            }
            was_reachable = reachable;
        }
    })
}

// =============================================================================
// Probing
// =============================================================================

/// Checks whether the remote can currently be reached.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Probes by opening a TCP connection to the remote endpoint.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        TcpProbe {
            address: address.into(),
            timeout,
        }
    }

    /// Probes the host and port of an http(s) endpoint.
    pub fn from_url(endpoint: &Url, timeout: Duration) -> SyncResult<Self> {
        let host = endpoint
            .host_str()
            .ok_or_else(|| SyncError::InvalidUrl(format!("No host in {}", endpoint)))?;
        let port = endpoint
            .port_or_known_default()
            .ok_or_else(|| SyncError::InvalidUrl(format!("No port for {}", endpoint)))?;

        Ok(Self::new(format!("{}:{}", host, port), timeout))
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(address = %self.address, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(address = %self.address, "Probe timed out");
                false
            }
        }
    }
}

/// Probes periodically and publishes the result.
pub fn spawn_probe_loop(
    probe: Arc<dyn ReachabilityProbe>,
    connectivity: Connectivity,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let reachable = probe.probe().await;
            if connectivity.set_reachable(reachable) {
                info!(reachable, "Connectivity changed");
            }
            tokio::time::sleep(interval).await;
        }
    })
}
