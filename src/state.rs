//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use crate::activity::ActivityClock;
use crate::config::AgentConfig;
use crate::device::{Capabilities, Desktop};
use crate::keepalive::KeepaliveState;

/// Shared application state for the agent.
///
/// The HTTP surface is stateless with respect to the tunnel: handlers cannot
/// tell whether a request arrived over the local socket or through the
/// in-process invoke path the dispatcher uses.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration assembled at startup.
    pub config: Arc<AgentConfig>,
    /// Monotonic instant when the process started (for uptime reporting).
    pub start_time: Instant,
    /// Screen capture + serialized input synthesis.
    pub desktop: Arc<Desktop>,
    /// Which optional endpoint groups are actually served.
    pub capabilities: Capabilities,
    /// Last-remote-activity clock shared with the tunnel and keepalive.
    pub clock: Arc<ActivityClock>,
    /// Keepalive switchboard, togglable via `/internal/keepalive/remote/*`.
    pub keepalive: Arc<KeepaliveState>,
    /// Whether a tunnel session is currently in the Running state.
    pub tunnel_connected: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: Arc<AgentConfig>, desktop: Arc<Desktop>, capabilities: Capabilities) -> Self {
        let keepalive_enabled = config.keepalive.enabled;
        Self {
            config,
            start_time: Instant::now(),
            desktop,
            capabilities,
            clock: Arc::new(ActivityClock::new()),
            keepalive: Arc::new(KeepaliveState::new(keepalive_enabled)),
            tunnel_connected: Arc::new(AtomicBool::new(false)),
        }
    }
}
