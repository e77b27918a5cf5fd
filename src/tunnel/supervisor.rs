//! Session lifecycle: connect, detect loss, back off, reconnect.
//!
//! The supervisor owns the only [`Session`] that ever exists at a time. It
//! dials, waits for the session to close, and sleeps with exponential backoff
//! before redialing: 1, 2, 4, … capped at 60 s, each multiplied by a uniform
//! factor in [0.8, 1.2] so a fleet of agents doesn't reconnect in lockstep.
//! A session that stayed up for 30 s resets the schedule.
//!
//! The `enabled` watch channel is the operator toggle: flipping it to
//! `false` gracefully closes the current session (or cancels a pending
//! backoff sleep), pauses the keepalive worker, and parks; flipping it back
//! starts a fresh session immediately with backoff reset. The local HTTP
//! surface keeps serving throughout.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

use super::session::{Session, SessionEnd};
use super::STABLE_SESSION;
use crate::activity::ActivityClock;
use crate::device::Capabilities;
use crate::config::AgentConfig;
use crate::keepalive::{KeepaliveGate, KeepaliveState};
use crate::routes::LocalSurface;
use crate::state::AppState;

/// Exponential backoff with jitter for reconnect sleeps.
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self { current: Self::INITIAL }
    }

    /// Back to the initial 1 s delay.
    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }

    /// The next delay to sleep, jittered by a uniform factor in [0.8, 1.2].
    /// Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.take_base().mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
    }

    /// The un-jittered delay for this attempt; doubles up to the cap.
    fn take_base(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(Self::CAP);
        base
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// The only way a supervisor returns: a terminal misconfiguration.
#[derive(Debug)]
pub enum SupervisorExit {
    /// The cloud rejected our handshake; retrying would be pointless.
    HandshakeRejected(String),
}

/// Drives sessions until fatally rejected. One per process.
pub struct Supervisor {
    config: Arc<AgentConfig>,
    surface: LocalSurface,
    clock: Arc<ActivityClock>,
    gate: Arc<KeepaliveGate>,
    keepalive: Arc<KeepaliveState>,
    capabilities: Capabilities,
    connected: Arc<AtomicBool>,
    tls: Arc<rustls::ClientConfig>,
    enabled: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(
        state: &AppState,
        surface: LocalSurface,
        gate: Arc<KeepaliveGate>,
        tls: Arc<rustls::ClientConfig>,
        enabled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config: Arc::clone(&state.config),
            surface,
            clock: Arc::clone(&state.clock),
            gate,
            keepalive: Arc::clone(&state.keepalive),
            capabilities: state.capabilities,
            connected: Arc::clone(&state.tunnel_connected),
            tls,
            enabled,
        }
    }

    /// Run the reconnect loop. Returns only on fatal handshake rejection.
    pub async fn run(mut self) -> SupervisorExit {
        let mut backoff = Backoff::new();
        loop {
            if !*self.enabled.borrow() {
                self.park().await;
                backoff.reset();
            }
            self.keepalive.set_paused(false);

            let session = Session::new(
                Arc::clone(&self.config),
                self.surface.clone(),
                Arc::clone(&self.clock),
                Arc::clone(&self.gate),
                self.capabilities.advertised(),
                Arc::clone(&self.connected),
                Arc::clone(&self.tls),
            );
            let started = Instant::now();
            let end = session.run(self.enabled.clone()).await;

            match end {
                SessionEnd::HandshakeRejected(reason) => {
                    error!("tunnel: handshake rejected: {reason}");
                    return SupervisorExit::HandshakeRejected(reason);
                }
                SessionEnd::Disabled => {
                    // Loop back to park; re-enable resets backoff there.
                }
                cause => {
                    if started.elapsed() >= STABLE_SESSION {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        "tunnel: session ended ({cause}), reconnecting"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        // A toggle cancels the sleep either way: Disabled
                        // parks at the top, Enabled was already true.
                        _ = self.enabled.changed() => {}
                    }
                }
            }
        }
    }

    /// Wait, with keepalive paused, until the operator re-enables us.
    async fn park(&mut self) {
        info!("tunnel: disabled; local surface stays up");
        self.keepalive.set_paused(true);
        loop {
            if self.enabled.changed().await.is_err() {
                // Toggle handle dropped; stay parked forever.
                std::future::pending::<()>().await;
            }
            if *self.enabled.borrow() {
                info!("tunnel: re-enabled");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_schedule_doubles_to_the_cap() {
        let mut backoff = Backoff::new();
        let bases: Vec<u64> = (0..8).map(|_| backoff.take_base().as_secs()).collect();
        assert_eq!(bases, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn reset_returns_to_one_second() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.take_base();
        }
        backoff.reset();
        assert_eq!(backoff.take_base(), Duration::from_secs(1));
    }

    #[test]
    fn four_failures_sleep_inside_the_jitter_bands() {
        // Bands: [0.8,1.2], [1.6,2.4], [3.2,4.8], [6.4,9.6] seconds.
        for _ in 0..20 {
            let mut backoff = Backoff::new();
            for base in [1.0_f64, 2.0, 4.0, 8.0] {
                let delay = backoff.next_delay().as_secs_f64();
                assert!(
                    delay >= base * 0.8 - 1e-9 && delay <= base * 1.2 + 1e-9,
                    "delay {delay} outside [{}, {}]",
                    base * 0.8,
                    base * 1.2
                );
            }
        }
    }

    #[test]
    fn delays_never_decrease_without_a_reset() {
        let mut backoff = Backoff::new();
        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let base = backoff.take_base();
            assert!(base >= previous);
            previous = base;
        }
    }
}
