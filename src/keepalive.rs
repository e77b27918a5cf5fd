//! Idle keepalive: synthetic user activity while the tunnel is quiet.
//!
//! When enabled, a background worker watches the
//! [`ActivityClock`](crate::activity::ActivityClock) and, once the idle time
//! crosses the configured threshold, performs one short *keepalive action*:
//! click somewhere harmless, type a few filler phrases at human speed, press
//! Escape. The point is to defeat idle-session lockers on remote desktops
//! that receive only sporadic real work.
//!
//! ## The gate
//!
//! A keepalive action and a real remote request must never drive the input
//! device at the same time. [`KeepaliveGate`] is a readers-writer lock on
//! nothing: the dispatcher holds it *shared* for the duration of each
//! forwarded request, the worker holds it *exclusive* for the duration of an
//! action. Tokio's write-preferring `RwLock` gives exactly the cooperation
//! the two sides need — the worker waits for in-flight requests instead of
//! preempting them, and requests that arrive mid-action block until the
//! action finishes (they are never dropped).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::activity::ActivityClock;
use crate::config::KeepaliveConfig;
use crate::device::{ButtonAction, Desktop, DeviceError, MouseButton};

/// Filler phrases typed during a keepalive action. Mundane on purpose — they
/// have to look plausible in whatever search box or shell ends up focused.
const PHRASES: &[&str] = &[
    "cookies",
    "checking notes",
    "be right back",
    "just a sec",
    "one moment",
    "thinking",
    "hmm",
    "on it",
    "almost there",
    "nearly done",
    "okay",
    "ok",
    "sure",
    "yep",
    "cool",
    "thanks",
    "working",
    "system settings",
    "logs",
    "utilities",
    "reports",
    "status",
    "calendar",
    "updates",
    "notepad",
    "calculator",
    "network",
];

/// Readers-writer gate between the dispatcher (shared) and the keepalive
/// worker (exclusive). No other component touches it.
pub struct KeepaliveGate {
    lock: RwLock<()>,
}

impl KeepaliveGate {
    pub fn new() -> Self {
        Self { lock: RwLock::new(()) }
    }

    /// Held by the dispatcher for the duration of one forwarded request.
    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Held by the keepalive worker for the duration of one action.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }
}

impl Default for KeepaliveGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared keepalive switchboard: `enabled` is flipped by config and the
/// `/internal/keepalive/remote/*` endpoints, `paused` by the supervisor while
/// the tunnel is disabled.
pub struct KeepaliveState {
    enabled: AtomicBool,
    paused: AtomicBool,
    busy: AtomicBool,
    wake: Notify,
}

impl KeepaliveState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            paused: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    fn is_running(&self) -> bool {
        self.enabled.load(Ordering::Relaxed) && !self.paused.load(Ordering::Relaxed)
    }
}

/// Millisecond bounds for randomized pacing inside an action.
struct Pacing {
    keystroke: (u64, u64),
    pause: (u64, u64),
}

impl Default for Pacing {
    fn default() -> Self {
        Self { keystroke: (80, 250), pause: (80, 180) }
    }
}

/// The background worker. One per process, spawned in `join` mode.
pub struct KeepaliveWorker {
    state: Arc<KeepaliveState>,
    gate: Arc<KeepaliveGate>,
    clock: Arc<ActivityClock>,
    desktop: Arc<Desktop>,
    config: KeepaliveConfig,
    pacing: Pacing,
}

impl KeepaliveWorker {
    pub fn new(
        state: Arc<KeepaliveState>,
        gate: Arc<KeepaliveGate>,
        clock: Arc<ActivityClock>,
        desktop: Arc<Desktop>,
        config: KeepaliveConfig,
    ) -> Self {
        Self {
            state,
            gate,
            clock,
            desktop,
            config,
            pacing: Pacing::default(),
        }
    }

    /// Run forever. Cancelled by aborting the owning task.
    pub async fn run(self) {
        loop {
            if !self.state.is_running() {
                self.state.wake.notified().await;
                continue;
            }

            let idle = self.clock.idle_for();
            if idle < self.config.threshold {
                let remaining = self.config.threshold - idle;
                tokio::select! {
                    () = tokio::time::sleep(remaining) => {}
                    () = self.state.wake.notified() => {}
                }
                continue;
            }

            // Waits for any in-flight requests; never preempts them.
            let guard = self.gate.exclusive().await;
            // A request may have slipped in while we waited for the gate, or
            // the worker may have been toggled off. Re-check before acting.
            if !self.state.is_running() || self.clock.idle_for() < self.config.threshold {
                drop(guard);
                continue;
            }

            self.state.busy.store(true, Ordering::Relaxed);
            let started = std::time::Instant::now();
            match self.perform_action().await {
                Ok(()) => info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "keepalive action completed"
                ),
                Err(e) => warn!("keepalive action failed: {e}"),
            }
            self.state.busy.store(false, Ordering::Relaxed);
            drop(guard);

            // Next idle window starts from now, with jitter so the cadence
            // doesn't look mechanical.
            self.clock.touch_with_jitter();
        }
    }

    /// One action: move-and-click, type a few phrases, press Escape.
    async fn perform_action(&self) -> Result<(), DeviceError> {
        let (x, y) = self.click_target()?;
        debug!(x, y, "keepalive click");
        self.desktop
            .with_input(|input| {
                input.move_cursor(x, y)?;
                input.button(MouseButton::Left, ButtonAction::Click)
            })
            .await?;
        self.pause().await;

        let count = rand::thread_rng().gen_range(2..=5);
        let chosen: Vec<&str> = PHRASES
            .choose_multiple(&mut rand::thread_rng(), count)
            .copied()
            .collect();
        for phrase in chosen {
            self.type_phrase(phrase).await?;
            self.pause().await;
        }

        self.desktop
            .with_input(|input| {
                input.key("esc", true)?;
                input.key("esc", false)
            })
            .await
    }

    /// Where to click: the configured coordinates verbatim, or bottom-left
    /// inset 10 px. Configured coordinates are intentionally NOT clamped to
    /// the screen — virtual displays misbehave on edge clicks and operators
    /// pick these values to compensate.
    fn click_target(&self) -> Result<(i32, i32), DeviceError> {
        if let (Some(x), Some(y)) = (self.config.click_x, self.config.click_y) {
            return Ok((x, y));
        }
        let (_, height) = self.desktop.dimensions()?;
        #[allow(clippy::cast_possible_wrap)]
        let bottom = height as i32 - 10;
        Ok((10, bottom))
    }

    /// Type one phrase with human-speed inter-keystroke intervals.
    async fn type_phrase(&self, phrase: &str) -> Result<(), DeviceError> {
        for ch in phrase.chars() {
            self.desktop
                .with_input(|input| input.type_text(&ch.to_string()))
                .await?;
            let (lo, hi) = self.pacing.keystroke;
            let delay = rand::thread_rng().gen_range(lo..=hi);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn pause(&self) {
        let (lo, hi) = self.pacing.pause;
        let delay = rand::thread_rng().gen_range(lo..=hi);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::{HeadlessDesktop, InputEvent};

    fn fast_worker(
        threshold: Duration,
        click: Option<(i32, i32)>,
    ) -> (KeepaliveWorker, Arc<KeepaliveState>, Arc<ActivityClock>, Arc<HeadlessDesktop>) {
        let backend = Arc::new(HeadlessDesktop::new(800, 600));
        let desktop = Arc::new(Desktop::new(backend.clone(), backend.clone()));
        let state = Arc::new(KeepaliveState::new(true));
        let clock = Arc::new(ActivityClock::new());
        let config = KeepaliveConfig {
            enabled: true,
            threshold,
            click_x: click.map(|(x, _)| x),
            click_y: click.map(|(_, y)| y),
        };
        let mut worker = KeepaliveWorker::new(
            state.clone(),
            KeepaliveGate::new().into(),
            clock.clone(),
            desktop,
            config,
        );
        worker.pacing = Pacing { keystroke: (1, 2), pause: (1, 2) };
        (worker, state, clock, backend)
    }

    #[tokio::test]
    async fn action_fires_after_threshold() {
        let (worker, state, clock, backend) = fast_worker(Duration::from_millis(50), None);
        clock.touch_now();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(600)).await;
        // Pause lets any in-progress action finish before we inspect.
        state.set_paused(true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();

        let events = backend.take_events();
        // Starts with move + click at the bottom-left inset target.
        assert_eq!(events[0], InputEvent::Move { x: 10, y: 590 });
        assert!(matches!(events[1], InputEvent::Button { .. }));
        // Ends each action with Escape.
        assert!(events.contains(&InputEvent::Key { key: "esc".into(), down: true }));
        assert!(!state.is_busy());
    }

    #[tokio::test]
    async fn configured_coordinates_are_not_clamped() {
        // (2000, -50) is outside the 800x600 screen on purpose.
        let (worker, _state, clock, backend) = fast_worker(
            Duration::from_millis(30),
            Some((2000, -50)),
        );
        clock.touch_now();
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.abort();

        let events = backend.take_events();
        assert_eq!(events[0], InputEvent::Move { x: 2000, y: -50 });
    }

    #[tokio::test]
    async fn disabled_worker_stays_silent() {
        let (worker, state, clock, backend) = fast_worker(Duration::from_millis(20), None);
        state.disable();
        clock.touch_now();
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        assert!(backend.take_events().is_empty());
    }

    #[tokio::test]
    async fn paused_worker_stays_silent() {
        let (worker, state, clock, backend) = fast_worker(Duration::from_millis(20), None);
        state.set_paused(true);
        clock.touch_now();
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        assert!(backend.take_events().is_empty());
    }
}
