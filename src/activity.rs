//! Remote-activity clock.
//!
//! Single source of truth for "time since the cloud last asked us to do
//! something". The tunnel dispatcher touches it on every inbound request and
//! the keepalive worker touches it after every synthetic action, so the idle
//! window always restarts from the most recent activity of either kind.
//!
//! ## Design
//!
//! - **Lock-free**: the last-activity instant is stored as milliseconds since
//!   a process-start anchor in an `AtomicU64`. Readers and writers never
//!   block, so the clock is safe to touch from any task or thread.
//! - **Jittered touches**: [`ActivityClock::touch_with_jitter`] shifts the
//!   recorded instant by a uniform ±7 s so keepalive actions don't fire on a
//!   rigid cadence. The stored value is clamped to "now" — the clock never
//!   claims activity from the future, which keeps [`ActivityClock::idle_for`]
//!   monotonic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

/// Maximum jitter applied by [`ActivityClock::touch_with_jitter`].
pub const ACTIVITY_JITTER: Duration = Duration::from_secs(7);

/// Monotonic, atomically-updated record of the last remote activity.
pub struct ActivityClock {
    /// Fixed anchor; all stored values are offsets from this instant.
    anchor: Instant,
    /// Milliseconds since `anchor` at the last touch.
    last_activity_ms: AtomicU64,
}

impl ActivityClock {
    /// Create a clock whose last activity is "now".
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Record activity at exactly "now".
    pub fn touch_now(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Record activity at "now" shifted by a uniform jitter in ±7 s, clamped
    /// so the stored instant never exceeds "now".
    pub fn touch_with_jitter(&self) {
        let now = self.now_ms();
        #[allow(clippy::cast_possible_truncation)]
        let jitter_cap = ACTIVITY_JITTER.as_millis() as i64;
        let jitter = rand::thread_rng().gen_range(-jitter_cap..=jitter_cap);
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let shifted = (now as i64 + jitter).clamp(0, now as i64) as u64;
        self.last_activity_ms.store(shifted, Ordering::Relaxed);
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_now_resets_idle() {
        let clock = ActivityClock::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(clock.idle_for() >= Duration::from_millis(25));
        clock.touch_now();
        assert!(clock.idle_for() < Duration::from_millis(10));
    }

    #[test]
    fn jittered_touch_never_claims_future_activity() {
        let clock = ActivityClock::new();
        for _ in 0..100 {
            clock.touch_with_jitter();
            // The jitter may push the recorded instant into the past but
            // never past "now", so idle stays within the jitter bound.
            assert!(clock.idle_for() <= ACTIVITY_JITTER + Duration::from_millis(50));
        }
    }

    #[test]
    fn idle_grows_monotonically() {
        let clock = ActivityClock::new();
        clock.touch_now();
        let a = clock.idle_for();
        std::thread::sleep(Duration::from_millis(15));
        let b = clock.idle_for();
        assert!(b >= a);
    }
}
