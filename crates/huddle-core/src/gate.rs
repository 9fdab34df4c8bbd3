//! Frame gate: throttles outbound proximity pushes to a target rate.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Default outbound frame rate.
pub const DEFAULT_TARGET_FPS: u32 = 30;

/// Minimum-interval throttle.
///
/// A frame is admitted when at least `1000 / target_fps` milliseconds have
/// passed since the last admitted frame. Rejected frames leave no trace.
#[derive(Debug)]
pub struct FrameGate {
    target_fps: AtomicU32,
    last_admitted_at: Mutex<Option<u64>>,
}

impl FrameGate {
    /// Create a gate. A rate of zero is treated as one frame per second.
    #[must_use]
    pub fn new(target_fps: u32) -> Self {
        Self {
            target_fps: AtomicU32::new(target_fps.max(1)),
            last_admitted_at: Mutex::new(None),
        }
    }

    /// Get the target frame rate.
    #[must_use]
    pub fn target_fps(&self) -> u32 {
        self.target_fps.load(Ordering::Relaxed)
    }

    /// Change the target frame rate. Takes effect on the next admission check.
    pub fn set_target_fps(&self, target_fps: u32) {
        let fps = target_fps.max(1);
        let previous = self.target_fps.swap(fps, Ordering::Relaxed);
        if previous != fps {
            debug!(from = previous, to = fps, "Outgoing frame rate changed");
        }
    }

    /// Minimum spacing between admitted frames, in milliseconds.
    #[must_use]
    pub fn interval_ms(&self) -> u64 {
        1000 / u64::from(self.target_fps())
    }

    /// Admit a frame at `now_ms` if the interval has elapsed.
    pub fn try_admit(&self, now_ms: u64) -> bool {
        let interval = self.interval_ms();
        let mut last = self.last_admitted_at.lock();

        let admit = match *last {
            None => true,
            Some(at) => now_ms.saturating_sub(at) >= interval,
        };
        if admit {
            *last = Some(now_ms);
        }
        admit
    }

}

impl Default for FrameGate {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_FPS)
    }
}
