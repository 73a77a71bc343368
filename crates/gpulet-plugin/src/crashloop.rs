//! Bounded restarts for a crashing gRPC serving loop

use gpulet_core::{GpuletError, GpuletResult};
use std::time::{Duration, Instant};

/// Restarts tolerated inside one window
pub const MAX_RESTARTS: u32 = 5;

/// Crashes further apart than this reset the restart counter
pub const CRASH_WINDOW: Duration = Duration::from_secs(3600);

/// Counts restarts of a serving loop.
///
/// The first crash is measured against the moment serving began. Every crash
/// within [`CRASH_WINDOW`] of the previous one counts as a restart; a larger
/// gap starts counting from zero again.
#[derive(Debug, Clone)]
pub struct CrashLoopGuard {
    max_restarts: u32,
    window: Duration,
    restarts: u32,
    last_crash: Instant,
}

impl CrashLoopGuard {
    pub fn new(started_at: Instant) -> Self {
        Self {
            max_restarts: MAX_RESTARTS,
            window: CRASH_WINDOW,
            restarts: 0,
            last_crash: started_at,
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Record a crash at `now`; errors once the loop should give up
    pub fn record_crash(&mut self, now: Instant) -> GpuletResult<()> {
        let since_last = now.saturating_duration_since(self.last_crash);
        self.last_crash = now;
        if since_last > self.window {
            self.restarts = 0;
        } else {
            self.restarts += 1;
        }

        if self.restarts > self.max_restarts {
            return Err(GpuletError::CrashLoop(format!(
                "gRPC server crashed {} times within {}s",
                self.restarts,
                self.window.as_secs()
            )));
        }
        Ok(())
    }
}
