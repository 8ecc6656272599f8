use std::time::{Duration, Instant};

/// Caps a loop to `fps` iterations per second. A rate of zero disables the cap.
pub struct FpsLimiter {
    fps_control: Instant,
    fps_wait: Duration,
}

impl FpsLimiter {
    pub fn new(fps: u32) -> Self {
        let fps_wait = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / fps
        };
        Self {
            fps_control: Instant::now(),
            fps_wait,
        }
    }

    pub fn period(&self) -> Duration {
        self.fps_wait
    }

    /// Sleeps out the rest of the current period, then starts the next one.
    pub fn wait(&mut self) {
        let elapsed = self.fps_control.elapsed();
        if self.fps_wait > elapsed {
            spin_sleep::sleep(self.fps_wait - elapsed);
        }
        self.fps_control = Instant::now();
    }
}
