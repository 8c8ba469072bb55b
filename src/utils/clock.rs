use std::time::{Duration, Instant};

/// Snapshot of the frame clock at the start of an update phase. Tile
/// liveness tracking compares against both the frame counter and wall
/// time, since frames can stop while time rolls on.
#[derive(Clone, Copy, Debug)]
pub struct FrameStamp {
    pub frame: u64,
    pub time: Instant,
    pub elapsed: Duration,
}

/// Monotonic frame counter for the update loop.
pub struct FrameClock {
    start: Instant,
    frame: u64,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            frame: 0,
        }
    }

    /// Advances to the next frame and stamps it.
    pub fn tick(&mut self) -> FrameStamp {
        self.frame += 1;
        self.current()
    }

    /// The stamp for the frame currently in progress.
    pub fn current(&self) -> FrameStamp {
        let now = Instant::now();
        FrameStamp {
            frame: self.frame,
            time: now,
            elapsed: now - self.start,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }
}
