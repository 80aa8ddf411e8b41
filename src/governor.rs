use std::thread;
use std::time::{Duration, Instant};

/// Monotonic process clock, handed out as milliseconds so timestamps can
/// cross threads through an AtomicU64. 0 means "never".
#[derive(Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// How often fps statistics are printed
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Paces and measures the render loop.
///
/// Pacing (sleep up to the target iteration interval) and reporting (periodic
/// fps / max-elapsed print) are independent toggles; either can be off.
pub struct FpsGovernor {
    target: Option<Duration>,
    show_fps: bool,
    start: Instant,
    loop_n: u32,
    max_elapsed: Duration,
    last_report: Instant,
}

impl FpsGovernor {
    /// `target_fps` of None disables pacing
    pub fn new(target_fps: Option<f32>, show_fps: bool) -> Self {
        let now = Instant::now();
        FpsGovernor {
            target: target_fps.map(|fps| Duration::from_secs_f32(1.0 / fps)),
            show_fps,
            start: now,
            loop_n: 0,
            max_elapsed: Duration::ZERO,
            last_report: now,
        }
    }

    #[allow(dead_code)]
    pub fn set_show_fps(&mut self, show_fps: bool) {
        self.show_fps = show_fps;
    }

    pub fn start_frame(&mut self) {
        self.start = Instant::now();
    }

    /// End the iteration: update the rolling maximum, sleep out the remainder
    /// of the target interval if pacing is on, and report at the fixed
    /// interval if reporting is on.
    pub fn end_frame(&mut self) {
        let elapsed = self.start.elapsed();
        self.max_elapsed = self.max_elapsed.max(elapsed);

        if let Some(target) = self.target {
            if let Some(remaining) = pacing_sleep(target, elapsed) {
                thread::sleep(remaining);
            }
        }

        self.loop_n += 1;

        let since_report = self.last_report.elapsed();
        if self.show_fps && since_report >= REPORT_INTERVAL {
            let fps = self.loop_n as f64 / since_report.as_secs_f64();
            println!(
                "[Stats] {:.1} fps, max loop time {}ms",
                fps,
                self.max_elapsed.as_millis()
            );
            self.loop_n = 0;
            self.max_elapsed = Duration::ZERO;
            self.last_report = Instant::now();
        }
    }
}

/// Remaining sleep needed to stretch `elapsed` out to `target`, if any
fn pacing_sleep(target: Duration, elapsed: Duration) -> Option<Duration> {
    if elapsed < target {
        Some(target - elapsed)
    } else {
        None
    }
}

/// Liveness change reported by the monitor, fired once per crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessChange {
    WentIdle,
    WentLive,
}

/// Watches the last-frame timestamp and decides when the display should fall
/// back to the locally generated idle pattern instead of stale content.
pub struct LivenessMonitor {
    timeout_millis: u64,
    idle: bool,
}

impl LivenessMonitor {
    pub fn new(timeout_millis: u64) -> Self {
        // idle until the first frame lands
        LivenessMonitor {
            timeout_millis,
            idle: true,
        }
    }

    /// Edge-triggered: returns a change only on the poll where the state
    /// flips, not on every iteration spent idle.
    pub fn observe(&mut self, now_millis: u64, last_frame_millis: u64) -> Option<LivenessChange> {
        let idle = last_frame_millis == 0
            || now_millis.saturating_sub(last_frame_millis) > self.timeout_millis;

        if idle == self.idle {
            return None;
        }
        self.idle = idle;
        Some(if idle {
            LivenessChange::WentIdle
        } else {
            LivenessChange::WentLive
        })
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }
}
