use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use physio_sync_core::wait::MonotonicClock;

/// Wall clock anchored at session start.
#[derive(Clone, Copy, Debug)]
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for WallClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Simulated clock: sleeping advances time instantly.
///
/// Every reading advances time by one microsecond so spin phases of a
/// high-precision wait terminate. Clones share the same timeline.
#[derive(Clone, Debug, Default)]
pub struct VirtualClock {
    now: Rc<Cell<Duration>>,
}

impl MonotonicClock for VirtualClock {
    fn now(&self) -> Duration {
        let now = self.now.get() + Duration::from_micros(1);
        self.now.set(now);
        now
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

/// Clock shared by the synthetic stream, the control loop and the waits.
#[derive(Clone, Debug)]
pub enum HostClock {
    Wall(WallClock),
    Virtual(VirtualClock),
}

impl HostClock {
    pub fn wall() -> Self {
        HostClock::Wall(WallClock::new())
    }

    pub fn simulated() -> Self {
        HostClock::Virtual(VirtualClock::default())
    }

    /// Current stream time in seconds.
    pub fn secs(&self) -> f64 {
        self.now().as_secs_f64()
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, HostClock::Virtual(_))
    }
}

impl MonotonicClock for HostClock {
    fn now(&self) -> Duration {
        match self {
            HostClock::Wall(clock) => clock.now(),
            HostClock::Virtual(clock) => clock.now(),
        }
    }

    fn sleep(&self, duration: Duration) {
        match self {
            HostClock::Wall(clock) => clock.sleep(duration),
            HostClock::Virtual(clock) => clock.sleep(duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use physio_sync_core::wait::HighPrecisionWait;

    #[test]
    fn virtual_clones_share_a_timeline() {
        let clock = HostClock::simulated();
        let other = clock.clone();
        clock.sleep(Duration::from_secs(3));
        assert!(other.secs() >= 3.0);
        assert!(other.secs() < 3.001);
    }

    #[test]
    fn virtual_waits_land_on_time() {
        let clock = HostClock::simulated();
        let wait = HighPrecisionWait::new(&clock);
        for _ in 0..100 {
            let elapsed = wait.wait(Duration::from_millis(400)).unwrap();
            assert!(elapsed >= Duration::from_millis(400));
            assert!(elapsed < Duration::from_millis(401));
        }
    }

    #[test]
    fn wall_wait_never_returns_early() {
        let clock = HostClock::wall();
        let wait = HighPrecisionWait::new(&clock);
        let target = Duration::from_millis(20);
        for trial in 0..50 {
            let elapsed = wait.wait(target).unwrap();
            assert!(elapsed >= target, "trial {trial} returned early: {elapsed:?}");
            assert!(
                elapsed < target + Duration::from_millis(5),
                "trial {trial} overshot: {elapsed:?}"
            );
        }
    }

    #[test]
    #[ignore = "takes 40 seconds of wall-clock time"]
    fn wall_wait_of_400_ms_over_100_trials() {
        let clock = HostClock::wall();
        let wait = HighPrecisionWait::new(&clock);
        for trial in 0..100 {
            let elapsed = wait.wait(Duration::from_millis(400)).unwrap();
            assert!(elapsed >= Duration::from_millis(400));
            assert!(
                elapsed < Duration::from_millis(405),
                "trial {trial} overshot: {elapsed:?}"
            );
        }
    }
}
