//! Bounded-error blocking wait.
//!
//! OS sleeps routinely overshoot by a millisecond or more, which is larger
//! than the timing budget between a detected peak and its stimulus. The wait
//! repeatedly sleeps for half of the remaining time, converging on the
//! deadline without oversleeping, and spins for the last
//! [`SPIN_THRESHOLD`].

use core::{fmt, time::Duration};

/// Below this remaining time the wait spins instead of sleeping.
pub const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Monotonic time source with a coarse sleep primitive.
pub trait MonotonicClock {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    /// Suspends the caller for approximately `duration`.
    fn sleep(&self, duration: Duration);
}

impl<C> MonotonicClock for &C
where
    C: MonotonicClock + ?Sized,
{
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Rejected wait requests.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WaitError {
    /// The requested duration was zero or negative.
    NonPositive,
    /// The requested duration was NaN or infinite.
    NonFinite(f64),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::NonPositive => f.write_str("wait duration must be strictly positive"),
            WaitError::NonFinite(value) => write!(f, "non-finite wait duration {value}"),
        }
    }
}

/// Convergent-halving wait over an injected clock.
///
/// All methods take `&self`, so a single instance can be shared by the
/// control loop and any helper that needs to block.
#[derive(Clone, Debug)]
pub struct HighPrecisionWait<C> {
    clock: C,
    spin_threshold: Duration,
}

impl<C> HighPrecisionWait<C>
where
    C: MonotonicClock,
{
    /// Creates a wait using the default spin threshold.
    pub const fn new(clock: C) -> Self {
        Self::with_spin_threshold(clock, SPIN_THRESHOLD)
    }

    /// Creates a wait with a custom spin threshold.
    pub const fn with_spin_threshold(clock: C, spin_threshold: Duration) -> Self {
        Self {
            clock,
            spin_threshold,
        }
    }

    /// Underlying clock.
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    /// Blocks until `duration` has elapsed and returns the measured elapsed time.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::NonPositive`] for a zero duration.
    pub fn wait(&self, duration: Duration) -> Result<Duration, WaitError> {
        if duration.is_zero() {
            return Err(WaitError::NonPositive);
        }

        let start = self.clock.now();
        loop {
            let elapsed = self.clock.now().saturating_sub(start);
            if elapsed >= duration {
                return Ok(elapsed);
            }

            let remaining = duration - elapsed;
            if remaining >= self.spin_threshold {
                self.clock.sleep(remaining / 2);
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Blocks for `seconds`, validating the floating-point input first.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::NonFinite`] for NaN or infinite input and
    /// [`WaitError::NonPositive`] for values `<= 0`.
    pub fn wait_secs(&self, seconds: f64) -> Result<Duration, WaitError> {
        if !seconds.is_finite() {
            return Err(WaitError::NonFinite(seconds));
        }
        if seconds <= 0.0 {
            return Err(WaitError::NonPositive);
        }
        self.wait(Duration::from_secs_f64(seconds))
    }
}
