//! Pools of inter-stimulus delays derived from a previously measured rhythm.
//!
//! A respiration-synchronous block yields an array of confirmed peaks. Their
//! consecutive differences, trimmed to the `[p, 100 - p]` percentile band,
//! drive the timing of later blocks in one of two ways:
//!
//! * cardiac blocks consume the pool without replacement, always taking the
//!   delay closest to the most recently observed interval
//!   ([`DelayPool::match_and_pop`]);
//! * asynchronous blocks bootstrap a full delay sequence with replacement
//!   ([`DelayPool::sample`]), decoupled from any live detector.

use core::{fmt, time::Duration};

use heapless::Vec;
use rand::{Rng, RngCore};

use crate::{Timestamp, distance};

/// Static storage for delay pools and sampled delay sequences.
pub const MAX_POOL_DELAYS: usize = 512;

/// Two delays closer than this to the observed interval are treated as tied.
pub const MATCH_TIE_TOLERANCE: f64 = 1e-9;

/// Bounded sequence of delays, in seconds.
pub type Delays = Vec<f64, MAX_POOL_DELAYS>;

/// Errors raised while building or consuming a pool.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DelayPoolError {
    /// Fewer than two peaks, or no intervals, were supplied.
    Empty,
    /// More intervals were requested than the static storage can hold.
    TooMany { requested: usize, max: usize },
    /// An interval or observation was NaN or infinite.
    NonFinite(f64),
    /// An interval was zero or negative (peaks out of order).
    NonPositive(f64),
    /// The trimming band must sit within `[0, 50)` percent.
    EdgeOutOfRange(f64),
    /// Every delay has already been consumed.
    Exhausted,
}

impl fmt::Display for DelayPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayPoolError::Empty => f.write_str("no intervals to build a delay pool from"),
            DelayPoolError::TooMany { requested, max } => {
                write!(f, "{requested} delays requested, at most {max} supported")
            }
            DelayPoolError::NonFinite(value) => write!(f, "non-finite delay {value}"),
            DelayPoolError::NonPositive(value) => write!(f, "non-positive delay {value}"),
            DelayPoolError::EdgeOutOfRange(value) => {
                write!(f, "edge percentile {value} outside [0, 50)")
            }
            DelayPoolError::Exhausted => f.write_str("delay pool exhausted"),
        }
    }
}

/// Consumable multiset of delays, in seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct DelayPool {
    delays: Delays,
}

impl DelayPool {
    /// Builds a pool from raw intervals, discarding values outside the
    /// `[edge_percentile, 100 - edge_percentile]` band.
    ///
    /// Percentile edges use the lower-rank rule on the sorted intervals and
    /// the band is closed, so a constant rhythm keeps every interval.
    ///
    /// # Errors
    ///
    /// Returns a [`DelayPoolError`] when `intervals` is empty or too long,
    /// holds a non-finite or non-positive value, or the band is invalid.
    pub fn from_intervals(intervals: &[f64], edge_percentile: f64) -> Result<Self, DelayPoolError> {
        if !(0.0..50.0).contains(&edge_percentile) {
            return Err(DelayPoolError::EdgeOutOfRange(edge_percentile));
        }
        if intervals.is_empty() {
            return Err(DelayPoolError::Empty);
        }
        if intervals.len() > MAX_POOL_DELAYS {
            return Err(DelayPoolError::TooMany {
                requested: intervals.len(),
                max: MAX_POOL_DELAYS,
            });
        }

        let mut sorted = Delays::new();
        for &interval in intervals {
            if !interval.is_finite() {
                return Err(DelayPoolError::NonFinite(interval));
            }
            if interval <= 0.0 {
                return Err(DelayPoolError::NonPositive(interval));
            }
            let _ = sorted.push(interval);
        }
        sorted.sort_unstable_by(f64::total_cmp);

        let low = sorted[lower_rank(sorted.len(), edge_percentile)];
        let high = sorted[lower_rank(sorted.len(), 100.0 - edge_percentile)];

        let delays = intervals
            .iter()
            .copied()
            .filter(|interval| (low..=high).contains(interval))
            .collect::<Delays>();

        Ok(Self { delays })
    }

    /// Builds a pool from the differences between consecutive peaks.
    ///
    /// # Errors
    ///
    /// Returns [`DelayPoolError::Empty`] for fewer than two peaks, and the
    /// errors of [`from_intervals`](Self::from_intervals) otherwise.
    pub fn from_peaks(peaks: &[Timestamp], edge_percentile: f64) -> Result<Self, DelayPoolError> {
        if peaks.len() < 2 {
            return Err(DelayPoolError::Empty);
        }
        if peaks.len() - 1 > MAX_POOL_DELAYS {
            return Err(DelayPoolError::TooMany {
                requested: peaks.len() - 1,
                max: MAX_POOL_DELAYS,
            });
        }

        let intervals = peaks
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect::<Delays>();
        Self::from_intervals(&intervals, edge_percentile)
    }

    /// Remaining delays.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        self.delays.as_slice()
    }

    /// Number of remaining delays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// `true` once every delay has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// Removes and returns the delay closest to `observed`.
    ///
    /// Without an observation (first draw of a block) a uniformly random
    /// delay is taken instead. Ties go to the earliest delay in the pool.
    ///
    /// # Errors
    ///
    /// Returns [`DelayPoolError::Exhausted`] on an empty pool and
    /// [`DelayPoolError::NonFinite`] for a NaN or infinite observation.
    pub fn match_and_pop<R>(
        &mut self,
        observed: Option<f64>,
        rng: &mut R,
    ) -> Result<f64, DelayPoolError>
    where
        R: RngCore + ?Sized,
    {
        if self.delays.is_empty() {
            return Err(DelayPoolError::Exhausted);
        }

        let index = match observed {
            None => rng.gen_range(0..self.delays.len()),
            Some(value) if !value.is_finite() => return Err(DelayPoolError::NonFinite(value)),
            Some(value) => self.closest_index(value),
        };
        Ok(self.delays.remove(index))
    }

    fn closest_index(&self, observed: f64) -> usize {
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for (index, &delay) in self.delays.iter().enumerate() {
            let gap = distance(delay, observed);
            let tied = distance(gap, best_distance) <= MATCH_TIE_TOLERANCE;
            if !tied && gap < best_distance {
                best = index;
                best_distance = gap;
            }
        }
        best
    }

    /// Draws `n` delays independently, with replacement.
    ///
    /// # Errors
    ///
    /// Returns [`DelayPoolError::Exhausted`] on an empty pool and
    /// [`DelayPoolError::TooMany`] when `n` exceeds [`MAX_POOL_DELAYS`].
    pub fn sample<R>(&self, n: usize, rng: &mut R) -> Result<Delays, DelayPoolError>
    where
        R: RngCore + ?Sized,
    {
        if self.delays.is_empty() {
            return Err(DelayPoolError::Exhausted);
        }
        if n > MAX_POOL_DELAYS {
            return Err(DelayPoolError::TooMany {
                requested: n,
                max: MAX_POOL_DELAYS,
            });
        }

        let mut drawn = Delays::new();
        for _ in 0..n {
            let _ = drawn.push(self.delays[rng.gen_range(0..self.delays.len())]);
        }
        Ok(drawn)
    }

    /// Builds a pool of exactly `n` delays bootstrapped from this one, so a
    /// block of `n` stimuli can consume one delay per delivery.
    ///
    /// # Errors
    ///
    /// Same as [`sample`](Self::sample).
    pub fn resample<R>(&self, n: usize, rng: &mut R) -> Result<Self, DelayPoolError>
    where
        R: RngCore + ?Sized,
    {
        self.sample(n, rng).map(|delays| Self { delays })
    }
}

/// Scheduled length of an asynchronous block: every stimulus waits the target
/// delay and then its inter-stimulus delay, followed by a drain of
/// `1.1 * sound_duration`.
#[must_use]
pub fn block_duration(delays: &[f64], target_delay: Duration, sound_duration: Duration) -> Duration {
    let waits: f64 = delays.iter().sum();
    let count = u32::try_from(delays.len()).unwrap_or(u32::MAX);
    Duration::from_secs_f64(waits.max(0.0)) + target_delay * count + sound_duration.mul_f64(1.1)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn lower_rank(len: usize, percentile: f64) -> usize {
    let position = percentile / 100.0 * (len - 1) as f64;
    (position as usize).min(len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn percentile_band_drops_outliers() {
        let pool = DelayPool::from_intervals(&[0.9, 1.0, 1.1, 5.0], 10.0).unwrap();
        assert_eq!(pool.as_slice(), &[0.9, 1.0, 1.1]);
    }

    #[test]
    fn nearest_match_is_consumed() {
        let mut pool = DelayPool::from_intervals(&[0.9, 1.0, 1.1, 5.0], 10.0).unwrap();
        let delay = pool.match_and_pop(Some(0.95), &mut rng()).unwrap();
        assert_eq!(delay, 1.0);
        assert_eq!(pool.as_slice(), &[0.9, 1.1]);
    }

    #[test]
    fn ties_take_the_earliest_delay() {
        let mut pool = DelayPool::from_intervals(&[3.0, 4.0, 2.0], 0.0).unwrap();
        assert_eq!(pool.match_and_pop(Some(3.5), &mut rng()), Ok(3.0));
        assert_eq!(pool.as_slice(), &[4.0, 2.0]);
        assert_eq!(pool.match_and_pop(Some(3.0), &mut rng()), Ok(4.0));
        assert_eq!(pool.match_and_pop(Some(100.0), &mut rng()), Ok(2.0));
        assert_eq!(
            pool.match_and_pop(Some(1.0), &mut rng()),
            Err(DelayPoolError::Exhausted)
        );
    }

    #[test]
    fn constant_rhythm_keeps_every_interval() {
        let pool = DelayPool::from_intervals(&[4.0; 12], 10.0).unwrap();
        assert_eq!(pool.len(), 12);
    }

    #[test]
    fn pool_is_built_from_peak_differences() {
        let pool = DelayPool::from_peaks(&[0.0, 3.5, 7.5, 12.0], 0.0).unwrap();
        assert_eq!(pool.as_slice(), &[3.5, 4.0, 4.5]);
        assert_eq!(
            DelayPool::from_peaks(&[1.0], 10.0),
            Err(DelayPoolError::Empty)
        );
        assert_eq!(
            DelayPool::from_peaks(&[2.0, 1.0], 10.0),
            Err(DelayPoolError::NonPositive(-1.0))
        );
    }

    #[test]
    fn random_first_draw_comes_from_the_pool() {
        let mut pool = DelayPool::from_intervals(&[3.0, 3.5, 4.0], 0.0).unwrap();
        let drawn = pool.match_and_pop(None, &mut rng()).unwrap();
        assert!([3.0, 3.5, 4.0].contains(&drawn));
        assert_eq!(pool.len(), 2);
        assert!(!pool.as_slice().contains(&drawn));
    }

    #[test]
    fn sampling_keeps_the_pool_intact() {
        let pool = DelayPool::from_intervals(&[3.0, 3.5, 4.0], 0.0).unwrap();
        let drawn = pool.sample(40, &mut rng()).unwrap();
        assert_eq!(drawn.len(), 40);
        assert!(drawn.iter().all(|delay| pool.as_slice().contains(delay)));
        assert_eq!(pool.len(), 3);

        let resampled = pool.resample(30, &mut rng()).unwrap();
        assert_eq!(resampled.len(), 30);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert_eq!(
            DelayPool::from_intervals(&[], 10.0),
            Err(DelayPoolError::Empty)
        );
        assert_eq!(
            DelayPool::from_intervals(&[1.0], 50.0),
            Err(DelayPoolError::EdgeOutOfRange(50.0))
        );
        assert!(matches!(
            DelayPool::from_intervals(&[1.0, f64::INFINITY], 10.0),
            Err(DelayPoolError::NonFinite(_))
        ));
        let mut pool = DelayPool::from_intervals(&[1.0], 10.0).unwrap();
        assert!(matches!(
            pool.match_and_pop(Some(f64::NAN), &mut rng()),
            Err(DelayPoolError::NonFinite(_))
        ));
    }

    #[test]
    fn block_duration_adds_waits_and_drain() {
        let duration = block_duration(
            &[1.0, 2.0],
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        assert_eq!(duration.as_millis(), 3620);
    }
}
