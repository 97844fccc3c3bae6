//! Rolling inter-beat-interval estimate for cardiac channels.

use core::fmt;

use heapless::HistoryBuf;

use crate::Timestamp;

/// Number of beats retained by the default monitor.
pub const DEFAULT_RATE_WINDOW: usize = 10;

/// Errors surfaced when querying the monitor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RateError {
    /// Fewer beats than the window capacity have been recorded.
    Uninitialized { recorded: usize, required: usize },
}

impl fmt::Display for RateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateError::Uninitialized { recorded, required } => write!(
                f,
                "heart-rate monitor not initialized ({recorded}/{required} beats)"
            ),
        }
    }
}

/// Fixed-capacity circular buffer of the last `N` confirmed beats.
///
/// The estimate is the plain mean of the `N - 1` consecutive differences. It
/// is recomputed on every query and only becomes available once the buffer
/// has been filled.
#[derive(Clone, Debug)]
pub struct RateMonitor<const N: usize = DEFAULT_RATE_WINDOW> {
    beats: HistoryBuf<Timestamp, N>,
    recorded: usize,
    initialized: bool,
}

impl<const N: usize> RateMonitor<N> {
    /// Creates an empty monitor.
    #[must_use]
    pub const fn new() -> Self {
        const { assert!(N >= 2, "a rate monitor needs at least two beats") };
        Self {
            beats: HistoryBuf::new(),
            recorded: 0,
            initialized: false,
        }
    }

    /// Appends a confirmed beat, evicting the oldest once full.
    pub fn add_beat(&mut self, timestamp: Timestamp) {
        self.beats.write(timestamp);
        self.recorded = self.recorded.saturating_add(1);
        if self.recorded >= N {
            self.initialized = true;
        }
    }

    /// `true` once `N` beats have been recorded.
    #[must_use]
    pub const fn initialized(&self) -> bool {
        self.initialized
    }

    /// Mean delay between two consecutive beats, in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`RateError::Uninitialized`] until the window has been filled.
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_interval(&self) -> Result<f64, RateError> {
        if !self.initialized {
            return Err(RateError::Uninitialized {
                recorded: self.recorded,
                required: N,
            });
        }

        let mut previous: Option<Timestamp> = None;
        let mut total = 0.0;
        for &beat in self.beats.oldest_ordered() {
            if let Some(earlier) = previous {
                total += beat - earlier;
            }
            previous = Some(beat);
        }
        Ok(total / (N - 1) as f64)
    }

    /// Heart rate in beats per second.
    ///
    /// # Errors
    ///
    /// Returns [`RateError::Uninitialized`] until the window has been filled.
    pub fn rate(&self) -> Result<f64, RateError> {
        self.mean_interval().map(|interval| 1.0 / interval)
    }

    /// Heart rate in beats per minute.
    ///
    /// # Errors
    ///
    /// Returns [`RateError::Uninitialized`] until the window has been filled.
    pub fn bpm(&self) -> Result<f64, RateError> {
        self.rate().map(|rate| rate * 60.0)
    }
}

impl<const N: usize> Default for RateMonitor<N> {
    fn default() -> Self {
        Self::new()
    }
}
