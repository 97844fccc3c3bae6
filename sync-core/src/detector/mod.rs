//! Per-channel peak confirmation.
//!
//! Raw peak finders re-detect the same physiological event on every refresh of
//! the streamed buffer, alongside a fair amount of noise. The
//! [`PeakConfirmer`] debounces those detections: a timestamp has to be seen on
//! [`CONFIRMATION_THRESHOLD`] scans before it is trusted, the very first
//! trusted peak only anchors the refractory baseline, and later peaks are
//! reported when they sit at least one refractory distance after the previous
//! confirmation.

use core::{fmt, mem, time::Duration};

use heapless::Vec;

use crate::Timestamp;
use crate::config::{ConfigError, SyncConfig};

/// Number of scans a candidate must appear on before it can be confirmed.
pub const CONFIRMATION_THRESHOLD: u8 = 4;

/// Static candidate storage per channel. Configurations whose
/// `capacity_per_window` exceeds this are rejected.
pub const MAX_CANDIDATES: usize = 64;

/// Physiological channel a confirmer is attached to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Channel {
    Respiration,
    Cardiac,
}

impl Channel {
    /// Short tag used in logs and transcripts.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Channel::Respiration => "resp",
            Channel::Cardiac => "ecg",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Respiration => f.write_str("respiration"),
            Channel::Cardiac => f.write_str("cardiac"),
        }
    }
}

/// A raw detection accumulating votes across scans.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PeakCandidate {
    pub timestamp: Timestamp,
    pub votes: u8,
}

impl PeakCandidate {
    const fn seen_once(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            votes: 1,
        }
    }

    const fn is_confirmable(&self) -> bool {
        self.votes >= CONFIRMATION_THRESHOLD
    }
}

/// Candidate storage for one confirmation cycle.
pub type CandidateSet = Vec<PeakCandidate, MAX_CANDIDATES>;

/// Evidence accumulated by a confirmer between two decisions.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ConfirmerState {
    /// No evidence collected; the next non-empty scan seeds the cycle.
    #[default]
    Empty,
    /// Candidates seen since the cycle started.
    Collecting(CandidateSet),
}

impl ConfirmerState {
    /// Candidates held in the current cycle.
    #[must_use]
    pub fn candidates(&self) -> &[PeakCandidate] {
        match self {
            ConfirmerState::Empty => &[],
            ConfirmerState::Collecting(candidates) => candidates.as_slice(),
        }
    }
}

/// What happened during the most recent scan.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ScanOutcome {
    /// The scan carried no detections; nothing changed.
    NoEvidence,
    /// A new cycle started with this many candidates.
    Seeded { candidates: usize },
    /// Votes were counted but no candidate reached the threshold yet.
    Collecting { candidates: usize },
    /// Too many candidates for the window; all evidence was discarded.
    Overflow { candidates: usize },
    /// First confirmable peak of the channel, kept as refractory anchor only.
    Absorbed(Timestamp),
    /// Peak confirmed and reported to the caller.
    Confirmed(Timestamp),
    /// Peak confirmed but too close to the previous one.
    Refractory {
        candidate: Timestamp,
        last: Timestamp,
    },
}

impl ScanOutcome {
    /// Timestamp surfaced to the caller, if any.
    #[must_use]
    pub const fn reported(self) -> Option<Timestamp> {
        match self {
            ScanOutcome::Confirmed(timestamp) => Some(timestamp),
            _ => None,
        }
    }
}

/// Contract violations detected on scan input.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ScanError {
    /// A raw peak timestamp was NaN or infinite.
    NonFinite(f64),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::NonFinite(value) => write!(f, "non-finite peak timestamp {value}"),
        }
    }
}

/// Debounce/voting state machine for a single channel.
#[derive(Clone, Debug)]
pub struct PeakConfirmer {
    channel: Channel,
    min_refractory_distance: f64,
    capacity_per_window: usize,
    last_confirmed_peak: Option<Timestamp>,
    state: ConfirmerState,
    last_outcome: ScanOutcome,
}

impl PeakConfirmer {
    /// Builds a confirmer for `channel` from the session configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the channel's refractory distance is zero
    /// or the derived window capacity is unusable.
    pub fn new(channel: Channel, config: &SyncConfig) -> Result<Self, ConfigError> {
        Self::with_parameters(
            channel,
            config.channel(channel).distance,
            config.capacity_per_window(channel),
        )
    }

    /// Builds a confirmer from explicit parameters.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `min_refractory_distance` is zero or
    /// `capacity_per_window` is zero or above [`MAX_CANDIDATES`].
    pub fn with_parameters(
        channel: Channel,
        min_refractory_distance: Duration,
        capacity_per_window: usize,
    ) -> Result<Self, ConfigError> {
        if min_refractory_distance.is_zero() {
            return Err(ConfigError::ZeroDuration("refractory distance"));
        }
        if capacity_per_window == 0 {
            return Err(ConfigError::ZeroCapacity(channel));
        }
        if capacity_per_window > MAX_CANDIDATES {
            return Err(ConfigError::CapacityTooLarge {
                channel,
                capacity: capacity_per_window,
                max: MAX_CANDIDATES,
            });
        }

        Ok(Self {
            channel,
            min_refractory_distance: min_refractory_distance.as_secs_f64(),
            capacity_per_window,
            last_confirmed_peak: None,
            state: ConfirmerState::Empty,
            last_outcome: ScanOutcome::NoEvidence,
        })
    }

    /// Channel this confirmer debounces.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Most recent confirmed (or absorbed) peak.
    #[must_use]
    pub const fn last_confirmed_peak(&self) -> Option<Timestamp> {
        self.last_confirmed_peak
    }

    /// Upper bound on candidates before evidence is discarded.
    #[must_use]
    pub const fn capacity_per_window(&self) -> usize {
        self.capacity_per_window
    }

    /// Current evidence.
    #[must_use]
    pub const fn state(&self) -> &ConfirmerState {
        &self.state
    }

    /// Outcome of the most recent [`submit_scan`](Self::submit_scan).
    #[must_use]
    pub const fn last_outcome(&self) -> ScanOutcome {
        self.last_outcome
    }

    /// Forgets all evidence and the refractory anchor.
    pub fn reset(&mut self) {
        self.state = ConfirmerState::Empty;
        self.last_confirmed_peak = None;
        self.last_outcome = ScanOutcome::NoEvidence;
    }

    /// Feeds the raw peak timestamps detected in the current buffer window.
    ///
    /// Returns the newly confirmed peak, or `None` while evidence is still
    /// being gathered, was discarded, or the peak fell within the refractory
    /// distance of the previous confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::NonFinite`] if any timestamp is NaN or infinite; the
    /// confirmer state is left untouched.
    pub fn submit_scan(&mut self, raw_peaks: &[Timestamp]) -> Result<Option<Timestamp>, ScanError> {
        if let Some(&bad) = raw_peaks.iter().find(|timestamp| !timestamp.is_finite()) {
            return Err(ScanError::NonFinite(bad));
        }

        let outcome = self.evaluate(raw_peaks);
        self.last_outcome = outcome;
        Ok(outcome.reported())
    }

    fn evaluate(&mut self, raw_peaks: &[Timestamp]) -> ScanOutcome {
        if raw_peaks.is_empty() {
            return ScanOutcome::NoEvidence;
        }

        let mut candidates = match mem::take(&mut self.state) {
            ConfirmerState::Empty => return self.seed(raw_peaks),
            ConfirmerState::Collecting(candidates) => candidates,
        };

        for candidate in &mut candidates {
            if contains(raw_peaks, candidate.timestamp) {
                candidate.votes = candidate.votes.saturating_add(1);
            }
        }

        let existing = candidates.len();
        let fresh = (0..raw_peaks.len())
            .filter(|&index| is_fresh(raw_peaks, index, &candidates))
            .count();
        if existing + fresh > self.capacity_per_window {
            // State was taken above, so the cycle restarts from empty.
            return ScanOutcome::Overflow {
                candidates: existing + fresh,
            };
        }

        for (index, &timestamp) in raw_peaks.iter().enumerate() {
            if is_fresh(raw_peaks, index, &candidates) {
                // Bounded by capacity_per_window, itself at most MAX_CANDIDATES.
                let _ = candidates.push(PeakCandidate::seen_once(timestamp));
            }
        }

        let winner = candidates
            .iter()
            .filter(|candidate| candidate.is_confirmable())
            .map(|candidate| candidate.timestamp)
            .reduce(f64::max);

        let Some(winner) = winner else {
            let count = candidates.len();
            self.state = ConfirmerState::Collecting(candidates);
            return ScanOutcome::Collecting { candidates: count };
        };

        // A decision was reached: the next cycle starts from empty.
        match self.last_confirmed_peak {
            None => {
                self.last_confirmed_peak = Some(winner);
                ScanOutcome::Absorbed(winner)
            }
            Some(last) if winner - last >= self.min_refractory_distance => {
                self.last_confirmed_peak = Some(winner);
                ScanOutcome::Confirmed(winner)
            }
            Some(last) => ScanOutcome::Refractory {
                candidate: winner,
                last,
            },
        }
    }

    fn seed(&mut self, raw_peaks: &[Timestamp]) -> ScanOutcome {
        let distinct = (0..raw_peaks.len())
            .filter(|&index| is_fresh(raw_peaks, index, &[]))
            .count();
        if distinct > self.capacity_per_window {
            return ScanOutcome::Overflow {
                candidates: distinct,
            };
        }

        let mut candidates = CandidateSet::new();
        for (index, &timestamp) in raw_peaks.iter().enumerate() {
            if is_fresh(raw_peaks, index, &[]) {
                let _ = candidates.push(PeakCandidate::seen_once(timestamp));
            }
        }

        self.state = ConfirmerState::Collecting(candidates);
        ScanOutcome::Seeded {
            candidates: distinct,
        }
    }
}

// Candidates are keyed by the exact sample timestamp reported by the stream.
#[allow(clippy::float_cmp)]
fn same_instant(a: Timestamp, b: Timestamp) -> bool {
    a == b
}

fn contains(timestamps: &[Timestamp], needle: Timestamp) -> bool {
    timestamps
        .iter()
        .any(|timestamp| same_instant(*timestamp, needle))
}

/// `true` when `raw_peaks[index]` is neither an earlier duplicate in the scan
/// nor an existing candidate.
fn is_fresh(raw_peaks: &[Timestamp], index: usize, candidates: &[PeakCandidate]) -> bool {
    let timestamp = raw_peaks[index];
    !contains(&raw_peaks[..index], timestamp)
        && !candidates
            .iter()
            .any(|candidate| same_instant(candidate.timestamp, timestamp))
}
