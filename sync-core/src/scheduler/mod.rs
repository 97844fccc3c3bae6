//! Turns confirmed peaks into stimulus delivery decisions.
//!
//! A [`DeliveryScheduler`] owns the block's [`StimulusSequence`] and decides,
//! for every confirmed peak, whether the current stimulus should fire and
//! after how long. Two modes exist:
//!
//! * respiration-synchronous: fire `target_delay` after every peak;
//! * cardiac-synchronous: wait for the heart-rate monitor to warm up, then
//!   fire on the beat closest to a target time drawn from a [`DelayPool`],
//!   deferring when the next predicted beat would land closer.
//!
//! A `FireAt` decision is committed immediately: the sequence cursor has
//! already advanced when the caller receives it. Skips never advance the
//! cursor, so no stimulus is dropped.

use core::{fmt, time::Duration};

use heapless::Vec;
use rand::RngCore;

use crate::config::SyncConfig;
use crate::delays::{DelayPool, DelayPoolError};
use crate::detector::Channel;
use crate::heartrate::{DEFAULT_RATE_WINDOW, RateError, RateMonitor};
use crate::sequence::{MAX_SEQUENCE_LEN, Stimulus, StimulusSequence};
use crate::telemetry::{DeliveryEventKind, DeliveryPayload, DeliverySummary, TelemetryRecorder};
use crate::{Timestamp, distance};

/// Peaks on which a stimulus was delivered, in delivery order.
pub type DeliveredPeaks = Vec<Timestamp, MAX_SEQUENCE_LEN>;

/// Why a confirmed peak did not produce a stimulus.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SkipReason {
    /// The ideal firing instant had already passed.
    Late { late_by: Duration },
    /// The heart-rate monitor has not seen a full window of beats yet.
    Warmup { recorded: usize, required: usize },
    /// The next predicted beat lands closer to the target time.
    Lookahead { current: f64, predicted: f64 },
    /// Every stimulus of the block has been delivered.
    Complete,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Late { late_by } => {
                write!(f, "too late by {:.3} ms", late_by.as_secs_f64() * 1000.0)
            }
            SkipReason::Warmup { recorded, required } => {
                write!(f, "heart-rate monitor warming up ({recorded}/{required})")
            }
            SkipReason::Lookahead { current, predicted } => write!(
                f,
                "next beat closer to target ({predicted:.3} s < {current:.3} s)"
            ),
            SkipReason::Complete => f.write_str("sequence complete"),
        }
    }
}

/// Outcome of [`DeliveryScheduler::on_confirmed_peak`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DeliveryDecision {
    Skip(SkipReason),
    /// Play `stimulus` and pulse its trigger once `wait` has elapsed.
    FireAt { wait: Duration, stimulus: Stimulus },
}

impl DeliveryDecision {
    /// Returns `true` for [`DeliveryDecision::FireAt`].
    #[must_use]
    pub const fn fires(&self) -> bool {
        matches!(self, DeliveryDecision::FireAt { .. })
    }
}

/// Errors raised by the scheduler.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SchedulerError {
    /// A peak or clock reading was NaN or infinite.
    NonFinite(f64),
    /// The wait before firing, in seconds, is too large for a [`Duration`].
    OutOfRange(f64),
    /// The cardiac pool cannot cover every stimulus of the sequence.
    PoolTooSmall { pool: usize, sequence: usize },
    /// Drawing the next target time failed.
    Pool(DelayPoolError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::NonFinite(value) => write!(f, "non-finite timestamp {value}"),
            SchedulerError::OutOfRange(wait) => {
                write!(f, "wait of {wait} s does not fit a duration")
            }
            SchedulerError::PoolTooSmall { pool, sequence } => write!(
                f,
                "delay pool of {pool} cannot cover a sequence of {sequence} stimuli"
            ),
            SchedulerError::Pool(err) => write!(f, "delay pool: {err}"),
        }
    }
}

impl From<DelayPoolError> for SchedulerError {
    fn from(value: DelayPoolError) -> Self {
        SchedulerError::Pool(value)
    }
}

#[derive(Clone, Debug)]
struct CardiacState {
    monitor: RateMonitor<DEFAULT_RATE_WINDOW>,
    pool: DelayPool,
    target_time: Option<Timestamp>,
    last_fired_at: Option<Timestamp>,
}

#[derive(Clone, Debug)]
enum Mode {
    Respiration,
    Cardiac(CardiacState),
}

/// Per-block scheduling state machine.
#[derive(Clone, Debug)]
pub struct DeliveryScheduler {
    mode: Mode,
    sequence: StimulusSequence,
    target_delay: f64,
    delivered: DeliveredPeaks,
    telemetry: TelemetryRecorder,
}

impl DeliveryScheduler {
    /// Scheduler that fires `target_delay` after every confirmed respiration peak.
    #[must_use]
    pub fn respiration(config: &SyncConfig, sequence: StimulusSequence) -> Self {
        Self::with_mode(Mode::Respiration, config, sequence)
    }

    /// Predictive cardiac scheduler consuming `pool` one delay per delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::PoolTooSmall`] when the pool holds fewer
    /// delays than the sequence has stimuli.
    pub fn cardiac(
        config: &SyncConfig,
        sequence: StimulusSequence,
        pool: DelayPool,
    ) -> Result<Self, SchedulerError> {
        if pool.len() < sequence.len() {
            return Err(SchedulerError::PoolTooSmall {
                pool: pool.len(),
                sequence: sequence.len(),
            });
        }

        let state = CardiacState {
            monitor: RateMonitor::new(),
            pool,
            target_time: None,
            last_fired_at: None,
        };
        Ok(Self::with_mode(Mode::Cardiac(state), config, sequence))
    }

    fn with_mode(mode: Mode, config: &SyncConfig, sequence: StimulusSequence) -> Self {
        Self {
            mode,
            sequence,
            target_delay: config.target_delay.as_secs_f64(),
            delivered: Vec::new(),
            telemetry: TelemetryRecorder::new(),
        }
    }

    /// Channel whose peaks drive this scheduler.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self.mode {
            Mode::Respiration => Channel::Respiration,
            Mode::Cardiac(_) => Channel::Cardiac,
        }
    }

    /// Decides what to do with a freshly confirmed peak.
    ///
    /// `now` is read from the same clock as the peak timestamps. `rng` is only
    /// consulted for the first target draw of a cardiac block.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NonFinite`] for a NaN or infinite `peak` or
    /// `now`, [`SchedulerError::OutOfRange`] when the wait cannot be held in a
    /// [`Duration`], and [`SchedulerError::Pool`] if the cardiac pool runs dry.
    pub fn on_confirmed_peak<R>(
        &mut self,
        peak: Timestamp,
        now: Timestamp,
        rng: &mut R,
    ) -> Result<DeliveryDecision, SchedulerError>
    where
        R: RngCore + ?Sized,
    {
        for value in [peak, now] {
            if !value.is_finite() {
                return Err(SchedulerError::NonFinite(value));
            }
        }

        let channel = self.channel();
        self.telemetry.record(
            DeliveryEventKind::PeakConfirmed(channel),
            DeliveryPayload::None,
            peak,
        );

        if self.sequence.is_complete() {
            return Ok(self.skip(peak, SkipReason::Complete));
        }

        if let Mode::Cardiac(state) = &mut self.mode {
            let was_ready = state.monitor.initialized();
            state.monitor.add_beat(peak);
            let mean_interval = match state.monitor.mean_interval() {
                Ok(mean) => mean,
                Err(RateError::Uninitialized { recorded, required }) => {
                    return Ok(self.skip(peak, SkipReason::Warmup { recorded, required }));
                }
            };
            if !was_ready {
                self.telemetry.record(
                    DeliveryEventKind::RateMonitorReady,
                    DeliveryPayload::Rate { mean_interval },
                    peak,
                );
            }

            if let Some(target) = state.target_time {
                let current = distance(peak, target);
                let predicted = distance(target, peak + mean_interval);
                if predicted < current {
                    return Ok(self.skip(peak, SkipReason::Lookahead { current, predicted }));
                }
            }
        }

        let wait = peak + self.target_delay - now;
        if wait <= 0.0 {
            let late_by = Duration::try_from_secs_f64(-wait).unwrap_or(Duration::MAX);
            return Ok(self.skip(peak, SkipReason::Late { late_by }));
        }

        let Some(stimulus) = self.sequence.current() else {
            return Ok(self.skip(peak, SkipReason::Complete));
        };
        let wait =
            Duration::try_from_secs_f64(wait).map_err(|_| SchedulerError::OutOfRange(wait))?;
        self.commit(peak, wait, stimulus, rng)?;
        Ok(DeliveryDecision::FireAt { wait, stimulus })
    }

    fn commit<R>(
        &mut self,
        peak: Timestamp,
        wait: Duration,
        stimulus: Stimulus,
        rng: &mut R,
    ) -> Result<(), SchedulerError>
    where
        R: RngCore + ?Sized,
    {
        self.sequence.advance();
        let _ = self.delivered.push(peak);
        self.telemetry.record(
            DeliveryEventKind::Fired(stimulus.kind),
            DeliveryPayload::Fire {
                wait,
                trigger: stimulus.trigger,
                index: stimulus.index,
            },
            peak,
        );

        let Mode::Cardiac(state) = &mut self.mode else {
            return Ok(());
        };
        if self.sequence.is_complete() {
            state.last_fired_at = Some(peak);
            return Ok(());
        }

        let observed = state.last_fired_at.map(|last| peak - last);
        let delay = state.pool.match_and_pop(observed, rng)?;
        let target_time = peak + delay;
        state.target_time = Some(target_time);
        state.last_fired_at = Some(peak);
        self.telemetry.record(
            DeliveryEventKind::TargetDrawn,
            DeliveryPayload::Target { target_time, delay },
            peak,
        );
        Ok(())
    }

    fn skip(&mut self, peak: Timestamp, reason: SkipReason) -> DeliveryDecision {
        let (event, details) = match reason {
            SkipReason::Late { late_by } => {
                (DeliveryEventKind::SkippedLate, DeliveryPayload::Late { late_by })
            }
            SkipReason::Warmup { .. } => (DeliveryEventKind::SkippedWarmup, DeliveryPayload::None),
            SkipReason::Lookahead { current, predicted } => (
                DeliveryEventKind::SkippedLookahead,
                DeliveryPayload::Lookahead { current, predicted },
            ),
            SkipReason::Complete => (DeliveryEventKind::SkippedComplete, DeliveryPayload::None),
        };
        self.telemetry.record(event, details, peak);
        DeliveryDecision::Skip(reason)
    }

    /// The block's stimulus sequence and its cursor.
    #[must_use]
    pub const fn sequence(&self) -> &StimulusSequence {
        &self.sequence
    }

    /// `true` once every stimulus has been delivered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.sequence.is_complete()
    }

    /// Peaks on which a stimulus fired. Seeds delay pools for later blocks.
    #[must_use]
    pub fn delivered_peaks(&self) -> &[Timestamp] {
        self.delivered.as_slice()
    }

    /// Next ideal firing time of a cardiac block.
    #[must_use]
    pub const fn target_time(&self) -> Option<Timestamp> {
        match &self.mode {
            Mode::Respiration => None,
            Mode::Cardiac(state) => state.target_time,
        }
    }

    /// Heart-rate monitor of a cardiac block.
    #[must_use]
    pub const fn rate_monitor(&self) -> Option<&RateMonitor<DEFAULT_RATE_WINDOW>> {
        match &self.mode {
            Mode::Respiration => None,
            Mode::Cardiac(state) => Some(&state.monitor),
        }
    }

    /// Delays still available to a cardiac block.
    #[must_use]
    pub fn remaining_delays(&self) -> usize {
        match &self.mode {
            Mode::Respiration => 0,
            Mode::Cardiac(state) => state.pool.len(),
        }
    }

    /// Recorded delivery telemetry.
    #[must_use]
    pub const fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    /// Counters covering every decision taken so far.
    #[must_use]
    pub const fn summary(&self) -> DeliverySummary {
        self.telemetry.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToneSet;
    use crate::sequence::StimulusKind;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    const TOLERANCE: f64 = 1e-9;

    fn sequence(n: usize) -> StimulusSequence {
        StimulusSequence::ordered(n, 0, ToneSet::default()).unwrap()
    }

    fn fire_wait(decision: DeliveryDecision) -> f64 {
        match decision {
            DeliveryDecision::FireAt { wait, .. } => wait.as_secs_f64(),
            DeliveryDecision::Skip(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    #[test]
    fn respiration_fires_target_delay_after_the_peak() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut scheduler = DeliveryScheduler::respiration(&SyncConfig::default(), sequence(2));

        let decision = scheduler.on_confirmed_peak(10.0, 10.05, &mut rng).unwrap();
        assert!((fire_wait(decision) - 0.15).abs() < 1e-6);
        assert_eq!(scheduler.sequence().cursor(), 1);
        assert_eq!(scheduler.delivered_peaks(), &[10.0]);
    }

    #[test]
    fn late_peaks_do_not_advance_the_cursor() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut scheduler = DeliveryScheduler::respiration(&SyncConfig::default(), sequence(1));

        let decision = scheduler.on_confirmed_peak(10.0, 10.5, &mut rng).unwrap();
        let DeliveryDecision::Skip(SkipReason::Late { late_by }) = decision else {
            panic!("expected a late skip, got {decision:?}");
        };
        assert!((late_by.as_secs_f64() - 0.3).abs() < 1e-6);
        assert_eq!(scheduler.sequence().cursor(), 0);

        let decision = scheduler.on_confirmed_peak(11.0, 11.25, &mut rng).unwrap();
        assert!(!decision.fires());

        assert!(scheduler.on_confirmed_peak(12.0, 12.0, &mut rng).unwrap().fires());
        assert!(scheduler.is_complete());
        assert_eq!(
            scheduler.on_confirmed_peak(13.0, 13.0, &mut rng).unwrap(),
            DeliveryDecision::Skip(SkipReason::Complete)
        );

        let summary = scheduler.summary();
        assert_eq!(summary.peaks, 4);
        assert_eq!(summary.fired, 1);
        assert_eq!(summary.skipped_late, 2);
        assert_eq!(summary.skipped_complete, 1);
    }

    #[test]
    fn cardiac_waits_for_a_full_rate_window() {
        let mut rng = SmallRng::seed_from_u64(3);
        let pool = DelayPool::from_intervals(&[1.0; 8], 10.0).unwrap();
        let mut scheduler =
            DeliveryScheduler::cardiac(&SyncConfig::default(), sequence(4), pool).unwrap();

        for beat in 0..9_u32 {
            let peak = f64::from(beat);
            let decision = scheduler.on_confirmed_peak(peak, peak, &mut rng).unwrap();
            assert!(matches!(
                decision,
                DeliveryDecision::Skip(SkipReason::Warmup { required: 10, .. })
            ));
        }

        let decision = scheduler.on_confirmed_peak(9.0, 9.0, &mut rng).unwrap();
        assert!((fire_wait(decision) - 0.2).abs() < 1e-6);
        assert_eq!(scheduler.target_time(), Some(10.0));
        assert_eq!(scheduler.remaining_delays(), 7);
    }

    #[test]
    fn cardiac_defers_when_the_next_beat_is_closer() {
        let mut rng = SmallRng::seed_from_u64(5);
        let pool = DelayPool::from_intervals(&[2.0; 6], 10.0).unwrap();
        let mut scheduler =
            DeliveryScheduler::cardiac(&SyncConfig::default(), sequence(3), pool).unwrap();

        // Warm up on a 1 s rhythm; the tenth beat fires and targets 11.0.
        for beat in 0..10_u32 {
            let peak = f64::from(beat);
            scheduler.on_confirmed_peak(peak, peak, &mut rng).unwrap();
        }
        assert_eq!(scheduler.target_time(), Some(11.0));

        let decision = scheduler.on_confirmed_peak(10.0, 10.0, &mut rng).unwrap();
        let DeliveryDecision::Skip(SkipReason::Lookahead { current, predicted }) = decision else {
            panic!("expected a lookahead skip, got {decision:?}");
        };
        assert!((current - 1.0).abs() < TOLERANCE);
        assert!(predicted.abs() < TOLERANCE);

        let decision = scheduler.on_confirmed_peak(11.0, 11.0, &mut rng).unwrap();
        assert!(decision.fires());
        // Observed interval 2.0 since the last delivery.
        assert_eq!(scheduler.target_time(), Some(13.0));
        assert_eq!(scheduler.delivered_peaks(), &[9.0, 11.0]);
    }

    #[test]
    fn cardiac_pool_must_cover_the_sequence() {
        let pool = DelayPool::from_intervals(&[1.0, 1.0], 10.0).unwrap();
        assert_eq!(
            DeliveryScheduler::cardiac(&SyncConfig::default(), sequence(3), pool).err(),
            Some(SchedulerError::PoolTooSmall {
                pool: 2,
                sequence: 3
            })
        );
    }

    #[test]
    fn fired_stimuli_follow_the_sequence() {
        let mut rng = SmallRng::seed_from_u64(9);
        let kinds = [StimulusKind::Deviant, StimulusKind::Target];
        let sequence = StimulusSequence::from_kinds(kinds, ToneSet::default()).unwrap();
        let mut scheduler = DeliveryScheduler::respiration(&SyncConfig::default(), sequence);

        let mut fired = heapless::Vec::<u8, 2>::new();
        for peak in [1.0, 5.0] {
            if let DeliveryDecision::FireAt { stimulus, .. } =
                scheduler.on_confirmed_peak(peak, peak, &mut rng).unwrap()
            {
                fired.push(stimulus.trigger).unwrap();
            }
        }
        assert_eq!(fired.as_slice(), &[12, 1]);
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut scheduler = DeliveryScheduler::respiration(&SyncConfig::default(), sequence(1));
        assert!(matches!(
            scheduler.on_confirmed_peak(f64::NAN, 1.0, &mut rng),
            Err(SchedulerError::NonFinite(_))
        ));
        assert!(scheduler.telemetry().is_empty());
    }

    #[test]
    fn far_future_wait_is_an_error_and_keeps_the_cursor() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut scheduler = DeliveryScheduler::respiration(&SyncConfig::default(), sequence(1));
        assert!(matches!(
            scheduler.on_confirmed_peak(1.0e20, 0.0, &mut rng),
            Err(SchedulerError::OutOfRange(_))
        ));
        assert_eq!(scheduler.sequence().cursor(), 0);
        assert!(scheduler.delivered_peaks().is_empty());
        assert!(scheduler.on_confirmed_peak(1.0, 1.0, &mut rng).unwrap().fires());
    }

    #[test]
    fn far_past_peak_is_late_by_the_longest_duration() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut scheduler = DeliveryScheduler::respiration(&SyncConfig::default(), sequence(1));
        assert_eq!(
            scheduler.on_confirmed_peak(0.0, 1.0e20, &mut rng).unwrap(),
            DeliveryDecision::Skip(SkipReason::Late {
                late_by: Duration::MAX
            })
        );
        assert_eq!(scheduler.sequence().cursor(), 0);
        assert_eq!(scheduler.summary().skipped_late, 1);
    }
}
