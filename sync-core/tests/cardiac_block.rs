use core::cell::Cell;
use core::time::Duration;

use physio_sync_core::config::{SyncConfig, ToneSet};
use physio_sync_core::delays::DelayPool;
use physio_sync_core::detector::{Channel, PeakConfirmer};
use physio_sync_core::dispatch::{StimulusOutput, deliver};
use physio_sync_core::scheduler::{DeliveryDecision, DeliveryScheduler, SkipReason};
use physio_sync_core::sequence::{Stimulus, StimulusSequence};
use physio_sync_core::telemetry::DeliveryEventKind;
use physio_sync_core::wait::{HighPrecisionWait, MonotonicClock};
use rand::SeedableRng;
use rand::rngs::SmallRng;

const REFRESH: Duration = Duration::from_millis(20);
const BEAT_PERIOD: f64 = 1.0;

/// Simulated stream clock: sleeping advances time instantly.
struct SimClock {
    now: Cell<Duration>,
}

impl SimClock {
    fn secs(&self) -> f64 {
        self.now.get().as_secs_f64()
    }
}

impl MonotonicClock for SimClock {
    fn now(&self) -> Duration {
        let now = self.now.get() + Duration::from_micros(1);
        self.now.set(now);
        now
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

struct Pulses<'a> {
    clock: &'a SimClock,
    fired: Vec<(u8, f64)>,
    queued: usize,
}

impl StimulusOutput for Pulses<'_> {
    type Error = core::convert::Infallible;

    fn schedule_playback(&mut self, _stimulus: &Stimulus, _after: Duration) -> Result<(), Self::Error> {
        self.queued += 1;
        Ok(())
    }

    fn pulse(&mut self, code: u8) -> Result<(), Self::Error> {
        self.fired.push((code, self.clock.secs()));
        Ok(())
    }
}

/// Beats in the buffer window ending at `now`.
fn scan(now: f64, buffer: f64) -> Vec<f64> {
    (0_u32..)
        .map(|beat| 0.5 + f64::from(beat) * BEAT_PERIOD)
        .take_while(|beat| *beat <= now)
        .filter(|beat| *beat >= now - buffer)
        .collect()
}

#[test]
fn cardiac_block_delivers_every_stimulus_near_its_target() {
    let config = SyncConfig {
        n_target: 4,
        n_deviant: 1,
        ..SyncConfig::default()
    };
    config.validate().unwrap();

    let mut rng = SmallRng::seed_from_u64(11);
    let source = DelayPool::from_intervals(&[3.8, 3.9, 4.0, 4.1, 4.2, 4.3, 9.0], 10.0).unwrap();
    let pool = source.resample(config.sequence_len(), &mut rng).unwrap();
    let sequence = StimulusSequence::shuffled(&config, &mut rng).unwrap();
    let mut scheduler = DeliveryScheduler::cardiac(&config, sequence, pool).unwrap();
    let mut confirmer = PeakConfirmer::new(Channel::Cardiac, &config).unwrap();

    let clock = SimClock {
        now: Cell::new(Duration::ZERO),
    };
    let wait = HighPrecisionWait::new(&clock);
    let mut output = Pulses {
        clock: &clock,
        fired: Vec::new(),
        queued: 0,
    };

    let buffer = config.buffer_duration.as_secs_f64();
    let mut delivered = Vec::new();
    while !scheduler.is_complete() && clock.secs() < 120.0 {
        let now = clock.secs();
        if let Some(peak) = confirmer.submit_scan(&scan(now, buffer)).unwrap() {
            let decision = scheduler.on_confirmed_peak(peak, clock.secs(), &mut rng).unwrap();
            if let DeliveryDecision::Skip(reason) = decision {
                assert!(
                    !matches!(reason, SkipReason::Late { .. }),
                    "confirmation lagged: {reason}"
                );
            }
            if let Some(stimulus) = deliver(&decision, &wait, &mut output).unwrap() {
                delivered.push((stimulus, peak));
            }
        }
        clock.sleep(REFRESH);
    }

    assert!(scheduler.is_complete());
    assert_eq!(delivered.len(), 5);
    assert_eq!(output.queued, 5);
    assert_eq!(output.fired.len(), 5);

    let tones = ToneSet::default();
    for ((stimulus, peak), (code, pulsed_at)) in delivered.iter().zip(&output.fired) {
        assert_eq!(stimulus.kind.tone(&tones).trigger, *code);
        assert!((pulsed_at - (peak + 0.2)).abs() < 1e-3, "pulse drifted");
    }

    // Deliveries land on beats roughly one drawn delay apart.
    let peaks = scheduler.delivered_peaks();
    for pair in peaks.windows(2) {
        let gap = pair[1] - pair[0];
        assert!((3.0..=5.0).contains(&gap), "gap={gap}");
    }

    // Ten confirmed beats are needed before the first delivery.
    let summary = scheduler.summary();
    assert_eq!(summary.fired, 5);
    assert_eq!(summary.skipped_warmup, 9);
    assert!(summary.skipped_lookahead > 0);
    assert!(
        scheduler
            .telemetry()
            .oldest_first()
            .any(|record| record.event == DeliveryEventKind::RateMonitorReady)
    );
}

#[test]
fn respiration_block_collects_peaks_for_later_blocks() {
    let config = SyncConfig {
        n_target: 3,
        n_deviant: 0,
        ..SyncConfig::default()
    };
    let mut rng = SmallRng::seed_from_u64(3);
    let sequence = StimulusSequence::shuffled(&config, &mut rng).unwrap();
    let mut scheduler = DeliveryScheduler::respiration(&config, sequence);

    for (peak, now) in [(4.0, 4.1), (8.0, 8.3), (12.0, 12.05), (16.0, 16.1)] {
        scheduler.on_confirmed_peak(peak, now, &mut rng).unwrap();
    }

    // The late peak at 8.0 is neither delivered nor collected.
    assert_eq!(scheduler.delivered_peaks(), &[4.0, 12.0, 16.0]);
    let pool = DelayPool::from_peaks(scheduler.delivered_peaks(), 0.0).unwrap();
    assert_eq!(pool.as_slice(), &[8.0, 4.0]);
}
