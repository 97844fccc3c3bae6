//! Deterministic two-channel physiological stream.
//!
//! Samples live on a fixed grid (`k / sfreq`), so every scan of the same
//! sample reports a bit-identical timestamp. Breaths and beats are generated
//! lazily with a seeded RNG and a bounded jitter around their nominal period.

use std::f64::consts::TAU;
use std::time::Duration;

use physio_sync_core::detector::Channel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_SFREQ: f64 = 256.0;

/// Shape of the synthetic signals.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamProfile {
    pub sfreq: f64,
    pub breath_period: f64,
    pub breath_jitter: f64,
    /// Respiration amplitude, in arbitrary belt units.
    pub breath_amplitude: f64,
    pub beat_period: f64,
    pub beat_jitter: f64,
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self {
            sfreq: DEFAULT_SFREQ,
            breath_period: 4.0,
            breath_jitter: 0.4,
            breath_amplitude: 5_000.0,
            beat_period: 0.9,
            beat_jitter: 0.05,
        }
    }
}

/// Samples currently held in the stream buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Window {
    pub timestamps: Vec<f64>,
    pub samples: Vec<f64>,
}

impl Window {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
struct Events {
    times: Vec<f64>,
    period: f64,
    jitter: f64,
}

impl Events {
    fn new(first: f64, period: f64, jitter: f64) -> Self {
        Self {
            times: vec![first],
            period,
            jitter,
        }
    }

    fn extend_past<R: Rng>(&mut self, until: f64, rng: &mut R) {
        while self.times.last().is_some_and(|last| *last <= until) {
            let last = self.times[self.times.len() - 1];
            let jitter = if self.jitter > 0.0 {
                rng.gen_range(-self.jitter..=self.jitter)
            } else {
                0.0
            };
            self.times.push(last + self.period + jitter);
        }
    }

    /// Events immediately before and after `t`.
    fn around(&self, t: f64) -> (f64, f64) {
        let index = self.times.partition_point(|event| *event <= t);
        if index == 0 {
            let next = self.times[0];
            (next - self.period, next)
        } else if index == self.times.len() {
            let previous = self.times[index - 1];
            (previous, previous + self.period)
        } else {
            (self.times[index - 1], self.times[index])
        }
    }
}

/// Synthetic replacement for the acquisition stream.
#[derive(Debug)]
pub struct SyntheticStream {
    profile: StreamProfile,
    buffer_samples: u64,
    breaths: Events,
    beats: Events,
    rng: StdRng,
}

impl SyntheticStream {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(profile: StreamProfile, buffer: Duration, seed: u64) -> Self {
        let buffer_samples = (buffer.as_secs_f64() * profile.sfreq).round().max(1.0) as u64;
        Self {
            profile,
            buffer_samples,
            breaths: Events::new(1.0, profile.breath_period, profile.breath_jitter),
            beats: Events::new(0.5, profile.beat_period, profile.beat_jitter),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sfreq(&self) -> f64 {
        self.profile.sfreq
    }

    /// Buffered samples of `channel` up to stream time `now`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn window(&mut self, channel: Channel, now: f64) -> Window {
        if now < 0.0 {
            return Window::default();
        }

        let last = (now * self.profile.sfreq).floor() as u64;
        let first = (last + 1).saturating_sub(self.buffer_samples);
        let horizon = now + 2.0 * self.profile.breath_period;
        self.breaths.extend_past(horizon, &mut self.rng);
        self.beats.extend_past(horizon, &mut self.rng);

        let mut window = Window {
            timestamps: Vec::with_capacity((last - first + 1) as usize),
            samples: Vec::with_capacity((last - first + 1) as usize),
        };
        for index in first..=last {
            let t = index as f64 / self.profile.sfreq;
            window.timestamps.push(t);
            window.samples.push(self.sample(channel, t));
        }
        window
    }

    fn sample(&self, channel: Channel, t: f64) -> f64 {
        match channel {
            Channel::Respiration => {
                let (previous, next) = self.breaths.around(t);
                let phase = (t - previous) / (next - previous);
                self.profile.breath_amplitude * (TAU * phase).cos()
            }
            Channel::Cardiac => {
                let (previous, next) = self.beats.around(t);
                let nearest = if t - previous <= next - t { previous } else { next };
                let r_wave = (-((t - nearest) / 0.01).powi(2)).exp();
                let t_wave = 0.25 * (-((t - previous - 0.25) / 0.04).powi(2)).exp();
                r_wave + t_wave
            }
        }
    }

    /// Breath peaks generated so far, in seconds.
    pub fn breath_times(&self) -> &[f64] {
        &self.breaths.times
    }

    /// Heart beats generated so far, in seconds.
    pub fn beat_times(&self) -> &[f64] {
        &self.beats.times
    }
}
