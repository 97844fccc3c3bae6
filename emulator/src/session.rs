//! Block runner.
//!
//! A [`Session`] owns the host clock, the synthetic stream and the console
//! output, and drives the core controllers through the five block types.
//! Every trigger, playback request and confirmed peak is written to an
//! optional transcript with millisecond offsets from session start.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use physio_sync_core::config::SyncConfig;
use physio_sync_core::delays::{DelayPool, block_duration};
use physio_sync_core::detector::PeakConfirmer;
use physio_sync_core::dispatch::{DispatchError, StimulusOutput, deliver};
use physio_sync_core::heartrate::RateMonitor;
use physio_sync_core::scheduler::{DeliveryDecision, DeliveryScheduler, SkipReason};
use physio_sync_core::sequence::{BlockKind, StimulusSequence};
use physio_sync_core::telemetry::DeliverySummary;
use physio_sync_core::wait::{HighPrecisionWait, MonotonicClock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::clock::HostClock;
use crate::output::ConsoleOutput;
use crate::peaks;
use crate::stream::{StreamProfile, SyntheticStream};

/// Pause between two scans of the stream buffer.
pub const DEFAULT_REFRESH: Duration = Duration::from_millis(10);
pub const DEFAULT_BASELINE: Duration = Duration::from_secs(60);
pub const DEFAULT_ISOCHRONOUS_DELAY: Duration = Duration::from_secs(1);

/// Minimum silence after the last pulse of a block, in sound durations.
const DRAIN_FACTOR: f64 = 1.1;

/// Uniform range of the intervals used when a block needs peaks that no
/// respiration block has produced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntervalRange {
    pub min: f64,
    pub max: f64,
}

impl Default for IntervalRange {
    fn default() -> Self {
        Self { min: 0.5, max: 1.5 }
    }
}

impl IntervalRange {
    fn validate(self) -> io::Result<()> {
        if self.min.is_finite() && self.max.is_finite() && self.min > 0.0 && self.min <= self.max {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interval range {}..{}", self.min, self.max),
            ))
        }
    }

    /// `count` peak times starting at zero, with uniformly drawn gaps.
    fn peaks<R: Rng>(self, count: usize, rng: &mut R) -> Vec<f64> {
        let mut peaks = Vec::with_capacity(count);
        let mut t = 0.0;
        for index in 0..count {
            if index > 0 {
                t += if self.min < self.max {
                    rng.gen_range(self.min..self.max)
                } else {
                    self.min
                };
            }
            peaks.push(t);
        }
        peaks
    }
}

/// Block, or chain of blocks, requested on the command line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BlockRequest {
    Baseline { duration: Duration },
    Isochronous { delay: Duration },
    Asynchronous { intervals: IntervalRange },
    SynchronousRespiration,
    SynchronousCardiac { intervals: IntervalRange },
    /// Respiration-locked block, then cardiac-locked and asynchronous blocks
    /// whose delays come from the respiration peaks.
    Full,
}

impl BlockRequest {
    pub const TAGS: [&'static str; 6] = [
        "baseline",
        "isochronous",
        "asynchronous",
        "synchronous-respiration",
        "synchronous-cardiac",
        "session",
    ];
}

#[derive(Debug, Default)]
struct BlockOutcome {
    delivered: usize,
    summary: Option<DeliverySummary>,
    peaks: Vec<f64>,
}

/// What one block did.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockReport {
    pub kind: BlockKind,
    pub elapsed: Duration,
    pub delivered: usize,
    /// Decision counters, for peak-locked blocks.
    pub summary: Option<DeliverySummary>,
    /// Peaks that received a stimulus, for peak-locked blocks.
    pub peaks: Vec<f64>,
}

impl fmt::Display for BlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} stimuli in {:.1} s",
            self.kind,
            self.delivered,
            self.elapsed.as_secs_f64()
        )?;
        if let Some(summary) = &self.summary {
            write!(f, " ({summary})")?;
        }
        Ok(())
    }
}

/// Knobs of the emulated hardware.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionOptions {
    pub seed: u64,
    pub refresh: Duration,
    pub profile: StreamProfile,
}

impl SessionOptions {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            refresh: DEFAULT_REFRESH,
            profile: StreamProfile::default(),
        }
    }
}

pub struct Session {
    config: SyncConfig,
    clock: HostClock,
    stream: SyntheticStream,
    rng: StdRng,
    output: ConsoleOutput,
    refresh: Duration,
}

impl Session {
    pub fn new(
        config: SyncConfig,
        clock: HostClock,
        output: ConsoleOutput,
        options: &SessionOptions,
    ) -> io::Result<Self> {
        config.validate().map_err(invalid_input)?;
        if options.refresh.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refresh interval must be positive",
            ));
        }
        if config.buffer_is_short() {
            warn!(
                buffer = ?config.buffer_duration,
                "buffer shorter than 2 s, peak confirmation may be unreliable"
            );
        }

        Ok(Self {
            stream: SyntheticStream::new(options.profile, config.buffer_duration, options.seed),
            rng: StdRng::seed_from_u64(options.seed.rotate_left(32)),
            refresh: options.refresh,
            config,
            clock,
            output,
        })
    }

    pub fn output(&self) -> &ConsoleOutput {
        &self.output
    }

    /// Runs `request` to completion and reports every block it ran.
    pub fn run(&mut self, request: BlockRequest) -> io::Result<Vec<BlockReport>> {
        let reports = match request {
            BlockRequest::Baseline { duration } => {
                vec![self.framed(BlockKind::Baseline, |session| session.baseline(duration))?]
            }
            BlockRequest::Isochronous { delay } => {
                vec![self.framed(BlockKind::Isochronous, |session| session.isochronous(delay))?]
            }
            BlockRequest::Asynchronous { intervals } => {
                let peaks = self.uniform_peaks(intervals)?;
                vec![self.framed(BlockKind::Asynchronous, |session| session.asynchronous(&peaks))?]
            }
            BlockRequest::SynchronousRespiration => {
                vec![self.framed(BlockKind::SynchronousRespiration, Self::synchronous_respiration)?]
            }
            BlockRequest::SynchronousCardiac { intervals } => {
                let peaks = self.uniform_peaks(intervals)?;
                vec![self.framed(BlockKind::SynchronousCardiac, |session| {
                    session.synchronous_cardiac(&peaks)
                })?]
            }
            BlockRequest::Full => {
                let respiration =
                    self.framed(BlockKind::SynchronousRespiration, Self::synchronous_respiration)?;
                let peaks = respiration.peaks.clone();
                let cardiac = self.framed(BlockKind::SynchronousCardiac, |session| {
                    session.synchronous_cardiac(&peaks)
                })?;
                let asynchronous =
                    self.framed(BlockKind::Asynchronous, |session| session.asynchronous(&peaks))?;
                vec![respiration, cardiac, asynchronous]
            }
        };

        for report in &reports {
            info!(block = %report.kind, "{report}");
        }
        Ok(reports)
    }

    fn framed<F>(&mut self, kind: BlockKind, body: F) -> io::Result<BlockReport>
    where
        F: FnOnce(&mut Self) -> io::Result<BlockOutcome>,
    {
        let (start, stop) = kind.frame_triggers();
        let started_at = self.clock.now();
        info!(block = %kind, "block started");
        self.output
            .note(TranscriptRole::Host, &format!("start {}", kind.tag()))?;
        self.output.pulse(start)?;

        let outcome = body(self)?;

        self.output.pulse(stop)?;
        self.output
            .note(TranscriptRole::Host, &format!("stop {}", kind.tag()))?;
        let elapsed = self.clock.now().saturating_sub(started_at);
        info!(block = %kind, ?elapsed, delivered = outcome.delivered, "block complete");

        Ok(BlockReport {
            kind,
            elapsed,
            delivered: outcome.delivered,
            summary: outcome.summary,
            peaks: outcome.peaks,
        })
    }

    fn baseline(&mut self, duration: Duration) -> io::Result<BlockOutcome> {
        if duration.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "baseline duration must be positive",
            ));
        }
        info!(?duration, "recording baseline");
        self.clock.sleep(duration);
        Ok(BlockOutcome::default())
    }

    /// Fixed inter-stimulus delay measured from cycle start; each sound is
    /// queued `target_delay` ahead of its pulse.
    fn isochronous(&mut self, delay: Duration) -> io::Result<BlockOutcome> {
        if delay <= self.config.target_delay {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "isochronous delay {delay:?} must exceed the target delay {:?}",
                    self.config.target_delay
                ),
            ));
        }

        let mut sequence = StimulusSequence::shuffled(&self.config, &mut self.rng)
            .map_err(invalid_input)?;
        let wait = HighPrecisionWait::new(self.clock.clone());
        let mut since_last = Duration::ZERO;
        let mut delivered = 0;

        while let Some(stimulus) = sequence.current() {
            let cycle_start = self.clock.now();
            let decision = DeliveryDecision::FireAt {
                wait: self.config.target_delay,
                stimulus,
            };
            deliver(&decision, &wait, &mut self.output).map_err(dispatch_failure)?;
            sequence.advance();
            delivered += 1;

            let remaining = (cycle_start + delay).saturating_sub(self.clock.now());
            since_last = if remaining.is_zero() {
                Duration::ZERO
            } else {
                wait.wait(remaining).map_err(invalid_input)?
            };
        }

        self.drain(&wait, since_last)?;
        Ok(BlockOutcome {
            delivered,
            ..BlockOutcome::default()
        })
    }

    /// Inter-stimulus delays bootstrapped from the intervals of `peaks`.
    fn asynchronous(&mut self, peaks: &[f64]) -> io::Result<BlockOutcome> {
        let pool = DelayPool::from_peaks(peaks, self.config.edge_percentile).map_err(invalid_input)?;
        let mut sequence = StimulusSequence::shuffled(&self.config, &mut self.rng)
            .map_err(invalid_input)?;
        let delays = pool
            .sample(sequence.len(), &mut self.rng)
            .map_err(invalid_input)?;
        info!(
            pool = pool.len(),
            expected = ?block_duration(&delays, self.config.target_delay, self.config.sound_duration),
            "asynchronous delays drawn"
        );

        let wait = HighPrecisionWait::new(self.clock.clone());
        let mut since_last = Duration::ZERO;
        let mut delivered = 0;
        for &delay in &delays {
            let Some(stimulus) = sequence.current() else {
                break;
            };
            let decision = DeliveryDecision::FireAt {
                wait: self.config.target_delay,
                stimulus,
            };
            deliver(&decision, &wait, &mut self.output).map_err(dispatch_failure)?;
            sequence.advance();
            delivered += 1;
            since_last = wait.wait_secs(delay).map_err(invalid_input)?;
        }

        self.drain(&wait, since_last)?;
        Ok(BlockOutcome {
            delivered,
            ..BlockOutcome::default()
        })
    }

    fn synchronous_respiration(&mut self) -> io::Result<BlockOutcome> {
        let sequence = StimulusSequence::shuffled(&self.config, &mut self.rng)
            .map_err(invalid_input)?;
        let scheduler = DeliveryScheduler::respiration(&self.config, sequence);
        self.synchronous(scheduler)
    }

    /// Cardiac-locked delivery with delays resampled from the intervals of
    /// `peaks`, one per stimulus.
    fn synchronous_cardiac(&mut self, peaks: &[f64]) -> io::Result<BlockOutcome> {
        let pool = DelayPool::from_peaks(peaks, self.config.edge_percentile)
            .and_then(|pool| pool.resample(self.config.sequence_len(), &mut self.rng))
            .map_err(invalid_input)?;
        let sequence = StimulusSequence::shuffled(&self.config, &mut self.rng)
            .map_err(invalid_input)?;
        let scheduler =
            DeliveryScheduler::cardiac(&self.config, sequence, pool).map_err(invalid_input)?;
        self.synchronous(scheduler)
    }

    /// Runs a peak-locked block until its sequence is exhausted.
    fn synchronous(&mut self, mut scheduler: DeliveryScheduler) -> io::Result<BlockOutcome> {
        let channel = scheduler.channel();
        let mut confirmer = PeakConfirmer::new(channel, &self.config).map_err(invalid_input)?;
        let wait = HighPrecisionWait::new(self.clock.clone());
        let sfreq = self.stream.sfreq();
        self.prefill()?;

        let mut monitor_ready = false;
        let mut last_pulse = self.clock.now();
        while !scheduler.is_complete() {
            let window = self.stream.window(channel, self.clock.secs());
            if window.is_empty() {
                self.clock.sleep(self.refresh);
                continue;
            }
            let raw = peaks::detect(channel, &window, &self.config, sfreq);
            let confirmed = confirmer.submit_scan(&raw).map_err(invalid_data)?;

            if let Some(peak) = confirmed {
                self.output
                    .note(TranscriptRole::Detector, &format!("{channel} {peak:.3}"))?;
                let decision = scheduler
                    .on_confirmed_peak(peak, self.clock.secs(), &mut self.rng)
                    .map_err(invalid_data)?;

                if !monitor_ready && scheduler.rate_monitor().is_some_and(RateMonitor::initialized) {
                    monitor_ready = true;
                    let bpm = scheduler.rate_monitor().and_then(|monitor| monitor.bpm().ok());
                    info!(?bpm, "heart-rate monitor initialized");
                }

                match &decision {
                    DeliveryDecision::Skip(reason @ SkipReason::Late { .. }) => {
                        warn!(%channel, peak, %reason, "skipping late peak");
                        self.output
                            .note(TranscriptRole::Host, &format!("skip {reason}"))?;
                    }
                    DeliveryDecision::Skip(reason) => {
                        debug!(%channel, peak, %reason, "peak skipped");
                    }
                    DeliveryDecision::FireAt { wait: after, stimulus } => {
                        debug!(%channel, peak, ?after, kind = %stimulus.kind, "stimulus scheduled");
                    }
                }

                if deliver(&decision, &wait, &mut self.output)
                    .map_err(dispatch_failure)?
                    .is_some()
                {
                    last_pulse = self.clock.now();
                }
            }

            self.clock.sleep(self.refresh);
        }

        let since_last = self.clock.now().saturating_sub(last_pulse);
        self.drain(&wait, since_last)?;

        let summary = scheduler.summary();
        Ok(BlockOutcome {
            delivered: scheduler.delivered_peaks().len(),
            summary: Some(summary),
            peaks: scheduler.delivered_peaks().to_vec(),
        })
    }

    /// Lets the stream buffer fill before the first scan.
    fn prefill(&mut self) -> io::Result<()> {
        let buffer = self.config.buffer_duration;
        info!(buffer = ?buffer, "prefilling stream buffer");
        self.output.note(
            TranscriptRole::Host,
            &format!("prefill {:.2} s", buffer.as_secs_f64()),
        )?;
        self.clock.sleep(buffer);
        Ok(())
    }

    /// Keeps the last sound from being cut by the stop trigger.
    fn drain(&self, wait: &HighPrecisionWait<HostClock>, since_last: Duration) -> io::Result<()> {
        let minimum = self.config.sound_duration.mul_f64(DRAIN_FACTOR);
        if since_last < minimum {
            wait.wait(minimum - since_last).map_err(invalid_input)?;
        }
        Ok(())
    }

    fn uniform_peaks(&mut self, intervals: IntervalRange) -> io::Result<Vec<f64>> {
        intervals.validate()?;
        Ok(intervals.peaks(self.config.sequence_len(), &mut self.rng))
    }
}

#[allow(clippy::needless_pass_by_value)]
fn invalid_input<E: fmt::Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

#[allow(clippy::needless_pass_by_value)]
fn invalid_data<E: fmt::Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

fn dispatch_failure(err: DispatchError<io::Error>) -> io::Error {
    match err {
        DispatchError::Output(err) => err,
        DispatchError::Wait(err) => invalid_input(err),
    }
}

/// Timestamped session log.
pub struct TranscriptLogger {
    writer: Option<Box<dyn Write>>,
}

impl TranscriptLogger {
    /// Truncates `path` (creating parent directories) and writes the header.
    pub fn create(path: &Path, header: &str) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Self::with_writer(Box::new(BufWriter::new(file)), header)
    }

    pub fn with_writer(writer: Box<dyn Write>, header: &str) -> io::Result<Self> {
        let mut logger = Self {
            writer: Some(writer),
        };
        logger.write_header(header)?;
        Ok(logger)
    }

    pub fn disabled() -> Self {
        Self { writer: None }
    }

    fn write_header(&mut self, header: &str) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writeln!(writer, "# {header}")?;
        writeln!(writer, "# Timestamps are milliseconds since session start")?;
        writeln!(writer)?;
        writer.flush()
    }

    pub fn append_line(
        &mut self,
        elapsed: Duration,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writeln!(
            writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        writer.flush()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptRole {
    Host,
    Trigger,
    Audio,
    Detector,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Trigger => "TRIG>",
            TranscriptRole::Audio => "PLAY>",
            TranscriptRole::Detector => "PEAK<",
        }
    }
}
