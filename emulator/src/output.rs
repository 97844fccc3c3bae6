use std::io::{self, Write};
use std::time::Duration;

use crossterm::style::Stylize;
use physio_sync_core::dispatch::StimulusOutput;
use physio_sync_core::sequence::Stimulus;
use physio_sync_core::wait::MonotonicClock;
use tracing::debug;

use crate::clock::HostClock;
use crate::session::{TranscriptLogger, TranscriptRole};

/// Trigger code emitted on the marker channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pulse {
    pub code: u8,
    /// Time since session start.
    pub at: Duration,
}

/// Stands in for the sound card and the trigger port.
///
/// Every playback request and trigger pulse is written to the transcript and,
/// when echo is enabled, mirrored on the terminal.
pub struct ConsoleOutput {
    clock: HostClock,
    transcript: TranscriptLogger,
    echo: bool,
    pulses: Vec<Pulse>,
    playbacks: usize,
}

impl ConsoleOutput {
    pub fn new(clock: HostClock, transcript: TranscriptLogger, echo: bool) -> Self {
        Self {
            clock,
            transcript,
            echo,
            pulses: Vec::new(),
            playbacks: 0,
        }
    }

    /// Appends a free-form line to the transcript.
    pub fn note(&mut self, role: TranscriptRole, line: &str) -> io::Result<()> {
        let elapsed = self.clock.now();
        self.transcript.append_line(elapsed, role, line)
    }

    pub fn pulses(&self) -> &[Pulse] {
        &self.pulses
    }

    pub fn playbacks(&self) -> usize {
        self.playbacks
    }

    fn echo_line(&self, tag: &str, line: &str, elapsed: Duration) -> io::Result<()> {
        if !self.echo {
            return Ok(());
        }
        let stdout = io::stdout();
        let mut writer = stdout.lock();
        let stamp = format!("[+{:>8.1} ms]", elapsed.as_secs_f64() * 1000.0);
        let tag = match tag {
            "TRIG" => tag.bold().magenta(),
            _ => tag.bold().cyan(),
        };
        writeln!(writer, "{} {tag} {line}", stamp.dark_grey())
    }
}

impl StimulusOutput for ConsoleOutput {
    type Error = io::Error;

    fn schedule_playback(&mut self, stimulus: &Stimulus, after: Duration) -> io::Result<()> {
        let elapsed = self.clock.now();
        let line = format!(
            "{} {} Hz #{} in {:.3} ms",
            stimulus.kind,
            stimulus.frequency,
            stimulus.index,
            after.as_secs_f64() * 1000.0
        );
        debug!(
            kind = %stimulus.kind,
            frequency = stimulus.frequency,
            index = stimulus.index,
            ?after,
            "queued playback"
        );
        self.playbacks += 1;
        self.transcript
            .append_line(elapsed, TranscriptRole::Audio, &line)?;
        self.echo_line("PLAY", &line, elapsed)
    }

    fn pulse(&mut self, code: u8) -> io::Result<()> {
        let at = self.clock.now();
        self.pulses.push(Pulse { code, at });
        let line = code.to_string();
        self.transcript
            .append_line(at, TranscriptRole::Trigger, &line)?;
        self.echo_line("TRIG", &line, at)
    }
}
