//! Immutable configuration shared by every detection and scheduling component.
//!
//! A [`SyncConfig`] is built once per session (defaults, optionally overridden
//! by the [`settings`](crate::settings) grammar), validated, and then passed by
//! reference into each component constructor. Nothing in the crate reads
//! process-wide state.

use core::{fmt, time::Duration};

use heapless::Vec;

use crate::detector::{Channel, MAX_CANDIDATES};
use crate::sequence::{MAX_SEQUENCE_LEN, StimulusKind};

/// Default window length of the streamed buffer.
pub const DEFAULT_BUFFER_DURATION: Duration = Duration::from_secs(4);
/// Default offset between a physiological event and its stimulus.
pub const DEFAULT_TARGET_DELAY: Duration = Duration::from_millis(200);
/// Default stimulus length.
pub const DEFAULT_SOUND_DURATION: Duration = Duration::from_millis(200);
/// Default trimming band for delay pools, in percent on each side.
pub const DEFAULT_EDGE_PERCENTILE: f64 = 10.0;
/// Number of target stimuli in a default block.
pub const DEFAULT_N_TARGET: usize = 25;
/// Number of deviant stimuli in a default block.
pub const DEFAULT_N_DEVIANT: usize = 5;
/// Buffers shorter than this are accepted but are likely too short to vote on.
pub const RECOMMENDED_MIN_BUFFER: Duration = Duration::from_secs(2);

/// Raw peak detection and refractory parameters for one channel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    /// Minimum time between two confirmed peaks.
    pub distance: Duration,
    /// Respiration: minimum prominence in signal units.
    /// Cardiac: height threshold expressed as a percentile of the window, `0..=1`.
    pub threshold: f64,
}

impl ChannelConfig {
    pub const fn new(distance: Duration, threshold: f64) -> Self {
        Self {
            distance,
            threshold,
        }
    }

    /// Respiration defaults: 0.8 s refractory distance, prominence 20.
    #[must_use]
    pub const fn respiration() -> Self {
        Self::new(Duration::from_millis(800), 20.0)
    }

    /// Cardiac defaults: 0.3 s refractory distance, 99th percentile height.
    #[must_use]
    pub const fn cardiac() -> Self {
        Self::new(Duration::from_millis(300), 0.99)
    }
}

/// Default target tone, in Hz.
pub const DEFAULT_TARGET_FREQUENCY: u32 = 1000;
/// Default deviant tone, in Hz.
pub const DEFAULT_DEVIANT_FREQUENCY: u32 = 2000;
/// Rows a [`TriggerTable`] can hold.
pub const MAX_TRIGGER_ENTRIES: usize = 16;

/// Trigger code pulsed for one stimulus kind played at one frequency.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TriggerEntry {
    pub kind: StimulusKind,
    pub frequency: u32,
    pub code: u8,
}

/// Trigger codes keyed by stimulus kind and tone frequency.
///
/// The default table maps target 1000 Hz to 1, target 2000 Hz to 2,
/// deviant 1000 Hz to 11 and deviant 2000 Hz to 12.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TriggerTable {
    entries: Vec<TriggerEntry, MAX_TRIGGER_ENTRIES>,
}

impl TriggerTable {
    /// A table with no rows.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Code assigned to `kind` at `frequency`, if any.
    #[must_use]
    pub fn code(&self, kind: StimulusKind, frequency: u32) -> Option<u8> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind && entry.frequency == frequency)
            .map(|entry| entry.code)
    }

    /// Assigns `code` to `kind` at `frequency`, replacing an existing row.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::TriggerTableFull`] when a new row does not fit.
    pub fn insert(
        &mut self,
        kind: StimulusKind,
        frequency: u32,
        code: u8,
    ) -> Result<(), ConfigError> {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.kind == kind && entry.frequency == frequency)
        {
            entry.code = code;
            return Ok(());
        }
        self.entries
            .push(TriggerEntry {
                kind,
                frequency,
                code,
            })
            .map_err(|_| ConfigError::TriggerTableFull {
                max: MAX_TRIGGER_ENTRIES,
            })
    }

    #[must_use]
    pub fn entries(&self) -> &[TriggerEntry] {
        self.entries.as_slice()
    }
}

impl Default for TriggerTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for (kind, frequency, code) in [
            (StimulusKind::Target, 1000, 1),
            (StimulusKind::Target, 2000, 2),
            (StimulusKind::Deviant, 1000, 11),
            (StimulusKind::Deviant, 2000, 12),
        ] {
            let _ = table.entries.push(TriggerEntry {
                kind,
                frequency,
                code,
            });
        }
        table
    }
}

/// Tone played for a stimulus kind, with the code that marks it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tone {
    pub frequency: u32,
    pub trigger: u8,
}

/// Tones resolved for one block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ToneSet {
    pub target: Tone,
    pub deviant: Tone,
}

impl Default for ToneSet {
    fn default() -> Self {
        Self {
            target: Tone {
                frequency: DEFAULT_TARGET_FREQUENCY,
                trigger: 1,
            },
            deviant: Tone {
                frequency: DEFAULT_DEVIANT_FREQUENCY,
                trigger: 12,
            },
        }
    }
}

/// Session-wide configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    pub buffer_duration: Duration,
    pub respiration: ChannelConfig,
    pub cardiac: ChannelConfig,
    pub target_delay: Duration,
    pub sound_duration: Duration,
    pub n_target: usize,
    pub n_deviant: usize,
    pub edge_percentile: f64,
    /// Target tone frequency in Hz.
    pub target_frequency: u32,
    /// Deviant tone frequency in Hz.
    pub deviant_frequency: u32,
    pub triggers: TriggerTable,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            buffer_duration: DEFAULT_BUFFER_DURATION,
            respiration: ChannelConfig::respiration(),
            cardiac: ChannelConfig::cardiac(),
            target_delay: DEFAULT_TARGET_DELAY,
            sound_duration: DEFAULT_SOUND_DURATION,
            n_target: DEFAULT_N_TARGET,
            n_deviant: DEFAULT_N_DEVIANT,
            edge_percentile: DEFAULT_EDGE_PERCENTILE,
            target_frequency: DEFAULT_TARGET_FREQUENCY,
            deviant_frequency: DEFAULT_DEVIANT_FREQUENCY,
            triggers: TriggerTable::default(),
        }
    }
}

/// Reasons a configuration is rejected at construction time.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// A duration that must be strictly positive was zero.
    ZeroDuration(&'static str),
    /// A numeric parameter was NaN or infinite.
    NonFinite(&'static str),
    /// The respiration prominence must be strictly positive.
    NonPositiveProminence(f64),
    /// The cardiac height percentile must sit within `0..=1`.
    HeightOutOfRange(f64),
    /// The delay pool trimming band must sit within `0..50` percent.
    EdgePercentileOutOfRange(f64),
    /// A block needs at least one stimulus.
    EmptySequence,
    /// The stimulus sequence exceeds the static storage of the core.
    SequenceTooLong { requested: usize, max: usize },
    /// The buffer is shorter than one refractory distance.
    ZeroCapacity(Channel),
    /// The buffer would hold more plausible peaks than candidate storage allows.
    CapacityTooLarge {
        channel: Channel,
        capacity: usize,
        max: usize,
    },
    /// No trigger code is assigned to this kind at this frequency.
    UnmappedTone { kind: StimulusKind, frequency: u32 },
    /// The trigger table has no room for another row.
    TriggerTableFull { max: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroDuration(name) => write!(f, "{name} must be strictly positive"),
            ConfigError::NonFinite(name) => write!(f, "{name} must be finite"),
            ConfigError::NonPositiveProminence(value) => {
                write!(f, "respiration prominence must be positive (got {value})")
            }
            ConfigError::HeightOutOfRange(value) => {
                write!(f, "cardiac height must be between 0 and 1 (got {value})")
            }
            ConfigError::EdgePercentileOutOfRange(value) => {
                write!(f, "edge percentile must be within [0, 50) (got {value})")
            }
            ConfigError::EmptySequence => f.write_str("stimulus sequence is empty"),
            ConfigError::SequenceTooLong { requested, max } => {
                write!(f, "stimulus sequence of {requested} exceeds maximum {max}")
            }
            ConfigError::ZeroCapacity(channel) => write!(
                f,
                "{channel} buffer is shorter than the refractory distance"
            ),
            ConfigError::CapacityTooLarge {
                channel,
                capacity,
                max,
            } => write!(
                f,
                "{channel} buffer holds up to {capacity} peaks, more than the {max} supported"
            ),
            ConfigError::UnmappedTone { kind, frequency } => {
                write!(f, "no trigger code for {kind} tone at {frequency} Hz")
            }
            ConfigError::TriggerTableFull { max } => {
                write!(f, "trigger table holds at most {max} rows")
            }
        }
    }
}

impl SyncConfig {
    /// Returns the refractory/threshold parameters for `channel`.
    #[must_use]
    pub const fn channel(&self, channel: Channel) -> &ChannelConfig {
        match channel {
            Channel::Respiration => &self.respiration,
            Channel::Cardiac => &self.cardiac,
        }
    }

    /// Upper bound on simultaneous plausible candidates for `channel`.
    ///
    /// Computed as `floor(buffer_duration / distance)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn capacity_per_window(&self, channel: Channel) -> usize {
        let distance = self.channel(channel).distance.as_secs_f64();
        if distance <= 0.0 {
            return 0;
        }
        (self.buffer_duration.as_secs_f64() / distance) as usize
    }

    /// Total number of stimuli in one block.
    #[must_use]
    pub const fn sequence_len(&self) -> usize {
        self.n_target + self.n_deviant
    }

    /// Tone frequency configured for `kind`.
    #[must_use]
    pub const fn frequency(&self, kind: StimulusKind) -> u32 {
        match kind {
            StimulusKind::Target => self.target_frequency,
            StimulusKind::Deviant => self.deviant_frequency,
        }
    }

    /// Resolves the configured frequencies against the trigger table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnmappedTone`] when a frequency has no code.
    pub fn tones(&self) -> Result<ToneSet, ConfigError> {
        let tone = |kind| {
            let frequency = self.frequency(kind);
            self.triggers
                .code(kind, frequency)
                .map(|trigger| Tone { frequency, trigger })
                .ok_or(ConfigError::UnmappedTone { kind, frequency })
        };
        Ok(ToneSet {
            target: tone(StimulusKind::Target)?,
            deviant: tone(StimulusKind::Deviant)?,
        })
    }

    /// Returns `true` when the buffer is shorter than the recommended minimum.
    #[must_use]
    pub fn buffer_is_short(&self) -> bool {
        self.buffer_duration < RECOMMENDED_MIN_BUFFER
    }

    /// Checks every invariant the components rely on.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] encountered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("buffer duration", self.buffer_duration),
            ("respiration distance", self.respiration.distance),
            ("cardiac distance", self.cardiac.distance),
            ("target delay", self.target_delay),
            ("sound duration", self.sound_duration),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if !self.respiration.threshold.is_finite() {
            return Err(ConfigError::NonFinite("respiration prominence"));
        }
        if self.respiration.threshold <= 0.0 {
            return Err(ConfigError::NonPositiveProminence(
                self.respiration.threshold,
            ));
        }
        if !(0.0..=1.0).contains(&self.cardiac.threshold) {
            return Err(ConfigError::HeightOutOfRange(self.cardiac.threshold));
        }
        if !(0.0..50.0).contains(&self.edge_percentile) {
            return Err(ConfigError::EdgePercentileOutOfRange(self.edge_percentile));
        }

        let requested = self.sequence_len();
        if requested == 0 {
            return Err(ConfigError::EmptySequence);
        }
        if requested > MAX_SEQUENCE_LEN {
            return Err(ConfigError::SequenceTooLong {
                requested,
                max: MAX_SEQUENCE_LEN,
            });
        }

        for channel in [Channel::Respiration, Channel::Cardiac] {
            let capacity = self.capacity_per_window(channel);
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity(channel));
            }
            if capacity > MAX_CANDIDATES {
                return Err(ConfigError::CapacityTooLarge {
                    channel,
                    capacity,
                    max: MAX_CANDIDATES,
                });
            }
        }

        self.tones()?;
        Ok(())
    }
}
