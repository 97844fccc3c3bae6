//! Stimulus identities, block kinds and the shuffled per-block sequence.

use core::fmt;

use heapless::Vec;
use rand::RngCore;
use rand::seq::SliceRandom;

use crate::config::{ConfigError, SyncConfig, Tone, ToneSet};

/// Longest stimulus sequence a block may carry.
pub const MAX_SEQUENCE_LEN: usize = 512;

/// Identity of an auditory stimulus.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StimulusKind {
    Target,
    Deviant,
}

impl StimulusKind {
    /// Tone played for this stimulus within a block.
    #[must_use]
    pub const fn tone(self, tones: &ToneSet) -> Tone {
        match self {
            StimulusKind::Target => tones.target,
            StimulusKind::Deviant => tones.deviant,
        }
    }
}

impl fmt::Display for StimulusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StimulusKind::Target => f.write_str("target"),
            StimulusKind::Deviant => f.write_str("deviant"),
        }
    }
}

/// A stimulus ready to be played, with the trigger code that marks it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Stimulus {
    pub kind: StimulusKind,
    pub trigger: u8,
    /// Tone frequency in Hz.
    pub frequency: u32,
    /// Position within the block's sequence.
    pub index: usize,
}

/// Experimental blocks, each framed by start/stop trigger codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlockKind {
    Baseline,
    Isochronous,
    Asynchronous,
    SynchronousRespiration,
    SynchronousCardiac,
}

impl BlockKind {
    pub const ALL: [BlockKind; 5] = [
        BlockKind::Baseline,
        BlockKind::Isochronous,
        BlockKind::Asynchronous,
        BlockKind::SynchronousRespiration,
        BlockKind::SynchronousCardiac,
    ];

    /// Command-line and transcript tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            BlockKind::Baseline => "baseline",
            BlockKind::Isochronous => "isochronous",
            BlockKind::Asynchronous => "asynchronous",
            BlockKind::SynchronousRespiration => "synchronous-respiration",
            BlockKind::SynchronousCardiac => "synchronous-cardiac",
        }
    }

    /// Looks up a block by its tag, ignoring ASCII case.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag().eq_ignore_ascii_case(tag))
    }

    /// Trigger codes marking the start and the end of the block.
    #[must_use]
    pub const fn frame_triggers(self) -> (u8, u8) {
        match self {
            BlockKind::Baseline => (100, 101),
            BlockKind::Isochronous => (110, 111),
            BlockKind::Asynchronous => (120, 121),
            BlockKind::SynchronousRespiration => (130, 131),
            BlockKind::SynchronousCardiac => (140, 141),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Pre-shuffled finite list of stimuli with a delivery cursor.
#[derive(Clone, Debug, PartialEq)]
pub struct StimulusSequence {
    kinds: Vec<StimulusKind, MAX_SEQUENCE_LEN>,
    tones: ToneSet,
    cursor: usize,
}

impl StimulusSequence {
    /// Builds and shuffles the block sequence described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnmappedTone`] when a tone has no trigger code,
    /// and [`ConfigError::EmptySequence`] or [`ConfigError::SequenceTooLong`]
    /// for unusable compositions.
    pub fn shuffled<R>(config: &SyncConfig, rng: &mut R) -> Result<Self, ConfigError>
    where
        R: RngCore + ?Sized,
    {
        let mut sequence = Self::ordered(config.n_target, config.n_deviant, config.tones()?)?;
        sequence.kinds.shuffle(rng);
        Ok(sequence)
    }

    /// Builds an unshuffled sequence: all targets, then all deviants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptySequence`] or
    /// [`ConfigError::SequenceTooLong`] for unusable compositions.
    pub fn ordered(
        n_target: usize,
        n_deviant: usize,
        tones: ToneSet,
    ) -> Result<Self, ConfigError> {
        Self::from_kinds(
            core::iter::repeat_n(StimulusKind::Target, n_target)
                .chain(core::iter::repeat_n(StimulusKind::Deviant, n_deviant)),
            tones,
        )
    }

    /// Builds a sequence from an explicit list of stimuli.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptySequence`] or
    /// [`ConfigError::SequenceTooLong`] for unusable compositions.
    pub fn from_kinds<I>(kinds: I, tones: ToneSet) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = StimulusKind>,
    {
        let mut stored = Vec::new();
        let mut requested = 0_usize;
        for kind in kinds {
            requested += 1;
            let _ = stored.push(kind);
        }

        if requested == 0 {
            return Err(ConfigError::EmptySequence);
        }
        if requested > MAX_SEQUENCE_LEN {
            return Err(ConfigError::SequenceTooLong {
                requested,
                max: MAX_SEQUENCE_LEN,
            });
        }

        Ok(Self {
            kinds: stored,
            tones,
            cursor: 0,
        })
    }

    /// Stimulus awaiting delivery, or `None` once the block is complete.
    #[must_use]
    pub fn current(&self) -> Option<Stimulus> {
        self.kinds.get(self.cursor).map(|&kind| {
            let tone = kind.tone(&self.tones);
            Stimulus {
                kind,
                trigger: tone.trigger,
                frequency: tone.frequency,
                index: self.cursor,
            }
        })
    }

    /// Moves to the next stimulus. Saturates at the end of the sequence.
    pub fn advance(&mut self) {
        if self.cursor < self.kinds.len() {
            self.cursor += 1;
        }
    }

    /// Index of the stimulus awaiting delivery.
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Total number of stimuli in the block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Always `false`: empty sequences are rejected at construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Stimuli not yet delivered.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.kinds.len() - self.cursor
    }

    /// `true` once every stimulus has been delivered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.kinds.len()
    }

    /// Every stimulus identity, in delivery order.
    #[must_use]
    pub fn kinds(&self) -> &[StimulusKind] {
        self.kinds.as_slice()
    }
}
