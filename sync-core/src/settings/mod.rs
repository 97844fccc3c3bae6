#![allow(clippy::module_name_repetitions)]

//! Line-oriented settings text.
//!
//! ```text
//! # overnight session
//! buffer_duration = 4s
//! target_delay = 250ms
//! cardiac.height = 0.98
//! n_target = 40
//! tone.deviant = 1000
//! trigger.deviant.1000 = 11
//! ```
//!
//! Each non-blank line is `key = value`; `#` starts a comment. Durations take
//! an optional `ms` or `s` suffix and default to seconds. `tone.<kind>` picks
//! the frequency in Hz, and `trigger.<kind>.<Hz>` assigns a trigger code to
//! that kind at that frequency. Parsing only applies
//! values: callers run [`SyncConfig::validate`] on the result.

use core::fmt;
use core::time::Duration;

use winnow::ascii::{dec_uint, float, space0};
use winnow::combinator::{alt, eof, opt, preceded, separated_pair, terminated};
use winnow::error::{ContextError, ErrMode};
use winnow::prelude::*;
use winnow::token::{rest, take_while};

use crate::config::SyncConfig;
use crate::sequence::StimulusKind;

/// What went wrong on a settings line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SettingsErrorKind<'a> {
    /// The line is not of the form `key = value`.
    MissingAssignment,
    UnknownKey(&'a str),
    InvalidValue { key: &'a str, value: &'a str },
}

/// Settings error tagged with its 1-based line number.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SettingsError<'a> {
    pub line: usize,
    pub kind: SettingsErrorKind<'a>,
}

impl fmt::Display for SettingsError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: ", self.line)?;
        match self.kind {
            SettingsErrorKind::MissingAssignment => f.write_str("expected `key = value`"),
            SettingsErrorKind::UnknownKey(key) => write!(f, "unknown key `{key}`"),
            SettingsErrorKind::InvalidValue { key, value } => {
                write!(f, "invalid value `{value}` for `{key}`")
            }
        }
    }
}

/// Parses settings text on top of the default configuration.
///
/// # Errors
///
/// Returns the first [`SettingsError`] encountered.
pub fn parse(text: &str) -> Result<SyncConfig, SettingsError<'_>> {
    let mut config = SyncConfig::default();
    apply(text, &mut config)?;
    Ok(config)
}

/// Applies every assignment in `text` to `config` and returns how many were
/// applied. Later assignments override earlier ones.
///
/// # Errors
///
/// Returns the first [`SettingsError`] encountered; `config` keeps the
/// assignments applied before it.
pub fn apply<'a>(text: &'a str, config: &mut SyncConfig) -> Result<usize, SettingsError<'a>> {
    let mut applied = 0;
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }

        let mut input = content;
        let (key, value) = assignment.parse_next(&mut input).map_err(|_| SettingsError {
            line,
            kind: SettingsErrorKind::MissingAssignment,
        })?;
        let value = value.trim();
        assign(config, key, value).map_err(|kind| SettingsError { line, kind })?;
        applied += 1;
    }
    Ok(applied)
}

fn assign<'a>(
    config: &mut SyncConfig,
    key: &'a str,
    value: &'a str,
) -> Result<(), SettingsErrorKind<'a>> {
    let invalid = SettingsErrorKind::InvalidValue { key, value };
    match key {
        "buffer_duration" => config.buffer_duration = duration_value(value).ok_or(invalid)?,
        "target_delay" => config.target_delay = duration_value(value).ok_or(invalid)?,
        "sound_duration" => config.sound_duration = duration_value(value).ok_or(invalid)?,
        "respiration.distance" => {
            config.respiration.distance = duration_value(value).ok_or(invalid)?;
        }
        "respiration.prominence" => {
            config.respiration.threshold = complete(float::<_, f64, _>, value).ok_or(invalid)?;
        }
        "cardiac.distance" => config.cardiac.distance = duration_value(value).ok_or(invalid)?,
        "cardiac.height" => {
            config.cardiac.threshold = complete(float::<_, f64, _>, value).ok_or(invalid)?;
        }
        "n_target" => config.n_target = integer_value(value).ok_or(invalid)?,
        "n_deviant" => config.n_deviant = integer_value(value).ok_or(invalid)?,
        "edge_percentile" => {
            config.edge_percentile = complete(float::<_, f64, _>, value).ok_or(invalid)?;
        }
        "tone.target" => config.target_frequency = integer_value(value).ok_or(invalid)?,
        "tone.deviant" => config.deviant_frequency = integer_value(value).ok_or(invalid)?,
        other => {
            let (kind, frequency) =
                complete(trigger_key, other).ok_or(SettingsErrorKind::UnknownKey(key))?;
            let code = integer_value(value).ok_or(invalid)?;
            config
                .triggers
                .insert(kind, frequency, code)
                .map_err(|_| invalid)?;
        }
    }
    Ok(())
}

fn key<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.').parse_next(input)
}

/// `trigger.<kind>.<Hz>`
fn trigger_key(input: &mut &str) -> ModalResult<(StimulusKind, u32)> {
    let kind = alt((
        "target".value(StimulusKind::Target),
        "deviant".value(StimulusKind::Deviant),
    ));
    preceded("trigger.", separated_pair(kind, '.', dec_uint)).parse_next(input)
}

fn assignment<'s>(input: &mut &'s str) -> ModalResult<(&'s str, &'s str)> {
    separated_pair(key, (space0, '=', space0), rest).parse_next(input)
}

/// Seconds, with an optional `ms` or `s` suffix.
fn duration_secs(input: &mut &str) -> ModalResult<f64> {
    let value: f64 = float.parse_next(input)?;
    let unit = opt(alt(("ms", "s"))).parse_next(input)?;
    Ok(match unit {
        Some("ms") => value / 1000.0,
        _ => value,
    })
}

fn duration_value(text: &str) -> Option<Duration> {
    complete(duration_secs, text).and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn integer_value<T>(text: &str) -> Option<T>
where
    T: TryFrom<u64>,
{
    complete(dec_uint::<_, u64, _>, text).and_then(|value| T::try_from(value).ok())
}

/// Runs `parser` over the whole of `text`.
fn complete<'s, O, P>(parser: P, text: &'s str) -> Option<O>
where
    P: Parser<&'s str, O, ErrMode<ContextError>>,
{
    let mut input = text;
    terminated(parser, (space0, eof)).parse_next(&mut input).ok()
}
