//! Delivery telemetry shared by every target.
//!
//! The scheduler records each decision it takes (fire, skip and why, target
//! draws, monitor warm-up) into a fixed-capacity ring. Running counters
//! survive ring eviction so a block summary is always complete.

use core::{fmt, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::Timestamp;
use crate::detector::Channel;
use crate::sequence::StimulusKind;

/// Identifier assigned to each recorded event.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 128;

/// Discriminated delivery events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeliveryEventKind {
    PeakConfirmed(Channel),
    Fired(StimulusKind),
    SkippedLate,
    SkippedLookahead,
    SkippedWarmup,
    SkippedComplete,
    RateMonitorReady,
    TargetDrawn,
}

impl fmt::Display for DeliveryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryEventKind::PeakConfirmed(channel) => write!(f, "peak-confirmed {channel}"),
            DeliveryEventKind::Fired(kind) => write!(f, "fired {kind}"),
            DeliveryEventKind::SkippedLate => f.write_str("skipped-late"),
            DeliveryEventKind::SkippedLookahead => f.write_str("skipped-lookahead"),
            DeliveryEventKind::SkippedWarmup => f.write_str("skipped-warmup"),
            DeliveryEventKind::SkippedComplete => f.write_str("skipped-complete"),
            DeliveryEventKind::RateMonitorReady => f.write_str("rate-monitor-ready"),
            DeliveryEventKind::TargetDrawn => f.write_str("target-drawn"),
        }
    }
}

/// Payloads carried alongside delivery events.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DeliveryPayload {
    /// No additional metadata accompanies the event.
    None,
    /// Stimulus scheduled after `wait`.
    Fire { wait: Duration, trigger: u8, index: usize },
    /// The ideal firing instant had already passed by `late_by`.
    Late { late_by: Duration },
    /// Distances to the target time from the current and the predicted beat.
    Lookahead { current: f64, predicted: f64 },
    /// Next ideal firing time and the delay it was drawn from.
    Target { target_time: Timestamp, delay: f64 },
    /// Mean inter-beat interval at warm-up completion.
    Rate { mean_interval: f64 },
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DeliveryRecord {
    pub id: EventId,
    /// Peak timestamp that triggered the decision.
    pub timestamp: Timestamp,
    pub event: DeliveryEventKind,
    pub details: DeliveryPayload,
}

/// Counters kept for the lifetime of a recorder.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DeliverySummary {
    pub peaks: u32,
    pub fired: u32,
    pub skipped_late: u32,
    pub skipped_lookahead: u32,
    pub skipped_warmup: u32,
    pub skipped_complete: u32,
}

impl DeliverySummary {
    /// Total number of skipped decisions.
    #[must_use]
    pub const fn skipped(&self) -> u32 {
        self.skipped_late + self.skipped_lookahead + self.skipped_warmup + self.skipped_complete
    }

    fn count(&mut self, event: DeliveryEventKind) {
        let counter = match event {
            DeliveryEventKind::PeakConfirmed(_) => &mut self.peaks,
            DeliveryEventKind::Fired(_) => &mut self.fired,
            DeliveryEventKind::SkippedLate => &mut self.skipped_late,
            DeliveryEventKind::SkippedLookahead => &mut self.skipped_lookahead,
            DeliveryEventKind::SkippedWarmup => &mut self.skipped_warmup,
            DeliveryEventKind::SkippedComplete => &mut self.skipped_complete,
            DeliveryEventKind::RateMonitorReady | DeliveryEventKind::TargetDrawn => return,
        };
        *counter = counter.saturating_add(1);
    }
}

impl fmt::Display for DeliverySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "peaks={} fired={} skipped={} (late={} lookahead={} warmup={} complete={})",
            self.peaks,
            self.fired,
            self.skipped(),
            self.skipped_late,
            self.skipped_lookahead,
            self.skipped_warmup,
            self.skipped_complete,
        )
    }
}

/// Records delivery events into a fixed-size ring buffer.
#[derive(Clone, Debug)]
pub struct TelemetryRecorder<const CAPACITY: usize = TELEMETRY_RING_CAPACITY> {
    ring: HistoryBuf<DeliveryRecord, CAPACITY>,
    summary: DeliverySummary,
    next_event_id: EventId,
}

impl<const CAPACITY: usize> TelemetryRecorder<CAPACITY> {
    /// Creates a recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            summary: DeliverySummary {
                peaks: 0,
                fired: 0,
                skipped_late: 0,
                skipped_lookahead: 0,
                skipped_warmup: 0,
                skipped_complete: 0,
            },
            next_event_id: 0,
        }
    }

    /// Records an event with its payload and returns the assigned identifier.
    pub fn record(
        &mut self,
        event: DeliveryEventKind,
        details: DeliveryPayload,
        timestamp: Timestamp,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.summary.count(event);
        self.ring.write(DeliveryRecord {
            id,
            timestamp,
            event,
            details,
        });
        id
    }

    /// Returns an iterator over the retained records in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, DeliveryRecord> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent record, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&DeliveryRecord> {
        self.ring.recent()
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// `true` when no records are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Counters covering every event ever recorded.
    #[must_use]
    pub const fn summary(&self) -> DeliverySummary {
        self.summary
    }
}

impl<const CAPACITY: usize> Default for TelemetryRecorder<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}
