//! Per-flow TCP reassembly.
//!
//! A [`StreamReassembler`] turns the segments of one flow, in whatever order
//! the capture delivered them, into two append-only byte streams. It emits
//! [`ReassemblyEvent`]s that the rule matcher and record builder consume.
//!
//! Out-of-order data waits in a bounded hold window. When the window
//! overflows or its oldest entry exceeds the hold timeout, the missing range
//! is recorded as a [`GapRecord`] and the flow is marked corrupted for good,
//! while delivery resumes at the first held byte.

mod buffer;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use buffer::DirectionStats;
use buffer::DirectionBuffer;

use crate::error::ReassemblyError;
use crate::flow::{Direction, Segment};
use crate::time::NANOS_PER_MILLI;

/// Lifecycle of a flow as seen by the reassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Open,
    Closing,
    Closed,
    /// A gap was declared. Sticky for the rest of the flow.
    Corrupted,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Open => "open",
            FlowState::Closing => "closing",
            FlowState::Closed => "closed",
            FlowState::Corrupted => "corrupted",
        }
    }
}

/// Why a flow stopped accepting segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Fin,
    Reset,
    IdleTimeout,
    CaptureEnd,
    Cancelled,
    SourceError,
}

/// A byte range declared lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRecord {
    pub direction: Direction,
    /// Stream offset of the first missing byte.
    pub offset: u64,
    pub length: u64,
    pub start_seq: u32,
    pub end_seq: u32,
}

/// Bounds on the out-of-order hold window of each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    pub max_held_bytes: usize,
    pub max_held_segments: usize,
    pub hold_timeout_ns: u64,
}

impl ReassemblyLimits {
    pub fn new(max_held_bytes: usize, max_held_segments: usize, hold_timeout_ms: u64) -> Self {
        Self {
            max_held_bytes,
            max_held_segments,
            hold_timeout_ns: hold_timeout_ms.saturating_mul(NANOS_PER_MILLI),
        }
    }
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self::new(1024 * 1024, 1024, 30_000)
    }
}

/// Output of the reassembler, in the order it must be consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReassemblyEvent {
    /// Contiguous bytes for one direction starting at `offset`.
    Data {
        direction: Direction,
        offset: u64,
        bytes: Bytes,
        timestamp_ns: u64,
    },
    Gap(GapRecord),
    /// The direction's FIN was seen and every byte before it delivered.
    Finished { direction: Direction },
    StateChanged { from: FlowState, to: FlowState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct StreamReassembler {
    limits: ReassemblyLimits,
    directions: [DirectionBuffer; 2],
    phase: Phase,
    corrupted: bool,
    close_reason: Option<CloseReason>,
    started_at_ns: Option<u64>,
    last_seen_ns: u64,
    gaps: Vec<GapRecord>,
}

impl StreamReassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            directions: [
                DirectionBuffer::new(Direction::ClientToServer),
                DirectionBuffer::new(Direction::ServerToClient),
            ],
            phase: Phase::Open,
            corrupted: false,
            close_reason: None,
            started_at_ns: None,
            last_seen_ns: 0,
            gaps: Vec::new(),
        }
    }

    pub fn state(&self) -> FlowState {
        if self.corrupted {
            return FlowState::Corrupted;
        }
        match self.phase {
            Phase::Open => FlowState::Open,
            Phase::Closing => FlowState::Closing,
            Phase::Closed => FlowState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn started_at_ns(&self) -> Option<u64> {
        self.started_at_ns
    }

    pub fn last_seen_ns(&self) -> u64 {
        self.last_seen_ns
    }

    pub fn stats(&self, direction: Direction) -> DirectionStats {
        self.directions[direction.index()].stats()
    }

    pub fn held_bytes(&self, direction: Direction) -> usize {
        self.directions[direction.index()].held_bytes()
    }

    pub fn gaps(&self) -> &[GapRecord] {
        &self.gaps
    }

    /// Feeds one segment. A closed flow rejects further segments; the caller
    /// decides whether the segment starts a new flow.
    pub fn on_segment(
        &mut self,
        segment: &Segment,
    ) -> Result<Vec<ReassemblyEvent>, ReassemblyError> {
        if self.phase == Phase::Closed {
            return Err(ReassemblyError::FlowClosed);
        }

        let before = self.state();
        let now = segment.timestamp_ns;
        self.started_at_ns.get_or_insert(now);
        self.last_seen_ns = self.last_seen_ns.max(now);

        let mut events = Vec::new();

        if segment.flags.rst {
            trace!(key = %segment.key, "Reset received");
            self.close_into(CloseReason::Reset, before, &mut events);
            return Ok(events);
        }

        let buffer = &mut self.directions[segment.direction.index()];
        let mut data_seq = segment.seq;
        if segment.flags.syn {
            buffer.on_syn(segment.seq, &mut events);
            data_seq = data_seq.wrapping_add(1);
        }
        buffer.on_data(data_seq, &segment.payload, now, &mut events);
        if segment.flags.fin {
            buffer.on_fin(data_seq.wrapping_add(segment.payload.len() as u32), &mut events);
        }
        if !segment.flags.syn {
            // The peer is past its handshake; a SYN for the other side is
            // not coming any more.
            self.directions[segment.direction.opposite().index()].settle(&mut events);
        }

        for buffer in self.directions.iter_mut() {
            if buffer.enforce_limits(&self.limits, now, &mut events) {
                debug!(key = %segment.key, "Hold window exceeded, gap declared");
            }
        }

        self.report_finished(&mut events);

        if self.directions.iter().all(DirectionBuffer::fin_seen) {
            if self.directions.iter().all(DirectionBuffer::is_finished) {
                self.phase = Phase::Closed;
                self.close_reason = Some(CloseReason::Fin);
            } else {
                self.phase = Phase::Closing;
            }
        }

        self.absorb_gaps(&events);
        self.push_transition(before, &mut events);
        Ok(events)
    }

    /// Closes the flow for an external reason. Held data is delivered past
    /// its gaps, and the gaps are recorded. Closing twice is a no-op.
    pub fn close(&mut self, reason: CloseReason) -> Vec<ReassemblyEvent> {
        let mut events = Vec::new();
        if self.phase == Phase::Closed {
            return events;
        }
        let before = self.state();
        self.close_into(reason, before, &mut events);
        events
    }

    fn close_into(
        &mut self,
        reason: CloseReason,
        before: FlowState,
        events: &mut Vec<ReassemblyEvent>,
    ) {
        for buffer in self.directions.iter_mut() {
            buffer.flush_remaining(events);
        }
        self.report_finished(events);
        self.phase = Phase::Closed;
        self.close_reason = Some(reason);
        self.absorb_gaps(events);
        self.push_transition(before, events);
    }

    fn report_finished(&mut self, events: &mut Vec<ReassemblyEvent>) {
        for direction in Direction::BOTH {
            if self.directions[direction.index()].take_finished() {
                events.push(ReassemblyEvent::Finished { direction });
            }
        }
    }

    fn absorb_gaps(&mut self, events: &[ReassemblyEvent]) {
        for event in events {
            if let ReassemblyEvent::Gap(gap) = event {
                self.gaps.push(gap.clone());
                self.corrupted = true;
            }
        }
    }

    fn push_transition(&self, before: FlowState, events: &mut Vec<ReassemblyEvent>) {
        let after = self.state();
        if after != before {
            events.push(ReassemblyEvent::StateChanged {
                from: before,
                to: after,
            });
        }
    }
}
