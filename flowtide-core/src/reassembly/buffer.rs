//! One direction of a TCP stream.
//!
//! Sequence numbers are translated to 64-bit stream offsets as soon as a
//! segment arrives, relative to the next expected offset, so everything past
//! this point is plain `u64` arithmetic and survives 32-bit wraparound.
//!
//! The origin (stream offset 0) is ISN + 1. Data seen before the SYN is kept
//! as pending until the origin is settled: by the SYN, by any non-SYN segment
//! from the peer, by the direction's FIN, by the hold limits or by close. A
//! settle without a SYN starts the stream at the lowest pending sequence.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{GapRecord, ReassemblyEvent, ReassemblyLimits};
use crate::flow::Direction;

/// Per-direction counters, persisted as part of the connection record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionStats {
    /// Segments carrying payload.
    pub segments: u64,
    /// Payload bytes delivered in order.
    pub bytes: u64,
    /// Segments (or prefixes) discarded as already delivered.
    pub retransmissions: u64,
    /// Segments that had to wait for an earlier gap to close.
    pub out_of_order: u64,
    /// Bytes declared lost.
    pub gap_bytes: u64,
}

#[derive(Debug)]
struct Held {
    data: Bytes,
    timestamp_ns: u64,
}

#[derive(Debug)]
pub(crate) struct DirectionBuffer {
    direction: Direction,
    /// Sequence number of stream offset 0.
    base_seq: Option<u32>,
    /// The origin came from data rather than a SYN.
    seeded_from_data: bool,
    /// Segments that arrived before the origin was known, by sequence.
    pending: Vec<(u32, Held)>,
    pending_bytes: usize,
    next_offset: u64,
    held: BTreeMap<u64, Held>,
    held_bytes: usize,
    fin_at: Option<u64>,
    finish_reported: bool,
    stats: DirectionStats,
}

impl DirectionBuffer {
    pub(crate) fn new(direction: Direction) -> Self {
        Self {
            direction,
            base_seq: None,
            seeded_from_data: false,
            pending: Vec::new(),
            pending_bytes: 0,
            next_offset: 0,
            held: BTreeMap::new(),
            held_bytes: 0,
            fin_at: None,
            finish_reported: false,
            stats: DirectionStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> DirectionStats {
        self.stats
    }

    pub(crate) fn held_bytes(&self) -> usize {
        self.held_bytes + self.pending_bytes
    }

    pub(crate) fn fin_seen(&self) -> bool {
        self.fin_at.is_some()
    }

    /// FIN seen and every byte before it delivered.
    pub(crate) fn is_finished(&self) -> bool {
        self.fin_at.is_some_and(|fin| self.next_offset >= fin)
    }

    /// Returns true exactly once, the first time the direction is finished.
    pub(crate) fn take_finished(&mut self) -> bool {
        if self.is_finished() && !self.finish_reported {
            self.finish_reported = true;
            true
        } else {
            false
        }
    }

    /// A SYN fixes the stream origin at ISN + 1 and places pending data
    /// behind it. An origin already seeded from data stays; the bytes the SYN
    /// shows to be missing in front of it are recorded as a gap.
    pub(crate) fn on_syn(&mut self, seq: u32, events: &mut Vec<ReassemblyEvent>) {
        let origin = seq.wrapping_add(1);
        match self.base_seq {
            None => {
                self.base_seq = Some(origin);
                self.replay_pending(events);
            }
            Some(base) if self.seeded_from_data => {
                self.seeded_from_data = false;
                let missing = base.wrapping_sub(origin) as i32;
                if missing > 0 {
                    let length = missing as u64;
                    self.stats.gap_bytes += length;
                    events.push(ReassemblyEvent::Gap(GapRecord {
                        direction: self.direction,
                        offset: 0,
                        length,
                        start_seq: origin,
                        end_seq: base,
                    }));
                }
            }
            Some(_) => {}
        }
    }

    /// Starts the stream at the lowest pending sequence. No-op once the
    /// origin is known or while nothing is pending.
    pub(crate) fn settle(&mut self, events: &mut Vec<ReassemblyEvent>) {
        if self.base_seq.is_some() {
            return;
        }
        let Some(&(first, _)) = self.pending.first() else {
            return;
        };
        let origin = self
            .pending
            .iter()
            .map(|(seq, _)| *seq)
            .min_by_key(|seq| seq.wrapping_sub(first) as i32)
            .unwrap_or(first);
        self.base_seq = Some(origin);
        self.seeded_from_data = true;
        self.replay_pending(events);
    }

    pub(crate) fn on_fin(&mut self, fin_seq: u32, events: &mut Vec<ReassemblyEvent>) {
        self.settle(events);
        self.base_seq.get_or_insert(fin_seq);
        let offset = self.offset_of(fin_seq).max(0) as u64;
        if self.fin_at.is_none() {
            self.fin_at = Some(offset);
        }
    }

    pub(crate) fn on_data(
        &mut self,
        seq: u32,
        payload: &Bytes,
        timestamp_ns: u64,
        events: &mut Vec<ReassemblyEvent>,
    ) {
        if payload.is_empty() {
            return;
        }
        self.stats.segments += 1;
        if self.base_seq.is_none() {
            self.pending_bytes += payload.len();
            self.pending.push((
                seq,
                Held {
                    data: payload.clone(),
                    timestamp_ns,
                },
            ));
            return;
        }
        self.place(seq, payload.clone(), timestamp_ns, events);
    }

    fn place(&mut self, seq: u32, payload: Bytes, timestamp_ns: u64, events: &mut Vec<ReassemblyEvent>) {
        let next = self.next_offset as i64;
        let offset = self.offset_of(seq);
        let end = offset + payload.len() as i64;

        if end <= next {
            self.stats.retransmissions += 1;
            return;
        }

        let (offset, data) = if offset < next {
            self.stats.retransmissions += 1;
            (self.next_offset, payload.slice((next - offset) as usize..))
        } else {
            (offset as u64, payload)
        };

        if offset == self.next_offset {
            self.deliver(data, timestamp_ns, events);
            self.drain_held(events);
        } else {
            self.hold(offset, data, timestamp_ns);
        }
    }

    /// Declares gaps lost while the hold window is over any bound.
    /// Returns whether a gap was skipped.
    pub(crate) fn enforce_limits(
        &mut self,
        limits: &ReassemblyLimits,
        now_ns: u64,
        events: &mut Vec<ReassemblyEvent>,
    ) -> bool {
        if self.pending_bytes > limits.max_held_bytes
            || self.pending.len() > limits.max_held_segments
            || self.oldest_held_age(now_ns) > limits.hold_timeout_ns
        {
            self.settle(events);
        }
        let mut skipped = false;
        while !self.held.is_empty()
            && (self.held_bytes > limits.max_held_bytes
                || self.held.len() > limits.max_held_segments
                || self.oldest_held_age(now_ns) > limits.hold_timeout_ns)
        {
            self.skip_gap(events);
            skipped = true;
        }
        skipped
    }

    /// Delivers everything still held, recording each gap crossed, plus any
    /// bytes announced by a FIN that never arrived.
    pub(crate) fn flush_remaining(&mut self, events: &mut Vec<ReassemblyEvent>) -> bool {
        self.settle(events);
        let mut skipped = false;
        while !self.held.is_empty() {
            self.skip_gap(events);
            skipped = true;
        }
        if let Some(fin) = self.fin_at {
            if fin > self.next_offset {
                self.record_gap(fin, events);
                self.next_offset = fin;
                skipped = true;
            }
        }
        skipped
    }

    fn offset_of(&self, seq: u32) -> i64 {
        let next_seq = self.seq_at(self.next_offset);
        self.next_offset as i64 + i64::from(seq.wrapping_sub(next_seq) as i32)
    }

    fn seq_at(&self, offset: u64) -> u32 {
        self.base_seq.unwrap_or(0).wrapping_add(offset as u32)
    }

    /// Places pending segments now that the origin is known, lowest
    /// sequence first.
    fn replay_pending(&mut self, events: &mut Vec<ReassemblyEvent>) {
        let Some(base) = self.base_seq else {
            return;
        };
        let mut segments = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        segments.sort_by_key(|(seq, _)| seq.wrapping_sub(base) as i32);
        for (seq, held) in segments {
            self.place(seq, held.data, held.timestamp_ns, events);
        }
    }

    fn deliver(&mut self, data: Bytes, timestamp_ns: u64, events: &mut Vec<ReassemblyEvent>) {
        let offset = self.next_offset;
        self.next_offset += data.len() as u64;
        self.stats.bytes += data.len() as u64;
        events.push(ReassemblyEvent::Data {
            direction: self.direction,
            offset,
            bytes: data,
            timestamp_ns,
        });
    }

    fn hold(&mut self, offset: u64, data: Bytes, timestamp_ns: u64) {
        self.stats.out_of_order += 1;
        match self.held.entry(offset) {
            Entry::Occupied(mut entry) => {
                if entry.get().data.len() >= data.len() {
                    self.stats.retransmissions += 1;
                    return;
                }
                self.held_bytes = self.held_bytes - entry.get().data.len() + data.len();
                entry.insert(Held { data, timestamp_ns });
            }
            Entry::Vacant(entry) => {
                self.held_bytes += data.len();
                entry.insert(Held { data, timestamp_ns });
            }
        }
    }

    fn drain_held(&mut self, events: &mut Vec<ReassemblyEvent>) {
        while let Some(entry) = self.held.first_entry() {
            if *entry.key() > self.next_offset {
                break;
            }
            let (offset, held) = entry.remove_entry();
            self.held_bytes -= held.data.len();

            let end = offset + held.data.len() as u64;
            if end <= self.next_offset {
                continue;
            }
            let skip = (self.next_offset - offset) as usize;
            self.deliver(held.data.slice(skip..), held.timestamp_ns, events);
        }
    }

    fn skip_gap(&mut self, events: &mut Vec<ReassemblyEvent>) {
        let Some(&resume_at) = self.held.keys().next() else {
            return;
        };
        self.record_gap(resume_at, events);
        self.next_offset = resume_at;
        self.drain_held(events);
    }

    fn record_gap(&mut self, resume_at: u64, events: &mut Vec<ReassemblyEvent>) {
        let length = resume_at - self.next_offset;
        self.stats.gap_bytes += length;
        events.push(ReassemblyEvent::Gap(GapRecord {
            direction: self.direction,
            offset: self.next_offset,
            length,
            start_seq: self.seq_at(self.next_offset),
            end_seq: self.seq_at(resume_at),
        }));
    }

    fn oldest_held_age(&self, now_ns: u64) -> u64 {
        self.held
            .values()
            .chain(self.pending.iter().map(|(_, held)| held))
            .map(|h| now_ns.saturating_sub(h.timestamp_ns))
            .max()
            .unwrap_or(0)
    }
}
