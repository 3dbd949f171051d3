//! Receiver-side sequence tracking over a bounded sliding window.
//!
//! The tracker remembers which sequence numbers arrived inside the window
//! `[highest_seen - W, highest_seen]`. Anything that falls below the window
//! without having arrived is finalized as lost, and stays lost: a straggler
//! showing up later is classified [`Classification::LostThenLate`] and is not
//! counted as received. That keeps the finalized loss count monotonic.
//!
//! Memory is bounded by the window size no matter how long the session runs.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of missing ranges remembered for the final report.
pub const MAX_MISSING_RANGES: usize = 32;

/// How an arriving sequence number relates to what was seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// Higher than anything seen so far
    New,
    /// Already received once
    Duplicate,
    /// Missing until now and still inside the window
    Reordered,
    /// Arrived after its slot was evicted and finalized as lost
    LostThenLate,
}

impl Classification {
    /// Whether the arrival counts towards `received_count`.
    pub fn is_counted(&self) -> bool {
        matches!(self, Classification::New | Classification::Reordered)
    }
}

/// A contiguous run of sequence numbers that never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRange {
    pub first: u64,
    pub last: u64,
}

impl MissingRange {
    /// Number of sequence numbers in the range.
    pub fn count(&self) -> u64 {
        self.last - self.first + 1
    }
}

/// Sliding-window record of received sequence numbers.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    window: u64,
    highest: Option<u64>,
    /// Lowest sequence still tracked; everything below is final.
    floor: u64,
    /// `slots[i]` is whether `floor + i` arrived. Covers `floor..=highest`.
    slots: VecDeque<bool>,
    /// Gaps still inside the window that may yet be filled.
    pending: u64,
    /// Gaps that left the window (or were closed by `finalize`).
    lost: u64,
    missing: Vec<MissingRange>,
    missing_truncated: u64,
    finalized: bool,
}

impl SequenceTracker {
    /// Creates a tracker with a reorder window of `window` sequence numbers.
    pub fn new(window: u64) -> Self {
        let window = window.max(1);
        Self {
            window,
            highest: None,
            floor: 0,
            slots: VecDeque::with_capacity(window as usize + 1),
            pending: 0,
            lost: 0,
            missing: Vec::new(),
            missing_truncated: 0,
            finalized: false,
        }
    }

    /// Classifies an arriving sequence number and records it.
    ///
    /// Advancing `highest_seen` may push unfilled slots out of the window; those
    /// are counted as lost at that moment.
    pub fn observe(&mut self, sequence: u64) -> Classification {
        match self.highest {
            Some(highest) if sequence <= highest => {
                if sequence < self.floor {
                    return Classification::LostThenLate;
                }
                let slot = &mut self.slots[(sequence - self.floor) as usize];
                if *slot {
                    Classification::Duplicate
                } else {
                    *slot = true;
                    self.pending -= 1;
                    Classification::Reordered
                }
            }
            _ => {
                self.advance(sequence);
                Classification::New
            }
        }
    }

    fn advance(&mut self, sequence: u64) {
        let next_unseen = self.highest.map_or(0, |h| h.saturating_add(1));
        let new_floor = sequence.saturating_sub(self.window);

        while self.floor < new_floor {
            match self.slots.pop_front() {
                Some(true) => self.floor += 1,
                Some(false) => {
                    self.pending -= 1;
                    self.finalize_gap(self.floor, self.floor);
                    self.floor += 1;
                }
                None => {
                    // Nothing tracked up here: the whole stretch up to the new
                    // floor was never seen.
                    self.finalize_gap(self.floor, new_floor - 1);
                    self.floor = new_floor;
                }
            }
        }

        let fill_from = next_unseen.max(self.floor);
        for _ in fill_from..sequence {
            self.slots.push_back(false);
            self.pending += 1;
        }
        self.slots.push_back(true);
        self.highest = Some(sequence);
    }

    fn finalize_gap(&mut self, first: u64, last: u64) {
        self.lost += last - first + 1;

        if let Some(prev) = self.missing.last_mut() {
            if prev.last.checked_add(1) == Some(first) {
                prev.last = last;
                return;
            }
        }
        if self.missing.len() < MAX_MISSING_RANGES {
            self.missing.push(MissingRange { first, last });
        } else {
            self.missing_truncated += 1;
        }
    }

    /// Closes the stream: every gap still in the window becomes lost, and so
    /// does the tail between the highest arrival and `sent_count`, when the
    /// sender's count is known.
    ///
    /// Calling it again is a no-op.
    pub fn finalize(&mut self, sent_count: Option<u64>) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        while let Some(received) = self.slots.pop_front() {
            if !received {
                self.pending -= 1;
                self.finalize_gap(self.floor, self.floor);
            }
            self.floor += 1;
        }

        let span = self.expected();
        if let Some(sent) = sent_count {
            if sent > span {
                self.finalize_gap(span, sent - 1);
                self.floor = sent;
            }
        }
    }

    /// Sequence numbers accounted for so far: `highest_seen + 1` (or the
    /// sender's count once finalized with a larger one).
    pub fn expected(&self) -> u64 {
        let span = self.highest.map_or(0, |h| h.saturating_add(1));
        span.max(self.floor)
    }

    /// Gaps finalized as lost.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Gaps still inside the window.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn highest_seen(&self) -> Option<u64> {
        self.highest
    }

    pub fn window_size(&self) -> u64 {
        self.window
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Recorded missing ranges, oldest first, plus how many more did not fit.
    pub fn missing_ranges(&self) -> (&[MissingRange], u64) {
        (&self.missing, self.missing_truncated)
    }
}
