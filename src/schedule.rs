// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The timeline scheduler: a beat-sorted event vector with a monotone cursor.
//!
//! Pushes append and re-sort; the cursor only moves forward as blocks render,
//! and only seek rebinds it. Past events are never rewritten.

use std::sync::Arc;

use tracing::info;

use crate::sampler::TriggerParams;

/// What a scheduled event does when it fires.
#[derive(Clone, Debug)]
pub enum EventKind {
    NoteOn,
    NoteOff,
    ProgramOn,
    ProgramOff,
    /// Carries the full typed trigger payload, resolved by the router.
    SamplerTrigger(Arc<TriggerParams>),
}

/// One future event at a rational beat time.
#[derive(Clone, Debug)]
pub struct ScheduledEvent {
    pub at_ppq: f64,
    pub kind: EventKind,
    pub inst_id: Arc<str>,
    pub mix_ch: usize,
    pub note: i32,
    pub vel: f32,
    pub dur_ppq: f64,
}

/// An event annotated with its sample offset inside the current block.
#[derive(Clone, Debug)]
pub struct BlockEvent {
    pub offset: usize,
    pub event: ScheduledEvent,
}

/// The scheduler state. Guarded by its own mutex; the audio thread locks it
/// once per block to snapshot the events falling inside the block.
pub struct Timeline {
    events: Vec<ScheduledEvent>,
    cursor: usize,
    window_from: f64,
    window_to: f64,
    debug: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            cursor: 0,
            window_from: 0.0,
            window_to: 0.0,
            debug: false,
        }
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Appends events and re-sorts by beat time. The sort is stable, so
    /// events pushed at the same beat keep their insertion order. The cursor
    /// is not reset.
    pub fn push(&mut self, events: Vec<ScheduledEvent>) {
        let added = events.len();
        self.events.extend(events);
        self.events.sort_by(|a, b| a.at_ppq.total_cmp(&b.at_ppq));
        if self.debug {
            info!(
                added,
                total = self.events.len(),
                cursor = self.cursor,
                "schedule.push"
            );
        }
    }

    /// Empties the timeline and rewinds the cursor.
    pub fn clear(&mut self) {
        self.events.clear();
        self.cursor = 0;
        if self.debug {
            info!("schedule.clear");
        }
    }

    /// Restricts dispatch to `[from, to]` in beats. A window with
    /// `to <= from` disables filtering.
    pub fn set_window(&mut self, from: f64, to: f64) {
        self.window_from = from;
        self.window_to = to;
        if self.debug {
            info!(from, to, "schedule.setWindow");
        }
    }

    /// Rebinds the cursor to the first event at or after the given beat.
    pub fn seek(&mut self, ppq: f64) {
        self.cursor = self.events.partition_point(|e| e.at_ppq < ppq);
    }

    fn passes_window(&self, at_ppq: f64) -> bool {
        self.window_to <= self.window_from
            || (at_ppq >= self.window_from && at_ppq <= self.window_to)
    }

    /// Collects the events with `from_ppq <= beat < to_ppq` that pass the
    /// window filter into `out`, each with its clamped sample offset inside
    /// a block of `n` frames. Afterwards the cursor sits past every event
    /// with `beat < to_ppq`. The result is stable-sorted by offset.
    pub fn prepare_block(
        &mut self,
        from_ppq: f64,
        to_ppq: f64,
        sample_rate: f64,
        bpm: f64,
        n: usize,
        out: &mut Vec<BlockEvent>,
    ) {
        out.clear();
        if n == 0 {
            return;
        }

        let samples_per_beat = (60.0 / bpm.max(1e-9)) * sample_rate;
        let mut cursor = self.cursor;
        while cursor < self.events.len() {
            let event = &self.events[cursor];
            if event.at_ppq >= to_ppq {
                break;
            }

            if event.at_ppq >= from_ppq && self.passes_window(event.at_ppq) {
                let offset = ((event.at_ppq - from_ppq) * samples_per_beat).round();
                let offset = (offset.max(0.0) as usize).min(n - 1);
                out.push(BlockEvent {
                    offset,
                    event: event.clone(),
                });
            }

            cursor += 1;
        }
        self.cursor = cursor;

        out.sort_by_key(|be| be.offset);
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}
