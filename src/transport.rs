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

//! Transport state shared between the audio callback, the control thread,
//! and the telemetry pump.
//!
//! Tempo and the playing/armed flags are atomics so the callback never takes
//! a lock to read them. The sample position is advanced by the audio thread
//! and repositioned by seek.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Minimum accepted tempo in beats per minute.
pub const MIN_BPM: f64 = 20.0;

/// The transport: tempo, sample position, and play state.
pub struct Transport {
    /// Tempo in BPM, stored as f64 bits.
    bpm_bits: AtomicU64,
    /// True once the preroll deadline has elapsed and events are dispatching.
    playing: AtomicBool,
    /// True between transport.play and the preroll deadline.
    armed: AtomicBool,
    /// Absolute engine position in samples.
    sample_pos: AtomicU64,
    /// Sample position at which an armed transport transitions to playing.
    play_start_sample_pos: AtomicU64,
}

impl Transport {
    pub fn new(bpm: f64) -> Self {
        Self {
            bpm_bits: AtomicU64::new(bpm.to_bits()),
            playing: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            sample_pos: AtomicU64::new(0),
            play_start_sample_pos: AtomicU64::new(0),
        }
    }

    pub fn bpm(&self) -> f64 {
        f64::from_bits(self.bpm_bits.load(Ordering::Relaxed))
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.bpm_bits
            .store(bpm.max(MIN_BPM).to_bits(), Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    pub fn sample_pos(&self) -> u64 {
        self.sample_pos.load(Ordering::Relaxed)
    }

    pub fn set_sample_pos(&self, pos: u64) {
        self.sample_pos.store(pos, Ordering::Relaxed);
    }

    pub fn advance(&self, samples: u64) {
        self.sample_pos.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn play_start_sample_pos(&self) -> u64 {
        self.play_start_sample_pos.load(Ordering::Relaxed)
    }

    /// Arms the transport: playback begins once the preroll deadline passes.
    pub fn arm(&self, preroll_samples: u64) {
        self.play_start_sample_pos
            .store(self.sample_pos() + preroll_samples, Ordering::Relaxed);
        self.playing.store(false, Ordering::Relaxed);
        self.armed.store(true, Ordering::Relaxed);
    }

    /// Called by the audio thread when the preroll deadline has elapsed.
    pub fn begin_playing(&self) {
        self.armed.store(false, Ordering::Relaxed);
        self.playing.store(true, Ordering::Relaxed);
    }

    /// Clears both armed and playing.
    pub fn stop(&self) {
        self.armed.store(false, Ordering::Relaxed);
        self.playing.store(false, Ordering::Relaxed);
    }

    /// Converts a sample position to beats at the current tempo.
    pub fn samples_to_ppq(&self, samples: u64, sample_rate: f64) -> f64 {
        let bps = self.bpm() / 60.0;
        (samples as f64 / sample_rate.max(1.0)) * bps
    }

    /// Converts beats to an absolute sample position at the current tempo.
    pub fn ppq_to_samples(&self, ppq: f64, sample_rate: f64) -> u64 {
        let bps = (self.bpm() / 60.0).max(1e-9);
        ((ppq / bps) * sample_rate.max(1.0)).round().max(0.0) as u64
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(120.0)
    }
}
