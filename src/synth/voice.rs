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

//! The polyphonic tone-generator voice pool: ADSR envelope, phase-accumulator
//! oscillator, first-free-slot allocation.

use std::f64::consts::TAU;
use std::sync::Arc;

use super::instrument::{Instrument, Waveform};

/// Hard cap on concurrently sounding tone voices.
pub const MAX_TONE_VOICES: usize = 64;
/// The exponential release converges on this floor; below it the voice ends.
pub const ENV_FLOOR: f32 = 1e-4;
/// Fixed headroom scalar applied to every tone voice.
const HEADROOM: f32 = 0.2;

/// One sounding tone voice.
pub struct ToneVoice {
    pub active: bool,
    pub releasing: bool,
    pub inst_id: Arc<str>,
    pub mix_ch: usize,
    pub note: i32,
    pub velocity: f32,
    gain: f32,
    attack: f32,
    decay: f32,
    sustain: f32,
    release: f32,
    waveform: Waveform,
    fm: f32,
    age_samples: u64,
    env: f32,
    phase: f64,
    phase_inc: f64,
}

impl ToneVoice {
    fn new(
        inst_id: Arc<str>,
        instrument: &Instrument,
        mix_ch: usize,
        note: i32,
        velocity: f32,
        sample_rate: f64,
    ) -> Self {
        let hz = 440.0 * 2.0_f64.powf((note - 69) as f64 / 12.0);
        Self {
            active: true,
            releasing: false,
            inst_id,
            mix_ch,
            note,
            velocity: velocity.clamp(0.0, 1.0),
            gain: instrument.gain,
            attack: instrument.attack,
            decay: instrument.decay,
            sustain: instrument.sustain,
            release: instrument.release,
            waveform: instrument.waveform,
            fm: instrument.fm,
            age_samples: 0,
            env: 0.0,
            phase: 0.0,
            phase_inc: TAU * hz / sample_rate.max(1.0),
        }
    }

    /// Produces one mono sample and advances phase and age. Returns None once
    /// the release envelope crosses the floor and the voice deactivates. The
    /// caller gates bus accumulation on mute/solo; phase advances regardless.
    pub fn tick(&mut self, sample_rate: f64) -> Option<f32> {
        let attack_samples = (self.attack as f64 * sample_rate).round().max(1.0) as u64;
        let decay_samples = (self.decay as f64 * sample_rate).round().max(1.0) as u64;
        let release_samples = (self.release as f64 * sample_rate).round().max(1.0) as f32;

        if !self.releasing {
            self.env = if self.age_samples < attack_samples {
                self.age_samples as f32 / attack_samples as f32
            } else if self.age_samples < attack_samples + decay_samples {
                let t = (self.age_samples - attack_samples) as f32 / decay_samples as f32;
                1.0 - (1.0 - self.sustain) * t
            } else {
                self.sustain
            };
        } else {
            self.env *= (ENV_FLOOR.ln() / release_samples).exp();
            if self.env < ENV_FLOOR {
                self.active = false;
                return None;
            }
        }

        // Single-modulator FM: a 2x-ratio modulator bends the carrier phase.
        let phase = if self.fm > 0.0 {
            self.phase + self.fm as f64 * (2.0 * self.phase).sin()
        } else {
            self.phase
        };
        let normalized = (phase / TAU).rem_euclid(1.0);

        let signal = match self.waveform {
            Waveform::Sine => phase.sin() as f32,
            Waveform::Saw => (2.0 * normalized - 1.0) as f32,
            Waveform::Square => {
                if normalized < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Triangle => {
                let t = if normalized < 0.25 {
                    4.0 * normalized
                } else if normalized < 0.75 {
                    2.0 - 4.0 * normalized
                } else {
                    4.0 * normalized - 4.0
                };
                t as f32
            }
        };

        self.phase += self.phase_inc;
        if self.phase > TAU {
            self.phase -= TAU;
        }
        self.age_samples += 1;

        Some(signal * self.velocity * self.gain * self.env * HEADROOM)
    }
}

/// The fixed-capacity tone voice pool.
pub struct TonePool {
    voices: Vec<ToneVoice>,
}

impl TonePool {
    pub fn new() -> Self {
        Self {
            voices: Vec::with_capacity(MAX_TONE_VOICES),
        }
    }

    /// Starts a voice. A duplicate note-on for an already-active
    /// (instrument, channel, key) retriggers it in place: the release flag
    /// clears and the velocity updates, instead of stacking a second voice.
    pub fn start(
        &mut self,
        inst_id: &str,
        instrument: &Instrument,
        mix_ch: usize,
        note: i32,
        velocity: f32,
        sample_rate: f64,
    ) {
        for voice in self.voices.iter_mut() {
            if voice.active
                && &*voice.inst_id == inst_id
                && voice.mix_ch == mix_ch
                && voice.note == note
            {
                voice.releasing = false;
                voice.velocity = velocity.clamp(0.0, 1.0);
                return;
            }
        }

        let voice = ToneVoice::new(
            Arc::from(inst_id),
            instrument,
            mix_ch,
            note,
            velocity,
            sample_rate,
        );
        for slot in self.voices.iter_mut() {
            if !slot.active {
                *slot = voice;
                return;
            }
        }
        if self.voices.len() < MAX_TONE_VOICES {
            self.voices.push(voice);
        }
    }

    /// Marks matching voices releasing.
    pub fn release(&mut self, inst_id: &str, mix_ch: usize, note: i32) {
        for voice in self.voices.iter_mut() {
            if voice.active
                && &*voice.inst_id == inst_id
                && voice.mix_ch == mix_ch
                && voice.note == note
            {
                voice.releasing = true;
            }
        }
    }

    /// Deactivates every voice immediately.
    pub fn panic(&mut self) {
        for voice in self.voices.iter_mut() {
            voice.active = false;
        }
    }

    pub fn active_count(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ToneVoice> {
        self.voices.iter_mut()
    }
}

impl Default for TonePool {
    fn default() -> Self {
        Self::new()
    }
}
