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

//! The sampler voice pool: pitch-shifting playback of cached samples with
//! linear interpolation, slice bounds, and a short release fade.

use std::sync::Arc;

use super::store::Sample;
use super::{TriggerMode, TriggerParams};
use crate::transport::MIN_BPM;

/// Hard cap on concurrently sounding sampler voices.
pub const MAX_SAMPLER_VOICES: usize = 128;
/// Release fade length in samples.
pub const DEFAULT_FADE_OUT: u32 = 256;
/// Playback rate floor.
pub const MIN_RATE: f64 = 1e-4;
/// Pattern step convention: 16 steps per beat.
pub const STEPS_PER_BEAT: f64 = 16.0;

/// One sounding sampler voice.
pub struct SamplerVoice {
    pub active: bool,
    pub releasing: bool,
    pub inst_id: Arc<str>,
    pub note: i32,
    pub mix_ch: usize,
    sample: Arc<Sample>,
    end: usize,
    pos: f64,
    rate: f64,
    gain_l: f32,
    gain_r: f32,
    fade_total: u32,
    fade_remaining: u32,
}

impl SamplerVoice {
    /// Builds a voice from a typed trigger payload and its resolved sample.
    pub fn from_trigger(
        params: &TriggerParams,
        inst_id: Arc<str>,
        sample: Arc<Sample>,
        engine_rate: f64,
        transport_bpm: f64,
    ) -> Self {
        let (start, end) = slice_bounds(params.start_norm, params.end_norm, sample.frames);
        let rate = derive_rate(params, end - start, sample.sample_rate, engine_rate, transport_bpm);

        let velocity = params.velocity.clamp(0.0, 1.0) as f32;
        let gain = params.gain.max(0.0) as f32;
        let pan = params.pan.clamp(-1.0, 1.0) as f32;
        let g = gain * velocity;

        Self {
            active: true,
            releasing: false,
            inst_id,
            note: params.note,
            mix_ch: params.mix_ch,
            sample,
            end,
            pos: start as f64,
            rate,
            gain_l: g * (1.0 - pan),
            gain_r: g * (1.0 + pan),
            fade_total: DEFAULT_FADE_OUT,
            fade_remaining: 0,
        }
    }

    /// Builds a voice for a program note-on: the whole sample, pitched from
    /// the chosen key to the requested note.
    pub fn for_program(
        inst_id: Arc<str>,
        note: i32,
        chosen_key: i32,
        mix_ch: usize,
        velocity: f32,
        sample: Arc<Sample>,
        engine_rate: f64,
    ) -> Self {
        let pitch_ratio = pitch_ratio(note, chosen_key);
        let rate = (pitch_ratio * sample.sample_rate as f64 / engine_rate.max(1.0)).max(MIN_RATE);
        let end = sample.frames;
        let velocity = velocity.clamp(0.0, 1.0);

        Self {
            active: true,
            releasing: false,
            inst_id,
            note,
            mix_ch,
            sample,
            end,
            pos: 0.0,
            rate,
            gain_l: velocity,
            gain_r: velocity,
            fade_total: DEFAULT_FADE_OUT,
            fade_remaining: 0,
        }
    }

    /// Begins the release fade.
    pub fn release(&mut self) {
        self.releasing = true;
        self.fade_total = DEFAULT_FADE_OUT;
        self.fade_remaining = self.fade_total;
    }

    /// Produces one stereo sample and advances the read position. Returns
    /// None once the voice deactivates (slice end or fade end). Mono sources
    /// duplicate left into right. The caller gates bus accumulation on
    /// mute/solo; position advances regardless.
    pub fn tick(&mut self) -> Option<(f32, f32)> {
        let ip = self.pos as usize;
        if ip >= self.end || ip + 1 >= self.sample.frames {
            self.active = false;
            return None;
        }

        let mut fade = 1.0f32;
        if self.releasing {
            if self.fade_remaining == 0 {
                self.active = false;
                return None;
            }
            fade = self.fade_remaining as f32 / self.fade_total.max(1) as f32;
            self.fade_remaining -= 1;
        }

        let frac = (self.pos - ip as f64) as f32;
        let left = &self.sample.channels[0];
        let l = left[ip] + (left[ip + 1] - left[ip]) * frac;
        let r = if self.sample.channel_count() > 1 {
            let right = &self.sample.channels[1];
            right[ip] + (right[ip + 1] - right[ip]) * frac
        } else {
            l
        };

        self.pos += self.rate;
        Some((l * self.gain_l * fade, r * self.gain_r * fade))
    }
}

/// Equal-temperament pitch ratio between two MIDI notes.
pub fn pitch_ratio(note: i32, root: i32) -> f64 {
    2.0_f64.powf((note - root) as f64 / 12.0)
}

/// Computes `[start, end)` source-frame bounds from normalized positions.
pub fn slice_bounds(start_norm: f64, end_norm: f64, frames: usize) -> (usize, usize) {
    let start_norm = start_norm.clamp(0.0, 1.0);
    let end_norm = end_norm.clamp(0.0, 1.0);
    let start = ((start_norm * frames as f64).floor() as usize).min(frames.saturating_sub(2));
    let end = ((end_norm * frames as f64).ceil() as usize).clamp(start + 1, frames.max(start + 1));
    (start, end)
}

/// Derives the playback rate (source frames per output frame) for a trigger,
/// combining the mode-specific rate with sample-rate conversion.
pub fn derive_rate(
    params: &TriggerParams,
    slice_len: usize,
    source_rate: u32,
    engine_rate: f64,
    transport_bpm: f64,
) -> f64 {
    let pitch = pitch_ratio(params.note, params.root_midi);

    let mut rate = pitch;
    if params.mode != TriggerMode::Vinyl {
        let mut duration_sec = params.duration_sec.unwrap_or(0.0);
        if duration_sec <= 0.0 {
            let pattern_beats = match params.pattern_steps {
                Some(steps) if steps > 0.0 => steps / STEPS_PER_BEAT,
                _ => params.pattern_beats.unwrap_or(0.0),
            };
            let bpm = params.bpm.unwrap_or(transport_bpm).max(MIN_BPM);
            if pattern_beats > 0.0 {
                duration_sec = (60.0 / bpm) * pattern_beats;
            }
        }
        if duration_sec > 0.0 {
            let base = slice_len as f64 / (duration_sec * engine_rate.max(1.0)).max(1.0);
            rate = match params.mode {
                TriggerMode::FitDurationVinyl => base * pitch,
                _ => base,
            };
        }
    }

    (rate * source_rate as f64 / engine_rate.max(1.0)).max(MIN_RATE)
}

/// The fixed-capacity sampler voice pool. Slots are reused in place; the
/// backing vector never grows past the cap, so rendering never reallocates.
pub struct SamplerPool {
    voices: Vec<SamplerVoice>,
}

impl SamplerPool {
    pub fn new() -> Self {
        Self {
            voices: Vec::with_capacity(MAX_SAMPLER_VOICES),
        }
    }

    /// First-inactive-slot allocation; silently drops the voice when full.
    pub fn allocate(&mut self, voice: SamplerVoice) {
        for slot in self.voices.iter_mut() {
            if !slot.active {
                *slot = voice;
                return;
            }
        }
        if self.voices.len() < MAX_SAMPLER_VOICES {
            self.voices.push(voice);
        }
    }

    /// Starts the release fade on all voices matching the key.
    pub fn release_matching(&mut self, inst_id: &str, mix_ch: usize, note: i32) {
        for voice in self.voices.iter_mut() {
            if voice.active
                && !voice.releasing
                && &*voice.inst_id == inst_id
                && voice.mix_ch == mix_ch
                && voice.note == note
            {
                voice.release();
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

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SamplerVoice> {
        self.voices.iter_mut()
    }
}

impl Default for SamplerPool {
    fn default() -> Self {
        Self::new()
    }
}
