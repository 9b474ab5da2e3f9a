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

//! Insert effects for channel strips and the master bus.
//!
//! Every unit keeps its own DSP state across blocks. Bypass skips processing
//! entirely, passing the dry signal through sample-accurately.

use std::f32::consts::TAU;

use serde::Deserialize;

/// Longest supported delay tap in seconds; ring buffers are sized for this.
const MAX_DELAY_SECONDS: f32 = 1.5;
/// Modulated-delay buffer length for chorus/flanger.
const MAX_MOD_DELAY_SECONDS: f32 = 0.1;

/// The merged parameter set for any effect type, as carried by the wire.
/// Absent fields leave the unit's current value untouched.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FxParams {
    // Reverb
    pub room_size: Option<f64>,
    pub damping: Option<f64>,
    pub width: Option<f64>,
    // Shared wet/dry
    #[serde(alias = "wet")]
    pub mix: Option<f64>,
    // Delay
    pub time: Option<f64>,
    pub time_sync: Option<String>,
    pub feedback: Option<f64>,
    pub damp: Option<f64>,
    // Chorus / flanger
    pub rate: Option<f64>,
    pub depth: Option<f64>,
    pub base: Option<f64>,
    // Compressor
    pub threshold: Option<f64>,
    pub ratio: Option<f64>,
    pub attack: Option<f64>,
    pub release: Option<f64>,
    pub makeup: Option<f64>,
}

/// One unit in an effect chain.
pub struct FxUnit {
    pub id: String,
    pub type_tag: String,
    pub enabled: bool,
    pub bypass: bool,
    kind: Option<FxKind>,
}

enum FxKind {
    Reverb(Reverb),
    Delay(Delay),
    Chorus(Chorus),
    Compressor(Compressor),
}

impl FxUnit {
    /// Builds a unit from its wire type tag. Matching is by substring, so
    /// "stereo-delay" still gets a delay. Unrecognized tags become inert
    /// pass-through units.
    pub fn new(id: &str, type_tag: &str, sample_rate: f64) -> Self {
        let lower = type_tag.to_lowercase();
        let kind = if lower.contains("reverb") {
            Some(FxKind::Reverb(Reverb::new(sample_rate)))
        } else if lower.contains("delay") || lower.contains("echo") {
            Some(FxKind::Delay(Delay::new(sample_rate)))
        } else if lower.contains("flanger") {
            Some(FxKind::Chorus(Chorus::flanger(sample_rate)))
        } else if lower.contains("chorus") {
            Some(FxKind::Chorus(Chorus::chorus(sample_rate)))
        } else if lower.contains("comp") {
            Some(FxKind::Compressor(Compressor::new(sample_rate)))
        } else {
            None
        };

        Self {
            id: id.to_string(),
            type_tag: type_tag.to_string(),
            enabled: true,
            bypass: false,
            kind,
        }
    }

    /// Applies a parameter update. `bpm` resolves tempo-synced delay times.
    pub fn apply_params(&mut self, params: &FxParams, bpm: f64) {
        match &mut self.kind {
            Some(FxKind::Reverb(fx)) => fx.apply(params),
            Some(FxKind::Delay(fx)) => fx.apply(params, bpm),
            Some(FxKind::Chorus(fx)) => fx.apply(params),
            Some(FxKind::Compressor(fx)) => fx.apply(params),
            None => {}
        }
    }

    /// Rebuilds rate-dependent state after a device sample-rate change.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        match &mut self.kind {
            Some(FxKind::Reverb(fx)) => *fx = Reverb::rebuilt(fx, sample_rate),
            Some(FxKind::Delay(fx)) => fx.set_sample_rate(sample_rate),
            Some(FxKind::Chorus(fx)) => fx.set_sample_rate(sample_rate),
            Some(FxKind::Compressor(fx)) => fx.set_sample_rate(sample_rate),
            None => {}
        }
    }

    #[inline]
    pub fn process(&mut self, l: &mut f32, r: &mut f32) {
        if !self.enabled || self.bypass {
            return;
        }
        match &mut self.kind {
            Some(FxKind::Reverb(fx)) => fx.process(l, r),
            Some(FxKind::Delay(fx)) => fx.process(l, r),
            Some(FxKind::Chorus(fx)) => fx.process(l, r),
            Some(FxKind::Compressor(fx)) => fx.process(l, r),
            None => {}
        }
    }
}

impl std::fmt::Debug for FxUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FxUnit")
            .field("id", &self.id)
            .field("type", &self.type_tag)
            .field("enabled", &self.enabled)
            .field("bypass", &self.bypass)
            .finish()
    }
}

/// Finds a unit by id in a chain.
pub fn find_unit<'a>(chain: &'a mut [FxUnit], id: &str) -> Option<&'a mut FxUnit> {
    chain.iter_mut().find(|unit| unit.id == id)
}

// ---------------------------------------------------------------------------
// Reverb
// ---------------------------------------------------------------------------

/// A feedback comb filter with a one-pole lowpass in the loop.
struct Comb {
    buf: Vec<f32>,
    idx: usize,
    feedback: f32,
    damp: f32,
    filter: f32,
}

impl Comb {
    fn new(delay_samples: usize) -> Self {
        Self {
            buf: vec![0.0; delay_samples.max(1)],
            idx: 0,
            feedback: 0.84,
            damp: 0.2,
            filter: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let out = self.buf[self.idx];
        self.filter = out * (1.0 - self.damp) + self.filter * self.damp;
        self.buf[self.idx] = input + self.filter * self.feedback;
        self.idx += 1;
        if self.idx >= self.buf.len() {
            self.idx = 0;
        }
        out
    }
}

/// A Schroeder allpass section.
struct Allpass {
    buf: Vec<f32>,
    idx: usize,
}

impl Allpass {
    const GAIN: f32 = 0.5;

    fn new(delay_samples: usize) -> Self {
        Self {
            buf: vec![0.0; delay_samples.max(1)],
            idx: 0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.buf[self.idx];
        self.buf[self.idx] = input + delayed * Self::GAIN;
        self.idx += 1;
        if self.idx >= self.buf.len() {
            self.idx = 0;
        }
        delayed - input * Self::GAIN
    }
}

/// Schroeder reverb: four parallel damped combs into two series allpasses
/// per side, the right side offset for stereo spread. Dry is always unity;
/// `mix` scales the wet return.
pub struct Reverb {
    combs_l: Vec<Comb>,
    combs_r: Vec<Comb>,
    allpass_l: Vec<Allpass>,
    allpass_r: Vec<Allpass>,
    room_size: f32,
    damping: f32,
    mix: f32,
    width: f32,
}

impl Reverb {
    // Comb and allpass delays in seconds, per basicsynth.
    const COMB_SECONDS: [f32; 4] = [0.0297, 0.0371, 0.0411, 0.0437];
    const ALLPASS_SECONDS: [f32; 2] = [0.005, 0.0017];
    const STEREO_SPREAD: usize = 23;

    fn new(sample_rate: f64) -> Self {
        let sr = sample_rate.max(22050.0) as f32;
        let mut reverb = Self {
            combs_l: Self::COMB_SECONDS
                .iter()
                .map(|s| Comb::new((s * sr) as usize))
                .collect(),
            combs_r: Self::COMB_SECONDS
                .iter()
                .map(|s| Comb::new((s * sr) as usize + Self::STEREO_SPREAD))
                .collect(),
            allpass_l: Self::ALLPASS_SECONDS
                .iter()
                .map(|s| Allpass::new((s * sr) as usize))
                .collect(),
            allpass_r: Self::ALLPASS_SECONDS
                .iter()
                .map(|s| Allpass::new((s * sr) as usize + Self::STEREO_SPREAD))
                .collect(),
            room_size: 0.35,
            damping: 0.45,
            mix: 0.25,
            width: 1.0,
        };
        reverb.refresh();
        reverb
    }

    /// Fresh delay lines at the new rate, same parameters.
    fn rebuilt(old: &Reverb, sample_rate: f64) -> Self {
        let mut reverb = Self::new(sample_rate);
        reverb.room_size = old.room_size;
        reverb.damping = old.damping;
        reverb.mix = old.mix;
        reverb.width = old.width;
        reverb.refresh();
        reverb
    }

    fn apply(&mut self, params: &FxParams) {
        if let Some(v) = params.room_size {
            self.room_size = v.clamp(0.0, 1.0) as f32;
        }
        if let Some(v) = params.damping {
            self.damping = v.clamp(0.0, 1.0) as f32;
        }
        if let Some(v) = params.mix {
            self.mix = v.clamp(0.0, 1.0) as f32;
        }
        if let Some(v) = params.width {
            self.width = v.clamp(0.0, 1.0) as f32;
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        let feedback = 0.7 + self.room_size * 0.28;
        let damp = self.damping * 0.4;
        for comb in self.combs_l.iter_mut().chain(self.combs_r.iter_mut()) {
            comb.feedback = feedback;
            comb.damp = damp;
        }
    }

    #[inline]
    fn process(&mut self, l: &mut f32, r: &mut f32) {
        let in_l = *l;
        let in_r = *r;

        let mut wet_l = 0.0;
        for comb in self.combs_l.iter_mut() {
            wet_l += comb.process(in_l);
        }
        for allpass in self.allpass_l.iter_mut() {
            wet_l = allpass.process(wet_l);
        }

        let mut wet_r = 0.0;
        for comb in self.combs_r.iter_mut() {
            wet_r += comb.process(in_r);
        }
        for allpass in self.allpass_r.iter_mut() {
            wet_r = allpass.process(wet_r);
        }

        // Width crossfeeds the wet returns: 1.0 keeps the sides independent,
        // 0.0 collapses them to the same signal.
        let wet1 = 0.5 + self.width * 0.5;
        let wet2 = 0.5 - self.width * 0.5;
        *l = in_l + (wet_l * wet1 + wet_r * wet2) * self.mix;
        *r = in_r + (wet_r * wet1 + wet_l * wet2) * self.mix;
    }
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Tempo-syncable stereo delay with damped feedback. The ring buffers cover
/// the full 1.5 s range regardless of the current tap position.
pub struct Delay {
    buf_l: Vec<f32>,
    buf_r: Vec<f32>,
    idx: usize,
    sample_rate: f32,
    time_seconds: f32,
    time_samples: usize,
    feedback: f32,
    mix: f32,
    damp_alpha: f32,
    lp_l: f32,
    lp_r: f32,
}

impl Delay {
    fn new(sample_rate: f64) -> Self {
        let sr = sample_rate.max(22050.0) as f32;
        let capacity = (MAX_DELAY_SECONDS * sr) as usize + 1;
        let mut delay = Self {
            buf_l: vec![0.0; capacity],
            buf_r: vec![0.0; capacity],
            idx: 0,
            sample_rate: sr,
            time_seconds: 0.24,
            time_samples: 0,
            feedback: 0.3,
            mix: 0.25,
            damp_alpha: 0.0,
            lp_l: 0.0,
            lp_r: 0.0,
        };
        delay.set_time(delay.time_seconds);
        delay.set_damp_hz(12000.0);
        delay
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        *self = {
            let mut fresh = Self::new(sample_rate);
            fresh.time_seconds = self.time_seconds;
            fresh.feedback = self.feedback;
            fresh.mix = self.mix;
            fresh.set_time(self.time_seconds);
            fresh
        };
    }

    fn set_time(&mut self, seconds: f32) {
        self.time_seconds = seconds.clamp(0.01, MAX_DELAY_SECONDS);
        self.time_samples =
            ((self.time_seconds * self.sample_rate) as usize).clamp(1, self.buf_l.len() - 1);
    }

    fn set_damp_hz(&mut self, hz: f32) {
        let hz = hz.clamp(500.0, 20000.0);
        self.damp_alpha = 1.0 - (-TAU * hz / self.sample_rate).exp();
    }

    /// Parses a beat division like "1:8" and returns the note length in
    /// seconds at the given tempo. Unknown divisions fall back to 1:8.
    fn division_seconds(division: &str, bpm: f64) -> f32 {
        let denom = division
            .split(':')
            .nth(1)
            .and_then(|d| d.trim().parse::<u32>().ok())
            .filter(|d| [2, 3, 4, 6, 8, 16].contains(d))
            .unwrap_or(8);
        let whole = 4.0 * 60.0 / bpm.max(1.0);
        (whole / denom as f64) as f32
    }

    fn apply(&mut self, params: &FxParams, bpm: f64) {
        if let Some(division) = &params.time_sync {
            self.set_time(Self::division_seconds(division, bpm));
        }
        // An explicit time in seconds wins over the division.
        if let Some(time) = params.time {
            self.set_time(time as f32);
        }
        if let Some(feedback) = params.feedback {
            self.feedback = feedback.clamp(0.0, 0.95) as f32;
        }
        if let Some(mix) = params.mix {
            self.mix = mix.clamp(0.0, 1.0) as f32;
        }
        if let Some(damp) = params.damp {
            self.set_damp_hz(damp as f32);
        }
    }

    #[inline]
    fn process(&mut self, l: &mut f32, r: &mut f32) {
        let len = self.buf_l.len();
        let read = (self.idx + len - self.time_samples) % len;

        let tap_l = self.buf_l[read];
        let tap_r = self.buf_r[read];
        self.lp_l += (tap_l - self.lp_l) * self.damp_alpha;
        self.lp_r += (tap_r - self.lp_r) * self.damp_alpha;

        self.buf_l[self.idx] = *l + self.lp_l * self.feedback;
        self.buf_r[self.idx] = *r + self.lp_r * self.feedback;
        self.idx += 1;
        if self.idx >= len {
            self.idx = 0;
        }

        *l = *l * (1.0 - self.mix) + self.lp_l * self.mix;
        *r = *r * (1.0 - self.mix) + self.lp_r * self.mix;
    }
}

// ---------------------------------------------------------------------------
// Chorus / flanger
// ---------------------------------------------------------------------------

/// An LFO-modulated interpolated delay line. Chorus and flanger share the
/// implementation and differ only in base delay, depth, and defaults.
pub struct Chorus {
    buf_l: Vec<f32>,
    buf_r: Vec<f32>,
    idx: usize,
    sample_rate: f32,
    base_seconds: f32,
    depth_seconds: f32,
    rate_hz: f32,
    feedback: f32,
    mix: f32,
    phase: f32,
}

impl Chorus {
    fn chorus(sample_rate: f64) -> Self {
        Self::with_defaults(sample_rate, 0.012, 0.006, 0.22, 0.12)
    }

    fn flanger(sample_rate: f64) -> Self {
        Self::with_defaults(sample_rate, 0.0025, 0.002, 0.25, 0.25)
    }

    fn with_defaults(
        sample_rate: f64,
        base_seconds: f32,
        depth_seconds: f32,
        rate_hz: f32,
        feedback: f32,
    ) -> Self {
        let sr = sample_rate.max(22050.0) as f32;
        let capacity = (MAX_MOD_DELAY_SECONDS * sr) as usize + 2;
        Self {
            buf_l: vec![0.0; capacity],
            buf_r: vec![0.0; capacity],
            idx: 0,
            sample_rate: sr,
            base_seconds,
            depth_seconds,
            rate_hz,
            feedback,
            mix: 0.35,
            phase: 0.0,
        }
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        let mut fresh = Self::with_defaults(
            sample_rate,
            self.base_seconds,
            self.depth_seconds,
            self.rate_hz,
            self.feedback,
        );
        fresh.mix = self.mix;
        *self = fresh;
    }

    fn apply(&mut self, params: &FxParams) {
        if let Some(rate) = params.rate {
            self.rate_hz = rate.clamp(0.05, 10.0) as f32;
        }
        if let Some(depth) = params.depth {
            // Depth arrives in milliseconds.
            self.depth_seconds = (depth / 1000.0).clamp(0.0, 0.02) as f32;
        }
        if let Some(base) = params.base {
            self.base_seconds = (base / 1000.0).clamp(0.0005, 0.04) as f32;
        }
        if let Some(feedback) = params.feedback {
            self.feedback = feedback.clamp(0.0, 0.95) as f32;
        }
        if let Some(mix) = params.mix {
            self.mix = mix.clamp(0.0, 1.0) as f32;
        }
    }

    #[inline]
    fn tap(buf: &[f32], write_idx: usize, delay_samples: f32) -> f32 {
        let len = buf.len();
        let pos = write_idx as f32 + len as f32 - delay_samples;
        let ip = pos as usize;
        let frac = pos - ip as f32;
        let s0 = buf[ip % len];
        let s1 = buf[(ip + 1) % len];
        s0 + (s1 - s0) * frac
    }

    #[inline]
    fn process(&mut self, l: &mut f32, r: &mut f32) {
        self.phase += TAU * self.rate_hz / self.sample_rate;
        if self.phase > TAU {
            self.phase -= TAU;
        }

        let max_delay = (self.buf_l.len() - 2) as f32;
        let delay_seconds = self.base_seconds + self.depth_seconds * self.phase.sin();
        let delay_samples = (delay_seconds * self.sample_rate).clamp(1.0, max_delay);

        let tap_l = Self::tap(&self.buf_l, self.idx, delay_samples);
        let tap_r = Self::tap(&self.buf_r, self.idx, delay_samples);

        self.buf_l[self.idx] = *l + tap_l * self.feedback;
        self.buf_r[self.idx] = *r + tap_r * self.feedback;
        self.idx += 1;
        if self.idx >= self.buf_l.len() {
            self.idx = 0;
        }

        *l = *l * (1.0 - self.mix) + tap_l * self.mix;
        *r = *r * (1.0 - self.mix) + tap_r * self.mix;
    }
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

/// Feedforward compressor with per-sample peak detection and a dB-domain
/// gain computer.
pub struct Compressor {
    sample_rate: f32,
    threshold_db: f32,
    ratio: f32,
    attack_ms: f32,
    release_ms: f32,
    makeup: f32,
    attack_coef: f32,
    release_coef: f32,
    envelope: f32,
}

impl Compressor {
    fn new(sample_rate: f64) -> Self {
        let mut comp = Self {
            sample_rate: sample_rate.max(22050.0) as f32,
            threshold_db: -22.0,
            ratio: 4.0,
            attack_ms: 3.0,
            release_ms: 180.0,
            makeup: 1.0,
            attack_coef: 0.0,
            release_coef: 0.0,
            envelope: 0.0,
        };
        comp.refresh();
        comp
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate.max(22050.0) as f32;
        self.envelope = 0.0;
        self.refresh();
    }

    fn apply(&mut self, params: &FxParams) {
        if let Some(threshold) = params.threshold {
            self.threshold_db = threshold.clamp(-80.0, 0.0) as f32;
        }
        if let Some(ratio) = params.ratio {
            self.ratio = ratio.clamp(1.0, 20.0) as f32;
        }
        if let Some(attack) = params.attack {
            self.attack_ms = attack.clamp(0.1, 500.0) as f32;
        }
        if let Some(release) = params.release {
            self.release_ms = release.clamp(1.0, 2500.0) as f32;
        }
        if let Some(makeup) = params.makeup {
            self.makeup = makeup.clamp(0.0, 4.0) as f32;
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        self.attack_coef = (-1.0 / (self.attack_ms / 1000.0 * self.sample_rate)).exp();
        self.release_coef = (-1.0 / (self.release_ms / 1000.0 * self.sample_rate)).exp();
    }

    #[inline]
    fn process(&mut self, l: &mut f32, r: &mut f32) {
        let level = l.abs().max(r.abs());
        let coef = if level > self.envelope {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.envelope = level + coef * (self.envelope - level);

        let level_db = 20.0 * self.envelope.max(1e-6).log10();
        let over_db = level_db - self.threshold_db;
        let gain = if over_db > 0.0 {
            let reduction_db = over_db * (1.0 - 1.0 / self.ratio);
            10f32.powf(-reduction_db / 20.0) * self.makeup
        } else {
            self.makeup
        };

        *l *= gain;
        *r *= gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> FxParams {
        FxParams::default()
    }

    #[test]
    fn test_bypass_passes_dry() {
        let mut unit = FxUnit::new("d1", "delay", 48000.0);
        unit.apply_params(
            &FxParams {
                mix: Some(1.0),
                ..params()
            },
            120.0,
        );
        unit.bypass = true;

        let (mut l, mut r) = (0.7f32, -0.7f32);
        unit.process(&mut l, &mut r);
        assert_eq!(l, 0.7);
        assert_eq!(r, -0.7);
    }

    #[test]
    fn test_unknown_type_is_inert() {
        let mut unit = FxUnit::new("x", "spectral-mangler", 48000.0);
        let (mut l, mut r) = (0.3f32, 0.4f32);
        unit.process(&mut l, &mut r);
        assert_eq!((l, r), (0.3, 0.4));
    }

    #[test]
    fn test_delay_tap_arrives_on_time() {
        let mut unit = FxUnit::new("d1", "delay", 48000.0);
        unit.apply_params(
            &FxParams {
                time: Some(0.1),
                mix: Some(1.0),
                feedback: Some(0.0),
                damp: Some(20000.0),
                ..params()
            },
            120.0,
        );

        // Feed an impulse, then silence. With mix=1 the output is the tap.
        let (mut l, mut r) = (1.0f32, 1.0f32);
        unit.process(&mut l, &mut r);

        let delay_samples = (0.1f32 * 48000.0) as usize;
        let mut peak_at = 0;
        let mut peak = 0.0f32;
        for i in 1..=delay_samples + 10 {
            let (mut l, mut r) = (0.0f32, 0.0f32);
            unit.process(&mut l, &mut r);
            if l.abs() > peak {
                peak = l.abs();
                peak_at = i;
            }
        }
        assert!(peak > 0.5, "peak {peak}");
        assert!(
            peak_at.abs_diff(delay_samples) <= 1,
            "tap at {peak_at}, expected {delay_samples}"
        );
    }

    #[test]
    fn test_delay_time_sync_division() {
        // 1:8 at 120 BPM: a whole note is 2s, so 1/8 is 0.25s.
        assert!((Delay::division_seconds("1:8", 120.0) - 0.25).abs() < 1e-6);
        assert!((Delay::division_seconds("1:16", 120.0) - 0.125).abs() < 1e-6);
        // Unknown divisions fall back to 1:8.
        assert!((Delay::division_seconds("1:7", 120.0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_delay_time_clamped() {
        let mut delay = Delay::new(48000.0);
        delay.apply(
            &FxParams {
                time: Some(10.0),
                ..params()
            },
            120.0,
        );
        assert_eq!(delay.time_seconds, MAX_DELAY_SECONDS);

        delay.apply(
            &FxParams {
                time: Some(0.0),
                ..params()
            },
            120.0,
        );
        assert_eq!(delay.time_seconds, 0.01);
    }

    #[test]
    fn test_reverb_produces_tail() {
        let mut unit = FxUnit::new("r1", "reverb", 48000.0);
        unit.apply_params(
            &FxParams {
                mix: Some(1.0),
                room_size: Some(0.8),
                ..params()
            },
            120.0,
        );

        let (mut l, mut r) = (1.0f32, 1.0f32);
        unit.process(&mut l, &mut r);

        // Well after the impulse, the tail should still carry energy.
        let mut energy = 0.0f64;
        for _ in 0..48000 {
            let (mut l, mut r) = (0.0f32, 0.0f32);
            unit.process(&mut l, &mut r);
            energy += (l as f64).powi(2) + (r as f64).powi(2);
        }
        assert!(energy > 1e-4, "tail energy {energy}");
    }

    #[test]
    fn test_compressor_attenuates_above_threshold() {
        let mut comp = Compressor::new(48000.0);
        comp.apply(&FxParams {
            threshold: Some(-20.0),
            ratio: Some(4.0),
            attack: Some(0.1),
            release: Some(1.0),
            ..params()
        });

        // Drive a loud constant signal; once the envelope settles, the gain
        // reduction should approach (1 - 1/ratio) of the overshoot.
        let mut out = 0.0f32;
        for _ in 0..4800 {
            let (mut l, mut r) = (1.0f32, 1.0f32);
            comp.process(&mut l, &mut r);
            out = l;
        }
        // 0 dBFS over a -20 dB threshold at 4:1 leaves -15 dB reduction.
        let expected = 10f32.powf(-15.0 / 20.0);
        assert!((out - expected).abs() < 0.01, "out {out}, expected {expected}");
    }

    #[test]
    fn test_compressor_leaves_quiet_signals_alone() {
        let mut comp = Compressor::new(48000.0);
        let (mut l, mut r) = (0.01f32, 0.01f32);
        comp.process(&mut l, &mut r);
        assert!((l - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_chorus_is_audible_and_bounded() {
        let mut unit = FxUnit::new("c1", "chorus", 48000.0);
        unit.apply_params(
            &FxParams {
                mix: Some(0.5),
                rate: Some(1.0),
                depth: Some(5.0),
                ..params()
            },
            120.0,
        );

        let mut differs = false;
        for i in 0..9600 {
            let x = (TAU * 220.0 * i as f32 / 48000.0).sin() * 0.5;
            let (mut l, mut r) = (x, x);
            unit.process(&mut l, &mut r);
            assert!(l.is_finite() && l.abs() < 2.0);
            if (l - x).abs() > 1e-3 {
                differs = true;
            }
        }
        assert!(differs, "chorus never altered the signal");
    }

    #[test]
    fn test_fx_param_merge_preserves_unset_fields() {
        let mut delay = Delay::new(48000.0);
        delay.apply(
            &FxParams {
                time: Some(0.5),
                feedback: Some(0.6),
                ..params()
            },
            120.0,
        );
        // A later update touching only mix keeps time and feedback.
        delay.apply(
            &FxParams {
                mix: Some(0.9),
                ..params()
            },
            120.0,
        );
        assert_eq!(delay.time_seconds, 0.5);
        assert_eq!(delay.feedback, 0.6);
        assert_eq!(delay.mix, 0.9);
    }
}
