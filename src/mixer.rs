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

//! The mixer bus: an ordered array of channel strips, each with gain, pan,
//! mute/solo, three-band EQ, and an insert chain, summed into a master strip
//! with its own chain, gain, and crossfader. Per-channel and master meters
//! accumulate during rendering and finalize per block.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use self::eq::StereoEq;
use self::fx::FxUnit;

pub mod eq;
pub mod fx;

/// Most channels the mixer will hold.
pub const MAX_CHANNELS: usize = 64;
/// Channel count before the host sends mixer.init.
pub const DEFAULT_CHANNELS: usize = 16;

const DEFAULT_STRIP_GAIN: f32 = 0.85;

/// The channel id that means "master" in meter subscriptions.
pub const MASTER_METER_ID: i32 = -1;

/// One channel strip's user-facing state.
#[derive(Clone, Debug)]
pub struct ChannelStrip {
    pub gain: f32,
    pub pan: f32,
    pub eq_low: f32,
    pub eq_mid: f32,
    pub eq_high: f32,
    pub mute: bool,
    pub solo: bool,
}

impl Default for ChannelStrip {
    fn default() -> Self {
        Self {
            gain: DEFAULT_STRIP_GAIN,
            pan: 0.0,
            eq_low: 0.0,
            eq_mid: 0.0,
            eq_high: 0.0,
            mute: false,
            solo: false,
        }
    }
}

/// A partial channel update, as carried by `mixer.channel.set`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelParams {
    pub gain: Option<f64>,
    pub pan: Option<f64>,
    pub mute: Option<bool>,
    pub solo: Option<bool>,
    pub eq_low: Option<f64>,
    pub eq_mid: Option<f64>,
    pub eq_high: Option<f64>,
}

/// A partial master update, as carried by `mixer.master.set`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterParams {
    pub gain: Option<f64>,
    pub crossfader: Option<f64>,
}

/// Which effect chain a request targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FxTarget {
    Master,
    Channel(usize),
}

/// Per-side meter state with block RMS accumulation and latched peaks.
#[derive(Clone, Copy, Debug, Default)]
struct MeterState {
    peak_l: f32,
    peak_r: f32,
    rms_l: f32,
    rms_r: f32,
    acc_l: f64,
    acc_r: f64,
}

impl MeterState {
    #[inline]
    fn accumulate(&mut self, l: f32, r: f32) {
        self.peak_l = self.peak_l.max(l.abs());
        self.peak_r = self.peak_r.max(r.abs());
        self.acc_l += (l as f64) * (l as f64);
        self.acc_r += (r as f64) * (r as f64);
    }

    fn finalize(&mut self, n: usize) {
        let n = n.max(1) as f64;
        self.rms_l = (self.acc_l / n).sqrt() as f32;
        self.rms_r = (self.acc_r / n).sqrt() as f32;
        self.acc_l = 0.0;
        self.acc_r = 0.0;
    }
}

/// One reported meter frame.
#[derive(Clone, Debug, Serialize)]
pub struct MeterFrame {
    pub ch: i32,
    pub rms: [f32; 2],
    pub peak: [f32; 2],
}

/// The mixer bus.
pub struct Mixer {
    sample_rate: f64,
    strips: Vec<ChannelStrip>,
    eqs: Vec<StereoEq>,
    channel_fx: Vec<Vec<FxUnit>>,
    meters: Vec<MeterState>,
    master_fx: Vec<FxUnit>,
    master_meter: MeterState,
    pub master_gain: f32,
    pub crossfader: f32,
}

impl Mixer {
    pub fn new(channels: usize, sample_rate: f64) -> Self {
        let mut mixer = Self {
            sample_rate,
            strips: Vec::new(),
            eqs: Vec::new(),
            channel_fx: Vec::new(),
            meters: Vec::new(),
            master_fx: Vec::new(),
            master_meter: MeterState::default(),
            master_gain: DEFAULT_STRIP_GAIN,
            crossfader: 0.0,
        };
        mixer.resize(channels);
        mixer
    }

    pub fn channel_count(&self) -> usize {
        self.strips.len()
    }

    /// Resizes the mixer, preserving existing channel state. New channels get
    /// defaults with flat EQ.
    pub fn resize(&mut self, channels: usize) {
        let channels = channels.clamp(1, MAX_CHANNELS);
        self.strips.resize_with(channels, ChannelStrip::default);
        self.channel_fx.resize_with(channels, Vec::new);
        self.meters.resize_with(channels, MeterState::default);
        while self.eqs.len() < channels {
            let mut eq = StereoEq::default();
            eq.configure(self.sample_rate, 0.0, 0.0, 0.0);
            self.eqs.push(eq);
        }
        self.eqs.truncate(channels);
    }

    /// Rebuilds all rate-dependent DSP after a device change.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        for ch in 0..self.strips.len() {
            self.refresh_eq(ch);
        }
        for unit in self.all_fx_units_mut() {
            unit.set_sample_rate(sample_rate);
        }
    }

    fn all_fx_units_mut(&mut self) -> impl Iterator<Item = &mut FxUnit> {
        self.channel_fx
            .iter_mut()
            .flatten()
            .chain(self.master_fx.iter_mut())
    }

    pub fn strip(&self, ch: usize) -> Option<&ChannelStrip> {
        self.strips.get(ch)
    }

    /// Applies a partial update to one channel and refreshes its EQ.
    pub fn apply_channel_params(&mut self, ch: usize, params: &ChannelParams) -> bool {
        let Some(strip) = self.strips.get_mut(ch) else {
            return false;
        };
        if let Some(gain) = params.gain {
            strip.gain = gain.max(0.0) as f32;
        }
        if let Some(pan) = params.pan {
            strip.pan = pan.clamp(-1.0, 1.0) as f32;
        }
        if let Some(mute) = params.mute {
            strip.mute = mute;
        }
        if let Some(solo) = params.solo {
            strip.solo = solo;
        }
        let eq_changed =
            params.eq_low.is_some() || params.eq_mid.is_some() || params.eq_high.is_some();
        if let Some(low) = params.eq_low {
            strip.eq_low = low as f32;
        }
        if let Some(mid) = params.eq_mid {
            strip.eq_mid = mid as f32;
        }
        if let Some(high) = params.eq_high {
            strip.eq_high = high as f32;
        }
        if eq_changed {
            self.refresh_eq(ch);
        }
        true
    }

    pub fn apply_master_params(&mut self, params: &MasterParams) {
        if let Some(gain) = params.gain {
            self.master_gain = gain.max(0.0) as f32;
        }
        if let Some(crossfader) = params.crossfader {
            self.crossfader = crossfader.clamp(-1.0, 1.0) as f32;
        }
    }

    /// Recomputes one channel's EQ coefficients and resets its filter state.
    pub fn refresh_eq(&mut self, ch: usize) {
        if let (Some(strip), Some(eq)) = (self.strips.get(ch), self.eqs.get_mut(ch)) {
            eq.configure(
                self.sample_rate,
                strip.eq_low as f64,
                strip.eq_mid as f64,
                strip.eq_high as f64,
            );
        }
    }

    /// The solo predicate: true when any channel has solo engaged.
    pub fn any_solo(&self) -> bool {
        self.strips.iter().any(|s| s.solo)
    }

    /// True when the channel contributes to the master bus this block.
    #[inline]
    pub fn channel_audible(&self, ch: usize, any_solo: bool) -> bool {
        match self.strips.get(ch) {
            Some(strip) => !strip.mute && (!any_solo || strip.solo),
            None => false,
        }
    }

    pub fn fx_chain_mut(&mut self, target: FxTarget) -> Option<&mut Vec<FxUnit>> {
        match target {
            FxTarget::Master => Some(&mut self.master_fx),
            FxTarget::Channel(ch) => self.channel_fx.get_mut(ch),
        }
    }

    /// Runs one channel's strip processing for one sample: EQ, insert chain,
    /// gain, pan law `(1-p, 1+p)`, and meter accumulation. Returns the
    /// channel's contribution to the master bus.
    #[inline]
    pub fn process_channel(&mut self, ch: usize, mut l: f32, mut r: f32) -> (f32, f32) {
        let Some(strip) = self.strips.get(ch) else {
            return (0.0, 0.0);
        };
        let gain = strip.gain;
        let pan = strip.pan;

        if let Some(eq) = self.eqs.get_mut(ch) {
            eq.process(&mut l, &mut r);
        }
        if let Some(chain) = self.channel_fx.get_mut(ch) {
            for unit in chain.iter_mut() {
                unit.process(&mut l, &mut r);
            }
        }

        let out_l = l * gain * (1.0 - pan);
        let out_r = r * gain * (1.0 + pan);
        if let Some(meter) = self.meters.get_mut(ch) {
            meter.accumulate(out_l, out_r);
        }
        (out_l, out_r)
    }

    /// Runs the master chain, gain, and crossfader for one sample, and
    /// accumulates the master meter.
    #[inline]
    pub fn process_master(&mut self, mut l: f32, mut r: f32) -> (f32, f32) {
        for unit in self.master_fx.iter_mut() {
            unit.process(&mut l, &mut r);
        }

        l *= self.master_gain;
        r *= self.master_gain;

        let xf = self.crossfader.clamp(-1.0, 1.0);
        l *= 1.0 - xf.max(0.0);
        r *= 1.0 + xf.min(0.0);

        self.master_meter.accumulate(l, r);
        (l, r)
    }

    /// Finalizes per-block RMS for every meter and clears the accumulators.
    pub fn finalize_block(&mut self, n: usize) {
        for meter in self.meters.iter_mut() {
            meter.finalize(n);
        }
        self.master_meter.finalize(n);
    }

    /// Reports meter frames for the subscribed channel set. Peaks are
    /// latched since the previous report and reset on report.
    pub fn meter_frames(&mut self, channels: &HashSet<i32>) -> Vec<MeterFrame> {
        let mut frames = Vec::with_capacity(channels.len());

        if channels.contains(&MASTER_METER_ID) {
            let m = &mut self.master_meter;
            frames.push(MeterFrame {
                ch: MASTER_METER_ID,
                rms: [m.rms_l, m.rms_r],
                peak: [m.peak_l, m.peak_r],
            });
            m.peak_l = 0.0;
            m.peak_r = 0.0;
        }

        for (ch, meter) in self.meters.iter_mut().enumerate() {
            if !channels.contains(&(ch as i32)) {
                continue;
            }
            frames.push(MeterFrame {
                ch: ch as i32,
                rms: [meter.rms_l, meter.rms_r],
                peak: [meter.peak_l, meter.peak_r],
            });
            meter.peak_l = 0.0;
            meter.peak_r = 0.0;
        }

        frames
    }
}
