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

//! Per-instrument synthesis parameters.

use std::collections::HashMap;

use serde::Deserialize;

/// Oscillator waveform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    #[default]
    Sine,
    Triangle,
    Saw,
    Square,
}

/// A named synth instrument: envelope, waveform, gain, FM depth.
#[derive(Clone, Debug)]
pub struct Instrument {
    pub kind: String,
    pub gain: f32,
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub waveform: Waveform,
    pub fm: f32,
}

impl Default for Instrument {
    fn default() -> Self {
        Self {
            kind: "piano".to_string(),
            gain: 1.0,
            attack: 0.003,
            decay: 0.12,
            sustain: 0.7,
            release: 0.2,
            waveform: Waveform::Sine,
            fm: 0.0,
        }
    }
}

/// The `params` object carried by `inst.param.set`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentParams {
    pub gain: Option<f64>,
    pub attack: Option<f64>,
    pub decay: Option<f64>,
    pub sustain: Option<f64>,
    pub release: Option<f64>,
    pub waveform: Option<Waveform>,
    pub fm: Option<f64>,
}

impl Instrument {
    pub fn with_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    /// Applies a parameter update. Envelope times keep sane floors so a
    /// zero-length stage can't divide the envelope by zero.
    pub fn apply(&mut self, params: &InstrumentParams) {
        if let Some(gain) = params.gain {
            self.gain = gain.max(0.0) as f32;
        }
        if let Some(attack) = params.attack {
            self.attack = attack.max(0.001) as f32;
        }
        if let Some(decay) = params.decay {
            self.decay = decay.max(0.005) as f32;
        }
        if let Some(sustain) = params.sustain {
            self.sustain = sustain.clamp(0.0, 1.0) as f32;
        }
        if let Some(release) = params.release {
            self.release = release.max(0.01) as f32;
        }
        if let Some(waveform) = params.waveform {
            self.waveform = waveform;
        }
        if let Some(fm) = params.fm {
            self.fm = fm.max(0.0) as f32;
        }
    }
}

/// All known instruments by id. A note for an unknown id plays with default
/// parameters, which also registers the id.
#[derive(Default)]
pub struct InstrumentRegistry {
    instruments: HashMap<String, Instrument>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, inst_id: &str, instrument: Instrument) {
        self.instruments.insert(inst_id.to_string(), instrument);
    }

    pub fn get(&self, inst_id: &str) -> Option<&Instrument> {
        self.instruments.get(inst_id)
    }

    pub fn get_or_default(&mut self, inst_id: &str) -> &Instrument {
        self.instruments
            .entry(inst_id.to_string())
            .or_default()
    }

    pub fn get_mut_or_default(&mut self, inst_id: &str) -> &mut Instrument {
        self.instruments
            .entry(inst_id.to_string())
            .or_default()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}
