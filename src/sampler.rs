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

//! Sample playback: the in-memory sample store, the decoded-file loader, the
//! multi-key program instrument, and the sampler voice pool.

use serde::Deserialize;

pub mod loader;
pub mod program;
pub mod store;
pub mod voice;

/// How a trigger derives its playback rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Rate follows the equal-temperament pitch ratio only.
    #[default]
    Vinyl,
    /// Rate is chosen so the slice spans the requested duration.
    FitDuration,
    /// Fit-duration rate multiplied by the pitch ratio.
    FitDurationVinyl,
}

/// A fully typed `sampler.trigger` payload. Parsed by the router; the audio
/// thread only ever sees this struct, never raw JSON.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerParams {
    pub sample_id: Option<String>,
    pub sample_path: Option<String>,
    pub start_norm: f64,
    pub end_norm: f64,
    pub mode: TriggerMode,
    pub note: i32,
    pub root_midi: i32,
    #[serde(alias = "vel")]
    pub velocity: f64,
    pub gain: f64,
    pub pan: f64,
    pub mix_ch: usize,
    pub duration_sec: Option<f64>,
    pub pattern_steps: Option<f64>,
    pub pattern_beats: Option<f64>,
    pub bpm: Option<f64>,
}

impl Default for TriggerParams {
    fn default() -> Self {
        Self {
            sample_id: None,
            sample_path: None,
            start_norm: 0.0,
            end_norm: 1.0,
            mode: TriggerMode::Vinyl,
            note: 60,
            root_midi: 60,
            velocity: 0.85,
            gain: 1.0,
            pan: 0.0,
            mix_ch: 1,
            duration_sec: None,
            pattern_steps: None,
            pattern_beats: None,
            bpm: None,
        }
    }
}
