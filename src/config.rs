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

//! Engine configuration and validation.

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_SAMPLE_RATE: u32 = 48000;
const DEFAULT_BUFFER_SIZE: usize = 512;
const DEFAULT_NUM_OUT: usize = 2;
const DEFAULT_PLAY_PREROLL_MS: f64 = 120.0;

/// Minimum supported device sample rate in Hz.
pub const MIN_SAMPLE_RATE: u32 = 22050;
/// Minimum supported device buffer size in frames.
pub const MIN_BUFFER_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sampleRate must be >= {MIN_SAMPLE_RATE}, got {0}")]
    SampleRate(u32),

    #[error("bufferSize must be >= {MIN_BUFFER_SIZE}, got {0}")]
    BufferSize(usize),

    #[error("numOut must be >= 1, got {0}")]
    NumOut(usize),

    #[error("playPrerollMs must be >= 0, got {0}")]
    PlayPreroll(f64),
}

/// The audio engine configuration. Changing the audio fields re-opens the
/// device.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub num_out: usize,
    pub num_in: usize,
    pub play_preroll_ms: f64,
    pub scheduler_debug: bool,
    /// Device selector. `None` picks the host default; a name starting with
    /// "mock" picks the mock device.
    pub device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            num_out: DEFAULT_NUM_OUT,
            num_in: 0,
            play_preroll_ms: DEFAULT_PLAY_PREROLL_MS,
            scheduler_debug: false,
            device: None,
        }
    }
}

/// A partial configuration update as carried by `engine.config.set`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfigUpdate {
    pub sample_rate: Option<u32>,
    pub buffer_size: Option<usize>,
    pub num_out: Option<usize>,
    pub num_in: Option<usize>,
    pub play_preroll_ms: Option<f64>,
    pub scheduler_debug: Option<bool>,
    pub device: Option<String>,
}

impl EngineConfig {
    /// Validates and applies a partial update. Returns true if any field that
    /// requires re-opening the audio device changed.
    pub fn apply(&mut self, update: &EngineConfigUpdate) -> Result<bool, ConfigError> {
        if let Some(rate) = update.sample_rate {
            if rate < MIN_SAMPLE_RATE {
                return Err(ConfigError::SampleRate(rate));
            }
        }
        if let Some(size) = update.buffer_size {
            if size < MIN_BUFFER_SIZE {
                return Err(ConfigError::BufferSize(size));
            }
        }
        if let Some(num_out) = update.num_out {
            if num_out < 1 {
                return Err(ConfigError::NumOut(num_out));
            }
        }
        if let Some(preroll) = update.play_preroll_ms {
            if preroll < 0.0 {
                return Err(ConfigError::PlayPreroll(preroll));
            }
        }

        let mut reopen = false;
        if let Some(rate) = update.sample_rate {
            reopen |= self.sample_rate != rate;
            self.sample_rate = rate;
        }
        if let Some(size) = update.buffer_size {
            reopen |= self.buffer_size != size;
            self.buffer_size = size;
        }
        if let Some(num_out) = update.num_out {
            reopen |= self.num_out != num_out;
            self.num_out = num_out;
        }
        if let Some(num_in) = update.num_in {
            reopen |= self.num_in != num_in;
            self.num_in = num_in;
        }
        if let Some(preroll) = update.play_preroll_ms {
            self.play_preroll_ms = preroll;
        }
        if let Some(debug) = update.scheduler_debug {
            self.scheduler_debug = debug;
        }
        if let Some(device) = &update.device {
            reopen |= self.device.as_deref() != Some(device.as_str());
            self.device = Some(device.clone());
        }

        Ok(reopen)
    }

    /// Preroll duration in samples at the configured rate.
    pub fn preroll_samples(&self) -> u64 {
        ((self.play_preroll_ms / 1000.0) * self.sample_rate as f64)
            .round()
            .max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.num_out, 2);
        assert_eq!(config.preroll_samples(), 5760);
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();

        let bad_rate = EngineConfigUpdate {
            sample_rate: Some(8000),
            ..Default::default()
        };
        assert!(config.apply(&bad_rate).is_err());

        let bad_buffer = EngineConfigUpdate {
            buffer_size: Some(32),
            ..Default::default()
        };
        assert!(config.apply(&bad_buffer).is_err());

        let bad_out = EngineConfigUpdate {
            num_out: Some(0),
            ..Default::default()
        };
        assert!(config.apply(&bad_out).is_err());

        // A failed update must not partially apply.
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.buffer_size, 512);
    }

    #[test]
    fn test_apply_reports_reopen() {
        let mut config = EngineConfig::default();

        let preroll_only = EngineConfigUpdate {
            play_preroll_ms: Some(250.0),
            ..Default::default()
        };
        assert!(!config.apply(&preroll_only).unwrap());
        assert_eq!(config.play_preroll_ms, 250.0);

        let new_rate = EngineConfigUpdate {
            sample_rate: Some(44100),
            ..Default::default()
        };
        assert!(config.apply(&new_rate).unwrap());
        assert_eq!(config.sample_rate, 44100);

        // Setting the same rate again should not force a reopen.
        assert!(!config.apply(&new_rate).unwrap());
    }
}
