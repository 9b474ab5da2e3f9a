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

//! In-memory cache of decoded samples keyed by caller-assigned ids.
//!
//! Entries are `Arc`-shared: the store holds one handle and every playing
//! voice holds another, so dropping a key never frees frames a voice is
//! still reading.

use std::collections::HashMap;
use std::sync::Arc;

/// Immutable decoded audio at its native rate, planar per channel.
pub struct Sample {
    /// Native sample rate of the decoded file in Hz.
    pub sample_rate: u32,
    /// One Vec per channel; all channels have `frames` entries.
    pub channels: Vec<Vec<f32>>,
    /// Frame count per channel.
    pub frames: usize,
}

impl Sample {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.first().map(|c| c.len()).unwrap_or(0);
        Self {
            sample_rate,
            channels,
            frames,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn memory_size(&self) -> usize {
        self.frames * self.channel_count() * std::mem::size_of::<f32>()
    }
}

/// The sample cache. Writes happen on the control thread under the audio
/// mutex; the audio thread only performs lookups.
#[derive(Default)]
pub struct SampleStore {
    entries: HashMap<String, Arc<Sample>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str, sample: Arc<Sample>) {
        self.entries.insert(id.to_string(), sample);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Sample>> {
        self.entries.get(id).cloned()
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total memory held by cached frames.
    pub fn memory_usage(&self) -> usize {
        self.entries.values().map(|s| s.memory_size()).sum()
    }
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStore")
            .field("entries", &self.entries.len())
            .field("memory_kb", &(self.memory_usage() / 1024))
            .finish()
    }
}
