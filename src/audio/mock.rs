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
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use super::{render::RenderCore, DeviceError, StreamHandle, ThreadStreamHandle};
use crate::config::EngineConfig;

/// A mock device: renders blocks into a discarded buffer at roughly real
/// time. Lets the whole engine run headless in tests and CI.
#[derive(Clone)]
pub struct Device {
    name: String,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
        }
    }
}

impl super::Device for Device {
    fn open(
        &self,
        core: Arc<Mutex<RenderCore>>,
        config: &EngineConfig,
    ) -> Result<Box<dyn StreamHandle>, DeviceError> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let block_duration =
            Duration::from_secs_f64(config.buffer_size as f64 / config.sample_rate as f64);
        let buffer_len = config.buffer_size * config.num_out;
        let out_channels = config.num_out;
        let name = self.name.clone();

        let join = thread::Builder::new()
            .name("stagemix-mock-audio".to_string())
            .spawn(move || {
                info!(device = name, "Mock audio stream running");
                let mut buffer = vec![0.0f32; buffer_len];
                loop {
                    match stop_rx.recv_timeout(block_duration) {
                        Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            core.lock().render(&mut buffer, out_channels);
                        }
                    }
                }
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        Ok(Box::new(ThreadStreamHandle::new(stop_tx, join)))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}
