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

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{render::RenderCore, thread_priority, DeviceError, StreamHandle, ThreadStreamHandle};
use crate::config::EngineConfig;

/// A small wrapper around a cpal::Device with the metadata device listing
/// needs.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The maximum number of output channels the device supports.
    max_channels: u16,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

impl Device {
    /// Lists cpal devices and produces the Device trait.
    pub fn list() -> Result<Vec<Box<dyn super::Device>>, DeviceError> {
        Ok(Device::list_cpal_devices()?
            .into_iter()
            .map(|device| {
                let device: Box<dyn super::Device> = Box::new(device);
                device
            })
            .collect())
    }

    /// Lists cpal devices.
    fn list_cpal_devices() -> Result<Vec<Device>, DeviceError> {
        // Suppress noisy host output here.
        let _shh_stdout = shh::stdout().map_err(|e| DeviceError::Host(e.to_string()))?;
        let _shh_stderr = shh::stderr().map_err(|e| DeviceError::Host(e.to_string()))?;

        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host =
                cpal::host_from_id(host_id).map_err(|e| DeviceError::Host(e.to_string()))?;
            let host_devices = match host.devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let output_configs = match device.supported_output_configs() {
                    Ok(configs) => configs,
                    Err(e) => {
                        debug!(
                            err = e.to_string(),
                            host = host_id.name(),
                            device = device.name().unwrap_or_default(),
                            "Error getting output configs"
                        );
                        continue;
                    }
                };

                let mut max_channels = 0;
                for output_config in output_configs {
                    if max_channels < output_config.channels() {
                        max_channels = output_config.channels();
                    }
                }

                if max_channels > 0 {
                    devices.push(Device {
                        name: device
                            .name()
                            .map_err(|e| DeviceError::Host(e.to_string()))?,
                        max_channels,
                        host_id,
                        device,
                    })
                }
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    /// Gets the cpal device with the given name.
    pub fn get(name: &str) -> Result<Device, DeviceError> {
        Device::list_cpal_devices()?
            .into_iter()
            .find(|device| device.name.trim() == name)
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    /// Gets the host default output device.
    pub fn default_output() -> Result<Device, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| DeviceError::NotFound("default output".to_string()))?;
        let name = device.name().map_err(|e| DeviceError::Host(e.to_string()))?;
        let max_channels = device
            .supported_output_configs()
            .map_err(|e| DeviceError::Host(e.to_string()))?
            .map(|c| c.channels())
            .max()
            .unwrap_or(2);

        Ok(Device {
            name,
            max_channels,
            host_id: host.id(),
            device,
        })
    }
}

impl super::Device for Device {
    /// Opens the output stream on a dedicated thread (cpal streams are not
    /// Send). The thread reports the build result over a channel, then parks
    /// until the handle closes.
    fn open(
        &self,
        core: Arc<Mutex<RenderCore>>,
        config: &EngineConfig,
    ) -> Result<Box<dyn StreamHandle>, DeviceError> {
        let out_channels = config.num_out.min(self.max_channels as usize).max(1);
        let stream_config = cpal::StreamConfig {
            channels: out_channels as u16,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.buffer_size as u32),
        };

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let device = self.device.clone();
        let device_name = self.name.clone();

        let join = thread::Builder::new()
            .name("stagemix-audio".to_string())
            .spawn(move || {
                let priority = thread_priority::callback_thread_priority();
                let rt_audio = thread_priority::rt_audio_enabled();
                let mut priority_set = false;

                let error_callback = |err: cpal::StreamError| {
                    error!(err = err.to_string(), "Error during stream.");
                };
                let output_callback = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    thread_priority::configure_audio_thread_priority(
                        priority,
                        rt_audio,
                        &mut priority_set,
                    );
                    core.lock().render(data, out_channels);
                };

                // Some hosts reject fixed buffer sizes; fall back to the
                // host default rather than failing the open.
                let stream = device
                    .build_output_stream(&stream_config, output_callback.clone(), error_callback, None)
                    .or_else(|e| {
                        debug!(
                            err = e.to_string(),
                            "Fixed buffer size rejected, retrying with default"
                        );
                        let fallback = cpal::StreamConfig {
                            buffer_size: cpal::BufferSize::Default,
                            ..stream_config
                        };
                        device.build_output_stream(
                            &fallback,
                            output_callback,
                            |err: cpal::StreamError| {
                                error!(err = err.to_string(), "Error during stream.");
                            },
                            None,
                        )
                    });

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = result_tx.send(Err(DeviceError::Stream(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = result_tx.send(Err(DeviceError::Stream(e.to_string())));
                    return;
                }

                info!(device = device_name, "Audio stream running");
                let _ = result_tx.send(Ok(()));

                // Keep the stream alive until the handle closes.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match result_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(ThreadStreamHandle::new(stop_tx, join))),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Stream(
                "audio thread exited before reporting".to_string(),
            )),
        }
    }
}
