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
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::EngineConfig;

pub mod cpal;
pub mod mock;
pub mod render;
mod thread_priority;

use render::RenderCore;

/// Error types for the device layer.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("audio host error: {0}")]
    Host(String),

    #[error("no device found with name {0}")]
    NotFound(String),

    #[error("stream error: {0}")]
    Stream(String),
}

/// An audio output device that can drive the render core.
pub trait Device: fmt::Display + Send + Sync {
    /// Opens an output stream pulling blocks from the core. The returned
    /// handle keeps the stream alive; closing it stops the device thread.
    fn open(
        &self,
        core: Arc<Mutex<RenderCore>>,
        config: &EngineConfig,
    ) -> Result<Box<dyn StreamHandle>, DeviceError>;
}

/// A running output stream.
pub trait StreamHandle: Send {
    fn close(self: Box<Self>);
}

/// Shared stream handle shape: a stop channel plus the device thread's join
/// handle. Both the cpal and mock devices run their streams on a dedicated
/// thread because cpal streams are not Send.
pub(crate) struct ThreadStreamHandle {
    stop_tx: crossbeam_channel::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl ThreadStreamHandle {
    pub(crate) fn new(stop_tx: crossbeam_channel::Sender<()>, join: JoinHandle<()>) -> Self {
        Self {
            stop_tx,
            join: Some(join),
        }
    }
}

impl StreamHandle for ThreadStreamHandle {
    fn close(mut self: Box<Self>) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, DeviceError> {
    cpal::Device::list()
}

/// Gets the device selected by the configuration. A name starting with
/// "mock" returns the mock device; no name picks the host default output.
pub fn get_device(config: &EngineConfig) -> Result<Arc<dyn Device>, DeviceError> {
    match config.device.as_deref() {
        Some(name) if name.starts_with("mock") => Ok(Arc::new(mock::Device::get(name))),
        Some(name) => Ok(Arc::new(cpal::Device::get(name)?)),
        None => Ok(Arc::new(cpal::Device::default_output()?)),
    }
}
