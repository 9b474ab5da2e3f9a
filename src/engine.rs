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

//! The engine: owns the render core, the scheduler, the transport, and the
//! audio device, and exposes every control operation the router dispatches.
//!
//! Locking discipline: the audio mutex (around [`RenderCore`]) serializes
//! every mutation of audio state with the device callback; the scheduler has
//! its own mutex; transport flags are atomics. File decoding always happens
//! before any lock is taken.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::audio::render::{RenderCore, TriggerError};
use crate::audio::{self, StreamHandle};
use crate::config::{ConfigError, EngineConfig, EngineConfigUpdate};
use crate::mixer::fx::{FxParams, FxUnit};
use crate::mixer::{ChannelParams, MasterParams, MeterFrame, FxTarget, DEFAULT_CHANNELS, MAX_CHANNELS};
use crate::proto::{ErrorCode, TransportSnapshot, Writer, PROTOCOL_NAME};
use crate::sampler::loader::{self, LoaderError};
use crate::sampler::TriggerParams;
use crate::schedule::{ScheduledEvent, Timeline};
use crate::synth::instrument::{Instrument, InstrumentParams};
use crate::transport::Transport;

/// A failing control operation, already mapped to a wire error code.
#[derive(Debug)]
pub struct OpError {
    pub code: ErrorCode,
    pub message: String,
}

impl OpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ConfigError> for OpError {
    fn from(e: ConfigError) -> Self {
        OpError::new(ErrorCode::BadRequest, e.to_string())
    }
}

impl From<LoaderError> for OpError {
    fn from(e: LoaderError) -> Self {
        OpError::new(ErrorCode::LoadFail, e.to_string())
    }
}

impl From<TriggerError> for OpError {
    fn from(e: TriggerError) -> Self {
        let code = match e {
            TriggerError::NotLoaded(_) => ErrorCode::NotLoaded,
            _ => ErrorCode::TriggerFail,
        };
        OpError::new(code, e.to_string())
    }
}

/// The meter subscription shared with the telemetry pump.
#[derive(Clone, Debug)]
pub struct MeterSubscription {
    pub active: bool,
    pub fps: u32,
    pub channels: HashSet<i32>,
}

impl Default for MeterSubscription {
    fn default() -> Self {
        Self {
            active: false,
            fps: 30,
            channels: HashSet::new(),
        }
    }
}

/// One unit description inside `fx.chain.set`.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct FxUnitSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub type_tag: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub bypass: Option<bool>,
    #[serde(default)]
    pub params: Option<FxParams>,
}

pub struct Engine {
    core: Arc<Mutex<RenderCore>>,
    timeline: Arc<Mutex<Timeline>>,
    transport: Arc<Transport>,
    config: Mutex<EngineConfig>,
    stream: Mutex<Option<Box<dyn StreamHandle>>>,
    ready: AtomicBool,
    running: AtomicBool,
    meter_sub: Mutex<MeterSubscription>,
    writer: Writer,
}

impl Engine {
    /// Builds the engine and tries to open the audio device. A device
    /// failure leaves the engine alive with `ready=false`.
    pub fn new(config: EngineConfig, writer: Writer) -> Arc<Engine> {
        let timeline = Arc::new(Mutex::new(Timeline::new()));
        timeline.lock().set_debug(config.scheduler_debug);
        let transport = Arc::new(Transport::new(120.0));
        let core = Arc::new(Mutex::new(RenderCore::new(
            config.sample_rate as f64,
            config.buffer_size,
            DEFAULT_CHANNELS,
            timeline.clone(),
            transport.clone(),
        )));

        let engine = Arc::new(Engine {
            core,
            timeline,
            transport,
            config: Mutex::new(config),
            stream: Mutex::new(None),
            ready: AtomicBool::new(false),
            running: AtomicBool::new(true),
            meter_sub: Mutex::new(MeterSubscription::default()),
            writer,
        });

        engine.open_device();
        engine.emit_engine_state();
        engine.emit_transport_state();
        engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    /// Stops the engine: the router and telemetry loops observe the cleared
    /// running flag, and closing the stream handle joins the device thread.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        info!("Engine shutting down");
        self.close_device();
    }

    // ------------------------------------------------------------------
    // Device management
    // ------------------------------------------------------------------

    fn close_device(&self) {
        if let Some(stream) = self.stream.lock().take() {
            stream.close();
        }
    }

    /// (Re)opens the audio device from the current configuration.
    fn open_device(&self) {
        self.close_device();

        let config = self.config.lock().clone();
        let result = audio::get_device(&config)
            .and_then(|device| device.open(self.core.clone(), &config));

        match result {
            Ok(stream) => {
                *self.stream.lock() = Some(stream);
                self.ready.store(true, Ordering::Relaxed);
                info!(
                    sample_rate = config.sample_rate,
                    buffer_size = config.buffer_size,
                    num_out = config.num_out,
                    "Audio device opened"
                );
            }
            Err(e) => {
                self.ready.store(false, Ordering::Relaxed);
                error!(err = %e, "Audio device failed to open");
                self.writer.event(
                    "engine.error",
                    json!({
                        "code": ErrorCode::DeviceFail.as_str(),
                        "message": e.to_string(),
                    }),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Engine ops
    // ------------------------------------------------------------------

    pub fn hello_data(&self) -> Value {
        json!({
            "protocol": PROTOCOL_NAME,
            "engineName": env!("CARGO_PKG_NAME"),
            "engineVersion": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
            "pid": std::process::id(),
            "capabilities": {
                "scheduler": true,
                "mixer": true,
                "fx": true,
                "meters": true,
                "sampler": true,
                "programs": true,
            },
        })
    }

    pub fn engine_state(&self) -> Value {
        // Report the live core format, which tracks the device.
        let core = self.core.lock();
        json!({
            "ready": self.ready.load(Ordering::Relaxed),
            "sampleRate": core.sample_rate(),
            "bufferSize": core.buffer_size(),
        })
    }

    pub fn engine_config(&self) -> Value {
        let config = self.config.lock();
        let channels = self.core.lock().mixer.channel_count();
        json!({
            "sampleRate": config.sample_rate,
            "bufferSize": config.buffer_size,
            "numOut": config.num_out,
            "numIn": config.num_in,
            "channels": channels,
            "playPrerollMs": config.play_preroll_ms,
            "schedulerDebug": config.scheduler_debug,
        })
    }

    pub fn set_config(&self, update: &EngineConfigUpdate) -> Result<Value, OpError> {
        let reopen = {
            let mut config = self.config.lock();
            config.apply(update)?
        };

        if let Some(debug) = update.scheduler_debug {
            self.timeline.lock().set_debug(debug);
        }

        if reopen {
            let (sample_rate, buffer_size) = {
                let config = self.config.lock();
                (config.sample_rate as f64, config.buffer_size)
            };
            self.close_device();
            self.core.lock().set_audio_format(sample_rate, buffer_size);
            self.open_device();
            self.emit_engine_state();
        }

        Ok(self.engine_config())
    }

    pub fn emit_engine_state(&self) {
        self.writer.event("engine.state", self.engine_state());
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    pub fn transport_snapshot(&self) -> TransportSnapshot {
        let sample_rate = self.config.lock().sample_rate as f64;
        let pos = self.transport.sample_pos();
        TransportSnapshot {
            playing: self.transport.is_playing() || self.transport.is_armed(),
            bpm: self.transport.bpm(),
            ppq: self.transport.samples_to_ppq(pos, sample_rate),
            sample_pos: pos,
        }
    }

    pub fn emit_transport_state(&self) {
        if let Ok(data) = serde_json::to_value(self.transport_snapshot()) {
            self.writer.event("transport.state", data);
        }
    }

    pub fn transport_play(&self) {
        let preroll = self.config.lock().preroll_samples();
        self.transport.arm(preroll);
        self.emit_transport_state();
    }

    pub fn transport_stop(&self) {
        self.transport.stop();
        self.core.lock().panic();
        self.emit_transport_state();
    }

    pub fn transport_seek(&self, ppq: Option<f64>, sample_pos: Option<u64>) {
        let sample_rate = self.config.lock().sample_rate as f64;
        let pos = match (sample_pos, ppq) {
            (Some(pos), _) => pos,
            (None, Some(ppq)) => self.transport.ppq_to_samples(ppq, sample_rate),
            (None, None) => 0,
        };
        self.transport.stop();
        self.transport.set_sample_pos(pos);
        self.timeline
            .lock()
            .seek(self.transport.samples_to_ppq(pos, sample_rate));
        self.emit_transport_state();
    }

    pub fn transport_set_tempo(&self, bpm: f64) {
        self.transport.set_bpm(bpm);
        self.emit_transport_state();
    }

    // ------------------------------------------------------------------
    // Mixer and FX
    // ------------------------------------------------------------------

    pub fn mixer_init(&self, channels: usize) -> Result<(), OpError> {
        if channels < 1 || channels > MAX_CHANNELS {
            return Err(OpError::new(
                ErrorCode::BadRequest,
                format!("channels must be 1..{MAX_CHANNELS}, got {channels}"),
            ));
        }
        self.core.lock().resize_mixer(channels);
        Ok(())
    }

    pub fn mixer_set_master(&self, params: &MasterParams) {
        self.core.lock().mixer.apply_master_params(params);
    }

    pub fn mixer_set_channel(&self, ch: usize, params: &ChannelParams) -> Result<(), OpError> {
        let mut core = self.core.lock();
        if !core.mixer.apply_channel_params(ch, params) {
            return Err(OpError::new(
                ErrorCode::BadRequest,
                format!("channel {ch} out of range"),
            ));
        }
        Ok(())
    }

    fn with_fx_chain<R>(
        &self,
        target: FxTarget,
        f: impl FnOnce(&mut Vec<FxUnit>, f64, f64) -> R,
    ) -> Result<R, OpError> {
        let bpm = self.transport.bpm();
        let mut core = self.core.lock();
        let sample_rate = core.sample_rate();
        match core.mixer.fx_chain_mut(target) {
            Some(chain) => Ok(f(chain, sample_rate, bpm)),
            None => Err(OpError::new(
                ErrorCode::BadRequest,
                "fx target channel out of range",
            )),
        }
    }

    pub fn fx_chain_set(&self, target: FxTarget, specs: &[FxUnitSpec]) -> Result<(), OpError> {
        self.with_fx_chain(target, |chain, sample_rate, bpm| {
            chain.clear();
            for (i, spec) in specs.iter().enumerate() {
                let id = spec.id.clone().unwrap_or_else(|| format!("fx{i}"));
                let type_tag = spec.type_tag.as_deref().unwrap_or("reverb");
                let mut unit = FxUnit::new(&id, type_tag, sample_rate);
                unit.enabled = spec.enabled.unwrap_or(true);
                unit.bypass = spec.bypass.unwrap_or(false);
                if let Some(params) = &spec.params {
                    unit.apply_params(params, bpm);
                }
                chain.push(unit);
            }
        })
    }

    /// Upserts a unit and merges parameters into it.
    pub fn fx_param_set(
        &self,
        target: FxTarget,
        id: &str,
        type_tag: Option<&str>,
        params: &FxParams,
    ) -> Result<(), OpError> {
        self.with_fx_chain(target, |chain, sample_rate, bpm| {
            if crate::mixer::fx::find_unit(chain, id).is_none() {
                chain.push(FxUnit::new(id, type_tag.unwrap_or("reverb"), sample_rate));
            }
            if let Some(unit) = crate::mixer::fx::find_unit(chain, id) {
                unit.apply_params(params, bpm);
            }
        })
    }

    pub fn fx_bypass_set(&self, target: FxTarget, id: &str, bypass: bool) -> Result<(), OpError> {
        self.with_fx_chain(target, |chain, _, _| {
            if let Some(unit) = crate::mixer::fx::find_unit(chain, id) {
                unit.bypass = bypass;
            }
        })
    }

    // ------------------------------------------------------------------
    // Instruments and notes
    // ------------------------------------------------------------------

    pub fn inst_create(&self, inst_id: &str, kind: &str) {
        self.core
            .lock()
            .instruments
            .insert(inst_id, Instrument::with_kind(kind));
    }

    pub fn inst_param_set(&self, inst_id: &str, kind: Option<&str>, params: &InstrumentParams) {
        let mut core = self.core.lock();
        let instrument = core.instruments.get_mut_or_default(inst_id);
        if let Some(kind) = kind {
            instrument.kind = kind.to_string();
        }
        instrument.apply(params);
    }

    pub fn note_on(&self, inst_id: &str, mix_ch: usize, note: i32, velocity: f32) {
        self.core.lock().start_note(inst_id, mix_ch, note, velocity);
    }

    pub fn note_off(&self, inst_id: &str, mix_ch: usize, note: i32) {
        self.core.lock().stop_note(inst_id, mix_ch, note);
    }

    pub fn note_all_off(&self) {
        self.core.lock().panic();
    }

    // ------------------------------------------------------------------
    // Sampler and programs
    // ------------------------------------------------------------------

    pub fn sampler_load(&self, sample_id: &str, path: &Path) -> Result<(), OpError> {
        // Decoding happens before the audio lock; only the insert is inside.
        let sample = loader::load_sample(path)?;
        self.core.lock().store.insert(sample_id, sample);
        Ok(())
    }

    pub fn sampler_unload(&self, sample_id: &str) -> bool {
        self.core.lock().store.remove(sample_id)
    }

    /// Ensures the trigger's sample is cached, loading an ad-hoc path when
    /// given one, and rewrites `sample_id` so dispatch is a pure lookup.
    pub fn resolve_trigger(&self, params: &mut TriggerParams) -> Result<(), OpError> {
        let cached = match params.sample_id.as_deref() {
            Some(id) => self.core.lock().store.contains(id),
            None => false,
        };
        if cached {
            return Ok(());
        }

        let Some(path) = params.sample_path.clone() else {
            return match &params.sample_id {
                Some(id) => Err(OpError::new(
                    ErrorCode::NotLoaded,
                    format!("sample {id} is not loaded"),
                )),
                None => Err(OpError::new(
                    ErrorCode::BadRequest,
                    "sampleId or samplePath required",
                )),
            };
        };

        let id = params
            .sample_id
            .clone()
            .unwrap_or_else(|| format!("adhoc:{path}"));
        let sample = loader::load_sample(Path::new(&path))?;
        self.core.lock().store.insert(&id, sample);
        params.sample_id = Some(id);
        Ok(())
    }

    pub fn sampler_trigger(&self, mut params: TriggerParams) -> Result<(), OpError> {
        self.resolve_trigger(&mut params)?;
        self.core.lock().trigger_sample(&params)?;
        Ok(())
    }

    /// Loads a program's zones. Decoding happens outside the audio lock; the
    /// finished map is installed in one step.
    pub fn program_load(
        &self,
        inst_id: &str,
        entries: &[(i32, std::path::PathBuf)],
    ) -> Result<usize, OpError> {
        let mut zones = BTreeMap::new();
        for (note, path) in entries {
            match loader::load_sample(path) {
                Ok(sample) => {
                    zones.insert(*note, sample);
                }
                Err(e) => {
                    warn!(note, path = ?path, err = %e, "Skipping program zone");
                }
            }
        }
        if zones.is_empty() {
            return Err(OpError::new(
                ErrorCode::LoadFail,
                "no loadable samples in program",
            ));
        }

        let count = zones.len();
        self.core.lock().programs.insert(inst_id, zones);
        info!(inst_id, zones = count, "Program loaded");
        Ok(count)
    }

    pub fn program_note_on(
        &self,
        inst_id: &str,
        mix_ch: usize,
        note: i32,
        velocity: f32,
    ) -> Result<(), OpError> {
        let mut core = self.core.lock();
        if !core.programs.contains(inst_id) {
            return Err(OpError::new(
                ErrorCode::NotLoaded,
                format!("program {inst_id} is not loaded"),
            ));
        }
        if !core.start_program_note(inst_id, mix_ch, note, velocity) {
            return Err(OpError::new(
                ErrorCode::NotFound,
                format!("no sample for note {note}"),
            ));
        }
        Ok(())
    }

    pub fn program_note_off(&self, inst_id: &str, mix_ch: usize, note: i32) {
        self.core.lock().stop_program_note(inst_id, mix_ch, note);
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    pub fn schedule_clear(&self) {
        self.timeline.lock().clear();
    }

    pub fn schedule_set_window(&self, from_ppq: f64, to_ppq: f64) {
        self.timeline.lock().set_window(from_ppq, to_ppq);
    }

    pub fn schedule_push(&self, events: Vec<ScheduledEvent>) {
        self.timeline.lock().push(events);
    }

    // ------------------------------------------------------------------
    // Meters
    // ------------------------------------------------------------------

    pub fn meter_subscribe(&self, fps: u32, channels: Vec<i32>) {
        let mut sub = self.meter_sub.lock();
        sub.active = true;
        sub.fps = fps.clamp(1, 60);
        sub.channels = if channels.is_empty() {
            [crate::mixer::MASTER_METER_ID].into_iter().collect()
        } else {
            channels.into_iter().collect()
        };
    }

    pub fn meter_unsubscribe(&self) {
        let mut sub = self.meter_sub.lock();
        sub.active = false;
        sub.channels.clear();
    }

    pub fn meter_subscription(&self) -> MeterSubscription {
        self.meter_sub.lock().clone()
    }

    /// Copies the latched meter snapshot. Holds the audio mutex only for the
    /// copy; peaks reset on report.
    pub fn meter_frames(&self) -> Vec<MeterFrame> {
        let sub = self.meter_sub.lock();
        if !sub.active {
            return Vec::new();
        }
        self.core.lock().mixer.meter_frames(&sub.channels)
    }

    /// Test access to the render core.
    #[cfg(test)]
    pub fn core(&self) -> &Arc<Mutex<RenderCore>> {
        &self.core
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close_device();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;

    fn engine() -> Arc<Engine> {
        let config = EngineConfig {
            device: Some("mock".to_string()),
            ..Default::default()
        };
        Engine::new(config, Writer::new(Box::new(std::io::sink())))
    }

    #[test]
    fn test_engine_opens_mock_device() {
        let engine = engine();
        assert!(engine.is_running());
        assert_eq!(engine.engine_state()["ready"], true);
        engine.shutdown();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_config_set_reopens_and_keeps_samples() {
        let engine = engine();
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("s.wav");
        write_wav(path.clone(), vec![vec![0.5f32; 100]], 48000).unwrap();
        engine.sampler_load("s", &path).unwrap();

        let update = EngineConfigUpdate {
            sample_rate: Some(44100),
            ..Default::default()
        };
        let data = engine.set_config(&update).unwrap();
        assert_eq!(data["sampleRate"], 44100);

        // The cached sample survives the device reopen, at its native rate.
        let core = engine.core().lock();
        let sample = core.store.get("s").unwrap();
        assert_eq!(sample.sample_rate, 48000);
        drop(core);
        engine.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let engine = engine();
        let update = EngineConfigUpdate {
            sample_rate: Some(1000),
            ..Default::default()
        };
        assert!(engine.set_config(&update).is_err());
        engine.shutdown();
    }

    #[test]
    fn test_trigger_resolution_paths() {
        let engine = engine();
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("click.wav");
        write_wav(path.clone(), vec![vec![0.5f32; 64]], 48000).unwrap();

        // Unknown id with no path fails.
        let mut params = TriggerParams {
            sample_id: Some("missing".to_string()),
            ..Default::default()
        };
        assert!(engine.resolve_trigger(&mut params).is_err());

        // A path loads ad-hoc and rewrites the id.
        let mut params = TriggerParams {
            sample_path: Some(path.to_string_lossy().to_string()),
            ..Default::default()
        };
        engine.resolve_trigger(&mut params).unwrap();
        let id = params.sample_id.clone().unwrap();
        assert!(id.starts_with("adhoc:"));
        assert!(engine.core().lock().store.contains(&id));

        // A second resolve hits the cache.
        engine.resolve_trigger(&mut params).unwrap();
        engine.shutdown();
    }

    #[test]
    fn test_program_load_requires_zones() {
        let engine = engine();
        let err = engine
            .program_load("piano", &[(60, "/nonexistent.wav".into())])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadFail);

        let err = engine.program_note_on("piano", 1, 60, 1.0).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotLoaded);
        engine.shutdown();
    }

    #[test]
    fn test_meter_subscription_defaults_to_master() {
        let engine = engine();
        engine.meter_subscribe(120, vec![]);
        let sub = engine.meter_subscription();
        assert!(sub.active);
        assert_eq!(sub.fps, 60);
        assert!(sub.channels.contains(&crate::mixer::MASTER_METER_ID));

        engine.meter_unsubscribe();
        assert!(!engine.meter_subscription().active);
        assert!(engine.meter_frames().is_empty());
        engine.shutdown();
    }

    #[test]
    fn test_transport_ops() {
        let engine = engine();
        engine.transport_set_tempo(90.0);
        assert_eq!(engine.transport_snapshot().bpm, 90.0);

        engine.transport_play();
        assert!(engine.transport_snapshot().playing);

        engine.transport_stop();
        assert!(!engine.transport_snapshot().playing);

        engine.transport_seek(Some(4.0), None);
        let snapshot = engine.transport_snapshot();
        // At 90 BPM / 48kHz, beat 4 is 128000 samples. The mock device keeps
        // advancing the position in the background, so allow a little slack.
        assert!(
            (128000..128000 + 48000).contains(&snapshot.sample_pos),
            "sample_pos {}",
            snapshot.sample_pos
        );
        engine.shutdown();
    }
}
