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

//! The request router: one typed request variant per opcode.
//!
//! Every inbound line becomes exactly one reply. Field validation happens
//! here, so the audio thread only ever sees typed structs. Unparseable lines
//! are skipped with a debug log.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{Engine, FxUnitSpec, OpError};
use crate::mixer::{ChannelParams, FxTarget, MasterParams};
use crate::proto::{ErrorCode, Request};
use crate::sampler::TriggerParams;
use crate::schedule::{EventKind, ScheduledEvent};
use crate::synth::instrument::InstrumentParams;

/// Parses a request's `data` object into the opcode's typed struct.
fn parse<T: DeserializeOwned>(data: Value) -> Result<T, OpError> {
    serde_json::from_value(data)
        .map_err(|e| OpError::new(ErrorCode::BadRequest, e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteData {
    #[serde(default = "default_inst_id")]
    inst_id: String,
    #[serde(default = "default_mix_ch")]
    mix_ch: usize,
    #[serde(default = "default_note")]
    note: i32,
    #[serde(default = "default_vel", alias = "velocity")]
    vel: f64,
}

fn default_inst_id() -> String {
    "global".to_string()
}
fn default_mix_ch() -> usize {
    1
}
fn default_note() -> i32 {
    60
}
fn default_vel() -> f64 {
    0.85
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeekData {
    ppq: Option<f64>,
    sample_pos: Option<u64>,
}

#[derive(Deserialize)]
struct TempoData {
    bpm: f64,
}

#[derive(Deserialize)]
struct MixerInitData {
    channels: usize,
}

#[derive(Deserialize)]
struct MixerParamSetData {
    #[serde(default = "default_scope")]
    scope: String,
    #[serde(default)]
    ch: usize,
    param: String,
    #[serde(default)]
    value: Value,
}

fn default_scope() -> String {
    "master".to_string()
}

#[derive(Deserialize)]
struct ChannelSetData {
    #[serde(default)]
    ch: usize,
    #[serde(flatten)]
    params: ChannelParams,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FxTargetData {
    #[serde(default = "default_scope")]
    scope: String,
    #[serde(default)]
    ch: usize,
}

#[derive(Deserialize)]
struct FxChainSetData {
    target: Option<FxTargetData>,
    #[serde(default)]
    chain: Vec<FxUnitSpec>,
}

#[derive(Deserialize)]
struct FxParamSetData {
    target: Option<FxTargetData>,
    id: String,
    #[serde(rename = "type")]
    type_tag: Option<String>,
    params: Option<crate::mixer::fx::FxParams>,
}

#[derive(Deserialize)]
struct FxBypassData {
    target: Option<FxTargetData>,
    id: String,
    #[serde(default)]
    bypass: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstCreateData {
    inst_id: String,
    #[serde(rename = "type", default = "default_inst_kind")]
    kind: String,
}

fn default_inst_kind() -> String {
    "piano".to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstParamSetData {
    inst_id: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    params: InstrumentParams,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SamplerLoadData {
    sample_id: String,
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SamplerUnloadData {
    sample_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneSpec {
    #[serde(alias = "rootMidi", default = "default_note")]
    note: i32,
    #[serde(alias = "samplePath", alias = "relativePath")]
    path: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramLoadData {
    inst_id: String,
    #[serde(default)]
    samples: Vec<ZoneSpec>,
    program_path: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleWindowData {
    #[serde(default)]
    from_ppq: f64,
    #[serde(default)]
    to_ppq: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(default)]
    at_ppq: f64,
    #[serde(rename = "type", default = "default_event_type")]
    kind: String,
    #[serde(default = "default_inst_id")]
    inst_id: String,
    #[serde(default = "default_mix_ch")]
    mix_ch: usize,
    #[serde(default = "default_note")]
    note: i32,
    #[serde(default = "default_vel", alias = "velocity")]
    vel: f64,
    #[serde(default = "default_dur_ppq")]
    dur_ppq: f64,
    payload: Option<Value>,
}

fn default_event_type() -> String {
    "note.on".to_string()
}
fn default_dur_ppq() -> f64 {
    0.25
}

#[derive(Deserialize)]
struct SchedulePushData {
    events: Vec<WireEvent>,
}

#[derive(Deserialize)]
struct MeterSubscribeData {
    #[serde(default = "default_meter_fps")]
    fps: u32,
    #[serde(default)]
    channels: Vec<i32>,
}

fn default_meter_fps() -> u32 {
    30
}

/// Dispatches parsed requests against the engine.
pub struct Router {
    engine: Arc<Engine>,
}

impl Router {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Handles one raw input line: parse, dispatch, reply.
    pub fn handle_line(&self, line: &str) {
        let request = match Request::parse(line) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!(
                    err = %e,
                    code = ErrorCode::BadJson.as_str(),
                    "Skipping unparseable input line"
                );
                return;
            }
        };

        let op = request.op.clone();
        let id = request.id.clone();
        match self.dispatch(&op, request.data) {
            Ok(data) => self.engine.writer().ok(&op, &id, data),
            Err(e) => self.engine.writer().err(&op, &id, e.code, &e.message),
        }
    }

    fn dispatch(&self, op: &str, data: Value) -> Result<Value, OpError> {
        let engine = &self.engine;
        match op {
            "engine.hello" => Ok(engine.hello_data()),
            "engine.ping" => Ok(data),
            "engine.state.get" => Ok(engine.engine_state()),
            "engine.config.get" => Ok(engine.engine_config()),
            "engine.config.set" => engine.set_config(&parse(data)?),
            "engine.shutdown" => {
                engine.shutdown();
                Ok(Value::Null)
            }

            "transport.play" => {
                engine.transport_play();
                Ok(Value::Null)
            }
            "transport.stop" => {
                engine.transport_stop();
                Ok(Value::Null)
            }
            "transport.seek" => {
                let seek: SeekData = parse(data)?;
                engine.transport_seek(seek.ppq, seek.sample_pos);
                Ok(Value::Null)
            }
            "transport.setTempo" => {
                let tempo: TempoData = parse(data)?;
                if tempo.bpm < crate::transport::MIN_BPM {
                    return Err(OpError::new(
                        ErrorCode::BadRequest,
                        format!("bpm must be >= {}", crate::transport::MIN_BPM),
                    ));
                }
                engine.transport_set_tempo(tempo.bpm);
                Ok(Value::Null)
            }
            "transport.state.get" => serde_json::to_value(engine.transport_snapshot())
                .map_err(|e| OpError::new(ErrorCode::BadRequest, e.to_string())),

            "mixer.init" => {
                let init: MixerInitData = parse(data)?;
                engine.mixer_init(init.channels)?;
                Ok(Value::Null)
            }
            "mixer.param.set" => {
                let set: MixerParamSetData = parse(data)?;
                self.mixer_param_set(set)?;
                Ok(Value::Null)
            }
            "mixer.master.set" => {
                let params: MasterParams = parse(data)?;
                engine.mixer_set_master(&params);
                Ok(Value::Null)
            }
            "mixer.channel.set" => {
                let set: ChannelSetData = parse(data)?;
                engine.mixer_set_channel(set.ch, &set.params)?;
                Ok(Value::Null)
            }

            "fx.chain.set" => {
                let set: FxChainSetData = parse(data)?;
                engine.fx_chain_set(fx_target(set.target), &set.chain)?;
                Ok(Value::Null)
            }
            "fx.param.set" => {
                let set: FxParamSetData = parse(data)?;
                engine.fx_param_set(
                    fx_target(set.target),
                    &set.id,
                    set.type_tag.as_deref(),
                    &set.params.unwrap_or_default(),
                )?;
                Ok(Value::Null)
            }
            "fx.bypass.set" => {
                let set: FxBypassData = parse(data)?;
                engine.fx_bypass_set(fx_target(set.target), &set.id, set.bypass)?;
                Ok(Value::Null)
            }

            "inst.create" => {
                let create: InstCreateData = parse(data)?;
                engine.inst_create(&create.inst_id, &create.kind);
                Ok(Value::Null)
            }
            "inst.param.set" => {
                let set: InstParamSetData = parse(data)?;
                engine.inst_param_set(&set.inst_id, set.kind.as_deref(), &set.params);
                Ok(Value::Null)
            }

            "note.on" | "midi.noteOn" => {
                let note: NoteData = parse(data)?;
                engine.note_on(&note.inst_id, note.mix_ch, note.note, note.vel as f32);
                Ok(Value::Null)
            }
            "note.off" | "midi.noteOff" => {
                let note: NoteData = parse(data)?;
                engine.note_off(&note.inst_id, note.mix_ch, note.note);
                Ok(Value::Null)
            }
            "note.allOff" | "midi.panic" => {
                engine.note_all_off();
                Ok(Value::Null)
            }

            "sampler.load" => {
                let load: SamplerLoadData = parse(data)?;
                engine.sampler_load(&load.sample_id, std::path::Path::new(&load.path))?;
                Ok(Value::Null)
            }
            "sampler.unload" => {
                let unload: SamplerUnloadData = parse(data)?;
                engine.sampler_unload(&unload.sample_id);
                Ok(Value::Null)
            }
            "sampler.trigger" => {
                let params: TriggerParams = parse(data)?;
                engine.sampler_trigger(params)?;
                Ok(Value::Null)
            }

            "program.load" => {
                let load: ProgramLoadData = parse(data)?;
                let entries = program_entries(&load)?;
                let zones = engine.program_load(&load.inst_id, &entries)?;
                Ok(serde_json::json!({ "zones": zones }))
            }
            "program.note.on" => {
                let note: NoteData = parse(data)?;
                engine.program_note_on(&note.inst_id, note.mix_ch, note.note, note.vel as f32)?;
                Ok(Value::Null)
            }
            "program.note.off" => {
                let note: NoteData = parse(data)?;
                engine.program_note_off(&note.inst_id, note.mix_ch, note.note);
                Ok(Value::Null)
            }

            "schedule.clear" => {
                engine.schedule_clear();
                Ok(Value::Null)
            }
            "schedule.setWindow" => {
                let window: ScheduleWindowData = parse(data)?;
                engine.schedule_set_window(window.from_ppq, window.to_ppq);
                Ok(Value::Null)
            }
            "schedule.push" => {
                let push: SchedulePushData = parse(data)?;
                let events = self.convert_events(push.events);
                engine.schedule_push(events);
                Ok(Value::Null)
            }

            "meter.subscribe" => {
                let sub: MeterSubscribeData = parse(data)?;
                engine.meter_subscribe(sub.fps, sub.channels);
                Ok(Value::Null)
            }
            "meter.unsubscribe" => {
                engine.meter_unsubscribe();
                Ok(Value::Null)
            }

            _ => Err(OpError::new(ErrorCode::UnknownOp, "Unknown opcode")),
        }
    }

    fn mixer_param_set(&self, set: MixerParamSetData) -> Result<(), OpError> {
        let value = set
            .value
            .as_f64()
            .or_else(|| set.value.as_bool().map(|b| if b { 1.0 } else { 0.0 }))
            .unwrap_or(0.0);

        if set.scope == "master" {
            let params = match set.param.as_str() {
                "gain" => MasterParams {
                    gain: Some(value),
                    ..Default::default()
                },
                "crossfader" => MasterParams {
                    crossfader: Some(value),
                    ..Default::default()
                },
                other => {
                    return Err(OpError::new(
                        ErrorCode::BadRequest,
                        format!("unknown master param {other}"),
                    ))
                }
            };
            self.engine.mixer_set_master(&params);
            return Ok(());
        }

        let mut params = ChannelParams::default();
        match set.param.as_str() {
            "gain" => params.gain = Some(value),
            "pan" => params.pan = Some(value),
            "eqLow" => params.eq_low = Some(value),
            "eqMid" => params.eq_mid = Some(value),
            "eqHigh" => params.eq_high = Some(value),
            "mute" => params.mute = Some(value >= 0.5),
            "solo" => params.solo = Some(value >= 0.5),
            other => {
                return Err(OpError::new(
                    ErrorCode::BadRequest,
                    format!("unknown channel param {other}"),
                ))
            }
        }
        self.engine.mixer_set_channel(set.ch, &params)
    }

    /// Converts wire events into typed scheduler events. Sampler triggers
    /// resolve their sample now, on the control thread, so dispatch inside
    /// the callback is a pure cache lookup. Events that cannot be resolved
    /// or have an unknown type are skipped.
    fn convert_events(&self, wire_events: Vec<WireEvent>) -> Vec<ScheduledEvent> {
        let mut events = Vec::with_capacity(wire_events.len());
        for wire in wire_events {
            let kind = match wire.kind.as_str() {
                "note.on" | "midi.noteOn" => EventKind::NoteOn,
                "note.off" | "midi.noteOff" => EventKind::NoteOff,
                "program.note.on" => EventKind::ProgramOn,
                "program.note.off" => EventKind::ProgramOff,
                "sampler.trigger" => {
                    let payload = wire.payload.clone().unwrap_or(Value::Null);
                    let mut params: TriggerParams = match serde_json::from_value(payload) {
                        Ok(params) => params,
                        Err(e) => {
                            warn!(err = %e, "Skipping sampler.trigger event with bad payload");
                            continue;
                        }
                    };
                    if let Err(e) = self.engine.resolve_trigger(&mut params) {
                        warn!(err = e.message, "Skipping unresolvable sampler.trigger event");
                        continue;
                    }
                    EventKind::SamplerTrigger(Arc::new(params))
                }
                other => {
                    warn!(kind = other, "Skipping scheduled event of unknown type");
                    continue;
                }
            };

            events.push(ScheduledEvent {
                at_ppq: wire.at_ppq,
                kind,
                inst_id: Arc::from(wire.inst_id.as_str()),
                mix_ch: wire.mix_ch,
                note: wire.note,
                vel: wire.vel.clamp(0.0, 1.0) as f32,
                dur_ppq: wire.dur_ppq,
            });
        }
        events
    }
}

fn fx_target(target: Option<FxTargetData>) -> FxTarget {
    match target {
        Some(target) if target.scope == "ch" || target.scope == "channel" => {
            FxTarget::Channel(target.ch)
        }
        _ => FxTarget::Master,
    }
}

/// Expands `program.load` data into (note, path) pairs, reading the manifest
/// file when inline samples are absent.
fn program_entries(load: &ProgramLoadData) -> Result<Vec<(i32, PathBuf)>, OpError> {
    let mut entries: Vec<(i32, PathBuf)> = load
        .samples
        .iter()
        .filter_map(|zone| {
            zone.path
                .as_ref()
                .map(|path| (zone.note, PathBuf::from(path)))
        })
        .collect();

    if entries.is_empty() {
        let Some(program_path) = &load.program_path else {
            return Err(OpError::new(
                ErrorCode::BadRequest,
                "samples[] or programPath required",
            ));
        };
        entries = parse_program_manifest(std::path::Path::new(program_path))?;
    }

    Ok(entries)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgramManifest {
    #[serde(default)]
    zones: Vec<ZoneSpec>,
    #[serde(default)]
    samples: Vec<ZoneSpec>,
}

/// Parses a program manifest: a JSON file with `zones` (or `samples`)
/// entries of `{note, path}`. Relative paths resolve against the manifest's
/// directory.
fn parse_program_manifest(path: &std::path::Path) -> Result<Vec<(i32, PathBuf)>, OpError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| OpError::new(ErrorCode::LoadFail, format!("{}: {e}", path.display())))?;
    let manifest: ProgramManifest = serde_json::from_str(&text)
        .map_err(|e| OpError::new(ErrorCode::LoadFail, format!("{}: {e}", path.display())))?;

    let base = path.parent().map(PathBuf::from).unwrap_or_default();
    let zones = if manifest.zones.is_empty() {
        manifest.samples
    } else {
        manifest.zones
    };

    Ok(zones
        .into_iter()
        .filter_map(|zone| {
            let path = PathBuf::from(zone.path?);
            let path = if path.is_absolute() {
                path
            } else {
                base.join(path)
            };
            Some((zone.note, path))
        })
        .collect())
}

/// Runs the control loop: reads line-delimited requests from stdin on a
/// blocking task and dispatches them until shutdown or EOF.
pub async fn run(engine: Arc<Engine>) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });

    info!("Control loop started");
    let router = Router::new(engine.clone());
    while engine.is_running() {
        match line_rx.recv().await {
            Some(line) => {
                if line.is_empty() {
                    continue;
                }
                router.handle_line(&line);
            }
            // EOF on stdin: the host went away.
            None => break,
        }
    }
    engine.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::proto::capture_writer;
    use crate::testutil::write_wav;

    fn setup() -> (Router, Arc<Engine>, impl Fn() -> Vec<Value>) {
        let (writer, read) = capture_writer();
        let config = EngineConfig {
            device: Some("mock".to_string()),
            ..Default::default()
        };
        let engine = Engine::new(config, writer);
        (Router::new(engine.clone()), engine, read)
    }

    fn request(op: &str, id: &str, data: Value) -> String {
        serde_json::json!({
            "v": 1,
            "type": "req",
            "op": op,
            "id": id,
            "data": data,
        })
        .to_string()
    }

    fn response_for<'a>(records: &'a [Value], id: &str) -> &'a Value {
        records
            .iter()
            .find(|r| r["type"] == "res" && r["id"] == id)
            .unwrap_or_else(|| panic!("no response with id {id}"))
    }

    #[test]
    fn test_hello() {
        let (router, engine, read) = setup();
        router.handle_line(&request("engine.hello", "1", Value::Null));

        let records = read();
        let res = response_for(&records, "1");
        assert_eq!(res["ok"], true);
        assert_eq!(res["data"]["protocol"], "stagemix-ipc/1.0");
        assert!(res["data"]["capabilities"]["scheduler"].as_bool().unwrap());
        engine.shutdown();
    }

    #[test]
    fn test_unknown_op() {
        let (router, engine, read) = setup();
        router.handle_line(&request("nope.nope", "2", Value::Null));

        let records = read();
        let res = response_for(&records, "2");
        assert_eq!(res["ok"], false);
        assert_eq!(res["err"]["code"], "E_UNKNOWN_OP");
        engine.shutdown();
    }

    #[test]
    fn test_bad_request_fields() {
        let (router, engine, read) = setup();
        // setTempo without bpm.
        router.handle_line(&request("transport.setTempo", "3", serde_json::json!({})));
        // bpm below the floor.
        router.handle_line(&request(
            "transport.setTempo",
            "4",
            serde_json::json!({"bpm": 5}),
        ));

        let records = read();
        assert_eq!(response_for(&records, "3")["err"]["code"], "E_BAD_REQUEST");
        assert_eq!(response_for(&records, "4")["err"]["code"], "E_BAD_REQUEST");
        engine.shutdown();
    }

    #[test]
    fn test_unparseable_lines_are_skipped() {
        let (router, engine, read) = setup();
        router.handle_line("this is not json");
        router.handle_line(r#"{"v":1,"type":"evt","op":"x","id":"y"}"#);

        let records = read();
        assert!(records.iter().all(|r| r["type"] != "res"));
        engine.shutdown();
    }

    #[test]
    fn test_schedule_push_and_clear() {
        let (router, engine, read) = setup();
        router.handle_line(&request(
            "schedule.push",
            "5",
            serde_json::json!({
                "events": [
                    {"atPpq": 1.0, "type": "note.on", "instId": "a", "mixCh": 1, "note": 60, "vel": 1.0},
                    {"atPpq": 1.5, "type": "note.off", "instId": "a", "mixCh": 1, "note": 60},
                    {"atPpq": 2.0, "type": "wat"},
                ]
            }),
        ));

        let records = read();
        assert_eq!(response_for(&records, "5")["ok"], true);

        // The unknown event type was dropped; the others made it in.
        router.handle_line(&request("schedule.clear", "6", Value::Null));
        let records = read();
        assert_eq!(response_for(&records, "6")["ok"], true);
        engine.shutdown();
    }

    #[test]
    fn test_schedule_push_requires_events() {
        let (router, engine, read) = setup();
        router.handle_line(&request("schedule.push", "7", serde_json::json!({})));
        let records = read();
        assert_eq!(response_for(&records, "7")["err"]["code"], "E_BAD_REQUEST");
        engine.shutdown();
    }

    #[test]
    fn test_sampler_load_trigger_unload() {
        let (router, engine, read) = setup();
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("click.wav");
        write_wav(path.clone(), vec![vec![0.5f32; 100]], 48000).unwrap();

        router.handle_line(&request(
            "sampler.load",
            "10",
            serde_json::json!({"sampleId": "click", "path": path.to_str().unwrap()}),
        ));
        router.handle_line(&request(
            "sampler.trigger",
            "11",
            serde_json::json!({"sampleId": "click", "note": 60, "rootMidi": 60}),
        ));
        router.handle_line(&request(
            "sampler.unload",
            "12",
            serde_json::json!({"sampleId": "click"}),
        ));
        router.handle_line(&request(
            "sampler.trigger",
            "13",
            serde_json::json!({"sampleId": "click"}),
        ));

        let records = read();
        assert_eq!(response_for(&records, "10")["ok"], true);
        assert_eq!(response_for(&records, "11")["ok"], true);
        assert_eq!(response_for(&records, "12")["ok"], true);
        assert_eq!(response_for(&records, "13")["err"]["code"], "E_NOT_LOADED");
        engine.shutdown();
    }

    #[test]
    fn test_sampler_load_missing_file() {
        let (router, engine, read) = setup();
        router.handle_line(&request(
            "sampler.load",
            "14",
            serde_json::json!({"sampleId": "x", "path": "/does/not/exist.wav"}),
        ));
        let records = read();
        assert_eq!(response_for(&records, "14")["err"]["code"], "E_LOAD_FAIL");
        engine.shutdown();
    }

    #[test]
    fn test_program_load_from_manifest() {
        let (router, engine, read) = setup();
        let tempdir = tempfile::tempdir().unwrap();
        write_wav(tempdir.path().join("c4.wav"), vec![vec![0.5f32; 64]], 48000).unwrap();
        write_wav(tempdir.path().join("g4.wav"), vec![vec![0.5f32; 64]], 48000).unwrap();

        let manifest = tempdir.path().join("program.json");
        std::fs::write(
            &manifest,
            r#"{"zones": [{"note": 60, "path": "c4.wav"}, {"note": 67, "path": "g4.wav"}]}"#,
        )
        .unwrap();

        router.handle_line(&request(
            "program.load",
            "20",
            serde_json::json!({"instId": "keys", "programPath": manifest.to_str().unwrap()}),
        ));
        router.handle_line(&request(
            "program.note.on",
            "21",
            serde_json::json!({"instId": "keys", "mixCh": 1, "note": 64}),
        ));
        router.handle_line(&request(
            "program.note.on",
            "22",
            serde_json::json!({"instId": "strings", "note": 64}),
        ));

        let records = read();
        assert_eq!(response_for(&records, "20")["data"]["zones"], 2);
        assert_eq!(response_for(&records, "21")["ok"], true);
        assert_eq!(response_for(&records, "22")["err"]["code"], "E_NOT_LOADED");
        engine.shutdown();
    }

    #[test]
    fn test_mixer_param_routes() {
        let (router, engine, read) = setup();
        router.handle_line(&request(
            "mixer.init",
            "30",
            serde_json::json!({"channels": 8}),
        ));
        router.handle_line(&request(
            "mixer.param.set",
            "31",
            serde_json::json!({"scope": "channel", "ch": 2, "param": "solo", "value": 1}),
        ));
        router.handle_line(&request(
            "mixer.param.set",
            "32",
            serde_json::json!({"scope": "master", "param": "crossfader", "value": -0.5}),
        ));
        router.handle_line(&request(
            "mixer.param.set",
            "33",
            serde_json::json!({"scope": "channel", "ch": 2, "param": "wat", "value": 0}),
        ));
        router.handle_line(&request(
            "mixer.init",
            "34",
            serde_json::json!({"channels": 0}),
        ));

        let records = read();
        assert_eq!(response_for(&records, "30")["ok"], true);
        assert_eq!(response_for(&records, "31")["ok"], true);
        assert_eq!(response_for(&records, "32")["ok"], true);
        assert_eq!(response_for(&records, "33")["err"]["code"], "E_BAD_REQUEST");
        assert_eq!(response_for(&records, "34")["err"]["code"], "E_BAD_REQUEST");

        let core = engine.core().lock();
        assert!(core.mixer.strip(2).unwrap().solo);
        assert_eq!(core.mixer.crossfader, -0.5);
        drop(core);
        engine.shutdown();
    }

    #[test]
    fn test_fx_ops() {
        let (router, engine, read) = setup();
        router.handle_line(&request(
            "fx.chain.set",
            "40",
            serde_json::json!({
                "target": {"scope": "ch", "ch": 1},
                "chain": [
                    {"id": "rv", "type": "reverb", "params": {"mix": 0.5}},
                    {"id": "dl", "type": "delay", "params": {"timeSync": "1:8"}},
                ]
            }),
        ));
        router.handle_line(&request(
            "fx.param.set",
            "41",
            serde_json::json!({"target": {"scope": "ch", "ch": 1}, "id": "dl", "params": {"feedback": 0.5}}),
        ));
        router.handle_line(&request(
            "fx.bypass.set",
            "42",
            serde_json::json!({"target": {"scope": "ch", "ch": 1}, "id": "rv", "bypass": true}),
        ));
        // Upsert into the master chain.
        router.handle_line(&request(
            "fx.param.set",
            "43",
            serde_json::json!({"id": "comp", "type": "compressor", "params": {"threshold": -18}}),
        ));

        let records = read();
        for id in ["40", "41", "42", "43"] {
            assert_eq!(response_for(&records, id)["ok"], true, "id {id}");
        }

        let mut core = engine.core().lock();
        let chain = core.mixer.fx_chain_mut(FxTarget::Channel(1)).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].bypass);
        let master = core.mixer.fx_chain_mut(FxTarget::Master).unwrap();
        assert_eq!(master.len(), 1);
        assert_eq!(master[0].id, "comp");
        drop(core);
        engine.shutdown();
    }

    #[test]
    fn test_transport_and_state_ops() {
        let (router, engine, read) = setup();
        router.handle_line(&request("transport.setTempo", "50", serde_json::json!({"bpm": 140})));
        router.handle_line(&request("transport.play", "51", Value::Null));
        router.handle_line(&request("transport.state.get", "52", Value::Null));
        router.handle_line(&request("transport.stop", "53", Value::Null));
        router.handle_line(&request("engine.state.get", "54", Value::Null));

        let records = read();
        let state = response_for(&records, "52");
        assert_eq!(state["data"]["bpm"], 140.0);
        assert_eq!(state["data"]["playing"], true);
        assert_eq!(response_for(&records, "54")["data"]["ready"], true);

        // transport.play and transport.stop also emit transport.state events.
        assert!(records
            .iter()
            .filter(|r| r["type"] == "evt" && r["op"] == "transport.state")
            .count() >= 2);
        engine.shutdown();
    }

    #[test]
    fn test_note_ops_reach_voice_pool() {
        let (router, engine, read) = setup();
        router.handle_line(&request(
            "inst.param.set",
            "60",
            serde_json::json!({"instId": "lead", "params": {"waveform": "saw", "gain": 0.5}}),
        ));
        router.handle_line(&request(
            "note.on",
            "61",
            serde_json::json!({"instId": "lead", "mixCh": 1, "note": 64, "velocity": 0.9}),
        ));

        let records = read();
        assert_eq!(response_for(&records, "60")["ok"], true);
        assert_eq!(response_for(&records, "61")["ok"], true);
        assert_eq!(engine.core().lock().tones.active_count(), 1);

        router.handle_line(&request("note.allOff", "62", Value::Null));
        assert_eq!(engine.core().lock().tones.active_count(), 0);
        engine.shutdown();
    }

    /// An engine whose device cannot open, so nothing renders in the
    /// background and blocks can be pulled by hand deterministically.
    fn setup_unrendered() -> (Router, Arc<Engine>, impl Fn() -> Vec<Value>) {
        let (writer, read) = capture_writer();
        let config = EngineConfig {
            device: Some("no-such-device".to_string()),
            ..Default::default()
        };
        let engine = Engine::new(config, writer);
        (Router::new(engine.clone()), engine, read)
    }

    fn render_blocks(engine: &Engine, blocks: usize) -> Vec<f32> {
        let mut out = Vec::new();
        let mut buf = vec![0.0f32; 512 * 2];
        for _ in 0..blocks {
            engine.core().lock().render(&mut buf, 2);
            out.extend_from_slice(&buf);
        }
        out
    }

    #[test]
    fn test_solo_channel_isolates_master_bus() {
        // Solo channel 3, then play notes on channels 2 and 3. The master
        // bus must carry only channel 3's signal.
        let (router, engine, read) = setup_unrendered();
        router.handle_line(&request(
            "mixer.channel.set",
            "1",
            serde_json::json!({"ch": 3, "solo": true}),
        ));
        router.handle_line(&request(
            "note.on",
            "2",
            serde_json::json!({"instId": "a", "mixCh": 2, "note": 60, "velocity": 1.0}),
        ));
        router.handle_line(&request(
            "note.on",
            "3",
            serde_json::json!({"instId": "b", "mixCh": 3, "note": 64, "velocity": 1.0}),
        ));
        let records = read();
        for id in ["1", "2", "3"] {
            assert_eq!(response_for(&records, id)["ok"], true, "id {id}");
        }
        let both = render_blocks(&engine, 8);

        // The same setup with only the channel-3 note renders the identical
        // signal: channel 2 contributes nothing.
        let (router_solo, engine_solo, _) = setup_unrendered();
        router_solo.handle_line(&request(
            "mixer.channel.set",
            "1",
            serde_json::json!({"ch": 3, "solo": true}),
        ));
        router_solo.handle_line(&request(
            "note.on",
            "2",
            serde_json::json!({"instId": "b", "mixCh": 3, "note": 64, "velocity": 1.0}),
        ));
        let solo_only = render_blocks(&engine_solo, 8);

        assert!(both.iter().any(|&s| s != 0.0));
        assert_eq!(both, solo_only);

        // And a note on the non-soloed channel alone is silenced entirely.
        let (router_muted, engine_muted, _) = setup_unrendered();
        router_muted.handle_line(&request(
            "mixer.channel.set",
            "1",
            serde_json::json!({"ch": 3, "solo": true}),
        ));
        router_muted.handle_line(&request(
            "note.on",
            "2",
            serde_json::json!({"instId": "a", "mixCh": 2, "note": 60, "velocity": 1.0}),
        ));
        let muted = render_blocks(&engine_muted, 8);
        assert!(muted.iter().all(|&s| s == 0.0));

        engine.shutdown();
        engine_solo.shutdown();
        engine_muted.shutdown();
    }

    #[test]
    fn test_ping_echoes_data() {
        let (router, engine, read) = setup();
        router.handle_line(&request("engine.ping", "70", serde_json::json!({"x": 42})));
        let records = read();
        assert_eq!(response_for(&records, "70")["data"]["x"], 42);
        engine.shutdown();
    }
}
