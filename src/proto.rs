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

//! Wire protocol framing: one JSON object per line on stdin and stdout.
//!
//! Requests look like `{v:1, type:"req", op, id, data, ts}`. Replies and
//! events are `{v:1, type:"res"|"evt", op, id, ts, ok?, data?, err?}`.

use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_NAME: &str = "stagemix-ipc/1.0";

/// Wire error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownOp,
    BadRequest,
    LoadFail,
    NotLoaded,
    NotFound,
    TriggerFail,
    DeviceFail,
    BadJson,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownOp => "E_UNKNOWN_OP",
            ErrorCode::BadRequest => "E_BAD_REQUEST",
            ErrorCode::LoadFail => "E_LOAD_FAIL",
            ErrorCode::NotLoaded => "E_NOT_LOADED",
            ErrorCode::NotFound => "E_NOT_FOUND",
            ErrorCode::TriggerFail => "E_TRIGGER_FAIL",
            ErrorCode::DeviceFail => "E_DEVICE_FAIL",
            ErrorCode::BadJson => "E_BAD_JSON",
        }
    }
}

/// An inbound request envelope.
#[derive(Debug, Deserialize)]
pub struct Request {
    // Envelope bookkeeping fields; carried for forward compatibility.
    #[serde(default)]
    #[allow(dead_code)]
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub op: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    #[allow(dead_code)]
    pub ts: Option<i64>,
}

impl Request {
    /// Parses one input line. Returns None for lines that are not requests.
    pub fn parse(line: &str) -> Result<Option<Request>, serde_json::Error> {
        let request: Request = serde_json::from_str(line)?;
        if request.kind != "req" {
            return Ok(None);
        }
        Ok(Some(request))
    }
}

/// Unix milliseconds, the `ts` of every outbound record.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Serializes outbound records onto a shared line-oriented writer. Cloned
/// into the router, engine, and telemetry pump; the mutex keeps lines whole.
#[derive(Clone)]
pub struct Writer {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Writer {
    pub fn stdout() -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
        }
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    fn write(&self, value: &Value) {
        let mut out = self.out.lock();
        // Output records are engine-generated, so serialization cannot fail;
        // a broken pipe just means the host went away.
        if serde_json::to_writer(&mut *out, value).is_ok() {
            let _ = out.write_all(b"\n");
            let _ = out.flush();
        }
    }

    /// Writes a successful response.
    pub fn ok(&self, op: &str, id: &str, data: Value) {
        self.write(&json!({
            "v": PROTOCOL_VERSION,
            "type": "res",
            "op": op,
            "id": id,
            "ts": now_ms(),
            "ok": true,
            "data": data,
        }));
    }

    /// Writes a failing response.
    pub fn err(&self, op: &str, id: &str, code: ErrorCode, message: &str) {
        self.write(&json!({
            "v": PROTOCOL_VERSION,
            "type": "res",
            "op": op,
            "id": id,
            "ts": now_ms(),
            "ok": false,
            "err": { "code": code.as_str(), "message": message },
        }));
    }

    /// Writes an event.
    pub fn event(&self, op: &str, data: Value) {
        let ts = now_ms();
        self.write(&json!({
            "v": PROTOCOL_VERSION,
            "type": "evt",
            "op": op,
            "id": format!("evt-{ts}"),
            "ts": ts,
            "data": data,
        }));
    }
}

/// A serializable transport snapshot, shared by responses and events.
#[derive(Debug, Serialize)]
pub struct TransportSnapshot {
    pub playing: bool,
    pub bpm: f64,
    pub ppq: f64,
    #[serde(rename = "samplePos")]
    pub sample_pos: u64,
}

/// A writer backed by a shared buffer, plus a reader for the JSON records
/// written so far. Test-only.
#[cfg(test)]
pub fn capture_writer() -> (Writer, impl Fn() -> Vec<Value>) {
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let buf = SharedBuf::default();
    let reader = {
        let buf = buf.clone();
        move || -> Vec<Value> {
            let data = buf.0.lock().clone();
            String::from_utf8_lossy(&data)
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect()
        }
    };
    (Writer::new(Box::new(buf)), reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_request() {
        let line = r#"{"v":1,"type":"req","op":"engine.hello","id":"1","data":{}}"#;
        let request = Request::parse(line).unwrap().unwrap();
        assert_eq!(request.op, "engine.hello");
        assert_eq!(request.id, "1");

        // Non-request records are skipped, not errors.
        let evt = r#"{"v":1,"type":"evt","op":"x","id":"2"}"#;
        assert!(Request::parse(evt).unwrap().is_none());

        // Garbage is an error.
        assert!(Request::parse("not json").is_err());
    }

    #[test]
    fn test_response_lines_are_json() {
        let buf = SharedBuf::default();
        let writer = Writer::new(Box::new(buf.clone()));
        writer.ok("engine.hello", "42", serde_json::json!({"x": 1}));
        writer.err("nope", "43", ErrorCode::UnknownOp, "Unknown opcode");

        let data = buf.0.lock().clone();
        let text = String::from_utf8(data).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let ok: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(ok["type"], "res");
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["id"], "42");

        let err: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(err["ok"], false);
        assert_eq!(err["err"]["code"], "E_UNKNOWN_OP");
    }
}
