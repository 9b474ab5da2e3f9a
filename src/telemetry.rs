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

//! The telemetry pump: periodic transport-state and meter events.
//!
//! Runs off the audio path. Transport snapshots go out at 20 Hz; meter
//! snapshots at the subscribed rate while a subscription is active. Peak
//! values are latched between reports and reset when reported.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::sleep;
use tracing::info;

use crate::engine::Engine;

/// Pump tick granularity.
const TICK: Duration = Duration::from_millis(10);
/// Transport snapshots go out at 20 Hz.
const TRANSPORT_INTERVAL: Duration = Duration::from_millis(50);

/// Runs the pump until the engine shuts down.
pub async fn run(engine: Arc<Engine>) {
    info!("Telemetry pump started");

    let mut last_transport = Instant::now();
    let mut last_meter = Instant::now();

    while engine.is_running() {
        sleep(TICK).await;
        let now = Instant::now();

        if now.duration_since(last_transport) >= TRANSPORT_INTERVAL {
            last_transport = now;
            engine.emit_transport_state();
        }

        let sub = engine.meter_subscription();
        if sub.active {
            let interval = Duration::from_millis(1000 / u64::from(sub.fps.max(1)));
            if now.duration_since(last_meter) >= interval {
                last_meter = now;
                let frames = engine.meter_frames();
                if let Ok(frames) = serde_json::to_value(frames) {
                    engine.writer().event("meter.level", json!({ "frames": frames }));
                }
            }
        }
    }

    info!("Telemetry pump stopped");
}
