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

//! The realtime render core: everything the audio callback touches.
//!
//! The device callback locks the core once per block and calls
//! [`RenderCore::render`]. Control operations that mutate audio state take
//! the same lock, so the callback never observes a half-applied change. The
//! hot path performs no allocation: buses and the block event buffer are
//! sized up front and reused.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::mixer::Mixer;
use crate::sampler::program::ProgramMap;
use crate::sampler::store::SampleStore;
use crate::sampler::voice::{SamplerPool, SamplerVoice};
use crate::sampler::TriggerParams;
use crate::schedule::{BlockEvent, EventKind, ScheduledEvent, Timeline};
use crate::synth::instrument::InstrumentRegistry;
use crate::synth::voice::TonePool;
use crate::transport::Transport;

/// Pre-reserved block event capacity; pushes beyond this are the only
/// allocation the callback can make, on pathologically dense timelines.
const BLOCK_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger carries neither sampleId nor samplePath")]
    MissingSample,

    #[error("sample {0} is not loaded")]
    NotLoaded(String),

    #[error("sample {0} is too short to play")]
    TooShort(String),
}

/// The single mutable audio state, guarded by the audio mutex.
pub struct RenderCore {
    sample_rate: f64,
    buffer_size: usize,
    pub mixer: Mixer,
    pub tones: TonePool,
    pub samplers: SamplerPool,
    pub instruments: InstrumentRegistry,
    pub programs: ProgramMap,
    pub store: SampleStore,
    timeline: Arc<Mutex<Timeline>>,
    transport: Arc<Transport>,
    block_events: Vec<BlockEvent>,
    bus_l: Vec<f32>,
    bus_r: Vec<f32>,
}

impl RenderCore {
    pub fn new(
        sample_rate: f64,
        buffer_size: usize,
        channels: usize,
        timeline: Arc<Mutex<Timeline>>,
        transport: Arc<Transport>,
    ) -> Self {
        let mixer = Mixer::new(channels, sample_rate);
        let channel_count = mixer.channel_count();
        Self {
            sample_rate,
            buffer_size,
            mixer,
            tones: TonePool::new(),
            samplers: SamplerPool::new(),
            instruments: InstrumentRegistry::new(),
            programs: ProgramMap::new(),
            store: SampleStore::new(),
            timeline,
            transport,
            block_events: Vec::with_capacity(BLOCK_EVENT_CAPACITY),
            bus_l: vec![0.0; channel_count],
            bus_r: vec![0.0; channel_count],
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Applies a device format change: recompute every rate-dependent piece
    /// of DSP state.
    pub fn set_audio_format(&mut self, sample_rate: f64, buffer_size: usize) {
        self.sample_rate = sample_rate;
        self.buffer_size = buffer_size;
        self.mixer.set_sample_rate(sample_rate);
    }

    /// Resizes the mixer and the buses together so the callback never sees
    /// them disagree.
    pub fn resize_mixer(&mut self, channels: usize) {
        self.mixer.resize(channels);
        let channel_count = self.mixer.channel_count();
        self.bus_l.resize(channel_count, 0.0);
        self.bus_r.resize(channel_count, 0.0);
    }

    /// Starts a tone voice immediately (live note-on from the control path).
    pub fn start_note(&mut self, inst_id: &str, mix_ch: usize, note: i32, velocity: f32) {
        let instrument = self.instruments.get_or_default(inst_id).clone();
        self.tones
            .start(inst_id, &instrument, mix_ch, note, velocity, self.sample_rate);
    }

    pub fn stop_note(&mut self, inst_id: &str, mix_ch: usize, note: i32) {
        self.tones.release(inst_id, mix_ch, note);
    }

    /// Deactivates every voice in both pools immediately.
    pub fn panic(&mut self) {
        self.tones.panic();
        self.samplers.panic();
    }

    /// Starts a program voice for the nearest mapped key.
    pub fn start_program_note(
        &mut self,
        inst_id: &str,
        mix_ch: usize,
        note: i32,
        velocity: f32,
    ) -> bool {
        let Some((key, sample)) = self.programs.nearest(inst_id, note) else {
            return false;
        };
        let voice = SamplerVoice::for_program(
            Arc::from(inst_id),
            note,
            key,
            mix_ch,
            velocity,
            sample,
            self.sample_rate,
        );
        self.samplers.allocate(voice);
        true
    }

    pub fn stop_program_note(&mut self, inst_id: &str, mix_ch: usize, note: i32) {
        self.samplers.release_matching(inst_id, mix_ch, note);
    }

    /// Creates a sampler voice from a typed trigger payload. The sample must
    /// already sit in the store; the router handles ad-hoc path loading
    /// before taking the audio lock.
    pub fn trigger_sample(&mut self, params: &TriggerParams) -> Result<(), TriggerError> {
        let sample_id = params
            .sample_id
            .as_deref()
            .ok_or(TriggerError::MissingSample)?;
        let sample = self
            .store
            .get(sample_id)
            .ok_or_else(|| TriggerError::NotLoaded(sample_id.to_string()))?;
        if sample.frames <= 1 {
            return Err(TriggerError::TooShort(sample_id.to_string()));
        }

        let voice = SamplerVoice::from_trigger(
            params,
            Arc::from("sampler"),
            sample,
            self.sample_rate,
            self.transport.bpm(),
        );
        self.samplers.allocate(voice);
        Ok(())
    }

    fn dispatch_event(&mut self, event: &ScheduledEvent) {
        match &event.kind {
            EventKind::NoteOn => {
                self.start_note(&event.inst_id, event.mix_ch, event.note, event.vel);
            }
            EventKind::NoteOff => {
                self.stop_note(&event.inst_id, event.mix_ch, event.note);
            }
            EventKind::ProgramOn => {
                self.start_program_note(&event.inst_id, event.mix_ch, event.note, event.vel);
            }
            EventKind::ProgramOff => {
                self.stop_program_note(&event.inst_id, event.mix_ch, event.note);
            }
            // Scheduled triggers that fail (e.g. the sample was unloaded
            // since the push) are dropped; the audio thread never errors.
            EventKind::SamplerTrigger(params) => {
                let _ = self.trigger_sample(params);
            }
        }
    }

    /// Renders one block of `n` frames into the interleaved output buffer.
    /// Channels 0/1 receive L/R; any further channel receives the mono
    /// average.
    pub fn render(&mut self, out: &mut [f32], out_channels: usize) {
        out.fill(0.0);
        if out_channels == 0 {
            return;
        }
        let n = out.len() / out_channels;
        if n == 0 {
            return;
        }

        if self.transport.is_armed()
            && self.transport.sample_pos() >= self.transport.play_start_sample_pos()
        {
            self.transport.begin_playing();
        }

        self.block_events.clear();
        if self.transport.is_playing() {
            let pos = self.transport.sample_pos();
            let from_ppq = self.transport.samples_to_ppq(pos, self.sample_rate);
            let to_ppq = self.transport.samples_to_ppq(pos + n as u64, self.sample_rate);
            let bpm = self.transport.bpm();
            self.timeline.lock().prepare_block(
                from_ppq,
                to_ppq,
                self.sample_rate,
                bpm,
                n,
                &mut self.block_events,
            );
        }

        let channels = self.mixer.channel_count();
        let any_solo = self.mixer.any_solo();
        let mut next_event = 0;

        for i in 0..n {
            while next_event < self.block_events.len()
                && self.block_events[next_event].offset <= i
            {
                let event = self.block_events[next_event].event.clone();
                self.dispatch_event(&event);
                next_event += 1;
            }

            self.bus_l[..channels].fill(0.0);
            self.bus_r[..channels].fill(0.0);

            // A voice's mixCh addresses the same strip array as the mixer
            // and fx `ch` parameter.
            for voice in self.samplers.iter_mut() {
                if !voice.active {
                    continue;
                }
                if let Some((l, r)) = voice.tick() {
                    let ch = voice.mix_ch.min(channels - 1);
                    if self.mixer.channel_audible(ch, any_solo) {
                        self.bus_l[ch] += l;
                        self.bus_r[ch] += r;
                    }
                }
            }

            for voice in self.tones.iter_mut() {
                if !voice.active {
                    continue;
                }
                if let Some(amp) = voice.tick(self.sample_rate) {
                    let ch = voice.mix_ch.min(channels - 1);
                    if self.mixer.channel_audible(ch, any_solo) {
                        self.bus_l[ch] += amp;
                        self.bus_r[ch] += amp;
                    }
                }
            }

            let mut master_l = 0.0;
            let mut master_r = 0.0;
            for ch in 0..channels {
                let (l, r) = self.mixer.process_channel(ch, self.bus_l[ch], self.bus_r[ch]);
                master_l += l;
                master_r += r;
            }

            let (l, r) = self.mixer.process_master(master_l, master_r);

            let base = i * out_channels;
            out[base] = l;
            if out_channels > 1 {
                out[base + 1] = r;
                let mono = 0.5 * (l + r);
                for extra in out.iter_mut().take(base + out_channels).skip(base + 2) {
                    *extra = mono;
                }
            }
        }

        self.transport.advance(n as u64);
        self.mixer.finalize_block(n);
    }
}
