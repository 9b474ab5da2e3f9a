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

//! Decodes audio files fully into memory.
//!
//! WAV files go through hound directly; everything else goes through
//! symphonia. Files keep their native sample rate; rate conversion happens
//! at voice playback time via linear interpolation.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use hound::WavReader;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, info};

use super::store::Sample;

/// Error types for sample decoding.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV file error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Audio file error: {0}")]
    Audio(#[from] SymphoniaError),

    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("File contains no audio frames")]
    Empty,
}

/// Decodes the file at the given path into a shared sample.
pub fn load_sample(path: &Path) -> Result<Arc<Sample>, LoaderError> {
    let is_wav = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);

    let sample = if is_wav {
        load_wav(path)?
    } else {
        load_with_symphonia(path)?
    };

    if sample.frames == 0 {
        return Err(LoaderError::Empty);
    }

    info!(
        path = ?path,
        channels = sample.channel_count(),
        sample_rate = sample.sample_rate,
        frames = sample.frames,
        memory_kb = sample.memory_size() / 1024,
        "Sample loaded"
    );

    Ok(Arc::new(sample))
}

fn load_wav(path: &Path) -> Result<Sample, LoaderError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channel_count = spec.channels.max(1) as usize;
    let mut channels: Vec<Vec<f32>> = vec![Vec::new(); channel_count];

    match spec.sample_format {
        hound::SampleFormat::Float => {
            for (i, sample) in reader.samples::<f32>().enumerate() {
                channels[i % channel_count].push(sample?);
            }
        }
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample - 1)) as f32;
            match spec.bits_per_sample {
                16 => {
                    for (i, sample) in reader.samples::<i16>().enumerate() {
                        channels[i % channel_count].push(sample? as f32 * scale);
                    }
                }
                24 | 32 => {
                    for (i, sample) in reader.samples::<i32>().enumerate() {
                        channels[i % channel_count].push(sample? as f32 * scale);
                    }
                }
                bits => {
                    return Err(LoaderError::Unsupported(format!(
                        "{bits}-bit integer WAV"
                    )))
                }
            }
        }
    }

    // A truncated final frame leaves the channels ragged; drop the stragglers.
    let frames = channels.iter().map(|c| c.len()).min().unwrap_or(0);
    for channel in &mut channels {
        channel.truncate(frames);
    }

    debug!(path = ?path, "Decoded WAV via hound");
    Ok(Sample::new(spec.sample_rate, channels))
}

fn load_with_symphonia(path: &Path) -> Result<Sample, LoaderError> {
    let file = File::open(path)?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| LoaderError::Unsupported("no decodable track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| LoaderError::Unsupported("unknown sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())?;

    let mut channels: Vec<Vec<f32>> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Recoverable decode errors skip the packet.
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(path = ?path, error = e, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            channels = vec![Vec::new(); spec.channels.count().max(1)];
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            let channel_count = channels.len();
            for frame in buf.samples().chunks_exact(channel_count) {
                for (channel, &value) in channels.iter_mut().zip(frame) {
                    channel.push(value);
                }
            }
        }
    }

    debug!(path = ?path, "Decoded via symphonia");
    Ok(Sample::new(sample_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;

    #[test]
    fn test_load_wav_mono() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("mono.wav");
        write_wav(path.clone(), vec![vec![0.0f32, 0.5, -0.5, 1.0]], 48000).unwrap();

        let sample = load_sample(&path).unwrap();
        assert_eq!(sample.sample_rate, 48000);
        assert_eq!(sample.channel_count(), 1);
        assert_eq!(sample.frames, 4);
        assert_eq!(sample.channels[0], vec![0.0, 0.5, -0.5, 1.0]);
    }

    #[test]
    fn test_load_wav_stereo_deinterleaves() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("stereo.wav");
        // write_wav takes per-channel vectors and interleaves them.
        write_wav(
            path.clone(),
            vec![vec![0.1f32, 0.2, 0.3], vec![-0.1, -0.2, -0.3]],
            44100,
        )
        .unwrap();

        let sample = load_sample(&path).unwrap();
        assert_eq!(sample.channel_count(), 2);
        assert_eq!(sample.frames, 3);
        assert!((sample.channels[0][1] - 0.2).abs() < 1e-6);
        assert!((sample.channels[1][2] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_load_wav_int16_normalizes() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("int16.wav");
        crate::testutil::write_wav_with_bits(
            path.clone(),
            vec![vec![i16::MAX, 0, i16::MIN]],
            48000,
            16,
        )
        .unwrap();

        let sample = load_sample(&path).unwrap();
        assert!((sample.channels[0][0] - (i16::MAX as f32 / 32768.0)).abs() < 1e-6);
        assert_eq!(sample.channels[0][1], 0.0);
        assert!((sample.channels[0][2] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(load_sample(Path::new("/nonexistent/file.wav")).is_err());
    }
}
