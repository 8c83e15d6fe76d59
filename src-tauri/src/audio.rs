//! Turns an encoded audio file into mono 16 kHz samples for recognition.

use std::io::Cursor;
use std::path::Path;
use std::time::Instant;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::JobError;

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedAudio {
    pub samples: Vec<f32>,
    pub duration_secs: f64,
}

impl PreparedAudio {
    fn from_samples(samples: Vec<f32>) -> Self {
        let duration_secs = samples.len() as f64 / TARGET_SAMPLE_RATE as f64;
        Self {
            samples,
            duration_secs,
        }
    }
}

pub fn preprocess_file(path: &Path) -> Result<PreparedAudio, JobError> {
    let bytes = std::fs::read(path)
        .map_err(|e| JobError::Decode(format!("failed to read {}: {e}", path.display())))?;
    let extension = path.extension().and_then(|ext| ext.to_str());
    preprocess_with_hint(bytes, extension)
}

pub fn preprocess(bytes: Vec<u8>) -> Result<PreparedAudio, JobError> {
    preprocess_with_hint(bytes, None)
}

fn preprocess_with_hint(
    bytes: Vec<u8>,
    extension: Option<&str>,
) -> Result<PreparedAudio, JobError> {
    if bytes.is_empty() {
        return Err(JobError::Decode("empty audio buffer".to_string()));
    }

    let start = Instant::now();
    let (pcm, sample_rate) = decode_mono(bytes, extension)?;
    if pcm.is_empty() {
        return Err(JobError::Decode("no audio samples decoded".to_string()));
    }

    let samples = if sample_rate == TARGET_SAMPLE_RATE {
        pcm
    } else {
        log::info!("Resampling from {sample_rate} Hz to {TARGET_SAMPLE_RATE} Hz");
        resample_linear(&pcm, sample_rate, TARGET_SAMPLE_RATE)
    };

    let prepared = PreparedAudio::from_samples(samples);
    log::info!(
        "Prepared {} samples ({:.2}s) in {:?}",
        prepared.samples.len(),
        prepared.duration_secs,
        start.elapsed()
    );
    Ok(prepared)
}

fn decode_mono(bytes: Vec<u8>, extension: Option<&str>) -> Result<(Vec<f32>, u32), JobError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let fmt_opts: FormatOptions = Default::default();
    let meta_opts: MetadataOptions = Default::default();
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .map_err(|e| JobError::Decode(format!("failed to probe audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| JobError::Decode("missing default track".to_string()))?;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| JobError::Decode(format!("decoder init failed: {e}")))?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut pcm = Vec::new();

    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = sample_rate.or(Some(spec.rate));
                let channels = spec.channels.count();
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                downmix_into(&mut pcm, buf.samples(), channels);
            }
            Err(err) if matches!(err, SymphoniaError::DecodeError(_)) => {
                log::warn!("skipping corrupt packet: {err}");
                continue;
            }
            Err(err) => return Err(JobError::Decode(format!("decode error: {err}"))),
        }
    }

    let sample_rate =
        sample_rate.ok_or_else(|| JobError::Decode("missing sample rate".to_string()))?;
    Ok((pcm, sample_rate))
}

/// Appends one mono sample per interleaved frame. Stereo uses the
/// equal-power sum `sqrt(2) * (l + r) / 2`; any other layout keeps the first
/// channel.
fn downmix_into(out: &mut Vec<f32>, interleaved: &[f32], channels: usize) {
    match channels {
        0 => {}
        1 => out.extend_from_slice(interleaved),
        2 => out.extend(
            interleaved
                .chunks_exact(2)
                .map(|frame| downmix_stereo(frame[0], frame[1])),
        ),
        n => out.extend(interleaved.chunks_exact(n).map(|frame| frame[0])),
    }
}

pub fn downmix_stereo(left: f32, right: f32) -> f32 {
    std::f32::consts::SQRT_2 * (left + right) / 2.0
}

pub(crate) fn resample_linear(input: &[f32], from_sr: u32, to_sr: u32) -> Vec<f32> {
    if from_sr == 0 || to_sr == 0 || input.is_empty() {
        return Vec::new();
    }

    let out_len = ((input.len() as f64) * (to_sr as f64) / (from_sr as f64))
        .ceil()
        .max(1.0) as usize;
    let step = from_sr as f64 / to_sr as f64;

    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = (i as f64) * step;
        let idx = pos.floor() as usize;
        let frac = pos - idx as f64;

        let current = input.get(idx).copied().unwrap_or_default();
        let next = input.get(idx + 1).copied().unwrap_or(current);
        output.push(current + (next - current) * (frac as f32));
    }

    output
}
