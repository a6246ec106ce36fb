//! PCM16 frame codec.
//!
//! - Encode: f32 samples → clamp → i16 little-endian → `WireMessage`
//! - Decode: `WireMessage` → i16 little-endian → f32 → linear resample

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::SessionError;

const SAMPLE_WIDTH: usize = 2;
const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Encoded audio in transit between the session and the remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub data: Bytes,
    pub mime_type: String,
}

impl WireMessage {
    pub fn new(data: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Wrap raw PCM16 bytes received at `sample_rate`.
    pub fn pcm(data: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self::new(data, pcm_mime_type(sample_rate))
    }

    /// Sample rate declared by the `rate=` parameter of the MIME tag.
    pub fn sample_rate(&self) -> Option<u32> {
        let mut parts = self.mime_type.split(';');
        if parts.next()?.trim() != PCM_MIME_PREFIX {
            return None;
        }
        parts
            .filter_map(|p| p.trim().strip_prefix("rate="))
            .find_map(|r| r.trim().parse().ok())
    }
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME_PREFIX, sample_rate)
}

/// Quantize samples to PCM16 and tag them with `source_rate`.
pub fn encode(samples: &[f32], source_rate: u32) -> Result<WireMessage, SessionError> {
    if samples.is_empty() {
        return Err(SessionError::Encode("empty frame".into()));
    }
    if source_rate == 0 {
        return Err(SessionError::Encode("zero source rate".into()));
    }

    let mut buf = BytesMut::with_capacity(samples.len() * SAMPLE_WIDTH);
    for &s in samples {
        buf.put_i16_le(quantize(s));
    }
    Ok(WireMessage::pcm(buf.freeze(), source_rate))
}

/// Unpack PCM16 and resample to `target_rate` if the declared rate differs.
pub fn decode(wire: &WireMessage, target_rate: u32) -> Result<Vec<f32>, SessionError> {
    if target_rate == 0 {
        return Err(SessionError::Resampling("zero target rate".into()));
    }
    let source_rate = match wire.sample_rate() {
        Some(rate) if rate > 0 => rate,
        _ => {
            return Err(SessionError::Decode(format!(
                "unsupported audio tag '{}'",
                wire.mime_type
            )));
        }
    };
    if wire.data.len() % SAMPLE_WIDTH != 0 {
        return Err(SessionError::Decode(format!(
            "payload length {} is not a multiple of {}",
            wire.data.len(),
            SAMPLE_WIDTH
        )));
    }

    let samples: Vec<f32> = wire
        .data
        .chunks_exact(SAMPLE_WIDTH)
        .map(|c| dequantize(i16::from_le_bytes([c[0], c[1]])))
        .collect();

    if source_rate == target_rate {
        Ok(samples)
    } else {
        resample_linear(&samples, source_rate, target_rate)
    }
}

/// f32 in [-1, 1] to PCM16: scale by 32768, round, saturate. NaN is silence.
pub fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * 32768.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn dequantize(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Linear-interpolation resampler. O(input length).
pub fn resample_linear(
    input: &[f32],
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<f32>, SessionError> {
    if source_rate == 0 || target_rate == 0 {
        return Err(SessionError::Resampling(format!(
            "invalid rates {} -> {}",
            source_rate, target_rate
        )));
    }
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let out_len =
        (input.len() as f64 * target_rate as f64 / source_rate as f64).round() as usize;
    let step = source_rate as f64 / target_rate as f64;
    let last = input.len() - 1;

    let output = (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let lo = (pos.floor() as usize).min(last);
            let hi = (pos.ceil() as usize).min(last);
            let frac = (pos - lo as f64) as f32;
            input[lo] + (input[hi] - input[lo]) * frac
        })
        .collect();
    Ok(output)
}
