//! μ-law frame codec and loudness measurement.
//!
//! Telephony audio arrives as 8 kHz G.711 μ-law, one byte per sample,
//! base64-encoded inside the media event. Nothing here keeps state: the
//! barge-in gate and all of its tests build on these functions being pure.

use base64::Engine;

use super::error::{RelayError, RelayResult};

/// Bias added to the reconstructed magnitude before the exponent shift.
pub const MULAW_BIAS: i32 = 0x84;

/// Expand one μ-law byte into a linear sample.
#[inline]
pub fn expand(byte: u8) -> i32 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = i32::from((u >> 4) & 0x07);
    let mantissa = i32::from(u & 0x0F);
    let magnitude = (((mantissa << 4) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Expand a whole frame into linear samples.
pub fn decode(frame: &[u8]) -> Vec<i32> {
    frame.iter().copied().map(expand).collect()
}

/// Root-mean-square magnitude of a μ-law frame. Empty frames are silent.
pub fn decode_loudness(frame: &[u8]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame
        .iter()
        .map(|&b| {
            let s = f64::from(expand(b));
            s * s
        })
        .sum();
    (sum_sq / frame.len() as f64).sqrt()
}

/// Decode a base64 media payload and measure it.
pub fn loudness_of_payload(payload: &str) -> RelayResult<f64> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| RelayError::InvalidPayload(format!("media payload is not base64: {e}")))?;
    Ok(decode_loudness(&bytes))
}

/// One frame of encoded audio in either direction.
///
/// The payload is kept base64-encoded: both wires carry it that way, so the
/// relay only decodes when it needs a loudness reading.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    payload: String,
    duration_ms: u32,
}

impl AudioFrame {
    pub fn new(payload: impl Into<String>, duration_ms: u32) -> Self {
        Self {
            payload: payload.into(),
            duration_ms,
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn loudness(&self) -> RelayResult<f64> {
        loudness_of_payload(&self.payload)
    }
}
