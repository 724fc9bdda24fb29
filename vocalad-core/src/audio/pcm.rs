//! Little-endian 16-bit PCM conversion.
//!
//! Outbound capture frames are sent as PCM16; inbound remote audio arrives as
//! PCM16 at whatever rate the session declared (commonly 24 kHz). Decoding is
//! always done at the declared rate, never at the capture rate.

use crate::error::{Result, VocaladError};

/// Convert f32 samples in [-1, 1] to little-endian PCM16 bytes.
///
/// Negative samples scale by 32768 and positive by 32767 so both ends of the
/// range map onto the full i16 range. Non-finite samples encode as 0.
pub fn encode_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };
        let v = if s < 0.0 {
            (s * 32768.0) as i16
        } else {
            (s * 32767.0) as i16
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode little-endian PCM16 bytes into f32 samples in [-1, 1).
///
/// # Errors
/// Returns `VocaladError::Decode` when the byte count is odd.
pub fn decode_pcm16_le(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VocaladError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

/// Decoder bound to the format the remote session declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pcm16Decoder {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Pcm16Decoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Decode a chunk to mono samples, averaging interleaved channels.
    ///
    /// # Errors
    /// Returns `VocaladError::Decode` when the chunk does not hold a whole
    /// number of interleaved sample frames.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let ch = self.channels as usize;
        let frame_bytes = 2 * ch;
        if bytes.len() % frame_bytes != 0 {
            return Err(VocaladError::Decode(format!(
                "{} bytes is not a multiple of the {}-byte sample frame",
                bytes.len(),
                frame_bytes
            )));
        }
        let interleaved = decode_pcm16_le(bytes)?;
        if ch == 1 {
            return Ok(interleaved);
        }
        Ok(interleaved
            .chunks_exact(ch)
            .map(|f| f.iter().sum::<f32>() / ch as f32)
            .collect())
    }

    /// Duration in seconds of a well-formed chunk of `len` bytes.
    pub fn duration_of(&self, len: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        let frames = len / (2 * self.channels as usize);
        frames as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_uses_asymmetric_full_scale() {
        let bytes = encode_pcm16_le(&[1.0, -1.0, 0.0, 2.0, f32::NAN]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MIN, 0, i16::MAX, 0]);
    }

    #[test]
    fn decode_rejects_odd_length() {
        let err = decode_pcm16_le(&[0x00, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, VocaladError::Decode(_)));
    }

    #[test]
    fn decode_scales_by_32768() {
        let samples = decode_pcm16_le(&(-16384i16).to_le_bytes()).unwrap();
        assert_eq!(samples, vec![-0.5]);
    }

    #[test]
    fn stereo_decoder_downmixes_and_checks_alignment() {
        let dec = Pcm16Decoder::new(24_000, 2);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&16384i16.to_le_bytes());
        bytes.extend_from_slice(&0i16.to_le_bytes());
        assert_eq!(dec.decode(&bytes).unwrap(), vec![0.25]);
        assert!(dec.decode(&bytes[..2]).is_err());
    }

    #[test]
    fn duration_follows_declared_rate() {
        let dec = Pcm16Decoder::new(24_000, 1);
        // 100 ms at 24 kHz = 2400 samples = 4800 bytes
        assert!((dec.duration_of(4800) - 0.1).abs() < 1e-12);
    }
}
