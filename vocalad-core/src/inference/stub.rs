//! `StubRecognizer`: placeholder backend that segments energy bursts.
//!
//! No acoustic model is involved. Every 20 ms hop above the energy gate becomes
//! a pseudo-vowel, every hop below it becomes `SIL`, and consecutive equal
//! labels are merged. Word counts derived from it are estimates.

use tracing::debug;

use crate::error::Result;
use crate::inference::{PhonemeAlignment, PhonemeRecognizer, SIL};
use crate::vad::rms;

const HOP_SECS: f64 = 0.02;
const VOICED_LABEL: &str = "AH";
const STUB_CONFIDENCE: f32 = 0.5;

pub struct StubRecognizer {
    gate_rms: f32,
    calls: u32,
}

impl StubRecognizer {
    pub fn new(gate_rms: f32) -> Self {
        Self { gate_rms, calls: 0 }
    }
}

impl Default for StubRecognizer {
    fn default() -> Self {
        Self::new(0.02)
    }
}

impl PhonemeRecognizer for StubRecognizer {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubRecognizer::warm_up: no-op");
        Ok(())
    }

    fn recognize(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<PhonemeAlignment>> {
        self.calls += 1;
        if samples.is_empty() || sample_rate == 0 {
            return Ok(vec![]);
        }
        let hop = ((sample_rate as f64 * HOP_SECS) as usize).max(1);

        let mut out: Vec<PhonemeAlignment> = Vec::new();
        for (i, block) in samples.chunks(hop).enumerate() {
            let label = if rms(block) > self.gate_rms {
                VOICED_LABEL
            } else {
                SIL
            };
            let start = (i * hop) as f64 / sample_rate as f64;
            let end = (i * hop + block.len()) as f64 / sample_rate as f64;
            match out.last_mut() {
                Some(last) if last.phoneme == label => last.end_secs = end,
                _ => out.push(PhonemeAlignment {
                    phoneme: label.to_string(),
                    start_secs: start,
                    end_secs: end,
                    confidence: STUB_CONFIDENCE,
                }),
            }
        }
        debug!(call = self.calls, phonemes = out.len(), "stub recognition");
        Ok(out)
    }

    fn is_model_backed(&self) -> bool {
        false
    }

    fn reset(&mut self) {
        debug!("StubRecognizer::reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::count_words;

    #[test]
    fn bursts_become_words() {
        // 0.2 s voiced, 0.1 s silence, 0.2 s voiced at 16 kHz.
        let mut samples = vec![0.3f32; 3200];
        samples.extend(vec![0.0; 1600]);
        samples.extend(vec![0.3; 3200]);

        let mut stub = StubRecognizer::default();
        let phonemes = stub.recognize(&samples, 16_000).unwrap();
        assert_eq!(
            phonemes.iter().map(|p| p.phoneme.as_str()).collect::<Vec<_>>(),
            vec!["AH", SIL, "AH"]
        );
        assert_eq!(count_words(&phonemes), 2);
        assert!((phonemes[2].end_secs - 0.5).abs() < 1e-9);
    }

    #[test]
    fn never_claims_to_be_a_model() {
        assert!(!StubRecognizer::default().is_model_backed());
    }
}
