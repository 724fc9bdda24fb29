//! Phoneme recognition abstraction.
//!
//! The `PhonemeRecognizer` trait decouples word-rate estimation from any
//! specific backend. Only a placeholder (`StubRecognizer`) ships; a real
//! acoustic model plugs in behind the same trait.
//!
//! `&mut self` on `recognize` expresses that decoders are stateful. All
//! mutation is therefore serialised through `ModelHandle`'s
//! `parking_lot::Mutex`.

pub mod stub;

pub use stub::StubRecognizer;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Label used for silence between words.
pub const SIL: &str = "SIL";

/// Recognizer vocabulary (ARPAbet), silence first.
pub const PHONEME_VOCAB: &[&str] = &[
    SIL, "AA", "AE", "AH", "AO", "AW", "AY", "EH", "ER", "EY", "IH", "IY", "OW", "OY", "UH", "UW",
    "B", "CH", "D", "DH", "F", "G", "HH", "JH", "K", "L", "M", "N", "NG", "P", "R", "S", "SH",
    "T", "TH", "V", "W", "Y", "Z", "ZH",
];

/// One recognised phoneme with its time span inside the analysed buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhonemeAlignment {
    pub phoneme: String,
    pub start_secs: f64,
    pub end_secs: f64,
    pub confidence: f32,
}

impl PhonemeAlignment {
    pub fn is_silence(&self) -> bool {
        self.phoneme == SIL
    }
}

/// Contract for phoneme recognition backends.
pub trait PhonemeRecognizer: Send + 'static {
    /// One-time warm-up. Called once before the first session starts.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Recognise phonemes in a mono buffer at `sample_rate`.
    fn recognize(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<PhonemeAlignment>>;

    /// `true` only for a real acoustic model. Placeholder output must never be
    /// reported as model output.
    fn is_model_backed(&self) -> bool;

    /// Reset decoder state between turns.
    fn reset(&mut self);
}

/// Thread-safe reference-counted handle to any `PhonemeRecognizer` implementor.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn PhonemeRecognizer>>);

impl ModelHandle {
    pub fn new<M: PhonemeRecognizer>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

/// Count words as runs of non-silence phonemes.
pub fn count_words(phonemes: &[PhonemeAlignment]) -> u32 {
    let mut words = 0;
    let mut in_word = false;
    for p in phonemes {
        if p.is_silence() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
        }
    }
    words
}
