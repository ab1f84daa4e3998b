use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

mod engine;

pub use engine::{EngineConfig, HttpAlprEngine};
pub use plate_registry::normalize_plate;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Failed to read image: {0}")]
    Image(String),
    #[error("ALPR request failed: {0}")]
    Request(String),
    #[error("ALPR service returned {0}")]
    Status(String),
    #[error("Failed to decode ALPR response: {0}")]
    Decode(String),
    #[error("Invalid ALPR configuration: {0}")]
    Config(String),
}

/// Outcome of running recognition on one image.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionResult {
    Detected {
        plate: String,
        /// Percentage in `[0, 100]`, one decimal.
        confidence: f64,
    },
    NotDetected,
}

impl RecognitionResult {
    pub fn plate(&self) -> Option<&str> {
        match self {
            RecognitionResult::Detected { plate, .. } => Some(plate),
            RecognitionResult::NotDetected => None,
        }
    }
}

/// A single plate reading as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateCandidate {
    pub text: String,
    /// Engine score in `[0, 1]`.
    pub score: f64,
}

/// Anything that can read a plate off an image file.
///
/// Implementations must be callable from several uploads at once.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image_path: &Path) -> Result<RecognitionResult, InferenceError>;
}

/// Reduce the engine's candidates to the one result we report.
///
/// The highest score wins; on a tie the candidate the engine listed first is
/// kept. Candidates whose text is empty after cleanup are ignored.
pub fn select_best(candidates: impl IntoIterator<Item = PlateCandidate>) -> RecognitionResult {
    let mut best: Option<(String, f64)> = None;

    for candidate in candidates {
        let plate = normalize_plate(&candidate.text);
        if plate.is_empty() {
            continue;
        }
        let better = best
            .as_ref()
            .map_or(true, |(_, score)| candidate.score > *score);
        if better {
            best = Some((plate, candidate.score));
        }
    }

    match best {
        Some((plate, score)) => RecognitionResult::Detected {
            plate,
            confidence: to_percentage(score),
        },
        None => RecognitionResult::NotDetected,
    }
}

/// Convert an engine score to a percentage rounded half away from zero to one
/// decimal.
pub fn to_percentage(score: f64) -> f64 {
    let percentage = (score.clamp(0.0, 1.0) * 1000.0).round() / 10.0;
    percentage.clamp(0.0, 100.0)
}
