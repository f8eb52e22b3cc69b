//! Text recognition seam. The recognition backend is supplied by the caller.

use crate::descriptor::BoundingBox;
use crate::errors::LocateError;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Page segmentation assumption handed to the recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Uniform block of text.
    #[default]
    Block,
    /// Scattered labels with no reading order; the relaxed fallback.
    SparseText,
}

/// One recognized span. `bounds` are relative to the image passed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedSpan {
    pub text: String,
    pub confidence: f32,
    pub bounds: BoundingBox,
}

impl RecognizedSpan {
    pub fn new(text: impl Into<String>, confidence: f32, bounds: BoundingBox) -> Self {
        Self {
            text: text.into(),
            confidence,
            bounds,
        }
    }
}

pub trait OcrEngine: Send + Sync {
    /// Recognizes text in a preprocessed (binarized) image.
    ///
    /// Implementations should give up with [`LocateError::Timeout`] once `budget` is spent.
    fn recognize(
        &self,
        image: &GrayImage,
        mode: RecognitionMode,
        budget: Duration,
    ) -> Result<Vec<RecognizedSpan>, LocateError>;
}
