use crate::descriptor::ActionDescriptor;
use crate::detection::{DetectionResult, LocatorMethod};
use crate::errors::LocateError;
use crate::locator::{AttemptOptions, Locator};
use crate::ocr::{OcrEngine, RecognizedSpan};
use crate::preprocess::prepare_for_ocr;
use crate::screenshot::Screenshot;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Finds an element by the text printed on it.
pub struct TextLocator {
    engine: Arc<dyn OcrEngine>,
}

impl TextLocator {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }
}

impl Locator for TextLocator {
    fn method(&self) -> LocatorMethod {
        LocatorMethod::Text
    }

    fn applies_to(&self, descriptor: &ActionDescriptor) -> bool {
        descriptor.target_text().is_some()
    }

    #[instrument(level = "debug", skip(self, screen, descriptor), fields(text = descriptor.target_text()))]
    fn attempt(
        &self,
        screen: &Screenshot,
        descriptor: &ActionDescriptor,
        options: &AttemptOptions,
    ) -> Result<DetectionResult, LocateError> {
        let target = descriptor.target_text().ok_or_else(|| {
            LocateError::InvalidDescriptor("text locator needs target_text".to_string())
        })?;
        let (gray, area) = screen
            .gray_region(descriptor.search_region())
            .ok_or_else(|| {
                LocateError::DetectionNotFound("search region lies outside the screen".to_string())
            })?;

        let prepared = prepare_for_ocr(&gray);
        let spans = self
            .engine
            .recognize(&prepared, options.recognition_mode, options.budget)?;
        debug!(span_count = spans.len(), mode = ?options.recognition_mode, "OCR finished");

        let span = select_span(&spans, target, options.threshold)?;
        Ok(DetectionResult::matched(
            LocatorMethod::Text,
            span.bounds.translate(area.x, area.y),
            span.confidence,
        ))
    }
}

/// First span containing `target` (case-insensitive) whose confidence meets `threshold`.
fn select_span<'a>(
    spans: &'a [RecognizedSpan],
    target: &str,
    threshold: f32,
) -> Result<&'a RecognizedSpan, LocateError> {
    let needle = target.trim().to_lowercase();
    let mut best_rejected: Option<f32> = None;
    for span in spans
        .iter()
        .filter(|s| s.text.to_lowercase().contains(&needle))
    {
        if span.confidence >= threshold {
            return Ok(span);
        }
        best_rejected = Some(best_rejected.map_or(span.confidence, |b| b.max(span.confidence)));
    }
    match best_rejected {
        Some(observed) => Err(LocateError::LowConfidence {
            observed,
            threshold,
        }),
        None => Err(LocateError::DetectionNotFound(format!(
            "no recognized text contains {target:?}"
        ))),
    }
}
