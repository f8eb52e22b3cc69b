//! Locating on-screen elements of pixel-based desktop applications and
//! detecting when long-running operations finish.
//!
//! The [`ElementLocator`] resolves an [`ActionDescriptor`] by trying text
//! recognition, then template matching, then a fixed coordinate, and hands
//! every exhausted method to the [`RecoveryCoordinator`] once. The
//! [`AudioSignalMonitor`] listens for click and completion sounds on a
//! background thread.

pub mod audio;
pub mod capture;
pub mod config;
pub mod coordinate;
pub mod descriptor;
pub mod detection;
pub mod diagnostics;
pub mod errors;
pub mod input;
pub mod locator;
pub mod logging;
pub mod ocr;
pub mod performance;
pub mod preprocess;
pub mod recovery;
pub mod screenshot;
pub mod template_locator;
pub mod template_store;
pub mod text_locator;
#[cfg(test)]
mod tests;

pub use audio::{
    AudioDetectionResult, AudioMonitorHandle, AudioSignalMonitor, MonitorState, SoundKind,
};
pub use capture::{AudioCapture, AudioStream, ScreenCapture};
#[cfg(feature = "screen-capture")]
pub use capture::XcapScreenCapture;
pub use config::{watch_config, ConfigHandle, ConfigWatcher, Settings};
pub use coordinate::CoordinateResolver;
pub use descriptor::{ActionDescriptor, BoundingBox, InteractionKind, Point};
pub use detection::{AutomationResult, DetectionResult, LocatorMethod};
pub use diagnostics::{
    DiagnosticRecord, DiagnosticsSink, FileDiagnosticsSink, MemoryDiagnosticsSink,
};
pub use errors::{AudioError, ConfigError, FailureKind, LocateError, TemplateStoreError};
pub use input::{InputInjector, TargetRestarter};
pub use locator::{AttemptOptions, CompletionSignal, ElementLocator, ElementLocatorBuilder, Locator};
pub use logging::init_logging;
pub use ocr::{OcrEngine, RecognitionMode, RecognizedSpan};
pub use performance::{MethodSummary, PerformanceReport, PerformanceTracker};
pub use recovery::{RecoveryAttempt, RecoveryCoordinator, RecoveryStrategy};
pub use screenshot::Screenshot;
pub use template_locator::TemplateLocator;
pub use template_store::{Template, TemplateStore, TemplateVariant};
pub use text_locator::TextLocator;
