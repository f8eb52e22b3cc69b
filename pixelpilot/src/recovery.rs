//! Failure recovery: one typed remediation per failure, applied at most once.

use crate::config::Settings;
use crate::detection::{AutomationResult, DetectionResult, LocatorMethod};
use crate::errors::{FailureKind, LocateError};
use crate::input::TargetRestarter;
use crate::locator::AttemptOptions;
use crate::ocr::RecognitionMode;
use crate::template_store::TemplateStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// The remediation chosen for a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-run text recognition assuming sparse, unordered labels.
    RelaxedRecognition,
    /// Re-run template matching against additional known variant names.
    AlternateVariants { names: Vec<String> },
    /// Re-run the coordinate click at small pixel offsets, first effect wins.
    CoordinateJitter { offsets: Vec<(i32, i32)> },
    /// Ask the caller's restarter to bring the application back, then retry.
    RestartTarget,
    ExtendTimeout { budget_ms: u64 },
    RetryUnchanged,
    /// No remediation applies; the failure stands.
    Escalate,
}

impl RecoveryStrategy {
    pub fn id(&self) -> &'static str {
        match self {
            RecoveryStrategy::RelaxedRecognition => "relaxed_recognition",
            RecoveryStrategy::AlternateVariants { .. } => "alternate_variants",
            RecoveryStrategy::CoordinateJitter { .. } => "coordinate_jitter",
            RecoveryStrategy::RestartTarget => "restart_target",
            RecoveryStrategy::ExtendTimeout { .. } => "extend_timeout",
            RecoveryStrategy::RetryUnchanged => "retry_unchanged",
            RecoveryStrategy::Escalate => "escalate",
        }
    }
}

/// Record of one remediation and what came of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAttempt {
    pub failure: FailureKind,
    pub method: LocatorMethod,
    pub strategy: RecoveryStrategy,
    pub outcome: AutomationResult,
    /// Retries issued while applying the strategy (jitter tries one per offset).
    pub variations_tried: u32,
}

#[derive(Default)]
pub struct RecoveryCoordinator {
    templates: Option<Arc<TemplateStore>>,
    restarter: Option<Arc<dyn TargetRestarter>>,
}

impl RecoveryCoordinator {
    pub fn new(
        templates: Option<Arc<TemplateStore>>,
        restarter: Option<Arc<dyn TargetRestarter>>,
    ) -> Self {
        Self {
            templates,
            restarter,
        }
    }

    /// Chooses the remediation for `error` raised by `method`.
    pub fn plan(
        &self,
        method: LocatorMethod,
        error: &LocateError,
        options: &AttemptOptions,
        settings: &Settings,
    ) -> RecoveryStrategy {
        use LocateError::*;
        use LocatorMethod::*;

        match (method, error) {
            (Text, LowConfidence { .. } | DetectionNotFound(_)) => {
                if options.recognition_mode == RecognitionMode::SparseText {
                    RecoveryStrategy::Escalate
                } else {
                    RecoveryStrategy::RelaxedRecognition
                }
            }
            (Template, LowConfidence { .. } | DetectionNotFound(_) | TemplateMissing(_)) => {
                let names = self.alternate_names(&options.template_ids);
                if names.is_empty() {
                    RecoveryStrategy::Escalate
                } else {
                    RecoveryStrategy::AlternateVariants { names }
                }
            }
            (Coordinate, NoObservableEffect { .. }) => {
                if settings.jitter_offsets.is_empty() {
                    RecoveryStrategy::Escalate
                } else {
                    RecoveryStrategy::CoordinateJitter {
                        offsets: settings.jitter_offsets.clone(),
                    }
                }
            }
            (_, TargetUnavailable(_)) => {
                if self.restarter.is_some() {
                    RecoveryStrategy::RestartTarget
                } else {
                    RecoveryStrategy::Escalate
                }
            }
            (_, Timeout { .. }) => {
                let extended = options.budget.as_secs_f64() * settings.timeout_multiplier as f64;
                RecoveryStrategy::ExtendTimeout {
                    budget_ms: (extended * 1000.0).round() as u64,
                }
            }
            (_, TransientIo(_)) => RecoveryStrategy::RetryUnchanged,
            (Text | Template, NoObservableEffect { .. })
            | (Text, TemplateMissing(_))
            | (Coordinate, LowConfidence { .. } | DetectionNotFound(_) | TemplateMissing(_))
            | (_, AudioTimeout(_) | InvalidDescriptor(_)) => RecoveryStrategy::Escalate,
        }
    }

    fn alternate_names(&self, tried: &[String]) -> Vec<String> {
        let Some(store) = &self.templates else {
            return Vec::new();
        };
        let mut names: Vec<String> = Vec::new();
        for id in tried {
            for alt in store.alternates_for(id) {
                if !tried.contains(&alt) && !names.contains(&alt) {
                    names.push(alt);
                }
            }
        }
        names
    }

    /// Applies the planned remediation once through `retry` and reports the outcome.
    ///
    /// A failed remediation is final: it is never re-planned.
    #[instrument(skip(self, options, settings, retry), fields(kind = ?error.kind()))]
    pub fn recover<F>(
        &self,
        method: LocatorMethod,
        error: &LocateError,
        options: &AttemptOptions,
        settings: &Settings,
        mut retry: F,
    ) -> RecoveryAttempt
    where
        F: FnMut(&AttemptOptions) -> Result<DetectionResult, LocateError>,
    {
        let started = Instant::now();
        let strategy = self.plan(method, error, options, settings);
        info!(strategy = strategy.id(), "Applying remediation");

        let (result, variations_tried) = match &strategy {
            RecoveryStrategy::RelaxedRecognition => {
                let relaxed = AttemptOptions {
                    recognition_mode: RecognitionMode::SparseText,
                    ..options.clone()
                };
                (retry(&relaxed), 1)
            }
            RecoveryStrategy::AlternateVariants { names } => {
                let alternates = AttemptOptions {
                    template_ids: names.clone(),
                    ..options.clone()
                };
                (retry(&alternates), 1)
            }
            RecoveryStrategy::CoordinateJitter { offsets } => {
                let (base_x, base_y) = options.point_offset;
                let mut last = Err(error.clone());
                let mut tried = 0;
                for &(dx, dy) in offsets {
                    tried += 1;
                    let jittered = AttemptOptions {
                        point_offset: (base_x + dx, base_y + dy),
                        ..options.clone()
                    };
                    last = retry(&jittered);
                    if last.is_ok() {
                        break;
                    }
                }
                (last, tried)
            }
            RecoveryStrategy::RestartTarget => match self.restart() {
                Ok(()) => (retry(options), 1),
                Err(e) => (Err(e), 0),
            },
            RecoveryStrategy::ExtendTimeout { budget_ms } => {
                let extended = AttemptOptions {
                    budget: Duration::from_millis(*budget_ms),
                    ..options.clone()
                };
                (retry(&extended), 1)
            }
            RecoveryStrategy::RetryUnchanged => (retry(options), 1),
            RecoveryStrategy::Escalate => (Err(error.clone()), 0),
        };

        let outcome = match &result {
            Ok(detection) => {
                info!(strategy = strategy.id(), "Remediation succeeded");
                AutomationResult::succeeded(detection, started.elapsed())
            }
            Err(e) => {
                warn!(strategy = strategy.id(), "Remediation failed: {e}");
                AutomationResult::failed(Some(method), e, started.elapsed())
            }
        };
        RecoveryAttempt {
            failure: error.kind(),
            method,
            strategy,
            outcome,
            variations_tried,
        }
    }

    fn restart(&self) -> Result<(), LocateError> {
        match &self.restarter {
            Some(restarter) => restarter.restart_target(),
            None => Err(LocateError::TargetUnavailable(
                "no target restarter configured".to_string(),
            )),
        }
    }
}
