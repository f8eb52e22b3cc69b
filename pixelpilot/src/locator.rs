//! The element locator: a fixed-priority fallback chain over uniform locators.

use crate::audio::{AudioDetectionResult, AudioMonitorHandle};
use crate::capture::ScreenCapture;
use crate::config::{ConfigHandle, Settings};
use crate::coordinate::CoordinateResolver;
use crate::descriptor::{
    ActionDescriptor, InteractionKind, Point, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_TIMEOUT_MS,
};
use crate::detection::{AutomationResult, DetectionResult, LocatorMethod};
use crate::diagnostics::{DiagnosticRecord, DiagnosticsSink, MemoryDiagnosticsSink};
use crate::errors::{AudioError, LocateError};
use crate::input::{InputInjector, TargetRestarter};
use crate::ocr::{OcrEngine, RecognitionMode};
use crate::performance::PerformanceTracker;
use crate::recovery::RecoveryCoordinator;
use crate::screenshot::Screenshot;
use crate::template_locator::TemplateLocator;
use crate::template_store::TemplateStore;
use crate::text_locator::TextLocator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, info, instrument, warn};

/// One sensing method. Every locator honours the same contract so the chain
/// can treat them uniformly.
pub trait Locator: Send + Sync {
    fn method(&self) -> LocatorMethod;

    /// Whether the descriptor carries what this method needs.
    fn applies_to(&self, descriptor: &ActionDescriptor) -> bool;

    /// Looks for the element in `screen`. Must be deterministic for identical inputs.
    fn attempt(
        &self,
        screen: &Screenshot,
        descriptor: &ActionDescriptor,
        options: &AttemptOptions,
    ) -> Result<DetectionResult, LocateError>;
}

/// Tunables for a single attempt. Recovery adjusts these, never the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOptions {
    pub threshold: f32,
    pub budget: Duration,
    pub recognition_mode: RecognitionMode,
    /// Template ids to match. Empty means the descriptor's own id.
    pub template_ids: Vec<String>,
    pub point_offset: (i32, i32),
}

impl Default for AttemptOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            budget: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            recognition_mode: RecognitionMode::default(),
            template_ids: Vec::new(),
            point_offset: (0, 0),
        }
    }
}

impl AttemptOptions {
    pub fn for_method(
        descriptor: &ActionDescriptor,
        method: LocatorMethod,
        settings: &Settings,
    ) -> Self {
        let template_ids = match method {
            LocatorMethod::Template => descriptor.template_id().map(str::to_string).into_iter().collect(),
            _ => Vec::new(),
        };
        Self {
            threshold: descriptor.threshold_for(method, settings),
            budget: descriptor.timeout(),
            template_ids,
            ..Self::default()
        }
    }
}

/// How a long-running operation was observed to finish.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionSignal {
    /// The audio monitor finished, detected or not.
    Audio(AudioDetectionResult),
    /// The visual cue appeared before the audio monitor finished.
    Visual(DetectionResult),
}

type Attempted = (Result<DetectionResult, LocateError>, Option<Screenshot>);

struct Failure {
    locator: Arc<dyn Locator>,
    error: LocateError,
    options: AttemptOptions,
}

/// Resolves action descriptors to screen points: Text, then Template, then Coordinate.
pub struct ElementLocator {
    capture: Arc<dyn ScreenCapture>,
    chain: Vec<Arc<dyn Locator>>,
    input: Option<Arc<dyn InputInjector>>,
    recovery: RecoveryCoordinator,
    diagnostics: Arc<dyn DiagnosticsSink>,
    tracker: Arc<PerformanceTracker>,
    config: ConfigHandle,
}

impl ElementLocator {
    pub fn builder(capture: Arc<dyn ScreenCapture>) -> ElementLocatorBuilder {
        ElementLocatorBuilder::new(capture)
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Locators that will run for `descriptor`, in priority order.
    fn chain_for(&self, descriptor: &ActionDescriptor, settings: &Settings) -> Vec<Arc<dyn Locator>> {
        self.chain
            .iter()
            .filter(|l| l.applies_to(descriptor))
            .filter(|l| settings.fallback_to_coordinates || l.method() != LocatorMethod::Coordinate)
            .cloned()
            .collect()
    }

    /// Captures a fresh screen and runs one locator against it, recording the attempt.
    fn run_attempt(
        &self,
        locator: &dyn Locator,
        descriptor: &ActionDescriptor,
        options: &AttemptOptions,
    ) -> Attempted {
        let method = locator.method();
        let started = Instant::now();
        let screen = match self.capture.capture_screen() {
            Ok(screen) => screen,
            Err(e) => {
                self.tracker.record(method, false, started.elapsed());
                return (Err(e), None);
            }
        };
        let result = locator
            .attempt(&screen, descriptor, options)
            .and_then(|detection| accept(detection, options));
        self.tracker.record(method, result.is_ok(), started.elapsed());
        match &result {
            Ok(d) => debug!(%method, confidence = d.confidence, "Attempt succeeded"),
            Err(e) => debug!(%method, "Attempt failed: {e}"),
        }
        (result, Some(screen))
    }

    fn report(
        &self,
        method: Option<LocatorMethod>,
        error: &LocateError,
        descriptor: &ActionDescriptor,
        screen: Option<&Screenshot>,
    ) -> Option<String> {
        self.diagnostics
            .emit(DiagnosticRecord::new(method, error, descriptor), screen)
    }

    fn reject(&self, descriptor: &ActionDescriptor, error: LocateError, started: Instant) -> AutomationResult {
        let screen = self.capture.capture_screen().ok();
        let mut result = AutomationResult::failed(None, &error, started.elapsed());
        result.screenshot_ref = self.report(None, &error, descriptor, screen.as_ref());
        result
    }

    /// Finds the element described by `descriptor`.
    ///
    /// Methods run strictly in priority order, each against a fresh capture.
    /// The first qualifying detection wins. When every method fails, the
    /// recovery coordinator gets exactly one chance per failed method.
    #[instrument(skip(self, descriptor), fields(text = descriptor.target_text(), template = descriptor.template_id()))]
    pub fn locate(&self, descriptor: &ActionDescriptor) -> AutomationResult {
        let started = Instant::now();
        if let Err(error) = descriptor.validate() {
            return self.reject(descriptor, error, started);
        }
        let settings = self.config.current();
        let chain = self.chain_for(descriptor, &settings);
        if chain.is_empty() {
            let error = LocateError::InvalidDescriptor(
                "no enabled locator method applies to the descriptor".to_string(),
            );
            return self.reject(descriptor, error, started);
        }

        let mut attempts = Vec::new();
        let mut failures = Vec::new();
        let mut screenshot_ref = None;
        for locator in chain {
            let method = locator.method();
            let options = AttemptOptions::for_method(descriptor, method, &settings);
            let (result, screen) = self.run_attempt(locator.as_ref(), descriptor, &options);
            match result {
                Ok(detection) => {
                    info!(%method, confidence = detection.confidence, "Element located");
                    attempts.push(detection.clone());
                    let mut result = AutomationResult::succeeded(&detection, started.elapsed());
                    result.attempts = attempts;
                    return result;
                }
                Err(error) => {
                    attempts.push(DetectionResult::failed(method, &error));
                    if let Some(r) = self.report(Some(method), &error, descriptor, screen.as_ref()) {
                        screenshot_ref = Some(r);
                    }
                    failures.push(Failure {
                        locator,
                        error,
                        options,
                    });
                }
            }
        }

        self.recover_all(descriptor, &settings, failures, attempts, screenshot_ref, started)
    }

    fn recover_all(
        &self,
        descriptor: &ActionDescriptor,
        settings: &Settings,
        failures: Vec<Failure>,
        mut attempts: Vec<DetectionResult>,
        mut screenshot_ref: Option<String>,
        started: Instant,
    ) -> AutomationResult {
        let mut recovery_attempts = Vec::with_capacity(failures.len());
        for failure in &failures {
            let method = failure.locator.method();
            let mut recovered = None;
            let attempt = self.recovery.recover(
                method,
                &failure.error,
                &failure.options,
                settings,
                |options| {
                    let (result, screen) = self.run_attempt(failure.locator.as_ref(), descriptor, options);
                    match &result {
                        Ok(detection) => {
                            attempts.push(detection.clone());
                            recovered = Some(detection.clone());
                        }
                        Err(error) => {
                            attempts.push(DetectionResult::failed(method, error));
                            if let Some(r) = self.report(Some(method), error, descriptor, screen.as_ref()) {
                                screenshot_ref = Some(r);
                            }
                        }
                    }
                    result
                },
            );
            recovery_attempts.push(attempt);
            if let Some(detection) = recovered {
                info!(%method, "Element located after recovery");
                let mut result = AutomationResult::succeeded(&detection, started.elapsed());
                result.attempts = attempts;
                result.recovery_attempts = recovery_attempts;
                return result;
            }
        }

        let best_observed = failures
            .iter()
            .filter_map(|f| f.error.observed_confidence())
            .fold(0.0_f32, f32::max);
        // Report the lowest-priority method tried; it is the one the caller fell back to last.
        let last = failures.last();
        let error = last.map(|f| f.error.clone()).unwrap_or_else(|| {
            LocateError::DetectionNotFound("no locator produced a result".to_string())
        });
        warn!(methods = failures.len(), "All locator methods failed: {error}");
        let mut result =
            AutomationResult::failed(last.map(|f| f.locator.method()), &error, started.elapsed());
        result.confidence = Some(best_observed);
        result.screenshot_ref = screenshot_ref;
        result.attempts = attempts;
        result.recovery_attempts = recovery_attempts;
        result
    }

    /// Locates the element and applies the descriptor's interaction to it.
    ///
    /// Clicks at a bare coordinate are verified by comparing the screen before
    /// and after; a click that changes nothing is handed to recovery, which
    /// retries at small offsets.
    #[instrument(skip(self, descriptor), fields(interaction = ?descriptor.interaction()))]
    pub fn perform(&self, descriptor: &ActionDescriptor) -> AutomationResult {
        let started = Instant::now();
        let Some(input) = self.input.clone() else {
            let error = LocateError::TargetUnavailable("no input injector configured".to_string());
            return self.reject(descriptor, error, started);
        };
        let mut located = self.locate(descriptor);
        if !located.success {
            return located;
        }
        let (Some(method), Some(point)) = (located.method, located.location) else {
            return located;
        };

        let settings = self.config.current();
        let error = match self.interact(input.as_ref(), descriptor, method, point, &settings) {
            Ok(()) => {
                located.elapsed_ms = started.elapsed().as_millis() as u64;
                return located;
            }
            Err(error) => error,
        };

        let screen = self.capture.capture_screen().ok();
        let mut screenshot_ref = self.report(Some(method), &error, descriptor, screen.as_ref());
        let Some(locator) = self.chain.iter().find(|l| l.method() == method).cloned() else {
            let mut result = AutomationResult::failed(Some(method), &error, started.elapsed());
            result.screenshot_ref = screenshot_ref;
            return result;
        };

        let options = AttemptOptions::for_method(descriptor, method, &settings);
        let mut recovered = None;
        let attempt = self
            .recovery
            .recover(method, &error, &options, &settings, |options| {
                let (result, screen) = self.run_attempt(locator.as_ref(), descriptor, options);
                let result = result.and_then(|detection| {
                    let point = detection.location.ok_or_else(|| {
                        LocateError::DetectionNotFound("detection carries no point".to_string())
                    })?;
                    self.interact(input.as_ref(), descriptor, method, point, &settings)?;
                    Ok(detection)
                });
                match &result {
                    Ok(detection) => recovered = Some(detection.clone()),
                    Err(e) => {
                        if let Some(r) = self.report(Some(method), e, descriptor, screen.as_ref()) {
                            screenshot_ref = Some(r);
                        }
                    }
                }
                result
            });

        let mut result = match &recovered {
            Some(detection) => AutomationResult::succeeded(detection, started.elapsed()),
            None => {
                let mut failed = AutomationResult::failed(Some(method), &error, started.elapsed());
                failed.screenshot_ref = screenshot_ref;
                failed
            }
        };
        result.attempts = std::mem::take(&mut located.attempts);
        result.recovery_attempts = std::mem::take(&mut located.recovery_attempts);
        result.recovery_attempts.push(attempt);
        result
    }

    fn interact(
        &self,
        input: &dyn InputInjector,
        descriptor: &ActionDescriptor,
        method: LocatorMethod,
        point: Point,
        settings: &Settings,
    ) -> Result<(), LocateError> {
        let before = match method {
            LocatorMethod::Coordinate => Some(self.capture.capture_screen()?),
            LocatorMethod::Text | LocatorMethod::Template => None,
        };
        input.click(point.x, point.y)?;
        if let Some(before) = before {
            let after = self.capture.capture_screen()?;
            let changed = before.changed_fraction(&after);
            debug!(changed, %point, "Screen change after coordinate click");
            if changed < settings.effect_change_threshold {
                return Err(LocateError::NoObservableEffect { point });
            }
        }
        let payload = descriptor.input_text().unwrap_or_default();
        match descriptor.interaction() {
            InteractionKind::Click => Ok(()),
            InteractionKind::Type => input.type_text(payload),
            InteractionKind::KeySequence => input.send_keys(payload),
        }
    }

    /// Runs [`locate`](Self::locate) on the blocking thread pool.
    pub async fn locate_async(self: Arc<Self>, descriptor: ActionDescriptor) -> AutomationResult {
        let started = Instant::now();
        task::spawn_blocking(move || self.locate(&descriptor))
            .await
            .unwrap_or_else(|e| {
                let error = LocateError::TransientIo(format!("Task join error: {e}"));
                AutomationResult::failed(None, &error, started.elapsed())
            })
    }

    /// Runs [`perform`](Self::perform) on the blocking thread pool.
    pub async fn perform_async(self: Arc<Self>, descriptor: ActionDescriptor) -> AutomationResult {
        let started = Instant::now();
        task::spawn_blocking(move || self.perform(&descriptor))
            .await
            .unwrap_or_else(|e| {
                let error = LocateError::TransientIo(format!("Task join error: {e}"));
                AutomationResult::failed(None, &error, started.elapsed())
            })
    }

    /// Looks for `descriptor` once without recording statistics, diagnostics or recovery.
    ///
    /// A bare fallback point is not visual evidence, so the coordinate method is skipped.
    pub fn probe(&self, descriptor: &ActionDescriptor) -> Option<DetectionResult> {
        let settings = self.config.current();
        let screen = self.capture.capture_screen().ok()?;
        self.chain_for(descriptor, &settings)
            .iter()
            .filter(|l| l.method() != LocatorMethod::Coordinate)
            .find_map(|locator| {
                let options = AttemptOptions::for_method(descriptor, locator.method(), &settings);
                locator
                    .attempt(&screen, descriptor, &options)
                    .and_then(|d| accept(d, &options))
                    .ok()
            })
    }

    /// Blocks until the audio monitor finishes or `visual_cue` appears on screen.
    ///
    /// The monitor is cancelled when the visual cue wins.
    pub fn wait_for_completion(
        &self,
        monitor: AudioMonitorHandle,
        visual_cue: Option<&ActionDescriptor>,
        poll_interval: Duration,
    ) -> Result<CompletionSignal, AudioError> {
        loop {
            if monitor.is_detected() || monitor.is_finished() {
                return monitor.wait().map(CompletionSignal::Audio);
            }
            if let Some(detection) = visual_cue.and_then(|cue| self.probe(cue)) {
                info!(method = %detection.method, "Completion cue visible on screen");
                drop(monitor);
                return Ok(CompletionSignal::Visual(detection));
            }
            std::thread::sleep(poll_interval);
        }
    }
}

/// Enforces the found flag and, except for bare coordinates, the threshold.
fn accept(detection: DetectionResult, options: &AttemptOptions) -> Result<DetectionResult, LocateError> {
    if !detection.found {
        return Err(LocateError::DetectionNotFound(
            detection
                .error
                .unwrap_or_else(|| "locator reported no match".to_string()),
        ));
    }
    if detection.method != LocatorMethod::Coordinate && detection.confidence < options.threshold {
        return Err(LocateError::LowConfidence {
            observed: detection.confidence,
            threshold: options.threshold,
        });
    }
    Ok(detection)
}

pub struct ElementLocatorBuilder {
    capture: Arc<dyn ScreenCapture>,
    text: Option<Arc<dyn Locator>>,
    template: Option<Arc<dyn Locator>>,
    coordinate: Arc<dyn Locator>,
    templates: Option<Arc<TemplateStore>>,
    input: Option<Arc<dyn InputInjector>>,
    restarter: Option<Arc<dyn TargetRestarter>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    tracker: Option<Arc<PerformanceTracker>>,
    config: Option<ConfigHandle>,
}

impl ElementLocatorBuilder {
    fn new(capture: Arc<dyn ScreenCapture>) -> Self {
        Self {
            capture,
            text: None,
            template: None,
            coordinate: Arc::new(CoordinateResolver),
            templates: None,
            input: None,
            restarter: None,
            diagnostics: None,
            tracker: None,
            config: None,
        }
    }

    /// Enables the text method with the given recognition backend.
    pub fn ocr(self, engine: Arc<dyn OcrEngine>) -> Self {
        self.text_locator(Arc::new(TextLocator::new(engine)))
    }

    /// Enables the template method over `store`, which also supplies alternate variant names.
    pub fn templates(mut self, store: Arc<TemplateStore>) -> Self {
        self.template = Some(Arc::new(TemplateLocator::new(store.clone())));
        self.templates = Some(store);
        self
    }

    pub fn text_locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.text = Some(locator);
        self
    }

    pub fn template_locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.template = Some(locator);
        self
    }

    pub fn coordinate_locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.coordinate = locator;
        self
    }

    pub fn input(mut self, input: Arc<dyn InputInjector>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn restarter(mut self, restarter: Arc<dyn TargetRestarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn tracker(mut self, tracker: Arc<PerformanceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> ElementLocator {
        let chain: Vec<Arc<dyn Locator>> = [self.text, self.template, Some(self.coordinate)]
            .into_iter()
            .flatten()
            .collect();
        ElementLocator {
            capture: self.capture,
            chain,
            input: self.input,
            recovery: RecoveryCoordinator::new(self.templates, self.restarter),
            diagnostics: self
                .diagnostics
                .unwrap_or_else(|| Arc::new(MemoryDiagnosticsSink::new())),
            tracker: self.tracker.unwrap_or_default(),
            config: self.config.unwrap_or_default(),
        }
    }
}
