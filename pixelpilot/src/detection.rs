//! Outcomes of locator attempts and of whole automation calls.

use crate::descriptor::{BoundingBox, Point};
use crate::errors::{FailureKind, LocateError};
use crate::recovery::RecoveryAttempt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The sensing method a locator uses. Ordering follows fallback priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocatorMethod {
    Text,
    Template,
    Coordinate,
}

impl LocatorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocatorMethod::Text => "text",
            LocatorMethod::Template => "template",
            LocatorMethod::Coordinate => "coordinate",
        }
    }
}

impl fmt::Display for LocatorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one locator attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub found: bool,
    pub location: Option<Point>,
    pub confidence: f32,
    pub bounding_box: Option<BoundingBox>,
    pub method: LocatorMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResult {
    /// A qualifying match; the click point is the box center.
    pub fn matched(method: LocatorMethod, bounding_box: BoundingBox, confidence: f32) -> Self {
        Self {
            found: true,
            location: Some(bounding_box.center()),
            confidence: confidence.clamp(0.0, 1.0),
            bounding_box: Some(bounding_box),
            method,
            error: None,
        }
    }

    /// A fixed point that is not backed by any visual evidence.
    pub fn at_point(method: LocatorMethod, point: Point) -> Self {
        Self {
            found: true,
            location: Some(point),
            confidence: 1.0,
            bounding_box: None,
            method,
            error: None,
        }
    }

    pub fn failed(method: LocatorMethod, error: &LocateError) -> Self {
        Self {
            found: false,
            location: None,
            confidence: error.observed_confidence().unwrap_or(0.0),
            bounding_box: None,
            method,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome returned to the caller of the element locator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutomationResult {
    pub success: bool,
    /// Method that produced the result, or the last one attempted on failure.
    pub method: Option<LocatorMethod>,
    pub elapsed_ms: u64,
    pub confidence: Option<f32>,
    pub location: Option<Point>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub screenshot_ref: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<DetectionResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovery_attempts: Vec<RecoveryAttempt>,
}

impl AutomationResult {
    pub fn succeeded(detection: &DetectionResult, elapsed: Duration) -> Self {
        Self {
            success: true,
            method: Some(detection.method),
            elapsed_ms: elapsed.as_millis() as u64,
            confidence: Some(detection.confidence),
            location: detection.location,
            error: None,
            failure_kind: None,
            screenshot_ref: None,
            attempts: Vec::new(),
            recovery_attempts: Vec::new(),
        }
    }

    pub fn failed(method: Option<LocatorMethod>, error: &LocateError, elapsed: Duration) -> Self {
        Self {
            success: false,
            method,
            elapsed_ms: elapsed.as_millis() as u64,
            confidence: error.observed_confidence(),
            location: None,
            error: Some(error.to_string()),
            failure_kind: Some(error.kind()),
            screenshot_ref: None,
            attempts: Vec::new(),
            recovery_attempts: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}
