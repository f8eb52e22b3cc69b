//! Action descriptors: the immutable description of one UI interaction.

use crate::detection::LocatorMethod;
use crate::errors::LocateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.8;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// A screen coordinate in physical pixels. Serialized as an `(x, y)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
        }
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

impl From<Point> for (i32, i32) {
    fn from(p: Point) -> Self {
        (p.x, p.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Axis-aligned rectangle in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }

    pub fn translate(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..self
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.y >= self.y
            && (point.x as i64) < self.x as i64 + self.width as i64
            && (point.y as i64) < self.y as i64 + self.height as i64
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    #[default]
    Click,
    Type,
    KeySequence,
}

/// Wire shape of a descriptor, validated into [`ActionDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptorFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback_point: Option<Point>,
    #[serde(default)]
    interaction: InteractionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confidence_threshold: Option<f32>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search_region: Option<BoundingBox>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Immutable description of one UI interaction.
///
/// At least one of target text, template id, or fallback point is always
/// present; constructors and deserialization both enforce it.
///
/// ```
/// use pixelpilot::{ActionDescriptor, Point};
///
/// let descriptor = ActionDescriptor::for_text("Import")
///     .with_template("import_button")
///     .with_fallback_point(Point::new(120, 48))
///     .with_threshold(0.85);
/// assert_eq!(descriptor.target_text(), Some("Import"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorFields", into = "DescriptorFields")]
pub struct ActionDescriptor {
    target_text: Option<String>,
    template_id: Option<String>,
    fallback_point: Option<Point>,
    interaction: InteractionKind,
    input_text: Option<String>,
    confidence_threshold: Option<f32>,
    timeout_ms: u64,
    search_region: Option<BoundingBox>,
}

impl ActionDescriptor {
    fn empty() -> Self {
        Self {
            target_text: None,
            template_id: None,
            fallback_point: None,
            interaction: InteractionKind::Click,
            input_text: None,
            confidence_threshold: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            search_region: None,
        }
    }

    pub fn for_text(text: impl Into<String>) -> Self {
        Self::empty().with_text(text)
    }

    pub fn for_template(template_id: impl Into<String>) -> Self {
        Self::empty().with_template(template_id)
    }

    pub fn for_point(point: Point) -> Self {
        Self::empty().with_fallback_point(point)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.target_text = Some(text.into());
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_fallback_point(mut self, point: Point) -> Self {
        self.fallback_point = Some(point);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the interaction. `input` is the text to type or the key sequence to send.
    pub fn with_interaction(mut self, kind: InteractionKind, input: Option<String>) -> Self {
        self.interaction = kind;
        self.input_text = input;
        self
    }

    /// Restricts text and template search to a region of the screen.
    pub fn within(mut self, region: BoundingBox) -> Self {
        self.search_region = Some(region);
        self
    }

    pub fn target_text(&self) -> Option<&str> {
        self.target_text.as_deref()
    }

    pub fn template_id(&self) -> Option<&str> {
        self.template_id.as_deref()
    }

    pub fn fallback_point(&self) -> Option<Point> {
        self.fallback_point
    }

    pub fn interaction(&self) -> InteractionKind {
        self.interaction
    }

    pub fn input_text(&self) -> Option<&str> {
        self.input_text.as_deref()
    }

    pub fn confidence_threshold(&self) -> Option<f32> {
        self.confidence_threshold
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn search_region(&self) -> Option<BoundingBox> {
        self.search_region
    }

    /// Threshold a method must meet: the descriptor's own value, else the
    /// configured per-method default.
    pub fn threshold_for(&self, method: LocatorMethod, settings: &crate::Settings) -> f32 {
        if let Some(threshold) = self.confidence_threshold {
            return threshold;
        }
        match method {
            LocatorMethod::Text => settings.ocr_confidence_threshold,
            LocatorMethod::Template => settings.template_confidence_threshold,
            LocatorMethod::Coordinate => 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), LocateError> {
        let has_text = self
            .target_text
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        let has_template = self
            .template_id
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        if !has_text && !has_template && self.fallback_point.is_none() {
            return Err(LocateError::InvalidDescriptor(
                "at least one of target_text, template_id or fallback_point is required"
                    .to_string(),
            ));
        }
        if let Some(threshold) = self.confidence_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(LocateError::InvalidDescriptor(format!(
                    "confidence_threshold {threshold} is outside [0, 1]"
                )));
            }
        }
        if self.timeout_ms == 0 {
            return Err(LocateError::InvalidDescriptor(
                "timeout_ms must be positive".to_string(),
            ));
        }
        if matches!(
            self.interaction,
            InteractionKind::Type | InteractionKind::KeySequence
        ) && self.input_text.is_none()
        {
            return Err(LocateError::InvalidDescriptor(format!(
                "{:?} interaction requires input_text",
                self.interaction
            )));
        }
        Ok(())
    }
}

impl TryFrom<DescriptorFields> for ActionDescriptor {
    type Error = LocateError;

    fn try_from(fields: DescriptorFields) -> Result<Self, Self::Error> {
        let descriptor = Self {
            target_text: fields.target_text,
            template_id: fields.template_id,
            fallback_point: fields.fallback_point,
            interaction: fields.interaction,
            input_text: fields.input_text,
            confidence_threshold: fields.confidence_threshold,
            timeout_ms: fields.timeout_ms,
            search_region: fields.search_region,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

impl From<ActionDescriptor> for DescriptorFields {
    fn from(d: ActionDescriptor) -> Self {
        Self {
            target_text: d.target_text,
            template_id: d.template_id,
            fallback_point: d.fallback_point,
            interaction: d.interaction,
            input_text: d.input_text,
            confidence_threshold: d.confidence_threshold,
            timeout_ms: d.timeout_ms,
            search_region: d.search_region,
        }
    }
}
