use crate::descriptor::Point;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Discriminant of a [`LocateError`], used for reporting and for recovery dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DetectionNotFound,
    LowConfidence,
    TemplateMissing,
    AudioTimeout,
    TargetUnavailable,
    TransientIo,
    Timeout,
    NoObservableEffect,
    InvalidDescriptor,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocateError {
    #[error("Detection not found: {0}")]
    DetectionNotFound(String),

    #[error("Match confidence {observed:.3} is below threshold {threshold:.3}")]
    LowConfidence { observed: f32, threshold: f32 },

    #[error("No stored template for id: {0}")]
    TemplateMissing(String),

    #[error("No qualifying sound within {0:?}")]
    AudioTimeout(Duration),

    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Operation exceeded timeout: took {elapsed:?}, budget was {budget:?}")]
    Timeout { elapsed: Duration, budget: Duration },

    #[error("Click at {point} produced no observable effect")]
    NoObservableEffect { point: Point },

    #[error("Invalid action descriptor: {0}")]
    InvalidDescriptor(String),
}

impl LocateError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LocateError::DetectionNotFound(_) => FailureKind::DetectionNotFound,
            LocateError::LowConfidence { .. } => FailureKind::LowConfidence,
            LocateError::TemplateMissing(_) => FailureKind::TemplateMissing,
            LocateError::AudioTimeout(_) => FailureKind::AudioTimeout,
            LocateError::TargetUnavailable(_) => FailureKind::TargetUnavailable,
            LocateError::TransientIo(_) => FailureKind::TransientIo,
            LocateError::Timeout { .. } => FailureKind::Timeout,
            LocateError::NoObservableEffect { .. } => FailureKind::NoObservableEffect,
            LocateError::InvalidDescriptor(_) => FailureKind::InvalidDescriptor,
        }
    }

    /// Confidence the failing method actually observed, when it got that far.
    pub fn observed_confidence(&self) -> Option<f32> {
        match self {
            LocateError::LowConfidence { observed, .. } => Some(*observed),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Failed to open audio stream: {0}")]
    StreamOpen(String),

    #[error("Audio stream read failed: {0}")]
    StreamRead(String),

    #[error("Audio monitor is already running")]
    AlreadyMonitoring,

    #[error("Calibration captured no audio frames")]
    NoCalibrationData,

    #[error("Audio monitor task failed: {0}")]
    TaskFailed(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Config handle has no backing file")]
    NoBackingFile,

    #[error("Failed to watch config file: {0}")]
    Watch(#[from] notify::Error),
}

#[derive(Error, Debug)]
pub enum TemplateStoreError {
    #[error("Template store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode or encode template image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid template id: {0}")]
    InvalidId(String),

    #[error("Capture region {0} lies outside the screenshot")]
    RegionOutOfBounds(String),

    #[error("Template store has no backing directory")]
    NoBackingDirectory,
}
