//! Runtime settings, loaded from TOML and hot-reloadable.

use crate::errors::ConfigError;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Quiet period after a file event before the file is re-read.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ocr_confidence_threshold: f32,
    pub template_confidence_threshold: f32,
    /// Fraction of spectral energy in the 1-8 kHz band needed for a click.
    pub click_sound_threshold: f32,
    /// Noise-floor multiple a click must exceed.
    pub click_noise_multiplier: f32,
    /// Noise-floor multiple a completion chime must exceed.
    pub completion_sound_threshold: f32,
    pub background_noise_calibration: bool,
    pub audio_timeout_ms: u64,
    pub fallback_to_coordinates: bool,
    pub calibration_window_ms: u64,
    pub sample_rate: u32,
    pub frame_size: usize,
    /// Applied to the attempt budget by the timeout remediation.
    pub timeout_multiplier: f32,
    /// Pixel offsets tried, in order, when a coordinate click has no effect.
    pub jitter_offsets: Vec<(i32, i32)>,
    /// Changed-pixel fraction below which a click counts as having no effect.
    pub effect_change_threshold: f32,
    pub diagnostics_dir: PathBuf,
    pub template_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ocr_confidence_threshold: 0.8,
            template_confidence_threshold: 0.8,
            click_sound_threshold: 0.3,
            click_noise_multiplier: 3.0,
            completion_sound_threshold: 2.0,
            background_noise_calibration: true,
            audio_timeout_ms: 30_000,
            fallback_to_coordinates: true,
            calibration_window_ms: 1_000,
            sample_rate: 44_100,
            frame_size: 2_048,
            timeout_multiplier: 2.0,
            jitter_offsets: vec![
                (5, 0),
                (-5, 0),
                (0, 5),
                (0, -5),
                (5, 5),
                (-5, -5),
                (5, -5),
                (-5, 5),
            ],
            effect_change_threshold: 0.001,
            diagnostics_dir: PathBuf::from("diagnostics"),
            template_dir: PathBuf::from("templates"),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn audio_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_timeout_ms)
    }

    pub fn calibration_window(&self) -> Duration {
        Duration::from_millis(self.calibration_window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = [
            ("ocr_confidence_threshold", self.ocr_confidence_threshold),
            ("template_confidence_threshold", self.template_confidence_threshold),
            ("click_sound_threshold", self.click_sound_threshold),
            ("effect_change_threshold", self.effect_change_threshold),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} = {value} is outside [0, 1]")));
            }
        }
        let multipliers = [
            ("click_noise_multiplier", self.click_noise_multiplier),
            ("completion_sound_threshold", self.completion_sound_threshold),
            ("timeout_multiplier", self.timeout_multiplier),
        ];
        for (name, value) in multipliers {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} = {value} must be positive")));
            }
        }
        if self.sample_rate == 0 || self.frame_size == 0 {
            return Err(ConfigError::Invalid(
                "sample_rate and frame_size must be non-zero".to_string(),
            ));
        }
        if self.audio_timeout_ms == 0 {
            return Err(ConfigError::Invalid("audio_timeout_ms must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Shared, atomically swappable settings.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: Arc<RwLock<Arc<Settings>>>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl ConfigHandle {
    /// A handle with no backing file.
    pub fn new(settings: Settings) -> Self {
        Self {
            path: None,
            current: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let settings = Settings::load(&path)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(Self {
            path: Some(path),
            current: Arc::new(RwLock::new(Arc::new(settings))),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Re-reads the backing file. On any error the previous settings stay in effect.
    pub fn reload(&self) -> Result<Arc<Settings>, ConfigError> {
        let path = self.path.as_deref().ok_or(ConfigError::NoBackingFile)?;
        let settings = Arc::new(Settings::load(path)?);
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = settings.clone();
        Ok(settings)
    }

    pub fn replace(&self, settings: Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(settings);
        Ok(())
    }
}

/// Stops watching when dropped.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reloads `handle` whenever its backing file is created or modified.
///
/// Must be called from within a tokio runtime. The parent directory is watched
/// so editors that replace the file on save are still seen.
pub fn watch_config(handle: ConfigHandle) -> Result<ConfigWatcher, ConfigError> {
    let path = handle.path().ok_or(ConfigError::NoBackingFile)?.to_path_buf();
    let file_name: OsString = path
        .file_name()
        .ok_or_else(|| ConfigError::Invalid(format!("{} has no file name", path.display())))?
        .to_os_string();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = event_tx.send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "Watching config file");

    let task = tokio::spawn(async move {
        while let Some(event_result) = event_rx.recv().await {
            let relevant = match event_result {
                Ok(event) => {
                    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(file_name.as_os_str()))
                }
                Err(e) => {
                    warn!("Watch error: {e}");
                    false
                }
            };
            if !relevant {
                continue;
            }
            // Editors often emit several events per save.
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while event_rx.try_recv().is_ok() {}

            match handle.reload() {
                Ok(settings) => debug!(?settings, "Configuration reloaded"),
                Err(e) => error!("Configuration reload failed, keeping previous settings: {e}"),
            }
        }
    });

    Ok(ConfigWatcher {
        _watcher: watcher,
        task,
    })
}
