//! Audio completion detection.
//!
//! A monitor run owns one capture stream on a dedicated thread and classifies
//! every frame by its 1-8 kHz band-energy ratio and its RMS amplitude relative
//! to a calibrated noise floor. The foreground only ever sees latched flags,
//! the monitor state, and the final [`AudioDetectionResult`].

use crate::capture::{AudioCapture, AudioStream};
use crate::config::{ConfigHandle, Settings};
use crate::errors::{AudioError, LocateError};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const BAND_LOW_HZ: f32 = 1_000.0;
const BAND_HIGH_HZ: f32 = 8_000.0;
/// Longest a monitor thread blocks on the stream before re-checking cancellation.
const FRAME_WAIT: Duration = Duration::from_millis(50);
const MIN_NOISE_FLOOR: f32 = 1e-4;
/// Used until a calibration has run.
const DEFAULT_NOISE_FLOOR: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundKind {
    /// Short, bright click.
    Click,
    /// Longer, duller completion chime.
    Completion,
}

impl fmt::Display for SoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SoundKind::Click => "click",
            SoundKind::Completion => "completion",
        })
    }
}

/// Lifecycle of the monitor's single run slot.
///
/// A run moves `Idle -> Monitoring -> Detected | TimedOut`. The terminal state
/// stays readable until the run's handle is waited on or dropped, which
/// returns the monitor to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Idle = 0,
    Monitoring = 1,
    Detected = 2,
    TimedOut = 3,
}

impl MonitorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MonitorState::Monitoring,
            2 => MonitorState::Detected,
            3 => MonitorState::TimedOut,
            _ => MonitorState::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDetectionResult {
    pub kind: SoundKind,
    pub detected: bool,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    /// Set when the run ended because the stream kept failing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AudioDetectionResult {
    /// Converts a run that heard nothing into [`LocateError::AudioTimeout`].
    pub fn into_result(self) -> Result<Self, LocateError> {
        if self.detected {
            Ok(self)
        } else {
            Err(LocateError::AudioTimeout(Duration::from_millis(self.elapsed_ms)))
        }
    }
}

/// Per-frame measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameFeatures {
    /// Share of non-DC spectral power between 1 and 8 kHz.
    pub band_ratio: f32,
    pub rms: f32,
}

/// Windowed FFT over fixed-size frames. Short frames are zero-padded.
pub struct SpectralAnalyzer {
    sample_rate: u32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl SpectralAnalyzer {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        let frame_size = frame_size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(frame_size);
        let denom = (frame_size - 1) as f32;
        let window = (0..frame_size)
            .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / denom).cos())
            .collect();
        Self {
            sample_rate,
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); frame_size],
        }
    }

    pub fn analyze(&mut self, frame: &[f32]) -> FrameFeatures {
        let rms = if frame.is_empty() {
            0.0
        } else {
            (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
        };

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = frame.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let n = self.buffer.len();
        let bin_hz = self.sample_rate as f32 / n as f32;
        let (mut band, mut total) = (0.0_f64, 0.0_f64);
        // DC counts toward the total so an offset signal cannot look bright.
        for (k, bin) in self.buffer.iter().enumerate().take(n / 2 + 1) {
            let power = bin.norm_sqr() as f64;
            total += power;
            let freq = k as f32 * bin_hz;
            if (BAND_LOW_HZ..=BAND_HIGH_HZ).contains(&freq) {
                band += power;
            }
        }
        let band_ratio = if total > 0.0 { (band / total) as f32 } else { 0.0 };
        FrameFeatures { band_ratio, rms }
    }
}

/// Decision rule for both sound kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundClassifier {
    pub click_band_ratio: f32,
    pub click_noise_multiplier: f32,
    pub completion_noise_multiplier: f32,
}

impl SoundClassifier {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            click_band_ratio: settings.click_sound_threshold,
            click_noise_multiplier: settings.click_noise_multiplier,
            completion_noise_multiplier: settings.completion_sound_threshold,
        }
    }

    pub fn matches(&self, kind: SoundKind, features: &FrameFeatures, noise_floor: f32) -> bool {
        match kind {
            SoundKind::Click => {
                features.band_ratio > self.click_band_ratio
                    && features.rms > self.click_noise_multiplier * noise_floor
            }
            // Amplitude alone; the chime has no reliable spectral signature.
            SoundKind::Completion => features.rms > self.completion_noise_multiplier * noise_floor,
        }
    }
}

/// State shared between the monitor, its handles, and the capture thread.
struct Shared {
    state: AtomicU8,
    noise_floor: AtomicU32,
    click: AtomicBool,
    completion: AtomicBool,
}

impl Shared {
    fn latch(&self, kind: SoundKind) -> &AtomicBool {
        match kind {
            SoundKind::Click => &self.click,
            SoundKind::Completion => &self.completion,
        }
    }

    fn set_state(&self, state: MonitorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Moves `Idle` to `Monitoring`, failing if a run is already active.
    fn claim(&self) -> Result<(), AudioError> {
        self.state
            .compare_exchange(
                MonitorState::Idle as u8,
                MonitorState::Monitoring as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|_| AudioError::AlreadyMonitoring)
    }

    fn noise_floor(&self) -> f32 {
        f32::from_bits(self.noise_floor.load(Ordering::SeqCst))
    }
}

/// Listens for click and completion sounds, one monitoring run at a time.
pub struct AudioSignalMonitor {
    capture: Arc<dyn AudioCapture>,
    config: ConfigHandle,
    shared: Arc<Shared>,
}

impl AudioSignalMonitor {
    /// Creates the monitor and, when `background_noise_calibration` is set,
    /// calibrates the noise floor from ambient audio.
    pub fn new(capture: Arc<dyn AudioCapture>, config: ConfigHandle) -> Result<Self, AudioError> {
        let monitor = Self {
            capture,
            config,
            shared: Arc::new(Shared {
                state: AtomicU8::new(MonitorState::Idle as u8),
                noise_floor: AtomicU32::new(DEFAULT_NOISE_FLOOR.to_bits()),
                click: AtomicBool::new(false),
                completion: AtomicBool::new(false),
            }),
        };
        if monitor.config.current().background_noise_calibration {
            monitor.recalibrate()?;
        }
        Ok(monitor)
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn noise_floor(&self) -> f32 {
        self.shared.noise_floor()
    }

    /// Latched flag; reading never clears it.
    pub fn is_detected(&self, kind: SoundKind) -> bool {
        self.shared.latch(kind).load(Ordering::SeqCst)
    }

    pub fn reset_detection(&self, kind: SoundKind) {
        self.shared.latch(kind).store(false, Ordering::SeqCst);
    }

    /// Samples ambient audio for `calibration_window_ms` and stores the mean RMS
    /// as the new noise floor. The state reads `Monitoring` while this runs.
    #[instrument(skip(self))]
    pub fn recalibrate(&self) -> Result<f32, AudioError> {
        self.shared.claim()?;
        let result = self.measure_ambient();
        self.shared.set_state(MonitorState::Idle);
        let floor = result?.max(MIN_NOISE_FLOOR);
        self.shared.noise_floor.store(floor.to_bits(), Ordering::SeqCst);
        info!(noise_floor = floor, "Calibrated audio noise floor");
        Ok(floor)
    }

    fn measure_ambient(&self) -> Result<f32, AudioError> {
        let settings = self.config.current();
        let samples_wanted =
            settings.calibration_window().as_secs_f64() * settings.sample_rate as f64;
        let frames_wanted = (samples_wanted / settings.frame_size as f64).ceil().max(1.0) as usize;
        // Wall-clock guard against a stream that stops delivering.
        let deadline = Instant::now() + settings.calibration_window() * 4 + Duration::from_secs(1);

        let mut stream = self
            .capture
            .open_audio_stream(settings.sample_rate, settings.frame_size)?;
        let mut levels = Vec::with_capacity(frames_wanted);
        let mut retried = false;
        let outcome = loop {
            if levels.len() >= frames_wanted || Instant::now() >= deadline {
                break Ok(());
            }
            match stream.next_frame(FRAME_WAIT) {
                Ok(Some(frame)) if !frame.is_empty() => {
                    retried = false;
                    let rms = (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt();
                    levels.push(rms);
                }
                Ok(_) => {}
                Err(e) if !retried => {
                    warn!("Audio read failed during calibration, retrying once: {e}");
                    retried = true;
                }
                Err(e) => break Err(e),
            }
        };
        stream.close();
        outcome?;

        if levels.is_empty() {
            return Err(AudioError::NoCalibrationData);
        }
        Ok(levels.iter().sum::<f32>() / levels.len() as f32)
    }

    /// Starts listening for `kind` on a background thread.
    ///
    /// Clears the latch for `kind` first, so a stale detection from an earlier
    /// run cannot end this one.
    #[instrument(skip(self))]
    pub fn start(&self, kind: SoundKind, timeout: Duration) -> Result<AudioMonitorHandle, AudioError> {
        self.shared.claim()?;
        let settings = self.config.current();
        let stream = match self
            .capture
            .open_audio_stream(settings.sample_rate, settings.frame_size)
        {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.set_state(MonitorState::Idle);
                return Err(e);
            }
        };
        self.reset_detection(kind);

        let run = MonitorRun {
            kind,
            timeout,
            noise_floor: self.shared.noise_floor(),
            classifier: SoundClassifier::from_settings(&settings),
            analyzer: SpectralAnalyzer::new(settings.sample_rate, settings.frame_size),
            shared: self.shared.clone(),
            token: CancellationToken::new(),
        };
        let token = run.token.clone();
        let thread = thread::Builder::new()
            .name(format!("pixelpilot-audio-{kind}"))
            .spawn(move || run.execute(stream))
            .map_err(|e| {
                self.shared.set_state(MonitorState::Idle);
                AudioError::TaskFailed(e.to_string())
            })?;
        debug!(%kind, ?timeout, "Audio monitor started");

        Ok(AudioMonitorHandle {
            kind,
            shared: self.shared.clone(),
            token,
            thread: Some(thread),
        })
    }

    /// Starts a run with the configured `audio_timeout_ms` and blocks until it ends.
    pub fn wait_for(&self, kind: SoundKind) -> Result<AudioDetectionResult, AudioError> {
        let timeout = self.config.current().audio_timeout();
        self.start(kind, timeout)?.wait()
    }
}

/// Everything the capture thread owns for one run.
struct MonitorRun {
    kind: SoundKind,
    timeout: Duration,
    noise_floor: f32,
    classifier: SoundClassifier,
    analyzer: SpectralAnalyzer,
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl MonitorRun {
    fn execute(mut self, mut stream: Box<dyn AudioStream>) -> AudioDetectionResult {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut detected = false;
        let mut error = None;
        let mut retried = false;

        while !self.token.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match stream.next_frame((deadline - now).min(FRAME_WAIT)) {
                Ok(Some(frame)) => {
                    retried = false;
                    if frame.is_empty() {
                        continue;
                    }
                    let features = self.analyzer.analyze(&frame);
                    if self.classifier.matches(self.kind, &features, self.noise_floor) {
                        self.shared.latch(self.kind).store(true, Ordering::SeqCst);
                        detected = true;
                        debug!(kind = %self.kind, ?features, "Sound detected");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) if !retried => {
                    warn!("Audio read failed, retrying once: {e}");
                    retried = true;
                }
                Err(e) => {
                    warn!("Audio read failed again, ending monitor run: {e}");
                    error = Some(e.to_string());
                    break;
                }
            }
        }
        stream.close();

        let elapsed = started.elapsed();
        self.shared.set_state(if detected {
            MonitorState::Detected
        } else {
            MonitorState::TimedOut
        });
        info!(kind = %self.kind, detected, elapsed_ms = elapsed.as_millis() as u64, "Audio monitor finished");

        AudioDetectionResult {
            kind: self.kind,
            detected,
            elapsed_ms: elapsed.as_millis() as u64,
            timed_out: !detected,
            error,
        }
    }
}

/// Owns one monitor run. Dropping the handle cancels the run and joins its thread.
///
/// The monitor only returns to `Idle` once the handle is waited on or dropped.
pub struct AudioMonitorHandle {
    kind: SoundKind,
    shared: Arc<Shared>,
    token: CancellationToken,
    thread: Option<thread::JoinHandle<AudioDetectionResult>>,
}

impl AudioMonitorHandle {
    pub fn kind(&self) -> SoundKind {
        self.kind
    }

    pub fn is_detected(&self) -> bool {
        self.shared.latch(self.kind).load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Asks the run to stop; it closes its stream and reports a timeout.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn wait(mut self) -> Result<AudioDetectionResult, AudioError> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| AudioError::TaskFailed("monitor already joined".to_string()))?;
        let joined = thread.join();
        self.shared.set_state(MonitorState::Idle);
        joined.map_err(|_| AudioError::TaskFailed("audio monitor thread panicked".to_string()))
    }

    pub async fn wait_async(self) -> Result<AudioDetectionResult, AudioError> {
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|e| AudioError::TaskFailed(format!("Task join error: {e}")))?
    }
}

impl Drop for AudioMonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            self.shared.set_state(MonitorState::Idle);
        }
    }
}
