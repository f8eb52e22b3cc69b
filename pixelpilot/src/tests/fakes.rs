//! In-process stand-ins for capture, recognition, input and audio.

use crate::capture::{AudioCapture, AudioStream, ScreenCapture};
use crate::descriptor::{ActionDescriptor, BoundingBox, Point};
use crate::detection::{DetectionResult, LocatorMethod};
use crate::errors::{AudioError, LocateError};
use crate::input::{InputInjector, TargetRestarter};
use crate::locator::{AttemptOptions, Locator};
use crate::ocr::{OcrEngine, RecognitionMode, RecognizedSpan};
use crate::screenshot::Screenshot;
use image::{GrayImage, Luma, Rgba, RgbaImage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn blank_screen(width: u32, height: u32) -> Screenshot {
    Screenshot::new(RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])))
}

/// Deterministic blocky noise, so every patch of a few blocks is unique.
pub fn textured_gray(width: u32, height: u32, block: u32, seed: u64) -> GrayImage {
    let block = block.max(1);
    let cols = width.div_ceil(block) as u64;
    GrayImage::from_fn(width, height, |x, y| {
        let cell = (y / block) as u64 * cols + (x / block) as u64;
        Luma([(mix(seed.wrapping_mul(1_000_003).wrapping_add(cell)) >> 56) as u8])
    })
}

pub fn screen_from_gray(gray: &GrayImage) -> Screenshot {
    Screenshot::new(RgbaImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y)[0];
        Rgba([v, v, v, 255])
    }))
}

/// splitmix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Uniform noise in `[-amplitude, amplitude]`.
pub fn noise_frame(amplitude: f32, seed: u64, len: usize) -> Vec<f32> {
    (0..len as u64)
        .map(|i| {
            let unit = (mix((seed << 24) ^ i) >> 40) as f32 / (1u64 << 24) as f32;
            (unit * 2.0 - 1.0) * amplitude
        })
        .collect()
}

/// Frame `index` of a continuous sine wave.
pub fn sine_frame(freq: f32, amplitude: f32, sample_rate: u32, len: usize, index: usize) -> Vec<f32> {
    let start = index * len;
    (0..len)
        .map(|i| {
            let t = (start + i) as f64 / sample_rate as f64;
            (amplitude as f64 * (2.0 * std::f64::consts::PI * freq as f64 * t).sin()) as f32
        })
        .collect()
}

/// OCR backend returning fixed spans, optionally different ones per recognition mode.
pub struct ScriptedOcr {
    block: Vec<RecognizedSpan>,
    sparse: Vec<RecognizedSpan>,
    modes: Mutex<Vec<RecognitionMode>>,
}

impl ScriptedOcr {
    pub fn always(spans: Vec<RecognizedSpan>) -> Self {
        Self::per_mode(spans.clone(), spans)
    }

    pub fn per_mode(block: Vec<RecognizedSpan>, sparse: Vec<RecognizedSpan>) -> Self {
        Self {
            block,
            sparse,
            modes: Mutex::new(Vec::new()),
        }
    }

    /// Modes requested so far, in call order.
    pub fn modes(&self) -> Vec<RecognitionMode> {
        self.modes.lock().unwrap().clone()
    }
}

impl OcrEngine for ScriptedOcr {
    fn recognize(
        &self,
        _image: &GrayImage,
        mode: RecognitionMode,
        _budget: Duration,
    ) -> Result<Vec<RecognizedSpan>, LocateError> {
        self.modes.lock().unwrap().push(mode);
        Ok(match mode {
            RecognitionMode::Block => self.block.clone(),
            RecognitionMode::SparseText => self.sparse.clone(),
        })
    }
}

/// Always returns the same screenshot.
pub struct StaticCapture {
    screen: Screenshot,
}

impl StaticCapture {
    pub fn new(screen: Screenshot) -> Self {
        Self { screen }
    }
}

impl ScreenCapture for StaticCapture {
    fn capture_screen(&self) -> Result<Screenshot, LocateError> {
        Ok(self.screen.clone())
    }
}

/// Fails the first `failures` captures with a transient error, then serves `screen`.
pub struct FlakyCapture {
    screen: Screenshot,
    failures: usize,
    captures: AtomicUsize,
}

impl FlakyCapture {
    pub fn new(screen: Screenshot, failures: usize) -> Self {
        Self {
            screen,
            failures,
            captures: AtomicUsize::new(0),
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl ScreenCapture for FlakyCapture {
    fn capture_screen(&self) -> Result<Screenshot, LocateError> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(LocateError::TransientIo(format!("frame grab {n} dropped")));
        }
        Ok(self.screen.clone())
    }
}

type Respond = dyn Fn(&AttemptOptions) -> Result<DetectionResult, LocateError> + Send + Sync;

/// A locator that logs its method on every attempt and answers from a closure.
pub struct RecordingLocator {
    method: LocatorMethod,
    log: Arc<Mutex<Vec<LocatorMethod>>>,
    respond: Box<Respond>,
}

impl RecordingLocator {
    pub fn new(
        method: LocatorMethod,
        log: Arc<Mutex<Vec<LocatorMethod>>>,
        respond: impl Fn(&AttemptOptions) -> Result<DetectionResult, LocateError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            method,
            log,
            respond: Box::new(respond),
        }
    }
}

impl Locator for RecordingLocator {
    fn method(&self) -> LocatorMethod {
        self.method
    }

    fn applies_to(&self, descriptor: &ActionDescriptor) -> bool {
        match self.method {
            LocatorMethod::Text => descriptor.target_text().is_some(),
            LocatorMethod::Template => descriptor.template_id().is_some(),
            LocatorMethod::Coordinate => descriptor.fallback_point().is_some(),
        }
    }

    fn attempt(
        &self,
        _screen: &Screenshot,
        _descriptor: &ActionDescriptor,
        options: &AttemptOptions,
    ) -> Result<DetectionResult, LocateError> {
        self.log.lock().unwrap().push(self.method);
        (self.respond)(options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Click(i32, i32),
    Type(String),
    Keys(String),
}

#[derive(Default)]
pub struct RecordingInput {
    events: Mutex<Vec<InputEvent>>,
}

impl RecordingInput {
    pub fn events(&self) -> Vec<InputEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl InputInjector for RecordingInput {
    fn click(&self, x: i32, y: i32) -> Result<(), LocateError> {
        self.events.lock().unwrap().push(InputEvent::Click(x, y));
        Ok(())
    }

    fn type_text(&self, text: &str) -> Result<(), LocateError> {
        self.events.lock().unwrap().push(InputEvent::Type(text.to_string()));
        Ok(())
    }

    fn send_keys(&self, sequence: &str) -> Result<(), LocateError> {
        self.events.lock().unwrap().push(InputEvent::Keys(sequence.to_string()));
        Ok(())
    }
}

/// A screen that only reacts to clicks landing inside `hot`.
pub struct ClickableScreen {
    idle: Screenshot,
    pressed: Screenshot,
    hot: BoundingBox,
    activated: AtomicBool,
    clicks: Mutex<Vec<Point>>,
}

impl ClickableScreen {
    pub fn new(width: u32, height: u32, hot: BoundingBox) -> Self {
        let idle = RgbaImage::from_pixel(width, height, Rgba([240, 240, 240, 255]));
        let mut pressed = idle.clone();
        for y in hot.y.max(0) as u32..(hot.y as u32 + hot.height).min(height) {
            for x in hot.x.max(0) as u32..(hot.x as u32 + hot.width).min(width) {
                pressed.put_pixel(x, y, Rgba([20, 90, 200, 255]));
            }
        }
        Self {
            idle: Screenshot::new(idle),
            pressed: Screenshot::new(pressed),
            hot,
            activated: AtomicBool::new(false),
            clicks: Mutex::new(Vec::new()),
        }
    }

    pub fn clicks(&self) -> Vec<Point> {
        self.clicks.lock().unwrap().clone()
    }
}

impl ScreenCapture for ClickableScreen {
    fn capture_screen(&self) -> Result<Screenshot, LocateError> {
        if self.activated.load(Ordering::SeqCst) {
            Ok(self.pressed.clone())
        } else {
            Ok(self.idle.clone())
        }
    }
}

impl InputInjector for ClickableScreen {
    fn click(&self, x: i32, y: i32) -> Result<(), LocateError> {
        let point = Point::new(x, y);
        self.clicks.lock().unwrap().push(point);
        if self.hot.contains(point) {
            self.activated.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn type_text(&self, _text: &str) -> Result<(), LocateError> {
        Ok(())
    }

    fn send_keys(&self, _sequence: &str) -> Result<(), LocateError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingRestarter {
    count: AtomicUsize,
}

impl CountingRestarter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl TargetRestarter for CountingRestarter {
    fn restart_target(&self) -> Result<(), LocateError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type FrameFn = dyn Fn(usize) -> Vec<f32> + Send + Sync;

/// Audio source producing frames from a generator indexed by a counter shared
/// across every stream it opens.
pub struct SyntheticAudio {
    generator: Arc<FrameFn>,
    next_frame: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    read_errors: usize,
    fail_open: bool,
    pace: Duration,
}

impl SyntheticAudio {
    pub fn new(generator: impl Fn(usize) -> Vec<f32> + Send + Sync + 'static) -> Self {
        Self {
            generator: Arc::new(generator),
            next_frame: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            read_errors: 0,
            fail_open: false,
            pace: Duration::from_millis(1),
        }
    }

    /// The first `count` reads of every stream fail.
    pub fn with_read_errors(mut self, count: usize) -> Self {
        self.read_errors = count;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Streams closed so far.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AudioCapture for SyntheticAudio {
    fn open_audio_stream(
        &self,
        _sample_rate: u32,
        _frame_size: usize,
    ) -> Result<Box<dyn AudioStream>, AudioError> {
        if self.fail_open {
            return Err(AudioError::StreamOpen("no input device".to_string()));
        }
        Ok(Box::new(SyntheticStream {
            generator: self.generator.clone(),
            next_frame: self.next_frame.clone(),
            closed: self.closed.clone(),
            errors_left: self.read_errors,
            pace: self.pace,
        }))
    }
}

struct SyntheticStream {
    generator: Arc<FrameFn>,
    next_frame: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    errors_left: usize,
    pace: Duration,
}

impl AudioStream for SyntheticStream {
    fn next_frame(&mut self, wait: Duration) -> Result<Option<Vec<f32>>, AudioError> {
        if self.errors_left > 0 {
            self.errors_left -= 1;
            return Err(AudioError::StreamRead("buffer overrun".to_string()));
        }
        std::thread::sleep(self.pace.min(wait));
        let index = self.next_frame.fetch_add(1, Ordering::SeqCst);
        Ok(Some((self.generator)(index)))
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
