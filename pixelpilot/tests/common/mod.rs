#![allow(dead_code)]

use image::{GrayImage, Luma, Rgba, RgbaImage};
use pixelpilot::{
    AudioCapture, AudioError, AudioStream, InputInjector, LocateError, Point, ScreenCapture,
    Screenshot,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RATE: u32 = 44_100;
pub const FRAME: usize = 1_024;

/// Blocky pseudo-random texture; every few-block patch is unique.
pub fn texture(width: u32, height: u32, block: u32, seed: u64) -> GrayImage {
    let cols = width.div_ceil(block) as u64;
    GrayImage::from_fn(width, height, |x, y| {
        let cell = (y / block) as u64 * cols + (x / block) as u64;
        Luma([(splitmix(seed.wrapping_mul(7_919).wrapping_add(cell)) >> 56) as u8])
    })
}

fn splitmix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

pub fn to_screen(gray: &GrayImage) -> Screenshot {
    Screenshot::new(RgbaImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y)[0];
        Rgba([v, v, v, 255])
    }))
}

pub struct FixedScreen(pub Screenshot);

impl ScreenCapture for FixedScreen {
    fn capture_screen(&self) -> Result<Screenshot, LocateError> {
        Ok(self.0.clone())
    }
}

/// Records clicks; the screen never reacts.
#[derive(Default)]
pub struct ClickLog {
    clicks: Mutex<Vec<Point>>,
}

impl ClickLog {
    pub fn clicks(&self) -> Vec<Point> {
        self.clicks.lock().unwrap().clone()
    }
}

impl InputInjector for ClickLog {
    fn click(&self, x: i32, y: i32) -> Result<(), LocateError> {
        self.clicks.lock().unwrap().push(Point::new(x, y));
        Ok(())
    }

    fn type_text(&self, _text: &str) -> Result<(), LocateError> {
        Ok(())
    }

    fn send_keys(&self, _sequence: &str) -> Result<(), LocateError> {
        Ok(())
    }
}

/// A low hum that turns into a loud chime once `onset` frames have been read.
pub struct Chime {
    onset: Option<usize>,
    frames: Arc<AtomicUsize>,
}

impl Chime {
    pub fn after(onset: usize) -> Self {
        Self {
            onset: Some(onset),
            frames: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn never() -> Self {
        Self {
            onset: None,
            frames: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AudioCapture for Chime {
    fn open_audio_stream(
        &self,
        _sample_rate: u32,
        _frame_size: usize,
    ) -> Result<Box<dyn AudioStream>, AudioError> {
        Ok(Box::new(ChimeStream {
            onset: self.onset,
            frames: self.frames.clone(),
        }))
    }
}

struct ChimeStream {
    onset: Option<usize>,
    frames: Arc<AtomicUsize>,
}

impl AudioStream for ChimeStream {
    fn next_frame(&mut self, _wait: Duration) -> Result<Option<Vec<f32>>, AudioError> {
        std::thread::sleep(Duration::from_millis(1));
        let index = self.frames.fetch_add(1, Ordering::SeqCst);
        let loud = self.onset.is_some_and(|onset| index >= onset);
        let (freq, amplitude) = if loud { (880.0, 0.6) } else { (220.0, 0.01) };
        let start = index * FRAME;
        Ok(Some(
            (0..FRAME)
                .map(|i| {
                    let t = (start + i) as f64 / RATE as f64;
                    (amplitude * (2.0 * std::f64::consts::PI * freq * t).sin()) as f32
                })
                .collect(),
        ))
    }
}
