//! Capture provider seams: screen rasters and live audio.
//!
//! The engine only consumes these traits; concrete providers are supplied by
//! the embedding application. A primary-monitor screen provider backed by
//! `xcap` is available with the `screen-capture` feature.

use crate::errors::{AudioError, LocateError};
use crate::screenshot::Screenshot;
use std::time::Duration;

/// Supplies a full-screen raster on demand.
pub trait ScreenCapture: Send + Sync {
    fn capture_screen(&self) -> Result<Screenshot, LocateError>;
}

/// Opens live audio sample streams.
pub trait AudioCapture: Send + Sync {
    fn open_audio_stream(
        &self,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<Box<dyn AudioStream>, AudioError>;
}

/// A stream of mono sample frames in `[-1.0, 1.0]`.
pub trait AudioStream: Send {
    /// Waits up to `wait` for the next frame. `Ok(None)` means no frame arrived in time.
    fn next_frame(&mut self, wait: Duration) -> Result<Option<Vec<f32>>, AudioError>;

    fn close(&mut self) {}
}

#[cfg(feature = "screen-capture")]
pub use self::xcap_provider::XcapScreenCapture;

#[cfg(feature = "screen-capture")]
mod xcap_provider {
    use super::ScreenCapture;
    use crate::errors::LocateError;
    use crate::screenshot::Screenshot;

    /// Captures the primary monitor.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct XcapScreenCapture;

    impl ScreenCapture for XcapScreenCapture {
        fn capture_screen(&self) -> Result<Screenshot, LocateError> {
            let monitors = xcap::Monitor::all().map_err(|e| {
                LocateError::TargetUnavailable(format!("Failed to get monitors: {e}"))
            })?;
            let mut primary_monitor: Option<xcap::Monitor> = None;
            for monitor in monitors {
                match monitor.is_primary() {
                    Ok(true) => {
                        primary_monitor = Some(monitor);
                        break;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        return Err(LocateError::TransientIo(format!(
                            "Error checking monitor primary status: {e}"
                        )));
                    }
                }
            }
            let primary_monitor = primary_monitor.ok_or_else(|| {
                LocateError::TargetUnavailable("Could not find primary monitor".to_string())
            })?;

            let image = primary_monitor.capture_image().map_err(|e| {
                LocateError::TransientIo(format!("Failed to capture screen: {e}"))
            })?;

            Screenshot::from_raw(image.width(), image.height(), image.to_vec())
        }
    }
}
