mod common;

use common::{texture, to_screen, Chime, FixedScreen, FRAME, RATE};
use image::imageops;
use pixelpilot::{
    ActionDescriptor, AudioSignalMonitor, CompletionSignal, ConfigHandle, ElementLocator,
    LocatorMethod, MonitorState, Settings, SoundKind, TemplateStore, TemplateVariant,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(10);

fn audio_settings() -> ConfigHandle {
    ConfigHandle::new(Settings {
        sample_rate: RATE,
        frame_size: FRAME,
        calibration_window_ms: 100,
        ..Settings::default()
    })
}

/// A locator whose screen shows the "done_banner" template when `banner_visible`.
fn locator(banner_visible: bool) -> ElementLocator {
    let shown = texture(320, 240, 8, 21);
    let banner = imageops::crop_imm(&shown, 128, 96, 64, 48).to_image();
    let store = TemplateStore::in_memory();
    store.append_variant(
        "done_banner",
        TemplateVariant::new("done_banner.png", "export", PathBuf::from("done_banner.png"), banner),
    );
    let screen = if banner_visible { shown } else { texture(320, 240, 8, 99) };
    ElementLocator::builder(Arc::new(FixedScreen(to_screen(&screen))))
        .templates(Arc::new(store))
        .build()
}

#[test]
fn completion_chime_ends_the_wait() {
    let monitor = AudioSignalMonitor::new(Arc::new(Chime::after(30)), audio_settings()).unwrap();
    let handle = monitor.start(SoundKind::Completion, Duration::from_secs(10)).unwrap();

    let cue = ActionDescriptor::for_template("done_banner");
    let signal = locator(false)
        .wait_for_completion(handle, Some(&cue), POLL)
        .unwrap();

    match signal {
        CompletionSignal::Audio(result) => {
            assert!(result.detected, "{result:?}");
            assert!(!result.timed_out);
        }
        other => panic!("expected audio completion, got {other:?}"),
    }
    assert!(monitor.is_detected(SoundKind::Completion));
}

#[test]
fn visible_cue_wins_and_stops_the_monitor() {
    let monitor = AudioSignalMonitor::new(Arc::new(Chime::never()), audio_settings()).unwrap();
    let handle = monitor.start(SoundKind::Completion, Duration::from_secs(30)).unwrap();

    let started = Instant::now();
    let cue = ActionDescriptor::for_template("done_banner");
    let signal = locator(true)
        .wait_for_completion(handle, Some(&cue), POLL)
        .unwrap();

    match signal {
        CompletionSignal::Visual(detection) => {
            assert_eq!(detection.method, LocatorMethod::Template);
            assert!(detection.confidence > 0.99);
        }
        other => panic!("expected visual completion, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(monitor.state(), MonitorState::Idle);
    assert!(!monitor.is_detected(SoundKind::Completion));
}

#[test]
fn silence_without_cue_times_out() {
    let monitor = AudioSignalMonitor::new(Arc::new(Chime::never()), audio_settings()).unwrap();
    let handle = monitor.start(SoundKind::Completion, Duration::from_millis(200)).unwrap();

    let signal = locator(false).wait_for_completion(handle, None, POLL).unwrap();

    let CompletionSignal::Audio(result) = signal else {
        panic!("expected an audio result");
    };
    assert!(!result.detected);
    assert!(result.timed_out);
    assert!(result.into_result().is_err());
}

#[tokio::test]
async fn chime_observed_from_async_context() {
    let monitor = AudioSignalMonitor::new(Arc::new(Chime::after(10)), audio_settings()).unwrap();
    let result = monitor
        .start(SoundKind::Completion, Duration::from_secs(10))
        .unwrap()
        .wait_async()
        .await
        .unwrap();
    assert!(result.detected);
}
