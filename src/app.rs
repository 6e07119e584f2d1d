//! The capture, detect and render loop.

use std::time::Duration;

use embedded_graphics::mono_font::ascii::FONT_6X10;

use crate::{
    annotate::Annotator,
    clock::{StreamClock, Timestamp},
    config::Config,
    detector::{DetectorOptions, HandDetector, HandLandmarker, RunningMode},
    gui::{GuiPreview, Key},
    hand::DetectionResult,
    image::{draw, Color, Image},
    mailbox::{DetectionMailbox, Latest},
    timer::{FpsCounter, Timer},
    video::webcam::{Webcam, WebcamOptions},
};

/// Title of the preview window.
pub const WINDOW_TITLE: &str = "Hand Detector";

const HINT: &str = "Press 'q' or ESC to exit";
const HINT_COLOR: Color = Color::WHITE;
const HINT_MARGIN: i32 = 10;

const KEY_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// A source of video frames.
pub trait FrameSource {
    /// Blocks until the next frame is available.
    ///
    /// An error ends the capture loop.
    fn read(&mut self) -> anyhow::Result<Image>;

    /// Profiling timers to include in the throughput log.
    fn timers(&self) -> Vec<&Timer> {
        Vec::new()
    }
}

/// Displays annotated frames and reports user input.
pub trait Preview {
    fn show(&mut self, image: &Image);

    /// Waits up to `timeout` for a key press.
    fn poll_key(&mut self, timeout: Duration) -> Option<Key>;
}

/// Why [`run_loop`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `q` or Escape was pressed.
    Key,
    /// The preview window was closed.
    WindowClosed,
    /// The frame source failed.
    ReadFailed,
}

/// Opens the camera and the landmarker, then shows annotated frames until the user quits.
///
/// Failing to open the camera is logged and is not an error.
pub fn run(config: Config) -> anyhow::Result<()> {
    log::info!("Starting camera...");
    let webcam = match Webcam::open(WebcamOptions::from(&config.camera)) {
        Ok(webcam) => webcam,
        Err(e) => {
            log::error!("failed to open camera: {e:#}");
            return Ok(());
        }
    };
    log::info!("Camera ready");

    let mailbox = DetectionMailbox::new();
    let sink = mailbox.clone();
    let options = DetectorOptions::from_config(&config.detector)
        .running_mode(RunningMode::LiveStream)
        .result_callback(move |result, _frame, timestamp| sink.set(result, timestamp));
    let landmarker = HandLandmarker::create_from_options(options)?;
    log::info!("Hand detector initialized");

    let reason = run_loop(
        webcam,
        landmarker,
        &mailbox,
        GuiPreview::new(WINDOW_TITLE),
        &config,
    )?;
    log::debug!("capture loop ended: {reason:?}");

    log::info!("Program finished");
    Ok(())
}

/// Runs the capture loop until a quit key is pressed, the window is closed, or reading a frame
/// fails.
///
/// `source`, `detector` and `preview` are dropped before this returns, on every exit path.
pub fn run_loop<S, D, P>(
    mut source: S,
    mut detector: D,
    mailbox: &DetectionMailbox,
    mut preview: P,
    config: &Config,
) -> anyhow::Result<ExitReason>
where
    S: FrameSource,
    D: HandDetector,
    P: Preview,
{
    let mut clock = StreamClock::new();
    let mut annotator = Annotator::new();
    let mut fps = FpsCounter::new("capture loop");

    let reason = loop {
        let mut frame = match source.read() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("failed to read frame: {e:#}");
                break ExitReason::ReadFailed;
            }
        };

        let timestamp = clock.next();
        detector.detect_async(frame.to_rgb(), timestamp)?;

        let latest = current_result(mailbox, timestamp, config.max_result_age);
        annotator.annotate(&mut frame, latest.as_ref().map(Latest::value));
        draw_hint(&mut frame);
        preview.show(&frame);

        match preview.poll_key(KEY_POLL_TIMEOUT) {
            Some(Key::Char('q') | Key::Escape) => break ExitReason::Key,
            Some(Key::Closed) => break ExitReason::WindowClosed,
            Some(Key::Char(_)) | None => {}
        }

        fps.tick_with(source.timers());
    };

    log::info!("Exiting...");
    Ok(reason)
}

/// Returns the latest result in `mailbox`, unless it is older than `max_age` at `now`.
fn current_result(
    mailbox: &DetectionMailbox,
    now: Timestamp,
    max_age: Option<Duration>,
) -> Option<Latest<DetectionResult>> {
    let latest = mailbox.get()?;
    match max_age {
        Some(max_age) if latest.age_at(now) > max_age => {
            log::trace!(
                "ignoring stale result from {} at {now}",
                latest.timestamp()
            );
            None
        }
        _ => Some(latest),
    }
}

fn draw_hint(frame: &mut Image) {
    let y = frame.height() as i32 - HINT_MARGIN;
    draw::text(frame, HINT_MARGIN, y, HINT)
        .font(&FONT_6X10)
        .align_left()
        .align_bottom()
        .color(HINT_COLOR);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::hand::{Hand, Handedness, Landmark};

    use super::*;

    fn result() -> DetectionResult {
        let hand = Hand::new(
            [Landmark::new(0.5, 0.5, 0.0); Hand::NUM_LANDMARKS],
            Handedness::Left,
            0.9,
        );
        [hand].into_iter().collect()
    }

    #[test]
    fn empty_mailbox_has_no_result() {
        let mailbox = DetectionMailbox::new();
        assert!(current_result(&mailbox, Timestamp::from_millis(10), None).is_none());
    }

    #[test]
    fn stale_results_are_ignored() {
        let mailbox = DetectionMailbox::new();
        mailbox.set(result(), Timestamp::from_millis(1_000));
        let max_age = Some(Duration::from_millis(100));

        let fresh = current_result(&mailbox, Timestamp::from_millis(1_100), max_age);
        assert_eq!(fresh.unwrap().value().len(), 1);
        assert!(current_result(&mailbox, Timestamp::from_millis(1_101), max_age).is_none());

        // Without a bound, any result is used.
        let old = current_result(&mailbox, Timestamp::from_millis(60_000), None);
        assert!(old.is_some());
    }

    #[test]
    fn hint_is_drawn_bottom_left() {
        let mut frame = Image::filled(320, 240, Color::BLACK);
        draw_hint(&mut frame);

        let drawn = |y_range: std::ops::Range<u32>| {
            y_range
                .flat_map(|y| (0..frame.width()).map(move |x| (x, y)))
                .any(|(x, y)| frame.get(x, y) == HINT_COLOR)
        };
        assert!(drawn(200..240));
        assert!(!drawn(0..200));
    }
}
