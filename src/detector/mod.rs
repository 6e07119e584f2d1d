//! Hand landmark detection.
//!
//! A [`HandLandmarker`] runs a [`HandModel`] on frames and filters its raw estimates into a
//! [`DetectionResult`]. Like most streaming detectors, it has three running modes:
//!
//! - [`RunningMode::Image`]: [`HandLandmarker::detect`] processes independent images.
//! - [`RunningMode::Video`]: [`HandLandmarker::detect_for_video`] processes the frames of a video,
//!   identified by strictly increasing timestamps, and blocks until the result is available.
//! - [`RunningMode::LiveStream`]: [`HandLandmarker::detect_async`] hands frames to a background
//!   thread and returns immediately. Results are delivered to the result callback.

mod onnx;
mod palm;

use std::{error::Error, fmt, path::PathBuf};

use anyhow::bail;

use crate::{
    clock::Timestamp,
    config::DetectorConfig,
    hand::{DetectionResult, Hand},
    image::RgbFrame,
    worker::{TrySend, Worker},
};

pub use onnx::OnnxHandModel;

/// Receives the results of [`HandLandmarker::detect_async`], along with the frame and timestamp
/// they belong to.
pub type ResultCallback = Box<dyn FnMut(DetectionResult, &RgbFrame, Timestamp) + Send>;

/// The processing mode of a [`HandLandmarker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningMode {
    Image,
    Video,
    LiveStream,
}

impl fmt::Display for RunningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunningMode::Image => "image",
            RunningMode::Video => "video",
            RunningMode::LiveStream => "live stream",
        })
    }
}

/// A candidate hand estimated by a [`HandModel`].
#[derive(Debug, Clone)]
pub struct HandEstimate {
    pub hand: Hand,
    /// Confidence that a hand is present at all, from 0.0 to 1.0.
    pub presence: f32,
}

/// A model that estimates hand landmarks in a frame.
pub trait HandModel: Send + 'static {
    /// Estimates the hands in `frame`, in no particular order.
    fn estimate(&mut self, frame: &RgbFrame) -> anyhow::Result<Vec<HandEstimate>>;
}

/// Settings of a [`HandLandmarker`].
pub struct DetectorOptions {
    /// The hand landmark network.
    pub model_path: PathBuf,
    /// The palm detection network that locates hands for the landmark network.
    pub palm_model_path: PathBuf,
    pub running_mode: RunningMode,
    /// Maximum number of hands to report per frame.
    pub num_hands: usize,
    /// Minimum presence score for a hand to be reported when no hand was tracked on the previous
    /// frame.
    pub min_hand_detection_confidence: f32,
    /// Minimum presence score for a hand to be reported.
    pub min_hand_presence_confidence: f32,
    /// Minimum presence score for a hand to be reported while hands are being tracked.
    pub min_tracking_confidence: f32,
    /// Must be set in [`RunningMode::LiveStream`], and must not be set otherwise.
    pub result_callback: Option<ResultCallback>,
}

impl DetectorOptions {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            palm_model_path: config.palm_model_path.clone(),
            running_mode: config.running_mode,
            num_hands: config.num_hands,
            min_hand_detection_confidence: config.min_hand_detection_confidence,
            min_hand_presence_confidence: config.min_hand_presence_confidence,
            min_tracking_confidence: config.min_tracking_confidence,
            result_callback: None,
        }
    }

    pub fn running_mode(self, running_mode: RunningMode) -> Self {
        Self {
            running_mode,
            ..self
        }
    }

    pub fn result_callback<F>(self, callback: F) -> Self
    where
        F: FnMut(DetectionResult, &RgbFrame, Timestamp) + Send + 'static,
    {
        Self {
            result_callback: Some(Box::new(callback)),
            ..self
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            (
                "min_hand_detection_confidence",
                self.min_hand_detection_confidence,
            ),
            (
                "min_hand_presence_confidence",
                self.min_hand_presence_confidence,
            ),
            ("min_tracking_confidence", self.min_tracking_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("`{name}` must be in range 0.0 to 1.0, got {value}");
            }
        }

        if self.num_hands == 0 {
            bail!("`num_hands` must be at least 1");
        }

        match (self.running_mode, self.result_callback.is_some()) {
            (RunningMode::LiveStream, false) => {
                bail!("a result callback must be provided in live stream mode")
            }
            (RunningMode::Image | RunningMode::Video, true) => bail!(
                "a result callback must not be provided in {} mode",
                self.running_mode
            ),
            _ => Ok(()),
        }
    }
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

impl fmt::Debug for DetectorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectorOptions")
            .field("model_path", &self.model_path)
            .field("palm_model_path", &self.palm_model_path)
            .field("running_mode", &self.running_mode)
            .field("num_hands", &self.num_hands)
            .field(
                "min_hand_detection_confidence",
                &self.min_hand_detection_confidence,
            )
            .field(
                "min_hand_presence_confidence",
                &self.min_hand_presence_confidence,
            )
            .field("min_tracking_confidence", &self.min_tracking_confidence)
            .field("result_callback", &self.result_callback.is_some())
            .finish()
    }
}

/// A [`HandLandmarker`] method was called that does not belong to its [`RunningMode`].
#[derive(Debug, Clone)]
pub struct ModeError {
    pub expected: RunningMode,
    pub actual: RunningMode,
}

impl fmt::Display for ModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation requires {} mode, but the landmarker was created in {} mode",
            self.expected, self.actual
        )
    }
}

impl Error for ModeError {}

/// A frame was submitted with a timestamp that is not larger than the previous one.
#[derive(Debug, Clone)]
pub struct TimestampError {
    pub previous: Timestamp,
    pub submitted: Timestamp,
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timestamps must be strictly increasing: got {} after {}",
            self.submitted, self.previous
        )
    }
}

impl Error for TimestampError {}

/// Whether a frame passed to [`HandLandmarker::detect_async`] was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The frame will be processed and its result passed to the result callback.
    Accepted,
    /// The landmarker was still busy and the frame was discarded.
    Dropped,
}

/// Asynchronous hand detection, as used by the capture loop.
pub trait HandDetector {
    /// Submits `frame` for detection without blocking.
    fn detect_async(&mut self, frame: RgbFrame, timestamp: Timestamp)
        -> anyhow::Result<Submission>;
}

/// Applies the confidence thresholds and the hand limit to raw model estimates.
struct HandFilter {
    num_hands: usize,
    detection_threshold: f32,
    tracking_threshold: f32,
    /// Whether consecutive frames belong to the same stream.
    tracks: bool,
    tracking: bool,
}

impl HandFilter {
    fn new(options: &DetectorOptions) -> Self {
        let presence = options.min_hand_presence_confidence;
        Self {
            num_hands: options.num_hands,
            detection_threshold: presence.max(options.min_hand_detection_confidence),
            tracking_threshold: presence.max(options.min_tracking_confidence),
            tracks: options.running_mode != RunningMode::Image,
            tracking: false,
        }
    }

    fn filter(&mut self, mut estimates: Vec<HandEstimate>) -> DetectionResult {
        let threshold = if self.tracking {
            self.tracking_threshold
        } else {
            self.detection_threshold
        };
        estimates.retain(|est| est.presence >= threshold);
        estimates.sort_by(|a, b| b.presence.total_cmp(&a.presence));
        estimates.truncate(self.num_hands);

        self.tracking = self.tracks && !estimates.is_empty();
        estimates.into_iter().map(|est| est.hand).collect()
    }
}

enum Engine {
    Blocking {
        model: Box<dyn HandModel>,
        filter: HandFilter,
    },
    Stream {
        worker: Worker<(RgbFrame, Timestamp)>,
    },
}

/// Detects hand landmarks in images, videos or live streams.
///
/// In [`RunningMode::LiveStream`], the model runs on a dedicated worker thread. Dropping the
/// landmarker stops that thread after it has finished the frame it is working on; if the thread
/// panicked, the panic is propagated to the thread dropping the landmarker.
pub struct HandLandmarker {
    running_mode: RunningMode,
    last_timestamp: Option<Timestamp>,
    engine: Engine,
}

impl HandLandmarker {
    /// Creates a landmarker that runs the ONNX models at `options.palm_model_path` and
    /// `options.model_path`.
    pub fn create_from_options(options: DetectorOptions) -> anyhow::Result<Self> {
        options.validate()?;
        let model = OnnxHandModel::load(&options)?;
        Self::with_model(model, options)
    }

    /// Creates a landmarker that runs `model`. The model paths in `options` are ignored.
    pub fn with_model<M: HandModel>(model: M, mut options: DetectorOptions) -> anyhow::Result<Self> {
        options.validate()?;

        let mut filter = HandFilter::new(&options);
        let engine = match options.result_callback.take() {
            Some(mut callback) => {
                let mut model = model;
                let worker = Worker::builder().name("hand landmarker").spawn(
                    move |(frame, timestamp): (RgbFrame, Timestamp)| {
                        match model.estimate(&frame) {
                            Ok(estimates) => {
                                let result = filter.filter(estimates);
                                log::trace!("{} hands at {timestamp}", result.len());
                                callback(result, &frame, timestamp);
                            }
                            Err(e) => log::error!("hand landmark estimation failed: {e:#}"),
                        }
                    },
                )?;
                Engine::Stream { worker }
            }
            None => Engine::Blocking {
                model: Box::new(model),
                filter,
            },
        };

        Ok(Self {
            running_mode: options.running_mode,
            last_timestamp: None,
            engine,
        })
    }

    #[inline]
    pub fn running_mode(&self) -> RunningMode {
        self.running_mode
    }

    /// Detects the hands in a single image.
    ///
    /// Requires [`RunningMode::Image`].
    pub fn detect(&mut self, image: &RgbFrame) -> anyhow::Result<DetectionResult> {
        self.check_mode(RunningMode::Image)?;
        self.run_blocking(image)
    }

    /// Detects the hands in a video frame, blocking until the result is available.
    ///
    /// Requires [`RunningMode::Video`]. `timestamp` must be larger than the one passed with the
    /// previous frame.
    pub fn detect_for_video(
        &mut self,
        frame: &RgbFrame,
        timestamp: Timestamp,
    ) -> anyhow::Result<DetectionResult> {
        self.check_mode(RunningMode::Video)?;
        self.check_timestamp(timestamp)?;
        self.run_blocking(frame)
    }

    /// Submits a live stream frame for detection without blocking.
    ///
    /// Requires [`RunningMode::LiveStream`]. `timestamp` must be larger than the one passed with
    /// the previous frame. If the landmarker is still busy with earlier frames, `frame` is dropped
    /// and [`Submission::Dropped`] is returned.
    pub fn detect_async(
        &mut self,
        frame: RgbFrame,
        timestamp: Timestamp,
    ) -> anyhow::Result<Submission> {
        self.check_mode(RunningMode::LiveStream)?;
        self.check_timestamp(timestamp)?;

        let Engine::Stream { worker } = &mut self.engine else {
            unreachable!("live stream landmarker without worker");
        };
        match worker.try_send((frame, timestamp)) {
            TrySend::Sent => Ok(Submission::Accepted),
            TrySend::Full(_) => {
                log::trace!("hand landmarker busy, dropping frame at {timestamp}");
                Ok(Submission::Dropped)
            }
        }
    }

    fn check_mode(&self, expected: RunningMode) -> Result<(), ModeError> {
        if self.running_mode == expected {
            Ok(())
        } else {
            Err(ModeError {
                expected,
                actual: self.running_mode,
            })
        }
    }

    fn check_timestamp(&mut self, timestamp: Timestamp) -> Result<(), TimestampError> {
        match self.last_timestamp {
            Some(previous) if timestamp <= previous => Err(TimestampError {
                previous,
                submitted: timestamp,
            }),
            _ => {
                self.last_timestamp = Some(timestamp);
                Ok(())
            }
        }
    }

    fn run_blocking(&mut self, frame: &RgbFrame) -> anyhow::Result<DetectionResult> {
        let Engine::Blocking { model, filter } = &mut self.engine else {
            unreachable!("{} landmarker without model", self.running_mode);
        };
        let estimates = model.estimate(frame)?;
        Ok(filter.filter(estimates))
    }
}

impl HandDetector for HandLandmarker {
    fn detect_async(
        &mut self,
        frame: RgbFrame,
        timestamp: Timestamp,
    ) -> anyhow::Result<Submission> {
        HandLandmarker::detect_async(self, frame, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use crossbeam_channel::{Receiver, Sender};

    use crate::{
        hand::{Handedness, Landmark},
        image::Image,
        mailbox::DetectionMailbox,
    };

    use super::*;

    /// Returns a queue of canned estimates, one list per call.
    struct ScriptedModel {
        script: VecDeque<Vec<HandEstimate>>,
    }

    impl ScriptedModel {
        fn new<const N: usize>(script: [Vec<HandEstimate>; N]) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl HandModel for ScriptedModel {
        fn estimate(&mut self, _: &RgbFrame) -> anyhow::Result<Vec<HandEstimate>> {
            Ok(self.script.pop_front().unwrap_or_default())
        }
    }

    /// Signals when it starts estimating and blocks until released.
    struct BlockingModel {
        started: Sender<()>,
        release: Receiver<()>,
    }

    impl HandModel for BlockingModel {
        fn estimate(&mut self, _: &RgbFrame) -> anyhow::Result<Vec<HandEstimate>> {
            self.started.send(()).ok();
            self.release.recv().ok();
            Ok(Vec::new())
        }
    }

    struct PanickingModel;

    impl HandModel for PanickingModel {
        fn estimate(&mut self, _: &RgbFrame) -> anyhow::Result<Vec<HandEstimate>> {
            resume_unwind(Box::new("model exploded"));
        }
    }

    /// A hand estimate whose handedness score equals its presence, to identify it in results.
    fn estimate(presence: f32) -> HandEstimate {
        HandEstimate {
            hand: Hand::new([Landmark::default(); 21], Handedness::Right, presence),
            presence,
        }
    }

    fn scores(result: &DetectionResult) -> Vec<f32> {
        result.hands().iter().map(|hand| hand.score()).collect()
    }

    fn frame() -> RgbFrame {
        Image::new(8, 8).to_rgb()
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn options(mode: RunningMode) -> DetectorOptions {
        DetectorOptions::default().running_mode(mode)
    }

    #[test]
    fn validates_options() {
        let mut opts = options(RunningMode::Image);
        opts.min_tracking_confidence = 1.5;
        assert!(HandLandmarker::with_model(ScriptedModel::new([]), opts).is_err());

        let mut opts = options(RunningMode::Image);
        opts.min_hand_presence_confidence = -0.1;
        assert!(HandLandmarker::with_model(ScriptedModel::new([]), opts).is_err());

        let mut opts = options(RunningMode::Image);
        opts.num_hands = 0;
        assert!(HandLandmarker::with_model(ScriptedModel::new([]), opts).is_err());

        let opts = options(RunningMode::LiveStream);
        assert!(HandLandmarker::with_model(ScriptedModel::new([]), opts).is_err());

        let opts = options(RunningMode::Video).result_callback(|_, _, _| {});
        assert!(HandLandmarker::with_model(ScriptedModel::new([]), opts).is_err());

        let opts = options(RunningMode::LiveStream).result_callback(|_, _, _| {});
        assert!(HandLandmarker::with_model(ScriptedModel::new([]), opts).is_ok());
    }

    #[test]
    fn wrong_mode() {
        let mut landmarker =
            HandLandmarker::with_model(ScriptedModel::new([]), options(RunningMode::Image))
                .unwrap();
        let err = landmarker.detect_for_video(&frame(), ts(1)).unwrap_err();
        let err = err.downcast_ref::<ModeError>().unwrap();
        assert_eq!(err.expected, RunningMode::Video);
        assert_eq!(err.actual, RunningMode::Image);

        let err = landmarker.detect_async(frame(), ts(1)).unwrap_err();
        assert!(err.is::<ModeError>());

        landmarker.detect(&frame()).unwrap();
    }

    #[test]
    fn timestamps_must_increase() {
        let mut landmarker =
            HandLandmarker::with_model(ScriptedModel::new([]), options(RunningMode::Video))
                .unwrap();
        landmarker.detect_for_video(&frame(), ts(10)).unwrap();

        let err = landmarker.detect_for_video(&frame(), ts(10)).unwrap_err();
        let err = err.downcast_ref::<TimestampError>().unwrap();
        assert_eq!(err.previous, ts(10));
        assert_eq!(err.submitted, ts(10));

        let err = landmarker.detect_for_video(&frame(), ts(5)).unwrap_err();
        assert!(err.is::<TimestampError>());

        landmarker.detect_for_video(&frame(), ts(11)).unwrap();
    }

    #[test]
    fn tracking_threshold_applies_after_detection() {
        let mut opts = options(RunningMode::Video);
        opts.min_hand_detection_confidence = 0.8;
        opts.min_hand_presence_confidence = 0.5;
        opts.min_tracking_confidence = 0.3;
        let model = ScriptedModel::new([
            vec![estimate(0.6)],
            vec![estimate(0.9)],
            vec![estimate(0.6)],
            vec![estimate(0.4)],
            vec![estimate(0.6)],
        ]);
        let mut landmarker = HandLandmarker::with_model(model, opts).unwrap();

        let mut run = |t| scores(&landmarker.detect_for_video(&frame(), ts(t)).unwrap());
        // Not tracking: needs max(presence, detection) = 0.8.
        assert_eq!(run(1), Vec::<f32>::new());
        assert_eq!(run(2), [0.9]);
        // Tracking: needs max(presence, tracking) = 0.5.
        assert_eq!(run(3), [0.6]);
        assert_eq!(run(4), Vec::<f32>::new());
        // Lost track, back to the detection threshold.
        assert_eq!(run(5), Vec::<f32>::new());
    }

    #[test]
    fn image_mode_does_not_track() {
        let mut opts = options(RunningMode::Image);
        opts.min_hand_detection_confidence = 0.8;
        opts.min_tracking_confidence = 0.1;
        let model = ScriptedModel::new([vec![estimate(0.9)], vec![estimate(0.6)]]);
        let mut landmarker = HandLandmarker::with_model(model, opts).unwrap();

        assert_eq!(scores(&landmarker.detect(&frame()).unwrap()), [0.9]);
        assert!(landmarker.detect(&frame()).unwrap().is_empty());
    }

    #[test]
    fn limits_hand_count_by_presence() {
        let mut opts = options(RunningMode::Image);
        opts.num_hands = 2;
        let model = ScriptedModel::new([vec![estimate(0.7), estimate(0.9), estimate(0.8)]]);
        let mut landmarker = HandLandmarker::with_model(model, opts).unwrap();
        assert_eq!(scores(&landmarker.detect(&frame()).unwrap()), [0.9, 0.8]);
    }

    #[test]
    fn live_stream_delivers_to_callback() {
        let mailbox = DetectionMailbox::new();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let opts = options(RunningMode::LiveStream).result_callback({
            let mailbox = mailbox.clone();
            let frames = frames.clone();
            move |result, frame: &RgbFrame, timestamp| {
                frames.lock().unwrap().push(frame.resolution());
                mailbox.set(result, timestamp);
            }
        });
        let model = ScriptedModel::new([vec![estimate(0.75)]]);
        let mut landmarker = HandLandmarker::with_model(model, opts).unwrap();

        assert_eq!(
            landmarker.detect_async(frame(), ts(42)).unwrap(),
            Submission::Accepted
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let latest = loop {
            if let Some(latest) = mailbox.get() {
                break latest;
            }
            assert!(Instant::now() < deadline, "no result delivered");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(latest.timestamp(), ts(42));
        assert_eq!(scores(latest.value()), [0.75]);
        assert_eq!(frames.lock().unwrap().len(), 1);

        let err = landmarker.detect_async(frame(), ts(42)).unwrap_err();
        assert!(err.is::<TimestampError>());
    }

    #[test]
    fn busy_landmarker_drops_frames() {
        let (started_tx, started_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded(0);
        let model = BlockingModel {
            started: started_tx,
            release: release_rx,
        };
        let opts = options(RunningMode::LiveStream).result_callback(|_, _, _| {});
        let mut landmarker = HandLandmarker::with_model(model, opts).unwrap();

        assert_eq!(
            landmarker.detect_async(frame(), ts(1)).unwrap(),
            Submission::Accepted
        );
        started_rx.recv().unwrap();

        let start = Instant::now();
        let submissions = (2..10)
            .map(|t| landmarker.detect_async(frame(), ts(t)).unwrap())
            .collect::<Vec<_>>();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(submissions[0], Submission::Accepted);
        assert!(submissions[1..].iter().all(|s| *s == Submission::Dropped));

        drop(release_tx);
        drop(started_rx);
        drop(landmarker);
    }

    #[test]
    fn worker_panic_propagates_on_drop() {
        let opts = options(RunningMode::LiveStream).result_callback(|_, _, _| {});
        let mut landmarker = HandLandmarker::with_model(PanickingModel, opts).unwrap();
        landmarker.detect_async(frame(), ts(1)).unwrap();
        catch_unwind(AssertUnwindSafe(|| drop(landmarker))).unwrap_err();
    }
}
