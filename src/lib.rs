//! Real-time hand landmark overlay for webcam feeds.
//!
//! Frames are pulled from a V4L2 [`Webcam`], handed to a streaming-mode [`HandLandmarker`] that
//! runs on its own thread, and annotated with the most recent [`DetectionResult`] that the
//! landmarker delivered to the shared [`Mailbox`].
//!
//! # Environment Variables
//!
//! * `HANDCAM_CAMERA_INDEX`: index of the `/dev/video*` device to open (default `0`). Set to
//!   `auto` to use the first device that supports a compatible image format.
//! * `HANDCAM_WEBCAM_NAME`: opens the webcam with this card name instead of using an index.
//! * `HANDCAM_MODEL_PATH`: path to the hand landmark ONNX model.
//! * `HANDCAM_PALM_MODEL_PATH`: path to the palm detection ONNX model.
//! * `HANDCAM_NUM_HANDS`: maximum number of hands to report.
//! * `HANDCAM_MAX_RESULT_AGE_MS`: if set, detection results older than this are not drawn.
//! * `HANDCAM_JPEG_BACKEND`: JPEG decoder for webcam frames. Allowed values are `mozjpeg`
//!   (default), `zune-jpeg` and `jpeg-decoder`.
//!
//! [`Webcam`]: video::webcam::Webcam
//! [`HandLandmarker`]: detector::HandLandmarker
//! [`DetectionResult`]: hand::DetectionResult
//! [`Mailbox`]: mailbox::Mailbox

use log::LevelFilter;

pub mod annotate;
pub mod app;
pub mod clock;
pub mod config;
pub mod detector;
pub mod gui;
pub mod hand;
pub mod image;
pub mod iter;
pub mod mailbox;
pub mod nn;
pub mod termination;
pub mod timer;
pub mod video;
pub mod worker;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_CRATE_NAME")), log_level)
        .filter(Some("wgpu"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and `handcam` will log at *debug* level, `wgpu` at *warn* level. `RUST_LOG`
/// is applied on top of that.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
