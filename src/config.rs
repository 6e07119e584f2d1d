//! Runtime configuration.
//!
//! [`Config::default`] holds the built-in settings; [`Config::from_env`] applies the overrides
//! listed in the crate documentation on top of them.

use std::{env, ffi::OsString, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};

use crate::{detector::RunningMode, image::Resolution};

/// Which video device to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSelector {
    /// `/dev/video<N>`.
    Index(u32),
    /// The first device whose card name matches.
    Name(String),
    /// The first device that supports a compatible image format.
    Auto,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub selector: CameraSelector,
    pub resolution: Resolution,
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            selector: CameraSelector::Index(0),
            resolution: Resolution::new(680, 480),
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub palm_model_path: PathBuf,
    pub running_mode: RunningMode,
    pub num_hands: usize,
    pub min_hand_detection_confidence: f32,
    pub min_hand_presence_confidence: f32,
    pub min_tracking_confidence: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("hand_landmark.onnx"),
            palm_model_path: PathBuf::from("palm_detection.onnx"),
            running_mode: RunningMode::LiveStream,
            num_hands: 4,
            min_hand_detection_confidence: 0.5,
            min_hand_presence_confidence: 0.5,
            min_tracking_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    /// Detection results older than this are not drawn. [`None`] draws whatever result arrived
    /// last, no matter how old it is.
    pub max_result_age: Option<Duration>,
}

impl Config {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| env::var_os(name))
    }

    /// Builds the configuration, looking up overrides with `lookup`.
    ///
    /// An invalid override is an error that names the offending variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> anyhow::Result<Self> {
        let var = |name: &str| -> anyhow::Result<Option<String>> {
            match lookup(name) {
                Some(value) => match value.into_string() {
                    Ok(s) => Ok(Some(s)),
                    Err(s) => bail!(
                        "invalid value set for `{name}` variable: {}",
                        s.to_string_lossy()
                    ),
                },
                None => Ok(None),
            }
        };

        let mut config = Config::default();

        if let Some(name) = var("HANDCAM_WEBCAM_NAME")? {
            config.camera.selector = CameraSelector::Name(name);
        } else if let Some(index) = var("HANDCAM_CAMERA_INDEX")? {
            config.camera.selector = if index == "auto" {
                CameraSelector::Auto
            } else {
                CameraSelector::Index(parse("HANDCAM_CAMERA_INDEX", &index)?)
            };
        }

        if let Some(path) = var("HANDCAM_MODEL_PATH")? {
            config.detector.model_path = path.into();
        }

        if let Some(path) = var("HANDCAM_PALM_MODEL_PATH")? {
            config.detector.palm_model_path = path.into();
        }

        if let Some(num) = var("HANDCAM_NUM_HANDS")? {
            let num: usize = parse("HANDCAM_NUM_HANDS", &num)?;
            if num == 0 {
                bail!("invalid value set for `HANDCAM_NUM_HANDS` variable: must be at least 1");
            }
            config.detector.num_hands = num;
        }

        if let Some(ms) = var("HANDCAM_MAX_RESULT_AGE_MS")? {
            config.max_result_age = Some(Duration::from_millis(parse(
                "HANDCAM_MAX_RESULT_AGE_MS",
                &ms,
            )?));
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value set for `{name}` variable: '{value}'"))
}
