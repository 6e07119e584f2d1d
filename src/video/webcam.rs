//! V4L2 webcam access.
//!
//! Only V4L2 `VIDEO_CAPTURE` devices yielding JFIF JPEG or Motion JPEG frames are supported.

use std::{cmp::Ordering, path::Path};

use anyhow::{bail, Context};
use linuxvideo::{
    format::{FrameIntervals, FrameSizes, PixFormat, Pixelformat},
    stream::ReadStream,
    BufType, CapabilityFlags, Device, Fract,
};

use crate::{
    app::FrameSource,
    config::{CameraConfig, CameraSelector},
    image::{Color, Image, Resolution},
    timer::Timer,
};

/// Device selection and format negotiation options.
#[derive(Debug, Clone)]
pub struct WebcamOptions {
    selector: CameraSelector,
    resolution: Resolution,
    fps: u32,
}

impl From<&CameraConfig> for WebcamOptions {
    fn from(config: &CameraConfig) -> Self {
        Self {
            selector: config.selector.clone(),
            resolution: config.resolution,
            fps: config.fps,
        }
    }
}

#[derive(Clone, Copy)]
struct FrameFormat {
    resolution: Resolution,
    frame_interval: Fract,
    fps: f32,
}

impl FrameFormat {
    fn new(resolution: Resolution, frame_interval: Fract) -> Self {
        Self {
            resolution,
            frame_interval,
            fps: 1.0 / frame_interval.as_f32(),
        }
    }

    /// Orders by pixel count, then frame rate.
    fn cmp_size_then_rate(&self, other: &Self) -> Ordering {
        self.resolution
            .num_pixels()
            .cmp(&other.resolution.num_pixels())
            .then(self.fps.total_cmp(&other.fps))
    }
}

fn negotiate_format(
    device: &Device,
    resolution: Resolution,
    fps: u32,
) -> anyhow::Result<(PixFormat, Fract)> {
    let mut pixel_format = None;
    for format in device.formats(BufType::VIDEO_CAPTURE) {
        let format = format?;
        if format.pixelformat() == Pixelformat::JPEG || format.pixelformat() == Pixelformat::MJPG {
            pixel_format = Some(format.pixelformat());
            break;
        }
    }

    let Some(pixel_format) = pixel_format else {
        bail!("no supported pixel format found");
    };

    let mut formats = Vec::new();
    match device.frame_sizes(pixel_format)? {
        FrameSizes::Discrete(sizes) => {
            for size in sizes {
                let intervals =
                    match device.frame_intervals(pixel_format, size.width(), size.height())? {
                        FrameIntervals::Discrete(intervals) => intervals,
                        FrameIntervals::Stepwise(_) | FrameIntervals::Continuous(_) => {
                            bail!("stepwise or continuous frame rates are not supported")
                        }
                    };
                for rate in intervals {
                    formats.push(FrameFormat::new(
                        Resolution::new(size.width(), size.height()),
                        *rate.fract(),
                    ));
                }
            }
        }
        FrameSizes::Stepwise(_) | FrameSizes::Continuous(_) => {
            bail!("stepwise or continuous resolutions are not supported");
        }
    }

    let Some(fmt) = select_format(&formats, resolution, fps) else {
        bail!("failed to negotiate a webcam format");
    };
    Ok((
        PixFormat::new(
            fmt.resolution.width(),
            fmt.resolution.height(),
            pixel_format,
        ),
        fmt.frame_interval,
    ))
}

/// Picks the smallest format at or above `resolution` and `fps`.
///
/// If no format reaches the frame rate, it is dropped from the requirements. If no format reaches
/// the resolution either, the largest format is used.
fn select_format(formats: &[FrameFormat], resolution: Resolution, fps: u32) -> Option<FrameFormat> {
    let fits_resolution = |fmt: &&FrameFormat| {
        fmt.resolution.width() >= resolution.width()
            && fmt.resolution.height() >= resolution.height()
    };
    let fits_fps = |fmt: &&FrameFormat| fmt.fps.round() >= fps as f32;

    if let Some(fmt) = smallest(formats.iter().filter(fits_resolution).filter(fits_fps)) {
        return Some(fmt);
    }
    log::debug!("no format reaches {resolution} @ {fps} FPS, ignoring frame rate");

    if let Some(fmt) = smallest(formats.iter().filter(fits_resolution)) {
        return Some(fmt);
    }
    log::debug!("no format reaches {resolution}, using the largest one");

    formats
        .iter()
        .max_by(|a, b| a.cmp_size_then_rate(b))
        .copied()
}

/// Returns the smallest of `fmts`. Among equally sized formats, the fastest one wins.
fn smallest<'a>(fmts: impl Iterator<Item = &'a FrameFormat>) -> Option<FrameFormat> {
    fmts.min_by(|a, b| {
        a.resolution
            .num_pixels()
            .cmp(&b.resolution.num_pixels())
            .then(b.fps.total_cmp(&a.fps))
    })
    .copied()
}

/// A webcam yielding a stream of [`Image`]s.
pub struct Webcam {
    stream: ReadStream,
    width: u32,
    height: u32,
    t_dequeue: Timer,
    t_decode: Timer,
}

impl Webcam {
    /// Opens the webcam selected by `options`.
    ///
    /// This function can block for a significant amount of time while the webcam initializes (on
    /// the order of hundreds of milliseconds).
    pub fn open(options: WebcamOptions) -> anyhow::Result<Self> {
        if let CameraSelector::Index(index) = options.selector {
            let path = format!("/dev/video{index}");
            let dev = Device::open(Path::new(&path))
                .with_context(|| format!("failed to open webcam device {path}"))?;
            return match Self::open_impl(dev, &options)? {
                Some(webcam) => Ok(webcam),
                None => bail!("{path} is not a video capture device"),
            };
        }

        for res in linuxvideo::list()? {
            match res {
                Ok(dev) => match Self::open_impl(dev, &options) {
                    Ok(Some(webcam)) => return Ok(webcam),
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!("{}", e);
                    }
                },
                Err(e) => {
                    log::warn!("{}", e);
                }
            }
        }

        match &options.selector {
            CameraSelector::Name(name) => bail!("no supported webcam named '{name}' found"),
            _ => bail!("no supported webcam device found"),
        }
    }

    fn open_impl(dev: Device, options: &WebcamOptions) -> anyhow::Result<Option<Self>> {
        let caps = dev.capabilities()?;
        if let CameraSelector::Name(name) = &options.selector {
            if caps.card() != name.as_str() {
                return Ok(None);
            }
        }

        let cap_flags = caps.device_capabilities();
        let path = dev.path()?;
        log::debug!(
            "device {} ({}) capabilities: {:?}",
            caps.card(),
            path.display(),
            cap_flags,
        );

        if !cap_flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
            return Ok(None);
        }

        let (pixfmt, fract) = negotiate_format(&dev, options.resolution, options.fps)?;

        let capture = dev.video_capture(pixfmt)?;

        let format = capture.format();
        let width = format.width();
        let height = format.height();

        let actual = capture.set_frame_interval(fract)?;

        log::info!(
            "opened {} ({}), {}x{} @ {:.1}Hz",
            caps.card(),
            path.display(),
            width,
            height,
            1.0 / actual.as_f32(),
        );

        let stream = capture.into_stream(2)?;

        Ok(Some(Self {
            stream,
            width,
            height,
            t_dequeue: Timer::new("dequeue"),
            t_decode: Timer::new("decode"),
        }))
    }

    /// Reads the next frame from the camera.
    ///
    /// If no frame is available, this method will block until one is. A frame that fails to
    /// decode is logged and replaced by a black frame of the negotiated size.
    pub fn read(&mut self) -> anyhow::Result<Image> {
        let dequeue_guard = self.t_dequeue.start();
        let (width, height) = (self.width, self.height);
        let t_decode = &self.t_decode;
        self.stream
            .dequeue(|buf| {
                drop(dequeue_guard);
                let image = match t_decode.time(|| Image::decode_jpeg(&buf)) {
                    Ok(image) => image,
                    Err(e) => {
                        log::error!("webcam decode error: {}", e);
                        Image::filled(width, height, Color::BLACK)
                    }
                };
                Ok(image)
            })
            .map_err(Into::into)
    }

    /// Returns profiling timers for webcam access and decoding.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_dequeue, &self.t_decode].into_iter()
    }
}

impl FrameSource for Webcam {
    fn read(&mut self) -> anyhow::Result<Image> {
        Webcam::read(self)
    }

    fn timers(&self) -> Vec<&Timer> {
        Webcam::timers(self).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(w: u32, h: u32, fps: u32) -> FrameFormat {
        FrameFormat::new(Resolution::new(w, h), Fract::new(1, fps))
    }

    fn formats() -> Vec<FrameFormat> {
        vec![
            format(1920, 1080, 30),
            format(1920, 1080, 15),
            format(1280, 720, 30),
            format(1280, 720, 60),
            format(640, 480, 30),
            format(320, 240, 30),
        ]
    }

    #[test]
    fn picks_smallest_format_at_or_above_request() {
        let fmt = select_format(&formats(), Resolution::new(680, 480), 30).unwrap();
        assert_eq!(fmt.resolution, Resolution::new(1280, 720));
        assert_eq!(fmt.fps.round(), 60.0);

        let fmt = select_format(&formats(), Resolution::new(640, 480), 30).unwrap();
        assert_eq!(fmt.resolution, Resolution::new(640, 480));
    }

    #[test]
    fn relaxes_frame_rate_first() {
        let fmt = select_format(&formats(), Resolution::new(1920, 1080), 60).unwrap();
        assert_eq!(fmt.resolution, Resolution::new(1920, 1080));
        assert_eq!(fmt.fps.round(), 30.0);
    }

    #[test]
    fn falls_back_to_largest_format() {
        let fmt = select_format(&formats(), Resolution::new(3840, 2160), 30).unwrap();
        assert_eq!(fmt.resolution, Resolution::new(1920, 1080));
        assert_eq!(fmt.fps.round(), 30.0);

        assert!(select_format(&[], Resolution::new(640, 480), 30).is_none());
    }
}
