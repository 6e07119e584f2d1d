//! Hand landmark estimation with ONNX networks.

use std::mem;

use anyhow::{bail, Context};

use crate::{
    hand::{Hand, Handedness, Landmark},
    image::{Rect, Resolution, RgbFrame},
    iter::zip_exact,
    nn::{Cnn, ColorMapper, NeuralNetwork},
    timer::{FpsCounter, Timer},
};

use super::{
    palm::{Palm, PalmDetector},
    DetectorOptions, HandEstimate, HandModel, RunningMode,
};

/// Hand regions overlapping more than this are considered to contain the same hand.
const REGION_IOU_THRESH: f32 = 0.3;
/// Size of a tracked hand region relative to the bounding box of the hand's landmarks.
const TRACKED_REGION_SCALE: f32 = 2.0;

/// Finds hands with a palm detection network, then runs a hand landmark network on the region
/// around each palm.
///
/// The landmark network takes a single RGB image with values in range 0.0 to 1.0, in NCHW or
/// NHWC layout, and produces (in this order):
///
/// - `[1, 63]` landmarks: `x`, `y`, `z` for each of the 21 landmarks, in input pixels.
/// - `[1, 1]` hand presence score.
/// - `[1, 1]` handedness; values above 0.5 indicate a right hand.
///
/// Any further outputs (like world-space landmarks) are not computed.
///
/// Outside of [`RunningMode::Image`], hands found with enough confidence are tracked: the next
/// frame reuses the region around their landmarks, and the palm detector only runs while fewer
/// than `num_hands` hands are tracked.
pub struct OnnxHandModel {
    palms: PalmDetector,
    landmarks: Cnn,
    num_hands: usize,
    /// [`None`] if frames are unrelated to each other.
    tracking_threshold: Option<f32>,
    tracked: Vec<Rect>,
    t_infer: Timer,
    fps: FpsCounter,
}

impl OnnxHandModel {
    /// Loads the palm and landmark networks named in `options`.
    pub fn load(options: &DetectorOptions) -> anyhow::Result<Self> {
        let palms = PalmDetector::load(
            &options.palm_model_path,
            options.min_hand_detection_confidence,
        )?;

        let path = &options.model_path;
        let nn = NeuralNetwork::from_path(path)?
            .with_output_selection([0, 1, 2])
            .load()
            .with_context(|| format!("failed to load hand landmark model '{}'", path.display()))?;
        let landmarks = Cnn::new(nn, ColorMapper::linear(0.0..=1.0))?;
        log::debug!(
            "loaded hand landmark model '{}' ({:?}, input {})",
            path.display(),
            landmarks.input_shape(),
            landmarks.input_resolution(),
        );

        let tracking_threshold = match options.running_mode {
            RunningMode::Image => None,
            RunningMode::Video | RunningMode::LiveStream => Some(
                options
                    .min_hand_presence_confidence
                    .max(options.min_tracking_confidence),
            ),
        };

        Ok(Self {
            palms,
            landmarks,
            num_hands: options.num_hands,
            tracking_threshold,
            tracked: Vec::new(),
            t_infer: Timer::new("landmarks"),
            fps: FpsCounter::new("hand landmarker"),
        })
    }
}

impl HandModel for OnnxHandModel {
    fn estimate(&mut self, frame: &RgbFrame) -> anyhow::Result<Vec<HandEstimate>> {
        let tracked = mem::take(&mut self.tracked);
        let palms = if tracked.len() < self.num_hands {
            self.palms.detect(frame)?
        } else {
            Vec::new()
        };
        log::trace!(
            "{} tracked hands, palms: {:?}",
            tracked.len(),
            palms.iter().map(Palm::confidence).collect::<Vec<_>>()
        );

        let frame_res = frame.resolution();
        let mut estimates = Vec::new();
        for region in hand_regions(tracked, &palms, self.num_hands) {
            let outputs = self
                .t_infer
                .time(|| self.landmarks.estimate(frame, region))?;
            let estimate = extract(
                outputs.f32_slice(0)?,
                outputs.f32_slice(1)?,
                outputs.f32_slice(2)?,
                self.landmarks.input_resolution(),
                region,
                frame_res,
            )?;

            if let Some(threshold) = self.tracking_threshold {
                if estimate.presence >= threshold {
                    self.tracked.push(tracking_region(&estimate.hand, frame_res));
                }
            }
            estimates.push(estimate);
        }

        self.fps
            .tick_with(self.palms.timers().chain([&self.t_infer]));
        Ok(estimates)
    }
}

/// Picks the regions to run the landmark network on.
///
/// Tracked regions come first, followed by the regions of newly detected palms that do not
/// overlap any of them. At most `num_hands` regions are returned.
fn hand_regions(tracked: Vec<Rect>, palms: &[Palm], num_hands: usize) -> Vec<Rect> {
    let mut regions: Vec<Rect> = Vec::new();
    for region in tracked
        .into_iter()
        .chain(palms.iter().map(Palm::hand_region))
    {
        if regions.len() == num_hands {
            break;
        }
        if regions
            .iter()
            .all(|other| other.iou(&region) < REGION_IOU_THRESH)
        {
            regions.push(region);
        }
    }
    regions
}

/// Returns the region to look for `hand` in on the next frame.
fn tracking_region(hand: &Hand, frame_res: Resolution) -> Rect {
    let (w, h) = (frame_res.width() as f32, frame_res.height() as f32);
    let points = hand.landmarks().iter().map(|lm| (lm.x * w, lm.y * h));
    match Rect::bounding(points) {
        Some(rect) => rect.to_square().scale(TRACKED_REGION_SCALE),
        None => Rect::from_center(0.0, 0.0, 0.0, 0.0),
    }
}

/// Converts the landmark network's outputs for `region` into a [`HandEstimate`] with landmarks
/// normalized to the frame size.
fn extract(
    screen_landmarks: &[f32],
    presence: &[f32],
    handedness: &[f32],
    input_res: Resolution,
    region: Rect,
    frame_res: Resolution,
) -> anyhow::Result<HandEstimate> {
    let (&[presence], &[raw_handedness]) = (presence, handedness) else {
        bail!(
            "expected scalar presence and handedness outputs, got {} and {} values",
            presence.len(),
            handedness.len()
        );
    };
    if screen_landmarks.len() != Hand::NUM_LANDMARKS * 3 {
        bail!(
            "expected {} landmark coordinates, got {}",
            Hand::NUM_LANDMARKS * 3,
            screen_landmarks.len()
        );
    }

    // Input pixels to frame pixels, then to normalized frame coordinates.
    let scale_x = region.width() / input_res.width() as f32;
    let scale_y = region.height() / input_res.height() as f32;
    let (frame_w, frame_h) = (frame_res.width() as f32, frame_res.height() as f32);
    let mut landmarks = [Landmark::default(); Hand::NUM_LANDMARKS];
    for (coords, out) in zip_exact(screen_landmarks.chunks_exact(3), &mut landmarks) {
        // `z` uses the same scale as `x`.
        *out = Landmark::new(
            (region.x() + coords[0] * scale_x) / frame_w,
            (region.y() + coords[1] * scale_y) / frame_h,
            coords[2] * scale_x / frame_w,
        );
    }

    let (handedness, score) = if raw_handedness > 0.5 {
        (Handedness::Right, raw_handedness)
    } else {
        (Handedness::Left, 1.0 - raw_handedness)
    };

    Ok(HandEstimate {
        hand: Hand::new(landmarks, handedness, score),
        presence,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::hand::LandmarkIdx;

    use super::{super::palm, *};

    const INPUT: Resolution = Resolution::new(224, 224);

    fn landmarks() -> Vec<f32> {
        (0..21)
            .flat_map(|i| [i as f32 * 10.0, 224.0 - i as f32 * 10.0, -(i as f32)])
            .collect()
    }

    /// Extracts with the landmark network covering the whole 224x224 frame.
    fn extract_whole(presence: &[f32], handedness: &[f32]) -> anyhow::Result<HandEstimate> {
        extract_landmarks(&landmarks(), presence, handedness)
    }

    fn extract_landmarks(
        landmarks: &[f32],
        presence: &[f32],
        handedness: &[f32],
    ) -> anyhow::Result<HandEstimate> {
        let region = Rect::from_top_left(0.0, 0.0, 224.0, 224.0);
        extract(landmarks, presence, handedness, INPUT, region, INPUT)
    }

    #[test]
    fn normalizes_landmarks() {
        let est = extract_whole(&[0.9], &[0.8]).unwrap();
        assert_relative_eq!(est.presence, 0.9);

        let wrist = est.hand.landmark(LandmarkIdx::Wrist);
        assert_relative_eq!(wrist.x, 0.0);
        assert_relative_eq!(wrist.y, 1.0);

        let tip = est.hand.landmark(LandmarkIdx::PinkyTip);
        assert_relative_eq!(tip.x, 200.0 / 224.0);
        assert_relative_eq!(tip.y, 24.0 / 224.0);
        assert_relative_eq!(tip.z, -20.0 / 224.0);
    }

    #[test]
    fn maps_region_to_frame() {
        // The region is half the size of the network input.
        let region = Rect::from_top_left(100.0, 50.0, 112.0, 112.0);
        let frame = Resolution::new(640, 480);
        let est = extract(&landmarks(), &[0.9], &[0.8], INPUT, region, frame).unwrap();

        let wrist = est.hand.landmark(LandmarkIdx::Wrist);
        assert_relative_eq!(wrist.x, 100.0 / 640.0);
        assert_relative_eq!(wrist.y, 162.0 / 480.0);

        let tip = est.hand.landmark(LandmarkIdx::PinkyTip);
        assert_relative_eq!(tip.x, 200.0 / 640.0);
        assert_relative_eq!(tip.y, 62.0 / 480.0);
        assert_relative_eq!(tip.z, -10.0 / 640.0);
    }

    #[test]
    fn handedness_and_score() {
        let est = extract_whole(&[1.0], &[0.8]).unwrap();
        assert_eq!(est.hand.handedness(), Handedness::Right);
        assert_relative_eq!(est.hand.score(), 0.8);

        let est = extract_whole(&[1.0], &[0.13]).unwrap();
        assert_eq!(est.hand.handedness(), Handedness::Left);
        assert_relative_eq!(est.hand.score(), 0.87, epsilon = 1e-6);

        let est = extract_whole(&[1.0], &[0.5]).unwrap();
        assert_eq!(est.hand.handedness(), Handedness::Left);
    }

    #[test]
    fn rejects_malformed_outputs() {
        assert!(extract_landmarks(&landmarks()[..60], &[1.0], &[0.5]).is_err());
        assert!(extract_whole(&[], &[0.5]).is_err());
        assert!(extract_whole(&[1.0], &[0.5, 0.5]).is_err());
    }

    /// Raw palm network outputs for a 192x192 input where the anchors in `hits` report a 20x20
    /// palm with the middle finger MCP 8 pixels above the wrist.
    fn palm_outputs(hits: &[usize]) -> (Vec<f32>, Vec<f32>) {
        const ANCHORS: usize = 2016;
        const PARAMS: usize = 18;
        let mut boxes = vec![0.0; ANCHORS * PARAMS];
        let mut scores = vec![-10.0; ANCHORS];
        for &i in hits {
            scores[i] = 10.0;
            boxes[i * PARAMS + 2] = 20.0;
            boxes[i * PARAMS + 3] = 20.0;
            boxes[i * PARAMS + 4 + 2 * 2 + 1] = -8.0;
        }
        (boxes, scores)
    }

    fn palms(hits: &[usize]) -> Vec<Palm> {
        let (boxes, scores) = palm_outputs(hits);
        let palms = palm::extract(&boxes, &scores, Resolution::new(192, 192), 0.5).unwrap();
        palm::suppress(palms)
    }

    fn assert_center(region: Rect, (x, y): (f32, f32)) {
        let (cx, cy) = region.center();
        assert_relative_eq!(cx, x, epsilon = 1e-3);
        assert_relative_eq!(cy, y, epsilon = 1e-3);
    }

    #[test]
    fn every_palm_gets_a_region() {
        // Anchors 0 and 1 share a cell and are merged, anchor 2000 is in the opposite corner.
        let palms = palms(&[0, 1, 2000]);
        assert_eq!(palms.len(), 2);

        let mut regions = hand_regions(Vec::new(), &palms, 4);
        assert_eq!(regions.len(), 2);
        regions.sort_by(|a, b| a.x().total_cmp(&b.x()));
        assert_center(regions[0], (4.0, -6.0));
        assert_center(regions[1], (152.0, 174.0));
        for region in &regions {
            assert_relative_eq!(region.width(), 52.0);
            assert_relative_eq!(region.height(), 52.0);
        }

        assert_eq!(hand_regions(Vec::new(), &palms, 1).len(), 1);
    }

    #[test]
    fn tracked_regions_take_precedence() {
        let palms = palms(&[0, 2000]);
        let tracked = Rect::from_center(6.0, -6.0, 52.0, 52.0);
        let far = Rect::from_center(400.0, 400.0, 52.0, 52.0);

        let regions = hand_regions(vec![tracked, far], &palms, 4);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0], tracked);
        assert_eq!(regions[1], far);
        assert_center(regions[2], (152.0, 174.0));

        assert_eq!(hand_regions(vec![tracked, far], &palms, 2), [tracked, far]);
    }

    #[test]
    fn tracking_region_surrounds_landmarks() {
        let mut landmarks = [Landmark::new(0.25, 0.25, 0.0); Hand::NUM_LANDMARKS];
        landmarks[LandmarkIdx::PinkyTip as usize] = Landmark::new(0.5, 0.75, 0.0);
        let hand = Hand::new(landmarks, Handedness::Left, 1.0);

        let region = tracking_region(&hand, Resolution::new(640, 480));
        assert_eq!(region.center(), (240.0, 240.0));
        assert_eq!((region.width(), region.height()), (480.0, 480.0));
    }
}
