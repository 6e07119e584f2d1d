//! Palm detection.
//!
//! The palm detector is a Single Shot MultiBox Detector (SSD): every anchor of its output grid
//! predicts a palm box, 7 keypoints and a confidence score. Overlapping predictions for the same
//! palm are merged by non-maximum averaging.

use std::{iter, path::Path};

use anyhow::{bail, Context};
use once_cell::sync::Lazy;

use crate::{
    image::{Rect, Resolution, RgbFrame},
    iter::zip_exact,
    nn::{Cnn, ColorMapper, NeuralNetwork},
    timer::Timer,
};

/// Keypoints per palm: wrist, index/middle/ring/pinky MCP, thumb CMC, thumb MCP.
const NUM_KEYPOINTS: usize = 7;
const WRIST: usize = 0;
const MIDDLE_FINGER_MCP: usize = 2;
/// Box center and size, followed by the keypoints.
const BOX_PARAMS: usize = 4 + NUM_KEYPOINTS * 2;

/// Palms overlapping more than this are merged.
const NMS_IOU_THRESH: f32 = 0.3;

/// Size of the hand region relative to the palm box.
const HAND_REGION_SCALE: f32 = 2.6;
/// How far the hand region is moved from the palm towards the fingers, relative to the palm size.
const HAND_REGION_SHIFT: f32 = 0.5;

/// Output layers of the palm network: anchors per cell, and the feature map size.
const LAYERS: &[(usize, u32, u32)] = &[(2, 24, 24), (6, 12, 12)];

/// Anchor centers, in range 0.0 to 1.0.
static ANCHORS: Lazy<Vec<(f32, f32)>> = Lazy::new(|| {
    let mut anchors = Vec::new();
    for &(boxes_per_cell, width, height) in LAYERS {
        for y in 0..height {
            for x in 0..width {
                let center = (
                    (x as f32 + 0.5) / width as f32,
                    (y as f32 + 0.5) / height as f32,
                );
                anchors.extend(iter::repeat(center).take(boxes_per_cell));
            }
        }
    }
    anchors
});

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// A palm located by a [`PalmDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct Palm {
    confidence: f32,
    rect: Rect,
    keypoints: [(f32, f32); NUM_KEYPOINTS],
}

impl Palm {
    #[inline]
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Returns the square region that is expected to contain the whole hand.
    ///
    /// The region is centered on a point between the palm and the fingers, in the direction from
    /// the wrist to the middle finger.
    pub fn hand_region(&self) -> Rect {
        let (wx, wy) = self.keypoints[WRIST];
        let (mx, my) = self.keypoints[MIDDLE_FINGER_MCP];
        let (dx, dy) = (mx - wx, my - wy);
        let len = dx.hypot(dy);
        // Fingers point up if the keypoints coincide.
        let (dx, dy) = if len > f32::EPSILON {
            (dx / len, dy / len)
        } else {
            (0.0, -1.0)
        };

        let palm = self.rect.to_square();
        let shift = palm.height() * HAND_REGION_SHIFT;
        let (cx, cy) = palm.center();
        Rect::from_center(cx + dx * shift, cy + dy * shift, palm.width(), palm.height())
            .scale(HAND_REGION_SCALE)
    }

    /// Maps network input coordinates to frame coordinates.
    fn map(&self, offset: (f32, f32), scale: f32) -> Self {
        let map = |(x, y): (f32, f32)| (x * scale + offset.0, y * scale + offset.1);
        let (cx, cy) = map(self.rect.center());
        Self {
            confidence: self.confidence,
            rect: Rect::from_center(
                cx,
                cy,
                self.rect.width() * scale,
                self.rect.height() * scale,
            ),
            keypoints: self.keypoints.map(map),
        }
    }
}

/// Finds palms in whole frames.
pub struct PalmDetector {
    cnn: Cnn,
    threshold: f32,
    t_infer: Timer,
    t_nms: Timer,
}

impl PalmDetector {
    /// Loads the palm network at `path`. Palms with a confidence below `threshold` are ignored.
    pub fn load(path: &Path, threshold: f32) -> anyhow::Result<Self> {
        let nn = NeuralNetwork::from_path(path)?
            .with_output_selection([0, 1])
            .load()
            .with_context(|| format!("failed to load palm detection model '{}'", path.display()))?;
        let cnn = Cnn::new(nn, ColorMapper::linear(0.0..=1.0))?;
        log::debug!(
            "loaded palm detection model '{}' ({:?}, input {})",
            path.display(),
            cnn.input_shape(),
            cnn.input_resolution(),
        );

        Ok(Self {
            cnn,
            threshold,
            t_infer: Timer::new("palms"),
            t_nms: Timer::new("nms"),
        })
    }

    /// Detects the palms in `frame`, most confident first.
    ///
    /// The frame is padded to the network's aspect ratio, so that palms are not distorted.
    pub fn detect(&mut self, frame: &RgbFrame) -> anyhow::Result<Vec<Palm>> {
        let input_res = self.cnn.input_resolution();
        let frame_rect = Rect::from_top_left(0.0, 0.0, frame.width() as f32, frame.height() as f32);
        let region = frame_rect
            .grow_to_fit_aspect(input_res.width() as f32 / input_res.height() as f32);

        let outputs = self.t_infer.time(|| self.cnn.estimate(frame, region))?;
        let palms = extract(
            outputs.f32_slice(0)?,
            outputs.f32_slice(1)?,
            input_res,
            self.threshold,
        )?;
        let palms = self.t_nms.time(|| suppress(palms));

        let scale = region.width() / input_res.width() as f32;
        Ok(palms
            .iter()
            .map(|palm| palm.map((region.x(), region.y()), scale))
            .collect())
    }

    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_infer, &self.t_nms].into_iter()
    }
}

/// Decodes all palms with a confidence of at least `threshold`, in network input coordinates.
pub(super) fn extract(
    boxes: &[f32],
    scores: &[f32],
    input_res: Resolution,
    threshold: f32,
) -> anyhow::Result<Vec<Palm>> {
    let anchors = &*ANCHORS;
    if scores.len() != anchors.len() || boxes.len() != anchors.len() * BOX_PARAMS {
        bail!(
            "expected {} palm boxes and scores, got {} box values and {} scores",
            anchors.len(),
            boxes.len(),
            scores.len()
        );
    }

    let (w, h) = (input_res.width() as f32, input_res.height() as f32);
    let mut palms = Vec::new();
    for ((&(ax, ay), params), &raw) in zip_exact(
        zip_exact(anchors, boxes.chunks_exact(BOX_PARAMS)),
        scores,
    ) {
        let confidence = sigmoid(raw);
        if confidence < threshold {
            continue;
        }

        let (ax, ay) = (ax * w, ay * h);
        let mut keypoints = [(0.0, 0.0); NUM_KEYPOINTS];
        for (kp, xy) in zip_exact(&mut keypoints, params[4..].chunks_exact(2)) {
            *kp = (xy[0] + ax, xy[1] + ay);
        }
        palms.push(Palm {
            confidence,
            rect: Rect::from_center(params[0] + ax, params[1] + ay, params[2], params[3]),
            keypoints,
        });
    }

    Ok(palms)
}

/// Merges overlapping palms into their confidence-weighted average, most confident first.
pub(super) fn suppress(mut palms: Vec<Palm>) -> Vec<Palm> {
    // Ascending, so that the most confident palm is popped first.
    palms.sort_unstable_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut out = Vec::new();
    while let Some(seed) = palms.pop() {
        let (overlapping, rest) = palms
            .into_iter()
            .partition::<Vec<_>, _>(|other| seed.rect.iou(&other.rect) >= NMS_IOU_THRESH);
        palms = rest;
        out.push(average(&seed, &overlapping));
    }
    out
}

fn average(seed: &Palm, others: &[Palm]) -> Palm {
    let mut divisor = 0.0;
    let (mut x, mut y, mut w, mut h) = (0.0, 0.0, 0.0, 0.0);
    let mut keypoints = [(0.0, 0.0); NUM_KEYPOINTS];
    for palm in iter::once(seed).chain(others) {
        let factor = palm.confidence;
        divisor += factor;
        let (cx, cy) = palm.rect.center();
        x += cx * factor;
        y += cy * factor;
        w += palm.rect.width() * factor;
        h += palm.rect.height() * factor;
        for (acc, kp) in zip_exact(&mut keypoints, &palm.keypoints) {
            acc.0 += kp.0 * factor;
            acc.1 += kp.1 * factor;
        }
    }

    if divisor <= 0.0 {
        return seed.clone();
    }
    Palm {
        confidence: seed.confidence,
        rect: Rect::from_center(x / divisor, y / divisor, w / divisor, h / divisor),
        keypoints: keypoints.map(|(x, y)| (x / divisor, y / divisor)),
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    const INPUT: Resolution = Resolution::new(192, 192);

    fn palm(confidence: f32, rect: Rect) -> Palm {
        Palm {
            confidence,
            rect,
            keypoints: [rect.center(); NUM_KEYPOINTS],
        }
    }

    /// Raw outputs where only the anchors in `hits` report a 20x20 palm.
    fn outputs(hits: &[usize]) -> (Vec<f32>, Vec<f32>) {
        let n = ANCHORS.len();
        let mut boxes = vec![0.0; n * BOX_PARAMS];
        let mut scores = vec![-10.0; n];
        for &i in hits {
            scores[i] = 10.0;
            boxes[i * BOX_PARAMS + 2] = 20.0;
            boxes[i * BOX_PARAMS + 3] = 20.0;
            // Middle finger MCP 8 pixels above the wrist.
            boxes[i * BOX_PARAMS + 4 + MIDDLE_FINGER_MCP * 2 + 1] = -8.0;
        }
        (boxes, scores)
    }

    #[test]
    fn anchor_grid() {
        assert_eq!(ANCHORS.len(), 2016);
        assert_eq!(ANCHORS[0], (0.5 / 24.0, 0.5 / 24.0));
        assert_eq!(ANCHORS[1], ANCHORS[0]);
        assert_eq!(ANCHORS[2016 - 1], (11.5 / 12.0, 11.5 / 12.0));
    }

    #[test]
    fn extracts_every_confident_palm() {
        let (boxes, scores) = outputs(&[0, 2000]);
        let palms = extract(&boxes, &scores, INPUT, 0.5).unwrap();
        assert_eq!(palms.len(), 2);

        assert_relative_eq!(palms[0].confidence(), sigmoid(10.0));
        assert_eq!(palms[0].rect.center(), (4.0, 4.0));
        assert_eq!(palms[0].keypoints[MIDDLE_FINGER_MCP], (4.0, -4.0));

        // Far apart, so both survive suppression.
        assert_eq!(suppress(palms).len(), 2);
    }

    #[test]
    fn rejects_mismatched_outputs() {
        let (boxes, scores) = outputs(&[]);
        assert!(extract(&boxes[..18], &scores, INPUT, 0.5).is_err());
        assert!(extract(&boxes, &scores[1..], INPUT, 0.5).is_err());
    }

    #[test]
    fn suppression_averages_overlapping_palms() {
        let a = palm(0.9, Rect::from_center(10.0, 10.0, 10.0, 10.0));
        let b = palm(0.3, Rect::from_center(12.0, 10.0, 10.0, 10.0));
        let c = palm(0.6, Rect::from_center(100.0, 100.0, 10.0, 10.0));

        let palms = suppress(vec![b, c, a]);
        assert_eq!(palms.len(), 2);
        assert_relative_eq!(palms[0].confidence(), 0.9);
        let (x, y) = palms[0].rect.center();
        assert_relative_eq!(x, 10.5, epsilon = 1e-4);
        assert_relative_eq!(y, 10.0, epsilon = 1e-4);
        assert_relative_eq!(palms[1].confidence(), 0.6);
        let (x, y) = palms[1].rect.center();
        assert_relative_eq!(x, 100.0, epsilon = 1e-4);
        assert_relative_eq!(y, 100.0, epsilon = 1e-4);
    }

    #[test]
    fn hand_region_extends_towards_fingers() {
        let mut upright = palm(1.0, Rect::from_center(50.0, 50.0, 10.0, 8.0));
        upright.keypoints[WRIST] = (50.0, 55.0);
        upright.keypoints[MIDDLE_FINGER_MCP] = (50.0, 45.0);

        let region = upright.hand_region();
        assert_relative_eq!(region.width(), 26.0);
        assert_relative_eq!(region.height(), 26.0);
        let (x, y) = region.center();
        assert_relative_eq!(x, 50.0);
        assert_relative_eq!(y, 45.0);

        let mut sideways = upright.clone();
        sideways.keypoints[WRIST] = (45.0, 50.0);
        sideways.keypoints[MIDDLE_FINGER_MCP] = (55.0, 50.0);
        let (x, y) = sideways.hand_region().center();
        assert_relative_eq!(x, 55.0);
        assert_relative_eq!(y, 50.0);
    }

    #[test]
    fn maps_to_frame_coordinates() {
        let p = palm(0.8, Rect::from_center(96.0, 96.0, 20.0, 20.0));
        // A 640x480 frame padded to 640x640 and scaled down to 192x192.
        let mapped = p.map((0.0, -80.0), 640.0 / 192.0);
        let (x, y) = mapped.rect.center();
        assert_relative_eq!(x, 320.0, epsilon = 1e-3);
        assert_relative_eq!(y, 240.0, epsilon = 1e-3);
        assert_relative_eq!(mapped.rect.width(), 20.0 * 640.0 / 192.0, epsilon = 1e-3);
        assert_eq!(mapped.keypoints[WRIST], (x, y));
    }
}
