//! Landmark rendering.
//!
//! The [`Annotator`] turns a [`DetectionResult`] into an [`Overlay`] (the list of primitives to
//! draw, already projected into pixel space) and rasterizes it onto the frame.

use std::time::Instant;

use embedded_graphics::mono_font::ascii::{FONT_10X20, FONT_7X13};

use crate::{
    hand::{DetectionResult, Hand, LandmarkIdx, CONNECTIONS, NUM_CONNECTIONS},
    image::{draw, Color, Image, Resolution},
};

/// Number of rows at the top of the frame that status text may be drawn into.
pub const STATUS_REGION_HEIGHT: u32 = 80;

const FPS_POSITION: (i32, i32) = (10, 30);
const HAND_COUNT_POSITION: (i32, i32) = (10, 70);
/// Vertical distance between the wrist and the baseline of the hand label.
const LABEL_OFFSET: i32 = 20;

const FPS_COLOR: Color = Color::CYAN;
const HAND_COUNT_COLOR: Color = Color::GREEN;
const SKELETON_COLOR: Color = Color::GREEN;
const JOINT_COLOR: Color = Color::BLUE;
const RING_COLOR: Color = Color::YELLOW;
const LABEL_COLOR: Color = Color::GREEN;

const SKELETON_THICKNESS: u32 = 2;
const JOINT_RADIUS: u32 = 5;
const RING_RADIUS: u32 = 6;
const RING_THICKNESS: u32 = 2;

/// Measures the instantaneous frame rate from the time between consecutive calls.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    last: Instant,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self { last: start }
    }

    /// Records a frame at `now` and returns the frame rate derived from the previous one.
    ///
    /// Returns 0 if no time has passed (or `now` lies before the previous frame).
    pub fn tick(&mut self, now: Instant) -> f32 {
        let delta = now.saturating_duration_since(self.last);
        self.last = now;
        if delta.is_zero() {
            0.0
        } else {
            1.0 / delta.as_secs_f32()
        }
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Draws detection results and status information onto frames.
///
/// An [`Annotator`] is meant to live as long as the video stream it annotates, since it tracks the
/// frame rate across calls.
#[derive(Debug, Clone, Default)]
pub struct Annotator {
    fps: FpsMeter,
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Annotates `frame` with `result` and the current frame rate.
    pub fn annotate(&mut self, frame: &mut Image, result: Option<&DetectionResult>) -> Overlay {
        self.annotate_at(frame, result, Instant::now())
    }

    /// Annotates `frame`, treating `now` as the time the frame is rendered.
    pub fn annotate_at(
        &mut self,
        frame: &mut Image,
        result: Option<&DetectionResult>,
        now: Instant,
    ) -> Overlay {
        let fps = self.fps.tick(now);
        let overlay = Overlay::new(fps, result, frame.resolution());
        overlay.draw(frame);
        overlay
    }
}

/// Everything that gets drawn onto a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    fps: f32,
    fps_text: String,
    hand_count_text: String,
    hands: Vec<HandOverlay>,
}

impl Overlay {
    /// Plans the overlay for a frame of size `res`.
    ///
    /// A missing `result` is treated like a result without hands.
    pub fn new(fps: f32, result: Option<&DetectionResult>, res: Resolution) -> Self {
        let hands = result.map_or(&[][..], |result| result.hands());
        Self {
            fps,
            fps_text: format!("FPS: {}", fps as i32),
            hand_count_text: format!("Hands detected: {}", hands.len()),
            hands: hands.iter().map(|hand| HandOverlay::new(hand, res)).collect(),
        }
    }

    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }

    #[inline]
    pub fn fps_text(&self) -> &str {
        &self.fps_text
    }

    #[inline]
    pub fn hand_count_text(&self) -> &str {
        &self.hand_count_text
    }

    #[inline]
    pub fn hands(&self) -> &[HandOverlay] {
        &self.hands
    }

    /// Rasterizes this overlay onto `image`.
    pub fn draw(&self, image: &mut Image) {
        for hand in &self.hands {
            hand.draw(image);
        }

        let (x, y) = FPS_POSITION;
        draw::text(image, x, y, &self.fps_text)
            .color(FPS_COLOR)
            .font(&FONT_10X20)
            .align_left()
            .align_baseline();
        let (x, y) = HAND_COUNT_POSITION;
        draw::text(image, x, y, &self.hand_count_text)
            .color(HAND_COUNT_COLOR)
            .font(&FONT_10X20)
            .align_left()
            .align_baseline();
    }
}

/// The pixel-space skeleton and label of a single hand.
#[derive(Debug, Clone, PartialEq)]
pub struct HandOverlay {
    joints: [(i32, i32); Hand::NUM_LANDMARKS],
    edges: [((i32, i32), (i32, i32)); NUM_CONNECTIONS],
    label: String,
    label_anchor: (i32, i32),
}

impl HandOverlay {
    fn new(hand: &Hand, res: Resolution) -> Self {
        let joints = hand.landmarks().map(|lm| res.pixel_at(lm.x, lm.y));
        let edges = CONNECTIONS.map(|(a, b)| (joints[a as usize], joints[b as usize]));
        let (wrist_x, wrist_y) = joints[LandmarkIdx::Wrist as usize];

        Self {
            joints,
            edges,
            label: hand.label(),
            label_anchor: (wrist_x, wrist_y.saturating_sub(LABEL_OFFSET)),
        }
    }

    /// Pixel positions of the hand's landmarks, in [`LandmarkIdx`] order.
    #[inline]
    pub fn joints(&self) -> &[(i32, i32); Hand::NUM_LANDMARKS] {
        &self.joints
    }

    /// Start and end pixel positions of every skeleton bone.
    #[inline]
    pub fn edges(&self) -> &[((i32, i32), (i32, i32))] {
        &self.edges
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Position of the left end of the label's baseline.
    #[inline]
    pub fn label_anchor(&self) -> (i32, i32) {
        self.label_anchor
    }

    fn draw(&self, image: &mut Image) {
        for &((x0, y0), (x1, y1)) in &self.edges {
            draw::line(image, x0, y0, x1, y1)
                .color(SKELETON_COLOR)
                .stroke_width(SKELETON_THICKNESS);
        }
        for &(x, y) in &self.joints {
            draw::circle(image, x, y, JOINT_RADIUS * 2 + 1)
                .color(JOINT_COLOR)
                .filled();
            draw::circle(image, x, y, RING_RADIUS * 2 + 1)
                .color(RING_COLOR)
                .stroke_width(RING_THICKNESS);
        }

        let (x, y) = self.label_anchor;
        draw::text(image, x, y, &self.label)
            .color(LABEL_COLOR)
            .font(&FONT_7X13)
            .align_left()
            .align_baseline();
    }
}
