//! Hand landmark data produced by a [`HandLandmarker`][crate::detector::HandLandmarker].
//!
//! Landmark coordinates are *normalized*: `x` and `y` are in range 0.0 to 1.0 relative to the
//! width and height of the image the hand was detected in, with `(0, 0)` at the top left corner.

use std::fmt;

/// A single landmark on a hand.
#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    /// Relative depth, with the wrist at the origin. Not used for drawing.
    pub z: f32,
}

impl Landmark {
    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    /// Returns the category name, `"Left"` or `"Right"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Handedness::Left => "Left",
            Handedness::Right => "Right",
        }
    }
}

impl fmt::Display for Handedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected hand, consisting of [`Hand::NUM_LANDMARKS`] landmarks and its handedness.
#[derive(Debug, Clone, PartialEq)]
pub struct Hand {
    landmarks: [Landmark; Hand::NUM_LANDMARKS],
    handedness: Handedness,
    score: f32,
}

impl Hand {
    pub const NUM_LANDMARKS: usize = 21;

    /// Creates a hand from its landmarks (ordered as in [`LandmarkIdx`]), its handedness, and the
    /// confidence of the handedness classification.
    pub fn new(
        landmarks: [Landmark; Self::NUM_LANDMARKS],
        handedness: Handedness,
        score: f32,
    ) -> Self {
        Self {
            landmarks,
            handedness,
            score,
        }
    }

    #[inline]
    pub fn landmarks(&self) -> &[Landmark; Self::NUM_LANDMARKS] {
        &self.landmarks
    }

    #[inline]
    pub fn landmark(&self, idx: LandmarkIdx) -> Landmark {
        self.landmarks[idx as usize]
    }

    #[inline]
    pub fn handedness(&self) -> Handedness {
        self.handedness
    }

    /// Confidence of the [`Hand::handedness`] classification, from 0.0 to 1.0.
    #[inline]
    pub fn score(&self) -> f32 {
        self.score
    }

    /// Returns the text label drawn next to the hand, eg. `Left: 0.87`.
    pub fn label(&self) -> String {
        format!("{}: {:.2}", self.handedness, self.score)
    }
}

/// The hands detected in a single image.
///
/// Results are never updated in place; a newer result replaces an older one as a whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    hands: Vec<Hand>,
}

impl DetectionResult {
    pub fn new(hands: Vec<Hand>) -> Self {
        Self { hands }
    }

    /// Returns a result that contains no hands.
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn hands(&self) -> &[Hand] {
        &self.hands
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hands.is_empty()
    }
}

impl FromIterator<Hand> for DetectionResult {
    fn from_iter<T: IntoIterator<Item = Hand>>(iter: T) -> Self {
        Self {
            hands: iter.into_iter().collect(),
        }
    }
}

/// Names for the hand landmarks.
///
/// # Terminology
///
/// - **CMC**: [Carpometacarpal joint], the lowest joint of the thumb, located near the wrist.
/// - **MCP**: [Metacarpophalangeal joint], the lower joint forming the knuckles near the palm of
///   the hand.
/// - **PIP**: Proximal Interphalangeal joint, the joint between the MCP and DIP.
/// - **DIP**: Distal Interphalangeal joint, the highest joint of a finger.
/// - **Tip**: This landmark is just placed on the tip of the finger, above the DIP.
///
/// [Carpometacarpal joint]: https://en.wikipedia.org/wiki/Carpometacarpal_joint
/// [Metacarpophalangeal joint]: https://en.wikipedia.org/wiki/Metacarpophalangeal_joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkIdx {
    Wrist,
    ThumbCmc,
    ThumbMcp,
    ThumbIp,
    ThumbTip,
    IndexFingerMcp,
    IndexFingerPip,
    IndexFingerDip,
    IndexFingerTip,
    MiddleFingerMcp,
    MiddleFingerPip,
    MiddleFingerDip,
    MiddleFingerTip,
    RingFingerMcp,
    RingFingerPip,
    RingFingerDip,
    RingFingerTip,
    PinkyMcp,
    PinkyPip,
    PinkyDip,
    PinkyTip,
}

/// Number of bones in the hand skeleton.
pub const NUM_CONNECTIONS: usize = 20;

/// The hand skeleton: every finger is a chain of 4 bones rooted at the wrist.
pub const CONNECTIONS: [(LandmarkIdx, LandmarkIdx); NUM_CONNECTIONS] = {
    use LandmarkIdx::*;
    [
        // Thumb:
        (Wrist, ThumbCmc),
        (ThumbCmc, ThumbMcp),
        (ThumbMcp, ThumbIp),
        (ThumbIp, ThumbTip),
        // Index:
        (Wrist, IndexFingerMcp),
        (IndexFingerMcp, IndexFingerPip),
        (IndexFingerPip, IndexFingerDip),
        (IndexFingerDip, IndexFingerTip),
        // Middle:
        (Wrist, MiddleFingerMcp),
        (MiddleFingerMcp, MiddleFingerPip),
        (MiddleFingerPip, MiddleFingerDip),
        (MiddleFingerDip, MiddleFingerTip),
        // Ring:
        (Wrist, RingFingerMcp),
        (RingFingerMcp, RingFingerPip),
        (RingFingerPip, RingFingerDip),
        (RingFingerDip, RingFingerTip),
        // Pinky:
        (Wrist, PinkyMcp),
        (PinkyMcp, PinkyPip),
        (PinkyPip, PinkyDip),
        (PinkyDip, PinkyTip),
    ]
};

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn edge_set() -> HashSet<(usize, usize)> {
        CONNECTIONS
            .iter()
            .map(|&(a, b)| (a as usize, b as usize))
            .collect()
    }

    #[test]
    fn skeleton_topology() {
        let edges = edge_set();
        assert_eq!(edges.len(), 20);
        for finger in 0..5 {
            let base = finger * 4;
            assert!(edges.contains(&(0, base + 1)));
            for joint in 1..4 {
                assert!(edges.contains(&(base + joint, base + joint + 1)));
            }
        }
        assert!(!edges.contains(&(4, 5)));
        assert!(!edges.contains(&(5, 4)));
    }

    #[test]
    fn skeleton_is_a_tree() {
        // 20 edges over 21 nodes where every non-wrist node has exactly one parent.
        let mut parents = [0; Hand::NUM_LANDMARKS];
        for (_, child) in CONNECTIONS {
            parents[child as usize] += 1;
        }
        assert_eq!(parents[LandmarkIdx::Wrist as usize], 0);
        assert!(parents[1..].iter().all(|&p| p == 1));
    }

    #[test]
    fn label_format() {
        let hand = Hand::new([Landmark::default(); 21], Handedness::Left, 0.87);
        assert_eq!(hand.label(), "Left: 0.87");

        let hand = Hand::new([Landmark::default(); 21], Handedness::Right, 0.5);
        assert_eq!(hand.label(), "Right: 0.50");
    }

    #[test]
    fn landmark_access() {
        let mut landmarks = [Landmark::default(); 21];
        landmarks[LandmarkIdx::IndexFingerTip as usize] = Landmark::new(0.25, 0.75, -0.1);
        let hand = Hand::new(landmarks, Handedness::Right, 0.9);
        assert_eq!(
            hand.landmark(LandmarkIdx::IndexFingerTip),
            Landmark::new(0.25, 0.75, -0.1)
        );
    }
}
