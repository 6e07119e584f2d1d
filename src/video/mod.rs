//! Video input.

pub mod webcam;
