use std::fmt;

/// Width and height of an image, in pixels.
#[derive(PartialEq, Eq, Clone, Copy, Hash)]
pub struct Resolution {
    width: u32,
    height: u32,
}

impl Resolution {
    /// Creates a new [`Resolution`] of `width x height`.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns the width of this [`Resolution`].
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Returns the height of this [`Resolution`].
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn num_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Maps a normalized coordinate to the pixel grid of this resolution.
    ///
    /// The pixel coordinate is `(floor(x * width), floor(y * height))`. For `x` and `y` in range
    /// 0.0 to 1.0 (inclusive), the result is clamped to lie inside the image, so that `1.0` maps
    /// to the last row or column. Coordinates outside of that range land outside of the image, but
    /// no further than one image size away from its border.
    pub fn pixel_at(&self, x: f32, y: f32) -> (i32, i32) {
        (
            Self::project(x, self.width),
            Self::project(y, self.height),
        )
    }

    fn project(coord: f32, size: u32) -> i32 {
        let pixel = (coord * size as f32).floor();
        let size = size as f32;
        if (0.0..=1.0).contains(&coord) {
            pixel.clamp(0.0, (size - 1.0).max(0.0)) as i32
        } else {
            // NaN maps to 0.
            pixel.clamp(-size, 2.0 * size) as i32
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_mapping_matches_floor() {
        for _ in 0..1000 {
            let res = Resolution::new(fastrand::u32(1..4000), fastrand::u32(1..4000));
            let (x, y) = (fastrand::f32(), fastrand::f32());

            let (px, py) = res.pixel_at(x, y);
            let expected_x = ((x * res.width() as f32).floor() as i32).min(res.width() as i32 - 1);
            let expected_y =
                ((y * res.height() as f32).floor() as i32).min(res.height() as i32 - 1);
            assert_eq!((px, py), (expected_x, expected_y), "{x},{y} in {res}");
            assert!(px >= 0 && (px as u32) < res.width());
            assert!(py >= 0 && (py as u32) < res.height());
        }
    }

    #[test]
    fn pixel_mapping_edges() {
        let res = Resolution::new(680, 480);
        assert_eq!(res.pixel_at(0.0, 0.0), (0, 0));
        assert_eq!(res.pixel_at(0.5, 0.5), (340, 240));
        assert_eq!(res.pixel_at(1.0, 1.0), (679, 479));
        assert_eq!(res.pixel_at(0.999, 0.001), (679, 0));
    }

    #[test]
    fn out_of_range_is_not_clamped() {
        let res = Resolution::new(100, 100);
        assert_eq!(res.pixel_at(-0.25, 1.5), (-25, 150));
    }

    #[test]
    fn far_out_of_range_stays_near_image() {
        let res = Resolution::new(640, 480);
        assert_eq!(res.pixel_at(3e5, -1e30), (1280, -480));
        assert_eq!(res.pixel_at(f32::NEG_INFINITY, f32::INFINITY), (-640, 960));
        assert_eq!(res.pixel_at(f32::NAN, 0.5), (0, 240));
    }

    #[test]
    fn display() {
        assert_eq!(Resolution::new(640, 480).to_string(), "640x480");
        assert_eq!(format!("{:?}", Resolution::new(3, 4)), "3x4");
    }
}
