use std::fmt;

/// An axis-aligned rectangle with floating-point coordinates.
///
/// Rectangles are allowed to have zero height and/or width, and may extend past the borders of the
/// image they refer to.
#[derive(Clone, Copy, PartialEq)]
pub struct Rect {
    x_center: f32,
    y_center: f32,
    width: f32,
    height: f32,
}

impl Rect {
    /// Creates a rectangle extending outwards from a center point.
    #[inline]
    pub fn from_center(x_center: f32, y_center: f32, width: f32, height: f32) -> Self {
        Self {
            x_center,
            y_center,
            width,
            height,
        }
    }

    /// Creates a rectangle extending downwards and right from a point.
    #[inline]
    pub fn from_top_left(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::from_center(x + width * 0.5, y + height * 0.5, width, height)
    }

    /// Computes the bounding rectangle of `points`.
    ///
    /// Returns [`None`] if `points` is empty.
    pub fn bounding<I: IntoIterator<Item = (f32, f32)>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x, y) = iter.next()?;
        let (mut min, mut max) = ((x, y), (x, y));
        for (x, y) in iter {
            min = (min.0.min(x), min.1.min(y));
            max = (max.0.max(x), max.1.max(y));
        }

        Some(Self::from_top_left(
            min.0,
            min.1,
            max.0 - min.0,
            max.1 - min.1,
        ))
    }

    /// Scales width and height by `scale`, keeping the center in place.
    #[must_use]
    pub fn scale(&self, scale: f32) -> Self {
        Self::from_center(
            self.x_center,
            self.y_center,
            self.width * scale,
            self.height * scale,
        )
    }

    /// Grows the shorter side to match the longer one, keeping the center in place.
    #[must_use]
    pub fn to_square(&self) -> Self {
        let side = self.width.max(self.height);
        Self::from_center(self.x_center, self.y_center, side, side)
    }

    /// Symmetrically extends one dimension so that `width / height` equals `aspect`.
    ///
    /// Degenerate rectangles and aspect ratios are returned unchanged.
    #[must_use]
    pub fn grow_to_fit_aspect(&self, aspect: f32) -> Self {
        if !(aspect.is_finite() && aspect > 0.0) || self.width <= 0.0 || self.height <= 0.0 {
            return *self;
        }

        let target_width = self.height * aspect;
        if target_width >= self.width {
            Self::from_center(self.x_center, self.y_center, target_width, self.height)
        } else {
            Self::from_center(self.x_center, self.y_center, self.width, self.width / aspect)
        }
    }

    /// Returns the X coordinate of the left side.
    #[inline]
    pub fn x(&self) -> f32 {
        self.x_center - self.width * 0.5
    }

    /// Returns the Y coordinate of the top side.
    #[inline]
    pub fn y(&self) -> f32 {
        self.y_center - self.height * 0.5
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.height
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (self.x_center, self.y_center)
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    fn intersection_area(&self, other: &Self) -> f32 {
        let w = (self.x() + self.width).min(other.x() + other.width) - self.x().max(other.x());
        let h = (self.y() + self.height).min(other.y() + other.height) - self.y().max(other.y());
        w.max(0.0) * h.max(0.0)
    }

    /// Computes the Intersection over Union (IOU) of `self` and `other`.
    ///
    /// Returns 0.0 if both rectangles are empty.
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

impl fmt::Debug for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rect @ ({},{})/{}x{}",
            self.x(),
            self.y(),
            self.width,
            self.height
        )
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn iou() {
        let a = Rect::from_top_left(0.0, 0.0, 2.0, 2.0);
        assert_relative_eq!(a.iou(&a), 1.0);

        let b = Rect::from_top_left(1.0, 0.0, 2.0, 2.0);
        assert_relative_eq!(a.iou(&b), 2.0 / 6.0);
        assert_relative_eq!(b.iou(&a), 2.0 / 6.0);

        let far = Rect::from_top_left(10.0, 10.0, 2.0, 2.0);
        assert_eq!(a.iou(&far), 0.0);

        let empty = Rect::from_center(0.0, 0.0, 0.0, 0.0);
        assert_eq!(empty.iou(&empty), 0.0);
    }

    #[test]
    fn grow_to_fit_aspect() {
        let frame = Rect::from_top_left(0.0, 0.0, 640.0, 480.0);
        let square = frame.grow_to_fit_aspect(1.0);
        assert_eq!((square.x(), square.y()), (0.0, -80.0));
        assert_eq!((square.width(), square.height()), (640.0, 640.0));

        let wide = Rect::from_top_left(0.0, 0.0, 10.0, 10.0).grow_to_fit_aspect(2.0);
        assert_eq!((wide.x(), wide.y()), (-5.0, 0.0));
        assert_eq!((wide.width(), wide.height()), (20.0, 10.0));

        assert_eq!(frame.grow_to_fit_aspect(f32::NAN), frame);
    }

    #[test]
    fn bounding() {
        assert!(Rect::bounding(Vec::new()).is_none());

        let rect = Rect::bounding([(1.0, 5.0), (-1.0, 2.0), (3.0, 3.0)]).unwrap();
        assert_eq!((rect.x(), rect.y()), (-1.0, 2.0));
        assert_eq!((rect.width(), rect.height()), (4.0, 3.0));
        assert_eq!(rect.to_square().center(), rect.center());
        assert_eq!(rect.to_square().height(), 4.0);
        assert_eq!(rect.scale(2.0).width(), 8.0);
    }
}
