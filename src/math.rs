//! Affine matrices, points and axis-aligned rectangles.
//!
//! The matrix convention maps a local point `(x, y)` to
//! `(a * x + c * y + tx, b * x + d * y + ty)`.

/// A 2D point or vector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn set(&mut self, x: f32, y: f32) {
        self.x = x;
        self.y = y;
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

/// A 2×3 affine transform.
///
/// # Examples
///
/// ```
/// use tableau::{Matrix, Point};
///
/// let translate = Matrix::translation(10.0, 5.0);
/// let scale = Matrix::scale(2.0, 2.0);
///
/// // Scale first, then translate.
/// let combined = scale.then(&translate);
/// assert_eq!(combined.apply(Point::new(1.0, 1.0)), Point::new(12.0, 7.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for Matrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Matrix {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub const fn new(a: f32, b: f32, c: f32, d: f32, tx: f32, ty: f32) -> Self {
        Self { a, b, c, d, tx, ty }
    }

    pub const fn translation(tx: f32, ty: f32) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    pub const fn scale(sx: f32, sy: f32) -> Self {
        Self::new(sx, 0.0, 0.0, sy, 0.0, 0.0)
    }

    pub fn rotation(radians: f32) -> Self {
        let (sin, cos) = radians.sin_cos();
        Self::new(cos, sin, -sin, cos, 0.0, 0.0)
    }

    /// Returns the transform that applies `self` first and `parent` second.
    ///
    /// This is the world transform of a node whose local transform is `self`
    /// and whose parent's world transform is `parent`.
    pub fn then(&self, parent: &Matrix) -> Matrix {
        Matrix {
            a: self.a * parent.a + self.b * parent.c,
            b: self.a * parent.b + self.b * parent.d,
            c: self.c * parent.a + self.d * parent.c,
            d: self.c * parent.b + self.d * parent.d,
            tx: self.tx * parent.a + self.ty * parent.c + parent.tx,
            ty: self.tx * parent.b + self.ty * parent.d + parent.ty,
        }
    }

    pub fn apply(&self, point: Point) -> Point {
        Point {
            x: self.a * point.x + self.c * point.y + self.tx,
            y: self.b * point.x + self.d * point.y + self.ty,
        }
    }

    /// Maps a world point back into this transform's local space.
    ///
    /// A singular matrix maps every point to the origin instead of producing NaN.
    pub fn apply_inverse(&self, point: Point) -> Point {
        let determinant = self.a * self.d - self.b * self.c;
        if determinant == 0.0 || !determinant.is_finite() {
            return Point::ZERO;
        }
        let inv = 1.0 / determinant;
        let x = point.x - self.tx;
        let y = point.y - self.ty;
        Point {
            x: (self.d * x - self.c * y) * inv,
            y: (self.a * y - self.b * x) * inv,
        }
    }

    pub fn is_axis_aligned(&self) -> bool {
        self.b == 0.0 && self.c == 0.0
    }

    pub fn approx_eq(&self, other: &Matrix, epsilon: f32) -> bool {
        (self.a - other.a).abs() <= epsilon
            && (self.b - other.b).abs() <= epsilon
            && (self.c - other.c).abs() <= epsilon
            && (self.d - other.d).abs() <= epsilon
            && (self.tx - other.tx).abs() <= epsilon
            && (self.ty - other.ty).abs() <= epsilon
    }
}

/// An axis-aligned rectangle.
///
/// [`Rectangle::EMPTY`] is the identity for [`Rectangle::union`], so bounds of
/// empty subtrees can be merged without special-casing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rectangle {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rectangle {
    pub const EMPTY: Self = Self {
        x: 0.0,
        y: 0.0,
        width: 0.0,
        height: 0.0,
    };

    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_min_max(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// True for zero or negative area. NaN rectangles are not empty; check
    /// [`Rectangle::is_nan`] separately.
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn is_nan(&self) -> bool {
        self.x.is_nan() || self.y.is_nan() || self.width.is_nan() || self.height.is_nan()
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn union(&self, other: &Rectangle) -> Rectangle {
        if other.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *other;
        }
        Rectangle::from_min_max(
            self.x.min(other.x),
            self.y.min(other.y),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Returns the overlapping region, or [`Rectangle::EMPTY`] when they do not overlap.
    pub fn intersection(&self, other: &Rectangle) -> Rectangle {
        let min_x = self.x.max(other.x);
        let min_y = self.y.max(other.y);
        let max_x = self.right().min(other.right());
        let max_y = self.bottom().min(other.bottom());
        if max_x <= min_x || max_y <= min_y {
            return Rectangle::EMPTY;
        }
        Rectangle::from_min_max(min_x, min_y, max_x, max_y)
    }

    pub fn pad(&self, padding: f32) -> Rectangle {
        Rectangle::new(
            self.x - padding,
            self.y - padding,
            self.width + padding * 2.0,
            self.height + padding * 2.0,
        )
    }

    /// Snaps outward to whole pixels.
    pub fn round_out(&self) -> Rectangle {
        Rectangle::from_min_max(
            self.x.floor(),
            self.y.floor(),
            self.right().ceil(),
            self.bottom().ceil(),
        )
    }

    /// Transforms the four corners and returns their axis-aligned bounds.
    pub fn transformed(&self, matrix: &Matrix) -> Rectangle {
        let corners = [
            matrix.apply(Point::new(self.x, self.y)),
            matrix.apply(Point::new(self.right(), self.y)),
            matrix.apply(Point::new(self.right(), self.bottom())),
            matrix.apply(Point::new(self.x, self.bottom())),
        ];
        bounds_of_points(&corners)
    }
}

/// Axis-aligned bounds of a point set. NaN coordinates propagate into the result.
pub(crate) fn bounds_of_points(points: &[Point]) -> Rectangle {
    let Some(first) = points.first() else {
        return Rectangle::EMPTY;
    };
    let mut min_x = first.x;
    let mut min_y = first.y;
    let mut max_x = first.x;
    let mut max_y = first.y;
    let mut saw_nan = first.x.is_nan() || first.y.is_nan();
    for point in &points[1..] {
        saw_nan |= point.x.is_nan() || point.y.is_nan();
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    if saw_nan {
        return Rectangle::new(f32::NAN, f32::NAN, f32::NAN, f32::NAN);
    }
    Rectangle::from_min_max(min_x, min_y, max_x, max_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn then_applies_child_before_parent() {
        let child = Matrix::translation(5.0, 0.0);
        let parent = Matrix::rotation(std::f32::consts::FRAC_PI_2);
        let world = child.then(&parent);
        let p = world.apply(Point::ZERO);
        assert!((p.x - 0.0).abs() < 1e-5);
        assert!((p.y - 5.0).abs() < 1e-5);
    }

    #[test]
    fn inverse_round_trips() {
        let m = Matrix::new(2.0, 0.5, -0.25, 3.0, 10.0, -4.0);
        let p = Point::new(7.0, -2.0);
        let back = m.apply_inverse(m.apply(p));
        assert!((back.x - p.x).abs() < 1e-4);
        assert!((back.y - p.y).abs() < 1e-4);
    }

    #[test]
    fn singular_inverse_is_origin() {
        let m = Matrix::scale(0.0, 1.0);
        assert_eq!(m.apply_inverse(Point::new(3.0, 3.0)), Point::ZERO);
    }

    #[test]
    fn union_with_empty_is_noop() {
        let r = Rectangle::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(r.union(&Rectangle::EMPTY), r);
        assert_eq!(Rectangle::EMPTY.union(&r), r);
        assert_eq!(Rectangle::EMPTY.union(&Rectangle::EMPTY), Rectangle::EMPTY);
    }

    #[test]
    fn union_covers_both() {
        let a = Rectangle::new(0.0, 0.0, 10.0, 10.0);
        let b = Rectangle::new(5.0, -5.0, 20.0, 5.0);
        assert_eq!(a.union(&b), Rectangle::new(0.0, -5.0, 25.0, 15.0));
    }

    #[test]
    fn disjoint_intersection_is_empty() {
        let a = Rectangle::new(0.0, 0.0, 10.0, 10.0);
        let b = Rectangle::new(20.0, 20.0, 5.0, 5.0);
        assert_eq!(a.intersection(&b), Rectangle::EMPTY);
        assert_eq!(
            a.intersection(&Rectangle::new(5.0, 5.0, 10.0, 10.0)),
            Rectangle::new(5.0, 5.0, 5.0, 5.0)
        );
    }

    #[test]
    fn nan_points_produce_nan_bounds() {
        let bounds = bounds_of_points(&[Point::new(0.0, 0.0), Point::new(f32::NAN, 1.0)]);
        assert!(bounds.is_nan());
    }
}
