use crate::math::{Matrix, Point};
use std::f32::consts::TAU;

/// Local transform properties plus the cached rotation terms.
///
/// `sin`/`cos` are recomputed only when `rotation` differs from the value they
/// were last computed for. The comparison is exact, so assigning the same
/// angle every frame costs nothing.
#[derive(Debug, Clone)]
pub struct Transform {
    pub position: Point,
    pub scale: Point,
    pub pivot: Point,
    /// Radians.
    pub rotation: f32,
    rotation_cache: f32,
    sin: f32,
    cos: f32,
    trig_evaluations: u64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Point::ZERO,
            scale: Point::new(1.0, 1.0),
            pivot: Point::ZERO,
            rotation: 0.0,
            rotation_cache: 0.0,
            sin: 0.0,
            cos: 1.0,
            trig_evaluations: 0,
        }
    }
}

impl Transform {
    /// How many times `sin`/`cos` have been evaluated for this transform.
    pub fn trig_evaluations(&self) -> u64 {
        self.trig_evaluations
    }

    /// The local matrix, refreshing the rotation cache if needed.
    pub fn local_matrix(&mut self) -> Matrix {
        let (sx, sy) = (self.scale.x, self.scale.y);
        if self.rotation % TAU != 0.0 {
            self.refresh_rotation();
            let a = self.cos * sx;
            let b = self.sin * sx;
            let c = -self.sin * sy;
            let d = self.cos * sy;
            let mut tx = self.position.x;
            let mut ty = self.position.y;
            if self.pivot.x != 0.0 || self.pivot.y != 0.0 {
                tx -= self.pivot.x * a + self.pivot.y * c;
                ty -= self.pivot.x * b + self.pivot.y * d;
            }
            Matrix::new(a, b, c, d, tx, ty)
        } else {
            Matrix::new(
                sx,
                0.0,
                0.0,
                sy,
                self.position.x - self.pivot.x * sx,
                self.position.y - self.pivot.y * sy,
            )
        }
    }

    /// Composes this transform under `parent` into a world matrix.
    ///
    /// Equivalent to `self.local_matrix().then(parent)`, with the
    /// rotation-free case reduced to a handful of multiply-adds.
    pub fn world_matrix(&mut self, parent: &Matrix) -> Matrix {
        if self.rotation % TAU != 0.0 {
            return self.local_matrix().then(parent);
        }
        let (sx, sy) = (self.scale.x, self.scale.y);
        let tx = self.position.x - self.pivot.x * sx;
        let ty = self.position.y - self.pivot.y * sy;
        Matrix {
            a: sx * parent.a,
            b: sx * parent.b,
            c: sy * parent.c,
            d: sy * parent.d,
            tx: tx * parent.a + ty * parent.c + parent.tx,
            ty: tx * parent.b + ty * parent.d + parent.ty,
        }
    }

    fn refresh_rotation(&mut self) {
        // NaN never equals itself, so a NaN rotation recomputes and propagates.
        if self.rotation != self.rotation_cache {
            self.rotation_cache = self.rotation;
            let (sin, cos) = self.rotation.sin_cos();
            self.sin = sin;
            self.cos = cos;
            self.trig_evaluations += 1;
        }
    }
}

/// Anything positioned by a [`Transform`] inside a parent's space.
pub trait Transformable {
    fn transform(&self) -> &Transform;

    fn transform_mut(&mut self) -> &mut Transform;

    /// Result of the most recent transform pass.
    fn world_transform(&self) -> &Matrix;

    fn world_alpha(&self) -> f32;

    fn set_position(&mut self, x: f32, y: f32) {
        self.transform_mut().position.set(x, y);
    }

    fn set_scale(&mut self, x: f32, y: f32) {
        self.transform_mut().scale.set(x, y);
    }

    fn set_pivot(&mut self, x: f32, y: f32) {
        self.transform_mut().pivot.set(x, y);
    }

    fn set_rotation(&mut self, radians: f32) {
        self.transform_mut().rotation = radians;
    }

    /// Maps a local point into world space.
    fn to_global(&self, point: Point) -> Point {
        self.world_transform().apply(point)
    }

    /// Maps a world point into local space.
    fn to_local(&self, point: Point) -> Point {
        self.world_transform().apply_inverse(point)
    }
}
