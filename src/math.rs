// src/math.rs
//! Small math layer on top of `glam`.
//!
//! - `Real` scalar alias and tolerance constants.
//! - `Aabb` with pose transform, sweep expansion and overlap tests.
//! - Exponential-map orientation integration.

use serde::{Deserialize, Serialize};

pub use glam::{Mat3, Quat, Vec3};

/// Scalar type used throughout the simulation.
pub type Real = f32;

/// Generic tolerance for degenerate lengths and determinants.
pub const EPSILON: Real = 1e-6;

/// Below this angular speed the Taylor expansion of `sin(x)/x` is used.
const SMALL_ANGLE: Real = 0.001;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    /// Inverted box that grows correctly under `merge`.
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(Real::MAX),
        max: Vec3::splat(-Real::MAX),
    };

    #[inline(always)]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    #[inline(always)]
    pub fn from_half_extents(half_extents: Vec3) -> Self {
        let h = half_extents.abs();
        Self { min: -h, max: h }
    }

    #[inline(always)]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline(always)]
    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    #[inline(always)]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    #[inline(always)]
    pub fn contains_point(&self, p: Vec3) -> bool {
        self.min.cmple(p).all() && p.cmple(self.max).all()
    }

    #[inline]
    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grows the box in the direction of `delta` only.
    #[inline]
    pub fn sweep(&self, delta: Vec3) -> Aabb {
        Aabb {
            min: self.min + delta.min(Vec3::ZERO),
            max: self.max + delta.max(Vec3::ZERO),
        }
    }

    #[inline]
    pub fn inflate(&self, margin: Real) -> Aabb {
        Aabb {
            min: self.min - Vec3::splat(margin),
            max: self.max + Vec3::splat(margin),
        }
    }

    /// World box enclosing this body-space box after rotation and translation.
    pub fn transform(&self, position: Vec3, orientation: &Mat3) -> Aabb {
        if self.is_empty() {
            return Aabb::new(position, position);
        }
        let abs = Mat3::from_cols(
            orientation.x_axis.abs(),
            orientation.y_axis.abs(),
            orientation.z_axis.abs(),
        );
        let center = position + *orientation * self.center();
        let extent = abs * self.half_extents();
        Aabb {
            min: center - extent,
            max: center + extent,
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(b.x, b.y, b.z),
            Vec3::new(a.x, b.y, b.z),
        ]
    }
}

/// Advances `orientation` by angular velocity `omega` over `dt` using the exponential map.
pub fn integrate_orientation(orientation: &Mat3, omega: Vec3, dt: Real) -> Mat3 {
    let angle = omega.length();
    if angle <= Real::EPSILON {
        return *orientation;
    }

    let axis = if angle < SMALL_ANGLE {
        // sin(x)/x ~ 1 - x^2/6
        omega * (0.5 * dt - (dt * dt * dt) * 0.020_833_333 * angle * angle)
    } else {
        omega * ((0.5 * angle * dt).sin() / angle)
    };

    let dq = Quat::from_xyzw(axis.x, axis.y, axis.z, (angle * dt * 0.5).cos());
    let q = Quat::from_mat3(orientation);
    Mat3::from_quat((dq * q).normalize())
}

/// Inverse of `m`, or `None` when it is singular.
#[inline]
pub fn try_inverse(m: &Mat3) -> Option<Mat3> {
    let det = m.determinant();
    if !det.is_finite() || det.abs() < EPSILON {
        None
    } else {
        Some(m.inverse())
    }
}

/// Any unit vector perpendicular to `n`.
pub fn any_perpendicular(n: Vec3) -> Vec3 {
    n.any_orthonormal_vector()
}
