// src/constraint.rs
//! Non-contact constraints.
//!
//! Constraints are solved together with the contacts of their island and take
//! part in island connectivity exactly like arbiters do.

use crate::body::BodyId;
use crate::math::{Real, Vec3, EPSILON};
use crate::solver::SolverBody;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONSTRAINT_ID: AtomicU64 = AtomicU64::new(1);

/// Fresh process-unique constraint id.
pub fn next_constraint_id() -> u64 {
    NEXT_CONSTRAINT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A velocity-level constraint between two bodies.
pub trait Constraint: Send {
    fn id(&self) -> u64;

    fn bodies(&self) -> (BodyId, BodyId);

    /// Called once per step before the iterations. Applies the warm start.
    fn prepare_for_iteration(&mut self, b1: &mut SolverBody, b2: &mut SolverBody, dt: Real);

    fn iterate(&mut self, b1: &mut SolverBody, b2: &mut SolverBody);
}

/// Keeps two body-local anchor points at a fixed distance.
#[derive(Debug, Clone)]
pub struct DistanceConstraint {
    id: u64,
    body1: BodyId,
    body2: BodyId,
    local_anchor1: Vec3,
    local_anchor2: Vec3,
    distance: Real,
    /// Positional error correction factor.
    pub bias_factor: Real,
    /// Constraint force mixing; 0 is rigid.
    pub softness: Real,

    r1: Vec3,
    r2: Vec3,
    axis: Vec3,
    effective_mass: Real,
    bias: Real,
    softness_over_dt: Real,
    accumulated_impulse: Real,
}

impl DistanceConstraint {
    /// Anchors are given relative to each body's center, in body space.
    pub fn new(body1: BodyId, body2: BodyId, local_anchor1: Vec3, local_anchor2: Vec3, distance: Real) -> Self {
        Self {
            id: next_constraint_id(),
            body1,
            body2,
            local_anchor1,
            local_anchor2,
            distance: distance.max(0.0),
            bias_factor: 0.1,
            softness: 0.01,
            r1: Vec3::ZERO,
            r2: Vec3::ZERO,
            axis: Vec3::ZERO,
            effective_mass: 0.0,
            bias: 0.0,
            softness_over_dt: 0.0,
            accumulated_impulse: 0.0,
        }
    }

    pub fn distance(&self) -> Real {
        self.distance
    }

    pub fn set_distance(&mut self, distance: Real) {
        self.distance = distance.max(0.0);
    }

    pub fn accumulated_impulse(&self) -> Real {
        self.accumulated_impulse
    }

    #[inline(always)]
    fn apply(&self, b1: &mut SolverBody, b2: &mut SolverBody, lambda: Real) {
        let impulse = self.axis * lambda;
        if !b1.body_type.is_static() {
            b1.apply_impulse_at(-impulse, self.r1);
        }
        if !b2.body_type.is_static() {
            b2.apply_impulse_at(impulse, self.r2);
        }
    }

    #[inline(always)]
    fn angular_term(body: &SolverBody, r: Vec3, axis: Vec3) -> Real {
        if body.body_type.is_static() {
            return 0.0;
        }
        let mut k = body.inv_mass;
        if !body.angular_locked {
            let rn = r.cross(axis);
            k += rn.dot(body.inv_inertia_world * rn);
        }
        k
    }
}

impl Constraint for DistanceConstraint {
    fn id(&self) -> u64 {
        self.id
    }

    fn bodies(&self) -> (BodyId, BodyId) {
        (self.body1, self.body2)
    }

    fn prepare_for_iteration(&mut self, b1: &mut SolverBody, b2: &mut SolverBody, dt: Real) {
        self.r1 = b1.orientation * self.local_anchor1;
        self.r2 = b2.orientation * self.local_anchor2;

        let delta = (b2.position + self.r2) - (b1.position + self.r1);
        let length = delta.length();
        self.axis = if length > EPSILON { delta / length } else { Vec3::Y };

        let k = Self::angular_term(b1, self.r1, self.axis)
            + Self::angular_term(b2, self.r2, self.axis)
            + self.softness / dt;
        self.effective_mass = if k > EPSILON { 1.0 / k } else { 0.0 };
        self.softness_over_dt = self.softness / dt;
        self.bias = (length - self.distance) * self.bias_factor / dt;

        self.apply(b1, b2, self.accumulated_impulse);
    }

    fn iterate(&mut self, b1: &mut SolverBody, b2: &mut SolverBody) {
        let v1 = b1.linear_velocity + b1.angular_velocity.cross(self.r1);
        let v2 = b2.linear_velocity + b2.angular_velocity.cross(self.r2);
        let jv = (v2 - v1).dot(self.axis);

        let lambda = -self.effective_mass
            * (jv + self.bias + self.accumulated_impulse * self.softness_over_dt);
        self.accumulated_impulse += lambda;
        self.apply(b1, b2, lambda);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::RigidBody;

    #[test]
    fn test_ids_unique() {
        let a = DistanceConstraint::new(RigidBody::dynamic().id(), RigidBody::dynamic().id(), Vec3::ZERO, Vec3::ZERO, 1.0);
        let b = DistanceConstraint::new(a.body1, a.body2, Vec3::ZERO, Vec3::ZERO, 1.0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_removes_separating_velocity() {
        let anchor = RigidBody::static_body();
        let bob = RigidBody::dynamic().with_position(Vec3::new(0.0, -1.0, 0.0));
        let mut c = DistanceConstraint::new(anchor.id(), bob.id(), Vec3::ZERO, Vec3::ZERO, 1.0);
        c.softness = 0.0;

        let mut s1 = SolverBody::from_body(&anchor);
        let mut s2 = SolverBody::from_body(&bob);
        s2.linear_velocity = Vec3::new(1.0, -3.0, 0.0);

        c.prepare_for_iteration(&mut s1, &mut s2, 1.0 / 60.0);
        for _ in 0..10 {
            c.iterate(&mut s1, &mut s2);
        }
        // radial component gone, tangential kept
        assert!(s2.linear_velocity.y.abs() < 1e-4);
        assert!((s2.linear_velocity.x - 1.0).abs() < 1e-4);
        assert_eq!(s1.linear_velocity, Vec3::ZERO);
    }
}
