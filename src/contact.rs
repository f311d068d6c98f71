// src/contact.rs
//! One persistent manifold point and its sequential-impulse state.
//!
//! The normal always points from body 1 to body 2 and the penetration is
//! `(p1 - p2) · n`, positive when the bodies overlap. Accumulated impulses
//! survive across steps and are rescaled when the timestep changes.

use crate::body::RigidBody;
use crate::config::ContactSettings;
use crate::material::MixedCoefficients;
use crate::math::{Real, Vec3, EPSILON};
use crate::solver::SolverBody;

/// Index of the mesh triangle a contact originated from.
pub type TriangleId = u32;

/// Closing speed above which restitution is applied to a new contact.
const RESTITUTION_THRESHOLD: Real = 1.0;

#[derive(Debug, Clone)]
pub struct Contact {
    pub(crate) p1: Vec3,
    pub(crate) p2: Vec3,
    pub(crate) normal: Vec3,
    pub(crate) tangent: Vec3,

    /// Offsets from the body centers, world rotated.
    pub(crate) relative_pos1: Vec3,
    pub(crate) relative_pos2: Vec3,
    /// Offsets from the body centers, body frame.
    pub(crate) real_relative_pos1: Vec3,
    pub(crate) real_relative_pos2: Vec3,

    pub(crate) penetration: Real,
    pub(crate) initial_penetration: Real,
    pub(crate) triangle: Option<TriangleId>,

    pub(crate) accumulated_normal_impulse: Real,
    pub(crate) accumulated_tangent_impulse: Real,
    mass_normal: Real,
    mass_tangent: Real,

    restitution_bias: Real,
    speculative_velocity: Real,
    lost_speculative_bounce: Real,

    pub(crate) new_contact: bool,
    static_friction: Real,
    dynamic_friction: Real,
    restitution: Real,
    friction: Real,

    treat_body1_as_static: bool,
    treat_body2_as_static: bool,
    last_dt: Real,
}

impl Contact {
    /// Fresh contact with zero impulses.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        body1: &RigidBody,
        body2: &RigidBody,
        point1: Vec3,
        point2: Vec3,
        normal: Vec3,
        penetration: Real,
        triangle: Option<TriangleId>,
        coefficients: MixedCoefficients,
    ) -> Self {
        let mut contact = Self {
            p1: point1,
            p2: point2,
            normal,
            tangent: Vec3::ZERO,
            relative_pos1: Vec3::ZERO,
            relative_pos2: Vec3::ZERO,
            real_relative_pos1: Vec3::ZERO,
            real_relative_pos2: Vec3::ZERO,
            penetration,
            initial_penetration: penetration,
            triangle,
            accumulated_normal_impulse: 0.0,
            accumulated_tangent_impulse: 0.0,
            mass_normal: 0.0,
            mass_tangent: 0.0,
            restitution_bias: 0.0,
            speculative_velocity: 0.0,
            lost_speculative_bounce: 0.0,
            new_contact: true,
            static_friction: coefficients.static_friction,
            dynamic_friction: coefficients.dynamic_friction,
            restitution: coefficients.restitution,
            friction: coefficients.static_friction,
            treat_body1_as_static: body1.body_type().immovable_against(body2.body_type()),
            treat_body2_as_static: body2.body_type().immovable_against(body1.body_type()),
            last_dt: Real::INFINITY,
        };
        contact.set_geometry(body1, body2, point1, point2, normal, penetration, triangle);
        contact
    }

    /// Refreshes the geometry of a cached point and keeps its impulses.
    #[allow(clippy::too_many_arguments)]
    pub fn refresh(
        &mut self,
        body1: &RigidBody,
        body2: &RigidBody,
        point1: Vec3,
        point2: Vec3,
        normal: Vec3,
        penetration: Real,
        triangle: Option<TriangleId>,
    ) {
        self.new_contact = false;
        self.set_geometry(body1, body2, point1, point2, normal, penetration, triangle);
    }

    #[allow(clippy::too_many_arguments)]
    fn set_geometry(
        &mut self,
        body1: &RigidBody,
        body2: &RigidBody,
        point1: Vec3,
        point2: Vec3,
        normal: Vec3,
        penetration: Real,
        triangle: Option<TriangleId>,
    ) {
        self.normal = normal.normalize_or_zero();
        self.p1 = point1;
        self.p2 = point2;
        self.relative_pos1 = point1 - body1.position();
        self.relative_pos2 = point2 - body2.position();
        self.real_relative_pos1 = body1.orientation().transpose() * self.relative_pos1;
        self.real_relative_pos2 = body2.orientation().transpose() * self.relative_pos2;
        self.penetration = penetration;
        self.initial_penetration = penetration;
        self.triangle = triangle;
    }

    // ---- read-back ---------------------------------------------------------

    pub fn point1(&self) -> Vec3 {
        self.p1
    }

    pub fn point2(&self) -> Vec3 {
        self.p2
    }

    pub fn normal(&self) -> Vec3 {
        self.normal
    }

    pub fn tangent(&self) -> Vec3 {
        self.tangent
    }

    pub fn penetration(&self) -> Real {
        self.penetration
    }

    pub fn initial_penetration(&self) -> Real {
        self.initial_penetration
    }

    pub fn triangle(&self) -> Option<TriangleId> {
        self.triangle
    }

    pub fn relative_position1(&self) -> Vec3 {
        self.relative_pos1
    }

    pub fn relative_position2(&self) -> Vec3 {
        self.relative_pos2
    }

    pub fn accumulated_normal_impulse(&self) -> Real {
        self.accumulated_normal_impulse
    }

    pub fn accumulated_tangent_impulse(&self) -> Real {
        self.accumulated_tangent_impulse
    }

    pub fn is_new(&self) -> bool {
        self.new_contact
    }

    /// Friction coefficient picked for the current step.
    pub fn friction(&self) -> Real {
        self.friction
    }

    pub fn restitution(&self) -> Real {
        self.restitution
    }

    // ---- solver ------------------------------------------------------------

    /// Moves the contact points with the bodies and recomputes the penetration.
    pub fn update_position(&mut self, body1: &RigidBody, body2: &RigidBody) {
        self.relative_pos1 = body1.orientation() * self.real_relative_pos1;
        self.relative_pos2 = body2.orientation() * self.real_relative_pos2;
        self.p1 = body1.position() + self.relative_pos1;
        self.p2 = body2.position() + self.relative_pos2;
        self.penetration = (self.p1 - self.p2).dot(self.normal);
    }

    /// True when the cached point drifted too far and should be dropped.
    pub fn is_broken(&self, break_threshold: Real) -> bool {
        if self.penetration < -break_threshold {
            return true;
        }
        let diff = self.p1 - self.p2;
        let drift = diff - self.normal * diff.dot(self.normal);
        drift.length_squared() > break_threshold * break_threshold * 100.0
    }

    #[inline(always)]
    fn relative_velocity(&self, b1: &SolverBody, b2: &SolverBody) -> Vec3 {
        b2.linear_velocity + b2.angular_velocity.cross(self.relative_pos2)
            - b1.linear_velocity
            - b1.angular_velocity.cross(self.relative_pos1)
    }

    #[inline(always)]
    fn effective_mass(&self, b1: &SolverBody, b2: &SolverBody, dir: Vec3) -> Real {
        let mut k = 0.0;
        if !self.treat_body1_as_static {
            k += b1.inv_mass;
            if !b1.angular_locked {
                k += (b1.inv_inertia_world * self.relative_pos1.cross(dir))
                    .cross(self.relative_pos1)
                    .dot(dir);
            }
        }
        if !self.treat_body2_as_static {
            k += b2.inv_mass;
            if !b2.angular_locked {
                k += (b2.inv_inertia_world * self.relative_pos2.cross(dir))
                    .cross(self.relative_pos2)
                    .dot(dir);
            }
        }
        if k > EPSILON {
            1.0 / k
        } else {
            0.0
        }
    }

    /// Computes effective masses and biases, then applies the warm start.
    pub fn prepare_for_iteration(
        &mut self,
        b1: &mut SolverBody,
        b2: &mut SolverBody,
        dt: Real,
        settings: &ContactSettings,
    ) {
        self.treat_body1_as_static = b1.body_type.immovable_against(b2.body_type);
        self.treat_body2_as_static = b2.body_type.immovable_against(b1.body_type);

        let dv = self.relative_velocity(b1, b2);

        self.mass_normal = self.effective_mass(b1, b2, self.normal);

        let rel_normal_vel = dv.dot(self.normal);
        let tangential = dv - self.normal * rel_normal_vel;
        let len_sq = tangential.length_squared();
        self.tangent = if len_sq > 0.0 {
            tangential / len_sq.sqrt()
        } else {
            Vec3::ZERO
        };
        self.mass_tangent = if self.tangent == Vec3::ZERO {
            0.0
        } else {
            self.effective_mass(b1, b2, self.tangent)
        };

        self.restitution_bias = self.lost_speculative_bounce;
        self.speculative_velocity = 0.0;

        if self.penetration > settings.allowed_penetration {
            self.restitution_bias = (settings.bias_factor / dt
                * (self.penetration - settings.allowed_penetration).max(0.0))
            .clamp(0.0, settings.maximum_bias);
        }

        let ratio = dt / self.last_dt;
        self.accumulated_normal_impulse *= ratio;
        self.accumulated_tangent_impulse *= ratio;

        // Predict whether the tangent impulse breaks the static friction cone.
        let predicted = self.mass_tangent * -self.tangent.dot(dv);
        self.friction = if predicted < -self.static_friction * self.accumulated_normal_impulse {
            self.dynamic_friction
        } else {
            self.static_friction
        };

        if self.new_contact && rel_normal_vel < -RESTITUTION_THRESHOLD {
            self.restitution_bias = self.restitution_bias.max(-self.restitution * rel_normal_vel);
        }

        // Not touching yet: only remove the approaching velocity that would
        // close the gap this step and keep the bounce for when it does.
        if self.penetration < -settings.allowed_penetration {
            self.speculative_velocity = self.penetration / dt;
            self.lost_speculative_bounce = self.restitution_bias;
            self.restitution_bias = 0.0;
        } else {
            self.lost_speculative_bounce = 0.0;
        }

        let impulse = self.normal * self.accumulated_normal_impulse
            + self.tangent * self.accumulated_tangent_impulse;
        self.apply_impulse(b1, b2, impulse);

        self.last_dt = dt;
        self.new_contact = false;
    }

    /// One projected Gauss-Seidel pass over this point.
    pub fn iterate(&mut self, b1: &mut SolverBody, b2: &mut SolverBody, settings: &ContactSettings) {
        if self.treat_body1_as_static && self.treat_body2_as_static {
            return;
        }

        let dv = self.relative_velocity(b1, b2);
        if dv.length_squared() < settings.minimum_velocity * settings.minimum_velocity {
            return;
        }

        let vn = dv.dot(self.normal);
        let mut normal_impulse =
            self.mass_normal * (-vn + self.restitution_bias + self.speculative_velocity);
        let old_normal = self.accumulated_normal_impulse;
        self.accumulated_normal_impulse = (old_normal + normal_impulse).max(0.0);
        normal_impulse = self.accumulated_normal_impulse - old_normal;

        let vt = dv.dot(self.tangent);
        let max_tangent = self.friction * self.accumulated_normal_impulse;
        let old_tangent = self.accumulated_tangent_impulse;
        self.accumulated_tangent_impulse =
            (old_tangent + self.mass_tangent * -vt).clamp(-max_tangent, max_tangent);
        let tangent_impulse = self.accumulated_tangent_impulse - old_tangent;

        let impulse = self.normal * normal_impulse + self.tangent * tangent_impulse;
        self.apply_impulse(b1, b2, impulse);
    }

    #[inline(always)]
    fn apply_impulse(&self, b1: &mut SolverBody, b2: &mut SolverBody, impulse: Vec3) {
        if !self.treat_body1_as_static {
            b1.apply_impulse_at(-impulse, self.relative_pos1);
        }
        if !self.treat_body2_as_static {
            b2.apply_impulse_at(impulse, self.relative_pos2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{Material, MaterialCoefficientMixing};

    fn coefficients() -> MixedCoefficients {
        MaterialCoefficientMixing::TakeMaximum.mix(&Material::default(), &Material::default())
    }

    fn pair() -> (RigidBody, RigidBody) {
        let ground = RigidBody::static_body();
        let block = RigidBody::dynamic().with_position(Vec3::new(0.0, 1.0, 0.0));
        (ground, block)
    }

    #[test]
    fn test_update_position_follows_body() {
        let (ground, mut block) = pair();
        let mut c = Contact::new(
            &ground,
            &block,
            Vec3::new(0.0, 0.55, 0.0),
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::Y,
            0.05,
            None,
            coefficients(),
        );
        block.set_position(Vec3::new(0.0, 1.2, 0.0));
        c.update_position(&ground, &block);
        assert!((c.penetration() - (-0.15)).abs() < 1e-5);
        assert!(!c.is_broken(0.2));
        assert!(c.is_broken(0.1));
    }

    #[test]
    fn test_tangential_drift_breaks_contact() {
        let (ground, mut block) = pair();
        let mut c = Contact::new(
            &ground,
            &block,
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::Y,
            0.0,
            None,
            coefficients(),
        );
        block.set_position(Vec3::new(0.05, 1.0, 0.0));
        c.update_position(&ground, &block);
        // drift^2 = 0.0025, limit is 0.01^2 * 100
        assert!(!c.is_broken(0.01));
        block.set_position(Vec3::new(0.2, 1.0, 0.0));
        c.update_position(&ground, &block);
        assert!(c.is_broken(0.01));
    }

    #[test]
    fn test_iterate_stops_approach() {
        let (ground, block) = pair();
        let mut c = Contact::new(
            &ground,
            &block,
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::Y,
            0.0,
            None,
            coefficients(),
        );
        let settings = ContactSettings::default();
        let mut s1 = SolverBody::from_body(&ground);
        let mut s2 = SolverBody::from_body(&block);
        s2.linear_velocity = Vec3::new(0.0, -0.5, 0.0);

        c.prepare_for_iteration(&mut s1, &mut s2, 1.0 / 60.0, &settings);
        for _ in 0..10 {
            c.iterate(&mut s1, &mut s2, &settings);
        }
        assert!(s2.linear_velocity.y.abs() < 1e-3);
        assert_eq!(s1.linear_velocity, Vec3::ZERO);
        assert!(c.accumulated_normal_impulse() > 0.0);
        assert!(s2.needs_resolution);
    }

    #[test]
    fn test_warm_start_rescaled_by_timestep_ratio() {
        let (ground, block) = pair();
        let mut c = Contact::new(
            &ground,
            &block,
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::Y,
            0.0,
            None,
            coefficients(),
        );
        let settings = ContactSettings::default();
        let mut s1 = SolverBody::from_body(&ground);
        let mut s2 = SolverBody::from_body(&block);

        c.prepare_for_iteration(&mut s1, &mut s2, 0.02, &settings);
        c.accumulated_normal_impulse = 1.0;
        s2.linear_velocity = Vec3::ZERO;
        c.prepare_for_iteration(&mut s1, &mut s2, 0.01, &settings);
        assert!((c.accumulated_normal_impulse() - 0.5).abs() < 1e-6);
        // warm start pushed the dynamic body along the normal
        assert!((s2.linear_velocity.y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_speculative_contact_defers_bounce() {
        let (ground, block) = pair();
        let bouncy = MaterialCoefficientMixing::TakeMaximum.mix(&Material::bouncy(), &Material::default());
        let mut c = Contact::new(
            &ground,
            &block,
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::new(0.0, 0.6, 0.0),
            Vec3::Y,
            -0.1,
            None,
            bouncy,
        );
        let settings = ContactSettings::default();
        let mut s1 = SolverBody::from_body(&ground);
        let mut s2 = SolverBody::from_body(&block);
        s2.linear_velocity = Vec3::new(0.0, -12.0, 0.0);

        let dt = 1.0 / 60.0;
        c.prepare_for_iteration(&mut s1, &mut s2, dt, &settings);
        assert!(c.lost_speculative_bounce > 0.0);
        assert_eq!(c.restitution_bias, 0.0);
        for _ in 0..10 {
            c.iterate(&mut s1, &mut s2, &settings);
        }
        // velocity clamped to exactly close the gap this step
        assert!((s2.linear_velocity.y - (-0.1 / dt)).abs() < 1e-3);
    }

    fn friction_after_slip(slip: Real, accumulated_normal: Real) -> Real {
        let (ground, block) = pair();
        let mut c = Contact::new(
            &ground,
            &block,
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::Y,
            0.0,
            None,
            coefficients(),
        );
        let settings = ContactSettings::default();
        let dt = 1.0 / 60.0;
        let mut s1 = SolverBody::from_body(&ground);
        let mut s2 = SolverBody::from_body(&block);
        c.prepare_for_iteration(&mut s1, &mut s2, dt, &settings);

        // Same dt again so the warm-start ratio is 1.
        c.accumulated_normal_impulse = accumulated_normal;
        s2.linear_velocity = Vec3::new(slip, 0.0, 0.0);
        s2.angular_velocity = Vec3::ZERO;
        c.prepare_for_iteration(&mut s1, &mut s2, dt, &settings);
        c.friction()
    }

    #[test]
    fn test_friction_selection() {
        let mixed = coefficients();
        assert!(mixed.dynamic_friction < mixed.static_friction);

        // Fast slide against a light normal load leaves the static cone.
        assert_eq!(friction_after_slip(5.0, 0.1), mixed.dynamic_friction);
        // Creeping contact stays stuck.
        assert_eq!(friction_after_slip(0.001, 0.1), mixed.static_friction);
        assert_eq!(friction_after_slip(0.0, 0.1), mixed.static_friction);
    }

    #[test]
    fn test_less_movable_body_keeps_its_velocity() {
        for (carrier, rider) in [
            (RigidBody::kinematic(), RigidBody::dynamic()),
            (RigidBody::pseudo_static(), RigidBody::dynamic()),
            (RigidBody::pseudo_static(), RigidBody::kinematic()),
        ] {
            let rider = rider.with_position(Vec3::new(0.0, 1.0, 0.0));
            let mut c = Contact::new(
                &carrier,
                &rider,
                Vec3::new(0.0, 0.5, 0.0),
                Vec3::new(0.0, 0.5, 0.0),
                Vec3::Y,
                0.0,
                None,
                coefficients(),
            );
            let settings = ContactSettings::default();
            let mut s1 = SolverBody::from_body(&carrier);
            let mut s2 = SolverBody::from_body(&rider);
            // Carrier moves up into the resting rider.
            let lift = Vec3::new(0.0, 1.0, 0.0);
            s1.linear_velocity = lift;

            c.prepare_for_iteration(&mut s1, &mut s2, 1.0 / 60.0, &settings);
            for _ in 0..10 {
                c.iterate(&mut s1, &mut s2, &settings);
            }
            assert_eq!(s1.linear_velocity, lift);
            assert_eq!(s1.angular_velocity, Vec3::ZERO);
            assert!(!s1.needs_resolution);
            assert!((s2.linear_velocity.y - 1.0).abs() < 1e-3);
            assert!(s2.needs_resolution);
        }
    }

    #[test]
    fn test_static_pair_is_skipped() {
        let a = RigidBody::static_body();
        let b = RigidBody::static_body();
        let mut c = Contact::new(&a, &b, Vec3::ZERO, Vec3::ZERO, Vec3::Y, 0.1, None, coefficients());
        let settings = ContactSettings::default();
        let mut s1 = SolverBody::from_body(&a);
        let mut s2 = SolverBody::from_body(&b);
        c.prepare_for_iteration(&mut s1, &mut s2, 0.01, &settings);
        c.iterate(&mut s1, &mut s2, &settings);
        assert_eq!(s1.linear_velocity, Vec3::ZERO);
        assert_eq!(s2.linear_velocity, Vec3::ZERO);
    }
}
