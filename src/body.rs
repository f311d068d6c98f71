// src/body.rs
//! Rigid body state.
//!
//! A `RigidBody` is a plain struct with a stable, never-reused `BodyId`. The
//! world owns every body; arbiters, constraints and islands refer to bodies by
//! id and bodies refer back to them by handle.
//!
//! Invariants upheld here:
//! - Static and inactive bodies have zero velocity.
//! - The world bounding box and world inverse inertia always match the pose.
//! - Rotation-locked and manually controlled bodies ignore angular impulses.

use crate::arbiter::ArbiterHandle;
use crate::error::{PhysicsError, PhysicsResult};
use crate::island::IslandHandle;
use crate::material::Material;
use crate::math::{try_inverse, Aabb, Mat3, Real, Vec3};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BODY_ID: AtomicU64 = AtomicU64::new(1);

/// Every body of a world, iterated in creation order.
pub type BodySet = BTreeMap<BodyId, RigidBody>;

/// Stable identity of a body. Ordering follows creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BodyId(u64);

impl BodyId {
    /// Never handed out; marks unbound pooled objects.
    pub(crate) const PLACEHOLDER: BodyId = BodyId(0);

    #[inline]
    fn next() -> Self {
        Self(NEXT_BODY_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Motion type. The ordinal decides which side of a contact may move:
/// a contact only pushes a body whose type is not greater than the other one's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum BodyType {
    #[default]
    Dynamic = 0,
    Kinematic = 1,
    PseudoStatic = 2,
    Static = 3,
}

impl BodyType {
    #[inline(always)]
    pub fn is_static(self) -> bool {
        self == BodyType::Static
    }

    /// True when a contact between `self` and `other` must not move `self`.
    #[inline(always)]
    pub fn immovable_against(self, other: BodyType) -> bool {
        self == BodyType::Static || self > other
    }
}

bitflags! {
    /// Which velocity components receive world damping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Damping: u8 {
        const LINEAR  = 1 << 0;
        const ANGULAR = 1 << 1;
    }
}

impl Default for Damping {
    fn default() -> Self {
        Damping::LINEAR | Damping::ANGULAR
    }
}

/* -------------------------------------------------------------------------- */
/*                            Mass Properties                                 */
/* -------------------------------------------------------------------------- */

/// Mass and body-space inertia of a solid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassProperties {
    pub mass: Real,
    pub inertia: Mat3,
}

impl MassProperties {
    /// Solid box given its half extents.
    pub fn solid_box(mass: Real, half_extents: Vec3) -> Self {
        let s = half_extents * 2.0;
        let k = mass / 12.0;
        let inertia = Mat3::from_diagonal(Vec3::new(
            k * (s.y * s.y + s.z * s.z),
            k * (s.x * s.x + s.z * s.z),
            k * (s.x * s.x + s.y * s.y),
        ));
        Self { mass, inertia }
    }

    /// Solid sphere.
    pub fn solid_sphere(mass: Real, radius: Real) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self {
            mass,
            inertia: Mat3::from_diagonal(Vec3::splat(i)),
        }
    }

    pub fn from_density_box(density: Real, half_extents: Vec3) -> Self {
        let volume = 8.0 * half_extents.x * half_extents.y * half_extents.z;
        Self::solid_box(density * volume, half_extents)
    }
}

impl Default for MassProperties {
    fn default() -> Self {
        Self {
            mass: 1.0,
            inertia: Mat3::IDENTITY,
        }
    }
}

/* -------------------------------------------------------------------------- */
/*                               Rigid Body                                   */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone)]
pub struct RigidBody {
    id: BodyId,
    body_type: BodyType,

    pub(crate) position: Vec3,
    pub(crate) orientation: Mat3,

    pub(crate) linear_velocity: Vec3,
    pub(crate) angular_velocity: Vec3,
    pub(crate) force: Vec3,
    pub(crate) torque: Vec3,

    inertia: Mat3,
    inv_inertia: Mat3,
    pub(crate) inv_inertia_world: Mat3,
    inv_mass: Real,
    is_particle: bool,

    local_bounds: Aabb,
    pub(crate) bounding_box: Aabb,

    pub(crate) active: bool,
    affected_by_gravity: bool,
    fixed_rotation: bool,
    allow_deactivation: bool,
    manually_controlled: bool,
    speculative: bool,
    damping: Damping,
    material: Material,

    pub(crate) inactive_time: Real,
    pub(crate) stored_linear_velocity: Vec3,
    pub(crate) stored_angular_velocity: Vec3,
    pub(crate) needs_resolution: bool,

    pub(crate) arbiters: BTreeSet<ArbiterHandle>,
    pub(crate) constraints: BTreeSet<u64>,
    pub(crate) island: Option<IslandHandle>,
}

impl RigidBody {
    /// New body of the given type: unit mass, unit inertia, identity pose.
    pub fn new(body_type: BodyType) -> Self {
        let mut body = Self {
            id: BodyId::next(),
            body_type,
            position: Vec3::ZERO,
            orientation: Mat3::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
            inertia: Mat3::IDENTITY,
            inv_inertia: Mat3::IDENTITY,
            inv_inertia_world: Mat3::IDENTITY,
            inv_mass: 1.0,
            is_particle: false,
            local_bounds: Aabb::from_half_extents(Vec3::splat(0.5)),
            bounding_box: Aabb::default(),
            active: true,
            affected_by_gravity: true,
            fixed_rotation: false,
            allow_deactivation: true,
            manually_controlled: false,
            speculative: false,
            damping: Damping::default(),
            material: Material::default(),
            inactive_time: 0.0,
            stored_linear_velocity: Vec3::ZERO,
            stored_angular_velocity: Vec3::ZERO,
            needs_resolution: false,
            arbiters: BTreeSet::new(),
            constraints: BTreeSet::new(),
            island: None,
        };
        body.update();
        body
    }

    pub fn dynamic() -> Self {
        Self::new(BodyType::Dynamic)
    }

    pub fn kinematic() -> Self {
        Self::new(BodyType::Kinematic)
    }

    pub fn pseudo_static() -> Self {
        Self::new(BodyType::PseudoStatic)
    }

    pub fn static_body() -> Self {
        Self::new(BodyType::Static)
    }

    // ---- builder -----------------------------------------------------------

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.set_position(position);
        self
    }

    pub fn with_orientation(mut self, orientation: Mat3) -> Self {
        self.set_orientation(orientation);
        self
    }

    pub fn with_linear_velocity(mut self, velocity: Vec3) -> Self {
        if !self.body_type.is_static() {
            self.linear_velocity = velocity;
        }
        self
    }

    pub fn with_angular_velocity(mut self, velocity: Vec3) -> Self {
        if !self.body_type.is_static() && !self.angular_locked() {
            self.angular_velocity = velocity;
        }
        self
    }

    pub fn with_mass_properties(mut self, props: MassProperties) -> PhysicsResult<Self> {
        self.set_mass_properties(props.inertia, props.mass, false)?;
        Ok(self)
    }

    pub fn with_local_bounds(mut self, bounds: Aabb) -> Self {
        self.set_local_bounds(bounds);
        self
    }

    pub fn with_material(mut self, material: Material) -> Self {
        self.material = material;
        self
    }

    pub fn with_gravity(mut self, affected: bool) -> Self {
        self.affected_by_gravity = affected;
        self
    }

    pub fn with_fixed_rotation(mut self, fixed: bool) -> Self {
        self.set_fixed_rotation(fixed);
        self
    }

    pub fn with_deactivation(mut self, allow: bool) -> Self {
        self.allow_deactivation = allow;
        self
    }

    pub fn with_damping(mut self, damping: Damping) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_speculative_contacts(mut self, enabled: bool) -> Self {
        self.speculative = enabled;
        self
    }

    /// Point mass: no rotation response at all.
    pub fn as_particle(mut self) -> Self {
        self.is_particle = true;
        self.angular_velocity = Vec3::ZERO;
        self.update();
        self
    }

    pub fn manually_controlled(mut self) -> Self {
        self.set_manually_controlled(true);
        self
    }

    // ---- read-back ---------------------------------------------------------

    #[inline(always)]
    pub fn id(&self) -> BodyId {
        self.id
    }

    #[inline(always)]
    pub fn body_type(&self) -> BodyType {
        self.body_type
    }

    #[inline(always)]
    pub fn is_static(&self) -> bool {
        self.body_type.is_static()
    }

    #[inline(always)]
    pub fn position(&self) -> Vec3 {
        self.position
    }

    #[inline(always)]
    pub fn orientation(&self) -> Mat3 {
        self.orientation
    }

    #[inline(always)]
    pub fn linear_velocity(&self) -> Vec3 {
        self.linear_velocity
    }

    #[inline(always)]
    pub fn angular_velocity(&self) -> Vec3 {
        self.angular_velocity
    }

    pub fn force(&self) -> Vec3 {
        self.force
    }

    pub fn torque(&self) -> Vec3 {
        self.torque
    }

    #[inline(always)]
    pub fn inverse_mass(&self) -> Real {
        self.inv_mass
    }

    pub fn mass(&self) -> Real {
        1.0 / self.inv_mass
    }

    pub fn inertia(&self) -> Mat3 {
        self.inertia
    }

    pub fn inverse_inertia(&self) -> Mat3 {
        self.inv_inertia
    }

    #[inline(always)]
    pub fn inverse_inertia_world(&self) -> Mat3 {
        self.inv_inertia_world
    }

    pub fn local_bounds(&self) -> Aabb {
        self.local_bounds
    }

    #[inline(always)]
    pub fn bounding_box(&self) -> Aabb {
        self.bounding_box
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn inactive_time(&self) -> Real {
        self.inactive_time
    }

    pub fn is_affected_by_gravity(&self) -> bool {
        self.affected_by_gravity
    }

    pub fn has_fixed_rotation(&self) -> bool {
        self.fixed_rotation
    }

    pub fn allows_deactivation(&self) -> bool {
        self.allow_deactivation
    }

    pub fn is_manually_controlled(&self) -> bool {
        self.manually_controlled
    }

    pub fn is_particle(&self) -> bool {
        self.is_particle
    }

    pub fn uses_speculative_contacts(&self) -> bool {
        self.speculative
    }

    pub fn damping(&self) -> Damping {
        self.damping
    }

    pub fn material(&self) -> &Material {
        &self.material
    }

    pub fn island(&self) -> Option<IslandHandle> {
        self.island
    }

    pub fn arbiters(&self) -> impl Iterator<Item = ArbiterHandle> + '_ {
        self.arbiters.iter().copied()
    }

    pub fn constraints(&self) -> impl Iterator<Item = u64> + '_ {
        self.constraints.iter().copied()
    }

    /// Number of arbiters plus constraints touching this body.
    pub fn connection_count(&self) -> usize {
        self.arbiters.len() + self.constraints.len()
    }

    /// Torque and angular impulses have no effect.
    #[inline(always)]
    pub fn angular_locked(&self) -> bool {
        self.fixed_rotation || self.manually_controlled || self.is_particle
    }

    /// World-space velocity of a point given relative to the center of mass.
    #[inline(always)]
    pub fn velocity_at(&self, relative_position: Vec3) -> Vec3 {
        self.linear_velocity + self.angular_velocity.cross(relative_position)
    }

    // ---- mutation ----------------------------------------------------------

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.update();
    }

    pub fn set_orientation(&mut self, orientation: Mat3) {
        self.orientation = orientation;
        self.update();
    }

    pub fn set_linear_velocity(&mut self, velocity: Vec3) -> PhysicsResult<()> {
        self.ensure_movable("velocity")?;
        self.linear_velocity = velocity;
        Ok(())
    }

    pub fn set_angular_velocity(&mut self, velocity: Vec3) -> PhysicsResult<()> {
        self.ensure_movable("velocity")?;
        if !self.angular_locked() {
            self.angular_velocity = velocity;
        }
        Ok(())
    }

    /// Impulse through the center of mass.
    pub fn apply_impulse(&mut self, impulse: Vec3) -> PhysicsResult<()> {
        self.ensure_movable("impulses")?;
        self.wake_for_impulse();
        self.linear_velocity += impulse * self.inv_mass;
        Ok(())
    }

    /// Impulse applied at `relative_position` from the center of mass.
    pub fn apply_impulse_at(&mut self, impulse: Vec3, relative_position: Vec3) -> PhysicsResult<()> {
        self.ensure_movable("impulses")?;
        self.wake_for_impulse();
        self.linear_velocity += impulse * self.inv_mass;
        if !self.angular_locked() {
            self.angular_velocity += self.inv_inertia_world * relative_position.cross(impulse);
        }
        Ok(())
    }

    /// Force for the next step only.
    #[inline]
    pub fn add_force(&mut self, force: Vec3) {
        self.force += force;
    }

    /// Force at a world-space point for the next step only.
    pub fn add_force_at(&mut self, force: Vec3, world_point: Vec3) {
        self.force += force;
        self.torque += (world_point - self.position).cross(force);
    }

    /// Torque for the next step only.
    #[inline]
    pub fn add_torque(&mut self, torque: Vec3) {
        self.torque += torque;
    }

    pub(crate) fn clear_accumulators(&mut self) {
        self.force = Vec3::ZERO;
        self.torque = Vec3::ZERO;
    }

    /// Sleep or wake this body alone. The world keeps islands consistent.
    pub fn set_active(&mut self, active: bool) {
        if active {
            if !self.active {
                self.inactive_time = 0.0;
            }
        } else {
            self.linear_velocity = Vec3::ZERO;
            self.angular_velocity = Vec3::ZERO;
            self.inactive_time = Real::INFINITY;
        }
        self.active = active;
    }

    /// Scales the inertia so the mass distribution stays the same.
    pub fn set_mass(&mut self, mass: Real) -> PhysicsResult<()> {
        if !(mass.is_finite() && mass > 0.0) {
            return Err(PhysicsError::InvalidMass(mass));
        }
        let scale = mass * self.inv_mass;
        self.inv_mass = 1.0 / mass;
        if !self.is_particle {
            self.inertia = self.inertia * scale;
            self.inv_inertia = self.inv_inertia * (1.0 / scale);
        }
        self.update();
        Ok(())
    }

    /// Sets mass and body-space inertia directly, or their inverses when `as_inverse`.
    pub fn set_mass_properties(&mut self, inertia: Mat3, mass: Real, as_inverse: bool) -> PhysicsResult<()> {
        if !(mass.is_finite() && mass > 0.0) {
            return Err(PhysicsError::InvalidMass(mass));
        }

        if self.is_particle {
            self.inertia = Mat3::ZERO;
            self.inv_inertia = Mat3::ZERO;
        } else {
            if !inertia.is_finite() || inertia.x_axis.x <= 0.0 || inertia.y_axis.y <= 0.0 || inertia.z_axis.z <= 0.0 {
                return Err(PhysicsError::SingularInertia);
            }
            let other = try_inverse(&inertia).ok_or(PhysicsError::SingularInertia)?;
            if as_inverse {
                self.inv_inertia = inertia;
                self.inertia = other;
            } else {
                self.inertia = inertia;
                self.inv_inertia = other;
            }
        }

        self.inv_mass = if as_inverse { mass } else { 1.0 / mass };
        self.update();
        Ok(())
    }

    pub fn set_local_bounds(&mut self, bounds: Aabb) {
        self.local_bounds = bounds;
        self.update();
    }

    pub fn set_material(&mut self, material: Material) {
        self.material = material;
    }

    pub fn set_affected_by_gravity(&mut self, affected: bool) {
        self.affected_by_gravity = affected;
    }

    pub fn set_fixed_rotation(&mut self, fixed: bool) {
        self.fixed_rotation = fixed;
        if fixed {
            self.angular_velocity = Vec3::ZERO;
        }
    }

    pub fn set_allow_deactivation(&mut self, allow: bool) {
        self.allow_deactivation = allow;
    }

    pub fn set_manually_controlled(&mut self, manual: bool) {
        self.manually_controlled = manual;
        if manual {
            self.angular_velocity = Vec3::ZERO;
        }
    }

    pub fn set_damping(&mut self, damping: Damping) {
        self.damping = damping;
    }

    pub fn set_speculative_contacts(&mut self, enabled: bool) {
        self.speculative = enabled;
    }

    /// Changing to `Static` drops all motion. Bodies inside a world change
    /// type through `World::set_body_type`.
    pub(crate) fn set_body_type(&mut self, body_type: BodyType) {
        self.body_type = body_type;
        if body_type.is_static() {
            self.linear_velocity = Vec3::ZERO;
            self.angular_velocity = Vec3::ZERO;
            self.clear_accumulators();
        }
    }

    /// Recomputes everything derived from the pose.
    pub fn update(&mut self) {
        self.inv_inertia_world = if self.is_particle {
            Mat3::ZERO
        } else {
            self.orientation * self.inv_inertia * self.orientation.transpose()
        };
        self.bounding_box = self.local_bounds.transform(self.position, &self.orientation);
    }

    pub(crate) fn sweep_bounds(&mut self, dt: Real) {
        self.bounding_box = self.bounding_box.sweep(self.linear_velocity * dt);
    }

    #[inline]
    fn ensure_movable(&self, operation: &'static str) -> PhysicsResult<()> {
        if self.body_type.is_static() {
            return Err(PhysicsError::StaticBodyMutation {
                id: self.id,
                body_type: self.body_type,
                operation,
            });
        }
        Ok(())
    }

    #[inline]
    fn wake_for_impulse(&mut self) {
        if !self.active {
            self.set_active(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let a = RigidBody::dynamic();
        let b = RigidBody::dynamic();
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }

    #[test]
    fn test_type_ordering() {
        assert!(BodyType::Dynamic < BodyType::Kinematic);
        assert!(BodyType::Kinematic < BodyType::PseudoStatic);
        assert!(BodyType::PseudoStatic < BodyType::Static);
        assert!(BodyType::Static.immovable_against(BodyType::Static));
        assert!(BodyType::PseudoStatic.immovable_against(BodyType::Dynamic));
        assert!(!BodyType::Dynamic.immovable_against(BodyType::PseudoStatic));
        assert!(!BodyType::Kinematic.immovable_against(BodyType::Kinematic));
    }

    #[test]
    fn test_static_body_rejects_impulses() {
        let mut s = RigidBody::static_body();
        assert!(matches!(
            s.apply_impulse(Vec3::X),
            Err(PhysicsError::StaticBodyMutation { .. })
        ));
        assert!(s.apply_impulse_at(Vec3::X, Vec3::Y).is_err());
        assert!(s.set_linear_velocity(Vec3::X).is_err());
        assert_eq!(s.linear_velocity(), Vec3::ZERO);
    }

    #[test]
    fn test_set_active_false_zeroes_velocity() {
        let mut b = RigidBody::dynamic()
            .with_linear_velocity(Vec3::new(1.0, 2.0, 3.0))
            .with_angular_velocity(Vec3::Y);
        b.set_active(false);
        assert_eq!(b.linear_velocity(), Vec3::ZERO);
        assert_eq!(b.angular_velocity(), Vec3::ZERO);
        assert!(b.inactive_time().is_infinite());

        b.set_active(true);
        assert_eq!(b.inactive_time(), 0.0);
    }

    #[test]
    fn test_impulse_wakes_sleeping_body() {
        let mut b = RigidBody::dynamic();
        b.set_active(false);
        b.apply_impulse(Vec3::X).unwrap();
        assert!(b.is_active());
        assert_eq!(b.linear_velocity(), Vec3::X);
    }

    #[test]
    fn test_set_mass_scales_inertia() {
        let mut b = RigidBody::dynamic()
            .with_mass_properties(MassProperties::solid_sphere(2.0, 1.0))
            .unwrap();
        let before = b.inertia();
        b.set_mass(4.0).unwrap();
        assert!((b.inertia().x_axis.x - before.x_axis.x * 2.0).abs() < 1e-5);
        assert!((b.inverse_mass() - 0.25).abs() < 1e-6);
        assert!((b.inverse_inertia() * b.inertia()).abs_diff_eq(Mat3::IDENTITY, 1e-5));

        assert!(matches!(b.set_mass(0.0), Err(PhysicsError::InvalidMass(_))));
        assert!(b.set_mass(-1.0).is_err());
        assert!(b.set_mass(Real::NAN).is_err());
    }

    #[test]
    fn test_mass_properties_inverse_input() {
        let mut b = RigidBody::dynamic();
        let inv = Mat3::from_diagonal(Vec3::splat(0.5));
        b.set_mass_properties(inv, 0.25, true).unwrap();
        assert!((b.mass() - 4.0).abs() < 1e-5);
        assert!((b.inertia().y_axis.y - 2.0).abs() < 1e-5);

        assert!(matches!(
            b.set_mass_properties(Mat3::ZERO, 1.0, false),
            Err(PhysicsError::SingularInertia)
        ));
    }

    #[test]
    fn test_pose_updates_derived_state() {
        let mut b = RigidBody::dynamic()
            .with_local_bounds(Aabb::from_half_extents(Vec3::new(2.0, 0.5, 0.5)))
            .with_mass_properties(MassProperties::solid_box(1.0, Vec3::new(2.0, 0.5, 0.5)))
            .unwrap();
        b.set_position(Vec3::new(0.0, 5.0, 0.0));
        assert!((b.bounding_box().center() - Vec3::new(0.0, 5.0, 0.0)).length() < 1e-5);

        let rot = Mat3::from_rotation_z(std::f32::consts::FRAC_PI_2);
        b.set_orientation(rot);
        assert!((b.bounding_box().half_extents().y - 2.0).abs() < 1e-4);
        let expected = rot * b.inverse_inertia() * rot.transpose();
        assert!(b.inverse_inertia_world().abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_fixed_rotation_ignores_angular_impulse() {
        let mut b = RigidBody::dynamic().with_fixed_rotation(true);
        b.apply_impulse_at(Vec3::X, Vec3::Y).unwrap();
        assert_eq!(b.angular_velocity(), Vec3::ZERO);
        assert_eq!(b.linear_velocity(), Vec3::X);
    }

    #[test]
    fn test_solid_box_inertia() {
        let m = MassProperties::solid_box(12.0, Vec3::new(0.5, 0.5, 0.5));
        assert!((m.inertia.x_axis.x - 2.0).abs() < 1e-5);
    }
}
