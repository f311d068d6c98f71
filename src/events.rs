// src/events.rs
//! World observers and per-body step hooks.
//!
//! Observers are plain lists of boxed closures, fired synchronously on the
//! thread calling `World::step`. The only observer with a say in the
//! simulation is the contact-created hook, which can veto a contact.

use crate::arbiter::BodyPair;
use crate::body::{BodyId, RigidBody};
use crate::contact::{Contact, TriangleId};
use crate::math::Real;

pub type StepCallback = Box<dyn FnMut(Real) + Send>;
pub type BodyCallback = Box<dyn FnMut(&RigidBody) + Send>;
pub type PairCallback = Box<dyn FnMut(BodyId, BodyId) + Send>;
pub type ConstraintCallback = Box<dyn FnMut(u64) + Send>;
/// Returns `false` to discard the contact.
pub type ContactCreatedHook = Box<dyn FnMut(BodyPair, &Contact) -> bool + Send>;
/// Returns `false` to skip narrow-phase results for the pair.
pub type CollisionFilter = Box<dyn Fn(&RigidBody, &RigidBody, Option<TriangleId>) -> bool + Send + Sync>;
pub type BodyStepHook = Box<dyn FnMut(&mut RigidBody, Real) + Send>;

#[derive(Default)]
pub struct WorldEvents {
    pre_step: Vec<StepCallback>,
    post_step: Vec<StepCallback>,
    body_added: Vec<BodyCallback>,
    body_removed: Vec<BodyCallback>,
    constraint_added: Vec<ConstraintCallback>,
    constraint_removed: Vec<ConstraintCallback>,
    begin_collide: Vec<PairCallback>,
    end_collide: Vec<PairCallback>,
    activated: Vec<BodyCallback>,
    deactivated: Vec<BodyCallback>,
    contact_created: Option<ContactCreatedHook>,
}

impl WorldEvents {
    pub fn on_pre_step(&mut self, f: impl FnMut(Real) + Send + 'static) {
        self.pre_step.push(Box::new(f));
    }

    pub fn on_post_step(&mut self, f: impl FnMut(Real) + Send + 'static) {
        self.post_step.push(Box::new(f));
    }

    pub fn on_body_added(&mut self, f: impl FnMut(&RigidBody) + Send + 'static) {
        self.body_added.push(Box::new(f));
    }

    pub fn on_body_removed(&mut self, f: impl FnMut(&RigidBody) + Send + 'static) {
        self.body_removed.push(Box::new(f));
    }

    pub fn on_constraint_added(&mut self, f: impl FnMut(u64) + Send + 'static) {
        self.constraint_added.push(Box::new(f));
    }

    pub fn on_constraint_removed(&mut self, f: impl FnMut(u64) + Send + 'static) {
        self.constraint_removed.push(Box::new(f));
    }

    /// Fired once when a pair gets its arbiter.
    pub fn on_begin_collide(&mut self, f: impl FnMut(BodyId, BodyId) + Send + 'static) {
        self.begin_collide.push(Box::new(f));
    }

    /// Fired once when a pair loses its arbiter.
    pub fn on_end_collide(&mut self, f: impl FnMut(BodyId, BodyId) + Send + 'static) {
        self.end_collide.push(Box::new(f));
    }

    pub fn on_body_activated(&mut self, f: impl FnMut(&RigidBody) + Send + 'static) {
        self.activated.push(Box::new(f));
    }

    pub fn on_body_deactivated(&mut self, f: impl FnMut(&RigidBody) + Send + 'static) {
        self.deactivated.push(Box::new(f));
    }

    /// Replaces the contact-created hook.
    pub fn set_contact_created(&mut self, f: impl FnMut(BodyPair, &Contact) -> bool + Send + 'static) {
        self.contact_created = Some(Box::new(f));
    }

    pub fn clear_contact_created(&mut self) {
        self.contact_created = None;
    }

    /// Drops every observer.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    // ---- firing ------------------------------------------------------------

    pub(crate) fn pre_step(&mut self, dt: Real) {
        self.pre_step.iter_mut().for_each(|f| f(dt));
    }

    pub(crate) fn post_step(&mut self, dt: Real) {
        self.post_step.iter_mut().for_each(|f| f(dt));
    }

    pub(crate) fn body_added(&mut self, body: &RigidBody) {
        self.body_added.iter_mut().for_each(|f| f(body));
    }

    pub(crate) fn body_removed(&mut self, body: &RigidBody) {
        self.body_removed.iter_mut().for_each(|f| f(body));
    }

    pub(crate) fn constraint_added(&mut self, id: u64) {
        self.constraint_added.iter_mut().for_each(|f| f(id));
    }

    pub(crate) fn constraint_removed(&mut self, id: u64) {
        self.constraint_removed.iter_mut().for_each(|f| f(id));
    }

    pub(crate) fn begin_collide(&mut self, pair: BodyPair) {
        self.begin_collide
            .iter_mut()
            .for_each(|f| f(pair.body1, pair.body2));
    }

    pub(crate) fn end_collide(&mut self, pair: BodyPair) {
        self.end_collide
            .iter_mut()
            .for_each(|f| f(pair.body1, pair.body2));
    }

    pub(crate) fn activated(&mut self, body: &RigidBody) {
        self.activated.iter_mut().for_each(|f| f(body));
    }

    pub(crate) fn deactivated(&mut self, body: &RigidBody) {
        self.deactivated.iter_mut().for_each(|f| f(body));
    }

    pub(crate) fn contact_created(&mut self, pair: BodyPair, contact: &Contact) -> bool {
        match self.contact_created.as_mut() {
            Some(hook) => hook(pair, contact),
            None => true,
        }
    }
}

/// Callbacks run on one body at fixed points of the step.
#[derive(Default)]
pub struct BodyHooks {
    /// Before contacts are updated.
    pub pre_step: Option<BodyStepHook>,
    /// After collision detection, before the solver.
    pub mid_step: Option<BodyStepHook>,
    /// After the step finished.
    pub post_step: Option<BodyStepHook>,
}

impl BodyHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre_step(mut self, f: impl FnMut(&mut RigidBody, Real) + Send + 'static) -> Self {
        self.pre_step = Some(Box::new(f));
        self
    }

    pub fn with_mid_step(mut self, f: impl FnMut(&mut RigidBody, Real) + Send + 'static) -> Self {
        self.mid_step = Some(Box::new(f));
        self
    }

    pub fn with_post_step(mut self, f: impl FnMut(&mut RigidBody, Real) + Send + 'static) -> Self {
        self.post_step = Some(Box::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pre_step.is_none() && self.mid_step.is_none() && self.post_step.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_observers_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut events = WorldEvents::default();
        for tag in ["first", "second"] {
            let log = Arc::clone(&log);
            events.on_pre_step(move |_| log.lock().push(tag));
        }
        events.pre_step(0.01);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_contact_hook_defaults_to_accept() {
        let a = RigidBody::static_body();
        let b = RigidBody::dynamic();
        let contact = Contact::new(
            &a,
            &b,
            crate::math::Vec3::ZERO,
            crate::math::Vec3::ZERO,
            crate::math::Vec3::Y,
            0.0,
            None,
            crate::material::MaterialCoefficientMixing::TakeMaximum.mix(a.material(), b.material()),
        );
        let pair = BodyPair::new(a.id(), b.id());

        let mut events = WorldEvents::default();
        assert!(events.contact_created(pair, &contact));
        events.set_contact_created(|_, c| c.penetration() > 1.0);
        assert!(!events.contact_created(pair, &contact));
        events.clear_contact_created();
        assert!(events.contact_created(pair, &contact));
    }
}
