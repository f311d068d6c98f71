// src/arbiter.rs
//! Persistent contact manifold for one pair of bodies.
//!
//! - At most four contacts per pair, stored inline.
//! - New points within the break threshold of a cached one refresh it and keep
//!   its accumulated impulses (warm starting).
//! - A fifth point replaces the cached point whose removal keeps the largest
//!   contact area. The deepest point is never evicted by a shallower one.

use crate::body::{BodyId, RigidBody};
use crate::config::ContactSettings;
use crate::contact::{Contact, TriangleId};
use crate::math::{Real, Vec3};
use crate::pool::{Handle, Reset};
use smallvec::SmallVec;

pub type ArbiterHandle = Handle<Arbiter>;

/// Maximum number of cached points per pair.
pub const MAX_CONTACTS: usize = 4;

/// Unordered pair of bodies. `body1` is always the smaller id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BodyPair {
    pub body1: BodyId,
    pub body2: BodyId,
}

impl BodyPair {
    #[inline]
    pub fn new(a: BodyId, b: BodyId) -> Self {
        if a <= b {
            Self { body1: a, body2: b }
        } else {
            Self { body1: b, body2: a }
        }
    }

    #[inline]
    pub fn contains(&self, id: BodyId) -> bool {
        self.body1 == id || self.body2 == id
    }

    /// The partner of `id` in this pair.
    #[inline]
    pub fn other(&self, id: BodyId) -> Option<BodyId> {
        if self.body1 == id {
            Some(self.body2)
        } else if self.body2 == id {
            Some(self.body1)
        } else {
            None
        }
    }
}

impl Default for BodyPair {
    fn default() -> Self {
        Self {
            body1: BodyId::PLACEHOLDER,
            body2: BodyId::PLACEHOLDER,
        }
    }
}

/// Geometry of one narrow-phase point, already oriented for the arbiter:
/// `point1` lies on body 1, `point2` on body 2, the normal points from 1 to 2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactGeometry {
    pub point1: Vec3,
    pub point2: Vec3,
    pub normal: Vec3,
    pub penetration: Real,
    pub triangle: Option<TriangleId>,
}

/// What `add_contact` did with a candidate point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    /// The contact-created hook rejected it.
    Vetoed,
    /// Appended as a fresh point.
    Added(usize),
    /// Matched a cached point, whose impulses were kept.
    Merged(usize),
    /// The manifold was full and this cached point was overwritten.
    Replaced(usize),
}

#[derive(Debug, Default)]
pub struct Arbiter {
    pair: BodyPair,
    contacts: SmallVec<[Contact; MAX_CONTACTS]>,
}

impl Reset for Arbiter {
    fn reset(&mut self) {
        self.pair = BodyPair::default();
        self.contacts.clear();
    }
}

impl Arbiter {
    pub(crate) fn bind(&mut self, pair: BodyPair) {
        self.pair = pair;
        self.contacts.clear();
    }

    #[inline]
    pub fn pair(&self) -> BodyPair {
        self.pair
    }

    #[inline]
    pub fn body1(&self) -> BodyId {
        self.pair.body1
    }

    #[inline]
    pub fn body2(&self) -> BodyId {
        self.pair.body2
    }

    #[inline]
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub(crate) fn contacts_mut(&mut self) -> &mut [Contact] {
        &mut self.contacts
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Feeds one narrow-phase point into the manifold.
    ///
    /// `body1`/`body2` must be this arbiter's bodies in pair order.
    /// `on_created` sees the candidate first and may veto it.
    pub fn add_contact(
        &mut self,
        body1: &RigidBody,
        body2: &RigidBody,
        geometry: ContactGeometry,
        settings: &ContactSettings,
        on_created: &mut dyn FnMut(BodyPair, &Contact) -> bool,
    ) -> ContactOutcome {
        debug_assert_eq!(body1.id(), self.pair.body1);
        debug_assert_eq!(body2.id(), self.pair.body2);

        let coefficients = settings
            .material_mixing
            .mix(body1.material(), body2.material());
        let candidate = Contact::new(
            body1,
            body2,
            geometry.point1,
            geometry.point2,
            geometry.normal,
            geometry.penetration,
            geometry.triangle,
            coefficients,
        );
        if !on_created(self.pair, &candidate) {
            return ContactOutcome::Vetoed;
        }

        let relative_pos1 = geometry.point1 - body1.position();

        if self.contacts.len() == MAX_CONTACTS {
            let index = self.replacement_index(relative_pos1, geometry.penetration);
            self.refresh(index, body1, body2, &geometry);
            return ContactOutcome::Replaced(index);
        }

        match self.cache_entry(relative_pos1, settings.break_threshold) {
            Some(index) => {
                self.refresh(index, body1, body2, &geometry);
                ContactOutcome::Merged(index)
            }
            None => {
                self.contacts.push(candidate);
                ContactOutcome::Added(self.contacts.len() - 1)
            }
        }
    }

    fn refresh(&mut self, index: usize, body1: &RigidBody, body2: &RigidBody, g: &ContactGeometry) {
        self.contacts[index].refresh(
            body1,
            body2,
            g.point1,
            g.point2,
            g.normal,
            g.penetration,
            g.triangle,
        );
    }

    /// Nearest cached point within the break threshold.
    fn cache_entry(&self, relative_pos1: Vec3, break_threshold: Real) -> Option<usize> {
        let mut shortest = break_threshold * break_threshold;
        let mut nearest = None;
        for (i, c) in self.contacts.iter().enumerate() {
            let dist = (c.relative_pos1 - relative_pos1).length_squared();
            if dist < shortest {
                shortest = dist;
                nearest = Some(i);
            }
        }
        nearest
    }

    /// Index of the cached point to overwrite when the manifold is full.
    fn replacement_index(&self, relative_pos1: Vec3, penetration: Real) -> usize {
        let mut deepest = None;
        let mut max_penetration = penetration;
        for (i, c) in self.contacts.iter().enumerate() {
            if c.penetration > max_penetration {
                deepest = Some(i);
                max_penetration = c.penetration;
            }
        }

        let r = |i: usize| self.contacts[i].relative_pos1;
        // Area spanned when point `excluded` is swapped for the candidate.
        // Cached points carry no winding, so take the pairing that forms the
        // actual diagonals.
        let area = |excluded: usize, a: usize, b: usize, c: usize| -> Real {
            if deepest == Some(excluded) {
                return Real::NEG_INFINITY;
            }
            let (p, q, s, t) = (relative_pos1, r(a), r(b), r(c));
            [(p - q).cross(s - t), (p - s).cross(q - t), (p - t).cross(q - s)]
                .iter()
                .map(|d| d.length_squared())
                .fold(0.0, Real::max)
        };

        let areas = [
            area(0, 1, 2, 3),
            area(1, 0, 2, 3),
            area(2, 0, 1, 3),
            area(3, 0, 1, 2),
        ];

        let mut best = 0;
        let mut best_area = Real::MIN;
        for (i, a) in areas.iter().enumerate() {
            if *a > best_area {
                best = i;
                best_area = *a;
            }
        }
        best
    }

    /// Moves every point with its bodies and drops the ones that broke.
    /// Returns how many were dropped.
    pub fn update(&mut self, body1: &RigidBody, body2: &RigidBody, break_threshold: Real) -> usize {
        let before = self.contacts.len();
        self.contacts.retain(|c| {
            c.update_position(body1, body2);
            !c.is_broken(break_threshold)
        });
        before - self.contacts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies() -> (RigidBody, RigidBody) {
        let ground = RigidBody::static_body();
        let block = RigidBody::dynamic().with_position(Vec3::new(0.0, 0.5, 0.0));
        (ground, block)
    }

    fn arbiter_for(a: &RigidBody, b: &RigidBody) -> Arbiter {
        let mut arbiter = Arbiter::default();
        arbiter.bind(BodyPair::new(a.id(), b.id()));
        arbiter
    }

    fn point(x: Real, z: Real, penetration: Real) -> ContactGeometry {
        ContactGeometry {
            point1: Vec3::new(x, penetration, z),
            point2: Vec3::new(x, 0.0, z),
            normal: Vec3::Y,
            penetration,
            triangle: None,
        }
    }

    fn accept(_: BodyPair, _: &Contact) -> bool {
        true
    }

    #[test]
    fn test_pair_is_canonical() {
        let (a, b) = bodies();
        assert_eq!(BodyPair::new(a.id(), b.id()), BodyPair::new(b.id(), a.id()));
        let pair = BodyPair::new(b.id(), a.id());
        assert!(pair.body1 < pair.body2);
        assert_eq!(pair.other(a.id()), Some(b.id()));
    }

    #[test]
    fn test_manifold_never_exceeds_four() {
        let (ground, block) = bodies();
        let mut arbiter = arbiter_for(&ground, &block);
        let settings = ContactSettings::default();
        for i in 0..20 {
            let angle = i as Real * 0.7;
            arbiter.add_contact(
                &ground,
                &block,
                point(angle.cos(), angle.sin(), 0.01),
                &settings,
                &mut accept,
            );
            assert!(arbiter.len() <= MAX_CONTACTS);
        }
        assert_eq!(arbiter.len(), MAX_CONTACTS);
    }

    #[test]
    fn test_deepest_point_survives_replacement() {
        let (ground, block) = bodies();
        let mut arbiter = arbiter_for(&ground, &block);
        let settings = ContactSettings::default();
        let corners = [(-0.5, -0.5, 0.02), (0.5, -0.5, 0.3), (0.5, 0.5, 0.02), (-0.5, 0.5, 0.02)];
        for (x, z, pen) in corners {
            arbiter.add_contact(&ground, &block, point(x, z, pen), &settings, &mut accept);
        }
        assert_eq!(arbiter.len(), 4);

        // Shallow candidates far out would otherwise maximize area by evicting any corner.
        for (x, z) in [(2.0, -2.0), (3.0, 0.0), (0.0, 3.0), (-3.0, -3.0)] {
            let outcome = arbiter.add_contact(&ground, &block, point(x, z, 0.01), &settings, &mut accept);
            assert!(matches!(outcome, ContactOutcome::Replaced(i) if i != 1));
            assert!(arbiter
                .contacts()
                .iter()
                .any(|c| (c.penetration() - 0.3).abs() < 1e-6));
        }
    }

    #[test]
    fn test_deepest_point_survives_collinear_manifold() {
        let (ground, block) = bodies();
        let mut arbiter = arbiter_for(&ground, &block);
        let settings = ContactSettings::default();
        // Edge resting on the plane: every exclusion case spans zero area.
        let on_axis = |x: Real, penetration: Real| ContactGeometry {
            point1: Vec3::new(x, 0.0, 0.0),
            point2: Vec3::new(x, 0.0, 0.0),
            normal: Vec3::Y,
            penetration,
            triangle: None,
        };
        for (x, pen) in [(-1.5, 0.3), (-0.5, 0.02), (0.5, 0.02), (1.5, 0.02)] {
            arbiter.add_contact(&ground, &block, on_axis(x, pen), &settings, &mut accept);
        }
        assert_eq!(arbiter.len(), 4);

        let outcome = arbiter.add_contact(&ground, &block, on_axis(0.0, 0.01), &settings, &mut accept);
        assert!(matches!(outcome, ContactOutcome::Replaced(i) if i != 0));
        let max_penetration = arbiter
            .contacts()
            .iter()
            .map(Contact::penetration)
            .fold(Real::MIN, Real::max);
        assert!((max_penetration - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_replacement_keeps_largest_area() {
        let (ground, block) = bodies();
        let mut arbiter = arbiter_for(&ground, &block);
        let settings = ContactSettings::default();
        // One point near the middle, then three corners of a square.
        for (x, z) in [(0.1, 0.0), (1.0, -1.0), (1.0, 1.0), (-1.0, -1.0)] {
            arbiter.add_contact(&ground, &block, point(x, z, 0.01), &settings, &mut accept);
        }
        let outcome = arbiter.add_contact(&ground, &block, point(-1.0, 1.0, 0.01), &settings, &mut accept);
        assert_eq!(outcome, ContactOutcome::Replaced(0));
        let inner = arbiter
            .contacts()
            .iter()
            .any(|c| (c.point2() - Vec3::new(0.1, 0.0, 0.0)).length() < 1e-6);
        assert!(!inner);
    }

    #[test]
    fn test_resubmitted_corner_replaces_itself_in_any_order() {
        let (ground, block) = bodies();
        let mut arbiter = arbiter_for(&ground, &block);
        let settings = ContactSettings::default();
        // Corners cached walking around the square.
        for (x, z) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            arbiter.add_contact(&ground, &block, point(x, z, 0.01), &settings, &mut accept);
        }
        for (i, (x, z)) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)].into_iter().enumerate() {
            let outcome = arbiter.add_contact(&ground, &block, point(x + 0.001, z, 0.012), &settings, &mut accept);
            assert_eq!(outcome, ContactOutcome::Replaced(i));
        }
    }

    #[test]
    fn test_cached_point_keeps_impulse_fresh_point_starts_at_zero() {
        let (ground, block) = bodies();
        let mut arbiter = arbiter_for(&ground, &block);
        let settings = ContactSettings::default();

        arbiter.add_contact(&ground, &block, point(0.0, 0.0, 0.01), &settings, &mut accept);
        arbiter.contacts_mut()[0].accumulated_normal_impulse = 3.0;
        arbiter.contacts_mut()[0].new_contact = false;

        let merged = arbiter.add_contact(&ground, &block, point(0.002, 0.0, 0.012), &settings, &mut accept);
        assert_eq!(merged, ContactOutcome::Merged(0));
        assert_eq!(arbiter.contacts()[0].accumulated_normal_impulse(), 3.0);
        assert!((arbiter.contacts()[0].penetration() - 0.012).abs() < 1e-6);

        let added = arbiter.add_contact(&ground, &block, point(0.5, 0.0, 0.01), &settings, &mut accept);
        assert_eq!(added, ContactOutcome::Added(1));
        assert_eq!(arbiter.contacts()[1].accumulated_normal_impulse(), 0.0);
        assert!(arbiter.contacts()[1].is_new());
    }

    #[test]
    fn test_veto_discards_candidate() {
        let (ground, block) = bodies();
        let mut arbiter = arbiter_for(&ground, &block);
        let settings = ContactSettings::default();
        let mut seen = 0;
        let outcome = arbiter.add_contact(
            &ground,
            &block,
            point(0.0, 0.0, 0.01),
            &settings,
            &mut |_, _| {
                seen += 1;
                false
            },
        );
        assert_eq!(outcome, ContactOutcome::Vetoed);
        assert_eq!(seen, 1);
        assert!(arbiter.is_empty());
    }

    #[test]
    fn test_update_drops_separated_points() {
        let (ground, mut block) = bodies();
        let mut arbiter = arbiter_for(&ground, &block);
        let settings = ContactSettings::default();
        // block at y = 0.5, point2 on the block, point1 on the ground
        arbiter.add_contact(
            &ground,
            &block,
            ContactGeometry {
                point1: Vec3::new(0.0, 0.005, 0.0),
                point2: Vec3::new(0.0, 0.0, 0.0),
                normal: Vec3::Y,
                penetration: 0.005,
                triangle: None,
            },
            &settings,
            &mut accept,
        );
        assert_eq!(arbiter.update(&ground, &block, settings.break_threshold), 0);

        block.set_position(Vec3::new(0.0, 0.6, 0.0));
        assert_eq!(arbiter.update(&ground, &block, settings.break_threshold), 1);
        assert!(arbiter.is_empty());
    }
}
