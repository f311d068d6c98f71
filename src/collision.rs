// src/collision.rs
//! Boundary to collision detection, plus a small primitive narrow phase.
//!
//! The world does not detect collisions itself. Every step it hands the body
//! set to a `CollisionSystem`, which reports contact candidates into a
//! thread-safe `ContactSink`. The sink is drained on the stepping thread.
//!
//! `PrimitiveNarrowPhase` is a reference implementation for spheres, boxes and
//! static half-spaces. It pairs bodies by bounding-box overlap and reports up
//! to four points per pair.

use crate::body::{BodyId, BodySet, RigidBody};
use crate::contact::TriangleId;
use crate::math::{Aabb, Mat3, Real, Vec3, EPSILON};
use parking_lot::Mutex;
use std::collections::HashMap;

/// One narrow-phase result. The normal points from `body_b` toward `body_a`;
/// `point_a` lies on A, `point_b` on B.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionCandidate {
    pub body_a: BodyId,
    pub body_b: BodyId,
    pub point_a: Vec3,
    pub point_b: Vec3,
    pub normal: Vec3,
    pub penetration: Real,
    pub triangle: Option<TriangleId>,
}

/// Thread-safe collector for narrow-phase output.
#[derive(Debug, Default)]
pub struct ContactSink {
    queue: Mutex<Vec<CollisionCandidate>>,
}

impl ContactSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callable from any worker thread.
    pub fn report(&self, candidate: CollisionCandidate) {
        self.queue.lock().push(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn drain(&self) -> Vec<CollisionCandidate> {
        std::mem::take(&mut *self.queue.lock())
    }
}

/// Pluggable broad + narrow phase.
pub trait CollisionSystem: Send {
    /// Reports every touching or about-to-touch pair into `sink`.
    fn detect(&mut self, bodies: &BodySet, sink: &ContactSink);

    /// Called after a body has left the world.
    fn body_removed(&mut self, _id: BodyId) {}
}

/// Detection that never reports anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCollisions;

impl CollisionSystem for NoCollisions {
    fn detect(&mut self, _bodies: &BodySet, _sink: &ContactSink) {}
}

/* -------------------------------------------------------------------------- */
/*                          Primitive Narrow Phase                            */
/* -------------------------------------------------------------------------- */

/// Collision geometry understood by `PrimitiveNarrowPhase`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Sphere { radius: Real },
    Box { half_extents: Vec3 },
    /// Half-space below the body-local plane `y = 0` (normal is local +Y).
    Plane,
}

impl Shape {
    /// Body-space bounds. Planes get a large finite slab.
    pub fn local_bounds(&self) -> Aabb {
        match *self {
            Shape::Sphere { radius } => Aabb::from_half_extents(Vec3::splat(radius)),
            Shape::Box { half_extents } => Aabb::from_half_extents(half_extents),
            Shape::Plane => Aabb::new(Vec3::new(-1.0e4, -1.0e4, -1.0e4), Vec3::new(1.0e4, 0.0, 1.0e4)),
        }
    }
}

/// Raw contact between a pair, normal from `b` toward `a`.
struct Hit {
    point_a: Vec3,
    point_b: Vec3,
    normal: Vec3,
    penetration: Real,
}

pub struct PrimitiveNarrowPhase {
    shapes: HashMap<BodyId, Shape>,
    /// Separation below which a not-yet-touching point is still reported.
    pub margin: Real,
    /// Report every pair whose swept bounds overlap, at any separation.
    pub speculative: bool,
    pairs_tested: usize,
}

impl Default for PrimitiveNarrowPhase {
    fn default() -> Self {
        Self {
            shapes: HashMap::new(),
            margin: 0.02,
            speculative: false,
            pairs_tested: 0,
        }
    }
}

impl PrimitiveNarrowPhase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_margin(margin: Real) -> Self {
        Self {
            margin: margin.max(0.0),
            ..Self::default()
        }
    }

    /// Registers a shape and fits the body's local bounds to it.
    pub fn attach(&mut self, body: &mut RigidBody, shape: Shape) {
        body.set_local_bounds(shape.local_bounds());
        self.shapes.insert(body.id(), shape);
    }

    pub fn shape(&self, id: BodyId) -> Option<&Shape> {
        self.shapes.get(&id)
    }

    pub fn remove(&mut self, id: BodyId) -> Option<Shape> {
        self.shapes.remove(&id)
    }

    /// Pairs that passed the bounds test in the last `detect`.
    pub fn pairs_tested(&self) -> usize {
        self.pairs_tested
    }

    fn collide(a: &RigidBody, sa: &Shape, b: &RigidBody, sb: &Shape, margin: Real) -> Vec<Hit> {
        match (sa, sb) {
            (Shape::Sphere { radius: ra }, Shape::Sphere { radius: rb }) => {
                sphere_sphere(a.position(), *ra, b.position(), *rb, margin)
                    .into_iter()
                    .collect()
            }
            (Shape::Sphere { radius }, Shape::Plane) => {
                sphere_plane(a.position(), *radius, b, margin).into_iter().collect()
            }
            (Shape::Plane, Shape::Sphere { radius }) => {
                flip(sphere_plane(b.position(), *radius, a, margin).into_iter().collect())
            }
            (Shape::Sphere { radius }, Shape::Box { half_extents }) => {
                sphere_box(a.position(), *radius, b, *half_extents, margin)
                    .into_iter()
                    .collect()
            }
            (Shape::Box { half_extents }, Shape::Sphere { radius }) => {
                flip(
                    sphere_box(b.position(), *radius, a, *half_extents, margin)
                        .into_iter()
                        .collect(),
                )
            }
            (Shape::Box { half_extents }, Shape::Plane) => box_plane(a, *half_extents, b, margin),
            (Shape::Plane, Shape::Box { half_extents }) => flip(box_plane(b, *half_extents, a, margin)),
            // Box-box and plane-plane are left to full collision systems.
            _ => Vec::new(),
        }
    }
}

impl CollisionSystem for PrimitiveNarrowPhase {
    fn detect(&mut self, bodies: &BodySet, sink: &ContactSink) {
        let entries: Vec<(&RigidBody, &Shape)> = bodies
            .values()
            .filter_map(|b| self.shapes.get(&b.id()).map(|s| (b, s)))
            .collect();

        let mut tested = 0;
        for (i, (a, sa)) in entries.iter().enumerate() {
            for (b, sb) in entries.iter().skip(i + 1) {
                let a_moves = !a.is_static() && a.is_active();
                let b_moves = !b.is_static() && b.is_active();
                if !a_moves && !b_moves {
                    continue;
                }
                if !a
                    .bounding_box()
                    .inflate(self.margin)
                    .overlaps(&b.bounding_box().inflate(self.margin))
                {
                    continue;
                }
                tested += 1;
                let margin = if self.speculative || a.uses_speculative_contacts() || b.uses_speculative_contacts() {
                    Real::INFINITY
                } else {
                    self.margin
                };
                for hit in Self::collide(a, sa, b, sb, margin) {
                    sink.report(CollisionCandidate {
                        body_a: a.id(),
                        body_b: b.id(),
                        point_a: hit.point_a,
                        point_b: hit.point_b,
                        normal: hit.normal,
                        penetration: hit.penetration,
                        triangle: None,
                    });
                }
            }
        }
        self.pairs_tested = tested;
    }

    fn body_removed(&mut self, id: BodyId) {
        self.shapes.remove(&id);
    }
}

// ---- primitive tests --------------------------------------------------------

fn flip(hits: Vec<Hit>) -> Vec<Hit> {
    hits.into_iter()
        .map(|h| Hit {
            point_a: h.point_b,
            point_b: h.point_a,
            normal: -h.normal,
            penetration: h.penetration,
        })
        .collect()
}

/// Plane normal and a point on the plane of a half-space body.
#[inline]
fn plane_of(body: &RigidBody) -> (Vec3, Vec3) {
    (body.orientation() * Vec3::Y, body.position())
}

fn sphere_sphere(ca: Vec3, ra: Real, cb: Vec3, rb: Real, margin: Real) -> Option<Hit> {
    let delta = ca - cb;
    let dist = delta.length();
    let penetration = ra + rb - dist;
    if penetration < -margin {
        return None;
    }
    let normal = if dist > EPSILON { delta / dist } else { Vec3::Y };
    Some(Hit {
        point_a: ca - normal * ra,
        point_b: cb + normal * rb,
        normal,
        penetration,
    })
}

fn sphere_plane(center: Vec3, radius: Real, plane: &RigidBody, margin: Real) -> Option<Hit> {
    let (n, origin) = plane_of(plane);
    let height = (center - origin).dot(n);
    let penetration = radius - height;
    if penetration < -margin {
        return None;
    }
    Some(Hit {
        point_a: center - n * radius,
        point_b: center - n * height,
        normal: n,
        penetration,
    })
}

fn sphere_box(center: Vec3, radius: Real, bx: &RigidBody, half: Vec3, margin: Real) -> Option<Hit> {
    let rot: Mat3 = bx.orientation();
    let local = rot.transpose() * (center - bx.position());
    let clamped = local.clamp(-half, half);

    let (local_normal, local_surface, penetration) = if local == clamped {
        // Center inside the box: push out through the nearest face.
        let gap = half - local.abs();
        let axis = if gap.x <= gap.y && gap.x <= gap.z {
            0
        } else if gap.y <= gap.z {
            1
        } else {
            2
        };
        let mut n = Vec3::ZERO;
        n[axis] = if local[axis] >= 0.0 { 1.0 } else { -1.0 };
        let mut surface = local;
        surface[axis] = half[axis] * n[axis];
        (n, surface, radius + gap[axis])
    } else {
        let delta = local - clamped;
        let dist = delta.length();
        (delta / dist, clamped, radius - dist)
    };

    if penetration < -margin {
        return None;
    }
    let normal = rot * local_normal;
    Some(Hit {
        point_a: center - normal * radius,
        point_b: bx.position() + rot * local_surface,
        normal,
        penetration,
    })
}

fn box_plane(bx: &RigidBody, half: Vec3, plane: &RigidBody, margin: Real) -> Vec<Hit> {
    let (n, origin) = plane_of(plane);
    let local = Aabb::from_half_extents(half);
    let mut hits: Vec<Hit> = local
        .corners()
        .iter()
        .filter_map(|c| {
            let corner = bx.position() + bx.orientation() * *c;
            let height = (corner - origin).dot(n);
            (height <= margin).then(|| Hit {
                point_a: corner,
                point_b: corner - n * height,
                normal: n,
                penetration: -height,
            })
        })
        .collect();

    // Deepest four are enough for a stable manifold.
    hits.sort_by(|x, y| y.penetration.total_cmp(&x.penetration));
    hits.truncate(4);
    hits
}
