// src/debug.rs
//! Debug visualization as free functions over a line/point sink.

use crate::arbiter::Arbiter;
use crate::body::RigidBody;
use crate::math::{any_perpendicular, Aabb, Real, Vec3};

pub const COLOR_ACTIVE: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
pub const COLOR_SLEEPING: [f32; 4] = [0.4, 0.4, 0.4, 1.0];
pub const COLOR_STATIC: [f32; 4] = [0.2, 0.4, 1.0, 1.0];
pub const COLOR_CONTACT: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
pub const COLOR_SPECULATIVE: [f32; 4] = [1.0, 1.0, 0.0, 1.0];

/// Box wireframe over `Aabb::corners` order.
#[rustfmt::skip]
const BOX_EDGES: [(usize, usize); 12] = [
    (0, 1), (1, 2), (2, 3), (3, 0),
    (4, 5), (5, 6), (6, 7), (7, 4),
    (0, 4), (1, 5), (2, 6), (3, 7),
];

pub trait DebugDrawer {
    fn draw_line(&mut self, start: Vec3, end: Vec3, color: [f32; 4]);
    fn draw_point(&mut self, position: Vec3, size: Real, color: [f32; 4]);
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugLine {
    pub start: Vec3,
    pub end: Vec3,
    pub color: [f32; 4],
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugPoint {
    pub position: Vec3,
    pub size: Real,
    pub color: [f32; 4],
}

/// Collects everything drawn into plain lists for a renderer to consume.
#[derive(Debug, Default, Clone)]
pub struct DebugLines {
    pub lines: Vec<DebugLine>,
    pub points: Vec<DebugPoint>,
}

impl DebugLines {
    pub fn new() -> Self {
        Self {
            lines: Vec::with_capacity(1024),
            points: Vec::with_capacity(256),
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.points.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.points.is_empty()
    }
}

impl DebugDrawer for DebugLines {
    fn draw_line(&mut self, start: Vec3, end: Vec3, color: [f32; 4]) {
        self.lines.push(DebugLine { start, end, color });
    }

    fn draw_point(&mut self, position: Vec3, size: Real, color: [f32; 4]) {
        self.points.push(DebugPoint { position, size, color });
    }
}

pub fn draw_aabb(aabb: &Aabb, color: [f32; 4], drawer: &mut dyn DebugDrawer) {
    if aabb.is_empty() {
        return;
    }
    let corners = aabb.corners();
    for (a, b) in BOX_EDGES {
        drawer.draw_line(corners[a], corners[b], color);
    }
}

/// World bounds plus the body's local axes.
pub fn draw_body(body: &RigidBody, drawer: &mut dyn DebugDrawer) {
    let color = if body.is_static() {
        COLOR_STATIC
    } else if body.is_active() {
        COLOR_ACTIVE
    } else {
        COLOR_SLEEPING
    };
    draw_aabb(&body.bounding_box(), color, drawer);

    let o = body.orientation();
    let p = body.position();
    let len = body.bounding_box().half_extents().min_element().clamp(0.05, 0.5);
    drawer.draw_line(p, p + o.x_axis * len, [1.0, 0.0, 0.0, 1.0]);
    drawer.draw_line(p, p + o.y_axis * len, [0.0, 1.0, 0.0, 1.0]);
    drawer.draw_line(p, p + o.z_axis * len, [0.0, 0.0, 1.0, 1.0]);
}

/// Contact points, normals and a small cross in the contact plane.
pub fn draw_arbiter(arbiter: &Arbiter, drawer: &mut dyn DebugDrawer) {
    for contact in arbiter.contacts() {
        let color = if contact.penetration() < 0.0 {
            COLOR_SPECULATIVE
        } else {
            COLOR_CONTACT
        };
        let p = contact.point2();
        let n = contact.normal();
        drawer.draw_point(p, 0.05, color);
        drawer.draw_line(p, p + n * 0.25, color);

        let u = any_perpendicular(n) * 0.05;
        let v = n.cross(u);
        drawer.draw_line(p - u, p + u, color);
        drawer.draw_line(p - v, p + v, color);
    }
}
