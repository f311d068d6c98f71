// src/lib.rs
//! slop_physics: rigid-body dynamics core.
//!
//! Sequential-impulse contact solving with persistent four-point manifolds,
//! island-based sleeping and scheduling, and speculative contacts. Collision
//! detection is pluggable through [`CollisionSystem`]; a small primitive
//! narrow phase ships for tests and demos.
//!
//! ```no_run
//! use slop_physics::prelude::*;
//!
//! let mut world = World::new(WorldConfig::default())?;
//! world.add_shaped_body(RigidBody::static_body(), Shape::Plane)?;
//! let ball = world.add_shaped_body(
//!     RigidBody::dynamic().with_position(Vec3::new(0.0, 2.0, 0.0)),
//!     Shape::Sphere { radius: 0.5 },
//! )?;
//! for _ in 0..120 {
//!     world.step(1.0 / 60.0, true)?;
//! }
//! println!("{:?}", world.body(ball).map(|b| b.position()));
//! # Ok::<(), slop_physics::PhysicsError>(())
//! ```

pub mod arbiter;
pub mod body;
pub mod collision;
pub mod config;
pub mod constraint;
pub mod contact;
pub mod debug;
pub mod error;
pub mod events;
pub mod island;
pub mod material;
pub mod math;
pub mod pool;
pub mod solver;
pub mod threading;
pub mod world;

pub use arbiter::{Arbiter, ArbiterHandle, BodyPair, ContactGeometry, ContactOutcome, MAX_CONTACTS};
pub use body::{BodyId, BodySet, BodyType, Damping, MassProperties, RigidBody};
pub use collision::{CollisionCandidate, CollisionSystem, ContactSink, NoCollisions, PrimitiveNarrowPhase, Shape};
pub use config::{ContactSettings, WorldConfig};
pub use constraint::{Constraint, DistanceConstraint};
pub use contact::{Contact, TriangleId};
pub use error::{PhysicsError, PhysicsResult};
pub use events::{BodyHooks, WorldEvents};
pub use island::{Island, IslandHandle, IslandManager};
pub use material::{Material, MaterialCoefficientMixing};
pub use pool::{Handle, ResourcePool};
pub use threading::ThreadManager;
pub use world::{World, WorldMetrics};

pub mod prelude {
    pub use crate::body::{BodyId, BodyType, MassProperties, RigidBody};
    pub use crate::collision::Shape;
    pub use crate::config::WorldConfig;
    pub use crate::constraint::DistanceConstraint;
    pub use crate::error::{PhysicsError, PhysicsResult};
    pub use crate::events::BodyHooks;
    pub use crate::material::Material;
    pub use crate::math::{Mat3, Quat, Vec3};
    pub use crate::world::World;
}
