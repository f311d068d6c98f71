// src/error.rs
//! Error handling for the whole crate.
//!
//! - **Synchronous**: every precondition violation is reported at the offending call.
//! - **Cheap**: plain enum discriminants, allocations only for the JSON variant.
//! - **Ergonomic**: works with `?`, `PhysicsResult<T>` alias, `is_*` helpers.

use crate::body::{BodyId, BodyType};
use thiserror::Error;

/// Main error type for world, body and pool operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PhysicsError {
    /// Timestep was negative, NaN or infinite.
    #[error("invalid timestep {0}: must be finite and non-negative")]
    InvalidTimestep(f32),

    /// Mass was zero, negative or not finite.
    #[error("invalid mass {0}: must be finite and positive")]
    InvalidMass(f32),

    /// Inertia tensor could not be inverted.
    #[error("inertia tensor is singular or non-positive")]
    SingularInertia,

    /// Attempted to change the motion of a body that never moves.
    #[error("body {id} is {body_type:?} and cannot receive {operation}")]
    StaticBodyMutation {
        id: BodyId,
        body_type: BodyType,
        operation: &'static str,
    },

    /// Body was already part of the world.
    #[error("body {0} has already been added to the world")]
    DuplicateBody(BodyId),

    /// Body is not part of the world.
    #[error("body {0} is not part of the world")]
    BodyNotFound(BodyId),

    /// Constraint id was already registered.
    #[error("constraint {0} has already been added to the world")]
    DuplicateConstraint(u64),

    /// Constraint is not part of the world.
    #[error("constraint {0} is not part of the world")]
    ConstraintNotFound(u64),

    /// A constraint between two bodies that can never move.
    #[error("constraint between bodies {0} and {1} where neither can move")]
    StaticPair(BodyId, BodyId),

    /// Tuning parameter out of its allowed range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },

    /// A capped resource pool ran out of slots.
    #[error("resource pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl PhysicsError {
    #[inline]
    pub fn invalid_parameter(name: &'static str, reason: &'static str) -> Self {
        Self::InvalidParameter { name, reason }
    }

    #[inline]
    pub fn is_lookup(&self) -> bool {
        matches!(self, Self::BodyNotFound(_) | Self::ConstraintNotFound(_))
    }

    #[inline]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

/// Convenient `Result` alias for physics operations.
pub type PhysicsResult<T> = std::result::Result<T, PhysicsError>;
