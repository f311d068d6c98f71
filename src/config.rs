// src/config.rs
//! Tuning parameters for the world and the contact solver.
//!
//! Everything here is plain data with `Default` and serde support, so a
//! configuration can be shipped as JSON next to the game data.

use crate::error::{PhysicsError, PhysicsResult};
use crate::material::MaterialCoefficientMixing;
use crate::math::{Real, Vec3};
use serde::{Deserialize, Serialize};

/* -------------------------------------------------------------------------- */
/*                            Contact Settings                                */
/* -------------------------------------------------------------------------- */

/// Parameters shared by every contact in a world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactSettings {
    /// Upper bound of the positional correction velocity.
    pub maximum_bias: Real,
    /// Baumgarte factor.
    pub bias_factor: Real,
    /// Relative velocities below this are not solved.
    pub minimum_velocity: Real,
    /// Penetration slop tolerated without correction.
    pub allowed_penetration: Real,
    /// Distance after which a cached contact is dropped or a new one is not merged.
    pub break_threshold: Real,
    pub material_mixing: MaterialCoefficientMixing,
}

impl Default for ContactSettings {
    fn default() -> Self {
        Self {
            maximum_bias: 10.0,
            bias_factor: 0.25,
            minimum_velocity: 0.001,
            allowed_penetration: 0.01,
            break_threshold: 0.01,
            material_mixing: MaterialCoefficientMixing::TakeMaximum,
        }
    }
}

impl ContactSettings {
    pub fn validate(&self) -> PhysicsResult<()> {
        if !(self.maximum_bias >= 0.0) {
            return Err(PhysicsError::invalid_parameter("maximum_bias", "must be >= 0"));
        }
        if !(self.bias_factor >= 0.0 && self.bias_factor <= 1.0) {
            return Err(PhysicsError::invalid_parameter("bias_factor", "must be in [0, 1]"));
        }
        if !(self.minimum_velocity >= 0.0) {
            return Err(PhysicsError::invalid_parameter("minimum_velocity", "must be >= 0"));
        }
        if !(self.allowed_penetration >= 0.0) {
            return Err(PhysicsError::invalid_parameter("allowed_penetration", "must be >= 0"));
        }
        if !(self.break_threshold > 0.0) {
            return Err(PhysicsError::invalid_parameter("break_threshold", "must be > 0"));
        }
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */
/*                              World Config                                  */
/* -------------------------------------------------------------------------- */

/// Configuration options for a `World`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub gravity: Vec3,
    /// Per-second angular velocity retention in [0, 1].
    pub angular_damping: Real,
    /// Per-second linear velocity retention in [0, 1].
    pub linear_damping: Real,
    /// Solver iterations for islands with more than three members.
    pub iterations: usize,
    /// Solver iterations for small islands.
    pub small_iterations: usize,
    /// Squared angular speed below which a body counts as resting.
    pub angular_inactivity_threshold: Real,
    /// Squared linear speed below which a body counts as resting.
    pub linear_inactivity_threshold: Real,
    /// Seconds an island has to rest before it sleeps.
    pub deactivation_time: Real,
    pub allow_deactivation: bool,
    /// Sweep every body's bounding box along its motion.
    pub speculative_contacts: bool,
    /// Worker threads for multithreaded steps (0 = available parallelism).
    pub threads: usize,
    /// Optional cap on simultaneously live arbiters.
    pub max_arbiters: Option<usize>,
    pub contact: ContactSettings,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            angular_damping: 0.85,
            linear_damping: 0.85,
            iterations: 10,
            small_iterations: 4,
            angular_inactivity_threshold: 0.1 * 0.1,
            linear_inactivity_threshold: 0.1 * 0.1,
            deactivation_time: 2.0,
            allow_deactivation: true,
            speculative_contacts: false,
            threads: 0,
            max_arbiters: None,
            contact: ContactSettings::default(),
        }
    }
}

impl WorldConfig {
    /// Parse and validate a JSON configuration. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> PhysicsResult<Self> {
        let config: WorldConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> PhysicsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> PhysicsResult<()> {
        if !self.gravity.is_finite() {
            return Err(PhysicsError::invalid_parameter("gravity", "must be finite"));
        }
        if !(0.0..=1.0).contains(&self.angular_damping) {
            return Err(PhysicsError::invalid_parameter("angular_damping", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.linear_damping) {
            return Err(PhysicsError::invalid_parameter("linear_damping", "must be in [0, 1]"));
        }
        if self.iterations == 0 || self.small_iterations == 0 {
            return Err(PhysicsError::invalid_parameter("iterations", "must be >= 1"));
        }
        if !(self.angular_inactivity_threshold >= 0.0 && self.linear_inactivity_threshold >= 0.0) {
            return Err(PhysicsError::invalid_parameter("inactivity_threshold", "must be >= 0"));
        }
        if !(self.deactivation_time >= 0.0) {
            return Err(PhysicsError::invalid_parameter("deactivation_time", "must be >= 0"));
        }
        if self.max_arbiters == Some(0) {
            return Err(PhysicsError::invalid_parameter("max_arbiters", "must be >= 1"));
        }
        self.contact.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = WorldConfig::default();
        assert_eq!(c.gravity, Vec3::new(0.0, -9.81, 0.0));
        assert_eq!(c.iterations, 10);
        assert_eq!(c.small_iterations, 4);
        assert!((c.linear_inactivity_threshold - 0.01).abs() < 1e-7);
        assert_eq!(c.deactivation_time, 2.0);
        assert_eq!(c.contact.maximum_bias, 10.0);
        assert_eq!(c.contact.bias_factor, 0.25);
        assert_eq!(c.contact.material_mixing, MaterialCoefficientMixing::TakeMaximum);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c = WorldConfig::from_json(
            r#"{ "iterations": 20, "contact": { "break_threshold": 0.05 } }"#,
        )
        .unwrap();
        assert_eq!(c.iterations, 20);
        assert_eq!(c.small_iterations, 4);
        assert_eq!(c.contact.break_threshold, 0.05);
        assert_eq!(c.contact.allowed_penetration, 0.01);
    }

    #[test]
    fn test_json_round_trip() {
        let mut c = WorldConfig::default();
        c.max_arbiters = Some(128);
        c.contact.material_mixing = MaterialCoefficientMixing::UseAverage;
        let back = WorldConfig::from_json(&c.to_json().unwrap()).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            WorldConfig::from_json(r#"{ "linear_damping": 1.5 }"#),
            Err(PhysicsError::InvalidParameter { name: "linear_damping", .. })
        ));
        assert!(matches!(
            WorldConfig::from_json(r#"{ "iterations": 0 }"#),
            Err(PhysicsError::InvalidParameter { .. })
        ));
        assert!(matches!(
            WorldConfig::from_json("{ not json"),
            Err(PhysicsError::Config(_))
        ));
    }
}
