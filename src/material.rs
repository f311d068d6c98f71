// src/material.rs
//! Surface materials and the rule used to combine two of them at a contact.

use crate::math::Real;
use serde::{Deserialize, Serialize};

/// Physics material properties attached to every body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Material {
    /// Friction coefficient while the contact sticks.
    pub static_friction: Real,
    /// Friction coefficient while the contact slides.
    pub kinetic_friction: Real,
    /// Restitution/bounciness (0.0 = no bounce, 1.0 = full bounce)
    pub restitution: Real,
}

impl Material {
    /// Create a new physics material
    pub fn new(static_friction: Real, kinetic_friction: Real, restitution: Real) -> Self {
        Self {
            static_friction,
            kinetic_friction,
            restitution,
        }
    }

    /// Create a slippery material
    pub fn slippery() -> Self {
        Self::new(0.1, 0.05, 0.1)
    }

    /// Create a bouncy material
    pub fn bouncy() -> Self {
        Self::new(0.5, 0.3, 0.9)
    }

    /// Create a sticky material
    pub fn sticky() -> Self {
        Self::new(0.9, 0.8, 0.0)
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new(0.6, 0.3, 0.0)
    }
}

/// How friction and restitution of two materials are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaterialCoefficientMixing {
    #[default]
    TakeMaximum,
    TakeMinimum,
    UseAverage,
}

/// Coefficients used by one contact, fixed when the contact is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixedCoefficients {
    pub static_friction: Real,
    pub dynamic_friction: Real,
    pub restitution: Real,
}

impl MaterialCoefficientMixing {
    #[inline(always)]
    fn combine(self, a: Real, b: Real) -> Real {
        match self {
            Self::TakeMaximum => a.max(b),
            Self::TakeMinimum => a.min(b),
            Self::UseAverage => (a + b) * 0.5,
        }
    }

    pub fn mix(self, a: &Material, b: &Material) -> MixedCoefficients {
        MixedCoefficients {
            static_friction: self.combine(a.static_friction, b.static_friction),
            dynamic_friction: self.combine(a.kinetic_friction, b.kinetic_friction),
            restitution: self.combine(a.restitution, b.restitution),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_material() {
        let m = Material::default();
        assert_eq!(m.static_friction, 0.6);
        assert_eq!(m.kinetic_friction, 0.3);
        assert_eq!(m.restitution, 0.0);
    }

    #[test]
    fn test_mixing_rules() {
        let a = Material::new(0.2, 0.1, 1.0);
        let b = Material::new(0.8, 0.5, 0.0);

        let max = MaterialCoefficientMixing::TakeMaximum.mix(&a, &b);
        assert_eq!(max.static_friction, 0.8);
        assert_eq!(max.dynamic_friction, 0.5);
        assert_eq!(max.restitution, 1.0);

        let min = MaterialCoefficientMixing::TakeMinimum.mix(&a, &b);
        assert_eq!(min.static_friction, 0.2);
        assert_eq!(min.restitution, 0.0);

        let avg = MaterialCoefficientMixing::UseAverage.mix(&a, &b);
        assert!((avg.static_friction - 0.5).abs() < 1e-6);
        assert!((avg.dynamic_friction - 0.3).abs() < 1e-6);
        assert!((avg.restitution - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mixing_is_symmetric() {
        let a = Material::bouncy();
        let b = Material::sticky();
        for rule in [
            MaterialCoefficientMixing::TakeMaximum,
            MaterialCoefficientMixing::TakeMinimum,
            MaterialCoefficientMixing::UseAverage,
        ] {
            assert_eq!(rule.mix(&a, &b), rule.mix(&b, &a));
        }
    }
}
