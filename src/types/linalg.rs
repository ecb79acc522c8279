//! Linear algebra aliases and angle helpers for the fusion core
//!
//! Everything runs in f64 on nalgebra's static types; the aliases keep
//! signatures short across the filters.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use std::f64::consts::{PI, TAU};

// ===== Vector / rotation types =====
pub type Vec3 = Vector3<f64>;
pub type Mat3 = Matrix3<f64>;
pub type Quat = UnitQuaternion<f64>;

/// World-frame vertical axis (z up).
pub fn world_up() -> Vec3 {
    Vec3::z()
}

/// Wrap an angle into [0, 2π).
pub fn wrap_two_pi(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Wrap an angle into [-π, π).
pub fn wrap_pi(angle: f64) -> f64 {
    wrap_two_pi(angle + PI) - PI
}

/// True when every component is finite.
pub fn is_finite_vec(v: &Vec3) -> bool {
    v.iter().all(|c| c.is_finite())
}
