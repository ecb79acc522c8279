//! Flat-Earth local tangent-plane projection
//!
//! Good for sessions spanning tens of kilometers; no ellipsoid or curvature
//! correction is attempted.

use serde::{Deserialize, Serialize};

use crate::types::{GpsFix, Vec3};

/// Mean Earth radius [m]
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Project `fix` into East/North/Up meters relative to `reference`.
///
/// `project(r, r)` is exactly zero.
pub fn project(fix: &GpsFix, reference: &GpsFix) -> Vec3 {
    let (east, north) = latlon_to_meters(
        fix.latitude,
        fix.longitude,
        reference.latitude,
        reference.longitude,
    );
    Vec3::new(east, north, fix.altitude - reference.altitude)
}

/// Inverse of [`project`]: local ENU meters back to (lat, lon, alt).
pub fn unproject(local: &Vec3, reference: &GpsFix) -> (f64, f64, f64) {
    let (lat, lon) = meters_to_latlon(local.x, local.y, reference.latitude, reference.longitude);
    (lat, lon, reference.altitude + local.z)
}

fn latlon_to_meters(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let d_lat = (lat - origin_lat).to_radians();
    let d_lon = (lon - origin_lon).to_radians();
    let x = EARTH_RADIUS_M * d_lon * origin_lat.to_radians().cos();
    let y = EARTH_RADIUS_M * d_lat;
    (x, y)
}

fn meters_to_latlon(x: f64, y: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let d_lat = y / EARTH_RADIUS_M;
    let d_lon = x / (EARTH_RADIUS_M * origin_lat.to_radians().cos());
    (origin_lat + d_lat.to_degrees(), origin_lon + d_lon.to_degrees())
}

/// Great-circle distance in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

/// Origin of a session's local tangent plane: the first valid fix.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFix {
    fix: GpsFix,
}

impl ReferenceFix {
    /// `None` for the (0, 0) sentinel or non-finite coordinates.
    pub fn new(fix: GpsFix) -> Option<Self> {
        fix.is_valid().then_some(Self { fix })
    }

    pub fn fix(&self) -> &GpsFix {
        &self.fix
    }

    pub fn project(&self, fix: &GpsFix) -> Vec3 {
        project(fix, &self.fix)
    }

    pub fn unproject(&self, local: &Vec3) -> (f64, f64, f64) {
        unproject(local, &self.fix)
    }
}
