use log::{debug, info};

use crate::geodetic::ReferenceFix;
use crate::types::{GpsFix, NavigationState, Vec3};

/// Default position blend weight toward GPS
pub const GPS_ALPHA: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CorrectionOutcome {
    /// Sentinel or non-finite fix; state untouched
    Rejected,
    /// First valid fix became the local origin; state untouched
    ReferenceSet,
    /// State pulled toward `local` (ENU meters)
    Corrected { local: Vec3 },
}

/// Fixed-gain position blend toward GPS with velocity damping.
///
/// This is not a Kalman update: the gain ignores fix accuracy and the
/// velocity is damped rather than observed.
#[derive(Clone, Debug)]
pub struct GpsCorrector {
    alpha: f64,
    reference: Option<ReferenceFix>,
    accepted: u64,
    rejected: u64,
}

impl GpsCorrector {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            reference: None,
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn reference(&self) -> Option<&ReferenceFix> {
        self.reference.as_ref()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.accepted = 0;
        self.rejected = 0;
    }

    pub fn correct(&mut self, fix: &GpsFix, state: &mut NavigationState) -> CorrectionOutcome {
        if !fix.is_valid() {
            self.rejected += 1;
            debug!(
                "[gps] @{} rejected fix ({:.6}, {:.6})",
                fix.timestamp, fix.latitude, fix.longitude
            );
            return CorrectionOutcome::Rejected;
        }
        self.accepted += 1;

        let Some(reference) = self.reference.as_ref() else {
            self.reference = ReferenceFix::new(*fix);
            info!(
                "[gps] reference fix set: ({:.6}, {:.6}, {:.1} m)",
                fix.latitude, fix.longitude, fix.altitude
            );
            return CorrectionOutcome::ReferenceSet;
        };

        let local = reference.project(fix);
        apply_correction(&local, self.alpha, state);
        CorrectionOutcome::Corrected { local }
    }
}

impl Default for GpsCorrector {
    fn default() -> Self {
        Self::new(GPS_ALPHA)
    }
}

/// `p ← α·gps + (1-α)·p`, `v ← (1-α)·v`. Orientation is untouched.
pub fn apply_correction(local: &Vec3, alpha: f64, state: &mut NavigationState) {
    state.position = local * alpha + state.position * (1.0 - alpha);
    state.velocity *= 1.0 - alpha;
}
