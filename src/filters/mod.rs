pub mod attitude;
pub mod gps_aided;
pub mod strapdown;

pub use attitude::{AttitudeEstimator, AttitudeParams, AttitudeUpdate, HeadingMode};
pub use gps_aided::{CorrectionOutcome, GpsCorrector};
pub use strapdown::{StrapdownIntegrator, StrapdownStep};
