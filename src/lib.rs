//! roadtag_fusion: inertial/GPS sensor fusion and dead reckoning for
//! recorded road sessions.
//!
//! Live path: [`pipeline::spawn_fusion`] owns a [`session::Session`] and
//! feeds [`sensor_fusion::SensorFusion`] (attitude, strapdown, GPS aiding).
//! Offline path: [`batch::BatchRecompute`] reprocesses the buffered session
//! with a drift-corrected heading.

pub mod batch;
pub mod error;
pub mod filters;
pub mod geodetic;
pub mod pipeline;
pub mod rate_limit;
pub mod sensor_fusion;
pub mod session;
pub mod storage;
pub mod types;

pub use batch::{BatchOutput, BatchRecompute};
pub use error::{FusionError, FusionResult};
pub use pipeline::{spawn_fusion, FusionHandle, FusionInput, MemorySink, RecordSink};
pub use sensor_fusion::{FusionConfig, FusionEvent, SensorFusion};
pub use session::{Session, SessionBuffer, SessionState};
pub use types::{GpsFix, NavigationState, Orientation, SensorKind, SensorSample};
