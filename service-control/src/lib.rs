pub mod controller;
pub mod health_source;
pub mod logs;
pub mod process;
pub mod record;

pub use controller::{
    CleanupReport, ControlTimings, Controller, Liveness, RestartOutcome, StartOutcome,
    StatusReport, StopOutcome,
};
pub use health_source::{HealthOrigin, HealthReading, HealthSource, HttpHealthSource};
pub use logs::LogTail;
pub use process::{
    LaunchSpec, ProcessIdentity, ProcessTable, ResourceUsage, SystemProcessTable, Termination,
};
pub use record::ServiceRecord;
