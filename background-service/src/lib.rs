pub mod digest;
pub mod health;
pub mod notify;
pub mod pipeline;
pub mod server;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use health::HealthReporter;
pub use notify::{DesktopNotifier, NoopNotifier, Notifier};
pub use pipeline::MonitoringPipeline;
pub use server::{build_router, ApiState, HealthResponse, InsightsResponse};
pub use supervisor::{shutdown_signal, Supervisor, SupervisorHandle, SupervisorState};
