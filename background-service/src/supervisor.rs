use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use insightwatch_core::{ErrorExt, RunOutcome};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::digest;
use crate::health::HealthReporter;
use crate::notify::Notifier;
use crate::pipeline::MonitoringPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// First run not yet finished.
    Starting,
    Running,
    /// Termination requested; an in-flight run is allowed to finish.
    Stopping,
    Stopped,
}

impl SupervisorState {
    fn is_winding_down(self) -> bool {
        matches!(self, SupervisorState::Stopping | SupervisorState::Stopped)
    }
}

/// Control side of a [`Supervisor`]; cheap to clone.
#[derive(Clone)]
pub struct SupervisorHandle {
    state: Arc<watch::Sender<SupervisorState>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Ask the loop to stop. A run already executing is not interrupted.
    pub fn request_stop(&self) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_winding_down() {
                false
            } else {
                *state = SupervisorState::Stopping;
                true
            }
        });
        if changed {
            info!("Stop requested");
        }
    }

    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SupervisorState::Stopped).await;
    }
}

/// Runs the monitoring pipeline on a fixed interval, one run at a time.
pub struct Supervisor {
    pipeline: MonitoringPipeline,
    health: Arc<RwLock<HealthReporter>>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    digest_dir: Option<PathBuf>,
    state: Arc<watch::Sender<SupervisorState>>,
}

impl Supervisor {
    pub fn new(
        pipeline: MonitoringPipeline,
        health: Arc<RwLock<HealthReporter>>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> (Self, SupervisorHandle) {
        let (tx, _rx) = watch::channel(SupervisorState::Starting);
        let state = Arc::new(tx);
        let handle = SupervisorHandle {
            state: state.clone(),
        };

        let supervisor = Self {
            pipeline,
            health,
            notifier,
            interval,
            digest_dir: None,
            state,
        };
        (supervisor, handle)
    }

    /// Write a digest file after every run that accepted something.
    pub fn with_digest_dir(mut self, dir: PathBuf) -> Self {
        self.digest_dir = Some(dir);
        self
    }

    /// Drive the loop until a stop is requested and the current run has finished.
    pub async fn run(self) {
        info!(
            source = %self.pipeline.source(),
            interval_secs = self.interval.as_secs(),
            "Supervisor started"
        );

        let mut state_rx = self.state.subscribe();
        loop {
            if self.current_state().is_winding_down() {
                break;
            }

            let outcome = self.pipeline.run_once().await;
            self.after_run(&outcome).await;

            self.state.send_if_modified(|state| {
                if *state == SupervisorState::Starting {
                    *state = SupervisorState::Running;
                    true
                } else {
                    false
                }
            });

            if self.current_state().is_winding_down() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = async {
                    let _ = state_rx.wait_for(|state| state.is_winding_down()).await;
                } => {}
            }
        }

        self.state.send_replace(SupervisorState::Stopping);
        self.health.write().await.mark_stopped(Utc::now());
        self.state.send_replace(SupervisorState::Stopped);
        info!("Supervisor stopped");
    }

    fn current_state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    async fn after_run(&self, outcome: &RunOutcome) {
        self.health.write().await.update(outcome, Utc::now());

        if outcome.accepted.is_empty() {
            return;
        }

        if let Some(dir) = &self.digest_dir {
            let now = Utc::now();
            let text = digest::render(self.pipeline.source(), &outcome.accepted, now);
            if let Err(e) = digest::write_digest(dir, &digest::run_file_name(now), &text) {
                warn!("Failed to write digest: {}", e);
            }
        }

        if let Err(e) = self
            .notifier
            .notify(self.pipeline.source(), &outcome.accepted)
            .await
        {
            e.log_warn();
        }
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
