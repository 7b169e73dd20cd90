use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use insightwatch_core::{AppConfig, CoreError, DataPaths, ProcessError};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::health_source::{HealthReading, HealthSource};
use crate::logs::LogTail;
use crate::process::{LaunchSpec, ProcessIdentity, ProcessTable, ResourceUsage, Termination};
use crate::record::ServiceRecord;

#[derive(Debug, Clone, Copy)]
pub struct ControlTimings {
    /// How long a gracefully signalled process gets before SIGKILL.
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
    /// How long to wait for a SIGKILLed process to disappear.
    pub kill_wait: Duration,
    /// A freshly launched daemon must still be alive after this.
    pub start_grace: Duration,
}

impl Default for ControlTimings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            kill_wait: Duration::from_secs(2),
            start_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32, forced: bool },
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartOutcome {
    pub stopped: StopOutcome,
    pub started: StartOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Liveness {
    Running {
        pid: u32,
        usage: Option<ResourceUsage>,
    },
    /// The service record names a process that is gone or is no longer the daemon.
    Stale { pid: u32 },
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub liveness: Liveness,
    pub record: Option<ServiceRecord>,
    pub health: Option<HealthReading>,
}

impl StatusReport {
    pub fn is_running(&self) -> bool {
        matches!(self.liveness, Liveness::Running { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub terminated: Vec<u32>,
    pub unkillable: Vec<u32>,
    pub record_removed: bool,
}

impl CleanupReport {
    pub fn is_noop(&self) -> bool {
        self.terminated.is_empty() && self.unkillable.is_empty() && !self.record_removed
    }
}

/// Operator-side lifecycle management of the daemon process.
///
/// Talks to the daemon only through the process table, the service record
/// and the health source.
pub struct Controller {
    config: AppConfig,
    paths: DataPaths,
    launch: LaunchSpec,
    identity: ProcessIdentity,
    processes: Arc<dyn ProcessTable>,
    health: Arc<dyn HealthSource>,
    timings: ControlTimings,
}

impl Controller {
    pub fn new(
        config: AppConfig,
        launch: LaunchSpec,
        identity: ProcessIdentity,
        processes: Arc<dyn ProcessTable>,
        health: Arc<dyn HealthSource>,
    ) -> Self {
        let paths = config.paths();
        Self {
            config,
            paths,
            launch,
            identity,
            processes,
            health,
            timings: ControlTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: ControlTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn log_file(&self) -> &PathBuf {
        &self.paths.log
    }

    pub async fn start(&self) -> Result<StartOutcome, CoreError> {
        if let Some(record) = ServiceRecord::load(&self.paths.service_record)? {
            if self.is_service_process(record.pid) {
                info!(pid = record.pid, "Service already running");
                return Ok(StartOutcome::AlreadyRunning { pid: record.pid });
            }
            warn!(pid = record.pid, "Discarding stale service record");
            ServiceRecord::remove(&self.paths.service_record)?;
        }

        self.config.credentials()?;
        self.reclaim_port().await?;

        let pid = self.processes.launch(&self.launch)?;
        let record = ServiceRecord {
            pid,
            port: self.config.api_port,
            started_at: Utc::now(),
            command: self.launch.command_line(),
        };
        record.save(&self.paths.service_record)?;
        info!(pid, "Service launched, waiting for it to settle");

        sleep(self.timings.start_grace).await;
        if !self.processes.is_alive(pid) {
            ServiceRecord::remove(&self.paths.service_record)?;
            return Err(ProcessError::StartFailed {
                pid,
                log_file: self.paths.log.display().to_string(),
            }
            .into());
        }

        info!(pid, port = self.config.api_port, "Service started");
        Ok(StartOutcome::Started { pid })
    }

    pub async fn stop(&self) -> Result<StopOutcome, CoreError> {
        let Some(record) = ServiceRecord::load(&self.paths.service_record)? else {
            return Ok(StopOutcome::NotRunning);
        };

        if !self.is_service_process(record.pid) {
            warn!(pid = record.pid, "Service record is stale, not signalling");
            ServiceRecord::remove(&self.paths.service_record)?;
            return Ok(StopOutcome::NotRunning);
        }

        let forced = self.terminate(record.pid).await?;
        ServiceRecord::remove(&self.paths.service_record)?;
        info!(pid = record.pid, forced, "Service stopped");
        Ok(StopOutcome::Stopped {
            pid: record.pid,
            forced,
        })
    }

    pub async fn restart(&self) -> Result<RestartOutcome, CoreError> {
        let stopped = self.stop().await?;
        let started = self.start().await?;
        Ok(RestartOutcome { stopped, started })
    }

    pub async fn status(&self) -> Result<StatusReport, CoreError> {
        let record = ServiceRecord::load(&self.paths.service_record)?;
        let liveness = match &record {
            Some(record) if self.is_service_process(record.pid) => Liveness::Running {
                pid: record.pid,
                usage: self.usage(record.pid).await,
            },
            Some(record) => Liveness::Stale { pid: record.pid },
            None => Liveness::NotRunning,
        };
        let health = self.health.fetch().await;

        Ok(StatusReport {
            liveness,
            record,
            health,
        })
    }

    /// Terminate everything that looks like the service or holds its port,
    /// then drop the service record. Safe to run when nothing is there.
    pub async fn cleanup(&self) -> Result<CleanupReport, CoreError> {
        let own_pid = std::process::id();
        let mut targets = self.processes.find_matching(&self.identity);
        targets.extend(self.processes.port_listeners(self.config.api_port));
        targets.retain(|pid| *pid != own_pid);
        targets.sort_unstable();
        targets.dedup();

        let mut report = CleanupReport::default();
        for pid in targets {
            match self.terminate(pid).await {
                Ok(_) => report.terminated.push(pid),
                Err(e) => {
                    warn!(pid, "Cleanup could not terminate process: {}", e);
                    report.unkillable.push(pid);
                }
            }
        }

        report.record_removed = match ServiceRecord::remove(&self.paths.service_record) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Could not remove service record: {}", e);
                false
            }
        };

        info!(
            terminated = report.terminated.len(),
            unkillable = report.unkillable.len(),
            record_removed = report.record_removed,
            "Cleanup finished"
        );
        Ok(report)
    }

    pub fn log_tail(&self) -> LogTail {
        LogTail::new(&self.paths.log)
    }

    /// The pid is alive and still runs the daemon. A reused pid does not count.
    fn is_service_process(&self, pid: u32) -> bool {
        self.processes.is_alive(pid)
            && self
                .processes
                .command(pid)
                .is_some_and(|command| self.identity.matches(&command))
    }

    async fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        let processes = self.processes.clone();
        match tokio::task::spawn_blocking(move || processes.usage(pid)).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(pid, "Resource usage lookup failed: {}", e);
                None
            }
        }
    }

    /// Terminate any listener on the API port. Fails if one survives.
    async fn reclaim_port(&self) -> Result<(), CoreError> {
        let own_pid = std::process::id();
        let port = self.config.api_port;
        let occupants: Vec<u32> = self
            .processes
            .port_listeners(port)
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        for pid in &occupants {
            warn!(pid, port, "Reclaiming port from running process");
            if let Err(e) = self.terminate(*pid).await {
                warn!(pid, "Port occupant survived: {}", e);
            }
        }

        let remaining: Vec<u32> = self
            .processes
            .port_listeners(port)
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::Conflict {
                port,
                pids: remaining,
            }
            .into())
        }
    }

    /// SIGTERM, wait, then SIGKILL. Returns whether the kill was forced.
    async fn terminate(&self, pid: u32) -> Result<bool, ProcessError> {
        if !self.processes.terminate(pid, Termination::Graceful) {
            return Ok(false);
        }
        if self.wait_for_exit(pid, self.timings.stop_timeout).await {
            return Ok(false);
        }

        warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
        self.processes.terminate(pid, Termination::Forced);
        if self.wait_for_exit(pid, self.timings.kill_wait).await {
            Ok(true)
        } else {
            Err(ProcessError::Unkillable { pid })
        }
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.processes.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval).await;
        }
    }
}
