use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use insightwatch_core::{AppConfig, ConfigError, CoreError, HealthRecord, ProcessError};
use service_control::{
    ControlTimings, Controller, HealthOrigin, HealthReading, HealthSource, LaunchSpec, Liveness,
    ProcessIdentity, ProcessTable, ResourceUsage, ServiceRecord, StartOutcome, StopOutcome,
    Termination,
};

#[derive(Debug, Clone)]
struct FakeProcess {
    command: Vec<String>,
    listening_on: Option<u16>,
    ignores_sigterm: bool,
    /// Survives SIGKILL too.
    unkillable: bool,
}

#[derive(Default)]
struct FakeTable {
    processes: Mutex<HashMap<u32, FakeProcess>>,
    next_pid: Mutex<u32>,
    launches: Mutex<usize>,
    /// Launched processes die immediately.
    crash_on_launch: Mutex<bool>,
    signals: Mutex<Vec<(u32, Termination)>>,
}

impl FakeTable {
    fn spawn(&self, process: FakeProcess) -> u32 {
        let mut next = self.next_pid.lock().unwrap();
        *next += 1;
        let pid = 1000 + *next;
        self.processes.lock().unwrap().insert(pid, process);
        pid
    }

    fn live_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }
}

impl ProcessTable for FakeTable {
    fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().unwrap().contains_key(&pid)
    }

    fn terminate(&self, pid: u32, how: Termination) -> bool {
        self.signals.lock().unwrap().push((pid, how));
        let mut processes = self.processes.lock().unwrap();
        let Some(process) = processes.get(&pid) else {
            return false;
        };
        if process.unkillable {
            return true;
        }
        if how == Termination::Forced || !process.ignores_sigterm {
            processes.remove(&pid);
        }
        true
    }

    fn command(&self, pid: u32) -> Option<Vec<String>> {
        self.processes
            .lock()
            .unwrap()
            .get(&pid)
            .map(|p| p.command.clone())
    }

    fn find_matching(&self, identity: &ProcessIdentity) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| identity.matches(&p.command))
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    fn port_listeners(&self, port: u16) -> Vec<u32> {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.listening_on == Some(port))
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        self.is_alive(pid).then_some(ResourceUsage {
            memory_bytes: 32 * 1024 * 1024,
            cpu_percent: 0.5,
        })
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<u32, ProcessError> {
        *self.launches.lock().unwrap() += 1;
        let pid = self.spawn(FakeProcess {
            command: spec.command_line(),
            listening_on: Some(8080),
            ignores_sigterm: false,
            unkillable: false,
        });
        if *self.crash_on_launch.lock().unwrap() {
            self.processes.lock().unwrap().remove(&pid);
        }
        Ok(pid)
    }
}

struct FixedHealth(Option<HealthRecord>);

#[async_trait]
impl HealthSource for FixedHealth {
    async fn fetch(&self) -> Option<HealthReading> {
        self.0.clone().map(|record| HealthReading {
            record,
            origin: HealthOrigin::Snapshot,
        })
    }
}

fn config(data_dir: &Path) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        reddit_client_id: Some("id".to_string()),
        reddit_client_secret: Some("secret".to_string()),
        ..AppConfig::default()
    }
}

fn timings() -> ControlTimings {
    ControlTimings {
        stop_timeout: Duration::from_millis(40),
        poll_interval: Duration::from_millis(5),
        kill_wait: Duration::from_millis(20),
        start_grace: Duration::from_millis(10),
    }
}

fn controller(config: AppConfig, table: Arc<FakeTable>) -> Controller {
    let launch = LaunchSpec {
        program: "/opt/insightwatch/bin/insightwatch".into(),
        args: vec!["run".to_string()],
        log_file: config.paths().log,
        working_dir: None,
    };
    Controller::new(
        config,
        launch,
        ProcessIdentity::new("insightwatch", "run"),
        table,
        Arc::new(FixedHealth(Some(HealthRecord::new(Utc::now())))),
    )
    .with_timings(timings())
}

#[tokio::test]
async fn test_start_twice_leaves_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let controller = controller(config(dir.path()), table.clone());

    let first = controller.start().await.unwrap();
    let StartOutcome::Started { pid } = first else {
        panic!("expected a fresh start, got {first:?}");
    };

    let second = controller.start().await.unwrap();
    assert_eq!(second, StartOutcome::AlreadyRunning { pid });
    assert_eq!(*table.launches.lock().unwrap(), 1);
    assert_eq!(table.live_count(), 1);

    let record = ServiceRecord::load(&dir.path().join("service.json"))
        .unwrap()
        .unwrap();
    assert_eq!(record.pid, pid);
    assert_eq!(record.port, 8080);
}

#[tokio::test]
async fn test_stop_then_status() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let controller = controller(config(dir.path()), table.clone());

    let StartOutcome::Started { pid } = controller.start().await.unwrap() else {
        panic!("expected a fresh start");
    };
    let status = controller.status().await.unwrap();
    assert!(status.is_running());
    assert!(matches!(
        status.liveness,
        Liveness::Running { usage: Some(_), .. }
    ));

    let stopped = controller.stop().await.unwrap();
    assert_eq!(stopped, StopOutcome::Stopped { pid, forced: false });

    let status = controller.status().await.unwrap();
    assert_eq!(status.liveness, Liveness::NotRunning);
    assert!(status.record.is_none());
    assert!(status.health.is_some());
    assert!(!dir.path().join("service.json").exists());

    assert_eq!(controller.stop().await.unwrap(), StopOutcome::NotRunning);
}

#[tokio::test]
async fn test_stop_escalates_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let pid = table.spawn(FakeProcess {
        command: vec!["insightwatch".to_string(), "run".to_string()],
        listening_on: Some(8080),
        ignores_sigterm: true,
        unkillable: false,
    });
    ServiceRecord {
        pid,
        port: 8080,
        started_at: Utc::now(),
        command: vec!["insightwatch".to_string(), "run".to_string()],
    }
    .save(&dir.path().join("service.json"))
    .unwrap();

    let controller = controller(config(dir.path()), table.clone());
    let stopped = controller.stop().await.unwrap();
    assert_eq!(stopped, StopOutcome::Stopped { pid, forced: true });
    assert_eq!(
        *table.signals.lock().unwrap(),
        vec![(pid, Termination::Graceful), (pid, Termination::Forced)]
    );
    assert_eq!(table.live_count(), 0);
}

#[tokio::test]
async fn test_stale_record_is_discarded_on_start() {
    let dir = tempfile::tempdir().unwrap();
    ServiceRecord {
        pid: 99_999,
        port: 8080,
        started_at: Utc::now(),
        command: vec!["insightwatch".to_string(), "run".to_string()],
    }
    .save(&dir.path().join("service.json"))
    .unwrap();

    let table = Arc::new(FakeTable::default());
    let controller = controller(config(dir.path()), table.clone());

    let status = controller.status().await.unwrap();
    assert_eq!(status.liveness, Liveness::Stale { pid: 99_999 });

    let started = controller.start().await.unwrap();
    assert!(matches!(started, StartOutcome::Started { pid } if pid != 99_999));
}

#[tokio::test]
async fn test_missing_credentials_block_start_before_touching_port() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let squatter = table.spawn(FakeProcess {
        command: vec!["python".to_string(), "server.py".to_string()],
        listening_on: Some(8080),
        ignores_sigterm: false,
        unkillable: false,
    });

    let config = AppConfig {
        reddit_client_secret: None,
        ..config(dir.path())
    };
    let controller = controller(config, table.clone());

    let err = controller.start().await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Config(ConfigError::MissingEnvironmentVariable { .. })
    ));
    assert!(table.is_alive(squatter));
    assert_eq!(*table.launches.lock().unwrap(), 0);
    assert!(!dir.path().join("service.json").exists());
}

#[tokio::test]
async fn test_start_reclaims_port() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let squatter = table.spawn(FakeProcess {
        command: vec!["python".to_string(), "server.py".to_string()],
        listening_on: Some(8080),
        ignores_sigterm: false,
        unkillable: false,
    });

    let controller = controller(config(dir.path()), table.clone());
    let started = controller.start().await.unwrap();
    assert!(matches!(started, StartOutcome::Started { .. }));
    assert!(!table.is_alive(squatter));
}

#[tokio::test]
async fn test_crash_during_startup_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    *table.crash_on_launch.lock().unwrap() = true;

    let controller = controller(config(dir.path()), table.clone());
    let err = controller.start().await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Process(ProcessError::StartFailed { .. })
    ));
    assert!(!dir.path().join("service.json").exists());
}

#[tokio::test]
async fn test_cleanup_when_idle_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let controller = controller(config(dir.path()), table);

    let report = controller.cleanup().await.unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_cleanup_kills_orphans_and_port_holders() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let orphan = table.spawn(FakeProcess {
        command: vec!["/usr/bin/insightwatch".to_string(), "run".to_string()],
        listening_on: None,
        ignores_sigterm: false,
        unkillable: false,
    });
    let holder = table.spawn(FakeProcess {
        command: vec!["node".to_string(), "app.js".to_string()],
        listening_on: Some(8080),
        ignores_sigterm: true,
        unkillable: false,
    });
    let bystander = table.spawn(FakeProcess {
        command: vec!["insightwatch".to_string(), "status".to_string()],
        listening_on: None,
        ignores_sigterm: false,
        unkillable: false,
    });
    ServiceRecord {
        pid: orphan,
        port: 8080,
        started_at: Utc::now(),
        command: vec!["insightwatch".to_string(), "run".to_string()],
    }
    .save(&dir.path().join("service.json"))
    .unwrap();

    let controller = controller(config(dir.path()), table.clone());
    let report = controller.cleanup().await.unwrap();

    let mut expected = vec![orphan, holder];
    expected.sort_unstable();
    assert_eq!(report.terminated, expected);
    assert!(report.unkillable.is_empty());
    assert!(report.record_removed);
    assert!(table.is_alive(bystander));
    assert_eq!(table.live_count(), 1);
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let controller = controller(config(dir.path()), table.clone());

    let StartOutcome::Started { pid: first } = controller.start().await.unwrap() else {
        panic!("expected a fresh start");
    };
    let outcome = controller.restart().await.unwrap();
    assert_eq!(
        outcome.stopped,
        StopOutcome::Stopped {
            pid: first,
            forced: false
        }
    );
    assert!(matches!(outcome.started, StartOutcome::Started { pid } if pid != first));
    assert_eq!(table.live_count(), 1);
}

#[tokio::test]
async fn test_reused_pid_is_never_signalled() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let stranger = table.spawn(FakeProcess {
        command: vec!["/usr/bin/postgres".to_string(), "-D".to_string(), "/var/lib/pg".to_string()],
        listening_on: None,
        ignores_sigterm: false,
        unkillable: false,
    });
    let record_path = dir.path().join("service.json");
    let save_record = || {
        ServiceRecord {
            pid: stranger,
            port: 8080,
            started_at: Utc::now(),
            command: vec!["insightwatch".to_string(), "run".to_string()],
        }
        .save(&record_path)
        .unwrap()
    };
    save_record();

    let controller = controller(config(dir.path()), table.clone());

    let status = controller.status().await.unwrap();
    assert_eq!(status.liveness, Liveness::Stale { pid: stranger });

    assert_eq!(controller.stop().await.unwrap(), StopOutcome::NotRunning);
    assert!(!record_path.exists());
    assert!(table.is_alive(stranger));

    save_record();
    let started = controller.start().await.unwrap();
    assert!(matches!(started, StartOutcome::Started { pid } if pid != stranger));
    assert_eq!(*table.launches.lock().unwrap(), 1);
    assert!(table.is_alive(stranger));
    assert!(table.signals.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unkillable_port_holder_blocks_start() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let holder = table.spawn(FakeProcess {
        command: vec!["node".to_string(), "app.js".to_string()],
        listening_on: Some(8080),
        ignores_sigterm: true,
        unkillable: true,
    });

    let controller = controller(config(dir.path()), table.clone());
    let err = controller.start().await.unwrap_err();
    match err {
        CoreError::Process(ProcessError::Conflict { port, pids }) => {
            assert_eq!(port, 8080);
            assert_eq!(pids, vec![holder]);
        }
        other => panic!("expected a port conflict, got {other:?}"),
    }
    assert_eq!(
        *table.signals.lock().unwrap(),
        vec![(holder, Termination::Graceful), (holder, Termination::Forced)]
    );
    assert_eq!(*table.launches.lock().unwrap(), 0);
    assert!(!dir.path().join("service.json").exists());
}

#[tokio::test]
async fn test_cleanup_reports_unkillable_process() {
    let dir = tempfile::tempdir().unwrap();
    let table = Arc::new(FakeTable::default());
    let stuck = table.spawn(FakeProcess {
        command: vec!["insightwatch".to_string(), "run".to_string()],
        listening_on: Some(8080),
        ignores_sigterm: true,
        unkillable: true,
    });
    let orphan = table.spawn(FakeProcess {
        command: vec!["insightwatch".to_string(), "run".to_string()],
        listening_on: None,
        ignores_sigterm: false,
        unkillable: false,
    });

    let controller = controller(config(dir.path()), table.clone());
    let report = controller.cleanup().await.unwrap();

    assert_eq!(report.terminated, vec![orphan]);
    assert_eq!(report.unkillable, vec![stuck]);
    assert!(!report.record_removed);
    assert!(!report.is_noop());
    assert!(table.is_alive(stuck));
}
