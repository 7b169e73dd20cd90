//! OS process table access: liveness, signals, port owners, launching.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use insightwatch_core::ProcessError;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// How the daemon process is recognised in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub program: String,
    pub subcommand: String,
}

impl ProcessIdentity {
    pub fn new(program: impl Into<String>, subcommand: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            subcommand: subcommand.into(),
        }
    }

    /// True when `command` runs our program with the daemon subcommand.
    pub fn matches<S: AsRef<str>>(&self, command: &[S]) -> bool {
        let mut args = command.iter().map(AsRef::as_ref);
        let Some(first) = args.next() else {
            return false;
        };

        let program_matches = |arg: &str| {
            Path::new(arg)
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name == self.program)
        };

        // Interpreted launches put the program in a later argument.
        let mut has_program = program_matches(first);
        let mut has_subcommand = false;
        for arg in args {
            has_program |= program_matches(arg);
            has_subcommand |= arg == self.subcommand;
        }
        has_program && has_subcommand
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_file: PathBuf,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

pub trait ProcessTable: Send + Sync {
    /// Present and not a zombie.
    fn is_alive(&self, pid: u32) -> bool;

    /// Returns false when the process was already gone.
    fn terminate(&self, pid: u32, how: Termination) -> bool;

    /// Command line of a live process.
    fn command(&self, pid: u32) -> Option<Vec<String>>;

    fn find_matching(&self, identity: &ProcessIdentity) -> Vec<u32>;

    fn port_listeners(&self, port: u16) -> Vec<u32>;

    fn usage(&self, pid: u32) -> Option<ResourceUsage>;

    /// Start a detached process with output appended to the log file.
    fn launch(&self, spec: &LaunchSpec) -> Result<u32, ProcessError>;
}

/// [`ProcessTable`] backed by sysinfo and `lsof`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, System> {
        match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_process<T>(
        &self,
        pid: u32,
        refresh: ProcessRefreshKind,
        f: impl FnOnce(Option<&sysinfo::Process>) -> T,
    ) -> T {
        let pid = Pid::from_u32(pid);
        let mut system = self.lock();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
        f(system.process(pid))
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        self.with_process(pid, ProcessRefreshKind::new(), |process| {
            process.is_some_and(|p| p.status() != ProcessStatus::Zombie)
        })
    }

    fn terminate(&self, pid: u32, how: Termination) -> bool {
        self.with_process(pid, ProcessRefreshKind::new(), |process| {
            let Some(process) = process else {
                return false;
            };
            debug!(pid, ?how, "Signalling process");
            match how {
                Termination::Graceful => process
                    .kill_with(sysinfo::Signal::Term)
                    .unwrap_or_else(|| process.kill()),
                Termination::Forced => process.kill(),
            }
        })
    }

    fn command(&self, pid: u32) -> Option<Vec<String>> {
        let refresh = ProcessRefreshKind::new().with_cmd(UpdateKind::Always);
        self.with_process(pid, refresh, |process| {
            process
                .filter(|p| p.status() != ProcessStatus::Zombie)
                .map(|p| {
                    p.cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect()
                })
        })
    }

    fn find_matching(&self, identity: &ProcessIdentity) -> Vec<u32> {
        let own_pid = std::process::id();
        let mut system = self.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter(|(_, process)| {
                let command: Vec<String> = process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect();
                identity.matches(&command)
            })
            .map(|(pid, _)| pid.as_u32())
            .filter(|pid| *pid != own_pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    fn port_listeners(&self, port: u16) -> Vec<u32> {
        let output = Command::new("lsof")
            .args(["-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .stderr(Stdio::null())
            .output();

        match output {
            Ok(output) => parse_pid_list(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                warn!("Could not run lsof to inspect port {}: {}", port, e);
                Vec::new()
            }
        }
    }

    /// Blocks for [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`]; CPU usage is the
    /// difference between two samples.
    fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        let refresh = ProcessRefreshKind::new().with_cpu().with_memory();
        let pid = Pid::from_u32(pid);
        let mut system = self.lock();

        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
        system.process(pid)?;
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);

        system.process(pid).map(|p| ResourceUsage {
            memory_bytes: p.memory(),
            cpu_percent: p.cpu_usage(),
        })
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<u32, ProcessError> {
        let launch_failed = |reason: String| ProcessError::LaunchFailed { reason };

        if let Some(parent) = spec.log_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| launch_failed(format!("{}: {e}", parent.display())))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .map_err(|e| launch_failed(format!("{}: {e}", spec.log_file.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| launch_failed(e.to_string()))?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command
            .spawn()
            .map_err(|e| launch_failed(format!("{}: {e}", spec.program.display())))?;
        Ok(child.id())
    }
}

fn parse_pid_list(raw: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = raw
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
