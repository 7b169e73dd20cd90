//! Operator commands that manage the background daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use insightwatch_core::AppConfig;
use service_control::{
    Controller, HttpHealthSource, LaunchSpec, Liveness, ProcessIdentity, StartOutcome,
    StatusReport, StopOutcome, SystemProcessTable,
};

const DAEMON_SUBCOMMAND: &str = "run";

fn controller(config: AppConfig, config_path: Option<PathBuf>) -> Result<Controller> {
    let program = std::env::current_exe()?;
    let program_name = program
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("insightwatch")
        .to_string();

    let mut args = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    args.push(DAEMON_SUBCOMMAND.to_string());

    let paths = config.paths();
    let launch = LaunchSpec {
        program,
        args,
        log_file: paths.log.clone(),
        working_dir: std::env::current_dir().ok(),
    };
    let health = HttpHealthSource::new(config.api_port, paths.health);

    Ok(Controller::new(
        config,
        launch,
        ProcessIdentity::new(program_name, DAEMON_SUBCOMMAND),
        Arc::new(SystemProcessTable::new()),
        Arc::new(health),
    ))
}

pub async fn start(config: AppConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let port = config.api_port;
    let controller = controller(config, config_path)?;
    print_start(controller.start().await?, port, &controller);
    Ok(ExitCode::SUCCESS)
}

pub async fn stop(config: AppConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let controller = controller(config, config_path)?;
    print_stop(&controller.stop().await?);
    Ok(ExitCode::SUCCESS)
}

pub async fn restart(config: AppConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let port = config.api_port;
    let controller = controller(config, config_path)?;
    let outcome = controller.restart().await?;
    print_stop(&outcome.stopped);
    print_start(outcome.started, port, &controller);
    Ok(ExitCode::SUCCESS)
}

pub async fn status(config: AppConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let controller = controller(config, config_path)?;
    print_status(&controller.status().await?);
    Ok(ExitCode::SUCCESS)
}

pub async fn logs(
    config: AppConfig,
    config_path: Option<PathBuf>,
    lines: usize,
    follow: bool,
) -> Result<ExitCode> {
    let controller = controller(config, config_path)?;
    let mut tail = controller.log_tail();

    let recent = tail.last_lines(lines)?;
    if recent.is_empty() && !tail.path().exists() {
        println!("No log file at {}", tail.path().display());
    }
    for line in recent {
        println!("{line}");
    }

    if follow {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    let appended = tail.read_new()?;
                    if !appended.is_empty() {
                        print!("{appended}");
                    }
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn cleanup(config: AppConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let controller = controller(config, config_path)?;
    let report = controller.cleanup().await?;

    if report.is_noop() {
        println!("Nothing to clean up.");
        return Ok(ExitCode::SUCCESS);
    }
    for pid in &report.terminated {
        println!("Terminated process {pid}");
    }
    if report.record_removed {
        println!("Removed service record");
    }
    if report.unkillable.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    for pid in &report.unkillable {
        eprintln!("Error: process {pid} could not be terminated");
    }
    eprintln!("Hint: terminate the listed processes manually, then run cleanup again.");
    Ok(ExitCode::FAILURE)
}

fn print_start(outcome: StartOutcome, port: u16, controller: &Controller) {
    match outcome {
        StartOutcome::Started { pid } => {
            println!("InsightWatch started (pid {pid})");
            println!("Health API: http://localhost:{port}/health");
            println!("Logs: {}", controller.log_file().display());
        }
        StartOutcome::AlreadyRunning { pid } => {
            println!("InsightWatch is already running (pid {pid})");
        }
    }
}

fn print_stop(outcome: &StopOutcome) {
    match outcome {
        StopOutcome::Stopped { pid, forced: false } => println!("InsightWatch stopped (pid {pid})"),
        StopOutcome::Stopped { pid, forced: true } => {
            println!("InsightWatch force-killed after ignoring SIGTERM (pid {pid})")
        }
        StopOutcome::NotRunning => println!("InsightWatch is not running"),
    }
}

fn print_status(report: &StatusReport) {
    match &report.liveness {
        Liveness::Running { pid, usage } => {
            println!("Process: running (pid {pid})");
            if let Some(usage) = usage {
                println!(
                    "Memory: {:.1} MB, CPU: {:.1}%",
                    usage.memory_bytes as f64 / (1024.0 * 1024.0),
                    usage.cpu_percent
                );
            }
            if let Some(record) = &report.record {
                println!("Started: {}", record.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        Liveness::Stale { pid } => {
            println!("Process: not running (stale record for pid {pid})");
            println!("Hint: run `insightwatch cleanup` or `insightwatch start`.");
        }
        Liveness::NotRunning => println!("Process: not running"),
    }

    let Some(reading) = &report.health else {
        println!("Health: unavailable");
        return;
    };
    let health = &reading.record;
    println!("Health: {} ({:?})", health.status, reading.origin);
    println!("Uptime: {}s", health.uptime_seconds);
    println!(
        "Insights: {} total, {} today",
        health.total_insights, health.insights_today
    );
    println!(
        "Errors: {} failed runs, {} posts not stored",
        health.error_count, health.storage_errors
    );
    if let Some(last_run) = health.last_run {
        println!(
            "Last run: {} ({} evaluated, {} accepted)",
            last_run.format("%Y-%m-%d %H:%M:%S UTC"),
            health.last_evaluated,
            health.last_accepted
        );
    }
    if let Some(error) = &health.last_error {
        println!("Last error: {error}");
    }
}
