//! Install-engine invocation
//!
//! The engine is an external program; we only build its command line, start
//! it under supervision and watch it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use super::env::{clean_subprocess_env, find_in_path};
use super::monitor::{MonitorSummary, MonitorThresholds, ProcessMonitor};
use super::output::OutputEvent;
use super::supervisor::{CancelHandle, CommandSpec, SupervisedProcess, SupervisorError};
use crate::logging::{log_install, log_warning};

pub const ENGINE_BINARY: &str = "jackify-engine";
pub const API_KEY_VAR: &str = "NEXUS_API_KEY";

/// Engine path from config, else `JACKIFY_ENGINE`, else `PATH`
pub fn locate_engine(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured.filter(|p| p.exists()) {
        return Some(path.to_path_buf());
    }
    std::env::var_os("JACKIFY_ENGINE")
        .map(PathBuf::from)
        .filter(|p| p.exists())
        .or_else(|| find_in_path(ENGINE_BINARY))
}

#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub engine: PathBuf,
    /// Modlist name or path to a `.wabbajack` file
    pub source: String,
    pub install_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub debug: bool,
    pub api_key: Option<String>,
}

impl EngineCommand {
    pub fn new(
        engine: impl Into<PathBuf>,
        source: impl Into<String>,
        install_dir: impl Into<PathBuf>,
        downloads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine: engine.into(),
            source: source.into(),
            install_dir: install_dir.into(),
            downloads_dir: downloads_dir.into(),
            debug: false,
            api_key: None,
        }
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            "-m".to_string(),
            self.source.clone(),
            "-o".to_string(),
            self.install_dir.to_string_lossy().to_string(),
            "-d".to_string(),
            self.downloads_dir.to_string_lossy().to_string(),
        ];
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }

    /// Command spec over `base_env`, with the API key added
    pub fn to_spec_with_env(&self, base_env: HashMap<String, String>) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.engine).args(self.args()).envs(base_env);
        if let Some(key) = &self.api_key {
            spec = spec.env(API_KEY_VAR, key.clone());
        }
        spec
    }

    /// Command spec over the cleaned current environment
    pub fn to_spec(&self) -> CommandSpec {
        self.to_spec_with_env(clean_subprocess_env(&HashMap::new()))
    }
}

/// A running install: the supervised engine plus its resource monitor
pub struct EngineRun {
    process: SupervisedProcess,
    monitor: ProcessMonitor,
}

impl EngineRun {
    pub fn start<F>(
        command: &EngineCommand,
        thresholds: MonitorThresholds,
        on_output: F,
    ) -> Result<Self, SupervisorError>
    where
        F: Fn(OutputEvent) + Send + Sync + 'static,
    {
        if command.api_key.is_none() {
            log_warning("No Nexus API key set; the engine may not be able to download");
        }
        log_install(&format!(
            "Installing {} to {}",
            command.source,
            command.install_dir.display()
        ));

        let process = SupervisedProcess::spawn(&command.to_spec(), on_output)?;
        let mut monitor = ProcessMonitor::new(process.pid(), thresholds);
        if let Err(e) = monitor.start(|_| {}) {
            log_warning(&format!("Resource monitor not started: {}", e));
        }

        Ok(Self { process, monitor })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.process.cancel_handle()
    }

    /// Wait for the engine to exit; returns its status and the monitor summary
    pub fn wait(mut self) -> Result<(ExitStatus, Option<MonitorSummary>), SupervisorError> {
        let status = self.process.wait()?;
        self.monitor.stop();
        let summary = self.monitor.summary();

        if let Some(s) = &summary {
            log_install(&format!(
                "Engine finished: {} samples, avg CPU {:.1}%, peak memory {:.0} MB, stalled {:.0}% of the time",
                s.samples, s.avg_cpu_percent, s.max_memory_mb, s.stall_percentage
            ));
        }
        Ok((status, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_engine_args() {
        let cmd = EngineCommand::new(
            "/opt/jackify/jackify-engine",
            "Tuxborn",
            "/home/deck/Games/Tuxborn",
            "/home/deck/Downloads",
        );
        assert_eq!(
            cmd.args(),
            vec![
                "install",
                "-m",
                "Tuxborn",
                "-o",
                "/home/deck/Games/Tuxborn",
                "-d",
                "/home/deck/Downloads"
            ]
        );
        assert_eq!(cmd.debug(true).args().last().map(String::as_str), Some("--debug"));
    }

    #[test]
    fn test_api_key_in_environment_not_args() {
        let cmd = EngineCommand::new("engine", "list.wabbajack", "/out", "/dl").api_key("secret");
        let base: HashMap<String, String> = [("PATH".to_string(), "/usr/bin".to_string())].into();
        let spec = cmd.to_spec_with_env(base);

        assert_eq!(spec.env.get(API_KEY_VAR).map(String::as_str), Some("secret"));
        assert_eq!(spec.env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert!(!spec.args.iter().any(|a| a.contains("secret")));
        assert_eq!(spec.program, PathBuf::from("engine"));
    }

    #[test]
    fn test_locate_engine_prefers_configured() {
        let dir = tempfile::tempdir().unwrap();
        let engine = dir.path().join(ENGINE_BINARY);
        std::fs::write(&engine, "").unwrap();
        assert_eq!(locate_engine(Some(&engine)), Some(engine));
    }

    #[test]
    fn test_engine_run_with_stub_engine() {
        let cmd = EngineCommand::new("/bin/echo", "Tuxborn", "/out", "/dl");
        let lines = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&lines);

        let run = EngineRun::start(
            &cmd,
            MonitorThresholds {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
            move |event| sink.lock().unwrap().push(event.text),
        )
        .unwrap();
        let (status, _) = run.wait().unwrap();

        assert!(status.success());
        assert_eq!(
            lines.lock().unwrap().as_slice(),
            ["install -m Tuxborn -o /out -d /dl"]
        );
    }
}
