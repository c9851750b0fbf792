//! Jackify logging
//!
//! Timestamped console logging, mirrored to a per-session log file once
//! [`init_logger`] has been called.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};

static LOGGER: OnceLock<Arc<Mutex<JackifyLogger>>> = OnceLock::new();

// ============================================================================
// System Information Detection
// ============================================================================

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub app_version: String,
    pub distro: String,
    pub distro_version: String,
    pub kernel: String,
    pub session_type: String,
    pub desktop_env: String,
    pub memory_gb: String,
    pub flatpak: bool,
}

impl SystemInfo {
    pub fn detect() -> Self {
        let (distro, distro_version) = detect_distro();
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            distro,
            distro_version,
            kernel: detect_kernel(),
            session_type: std::env::var("XDG_SESSION_TYPE")
                .unwrap_or_else(|_| "Unknown".to_string()),
            desktop_env: detect_desktop_env(),
            memory_gb: detect_memory(),
            flatpak: crate::process::env::is_flatpak(),
        }
    }

    pub fn to_log_header(&self) -> String {
        format!(
r#"================================================================================
Jackify Log - {}
================================================================================
Application:   Jackify v{}
System Info:
  Distro:      {} {}
  Kernel:      {}
  Session:     {}
  Desktop:     {}
  Memory:      {}
  Flatpak:     {}
================================================================================
"#,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.app_version,
            self.distro,
            self.distro_version,
            self.kernel,
            self.session_type,
            self.desktop_env,
            self.memory_gb,
            if self.flatpak { "yes" } else { "no" }
        )
    }
}

/// `NAME` and `VERSION_ID` from /etc/os-release
fn detect_distro() -> (String, String) {
    let mut name = "Unknown".to_string();
    let mut version = String::new();

    if let Ok(file) = File::open("/etc/os-release") {
        let reader = BufReader::new(file);
        for line in reader.lines().map_while(Result::ok) {
            if let Some(value) = line.strip_prefix("NAME=") {
                name = value.trim_matches('"').to_string();
            } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
                version = value.trim_matches('"').to_string();
            }
        }
    }

    (name, version)
}

fn detect_kernel() -> String {
    if let Ok(output) = Command::new("uname").arg("-r").output() {
        if output.status.success() {
            return String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
    }
    "Unknown".to_string()
}

fn detect_desktop_env() -> String {
    ["XDG_CURRENT_DESKTOP", "DESKTOP_SESSION", "XDG_SESSION_DESKTOP"]
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn detect_memory() -> String {
    fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|c| crate::process::monitor::parse_meminfo_total_kb(&c))
        .map(|kb| format!("{:.1} GB", kb as f64 / 1024.0 / 1024.0))
        .unwrap_or_else(|| "Unknown".to_string())
}

// ============================================================================
// Log Levels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Action, // Workflow steps the user asked for
    Install,
    Steam,
    Warning,
    Error,
    Debug,
}

impl LogLevel {
    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Info => "[INFO]",
            LogLevel::Action => "[ACTION]",
            LogLevel::Install => "[INSTALL]",
            LogLevel::Steam => "[STEAM]",
            LogLevel::Warning => "[WARNING]",
            LogLevel::Error => "[ERROR]",
            LogLevel::Debug => "[DEBUG]",
        }
    }
}

// ============================================================================
// Jackify Logger
// ============================================================================

pub struct JackifyLogger {
    log_file: Option<File>,
    log_path: Option<PathBuf>,
    debug: bool,
}

impl JackifyLogger {
    /// Console-only logger
    pub fn console() -> Self {
        Self {
            log_file: None,
            log_path: None,
            debug: false,
        }
    }

    /// Start mirroring to `<data_dir>/logs/jackify_<timestamp>.log`
    fn attach_file(&mut self, data_dir: &Path) {
        let log_dir = data_dir.join("logs");
        let _ = fs::create_dir_all(&log_dir);

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let log_path = log_dir.join(format!("jackify_{}.log", timestamp));

        self.log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok();
        self.log_path = self.log_file.as_ref().map(|_| log_path);

        let header = SystemInfo::detect().to_log_header();
        self.write_raw(&header);
    }

    fn write_raw(&mut self, msg: &str) {
        if let Some(ref mut file) = self.log_file {
            let _ = writeln!(file, "{}", msg);
            let _ = file.flush();
        }

        println!("{}", msg);
    }

    pub fn log(&mut self, level: LogLevel, message: &str) {
        if level == LogLevel::Debug && !self.debug {
            return;
        }
        let timestamp = Local::now().format("%H:%M:%S");
        let formatted = format!("[{}] {} {}", timestamp, level.prefix(), message);
        self.write_raw(&formatted);
    }
}

// ============================================================================
// Global Logger Access
// ============================================================================

fn logger() -> Arc<Mutex<JackifyLogger>> {
    LOGGER
        .get_or_init(|| Arc::new(Mutex::new(JackifyLogger::console())))
        .clone()
}

/// Attach the session log file (call once at startup)
pub fn init_logger(data_dir: &Path, debug: bool) {
    if let Ok(mut log) = logger().lock() {
        log.debug = debug;
        if log.log_file.is_none() {
            log.attach_file(data_dir);
        }
    }
}

/// Path of the current session log, if one is open
pub fn log_path() -> Option<PathBuf> {
    logger().lock().ok().and_then(|log| log.log_path.clone())
}

// ============================================================================
// Convenience Logging Functions
// ============================================================================

fn log_at(level: LogLevel, message: &str) {
    if let Ok(mut log) = logger().lock() {
        log.log(level, message);
    }
}

pub fn log_info(message: &str) {
    log_at(LogLevel::Info, message);
}

pub fn log_action(message: &str) {
    log_at(LogLevel::Action, message);
}

pub fn log_install(message: &str) {
    log_at(LogLevel::Install, message);
}

pub fn log_steam(message: &str) {
    log_at(LogLevel::Steam, message);
}

pub fn log_warning(message: &str) {
    log_at(LogLevel::Warning, message);
}

pub fn log_error(message: &str) {
    log_at(LogLevel::Error, message);
}

pub fn log_debug(message: &str) {
    log_at(LogLevel::Debug, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_gated() {
        let mut logger = JackifyLogger::console();
        logger.log(LogLevel::Debug, "hidden");
        logger.debug = true;
        logger.log(LogLevel::Debug, "shown");
        assert!(logger.log_path.is_none());
    }

    #[test]
    fn test_file_logger_writes_header_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = JackifyLogger::console();
        logger.attach_file(dir.path());
        logger.log(LogLevel::Steam, "restarting");

        let path = logger.log_path.clone().unwrap();
        assert!(path.starts_with(dir.path().join("logs")));
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("Jackify Log"));
        assert!(content.contains("[STEAM] restarting"));
    }
}
