//! Steam integration module
//!
//! VDF stores, non-Steam shortcuts, Proton runtime discovery and the
//! `CompatToolMapping` section of `config.vdf`.

pub mod config;
pub mod paths;
pub mod proton;
pub mod store;
pub mod vdf;
#[cfg(feature = "shortcuts")]
pub mod shortcuts;

pub use config::{set_compat_tool, MappingError};
pub use paths::{find_steam_path, find_userdata_dir, SteamPaths};
pub use proton::{RuntimeCandidate, RuntimeError, RuntimePaths, RuntimeResolver};
pub use store::{load, load_or_default, save, update_shortcuts, StoreError};
pub use vdf::{VdfFormat, VdfMap, VdfValue};
#[cfg(feature = "shortcuts")]
pub use shortcuts::{RegistrarError, ShortcutRecord, ShortcutRegistrar};

use std::io;
use std::process::Stdio;
use std::thread;
use std::time::{Duration, Instant};

use crate::logging::{log_steam, log_warning};
use crate::process::command_for;
use crate::process::supervisor::{terminate, EscalationPolicy, ProcessSignaller};

const STEAM_POLL: Duration = Duration::from_millis(250);

// ============================================================================
// Steam client lifecycle
// ============================================================================

fn run_quiet(program: &str, args: &[&str]) -> io::Result<bool> {
    command_for(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
}

pub fn is_steam_running() -> bool {
    run_quiet("pgrep", &["-x", "steam"]).unwrap_or(false)
}

/// The running Steam client, driven through the same escalation as any
/// supervised process. We don't own its pid, so everything goes by name.
struct SteamClient;

impl ProcessSignaller for SteamClient {
    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(!is_steam_running())
    }

    fn wait_for(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !is_steam_running() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(STEAM_POLL);
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        run_quiet("steam", &["-shutdown"]).map(|_| ())
    }

    fn kill(&mut self) -> io::Result<()> {
        run_quiet("pkill", &["-9", "-x", "steam"]).map(|_| ())
    }

    fn kill_group(&mut self) -> io::Result<()> {
        // The client's helpers keep the runtime alive after the main process
        run_quiet("pkill", &["-9", "steamwebhelper"]).map(|_| ())
    }

    fn kill_by_name(&mut self) -> io::Result<()> {
        run_quiet("pkill", &["-9", "steam"]).map(|_| ())
    }
}

/// Steam needs longer than an engine process to shut down cleanly
fn steam_shutdown_policy() -> EscalationPolicy {
    EscalationPolicy {
        terminate_wait: Duration::from_secs(15),
        kill_wait: Duration::from_secs(2),
        group_kill_wait: Duration::from_secs(2),
        name_kill_attempts: 2,
    }
}

/// Shut Steam down gracefully, then force if needed
pub fn kill_steam() -> Result<(), Box<dyn std::error::Error>> {
    log_steam("Shutting down Steam");
    let report = terminate(&mut SteamClient, &steam_shutdown_policy());
    if !report.stopped {
        return Err(format!("Steam is still running after {:?}", report.transitions).into());
    }
    Ok(())
}

/// Start Steam in background
pub fn start_steam() -> Result<(), Box<dyn std::error::Error>> {
    // setsid detaches Steam from our session; -silent keeps the main window closed
    command_for("setsid")
        .arg("steam")
        .arg("-silent")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    log_steam("Started Steam");
    Ok(())
}

/// Restart Steam and wait up to `startup_timeout` for it to come back.
/// Steam reassigns shortcut AppIDs on startup, so look them up again after.
pub fn restart_steam(startup_timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    kill_steam()?;
    start_steam()?;

    let deadline = Instant::now() + startup_timeout;
    while !is_steam_running() {
        if Instant::now() >= deadline {
            log_warning("Steam did not report as running before the timeout");
            return Ok(());
        }
        thread::sleep(STEAM_POLL);
    }
    log_steam("Steam is running again");
    Ok(())
}
