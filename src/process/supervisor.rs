//! Supervised external processes
//!
//! Every process is started in its own process group so the whole tree can
//! be taken down. Cancellation walks a fixed escalation:
//!
//! `Running -> TerminateSent -> KillSent -> GroupKillSent -> NameKillAttempted -> Stopped`
//!
//! Each step runs even if the previous one failed to deliver its signal.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wait_timeout::ChildExt;

use super::output::{LineSplitter, OutputEvent, OutputStream};
use crate::logging::{log_debug, log_error, log_info, log_warning};

/// Poll interval for [`SupervisedProcess::wait`]
const WAIT_POLL: Duration = Duration::from_millis(100);

/// How long output pumps get to drain after the child exits. A grandchild
/// that inherited the pipes (wineserver, for one) keeps them open for as long
/// as it lives, so pumps still reading after this are left detached.
pub const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const PUMP_DRAIN_POLL: Duration = Duration::from_millis(10);

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    TerminateSent,
    KillSent,
    GroupKillSent,
    /// Number of `pkill -f` attempts made so far
    NameKillAttempted(u32),
    Stopped,
}

/// Wait times between escalation steps
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    pub terminate_wait: Duration,
    pub kill_wait: Duration,
    pub group_kill_wait: Duration,
    pub name_kill_attempts: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            terminate_wait: Duration::from_secs(2),
            kill_wait: Duration::from_secs(1),
            group_kill_wait: Duration::from_secs(1),
            name_kill_attempts: 3,
        }
    }
}

/// The operations escalation needs from a process
pub trait ProcessSignaller {
    /// Whether the process has already exited
    fn has_exited(&mut self) -> io::Result<bool>;
    /// Wait up to `timeout`; true once the process has exited
    fn wait_for(&mut self, timeout: Duration) -> io::Result<bool>;
    /// SIGTERM to the process
    fn terminate(&mut self) -> io::Result<()>;
    /// SIGKILL to the process
    fn kill(&mut self) -> io::Result<()>;
    /// SIGKILL to the whole process group
    fn kill_group(&mut self) -> io::Result<()>;
    /// `pkill -f <name>`
    fn kill_by_name(&mut self) -> io::Result<()>;
}

/// What a cancel did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// States passed through, in order, ending with the final one
    pub transitions: Vec<ProcessState>,
    pub stopped: bool,
}

fn log_step_error(step: &str, result: io::Result<()>) {
    if let Err(e) = result {
        log_warning(&format!("{} failed: {}", step, e));
    }
}

fn exited_within<S: ProcessSignaller + ?Sized>(target: &mut S, timeout: Duration) -> bool {
    match target.wait_for(timeout) {
        Ok(exited) => exited,
        Err(e) => {
            log_debug(&format!("wait during termination failed: {}", e));
            false
        }
    }
}

/// Advance one escalation step
pub fn escalate<S: ProcessSignaller + ?Sized>(
    state: ProcessState,
    target: &mut S,
    policy: &EscalationPolicy,
) -> ProcessState {
    match state {
        ProcessState::Running => {
            log_step_error("SIGTERM", target.terminate());
            if exited_within(target, policy.terminate_wait) {
                ProcessState::Stopped
            } else {
                ProcessState::TerminateSent
            }
        }
        ProcessState::TerminateSent => {
            log_step_error("SIGKILL", target.kill());
            if exited_within(target, policy.kill_wait) {
                ProcessState::Stopped
            } else {
                ProcessState::KillSent
            }
        }
        ProcessState::KillSent => {
            log_step_error("Process group SIGKILL", target.kill_group());
            if exited_within(target, policy.group_kill_wait) {
                ProcessState::Stopped
            } else {
                ProcessState::GroupKillSent
            }
        }
        ProcessState::GroupKillSent => ProcessState::NameKillAttempted(0),
        ProcessState::NameKillAttempted(n) if n < policy.name_kill_attempts => {
            log_step_error("pkill", target.kill_by_name());
            if exited_within(target, policy.group_kill_wait) {
                ProcessState::Stopped
            } else {
                ProcessState::NameKillAttempted(n + 1)
            }
        }
        // Out of attempts: terminal
        ProcessState::NameKillAttempted(n) => ProcessState::NameKillAttempted(n),
        ProcessState::Stopped => ProcessState::Stopped,
    }
}

/// Run the full escalation. No signal is sent to a process that has
/// already exited.
pub fn terminate<S: ProcessSignaller + ?Sized>(target: &mut S, policy: &EscalationPolicy) -> TerminationReport {
    let already_exited = target.has_exited().unwrap_or(false);
    if already_exited {
        return TerminationReport {
            transitions: vec![ProcessState::Stopped],
            stopped: true,
        };
    }

    let mut state = ProcessState::Running;
    let mut transitions = Vec::new();
    loop {
        let next = escalate(state, target, policy);
        if next == state {
            break;
        }
        transitions.push(next);
        if next == ProcessState::Stopped {
            break;
        }
        state = next;
    }

    let stopped = transitions.last() == Some(&ProcessState::Stopped);
    TerminationReport { transitions, stopped }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum SupervisorError {
    Spawn { program: String, source: io::Error },
    Io(io::Error),
    /// Escalation ran out of steps with the process still alive
    TerminationFailure { pid: u32, report: TerminationReport },
    EmptyCommand,
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Spawn { program, source } => write!(f, "Failed to start {}: {}", program, source),
            SupervisorError::Io(e) => write!(f, "Process I/O error: {}", e),
            SupervisorError::TerminationFailure { pid, .. } => {
                write!(f, "Process {} could not be terminated", pid)
            }
            SupervisorError::EmptyCommand => write!(f, "Empty command"),
        }
    }
}

impl std::error::Error for SupervisorError {}

impl From<io::Error> for SupervisorError {
    fn from(err: io::Error) -> Self {
        SupervisorError::Io(err)
    }
}

// ============================================================================
// Real processes
// ============================================================================

/// A spawned child plus what is needed to signal its group
pub struct ChildHandle {
    child: Child,
    pgid: u32,
    name: String,
    status: Option<ExitStatus>,
}

impl ChildHandle {
    fn poll(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self.child.try_wait()?;
        }
        Ok(self.status)
    }
}

fn run_signal_command(program: &str, args: &[&str]) -> io::Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("{} {} exited with {}", program, args.join(" "), status)))
    }
}

impl ProcessSignaller for ChildHandle {
    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.poll()?.is_some())
    }

    fn wait_for(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.status.is_none() {
            self.status = self.child.wait_timeout(timeout)?;
        }
        Ok(self.status.is_some())
    }

    fn terminate(&mut self) -> io::Result<()> {
        run_signal_command("kill", &["-TERM", &self.child.id().to_string()])
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn kill_group(&mut self) -> io::Result<()> {
        run_signal_command("kill", &["-KILL", "--", &format!("-{}", self.pgid)])
    }

    fn kill_by_name(&mut self) -> io::Result<()> {
        // pkill exits 1 when nothing matched, which is fine here
        Command::new("pkill")
            .arg("-f")
            .arg(&self.name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|_| ())
    }
}

/// What to run
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Full environment; the child does not inherit ours
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program plus arguments, for logging
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// The name `pkill -f` matches on
    fn kill_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

pub type OutputCallback = Arc<dyn Fn(OutputEvent) + Send + Sync>;

fn spawn_pump<R: Read + Send + 'static>(
    mut reader: R,
    stream: OutputStream,
    callback: OutputCallback,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("output-{:?}", stream).to_lowercase())
        .spawn(move || {
            let mut splitter = LineSplitter::new();
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in splitter.push(&chunk[..n]) {
                            callback(OutputEvent {
                                stream,
                                kind: line.kind,
                                text: line.text,
                            });
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            if let Some(line) = splitter.finish() {
                callback(OutputEvent {
                    stream,
                    kind: line.kind,
                    text: line.text,
                });
            }
        })
}

/// Cloneable handle that can cancel a process from another thread
#[derive(Clone)]
pub struct CancelHandle {
    handle: Arc<Mutex<ChildHandle>>,
    policy: EscalationPolicy,
    pid: u32,
}

impl CancelHandle {
    /// Escalate until the process is gone. Idempotent.
    pub fn cancel(&self) -> Result<TerminationReport, SupervisorError> {
        let mut guard = self.handle.lock();
        let report = terminate(&mut *guard, &self.policy);

        if report.stopped {
            log_info(&format!("Process {} stopped", self.pid));
            Ok(report)
        } else {
            log_error(&format!(
                "Process {} survived termination ({:?})",
                self.pid, report.transitions
            ));
            Err(SupervisorError::TerminationFailure { pid: self.pid, report })
        }
    }
}

/// A running external process with its output pumps
pub struct SupervisedProcess {
    command: Vec<String>,
    env: HashMap<String, String>,
    pid: u32,
    cancel: CancelHandle,
    pumps: Vec<JoinHandle<()>>,
}

impl SupervisedProcess {
    /// Start a process in a new process group and pump its output into
    /// `on_output` from background threads.
    pub fn spawn<F>(spec: &CommandSpec, on_output: F) -> Result<Self, SupervisorError>
    where
        F: Fn(OutputEvent) + Send + Sync + 'static,
    {
        Self::spawn_with_policy(spec, EscalationPolicy::default(), on_output)
    }

    pub fn spawn_with_policy<F>(spec: &CommandSpec, policy: EscalationPolicy, on_output: F) -> Result<Self, SupervisorError>
    where
        F: Fn(OutputEvent) + Send + Sync + 'static,
    {
        if spec.program.as_os_str().is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;

        let pid = child.id();
        log_info(&format!("Started {:?} (pid {})", spec.command_line(), pid));

        let callback: OutputCallback = Arc::new(on_output);
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, OutputStream::Stdout, Arc::clone(&callback))?);
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, OutputStream::Stderr, Arc::clone(&callback))?);
        }

        let handle = ChildHandle {
            child,
            // process_group(0) makes the child its own group leader
            pgid: pid,
            name: spec.kill_name(),
            status: None,
        };

        Ok(Self {
            command: spec.command_line(),
            env: spec.env.clone(),
            pid,
            cancel: CancelHandle {
                handle: Arc::new(Mutex::new(handle)),
                policy,
                pid,
            },
            pumps,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Environment the process was started with
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn is_running(&self) -> bool {
        matches!(self.cancel.handle.lock().poll(), Ok(None))
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel the process; see [`CancelHandle::cancel`]
    pub fn cancel(&self) -> Result<TerminationReport, SupervisorError> {
        self.cancel.cancel()
    }

    /// Block until exit. The lock is released between polls so a
    /// [`CancelHandle`] on another thread can get in.
    pub fn wait(&mut self) -> Result<ExitStatus, SupervisorError> {
        let status = loop {
            {
                let mut guard = self.cancel.handle.lock();
                if guard.wait_for(WAIT_POLL)? {
                    if let Some(status) = guard.status {
                        break status;
                    }
                }
            }
            thread::yield_now();
        };

        join_pumps(self.pid, self.pumps.drain(..).collect(), PUMP_DRAIN_TIMEOUT);

        log_info(&format!("Process {} exited with {}", self.pid, status));
        Ok(status)
    }
}

/// Join pumps that reach EOF within `timeout`; detach the rest
fn join_pumps(pid: u32, pumps: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while pumps.iter().any(|pump| !pump.is_finished()) && Instant::now() < deadline {
        thread::sleep(PUMP_DRAIN_POLL);
    }

    let (finished, pending): (Vec<_>, Vec<_>) = pumps.into_iter().partition(|pump| pump.is_finished());
    for pump in finished {
        if pump.join().is_err() {
            log_error(&format!("Output reader for process {} panicked", pid));
        }
    }
    if !pending.is_empty() {
        log_warning(&format!(
            "Process {} exited but {} output pipe(s) are still held open by a child process; no longer waiting on them",
            pid,
            pending.len()
        ));
    }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        if self.is_running() {
            log_warning(&format!("Supervised process {} still running on drop; cancelling", self.pid));
            let _ = self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records calls; exits after the configured step
    #[derive(Default)]
    struct FakeProcess {
        calls: Vec<&'static str>,
        exited: bool,
        /// Step name after which the process dies
        dies_after: Option<&'static str>,
        fail_terminate: bool,
    }

    impl FakeProcess {
        fn record(&mut self, step: &'static str) {
            self.calls.push(step);
            if self.dies_after == Some(step) {
                self.exited = true;
            }
        }
    }

    impl ProcessSignaller for FakeProcess {
        fn has_exited(&mut self) -> io::Result<bool> {
            Ok(self.exited)
        }
        fn wait_for(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(self.exited)
        }
        fn terminate(&mut self) -> io::Result<()> {
            self.record("term");
            if self.fail_terminate {
                return Err(io::Error::other("no such process"));
            }
            Ok(())
        }
        fn kill(&mut self) -> io::Result<()> {
            self.record("kill");
            Ok(())
        }
        fn kill_group(&mut self) -> io::Result<()> {
            self.record("group");
            Ok(())
        }
        fn kill_by_name(&mut self) -> io::Result<()> {
            self.record("pkill");
            Ok(())
        }
    }

    fn quick_policy() -> EscalationPolicy {
        EscalationPolicy {
            terminate_wait: Duration::ZERO,
            kill_wait: Duration::ZERO,
            group_kill_wait: Duration::ZERO,
            name_kill_attempts: 3,
        }
    }

    #[test]
    fn test_cancel_on_stopped_process_sends_nothing() {
        let mut fake = FakeProcess {
            exited: true,
            ..Default::default()
        };
        let report = terminate(&mut fake, &quick_policy());
        assert!(report.stopped);
        assert!(fake.calls.is_empty());
    }

    #[test]
    fn test_sigterm_is_enough() {
        let mut fake = FakeProcess {
            dies_after: Some("term"),
            ..Default::default()
        };
        let report = terminate(&mut fake, &quick_policy());
        assert_eq!(report.transitions, vec![ProcessState::Stopped]);
        assert_eq!(fake.calls, vec!["term"]);
    }

    #[test]
    fn test_failed_step_still_escalates() {
        let mut fake = FakeProcess {
            dies_after: Some("group"),
            fail_terminate: true,
            ..Default::default()
        };
        let report = terminate(&mut fake, &quick_policy());
        assert!(report.stopped);
        assert_eq!(fake.calls, vec!["term", "kill", "group"]);
        assert_eq!(
            report.transitions,
            vec![ProcessState::TerminateSent, ProcessState::KillSent, ProcessState::Stopped]
        );
    }

    #[test]
    fn test_name_kill_limited_to_attempts() {
        let mut fake = FakeProcess::default();
        let report = terminate(&mut fake, &quick_policy());
        assert!(!report.stopped);
        assert_eq!(fake.calls.iter().filter(|c| **c == "pkill").count(), 3);
        assert_eq!(report.transitions.last(), Some(&ProcessState::NameKillAttempted(3)));
    }

    #[test]
    fn test_escalate_single_steps() {
        let policy = quick_policy();
        let mut fake = FakeProcess::default();
        assert_eq!(escalate(ProcessState::Running, &mut fake, &policy), ProcessState::TerminateSent);
        assert_eq!(escalate(ProcessState::GroupKillSent, &mut fake, &policy), ProcessState::NameKillAttempted(0));
        assert_eq!(escalate(ProcessState::Stopped, &mut fake, &policy), ProcessState::Stopped);
        assert_eq!(fake.calls, vec!["term"]);
    }

    fn shell(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .env("PATH", std::env::var("PATH").unwrap_or_default())
    }

    #[test]
    fn test_spawn_pumps_output_and_waits() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut process = SupervisedProcess::spawn(&shell("printf 'one\\n50%%\\rtwo\\n'; echo err >&2"), move |ev| {
            sink.lock().unwrap().push(ev);
        })
        .unwrap();

        let status = process.wait().unwrap();
        assert!(status.success());

        let events = seen.lock().unwrap();
        let stdout: Vec<&str> = events
            .iter()
            .filter(|e| e.stream == OutputStream::Stdout)
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "50%", "two"]);
        assert!(events.iter().any(|e| e.stream == OutputStream::Stderr && e.text == "err"));

        // Already exited: cancel is a no-op
        let report = process.cancel().unwrap();
        assert_eq!(report.transitions, vec![ProcessState::Stopped]);
    }

    #[test]
    fn test_cancel_running_process() {
        let process = SupervisedProcess::spawn(&shell("sleep 30"), |_| {}).unwrap();
        assert!(process.is_running());

        let report = process.cancel_handle().cancel().unwrap();
        assert!(report.stopped);
        assert!(!process.is_running());
    }

    #[test]
    fn test_wait_not_held_by_background_grandchild() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut process = SupervisedProcess::spawn(&shell("sleep 6 & echo started"), move |ev| {
            sink.lock().unwrap().push(ev.text);
        })
        .unwrap();

        let started = Instant::now();
        let status = process.wait().unwrap();
        assert!(status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(seen.lock().unwrap().iter().any(|line| line == "started"));
    }

    #[test]
    fn test_join_pumps_detaches_stuck_reader() {
        let (release, blocked) = std::sync::mpsc::channel::<()>();
        let stuck = thread::spawn(move || {
            let _ = blocked.recv();
        });
        let done = thread::spawn(|| {});

        let started = Instant::now();
        join_pumps(1, vec![stuck, done], Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
        let _ = release.send(());
    }

    #[test]
    fn test_spawn_missing_program() {
        let spec = CommandSpec::new("/nonexistent/engine-binary");
        assert!(matches!(
            SupervisedProcess::spawn(&spec, |_| {}),
            Err(SupervisorError::Spawn { .. })
        ));
    }
}
