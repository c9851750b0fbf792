//! External process supervision
//!
//! Launching, watching and tearing down the long-running helpers a modlist
//! install needs (the install engine, Steam itself).

pub mod engine;
pub mod env;
pub mod monitor;
pub mod output;
pub mod supervisor;

pub use engine::{locate_engine, EngineCommand, EngineRun};
pub use env::{clean_subprocess_env, command_for, is_flatpak};
pub use monitor::{MonitorStatus, MonitorSummary, MonitorThresholds, ProcessMonitor, ResourceSample};
pub use output::{LineKind, LineSplitter, OutputEvent, OutputStream};
pub use supervisor::{
    CancelHandle, CommandSpec, EscalationPolicy, ProcessState, SupervisedProcess, SupervisorError,
    TerminationReport,
};
