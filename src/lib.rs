//! Jackify - modlist setup for Steam/Proton on Linux
//!
//! Library crate for the integration engine: Steam VDF stores, shortcuts and
//! compatibility tools, Proton discovery, MO2 path rewriting and supervision
//! of the install engine.

#[macro_use]
pub mod paths;

pub mod config;
pub mod logging;
pub mod mo2;
pub mod process;
pub mod steam;
