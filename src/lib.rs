//! testloom library crate
//!
//! Turns a structured test suite (or a user story) into an executable test
//! file, runs it, and asks a generation backend to repair it until it passes
//! or the attempt budget runs out.

pub mod artifacts;
pub mod backend;
pub mod collect;
pub mod config;
pub mod error;
pub mod execution;
pub mod extract;
pub mod failure;
pub mod orchestrator;
pub mod prompt;
pub mod suite;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use orchestrator::{LoopOutcome, LoopStatus, RepairLoop};
