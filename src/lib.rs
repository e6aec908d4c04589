//! Durable workflow execution engine
//!
//! Runs user-defined workflows step by step against a SQLite-backed
//! journal, so that a process restart mid-workflow resumes exactly where
//! it left off instead of re-running completed work.

pub mod config;
pub mod database;
pub mod duration;
pub mod error;
pub mod models;
pub mod step_executor;
pub mod workflow_runner;

/// Core engine version
pub const VERSION: &str = "0.1.0";

/// Initialize logging for the engine. Call once at process start.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    log::info!("durable workflow engine v{VERSION} initialized");
    Ok(())
}
