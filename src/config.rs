//! Core configuration management for the durable workflow execution engine
//!
//! Centralized configuration for the engine's components, supporting both
//! default values and environment variable overrides.

use std::env;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub default_path: String,
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Used when a `do` call supplies no `options.timeout`.
    pub default_timeout_ms: Option<u64>,
    /// Used when a `do` call supplies no `options.retries`.
    pub default_retry_limit: u32,
    pub default_retry_delay_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            default_path: env::var("WORKFLOW_ENGINE_DB_PATH")
                .unwrap_or_else(|_| "workflow_engine.db".to_string()),
            connection_timeout_ms: env::var("WORKFLOW_ENGINE_DB_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5_000),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: env::var("WORKFLOW_ENGINE_DEFAULT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
            default_retry_limit: env::var("WORKFLOW_ENGINE_DEFAULT_RETRY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            default_retry_delay_ms: env::var("WORKFLOW_ENGINE_DEFAULT_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::default() // Already loads from env in Default impl
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.database.default_path.is_empty() {
            return Err("Database path must not be empty".to_string());
        }

        if self.database.connection_timeout_ms == 0 {
            return Err("Database connection timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}
