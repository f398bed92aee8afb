// ABOUTME: Configuration loading and validation for the courtyard CLI.
// ABOUTME: Reads environment variables with sensible defaults and rejects invalid values.

use std::path::PathBuf;

use courtyard_core::DEFAULT_PREFIX;
use courtyard_store::DEFAULT_CAPACITY_BYTES;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("COURTYARD_CAPACITY_BYTES is not a valid positive byte count: {0}")]
    InvalidCapacity(String),

    #[error("COURTYARD_SUBSTRATE must be 'memory' or 'sqlite', got: {0}")]
    InvalidSubstrate(String),
}

/// Which substrate implementation backs the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstrateKind {
    Memory,
    Sqlite,
}

/// CLI configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct CourtyardConfig {
    pub prefix: String,
    pub capacity_bytes: usize,
    pub substrate: SubstrateKind,
    pub db_path: PathBuf,
}

impl CourtyardConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - COURTYARD_PREFIX: application key prefix (default: courtyard:)
    /// - COURTYARD_CAPACITY_BYTES: origin capacity in bytes (default: 5242880)
    /// - COURTYARD_SUBSTRATE: memory | sqlite (default: memory)
    /// - COURTYARD_DB: sqlite database path (default: ~/.courtyard/storage.db)
    pub fn from_env() -> Result<Self, ConfigError> {
        let prefix = std::env::var("COURTYARD_PREFIX")
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        let capacity_bytes = match std::env::var("COURTYARD_CAPACITY_BYTES") {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidCapacity(raw)),
            },
            Err(_) => DEFAULT_CAPACITY_BYTES,
        };

        let substrate = match std::env::var("COURTYARD_SUBSTRATE").as_deref() {
            Ok("memory") | Err(_) => SubstrateKind::Memory,
            Ok("sqlite") => SubstrateKind::Sqlite,
            Ok(other) => return Err(ConfigError::InvalidSubstrate(other.to_string())),
        };

        let db_path = std::env::var("COURTYARD_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".courtyard")
                    .join("storage.db")
            });

        Ok(Self {
            prefix,
            capacity_bytes,
            substrate,
            db_path,
        })
    }
}
