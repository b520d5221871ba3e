//! Error types for the INDI server supervisor
//!
//! Most supervisor operations log and swallow these rather than returning
//! them, so bookkeeping stays consistent. They surface directly from the
//! lower building blocks (FIFO channel, process table, descriptor parser).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse driver descriptor {path}: {reason}")]
    DescriptorParse { path: PathBuf, reason: String },

    #[error("Driver {0} has no binary")]
    MissingBinary(String),

    #[error("Script {script} failed: {reason}")]
    ScriptFailed { script: String, reason: String },

    #[error("FIFO {path} unavailable: {reason}")]
    FifoUnavailable { path: PathBuf, reason: String },

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Process table unavailable: {0}")]
    ProcessTableUnavailable(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
