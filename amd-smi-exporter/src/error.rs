use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Failure to obtain a document from amd-smi.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Failure of a whole collection cycle.
///
/// Any of these leaves the exposition empty for the cycle; per-field and
/// per-device problems are not errors and never surface here.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Failed to parse amd-smi output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Expected an array of GPU objects, got {found}")]
    Shape { found: &'static str },

    #[error("Mapping aborted unexpectedly: {0}")]
    Panicked(String),
}
