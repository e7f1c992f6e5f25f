//! Crate-wide error type used where `main` needs to select an exit code.
//!
//! Most fallible internal functions just return `anyhow::Result` and attach
//! context at each hop (see [`crate::config`], [`crate::codec`]). This type
//! exists only for the handful of call sites — CLI validation, the top-level
//! run — that need to be matched on rather than logged and bubbled up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsDrillError {
    #[error("invalid configuration: {0}")]
    Config(#[source] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[source] anyhow::Error),

    #[error("fatal error: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl DnsDrillError {
    /// Process exit code, matching the convention most CLI tools in the
    /// reference stack use: `2` for bad input, `1` for anything else fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            DnsDrillError::Config(_) => 2,
            DnsDrillError::Io(_) | DnsDrillError::Codec(_) | DnsDrillError::Fatal(_) => 1,
        }
    }
}

/// Exit code for a run that ended via a clean `SIGINT`, following the
/// POSIX `128+SIGINT` convention.
pub const EXIT_INTERRUPTED: i32 = 130;
