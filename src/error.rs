//! Error types for the reconciliation pipeline.
//!
//! Unidentifiable records are not errors: they are dropped where they are
//! found. Everything here is structural and is reported per plugin.

use std::path::PathBuf;

/// The curation rule source could not be used. Curation is all-or-nothing.
#[derive(Debug, thiserror::Error)]
pub enum CurationError {
    #[error("curation rules at {path} are unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("curation rules at {path} are malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Evidence gathering failed for one plugin.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    #[error(transparent)]
    Curation(#[from] CurationError),

    #[error("SBOM document is required for this ecosystem but none was supplied")]
    SbomMissing,
}

impl ScanError {
    pub fn manifest(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        ScanError::Manifest {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScanError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Backup or manifest write failed. The original manifest is left intact.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("failed to create backup directory {path}: {source}")]
    BackupDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to back up {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {path}: {message}")]
    Serialize { path: PathBuf, message: String },
}

impl RecoveryError {
    pub fn serialize(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        RecoveryError::Serialize {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// External SBOM scanner failures. Recoverable: the project is processed
/// without SBOM evidence.
#[derive(Debug, thiserror::Error)]
pub enum SbomError {
    #[error("failed to launch scanner `{scanner}`: {source}")]
    Spawn {
        scanner: String,
        #[source]
        source: std::io::Error,
    },

    #[error("scanner exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("scanner timed out after {0}s")]
    Timeout(u64),

    #[error("scanner ran but produced no output at {0}")]
    Missing(PathBuf),

    #[error("failed to read SBOM {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed SBOM document: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    #[error("failed to launch git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git clone of {repo} failed: {output}")]
    Failed { repo: String, output: String },

    #[error("git clone of {repo} timed out after {secs}s")]
    Timeout { repo: String, secs: u64 },
}
