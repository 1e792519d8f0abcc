//! Tracing initialization.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, Once};

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Environment variable holding an `EnvFilter` directive string.
pub const LOG_ENV: &str = "MANIFEST_RECOVERR_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        match (verbose, quiet) {
            (true, _) => Verbosity::Verbose,
            (false, true) => Verbosity::Quiet,
            (false, false) => Verbosity::Normal,
        }
    }

    fn default_directive(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "manifest_recoverr=warn",
            Verbosity::Normal => "manifest_recoverr=info",
            Verbosity::Verbose => "manifest_recoverr=debug",
        }
    }
}

/// Install the global subscriber: stderr, plus an append-mode plain-text
/// file when `log_file` is set.
///
/// `MANIFEST_RECOVERR_LOG` overrides the level implied by `verbosity`.
/// Only the first call has any effect.
pub fn init(verbosity: Verbosity, log_file: Option<&Path>) -> Result<()> {
    let file = match log_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?,
        ),
        None => None,
    };

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(verbosity.default_directive()));

        let file_layer = file.map(|f| {
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(f))
        });

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(file_layer)
            .with(filter)
            .init();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_to_verbosity() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(
            Verbosity::from_flags(false, false).default_directive(),
            "manifest_recoverr=info"
        );
    }

    #[test]
    fn test_unopenable_log_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("run.log");
        assert!(init(Verbosity::Normal, Some(&path)).is_err());
    }
}
