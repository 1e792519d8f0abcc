//! `manifest-recoverr` rebuilds dependency manifests from declared, scanned and SBOM evidence.
//!
//! # Flow
//! 1. Parse CLI arguments ([`cli`]) and install logging ([`logging`]).
//! 2. Load config ([`config::load_config`]) and apply CLI overrides.
//! 3. Build the plugin registry ([`handler::Registry::builtin`]).
//! 4. For each project (a local path, or repos cloned from `--repo-file`, [`repos`]):
//!    estimate languages ([`detector`]), run the SBOM scanner ([`sbom`]) and run
//!    every plugin ([`orchestrator::process_project`]).
//! 5. Render the requested report ([`report`]).
//! 6. Exit `0`, or `1` when any plugin failed.

mod cli;
mod config;
mod curation;
mod detector;
mod error;
mod fsutil;
mod handler;
mod logging;
mod merge;
mod models;
mod orchestrator;
mod report;
mod repos;
mod sanitize;
mod sbom;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use cli::{Cli, ReportFormat};
use config::{load_config, Config};
use curation::RuleSource;
use handler::{Registry, ScanContext};
use models::Ecosystem;
use orchestrator::ProjectSummary;
use repos::RepoEntry;

/// Where the scanner writes its document inside a project. Removed after
/// the project is processed.
const SBOM_FILE: &str = "syft.json";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(
        logging::Verbosity::from_flags(cli.verbose, cli.quiet),
        cli.log_file.as_deref(),
    )?;
    let start = Instant::now();

    let path = cli
        .path
        .canonicalize()
        .unwrap_or_else(|_| cli.path.clone());

    let mut config = load_config(&path, cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);

    let excluded: Vec<Ecosystem> = cli.exclude_lang.iter().map(Into::into).collect();
    let registry = Registry::builtin(&config, &excluded);
    if registry.is_empty() {
        bail!("every ecosystem is disabled or excluded; nothing to do");
    }

    let curations = match &config.recovery.curation_file {
        Some(file) => RuleSource::File(file.clone()),
        None => RuleSource::None,
    };

    let summaries = match &cli.repo_file {
        Some(repo_file) => {
            let entries = repos::load_repo_file(repo_file)?;
            run_repos(&entries, &registry, &config, &curations, &cli).await?
        }
        None => {
            if !path.is_dir() {
                bail!("{} is not a directory", path.display());
            }
            vec![run_project(&registry, &config, &curations, &path).await]
        }
    };

    match cli.report {
        ReportFormat::Terminal => {
            report::terminal::render(&summaries, start.elapsed(), cli.quiet)?;
        }
        ReportFormat::Json => report::json::render(&summaries)?,
    }
    info!(elapsed = ?start.elapsed(), "done");

    if summaries.iter().any(ProjectSummary::errored) {
        std::process::exit(1);
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(backup) = &cli.backup {
        config.recovery.backup_dir = backup.clone();
    }
    if let Some(curations) = &cli.curations {
        config.recovery.curation_file = Some(curations.clone());
    }
    if let Some(scanner) = &cli.scanner {
        config.recovery.scanner = Some(scanner.clone());
    }
    if cli.no_sbom {
        config.recovery.scanner = None;
    }
}

async fn run_repos(
    entries: &[RepoEntry],
    registry: &Registry,
    config: &Config,
    curations: &RuleSource,
    cli: &Cli,
) -> Result<Vec<ProjectSummary>> {
    let temp = tempfile::Builder::new()
        .prefix("manifest-recoverr-")
        .tempdir()
        .context("failed to create clone directory")?;
    let temp_root = temp.path().to_path_buf();
    if cli.keep_temp {
        let kept = temp.into_path();
        info!(path = %kept.display(), "keeping cloned repositories");
    }
    let clone_timeout = Duration::from_secs(config.recovery.clone_timeout_secs);

    let pb = if !cli.quiet {
        let pb = ProgressBar::new(entries.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )?
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let mut summaries = Vec::new();
    for entry in entries {
        if let Some(pb) = &pb {
            pb.set_message(entry.name());
        }
        match repos::clone_repo(entry, &temp_root, clone_timeout).await {
            Ok(clone) => {
                let mut summary = run_project(registry, config, curations, &clone).await;
                summary.repo = Some(entry.repo.clone());
                summary.product = entry.product.clone();
                summaries.push(summary);
            }
            Err(e) => error!(repo = %entry.repo, error = %e, "failed to clone repository"),
        }
        if let Some(pb) = &pb {
            pb.inc(1);
        }
    }

    if let Some(pb) = pb {
        pb.finish_with_message("Done");
    }
    Ok(summaries)
}

async fn run_project(
    registry: &Registry,
    config: &Config,
    curations: &RuleSource,
    project: &Path,
) -> ProjectSummary {
    detector::estimate_languages(project);

    let sbom_path: PathBuf = project.join(SBOM_FILE);
    let sbom = match &config.recovery.scanner {
        Some(scanner) => {
            let timeout = Duration::from_secs(config.recovery.scanner_timeout_secs);
            sbom::collect(scanner, project, &sbom_path, timeout).await
        }
        None => None,
    };

    let ctx = ScanContext {
        sbom,
        curations: curations.clone(),
    };
    let summary =
        orchestrator::process_project(registry, &ctx, project, &config.recovery.backup_dir);

    if config.recovery.scanner.is_some() && sbom_path.exists() {
        if let Err(e) = std::fs::remove_file(&sbom_path) {
            warn!(path = %sbom_path.display(), error = %e, "failed to remove SBOM output");
        }
    }
    summary
}
