//! Runs every registered plugin over one project and records what happened.
//!
//! Plugins run one at a time in registration order. A failure in one plugin
//! is captured in its [`PluginSummary`] and never stops the others.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::handler::{Handler, Registry, ScanContext};

/// Terminal state of one plugin for one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    NotDetected,
    ScanError,
    /// Detected and scanned, but there was nothing to write.
    Scanned,
    Recovered,
    RecoveryError,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::NotDetected => write!(f, "not detected"),
            PluginState::ScanError => write!(f, "scan error"),
            PluginState::Scanned => write!(f, "scanned"),
            PluginState::Recovered => write!(f, "recovered"),
            PluginState::RecoveryError => write!(f, "recovery error"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub state: PluginState,
    pub detected: bool,
    /// Final records the manifest did not already declare.
    pub dependencies_added: usize,
    pub declared: usize,
    pub total: usize,
    pub errored: bool,
    /// Manifest written, when recovery succeeded.
    pub manifest: Option<PathBuf>,
    pub error: Option<String>,
}

impl PluginSummary {
    fn new(name: &str) -> Self {
        PluginSummary {
            name: name.to_string(),
            state: PluginState::NotDetected,
            detected: false,
            dependencies_added: 0,
            declared: 0,
            total: 0,
            errored: false,
            manifest: None,
            error: None,
        }
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    fn fail(&mut self, state: PluginState, error: String) {
        self.state = state;
        self.errored = true;
        self.error = Some(error);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub project: PathBuf,
    /// Repository URL when the project was cloned from a repo list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    pub plugins: Vec<PluginSummary>,
}

impl ProjectSummary {
    pub fn errored(&self) -> bool {
        self.plugins.iter().any(PluginSummary::errored)
    }

    pub fn detected(&self) -> impl Iterator<Item = &PluginSummary> {
        self.plugins.iter().filter(|p| p.detected)
    }
}

/// Detect, scan and recover with every plugin in `registry`.
///
/// Backups for a plugin go to `backup_root/<project-name>/<plugin-id>`.
pub fn process_project(
    registry: &Registry,
    ctx: &ScanContext,
    project: &Path,
    backup_root: &Path,
) -> ProjectSummary {
    let project_name = project
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    info!(project = %project.display(), plugins = registry.len(), "processing project");

    let plugins = registry
        .iter()
        .map(|handler| {
            let backup_dir = backup_root
                .join(&project_name)
                .join(handler.ecosystem().id());
            run_plugin(handler, ctx, project, &backup_dir)
        })
        .collect();

    ProjectSummary {
        project: project.to_path_buf(),
        repo: None,
        product: None,
        plugins,
    }
}

fn run_plugin(
    handler: &dyn Handler,
    ctx: &ScanContext,
    project: &Path,
    backup_dir: &Path,
) -> PluginSummary {
    let name = handler.name();
    let mut summary = PluginSummary::new(name);

    if !handler.detect(project) {
        debug!(handler = name, "not detected");
        return summary;
    }
    summary.detected = true;

    let report = match handler.scan(project, ctx) {
        Ok(report) => report,
        Err(e) => {
            error!(handler = name, project = %project.display(), error = %e, "scan failed");
            summary.fail(PluginState::ScanError, e.to_string());
            return summary;
        }
    };
    summary.declared = report.declared;
    summary.total = report.dependencies.len();
    summary.dependencies_added = report.added;
    summary.state = PluginState::Scanned;

    if report.dependencies.is_empty() {
        info!(handler = name, "no external dependencies; nothing to write");
        return summary;
    }

    match handler.generate_recovery_file(&report.dependencies, project, backup_dir) {
        Ok(path) => {
            info!(
                handler = name,
                manifest = %path.display(),
                total = summary.total,
                added = summary.dependencies_added,
                "manifest recovered"
            );
            summary.state = PluginState::Recovered;
            summary.manifest = Some(path);
        }
        Err(e) => {
            error!(handler = name, project = %project.display(), error = %e, "recovery failed");
            summary.fail(PluginState::RecoveryError, e.to_string());
        }
    }
    summary
}
