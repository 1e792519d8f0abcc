use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::Ecosystem;

/// Root configuration, deserialized from `.manifest-recoverr/config.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Per-ecosystem overrides keyed by [`Ecosystem::id`] (`go`, `node`, ...).
    #[serde(default)]
    pub ecosystems: HashMap<String, EcosystemConfig>,
}

/// Run-wide settings.
#[derive(Debug, Deserialize)]
pub struct RecoveryConfig {
    /// Root directory for manifest backups.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// YAML curation rule file. No curation when absent.
    #[serde(default)]
    pub curation_file: Option<PathBuf>,
    /// External SBOM scanner binary. No SBOM evidence when absent.
    #[serde(default = "default_scanner")]
    pub scanner: Option<String>,
    #[serde(default = "default_scanner_timeout")]
    pub scanner_timeout_secs: u64,
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("recovery_files")
}

fn default_scanner() -> Option<String> {
    Some("syft".to_string())
}

fn default_scanner_timeout() -> u64 {
    300
}

fn default_clone_timeout() -> u64 {
    600
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            backup_dir: default_backup_dir(),
            curation_file: None,
            scanner: default_scanner(),
            scanner_timeout_secs: default_scanner_timeout(),
            clone_timeout_secs: default_clone_timeout(),
        }
    }
}

/// Partial per-ecosystem settings as written in the file.
#[derive(Debug, Default, Deserialize)]
pub struct EcosystemConfig {
    pub enabled: Option<bool>,
    pub unresolved: Option<UnresolvedVersion>,
    pub sbom_adds_records: Option<bool>,
    pub sbom_required: Option<bool>,
}

/// How a manifest writer renders a dependency with no resolved version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedVersion {
    /// Leave the version out of the entry (or comment the entry) so
    /// downstream tools see it as unknown.
    Omit,
    /// The literal `latest`.
    Latest,
    /// `*`.
    Wildcard,
    /// An empty version string.
    Empty,
}

impl UnresolvedVersion {
    /// Text to write in place of the version, or `None` for [`Self::Omit`].
    pub fn placeholder(&self) -> Option<&'static str> {
        match self {
            UnresolvedVersion::Omit => None,
            UnresolvedVersion::Latest => Some("latest"),
            UnresolvedVersion::Wildcard => Some("*"),
            UnresolvedVersion::Empty => Some(""),
        }
    }
}

/// Effective policy for one ecosystem after applying defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcosystemPolicy {
    pub enabled: bool,
    pub unresolved: UnresolvedVersion,
    /// Whether SBOM packages become records, or only fill versions.
    pub sbom_adds_records: bool,
    /// Fail the scan when no SBOM document is available.
    pub sbom_required: bool,
}

impl EcosystemPolicy {
    /// Built-in defaults, chosen per ecosystem so that written manifests
    /// stay syntactically valid for their native tools.
    pub fn builtin(ecosystem: Ecosystem) -> Self {
        let (unresolved, sbom_adds_records) = match ecosystem {
            Ecosystem::Go => (UnresolvedVersion::Omit, false),
            Ecosystem::Node => (UnresolvedVersion::Latest, false),
            Ecosystem::Python => (UnresolvedVersion::Omit, false),
            Ecosystem::Java => (UnresolvedVersion::Omit, false),
            Ecosystem::Rust => (UnresolvedVersion::Wildcard, true),
            Ecosystem::DotNet => (UnresolvedVersion::Omit, true),
            Ecosystem::Ruby => (UnresolvedVersion::Omit, true),
            Ecosystem::Php => (UnresolvedVersion::Wildcard, true),
        };
        EcosystemPolicy {
            enabled: true,
            unresolved,
            sbom_adds_records,
            sbom_required: false,
        }
    }
}

impl Config {
    pub fn policy(&self, ecosystem: Ecosystem) -> EcosystemPolicy {
        let mut policy = EcosystemPolicy::builtin(ecosystem);
        if let Some(over) = self.ecosystems.get(ecosystem.id()) {
            policy.enabled = over.enabled.unwrap_or(policy.enabled);
            policy.unresolved = over.unresolved.unwrap_or(policy.unresolved);
            policy.sbom_adds_records = over.sbom_adds_records.unwrap_or(policy.sbom_adds_records);
            policy.sbom_required = over.sbom_required.unwrap_or(policy.sbom_required);
        }
        policy
    }
}

/// Load the configuration, searching in order:
///
/// 1. `config_override` — path passed via `--config`
/// 2. `<project_path>/.manifest-recoverr/config.toml`
/// 3. `~/.config/manifest-recoverr/config.toml`
/// 4. Built-in [`Config::default`]
pub fn load_config(project_path: &Path, config_override: Option<&Path>) -> Result<Config> {
    if let Some(path) = config_override {
        return read_config(path);
    }

    let project_config = project_path.join(".manifest-recoverr").join("config.toml");
    if project_config.exists() {
        return read_config(&project_config);
    }

    if let Some(home) = dirs::home_dir() {
        let home_config = home
            .join(".config")
            .join("manifest-recoverr")
            .join("config.toml");
        if home_config.exists() {
            return read_config(&home_config);
        }
    }

    Ok(Config::default())
}

fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
}
