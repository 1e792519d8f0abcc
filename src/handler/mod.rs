//! Ecosystem plugins and the contract they implement.
//!
//! Every plugin gathers three kinds of evidence (declared, scanned, SBOM),
//! hands them to [`reconcile`], and writes the result back in its native
//! manifest grammar. Grammars stay plugin-private; the pipeline is shared.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{Config, EcosystemPolicy};
use crate::curation::{self, RuleSource};
use crate::error::{RecoveryError, ScanError};
use crate::merge;
use crate::models::{Dependency, Ecosystem, Scope};
use crate::sanitize::sanitize;
use crate::sbom::SbomDocument;

pub mod dotnet;
pub mod go;
pub mod java;
pub mod node;
pub mod php;
pub mod python;
pub mod ruby;
pub mod rust;

/// The capability contract of an ecosystem plugin.
///
/// The orchestrator calls `detect`, then `scan`, then
/// `generate_recovery_file`, and skips the rest when `detect` is false.
pub trait Handler {
    /// Stable identifier for logs and the summary.
    fn name(&self) -> &'static str;

    fn ecosystem(&self) -> Ecosystem;

    /// Cheap, side-effect-free presence test.
    fn detect(&self, project: &Path) -> bool;

    /// Gather evidence, merge and curate it. An empty list is a valid result.
    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError>;

    /// Back up the existing manifest (if any) into `backup_dir`, then
    /// replace it with `deps`. Returns the path written.
    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError>;
}

/// Per-project inputs shared by all plugins.
#[derive(Debug, Default)]
pub struct ScanContext {
    pub sbom: Option<SbomDocument>,
    pub curations: RuleSource,
}

/// What a scan produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub dependencies: Vec<Dependency>,
    /// Records declared by the manifest before merging.
    pub declared: usize,
    /// Final records whose key the manifest did not declare.
    pub added: usize,
}

/// Raw evidence for one ecosystem, before sanitization.
#[derive(Debug, Default)]
pub struct Evidence {
    pub declared: Vec<Dependency>,
    pub scanned: Vec<Dependency>,
    /// Lockfile entries. Only used to fill versions, never added as records.
    pub locked: Vec<Dependency>,
}

/// Sanitize, merge (declared > SBOM > scanned), fill versions from the
/// lockfile and then the SBOM, and curate.
pub fn reconcile(
    ecosystem: Ecosystem,
    evidence: Evidence,
    policy: &EcosystemPolicy,
    ctx: &ScanContext,
) -> Result<ScanReport, ScanError> {
    if policy.sbom_required && ctx.sbom.is_none() {
        return Err(ScanError::SbomMissing);
    }

    let declared = clean(ecosystem, evidence.declared);
    let scanned = clean(ecosystem, evidence.scanned);
    let locked = clean(ecosystem, evidence.locked);
    let (external, candidates) = match &ctx.sbom {
        Some(doc) => (
            clean(ecosystem, doc.for_ecosystem(ecosystem)),
            clean(ecosystem, doc.version_candidates(ecosystem)),
        ),
        None => (Vec::new(), Vec::new()),
    };

    let mut merged = if policy.sbom_adds_records {
        merge::merge(&declared, &[&external, &scanned])
    } else {
        merge::merge(&declared, &[&scanned])
    };

    let from_lock = merge::fill_missing_versions(&mut merged, &locked);
    let from_sbom = merge::fill_missing_versions(&mut merged, &candidates);
    if from_lock + from_sbom > 0 {
        debug!(%ecosystem, from_lock, from_sbom, "filled missing versions");
    }

    curation::apply_curations(&mut merged, &ctx.curations)?;

    let added = merge::added_count(&merged, &declared);
    for dep in merged.iter().filter(|d| !d.is_resolved()) {
        debug!(%ecosystem, key = %dep.key, "version unresolved");
    }

    Ok(ScanReport {
        declared: declared.len(),
        added,
        dependencies: merged,
    })
}

/// Sanitize under the ecosystem's rules and drop unidentifiable records.
fn clean(ecosystem: Ecosystem, raw: Vec<Dependency>) -> Vec<Dependency> {
    let rules = ecosystem.sanitize_rules();
    raw.iter()
        .filter_map(|d| {
            let out = sanitize(d, &rules).filter(Dependency::is_identifiable);
            if out.is_none() {
                debug!(%ecosystem, record = ?d, "dropped unidentifiable record");
            }
            out
        })
        .collect()
}

/// Ordered list of plugins. Order is the processing order.
pub struct Registry {
    handlers: Vec<Box<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Box<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// All built-in plugins enabled in `config` and not in `excluded`.
    pub fn builtin(config: &Config, excluded: &[Ecosystem]) -> Self {
        let mut registry = Registry::new();
        for ecosystem in Ecosystem::ALL {
            let policy = config.policy(ecosystem);
            if !policy.enabled || excluded.contains(&ecosystem) {
                debug!(%ecosystem, "plugin disabled");
                continue;
            }
            let handler: Box<dyn Handler> = match ecosystem {
                Ecosystem::Java => Box::new(java::JavaHandler::new(policy)),
                Ecosystem::Go => Box::new(go::GoHandler::new(policy)),
                Ecosystem::Python => Box::new(python::PythonHandler::new(policy)),
                Ecosystem::Node => Box::new(node::NodeHandler::new(policy)),
                Ecosystem::Rust => Box::new(rust::RustHandler::new(policy)),
                Ecosystem::DotNet => Box::new(dotnet::DotNetHandler::new(policy)),
                Ecosystem::Ruby => Box::new(ruby::RubyHandler::new(policy)),
                Ecosystem::Php => Box::new(php::PhpHandler::new(policy)),
            };
            registry.register(handler);
        }
        registry
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Handler> {
        self.handlers.iter().map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope group used by writers with only "main" and "dev/test" sections.
pub(crate) fn is_dev(dep: &Dependency) -> bool {
    dep.scope == Scope::Test
}

/// Read a manifest, mapping I/O failures to [`ScanError::Io`].
pub(crate) fn read_manifest(path: &Path) -> Result<String, ScanError> {
    std::fs::read_to_string(path).map_err(|e| ScanError::io(path, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::UnresolvedVersion;
    use crate::curation::CurationRule;

    /// Create `files` (relative path, contents) under `root`.
    pub(crate) fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (rel, contents) in files {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, contents).unwrap();
        }
    }

    fn policy(sbom_adds_records: bool) -> EcosystemPolicy {
        EcosystemPolicy {
            enabled: true,
            unresolved: UnresolvedVersion::Omit,
            sbom_adds_records,
            sbom_required: false,
        }
    }

    fn npm(name: &str, version: Option<&str>) -> Dependency {
        Dependency::package(Ecosystem::Node, name, version, Scope::Compile)
    }

    const SBOM: &str = r#"{"artifacts":[
        {"name":"lodash","version":"4.17.21","purl":"pkg:npm/lodash@4.17.21"},
        {"name":"chalk","version":"5.3.0","purl":"pkg:npm/chalk@5.3.0"}
    ]}"#;

    #[test]
    fn test_scan_only_keys_stay_unresolved_without_sbom() {
        let evidence = Evidence {
            scanned: vec![npm("lodash", None), npm("axios", None)],
            ..Default::default()
        };
        let report = reconcile(Ecosystem::Node, evidence, &policy(false), &ScanContext::default())
            .unwrap();

        assert_eq!(report.added, 2);
        assert!(report.dependencies.iter().all(|d| d.version.is_none()));
    }

    #[test]
    fn test_declared_wins_and_sbom_fills_versions() {
        let ctx = ScanContext {
            sbom: Some(SbomDocument::parse(SBOM).unwrap()),
            ..Default::default()
        };
        let evidence = Evidence {
            declared: vec![npm("lodash", Some("^4.0.0"))],
            scanned: vec![npm("lodash", None), npm("chalk", None), npm("", None)],
            ..Default::default()
        };

        let report = reconcile(Ecosystem::Node, evidence, &policy(false), &ctx).unwrap();

        assert_eq!(report.declared, 1);
        assert_eq!(report.added, 1);
        assert_eq!(report.dependencies.len(), 2);
        assert_eq!(report.dependencies[0].version.as_deref(), Some("^4.0.0"));
        assert_eq!(report.dependencies[1].key, "npm:chalk");
        assert_eq!(report.dependencies[1].version.as_deref(), Some("5.3.0"));
    }

    #[test]
    fn test_sbom_adds_records_when_policy_allows() {
        let ctx = ScanContext {
            sbom: Some(SbomDocument::parse(SBOM).unwrap()),
            ..Default::default()
        };
        let report = reconcile(Ecosystem::Node, Evidence::default(), &policy(true), &ctx).unwrap();
        assert_eq!(report.dependencies.len(), 2);
        assert_eq!(report.added, 2);
    }

    #[test]
    fn test_lockfile_versions_win_over_sbom() {
        let ctx = ScanContext {
            sbom: Some(SbomDocument::parse(SBOM).unwrap()),
            ..Default::default()
        };
        let evidence = Evidence {
            scanned: vec![npm("chalk", None), npm("axios", None)],
            locked: vec![npm("chalk", Some("5.2.0")), npm("left-pad", Some("1.3.0"))],
            ..Default::default()
        };
        let report = reconcile(Ecosystem::Node, evidence, &policy(false), &ctx).unwrap();

        assert_eq!(report.dependencies.len(), 2);
        assert_eq!(report.dependencies[0].version.as_deref(), Some("5.2.0"));
        assert_eq!(report.dependencies[1].version, None);
    }

    #[test]
    fn test_required_sbom() {
        let mut p = policy(false);
        p.sbom_required = true;
        let err = reconcile(Ecosystem::Node, Evidence::default(), &p, &ScanContext::default())
            .unwrap_err();
        assert!(matches!(err, ScanError::SbomMissing));
    }

    #[test]
    fn test_curation_applies_after_merge() {
        let ctx = ScanContext {
            curations: RuleSource::Rules(vec![CurationRule {
                key: "npm:axios".into(),
                version: Some("1.6.0".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let evidence = Evidence {
            scanned: vec![npm("axios", None)],
            ..Default::default()
        };
        let report = reconcile(Ecosystem::Node, evidence, &policy(false), &ctx).unwrap();
        assert_eq!(report.dependencies[0].version.as_deref(), Some("1.6.0"));
    }

    #[test]
    fn test_curation_failure_is_a_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ScanContext {
            curations: RuleSource::File(dir.path().join("absent.yml")),
            ..Default::default()
        };
        let err = reconcile(Ecosystem::Node, Evidence::default(), &policy(false), &ctx).unwrap_err();
        assert!(matches!(err, ScanError::Curation(_)));
    }

    #[test]
    fn test_builtin_registry_respects_config_and_exclusions() {
        let mut config = Config::default();
        config.ecosystems.insert(
            "ruby".into(),
            crate::config::EcosystemConfig {
                enabled: Some(false),
                ..Default::default()
            },
        );
        let registry = Registry::builtin(&config, &[Ecosystem::Php]);
        let names: Vec<_> = registry.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["Java", "Go", "Python", "Node.js", "Rust", ".NET"]);
    }
}
