//! SBOM evidence: parsing the external scanner's JSON and running it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::SbomError;
use crate::models::{Dependency, Ecosystem, Scope};

#[derive(Debug, Deserialize)]
struct ScannerOutput {
    #[serde(default)]
    artifacts: Vec<ScannerArtifact>,
}

#[derive(Debug, Deserialize)]
struct ScannerArtifact {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    purl: String,
}

/// One package reported by the scanner. `ecosystem` is `None` when the
/// package URL is missing or of an unknown type.
#[derive(Debug, Clone, PartialEq)]
pub struct SbomPackage {
    pub ecosystem: Option<Ecosystem>,
    pub dependency: Dependency,
}

/// Parsed SBOM document.
#[derive(Debug, Clone, Default)]
pub struct SbomDocument {
    packages: Vec<SbomPackage>,
}

impl SbomDocument {
    pub fn parse(json: &str) -> Result<Self, SbomError> {
        let output: ScannerOutput = serde_json::from_str(json)?;
        let packages = output
            .artifacts
            .into_iter()
            .filter(|a| !a.name.trim().is_empty())
            .map(to_package)
            .collect();
        Ok(SbomDocument { packages })
    }

    pub fn load(path: &Path) -> Result<Self, SbomError> {
        let content = std::fs::read_to_string(path).map_err(|source| SbomError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Records attributed to `ecosystem`.
    pub fn for_ecosystem(&self, ecosystem: Ecosystem) -> Vec<Dependency> {
        self.packages
            .iter()
            .filter(|p| p.ecosystem == Some(ecosystem))
            .map(|p| p.dependency.clone())
            .collect()
    }

    /// Records usable for name-based version filling in `ecosystem`: its
    /// own packages first, then packages of unknown origin re-tagged.
    pub fn version_candidates(&self, ecosystem: Ecosystem) -> Vec<Dependency> {
        let unknown = self.packages.iter().filter(|p| p.ecosystem.is_none()).map(|p| {
            let mut d = p.dependency.clone();
            d.ecosystem = ecosystem;
            d
        });
        self.for_ecosystem(ecosystem).into_iter().chain(unknown).collect()
    }
}

fn to_package(a: ScannerArtifact) -> SbomPackage {
    let version = Some(a.version.as_str());
    let Some(purl) = Purl::parse(&a.purl) else {
        return SbomPackage {
            ecosystem: None,
            dependency: untyped(&a.name, version),
        };
    };

    let ecosystem = Ecosystem::from_purl_type(&purl.ty);
    let dependency = match ecosystem {
        Some(Ecosystem::Java) => Dependency::coordinate(
            Ecosystem::Java,
            purl.namespace.as_deref().unwrap_or_default(),
            &purl.name,
            version,
            Scope::Compile,
        ),
        Some(Ecosystem::Go) => Dependency::module(
            Ecosystem::Go,
            &purl.qualified_name('/'),
            version,
            Scope::Compile,
        ),
        Some(eco @ (Ecosystem::Node | Ecosystem::Php)) => {
            Dependency::package(eco, &purl.qualified_name('/'), version, Scope::Compile)
        }
        Some(eco) => Dependency::package(eco, &purl.name, version, Scope::Compile),
        None => untyped(&a.name, version),
    };
    SbomPackage {
        ecosystem,
        dependency,
    }
}

/// A package of unknown ecosystem, identified by its bare name. The
/// ecosystem field is a placeholder until [`SbomDocument::version_candidates`]
/// re-tags it.
fn untyped(name: &str, version: Option<&str>) -> Dependency {
    let mut d = Dependency::package(Ecosystem::Node, name, version, Scope::Compile);
    d.group_id.clear();
    d.key = d.derive_key();
    d
}

/// Minimal package-URL decomposition: `pkg:type/namespace/name@version?q#s`.
#[derive(Debug, PartialEq)]
struct Purl {
    ty: String,
    namespace: Option<String>,
    name: String,
}

impl Purl {
    fn parse(s: &str) -> Option<Purl> {
        let rest = s.trim().strip_prefix("pkg:")?;
        let rest = rest.split(['?', '#']).next().unwrap_or(rest);
        let (ty, path) = rest.split_once('/')?;
        let path = match path.rsplit_once('@') {
            Some((p, _version)) if !p.is_empty() && !p.ends_with('/') => p,
            _ => path,
        };
        let path = path.replace("%40", "@");
        let (namespace, name) = match path.rsplit_once('/') {
            Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
            None => (None, path.to_string()),
        };
        if name.is_empty() {
            return None;
        }
        Some(Purl {
            ty: ty.to_ascii_lowercase(),
            namespace,
            name,
        })
    }

    fn qualified_name(&self, sep: char) -> String {
        match &self.namespace {
            Some(ns) => format!("{}{}{}", ns, sep, self.name),
            None => self.name.clone(),
        }
    }
}

/// Run the external scanner over `project`, writing JSON to `output`.
///
/// Bounded by `timeout`; on expiry the child is killed and
/// [`SbomError::Timeout`] is returned.
pub async fn run_scanner(
    scanner: &str,
    project: &Path,
    output: &Path,
    timeout: Duration,
) -> Result<PathBuf, SbomError> {
    if output.exists() {
        debug!(path = %output.display(), "removing stale SBOM output");
        let _ = std::fs::remove_file(output);
    }

    let mut cmd = Command::new(scanner);
    cmd.arg("scan")
        .arg(project)
        .arg("-o")
        .arg(format!("json={}", output.display()))
        .kill_on_drop(true);
    for excluded in ["./node_modules", "./vendor", "./.git", "./venv", "./__pycache__"] {
        cmd.arg("--exclude").arg(excluded);
    }

    info!(scanner, project = %project.display(), "running SBOM scanner");
    let child = cmd.output();
    let result = match tokio::time::timeout(timeout, child).await {
        Ok(result) => result,
        Err(_) => {
            let _ = std::fs::remove_file(output);
            return Err(SbomError::Timeout(timeout.as_secs()));
        }
    };

    let out = result.map_err(|source| SbomError::Spawn {
        scanner: scanner.to_string(),
        source,
    })?;
    if !out.status.success() {
        let _ = std::fs::remove_file(output);
        return Err(SbomError::Failed {
            status: out.status.to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    if !output.exists() {
        return Err(SbomError::Missing(output.to_path_buf()));
    }
    Ok(output.to_path_buf())
}

/// Run the scanner and parse its output, degrading to `None` on any
/// failure.
pub async fn collect(
    scanner: &str,
    project: &Path,
    output: &Path,
    timeout: Duration,
) -> Option<SbomDocument> {
    let result = match run_scanner(scanner, project, output, timeout).await {
        Ok(path) => SbomDocument::load(&path),
        Err(e) => Err(e),
    };
    match result {
        Ok(doc) => {
            info!(packages = doc.len(), "parsed SBOM document");
            Some(doc)
        }
        Err(e) => {
            warn!(error = %e, project = %project.display(), "SBOM unavailable; versions may stay unresolved");
            None
        }
    }
}
