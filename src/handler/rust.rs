use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EcosystemPolicy;
use crate::error::{RecoveryError, ScanError};
use crate::fsutil;
use crate::models::{Dependency, Ecosystem, Scope};

use super::{read_manifest, reconcile, Evidence, Handler, ScanContext, ScanReport};

/// Path roots that never name an external crate.
const RESERVED_ROOTS: &[&str] = &[
    "std", "core", "alloc", "proc_macro", "test", "crate", "self", "super", "Self",
];

/// Manifest section for each scope.
const SECTIONS: &[(&str, Scope)] = &[
    ("dependencies", Scope::Compile),
    ("dev-dependencies", Scope::Test),
    ("build-dependencies", Scope::Build),
];

static USE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+:{0,2}([A-Za-z_][A-Za-z0-9_]*)\s*(?:::|;|\s+as\b)")
        .expect("use regex")
});
static EXTERN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*extern\s+crate\s+([A-Za-z_][A-Za-z0-9_]*)").expect("extern crate regex")
});
static MOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([A-Za-z_][A-Za-z0-9_]*)").expect("mod regex")
});

#[derive(Debug, Deserialize)]
struct CargoLock {
    #[serde(default)]
    package: Vec<CargoLockPackage>,
}

#[derive(Debug, Deserialize)]
struct CargoLockPackage {
    name: String,
    version: String,
    /// Packages without a `source` field are local workspace members.
    source: Option<String>,
}

/// Cargo: `Cargo.toml` sections, `Cargo.lock`, and `use`/`extern crate` paths.
pub struct RustHandler {
    policy: EcosystemPolicy,
}

impl RustHandler {
    pub fn new(policy: EcosystemPolicy) -> Self {
        Self { policy }
    }
}

impl Handler for RustHandler {
    fn name(&self) -> &'static str {
        "Rust"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Rust
    }

    fn detect(&self, project: &Path) -> bool {
        project.join("Cargo.toml").exists() || fsutil::has_source_file(project, &["rs"])
    }

    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError> {
        let manifest_path = project.join("Cargo.toml");
        let manifest = if manifest_path.exists() {
            let content = read_manifest(&manifest_path)?;
            parse_manifest(&content).map_err(|e| ScanError::manifest(&manifest_path, e))?
        } else {
            Manifest::default()
        };

        let lock_path = project.join("Cargo.lock");
        let (locked, members) = if lock_path.exists() {
            let content = read_manifest(&lock_path)?;
            parse_cargo_lock(&content).map_err(|e| ScanError::manifest(&lock_path, e))?
        } else {
            (Vec::new(), Vec::new())
        };

        let mut local: HashSet<String> = members.iter().map(|m| crate_ident(m)).collect();
        local.extend(manifest.local_names.iter().map(|n| crate_ident(n)));

        // Source paths use `_`; manifests may use `-`.
        let mut known: HashMap<String, String> = HashMap::new();
        for dep in manifest.dependencies.iter().chain(&locked) {
            known
                .entry(crate_ident(dep.manifest_name()))
                .or_insert_with(|| dep.manifest_name().to_string());
        }

        let scanned = scan_sources(project, &local)
            .into_iter()
            .map(|(ident, scope)| {
                let name = known.get(&ident).cloned().unwrap_or(ident);
                Dependency::package(Ecosystem::Rust, &name, None, scope)
            })
            .collect();

        let evidence = Evidence {
            declared: manifest.dependencies,
            scanned,
            locked,
        };
        reconcile(Ecosystem::Rust, evidence, &self.policy, ctx)
    }

    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError> {
        let path = project.join("Cargo.toml");
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        let crate_name = project
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recovered".to_string());

        let contents = render_cargo_toml(&existing, &crate_name, deps, &self.policy)
            .map_err(|e| RecoveryError::serialize(&path, e))?;
        fsutil::replace_manifest(&path, &contents, backup_dir)?;
        Ok(path)
    }
}

#[derive(Debug, Default)]
struct Manifest {
    dependencies: Vec<Dependency>,
    /// Package and library names of the crate itself.
    local_names: Vec<String>,
}

fn parse_manifest(content: &str) -> Result<Manifest, toml::de::Error> {
    let doc: toml::Table = toml::from_str(content)?;
    let mut manifest = Manifest::default();

    for key in ["package", "lib"] {
        if let Some(name) = doc.get(key).and_then(|t| t.get("name")).and_then(|n| n.as_str()) {
            manifest.local_names.push(name.to_string());
        }
    }

    if let Some(entries) = doc
        .get("workspace")
        .and_then(|w| w.get("dependencies"))
        .and_then(|d| d.as_table())
    {
        for (name, spec) in entries {
            if is_path_dependency(spec) {
                manifest.local_names.push(name.clone());
            }
            manifest.dependencies.push(Dependency::package(
                Ecosystem::Rust,
                name,
                spec_version(spec),
                Scope::Compile,
            ));
        }
    }

    let mut tables: Vec<&toml::Table> = vec![&doc];
    if let Some(targets) = doc.get("target").and_then(|t| t.as_table()) {
        tables.extend(targets.values().filter_map(|t| t.as_table()));
    }

    for table in tables {
        for (section, scope) in SECTIONS {
            let Some(entries) = table.get(*section).and_then(|s| s.as_table()) else {
                continue;
            };
            for (name, spec) in entries {
                if is_path_dependency(spec) {
                    manifest.local_names.push(name.clone());
                }
                manifest.dependencies.push(Dependency::package(
                    Ecosystem::Rust,
                    name,
                    spec_version(spec),
                    scope.clone(),
                ));
            }
        }
    }
    Ok(manifest)
}

fn spec_version(spec: &toml::Value) -> Option<&str> {
    match spec {
        toml::Value::String(v) => Some(v.as_str()),
        toml::Value::Table(t) => t.get("version").and_then(|v| v.as_str()),
        _ => None,
    }
}

fn is_path_dependency(spec: &toml::Value) -> bool {
    spec.as_table().is_some_and(|t| t.contains_key("path"))
}

/// Registry packages as version evidence, and the workspace members' names.
fn parse_cargo_lock(content: &str) -> Result<(Vec<Dependency>, Vec<String>), toml::de::Error> {
    let lock: CargoLock = toml::from_str(content)?;
    let (external, members): (Vec<_>, Vec<_>) =
        lock.package.into_iter().partition(|p| p.source.is_some());

    let locked = external
        .into_iter()
        .map(|p| Dependency::package(Ecosystem::Rust, &p.name, Some(&p.version), Scope::Compile))
        .collect();
    Ok((locked, members.into_iter().map(|p| p.name).collect()))
}

fn crate_ident(name: &str) -> String {
    name.replace('-', "_")
}

fn source_scope(rel: &Path) -> Scope {
    if rel.file_name().is_some_and(|n| n == "build.rs") {
        return Scope::Build;
    }
    match rel.components().next().map(|c| c.as_os_str().to_string_lossy()) {
        Some(first) if matches!(&*first, "tests" | "benches" | "examples") => Scope::Test,
        _ => Scope::Compile,
    }
}

/// External crate identifiers referenced by `.rs` files, with their scope.
fn scan_sources(project: &Path, local: &HashSet<String>) -> BTreeMap<String, Scope> {
    let files = fsutil::source_files(project, &["rs"]);
    let sources: Vec<(PathBuf, String)> = files
        .into_iter()
        .filter_map(|f| std::fs::read_to_string(&f).ok().map(|s| (f, s)))
        .collect();

    // Modules declared anywhere in the tree shadow crate names in `use`.
    let mut modules: HashSet<String> = local.clone();
    for (file, source) in &sources {
        modules.extend(MOD_RE.captures_iter(source).map(|c| c[1].to_string()));
        if let Some(stem) = file.file_stem() {
            modules.insert(stem.to_string_lossy().into_owned());
        }
    }

    let mut found: BTreeMap<String, Scope> = BTreeMap::new();
    for (file, source) in &sources {
        let scope = source_scope(file.strip_prefix(project).unwrap_or(file));
        let idents = USE_RE
            .captures_iter(source)
            .chain(EXTERN_RE.captures_iter(source))
            .map(|c| c[1].to_string());
        for ident in idents {
            if RESERVED_ROOTS.contains(&ident.as_str()) || modules.contains(&ident) {
                continue;
            }
            let entry = found.entry(ident).or_insert_with(|| scope.clone());
            if scope == Scope::Compile {
                *entry = Scope::Compile;
            }
        }
    }
    debug!(crates = found.len(), "collected crate paths from sources");
    found
}

/// Rewrite the dependency sections of `existing`, keeping the package table,
/// features, target-specific sections and the shape of entries that are
/// tables (path, git, features).
fn render_cargo_toml(
    existing: &str,
    crate_name: &str,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> Result<String, toml::ser::Error> {
    let mut doc: toml::Table = toml::from_str(existing).unwrap_or_default();

    // A virtual manifest has no package; recovered crates go to
    // `[workspace.dependencies]`.
    if doc.contains_key("workspace") && !doc.contains_key("package") {
        if let Some(workspace) = doc.get_mut("workspace").and_then(|w| w.as_table_mut()) {
            let previous = workspace
                .remove("dependencies")
                .and_then(|v| v.as_table().cloned())
                .unwrap_or_default();
            let table = rebuild_section(&previous, deps.iter(), &HashSet::new(), "", policy);
            if !table.is_empty() {
                workspace.insert("dependencies".into(), toml::Value::Table(table));
            }
        }
        return toml::to_string(&doc);
    }

    if !doc.contains_key("package") {
        let mut package = toml::Table::new();
        package.insert("name".into(), crate_name.into());
        package.insert("version".into(), "0.1.0".into());
        package.insert("edition".into(), "2021".into());
        doc.insert("package".into(), toml::Value::Table(package));
    }

    // Entries living under `[target.*]` stay there.
    let mut targeted: HashSet<(String, String)> = HashSet::new();
    if let Some(targets) = doc.get("target").and_then(|t| t.as_table()) {
        for target in targets.values().filter_map(|t| t.as_table()) {
            for (section, _) in SECTIONS {
                if let Some(entries) = target.get(*section).and_then(|s| s.as_table()) {
                    targeted.extend(entries.keys().map(|k| (section.to_string(), k.clone())));
                }
            }
        }
    }

    for (section, scope) in SECTIONS {
        let previous = doc
            .remove(*section)
            .and_then(|v| v.as_table().cloned())
            .unwrap_or_default();

        let in_section = deps.iter().filter(|d| section_of(&d.scope) == *scope);
        let table = rebuild_section(&previous, in_section, &targeted, section, policy);
        if !table.is_empty() {
            doc.insert(section.to_string(), toml::Value::Table(table));
        }
    }

    toml::to_string(&doc)
}

/// Entries for one dependency table; names listed in `targeted` under
/// `section` are left to their `[target.*]` table.
fn rebuild_section<'a>(
    previous: &toml::Table,
    deps: impl Iterator<Item = &'a Dependency>,
    targeted: &HashSet<(String, String)>,
    section: &str,
    policy: &EcosystemPolicy,
) -> toml::Table {
    let mut table = toml::Table::new();
    for dep in deps {
        let name = dep.manifest_name();
        if targeted.contains(&(section.to_string(), name.to_string())) {
            continue;
        }
        match entry_value(previous.get(name), dep, policy) {
            Some(value) => {
                table.insert(name.to_string(), value);
            }
            None => warn!(crate_name = name, "version unresolved; entry omitted"),
        }
    }
    table
}

fn section_of(scope: &Scope) -> Scope {
    match scope {
        Scope::Test => Scope::Test,
        Scope::Build => Scope::Build,
        _ => Scope::Compile,
    }
}

fn entry_value(
    previous: Option<&toml::Value>,
    dep: &Dependency,
    policy: &EcosystemPolicy,
) -> Option<toml::Value> {
    if let Some(toml::Value::Table(spec)) = previous {
        let mut spec = spec.clone();
        let sourced = ["path", "git", "workspace"].iter().any(|k| spec.contains_key(*k));
        if let (Some(version), false) = (&dep.version, sourced) {
            spec.insert("version".into(), version.clone().into());
        }
        return Some(toml::Value::Table(spec));
    }

    let version = match (&dep.version, policy.unresolved.placeholder()) {
        (Some(v), _) => v.clone(),
        (None, Some(p)) => p.to_string(),
        (None, None) => return None,
    };
    Some(toml::Value::String(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::write_tree;

    const CARGO_TOML: &str = r#"[package]
name = "my-app"
version = "0.3.0"
edition = "2021"

[dependencies]
serde = { version = "1", features = ["derive"] }
anyhow = "1"
helpers = { path = "../helpers" }

[dev-dependencies]
tempfile = "3"

[target.'cfg(unix)'.dependencies]
libc = "0.2"

[features]
default = []
"#;

    const CARGO_LOCK: &str = r#"
version = 3

[[package]]
name = "my-app"
version = "0.3.0"

[[package]]
name = "serde"
version = "1.0.150"
source = "registry+https://github.com/rust-lang/crates.io-index"
checksum = "abc123"

[[package]]
name = "tokio-util"
version = "0.7.10"
source = "registry+https://github.com/rust-lang/crates.io-index"
checksum = "def456"
"#;

    fn handler() -> RustHandler {
        RustHandler::new(EcosystemPolicy::builtin(Ecosystem::Rust))
    }

    #[test]
    fn test_parse_cargo_lock() {
        let (locked, members) = parse_cargo_lock(CARGO_LOCK).unwrap();
        assert_eq!(locked.len(), 2);
        assert_eq!(locked[0].key, "crates:serde");
        assert_eq!(locked[1].version.as_deref(), Some("0.7.10"));
        assert_eq!(members, vec!["my-app"]);
    }

    #[test]
    fn test_parse_manifest_sections() {
        let manifest = parse_manifest(CARGO_TOML).unwrap();
        let got: Vec<_> = manifest
            .dependencies
            .iter()
            .map(|d| (d.manifest_name(), d.version.as_deref(), d.scope.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("serde", Some("1"), Scope::Compile),
                ("anyhow", Some("1"), Scope::Compile),
                ("helpers", None, Scope::Compile),
                ("tempfile", Some("3"), Scope::Test),
                ("libc", Some("0.2"), Scope::Compile),
            ]
        );
        assert!(manifest.local_names.contains(&"helpers".to_string()));
    }

    #[test]
    fn test_scan_finds_undeclared_crates() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("Cargo.toml", CARGO_TOML),
                ("Cargo.lock", CARGO_LOCK),
                (
                    "src/main.rs",
                    "mod config;\nuse std::io;\nuse serde::Deserialize;\nuse tokio_util::codec;\nuse config::Settings;\nuse my_app::run;\nuse crate::x;\n",
                ),
                ("src/config.rs", "use regex::Regex;\n"),
                ("tests/cli.rs", "use assert_cmd::Command;\nuse regex::Regex;\n"),
                ("build.rs", "extern crate cc;\n"),
            ],
        );

        let report = handler().scan(dir.path(), &ScanContext::default()).unwrap();

        let found: Vec<_> = report
            .dependencies
            .iter()
            .skip(report.declared)
            .map(|d| (d.manifest_name(), d.version.as_deref(), d.scope.clone()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("assert_cmd", None, Scope::Test),
                ("cc", None, Scope::Build),
                ("regex", None, Scope::Compile),
                ("tokio-util", Some("0.7.10"), Scope::Compile),
            ]
        );
        assert_eq!(report.added, 4);
    }

    #[test]
    fn test_write_keeps_package_and_table_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("Cargo.toml", CARGO_TOML)]);
        let deps = vec![
            Dependency::package(Ecosystem::Rust, "serde", Some("1.0.150"), Scope::Compile),
            Dependency::package(Ecosystem::Rust, "helpers", None, Scope::Compile),
            Dependency::package(Ecosystem::Rust, "libc", Some("0.2"), Scope::Compile),
            Dependency::package(Ecosystem::Rust, "regex", None, Scope::Compile),
            Dependency::package(Ecosystem::Rust, "cc", Some("1.0"), Scope::Build),
            Dependency::package(Ecosystem::Rust, "tempfile", Some("3"), Scope::Test),
        ];

        let path = handler()
            .generate_recovery_file(&deps, dir.path(), &dir.path().join("b"))
            .unwrap();

        let doc: toml::Table = toml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(doc["package"]["name"].as_str(), Some("my-app"));
        assert!(doc.contains_key("features"));
        let main = doc["dependencies"].as_table().unwrap();
        assert_eq!(main["serde"]["version"].as_str(), Some("1.0.150"));
        assert_eq!(main["serde"]["features"][0].as_str(), Some("derive"));
        assert_eq!(main["helpers"]["path"].as_str(), Some("../helpers"));
        assert_eq!(main["regex"].as_str(), Some("*"));
        assert!(!main.contains_key("libc"));
        assert!(!main.contains_key("anyhow"));
        assert_eq!(doc["build-dependencies"]["cc"].as_str(), Some("1.0"));
        assert_eq!(doc["dev-dependencies"]["tempfile"].as_str(), Some("3"));
        assert_eq!(doc["target"]["cfg(unix)"]["dependencies"]["libc"].as_str(), Some("0.2"));
    }

    #[test]
    fn test_new_manifest_and_omit_policy() {
        let mut policy = EcosystemPolicy::builtin(Ecosystem::Rust);
        policy.unresolved = crate::config::UnresolvedVersion::Omit;
        let deps = vec![
            Dependency::package(Ecosystem::Rust, "rand", None, Scope::Compile),
            Dependency::package(Ecosystem::Rust, "log", Some("0.4"), Scope::Compile),
        ];

        let out = render_cargo_toml("", "demo", &deps, &policy).unwrap();

        let doc: toml::Table = toml::from_str(&out).unwrap();
        assert_eq!(doc["package"]["name"].as_str(), Some("demo"));
        let main = doc["dependencies"].as_table().unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main["log"].as_str(), Some("0.4"));
    }

    #[test]
    fn test_virtual_workspace_gets_no_package() {
        let dir = tempfile::tempdir().unwrap();
        let existing = r#"[workspace]
members = ["crates/*"]
resolver = "2"

[workspace.dependencies]
serde = { version = "1", features = ["derive"] }
"#;
        write_tree(dir.path(), &[("Cargo.toml", existing)]);
        let report = handler().scan(dir.path(), &ScanContext::default()).unwrap();
        assert_eq!(report.declared, 1);

        let deps = vec![
            Dependency::package(Ecosystem::Rust, "serde", Some("1"), Scope::Compile),
            Dependency::package(Ecosystem::Rust, "tokio", Some("1.35"), Scope::Compile),
        ];
        let path = handler()
            .generate_recovery_file(&deps, dir.path(), &dir.path().join("b"))
            .unwrap();

        let doc: toml::Table = toml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert!(!doc.contains_key("package"));
        assert!(!doc.contains_key("dependencies"));
        assert_eq!(doc["workspace"]["resolver"].as_str(), Some("2"));
        let shared = doc["workspace"]["dependencies"].as_table().unwrap();
        assert_eq!(shared["serde"]["features"][0].as_str(), Some("derive"));
        assert_eq!(shared["tokio"].as_str(), Some("1.35"));
    }
}
