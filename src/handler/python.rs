use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EcosystemPolicy;
use crate::error::{RecoveryError, ScanError};
use crate::fsutil;
use crate::models::{Dependency, Ecosystem, Scope};

use super::{is_dev, read_manifest, reconcile, Evidence, Handler, ScanContext, ScanReport};

/// Standard library top-level modules. Not exhaustive; covers what shows up
/// in real projects.
const STDLIB: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "atexit", "base64", "binascii",
    "bisect", "builtins", "bz2", "calendar", "cmath", "codecs", "collections", "concurrent",
    "configparser", "contextlib", "contextvars", "copy", "csv", "ctypes", "dataclasses",
    "datetime", "decimal", "difflib", "dis", "email", "enum", "errno", "faulthandler", "fcntl",
    "filecmp", "fnmatch", "fractions", "ftplib", "functools", "gc", "getopt", "getpass",
    "gettext", "glob", "gzip", "hashlib", "heapq", "hmac", "html", "http", "imaplib",
    "importlib", "inspect", "io", "ipaddress", "itertools", "json", "keyword", "linecache",
    "locale", "logging", "lzma", "mailbox", "math", "mimetypes", "mmap", "multiprocessing",
    "numbers", "operator", "os", "pathlib", "pdb", "pickle", "pkgutil", "platform", "plistlib",
    "pprint", "profile", "queue", "random", "re", "readline", "resource", "sched", "secrets",
    "select", "selectors", "shelve", "shlex", "shutil", "signal", "site", "smtplib", "socket",
    "socketserver", "sqlite3", "ssl", "stat", "statistics", "string", "struct", "subprocess",
    "sys", "sysconfig", "tarfile", "tempfile", "textwrap", "threading", "time", "timeit",
    "tkinter", "token", "tokenize", "tomllib", "traceback", "types", "typing", "unicodedata",
    "unittest", "urllib", "uuid", "venv", "warnings", "weakref", "webbrowser", "wsgiref",
    "xml", "xmlrpc", "zipfile", "zipimport", "zlib", "zoneinfo",
];

/// Import names whose distribution is published under another name.
const DISTRIBUTION_NAMES: &[(&str, &str)] = &[
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("jwt", "PyJWT"),
    ("magic", "python-magic"),
    ("PIL", "Pillow"),
    ("sklearn", "scikit-learn"),
    ("yaml", "PyYAML"),
    ("Crypto", "pycryptodome"),
    ("OpenSSL", "pyOpenSSL"),
    ("git", "GitPython"),
    ("attr", "attrs"),
];

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*import\s+([A-Za-z_][\w.]*(?:\s*,\s*[A-Za-z_][\w.]*)*)").expect("import regex")
});
static FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*from\s+([A-Za-z_][\w.]*)\s+import\b").expect("from regex"));
static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[[^\]]*\])?\s*(.*)$").expect("requirement regex")
});

/// The manifest formats recognized, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Manifest {
    PyProject,
    SetupPy,
    Requirements,
    Pipfile,
    CondaEnv,
}

impl Manifest {
    const ORDER: [Manifest; 5] = [
        Manifest::PyProject,
        Manifest::SetupPy,
        Manifest::Requirements,
        Manifest::Pipfile,
        Manifest::CondaEnv,
    ];

    fn file_name(&self) -> &'static str {
        match self {
            Manifest::PyProject => "pyproject.toml",
            Manifest::SetupPy => "setup.py",
            Manifest::Requirements => "requirements.txt",
            Manifest::Pipfile => "Pipfile",
            Manifest::CondaEnv => "environment.yml",
        }
    }

    fn find(project: &Path) -> Option<Manifest> {
        Self::ORDER
            .into_iter()
            .find(|m| project.join(m.file_name()).exists())
    }
}

/// PyPI packages: the first manifest found plus `import` roots in `*.py`.
pub struct PythonHandler {
    policy: EcosystemPolicy,
}

impl PythonHandler {
    pub fn new(policy: EcosystemPolicy) -> Self {
        Self { policy }
    }
}

impl Handler for PythonHandler {
    fn name(&self) -> &'static str {
        "Python"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Python
    }

    fn detect(&self, project: &Path) -> bool {
        Manifest::find(project).is_some()
            || project.join("Pipfile.lock").exists()
            || std::fs::read_dir(project)
                .map(|entries| {
                    entries
                        .flatten()
                        .any(|e| e.path().extension().is_some_and(|x| x == "py"))
                })
                .unwrap_or(false)
    }

    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError> {
        let declared = match Manifest::find(project) {
            Some(manifest) => {
                let path = project.join(manifest.file_name());
                let content = read_manifest(&path)?;
                debug!(manifest = manifest.file_name(), "parsing declared dependencies");
                parse_manifest(manifest, &path, &content)?
            }
            None => Vec::new(),
        };

        let evidence = Evidence {
            declared,
            scanned: scan_sources(project),
            locked: parse_lockfiles(project),
        };
        reconcile(Ecosystem::Python, evidence, &self.policy, ctx)
    }

    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError> {
        let manifest = Manifest::find(project).unwrap_or(Manifest::Requirements);
        let path = project.join(manifest.file_name());
        let existing = std::fs::read_to_string(&path).unwrap_or_default();

        let contents = match manifest {
            Manifest::Requirements => render_requirements(deps, &self.policy),
            Manifest::PyProject => render_pyproject(&existing, deps, &self.policy)
                .map_err(|e| RecoveryError::serialize(&path, e))?,
            Manifest::SetupPy => render_setup_py(&existing, deps, &self.policy),
            Manifest::Pipfile => render_pipfile(&existing, deps, &self.policy)
                .map_err(|e| RecoveryError::serialize(&path, e))?,
            Manifest::CondaEnv => render_conda_env(&existing, deps, &self.policy)
                .map_err(|e| RecoveryError::serialize(&path, e))?,
        };
        fsutil::replace_manifest(&path, &contents, backup_dir)?;
        Ok(path)
    }
}

/// PEP 503 normalized form: lowercase, runs of `-_.` collapsed to `-`.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// A PyPI record keyed by its normalized name, so `Flask`, `flask` and
/// `FLASK` are one dependency.
fn pypi(name: &str, version: Option<&str>, scope: Scope) -> Dependency {
    let mut dep = Dependency::package(Ecosystem::Python, name.trim(), version, scope);
    let canonical = canonical_name(name);
    if !canonical.is_empty() {
        dep.key = format!("{}:{}", Ecosystem::Python.group_tag(), canonical);
    }
    dep
}

/// Split a PEP 508 requirement into name and version. `==` pins yield the
/// bare version; other specifiers are kept with their operator.
fn parse_requirement(line: &str, scope: Scope) -> Option<Dependency> {
    let line = line.split('#').next().unwrap_or_default();
    let line = line.split(';').next().unwrap_or_default().trim();
    if line.is_empty() || line.starts_with('-') || line.contains("://") {
        return None;
    }
    let caps = REQUIREMENT_RE.captures(line)?;
    let spec = caps[2].trim().trim_start_matches('(').trim_end_matches(')').trim();
    let version = match spec.strip_prefix("==") {
        Some(pin) => pin.trim(),
        None => spec,
    };
    Some(pypi(&caps[1], Some(version), scope))
}

fn parse_manifest(manifest: Manifest, path: &Path, content: &str) -> Result<Vec<Dependency>, ScanError> {
    match manifest {
        Manifest::Requirements => Ok(content
            .lines()
            .filter_map(|l| parse_requirement(l, Scope::Compile))
            .collect()),
        Manifest::PyProject => parse_pyproject(content).map_err(|e| ScanError::manifest(path, e)),
        Manifest::SetupPy => Ok(parse_setup_py(content)),
        Manifest::Pipfile => parse_pipfile(content).map_err(|e| ScanError::manifest(path, e)),
        Manifest::CondaEnv => parse_conda_env(content).map_err(|e| ScanError::manifest(path, e)),
    }
}

fn parse_pyproject(content: &str) -> Result<Vec<Dependency>, toml::de::Error> {
    let doc: toml::Table = toml::from_str(content)?;
    let mut deps = Vec::new();

    if let Some(project) = doc.get("project").and_then(|v| v.as_table()) {
        for item in array_strings(project.get("dependencies")) {
            deps.extend(parse_requirement(item, Scope::Compile));
        }
        if let Some(extras) = project.get("optional-dependencies").and_then(|v| v.as_table()) {
            for (group, items) in extras {
                let scope = group_scope(group);
                for item in array_strings(Some(items)) {
                    deps.extend(parse_requirement(item, scope.clone()));
                }
            }
        }
    }

    if let Some(poetry) = doc
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.as_table())
    {
        if let Some(table) = poetry.get("dependencies").and_then(|v| v.as_table()) {
            deps.extend(poetry_table(table, Scope::Compile));
        }
        if let Some(table) = poetry.get("dev-dependencies").and_then(|v| v.as_table()) {
            deps.extend(poetry_table(table, Scope::Test));
        }
        if let Some(groups) = poetry.get("group").and_then(|v| v.as_table()) {
            for (group, body) in groups {
                if let Some(table) = body.get("dependencies").and_then(|v| v.as_table()) {
                    deps.extend(poetry_table(table, group_scope(group)));
                }
            }
        }
    }
    Ok(deps)
}

fn array_strings(value: Option<&toml::Value>) -> impl Iterator<Item = &str> {
    value
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
}

fn group_scope(group: &str) -> Scope {
    match group {
        "test" | "tests" | "testing" | "dev" => Scope::Test,
        _ => Scope::Compile,
    }
}

/// Poetry and Pipfile tables: `name = "spec"` or `name = { version = "spec" }`.
fn poetry_table(table: &toml::Table, scope: Scope) -> Vec<Dependency> {
    table
        .iter()
        .filter(|(name, _)| name.as_str() != "python")
        .map(|(name, spec)| {
            let version = match spec {
                toml::Value::String(s) => Some(s.as_str()),
                toml::Value::Table(t) => t.get("version").and_then(|v| v.as_str()),
                _ => None,
            };
            pypi(name, version.filter(|v| *v != "*"), scope.clone())
        })
        .collect()
}

fn parse_setup_py(content: &str) -> Vec<Dependency> {
    static INSTALL_REQUIRES: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)install_requires\s*=\s*\[(.*?)\]").expect("install_requires regex")
    });
    static QUOTED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"["']([^"']+)["']"#).expect("quoted string regex"));

    let Some(block) = INSTALL_REQUIRES.captures(content) else {
        return Vec::new();
    };
    QUOTED
        .captures_iter(&block[1])
        .filter_map(|c| parse_requirement(&c[1], Scope::Compile))
        .collect()
}

fn parse_pipfile(content: &str) -> Result<Vec<Dependency>, toml::de::Error> {
    let doc: toml::Table = toml::from_str(content)?;
    let mut deps = Vec::new();
    if let Some(t) = doc.get("packages").and_then(|v| v.as_table()) {
        deps.extend(poetry_table(t, Scope::Compile));
    }
    if let Some(t) = doc.get("dev-packages").and_then(|v| v.as_table()) {
        deps.extend(poetry_table(t, Scope::Test));
    }
    Ok(deps)
}

fn parse_conda_env(content: &str) -> Result<Vec<Dependency>, serde_yaml::Error> {
    let doc: serde_yaml::Value = serde_yaml::from_str(content)?;
    let mut deps = Vec::new();
    let Some(items) = doc.get("dependencies").and_then(|v| v.as_sequence()) else {
        return Ok(deps);
    };
    for item in items {
        match item {
            serde_yaml::Value::String(s) => {
                let (name, version) = match s.split_once('=') {
                    Some((n, v)) => (n, Some(v.trim_start_matches('='))),
                    None => (s.as_str(), None),
                };
                if name.trim() != "python" && name.trim() != "pip" {
                    deps.push(pypi(name, version, Scope::Compile));
                }
            }
            // `- pip: [ "requests==2.31.0" ]`
            serde_yaml::Value::Mapping(m) => {
                if let Some(pip) = m.get("pip").and_then(|v| v.as_sequence()) {
                    deps.extend(
                        pip.iter()
                            .filter_map(|v| v.as_str())
                            .filter_map(|r| parse_requirement(r, Scope::Compile)),
                    );
                }
            }
            _ => {}
        }
    }
    Ok(deps)
}

#[derive(Debug, Deserialize)]
struct LockedPackage {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct PoetryLock {
    #[serde(default)]
    package: Vec<LockedPackage>,
}

/// Pinned versions from `Pipfile.lock` and `poetry.lock`.
fn parse_lockfiles(project: &Path) -> Vec<Dependency> {
    let mut deps = Vec::new();

    let pipfile_lock = project.join("Pipfile.lock");
    if let Ok(content) = std::fs::read_to_string(&pipfile_lock) {
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(json) => {
                for section in ["default", "develop"] {
                    if let Some(pkgs) = json.get(section).and_then(|v| v.as_object()) {
                        for (name, info) in pkgs {
                            let version = info
                                .get("version")
                                .and_then(|v| v.as_str())
                                .map(|v| v.trim_start_matches("=="));
                            deps.push(pypi(name, version, Scope::Compile));
                        }
                    }
                }
            }
            Err(e) => warn!(path = %pipfile_lock.display(), error = %e, "ignoring unreadable lockfile"),
        }
    }

    let poetry_lock = project.join("poetry.lock");
    if let Ok(content) = std::fs::read_to_string(&poetry_lock) {
        match toml::from_str::<PoetryLock>(&content) {
            Ok(lock) => deps.extend(
                lock.package
                    .iter()
                    .map(|p| pypi(&p.name, Some(&p.version), Scope::Compile)),
            ),
            Err(e) => warn!(path = %poetry_lock.display(), error = %e, "ignoring unreadable lockfile"),
        }
    }
    deps
}

/// Top-level modules defined by the project itself.
fn local_modules(project: &Path) -> HashSet<String> {
    let mut out = HashSet::new();
    for root in [project.to_path_buf(), project.join("src")] {
        let Ok(entries) = std::fs::read_dir(&root) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.is_dir() || path.extension().is_some_and(|x| x == "py") {
                out.insert(stem.to_string());
            }
        }
    }
    out
}

fn scan_sources(project: &Path) -> Vec<Dependency> {
    let local = local_modules(project);
    let mut found: BTreeMap<String, Scope> = BTreeMap::new();

    for file in fsutil::source_files(project, &["py"]) {
        let Ok(source) = std::fs::read_to_string(&file) else {
            continue;
        };
        let scope = if is_test_file(file.strip_prefix(project).unwrap_or(&file)) {
            Scope::Test
        } else {
            Scope::Compile
        };
        for module in import_roots(&source) {
            if STDLIB.contains(&module.as_str()) || local.contains(&module) {
                continue;
            }
            let dist = DISTRIBUTION_NAMES
                .iter()
                .find(|(import, _)| *import == module)
                .map(|(_, dist)| dist.to_string())
                .unwrap_or(module);
            let entry = found.entry(dist).or_insert_with(|| scope.clone());
            if scope == Scope::Compile {
                *entry = Scope::Compile;
            }
        }
    }
    found
        .into_iter()
        .map(|(name, scope)| pypi(&name, None, scope))
        .collect()
}

fn import_roots(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    for caps in IMPORT_RE.captures_iter(source) {
        for module in caps[1].split(',') {
            out.extend(root_of(module));
        }
    }
    for caps in FROM_RE.captures_iter(source) {
        out.extend(root_of(&caps[1]));
    }
    out
}

fn root_of(module: &str) -> Option<String> {
    let root = module.trim().split('.').next()?.trim();
    (!root.is_empty()).then(|| root.to_string())
}

fn is_test_file(rel: &Path) -> bool {
    let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.starts_with("test_")
        || name.ends_with("_test.py")
        || name == "conftest.py"
        || rel
            .components()
            .any(|c| matches!(c.as_os_str().to_str(), Some("test" | "tests")))
}

/// Placeholder pinned for an unresolved version, or `None` to write the
/// bare name (`omit` and `empty`).
fn unresolved_pin(policy: &EcosystemPolicy) -> Option<&'static str> {
    policy.unresolved.placeholder().filter(|p| !p.is_empty())
}

/// `name==1.0`, `name>=2` (specifier kept); unresolved versions follow the
/// policy: bare `name`, or `name==<placeholder>`.
fn requirement_line(dep: &Dependency, policy: &EcosystemPolicy) -> String {
    let name = dep.manifest_name();
    match dep.version.as_deref() {
        Some(v) if v.starts_with(['<', '>', '=', '!', '~']) => format!("{}{}", name, v),
        Some(v) => format!("{}=={}", name, v),
        None => match unresolved_pin(policy) {
            Some(p) => format!("{}=={}", name, p),
            None => name.to_string(),
        },
    }
}

fn split_by_scope(deps: &[Dependency]) -> (Vec<&Dependency>, Vec<&Dependency>) {
    deps.iter()
        .filter(|d| !d.manifest_name().is_empty())
        .partition(|d| !is_dev(d))
}

fn render_requirements(deps: &[Dependency], policy: &EcosystemPolicy) -> String {
    let (main, test) = split_by_scope(deps);
    let mut out = String::new();
    for dep in main {
        out.push_str(&requirement_line(dep, policy));
        out.push('\n');
    }
    if !test.is_empty() {
        out.push_str("\n# test\n");
        for dep in test {
            out.push_str(&requirement_line(dep, policy));
            out.push('\n');
        }
    }
    out
}

fn toml_requirements(deps: &[&Dependency], policy: &EcosystemPolicy) -> toml::Value {
    toml::Value::Array(
        deps.iter()
            .map(|d| toml::Value::String(requirement_line(d, policy)))
            .collect(),
    )
}

/// Poetry and Pipfile need a value for every entry; `omit` and `empty`
/// fall back to `*`.
fn table_spec(version: Option<&str>, policy: &EcosystemPolicy) -> String {
    match version {
        Some(v) => v.to_string(),
        None => unresolved_pin(policy).unwrap_or("*").to_string(),
    }
}

fn poetry_spec(dep: &Dependency, policy: &EcosystemPolicy) -> toml::Value {
    toml::Value::String(table_spec(dep.version.as_deref(), policy))
}

/// Rewrite dependency tables in place; every other table is preserved.
fn render_pyproject(
    existing: &str,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> Result<String, toml::ser::Error> {
    let mut doc: toml::Table = toml::from_str(existing).unwrap_or_default();
    let (main, test) = split_by_scope(deps);

    let is_poetry = doc
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("dependencies"))
        .is_some();

    if is_poetry {
        let poetry = doc
            .get_mut("tool")
            .and_then(|t| t.get_mut("poetry"))
            .and_then(|p| p.as_table_mut());
        if let Some(poetry) = poetry {
            let python = poetry
                .get("dependencies")
                .and_then(|d| d.get("python"))
                .cloned();
            let mut table = toml::Table::new();
            if let Some(python) = python {
                table.insert("python".into(), python);
            }
            for dep in &main {
                table.insert(dep.manifest_name().to_string(), poetry_spec(dep, policy));
            }
            poetry.insert("dependencies".into(), toml::Value::Table(table));

            poetry.remove("dev-dependencies");
            if !test.is_empty() {
                let dev: toml::Table = test
                    .iter()
                    .map(|d| (d.manifest_name().to_string(), poetry_spec(d, policy)))
                    .collect();
                let mut group = toml::Table::new();
                group.insert("dependencies".into(), toml::Value::Table(dev));
                let groups = poetry
                    .entry("group")
                    .or_insert_with(|| toml::Value::Table(toml::Table::new()));
                if let Some(groups) = groups.as_table_mut() {
                    groups.insert("dev".into(), toml::Value::Table(group));
                }
            }
        }
    } else {
        let project = doc
            .entry("project")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let Some(project) = project.as_table_mut() {
            project.insert("dependencies".into(), toml_requirements(&main, policy));
            if !test.is_empty() {
                let extras = project
                    .entry("optional-dependencies")
                    .or_insert_with(|| toml::Value::Table(toml::Table::new()));
                if let Some(extras) = extras.as_table_mut() {
                    extras.insert("test".into(), toml_requirements(&test, policy));
                }
            }
        }
    }
    toml::to_string(&doc)
}

/// Regenerate `setup.py`, keeping the package name and version.
fn render_setup_py(existing: &str, deps: &[Dependency], policy: &EcosystemPolicy) -> String {
    static FIELD: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"\b(name|version)\s*=\s*["']([^"']+)["']"#).expect("setup field regex")
    });
    let (main, test) = split_by_scope(deps);

    let mut out = String::from("from setuptools import setup, find_packages\n\nsetup(\n");
    for caps in FIELD.captures_iter(existing) {
        out.push_str(&format!("    {}=\"{}\",\n", &caps[1], &caps[2]));
    }
    out.push_str("    packages=find_packages(),\n    install_requires=[\n");
    for dep in main {
        out.push_str(&format!("        \"{}\",\n", requirement_line(dep, policy)));
    }
    out.push_str("    ],\n");
    if !test.is_empty() {
        out.push_str("    extras_require={\n        \"test\": [\n");
        for dep in test {
            out.push_str(&format!("            \"{}\",\n", requirement_line(dep, policy)));
        }
        out.push_str("        ],\n    },\n");
    }
    out.push_str(")\n");
    out
}

fn render_pipfile(
    existing: &str,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> Result<String, toml::ser::Error> {
    let mut doc: toml::Table = toml::from_str(existing).unwrap_or_default();
    let (main, test) = split_by_scope(deps);
    let section = |items: &[&Dependency]| -> toml::Value {
        toml::Value::Table(
            items
                .iter()
                .map(|d| {
                    let spec = match d.version.as_deref() {
                        Some(v) if v.starts_with(['<', '>', '=', '!', '~']) => v.to_string(),
                        Some(v) => format!("=={}", v),
                        None => table_spec(None, policy),
                    };
                    (d.manifest_name().to_string(), toml::Value::String(spec))
                })
                .collect(),
        )
    };
    doc.insert("packages".into(), section(main.as_slice()));
    doc.insert("dev-packages".into(), section(test.as_slice()));
    toml::to_string(&doc)
}

fn render_conda_env(
    existing: &str,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> Result<String, serde_yaml::Error> {
    use serde_yaml::{Mapping, Value};

    let mut doc = match serde_yaml::from_str::<Value>(existing) {
        Ok(Value::Mapping(m)) => m,
        _ => Mapping::new(),
    };
    // Interpreter and pip pins are environment setup, not packages.
    let mut items: Vec<Value> = doc
        .get("dependencies")
        .and_then(|v| v.as_sequence())
        .into_iter()
        .flatten()
        .filter(|v| {
            v.as_str().is_some_and(|s| {
                let name = s.split('=').next().unwrap_or_default().trim();
                name == "python" || name == "pip"
            })
        })
        .cloned()
        .collect();

    let (main, test) = split_by_scope(deps);
    for dep in main.into_iter().chain(test) {
        let entry = match dep.version.as_deref() {
            Some(v) => format!("{}={}", dep.manifest_name(), v.trim_start_matches('=')),
            None => match unresolved_pin(policy) {
                Some(p) => format!("{}={}", dep.manifest_name(), p),
                None => dep.manifest_name().to_string(),
            },
        };
        items.push(Value::String(entry));
    }
    doc.insert(Value::String("dependencies".into()), Value::Sequence(items));
    serde_yaml::to_string(&Value::Mapping(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnresolvedVersion;
    use crate::handler::tests::write_tree;

    fn policy() -> EcosystemPolicy {
        EcosystemPolicy::builtin(Ecosystem::Python)
    }

    fn handler() -> PythonHandler {
        PythonHandler::new(policy())
    }

    #[test]
    fn test_parse_requirement_lines() {
        let pinned = parse_requirement("requests==2.28.1", Scope::Compile).unwrap();
        assert_eq!(pinned.version.as_deref(), Some("2.28.1"));
        assert_eq!(pinned.key, "pypi:requests");

        let ranged = parse_requirement("Flask[async] >= 2.0 ; python_version >= '3.8'", Scope::Compile)
            .unwrap();
        assert_eq!(ranged.artifact_id, "Flask");
        assert_eq!(ranged.key, "pypi:flask");
        assert_eq!(ranged.version.as_deref(), Some(">= 2.0"));

        let bare = parse_requirement("numpy  # comment", Scope::Compile).unwrap();
        assert_eq!(bare.version, None);

        assert!(parse_requirement("-r other.txt", Scope::Compile).is_none());
        assert!(parse_requirement("# only a comment", Scope::Compile).is_none());
        assert!(parse_requirement("git+https://github.com/x/y.git", Scope::Compile).is_none());
    }

    #[test]
    fn test_canonical_names() {
        assert_eq!(canonical_name("Zope.Interface"), "zope-interface");
        assert_eq!(canonical_name("typing__extensions"), "typing-extensions");
    }

    #[test]
    fn test_parse_pyproject_pep621_and_poetry() {
        let pep621 = r#"
[project]
name = "app"
dependencies = ["requests==2.31.0", "click>=8"]

[project.optional-dependencies]
test = ["pytest"]
"#;
        let deps = parse_pyproject(pep621).unwrap();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[2].scope, Scope::Test);

        let poetry = r#"
[tool.poetry.dependencies]
python = "^3.10"
fastapi = "^0.100"
uvicorn = { version = "0.23.0", extras = ["standard"] }

[tool.poetry.group.dev.dependencies]
pytest = "*"
"#;
        let deps = parse_pyproject(poetry).unwrap();
        let names: Vec<_> = deps.iter().map(|d| d.artifact_id.as_str()).collect();
        assert_eq!(names, vec!["fastapi", "uvicorn", "pytest"]);
        assert_eq!(deps[1].version.as_deref(), Some("0.23.0"));
        assert_eq!(deps[2].version, None);
        assert_eq!(deps[2].scope, Scope::Test);
    }

    #[test]
    fn test_parse_setup_py_and_conda() {
        let setup = r#"setup(
    name="x",
    install_requires=[
        "requests>=2",
        'six',
    ],
)"#;
        let deps = parse_setup_py(setup);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[1].artifact_id, "six");

        let env = "name: x\ndependencies:\n  - python=3.11\n  - numpy=1.26\n  - pip:\n    - requests==2.31.0\n";
        let deps = parse_conda_env(env).unwrap();
        let names: Vec<_> = deps.iter().map(|d| d.artifact_id.as_str()).collect();
        assert_eq!(names, vec!["numpy", "requests"]);
        assert_eq!(deps[0].version.as_deref(), Some("1.26"));
    }

    #[test]
    fn test_import_roots() {
        let src = "import os, sys\nimport numpy as np\nfrom sklearn.model_selection import x\nfrom . import sibling\n  import yaml.loader\n";
        assert_eq!(import_roots(src), vec!["os", "sys", "numpy", "yaml", "sklearn"]);
    }

    #[test]
    fn test_scan_skips_stdlib_and_local_modules() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("requirements.txt", "Requests==2.31.0\n"),
                ("app.py", "import os\nimport requests\nimport helpers\nfrom yaml import safe_load\n"),
                ("helpers.py", "import json\n"),
                ("tests/test_app.py", "import pytest\nimport requests\n"),
                ("venv/lib/site.py", "import ignored_pkg\n"),
            ],
        );

        let report = handler().scan(dir.path(), &ScanContext::default()).unwrap();

        let names: Vec<_> = report.dependencies.iter().map(|d| d.artifact_id.as_str()).collect();
        assert_eq!(names, vec!["Requests", "PyYAML", "pytest"]);
        assert_eq!(report.added, 2);
        assert_eq!(report.dependencies[2].scope, Scope::Test);
    }

    #[test]
    fn test_write_requirements_by_default() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("main.py", "import flask\n")]);
        let deps = vec![
            pypi("flask", Some("3.0.0"), Scope::Compile),
            pypi("click", Some(">=8"), Scope::Compile),
            pypi("requests", None, Scope::Compile),
            pypi("pytest", None, Scope::Test),
        ];

        let path = handler()
            .generate_recovery_file(&deps, dir.path(), &dir.path().join("b"))
            .unwrap();

        assert!(path.ends_with("requirements.txt"));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "flask==3.0.0\nclick>=8\nrequests\n\n# test\npytest\n"
        );
    }

    #[test]
    fn test_write_pyproject_preserves_metadata() {
        let existing = "[project]\nname = \"app\"\nversion = \"0.1.0\"\ndependencies = [\"old\"]\n\n[tool.black]\nline-length = 100\n";
        let deps = vec![pypi("requests", Some("2.31.0"), Scope::Compile)];

        let out = render_pyproject(existing, &deps, &policy()).unwrap();
        let doc: toml::Table = toml::from_str(&out).unwrap();

        assert_eq!(doc["project"]["name"].as_str(), Some("app"));
        assert_eq!(doc["tool"]["black"]["line-length"].as_integer(), Some(100));
        let listed: Vec<_> = doc["project"]["dependencies"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(listed, vec!["requests==2.31.0"]);
    }

    #[test]
    fn test_write_pipfile_and_setup_py() {
        let deps = vec![
            pypi("requests", Some("2.31.0"), Scope::Compile),
            pypi("pytest", None, Scope::Test),
        ];
        let pipfile =
            render_pipfile("[requires]\npython_version = \"3.11\"\n", &deps, &policy()).unwrap();
        let doc: toml::Table = toml::from_str(&pipfile).unwrap();
        assert_eq!(doc["packages"]["requests"].as_str(), Some("==2.31.0"));
        assert_eq!(doc["dev-packages"]["pytest"].as_str(), Some("*"));
        assert_eq!(doc["requires"]["python_version"].as_str(), Some("3.11"));

        let setup = render_setup_py("setup(name='app', version='1.2')", &deps, &policy());
        assert!(setup.contains("    name=\"app\",\n    version=\"1.2\",\n"));
        assert!(setup.contains("        \"requests==2.31.0\",\n"));
        assert!(setup.contains("\"test\": [\n            \"pytest\",\n"));
    }

    #[test]
    fn test_unresolved_rendering_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("main.py", "import requests
")]);
        let deps = vec![
            pypi("requests", None, Scope::Compile),
            pypi("pytest", None, Scope::Test),
        ];
        let mut wildcard = policy();
        wildcard.unresolved = UnresolvedVersion::Wildcard;

        let path = PythonHandler::new(wildcard)
            .generate_recovery_file(&deps, dir.path(), &dir.path().join("b"))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "requests==*\n\n# test\npytest==*\n"
        );

        let mut latest = policy();
        latest.unresolved = UnresolvedVersion::Latest;
        let pipfile = render_pipfile("", &deps, &latest).unwrap();
        let doc: toml::Table = toml::from_str(&pipfile).unwrap();
        assert_eq!(doc["packages"]["requests"].as_str(), Some("latest"));

        let poetry = "[tool.poetry.dependencies]\npython = \"^3.11\"\n";
        let out = render_pyproject(poetry, &deps, &latest).unwrap();
        let doc: toml::Table = toml::from_str(&out).unwrap();
        assert_eq!(
            doc["tool"]["poetry"]["dependencies"]["requests"].as_str(),
            Some("latest")
        );

        let conda = render_conda_env("dependencies:\n  - python=3.11\n", &deps, &wildcard).unwrap();
        assert!(conda.contains("requests=*"));

        let mut empty = policy();
        empty.unresolved = UnresolvedVersion::Empty;
        assert_eq!(render_requirements(&deps, &empty), "requests\n\n# test\npytest\n");
        let setup = render_setup_py("", &deps, &wildcard);
        assert!(setup.contains("        \"requests==*\",\n"));
    }
}
