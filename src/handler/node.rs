use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::EcosystemPolicy;
use crate::error::{RecoveryError, ScanError};
use crate::fsutil;
use crate::models::{Dependency, Ecosystem, Scope};

use super::{is_dev, read_manifest, reconcile, Evidence, Handler, ScanContext, ScanReport};

const SOURCE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];
const LOCKFILES: &[&str] = &["package-lock.json", "yarn.lock", "pnpm-lock.yaml"];

/// Node core modules; never packages.
const BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "cluster", "console", "constants",
    "crypto", "dgram", "diagnostics_channel", "dns", "domain", "events", "fs", "http", "http2",
    "https", "inspector", "module", "net", "os", "path", "perf_hooks", "process", "punycode",
    "querystring", "readline", "repl", "stream", "string_decoder", "sys", "timers", "tls",
    "trace_events", "tty", "url", "util", "v8", "vm", "wasi", "worker_threads", "zlib",
];

static FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\b[^'"]*?\bfrom\s+['"]([^'"]+)['"]"#)
        .expect("from clause regex")
});
static BARE_IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*import\s+['"]([^'"]+)['"]"#).expect("bare import regex"));
static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:require|import)\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("require regex")
});

/// npm packages: `package.json` plus `import`/`require` in JS and TS sources.
pub struct NodeHandler {
    policy: EcosystemPolicy,
}

impl NodeHandler {
    pub fn new(policy: EcosystemPolicy) -> Self {
        Self { policy }
    }
}

impl Handler for NodeHandler {
    fn name(&self) -> &'static str {
        "Node.js"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Node
    }

    fn detect(&self, project: &Path) -> bool {
        project.join("package.json").exists()
            || LOCKFILES.iter().any(|f| project.join(f).exists())
            || fsutil::has_source_file(project, SOURCE_EXTENSIONS)
    }

    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError> {
        let pkg = project.join("package.json");
        let declared = if pkg.exists() {
            parse_package_json(&pkg, &read_manifest(&pkg)?)?
        } else {
            Vec::new()
        };

        let mut locked = Vec::new();
        let lock = project.join("package-lock.json");
        if let Ok(content) = std::fs::read_to_string(&lock) {
            match parse_package_lock(&content) {
                Ok(deps) => locked.extend(deps),
                Err(e) => warn!(path = %lock.display(), error = %e, "ignoring unreadable lockfile"),
            }
        }
        if let Ok(content) = std::fs::read_to_string(project.join("yarn.lock")) {
            locked.extend(parse_yarn_lock(&content));
        }

        let evidence = Evidence {
            declared,
            scanned: scan_sources(project),
            locked,
        };
        reconcile(Ecosystem::Node, evidence, &self.policy, ctx)
    }

    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError> {
        let path = project.join("package.json");
        let existing = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<Value>(&s).ok());
        let mut root = match existing {
            Some(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                let name = project
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_else(|| "recovered".to_string());
                map.insert("name".into(), Value::String(name));
                map.insert("version".into(), Value::String("1.0.0".into()));
                map
            }
        };

        let sections = render_sections(deps, &self.policy);
        set_section(&mut root, "dependencies", sections.main);
        set_section(&mut root, "devDependencies", sections.dev);
        set_section(&mut root, "optionalDependencies", sections.optional);

        let mut contents = serde_json::to_string_pretty(&Value::Object(root))
            .map_err(|e| RecoveryError::serialize(&path, e))?;
        contents.push('\n');
        fsutil::replace_manifest(&path, &contents, backup_dir)?;
        Ok(path)
    }
}

fn parse_package_json(path: &Path, content: &str) -> Result<Vec<Dependency>, ScanError> {
    let json: Value = serde_json::from_str(content).map_err(|e| ScanError::manifest(path, e))?;
    let mut deps = Vec::new();

    for (section, scope) in [
        ("dependencies", Scope::Compile),
        ("devDependencies", Scope::Test),
        ("optionalDependencies", Scope::Runtime),
    ] {
        if let Some(pkgs) = json.get(section).and_then(|v| v.as_object()) {
            for (name, range) in pkgs {
                deps.push(Dependency::package(
                    Ecosystem::Node,
                    name,
                    range.as_str(),
                    scope.clone(),
                ));
            }
        }
    }
    Ok(deps)
}

/// `package-lock.json` v2/v3: the `packages` map keyed by install path.
fn parse_package_lock(content: &str) -> Result<Vec<Dependency>, serde_json::Error> {
    let json: Value = serde_json::from_str(content)?;
    let mut deps = Vec::new();

    if let Some(packages) = json.get("packages").and_then(|v| v.as_object()) {
        for (pkg_path, info) in packages {
            // The root entry has an empty key.
            if pkg_path.is_empty() {
                continue;
            }
            // "node_modules/a/node_modules/@s/b" → "@s/b"
            let name = pkg_path
                .rsplit_once("node_modules/")
                .map(|(_, n)| n)
                .unwrap_or(pkg_path);
            let version = info.get("version").and_then(|v| v.as_str());
            deps.push(Dependency::package(Ecosystem::Node, name, version, Scope::Compile));
        }
    }
    Ok(deps)
}

/// `yarn.lock` classic format: `name@range:` headers followed by `version "x"`.
fn parse_yarn_lock(content: &str) -> Vec<Dependency> {
    static HEADER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"^"?(@?[^@"]+)@"#).expect("yarn header regex"));
    static VERSION: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"^\s+version:?\s+"?([^"\s]+)"?"#).expect("yarn version regex"));

    let mut deps = Vec::new();
    let mut current: Option<String> = None;
    for line in content.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !line.starts_with(' ') {
            current = HEADER.captures(line).map(|c| c[1].to_string());
            continue;
        }
        if let (Some(name), Some(caps)) = (&current, VERSION.captures(line)) {
            deps.push(Dependency::package(Ecosystem::Node, name, Some(&caps[1]), Scope::Compile));
            current = None;
        }
    }
    deps
}

/// Package names imported by project sources. A package used by any
/// non-test file is a runtime dependency; test-only usage is dev.
fn scan_sources(project: &Path) -> Vec<Dependency> {
    let mut found: BTreeMap<String, Scope> = BTreeMap::new();
    for file in fsutil::source_files(project, SOURCE_EXTENSIONS) {
        let Ok(source) = std::fs::read_to_string(&file) else {
            continue;
        };
        let scope = if is_test_file(file.strip_prefix(project).unwrap_or(&file)) {
            Scope::Test
        } else {
            Scope::Compile
        };
        for spec in import_specifiers(&source) {
            let Some(name) = package_name(&spec) else {
                continue;
            };
            let entry = found.entry(name).or_insert_with(|| scope.clone());
            if scope == Scope::Compile {
                *entry = Scope::Compile;
            }
        }
    }
    debug!(packages = found.len(), "collected imports from sources");
    found
        .into_iter()
        .map(|(name, scope)| Dependency::package(Ecosystem::Node, &name, None, scope))
        .collect()
}

fn import_specifiers(source: &str) -> Vec<String> {
    [&*FROM_RE, &*BARE_IMPORT_RE, &*CALL_RE]
        .iter()
        .flat_map(|re| re.captures_iter(source).map(|c| c[1].to_string()))
        .collect()
}

fn is_test_file(rel: &Path) -> bool {
    let name = rel
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    name.contains(".test.")
        || name.contains(".spec.")
        || rel.components().any(|c| {
            matches!(
                c.as_os_str().to_str(),
                Some("test" | "tests" | "__tests__" | "__mocks__")
            )
        })
}

/// Reduce an import specifier to its package name, or `None` for relative
/// paths, URLs, aliases and Node builtins.
fn package_name(spec: &str) -> Option<String> {
    let spec = spec.trim();
    if spec.is_empty()
        || spec.starts_with('.')
        || spec.starts_with('/')
        || spec.starts_with('~')
        || spec.starts_with("@/")
        || spec.contains(':')
    {
        return None;
    }
    let mut parts = spec.split('/');
    let first = parts.next()?;
    let name = if first.starts_with('@') {
        format!("{}/{}", first, parts.next().filter(|s| !s.is_empty())?)
    } else {
        first.to_string()
    };
    if BUILTINS.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

/// package.json dependency tables, one per scope group.
#[derive(Debug, Default)]
struct Sections {
    main: Map<String, Value>,
    dev: Map<String, Value>,
    /// Runtime scope, read from and written to `optionalDependencies`.
    optional: Map<String, Value>,
}

fn render_sections(deps: &[Dependency], policy: &EcosystemPolicy) -> Sections {
    let mut sections = Sections::default();
    for dep in deps {
        let name = dep.manifest_name();
        if name.is_empty() {
            continue;
        }
        let version = match (dep.version.as_deref(), policy.unresolved.placeholder()) {
            (Some(v), _) => v,
            (None, Some(p)) => p,
            (None, None) => {
                debug!(package = name, "omitting unresolved package");
                continue;
            }
        };
        let target = if is_dev(dep) {
            &mut sections.dev
        } else if dep.scope == Scope::Runtime {
            &mut sections.optional
        } else {
            &mut sections.main
        };
        target
            .entry(name.to_string())
            .or_insert_with(|| Value::String(version.to_string()));
    }
    sections
}

fn set_section(root: &mut Map<String, Value>, key: &str, section: Map<String, Value>) {
    if section.is_empty() {
        root.remove(key);
    } else {
        root.insert(key.to_string(), Value::Object(section));
    }
}
