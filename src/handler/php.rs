use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::EcosystemPolicy;
use crate::error::{RecoveryError, ScanError};
use crate::fsutil;
use crate::models::{Dependency, Ecosystem, Scope};

use super::{is_dev, read_manifest, reconcile, Evidence, Handler, ScanContext, ScanReport};

/// Namespace prefix → Composer package, for vendors whose package name
/// is not derivable from the namespace. Longest prefix wins.
const NAMESPACE_PACKAGES: &[(&str, &str)] = &[
    ("Monolog\\", "monolog/monolog"),
    ("GuzzleHttp\\", "guzzlehttp/guzzle"),
    ("GuzzleHttp\\Psr7\\", "guzzlehttp/psr7"),
    ("Illuminate\\", "laravel/framework"),
    ("PHPUnit\\", "phpunit/phpunit"),
    ("Doctrine\\ORM\\", "doctrine/orm"),
    ("Doctrine\\DBAL\\", "doctrine/dbal"),
    ("Psr\\Log\\", "psr/log"),
    ("Psr\\Container\\", "psr/container"),
    ("Psr\\Http\\Message\\", "psr/http-message"),
    ("Carbon\\", "nesbot/carbon"),
    ("Ramsey\\Uuid\\", "ramsey/uuid"),
    ("Twig\\", "twig/twig"),
    ("League\\Flysystem\\", "league/flysystem"),
    ("Predis\\", "predis/predis"),
    ("Dotenv\\", "vlucas/phpdotenv"),
    ("Faker\\", "fakerphp/faker"),
    ("Mockery\\", "mockery/mockery"),
];

static USE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^use\s+(?:function\s+|const\s+)?\\?([A-Za-z0-9_\\]+)").expect("use regex")
});

#[derive(Debug, Default, Deserialize)]
struct ComposerLock {
    #[serde(default)]
    packages: Vec<LockedPackage>,
    #[serde(default, rename = "packages-dev")]
    packages_dev: Vec<LockedPackage>,
}

#[derive(Debug, Deserialize)]
struct LockedPackage {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    autoload: Autoload,
}

#[derive(Debug, Default, Deserialize)]
struct Autoload {
    #[serde(default, rename = "psr-4")]
    psr4: BTreeMap<String, Value>,
    #[serde(default, rename = "psr-0")]
    psr0: BTreeMap<String, Value>,
}

impl Autoload {
    fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.psr4
            .keys()
            .chain(self.psr0.keys())
            .map(String::as_str)
            .filter(|ns| !ns.is_empty())
    }
}

/// Composer: `composer.json`, `composer.lock`, and `use` statements.
pub struct PhpHandler {
    policy: EcosystemPolicy,
}

impl PhpHandler {
    pub fn new(policy: EcosystemPolicy) -> Self {
        Self { policy }
    }
}

impl Handler for PhpHandler {
    fn name(&self) -> &'static str {
        "PHP"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Php
    }

    fn detect(&self, project: &Path) -> bool {
        project.join("composer.json").exists()
            || project.join("composer.lock").exists()
            || fsutil::has_source_file(project, &["php"])
    }

    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError> {
        let manifest = project.join("composer.json");
        let (declared, own) = if manifest.exists() {
            let json: Value = serde_json::from_str(&read_manifest(&manifest)?)
                .map_err(|e| ScanError::manifest(&manifest, e))?;
            (parse_composer_json(&json), own_namespaces(&json))
        } else {
            (Vec::new(), Vec::new())
        };

        let lock_path = project.join("composer.lock");
        let lock = match std::fs::read_to_string(&lock_path) {
            Ok(content) => serde_json::from_str::<ComposerLock>(&content).unwrap_or_else(|e| {
                warn!(path = %lock_path.display(), error = %e, "ignoring unreadable lockfile");
                ComposerLock::default()
            }),
            Err(_) => ComposerLock::default(),
        };

        let mut namespaces: Vec<(String, String)> = NAMESPACE_PACKAGES
            .iter()
            .map(|(ns, pkg)| (ns.to_string(), pkg.to_string()))
            .collect();
        for pkg in lock.packages.iter().chain(&lock.packages_dev) {
            namespaces.extend(pkg.autoload.prefixes().map(|ns| (ns.to_string(), pkg.name.clone())));
        }

        let evidence = Evidence {
            declared,
            scanned: scan_sources(project, &namespaces, &own),
            locked: locked_packages(&lock),
        };
        reconcile(Ecosystem::Php, evidence, &self.policy, ctx)
    }

    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError> {
        let path = project.join("composer.json");
        let mut root = match std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let (main, dev) = render_sections(&root, deps, &self.policy);
        for (key, section) in [("require", main), ("require-dev", dev)] {
            if section.is_empty() {
                root.remove(key);
            } else {
                root.insert(key.to_string(), Value::Object(section));
            }
        }

        let mut contents = serde_json::to_string_pretty(&Value::Object(root))
            .map_err(|e| RecoveryError::serialize(&path, e))?;
        contents.push('\n');
        fsutil::replace_manifest(&path, &contents, backup_dir)?;
        Ok(path)
    }
}

/// `php`, `ext-*`, `lib-*` and Composer's own API are platform
/// requirements, not packages.
fn is_platform(name: &str) -> bool {
    name == "php"
        || name.starts_with("php-")
        || name.starts_with("ext-")
        || name.starts_with("lib-")
        || name.starts_with("composer-")
        || !name.contains('/')
}

fn package(name: &str, version: Option<&str>, scope: Scope) -> Dependency {
    Dependency::package(Ecosystem::Php, &name.to_lowercase(), version, scope)
}

fn parse_composer_json(json: &Value) -> Vec<Dependency> {
    let mut deps = Vec::new();
    for (section, scope) in [("require", Scope::Compile), ("require-dev", Scope::Test)] {
        let Some(entries) = json.get(section).and_then(|v| v.as_object()) else {
            continue;
        };
        for (name, constraint) in entries {
            if is_platform(name) {
                continue;
            }
            deps.push(package(name, constraint.as_str(), scope.clone()));
        }
    }
    deps
}

/// Namespaces the project autoloads from its own sources.
fn own_namespaces(json: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for section in ["autoload", "autoload-dev"] {
        for kind in ["psr-4", "psr-0"] {
            if let Some(map) = json.get(section).and_then(|a| a.get(kind)).and_then(|m| m.as_object()) {
                out.extend(map.keys().filter(|k| !k.is_empty()).cloned());
            }
        }
    }
    out
}

fn locked_packages(lock: &ComposerLock) -> Vec<Dependency> {
    lock.packages
        .iter()
        .map(|p| (p, Scope::Compile))
        .chain(lock.packages_dev.iter().map(|p| (p, Scope::Test)))
        .map(|(p, scope)| {
            let version = p.version.as_deref().map(|v| v.trim_start_matches('v'));
            package(&p.name, version, scope)
        })
        .collect()
}

/// Package for a fully qualified class name: the longest known namespace
/// prefix, else `vendor/package` from the first two of at least three
/// segments.
fn package_for_class(class: &str, namespaces: &[(String, String)]) -> Option<String> {
    let qualified = format!("{}\\", class);
    if let Some((_, pkg)) = namespaces
        .iter()
        .filter(|(ns, _)| qualified.starts_with(ns.as_str()))
        .max_by_key(|(ns, _)| ns.len())
    {
        return Some(pkg.clone());
    }

    let mut segments = class.split('\\').filter(|s| !s.is_empty());
    let vendor = segments.next()?;
    let name = segments.next()?;
    // `Vendor\Class` and global classes name no package.
    segments.next()?;
    Some(format!("{}/{}", kebab(vendor), kebab(name)))
}

/// `HttpFoundation` → `http-foundation`.
fn kebab(segment: &str) -> String {
    let mut out = String::new();
    let mut prev_lower = false;
    for c in segment.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push('-');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        out.push(c.to_ascii_lowercase());
    }
    out
}

fn is_test_file(rel: &Path) -> bool {
    rel.components()
        .any(|c| matches!(c.as_os_str().to_str(), Some("tests" | "test")))
        || rel.file_name().is_some_and(|n| n.to_string_lossy().ends_with("Test.php"))
}

fn scan_sources(project: &Path, namespaces: &[(String, String)], own: &[String]) -> Vec<Dependency> {
    let mut found: BTreeMap<String, Scope> = BTreeMap::new();

    for file in fsutil::source_files(project, &["php"]) {
        let Ok(source) = std::fs::read_to_string(&file) else {
            continue;
        };
        let rel = file.strip_prefix(project).unwrap_or(&file);
        let scope = if is_test_file(rel) { Scope::Test } else { Scope::Compile };

        for caps in USE_RE.captures_iter(&source) {
            let class = caps[1].trim_end_matches('\\');
            let qualified = format!("{}\\", class);
            if own.iter().any(|ns| qualified.starts_with(ns.as_str())) {
                continue;
            }
            let Some(name) = package_for_class(class, namespaces) else {
                continue;
            };
            let entry = found.entry(name).or_insert_with(|| scope.clone());
            if scope == Scope::Compile {
                *entry = Scope::Compile;
            }
        }
    }
    debug!(packages = found.len(), "mapped use statements to packages");
    found
        .into_iter()
        .map(|(name, scope)| package(&name, None, scope))
        .collect()
}

/// New `require` / `require-dev` objects. Platform requirements already in
/// `root` are kept at the top of `require`.
fn render_sections(
    root: &Map<String, Value>,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> (Map<String, Value>, Map<String, Value>) {
    let mut main = Map::new();
    let mut dev = Map::new();

    for (key, target) in [("require", &mut main), ("require-dev", &mut dev)] {
        if let Some(existing) = root.get(key).and_then(|v| v.as_object()) {
            for (name, constraint) in existing.iter().filter(|(n, _)| is_platform(n)) {
                target.insert(name.clone(), constraint.clone());
            }
        }
    }

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
        let target = if is_dev(dep) { &mut dev } else { &mut main };
        target
            .entry(name.to_string())
            .or_insert_with(|| Value::String(version.to_string()));
    }
    (main, dev)
}
