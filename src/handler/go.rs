use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::EcosystemPolicy;
use crate::error::{RecoveryError, ScanError};
use crate::fsutil;
use crate::models::{Dependency, Ecosystem, Scope};

use super::{read_manifest, reconcile, Evidence, Handler, ScanContext, ScanReport};

/// Hosts whose module root is `host/owner/repo`.
const THREE_SEGMENT_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org", "golang.org"];

static IMPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^import\s+(?:[\w.]+\s+)?"([^"]+)""#).expect("import line regex")
});
static IMPORT_SPEC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^(?:[\w.]+\s+)?"([^"]+)""#).expect("import spec regex"));

/// Go modules: `go.mod` requires plus imports found in `*.go` sources.
pub struct GoHandler {
    policy: EcosystemPolicy,
}

impl GoHandler {
    pub fn new(policy: EcosystemPolicy) -> Self {
        Self { policy }
    }
}

impl Handler for GoHandler {
    fn name(&self) -> &'static str {
        "Go"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Go
    }

    fn detect(&self, project: &Path) -> bool {
        project.join("go.mod").exists()
            || project.join("go.work").exists()
            || fsutil::has_source_file(project, &["go"])
    }

    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError> {
        let go_mod = project.join("go.mod");
        let manifest = if go_mod.exists() {
            parse_go_mod(&read_manifest(&go_mod)?)
        } else {
            GoMod::default()
        };
        debug!(
            module = manifest.module.as_deref().unwrap_or("-"),
            declared = manifest.requires.len(),
            "parsed go.mod"
        );

        let mut imports = BTreeSet::new();
        for file in fsutil::source_files(project, &["go"]) {
            let Ok(source) = std::fs::read_to_string(&file) else {
                debug!(file = %file.display(), "skipping unreadable source");
                continue;
            };
            for path in collect_imports(&source) {
                if is_stdlib(&path) || is_module_local(&path, manifest.module.as_deref()) {
                    continue;
                }
                imports.insert(module_root(&path));
            }
        }

        let evidence = Evidence {
            declared: manifest.requires,
            scanned: imports
                .iter()
                .map(|p| Dependency::module(Ecosystem::Go, p, None, Scope::Compile))
                .collect(),
            ..Default::default()
        };
        reconcile(Ecosystem::Go, evidence, &self.policy, ctx)
    }

    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError> {
        let path = project.join("go.mod");
        let existing = std::fs::read_to_string(&path)
            .map(|s| parse_go_mod(&s))
            .unwrap_or_default();
        let module = existing.module.clone().unwrap_or_else(|| {
            let base = project
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "module".to_string());
            format!("recovered/{}", base)
        });

        let contents = render_go_mod(&module, &existing, deps, &self.policy);
        fsutil::replace_manifest(&path, &contents, backup_dir)?;
        Ok(path)
    }
}

#[derive(Debug, Default)]
struct GoMod {
    module: Option<String>,
    go_version: Option<String>,
    toolchain: Option<String>,
    requires: Vec<Dependency>,
    /// Require paths marked `// indirect`.
    indirect: HashSet<String>,
    /// `replace`, `exclude`, `retract` and any other directive, verbatim.
    directives: Vec<String>,
}

fn parse_go_mod(content: &str) -> GoMod {
    let mut out = GoMod::default();
    let mut in_require = false;
    let mut block: Option<String> = None;

    for raw in content.lines() {
        let line = match raw.find("//") {
            Some(idx) => raw[..idx].trim(),
            None => raw.trim(),
        };

        if let Some(text) = block.as_mut() {
            if !raw.trim().is_empty() {
                text.push('\n');
                text.push_str(raw.trim_end());
            }
            if line == ")" {
                out.directives.extend(block.take());
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }

        if in_require {
            if line == ")" {
                in_require = false;
            } else {
                push_require(&mut out, line, is_indirect(raw));
            }
            continue;
        }

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("module") => out.module = parts.next().map(|m| m.trim_matches('"').to_string()),
            Some("go") => out.go_version = parts.next().map(str::to_string),
            Some("toolchain") => out.toolchain = parts.next().map(str::to_string),
            Some("require") => {
                let rest = line["require".len()..].trim();
                if rest == "(" {
                    in_require = true;
                } else {
                    push_require(&mut out, rest, is_indirect(raw));
                }
            }
            Some(_) if line.ends_with('(') => block = Some(raw.trim().to_string()),
            Some(_) => out.directives.push(raw.trim().to_string()),
            None => {}
        }
    }
    out
}

fn is_indirect(raw: &str) -> bool {
    raw.find("//")
        .is_some_and(|idx| raw[idx + 2..].trim_start().starts_with("indirect"))
}

fn push_require(out: &mut GoMod, spec: &str, indirect: bool) {
    let mut parts = spec.split_whitespace();
    if let (Some(path), version) = (parts.next(), parts.next()) {
        if indirect {
            out.indirect.insert(path.to_string());
        }
        out.requires
            .push(Dependency::module(Ecosystem::Go, path, version, Scope::Compile));
    }
}

/// Import paths from single-line and grouped import declarations.
fn collect_imports(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_group = false;
    for line in source.lines().map(str::trim) {
        if in_group {
            if line.starts_with(')') {
                in_group = false;
            } else if let Some(caps) = IMPORT_SPEC.captures(line) {
                out.push(caps[1].to_string());
            }
            continue;
        }
        if line.starts_with("import (") || line == "import(" {
            in_group = true;
        } else if let Some(caps) = IMPORT_LINE.captures(line) {
            out.push(caps[1].to_string());
        }
    }
    out
}

/// Standard library paths never contain a dot in their first segment.
fn is_stdlib(path: &str) -> bool {
    !path.split('/').next().unwrap_or_default().contains('.')
}

fn is_module_local(path: &str, module: Option<&str>) -> bool {
    module.is_some_and(|m| path == m || path.starts_with(&format!("{}/", m)))
}

/// Reduce a package import path to its probable module path.
fn module_root(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let host = segments[0];
    let keep = if THREE_SEGMENT_HOSTS.contains(&host) { 3 } else { segments.len() };
    let mut root = segments[..keep.min(segments.len())].join("/");
    // Major version suffix is part of the module path.
    if let Some(next) = segments.get(keep) {
        if next.len() > 1 && next.starts_with('v') && next[1..].chars().all(|c| c.is_ascii_digit()) {
            root = format!("{}/{}", root, next);
        }
    }
    root
}

/// Rebuild `go.mod` around `deps`. The `go` and `toolchain` lines, other
/// directives and `// indirect` markers of `existing` are carried over.
fn render_go_mod(
    module: &str,
    existing: &GoMod,
    deps: &[Dependency],
    policy: &EcosystemPolicy,
) -> String {
    let mut out = format!("module {}\n", module);
    if let Some(v) = &existing.go_version {
        out.push_str(&format!("\ngo {}\n", v));
    }
    if let Some(t) = &existing.toolchain {
        out.push_str(&format!("\ntoolchain {}\n", t));
    }

    let mut resolved = Vec::new();
    let mut unresolved = Vec::new();
    for dep in deps {
        let path = dep.manifest_name();
        if path.is_empty() {
            continue;
        }
        let version = match (dep.version.as_deref(), policy.unresolved.placeholder()) {
            (Some(v), _) => v,
            (None, Some(p)) if !p.is_empty() => p,
            (None, _) => {
                unresolved.push(path.to_string());
                continue;
            }
        };
        let marker = if existing.indirect.contains(path) {
            " // indirect"
        } else {
            ""
        };
        resolved.push(format!("\t{} {}{}", path, version, marker));
    }

    if !resolved.is_empty() {
        out.push_str("\nrequire (\n");
        for line in &resolved {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(")\n");
    }
    for directive in &existing.directives {
        out.push('\n');
        out.push_str(directive);
        out.push('\n');
    }
    if !unresolved.is_empty() {
        out.push('\n');
        for path in &unresolved {
            out.push_str(&format!("// unresolved: {}\n", path));
        }
    }
    out
}
