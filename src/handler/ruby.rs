use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::EcosystemPolicy;
use crate::error::{RecoveryError, ScanError};
use crate::fsutil;
use crate::models::{Dependency, Ecosystem, Scope};

use super::{is_dev, read_manifest, reconcile, Evidence, Handler, ScanContext, ScanReport};

/// Standard library features loadable with `require` without a gem.
const STDLIB: &[&str] = &[
    "abbrev", "base64", "benchmark", "bigdecimal", "cgi", "csv", "date", "delegate", "digest",
    "English", "erb", "etc", "fileutils", "find", "forwardable", "io", "ipaddr", "json",
    "logger", "monitor", "net", "objspace", "observer", "open3", "open-uri", "openssl",
    "optparse", "ostruct", "pathname", "pp", "prettyprint", "pstore", "psych", "rbconfig",
    "readline", "resolv", "ripper", "securerandom", "set", "shellwords", "singleton", "socket",
    "stringio", "strscan", "tempfile", "time", "timeout", "tmpdir", "tsort", "un", "uri",
    "weakref", "yaml", "zlib",
];

/// Require paths whose gem is named differently.
const GEM_NAMES: &[(&str, &str)] = &[
    ("active_support", "activesupport"),
    ("active_record", "activerecord"),
    ("action_controller", "actionpack"),
    ("action_view", "actionview"),
    ("action_mailer", "actionmailer"),
    ("active_job", "activejob"),
    ("active_model", "activemodel"),
    ("rspec", "rspec"),
    ("minitest", "minitest"),
];

static GEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*gem\s*\(?\s*["']([^"']+)["']((?:\s*,\s*["'][^"']+["'])*)(.*)$"#).expect("gem regex")
});
static GROUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*group\s*\(?([^)]*?)\)?\s*do\b").expect("group regex"));
static GEMSPEC_DEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\.add_(runtime_|development_)?dependency\s*\(?\s*["']([^"']+)["']((?:\s*,\s*["'][^"']+["'])*)"#,
    )
    .expect("gemspec dependency regex")
});
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["']([^"']+)["']"#).expect("quoted string regex"));
static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*require\s*\(?\s*["']([^"']+)["']"#).expect("require regex")
});
static LOCK_SPEC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ {4}([^\s(]+) \(([^)]+)\)$").expect("lock spec regex"));

/// Bundler: `Gemfile`, `*.gemspec`, `Gemfile.lock`, and `require` calls.
pub struct RubyHandler {
    policy: EcosystemPolicy,
}

impl RubyHandler {
    pub fn new(policy: EcosystemPolicy) -> Self {
        Self { policy }
    }
}

impl Handler for RubyHandler {
    fn name(&self) -> &'static str {
        "Ruby"
    }

    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Ruby
    }

    fn detect(&self, project: &Path) -> bool {
        project.join("Gemfile").exists()
            || project.join("Gemfile.lock").exists()
            || !gemspecs(project).is_empty()
    }

    fn scan(&self, project: &Path, ctx: &ScanContext) -> Result<ScanReport, ScanError> {
        let mut declared = Vec::new();
        let gemfile = project.join("Gemfile");
        if gemfile.exists() {
            declared.extend(parse_gemfile(&read_manifest(&gemfile)?));
        }
        for spec in gemspecs(project) {
            declared.extend(parse_gemspec(&read_manifest(&spec)?));
        }

        let locked = std::fs::read_to_string(project.join("Gemfile.lock"))
            .map(|s| parse_gemfile_lock(&s))
            .unwrap_or_default();

        let evidence = Evidence {
            declared,
            scanned: scan_sources(project),
            locked,
        };
        reconcile(Ecosystem::Ruby, evidence, &self.policy, ctx)
    }

    fn generate_recovery_file(
        &self,
        deps: &[Dependency],
        project: &Path,
        backup_dir: &Path,
    ) -> Result<PathBuf, RecoveryError> {
        let path = project.join("Gemfile");
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        let contents = render_gemfile(&existing, deps, &self.policy);
        fsutil::replace_manifest(&path, &contents, backup_dir)?;
        Ok(path)
    }
}

fn gemspecs(project: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(project) else {
        return Vec::new();
    };
    let mut specs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "gemspec"))
        .collect();
    specs.sort();
    specs
}

fn gem(name: &str, version: Option<&str>, scope: Scope) -> Dependency {
    Dependency::package(Ecosystem::Ruby, name, version, scope)
}

/// `, "~> 1.2", ">= 1.2.3"` → `~> 1.2, >= 1.2.3`.
fn requirement_list(raw: &str) -> Option<String> {
    let parts: Vec<&str> = QUOTED_RE
        .captures_iter(raw)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

fn group_scope(groups: &str) -> Scope {
    if groups.contains("test") || groups.contains("development") {
        Scope::Test
    } else {
        Scope::Compile
    }
}

fn parse_gemfile(content: &str) -> Vec<Dependency> {
    let mut deps = Vec::new();
    // Scope of each open `do` block; only `group` blocks change it.
    let mut blocks: Vec<Option<Scope>> = Vec::new();

    for line in content.lines() {
        let code = line.split('#').next().unwrap_or_default();
        let trimmed = code.trim();

        if let Some(caps) = GROUP_RE.captures(code) {
            blocks.push(Some(group_scope(&caps[1])));
            continue;
        }
        if trimmed == "end" {
            blocks.pop();
            continue;
        }
        if let Some(caps) = GEM_RE.captures(code) {
            let options = &caps[3];
            let scope = if options.contains("group") {
                group_scope(options)
            } else {
                blocks.iter().rev().flatten().next().cloned().unwrap_or_default()
            };
            let version = requirement_list(&caps[2]);
            deps.push(gem(&caps[1], version.as_deref(), scope));
            continue;
        }
        if trimmed.ends_with(" do") || trimmed.contains(" do |") {
            blocks.push(None);
        }
    }
    deps
}

fn parse_gemspec(content: &str) -> Vec<Dependency> {
    GEMSPEC_DEP_RE
        .captures_iter(content)
        .map(|caps| {
            let scope = match caps.get(1).map(|m| m.as_str()) {
                Some("development_") => Scope::Test,
                _ => Scope::Compile,
            };
            let version = requirement_list(&caps[3]);
            gem(&caps[2], version.as_deref(), scope)
        })
        .collect()
}

/// Top-level `specs:` entries; nested requirement lines are skipped.
fn parse_gemfile_lock(content: &str) -> Vec<Dependency> {
    let mut deps = Vec::new();
    let mut in_specs = false;
    for line in content.lines() {
        if line.trim() == "specs:" {
            in_specs = true;
            continue;
        }
        if !line.starts_with(' ') {
            in_specs = false;
            continue;
        }
        if in_specs {
            if let Some(caps) = LOCK_SPEC_RE.captures(line) {
                // Platform suffixes: `nokogiri (1.15.4-x86_64-linux)`.
                let version = caps[2].split('-').next().unwrap_or_default();
                deps.push(gem(&caps[1], Some(version), Scope::Compile));
            }
        }
    }
    deps
}

fn gem_for_require(path: &str) -> Option<String> {
    let root = path.split('/').next()?;
    if root.is_empty() || root.starts_with('.') || STDLIB.contains(&root) {
        return None;
    }
    let name = GEM_NAMES
        .iter()
        .find(|(req, _)| *req == root)
        .map(|(_, gem)| gem.to_string())
        .unwrap_or_else(|| root.to_string());
    Some(name)
}

fn is_test_file(rel: &Path) -> bool {
    let in_test_dir = rel
        .components()
        .any(|c| matches!(c.as_os_str().to_str(), Some("spec" | "test")));
    let name = rel.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    in_test_dir || name.ends_with("_spec.rb") || name.ends_with("_test.rb")
}

fn scan_sources(project: &Path) -> Vec<Dependency> {
    let lib = project.join("lib");
    let mut found: BTreeMap<String, Scope> = BTreeMap::new();

    for file in fsutil::source_files(project, &["rb", "rake"]) {
        let Ok(source) = std::fs::read_to_string(&file) else {
            continue;
        };
        let rel = file.strip_prefix(project).unwrap_or(&file);
        let scope = if is_test_file(rel) { Scope::Test } else { Scope::Compile };

        for caps in REQUIRE_RE.captures_iter(&source) {
            let path = &caps[1];
            let root = path.split('/').next().unwrap_or_default();
            // `require "myapp/x"` with `lib/myapp` is the project itself.
            if lib.join(root).exists() || lib.join(format!("{}.rb", root)).exists() {
                continue;
            }
            let Some(name) = gem_for_require(path) else {
                continue;
            };
            let entry = found.entry(name).or_insert_with(|| scope.clone());
            if scope == Scope::Compile {
                *entry = Scope::Compile;
            }
        }
    }
    debug!(gems = found.len(), "collected requires");
    found
        .into_iter()
        .map(|(name, scope)| gem(&name, None, scope))
        .collect()
}

fn gem_line(dep: &Dependency, policy: &EcosystemPolicy, indent: &str) -> String {
    let name = dep.manifest_name();
    let version = dep
        .version
        .as_deref()
        .or_else(|| policy.unresolved.placeholder().filter(|p| !p.is_empty()));
    match version {
        Some(v) => {
            let reqs: Vec<String> = v.split(',').map(|r| format!("\"{}\"", r.trim())).collect();
            format!("{}gem \"{}\", {}\n", indent, name, reqs.join(", "))
        }
        None => format!("{}gem \"{}\"\n", indent, name),
    }
}

/// Regenerate the Gemfile, keeping `source`, `ruby` and `gemspec` lines.
fn render_gemfile(existing: &str, deps: &[Dependency], policy: &EcosystemPolicy) -> String {
    let header: Vec<&str> = existing
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("source ") || t.starts_with("ruby ") || t.starts_with("gemspec")
        })
        .collect();

    let mut out = String::new();
    if header.iter().any(|l| l.trim_start().starts_with("source ")) {
        for line in &header {
            out.push_str(line);
            out.push('\n');
        }
    } else {
        out.push_str("source \"https://rubygems.org\"\n");
        for line in &header {
            out.push_str(line);
            out.push('\n');
        }
    }

    let (dev, main): (Vec<&Dependency>, Vec<&Dependency>) =
        deps.iter().filter(|d| !d.manifest_name().is_empty()).partition(|d| is_dev(d));

    if !main.is_empty() {
        out.push('\n');
        for dep in main {
            out.push_str(&gem_line(dep, policy, ""));
        }
    }
    if !dev.is_empty() {
        out.push_str("\ngroup :development, :test do\n");
        for dep in dev {
            out.push_str(&gem_line(dep, policy, "  "));
        }
        out.push_str("end\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::write_tree;

    const GEMFILE: &str = r#"source "https://rubygems.org"
ruby "3.2.2"

gem "rails", "~> 7.0", ">= 7.0.4"
gem 'pg'
gem "bootsnap", require: false

group :development, :test do
  gem "rspec-rails", "~> 6.0"
  platforms :mri do
    gem "byebug"
  end
end

gem "rubocop", group: :development
"#;

    const GEMFILE_LOCK: &str = r#"GEM
  remote: https://rubygems.org/
  specs:
    nokogiri (1.15.4-x86_64-linux)
      racc (~> 1.4)
    pg (1.5.4)
    racc (1.7.1)

PLATFORMS
  x86_64-linux
"#;

    fn handler() -> RubyHandler {
        RubyHandler::new(EcosystemPolicy::builtin(Ecosystem::Ruby))
    }

    #[test]
    fn test_parse_gemfile_groups() {
        let deps = parse_gemfile(GEMFILE);
        let got: Vec<_> = deps
            .iter()
            .map(|d| (d.manifest_name(), d.version.as_deref(), d.scope.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("rails", Some("~> 7.0, >= 7.0.4"), Scope::Compile),
                ("pg", None, Scope::Compile),
                ("bootsnap", None, Scope::Compile),
                ("rspec-rails", Some("~> 6.0"), Scope::Test),
                ("byebug", None, Scope::Test),
                ("rubocop", None, Scope::Test),
            ]
        );
    }

    #[test]
    fn test_parse_gemspec_and_lock() {
        let spec = r#"Gem::Specification.new do |s|
  s.name = "widget"
  s.add_dependency "faraday", ">= 1.0"
  s.add_runtime_dependency("zeitwerk")
  s.add_development_dependency "rake", "~> 13.0"
end
"#;
        let deps = parse_gemspec(spec);
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0].version.as_deref(), Some(">= 1.0"));
        assert_eq!(deps[1].key, "rubygems:zeitwerk");
        assert_eq!(deps[2].scope, Scope::Test);

        let locked = parse_gemfile_lock(GEMFILE_LOCK);
        let names: Vec<_> = locked.iter().map(|d| d.manifest_name()).collect();
        assert_eq!(names, vec!["nokogiri", "pg", "racc"]);
        assert_eq!(locked[0].version.as_deref(), Some("1.15.4"));
    }

    #[test]
    fn test_scan_requires() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("Gemfile", "source \"https://rubygems.org\"\ngem \"pg\"\n"),
                ("Gemfile.lock", GEMFILE_LOCK),
                ("lib/widget.rb", "require \"json\"\nrequire \"nokogiri\"\nrequire \"widget/version\"\nrequire_relative \"x\"\n"),
                ("lib/widget/version.rb", "require 'active_support/core_ext'\n"),
                ("spec/widget_spec.rb", "require \"rspec\"\nrequire \"nokogiri\"\n"),
            ],
        );

        let report = handler().scan(dir.path(), &ScanContext::default()).unwrap();

        let got: Vec<_> = report
            .dependencies
            .iter()
            .map(|d| (d.manifest_name(), d.version.as_deref(), d.scope.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("pg", Some("1.5.4"), Scope::Compile),
                ("activesupport", None, Scope::Compile),
                ("nokogiri", Some("1.15.4"), Scope::Compile),
                ("rspec", None, Scope::Test),
            ]
        );
    }

    #[test]
    fn test_write_gemfile() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("Gemfile", GEMFILE)]);
        let deps = vec![
            gem("rails", Some("~> 7.0, >= 7.0.4"), Scope::Compile),
            gem("pg", None, Scope::Compile),
            gem("rspec-rails", Some("~> 6.0"), Scope::Test),
        ];

        let path = handler()
            .generate_recovery_file(&deps, dir.path(), &dir.path().join("b"))
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "source \"https://rubygems.org\"\nruby \"3.2.2\"\n\ngem \"rails\", \"~> 7.0\", \">= 7.0.4\"\ngem \"pg\"\n\ngroup :development, :test do\n  gem \"rspec-rails\", \"~> 6.0\"\nend\n"
        );
    }
}
