use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::fsutil::IGNORED_DIRS;
use crate::models::Ecosystem;

/// How sure the estimate is that an ecosystem is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    /// Only source files were seen.
    Medium,
    /// A native manifest or lockfile exists.
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageEstimate {
    pub ecosystem: Ecosystem,
    pub confidence: Confidence,
    pub source_files: usize,
}

fn manifest_ecosystem(file_name: &str) -> Option<Ecosystem> {
    match file_name {
        "go.mod" | "go.work" | "go.sum" => Some(Ecosystem::Go),
        "package.json" | "package-lock.json" | "yarn.lock" | "pnpm-lock.yaml" => {
            Some(Ecosystem::Node)
        }
        "requirements.txt" | "pyproject.toml" | "setup.py" | "Pipfile" | "Pipfile.lock"
        | "environment.yml" => Some(Ecosystem::Python),
        "pom.xml" | "build.gradle" | "build.gradle.kts" | "settings.gradle"
        | "settings.gradle.kts" => Some(Ecosystem::Java),
        "Cargo.toml" | "Cargo.lock" => Some(Ecosystem::Rust),
        "packages.config" | "Directory.Packages.props" | "paket.lock" => Some(Ecosystem::DotNet),
        "Gemfile" | "Gemfile.lock" => Some(Ecosystem::Ruby),
        "composer.json" | "composer.lock" => Some(Ecosystem::Php),
        _ => None,
    }
}

fn extension_ecosystem(ext: &str) -> Option<(Ecosystem, bool)> {
    // (ecosystem, whether the extension marks a manifest)
    match ext {
        "go" => Some((Ecosystem::Go, false)),
        "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some((Ecosystem::Node, false)),
        "py" => Some((Ecosystem::Python, false)),
        "java" | "kt" => Some((Ecosystem::Java, false)),
        "rs" => Some((Ecosystem::Rust, false)),
        "cs" | "fs" | "vb" => Some((Ecosystem::DotNet, false)),
        "csproj" | "fsproj" | "vbproj" => Some((Ecosystem::DotNet, true)),
        "rb" => Some((Ecosystem::Ruby, false)),
        "gemspec" => Some((Ecosystem::Ruby, true)),
        "php" => Some((Ecosystem::Php, false)),
        _ => None,
    }
}

/// Walk `path` once and estimate which ecosystems it uses.
///
/// Informational only: plugins run their own `detect`. Results are ordered
/// by confidence, then by number of source files.
pub fn estimate_languages(path: &Path) -> Vec<LanguageEstimate> {
    let mut seen: BTreeMap<Ecosystem, (bool, usize)> = BTreeMap::new();

    let walker = WalkDir::new(path).follow_links(false).into_iter();
    for entry in walker
        .filter_entry(|e| {
            !(e.depth() > 0
                && e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| IGNORED_DIRS.contains(&n)))
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some(eco) = manifest_ecosystem(name) {
            seen.entry(eco).or_default().0 = true;
            continue;
        }
        let ext = entry.path().extension().and_then(|e| e.to_str());
        if let Some((eco, is_manifest)) = ext.and_then(extension_ecosystem) {
            let slot = seen.entry(eco).or_default();
            if is_manifest {
                slot.0 = true;
            } else {
                slot.1 += 1;
            }
        }
    }

    let mut estimates: Vec<LanguageEstimate> = seen
        .into_iter()
        .map(|(ecosystem, (manifest, source_files))| LanguageEstimate {
            ecosystem,
            confidence: if manifest {
                Confidence::High
            } else {
                Confidence::Medium
            },
            source_files,
        })
        .collect();
    estimates.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then(b.source_files.cmp(&a.source_files))
    });

    for est in &estimates {
        debug!(
            ecosystem = %est.ecosystem,
            confidence = %est.confidence,
            files = est.source_files,
            "detected language"
        );
    }
    estimates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::write_tree;

    #[test]
    fn test_manifest_gives_high_confidence() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("Cargo.toml", "[package]\nname = \"x\"\n"),
                ("src/main.rs", "fn main() {}"),
                ("scripts/a.py", ""),
                ("scripts/b.py", ""),
                ("node_modules/left-pad/index.js", ""),
            ],
        );

        let found = estimate_languages(dir.path());

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].ecosystem, Ecosystem::Rust);
        assert_eq!(found[0].confidence, Confidence::High);
        assert_eq!(found[1].ecosystem, Ecosystem::Python);
        assert_eq!(found[1].confidence, Confidence::Medium);
        assert_eq!(found[1].source_files, 2);
    }

    #[test]
    fn test_project_files_count_as_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("App/App.csproj", "<Project/>")]);
        let found = estimate_languages(dir.path());
        assert_eq!(found[0].ecosystem, Ecosystem::DotNet);
        assert_eq!(found[0].confidence, Confidence::High);
    }

    #[test]
    fn test_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert!(estimate_languages(dir.path()).is_empty());
    }
}
