use serde::{Deserialize, Serialize};

/// A single dependency record, whatever evidence source produced it.
///
/// `version == None` means *unresolved*: no evidence supplied a concrete
/// value. Renderers decide per ecosystem how an unresolved version is
/// written (see [`crate::config::UnresolvedVersion`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub import_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artifact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub scope: Scope,
    pub ecosystem: Ecosystem,
    /// Identity. Computed once at construction and never re-derived, so
    /// curation overrides of group/artifact keep the record's identity.
    pub key: String,
}

impl Dependency {
    /// Build a coordinate-style record (`group:artifact`).
    pub fn coordinate(
        ecosystem: Ecosystem,
        group_id: &str,
        artifact_id: &str,
        version: Option<&str>,
        scope: Scope,
    ) -> Self {
        let mut dep = Dependency {
            name: artifact_id.to_string(),
            import_path: String::new(),
            group_id: group_id.to_string(),
            artifact_id: artifact_id.to_string(),
            version: normalize_version(version),
            scope,
            ecosystem,
            key: String::new(),
        };
        dep.key = dep.derive_key();
        dep
    }

    /// Build a record for an ecosystem without a distinct group; the group
    /// carries the ecosystem tag (`npm`, `pypi`, ...).
    pub fn package(ecosystem: Ecosystem, name: &str, version: Option<&str>, scope: Scope) -> Self {
        Self::coordinate(ecosystem, ecosystem.group_tag(), name, version, scope)
    }

    /// Build a record identified by a module/import path (Go style).
    pub fn module(ecosystem: Ecosystem, path: &str, version: Option<&str>, scope: Scope) -> Self {
        let mut dep = Self::package(ecosystem, path, version, scope);
        dep.import_path = path.to_string();
        dep
    }

    /// `group:artifact` when both are set, else the import path, the name,
    /// and finally the bare artifact. Empty means unidentifiable.
    pub fn derive_key(&self) -> String {
        let group = self.group_id.trim();
        let artifact = self.artifact_id.trim();
        if !group.is_empty() && !artifact.is_empty() {
            return format!("{}:{}", group, artifact);
        }
        [&self.import_path, &self.name, &self.artifact_id]
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    pub fn is_identifiable(&self) -> bool {
        !self.key.trim().is_empty()
    }

    pub fn is_resolved(&self) -> bool {
        self.version.is_some()
    }

    /// The name a manifest would use for this record: artifact, else
    /// import path, else display name.
    pub fn manifest_name(&self) -> &str {
        [&self.artifact_id, &self.import_path, &self.name]
            .into_iter()
            .map(|s| s.as_str())
            .find(|s| !s.trim().is_empty())
            .unwrap_or("")
    }
}

/// Treat blank version strings as unresolved.
pub fn normalize_version(version: Option<&str>) -> Option<String> {
    version
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Which manifest section a dependency belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Compile,
    Test,
    Build,
    Runtime,
    #[serde(untagged)]
    Other(String),
}

impl Scope {
    /// Parse a canonical scope name. Unknown names are kept verbatim.
    pub fn parse(s: &str) -> Scope {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "compile" => Scope::Compile,
            "test" => Scope::Test,
            "build" => Scope::Build,
            "runtime" => Scope::Runtime,
            _ => Scope::Other(s.trim().to_string()),
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Compile
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Compile => write!(f, "compile"),
            Scope::Test => write!(f, "test"),
            Scope::Build => write!(f, "build"),
            Scope::Runtime => write!(f, "runtime"),
            Scope::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Go,
    Node,
    Python,
    Java,
    Rust,
    DotNet,
    Ruby,
    Php,
}

impl Ecosystem {
    /// Every supported ecosystem, in plugin registration order.
    pub const ALL: [Ecosystem; 8] = [
        Ecosystem::Java,
        Ecosystem::Go,
        Ecosystem::Python,
        Ecosystem::Node,
        Ecosystem::Rust,
        Ecosystem::DotNet,
        Ecosystem::Ruby,
        Ecosystem::Php,
    ];

    /// Group used for ecosystems whose packages have no distinct group.
    pub fn group_tag(&self) -> &'static str {
        match self {
            Ecosystem::Go => "golang",
            Ecosystem::Node => "npm",
            Ecosystem::Python => "pypi",
            Ecosystem::Java => "maven",
            Ecosystem::Rust => "crates",
            Ecosystem::DotNet => "nuget",
            Ecosystem::Ruby => "rubygems",
            Ecosystem::Php => "packagist",
        }
    }

    /// Config table name (`[ecosystems.<id>]`).
    pub fn id(&self) -> &'static str {
        match self {
            Ecosystem::Go => "go",
            Ecosystem::Node => "node",
            Ecosystem::Python => "python",
            Ecosystem::Java => "java",
            Ecosystem::Rust => "rust",
            Ecosystem::DotNet => "dotnet",
            Ecosystem::Ruby => "ruby",
            Ecosystem::Php => "php",
        }
    }

    /// Map a package-URL type (`pkg:<type>/...`) to an ecosystem.
    pub fn from_purl_type(ty: &str) -> Option<Ecosystem> {
        match ty {
            "golang" => Some(Ecosystem::Go),
            "npm" => Some(Ecosystem::Node),
            "pypi" => Some(Ecosystem::Python),
            "maven" => Some(Ecosystem::Java),
            "cargo" => Some(Ecosystem::Rust),
            "nuget" => Some(Ecosystem::DotNet),
            "gem" => Some(Ecosystem::Ruby),
            "composer" => Some(Ecosystem::Php),
            _ => None,
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ecosystem::Go => write!(f, "Go"),
            Ecosystem::Node => write!(f, "Node.js"),
            Ecosystem::Python => write!(f, "Python"),
            Ecosystem::Java => write!(f, "Java"),
            Ecosystem::Rust => write!(f, "Rust"),
            Ecosystem::DotNet => write!(f, ".NET"),
            Ecosystem::Ruby => write!(f, "Ruby"),
            Ecosystem::Php => write!(f, "PHP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_key() {
        let d = Dependency::coordinate(Ecosystem::Java, "junit", "junit", Some("4.13"), Scope::Test);
        assert_eq!(d.key, "junit:junit");
        assert_eq!(d.version.as_deref(), Some("4.13"));
    }

    #[test]
    fn test_key_falls_back_to_import_path_then_name() {
        let mut d = Dependency::module(Ecosystem::Go, "github.com/a/b", None, Scope::Compile);
        d.group_id.clear();
        assert_eq!(d.derive_key(), "github.com/a/b");

        d.import_path.clear();
        d.artifact_id.clear();
        d.name = "display".into();
        assert_eq!(d.derive_key(), "display");

        d.name.clear();
        assert_eq!(d.derive_key(), "");
    }

    #[test]
    fn test_blank_version_is_unresolved() {
        let d = Dependency::package(Ecosystem::Node, "express", Some("  "), Scope::Compile);
        assert!(!d.is_resolved());
        assert_eq!(d.key, "npm:express");
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(Scope::parse("TEST"), Scope::Test);
        assert_eq!(Scope::parse(""), Scope::Compile);
        assert_eq!(Scope::parse("provided"), Scope::Other("provided".into()));
    }
}
