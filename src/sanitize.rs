//! Ecosystem-specific normalization of raw dependency records.

use crate::models::{Dependency, Ecosystem};

/// Normalization rules for one ecosystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizeRules {
    /// Pass records through unchanged.
    Identity,
    /// Module-path ecosystems: identity comes from the import path and
    /// versions must carry `version_prefix` (e.g. Go's `v1.2.3`).
    ModulePath { version_prefix: char },
}

impl Ecosystem {
    pub fn sanitize_rules(&self) -> SanitizeRules {
        match self {
            Ecosystem::Go => SanitizeRules::ModulePath { version_prefix: 'v' },
            _ => SanitizeRules::Identity,
        }
    }
}

/// Normalize `record` under `rules`, or `None` when it cannot be identified.
///
/// Pure: no I/O, same input always yields the same output.
pub fn sanitize(record: &Dependency, rules: &SanitizeRules) -> Option<Dependency> {
    match rules {
        SanitizeRules::Identity => Some(record.clone()),
        SanitizeRules::ModulePath { version_prefix } => sanitize_module(record, *version_prefix),
    }
}

fn sanitize_module(record: &Dependency, prefix: char) -> Option<Dependency> {
    let path = [record.import_path.trim(), record.name.trim()]
        .into_iter()
        .find(|s| !s.is_empty())?
        .to_string();

    let mut out = record.clone();
    out.version = record
        .version
        .as_deref()
        .and_then(|v| coerce_version(v, prefix));
    if out.artifact_id.trim().is_empty() {
        out.artifact_id = path.clone();
    }
    out.import_path = path;
    if out.key.trim().is_empty() {
        out.key = out.derive_key();
    }
    Some(out)
}

/// Ensure the prefix and strip characters outside `[0-9A-Za-z._+-]`.
/// A version that collapses to the bare prefix is unresolved.
fn coerce_version(raw: &str, prefix: char) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let prefixed = if raw.starts_with(prefix) {
        raw.to_string()
    } else {
        format!("{}{}", prefix, raw)
    };
    let cleaned: String = prefixed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
        .collect();
    if cleaned.is_empty() || cleaned == prefix.to_string() {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scope;
    use proptest::prelude::*;

    fn go_rules() -> SanitizeRules {
        Ecosystem::Go.sanitize_rules()
    }

    #[test]
    fn test_go_version_gets_prefix() {
        let d = Dependency::module(Ecosystem::Go, "github.com/pkg/errors", Some("0.9.1"), Scope::Compile);
        let s = sanitize(&d, &go_rules()).unwrap();
        assert_eq!(s.version.as_deref(), Some("v0.9.1"));
        assert_eq!(s.import_path, "github.com/pkg/errors");
    }

    #[test]
    fn test_go_version_strips_invalid_chars() {
        let d = Dependency::module(Ecosystem::Go, "example.com/m", Some("v1.2.3+incompatible\"!"), Scope::Compile);
        let s = sanitize(&d, &go_rules()).unwrap();
        assert_eq!(s.version.as_deref(), Some("v1.2.3+incompatible"));
    }

    #[test]
    fn test_go_degenerate_version_is_unresolved() {
        let d = Dependency::module(Ecosystem::Go, "example.com/m", Some("@#"), Scope::Compile);
        let s = sanitize(&d, &go_rules()).unwrap();
        assert_eq!(s.version, None);
    }

    #[test]
    fn test_go_missing_version_stays_unresolved() {
        let d = Dependency::module(Ecosystem::Go, "example.com/m", None, Scope::Compile);
        let s = sanitize(&d, &go_rules()).unwrap();
        assert_eq!(s.version, None);
    }

    #[test]
    fn test_go_falls_back_to_name_then_drops() {
        let mut d = Dependency::module(Ecosystem::Go, "", None, Scope::Compile);
        d.name = "example.com/named".into();
        d.key.clear();
        let s = sanitize(&d, &go_rules()).unwrap();
        assert_eq!(s.import_path, "example.com/named");
        assert!(s.is_identifiable());

        d.name.clear();
        assert!(sanitize(&d, &go_rules()).is_none());
    }

    #[test]
    fn test_identity_passes_through() {
        let d = Dependency::package(Ecosystem::Node, "left-pad", Some("^1.0.0"), Scope::Compile);
        assert_eq!(sanitize(&d, &SanitizeRules::Identity), Some(d));
    }

    proptest! {
        #[test]
        fn sanitize_is_deterministic(path in "[a-z./]{0,20}", version in ".{0,12}") {
            let d = Dependency::module(Ecosystem::Go, &path, Some(&version), Scope::Compile);
            prop_assert_eq!(sanitize(&d, &go_rules()), sanitize(&d, &go_rules()));
        }

        #[test]
        fn sanitized_versions_use_allowed_charset(version in ".{0,12}") {
            let d = Dependency::module(Ecosystem::Go, "example.com/m", Some(&version), Scope::Compile);
            if let Some(v) = sanitize(&d, &go_rules()).and_then(|s| s.version) {
                prop_assert!(v.starts_with('v'));
                prop_assert!(v.len() > 1);
                prop_assert!(v.chars().all(|c| c.is_ascii_alphanumeric() || "._-+".contains(c)));
            }
        }
    }
}
