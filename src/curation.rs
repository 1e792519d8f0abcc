//! Curation overlay: per-key field overrides loaded from a rule file.
//!
//! The rule file is a YAML list:
//!
//! ```yaml
//! - key: "org.slf4j:slf4j-api"
//!   version: "2.0.9"
//! - key: "npm:left-pad"
//!   scope: test
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::error::CurationError;
use crate::models::{Dependency, Scope};

/// One override, keyed by dependency identity. Empty fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CurationRule {
    pub key: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Informational only; never applied as a field override.
    #[serde(default)]
    pub proprietary: bool,
}

/// Where curation rules come from.
#[derive(Debug, Clone, Default)]
pub enum RuleSource {
    /// Curation not configured: the overlay is a no-op.
    #[default]
    None,
    File(PathBuf),
    Rules(Vec<CurationRule>),
}

/// Rules indexed by key. For duplicate keys the last rule wins.
#[derive(Debug, Default)]
pub struct CurationSet {
    rules: HashMap<String, CurationRule>,
}

impl CurationSet {
    pub fn load(source: &RuleSource) -> Result<Self, CurationError> {
        let rules = match source {
            RuleSource::None => Vec::new(),
            RuleSource::Rules(rules) => rules.clone(),
            RuleSource::File(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| CurationError::Unreadable {
                        path: path.clone(),
                        source,
                    })?;
                parse_rules(&content).map_err(|source| CurationError::Malformed {
                    path: path.clone(),
                    source,
                })?
            }
        };

        Ok(CurationSet {
            rules: rules.into_iter().map(|r| (r.key.clone(), r)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Override in place. Never adds or removes records. Returns how many
    /// records matched a rule.
    pub fn apply(&self, deps: &mut [Dependency]) -> usize {
        let mut matched = 0;
        for dep in deps.iter_mut() {
            let Some(rule) = self.rules.get(&dep.key) else {
                continue;
            };
            matched += 1;
            if let Some(v) = non_empty(&rule.version) {
                dep.version = Some(v.to_string());
            }
            if let Some(g) = non_empty(&rule.group) {
                dep.group_id = g.to_string();
            }
            if let Some(a) = non_empty(&rule.artifact) {
                dep.artifact_id = a.to_string();
            }
            if let Some(s) = non_empty(&rule.scope) {
                dep.scope = Scope::parse(s);
            }
            debug!(key = %dep.key, proprietary = rule.proprietary, "applied curation rule");
        }
        matched
    }
}

/// Load `source` and apply it to `deps`. On error `deps` is untouched.
pub fn apply_curations(deps: &mut [Dependency], source: &RuleSource) -> Result<usize, CurationError> {
    let set = CurationSet::load(source)?;
    if set.is_empty() {
        return Ok(0);
    }
    let matched = set.apply(deps);
    debug!(rules = set.len(), matched, "curation applied");
    Ok(matched)
}

fn parse_rules(content: &str) -> Result<Vec<CurationRule>, serde_yaml::Error> {
    // An empty file is an empty rule list, not a malformed one.
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(content)
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ecosystem;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn dep(group: &str, artifact: &str, version: &str) -> Dependency {
        Dependency::coordinate(Ecosystem::Java, group, artifact, Some(version), Scope::Compile)
    }

    fn rule(key: &str) -> CurationRule {
        CurationRule {
            key: key.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_version_override() {
        let mut deps = vec![dep("a", "b", "1.0")];
        let source = RuleSource::Rules(vec![CurationRule {
            version: Some("9.9".into()),
            ..rule("a:b")
        }]);

        apply_curations(&mut deps, &source).unwrap();

        assert_eq!(deps[0].key, "a:b");
        assert_eq!(deps[0].version.as_deref(), Some("9.9"));
    }

    #[test]
    fn test_all_fields_override_but_key_is_stable() {
        let mut deps = vec![dep("a", "b", "1.0"), dep("c", "d", "2.0")];
        let source = RuleSource::Rules(vec![CurationRule {
            version: Some("3".into()),
            group: Some("org.a".into()),
            artifact: Some("b-core".into()),
            scope: Some("test".into()),
            ..rule("a:b")
        }]);

        let matched = apply_curations(&mut deps, &source).unwrap();

        assert_eq!(matched, 1);
        assert_eq!(deps[0].group_id, "org.a");
        assert_eq!(deps[0].artifact_id, "b-core");
        assert_eq!(deps[0].scope, Scope::Test);
        assert_eq!(deps[0].key, "a:b");
        assert_eq!(deps[1], dep("c", "d", "2.0"));
    }

    #[test]
    fn test_empty_rule_fields_are_ignored() {
        let mut deps = vec![dep("a", "b", "1.0")];
        let source = RuleSource::Rules(vec![CurationRule {
            version: Some("  ".into()),
            ..rule("a:b")
        }]);
        apply_curations(&mut deps, &source).unwrap();
        assert_eq!(deps[0], dep("a", "b", "1.0"));
    }

    #[test]
    fn test_yaml_file() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "- key: \"a:b\"\n  version: \"9.9\"\n  proprietary: true\n- key: \"x:y\"").unwrap();
        let mut deps = vec![dep("a", "b", "1.0")];

        apply_curations(&mut deps, &RuleSource::File(f.path().to_path_buf())).unwrap();

        assert_eq!(deps[0].version.as_deref(), Some("9.9"));
    }

    #[test]
    fn test_malformed_file_leaves_list_untouched() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "key: [unterminated").unwrap();
        let original = vec![dep("a", "b", "1.0")];
        let mut deps = original.clone();

        let err = apply_curations(&mut deps, &RuleSource::File(f.path().to_path_buf())).unwrap_err();

        assert!(matches!(err, CurationError::Malformed { .. }));
        assert_eq!(deps, original);
    }

    #[test]
    fn test_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut deps = vec![dep("a", "b", "1.0")];
        let err = apply_curations(&mut deps, &RuleSource::File(dir.path().join("missing.yml")))
            .unwrap_err();
        assert!(matches!(err, CurationError::Unreadable { .. }));
    }

    #[test]
    fn test_no_source_is_noop() {
        let mut deps = vec![dep("a", "b", "1.0")];
        assert_eq!(apply_curations(&mut deps, &RuleSource::None).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn version_rule_changes_only_version(version in "[0-9.]{1,8}", other in "[a-z]{1,4}") {
            let original = vec![dep("a", "b", "1.0"), dep(&other, "z", "5")];
            let mut deps = original.clone();
            let source = RuleSource::Rules(vec![CurationRule {
                version: Some(version.clone()),
                ..rule("a:b")
            }]);

            apply_curations(&mut deps, &source).unwrap();

            let mut expected = original[0].clone();
            expected.version = Some(version);
            prop_assert_eq!(&deps[0], &expected);
            prop_assert_eq!(&deps[1], &original[1]);
        }
    }
}
