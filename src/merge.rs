//! Precedence-preserving merge of dependency lists by identity.

use std::collections::{HashMap, HashSet};

use crate::models::Dependency;

/// Merge `preferred` with `fallbacks`, in order, keeping the first record
/// seen for every key.
///
/// Output order: preferred records in their original order, then each
/// fallback's unseen records in that fallback's order. Not commutative;
/// `merge(merge(a, b), b) == merge(a, b)`.
pub fn merge(preferred: &[Dependency], fallbacks: &[&[Dependency]]) -> Vec<Dependency> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut merged = Vec::with_capacity(preferred.len());

    for dep in std::iter::once(preferred)
        .chain(fallbacks.iter().copied())
        .flatten()
    {
        if seen.insert(dep.key.as_str()) {
            merged.push(dep.clone());
        }
    }

    merged
}

/// Fill the version of every unresolved record from the first candidate
/// matching by key, then by artifact name (case-insensitive). A name match
/// across two different qualified groups (`com.acme:core` vs
/// `org.other:core`) is rejected. Only the version field is touched.
/// Returns how many records were filled.
pub fn fill_missing_versions(deps: &mut [Dependency], candidates: &[Dependency]) -> usize {
    let mut by_key: HashMap<&str, &str> = HashMap::new();
    let mut by_name: HashMap<String, Vec<(&str, &str)>> = HashMap::new();
    for c in candidates {
        let Some(version) = c.version.as_deref() else {
            continue;
        };
        by_key.entry(c.key.as_str()).or_insert(version);
        let name = c.manifest_name().to_lowercase();
        if !name.is_empty() {
            by_name
                .entry(name)
                .or_default()
                .push((qualified_group(c), version));
        }
    }

    let mut filled = 0;
    for dep in deps.iter_mut().filter(|d| d.version.is_none()) {
        let group = qualified_group(dep);
        let found = by_key.get(dep.key.as_str()).copied().or_else(|| {
            by_name
                .get(&dep.manifest_name().to_lowercase())?
                .iter()
                .find(|(g, _)| g.is_empty() || group.is_empty() || g.eq_ignore_ascii_case(group))
                .map(|(_, v)| *v)
        });
        if let Some(version) = found {
            dep.version = Some(version.to_string());
            filled += 1;
        }
    }
    filled
}

/// The record's group, or `""` when it is missing or only the ecosystem tag.
fn qualified_group(dep: &Dependency) -> &str {
    let group = dep.group_id.trim();
    if group == dep.ecosystem.group_tag() {
        ""
    } else {
        group
    }
}

/// Number of records in `final_deps` whose key is absent from `declared`.
pub fn added_count(final_deps: &[Dependency], declared: &[Dependency]) -> usize {
    let declared: HashSet<&str> = declared.iter().map(|d| d.key.as_str()).collect();
    final_deps
        .iter()
        .filter(|d| !declared.contains(d.key.as_str()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Ecosystem, Scope};
    use proptest::prelude::*;

    fn dep(group: &str, artifact: &str, version: &str) -> Dependency {
        let version = (!version.is_empty()).then_some(version);
        Dependency::coordinate(Ecosystem::Java, group, artifact, version, Scope::Compile)
    }

    #[test]
    fn test_preferred_wins_and_fallback_appends() {
        let preferred = vec![dep("a", "b", "1.0")];
        let fallback = vec![dep("a", "b", "2.0"), dep("c", "d", "3.0")];

        let merged = merge(&preferred, &[&fallback]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, "a:b");
        assert_eq!(merged[0].version.as_deref(), Some("1.0"));
        assert_eq!(merged[1].key, "c:d");
        assert_eq!(merged[1].version.as_deref(), Some("3.0"));
    }

    #[test]
    fn test_fallbacks_keep_call_order() {
        let sbom = vec![dep("x", "y", "1")];
        let scanned = vec![dep("x", "y", ""), dep("p", "q", "")];
        let merged = merge(&[], &[&sbom, &scanned]);
        assert_eq!(merged[0].version.as_deref(), Some("1"));
        assert_eq!(merged[1].key, "p:q");
    }

    #[test]
    fn test_duplicate_inside_preferred_keeps_first() {
        let preferred = vec![dep("a", "b", "1"), dep("a", "b", "2")];
        let merged = merge(&preferred, &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].version.as_deref(), Some("1"));
    }

    #[test]
    fn test_fill_missing_versions_by_key_then_name() {
        let mut deps = vec![dep("a", "b", ""), dep("g", "Gson", ""), dep("k", "kept", "9")];
        let candidates = vec![
            dep("a", "b", "1.1"),
            Dependency::package(Ecosystem::Java, "gson", Some("2.10"), Scope::Compile),
            dep("k", "kept", "1"),
        ];

        let filled = fill_missing_versions(&mut deps, &candidates);

        assert_eq!(filled, 2);
        assert_eq!(deps[0].version.as_deref(), Some("1.1"));
        assert_eq!(deps[1].version.as_deref(), Some("2.10"));
        assert_eq!(deps[1].key, "g:Gson");
        assert_eq!(deps[2].version.as_deref(), Some("9"));
    }

    #[test]
    fn test_name_fill_rejects_a_different_group() {
        let mut deps = vec![dep("com.acme", "core", ""), dep("com.acme", "util", "")];
        let mut untyped = Dependency::package(Ecosystem::Java, "util", Some("3.0"), Scope::Compile);
        untyped.group_id.clear();
        let candidates = vec![
            dep("org.other", "core", "9.9"),
            dep("org.other", "util", "8.8"),
            untyped,
        ];

        let filled = fill_missing_versions(&mut deps, &candidates);

        assert_eq!(filled, 1);
        assert_eq!(deps[0].version, None);
        assert_eq!(deps[1].version.as_deref(), Some("3.0"));

        let mut same_group = vec![dep("COM.ACME", "core", "")];
        fill_missing_versions(&mut same_group, &[dep("com.acme", "Core", "1.2")]);
        assert_eq!(same_group[0].version.as_deref(), Some("1.2"));
    }

    #[test]
    fn test_fill_without_candidates_stays_unresolved() {
        let mut deps = vec![dep("a", "b", "")];
        assert_eq!(fill_missing_versions(&mut deps, &[]), 0);
        assert_eq!(deps[0].version, None);
    }

    #[test]
    fn test_added_count() {
        let declared = vec![dep("a", "b", "1")];
        let merged = vec![dep("a", "b", "1"), dep("c", "d", "")];
        assert_eq!(added_count(&merged, &declared), 1);
    }

    fn arb_list() -> impl Strategy<Value = Vec<Dependency>> {
        prop::collection::vec(("[a-c]", "[a-c]", "[0-9]{0,1}"), 0..8).prop_map(|items| {
            items
                .into_iter()
                .map(|(g, a, v)| dep(&g, &a, &v))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn merged_keys_are_unique(a in arb_list(), b in arb_list(), c in arb_list()) {
            let merged = merge(&a, &[&b, &c]);
            let keys: HashSet<_> = merged.iter().map(|d| d.key.clone()).collect();
            prop_assert_eq!(keys.len(), merged.len());
        }

        #[test]
        fn merge_is_idempotent(a in arb_list(), b in arb_list()) {
            let once = merge(&a, &[&b]);
            let twice = merge(&once, &[&b]);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn preferred_record_is_retained_verbatim(a in arb_list(), b in arb_list()) {
            let merged = merge(&a, &[&b]);
            for d in &merged {
                if let Some(first) = a.iter().find(|x| x.key == d.key) {
                    prop_assert_eq!(first, d);
                }
            }
        }
    }
}
