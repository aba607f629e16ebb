//! Dependency manifest: the flattened `(name, version, depth)` list the
//! packager CDN computes for a dependency set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Direct dependencies as declared in `package.json`: name to version
/// range. Ordered so the serialized form is a stable signature.
pub type DependencySet = BTreeMap<String, String>;

/// One resolved package in the transitive closure, topologically ordered
/// by depth (direct dependencies have depth 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub depth: u32,
}

/// Response shape of the packager's manifest endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct ManifestResponse {
    pub manifest: Vec<ManifestEntry>,
}

/// Strip leading range operators from a version range so it can stand in
/// as a concrete version when the packager is unreachable (`^1.2.3`
/// becomes `1.2.3`).
pub fn strip_range_operators(range: &str) -> String {
    range
        .trim()
        .trim_start_matches(['^', '~', '>', '<', '='])
        .trim()
        .to_string()
}

/// Fallback manifest listing only the direct dependencies, used when the
/// packager cannot be reached.
pub fn synthesize(dependencies: &DependencySet) -> Vec<ManifestEntry> {
    dependencies
        .iter()
        .map(|(name, range)| ManifestEntry {
            name: name.clone(),
            version: strip_range_operators(range),
            depth: 0,
        })
        .collect()
}

/// Stable signature of a dependency set; a change forces a full reload.
pub fn signature(dependencies: &DependencySet) -> String {
    serde_json::to_string(dependencies).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_range_operators() {
        assert_eq!(strip_range_operators("^1.2.3"), "1.2.3");
        assert_eq!(strip_range_operators("~0.4.0"), "0.4.0");
        assert_eq!(strip_range_operators(">=2.0.0"), "2.0.0");
        assert_eq!(strip_range_operators("1.0.0"), "1.0.0");
    }

    #[test]
    fn synthesized_manifest_lists_direct_deps_at_depth_zero() {
        let mut deps = DependencySet::new();
        deps.insert("react".into(), "^18.2.0".into());
        deps.insert("uuid".into(), "~9.0.0".into());

        let manifest = synthesize(&deps);
        assert_eq!(
            manifest,
            vec![
                ManifestEntry {
                    name: "react".into(),
                    version: "18.2.0".into(),
                    depth: 0
                },
                ManifestEntry {
                    name: "uuid".into(),
                    version: "9.0.0".into(),
                    depth: 0
                },
            ]
        );
    }

    #[test]
    fn signature_is_order_insensitive() {
        let mut a = DependencySet::new();
        a.insert("b".into(), "1".into());
        a.insert("a".into(), "2".into());

        let mut b = DependencySet::new();
        b.insert("a".into(), "2".into());
        b.insert("b".into(), "1".into());

        assert_eq!(signature(&a), signature(&b));
    }
}
