//! Module name canonicalization and the normalized module map.
//!
//! There is no resolver beyond name normalization: `./lib/a.js`, `/lib/a.js`
//! and `lib\a.js` all name the module `lib/a.js`. `..` segments are kept
//! verbatim rather than resolved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Canonical form of a module name.
pub fn normalize_module_name(name: &str) -> String {
    name.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonical module name → module source.
///
/// Deserialized maps go through [`ModuleMap::normalize`], so keys are
/// canonical no matter where the map came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct ModuleMap(BTreeMap<String, String>);

impl From<BTreeMap<String, String>> for ModuleMap {
    fn from(modules: BTreeMap<String, String>) -> Self {
        Self::normalize(modules)
    }
}

impl From<ModuleMap> for BTreeMap<String, String> {
    fn from(modules: ModuleMap) -> Self {
        modules.0
    }
}

impl ModuleMap {
    /// Build a map from caller spellings, collapsing spellings that share a
    /// canonical name.
    ///
    /// Colliding spellings are applied in lexicographic order of the original
    /// key, so the last spelling wins deterministically when sources differ.
    pub fn normalize<I, K, V>(modules: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut entries: Vec<(String, String)> = modules
            .into_iter()
            .map(|(name, source)| (name.as_ref().to_string(), source.into()))
            .collect();
        entries.sort_by(|left, right| left.0.cmp(&right.0));

        let mut map = BTreeMap::new();
        for (original, source) in entries {
            let canonical = normalize_module_name(&original);
            if let Some(previous) = map.insert(canonical.clone(), source) {
                if map.get(&canonical) != Some(&previous) {
                    warn!(
                        module = %canonical,
                        spelling = %original,
                        "conflicting sources for one module; later spelling wins"
                    );
                }
            }
        }
        Self(map)
    }

    pub fn get(&self, canonical: &str) -> Option<&str> {
        self.0.get(canonical).map(String::as_str)
    }

    pub fn contains(&self, canonical: &str) -> bool {
        self.0.contains_key(canonical)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, source)| (name.as_str(), source.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialized_keys_are_canonical() {
        let modules: ModuleMap = serde_json::from_value(json!({
            "./main.js": "main",
            "lib\\util.js": "util",
            "/lib//extra.js": "extra"
        }))
        .expect("deserialize");
        let names: Vec<&str> = modules.names().collect();
        assert_eq!(names, vec!["lib/extra.js", "lib/util.js", "main.js"]);
        assert_eq!(modules.get("main.js"), Some("main"));
        assert_eq!(
            serde_json::to_value(&modules).expect("serialize"),
            json!({"lib/extra.js": "extra", "lib/util.js": "util", "main.js": "main"})
        );
    }

    #[test]
    fn normalizes_prefixes_and_separators() {
        assert_eq!(normalize_module_name("a.js"), "a.js");
        assert_eq!(normalize_module_name("./a.js"), "a.js");
        assert_eq!(normalize_module_name("/a.js"), "a.js");
        assert_eq!(normalize_module_name(".//lib/./b.js"), "lib/b.js");
        assert_eq!(normalize_module_name("lib\\b.js"), "lib/b.js");
        assert_eq!(normalize_module_name("../up.js"), "../up.js");
    }

    #[test]
    fn collapses_spellings_of_one_module() {
        let map = ModuleMap::normalize([("a.js", "1;"), ("./a.js", "1;"), ("lib/b.js", "2;")]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["a.js", "lib/b.js"]);
    }

    #[test]
    fn last_spelling_wins_on_conflict() {
        let map = ModuleMap::normalize([("a.js", "second"), ("./a.js", "first")]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a.js"), Some("second"));
    }
}
