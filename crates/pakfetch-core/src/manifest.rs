//! Packument and manifest types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Registry metadata for every published version of a package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packument {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

impl Packument {
    /// Whether `version` carries a non-empty `deprecated` message.
    #[must_use]
    pub fn is_deprecated(&self, version: &str) -> bool {
        self.versions
            .get(version)
            .and_then(|doc| doc.get("deprecated"))
            .and_then(Value::as_str)
            .is_some_and(|msg| !msg.is_empty())
    }
}

/// Normalized metadata for a single package version, plus provenance.
///
/// Provenance fields serialize with the leading-underscore names npm
/// tooling uses (`_resolved`, `_integrity`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundled_dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bin: BTreeMap<String, String>,
    /// `directories.bin`, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directories_bin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_resolved", default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(rename = "_integrity", default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(rename = "_shasum", default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(rename = "_shrinkwrap", default, skip_serializing_if = "Option::is_none")]
    pub shrinkwrap: Option<Value>,
    /// Registry hint: `Some(false)` means the tarball has no shrinkwrap.
    #[serde(rename = "_hasShrinkwrap", default, skip_serializing_if = "Option::is_none")]
    pub has_shrinkwrap: Option<bool>,
    /// Identity a fetcher vouches for as stable across time (e.g. `git+url#sha`).
    #[serde(rename = "_uniqueResolved", default, skip_serializing_if = "Option::is_none")]
    pub unique_resolved: Option<String>,
    #[serde(rename = "_warnings", default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Manifest {
    /// Build a manifest from a `package.json`-shaped document.
    #[must_use]
    pub fn from_package_json(doc: &Value) -> Self {
        let name = str_field(doc, "name").unwrap_or_default();
        let version = str_field(doc, "version").unwrap_or_default();
        let dependencies = string_map(doc.get("dependencies"));

        let bundled = doc
            .get("bundledDependencies")
            .or_else(|| doc.get("bundleDependencies"));
        let bundled_dependencies = match bundled {
            Some(Value::Bool(true)) => dependencies.keys().cloned().collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };

        let bin = match doc.get("bin") {
            Some(Value::String(path)) if !name.is_empty() => {
                let bin_name = name.rsplit('/').next().unwrap_or(&name).to_string();
                BTreeMap::from([(bin_name, normalize_bin_path(path))])
            }
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|p| (k.clone(), normalize_bin_path(p))))
                .collect(),
            _ => BTreeMap::new(),
        };

        let id = if name.is_empty() {
            String::new()
        } else {
            format!("{name}@{version}")
        };

        Self {
            dev_dependencies: string_map(doc.get("devDependencies")),
            optional_dependencies: string_map(doc.get("optionalDependencies")),
            peer_dependencies: string_map(doc.get("peerDependencies")),
            directories_bin: doc
                .get("directories")
                .and_then(|d| d.get("bin"))
                .and_then(Value::as_str)
                .map(String::from),
            deprecated: str_field(doc, "deprecated").filter(|d| !d.is_empty()),
            has_shrinkwrap: doc.get("_hasShrinkwrap").and_then(Value::as_bool),
            name,
            version,
            dependencies,
            bundled_dependencies,
            bin,
            id,
            ..Self::default()
        }
    }

    /// Fill empty fields from `other` without overwriting anything set here.
    pub fn fill_from(&mut self, other: Manifest) {
        if self.name.is_empty() {
            self.name = other.name;
        }
        if self.version.is_empty() {
            self.version = other.version;
        }
        fill_map(&mut self.dependencies, other.dependencies);
        fill_map(&mut self.dev_dependencies, other.dev_dependencies);
        fill_map(&mut self.optional_dependencies, other.optional_dependencies);
        fill_map(&mut self.peer_dependencies, other.peer_dependencies);
        if self.bundled_dependencies.is_empty() {
            self.bundled_dependencies = other.bundled_dependencies;
        }
        fill_map(&mut self.bin, other.bin);
        self.directories_bin = self.directories_bin.take().or(other.directories_bin);
        self.deprecated = self.deprecated.take().or(other.deprecated);
        self.resolved = self.resolved.take().or(other.resolved);
        self.integrity = self.integrity.take().or(other.integrity);
        self.shasum = self.shasum.take().or(other.shasum);
        self.shrinkwrap = self.shrinkwrap.take().or(other.shrinkwrap);
        self.unique_resolved = self.unique_resolved.take().or(other.unique_resolved);
        self.refresh_id();
    }

    /// Recompute `_id` from name and version.
    pub fn refresh_id(&mut self) {
        if !self.name.is_empty() {
            self.id = format!("{}@{}", self.name, self.version);
        }
    }
}

fn fill_map(target: &mut BTreeMap<String, String>, source: BTreeMap<String, String>) {
    if target.is_empty() {
        *target = source;
    }
}

fn str_field(doc: &Value, key: &str) -> Option<String> {
    doc.get(key).and_then(Value::as_str).map(String::from)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// `./bin/cli.js` and `bin/cli.js` name the same file.
#[must_use]
pub fn normalize_bin_path(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    p
}
