//! Build manifest parsing and precache set computation.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{ServiceWorkerError, SwResult};

/// The build's `asset-manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
    /// Logical build key → hashed file path.
    pub files: BTreeMap<String, String>,

    /// Entry file paths, in build order.
    pub entrypoints: Vec<String>,
}

impl AssetManifest {
    /// Parse a manifest leniently.
    ///
    /// Non-string values are skipped and missing sections are empty. Only input that is not
    /// a JSON object is rejected.
    pub fn parse(bytes: &[u8]) -> SwResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ServiceWorkerError::ManifestError(e.to_string()))?;
        let Value::Object(root) = value else {
            return Err(ServiceWorkerError::ManifestError(
                "manifest is not a JSON object".to_string(),
            ));
        };

        let files = match root.get("files") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        };

        let entrypoints = match root.get("entrypoints") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self { files, entrypoints })
    }

    /// Every non-empty path the manifest names, duplicates included.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .values()
            .map(String::as_str)
            .chain(self.entrypoints.iter().map(String::as_str))
            .filter(|p| !p.is_empty())
    }

    /// Resolve every path against `base` into a deduplicated set.
    pub fn precache_set(&self, base: &Url) -> PrecacheSet {
        let mut set = PrecacheSet::new();
        for path in self.paths() {
            match base.join(path) {
                Ok(url) => {
                    set.insert(url);
                }
                Err(e) => debug!(path, error = %e, "Skipping unresolvable manifest path"),
            }
        }
        set
    }
}

/// Deduplicated absolute URLs to precache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheSet {
    urls: BTreeSet<Url>,
}

impl PrecacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a URL. Returns `false` if it was already present.
    pub fn insert(&mut self, mut url: Url) -> bool {
        url.set_fragment(None);
        self.urls.insert(url)
    }

    /// Union with the shell URLs.
    pub fn with_shell(mut self, shell: &[Url]) -> Self {
        for url in shell {
            self.insert(url.clone());
        }
        self
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.urls.contains(url)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.urls.iter()
    }

    pub fn to_vec(&self) -> Vec<Url> {
        self.urls.iter().cloned().collect()
    }
}
