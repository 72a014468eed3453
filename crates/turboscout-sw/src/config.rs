//! Worker and registrar configuration.
//!
//! Everything the worker needs to know about its deployment is fixed when it is constructed;
//! there is no runtime mutation. Bumping [`WorkerConfig::version`] is the only way to move
//! every client onto a fresh asset set.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use turboscout_common::{CommonError, RetryConfig};
use url::Url;

use crate::{ServiceWorkerError, SwResult};

/// Cache worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Namespace shared by every generation of this app's caches.
    pub cache_prefix: String,

    /// Version tag of the current generation.
    pub version: String,

    /// Registration scope. Shell URLs resolve against it.
    pub scope: Url,

    /// Root document served for navigations.
    pub root_document: String,

    /// Build manifest listing every hashed asset.
    pub manifest_path: String,

    /// Take over from an older active generation as soon as install finishes.
    pub skip_waiting_on_install: bool,

    /// Upper bound on the whole install event. `None` waits indefinitely.
    pub install_timeout_secs: Option<u64>,

    /// Attempts per URL while precaching (1 = no retries).
    pub precache_attempts: u32,

    /// Directory the cache stores are persisted to. `None` keeps them in memory.
    pub cache_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "turboscout-cache".to_string(),
            version: "v4".to_string(),
            scope: Url::parse("http://localhost:3000/").expect("static URL"),
            root_document: "index.html".to_string(),
            manifest_path: "asset-manifest.json".to_string(),
            skip_waiting_on_install: true,
            install_timeout_secs: None,
            precache_attempts: 1,
            cache_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for the given scope with default naming.
    pub fn for_scope(scope: Url) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Set the version tag.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> SwResult<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> SwResult<()> {
        if self.cache_prefix.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "cache_prefix must not be empty".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "version must not be empty".to_string(),
            ));
        }
        if !self.scope.path().ends_with('/') {
            return Err(ServiceWorkerError::ConfigError(format!(
                "scope must end with '/': {}",
                self.scope
            )));
        }
        if self.scope.cannot_be_a_base() {
            return Err(ServiceWorkerError::ConfigError(format!(
                "scope cannot be used as a base URL: {}",
                self.scope
            )));
        }
        Ok(())
    }

    /// Identifier of the current generation (`<prefix>-<version>`).
    pub fn generation_id(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Prefix shared by every generation of this app.
    pub fn generation_prefix(&self) -> String {
        format!("{}-", self.cache_prefix)
    }

    /// Whether `name` is a generation of this app other than the current one.
    pub fn is_stale_generation(&self, name: &str) -> bool {
        name.starts_with(&self.generation_prefix()) && name != self.generation_id()
    }

    /// Application root.
    pub fn root_url(&self) -> Url {
        self.scope.clone()
    }

    /// Root document URL.
    pub fn document_url(&self) -> SwResult<Url> {
        Ok(self.scope.join(&self.root_document)?)
    }

    /// Build manifest URL.
    pub fn manifest_url(&self) -> SwResult<Url> {
        Ok(self.scope.join(&self.manifest_path)?)
    }

    /// The shell: everything needed for any offline fallback at all.
    pub fn shell_urls(&self) -> SwResult<Vec<Url>> {
        Ok(vec![
            self.root_url(),
            self.document_url()?,
            self.manifest_url()?,
        ])
    }

    /// Install deadline, if any.
    pub fn install_timeout(&self) -> Option<Duration> {
        self.install_timeout_secs.map(Duration::from_secs)
    }

    /// Retry policy for precache fetches.
    pub fn precache_retry(&self) -> RetryConfig {
        RetryConfig::attempts(self.precache_attempts)
    }
}

/// Which kind of build the page is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Production,
    Development,
}

/// Page-side registrar configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// The registrar does nothing outside production builds.
    pub build_mode: BuildMode,

    /// Worker script, relative to the scope.
    pub script_path: String,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            build_mode: BuildMode::Production,
            script_path: "service-worker.js".to_string(),
        }
    }
}

/// Combined configuration file for the command-line host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub worker: WorkerConfig,
    pub registrar: RegistrarConfig,
}

impl HostConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> SwResult<Self> {
        let config: Self = read_json(path)?;
        config.worker.validate()?;
        Ok(config)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> SwResult<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CommonError::config_with_source(format!("cannot read {}", path.display()), e)
    })?;
    let value = serde_json::from_str(&raw).map_err(|e| {
        CommonError::config_with_source(format!("cannot parse {}", path.display()), e)
    })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_generation() {
        let config = WorkerConfig::default();
        assert_eq!(config.generation_id(), "turboscout-cache-v4");
        assert_eq!(config.generation_prefix(), "turboscout-cache-");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stale_generation_detection() {
        let config = WorkerConfig::default();
        assert!(config.is_stale_generation("turboscout-cache-v1"));
        assert!(!config.is_stale_generation("turboscout-cache-v4"));
        assert!(!config.is_stale_generation("other-app-v1"));
        assert!(!config.is_stale_generation("turboscout-cachev1"));
    }

    #[test]
    fn test_shell_urls_resolve_against_scope() {
        let config =
            WorkerConfig::for_scope(Url::parse("https://scout.example/turboscout/").unwrap());
        let shell: Vec<String> = config
            .shell_urls()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            shell,
            vec![
                "https://scout.example/turboscout/",
                "https://scout.example/turboscout/index.html",
                "https://scout.example/turboscout/asset-manifest.json",
            ]
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = WorkerConfig::default();
        config.version = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ServiceWorkerError::ConfigError(_))
        ));

        let config = WorkerConfig::for_scope(Url::parse("https://scout.example/app").unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_install_timeout_and_retry() {
        let mut config = WorkerConfig::default();
        assert!(config.install_timeout().is_none());
        config.install_timeout_secs = Some(30);
        config.precache_attempts = 3;
        assert_eq!(config.install_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.precache_retry().max_attempts, 3);
    }

    #[test]
    fn test_host_config_from_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "worker": {{ "version": "v5", "scope": "https://scout.example/" }},
                 "registrar": {{ "build_mode": "development" }} }}"#
        )
        .unwrap();

        let config = HostConfig::from_file(file.path()).unwrap();
        assert_eq!(config.worker.generation_id(), "turboscout-cache-v5");
        assert_eq!(config.worker.manifest_path, "asset-manifest.json");
        assert_eq!(config.registrar.build_mode, BuildMode::Development);
        assert_eq!(config.registrar.script_path, "service-worker.js");
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            WorkerConfig::from_file(file.path()),
            Err(ServiceWorkerError::ConfigError(_))
        ));
    }
}
