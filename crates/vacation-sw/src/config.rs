//! Worker configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ServiceWorkerError;

/// Default application name, the prefix of every cache generation.
pub const DEFAULT_APP_NAME: &str = "vacation-tracker";

/// Static resources cached on install.
pub const DEFAULT_MANIFEST: &[&str] = &[
    "index.html",
    "style.css",
    "app.js",
    "vacationtracker.json",
    "assets/icons/icon-512x512.png",
];

/// Configuration of one worker generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Application name
    pub app_name: String,

    /// Version tag, bumped on every deploy that must invalidate old caches
    pub version: String,

    /// Scope the manifest and shell paths resolve against
    pub scope: Url,

    /// Root-relative paths cached on install, in order
    pub manifest: Vec<String>,

    /// Document served for failed offline navigations
    pub shell_path: String,

    /// Heartbeat broadcast period in milliseconds
    pub broadcast_interval_ms: u64,

    /// Data of the heartbeat `update` message
    pub update_message: String,

    /// Per-request network timeout in milliseconds
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            version: "v1".to_string(),
            scope: Url::parse("http://localhost:8080/").expect("static URL is valid"),
            manifest: DEFAULT_MANIFEST.iter().map(|p| p.to_string()).collect(),
            shell_path: "index.html".to_string(),
            broadcast_interval_ms: 10_000,
            update_message: "new data available".to_string(),
            fetch_timeout_ms: None,
        }
    }
}

impl WorkerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Parse from JSON text and validate.
    pub fn from_json_str(text: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ServiceWorkerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_scope(mut self, scope: Url) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_manifest<I, S>(mut self, manifest: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = manifest.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shell_path(mut self, path: impl Into<String>) -> Self {
        self.shell_path = path.into();
        self
    }

    pub fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Cache generation name: `<app-name>-<version>`.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.app_name, self.version)
    }

    /// Resolve a root-relative path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.scope
            .join(path.trim_start_matches('/'))
            .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{path}: {e}")))
    }

    /// URL of the shell page.
    pub fn shell_url(&self) -> Result<Url, ServiceWorkerError> {
        self.resolve(&self.shell_path)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration before a worker is built from it.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.app_name.trim().is_empty() {
            return Err(ServiceWorkerError::Config("app_name is empty".into()));
        }
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::Config("version is empty".into()));
        }
        if self.scope.cannot_be_a_base() || !self.scope.path().ends_with('/') {
            return Err(ServiceWorkerError::Config(format!(
                "scope {} must be a directory URL",
                self.scope
            )));
        }
        if self.broadcast_interval_ms == 0 {
            return Err(ServiceWorkerError::Config(
                "broadcast_interval_ms must be positive".into(),
            ));
        }
        for path in &self.manifest {
            self.resolve(path)?;
        }
        self.shell_url()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.cache_name(), "vacation-tracker-v1");
        assert_eq!(config.manifest.len(), 5);
        assert_eq!(config.broadcast_interval(), Duration::from_secs(10));
        assert_eq!(config.fetch_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_against_scope() {
        let config = WorkerConfig::default()
            .with_scope(Url::parse("https://example.com/app/").unwrap());

        assert_eq!(
            config.resolve("assets/icons/icon-512x512.png").unwrap().as_str(),
            "https://example.com/app/assets/icons/icon-512x512.png"
        );
        assert_eq!(
            config.resolve("/index.html").unwrap(),
            config.shell_url().unwrap()
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty_version = WorkerConfig::default().with_version("");
        assert!(matches!(
            empty_version.validate(),
            Err(ServiceWorkerError::Config(_))
        ));

        let file_scope = WorkerConfig::default()
            .with_scope(Url::parse("https://example.com/app/index.html").unwrap());
        assert!(file_scope.validate().is_err());

        let zero_interval = WorkerConfig::default().with_broadcast_interval(Duration::ZERO);
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WorkerConfig::from_json_str(
            r#"{"version": "v2", "manifest": ["a.html", "b.css"], "broadcast_interval_ms": 1000}"#,
        )
        .unwrap();

        assert_eq!(config.cache_name(), "vacation-tracker-v2");
        assert_eq!(config.manifest, vec!["a.html", "b.css"]);
        assert_eq!(config.broadcast_interval(), Duration::from_secs(1));
        assert_eq!(config.shell_path, "index.html");
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"app_name": "app", "version": "v9", "scope": "https://example.com/"}}"#
        )
        .unwrap();

        let config = WorkerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.cache_name(), "app-v9");

        assert!(WorkerConfig::from_json_file("/nonexistent/worker.json").is_err());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            WorkerConfig::from_json_str("{not json"),
            Err(ServiceWorkerError::Config(_))
        ));
    }
}
