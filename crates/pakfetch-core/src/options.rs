//! Per-request fetch configuration.

use crate::cache::ContentCache;
use crate::npmrc::NpmrcConfig;
use crate::spec::PackageSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override the registry URL.
pub const REGISTRY_ENV: &str = "PAKFETCH_REGISTRY";

/// Files at or below this size are buffered whole by the file fetcher.
pub const DEFAULT_SMALL_FILE_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Retry tuning for git subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryOptions {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Backoff multiplier between attempts.
    pub factor: u32,
    /// Delay before the first retry, in milliseconds.
    pub min_timeout_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_timeout_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 2,
            factor: 10,
            min_timeout_ms: 1_000,
            max_timeout_ms: 60_000,
        }
    }
}

impl RetryOptions {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let mult = u64::from(self.factor.max(1)).saturating_pow(exp);
        let ms = self.min_timeout_ms.saturating_mul(mult).min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Fetch options.
///
/// A value object: derive a variant with the `with_*` builders on a clone
/// rather than mutating a shared instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Content cache directory. `None` disables every caching tier.
    pub cache: Option<PathBuf>,
    /// Default registry URL (always ends with `/`).
    pub registry: String,
    /// Scope (`@scope`) to registry URL overrides.
    pub scope_targets: BTreeMap<String, String>,
    /// Registry host (optionally with path) to bearer token.
    pub auth_tokens: BTreeMap<String, String>,
    /// Expected integrity of the tarball, if known.
    pub integrity: Option<String>,
    /// Known resolved location of the tarball, if any.
    pub resolved: Option<String>,
    pub offline: bool,
    pub prefer_offline: bool,
    pub prefer_online: bool,
    /// Request full packuments instead of the abbreviated install document.
    pub full_metadata: bool,
    pub default_tag: String,
    pub retry: RetryOptions,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub dmode: u32,
    pub fmode: u32,
    pub umask: u32,
    /// Base directory for relative file and directory specs.
    #[serde(rename = "where")]
    pub where_: PathBuf,
    pub small_file_threshold: u64,
    pub user_agent: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache: None,
            registry: DEFAULT_REGISTRY.to_string(),
            scope_targets: BTreeMap::new(),
            auth_tokens: BTreeMap::new(),
            integrity: None,
            resolved: None,
            offline: false,
            prefer_offline: false,
            prefer_online: false,
            full_metadata: false,
            default_tag: "latest".to_string(),
            retry: RetryOptions::default(),
            uid: None,
            gid: None,
            dmode: 0o777,
            fmode: 0o666,
            umask: 0o022,
            where_: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            small_file_threshold: DEFAULT_SMALL_FILE_THRESHOLD,
            user_agent: concat!("pakfetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Options {
    /// Options using the registry from `PAKFETCH_REGISTRY` or the default.
    #[must_use]
    pub fn from_env() -> Self {
        let registry = std::env::var(REGISTRY_ENV).unwrap_or_else(|_| DEFAULT_REGISTRY.to_string());
        Self::default().with_registry(&registry)
    }

    /// Set the cache directory.
    #[must_use]
    pub fn with_cache(mut self, cache: impl Into<PathBuf>) -> Self {
        self.cache = Some(cache.into());
        self
    }

    /// Disable caching.
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    /// Set the default registry. A trailing slash is added if missing.
    #[must_use]
    pub fn with_registry(mut self, registry: &str) -> Self {
        self.registry = with_trailing_slash(registry);
        self
    }

    /// Route a scope (`@scope`) to a specific registry.
    #[must_use]
    pub fn with_scope_target(mut self, scope: &str, registry: &str) -> Self {
        let scope = if scope.starts_with('@') {
            scope.to_string()
        } else {
            format!("@{scope}")
        };
        self.scope_targets.insert(scope, with_trailing_slash(registry));
        self
    }

    #[must_use]
    pub fn with_auth_token(mut self, host: &str, token: &str) -> Self {
        self.auth_tokens.insert(host.to_string(), token.to_string());
        self
    }

    #[must_use]
    pub fn with_integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    #[must_use]
    pub fn with_resolved(mut self, resolved: impl Into<String>) -> Self {
        self.resolved = Some(resolved.into());
        self
    }

    #[must_use]
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    #[must_use]
    pub fn with_prefer_offline(mut self, prefer_offline: bool) -> Self {
        self.prefer_offline = prefer_offline;
        self
    }

    #[must_use]
    pub fn with_prefer_online(mut self, prefer_online: bool) -> Self {
        self.prefer_online = prefer_online;
        self
    }

    #[must_use]
    pub fn with_full_metadata(mut self, full: bool) -> Self {
        self.full_metadata = full;
        self
    }

    #[must_use]
    pub fn with_default_tag(mut self, tag: impl Into<String>) -> Self {
        self.default_tag = tag.into();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_where(mut self, dir: impl Into<PathBuf>) -> Self {
        self.where_ = dir.into();
        self
    }

    #[must_use]
    pub fn with_small_file_threshold(mut self, bytes: u64) -> Self {
        self.small_file_threshold = bytes;
        self
    }

    #[must_use]
    pub fn with_modes(mut self, dmode: u32, fmode: u32, umask: u32) -> Self {
        self.dmode = dmode;
        self.fmode = fmode;
        self.umask = umask;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Merge scoped registries and auth tokens from `.npmrc` files.
    ///
    /// Values already present on `self` win over the files.
    #[must_use]
    pub fn with_npmrc(mut self, config: &NpmrcConfig) -> Self {
        if let Some(url) = &config.registry {
            if self.registry == DEFAULT_REGISTRY {
                self.registry = url.to_string();
            }
        }
        for (scope, url) in &config.scoped_registries {
            self.scope_targets
                .entry(scope.clone())
                .or_insert_with(|| url.to_string());
        }
        for (host, token) in &config.auth_tokens {
            self.auth_tokens
                .entry(host.clone())
                .or_insert_with(|| token.clone());
        }
        self
    }

    /// Load `.npmrc` files from `project_dir` upward and merge them in.
    #[must_use]
    pub fn with_npmrc_from(self, project_dir: &Path) -> Self {
        let config = crate::npmrc::load_npmrc_files(project_dir);
        self.with_npmrc(&config)
    }

    /// Registry that serves `spec`, honoring scope targets.
    #[must_use]
    pub fn registry_for(&self, spec: &PackageSpec) -> &str {
        spec.scope
            .as_deref()
            .and_then(|scope| self.scope_targets.get(scope))
            .map_or(self.registry.as_str(), String::as_str)
    }

    /// Bearer token for a request URL, matching host+path before bare host.
    #[must_use]
    pub fn auth_token_for(&self, url: &url::Url) -> Option<&str> {
        let host = url.host_str()?;
        let path = url.path().trim_end_matches('/');
        self.auth_tokens
            .iter()
            .filter(|(key, _)| {
                let key = key.trim_end_matches('/');
                key == host || (key.starts_with(host) && path.starts_with(&key[host.len()..]))
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(_, token)| token.as_str())
    }

    /// The content cache, if caching is enabled.
    #[must_use]
    pub fn content_cache(&self) -> Option<ContentCache> {
        self.cache.as_deref().map(ContentCache::new)
    }

    /// Resolve a possibly relative path against `where`.
    #[must_use]
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.where_.join(path)
        }
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.registry, DEFAULT_REGISTRY);
        assert_eq!(opts.default_tag, "latest");
        assert_eq!(opts.small_file_threshold, 2 * 1024 * 1024);
        assert!(opts.cache.is_none());
        assert!(opts.content_cache().is_none());
    }

    #[test]
    fn test_builders_do_not_touch_original() {
        let base = Options::default();
        let narrowed = base.clone().with_integrity("sha512-abc").with_prefer_online(true);
        assert!(base.integrity.is_none());
        assert!(!base.prefer_online);
        assert_eq!(narrowed.integrity.as_deref(), Some("sha512-abc"));
    }

    #[test]
    fn test_registry_trailing_slash() {
        let opts = Options::default().with_registry("http://localhost:4873");
        assert_eq!(opts.registry, "http://localhost:4873/");
    }

    #[test]
    fn test_registry_for_scope() {
        let opts = Options::default().with_scope_target("corp", "https://npm.corp.example");
        let scoped = PackageSpec::parse("@corp/tool@1.0.0", Path::new("/")).unwrap();
        let plain = PackageSpec::parse("react", Path::new("/")).unwrap();
        assert_eq!(opts.registry_for(&scoped), "https://npm.corp.example/");
        assert_eq!(opts.registry_for(&plain), DEFAULT_REGISTRY);
    }

    #[test]
    fn test_auth_token_prefers_longest_match() {
        let opts = Options::default()
            .with_auth_token("npm.example.com", "host-token")
            .with_auth_token("npm.example.com/private", "path-token");
        let url = url::Url::parse("https://npm.example.com/private/pkg").unwrap();
        assert_eq!(opts.auth_token_for(&url), Some("path-token"));
        let url = url::Url::parse("https://npm.example.com/pkg").unwrap();
        assert_eq!(opts.auth_token_for(&url), Some("host-token"));
        let url = url::Url::parse("https://other.example.com/pkg").unwrap();
        assert_eq!(opts.auth_token_for(&url), None);
    }

    #[test]
    fn test_retry_backoff_is_bounded() {
        let retry = RetryOptions::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(2), Duration::from_millis(10_000));
        assert_eq!(retry.backoff(3), Duration::from_millis(60_000));
    }

    #[test]
    fn test_deserialize_camel_case() {
        let opts: Options = serde_json::from_value(serde_json::json!({
            "preferOnline": true,
            "defaultTag": "next",
            "where": "/work"
        }))
        .unwrap();
        assert!(opts.prefer_online);
        assert_eq!(opts.default_tag, "next");
        assert_eq!(opts.where_, PathBuf::from("/work"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(REGISTRY_ENV, "http://127.0.0.1:9999");
        let opts = Options::from_env();
        std::env::remove_var(REGISTRY_ENV);
        assert_eq!(opts.registry, "http://127.0.0.1:9999/");
    }
}
