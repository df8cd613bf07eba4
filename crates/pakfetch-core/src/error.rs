//! Fetch error types.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Stable error codes, one per [`FetchError`] variant.
pub mod codes {
    pub const PKG_SPEC_TYPE_UNSUPPORTED: &str = "PKG_SPEC_TYPE_UNSUPPORTED";
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_NO_PACKAGE_JSON: &str = "PKG_NO_PACKAGE_JSON";
    pub const PKG_NO_VERSION_MATCH: &str = "PKG_NO_VERSION_MATCH";
    pub const PKG_NO_TARBALL_URL: &str = "PKG_NO_TARBALL_URL";
    pub const PKG_INTEGRITY_MISMATCH: &str = "PKG_INTEGRITY_MISMATCH";
    pub const PKG_GIT_TRANSIENT: &str = "PKG_GIT_TRANSIENT";
    pub const PKG_GIT_FATAL: &str = "PKG_GIT_FATAL";
    pub const PKG_NO_GIT_BINARY: &str = "PKG_NO_GIT_BINARY";
    pub const PKG_NETWORK_ERROR: &str = "PKG_NETWORK_ERROR";
    pub const PKG_NOT_FOUND: &str = "PKG_NOT_FOUND";
    pub const PKG_NOT_CACHED: &str = "PKG_NOT_CACHED";
    pub const PKG_TRUNCATED: &str = "PKG_TRUNCATED";
    pub const PKG_CACHE_ERROR: &str = "PKG_CACHE_ERROR";
    pub const PKG_HTTP_ERROR: &str = "PKG_HTTP_ERROR";
    pub const PKG_IO_ERROR: &str = "PKG_IO_ERROR";
    pub const PKG_JSON_INVALID: &str = "PKG_JSON_INVALID";
    pub const PKG_TAR_ERROR: &str = "PKG_TAR_ERROR";
}

/// Error returned by every public pakfetch entry point.
///
/// The type is `Clone` so one failure can be handed to every waiter of a
/// coalesced request and to every branch of a tee'd stream.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Unsupported spec type '{spec_type}' for '{spec}'")]
    SpecTypeUnsupported { spec: String, spec_type: String },

    #[error("Invalid package spec '{spec}': {reason}")]
    SpecInvalid { spec: String, reason: String },

    #[error("No package.json found for '{spec}'")]
    NoPackageJson { spec: String },

    #[error(
        "No matching version found for {name}@{range} (available: {})",
        available_list(.available)
    )]
    NoVersionMatch {
        name: String,
        range: String,
        available: Vec<String>,
    },

    #[error("No tarball URL for {name}@{version}")]
    NoTarballUrl { name: String, version: String },

    #[error("{}", describe_integrity(.expected, .actual, .spec.as_deref(), .path.as_deref()))]
    IntegrityMismatch {
        expected: String,
        actual: String,
        spec: Option<String>,
        path: Option<PathBuf>,
    },

    #[error("Transient git failure running `{command}`: {stderr}")]
    GitTransient { command: String, stderr: String },

    #[error("git `{command}` failed: {stderr}")]
    GitFatal { command: String, stderr: String },

    #[error("No git binary found in $PATH")]
    NoGitBinary,

    #[error("{status} response fetching {uri}")]
    Network { status: u16, uri: String },

    #[error("Package not found: {name}")]
    NotFound { name: String },

    #[error("Not cached and offline: {key}")]
    NotCached { key: String },

    #[error("Stream ended after {actual} of {expected} bytes")]
    Truncated { expected: u64, actual: u64 },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("HTTP error: {message}")]
    Http { message: String },

    #[error("IO error: {source}")]
    Io {
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Invalid JSON: {message}")]
    Json { message: String },

    #[error("Tar error: {message}")]
    Tar { message: String },
}

fn available_list(available: &[String]) -> String {
    if available.is_empty() {
        "none".to_string()
    } else {
        available.join(", ")
    }
}

fn describe_integrity(
    expected: &str,
    actual: &str,
    spec: Option<&str>,
    path: Option<&Path>,
) -> String {
    let mut msg = String::from("Integrity check failed");
    if let Some(spec) = spec {
        msg.push_str(&format!(" for '{spec}'"));
    }
    if let Some(path) = path {
        msg.push_str(&format!(" ({})", path.display()));
    }
    msg.push_str(&format!(": wanted {expected} but got {actual}"));
    msg
}

impl FetchError {
    /// Get the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SpecTypeUnsupported { .. } => codes::PKG_SPEC_TYPE_UNSUPPORTED,
            Self::SpecInvalid { .. } => codes::PKG_SPEC_INVALID,
            Self::NoPackageJson { .. } => codes::PKG_NO_PACKAGE_JSON,
            Self::NoVersionMatch { .. } => codes::PKG_NO_VERSION_MATCH,
            Self::NoTarballUrl { .. } => codes::PKG_NO_TARBALL_URL,
            Self::IntegrityMismatch { .. } => codes::PKG_INTEGRITY_MISMATCH,
            Self::GitTransient { .. } => codes::PKG_GIT_TRANSIENT,
            Self::GitFatal { .. } => codes::PKG_GIT_FATAL,
            Self::NoGitBinary => codes::PKG_NO_GIT_BINARY,
            Self::Network { .. } => codes::PKG_NETWORK_ERROR,
            Self::NotFound { .. } => codes::PKG_NOT_FOUND,
            Self::NotCached { .. } => codes::PKG_NOT_CACHED,
            Self::Truncated { .. } => codes::PKG_TRUNCATED,
            Self::Cache { .. } => codes::PKG_CACHE_ERROR,
            Self::Http { .. } => codes::PKG_HTTP_ERROR,
            Self::Io { .. } => codes::PKG_IO_ERROR,
            Self::Json { .. } => codes::PKG_JSON_INVALID,
            Self::Tar { .. } => codes::PKG_TAR_ERROR,
        }
    }

    pub fn spec_invalid(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpecInvalid {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    pub fn no_package_json(spec: impl Into<String>) -> Self {
        Self::NoPackageJson { spec: spec.into() }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn tar(message: impl Into<String>) -> Self {
        Self::Tar {
            message: message.into(),
        }
    }

    pub fn integrity(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::IntegrityMismatch {
            expected: expected.into(),
            actual: actual.into(),
            spec: None,
            path: None,
        }
    }

    /// Attach the spec and destination to an integrity failure.
    ///
    /// Other variants are returned unchanged. Existing annotations are
    /// replaced so the outermost caller's context wins.
    #[must_use]
    pub fn annotate(self, spec: &str, dest: Option<&Path>) -> Self {
        match self {
            Self::IntegrityMismatch {
                expected,
                actual,
                path,
                ..
            } => Self::IntegrityMismatch {
                expected,
                actual,
                spec: Some(spec.to_string()),
                path: dest.map(Path::to_path_buf).or(path),
            },
            other => other,
        }
    }

    /// Whether a single retry after purging cached content may succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::IntegrityMismatch { .. } | Self::Truncated { .. } | Self::Cache { .. }
        )
    }

    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::IntegrityMismatch { .. })
    }

    /// Whether this is a missing-file I/O error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            source: Arc::new(e),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let (Some(status), Some(url)) = (e.status(), e.url()) {
            return Self::Network {
                status: status.as_u16(),
                uri: url.to_string(),
            };
        }
        let message = if e.is_timeout() {
            format!("Request timed out: {e}")
        } else if e.is_connect() {
            format!("Connection failed: {e}")
        } else {
            e.to_string()
        };
        Self::Http { message }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json {
            message: e.to_string(),
        }
    }
}
