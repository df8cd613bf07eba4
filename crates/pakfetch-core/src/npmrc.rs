//! `.npmrc` loading for registry routing and authentication.
//!
//! Recognized keys:
//! - `registry=URL` (default registry)
//! - `@scope:registry=URL` (scope routing)
//! - `//host/path/:_authToken=TOKEN` (bearer tokens, `${ENV}` expanded)

use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

/// Settings collected from one or more `.npmrc` files.
#[derive(Debug, Clone, Default)]
pub struct NpmrcConfig {
    /// Top-level `registry=` value, if any.
    pub registry: Option<Url>,
    /// Scope (`@scope`) to registry URL.
    pub scoped_registries: BTreeMap<String, Url>,
    /// Host (optionally with path, no trailing slash) to token.
    pub auth_tokens: BTreeMap<String, String>,
}

impl NpmrcConfig {
    /// Fold `other` into `self`; entries already present are kept.
    fn absorb(&mut self, other: NpmrcConfig) {
        if self.registry.is_none() {
            self.registry = other.registry;
        }
        for (scope, url) in other.scoped_registries {
            self.scoped_registries.entry(scope).or_insert(url);
        }
        for (host, token) in other.auth_tokens {
            self.auth_tokens.entry(host).or_insert(token);
        }
    }
}

/// Parse the content of a single `.npmrc` file.
#[must_use]
pub fn parse_npmrc(content: &str) -> NpmrcConfig {
    let mut config = NpmrcConfig::default();

    let pairs = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()));

    for (key, value) in pairs {
        if key == "registry" {
            config.registry = parse_registry_url(value);
        } else if let Some(scope) = key.strip_suffix(":registry") {
            if scope.starts_with('@') {
                if let Some(url) = parse_registry_url(value) {
                    config.scoped_registries.insert(scope.to_string(), url);
                }
            }
        } else if let Some(target) = key
            .strip_prefix("//")
            .and_then(|k| k.strip_suffix(":_authToken"))
        {
            let token = expand_env_vars(value);
            if !token.is_empty() {
                config
                    .auth_tokens
                    .insert(target.trim_end_matches('/').to_string(), token);
            }
        }
    }

    config
}

/// Load and merge `.npmrc` files from `project_dir` upward, then `$HOME`.
///
/// The nearest file wins for any key.
#[must_use]
pub fn load_npmrc_files(project_dir: &Path) -> NpmrcConfig {
    let mut merged = NpmrcConfig::default();

    let home = dirs_next::home_dir().map(|h| h.join(".npmrc"));
    let candidates = project_dir
        .ancestors()
        .map(|dir| dir.join(".npmrc"))
        .chain(home);

    for path in candidates {
        if let Ok(content) = std::fs::read_to_string(&path) {
            merged.absorb(parse_npmrc(&content));
        }
    }

    merged
}

fn parse_registry_url(value: &str) -> Option<Url> {
    let value = if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    };
    Url::parse(&value).ok()
}

/// Expand `${VAR}` references; unknown variables expand to nothing.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find('}') {
            if let Ok(val) = std::env::var(&after[..end]) {
                out.push_str(&val);
            }
            rest = &after[end + 1..];
        } else {
            out.push_str(&rest[start..]);
            rest = "";
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_registry_lines() {
        let config = parse_npmrc(
            "\
# comment
; another comment
registry=https://mirror.example.com
@corp:registry=https://npm.corp.example/
//npm.corp.example/:_authToken=abc
",
        );
        assert_eq!(
            config.registry.unwrap().as_str(),
            "https://mirror.example.com/"
        );
        assert_eq!(
            config.scoped_registries["@corp"].as_str(),
            "https://npm.corp.example/"
        );
        assert_eq!(config.auth_tokens["npm.corp.example"], "abc");
    }

    #[test]
    fn test_token_with_path() {
        let config = parse_npmrc("//pkgs.example.com/npm/private/:_authToken=tok\n");
        assert_eq!(config.auth_tokens["pkgs.example.com/npm/private"], "tok");
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("PAKFETCH_TEST_NPMRC_TOKEN", "expanded");
        assert_eq!(
            expand_env_vars("pre-${PAKFETCH_TEST_NPMRC_TOKEN}-post"),
            "pre-expanded-post"
        );
        std::env::remove_var("PAKFETCH_TEST_NPMRC_TOKEN");
        assert_eq!(expand_env_vars("${PAKFETCH_NO_SUCH_VAR_1234}"), "");
        assert_eq!(expand_env_vars("${unterminated"), "${unterminated");
    }

    #[test]
    fn test_nearest_file_wins() {
        let root = tempdir().unwrap();
        let nested = root.path().join("app");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            root.path().join(".npmrc"),
            "@corp:registry=https://outer.example/\n@other:registry=https://other.example/\n",
        )
        .unwrap();
        std::fs::write(nested.join(".npmrc"), "@corp:registry=https://inner.example/\n").unwrap();

        let config = load_npmrc_files(&nested);
        assert_eq!(
            config.scoped_registries["@corp"].as_str(),
            "https://inner.example/"
        );
        assert_eq!(
            config.scoped_registries["@other"].as_str(),
            "https://other.example/"
        );
    }
}
