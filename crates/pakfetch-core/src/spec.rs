//! Package spec parsing.
//!
//! Parses package specifiers like:
//! - `react`, `react@18.2.0`, `react@^18.0.0`, `react@next`
//! - `@types/node@^20`
//! - `alias@npm:react@^18`
//! - `github:user/repo#v1.0.0`, `git+https://host/repo.git#semver:^1.2.0`
//! - `file:./pkg.tgz`, `./local-dir`
//! - `https://example.com/pkg.tgz`

use crate::error::FetchError;
use crate::git::hosted::{split_fragment, HostedGit};
use crate::version::{parse_loose, Range};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Closed set of specifier kinds. Fixed for the lifetime of a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecType {
    Tag,
    Version,
    Range,
    Git,
    File,
    Directory,
    Remote,
    Alias,
}

impl SpecType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Version => "version",
            Self::Range => "range",
            Self::Git => "git",
            Self::File => "file",
            Self::Directory => "directory",
            Self::Remote => "remote",
            Self::Alias => "alias",
        }
    }

    #[must_use]
    pub fn is_registry(self) -> bool {
        matches!(self, Self::Tag | Self::Version | Self::Range)
    }
}

impl fmt::Display for SpecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecType {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tag" => Ok(Self::Tag),
            "version" => Ok(Self::Version),
            "range" => Ok(Self::Range),
            "git" => Ok(Self::Git),
            "file" => Ok(Self::File),
            "directory" => Ok(Self::Directory),
            "remote" => Ok(Self::Remote),
            "alias" => Ok(Self::Alias),
            other => Err(FetchError::SpecTypeUnsupported {
                spec: String::new(),
                spec_type: other.to_string(),
            }),
        }
    }
}

/// A parsed package specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    spec_type: SpecType,
    /// Package name, when the specifier names one.
    pub name: Option<String>,
    /// Scope including the `@`, if scoped.
    pub scope: Option<String>,
    /// What to fetch: version, range, tag, URL or absolute path.
    pub fetch_spec: String,
    /// What a package.json would record.
    pub save_spec: Option<String>,
    /// The full input string.
    pub raw: String,
    /// The part after `name@` (or the whole input when unnamed).
    pub raw_spec: String,
    pub hosted: Option<HostedGit>,
    pub git_committish: Option<String>,
    pub git_range: Option<String>,
    pub sub_spec: Option<Box<PackageSpec>>,
}

impl PackageSpec {
    /// Parse a specifier, resolving relative paths against `base`.
    ///
    /// # Errors
    /// Returns `SpecInvalid` if the input is malformed.
    pub fn parse(input: &str, base: &Path) -> Result<Self, FetchError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(FetchError::spec_invalid(input, "empty package spec"));
        }

        if let Some(spec) = Self::parse_unnamed(input, base) {
            return Ok(spec);
        }

        let (name, raw_spec) = split_name(input)?;
        validate_name(input, name)?;
        let scope = name
            .starts_with('@')
            .then(|| name.split('/').next().unwrap_or(name).to_string());

        let mut spec = Self::parse_target(input, name, raw_spec, base)?;
        spec.scope = scope;
        Ok(spec)
    }

    /// Build a registry spec from a name and a range/version/tag.
    ///
    /// # Errors
    /// Returns `SpecInvalid` if the name is malformed.
    pub fn from_name_and_spec(name: &str, raw_spec: &str, base: &Path) -> Result<Self, FetchError> {
        if raw_spec.is_empty() {
            Self::parse(name, base)
        } else {
            Self::parse(&format!("{name}@{raw_spec}"), base)
        }
    }

    /// The spec type. Never changes after parsing.
    #[must_use]
    pub fn spec_type(&self) -> SpecType {
        self.spec_type
    }

    /// Get the unscoped portion of the name (`@scope/name` → `name`).
    #[must_use]
    pub fn unscoped_name(&self) -> Option<&str> {
        let name = self.name.as_deref()?;
        Some(name.rsplit('/').next().unwrap_or(name))
    }

    /// URL-encode the name for registry requests (`/` → `%2F`).
    #[must_use]
    pub fn url_encoded_name(&self) -> Option<String> {
        self.name.as_deref().map(|n| n.replace('/', "%2F"))
    }

    /// Absolute path for file and directory specs.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        matches!(self.spec_type, SpecType::File | SpecType::Directory)
            .then(|| PathBuf::from(&self.fetch_spec))
    }

    fn parse_unnamed(input: &str, base: &Path) -> Option<Self> {
        let target = Self::unnamed_target(input, base)?;
        Some(target)
    }

    fn unnamed_target(raw_spec: &str, base: &Path) -> Option<Self> {
        if is_file_spec(raw_spec) {
            return Some(Self::local(None, raw_spec, raw_spec, base));
        }
        if is_git_spec(raw_spec) {
            return Some(Self::git(None, raw_spec, raw_spec));
        }
        if raw_spec.starts_with("http://") || raw_spec.starts_with("https://") {
            if let Some(hosted) = HostedGit::from_url(raw_spec) {
                return Some(Self::hosted_git(None, raw_spec, raw_spec, hosted));
            }
            return Some(Self::remote(None, raw_spec, raw_spec));
        }
        if !raw_spec.starts_with('@') && raw_spec.matches('/').count() == 1 {
            if let Some(hosted) = HostedGit::from_shorthand(raw_spec) {
                return Some(Self::hosted_git(None, raw_spec, raw_spec, hosted));
            }
        }
        None
    }

    fn parse_target(raw: &str, name: &str, raw_spec: &str, base: &Path) -> Result<Self, FetchError> {
        if let Some(aliased) = raw_spec.strip_prefix("npm:") {
            let sub = Self::parse(aliased, base)?;
            if !sub.spec_type.is_registry() {
                return Err(FetchError::spec_invalid(
                    raw,
                    "aliases only apply to registry specs",
                ));
            }
            return Ok(Self {
                spec_type: SpecType::Alias,
                name: Some(name.to_string()),
                scope: None,
                fetch_spec: sub.fetch_spec.clone(),
                save_spec: Some(raw_spec.to_string()),
                raw: raw.to_string(),
                raw_spec: raw_spec.to_string(),
                hosted: None,
                git_committish: None,
                git_range: None,
                sub_spec: Some(Box::new(sub)),
            });
        }

        if let Some(mut target) = Self::unnamed_target(raw_spec, base) {
            target.name = Some(name.to_string());
            target.raw = raw.to_string();
            return Ok(target);
        }

        let (spec_type, fetch_spec) = classify_registry(raw, raw_spec)?;
        Ok(Self {
            spec_type,
            name: Some(name.to_string()),
            scope: None,
            fetch_spec,
            save_spec: None,
            raw: raw.to_string(),
            raw_spec: raw_spec.to_string(),
            hosted: None,
            git_committish: None,
            git_range: None,
            sub_spec: None,
        })
    }

    fn local(name: Option<&str>, raw: &str, raw_spec: &str, base: &Path) -> Self {
        let path_part = raw_spec.strip_prefix("file:").unwrap_or(raw_spec);
        // file:///abs/path and file://host-less forms
        let path_part = path_part
            .strip_prefix("//")
            .filter(|p| p.starts_with('/'))
            .unwrap_or(path_part);

        let expanded = match path_part.strip_prefix("~/") {
            Some(rest) => dirs_next::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join(rest),
            None => PathBuf::from(path_part),
        };
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            base.join(expanded)
        };
        let absolute = normalize_path(&absolute);

        let spec_type = if is_tarball_path(path_part) {
            SpecType::File
        } else {
            SpecType::Directory
        };

        Self {
            spec_type,
            name: name.map(String::from),
            scope: None,
            fetch_spec: absolute.to_string_lossy().into_owned(),
            save_spec: Some(format!("file:{path_part}")),
            raw: raw.to_string(),
            raw_spec: raw_spec.to_string(),
            hosted: None,
            git_committish: None,
            git_range: None,
            sub_spec: None,
        }
    }

    fn git(name: Option<&str>, raw: &str, raw_spec: &str) -> Self {
        if let Some(hosted) = HostedGit::from_url(raw_spec)
            .or_else(|| HostedGit::from_shorthand(raw_spec))
        {
            return Self::hosted_git(name, raw, raw_spec, hosted);
        }
        let (body, fragment) = split_fragment(raw_spec);
        let url = body.strip_prefix("git+").unwrap_or(body);
        let (committish, range) = split_committish(fragment);
        Self {
            spec_type: SpecType::Git,
            name: name.map(String::from),
            scope: None,
            fetch_spec: url.to_string(),
            save_spec: Some(raw_spec.to_string()),
            raw: raw.to_string(),
            raw_spec: raw_spec.to_string(),
            hosted: None,
            git_committish: committish,
            git_range: range,
            sub_spec: None,
        }
    }

    fn hosted_git(name: Option<&str>, raw: &str, raw_spec: &str, mut hosted: HostedGit) -> Self {
        let (committish, range) = split_committish(hosted.committish.take());
        let mut save_spec = hosted.shortcut();
        if let Some(frag) = split_fragment(raw_spec).1 {
            save_spec.push('#');
            save_spec.push_str(&frag);
        }
        Self {
            spec_type: SpecType::Git,
            name: name.map(String::from),
            scope: None,
            fetch_spec: hosted.https_url(),
            save_spec: Some(save_spec),
            raw: raw.to_string(),
            raw_spec: raw_spec.to_string(),
            hosted: Some(hosted),
            git_committish: committish,
            git_range: range,
            sub_spec: None,
        }
    }

    fn remote(name: Option<&str>, raw: &str, raw_spec: &str) -> Self {
        Self {
            spec_type: SpecType::Remote,
            name: name.map(String::from),
            scope: None,
            fetch_spec: raw_spec.to_string(),
            save_spec: Some(raw_spec.to_string()),
            raw: raw.to_string(),
            raw_spec: raw_spec.to_string(),
            hosted: None,
            git_committish: None,
            git_range: None,
            sub_spec: None,
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split `name@spec`, honoring the leading `@` of scoped names.
fn split_name(input: &str) -> Result<(&str, &str), FetchError> {
    let search_from = usize::from(input.starts_with('@'));
    match input[search_from..].find('@') {
        Some(pos) => {
            let at = pos + search_from;
            Ok((&input[..at], &input[at + 1..]))
        }
        None => Ok((input, "")),
    }
}

fn validate_name(raw: &str, name: &str) -> Result<(), FetchError> {
    if name.is_empty() {
        return Err(FetchError::spec_invalid(raw, "empty package name"));
    }
    let bare = if let Some(scoped) = name.strip_prefix('@') {
        let Some((scope, rest)) = scoped.split_once('/') else {
            return Err(FetchError::spec_invalid(
                raw,
                format!("missing '/' in scoped name '{name}'"),
            ));
        };
        if scope.is_empty() || rest.is_empty() {
            return Err(FetchError::spec_invalid(
                raw,
                format!("empty scope or name in '{name}'"),
            ));
        }
        check_chars(raw, scope)?;
        rest
    } else {
        name
    };
    if bare.starts_with('.') || bare.starts_with('_') {
        return Err(FetchError::spec_invalid(
            raw,
            format!("name cannot start with '.' or '_': '{name}'"),
        ));
    }
    check_chars(raw, bare)
}

fn check_chars(raw: &str, part: &str) -> Result<(), FetchError> {
    match part
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '~')))
    {
        Some(c) => Err(FetchError::spec_invalid(
            raw,
            format!("invalid character '{c}' in package name"),
        )),
        None => Ok(()),
    }
}

fn classify_registry(raw: &str, raw_spec: &str) -> Result<(SpecType, String), FetchError> {
    let spec = raw_spec.trim();
    // No tag given: the fetcher substitutes the configured default tag.
    if spec.is_empty() {
        return Ok((SpecType::Tag, String::new()));
    }
    if let Some(v) = parse_loose(spec) {
        if !spec.contains(' ') {
            return Ok((SpecType::Version, v.to_string()));
        }
    }
    if Range::parse(spec).is_ok() {
        return Ok((SpecType::Range, spec.to_string()));
    }
    let valid_tag = !spec.starts_with('v')
        || spec.len() == 1
        || !spec[1..].starts_with(|c: char| c.is_ascii_digit());
    if valid_tag
        && spec
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Ok((SpecType::Tag, spec.to_string()));
    }
    Err(FetchError::spec_invalid(
        raw,
        format!("'{spec}' is not a valid version, range or tag"),
    ))
}

fn split_committish(fragment: Option<String>) -> (Option<String>, Option<String>) {
    match fragment {
        Some(frag) => match frag.strip_prefix("semver:") {
            Some(range) => (None, Some(range.to_string())),
            None => (Some(frag), None),
        },
        None => (None, None),
    }
}

fn is_file_spec(s: &str) -> bool {
    s.starts_with("file:")
        || s.starts_with("./")
        || s.starts_with("../")
        || s.starts_with('/')
        || s.starts_with("~/")
        || s == "."
        || s == ".."
        || (s.len() > 2 && s.as_bytes()[1] == b':' && s.as_bytes()[0].is_ascii_alphabetic())
}

fn is_git_spec(s: &str) -> bool {
    s.starts_with("git+")
        || s.starts_with("git://")
        || s.starts_with("github:")
        || s.starts_with("gitlab:")
        || s.starts_with("bitbucket:")
        || (s.starts_with("git@") && s.contains(':'))
}

fn is_tarball_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    [".tgz", ".tar.gz", ".tar"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> PackageSpec {
        PackageSpec::parse(s, Path::new("/work")).unwrap()
    }

    #[test]
    fn test_parse_simple() {
        let spec = parse("react");
        assert_eq!(spec.spec_type(), SpecType::Tag);
        assert_eq!(spec.name.as_deref(), Some("react"));
        assert_eq!(spec.fetch_spec, "");
        assert_eq!(spec.raw_spec, "");
        assert!(spec.scope.is_none());
    }

    #[test]
    fn test_parse_version_range_tag() {
        assert_eq!(parse("react@18.2.0").spec_type(), SpecType::Version);
        assert_eq!(parse("react@v18.2.0").fetch_spec, "18.2.0");
        assert_eq!(parse("react@^18.0.0").spec_type(), SpecType::Range);
        assert_eq!(parse("react@>=1.0.0 <2").spec_type(), SpecType::Range);
        assert_eq!(parse("react@1.x").spec_type(), SpecType::Range);
        let tag = parse("react@next");
        assert_eq!(tag.spec_type(), SpecType::Tag);
        assert_eq!(tag.fetch_spec, "next");
    }

    #[test]
    fn test_parse_scoped() {
        let spec = parse("@types/node@^20");
        assert_eq!(spec.name.as_deref(), Some("@types/node"));
        assert_eq!(spec.scope.as_deref(), Some("@types"));
        assert_eq!(spec.unscoped_name(), Some("node"));
        assert_eq!(spec.url_encoded_name().as_deref(), Some("@types%2Fnode"));
        assert_eq!(spec.spec_type(), SpecType::Range);
    }

    #[test]
    fn test_parse_alias() {
        let spec = parse("myreact@npm:react@^18");
        assert_eq!(spec.spec_type(), SpecType::Alias);
        assert_eq!(spec.name.as_deref(), Some("myreact"));
        let sub = spec.sub_spec.as_ref().unwrap();
        assert_eq!(sub.name.as_deref(), Some("react"));
        assert_eq!(sub.spec_type(), SpecType::Range);
    }

    #[test]
    fn test_parse_file_and_directory() {
        let file = parse("file:./pkg.tgz");
        assert_eq!(file.spec_type(), SpecType::File);
        assert_eq!(file.fetch_spec, "/work/pkg.tgz");

        let dir = parse("../sibling");
        assert_eq!(dir.spec_type(), SpecType::Directory);
        assert_eq!(dir.fetch_spec, "/sibling");

        let named = parse("local@file:vendor/thing");
        assert_eq!(named.spec_type(), SpecType::Directory);
        assert_eq!(named.name.as_deref(), Some("local"));
        assert_eq!(named.fetch_spec, "/work/vendor/thing");
    }

    #[test]
    fn test_parse_git() {
        let spec = parse("git+https://git.example.com/team/repo.git#v1.2.3");
        assert_eq!(spec.spec_type(), SpecType::Git);
        assert_eq!(spec.fetch_spec, "https://git.example.com/team/repo.git");
        assert_eq!(spec.git_committish.as_deref(), Some("v1.2.3"));
        assert!(spec.hosted.is_none());

        let ranged = parse("git+ssh://git@git.example.com/repo.git#semver:^1.2.0");
        assert_eq!(ranged.git_range.as_deref(), Some("^1.2.0"));
        assert!(ranged.git_committish.is_none());
    }

    #[test]
    fn test_parse_hosted_git() {
        let spec = parse("github:npm/cli#main");
        assert_eq!(spec.spec_type(), SpecType::Git);
        assert_eq!(spec.git_committish.as_deref(), Some("main"));
        assert_eq!(spec.save_spec.as_deref(), Some("github:npm/cli#main"));
        assert!(spec.hosted.as_ref().unwrap().committish.is_none());

        let bare = parse("npm/cli");
        assert_eq!(bare.spec_type(), SpecType::Git);

        let named = parse("cli@github:npm/cli");
        assert_eq!(named.name.as_deref(), Some("cli"));
        assert_eq!(named.spec_type(), SpecType::Git);
    }

    #[test]
    fn test_parse_remote() {
        let spec = parse("https://example.com/pkg-1.0.0.tgz");
        assert_eq!(spec.spec_type(), SpecType::Remote);
        assert_eq!(spec.fetch_spec, "https://example.com/pkg-1.0.0.tgz");

        let hosted = parse("https://github.com/npm/cli");
        assert_eq!(hosted.spec_type(), SpecType::Git);
    }

    #[test]
    fn test_invalid_specs() {
        let base = Path::new("/");
        assert!(PackageSpec::parse("", base).is_err());
        assert!(PackageSpec::parse("@scope", base).is_err());
        assert!(PackageSpec::parse("@/name", base).is_err());
        assert!(PackageSpec::parse("bad name", base).is_err());
        assert!(PackageSpec::parse("react@not a range!!", base).is_err());
        assert!(PackageSpec::parse("x@npm:./dir", base).is_err());
    }

    #[test]
    fn test_spec_type_from_str() {
        assert_eq!("git".parse::<SpecType>().unwrap(), SpecType::Git);
        let err = "workspace".parse::<SpecType>().unwrap_err();
        assert!(matches!(err, FetchError::SpecTypeUnsupported { .. }));
    }
}
