//! Remote ref sets from `git ls-remote` and committish resolution.

use crate::error::FetchError;
use crate::version::{parse_loose, Range};
use semver::Version;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Head,
    Branch,
    Tag,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRef {
    pub sha: String,
    pub kind: RefKind,
    /// Full ref name as listed by the remote (`refs/heads/main`).
    pub full: String,
}

/// Everything a remote advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitRefSet {
    /// Short name (`main`, `v1.2.3`, `HEAD`) to ref. Tags point at the
    /// peeled commit when the remote lists one.
    pub refs: BTreeMap<String, GitRef>,
    /// Commit sha to the short names pointing at it.
    pub shas: BTreeMap<String, Vec<String>>,
    /// Normalized semver version to the tag carrying it.
    pub versions: BTreeMap<String, String>,
    /// `latest` (highest tagged version) and `HEAD` (version at HEAD, if
    /// tagged).
    pub dist_tags: BTreeMap<String, String>,
}

/// Outcome of resolving a committish or range against a ref set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    pub sha: String,
    /// Name usable with `git clone --branch`, when resolution went through
    /// a named ref.
    pub ref_name: Option<String>,
    pub kind: RefKind,
}

impl GitRefSet {
    /// Parse `git ls-remote` output.
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let mut set = Self::default();

        for line in output.lines() {
            let mut parts = line.split_whitespace();
            let (Some(sha), Some(full)) = (parts.next(), parts.next()) else {
                continue;
            };
            let sha = sha.to_ascii_lowercase();

            if let Some(peeled) = full.strip_suffix("^{}") {
                let (name, _) = short_name(peeled);
                if let Some(existing) = set.refs.get_mut(&name) {
                    existing.sha = sha;
                }
                continue;
            }

            let (name, kind) = short_name(full);
            set.refs.insert(
                name,
                GitRef {
                    sha,
                    kind,
                    full: full.to_string(),
                },
            );
        }

        for (name, git_ref) in &set.refs {
            set.shas
                .entry(git_ref.sha.clone())
                .or_default()
                .push(name.clone());
            if git_ref.kind == RefKind::Tag {
                if let Some(version) = parse_loose(name) {
                    set.versions.insert(version.to_string(), name.clone());
                }
            }
        }

        if let Some(latest) = set.sorted_versions().into_iter().next_back() {
            set.dist_tags.insert("latest".to_string(), latest.to_string());
        }
        if let Some(head) = set.refs.get("HEAD") {
            let tagged = set
                .versions
                .iter()
                .find(|(_, tag)| set.refs.get(*tag).is_some_and(|r| r.sha == head.sha))
                .map(|(version, _)| version.clone());
            if let Some(version) = tagged {
                set.dist_tags.insert("HEAD".to_string(), version);
            }
        }

        set
    }

    /// Resolve a semver range or committish.
    ///
    /// A range picks the highest tagged version it matches. A committish
    /// (defaulting to `HEAD`) matches a ref name first, then a sha prefix.
    /// `Ok(None)` means the committish is not advertised and should be used
    /// verbatim.
    ///
    /// # Errors
    /// Returns `NoVersionMatch` if a range matches no tag, or `SpecInvalid`
    /// for an unparseable range.
    pub fn resolve(
        &self,
        repo: &str,
        committish: Option<&str>,
        range: Option<&str>,
    ) -> Result<Option<ResolvedRef>, FetchError> {
        if let Some(raw) = range {
            let range = Range::parse(raw)?;
            let best = self
                .sorted_versions()
                .into_iter()
                .rev()
                .find(|v| range.matches(v));
            let Some(tag) = best.and_then(|v| self.versions.get(&v.to_string())) else {
                return Err(FetchError::NoVersionMatch {
                    name: repo.to_string(),
                    range: raw.to_string(),
                    available: self.versions.keys().cloned().collect(),
                });
            };
            return Ok(self.named(tag));
        }

        let committish = committish.unwrap_or("HEAD");
        let name = committish
            .strip_prefix("refs/heads/")
            .or_else(|| committish.strip_prefix("refs/tags/"))
            .unwrap_or(committish);
        if let Some(found) = self.named(name) {
            return Ok(Some(found));
        }

        let prefix = committish.to_ascii_lowercase();
        if prefix.len() >= 4 && prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            if let Some((sha, names)) = self.shas.iter().find(|(sha, _)| sha.starts_with(&prefix)) {
                let kind = names
                    .first()
                    .and_then(|n| self.refs.get(n))
                    .map_or(RefKind::Other, |r| r.kind);
                return Ok(Some(ResolvedRef {
                    sha: sha.clone(),
                    ref_name: None,
                    kind,
                }));
            }
        }

        Ok(None)
    }

    fn named(&self, name: &str) -> Option<ResolvedRef> {
        self.refs.get(name).map(|r| ResolvedRef {
            sha: r.sha.clone(),
            ref_name: match r.kind {
                RefKind::Head | RefKind::Other => None,
                RefKind::Branch | RefKind::Tag => Some(name.to_string()),
            },
            kind: r.kind,
        })
    }

    fn sorted_versions(&self) -> Vec<Version> {
        let mut versions: Vec<Version> = self
            .versions
            .keys()
            .filter_map(|v| Version::parse(v).ok())
            .collect();
        versions.sort();
        versions
    }
}

fn short_name(full: &str) -> (String, RefKind) {
    if full == "HEAD" {
        return (full.to_string(), RefKind::Head);
    }
    if let Some(name) = full.strip_prefix("refs/heads/") {
        return (name.to_string(), RefKind::Branch);
    }
    if let Some(name) = full.strip_prefix("refs/tags/") {
        return (name.to_string(), RefKind::Tag);
    }
    (full.to_string(), RefKind::Other)
}

/// Whether `committish` is a full 40-character commit sha.
#[must_use]
pub fn is_full_sha(committish: &str) -> bool {
    committish.len() == 40 && committish.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whether `committish` could be a commit sha, full or abbreviated.
#[must_use]
pub fn is_sha_like(committish: &str) -> bool {
    (4..=40).contains(&committish.len()) && committish.bytes().all(|b| b.is_ascii_hexdigit())
}
