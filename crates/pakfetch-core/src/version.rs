//! npm-flavored semver ranges and registry version selection.

use crate::error::FetchError;
use crate::manifest::Packument;
use semver::{Version, VersionReq};
use std::fmt;

/// A parsed npm range: a disjunction of semver requirements.
///
/// Handles the npm syntax that `semver::VersionReq` does not accept directly:
/// `||` alternatives, hyphen ranges (`1.0.0 - 2.0.0`), x-ranges (`1.x`, `*`),
/// and space-separated comparators (`>= 2.1.2 < 3.0.0`).
#[derive(Clone)]
pub struct Range {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl Range {
    /// Parse an npm range.
    ///
    /// # Errors
    /// Returns `SpecInvalid` if no alternative parses.
    pub fn parse(range: &str) -> Result<Self, FetchError> {
        let trimmed = range.trim();
        let mut alternatives = Vec::new();
        for alt in trimmed.split("||").map(str::trim) {
            alternatives.push(parse_single(alt).ok_or_else(|| {
                FetchError::spec_invalid(range, format!("invalid version range '{alt}'"))
            })?);
        }
        Ok(Self {
            raw: trimmed.to_string(),
            alternatives,
        })
    }

    /// Whether any alternative accepts `version`.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Range").field(&self.raw).finish()
    }
}

/// Parse a version, tolerating a leading `v` or `=`.
#[must_use]
pub fn parse_loose(version: &str) -> Option<Version> {
    let v = version.trim();
    let v = v.strip_prefix('=').unwrap_or(v);
    let v = v.strip_prefix('v').unwrap_or(v);
    Version::parse(v).ok()
}

fn parse_single(range: &str) -> Option<VersionReq> {
    if range.is_empty() || range == "*" || range.eq_ignore_ascii_case("x") {
        return Some(VersionReq::STAR);
    }

    if let Some((lo, hi)) = range.split_once(" - ") {
        let lo = lo.trim();
        let hi = hi.trim();
        if !lo.is_empty() && !hi.is_empty() {
            return VersionReq::parse(&format!(">={lo}, <={hi}")).ok();
        }
    }

    let joined = range
        .split_whitespace()
        .fold(Vec::<String>::new(), |mut parts, token| {
            // ">= 2.1.2" splits the operator from its version; glue them back.
            match parts.last_mut() {
                Some(last) if !last.chars().any(|c| c.is_ascii_digit() || c == '*') => {
                    last.push_str(token);
                }
                _ => parts.push(token.to_string()),
            }
            parts
        })
        .into_iter()
        .map(|part| expand_x_range(&part))
        .collect::<Vec<_>>()
        .join(", ");

    VersionReq::parse(&joined).ok()
}

/// Normalize one comparator.
///
/// `1.x` / `^1.2.*` become explicit bounds, and a bare full version means
/// exactly that version (npm semantics) rather than semver's implicit caret.
fn expand_x_range(part: &str) -> String {
    let is_wild = |s: &str| matches!(s, "x" | "X" | "*");
    let op_len = part
        .find(|c: char| c.is_ascii_digit() || matches!(c, 'x' | 'X' | '*'))
        .unwrap_or(0);
    let (op, version) = part.split_at(op_len);
    let loose_op = matches!(op, "" | "^" | "~" | "=");
    let pieces: Vec<&str> = version.split('.').collect();

    match pieces.as_slice() {
        [major, minor] | [major, minor, _] if loose_op && is_wild(minor) => {
            if let Ok(m) = major.parse::<u64>() {
                return format!(">={m}.0.0, <{}.0.0", m + 1);
            }
        }
        [major, minor, patch] if loose_op && is_wild(patch) => {
            if let (Ok(m), Ok(n)) = (major.parse::<u64>(), minor.parse::<u64>()) {
                return format!(">={m}.{n}.0, <{m}.{}.0", n + 1);
            }
        }
        _ => {}
    }
    if op.is_empty() && Version::parse(version).is_ok() {
        return format!("={version}");
    }
    if op.is_empty() && pieces.len() < 3 && pieces.iter().all(|p| p.parse::<u64>().is_ok()) {
        // "1.2" is 1.2.x in npm, not ^1.2.
        return format!("~{version}");
    }
    if version.chars().any(|c| c == 'x' || c == 'X') {
        return format!("{op}{}", version.replace(['x', 'X'], "*"));
    }
    part.to_string()
}

/// What a registry spec asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wanted<'a> {
    Tag(&'a str),
    Version(&'a str),
    Range(&'a str),
}

/// Select a version from a packument.
///
/// # Rules
/// - A tag resolves through `dist-tags`.
/// - An exact version is returned only if present.
/// - A range prefers the `default_tag` version when it satisfies the range
///   and is not deprecated; otherwise the highest satisfying version,
///   skipping deprecated versions unless they are the only match.
///
/// # Errors
/// Returns `NoVersionMatch` carrying the request and the available versions.
pub fn pick_version(
    packument: &Packument,
    wanted: Wanted<'_>,
    default_tag: &str,
) -> Result<String, FetchError> {
    let no_match = |range: &str| FetchError::NoVersionMatch {
        name: packument.name.clone(),
        range: range.to_string(),
        available: packument.versions.keys().cloned().collect(),
    };

    match wanted {
        Wanted::Tag(tag) => packument
            .dist_tags
            .get(tag)
            .filter(|v| packument.versions.contains_key(*v))
            .cloned()
            .ok_or_else(|| no_match(tag)),
        Wanted::Version(version) => {
            if packument.versions.contains_key(version) {
                return Ok(version.to_string());
            }
            // "v1.2.3" and "1.2.3" name the same release.
            let wanted = parse_loose(version).ok_or_else(|| no_match(version))?;
            packument
                .versions
                .keys()
                .find(|v| parse_loose(v).as_ref() == Some(&wanted))
                .cloned()
                .ok_or_else(|| no_match(version))
        }
        Wanted::Range(raw) => {
            let range = Range::parse(raw)?;

            if let Some(tagged) = packument.dist_tags.get(default_tag) {
                if let Some(v) = parse_loose(tagged) {
                    if packument.versions.contains_key(tagged)
                        && range.matches(&v)
                        && !packument.is_deprecated(tagged)
                    {
                        return Ok(tagged.clone());
                    }
                }
            }

            let mut candidates: Vec<(Version, &String)> = packument
                .versions
                .keys()
                .filter_map(|k| parse_loose(k).map(|v| (v, k)))
                .filter(|(v, _)| range.matches(v))
                .collect();
            candidates.sort_by(|a, b| b.0.cmp(&a.0));

            candidates
                .iter()
                .find(|(_, k)| !packument.is_deprecated(k))
                .or_else(|| candidates.first())
                .map(|(_, k)| (*k).clone())
                .ok_or_else(|| no_match(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packument(versions: &[&str], latest: &str) -> Packument {
        let versions_obj: serde_json::Map<String, serde_json::Value> = versions
            .iter()
            .map(|v| {
                (
                    (*v).to_string(),
                    serde_json::json!({
                        "name": "test-pkg",
                        "version": v,
                        "dist": { "tarball": format!("https://example.com/{v}.tgz") }
                    }),
                )
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "name": "test-pkg",
            "dist-tags": { "latest": latest },
            "versions": versions_obj
        }))
        .unwrap()
    }

    fn pick(p: &Packument, range: &str) -> Result<String, FetchError> {
        pick_version(p, Wanted::Range(range), "latest")
    }

    #[test]
    fn test_lodash_caret_picks_highest() {
        let p = packument(&["4.17.20", "4.17.21"], "4.17.20");
        assert_eq!(pick(&p, "^4.17.0").unwrap(), "4.17.21");
    }

    #[test]
    fn test_exact_version_is_never_substituted() {
        let p = packument(&["1.0.0", "1.0.1", "2.0.0"], "2.0.0");
        let v = pick_version(&p, Wanted::Version("1.0.0"), "latest").unwrap();
        assert_eq!(v, "1.0.0");
    }

    #[test]
    fn test_exact_version_missing() {
        let p = packument(&["1.0.0"], "1.0.0");
        let err = pick_version(&p, Wanted::Version("1.0.1"), "latest").unwrap_err();
        match err {
            FetchError::NoVersionMatch {
                range, available, ..
            } => {
                assert_eq!(range, "1.0.1");
                assert_eq!(available, vec!["1.0.0".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tag() {
        let mut p = packument(&["1.0.0", "2.0.0-rc.1"], "1.0.0");
        p.dist_tags.insert("next".into(), "2.0.0-rc.1".into());
        assert_eq!(
            pick_version(&p, Wanted::Tag("next"), "latest").unwrap(),
            "2.0.0-rc.1"
        );
        assert!(pick_version(&p, Wanted::Tag("beta"), "latest").is_err());
    }

    #[test]
    fn test_range_prefers_default_tag() {
        let p = packument(&["1.0.0", "1.5.0"], "1.0.0");
        assert_eq!(pick(&p, "^1.0.0").unwrap(), "1.0.0");
        assert_eq!(pick(&p, "*").unwrap(), "1.0.0");
    }

    #[test]
    fn test_range_skips_deprecated() {
        let mut p = packument(&["1.0.0", "1.1.0"], "0.0.0");
        p.versions.get_mut("1.1.0").unwrap()["deprecated"] = "broken".into();
        assert_eq!(pick(&p, "^1.0.0").unwrap(), "1.0.0");
    }

    #[test]
    fn test_range_falls_back_to_deprecated() {
        let mut p = packument(&["1.1.0"], "0.0.0");
        p.versions.get_mut("1.1.0").unwrap()["deprecated"] = "broken".into();
        assert_eq!(pick(&p, "^1.0.0").unwrap(), "1.1.0");
    }

    #[test]
    fn test_tilde_and_prerelease() {
        let p = packument(&["1.0.0", "1.0.5", "1.1.0", "2.0.0-alpha.1"], "1.1.0");
        assert_eq!(pick(&p, "~1.0.0").unwrap(), "1.0.5");
        assert!(pick(&p, "^2.0.0").is_err());
    }

    #[test]
    fn test_or_range() {
        let p = packument(&["1.5.0", "2.5.0", "3.0.0"], "3.0.0");
        assert_eq!(pick(&p, "^1.0.0 || ^2.0.0").unwrap(), "2.5.0");
        assert_eq!(pick(&p, "^1.0.0||^2.0.0").unwrap(), "2.5.0");
    }

    #[test]
    fn test_x_and_hyphen_ranges() {
        let p = packument(&["1.0.0", "1.5.0", "2.0.0", "3.0.0"], "3.0.0");
        assert_eq!(pick(&p, "1.x").unwrap(), "1.5.0");
        assert_eq!(pick(&p, "1.0.x").unwrap(), "1.0.0");
        assert_eq!(pick(&p, "1.0.0 - 2.0.0").unwrap(), "2.0.0");
    }

    #[test]
    fn test_space_separated_comparators() {
        let p = packument(&["2.0.0", "2.1.2", "2.5.0", "3.0.0"], "3.0.0");
        assert_eq!(pick(&p, ">= 2.1.2 < 3.0.0").unwrap(), "2.5.0");
        assert_eq!(pick(&p, ">=2.1.2 <3.0.0").unwrap(), "2.5.0");
    }

    #[test]
    fn test_invalid_range() {
        assert!(Range::parse("not-a-range!!!").is_err());
        assert!(Range::parse("latest").is_err());
        assert!(Range::parse("next").is_err());
    }

    #[test]
    fn test_parse_loose() {
        assert_eq!(parse_loose("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_loose("=1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_loose("release-1"), None);
    }
}
