//! Subresource-integrity strings (`sha512-<base64>`).
//!
//! An [`Integrity`] can carry several hashes. Matching uses the strongest
//! algorithm both sides share.

use crate::error::FetchError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Supported digest algorithms, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `algorithm-digest` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: Algorithm,
    /// Base64 digest.
    pub digest: String,
}

impl Hash {
    /// Lowercase hex form of the digest, used for content paths.
    #[must_use]
    pub fn hex_digest(&self) -> Option<String> {
        STANDARD.decode(&self.digest).ok().map(hex::encode)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, self.digest)
    }
}

/// A parsed SRI string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Integrity {
    hashes: Vec<Hash>,
}

impl Integrity {
    /// Parse an SRI string. Unknown algorithms and `?options` are ignored.
    ///
    /// # Errors
    /// Returns `SpecInvalid` if no supported hash is present.
    pub fn parse(sri: &str) -> Result<Self, FetchError> {
        let mut hashes: Vec<Hash> = sri
            .split_whitespace()
            .filter_map(|token| {
                let (algo, rest) = token.split_once('-')?;
                let digest = rest.split('?').next().unwrap_or(rest);
                let algorithm = Algorithm::parse(algo)?;
                (!digest.is_empty()).then(|| Hash {
                    algorithm,
                    digest: digest.to_string(),
                })
            })
            .collect();
        if hashes.is_empty() {
            return Err(FetchError::spec_invalid(sri, "no supported integrity hash"));
        }
        hashes.sort_by(|a, b| b.algorithm.cmp(&a.algorithm));
        hashes.dedup();
        Ok(Self { hashes })
    }

    /// Build from a legacy hex `shasum`.
    ///
    /// # Errors
    /// Returns `SpecInvalid` if `shasum` is not 40 hex characters.
    pub fn from_legacy_sha1(shasum: &str) -> Result<Self, FetchError> {
        let raw = hex::decode(shasum.trim())
            .ok()
            .filter(|b| b.len() == 20)
            .ok_or_else(|| FetchError::spec_invalid(shasum, "invalid sha1 shasum"))?;
        Ok(Self {
            hashes: vec![Hash {
                algorithm: Algorithm::Sha1,
                digest: STANDARD.encode(raw),
            }],
        })
    }

    /// `sha512` integrity of `data`.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = IntegrityHasher::new(&[Algorithm::Sha512]);
        hasher.update(data);
        hasher.finish()
    }

    /// Hashes, strongest first.
    #[must_use]
    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    #[must_use]
    pub fn strongest(&self) -> &Hash {
        &self.hashes[0]
    }

    /// Just the strongest hash, as recorded in manifests.
    #[must_use]
    pub fn strongest_only(&self) -> Self {
        Self {
            hashes: vec![self.strongest().clone()],
        }
    }

    #[must_use]
    pub fn get(&self, algorithm: Algorithm) -> Option<&Hash> {
        self.hashes.iter().find(|h| h.algorithm == algorithm)
    }

    #[must_use]
    pub fn algorithms(&self) -> Vec<Algorithm> {
        self.hashes.iter().map(|h| h.algorithm).collect()
    }

    /// Whether `actual` agrees on the strongest algorithm both carry.
    ///
    /// Two integrities with no algorithm in common never match.
    #[must_use]
    pub fn matches(&self, actual: &Integrity) -> bool {
        self.hashes
            .iter()
            .find_map(|h| actual.get(h.algorithm).map(|other| other.digest == h.digest))
            .unwrap_or(false)
    }

    /// Fail with `IntegrityMismatch` unless `actual` matches.
    ///
    /// # Errors
    /// Returns `IntegrityMismatch` carrying both values.
    pub fn check(&self, actual: &Integrity) -> Result<(), FetchError> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(FetchError::integrity(self.to_string(), actual.to_string()))
        }
    }

    /// Union of both hash sets.
    #[must_use]
    pub fn merge(mut self, other: &Integrity) -> Self {
        for h in &other.hashes {
            if self.get(h.algorithm).is_none() {
                self.hashes.push(h.clone());
            }
        }
        self.hashes.sort_by(|a, b| b.algorithm.cmp(&a.algorithm));
        self
    }

    /// Legacy hex sha1, when present.
    #[must_use]
    pub fn sha1_hex(&self) -> Option<String> {
        self.get(Algorithm::Sha1).and_then(Hash::hex_digest)
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, h) in self.hashes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{h}")?;
        }
        Ok(())
    }
}

impl FromStr for Integrity {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

enum State {
    Sha1(sha1::Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// Incremental hasher over one or more algorithms.
pub struct IntegrityHasher {
    states: Vec<State>,
    size: u64,
}

impl IntegrityHasher {
    #[must_use]
    pub fn new(algorithms: &[Algorithm]) -> Self {
        let mut algorithms = algorithms.to_vec();
        if algorithms.is_empty() {
            algorithms.push(Algorithm::Sha512);
        }
        algorithms.sort();
        algorithms.dedup();
        let states = algorithms
            .into_iter()
            .map(|a| match a {
                Algorithm::Sha1 => State::Sha1(sha1::Sha1::new()),
                Algorithm::Sha256 => State::Sha256(Sha256::new()),
                Algorithm::Sha384 => State::Sha384(Sha384::new()),
                Algorithm::Sha512 => State::Sha512(Sha512::new()),
            })
            .collect();
        Self { states, size: 0 }
    }

    /// Hasher covering `expected`'s algorithms plus `sha512`.
    #[must_use]
    pub fn for_expected(expected: Option<&Integrity>) -> Self {
        let mut algorithms = vec![Algorithm::Sha512];
        if let Some(expected) = expected {
            algorithms.extend(expected.algorithms());
        }
        Self::new(&algorithms)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        for state in &mut self.states {
            match state {
                State::Sha1(h) => h.update(data),
                State::Sha256(h) => h.update(data),
                State::Sha384(h) => h.update(data),
                State::Sha512(h) => h.update(data),
            }
        }
    }

    /// Bytes hashed so far.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn finish(self) -> Integrity {
        let mut hashes: Vec<Hash> = self
            .states
            .into_iter()
            .map(|state| {
                let (algorithm, raw) = match state {
                    State::Sha1(h) => (Algorithm::Sha1, h.finalize().to_vec()),
                    State::Sha256(h) => (Algorithm::Sha256, h.finalize().to_vec()),
                    State::Sha384(h) => (Algorithm::Sha384, h.finalize().to_vec()),
                    State::Sha512(h) => (Algorithm::Sha512, h.finalize().to_vec()),
                };
                Hash {
                    algorithm,
                    digest: STANDARD.encode(raw),
                }
            })
            .collect();
        hashes.sort_by(|a, b| b.algorithm.cmp(&a.algorithm));
        Integrity { hashes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_known_value() {
        let sri = Integrity::compute(b"hello");
        assert_eq!(
            sri.to_string(),
            "sha512-m3HSJL1i83hdltRq0+o9czGb+8KJDKra4t/3JRlnPKcjI8PZm6XBHXx6zG4UuMXaDEZjR1wuXDre9G9zvN7AQw=="
        );
    }

    #[test]
    fn test_parse_orders_strongest_first() {
        let sri = Integrity::parse("sha1-abc= sha512-def==?opt md5-zzz").unwrap();
        assert_eq!(sri.strongest().algorithm, Algorithm::Sha512);
        assert_eq!(sri.hashes().len(), 2);
        assert!(Integrity::parse("md5-zzz").is_err());
        assert!(Integrity::parse("").is_err());
    }

    #[test]
    fn test_legacy_sha1_matches_computed() {
        // sha1("hello")
        let legacy = Integrity::from_legacy_sha1("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d").unwrap();
        let mut hasher = IntegrityHasher::new(&[Algorithm::Sha1, Algorithm::Sha512]);
        hasher.update(b"hel");
        hasher.update(b"lo");
        let actual = hasher.finish();
        assert!(legacy.matches(&actual));
        assert_eq!(
            actual.sha1_hex().as_deref(),
            Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
        );
        assert!(Integrity::from_legacy_sha1("nothex").is_err());
    }

    #[test]
    fn test_mismatch() {
        let expected = Integrity::compute(b"hello");
        let actual = Integrity::compute(b"goodbye");
        let err = expected.check(&actual).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_no_common_algorithm_never_matches() {
        let sha1 = Integrity::from_legacy_sha1("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d").unwrap();
        let sha512 = Integrity::compute(b"hello");
        assert!(!sha1.matches(&sha512));
        assert!(sha1.clone().merge(&sha512).matches(&sha512));
    }

    #[test]
    fn test_hex_digest() {
        let sri = Integrity::from_legacy_sha1("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d").unwrap();
        assert_eq!(
            sri.strongest().hex_digest().as_deref(),
            Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
        );
    }
}
