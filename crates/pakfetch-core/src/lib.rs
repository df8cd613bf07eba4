#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Fetch npm packages from any specifier: registry names, git repositories,
//! local tarballs and directories, and remote tarball URLs.
//!
//! Start with [`Session`]: it parses a specifier, picks the matching
//! fetcher, and serves manifests, packuments and verified tarballs through
//! a content-addressed cache.

pub mod cache;
pub mod error;
pub mod fetcher;
pub mod finalize;
pub mod git;
pub mod inflight;
pub mod integrity;
pub mod manifest;
pub mod memo;
pub mod npmrc;
pub mod options;
pub mod pack;
pub mod paths;
pub mod registry;
pub mod retrieve;
pub mod session;
pub mod spec;
pub mod stream;
pub mod tarball;
pub mod version;

pub use cache::{ContentCache, IndexEntry};
pub use error::{codes, FetchError};
pub use fetcher::Fetcher;
pub use integrity::{Algorithm, Integrity};
pub use manifest::{Manifest, Packument};
pub use memo::{Clock, ManualClock, SystemClock};
pub use options::{Options, RetryOptions};
pub use retrieve::Retrieved;
pub use session::{FetchedTarball, Session, TarballInfo};
pub use spec::{PackageSpec, SpecType};
pub use stream::TarballStream;

/// Crate version, reported in the default user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
