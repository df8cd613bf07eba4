//! Git support: hosted shortcuts, ref discovery, cloning.

pub mod clone;
pub mod hosted;
pub mod revs;
pub mod spawn;

pub use hosted::{GitHost, HostedGit};
pub use revs::{is_full_sha, is_sha_like, GitRef, GitRefSet, RefKind, ResolvedRef};

use crate::error::FetchError;
use crate::options::RetryOptions;

/// List the refs `repo` advertises.
///
/// # Errors
/// Propagates git failures.
pub async fn ls_remote(repo: &str, retry: &RetryOptions) -> Result<GitRefSet, FetchError> {
    let output = spawn::git(&["ls-remote", repo], None, retry).await?;
    Ok(GitRefSet::parse(&output))
}
