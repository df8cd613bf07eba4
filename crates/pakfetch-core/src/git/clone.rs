//! Cloning a resolved ref into a working tree.

use super::revs::{is_sha_like, RefKind, ResolvedRef};
use super::spawn::git;
use crate::error::FetchError;
use crate::options::RetryOptions;
use std::path::Path;
use tracing::debug;

/// Clone `repo` at `target` into `dest` (which must not exist) and return
/// the sha checked out.
///
/// A named ref gets a shallow single-branch clone. A bare sha needs the full
/// history, so the repository is mirrored and the sha checked out. Submodules
/// are initialized recursively either way.
///
/// # Errors
/// Propagates git failures.
pub async fn clone(
    repo: &str,
    target: &ResolvedRef,
    dest: &Path,
    retry: &RetryOptions,
) -> Result<String, FetchError> {
    let dest_str = dest.to_string_lossy();

    match target.ref_name.as_deref() {
        Some(name) => {
            debug!(repo, name, "shallow clone");
            git(
                &["clone", "--depth=1", "-q", "-b", name, repo, &dest_str],
                None,
                retry,
            )
            .await?;
        }
        None if target.kind == RefKind::Head => {
            debug!(repo, "shallow clone of HEAD");
            git(&["clone", "--depth=1", "-q", repo, &dest_str], None, retry).await?;
        }
        None => {
            if !is_sha_like(&target.sha) {
                return Err(FetchError::GitFatal {
                    command: "git checkout".to_string(),
                    stderr: format!("'{}' is not a commit id", target.sha),
                });
            }
            debug!(repo, sha = %target.sha, "mirror clone");
            let git_dir = dest.join(".git");
            git(
                &["clone", "--mirror", "-q", repo, &git_dir.to_string_lossy()],
                None,
                retry,
            )
            .await?;
            git(&["config", "--bool", "core.bare", "false"], Some(dest), retry).await?;
            git(&["checkout", "-q", &target.sha], Some(dest), retry).await?;
        }
    }

    git(
        &["submodule", "update", "-q", "--init", "--recursive"],
        Some(dest),
        retry,
    )
    .await?;
    let head = git(&["rev-parse", "--revs-only", "HEAD"], Some(dest), retry).await?;
    Ok(head.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_option_like_committish_is_rejected_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("checkout");
        let target = ResolvedRef {
            sha: "--upload-pack=touch pwned".to_string(),
            ref_name: None,
            kind: RefKind::Other,
        };
        let err = clone("file:///nonexistent", &target, &dest, &RetryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::GitFatal { .. }), "got {err:?}");
        assert!(!dest.exists());
    }
}
