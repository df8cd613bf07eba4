//! Git behavior against a scripted `git` placed first on `PATH`.
//!
//! `PATH` is process-wide, so every test here runs serially and this file is
//! its own test binary.
#![cfg(unix)]

use pakfetch_core::git::spawn;
use pakfetch_core::memo::GIT_REFS_TTL;
use pakfetch_core::{FetchError, ManualClock, Options, RetryOptions, Session};
use serial_test::serial;
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const SHA: &str = "89abcdef0123456789abcdef0123456789abcdef";

/// A fake `git` on `PATH` that logs each call's arguments to a file.
struct FakeGit {
    dir: TempDir,
    old_path: Option<OsString>,
}

impl FakeGit {
    /// Install a script whose body runs after the call is logged to `$LOG`.
    fn install(body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("calls");
        let script = dir.path().join("git");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\nLOG='{}'\necho \"$*\" >> \"$LOG\"\n{body}\n",
                log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let old_path = std::env::var_os("PATH");
        let mut paths = vec![dir.path().to_path_buf()];
        if let Some(old) = &old_path {
            paths.extend(std::env::split_paths(old));
        }
        std::env::set_var("PATH", std::env::join_paths(paths).unwrap());
        Self { dir, old_path }
    }

    fn log(&self) -> PathBuf {
        self.dir.path().join("calls")
    }

    fn calls(&self) -> Vec<String> {
        read_lines(&self.log())
    }
}

impl Drop for FakeGit {
    fn drop(&mut self) {
        match &self.old_path {
            Some(path) => std::env::set_var("PATH", path),
            None => std::env::remove_var("PATH"),
        }
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|s| s.lines().map(String::from).collect())
        .unwrap_or_default()
}

fn quick_retry(retries: u32) -> RetryOptions {
    RetryOptions {
        retries,
        factor: 1,
        min_timeout_ms: 1,
        max_timeout_ms: 1,
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_transient_failure_retried_then_reported() {
    let fake = FakeGit::install(
        "echo 'fatal: The remote end hung up unexpectedly' >&2\nexit 128",
    );

    let err = spawn::git(&["ls-remote", "https://example.invalid/r.git"], None, &quick_retry(2))
        .await
        .unwrap_err();

    match err {
        FetchError::GitTransient { command, stderr } => {
            assert_eq!(command, "git ls-remote https://example.invalid/r.git");
            assert!(stderr.contains("hung up unexpectedly"));
        }
        other => panic!("expected GitTransient, got {other:?}"),
    }
    assert_eq!(fake.calls().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_transient_failure_recovers_on_retry() {
    // Fails until the log holds two calls, then succeeds.
    let fake = FakeGit::install(
        "if [ $(wc -l < \"$LOG\") -lt 2 ]; then\n\
         echo 'error: The requested URL returned error: 503' >&2\nexit 128\nfi\n\
         echo ok",
    );

    let out = spawn::git(&["fetch"], None, &quick_retry(2)).await.unwrap();
    assert_eq!(out.trim(), "ok");
    assert_eq!(fake.calls().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_fatal_failure_runs_once() {
    let fake = FakeGit::install("echo \"fatal: repository 'x' not found\" >&2\nexit 128");

    let err = spawn::git(&["ls-remote", "x"], None, &quick_retry(2))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::GitFatal { .. }), "got {err:?}");
    assert_eq!(fake.calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_ref_listing_cached_until_ttl_expires() {
    let fake = FakeGit::install(&format!("printf '{SHA}\\tHEAD\\n'"));
    let clock = ManualClock::new(SystemTime::UNIX_EPOCH);
    let session = Session::with_clock(Arc::new(clock.clone())).unwrap();
    let opts = Options::default().without_cache();
    let spec = "git+https://example.invalid/r.git";
    let expected = format!("git+https://example.invalid/r.git#{SHA}");

    assert_eq!(session.resolve(spec, &opts).await.unwrap(), expected);
    assert_eq!(session.resolve(spec, &opts).await.unwrap(), expected);
    assert_eq!(fake.calls(), vec!["ls-remote https://example.invalid/r.git"]);

    clock.advance(GIT_REFS_TTL - Duration::from_secs(1));
    session.resolve(spec, &opts).await.unwrap();
    assert_eq!(fake.calls().len(), 1);

    clock.advance(Duration::from_secs(2));
    assert_eq!(session.resolve(spec, &opts).await.unwrap(), expected);
    assert_eq!(fake.calls().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_concurrent_ref_listings_share_one_call() {
    // Slow enough that every request arrives while the first is running.
    let fake = FakeGit::install(&format!("sleep 1\nprintf '{SHA}\\tHEAD\\n'"));
    let session = Session::new().unwrap();
    let opts = Options::default().without_cache();
    let spec = "git+https://example.invalid/r.git";

    let resolved = futures::future::join_all((0..4).map(|_| session.resolve(spec, &opts))).await;

    for result in resolved {
        assert_eq!(
            result.unwrap(),
            format!("git+https://example.invalid/r.git#{SHA}")
        );
    }
    assert_eq!(fake.calls().len(), 1);
}
