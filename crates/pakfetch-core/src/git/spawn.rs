//! Running the `git` binary with bounded retry on transient failures.

use crate::error::FetchError;
use crate::options::RetryOptions;
use regex_lite::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, warn};

/// stderr signatures of failures worth retrying.
const TRANSIENT_PATTERNS: &[&str] = &[
    r"remote error: Internal Server Error",
    r"The remote end hung up unexpectedly",
    r"Connection timed out",
    r"Operation timed out",
    r"Failed to connect to .* Timed out",
    r"Connection reset by peer",
    r"SSL_ERROR_SYSCALL",
    r"The requested URL returned error: 503",
];

fn transient_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!("(?i){}", TRANSIENT_PATTERNS.join("|"))).ok())
        .as_ref()
}

/// Whether `stderr` matches a known transient failure.
#[must_use]
pub fn is_transient(stderr: &str) -> bool {
    transient_regex().is_some_and(|re| re.is_match(stderr))
}

/// Run `git <args>` and return stdout.
///
/// Transient failures are retried `retry.retries` times with exponential
/// backoff; any other failure returns at once.
///
/// # Errors
/// `NoGitBinary` if git is not on `PATH`, `GitTransient` once retries are
/// exhausted, `GitFatal` for anything else.
pub async fn git(args: &[&str], cwd: Option<&Path>, retry: &RetryOptions) -> Result<String, FetchError> {
    let binary = which::which("git").map_err(|_| FetchError::NoGitBinary)?;
    let command = format!("git {}", args.join(" "));
    let mut attempt = 0;

    loop {
        let mut cmd = Command::new(&binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "echo")
            .kill_on_drop(true);
        if std::env::var_os("GIT_SSH_COMMAND").is_none() {
            cmd.env("GIT_SSH_COMMAND", "ssh -oStrictHostKeyChecking=accept-new");
        }
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        debug!(command = %command, attempt, "running git");
        let output = cmd.output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !is_transient(&stderr) {
            return Err(FetchError::GitFatal { command, stderr });
        }
        if attempt >= retry.retries {
            return Err(FetchError::GitTransient { command, stderr });
        }
        attempt += 1;
        let delay = retry.backoff(attempt);
        warn!(command = %command, attempt, delay_ms = delay.as_millis() as u64, "transient git failure, retrying");
        tokio::time::sleep(delay).await;
    }
}
