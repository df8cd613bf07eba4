//! Known git hosts and their URL shapes.

use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitHost {
    GitHub,
    GitLab,
    Bitbucket,
}

impl GitHost {
    #[must_use]
    pub fn domain(self) -> &'static str {
        match self {
            Self::GitHub => "github.com",
            Self::GitLab => "gitlab.com",
            Self::Bitbucket => "bitbucket.org",
        }
    }

    #[must_use]
    pub fn shortcut(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Bitbucket => "bitbucket",
        }
    }

    fn from_shortcut(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Self::GitHub),
            "gitlab" => Some(Self::GitLab),
            "bitbucket" => Some(Self::Bitbucket),
            _ => None,
        }
    }

    fn from_domain(domain: &str) -> Option<Self> {
        let domain = domain.strip_prefix("www.").unwrap_or(domain);
        [Self::GitHub, Self::GitLab, Self::Bitbucket]
            .into_iter()
            .find(|h| h.domain() == domain)
    }
}

/// A repository on a known host, e.g. `github:user/project#v1.0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostedGit {
    pub host: GitHost,
    pub user: String,
    pub project: String,
    pub committish: Option<String>,
}

impl HostedGit {
    /// Parse `host:user/project#ref` or bare `user/project#ref` (GitHub).
    #[must_use]
    pub fn from_shorthand(input: &str) -> Option<Self> {
        let (body, committish) = split_fragment(input);
        let (host, path) = match body.split_once(':') {
            Some((prefix, rest)) => (GitHost::from_shortcut(prefix)?, rest),
            None => (GitHost::GitHub, body),
        };
        let (user, project) = path.split_once('/')?;
        let project = project.strip_suffix(".git").unwrap_or(project);
        if !valid_segment(user) || !valid_segment(project) {
            return None;
        }
        Some(Self {
            host,
            user: user.to_string(),
            project: project.to_string(),
            committish,
        })
    }

    /// Recognize a full URL (`git+https://github.com/u/p.git#ref`, ...).
    #[must_use]
    pub fn from_url(input: &str) -> Option<Self> {
        let (body, committish) = split_fragment(input);
        let body = body.strip_prefix("git+").unwrap_or(body);
        let url = Url::parse(&normalize_git_url(body)).ok()?;
        let host = GitHost::from_domain(url.host_str()?)?;
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let user = segments.next()?;
        let project = segments.next()?;
        if segments.next().is_some() {
            return None;
        }
        let project = project.strip_suffix(".git").unwrap_or(project);
        if !valid_segment(user) || !valid_segment(project) {
            return None;
        }
        Some(Self {
            host,
            user: user.to_string(),
            project: project.to_string(),
            committish,
        })
    }

    #[must_use]
    pub fn git_url(&self) -> String {
        format!("git://{}/{}/{}.git", self.host.domain(), self.user, self.project)
    }

    #[must_use]
    pub fn https_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.host.domain(), self.user, self.project)
    }

    #[must_use]
    pub fn ssh_url(&self) -> String {
        format!("ssh://git@{}/{}/{}.git", self.host.domain(), self.user, self.project)
    }

    /// Transport URLs in the order they are attempted.
    #[must_use]
    pub fn transport_urls(&self) -> [String; 3] {
        [self.git_url(), self.https_url(), self.ssh_url()]
    }

    /// Archive URL for a specific commit, served without cloning.
    #[must_use]
    pub fn tarball_url(&self, committish: &str) -> String {
        match self.host {
            GitHost::GitHub => format!(
                "https://codeload.github.com/{}/{}/tar.gz/{committish}",
                self.user, self.project
            ),
            GitHost::GitLab => format!(
                "https://gitlab.com/{}/{}/repository/archive.tar.gz?ref={committish}",
                self.user, self.project
            ),
            GitHost::Bitbucket => format!(
                "https://bitbucket.org/{}/{}/get/{committish}.tar.gz",
                self.user, self.project
            ),
        }
    }

    /// `github:user/project` form without the committish.
    #[must_use]
    pub fn shortcut(&self) -> String {
        format!("{}:{}/{}", self.host.shortcut(), self.user, self.project)
    }
}

impl fmt::Display for HostedGit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shortcut())?;
        if let Some(c) = &self.committish {
            write!(f, "#{c}")?;
        }
        Ok(())
    }
}

/// Split `url#fragment`; an empty fragment counts as none.
#[must_use]
pub fn split_fragment(input: &str) -> (&str, Option<String>) {
    match input.split_once('#') {
        Some((body, frag)) if !frag.is_empty() => (body, Some(frag.to_string())),
        Some((body, _)) => (body, None),
        None => (input, None),
    }
}

/// `git@host:user/repo.git` → `ssh://git@host/user/repo.git`.
#[must_use]
pub fn scp_to_ssh(input: &str) -> Option<String> {
    if input.contains("://") {
        return None;
    }
    let (userhost, path) = input.split_once(':')?;
    if !userhost.contains('@') || userhost.contains('/') {
        return None;
    }
    Some(format!("ssh://{userhost}/{}", path.trim_start_matches('/')))
}

/// Make a git remote parseable as a URL.
///
/// Handles scp-style remotes and `ssh://git@host:user/repo` where the colon
/// introduces a path rather than a port.
#[must_use]
pub fn normalize_git_url(input: &str) -> String {
    if let Some(ssh) = scp_to_ssh(input) {
        return ssh;
    }
    if let Some(rest) = input.strip_prefix("ssh://") {
        if let Some((authority, path)) = rest.split_once(':') {
            if !authority.contains('/') && !path.starts_with(|c: char| c.is_ascii_digit()) {
                return format!("ssh://{authority}/{path}");
            }
        }
    }
    input.to_string()
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
