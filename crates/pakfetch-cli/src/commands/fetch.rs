//! `pakfetch resolve|manifest|packument|tarball|extract`.

use miette::{IntoDiagnostic, Result};
use pakfetch_core::paths::default_cache_dir;
use pakfetch_core::{FetchError, Options, Session, TarballInfo};
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// What to fetch.
#[derive(Debug, Clone)]
pub enum FetchAction {
    Resolve { spec: String },
    Manifest { spec: String },
    Packument { spec: String },
    Tarball { spec: String, dest: PathBuf },
    Extract { spec: String, dest: PathBuf },
}

impl FetchAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resolve { .. } => "resolve",
            Self::Manifest { .. } => "manifest",
            Self::Packument { .. } => "packument",
            Self::Tarball { .. } => "tarball",
            Self::Extract { .. } => "extract",
        }
    }

    pub fn spec(&self) -> &str {
        match self {
            Self::Resolve { spec }
            | Self::Manifest { spec }
            | Self::Packument { spec }
            | Self::Tarball { spec, .. }
            | Self::Extract { spec, .. } => spec,
        }
    }
}

/// Global flags that shape [`Options`].
#[derive(Debug, Clone)]
pub struct FetchArgs {
    pub cwd: PathBuf,
    pub cache: Option<PathBuf>,
    pub no_cache: bool,
    pub registry: Option<String>,
    pub offline: bool,
    pub prefer_offline: bool,
    pub prefer_online: bool,
    pub integrity: Option<String>,
    pub resolved: Option<String>,
    pub full_metadata: bool,
    pub tag: String,
}

impl FetchArgs {
    /// Flags layered over `.npmrc`, which is layered over the environment.
    pub fn options(&self) -> Options {
        let mut opts = Options::from_env()
            .with_npmrc_from(&self.cwd)
            .with_where(&self.cwd)
            .with_offline(self.offline)
            .with_prefer_offline(self.prefer_offline)
            .with_prefer_online(self.prefer_online)
            .with_full_metadata(self.full_metadata)
            .with_default_tag(self.tag.clone());

        opts = if self.no_cache {
            opts.without_cache()
        } else {
            opts.with_cache(self.cache.clone().unwrap_or_else(default_cache_dir))
        };
        if let Some(registry) = &self.registry {
            opts = opts.with_registry(registry);
        }
        if let Some(integrity) = &self.integrity {
            opts = opts.with_integrity(integrity.clone());
        }
        if let Some(resolved) = &self.resolved {
            opts = opts.with_resolved(resolved.clone());
        }
        opts
    }
}

#[derive(Serialize)]
struct ResolveResult<'a> {
    ok: bool,
    spec: &'a str,
    resolved: String,
}

#[derive(Serialize)]
struct TarballResult<'a> {
    ok: bool,
    spec: &'a str,
    dest: String,
    resolved: Option<String>,
    integrity: Option<String>,
}

#[derive(Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorResult<'a> {
    ok: bool,
    spec: &'a str,
    error: ErrorInfo,
}

/// Run one fetch command.
///
/// In JSON mode failures are printed as `{ "ok": false, "error": { code, message } }`
/// and the process exits with status 1.
pub fn run(action: FetchAction, args: &FetchArgs, json: bool) -> Result<()> {
    let opts = args.options();
    debug!(registry = %opts.registry, cache = ?opts.cache, "fetch options");

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let outcome = runtime.block_on(execute(&action, &opts, json));

    match outcome {
        Ok(output) => {
            println!("{output}");
            Ok(())
        }
        Err(e) if json => {
            let result = ErrorResult {
                ok: false,
                spec: action.spec(),
                error: ErrorInfo {
                    code: e.code(),
                    message: e.to_string(),
                },
            };
            println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);
            std::process::exit(1);
        }
        Err(e) => Err(e).into_diagnostic(),
    }
}

/// Perform the fetch and render its output.
async fn execute(action: &FetchAction, opts: &Options, json: bool) -> Result<String, FetchError> {
    let session = Session::new()?;
    let spec = action.spec();

    match action {
        FetchAction::Resolve { .. } => {
            let resolved = session.resolve(spec, opts).await?;
            if json {
                render(&ResolveResult {
                    ok: true,
                    spec,
                    resolved,
                })
            } else {
                Ok(resolved)
            }
        }
        FetchAction::Manifest { .. } => {
            let manifest = session.manifest(spec, opts).await?;
            if json {
                render(&manifest)
            } else {
                Ok(format!(
                    "{}\nresolved: {}\nintegrity: {}",
                    manifest.id,
                    manifest.resolved.as_deref().unwrap_or("-"),
                    manifest.integrity.as_deref().unwrap_or("-"),
                ))
            }
        }
        FetchAction::Packument { .. } => {
            let packument = session.packument(spec, opts).await?;
            if json {
                render(&packument)
            } else {
                let tags = packument
                    .dist_tags
                    .iter()
                    .map(|(tag, version)| format!("{tag}: {version}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let versions = packument.versions.keys().cloned().collect::<Vec<_>>().join(" ");
                Ok(format!("{}\ndist-tags: {tags}\nversions: {versions}", packument.name))
            }
        }
        FetchAction::Tarball { dest, .. } => {
            let info = session.tarball_to_file(spec, dest, opts).await?;
            tarball_output(spec, &opts.resolve_path(dest), &info, json)
        }
        FetchAction::Extract { dest, .. } => {
            let info = session.extract(spec, dest, opts).await?;
            tarball_output(spec, &opts.resolve_path(dest), &info, json)
        }
    }
}

fn tarball_output(
    spec: &str,
    dest: &std::path::Path,
    info: &TarballInfo,
    json: bool,
) -> Result<String, FetchError> {
    if json {
        render(&TarballResult {
            ok: true,
            spec,
            dest: dest.display().to_string(),
            resolved: info.resolved.clone(),
            integrity: info.integrity.clone(),
        })
    } else {
        Ok(format!(
            "{spec} -> {}\nintegrity: {}",
            dest.display(),
            info.integrity.as_deref().unwrap_or("-"),
        ))
    }
}

fn render<T: Serialize>(value: &T) -> Result<String, FetchError> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> FetchArgs {
        FetchArgs {
            cwd: PathBuf::from("/work"),
            cache: Some(PathBuf::from("/tmp/pakfetch-test-cache")),
            no_cache: false,
            registry: Some("http://127.0.0.1:4873".to_string()),
            offline: false,
            prefer_offline: true,
            prefer_online: false,
            integrity: None,
            resolved: None,
            full_metadata: false,
            tag: "next".to_string(),
        }
    }

    #[test]
    fn test_options_from_flags() {
        let opts = args().options();
        assert_eq!(opts.registry, "http://127.0.0.1:4873/");
        assert_eq!(opts.cache, Some(PathBuf::from("/tmp/pakfetch-test-cache")));
        assert_eq!(opts.where_, PathBuf::from("/work"));
        assert_eq!(opts.default_tag, "next");
        assert!(opts.prefer_offline);
    }

    #[test]
    fn test_no_cache_wins() {
        let mut args = args();
        args.no_cache = true;
        assert_eq!(args.options().cache, None);
    }

    #[test]
    fn test_action_accessors() {
        let action = FetchAction::Extract {
            spec: "left-pad@1".to_string(),
            dest: PathBuf::from("out"),
        };
        assert_eq!(action.name(), "extract");
        assert_eq!(action.spec(), "left-pad@1");
    }
}
