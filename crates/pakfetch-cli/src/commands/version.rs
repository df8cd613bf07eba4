use miette::{IntoDiagnostic, Result};
use pakfetch_core::paths::{default_cache_dir, CACHE_LAYOUT_VERSION};
use pakfetch_core::VERSION;
use serde::Serialize;

#[derive(Serialize)]
struct VersionInfo {
    version: &'static str,
    cache_layout: u32,
    cache_dir: String,
}

pub fn run(json: bool) -> Result<()> {
    if json {
        let info = VersionInfo {
            version: VERSION,
            cache_layout: CACHE_LAYOUT_VERSION,
            cache_dir: default_cache_dir().display().to_string(),
        };
        println!("{}", serde_json::to_string_pretty(&info).into_diagnostic()?);
    } else {
        println!("pakfetch {VERSION}");
    }
    Ok(())
}
