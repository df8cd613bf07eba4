#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

mod commands;
mod logging;

use clap::Parser;
use commands::fetch::{FetchAction, FetchArgs};
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pakfetch")]
#[command(author, version, about = "Fetch npm packages from any specifier", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v INFO, -vv DEBUG, -vvv TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory; relative specs resolve against it
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    /// Cache directory (defaults to the platform cache dir)
    #[arg(long, global = true, value_name = "PATH", env = "PAKFETCH_CACHE")]
    cache: Option<PathBuf>,

    /// Bypass the cache entirely (wins over --cache)
    #[arg(long, global = true)]
    no_cache: bool,

    /// Registry URL (overrides .npmrc)
    #[arg(long, global = true, value_name = "URL", env = "PAKFETCH_REGISTRY")]
    registry: Option<String>,

    /// Never touch the network
    #[arg(long, global = true)]
    offline: bool,

    /// Use cached metadata regardless of age
    #[arg(long, global = true, conflicts_with = "prefer_online")]
    prefer_offline: bool,

    /// Always revalidate cached metadata
    #[arg(long, global = true)]
    prefer_online: bool,

    /// Expected integrity of the tarball (SRI string)
    #[arg(long, global = true, value_name = "SRI")]
    integrity: Option<String>,

    /// Known tarball location, skipping resolution
    #[arg(long, global = true, value_name = "URL|PATH")]
    resolved: Option<String>,

    /// Fetch full packuments instead of the abbreviated form
    #[arg(long, global = true)]
    full_metadata: bool,

    /// Dist-tag used when a spec names no version
    #[arg(long, global = true, default_value = "latest")]
    tag: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Commands {
    /// Print version information
    Version,

    /// Print the resolved location of a spec
    Resolve {
        /// Package spec (e.g. "left-pad@^1", "github:user/repo", "file:./pkg.tgz")
        spec: String,
    },

    /// Print the finalized manifest of a spec
    Manifest {
        /// Package spec
        spec: String,
    },

    /// Print the packument (all versions) of a spec
    Packument {
        /// Package spec
        spec: String,
    },

    /// Download the tarball of a spec to a file
    Tarball {
        /// Package spec
        spec: String,

        /// Destination file
        dest: PathBuf,
    },

    /// Unpack the tarball of a spec into a directory
    Extract {
        /// Package spec
        spec: String,

        /// Destination directory
        dest: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    logging::init(cli.verbose, cli.json);

    let action = match cli.command.clone() {
        Some(Commands::Version) | None => return commands::version::run(cli.json),
        Some(Commands::Resolve { spec }) => FetchAction::Resolve { spec },
        Some(Commands::Manifest { spec }) => FetchAction::Manifest { spec },
        Some(Commands::Packument { spec }) => FetchAction::Packument { spec },
        Some(Commands::Tarball { spec, dest }) => FetchAction::Tarball { spec, dest },
        Some(Commands::Extract { spec, dest }) => FetchAction::Extract { spec, dest },
    };

    let args = FetchArgs {
        cwd,
        cache: cli.cache,
        no_cache: cli.no_cache,
        registry: cli.registry,
        offline: cli.offline,
        prefer_offline: cli.prefer_offline,
        prefer_online: cli.prefer_online,
        integrity: cli.integrity,
        resolved: cli.resolved,
        full_metadata: cli.full_metadata,
        tag: cli.tag,
    };

    let span = tracing::info_span!("fetch", cmd = action.name(), spec = action.spec());
    let _guard = span.enter();
    commands::fetch::run(action, &args, cli.json)
}
