//! CLI tool to load a WebAssembly module and call its entry point.
//!
//! Usage:
//!   boot-run run [artifact.wasm] [--config boot.json] [--entry run_app]
//!   boot-run inspect <artifact.wasm>
//!   boot-run stage [--config boot.json]
//!
//! Without an artifact, `run` uses the output location from the config
//! (`dist/yewchat_bg.wasm` by default).

use std::io;
use std::path::{Path, PathBuf};
use std::process::{self, ExitCode};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use wasm_boot::config::DEFAULT_CONFIG_FILE;
use wasm_boot::{
    ArtifactLocation, BootConfig, BootError, Bootstrap, LoaderOptions, WasmLoader,
};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BUILD_COMMIT"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    " on ",
    env!("BUILD_HOST"),
    ")"
);

/// Load a precompiled WebAssembly module and enter it.
#[derive(Parser)]
#[command(name = "boot-run", version, long_version = LONG_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log each load phase on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a module and call its entry point once
    Run(RunArgs),
    /// Compile a module and list its imports and exports
    Inspect {
        /// Module file (.wasm) or file:// URL
        artifact: String,
    },
    /// Copy the static files listed in the config
    Stage {
        /// Config file (default: ./boot.json if present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Module file (.wasm) or file:// URL; defaults to the configured output
    artifact: Option<String>,

    /// Config file (default: ./boot.json if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exported function to call
    #[arg(short, long)]
    entry: Option<String>,

    /// Give up loading after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Cap on guest linear memory, in bytes
    #[arg(long)]
    max_memory: Option<usize>,

    /// Guest log lines to keep; older lines are dropped
    #[arg(long)]
    max_log_lines: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Inspect { artifact } => inspect(&artifact).await,
        Commands::Stage { config } => stage(config.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        Level::DEBUG
    } else if quiet {
        Level::ERROR
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

/// Explicit config, else `./boot.json` when it exists, else built-in defaults.
fn load_config(path: Option<&Path>) -> Result<BootConfig, BootError> {
    let config = match path {
        Some(p) => BootConfig::load(p)?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            BootConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => BootConfig::default(),
    };
    Ok(config)
}

/// A path that does not exist as given is retried with the resolve extensions.
fn resolve_artifact(config: &BootConfig, raw: &str) -> ArtifactLocation {
    let location = ArtifactLocation::parse(raw);
    if let Some(p) = location.as_path()
        && !p.exists()
        && let Some(found) = config.resolve_module(p)
    {
        return ArtifactLocation::Path(found);
    }
    location
}

/// First Ctrl-C cancels a load in progress; a second one exits immediately.
fn watch_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling load");
            token.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                process::exit(130);
            }
        }
    });
}

async fn run(args: RunArgs) -> Result<(), BootError> {
    let config = load_config(args.config.as_deref())?;

    let mut options = LoaderOptions::from(config.loader);
    if let Some(ms) = args.timeout_ms {
        options.timeout = Duration::from_millis(ms);
    }
    if let Some(bytes) = args.max_memory {
        options.max_memory_bytes = bytes;
    }
    if let Some(lines) = args.max_log_lines {
        options.max_log_lines = lines;
    }

    let location = match &args.artifact {
        Some(raw) => resolve_artifact(&config, raw),
        None => config.artifact_location(),
    };
    let entry = args.entry.unwrap_or_else(|| config.entry.clone());
    info!(mode = ?config.mode(), %location, %entry, "bootstrapping");

    let token = CancellationToken::new();
    watch_interrupt(token.clone());

    let loader = WasmLoader::new(options)?.with_cancellation(token);
    let mut boot = Bootstrap::new(loader, entry);
    let handle = boot.run(&location).await?;

    info!(
        lines = handle.logs().len(),
        dropped = handle.dropped_logs(),
        "module finished"
    );
    Ok(())
}

async fn inspect(artifact: &str) -> Result<(), BootError> {
    let loader = WasmLoader::new(LoaderOptions::default())?;
    let info = loader.inspect(&ArtifactLocation::parse(artifact)).await?;

    println!("imports:");
    for i in &info.imports {
        println!("  {}.{} ({})", i.module, i.name, i.kind);
    }
    println!("exports:");
    for e in &info.exports {
        println!("  {} ({})", e.name, e.kind);
    }
    Ok(())
}

fn stage(config: Option<&Path>) -> Result<(), BootError> {
    let config = load_config(config)?;
    let copied = config.stage_static()?;
    eprintln!("Staged {copied} files");
    Ok(())
}
