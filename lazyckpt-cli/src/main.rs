//! lazyckpt CLI: inspect and materialize checkpoints in the `torch.save` layout.
//!
//! Metadata commands never read tensor storage; only `materialize` and
//! attributes that need data touch the storage records.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// lazyckpt: look inside checkpoints without loading them
#[derive(Parser, Debug)]
#[command(name = "lazyckpt", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (for `.lazyckpt/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Fail on globals that are neither builtins nor tensor rebuild functions
    #[arg(long)]
    strict: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List every tensor with its dtype and shape, without reading storage
    Inspect {
        /// Checkpoint file
        path: PathBuf,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Read tensors and print a SHA-256 digest of each one's data
    Materialize {
        /// Checkpoint file
        path: PathBuf,
        /// Only tensors whose path starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Query one attribute of one tensor (`shape`, `dtype`, `requires_grad`, ...)
    Attr {
        /// Checkpoint file
        path: PathBuf,
        /// Dotted tensor path as printed by `inspect`
        tensor: String,
        /// Attribute name
        name: String,
    },
    /// Validate a data-parallel x tensor-parallel layout against the configuration
    Mesh {
        /// Number of nodes
        #[arg(long, default_value = "1")]
        nodes: usize,
        /// Devices per node
        #[arg(long, default_value = "1")]
        devices: usize,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the current merged configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "lazyckpt", "lazyckpt")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "lazyckpt.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = lazyckpt_core::load_config(Some(&workspace), None)?;
    if cli.strict {
        config.loader.strict_globals = true;
    }

    let mut out = std::io::stdout().lock();
    commands::handle_command(cli.command, &workspace, &config, &mut out)
}
