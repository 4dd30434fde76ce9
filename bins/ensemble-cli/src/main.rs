// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ensemble CLI
//!
//! Offline operator commands over the cache and workspace directories.

mod commands;

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ensemble operator CLI", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the signature and trajectory count of a run request file
    Signature {
        /// JSON file shaped like a run request: `{"model": ..., "kwargs": ...}`
        request: PathBuf,
    },
    /// List cached signatures and their coverage
    List {
        /// Cache root
        #[arg(long, default_value = "cache")]
        cache_dir: PathBuf,
    },
    /// Show and verify one cache namespace
    Inspect {
        /// Cache root
        #[arg(long, default_value = "cache")]
        cache_dir: PathBuf,
        /// Signature (64 hex characters)
        signature: String,
        /// Also print the trajectories
        #[arg(long)]
        dump: bool,
    },
    /// Remove staged writes and unreferenced segments
    Recover {
        /// Cache root
        #[arg(long, default_value = "cache")]
        cache_dir: PathBuf,
    },
    /// Remove leftover job workspaces
    Sweep {
        /// Workspace root
        #[arg(long, default_value = "jobs")]
        workspace_root: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match args.cmd {
        Command::Signature { request } => commands::signature(&request, &mut out)?,
        Command::List { cache_dir } => commands::list(&cache_dir, &mut out)?,
        Command::Inspect {
            cache_dir,
            signature,
            dump,
        } => commands::inspect(&cache_dir, &signature, dump, &mut out)?,
        Command::Recover { cache_dir } => commands::recover(&cache_dir, &mut out)?,
        Command::Sweep { workspace_root } => commands::sweep(&workspace_root, &mut out)?,
    }
    out.flush()?;
    Ok(())
}
