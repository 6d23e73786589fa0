//! # spare
//!
//! An encrypted, deduplicating, snapshot-based backup tool over an
//! S3-compatible object store.
//!
//! ```text
//!               ┌────────────┐
//!               │ CLI (clap) │
//!               └─────┬──────┘
//!                     │
//!      ┌──────┬───────┼───────┬────────┐
//!      ▼      ▼       ▼       ▼        ▼
//!   create restore validate  lock    unlock
//!      │      │       │
//!      └──────┴───────┴──── Envoy (bucket lock, send/recv)
//!                              │
//!                    ┌─────────┼─────────┐
//!                    ▼                   ▼
//!               Inventory            Recovery
//!              (scan source)     (structure + data)
//! ```

mod backup;
mod block;
mod chunked;
mod config;
mod envoy;
mod error;
mod guard;
mod hasher;
mod inventory;
mod object_store;
mod recovery;
mod signal;
mod snapshot;

use backup::Connection;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;

/// spare — an encrypted, deduplicating, snapshot-based backup tool.
#[derive(Parser)]
#[command(name = "spare", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectionArgs {
    /// S3-compatible endpoint URL.
    #[arg(long, env = "SPARE_ENDPOINT")]
    endpoint: String,

    /// Access key id.
    #[arg(long, env = "SPARE_ACCESS_KEY")]
    access_key: String,

    /// Secret access key.
    #[arg(long, env = "SPARE_SECRET_KEY")]
    secret_key: String,

    /// Password the bucket's content is sealed with.
    #[arg(long, env = "SPARE_PASSWORD")]
    password: String,

    /// Target bucket name.
    #[arg(long, env = "SPARE_BUCKET")]
    bucket: String,
}

impl From<ConnectionArgs> for Connection {
    fn from(args: ConnectionArgs) -> Self {
        Connection {
            endpoint: args.endpoint,
            access_key: args.access_key,
            secret_key: args.secret_key,
            password: args.password,
            bucket: args.bucket,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Scans a source tree, uploads new content, and saves a snapshot.
    Create {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Source directory to back up.
        #[arg(long, env = "SPARE_PATH")]
        path: PathBuf,

        /// Relative path pattern to skip. May be repeated.
        #[arg(long)]
        skip: Vec<String>,

        /// Back up even if the bucket belongs to a different source tree.
        #[arg(long)]
        force: bool,
    },

    /// Restores a snapshot onto an empty directory.
    Restore {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Destination directory. Must be empty (or not yet exist).
        #[arg(long, env = "SPARE_PATH")]
        path: PathBuf,

        /// Snapshot prefix to restore, or "latest".
        #[arg(long, default_value = "latest")]
        snapshot: String,
    },

    /// Re-downloads and re-hashes every file every snapshot references.
    Validate {
        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Acquires the bucket lock without performing any operation.
    Lock {
        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Releases the bucket lock.
    Unlock {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

fn main() -> ExitCode {
    env_logger::init();

    if let Err(e) = signal::install() {
        eprintln!("{} failed to install signal handler: {e}", "✗".red());
    }

    let cli = Cli::parse();

    let tunables = match config::load_tunables() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{} {e}", "✗".red());
            return ExitCode::FAILURE;
        }
    };

    let outcome = signal::critical_section(|| run(cli.command, &tunables));

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {e}", "✗".red());
            ExitCode::FAILURE
        }
    }
}

/// Runs one verb. The `bool` distinguishes a clean success (`true`) from a
/// condition that's an ordinary, not-a-bug failure at the CLI layer
/// (validation found errors, lock/unlock found nothing to do) — both map to
/// exit code 1, but neither prints an error message.
fn run(command: Command, tunables: &config::Tunables) -> error::Result<bool> {
    match command {
        Command::Create { connection, path, skip, force } => {
            backup::create(&connection.into(), tunables, &path, &skip, force)?;
            Ok(true)
        }
        Command::Restore { connection, path, snapshot } => {
            backup::restore(&connection.into(), tunables, &path, &snapshot)?;
            Ok(true)
        }
        Command::Validate { connection } => {
            let ok = backup::validate(&connection.into(), tunables)?;
            Ok(ok)
        }
        Command::Lock { connection } => {
            let acquired = backup::lock(&connection.into(), tunables)?;
            if acquired {
                eprintln!("{} bucket locked", "✓".green());
            } else {
                eprintln!("{} bucket was already locked", "✗".red());
            }
            Ok(acquired)
        }
        Command::Unlock { connection } => {
            let released = backup::unlock(&connection.into(), tunables)?;
            if released {
                eprintln!("{} bucket unlocked", "✓".green());
            } else {
                eprintln!("{} bucket was already unlocked", "✗".red());
            }
            Ok(released)
        }
    }
}
