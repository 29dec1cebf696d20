//! Command-line interface.
//!
//! `run` starts the daemon; the other commands edit the config and share
//! stores directly and take effect on the next daemon start.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::access::{AccessCode, CodeKind};
use common::share::Share;

use crate::config::{Config, PendingEntry, ShareEntry};
use crate::daemon::Daemon;
use crate::store::{share_store_path, DiskStore};

#[derive(Parser, Debug)]
#[command(name = "cirrus", version, about = "Peer-to-peer encrypted file synchronization")]
pub struct Args {
    /// Path to the cirrus directory (defaults to ~/.cirrus)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon
    Run,
    /// Create a new share rooted at a directory
    Create { path: PathBuf },
    /// Issue an access code granting access to a share
    Code {
        /// Path of the share to grant access to
        path: PathBuf,
    },
    /// Redeem an access code into a directory
    Add { code: String, path: PathBuf },
    /// List shares and pending codes
    List,
}

pub async fn execute(args: Args) -> Result<()> {
    let dir = match args.config_dir {
        Some(dir) => dir,
        None => Config::default_dir()?,
    };
    let mut config = Config::load(&dir)?;

    match args.command {
        Command::Run => {
            let daemon = Daemon::new(&dir, config)?;
            daemon.run().await
        }

        Command::Create { path } => {
            std::fs::create_dir_all(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            let path = path.canonicalize()?;
            if config.shares.iter().any(|s| s.path == path) {
                bail!("{} is already a share", path.display());
            }
            let store = DiskStore::open(&share_store_path(&dir, &path))?;
            let share = Share::create(&path, store)?;
            config.shares.push(ShareEntry { path: path.clone() });
            config.save(&dir)?;
            println!("created share {} at {}", share.id(), path.display());
            Ok(())
        }

        Command::Code { path } => {
            let path = path.canonicalize()?;
            if !config.shares.iter().any(|s| s.path == path) {
                bail!("{} is not a share; run `cirrus create` first", path.display());
            }
            let store = DiskStore::open(&share_store_path(&dir, &path))?;
            let share = Share::open(&path, store)?
                .with_context(|| format!("no share store for {}", path.display()))?;
            let code = AccessCode::create(CodeKind::Long);
            share.add_code(code.clone());
            println!("{code}");
            Ok(())
        }

        Command::Add { code, path } => {
            // Validate before persisting; a typo should fail here, not at
            // connection time.
            let parsed = AccessCode::parse(&code)?;
            if config.pending.iter().any(|p| p.code == code) {
                bail!("that code is already pending");
            }
            config.pending.push(PendingEntry {
                code,
                path: path.clone(),
            });
            config.save(&dir)?;
            println!(
                "waiting to redeem code {} into {}",
                parsed.id(),
                path.display()
            );
            Ok(())
        }

        Command::List => {
            let daemon = Daemon::new(&dir, config)?;
            for share in daemon.shares().all() {
                println!("{}  {}", share.id(), share.path().display());
                for code in share.codes() {
                    println!("  code: {code}");
                }
            }
            for pending in daemon.shares().pending() {
                println!("{}  (pending)  {}", pending.id(), pending.path().display());
            }
            Ok(())
        }
    }
}
