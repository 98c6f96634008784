use anyhow::{Context, Result};
use clap::Parser;
use merge_core::{hash, limits, pregroup, walk};
use std::io::Write;
use std::path::PathBuf;

/// Walks one or more directory trees and prints a SHA-512 digest manifest to standard output.
#[derive(Parser, Debug)]
#[command(name = "scanner", about = "Scan directory trees and emit a digest manifest")]
struct Args {
    /// Cache digests in the `user.sha512` extended attribute, keyed by mtime.
    #[arg(short = 'x', long = "xattr-cache-hash")]
    xattr_cache_hash: bool,

    /// Directories to scan.
    #[arg(required = true)]
    dirs: Vec<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    limits::raise_nofile_limit();

    let files = walk::walk(&args.dirs);
    log::info!("walked {} files", files.len());

    let grouped = pregroup::pregroup(files);

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    hash::hash_chain(grouped, args.xattr_cache_hash, &mut handle);

    handle.flush().context("flushing stdout")?;
    Ok(())
}
