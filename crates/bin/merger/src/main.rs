use anyhow::{Context, Result};
use clap::Parser;
use merge_core::dedup::DedupPolicy;
use merge_core::inode::aggregate;
use merge_core::link::LinkingPolicy;
use merge_core::manifest::Manifest;
use merge_core::segment::segment;
use std::io::Write;
use std::path::PathBuf;

/// Reads one or more digest manifests and coalesces equal-content files via hard links and/or
/// kernel-level block deduplication.
#[derive(Parser, Debug)]
#[command(name = "merger", about = "Coalesce files with matching digests")]
struct Args {
    /// Request storage-level deduplication (FIDEDUPERANGE) between equal files.
    #[arg(long)]
    dedup: bool,

    /// Replace equal files with hard links to one another. Default when neither flag is given.
    #[arg(long)]
    link: bool,

    /// Manifest files produced by `scanner`.
    #[arg(required = true)]
    sumfiles: Vec<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let mut args = Args::parse();
    if !args.dedup && !args.link {
        args.link = true;
    }

    let mut manifest = Manifest::new();
    for path in &args.sumfiles {
        manifest
            .read_file(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
    }

    let stderr = std::io::stderr();
    let mut progress = stderr.lock();
    let mut need_nl = false;

    for (digest, dentries) in manifest.into_groups() {
        write!(progress, "\rmerging {digest}").ok();
        need_nl = true;

        let mut objects = aggregate(&dentries);
        if objects.len() < 2 {
            continue;
        }

        if args.link {
            let mut policy = LinkingPolicy::new();
            segment(&mut objects, &mut policy);
            if policy.linked_pairs() > 0 {
                writeln!(progress, " ({} linked)", policy.linked_pairs()).ok();
                need_nl = false;
            }
        }

        if args.dedup {
            let mut policy = DedupPolicy::new();
            for obj in objects.values_mut() {
                if let Err(e) = policy.open(obj) {
                    log::warn!("{}:{}: {}", obj.dev, obj.ino, e);
                }
            }
            segment(&mut objects, &mut policy);
            if policy.deduped_pairs() > 0 {
                writeln!(progress, " ({} deduped)", policy.deduped_pairs()).ok();
                need_nl = false;
            }
        }
    }

    if need_nl {
        writeln!(progress).ok();
    }
    write!(progress, "\rmerging done                    \n").ok();
    progress.flush().ok();

    Ok(())
}
