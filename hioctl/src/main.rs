use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hio_posix::comm::SingleProcess;
use hio_posix::config::{EngineConfig, FileMode as EngineFileMode};
use hio_posix::context::{Context, Module, RootSelectMode};
use hio_posix::dataset::{Dataset, DatasetFlags, Mode};
use hio_posix::manifest::Manifest;
use hio_posix::path;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RootMode {
    Current,
    First,
    All,
}

impl From<RootMode> for RootSelectMode {
    fn from(m: RootMode) -> Self {
        match m {
            RootMode::Current => RootSelectMode::Current,
            RootMode::First => RootSelectMode::First,
            RootMode::All => RootSelectMode::All,
        }
    }
}

#[derive(Parser)]
#[command(name = "hioctl", version, about = "Inspection and admin CLI for libhio POSIX dataset instances")]
struct Cli {
    /// Context name the dataset was opened under (the `{context}.hio` directory).
    #[arg(long, global = true, default_value = "hio")]
    context: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List every instance id of a named dataset under a data root.
    List {
        /// Data root (module) to scan.
        root: PathBuf,
        /// Dataset name.
        name: String,
    },
    /// Unlink a dataset instance from one or more data roots.
    Unlink {
        /// One or more data roots to try, in order.
        #[arg(long = "root", required = true)]
        roots: Vec<PathBuf>,
        name: String,
        id: u64,
        #[arg(long, value_enum, default_value_t = RootMode::Current)]
        mode: RootMode,
    },
    /// Print a dataset instance's top-level manifest header as JSON.
    DumpHeader { root: PathBuf, name: String, id: u64 },
    /// Open a dataset instance read-only and report open-file cache
    /// occupancy after probing every element the manifest names with a
    /// one-byte read.
    InspectCache {
        root: PathBuf,
        name: String,
        id: u64,
        #[arg(long, default_value_t = hio_posix::cache::DEFAULT_MAX_OPEN_FILES)]
        max_open_files: usize,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::List { root, name } => list(&cli.context, &root, &name),
        Cmd::Unlink { roots, name, id, mode } => unlink(&cli.context, &roots, &name, id, mode.into()),
        Cmd::DumpHeader { root, name, id } => dump_header(&cli.context, &root, &name, id),
        Cmd::InspectCache { root, name, id, max_open_files } => inspect_cache(&cli.context, &root, &name, id, max_open_files),
    }
}

fn list(context_name: &str, root: &PathBuf, name: &str) -> Result<()> {
    let ctx = Context::new(context_name, Arc::new(SingleProcess));
    let module = Module::new(root);
    let headers = hio_posix::list::list_instances(&ctx, &module, name);
    if headers.is_empty() {
        println!("no instances of {name:?} found under {}", root.display());
        return Ok(());
    }
    for h in &headers {
        println!(
            "id={:<10} mode={:<8} file_mode={:<14} block_size={:<10} stripe_count={:<4} stripe_size={:<10} created={}",
            h.id, h.mode, h.file_mode, h.block_size, h.stripe_count, h.stripe_size, h.creation_time
        );
    }
    Ok(())
}

fn unlink(context_name: &str, roots: &[PathBuf], name: &str, id: u64, mode: RootSelectMode) -> Result<()> {
    let mut ctx = Context::new(context_name, Arc::new(SingleProcess));
    for root in roots {
        ctx.add_module(Module::new(root));
    }
    hio_posix::unlink::unlink_dataset(&ctx, name, id, mode).with_context(|| format!("unlinking {name:?} id {id}"))?;
    println!("unlinked {name:?} id {id}");
    Ok(())
}

fn dump_header(context_name: &str, root: &PathBuf, name: &str, id: u64) -> Result<()> {
    let ctx = Context::new(context_name, Arc::new(SingleProcess));
    let base_path = path::dataset_dir(root, &ctx.name, name, id);
    let top = path::top_manifest_path(&base_path);
    let header = Manifest::read_header(&top).with_context(|| format!("reading {}", top.display()))?;
    let json = serde_json::to_string_pretty(&header)?;
    println!("{json}");
    Ok(())
}

fn inspect_cache(context_name: &str, root: &PathBuf, name: &str, id: u64, max_open_files: usize) -> Result<()> {
    let ctx = Context::new(context_name, Arc::new(SingleProcess));
    let module = Module::new(root);
    let base_path = path::dataset_dir(root, &ctx.name, name, id);
    let header = Manifest::read_header(&path::top_manifest_path(&base_path))?;
    let mode = if header.mode == "unique" { Mode::Unique } else { Mode::Shared };
    let file_mode = EngineFileMode::parse(&header.file_mode).unwrap_or(EngineFileMode::Basic);

    let mut cfg = EngineConfig::default();
    cfg.max_open_files = max_open_files;
    cfg.dataset_file_mode = file_mode;

    let ds = Dataset::open(&ctx, &module, name, id, mode, DatasetFlags::READ, file_mode, &cfg)?;

    let manifest = Manifest::read(&path::top_manifest_path(&base_path))?;
    for elem_name in manifest.elements.keys() {
        let e = hio_posix::ElementHandle::new(elem_name.clone(), ctx.comm.rank());
        let _ = e.open(&ctx, &ds);
        let _ = e.read(&ctx, &ds, 0, 1);
    }

    let (occupied, capacity) = ds.cache_stats();
    println!("cache: {occupied}/{capacity} slots occupied across {} element(s)", manifest.elements.len());
    for err in ctx.drain_errors() {
        eprintln!("warning: {err}");
    }
    Ok(())
}
