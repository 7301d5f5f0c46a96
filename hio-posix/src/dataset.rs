//! Dataset instance (§3) and its open/close lifecycle (§4.7).

use crate::cache::OpenFileCache;
use crate::config::{EngineConfig, FileMode};
use crate::context::{Context, Module};
use crate::element::ElementState;
use crate::error::{ErrorKind, HioError, Result};
use crate::fs_probe::{self, FsAttrs};
use crate::manifest::Manifest;
use crate::path;
use crate::reservation::{ReservationState, SharedControl};
use crate::segment::SegmentMap;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Offset-space semantics (§3 Glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unique,
    Shared,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DatasetFlags: u32 {
        const READ     = 0b0000_0001;
        const WRITE    = 0b0000_0010;
        const CREATE   = 0b0000_0100;
        const TRUNCATE = 0b0000_1000;
        const APPEND   = 0b0001_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Open,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub write_usec: u64,
    pub read_usec: u64,
}

/// Per-dataset open-element table and the mutable state the dataset mutex
/// (§5) protects.
pub(crate) struct DatasetInner {
    pub cache: OpenFileCache,
    pub counters: Counters,
    pub elements: HashMap<(String, i32), ElementState>,
    pub reservation: Option<ReservationState>,
    /// This rank's own contribution, written back at close.
    pub local_manifest: Manifest,
    /// Segment maps hydrated from other ranks' manifests at open, used on
    /// read-miss against the local element map (§4.3 "secondary map").
    pub dataset_map: HashMap<String, SegmentMap>,
}

/// A `(module, name, id)` dataset instance (§3).
pub struct Dataset {
    pub name: String,
    pub id: u64,
    pub mode: Mode,
    pub flags: DatasetFlags,
    pub file_mode: FileMode,
    pub block_size: u64,
    pub stripe_count: u32,
    pub stripe_size: u64,
    pub base_path: std::path::PathBuf,
    pub manifest_compression: bool,
    pub status: Mutex<Status>,
    pub open_time: Option<String>,
    pub shared_control: Option<Arc<SharedControl>>,
    /// The rank whose id labels the shared `data.<master_rank>` file this
    /// dataset's ranks concentrate writes into (§3 Glossary "Master rank";
    /// §4.1 physical data file naming). Unused in `Basic` mode, where every
    /// element owns its own file instead.
    pub master_rank: i32,
    inner: Mutex<DatasetInner>,
}

impl Dataset {
    /// Drives the open state machine (§4.7 "Open", steps 1-7).
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        ctx: &Context,
        module: &Module,
        name: &str,
        id: u64,
        mode: Mode,
        flags: DatasetFlags,
        requested_file_mode: FileMode,
        cfg: &EngineConfig,
    ) -> Result<Dataset> {
        logged(ctx, Self::open_inner(ctx, module, name, id, mode, flags, requested_file_mode, cfg))
    }

    #[allow(clippy::too_many_arguments)]
    fn open_inner(
        ctx: &Context,
        module: &Module,
        name: &str,
        id: u64,
        mode: Mode,
        flags: DatasetFlags,
        requested_file_mode: FileMode,
        cfg: &EngineConfig,
    ) -> Result<Dataset> {
        let rank = ctx.comm.rank();
        let base_path = path::dataset_dir(&module.data_root, &ctx.name, name, id);

        // step 2: truncate-reopen unlinks first, rank 0 only.
        if flags.contains(DatasetFlags::TRUNCATE) && rank == 0 {
            match crate::unlink::unlink_dir(&base_path) {
                Ok(()) | Err(HioError { kind: ErrorKind::NotFound, .. }) => {}
                Err(e) => return Err(e),
            }
        }
        ctx.comm.barrier();

        // step 3/4/5: pick the physical layout, then create-or-read the
        // header, scattering it to every rank. Table A only applies to a
        // fresh instance; reopening an existing one must honor the
        // block_size/stripe_count/stripe_size the instance was actually
        // created with, which live in the manifest header rank 0 just read
        // (§4.7 step 4; §6 lists these as persisted header fields, not
        // re-derived ones), not whatever a fresh probe/Table A run would
        // pick today.
        let fs_attrs = fs_probe::probe(&module.data_root);
        let world_too_small = ctx.comm.size() < 2;

        let (mut file_mode, mut block_size, mut stripe_count, mut stripe_size, local_manifest) =
            if flags.contains(DatasetFlags::CREATE) {
                let file_mode = downgrade_strided_if_unique(requested_file_mode, mode);
                let block_size = cfg.dataset_block_size;
                let (stripe_count, stripe_size) =
                    table_a_defaults(file_mode, mode, &fs_attrs, ctx.comm.shared_size(), cfg);
                if rank == 0 {
                    std::fs::create_dir_all(&base_path).map_err(|e| HioError::from_io_path(e, &base_path))?;
                    log::debug!("posix: created dataset directory {}", base_path.display());
                }
                let manifest =
                    Manifest::new(rank, name, id, mode_name(mode), &file_mode_name(file_mode), block_size, stripe_count, stripe_size);
                (file_mode, block_size, stripe_count, stripe_size, manifest)
            } else {
                let header_bytes = if rank == 0 {
                    let top = path::top_manifest_path(&base_path);
                    let bytes = Manifest::read(&top)?.serialize()?;
                    Some(bytes)
                } else {
                    None
                };
                let bytes = ctx.comm.broadcast(header_bytes);
                let mut m = Manifest::parse(&bytes)?;
                m.rank = rank;
                let file_mode = FileMode::parse(&m.file_mode).unwrap_or(FileMode::Basic);
                (file_mode, m.block_size, m.stripe_count, m.stripe_size, m)
            };
        ctx.comm.barrier(); // (d): no rank proceeds past scatter until the header lands

        // Establishing the shared control block is an in-process Arc
        // allocation here (design note 9), not an OS/filesystem capability,
        // so it depends only on world size, never on `fs_attrs.kind` -
        // striping *defaults* (Table A) are conservative off Lustre/GPFS,
        // but the reservation control block itself is unconditional.
        let shared_control = if file_mode.is_optimised() && !world_too_small {
            Some(SharedControl::attach(&base_path, stripe_count.max(1) as usize))
        } else {
            None
        };
        if file_mode.is_optimised() && shared_control.is_none() {
            log::warn!("posix: downgrading dataset {name} to basic file mode (world_size < 2 or no shared control block)");
            file_mode = FileMode::Basic;
            stripe_count = 1;
            stripe_size = fs_attrs.stripe_unit;
        }
        if file_mode.is_optimised() {
            block_size = block_size.max(stripe_size);
        }

        // The master rank labels the single shared `data.<master_rank>`
        // file a group of ranks concentrates writes into (§3 Glossary,
        // §4.1). STRIDED interleaves every rank in the dataset communicator
        // across one file; FILE_PER_NODE interleaves only the ranks sharing
        // a node, led by that node's leader. `my_stripe` is this rank's
        // position within the group that shares a master, wrapped to the
        // configured stripe count (§4.5 "my_stripe is constant for a rank
        // within a dataset-open").
        let shared_rank = ctx.comm.shared_rank();
        let (master_rank, my_stripe) = match file_mode {
            FileMode::Strided => (0, rank as usize % stripe_count.max(1) as usize),
            FileMode::FilePerNode => (rank - shared_rank, shared_rank as usize % stripe_count.max(1) as usize),
            FileMode::Basic => (rank, 0),
        };

        // A recognized striping filesystem gets the shared data file's
        // layout fixed at creation time, before the open-file cache's lazy
        // `open()` ever touches it (§4.10 "stripe-directed open"); only the
        // rank owning this master file issues the call.
        if flags.contains(DatasetFlags::CREATE) && file_mode.is_optimised() && fs_attrs.supports_striping && rank == master_rank {
            let data_path = path::data_file_path(&base_path, master_rank);
            module
                .open_hook
                .stripe_directed_create(&data_path, stripe_count, stripe_size)
                .map_err(|e| HioError::from_io_path(e, &data_path))?;
        }

        // step 6: optimised, non-create opens hydrate a cross-rank map from
        // every per-rank manifest the node leader can see, then broadcasts
        // the merged bytes so every rank - not only the leader - ends up
        // with the same secondary lookup table (§4.7 step 6).
        let mut dataset_map = HashMap::new();
        if !flags.contains(DatasetFlags::CREATE) && file_mode.is_optimised() {
            let leader_bytes = if ctx.comm.is_leader() {
                let mut accum =
                    Manifest::new(rank, name, id, mode_name(mode), &file_mode_name(file_mode), block_size, stripe_count, stripe_size);
                if let Ok(entries) = std::fs::read_dir(&base_path) {
                    let mut rank_manifest_names: Vec<_> = entries
                        .flatten()
                        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                        .filter(|fname| path::parse_rank_manifest_name(fname).is_some())
                        .collect();
                    rank_manifest_names.sort();
                    for fname in rank_manifest_names {
                        if let Ok(remote) = Manifest::read(&base_path.join(&fname)) {
                            Manifest::merge(&mut accum, &remote);
                        }
                    }
                }
                Some(accum.serialize()?)
            } else {
                None
            };
            let merged = ctx.comm.broadcast(leader_bytes);
            if !merged.is_empty() {
                if let Ok(accum) = Manifest::parse(&merged) {
                    for (elem, segs) in accum.elements {
                        dataset_map.insert(elem, SegmentMap::from_segments(segs));
                    }
                }
            }
        }

        Ok(Dataset {
            name: name.to_string(),
            id,
            mode,
            flags,
            file_mode,
            block_size,
            stripe_count,
            stripe_size,
            base_path,
            manifest_compression: cfg.manifest_compression,
            status: Mutex::new(Status::Open),
            open_time: Some(chrono::Utc::now().to_rfc3339()),
            shared_control: shared_control.clone(),
            master_rank,
            inner: Mutex::new(DatasetInner {
                cache: OpenFileCache::new(cfg.max_open_files),
                counters: Counters::default(),
                elements: HashMap::new(),
                reservation: shared_control.map(|sc| ReservationState::new(sc, block_size, my_stripe)),
                local_manifest,
                dataset_map,
            }),
        })
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut DatasetInner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        f(&mut guard)
    }

    pub fn counters(&self) -> Counters {
        self.inner.lock().unwrap().counters
    }

    /// `(occupied, capacity)` of the open-file cache (§4.4), exposed for
    /// admin/diagnostic tooling such as `hioctl inspect-cache`.
    pub fn cache_stats(&self) -> (usize, usize) {
        self.with_inner(|inner| (inner.cache.occupied_count(), inner.cache.capacity()))
    }

    /// Drives the close state machine (§4.7 "Close", steps 1-5). Returns
    /// the collective return code every rank observes identically.
    pub fn close(&self, ctx: &Context) -> Result<()> {
        *self.status.lock().unwrap() = Status::Closing;
        let rank = ctx.comm.rank();

        let local_rc = self.close_local(ctx);
        let local_code = match &local_rc {
            Ok(()) => 0,
            Err(e) => -(e.kind.severity() + 1),
        };
        let collective_code = ctx.comm.allreduce_min(local_code);

        *self.status.lock().unwrap() = if collective_code == 0 { Status::Closed } else { Status::Failed };

        let result = if collective_code == 0 {
            Ok(())
        } else {
            local_rc.or(Err(HioError::new(ErrorKind::Generic, rank, "dataset.close").with_detail("a peer rank reported failure")))
        };
        logged(ctx, result)
    }

    fn close_local(&self, ctx: &Context) -> Result<()> {
        let rank = ctx.comm.rank();

        // step 2: under the per-stripe mutex (if this instance has shared
        // control at all), close every open-file slot, so a concurrent
        // rank's in-flight transfer through the same stripe can't observe a
        // half-closed handle.
        {
            let _stripe_guards = self.shared_control.as_ref().map(|sc| sc.lock_all_stripes());
            self.with_inner(|inner| inner.cache.close_all());
        }

        if self.flags.contains(DatasetFlags::WRITE) {
            self.with_inner(|inner| -> Result<()> {
                for ((elem_name, elem_rank), state) in inner.elements.iter() {
                    if *elem_rank == rank {
                        for seg in state.segments.segments() {
                            inner.local_manifest.record(elem_name, *seg);
                        }
                    }
                }

                if self.file_mode.is_optimised() {
                    let p = path::rank_manifest_path(&self.base_path, rank, self.manifest_compression);
                    let bytes = inner.local_manifest.serialize()?;
                    Manifest::save(&bytes, &p)?;
                }
                Ok(())
            })?;

            // step 3: gather every rank's own segment contribution to rank 0
            // and merge it into the top-level manifest, the way the
            // original's `hioi_dataset_gather_manifest` does. This runs
            // regardless of file mode: BASIC mode never writes a per-rank
            // manifest file at all, so the collective gather is the only
            // place a rank >= 1's segments are ever persisted.
            let local_bytes = self.with_inner(|inner| inner.local_manifest.serialize())?;
            let gathered = ctx.comm.gather(&local_bytes);
            if rank == 0 {
                let mut accum = self.with_inner(|inner| inner.local_manifest.clone());
                for bytes in gathered.iter().skip(1) {
                    if let Ok(remote) = Manifest::parse(bytes) {
                        Manifest::merge(&mut accum, &remote);
                    }
                }
                let top = path::top_manifest_path(&self.base_path);
                let out = accum.serialize()?;
                Manifest::save(&out, &top)?;
            }
        }
        Ok(())
    }
}

/// Runs a fallible dataset/element operation and mirrors any error into
/// `ctx`'s process-wide error queue (§7) before propagating it, so a caller
/// that only checks `drain_errors` later still observes every failure.
pub(crate) fn logged<T>(ctx: &Context, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        ctx.error_log.push(e.clone());
    }
    result
}

fn file_mode_name(fm: FileMode) -> String {
    match fm {
        FileMode::Basic => "basic".into(),
        FileMode::FilePerNode => "file_per_node".into(),
        FileMode::Strided => "strided".into(),
    }
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Unique => "unique",
        Mode::Shared => "shared",
    }
}

fn downgrade_strided_if_unique(requested: FileMode, mode: Mode) -> FileMode {
    if requested == FileMode::Strided && mode == Mode::Unique {
        log::warn!("posix: STRIDED is only legal with SHARED mode; downgrading to BASIC");
        FileMode::Basic
    } else {
        requested
    }
}

/// Table A (§4.7): striping defaults when the filesystem supports it.
fn table_a_defaults(file_mode: FileMode, mode: Mode, fs: &FsAttrs, shared_size: i32, cfg: &EngineConfig) -> (u32, u64) {
    if !fs.supports_striping {
        return (1, fs.stripe_unit);
    }
    let (mut count, mut size) = match (file_mode, mode) {
        (FileMode::Basic, _) => (1, fs.stripe_unit),
        (_, Mode::Shared) => (((0.9 * fs.stripe_max_count as f64).round() as u32).max(1), 1u64 << 24),
        (_, Mode::Unique) => ((shared_size.max(1) as u32).min(fs.stripe_max_count), 1u64 << 24),
    };
    if let Some(c) = cfg.stripe_count {
        count = c;
    }
    if let Some(s) = cfg.stripe_size {
        size = s;
    }
    count = count.min(fs.stripe_max_count).max(1);
    let rem = size % fs.stripe_unit;
    if rem != 0 {
        size += fs.stripe_unit - rem;
    }
    size = size.min(fs.stripe_max_size);
    (count, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcess;
    use crate::config::EngineConfig;
    use crate::context::{Context, Module};
    use std::sync::Arc;

    fn ctx() -> Context {
        Context::new("app", Arc::new(SingleProcess))
    }

    #[test]
    fn strided_with_unique_downgrades_to_basic() {
        assert_eq!(downgrade_strided_if_unique(FileMode::Strided, Mode::Unique), FileMode::Basic);
        assert_eq!(downgrade_strided_if_unique(FileMode::Strided, Mode::Shared), FileMode::Strided);
    }

    #[test]
    fn single_process_open_downgrades_optimised_modes_to_basic() {
        let td = tempfile::tempdir().unwrap();
        let context = ctx();
        let module = Module::new(td.path());
        let cfg = EngineConfig::default();
        let ds = Dataset::open(
            &context,
            &module,
            "restart",
            42,
            Mode::Shared,
            DatasetFlags::CREATE | DatasetFlags::WRITE,
            FileMode::Strided,
            &cfg,
        )
        .unwrap();
        // world_size == 1, so the optimised request downgrades.
        assert_eq!(ds.file_mode, FileMode::Basic);
        assert!(ds.shared_control.is_none());
    }

    #[test]
    fn multi_rank_open_establishes_shared_control_on_an_ordinary_filesystem() {
        // Regression test: establishing the reservation control block must
        // not depend on `fs_attrs.kind` (tempdirs probe as `FsKind::Generic`
        // on every CI machine that isn't backed by Lustre/GPFS); only world
        // size gates it (§4.7 step 7).
        let td = tempfile::tempdir().unwrap();
        let fleet = crate::comm::ThreadCommunicator::fleet(2);
        let base = td.path().to_path_buf();
        let handles: Vec<_> = fleet
            .into_iter()
            .map(|comm| {
                let base = base.clone();
                std::thread::spawn(move || {
                    let context = Context::new("app", Arc::new(comm));
                    let module = Module::new(base.as_path());
                    let cfg = EngineConfig::default();
                    let ds = Dataset::open(
                        &context,
                        &module,
                        "restart",
                        1,
                        Mode::Shared,
                        DatasetFlags::CREATE | DatasetFlags::WRITE,
                        FileMode::Strided,
                        &cfg,
                    )
                    .unwrap();
                    assert_eq!(ds.file_mode, FileMode::Strided);
                    assert!(ds.shared_control.is_some());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn create_open_writes_base_directory() {
        let td = tempfile::tempdir().unwrap();
        let context = ctx();
        let module = Module::new(td.path());
        let cfg = EngineConfig::default();
        let ds = Dataset::open(
            &context,
            &module,
            "restart",
            1,
            Mode::Shared,
            DatasetFlags::CREATE | DatasetFlags::WRITE,
            FileMode::Basic,
            &cfg,
        )
        .unwrap();
        assert!(ds.base_path.is_dir());
    }

    #[test]
    fn close_on_write_dataset_produces_top_manifest() {
        let td = tempfile::tempdir().unwrap();
        let context = ctx();
        let module = Module::new(td.path());
        let cfg = EngineConfig::default();
        let ds = Dataset::open(
            &context,
            &module,
            "restart",
            7,
            Mode::Shared,
            DatasetFlags::CREATE | DatasetFlags::WRITE,
            FileMode::Basic,
            &cfg,
        )
        .unwrap();
        ds.close(&context).unwrap();
        assert!(path::top_manifest_path(&ds.base_path).is_file());
    }

    #[test]
    fn failed_open_is_recorded_in_the_context_error_log() {
        let td = tempfile::tempdir().unwrap();
        let context = ctx();
        // points at a data root that cannot be created (file in the way).
        let blocker = td.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let module = Module::new(blocker.join("nested"));
        let cfg = EngineConfig::default();
        let err = Dataset::open(
            &context,
            &module,
            "restart",
            1,
            Mode::Shared,
            DatasetFlags::CREATE | DatasetFlags::WRITE,
            FileMode::Basic,
            &cfg,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IoPermanent);
        let drained = context.drain_errors();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].kind, ErrorKind::IoPermanent);
    }
}
