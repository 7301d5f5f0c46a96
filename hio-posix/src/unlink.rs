//! Unlink (§4.8): depth-first, physical-only tree removal of a dataset
//! instance directory, executed by rank 0 only, with a policy for how far
//! across registered modules the removal is retried.

use crate::context::{Context, Module, RootSelectMode};
use crate::dataset::logged;
use crate::error::{ErrorKind, HioError, Result};
use crate::path;
use std::path::Path;

/// Removes `dir` and everything under it. Missing-directory is reported as
/// `NOT_FOUND` rather than treated as success, so the multi-module caller
/// in [`unlink_dataset`] can fall through to the next module under `FIRST`
/// or `ALL` policy.
pub fn unlink_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(HioError::new(ErrorKind::NotFound, 0, "unlink.dir").with_path(dir))
        }
        Err(e) => Err(crate::error::from_io_error(0, "unlink.dir", &e).with_path(dir)),
    }
}

/// Collectively requested but executed by rank 0 only: resolves the
/// instance directory through the Path Builder and removes it, applying
/// `mode` across the context's registered modules (§4.8).
pub fn unlink_dataset(ctx: &Context, name: &str, id: u64, mode: RootSelectMode) -> Result<()> {
    let rank = ctx.comm.rank();
    let result = if rank == 0 {
        ctx.select_module(mode, |module: &Module| {
            let dir = path::dataset_dir(&module.data_root, &ctx.name, name, id);
            unlink_dir(&dir)
        })
    } else {
        Ok(())
    };
    ctx.comm.barrier();
    logged(ctx, result)
}
