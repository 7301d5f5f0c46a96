//! Deterministic name -> path mapping (§4.1). This is the only place the
//! on-disk directory scheme (§6) is encoded; every other component reaches
//! the filesystem only through these functions.

use crate::dataset::Mode;
use std::path::{Path, PathBuf};

/// `{root}/{context_name}.hio/{ds_name}/{ds_id}`
pub fn dataset_dir(root: &Path, context_name: &str, ds_name: &str, ds_id: u64) -> PathBuf {
    root.join(format!("{context_name}.hio")).join(ds_name).join(ds_id.to_string())
}

/// Element path: `element_data.{name}` in BASIC+SHARED, or
/// `element_data.{name}.{rank:05}` (zero-padded decimal) in BASIC+UNIQUE.
pub fn element_path(base: &Path, element_name: &str, mode: Mode, rank: i32) -> PathBuf {
    match mode {
        Mode::Shared => base.join(format!("element_data.{element_name}")),
        Mode::Unique => base.join(format!("element_data.{element_name}.{rank:05}")),
    }
}

/// Physical data file for non-basic file modes: `data.<master_rank:x>`
/// (lowercase hex).
pub fn data_file_path(base: &Path, master_rank: i32) -> PathBuf {
    base.join(format!("data.{master_rank:x}"))
}

/// Per-rank manifest, optimised mode only: `manifest.<rank:x>.json[.bz2]`.
/// Rank hex is lowercase with no leading zeros.
pub fn rank_manifest_path(base: &Path, rank: i32, compressed: bool) -> PathBuf {
    let name = if compressed {
        format!("manifest.{rank:x}.json.bz2")
    } else {
        format!("manifest.{rank:x}.json")
    };
    base.join(name)
}

/// Inverse of [`rank_manifest_path`]'s file-name component, used by the
/// node-leader merge scan (§4.7 step 6) and by [`crate::list`].
pub fn parse_rank_manifest_name(name: &str) -> Option<(i32, bool)> {
    let rest = name.strip_prefix("manifest.")?;
    let (hex, compressed) = match rest.strip_suffix(".json.bz2") {
        Some(h) => (h, true),
        None => (rest.strip_suffix(".json")?, false),
    };
    i32::from_str_radix(hex, 16).ok().map(|rank| (rank, compressed))
}

/// Top-level manifest: `manifest.json`, never compressed.
pub fn top_manifest_path(base: &Path) -> PathBuf {
    base.join("manifest.json")
}

/// Legacy per-block element layout, preserved read-only (§9 Open Question
/// 2; SPEC_FULL §4.2 supplement): `<element>_block.<bid>`.
pub fn legacy_block_path(base: &Path, element_name: &str, block_id: u64) -> PathBuf {
    base.join(format!("{element_name}_block.{block_id}"))
}
