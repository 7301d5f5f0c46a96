//! Configuration knobs the engine itself reads (§6). This is deliberately
//! not the full hio configuration-variable registry — that subsystem is a
//! non-goal (§1) — just the subset this crate consults.

use serde::{Deserialize, Serialize};
use std::env;

/// Physical layout (§3 "Module"/"Dataset instance"). `Strided` is only
/// legal with `Mode::Shared`; the dataset open path silently downgrades it
/// to `Basic` when requested with `Mode::Unique` (§3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    Basic,
    FilePerNode,
    Strided,
}

impl FileMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(FileMode::Basic),
            "file_per_node" => Some(FileMode::FilePerNode),
            "strided" => Some(FileMode::Strided),
            _ => None,
        }
    }

    /// Whether this mode concentrates writes into shared `data.<master>`
    /// files via the reservation engine, i.e. anything but `Basic`.
    pub fn is_optimised(self) -> bool {
        !matches!(self, FileMode::Basic)
    }
}

/// Knobs §6 lists as consumed by the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub dataset_file_mode: FileMode,
    pub dataset_block_size: u64,
    pub stripe_count: Option<u32>,
    pub stripe_size: Option<u64>,
    pub raid_level: u32,
    pub manifest_compression: bool,
    pub max_open_files: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dataset_file_mode: FileMode::Basic,
            dataset_block_size: 8 * 1024 * 1024,
            stripe_count: None,
            stripe_size: None,
            raid_level: 0,
            manifest_compression: false,
            max_open_files: crate::cache::DEFAULT_MAX_OPEN_FILES,
        }
    }
}

impl EngineConfig {
    /// Overrides defaults from `HIO_*` environment variables. Unset or
    /// unparsable variables are silently ignored, matching the original's
    /// "best effort" variable registry lookups.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("HIO_dataset_file_mode") {
            if let Some(m) = FileMode::parse(&v) {
                cfg.dataset_file_mode = m;
            }
        }
        if let Ok(v) = env::var("HIO_dataset_block_size") {
            if let Ok(n) = v.parse() {
                cfg.dataset_block_size = n;
            }
        }
        if let Ok(v) = env::var("HIO_stripe_count") {
            cfg.stripe_count = v.parse().ok();
        }
        if let Ok(v) = env::var("HIO_stripe_size") {
            cfg.stripe_size = v.parse().ok();
        }
        if let Ok(v) = env::var("HIO_raid_level") {
            if let Ok(n) = v.parse() {
                cfg.raid_level = n;
            }
        }
        if let Ok(v) = env::var("HIO_manifest_compression") {
            cfg.manifest_compression = matches!(v.as_str(), "1" | "true" | "yes");
        }
        cfg
    }
}
