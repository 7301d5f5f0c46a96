//! Manifest Codec (§4.2): JSON (optionally bzip2-compressed) per-element
//! segment tables, plus the per-rank / top-level header fields (§6).

use crate::error::{HioError, Result};
use crate::segment::Segment;
use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Fields every manifest carries regardless of element content (§6: "name,
/// id, mode, file_mode, block_size, stripe_count, stripe_size,
/// creation_time"). Defined without the `segments` map so callers can
/// deserialize only the header: serde_json ignores the unknown `elements`
/// field rather than erroring, giving us "read just the header" for free.
/// `rank` is carried too (not a §6 field) since it identifies which per-rank
/// manifest this is, needed by the node-leader merge and by `Manifest::new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub name: String,
    pub id: u64,
    pub mode: String,
    pub file_mode: String,
    pub block_size: u64,
    pub stripe_count: u32,
    pub stripe_size: u64,
    pub creation_time: String,
    #[serde(default)]
    pub rank: i32,
}

/// A full manifest: header fields plus the per-element segment tables
/// (§4.2, §6). Keyed by element name; `BTreeMap` keeps serialized output
/// stable across merges, which matters for property 8 (idempotent merge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub id: u64,
    pub mode: String,
    pub file_mode: String,
    pub block_size: u64,
    pub stripe_count: u32,
    pub stripe_size: u64,
    pub creation_time: String,
    #[serde(default)]
    pub rank: i32,
    #[serde(default)]
    pub elements: BTreeMap<String, Vec<Segment>>,
}

impl Manifest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rank: i32,
        name: &str,
        id: u64,
        mode: &str,
        file_mode: &str,
        block_size: u64,
        stripe_count: u32,
        stripe_size: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            id,
            mode: mode.to_string(),
            file_mode: file_mode.to_string(),
            block_size,
            stripe_count,
            stripe_size,
            creation_time: chrono::Utc::now().to_rfc3339(),
            rank,
            elements: BTreeMap::new(),
        }
    }

    pub fn header(&self) -> ManifestHeader {
        ManifestHeader {
            name: self.name.clone(),
            id: self.id,
            mode: self.mode.clone(),
            file_mode: self.file_mode.clone(),
            block_size: self.block_size,
            stripe_count: self.stripe_count,
            stripe_size: self.stripe_size,
            creation_time: self.creation_time.clone(),
            rank: self.rank,
        }
    }

    pub fn segments_for(&self, element_name: &str) -> Option<&[Segment]> {
        self.elements.get(element_name).map(Vec::as_slice)
    }

    pub fn record(&mut self, element_name: &str, segment: Segment) {
        self.elements.entry(element_name.to_string()).or_default().push(segment);
    }

    /// Parses a manifest from already-decompressed JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| HioError::manifest_parse(format!("invalid manifest JSON: {e}")))
    }

    /// Serializes to JSON bytes (never compressed; callers decide whether
    /// to wrap the result with bzip2 before writing, per §6's per-write
    /// compression toggle).
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| HioError::manifest_parse(format!("cannot serialize manifest: {e}")))
    }

    /// Reads and parses a manifest file, transparently decompressing
    /// `.json.bz2` files by extension.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = read_possibly_compressed(path)?;
        Self::parse(&bytes)
    }

    /// Reads just the header fields, skipping segment-table materialization.
    pub fn read_header(path: &Path) -> Result<ManifestHeader> {
        let bytes = read_possibly_compressed(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| HioError::manifest_parse(format!("invalid manifest header: {e}")))
    }

    /// Writes `bytes` to `path`, compressing with bzip2 first when `path`
    /// ends in `.bz2` (§6). Written to a sibling temp path first and moved
    /// into place with `rename`, so a concurrent reader (e.g. another rank
    /// listing instances while this one closes) always sees either the
    /// previous complete manifest or the new one, never a partial write
    /// (§4.2 "save").
    pub fn save(bytes: &[u8], path: &Path) -> Result<()> {
        let compressed = path.extension().and_then(|e| e.to_str()) == Some("bz2");
        let payload = if compressed {
            let mut encoder = BzEncoder::new(bytes, Compression::default());
            let mut out = Vec::new();
            encoder.read_to_end(&mut out).map_err(|e| HioError::from_io_path(e, path))?;
            out
        } else {
            bytes.to_vec()
        };

        let tmp_path = tmp_sibling_path(path);
        {
            let mut file = File::create(&tmp_path).map_err(|e| HioError::from_io_path(e, &tmp_path))?;
            file.write_all(&payload).map_err(|e| HioError::from_io_path(e, &tmp_path))?;
            file.sync_all().map_err(|e| HioError::from_io_path(e, &tmp_path))?;
        }
        std::fs::rename(&tmp_path, path).map_err(|e| HioError::from_io_path(e, path))?;
        Ok(())
    }

    /// Combines `addition`'s element segment tables into `accum` (§4.7 step
    /// 6, node-leader merge; §8 property 8, "merge is idempotent and
    /// commutative on the visible view"). Segments are concatenated in
    /// argument order so later callers' writes still shadow earlier ones
    /// through [`crate::segment::SegmentMap`]'s append-order semantics; the
    /// per-element vector is deduplicated so re-merging the same addition
    /// twice doesn't grow it.
    pub fn merge(accum: &mut Manifest, addition: &Manifest) {
        for (name, segs) in &addition.elements {
            let entry = accum.elements.entry(name.clone()).or_default();
            for seg in segs {
                if !entry.contains(seg) {
                    entry.push(*seg);
                }
            }
        }
    }
}

fn tmp_sibling_path(path: &Path) -> std::path::PathBuf {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("manifest");
    path.with_file_name(format!(".{file_name}.tmp"))
}

fn read_possibly_compressed(path: &Path) -> Result<Vec<u8>> {
    let raw = std::fs::read(path).map_err(|e| HioError::from_io_path(e, path))?;
    if path.extension().and_then(|e| e.to_str()) == Some("bz2") {
        let mut decoder = BzDecoder::new(&raw[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| HioError::manifest_parse(format!("corrupt bzip2 manifest {}: {e}", path.display())))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}
