//! Segment Map (§4.3): per-element ordered table of
//! `(logical_offset, length, file_id, physical_offset)` segments, with
//! offset -> segment translation.

use crate::path;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A single mapping from a logical element offset to a physical
/// `(file_id, physical_offset)` pair. `file_id` identifies the rank that
/// originally reserved the range, or `-1` for rank-local (BASIC mode)
/// files. Serialized as the 4-tuple the manifest JSON uses (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u32, i64, u64)", into = "(u64, u32, i64, u64)")]
pub struct Segment {
    pub logical_offset: u64,
    pub length: u32,
    pub file_id: i64,
    pub physical_offset: u64,
}

impl From<(u64, u32, i64, u64)> for Segment {
    fn from((logical_offset, length, file_id, physical_offset): (u64, u32, i64, u64)) -> Self {
        Self { logical_offset, length, file_id, physical_offset }
    }
}

impl From<Segment> for (u64, u32, i64, u64) {
    fn from(s: Segment) -> Self {
        (s.logical_offset, s.length, s.file_id, s.physical_offset)
    }
}

/// Result of a successful [`SegmentMap::translate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translated {
    pub file_id: i64,
    pub physical_offset: u64,
    pub actual_size: u64,
}

/// Ordered, per-element segment table (§3, §4.3). Appends are issue-order;
/// a rewrite of an existing logical range appends a new segment that
/// shadows the earlier one rather than mutating it in place (rule (ii)).
#[derive(Debug, Clone, Default)]
pub struct SegmentMap {
    segments: Vec<Segment>,
}

impl SegmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Appends a newly-reserved or newly-written segment (issue order,
    /// rule (i), §4.3).
    pub fn append(&mut self, segment: Segment) {
        debug_assert!(segment.length > 0, "segments must have length > 0 (§3 invariant)");
        self.segments.push(segment);
    }

    /// First segment covering `offset`, scanning most-recently-appended
    /// first so a shadowing rewrite wins (rule (ii)). Clips `actual_size`
    /// to both the segment's remaining length and `req_size`.
    pub fn translate(&self, offset: u64, req_size: u64) -> Option<Translated> {
        if req_size == 0 {
            return None;
        }
        self.segments.iter().rev().find_map(|seg| {
            let start = seg.logical_offset;
            let end = start + seg.length as u64;
            if offset >= start && offset < end {
                let remaining = end - offset;
                Some(Translated {
                    file_id: seg.file_id,
                    physical_offset: seg.physical_offset + (offset - start),
                    actual_size: remaining.min(req_size),
                })
            } else {
                None
            }
        })
    }

    /// The "most recent wins" view a reader should see: collapses shadowed
    /// byte ranges so no two returned segments overlap logically (§8
    /// property 2). Scans newest-to-oldest, keeping only the sub-ranges of
    /// each older segment not already claimed by a newer one.
    pub fn visible_segments(&self) -> Vec<Segment> {
        let mut claimed: Vec<(u64, u64)> = Vec::new();
        let mut visible: Vec<Segment> = Vec::new();
        for seg in self.segments.iter().rev() {
            let seg_start = seg.logical_offset;
            let seg_end = seg_start + seg.length as u64;
            let mut free_ranges = vec![(seg_start, seg_end)];
            for &claim in &claimed {
                free_ranges = free_ranges.into_iter().flat_map(|r| subtract_range(r, claim)).collect();
            }
            for (s, e) in free_ranges {
                if e > s {
                    visible.push(Segment {
                        logical_offset: s,
                        length: (e - s) as u32,
                        file_id: seg.file_id,
                        physical_offset: seg.physical_offset + (s - seg_start),
                    });
                }
            }
            claimed.push((seg_start, seg_end));
        }
        visible.sort_by_key(|s| s.logical_offset);
        visible
    }

    /// Builds a read-only translation from the legacy `<element>_block.<bid>`
    /// layout (§9 Open Question 2; SPEC_FULL §4.2 supplement), used only
    /// when a loaded manifest's own segment table is empty. `file_id` is
    /// set to the negated block id minus one so callers can recognize a
    /// legacy segment (`file_id < -1`) and route its translate result at
    /// the per-block path instead of the shared `data.<master>` file.
    /// Blocks are written contiguously from `bid = 0`; the scan stops at
    /// the first missing block id.
    pub fn from_legacy_blocks(base: &Path, element_name: &str, block_size: u64) -> Self {
        let mut segments = Vec::new();
        let mut bid = 0u64;
        loop {
            let block_path = path::legacy_block_path(base, element_name, bid);
            let Ok(meta) = std::fs::metadata(&block_path) else {
                break;
            };
            let len = meta.len();
            if len > 0 {
                segments.push(Segment {
                    logical_offset: bid * block_size,
                    length: len.min(u32::MAX as u64) as u32,
                    file_id: -2 - bid as i64,
                    physical_offset: 0,
                });
            }
            bid += 1;
        }
        Self { segments }
    }
}

fn subtract_range(a: (u64, u64), b: (u64, u64)) -> Vec<(u64, u64)> {
    let (a0, a1) = a;
    let (b0, b1) = b;
    if b1 <= a0 || b0 >= a1 {
        return vec![a];
    }
    let mut out = Vec::new();
    if a0 < b0 {
        out.push((a0, b0));
    }
    if b1 < a1 {
        out.push((b1, a1));
    }
    out
}
