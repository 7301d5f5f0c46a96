//! Element (§3) and the I/O Path (§4.6): strided read/write around the
//! translate -> open -> seek -> transfer loop.

use crate::context::Context;
use crate::dataset::{logged, Dataset, DatasetFlags, Mode};
use crate::error::{from_io_error, ErrorKind, HioError, Result};
use crate::path;
use crate::segment::{Segment, SegmentMap};
use std::io::{Read, Seek, SeekFrom, Write};

/// Per-element mutable state (§3 "Element"), living inside the dataset's
/// element table under the dataset mutex.
pub(crate) struct ElementState {
    pub size: u64,
    pub segments: SegmentMap,
}

/// Cheap, `Copy`-able capability referring to one element of one dataset
/// (design note: the original's heavyweight element object becomes an
/// identifier; the mutable state it names lives in the dataset, under the
/// dataset's own mutex, per §5's concurrency model).
#[derive(Debug, Clone)]
pub struct ElementHandle {
    pub name: String,
    pub rank: i32,
}

/// Outcome of a single `write`/`read` call: total bytes transferred before
/// either completing or hitting a short transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub bytes: u64,
    pub short: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Write,
    Read,
}

impl ElementHandle {
    pub fn new(name: impl Into<String>, rank: i32) -> Self {
        Self { name: name.into(), rank }
    }

    /// Registers the element in the dataset's table if this is the first
    /// reference, opening its direct file handle in BASIC mode (§4.7
    /// element open path).
    pub fn open(&self, ctx: &Context, dataset: &Dataset) -> Result<()> {
        logged(ctx, self.open_inner(dataset))
    }

    fn open_inner(&self, dataset: &Dataset) -> Result<()> {
        dataset.with_inner(|inner| -> Result<()> {
            let key = (self.name.clone(), self.rank);
            if inner.elements.contains_key(&key) {
                return Ok(());
            }
            // BASIC mode maps the element directly onto one physical file;
            // all actual I/O still goes through the open-file cache
            // (`plan_one`/`transfer`), so opening a handle here would only
            // be a second, unused one onto the same path. `size` needs
            // nothing more than a stat.
            let size = if !dataset.file_mode.is_optimised() {
                let p = path::element_path(&dataset.base_path, &self.name, dataset.mode, self.rank);
                std::fs::metadata(&p).map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };
            // This rank's own segments come from the manifest already
            // loaded at dataset open (hydrated during scatter, §4.7 step
            // 5); `dataset_map` supplies the secondary cross-rank lookup
            // consulted only on a read-miss (§4.3), not the primary table.
            let own_segments = inner.local_manifest.segments_for(&self.name).map(<[_]>::to_vec).unwrap_or_default();
            let segments = if !own_segments.is_empty() || dataset.flags.contains(DatasetFlags::CREATE) {
                SegmentMap::from_segments(own_segments)
            } else {
                // §9 Open Question 2: a pre-existing instance whose segment
                // table is empty may predate the segment-table format;
                // fall back to scanning the legacy per-block layout
                // read-only.
                let legacy = SegmentMap::from_legacy_blocks(&dataset.base_path, &self.name, dataset.block_size);
                if legacy.is_empty() && !dataset.file_mode.is_optimised() && size > 0 {
                    // The top manifest only ever holds what rank 0 gathered
                    // at the writer's close (§4.7 close step 3); a BASIC
                    // element file that exists on disk always holds exactly
                    // this rank's own prior writes regardless of whether
                    // that gather reached this rank's contribution, so its
                    // size alone is enough to reconstruct the one segment
                    // covering it.
                    SegmentMap::from_segments(vec![Segment {
                        logical_offset: 0,
                        length: size.min(u32::MAX as u64) as u32,
                        file_id: -1,
                        physical_offset: 0,
                    }])
                } else {
                    legacy
                }
            };
            inner.elements.insert(key, ElementState { size, segments });
            Ok(())
        })
    }

    /// Writes `buf` at logical `offset`, looping chunk by chunk and
    /// consulting reservation on a write-miss (§4.6).
    pub fn write(&self, ctx: &Context, dataset: &Dataset, offset: u64, buf: &[u8]) -> Result<TransferOutcome> {
        logged(ctx, self.write_inner(dataset, offset, buf))
    }

    fn write_inner(&self, dataset: &Dataset, offset: u64, buf: &[u8]) -> Result<TransferOutcome> {
        if !dataset.flags.contains(DatasetFlags::WRITE) {
            return Err(HioError::new(ErrorKind::Perm, self.rank, "element.write").with_detail("dataset not opened for write"));
        }
        let (outcome, _) = self.transfer(dataset, offset, buf.len() as u64, Direction::Write, Some(buf))?;
        Ok(outcome)
    }

    /// Reads up to `len` bytes starting at logical `offset` (§4.6).
    pub fn read(&self, ctx: &Context, dataset: &Dataset, offset: u64, len: u64) -> Result<Vec<u8>> {
        logged(ctx, self.read_inner(dataset, offset, len))
    }

    fn read_inner(&self, dataset: &Dataset, offset: u64, len: u64) -> Result<Vec<u8>> {
        if !dataset.flags.contains(DatasetFlags::READ) {
            return Err(HioError::new(ErrorKind::Perm, self.rank, "element.read").with_detail("dataset not opened for read"));
        }
        let (_, bytes) = self.transfer(dataset, offset, len, Direction::Read, None)?;
        Ok(bytes)
    }

    fn transfer(
        &self,
        dataset: &Dataset,
        mut offset: u64,
        chunk_size: u64,
        direction: Direction,
        src: Option<&[u8]>,
    ) -> Result<(TransferOutcome, Vec<u8>)> {
        if chunk_size == 0 {
            return Ok((TransferOutcome { bytes: 0, short: false }, Vec::new()));
        }

        let mut remaining = chunk_size;
        let mut total = 0u64;
        let mut read_out: Vec<u8> = Vec::new();

        while remaining > 0 {
            let requested = remaining;
            let plan = dataset.with_inner(|inner| -> Result<TransferPlan> {
                self.plan_one(dataset, inner, offset, requested, direction)
            })?;

            let (n, read_chunk) = dataset.with_inner(|inner| -> Result<(u64, Vec<u8>)> {
                let file = inner
                    .cache
                    .get(plan.file_id, &plan.path, direction == Direction::Write, self.rank)?;
                file.seek(SeekFrom::Start(plan.physical_offset))
                    .map_err(|e| from_io_error(self.rank, "element.seek", &e).with_path(&plan.path))?;
                match direction {
                    Direction::Write => {
                        let chunk = &src.unwrap()[(chunk_size - remaining) as usize..][..plan.actual_size as usize];
                        let n = file.write(chunk).map_err(|e| from_io_error(self.rank, "element.write", &e).with_path(&plan.path))? as u64;
                        Ok((n, Vec::new()))
                    }
                    Direction::Read => {
                        let mut tmp = vec![0u8; plan.actual_size as usize];
                        let n = file
                            .read(&mut tmp)
                            .map_err(|e| from_io_error(self.rank, "element.read", &e).with_path(&plan.path))?
                            as u64;
                        tmp.truncate(n as usize);
                        Ok((n, tmp))
                    }
                }
            })?;
            read_out.extend_from_slice(&read_chunk);

            if direction == Direction::Write {
                dataset.with_inner(|inner| {
                    let key = (self.name.clone(), self.rank);
                    if let Some(state) = inner.elements.get_mut(&key) {
                        state.segments.append(Segment {
                            logical_offset: offset,
                            length: n as u32,
                            file_id: plan.file_id,
                            physical_offset: plan.physical_offset,
                        });
                        state.size = state.size.max(offset + n);
                    }
                    inner.counters.bytes_written += n;
                });
            } else {
                dataset.with_inner(|inner| inner.counters.bytes_read += n);
            }

            total += n;
            if n < plan.actual_size {
                return Ok((TransferOutcome { bytes: total, short: true }, read_out));
            }
            remaining -= n;
            offset += n;
        }

        Ok((TransferOutcome { bytes: total, short: false }, read_out))
    }

    fn plan_one(
        &self,
        dataset: &Dataset,
        inner: &mut crate::dataset::DatasetInner,
        offset: u64,
        requested: u64,
        direction: Direction,
    ) -> Result<TransferPlan> {
        let key = (self.name.clone(), self.rank);
        let state = inner
            .elements
            .get(&key)
            .ok_or_else(|| HioError::new(ErrorKind::BadParam, self.rank, "element.transfer").with_detail("element not open"))?;

        if let Some(t) = state.segments.translate(offset, requested) {
            let path = physical_path(dataset, t.file_id, self.rank, &self.name);
            return Ok(TransferPlan { file_id: t.file_id, physical_offset: t.physical_offset, actual_size: t.actual_size, path });
        }

        match direction {
            Direction::Read => {
                if let Some(remote) = inner.dataset_map.get(&self.name).and_then(|m| m.translate(offset, requested)) {
                    let path = physical_path(dataset, remote.file_id, self.rank, &self.name);
                    return Ok(TransferPlan {
                        file_id: remote.file_id,
                        physical_offset: remote.physical_offset,
                        actual_size: remote.actual_size,
                        path,
                    });
                }
                Err(HioError::new(ErrorKind::NotFound, self.rank, "element.read").with_detail("no segment covers the requested offset"))
            }
            Direction::Write => {
                if !dataset.file_mode.is_optimised() {
                    let path = path::element_path(&dataset.base_path, &self.name, dataset.mode, self.rank);
                    return Ok(TransferPlan { file_id: -1, physical_offset: offset, actual_size: requested, path });
                }
                let reservation = inner
                    .reservation
                    .as_mut()
                    .ok_or_else(|| HioError::new(ErrorKind::NotAvailable, self.rank, "element.write").with_detail("no reservation state"))?;
                let r = reservation.reserve(requested);
                let path = path::data_file_path(&dataset.base_path, dataset.master_rank);
                Ok(TransferPlan { file_id: dataset.master_rank as i64, physical_offset: r.offset, actual_size: r.granted, path })
            }
        }
    }
}

struct TransferPlan {
    file_id: i64,
    physical_offset: u64,
    actual_size: u64,
    path: std::path::PathBuf,
}

fn physical_path(dataset: &Dataset, file_id: i64, rank: i32, element_name: &str) -> std::path::PathBuf {
    if file_id == -1 {
        path::element_path(&dataset.base_path, element_name, dataset.mode, rank)
    } else if file_id < -1 {
        // Legacy per-block compatibility segment (§9 Open Question 2):
        // `file_id = -2 - bid`.
        let bid = (-2 - file_id) as u64;
        path::legacy_block_path(&dataset.base_path, element_name, bid)
    } else {
        path::data_file_path(&dataset.base_path, file_id as i32)
    }
}
