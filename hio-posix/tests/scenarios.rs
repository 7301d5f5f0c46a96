//! Scenario tests A-F from the dataset engine's testable-properties table:
//! end-to-end open/write/close/reopen/read flows through the public
//! surface, using tempdirs as data roots.

use hio_posix::comm::{Communicator, SingleProcess, ThreadCommunicator};
use hio_posix::config::{EngineConfig, FileMode};
use hio_posix::context::{Context, Module};
use hio_posix::dataset::{Dataset, DatasetFlags, Mode};
use hio_posix::element::ElementHandle;
use hio_posix::error::ErrorKind;
use hio_posix::manifest::Manifest;
use std::sync::Arc;

fn single_process_ctx() -> Context {
    Context::new("app", Arc::new(SingleProcess))
}

/// Scenario A: BASIC, SHARED, single rank, write then reopen read-only.
#[test]
fn scenario_a_basic_shared_round_trip_across_reopen() {
    let td = tempfile::tempdir().unwrap();
    let ctx = single_process_ctx();
    let module = Module::new(td.path());
    let cfg = EngineConfig::default();

    let ds = Dataset::open(
        &ctx,
        &module,
        "restart",
        42,
        Mode::Shared,
        DatasetFlags::CREATE | DatasetFlags::WRITE,
        FileMode::Basic,
        &cfg,
    )
    .unwrap();
    let e = ElementHandle::new("E", 0);
    e.open(&ctx, &ds).unwrap();
    e.write(&ctx, &ds, 0, b"ABCDEFGH").unwrap();
    ds.close(&ctx).unwrap();

    let element_file = hio_posix::path::element_path(&ds.base_path, "E", Mode::Shared, 0);
    assert_eq!(std::fs::metadata(&element_file).unwrap().len(), 8);

    let ds2 = Dataset::open(&ctx, &module, "restart", 42, Mode::Shared, DatasetFlags::READ, FileMode::Basic, &cfg).unwrap();
    let e2 = ElementHandle::new("E", 0);
    e2.open(&ctx, &ds2).unwrap();
    let bytes = e2.read(&ctx, &ds2, 0, 8).unwrap();
    assert_eq!(&bytes, b"ABCDEFGH");
}

/// Scenario B: BASIC, UNIQUE, 4 simulated ranks, each writes its own tag to
/// its own per-rank element file.
#[test]
fn scenario_b_basic_unique_four_ranks_get_separate_files() {
    let td = tempfile::tempdir().unwrap();
    let fleet = ThreadCommunicator::fleet(4);
    let base = td.path().to_path_buf();

    let handles: Vec<_> = fleet
        .into_iter()
        .map(|comm| {
            let base = base.clone();
            std::thread::spawn(move || {
                let rank = comm.rank();
                let ctx = Context::new("app", std::sync::Arc::new(comm));
                let module = Module::new(base.as_path());
                let cfg = EngineConfig::default();
                let ds = Dataset::open(
                    &ctx,
                    &module,
                    "restart",
                    1,
                    Mode::Unique,
                    DatasetFlags::CREATE | DatasetFlags::WRITE,
                    FileMode::Basic,
                    &cfg,
                )
                .unwrap();
                let e = ElementHandle::new("E", rank);
                e.open(&ctx, &ds).unwrap();
                let tag = format!("R{rank}");
                e.write(&ctx, &ds, 0, tag.as_bytes()).unwrap();
                ds.close(&ctx).unwrap();
                rank
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let base_path = hio_posix::path::dataset_dir(&base, "app", "restart", 1);
    for rank in 0..4 {
        let p = hio_posix::path::element_path(&base_path, "E", Mode::Unique, rank);
        let content = std::fs::read(&p).unwrap();
        assert_eq!(content, format!("R{rank}").into_bytes());
    }
}

/// Scenario C: STRIDED, SHARED, 2 simulated ranks, block_size=4 KiB. Each
/// rank writes 8 KiB as two separate 4 KiB chunks (one reservation per
/// block); committed physical ranges must be disjoint across ranks, and
/// each rank's own per-rank manifest carries exactly 2 segments.
#[test]
fn scenario_c_strided_shared_two_ranks_get_disjoint_physical_offsets() {
    let td = tempfile::tempdir().unwrap();
    let fleet = ThreadCommunicator::fleet(2);
    let base = td.path().to_path_buf();

    let handles: Vec<_> = fleet
        .into_iter()
        .map(|comm| {
            let base = base.clone();
            std::thread::spawn(move || {
                let rank = comm.rank();
                let ctx = Context::new("app", Arc::new(comm));
                let module = Module::new(base.as_path());
                let mut cfg = EngineConfig::default();
                cfg.dataset_block_size = 4096;
                let ds = Dataset::open(
                    &ctx,
                    &module,
                    "restart",
                    7,
                    Mode::Shared,
                    DatasetFlags::CREATE | DatasetFlags::WRITE,
                    FileMode::Strided,
                    &cfg,
                )
                .unwrap();
                assert_eq!(ds.file_mode, FileMode::Strided);

                let e = ElementHandle::new("E", rank);
                e.open(&ctx, &ds).unwrap();
                let base_offset = rank as u64 * 8192;
                let chunk_a = vec![b'a' + rank as u8; 4096];
                let chunk_b = vec![b'A' + rank as u8; 4096];
                e.write(&ctx, &ds, base_offset, &chunk_a).unwrap();
                e.write(&ctx, &ds, base_offset + 4096, &chunk_b).unwrap();
                ds.close(&ctx).unwrap();
                rank
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let base_path = hio_posix::path::dataset_dir(&base, "app", "restart", 7);
    let mut all_ranges: Vec<(u64, u64)> = Vec::new();
    for rank in 0..2 {
        let manifest = Manifest::read(&hio_posix::path::rank_manifest_path(&base_path, rank, false)).unwrap();
        let segs = manifest.segments_for("E").unwrap();
        assert_eq!(segs.len(), 2, "rank {rank} should have reserved exactly 2 blocks");
        for seg in segs {
            all_ranges.push((seg.physical_offset, seg.physical_offset + seg.length as u64));
        }
    }
    all_ranges.sort();
    for w in all_ranges.windows(2) {
        assert!(w[0].1 <= w[1].0, "reservations across ranks overlap: {all_ranges:?}");
    }
}

/// Scenario D: an optimised dataset with 3 per-rank manifests on disk;
/// reopening for read on 3 ranks recovers each rank's own previously
/// written bytes, whether served from its own segment map or from the
/// merged cross-rank dataset map built at open (§4.7 step 6).
#[test]
fn scenario_d_optimised_reopen_on_three_ranks_reads_back_original_bytes() {
    let td = tempfile::tempdir().unwrap();
    let base = td.path().to_path_buf();

    let write_fleet = ThreadCommunicator::fleet(3);
    let handles: Vec<_> = write_fleet
        .into_iter()
        .map(|comm| {
            let base = base.clone();
            std::thread::spawn(move || {
                let rank = comm.rank();
                let ctx = Context::new("app", Arc::new(comm));
                let module = Module::new(base.as_path());
                let mut cfg = EngineConfig::default();
                cfg.dataset_block_size = 64;
                let ds = Dataset::open(
                    &ctx,
                    &module,
                    "restart",
                    11,
                    Mode::Shared,
                    DatasetFlags::CREATE | DatasetFlags::WRITE,
                    FileMode::Strided,
                    &cfg,
                )
                .unwrap();
                let e = ElementHandle::new("E", rank);
                e.open(&ctx, &ds).unwrap();
                let tag = format!("rank-{rank}");
                e.write(&ctx, &ds, rank as u64 * 8, tag.as_bytes()).unwrap();
                ds.close(&ctx).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let base_path = hio_posix::path::dataset_dir(&base, "app", "restart", 11);
    let manifest_files: Vec<_> = std::fs::read_dir(&base_path)
        .unwrap()
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| hio_posix::path::parse_rank_manifest_name(n).is_some())
        .collect();
    assert_eq!(manifest_files.len(), 3, "expected one per-rank manifest per rank");

    let read_fleet = ThreadCommunicator::fleet(3);
    let handles: Vec<_> = read_fleet
        .into_iter()
        .map(|comm| {
            let base = base.clone();
            std::thread::spawn(move || {
                let rank = comm.rank();
                let ctx = Context::new("app", Arc::new(comm));
                let module = Module::new(base.as_path());
                let mut cfg = EngineConfig::default();
                cfg.dataset_block_size = 64;
                let ds = Dataset::open(&ctx, &module, "restart", 11, Mode::Shared, DatasetFlags::READ, FileMode::Strided, &cfg).unwrap();
                let e = ElementHandle::new("E", rank);
                e.open(&ctx, &ds).unwrap();
                let tag = format!("rank-{rank}");
                let got = e.read(&ctx, &ds, rank as u64 * 8, tag.len() as u64).unwrap();
                assert_eq!(got, tag.into_bytes());
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// Scenario F: reading an offset with no covering segment surfaces
/// NOT_FOUND.
#[test]
fn scenario_f_read_with_no_segment_is_not_found() {
    let td = tempfile::tempdir().unwrap();
    let ctx = single_process_ctx();
    let module = Module::new(td.path());
    let cfg = EngineConfig::default();
    let ds = Dataset::open(
        &ctx,
        &module,
        "restart",
        9,
        Mode::Shared,
        DatasetFlags::CREATE | DatasetFlags::WRITE | DatasetFlags::READ,
        FileMode::Basic,
        &cfg,
    )
    .unwrap();
    let e = ElementHandle::new("E", 0);
    e.open(&ctx, &ds).unwrap();
    let err = e.read(&ctx, &ds, 999_999, 16).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

/// Scenario E: write then truncate-reopen empties the instance directory
/// before the new instance's files appear.
#[test]
fn scenario_e_truncate_reopen_clears_prior_contents() {
    let td = tempfile::tempdir().unwrap();
    let ctx = single_process_ctx();
    let module = Module::new(td.path());
    let cfg = EngineConfig::default();

    let ds = Dataset::open(
        &ctx,
        &module,
        "restart",
        3,
        Mode::Shared,
        DatasetFlags::CREATE | DatasetFlags::WRITE,
        FileMode::Basic,
        &cfg,
    )
    .unwrap();
    let e = ElementHandle::new("E", 0);
    e.open(&ctx, &ds).unwrap();
    e.write(&ctx, &ds, 0, b"old-data").unwrap();
    ds.close(&ctx).unwrap();

    let old_element = hio_posix::path::element_path(&ds.base_path, "E", Mode::Shared, 0);
    assert!(old_element.exists());

    let ds2 = Dataset::open(
        &ctx,
        &module,
        "restart",
        3,
        Mode::Shared,
        DatasetFlags::CREATE | DatasetFlags::WRITE | DatasetFlags::TRUNCATE,
        FileMode::Basic,
        &cfg,
    )
    .unwrap();
    assert!(!old_element.exists());
    let entries: Vec<_> = std::fs::read_dir(&ds2.base_path).unwrap().collect();
    assert!(entries.is_empty());
}
