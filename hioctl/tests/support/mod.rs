use hio_posix::comm::SingleProcess;
use hio_posix::config::{EngineConfig, FileMode};
use hio_posix::context::{Context, Module};
use hio_posix::dataset::{Dataset, DatasetFlags, Mode};
use hio_posix::ElementHandle;
use std::sync::Arc;

/// Writes a BASIC/SHARED dataset instance straight through the engine, the
/// way a checkpointing application would, so CLI tests exercise real
/// on-disk layouts rather than hand-built fixtures.
pub fn write_basic_dataset(root: &std::path::Path, context_name: &str, name: &str, id: u64, element: &str, payload: &[u8]) {
    let ctx = Context::new(context_name, Arc::new(SingleProcess));
    let module = Module::new(root);
    let cfg = EngineConfig::default();
    let ds = Dataset::open(&ctx, &module, name, id, Mode::Shared, DatasetFlags::CREATE | DatasetFlags::WRITE, FileMode::Basic, &cfg)
        .expect("dataset open");
    let e = ElementHandle::new(element, 0);
    e.open(&ctx, &ds).expect("element open");
    e.write(&ctx, &ds, 0, payload).expect("element write");
    ds.close(&ctx).expect("dataset close");
}
