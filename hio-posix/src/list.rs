//! List (§4.9): rank 0 scans a dataset's instance directory and reads back
//! every manifest header it can find.

use crate::context::{Context, Module};
use crate::manifest::ManifestHeader;
use crate::path;

/// Scans `{root}/{context}.hio/{name}/` for numeric-id subdirectories,
/// reads `manifest.json[.bz2]` header for each, and skips any instance
/// whose header can't be read. The resulting header array is broadcast so
/// every rank in the dataset communicator observes the same count and
/// bytes (§4.9).
pub fn list_instances(ctx: &Context, module: &Module, name: &str) -> Vec<ManifestHeader> {
    let rank = ctx.comm.rank();

    let local: Vec<ManifestHeader> = if rank == 0 {
        let dir = module.data_root.join(format!("{}.hio", ctx.name)).join(name);
        let mut headers = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else { continue };
                if file_name.starts_with('.') {
                    continue;
                }
                if !entry.path().is_dir() {
                    continue;
                }
                let top = path::top_manifest_path(&entry.path());
                if let Ok(header) = crate::manifest::Manifest::read_header(&top) {
                    headers.push(header);
                }
            }
        }
        headers
    } else {
        Vec::new()
    };

    let serialized = if rank == 0 { serde_json::to_vec(&local).unwrap_or_default() } else { Vec::new() };
    let bytes = ctx.comm.broadcast(if rank == 0 { Some(serialized) } else { None });
    serde_json::from_slice(&bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcess;
    use crate::manifest::Manifest;
    use std::sync::Arc;

    #[test]
    fn list_skips_unreadable_headers_and_dotfiles() {
        let td = tempfile::tempdir().unwrap();
        let mut ctx = Context::new("app", Arc::new(SingleProcess));
        let module = Module::new(td.path());
        ctx.add_module(Module::new(td.path()));

        let good = td.path().join("app.hio/restart/1");
        std::fs::create_dir_all(&good).unwrap();
        let m = Manifest::new(0, "restart", 1, "shared", "basic", 1 << 20, 1, 4096);
        Manifest::save(&m.serialize().unwrap(), &path::top_manifest_path(&good)).unwrap();

        let bad = td.path().join("app.hio/restart/2");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(path::top_manifest_path(&bad), b"not json").unwrap();

        let dotdir = td.path().join("app.hio/restart/.tmp");
        std::fs::create_dir_all(&dotdir).unwrap();

        let headers = list_instances(&ctx, &module, "restart");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].id, 1);
    }
}
