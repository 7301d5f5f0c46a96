//! FS Probe (§4.10): a pure query from a data-root path to the
//! filesystem-attribute facts Table A (§4.7) and the reservation engine
//! depend on.

use std::path::Path;

/// Filesystem-attribute facts. A pure function of `path`: probing the same
/// path twice returns the same answer barring the fs changing under us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsAttrs {
    pub kind: FsKind,
    pub supports_striping: bool,
    pub group_locking_available: bool,
    pub stripe_unit: u64,
    pub stripe_max_size: u64,
    pub stripe_max_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Lustre,
    Gpfs,
    Generic,
}

/// Per-backend hook allowing a recognized filesystem to request a specific
/// `(count, size)` stripe layout at file creation time (§4.10). The default
/// hook is a no-op; a Lustre-aware backend would issue the equivalent of
/// `llapi_file_create` here.
pub trait OpenHook: Send + Sync {
    fn stripe_directed_create(
        &self,
        path: &Path,
        stripe_count: u32,
        stripe_size: u64,
    ) -> std::io::Result<()>;
}

#[derive(Default)]
pub struct NullOpenHook;

impl OpenHook for NullOpenHook {
    fn stripe_directed_create(&self, _path: &Path, _stripe_count: u32, _stripe_size: u64) -> std::io::Result<()> {
        Ok(())
    }
}

/// Probes `path` for its filesystem kind and striping capability.
///
/// Without a Lustre/GPFS-specific ioctl, any filesystem this process
/// doesn't recognize probes as [`FsKind::Generic`] with striping
/// unsupported: conservative, but honest, since POSIX alone has no portable
/// striping query (SPEC_FULL §4.10 supplement).
pub fn probe(path: &Path) -> FsAttrs {
    let kind = detect_kind(path);
    match kind {
        FsKind::Lustre => FsAttrs {
            kind,
            supports_striping: true,
            group_locking_available: true,
            stripe_unit: 1 << 20,
            stripe_max_size: 1 << 32,
            stripe_max_count: 160,
        },
        FsKind::Gpfs => FsAttrs {
            kind,
            supports_striping: true,
            group_locking_available: false,
            stripe_unit: 1 << 18,
            stripe_max_size: 1 << 31,
            stripe_max_count: 64,
        },
        FsKind::Generic => FsAttrs {
            kind,
            supports_striping: false,
            group_locking_available: false,
            stripe_unit: 4096,
            stripe_max_size: u64::MAX,
            stripe_max_count: 1,
        },
    }
}

#[cfg(target_os = "linux")]
fn detect_kind(path: &Path) -> FsKind {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    const LUSTRE_SUPER_MAGIC: i64 = 0x0BD0_0BD0;
    const GPFS_SUPER_MAGIC: i64 = 0x4750_4653;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return FsKind::Generic;
    };

    unsafe {
        let mut buf = MaybeUninit::<libc::statfs>::uninit();
        if libc::statfs(c_path.as_ptr(), buf.as_mut_ptr()) != 0 {
            return FsKind::Generic;
        }
        match buf.assume_init().f_type as i64 {
            LUSTRE_SUPER_MAGIC => FsKind::Lustre,
            GPFS_SUPER_MAGIC => FsKind::Gpfs,
            _ => FsKind::Generic,
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn detect_kind(_path: &Path) -> FsKind {
    FsKind::Generic
}
