//! Error taxonomy (§7) and the context-scoped error log.
//!
//! The original source pushes errors onto a process-wide queue from inside
//! backend calls. We re-express that as an object-scoped [`ErrorLog`] owned
//! by a [`crate::context::Context`] (design note 9).

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

/// Kind of failure, independent of its context. Mirrors the `HIO_ERR_*`
/// taxonomy exactly: GENERIC, PERM, TRUNCATED, OUT_OF_RESOURCE, NOT_FOUND,
/// NOT_AVAILABLE, BAD_PARAM, IO_TEMPORARY, IO_PERMANENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    #[error("generic failure")]
    Generic,
    #[error("operation not permitted for the current dataset flags")]
    Perm,
    #[error("short read or write")]
    Truncated,
    #[error("allocation or handle exhaustion")]
    OutOfResource,
    #[error("path, segment, or dataset id not found")]
    NotFound,
    #[error("operation not available in this context")]
    NotAvailable,
    #[error("invalid parameter")]
    BadParam,
    #[error("retryable I/O failure")]
    IoTemporary,
    #[error("fatal I/O failure on the current root")]
    IoPermanent,
}

impl ErrorKind {
    /// Severity used for the all-reduce-min on dataset close (§5(c), §7):
    /// lower is more severe, so `min` picks the worst outcome across ranks.
    pub fn severity(self) -> i32 {
        match self {
            ErrorKind::IoPermanent => 0,
            ErrorKind::IoTemporary => 1,
            ErrorKind::OutOfResource => 2,
            ErrorKind::Truncated => 3,
            ErrorKind::NotAvailable => 4,
            ErrorKind::Perm => 5,
            ErrorKind::BadParam => 6,
            ErrorKind::NotFound => 7,
            ErrorKind::Generic => 8,
        }
    }
}

/// A local error wrapped with the (rank, path, operation) context §7
/// requires before it is pushed onto the queue.
#[derive(Debug, Clone)]
pub struct HioError {
    pub kind: ErrorKind,
    pub rank: i32,
    pub op: &'static str,
    pub path: Option<PathBuf>,
    pub detail: Option<String>,
}

impl HioError {
    pub fn new(kind: ErrorKind, rank: i32, op: &'static str) -> Self {
        Self { kind, rank, op, path: None, detail: None }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Convenience constructor for manifest-codec failures, which run
    /// outside any particular rank's dataset context.
    pub fn manifest_parse(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadParam, -1, "manifest.parse").with_detail(detail)
    }

    /// Convenience constructor projecting a bare I/O error onto a path,
    /// for call sites outside a rank's dataset context (see
    /// [`from_io_error`] for the rank-scoped version).
    pub fn from_io_path(err: std::io::Error, path: &std::path::Path) -> Self {
        from_io_error(-1, "manifest.io", &err).with_path(path)
    }
}

impl fmt::Display for HioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[rank {}] {} during {}", self.rank, self.kind, self.op)?;
        if let Some(p) = &self.path {
            write!(f, " ({})", p.display())?;
        }
        if let Some(d) = &self.detail {
            write!(f, ": {d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HioError {}

pub type Result<T> = std::result::Result<T, HioError>;

/// The single errno -> taxonomy projection function §7 calls for.
pub fn from_io_error(rank: i32, op: &'static str, err: &std::io::Error) -> HioError {
    use std::io::ErrorKind as K;
    let kind = match err.kind() {
        K::NotFound => ErrorKind::NotFound,
        K::PermissionDenied => ErrorKind::Perm,
        K::InvalidInput | K::InvalidData => ErrorKind::BadParam,
        K::Interrupted | K::WouldBlock | K::TimedOut => ErrorKind::IoTemporary,
        K::UnexpectedEof | K::WriteZero => ErrorKind::Truncated,
        _ => match err.raw_os_error() {
            Some(errno) if is_resource_exhausted(errno) => ErrorKind::OutOfResource,
            Some(_) => ErrorKind::IoPermanent,
            None => ErrorKind::Generic,
        },
    };
    HioError::new(kind, rank, op).with_detail(err.to_string())
}

#[cfg(unix)]
fn is_resource_exhausted(errno: i32) -> bool {
    errno == libc::ENOSPC || errno == libc::EMFILE || errno == libc::ENFILE || errno == libc::ENOMEM
}

#[cfg(not(unix))]
fn is_resource_exhausted(_errno: i32) -> bool {
    false
}

/// Ordered, low-traffic per-context error log (design note 9).
#[derive(Default)]
pub struct ErrorLog {
    entries: Mutex<Vec<HioError>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, err: HioError) {
        log::warn!("{err}");
        self.entries.lock().unwrap().push(err);
    }

    /// Drains every queued error in push order.
    pub fn drain(&self) -> Vec<HioError> {
        std::mem::take(&mut self.entries.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
