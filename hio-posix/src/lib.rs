//! POSIX data-root dataset engine for libhio: physical layout decisions,
//! parallel reservation, per-rank segment manifests, and global mapping
//! reconstitution on read.
//!
//! The public surface here covers the *dataset engine* only: a context
//! holding an ordered list of modules (data roots), and the dataset/element
//! lifecycle each module drives. Argument parsing, configuration-variable
//! registries, and terminal output belong in a consumer such as `hioctl`.

pub mod cache;
pub mod comm;
pub mod config;
pub mod context;
pub mod dataset;
pub mod element;
pub mod error;
pub mod fs_probe;
pub mod list;
pub mod manifest;
pub mod path;
pub mod reservation;
pub mod segment;
pub mod unlink;

pub use context::{Context, Module, RootSelectMode};
pub use dataset::{Dataset, DatasetFlags, Mode};
pub use element::ElementHandle;
pub use error::{ErrorKind, HioError, Result};
