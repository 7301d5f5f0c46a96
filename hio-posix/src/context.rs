//! Context / Module (§3): the process-wide namespace root and its
//! registered data roots.

use crate::comm::Communicator;
use crate::error::{ErrorLog, HioError};
use crate::fs_probe::{self, OpenHook};
use std::path::PathBuf;
use std::sync::Arc;

/// Selects which registered module(s) a collective unlink walks (§4.8),
/// and in general the policy the Root Selector (§2 component 10) applies
/// when more than one module could serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSelectMode {
    /// The module selected for this open/request; no fallback.
    Current,
    /// Try modules in registration order, stop at the first success.
    First,
    /// Try every module, succeed if any one did.
    All,
}

/// One registered data root (§3 "Module"). `backend` is always the POSIX
/// module in this crate; the trait exists so the context doesn't hard-code
/// it (design note 9).
pub struct Module {
    pub data_root: PathBuf,
    pub default_access_mode: u32,
    pub open_hook: Arc<dyn OpenHook>,
}

impl Module {
    /// Derives the default access mode from the current process umask, the
    /// way the original queries it at module creation.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self { data_root: data_root.into(), default_access_mode: default_mode_from_umask(), open_hook: Arc::new(fs_probe::NullOpenHook) }
    }

    pub fn with_open_hook(mut self, hook: Arc<dyn OpenHook>) -> Self {
        self.open_hook = hook;
        self
    }
}

#[cfg(unix)]
fn default_mode_from_umask() -> u32 {
    unsafe {
        let mask = libc::umask(0o022);
        libc::umask(mask);
        0o666 & !mask as u32
    }
}

#[cfg(not(unix))]
fn default_mode_from_umask() -> u32 {
    0o644
}

/// Process-wide handle (§3 "Context"): rank/size, the module registry, and
/// the error log user code drains. Erroneous to destroy with open
/// datasets is enforced by the caller, not tracked here, since this crate
/// exposes no destructor-time dataset registry (out of scope per §1).
pub struct Context {
    pub name: String,
    pub comm: Arc<dyn Communicator>,
    pub error_log: ErrorLog,
    modules: Vec<Module>,
}

impl Context {
    pub fn new(name: impl Into<String>, comm: Arc<dyn Communicator>) -> Self {
        Self { name: name.into(), comm, error_log: ErrorLog::new(), modules: Vec::new() }
    }

    pub fn add_module(&mut self, module: Module) {
        self.modules.push(module);
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Applies `mode` over the registered modules, calling `f` on each
    /// candidate until the policy is satisfied. `f` returns `Ok(())` on
    /// success or an error (`NOT_FOUND` for "this module doesn't have it").
    pub fn select_module<F>(&self, mode: RootSelectMode, mut f: F) -> crate::error::Result<()>
    where
        F: FnMut(&Module) -> crate::error::Result<()>,
    {
        use crate::error::ErrorKind;

        let candidates: &[Module] = match mode {
            RootSelectMode::Current => std::slice::from_ref(
                self.modules.first().ok_or_else(|| HioError::new(ErrorKind::NotFound, self.comm.rank(), "context.select_module"))?,
            ),
            RootSelectMode::First | RootSelectMode::All => &self.modules,
        };

        let mut last_err = None;
        let mut any_ok = false;
        for module in candidates {
            match f(module) {
                Ok(()) => {
                    any_ok = true;
                    if matches!(mode, RootSelectMode::Current | RootSelectMode::First) {
                        return Ok(());
                    }
                }
                Err(e) => last_err = Some(e),
            }
        }

        if any_ok {
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| HioError::new(ErrorKind::NotFound, self.comm.rank(), "context.select_module")))
        }
    }

    pub fn drain_errors(&self) -> Vec<HioError> {
        self.error_log.drain()
    }
}
