//! Kernel global-context singleton.
//!
//! The original implementation this kernel is modeled on addresses a fixed
//! `GLOBAL_VARS` virtual region with macros to reach shared kernel state
//! (PMM, VMM roots, PID tables, scheduler, VFS root, device manager). We
//! replace that with a single `KernelContext` initialized once during boot
//! and reachable through [`current`], matching how the rest of this crate
//! exposes subsystem singletons via `conquer_once::spin::OnceCell`.
//!
//! `KernelContext` itself owns no locks: each field is independently
//! synchronized by its subsystem (`pmm::PMM`, `process::manager::MANAGER`,
//! ...). The struct exists purely so callers that need "the kernel" rather
//! than one specific subsystem have a single, discoverable entry point.

use conquer_once::spin::OnceCell;

use crate::device::DeviceManager;
use crate::fs::vfs::Vfs;
use crate::pidtable::PidTables;

pub struct KernelContext {
    pub pids: PidTables,
    pub vfs: Vfs,
    pub devices: DeviceManager,
}

static CONTEXT: OnceCell<KernelContext> = OnceCell::uninit();

/// Initialize the global kernel context. Must be called exactly once, after
/// the heap and pools are available but before the scheduler starts.
pub fn init() {
    CONTEXT.init_once(|| KernelContext {
        pids: PidTables::new(),
        vfs: Vfs::new(),
        devices: DeviceManager::new(),
    });
}

/// Access the global kernel context.
///
/// # Panics
/// Panics if called before [`init`]. Every code path that can reach this is
/// only reachable after boot has completed subsystem init, so this is a
/// programmer error rather than a runtime condition.
pub fn current() -> &'static KernelContext {
    CONTEXT.try_get().expect("kernel context not initialized")
}
