//! Signal numbers and per-process pending-signal state.
//!
//! Signals here only terminate, stop, or resume a process — there is no
//! userland handler delivery, `sigaction`, or signal trampoline. Dispatch
//! of a process's pending signal happens at the scheduler's
//! return-to-userland point; see `delivery::dispatch_pending`.

pub mod constants;
pub mod delivery;
pub mod types;

pub use types::*;
