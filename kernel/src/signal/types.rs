//! Per-process pending-signal state.
//!
//! There is no user-installed handler table here: a process has at most one
//! signal pending at a time, and delivering it again while one is already
//! pending has no extra effect (`signal::delivery` dispatches it to a fixed
//! disposition — terminate, stop, continue, or ignore).

/// Pending-signal slot carried on every `Process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalState {
    pending: Option<u32>,
}

impl SignalState {
    /// Record `sig` as pending. Idempotent: a second signal arriving while
    /// one is already pending is dropped.
    pub fn set_pending(&mut self, sig: u32) {
        if self.pending.is_none() {
            self.pending = Some(sig);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending signal, clearing the slot.
    pub fn take_pending(&mut self) -> Option<u32> {
        self.pending.take()
    }

    /// A forked child starts with no pending signal of its own.
    pub fn fork(&self) -> Self {
        Self::default()
    }

    /// `execve` clears any signal pending from before the image was replaced.
    pub fn exec_reset(&mut self) {
        self.pending = None;
    }
}
