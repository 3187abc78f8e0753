//! Interprets a process's pending signal against the fixed disposition
//! table: terminate (with encoded status), stop, continue, or ignore.
//! There is no per-signal handler to jump to — this runs at the scheduler's
//! return-to-userland point (see `process::scheduler`'s callers in
//! `interrupts/context_switch.rs`) and only ever mutates `ProcessState`.

use super::constants::*;
use crate::process::process::Process;

/// What dispatching the pending signal did, if anything was pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Terminated(i32),
    Stopped,
    Continued,
    Ignored,
}

#[inline]
pub fn has_deliverable_signals(process: &Process) -> bool {
    process.signals.is_pending()
}

/// Take and dispatch the process's pending signal, if any.
pub fn dispatch_pending(process: &mut Process) -> Option<Disposition> {
    let sig = process.signals.take_pending()?;

    let disposition = match sig {
        SIGKILL | SIGSEGV | SIGBUS | SIGILL | SIGFPE | SIGABRT | SIGQUIT | SIGSYS | SIGTRAP
        | SIGXCPU | SIGXFSZ => {
            let status = (sig as i32) | 0x80;
            process.terminate(status);
            Disposition::Terminated(status)
        }
        SIGTERM | SIGHUP | SIGINT | SIGPIPE | SIGSTKFLT | SIGALRM | SIGUSR1 | SIGUSR2 | SIGIO
        | SIGPWR | SIGPROF | SIGVTALRM => {
            process.terminate(sig as i32);
            Disposition::Terminated(sig as i32)
        }
        SIGCONT => {
            process.set_ready();
            Disposition::Continued
        }
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            process.set_blocked();
            Disposition::Stopped
        }
        // SIGCHLD/SIGURG/SIGWINCH, and anything else we don't recognize.
        _ => Disposition::Ignored,
    };

    log::debug!(
        "signal: process {} dispatched {} ({}) -> {:?}",
        process.id.as_u64(),
        sig,
        signal_name(sig),
        disposition
    );

    Some(disposition)
}
