//! Round-robin thread scheduler.
//!
//! Grounded on `task/scheduler.rs`: the `Arc<Mutex<Thread>>` registry plus
//! `VecDeque<u64>` ready queue is kept as the run ring (an idiomatic
//! stand-in for an intrusive circular list — see DESIGN.md). Stripped of
//! the `arc_guard`/`heap_trace`/`sched_debug` corruption-guard instrumentation
//! that module carried; this kernel has no history of the heap corruption
//! those guards were chasing.

use super::thread::{BlockedReason, Thread, ThreadPrivilege, ThreadState};
use crate::process::ProcessId;
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitMode {
    AnyChild,
    SpecificChild(ProcessId),
}

#[derive(Debug)]
pub struct Waiter {
    pub thread_id: u64,
    pub parent_pid: ProcessId,
    pub mode: WaitMode,
}

pub struct Scheduler {
    threads: Vec<Arc<Mutex<Thread>>>,
    ready_queue: VecDeque<u64>,
    current_thread: Option<u64>,
    idle_thread: u64,
    waiters: Vec<Waiter>,
    /// Threads removed from `threads` but not yet dropped, so an Arc's
    /// final drop never happens while interrupts are disabled.
    retire_list: Vec<Arc<Mutex<Thread>>>,
}

impl Scheduler {
    pub fn new(idle_thread: Box<Thread>) -> Self {
        let idle_id = idle_thread.id();
        const EXPECTED_THREADS: usize = 128;
        let mut threads = Vec::with_capacity(EXPECTED_THREADS);
        threads.push(Arc::new(Mutex::new(*idle_thread)));

        Self {
            threads,
            ready_queue: VecDeque::new(),
            current_thread: Some(idle_id),
            idle_thread: idle_id,
            waiters: Vec::new(),
            retire_list: Vec::new(),
        }
    }

    pub fn add_thread(&mut self, thread: Box<Thread>) {
        let thread_id = thread.id();
        debug_assert!(
            self.threads.len() < self.threads.capacity(),
            "threads Vec would reallocate with interrupts enabled"
        );
        self.threads.push(Arc::new(Mutex::new(*thread)));
        self.ready_queue.push_back(thread_id);
        log::debug!("scheduler: added thread {}", thread_id);
    }

    pub fn get_thread_mut(&self, id: u64) -> Option<spin::MutexGuard<'_, Thread>> {
        self.threads.iter().find(|t| t.lock().id() == id).map(|t| t.lock())
    }

    pub fn get_thread(&self, id: u64) -> Option<spin::MutexGuard<'_, Thread>> {
        self.get_thread_mut(id)
    }

    pub fn current_thread_mut(&self) -> Option<spin::MutexGuard<'_, Thread>> {
        self.current_thread.and_then(|id| self.get_thread_mut(id))
    }

    /// Pick the next thread to run. Returns `(old_id, new_id)` for the
    /// caller to perform the actual context switch, or `None` if the
    /// current thread should keep running.
    pub fn schedule(&mut self) -> Option<(u64, u64)> {
        if let Some(current_id) = self.current_thread {
            if current_id != self.idle_thread {
                let should_requeue = if let Some(mut current) = self.get_thread_mut(current_id) {
                    match current.state {
                        ThreadState::Terminated => false,
                        ThreadState::Blocked(_) => false,
                        _ => {
                            current.set_ready();
                            true
                        }
                    }
                } else {
                    false
                };
                if should_requeue {
                    self.ready_queue.push_back(current_id);
                }
            }
        }

        let mut next_thread_id = self.ready_queue.pop_front().or(Some(self.idle_thread))?;

        if Some(next_thread_id) == self.current_thread && !self.ready_queue.is_empty() {
            self.ready_queue.push_back(next_thread_id);
            next_thread_id = self.ready_queue.pop_front()?;
        } else if Some(next_thread_id) == self.current_thread {
            return None;
        }

        let old_thread_id = self.current_thread.unwrap_or(self.idle_thread);
        self.current_thread = Some(next_thread_id);

        if let Some(mut next) = self.get_thread_mut(next_thread_id) {
            next.set_running();
        }

        Some((old_thread_id, next_thread_id))
    }

    pub fn has_runnable_threads(&self) -> bool {
        !self.ready_queue.is_empty()
            || self
                .current_thread
                .map_or(false, |id| self.get_thread(id).map_or(false, |t| t.is_runnable()))
    }

    pub fn has_userspace_threads(&self) -> bool {
        self.threads.iter().any(|t| {
            let thread = t.lock();
            thread.id() != self.idle_thread
                && thread.privilege == ThreadPrivilege::User
                && thread.state != ThreadState::Terminated
        })
    }

    pub fn idle_thread(&self) -> u64 {
        self.idle_thread
    }

    pub fn add_waiter(&mut self, waiter: Waiter) {
        log::debug!("scheduler: thread {} waiting for {:?}", waiter.thread_id, waiter.mode);
        if let Some(mut thread) = self.get_thread_mut(waiter.thread_id) {
            thread.set_blocked(BlockedReason::Wait);
        }
        self.waiters.push(waiter);
    }

    pub fn wake_waiters(&mut self, child_pid: ProcessId, parent_pid: Option<ProcessId>) {
        let mut threads_to_wake = Vec::new();
        self.waiters.retain(|waiter| {
            let should_wake = match (&waiter.mode, &parent_pid) {
                (_, Some(parent)) if waiter.parent_pid != *parent => false,
                (WaitMode::AnyChild, _) => true,
                (WaitMode::SpecificChild(pid), _) => *pid == child_pid,
            };
            if should_wake {
                threads_to_wake.push(waiter.thread_id);
                false
            } else {
                true
            }
        });

        for thread_id in threads_to_wake {
            if let Some(mut thread) = self.get_thread_mut(thread_id) {
                thread.set_ready();
            }
            self.ready_queue.push_back(thread_id);
        }
    }

    pub fn remove_waiters_for_parent(&mut self, parent_pid: ProcessId) {
        self.waiters.retain(|waiter| waiter.parent_pid != parent_pid);
    }

    /// Block the currently running thread on `BlockedReason::Wait` (used by
    /// `waitpid`'s polling loop). The caller is responsible for re-checking
    /// child state and calling `yield_current` until the wait is satisfied.
    pub fn block_current_for_child_exit(&mut self) {
        if let Some(mut thread) = self.current_thread_mut() {
            thread.set_blocked(BlockedReason::Wait);
        }
    }

    pub fn retire_thread(&mut self, thread_id: u64) {
        if let Some(pos) = self.threads.iter().position(|t| t.lock().id() == thread_id) {
            let retired = self.threads.remove(pos);
            self.retire_list.push(retired);
        }
    }

    pub fn process_retire_list(&mut self) {
        if !self.retire_list.is_empty() {
            for thread_arc in &self.retire_list {
                debug_assert_eq!(
                    Arc::strong_count(thread_arc),
                    1,
                    "thread being retired still has active references"
                );
            }
            self.retire_list.clear();
        }
    }
}

pub fn init(idle_thread: Box<Thread>) {
    *SCHEDULER.lock() = Some(Scheduler::new(idle_thread));
    log::info!("scheduler initialized");
}

pub fn spawn(thread: Box<Thread>) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut scheduler_lock = SCHEDULER.lock();
        match scheduler_lock.as_mut() {
            Some(scheduler) => scheduler.add_thread(thread),
            None => panic!("scheduler not initialized"),
        }
    });
}

pub fn schedule() -> Option<(u64, u64)> {
    x86_64::instructions::interrupts::without_interrupts(|| {
        SCHEDULER.lock().as_mut().and_then(|s| s.schedule())
    })
}

pub fn with_scheduler<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Scheduler) -> R,
{
    x86_64::instructions::interrupts::without_interrupts(|| SCHEDULER.lock().as_mut().map(f))
}

pub fn with_scheduler_mut<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Scheduler) -> R,
{
    with_scheduler(f)
}

pub fn with_thread_mut<F, R>(thread_id: u64, f: F) -> Option<R>
where
    F: FnOnce(&mut Thread) -> R,
{
    x86_64::instructions::interrupts::without_interrupts(|| {
        SCHEDULER
            .lock()
            .as_ref()
            .and_then(|sched| sched.get_thread_mut(thread_id).map(|mut guard| f(&mut guard)))
    })
}

pub fn current_thread_id() -> Option<u64> {
    x86_64::instructions::interrupts::without_interrupts(|| {
        SCHEDULER.lock().as_ref().and_then(|s| s.current_thread)
    })
}

/// Force the scheduler's notion of the current thread to the idle thread.
/// Used by exception handlers that have just terminated the running thread
/// and need the next timer tick to schedule someone else rather than
/// resuming a thread that no longer exists.
pub fn switch_to_idle() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        if let Some(scheduler) = SCHEDULER.lock().as_mut() {
            scheduler.current_thread = Some(scheduler.idle_thread);
        }
    })
}

/// Run the scheduling decision from a softirq-exit point. There's no trap
/// frame here to rewrite, so this only updates `current_thread`/ready-queue
/// bookkeeping — the actual register-level switch happens at the next point
/// that does have a frame to modify (timer interrupt, syscall return).
pub fn preempt_schedule_irq() {
    schedule();
}

pub fn retire_thread(thread_id: u64) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        if let Some(scheduler) = SCHEDULER.lock().as_mut() {
            scheduler.retire_thread(thread_id);
        }
    })
}

pub fn process_retire_list() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        if let Some(scheduler) = SCHEDULER.lock().as_mut() {
            scheduler.process_retire_list();
        }
    })
}

pub fn yield_current() {
    if let Some((old_id, new_id)) = schedule() {
        log::debug!("scheduler: yielded {} -> {}", old_id, new_id);
    }
}

pub fn set_need_resched() {
    NEED_RESCHED.store(true, Ordering::Relaxed);
}

pub fn check_and_clear_need_resched() -> bool {
    NEED_RESCHED.swap(false, Ordering::Relaxed)
}
