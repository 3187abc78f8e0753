//! Thread control blocks and CPU contexts.
//!
//! Grounded on `task/thread.rs`: the CPU-context layout, thread ID
//! allocation, and constructor set are kept as-is. TLS registration and the
//! workqueue/kthread entry points that module also carried are dropped —
//! this kernel does not implement thread-local storage.

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::VirtAddr;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1); // 0 is reserved for the idle thread

pub fn allocate_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst)
}

/// Why a thread is blocked. Distinguishes wait-queue entries in
/// `Scheduler::waiters` from other blocking reasons as they're added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    /// Blocked in `wait`/`waitpid` for a child to change state.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Blocked(BlockedReason),
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPrivilege {
    Kernel,
    User,
}

/// CPU context saved across a context switch.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

impl CpuContext {
    pub fn new(entry_point: VirtAddr, stack_pointer: VirtAddr, privilege: ThreadPrivilege) -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: stack_pointer.as_u64(),
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: entry_point.as_u64(),
            // Kernel threads start with interrupts disabled to avoid
            // preemption before critical setup finishes. Bit 1 is always set.
            rflags: match privilege {
                ThreadPrivilege::Kernel => 0x002,
                ThreadPrivilege::User => 0x202,
            },
            cs: match privilege {
                ThreadPrivilege::Kernel => 0x08,
                ThreadPrivilege::User => 0x33,
            },
            ss: match privilege {
                ThreadPrivilege::Kernel => 0x10,
                ThreadPrivilege::User => 0x2b,
            },
        }
    }

}

/// Thread control block.
pub struct Thread {
    pub id: u64,
    pub name: alloc::string::String,
    pub state: ThreadState,
    pub context: CpuContext,
    pub stack_top: VirtAddr,
    pub stack_bottom: VirtAddr,
    /// Kernel stack for syscalls/interrupts (userspace threads only).
    pub kernel_stack_top: Option<VirtAddr>,
    pub kernel_stack_allocation: Option<crate::memory::kernel_stack::KernelStack>,
    pub priority: u8,
    pub time_slice: u32,
    pub entry_point: Option<fn()>,
    pub privilege: ThreadPrivilege,
    pub has_started: bool,
    /// Set while the thread is inside a syscall that may need to block and
    /// be resumed with a return value written back into the trap frame.
    pub blocked_in_syscall: bool,
}

impl Clone for Thread {
    fn clone(&self) -> Self {
        Thread {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            context: self.context.clone(),
            stack_top: self.stack_top,
            stack_bottom: self.stack_bottom,
            kernel_stack_top: self.kernel_stack_top,
            kernel_stack_allocation: None, // can't clone the stack allocation
            priority: self.priority,
            time_slice: self.time_slice,
            entry_point: self.entry_point,
            privilege: self.privilege,
            has_started: self.has_started,
            blocked_in_syscall: self.blocked_in_syscall,
        }
    }
}

impl Thread {
    /// Create a new kernel thread with an argument passed in RDI.
    pub fn new_kernel(
        name: alloc::string::String,
        entry_point: extern "C" fn(u64) -> !,
        arg: u64,
    ) -> Result<Self, &'static str> {
        let id = allocate_thread_id();

        const KERNEL_STACK_SIZE: usize = 16 * 1024; // ignored by the bitmap allocator
        let stack = crate::memory::alloc_kernel_stack(KERNEL_STACK_SIZE)
            .ok_or("failed to allocate kernel stack")?;

        let stack_top = stack.top();
        let stack_bottom = stack.bottom();

        let mut context = CpuContext::new(
            VirtAddr::new(entry_point as u64),
            stack_top,
            ThreadPrivilege::Kernel,
        );
        context.rdi = arg;

        Ok(Self {
            id,
            name,
            state: ThreadState::Ready,
            context,
            stack_top,
            stack_bottom,
            kernel_stack_top: Some(stack_top),
            kernel_stack_allocation: Some(stack),
            priority: 64,
            time_slice: 20,
            entry_point: None,
            privilege: ThreadPrivilege::Kernel,
            has_started: false,
            blocked_in_syscall: false,
        })
    }

    pub fn new(
        name: alloc::string::String,
        entry_point: fn(),
        stack_top: VirtAddr,
        stack_bottom: VirtAddr,
        privilege: ThreadPrivilege,
    ) -> Self {
        let id = allocate_thread_id();
        let context = CpuContext::new(
            VirtAddr::new(thread_entry_trampoline as u64),
            stack_top,
            privilege,
        );

        Self {
            id,
            name,
            state: ThreadState::Ready,
            context,
            stack_top,
            stack_bottom,
            kernel_stack_top: None,
            kernel_stack_allocation: None,
            priority: 128,
            time_slice: 10,
            entry_point: Some(entry_point),
            privilege,
            has_started: false,
            blocked_in_syscall: false,
        }
    }

    /// Create a userspace thread whose first instruction is `entry_point`
    /// (an address inside the process's own address space, not a kernel fn
    /// pointer — unlike `new`, nothing trampolines through the kernel).
    pub fn new_userspace(
        name: alloc::string::String,
        entry_point: VirtAddr,
        stack_top: VirtAddr,
    ) -> Self {
        let id = allocate_thread_id();
        const USER_STACK_SIZE: usize = 128 * 1024;
        let stack_bottom = stack_top - USER_STACK_SIZE as u64;
        let context = CpuContext::new(entry_point, stack_top, ThreadPrivilege::User);

        Self {
            id,
            name,
            state: ThreadState::Ready,
            context,
            stack_top,
            stack_bottom,
            kernel_stack_top: None,
            kernel_stack_allocation: None,
            priority: 128,
            time_slice: 10,
            entry_point: None,
            privilege: ThreadPrivilege::User,
            has_started: false,
            blocked_in_syscall: false,
        }
    }

    /// Create a thread with a caller-supplied ID, used by `fork` to give the
    /// child thread the same TID namespace entry as a freshly allocated
    /// process.
    pub fn new_with_id(
        id: u64,
        name: alloc::string::String,
        entry_point: fn(),
        stack_top: VirtAddr,
        stack_bottom: VirtAddr,
        privilege: ThreadPrivilege,
    ) -> Self {
        let context = CpuContext::new(
            VirtAddr::new(thread_entry_trampoline as u64),
            stack_top,
            privilege,
        );

        Self {
            id,
            name,
            state: ThreadState::Ready,
            context,
            stack_top,
            stack_bottom,
            kernel_stack_top: None,
            kernel_stack_allocation: None,
            priority: 128,
            time_slice: 10,
            entry_point: Some(entry_point),
            privilege,
            has_started: false,
            blocked_in_syscall: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ThreadState::Ready
    }

    pub fn set_running(&mut self) {
        self.state = ThreadState::Running;
    }

    pub fn set_ready(&mut self) {
        if self.state != ThreadState::Terminated {
            self.state = ThreadState::Ready;
        }
    }

    pub fn set_blocked(&mut self, reason: BlockedReason) {
        self.state = ThreadState::Blocked(reason);
    }

    pub fn set_terminated(&mut self) {
        self.state = ThreadState::Terminated;
    }
}

/// Entry point for threads created with `Thread::new`/`new_with_id`. Looks
/// up its own thread ID from the scheduler rather than a kernel fn pointer,
/// since the thread's actual entry point is carried in `Thread::entry_point`
/// and invoked here.
extern "C" fn thread_entry_trampoline() -> ! {
    let thread_id = super::scheduler::current_thread_id();
    log::debug!("thread {:?} starting execution", thread_id);

    let entry = thread_id
        .and_then(|id| super::scheduler::with_thread_mut(id, |t| t.entry_point))
        .flatten();

    if let Some(entry) = entry {
        entry();
    }

    let _ = crate::syscall::handlers::sys_exit(0);
    unreachable!("thread exit failed");
}
