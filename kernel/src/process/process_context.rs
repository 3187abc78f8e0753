//! Userspace-aware context switching: `ProcessContext` wraps a `CpuContext`
//! with the extra state a Ring 3 thread needs (kernel RSP0, provenance).
//!
//! Grounded on `task/process_context.rs`, unchanged apart from the module
//! path its `Thread`/`userspace_switch` references resolve to.

use super::context;
use super::thread::{CpuContext, Thread, ThreadPrivilege};
use x86_64::structures::idt::InterruptStackFrame;
use x86_64::VirtAddr;

#[derive(Debug, Clone)]
#[repr(C)]
pub struct ProcessContext {
    pub cpu_context: CpuContext,
    pub kernel_rsp: u64,
    pub from_userspace: bool,
}

impl ProcessContext {
    pub fn from_thread(thread: &Thread) -> Self {
        ProcessContext {
            cpu_context: thread.context.clone(),
            kernel_rsp: thread.stack_top.as_u64(),
            from_userspace: thread.privilege == ThreadPrivilege::User,
        }
    }

    pub fn from_interrupt_frame(frame: &InterruptStackFrame, saved_regs: &SavedRegisters) -> Self {
        let context = CpuContext {
            rax: saved_regs.rax,
            rbx: saved_regs.rbx,
            rcx: saved_regs.rcx,
            rdx: saved_regs.rdx,
            rsi: saved_regs.rsi,
            rdi: saved_regs.rdi,
            rbp: saved_regs.rbp,
            rsp: frame.stack_pointer.as_u64(),
            r8: saved_regs.r8,
            r9: saved_regs.r9,
            r10: saved_regs.r10,
            r11: saved_regs.r11,
            r12: saved_regs.r12,
            r13: saved_regs.r13,
            r14: saved_regs.r14,
            r15: saved_regs.r15,
            rip: frame.instruction_pointer.as_u64(),
            rflags: frame.cpu_flags.bits(),
            cs: frame.code_segment.0 as u64,
            ss: frame.stack_segment.0 as u64,
        };

        ProcessContext {
            cpu_context: context,
            kernel_rsp: 0,
            from_userspace: (frame.code_segment.0 & 3) == 3,
        }
    }
}

/// Saved general-purpose registers, in the order the syscall/timer
/// interrupt entry stubs push them (stack grows down, so the last push
/// ends up at the lowest address / `RSP+0`).
#[derive(Debug, Clone)]
#[repr(C)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// # Safety
/// Both threads must be in a state where their contexts are valid landing
/// spots for a switch (stacks mapped, context fields initialized).
pub unsafe fn switch_with_privilege(
    old_thread: &mut Thread,
    new_thread: &Thread,
) -> Result<(), &'static str> {
    let is_initial_userspace_entry = new_thread.privilege == ThreadPrivilege::User
        && new_thread
            .entry_point
            .map(|e| new_thread.context.rip == e as *const () as u64)
            .unwrap_or(false);

    if is_initial_userspace_entry {
        log::debug!("initial switch to userspace thread {}", new_thread.id);
        super::userspace_switch::switch_to_userspace(
            VirtAddr::new(new_thread.context.rip),
            VirtAddr::new(new_thread.context.rsp),
            new_thread.context.cs as u16,
            new_thread.context.ss as u16,
        );
    } else {
        context::perform_context_switch(&mut old_thread.context, &new_thread.context);
    }

    Ok(())
}

pub fn save_userspace_context(
    thread: &mut Thread,
    interrupt_frame: &InterruptStackFrame,
    saved_regs: &SavedRegisters,
) {
    thread.context.rax = saved_regs.rax;
    thread.context.rbx = saved_regs.rbx;
    thread.context.rcx = saved_regs.rcx;
    thread.context.rdx = saved_regs.rdx;
    thread.context.rsi = saved_regs.rsi;
    thread.context.rdi = saved_regs.rdi;
    thread.context.rbp = saved_regs.rbp;
    thread.context.r8 = saved_regs.r8;
    thread.context.r9 = saved_regs.r9;
    thread.context.r10 = saved_regs.r10;
    thread.context.r11 = saved_regs.r11;
    thread.context.r12 = saved_regs.r12;
    thread.context.r13 = saved_regs.r13;
    thread.context.r14 = saved_regs.r14;
    thread.context.r15 = saved_regs.r15;

    thread.context.rip = interrupt_frame.instruction_pointer.as_u64();
    thread.context.rsp = interrupt_frame.stack_pointer.as_u64();
    thread.context.rflags = interrupt_frame.cpu_flags.bits();
    thread.context.cs = interrupt_frame.code_segment.0 as u64;
    thread.context.ss = interrupt_frame.stack_segment.0 as u64;
}

pub fn restore_userspace_context(
    thread: &Thread,
    interrupt_frame: &mut InterruptStackFrame,
    saved_regs: &mut SavedRegisters,
) {
    saved_regs.rax = thread.context.rax;
    saved_regs.rbx = thread.context.rbx;
    saved_regs.rcx = thread.context.rcx;
    saved_regs.rdx = thread.context.rdx;
    saved_regs.rsi = thread.context.rsi;
    saved_regs.rdi = thread.context.rdi;
    saved_regs.rbp = thread.context.rbp;
    saved_regs.r8 = thread.context.r8;
    saved_regs.r9 = thread.context.r9;
    saved_regs.r10 = thread.context.r10;
    saved_regs.r11 = thread.context.r11;
    saved_regs.r12 = thread.context.r12;
    saved_regs.r13 = thread.context.r13;
    saved_regs.r14 = thread.context.r14;
    saved_regs.r15 = thread.context.r15;

    unsafe {
        interrupt_frame.as_mut().update(|frame| {
            frame.instruction_pointer = VirtAddr::new(thread.context.rip);
            frame.stack_pointer = VirtAddr::new(thread.context.rsp);
            frame.cpu_flags =
                x86_64::registers::rflags::RFlags::from_bits_truncate(thread.context.rflags);
        });
    }
}
