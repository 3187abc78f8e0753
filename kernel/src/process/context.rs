//! Low-level register-set context switch.
//!
//! Grounded on `task/context.rs`'s `switch_context`/`switch_to_thread`
//! assembly stubs, kept unchanged — the `CpuContext` layout they index into
//! by byte offset is identical to `process::thread::CpuContext`.

use super::thread::CpuContext;
use core::arch::global_asm;

global_asm!(r#"
.global switch_context
.global switch_to_thread

// switch_context(old_context: *mut CpuContext, new_context: *const CpuContext)
// RDI = old_context pointer
// RSI = new_context pointer
switch_context:
    mov [rdi + 0x00], rax
    mov [rdi + 0x08], rbx
    mov [rdi + 0x10], rcx
    mov [rdi + 0x18], rdx
    mov [rdi + 0x20], rsi
    mov [rdi + 0x28], rdi
    mov [rdi + 0x30], rbp
    mov [rdi + 0x38], rsp
    mov [rdi + 0x40], r8
    mov [rdi + 0x48], r9
    mov [rdi + 0x50], r10
    mov [rdi + 0x58], r11
    mov [rdi + 0x60], r12
    mov [rdi + 0x68], r13
    mov [rdi + 0x70], r14
    mov [rdi + 0x78], r15

    mov rax, [rsp]
    mov [rdi + 0x80], rax

    pushfq
    pop rax
    mov [rdi + 0x88], rax

    mov rax, [rsi + 0x88]
    push rax
    popfq

    mov rax, [rsi + 0x00]
    mov rbx, [rsi + 0x08]
    mov rcx, [rsi + 0x10]
    mov rdx, [rsi + 0x18]
    mov rbp, [rsi + 0x30]
    mov r8,  [rsi + 0x40]
    mov r9,  [rsi + 0x48]
    mov r10, [rsi + 0x50]
    mov r11, [rsi + 0x58]
    mov r12, [rsi + 0x60]
    mov r13, [rsi + 0x68]
    mov r14, [rsi + 0x70]
    mov r15, [rsi + 0x78]

    mov rax, [rsi + 0x80]
    mov rsp, [rsi + 0x38]

    mov rdi, [rsi + 0x28]
    mov rsi, [rsi + 0x20]

    jmp rax

// switch_to_thread(new_context: *const CpuContext) -> !
// RDI = new_context pointer
switch_to_thread:
    mov rax, [rdi + 0x88]
    push rax
    popfq

    mov rax, [rdi + 0x00]
    mov rbx, [rdi + 0x08]
    mov rcx, [rdi + 0x10]
    mov rdx, [rdi + 0x18]
    mov rsi, [rdi + 0x20]
    mov rbp, [rdi + 0x30]
    mov rsp, [rdi + 0x38]
    mov r8,  [rdi + 0x40]
    mov r9,  [rdi + 0x48]
    mov r10, [rdi + 0x50]
    mov r11, [rdi + 0x58]
    mov r12, [rdi + 0x60]
    mov r13, [rdi + 0x68]
    mov r14, [rdi + 0x70]
    mov r15, [rdi + 0x78]

    mov rax, [rdi + 0x80]
    mov rdi, [rdi + 0x28]

    jmp rax
"#);

extern "C" {
    fn switch_context(old_context: *mut CpuContext, new_context: *const CpuContext);
    fn switch_to_thread(new_context: *const CpuContext) -> !;
}

/// # Safety
/// Both context pointers must be valid and properly aligned.
pub unsafe fn perform_context_switch(old_context: &mut CpuContext, new_context: &CpuContext) {
    switch_context(old_context as *mut CpuContext, new_context as *const CpuContext);
}

/// # Safety
/// The context must be valid and fully initialized.
pub unsafe fn perform_initial_switch(new_context: &CpuContext) -> ! {
    switch_to_thread(new_context as *const CpuContext);
}
