//! Kernel-to-userspace transition via IRETQ.
//!
//! Grounded on `task/userspace_switch.rs`, unchanged.

use x86_64::registers::segmentation::{Segment, CS};
use x86_64::VirtAddr;

/// Switch to a userspace thread. Never returns.
///
/// # Safety
/// `entry_point`/`stack_pointer` must be valid, mapped, user-accessible
/// addresses in the currently loaded page table, and the segment selectors
/// must carry RPL=3.
pub unsafe fn switch_to_userspace(
    entry_point: VirtAddr,
    stack_pointer: VirtAddr,
    user_code_segment: u16,
    user_data_segment: u16,
) -> ! {
    log::info!(
        "switching to userspace: entry={:#x}, stack={:#x}, cs={:#x}, ss={:#x}",
        entry_point,
        stack_pointer,
        user_code_segment,
        user_data_segment
    );
    log::debug!("current CS: {:#x}", CS::get_reg().0);

    core::arch::asm!(
        "mov ax, {0:x}",
        "mov ds, ax",
        "mov es, ax",
        in(reg) user_data_segment,
    );

    assert!((user_code_segment & 3) == 3, "CS must have RPL=3");
    assert!((user_data_segment & 3) == 3, "SS must have RPL=3");

    core::arch::asm!(
        "push {ss}",
        "push {rsp}",
        "push 0x202",
        "push {cs}",
        "push {rip}",
        "iretq",
        ss = in(reg) user_data_segment as u64,
        rsp = in(reg) stack_pointer.as_u64(),
        cs = in(reg) user_code_segment as u64,
        rip = in(reg) entry_point.as_u64(),
        options(noreturn)
    );
}

/// Switch to userspace using the thread's saved context and the GDT's
/// registered user segment selectors.
///
/// # Safety
/// Same requirements as `switch_to_userspace`.
pub unsafe fn scheduler_switch_to_userspace(thread: &super::thread::Thread) -> ! {
    let user_cs = crate::gdt::USER_CODE_SELECTOR.0 | 3;
    let user_ds = crate::gdt::USER_DATA_SELECTOR.0 | 3;

    switch_to_userspace(
        VirtAddr::new(thread.context.rip),
        VirtAddr::new(thread.context.rsp),
        user_cs,
        user_ds,
    )
}
