//! Canonical kernel virtual memory layout.
//!
//! All addresses below are in the shared upper half of every address space
//! (top 256 PML4 entries), copied verbatim into every process's root table
//! by [`crate::memory::process_memory`]. User halves differ per process.

use x86_64::VirtAddr;

const TIB: u64 = 1 << 40;

/// Kernel code and data, mapped 1:1 from the bootloader's physical-memory offset.
pub const KERNEL_CODE_BASE: u64 = 128 * TIB;
/// Kernel and interrupt (IST) stacks.
pub const KERNEL_STACKS_BASE: u64 = 129 * TIB;
/// The kernel heap (first-fit free list, see [`crate::memory::heap`]).
pub const KERNEL_HEAP_BASE: u64 = 130 * TIB;
/// Backing store for page-allocation metadata (PMM bitmaps).
pub const PAGE_TABLES_AREA_BASE: u64 = 131 * TIB;
/// Kernel global-state singleton ([`crate::context`]).
pub const GLOBALS_BASE: u64 = 134 * TIB;
/// Linear framebuffer, mapped once by the fbcon device.
pub const FRAMEBUFFER_BASE: u64 = 135 * TIB;
/// First object-pool reservation; each pool gets a 1 TiB slice.
pub const POOL_AREA_BASE: u64 = 141 * TIB;
/// PID/PGID/SID hash-table node arenas.
pub const PID_TABLE_AREA_BASE: u64 = 144 * TIB;

/// Size of a single pool's virtual reservation.
pub const POOL_RESERVATION_SIZE: u64 = TIB;

/// Default kernel heap size (demand-mapped, grows on fault up to this bound).
pub const KERNEL_HEAP_SIZE: u64 = 256 * 1024 * 1024;

/// Fixed low virtual address of a freshly exec'd process's user stack.
///
/// Every process uses the same address; disambiguation between concurrent
/// processes relies entirely on each having its own PML4 (see spec Open
/// Questions).
pub const USER_STACK_BASE: u64 = 0x0060_0000;
pub const USER_STACK_SIZE: u64 = 2 * 1024 * 1024;

/// Region used for argv/envp string and pointer tables built at exec time.
pub const USER_ARGS_BASE: u64 = USER_STACK_BASE + USER_STACK_SIZE;
pub const USER_ARGS_SIZE: u64 = 2 * 1024 * 1024;

/// Size of one kernel-mirror "slot": the window the kernel uses to
/// dereference a given process's validated user pointers without switching
/// CR3. Process with kernel-memory-index `i` is pre-mapped at
/// `u + (KERNEL_MIRROR_SLOT_SIZE * (2 + i))`.
pub const KERNEL_MIRROR_SLOT_SIZE: u64 = 2 * TIB;
pub const KERNEL_MIRROR_BASE: u64 = 160 * TIB;

/// Translate a user virtual address into the kernel-mapped mirror used to
/// read/write a given process's memory without switching address spaces.
///
/// Mirrors spec.md §4.2's `kernel_address_of_user` helper.
pub fn kernel_address_of_user(user_addr: VirtAddr, kernel_mem_index: u64) -> VirtAddr {
    VirtAddr::new(
        KERNEL_MIRROR_BASE + KERNEL_MIRROR_SLOT_SIZE * (2 + kernel_mem_index) + user_addr.as_u64(),
    )
}

pub fn log_layout() {
    log::info!("kernel layout:");
    log::info!("  code       @ {:#x}", KERNEL_CODE_BASE);
    log::info!("  stacks     @ {:#x}", KERNEL_STACKS_BASE);
    log::info!("  heap       @ {:#x} (+{:#x})", KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE);
    log::info!("  page tbls  @ {:#x}", PAGE_TABLES_AREA_BASE);
    log::info!("  globals    @ {:#x}", GLOBALS_BASE);
    log::info!("  framebuf   @ {:#x}", FRAMEBUFFER_BASE);
    log::info!("  pools      @ {:#x} (+{:#x} each)", POOL_AREA_BASE, POOL_RESERVATION_SIZE);
    log::info!("  pid tables @ {:#x}", PID_TABLE_AREA_BASE);
}
