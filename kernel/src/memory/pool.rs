//! Fixed-size object pools: one 1 TiB virtual reservation per pool, demand
//! paged, bump-allocated forward with a free stack growing down from the
//! top of the reservation.
//!
//! Grounded on `original_source/src/memory/kpool.c` / `include/memory/kpool.h`
//! (no teacher equivalent — the teacher uses the global heap for everything).
//! Pool control state itself is kept in a kernel-side registry indexed by
//! slot rather than stored at the pool's own base address, since unlike the
//! original this kernel already has a working heap by the time pools are
//! created.

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::structures::paging::{Mapper, OffsetPageTable, Page, PageTableFlags, Size4KiB};
use x86_64::VirtAddr;

use crate::memory::layout::{POOL_AREA_BASE, POOL_RESERVATION_SIZE};
use crate::memory::pmm::{self, GlobalFrameAllocator};

const MAX_POOLS: usize = 16;

static NEXT_POOL_SLOT: AtomicUsize = AtomicUsize::new(0);
static POOL_SLOTS: [Mutex<Option<PoolState>>; MAX_POOLS] =
    [const { Mutex::new(None) }; MAX_POOLS];

struct PoolState {
    base: u64,
    obj_size: u64,
    alloc_ptr: u64,
    free_stack_top: u64,
    free_stack_limit: u64,
}

/// A fixed-size object pool. `Clone` is cheap: it is just a slot index.
#[derive(Clone, Copy)]
pub struct Pool {
    slot: usize,
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn ensure_page_mapped(mapper: &mut OffsetPageTable<'static>, addr: u64) {
    use x86_64::structures::paging::mapper::Translate;

    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(addr));
    if mapper.translate_addr(page.start_address()).is_some() {
        return;
    }
    let frame = pmm::allocate_frame_4k().expect("pool: out of physical memory");
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    unsafe {
        mapper
            .map_to(page, frame, flags, &mut GlobalFrameAllocator)
            .expect("pool: map_to failed")
            .flush();
    }
}

impl Pool {
    /// Reserve a fresh 1 TiB pool slot for objects of `element_size`, aligned
    /// to `alignment`. Maps the first 4 KiB page for immediate allocation.
    pub fn create(element_size: u64, alignment: u64) -> Pool {
        let slot = NEXT_POOL_SLOT.fetch_add(1, Ordering::SeqCst);
        assert!(slot < MAX_POOLS, "pool: out of pool slots");

        let base = POOL_AREA_BASE + POOL_RESERVATION_SIZE * slot as u64;
        let obj_size = align_up(element_size, alignment);
        let alloc_ptr = align_up(base, alignment);

        let mut mapper = unsafe { crate::memory::paging::get_mapper() };
        ensure_page_mapped(&mut mapper, base);

        *POOL_SLOTS[slot].lock() = Some(PoolState {
            base,
            obj_size,
            alloc_ptr,
            free_stack_top: base + POOL_RESERVATION_SIZE,
            free_stack_limit: base + POOL_RESERVATION_SIZE,
        });

        log::info!(
            "pool: created slot {} at {:#x}, obj_size={}",
            slot,
            base,
            obj_size
        );

        Pool { slot }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PoolState, &mut OffsetPageTable<'static>) -> R) -> R {
        let mut guard = POOL_SLOTS[self.slot].lock();
        let state = guard.as_mut().expect("pool: slot not initialized");
        let mut mapper = unsafe { crate::memory::paging::get_mapper() };
        f(state, &mut mapper)
    }

    /// Allocate one object. Reuses a freed object if the free stack is
    /// non-empty, otherwise bumps `alloc_ptr`, mapping fresh pages as the
    /// bump pointer crosses page boundaries.
    pub fn allocate(&self) -> Option<*mut u8> {
        self.with_state(|state, mapper| {
            if state.free_stack_top < state.base + POOL_RESERVATION_SIZE {
                let ptr = unsafe { *(state.free_stack_top as *const u64) };
                state.free_stack_top += core::mem::size_of::<u64>() as u64;
                return Some(ptr as *mut u8);
            }

            let addr = state.alloc_ptr;
            if addr + state.obj_size > state.base + POOL_RESERVATION_SIZE {
                return None; // pool exhausted
            }

            ensure_page_mapped(mapper, addr);
            ensure_page_mapped(mapper, addr + state.obj_size - 1);

            state.alloc_ptr = addr + state.obj_size;
            Some(addr as *mut u8)
        })
    }

    /// Return an object to the pool. The owning pool is found by the caller
    /// (see [`owning_pool`]); this only pushes onto that pool's free stack,
    /// growing the free-stack region downward and mapping pages as needed.
    pub fn free(&self, ptr: *mut u8) {
        self.with_state(|state, mapper| {
            if state.free_stack_limit == state.free_stack_top {
                state.free_stack_limit -= 4096;
                ensure_page_mapped(mapper, state.free_stack_limit);
            }
            state.free_stack_top -= core::mem::size_of::<u64>() as u64;
            unsafe {
                *(state.free_stack_top as *mut u64) = ptr as u64;
            }
        })
    }
}

/// Find the pool owning `ptr` by flooring to the 1 TiB pool-reservation
/// boundary, matching the original's `ALIGN_DOWN(ptr, 1TiB)` recovery trick.
pub fn owning_pool(ptr: *mut u8) -> Option<Pool> {
    let addr = ptr as u64;
    if addr < POOL_AREA_BASE {
        return None;
    }
    let slot = ((addr - POOL_AREA_BASE) / POOL_RESERVATION_SIZE) as usize;
    if slot >= MAX_POOLS || POOL_SLOTS[slot].lock().is_none() {
        return None;
    }
    Some(Pool { slot })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
    }
}
