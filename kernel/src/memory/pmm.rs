//! Physical memory manager: 4 KiB / 2 MiB bitmap-and-stack frame allocator.
//!
//! Grounded on the teacher's `frame_allocator.rs` for the overall
//! `OnceCell`-guarded `Mutex<State>` shape, extended per spec.md §4.1 with
//! the two-granularity bitmap/stack design the teacher's bump allocator
//! does not have.
//!
//! Consistency invariant (spec.md §8, property 1): for every 2 MiB
//! superframe `S`, `bitmap_2m[S] == 1` iff it was explicitly reserved or at
//! least one of its 512 constituent 4 KiB frames is used. The allocator
//! enforces this at every mutation point rather than checking it lazily.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::{PhysFrame, Size2MiB, Size4KiB};
use x86_64::PhysAddr;

pub const FRAME_SIZE: u64 = 4096;
pub const SUPERFRAME_SIZE: u64 = 2 * 1024 * 1024;
pub const FRAMES_PER_SUPERFRAME: u64 = SUPERFRAME_SIZE / FRAME_SIZE;

/// Upper bound on tracked physical memory (16 GiB). Static storage for the
/// bitmaps and free stacks lives in `.bss`, matching the "page-allocation
/// tables" reservation in `memory::layout`.
const MAX_FRAMES: usize = 4 * 1024 * 1024;
const MAX_SUPERFRAMES: usize = MAX_FRAMES / FRAMES_PER_SUPERFRAME as usize;
const WORDS_4K: usize = MAX_FRAMES / 64;
const WORDS_2M: usize = (MAX_SUPERFRAMES + 63) / 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4KiB,
    Size2MiB,
}

impl PageSize {
    fn bytes(self) -> u64 {
        match self {
            PageSize::Size4KiB => FRAME_SIZE,
            PageSize::Size2MiB => SUPERFRAME_SIZE,
        }
    }
}

struct Bitmap<const WORDS: usize> {
    words: [u64; WORDS],
}

impl<const WORDS: usize> Bitmap<WORDS> {
    const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    fn get(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize) {
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    fn clear(&mut self, idx: usize) {
        self.words[idx / 64] &= !(1 << (idx % 64));
    }
}

/// Free-frame stack metadata. The backing entry arrays live in their own
/// top-level statics (`STACK_4K_ENTRIES`/`STACK_2M_ENTRIES`) rather than
/// inline in `PmmState`, so that initializing `PmmState` never requires
/// materializing a multi-megabyte value on the stack — the arrays are
/// zero-initialized directly in `.bss` by the static initializer, not built
/// at runtime. This is what lets the PMM hand out frames before
/// `memory::heap::init()` has run: the heap's own page tables are built
/// from frames this allocator supplies.
struct StackMeta {
    built: bool,
    len: usize,
    top: usize,
}

impl StackMeta {
    const fn new() -> Self {
        Self {
            built: false,
            len: 0,
            top: 0,
        }
    }
}

static STACK_4K_ENTRIES: Mutex<[u32; MAX_FRAMES]> = Mutex::new([0; MAX_FRAMES]);
static STACK_2M_ENTRIES: Mutex<[u32; MAX_SUPERFRAMES]> = Mutex::new([0; MAX_SUPERFRAMES]);

/// PMM state. The bitmaps are plain fixed-size arrays so they can be
/// reserved/queried before the heap exists.
struct PmmState {
    used_4k: Bitmap<WORDS_4K>,
    used_2m: Bitmap<WORDS_2M>,
    reserved_4k: Bitmap<WORDS_4K>,
    reserved_2m: Bitmap<WORDS_2M>,
    total_frames: usize,
    stack_4k: StackMeta,
    stack_2m: StackMeta,
}

impl PmmState {
    const fn new() -> Self {
        Self {
            used_4k: Bitmap::new(),
            used_2m: Bitmap::new(),
            reserved_4k: Bitmap::new(),
            reserved_2m: Bitmap::new(),
            total_frames: 0,
            stack_4k: StackMeta::new(),
            stack_2m: StackMeta::new(),
        }
    }

    fn superframe_is_free(&self, sf: usize) -> bool {
        let base = sf * FRAMES_PER_SUPERFRAME as usize;
        (0..FRAMES_PER_SUPERFRAME as usize).all(|i| {
            let idx = base + i;
            idx >= self.total_frames || !self.used_4k.get(idx)
        })
    }

    fn reserve(&mut self, frame_start: u64, count: u64, size: PageSize) {
        match size {
            PageSize::Size4KiB => {
                for i in 0..count {
                    let idx = (frame_start + i) as usize;
                    if idx >= MAX_FRAMES {
                        continue;
                    }
                    self.used_4k.set(idx);
                    self.reserved_4k.set(idx);
                    let sf = idx / FRAMES_PER_SUPERFRAME as usize;
                    self.used_2m.set(sf);
                    self.reserved_2m.set(sf);
                }
            }
            PageSize::Size2MiB => {
                for i in 0..count {
                    let sf = (frame_start + i) as usize;
                    if sf >= MAX_SUPERFRAMES {
                        continue;
                    }
                    self.used_2m.set(sf);
                    self.reserved_2m.set(sf);
                    let base = sf * FRAMES_PER_SUPERFRAME as usize;
                    for j in 0..FRAMES_PER_SUPERFRAME as usize {
                        self.used_4k.set(base + j);
                        self.reserved_4k.set(base + j);
                    }
                }
            }
        }
    }

    fn build_free_stacks(&mut self) {
        let mut sf_entries = STACK_2M_ENTRIES.lock();
        let mut frame_entries = STACK_4K_ENTRIES.lock();
        let mut sf_len = 0usize;
        let mut frame_len = 0usize;

        let total_superframes = self.total_frames / FRAMES_PER_SUPERFRAME as usize;
        for sf in 0..total_superframes.min(MAX_SUPERFRAMES) {
            if self.used_2m.get(sf) {
                continue;
            }
            if self.superframe_is_free(sf) {
                sf_entries[sf_len] = sf as u32;
                sf_len += 1;
            } else {
                // Inconsistency: bitmap says free but a subframe is used.
                // Resolve per spec.md §4.1 by marking the superframe used.
                log::warn!("pmm: superframe {} inconsistent at boot, marking used", sf);
                self.used_2m.set(sf);
            }
        }

        for sf in 0..total_superframes.min(MAX_SUPERFRAMES) {
            if self.used_2m.get(sf) {
                continue;
            }
            let base = sf * FRAMES_PER_SUPERFRAME as usize;
            for i in 0..FRAMES_PER_SUPERFRAME as usize {
                let idx = base + i;
                if idx < self.total_frames && !self.used_4k.get(idx) {
                    frame_entries[frame_len] = idx as u32;
                    frame_len += 1;
                }
            }
        }

        log::info!(
            "pmm: {} free 2MiB superframes, {} free 4KiB frames",
            sf_len,
            frame_len
        );

        self.stack_2m = StackMeta {
            built: true,
            len: sf_len,
            top: 0,
        };
        self.stack_4k = StackMeta {
            built: true,
            len: frame_len,
            top: 0,
        };
    }

    fn allocate(&mut self, size: PageSize) -> Option<u64> {
        const MAX_RETRIES: u32 = 8;
        match size {
            PageSize::Size4KiB => {
                if !self.stack_4k.built || self.stack_4k.top >= self.stack_4k.len {
                    return None;
                }
                let entries = STACK_4K_ENTRIES.lock();
                let idx = entries[self.stack_4k.top] as usize;
                self.stack_4k.top += 1;
                self.used_4k.set(idx);
                let sf = idx / FRAMES_PER_SUPERFRAME as usize;
                self.used_2m.set(sf);
                Some((idx as u64) * FRAME_SIZE)
            }
            PageSize::Size2MiB => {
                for _ in 0..MAX_RETRIES {
                    if !self.stack_2m.built || self.stack_2m.top >= self.stack_2m.len {
                        return None;
                    }
                    let sf = {
                        let entries = STACK_2M_ENTRIES.lock();
                        let sf = entries[self.stack_2m.top] as usize;
                        self.stack_2m.top += 1;
                        sf
                    };
                    if !self.superframe_is_free(sf) {
                        // Defensive: someone raced us into a subframe. Drop
                        // this entry and retry per spec.md §9 (bounded retry).
                        log::warn!("pmm: superframe {} no longer free, retrying", sf);
                        continue;
                    }
                    let base = sf * FRAMES_PER_SUPERFRAME as usize;
                    for i in 0..FRAMES_PER_SUPERFRAME as usize {
                        self.used_4k.set(base + i);
                    }
                    self.used_2m.set(sf);
                    return Some((sf as u64) * SUPERFRAME_SIZE);
                }
                None
            }
        }
    }

    fn free(&mut self, addr: u64, size: PageSize) {
        match size {
            PageSize::Size4KiB => {
                let idx = (addr / FRAME_SIZE) as usize;
                if idx >= self.total_frames || !self.used_4k.get(idx) || self.reserved_4k.get(idx)
                {
                    return; // no-op: already free, out of range, or reserved
                }
                self.used_4k.clear(idx);
                let sf = idx / FRAMES_PER_SUPERFRAME as usize;
                if self.superframe_is_free(sf) && !self.reserved_2m.get(sf) {
                    self.used_2m.clear(sf);
                }
                if self.stack_4k.built && self.stack_4k.top > 0 {
                    self.stack_4k.top -= 1;
                    STACK_4K_ENTRIES.lock()[self.stack_4k.top] = idx as u32;
                }
            }
            PageSize::Size2MiB => {
                let sf = (addr / SUPERFRAME_SIZE) as usize;
                if sf >= MAX_SUPERFRAMES || !self.used_2m.get(sf) || self.reserved_2m.get(sf) {
                    return;
                }
                self.used_2m.clear(sf);
                if self.stack_2m.built && self.stack_2m.top > 0 {
                    self.stack_2m.top -= 1;
                    STACK_2M_ENTRIES.lock()[self.stack_2m.top] = sf as u32;
                }
                let base = sf * FRAMES_PER_SUPERFRAME as usize;
                for i in 0..FRAMES_PER_SUPERFRAME as usize {
                    let idx = base + i;
                    if self.reserved_4k.get(idx) {
                        continue;
                    }
                    if self.used_4k.get(idx) {
                        self.used_4k.clear(idx);
                    }
                    if self.stack_4k.built && self.stack_4k.top > 0 {
                        self.stack_4k.top -= 1;
                        STACK_4K_ENTRIES.lock()[self.stack_4k.top] = idx as u32;
                    }
                }
            }
        }
    }
}

static PMM: OnceCell<Mutex<PmmState>> = OnceCell::uninit();

/// Initialize the PMM from the UEFI memory map: reserve non-conventional
/// regions and the low-memory floor, then reserve the early regions the
/// caller names (heap, stack, page tables, framebuffer, PMM storage
/// itself), then build the free stacks.
pub fn init(memory_regions: &MemoryRegions, early_reserved: &[(u64, u64)]) {
    const LOW_MEMORY_FLOOR: u64 = 0x10_0000;

    let mut total_frames = 0usize;
    for region in memory_regions.iter() {
        let end_frame = (region.end / FRAME_SIZE) as usize;
        if end_frame > total_frames {
            total_frames = end_frame;
        }
    }
    total_frames = total_frames.min(MAX_FRAMES);

    // Built inside the `init_once` closure (rather than as a separate local
    // moved in afterward) so the compiler has the best chance of
    // constructing the multi-hundred-KiB bitmaps in place in the `OnceCell`
    // rather than on this function's stack.
    PMM.init_once(|| {
        let mut state = PmmState::new();
        state.total_frames = total_frames;

        // Reserve everything by default; usable regions get un-reserved
        // below. Simpler to express as: reserve all non-conventional
        // regions plus the low-memory floor, matching spec.md's
        // "non-conventional regions are reserved" rule.
        for region in memory_regions.iter() {
            if region.kind != MemoryRegionKind::Usable || region.start < LOW_MEMORY_FLOOR {
                let start_frame = region.start / FRAME_SIZE;
                let frames = (region.end - region.start).div_ceil(FRAME_SIZE);
                state.reserve(start_frame, frames, PageSize::Size4KiB);
            }
        }

        for &(base, size) in early_reserved {
            let start_frame = base / FRAME_SIZE;
            let frames = size.div_ceil(FRAME_SIZE);
            state.reserve(start_frame, frames, PageSize::Size4KiB);
        }

        state.build_free_stacks();

        Mutex::new(state)
    });
}

pub fn allocate(size: PageSize) -> Option<u64> {
    PMM.try_get().ok()?.lock().allocate(size)
}

pub fn free(addr: u64, size: PageSize) {
    if let Ok(pmm) = PMM.try_get() {
        pmm.lock().free(addr, size);
    }
}

pub fn allocate_frame_4k() -> Option<PhysFrame<Size4KiB>> {
    allocate(PageSize::Size4KiB).map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
}

pub fn free_frame_4k(frame: PhysFrame<Size4KiB>) {
    free(frame.start_address().as_u64(), PageSize::Size4KiB)
}

pub fn allocate_frame_2m() -> Option<PhysFrame<Size2MiB>> {
    allocate(PageSize::Size2MiB).map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
}

pub fn free_frame_2m(frame: PhysFrame<Size2MiB>) {
    free(frame.start_address().as_u64(), PageSize::Size2MiB)
}

/// Adapter implementing `x86_64::structures::paging::FrameAllocator` so the
/// PMM can be handed directly to `Mapper::map_to`.
pub struct GlobalFrameAllocator;

unsafe impl x86_64::structures::paging::FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        allocate_frame_4k()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> PmmState {
        let mut s = PmmState::new();
        s.total_frames = 4096; // 16 MiB worth of 4 KiB frames = 8 superframes
        s
    }

    #[test_case]
    fn superframe_bit_tracks_subframes() {
        let mut s = fresh();
        s.build_free_stacks();
        assert!(s.superframe_is_free(0));
        s.used_4k.set(3);
        assert!(!s.superframe_is_free(0));
    }

    #[test_case]
    fn alloc_free_restores_state() {
        let mut s = fresh();
        s.build_free_stacks();
        let before_top = s.stack_4k.top;
        let addr = s.allocate(PageSize::Size4KiB).expect("frame");
        assert!(s.used_4k.get((addr / FRAME_SIZE) as usize));
        s.free(addr, PageSize::Size4KiB);
        assert!(!s.used_4k.get((addr / FRAME_SIZE) as usize));
        assert_eq!(s.stack_4k.top, before_top);
    }

    #[test_case]
    fn two_mib_alloc_fails_with_one_subframe_reserved() {
        let mut s = fresh();
        s.reserve(3, 1, PageSize::Size4KiB); // reserve one 4KiB subframe of superframe 0
        s.build_free_stacks();
        // Superframe 0 should not have made it onto the 2MiB stack.
        let sf_entries = STACK_2M_ENTRIES.lock();
        assert!(!sf_entries[..s.stack_2m.len].contains(&0));
    }

    #[test_case]
    fn free_of_already_free_is_noop() {
        let mut s = fresh();
        s.build_free_stacks();
        let top_before = s.stack_4k.top;
        s.free(0, PageSize::Size4KiB); // frame 0 was never allocated
        assert_eq!(s.stack_4k.top, top_before);
    }
}
