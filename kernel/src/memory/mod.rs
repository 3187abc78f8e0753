pub mod cow_stats;
pub mod fork_helpers;
pub mod frame_metadata;
pub mod heap;
pub mod kernel_page_table;
pub mod kernel_stack;
pub mod layout;
pub mod paging;
pub mod pmm;
pub mod pool;
pub mod process_memory;
pub mod stack;
pub mod tlb;
pub mod vma;

use bootloader_api::info::MemoryRegions;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::structures::paging::{Mapper, Page, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

/// Global physical memory offset for use throughout the kernel
static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

/// Next available MMIO virtual address, carved out of the framebuffer slice
/// of the layout (MMIO devices this kernel touches — the framebuffer itself,
/// ATA's legacy ports — don't need arbitrary MMIO windows, but the helper is
/// kept for completeness).
static MMIO_NEXT_ADDR: Mutex<u64> = Mutex::new(layout::FRAMEBUFFER_BASE + (64 * 1024 * 1024 * 1024));

/// Initialize the memory subsystem: PMM, paging, kernel heap, kernel stacks.
///
/// Early-reserved regions (heap, kernel stacks area, page-table metadata
/// area) are passed to the PMM so its free stacks never hand out frames that
/// back fixed kernel structures.
pub fn init(physical_memory_offset: VirtAddr, memory_regions: &'static MemoryRegions) {
    log::info!("initializing memory management");
    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);

    layout::log_layout();

    pmm::init(memory_regions, &[]);

    let mapper = unsafe { paging::init(physical_memory_offset) };

    kernel_page_table::init(physical_memory_offset);
    kernel_page_table::build_master_kernel_pml4();
    process_memory::init_kernel_page_table();

    unsafe {
        paging::enable_global_pages();
    }

    let mapper = unsafe {
        let _ = mapper;
        paging::init(physical_memory_offset)
    };

    log::info!("initializing heap allocator");
    heap::init(&mapper).expect("heap initialization failed");

    log::info!("initializing kernel stack allocator");
    stack::init();
    kernel_stack::init();

    log::info!("memory management initialized");
}

/// Get the physical memory offset
pub fn physical_memory_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET
        .get()
        .expect("physical memory offset not initialized")
}

/// Convert a physical address to a virtual address using the offset mapping
pub fn phys_to_virt(phys: PhysAddr, offset: VirtAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + offset.as_u64())
}

/// Allocate a kernel stack. Size is ignored: every kernel stack is the
/// fixed size `kernel_stack` hands out, plus one guard page.
pub fn alloc_kernel_stack(_size: usize) -> Option<kernel_stack::KernelStack> {
    kernel_stack::allocate_kernel_stack().ok()
}

/// Map a physical MMIO region into kernel virtual address space, returning
/// the virtual address it was mapped at.
pub fn map_mmio(phys_addr: u64, size: usize) -> Result<usize, &'static str> {
    let phys_offset = physical_memory_offset();
    let size_aligned = (size + 0xFFF) & !0xFFF;
    let num_pages = size_aligned / 4096;

    let virt_addr = {
        let mut next = MMIO_NEXT_ADDR.lock();
        let addr = *next;
        *next += size_aligned as u64;
        addr
    };

    log::info!(
        "mmio: mapping {:#x} -> {:#x} ({} pages)",
        phys_addr,
        virt_addr,
        num_pages
    );

    let mut mapper = unsafe { paging::get_mapper_with_offset(phys_offset) };

    for i in 0..num_pages {
        let page_phys = phys_addr + (i * 4096) as u64;
        let page_virt = virt_addr + (i * 4096) as u64;

        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(page_virt));
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(page_phys));

        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::NO_CACHE
            | PageTableFlags::WRITE_THROUGH;

        unsafe {
            mapper
                .map_to(page, frame, flags, &mut pmm::GlobalFrameAllocator)
                .map_err(|_| "failed to map MMIO page")?
                .flush();
        }
    }

    Ok(virt_addr as usize)
}
