//! Boot orchestration: the subsystem init order shared by the real
//! entry point (`main.rs`) and, behind `testing`, the in-kernel test
//! harness.
//!
//! Order matters: serial/logger before anything that logs, GDT/IDT
//! before enabling interrupts, memory before anything that allocates,
//! per-CPU data before the scheduler, devices and block/fs before the
//! first user process.

use bootloader_api::BootInfo;

/// Run every subsystem's init routine in dependency order. Does not
/// enable interrupts and does not start the scheduler; callers decide
/// when it's safe to do that (`run_to_completion` does both).
pub fn init(boot_info: &'static mut BootInfo) {
    crate::serial::init();
    crate::logger::init_early();
    crate::logger::serial_ready();
    log::info!("Serial port initialized");

    // Pull out what later steps need before handing `boot_info` (a unique
    // reference, not `Copy`) to `framebuffer::init`.
    let physical_memory_offset = boot_info
        .physical_memory_offset
        .into_option()
        .map(x86_64::VirtAddr::new)
        .expect("bootloader did not map physical memory");
    // Raw pointer, not a reference: taking `&boot_info.memory_regions` here
    // would freeze `boot_info` for a borrow that outlives the `framebuffer::init`
    // move below. The pointer is valid because the bootloader never reclaims it.
    let memory_regions_ptr: *const bootloader_api::info::MemoryRegions = &boot_info.memory_regions;
    log::info!("Physical memory offset available: {:#x}", physical_memory_offset.as_u64());

    crate::framebuffer::init(boot_info);

    crate::interrupts::init();
    log::info!("GDT initialized");
    log::info!("IDT loaded successfully");

    let memory_regions: &'static bootloader_api::info::MemoryRegions =
        unsafe { &*memory_regions_ptr };
    crate::memory::init(physical_memory_offset, memory_regions);
    log::info!("Memory management initialized");

    crate::per_cpu::init();
    crate::process::init();
    crate::device::init();
    crate::tty::init();
    crate::syscall::init();
    crate::keyboard::init();
    log::info!("Keyboard queue initialized");

    crate::interrupts::init_pic();
    log::info!("PIC initialized");

    spawn_idle_thread();

    match crate::block::ata_pio::init() {
        Ok(()) => match crate::fs::ext2::init_root_fs() {
            Ok(()) => spawn_init_process(),
            Err(e) => log::warn!("ext2: root filesystem not mounted: {}", e),
        },
        Err(e) => log::warn!("ata_pio: no root block device: {}", e),
    }
}

fn spawn_idle_thread() {
    extern "C" fn idle_entry(_arg: u64) -> ! {
        loop {
            x86_64::instructions::hlt();
        }
    }

    match crate::process::thread::Thread::new_kernel(
        alloc::string::String::from("idle"),
        idle_entry,
        0,
    ) {
        Ok(thread) => crate::process::scheduler::init(alloc::boxed::Box::new(thread)),
        Err(e) => log::error!("failed to create idle thread: {}", e),
    }
}

/// Resolve and ELF-load `/bin/init` as pid 1, if the root filesystem has one.
fn spawn_init_process() {
    let inode_num = {
        let fs_guard = crate::fs::ext2::root_fs();
        let fs = match fs_guard.as_ref() {
            Some(fs) => fs,
            None => return,
        };
        match fs.resolve_path("/bin/init") {
            Ok(n) => n,
            Err(e) => {
                log::warn!("boot: /bin/init not found: {}", e);
                return;
            }
        }
    };

    let elf_data = {
        let fs_guard = crate::fs::ext2::root_fs();
        let fs = fs_guard.as_ref().expect("root fs vanished");
        let inode = match fs.read_inode(inode_num) {
            Ok(i) => i,
            Err(e) => {
                log::error!("boot: failed to read /bin/init inode: {}", e);
                return;
            }
        };
        match fs.read_file_content(&inode) {
            Ok(data) => data,
            Err(e) => {
                log::error!("boot: failed to read /bin/init contents: {}", e);
                return;
            }
        }
    };

    match crate::process::creation::init_user_process(&elf_data) {
        Ok(pid) => log::info!("boot: started init as pid {}", pid.as_u64()),
        Err(e) => log::error!("boot: failed to start init: {}", e),
    }
}

/// Enable interrupts and let the scheduler's timer tick take over. Never
/// returns.
pub fn run_to_completion() -> ! {
    log::info!("Interrupts enabled!");
    x86_64::instructions::interrupts::enable();
    crate::hlt_loop();
}
