//! Boot-time framebuffer hookup.
//!
//! The bootloader hands us a raw pixel buffer in `BootInfo`; this module's
//! only job is wiring that buffer into `logger`'s framebuffer text sink
//! (`interactive` feature) or leaving it untouched otherwise (`logger`
//! still needs the buffer to draw its own non-interactive log console).

use bootloader_api::BootInfo;

/// Hand the bootloader's framebuffer to the logger, if one was provided.
///
/// Some virtual machine configurations boot without a GOP/VBE framebuffer;
/// in that case logging falls back to serial only.
///
/// `boot_info` is valid for the remainder of the kernel's life (the
/// bootloader places it in memory it never reclaims), so the buffer
/// borrowed from it is extended to `'static` rather than tied to this
/// function's short-lived `&mut BootInfo` parameter.
pub fn init(boot_info: &'static mut BootInfo) {
    match boot_info.framebuffer.as_mut() {
        Some(fb) => {
            let info = fb.info();
            let buffer: &'static mut [u8] = unsafe { &mut *(fb.buffer_mut() as *mut [u8]) };
            crate::logger::init_framebuffer(buffer, info);
        }
        None => {
            log::warn!("No framebuffer provided by bootloader; logging to serial only");
        }
    }
}
