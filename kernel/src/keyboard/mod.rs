//! PS/2 keyboard scancode decoding.
//!
//! Decoding happens synchronously inline in the IRQ1 handler (no queue,
//! no async task): the ISR runs to completion quickly, so there is no
//! need to defer decoding to a bottom half.

pub mod event;
pub mod modifiers;
pub mod scancodes;

pub use event::KeyEvent;
use modifiers::Modifiers;
use spin::Mutex;

static MODIFIERS: Mutex<Modifiers> = Mutex::new(Modifiers::new());

/// Reset modifier state. Called once at boot.
pub fn init() {
    *MODIFIERS.lock() = Modifiers::new();
}

/// Decode one PS/2 set-1 scancode, tracking modifier state across calls.
/// Returns `None` for key releases, modifier keys, and unmapped scancodes.
pub fn process_scancode(scancode: u8) -> Option<KeyEvent> {
    let mut modifiers = MODIFIERS.lock();

    if modifiers.update(scancode) {
        return None;
    }

    // Bit 7 set means key release.
    if scancode & 0x80 != 0 {
        return None;
    }

    let key = scancodes::KEYS[scancode as usize]?;
    let character = modifiers.apply_to(key);
    Some(KeyEvent::new(character, &modifiers))
}
