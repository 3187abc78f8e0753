//! PS/2 set-1 scancode tables for a US QWERTY layout.

#[derive(Debug, Clone, Copy)]
pub struct Key {
    pub lower: char,
    pub upper: char,
}

macro_rules! key {
    ($lower:expr, $upper:expr) => {
        Some(Key { lower: $lower, upper: $upper })
    };
}

/// Scancode (press, bit 7 clear) -> key. `None` for unmapped/unsupported
/// keys (function keys, numpad, arrows, etc. are out of scope).
pub const KEYS: [Option<Key>; 128] = [
    // 0x00
    None,
    None, // Escape
    key!('1', '!'),
    key!('2', '@'),
    key!('3', '#'),
    key!('4', '$'),
    key!('5', '%'),
    key!('6', '^'),
    // 0x08
    key!('7', '&'),
    key!('8', '*'),
    key!('9', '('),
    key!('0', ')'),
    key!('-', '_'),
    key!('=', '+'),
    key!('\x08', '\x08'), // Backspace
    key!('\t', '\t'),
    // 0x10
    key!('q', 'Q'),
    key!('w', 'W'),
    key!('e', 'E'),
    key!('r', 'R'),
    key!('t', 'T'),
    key!('y', 'Y'),
    key!('u', 'U'),
    key!('i', 'I'),
    // 0x18
    key!('o', 'O'),
    key!('p', 'P'),
    key!('[', '{'),
    key!(']', '}'),
    key!('\n', '\n'), // Enter
    None,              // Left Control
    key!('a', 'A'),
    key!('s', 'S'),
    // 0x20
    key!('d', 'D'),
    key!('f', 'F'),
    key!('g', 'G'),
    key!('h', 'H'),
    key!('j', 'J'),
    key!('k', 'K'),
    key!('l', 'L'),
    key!(';', ':'),
    // 0x28
    key!('\'', '"'),
    key!('`', '~'),
    None, // Left Shift
    key!('\\', '|'),
    key!('z', 'Z'),
    key!('x', 'X'),
    key!('c', 'C'),
    key!('v', 'V'),
    // 0x30
    key!('b', 'B'),
    key!('n', 'N'),
    key!('m', 'M'),
    key!(',', '<'),
    key!('.', '>'),
    key!('/', '?'),
    None, // Right Shift
    None, // Keypad *
    // 0x38
    None,           // Left Alt
    key!(' ', ' '), // Space
    None,           // Caps Lock
    None, None, None, None, None, // F1-F5
    // 0x40
    None, None, None, None, None, None, None, None,
    // 0x48
    None, None, None, None, None, None, None, None,
    // 0x50
    None, None, None, None, None, None, None, None,
    // 0x58
    None, None, None, None, None, None, None, None,
    // 0x60-0x7F
    None, None, None, None, None, None, None, None,
    None, None, None, None, None, None, None, None,
    None, None, None, None, None, None, None, None,
    None, None, None, None, None, None, None, None,
];

pub const LEFT_SHIFT_PRESSED: u8 = 0x2A;
pub const LEFT_SHIFT_RELEASED: u8 = 0xAA;
pub const RIGHT_SHIFT_PRESSED: u8 = 0x36;
pub const RIGHT_SHIFT_RELEASED: u8 = 0xB6;
pub const LEFT_CTRL_PRESSED: u8 = 0x1D;
pub const LEFT_CTRL_RELEASED: u8 = 0x9D;
pub const LEFT_ALT_PRESSED: u8 = 0x38;
pub const LEFT_ALT_RELEASED: u8 = 0xB8;
pub const CAPS_LOCK_PRESSED: u8 = 0x3A;
