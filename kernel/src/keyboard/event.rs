use super::modifiers::Modifiers;

#[derive(Debug, Clone, Copy)]
pub struct KeyEvent {
    pub character: char,
    pub ctrl: bool,
}

impl KeyEvent {
    pub fn new(character: char, modifiers: &Modifiers) -> Self {
        Self { character, ctrl: modifiers.ctrl() }
    }
}
