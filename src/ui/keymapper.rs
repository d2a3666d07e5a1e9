//! Key mapping for terminal input
//!
//! Converts crossterm key events to the byte sequences a VT100 host
//! expects. Cursor keys follow the application-cursor mode the host set.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::core::term::TerminalModes;

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

/// Key that leaves the front end (Ctrl+])
pub fn is_quit_key(event: &KeyEvent) -> bool {
    event.modifiers.contains(KeyModifiers::CONTROL) && event.code == KeyCode::Char(']')
}

pub struct KeyMapper;

impl KeyMapper {
    /// Map a crossterm KeyEvent to bytes for the host. Key releases and
    /// keys with no VT encoding map to None.
    pub fn map(event: &KeyEvent, modes: TerminalModes) -> Option<Vec<u8>> {
        if event.kind == KeyEventKind::Release {
            return None;
        }
        let mods = Modifiers::from(event.modifiers);

        match event.code {
            KeyCode::Char(ch) => Some(Self::map_char(ch, mods)),
            KeyCode::Enter => Some(vec![0x0D]),
            KeyCode::Backspace => {
                if mods.contains(Modifiers::ALT) {
                    Some(vec![0x1B, 0x08])
                } else {
                    Some(vec![0x08])
                }
            }
            KeyCode::Tab => Some(vec![0x09]),
            KeyCode::BackTab => Some(b"\x1b[Z".to_vec()),
            KeyCode::Esc => Some(vec![0x1B]),

            KeyCode::Up => Some(Self::cursor_key(b'A', mods, modes)),
            KeyCode::Down => Some(Self::cursor_key(b'B', mods, modes)),
            KeyCode::Right => Some(Self::cursor_key(b'C', mods, modes)),
            KeyCode::Left => Some(Self::cursor_key(b'D', mods, modes)),
            KeyCode::Home => Some(Self::cursor_key(b'H', mods, modes)),
            KeyCode::End => Some(Self::cursor_key(b'F', mods, modes)),

            KeyCode::PageUp => Some(Self::tilde_key(5, mods)),
            KeyCode::PageDown => Some(Self::tilde_key(6, mods)),
            KeyCode::Insert => Some(Self::tilde_key(2, mods)),
            KeyCode::Delete => Some(Self::tilde_key(3, mods)),

            KeyCode::F(n) => Self::function_key(n, mods),

            _ => None,
        }
    }

    fn map_char(ch: char, mods: Modifiers) -> Vec<u8> {
        let ctrl = mods.contains(Modifiers::CTRL);
        let alt = mods.contains(Modifiers::ALT);

        if ctrl {
            let code = if ch.is_ascii_alphabetic() {
                Some(ch.to_ascii_lowercase() as u8 - b'a' + 1)
            } else {
                match ch {
                    '@' | ' ' | '2' => Some(0x00),
                    '[' | '3' => Some(0x1B),
                    '\\' | '4' => Some(0x1C),
                    ']' | '5' => Some(0x1D),
                    '^' | '6' => Some(0x1E),
                    '_' | '/' | '7' => Some(0x1F),
                    _ => None,
                }
            };
            if let Some(code) = code {
                return if alt { vec![0x1B, code] } else { vec![code] };
            }
        }

        let mut bytes = Vec::with_capacity(5);
        if alt {
            bytes.push(0x1B);
        }
        let mut utf8 = [0u8; 4];
        bytes.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
        bytes
    }

    /// Arrows, Home and End. SS3 form in application-cursor mode.
    fn cursor_key(key: u8, mods: Modifiers, modes: TerminalModes) -> Vec<u8> {
        if !mods.is_empty() {
            format!("\x1b[1;{}{}", Self::modifier_code(mods), key as char).into_bytes()
        } else if modes.contains(TerminalModes::APP_CURSOR) {
            vec![0x1B, b'O', key]
        } else {
            vec![0x1B, b'[', key]
        }
    }

    fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            format!("\x1b[{}~", code).into_bytes()
        } else {
            format!("\x1b[{};{}~", code, Self::modifier_code(mods)).into_bytes()
        }
    }

    fn function_key(n: u8, mods: Modifiers) -> Option<Vec<u8>> {
        let code = match n {
            1..=4 => {
                let key = b"PQRS"[(n - 1) as usize] as char;
                return Some(if mods.is_empty() {
                    format!("\x1bO{}", key).into_bytes()
                } else {
                    format!("\x1b[1;{}{}", Self::modifier_code(mods), key).into_bytes()
                });
            }
            5 => 15,
            6 => 17,
            7 => 18,
            8 => 19,
            9 => 20,
            10 => 21,
            11 => 23,
            12 => 24,
            _ => return None,
        };
        Some(Self::tilde_key(code, mods))
    }

    /// xterm modifier parameter
    fn modifier_code(mods: Modifiers) -> u8 {
        1 + if mods.contains(Modifiers::SHIFT) { 1 } else { 0 }
            + if mods.contains(Modifiers::ALT) { 2 } else { 0 }
            + if mods.contains(Modifiers::CTRL) { 4 } else { 0 }
    }
}
