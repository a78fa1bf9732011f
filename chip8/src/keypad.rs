//! Hexadecimal input pad.
use std::fmt;

use crate::constants::KEY_COUNT;

/// Keys of the 16 key pad of the COSMAC VIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyCode {
    Key0 = 0,
    Key1,
    Key2,
    Key3,
    Key4,
    Key5,
    Key6,
    Key7,
    Key8,
    Key9,
    KeyA,
    KeyB,
    KeyC,
    KeyD,
    KeyE,
    KeyF = 0xF,
}

impl KeyCode {
    #[rustfmt::skip]
    pub const ALL: [KeyCode; KEY_COUNT as usize] = [
        Self::Key0, Self::Key1, Self::Key2, Self::Key3,
        Self::Key4, Self::Key5, Self::Key6, Self::Key7,
        Self::Key8, Self::Key9, Self::KeyA, Self::KeyB,
        Self::KeyC, Self::KeyD, Self::KeyE, Self::KeyF,
    ];

    #[inline(always)]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let key_id = self.as_u8();
        write!(f, "k{key_id:x}")
    }
}

impl From<KeyCode> for u8 {
    fn from(keycode: KeyCode) -> Self {
        keycode.as_u8()
    }
}

impl TryFrom<u8> for KeyCode {
    type Error = InvalidKeyCode;

    fn try_from(key_id: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(key_id as usize)
            .copied()
            .ok_or(InvalidKeyCode(key_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidKeyCode(pub u8);

impl std::error::Error for InvalidKeyCode {}

impl fmt::Display for InvalidKeyCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "keycode must be in range 0 <= keycode < 16, got {}",
            self.0
        )
    }
}

/// Pressed state of all keys, one bit per key.
///
/// Pressed is a 1 bit, released is a 0 bit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Keypad(u16);

impl Keypad {
    pub fn set(&mut self, key: KeyCode, pressed: bool) {
        if pressed {
            self.0 |= 1 << key.as_u8();
        } else {
            self.0 &= !(1 << key.as_u8());
        }
    }

    #[inline]
    pub fn is_pressed(&self, key: KeyCode) -> bool {
        self.0 & (1 << key.as_u8()) != 0
    }

    /// Looks up a key by the raw value of a register.
    ///
    /// Values outside the key range are never pressed.
    #[inline]
    pub fn is_pressed_id(&self, key_id: u8) -> bool {
        KeyCode::try_from(key_id)
            .map(|key| self.is_pressed(key))
            .unwrap_or(false)
    }

    /// Check whether any key is pressed down.
    #[inline(always)]
    pub fn any(&self) -> bool {
        self.0 != 0
    }

    /// Retrieve the lowest key that is pressed down.
    #[inline]
    pub fn first_pressed(&self) -> Option<KeyCode> {
        if self.any() {
            KeyCode::try_from(self.0.trailing_zeros() as u8).ok()
        } else {
            None
        }
    }

    /// Set all keys to up.
    #[inline(always)]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn iter_pressed(&self) -> impl Iterator<Item = KeyCode> + '_ {
        KeyCode::ALL.into_iter().filter(|key| self.is_pressed(*key))
    }
}
