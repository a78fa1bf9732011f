//! CPU and memory state.
use crate::{
    constants::*,
    error::ExecutionError,
    instr,
    keypad::{KeyCode, Keypad},
};

/// Execution state of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Running,
    /// Stalled on `Fx0A` until a key is pressed.
    ///
    /// The program counter stays on the `Fx0A` instruction.
    AwaitingKey { vx: u8 },
}

/// Core state for a chip8 interpreter.
pub struct Chip8Cpu {
    // ------------------------------------------------------------------------
    // Registers
    /// Program counter pointing to the next instruction in memory.
    pub(crate) pc: Address,
    /// General purpose registers for temporary values.
    ///
    /// Register 16 (VF) is used for either the carry flag or borrow switch depending on opcode.
    pub(crate) registers: [u8; REGISTER_COUNT],
    /// (I) Pointer register used for indirect memory access.
    pub(crate) address: Address,
    /// (DT) Delay timer that counts down to 0.
    pub(crate) delay_timer: u8,
    /// (ST) Sound timer that counts down to 0. When it has a non-zero value, a beep is played.
    pub(crate) sound_timer: u8,
    pub(crate) state: ExecState,
    pub(crate) keypad: Keypad,

    // ------------------------------------------------------------------------
    // Memory
    /// Main memory storage space.
    pub(crate) ram: Box<[u8; MEM_SIZE]>,
    /// Stack of return pointers used for jumping when a routine call finishes.
    pub(crate) stack: Vec<Address>,
    /// Screen buffer that is drawn too, indexed by `y * DISPLAY_WIDTH + x`.
    pub(crate) display: Box<[bool; DISPLAY_BUFFER_SIZE]>,
}

impl Default for Chip8Cpu {
    fn default() -> Self {
        let mut ram = Box::new([0; MEM_SIZE]);
        let font_start = FONTSET_START as usize;
        ram[font_start..font_start + FONTSET_DATA_LENGTH].copy_from_slice(&FONTSET);

        Self {
            pc: MEM_START as Address,
            registers: [0; REGISTER_COUNT],
            address: 0,
            delay_timer: 0,
            sound_timer: 0,
            state: ExecState::Running,
            keypad: Keypad::default(),

            ram,
            stack: Vec::with_capacity(STACK_SIZE),
            display: Box::new([false; DISPLAY_BUFFER_SIZE]),
        }
    }
}

impl Chip8Cpu {
    /// Fresh machine with zeroed memory, except for the built-in font.
    pub fn new() -> Self {
        Default::default()
    }

    pub fn clear_display(&mut self) {
        self.display.fill(false);
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> bool {
        if x < DISPLAY_WIDTH && y < DISPLAY_HEIGHT {
            self.display[x + y * DISPLAY_WIDTH]
        } else {
            false
        }
    }

    /// XOR a row of 8 sprite pixels onto the display.
    ///
    /// Pixels past the right edge are clipped. Returns `true` when a lit pixel
    /// was turned off.
    pub(crate) fn blit_row(&mut self, x0: usize, y: usize, row: u8) -> bool {
        debug_assert!(y < DISPLAY_HEIGHT);

        let mut is_erased = false;
        let width = SPRITE_WIDTH.min(DISPLAY_WIDTH.saturating_sub(x0));

        for c in 0..width {
            let d = (x0 + c) + y * DISPLAY_WIDTH;

            let old_px = self.display[d];
            let new_px = (row >> (7 - c)) & 1 != 0;

            // XOR erases a pixel when both the old and new values are both 1.
            is_erased |= old_px && new_px;

            self.display[d] = old_px ^ new_px;
        }

        is_erased
    }

    #[inline(always)]
    pub fn register(&self, index: usize) -> u8 {
        self.registers[index]
    }

    #[inline(always)]
    pub(crate) fn set_register(&mut self, index: u8, value: u8) {
        self.registers[index as usize & 0xF] = value;
    }

    #[inline(always)]
    pub(crate) fn set_flag(&mut self, flag: bool) {
        self.registers[FLAG_REGISTER] = flag as u8;
    }

    /// Skip the next instruction.
    #[inline(always)]
    pub(crate) fn skip_if(&mut self, condition: bool) {
        if condition {
            self.pc = self.pc.wrapping_add(2);
        }
    }

    /// Read memory at the given address, wrapping around the end of memory.
    #[inline(always)]
    pub(crate) fn peek(&self, addr: usize) -> u8 {
        self.ram[addr & MEM_MASK]
    }

    /// Write memory at the given address, wrapping around the end of memory.
    #[inline(always)]
    pub(crate) fn poke(&mut self, addr: usize, value: u8) {
        self.ram[addr & MEM_MASK] = value;
    }

    /// Read the instruction word at the program counter.
    ///
    /// Both bytes must be within memory.
    #[inline]
    pub(crate) fn fetch(&self) -> Result<u16, ExecutionError> {
        let pc = self.pc as usize;
        if pc + 1 >= MEM_SIZE {
            return Err(ExecutionError::OutOfBoundsFetch { pc: self.pc });
        }
        Ok(instr::word([self.ram[pc], self.ram[pc + 1]]))
    }

    /// Save the program counter on the call stack.
    ///
    /// `instr_pc` is the address of the calling instruction, for error reporting.
    pub(crate) fn push_return(&mut self, instr_pc: Address) -> Result<(), ExecutionError> {
        if self.stack.len() >= STACK_SIZE {
            return Err(ExecutionError::StackOverflow { pc: instr_pc });
        }
        self.stack.push(self.pc);
        Ok(())
    }

    pub(crate) fn pop_return(&mut self, instr_pc: Address) -> Result<Address, ExecutionError> {
        self.stack
            .pop()
            .ok_or(ExecutionError::StackUnderflow { pc: instr_pc })
    }

    pub fn set_key_state(&mut self, key: KeyCode, pressed: bool) {
        self.keypad.set(key, pressed);
    }

    pub fn key_state(&self, key: KeyCode) -> bool {
        self.keypad.is_pressed(key)
    }

    /// Count down both timers, stopping at zero.
    #[inline]
    pub fn tick_timers(&mut self) {
        self.delay_timer = self.delay_timer.saturating_sub(1);
        self.sound_timer = self.sound_timer.saturating_sub(1);
    }
}
