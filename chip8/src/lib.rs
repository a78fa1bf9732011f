//! Chip-8 virtual machine.
//!
//! The VM is stepped by an external driver, one instruction per call,
//! which also feeds it key state and reads back the display.
mod clock;
pub mod constants;
mod cpu;
mod disasm;
mod error;
mod instr;
mod keypad;
mod vm;

pub use self::{
    clock::{Clock, Hz},
    error::{Chip8Error, Chip8Result, ExecutionError, LoadError},
    instr::Op,
    keypad::{InvalidKeyCode, KeyCode},
};

/// Version of this crate, for display in drivers.
pub const IMPL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    pub use super::{
        disasm::Disassembler,
        error::{Chip8Error, Chip8Result, ExecutionError, LoadError},
        keypad::KeyCode,
        vm::{Chip8Conf, Chip8DisplayBuffer, Chip8Vm, Flow},
    };
}
