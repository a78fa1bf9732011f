//! Result and errors.
use std::fmt::{self, Display, Formatter};

use crate::constants::Address;

pub type Chip8Result<T> = std::result::Result<T, Chip8Error>;

/// Umbrella error for drivers that mix ROM IO with machine errors.
#[derive(Debug)]
pub enum Chip8Error {
    /// ROM could not be loaded into memory.
    Load(LoadError),
    /// VM error during interpreter loop.
    Execution(ExecutionError),
    Io(std::io::Error),
    Fmt(fmt::Error),
}

impl Display for Chip8Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(err) => write!(f, "load error: {err}"),
            Self::Execution(err) => write!(f, "runtime error: {err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Fmt(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Chip8Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
            Self::Execution(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Fmt(err) => Some(err),
        }
    }
}

impl From<LoadError> for Chip8Error {
    fn from(err: LoadError) -> Self {
        Chip8Error::Load(err)
    }
}

impl From<ExecutionError> for Chip8Error {
    fn from(err: ExecutionError) -> Self {
        Chip8Error::Execution(err)
    }
}

impl From<std::io::Error> for Chip8Error {
    fn from(err: std::io::Error) -> Self {
        Chip8Error::Io(err)
    }
}

impl From<fmt::Error> for Chip8Error {
    fn from(err: fmt::Error) -> Self {
        Chip8Error::Fmt(err)
    }
}

/// Failure to copy a program into VM memory.
///
/// The machine is left untouched when loading fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Attempt to load a bytecode program that can't fit in memory.
    ProgramTooLarge { size: usize, capacity: usize },
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProgramTooLarge { size, capacity } => write!(
                f,
                "program too large for VM memory: {size} bytes, capacity is {capacity} bytes"
            ),
        }
    }
}

impl std::error::Error for LoadError {}

/// Fatal conditions raised by a single step.
///
/// The program counter in each variant points at the offending instruction,
/// which is also where the VM's program counter is left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Program counter points past addressable memory.
    OutOfBoundsFetch { pc: Address },
    /// `RET` executed with an empty call stack.
    StackUnderflow { pc: Address },
    /// `CALL` executed with a full call stack.
    StackOverflow { pc: Address },
    /// Instruction word does not decode to a supported operation.
    UnknownOpcode { pc: Address, opcode: u16 },
}

impl ExecutionError {
    /// Address of the instruction that failed.
    pub fn pc(&self) -> Address {
        match self {
            Self::OutOfBoundsFetch { pc }
            | Self::StackUnderflow { pc }
            | Self::StackOverflow { pc }
            | Self::UnknownOpcode { pc, .. } => *pc,
        }
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBoundsFetch { pc } => {
                write!(f, "instruction fetch out of bounds at 0x{pc:04X}")
            }
            Self::StackUnderflow { pc } => write!(f, "call stack underflow at 0x{pc:04X}"),
            Self::StackOverflow { pc } => write!(f, "call stack overflow at 0x{pc:04X}"),
            Self::UnknownOpcode { pc, opcode } => {
                write!(f, "unsupported opcode {opcode:04X} at 0x{pc:04X}")
            }
        }
    }
}

impl std::error::Error for ExecutionError {}
