//! Disassembler.
use std::fmt::{self, Write as FmtWrite};

use crate::{
    constants::{Address, MEM_START},
    instr::{self, Op},
};

/// Walks a ROM two bytes at a time, printing each word as it
/// would be decoded by the VM.
///
/// Code and data are not told apart. Words that don't decode,
/// like sprite data, are printed as raw bytes.
pub struct Disassembler<'a> {
    bytecode: &'a [u8],
    cursor: usize,
}

impl<'a> Disassembler<'a> {
    pub fn new(bytecode: &'a [u8]) -> Self {
        Self {
            bytecode,
            cursor: 0,
        }
    }

    /// Address in VM memory of the word under the cursor.
    #[inline]
    fn address(&self) -> Address {
        (MEM_START + self.cursor) as Address
    }

    /// Write the whole program to the given writer, one line per word.
    pub fn disassemble_all<W: FmtWrite>(&mut self, w: &mut W) -> fmt::Result {
        self.cursor = 0;
        while self.cursor < self.bytecode.len() {
            self.disassemble(w)?;
            self.cursor += 2;
        }
        self.cursor = 0;

        Ok(())
    }

    /// Write a single instruction to the given writer.
    pub fn disassemble<W: FmtWrite>(&self, w: &mut W) -> fmt::Result {
        let addr = self.address();

        match self.bytecode.get(self.cursor..self.cursor + 2) {
            Some(&[a, b]) => {
                let word = instr::word([a, b]);
                match Op::decode(word) {
                    Some(op) => writeln!(w, "{addr:04X}: {word:04X}  {op}"),
                    None => writeln!(w, "{addr:04X}: {word:04X}  0b{a:08b} 0b{b:08b}"),
                }
            }
            // Odd trailing byte, or nothing left.
            _ => match self.bytecode.get(self.cursor) {
                Some(a) => writeln!(w, "{addr:04X}: {a:02X}    0b{a:08b}"),
                None => Ok(()),
            },
        }
    }

    pub fn print_bytecode(&mut self) -> fmt::Result {
        let mut s = String::new();
        self.disassemble_all(&mut s)?;
        println!("{s}");
        Ok(())
    }
}
