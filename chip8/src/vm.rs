//! Virtual machine.
use std::fmt::{self, Write};

use log::{debug, warn};
use rand::prelude::*;

use crate::{
    clock::Hz,
    constants::*,
    cpu::{Chip8Cpu, ExecState},
    error::{ExecutionError, LoadError},
    instr::Op,
    keypad::KeyCode,
};

pub type Chip8DisplayBuffer<'a> = &'a [bool; DISPLAY_BUFFER_SIZE];

pub struct Chip8Vm {
    cpu: Chip8Cpu,
    rng: StdRng,
}

impl Chip8Vm {
    pub fn new(conf: Chip8Conf) -> Self {
        let rng = match conf.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Chip8Vm {
            cpu: Chip8Cpu::new(),
            rng,
        }
    }

    /// Replace the machine state with a fresh machine and copy the program
    /// into memory at `MEM_START`.
    ///
    /// The VM is left untouched when the program does not fit.
    pub fn load_bytecode(&mut self, bytecode: &[u8]) -> Result<(), LoadError> {
        if bytecode.len() > PROGRAM_CAPACITY {
            return Err(LoadError::ProgramTooLarge {
                size: bytecode.len(),
                capacity: PROGRAM_CAPACITY,
            });
        }

        // Start with clean memory to avoid leaking previous program.
        self.reset();

        // Load program into virtual RAM
        self.cpu.ram[MEM_START..MEM_START + bytecode.len()].copy_from_slice(bytecode);

        debug!("loaded program of {} bytes", bytecode.len());

        Ok(())
    }

    /// Discard the machine state, including the loaded program.
    pub fn reset(&mut self) {
        self.cpu = Chip8Cpu::new();
    }

    pub fn display_buffer(&self) -> Chip8DisplayBuffer {
        &self.cpu.display
    }

    /// Whether the pixel at the given coordinate is lit.
    ///
    /// Coordinates outside the display are never lit.
    pub fn get_pixel(&self, x: usize, y: usize) -> bool {
        self.cpu.pixel(x, y)
    }

    /// Whether the buzzer should be sounding.
    ///
    /// The buzzer is on while the sound timer counts down.
    pub fn is_sound_active(&self) -> bool {
        self.cpu.sound_timer > 0
    }
}

/// Register and memory inspection.
impl Chip8Vm {
    pub fn pc(&self) -> Address {
        self.cpu.pc
    }

    /// Value of the `I` register.
    pub fn index(&self) -> Address {
        self.cpu.address
    }

    /// Value of register `Vx`.
    ///
    /// # Panics
    ///
    /// Panics if `x` is not a register index (`0..16`).
    pub fn register(&self, x: usize) -> u8 {
        self.cpu.register(x)
    }

    pub fn registers(&self) -> &[u8; REGISTER_COUNT] {
        &self.cpu.registers
    }

    pub fn delay_timer(&self) -> u8 {
        self.cpu.delay_timer
    }

    pub fn sound_timer(&self) -> u8 {
        self.cpu.sound_timer
    }

    /// Number of return addresses on the call stack.
    pub fn stack_depth(&self) -> usize {
        self.cpu.stack.len()
    }

    pub fn is_awaiting_key(&self) -> bool {
        matches!(self.cpu.state, ExecState::AwaitingKey { .. })
    }

    pub fn memory(&self) -> &[u8] {
        &self.cpu.ram[..]
    }
}

/// What happened during a single step, so the caller can react
/// without inspecting the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Ok,
    /// Program counter has jumped to a new address.
    ///
    /// This is useful for the caller to avoid being
    /// blocked on infinite or long running loops.
    ///
    /// This is returned when the interpreter encounters:
    ///
    /// - 1nnn (`JP addr`)
    /// - 2nnn (`CALL addr`)
    /// - 00EE (`RET`)
    /// - Bnnn (`JP V0, addr`)
    Jump,
    /// The display buffer changed.
    Draw,
    /// The sound timer was loaded.
    Sound,
    /// Wait for a keypress.
    ///
    /// This is triggered by the opcode `Fx0A` (`LD Vx, K`), which stops
    /// execution until a key is pressed, and loads the key value into `Vx`.
    KeyWait,
}

/// VM Configuration Parameters.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct Chip8Conf {
    /// Rate at which a driver should step the VM. `None` runs unthrottled.
    pub clock_frequency: Option<Hz>,
    /// Seed for the `RND` instruction. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

/// Interpreter
impl Chip8Vm {
    /// Sets the keyboard key input state.
    pub fn set_key(&mut self, key: KeyCode, pressed: bool) {
        self.cpu.set_key_state(key, pressed);
    }

    pub fn key_state(&self, key: KeyCode) -> bool {
        self.cpu.key_state(key)
    }

    /// Clear the keyboard input state, setting all keys to up.
    pub fn clear_keys(&mut self) {
        self.cpu.keypad.clear()
    }

    /// Execute one instruction, then count down the timers.
    pub fn step(&mut self) -> Result<(), ExecutionError> {
        self.tick().map(|_| ())
    }

    /// Execute up to `step_count` instructions, stopping at the first error.
    ///
    /// Returns the flow of the last executed step.
    pub fn run_steps(&mut self, step_count: usize) -> Result<Flow, ExecutionError> {
        let mut flow = Flow::Ok;

        for _ in 0..step_count {
            flow = self.tick()?;
        }

        Ok(flow)
    }

    /// Execute one instruction, then count down the timers.
    ///
    /// A failed step leaves the program counter on the offending
    /// instruction and does not count down the timers.
    pub fn tick(&mut self) -> Result<Flow, ExecutionError> {
        let flow = match self.cpu.state {
            ExecState::AwaitingKey { vx } => self.resume_key_wait(vx),
            ExecState::Running => self.exec_next().map_err(|err| {
                warn!("{err}");
                err
            })?,
        };

        self.cpu.tick_timers();

        Ok(flow)
    }

    /// While stalled on `Fx0A`, only the key state is evaluated.
    fn resume_key_wait(&mut self, vx: u8) -> Flow {
        match self.cpu.keypad.first_pressed() {
            Some(key) => {
                self.cpu.set_register(vx, key.as_u8());
                self.cpu.pc = self.cpu.pc.wrapping_add(2);
                self.cpu.state = ExecState::Running;
                Flow::Ok
            }
            None => Flow::KeyWait,
        }
    }

    fn exec_next(&mut self) -> Result<Flow, ExecutionError> {
        let pc = self.cpu.pc;

        // Each instruction is two bytes, with the opcode identity in the first 4-bit nibble.
        let word = self.cpu.fetch()?;
        let op = Op::decode(word).ok_or(ExecutionError::UnknownOpcode { pc, opcode: word })?;

        op_trace(pc, &op);

        self.cpu.pc = pc.wrapping_add(2);

        self.exec(pc, op).map_err(|err| {
            // Leave the machine on the offending instruction.
            self.cpu.pc = pc;
            err
        })
    }

    /// Apply the effects of a single instruction.
    ///
    /// The program counter already points to the next instruction.
    fn exec(&mut self, pc: Address, op: Op) -> Result<Flow, ExecutionError> {
        let cpu = &mut self.cpu;
        let mut control_flow = Flow::Ok;

        match op {
            Op::ClearScreen => {
                cpu.clear_display();
                control_flow = Flow::Draw;
            }
            Op::Return => {
                cpu.pc = cpu.pop_return(pc)?;
                control_flow = Flow::Jump;
            }
            Op::JumpAddress { address } => {
                cpu.pc = address;
                control_flow = Flow::Jump;
            }
            Op::Call { address } => {
                cpu.push_return(pc)?;
                cpu.pc = address;
                control_flow = Flow::Jump;
            }
            Op::Skip_Eq_Byte { vx, nn } => {
                cpu.skip_if(cpu.registers[vx as usize] == nn);
            }
            Op::Skip_NotEq_Byte { vx, nn } => {
                cpu.skip_if(cpu.registers[vx as usize] != nn);
            }
            Op::Skip_Eq { vx, vy } => {
                cpu.skip_if(cpu.registers[vx as usize] == cpu.registers[vy as usize]);
            }
            Op::Skip_NotEq { vx, vy } => {
                cpu.skip_if(cpu.registers[vx as usize] != cpu.registers[vy as usize]);
            }
            Op::Load_Byte { vx, nn } => {
                cpu.set_register(vx, nn);
            }
            Op::Add_Byte { vx, nn } => {
                let x = cpu.registers[vx as usize];
                cpu.set_register(vx, x.wrapping_add(nn));
            }
            // Arithmetic instructions.
            //
            // The flag is written last, so when `Vx` is VF the flag wins.
            Op::Load_Vx_Vy { vx, vy } => {
                cpu.set_register(vx, cpu.registers[vy as usize]);
            }
            Op::Or_Vx_Vy { vx, vy } => {
                cpu.set_register(vx, cpu.registers[vx as usize] | cpu.registers[vy as usize]);
            }
            Op::And_Vx_Vy { vx, vy } => {
                cpu.set_register(vx, cpu.registers[vx as usize] & cpu.registers[vy as usize]);
            }
            Op::Xor_Vx_Vy { vx, vy } => {
                cpu.set_register(vx, cpu.registers[vx as usize] ^ cpu.registers[vy as usize]);
            }
            Op::Add_Vx_Vy { vx, vy } => {
                let (x, y) = (cpu.registers[vx as usize], cpu.registers[vy as usize]);
                let (result, carry) = x.overflowing_add(y);
                cpu.set_register(vx, result);
                cpu.set_flag(carry);
            }
            Op::Sub_Vx_Vy { vx, vy } => {
                let (x, y) = (cpu.registers[vx as usize], cpu.registers[vy as usize]);
                cpu.set_register(vx, x.wrapping_sub(y));
                cpu.set_flag(x >= y);
            }
            Op::ShiftRight { vx, vy } => {
                let y = cpu.registers[vy as usize];
                cpu.set_register(vx, y >> 1);
                cpu.set_flag(y & 1 == 1);
            }
            Op::SubReverse_Vx_Vy { vx, vy } => {
                let (x, y) = (cpu.registers[vx as usize], cpu.registers[vy as usize]);
                cpu.set_register(vx, y.wrapping_sub(x));
                cpu.set_flag(y >= x);
            }
            Op::ShiftLeft { vx, vy } => {
                let y = cpu.registers[vy as usize];
                cpu.set_register(vx, y << 1);
                cpu.set_flag(y >> 7 == 1);
            }
            Op::Load_Address { address } => {
                cpu.address = address;
            }
            Op::Jump_V0 { address } => {
                cpu.pc = address.wrapping_add(cpu.registers[0] as Address);
                control_flow = Flow::Jump;
            }
            Op::Random { vx, nn } => {
                cpu.set_register(vx, nn & self.rng.gen::<u8>());
            }
            // Sprite is encoded as 8 pixels wide, N pixels high, stored in bits located in
            // memory pointed to by address register I.
            //
            // Sprites are clipped at the right and bottom edges of the display.
            //
            // If the drawing operation erases existing pixels in the display buffer, register VF is set to
            // 1, and set to 0 if no display bits are unset. This is used for collision detection.
            Op::Draw { vx, vy, n } => {
                let x0 = cpu.registers[vx as usize] as usize % DISPLAY_WIDTH;
                let y0 = cpu.registers[vy as usize] as usize % DISPLAY_HEIGHT;
                let mut is_erased = false;

                for r in 0..n as usize {
                    let y = y0 + r;
                    if y >= DISPLAY_HEIGHT {
                        break;
                    }
                    let row = cpu.peek(cpu.address as usize + r);
                    is_erased |= cpu.blit_row(x0, y, row);
                }

                cpu.set_flag(is_erased);
                control_flow = Flow::Draw;
            }
            Op::Skip_Key { vx } => {
                cpu.skip_if(cpu.keypad.is_pressed_id(cpu.registers[vx as usize]));
            }
            Op::Skip_NotKey { vx } => {
                cpu.skip_if(!cpu.keypad.is_pressed_id(cpu.registers[vx as usize]));
            }
            Op::Wait_Key { vx } => match cpu.keypad.first_pressed() {
                Some(key) => cpu.set_register(vx, key.as_u8()),
                None => {
                    // rewind the program counter to stall the machine
                    cpu.pc = pc;
                    cpu.state = ExecState::AwaitingKey { vx };
                    control_flow = Flow::KeyWait;
                }
            },
            Op::Load_Vx_Delay { vx } => {
                cpu.set_register(vx, cpu.delay_timer);
            }
            Op::Load_Delay_Vx { vx } => {
                cpu.delay_timer = cpu.registers[vx as usize];
            }
            Op::Load_Sound_Vx { vx } => {
                cpu.sound_timer = cpu.registers[vx as usize];
                control_flow = Flow::Sound;
            }
            Op::Add_Address_Vx { vx } => {
                cpu.address = cpu.address.wrapping_add(cpu.registers[vx as usize] as Address);
            }
            Op::Load_Font { vx } => {
                let x = cpu.registers[vx as usize] as Address;
                cpu.address = FONTSET_START + x * FONTSET_HEIGHT as Address;
            }
            #[rustfmt::skip]
            Op::Store_Bcd { vx } => {
                let addr = cpu.address as usize;
                let x = cpu.registers[vx as usize];
                cpu.poke(addr,     x / 100 % 10);
                cpu.poke(addr + 1, x / 10  % 10);
                cpu.poke(addr + 2, x       % 10);
            }
            Op::Store_Registers { vx } => {
                let addr = cpu.address as usize;
                for v in 0..=vx as usize {
                    cpu.poke(addr + v, cpu.registers[v]);
                }
            }
            Op::Load_Registers { vx } => {
                let addr = cpu.address as usize;
                for v in 0..=vx as usize {
                    cpu.registers[v] = cpu.peek(addr + v);
                }
            }
        }

        Ok(control_flow)
    }
}

/// Troubleshooting
impl Chip8Vm {
    /// Returns the contents of the memory as a human readable string.
    pub fn dump_ram(&self, count: usize) -> Result<String, fmt::Error> {
        let iter = self
            .cpu
            .ram
            .iter()
            .enumerate()
            .skip(MEM_START)
            .take(count)
            .step_by(2);
        let mut buf = String::new();

        for (i, op) in iter {
            writeln!(buf, "{:04X}: {:02X}{:02X}", i, op, self.cpu.peek(i + 1))?;
        }

        Ok(buf)
    }

    pub fn dump_display(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();

        for y in 0..DISPLAY_HEIGHT {
            for x in 0..DISPLAY_WIDTH {
                if self.cpu.pixel(x, y) {
                    write!(buf, "#")?;
                } else {
                    write!(buf, ".")?;
                }
            }
            writeln!(buf)?;
        }

        Ok(buf)
    }

    pub fn dump_keys(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();

        if self.cpu.keypad.any() {
            write!(buf, "keys:")?;
            for key in self.cpu.keypad.iter_pressed() {
                write!(buf, " {key}")?;
            }
        }

        Ok(buf)
    }
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace(pc: Address, op: &Op) {
    log::trace!("{pc:04X}: {op}");
}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace(_: Address, _: &Op) {}

#[cfg(test)]
mod test {
    use super::*;

    const START: Address = MEM_START as Address;

    fn vm_with(program: &[u16]) -> Chip8Vm {
        let bytecode: Vec<u8> = program.iter().flat_map(|w| w.to_be_bytes()).collect();
        let mut vm = Chip8Vm::new(Chip8Conf {
            rng_seed: Some(7),
            ..Default::default()
        });
        vm.load_bytecode(&bytecode).unwrap();
        vm
    }

    /// Rerun the instruction at the start of memory with the given operands.
    fn rerun(vm: &mut Chip8Vm, vx: usize, x: u8, vy: usize, y: u8) {
        vm.cpu.pc = START;
        vm.cpu.registers[vy] = y;
        vm.cpu.registers[vx] = x;
        vm.step().unwrap();
    }

    #[test]
    fn test_add_carry_exhaustive() {
        let mut vm = vm_with(&[0x8124]); // ADD v1, v2

        for x in 0..=255_u8 {
            for y in 0..=255_u8 {
                rerun(&mut vm, 1, x, 2, y);
                let sum = x as u16 + y as u16;
                assert_eq!(vm.cpu.registers[1], (sum % 256) as u8);
                assert_eq!(vm.cpu.registers[0xF], (sum > 255) as u8, "{x} + {y}");
            }
        }
    }

    #[test]
    fn test_add_carry_register_pairs() {
        for vx in 0..0xF_u16 {
            for vy in 0..0xF_u16 {
                let mut vm = vm_with(&[0x8004 | (vx << 8) | (vy << 4)]);
                for (x, y) in [(0, 0), (1, 254), (1, 255), (128, 128), (200, 100)] {
                    rerun(&mut vm, vx as usize, x, vy as usize, y);
                    // Both operands read the same register.
                    let y = if vx == vy { x } else { y };
                    let sum = x as u16 + y as u16;
                    assert_eq!(vm.cpu.registers[vx as usize], (sum % 256) as u8);
                    assert_eq!(vm.cpu.registers[0xF], (sum > 255) as u8);
                }
            }
        }
    }

    #[test]
    fn test_sub_borrow_exhaustive() {
        let mut vm = vm_with(&[0x8125]); // SUB v1, v2

        for x in 0..=255_u8 {
            for y in 0..=255_u8 {
                rerun(&mut vm, 1, x, 2, y);
                assert_eq!(vm.cpu.registers[1], x.wrapping_sub(y));
                assert_eq!(vm.cpu.registers[0xF], (x >= y) as u8, "{x} - {y}");
            }
        }
    }

    #[test]
    fn test_sub_reverse() {
        let mut vm = vm_with(&[0x8127]); // SUBN v1, v2

        for (x, y) in [(1, 3), (3, 1), (5, 5), (0, 255), (255, 0)] {
            rerun(&mut vm, 1, x, 2, y);
            assert_eq!(vm.cpu.registers[1], y.wrapping_sub(x));
            assert_eq!(vm.cpu.registers[0xF], (y >= x) as u8);
        }
    }

    #[test]
    fn test_flag_register_as_destination() {
        // ADD vF, v1 overflows; the flag overwrites the sum.
        let mut vm = vm_with(&[0x8F14]);
        rerun(&mut vm, 0xF, 200, 1, 100);
        assert_eq!(vm.cpu.registers[0xF], 1);

        rerun(&mut vm, 0xF, 1, 1, 2);
        assert_eq!(vm.cpu.registers[0xF], 0);
    }

    #[test]
    fn test_bitwise() {
        let mut vm = vm_with(&[0x8120, 0x8121, 0x8122, 0x8123]);

        for (i, expected) in [0b0101_0000, 0b1111_0000, 0b0000_0000, 0b1111_0000]
            .into_iter()
            .enumerate()
        {
            vm.cpu.pc = START + i as Address * 2;
            vm.cpu.registers[1] = 0b1010_0000;
            vm.cpu.registers[2] = 0b0101_0000;
            vm.step().unwrap();
            assert_eq!(vm.cpu.registers[1], expected, "instruction {i}");
        }
    }

    #[test]
    fn test_shifts_read_vy() {
        let mut vm = vm_with(&[0x8126, 0x812E]); // SHR v1, v2; SHL v1, v2

        vm.cpu.registers[1] = 0xFF;
        vm.cpu.registers[2] = 0b0000_0011;
        vm.step().unwrap();
        assert_eq!(vm.cpu.registers[1], 0b0000_0001);
        assert_eq!(vm.cpu.registers[2], 0b0000_0011);
        assert_eq!(vm.cpu.registers[0xF], 1);

        vm.cpu.registers[2] = 0b0100_0001;
        vm.step().unwrap();
        assert_eq!(vm.cpu.registers[1], 0b1000_0010);
        assert_eq!(vm.cpu.registers[0xF], 0);

        vm.cpu.pc = START + 2;
        vm.cpu.registers[2] = 0b1000_0001;
        vm.step().unwrap();
        assert_eq!(vm.cpu.registers[1], 0b0000_0010);
        assert_eq!(vm.cpu.registers[0xF], 1);
    }

    #[test]
    fn test_add_byte_wraps_without_flag() {
        let mut vm = vm_with(&[0x61FF, 0x7102]);
        vm.cpu.registers[0xF] = 0x42;
        vm.run_steps(2).unwrap();

        assert_eq!(vm.cpu.registers[1], 1);
        assert_eq!(vm.cpu.registers[0xF], 0x42);
    }

    #[test]
    fn test_skips() {
        #[rustfmt::skip]
        let cases = [
            // (instruction, v1, v2, skipped)
            (0x3142, 0x42, 0, true),
            (0x3142, 0x41, 0, false),
            (0x4142, 0x42, 0, false),
            (0x4142, 0x41, 0, true),
            (0x5120, 0x07, 0x07, true),
            (0x5120, 0x07, 0x08, false),
            (0x9120, 0x07, 0x07, false),
            (0x9120, 0x07, 0x08, true),
        ];

        for (instr, v1, v2, skipped) in cases {
            let mut vm = vm_with(&[instr]);
            vm.cpu.registers[1] = v1;
            vm.cpu.registers[2] = v2;
            vm.step().unwrap();

            let expected = if skipped { START + 4 } else { START + 2 };
            assert_eq!(vm.cpu.pc, expected, "{instr:04X}");
        }
    }

    #[test]
    fn test_call_and_return() {
        #[rustfmt::skip]
        let mut vm = vm_with(&[
            0x2206, // 200: CALL 0x206
            0x6142, // 202: LD v1, 0x42
            0x1204, // 204: JP 0x204
            0x6107, // 206: LD v1, 0x07
            0x00EE, // 208: RET
        ]);

        assert_eq!(vm.tick(), Ok(Flow::Jump));
        assert_eq!(vm.cpu.pc, 0x206);
        assert_eq!(vm.stack_depth(), 1);

        vm.run_steps(2).unwrap();
        assert_eq!(vm.cpu.pc, 0x202);
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(vm.cpu.registers[1], 0x07);

        vm.run_steps(2).unwrap();
        assert_eq!(vm.cpu.registers[1], 0x42);
        assert_eq!(vm.cpu.pc, 0x204);
    }

    #[test]
    fn test_return_underflow_is_fatal() {
        let mut vm = vm_with(&[0x00EE]);
        vm.cpu.delay_timer = 3;

        assert_eq!(
            vm.step(),
            Err(ExecutionError::StackUnderflow { pc: START })
        );
        assert_eq!(vm.cpu.pc, START);
        // Failed steps don't count down the timers.
        assert_eq!(vm.cpu.delay_timer, 3);
    }

    #[test]
    fn test_call_overflow() {
        let mut vm = vm_with(&[0x2200]); // CALL 0x200

        vm.run_steps(STACK_SIZE).unwrap();
        assert_eq!(vm.stack_depth(), STACK_SIZE);
        assert_eq!(
            vm.step(),
            Err(ExecutionError::StackOverflow { pc: START })
        );
    }

    #[test]
    fn test_unknown_opcode() {
        let mut vm = vm_with(&[0x6001, 0xF0FF]);
        vm.step().unwrap();

        assert_eq!(
            vm.step(),
            Err(ExecutionError::UnknownOpcode {
                pc: START + 2,
                opcode: 0xF0FF
            })
        );
        assert_eq!(vm.cpu.pc, START + 2);
    }

    #[test]
    fn test_fetch_out_of_bounds() {
        let mut vm = vm_with(&[0x1FFF]); // JP 0xFFF
        vm.step().unwrap();

        assert_eq!(
            vm.step(),
            Err(ExecutionError::OutOfBoundsFetch { pc: 0xFFF })
        );
    }

    #[test]
    fn test_jump_v0() {
        let mut vm = vm_with(&[0x6004, 0xB300]);
        vm.run_steps(2).unwrap();
        assert_eq!(vm.cpu.pc, 0x304);
    }

    #[test]
    fn test_random_is_masked() {
        let mut vm = vm_with(&[0xC10F, 0xC200]);
        vm.run_steps(2).unwrap();
        assert_eq!(vm.cpu.registers[1] & 0xF0, 0);
        assert_eq!(vm.cpu.registers[2], 0);
    }

    #[test]
    fn test_random_seed_is_reproducible() {
        let program: Vec<u16> = (0..8).map(|_| 0xC1FF).collect();
        let mut a = vm_with(&program);
        let mut b = vm_with(&program);

        for _ in 0..program.len() {
            a.step().unwrap();
            b.step().unwrap();
            assert_eq!(a.cpu.registers[1], b.cpu.registers[1]);
        }
    }

    #[test]
    fn test_clear_display() {
        let mut vm = vm_with(&[0x00E0]);
        vm.cpu.display.fill(true);

        assert_eq!(vm.tick(), Ok(Flow::Draw));
        for y in 0..DISPLAY_HEIGHT {
            for x in 0..DISPLAY_WIDTH {
                assert!(!vm.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn test_draw_twice_restores_display() {
        #[rustfmt::skip]
        let mut vm = vm_with(&[
            0xF029, // LD F, v0
            0xD125, // DRW v1, v2, 5
            0xD125, // DRW v1, v2, 5
        ]);
        vm.cpu.registers[0] = 0x8;
        vm.cpu.registers[1] = 10;
        vm.cpu.registers[2] = 3;
        // Unrelated pixel that must survive.
        vm.cpu.display[0] = true;
        let before = vm.cpu.display.clone();

        vm.run_steps(2).unwrap();
        assert_eq!(vm.cpu.registers[0xF], 0);
        assert_ne!(vm.cpu.display, before);
        // Top row of the glyph 8 is 0xF0
        assert!(vm.get_pixel(10, 3));
        assert!(vm.get_pixel(13, 3));
        assert!(!vm.get_pixel(14, 3));

        vm.step().unwrap();
        assert_eq!(vm.cpu.registers[0xF], 1);
        assert_eq!(vm.cpu.display, before);
    }

    #[test]
    fn test_draw_collision() {
        // Draw two sprites overlapping by 4 pixels. The zero bits of the
        // second draw must not erase the pixels of the first draw.
        //
        // ____####, vf == 0
        // ########, vf == 0
        #[rustfmt::skip]
        let mut vm = vm_with(&[
            0xA20C, // LD I, .sprite
            0x6004, // LD v0, 4
            0x6100, // LD v1, 0
            0xD011, // DRW v0, v1, 1
            0x6000, // LD v0, 0
            0xD011, // DRW v0, v1, 1
            0xF000, // .sprite
        ]);

        vm.run_steps(6).unwrap();

        for x in 0..8 {
            assert!(vm.get_pixel(x, 0), "pixel {x}");
        }
        assert!(!vm.get_pixel(8, 0));
        assert_eq!(vm.cpu.registers[0xF], 0);
    }

    #[test]
    fn test_draw_clips_at_edges() {
        let mut vm = vm_with(&[0xD015]);
        vm.cpu.address = FONTSET_START; // glyph 0
        vm.cpu.registers[0] = 62;
        vm.cpu.registers[1] = 30;
        vm.cpu.registers[0xF] = 1;

        assert_eq!(vm.tick(), Ok(Flow::Draw));
        assert_eq!(vm.cpu.registers[0xF], 0);

        // 0xF0, 0x90: the first two columns of the first two rows.
        assert!(vm.get_pixel(62, 30));
        assert!(vm.get_pixel(63, 30));
        assert!(vm.get_pixel(62, 31));
        assert!(!vm.get_pixel(63, 31));

        // Nothing wraps around to the opposite edges.
        let lit = vm.cpu.display.iter().filter(|px| **px).count();
        assert_eq!(lit, 3);
    }

    #[test]
    fn test_draw_origin_wraps() {
        let mut vm = vm_with(&[0xD011]);
        vm.cpu.address = 0x300;
        vm.cpu.ram[0x300] = 0x80;
        vm.cpu.registers[0] = 64 + 5;
        vm.cpu.registers[1] = 32 + 2;

        vm.step().unwrap();
        assert!(vm.get_pixel(5, 2));
    }

    #[test]
    fn test_draw_coordinates_from_flag_register() {
        // VF is read as a coordinate before it is reset.
        let mut vm = vm_with(&[0xDF01]);
        vm.cpu.address = 0x300;
        vm.cpu.ram[0x300] = 0x80;
        vm.cpu.registers[0xF] = 9;

        vm.step().unwrap();
        assert!(vm.get_pixel(9, 0));
        assert_eq!(vm.cpu.registers[0xF], 0);
    }

    #[test]
    fn test_bcd() {
        let mut vm = vm_with(&[0xA300, 0x60FF, 0xF033]);
        vm.run_steps(3).unwrap();
        assert_eq!(&vm.cpu.ram[0x300..0x303], &[2, 5, 5]);

        let mut vm = vm_with(&[0xA300, 0x6007, 0xF033]);
        vm.run_steps(3).unwrap();
        assert_eq!(&vm.cpu.ram[0x300..0x303], &[0, 0, 7]);
    }

    #[test]
    fn test_register_dump_round_trip() {
        let mut vm = vm_with(&[0xF055, 0xF065]);

        for x in 0..REGISTER_COUNT as u16 {
            for addr in [0x300, 0x800, (MEM_SIZE - 1) as u16 - x] {
                let store = 0xF055 | (x << 8);
                let load = 0xF065 | (x << 8);
                vm.cpu.ram[MEM_START..MEM_START + 4]
                    .copy_from_slice(&[store.to_be_bytes(), load.to_be_bytes()].concat());

                let original: [u8; REGISTER_COUNT] =
                    std::array::from_fn(|i| (i as u8).wrapping_mul(37).wrapping_add(x as u8));
                vm.cpu.registers = original;
                vm.cpu.address = addr;
                vm.cpu.pc = START;

                vm.step().unwrap();
                vm.cpu.registers = [0; REGISTER_COUNT];
                vm.step().unwrap();

                assert_eq!(
                    &vm.cpu.registers[..=x as usize],
                    &original[..=x as usize],
                    "x={x} I={addr:03X}"
                );
                assert!(vm.cpu.registers[x as usize + 1..].iter().all(|v| *v == 0));
                assert_eq!(vm.cpu.address, addr);
            }
        }
    }

    #[test]
    fn test_load_font() {
        let mut vm = vm_with(&[0xF029]);
        vm.cpu.registers[0] = 0xA;
        vm.step().unwrap();
        assert_eq!(vm.cpu.address, FONTSET_START + 50);
        assert_eq!(vm.cpu.ram[vm.cpu.address as usize], 0xF0);
    }

    #[test]
    fn test_add_address_wraps_16_bit() {
        let mut vm = vm_with(&[0xF01E]);
        vm.cpu.address = 0xFFFE;
        vm.cpu.registers[0] = 3;
        vm.cpu.registers[0xF] = 0x42;
        vm.step().unwrap();
        assert_eq!(vm.cpu.address, 0x0001);
        assert_eq!(vm.cpu.registers[0xF], 0x42);
    }

    /// Fx0A (LD Vx, K)
    ///
    /// Wait for a keypress, then store the key value in Vx.
    /// The VM must stall while waiting, and signal the state to the outer executer.
    #[test]
    #[rustfmt::skip]
    fn test_key_wait() {
        let mut vm = vm_with(&[
            0xF10A, // LD v1, K
            0x6242, // LD v2, 0x42  ; sentinal
        ]);

        // machine must stall
        for _ in 0..6 {
            assert_eq!(vm.tick(), Ok(Flow::KeyWait));
            assert_eq!(vm.cpu.pc, START);
            assert!(vm.is_awaiting_key());
        }

        // machine has yielded, waiting for any key to be pressed.
        vm.set_key(KeyCode::Key5, true);

        // machine will now advance
        assert_eq!(vm.tick(), Ok(Flow::Ok));
        assert_eq!(vm.cpu.pc, START + 2);
        assert!(!vm.is_awaiting_key());
        assert_eq!(vm.cpu.registers[1], 0x05);
        // The sentinal has not executed yet.
        assert_eq!(vm.cpu.registers[2], 0);

        // Ensure the machine is continuing
        vm.step().unwrap();
        assert_eq!(vm.cpu.pc, START + 4);
        assert_eq!(vm.cpu.registers[2], 0x42);
    }

    #[test]
    fn test_key_wait_with_key_held() {
        let mut vm = vm_with(&[0xF30A]);
        vm.set_key(KeyCode::KeyC, true);

        assert_eq!(vm.tick(), Ok(Flow::Ok));
        assert_eq!(vm.cpu.pc, START + 2);
        assert_eq!(vm.cpu.registers[3], 0xC);
    }

    #[test]
    fn test_timers_tick_while_waiting() {
        let mut vm = vm_with(&[0xF10A]);
        vm.cpu.delay_timer = 2;
        vm.cpu.sound_timer = 1;
        assert!(vm.is_sound_active());

        vm.run_steps(2).unwrap();
        assert_eq!(vm.delay_timer(), 0);
        assert_eq!(vm.sound_timer(), 0);
        assert!(!vm.is_sound_active());
    }

    #[test]
    fn test_skip_key() {
        #[rustfmt::skip]
        let cases = [
            // (instruction, v1, pressed, skipped)
            (0xE19E, 0x5, true, true),
            (0xE19E, 0x5, false, false),
            (0xE1A1, 0x5, true, false),
            (0xE1A1, 0x5, false, true),
            // Out of range key values are never pressed.
            (0xE19E, 0x15, true, false),
            (0xE1A1, 0x15, true, true),
        ];

        for (instr, v1, pressed, skipped) in cases {
            let mut vm = vm_with(&[instr]);
            vm.cpu.registers[1] = v1;
            vm.set_key(KeyCode::Key5, pressed);
            vm.step().unwrap();

            let expected = if skipped { START + 4 } else { START + 2 };
            assert_eq!(vm.cpu.pc, expected, "{instr:04X} v1={v1:X}");
        }
    }

    #[test]
    fn test_timers() {
        let mut vm = vm_with(&[0x1200]); // JP 0x200
        vm.cpu.delay_timer = 5;
        vm.cpu.sound_timer = 5;

        vm.run_steps(5).unwrap();
        assert_eq!(vm.delay_timer(), 0);
        assert_eq!(vm.sound_timer(), 0);

        vm.step().unwrap();
        assert_eq!(vm.delay_timer(), 0);
        assert_eq!(vm.sound_timer(), 0);
    }

    #[test]
    fn test_timer_registers() {
        #[rustfmt::skip]
        let mut vm = vm_with(&[
            0x6105, // LD v1, 5
            0xF115, // LD DT, v1
            0xF118, // LD ST, v1
            0xF207, // LD v2, DT
        ]);

        vm.run_steps(2).unwrap();
        // Loaded, then counted down at the end of the step.
        assert_eq!(vm.delay_timer(), 4);

        assert_eq!(vm.tick(), Ok(Flow::Sound));
        assert_eq!(vm.sound_timer(), 4);
        assert!(vm.is_sound_active());

        vm.step().unwrap();
        assert_eq!(vm.cpu.registers[2], 3);
    }

    #[test]
    fn test_load_too_large() {
        let mut vm = vm_with(&[0x6142]);
        vm.step().unwrap();

        let rom = vec![0; PROGRAM_CAPACITY + 1];
        assert_eq!(
            vm.load_bytecode(&rom),
            Err(LoadError::ProgramTooLarge {
                size: PROGRAM_CAPACITY + 1,
                capacity: PROGRAM_CAPACITY,
            })
        );

        // Machine is unmodified.
        assert_eq!(vm.cpu.pc, START + 2);
        assert_eq!(vm.cpu.registers[1], 0x42);
        assert_eq!(vm.cpu.ram[MEM_START], 0x61);
    }

    #[test]
    fn test_load_fills_memory() {
        let mut vm = Chip8Vm::new(Chip8Conf::default());
        let rom = vec![0xAB; PROGRAM_CAPACITY];
        vm.load_bytecode(&rom).unwrap();
        assert_eq!(vm.cpu.ram[MEM_SIZE - 1], 0xAB);
    }

    #[test]
    fn test_reload_replaces_state() {
        let mut vm = vm_with(&[0x6142, 0x2200]);
        vm.run_steps(2).unwrap();
        vm.set_key(KeyCode::Key1, true);

        vm.load_bytecode(&[0x00, 0xE0]).unwrap();
        assert_eq!(vm.cpu.pc, START);
        assert_eq!(vm.cpu.registers, [0; REGISTER_COUNT]);
        assert_eq!(vm.stack_depth(), 0);
        assert!(!vm.key_state(KeyCode::Key1));
        assert_eq!(vm.cpu.ram[MEM_START + 2], 0);
    }

    #[test]
    fn test_dump_keys() {
        let mut vm = Chip8Vm::new(Chip8Conf::default());
        assert_eq!(vm.dump_keys().unwrap(), "");

        vm.set_key(KeyCode::Key1, true);
        vm.set_key(KeyCode::KeyB, true);
        assert_eq!(vm.dump_keys().unwrap(), "keys: k1 kb");

        vm.clear_keys();
        assert_eq!(vm.dump_keys().unwrap(), "");
    }

    #[test]
    fn test_dump_display() {
        let mut vm = Chip8Vm::new(Chip8Conf::default());
        vm.cpu.display[1] = true;

        let dump = vm.dump_display().unwrap();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), DISPLAY_HEIGHT);
        assert!(lines[0].starts_with(".#.."));
        assert!(lines.iter().all(|line| line.len() == DISPLAY_WIDTH));
    }

    #[test]
    #[should_panic]
    fn test_register_out_of_range() {
        let vm = Chip8Vm::new(Chip8Conf::default());
        vm.register(REGISTER_COUNT);
    }
}
