//! Builds the executable that runs one candidate.
//!
//! The image first tries hard to make the candidate crash: every combination of
//! crash-sweep register and flag seeds runs it between a stack guard (a pile of
//! `pushad` frames with non-pointer values just below `esp`) and two jump guards
//! (an `int3` block that is jumped over, so a candidate that branches or eats the
//! following bytes lands on a trap). If the process survives, the captures are
//! written to stdout in the order documented in [`probe_data::output`] and the
//! process exits with status 0.

use crate::config::ProbeConfig;
use crate::elf;
use iced_x86::code_asm::{self, AsmRegister32, CodeAssembler};
use iced_x86::IcedError;
use log::trace;
use probe_data::catalog::{SET_PROBE_FLAGS, UNSET_PROBE_FLAGS};
use probe_data::output::{SNAPSHOT_SIZE, WORD_SIZE};
use probe_data::vector::MAX_VECTOR_LEN;
use probe_data::TestVector;
use std::error::Error;
use std::fmt::{Display, Formatter};

const SYS_EXIT: i32 = 1;
const SYS_WRITE: i32 = 4;
const STDOUT: i32 = 1;
const TRAP: u8 = 0xcc;

/// Register values written before the stack guard, recognisable in a crash dump.
const GUARD_REGISTERS: [(AsmRegister32, u32); 7] = [
    (code_asm::eax, 0x4141_4141),
    (code_asm::ebx, 0x4242_4242),
    (code_asm::ecx, 0x4343_4343),
    (code_asm::edx, 0x4444_4444),
    (code_asm::esi, 0x4545_4545),
    (code_asm::edi, 0x4646_4646),
    (code_asm::ebp, 0x4747_4747),
];

/// Everything but `esp`.
const SEEDED_REGISTERS: [AsmRegister32; 7] = [
    code_asm::eax,
    code_asm::ebx,
    code_asm::ecx,
    code_asm::edx,
    code_asm::esi,
    code_asm::edi,
    code_asm::ebp,
];

#[derive(Debug)]
pub enum HarnessError {
    TooLong(usize),
    Assembler(IcedError),
}

impl Display for HarnessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::TooLong(len) => write!(
                f,
                "Code of {} bytes does not fit the {} byte slot",
                len, MAX_VECTOR_LEN
            ),
            HarnessError::Assembler(e) => write!(f, "Assembler error: {}", e),
        }
    }
}

impl Error for HarnessError {}

impl From<IcedError> for HarnessError {
    fn from(error: IcedError) -> Self {
        HarnessError::Assembler(error)
    }
}

#[derive(Debug, Clone)]
pub struct HarnessGenerator {
    config: ProbeConfig,
}

impl HarnessGenerator {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Executable image for `vector`, padded to the fixed slot size.
    pub fn generate(&self, vector: &TestVector) -> Result<Vec<u8>, HarnessError> {
        let code = self.assemble(&vector.padded())?;
        trace!("Harness for {} has {} bytes of code", vector, code.len());
        Ok(elf::wrap(&code))
    }

    /// Machine code of the harness around `code`, assembled for [`elf::entry_point`].
    pub fn assemble(&self, code: &[u8]) -> Result<Vec<u8>, HarnessError> {
        if code.len() > MAX_VECTOR_LEN {
            return Err(HarnessError::TooLong(code.len()));
        }

        let mut writer = HarnessWriter {
            a: CodeAssembler::new(32)?,
            config: &self.config,
            code,
        };

        for registers in &self.config.crash_register_seeds {
            for flags in &self.config.crash_flag_seeds {
                writer.clean_slate(*registers, *flags)?;
            }
        }

        writer.set_flags(SET_PROBE_FLAGS)?;
        writer.run_code()?;
        writer.print_flags()?;

        writer.set_flags(UNSET_PROBE_FLAGS)?;
        writer.run_code()?;
        writer.print_flags()?;

        for (registers, flags) in self.config.capture_seeds() {
            writer.set_registers(registers)?;
            writer.set_flags(flags)?;
            writer.print_registers()?;
            writer.run_code()?;
            writer.print_registers()?;
            writer.run_code()?;
            writer.print_registers()?;
        }

        writer.exit()?;

        Ok(writer.a.assemble(elf::entry_point() as u64)?)
    }
}

struct HarnessWriter<'a> {
    a: CodeAssembler,
    config: &'a ProbeConfig,
    code: &'a [u8],
}

impl HarnessWriter<'_> {
    fn clean_slate(&mut self, registers: Option<u32>, flags: Option<u32>) -> Result<(), IcedError> {
        self.stack_guard(|w| {
            if let Some(registers) = registers {
                w.set_registers(registers)?;
            }
            if let Some(flags) = flags {
                w.set_flags(flags)?;
            }
            w.jump_guard(|w| w.run_code())
        })
    }

    fn stack_guard<F>(&mut self, body: F) -> Result<(), IcedError>
    where
        F: FnOnce(&mut Self) -> Result<(), IcedError>,
    {
        for (register, value) in GUARD_REGISTERS {
            self.a.mov(register, value as i32)?;
        }

        let frames = self.config.stack_guard_frames;
        for _ in 0..frames {
            self.a.pushad()?;
        }
        // leave half of the frames below esp
        for _ in 0..frames / 2 {
            self.a.popad()?;
        }

        body(self)?;

        for _ in 0..frames - frames / 2 {
            self.a.popad()?;
        }
        Ok(())
    }

    fn jump_guard<F>(&mut self, body: F) -> Result<(), IcedError>
    where
        F: FnOnce(&mut Self) -> Result<(), IcedError>,
    {
        self.trap_block()?;
        body(self)?;
        self.trap_block()
    }

    fn trap_block(&mut self) -> Result<(), IcedError> {
        let mut after = self.a.create_label();
        self.a.jmp(after)?;
        self.a.db(&vec![TRAP; self.config.jump_guard_bytes])?;
        // attaches to whatever is emitted next
        self.a.set_label(&mut after)
    }

    fn set_registers(&mut self, value: u32) -> Result<(), IcedError> {
        for register in SEEDED_REGISTERS {
            self.a.mov(register, value as i32)?;
        }
        Ok(())
    }

    fn set_flags(&mut self, value: u32) -> Result<(), IcedError> {
        self.a.push(value as i32)?;
        self.a.popfd()
    }

    fn run_code(&mut self) -> Result<(), IcedError> {
        self.a.db(self.code)
    }

    fn print_registers(&mut self) -> Result<(), IcedError> {
        self.a.pushad()?;
        self.write_stack_top(SNAPSHOT_SIZE)?;
        self.a.popad()
    }

    fn print_flags(&mut self) -> Result<(), IcedError> {
        self.a.pushfd()?;
        self.write_stack_top(WORD_SIZE)?;
        self.a.add(code_asm::esp, WORD_SIZE as i32)
    }

    /// write(1, esp, len)
    fn write_stack_top(&mut self, len: usize) -> Result<(), IcedError> {
        self.a.mov(code_asm::eax, SYS_WRITE)?;
        self.a.mov(code_asm::ebx, STDOUT)?;
        self.a.mov(code_asm::ecx, code_asm::esp)?;
        self.a.mov(code_asm::edx, len as i32)?;
        self.a.int(0x80)
    }

    fn exit(&mut self) -> Result<(), IcedError> {
        self.a.mov(code_asm::eax, SYS_EXIT)?;
        self.a.xor(code_asm::ebx, code_asm::ebx)?;
        self.a.int(0x80)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind, Register};

    fn decode_all(code: &[u8]) -> Vec<iced_x86::Instruction> {
        Decoder::with_ip(32, code, elf::entry_point() as u64, DecoderOptions::NONE)
            .into_iter()
            .collect()
    }

    fn count(instructions: &[iced_x86::Instruction], mnemonic: Mnemonic) -> usize {
        instructions
            .iter()
            .filter(|i| i.mnemonic() == mnemonic)
            .count()
    }

    #[test]
    fn test_rejects_long_code() {
        let generator = HarnessGenerator::new(ProbeConfig::default());
        assert!(matches!(
            generator.assemble(&[1, 2, 3, 4]),
            Err(HarnessError::TooLong(4))
        ));
    }

    #[test]
    fn test_harness_structure() {
        let config = ProbeConfig::default();
        let generator = HarnessGenerator::new(config.clone());
        let code = generator.assemble(&[0x90; 3]).unwrap();
        let instructions = decode_all(&code);

        let sweeps = config.crash_register_seeds.len() * config.crash_flag_seeds.len();
        let groups = config.capture_groups;
        assert_eq!(sweeps, 20);

        // two guards per sweep iteration
        assert_eq!(count(&instructions, Mnemonic::Int3), 2 * sweeps * 512);

        let flag_seeds = config.crash_flag_seeds.iter().filter(|f| f.is_some()).count();
        assert_eq!(
            count(&instructions, Mnemonic::Popfd),
            config.crash_register_seeds.len() * flag_seeds + 2 + groups
        );

        // every run of the candidate is three nops
        let runs = sweeps + 2 + 2 * groups;
        assert_eq!(count(&instructions, Mnemonic::Nop), 3 * runs);

        let pushad = count(&instructions, Mnemonic::Pushad);
        let popad = count(&instructions, Mnemonic::Popad);
        assert_eq!(pushad, popad);
    }

    #[test]
    fn test_harness_writes_expected_layout() {
        for groups in [3, 12] {
            let config = ProbeConfig {
                capture_groups: groups,
                ..Default::default()
            };
            let generator = HarnessGenerator::new(config.clone());
            let code = generator.assemble(&[0x90; 3]).unwrap();

            let mut eax = None;
            let mut edx = None;
            let mut written = 0;
            let mut exits = 0;
            for instruction in decode_all(&code) {
                match instruction.mnemonic() {
                    Mnemonic::Mov if instruction.op1_kind() == OpKind::Immediate32 => {
                        match instruction.op0_register() {
                            Register::EAX => eax = Some(instruction.immediate32()),
                            Register::EDX => edx = Some(instruction.immediate32()),
                            _ => {}
                        }
                    }
                    Mnemonic::Int if instruction.immediate8() == 0x80 => match eax {
                        Some(4) => written += edx.unwrap() as usize,
                        Some(1) => exits += 1,
                        other => panic!("unexpected syscall {other:?}"),
                    },
                    _ => {}
                }
            }

            assert_eq!(written, config.layout().expected_len());
            assert_eq!(exits, 1);
        }
    }

    #[test]
    fn test_generate_pads_and_wraps() {
        let generator = HarnessGenerator::new(ProbeConfig::default());
        let vector = TestVector::new(&[0x40]).unwrap();

        let image = generator.generate(&vector).unwrap();
        let code = generator.assemble(&[0x90, 0x90, 0x40]).unwrap();
        assert_eq!(&image[..4], b"\x7fELF");
        assert_eq!(&image[elf::HEADERS_SIZE..], &code[..]);
    }
}
