use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};
use std::fmt::Write;

/// Candidates are probed as 32-bit code.
pub const BITNESS: u32 = 32;

/// One line of instruction text per decoded instruction, for human review only.
pub fn disassemble(code: &[u8]) -> Vec<String> {
    let mut decoder = Decoder::with_ip(BITNESS, code, 0, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    formatter.options_mut().set_show_useless_prefixes(true);

    let mut lines = Vec::new();
    let mut instruction = Instruction::default();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let mut output = String::new();
        formatter.format(&instruction, &mut output);
        lines.push(output);
    }

    lines
}

/// Address, bytes and text of every instruction of `code`, as loaded at `ip`.
///
/// Runs of identical instructions (guard blocks, pushad piles) are folded into their
/// first line plus a repeat count.
pub fn listing(code: &[u8], ip: u64) -> String {
    let mut decoder = Decoder::with_ip(BITNESS, code, ip, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();

    formatter.options_mut().set_digit_separator("`");
    formatter.options_mut().set_first_operand_char_index(10);

    let mut out = String::new();
    let mut output = String::new();
    let mut instruction = Instruction::default();
    let mut previous: &[u8] = &[];
    let mut repeats = 0;

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let start_index = (instruction.ip() - ip) as usize;
        let instr_bytes = &code[start_index..start_index + instruction.len()];
        if instr_bytes == previous {
            repeats += 1;
            continue;
        }
        write_repeats(&mut out, repeats);
        repeats = 0;
        previous = instr_bytes;

        output.clear();
        formatter.format(&instruction, &mut output);

        // Eg. "08048054 B841414141           mov       eax,41414141h"
        let _ = write!(out, "{:08X} ", instruction.ip());
        for b in instr_bytes.iter() {
            let _ = write!(out, "{:02X}", b);
        }
        if instr_bytes.len() < 10 {
            for _ in 0..10 - instr_bytes.len() {
                out.push_str("  ");
            }
        }
        let _ = writeln!(out, " {}", output);
    }
    write_repeats(&mut out, repeats);

    out
}

fn write_repeats(out: &mut String, repeats: usize) {
    if repeats > 0 {
        let _ = writeln!(out, "{:8} ... {} more", "", repeats);
    }
}
