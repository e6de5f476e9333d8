//! Turns what the driver saw into an [`Outcome`].

use crate::catalog::{Flag, Register, SETTABLE_FLAGS_MASK, VOLATILE_FLAGS_MASK};
use crate::output::{HarnessOutput, OutputLayout, CRASH_FLOOR};
use crate::result::{Effects, Outcome};
use crate::Execution;
use log::trace;
use std::collections::BTreeSet;

pub fn classify(execution: Execution, layout: &OutputLayout) -> Outcome {
    let output = match execution {
        Execution::TimedOut => return Outcome::Timeout,
        Execution::Crashed(_) => return Outcome::Crash,
        Execution::Completed(output) => output,
    };

    if output.len() == layout.expected_len() {
        return match layout.decode(&output) {
            Ok(decoded) => Outcome::Good(effects(&decoded)),
            Err(err) => Outcome::weird(err.to_string(), output),
        };
    }

    if output.len() <= CRASH_FLOOR {
        trace!("Completed with only {} bytes of output", output.len());
        return Outcome::Crash;
    }

    Outcome::weird(format!("The length was {}", output.len()), output)
}

pub fn effects(output: &HarnessOutput) -> Effects {
    Effects {
        changed_registers: changed_registers(output),
        set_flags: set_flags(output.set_flags),
        unset_flags: unset_flags(output.unset_flags),
    }
}

/// A register counts as changed if any capture group saw it differ after either run.
pub fn changed_registers(output: &HarnessOutput) -> BTreeSet<Register> {
    Register::ALL
        .into_iter()
        .filter(|register| output.groups.iter().any(|group| group.changed(*register)))
        .collect()
}

/// Flags raised by the candidate when starting from all-clear.
pub fn set_flags(word: u32) -> BTreeSet<Flag> {
    let word = word & !VOLATILE_FLAGS_MASK;
    (0..32u32)
        .filter(|&bit| word & (1u32 << bit) != 0)
        .filter_map(Flag::from_bit)
        .collect()
}

/// Flags cleared by the candidate when starting from all-set.
pub fn unset_flags(word: u32) -> BTreeSet<Flag> {
    let word = word | !SETTABLE_FLAGS_MASK;
    (0..32u32)
        .filter(|&bit| word & (1u32 << bit) == 0)
        .filter_map(Flag::from_bit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{CaptureGroup, RegisterSnapshot};

    fn snapshot(value: u32) -> RegisterSnapshot {
        RegisterSnapshot { values: [value; 8] }
    }

    fn unchanged_group(value: u32) -> CaptureGroup {
        CaptureGroup {
            base: snapshot(value),
            first_run: snapshot(value),
            second_run: snapshot(value),
        }
    }

    // what a `nop` reports: only the reserved bit 1 and IF survive
    fn nop_output() -> HarnessOutput {
        HarnessOutput {
            set_flags: 0x0000_0202,
            unset_flags: 0x0024_4ed7,
            groups: vec![unchanged_group(0), unchanged_group(0), unchanged_group(0)],
        }
    }

    #[test]
    fn test_classify_by_length() {
        let layout = OutputLayout::default();

        let good = classify(Execution::Completed(nop_output().encode()), &layout);
        assert_eq!(good, Outcome::Good(Effects::default()));

        let completed = |len| classify(Execution::Completed(vec![0; len]), &layout);
        assert_eq!(completed(0), Outcome::Crash);
        assert_eq!(completed(31), Outcome::Crash);
        assert_eq!(completed(32), Outcome::Crash);

        match classify(Execution::Completed(vec![7; 100]), &layout) {
            Outcome::Weird { message, output } => {
                assert_eq!(message, "The length was 100");
                assert_eq!(output, vec![7; 100]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let weird = classify(Execution::Completed(vec![0; 297]), &layout);
        assert_eq!(weird.name(), "weird");
    }

    #[test]
    fn test_classify_driver_status_wins() {
        let layout = OutputLayout::default();
        assert_eq!(classify(Execution::TimedOut, &layout), Outcome::Timeout);
        assert_eq!(
            classify(Execution::Crashed(nop_output().encode()), &layout),
            Outcome::Crash
        );
    }

    #[test]
    fn test_volatile_flags_never_reported() {
        assert!(set_flags(0x0000_0202).is_empty());
        assert_eq!(
            set_flags(0x0000_0203),
            BTreeSet::from([Flag::Cf])
        );
        // reserved bits are dropped
        assert_eq!(set_flags(0x8000_0042), BTreeSet::from([Flag::Zf]));
    }

    #[test]
    fn test_unset_flags_only_settable_bits() {
        assert!(unset_flags(0x0024_4ed7).is_empty());
        assert!(unset_flags(0xffff_ffff).is_empty());
        assert_eq!(
            unset_flags(0x0024_4ed7 & !0x41),
            BTreeSet::from([Flag::Cf, Flag::Zf])
        );
        // bits outside the mask never show up, even when clear
        assert_eq!(unset_flags(0x0024_4ed7 & !0x0100_0000), BTreeSet::new());
        // bit 1 is in the mask but reserved
        assert!(unset_flags(0x0024_4ed5).is_empty());
        assert_eq!(
            unset_flags(0),
            BTreeSet::from([
                Flag::Cf,
                Flag::Pf,
                Flag::Af,
                Flag::Zf,
                Flag::Sf,
                Flag::If,
                Flag::Df,
                Flag::Of,
                Flag::Nt,
                Flag::Ac,
                Flag::Id
            ])
        );
    }

    #[test]
    fn test_changed_registers_across_groups() {
        let mut output = nop_output();
        output.groups[0].first_run.values[Register::Eax.index()] = 1;
        // toggles back after the second run, still a change
        output.groups[1].first_run.values[Register::Ecx.index()] = 5;
        // only visible on the second run
        output.groups[2].second_run.values[Register::Esp.index()] = 4;

        assert_eq!(
            changed_registers(&output),
            BTreeSet::from([Register::Eax, Register::Ecx, Register::Esp])
        );
    }

    #[test]
    fn test_effects_idempotent() {
        let mut output = nop_output();
        output.set_flags = 0x0000_08c7;
        output.unset_flags = 0x0020_0ed6;
        output.groups[1].second_run.values[Register::Edx.index()] = 9;

        let a = effects(&output);
        let b = effects(&output);
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }
}
