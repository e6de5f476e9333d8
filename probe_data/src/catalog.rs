//! Names for the general purpose registers and the EFLAGS bits.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// General purpose registers, in the order `pushad` stores them (lowest address first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Edi,
    Esi,
    Ebp,
    Esp,
    Ebx,
    Edx,
    Ecx,
    Eax,
}

impl Register {
    /// Snapshot order.
    pub const ALL: [Register; 8] = [
        Register::Edi,
        Register::Esi,
        Register::Ebp,
        Register::Esp,
        Register::Ebx,
        Register::Edx,
        Register::Ecx,
        Register::Eax,
    ];

    /// Slot of the register inside a snapshot.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::Edi => "edi",
            Register::Esi => "esi",
            Register::Ebp => "ebp",
            Register::Esp => "esp",
            Register::Ebx => "ebx",
            Register::Edx => "edx",
            Register::Ecx => "ecx",
            Register::Eax => "eax",
        }
    }
}

impl Display for Register {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Architecturally defined EFLAGS bits. Reserved bits have no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Flag {
    Cf = 0x00,
    Pf = 0x02,
    Af = 0x04,
    Zf = 0x06,
    Sf = 0x07,
    Tf = 0x08,
    If = 0x09,
    Df = 0x0a,
    Of = 0x0b,
    Iopl1 = 0x0c,
    Iopl2 = 0x0d,
    Nt = 0x0e,
    Rf = 0x10,
    Vm = 0x11,
    Ac = 0x12,
    Vif = 0x13,
    Vip = 0x14,
    Id = 0x15,
}

impl Flag {
    pub fn from_bit(bit: u32) -> Option<Flag> {
        Some(match bit {
            0x00 => Flag::Cf,
            0x02 => Flag::Pf,
            0x04 => Flag::Af,
            0x06 => Flag::Zf,
            0x07 => Flag::Sf,
            0x08 => Flag::Tf,
            0x09 => Flag::If,
            0x0a => Flag::Df,
            0x0b => Flag::Of,
            0x0c => Flag::Iopl1,
            0x0d => Flag::Iopl2,
            0x0e => Flag::Nt,
            0x10 => Flag::Rf,
            0x11 => Flag::Vm,
            0x12 => Flag::Ac,
            0x13 => Flag::Vif,
            0x14 => Flag::Vip,
            0x15 => Flag::Id,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        FLAG_NAMES[self as usize]
    }
}

impl Display for Flag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Name of every EFLAGS bit, reserved ones included.
pub const FLAG_NAMES: [&str; 32] = [
    "cf",
    "reserved01",
    "pf",
    "reserved03",
    "af",
    "reserved05",
    "zf",
    "sf",
    "tf",
    "if",
    "df",
    "of",
    "iopl1",
    "iopl2",
    "nt",
    "reserved0f",
    "rf",
    "vm",
    "ac",
    "vif",
    "vip",
    "id",
    "reserved16",
    "reserved17",
    "reserved18",
    "reserved19",
    "reserved1a",
    "reserved1b",
    "reserved1c",
    "reserved1d",
    "reserved1e",
    "reserved1f",
];

/// Reserved bit 1 and IF, always set in user mode and never reported.
pub const VOLATILE_FLAGS_MASK: u32 = 0x0000_0202;

/// Bits that `popfd` can actually raise from user mode.
pub const SETTABLE_FLAGS_MASK: u32 = 0x0024_4ed7;

/// Flags seed of the "which flags get set" capture.
pub const SET_PROBE_FLAGS: u32 = 0x0000_0000;

/// Flags seed of the "which flags get cleared" capture: everything but TF.
pub const UNSET_PROBE_FLAGS: u32 = 0xffff_feff;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_catalog_consistent() {
        for bit in 0..32 {
            match Flag::from_bit(bit) {
                Some(flag) => {
                    assert_eq!(flag as u32, bit);
                    assert_eq!(FLAG_NAMES[bit as usize], flag.name());
                }
                None => assert!(FLAG_NAMES[bit as usize].starts_with("reserved")),
            }
        }
    }

    #[test]
    fn test_register_slots() {
        for (i, register) in Register::ALL.iter().enumerate() {
            assert_eq!(register.index(), i);
        }
        assert_eq!(Register::Eax.to_string(), "eax");
    }
}
