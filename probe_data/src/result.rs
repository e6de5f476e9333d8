use crate::catalog::{Flag, Register};
use crate::hex;
use crate::vector::TestVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// What a cleanly executing candidate did to the machine state.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effects {
    pub changed_registers: BTreeSet<Register>,
    pub set_flags: BTreeSet<Flag>,
    pub unset_flags: BTreeSet<Flag>,
}

impl Effects {
    /// True for candidates that behave like a `nop`.
    pub fn is_empty(&self) -> bool {
        self.changed_registers.is_empty()
            && self.set_flags.is_empty()
            && self.unset_flags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Good(Effects),
    Crash,
    Timeout,
    Weird {
        message: String,
        #[serde(with = "hex::serde_bytes")]
        output: Vec<u8>,
    },
}

impl Outcome {
    pub fn weird<S: Into<String>>(message: S, output: Vec<u8>) -> Self {
        Outcome::Weird {
            message: message.into(),
            output,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Good(_) => "good",
            Outcome::Crash => "crash",
            Outcome::Timeout => "timeout",
            Outcome::Weird { .. } => "weird",
        }
    }

    pub fn effects(&self) -> Option<&Effects> {
        match self {
            Outcome::Good(effects) => Some(effects),
            _ => None,
        }
    }
}

/// The verdict for one test vector. Built once by the probe pipeline and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub vector: TestVector,
    pub outcome: Outcome,
    pub disassembly: Vec<String>,
}

impl ProbeResult {
    pub fn new(vector: TestVector, outcome: Outcome, disassembly: Vec<String>) -> Self {
        Self {
            vector,
            outcome,
            disassembly,
        }
    }

    pub fn changed_registers(&self) -> impl Iterator<Item = Register> + '_ {
        self.outcome
            .effects()
            .into_iter()
            .flat_map(|e| e.changed_registers.iter().copied())
    }

    pub fn set_flags(&self) -> impl Iterator<Item = Flag> + '_ {
        self.outcome
            .effects()
            .into_iter()
            .flat_map(|e| e.set_flags.iter().copied())
    }

    pub fn unset_flags(&self) -> impl Iterator<Item = Flag> + '_ {
        self.outcome
            .effects()
            .into_iter()
            .flat_map(|e| e.unset_flags.iter().copied())
    }
}

// Eg. "40 => good :: eax, set:pf, unset:zf :: inc eax"
impl Display for ProbeResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} => {}", self.vector, self.outcome.name())?;
        match &self.outcome {
            Outcome::Good(_) => {
                let changes: Vec<String> = self
                    .changed_registers()
                    .map(|r| r.to_string())
                    .chain(self.set_flags().map(|flag| format!("set:{flag}")))
                    .chain(self.unset_flags().map(|flag| format!("unset:{flag}")))
                    .collect();
                write!(
                    f,
                    " :: [{}] :: {}",
                    changes.join(", "),
                    self.disassembly.join(" / ")
                )
            }
            Outcome::Timeout => write!(f, " :: {}", self.disassembly.join(" / ")),
            Outcome::Weird { message, .. } => {
                write!(f, " :: {} :: {}", message, self.disassembly.join(" / "))
            }
            Outcome::Crash => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inc_eax() -> ProbeResult {
        let mut effects = Effects::default();
        effects.changed_registers.insert(Register::Eax);
        effects.set_flags.insert(Flag::Pf);
        effects.unset_flags.insert(Flag::Zf);
        ProbeResult::new(
            TestVector::new(&[0x40]).unwrap(),
            Outcome::Good(effects),
            vec!["inc eax".to_string()],
        )
    }

    #[test]
    fn test_result_display() {
        assert_eq!(
            inc_eax().to_string(),
            "40 => good :: [eax, set:pf, unset:zf] :: inc eax"
        );

        let crash = ProbeResult::new(
            TestVector::new(&[0x0f, 0x0b]).unwrap(),
            Outcome::Crash,
            vec!["ud2".to_string()],
        );
        assert_eq!(crash.to_string(), "0f0b => crash");
        assert_eq!(crash.changed_registers().count(), 0);
    }

    #[test]
    fn test_result_json_roundtrip() {
        let weird = ProbeResult::new(
            TestVector::new(&[0xcd, 0x80]).unwrap(),
            Outcome::weird("The length was 40", vec![1, 2, 3]),
            vec!["int 80h".to_string()],
        );

        for result in [inc_eax(), weird] {
            let json = serde_json::to_string(&result).unwrap();
            let back: ProbeResult = serde_json::from_str(&json).unwrap();
            assert_eq!(back, result);
        }

        let json = serde_json::to_value(inc_eax()).unwrap();
        assert_eq!(json["outcome"]["status"], "good");
        assert_eq!(json["outcome"]["changed_registers"][0], "eax");
        assert_eq!(json["vector"], "40");
    }
}
