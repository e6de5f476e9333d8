pub mod config;
pub mod disasm;
pub mod elf;
pub mod executor;
pub mod harness;
pub mod probe;
pub mod scheduler;
pub mod state;
