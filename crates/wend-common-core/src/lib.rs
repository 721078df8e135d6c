//! # wend-common-core
//!
//! Shared core types for the Wend VM:
//! - `instruction` - Bytecode instruction format and opcodes
//! - `bytecode` - Module store, program counters, source mapping

pub mod bytecode;
pub mod instruction;

pub use bytecode::{Module, ModuleBuilder, SrcInfo};
pub use instruction::{Instruction, Opcode};
