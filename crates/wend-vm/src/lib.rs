//! # wend-vm
//!
//! The Wend execution core: a per-thread frame arena that fuses call
//! frames, backtracking choice points, exception handler scopes and
//! suspendable generator state, plus the bytecode dispatch loop that
//! interprets against it.

pub mod frame;
pub mod gc_roots;
pub mod generator;
pub mod propagate;
pub mod vm;

pub use vm::types::{Answer, VmError};
pub use vm::{NativeFn, Vm, WendThread};
