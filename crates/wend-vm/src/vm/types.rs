//! VM types and state definitions.

use wend_runtime::Value;

/// Instructions between collector checkpoints / pending-interrupt checks.
pub const POLL_INTERVAL: u32 = 100;

/// Outcome of running hosted code to completion, as seen by native code
/// and host callers.
#[derive(Debug)]
pub enum Answer {
    Value(Value),
    /// The callee produced no value (or a pumped generator is exhausted).
    Fail,
    /// An exception escaped past the caller; propagation continues outward.
    Raise(Value),
}

/// Why a loop activation ended.
#[derive(Debug)]
pub(crate) enum LoopExit {
    /// The barrier frame returned; its value. The frame is still on the
    /// arena; the entry point that installed it removes it.
    Returned(Value),
    /// The barrier frame suspended; the yielded value is on the arena.
    Yielded,
    /// An exception unwound past the barrier frame.
    Raised(Value),
}

/// Internal/VM-fatal conditions. These indicate a bug in the runtime or
/// corrupt bytecode, not an error in hosted code; nothing hosted can catch
/// them.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("corrupt frame arena: {0}")]
    CorruptStack(&'static str),
    #[error("failure signalled with no failure frame on the stack")]
    NoFailureFrame,
    #[error("exception reached the top of the call stack with no handler:\n{0}")]
    UncaughtException(String),
    #[error("unknown native function id {0}")]
    UnknownNative(u32),
    #[error("invalid instruction in module {module} at offset {off}")]
    InvalidInstruction { module: String, off: usize },
    #[error("bad operand in module {module} at offset {off}: {what}")]
    BadOperand {
        module: String,
        off: usize,
        what: &'static str,
    },
}
