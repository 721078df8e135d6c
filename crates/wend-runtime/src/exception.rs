//! Raisable exception values and their call chains.
//!
//! The call chain is assembled incrementally while the exception propagator
//! unwinds; entries keep a live reference to the function object so nothing
//! in the chain can be collected out from under a handler.

use parking_lot::Mutex;

use wend_common_core::bytecode::Pc;

use crate::value::{self, Obj, Repr, Value};

/// One `(function, pc)` record collected during unwinding.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub func: Value,
    pub pc: Pc,
}

#[derive(Debug)]
pub struct ExceptionState {
    pub name: String,
    pub msg: String,
    pub call_chain: Vec<ChainEntry>,
}

/// Construct a raisable value from a symbolic exception name and a message.
pub fn new(name: &str, msg: &str) -> Value {
    Obj::new(Repr::Exception(Mutex::new(ExceptionState {
        name: name.to_string(),
        msg: msg.to_string(),
        call_chain: Vec::new(),
    })))
}

pub fn is_exception(v: &Value) -> bool {
    matches!(v.repr, Repr::Exception(_))
}

/// Append one unwinding record to the exception's chain.
pub fn push_chain_entry(exc: &Value, func: Value, pc: Pc) {
    if let Repr::Exception(state) = &exc.repr {
        state.lock().call_chain.push(ChainEntry { func, pc });
    }
}

pub fn name(exc: &Value) -> Option<String> {
    match &exc.repr {
        Repr::Exception(state) => Some(state.lock().name.clone()),
        _ => None,
    }
}

pub fn chain_len(exc: &Value) -> usize {
    match &exc.repr {
        Repr::Exception(state) => state.lock().call_chain.len(),
        _ => 0,
    }
}

/// Render the backtrace: one line per call-chain record (source location
/// for bytecode PCs, `internal` for native ones) followed by the message.
pub fn render_backtrace(exc: &Value) -> String {
    let Repr::Exception(state) = &exc.repr else {
        return value::to_str(exc);
    };
    let state = state.lock();
    let mut out = String::from("Traceback (most recent call at top):\n");
    for entry in &state.call_chain {
        let func_name = value::as_func(&entry.func)
            .map(|f| f.name.as_str())
            .unwrap_or("<obj>");
        out.push_str(&format!("  {} at {}\n", func_name, entry.pc.describe()));
    }
    out.push_str(&format!("{}: {}", state.name, state.msg));
    out
}
