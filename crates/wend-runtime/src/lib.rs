//! # wend-runtime
//!
//! Runtime support for the Wend VM:
//! - `value` - the boundary object model (slots, builtin reprs, operators)
//! - `closure` - closure variable environments
//! - `exception` - raisable values and call chains
//! - `lock` - per-object mutex discipline and the ordered multi-lock
//! - `heap` - cooperative collector checkpoint and interrupt flag
//! - `builtins` - the fail/null singletons

pub mod builtins;
pub mod closure;
pub mod exception;
pub mod heap;
pub mod lock;
pub mod value;

pub use closure::Closure;
pub use heap::Heap;
pub use value::{Func, Obj, Repr, Value};
