//! Builtin singletons.

use once_cell::sync::Lazy;

use crate::value::{Obj, Repr, Value};

pub const BUILTIN_NULL: u16 = 0;
pub const BUILTIN_FAIL: u16 = 1;

static NULL: Lazy<Value> = Lazy::new(|| Obj::new(Repr::Null));
static FAIL: Lazy<Value> = Lazy::new(|| Obj::new(Repr::Fail));

pub fn null() -> Value {
    NULL.clone()
}

/// The fail sentinel: how a callee signals "no value" to its caller.
pub fn fail() -> Value {
    FAIL.clone()
}

pub fn is_fail(v: &Value) -> bool {
    matches!(v.repr, Repr::Fail)
}

pub fn by_id(id: u16) -> Option<Value> {
    match id {
        BUILTIN_NULL => Some(null()),
        BUILTIN_FAIL => Some(fail()),
        _ => None,
    }
}
