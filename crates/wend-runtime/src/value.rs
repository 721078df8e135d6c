//! The boundary object model.
//!
//! The execution core sees runtime objects through a deliberately small
//! surface: slot get/set, the comparison and arithmetic hooks the opcodes
//! delegate to, and the handful of container operations literal
//! construction needs. Everything else about the hosted object system
//! (inheritance, library methods) lives outside this crate.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use wend_common_core::bytecode::Pc;

use crate::closure::Closure;
use crate::exception::ExceptionState;
use crate::lock;

/// One reference-counted runtime object.
pub type Value = Arc<Obj>;

/// A hosted function: native or bytecode, optionally bound to a receiver at
/// lookup time.
#[derive(Debug, Clone)]
pub struct Func {
    pub name: String,
    pub is_bound: bool,
    pub pc: Pc,
    pub num_params: u16,
    pub num_vars: u16,
    /// Closure of the lexically enclosing function, if any.
    pub container: Option<Closure>,
}

/// Keys usable in dicts and sets: restricted to the hashable reprs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Int(i64),
    Str(String),
}

#[derive(Debug)]
pub enum Repr {
    Null,
    /// The fail sentinel. Not a value hosted code can construct; it is how
    /// a callee signals "no value" to its caller.
    Fail,
    Int(i64),
    Float(f64),
    Str(String),
    List(Mutex<Vec<Value>>),
    Dict(Mutex<HashMap<Key, Value>>),
    Set(Mutex<HashSet<Key>>),
    Func(Func),
    Exception(Mutex<ExceptionState>),
}

#[derive(Debug)]
pub struct Obj {
    slots: Mutex<HashMap<String, Value>>,
    pub repr: Repr,
}

impl Obj {
    pub fn new(repr: Repr) -> Value {
        Arc::new(Obj {
            slots: Mutex::new(HashMap::new()),
            repr,
        })
    }

    pub fn get_slot(&self, name: &str) -> Option<Value> {
        self.slots.lock().get(name).cloned()
    }

    pub fn set_slot(&self, name: &str, val: Value) {
        self.slots.lock().insert(name.to_string(), val);
    }
}

// === Constructors ===

pub fn int(v: i64) -> Value {
    Obj::new(Repr::Int(v))
}

pub fn float(v: f64) -> Value {
    Obj::new(Repr::Float(v))
}

pub fn string(s: &str) -> Value {
    Obj::new(Repr::Str(s.to_string()))
}

pub fn list(elems: Vec<Value>) -> Value {
    Obj::new(Repr::List(Mutex::new(elems)))
}

pub fn dict(entries: impl IntoIterator<Item = (Key, Value)>) -> Value {
    Obj::new(Repr::Dict(Mutex::new(entries.into_iter().collect())))
}

pub fn set(keys: impl IntoIterator<Item = Key>) -> Value {
    Obj::new(Repr::Set(Mutex::new(keys.into_iter().collect())))
}

pub fn func(f: Func) -> Value {
    Obj::new(Repr::Func(f))
}

// === Accessors ===

pub fn as_int(v: &Value) -> Option<i64> {
    match v.repr {
        Repr::Int(i) => Some(i),
        _ => None,
    }
}

pub fn as_str(v: &Value) -> Option<&str> {
    match &v.repr {
        Repr::Str(s) => Some(s),
        _ => None,
    }
}

pub fn as_func(v: &Value) -> Option<&Func> {
    match &v.repr {
        Repr::Func(f) => Some(f),
        _ => None,
    }
}

/// Key form of a value, if it has one.
pub fn as_key(v: &Value) -> Option<Key> {
    match &v.repr {
        Repr::Int(i) => Some(Key::Int(*i)),
        Repr::Str(s) => Some(Key::Str(s.clone())),
        _ => None,
    }
}

// === Identity and equality ===

/// Object identity (the `Is` opcode).
pub fn is_same(a: &Value, b: &Value) -> bool {
    Arc::ptr_eq(a, b)
}

/// Structural equality. Two-object container comparisons take both object
/// locks through the ordered multi-lock; `None` means the pairing has no
/// defined equality.
pub fn eq(a: &Value, b: &Value) -> Option<bool> {
    if Arc::ptr_eq(a, b) {
        return Some(true);
    }
    match (&a.repr, &b.repr) {
        (Repr::Null, Repr::Null) => Some(true),
        (Repr::Int(x), Repr::Int(y)) => Some(x == y),
        (Repr::Float(x), Repr::Float(y)) => Some(x == y),
        (Repr::Int(x), Repr::Float(y)) | (Repr::Float(y), Repr::Int(x)) => {
            Some(*x as f64 == *y)
        }
        (Repr::Str(x), Repr::Str(y)) => Some(x == y),
        (Repr::List(x), Repr::List(y)) => {
            let (gx, gy) = lock::lock_pair(x, y);
            if gx.len() != gy.len() {
                return Some(false);
            }
            for (ex, ey) in gx.iter().zip(gy.iter()) {
                match eq(ex, ey) {
                    Some(true) => {}
                    other => return other.map(|_| false),
                }
            }
            Some(true)
        }
        (Repr::Set(x), Repr::Set(y)) => {
            let (gx, gy) = lock::lock_pair(x, y);
            Some(*gx == *gy)
        }
        (Repr::Dict(x), Repr::Dict(y)) => {
            let (gx, gy) = lock::lock_pair(x, y);
            if gx.len() != gy.len() {
                return Some(false);
            }
            for (k, vx) in gx.iter() {
                match gy.get(k) {
                    Some(vy) if eq(vx, vy) == Some(true) => {}
                    _ => return Some(false),
                }
            }
            Some(true)
        }
        _ => Some(false),
    }
}

/// Ordering comparison. Defined for number pairs and string pairs; `None`
/// otherwise, which the VM turns into a type exception.
pub fn cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (&a.repr, &b.repr) {
        (Repr::Int(x), Repr::Int(y)) => Some(x.cmp(y)),
        (Repr::Float(x), Repr::Float(y)) => x.partial_cmp(y),
        (Repr::Int(x), Repr::Float(y)) => (*x as f64).partial_cmp(y),
        (Repr::Float(x), Repr::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Repr::Str(x), Repr::Str(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// === Arithmetic ===

pub fn add(a: &Value, b: &Value) -> Option<Value> {
    match (&a.repr, &b.repr) {
        (Repr::Int(x), Repr::Int(y)) => Some(int(x.wrapping_add(*y))),
        (Repr::Float(x), Repr::Float(y)) => Some(float(x + y)),
        (Repr::Int(x), Repr::Float(y)) => Some(float(*x as f64 + y)),
        (Repr::Float(x), Repr::Int(y)) => Some(float(x + *y as f64)),
        (Repr::Str(x), Repr::Str(y)) => {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Some(Obj::new(Repr::Str(s)))
        }
        (Repr::List(x), Repr::List(y)) => {
            let (gx, gy) = lock::lock_pair(x, y);
            let mut out = Vec::with_capacity(gx.len() + gy.len());
            out.extend(gx.iter().cloned());
            out.extend(gy.iter().cloned());
            Some(list(out))
        }
        _ => None,
    }
}

pub fn sub(a: &Value, b: &Value) -> Option<Value> {
    match (&a.repr, &b.repr) {
        (Repr::Int(x), Repr::Int(y)) => Some(int(x.wrapping_sub(*y))),
        (Repr::Float(x), Repr::Float(y)) => Some(float(x - y)),
        (Repr::Int(x), Repr::Float(y)) => Some(float(*x as f64 - y)),
        (Repr::Float(x), Repr::Int(y)) => Some(float(x - *y as f64)),
        _ => None,
    }
}

// === Containers ===

pub fn list_len(v: &Value) -> Option<usize> {
    match &v.repr {
        Repr::List(l) => Some(l.lock().len()),
        _ => None,
    }
}

pub fn list_get(v: &Value, idx: usize) -> Option<Value> {
    match &v.repr {
        Repr::List(l) => l.lock().get(idx).cloned(),
        _ => None,
    }
}

pub fn list_append(v: &Value, elem: Value) -> bool {
    match &v.repr {
        Repr::List(l) => {
            l.lock().push(elem);
            true
        }
        _ => false,
    }
}

// === Rendering ===

/// Human-readable rendering, used for messages and diagnostics.
pub fn to_str(v: &Value) -> String {
    match &v.repr {
        Repr::Null => "null".to_string(),
        Repr::Fail => "<fail>".to_string(),
        Repr::Int(i) => i.to_string(),
        Repr::Float(f) => f.to_string(),
        Repr::Str(s) => s.clone(),
        Repr::List(l) => {
            let l = l.lock();
            let elems: Vec<String> = l.iter().map(to_str).collect();
            format!("[{}]", elems.join(", "))
        }
        Repr::Dict(d) => format!("<dict of {}>", d.lock().len()),
        Repr::Set(s) => format!("<set of {}>", s.lock().len()),
        Repr::Func(f) => format!("<func {}>", f.name),
        Repr::Exception(e) => {
            let e = e.lock();
            format!("{}: {}", e.name, e.msg)
        }
    }
}
