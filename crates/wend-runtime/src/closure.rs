//! Closure variable environments.
//!
//! A closure is a chain of variable frames, one per lexically enclosing
//! function. Variables are addressed by (levels back, index); level 0 is
//! the current function's own frame.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Closure(Arc<Env>);

#[derive(Debug)]
struct Env {
    vars: Mutex<Vec<Option<Value>>>,
    parent: Option<Closure>,
}

impl Closure {
    pub fn new(num_vars: usize, parent: Option<Closure>) -> Self {
        Closure(Arc::new(Env {
            vars: Mutex::new(vec![None; num_vars]),
            parent,
        }))
    }

    fn env(&self, levels_back: usize) -> Option<&Closure> {
        let mut cur = self;
        for _ in 0..levels_back {
            cur = cur.0.parent.as_ref()?;
        }
        Some(cur)
    }

    /// Read a variable; `None` if it has not been assigned (or the address
    /// is out of range, which only corrupt bytecode produces).
    pub fn get_var(&self, levels_back: usize, idx: usize) -> Option<Value> {
        let env = self.env(levels_back)?;
        env.0.vars.lock().get(idx).cloned().flatten()
    }

    /// Assign a variable; returns false on an out-of-range address.
    pub fn set_var(&self, levels_back: usize, idx: usize, val: Value) -> bool {
        let Some(env) = self.env(levels_back) else {
            return false;
        };
        let mut vars = env.0.vars.lock();
        match vars.get_mut(idx) {
            Some(slot) => {
                *slot = Some(val);
                true
            }
            None => false,
        }
    }

    pub fn is_assigned(&self, levels_back: usize, idx: usize) -> bool {
        self.get_var(levels_back, idx).is_some()
    }
}
