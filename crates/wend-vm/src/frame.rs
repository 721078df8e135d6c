//! The frame arena: one growable stack per thread carrying values, call
//! activations, backtracking choice points, exception handler scopes and
//! generator anchors, threaded by four independent frame-pointer lists.
//!
//! Entries are a tagged union and frame links are indices, so arena growth
//! never invalidates a live reference. Records obey strict LIFO order with
//! one exception: suspending a generator excises its continuation frame and
//! everything above it into the generator frame's private snapshot, to be
//! spliced back on resumption.
//!
//! All operations here run under the arena's mutex; the ops live on the
//! inner type behind the lock, so the "mutex must be held" contract is
//! enforced by the borrow rather than asserted.

use wend_common_core::bytecode::Pc;
use wend_runtime::{Closure, Value};

use crate::vm::types::VmError;

/// One record on the arena.
#[derive(Debug, Clone)]
pub enum Entry {
    /// A runtime object. The overwhelmingly common record.
    Value(Value),
    /// A not-yet-bound `(receiver, function)` pair: the slot was looked up
    /// for application, but binding is deferred until the call actually
    /// happens so the hot path allocates no bound-method object.
    PendingBind { recv: Value, func: Value },
    Continuation(ContinuationFrame),
    Failure(FailureFrame),
    Exception(ExceptionFrame),
    Generator(GeneratorFrame),
    EYield(EYieldFrame),
}

/// One call activation.
#[derive(Debug, Clone)]
pub struct ContinuationFrame {
    pub prev_cfp: Option<usize>,
    pub prev_ffp: Option<usize>,
    pub prev_xfp: Option<usize>,
    pub prev_gfp: Option<usize>,
    pub func: Value,
    pub closure: Closure,
    pub pc: Pc,
    /// Where the caller continues if this call is pumped as a generator.
    pub resumption_pc: Option<Pc>,
    pub returns_as_generator: bool,
}

/// One backtracking choice point.
#[derive(Debug, Clone)]
pub struct FailureFrame {
    pub prev_ffp: Option<usize>,
    pub prev_gfp: Option<usize>,
    pub is_fail_up: bool,
    /// Branch target on failure; `None` for fail-up frames.
    pub fail_to: Option<Pc>,
}

/// One exception handler scope.
#[derive(Debug, Clone)]
pub struct ExceptionFrame {
    pub prev_ffp: Option<usize>,
    pub prev_gfp: Option<usize>,
    pub prev_xfp: Option<usize>,
    pub handler_pc: Pc,
}

/// Anchor for a suspendable call.
#[derive(Debug, Clone)]
pub struct GeneratorFrame {
    pub prev_gfp: Option<usize>,
    /// The call produced its final value; no further pumping possible.
    pub returned: bool,
    /// Excised arena slice while suspended; empty when running or fresh.
    pub snapshot: Vec<Entry>,
    /// Arena index the snapshot was excised from, for link rebasing.
    pub snapshot_base: usize,
    pub suspended_cfp: Option<usize>,
    pub suspended_ffp: Option<usize>,
    pub suspended_xfp: Option<usize>,
    pub suspended_gfp: Option<usize>,
    pub resumption_pc: Option<Pc>,
}

/// Lightweight anchor used by the alternation construct; never suspends
/// mid-function, so it carries no snapshot.
#[derive(Debug, Clone)]
pub struct EYieldFrame {
    pub prev_gfp: Option<usize>,
    pub resumption_pc: Pc,
}

/// The per-thread arena. `top` is `entries.len()`; the four frame pointers
/// are each `None` or the index of the frame's entry.
#[derive(Debug, Default)]
pub struct Arena {
    entries: Vec<Entry>,
    pub cfp: Option<usize>,
    pub ffp: Option<usize>,
    pub xfp: Option<usize>,
    pub gfp: Option<usize>,
}

fn corrupt(what: &'static str) -> VmError {
    VmError::CorruptStack(what)
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit every live value for the collector, including values held in
    /// suspended generator snapshots.
    pub fn trace(&self, f: &mut dyn FnMut(&Value)) {
        fn trace_entries(entries: &[Entry], f: &mut dyn FnMut(&Value)) {
            for e in entries {
                match e {
                    Entry::Value(v) => f(v),
                    Entry::PendingBind { recv, func } => {
                        f(recv);
                        f(func);
                    }
                    Entry::Continuation(cf) => f(&cf.func),
                    Entry::Generator(gf) => trace_entries(&gf.snapshot, f),
                    Entry::Failure(_) | Entry::Exception(_) | Entry::EYield(_) => {}
                }
            }
        }
        trace_entries(&self.entries, f);
    }

    // === Values ===

    pub fn push_value(&mut self, v: Value) {
        self.entries.push(Entry::Value(v));
    }

    pub fn pop_value(&mut self) -> Result<Value, VmError> {
        match self.entries.pop() {
            Some(Entry::Value(v)) => Ok(v),
            Some(other) => {
                self.entries.push(other);
                Err(corrupt("pop_value on non-value entry"))
            }
            None => Err(corrupt("pop_value on empty arena")),
        }
    }

    pub fn peek_value(&self) -> Result<Value, VmError> {
        match self.entries.last() {
            Some(Entry::Value(v)) => Ok(v.clone()),
            _ => Err(corrupt("peek_value on non-value entry")),
        }
    }

    /// Insert `v` `depth` value entries back; everything skipped over must
    /// itself be a value. Used to rewrite a pending call's argument list.
    pub fn push_value_at_depth(&mut self, v: Value, depth: usize) -> Result<(), VmError> {
        let top = self.entries.len();
        if depth > top {
            return Err(corrupt("push_value_at_depth past arena bottom"));
        }
        let at = top - depth;
        for e in &self.entries[at..] {
            if !matches!(e, Entry::Value(_)) {
                return Err(corrupt("push_value_at_depth over non-value entry"));
            }
        }
        self.entries.insert(at, Entry::Value(v));
        Ok(())
    }

    /// Remove and return the value `depth` value entries back.
    pub fn pop_value_at_depth(&mut self, depth: usize) -> Result<Value, VmError> {
        let top = self.entries.len();
        if depth >= top {
            return Err(corrupt("pop_value_at_depth past arena bottom"));
        }
        let at = top - 1 - depth;
        match self.entries.get(at) {
            Some(Entry::Value(_)) => match self.entries.remove(at) {
                Entry::Value(v) => Ok(v),
                _ => unreachable!(),
            },
            _ => Err(corrupt("pop_value_at_depth on non-value entry")),
        }
    }

    pub fn swap(&mut self) -> Result<(), VmError> {
        let top = self.entries.len();
        if top < 2 {
            return Err(corrupt("swap on short arena"));
        }
        match (&self.entries[top - 1], &self.entries[top - 2]) {
            (Entry::Value(_), Entry::Value(_)) => {
                self.entries.swap(top - 1, top - 2);
                Ok(())
            }
            _ => Err(corrupt("swap on non-value entries")),
        }
    }

    pub fn push_pending_bind(&mut self, recv: Value, func: Value) {
        self.entries.push(Entry::PendingBind { recv, func });
    }

    /// Resolve the callable sitting `num_args` value entries back. A plain
    /// value is removed and returned; a pending bind is rewritten in place
    /// into its receiver (which becomes the first argument) and the bound
    /// function is returned with `true`.
    pub fn pop_callable(&mut self, num_args: usize) -> Result<(Value, bool), VmError> {
        let top = self.entries.len();
        if num_args >= top {
            return Err(corrupt("pop_callable past arena bottom"));
        }
        let at = top - 1 - num_args;
        for e in &self.entries[at + 1..] {
            if !matches!(e, Entry::Value(_)) {
                return Err(corrupt("pop_callable over non-value argument"));
            }
        }
        match &self.entries[at] {
            Entry::Value(_) => match self.entries.remove(at) {
                Entry::Value(v) => Ok((v, false)),
                _ => unreachable!(),
            },
            Entry::PendingBind { .. } => {
                let (recv, func) = match std::mem::replace(
                    &mut self.entries[at],
                    Entry::Value(wend_runtime::builtins::null()),
                ) {
                    Entry::PendingBind { recv, func } => (recv, func),
                    _ => unreachable!(),
                };
                self.entries[at] = Entry::Value(recv);
                Ok((func, true))
            }
            _ => Err(corrupt("pop_callable on non-callable entry")),
        }
    }

    // === Continuation frames ===

    /// Add a call activation, inserted below the top `num_args` argument
    /// values. When `as_generator` is set a generator frame is added
    /// immediately below the continuation frame (the two are only ever
    /// created together on the pumped-call path). Returns the continuation
    /// frame's index.
    pub fn add_continuation_frame(
        &mut self,
        func: Value,
        num_args: usize,
        closure: Closure,
        pc: Pc,
        resumption_pc: Option<Pc>,
        as_generator: bool,
    ) -> Result<usize, VmError> {
        let top = self.entries.len();
        if num_args > top {
            return Err(corrupt("add_continuation_frame past arena bottom"));
        }
        let at = top - num_args;
        for e in &self.entries[at..] {
            if !matches!(e, Entry::Value(_)) {
                return Err(corrupt("add_continuation_frame over non-value argument"));
            }
        }

        let mut prev_gfp = self.gfp;
        let mut cont_at = at;
        if as_generator {
            self.entries.insert(
                at,
                Entry::Generator(GeneratorFrame {
                    prev_gfp: self.gfp,
                    returned: false,
                    snapshot: Vec::new(),
                    snapshot_base: 0,
                    suspended_cfp: None,
                    suspended_ffp: None,
                    suspended_xfp: None,
                    suspended_gfp: None,
                    resumption_pc: None,
                }),
            );
            // The anchoring generator is the new frame's previous-gfp; the
            // consumer only sees it once this call suspends or returns.
            prev_gfp = Some(at);
            cont_at = at + 1;
        }

        self.entries.insert(
            cont_at,
            Entry::Continuation(ContinuationFrame {
                prev_cfp: self.cfp,
                prev_ffp: self.ffp,
                prev_xfp: self.xfp,
                prev_gfp,
                func,
                closure,
                pc,
                resumption_pc,
                returns_as_generator: as_generator,
            }),
        );

        self.cfp = Some(cont_at);
        self.ffp = None;
        self.xfp = None;
        self.gfp = None;
        Ok(cont_at)
    }

    /// Remove the current continuation frame, restoring all four frame
    /// pointers saved at its creation.
    pub fn remove_continuation_frame(&mut self) -> Result<(), VmError> {
        let at = self.cfp.ok_or_else(|| corrupt("no continuation frame"))?;
        let cf = match self.entries.get(at) {
            Some(Entry::Continuation(cf)) => cf.clone(),
            _ => return Err(corrupt("cfp does not index a continuation frame")),
        };
        self.entries.truncate(at);
        self.cfp = cf.prev_cfp;
        self.ffp = cf.prev_ffp;
        self.xfp = cf.prev_xfp;
        self.gfp = cf.prev_gfp;
        Ok(())
    }

    pub fn cont(&self, at: usize) -> Result<&ContinuationFrame, VmError> {
        match self.entries.get(at) {
            Some(Entry::Continuation(cf)) => Ok(cf),
            _ => Err(corrupt("expected continuation frame")),
        }
    }

    pub fn cont_mut(&mut self, at: usize) -> Result<&mut ContinuationFrame, VmError> {
        match self.entries.get_mut(at) {
            Some(Entry::Continuation(cf)) => Ok(cf),
            _ => Err(corrupt("expected continuation frame")),
        }
    }

    pub fn current_cont(&self) -> Result<&ContinuationFrame, VmError> {
        let at = self.cfp.ok_or_else(|| corrupt("no continuation frame"))?;
        self.cont(at)
    }

    pub fn current_cont_mut(&mut self) -> Result<&mut ContinuationFrame, VmError> {
        let at = self.cfp.ok_or_else(|| corrupt("no continuation frame"))?;
        self.cont_mut(at)
    }

    pub fn update_pc(&mut self, pc: Pc) -> Result<(), VmError> {
        self.current_cont_mut()?.pc = pc;
        Ok(())
    }

    // === Failure frames ===

    pub fn add_failure_frame(&mut self, fail_to: Pc) {
        let at = self.entries.len();
        self.entries.push(Entry::Failure(FailureFrame {
            prev_ffp: self.ffp,
            prev_gfp: self.gfp,
            is_fail_up: false,
            fail_to: Some(fail_to),
        }));
        self.ffp = Some(at);
        self.gfp = None;
    }

    pub fn add_fail_up_frame(&mut self) {
        let at = self.entries.len();
        self.entries.push(Entry::Failure(FailureFrame {
            prev_ffp: self.ffp,
            prev_gfp: self.gfp,
            is_fail_up: true,
            fail_to: None,
        }));
        self.ffp = Some(at);
        self.gfp = None;
    }

    /// `(is_fail_up, fail_to)` of the nearest failure frame. A missing
    /// frame means the bootstrap frame is gone: fatal.
    pub fn read_failure_frame(&self) -> Result<(bool, Option<Pc>), VmError> {
        let at = self.ffp.ok_or(VmError::NoFailureFrame)?;
        match self.entries.get(at) {
            Some(Entry::Failure(ff)) => Ok((ff.is_fail_up, ff.fail_to.clone())),
            _ => Err(corrupt("ffp does not index a failure frame")),
        }
    }

    pub fn has_failure_frame(&self) -> bool {
        self.ffp.is_some()
    }

    pub fn remove_failure_frame(&mut self) -> Result<(), VmError> {
        let at = self.ffp.ok_or(VmError::NoFailureFrame)?;
        let ff = match self.entries.get(at) {
            Some(Entry::Failure(ff)) => ff.clone(),
            _ => return Err(corrupt("ffp does not index a failure frame")),
        };
        self.entries.truncate(at);
        self.ffp = ff.prev_ffp;
        self.gfp = ff.prev_gfp;
        Ok(())
    }

    // === Exception frames ===

    /// Install a handler scope. Unlike failure frames this leaves `ffp` and
    /// `gfp` in place; they are restored when the frame is removed so a
    /// handler resumes with its static scope's pointers.
    pub fn add_exception_frame(&mut self, handler_pc: Pc) {
        let at = self.entries.len();
        self.entries.push(Entry::Exception(ExceptionFrame {
            prev_ffp: self.ffp,
            prev_gfp: self.gfp,
            prev_xfp: self.xfp,
            handler_pc,
        }));
        self.xfp = Some(at);
    }

    pub fn read_exception_frame(&self) -> Result<Option<Pc>, VmError> {
        let Some(at) = self.xfp else {
            return Ok(None);
        };
        match self.entries.get(at) {
            Some(Entry::Exception(xf)) => Ok(Some(xf.handler_pc.clone())),
            _ => Err(corrupt("xfp does not index an exception frame")),
        }
    }

    pub fn remove_exception_frame(&mut self) -> Result<(), VmError> {
        let at = self.xfp.ok_or_else(|| corrupt("no exception frame"))?;
        let xf = match self.entries.get(at) {
            Some(Entry::Exception(xf)) => xf.clone(),
            _ => return Err(corrupt("xfp does not index an exception frame")),
        };
        self.entries.truncate(at);
        self.ffp = xf.prev_ffp;
        self.gfp = xf.prev_gfp;
        self.xfp = xf.prev_xfp;
        Ok(())
    }

    // === Generator frames ===

    pub fn gen(&self, at: usize) -> Result<&GeneratorFrame, VmError> {
        match self.entries.get(at) {
            Some(Entry::Generator(gf)) => Ok(gf),
            _ => Err(corrupt("expected generator frame")),
        }
    }

    pub fn gen_mut(&mut self, at: usize) -> Result<&mut GeneratorFrame, VmError> {
        match self.entries.get_mut(at) {
            Some(Entry::Generator(gf)) => Ok(gf),
            _ => Err(corrupt("expected generator frame")),
        }
    }

    pub fn eyield(&self, at: usize) -> Result<&EYieldFrame, VmError> {
        match self.entries.get(at) {
            Some(Entry::EYield(ef)) => Ok(ef),
            _ => Err(corrupt("expected eyield frame")),
        }
    }

    pub fn is_eyield_gen(&self, at: usize) -> Result<bool, VmError> {
        match self.entries.get(at) {
            Some(Entry::Generator(_)) => Ok(false),
            Some(Entry::EYield(_)) => Ok(true),
            _ => Err(corrupt("gfp does not index a generator frame")),
        }
    }

    /// Install an eyield anchor at the top, then duplicate the consumer's
    /// pending operand values above it (they will be consumed destructively;
    /// the originals below survive for the next resumption).
    pub fn add_eyield_frame(&mut self, resumption_pc: Pc) {
        let at = self.entries.len();
        self.entries.push(Entry::EYield(EYieldFrame {
            prev_gfp: self.gfp,
            resumption_pc,
        }));
        let prev_gfp = self.gfp;
        self.gfp = Some(at);
        self.dup_pending_operands(prev_gfp, at);
    }

    /// Clone the value entries between the highest enclosing frame and the
    /// generator frame at `gen_at` onto the top of the arena.
    pub fn dup_pending_operands(&mut self, gen_prev_gfp: Option<usize>, gen_at: usize) {
        let start = [gen_prev_gfp, self.cfp, self.ffp, self.xfp]
            .into_iter()
            .flatten()
            .max()
            .map(|i| i + 1)
            .unwrap_or(0);
        let copies: Vec<Entry> = self.entries[start..gen_at].to_vec();
        self.entries.extend(copies);
    }

    /// Remove the generator frame at `gfp` (normal or eyield). If a normal
    /// frame still holds a suspended snapshot, cfp/ffp/xfp are restored
    /// from the snapshot's continuation frame for bookkeeping integrity.
    pub fn remove_generator_frame(&mut self) -> Result<(), VmError> {
        let at = self.gfp.ok_or_else(|| corrupt("no generator frame"))?;
        match self.entries.get(at) {
            Some(Entry::Generator(gf)) => {
                let prev_gfp = gf.prev_gfp;
                if let Some(Entry::Continuation(cf)) = gf.snapshot.first() {
                    self.cfp = cf.prev_cfp;
                    self.ffp = cf.prev_ffp;
                    self.xfp = cf.prev_xfp;
                }
                self.entries.truncate(at);
                self.gfp = prev_gfp;
                Ok(())
            }
            Some(Entry::EYield(ef)) => {
                let prev_gfp = ef.prev_gfp;
                self.entries.truncate(at);
                self.gfp = prev_gfp;
                Ok(())
            }
            _ => Err(corrupt("gfp does not index a generator frame")),
        }
    }

    // === Suspension primitives (used by the suspension engine) ===

    /// Split off every entry from `at` (inclusive) to the top.
    pub fn excise_from(&mut self, at: usize) -> Vec<Entry> {
        self.entries.split_off(at)
    }

    /// Drop every entry above `at`.
    pub fn truncate_above(&mut self, at: usize) {
        self.entries.truncate(at + 1);
    }

    /// Append a previously excised slice back onto the arena. `base` is the
    /// index the slice was excised from; if the splice lands at a different
    /// absolute offset every index link at or above `base` is rebased.
    pub fn splice_top(&mut self, mut slice: Vec<Entry>, base: usize) -> isize {
        let delta = self.entries.len() as isize - base as isize;
        if delta != 0 {
            rebase_links(&mut slice, base, delta);
        }
        self.entries.extend(slice);
        delta
    }
}

/// Shift every frame-pointer link `>= base` by `delta`. Links below `base`
/// point at entries that did not move.
pub fn rebase_links(entries: &mut [Entry], base: usize, delta: isize) {
    let adjust = |link: &mut Option<usize>| {
        if let Some(i) = link {
            if *i >= base {
                *link = Some((*i as isize + delta) as usize);
            }
        }
    };
    for e in entries {
        match e {
            Entry::Continuation(cf) => {
                adjust(&mut cf.prev_cfp);
                adjust(&mut cf.prev_ffp);
                adjust(&mut cf.prev_xfp);
                adjust(&mut cf.prev_gfp);
            }
            Entry::Failure(ff) => {
                adjust(&mut ff.prev_ffp);
                adjust(&mut ff.prev_gfp);
            }
            Entry::Exception(xf) => {
                adjust(&mut xf.prev_ffp);
                adjust(&mut xf.prev_gfp);
                adjust(&mut xf.prev_xfp);
            }
            Entry::Generator(gf) => {
                adjust(&mut gf.prev_gfp);
                adjust(&mut gf.suspended_cfp);
                adjust(&mut gf.suspended_ffp);
                adjust(&mut gf.suspended_xfp);
                adjust(&mut gf.suspended_gfp);
            }
            Entry::EYield(ef) => {
                adjust(&mut ef.prev_gfp);
            }
            Entry::Value(_) | Entry::PendingBind { .. } => {}
        }
    }
}
