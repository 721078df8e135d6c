//! The generator suspension engine.
//!
//! A call invoked in pumped mode can deliver a lazy sequence of values: the
//! first pump runs it like an ordinary call, and each yield suspends the
//! call's entire live state (its continuation frame and everything pushed
//! after it) into the anchoring generator frame's snapshot. Resuming
//! splices the snapshot back and continues at the suspended PC. Because
//! bytecode activations live on the arena rather than the native stack,
//! suspension is a pair of `Vec` moves; no native stack memory is captured.
//!
//! Suspension points are the pumped function's own `Yield` opcodes. A
//! native frame can never sit between a generator and its yield, so native
//! functions are single-shot: they return, fail, or raise.
//!
//! Abandoning a suspended generator needs no cancellation step: the frame
//! and its snapshot are dropped when an enclosing failure frame is removed,
//! and explicit removal restores the consumer's frame pointers from the
//! snapshot's continuation frame.

use wend_runtime::{builtins, value, Closure, Value};

use crate::vm::types::{Answer, LoopExit, VmError};
use crate::vm::WendThread;

impl WendThread {
    /// Arrange for `callee` to be pumped: its generator and continuation
    /// frames are added but nothing runs until the first [`pump`].
    ///
    /// [`pump`]: WendThread::pump
    pub fn pre_apply_pump(&mut self, callee: Value, args: Vec<Value>) -> Result<(), VmError> {
        let Some(f) = value::as_func(&callee).cloned() else {
            return Err(VmError::CorruptStack("pump of a non-function value"));
        };
        let n = args.len();
        let mut s = self.stack.lock();
        for a in args {
            s.push_value(a);
        }
        let cl = Closure::new(f.num_vars as usize, f.container.clone());
        s.add_continuation_frame(callee, n, cl, f.pc.clone(), None, true)?;
        s.push_value(value::int(n as i64));
        Ok(())
    }

    /// Pump the most recent generator for its next value. `Answer::Fail`
    /// means the generator is exhausted.
    ///
    /// With `remove_finished` set, the generator frame is removed as soon
    /// as the call is known to be done; otherwise exhaustion is reported on
    /// the pump after the final value.
    pub fn pump(&mut self, remove_finished: bool) -> Result<Answer, VmError> {
        // Either the pumped call has not started (its fresh frame is
        // current and no generator is visible in this segment), or a
        // suspended generator is anchored at gfp.
        let first = self.stack.lock().gfp.is_none();
        if first {
            let barrier = {
                let s = self.stack.lock();
                s.cfp.ok_or(VmError::CorruptStack("pump with no pumped frame"))?
            };
            let exit = self.run_loop(barrier)?;
            self.finish_pump(exit, remove_finished)
        } else {
            let gen_at = {
                let mut s = self.stack.lock();
                let gen_at = s
                    .gfp
                    .ok_or(VmError::CorruptStack("pump with no generator frame"))?;
                if s.is_eyield_gen(gen_at)? {
                    return Err(VmError::CorruptStack("pump of an eyield frame"));
                }
                if s.gen(gen_at)?.returned {
                    s.remove_generator_frame()?;
                    return Ok(Answer::Fail);
                }
                gen_at
            };
            self.resume_generator()?;
            // The barrier is the pumped call's own continuation frame,
            // which the splice lands immediately above the generator frame.
            // The restored cfp may be deeper when the snapshot carries a
            // nested suspended call.
            let exit = self.run_loop(gen_at + 1)?;
            self.finish_pump(exit, remove_finished)
        }
    }

    fn finish_pump(&mut self, exit: LoopExit, remove_finished: bool) -> Result<Answer, VmError> {
        match exit {
            LoopExit::Yielded => {
                let v = self.stack.lock().pop_value()?;
                if builtins::is_fail(&v) {
                    self.stack.lock().remove_generator_frame()?;
                    Ok(Answer::Fail)
                } else {
                    Ok(Answer::Value(v))
                }
            }
            LoopExit::Returned(v) => {
                let mut s = self.stack.lock();
                s.remove_continuation_frame()?;
                let mut removed = false;
                if remove_finished {
                    s.remove_generator_frame()?;
                    removed = true;
                } else {
                    let gen_at = s
                        .gfp
                        .ok_or(VmError::CorruptStack("pumped frame without generator"))?;
                    s.gen_mut(gen_at)?.returned = true;
                }
                if builtins::is_fail(&v) {
                    if !removed {
                        s.remove_generator_frame()?;
                    }
                    Ok(Answer::Fail)
                } else {
                    Ok(Answer::Value(v))
                }
            }
            LoopExit::Raised(exc) => Ok(Answer::Raise(exc)),
        }
    }

    /// Yield protocol: the current (pumped) frame suspends, handing
    /// `yielded` to its consumer.
    pub(crate) fn suspend_current(
        &mut self,
        yielded: Value,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        let mut s = self.stack.lock();
        let at = s
            .cfp
            .ok_or(VmError::CorruptStack("yield with no current frame"))?;
        let yielding_is_barrier = at == barrier;
        let cf = s.current_cont()?.clone();
        let gen_at = cf
            .prev_gfp
            .ok_or(VmError::CorruptStack("yield in frame with no generator anchor"))?;

        // Record the suspension-time frame pointers, then excise the
        // generator's live slice (the continuation frame and everything
        // above it) into the snapshot.
        let (sus_cfp, sus_ffp, sus_xfp, sus_gfp) = (s.cfp, s.ffp, s.xfp, s.gfp);
        let snapshot = s.excise_from(at);
        self.vm
            .heap
            .note_alloc(snapshot.len() * std::mem::size_of::<crate::frame::Entry>());
        {
            let gf = s.gen_mut(gen_at)?;
            gf.snapshot = snapshot;
            gf.snapshot_base = at;
            gf.suspended_cfp = sus_cfp;
            gf.suspended_ffp = sus_ffp;
            gf.suspended_xfp = sus_xfp;
            gf.suspended_gfp = sus_gfp;
            gf.resumption_pc = cf.resumption_pc.clone();
        }

        // Back to the consumer's scope. Its gfp is the generator frame.
        s.cfp = cf.prev_cfp;
        s.ffp = cf.prev_ffp;
        s.xfp = cf.prev_xfp;
        s.gfp = cf.prev_gfp;

        // Operands the consumer produced before the call survive below the
        // generator frame; clone them above it for destructive consumption.
        let prev_gfp = s.gen(gen_at)?.prev_gfp;
        s.dup_pending_operands(prev_gfp, gen_at);
        s.push_value(yielded);

        if yielding_is_barrier {
            // the pumping caller sits outside this loop activation
            return Ok(Some(LoopExit::Yielded));
        }
        let resume = s
            .gen(gen_at)?
            .resumption_pc
            .clone()
            .ok_or(VmError::CorruptStack("inline yield without resumption pc"))?;
        s.update_pc(resume)?;
        Ok(None)
    }

    /// Resume protocol: drop the consumed operand copies above the
    /// generator frame, splice the snapshot back (rebasing index links if
    /// the slice lands at a different absolute offset), and restore the
    /// suspended frame pointers. The next loop iteration continues at the
    /// suspended frame's PC.
    pub(crate) fn resume_generator(&mut self) -> Result<(), VmError> {
        let mut s = self.stack.lock();
        let gen_at = s
            .gfp
            .ok_or(VmError::CorruptStack("resume with no generator frame"))?;
        s.truncate_above(gen_at);
        let (snapshot, base, fps) = {
            let gf = s.gen_mut(gen_at)?;
            (
                std::mem::take(&mut gf.snapshot),
                gf.snapshot_base,
                (
                    gf.suspended_cfp,
                    gf.suspended_ffp,
                    gf.suspended_xfp,
                    gf.suspended_gfp,
                ),
            )
        };
        if snapshot.is_empty() {
            return Err(VmError::CorruptStack("resume of an unsuspended generator"));
        }
        let delta = s.splice_top(snapshot, base);
        let adj = |link: Option<usize>| {
            link.map(|i| {
                if i >= base {
                    (i as isize + delta) as usize
                } else {
                    i
                }
            })
        };
        s.cfp = adj(fps.0);
        s.ffp = adj(fps.1);
        s.xfp = adj(fps.2);
        s.gfp = adj(fps.3);
        Ok(())
    }
}
