//! Failure and exception propagation.
//!
//! Failure is the hosted language's first-class "no value" signal: it walks
//! the failure-frame list, possibly resuming a generator for an alternative
//! value. Exceptions are raised values: they unwind continuation frames,
//! accumulating a call chain for diagnostics, until a handler scope is
//! found. Both are always resolved by some frame; an unmatched signal is
//! promoted to a fatal error.

use wend_runtime::{exception, value, Value};

use crate::vm::types::{LoopExit, VmError};
use crate::vm::WendThread;

impl WendThread {
    /// The failure transfer: search the failure-frame list for somewhere to
    /// continue. Returns `Ok(None)` when control has been transferred
    /// inside the current loop activation.
    pub(crate) fn fail_now(&mut self, barrier: usize) -> Result<Option<LoopExit>, VmError> {
        loop {
            let mut s = self.stack.lock();
            let (is_fail_up, fail_to) = s.read_failure_frame()?;

            if !is_fail_up {
                // a plain choice point: take its branch
                s.remove_failure_frame()?;
                let to = fail_to
                    .ok_or(VmError::CorruptStack("plain failure frame without target"))?;
                s.update_pc(to)?;
                return Ok(None);
            }

            let Some(gen_at) = s.gfp else {
                // failure propagates past this fail-up point entirely
                s.remove_failure_frame()?;
                continue;
            };

            if s.is_eyield_gen(gen_at)? {
                // try the next literal alternative inline
                let resume = s.eyield(gen_at)?.resumption_pc.clone();
                s.remove_generator_frame()?;
                s.update_pc(resume)?;
                log::trace!("failure resumed eyield alternative");
                return Ok(None);
            }

            if s.gen(gen_at)?.returned {
                // exhausted: continue the search at the next-outer frame
                s.remove_generator_frame()?;
                continue;
            }

            // A suspended generator can supply an alternative value: splice
            // it back in and let the loop run it. Its next yield delivers
            // the value and resumes the consumer; its return re-enters this
            // search via the return protocol.
            drop(s);
            log::trace!("failure resuming suspended generator");
            self.resume_generator()?;
            return Ok(None);
        }
    }

    /// The raise transfer: unwind continuation frames, extending `exc`'s
    /// call chain, until a handler scope is found. Returns
    /// `Some(LoopExit::Raised)` when the walk crosses this activation's
    /// barrier frame, so the native caller can continue it.
    pub(crate) fn propagate_exception(
        &mut self,
        exc: Value,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        // raising a non-exception value is itself a type error
        let exc = if exception::is_exception(&exc) {
            exc
        } else {
            exception::new(
                "Type_Exception",
                &format!("raise of non-exception value {}", value::to_str(&exc)),
            )
        };

        loop {
            let frame = {
                let s = self.stack.lock();
                match s.cfp {
                    Some(at) => {
                        let cf = s.cont(at)?;
                        Some((at, cf.func.clone(), cf.pc.clone()))
                    }
                    None => None,
                }
            };

            let Some((at, func, pc)) = frame else {
                // Unwound the whole arena with no handler. Every thread is
                // expected to install a top-level handler at startup, so
                // this is a runtime bug or a broken bootstrap.
                let bt = exception::render_backtrace(&exc);
                log::error!("{}", bt);
                return Err(VmError::UncaughtException(bt));
            };

            // chain entries are appended outside the arena lock
            exception::push_chain_entry(&exc, func, pc);

            let mut s = self.stack.lock();
            if let Some(handler_pc) = s.read_exception_frame()? {
                // Handler found: the chain is complete. Store the exception
                // as the thread's current exception, drop the handler
                // scope, and enter the handler, which catches by taking
                // the slot and receiving the value on the stack.
                log::debug!(
                    "exception caught by handler at {}",
                    handler_pc.describe()
                );
                self.current_exception = Some(exc);
                s.remove_exception_frame()?;
                s.update_pc(handler_pc)?;
                let e = self
                    .current_exception
                    .take()
                    .ok_or(VmError::CorruptStack("current exception vanished"))?;
                s.push_value(e);
                return Ok(None);
            }

            s.remove_continuation_frame()?;
            if at == barrier {
                // hand the walk to the native caller of this activation
                return Ok(Some(LoopExit::Raised(exc)));
            }
        }
    }
}
