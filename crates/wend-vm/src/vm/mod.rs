//! The interpreter: shared VM state, per-thread execution state, and the
//! trampolined dispatch loop.
//!
//! Applying a bytecode function pushes a continuation frame onto the arena
//! and continues the same loop; only native functions run on the Rust call
//! stack. That keeps every suspendable activation inside the arena, which
//! is what lets the suspension engine excise and replay call state without
//! touching native stack memory.

pub mod types;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use wend_common_core::bytecode::{Module, NativeId, Pc};
use wend_common_core::instruction::{Instruction, Opcode};
use wend_runtime::{builtins, exception, value, Closure, Heap, Value};

use crate::frame::Arena;
use types::{Answer, LoopExit, VmError, POLL_INTERVAL};

/// A native function: runs to completion, producing a value, a failure, or
/// a raised exception. Natives never suspend.
pub type NativeFn = fn(&mut WendThread) -> Result<Answer, VmError>;

/// State shared by every thread of one VM instance.
pub struct Vm {
    pub heap: Heap,
    natives: RwLock<Vec<NativeFn>>,
}

impl Vm {
    pub fn new() -> Arc<Self> {
        Arc::new(Vm {
            heap: Heap::new(),
            natives: RwLock::new(Vec::new()),
        })
    }

    /// Register a native function and wrap it as a callable value.
    pub fn register_native(&self, name: &str, f: NativeFn) -> Value {
        let id = {
            let mut natives = self.natives.write();
            natives.push(f);
            (natives.len() - 1) as NativeId
        };
        value::func(wend_runtime::Func {
            name: name.to_string(),
            is_bound: false,
            pc: Pc::Native(id),
            num_params: 0,
            num_vars: 0,
            container: None,
        })
    }

    fn native(&self, id: NativeId) -> Result<NativeFn, VmError> {
        self.natives
            .read()
            .get(id as usize)
            .copied()
            .ok_or(VmError::UnknownNative(id))
    }

    /// Create the execution state for one hosted thread.
    pub fn spawn_thread(self: &Arc<Self>) -> WendThread {
        WendThread {
            vm: self.clone(),
            stack: Arc::new(Mutex::new(Arena::new())),
            current_exception: None,
            poll_countdown: POLL_INTERVAL,
        }
    }
}

/// Per-thread execution state: the frame arena and the current-exception
/// slot. One per hosted thread; the arena is shared behind its mutex so
/// the collector can walk it from outside.
pub struct WendThread {
    pub(crate) vm: Arc<Vm>,
    pub(crate) stack: Arc<Mutex<Arena>>,
    pub(crate) current_exception: Option<Value>,
    poll_countdown: u32,
}

impl WendThread {
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Clone a handle to the arena, e.g. for collector root scanning.
    pub fn stack_handle(&self) -> Arc<Mutex<Arena>> {
        self.stack.clone()
    }

    /// The last raised exception, for native code that wants to inspect it
    /// outside the `Answer::Raise` path.
    pub fn take_current_exception(&mut self) -> Option<Value> {
        self.current_exception.take()
    }

    // === Host/native entry points ===

    /// Apply `callee` to `args` as an ordinary call. `Answer::Fail` when
    /// the callee produced no value.
    pub fn apply(&mut self, callee: Value, args: Vec<Value>) -> Result<Answer, VmError> {
        let Some(f) = value::as_func(&callee).cloned() else {
            return Ok(Answer::Raise(exception::new(
                "Apply_Exception",
                &format!("cannot apply {}", value::to_str(&callee)),
            )));
        };
        let n = args.len();
        let barrier = {
            let mut s = self.stack.lock();
            for a in args {
                s.push_value(a);
            }
            let cl = Closure::new(f.num_vars as usize, f.container.clone());
            let at = s.add_continuation_frame(callee.clone(), n, cl, f.pc.clone(), None, false)?;
            s.push_value(value::int(n as i64));
            at
        };
        match self.run_loop(barrier)? {
            LoopExit::Returned(v) => {
                self.stack.lock().remove_continuation_frame()?;
                if builtins::is_fail(&v) {
                    Ok(Answer::Fail)
                } else {
                    Ok(Answer::Value(v))
                }
            }
            LoopExit::Raised(exc) => Ok(Answer::Raise(exc)),
            LoopExit::Yielded => Err(VmError::CorruptStack("plain apply yielded")),
        }
    }

    /// Look up `name` on `obj` and apply it, binding the receiver as the
    /// first argument when the slot holds a bound function.
    pub fn get_slot_apply(
        &mut self,
        obj: &Value,
        name: &str,
        mut args: Vec<Value>,
    ) -> Result<Answer, VmError> {
        let Some(fv) = obj.get_slot(name) else {
            return Ok(Answer::Raise(exception::new(
                "Slot_Exception",
                &format!("no slot '{}'", name),
            )));
        };
        if value::as_func(&fv).map_or(false, |f| f.is_bound) {
            args.insert(0, obj.clone());
        }
        self.apply(fv, args)
    }

    /// Pop a native callee's arguments off the arena, in call order.
    pub fn native_args(&mut self) -> Result<Vec<Value>, VmError> {
        let mut s = self.stack.lock();
        let n = value::as_int(&s.pop_value()?)
            .ok_or(VmError::CorruptStack("argument count is not an int"))?
            as usize;
        let mut args = Vec::with_capacity(n);
        for _ in 0..n {
            args.push(s.pop_value()?);
        }
        args.reverse();
        Ok(args)
    }

    // === The dispatch loop ===

    /// Run until the continuation frame at `barrier` returns, suspends, or
    /// an exception unwinds past it.
    pub(crate) fn run_loop(&mut self, barrier: usize) -> Result<LoopExit, VmError> {
        loop {
            if let Some(exit) = self.poll(barrier)? {
                return Ok(exit);
            }
            let pc = {
                let s = self.stack.lock();
                s.current_cont()?.pc.clone()
            };
            let flow = match pc {
                Pc::Native(id) => {
                    let f = self.vm.native(id)?;
                    match f(self)? {
                        Answer::Value(v) => self.return_protocol(v, barrier)?,
                        Answer::Fail => self.return_protocol(builtins::fail(), barrier)?,
                        Answer::Raise(exc) => self.propagate_exception(exc, barrier)?,
                    }
                }
                Pc::Bytecode { module, off } => {
                    let inst = module.instr(off).ok_or_else(|| VmError::InvalidInstruction {
                        module: module.name.clone(),
                        off,
                    })?;
                    log::trace!("{}@{}: {:?}", module.name, off, inst.opcode());
                    self.dispatch(&module, off, inst, barrier)?
                }
            };
            if let Some(exit) = flow {
                return Ok(exit);
            }
        }
    }

    /// Periodic collector checkpoint + pending-interrupt check; runs
    /// without the arena lock held.
    fn poll(&mut self, barrier: usize) -> Result<Option<LoopExit>, VmError> {
        self.poll_countdown -= 1;
        if self.poll_countdown > 0 {
            return Ok(None);
        }
        self.poll_countdown = POLL_INTERVAL;
        if self.vm.heap.checkpoint() {
            return self.raise_hosted("Signal_Exception", "interrupt", barrier);
        }
        Ok(None)
    }

    pub(crate) fn raise_hosted(
        &mut self,
        name: &str,
        msg: &str,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        self.propagate_exception(exception::new(name, msg), barrier)
    }

    fn bad(module: &Module, off: usize, what: &'static str) -> VmError {
        VmError::BadOperand {
            module: module.name.clone(),
            off,
            what,
        }
    }

    /// Advance the current frame's PC to `off + delta` within `module`.
    fn advance(&mut self, module: &Arc<Module>, off: usize, delta: i64) -> Result<(), VmError> {
        let new_off = (off as i64 + delta) as usize;
        self.stack
            .lock()
            .update_pc(Pc::bytecode(module.clone(), new_off))
    }

    fn dispatch(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        inst: Instruction,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        match inst.opcode() {
            Opcode::Nop => {
                self.advance(module, off, 1)?;
                Ok(None)
            }

            // === Stack shuffling ===
            Opcode::Dup => {
                {
                    let mut s = self.stack.lock();
                    let v = s.peek_value()?;
                    s.push_value(v);
                }
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::Pull => {
                {
                    let mut s = self.stack.lock();
                    let v = s.pop_value_at_depth(inst.a as usize)?;
                    s.push_value(v);
                }
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::Pop => {
                self.stack.lock().pop_value()?;
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::Swap => {
                self.stack.lock().swap()?;
                self.advance(module, off, 1)?;
                Ok(None)
            }

            // === Literals ===
            Opcode::Int => {
                self.stack.lock().push_value(value::int(inst.imm32() as i64));
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::Float => {
                let f = module
                    .float(inst.a as usize)
                    .ok_or_else(|| Self::bad(module, off, "float pool index"))?;
                self.stack.lock().push_value(value::float(f));
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::Str => {
                let s = module
                    .string(inst.a as usize)
                    .ok_or_else(|| Self::bad(module, off, "string pool index"))?
                    .to_string();
                self.stack.lock().push_value(value::string(&s));
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::List => {
                let n = inst.a as usize;
                {
                    let mut s = self.stack.lock();
                    let mut elems = Vec::with_capacity(n);
                    for _ in 0..n {
                        elems.push(s.pop_value()?);
                    }
                    elems.reverse();
                    s.push_value(value::list(elems));
                }
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::Dict => self.op_dict(module, off, inst.a as usize, barrier),
            Opcode::Set => self.op_set(module, off, inst.a as usize, barrier),
            Opcode::BuiltinLookup => {
                let b = builtins::by_id(inst.a)
                    .ok_or_else(|| Self::bad(module, off, "builtin id"))?;
                self.stack.lock().push_value(b);
                self.advance(module, off, 1)?;
                Ok(None)
            }

            // === Slots ===
            Opcode::SlotLookup => {
                let name = module
                    .string(inst.a as usize)
                    .ok_or_else(|| Self::bad(module, off, "slot name index"))?
                    .to_string();
                let obj = self.stack.lock().pop_value()?;
                match obj.get_slot(&name) {
                    Some(v) => {
                        self.stack.lock().push_value(v);
                        self.advance(module, off, 1)?;
                        Ok(None)
                    }
                    None => self.raise_hosted(
                        "Slot_Exception",
                        &format!("no slot '{}'", name),
                        barrier,
                    ),
                }
            }
            Opcode::AssignSlot => {
                let name = module
                    .string(inst.a as usize)
                    .ok_or_else(|| Self::bad(module, off, "slot name index"))?
                    .to_string();
                let (assignee, val) = {
                    let mut s = self.stack.lock();
                    let assignee = s.pop_value()?;
                    let val = s.pop_value()?;
                    (assignee, val)
                };
                assignee.set_slot(&name, val.clone());
                self.stack.lock().push_value(val);
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::PreSlotLookupApply => {
                let name = module
                    .string(inst.a as usize)
                    .ok_or_else(|| Self::bad(module, off, "slot name index"))?
                    .to_string();
                let obj = self.stack.lock().pop_value()?;
                let Some(v) = obj.get_slot(&name) else {
                    return self.raise_hosted(
                        "Slot_Exception",
                        &format!("no slot '{}'", name),
                        barrier,
                    );
                };
                {
                    let mut s = self.stack.lock();
                    // Binding is deferred: only a bound function needs its
                    // receiver carried along.
                    if value::as_func(&v).map_or(false, |f| f.is_bound) {
                        s.push_pending_bind(obj, v);
                    } else {
                        s.push_value(v);
                    }
                }
                self.advance(module, off, 1)?;
                Ok(None)
            }

            // === Closure variables ===
            Opcode::VarLookup => {
                let closure = self.stack.lock().current_cont()?.closure.clone();
                match closure.get_var(inst.a as usize, inst.b as usize) {
                    Some(v) => {
                        self.stack.lock().push_value(v);
                        self.advance(module, off, 1)?;
                        Ok(None)
                    }
                    None => self.raise_hosted(
                        "Unassigned_Var_Exception",
                        "variable read before assignment",
                        barrier,
                    ),
                }
            }
            Opcode::VarAssign => {
                let (closure, v) = {
                    let s = self.stack.lock();
                    (s.current_cont()?.closure.clone(), s.peek_value()?)
                };
                if !closure.set_var(inst.a as usize, inst.b as usize, v) {
                    return Err(Self::bad(module, off, "variable address"));
                }
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::IsAssigned => {
                let closure = self.stack.lock().current_cont()?.closure.clone();
                let delta = if closure.is_assigned(inst.a as usize, inst.b as usize) {
                    inst.c as i16 as i64
                } else {
                    1
                };
                self.advance(module, off, delta)?;
                Ok(None)
            }

            // === Functions ===
            Opcode::FuncDefn => {
                let name = module
                    .string(inst.c as usize)
                    .ok_or_else(|| Self::bad(module, off, "function name index"))?
                    .to_string();
                let container = self.stack.lock().current_cont()?.closure.clone();
                let f = value::func(wend_runtime::Func {
                    name,
                    is_bound: inst.flags & 1 != 0,
                    pc: Pc::bytecode(module.clone(), off + 2),
                    num_params: inst.a,
                    num_vars: inst.b,
                    container: Some(container),
                });
                self.stack.lock().push_value(f);
                // next instruction is the branch over the body
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::Apply => self.op_apply(module, off, inst.a as usize, barrier),
            Opcode::UnpackArgs => self.op_unpack_args(
                module,
                off,
                inst.a as usize,
                inst.flags & 1 != 0,
                barrier,
            ),
            Opcode::UnpackAssign => self.op_unpack_assign(module, off, inst.a as usize, barrier),
            Opcode::Return => {
                let v = self.stack.lock().pop_value()?;
                self.return_protocol(v, barrier)
            }
            Opcode::Yield => self.op_yield(module, off, barrier),
            Opcode::EYield => self.op_eyield(module, off, barrier),

            // === Comparison / arithmetic ===
            Opcode::Eq | Opcode::Neq | Opcode::Lt | Opcode::LtEq | Opcode::Gt | Opcode::GtEq => {
                self.op_cmp(module, off, inst.opcode(), barrier)
            }
            Opcode::Is => {
                let (rhs, lhs) = {
                    let mut s = self.stack.lock();
                    let rhs = s.pop_value()?;
                    let lhs = s.pop_value()?;
                    (rhs, lhs)
                };
                if value::is_same(&lhs, &rhs) {
                    self.stack.lock().push_value(rhs);
                    self.advance(module, off, 1)?;
                    Ok(None)
                } else {
                    self.fail_now(barrier)
                }
            }
            Opcode::Add | Opcode::Sub => {
                let (rhs, lhs) = {
                    let mut s = self.stack.lock();
                    let rhs = s.pop_value()?;
                    let lhs = s.pop_value()?;
                    (rhs, lhs)
                };
                let out = if inst.opcode() == Opcode::Add {
                    value::add(&lhs, &rhs)
                } else {
                    value::sub(&lhs, &rhs)
                };
                match out {
                    Some(v) => {
                        self.stack.lock().push_value(v);
                        self.advance(module, off, 1)?;
                        Ok(None)
                    }
                    // undefined operand pairings take the failure path
                    None => self.fail_now(barrier),
                }
            }

            // === Control ===
            Opcode::Branch => {
                self.advance(module, off, inst.imm32() as i64)?;
                Ok(None)
            }
            Opcode::BranchIfFail => {
                let v = self.stack.lock().pop_value()?;
                let delta = if builtins::is_fail(&v) {
                    inst.imm32() as i64
                } else {
                    1
                };
                self.advance(module, off, delta)?;
                Ok(None)
            }
            Opcode::BranchIfNotFail => {
                let v = self.stack.lock().pop_value()?;
                let delta = if builtins::is_fail(&v) {
                    1
                } else {
                    inst.imm32() as i64
                };
                self.advance(module, off, delta)?;
                Ok(None)
            }
            Opcode::AddFailureFrame => {
                let target = (off as i64 + inst.imm32() as i64) as usize;
                self.stack
                    .lock()
                    .add_failure_frame(Pc::bytecode(module.clone(), target));
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::AddFailUpFrame => {
                self.stack.lock().add_fail_up_frame();
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::RemoveFailureFrame => {
                self.stack.lock().remove_failure_frame()?;
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::FailNow => self.fail_now(barrier),
            Opcode::AddExceptionFrame => {
                let target = (off as i64 + inst.imm32() as i64) as usize;
                self.stack
                    .lock()
                    .add_exception_frame(Pc::bytecode(module.clone(), target));
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::RemoveExceptionFrame => {
                self.stack.lock().remove_exception_frame()?;
                self.advance(module, off, 1)?;
                Ok(None)
            }
            Opcode::Raise => {
                // the pc is left at the raise site so the call chain
                // records where the raise happened
                let v = self.stack.lock().pop_value()?;
                self.propagate_exception(v, barrier)
            }

            Opcode::Invalid => Err(VmError::InvalidInstruction {
                module: module.name.clone(),
                off,
            }),
        }
    }

    // === Multi-step opcodes ===

    fn op_apply(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        mut num_args: usize,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        // Only a call under a fail-up frame can ever be resumed as a
        // generator, so only then do we pay for the pumping arrangement.
        let is_fail_up = {
            let s = self.stack.lock();
            s.has_failure_frame() && s.read_failure_frame()?.0
        };
        let (callee, extra) = self.stack.lock().pop_callable(num_args)?;
        if extra {
            num_args += 1;
        }
        let Some(f) = value::as_func(&callee).cloned() else {
            return self.raise_hosted(
                "Apply_Exception",
                &format!("cannot apply {}", value::to_str(&callee)),
                barrier,
            );
        };
        let after = Pc::bytecode(module.clone(), off + 1);
        let mut s = self.stack.lock();
        s.update_pc(after.clone())?;
        let cl = Closure::new(f.num_vars as usize, f.container.clone());
        s.add_continuation_frame(
            callee,
            num_args,
            cl,
            f.pc.clone(),
            if is_fail_up { Some(after) } else { None },
            is_fail_up,
        )?;
        s.push_value(value::int(num_args as i64));
        Ok(None)
    }

    /// A frame produced its final value: deliver it to whoever is waiting.
    pub(crate) fn return_protocol(
        &mut self,
        v: Value,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        let (at, as_gen, resumption) = {
            let s = self.stack.lock();
            let at = s.cfp.ok_or(VmError::CorruptStack("return with no frame"))?;
            let cf = s.cont(at)?;
            (at, cf.returns_as_generator, cf.resumption_pc.clone())
        };
        if at == barrier {
            return Ok(Some(LoopExit::Returned(v)));
        }
        if as_gen {
            // A pumped call that returns is done for good: drop both its
            // frames, then deliver the value (or the failure) to the
            // consumer at the recorded resumption point.
            let resume = {
                let mut s = self.stack.lock();
                s.remove_continuation_frame()?;
                let gen_at = s
                    .gfp
                    .ok_or(VmError::CorruptStack("pumped frame without generator"))?;
                let g_res = s.gen(gen_at)?.resumption_pc.clone();
                s.remove_generator_frame()?;
                g_res.or(resumption)
            };
            if builtins::is_fail(&v) {
                return self.fail_now(barrier);
            }
            let resume =
                resume.ok_or(VmError::CorruptStack("pumped frame without resumption pc"))?;
            let mut s = self.stack.lock();
            s.push_value(v);
            s.update_pc(resume)?;
            Ok(None)
        } else {
            self.stack.lock().remove_continuation_frame()?;
            if builtins::is_fail(&v) {
                return self.fail_now(barrier);
            }
            // caller's pc was advanced past the Apply before the call
            self.stack.lock().push_value(v);
            Ok(None)
        }
    }

    fn op_yield(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        let as_gen = self.stack.lock().current_cont()?.returns_as_generator;
        if !as_gen {
            // nothing is pumping this call; the yield is in effect a return
            let v = self.stack.lock().pop_value()?;
            return self.return_protocol(v, barrier);
        }
        let v = {
            let mut s = self.stack.lock();
            let v = s.pop_value()?;
            // resume just past the yield
            s.update_pc(Pc::bytecode(module.clone(), off + 1))?;
            v
        };
        self.suspend_current(v, barrier)
    }

    fn op_eyield(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        _barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        let mut s = self.stack.lock();
        let v = s.pop_value()?;
        // The alternation construct only runs under a plain failure frame;
        // its target is where the next alternative's code lives.
        let (is_fail_up, fail_to) = s.read_failure_frame()?;
        if is_fail_up {
            return Err(VmError::CorruptStack("eyield under a fail-up frame"));
        }
        let resumption =
            fail_to.ok_or(VmError::CorruptStack("plain failure frame without target"))?;
        s.remove_failure_frame()?;
        s.add_eyield_frame(resumption);
        s.push_value(v);
        s.update_pc(Pc::bytecode(module.clone(), off + 1))?;
        Ok(None)
    }

    fn op_cmp(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        op: Opcode,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        use std::cmp::Ordering;
        let (rhs, lhs) = {
            let mut s = self.stack.lock();
            let rhs = s.pop_value()?;
            let lhs = s.pop_value()?;
            (rhs, lhs)
        };
        let holds = match op {
            Opcode::Eq => value::eq(&lhs, &rhs).unwrap_or(false),
            Opcode::Neq => !value::eq(&lhs, &rhs).unwrap_or(false),
            _ => {
                let Some(ord) = value::cmp(&lhs, &rhs) else {
                    return self.raise_hosted(
                        "Type_Exception",
                        &format!(
                            "cannot order {} and {}",
                            value::to_str(&lhs),
                            value::to_str(&rhs)
                        ),
                        barrier,
                    );
                };
                match op {
                    Opcode::Lt => ord == Ordering::Less,
                    Opcode::LtEq => ord != Ordering::Greater,
                    Opcode::Gt => ord == Ordering::Greater,
                    Opcode::GtEq => ord != Ordering::Less,
                    _ => unreachable!(),
                }
            }
        };
        if holds {
            // a successful comparison produces its right operand
            self.stack.lock().push_value(rhs);
            self.advance(module, off, 1)?;
            Ok(None)
        } else {
            self.fail_now(barrier)
        }
    }

    fn op_dict(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        n: usize,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        let mut entries = Vec::with_capacity(n);
        {
            let mut s = self.stack.lock();
            for _ in 0..n {
                let val = s.pop_value()?;
                let key = s.pop_value()?;
                entries.push((key, val));
            }
        }
        let mut kv = Vec::with_capacity(n);
        for (key, val) in entries {
            let Some(k) = value::as_key(&key) else {
                return self.raise_hosted(
                    "Type_Exception",
                    &format!("unhashable key {}", value::to_str(&key)),
                    barrier,
                );
            };
            kv.push((k, val));
        }
        self.stack.lock().push_value(value::dict(kv));
        self.advance(module, off, 1)?;
        Ok(None)
    }

    fn op_set(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        n: usize,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        let mut elems = Vec::with_capacity(n);
        {
            let mut s = self.stack.lock();
            for _ in 0..n {
                elems.push(s.pop_value()?);
            }
        }
        let mut keys = Vec::with_capacity(n);
        for v in elems {
            let Some(k) = value::as_key(&v) else {
                return self.raise_hosted(
                    "Type_Exception",
                    &format!("unhashable element {}", value::to_str(&v)),
                    barrier,
                );
            };
            keys.push(k);
        }
        self.stack.lock().push_value(value::set(keys));
        self.advance(module, off, 1)?;
        Ok(None)
    }

    fn op_unpack_args(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        num_params: usize,
        has_vargs: bool,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        let closure = self.stack.lock().current_cont()?.closure.clone();
        let na = {
            let mut s = self.stack.lock();
            value::as_int(&s.pop_value()?)
                .ok_or(VmError::CorruptStack("argument count is not an int"))? as usize
        };
        if na > num_params && !has_vargs {
            return self.raise_hosted(
                "Parameters_Exception",
                &format!(
                    "too many parameters ({} passed, but a maximum of {} allowed)",
                    na, num_params
                ),
                barrier,
            );
        }
        if na < num_params {
            return self.raise_hosted(
                "Parameters_Exception",
                &format!("not enough parameters ({} passed, {} required)", na, num_params),
                barrier,
            );
        }
        {
            let mut s = self.stack.lock();
            if has_vargs {
                let mut extras = Vec::with_capacity(na - num_params);
                for _ in 0..na - num_params {
                    extras.push(s.pop_value()?);
                }
                extras.reverse();
                if !closure.set_var(0, num_params, value::list(extras)) {
                    return Err(Self::bad(module, off, "var-args variable address"));
                }
            }
            for i in (0..num_params).rev() {
                let v = s.pop_value()?;
                if !closure.set_var(0, i, v) {
                    return Err(Self::bad(module, off, "parameter variable address"));
                }
            }
        }
        self.advance(module, off, 1)?;
        Ok(None)
    }

    fn op_unpack_assign(
        &mut self,
        module: &Arc<Module>,
        off: usize,
        n: usize,
        barrier: usize,
    ) -> Result<Option<LoopExit>, VmError> {
        let obj = self.stack.lock().peek_value()?;
        let Some(len) = value::list_len(&obj) else {
            return self.raise_hosted(
                "Type_Exception",
                &format!("cannot unpack {}", value::to_str(&obj)),
                barrier,
            );
        };
        if len != n {
            return self.raise_hosted(
                "Unpack_Exception",
                &format!("expected {} elements, got {}", n, len),
                barrier,
            );
        }
        {
            let mut s = self.stack.lock();
            for i in (0..n).rev() {
                // length was checked above
                let Some(elem) = value::list_get(&obj, i) else {
                    return Err(VmError::CorruptStack("list shrank during unpack"));
                };
                s.push_value(elem);
            }
        }
        self.advance(module, off, 1)?;
        Ok(None)
    }
}
