//! The bytecode dispatch loop.
//!
//! `Interpreter` holds only the state that outlives a single `call`:
//! the in-flight thrown value between `Throw` and the `Catch` it lands
//! on, a debugger breakpoint flag pollable from another thread, and
//! where execution last stopped for a pause. Everything else — the
//! active call frames, their registers — lives on the `Runtime` so a
//! paused execution can be resumed without an `Interpreter` pinning a
//! borrow of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use picojs_bytecode::function::UpvalueCapture;
use picojs_bytecode::operand::{CacheIndex, ConstantIndex, FunctionIndex, Register};
use picojs_bytecode::{CacheSlot, Constant, Function, Instruction, Module};
use picojs_gc::GcPtr;

use crate::closure::{alloc_closure, alloc_upvalue, Closure};
use crate::error::{StackFrame, VmError, VmResult};
use crate::object::{
    alloc_array, alloc_callable, alloc_object, Callable, JsObject, PropertyAttributes, PropertyKey, PropertySlot,
    SetPropertyError,
};
use crate::runtime::Runtime;
use crate::string::alloc_string;
use crate::value::Value;

/// What one dispatched instruction did to control flow.
enum Step {
    Continue,
    Returned(Value),
}

/// Outcome of resolving a callee to something actually runnable.
enum Invoked {
    /// A native call or a bound-function chain that bottomed out in one;
    /// the result is already in hand, no frame was pushed.
    Immediate(Value),
    /// A bytecode/closure frame was pushed; the dispatch loop keeps
    /// stepping and the eventual `Ret` surfaces the value.
    Entered,
}

/// Bound on native-function re-entrancy (a host builtin like `Array.map`
/// calling back into `Interpreter::call` for each element). This is
/// separate from the register-stack's bytecode depth limit because a
/// native call consumes Rust's own stack, not a `CallFrame` — unbounded
/// recursion here overflows the host stack before `RegisterStack` would
/// ever report full.
const DEFAULT_MAX_NATIVE_DEPTH: usize = 512;

/// Executes bytecode against a [`Runtime`].
pub struct Interpreter {
    pending_exception: Option<Value>,
    /// Set from outside the VM thread (a signal handler, a host's
    /// watchdog timer) to ask the next `Call`/`Ret`/`DebuggerCheckBreak`
    /// site to pause rather than continue.
    async_break: Arc<AtomicBool>,
    paused_at: Option<(Arc<Module>, FunctionIndex, u32)>,
    /// Current native-call re-entrancy depth; see `DEFAULT_MAX_NATIVE_DEPTH`.
    native_depth: usize,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            pending_exception: None,
            async_break: Arc::new(AtomicBool::new(false)),
            paused_at: None,
            native_depth: 0,
        }
    }

    /// A clonable handle a host can flip from another thread to request
    /// a pause at the next poll point.
    pub fn async_break_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.async_break)
    }

    pub fn paused_at(&self) -> Option<(FunctionIndex, u32)> {
        self.paused_at.as_ref().map(|(_, f, pc)| (*f, *pc))
    }

    fn poll_async_break(&mut self, rt: &Runtime) -> VmResult<()> {
        if self.async_break.load(Ordering::Relaxed) {
            return Err(self.pause(rt));
        }
        Ok(())
    }

    fn pause(&mut self, rt: &Runtime) -> VmError {
        if let Some(frame) = rt.registers().current() {
            self.paused_at = Some((Arc::clone(&frame.module), frame.function_index, frame.pc));
        }
        VmError::DebuggerPause
    }

    /// Run the module's top-level function to completion.
    pub fn run(&mut self, rt: &mut Runtime, module: Arc<Module>) -> VmResult<Value> {
        let floor_depth = rt.registers().depth();
        let entry = module.global_function_index();
        let name = module
            .function(entry)
            .map(|f| f.display_name().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let _span = tracing::debug_span!("interpreter.run", function = %name, symbol = entry.index()).entered();
        self.enter_bytecode(rt, module, entry, None, Some(Value::undefined()), Vec::new(), false, None, None)?;
        self.dispatch(rt, floor_depth)
    }

    /// Call an arbitrary value as a function, the way `Call`/`New` do
    /// from inside bytecode, but from the host side.
    pub fn call(&mut self, rt: &mut Runtime, callee: Value, this: Value, args: &[Value]) -> VmResult<Value> {
        let floor_depth = rt.registers().depth();
        tracing::trace!(argc = args.len(), native_depth = self.native_depth, "interpreter.call");
        match self.invoke(rt, callee, Some(this), args.to_vec(), false, None)? {
            Invoked::Immediate(v) => Ok(v),
            Invoked::Entered => self.dispatch(rt, floor_depth),
        }
    }

    /// Resume a dispatch loop after a [`VmError::DebuggerPause`], using
    /// the same `floor_depth` the interrupted `call`/`run` was invoked
    /// with. No frames were popped on pause, so this picks up exactly
    /// where execution stopped.
    pub fn resume(&mut self, rt: &mut Runtime, floor_depth: usize) -> VmResult<Value> {
        self.paused_at = None;
        self.dispatch(rt, floor_depth)
    }

    /// Execute exactly one instruction. For external single-step
    /// debugger drivers; `run`/`call` use `dispatch`, which is this in
    /// a loop.
    pub fn step(&mut self, rt: &mut Runtime, floor_depth: usize) -> VmResult<Option<Value>> {
        match self.execute_one(rt, floor_depth)? {
            Step::Continue => Ok(None),
            Step::Returned(v) => Ok(Some(v)),
        }
    }

    fn dispatch(&mut self, rt: &mut Runtime, floor_depth: usize) -> VmResult<Value> {
        loop {
            match self.execute_one(rt, floor_depth)? {
                Step::Continue => {}
                Step::Returned(v) => return Ok(v),
            }
        }
    }

    fn execute_one(&mut self, rt: &mut Runtime, floor_depth: usize) -> VmResult<Step> {
        let (module, function_index, pc) = {
            let frame = rt.registers().current().expect("execute_one called with no active frame");
            (Arc::clone(&frame.module), frame.function_index, frame.pc)
        };
        let function = module.function(function_index)?;
        let instr = function
            .instructions
            .get(pc as usize)
            .ok_or_else(|| VmError::internal("instruction pointer past end of function"))?
            .clone();
        let mut next_pc = pc + 1;

        use Instruction as I;
        match instr {
            I::LoadUndefined { dst } => rt.registers_mut().set(dst, Value::undefined()),
            I::LoadNull { dst } => rt.registers_mut().set(dst, Value::null()),
            I::LoadTrue { dst } => rt.registers_mut().set(dst, Value::boolean(true)),
            I::LoadFalse { dst } => rt.registers_mut().set(dst, Value::boolean(false)),
            I::LoadInt32 { dst, value } => rt.registers_mut().set(dst, Value::number(value as f64)),
            I::LoadConst { dst, idx } => {
                let v = load_constant(rt, function, idx)?;
                rt.registers_mut().set(dst, v);
            }

            I::GetLocal { dst, idx } => {
                let v = rt.registers().get(Register::new(idx.index() as u8));
                rt.registers_mut().set(dst, v);
            }
            I::SetLocal { idx, src } => {
                let v = rt.registers().get(src);
                rt.registers_mut().set(Register::new(idx.index() as u8), v);
            }
            I::GetUpvalue { dst, idx } => {
                let v = self.read_upvalue(rt, idx.index())?;
                rt.registers_mut().set(dst, v);
            }
            I::SetUpvalue { idx, src } => {
                let v = rt.registers().get(src);
                self.write_upvalue(rt, idx.index(), v)?;
            }
            I::GetGlobal { dst, name } => {
                let v = self.get_global(rt, function, name)?;
                rt.registers_mut().set(dst, v);
            }
            I::SetGlobal { name, src } => {
                let v = rt.registers().get(src);
                self.set_global(rt, function, name, v)?;
            }
            I::LoadThis { dst } => {
                let v = rt.registers().this_value();
                rt.registers_mut().set(dst, v);
            }

            I::Add { dst, lhs, rhs } => {
                let (a, b) = (rt.registers().get(lhs), rt.registers().get(rhs));
                let v = add(rt, a, b);
                rt.registers_mut().set(dst, v);
            }
            I::Sub { dst, lhs, rhs } => {
                let v = Value::number(to_number(rt.registers().get(lhs)) - to_number(rt.registers().get(rhs)));
                rt.registers_mut().set(dst, v);
            }
            I::Mul { dst, lhs, rhs } => {
                let v = Value::number(to_number(rt.registers().get(lhs)) * to_number(rt.registers().get(rhs)));
                rt.registers_mut().set(dst, v);
            }
            I::Div { dst, lhs, rhs } => {
                let v = Value::number(to_number(rt.registers().get(lhs)) / to_number(rt.registers().get(rhs)));
                rt.registers_mut().set(dst, v);
            }
            I::Mod { dst, lhs, rhs } => {
                // Rust's `%` on f64 is truncated remainder, matching C
                // `fmod` rather than a round-to-nearest remainder.
                let v = Value::number(to_number(rt.registers().get(lhs)) % to_number(rt.registers().get(rhs)));
                rt.registers_mut().set(dst, v);
            }
            I::Neg { dst, src } => {
                let v = Value::number(-to_number(rt.registers().get(src)));
                rt.registers_mut().set(dst, v);
            }
            I::Inc { dst, src } => {
                let v = Value::number(to_number(rt.registers().get(src)) + 1.0);
                rt.registers_mut().set(dst, v);
            }
            I::Dec { dst, src } => {
                let v = Value::number(to_number(rt.registers().get(src)) - 1.0);
                rt.registers_mut().set(dst, v);
            }

            I::BitAnd { dst, lhs, rhs } => {
                let v = Value::number(
                    (to_int32(to_number(rt.registers().get(lhs))) & to_int32(to_number(rt.registers().get(rhs)))) as f64,
                );
                rt.registers_mut().set(dst, v);
            }
            I::BitOr { dst, lhs, rhs } => {
                let v = Value::number(
                    (to_int32(to_number(rt.registers().get(lhs))) | to_int32(to_number(rt.registers().get(rhs)))) as f64,
                );
                rt.registers_mut().set(dst, v);
            }
            I::BitXor { dst, lhs, rhs } => {
                let v = Value::number(
                    (to_int32(to_number(rt.registers().get(lhs))) ^ to_int32(to_number(rt.registers().get(rhs)))) as f64,
                );
                rt.registers_mut().set(dst, v);
            }
            I::BitNot { dst, src } => {
                let v = Value::number(!to_int32(to_number(rt.registers().get(src))) as f64);
                rt.registers_mut().set(dst, v);
            }
            I::Shl { dst, lhs, rhs } => {
                let a = to_int32(to_number(rt.registers().get(lhs)));
                let shift = to_uint32(to_number(rt.registers().get(rhs))) & 31;
                rt.registers_mut().set(dst, Value::number((a << shift) as f64));
            }
            I::Shr { dst, lhs, rhs } => {
                let a = to_int32(to_number(rt.registers().get(lhs)));
                let shift = to_uint32(to_number(rt.registers().get(rhs))) & 31;
                rt.registers_mut().set(dst, Value::number((a >> shift) as f64));
            }
            I::Ushr { dst, lhs, rhs } => {
                let a = to_uint32(to_number(rt.registers().get(lhs)));
                let shift = to_uint32(to_number(rt.registers().get(rhs))) & 31;
                rt.registers_mut().set(dst, Value::number((a >> shift) as f64));
            }

            I::Eq { dst, lhs, rhs } => {
                let v = Value::boolean(loose_eq(rt.registers().get(lhs), rt.registers().get(rhs)));
                rt.registers_mut().set(dst, v);
            }
            I::Ne { dst, lhs, rhs } => {
                let v = Value::boolean(!loose_eq(rt.registers().get(lhs), rt.registers().get(rhs)));
                rt.registers_mut().set(dst, v);
            }
            I::StrictEq { dst, lhs, rhs } => {
                let v = Value::boolean(strict_eq(rt.registers().get(lhs), rt.registers().get(rhs)));
                rt.registers_mut().set(dst, v);
            }
            I::StrictNe { dst, lhs, rhs } => {
                let v = Value::boolean(!strict_eq(rt.registers().get(lhs), rt.registers().get(rhs)));
                rt.registers_mut().set(dst, v);
            }
            I::Lt { dst, lhs, rhs } => {
                let v = Value::boolean(less_than(rt.registers().get(lhs), rt.registers().get(rhs)).unwrap_or(false));
                rt.registers_mut().set(dst, v);
            }
            I::Gt { dst, lhs, rhs } => {
                let v = Value::boolean(less_than(rt.registers().get(rhs), rt.registers().get(lhs)).unwrap_or(false));
                rt.registers_mut().set(dst, v);
            }
            I::Le { dst, lhs, rhs } => {
                let v = Value::boolean(!less_than(rt.registers().get(rhs), rt.registers().get(lhs)).unwrap_or(true));
                rt.registers_mut().set(dst, v);
            }
            I::Ge { dst, lhs, rhs } => {
                let v = Value::boolean(!less_than(rt.registers().get(lhs), rt.registers().get(rhs)).unwrap_or(true));
                rt.registers_mut().set(dst, v);
            }

            I::Not { dst, src } => {
                let v = Value::boolean(!rt.registers().get(src).to_boolean());
                rt.registers_mut().set(dst, v);
            }
            I::TypeOf { dst, src } => {
                let v = type_of(rt, rt.registers().get(src));
                rt.registers_mut().set(dst, v);
            }
            I::InstanceOf { dst, lhs, rhs } => {
                let v = instance_of(rt, rt.registers().get(lhs), rt.registers().get(rhs))?;
                rt.registers_mut().set(dst, Value::boolean(v));
            }
            I::In { dst, lhs, rhs } => {
                let key_val = rt.registers().get(lhs);
                let obj_val = rt.registers().get(rhs);
                let obj = obj_val.as_object().ok_or_else(|| VmError::type_error("'in' on a non-object"))?;
                let key = to_property_key(rt, key_val);
                let v = has_property(obj, &key);
                rt.registers_mut().set(dst, Value::boolean(v));
            }

            I::GetById { dst, obj, name, cache } => {
                let obj_val = rt.registers().get(obj);
                let v = self.get_by_id(rt, function, cache, obj_val, name)?;
                rt.registers_mut().set(dst, v);
            }
            I::TryGetById { dst, obj, name, cache } => {
                let obj_val = rt.registers().get(obj);
                let v = self.try_get_by_id(rt, function, cache, obj_val, name)?;
                rt.registers_mut().set(dst, v);
            }
            I::PutById { obj, name, src, cache } => {
                let obj_val = rt.registers().get(obj);
                let v = rt.registers().get(src);
                self.put_by_id(rt, function, cache, obj_val, name, v)?;
            }
            I::GetByVal { dst, obj, key } => {
                let v = get_by_val(rt, rt.registers().get(obj), rt.registers().get(key));
                rt.registers_mut().set(dst, v);
            }
            I::PutByVal { obj, key, src } => {
                let obj_val = rt.registers().get(obj);
                let key_val = rt.registers().get(key);
                let v = rt.registers().get(src);
                put_by_val(rt, obj_val, key_val, v)?;
            }
            I::DeleteById { dst, obj, name } => {
                let obj_val = rt.registers().get(obj);
                let result = match obj_val.as_object() {
                    Some(o) => {
                        let key = resolve_name_key(rt, function, name)?;
                        o.get().delete_own(&key)
                    }
                    None => true,
                };
                rt.registers_mut().set(dst, Value::boolean(result));
            }
            I::NewObject { dst } => {
                let v = Value::Object(alloc_object(rt.heap_mut(), None));
                rt.registers_mut().set(dst, v);
            }
            I::NewArray { dst, capacity_hint: _ } => {
                let v = Value::Object(alloc_array(rt.heap_mut(), None));
                rt.registers_mut().set(dst, v);
            }
            I::DefineGetter { obj, name, func } => {
                let obj_val = rt.registers().get(obj);
                let func_val = rt.registers().get(func);
                let o = obj_val.as_object().ok_or_else(|| VmError::type_error("DefineGetter target is not an object"))?;
                let key = resolve_name_key(rt, function, name)?;
                o.get().define_accessor(key, Some(func_val), None).map_err(set_property_error)?;
            }
            I::DefineSetter { obj, name, func } => {
                let obj_val = rt.registers().get(obj);
                let func_val = rt.registers().get(func);
                let o = obj_val.as_object().ok_or_else(|| VmError::type_error("DefineSetter target is not an object"))?;
                let key = resolve_name_key(rt, function, name)?;
                o.get().define_accessor(key, None, Some(func_val)).map_err(set_property_error)?;
            }
            I::Spread { dst: _, array, src } => {
                let array_val = rt.registers().get(array);
                let src_val = rt.registers().get(src);
                let array_obj = array_val.as_object().ok_or_else(|| VmError::type_error("spread target is not an object"))?;
                let src_obj = src_val.as_object().ok_or_else(|| VmError::type_error("spread operand is not iterable"))?;
                let base = array_len(array_obj);
                for (offset, v) in spread_elements(src_obj).into_iter().enumerate() {
                    array_obj
                        .get()
                        .set_own(PropertyKey::Index(base + offset as u32), v, PropertyAttributes::data())
                        .map_err(set_property_error)?;
                }
            }

            I::Jmp { offset } => {
                next_pc = (pc as i64 + offset.offset() as i64) as u32;
            }
            I::JmpIfTrue { cond, offset } => {
                if rt.registers().get(cond).to_boolean() {
                    next_pc = (pc as i64 + offset.offset() as i64) as u32;
                }
            }
            I::JmpIfFalse { cond, offset } => {
                if !rt.registers().get(cond).to_boolean() {
                    next_pc = (pc as i64 + offset.offset() as i64) as u32;
                }
            }

            I::Call { dst, callee, this, args } => {
                self.poll_async_break(rt)?;
                if let Some(frame) = rt.registers_mut().current_mut() {
                    frame.pc = next_pc;
                }
                let callee_val = rt.registers().get(callee);
                let this_val = rt.registers().get(this);
                let arg_vals: Vec<Value> = args.iter().map(|r| rt.registers().get(*r)).collect();
                match self.invoke(rt, callee_val, Some(this_val), arg_vals, false, Some(dst))? {
                    Invoked::Immediate(v) => rt.registers_mut().set(dst, v),
                    Invoked::Entered => {}
                }
                return Ok(Step::Continue);
            }
            I::New { dst, callee, args } => {
                self.poll_async_break(rt)?;
                if let Some(frame) = rt.registers_mut().current_mut() {
                    frame.pc = next_pc;
                }
                let callee_val = rt.registers().get(callee);
                let arg_vals: Vec<Value> = args.iter().map(|r| rt.registers().get(*r)).collect();
                match self.invoke(rt, callee_val, None, arg_vals, true, Some(dst))? {
                    Invoked::Immediate(v) => rt.registers_mut().set(dst, v),
                    Invoked::Entered => {}
                }
                return Ok(Step::Continue);
            }
            I::CallSpread { dst, callee, this, args, spread } => {
                self.poll_async_break(rt)?;
                if let Some(frame) = rt.registers_mut().current_mut() {
                    frame.pc = next_pc;
                }
                let callee_val = rt.registers().get(callee);
                let this_val = rt.registers().get(this);
                let mut arg_vals: Vec<Value> = args.iter().map(|r| rt.registers().get(*r)).collect();
                if let Some(spread_obj) = rt.registers().get(spread).as_object() {
                    arg_vals.extend(spread_elements(spread_obj));
                }
                match self.invoke(rt, callee_val, Some(this_val), arg_vals, false, Some(dst))? {
                    Invoked::Immediate(v) => rt.registers_mut().set(dst, v),
                    Invoked::Entered => {}
                }
                return Ok(Step::Continue);
            }
            I::ConstructSpread { dst, callee, args, spread } => {
                self.poll_async_break(rt)?;
                if let Some(frame) = rt.registers_mut().current_mut() {
                    frame.pc = next_pc;
                }
                let callee_val = rt.registers().get(callee);
                let mut arg_vals: Vec<Value> = args.iter().map(|r| rt.registers().get(*r)).collect();
                if let Some(spread_obj) = rt.registers().get(spread).as_object() {
                    arg_vals.extend(spread_elements(spread_obj));
                }
                match self.invoke(rt, callee_val, None, arg_vals, true, Some(dst))? {
                    Invoked::Immediate(v) => rt.registers_mut().set(dst, v),
                    Invoked::Entered => {}
                }
                return Ok(Step::Continue);
            }
            I::Ret { src } => {
                self.poll_async_break(rt)?;
                return self.do_return(rt, src, floor_depth);
            }

            I::Throw { src } => {
                let v = rt.registers().get(src);
                return self.throw(rt, pc, v, floor_depth);
            }
            I::Catch { dst } => {
                let v = self.pending_exception.take().expect("Catch reached with no pending exception");
                rt.registers_mut().set(dst, v);
            }

            I::DebuggerCheckBreak => {
                self.poll_async_break(rt)?;
            }

            I::MakeClosure { dst, function: target_index } => {
                let v = self.make_closure(rt, &module, target_index)?;
                rt.registers_mut().set(dst, v);
            }
        }

        if let Some(frame) = rt.registers_mut().current_mut() {
            frame.pc = next_pc;
        }
        Ok(Step::Continue)
    }

    fn do_return(&mut self, rt: &mut Runtime, src: Register, floor_depth: usize) -> VmResult<Step> {
        let (return_register, is_construct, this_value) = {
            let f = rt.registers().current().expect("Ret with no active frame");
            (f.return_register, f.is_construct, f.this_value)
        };
        let mut result = rt.registers_mut().pop_frame(src);
        if is_construct && !result.is_object() {
            result = this_value;
        }
        if rt.registers().depth() == floor_depth {
            return Ok(Step::Returned(result));
        }
        let reg = return_register.expect("non-floor Ret must carry a return register");
        rt.registers_mut().set(reg, result);
        Ok(Step::Continue)
    }

    /// Walk the catch table of the throwing frame, then its callers, in
    /// search of a handler. `throw_pc` is the offset of the `Throw`
    /// instruction itself; ancestor frames use their own stored `pc`
    /// (the instruction past the call site they are suspended at).
    fn throw(&mut self, rt: &mut Runtime, throw_pc: u32, value: Value, floor_depth: usize) -> VmResult<Step> {
        let stack = self.capture_stack(rt, floor_depth);
        attach_stack_property(rt, value, &stack);

        let mut override_pc = Some(throw_pc);
        loop {
            if rt.registers().depth() <= floor_depth {
                return Err(VmError::exception(value, stack));
            }
            let (module, function_index, pc) = {
                let f = rt.registers().current().expect("throw with an active frame");
                (Arc::clone(&f.module), f.function_index, override_pc.take().unwrap_or(f.pc))
            };
            let function = module.function(function_index)?;
            if let Some(handler) = function.find_catch_target(pc) {
                self.pending_exception = Some(value);
                rt.registers_mut().current_mut().expect("frame still active").pc = handler;
                return Ok(Step::Continue);
            }
            rt.registers_mut().pop_frame_for_unwind();
        }
    }

    fn capture_stack(&self, rt: &Runtime, floor_depth: usize) -> Vec<StackFrame> {
        rt.registers()
            .frames()
            .iter()
            .skip(floor_depth)
            .rev()
            .map(|f| {
                let name = f
                    .module
                    .function(f.function_index)
                    .map(|func| func.display_name().to_string())
                    .unwrap_or_else(|_| "<unknown>".to_string());
                StackFrame { function_name: name, instruction_offset: f.pc }
            })
            .collect()
    }

    fn invoke(
        &mut self,
        rt: &mut Runtime,
        callee: Value,
        explicit_this: Option<Value>,
        mut args: Vec<Value>,
        is_construct: bool,
        return_register: Option<Register>,
    ) -> VmResult<Invoked> {
        let obj = callee.as_object().ok_or_else(|| VmError::type_error("value is not a function"))?;
        let callable = obj.get().callable().ok_or_else(|| VmError::type_error("value is not a function"))?;
        match callable {
            Callable::Bound { target, bound_this, bound_args } => {
                let mut merged = bound_args;
                merged.append(&mut args);
                let this = if is_construct { None } else { Some(bound_this) };
                self.invoke(rt, Value::Object(target), this, merged, is_construct, return_register)
            }
            Callable::Native(f) => {
                if self.native_depth >= DEFAULT_MAX_NATIVE_DEPTH {
                    return Err(VmError::StackOverflow);
                }
                let this = explicit_this.unwrap_or(Value::undefined());
                self.native_depth += 1;
                let result = f(rt, this, &args);
                self.native_depth -= 1;
                Ok(Invoked::Immediate(result?))
            }
            Callable::Bytecode { module, function_index } => {
                self.enter_bytecode(rt, module, function_index, None, explicit_this, args, is_construct, Some(obj), return_register)?;
                Ok(Invoked::Entered)
            }
            Callable::Closure(gc) => {
                let c = gc.get();
                let module = Arc::clone(&c.module);
                let function_index = c.function_index;
                self.enter_bytecode(
                    rt,
                    module,
                    function_index,
                    Some(gc),
                    explicit_this,
                    args,
                    is_construct,
                    Some(obj),
                    return_register,
                )?;
                Ok(Invoked::Entered)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_bytecode(
        &mut self,
        rt: &mut Runtime,
        module: Arc<Module>,
        function_index: FunctionIndex,
        closure: Option<GcPtr<Closure>>,
        explicit_this: Option<Value>,
        args: Vec<Value>,
        is_construct: bool,
        callee_obj: Option<GcPtr<JsObject>>,
        return_register: Option<Register>,
    ) -> VmResult<()> {
        let frame_size = module.function(function_index)?.frame_size;

        let this_value = if is_construct {
            let proto_key = PropertyKey::Symbol(rt.strings_mut().intern("prototype"));
            let proto = callee_obj.and_then(|o| o.get().get_own(&proto_key)).and_then(|v| v.as_object());
            Value::Object(alloc_object(rt.heap_mut(), proto))
        } else {
            explicit_this.unwrap_or(Value::undefined())
        };

        rt.registers_mut()
            .push_frame(module, function_index, frame_size, this_value, &args, is_construct, closure, return_register)
            .map_err(|_| VmError::StackOverflow)
    }

    fn make_closure(&mut self, rt: &mut Runtime, module: &Arc<Module>, target_index: FunctionIndex) -> VmResult<Value> {
        let target = module.function(target_index)?;
        let current_closure = rt.registers().current().and_then(|f| f.closure);

        let mut upvalues = Vec::with_capacity(target.upvalue_captures.len());
        for capture in &target.upvalue_captures {
            let cell = match *capture {
                UpvalueCapture::ParentLocal(idx) => {
                    let v = rt.registers().get(Register::new(idx as u8));
                    alloc_upvalue(rt.heap_mut(), v)
                }
                UpvalueCapture::ParentUpvalue(idx) => {
                    let parent = current_closure.ok_or_else(|| VmError::internal("ParentUpvalue capture with no enclosing closure"))?;
                    parent.get().upvalues[idx as usize]
                }
            };
            upvalues.push(cell);
        }

        let closure = alloc_closure(rt.heap_mut(), Arc::clone(module), target_index, upvalues);
        let obj = alloc_callable(rt.heap_mut(), None, Callable::Closure(closure));
        Ok(Value::Object(obj))
    }

    fn read_upvalue(&self, rt: &Runtime, idx: u16) -> VmResult<Value> {
        let closure = rt
            .registers()
            .current()
            .and_then(|f| f.closure)
            .ok_or_else(|| VmError::internal("GetUpvalue with no enclosing closure"))?;
        Ok(closure.get().upvalues[idx as usize].get().get())
    }

    fn write_upvalue(&self, rt: &Runtime, idx: u16, value: Value) -> VmResult<()> {
        let closure = rt
            .registers()
            .current()
            .and_then(|f| f.closure)
            .ok_or_else(|| VmError::internal("SetUpvalue with no enclosing closure"))?;
        closure.get().upvalues[idx as usize].get().set(value);
        Ok(())
    }

    fn get_global(&self, rt: &mut Runtime, function: &Function, name: ConstantIndex) -> VmResult<Value> {
        let key = resolve_name_key(rt, function, name)?;
        Ok(rt.global().get().get_own(&key).unwrap_or(Value::undefined()))
    }

    fn set_global(&self, rt: &mut Runtime, function: &Function, name: ConstantIndex, value: Value) -> VmResult<()> {
        let key = resolve_name_key(rt, function, name)?;
        rt.global().get().set_own(key, value, PropertyAttributes::data()).map(|_| ()).map_err(set_property_error)
    }

    /// Shared `GetById`/`TryGetById` lookup: inline-cache hit, then an
    /// own-property cache-populating lookup, then an uncached prototype
    /// walk. Only an own-property hit on the receiver's own shape
    /// populates the cache — slot numbers from a different object found
    /// via the prototype chain aren't meaningful for this receiver. A
    /// cache hit or an own/inherited hit that turns out to be an accessor
    /// invokes the getter instead of returning a slot.
    fn lookup_by_id(
        &mut self,
        rt: &mut Runtime,
        function: &Function,
        cache: CacheIndex,
        obj_val: Value,
        name_idx: ConstantIndex,
    ) -> VmResult<Option<Value>> {
        let Some(obj) = obj_val.as_object() else {
            return self.lookup_primitive_by_id(rt, function, obj_val, name_idx);
        };

        if !cache.is_disabled() {
            if let CacheSlot::Monomorphic { shape_id, slot } = function.read_cache(cache) {
                if obj.get().shape().map(|s| s.id()) == Some(shape_id) {
                    if let Some(v) = obj.get().read_slot(slot).as_data() {
                        return Ok(Some(v));
                    }
                }
            }
        }

        let key = resolve_name_key(rt, function, name_idx)?;

        if let Some(shape) = obj.get().shape() {
            if let Some(desc) = shape.find(&key) {
                let slot = obj.get().read_slot(desc.slot);
                if let PropertySlot::Data(v) = slot {
                    if !cache.is_disabled() {
                        let new_entry = match function.read_cache(cache) {
                            CacheSlot::Empty => CacheSlot::Monomorphic { shape_id: shape.id(), slot: desc.slot },
                            _ => CacheSlot::Megamorphic,
                        };
                        function.set_read_cache(cache, new_entry);
                    }
                    return Ok(Some(v));
                }
                return self.invoke_getter(rt, slot, obj_val).map(Some);
            }
        } else if let Some(slot) = obj.get().get_own_slot(&key) {
            return match slot {
                PropertySlot::Data(v) => Ok(Some(v)),
                PropertySlot::Accessor { .. } => self.invoke_getter(rt, slot, obj_val).map(Some),
            };
        }

        let mut cur = obj.get().prototype();
        while let Some(p) = cur {
            if let Some(slot) = p.get().get_own_slot(&key) {
                return match slot {
                    PropertySlot::Data(v) => Ok(Some(v)),
                    PropertySlot::Accessor { .. } => self.invoke_getter(rt, slot, obj_val).map(Some),
                };
            }
            cur = p.get().prototype();
        }
        Ok(None)
    }

    /// `"abc".length`, `"abc"[0]`, and similar: primitives have no own
    /// properties of their own, but a handful of string reads are common
    /// enough callers expect them to work without a full `String.prototype`.
    fn lookup_primitive_by_id(
        &mut self,
        rt: &mut Runtime,
        function: &Function,
        obj_val: Value,
        name_idx: ConstantIndex,
    ) -> VmResult<Option<Value>> {
        let Value::String(s) = obj_val else {
            return Ok(None);
        };
        let name = function.constants[name_idx.index() as usize].as_str().unwrap_or_default();
        if name == "length" {
            return Ok(Some(Value::number(s.get().len_utf16() as f64)));
        }
        if let Ok(idx) = name.parse::<usize>() {
            let ch = s.get().as_str().chars().nth(idx);
            return Ok(ch.map(|c| Value::String(alloc_string(rt.heap_mut(), c.to_string()))));
        }
        Ok(None)
    }

    fn invoke_getter(&mut self, rt: &mut Runtime, slot: PropertySlot, receiver: Value) -> VmResult<Value> {
        let (getter, _) = slot.as_accessor().expect("invoke_getter called on a non-accessor slot");
        if getter.is_undefined() {
            return Ok(Value::undefined());
        }
        self.call(rt, getter, receiver, &[])
    }

    fn get_by_id(&mut self, rt: &mut Runtime, function: &Function, cache: CacheIndex, obj_val: Value, name_idx: ConstantIndex) -> VmResult<Value> {
        Ok(self.lookup_by_id(rt, function, cache, obj_val, name_idx)?.unwrap_or(Value::undefined()))
    }

    fn try_get_by_id(
        &mut self,
        rt: &mut Runtime,
        function: &Function,
        cache: CacheIndex,
        obj_val: Value,
        name_idx: ConstantIndex,
    ) -> VmResult<Value> {
        match self.lookup_by_id(rt, function, cache, obj_val, name_idx)? {
            Some(v) => Ok(v),
            None => {
                let name = function.constants[name_idx.index() as usize].as_str().unwrap_or("<unknown>");
                Err(VmError::reference_error(format!("{name} is not defined")))
            }
        }
    }

    /// Shared `PutById` write. An own or inherited accessor on `key`
    /// intercepts the write (invoking its setter, or silently dropping /
    /// throwing per `function`'s strictness if it has none); otherwise
    /// this falls through to a plain data write. A non-object receiver is
    /// likewise a silent no-op in sloppy mode and a `TypeError` in strict
    /// mode, matching `PropertyAttributes::writable` semantics rather
    /// than unconditionally throwing.
    fn put_by_id(
        &mut self,
        rt: &mut Runtime,
        function: &Function,
        cache: CacheIndex,
        obj_val: Value,
        name_idx: ConstantIndex,
        value: Value,
    ) -> VmResult<()> {
        let Some(obj) = obj_val.as_object() else {
            if function.flags.is_strict {
                return Err(VmError::type_error("cannot set property of a non-object"));
            }
            return Ok(());
        };
        let key = resolve_name_key(rt, function, name_idx)?;

        if let Some(setter) = find_setter(obj, &key) {
            return match setter {
                Some(setter) => self.call(rt, setter, obj_val, &[value]).map(|_| ()),
                None if function.flags.is_strict => {
                    Err(VmError::type_error("cannot assign to property which has only a getter"))
                }
                None => Ok(()),
            };
        }

        obj.get().set_own(key.clone(), value, PropertyAttributes::data()).map_err(set_property_error)?;

        if !cache.is_disabled() {
            if let Some(shape) = obj.get().shape() {
                if let Some(desc) = shape.find(&key) {
                    let new_entry = match function.write_cache(cache) {
                        CacheSlot::Monomorphic { shape_id, .. } if shape_id == shape.id() => function.write_cache(cache),
                        CacheSlot::Empty => CacheSlot::Monomorphic { shape_id: shape.id(), slot: desc.slot },
                        _ => CacheSlot::Megamorphic,
                    };
                    function.set_write_cache(cache, new_entry);
                }
            }
        }
        Ok(())
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

fn attach_stack_property(rt: &mut Runtime, value: Value, stack: &[StackFrame]) {
    let Some(obj) = value.as_object() else { return };
    let stack_key = PropertyKey::Symbol(rt.strings_mut().intern("stack"));
    if obj.get().has_own(&stack_key) {
        return;
    }
    let rendered = stack
        .iter()
        .map(|f| format!("at {} ({})", f.function_name, f.instruction_offset))
        .collect::<Vec<_>>()
        .join("\n");
    let s = alloc_string(rt.heap_mut(), rendered);
    let _ = obj.get().set_own(stack_key, Value::String(s), PropertyAttributes::data());
}

fn set_property_error(e: SetPropertyError) -> VmError {
    match e {
        SetPropertyError::NotWritable => VmError::type_error("Cannot assign to read only property"),
        SetPropertyError::NotExtensible => VmError::type_error("Cannot add property, object is not extensible"),
        SetPropertyError::AccessorWithoutSetter => VmError::type_error("Cannot set property which has only a getter"),
    }
}

/// Walk `obj`'s own property, then its prototype chain, looking for an
/// accessor that would intercept a plain data write to `key`. `None`
/// means no accessor shadows the write (write a plain data property);
/// `Some(None)` is an accessor with no setter; `Some(Some(f))` is the
/// setter to invoke. A data property anywhere in the chain stops the
/// walk without returning `Some` — only the nearest own-or-inherited
/// property matters, same as `lookup_by_id`'s read-side search.
fn find_setter(obj: GcPtr<JsObject>, key: &PropertyKey) -> Option<Option<Value>> {
    let mut cur = Some(obj);
    while let Some(o) = cur {
        if let Some(slot) = o.get().get_own_slot(key) {
            return match slot {
                PropertySlot::Data(_) => None,
                PropertySlot::Accessor { set, .. } => Some(if set.is_undefined() { None } else { Some(set) }),
            };
        }
        cur = o.get().prototype();
    }
    None
}

/// One past the highest own index-keyed property, i.e. the next slot a
/// `Spread` append should start writing at. `0` for an object with no
/// index-keyed own properties yet.
fn array_len(obj: GcPtr<JsObject>) -> u32 {
    obj.get()
        .own_keys()
        .into_iter()
        .filter_map(|k| match k {
            PropertyKey::Index(i) => Some(i),
            PropertyKey::Symbol(_) => None,
        })
        .max()
        .map_or(0, |m| m + 1)
}

/// Read out an array-like object's dense index-keyed elements in order,
/// the way `CallSpread`/`ConstructSpread`/`Spread` unpack `...args`.
fn spread_elements(obj: GcPtr<JsObject>) -> Vec<Value> {
    let len = array_len(obj);
    (0..len).map(|i| obj.get().get_own(&PropertyKey::Index(i)).unwrap_or(Value::undefined())).collect()
}

fn resolve_name_key(rt: &mut Runtime, function: &Function, idx: ConstantIndex) -> VmResult<PropertyKey> {
    let name = function.constants[idx.index() as usize]
        .as_str()
        .ok_or_else(|| VmError::internal("property name constant is not a string"))?;
    Ok(PropertyKey::Symbol(rt.strings_mut().intern(name)))
}

fn load_constant(rt: &mut Runtime, function: &Function, idx: ConstantIndex) -> VmResult<Value> {
    match &function.constants[idx.index() as usize] {
        Constant::Number(n) => Ok(Value::number(*n)),
        Constant::String(s) => Ok(Value::String(alloc_string(rt.heap_mut(), s.clone()))),
        Constant::Regex { .. } | Constant::ObjectTemplate(_) => Err(VmError::internal("constant kind not loadable via LoadConst")),
    }
}

fn lookup_property(obj: GcPtr<JsObject>, key: &PropertyKey) -> Option<Value> {
    let mut cur = Some(obj);
    while let Some(o) = cur {
        if let Some(v) = o.get().get_own(key) {
            return Some(v);
        }
        cur = o.get().prototype();
    }
    None
}

fn has_property(obj: GcPtr<JsObject>, key: &PropertyKey) -> bool {
    let mut cur = Some(obj);
    while let Some(o) = cur {
        if o.get().has_own(key) {
            return true;
        }
        cur = o.get().prototype();
    }
    false
}

fn get_by_val(rt: &mut Runtime, obj_val: Value, key_val: Value) -> Value {
    let Some(obj) = obj_val.as_object() else {
        return Value::undefined();
    };
    let key = to_property_key(rt, key_val);
    lookup_property(obj, &key).unwrap_or(Value::undefined())
}

fn put_by_val(rt: &mut Runtime, obj_val: Value, key_val: Value, value: Value) -> VmResult<()> {
    let obj = obj_val.as_object().ok_or_else(|| VmError::type_error("cannot set property of a non-object"))?;
    let key = to_property_key(rt, key_val);
    obj.get().set_own(key, value, PropertyAttributes::data()).map(|_| ()).map_err(set_property_error)
}

fn to_property_key(rt: &mut Runtime, v: Value) -> PropertyKey {
    match v {
        Value::Number(n) if n >= 0.0 && n.fract() == 0.0 && n < u32::MAX as f64 => PropertyKey::Index(n as u32),
        Value::String(s) => PropertyKey::Symbol(rt.strings_mut().intern(s.get().as_str())),
        Value::Symbol(id) => PropertyKey::Symbol(id),
        other => PropertyKey::Symbol(rt.strings_mut().intern(&display_string(other))),
    }
}

fn type_of(rt: &mut Runtime, v: Value) -> Value {
    let tag = match v {
        Value::Object(o) if o.get().is_callable() => "function",
        other => other.type_tag(),
    };
    Value::String(alloc_string(rt.heap_mut(), tag))
}

fn instance_of(rt: &mut Runtime, lhs: Value, rhs: Value) -> VmResult<bool> {
    let rhs_obj = rhs
        .as_object()
        .filter(|o| o.get().is_callable())
        .ok_or_else(|| VmError::type_error("Right-hand side of 'instanceof' is not callable"))?;
    let proto_key = PropertyKey::Symbol(rt.strings_mut().intern("prototype"));
    let Some(target_proto) = rhs_obj.get().get_own(&proto_key).and_then(|v| v.as_object()) else {
        return Ok(false);
    };
    let mut cur = lhs.as_object().and_then(|o| o.get().prototype());
    while let Some(p) = cur {
        if p.ptr_eq(&target_proto) {
            return Ok(true);
        }
        cur = p.get().prototype();
    }
    Ok(false)
}

fn add(rt: &mut Runtime, a: Value, b: Value) -> Value {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Value::number(x + y);
    }
    if matches!(a, Value::String(_)) || matches!(b, Value::String(_)) {
        let s = format!("{}{}", display_string(a), display_string(b));
        return Value::String(alloc_string(rt.heap_mut(), s));
    }
    Value::number(to_number(a) + to_number(b))
}

fn display_string(v: Value) -> String {
    match v {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n),
        Value::String(s) => s.get().as_str().to_string(),
        Value::Object(_) => "[object Object]".to_string(),
        Value::Symbol(id) => format!("Symbol(#{})", id.0),
        Value::Empty => unreachable!("empty value observed by ToString"),
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else {
        format!("{n}")
    }
}

fn to_number(v: Value) -> f64 {
    match v {
        Value::Undefined => f64::NAN,
        Value::Null => 0.0,
        Value::Bool(b) => if b { 1.0 } else { 0.0 },
        Value::Number(n) => n,
        Value::String(s) => parse_number_str(s.get().as_str()),
        Value::Object(_) | Value::Symbol(_) => f64::NAN,
        Value::Empty => unreachable!("empty value observed by ToNumber"),
    }
}

fn parse_number_str(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        0.0
    } else {
        t.parse::<f64>().unwrap_or(f64::NAN)
    }
}

/// ECMA ToInt32: truncate, then reduce modulo 2^32 into the signed range.
fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let n = n.trunc();
    let m = n.rem_euclid(4294967296.0);
    if m >= 2147483648.0 {
        (m - 4294967296.0) as i32
    } else {
        m as i32
    }
}

fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4294967296.0) as u32
}

fn strict_eq(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x.get().as_str() == y.get().as_str(),
        (Value::Object(x), Value::Object(y)) => x.ptr_eq(&y),
        (Value::Symbol(x), Value::Symbol(y)) => x == y,
        _ => false,
    }
}

fn loose_eq(a: Value, b: Value) -> bool {
    use Value::*;
    match (a, b) {
        (Undefined | Null, Undefined | Null) => true,
        (Number(_), Number(_)) | (String(_), String(_)) | (Bool(_), Bool(_)) | (Object(_), Object(_)) | (Symbol(_), Symbol(_)) => strict_eq(a, b),
        (Number(n), String(s)) | (String(s), Number(n)) => n == parse_number_str(s.get().as_str()),
        (Bool(_), other) => loose_eq(Value::number(to_number(a)), other),
        (other, Bool(_)) => loose_eq(other, Value::number(to_number(b))),
        _ => false,
    }
}

/// `None` when either side is `NaN` (ECMA's "undefined" comparison
/// result), which every relational operator above must treat as false.
fn less_than(a: Value, b: Value) -> Option<bool> {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Some(x.get().as_str() < y.get().as_str());
    }
    let (na, nb) = (to_number(a), to_number(b));
    if na.is_nan() || nb.is_nan() {
        None
    } else {
        Some(na < nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picojs_bytecode::function::CatchEntry;
    use picojs_bytecode::operand::JumpOffset;
    use picojs_bytecode::{Function, Module};

    fn module_with(f: Function) -> Arc<Module> {
        Arc::new(Module::builder().function(f).build())
    }

    #[test]
    fn arithmetic_fast_path_adds_numbers() {
        let f = Function::builder()
            .frame_size(3)
            .instruction(Instruction::LoadInt32 { dst: Register::new(0), value: 2 })
            .instruction(Instruction::LoadInt32 { dst: Register::new(1), value: 3 })
            .instruction(Instruction::Add { dst: Register::new(2), lhs: Register::new(0), rhs: Register::new(1) })
            .instruction(Instruction::Ret { src: Register::new(2) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module).unwrap();
        assert_eq!(result.as_number(), Some(5.0));
    }

    #[test]
    fn string_concatenation_via_add() {
        let mut builder = Function::builder().frame_size(3);
        let a = builder.constant(Constant::String("foo".into()));
        let b = builder.constant(Constant::String("bar".into()));
        let f = builder
            .instruction(Instruction::LoadConst { dst: Register::new(0), idx: ConstantIndex::new(a as u32) })
            .instruction(Instruction::LoadConst { dst: Register::new(1), idx: ConstantIndex::new(b as u32) })
            .instruction(Instruction::Add { dst: Register::new(2), lhs: Register::new(0), rhs: Register::new(1) })
            .instruction(Instruction::Ret { src: Register::new(2) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module).unwrap();
        assert_eq!(result.as_string().unwrap().get().as_str(), "foobar");
    }

    #[test]
    fn get_by_id_cache_warms_up_on_second_hit() {
        let mut builder = Function::builder().frame_size(2).reserve_caches(1);
        let name = builder.constant(Constant::String("x".into()));
        let f = builder
            .instruction(Instruction::NewObject { dst: Register::new(0) })
            .instruction(Instruction::PutById {
                obj: Register::new(0),
                name: ConstantIndex::new(name as u32),
                src: Register::new(0),
                cache: CacheIndex::DISABLED,
            })
            .instruction(Instruction::GetById {
                dst: Register::new(1),
                obj: Register::new(0),
                name: ConstantIndex::new(name as u32),
                cache: CacheIndex::new(1),
            })
            .instruction(Instruction::GetById {
                dst: Register::new(1),
                obj: Register::new(0),
                name: ConstantIndex::new(name as u32),
                cache: CacheIndex::new(1),
            })
            .instruction(Instruction::Ret { src: Register::new(1) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module.clone()).unwrap();
        assert!(result.as_object().is_some());
        let target = module.function(FunctionIndex::new(0)).unwrap();
        assert!(matches!(target.read_cache(CacheIndex::new(1)), CacheSlot::Monomorphic { .. }));
    }

    #[test]
    fn uncaught_throw_captures_stack_trace() {
        let f = Function::builder()
            .name("boom")
            .frame_size(1)
            .instruction(Instruction::LoadUndefined { dst: Register::new(0) })
            .instruction(Instruction::Throw { src: Register::new(0) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let err = interp.run(&mut rt, module).unwrap_err();
        match err {
            VmError::Exception(thrown) => assert_eq!(thrown.stack.len(), 1),
            other => panic!("expected Exception, got {other:?}"),
        }
    }

    #[test]
    fn throw_inside_try_jumps_to_catch_handler() {
        let f = Function::builder()
            .frame_size(2)
            .catch_entry(CatchEntry { start_offset: 0, end_offset: 2, handler_offset: 3 })
            .instruction(Instruction::LoadInt32 { dst: Register::new(0), value: 7 })
            .instruction(Instruction::Throw { src: Register::new(0) })
            .instruction(Instruction::Jmp { offset: JumpOffset::new(2) })
            .instruction(Instruction::Catch { dst: Register::new(1) })
            .instruction(Instruction::Ret { src: Register::new(1) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module).unwrap();
        assert_eq!(result.as_number(), Some(7.0));
    }

    #[test]
    fn deeply_recursive_calls_overflow_cleanly() {
        let mut builder = Function::builder().frame_size(2).param_count(0);
        let self_name = builder.constant(Constant::String("self".into()));
        let f = builder
            .instruction(Instruction::TryGetById {
                dst: Register::new(0),
                obj: Register::new(0),
                name: ConstantIndex::new(self_name as u32),
                cache: CacheIndex::DISABLED,
            })
            .instruction(Instruction::Call { dst: Register::new(1), callee: Register::new(0), this: Register::new(0), args: vec![] })
            .instruction(Instruction::Ret { src: Register::new(1) })
            .build();
        let module = Arc::new(Module::builder().function(f).build());
        let mut rt = Runtime::new();
        let callee = Value::Object(alloc_callable(
            rt.heap_mut(),
            None,
            Callable::Bytecode { module: Arc::clone(&module), function_index: FunctionIndex::new(0) },
        ));
        let key = PropertyKey::Symbol(rt.strings_mut().intern("self"));
        rt.global().get().set_own(key, callee, PropertyAttributes::data()).unwrap();

        let mut interp = Interpreter::new();
        let err = interp.run(&mut rt, module).unwrap_err();
        assert!(matches!(err, VmError::StackOverflow));
    }

    #[test]
    fn closure_reads_captured_local_via_upvalue() {
        // Function 0 is the entry point: it captures a local and calls the
        // closure. Function 1 is the closure body, reading the upvalue back.
        let outer = Function::builder()
            .frame_size(2)
            .instruction(Instruction::LoadInt32 { dst: Register::new(0), value: 9 })
            .instruction(Instruction::MakeClosure { dst: Register::new(1), function: FunctionIndex::new(1) })
            .instruction(Instruction::Call { dst: Register::new(1), callee: Register::new(1), this: Register::new(1), args: vec![] })
            .instruction(Instruction::Ret { src: Register::new(1) })
            .build();

        let body = Function::builder()
            .frame_size(1)
            .upvalue_capture(UpvalueCapture::ParentLocal(0))
            .instruction(Instruction::GetUpvalue { dst: Register::new(0), idx: picojs_bytecode::operand::LocalIndex::new(0) })
            .instruction(Instruction::Ret { src: Register::new(0) })
            .build();

        let module = Arc::new(Module::builder().function(outer).function(body).build());
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module).unwrap();
        assert_eq!(result.as_number(), Some(9.0));
    }

    #[test]
    fn native_call_depth_limit_surfaces_as_stack_overflow() {
        fn noop(_rt: &mut Runtime, _this: Value, _args: &[Value]) -> VmResult<Value> {
            Ok(Value::undefined())
        }
        let mut rt = Runtime::new();
        let callee = Value::Object(alloc_callable(rt.heap_mut(), None, Callable::Native(noop)));
        let mut interp = Interpreter::new();
        interp.native_depth = DEFAULT_MAX_NATIVE_DEPTH;
        let err = interp.call(&mut rt, callee, Value::undefined(), &[]).unwrap_err();
        assert!(matches!(err, VmError::StackOverflow));
        assert_eq!(interp.native_depth, DEFAULT_MAX_NATIVE_DEPTH);
    }

    #[test]
    fn accessor_getter_is_invoked_through_get_by_id() {
        fn getter(_rt: &mut Runtime, _this: Value, _args: &[Value]) -> VmResult<Value> {
            Ok(Value::number(42.0))
        }
        let mut builder = Function::builder().frame_size(3).reserve_caches(1);
        let prop_name = builder.constant(Constant::String("x".into()));
        let getter_name = builder.constant(Constant::String("getter".into()));
        let f = builder
            .instruction(Instruction::NewObject { dst: Register::new(0) })
            .instruction(Instruction::GetGlobal { dst: Register::new(1), name: ConstantIndex::new(getter_name as u32) })
            .instruction(Instruction::DefineGetter {
                obj: Register::new(0),
                name: ConstantIndex::new(prop_name as u32),
                func: Register::new(1),
            })
            .instruction(Instruction::GetById {
                dst: Register::new(2),
                obj: Register::new(0),
                name: ConstantIndex::new(prop_name as u32),
                cache: CacheIndex::new(1),
            })
            .instruction(Instruction::Ret { src: Register::new(2) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let getter_fn = Value::Object(alloc_callable(rt.heap_mut(), None, Callable::Native(getter)));
        let key = PropertyKey::Symbol(rt.strings_mut().intern("getter"));
        rt.global().get().set_own(key, getter_fn, PropertyAttributes::data()).unwrap();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module).unwrap();
        assert_eq!(result.as_number(), Some(42.0));
    }

    #[test]
    fn string_receiver_length_lookup() {
        let mut builder = Function::builder().frame_size(2);
        let str_const = builder.constant(Constant::String("hello".into()));
        let name = builder.constant(Constant::String("length".into()));
        let f = builder
            .instruction(Instruction::LoadConst { dst: Register::new(0), idx: ConstantIndex::new(str_const as u32) })
            .instruction(Instruction::GetById {
                dst: Register::new(1),
                obj: Register::new(0),
                name: ConstantIndex::new(name as u32),
                cache: CacheIndex::DISABLED,
            })
            .instruction(Instruction::Ret { src: Register::new(1) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module).unwrap();
        assert_eq!(result.as_number(), Some(5.0));
    }

    #[test]
    fn put_by_id_on_primitive_is_noop_in_sloppy_mode() {
        let mut builder = Function::builder().frame_size(2);
        let name = builder.constant(Constant::String("x".into()));
        let f = builder
            .instruction(Instruction::LoadInt32 { dst: Register::new(0), value: 5 })
            .instruction(Instruction::LoadInt32 { dst: Register::new(1), value: 1 })
            .instruction(Instruction::PutById {
                obj: Register::new(0),
                name: ConstantIndex::new(name as u32),
                src: Register::new(1),
                cache: CacheIndex::DISABLED,
            })
            .instruction(Instruction::Ret { src: Register::new(0) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module).unwrap();
        assert_eq!(result.as_number(), Some(5.0));
    }

    #[test]
    fn put_by_id_on_primitive_throws_in_strict_mode() {
        let mut builder = Function::builder().frame_size(2).strict(true);
        let name = builder.constant(Constant::String("x".into()));
        let f = builder
            .instruction(Instruction::LoadInt32 { dst: Register::new(0), value: 5 })
            .instruction(Instruction::LoadInt32 { dst: Register::new(1), value: 1 })
            .instruction(Instruction::PutById {
                obj: Register::new(0),
                name: ConstantIndex::new(name as u32),
                src: Register::new(1),
                cache: CacheIndex::DISABLED,
            })
            .instruction(Instruction::Ret { src: Register::new(0) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let mut interp = Interpreter::new();
        let err = interp.run(&mut rt, module).unwrap_err();
        assert!(matches!(err, VmError::TypeError(_)));
    }

    #[test]
    fn call_spread_appends_unpacked_array_elements() {
        fn sum(_rt: &mut Runtime, _this: Value, args: &[Value]) -> VmResult<Value> {
            Ok(Value::number(args.iter().filter_map(|v| v.as_number()).sum()))
        }
        let mut builder = Function::builder().frame_size(6);
        let fn_name = builder.constant(Constant::String("sum".into()));
        let f = builder
            .instruction(Instruction::GetGlobal { dst: Register::new(0), name: ConstantIndex::new(fn_name as u32) })
            .instruction(Instruction::NewArray { dst: Register::new(1), capacity_hint: Register::new(0) })
            .instruction(Instruction::LoadInt32 { dst: Register::new(2), value: 0 })
            .instruction(Instruction::LoadInt32 { dst: Register::new(3), value: 10 })
            .instruction(Instruction::PutByVal { obj: Register::new(1), key: Register::new(2), src: Register::new(3) })
            .instruction(Instruction::LoadInt32 { dst: Register::new(2), value: 1 })
            .instruction(Instruction::LoadInt32 { dst: Register::new(3), value: 20 })
            .instruction(Instruction::PutByVal { obj: Register::new(1), key: Register::new(2), src: Register::new(3) })
            .instruction(Instruction::LoadUndefined { dst: Register::new(4) })
            .instruction(Instruction::CallSpread {
                dst: Register::new(5),
                callee: Register::new(0),
                this: Register::new(4),
                args: vec![],
                spread: Register::new(1),
            })
            .instruction(Instruction::Ret { src: Register::new(5) })
            .build();
        let module = module_with(f);
        let mut rt = Runtime::new();
        let sum_fn = Value::Object(alloc_callable(rt.heap_mut(), None, Callable::Native(sum)));
        let key = PropertyKey::Symbol(rt.strings_mut().intern("sum"));
        rt.global().get().set_own(key, sum_fn, PropertyAttributes::data()).unwrap();
        let mut interp = Interpreter::new();
        let result = interp.run(&mut rt, module).unwrap();
        assert_eq!(result.as_number(), Some(30.0));
    }
}
