//! Main bytecode dispatch loop.
//!
//! Calls and returns are iterative over the VM's frame vector, so a hook
//! yield can unwind out of `execute` and a later `resume` continues from
//! the saved program counters.

use crate::arith::{self, ArithFail, ArithOp};
use crate::callinfo::{call_status, CallInfo};
use crate::error::{self, SolError, VarLoc};
use crate::metamethod::{get_metamethod, Tm};
use crate::trace;
use crate::vm::{ThreadStatus, Vm};
use sol_core::value::TValue;
use sol_bytecode::opcode::OpCode;
use sol_bytecode::proto::Constant;

/// Upper bound on `__index`/`__newindex` chains.
const MAX_TAG_LOOP: usize = 100;

/// Helper macro to get the current proto without borrowing all of vm.
macro_rules! proto {
    ($vm:expr, $ci_idx:expr) => {
        &$vm.protos[$vm.call_stack[$ci_idx].proto_idx]
    };
}

fn constant_to_tvalue(k: &Constant) -> TValue {
    match k {
        Constant::Nil => TValue::nil(),
        Constant::Boolean(b) => TValue::from_bool(*b),
        Constant::Integer(i) => TValue::from_integer(*i),
        Constant::Float(f) => TValue::from_float(*f),
        Constant::String(id) => TValue::from_string_id(*id),
    }
}

#[inline]
fn get_k(vm: &Vm, ci_idx: usize, idx: usize) -> TValue {
    constant_to_tvalue(&proto!(vm, ci_idx).constants[idx])
}

/// Call a function value with the given arguments and run it to
/// completion (or until a hook yields).
pub fn call_function(
    vm: &mut Vm,
    func: TValue,
    args: &[TValue],
) -> Result<Vec<TValue>, SolError> {
    let func_idx = vm.stack_top;
    vm.ensure_stack(func_idx, args.len() + 1);
    vm.stack[func_idx] = func;
    for (i, a) in args.iter().enumerate() {
        vm.stack[func_idx + 1 + i] = *a;
    }
    vm.stack_top = func_idx + 1 + args.len();
    let base_depth = vm.call_stack.len();
    match precall(vm, func_idx, -1, false, VarLoc::Unknown)? {
        Some(nres) => {
            let out = vm.stack[func_idx..func_idx + nres].to_vec();
            vm.stack_top = func_idx;
            Ok(out)
        }
        None => execute(vm, base_depth),
    }
}

/// Continue execution after a hook yield unwound `call_function`.
pub fn resume(vm: &mut Vm) -> Result<Vec<TValue>, SolError> {
    vm.status = ThreadStatus::Ok;
    execute(vm, 0)
}

/// Run `func` in protected mode: on error the stack and frame chain are
/// restored and the error is returned. `msgh` installs a message handler
/// for errors raised inside the call.
pub fn protected_call(
    vm: &mut Vm,
    func: TValue,
    args: &[TValue],
    msgh: Option<TValue>,
) -> Result<Vec<TValue>, SolError> {
    let saved_depth = vm.call_stack.len();
    let saved_top = vm.stack_top;
    let saved_errfunc = vm.errfunc;
    if let Some(h) = msgh {
        debug_assert!(h.is_function());
        vm.push(h);
        vm.errfunc = Some(vm.stack_top - 1);
    }
    let result = call_function(vm, func, args);
    match result {
        Err(SolError::Yield) => Err(SolError::Yield), // resumable; do not unwind
        Err(e) => {
            vm.call_stack.truncate(saved_depth);
            vm.stack_top = saved_top;
            vm.errfunc = saved_errfunc;
            Err(e)
        }
        Ok(vals) => {
            vm.stack_top = saved_top;
            vm.errfunc = saved_errfunc;
            Ok(vals)
        }
    }
}

/// Prepare a call to the value at `func_idx` with arguments up to the
/// stack top. Script calls push a frame and return `None`; native calls
/// run to completion, leave their results starting at `func_idx`, and
/// return the result count.
fn precall(
    vm: &mut Vm,
    func_idx: usize,
    num_results: i32,
    tail: bool,
    loc: VarLoc,
) -> Result<Option<usize>, SolError> {
    if vm.call_stack.len() >= vm.max_call_depth {
        return Err(SolError::StackOverflow);
    }
    let func = vm.stack[func_idx];
    if let Some(cl_idx) = func.as_closure_idx() {
        let proto_idx = vm.heap.get_closure(cl_idx).proto_idx;
        let p = &vm.protos[proto_idx];
        let num_params = p.num_params as usize;
        let max_stack = p.max_stack_size as usize;
        let is_vararg = p.is_vararg;
        let nargs = vm.stack_top - func_idx - 1;
        let base = func_idx + 1;
        vm.ensure_stack(base, nargs.max(num_params) + max_stack + 1);
        // complete missing fixed arguments
        for i in nargs..num_params {
            vm.stack[base + i] = TValue::nil();
        }
        let mut ci = CallInfo::new(base, proto_idx);
        ci.num_results = num_results;
        ci.closure_idx = Some(cl_idx);
        ci.func_stack_idx = func_idx;
        ci.top = base + max_stack;
        if tail {
            ci.call_status |= call_status::TAIL;
        }
        vm.call_stack.push(ci);
        if is_vararg {
            // the prelude instruction reads the argument count from the top
            vm.stack_top = base + nargs.max(num_params);
        } else {
            vm.stack_top = base + max_stack;
        }
        if vm.hook_mask != 0 {
            trace::trace_call(vm)?;
        }
        Ok(None)
    } else if let Some(id) = func.as_native_id() {
        let nargs = vm.stack_top - func_idx - 1;
        let mut ci = CallInfo::new(func_idx + 1, 0);
        ci.is_lua = false;
        ci.num_results = num_results;
        ci.func_stack_idx = func_idx;
        ci.top = func_idx + 1 + nargs;
        vm.call_stack.push(ci);
        let mut invoke = || -> Result<Vec<TValue>, SolError> {
            if vm.hook_mask & trace::MASK_CALL != 0 {
                trace::call_hook(vm, trace::HookEvent::Call, -1, 1, nargs)?;
            }
            let f = vm.natives[id.0 as usize].func;
            f(vm)
        };
        let results = match invoke() {
            Ok(r) => r,
            Err(e) => {
                vm.call_stack.pop();
                return Err(e);
            }
        };
        // expose the results to the return hook before moving them down
        for v in &results {
            vm.push(*v);
        }
        let first_res = vm.stack_top - results.len();
        if let Err(e) = trace::ret_hook(vm, first_res, results.len()) {
            vm.call_stack.pop();
            return Err(e);
        }
        vm.call_stack.pop();
        for (i, v) in results.iter().enumerate() {
            vm.stack[func_idx + i] = *v;
        }
        let nres = if num_results < 0 {
            vm.stack_top = func_idx + results.len();
            results.len()
        } else {
            let wanted = num_results as usize;
            for i in results.len()..wanted {
                vm.stack[func_idx + i] = TValue::nil();
            }
            vm.stack_top = func_idx + wanted;
            wanted
        };
        Ok(Some(nres))
    } else {
        Err(error::call_error(vm, func, loc))
    }
}

/// Unwind one frame: fire the return hook, move `nres` results (starting
/// at `first_res`) down to the caller, and restore the caller's state.
/// Returns the final results when the frame at `base_depth` returned.
fn do_return(
    vm: &mut Vm,
    first_res: usize,
    nres: usize,
    base_depth: usize,
) -> Result<Option<Vec<TValue>>, SolError> {
    if vm.hook_mask != 0 {
        trace::ret_hook(vm, first_res, nres)?;
    }
    let ci_idx = vm.call_stack.len() - 1;
    let ci = &vm.call_stack[ci_idx];
    let (func_idx, n_extra, wanted, callee_base, proto_idx) = (
        ci.func_stack_idx,
        ci.n_extra_args,
        ci.num_results,
        ci.base,
        ci.proto_idx,
    );
    let p = &vm.protos[proto_idx];
    // vararg frames return results to the virtual function slot, below
    // the stashed extra arguments
    let target = if p.is_vararg {
        func_idx - n_extra - p.num_params as usize - 1
    } else {
        func_idx
    };
    vm.close_upvalues(callee_base);
    for i in 0..nres {
        vm.stack[target + i] = vm.stack[first_res + i];
    }
    vm.call_stack.pop();
    if vm.call_stack.len() == base_depth {
        let out = vm.stack[target..target + nres].to_vec();
        vm.stack_top = target;
        return Ok(Some(out));
    }
    if wanted < 0 {
        vm.stack_top = target + nres;
    } else {
        let wanted = wanted as usize;
        for i in nres..wanted {
            vm.stack[target + i] = TValue::nil();
        }
        vm.stack_top = target + wanted;
    }
    Ok(None)
}

/// Relocate a vararg frame: the function value and fixed parameters move
/// above the extra arguments, which stay stashed below the new function
/// slot where `find_local` can address them.
fn adjust_varargs(vm: &mut Vm, ci_idx: usize, num_params: usize) {
    let func = vm.call_stack[ci_idx].func_stack_idx;
    let actual = vm.stack_top - func - 1;
    let nextra = actual - num_params;
    vm.call_stack[ci_idx].n_extra_args = nextra;
    let max_stack = proto!(vm, ci_idx).max_stack_size as usize;
    vm.ensure_stack(vm.stack_top, max_stack + 1);
    // copy function to the top of the stack
    vm.stack[vm.stack_top] = vm.stack[func];
    vm.stack_top += 1;
    // move fixed parameters up, erasing the originals
    for i in 1..=num_params {
        vm.stack[vm.stack_top] = vm.stack[func + i];
        vm.stack[func + i] = TValue::nil();
        vm.stack_top += 1;
    }
    let new_func = func + actual + 1;
    let new_base = new_func + 1;
    let new_top = new_base + max_stack;
    let ci = &mut vm.call_stack[ci_idx];
    ci.func_stack_idx = new_func;
    ci.base = new_base;
    ci.top = new_top;
    vm.ensure_stack(new_base, max_stack);
    vm.stack_top = new_top;
}

/// Resolve `t[key]`, following `__index` chains.
fn finish_get(
    vm: &mut Vm,
    t: TValue,
    key: TValue,
    loc: VarLoc,
) -> Result<TValue, SolError> {
    let mut t = t;
    for _ in 0..MAX_TAG_LOOP {
        if let Some(idx) = t.as_table_idx() {
            let v = vm.heap.get_table(idx).raw_get(key);
            if !v.is_nil() {
                return Ok(v);
            }
            match get_metamethod(&vm.heap, &vm.tm_names, t, Tm::Index) {
                None => return Ok(TValue::nil()),
                Some(mm) if mm.is_function() => {
                    let res = call_function(vm, mm, &[t, key])?;
                    return Ok(res.first().copied().unwrap_or(TValue::nil()));
                }
                Some(mm) => t = mm, // repeat the lookup on the handler
            }
        } else {
            return Err(error::type_error(vm, t, "index", loc));
        }
    }
    Err(error::run_error(
        vm,
        "'__index' chain too long; possible loop".to_string(),
    ))
}

/// Assign `t[key] = val`, following `__newindex` chains.
fn finish_set(
    vm: &mut Vm,
    t: TValue,
    key: TValue,
    val: TValue,
    loc: VarLoc,
) -> Result<(), SolError> {
    let mut t = t;
    for _ in 0..MAX_TAG_LOOP {
        if let Some(idx) = t.as_table_idx() {
            let existing = vm.heap.get_table(idx).raw_get(key);
            if existing.is_nil() {
                if let Some(mm) = get_metamethod(&vm.heap, &vm.tm_names, t, Tm::NewIndex) {
                    if mm.is_function() {
                        call_function(vm, mm, &[t, key, val])?;
                        return Ok(());
                    }
                    t = mm;
                    continue;
                }
            }
            return match vm.heap.get_table_mut(idx).raw_set(key, val) {
                Ok(()) => Ok(()),
                Err(msg) => Err(error::run_error(vm, msg.to_string())),
            };
        } else {
            return Err(error::type_error(vm, t, "index", loc));
        }
    }
    Err(error::run_error(
        vm,
        "'__newindex' chain too long; possible loop".to_string(),
    ))
}

/// Dispatch a failed binary fast path to its metamethod, or raise the
/// matching error. The result lands in `res_slot`.
#[allow(clippy::too_many_arguments)]
fn try_bin_tm(
    vm: &mut Vm,
    p1: TValue,
    loc1: VarLoc,
    p2: TValue,
    loc2: VarLoc,
    res_slot: usize,
    tm: Tm,
) -> Result<(), SolError> {
    let mm = get_metamethod(&vm.heap, &vm.tm_names, p1, tm)
        .or_else(|| get_metamethod(&vm.heap, &vm.tm_names, p2, tm));
    match mm {
        Some(f) => {
            let res = call_function(vm, f, &[p1, p2])?;
            vm.stack[res_slot] = res.first().copied().unwrap_or(TValue::nil());
            Ok(())
        }
        None if tm.is_bitwise() => {
            if p1.is_number() && p2.is_number() {
                Err(error::to_int_error(vm, p1, loc1, p2, loc2))
            } else {
                Err(error::op_inter_error(
                    vm,
                    p1,
                    loc1,
                    p2,
                    loc2,
                    "perform bitwise operation on",
                ))
            }
        }
        None if tm == Tm::Concat => Err(error::concat_error(vm, p1, loc1, p2, loc2)),
        None => Err(error::op_inter_error(
            vm,
            p1,
            loc1,
            p2,
            loc2,
            "perform arithmetic on",
        )),
    }
}

/// Concatenate two concatable values into a string.
fn concat2(vm: &mut Vm, a: TValue, b: TValue) -> TValue {
    let mut bytes = Vec::new();
    for v in [a, b] {
        match v.as_string_id() {
            Some(id) => bytes.extend_from_slice(vm.strings.get_bytes(id)),
            None => bytes.extend_from_slice(
                arith::number_to_display(v)
                    .expect("concat2 operand not concatable")
                    .as_bytes(),
            ),
        }
    }
    TValue::from_string_id(vm.strings.intern(&bytes))
}

/// Execute frames above `base_depth` until the frame at `base_depth + 1`
/// returns; its results are handed back.
pub fn execute(vm: &mut Vm, base_depth: usize) -> Result<Vec<TValue>, SolError> {
    loop {
        debug_assert!(vm.call_stack.len() > base_depth);
        let ci_idx = vm.call_stack.len() - 1;
        let base = vm.call_stack[ci_idx].base;
        let pc = vm.call_stack[ci_idx].saved_pc;

        if pc >= proto!(vm, ci_idx).code.len() {
            // fell off the end: implicit return of no values
            if let Some(out) = do_return(vm, base, 0, base_depth)? {
                return Ok(out);
            }
            continue;
        }

        if vm.call_stack[ci_idx].trap {
            // the vararg prelude runs before any tracing so the call hook
            // stays first
            let skip = pc == 0 && proto!(vm, ci_idx).is_vararg;
            if !skip {
                trace::trace_exec(vm, pc)?;
            }
        }

        let inst = proto!(vm, ci_idx).code[pc];
        let op = inst.opcode();
        let a = inst.a() as usize;
        vm.call_stack[ci_idx].saved_pc = pc + 1;

        match op {
            OpCode::Move => {
                let b = inst.b() as usize;
                vm.stack[base + a] = vm.stack[base + b];
            }

            OpCode::LoadI => {
                vm.stack[base + a] = TValue::from_integer(inst.sbx() as i64);
            }

            OpCode::LoadF => {
                vm.stack[base + a] = TValue::from_float(inst.sbx() as f64);
            }

            OpCode::LoadK => {
                let val = get_k(vm, ci_idx, inst.bx() as usize);
                vm.stack[base + a] = val;
            }

            OpCode::LoadKX => {
                let ax = proto!(vm, ci_idx).code[pc + 1].ax_field() as usize;
                vm.call_stack[ci_idx].saved_pc = pc + 2;
                let val = get_k(vm, ci_idx, ax);
                vm.stack[base + a] = val;
            }

            OpCode::LoadFalse => {
                vm.stack[base + a] = TValue::from_bool(false);
            }

            OpCode::LFalseSkip => {
                vm.stack[base + a] = TValue::from_bool(false);
                vm.call_stack[ci_idx].saved_pc = pc + 2;
            }

            OpCode::LoadTrue => {
                vm.stack[base + a] = TValue::from_bool(true);
            }

            OpCode::LoadNil => {
                let b = inst.b() as usize;
                for i in a..=a + b {
                    vm.stack[base + i] = TValue::nil();
                }
            }

            // ---- Upvalues ----
            OpCode::GetUpval => {
                let b = inst.b() as usize;
                let cl = vm.call_stack[ci_idx].closure_idx.expect("script frame");
                let uv = vm.heap.get_closure(cl).upvalues[b];
                let val = vm.get_upval_value(uv);
                vm.stack[base + a] = val;
            }

            OpCode::SetUpval => {
                let b = inst.b() as usize;
                let cl = vm.call_stack[ci_idx].closure_idx.expect("script frame");
                let uv = vm.heap.get_closure(cl).upvalues[b];
                vm.set_upval_value(uv, vm.stack[base + a]);
            }

            // ---- Table accesses ----
            OpCode::GetTabUp => {
                let b = inst.b() as usize;
                let key = get_k(vm, ci_idx, inst.c() as usize);
                let cl = vm.call_stack[ci_idx].closure_idx.expect("script frame");
                let uv = vm.heap.get_closure(cl).upvalues[b];
                let t = vm.get_upval_value(uv);
                let val = finish_get(vm, t, key, VarLoc::Upvalue(b))?;
                vm.stack[base + a] = val;
            }

            OpCode::GetTable => {
                let b = inst.b() as usize;
                let key = vm.stack[base + inst.c() as usize];
                let t = vm.stack[base + b];
                let val = finish_get(vm, t, key, VarLoc::Reg(b as u32))?;
                vm.stack[base + a] = val;
            }

            OpCode::GetI => {
                let b = inst.b() as usize;
                let key = TValue::from_integer(inst.c() as i64);
                let t = vm.stack[base + b];
                let val = finish_get(vm, t, key, VarLoc::Reg(b as u32))?;
                vm.stack[base + a] = val;
            }

            OpCode::GetField => {
                let b = inst.b() as usize;
                let key = get_k(vm, ci_idx, inst.c() as usize);
                let t = vm.stack[base + b];
                let val = finish_get(vm, t, key, VarLoc::Reg(b as u32))?;
                vm.stack[base + a] = val;
            }

            OpCode::SetTabUp => {
                let key = get_k(vm, ci_idx, inst.b() as usize);
                let val = if inst.k() {
                    get_k(vm, ci_idx, inst.c() as usize)
                } else {
                    vm.stack[base + inst.c() as usize]
                };
                let cl = vm.call_stack[ci_idx].closure_idx.expect("script frame");
                let uv = vm.heap.get_closure(cl).upvalues[a];
                let t = vm.get_upval_value(uv);
                finish_set(vm, t, key, val, VarLoc::Upvalue(a))?;
            }

            OpCode::SetTable => {
                let key = vm.stack[base + inst.b() as usize];
                let val = if inst.k() {
                    get_k(vm, ci_idx, inst.c() as usize)
                } else {
                    vm.stack[base + inst.c() as usize]
                };
                let t = vm.stack[base + a];
                finish_set(vm, t, key, val, VarLoc::Reg(a as u32))?;
            }

            OpCode::SetI => {
                let key = TValue::from_integer(inst.b() as i64);
                let val = if inst.k() {
                    get_k(vm, ci_idx, inst.c() as usize)
                } else {
                    vm.stack[base + inst.c() as usize]
                };
                let t = vm.stack[base + a];
                finish_set(vm, t, key, val, VarLoc::Reg(a as u32))?;
            }

            OpCode::SetField => {
                let key = get_k(vm, ci_idx, inst.b() as usize);
                let val = if inst.k() {
                    get_k(vm, ci_idx, inst.c() as usize)
                } else {
                    vm.stack[base + inst.c() as usize]
                };
                let t = vm.stack[base + a];
                finish_set(vm, t, key, val, VarLoc::Reg(a as u32))?;
            }

            OpCode::NewTable => {
                let t = vm.heap.alloc_table(inst.b() as usize, inst.c() as usize);
                vm.stack[base + a] = TValue::from_table(t);
                // skip the size-hint extension word
                if proto!(vm, ci_idx)
                    .code
                    .get(pc + 1)
                    .is_some_and(|i| i.opcode() == OpCode::ExtraArg)
                {
                    vm.call_stack[ci_idx].saved_pc = pc + 2;
                }
            }

            OpCode::Self_ => {
                let b = inst.b() as usize;
                let t = vm.stack[base + b];
                vm.stack[base + a + 1] = t;
                let key = if inst.k() {
                    get_k(vm, ci_idx, inst.c() as usize)
                } else {
                    vm.stack[base + inst.c() as usize]
                };
                let val = finish_get(vm, t, key, VarLoc::Reg(b as u32))?;
                vm.stack[base + a] = val;
            }

            // ---- Arithmetic ----
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Div
            | OpCode::IDiv
            | OpCode::BAnd
            | OpCode::BOr
            | OpCode::BXor
            | OpCode::Shl
            | OpCode::Shr => {
                let aop = arith_op_for(op);
                let vb = vm.stack[base + inst.b() as usize];
                let vc = vm.stack[base + inst.c() as usize];
                arith_fast_path(vm, ci_idx, base, a, pc, aop, vb, vc)?;
            }

            OpCode::AddK
            | OpCode::SubK
            | OpCode::MulK
            | OpCode::ModK
            | OpCode::PowK
            | OpCode::DivK
            | OpCode::IDivK
            | OpCode::BAndK
            | OpCode::BOrK
            | OpCode::BXorK => {
                let aop = arith_op_for(op);
                let vb = vm.stack[base + inst.b() as usize];
                let vc = get_k(vm, ci_idx, inst.c() as usize);
                arith_fast_path(vm, ci_idx, base, a, pc, aop, vb, vc)?;
            }

            OpCode::AddI => {
                let vb = vm.stack[base + inst.b() as usize];
                let imm = TValue::from_integer(inst.sc() as i64);
                arith_fast_path(vm, ci_idx, base, a, pc, ArithOp::Add, vb, imm)?;
            }

            OpCode::ShrI => {
                let vb = vm.stack[base + inst.b() as usize];
                let imm = TValue::from_integer(inst.sc() as i64);
                arith_fast_path(vm, ci_idx, base, a, pc, ArithOp::Shr, vb, imm)?;
            }

            OpCode::ShlI => {
                // immediate shifted by the register operand
                let imm = TValue::from_integer(inst.sc() as i64);
                let vb = vm.stack[base + inst.b() as usize];
                arith_fast_path(vm, ci_idx, base, a, pc, ArithOp::Shl, imm, vb)?;
            }

            // ---- Metamethod fallbacks ----
            OpCode::MMBin => {
                let b = inst.b() as usize;
                let tm = Tm::from_u8(inst.c()).unwrap_or(Tm::Add);
                let v1 = vm.stack[base + a];
                let v2 = vm.stack[base + b];
                let res_reg = proto!(vm, ci_idx).code[pc - 1].a() as usize;
                vm.stack_top = vm.call_stack[ci_idx].top;
                try_bin_tm(
                    vm,
                    v1,
                    VarLoc::Reg(a as u32),
                    v2,
                    VarLoc::Reg(b as u32),
                    base + res_reg,
                    tm,
                )?;
            }

            OpCode::MMBinI => {
                let tm = Tm::from_u8(inst.c()).unwrap_or(Tm::Add);
                let v1 = vm.stack[base + a];
                let imm = TValue::from_integer(inst.sb() as i64);
                let (p1, p2) = if inst.k() { (imm, v1) } else { (v1, imm) };
                let (loc1, loc2) = if inst.k() {
                    (VarLoc::Unknown, VarLoc::Reg(a as u32))
                } else {
                    (VarLoc::Reg(a as u32), VarLoc::Unknown)
                };
                let res_reg = proto!(vm, ci_idx).code[pc - 1].a() as usize;
                vm.stack_top = vm.call_stack[ci_idx].top;
                try_bin_tm(vm, p1, loc1, p2, loc2, base + res_reg, tm)?;
            }

            OpCode::MMBinK => {
                let tm = Tm::from_u8(inst.c()).unwrap_or(Tm::Add);
                let v1 = vm.stack[base + a];
                let kv = get_k(vm, ci_idx, inst.b() as usize);
                let (p1, p2) = if inst.k() { (kv, v1) } else { (v1, kv) };
                let (loc1, loc2) = if inst.k() {
                    (VarLoc::Unknown, VarLoc::Reg(a as u32))
                } else {
                    (VarLoc::Reg(a as u32), VarLoc::Unknown)
                };
                let res_reg = proto!(vm, ci_idx).code[pc - 1].a() as usize;
                vm.stack_top = vm.call_stack[ci_idx].top;
                try_bin_tm(vm, p1, loc1, p2, loc2, base + res_reg, tm)?;
            }

            // ---- Unary ----
            OpCode::Unm => {
                let b = inst.b() as usize;
                let vb = vm.stack[base + b];
                match arith::raw_unm(vb) {
                    Ok(v) => vm.stack[base + a] = v,
                    Err(_) => {
                        vm.stack_top = vm.call_stack[ci_idx].top;
                        let loc = VarLoc::Reg(b as u32);
                        try_bin_tm(vm, vb, loc, vb, loc, base + a, Tm::Unm)?;
                    }
                }
            }

            OpCode::BNot => {
                let b = inst.b() as usize;
                let vb = vm.stack[base + b];
                match arith::raw_bnot(vb) {
                    Ok(v) => vm.stack[base + a] = v,
                    Err(_) => {
                        vm.stack_top = vm.call_stack[ci_idx].top;
                        let loc = VarLoc::Reg(b as u32);
                        try_bin_tm(vm, vb, loc, vb, loc, base + a, Tm::BNot)?;
                    }
                }
            }

            OpCode::Not => {
                let vb = vm.stack[base + inst.b() as usize];
                vm.stack[base + a] = TValue::from_bool(!vb.is_truthy());
            }

            OpCode::Len => {
                let b = inst.b() as usize;
                let vb = vm.stack[base + b];
                if let Some(id) = vb.as_string_id() {
                    let len = vm.strings.get_bytes(id).len() as i64;
                    vm.stack[base + a] = TValue::from_integer(len);
                } else if let Some(mm) =
                    get_metamethod(&vm.heap, &vm.tm_names, vb, Tm::Len)
                {
                    vm.stack_top = vm.call_stack[ci_idx].top;
                    let res = call_function(vm, mm, &[vb])?;
                    vm.stack[base + a] = res.first().copied().unwrap_or(TValue::nil());
                } else if let Some(idx) = vb.as_table_idx() {
                    let len = vm.heap.get_table(idx).length();
                    vm.stack[base + a] = TValue::from_integer(len);
                } else {
                    return Err(error::type_error(
                        vm,
                        vb,
                        "get length of",
                        VarLoc::Reg(b as u32),
                    ));
                }
            }

            OpCode::Concat => {
                let n = inst.b() as usize;
                let mut acc = vm.stack[base + a + n - 1];
                let mut acc_loc = VarLoc::Reg((a + n - 1) as u32);
                for i in (0..n - 1).rev() {
                    let v = vm.stack[base + a + i];
                    let v_loc = VarLoc::Reg((a + i) as u32);
                    if arith::concatable(v) && arith::concatable(acc) {
                        acc = concat2(vm, v, acc);
                        acc_loc = VarLoc::Unknown; // intermediate result
                    } else {
                        let mm = get_metamethod(&vm.heap, &vm.tm_names, v, Tm::Concat)
                            .or_else(|| {
                                get_metamethod(&vm.heap, &vm.tm_names, acc, Tm::Concat)
                            });
                        match mm {
                            Some(f) => {
                                vm.stack_top = vm.call_stack[ci_idx].top;
                                let res = call_function(vm, f, &[v, acc])?;
                                acc = res.first().copied().unwrap_or(TValue::nil());
                                acc_loc = VarLoc::Unknown;
                            }
                            None => {
                                return Err(error::concat_error(
                                    vm, v, v_loc, acc, acc_loc,
                                ));
                            }
                        }
                    }
                }
                vm.stack[base + a] = acc;
            }

            // ---- Upvalue closing ----
            OpCode::Close => {
                vm.close_upvalues(base + a);
            }

            OpCode::Tbc => {
                // to-be-closed variables are not tracked
            }

            // ---- Control flow ----
            OpCode::Jmp => {
                let dest = pc as i64 + 1 + inst.get_sj() as i64;
                vm.call_stack[ci_idx].saved_pc = dest as usize;
            }

            OpCode::Eq => {
                let vb = vm.stack[base + inst.b() as usize];
                let va = vm.stack[base + a];
                if arith::raw_eq(va, vb) != inst.k() {
                    vm.call_stack[ci_idx].saved_pc = pc + 2;
                }
            }

            OpCode::Lt | OpCode::Le => {
                let va = vm.stack[base + a];
                let vb = vm.stack[base + inst.b() as usize];
                let res = if op == OpCode::Lt {
                    arith::raw_lt(va, vb, &vm.strings)
                } else {
                    arith::raw_le(va, vb, &vm.strings)
                };
                let cond = match res {
                    Some(c) => c,
                    None => return Err(error::order_error(vm, va, vb)),
                };
                if cond != inst.k() {
                    vm.call_stack[ci_idx].saved_pc = pc + 2;
                }
            }

            OpCode::EqK => {
                let va = vm.stack[base + a];
                let vb = get_k(vm, ci_idx, inst.b() as usize);
                if arith::raw_eq(va, vb) != inst.k() {
                    vm.call_stack[ci_idx].saved_pc = pc + 2;
                }
            }

            OpCode::EqI | OpCode::LtI | OpCode::LeI | OpCode::GtI | OpCode::GeI => {
                let va = vm.stack[base + a];
                let imm = TValue::from_integer(inst.sb() as i64);
                let res = match op {
                    OpCode::EqI => Some(arith::raw_eq(va, imm)),
                    OpCode::LtI => arith::raw_lt(va, imm, &vm.strings),
                    OpCode::LeI => arith::raw_le(va, imm, &vm.strings),
                    OpCode::GtI => arith::raw_lt(imm, va, &vm.strings),
                    _ => arith::raw_le(imm, va, &vm.strings),
                };
                let cond = match res {
                    Some(c) => c,
                    None => return Err(error::order_error(vm, va, imm)),
                };
                if cond != inst.k() {
                    vm.call_stack[ci_idx].saved_pc = pc + 2;
                }
            }

            OpCode::Test => {
                let va = vm.stack[base + a];
                if va.is_truthy() != inst.k() {
                    vm.call_stack[ci_idx].saved_pc = pc + 2;
                }
            }

            OpCode::TestSet => {
                let vb = vm.stack[base + inst.b() as usize];
                if vb.is_truthy() != inst.k() {
                    vm.call_stack[ci_idx].saved_pc = pc + 2;
                } else {
                    vm.stack[base + a] = vb;
                }
            }

            // ---- Calls ----
            OpCode::Call => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                if b != 0 {
                    vm.stack_top = base + a + b;
                }
                let num_results = if c == 0 { -1 } else { c as i32 - 1 };
                precall(vm, base + a, num_results, false, VarLoc::Reg(a as u32))?;
            }

            OpCode::TailCall => {
                let b = inst.b() as usize;
                if b != 0 {
                    vm.stack_top = base + a + b;
                }
                let func_val = vm.stack[base + a];
                if !func_val.is_function() {
                    return Err(error::call_error(vm, func_val, VarLoc::Reg(a as u32)));
                }
                let nargs = vm.stack_top - (base + a) - 1;
                let ci = &vm.call_stack[ci_idx];
                let (func_idx, n_extra, wanted, callee_base, proto_idx) = (
                    ci.func_stack_idx,
                    ci.n_extra_args,
                    ci.num_results,
                    ci.base,
                    ci.proto_idx,
                );
                let p = &vm.protos[proto_idx];
                let target = if p.is_vararg {
                    func_idx - n_extra - p.num_params as usize - 1
                } else {
                    func_idx
                };
                vm.close_upvalues(callee_base);
                // slide function and arguments into the caller's slot
                for i in 0..=nargs {
                    vm.stack[target + i] = vm.stack[base + a + i];
                }
                vm.stack_top = target + 1 + nargs;
                vm.call_stack.pop();
                match precall(vm, target, wanted, true, VarLoc::Unknown)? {
                    Some(nres) => {
                        // a native function finished the whole frame
                        if vm.call_stack.len() == base_depth {
                            let out = vm.stack[target..target + nres].to_vec();
                            vm.stack_top = target;
                            return Ok(out);
                        }
                    }
                    None => {}
                }
            }

            // ---- Returns ----
            OpCode::Return0 => {
                if let Some(out) = do_return(vm, base + a, 0, base_depth)? {
                    return Ok(out);
                }
            }

            OpCode::Return1 => {
                if let Some(out) = do_return(vm, base + a, 1, base_depth)? {
                    return Ok(out);
                }
            }

            OpCode::Return => {
                let b = inst.b() as usize;
                let nres = if b == 0 {
                    vm.stack_top - (base + a)
                } else {
                    b - 1
                };
                if let Some(out) = do_return(vm, base + a, nres, base_depth)? {
                    return Ok(out);
                }
            }

            // ---- Numeric for ----
            OpCode::ForPrep => {
                let init = vm.stack[base + a];
                let limit = vm.stack[base + a + 1];
                let step = vm.stack[base + a + 2];
                if !limit.is_number() {
                    return Err(error::for_error(vm, limit, "limit"));
                }
                if !step.is_number() {
                    return Err(error::for_error(vm, step, "step"));
                }
                if !init.is_number() {
                    return Err(error::for_error(vm, init, "initial value"));
                }
                if step.as_number() == Some(0.0) {
                    return Err(error::run_error(vm, "'for' step is zero".to_string()));
                }
                vm.stack[base + a + 3] = init;
                let (i, l, s) = (
                    init.as_number().unwrap(),
                    limit.as_number().unwrap(),
                    step.as_number().unwrap(),
                );
                let enters = if s > 0.0 { i <= l } else { i >= l };
                if !enters {
                    // skip the whole loop body
                    vm.call_stack[ci_idx].saved_pc = pc + inst.bx() as usize + 2;
                }
            }

            OpCode::ForLoop => {
                let counter = vm.stack[base + a];
                let limit = vm.stack[base + a + 1];
                let step = vm.stack[base + a + 2];
                let next = match (counter, step) {
                    (TValue::Integer(x), TValue::Integer(s)) => {
                        TValue::from_integer(x.wrapping_add(s))
                    }
                    _ => TValue::from_float(
                        counter.as_number().unwrap_or(0.0) + step.as_number().unwrap_or(0.0),
                    ),
                };
                let (n, l, s) = (
                    next.as_number().unwrap_or(0.0),
                    limit.as_number().unwrap_or(0.0),
                    step.as_number().unwrap_or(0.0),
                );
                let continues = if s > 0.0 { n <= l } else { n >= l };
                if continues {
                    vm.close_upvalues(base + a + 3);
                    vm.stack[base + a] = next;
                    vm.stack[base + a + 3] = next;
                    vm.call_stack[ci_idx].saved_pc = pc + 1 - inst.bx() as usize;
                }
            }

            // ---- Generic for ----
            OpCode::TForPrep => {
                vm.call_stack[ci_idx].saved_pc = pc + inst.bx() as usize + 1;
            }

            OpCode::TForCall => {
                let c = inst.c() as i32;
                let func = vm.stack[base + a];
                if !func.is_function() {
                    return Err(error::call_error(vm, func, VarLoc::Reg(a as u32)));
                }
                for i in 0..3 {
                    vm.stack[base + a + 4 + i] = vm.stack[base + a + i];
                }
                vm.stack_top = base + a + 7;
                precall(vm, base + a + 4, c, false, VarLoc::Reg(a as u32))?;
            }

            OpCode::TForLoop => {
                if !vm.stack[base + a + 4].is_nil() {
                    vm.stack[base + a + 2] = vm.stack[base + a + 4];
                    vm.call_stack[ci_idx].saved_pc = pc + 1 - inst.bx() as usize;
                }
            }

            OpCode::SetList => {
                let b = inst.b() as usize;
                let mut c = inst.c() as usize;
                if inst.k() {
                    c += proto!(vm, ci_idx).code[pc + 1].ax_field() as usize * 256;
                    vm.call_stack[ci_idx].saved_pc = pc + 2;
                }
                let n = if b == 0 {
                    vm.stack_top - (base + a) - 1
                } else {
                    b
                };
                let t = vm.stack[base + a]
                    .as_table_idx()
                    .expect("SETLIST target is not a table");
                for i in 1..=n {
                    let v = vm.stack[base + a + i];
                    vm.heap.get_table_mut(t).raw_seti((c + i) as i64, v);
                }
            }

            // ---- Closures and varargs ----
            OpCode::Closure => {
                let bx = inst.bx() as usize;
                let child = proto!(vm, ci_idx).protos[bx].clone();
                let upval_descs = child.upvalues.clone();
                let child_idx = vm.add_proto(child);
                let parent = vm.call_stack[ci_idx].closure_idx;
                let mut upvals = Vec::with_capacity(upval_descs.len());
                for desc in &upval_descs {
                    if desc.in_stack {
                        let uv = vm.find_or_create_open_upval(base + desc.index as usize);
                        upvals.push(uv);
                    } else {
                        let parent_cl = parent.expect("closure capture outside a closure");
                        let uv = vm.heap.get_closure(parent_cl).upvalues[desc.index as usize];
                        upvals.push(uv);
                    }
                }
                let cl = vm.heap.alloc_closure(child_idx, upvals);
                vm.stack[base + a] = TValue::from_closure(cl);
            }

            OpCode::VarArg => {
                let c = inst.c() as usize;
                let ci = &vm.call_stack[ci_idx];
                let nextra = ci.n_extra_args;
                let first = ci.func_stack_idx - nextra;
                let n = if c == 0 { nextra } else { c - 1 };
                vm.ensure_stack(base + a, n + 1);
                for i in 0..n {
                    vm.stack[base + a + i] = if i < nextra {
                        vm.stack[first + i]
                    } else {
                        TValue::nil()
                    };
                }
                if c == 0 {
                    vm.stack_top = base + a + n;
                }
            }

            OpCode::VarArgPrep => {
                adjust_varargs(vm, ci_idx, a);
                if vm.call_stack[ci_idx].trap {
                    trace::hook_call(vm)?;
                    vm.oldpc = 1; // next opcode is seen as on a "new" line
                }
            }

            OpCode::ExtraArg => {
                // operand word of the previous instruction; nothing to do
            }
        }
    }
}

fn arith_op_for(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add | OpCode::AddK => ArithOp::Add,
        OpCode::Sub | OpCode::SubK => ArithOp::Sub,
        OpCode::Mul | OpCode::MulK => ArithOp::Mul,
        OpCode::Mod | OpCode::ModK => ArithOp::Mod,
        OpCode::Pow | OpCode::PowK => ArithOp::Pow,
        OpCode::Div | OpCode::DivK => ArithOp::Div,
        OpCode::IDiv | OpCode::IDivK => ArithOp::IDiv,
        OpCode::BAnd | OpCode::BAndK => ArithOp::BAnd,
        OpCode::BOr | OpCode::BOrK => ArithOp::BOr,
        OpCode::BXor | OpCode::BXorK => ArithOp::BXor,
        OpCode::Shl => ArithOp::Shl,
        OpCode::Shr => ArithOp::Shr,
        _ => unreachable!("not an arithmetic opcode"),
    }
}

/// Run the numeric fast path for a binary operator. On success the
/// following metamethod instruction is skipped; a non-numeric operand
/// falls through to it instead.
#[allow(clippy::too_many_arguments)]
fn arith_fast_path(
    vm: &mut Vm,
    ci_idx: usize,
    base: usize,
    a: usize,
    pc: usize,
    aop: ArithOp,
    vb: TValue,
    vc: TValue,
) -> Result<(), SolError> {
    match arith::raw_arith(aop, vb, vc) {
        Ok(v) => {
            vm.stack[base + a] = v;
            vm.call_stack[ci_idx].saved_pc = pc + 2;
            Ok(())
        }
        Err(ArithFail::NonNumeric) => Ok(()), // the MMBIN* instruction decides
        Err(ArithFail::DivZero(sym)) => Err(error::run_error(
            vm,
            format!("attempt to perform 'n{sym}0'"),
        )),
    }
}
