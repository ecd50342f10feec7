//! Debug and introspection core: call-stack inspection, symbolic
//! execution over bytecode, and debug-info assembly.
//!
//! Symbolic execution reconstructs a best-effort name and kind for the
//! value in a register by scanning the instructions that could have
//! written it. It never fails hard: an unknown origin yields no name and
//! callers fall back to `?` placeholders.

use crate::callinfo::{call_status, CallInfo};
use crate::vm::Vm;
use sol_bytecode::opcode::{Instruction, OpCode};
use sol_bytecode::proto::{Constant, Proto};
use sol_core::object::chunk_id;
use sol_core::string::StringInterner;
use sol_core::value::TValue;

/// Name of the implicit environment upvalue; table accesses through it
/// are reported as globals.
pub const ENV_NAME: &str = "_ENV";

/// A filled-in debug record. The info assembler writes the subset of
/// fields selected by the tag string handed to `Vm::get_info`.
#[derive(Clone, Debug, Default)]
pub struct DebugInfo {
    /// Raw source identifier, including its leading marker.
    pub source: String,
    /// Printable form of `source`.
    pub short_src: String,
    /// `"Sol"`, `"C"`, or `"main"`.
    pub what: &'static str,
    pub line_defined: i32,
    pub last_line_defined: i32,
    pub current_line: i32,
    /// A reasonable name for the function, when one can be derived.
    pub name: Option<String>,
    /// What the name is: `"global"`, `"local"`, `"method"`, `"field"`,
    /// `"upvalue"`, `"hook"`, `"metamethod"`, `"for iterator"`, or `""`.
    pub name_what: &'static str,
    pub n_ups: u32,
    pub n_params: u32,
    pub is_vararg: bool,
    pub is_tail_call: bool,
    /// Offset (from the function slot) of the first transferred value.
    pub f_transfer: usize,
    /// Number of transferred values.
    pub n_transfer: usize,
    /// Opaque frame handle for follow-up queries on the same activation.
    pub i_ci: Option<usize>,
}

/// Declared name of upvalue `uv`, or `?` when debug info was stripped.
pub fn upval_name(p: &Proto, uv: usize, strings: &StringInterner) -> String {
    match p.upvalues.get(uv).and_then(|d| d.name) {
        Some(id) => strings.get_str(id).into_owned(),
        None => "?".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Frame walker
// ---------------------------------------------------------------------------

/// Locate the named local or vararg `n` of the frame `ci_idx`, returning
/// its display name and absolute stack slot.
///
/// Positive `n` counts locals live at the frame's current pc, falling
/// back to `(temporary)` / `(C temporary)` for unnamed slots inside the
/// frame's active region. Negative `n` indexes the frame's extra
/// (vararg) arguments.
pub fn find_local(vm: &Vm, ci_idx: usize, n: i32) -> Option<(String, usize)> {
    let ci = &vm.call_stack[ci_idx];
    let base = ci.func_stack_idx + 1;
    let mut name = None;
    if ci.is_lua {
        if n < 0 {
            return find_vararg(vm, ci, n);
        }
        let p = &vm.protos[ci.proto_idx];
        name = p
            .get_local_name(n as u32, ci.current_pc())
            .map(|id| vm.strings.get_str(id).into_owned());
    }
    if name.is_none() {
        // not a declared variable; accept any slot in the active region
        let limit = if ci_idx + 1 == vm.call_stack.len() {
            vm.stack_top
        } else {
            vm.call_stack[ci_idx + 1].func_stack_idx
        };
        if n > 0 && limit as i64 - base as i64 >= n as i64 {
            let generic = if ci.is_lua { "(temporary)" } else { "(C temporary)" };
            name = Some(generic.to_string());
        } else {
            return None;
        }
    }
    Some((name.unwrap(), base + (n - 1) as usize))
}

fn find_vararg(vm: &Vm, ci: &CallInfo, n: i32) -> Option<(String, usize)> {
    if vm.protos[ci.proto_idx].is_vararg {
        let nextra = ci.n_extra_args as i64;
        if n as i64 >= -nextra {
            // varargs sit immediately below the relocated function slot
            let pos = ci.func_stack_idx as i64 - nextra - (n as i64 + 1);
            return Some(("(vararg)".to_string(), pos as usize));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Symbolic executor
// ---------------------------------------------------------------------------

/// Instructions before a pending jump target sit inside a conditional
/// region; the scan cannot prove they executed.
fn filter_pc(pc: i32, jmptarget: i32) -> i32 {
    if pc < jmptarget {
        -1
    } else {
        pc
    }
}

/// Find the last instruction before `lastpc` that provably wrote `reg`.
/// Returns -1 when the origin is unknown.
pub fn find_set_reg(p: &Proto, mut lastpc: i32, reg: u32) -> i32 {
    let mut setreg = -1;
    let mut jmptarget = 0;
    if p.code[lastpc as usize].opcode().calls_metamethod() {
        lastpc -= 1; // the instruction at lastpc has not run yet
    }
    for pc in 0..lastpc {
        let i = p.code[pc as usize];
        let op = i.opcode();
        let a = i.a() as u32;
        let change = match op {
            OpCode::LoadNil => {
                // sets registers a..=a+b
                let b = i.b() as u32;
                a <= reg && reg <= a + b
            }
            OpCode::TForCall => reg >= a + 2, // affects all regs above its base
            OpCode::Call | OpCode::TailCall => reg >= a, // affects all regs above base
            OpCode::Jmp => {
                let dest = pc + 1 + i.get_sj();
                // jump within the scan window, landing past the current target?
                if dest <= lastpc && dest > jmptarget {
                    jmptarget = dest;
                }
                false
            }
            _ => op.sets_register_a() && reg == a,
        };
        if change {
            setreg = filter_pc(pc, jmptarget);
        }
    }
    setreg
}

/// Name for the constant at `index`: string constants name themselves,
/// anything else is a `?`.
fn kname(p: &Proto, index: usize, strings: &StringInterner) -> (Option<&'static str>, String) {
    match p.constants.get(index) {
        Some(Constant::String(id)) => (Some("constant"), strings.get_str(*id).into_owned()),
        _ => (None, "?".to_string()),
    }
}

/// Name a register from locals, upvalue loads, or constant loads. On
/// return, `ppc` holds the pc of the writing instruction (or -1).
pub fn basic_obj_name(
    p: &Proto,
    strings: &StringInterner,
    ppc: &mut i32,
    reg: u32,
) -> Option<(&'static str, String)> {
    // MOVE chains recurse toward smaller registers; the cap only guards
    // against malformed bytecode
    basic_obj_name_rec(p, strings, ppc, reg, p.code_len() as u32 + 1)
}

fn basic_obj_name_rec(
    p: &Proto,
    strings: &StringInterner,
    ppc: &mut i32,
    reg: u32,
    depth: u32,
) -> Option<(&'static str, String)> {
    if depth == 0 {
        return None;
    }
    if let Some(id) = p.get_local_name(reg + 1, *ppc) {
        return Some(("local", strings.get_str(id).into_owned()));
    }
    // else try symbolic execution
    *ppc = find_set_reg(p, *ppc, reg);
    if *ppc != -1 {
        let i = p.code[*ppc as usize];
        match i.opcode() {
            OpCode::Move => {
                let b = i.b() as u32;
                if b < i.a() as u32 {
                    // the value in b still has its original meaning
                    return basic_obj_name_rec(p, strings, ppc, b, depth - 1);
                }
            }
            OpCode::GetUpval => {
                return Some(("upvalue", upval_name(p, i.b() as usize, strings)));
            }
            OpCode::LoadK => {
                let (kind, name) = kname(p, i.bx() as usize, strings);
                return kind.map(|k| (k, name));
            }
            OpCode::LoadKX => {
                let idx = p.code[*ppc as usize + 1].ax_field() as usize;
                let (kind, name) = kname(p, idx, strings);
                return kind.map(|k| (k, name));
            }
            _ => {}
        }
    }
    None
}

/// Name for a register holding a table key: only constants qualify.
fn rname(p: &Proto, pc: i32, c: u32, strings: &StringInterner) -> String {
    let mut pc = pc;
    match basic_obj_name(p, strings, &mut pc, c) {
        Some(("constant", name)) => name,
        _ => "?".to_string(),
    }
}

/// Name for the RK-encoded key of instruction `i`.
fn rk_name(p: &Proto, pc: i32, i: Instruction, strings: &StringInterner) -> String {
    if i.k() {
        kname(p, i.c() as usize, strings).1
    } else {
        rname(p, pc, i.c() as u32, strings)
    }
}

/// Classify a table access as a global or plain field lookup: it is a
/// global iff the indexed table is the environment, reached either as an
/// upvalue named `_ENV` or a local/upvalue variable of that name.
fn is_env(
    p: &Proto,
    pc: i32,
    i: Instruction,
    is_upvalue: bool,
    strings: &StringInterner,
) -> &'static str {
    let t = i.b() as usize;
    let name = if is_upvalue {
        Some(upval_name(p, t, strings))
    } else {
        let mut pc = pc;
        match basic_obj_name(p, strings, &mut pc, t as u32) {
            Some(("local", n)) | Some(("upvalue", n)) => Some(n),
            _ => None, // not a variable; cannot be _ENV
        }
    };
    if name.as_deref() == Some(ENV_NAME) {
        "global"
    } else {
        "field"
    }
}

/// Extend `basic_obj_name` to table accesses: fields, globals, methods.
pub fn obj_name(
    p: &Proto,
    strings: &StringInterner,
    lastpc: i32,
    reg: u32,
) -> Option<(&'static str, String)> {
    let mut pc = lastpc;
    if let Some(found) = basic_obj_name(p, strings, &mut pc, reg) {
        return Some(found);
    }
    if pc == -1 {
        return None;
    }
    let i = p.code[pc as usize];
    match i.opcode() {
        OpCode::GetTabUp => {
            let (_, name) = kname(p, i.c() as usize, strings);
            Some((is_env(p, pc, i, true, strings), name))
        }
        OpCode::GetTable => {
            let name = rname(p, pc, i.c() as u32, strings);
            Some((is_env(p, pc, i, false, strings), name))
        }
        OpCode::GetI => Some(("field", "integer index".to_string())),
        OpCode::GetField => {
            let (_, name) = kname(p, i.c() as usize, strings);
            Some((is_env(p, pc, i, false, strings), name))
        }
        OpCode::Self_ => Some(("method", rk_name(p, pc, i, strings))),
        _ => None,
    }
}

/// Derive a name for the function called by the instruction at `pc`.
pub fn func_name_from_code(
    p: &Proto,
    strings: &StringInterner,
    pc: i32,
) -> Option<(&'static str, String)> {
    use crate::metamethod::Tm;
    let i = p.code[pc as usize];
    let tm = match i.opcode() {
        OpCode::Call | OpCode::TailCall => {
            return obj_name(p, strings, pc, i.a() as u32);
        }
        OpCode::TForCall => {
            return Some(("for iterator", "for iterator".to_string()));
        }
        // other instructions call through metamethods
        OpCode::Self_
        | OpCode::GetTabUp
        | OpCode::GetTable
        | OpCode::GetI
        | OpCode::GetField => Tm::Index,
        OpCode::SetTabUp | OpCode::SetTable | OpCode::SetI | OpCode::SetField => Tm::NewIndex,
        OpCode::MMBin | OpCode::MMBinI | OpCode::MMBinK => Tm::from_u8(i.c())?,
        OpCode::Unm => Tm::Unm,
        OpCode::BNot => Tm::BNot,
        OpCode::Len => Tm::Len,
        OpCode::Concat => Tm::Concat,
        OpCode::Eq => Tm::Eq,
        OpCode::Lt | OpCode::LtI | OpCode::GtI => Tm::Lt,
        OpCode::Le | OpCode::LeI | OpCode::GeI => Tm::Le,
        OpCode::Close | OpCode::Return => Tm::Close,
        _ => return None,
    };
    Some(("metamethod", tm.event_name().to_string()))
}

/// Derive a name for the function running in frame `ci_idx` from how it
/// was called.
pub fn func_name_from_call(vm: &Vm, ci_idx: usize) -> Option<(&'static str, String)> {
    let ci = &vm.call_stack[ci_idx];
    if ci.call_status & call_status::HOOKED != 0 {
        Some(("hook", "?".to_string()))
    } else if ci.call_status & call_status::FIN != 0 {
        Some(("metamethod", "__gc".to_string()))
    } else if ci.is_lua {
        func_name_from_code(&vm.protos[ci.proto_idx], &vm.strings, ci.current_pc())
    } else {
        None
    }
}

/// Name for the function of frame `ci_idx`, derived from its caller's
/// code. Tail calls erase the caller, so they yield no name.
fn get_func_name(vm: &Vm, ci_idx: Option<usize>) -> Option<(&'static str, String)> {
    let ci_idx = ci_idx?;
    if vm.call_stack[ci_idx].call_status & call_status::TAIL != 0 {
        return None;
    }
    let caller = ci_idx.checked_sub(1)?;
    func_name_from_call(vm, caller)
}

// ---------------------------------------------------------------------------
// Info assembler and host API
// ---------------------------------------------------------------------------

fn func_info(vm: &Vm, ar: &mut DebugInfo, func: TValue) {
    match func.as_closure_idx() {
        None => {
            ar.source = "=[C]".to_string();
            ar.line_defined = -1;
            ar.last_line_defined = -1;
            ar.what = "C";
        }
        Some(cl) => {
            let p = &vm.protos[vm.heap.get_closure(cl).proto_idx];
            ar.source = match p.source {
                Some(s) => vm.strings.get_str(s).into_owned(),
                None => "=?".to_string(),
            };
            ar.line_defined = p.line_defined;
            ar.last_line_defined = p.last_line_defined;
            ar.what = if p.line_defined == 0 { "main" } else { "Sol" };
        }
    }
    ar.short_src = chunk_id(ar.source.as_bytes());
}

/// Build the set of lines with code in `func`: a table mapping each
/// active line to `true`, or nil for native functions.
fn collect_valid_lines(vm: &mut Vm, func: TValue) -> TValue {
    let Some(cl) = func.as_closure_idx() else {
        return TValue::nil();
    };
    let proto_idx = vm.heap.get_closure(cl).proto_idx;
    let p = &vm.protos[proto_idx];
    let mut lines = Vec::new();
    if !p.line_info.is_empty() {
        let mut current = p.line_defined;
        let mut start = 0;
        if p.is_vararg {
            // the mandatory prelude instruction is not user code
            debug_assert_eq!(p.code[0].opcode(), OpCode::VarArgPrep);
            current = p.next_line(current, 0);
            start = 1;
        }
        for pc in start..p.line_info.len() {
            current = p.next_line(current, pc);
            lines.push(current);
        }
    }
    let t = vm.heap.alloc_table(0, lines.len());
    let table = vm.heap.get_table_mut(t);
    for line in lines {
        table.raw_seti(line as i64, TValue::from_bool(true));
    }
    TValue::from_table(t)
}

fn aux_get_info(
    vm: &mut Vm,
    tags: &str,
    ar: &mut DebugInfo,
    func: TValue,
    ci_idx: Option<usize>,
) -> bool {
    let mut status = true;
    for t in tags.chars() {
        match t {
            'S' => func_info(vm, ar, func),
            'l' => {
                ar.current_line = match ci_idx {
                    Some(i) if vm.call_stack[i].is_lua => {
                        let ci = &vm.call_stack[i];
                        vm.protos[ci.proto_idx].get_line(ci.current_pc())
                    }
                    _ => -1,
                };
            }
            'u' => match func.as_closure_idx() {
                Some(cl) => {
                    let closure = vm.heap.get_closure(cl);
                    ar.n_ups = closure.upvalues.len() as u32;
                    let p = &vm.protos[closure.proto_idx];
                    ar.n_params = p.num_params as u32;
                    ar.is_vararg = p.is_vararg;
                }
                None => {
                    // native functions accept anything
                    ar.n_ups = 0;
                    ar.n_params = 0;
                    ar.is_vararg = true;
                }
            },
            't' => {
                ar.is_tail_call = ci_idx
                    .map_or(false, |i| vm.call_stack[i].call_status & call_status::TAIL != 0);
            }
            'n' => match get_func_name(vm, ci_idx) {
                Some((kind, name)) => {
                    ar.name_what = kind;
                    ar.name = Some(name);
                }
                None => {
                    ar.name_what = "";
                    ar.name = None;
                }
            },
            'r' => match ci_idx {
                Some(i) if vm.call_stack[i].call_status & call_status::TRAN != 0 => {
                    ar.f_transfer = vm.call_stack[i].first_transfer;
                    ar.n_transfer = vm.call_stack[i].n_transfer;
                }
                _ => {
                    ar.f_transfer = 0;
                    ar.n_transfer = 0;
                }
            },
            'f' | 'L' => {} // handled by get_info
            _ => status = false, // invalid option
        }
    }
    status
}

impl Vm {
    /// Get a debug record for the activation `level` frames below the
    /// current one (level 0). Returns nothing when fewer frames exist.
    pub fn get_stack(&self, level: i32) -> Option<DebugInfo> {
        if level < 0 {
            return None;
        }
        let idx = self.call_stack.len().checked_sub(1 + level as usize)?;
        Some(DebugInfo {
            i_ci: Some(idx),
            ..DebugInfo::default()
        })
    }

    /// Fill `ar` according to the tag characters in `what`. A leading `>`
    /// asks about a function value popped from the stack instead of a
    /// frame. Tags `f` and `L` push the function value / valid-lines
    /// table onto the stack, in that order. Returns false when an
    /// unknown tag was seen (the recognized ones are still processed).
    pub fn get_info(&mut self, what: &str, ar: &mut DebugInfo) -> bool {
        let (func, ci_idx, tags) = if let Some(tags) = what.strip_prefix('>') {
            let func = self.pop();
            assert!(func.is_function(), "function expected");
            (func, None, tags)
        } else {
            let ci_idx = ar.i_ci.expect("debug record does not hold a frame");
            let func = self.stack[self.call_stack[ci_idx].func_stack_idx];
            debug_assert!(func.is_function());
            (func, Some(ci_idx), what)
        };
        let status = aux_get_info(self, tags, ar, func, ci_idx);
        if tags.contains('f') {
            self.push(func);
        }
        if tags.contains('L') {
            let lines = collect_valid_lines(self, func);
            self.push(lines);
        }
        status
    }

    /// Read local `n` of the activation in `ar`, pushing its value and
    /// returning its name. With no record, inspects the function value on
    /// top of the stack and names its parameters (nothing is pushed).
    pub fn get_local(&mut self, ar: Option<&DebugInfo>, n: i32) -> Option<String> {
        match ar {
            None => {
                let func = self.stack[self.stack_top - 1];
                let cl = func.as_closure_idx()?;
                if n < 1 {
                    return None;
                }
                let p = &self.protos[self.heap.get_closure(cl).proto_idx];
                p.get_local_name(n as u32, 0)
                    .map(|id| self.strings.get_str(id).into_owned())
            }
            Some(ar) => {
                let ci_idx = ar.i_ci?;
                let (name, slot) = find_local(self, ci_idx, n)?;
                let val = self.stack[slot];
                self.push(val);
                Some(name)
            }
        }
    }

    /// Write the value on top of the stack into local `n` of the
    /// activation in `ar`, popping it and returning the local's name.
    /// The value stays on the stack when no such local exists.
    pub fn set_local(&mut self, ar: &DebugInfo, n: i32) -> Option<String> {
        let ci_idx = ar.i_ci?;
        let (name, slot) = find_local(self, ci_idx, n)?;
        let val = self.pop();
        self.stack[slot] = val;
        Some(name)
    }
}
