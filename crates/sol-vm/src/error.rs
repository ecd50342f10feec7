//! Runtime errors and the constructors that enrich them with source
//! location and variable-description context.

use crate::arith::to_integer;
use crate::debug;
use crate::dispatch;
use crate::vm::Vm;
use sol_core::object::{chunk_id, type_name};
use sol_core::string::{StringId, StringInterner};
use sol_core::value::TValue;
use std::fmt;

/// A Sol runtime error.
#[derive(Clone, Debug)]
pub enum SolError {
    /// Runtime error with a formatted message.
    Runtime(String),
    /// An arbitrary Sol value thrown as an error (or produced by the
    /// installed message handler).
    Value(TValue),
    /// Too many nested calls.
    StackOverflow,
    /// An error occurred while running the message handler.
    ErrErr,
    /// A hook suspended execution; resume through the dispatch loop.
    Yield,
}

impl SolError {
    /// Convert this error into a value suitable for protected-call
    /// results.
    pub fn to_value(&self, strings: &mut StringInterner) -> TValue {
        match self {
            SolError::Runtime(msg) => TValue::from_string_id(strings.intern(msg.as_bytes())),
            SolError::Value(v) => *v,
            SolError::StackOverflow => {
                TValue::from_string_id(strings.intern(b"stack overflow"))
            }
            SolError::ErrErr => {
                TValue::from_string_id(strings.intern(b"error in error handling"))
            }
            SolError::Yield => TValue::from_string_id(strings.intern(b"yield")),
        }
    }
}

impl fmt::Display for SolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolError::Runtime(msg) => write!(f, "{msg}"),
            SolError::Value(v) => write!(f, "{v:?}"),
            SolError::StackOverflow => write!(f, "stack overflow"),
            SolError::ErrErr => write!(f, "error in error handling"),
            SolError::Yield => write!(f, "yield"),
        }
    }
}

impl std::error::Error for SolError {}

/// Where a blamed value lives, so its description can be recovered by
/// symbolic execution. Raw pointer identity is not available here; error
/// sites record the register or upvalue they were operating on instead.
#[derive(Clone, Copy, Debug)]
pub enum VarLoc {
    /// A register of the current frame.
    Reg(u32),
    /// Upvalue storage of the current closure.
    Upvalue(usize),
    /// Origin not tracked; no description is produced.
    Unknown,
}

/// Build a description like ` (local 'x')` for the value at `loc`,
/// or an empty string when nothing can be said about it.
pub fn varinfo(vm: &Vm, loc: VarLoc) -> String {
    let Some(ci) = vm.call_stack.last() else {
        return String::new();
    };
    if !ci.is_lua {
        return String::new();
    }
    let p = &vm.protos[ci.proto_idx];
    let (kind, name) = match loc {
        VarLoc::Upvalue(i) => ("upvalue", debug::upval_name(p, i, &vm.strings)),
        VarLoc::Reg(r) => match debug::obj_name(p, &vm.strings, ci.current_pc(), r) {
            Some(found) => found,
            None => return String::new(),
        },
        VarLoc::Unknown => return String::new(),
    };
    format!(" ({kind} '{name}')")
}

/// Raise a type error for applying `op` to the value `o`.
pub fn type_error(vm: &mut Vm, o: TValue, op: &str, loc: VarLoc) -> SolError {
    let extra = varinfo(vm, loc);
    run_error(
        vm,
        format!("attempt to {op} a {} value{extra}", type_name(o)),
    )
}

/// Raise an error for calling a non-callable object. Prefers a name
/// derived from the calling instruction; falls back to `varinfo`.
pub fn call_error(vm: &mut Vm, o: TValue, loc: VarLoc) -> SolError {
    let named = vm
        .call_stack
        .len()
        .checked_sub(1)
        .and_then(|ci_idx| debug::func_name_from_call(vm, ci_idx));
    let extra = match named {
        Some((kind, name)) => format!(" ({kind} '{name}')"),
        None => varinfo(vm, loc),
    };
    run_error(
        vm,
        format!("attempt to call a {} value{extra}", type_name(o)),
    )
}

/// Raise an error for a non-numeric `for` control value.
pub fn for_error(vm: &mut Vm, o: TValue, what: &str) -> SolError {
    run_error(
        vm,
        format!("bad 'for' {what} (number expected, got {})", type_name(o)),
    )
}

/// Raise a concatenation error, blaming the operand that cannot convert
/// to a string.
pub fn concat_error(
    vm: &mut Vm,
    p1: TValue,
    loc1: VarLoc,
    p2: TValue,
    loc2: VarLoc,
) -> SolError {
    let (bad, loc) = if crate::arith::concatable(p1) {
        (p2, loc2)
    } else {
        (p1, loc1)
    };
    type_error(vm, bad, "concatenate", loc)
}

/// Raise an arithmetic/bitwise type error, blaming the first non-numeric
/// operand.
pub fn op_inter_error(
    vm: &mut Vm,
    p1: TValue,
    loc1: VarLoc,
    p2: TValue,
    loc2: VarLoc,
    msg: &str,
) -> SolError {
    let (bad, loc) = if !p1.is_number() { (p1, loc1) } else { (p2, loc2) };
    type_error(vm, bad, msg, loc)
}

/// Raise an error when both operands are numbers but one has no integer
/// representation.
pub fn to_int_error(
    vm: &mut Vm,
    p1: TValue,
    loc1: VarLoc,
    p2: TValue,
    loc2: VarLoc,
) -> SolError {
    let (bad, loc) = if to_integer(p1).is_none() {
        (p1, loc1)
    } else {
        (p2, loc2)
    };
    let extra = varinfo(vm, loc);
    run_error(
        vm,
        format!("number{extra} has no integer representation"),
    )
}

/// Raise a comparison error between two incomparable values.
pub fn order_error(vm: &mut Vm, p1: TValue, p2: TValue) -> SolError {
    let t1 = type_name(p1);
    let t2 = type_name(p2);
    if t1 == t2 {
        run_error(vm, format!("attempt to compare two {t1} values"))
    } else {
        run_error(vm, format!("attempt to compare {t1} with {t2}"))
    }
}

/// Prefix a message with `source:line: `, using `?` when the source is
/// absent.
pub fn add_info(vm: &Vm, msg: &str, source: Option<StringId>, line: i32) -> String {
    let id = match source {
        Some(s) => chunk_id(vm.strings.get_bytes(s)),
        None => "?".to_string(),
    };
    format!("{id}:{line}: {msg}")
}

/// Finish raising an error: hand the message to the installed message
/// handler (called with no yield permitted), or wrap it as-is.
pub fn error_msg(vm: &mut Vm, msg: TValue) -> SolError {
    if let Some(slot) = vm.errfunc {
        let handler = vm.stack[slot];
        debug_assert!(handler.is_function());
        let errfunc = vm.errfunc.take(); // handler must not re-enter itself
        vm.nny += 1;
        let result = dispatch::call_function(vm, handler, &[msg]);
        vm.nny -= 1;
        vm.errfunc = errfunc;
        return match result {
            Ok(vals) => SolError::Value(vals.first().copied().unwrap_or(TValue::nil())),
            Err(_) => SolError::ErrErr,
        };
    }
    match msg {
        TValue::Str(id) => SolError::Runtime(vm.strings.get_str(id).into_owned()),
        v => SolError::Value(v),
    }
}

/// Raise a runtime error with a formatted message, prefixed with
/// `source:line` when the current frame is a script frame.
pub fn run_error(vm: &mut Vm, msg: String) -> SolError {
    let full = match vm.call_stack.last() {
        Some(ci) if ci.is_lua => {
            let p = &vm.protos[ci.proto_idx];
            let line = p.get_line(ci.current_pc());
            add_info(vm, &msg, p.source, line)
        }
        _ => msg,
    };
    let val = TValue::from_string_id(vm.strings.intern(full.as_bytes()));
    error_msg(vm, val)
}
