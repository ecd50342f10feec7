//! Execution tracing: call, line, count, and return hooks.
//!
//! The dispatch loop calls into this engine at function entry
//! (`trace_call`) and, while any frame has its trap set, before every
//! instruction (`trace_exec`). Hook state lives on the `Vm`; the hook
//! itself is re-checked for presence immediately before each dispatch, so
//! a handler swapping hooks out from under a pending trap costs at most
//! one spurious consultation.

use crate::callinfo::call_status;
use crate::error::SolError;
use crate::vm::{ThreadStatus, Vm};
use std::rc::Rc;

/// Hook mask bits.
pub const MASK_CALL: u8 = 1 << 0;
pub const MASK_RET: u8 = 1 << 1;
pub const MASK_LINE: u8 = 1 << 2;
pub const MASK_COUNT: u8 = 1 << 3;

/// Event delivered to a hook, with the current line (or -1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Ret,
    TailCall,
    Line,
    Count,
}

/// A user-installed hook. Hooks run with the frame transiently marked
/// `HOOKED` and may inspect the VM through the debug API; an error return
/// unwinds the interpreter.
pub type Hook = Rc<dyn Fn(&mut Vm, HookEvent, i32) -> Result<(), SolError>>;

impl Vm {
    /// Install (or remove) the hook. `count` is the instruction budget
    /// between count hooks. A non-zero mask re-arms the trap on every
    /// active script frame; removal leaves traps undisturbed, so idle
    /// frames clear them lazily.
    pub fn set_hook(&mut self, hook: Option<Hook>, mask: u8, count: i32) {
        let (hook, mask) = match hook {
            Some(h) if mask != 0 => (Some(h), mask),
            _ => (None, 0), // turn off hooks
        };
        self.hook = hook;
        self.base_hook_count = count;
        self.hook_count = count;
        self.hook_mask = mask;
        if mask != 0 {
            set_traps(self);
        }
    }

    pub fn get_hook(&self) -> Option<Hook> {
        self.hook.clone()
    }

    pub fn get_hook_mask(&self) -> u8 {
        self.hook_mask
    }

    pub fn get_hook_count(&self) -> i32 {
        self.base_hook_count
    }
}

/// Arm the trap on every active script frame.
pub fn set_traps(vm: &mut Vm) {
    for ci in vm.call_stack.iter_mut() {
        if ci.is_lua {
            ci.trap = true;
        }
    }
}

/// Dispatch the installed hook for `event`. Saves and restores the stack
/// top and the frame's status bits around the call; transfer information
/// is published on the frame while the hook runs.
pub fn call_hook(
    vm: &mut Vm,
    event: HookEvent,
    line: i32,
    ftransfer: usize,
    ntransfer: usize,
) -> Result<(), SolError> {
    let hook = match &vm.hook {
        Some(h) if vm.allow_hook => Rc::clone(h),
        _ => return Ok(()),
    };
    let ci_idx = vm.call_stack.len() - 1;
    let saved_top = vm.stack_top;
    let saved_ci_top = vm.call_stack[ci_idx].top;
    let mut mask = call_status::HOOKED;
    if ntransfer != 0 {
        mask |= call_status::TRAN;
        vm.call_stack[ci_idx].first_transfer = ftransfer;
        vm.call_stack[ci_idx].n_transfer = ntransfer;
    }
    if vm.call_stack[ci_idx].is_lua && vm.stack_top < saved_ci_top {
        // protect the frame's whole register area from the hook
        vm.stack_top = saved_ci_top;
    }
    vm.ensure_stack(vm.stack_top, 20);
    vm.allow_hook = false; // hooks do not nest
    vm.call_stack[ci_idx].call_status |= mask;
    let result = hook(vm, event, line);
    vm.allow_hook = true;
    vm.call_stack[ci_idx].top = saved_ci_top;
    vm.stack_top = saved_top;
    vm.call_stack[ci_idx].call_status &= !mask;
    result
}

/// Fire the call (or tail-call) hook for the just-entered frame. The pc
/// is transiently advanced so the frame introspects as executing its
/// first instruction.
pub fn hook_call(vm: &mut Vm) -> Result<(), SolError> {
    vm.oldpc = 0; // fresh function: any line counts as new
    if vm.hook_mask & MASK_CALL != 0 {
        let ci_idx = vm.call_stack.len() - 1;
        let event = if vm.call_stack[ci_idx].call_status & call_status::TAIL != 0 {
            HookEvent::TailCall
        } else {
            HookEvent::Call
        };
        let nparams = vm.protos[vm.call_stack[ci_idx].proto_idx].num_params as usize;
        vm.call_stack[ci_idx].saved_pc += 1;
        let result = call_hook(vm, event, -1, 1, nparams);
        vm.call_stack[ci_idx].saved_pc -= 1;
        result?;
    }
    Ok(())
}

/// Fire the return hook before results are moved to the caller.
/// `first_res` is the absolute stack slot of the first result.
pub fn ret_hook(vm: &mut Vm, first_res: usize, nres: usize) -> Result<(), SolError> {
    if vm.hook_mask & MASK_RET != 0 {
        let ci_idx = vm.call_stack.len() - 1;
        let ci = &vm.call_stack[ci_idx];
        let mut func = ci.func_stack_idx;
        if ci.is_lua {
            let p = &vm.protos[ci.proto_idx];
            if p.is_vararg {
                // report transfers relative to the virtual function slot
                func -= ci.n_extra_args + p.num_params as usize + 1;
            }
        }
        let ftransfer = first_res - func;
        call_hook(vm, HookEvent::Ret, -1, ftransfer, nres)?;
    }
    Ok(())
}

/// Trace entry into a script function: arm the trap and, for a
/// non-vararg function at its first instruction, fire the call hook.
/// Vararg functions fire it from their prelude instruction instead, so
/// line/count hooks cannot run before the call hook.
pub fn trace_call(vm: &mut Vm) -> Result<(), SolError> {
    let ci_idx = vm.call_stack.len() - 1;
    vm.call_stack[ci_idx].trap = true;
    if vm.call_stack[ci_idx].saved_pc == 0 {
        let p = &vm.protos[vm.call_stack[ci_idx].proto_idx];
        if p.is_vararg {
            return Ok(()); // hooks will start at the prelude instruction
        }
        if vm.call_stack[ci_idx].call_status & call_status::HOOKYIELD == 0 {
            hook_call(vm)?;
        }
    }
    Ok(())
}

/// Trace one instruction of the current frame, firing count and line
/// hooks as scheduled. `pc` is the instruction about to execute.
/// Returns whether the trap must stay armed.
pub fn trace_exec(vm: &mut Vm, pc: usize) -> Result<bool, SolError> {
    let ci_idx = vm.call_stack.len() - 1;
    let mask = vm.hook_mask;
    if mask & (MASK_LINE | MASK_COUNT) == 0 {
        vm.call_stack[ci_idx].trap = false; // no need to stop again
        return Ok(false);
    }
    // reference is always the next instruction
    vm.call_stack[ci_idx].saved_pc = pc + 1;
    let mut counthook = false;
    if mask & MASK_COUNT != 0 {
        vm.hook_count -= 1;
        counthook = vm.hook_count == 0;
    }
    if counthook {
        vm.hook_count = vm.base_hook_count; // reset count
    } else if mask & MASK_LINE == 0 {
        return Ok(true); // no line hook and count != 0; nothing to do now
    }
    if vm.call_stack[ci_idx].call_status & call_status::HOOKYIELD != 0 {
        // hook yielded on this very instruction; do not fire again
        vm.call_stack[ci_idx].call_status &= !call_status::HOOKYIELD;
        return Ok(true);
    }
    let proto_idx = vm.call_stack[ci_idx].proto_idx;
    if !vm.protos[proto_idx].code[pc].uses_top() {
        // the hook may run arbitrary code; trim the exposed stack
        vm.stack_top = vm.call_stack[ci_idx].top;
    }
    if counthook {
        call_hook(vm, HookEvent::Count, -1, 0, 0)?;
    }
    if mask & MASK_LINE != 0 {
        // oldpc may be stale after unusual re-entries; a wrong but valid
        // value at most costs an extra line hook
        let sizecode = vm.protos[proto_idx].code_len();
        let oldpc = if vm.oldpc < sizecode { vm.oldpc } else { 0 };
        let npci = pc;
        if npci <= oldpc || vm.protos[proto_idx].changed_line(oldpc as i32, npci as i32) {
            let newline = vm.protos[proto_idx].get_line(npci as i32);
            call_hook(vm, HookEvent::Line, newline, 0, 0)?;
        }
        vm.oldpc = npci;
    }
    if vm.status == ThreadStatus::Yield {
        if vm.nny > 0 {
            vm.status = ThreadStatus::Ok; // cannot suspend here
        } else {
            if counthook {
                vm.hook_count = 1; // undo decrement to zero
            }
            // undo the pc advance: the instruction did not run, and the
            // resumed dispatch must execute it (HOOKYIELD suppresses the
            // second round of hooks)
            vm.call_stack[ci_idx].saved_pc = pc;
            vm.call_stack[ci_idx].call_status |= call_status::HOOKYIELD;
            return Err(SolError::Yield);
        }
    }
    Ok(true)
}
