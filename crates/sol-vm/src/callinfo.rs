//! Call frame information for the VM.

use sol_core::heap::ClosureIdx;

/// Call-status bits on a frame.
pub mod call_status {
    /// Frame was entered through a tail call; its caller is gone.
    pub const TAIL: u8 = 1 << 0;
    /// Frame is currently running a debug hook.
    pub const HOOKED: u8 = 1 << 1;
    /// Frame is running a finalizer.
    pub const FIN: u8 = 1 << 2;
    /// Transfer information (`first_transfer`/`n_transfer`) is valid.
    pub const TRAN: u8 = 1 << 3;
    /// A hook yielded while this frame was current; consumed on resume.
    pub const HOOKYIELD: u8 = 1 << 4;
}

/// A call frame on the VM call stack. Frames form the `previous` chain
/// implicitly: the frame below in the vector is the caller, and an empty
/// vector is the sentinel state with no active call.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Stack base for registers in this frame (`func_stack_idx + 1`).
    pub base: usize,
    /// Index of the next instruction to execute. The instruction
    /// currently executing is `saved_pc - 1`.
    pub saved_pc: usize,
    /// Expected number of results (-1 = all).
    pub num_results: i32,
    /// Index into the VM's prototype store (script frames).
    pub proto_idx: usize,
    /// Whether this is a script call (vs native).
    pub is_lua: bool,
    /// The closure being executed (script frames).
    pub closure_idx: Option<ClosureIdx>,
    /// Stack slot holding the function value. For vararg functions this
    /// is the relocated position, above the stashed extra arguments.
    pub func_stack_idx: usize,
    /// One past the last stack slot belonging to this frame.
    pub top: usize,
    /// Number of extra (vararg) arguments stored below `func_stack_idx`.
    pub n_extra_args: usize,
    /// When set, the interpreter consults the hook engine before every
    /// instruction of this frame.
    pub trap: bool,
    /// Bitset over `call_status`.
    pub call_status: u8,
    /// First transferred value, as an offset from `func_stack_idx`.
    pub first_transfer: usize,
    /// Number of transferred values.
    pub n_transfer: usize,
}

impl CallInfo {
    pub fn new(base: usize, proto_idx: usize) -> Self {
        CallInfo {
            base,
            saved_pc: 0,
            num_results: -1,
            proto_idx,
            is_lua: true,
            closure_idx: None,
            func_stack_idx: 0,
            top: base,
            n_extra_args: 0,
            trap: false,
            call_status: 0,
            first_transfer: 0,
            n_transfer: 0,
        }
    }

    /// Index of the instruction currently executing, or -1 when the frame
    /// has not started yet.
    pub fn current_pc(&self) -> i32 {
        debug_assert!(self.is_lua);
        self.saved_pc as i32 - 1
    }
}
