//! Sol VM state.

use crate::callinfo::CallInfo;
use crate::error::SolError;
use crate::metamethod::TmNames;
use crate::trace::Hook;
use sol_bytecode::proto::Proto;
use sol_core::heap::{Heap, TableIdx, UpValIdx, UpValLocation};
use sol_core::string::StringInterner;
use sol_core::value::TValue;

/// Execution status of the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Ok,
    /// A hook asked to suspend; the dispatch loop unwinds and can be
    /// resumed at the saved program counter.
    Yield,
}

/// A native (Rust) function callable from Sol code. Arguments are read
/// through `Vm::native_arg`; returned values become the call results.
pub type NativeFn = fn(&mut Vm) -> Result<Vec<TValue>, SolError>;

pub struct NativeFunction {
    pub func: NativeFn,
    pub name: &'static str,
}

/// The Sol virtual machine.
pub struct Vm {
    /// Value stack (registers).
    pub stack: Vec<TValue>,
    /// Call stack. The last frame is the current one; the frame below a
    /// frame is its caller.
    pub call_stack: Vec<CallInfo>,
    /// Object heap.
    pub heap: Heap,
    /// String interner.
    pub strings: StringInterner,
    /// Top of stack (index of first free slot).
    pub stack_top: usize,
    /// Prototype store; closures refer into it by index.
    pub protos: Vec<Proto>,
    /// Registered native functions.
    pub natives: Vec<NativeFunction>,
    /// Open upvalues sorted by stack index (descending).
    pub open_upvals: Vec<(usize, UpValIdx)>,
    /// The globals table (`_ENV` of top-level closures).
    pub globals: TableIdx,
    /// Interned metamethod names.
    pub tm_names: TmNames,
    /// Max call depth before stack overflow.
    pub max_call_depth: usize,

    // --- Hook state ---
    /// The installed hook, checked for `Some` immediately before each
    /// dispatch.
    pub hook: Option<Hook>,
    /// Bitset over `trace::MASK_*`; zero iff `hook` is unset.
    pub hook_mask: u8,
    /// Instruction budget reloaded into `hook_count` after each count
    /// hook. Advisory: a torn value costs at most one hook call.
    pub base_hook_count: i32,
    /// Live countdown for the count hook.
    pub hook_count: i32,
    /// PC of the last line-hook dispatch, for detecting line changes.
    pub oldpc: usize,
    /// Cleared while a hook runs so hooks never nest.
    pub allow_hook: bool,

    // --- Error/yield bookkeeping ---
    pub status: ThreadStatus,
    /// Stack slot of the installed message handler, if any.
    pub errfunc: Option<usize>,
    /// Depth of non-yieldable calls; hook yields are refused when nonzero.
    pub nny: u32,
}

impl Vm {
    pub fn new() -> Self {
        let mut strings = StringInterner::new();
        let tm_names = TmNames::init(&mut strings);
        let mut heap = Heap::new();
        let globals = heap.alloc_table(0, 16);
        Vm {
            stack: vec![TValue::nil(); 1024],
            call_stack: Vec::new(),
            heap,
            strings,
            stack_top: 0,
            protos: Vec::new(),
            natives: Vec::new(),
            open_upvals: Vec::new(),
            globals,
            tm_names,
            max_call_depth: 200,
            hook: None,
            hook_mask: 0,
            base_hook_count: 0,
            hook_count: 0,
            oldpc: 0,
            allow_hook: true,
            status: ThreadStatus::Ok,
            errfunc: None,
            nny: 0,
        }
    }

    /// Ensure the stack has at least `size` slots from `base`.
    pub fn ensure_stack(&mut self, base: usize, size: usize) {
        let needed = base + size;
        if needed > self.stack.len() {
            self.stack.resize(needed, TValue::nil());
        }
    }

    pub fn push(&mut self, val: TValue) {
        self.ensure_stack(self.stack_top, 1);
        self.stack[self.stack_top] = val;
        self.stack_top += 1;
    }

    pub fn pop(&mut self) -> TValue {
        debug_assert!(self.stack_top > 0);
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    /// Store a prototype, returning its index.
    pub fn add_proto(&mut self, proto: Proto) -> usize {
        let idx = self.protos.len();
        self.protos.push(proto);
        idx
    }

    /// Register a native function and return it as a value.
    pub fn register_native(&mut self, name: &'static str, func: NativeFn) -> TValue {
        let id = sol_core::value::NativeId(self.natives.len() as u32);
        self.natives.push(NativeFunction { func, name });
        TValue::from_native(id)
    }

    /// Bind a global by name.
    pub fn set_global(&mut self, name: &str, val: TValue) {
        let key = self.strings.intern(name.as_bytes());
        self.heap.get_table_mut(self.globals).raw_set_str(key, val);
    }

    /// Argument `i` (0-based) of the currently running native function.
    pub fn native_arg(&self, i: usize) -> TValue {
        let ci = self.call_stack.last().expect("no active call");
        debug_assert!(!ci.is_lua);
        if ci.base + i < ci.top {
            self.stack[ci.base + i]
        } else {
            TValue::nil()
        }
    }

    /// Number of arguments of the currently running native function.
    pub fn native_nargs(&self) -> usize {
        let ci = self.call_stack.last().expect("no active call");
        debug_assert!(!ci.is_lua);
        ci.top - ci.base
    }

    /// Get an upvalue's current value.
    pub fn get_upval_value(&self, uv_idx: UpValIdx) -> TValue {
        match self.heap.get_upval(uv_idx).location {
            UpValLocation::Open(stack_idx) => self.stack[stack_idx],
            UpValLocation::Closed(val) => val,
        }
    }

    /// Set an upvalue's value.
    pub fn set_upval_value(&mut self, uv_idx: UpValIdx, val: TValue) {
        match self.heap.get_upval(uv_idx).location {
            UpValLocation::Open(stack_idx) => {
                self.stack[stack_idx] = val;
            }
            UpValLocation::Closed(_) => {
                self.heap.get_upval_mut(uv_idx).location = UpValLocation::Closed(val);
            }
        }
    }

    /// Find or create an open upvalue for the given stack index.
    pub fn find_or_create_open_upval(&mut self, stack_idx: usize) -> UpValIdx {
        for &(si, uv_idx) in &self.open_upvals {
            if si == stack_idx {
                return uv_idx;
            }
        }
        let uv_idx = self.heap.alloc_upval(UpValLocation::Open(stack_idx));
        self.open_upvals.push((stack_idx, uv_idx));
        self.open_upvals.sort_by(|a, b| b.0.cmp(&a.0));
        uv_idx
    }

    /// Close all open upvalues at or above the given stack level.
    pub fn close_upvalues(&mut self, level: usize) {
        let mut i = 0;
        while i < self.open_upvals.len() {
            let (stack_idx, uv_idx) = self.open_upvals[i];
            if stack_idx >= level {
                let val = self.stack[stack_idx];
                self.heap.get_upval_mut(uv_idx).location = UpValLocation::Closed(val);
                self.open_upvals.remove(i);
            } else {
                i += 1;
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
