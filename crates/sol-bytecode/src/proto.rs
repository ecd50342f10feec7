//! Function prototypes: compiled bytecode, constants, and debug tables.
//!
//! The line table is stored compressed: one signed byte per instruction
//! holding the line delta from the previous instruction, with the
//! `ABS_LINE_INFO` sentinel redirecting to an absolute anchor in
//! `abs_line_info`. Anchors are placed at most every `MAX_INSTR_WITH_ABS`
//! instructions, so a lookup can jump close to the right place by integer
//! division instead of walking the whole function.

use crate::opcode::Instruction;
use sol_core::string::StringId;

/// Maximum number of instructions between two absolute line anchors.
pub const MAX_INSTR_WITH_ABS: i32 = 128;

/// Sentinel in `line_info` marking an instruction whose line can only be
/// read from `abs_line_info`.
pub const ABS_LINE_INFO: i8 = i8::MIN;

/// Line deltas at or beyond this magnitude cannot be stored inline.
const LINE_DIFF_LIMIT: i32 = 0x80;

/// A constant value in the constant pool.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(StringId),
}

/// Description of an upvalue.
#[derive(Clone, Debug)]
pub struct UpvalDesc {
    /// Declared name, absent when debug info was stripped.
    pub name: Option<StringId>,
    /// True if captured from the enclosing function's stack (not from
    /// another upvalue).
    pub in_stack: bool,
    /// Register index if `in_stack`, upvalue index in the parent otherwise.
    pub index: u8,
}

/// A local variable debug entry. Entries are ordered by `start_pc`.
#[derive(Clone, Debug)]
pub struct LocalVar {
    pub name: StringId,
    /// First PC where the variable is active.
    pub start_pc: u32,
    /// First PC where the variable is dead.
    pub end_pc: u32,
}

/// An absolute line anchor.
#[derive(Clone, Debug)]
pub struct AbsLineInfo {
    pub pc: i32,
    pub line: i32,
}

/// A compiled function prototype.
#[derive(Clone, Debug, Default)]
pub struct Proto {
    /// Bytecode instructions.
    pub code: Vec<Instruction>,
    /// Constant pool.
    pub constants: Vec<Constant>,
    /// Nested function prototypes.
    pub protos: Vec<Proto>,
    /// Upvalue descriptors.
    pub upvalues: Vec<UpvalDesc>,
    /// Number of fixed parameters.
    pub num_params: u8,
    /// Whether this function accepts varargs.
    pub is_vararg: bool,
    /// Maximum stack size needed.
    pub max_stack_size: u8,
    /// Source name (for error messages and `short_src`).
    pub source: Option<StringId>,
    /// Line where the function definition starts; 0 for a main chunk.
    pub line_defined: i32,
    /// Line where the function definition ends.
    pub last_line_defined: i32,

    // --- Debug tables ---
    /// Per-instruction line delta, or `ABS_LINE_INFO`.
    pub line_info: Vec<i8>,
    /// Absolute anchors, strictly sorted by pc.
    pub abs_line_info: Vec<AbsLineInfo>,
    /// Local variable debug info, ordered by `start_pc`.
    pub local_vars: Vec<LocalVar>,

    /// Line of the last emitted instruction (emission state).
    previous_line: i32,
    /// Instructions emitted since the last absolute anchor.
    iwthabs: i32,
}

impl Proto {
    /// Create an empty prototype starting at `line_defined`.
    pub fn new(line_defined: i32) -> Self {
        Proto {
            max_stack_size: 2, // minimum frame size
            line_defined,
            last_line_defined: line_defined,
            previous_line: line_defined,
            ..Proto::default()
        }
    }

    /// Emit an instruction at the given source line, maintaining the
    /// compressed line table. Returns the instruction's pc.
    pub fn emit(&mut self, inst: Instruction, line: i32) -> usize {
        let pc = self.code.len();
        self.code.push(inst);
        let linedif = line - self.previous_line;
        if linedif.abs() >= LINE_DIFF_LIMIT || self.iwthabs >= MAX_INSTR_WITH_ABS {
            self.abs_line_info.push(AbsLineInfo {
                pc: pc as i32,
                line,
            });
            self.line_info.push(ABS_LINE_INFO);
            self.iwthabs = 1;
        } else {
            self.line_info.push(linedif as i8);
            self.iwthabs += 1;
        }
        self.previous_line = line;
        if line > self.last_line_defined {
            self.last_line_defined = line;
        }
        pc
    }

    /// Add a constant to the pool, returning its index. Deduplicates.
    pub fn add_constant(&mut self, k: Constant) -> usize {
        for (i, existing) in self.constants.iter().enumerate() {
            if constants_equal(existing, &k) {
                return i;
            }
        }
        let idx = self.constants.len();
        self.constants.push(k);
        idx
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// Base anchor for a line lookup: the greatest absolute anchor at or
    /// before `pc`, or the function's defining line when there is none.
    /// `pc / MAX_INSTR_WITH_ABS - 1` is a lower bound for the correct
    /// anchor index, so the linear correction below only moves forward.
    fn base_line(&self, pc: i32) -> (i32, i32) {
        if self.abs_line_info.is_empty() || pc < self.abs_line_info[0].pc {
            (-1, self.line_defined)
        } else {
            let mut i = pc / MAX_INSTR_WITH_ABS - 1;
            debug_assert!(
                i < 0
                    || ((i as usize) < self.abs_line_info.len()
                        && self.abs_line_info[i as usize].pc <= pc)
            );
            while (i + 1) < self.abs_line_info.len() as i32
                && pc >= self.abs_line_info[(i + 1) as usize].pc
            {
                i += 1;
            }
            let anchor = &self.abs_line_info[i as usize];
            (anchor.pc, anchor.line)
        }
    }

    /// Source line of the instruction at `pc`, or -1 when the prototype
    /// carries no line information.
    pub fn get_line(&self, pc: i32) -> i32 {
        if self.line_info.is_empty() {
            return -1;
        }
        let (mut basepc, mut baseline) = self.base_line(pc);
        while basepc < pc {
            basepc += 1;
            // a correctly chosen base never walks across a sentinel
            debug_assert!(self.line_info[basepc as usize] != ABS_LINE_INFO);
            baseline += self.line_info[basepc as usize] as i32;
        }
        baseline
    }

    /// Whether `newpc` is on a different line than `oldpc`. Requires
    /// `oldpc < newpc`. The common case of close instructions sums deltas
    /// incrementally; a sentinel or a large gap falls back to two full
    /// lookups.
    pub fn changed_line(&self, oldpc: i32, newpc: i32) -> bool {
        if self.line_info.is_empty() {
            return false;
        }
        if newpc - oldpc < MAX_INSTR_WITH_ABS / 2 {
            let mut delta = 0i32;
            let mut pc = oldpc;
            loop {
                pc += 1;
                let li = self.line_info[pc as usize];
                if li == ABS_LINE_INFO {
                    break;
                }
                delta += li as i32;
                if pc == newpc {
                    return delta != 0;
                }
            }
        }
        self.get_line(oldpc) != self.get_line(newpc)
    }

    /// Line of the instruction at `pc` given the line of the previous
    /// instruction; used when walking the whole table in order.
    pub fn next_line(&self, current_line: i32, pc: usize) -> i32 {
        if self.line_info[pc] != ABS_LINE_INFO {
            current_line + self.line_info[pc] as i32
        } else {
            self.get_line(pc as i32)
        }
    }

    /// Name of the `n`-th (1-based) local variable live at `pc`, if the
    /// debug table records one.
    pub fn get_local_name(&self, n: u32, pc: i32) -> Option<StringId> {
        let mut n = n as i32;
        for lv in &self.local_vars {
            if lv.start_pc as i32 > pc {
                break; // ordered by start_pc
            }
            if pc < lv.end_pc as i32 {
                n -= 1;
                if n == 0 {
                    return Some(lv.name);
                }
            }
        }
        None
    }
}

/// Constant-pool equality: floats compare by bits so NaN deduplicates.
fn constants_equal(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Nil, Constant::Nil) => true,
        (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
        (Constant::Integer(a), Constant::Integer(b)) => a == b,
        (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
        (Constant::String(a), Constant::String(b)) => a == b,
        _ => false,
    }
}
