//! Metamethod tags and their interned names.

use sol_core::heap::Heap;
use sol_core::string::{StringId, StringInterner};
use sol_core::value::TValue;

/// Metamethod tags. The discriminant is the wire value carried in the C
/// operand of `MMBIN`/`MMBINI`/`MMBINK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tm {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
    Close,
}

impl Tm {
    pub const COUNT: usize = 25;

    pub fn from_u8(val: u8) -> Option<Tm> {
        if (val as usize) < Self::COUNT {
            // Safety: Tm is repr(u8) and we've verified the range
            Some(unsafe { std::mem::transmute::<u8, Tm>(val) })
        } else {
            None
        }
    }

    /// The metamethod's key in a metatable.
    pub fn name(self) -> &'static str {
        use Tm::*;
        match self {
            Index => "__index",
            NewIndex => "__newindex",
            Gc => "__gc",
            Mode => "__mode",
            Len => "__len",
            Eq => "__eq",
            Add => "__add",
            Sub => "__sub",
            Mul => "__mul",
            Mod => "__mod",
            Pow => "__pow",
            Div => "__div",
            IDiv => "__idiv",
            BAnd => "__band",
            BOr => "__bor",
            BXor => "__bxor",
            Shl => "__shl",
            Shr => "__shr",
            Unm => "__unm",
            BNot => "__bnot",
            Lt => "__lt",
            Le => "__le",
            Concat => "__concat",
            Call => "__call",
            Close => "__close",
        }
    }

    /// The event name used when describing a metamethod call in a debug
    /// context: the key without its `__` prefix.
    pub fn event_name(self) -> &'static str {
        &self.name()[2..]
    }

    /// True for the bitwise-operator tags.
    pub fn is_bitwise(self) -> bool {
        matches!(self, Tm::BAnd | Tm::BOr | Tm::BXor | Tm::Shl | Tm::Shr)
    }
}

/// Pre-interned metamethod name ids, indexed by tag.
pub struct TmNames {
    ids: [StringId; Tm::COUNT],
}

impl TmNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        let mut ids = [StringId(0); Tm::COUNT];
        for (i, slot) in ids.iter_mut().enumerate() {
            let tm = Tm::from_u8(i as u8).unwrap();
            *slot = strings.intern(tm.name().as_bytes());
        }
        TmNames { ids }
    }

    pub fn id(&self, tm: Tm) -> StringId {
        self.ids[tm as usize]
    }
}

/// Look up a metamethod on a value. Only tables carry metatables here.
pub fn get_metamethod(heap: &Heap, names: &TmNames, val: TValue, tm: Tm) -> Option<TValue> {
    let table_idx = val.as_table_idx()?;
    let mt_idx = heap.get_table(table_idx).metatable?;
    let mm = heap.get_table(mt_idx).raw_get_str(names.id(tm));
    if mm.is_nil() {
        None
    } else {
        Some(mm)
    }
}
