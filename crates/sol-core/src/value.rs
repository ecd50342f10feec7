//! Sol value representation.
//!
//! Values are a small `Copy` tagged union. Strings, tables, closures, and
//! upvalues live behind indices into the interner / heap, so a `TValue`
//! is always 16 bytes and can be moved freely between stack slots.

use crate::heap::{ClosureIdx, TableIdx};
use crate::string::StringId;
use std::fmt;

/// Index of a native (Rust) function in the VM's native registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// A Sol value.
#[derive(Clone, Copy, PartialEq)]
pub enum TValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(StringId),
    Table(TableIdx),
    Closure(ClosureIdx),
    Native(NativeId),
}

impl TValue {
    #[inline]
    pub fn nil() -> Self {
        TValue::Nil
    }

    #[inline]
    pub fn from_bool(b: bool) -> Self {
        TValue::Boolean(b)
    }

    #[inline]
    pub fn from_integer(i: i64) -> Self {
        TValue::Integer(i)
    }

    #[inline]
    pub fn from_float(f: f64) -> Self {
        TValue::Float(f)
    }

    #[inline]
    pub fn from_string_id(id: StringId) -> Self {
        TValue::Str(id)
    }

    #[inline]
    pub fn from_table(idx: TableIdx) -> Self {
        TValue::Table(idx)
    }

    #[inline]
    pub fn from_closure(idx: ClosureIdx) -> Self {
        TValue::Closure(idx)
    }

    #[inline]
    pub fn from_native(id: NativeId) -> Self {
        TValue::Native(id)
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        matches!(self, TValue::Nil)
    }

    #[inline]
    pub fn is_bool(self) -> bool {
        matches!(self, TValue::Boolean(_))
    }

    #[inline]
    pub fn is_number(self) -> bool {
        matches!(self, TValue::Integer(_) | TValue::Float(_))
    }

    #[inline]
    pub fn is_string(self) -> bool {
        matches!(self, TValue::Str(_))
    }

    #[inline]
    pub fn is_table(self) -> bool {
        matches!(self, TValue::Table(_))
    }

    /// True for both script closures and native functions.
    #[inline]
    pub fn is_function(self) -> bool {
        matches!(self, TValue::Closure(_) | TValue::Native(_))
    }

    /// Everything except `nil` and `false` is truthy.
    #[inline]
    pub fn is_truthy(self) -> bool {
        !matches!(self, TValue::Nil | TValue::Boolean(false))
    }

    #[inline]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            TValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_integer(self) -> Option<i64> {
        match self {
            TValue::Integer(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(self) -> Option<f64> {
        match self {
            TValue::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Numeric value as a float, converting integers.
    #[inline]
    pub fn as_number(self) -> Option<f64> {
        match self {
            TValue::Integer(i) => Some(i as f64),
            TValue::Float(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string_id(self) -> Option<StringId> {
        match self {
            TValue::Str(id) => Some(id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_table_idx(self) -> Option<TableIdx> {
        match self {
            TValue::Table(idx) => Some(idx),
            _ => None,
        }
    }

    #[inline]
    pub fn as_closure_idx(self) -> Option<ClosureIdx> {
        match self {
            TValue::Closure(idx) => Some(idx),
            _ => None,
        }
    }

    #[inline]
    pub fn as_native_id(self) -> Option<NativeId> {
        match self {
            TValue::Native(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TValue::Nil => write!(f, "nil"),
            TValue::Boolean(b) => write!(f, "{b}"),
            TValue::Integer(i) => write!(f, "{i}"),
            TValue::Float(x) => write!(f, "{x}"),
            TValue::Str(id) => write!(f, "string#{}", id.0),
            TValue::Table(idx) => write!(f, "table: 0x{:x}", idx.index()),
            TValue::Closure(idx) => write!(f, "function: 0x{:x}", idx.index()),
            TValue::Native(id) => write!(f, "function: builtin#{}", id.0),
        }
    }
}
