//! Hybrid array+hash table.

use crate::heap::TableIdx;
use crate::string::StringId;
use crate::value::TValue;
use indexmap::IndexMap;

/// A key in the hash part of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    Str(StringId),
    /// Float key stored as raw bits for hashing.
    Float(u64),
    Boolean(bool),
}

/// A Sol table: array part for dense integer keys starting at 1, hash
/// part (insertion-order preserving) for everything else.
pub struct Table {
    array: Vec<TValue>,
    hash: IndexMap<TableKey, TValue>,
    pub metatable: Option<TableIdx>,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    /// Raw get by value key; nil for absent keys.
    pub fn raw_get(&self, key: TValue) -> TValue {
        if let Some(i) = key.as_integer() {
            return self.raw_geti(i);
        }
        match tvalue_to_key(key) {
            Some(k) => self.hash.get(&k).copied().unwrap_or(TValue::nil()),
            None => TValue::nil(),
        }
    }

    /// Raw set by value key. Fails on nil and NaN keys.
    pub fn raw_set(&mut self, key: TValue, value: TValue) -> Result<(), &'static str> {
        if key.is_nil() {
            return Err("table index is nil");
        }
        if let Some(f) = key.as_float() {
            if f.is_nan() {
                return Err("table index is NaN");
            }
        }
        if let Some(i) = key.as_integer() {
            self.raw_seti(i, value);
            return Ok(());
        }
        match tvalue_to_key(key) {
            Some(k) => {
                if value.is_nil() {
                    self.hash.shift_remove(&k);
                } else {
                    self.hash.insert(k, value);
                }
                Ok(())
            }
            None => Err("invalid table key"),
        }
    }

    pub fn raw_geti(&self, i: i64) -> TValue {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[(i - 1) as usize];
        }
        self.hash
            .get(&TableKey::Integer(i))
            .copied()
            .unwrap_or(TValue::nil())
    }

    pub fn raw_seti(&mut self, i: i64, value: TValue) {
        if i >= 1 && (i as usize) <= self.array.len() {
            self.array[(i - 1) as usize] = value;
            return;
        }
        if i >= 1 && i as usize == self.array.len() + 1 && !value.is_nil() {
            self.array.push(value);
            // migrate any successors waiting in the hash part
            let mut next = self.array.len() as i64 + 1;
            while let Some(v) = self.hash.shift_remove(&TableKey::Integer(next)) {
                self.array.push(v);
                next += 1;
            }
            return;
        }
        if value.is_nil() {
            self.hash.shift_remove(&TableKey::Integer(i));
        } else {
            self.hash.insert(TableKey::Integer(i), value);
        }
    }

    pub fn raw_get_str(&self, key: StringId) -> TValue {
        self.hash
            .get(&TableKey::Str(key))
            .copied()
            .unwrap_or(TValue::nil())
    }

    pub fn raw_set_str(&mut self, key: StringId, value: TValue) {
        if value.is_nil() {
            self.hash.shift_remove(&TableKey::Str(key));
        } else {
            self.hash.insert(TableKey::Str(key), value);
        }
    }

    /// Border length: count of the dense prefix.
    pub fn length(&self) -> i64 {
        let mut n = self.array.len();
        while n > 0 && self.array[n - 1].is_nil() {
            n -= 1;
        }
        n as i64
    }
}

fn tvalue_to_key(val: TValue) -> Option<TableKey> {
    match val {
        TValue::Integer(i) => Some(TableKey::Integer(i)),
        TValue::Float(f) => {
            // float keys with integral value index like integers
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Some(TableKey::Integer(f as i64))
            } else {
                Some(TableKey::Float(f.to_bits()))
            }
        }
        TValue::Str(id) => Some(TableKey::Str(id)),
        TValue::Boolean(b) => Some(TableKey::Boolean(b)),
        _ => None,
    }
}
