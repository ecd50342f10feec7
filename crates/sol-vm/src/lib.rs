//! Sol virtual machine: bytecode interpreter with the runtime debug and
//! introspection core (stack inspection, symbolic execution, tracing
//! hooks, and enriched error messages).

pub mod arith;
pub mod callinfo;
pub mod debug;
pub mod dispatch;
pub mod error;
pub mod metamethod;
pub mod trace;
pub mod vm;
