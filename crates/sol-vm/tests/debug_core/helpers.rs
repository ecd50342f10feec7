use sol_bytecode::proto::{Constant, LocalVar, Proto, UpvalDesc};
use sol_core::heap::UpValLocation;
use sol_core::value::TValue;
use sol_vm::dispatch;
use sol_vm::error::SolError;
use sol_vm::vm::Vm;

/// Wrap a prototype in a closure whose upvalue 0 is the globals table,
/// the shape the compiler gives every top-level chunk.
pub fn main_closure(vm: &mut Vm, proto: Proto) -> TValue {
    let idx = vm.add_proto(proto);
    let env = vm
        .heap
        .alloc_upval(UpValLocation::Closed(TValue::from_table(vm.globals)));
    let cl = vm.heap.alloc_closure(idx, vec![env]);
    TValue::from_closure(cl)
}

/// Execute a prototype as a main chunk.
pub fn run(vm: &mut Vm, proto: Proto) -> Result<Vec<TValue>, SolError> {
    let f = main_closure(vm, proto);
    dispatch::call_function(vm, f, &[])
}

/// Execute a prototype, expecting a runtime error; returns its message.
pub fn run_err(vm: &mut Vm, proto: Proto) -> String {
    match run(vm, proto) {
        Err(e) => format!("{e}"),
        Ok(vals) => panic!("expected error, got {} results: {vals:?}", vals.len()),
    }
}

/// Add a string constant, returning its pool index.
pub fn str_k(vm: &mut Vm, p: &mut Proto, s: &str) -> u8 {
    let id = vm.strings.intern(s.as_bytes());
    p.add_constant(Constant::String(id)) as u8
}

/// Record a local variable in the debug table.
pub fn add_local(vm: &mut Vm, p: &mut Proto, name: &str, start_pc: u32, end_pc: u32) {
    let id = vm.strings.intern(name.as_bytes());
    p.local_vars.push(LocalVar {
        name: id,
        start_pc,
        end_pc,
    });
}

/// Upvalue descriptor for `_ENV` inherited from the enclosing closure.
pub fn env_upval(vm: &mut Vm) -> UpvalDesc {
    UpvalDesc {
        name: Some(vm.strings.intern(b"_ENV")),
        in_stack: false,
        index: 0,
    }
}

/// Set the prototype's source to `@test.sol`.
pub fn test_source(vm: &mut Vm, p: &mut Proto) {
    p.source = Some(vm.strings.intern(b"@test.sol"));
}

/// Read a string value back out of the interner.
pub fn as_str(vm: &Vm, v: TValue) -> String {
    let id = v.as_string_id().expect("expected a string value");
    vm.strings.get_str(id).into_owned()
}

/// Read a global by name.
pub fn global(vm: &Vm, name: &str) -> TValue {
    match vm.strings.find(name.as_bytes()) {
        Some(key) => vm.heap.get_table(vm.globals).raw_get_str(key),
        None => TValue::nil(),
    }
}
