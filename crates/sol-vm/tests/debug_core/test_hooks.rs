use super::helpers::*;
use sol_bytecode::opcode::{Instruction, OpCode};
use sol_bytecode::proto::Proto;
use sol_core::value::TValue;
use sol_vm::dispatch;
use sol_vm::error::SolError;
use sol_vm::trace::{Hook, HookEvent, MASK_CALL, MASK_COUNT, MASK_LINE, MASK_RET};
use sol_vm::vm::{ThreadStatus, Vm};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Events = Rc<RefCell<Vec<(HookEvent, i32)>>>;

fn recording_hook(events: &Events) -> Hook {
    let ev = Rc::clone(events);
    Rc::new(move |_vm: &mut Vm, e: HookEvent, line: i32| {
        ev.borrow_mut().push((e, line));
        Ok(())
    })
}

/// Chunk with code on lines 1 and 2, returning 2.
fn two_line_chunk(vm: &mut Vm) -> TValue {
    let mut p = Proto::new(0);
    test_source(vm, &mut p);
    p.max_stack_size = 4;
    p.emit(Instruction::asbx(OpCode::LoadI, 0, 1), 1);
    p.emit(Instruction::asbx(OpCode::LoadI, 0, 2), 2);
    p.emit(Instruction::abc(OpCode::Return, 0, 2, 0, false), 2);
    main_closure(vm, p)
}

#[test]
fn test_line_hook_one_event_per_line() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(Some(recording_hook(&events)), MASK_LINE, 0);
    let chunk = two_line_chunk(&mut vm);
    let vals = dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    assert_eq!(vals[0].as_integer(), Some(2));
    assert_eq!(
        *events.borrow(),
        vec![(HookEvent::Line, 1), (HookEvent::Line, 2)]
    );
}

#[test]
fn test_call_and_return_hooks() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(Some(recording_hook(&events)), MASK_CALL | MASK_RET, 0);

    let mut f = Proto::new(10);
    f.max_stack_size = 4;
    f.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 11);

    let mut main = Proto::new(0);
    main.max_stack_size = 4;
    main.protos.push(f);
    main.emit(Instruction::abx(OpCode::Closure, 0, 0), 1);
    main.emit(Instruction::abc(OpCode::Call, 0, 1, 1, false), 2);
    main.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 3);
    // the closure capture list is empty; give it no upvalue descriptors
    let chunk = main_closure(&mut vm, main);

    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    let kinds: Vec<HookEvent> = events.borrow().iter().map(|&(e, _)| e).collect();
    assert_eq!(
        kinds,
        vec![
            HookEvent::Call, // main chunk
            HookEvent::Call, // f
            HookEvent::Ret,  // f
            HookEvent::Ret,  // main chunk
        ]
    );
}

#[test]
fn test_count_hook_budget_of_one() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(Some(recording_hook(&events)), MASK_COUNT, 1);
    let chunk = two_line_chunk(&mut vm);
    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    // one count hook per instruction
    assert_eq!(events.borrow().len(), 3);
    assert!(events.borrow().iter().all(|&(e, l)| e == HookEvent::Count && l == -1));
}

#[test]
fn test_count_hook_budget_of_two() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(Some(recording_hook(&events)), MASK_COUNT, 2);
    let chunk = two_line_chunk(&mut vm);
    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    assert_eq!(events.borrow().len(), 1);
}

#[test]
fn test_count_hook_fires_before_line_hook() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(
        Some(recording_hook(&events)),
        MASK_COUNT | MASK_LINE,
        1,
    );
    let chunk = two_line_chunk(&mut vm);
    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    let ev = events.borrow();
    assert_eq!(ev[0].0, HookEvent::Count);
    assert_eq!(ev[1], (HookEvent::Line, 1));
}

#[test]
fn test_tail_call_event() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(Some(recording_hook(&events)), MASK_CALL, 0);

    let mut g = Proto::new(20);
    g.max_stack_size = 4;
    g.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 21);

    let mut f = Proto::new(10);
    f.max_stack_size = 4;
    let desc = env_upval(&mut vm);
    f.upvalues.push(desc);
    let kg = str_k(&mut vm, &mut f, "g");
    f.emit(Instruction::abc(OpCode::GetTabUp, 0, 0, kg, true), 11);
    f.emit(Instruction::abc(OpCode::TailCall, 0, 1, 0, false), 11);
    f.emit(Instruction::abc(OpCode::Return, 0, 0, 0, false), 11);

    let mut main = Proto::new(0);
    main.max_stack_size = 4;
    let desc = env_upval(&mut vm);
    main.upvalues.push(desc);
    let kg = str_k(&mut vm, &mut main, "g");
    main.protos.push(f);
    main.protos.push(g);
    main.emit(Instruction::abx(OpCode::Closure, 0, 1), 1);
    main.emit(Instruction::abc(OpCode::SetTabUp, 0, kg, 0, false), 1);
    main.emit(Instruction::abx(OpCode::Closure, 0, 0), 2);
    main.emit(Instruction::abc(OpCode::Call, 0, 1, 1, false), 2);
    main.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 3);
    let chunk = main_closure(&mut vm, main);

    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    let kinds: Vec<HookEvent> = events.borrow().iter().map(|&(e, _)| e).collect();
    assert_eq!(
        kinds,
        vec![HookEvent::Call, HookEvent::Call, HookEvent::TailCall]
    );
}

#[test]
fn test_vararg_call_hook_fires_from_prelude() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(Some(recording_hook(&events)), MASK_CALL | MASK_LINE, 0);

    let mut f = Proto::new(9);
    f.is_vararg = true;
    f.max_stack_size = 4;
    f.emit(Instruction::abc(OpCode::VarArgPrep, 0, 0, 0, false), 10);
    f.emit(Instruction::abc(OpCode::LoadNil, 0, 0, 0, false), 11);
    f.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 12);

    let mut main = Proto::new(0);
    main.max_stack_size = 4;
    main.protos.push(f);
    main.emit(Instruction::abx(OpCode::Closure, 0, 0), 1);
    main.emit(Instruction::abc(OpCode::Call, 0, 1, 1, false), 2);
    main.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 3);
    let chunk = main_closure(&mut vm, main);

    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    let ev = events.borrow();
    // the second Call event belongs to f; no line of f precedes it
    let f_call = ev
        .iter()
        .enumerate()
        .filter(|(_, &(e, _))| e == HookEvent::Call)
        .nth(1)
        .map(|(i, _)| i)
        .expect("call event for f");
    let first_f_line = ev
        .iter()
        .position(|&(e, l)| e == HookEvent::Line && l >= 10)
        .expect("line event inside f");
    assert!(f_call < first_f_line);
    assert_eq!(ev[first_f_line], (HookEvent::Line, 11));
}

#[test]
fn test_transfer_info_during_call_hook() {
    let mut vm = Vm::new();
    let transfers: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let tr = Rc::clone(&transfers);
    let hook: Hook = Rc::new(move |vm: &mut Vm, e: HookEvent, _line: i32| {
        if e == HookEvent::Call {
            let mut ar = vm.get_stack(0).expect("hooked frame");
            assert!(vm.get_info("r", &mut ar));
            tr.borrow_mut().push((ar.f_transfer, ar.n_transfer));
        }
        Ok(())
    });
    vm.set_hook(Some(hook), MASK_CALL, 0);

    let mut f = Proto::new(10);
    f.num_params = 2;
    f.max_stack_size = 4;
    f.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 11);

    let mut main = Proto::new(0);
    main.max_stack_size = 5;
    main.protos.push(f);
    main.emit(Instruction::abx(OpCode::Closure, 0, 0), 1);
    main.emit(Instruction::asbx(OpCode::LoadI, 1, 4), 1);
    main.emit(Instruction::asbx(OpCode::LoadI, 2, 5), 1);
    main.emit(Instruction::abc(OpCode::Call, 0, 3, 1, false), 1);
    main.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 2);
    let chunk = main_closure(&mut vm, main);

    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    // main chunk has no parameters; f transfers its two
    assert_eq!(*transfers.borrow(), vec![(0, 0), (1, 2)]);
}

#[test]
fn test_transfer_info_during_return_hook() {
    let mut vm = Vm::new();
    let transfers: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let tr = Rc::clone(&transfers);
    let hook: Hook = Rc::new(move |vm: &mut Vm, e: HookEvent, _line: i32| {
        if e == HookEvent::Ret {
            let mut ar = vm.get_stack(0).expect("hooked frame");
            assert!(vm.get_info("r", &mut ar));
            tr.borrow_mut().push((ar.f_transfer, ar.n_transfer));
        }
        Ok(())
    });
    vm.set_hook(Some(hook), MASK_RET, 0);

    let mut f = Proto::new(10);
    f.max_stack_size = 4;
    f.emit(Instruction::asbx(OpCode::LoadI, 0, 7), 11);
    f.emit(Instruction::asbx(OpCode::LoadI, 1, 8), 11);
    f.emit(Instruction::abc(OpCode::Return, 0, 3, 0, false), 12);

    let mut main = Proto::new(0);
    main.max_stack_size = 4;
    main.protos.push(f);
    main.emit(Instruction::abx(OpCode::Closure, 0, 0), 1);
    main.emit(Instruction::abc(OpCode::Call, 0, 1, 1, false), 1);
    main.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 2);
    let chunk = main_closure(&mut vm, main);

    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    // f returns two values sitting just above its function slot
    assert_eq!(transfers.borrow()[0], (1, 2));
}

#[test]
fn test_uninstalling_hook_from_inside_hook() {
    let mut vm = Vm::new();
    let count = Rc::new(Cell::new(0));
    let c = Rc::clone(&count);
    let hook: Hook = Rc::new(move |vm: &mut Vm, _e: HookEvent, _line: i32| {
        c.set(c.get() + 1);
        vm.set_hook(None, 0, 0);
        Ok(())
    });
    vm.set_hook(Some(hook), MASK_LINE, 0);
    let chunk = two_line_chunk(&mut vm);
    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    assert_eq!(count.get(), 1);
    assert!(vm.get_hook().is_none());
    assert_eq!(vm.get_hook_mask(), 0);
}

#[test]
fn test_set_hook_with_zero_mask_turns_off() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(Some(recording_hook(&events)), 0, 0);
    assert!(vm.get_hook().is_none());
    assert_eq!(vm.get_hook_mask(), 0);
    vm.set_hook(None, 0, 0); // idempotent
    assert_eq!(vm.get_hook_count(), 0);
}

#[test]
fn test_hook_error_unwinds_interpreter() {
    let mut vm = Vm::new();
    let hook: Hook = Rc::new(|_vm: &mut Vm, _e: HookEvent, _line: i32| {
        Err(SolError::Runtime("hook failed".to_string()))
    });
    vm.set_hook(Some(hook), MASK_LINE, 0);
    let chunk = two_line_chunk(&mut vm);
    let err = dispatch::call_function(&mut vm, chunk, &[]).expect_err("hook error");
    assert_eq!(format!("{err}"), "hook failed");
}

#[test]
fn test_hook_yield_latched_and_resumed() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    let ev = Rc::clone(&events);
    let yielded = Rc::new(Cell::new(false));
    let y = Rc::clone(&yielded);
    let hook: Hook = Rc::new(move |vm: &mut Vm, e: HookEvent, line: i32| {
        ev.borrow_mut().push((e, line));
        if line == 2 && !y.get() {
            y.set(true);
            vm.status = ThreadStatus::Yield;
        }
        Ok(())
    });
    vm.set_hook(Some(hook), MASK_LINE, 0);
    let chunk = two_line_chunk(&mut vm);

    let err = dispatch::call_function(&mut vm, chunk, &[]).expect_err("hook yields");
    assert!(matches!(err, SolError::Yield));
    assert_eq!(events.borrow().len(), 2);

    let vals = dispatch::resume(&mut vm).expect("resume completes");
    assert_eq!(vals[0].as_integer(), Some(2));
    // the latched yield is consumed once; the line hook does not re-fire
    assert_eq!(
        *events.borrow(),
        vec![(HookEvent::Line, 1), (HookEvent::Line, 2)]
    );
}

#[test]
fn test_line_hook_fires_on_loop_back_edge() {
    let mut vm = Vm::new();
    let events: Events = Rc::new(RefCell::new(Vec::new()));
    vm.set_hook(Some(recording_hook(&events)), MASK_LINE, 0);

    let mut p = Proto::new(0);
    test_source(&mut vm, &mut p);
    p.max_stack_size = 6;
    p.emit(Instruction::asbx(OpCode::LoadI, 0, 1), 1);
    p.emit(Instruction::asbx(OpCode::LoadI, 1, 2), 1);
    p.emit(Instruction::asbx(OpCode::LoadI, 2, 1), 1);
    p.emit(Instruction::abx(OpCode::ForPrep, 0, 1), 1);
    p.emit(Instruction::abc(OpCode::LoadNil, 4, 0, 0, false), 2); // body
    p.emit(Instruction::abx(OpCode::ForLoop, 0, 2), 1);
    p.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 3);
    let chunk = main_closure(&mut vm, p);

    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    let body_hits = events
        .borrow()
        .iter()
        .filter(|&&(e, l)| e == HookEvent::Line && l == 2)
        .count();
    // two iterations: the back edge re-reports the body line
    assert_eq!(body_hits, 2);
}

#[test]
fn test_installing_hook_mid_run_arms_active_frames() {
    let mut vm = Vm::new();

    fn installer(vm: &mut Vm) -> Result<Vec<TValue>, SolError> {
        let hook: Hook = Rc::new(|vm: &mut Vm, e: HookEvent, _line: i32| {
            if e == HookEvent::Line {
                let key = vm.strings.intern(b"line_count");
                let cur = vm
                    .heap
                    .get_table(vm.globals)
                    .raw_get_str(key)
                    .as_integer()
                    .unwrap_or(0);
                vm.heap
                    .get_table_mut(vm.globals)
                    .raw_set_str(key, TValue::from_integer(cur + 1));
            }
            Ok(())
        });
        vm.set_hook(Some(hook), MASK_LINE, 0);
        Ok(vec![])
    }
    let install = vm.register_native("install", installer);
    vm.set_global("install", install);

    let mut p = Proto::new(0);
    p.max_stack_size = 4;
    let desc = env_upval(&mut vm);
    p.upvalues.push(desc);
    let ki = str_k(&mut vm, &mut p, "install");
    p.emit(Instruction::abc(OpCode::GetTabUp, 0, 0, ki, true), 1);
    p.emit(Instruction::abc(OpCode::Call, 0, 1, 1, false), 1);
    p.emit(Instruction::abc(OpCode::LoadNil, 0, 0, 0, false), 2);
    p.emit(Instruction::abc(OpCode::LoadNil, 0, 0, 0, false), 3);
    p.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 3);
    let chunk = main_closure(&mut vm, p);

    dispatch::call_function(&mut vm, chunk, &[]).unwrap();
    // the already-active main frame was re-armed and traced lines 2 and 3
    assert_eq!(global(&vm, "line_count").as_integer(), Some(2));
}

#[test]
fn test_function_called_from_hook_is_named_hook() {
    let mut vm = Vm::new();

    fn probe_hookname(vm: &mut Vm) -> Result<Vec<TValue>, SolError> {
        let mut ar = vm.get_stack(1).expect("caller frame");
        assert!(vm.get_info("n", &mut ar));
        let name = ar.name.clone().unwrap_or_default();
        let nid = vm.strings.intern(name.as_bytes());
        let nkey = vm.strings.intern(b"hookcall_name");
        vm.heap
            .get_table_mut(vm.globals)
            .raw_set_str(nkey, TValue::from_string_id(nid));
        let wid = vm.strings.intern(ar.name_what.as_bytes());
        let wkey = vm.strings.intern(b"hookcall_namewhat");
        vm.heap
            .get_table_mut(vm.globals)
            .raw_set_str(wkey, TValue::from_string_id(wid));
        Ok(vec![])
    }
    let probe = vm.register_native("probe", probe_hookname);
    vm.set_global("probe", probe);

    // g calls probe; the hook calls g
    let mut g = Proto::new(40);
    g.max_stack_size = 4;
    let desc = env_upval(&mut vm);
    g.upvalues.push(desc);
    let kp = str_k(&mut vm, &mut g, "probe");
    g.emit(Instruction::abc(OpCode::GetTabUp, 0, 0, kp, true), 41);
    g.emit(Instruction::abc(OpCode::Call, 0, 1, 1, false), 41);
    g.emit(Instruction::abc(OpCode::Return0, 0, 0, 0, false), 42);
    let g_val = main_closure(&mut vm, g);

    let fired = Rc::new(Cell::new(false));
    let fr = Rc::clone(&fired);
    let hook: Hook = Rc::new(move |vm: &mut Vm, _e: HookEvent, _line: i32| {
        if !fr.get() {
            fr.set(true);
            dispatch::call_function(vm, g_val, &[])?;
        }
        Ok(())
    });
    vm.set_hook(Some(hook), MASK_LINE, 0);

    let chunk = two_line_chunk(&mut vm);
    dispatch::call_function(&mut vm, chunk, &[]).unwrap();

    assert_eq!(as_str(&vm, global(&vm, "hookcall_namewhat")), "hook");
    assert_eq!(as_str(&vm, global(&vm, "hookcall_name")), "?");
}
