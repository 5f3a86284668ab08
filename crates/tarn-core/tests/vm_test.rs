//! End-to-end scenarios driven through hand-assembled programs, the same
//! way the (external) compiler targets the VM.

use std::sync::Arc;

use tarn_core::{
    native_index, register_native, Address, Class, Field, FunctionBuilder, Method,
    NativeFunction, Op, Program, ProgramBuilder, RuntimeError, Value, VM,
};

fn run(program: Program) -> Result<Value, RuntimeError> {
    VM::new(Arc::new(program), None).run(&[])
}

const VOID: Address = Address::VOID;

// ── Arithmetic coercion ───────────────────────────────────────────────

#[test]
fn test_arithmetic_coercion_to_string() {
    // (1 + 2.5) + "x" == "3.5x"
    let mut pb = ProgramBuilder::new();
    let one = pb.constant(Value::Int(1));
    let half = pb.constant(Value::Float(2.5));
    let x = pb.constant(Value::string("x"));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Add, Address::local(0), Address::constant(one), Address::constant(half));
    g.emit(Op::Add, Address::local(1), Address::local(0), Address::constant(x));
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    assert_eq!(run(pb.build()).unwrap(), Value::string("3.5x"));
}

#[test]
fn test_divide_by_zero_throws() {
    let mut pb = ProgramBuilder::new();
    let one = pb.constant(Value::Int(1));
    let zero = pb.constant(Value::Int(0));

    let mut g = FunctionBuilder::new("@global", 0).registers(1);
    g.emit(Op::Div, Address::local(0), Address::constant(one), Address::constant(zero));
    g.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(g);

    let err = run(pb.build()).unwrap_err();
    assert_eq!(err.message, "Attempt to divide by zero");
}

#[test]
fn test_null_plus_int_is_int() {
    // null on the left of + yields the right-hand side
    let mut pb = ProgramBuilder::new();
    let null = pb.constant(Value::Null);
    let one = pb.constant(Value::Int(1));

    let mut g = FunctionBuilder::new("@global", 0).registers(1);
    g.emit(Op::Add, Address::local(0), Address::constant(null), Address::constant(one));
    g.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(g);

    assert_eq!(run(pb.build()).unwrap(), Value::Int(1));
}

// ── Optional chaining ─────────────────────────────────────────────────

#[test]
fn test_optional_chaining_on_null() {
    // let a = null; return a?.b?.c  ->  null, no error
    let mut pb = ProgramBuilder::new();
    let null = pb.constant(Value::Null);
    let b = pb.constant(Value::string("b"));
    let c = pb.constant(Value::string("c"));

    let mut g = FunctionBuilder::new("@global", 0).registers(3);
    g.emit(Op::Ldk, Address::local(0), Address::constant(null), VOID);
    g.emit(Op::Ldk, Address::local(1), Address::constant(null), VOID);
    g.emit(Op::Ldk, Address::local(2), Address::constant(null), VOID);
    g.emit(Op::Str, Address::data(0), Address::data(3), VOID);
    g.emit(Op::Gto, Address::local(1), Address::local(0), Address::constant(b));
    g.emit(Op::Str, Address::data(0), Address::data(1), VOID);
    g.emit(Op::Gto, Address::local(2), Address::local(1), Address::constant(c));
    g.emit(Op::Ret, Address::local(2), VOID, VOID);
    pb.add_function(g);

    assert_eq!(run(pb.build()).unwrap(), Value::Null);
}

#[test]
fn test_optional_chaining_on_nested_maps() {
    // let a = {b: {c: 7}}; return a?.b?.c  ->  7
    let mut pb = ProgramBuilder::new();
    let null = pb.constant(Value::Null);
    let b = pb.constant(Value::string("b"));
    let c = pb.constant(Value::string("c"));
    let seven = pb.constant(Value::Int(7));

    let mut g = FunctionBuilder::new("@global", 0).registers(4);
    g.emit(Op::Map, Address::local(0), Address::data(0), VOID);
    g.emit(Op::Map, Address::local(1), Address::data(0), VOID);
    g.emit(Op::Set, Address::local(1), Address::constant(c), Address::constant(seven));
    g.emit(Op::Set, Address::local(0), Address::constant(b), Address::local(1));
    g.emit(Op::Ldk, Address::local(2), Address::constant(null), VOID);
    g.emit(Op::Ldk, Address::local(3), Address::constant(null), VOID);
    g.emit(Op::Str, Address::data(0), Address::data(3), VOID);
    g.emit(Op::Gto, Address::local(2), Address::local(0), Address::constant(b));
    g.emit(Op::Str, Address::data(0), Address::data(1), VOID);
    g.emit(Op::Gto, Address::local(3), Address::local(2), Address::constant(c));
    g.emit(Op::Ret, Address::local(3), VOID, VOID);
    pb.add_function(g);

    assert_eq!(run(pb.build()).unwrap(), Value::Int(7));
}

// ── Try / catch / finally ─────────────────────────────────────────────

#[test]
fn test_try_catch_finally_ordering() {
    // try { log.push("t"); throw "boom" } catch (e) { log.push("c:" + e) }
    // finally { log.push("f") }  ->  ["t", "c:boom", "f"]
    let mut pb = ProgramBuilder::new();
    let t = pb.constant(Value::string("t"));
    let boom = pb.constant(Value::string("boom"));
    let prefix = pb.constant(Value::string("c:"));
    let f = pb.constant(Value::string("f"));

    let mut g = FunctionBuilder::new("@global", 0).registers(3);
    g.emit(Op::Arr, Address::local(0), Address::data(3), VOID); // 0
    g.emit(Op::Try, Address::data(6), Address::local(1), Address::data(8)); // 1
    g.emit(Op::Set, Address::local(0), Address::data(0), Address::constant(t)); // 2
    g.emit(Op::Trw, Address::constant(boom), VOID, VOID); // 3
    g.emit(Op::Tre, VOID, VOID, VOID); // 4
    g.emit(Op::Jmp, Address::data(2), VOID, VOID); // 5 -> finally at 8
    g.emit(Op::Add, Address::local(2), Address::constant(prefix), Address::local(1)); // 6 catch
    g.emit(Op::Set, Address::local(0), Address::data(1), Address::local(2)); // 7
    g.emit(Op::Set, Address::local(0), Address::data(2), Address::constant(f)); // 8 finally
    g.emit(Op::Fen, VOID, VOID, VOID); // 9
    g.emit(Op::Ret, Address::local(0), VOID, VOID); // 10
    pb.add_function(g);

    let result = run(pb.build()).unwrap();
    let Value::Array(log) = &result else {
        panic!("expected array, got {result:?}");
    };
    assert_eq!(
        log.snapshot(),
        vec![
            Value::string("t"),
            Value::string("c:boom"),
            Value::string("f"),
        ]
    );
}

#[test]
fn test_finally_runs_once_on_return() {
    // function f() { try { return 1 } finally { counter++ } }
    let mut pb = ProgramBuilder::new();
    let zero = pb.constant(Value::Int(0));
    let one = pb.constant(Value::Int(1));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Ldk, Address::local(0), Address::constant(zero), VOID);
    g.emit(Op::Cal, Address::func(1), Address::local(1), VOID);
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    let mut f = FunctionBuilder::new("f", 0).registers(1);
    f.emit(Op::Try, VOID, VOID, Address::data(3)); // 0: finally-only guard
    f.emit(Op::Ldk, Address::local(0), Address::constant(one), VOID); // 1
    f.emit(Op::Ret, Address::local(0), VOID, VOID); // 2: diverted to finally
    f.emit(Op::Inc, Address::global(0), VOID, VOID); // 3: finally
    f.emit(Op::Fen, VOID, VOID, VOID); // 4: resumes the ret
    pb.add_function(f);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Int(1));
    // the counter in global register 0 incremented exactly once
    assert_eq!(vm.globals()[0], Value::Int(1));
}

#[test]
fn test_throw_across_frames_unwinds_to_guard() {
    // try { f() } catch (e) { return "caught:" + e }  where f throws
    let mut pb = ProgramBuilder::new();
    let boom = pb.constant(Value::string("boom"));
    let prefix = pb.constant(Value::string("caught:"));

    let mut g = FunctionBuilder::new("@global", 0).registers(3);
    g.emit(Op::Try, Address::data(4), Address::local(0), VOID); // 0
    g.emit(Op::Cal, Address::func(1), Address::local(1), VOID); // 1
    g.emit(Op::Tre, VOID, VOID, VOID); // 2
    g.emit(Op::Jmp, Address::data(2), VOID, VOID); // 3 -> 6
    g.emit(Op::Add, Address::local(2), Address::constant(prefix), Address::local(0)); // 4 catch
    g.emit(Op::Cen, VOID, VOID, VOID); // 5
    g.emit(Op::Ret, Address::local(2), VOID, VOID); // 6
    pb.add_function(g);

    let mut f = FunctionBuilder::new("thrower", 0).registers(1);
    f.emit(Op::Trw, Address::constant(boom), VOID, VOID);
    pb.add_function(f);

    assert_eq!(run(pb.build()).unwrap(), Value::string("caught:boom"));
}

#[test]
fn test_error_object_in_catch() {
    // catch receives an error object exposing message via property access
    let new_error = native_index("errors.newError").expect("core native") as i32;
    let mut pb = ProgramBuilder::new();
    let oops = pb.constant(Value::string("oops"));
    let message = pb.constant(Value::string("message"));

    let mut g = FunctionBuilder::new("@global", 0).registers(3);
    g.emit(Op::Try, Address::data(3), Address::local(0), VOID); // 0
    g.emit(Op::Cas, Address::native_func(new_error), Address::local(1), Address::constant(oops)); // 1
    g.emit(Op::Trw, Address::local(1), VOID, VOID); // 2
    g.emit(Op::Get, Address::local(2), Address::local(0), Address::constant(message)); // 3 catch
    g.emit(Op::Cen, VOID, VOID, VOID); // 4
    g.emit(Op::Ret, Address::local(2), VOID, VOID); // 5
    pb.add_function(g);

    assert_eq!(run(pb.build()).unwrap(), Value::string("oops"));
}

// ── Closures ──────────────────────────────────────────────────────────

#[test]
fn test_closure_counter() {
    // function make() { let x = 0; return () => ++x }
    // let f = make(); f(); f(); return f()  ->  3
    let mut pb = ProgramBuilder::new();
    let zero = pb.constant(Value::Int(0));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Cal, Address::func(1), Address::local(0), VOID);
    g.emit(Op::Cal, Address::local(0), Address::local(1), VOID);
    g.emit(Op::Cal, Address::local(0), Address::local(1), VOID);
    g.emit(Op::Cal, Address::local(0), Address::local(1), VOID);
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    let mut make = FunctionBuilder::new("make", 0).registers(2).captures(vec![0]);
    make.emit(Op::Ldk, Address::local(0), Address::constant(zero), VOID);
    make.emit(Op::Clo, Address::local(1), Address::func(2), VOID);
    make.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(make);

    let mut lambda = FunctionBuilder::new("make.lambda", 0).registers(0);
    lambda.emit(Op::Inc, Address::closure(0), VOID, VOID);
    lambda.emit(Op::Ret, Address::closure(0), VOID, VOID);
    pb.add_function(lambda);

    assert_eq!(run(pb.build()).unwrap(), Value::Int(3));
}

#[test]
fn test_two_closures_share_one_register() {
    // let x = 10; inc = () => ++x; get = () => x; inc(); return get()
    let mut pb = ProgramBuilder::new();
    let ten = pb.constant(Value::Int(10));

    let mut g = FunctionBuilder::new("@global", 0).registers(4).captures(vec![0]);
    g.emit(Op::Ldk, Address::local(0), Address::constant(ten), VOID);
    g.emit(Op::Clo, Address::local(1), Address::func(1), VOID);
    g.emit(Op::Clo, Address::local(2), Address::func(2), VOID);
    g.emit(Op::Cal, Address::local(1), Address::local(3), VOID);
    g.emit(Op::Cal, Address::local(2), Address::local(3), VOID);
    g.emit(Op::Ret, Address::local(3), VOID, VOID);
    pb.add_function(g);

    let mut inc = FunctionBuilder::new("inc", 0).registers(0);
    inc.emit(Op::Inc, Address::closure(0), VOID, VOID);
    inc.emit(Op::Ret, Address::closure(0), VOID, VOID);
    pb.add_function(inc);

    let mut get = FunctionBuilder::new("get", 0).registers(0);
    get.emit(Op::Ret, Address::closure(0), VOID, VOID);
    pb.add_function(get);

    assert_eq!(run(pb.build()).unwrap(), Value::Int(11));
}

// ── Quotas ────────────────────────────────────────────────────────────

#[test]
fn test_step_limit_stops_infinite_loop() {
    let mut pb = ProgramBuilder::new();
    let mut g = FunctionBuilder::new("@global", 0).registers(1);
    g.emit(Op::Jpb, Address::data(0), VOID, VOID); // while (true) {}
    pb.add_function(g);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    vm.max_steps = 100;
    let err = vm.run(&[]).unwrap_err();
    assert_eq!(err.message, "step limit exceeded");
}

#[test]
fn test_step_limit_is_catchable() {
    let mut pb = ProgramBuilder::new();
    let message = pb.constant(Value::string("message"));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Try, Address::data(2), Address::local(0), VOID); // 0
    g.emit(Op::Jpb, Address::data(0), VOID, VOID); // 1: while (true) {}
    g.emit(Op::Get, Address::local(1), Address::local(0), Address::constant(message)); // 2 catch
    g.emit(Op::Cen, VOID, VOID, VOID); // 3
    g.emit(Op::Ret, Address::local(1), VOID, VOID); // 4
    pb.add_function(g);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    vm.max_steps = 100;
    assert_eq!(
        vm.run(&[]).unwrap(),
        Value::string("step limit exceeded")
    );
}

#[test]
fn test_allocation_limit_is_catchable() {
    let mut pb = ProgramBuilder::new();
    let chunk = pb.constant(Value::string("xxxxxxxx"));
    let chunk2 = pb.constant(Value::string("yyyyyyyy"));
    let message = pb.constant(Value::string("message"));

    let mut g = FunctionBuilder::new("@global", 0).registers(3);
    g.emit(Op::Try, Address::data(3), Address::local(1), VOID); // 0
    g.emit(Op::Add, Address::local(0), Address::constant(chunk), Address::constant(chunk2)); // 1
    g.emit(Op::Jpb, Address::data(1), VOID, VOID); // 2 -> 1
    g.emit(Op::Get, Address::local(2), Address::local(1), Address::constant(message)); // 3 catch
    g.emit(Op::Cen, VOID, VOID, VOID); // 4
    g.emit(Op::Ret, Address::local(2), VOID, VOID); // 5
    pb.add_function(g);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    vm.max_allocations = 100;
    assert_eq!(
        vm.run(&[]).unwrap(),
        Value::string("allocation limit exceeded")
    );
}

#[test]
fn test_frame_limit_overflows() {
    let mut pb = ProgramBuilder::new();
    let mut g = FunctionBuilder::new("@global", 0).registers(1);
    g.emit(Op::Cal, Address::func(1), Address::local(0), VOID);
    g.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(g);

    let mut rec = FunctionBuilder::new("rec", 0).registers(1);
    rec.emit(Op::Cal, Address::func(1), Address::local(0), VOID);
    rec.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(rec);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    vm.max_frames = 16;
    let err = vm.run(&[]).unwrap_err();
    assert_eq!(err.message, "stack overflow");
}

#[test]
fn test_child_vm_steps_accrue_to_parent() {
    let mut pb = ProgramBuilder::new();
    let one = pb.constant(Value::Int(1));
    let mut g = FunctionBuilder::new("@global", 0).registers(1);
    g.emit(Op::Ldk, Address::local(0), Address::constant(one), VOID);
    g.emit(Op::Add, Address::local(0), Address::local(0), Address::local(0));
    g.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(g);
    let program = Arc::new(pb.build());

    let mut child_a = VM::new(program.clone(), None);
    child_a.run(&[]).unwrap();
    let mut child_b = VM::new(program.clone(), None);
    child_b.run(&[]).unwrap();
    assert!(child_a.steps() > 0);

    let mut parent = VM::new(program.clone(), None);
    parent.add_steps(child_a.steps()).unwrap();
    parent.add_steps(child_b.steps()).unwrap();
    assert_eq!(parent.steps(), child_a.steps() + child_b.steps());

    // a parent cannot evade its own quota through children
    let mut strict = VM::new(program, None);
    strict.max_steps = 1;
    let err = strict.add_steps(child_a.steps()).unwrap_err();
    assert_eq!(err.message, "step limit exceeded");
}

// ── Permissions ───────────────────────────────────────────────────────

fn secret(_this: Value, _args: &[Value], vm: &mut VM) -> Result<Value, RuntimeError> {
    vm.require_permission("trusted")?;
    Ok(Value::Int(7))
}

fn secret_program(trusted: bool) -> Program {
    let index = register_native(NativeFunction {
        name: "test.secret",
        arguments: 0,
        function: secret,
    }) as i32;
    let mut pb = ProgramBuilder::new();
    if trusted {
        pb.add_permission("trusted");
    }
    let mut g = FunctionBuilder::new("@global", 0).registers(1);
    g.emit(Op::Cal, Address::native_func(index), Address::local(0), VOID);
    g.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(g);
    pb.build()
}

#[test]
fn test_untrusted_program_is_denied() {
    let err = run(secret_program(false)).unwrap_err();
    assert_eq!(err.message, "unauthorized");
}

#[test]
fn test_trusted_program_is_allowed() {
    assert_eq!(run(secret_program(true)).unwrap(), Value::Int(7));
}

// ── Deferred cleanup ──────────────────────────────────────────────────

#[test]
fn test_defer_runs_in_reverse_order() {
    let defer = native_index("runtime.defer").expect("core native") as i32;
    let mut pb = ProgramBuilder::new();
    let zero = pb.constant(Value::Int(0));
    let a = pb.constant(Value::string("A"));
    let b = pb.constant(Value::string("B"));

    // globals: g0 = last finalizable to run, g1 = how many ran
    let mut g = FunctionBuilder::new("@global", 0).registers(4);
    g.emit(Op::Ldk, Address::local(1), Address::constant(zero), VOID);
    g.emit(Op::Clo, Address::local(2), Address::func(1), VOID);
    g.emit(Op::Clo, Address::local(3), Address::func(2), VOID);
    g.emit(Op::Cas, Address::native_func(defer), VOID, Address::local(2));
    g.emit(Op::Cas, Address::native_func(defer), VOID, Address::local(3));
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    let mut first = FunctionBuilder::new("first", 0).registers(0);
    first.emit(Op::Ldk, Address::global(0), Address::constant(a), VOID);
    first.emit(Op::Inc, Address::global(1), VOID, VOID);
    first.emit(Op::Ret, VOID, VOID, VOID);
    pb.add_function(first);

    let mut second = FunctionBuilder::new("second", 0).registers(0);
    second.emit(Op::Ldk, Address::global(0), Address::constant(b), VOID);
    second.emit(Op::Inc, Address::global(1), VOID, VOID);
    second.emit(Op::Ret, VOID, VOID, VOID);
    pb.add_function(second);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    vm.run(&[]).unwrap();
    let globals = vm.globals();
    // registered first, so it ran last
    assert_eq!(globals[0], Value::string("A"));
    assert_eq!(globals[1], Value::Int(2));
    assert!(vm.finalizer_errors().is_empty());
}

// ── Classes and enums ─────────────────────────────────────────────────

#[test]
fn test_class_constructor_and_method_dispatch() {
    let mut pb = ProgramBuilder::new();
    let x = pb.constant(Value::string("x"));
    let two = pb.constant(Value::Int(2));
    let twenty_one = pb.constant(Value::Int(21));
    let double = pb.constant(Value::string("double"));
    pb.add_class(Class {
        name: "Point".into(),
        exported: true,
        fields: vec![
            Field { name: "x".into(), exported: true },
            Field { name: "y".into(), exported: true },
        ],
        methods: vec![
            Method { name: "constructor".into(), func_index: 1 },
            Method { name: "double".into(), func_index: 2 },
        ],
    });

    let mut g = FunctionBuilder::new("@global", 0).registers(3);
    g.emit(Op::Arr, Address::local(0), Address::data(1), VOID);
    g.emit(Op::Set, Address::local(0), Address::data(0), Address::constant(twenty_one));
    g.emit(Op::New, Address::class(0), Address::local(1), Address::local(0));
    g.emit(Op::Get, Address::local(2), Address::local(1), Address::constant(double));
    g.emit(Op::Cal, Address::local(2), Address::local(2), VOID);
    g.emit(Op::Ret, Address::local(2), VOID, VOID);
    pb.add_function(g);

    // constructor(x) { this.x = x }
    let mut ctor = FunctionBuilder::new("Point.constructor", 1).registers(2);
    ctor.emit(Op::Set, Address::local(0), Address::constant(x), Address::local(1));
    ctor.emit(Op::Ret, VOID, VOID, VOID);
    pb.add_function(ctor);

    // double() { return this.x * 2 }
    let mut dbl = FunctionBuilder::new("Point.double", 0).registers(2);
    dbl.emit(Op::Get, Address::local(1), Address::local(0), Address::constant(x));
    dbl.emit(Op::Mul, Address::local(1), Address::local(1), Address::constant(two));
    dbl.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(dbl);

    assert_eq!(run(pb.build()).unwrap(), Value::Int(42));
}

#[test]
fn test_new_without_constructor_ignores_args() {
    // constructor-less classes accept and discard arguments
    let mut pb = ProgramBuilder::new();
    let one = pb.constant(Value::Int(1));
    pb.add_class(Class {
        name: "Bag".into(),
        ..Default::default()
    });

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Nes, Address::class(0), Address::local(0), Address::constant(one));
    g.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(g);

    let result = run(pb.build()).unwrap();
    assert_eq!(result.type_of(), tarn_core::Type::Object);
}

#[test]
fn test_enum_access() {
    let mut pb = ProgramBuilder::new();
    let ten = pb.constant(Value::Int(10));
    let twenty = pb.constant(Value::Int(20));
    let red = pb.constant(Value::string("red"));
    pb.add_enum(
        "Color",
        vec![("red".to_string(), ten), ("green".to_string(), twenty)],
    );

    // direct member load
    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Enu, Address::local(0), Address::data(0), Address::data(1));
    g.emit(Op::Get, Address::local(1), Address::enumeration(0), Address::constant(red));
    g.emit(Op::Add, Address::local(0), Address::local(0), Address::local(1));
    g.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(g);

    // green (20) + red-by-name (10)
    assert_eq!(run(pb.build()).unwrap(), Value::Int(30));
}

// ── Aggregates and iteration ──────────────────────────────────────────

#[test]
fn test_spread_drops_trailing_nil() {
    let mut pb = ProgramBuilder::new();
    let one = pb.constant(Value::Int(1));
    let two = pb.constant(Value::Int(2));

    let mut g = FunctionBuilder::new("@global", 0).registers(1);
    g.emit(Op::Arr, Address::local(0), Address::data(3), VOID);
    g.emit(Op::Set, Address::local(0), Address::data(0), Address::constant(one));
    g.emit(Op::Set, Address::local(0), Address::data(1), Address::constant(two));
    g.emit(Op::Spa, Address::local(0), VOID, VOID);
    g.emit(Op::Ret, Address::local(0), VOID, VOID);
    pb.add_function(g);

    let result = run(pb.build()).unwrap();
    let Value::Array(arr) = &result else { panic!() };
    assert_eq!(arr.snapshot(), vec![Value::Int(1), Value::Int(2)]);
}

#[test]
fn test_spread_inlines_trailing_array() {
    let mut pb = ProgramBuilder::new();
    let one = pb.constant(Value::Int(1));
    let two = pb.constant(Value::Int(2));
    let nine = pb.constant(Value::Int(9));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Arr, Address::local(0), Address::data(2), VOID);
    g.emit(Op::Set, Address::local(0), Address::data(0), Address::constant(one));
    g.emit(Op::Set, Address::local(0), Address::data(1), Address::constant(two));
    g.emit(Op::Arr, Address::local(1), Address::data(2), VOID);
    g.emit(Op::Set, Address::local(1), Address::data(0), Address::constant(nine));
    g.emit(Op::Set, Address::local(1), Address::data(1), Address::local(0));
    g.emit(Op::Spa, Address::local(1), VOID, VOID);
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    let result = run(pb.build()).unwrap();
    let Value::Array(arr) = &result else { panic!() };
    assert_eq!(
        arr.snapshot(),
        vec![Value::Int(9), Value::Int(1), Value::Int(2)]
    );
}

#[test]
fn test_iteration_values_of_bytes() {
    let mut pb = ProgramBuilder::new();
    let data = pb.constant(Value::bytes(vec![1, 2]));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Ldk, Address::local(0), Address::constant(data), VOID);
    g.emit(Op::Val, Address::local(1), Address::local(0), VOID);
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    let result = run(pb.build()).unwrap();
    let Value::Array(arr) = &result else { panic!() };
    assert_eq!(arr.snapshot(), vec![Value::Int(1), Value::Int(2)]);
}

#[test]
fn test_iteration_keys_of_array() {
    let mut pb = ProgramBuilder::new();
    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Arr, Address::local(0), Address::data(2), VOID);
    g.emit(Op::Key, Address::local(1), Address::local(0), VOID);
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    let result = run(pb.build()).unwrap();
    let Value::Array(arr) = &result else { panic!() };
    assert_eq!(arr.snapshot(), vec![Value::Int(0), Value::Int(1)]);
}

#[test]
fn test_missing_map_key_reads_undefined() {
    let mut pb = ProgramBuilder::new();
    let k = pb.constant(Value::string("missing"));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Map, Address::local(0), Address::data(0), VOID);
    g.emit(Op::Get, Address::local(1), Address::local(0), Address::constant(k));
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    assert_eq!(run(pb.build()).unwrap(), Value::Undefined);
}

#[test]
fn test_array_out_of_range_reads_null() {
    let mut pb = ProgramBuilder::new();
    let ninety = pb.constant(Value::Int(90));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Arr, Address::local(0), Address::data(1), VOID);
    g.emit(Op::Get, Address::local(1), Address::local(0), Address::constant(ninety));
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    assert_eq!(run(pb.build()).unwrap(), Value::Null);
}

// ── Control flow ──────────────────────────────────────────────────────

#[test]
fn test_while_loop_sums() {
    // i = 0; acc = 0; while (i < 3) { i++; acc += i }; return acc
    let mut pb = ProgramBuilder::new();
    let zero = pb.constant(Value::Int(0));
    let three = pb.constant(Value::Int(3));

    let mut g = FunctionBuilder::new("@global", 0).registers(3);
    g.emit(Op::Ldk, Address::local(0), Address::constant(zero), VOID); // 0
    g.emit(Op::Ldk, Address::local(1), Address::constant(zero), VOID); // 1
    g.emit(Op::Lst, Address::local(2), Address::local(0), Address::constant(three)); // 2
    g.emit(Op::Tjp, Address::local(2), Address::data(3), Address::data(1)); // 3: exit -> 7
    g.emit(Op::Inc, Address::local(0), VOID, VOID); // 4
    g.emit(Op::Add, Address::local(1), Address::local(1), Address::local(0)); // 5
    g.emit(Op::Jpb, Address::data(4), VOID, VOID); // 6 -> 2
    g.emit(Op::Ret, Address::local(1), VOID, VOID); // 7
    pb.add_function(g);

    assert_eq!(run(pb.build()).unwrap(), Value::Int(6));
}

// ── Entry points ──────────────────────────────────────────────────────

#[test]
fn test_main_receives_arguments() {
    let mut pb = ProgramBuilder::new();
    let bang = pb.constant(Value::string("!"));

    let mut g = FunctionBuilder::new("@global", 0).registers(0);
    g.emit(Op::Ret, VOID, VOID, VOID);
    pb.add_function(g);

    let mut main = FunctionBuilder::new("main", 1).registers(2);
    main.emit(Op::Add, Address::local(1), Address::local(0), Address::constant(bang));
    main.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(main);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    let result = vm.run(&[Value::string("hi")]).unwrap();
    assert_eq!(result, Value::string("hi!"));
}

#[test]
fn test_run_func_and_optional_padding() {
    let mut pb = ProgramBuilder::new();
    let mut g = FunctionBuilder::new("@global", 0).registers(0);
    g.emit(Op::Ret, VOID, VOID, VOID);
    pb.add_function(g);

    // helper(a, b?) returns b (undefined when omitted)
    let mut helper = FunctionBuilder::new("helper", 1).optional(1).registers(2);
    helper.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(helper);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    assert_eq!(
        vm.run_func("helper", &[Value::Int(1)]).unwrap(),
        Value::Undefined
    );
    assert_eq!(
        vm.run_func("helper", &[Value::Int(1), Value::Int(2)]).unwrap(),
        Value::Int(2)
    );
    let err = vm.run_func("helper", &[]).unwrap_err();
    assert!(err.message.contains("expects 1 arguments"), "{}", err.message);
}

#[test]
fn test_missing_entry_point() {
    let mut pb = ProgramBuilder::new();
    let mut g = FunctionBuilder::new("@global", 0).registers(0);
    g.emit(Op::Ret, VOID, VOID, VOID);
    pb.add_function(g);
    let mut vm = VM::new(Arc::new(pb.build()), None);
    let err = vm.run_func("nope", &[]).unwrap_err();
    assert_eq!(err.message, "function not found: nope");
}

// ── Host objects ──────────────────────────────────────────────────────

mod host_objects {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tarn_core::{NativeMethod, NativeObject};

    struct Range {
        n: i64,
    }

    fn range_sum(this: Value, _args: &[Value], _vm: &mut VM) -> Result<Value, RuntimeError> {
        match &this {
            Value::Object(obj) => {
                let range = obj
                    .as_any()
                    .downcast_ref::<Range>()
                    .expect("receiver is a range");
                Ok(Value::Int((0..range.n).map(|i| i * 10).sum()))
            }
            _ => Ok(Value::Null),
        }
    }

    impl NativeObject for Range {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn type_name(&self) -> &str {
            "range"
        }

        fn get_property(&self, name: &str, _vm: &mut VM) -> Result<Option<Value>, RuntimeError> {
            Ok(match name {
                "count" => Some(Value::Int(self.n)),
                _ => None,
            })
        }

        fn get_index(&self, index: i64, _vm: &mut VM) -> Result<Option<Value>, RuntimeError> {
            Ok(Some(Value::Int(index * 10)))
        }

        fn get_method(&self, name: &str) -> Option<NativeMethod> {
            match name {
                "sum" => Some(range_sum),
                _ => None,
            }
        }

        fn values(&self, _vm: &mut VM) -> Option<Result<Vec<Value>, RuntimeError>> {
            Some(Ok((0..self.n).map(|i| Value::Int(i * 10)).collect()))
        }

        fn len(&self) -> Option<usize> {
            Some(self.n as usize)
        }
    }

    #[test]
    fn test_host_object_capabilities() {
        let mut pb = ProgramBuilder::new();
        let count = pb.constant(Value::string("count"));
        let sum = pb.constant(Value::string("sum"));

        let mut g = FunctionBuilder::new("@global", 0).registers(4);
        g.emit(Op::Len, Address::local(1), Address::local(0), VOID); // 3
        g.emit(Op::Get, Address::local(2), Address::local(0), Address::data(1)); // 10
        g.emit(Op::Add, Address::local(1), Address::local(1), Address::local(2));
        g.emit(Op::Get, Address::local(2), Address::local(0), Address::constant(count)); // 3
        g.emit(Op::Add, Address::local(1), Address::local(1), Address::local(2));
        g.emit(Op::Get, Address::local(2), Address::local(0), Address::constant(sum));
        g.emit(Op::Cal, Address::local(2), Address::local(2), VOID); // 30
        g.emit(Op::Add, Address::local(1), Address::local(1), Address::local(2));
        g.emit(Op::Val, Address::local(2), Address::local(0), VOID); // [0, 10, 20]
        g.emit(Op::Len, Address::local(3), Address::local(2), VOID); // 3
        g.emit(Op::Add, Address::local(1), Address::local(1), Address::local(3));
        g.emit(Op::Ret, Address::local(1), VOID, VOID);
        pb.add_function(g);

        let globals = vec![Value::Object(Arc::new(Range { n: 3 }))];
        let mut vm = VM::new(Arc::new(pb.build()), Some(globals));
        assert_eq!(vm.run(&[]).unwrap(), Value::Int(49));
    }

    #[test]
    fn test_missing_host_property_reads_undefined() {
        let mut pb = ProgramBuilder::new();
        let nope = pb.constant(Value::string("nope"));
        let mut g = FunctionBuilder::new("@global", 0).registers(2);
        g.emit(Op::Get, Address::local(1), Address::local(0), Address::constant(nope));
        g.emit(Op::Ret, Address::local(1), VOID, VOID);
        pb.add_function(g);

        let globals = vec![Value::Object(Arc::new(Range { n: 1 }))];
        let mut vm = VM::new(Arc::new(pb.build()), Some(globals));
        assert_eq!(vm.run(&[]).unwrap(), Value::Undefined);
    }

    #[test]
    fn test_readonly_host_property_write_fails() {
        let mut pb = ProgramBuilder::new();
        let count = pb.constant(Value::string("count"));
        let one = pb.constant(Value::Int(1));
        let mut g = FunctionBuilder::new("@global", 0).registers(1);
        g.emit(Op::Set, Address::local(0), Address::constant(count), Address::constant(one));
        g.emit(Op::Ret, VOID, VOID, VOID);
        pb.add_function(g);

        let globals = vec![Value::Object(Arc::new(Range { n: 1 }))];
        let mut vm = VM::new(Arc::new(pb.build()), Some(globals));
        let err = vm.run(&[]).unwrap_err();
        assert!(err.message.contains("readonly"), "{}", err.message);
    }

    struct Gate {
        closed: AtomicBool,
    }

    impl NativeObject for Gate {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn type_name(&self) -> &str {
            "gate"
        }

        fn close(&self) -> Result<(), RuntimeError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_deferred_host_object_is_closed() {
        let defer = native_index("runtime.defer").expect("core native") as i32;
        let mut pb = ProgramBuilder::new();
        let mut g = FunctionBuilder::new("@global", 0).registers(1);
        g.emit(Op::Cas, Address::native_func(defer), VOID, Address::local(0));
        g.emit(Op::Ret, VOID, VOID, VOID);
        pb.add_function(g);

        let gate = Arc::new(Gate {
            closed: AtomicBool::new(false),
        });
        let globals = vec![Value::Object(gate.clone())];
        let mut vm = VM::new(Arc::new(pb.build()), Some(globals));
        vm.run(&[]).unwrap();
        assert!(gate.closed.load(Ordering::SeqCst));
    }
}

#[test]
fn test_finalizer_error_does_not_mask_result() {
    let defer = native_index("runtime.defer").expect("core native") as i32;
    let mut pb = ProgramBuilder::new();
    let boom = pb.constant(Value::string("cleanup failed"));
    let ok = pb.constant(Value::string("done"));

    let mut g = FunctionBuilder::new("@global", 0).registers(2);
    g.emit(Op::Clo, Address::local(0), Address::func(1), VOID);
    g.emit(Op::Cas, Address::native_func(defer), VOID, Address::local(0));
    g.emit(Op::Ldk, Address::local(1), Address::constant(ok), VOID);
    g.emit(Op::Ret, Address::local(1), VOID, VOID);
    pb.add_function(g);

    let mut bad = FunctionBuilder::new("bad_cleanup", 0).registers(0);
    bad.emit(Op::Trw, Address::constant(boom), VOID, VOID);
    pb.add_function(bad);

    let mut vm = VM::new(Arc::new(pb.build()), None);
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::string("done"));
    let errors = vm.finalizer_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "cleanup failed");
}

#[test]
fn test_rethrow_keeps_stack_trace() {
    let rethrow = native_index("errors.rethrow").expect("core native") as i32;
    let new_error = native_index("errors.newError").expect("core native") as i32;
    let mut pb = ProgramBuilder::new();
    let oops = pb.constant(Value::string("oops"));
    let trace = pb.constant(Value::string("stackTrace"));

    // try { e = newError("oops"); rethrow(e) } catch (e2) { return e2.stackTrace }
    let mut g = FunctionBuilder::new("@global", 0).registers(3);
    g.emit(Op::Try, Address::data(3), Address::local(0), VOID); // 0
    g.emit(Op::Cas, Address::native_func(new_error), Address::local(1), Address::constant(oops)); // 1
    g.emit(Op::Cas, Address::native_func(rethrow), Address::local(2), Address::local(1)); // 2
    g.emit(Op::Get, Address::local(2), Address::local(0), Address::constant(trace)); // 3 catch
    g.emit(Op::Cen, VOID, VOID, VOID); // 4
    g.emit(Op::Ret, Address::local(2), VOID, VOID); // 5
    pb.add_function(g);

    let result = run(pb.build()).unwrap();
    // the trace recorded when the error was created, not where it was rethrown
    let Value::String(trace) = &result else {
        panic!("expected string, got {result:?}");
    };
    assert!(trace.contains("@global"), "{trace}");
}
