// Integration tests for the quill interpreter.
//
// These run complete programs through `Vm::interpret` and check the
// outcome (`InterpretResult`). The VM currently has no hook for
// capturing `print` output outside the process's own stdout, so these
// tests verify control flow and error classification end to end
// (matching spec scenarios) rather than printed text.

use quill::errors::InterpretResult;
use quill::vm::Vm;

fn run(src: &str) -> InterpretResult {
    let mut vm = Vm::new();
    vm.interpret(src.as_bytes())
}

#[test]
fn arithmetic_precedence_and_print() {
    assert_eq!(run("print 1 + 2 * 3;"), InterpretResult::Ok);
}

#[test]
fn block_scoping_shadows_and_restores_outer_binding() {
    let src = r#"
        var a = 2;
        { var a = a + 1; print a; }
        print a;
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn closures_capture_and_mutate_shared_upvalue() {
    let src = r#"
        fun makeCounter() {
            var c = 0;
            fun inc() { c = c + 1; return c; }
            return inc;
        }
        var f = makeCounter();
        print f();
        print f();
        print f();
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn upvalue_stays_alive_after_owning_frame_returns() {
    let src = r#"
        fun outer() {
            var x = "outer";
            fun inner() { return x; }
            return inner;
        }
        print outer()();
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn for_loop_break_and_continue_keep_stack_balanced() {
    let src = r#"
        for (var i = 0; i < 3; i = i + 1) {
            if (i == 1) continue;
            if (i == 2) break;
            print i;
        }
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn while_loop_with_nested_break() {
    let src = r#"
        var i = 0;
        while (true) {
            i = i + 1;
            if (i >= 5) break;
        }
        print i;
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn ternary_expression_selects_branch() {
    assert_eq!(run("print true ? 1 : 2;"), InterpretResult::Ok);
}

#[test]
fn switch_statement_dispatches_matching_case() {
    let src = r#"
        var x = 2;
        switch (x) {
            case 1: print "one"; break;
            case 2: print "two"; break;
            default: print "other";
        }
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn string_concatenation_and_interning() {
    let src = r#"
        var a = "foo" + "bar";
        print a;
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn classes_with_initializer_and_inheritance_and_super_call() {
    let src = r#"
        class Animal {
            init(name) { this.name = name; }
            speak() { return this.name; }
        }
        class Dog < Animal {
            speak() { return "Woof, " + super.speak(); }
        }
        var d = Dog("Rex");
        print d.speak();
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn method_invocation_shortcut_opcode_path() {
    let src = r#"
        class Greeter {
            greet(name) { return "hi " + name; }
        }
        print Greeter().greet("world");
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn const_declaration_requires_initializer() {
    assert_eq!(run("const X;"), InterpretResult::CompileError);
}

#[test]
fn const_reassignment_is_rejected_at_compile_time() {
    assert_eq!(run("const PI = 3; PI = 4;"), InterpretResult::CompileError);
}

#[test]
fn const_local_reassignment_is_also_rejected() {
    let src = r#"
        fun f() {
            const x = 1;
            x = 2;
        }
    "#;
    assert_eq!(run(src), InterpretResult::CompileError);
}

#[test]
fn declared_but_unassigned_global_is_undefined_not_nil() {
    assert_eq!(run("var x; x;"), InterpretResult::RuntimeError);
}

#[test]
fn declared_but_unassigned_local_is_nil_not_undefined() {
    let src = r#"
        fun f() {
            var x;
            return x == nil;
        }
        print f();
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn calling_undefined_global_function_is_runtime_error() {
    assert_eq!(run("doesNotExist();"), InterpretResult::RuntimeError);
}

#[test]
fn adding_number_to_string_is_runtime_error() {
    assert_eq!(run(r#"print 1 + "a";"#), InterpretResult::RuntimeError);
}

#[test]
fn break_outside_a_loop_is_a_compile_error() {
    assert_eq!(run("break;"), InterpretResult::CompileError);
}

#[test]
fn continue_outside_a_loop_is_a_compile_error() {
    assert_eq!(run("continue;"), InterpretResult::CompileError);
}

#[test]
fn return_at_top_level_is_a_compile_error() {
    assert_eq!(run("return 1;"), InterpretResult::CompileError);
}

#[test]
fn this_outside_a_method_is_a_compile_error() {
    assert_eq!(run("print this;"), InterpretResult::CompileError);
}

#[test]
fn super_without_a_superclass_is_a_compile_error() {
    let src = r#"
        class A {
            speak() { return super.speak(); }
        }
    "#;
    assert_eq!(run(src), InterpretResult::CompileError);
}

#[test]
fn recursive_function_runs_to_completion() {
    let src = r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    "#;
    assert_eq!(run(src), InterpretResult::Ok);
}

#[test]
fn clock_native_function_is_callable() {
    assert_eq!(run("print clock() >= 0;"), InterpretResult::Ok);
}

#[test]
fn a_second_interpret_call_on_a_fresh_vm_is_independent() {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret(b"var x = 1;"), InterpretResult::Ok);
    assert_eq!(vm.interpret(b"print x + 1;"), InterpretResult::Ok);
}
