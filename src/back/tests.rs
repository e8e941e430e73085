//! End-to-end tests: source text through the whole pipeline to assembly.

use crate::back::emit::code_gen;
use crate::front::parse::{parse, Unit};
use crate::front::symtab::{collect_warnings, CallGraph};
use crate::middle::cfg::{build_cfg, Module};
use crate::middle::opt::optimize;

fn compile(source: &str) -> (Unit, Module, String) {
    let mut unit = parse(source);
    assert!(!unit.root.is_err(), "{:?}", unit.root);
    let mut module = build_cfg(&mut unit);
    optimize(&mut module, &unit.types);
    let asm = code_gen(&mut unit, &mut module);
    (unit, module, asm)
}

#[test]
fn fibonacci_compiles_and_is_recursive() {
    let (unit, module, asm) = compile(
        "fn fib(n: i32) -> i32 {\n\
           if (n < 2) { return n; }\n\
           return fib(n - 1) + fib(n - 2);\n\
         }\n",
    );
    let graph = CallGraph::build(&unit.functions);
    assert!(graph.is_directly_recursive(module.funcs[0].id));
    assert!(asm.contains("call fib"), "{asm}");
    assert!(asm.contains("fib:"), "{asm}");
}

#[test]
fn loops_compile_to_labeled_backward_jumps() {
    let (_unit, _module, asm) = compile(
        "fn sum(n: i32) -> i32 {\n\
           let mut s: i32 = 0;\n\
           let mut i: i32 = 0;\n\
           while (i < n) { s = s + i; i = i + 1; }\n\
           return s;\n\
         }\n",
    );
    assert!(asm.contains("jmp .Lsum_"), "{asm}");
    assert!(asm.contains("jl .Lsum_") || asm.contains("jge .Lsum_"), "{asm}");
}

#[test]
fn structs_and_pointers_round_through_memory() {
    let (_unit, _module, asm) = compile(
        "struct point { x: i64; y: i64; }\n\
         fn norm2(p: *point) -> i64 {\n\
           let a: i64 = (*p).x;\n\
           let b: i64 = (*p).y;\n\
           return a * a + b * b;\n\
         }\n",
    );
    // the y field loads from offset 8
    assert!(asm.contains("8("), "{asm}");
}

#[test]
fn arrays_use_stack_regions() {
    let (_unit, module, asm) = compile(
        "fn f() -> i32 {\n\
           let buf: [i32; 4];\n\
           buf[0] = 3;\n\
           buf[1] = 4;\n\
           return buf[0];\n\
         }\n",
    );
    let func = &module.funcs[0];
    assert!(func.local_area.total_size() >= 16, "{asm}");
    assert_eq!(func.local_area.total_size() % 16, 0);
    assert!(asm.contains("(%rbp)"), "{asm}");
}

#[test]
fn eight_argument_call_spills_to_the_stack() {
    let (_unit, _module, asm) = compile(
        "fn f() -> i32 {\n\
           return g(1, 2, 3, 4, 5, 6, 7, 8);\n\
         }\n",
    );
    assert!(asm.contains("pushq"), "{asm}");
    assert!(asm.contains("call g"), "{asm}");
    assert!(asm.contains("addq $16, %rsp"), "{asm}");
}

#[test]
fn seven_plus_parameters_load_from_the_parameter_area() {
    let (_unit, module, _asm) = compile(
        "fn f(a: i64, b: i64, c: i64, d: i64, e: i64, g: i64, h: i64) -> i64 {\n\
           return a + h;\n\
         }\n",
    );
    let func = &module.funcs[0];
    assert!(!func.param_area.is_empty());
    assert!(func.param_area.live_regions().next().unwrap().base >= 16);
}

#[test]
fn warnings_arrive_in_source_order() {
    let (unit, _module, _asm) = compile(
        "priv fn unused() -> i32 { return 1; }\n\
         fn main() -> i32 {\n\
           let mut x: i32 = 3;\n\
           return 0;\n\
         }\n",
    );
    let warnings = collect_warnings(&unit.functions, &unit.variables, &unit.types);
    assert!(warnings.len() >= 2, "{warnings:?}");
    for pair in warnings.windows(2) {
        assert!(pair[0].line <= pair[1].line);
    }
    assert!(warnings[0].message.contains("unused"));
}

#[test]
fn compilation_is_deterministic() {
    let source = "fn f(a: i32, b: i32) -> i32 {\n\
                    let mut m: i32 = a;\n\
                    if (b > a) { m = b; }\n\
                    return m * 2;\n\
                  }\n";
    let (_u1, _m1, first) = compile(source);
    let (_u2, _m2, second) = compile(source);
    assert_eq!(first, second);
}

#[test]
#[should_panic(expected = "error-tainted")]
fn error_roots_refuse_the_back_end() {
    let mut unit = parse("fn broken( {");
    assert!(unit.root.is_err());
    let _ = build_cfg(&mut unit);
}

#[test]
fn defer_runs_before_return() {
    let (_unit, module, _asm) = compile(
        "fn f(p: *mut i32) -> i32 {\n\
           defer { *p = 9; }\n\
           return 1;\n\
         }\n",
    );
    // the deferred store is lowered ahead of the return
    let func = &module.funcs[0];
    let printed = func.print_oir();
    let store = printed.find("] <-").expect("a store from the deferred body");
    let ret = printed.rfind("ret").unwrap();
    assert!(store < ret, "{printed}");
}

#[test]
fn inline_asm_passes_through() {
    let (_unit, _module, asm) = compile(
        "fn f() {\n\
           asm(\"mfence\");\n\
         }\n",
    );
    assert!(asm.contains("mfence"), "{asm}");
}
