//! Property-based tests for the compiler and the runtime.
//!
//! Tests the following properties:
//! - A chunk holds up to 256 constants; the 257th is a compile error
//! - Reference counts balance over arbitrary retain/release sequences
//! - Jumps land correctly in arbitrarily nested if/while/repeat blocks
//! - Bitwise operators accept integral operands and reject fractional ones

use std::io;

use proptest::prelude::*;
use rat::bytecode::compile_error::CompileErrorKind;
use rat::bytecode::verify::verify;
use rat::lang::heap::{Heap, HeapError, Object};
use rat::{ExitCode, RatError, Vm, VmConfig, compile};

fn run(source: &str) -> (Result<(), RatError>, String) {
    let mut out = Vec::new();
    let result = {
        let mut vm = Vm::with_io(VmConfig::default(), &mut out, io::empty());
        rat::run(source, &mut vm)
    };
    (result, String::from_utf8(out).unwrap())
}

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum HeapOp {
    Alloc,
    Retain(usize),
    Release(usize),
}

fn arb_heap_op() -> impl Strategy<Value = HeapOp> {
    prop_oneof![
        1 => Just(HeapOp::Alloc),
        2 => any::<usize>().prop_map(HeapOp::Retain),
        2 => any::<usize>().prop_map(HeapOp::Release),
    ]
}

/// Statements whose output is known without running them.
#[derive(Debug, Clone)]
enum Stmt {
    Print(u8),
    If(bool, Vec<Stmt>, Vec<Stmt>),
    While(u8, Vec<Stmt>),
    Repeat(u8, Vec<Stmt>),
}

fn arb_block(inner: impl Strategy<Value = Stmt>) -> impl Strategy<Value = Vec<Stmt>> {
    prop::collection::vec(inner, 1..3)
}

fn arb_stmt() -> impl Strategy<Value = Stmt> {
    let leaf = any::<u8>().prop_map(Stmt::Print);
    leaf.prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            (any::<bool>(), arb_block(inner.clone()), arb_block(inner.clone()))
                .prop_map(|(c, t, e)| Stmt::If(c, t, e)),
            (0u8..3, arb_block(inner.clone())).prop_map(|(n, b)| Stmt::While(n, b)),
            (1u8..3, arb_block(inner)).prop_map(|(n, b)| Stmt::Repeat(n, b)),
        ]
    })
}

/// Render statements as source. Each `while` gets its own global counter,
/// declared up front and reset before the loop.
fn render(stmts: &[Stmt], depth: usize, counters: &mut usize, out: &mut String) {
    let pad = "    ".repeat(depth);
    for stmt in stmts {
        match stmt {
            Stmt::Print(n) => out.push_str(&format!("{}print({})\n", pad, n)),
            Stmt::If(cond, then, otherwise) => {
                out.push_str(&format!("{}if {}:\n", pad, cond));
                render(then, depth + 1, counters, out);
                out.push_str(&format!("{}else:\n", pad));
                render(otherwise, depth + 1, counters, out);
                out.push_str(&format!("{}endif\n", pad));
            }
            Stmt::While(times, body) => {
                let counter = format!("w{}", *counters);
                *counters += 1;
                out.push_str(&format!("{}{} = 0\n", pad, counter));
                out.push_str(&format!("{}while {} < {}:\n", pad, counter, times));
                render(body, depth + 1, counters, out);
                out.push_str(&format!("{}    {}++\n", pad, counter));
                out.push_str(&format!("{}endwhile\n", pad));
            }
            Stmt::Repeat(times, body) => {
                out.push_str(&format!("{}repeat {}:\n", pad, times));
                render(body, depth + 1, counters, out);
                out.push_str(&format!("{}endrepeat\n", pad));
            }
        }
    }
}

fn source_for(stmts: &[Stmt], in_runnable: bool) -> String {
    let mut body = String::new();
    let mut counters = 0;
    let depth = usize::from(in_runnable);
    render(stmts, depth, &mut counters, &mut body);

    let mut source: String = (0..counters).map(|i| format!("rat w{} = 0\n", i)).collect();
    if in_runnable {
        source.push_str("runnable main():\n");
        source.push_str(&body);
        source.push_str("endrunnable\nmain()\n");
    } else {
        source.push_str(&body);
    }
    source
}

fn expected_output(stmts: &[Stmt], out: &mut String) {
    for stmt in stmts {
        match stmt {
            Stmt::Print(n) => out.push_str(&format!("{}\n", n)),
            Stmt::If(cond, then, otherwise) => {
                expected_output(if *cond { then } else { otherwise }, out)
            }
            Stmt::While(times, body) | Stmt::Repeat(times, body) => {
                for _ in 0..*times {
                    expected_output(body, out);
                }
            }
        }
    }
}

// =============================================================================
// Constant pool bound
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Every literal takes its own slot, so the 257th overflows the pool.
    #[test]
    fn constant_pool_holds_256(count in 1usize..300) {
        let source: String = (0..count).map(|i| format!("{}\n", i)).collect();
        match compile(&source) {
            Ok(program) => {
                prop_assert!(count <= 256, "{} literals compiled", count);
                prop_assert_eq!(program.functions[0].chunk.constants.len(), count);
            }
            Err(errors) => {
                prop_assert!(count > 256, "{} literals rejected: {}", count, errors);
                prop_assert_eq!(errors.0[0].kind, CompileErrorKind::ConstantsOverflow);
                prop_assert_eq!(errors.0[0].line, 257);
            }
        }
    }
}

// =============================================================================
// Reference counting
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The heap agrees with a plain count model, and an object is freed by
    /// exactly the release that drops its last reference.
    #[test]
    fn refcounts_follow_the_model(ops in prop::collection::vec(arb_heap_op(), 1..64)) {
        let mut heap = Heap::new();
        let mut model = Vec::new();

        for op in ops {
            match op {
                HeapOp::Alloc => {
                    let r = heap.alloc(Object::String(format!("s{}", model.len())));
                    heap.retain(r).unwrap();
                    model.push((r, 1usize));
                }
                HeapOp::Retain(i) if !model.is_empty() => {
                    let at = i % model.len();
                    let (r, count) = &mut model[at];
                    if *count > 0 {
                        heap.retain(*r).unwrap();
                        *count += 1;
                    }
                }
                HeapOp::Release(i) if !model.is_empty() => {
                    let at = i % model.len();
                    let (r, count) = &mut model[at];
                    if *count == 0 {
                        let stale = matches!(heap.release(*r), Err(HeapError::Stale { .. }));
                        prop_assert!(stale, "release of a freed handle was accepted");
                    } else {
                        *count -= 1;
                        prop_assert_eq!(heap.release(*r).unwrap(), *count == 0);
                    }
                }
                _ => {}
            }
        }

        for (r, count) in &model {
            prop_assert_eq!(heap.ref_count(*r).unwrap_or(0), *count);
        }
        for (r, count) in &model {
            for _ in 0..*count {
                heap.release(*r).unwrap();
            }
        }

        let stats = heap.stats();
        prop_assert_eq!(heap.live_objects(), 0);
        prop_assert_eq!(stats.retains, stats.releases);
        prop_assert_eq!(stats.frees, stats.allocations);
    }

    /// Whole programs leave nothing behind once the VM is torn down.
    #[test]
    fn string_programs_balance(
        words in prop::collection::vec("[a-z]{1,6}", 1..6),
        times in 1u8..5,
    ) {
        let mut source = String::from("rat acc = \"\"\nrunnable join(a, b):\n    return a + b\nendrunnable\n");
        source.push_str(&format!("repeat {}:\n", times));
        for word in &words {
            source.push_str(&format!("    acc = join(acc, \"{}\")\n", word));
        }
        source.push_str("endrepeat\nprint(acc)\n");

        let program = compile(&source).unwrap();
        let mut out = Vec::new();
        let stats = {
            let mut vm = Vm::with_io(VmConfig::default(), &mut out, io::empty());
            vm.interpret(&program).unwrap();
            vm.teardown()
        };

        let expected = format!("{}\n", words.concat().repeat(times as usize));
        prop_assert_eq!(String::from_utf8(out).unwrap(), expected);
        prop_assert_eq!(stats.retains, stats.releases);
        prop_assert_eq!(stats.frees, stats.allocations);
        prop_assert_eq!(stats.swept, 0);
    }
}

// =============================================================================
// Control flow
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn nested_blocks_run_as_written(
        stmts in prop::collection::vec(arb_stmt(), 1..4),
        in_runnable in any::<bool>(),
    ) {
        let source = source_for(&stmts, in_runnable);
        let program = compile(&source)
            .map_err(|e| TestCaseError::fail(format!("{}\n{}", e, source)))?;
        prop_assert!(verify(&program).is_ok(), "unverified:\n{}", source);

        let (result, out) = run(&source);
        prop_assert!(result.is_ok(), "{:?}\n{}", result, source);

        let mut expected = String::new();
        expected_output(&stmts, &mut expected);
        prop_assert_eq!(out, expected, "{}", source);
    }
}

// =============================================================================
// Bitwise gating
// =============================================================================

fn and(a: i32, b: i32) -> i32 {
    a & b
}

fn or(a: i32, b: i32) -> i32 {
    a | b
}

fn xor(a: i32, b: i32) -> i32 {
    a ^ b
}

fn shl(a: i32, b: i32) -> i32 {
    a << b
}

fn shr(a: i32, b: i32) -> i32 {
    a >> b
}

type BitOp = (&'static str, fn(i32, i32) -> i32);

fn arb_bit_op() -> impl Strategy<Value = BitOp> {
    prop::sample::select(vec![
        ("&", and as fn(i32, i32) -> i32),
        ("|", or),
        ("^", xor),
        ("<<", shl),
        (">>", shr),
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn integral_operands_combine(
        a in -1000i32..1000,
        b in 0i32..8,
        (symbol, apply) in arb_bit_op(),
    ) {
        let (result, out) = run(&format!("print({} {} {})", a, symbol, b));
        prop_assert!(result.is_ok(), "{:?}", result);
        prop_assert_eq!(out, format!("{}\n", apply(a, b) as f32));
    }

    #[test]
    fn fractional_operands_are_type_errors(
        a in -1000i32..1000,
        b in 0i32..8,
        (symbol, _) in arb_bit_op(),
        left in any::<bool>(),
    ) {
        let source = if left {
            format!("print({}.5 {} {})", a, symbol, b)
        } else {
            format!("print({} {} {}.5)", a, symbol, b)
        };
        match run(&source).0 {
            Err(RatError::Runtime(e)) => prop_assert_eq!(e.code, ExitCode::TypeError),
            other => prop_assert!(false, "{}: {:?}", source, other),
        }
    }
}
