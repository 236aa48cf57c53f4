//! End-to-end runs of complete Rat programs.

use std::io;

use pretty_assertions::assert_eq;
use rat::bytecode::compile_error::CompileErrorKind;
use rat::bytecode::program::BytecodeError;
use rat::bytecode::verify::verify;
use rat::{ExitCode, Program, RatError, Vm, VmConfig, compile};

/// Run `source` on a fresh VM and collect what it printed.
fn run(source: &str) -> (Result<(), RatError>, String) {
    let mut out = Vec::new();
    let result = {
        let mut vm = Vm::with_io(VmConfig::default(), &mut out, io::empty());
        rat::run(source, &mut vm)
    };
    (result, String::from_utf8(out).unwrap())
}

fn output_of(source: &str) -> String {
    let (result, out) = run(source);
    if let Err(e) = result {
        panic!("program failed:\n{}\noutput so far:\n{}", e, out);
    }
    out
}

fn runtime_error(source: &str) -> rat::RuntimeError {
    match run(source).0 {
        Err(RatError::Runtime(e)) => e,
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

fn compile_errors(source: &str) -> rat::CompileErrors {
    match run(source).0 {
        Err(RatError::Compile(e)) => e,
        other => panic!("expected compile errors, got {:?}", other),
    }
}

// =============================================================================
// Reference scenarios
// =============================================================================

#[test]
fn scenario_globals() {
    assert_eq!(output_of("rat x = 3\nx = x + 4\nprint(x)"), "7\n");
}

#[test]
fn scenario_repeat() {
    assert_eq!(
        output_of("repeat 3:\n    print(\"hi\")\nendrepeat\n"),
        "hi\nhi\nhi\n"
    );
}

#[test]
fn scenario_factorial() {
    let source = "\
runnable fact(n):
    if n < 2:
        return 1
    endif
    return n * fact(n - 1)
endrunnable

print(fact(5))
";
    assert_eq!(output_of(source), "120\n");
}

#[test]
fn scenario_factorial_wrong_arity() {
    let source = "\
runnable fact(n):
    return n
endrunnable
print(fact(5, 6))
";
    let errors = compile_errors(source);
    assert_eq!(errors.0[0].kind, CompileErrorKind::UndefinedRunnable);
    assert_eq!(errors.code(), 107);
}

#[test]
fn scenario_incomplete_expression() {
    let errors = compile_errors("print(1 +)");
    assert_eq!(errors.0[0].message, "Expected expression");
    assert_eq!(
        errors.to_string(),
        "[Compilation error in line 1, at ')']: Expected expression"
    );
}

#[test]
fn scenario_bitwise_gating() {
    let err = runtime_error("print(5 & 2.5)");
    assert_eq!(err.code, ExitCode::TypeError);
    assert_eq!(err.code.code(), 204);
    assert_eq!(output_of("print(5 & 2)"), "0\n");
}

// =============================================================================
// Larger programs
// =============================================================================

#[test]
fn script_level_rat_in_a_loop_is_redeclared() {
    let source = "\
rat i = 0
while i < 2:
    rat line = \"x\"
    i++
endwhile
";
    // Globals are defined when the statement runs, so the second pass fails.
    let err = runtime_error(source);
    assert_eq!(err.code, ExitCode::RedeclaredIdentifier);
    assert_eq!(err.line, 3);
}

#[test]
fn counting_with_runnables() {
    let source = "\
runnable is_even(n):
    return (n & 1) == 0
endrunnable

runnable count_even(limit):
    rat count = 0
    rat i = 0
    while i < limit:
        if is_even(i):
            count++
        endif
        i++
    endwhile
    return count
endrunnable

print(count_even(10))
print(count_even(7))
";
    assert_eq!(output_of(source), "5\n4\n");
}

#[test]
fn mutual_calls_and_string_building() {
    let source = "\
runnable stars(n):
    rat s = \"\"
    repeat n:
        s += \"*\"
    endrepeat
    return s
endrunnable

runnable triangle(rows):
    rat r = 1
    while r <= rows:
        print(stars(r))
        r++
    endwhile
endrunnable

triangle(3)
";
    assert_eq!(output_of(source), "*\n**\n***\n");
}

#[test]
fn recursion_restores_caller_locals() {
    let source = "\
runnable descend(n):
    rat before = n * 10
    rat tag = \"level\"
    if n > 0:
        rat inner = descend(n - 1)
        print(tag + String(before) + \":\" + String(inner))
    endif
    return before
endrunnable

rat top = descend(3)
print(top)
";
    assert_eq!(
        output_of(source),
        "level10:0\nlevel20:10\nlevel30:20\n30\n"
    );

    // Every frame is unwound back to the caller's height.
    let program = compile(source).unwrap();
    let mut vm = Vm::with_io(VmConfig::default(), io::sink(), io::empty());
    vm.interpret(&program).unwrap();
    assert!(vm.stack().is_empty());
    assert!(vm.frames().is_empty());
}

#[test]
fn comments_and_blank_lines() {
    let source = "\
# leading comment
rat a = 2   # trailing comment

# another
print(a << 3)
";
    assert_eq!(output_of(source), "16\n");
}

#[test]
fn conversions_round_trip_through_strings() {
    let source = "\
rat n = Number(\"12.5\")
rat s = String(n * 2)
print(s + \"!\")
print(Type(s))
print(Boolean(\"false\") or \"fallback\")
";
    assert_eq!(output_of(source), "25!\nSTRING\nfallback\n");
}

// =============================================================================
// Error reporting
// =============================================================================

#[test]
fn runtime_error_inside_nested_call_reports_its_line() {
    let source = "\
rat total = 0

runnable inner(x):
    return x + none
endrunnable

runnable outer(x):
    return inner(x) * 2
endrunnable

print(outer(1))
";
    let err = runtime_error(source);
    assert_eq!(err.code, ExitCode::TypeError);
    assert_eq!(err.line, 4);
    assert!(err.to_string().starts_with("[Runtime error in line 4]"));
}

#[test]
fn compile_errors_are_all_reported() {
    let source = "\
rat = 1
print(1
rat ok = 2
endwhile
";
    let errors = compile_errors(source);
    let lines: Vec<usize> = errors.iter().map(|e| e.line).collect();
    assert_eq!(lines, vec![1, 2, 4]);
}

#[test]
fn exit_codes() {
    assert_eq!(run("print(nothing)").0.unwrap_err().exit_code(), 205);
    assert_eq!(run("rat a\nrat a").0.unwrap_err().exit_code(), 206);
    assert_eq!(run("nope()").0.unwrap_err().exit_code(), 107);
    assert_eq!(run("rat x = \"a\" - 1").0.unwrap_err().exit_code(), 204);
}

// =============================================================================
// Reference counting across a whole run
// =============================================================================

#[test]
fn heap_is_balanced_after_teardown() {
    let source = "\
rat words = \"\"
runnable shout(w):
    return w + \"!\"
endrunnable
repeat 10:
    words = words + shout(\"rat\")
endrepeat
print(Type(words))
";
    let program = compile(source).unwrap();
    let mut vm = Vm::with_io(VmConfig::default(), io::sink(), io::empty());
    vm.interpret(&program).unwrap();

    let stats = vm.teardown();
    assert_eq!(stats.retains, stats.releases);
    assert_eq!(stats.frees, stats.allocations);
    assert_eq!(stats.swept, 0);
}

#[test]
fn failed_run_is_reclaimed_by_teardown() {
    let program = compile("runnable f(s):\nreturn s + 1\nendrunnable\nf(\"x\")").unwrap();
    let mut vm = Vm::with_io(VmConfig::default(), io::sink(), io::empty());
    assert!(vm.interpret(&program).is_err());
    assert!(!vm.stack().is_empty());

    let stats = vm.teardown();
    assert_eq!(stats.frees + stats.swept, stats.allocations);
    assert_eq!(vm.heap().live_objects(), 0);
}

// =============================================================================
// Bytecode files
// =============================================================================

#[test]
fn bytecode_round_trip() {
    let source = "\
runnable square(n):
    return n * n
endrunnable
print(square(9))
";
    let program = compile(source).unwrap();
    let bytes = program.to_bytes().unwrap();
    assert_eq!(&bytes[..4], b"RATC");

    let loaded = Program::from_bytes(&bytes).unwrap();
    assert_eq!(loaded, program);

    let mut out = Vec::new();
    {
        let mut vm = Vm::with_io(VmConfig::default(), &mut out, io::empty());
        vm.interpret(&loaded).unwrap();
    }
    assert_eq!(String::from_utf8(out).unwrap(), "81\n");
}

#[test]
fn bytecode_rejects_bad_header() {
    assert!(matches!(
        Program::from_bytes(b"NOPE\x01"),
        Err(BytecodeError::BadMagic)
    ));
    assert!(matches!(
        Program::from_bytes(b"RATC\x09"),
        Err(BytecodeError::UnsupportedVersion(9))
    ));
}

#[test]
fn bytecode_is_verified_on_load() {
    let mut program = compile("rat x = 1").unwrap();
    // Point the constant load past the end of the pool.
    program.functions[0].chunk.code[1] = 200;
    let bytes = program.to_bytes().unwrap();
    assert!(matches!(
        Program::from_bytes(&bytes),
        Err(BytecodeError::Invalid(_))
    ));
}

#[test]
fn compiled_programs_verify() {
    let sources = [
        "rat a = 1\nif a:\nprint(a)\nelse:\nprint(0)\nendif",
        "runnable f(a, b):\nrepeat a:\nrat t = b\nb += t\nendrepeat\nreturn b\nendrunnable\nprint(f(3, 1))",
        "rat i = 0\nwhile i < 3 and i >= 0:\ni++\nendwhile",
    ];
    for source in sources {
        let program = compile(source).unwrap();
        verify(&program).unwrap_or_else(|e| panic!("{}\n{}", source, e));
    }
}
