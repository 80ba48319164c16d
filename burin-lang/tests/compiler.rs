//! End-to-end tests driving the incremental compiler facade.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use burin_lang::{Compiler, DeclKind, Error};
use burin_vm::{Boxed, CollectTerminal, Endian, IosFlags, Value};

fn runtime_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/runtime"))
}

fn compiler() -> (Compiler, Rc<RefCell<CollectTerminal>>) {
    let term = CollectTerminal::shared();
    let compiler = Compiler::new(runtime_dir(), term.clone()).expect("bootstrap");
    (compiler, term)
}

fn int_of(compiler: &Compiler, val: Value) -> i64 {
    compiler.vm().heap().as_i64(val).expect("integral value")
}

#[test]
fn bootstrap_loads_runtime_and_std() {
    let (compiler, _) = compiler();
    assert!(compiler.bootstrapped());
    assert!(compiler.decl_p("load_path", DeclKind::Var));
    assert!(compiler.decl_p("Exception", DeclKind::Type));
    assert!(compiler.decl_p("abs", DeclKind::Func));
    assert!(compiler.decl_p("byte", DeclKind::Unit));
}

#[test]
fn integer_addition_with_promotion() {
    let (mut compiler, term) = compiler();
    let out = compiler.compile_expression("1 + 2H").unwrap();
    let val = out.value.unwrap();
    let (bits, width, signed) = compiler.vm().heap().as_integral(val).unwrap();
    assert_eq!(bits, 3);
    assert_eq!(width, 32);
    assert!(signed);
    assert!(!term.borrow().out.contains("warning"));
}

#[test]
fn offset_arithmetic_normalizes_units() {
    let (mut compiler, _) = compiler();
    let out = compiler.compile_expression("1#B + 8#b").unwrap();
    let val = out.value.unwrap();
    let Some(Boxed::Off(off)) = val.box_id().map(|id| compiler.vm().heap().get(id)) else {
        panic!("expected an offset result");
    };
    assert_eq!(compiler.vm().heap().as_i64(off.magnitude), Some(2));
    assert_eq!(compiler.vm().heap().as_u64(off.unit), Some(8));
}

#[test]
fn array_literal_indexing_folds() {
    let (mut compiler, _) = compiler();
    let out = compiler.compile_expression("[10, 20, 30][1]").unwrap();
    let val = out.value.unwrap();
    let (bits, width, signed) = compiler.vm().heap().as_integral(val).unwrap();
    assert_eq!(bits, 20);
    assert_eq!(width, 32);
    assert!(signed);
}

#[test]
fn struct_with_dependent_array_field() {
    let (mut compiler, _) = compiler();
    compiler
        .compile_buffer("type Packet = struct { uint<8> len; uint<8>[len] data; };")
        .unwrap();
    let out = compiler
        .compile_expression("Packet { len = 2, data = [0xAA, 0xBB] }")
        .unwrap();
    let val = out.value.unwrap();

    assert_eq!(compiler.vm().heap().size_of(val), 24);

    let Some(Boxed::Sct(sct)) = val.box_id().map(|id| compiler.vm().heap().get(id)) else {
        panic!("expected a struct value");
    };
    let heap = compiler.vm().heap();
    assert_eq!(sct.fields.len(), 2);
    assert_eq!(heap.as_u64(sct.fields[1].boffset), Some(8));
    let Some(Boxed::Arr(data)) = sct.fields[1].value.box_id().map(|id| heap.get(id)) else {
        panic!("expected an array field");
    };
    assert_eq!(data.elems.len(), 2);
    assert_eq!(heap.as_u64(data.elems[0].value), Some(0xAA));
    assert_eq!(heap.as_u64(data.elems[1].value), Some(0xBB));
    let (_, width, signed) = heap.as_integral(data.elems[0].value).unwrap();
    assert_eq!(width, 8);
    assert!(!signed);
}

#[test]
fn snapshot_rolls_back_on_parse_failure() {
    let (mut compiler, _term) = compiler();
    compiler.compile_buffer("var x = 1;").unwrap();
    assert!(matches!(
        compiler.compile_buffer("var ? = ;"),
        Err(Error::Compile)
    ));
    let out = compiler.compile_expression("x").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 1);
}

#[test]
fn literal_conditional_hides_dead_division() {
    let (mut compiler, term) = compiler();
    let out = compiler.compile_expression("1 ? 42 : 0/0").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 42);
    assert!(!term.borrow().out.contains("division"));
}

#[test]
fn division_by_literal_zero_is_a_compile_error() {
    let (mut compiler, term) = compiler();
    assert!(matches!(
        compiler.compile_expression("7 / 0"),
        Err(Error::Compile)
    ));
    assert!(term.borrow().out.contains("division by zero"));
}

#[test]
fn oversized_shift_count_is_a_compile_error() {
    let (mut compiler, term) = compiler();
    assert!(compiler.compile_expression("1 << 32").is_err());
    assert!(term.borrow().out.contains("count in left bit shift too big"));
}

#[test]
fn string_index_out_of_bounds_is_a_compile_error() {
    let (mut compiler, term) = compiler();
    assert!(compiler.compile_expression("\"ab\"[5]").is_err());
    assert!(term.borrow().out.contains("out of bounds of string"));
}

#[test]
fn missing_return_value_is_a_compile_error() {
    let (mut compiler, term) = compiler();
    assert!(compiler
        .compile_buffer("fun broken = (int<32> v) int<32> { v; }")
        .is_err());
    assert!(term.borrow().out.contains("expects a return value"));
}

#[test]
fn incremental_declarations_accumulate() {
    let (mut compiler, _) = compiler();
    compiler.compile_buffer("var a = 10;").unwrap();
    compiler.compile_buffer("var b = a * 4;").unwrap();
    let out = compiler.compile_expression("a + b").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 50);
}

#[test]
fn functions_and_control_flow() {
    let (mut compiler, _) = compiler();
    compiler
        .compile_buffer(
            "fun fact = (int<32> n) int<32> {
               if (n <= 1)
                 return 1;
               return n * fact(n - 1);
             }",
        )
        .unwrap();
    let out = compiler.compile_expression("fact(5)").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 120);
}

#[test]
fn std_library_functions_work() {
    let (mut compiler, _) = compiler();
    let out = compiler.compile_expression("abs(-5)").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 5);
    let out = compiler.compile_expression("max(2, 3)").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 3);
}

#[test]
fn while_loops_and_assignment() {
    let (mut compiler, _) = compiler();
    compiler
        .compile_buffer(
            "var total = 0;
             var i = 0;
             while (i < 5) {
               total = total + i;
               i = i + 1;
             }",
        )
        .unwrap();
    let out = compiler.compile_expression("total").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 10);
}

#[test]
fn for_in_loops_iterate_arrays() {
    let (mut compiler, _) = compiler();
    compiler
        .compile_buffer(
            "var sum = 0;
             for (var v in [1, 2, 3, 4])
               sum = sum + v;",
        )
        .unwrap();
    let out = compiler.compile_expression("sum").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 10);
}

#[test]
fn times_loop_and_break() {
    let (mut compiler, _) = compiler();
    compiler
        .compile_buffer(
            "var n = 0;
             for (10) {
               n = n + 1;
               if (n == 3)
                 break;
             }",
        )
        .unwrap();
    let out = compiler.compile_expression("n").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 3);
}

#[test]
fn string_operations() {
    let (mut compiler, _) = compiler();
    let out = compiler.compile_expression("\"ab\" + \"cd\"").unwrap();
    let val = out.value.unwrap();
    assert_eq!(compiler.vm().heap().str(val), Some("abcd"));
    let out = compiler.compile_expression("\"ab\" * 3").unwrap();
    let val = out.value.unwrap();
    assert_eq!(compiler.vm().heap().str(val), Some("ababab"));
}

#[test]
fn declared_units_participate_in_offsets() {
    let (mut compiler, _) = compiler();
    compiler.compile_buffer("unit cluster = 8 * 512;").unwrap();
    let out = compiler.compile_expression("2#cluster").unwrap();
    let val = out.value.unwrap();
    let Some(Boxed::Off(off)) = val.box_id().map(|id| compiler.vm().heap().get(id)) else {
        panic!("expected an offset");
    };
    assert_eq!(compiler.vm().heap().as_u64(off.unit), Some(4096));
}

#[test]
fn map_reads_integrals_from_an_io_space() {
    let (mut compiler, _) = compiler();
    let id = compiler.ios_open_mem("*data*", vec![0x34, 0x12, 0xff]);
    assert_eq!(compiler.ios_cur(), Some(id));
    compiler.set_endian(Endian::Lsb);
    let out = compiler.compile_expression("uint<16> @ 0#B").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 0x1234);
    let out = compiler.compile_expression("uint<8> @ 2#B").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 0xff);
}

#[test]
fn map_reads_structs_field_by_field() {
    let (mut compiler, _) = compiler();
    compiler
        .compile_buffer("type Chunk = struct { uint<8> len; uint<8>[len] data; };")
        .unwrap();
    compiler.ios_open_mem("*data*", vec![2, 0xAA, 0xBB, 0x99]);
    let out = compiler.compile_expression("Chunk @ 0#B").unwrap();
    let val = out.value.unwrap();
    let heap = compiler.vm().heap();
    let Some(Boxed::Sct(sct)) = val.box_id().map(|id| heap.get(id)) else {
        panic!("expected a struct value");
    };
    assert_eq!(heap.as_u64(sct.fields[0].value), Some(2));
    let Some(Boxed::Arr(data)) = sct.fields[1].value.box_id().map(|id| heap.get(id)) else {
        panic!("expected an array field");
    };
    assert_eq!(heap.as_u64(data.elems[0].value), Some(0xAA));
    assert_eq!(heap.as_u64(data.elems[1].value), Some(0xBB));
    // The value records where it was mapped from.
    assert_eq!(heap.as_i64(sct.ios), Some(0));
    assert!(!sct.boffset.is_null());
}

#[test]
fn mapping_constraint_violations_raise() {
    let (mut compiler, term) = compiler();
    compiler
        .compile_buffer("type Strict = struct { uint<8> magic : magic == 0x7f; };")
        .unwrap();
    compiler.ios_open_mem("*data*", vec![0x00]);
    assert!(matches!(
        compiler.compile_expression("Strict @ 0#B"),
        Err(Error::Runtime)
    ));
    assert!(term.borrow().out.contains("constraint violation"));
}

#[test]
fn defvar_injects_globals() {
    let (mut compiler, _) = compiler();
    let val = burin_vm::make_int(7, 32);
    assert!(compiler.defvar("injected", val));
    assert!(!compiler.defvar("injected", val));
    let out = compiler.compile_expression("injected * 6").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 42);
}

#[test]
fn completion_enumerates_prefixed_declarations() {
    let (mut compiler, _) = compiler();
    compiler.compile_buffer("var zz_one = 1; var zz_two = 2;").unwrap();
    let matches = compiler.completion("zz_");
    assert_eq!(matches, vec!["zz_one".to_owned(), "zz_two".to_owned()]);
}

#[test]
fn load_searches_the_load_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("extra.b"), "var from_module = 99;\n").unwrap();

    let (mut compiler, _) = compiler();
    let new_path = format!(
        "%DATADIR%:{}",
        dir.path().to_string_lossy()
    );
    compiler
        .compile_buffer(&format!("load_path = \"{new_path}\";"))
        .unwrap();
    compiler.load("extra").unwrap();
    // Loading twice is a no-op.
    compiler.load("extra").unwrap();
    let out = compiler.compile_expression("from_module").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 99);
    assert!(matches!(
        compiler.load("missing"),
        Err(Error::NoModule(_))
    ));
}

#[test]
fn statement_values_surface_only_for_expressions() {
    let (mut compiler, _) = compiler();
    let out = compiler.compile_statement("3 * 4;").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 12);
    let out = compiler.compile_statement("var fresh = 1;").unwrap();
    assert!(out.value.unwrap().is_null());
}

#[test]
fn runtime_errors_do_not_poison_the_environment() {
    let (mut compiler, _) = compiler();
    compiler.compile_buffer("var ok = 5;").unwrap();
    // Division by a runtime zero raises; the input is rolled back.
    assert!(matches!(
        compiler.compile_buffer("var zero = 0; var boom = ok / zero;"),
        Err(Error::Runtime)
    ));
    assert!(!compiler.decl_p("boom", DeclKind::Var));
    let out = compiler.compile_expression("ok").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 5);
}

#[test]
fn expression_programs_transfer_ownership() {
    let (mut compiler, _) = compiler();
    let program = compiler.expression_program("2 ** 10").unwrap();
    assert!(program.is_executable());
    let program = Rc::new(program);
    let (_, val) = compiler.vm_mut().run(&program).unwrap();
    assert_eq!(int_of(&compiler, val), 1024);
}

#[test]
fn pretty_printer_method_is_used() {
    let (mut compiler, term) = compiler();
    compiler
        .compile_buffer(
            "type Tagged = struct {
               uint<8> tag;
               method _print = () { print \"<tagged>\"; }
             };",
        )
        .unwrap();
    compiler.set_pretty_print(true);
    compiler
        .compile_buffer("print Tagged { tag = 1 };")
        .unwrap();
    assert!(term.borrow().out.contains("<tagged>"));
}

#[test]
fn file_ios_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.bin");
    std::fs::write(&path, [0x01u8, 0x02, 0x03]).unwrap();

    let (mut compiler, _) = compiler();
    let id = compiler
        .ios_open_file(&path, IosFlags::READ | IosFlags::WRITE)
        .unwrap();
    assert_eq!(compiler.ios_size(id), Some(3));
    assert_eq!(
        compiler.ios_search(&path.to_string_lossy()),
        Some(id)
    );
    let out = compiler.compile_expression("uint<8> @ 1#B").unwrap();
    assert_eq!(int_of(&compiler, out.value.unwrap()), 2);
    assert!(compiler.ios_close(id));
}
