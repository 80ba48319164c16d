//! The Burin virtual machine.
//!
//! A stack machine executing the bytecode produced by the Burin
//! compiler.  The crate owns the runtime value model (tagged inline
//! integers plus a mark-sweep heap of boxed aggregates), bytecode
//! programs and their builder, the run-time environment of lexical
//! frames, the I/O spaces mapped values live against, and the terminal
//! callback table all output is routed through.

#![warn(missing_docs)]

mod agg;
mod alu;
mod env;
mod error;
mod heap;
mod ios;
mod print;
mod program;
mod terminal;
pub mod units;
mod value;
mod vm;

pub use burin_asm::{ExceptionCode, Label, Opcode, OperandKind, RegisterId, Word};
pub use env::Env;
pub use error::{AsmError, ExitCode, VmError};
pub use heap::Heap;
pub use ios::{Endian, FileIos, IoSpace, IosFlags, IosRegistry, MemIos, Nenc};
pub use program::{Instr, Operand, Program, ProgramBuilder};
pub use terminal::{std_terminal, CollectTerminal, StdTerminal, TermRef, Terminal};
pub use value::{
    make_int, make_uint, ArrayElem, ArrayVal, BoxId, Boxed, ClosureVal, OffsetVal, StructField,
    StructMethod, StructVal, TypeVal, Value,
};
pub use vm::{OMode, Settings, Vm};

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn run_program(build: impl FnOnce(&mut ProgramBuilder, &mut Heap)) -> (Vm, ExitCode, Value) {
        let mut vm = Vm::new(CollectTerminal::shared());
        let mut builder = ProgramBuilder::new();
        build(&mut builder, vm.heap_mut());
        builder.append(Opcode::Halt).unwrap();
        let mut program = builder.finish();
        program.make_executable().unwrap();
        let (exit, val) = vm.run(&Rc::new(program)).unwrap();
        (vm, exit, val)
    }

    #[test]
    fn push_and_add() {
        let (vm, exit, val) = run_program(|b, heap| {
            b.append_push(heap, make_int(1, 32));
            b.append_push(heap, make_int(2, 32));
            b.append(Opcode::Add).unwrap();
        });
        assert_eq!(exit, ExitCode::Ok);
        assert_eq!(vm.heap().as_i64(val), Some(3));
    }

    #[test]
    fn signed_wrap_at_width() {
        let (vm, _, val) = run_program(|b, heap| {
            b.append_push(heap, make_int(127, 8));
            b.append_push(heap, make_int(1, 8));
            b.append(Opcode::Add).unwrap();
        });
        assert_eq!(vm.heap().as_i64(val), Some(-128));
    }

    #[test]
    fn division_by_zero_is_unhandled_exception() {
        let (_, exit, _) = run_program(|b, heap| {
            b.append_push(heap, make_int(1, 32));
            b.append_push(heap, make_int(0, 32));
            b.append(Opcode::Div).unwrap();
        });
        assert_eq!(exit, ExitCode::Error);
    }

    #[test]
    fn handler_catches_raise() {
        let mut vm = Vm::new(CollectTerminal::shared());
        let mut builder = ProgramBuilder::new();
        let handler = builder.fresh_label();
        let out = builder.fresh_label();
        builder.append_label_parameter(handler).unwrap();
        builder.append(Opcode::Pushe).unwrap();
        builder.append_push(vm.heap_mut(), make_int(1, 32));
        builder.append_push(vm.heap_mut(), make_int(0, 32));
        builder.append(Opcode::Div).unwrap();
        builder.append(Opcode::Pope).unwrap();
        builder.append_label_parameter(out).unwrap();
        builder.append(Opcode::Ba).unwrap();
        builder.append_label(handler).unwrap();
        // The handler receives the exception value; replace it.
        builder.append(Opcode::Drop).unwrap();
        builder.append_push(vm.heap_mut(), make_int(42, 32));
        builder.append_label(out).unwrap();
        builder.append(Opcode::Halt).unwrap();
        let mut program = builder.finish();
        program.make_executable().unwrap();
        let (exit, val) = vm.run(&Rc::new(program)).unwrap();
        assert_eq!(exit, ExitCode::Ok);
        assert_eq!(vm.heap().as_i64(val), Some(42));
    }

    #[test]
    fn offset_arith_normalizes_units() {
        // 1#B + 8#b == 2#B, i.e. 16 bits.
        let (vm, exit, val) = run_program(|b, heap| {
            let unit_b = heap.make_ulong(units::BYTE, 64);
            let m1 = heap.make_ulong(1, 64);
            let one_byte = heap.make_offset(m1, unit_b);
            let unit_bit = heap.make_ulong(units::BIT, 64);
            let m2 = heap.make_ulong(8, 64);
            let eight_bits = heap.make_offset(m2, unit_bit);
            // Promotion would cast the right operand to the left type;
            // do it by hand here.
            let byte_ty = {
                let base = heap.make_integral_type(64, false);
                heap.make_offset_type(base, units::BYTE)
            };
            b.append_push(heap, one_byte);
            b.append_push(heap, eight_bits);
            b.append_push(heap, byte_ty);
            b.append(Opcode::Cast).unwrap();
            b.append(Opcode::Add).unwrap();
        });
        assert_eq!(exit, ExitCode::Ok);
        assert_eq!(vm.heap().size_of(val), 64);
        let Some(Boxed::Off(off)) = val.box_id().map(|id| vm.heap().get(id)) else {
            panic!("expected offset result");
        };
        assert_eq!(vm.heap().as_u64(off.magnitude), Some(2));
        assert_eq!(vm.heap().as_u64(off.unit), Some(units::BYTE));
    }

    #[test]
    fn closure_call_round_trip() {
        // fn(x) = x + 1, called with 41.
        let mut vm = Vm::new(CollectTerminal::shared());

        let body = {
            let mut b = ProgramBuilder::new();
            b.append_unsigned_parameter(1);
            b.append(Opcode::Pushf).unwrap();
            b.append(Opcode::Popvar).unwrap();
            b.append_unsigned_parameter(0);
            b.append_unsigned_parameter(0);
            b.append(Opcode::Pushvar).unwrap();
            b.append_push(vm.heap_mut(), make_int(1, 32));
            b.append(Opcode::Add).unwrap();
            b.append(Opcode::Popf).unwrap();
            b.append(Opcode::Ret).unwrap();
            let mut p = b.finish();
            p.make_executable().unwrap();
            Rc::new(p)
        };
        let cls = vm.heap_mut().make_closure(body);

        let mut b = ProgramBuilder::new();
        b.append_push(vm.heap_mut(), cls);
        b.append(Opcode::Pec).unwrap();
        b.append(Opcode::Drop).unwrap();
        b.append_push(vm.heap_mut(), make_int(41, 32));
        b.append_push(vm.heap_mut(), cls);
        b.append(Opcode::Call).unwrap();
        b.append(Opcode::Halt).unwrap();
        let mut program = b.finish();
        program.make_executable().unwrap();
        let (exit, val) = vm.run(&Rc::new(program)).unwrap();
        assert_eq!(exit, ExitCode::Ok);
        assert_eq!(vm.heap().as_i64(val), Some(42));
    }

    #[test]
    fn map_reads_integral_from_ios() {
        let mut vm = Vm::new(CollectTerminal::shared());
        let id = vm
            .ios_mut()
            .open(Box::new(MemIos::new("*m*", vec![0xaa, 0xbb])));
        let mut b = ProgramBuilder::new();
        let typ = vm.heap_mut().make_integral_type(8, false);
        b.append_push(vm.heap_mut(), typ);
        b.append_push(vm.heap_mut(), make_int(id, 32));
        let off = {
            let heap = vm.heap_mut();
            let mag = heap.make_ulong(1, 64);
            let unit = heap.make_ulong(units::BYTE, 64);
            heap.make_offset(mag, unit)
        };
        b.append_push(vm.heap_mut(), off);
        b.append(Opcode::Map).unwrap();
        b.append(Opcode::Halt).unwrap();
        let mut program = b.finish();
        program.make_executable().unwrap();
        let (exit, val) = vm.run(&Rc::new(program)).unwrap();
        assert_eq!(exit, ExitCode::Ok);
        assert_eq!(vm.heap().as_u64(val), Some(0xbb));
    }

    #[test]
    fn pending_interrupt_unwinds_at_a_safe_point() {
        let mut vm = Vm::new(CollectTerminal::shared());
        let mut b = ProgramBuilder::new();
        let begin = b.fresh_label();
        b.append_label(begin).unwrap();
        b.append_label_parameter(begin).unwrap();
        b.append(Opcode::Ba).unwrap();
        let mut program = b.finish();
        program.make_executable().unwrap();
        // Without the interrupt this program would never terminate; the
        // flag is tested at branch safe points.
        vm.interrupt_flag().store(true, std::sync::atomic::Ordering::Relaxed);
        let (exit, _) = vm.run(&Rc::new(program)).unwrap();
        assert_eq!(exit, ExitCode::Error);
    }

    #[test]
    fn print_routes_through_terminal() {
        let term = CollectTerminal::shared();
        let mut vm = Vm::new(term.clone());
        let mut b = ProgramBuilder::new();
        b.append_push(vm.heap_mut(), make_uint(0xff, 8));
        b.append(Opcode::Print).unwrap();
        b.append(Opcode::Halt).unwrap();
        let mut program = b.finish();
        program.make_executable().unwrap();
        vm.set_obase(16);
        vm.run(&Rc::new(program)).unwrap();
        assert_eq!(term.borrow().out, "0xffUB");
    }
}
