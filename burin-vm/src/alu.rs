//! Arithmetic, logical and conversion operations on values.
//!
//! By the time these run, the compiler's promotion phase has already
//! unified operand types: integral operands of a binary operation share
//! a width and signedness, and offset operands share a unit and base
//! type.  The implementations are still defensive about shapes, raising
//! `Inval` rather than trusting the bytecode.

use burin_asm::{ExceptionCode, Opcode};

use crate::value::{mask64, sign_extend_64, Boxed, TypeVal, Value};
use crate::vm::Vm;

type ExnResult<T> = Result<T, ExceptionCode>;

/// An integral operand unpacked for arithmetic.
#[derive(Clone, Copy)]
struct IntOp {
    bits: u64,
    w: u8,
    signed: bool,
}

/// An offset operand normalized for arithmetic.
#[derive(Clone, Copy)]
struct OffOp {
    /// Magnitude in bits (signed reading).
    bits: i128,
    /// Unit of the source offset, in bits.
    unit: u64,
    /// Width and signedness of the magnitude.
    w: u8,
    signed: bool,
}

impl Vm {
    fn int_op(&self, val: Value) -> Option<IntOp> {
        self.heap
            .as_integral(val)
            .map(|(bits, w, signed)| IntOp { bits, w, signed })
    }

    fn off_op(&self, val: Value) -> Option<OffOp> {
        let Some(Boxed::Off(off)) = val.box_id().map(|id| self.heap.get(id)) else {
            return None;
        };
        let (bits, w, signed) = self.heap.as_integral(off.magnitude)?;
        let unit = self.heap.as_u64(off.unit)?;
        let mag = if signed {
            sign_extend_64(bits, w) as i128
        } else {
            bits as i128
        };
        Some(OffOp {
            bits: mag * unit as i128,
            unit,
            w,
            signed,
        })
    }

    fn make_int_result(&mut self, bits: u64, op: IntOp) -> Value {
        self.heap.make_integral(bits & mask64(op.w), op.w, op.signed)
    }

    fn make_offset_result(&mut self, bits: i128, op: OffOp) -> Value {
        // Renormalize to the operand unit by integer division; the
        // truncation on a non-exact division is the defined semantics.
        let mag = bits / op.unit as i128;
        let mag = self.heap.make_integral(mag as u64 & mask64(op.w), op.w, op.signed);
        let unit = self.heap.make_ulong(op.unit, 64);
        self.heap.make_offset(mag, unit)
    }

    /// Binary arithmetic, bitwise and logical operations.
    pub(crate) fn arith(&mut self, op: Opcode, a: Value, b: Value) -> ExnResult<Value> {
        // Integral × integral.
        if let (Some(ia), Some(ib)) = (self.int_op(a), self.int_op(b)) {
            return self.int_arith(op, ia, ib);
        }
        // Offset × offset, and offset × integral for multiplication.
        match (self.off_op(a), self.off_op(b)) {
            (Some(oa), Some(ob)) => return self.off_arith(op, oa, ob),
            (Some(oa), None) if op == Opcode::Mul => {
                if let Some(ib) = self.int_op(b) {
                    let factor = signed_reading(ib) as i128;
                    return Ok(self.make_offset_result(oa.bits * factor, oa));
                }
            }
            (None, Some(ob)) if op == Opcode::Mul => {
                if let Some(ia) = self.int_op(a) {
                    let factor = signed_reading(ia) as i128;
                    return Ok(self.make_offset_result(ob.bits * factor, ob));
                }
            }
            _ => {}
        }
        // String operations.
        if let Some(sa) = self.heap.str(a).map(str::to_owned) {
            match op {
                Opcode::Add => {
                    if let Some(sb) = self.heap.str(b) {
                        let cat = format!("{sa}{sb}");
                        return Ok(self.heap.make_string(&cat));
                    }
                }
                Opcode::Mul => {
                    if let Some(n) = self.heap.as_u64(b) {
                        return Ok(self.repeat_string(&sa, n));
                    }
                }
                _ => {}
            }
        } else if op == Opcode::Mul {
            if let (Some(n), Some(sb)) = (self.heap.as_u64(a), self.heap.str(b).map(str::to_owned)) {
                return Ok(self.repeat_string(&sb, n));
            }
        }
        // Array concatenation.
        if op == Opcode::Add {
            if let Some(res) = self.concat_arrays(a, b) {
                return Ok(res);
            }
        }
        Err(ExceptionCode::Inval)
    }

    fn repeat_string(&mut self, s: &str, n: u64) -> Value {
        let repeated = s.repeat(n as usize);
        self.heap.make_string(&repeated)
    }

    fn concat_arrays(&mut self, a: Value, b: Value) -> Option<Value> {
        let (atype, mut elems) = match a.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Arr(arr)) => (arr.atype, arr.elems.clone()),
            _ => return None,
        };
        match b.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Arr(arr)) => elems.extend(arr.elems.iter().cloned()),
            _ => return None,
        }
        let val = self.heap.make_array(0, atype);
        let mut boffset = 0u64;
        let mut rebuilt = Vec::with_capacity(elems.len());
        for elem in &elems {
            let off = self.heap.make_ulong(boffset, 64);
            boffset += self.heap.size_of(elem.value);
            rebuilt.push(crate::value::ArrayElem {
                value: elem.value,
                boffset: off,
            });
        }
        if let Boxed::Arr(arr) = self.heap.get_mut(val.box_id()?) {
            arr.elems = rebuilt;
        }
        Some(val)
    }

    fn int_arith(&mut self, op: Opcode, a: IntOp, b: IntOp) -> ExnResult<Value> {
        use Opcode::*;
        let (sa, sb) = (signed_reading(a), signed_reading(b));
        let (ua, ub) = (a.bits, b.bits);
        let signed = a.signed;

        let bits: u64 = match op {
            Add => {
                if signed {
                    sa.wrapping_add(sb) as u64
                } else {
                    ua.wrapping_add(ub)
                }
            }
            Sub => {
                if signed {
                    sa.wrapping_sub(sb) as u64
                } else {
                    ua.wrapping_sub(ub)
                }
            }
            Mul => {
                if signed {
                    sa.wrapping_mul(sb) as u64
                } else {
                    ua.wrapping_mul(ub)
                }
            }
            Div => {
                if (signed && sb == 0) || (!signed && ub == 0) {
                    return Err(ExceptionCode::DivByZero);
                }
                if signed {
                    sa.wrapping_div(sb) as u64
                } else {
                    ua / ub
                }
            }
            Cdiv => {
                if (signed && sb == 0) || (!signed && ub == 0) {
                    return Err(ExceptionCode::DivByZero);
                }
                if signed {
                    sa.wrapping_sub(1).wrapping_add(sb).wrapping_div(sb) as u64
                } else {
                    (ua.wrapping_sub(1).wrapping_add(ub)) / ub
                }
            }
            Mod => {
                if (signed && sb == 0) || (!signed && ub == 0) {
                    return Err(ExceptionCode::DivByZero);
                }
                if signed {
                    sa.wrapping_rem(sb) as u64
                } else {
                    ua % ub
                }
            }
            Pow => {
                if signed {
                    wrapping_ipow(sa, ub as u32) as u64
                } else {
                    wrapping_upow(ua, ub as u32)
                }
            }
            BAnd => ua & ub,
            BOr => ua | ub,
            BXor => ua ^ ub,
            Bsl => {
                if ub >= a.w as u64 {
                    return Err(ExceptionCode::OutOfBounds);
                }
                ua << ub
            }
            Bsr => {
                if ub >= a.w as u64 {
                    // Shifted out completely; keep the sign fill.
                    if signed && sa < 0 {
                        u64::MAX
                    } else {
                        0
                    }
                } else if signed {
                    (sa >> ub) as u64
                } else {
                    ua >> ub
                }
            }
            And => ((sa != 0) && (sb != 0)) as u64,
            Or => ((sa != 0) || (sb != 0)) as u64,
            _ => return Err(ExceptionCode::Inval),
        };
        Ok(self.make_int_result(bits, a))
    }

    fn off_arith(&mut self, op: Opcode, a: OffOp, b: OffOp) -> ExnResult<Value> {
        use Opcode::*;
        match op {
            Add => Ok(self.make_offset_result(a.bits + b.bits, a)),
            Sub => Ok(self.make_offset_result(a.bits - b.bits, a)),
            Div | Cdiv => {
                if b.bits == 0 {
                    return Err(ExceptionCode::DivByZero);
                }
                let q = if op == Div {
                    a.bits / b.bits
                } else {
                    (a.bits - 1 + b.bits) / b.bits
                };
                Ok(self
                    .heap
                    .make_integral(q as u64 & mask64(a.w), a.w, a.signed))
            }
            Mod => {
                if b.bits == 0 {
                    return Err(ExceptionCode::DivByZero);
                }
                Ok(self.make_offset_result(a.bits % b.bits, a))
            }
            BAnd => Ok(self.make_offset_result(a.bits & b.bits, a)),
            BOr => Ok(self.make_offset_result(a.bits | b.bits, a)),
            BXor => Ok(self.make_offset_result(a.bits ^ b.bits, a)),
            _ => Err(ExceptionCode::Inval),
        }
    }

    /// Relational operations.  Ordered comparisons apply to integrals,
    /// strings and offsets; equality applies to every value kind.
    pub(crate) fn compare(&mut self, op: Opcode, a: Value, b: Value) -> ExnResult<Value> {
        use std::cmp::Ordering;
        use Opcode::*;

        if matches!(op, Eq | Ne) {
            let eq = self.heap.val_equal(a, b);
            let res = (eq == (op == Eq)) as i32;
            return Ok(crate::value::make_int(res, 32));
        }

        let ordering: Ordering = if let (Some(ia), Some(ib)) = (self.int_op(a), self.int_op(b)) {
            if ia.signed {
                signed_reading(ia).cmp(&signed_reading(ib))
            } else {
                ia.bits.cmp(&ib.bits)
            }
        } else if let (Some(oa), Some(ob)) = (self.off_op(a), self.off_op(b)) {
            oa.bits.cmp(&ob.bits)
        } else if let (Some(sa), Some(sb)) = (self.heap.str(a), self.heap.str(b)) {
            sa.cmp(sb)
        } else {
            return Err(ExceptionCode::Inval);
        };

        let res = match op {
            Lt => ordering == Ordering::Less,
            Le => ordering != Ordering::Greater,
            Gt => ordering == Ordering::Greater,
            Ge => ordering != Ordering::Less,
            _ => unreachable!("relational dispatch"),
        };
        Ok(crate::value::make_int(res as i32, 32))
    }

    /// Unary operations on integrals and offsets.
    pub(crate) fn unary(&mut self, op: Opcode, a: Value) -> ExnResult<Value> {
        use Opcode::*;
        if let Some(ia) = self.int_op(a) {
            let bits = match op {
                Neg => (signed_reading(ia).wrapping_neg()) as u64,
                Not => (signed_reading(ia) == 0) as u64,
                BNot => !ia.bits,
                _ => return Err(ExceptionCode::Inval),
            };
            return Ok(self.make_int_result(bits, ia));
        }
        if let Some(oa) = self.off_op(a) {
            let bits = match op {
                Neg => -oa.bits,
                BNot => !oa.bits,
                _ => return Err(ExceptionCode::Inval),
            };
            return Ok(self.make_offset_result(bits, oa));
        }
        Err(ExceptionCode::Inval)
    }

    /// Bit-concatenation: the result width is the sum of the operand
    /// widths, with the left operand in the high bits.
    pub(crate) fn bit_concat(&mut self, a: Value, b: Value, typ: Value) -> ExnResult<Value> {
        let (ia, ib) = match (self.int_op(a), self.int_op(b)) {
            (Some(ia), Some(ib)) => (ia, ib),
            _ => return Err(ExceptionCode::Inval),
        };
        let (size, signed) = match typ.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Typ(TypeVal::Integral { size, signed })) => (*size, *signed),
            _ => return Err(ExceptionCode::Inval),
        };
        if ia.w as u64 + ib.w as u64 != size || size > 64 {
            return Err(ExceptionCode::Conv);
        }
        let bits = (ia.bits << ib.w) | ib.bits;
        Ok(self.heap.make_integral(bits, size as u8, signed))
    }

    /// Conversions driven by the `cast` instruction.
    pub(crate) fn cast(&mut self, val: Value, typ: Value) -> ExnResult<Value> {
        let target = match typ.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Typ(t)) => t.clone(),
            _ => return Err(ExceptionCode::Inval),
        };
        match target {
            TypeVal::Any => Ok(val),
            TypeVal::Integral { size, signed } => {
                if let Some(op) = self.int_op(val) {
                    // Narrowing masks; the signed reading of the source
                    // is preserved when widening.
                    return Ok(self.heap.make_integral(
                        signed_reading(op) as u64,
                        size as u8,
                        signed,
                    ));
                }
                // An integral struct converts by packing its fields,
                // first field in the most significant bits.
                if let Some(bits) = self.pack_struct_bits(val) {
                    return Ok(self.heap.make_integral(bits, size as u8, signed));
                }
                Err(ExceptionCode::Conv)
            }
            TypeVal::String => match self.heap.str(val) {
                Some(_) => Ok(val),
                None => Err(ExceptionCode::Conv),
            },
            TypeVal::Offset { base, unit } => {
                let Some(op) = self.off_op(val) else {
                    return Err(ExceptionCode::Conv);
                };
                let (size, signed) = match base.box_id().map(|id| self.heap.get(id)) {
                    Some(Boxed::Typ(TypeVal::Integral { size, signed })) => (*size, *signed),
                    _ => return Err(ExceptionCode::Conv),
                };
                if unit == 0 {
                    return Err(ExceptionCode::Conv);
                }
                let mag = op.bits / unit as i128;
                let mag = self
                    .heap
                    .make_integral(mag as u64 & mask64(size as u8), size as u8, signed);
                let unit = self.heap.make_ulong(unit, 64);
                Ok(self.heap.make_offset(mag, unit))
            }
            TypeVal::Array { bound, .. } => {
                let nelem = match val.box_id().map(|id| self.heap.get(id)) {
                    Some(Boxed::Arr(arr)) => arr.elems.len() as u64,
                    _ => return Err(ExceptionCode::Conv),
                };
                if !self.heap.type_equal(self.heap.type_of_shallow(val), typ) {
                    return Err(ExceptionCode::Conv);
                }
                if let Some(want) = self.heap.as_u64(bound) {
                    if nelem != want {
                        return Err(ExceptionCode::Conv);
                    }
                }
                Ok(val)
            }
            TypeVal::Struct { .. } | TypeVal::Closure { .. } => {
                let vtype = self.heap.type_of_shallow(val);
                if self.heap.type_equal(vtype, typ) {
                    Ok(val)
                } else {
                    Err(ExceptionCode::Conv)
                }
            }
        }
    }

    /// Pack the integral fields of a struct into one bit pattern, for
    /// integral-struct conversions.  None when any present field is not
    /// integral.
    fn pack_struct_bits(&self, val: Value) -> Option<u64> {
        let Some(Boxed::Sct(sct)) = val.box_id().map(|id| self.heap.get(id)) else {
            return None;
        };
        let mut bits: u64 = 0;
        for field in &sct.fields {
            if field.absent {
                continue;
            }
            let (fbits, w, _) = self.heap.as_integral(field.value)?;
            bits = if w >= 64 { fbits } else { (bits << w) | fbits };
        }
        Some(bits)
    }

    /// Read a value of the given type from an I/O space at an offset.
    pub(crate) fn map_value(&mut self, typ: Value, ios: Value, off: Value) -> ExnResult<Value> {
        let ios = match ios {
            Value::Null => self.ios.cur().ok_or(ExceptionCode::NoIos)?,
            _ => self.heap.as_i64(ios).ok_or(ExceptionCode::Inval)? as i32,
        };
        let Some(oa) = self.off_op(off) else {
            return Err(ExceptionCode::Inval);
        };
        if oa.bits < 0 {
            return Err(ExceptionCode::OutOfBounds);
        }
        let boffset = oa.bits as u64;
        let target = match typ.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Typ(t)) => t.clone(),
            _ => return Err(ExceptionCode::Inval),
        };
        match target {
            TypeVal::Integral { size, signed } => {
                let bits = self.ios.peek_bits(
                    ios,
                    boffset,
                    size as u8,
                    self.settings.endian,
                    self.settings.nenc,
                    signed,
                )?;
                Ok(self.heap.make_integral(bits, size as u8, signed))
            }
            TypeVal::Offset { base, unit } => {
                let (size, signed) = match base.box_id().map(|id| self.heap.get(id)) {
                    Some(Boxed::Typ(TypeVal::Integral { size, signed })) => (*size, *signed),
                    _ => return Err(ExceptionCode::Conv),
                };
                let bits = self.ios.peek_bits(
                    ios,
                    boffset,
                    size as u8,
                    self.settings.endian,
                    self.settings.nenc,
                    signed,
                )?;
                let mag = self.heap.make_integral(bits, size as u8, signed);
                let unit = self.heap.make_ulong(unit, 64);
                Ok(self.heap.make_offset(mag, unit))
            }
            // Aggregate mapping goes through the mapper closures
            // attached to values; a bare aggregate type cannot be
            // mapped directly.
            _ => Err(ExceptionCode::NoMap),
        }
    }
}

fn signed_reading(op: IntOp) -> i64 {
    if op.signed {
        sign_extend_64(op.bits, op.w)
    } else {
        op.bits as i64
    }
}

fn wrapping_ipow(base: i64, mut exp: u32) -> i64 {
    let mut result: i64 = 1;
    let mut base = base;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}

fn wrapping_upow(base: u64, mut exp: u32) -> u64 {
    let mut result: u64 = 1;
    let mut base = base;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}
