//! The boxed-value heap and its tracing collector.
//!
//! Boxed payloads live in a slotted arena.  Collection is mark-sweep:
//! the mutator registers roots explicitly — the run-time environment,
//! the interpreter stacks, and the pinned literal tables of live
//! programs — and everything reachable from them survives.

use std::rc::Rc;

use burin_asm::ExceptionCode;
use tracing::debug;

use crate::env::Env;
use crate::program::Program;
use crate::value::{
    make_int, mask64, sign_extend_64, ArrayElem, ArrayVal, BoxId, Boxed, ClosureVal, OffsetVal,
    StructField, StructMethod, StructVal, TypeVal, Value,
};

/// Number of allocations between opportunistic collections.
const GC_STEP: usize = 4096;

/// The arena of boxed values.
pub struct Heap {
    slots: Vec<Option<Boxed>>,
    marks: Vec<bool>,
    pins: Vec<u32>,
    free: Vec<u32>,
    allocated_since_gc: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            marks: Vec::new(),
            pins: Vec::new(),
            free: Vec::new(),
            allocated_since_gc: 0,
        }
    }

    fn alloc(&mut self, boxed: Boxed) -> Value {
        self.allocated_since_gc += 1;
        let ix = match self.free.pop() {
            Some(ix) => {
                self.slots[ix as usize] = Some(boxed);
                ix
            }
            None => {
                self.slots.push(Some(boxed));
                self.marks.push(false);
                self.pins.push(0);
                (self.slots.len() - 1) as u32
            }
        };
        Value::Box(BoxId(ix))
    }

    /// Access a boxed payload.
    ///
    /// # Panics
    /// Panics if the handle is stale, which indicates a missing root.
    pub fn get(&self, id: BoxId) -> &Boxed {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale heap handle")
    }

    /// Mutable access to a boxed payload.
    pub fn get_mut(&mut self, id: BoxId) -> &mut Boxed {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale heap handle")
    }

    /// Number of live boxes.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // ---- constructors ----

    /// Make a boxed signed integer of width 1..=64.  Out-of-range widths
    /// yield null.
    pub fn make_long(&mut self, v: i64, w: u32) -> Value {
        if !(1..=64).contains(&w) {
            return Value::Null;
        }
        let w = w as u8;
        self.alloc(Boxed::Long {
            v: sign_extend_64(v as u64, w),
            w,
        })
    }

    /// Make a boxed unsigned integer of width 1..=64.  Out-of-range
    /// widths yield null.
    pub fn make_ulong(&mut self, v: u64, w: u32) -> Value {
        if !(1..=64).contains(&w) {
            return Value::Null;
        }
        let w = w as u8;
        self.alloc(Boxed::Ulong { v: v & mask64(w), w })
    }

    /// Make a string value.
    pub fn make_string(&mut self, s: &str) -> Value {
        self.alloc(Boxed::Str(s.to_owned()))
    }

    /// Make an array of `nelem` null elements of the given array type.
    pub fn make_array(&mut self, nelem: u64, atype: Value) -> Value {
        let elems = (0..nelem)
            .map(|_| ArrayElem {
                value: Value::Null,
                boffset: Value::Null,
            })
            .collect();
        self.alloc(Boxed::Arr(ArrayVal {
            atype,
            elems,
            ios: Value::Null,
            boffset: Value::Null,
            elems_bound: Value::Null,
            size_bound: Value::Null,
            mapper: Value::Null,
            writer: Value::Null,
        }))
    }

    /// Make a struct with `nfields` null fields and `nmethods` null
    /// methods of the given struct type.
    pub fn make_struct(&mut self, nfields: u64, nmethods: u64, stype: Value) -> Value {
        let fields = (0..nfields)
            .map(|_| StructField {
                name: Value::Null,
                value: Value::Null,
                boffset: Value::Null,
                modified: false,
                absent: false,
            })
            .collect();
        let methods = (0..nmethods)
            .map(|_| StructMethod {
                name: Value::Null,
                value: Value::Null,
            })
            .collect();
        self.alloc(Boxed::Sct(StructVal {
            stype,
            fields,
            methods,
            ios: Value::Null,
            boffset: Value::Null,
            mapper: Value::Null,
            writer: Value::Null,
        }))
    }

    /// Make an offset from an integral magnitude and a `uint<64>` unit.
    /// A unit of any other shape yields null.
    pub fn make_offset(&mut self, magnitude: Value, unit: Value) -> Value {
        match unit {
            Value::Box(id) if matches!(self.get(id), Boxed::Ulong { w: 64, .. }) => {}
            _ => return Value::Null,
        }
        let base_type = self.type_of(magnitude);
        if base_type.is_null() {
            return Value::Null;
        }
        self.alloc(Boxed::Off(OffsetVal {
            magnitude,
            unit,
            base_type,
        }))
    }

    /// Make a closure over a program.  The environment is bound later by
    /// the `pec` instruction.
    pub fn make_closure(&mut self, program: Rc<Program>) -> Value {
        self.alloc(Boxed::Cls(ClosureVal { program, env: None }))
    }

    /// Make an integral type descriptor.
    pub fn make_integral_type(&mut self, size: u64, signed: bool) -> Value {
        self.alloc(Boxed::Typ(TypeVal::Integral { size, signed }))
    }

    /// Make the string type descriptor.
    pub fn make_string_type(&mut self) -> Value {
        self.alloc(Boxed::Typ(TypeVal::String))
    }

    /// Make the `any` type descriptor.
    pub fn make_any_type(&mut self) -> Value {
        self.alloc(Boxed::Typ(TypeVal::Any))
    }

    /// Make an array type descriptor.
    pub fn make_array_type(&mut self, etype: Value, bound: Value) -> Value {
        self.alloc(Boxed::Typ(TypeVal::Array { etype, bound }))
    }

    /// Make a struct type descriptor.
    pub fn make_struct_type(&mut self, name: Value, fnames: Vec<Value>, ftypes: Vec<Value>) -> Value {
        self.alloc(Boxed::Typ(TypeVal::Struct {
            name,
            fnames,
            ftypes,
        }))
    }

    /// Make an offset type descriptor.
    pub fn make_offset_type(&mut self, base: Value, unit: u64) -> Value {
        self.alloc(Boxed::Typ(TypeVal::Offset { base, unit }))
    }

    /// Make a closure type descriptor.
    pub fn make_closure_type(&mut self, rtype: Value, atypes: Vec<Value>) -> Value {
        self.alloc(Boxed::Typ(TypeVal::Closure { rtype, atypes }))
    }

    /// Build the `Exception` struct value observed by user programs.
    ///
    /// Keep the layout in sync with the `Exception` type declared in the
    /// runtime library.
    pub fn make_exception(&mut self, code: ExceptionCode, msg: &str, exit_status: i32) -> Value {
        let name = self.make_string("Exception");
        let code_name = self.make_string("code");
        let msg_name = self.make_string("msg");
        let status_name = self.make_string("exit_status");
        let int32 = self.make_integral_type(32, true);
        let strty = self.make_string_type();
        let stype = self.make_struct_type(
            name,
            vec![code_name, msg_name, status_name],
            vec![int32, strty, int32],
        );
        let exn = self.make_struct(3, 0, stype);
        let msg_val = self.make_string(msg);
        let Boxed::Sct(sct) = self.get_mut(exn.box_id().unwrap()) else {
            unreachable!()
        };
        sct.fields[0].name = code_name;
        sct.fields[0].value = make_int(code as i32, 32);
        sct.fields[1].name = msg_name;
        sct.fields[1].value = msg_val;
        sct.fields[2].name = status_name;
        sct.fields[2].value = make_int(exit_status, 32);
        exn
    }

    // ---- accessors ----

    /// The string payload of a string value.
    pub fn str(&self, val: Value) -> Option<&str> {
        match val.box_id().map(|id| self.get(id)) {
            Some(Boxed::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// View an integral value (inline or boxed) as `(bits, width,
    /// signed)`.  The bit pattern is masked to the width.
    pub fn as_integral(&self, val: Value) -> Option<(u64, u8, bool)> {
        match val {
            Value::Int { v, w } => Some(((v as u32 as u64) & mask64(w), w, true)),
            Value::Uint { v, w } => Some((v as u64, w, false)),
            Value::Box(id) => match self.get(id) {
                Boxed::Long { v, w } => Some(((*v as u64) & mask64(*w), *w, true)),
                Boxed::Ulong { v, w } => Some((*v, *w, false)),
                _ => None,
            },
            Value::Null => None,
        }
    }

    /// The unsigned 64-bit payload of an integral value.
    pub fn as_u64(&self, val: Value) -> Option<u64> {
        self.as_integral(val).map(|(bits, _, _)| bits)
    }

    /// The signed 64-bit reading of an integral value.
    pub fn as_i64(&self, val: Value) -> Option<i64> {
        self.as_integral(val)
            .map(|(bits, w, signed)| if signed { sign_extend_64(bits, w) } else { bits as i64 })
    }

    /// Build an integral value of the given width and signedness from a
    /// 64-bit pattern, choosing inline or boxed storage by width.
    pub fn make_integral(&mut self, bits: u64, w: u8, signed: bool) -> Value {
        if w <= 32 {
            if signed {
                make_int(sign_extend_64(bits & mask64(w), w) as i32, w as u32)
            } else {
                crate::value::make_uint((bits & mask64(w)) as u32, w as u32)
            }
        } else if signed {
            self.make_long(sign_extend_64(bits, w), w as u32)
        } else {
            self.make_ulong(bits, w as u32)
        }
    }

    /// The element of an array value at a 64-bit index.
    pub fn array_elem(&self, arr: Value, ix: u64) -> Option<&ArrayElem> {
        match arr.box_id().map(|id| self.get(id)) {
            Some(Boxed::Arr(a)) => a.elems.get(ix as usize),
            _ => None,
        }
    }

    /// Overwrite the element of an array value at a 64-bit index.
    /// Returns false when out of range.
    pub fn set_array_elem(&mut self, arr: Value, ix: u64, val: Value) -> bool {
        match arr.box_id().map(|id| self.get_mut(id)) {
            Some(Boxed::Arr(a)) => match a.elems.get_mut(ix as usize) {
                Some(elem) => {
                    elem.value = val;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    /// The field of a struct value at a 64-bit index.
    pub fn struct_field(&self, sct: Value, ix: u64) -> Option<&StructField> {
        match sct.box_id().map(|id| self.get(id)) {
            Some(Boxed::Sct(s)) => s.fields.get(ix as usize),
            _ => None,
        }
    }

    /// Reference a struct field or method by name, like the `sref`
    /// instruction.  Absent fields are skipped.
    pub fn ref_struct(&self, sct: Value, name: &str) -> Option<Value> {
        let Some(Boxed::Sct(s)) = sct.box_id().map(|id| self.get(id)) else {
            return None;
        };
        for field in &s.fields {
            if field.absent {
                continue;
            }
            if self.str(field.name) == Some(name) {
                return Some(field.value);
            }
        }
        for method in &s.methods {
            if self.str(method.name) == Some(name) {
                return Some(method.value);
            }
        }
        None
    }

    /// Set a struct field by name and mark it modified.  Returns false
    /// when there is no such field.
    pub fn set_struct(&mut self, sct: Value, name: &str, val: Value) -> bool {
        let Some(id) = sct.box_id() else { return false };
        let ix = {
            let Boxed::Sct(s) = self.get(id) else {
                return false;
            };
            s.fields
                .iter()
                .position(|f| !f.absent && self.str(f.name) == Some(name))
        };
        match ix {
            Some(ix) => {
                let Boxed::Sct(s) = self.get_mut(id) else {
                    unreachable!()
                };
                s.fields[ix].value = val;
                s.fields[ix].modified = true;
                true
            }
            None => false,
        }
    }

    /// The type of a value, constructing a descriptor for scalars.
    pub fn type_of(&mut self, val: Value) -> Value {
        enum Shape {
            Null,
            Integral(u64, bool),
            Str,
            Off(Value, Value),
            Known(Value),
            Anything,
        }
        let shape = match val {
            Value::Null => Shape::Null,
            Value::Int { w, .. } => Shape::Integral(w as u64, true),
            Value::Uint { w, .. } => Shape::Integral(w as u64, false),
            Value::Box(id) => match self.get(id) {
                Boxed::Long { w, .. } => Shape::Integral(*w as u64, true),
                Boxed::Ulong { w, .. } => Shape::Integral(*w as u64, false),
                Boxed::Str(_) => Shape::Str,
                Boxed::Off(off) => Shape::Off(off.base_type, off.unit),
                Boxed::Arr(arr) => Shape::Known(arr.atype),
                Boxed::Sct(sct) => Shape::Known(sct.stype),
                Boxed::Typ(_) => Shape::Anything,
                Boxed::Cls(_) => Shape::Null,
            },
        };
        match shape {
            Shape::Null => Value::Null,
            Shape::Integral(size, signed) => self.make_integral_type(size, signed),
            Shape::Str => self.make_string_type(),
            Shape::Off(base, unit) => {
                let unit = self.as_u64(unit).unwrap_or(1);
                self.make_offset_type(base, unit)
            }
            Shape::Known(t) => t,
            Shape::Anything => self.make_any_type(),
        }
    }

    /// The declared name of a struct type value, if it has one.
    pub fn type_name(&self, typ: Value) -> Option<&str> {
        match typ.box_id().map(|id| self.get(id)) {
            Some(Boxed::Typ(TypeVal::Struct { name, .. })) => self.str(*name),
            _ => None,
        }
    }

    /// The stored type handle of an aggregate value, without allocating
    /// descriptors for scalars.  Null for non-aggregates.
    pub fn type_of_shallow(&self, val: Value) -> Value {
        match val.box_id().map(|id| self.get(id)) {
            Some(Boxed::Arr(arr)) => arr.atype,
            Some(Boxed::Sct(sct)) => sct.stype,
            _ => Value::Null,
        }
    }

    /// Number of elements of a value: array elements, present struct
    /// fields, string bytes, 1 for scalars.
    pub fn elems_of(&mut self, val: Value) -> Value {
        let n = match val.box_id().map(|id| self.get(id)) {
            Some(Boxed::Arr(arr)) => arr.elems.len() as u64,
            Some(Boxed::Sct(sct)) => sct.fields.iter().filter(|f| !f.absent).count() as u64,
            Some(Boxed::Str(s)) => s.len() as u64,
            _ => 1,
        };
        self.make_ulong(n, 64)
    }

    /// The size of a value in bits.
    pub fn size_of(&self, val: Value) -> u64 {
        match val {
            Value::Null => 0,
            Value::Int { w, .. } | Value::Uint { w, .. } => w as u64,
            Value::Box(id) => match self.get(id) {
                Boxed::Long { w, .. } | Boxed::Ulong { w, .. } => *w as u64,
                Boxed::Str(s) => (s.len() as u64 + 1) * 8,
                Boxed::Arr(arr) => arr.elems.iter().map(|e| self.size_of(e.value)).sum(),
                Boxed::Sct(sct) => {
                    let base_bits = self.as_u64(sct.boffset).unwrap_or(0);
                    let mut size = 0u64;
                    for field in &sct.fields {
                        if field.absent {
                            continue;
                        }
                        let fsize = self.size_of(field.value);
                        match self.as_u64(field.boffset) {
                            None => size += fsize,
                            Some(fo) => size = size.max(fo - base_bits + fsize),
                        }
                    }
                    size
                }
                Boxed::Off(off) => self.size_of(off.magnitude),
                // Type values have size zero, by convention.
                Boxed::Typ(_) => 0,
                Boxed::Cls(_) => 0,
            },
        }
    }

    /// Structural, deep equality of two values.
    pub fn val_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Int { v: v1, w: w1 }, Value::Int { v: v2, w: w2 }) => v1 == v2 && w1 == w2,
            (Value::Uint { v: v1, w: w1 }, Value::Uint { v: v2, w: w2 }) => v1 == v2 && w1 == w2,
            (Value::Box(i1), Value::Box(i2)) => self.boxed_equal(self.get(i1), self.get(i2)),
            _ => false,
        }
    }

    fn boxed_equal(&self, a: &Boxed, b: &Boxed) -> bool {
        match (a, b) {
            (Boxed::Long { v: v1, w: w1 }, Boxed::Long { v: v2, w: w2 }) => v1 == v2 && w1 == w2,
            (Boxed::Ulong { v: v1, w: w1 }, Boxed::Ulong { v: v2, w: w2 }) => v1 == v2 && w1 == w2,
            (Boxed::Str(s1), Boxed::Str(s2)) => s1 == s2,
            (Boxed::Off(o1), Boxed::Off(o2)) => {
                self.val_equal(o1.magnitude, o2.magnitude) && self.val_equal(o1.unit, o2.unit)
            }
            (Boxed::Arr(a1), Boxed::Arr(a2)) => {
                a1.elems.len() == a2.elems.len()
                    && self.val_equal(a1.atype, a2.atype)
                    && self.val_equal(a1.ios, a2.ios)
                    && self.val_equal(a1.boffset, a2.boffset)
                    && self.val_equal(a1.elems_bound, a2.elems_bound)
                    && self.val_equal(a1.size_bound, a2.size_bound)
                    && a1.elems.iter().zip(&a2.elems).all(|(e1, e2)| {
                        self.val_equal(e1.value, e2.value) && self.val_equal(e1.boffset, e2.boffset)
                    })
            }
            (Boxed::Sct(s1), Boxed::Sct(s2)) => {
                s1.fields.len() == s2.fields.len()
                    && s1.methods.len() == s2.methods.len()
                    && self.val_equal(s1.ios, s2.ios)
                    && self.val_equal(s1.stype, s2.stype)
                    && self.val_equal(s1.boffset, s2.boffset)
                    && s1.fields.iter().zip(&s2.fields).all(|(f1, f2)| {
                        f1.absent == f2.absent
                            && (f1.absent
                                || (self.val_equal(f1.name, f2.name)
                                    && self.val_equal(f1.value, f2.value)
                                    && self.val_equal(f1.boffset, f2.boffset)))
                    })
                    && s1
                        .methods
                        .iter()
                        .zip(&s2.methods)
                        .all(|(m1, m2)| self.val_equal(m1.name, m2.name))
            }
            (Boxed::Typ(t1), Boxed::Typ(t2)) => self.type_equal_1(t1, t2),
            _ => false,
        }
    }

    /// Equality of two type values per the type-equivalence rules:
    /// structural, except that array bounds do not participate and
    /// struct types compare nominally by name.
    pub fn type_equal(&self, t1: Value, t2: Value) -> bool {
        match (
            t1.box_id().map(|id| self.get(id)),
            t2.box_id().map(|id| self.get(id)),
        ) {
            (Some(Boxed::Typ(t1)), Some(Boxed::Typ(t2))) => self.type_equal_1(t1, t2),
            _ => false,
        }
    }

    fn type_equal_1(&self, t1: &TypeVal, t2: &TypeVal) -> bool {
        match (t1, t2) {
            (
                TypeVal::Integral { size: s1, signed: g1 },
                TypeVal::Integral { size: s2, signed: g2 },
            ) => s1 == s2 && g1 == g2,
            (TypeVal::String, TypeVal::String) | (TypeVal::Any, TypeVal::Any) => true,
            // Array bounds do not participate in type equality.
            (TypeVal::Array { etype: e1, .. }, TypeVal::Array { etype: e2, .. }) => {
                self.type_equal(*e1, *e2)
            }
            (TypeVal::Struct { name: n1, .. }, TypeVal::Struct { name: n2, .. }) => {
                match (self.str(*n1), self.str(*n2)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            (
                TypeVal::Offset { base: b1, unit: u1 },
                TypeVal::Offset { base: b2, unit: u2 },
            ) => u1 == u2 && self.type_equal(*b1, *b2),
            (
                TypeVal::Closure { rtype: r1, atypes: a1 },
                TypeVal::Closure { rtype: r2, atypes: a2 },
            ) => {
                a1.len() == a2.len()
                    && self.type_equal(*r1, *r2)
                    && a1.iter().zip(a2).all(|(x, y)| self.type_equal(*x, *y))
            }
            _ => false,
        }
    }

    // ---- collection ----

    /// Pin a boxed value so it survives collections regardless of
    /// reachability.  Used by program literal tables.
    pub fn pin(&mut self, id: BoxId) {
        self.pins[id.0 as usize] += 1;
    }

    /// Drop one pin of a boxed value.
    pub fn unpin(&mut self, id: BoxId) {
        let pin = &mut self.pins[id.0 as usize];
        debug_assert!(*pin > 0, "unbalanced unpin");
        *pin = pin.saturating_sub(1);
    }

    /// Whether enough allocation happened to warrant a collection.
    pub fn wants_collection(&self) -> bool {
        self.allocated_since_gc >= GC_STEP
    }

    /// Collect garbage.  `roots` must enumerate every live value the
    /// mutator can still reach other than pinned program literals.
    pub fn collect<I>(&mut self, roots: I)
    where
        I: IntoIterator<Item = Value>,
    {
        for m in self.marks.iter_mut() {
            *m = false;
        }

        let mut work: Vec<Value> = roots.into_iter().collect();
        for (ix, pin) in self.pins.iter().enumerate() {
            if *pin > 0 {
                work.push(Value::Box(BoxId(ix as u32)));
            }
        }

        while let Some(val) = work.pop() {
            let Some(id) = val.box_id() else { continue };
            if self.marks[id.0 as usize] {
                continue;
            }
            self.marks[id.0 as usize] = true;
            self.trace(id, &mut work);
        }

        let mut freed = 0usize;
        for ix in 0..self.slots.len() {
            if self.slots[ix].is_some() && !self.marks[ix] && self.pins[ix] == 0 {
                self.slots[ix] = None;
                self.free.push(ix as u32);
                freed += 1;
            }
        }
        self.allocated_since_gc = 0;
        debug!(freed, live = self.live(), "heap collection");
    }

    fn trace(&self, id: BoxId, work: &mut Vec<Value>) {
        match self.get(id) {
            Boxed::Long { .. } | Boxed::Ulong { .. } | Boxed::Str(_) => {}
            Boxed::Off(off) => {
                work.push(off.magnitude);
                work.push(off.unit);
                work.push(off.base_type);
            }
            Boxed::Arr(arr) => {
                work.push(arr.atype);
                work.push(arr.ios);
                work.push(arr.boffset);
                work.push(arr.elems_bound);
                work.push(arr.size_bound);
                work.push(arr.mapper);
                work.push(arr.writer);
                for elem in &arr.elems {
                    work.push(elem.value);
                    work.push(elem.boffset);
                }
            }
            Boxed::Sct(sct) => {
                work.push(sct.stype);
                work.push(sct.ios);
                work.push(sct.boffset);
                work.push(sct.mapper);
                work.push(sct.writer);
                for field in &sct.fields {
                    work.push(field.name);
                    work.push(field.value);
                    work.push(field.boffset);
                }
                for method in &sct.methods {
                    work.push(method.name);
                    work.push(method.value);
                }
            }
            Boxed::Typ(typ) => match typ {
                TypeVal::Integral { .. } | TypeVal::String | TypeVal::Any => {}
                TypeVal::Array { etype, bound } => {
                    work.push(*etype);
                    work.push(*bound);
                }
                TypeVal::Struct { name, fnames, ftypes } => {
                    work.push(*name);
                    work.extend(fnames.iter().copied());
                    work.extend(ftypes.iter().copied());
                }
                TypeVal::Offset { base, .. } => work.push(*base),
                TypeVal::Closure { rtype, atypes } => {
                    work.push(*rtype);
                    work.extend(atypes.iter().copied());
                }
            },
            Boxed::Cls(cls) => {
                for id in cls.program.pinned() {
                    work.push(Value::Box(*id));
                }
                if let Some(env) = &cls.env {
                    env.for_each_value(|v| work.push(v));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_uint;

    #[test]
    fn constructor_accessor_round_trip() {
        let mut heap = Heap::new();
        let s = heap.make_string("hello");
        assert_eq!(heap.str(s), Some("hello"));
        let l = heap.make_long(-5, 40);
        assert_eq!(heap.as_i64(l), Some(-5));
        let ul = heap.make_ulong(u64::MAX, 64);
        assert_eq!(heap.as_u64(ul), Some(u64::MAX));
    }

    #[test]
    fn invalid_widths_yield_null() {
        let mut heap = Heap::new();
        assert!(heap.make_long(1, 65).is_null());
        assert!(heap.make_ulong(1, 0).is_null());
    }

    #[test]
    fn offset_requires_ulong64_unit() {
        let mut heap = Heap::new();
        let mag = make_int(2, 32);
        let bad_unit = make_uint(8, 32);
        assert!(heap.make_offset(mag, bad_unit).is_null());
        let unit = heap.make_ulong(8, 64);
        let off = heap.make_offset(mag, unit);
        assert!(!off.is_null());
        assert_eq!(heap.size_of(off), 32);
    }

    #[test]
    fn struct_size_spans_offsets() {
        let mut heap = Heap::new();
        let stype = {
            let name = heap.make_string("S");
            heap.make_struct_type(name, vec![], vec![])
        };
        let sct = heap.make_struct(2, 0, stype);
        let f0 = heap.make_ulong(0, 64);
        let f1 = heap.make_ulong(8, 64);
        {
            let Boxed::Sct(s) = heap.get_mut(sct.box_id().unwrap()) else {
                unreachable!()
            };
            s.fields[0].value = make_uint(1, 8);
            s.fields[0].boffset = f0;
            s.fields[1].value = make_uint(2, 8);
            s.fields[1].boffset = f1;
        }
        assert_eq!(heap.size_of(sct), 16);
    }

    #[test]
    fn equality_is_structural() {
        let mut heap = Heap::new();
        let a = heap.make_string("x");
        let b = heap.make_string("x");
        assert!(heap.val_equal(a, b));
        assert!(!heap.val_equal(a, make_int(1, 32)));
        assert!(heap.val_equal(make_int(3, 16), make_int(3, 16)));
        assert!(!heap.val_equal(make_int(3, 16), make_int(3, 32)));
    }

    #[test]
    fn array_type_equality_ignores_bounds() {
        let mut heap = Heap::new();
        let e = heap.make_integral_type(8, false);
        let b1 = make_uint(3, 32);
        let t1 = heap.make_array_type(e, b1);
        let t2 = heap.make_array_type(e, Value::Null);
        assert!(heap.type_equal(t1, t2));
    }

    #[test]
    fn collection_frees_unreachable_keeps_pinned() {
        let mut heap = Heap::new();
        let kept = heap.make_string("kept");
        let pinned = heap.make_string("pinned");
        let _garbage = heap.make_string("garbage");
        heap.pin(pinned.box_id().unwrap());
        heap.collect([kept]);
        assert_eq!(heap.str(kept), Some("kept"));
        assert_eq!(heap.str(pinned), Some("pinned"));
        assert_eq!(heap.live(), 2);
        heap.unpin(pinned.box_id().unwrap());
        heap.collect([kept]);
        assert_eq!(heap.live(), 1);
    }

    #[test]
    fn exception_layout() {
        let mut heap = Heap::new();
        let exn = heap.make_exception(ExceptionCode::DivByZero, "division by zero", 1);
        let code = heap.ref_struct(exn, "code").unwrap();
        assert_eq!(heap.as_i64(code), Some(1));
        let msg = heap.ref_struct(exn, "msg").unwrap();
        assert_eq!(heap.str(msg), Some("division by zero"));
    }
}
