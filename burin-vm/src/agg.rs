//! Construction and access of aggregate values: arrays, structs and
//! their mapping metadata.

use burin_asm::ExceptionCode;

use crate::value::{make_uint, ArrayElem, ArrayVal, Boxed, StructField, StructMethod, StructVal, Value};
use crate::vm::{RunState, Vm};

type ExnResult<T> = Result<T, ExceptionCode>;

impl Vm {
    /// Build an array value for the `mka` instruction.  The stack holds
    /// the element values (deepest first) topped by the array type.
    pub(crate) fn make_array_value(&mut self, st: &mut RunState, nelem: u64) -> ExnResult<Value> {
        let atype = st.stack.pop().ok_or(ExceptionCode::Inval)?;
        let mut values = Vec::with_capacity(nelem as usize);
        for _ in 0..nelem {
            values.push(st.stack.pop().ok_or(ExceptionCode::Inval)?);
        }
        values.reverse();

        let mut boffset = 0u64;
        let mut elems = Vec::with_capacity(values.len());
        for value in values {
            let off = self.heap.make_ulong(boffset, 64);
            boffset += self.heap.size_of(value);
            elems.push(ArrayElem {
                value,
                boffset: off,
            });
        }
        let arr = self.heap.make_array(0, atype);
        if let Boxed::Arr(a) = self.heap.get_mut(arr.box_id().expect("fresh array")) {
            a.elems = elems;
        }
        Ok(arr)
    }

    /// Build a struct value for the `mksct` instruction.  The stack
    /// holds name/value pairs for fields, then name/closure pairs for
    /// methods, topped by the struct type.
    pub(crate) fn make_struct_value(
        &mut self,
        st: &mut RunState,
        nfields: u64,
        nmethods: u64,
    ) -> ExnResult<Value> {
        let stype = st.stack.pop().ok_or(ExceptionCode::Inval)?;
        let mut methods = Vec::with_capacity(nmethods as usize);
        for _ in 0..nmethods {
            let value = st.stack.pop().ok_or(ExceptionCode::Inval)?;
            let name = st.stack.pop().ok_or(ExceptionCode::Inval)?;
            methods.push(StructMethod { name, value });
        }
        methods.reverse();

        let mut raw_fields = Vec::with_capacity(nfields as usize);
        for _ in 0..nfields {
            let value = st.stack.pop().ok_or(ExceptionCode::Inval)?;
            let name = st.stack.pop().ok_or(ExceptionCode::Inval)?;
            raw_fields.push((name, value));
        }
        raw_fields.reverse();

        let mut boffset = 0u64;
        let mut fields = Vec::with_capacity(raw_fields.len());
        for (name, value) in raw_fields {
            let off = self.heap.make_ulong(boffset, 64);
            boffset += self.heap.size_of(value);
            fields.push(StructField {
                name,
                value,
                boffset: off,
                modified: false,
                absent: false,
            });
        }

        let sct = self.heap.make_struct(0, 0, stype);
        if let Boxed::Sct(s) = self.heap.get_mut(sct.box_id().expect("fresh struct")) {
            s.fields = fields;
            s.methods = methods;
        }
        Ok(sct)
    }

    /// Index an array or a string.
    pub(crate) fn aggregate_ref(&mut self, agg: Value, idx: Value) -> ExnResult<Value> {
        let ix = self.heap.as_u64(idx).ok_or(ExceptionCode::Inval)?;
        enum Found {
            Elem(Value),
            Byte(u8),
            Bad,
        }
        let found = match agg.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Arr(arr)) => match arr.elems.get(ix as usize) {
                Some(elem) => Found::Elem(elem.value),
                None => Found::Bad,
            },
            Some(Boxed::Str(s)) => match s.as_bytes().get(ix as usize) {
                Some(b) => Found::Byte(*b),
                None => Found::Bad,
            },
            _ => return Err(ExceptionCode::Inval),
        };
        match found {
            Found::Elem(val) => Ok(val),
            Found::Byte(b) => Ok(make_uint(b as u32, 8)),
            Found::Bad => Err(ExceptionCode::OutOfBounds),
        }
    }

    /// Store into an array element.
    pub(crate) fn array_set(&mut self, arr: Value, idx: Value, val: Value) -> ExnResult<()> {
        let ix = self.heap.as_u64(idx).ok_or(ExceptionCode::Inval)? as usize;
        let id = arr.box_id().ok_or(ExceptionCode::Inval)?;
        match self.heap.get_mut(id) {
            Boxed::Arr(a) => match a.elems.get_mut(ix) {
                Some(elem) => {
                    elem.value = val;
                    Ok(())
                }
                None => Err(ExceptionCode::OutOfBounds),
            },
            _ => Err(ExceptionCode::Inval),
        }
    }

    /// Slice an array or a string to the elements `[lo, hi)`.
    pub(crate) fn aggregate_trim(&mut self, agg: Value, lo: Value, hi: Value) -> ExnResult<Value> {
        let lo = self.heap.as_u64(lo).ok_or(ExceptionCode::Inval)? as usize;
        let hi = self.heap.as_u64(hi).ok_or(ExceptionCode::Inval)? as usize;
        enum Sliced {
            Arr(Value, Vec<Value>),
            Str(String),
        }
        let sliced = match agg.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Arr(arr)) => {
                if lo > hi || hi > arr.elems.len() {
                    return Err(ExceptionCode::OutOfBounds);
                }
                Sliced::Arr(
                    arr.atype,
                    arr.elems[lo..hi].iter().map(|e| e.value).collect(),
                )
            }
            Some(Boxed::Str(s)) => {
                if lo > hi || hi > s.len() {
                    return Err(ExceptionCode::OutOfBounds);
                }
                Sliced::Str(s[lo..hi].to_owned())
            }
            _ => return Err(ExceptionCode::Inval),
        };
        match sliced {
            Sliced::Str(s) => Ok(self.heap.make_string(&s)),
            Sliced::Arr(atype, values) => {
                let mut boffset = 0u64;
                let mut elems = Vec::with_capacity(values.len());
                for value in values {
                    let off = self.heap.make_ulong(boffset, 64);
                    boffset += self.heap.size_of(value);
                    elems.push(ArrayElem {
                        value,
                        boffset: off,
                    });
                }
                let arr = self.heap.make_array(0, atype);
                if let Boxed::Arr(a) = self.heap.get_mut(arr.box_id().expect("fresh array")) {
                    a.elems = elems;
                }
                Ok(arr)
            }
        }
    }

    /// Append an element to an array, like the `ains` instruction.
    pub(crate) fn array_append(&mut self, arr: Value, val: Value) -> ExnResult<()> {
        let id = arr.box_id().ok_or(ExceptionCode::Inval)?;
        let boffset = match self.heap.get(id) {
            Boxed::Arr(a) => a
                .elems
                .last()
                .map(|e| {
                    let base = self.heap.as_u64(e.boffset).unwrap_or(0);
                    base + self.heap.size_of(e.value)
                })
                .unwrap_or(0),
            _ => return Err(ExceptionCode::Inval),
        };
        let off = self.heap.make_ulong(boffset, 64);
        match self.heap.get_mut(id) {
            Boxed::Arr(a) => {
                a.elems.push(ArrayElem {
                    value: val,
                    boffset: off,
                });
                Ok(())
            }
            _ => Err(ExceptionCode::Inval),
        }
    }

    /// Replace the elements `[lo, hi)` of an array with the elements of
    /// another array, like the `asplice` instruction.
    pub(crate) fn array_splice(
        &mut self,
        arr: Value,
        lo: Value,
        hi: Value,
        src: Value,
    ) -> ExnResult<()> {
        let lo = self.heap.as_u64(lo).ok_or(ExceptionCode::Inval)? as usize;
        let hi = self.heap.as_u64(hi).ok_or(ExceptionCode::Inval)? as usize;
        let new_elems: Vec<Value> = match src.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Arr(s)) => s.elems.iter().map(|e| e.value).collect(),
            _ => return Err(ExceptionCode::Inval),
        };
        let id = arr.box_id().ok_or(ExceptionCode::Inval)?;
        let mut values: Vec<Value> = match self.heap.get(id) {
            Boxed::Arr(a) => {
                if lo > hi || hi > a.elems.len() {
                    return Err(ExceptionCode::OutOfBounds);
                }
                a.elems.iter().map(|e| e.value).collect()
            }
            _ => return Err(ExceptionCode::Inval),
        };
        values.splice(lo..hi, new_elems);
        let mut boffset = 0u64;
        let mut elems = Vec::with_capacity(values.len());
        for value in values {
            let off = self.heap.make_ulong(boffset, 64);
            boffset += self.heap.size_of(value);
            elems.push(ArrayElem {
                value,
                boffset: off,
            });
        }
        if let Boxed::Arr(a) = self.heap.get_mut(id) {
            a.elems = elems;
        }
        Ok(())
    }

    /// Array membership by structural equality.
    pub(crate) fn array_in(&mut self, elem: Value, arr: Value) -> ExnResult<Value> {
        let found = match arr.box_id().map(|id| self.heap.get(id)) {
            Some(Boxed::Arr(a)) => a.elems.iter().any(|e| self.heap.val_equal(e.value, elem)),
            _ => return Err(ExceptionCode::Inval),
        };
        Ok(crate::value::make_int(found as i32, 32))
    }

    /// Update one mapping slot of an array or struct value.
    pub(crate) fn set_mapping(
        &mut self,
        val: Value,
        arr_slot: impl FnOnce(&mut ArrayVal) -> &mut Value,
        sct_slot: impl FnOnce(&mut StructVal) -> &mut Value,
        new: Value,
    ) -> ExnResult<()> {
        let id = val.box_id().ok_or(ExceptionCode::NoMap)?;
        match self.heap.get_mut(id) {
            Boxed::Arr(arr) => {
                *arr_slot(arr) = new;
                Ok(())
            }
            Boxed::Sct(sct) => {
                *sct_slot(sct) = new;
                Ok(())
            }
            _ => Err(ExceptionCode::NoMap),
        }
    }
}
