//! Runtime values.
//!
//! A value is conceptually a 64-bit tagged word.  Integers up to 32 bits
//! live inline in the word; everything else is a handle into the
//! [`Heap`](crate::Heap), which stores the boxed payload together with an
//! explicit tag.  [`Value`] is the decoded form of the word; the raw
//! encoding is still available through [`Value::to_raw`] and
//! [`Value::from_raw`] and is what the wide-push instruction pair
//! reassembles on 32-bit hosts.

use std::rc::Rc;

use crate::env::Env;
use crate::program::Program;

/// Index of a boxed payload inside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxId(pub(crate) u32);

/// A runtime value.
///
/// `Value` is `Copy`; structural operations (equality, size, printing)
/// need the owning heap and live on [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy)]
pub enum Value {
    /// The distinguished null sentinel.
    Null,
    /// Signed integer of declared width 1..=32.  The payload is kept
    /// sign-extended to 32 bits.
    Int {
        /// Sign-extended payload.
        v: i32,
        /// Declared width in bits.
        w: u8,
    },
    /// Unsigned integer of declared width 1..=32.  The payload is kept
    /// masked to the declared width.
    Uint {
        /// Masked payload.
        v: u32,
        /// Declared width in bits.
        w: u8,
    },
    /// Handle to a boxed payload.
    Box(BoxId),
}

// Raw-word tags.  Integers keep their payload in the high half.
const TAG_BOX: u64 = 0x0;
const TAG_INT: u64 = 0x1;
const TAG_UINT: u64 = 0x2;
const TAG_NULL: u64 = 0x7;
const TAG_MASK: u64 = 0x7;

impl Value {
    /// True if the value is the null sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True if the payload lives in the heap.
    pub fn is_boxed(&self) -> bool {
        matches!(self, Value::Box(_))
    }

    /// The handle of a boxed value.
    pub fn box_id(&self) -> Option<BoxId> {
        match self {
            Value::Box(id) => Some(*id),
            _ => None,
        }
    }

    /// Encode the value as a 64-bit tagged word.
    pub fn to_raw(self) -> u64 {
        match self {
            Value::Null => TAG_NULL,
            Value::Int { v, w } => {
                (((v as u32) as u64) << 32) | ((((w - 1) as u64) & 0x3f) << 3) | TAG_INT
            }
            Value::Uint { v, w } => {
                ((v as u64) << 32) | ((((w - 1) as u64) & 0x3f) << 3) | TAG_UINT
            }
            Value::Box(BoxId(ix)) => ((ix as u64) << 3) | TAG_BOX,
        }
    }

    /// Decode a 64-bit tagged word produced by [`Value::to_raw`].
    pub fn from_raw(raw: u64) -> Value {
        match raw & TAG_MASK {
            TAG_NULL => Value::Null,
            TAG_INT => {
                let w = (((raw >> 3) & 0x3f) + 1) as u8;
                Value::Int {
                    v: sign_extend_32((raw >> 32) as u32, w),
                    w,
                }
            }
            TAG_UINT => {
                let w = (((raw >> 3) & 0x3f) + 1) as u8;
                Value::Uint {
                    v: ((raw >> 32) as u32) & mask32(w),
                    w,
                }
            }
            _ => Value::Box(BoxId((raw >> 3) as u32)),
        }
    }
}

/// Make a signed integer value of the given width.  Widths outside
/// 1..=32 yield null.
pub fn make_int(v: i32, w: u32) -> Value {
    if !(1..=32).contains(&w) {
        return Value::Null;
    }
    let w = w as u8;
    Value::Int {
        v: sign_extend_32(v as u32, w),
        w,
    }
}

/// Make an unsigned integer value of the given width.  Widths outside
/// 1..=32 yield null.
pub fn make_uint(v: u32, w: u32) -> Value {
    if !(1..=32).contains(&w) {
        return Value::Null;
    }
    let w = w as u8;
    Value::Uint { v: v & mask32(w), w }
}

pub(crate) fn mask32(w: u8) -> u32 {
    if w >= 32 {
        u32::MAX
    } else {
        (1u32 << w) - 1
    }
}

pub(crate) fn mask64(w: u8) -> u64 {
    if w >= 64 {
        u64::MAX
    } else {
        (1u64 << w) - 1
    }
}

pub(crate) fn sign_extend_32(v: u32, w: u8) -> i32 {
    if w >= 32 {
        v as i32
    } else {
        let shift = 32 - w;
        (((v << shift) as i32) >> shift)
    }
}

pub(crate) fn sign_extend_64(v: u64, w: u8) -> i64 {
    if w >= 64 {
        v as i64
    } else {
        let shift = 64 - w;
        (((v << shift) as i64) >> shift)
    }
}

/// An array element: the value plus its bit-offset relative to the
/// beginning of the array, when known.
#[derive(Debug, Clone)]
pub struct ArrayElem {
    /// Element value.
    pub value: Value,
    /// Bit-offset of the element, a `uint<64>`-class value or null.
    pub boffset: Value,
}

/// Boxed array payload.
#[derive(Debug, Clone)]
pub struct ArrayVal {
    /// Array type handle (the element type lives inside it).
    pub atype: Value,
    /// Elements in order.
    pub elems: Vec<ArrayElem>,
    /// Mapped I/O space id, or null.
    pub ios: Value,
    /// Mapped base bit-offset, or null.
    pub boffset: Value,
    /// Bound on the number of elements, or null.
    pub elems_bound: Value,
    /// Bound on the byte size, or null.
    pub size_bound: Value,
    /// Mapper closure, or null.
    pub mapper: Value,
    /// Writer closure, or null.
    pub writer: Value,
}

/// One struct field.
#[derive(Debug, Clone)]
pub struct StructField {
    /// Field name as a string value, or null for anonymous fields.
    pub name: Value,
    /// Field value.
    pub value: Value,
    /// Bit-offset of the field, or null.
    pub boffset: Value,
    /// Set once the field has been assigned to after construction.
    pub modified: bool,
    /// Absent alternatives of unions and optional fields whose
    /// condition did not hold.
    pub absent: bool,
}

/// One struct method.
#[derive(Debug, Clone)]
pub struct StructMethod {
    /// Method name as a string value.
    pub name: Value,
    /// Method closure.
    pub value: Value,
}

/// Boxed struct payload.
#[derive(Debug, Clone)]
pub struct StructVal {
    /// Type handle.
    pub stype: Value,
    /// Fields in declaration order.
    pub fields: Vec<StructField>,
    /// Methods in declaration order.
    pub methods: Vec<StructMethod>,
    /// Mapped I/O space id, or null.
    pub ios: Value,
    /// Mapped base bit-offset, or null.
    pub boffset: Value,
    /// Mapper closure, or null.
    pub mapper: Value,
    /// Writer closure, or null.
    pub writer: Value,
}

/// Boxed offset payload: a magnitude in some integral type and a unit
/// expressed in bits.
#[derive(Debug, Clone)]
pub struct OffsetVal {
    /// Magnitude, any integral value.
    pub magnitude: Value,
    /// Unit in bits, a `uint<64>` value.
    pub unit: Value,
    /// Type of the magnitude, cached at construction.
    pub base_type: Value,
}

/// Boxed closure payload: a program plus the lexical environment bound
/// by the `pec` instruction.
#[derive(Clone)]
pub struct ClosureVal {
    /// The program whose entry point is the closure body.
    pub program: Rc<Program>,
    /// Captured environment.  Unset until `pec` runs.
    pub env: Option<Env>,
}

impl std::fmt::Debug for ClosureVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureVal")
            .field("env", &self.env.is_some())
            .finish_non_exhaustive()
    }
}

/// Type descriptors.
#[derive(Debug, Clone)]
pub enum TypeVal {
    /// Integral type of a size in bits and a signedness.
    Integral {
        /// Size in bits, 1..=64.
        size: u64,
        /// True for signed.
        signed: bool,
    },
    /// The string type.
    String,
    /// The top type.
    Any,
    /// Array type.
    Array {
        /// Element type handle.
        etype: Value,
        /// Bound value (element count or byte-size offset), or null.
        bound: Value,
    },
    /// Struct type, nominal by name.
    Struct {
        /// Type name as a string value, or null for anonymous structs.
        name: Value,
        /// Field names, string values or null.
        fnames: Vec<Value>,
        /// Field type handles.
        ftypes: Vec<Value>,
    },
    /// Offset type.
    Offset {
        /// Base integral type handle.
        base: Value,
        /// Unit in bits.
        unit: u64,
    },
    /// Closure type.
    Closure {
        /// Return type handle.
        rtype: Value,
        /// Argument type handles.
        atypes: Vec<Value>,
    },
}

/// A boxed payload together with its tag.
#[derive(Debug, Clone)]
pub enum Boxed {
    /// Signed integer of width 33..=64 (storage for any width up to 64).
    Long {
        /// Sign-extended payload.
        v: i64,
        /// Declared width in bits.
        w: u8,
    },
    /// Unsigned integer of width 33..=64.
    Ulong {
        /// Masked payload.
        v: u64,
        /// Declared width in bits.
        w: u8,
    },
    /// Owned string payload.
    Str(String),
    /// Array payload.
    Arr(ArrayVal),
    /// Struct payload.
    Sct(StructVal),
    /// Offset payload.
    Off(OffsetVal),
    /// Type payload.
    Typ(TypeVal),
    /// Closure payload.
    Cls(ClosureVal),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip_inline() {
        for (v, w) in [(0i32, 1), (-1, 12), (1234, 32), (-77, 8)] {
            let val = make_int(v, w);
            let raw = val.to_raw();
            match Value::from_raw(raw) {
                Value::Int { v: v2, w: w2 } => {
                    assert_eq!(w2 as u32, w);
                    assert_eq!(v2, sign_extend_32(v as u32, w as u8));
                }
                other => panic!("expected int, got {other:?}"),
            }
        }
        assert!(matches!(Value::from_raw(Value::Null.to_raw()), Value::Null));
    }

    #[test]
    fn widths_are_enforced() {
        assert!(make_int(1, 0).is_null());
        assert!(make_int(1, 33).is_null());
        assert!(make_uint(1, 65).is_null());
        match make_uint(0xffff, 8) {
            Value::Uint { v, w } => {
                assert_eq!(v, 0xff);
                assert_eq!(w, 8);
            }
            other => panic!("expected uint, got {other:?}"),
        }
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend_32(0xff, 8), -1);
        assert_eq!(sign_extend_32(0x7f, 8), 127);
        assert_eq!(sign_extend_64(0xffff_ffff_ffff, 48), -1);
    }

    #[quickcheck_macros::quickcheck]
    fn raw_encoding_round_trips(v: i32, w: u8) -> bool {
        let w = (w % 32) as u32 + 1;
        let val = make_int(v, w);
        let decoded = Value::from_raw(val.to_raw());
        match (val, decoded) {
            (Value::Int { v: a, w: wa }, Value::Int { v: b, w: wb }) => a == b && wa == wb,
            _ => false,
        }
    }

    #[quickcheck_macros::quickcheck]
    fn unsigned_patterns_are_masked(v: u32, w: u8) -> bool {
        let w = (w % 32) + 1;
        match make_uint(v, w as u32) {
            Value::Uint { v: stored, .. } => stored == v & mask32(w),
            _ => false,
        }
    }
}
