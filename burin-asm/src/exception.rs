use core::fmt;

/// Runtime exception codes raised by the virtual machine.
///
/// The numeric values are part of the runtime contract: the `code` field
/// of the `Exception` struct value observed by user programs carries
/// exactly these numbers, and the runtime library declares matching
/// constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Unspecified error condition.
    Generic = 0,
    /// Division (or modulus, or ceiling division) by zero.
    DivByZero = 1,
    /// An operation needed an I/O space and none is open.
    NoIos = 2,
    /// A function with a return type reached its end without returning.
    NoReturn = 3,
    /// Index outside the limits of an array or string, or an oversized
    /// shift count.
    OutOfBounds = 4,
    /// Access past the declared bounds of a mapped value.
    MapBounds = 5,
    /// Read past the end of an I/O space.
    Eof = 6,
    /// The value is not mapped, or its type carries no mapper.
    NoMap = 7,
    /// Impossible conversion between value kinds.
    Conv = 8,
    /// Reference to an unknown or absent element or field.
    Elem = 9,
    /// A field constraint evaluated to false while mapping.
    Constraint = 10,
    /// Generic input/output failure.
    Io = 11,
    /// Execution interrupted by a signal.
    Signal = 12,
    /// Invalid combination of I/O space open flags.
    IoFlags = 13,
    /// Invalid argument to an operation.
    Inval = 14,
    /// Ordered termination requested by the program.
    Exit = 15,
}

impl ExceptionCode {
    /// The human-readable message associated with the exception code.
    pub const fn msg(&self) -> &'static str {
        match self {
            ExceptionCode::Generic => "generic",
            ExceptionCode::DivByZero => "division by zero",
            ExceptionCode::NoIos => "no IOS",
            ExceptionCode::NoReturn => "no return",
            ExceptionCode::OutOfBounds => "out of bounds",
            ExceptionCode::MapBounds => "out of map bounds",
            ExceptionCode::Eof => "EOF",
            ExceptionCode::NoMap => "no map",
            ExceptionCode::Conv => "conversion error",
            ExceptionCode::Elem => "invalid element",
            ExceptionCode::Constraint => "constraint violation",
            ExceptionCode::Io => "generic IO",
            ExceptionCode::Signal => "",
            ExceptionCode::IoFlags => "invalid IO flags",
            ExceptionCode::Inval => "invalid argument",
            ExceptionCode::Exit => "",
        }
    }

    /// The default exit status carried by exceptions of this code.
    pub const fn exit_status(&self) -> i32 {
        match self {
            ExceptionCode::Exit => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for ExceptionCode {}

impl From<u8> for ExceptionCode {
    fn from(b: u8) -> Self {
        use ExceptionCode::*;
        match b {
            1 => DivByZero,
            2 => NoIos,
            3 => NoReturn,
            4 => OutOfBounds,
            5 => MapBounds,
            6 => Eof,
            7 => NoMap,
            8 => Conv,
            9 => Elem,
            10 => Constraint,
            11 => Io,
            12 => Signal,
            13 => IoFlags,
            14 => Inval,
            15 => Exit,
            _ => Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn u8_code_round_trip() {
        for code in ExceptionCode::iter() {
            let b = code as u8;
            assert_eq!(ExceptionCode::from(b), code);
        }
        // Codes past the table map to the generic exception.
        let last = ExceptionCode::iter().last().unwrap() as u8;
        for b in (last + 1)..=255 {
            assert_eq!(ExceptionCode::from(b), ExceptionCode::Generic);
        }
    }

    #[test]
    fn exit_statuses() {
        assert_eq!(ExceptionCode::Exit.exit_status(), 0);
        assert_eq!(ExceptionCode::DivByZero.exit_status(), 1);
    }
}
