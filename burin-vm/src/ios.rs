//! I/O spaces: the byte sources and sinks mapped values read from and
//! write through.
//!
//! The machine is agnostic to what backs a space; anything implementing
//! [`IoSpace`] can be registered.  Two backings are provided: an
//! in-memory buffer and a regular file.  Spaces are addressed by small
//! integer ids; one space is distinguished as *current*.

use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use burin_asm::ExceptionCode;

bitflags! {
    /// Open flags for I/O spaces.  The high 32 bits are reserved for
    /// backend-specific flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IosFlags: u64 {
        /// Open for reading.
        const READ = 0x1;
        /// Open for writing.
        const WRITE = 0x2;
        /// Truncate on open.
        const TRUNCATE = 0x8;
        /// Create when missing.
        const CREATE = 0x10;
    }
}

/// Byte order used when assembling multi-byte reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// Least significant byte first.
    #[default]
    Lsb,
    /// Most significant byte first.
    Msb,
}

/// Encoding of negative integers in the underlying bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Nenc {
    /// One's complement.
    Ones,
    /// Two's complement.
    #[default]
    Twos,
}

/// A byte space mapped values live against.
pub trait IoSpace {
    /// Identifying handler string, e.g. a file path or `*mem*`.
    fn handler(&self) -> &str;

    /// Flags the space was opened with.
    fn flags(&self) -> IosFlags;

    /// Size of the space in bytes.
    fn size(&self) -> u64;

    /// Read bytes at a byte offset.  Short reads are errors.
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write bytes at a byte offset.
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Flush buffered writes to the backing.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An in-memory I/O space.
#[derive(Debug, Default)]
pub struct MemIos {
    handler: String,
    bytes: Vec<u8>,
}

impl MemIos {
    /// A memory space over the given bytes.
    pub fn new(handler: &str, bytes: Vec<u8>) -> MemIos {
        MemIos {
            handler: handler.to_owned(),
            bytes,
        }
    }
}

impl IoSpace for MemIos {
    fn handler(&self) -> &str {
        &self.handler
    }

    fn flags(&self) -> IosFlags {
        IosFlags::READ | IosFlags::WRITE
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"));
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// A file-backed I/O space.  The file contents are buffered in memory
/// and written back on flush and close.
#[derive(Debug)]
pub struct FileIos {
    path: PathBuf,
    flags: IosFlags,
    bytes: Vec<u8>,
    dirty: bool,
}

impl FileIos {
    /// Open a file as an I/O space.
    pub fn open(path: &Path, flags: IosFlags) -> io::Result<FileIos> {
        let bytes = if flags.contains(IosFlags::TRUNCATE) {
            Vec::new()
        } else {
            match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound && flags.contains(IosFlags::CREATE) => {
                    Vec::new()
                }
                Err(e) => return Err(e),
            }
        };
        Ok(FileIos {
            path: path.to_owned(),
            flags,
            bytes,
            dirty: false,
        })
    }
}

impl IoSpace for FileIos {
    fn handler(&self) -> &str {
        self.path.to_str().unwrap_or("<non-utf8 path>")
    }

    fn flags(&self) -> IosFlags {
        self.flags
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"));
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        if !self.flags.contains(IosFlags::WRITE) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only space"));
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            std::fs::write(&self.path, &self.bytes)?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// The set of open I/O spaces.
#[derive(Default)]
pub struct IosRegistry {
    spaces: Vec<Option<Box<dyn IoSpace>>>,
    cur: Option<i32>,
}

impl IosRegistry {
    /// Register a space and make it current.  Returns its id.
    pub fn open(&mut self, space: Box<dyn IoSpace>) -> i32 {
        let id = self
            .spaces
            .iter()
            .position(|s| s.is_none())
            .unwrap_or_else(|| {
                self.spaces.push(None);
                self.spaces.len() - 1
            });
        self.spaces[id] = Some(space);
        self.cur = Some(id as i32);
        id as i32
    }

    /// Close a space, flushing it first.  Returns false for unknown
    /// ids.
    pub fn close(&mut self, id: i32) -> bool {
        match self.spaces.get_mut(id as usize) {
            Some(slot @ Some(_)) => {
                if let Some(space) = slot.as_mut() {
                    let _ = space.flush();
                }
                *slot = None;
                if self.cur == Some(id) {
                    self.cur = self.spaces.iter().position(|s| s.is_some()).map(|p| p as i32);
                }
                true
            }
            _ => false,
        }
    }

    /// The current space id, if any space is open.
    pub fn cur(&self) -> Option<i32> {
        self.cur
    }

    /// Make a space current.  Returns false for unknown ids.
    pub fn set_cur(&mut self, id: i32) -> bool {
        if self.get(id).is_some() {
            self.cur = Some(id);
            true
        } else {
            false
        }
    }

    /// Access a space by id.
    pub fn get(&self, id: i32) -> Option<&dyn IoSpace> {
        self.spaces
            .get(id as usize)
            .and_then(|s| s.as_deref())
    }

    /// Mutable access to a space by id.
    pub fn get_mut(&mut self, id: i32) -> Option<&mut dyn IoSpace> {
        match self.spaces.get_mut(id as usize) {
            Some(Some(space)) => Some(space.as_mut()),
            _ => None,
        }
    }

    /// Find a space by handler string.
    pub fn search(&self, handler: &str) -> Option<i32> {
        self.spaces.iter().enumerate().find_map(|(id, s)| {
            s.as_ref()
                .filter(|s| s.handler() == handler)
                .map(|_| id as i32)
        })
    }

    /// Visit every open space id, in id order.
    pub fn for_each_id<F: FnMut(i32)>(&self, mut f: F) {
        for (id, space) in self.spaces.iter().enumerate() {
            if space.is_some() {
                f(id as i32);
            }
        }
    }

    /// Read `width` bits at `boffset` bits from a space, assembling the
    /// result per the byte order and negative encoding.
    pub fn peek_bits(
        &self,
        id: i32,
        boffset: u64,
        width: u8,
        endian: Endian,
        nenc: Nenc,
        signed: bool,
    ) -> Result<u64, ExceptionCode> {
        let space = self.get(id).ok_or(ExceptionCode::NoIos)?;
        let first_byte = boffset / 8;
        let bit_shift = (boffset % 8) as u32;
        let nbytes = ((bit_shift as u64 + width as u64 + 7) / 8) as usize;
        let mut buf = [0u8; 16];
        space
            .pread(&mut buf[..nbytes], first_byte)
            .map_err(|_| ExceptionCode::Eof)?;

        // Assemble the covered bytes most-significant first, honoring
        // the byte order for byte-aligned multi-byte reads.
        let mut bits: u128 = 0;
        if bit_shift == 0 && width % 8 == 0 && matches!(endian, Endian::Lsb) {
            for b in buf[..nbytes].iter().rev() {
                bits = (bits << 8) | *b as u128;
            }
        } else {
            for b in &buf[..nbytes] {
                bits = (bits << 8) | *b as u128;
            }
            bits >>= (nbytes as u32 * 8) - bit_shift - width as u32;
        }
        let mut out = (bits as u64) & crate::value::mask64(width);
        if signed && matches!(nenc, Nenc::Ones) {
            // One's complement: a negative pattern is the complement of
            // its magnitude.
            let sign_bit = 1u64 << (width - 1);
            if out & sign_bit != 0 {
                let mag = (!out) & crate::value::mask64(width - 1);
                out = (mag.wrapping_neg()) & crate::value::mask64(width);
            }
        }
        Ok(out)
    }

    /// Write `width` bits at `boffset` bits into a space.
    pub fn poke_bits(
        &mut self,
        id: i32,
        boffset: u64,
        width: u8,
        bits: u64,
        endian: Endian,
    ) -> Result<(), ExceptionCode> {
        let first_byte = boffset / 8;
        let bit_shift = (boffset % 8) as u32;
        let nbytes = ((bit_shift as u64 + width as u64 + 7) / 8) as usize;

        let space = self.get_mut(id).ok_or(ExceptionCode::NoIos)?;
        if !space.flags().contains(IosFlags::WRITE) {
            return Err(ExceptionCode::Io);
        }

        let mut buf = [0u8; 16];
        // Preserve the bits around the written field.
        if space.pread(&mut buf[..nbytes], first_byte).is_err() {
            buf = [0u8; 16];
        }

        if bit_shift == 0 && width % 8 == 0 && matches!(endian, Endian::Lsb) {
            for (i, b) in buf[..nbytes].iter_mut().enumerate() {
                *b = (bits >> (8 * i)) as u8;
            }
        } else {
            let mut existing: u128 = 0;
            for b in &buf[..nbytes] {
                existing = (existing << 8) | *b as u128;
            }
            let shift = (nbytes as u32 * 8) - bit_shift - width as u32;
            let mask = (crate::value::mask64(width) as u128) << shift;
            existing = (existing & !mask) | (((bits as u128) << shift) & mask);
            for i in (0..nbytes).rev() {
                buf[i] = existing as u8;
                existing >>= 8;
            }
        }
        space
            .pwrite(&buf[..nbytes], first_byte)
            .map_err(|_| ExceptionCode::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_encoding() {
        assert_eq!(IosFlags::READ.bits(), 1);
        assert_eq!(IosFlags::WRITE.bits(), 2);
        assert_eq!(IosFlags::TRUNCATE.bits(), 8);
        assert_eq!(IosFlags::CREATE.bits(), 16);
    }

    #[test]
    fn registry_open_search_close() {
        let mut reg = IosRegistry::default();
        let a = reg.open(Box::new(MemIos::new("*a*", vec![1, 2, 3])));
        let b = reg.open(Box::new(MemIos::new("*b*", vec![])));
        assert_eq!(reg.cur(), Some(b));
        assert_eq!(reg.search("*a*"), Some(a));
        assert!(reg.set_cur(a));
        assert!(reg.close(b));
        assert_eq!(reg.cur(), Some(a));
        assert!(!reg.close(b));
    }

    #[rstest::rstest]
    #[case(Endian::Lsb, 0x1234)]
    #[case(Endian::Msb, 0x3412)]
    fn peek_aligned_respects_byte_order(#[case] endian: Endian, #[case] expected: u64) {
        let mut reg = IosRegistry::default();
        let id = reg.open(Box::new(MemIos::new("*m*", vec![0x34, 0x12])));
        let v = reg
            .peek_bits(id, 0, 16, endian, Nenc::Twos, false)
            .unwrap();
        assert_eq!(v, expected);
    }

    #[test]
    fn peek_unaligned_bits() {
        let mut reg = IosRegistry::default();
        // 0b1011_0110: bits 2..6 are 0b1101.
        let id = reg.open(Box::new(MemIos::new("*m*", vec![0b1011_0110])));
        let v = reg
            .peek_bits(id, 2, 4, Endian::Msb, Nenc::Twos, false)
            .unwrap();
        assert_eq!(v, 0b1101);
    }

    #[test]
    fn poke_then_peek() {
        let mut reg = IosRegistry::default();
        let id = reg.open(Box::new(MemIos::new("*m*", vec![0; 4])));
        reg.poke_bits(id, 8, 16, 0xbeef, Endian::Lsb).unwrap();
        let v = reg
            .peek_bits(id, 8, 16, Endian::Lsb, Nenc::Twos, false)
            .unwrap();
        assert_eq!(v, 0xbeef);
    }

    #[test]
    fn eof_past_end() {
        let mut reg = IosRegistry::default();
        let id = reg.open(Box::new(MemIos::new("*m*", vec![0])));
        assert_eq!(
            reg.peek_bits(id, 4, 8, Endian::Lsb, Nenc::Twos, false),
            Err(ExceptionCode::Eof)
        );
    }
}
