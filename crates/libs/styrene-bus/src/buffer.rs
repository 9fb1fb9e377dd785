use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::BusError;

/// Byte order of a marshaled message, carried as the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub const LITTLE_MARKER: u8 = b'l';
    pub const BIG_MARKER: u8 = b'B';

    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    pub const fn marker(self) -> u8 {
        match self {
            Self::Little => Self::LITTLE_MARKER,
            Self::Big => Self::BIG_MARKER,
        }
    }

    pub fn from_marker(marker: u8) -> Result<Self, BusError> {
        match marker {
            Self::LITTLE_MARKER => Ok(Self::Little),
            Self::BIG_MARKER => Ok(Self::Big),
            other => Err(BusError::BadHeaderField(format!("endianness marker 0x{other:02x}"))),
        }
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Little => write!(f, "little"),
            Self::Big => write!(f, "big"),
        }
    }
}

static OUTBOUND_ENDIANNESS: AtomicU8 = AtomicU8::new(Endianness::native().marker());

/// Sets the byte order used for messages composed without an explicit choice.
pub fn set_outbound_endianness(endianness: Endianness) {
    OUTBOUND_ENDIANNESS.store(endianness.marker(), Ordering::Relaxed);
}

pub fn outbound_endianness() -> Endianness {
    match OUTBOUND_ENDIANNESS.load(Ordering::Relaxed) {
        Endianness::BIG_MARKER => Endianness::Big,
        _ => Endianness::Little,
    }
}

/// Number of zero bytes needed to bring `offset` up to a multiple of `alignment`.
pub const fn padding_for(offset: usize, alignment: usize) -> usize {
    (alignment - offset % alignment) % alignment
}

/// Growable output cursor. Alignment is relative to the first byte written,
/// which must itself sit on an 8-byte boundary of the message.
pub struct WireWriter {
    buffer: Vec<u8>,
    endianness: Endianness,
}

impl WireWriter {
    pub fn new(endianness: Endianness) -> Self {
        Self { buffer: Vec::new(), endianness }
    }

    pub fn with_capacity(endianness: Endianness, capacity: usize) -> Self {
        Self { buffer: Vec::with_capacity(capacity), endianness }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    pub fn align_to(&mut self, alignment: usize) {
        let pad = padding_for(self.buffer.len(), alignment);
        self.buffer.resize(self.buffer.len() + pad, 0);
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pads to `alignment`, then writes `data`.
    pub fn write_padded(&mut self, alignment: usize, data: &[u8]) {
        self.align_to(alignment);
        self.write(data);
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.buffer.push(byte);
    }

    pub fn write_u16(&mut self, value: u16) {
        match self.endianness {
            Endianness::Little => self.write(&value.to_le_bytes()),
            Endianness::Big => self.write(&value.to_be_bytes()),
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        match self.endianness {
            Endianness::Little => self.write(&value.to_le_bytes()),
            Endianness::Big => self.write(&value.to_be_bytes()),
        }
    }

    pub fn write_u64(&mut self, value: u64) {
        match self.endianness {
            Endianness::Little => self.write(&value.to_le_bytes()),
            Endianness::Big => self.write(&value.to_be_bytes()),
        }
    }

    /// Overwrites a previously reserved u32, used for array length prefixes.
    pub fn patch_u32(&mut self, at: usize, value: u32) -> Result<(), BusError> {
        let bytes = match self.endianness {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        };
        let slot = self
            .buffer
            .get_mut(at..at + 4)
            .ok_or_else(|| BusError::bad_value(format!("patch offset {at} out of range")))?;
        slot.copy_from_slice(&bytes);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl fmt::Display for WireWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ 0x")?;

        for byte in &self.buffer {
            write!(f, "{:0>2x}", byte)?;
        }

        write!(f, " ]",)
    }
}

/// Borrowing input cursor over a complete region (header block or body).
/// Running past the end yields `EndOfData`.
pub struct WireReader<'a> {
    buffer: &'a [u8],
    offset: usize,
    endianness: Endianness,
}

impl<'a> WireReader<'a> {
    pub fn new(buffer: &'a [u8], endianness: Endianness) -> Self {
        Self { buffer, offset: 0, endianness }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn bytes_left(&self) -> usize {
        self.buffer.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.bytes_left() == 0
    }

    pub fn align_to(&mut self, alignment: usize) -> Result<(), BusError> {
        let pad = padding_for(self.offset, alignment);
        self.read_slice(pad).map(|_| ())
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], BusError> {
        if len > self.bytes_left() {
            return Err(BusError::EndOfData);
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.buffer[start..self.offset])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], BusError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_slice(N)?);
        Ok(out)
    }

    pub fn read_byte(&mut self) -> Result<u8, BusError> {
        let [byte] = self.read_array::<1>()?;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, BusError> {
        let bytes = self.read_array::<2>()?;
        Ok(match self.endianness {
            Endianness::Little => u16::from_le_bytes(bytes),
            Endianness::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32, BusError> {
        let bytes = self.read_array::<4>()?;
        Ok(match self.endianness {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64, BusError> {
        let bytes = self.read_array::<8>()?;
        Ok(match self.endianness {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_aligns_with_zero_padding() {
        let mut writer = WireWriter::new(Endianness::Little);
        writer.write_byte(0xAA);
        writer.align_to(4);
        writer.write_u32(1);
        writer.align_to(8);
        assert_eq!(writer.as_slice(), &[0xAA, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn big_endian_order() {
        let mut writer = WireWriter::new(Endianness::Big);
        writer.write_u32(0x0102_0304);
        writer.write_u16(0x0506);
        assert_eq!(writer.as_slice(), &[1, 2, 3, 4, 5, 6]);

        let mut reader = WireReader::new(writer.as_slice(), Endianness::Big);
        assert_eq!(reader.read_u32().expect("u32"), 0x0102_0304);
        assert_eq!(reader.read_u16().expect("u16"), 0x0506);
        assert!(reader.is_empty());
    }

    #[test]
    fn patch_reserved_length() {
        let mut writer = WireWriter::new(Endianness::Little);
        writer.write_u32(0);
        writer.write(b"abc");
        writer.patch_u32(0, 3).expect("patch");
        assert_eq!(&writer.as_slice()[..4], &[3, 0, 0, 0]);
        assert!(writer.patch_u32(5, 1).is_err());
    }

    #[test]
    fn reader_reports_end_of_data() {
        let data = [1u8, 2, 3];
        let mut reader = WireReader::new(&data, Endianness::Little);
        assert!(matches!(reader.read_u32(), Err(BusError::EndOfData)));
        assert_eq!(reader.offset(), 0);
        reader.read_byte().expect("byte");
        assert!(matches!(reader.align_to(2), Ok(())));
        assert_eq!(reader.offset(), 2);
        assert!(matches!(reader.align_to(4), Err(BusError::EndOfData)));
    }

    #[test]
    fn markers_roundtrip() {
        assert_eq!(Endianness::from_marker(b'l').expect("l"), Endianness::Little);
        assert_eq!(Endianness::from_marker(b'B').expect("B"), Endianness::Big);
        assert!(matches!(Endianness::from_marker(b'x'), Err(BusError::BadHeaderField(_))));
    }

    #[test]
    fn padding_math() {
        assert_eq!(padding_for(0, 8), 0);
        assert_eq!(padding_for(1, 8), 7);
        assert_eq!(padding_for(6, 4), 2);
        assert_eq!(padding_for(9, 1), 0);
    }
}
