//! Fixed message header and the header-field table.
//!
//! ```text
//!  0        1        2        3        4               8               12              16
//!  +--------+--------+--------+--------+---------------+---------------+---------------+
//!  | endian |  type  | flags  | major  |   body_len    |    serial     |  header_len   |
//!  +--------+--------+--------+--------+---------------+---------------+---------------+
//!  | header fields: (y v) structs, each 8-aligned, header_len bytes     | pad to 8      |
//!  +--------------------------------------------------------------------+---------------+
//!  | body                                                                               |
//!  +------------------------------------------------------------------------------------+
//! ```

use std::fmt;

use crate::arg::Arg;
use crate::buffer::{Endianness, WireReader, WireWriter};
use crate::error::BusError;

pub const MAJOR_PROTOCOL_VERSION: u8 = 1;

/// Largest header-field block accepted on the wire.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0,
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Result<Self, BusError> {
        match b {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::MethodReturn),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(BusError::BadHeaderField(format!("message type {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::MethodCall => "method call",
            Self::MethodReturn => "method return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header flag bits as seen by callers. `AUTO_START` is stored inverted on
/// the wire; [`MessageHeader`] flips it when writing and parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NO_REPLY_EXPECTED: Self = Self(0x01);
    pub const AUTO_START: Self = Self(0x02);
    pub const ALLOW_REMOTE_MSG: Self = Self(0x04);
    pub const SESSIONLESS: Self = Self(0x10);
    pub const GLOBAL_BROADCAST: Self = Self(0x20);
    /// Legacy header compression. Carried, never acted on.
    pub const COMPRESSED: Self = Self(0x40);
    pub const ENCRYPTED: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MessageFlags, &str); 7] = [
            (MessageFlags::NO_REPLY_EXPECTED, "no-reply"),
            (MessageFlags::AUTO_START, "auto-start"),
            (MessageFlags::ALLOW_REMOTE_MSG, "allow-remote"),
            (MessageFlags::SESSIONLESS, "sessionless"),
            (MessageFlags::GLOBAL_BROADCAST, "global-broadcast"),
            (MessageFlags::COMPRESSED, "compressed"),
            (MessageFlags::ENCRYPTED, "encrypted"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub endianness: Endianness,
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    pub major_version: u8,
    pub body_len: u32,
    pub serial: u32,
    pub header_len: u32,
}

impl MessageHeader {
    pub const SIZE: usize = 16;

    pub fn write(&self, writer: &mut WireWriter) {
        writer.write_byte(self.endianness.marker());
        writer.write_byte(self.msg_type as u8);
        writer.write_byte(self.flags.bits() ^ MessageFlags::AUTO_START.bits());
        writer.write_byte(self.major_version);
        writer.write_u32(self.body_len);
        writer.write_u32(self.serial);
        writer.write_u32(self.header_len);
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut writer = WireWriter::with_capacity(self.endianness, Self::SIZE);
        self.write(&mut writer);
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(writer.as_slice());
        out
    }

    /// Decodes the first [`Self::SIZE`] bytes. Shorter input is `EndOfData`.
    pub fn parse(bytes: &[u8]) -> Result<Self, BusError> {
        let fixed = bytes.get(..Self::SIZE).ok_or(BusError::EndOfData)?;
        let endianness = Endianness::from_marker(fixed[0])?;
        let msg_type = MessageType::from_byte(fixed[1])?;
        let flags = MessageFlags::from_bits(fixed[2] ^ MessageFlags::AUTO_START.bits());
        let major_version = fixed[3];
        if major_version != MAJOR_PROTOCOL_VERSION {
            return Err(BusError::BadHeaderField(format!(
                "major protocol version {major_version}"
            )));
        }
        let mut reader = WireReader::new(&fixed[4..], endianness);
        let body_len = reader.read_u32()?;
        let serial = reader.read_u32()?;
        let header_len = reader.read_u32()?;
        Ok(Self { endianness, msg_type, flags, major_version, body_len, serial, header_len })
    }
}

/// Wire identifiers of the known header fields. Codes 10..=15 and 20 and up
/// are unassigned: parsed, then skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderFieldId {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    Handles = 9,
    Timestamp = 16,
    TimeToLive = 17,
    CompressionToken = 18,
    SessionId = 19,
}

pub const HEADER_FIELD_COUNT: usize = 13;

impl HeaderFieldId {
    /// All known fields in ascending wire order.
    pub const ALL: [HeaderFieldId; HEADER_FIELD_COUNT] = [
        Self::Path,
        Self::Interface,
        Self::Member,
        Self::ErrorName,
        Self::ReplySerial,
        Self::Destination,
        Self::Sender,
        Self::Signature,
        Self::Handles,
        Self::Timestamp,
        Self::TimeToLive,
        Self::CompressionToken,
        Self::SessionId,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| *id as u8 == code)
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The single type code every value of this field must carry.
    pub const fn type_code(self) -> u8 {
        match self {
            Self::Path => b'o',
            Self::Interface | Self::Member | Self::ErrorName | Self::Destination | Self::Sender => {
                b's'
            }
            Self::Signature => b'g',
            Self::TimeToLive => b'q',
            Self::ReplySerial
            | Self::Handles
            | Self::Timestamp
            | Self::CompressionToken
            | Self::SessionId => b'u',
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Interface => "interface",
            Self::Member => "member",
            Self::ErrorName => "error_name",
            Self::ReplySerial => "reply_serial",
            Self::Destination => "destination",
            Self::Sender => "sender",
            Self::Signature => "signature",
            Self::Handles => "handles",
            Self::Timestamp => "timestamp",
            Self::TimeToLive => "time_to_live",
            Self::CompressionToken => "compression_token",
            Self::SessionId => "session_id",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Timestamp => 9,
            Self::TimeToLive => 10,
            Self::CompressionToken => 11,
            Self::SessionId => 12,
            other => other as usize - 1,
        }
    }
}

/// One slot per known header field. Absent slots read back as `""` or `0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderFields {
    slots: [Option<Arg<'static>>; HEADER_FIELD_COUNT],
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, rejecting a type that does not belong in the slot.
    pub fn set(&mut self, id: HeaderFieldId, value: Arg<'static>) -> Result<(), BusError> {
        let expected = id.type_code();
        if value.signature().as_bytes() != [expected] {
            return Err(BusError::BadHeaderField(format!(
                "{} must have type '{}', got \"{}\"",
                id.name(),
                expected as char,
                value.signature()
            )));
        }
        self.slots[id.index()] = Some(value);
        Ok(())
    }

    pub fn get(&self, id: HeaderFieldId) -> Option<&Arg<'static>> {
        self.slots[id.index()].as_ref()
    }

    pub fn remove(&mut self, id: HeaderFieldId) -> Option<Arg<'static>> {
        self.slots[id.index()].take()
    }

    pub fn contains(&self, id: HeaderFieldId) -> bool {
        self.get(id).is_some()
    }

    /// Present fields in ascending wire order.
    pub fn iter(&self) -> impl Iterator<Item = (HeaderFieldId, &Arg<'static>)> + '_ {
        HeaderFieldId::ALL.into_iter().filter_map(|id| self.get(id).map(|value| (id, value)))
    }

    pub fn str_value(&self, id: HeaderFieldId) -> &str {
        self.get(id).and_then(Arg::as_str).unwrap_or("")
    }

    pub fn u32_value(&self, id: HeaderFieldId) -> u32 {
        match self.get(id) {
            Some(Arg::Uint32(value)) => *value,
            Some(Arg::Uint16(value)) => u32::from(*value),
            _ => 0,
        }
    }

    pub fn path(&self) -> &str {
        self.str_value(HeaderFieldId::Path)
    }

    pub fn interface(&self) -> &str {
        self.str_value(HeaderFieldId::Interface)
    }

    pub fn member(&self) -> &str {
        self.str_value(HeaderFieldId::Member)
    }

    pub fn error_name(&self) -> &str {
        self.str_value(HeaderFieldId::ErrorName)
    }

    pub fn destination(&self) -> &str {
        self.str_value(HeaderFieldId::Destination)
    }

    pub fn sender(&self) -> &str {
        self.str_value(HeaderFieldId::Sender)
    }

    pub fn signature(&self) -> &str {
        self.str_value(HeaderFieldId::Signature)
    }

    pub fn reply_serial(&self) -> u32 {
        self.u32_value(HeaderFieldId::ReplySerial)
    }

    pub fn handles(&self) -> u32 {
        self.u32_value(HeaderFieldId::Handles)
    }

    pub fn timestamp(&self) -> u32 {
        self.u32_value(HeaderFieldId::Timestamp)
    }

    pub fn time_to_live(&self) -> u16 {
        match self.get(HeaderFieldId::TimeToLive) {
            Some(Arg::Uint16(value)) => *value,
            _ => 0,
        }
    }

    pub fn compression_token(&self) -> u32 {
        self.u32_value(HeaderFieldId::CompressionToken)
    }

    pub fn session_id(&self) -> u32 {
        self.u32_value(HeaderFieldId::SessionId)
    }
}
