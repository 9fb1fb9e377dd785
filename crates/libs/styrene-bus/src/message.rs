use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::arg::{Arg, MAX_ARRAY_LEN};
use crate::buffer::{outbound_endianness, padding_for, Endianness, WireWriter};
use crate::checks::{check_flags, check_sender, HeaderChecks};
use crate::crypt::{BodyCipher, CipherContext};
use crate::error::BusError;
use crate::header::{
    HeaderFieldId, HeaderFields, MessageFlags, MessageHeader, MessageType, MAJOR_PROTOCOL_VERSION,
    MAX_HEADER_LEN,
};
use crate::marshal::{marshal_args, marshal_header_fields};
use crate::names::is_legal_object_path;
use crate::unmarshal::{parse_header_fields, unmarshal_args};

/// Largest complete wire image, fixed header through body.
pub const MAX_PACKET_LEN: usize = MAX_ARRAY_LEN + 4096;

/// Milliseconds since the Unix epoch, truncated to the 32-bit timestamp field.
pub fn timestamp_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u32)
        .unwrap_or(0)
}

/// Offset of the body and total wire length implied by a fixed header.
pub(crate) fn frame_lengths(header: &MessageHeader) -> Result<(usize, usize), BusError> {
    let header_len = header.header_len as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(BusError::BadHeaderLength(format!(
            "{header_len} bytes, limit {MAX_HEADER_LEN}"
        )));
    }
    let body_len = header.body_len as usize;
    if body_len > MAX_PACKET_LEN {
        return Err(BusError::BadBodyLen(format!("{body_len} bytes, limit {MAX_PACKET_LEN}")));
    }
    let body_offset = MessageHeader::SIZE + header_len + padding_for(header_len, 8);
    let total = body_offset + body_len;
    if total > MAX_PACKET_LEN {
        return Err(BusError::BadBodyLen(format!(
            "{total}-byte message, limit {MAX_PACKET_LEN}"
        )));
    }
    Ok((body_offset, total))
}

/// Header bytes bound to an encrypted body. Sender and other header fields
/// are excluded so a router may re-marshal them.
fn associated_data(header: &MessageHeader) -> [u8; 11] {
    let mut out = [0u8; 11];
    out[0] = header.msg_type as u8;
    out[1] = header.flags.bits();
    out[2] = header.major_version;
    out[3..7].copy_from_slice(&header.serial.to_be_bytes());
    out[7..11].copy_from_slice(&header.body_len.to_be_bytes());
    out
}

/// One bus message: decoded header, header fields and the wire image
/// they were read from or marshaled into.
#[derive(Clone, PartialEq)]
pub struct Message {
    header: MessageHeader,
    fields: HeaderFields,
    wire: Vec<u8>,
    body_offset: usize,
    body_encrypted: bool,
    endpoint: Option<String>,
}

impl Message {
    /// Marshals `fields` and joins them with an already-marshaled body.
    fn assemble(
        mut header: MessageHeader,
        fields: HeaderFields,
        body: &[u8],
        body_encrypted: bool,
        endpoint: Option<String>,
    ) -> Result<Self, BusError> {
        let field_bytes = marshal_header_fields(&fields, header.endianness)?;
        if field_bytes.len() > MAX_HEADER_LEN {
            return Err(BusError::MessageTooLarge(field_bytes.len()));
        }
        let body_offset =
            MessageHeader::SIZE + field_bytes.len() + padding_for(field_bytes.len(), 8);
        let total = body_offset + body.len();
        if total > MAX_PACKET_LEN {
            return Err(BusError::MessageTooLarge(total));
        }
        header.header_len = field_bytes.len() as u32;
        header.body_len = body.len() as u32;

        let mut writer = WireWriter::with_capacity(header.endianness, total);
        header.write(&mut writer);
        writer.write(&field_bytes);
        writer.write_padded(8, body);

        Ok(Self {
            header,
            fields,
            wire: writer.into_inner(),
            body_offset,
            body_encrypted,
            endpoint,
        })
    }

    /// Builds a message from a fully buffered wire image whose header and
    /// fields have already been decoded and checked.
    pub(crate) fn from_decoded(
        header: MessageHeader,
        fields: HeaderFields,
        wire: Vec<u8>,
        body_offset: usize,
        endpoint: Option<String>,
    ) -> Self {
        let body_encrypted = header.flags.contains(MessageFlags::ENCRYPTED);
        Self { header, fields, wire, body_offset, body_encrypted, endpoint }
    }

    /// Decodes and checks the header fields of a buffered message.
    pub(crate) fn decode_fields(
        header: &MessageHeader,
        block: &[u8],
        checks: &HeaderChecks,
    ) -> Result<HeaderFields, BusError> {
        let fields = parse_header_fields(block, header.endianness)?;
        checks.check(header, &fields)?;
        Ok(fields)
    }

    /// Decodes a complete wire image. Trailing or missing bytes are errors.
    pub fn from_wire(wire: Vec<u8>, checks: &HeaderChecks) -> Result<Self, BusError> {
        let header = MessageHeader::parse(&wire)?;
        let (body_offset, total) = frame_lengths(&header)?;
        if wire.len() < total {
            return Err(BusError::EndOfData);
        }
        if wire.len() > total {
            return Err(BusError::BadBodyLen(format!(
                "{} bytes after a {total}-byte message",
                wire.len() - total
            )));
        }
        let block = &wire[MessageHeader::SIZE..MessageHeader::SIZE + header.header_len as usize];
        let fields = Self::decode_fields(&header, block, checks)?;
        Ok(Self::from_decoded(header, fields, wire, body_offset, None))
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn message_type(&self) -> MessageType {
        self.header.msg_type
    }

    pub fn flags(&self) -> MessageFlags {
        self.header.flags
    }

    pub fn serial(&self) -> u32 {
        self.header.serial
    }

    pub fn endianness(&self) -> Endianness {
        self.header.endianness
    }

    pub fn body_len(&self) -> u32 {
        self.header.body_len
    }

    pub fn path(&self) -> &str {
        self.fields.path()
    }

    pub fn interface(&self) -> &str {
        self.fields.interface()
    }

    pub fn member(&self) -> &str {
        self.fields.member()
    }

    pub fn error_name(&self) -> &str {
        self.fields.error_name()
    }

    pub fn destination(&self) -> &str {
        self.fields.destination()
    }

    pub fn sender(&self) -> &str {
        self.fields.sender()
    }

    pub fn signature(&self) -> &str {
        self.fields.signature()
    }

    pub fn reply_serial(&self) -> u32 {
        self.fields.reply_serial()
    }

    pub fn session_id(&self) -> u32 {
        self.fields.session_id()
    }

    pub fn time_to_live(&self) -> u16 {
        self.fields.time_to_live()
    }

    pub fn timestamp(&self) -> u32 {
        self.fields.timestamp()
    }

    pub fn handles(&self) -> u32 {
        self.fields.handles()
    }

    /// Legacy compression token, reported as received.
    pub fn compression_token(&self) -> u32 {
        self.fields.compression_token()
    }

    /// Name of the endpoint the message arrived on, if it was received.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.flags.contains(MessageFlags::ENCRYPTED)
    }

    /// `true` while the body still holds ciphertext.
    pub fn is_body_encrypted(&self) -> bool {
        self.body_encrypted
    }

    pub fn is_broadcast_signal(&self) -> bool {
        self.header.msg_type == MessageType::Signal && self.destination().is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.wire
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.wire
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.wire[self.body_offset..]
    }

    /// `true` once `now` (see [`timestamp_millis`]) is past the time-to-live.
    /// Sessionless messages count their TTL in seconds, others in milliseconds.
    pub fn is_expired_at(&self, now: u32) -> bool {
        let ttl = u32::from(self.time_to_live());
        if ttl == 0 {
            return false;
        }
        let ttl_ms = if self.flags().contains(MessageFlags::SESSIONLESS) {
            ttl.saturating_mul(1000)
        } else {
            ttl
        };
        now.wrapping_sub(self.timestamp()) > ttl_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(timestamp_millis())
    }

    /// Decodes the body. Values borrow from this message.
    pub fn args(&self) -> Result<Vec<Arg<'_>>, BusError> {
        if self.body_encrypted {
            return Err(BusError::EncryptedBody);
        }
        unmarshal_args(self.body_bytes(), self.signature(), self.endianness(), self.handles())
    }

    /// Decrypts if needed, then decodes the body. With `expected` set, the
    /// declared signature must match it exactly.
    pub fn unmarshal_args(
        &mut self,
        cipher: Option<&dyn BodyCipher>,
        expected: Option<&str>,
    ) -> Result<Vec<Arg<'_>>, BusError> {
        if let Some(expected) = expected {
            if expected != self.signature() {
                return Err(BusError::mismatch(expected, self.signature()));
            }
        }
        if self.body_encrypted {
            let cipher = cipher.ok_or_else(|| {
                BusError::NotAuthorized(format!("no cipher for body from \"{}\"", self.sender()))
            })?;
            self.decrypt_body(cipher)?;
        }
        self.args()
    }

    /// Replaces an encrypted body with its plaintext.
    pub fn decrypt_body(&mut self, cipher: &dyn BodyCipher) -> Result<(), BusError> {
        if !self.body_encrypted {
            return Ok(());
        }
        let aad = associated_data(&self.header);
        let ctx = CipherContext {
            peer: self.fields.sender(),
            msg_type: self.header.msg_type,
            broadcast: self.is_broadcast_signal(),
            auth_version: None,
            associated_data: &aad,
        };
        let plaintext = cipher.decrypt(&ctx, self.body_bytes())?;
        self.replace_body(plaintext, false);
        debug!("message: decrypted body of serial {}", self.header.serial);
        Ok(())
    }

    /// Encrypts the plaintext body of a message flagged `ENCRYPTED`.
    /// Leaves the message untouched on failure so the caller may retry.
    pub fn encrypt_body(
        &mut self,
        cipher: &dyn BodyCipher,
        fallback_auth_version: u32,
    ) -> Result<(), BusError> {
        if self.body_encrypted || !self.is_encrypted() {
            return Ok(());
        }
        let sealed_len = self.body_bytes().len() + cipher.overhead();
        if self.body_offset + sealed_len > MAX_PACKET_LEN {
            return Err(BusError::MessageTooLarge(self.body_offset + sealed_len));
        }
        let mut sealed_header = self.header;
        sealed_header.body_len = sealed_len as u32;
        let aad = associated_data(&sealed_header);
        let broadcast = self.is_broadcast_signal();
        let ctx = CipherContext {
            peer: self.fields.destination(),
            msg_type: self.header.msg_type,
            broadcast,
            auth_version: broadcast.then_some(fallback_auth_version),
            associated_data: &aad,
        };
        let sealed = cipher.encrypt(&ctx, self.body_bytes())?;
        if sealed.len() != sealed_len {
            return Err(BusError::bad_value(format!(
                "cipher produced {} bytes, expected {sealed_len}",
                sealed.len()
            )));
        }
        self.replace_body(sealed, true);
        Ok(())
    }

    fn replace_body(&mut self, body: Vec<u8>, encrypted: bool) {
        self.wire.truncate(self.body_offset);
        self.header.body_len = body.len() as u32;
        self.wire.extend_from_slice(&body);
        self.wire[..MessageHeader::SIZE].copy_from_slice(&self.header.to_bytes());
        self.body_encrypted = encrypted;
    }

    /// Returns a new wire image with the sender field replaced. The body is
    /// carried over byte for byte, encrypted or not.
    pub fn with_sender(&self, sender: &str) -> Result<Message, BusError> {
        let mut fields = self.fields.clone();
        fields.set(HeaderFieldId::Sender, Arg::String(Cow::Owned(sender.to_owned())))?;
        Self::assemble(
            self.header,
            fields,
            self.body_bytes(),
            self.body_encrypted,
            self.endpoint.clone(),
        )
    }

    /// Applies the anti-spoofing rule for a message that arrived on
    /// `endpoint`: a claimed sender must match, an absent one is filled in.
    pub fn verify_sender(self, endpoint: &str) -> Result<Message, BusError> {
        check_sender(&self.fields, endpoint)?;
        if self.sender().is_empty() {
            return self.with_sender(endpoint);
        }
        Ok(self)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.header.msg_type)
            .field("serial", &self.header.serial)
            .field("flags", &self.header.flags)
            .field("sender", &self.sender())
            .field("destination", &self.destination())
            .field("path", &self.path())
            .field("interface", &self.interface())
            .field("member", &self.member())
            .field("signature", &self.signature())
            .field("body_len", &self.header.body_len)
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} serial={} flags={} sender=\"{}\" dest=\"{}\"",
            self.header.msg_type,
            self.header.serial,
            self.header.flags,
            self.sender(),
            self.destination()
        )?;
        match self.header.msg_type {
            MessageType::Error => write!(f, " error=\"{}\"", self.error_name())?,
            MessageType::MethodReturn => write!(f, " reply_serial={}", self.reply_serial())?,
            _ => write!(f, " {}.{} {}", self.interface(), self.member(), self.path())?,
        }
        write!(f, " sig=\"{}\"", self.signature())
    }
}

/// Composes outbound messages. Header strings are copied in; arguments may
/// borrow until [`MessageBuilder::build`] marshals them into the new
/// [`Message`], which owns all of its bytes.
#[derive(Debug, Clone)]
pub struct MessageBuilder<'a> {
    msg_type: MessageType,
    flags: MessageFlags,
    serial: u32,
    destination: String,
    sender: String,
    path: String,
    interface: String,
    member: String,
    error_name: String,
    reply_serial: u32,
    session_id: u32,
    time_to_live: u16,
    handles: u32,
    signature: String,
    args: Vec<Arg<'a>>,
    endianness: Option<Endianness>,
}

impl<'a> MessageBuilder<'a> {
    fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            flags: MessageFlags::empty(),
            serial: 0,
            destination: String::new(),
            sender: String::new(),
            path: String::new(),
            interface: String::new(),
            member: String::new(),
            error_name: String::new(),
            reply_serial: 0,
            session_id: 0,
            time_to_live: 0,
            handles: 0,
            signature: String::new(),
            args: Vec::new(),
            endianness: None,
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        let mut builder = Self::new(MessageType::MethodCall);
        builder.destination = destination.to_owned();
        builder.path = path.to_owned();
        builder.interface = interface.to_owned();
        builder.member = member.to_owned();
        builder
    }

    /// An empty `destination` broadcasts the signal.
    pub fn signal(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        let mut builder = Self::new(MessageType::Signal);
        builder.destination = destination.to_owned();
        builder.path = path.to_owned();
        builder.interface = interface.to_owned();
        builder.member = member.to_owned();
        builder
    }

    /// Reply to `call`, addressed to its sender and encrypted if it was.
    pub fn method_return(call: &Message) -> Self {
        let mut builder = Self::new(MessageType::MethodReturn);
        builder.reply_to(call);
        builder
    }

    /// Error reply to `call`. A non-empty `description` becomes the single
    /// string argument.
    pub fn error(call: &Message, error_name: &str, description: &str) -> Self {
        let mut builder = Self::new(MessageType::Error);
        builder.reply_to(call);
        builder.error_name = error_name.to_owned();
        if !description.is_empty() {
            builder.signature = "s".to_owned();
            builder.args = vec![Arg::String(Cow::Owned(description.to_owned()))];
        }
        builder
    }

    fn reply_to(&mut self, call: &Message) {
        self.destination = call.sender().to_owned();
        self.reply_serial = call.serial();
        self.session_id = call.session_id();
        if call.is_encrypted() {
            self.flags = MessageFlags::ENCRYPTED;
        }
    }

    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = sender.to_owned();
        self
    }

    pub fn session_id(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    /// Milliseconds, or seconds for sessionless messages. Zero means none.
    pub fn time_to_live(mut self, ttl: u16) -> Self {
        self.time_to_live = ttl;
        self
    }

    /// Number of out-of-band handles the body may index.
    pub fn handles(mut self, count: u32) -> Self {
        self.handles = count;
        self
    }

    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = Some(endianness);
        self
    }

    pub fn args(mut self, signature: &str, args: Vec<Arg<'a>>) -> Self {
        self.signature = signature.to_owned();
        self.args = args;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn current_flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn current_serial(&self) -> u32 {
        self.serial
    }

    pub fn current_sender(&self) -> &str {
        &self.sender
    }

    fn set_text(
        fields: &mut HeaderFields,
        id: HeaderFieldId,
        value: &str,
    ) -> Result<(), BusError> {
        if value.is_empty() {
            return Ok(());
        }
        let value = Cow::Owned(value.to_owned());
        let arg = match id {
            HeaderFieldId::Path => Arg::ObjectPath(value),
            HeaderFieldId::Signature => Arg::Signature(value),
            _ => Arg::String(value),
        };
        fields.set(id, arg)
    }

    /// Validates and marshals. On failure nothing is produced.
    pub fn build(self) -> Result<Message, BusError> {
        check_flags(self.msg_type, self.flags)?;
        match self.msg_type {
            MessageType::MethodCall | MessageType::Signal => {
                if !is_legal_object_path(&self.path) {
                    return Err(BusError::bad_value(format!(
                        "\"{}\" is not a legal object path",
                        self.path
                    )));
                }
                if self.msg_type == MessageType::MethodCall && self.destination.is_empty() {
                    return Err(BusError::bad_value("method call requires a destination"));
                }
            }
            MessageType::Error => {
                if self.error_name.is_empty() {
                    return Err(BusError::bad_value("error requires an error name"));
                }
            }
            MessageType::MethodReturn | MessageType::Invalid => {}
        }

        let mut fields = HeaderFields::new();
        Self::set_text(&mut fields, HeaderFieldId::Path, &self.path)?;
        Self::set_text(&mut fields, HeaderFieldId::Interface, &self.interface)?;
        Self::set_text(&mut fields, HeaderFieldId::Member, &self.member)?;
        Self::set_text(&mut fields, HeaderFieldId::Destination, &self.destination)?;
        Self::set_text(&mut fields, HeaderFieldId::Sender, &self.sender)?;
        Self::set_text(&mut fields, HeaderFieldId::Signature, &self.signature)?;
        if self.msg_type == MessageType::Error {
            Self::set_text(&mut fields, HeaderFieldId::ErrorName, &self.error_name)?;
        }
        if matches!(self.msg_type, MessageType::MethodReturn | MessageType::Error) {
            fields.set(HeaderFieldId::ReplySerial, Arg::Uint32(self.reply_serial))?;
        }
        if self.time_to_live != 0 {
            fields.set(HeaderFieldId::TimeToLive, Arg::Uint16(self.time_to_live))?;
            fields.set(HeaderFieldId::Timestamp, Arg::Uint32(timestamp_millis()))?;
        }
        if self.session_id != 0 {
            fields.set(HeaderFieldId::SessionId, Arg::Uint32(self.session_id))?;
        }
        if self.handles != 0 {
            fields.set(HeaderFieldId::Handles, Arg::Uint32(self.handles))?;
        }

        let endianness = self.endianness.unwrap_or_else(outbound_endianness);
        let header = MessageHeader {
            endianness,
            msg_type: self.msg_type,
            flags: self.flags,
            major_version: MAJOR_PROTOCOL_VERSION,
            body_len: 0,
            serial: self.serial,
            header_len: 0,
        };
        HeaderChecks::new(true).check(&header, &fields)?;

        let mut body = WireWriter::new(endianness);
        marshal_args(&mut body, &self.signature, &self.args, self.handles)?;
        let message = Message::assemble(header, fields, body.as_slice(), false, None)?;
        debug!("message: built {message}");
        Ok(message)
    }
}
