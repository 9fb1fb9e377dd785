//! Resumable message reading and writing.
//!
//! A [`MessageReader`] collects bytes across any number of partial reads:
//!
//! ```text
//!   New ──16 bytes──▶ HeaderFields ──fields+pad──▶ HeaderBody ──body──▶ Complete
//! ```
//!
//! The fixed header is decoded and size-checked on leaving `New`, header
//! fields are decoded and checked on leaving `HeaderFields`. Body arguments
//! are left for [`Message::args`]. Decode failures reset the reader.

use std::io::{self, Read, Write};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::checks::HeaderChecks;
use crate::config::CodecConfig;
use crate::crypt::BodyCipher;
use crate::error::BusError;
use crate::header::{HeaderFields, MessageHeader};
use crate::message::{frame_lengths, Message};

/// Non-blocking byte source. `pull` returns `Err(EndOfData)` when nothing is
/// available yet and `Ok(0)` when the peer has closed.
pub trait Source {
    fn pull(&mut self, buf: &mut [u8]) -> Result<usize, BusError>;

    /// Blocks until data may be available or `timeout` passes.
    fn wait(&mut self, timeout: Duration) -> Result<(), BusError> {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(())
    }
}

/// Non-blocking byte sink. `push` returns `Err(EndOfData)` when it cannot
/// accept bytes yet.
pub trait Sink {
    fn push(&mut self, buf: &[u8]) -> Result<usize, BusError>;

    fn wait(&mut self, timeout: Duration) -> Result<(), BusError> {
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(())
    }
}

fn map_io_error(err: io::Error) -> BusError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => BusError::EndOfData,
        io::ErrorKind::TimedOut => BusError::Timeout,
        _ => BusError::Io(err),
    }
}

/// [`Source`] over any `std::io::Read`.
pub struct IoSource<R>(pub R);

impl<R: Read> Source for IoSource<R> {
    fn pull(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
        self.0.read(buf).map_err(map_io_error)
    }
}

/// [`Sink`] over any `std::io::Write`.
pub struct IoSink<W>(pub W);

impl<W: Write> Sink for IoSink<W> {
    fn push(&mut self, buf: &[u8]) -> Result<usize, BusError> {
        self.0.write(buf).map_err(map_io_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    New,
    HeaderFields,
    HeaderBody,
    Complete,
}

enum ReadStage {
    New,
    HeaderFields { header: MessageHeader, body_offset: usize, total: usize },
    HeaderBody { header: MessageHeader, fields: HeaderFields, body_offset: usize },
    Complete(Message),
}

pub struct MessageReader {
    stage: ReadStage,
    buffer: Vec<u8>,
    needed: usize,
    checks: HeaderChecks,
    config: CodecConfig,
    endpoint: Option<String>,
}

impl MessageReader {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            stage: ReadStage::New,
            buffer: Vec::with_capacity(MessageHeader::SIZE),
            needed: MessageHeader::SIZE,
            checks: HeaderChecks::new(config.pedantic),
            config: config.clone(),
            endpoint: None,
        }
    }

    /// Reader for messages arriving on a named endpoint. With
    /// `check_sender` enabled, every message's sender is verified against it.
    pub fn for_endpoint(config: &CodecConfig, endpoint: &str) -> Self {
        let mut reader = Self::new(config);
        reader.endpoint = Some(endpoint.to_owned());
        reader
    }

    pub fn state(&self) -> ReadState {
        match self.stage {
            ReadStage::New => ReadState::New,
            ReadStage::HeaderFields { .. } => ReadState::HeaderFields,
            ReadStage::HeaderBody { .. } => ReadState::HeaderBody,
            ReadStage::Complete(_) => ReadState::Complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stage, ReadStage::Complete(_))
    }

    /// Bytes still required before the current stage can advance.
    pub fn remaining(&self) -> usize {
        if self.is_complete() {
            0
        } else {
            self.needed - self.buffer.len()
        }
    }

    /// Bytes of the current message held so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Per-pull timeout for the outstanding bytes.
    pub fn pull_timeout(&self) -> Duration {
        self.config.pull_timeout(self.remaining())
    }

    /// Discards any partial message.
    pub fn reset(&mut self) {
        self.stage = ReadStage::New;
        self.buffer = Vec::with_capacity(MessageHeader::SIZE);
        self.needed = MessageHeader::SIZE;
    }

    /// Hands out the completed message and rearms the reader.
    pub fn take(&mut self) -> Option<Message> {
        match mem::replace(&mut self.stage, ReadStage::New) {
            ReadStage::Complete(message) => {
                self.reset();
                Some(message)
            }
            other => {
                self.stage = other;
                None
            }
        }
    }

    /// Consumes bytes up to the end of the current message. Returns how many
    /// were used once the message is complete, or `EndOfData` after using
    /// all of `input` without completing it.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize, BusError> {
        let mut consumed = 0;
        loop {
            if self.is_complete() {
                return Ok(consumed);
            }
            let take = (self.needed - self.buffer.len()).min(input.len() - consumed);
            self.buffer.extend_from_slice(&input[consumed..consumed + take]);
            consumed += take;
            if self.buffer.len() < self.needed {
                return Err(BusError::EndOfData);
            }
            self.step()?;
        }
    }

    /// Reads from a non-blocking source until the message completes
    /// (`Ok`) or the source has nothing more (`EndOfData`).
    pub fn pull<S: Source + ?Sized>(&mut self, source: &mut S) -> Result<(), BusError> {
        loop {
            if self.is_complete() {
                return Ok(());
            }
            let want = self.remaining().min(self.config.max_pull.max(1));
            if want > 0 {
                let start = self.buffer.len();
                self.buffer.resize(start + want, 0);
                let pulled = source.pull(&mut self.buffer[start..]);
                let n = match pulled {
                    Ok(n) => n,
                    Err(err) => {
                        self.buffer.truncate(start);
                        return Err(err);
                    }
                };
                self.buffer.truncate(start + n);
                if n == 0 {
                    return Err(BusError::ConnectionClosed);
                }
                trace!("reader: pulled {n} bytes, {} outstanding", self.remaining());
            }
            if self.buffer.len() == self.needed {
                self.step()?;
            }
        }
    }

    /// Pulls until a message completes. Fails with `Timeout` when `timeout`
    /// elapses, or when a partly read message stalls for longer than the
    /// per-pull timeout.
    pub fn read_blocking<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut last_progress = Instant::now();
        loop {
            let before = (self.state(), self.buffered());
            match self.pull(source) {
                Ok(()) => return self.take().ok_or(BusError::EndOfData),
                Err(BusError::EndOfData) => {}
                Err(err) => return Err(err),
            }
            let now = Instant::now();
            if (self.state(), self.buffered()) != before {
                last_progress = now;
            }

            let mut wait = Duration::from_millis(self.config.pull_timeout_base_ms);
            if self.buffered() > 0 {
                let stalled = now.saturating_duration_since(last_progress);
                wait = self.pull_timeout().saturating_sub(stalled);
                if wait.is_zero() {
                    warn!("reader: partial message stalled with {} bytes", self.buffered());
                    return Err(BusError::Timeout);
                }
            }
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(now);
                if left.is_zero() {
                    return Err(BusError::Timeout);
                }
                wait = wait.min(left);
            }
            source.wait(wait)?;
        }
    }

    fn step(&mut self) -> Result<(), BusError> {
        let result = self.advance();
        if let Err(err) = &result {
            warn!("reader: discarding message: {err}");
            self.reset();
        }
        result
    }

    fn advance(&mut self) -> Result<(), BusError> {
        self.stage = match mem::replace(&mut self.stage, ReadStage::New) {
            ReadStage::New => {
                let header = MessageHeader::parse(&self.buffer)?;
                let (body_offset, total) = frame_lengths(&header)?;
                trace!(
                    "reader: {} serial={} header_len={} body_len={}",
                    header.msg_type,
                    header.serial,
                    header.header_len,
                    header.body_len
                );
                self.needed = body_offset;
                ReadStage::HeaderFields { header, body_offset, total }
            }
            ReadStage::HeaderFields { header, body_offset, total } => {
                let end = MessageHeader::SIZE + header.header_len as usize;
                let block = &self.buffer[MessageHeader::SIZE..end];
                let fields = Message::decode_fields(&header, block, &self.checks)?;
                self.needed = total;
                ReadStage::HeaderBody { header, fields, body_offset }
            }
            ReadStage::HeaderBody { header, fields, body_offset } => {
                let wire = mem::take(&mut self.buffer);
                let mut message =
                    Message::from_decoded(header, fields, wire, body_offset, self.endpoint.clone());
                if self.config.check_sender {
                    if let Some(endpoint) = &self.endpoint {
                        message = message.verify_sender(endpoint)?;
                    }
                }
                if self.config.reject_expired && message.is_expired() {
                    return Err(BusError::TimeToLiveExpired);
                }
                ReadStage::Complete(message)
            }
            complete @ ReadStage::Complete(_) => complete,
        };
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    New,
    Writing,
    Complete,
}

/// Writes one message, encrypting its body first when flagged.
pub struct MessageWriter {
    state: WriteState,
    message: Message,
    written: usize,
    cipher: Option<Arc<dyn BodyCipher>>,
    fallback_auth_version: u32,
}

impl MessageWriter {
    pub fn new(message: Message) -> Self {
        Self { state: WriteState::New, message, written: 0, cipher: None, fallback_auth_version: 0 }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn BodyCipher>, fallback_auth_version: u32) -> Self {
        self.cipher = Some(cipher);
        self.fallback_auth_version = fallback_auth_version;
        self
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Runs the `New` step. `AuthenticationPending` leaves the writer in
    /// `New` so the caller can retry once key agreement finishes.
    fn prepare(&mut self) -> Result<(), BusError> {
        if self.state != WriteState::New {
            return Ok(());
        }
        if self.message.is_encrypted() && !self.message.is_body_encrypted() {
            let cipher = self.cipher.as_deref().ok_or_else(|| {
                BusError::NotAuthorized(format!(
                    "no cipher to encrypt for \"{}\"",
                    self.message.destination()
                ))
            })?;
            self.message.encrypt_body(cipher, self.fallback_auth_version)?;
        }
        self.state = WriteState::Writing;
        Ok(())
    }

    /// Bytes not yet written, after encryption.
    pub fn pending_bytes(&mut self) -> Result<&[u8], BusError> {
        self.prepare()?;
        Ok(&self.message.as_bytes()[self.written..])
    }

    fn advance(&mut self, n: usize) {
        self.written += n;
        if self.written >= self.message.as_bytes().len() {
            self.state = WriteState::Complete;
        }
    }

    /// Pushes as much as the sink accepts. `Ok` once every byte is written.
    pub fn push<S: Sink + ?Sized>(&mut self, sink: &mut S) -> Result<(), BusError> {
        self.prepare()?;
        while self.state == WriteState::Writing {
            let n = sink.push(&self.message.as_bytes()[self.written..])?;
            if n == 0 {
                return Err(BusError::ConnectionClosed);
            }
            self.advance(n);
        }
        Ok(())
    }

    pub fn write_blocking<S: Sink + ?Sized>(
        &mut self,
        sink: &mut S,
        timeout: Option<Duration>,
    ) -> Result<(), BusError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            match self.push(sink) {
                Ok(()) => return Ok(()),
                Err(BusError::EndOfData) => {}
                Err(err) => return Err(err),
            }
            let mut wait = Duration::from_millis(1);
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(BusError::Timeout);
                }
                wait = wait.min(left);
            }
            sink.wait(wait)?;
        }
    }
}

/// Reads one message from a tokio stream. A partly read message that
/// stalls past the per-pull timeout fails with `Timeout`.
#[cfg(feature = "tokio")]
pub async fn read_message_async<R>(
    io: &mut R,
    reader: &mut MessageReader,
) -> Result<Message, BusError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut chunk = vec![0u8; reader.config.max_pull.max(1)];
    loop {
        if let Some(message) = reader.take() {
            return Ok(message);
        }
        let want = reader.remaining().min(chunk.len());
        if want == 0 {
            match reader.feed(&[]) {
                Ok(_) | Err(BusError::EndOfData) => continue,
                Err(err) => return Err(err),
            }
        }
        let n = if reader.buffered() > 0 {
            tokio::time::timeout(reader.pull_timeout(), io.read(&mut chunk[..want]))
                .await
                .map_err(|_| BusError::Timeout)??
        } else {
            io.read(&mut chunk[..want]).await?
        };
        if n == 0 {
            return Err(BusError::ConnectionClosed);
        }
        match reader.feed(&chunk[..n]) {
            Ok(_) | Err(BusError::EndOfData) => {}
            Err(err) => return Err(err),
        }
    }
}

/// Writes one message to a tokio stream, encrypting first when flagged.
#[cfg(feature = "tokio")]
pub async fn write_message_async<W>(io: &mut W, writer: &mut MessageWriter) -> Result<(), BusError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let pending = writer.pending_bytes()?;
    let len = pending.len();
    io.write_all(pending).await?;
    io.flush().await?;
    writer.advance(len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arg::Arg;
    use crate::buffer::Endianness;
    use crate::message::MessageBuilder;
    use std::collections::VecDeque;

    fn sample() -> Message {
        MessageBuilder::method_call("com.example.Foo", "/obj", "com.example.Iface", "Ping")
            .serial(11)
            .sender(":1.4")
            .endianness(Endianness::Little)
            .args("s", vec![Arg::string("hello").expect("arg")])
            .build()
            .expect("build")
    }

    /// Delivers queued chunks one per pull, then reports would-block.
    struct ChunkedSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Source for ChunkedSource {
        fn pull(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
            let Some(mut chunk) = self.chunks.pop_front() else {
                return Err(BusError::EndOfData);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    /// Accepts at most `limit` bytes per push.
    struct TrickleSink {
        out: Vec<u8>,
        limit: usize,
    }

    impl Sink for TrickleSink {
        fn push(&mut self, buf: &[u8]) -> Result<usize, BusError> {
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    #[test]
    fn feed_byte_by_byte() {
        let wire = sample().into_bytes();
        let mut reader = MessageReader::new(&CodecConfig::default());
        for (i, byte) in wire.iter().enumerate() {
            let result = reader.feed(std::slice::from_ref(byte));
            if i + 1 < wire.len() {
                assert!(matches!(result, Err(BusError::EndOfData)), "byte {i}");
            } else {
                assert_eq!(result.expect("complete"), 1);
            }
        }
        assert_eq!(reader.state(), ReadState::Complete);
        let message = reader.take().expect("message");
        assert_eq!(message.member(), "Ping");
        assert_eq!(reader.state(), ReadState::New);
    }

    #[test]
    fn feed_stops_at_message_boundary() {
        let mut stream = sample().into_bytes();
        let first_len = stream.len();
        stream.extend_from_slice(&sample().into_bytes());
        let mut reader = MessageReader::new(&CodecConfig::default());
        let used = reader.feed(&stream).expect("first");
        assert_eq!(used, first_len);
        reader.take().expect("first message");
        assert_eq!(reader.feed(&stream[used..]).expect("second"), first_len);
    }

    #[test]
    fn states_advance_in_order() {
        let wire = sample().into_bytes();
        let mut reader = MessageReader::new(&CodecConfig::default());
        assert_eq!(reader.state(), ReadState::New);
        assert!(reader.feed(&wire[..MessageHeader::SIZE]).is_err());
        assert_eq!(reader.state(), ReadState::HeaderFields);
        let header = MessageHeader::parse(&wire).expect("header");
        let (body_offset, _) = frame_lengths(&header).expect("lengths");
        assert!(reader.feed(&wire[MessageHeader::SIZE..body_offset]).is_err());
        assert_eq!(reader.state(), ReadState::HeaderBody);
        reader.feed(&wire[body_offset..]).expect("body");
        assert_eq!(reader.state(), ReadState::Complete);
    }

    #[test]
    fn pull_resumes_across_would_block() {
        let wire = sample().into_bytes();
        let mut source = ChunkedSource { chunks: VecDeque::from(vec![wire[..5].to_vec()]) };
        let mut reader = MessageReader::new(&CodecConfig::default());
        assert!(matches!(reader.pull(&mut source), Err(BusError::EndOfData)));
        source.chunks.push_back(wire[5..30].to_vec());
        source.chunks.push_back(wire[30..].to_vec());
        reader.pull(&mut source).expect("complete");
        assert_eq!(reader.take().expect("message").as_bytes(), wire.as_slice());
    }

    #[test]
    fn zero_max_pull_still_makes_progress() {
        let wire = sample().into_bytes();
        let config = CodecConfig { max_pull: 0, ..CodecConfig::default() };
        let mut source = ChunkedSource { chunks: VecDeque::from(vec![wire.clone()]) };
        let mut reader = MessageReader::new(&config);
        reader.pull(&mut source).expect("complete");
        assert_eq!(reader.take().expect("message").as_bytes(), wire.as_slice());

        let mut empty = ChunkedSource { chunks: VecDeque::new() };
        assert!(matches!(reader.pull(&mut empty), Err(BusError::EndOfData)));
    }

    #[test]
    fn closed_source_is_reported() {
        let mut source = IoSource(io::Cursor::new(Vec::new()));
        let mut reader = MessageReader::new(&CodecConfig::default());
        assert!(matches!(reader.pull(&mut source), Err(BusError::ConnectionClosed)));
    }

    #[test]
    fn blocking_read_times_out_on_stalled_source() {
        let wire = sample().into_bytes();
        let mut source = ChunkedSource { chunks: VecDeque::from(vec![wire[..8].to_vec()]) };
        let mut reader = MessageReader::new(&CodecConfig::default());
        let started = Instant::now();
        let result = reader.read_blocking(&mut source, Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(BusError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(reader.buffered(), 8);
    }

    #[test]
    fn per_pull_timeout_applies_to_partial_messages() {
        let wire = sample().into_bytes();
        let config = CodecConfig { pull_timeout_base_ms: 0, ..CodecConfig::default() };
        let mut source = ChunkedSource { chunks: VecDeque::from(vec![wire[..8].to_vec()]) };
        let mut reader = MessageReader::new(&config);
        // remaining/2 ms with nothing arriving
        let result = reader.read_blocking(&mut source, None);
        assert!(matches!(result, Err(BusError::Timeout)));
    }

    #[test]
    fn blocking_read_over_io_source() {
        let wire = sample().into_bytes();
        let mut source = IoSource(io::Cursor::new(wire.clone()));
        let mut reader = MessageReader::new(&CodecConfig::default());
        let message = reader.read_blocking(&mut source, None).expect("read");
        assert_eq!(message.as_bytes(), wire.as_slice());
    }

    #[test]
    fn malformed_header_resets_reader() {
        let mut wire = sample().into_bytes();
        wire[3] = 9;
        let mut reader = MessageReader::new(&CodecConfig::default());
        assert!(matches!(reader.feed(&wire), Err(BusError::BadHeaderField(_))));
        assert_eq!(reader.state(), ReadState::New);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn endpoint_reader_rejects_spoofed_sender() {
        let wire = sample().into_bytes();
        let mut reader = MessageReader::for_endpoint(&CodecConfig::default(), ":1.5");
        assert!(matches!(reader.feed(&wire), Err(BusError::BusNotAuthorized { .. })));

        let mut reader = MessageReader::for_endpoint(&CodecConfig::default(), ":1.4");
        reader.feed(&wire).expect("matching sender");
        assert_eq!(reader.take().expect("message").endpoint(), Some(":1.4"));
    }

    #[test]
    fn writer_trickles_through_sink() {
        let message = sample();
        let expected = message.as_bytes().to_vec();
        let mut writer = MessageWriter::new(message);
        let mut sink = TrickleSink { out: Vec::new(), limit: 7 };
        writer.push(&mut sink).expect("push");
        assert_eq!(writer.state(), WriteState::Complete);
        assert_eq!(sink.out, expected);
    }

    #[test]
    fn encrypted_message_without_cipher_not_authorized() {
        let message = MessageBuilder::method_call("com.example.Foo", "/obj", "", "Ping")
            .serial(1)
            .flags(crate::header::MessageFlags::ENCRYPTED)
            .build()
            .expect("build");
        let mut writer = MessageWriter::new(message);
        let mut sink = IoSink(Vec::new());
        assert!(matches!(writer.push(&mut sink), Err(BusError::NotAuthorized(_))));
        assert_eq!(writer.state(), WriteState::New);
    }
}
