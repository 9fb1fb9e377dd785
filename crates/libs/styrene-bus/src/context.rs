use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::CodecConfig;
use crate::crypt::BodyCipher;
use crate::error::BusError;
use crate::header::MessageFlags;
use crate::io::{MessageReader, MessageWriter};
use crate::message::{Message, MessageBuilder};

/// Per-endpoint state shared by everything one bus participant sends:
/// its unique name, the serial counter, codec settings and body cipher.
pub struct BusContext {
    unique_name: String,
    next_serial: AtomicU32,
    config: CodecConfig,
    cipher: Option<Arc<dyn BodyCipher>>,
}

impl BusContext {
    pub fn new(unique_name: &str, config: CodecConfig) -> Self {
        Self {
            unique_name: unique_name.to_owned(),
            next_serial: AtomicU32::new(1),
            config,
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn BodyCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn cipher(&self) -> Option<&Arc<dyn BodyCipher>> {
        self.cipher.as_ref()
    }

    pub fn fallback_auth_version(&self) -> u32 {
        self.config.fallback_auth_version
    }

    /// Next outbound serial. Wraps around, never yields 0.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    pub fn method_call<'a>(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> MessageBuilder<'a> {
        MessageBuilder::method_call(destination, path, interface, member)
    }

    pub fn signal<'a>(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> MessageBuilder<'a> {
        MessageBuilder::signal(destination, path, interface, member)
    }

    pub fn reply<'a>(&self, call: &Message) -> MessageBuilder<'a> {
        MessageBuilder::method_return(call)
    }

    pub fn error<'a>(&self, call: &Message, error_name: &str, description: &str) -> MessageBuilder<'a> {
        MessageBuilder::error(call, error_name, description)
    }

    /// Stamps serial, sender and outbound byte order, then builds. A builder
    /// that already carries a serial or sender keeps it.
    pub fn compose(&self, builder: MessageBuilder<'_>) -> Result<Message, BusError> {
        if builder.current_flags().contains(MessageFlags::ENCRYPTED)
            && self.cipher.is_none()
        {
            return Err(BusError::NotAuthorized(format!(
                "\"{}\" has no body cipher",
                self.unique_name
            )));
        }
        let mut builder = builder.endianness(self.config.endianness());
        if builder.current_serial() == 0 {
            builder = builder.serial(self.next_serial());
        }
        if builder.current_sender().is_empty() {
            builder = builder.sender(&self.unique_name);
        }
        builder.build()
    }

    pub fn reader(&self) -> MessageReader {
        MessageReader::new(&self.config)
    }

    /// Reader that verifies senders against the remote `endpoint` name.
    pub fn reader_for_endpoint(&self, endpoint: &str) -> MessageReader {
        MessageReader::for_endpoint(&self.config, endpoint)
    }

    pub fn writer(&self, message: Message) -> MessageWriter {
        let writer = MessageWriter::new(message);
        match &self.cipher {
            Some(cipher) => writer.with_cipher(Arc::clone(cipher), self.config.fallback_auth_version),
            None => writer,
        }
    }
}
