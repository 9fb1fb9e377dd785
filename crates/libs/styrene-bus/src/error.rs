use std::io;

/// Errors produced while composing, parsing, reading or writing bus messages.
///
/// Variants fall into four groups, see the classifier methods:
/// malformed input, resource limits, continuation signals and trust failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BusError {
    #[error("end of data: more input required")]
    EndOfData,

    #[error("timed out waiting for message data")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("signature mismatch: expected \"{expected}\", found \"{found}\"")]
    SignatureMismatch { expected: String, found: String },

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("bad header field: {0}")]
    BadHeaderField(String),

    #[error("bad header length: {0}")]
    BadHeaderLength(String),

    #[error("bad body length: {0}")]
    BadBodyLen(String),

    #[error("bad array length: {0}")]
    BadArrayLength(String),

    #[error("string is not NUL terminated")]
    NotNulTerminated,

    #[error("handle index {index} out of range ({count} handles)")]
    NoSuchHandle { index: u32, count: u32 },

    #[error("required header field {0} is missing")]
    MissingHeaderField(&'static str),

    #[error("header flags 0x{flags:02x} not allowed on {kind}")]
    BadHeaderFlags { flags: u8, kind: &'static str },

    #[error("array too large: {0}")]
    ArrayTooLarge(usize),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("sender \"{claimed}\" does not match endpoint \"{observed}\"")]
    BusNotAuthorized { claimed: String, observed: String },

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("authentication pending with {0}")]
    AuthenticationPending(String),

    #[error("body decryption failed")]
    DecryptionFailed,

    #[error("message body is still encrypted")]
    EncryptedBody,

    #[error("message time-to-live expired")]
    TimeToLiveExpired,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BusError {
    /// `true` for "call again later" signals rather than failures.
    pub fn is_continuation(&self) -> bool {
        matches!(self, Self::EndOfData | Self::Timeout)
    }

    /// `true` when the peer sent bytes that violate the wire format.
    /// The message is discarded; the connection may continue.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedSignature(_)
                | Self::BadSignature(_)
                | Self::BadValue(_)
                | Self::BadHeaderField(_)
                | Self::BadHeaderLength(_)
                | Self::BadBodyLen(_)
                | Self::BadArrayLength(_)
                | Self::NotNulTerminated
                | Self::NoSuchHandle { .. }
                | Self::MissingHeaderField(_)
                | Self::BadHeaderFlags { .. }
        )
    }

    /// `true` for size ceilings that refused to build or accept a structure.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::MessageTooLarge(_) | Self::ArrayTooLarge(_))
    }

    /// `true` for sender spoofing and encryption-collaborator refusals.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::BusNotAuthorized { .. }
                | Self::NotAuthorized(_)
                | Self::AuthenticationPending(_)
                | Self::DecryptionFailed
        )
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::BadValue(message.into())
    }

    pub fn bad_signature(message: impl Into<String>) -> Self {
        Self::BadSignature(message.into())
    }

    pub fn malformed_signature(message: impl Into<String>) -> Self {
        Self::MalformedSignature(message.into())
    }

    pub fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::SignatureMismatch { expected: expected.into(), found: found.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_signals_are_not_malformed() {
        assert!(BusError::EndOfData.is_continuation());
        assert!(BusError::Timeout.is_continuation());
        assert!(!BusError::EndOfData.is_malformed());
        assert!(!BusError::Timeout.is_trust_failure());
    }

    #[test]
    fn classifies_each_group() {
        assert!(BusError::NotNulTerminated.is_malformed());
        assert!(BusError::BadArrayLength("x".into()).is_malformed());
        assert!(BusError::ArrayTooLarge(1).is_resource_limit());
        assert!(BusError::MessageTooLarge(1).is_resource_limit());
        assert!(BusError::DecryptionFailed.is_trust_failure());
        let spoof = BusError::BusNotAuthorized { claimed: ":a.1".into(), observed: ":b.2".into() };
        assert!(spoof.is_trust_failure());
        assert!(!spoof.is_malformed());
    }

    #[test]
    fn io_errors_convert() {
        let err: BusError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, BusError::Io(_)));
    }
}
