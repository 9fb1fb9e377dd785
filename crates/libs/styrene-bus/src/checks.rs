//! Structural validation of decoded and composed headers.

use log::warn;

use crate::error::BusError;
use crate::header::{HeaderFieldId, HeaderFields, MessageFlags, MessageHeader, MessageType};
use crate::marshal::MAX_ARGS;
use crate::names::{
    is_legal_bus_name, is_legal_error_name, is_legal_interface_name, is_legal_member_name,
    is_legal_object_path, MAX_NAME_LEN,
};
use crate::signature;

/// Flags a method call may carry.
pub const METHOD_CALL_FLAGS: MessageFlags = MessageFlags::NO_REPLY_EXPECTED
    .union(MessageFlags::AUTO_START)
    .union(MessageFlags::ENCRYPTED)
    .union(MessageFlags::COMPRESSED)
    .union(MessageFlags::SESSIONLESS);

/// Flags a signal may carry.
pub const SIGNAL_FLAGS: MessageFlags = MessageFlags::ENCRYPTED
    .union(MessageFlags::COMPRESSED)
    .union(MessageFlags::GLOBAL_BROADCAST)
    .union(MessageFlags::SESSIONLESS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderChecks {
    /// Enforce name grammars and string lengths on every present field.
    pub pedantic: bool,
}

impl Default for HeaderChecks {
    fn default() -> Self {
        Self { pedantic: true }
    }
}

impl HeaderChecks {
    pub const fn new(pedantic: bool) -> Self {
        Self { pedantic }
    }

    pub fn check(&self, header: &MessageHeader, fields: &HeaderFields) -> Result<(), BusError> {
        let result = self.check_required(header, fields).and_then(|()| {
            check_signature(fields)?;
            if self.pedantic {
                check_names(fields)?;
            }
            Ok(())
        });
        if let Err(err) = &result {
            warn!(
                "checks: rejecting {} serial={} from \"{}\": {}",
                header.msg_type,
                header.serial,
                fields.sender(),
                err
            );
        }
        result
    }

    fn check_required(&self, header: &MessageHeader, fields: &HeaderFields) -> Result<(), BusError> {
        let require = |id: HeaderFieldId| {
            if fields.contains(id) {
                Ok(())
            } else {
                Err(BusError::MissingHeaderField(id.name()))
            }
        };
        match header.msg_type {
            MessageType::Signal => {
                require(HeaderFieldId::Interface)?;
                require(HeaderFieldId::Path)?;
                require(HeaderFieldId::Member)?;
            }
            MessageType::MethodCall => {
                require(HeaderFieldId::Path)?;
                require(HeaderFieldId::Member)?;
                if header.serial == 0 {
                    return Err(BusError::BadHeaderField("method call with serial 0".into()));
                }
            }
            MessageType::Error => {
                require(HeaderFieldId::ErrorName)?;
                require(HeaderFieldId::ReplySerial)?;
                if fields.error_name().is_empty() {
                    return Err(BusError::BadHeaderField("empty error name".into()));
                }
                if fields.reply_serial() == 0 {
                    return Err(BusError::BadHeaderField("reply serial 0".into()));
                }
            }
            MessageType::MethodReturn => {
                require(HeaderFieldId::ReplySerial)?;
                if fields.reply_serial() == 0 {
                    return Err(BusError::BadHeaderField("reply serial 0".into()));
                }
            }
            MessageType::Invalid => {}
        }
        Ok(())
    }
}

fn check_signature(fields: &HeaderFields) -> Result<(), BusError> {
    let count = signature::count_complete_types(fields.signature())?;
    if count > MAX_ARGS {
        return Err(BusError::bad_signature(format!("{count} arguments, limit {MAX_ARGS}")));
    }
    Ok(())
}

fn check_names(fields: &HeaderFields) -> Result<(), BusError> {
    for (id, value) in fields.iter() {
        if let Some(text) = value.as_str() {
            if text.len() > MAX_NAME_LEN {
                return Err(BusError::BadHeaderField(format!(
                    "{} is {} bytes, limit {MAX_NAME_LEN}",
                    id.name(),
                    text.len()
                )));
            }
        }
    }
    let checked = [
        (HeaderFieldId::Path, is_legal_object_path as fn(&str) -> bool),
        (HeaderFieldId::Interface, is_legal_interface_name),
        (HeaderFieldId::Member, is_legal_member_name),
        (HeaderFieldId::ErrorName, is_legal_error_name),
        (HeaderFieldId::Sender, is_legal_bus_name),
        (HeaderFieldId::Destination, is_legal_bus_name),
    ];
    for (id, is_legal) in checked {
        if fields.contains(id) && !is_legal(fields.str_value(id)) {
            return Err(BusError::BadHeaderField(format!(
                "illegal {} \"{}\"",
                id.name(),
                fields.str_value(id)
            )));
        }
    }
    Ok(())
}

/// Rejects flag bits the message type may not carry.
pub fn check_flags(msg_type: MessageType, flags: MessageFlags) -> Result<(), BusError> {
    let allowed = match msg_type {
        MessageType::MethodCall => METHOD_CALL_FLAGS,
        MessageType::Signal => SIGNAL_FLAGS,
        MessageType::MethodReturn | MessageType::Error => MessageFlags::ENCRYPTED,
        MessageType::Invalid => MessageFlags::empty(),
    };
    if !allowed.contains(flags) {
        return Err(BusError::BadHeaderFlags { flags: flags.bits(), kind: msg_type.as_str() });
    }
    Ok(())
}

/// Compares a claimed sender against the name the transport observed.
/// An absent sender passes; the caller fills it in.
pub fn check_sender(fields: &HeaderFields, observed: &str) -> Result<(), BusError> {
    let claimed = fields.sender();
    if !claimed.is_empty() && claimed != observed {
        warn!("checks: sender \"{claimed}\" spoofed on endpoint \"{observed}\"");
        return Err(BusError::BusNotAuthorized {
            claimed: claimed.to_owned(),
            observed: observed.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arg::Arg;
    use crate::buffer::Endianness;
    use crate::header::MAJOR_PROTOCOL_VERSION;
    use std::borrow::Cow;

    fn header(msg_type: MessageType, serial: u32) -> MessageHeader {
        MessageHeader {
            endianness: Endianness::Little,
            msg_type,
            flags: MessageFlags::empty(),
            major_version: MAJOR_PROTOCOL_VERSION,
            body_len: 0,
            serial,
            header_len: 0,
        }
    }

    fn text(id: HeaderFieldId, value: &str, fields: &mut HeaderFields) {
        let arg = match id {
            HeaderFieldId::Path => Arg::ObjectPath(Cow::Owned(value.to_owned())),
            HeaderFieldId::Signature => Arg::Signature(Cow::Owned(value.to_owned())),
            _ => Arg::String(Cow::Owned(value.to_owned())),
        };
        fields.set(id, arg).expect("set");
    }

    #[test]
    fn method_call_requirements() {
        let checks = HeaderChecks::default();
        let mut fields = HeaderFields::new();
        text(HeaderFieldId::Path, "/obj", &mut fields);
        assert!(matches!(
            checks.check(&header(MessageType::MethodCall, 1), &fields),
            Err(BusError::MissingHeaderField("member"))
        ));
        text(HeaderFieldId::Member, "Ping", &mut fields);
        assert!(checks.check(&header(MessageType::MethodCall, 1), &fields).is_ok());
        assert!(checks.check(&header(MessageType::MethodCall, 0), &fields).is_err());
    }

    #[test]
    fn signal_requires_interface() {
        let mut fields = HeaderFields::new();
        text(HeaderFieldId::Path, "/obj", &mut fields);
        text(HeaderFieldId::Member, "Changed", &mut fields);
        let checks = HeaderChecks::default();
        assert!(matches!(
            checks.check(&header(MessageType::Signal, 1), &fields),
            Err(BusError::MissingHeaderField("interface"))
        ));
    }

    #[test]
    fn replies_need_nonzero_reply_serial() {
        let checks = HeaderChecks::default();
        let mut fields = HeaderFields::new();
        fields.set(HeaderFieldId::ReplySerial, Arg::Uint32(0)).expect("set");
        assert!(checks.check(&header(MessageType::MethodReturn, 2), &fields).is_err());
        fields.set(HeaderFieldId::ReplySerial, Arg::Uint32(7)).expect("set");
        assert!(checks.check(&header(MessageType::MethodReturn, 2), &fields).is_ok());
        assert!(matches!(
            checks.check(&header(MessageType::Error, 2), &fields),
            Err(BusError::MissingHeaderField("error_name"))
        ));
        text(HeaderFieldId::ErrorName, "", &mut fields);
        assert!(checks.check(&header(MessageType::Error, 2), &fields).is_err());
    }

    #[test]
    fn pedantic_mode_checks_grammar() {
        let mut fields = HeaderFields::new();
        fields.set(HeaderFieldId::ReplySerial, Arg::Uint32(1)).expect("set");
        text(HeaderFieldId::Destination, "not a bus name", &mut fields);
        let msg = header(MessageType::MethodReturn, 2);
        assert!(HeaderChecks::new(true).check(&msg, &fields).is_err());
        assert!(HeaderChecks::new(false).check(&msg, &fields).is_ok());
    }

    #[test]
    fn flag_sets_per_type() {
        assert!(check_flags(MessageType::MethodCall, MessageFlags::NO_REPLY_EXPECTED).is_ok());
        assert!(check_flags(MessageType::Signal, MessageFlags::GLOBAL_BROADCAST).is_ok());
        assert!(matches!(
            check_flags(MessageType::Signal, MessageFlags::NO_REPLY_EXPECTED),
            Err(BusError::BadHeaderFlags { flags: 0x01, .. })
        ));
        assert!(check_flags(MessageType::MethodCall, MessageFlags::GLOBAL_BROADCAST).is_err());
    }

    #[test]
    fn sender_spoofing_detected() {
        let mut fields = HeaderFields::new();
        assert!(check_sender(&fields, ":1.7").is_ok());
        text(HeaderFieldId::Sender, ":1.7", &mut fields);
        assert!(check_sender(&fields, ":1.7").is_ok());
        assert!(matches!(check_sender(&fields, ":1.8"), Err(BusError::BusNotAuthorized { .. })));
    }
}
