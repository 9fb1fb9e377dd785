use log::trace;

use crate::arg::{Arg, MAX_ARRAY_LEN};
use crate::buffer::{Endianness, WireWriter};
use crate::error::BusError;
use crate::header::HeaderFields;
use crate::names::is_legal_object_path;
use crate::signature::{self, MAX_SIGNATURE_LEN};

/// Most top-level arguments one message body may carry.
pub const MAX_ARGS: usize = 255;

/// Writes the header-field block. The returned length excludes the trailing
/// padding that separates the block from the body.
pub(crate) fn marshal_header_fields(
    fields: &HeaderFields,
    endianness: Endianness,
) -> Result<Vec<u8>, BusError> {
    let mut writer = WireWriter::with_capacity(endianness, 128);
    for (id, value) in fields.iter() {
        writer.align_to(8);
        writer.write_byte(id.code());
        write_signature(&mut writer, &value.signature())?;
        write_arg(&mut writer, value, 0, 0)?;
    }
    trace!("marshal: {} header field bytes", writer.offset());
    Ok(writer.into_inner())
}

/// Writes `args` as described by `sig`. The writer must start on an 8-byte
/// boundary of the message. Nothing is returned on failure; the caller
/// drops the partial writer.
pub(crate) fn marshal_args(
    writer: &mut WireWriter,
    sig: &str,
    args: &[Arg<'_>],
    handles: u32,
) -> Result<(), BusError> {
    let count = signature::count_complete_types(sig)?;
    if count > MAX_ARGS {
        return Err(BusError::bad_signature(format!("{count} arguments, limit {MAX_ARGS}")));
    }
    if count != args.len() {
        return Err(BusError::bad_signature(format!(
            "signature \"{sig}\" describes {count} arguments, {} supplied",
            args.len()
        )));
    }
    for (ty, arg) in signature::complete_types(sig).zip(args) {
        let ty = ty?;
        if !arg.has_signature(ty) {
            return Err(BusError::bad_signature(format!(
                "argument of type \"{}\" where \"{ty}\" expected",
                arg.signature()
            )));
        }
        write_arg(writer, arg, handles, 0)?;
    }
    Ok(())
}

fn write_signature(writer: &mut WireWriter, sig: &str) -> Result<(), BusError> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(BusError::malformed_signature(format!("signature is {} bytes", sig.len())));
    }
    writer.write_byte(sig.len() as u8);
    writer.write(sig.as_bytes());
    writer.write_byte(0);
    Ok(())
}

fn write_string(writer: &mut WireWriter, text: &str) -> Result<(), BusError> {
    if text.contains('\0') {
        return Err(BusError::bad_value("string contains an interior NUL"));
    }
    let len = u32::try_from(text.len()).map_err(|_| BusError::MessageTooLarge(text.len()))?;
    writer.align_to(4);
    writer.write_u32(len);
    writer.write(text.as_bytes());
    writer.write_byte(0);
    Ok(())
}

fn write_arg(
    writer: &mut WireWriter,
    arg: &Arg<'_>,
    handles: u32,
    depth: usize,
) -> Result<(), BusError> {
    match arg {
        Arg::Byte(v) => writer.write_byte(*v),
        Arg::Boolean(v) => {
            writer.align_to(4);
            writer.write_u32(u32::from(*v));
        }
        Arg::Int16(v) => {
            writer.align_to(2);
            writer.write_u16(*v as u16);
        }
        Arg::Uint16(v) => {
            writer.align_to(2);
            writer.write_u16(*v);
        }
        Arg::Int32(v) => {
            writer.align_to(4);
            writer.write_u32(*v as u32);
        }
        Arg::Uint32(v) => {
            writer.align_to(4);
            writer.write_u32(*v);
        }
        Arg::Int64(v) => {
            writer.align_to(8);
            writer.write_u64(*v as u64);
        }
        Arg::Uint64(v) => {
            writer.align_to(8);
            writer.write_u64(*v);
        }
        Arg::Double(v) => {
            writer.align_to(8);
            writer.write_u64(v.to_bits());
        }
        Arg::Handle(index) => {
            if *index >= handles {
                return Err(BusError::NoSuchHandle { index: *index, count: handles });
            }
            writer.align_to(4);
            writer.write_u32(*index);
        }
        Arg::String(text) => write_string(writer, text)?,
        Arg::ObjectPath(path) => {
            if !is_legal_object_path(path) {
                return Err(BusError::bad_value(format!("\"{path}\" is not a legal object path")));
            }
            write_string(writer, path)?;
        }
        Arg::Signature(sig) => {
            signature::validate(sig)?;
            write_signature(writer, sig)?;
        }
        Arg::Array(array) => {
            let depth = signature::enter_container(depth)?;
            writer.align_to(4);
            let len_at = writer.offset();
            writer.write_u32(0);
            let elem_code = array.element_signature().as_bytes().first().copied().unwrap_or(0);
            writer.align_to(signature::alignment_of(elem_code));
            let start = writer.offset();
            for element in array.elements() {
                write_arg(writer, element, handles, depth)?;
            }
            let len = writer.offset() - start;
            if len > MAX_ARRAY_LEN {
                return Err(BusError::ArrayTooLarge(len));
            }
            writer.patch_u32(len_at, len as u32)?;
        }
        Arg::Struct(members) => {
            if members.is_empty() {
                return Err(BusError::bad_value("struct must have at least one member"));
            }
            let depth = signature::enter_container(depth)?;
            writer.align_to(8);
            for member in members {
                write_arg(writer, member, handles, depth)?;
            }
        }
        Arg::DictEntry(key, value) => {
            let depth = signature::enter_container(depth)?;
            writer.align_to(8);
            write_arg(writer, key, handles, depth)?;
            write_arg(writer, value, handles, depth)?;
        }
        Arg::Variant(inner) => {
            let depth = signature::enter_container(depth)?;
            let sig = inner.signature();
            if !signature::is_single_complete_type(&sig) {
                return Err(BusError::bad_signature(format!(
                    "variant holds \"{sig}\", not one complete type"
                )));
            }
            write_signature(writer, &sig)?;
            write_arg(writer, inner, handles, depth)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderFieldId;
    use std::borrow::Cow;

    fn body(sig: &str, args: &[Arg<'_>]) -> Result<Vec<u8>, BusError> {
        let mut writer = WireWriter::new(Endianness::Little);
        marshal_args(&mut writer, sig, args, 0)?;
        Ok(writer.into_inner())
    }

    #[test]
    fn string_layout() {
        let bytes = body("s", &[Arg::string("hi").expect("s")]).expect("marshal");
        assert_eq!(bytes, vec![2, 0, 0, 0, b'h', b'i', 0]);
    }

    #[test]
    fn scalars_are_naturally_aligned() {
        let bytes = body("yqt", &[Arg::Byte(1), Arg::Uint16(2), Arg::Uint64(3)]).expect("marshal");
        assert_eq!(bytes, vec![1, 0, 2, 0, 0, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn array_padding_not_counted_in_length() {
        let array = Arg::array("t", vec![Arg::Uint64(5)]).expect("array");
        let bytes = body("at", &[array]).expect("marshal");
        // length 8, then 4 pad bytes to reach 8-alignment, then the element
        assert_eq!(&bytes[..4], &[8, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn empty_array_still_pads_to_element_alignment() {
        let array = Arg::array("(ii)", vec![]).expect("array");
        let bytes = body("a(ii)", &[array]).expect("marshal");
        assert_eq!(bytes, vec![0; 8]);
    }

    #[test]
    fn variant_carries_signature() {
        let bytes = body("v", &[Arg::variant(Arg::Byte(9))]).expect("marshal");
        assert_eq!(bytes, vec![1, b'y', 0, 9]);
    }

    #[test]
    fn arity_and_type_mismatches_fail() {
        assert!(matches!(body("ss", &[Arg::string("a").expect("a")]), Err(BusError::BadSignature(_))));
        assert!(matches!(body("i", &[Arg::Uint32(1)]), Err(BusError::BadSignature(_))));
        assert!(matches!(body("(", &[]), Err(BusError::MalformedSignature(_))));
    }

    #[test]
    fn handles_must_be_in_range() {
        let mut writer = WireWriter::new(Endianness::Little);
        assert!(marshal_args(&mut writer, "h", &[Arg::Handle(0)], 1).is_ok());
        let mut writer = WireWriter::new(Endianness::Little);
        assert!(matches!(
            marshal_args(&mut writer, "h", &[Arg::Handle(1)], 1),
            Err(BusError::NoSuchHandle { index: 1, count: 1 })
        ));
    }

    #[test]
    fn array_byte_limit() {
        let at_limit = Arg::array("y", vec![Arg::Byte(0); MAX_ARRAY_LEN]).expect("array");
        assert!(body("ay", &[at_limit]).is_ok());

        // 32769 int32 elements: count is legal, byte length is not
        let over = Arg::array("i", vec![Arg::Int32(0); MAX_ARRAY_LEN / 4 + 1]).expect("array");
        assert!(matches!(body("ai", &[over]), Err(BusError::ArrayTooLarge(_))));
    }

    #[test]
    fn header_fields_are_eight_aligned() {
        let mut fields = HeaderFields::new();
        fields.set(HeaderFieldId::Path, Arg::ObjectPath(Cow::Borrowed("/a"))).expect("path");
        fields.set(HeaderFieldId::ReplySerial, Arg::Uint32(5)).expect("reply");
        let bytes = marshal_header_fields(&fields, Endianness::Little).expect("fields");
        // path: id, sig "o", len 1, "/a\0" = 1+3+4+3 = 11 bytes, padded to 16
        assert_eq!(&bytes[..4], &[1, 1, b'o', 0]);
        assert_eq!(bytes[16], 5);
        assert_eq!(&bytes[17..20], &[1, b'u', 0]);
        assert_eq!(bytes.len(), 24);
    }

    fn variant_chain(variants: usize) -> Arg<'static> {
        (0..variants).fold(Arg::Byte(1), |inner, _| Arg::variant(inner))
    }

    #[test]
    fn nesting_past_the_container_limit_is_refused() {
        let at_limit = body("v", &[variant_chain(signature::MAX_CONTAINER_DEPTH)]).expect("64 deep");
        assert_eq!(&at_limit[..3], &[1, b'v', 0]);

        let err = body("v", &[variant_chain(signature::MAX_CONTAINER_DEPTH + 1)])
            .expect_err("65 deep");
        assert!(matches!(err, BusError::BadSignature(_)));

        // 44 variants, but 66 containers once the arrays count.
        let mut nested = Arg::Byte(1);
        for _ in 0..22 {
            nested = Arg::variant(Arg::array("v", vec![Arg::variant(nested)]).expect("array"));
        }
        assert!(matches!(body("v", &[nested]), Err(BusError::BadSignature(_))));
    }
}
