use std::borrow::Cow;

use log::{debug, trace};

use crate::arg::{Arg, ArgArray, MAX_ARRAY_LEN};
use crate::buffer::{Endianness, WireReader};
use crate::error::BusError;
use crate::header::{HeaderFieldId, HeaderFields};
use crate::names::is_legal_object_path;
use crate::signature;

/// Decodes the header-field block (exactly `header_len` bytes, no trailing pad).
pub(crate) fn parse_header_fields(
    block: &[u8],
    endianness: Endianness,
) -> Result<HeaderFields, BusError> {
    let mut reader = WireReader::new(block, endianness);
    let mut fields = HeaderFields::new();
    let overrun = |err: BusError| match err {
        BusError::EndOfData => {
            BusError::BadHeaderLength("header field runs past the declared header length".into())
        }
        other => other,
    };

    while !reader.is_empty() {
        reader.align_to(8).map_err(overrun)?;
        if reader.is_empty() {
            return Err(BusError::BadHeaderLength("header length includes trailing padding".into()));
        }
        let code = reader.read_byte().map_err(overrun)?;
        if code == 0 {
            return Err(BusError::BadHeaderField("field id 0".into()));
        }
        let sig = read_signature(&mut reader).map_err(overrun)?;
        if !signature::is_single_complete_type(sig) {
            return Err(BusError::BadHeaderField(format!(
                "field {code} has signature \"{sig}\", not one complete type"
            )));
        }
        let value = read_value(&mut reader, sig, 0, 0).map_err(overrun)?;
        match HeaderFieldId::from_code(code) {
            Some(id) => {
                if sig.as_bytes() != [id.type_code()] {
                    return Err(BusError::BadHeaderField(format!(
                        "{} has type \"{sig}\", expected '{}'",
                        id.name(),
                        id.type_code() as char
                    )));
                }
                fields.set(id, value.into_owned())?;
            }
            None => debug!("unmarshal: skipping unknown header field {code}"),
        }
    }
    Ok(fields)
}

/// Decodes a complete plaintext body against `sig`. Values borrow from `body`.
pub(crate) fn unmarshal_args<'a>(
    body: &'a [u8],
    sig: &'a str,
    endianness: Endianness,
    handles: u32,
) -> Result<Vec<Arg<'a>>, BusError> {
    if body.is_empty() != sig.is_empty() {
        return Err(BusError::BadBodyLen(format!(
            "{} body bytes for signature \"{sig}\"",
            body.len()
        )));
    }
    let mut reader = WireReader::new(body, endianness);
    let mut args = Vec::new();
    for ty in signature::complete_types(sig) {
        args.push(read_value(&mut reader, ty?, handles, 0)?);
    }
    if !reader.is_empty() {
        return Err(BusError::bad_signature(format!(
            "signature \"{sig}\" consumed {} of {} body bytes",
            reader.offset(),
            body.len()
        )));
    }
    trace!("unmarshal: {} args from {} bytes", args.len(), body.len());
    Ok(args)
}

fn read_signature<'a>(reader: &mut WireReader<'a>) -> Result<&'a str, BusError> {
    let len = usize::from(reader.read_byte()?);
    let bytes = reader.read_slice(len)?;
    if reader.read_byte()? != 0 {
        return Err(BusError::NotNulTerminated);
    }
    let sig = std::str::from_utf8(bytes)
        .map_err(|_| BusError::malformed_signature("signature is not ASCII"))?;
    signature::validate(sig)?;
    Ok(sig)
}

fn read_string<'a>(reader: &mut WireReader<'a>) -> Result<&'a str, BusError> {
    reader.align_to(4)?;
    let len = reader.read_u32()? as usize;
    let bytes = reader.read_slice(len)?;
    if reader.read_byte()? != 0 {
        return Err(BusError::NotNulTerminated);
    }
    let text =
        std::str::from_utf8(bytes).map_err(|_| BusError::bad_value("string is not valid UTF-8"))?;
    if text.contains('\0') {
        return Err(BusError::bad_value("string contains an interior NUL"));
    }
    Ok(text)
}

fn read_value<'a>(
    reader: &mut WireReader<'a>,
    ty: &'a str,
    handles: u32,
    depth: usize,
) -> Result<Arg<'a>, BusError> {
    let code = *ty.as_bytes().first().ok_or_else(|| BusError::malformed_signature("empty type"))?;
    let arg = match code {
        signature::BYTE => Arg::Byte(reader.read_byte()?),
        signature::BOOLEAN => {
            reader.align_to(4)?;
            match reader.read_u32()? {
                0 => Arg::Boolean(false),
                1 => Arg::Boolean(true),
                other => return Err(BusError::bad_value(format!("boolean value {other}"))),
            }
        }
        signature::INT16 => {
            reader.align_to(2)?;
            Arg::Int16(reader.read_u16()? as i16)
        }
        signature::UINT16 => {
            reader.align_to(2)?;
            Arg::Uint16(reader.read_u16()?)
        }
        signature::INT32 => {
            reader.align_to(4)?;
            Arg::Int32(reader.read_u32()? as i32)
        }
        signature::UINT32 => {
            reader.align_to(4)?;
            Arg::Uint32(reader.read_u32()?)
        }
        signature::INT64 => {
            reader.align_to(8)?;
            Arg::Int64(reader.read_u64()? as i64)
        }
        signature::UINT64 => {
            reader.align_to(8)?;
            Arg::Uint64(reader.read_u64()?)
        }
        signature::DOUBLE => {
            reader.align_to(8)?;
            Arg::Double(f64::from_bits(reader.read_u64()?))
        }
        signature::HANDLE => {
            reader.align_to(4)?;
            let index = reader.read_u32()?;
            if index >= handles {
                return Err(BusError::NoSuchHandle { index, count: handles });
            }
            Arg::Handle(index)
        }
        signature::STRING => Arg::String(Cow::Borrowed(read_string(reader)?)),
        signature::OBJECT_PATH => {
            let path = read_string(reader)?;
            if !is_legal_object_path(path) {
                return Err(BusError::bad_value(format!("\"{path}\" is not a legal object path")));
            }
            Arg::ObjectPath(Cow::Borrowed(path))
        }
        signature::SIGNATURE => Arg::Signature(Cow::Borrowed(read_signature(reader)?)),
        signature::ARRAY => read_array(reader, ty, handles, signature::enter_container(depth)?)?,
        signature::STRUCT_OPEN => {
            let depth = signature::enter_container(depth)?;
            reader.align_to(8)?;
            let members = signature::struct_members(ty)?
                .into_iter()
                .map(|member| read_value(reader, member, handles, depth))
                .collect::<Result<Vec<_>, _>>()?;
            Arg::Struct(members)
        }
        signature::DICT_ENTRY_OPEN => {
            let depth = signature::enter_container(depth)?;
            reader.align_to(8)?;
            let (key_ty, value_ty) = signature::dict_entry_parts(ty)?;
            let key = read_value(reader, key_ty, handles, depth)?;
            let value = read_value(reader, value_ty, handles, depth)?;
            Arg::DictEntry(Box::new(key), Box::new(value))
        }
        signature::VARIANT => {
            let depth = signature::enter_container(depth)?;
            let inner_ty = read_signature(reader)?;
            if !signature::is_single_complete_type(inner_ty) {
                return Err(BusError::bad_signature(format!(
                    "variant signature \"{inner_ty}\" is not one complete type"
                )));
            }
            Arg::Variant(Box::new(read_value(reader, inner_ty, handles, depth)?))
        }
        other => {
            return Err(BusError::malformed_signature(format!(
                "unexpected type code '{}'",
                other as char
            )))
        }
    };
    Ok(arg)
}

fn read_array<'a>(
    reader: &mut WireReader<'a>,
    ty: &'a str,
    handles: u32,
    depth: usize,
) -> Result<Arg<'a>, BusError> {
    let elem_ty = signature::array_element(ty)?;
    let elem_code = elem_ty.as_bytes()[0];

    reader.align_to(4)?;
    let len = reader.read_u32()? as usize;
    if len > MAX_ARRAY_LEN {
        return Err(BusError::BadArrayLength(format!("{len} bytes, limit {MAX_ARRAY_LEN}")));
    }
    reader.align_to(signature::alignment_of(elem_code))?;
    if len > reader.bytes_left() {
        return Err(BusError::BadArrayLength(format!(
            "{len} bytes declared, {} available",
            reader.bytes_left()
        )));
    }
    if let Some(size) = signature::fixed_size_of(elem_code) {
        if len % size != 0 {
            return Err(BusError::BadArrayLength(format!(
                "{len} bytes is not a multiple of the {size}-byte element"
            )));
        }
    }

    let end = reader.offset() + len;
    let mut elements = Vec::new();
    while reader.offset() < end {
        elements.push(read_value(reader, elem_ty, handles, depth)?);
    }
    if reader.offset() != end {
        return Err(BusError::BadArrayLength(format!(
            "elements overrun the declared {len} bytes"
        )));
    }
    Ok(Arg::Array(ArgArray::from_parsed(elem_ty, elements)))
}
