//! Type signatures.
//!
//! A signature is a string of type codes. Basic codes are single bytes;
//! `a` prefixes exactly one complete type, `(`...`)` encloses one or more
//! complete types, and `{`...`}` encloses a basic key type followed by one
//! complete value type and may only appear directly after `a`.
//!
//! ```text
//!   "a{sv}"   array of dict entries, string key, variant value
//!   "(iay)"   struct of int32 and byte array
//! ```

use crate::error::BusError;

pub const MAX_SIGNATURE_LEN: usize = 255;

/// Limit for array nesting and, separately, struct/dict-entry nesting.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Limit for containers (arrays, structs, dict entries and variants) nested
/// inside one value, counted across variant boundaries.
pub const MAX_CONTAINER_DEPTH: usize = 64;

/// Depth for a container opened at `depth`, or `BadSignature` past the limit.
pub(crate) fn enter_container(depth: usize) -> Result<usize, BusError> {
    if depth >= MAX_CONTAINER_DEPTH {
        return Err(BusError::bad_signature(format!(
            "containers nested deeper than {MAX_CONTAINER_DEPTH}"
        )));
    }
    Ok(depth + 1)
}

pub const BYTE: u8 = b'y';
pub const BOOLEAN: u8 = b'b';
pub const INT16: u8 = b'n';
pub const UINT16: u8 = b'q';
pub const INT32: u8 = b'i';
pub const UINT32: u8 = b'u';
pub const INT64: u8 = b'x';
pub const UINT64: u8 = b't';
pub const DOUBLE: u8 = b'd';
pub const STRING: u8 = b's';
pub const OBJECT_PATH: u8 = b'o';
pub const SIGNATURE: u8 = b'g';
pub const HANDLE: u8 = b'h';
pub const ARRAY: u8 = b'a';
pub const STRUCT_OPEN: u8 = b'(';
pub const STRUCT_CLOSE: u8 = b')';
pub const DICT_ENTRY_OPEN: u8 = b'{';
pub const DICT_ENTRY_CLOSE: u8 = b'}';
pub const VARIANT: u8 = b'v';

/// Basic types are the ones allowed as dictionary keys.
pub fn is_basic_type(code: u8) -> bool {
    matches!(
        code,
        BYTE | BOOLEAN
            | INT16
            | UINT16
            | INT32
            | UINT32
            | INT64
            | UINT64
            | DOUBLE
            | STRING
            | OBJECT_PATH
            | SIGNATURE
            | HANDLE
    )
}

/// Wire alignment for a value whose type starts with `code`.
pub fn alignment_of(code: u8) -> usize {
    match code {
        BYTE | SIGNATURE | VARIANT => 1,
        INT16 | UINT16 => 2,
        BOOLEAN | INT32 | UINT32 | HANDLE | STRING | OBJECT_PATH | ARRAY => 4,
        INT64 | UINT64 | DOUBLE | STRUCT_OPEN | DICT_ENTRY_OPEN => 8,
        _ => 1,
    }
}

/// Encoded size for fixed-width scalars, `None` for everything else.
pub fn fixed_size_of(code: u8) -> Option<usize> {
    match code {
        BYTE => Some(1),
        INT16 | UINT16 => Some(2),
        BOOLEAN | INT32 | UINT32 | HANDLE => Some(4),
        INT64 | UINT64 | DOUBLE => Some(8),
        _ => None,
    }
}

/// One lexical element of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Basic(u8),
    BeginArray,
    BeginStruct,
    EndStruct,
    BeginDictEntry,
    EndDictEntry,
    Variant,
}

/// Lazy, restartable token iterator. It never mutates or copies the input;
/// `offset()` can be handed to [`Tokens::at`] to resume later.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    sig: &'a [u8],
    offset: usize,
}

impl<'a> Tokens<'a> {
    pub fn at(sig: &'a str, offset: usize) -> Self {
        Self { sig: sig.as_bytes(), offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Result<Token, BusError>;

    fn next(&mut self) -> Option<Self::Item> {
        let code = *self.sig.get(self.offset)?;
        self.offset += 1;
        let token = match code {
            ARRAY => Token::BeginArray,
            STRUCT_OPEN => Token::BeginStruct,
            STRUCT_CLOSE => Token::EndStruct,
            DICT_ENTRY_OPEN => Token::BeginDictEntry,
            DICT_ENTRY_CLOSE => Token::EndDictEntry,
            VARIANT => Token::Variant,
            code if is_basic_type(code) => Token::Basic(code),
            other => {
                // Stop after an error so the caller cannot loop on it.
                self.offset = self.sig.len();
                return Some(Err(unknown_code(other)));
            }
        };
        Some(Ok(token))
    }
}

pub fn tokens(sig: &str) -> Tokens<'_> {
    Tokens::at(sig, 0)
}

fn unknown_code(code: u8) -> BusError {
    BusError::malformed_signature(format!("unknown type code 0x{code:02x}"))
}

fn complete_type_end(
    sig: &[u8],
    start: usize,
    array_depth: usize,
    struct_depth: usize,
) -> Result<usize, BusError> {
    let code = *sig
        .get(start)
        .ok_or_else(|| BusError::malformed_signature("incomplete type"))?;
    match code {
        VARIANT => Ok(start + 1),
        code if is_basic_type(code) => Ok(start + 1),
        ARRAY => {
            if array_depth >= MAX_NESTING_DEPTH {
                return Err(BusError::malformed_signature("array nesting too deep"));
            }
            if sig.get(start + 1) != Some(&DICT_ENTRY_OPEN) {
                return complete_type_end(sig, start + 1, array_depth + 1, struct_depth);
            }
            if struct_depth >= MAX_NESTING_DEPTH {
                return Err(BusError::malformed_signature("dict entry nesting too deep"));
            }
            let key = *sig
                .get(start + 2)
                .ok_or_else(|| BusError::malformed_signature("dict entry without key"))?;
            if !is_basic_type(key) {
                return Err(BusError::malformed_signature(format!(
                    "dict entry key '{}' is not a basic type",
                    key as char
                )));
            }
            let value_end = complete_type_end(sig, start + 3, array_depth + 1, struct_depth + 1)?;
            if sig.get(value_end) != Some(&DICT_ENTRY_CLOSE) {
                return Err(BusError::malformed_signature(
                    "dict entry must hold exactly one key and one value",
                ));
            }
            Ok(value_end + 1)
        }
        STRUCT_OPEN => {
            if struct_depth >= MAX_NESTING_DEPTH {
                return Err(BusError::malformed_signature("struct nesting too deep"));
            }
            let mut pos = start + 1;
            if sig.get(pos) == Some(&STRUCT_CLOSE) {
                return Err(BusError::malformed_signature("empty struct"));
            }
            loop {
                match sig.get(pos) {
                    None => return Err(BusError::malformed_signature("unterminated struct")),
                    Some(&STRUCT_CLOSE) => return Ok(pos + 1),
                    Some(_) => pos = complete_type_end(sig, pos, array_depth, struct_depth + 1)?,
                }
            }
        }
        DICT_ENTRY_OPEN => Err(BusError::malformed_signature("dict entry outside of an array")),
        STRUCT_CLOSE | DICT_ENTRY_CLOSE => {
            Err(BusError::malformed_signature(format!("unmatched '{}'", code as char)))
        }
        other => Err(unknown_code(other)),
    }
}

/// Returns the complete type starting at `offset` and the offset just past it.
pub fn parse_complete_type(sig: &str, offset: usize) -> Result<(&str, usize), BusError> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(BusError::malformed_signature(format!(
            "signature is {} bytes, limit {MAX_SIGNATURE_LEN}",
            sig.len()
        )));
    }
    let end = complete_type_end(sig.as_bytes(), offset, 0, 0)?;
    let ty = sig
        .get(offset..end)
        .ok_or_else(|| BusError::malformed_signature("offset is not on a type boundary"))?;
    Ok((ty, end))
}

/// Iterator over the top-level complete types of a signature.
pub struct CompleteTypes<'a> {
    sig: &'a str,
    offset: usize,
}

impl<'a> Iterator for CompleteTypes<'a> {
    type Item = Result<&'a str, BusError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.sig.len() {
            return None;
        }
        match parse_complete_type(self.sig, self.offset) {
            Ok((ty, next)) => {
                self.offset = next;
                Some(Ok(ty))
            }
            Err(err) => {
                self.offset = self.sig.len();
                Some(Err(err))
            }
        }
    }
}

pub fn complete_types(sig: &str) -> CompleteTypes<'_> {
    CompleteTypes { sig, offset: 0 }
}

pub fn validate(sig: &str) -> Result<(), BusError> {
    complete_types(sig).try_for_each(|ty| ty.map(|_| ()))
}

pub fn count_complete_types(sig: &str) -> Result<usize, BusError> {
    complete_types(sig).try_fold(0usize, |count, ty| ty.map(|_| count + 1))
}

/// `true` when `sig` is exactly one complete type.
pub fn is_single_complete_type(sig: &str) -> bool {
    matches!(parse_complete_type(sig, 0), Ok((_, end)) if end == sig.len())
}

/// Splits a dict entry type `{kv}` into its key and value types.
/// The input must already be a validated array element type.
pub(crate) fn dict_entry_parts(ty: &str) -> Result<(&str, &str), BusError> {
    if ty.len() < 4 || !ty.starts_with('{') || !ty.ends_with('}') {
        return Err(BusError::malformed_signature(format!("\"{ty}\" is not a dict entry")));
    }
    Ok((&ty[1..2], &ty[2..ty.len() - 1]))
}

/// Inner element type of an array type `a<elem>`.
pub(crate) fn array_element(ty: &str) -> Result<&str, BusError> {
    match ty.strip_prefix('a') {
        Some(elem) if !elem.is_empty() => Ok(elem),
        _ => Err(BusError::malformed_signature(format!("\"{ty}\" is not an array type"))),
    }
}

/// Member types of a struct type `(...)`.
pub(crate) fn struct_members(ty: &str) -> Result<Vec<&str>, BusError> {
    let inner = ty
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| BusError::malformed_signature(format!("\"{ty}\" is not a struct type")))?;
    let mut members = Vec::new();
    let mut offset = 0;
    while offset < inner.len() {
        let end = complete_type_end(inner.as_bytes(), offset, 0, 1)?;
        members.push(&inner[offset..end]);
        offset = end;
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_signatures() {
        for sig in ["", "s", "a{sv}", "(iay)", "aa(s(xt))", "a{oa{sa{sv}}}", "vvv", "h"] {
            assert!(validate(sig).is_ok(), "{sig} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_signatures() {
        for sig in ["(", ")", "a", "()", "{sv}", "a{vs}", "a{s}", "a{sss}", "(s", "z", "a{(s)v}"] {
            assert!(
                matches!(validate(sig), Err(BusError::MalformedSignature(_))),
                "{sig} should be rejected"
            );
        }
    }

    #[test]
    fn counts_top_level_types() {
        assert_eq!(count_complete_types("").expect("empty"), 0);
        assert_eq!(count_complete_types("sa{sv}(ii)v").expect("count"), 4);
    }

    #[test]
    fn parse_is_restartable_from_returned_offset() {
        let sig = "ia(ss)v";
        let (first, next) = parse_complete_type(sig, 0).expect("first");
        assert_eq!(first, "i");
        let (second, next) = parse_complete_type(sig, next).expect("second");
        assert_eq!(second, "a(ss)");
        let (third, end) = parse_complete_type(sig, next).expect("third");
        assert_eq!(third, "v");
        assert_eq!(end, sig.len());
    }

    #[test]
    fn enforces_nesting_limits() {
        let deep_arrays = "a".repeat(MAX_NESTING_DEPTH) + "y";
        assert!(validate(&deep_arrays).is_ok());
        let too_deep = "a".repeat(MAX_NESTING_DEPTH + 1) + "y";
        assert!(validate(&too_deep).is_err());

        let nested = "(".repeat(MAX_NESTING_DEPTH + 1) + "y" + &")".repeat(MAX_NESTING_DEPTH + 1);
        assert!(validate(&nested).is_err());
    }

    #[test]
    fn rejects_overlong_signature() {
        let sig = "y".repeat(MAX_SIGNATURE_LEN + 1);
        assert!(validate(&sig).is_err());
        assert!(validate(&sig[..MAX_SIGNATURE_LEN]).is_ok());
    }

    #[test]
    fn tokens_are_lazy_and_resumable() {
        let mut iter = tokens("a{sv}");
        assert_eq!(iter.next().expect("a").expect("ok"), Token::BeginArray);
        assert_eq!(iter.next().expect("{").expect("ok"), Token::BeginDictEntry);
        let resume = iter.offset();
        let rest: Vec<Token> = Tokens::at("a{sv}", resume).map(|t| t.expect("token")).collect();
        assert_eq!(rest, vec![Token::Basic(STRING), Token::Variant, Token::EndDictEntry]);
    }

    #[test]
    fn token_error_terminates_iteration() {
        let mut iter = tokens("sz");
        assert!(iter.next().expect("s").is_ok());
        assert!(iter.next().expect("z").is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn splits_container_types() {
        assert_eq!(dict_entry_parts("{sv}").expect("dict"), ("s", "v"));
        assert_eq!(array_element("aa{ss}").expect("array"), "a{ss}");
        assert_eq!(struct_members("(ia(ss)v)").expect("struct"), vec!["i", "a(ss)", "v"]);
    }

    #[test]
    fn alignment_table() {
        assert_eq!(alignment_of(BYTE), 1);
        assert_eq!(alignment_of(UINT16), 2);
        assert_eq!(alignment_of(STRING), 4);
        assert_eq!(alignment_of(ARRAY), 4);
        assert_eq!(alignment_of(DOUBLE), 8);
        assert_eq!(alignment_of(STRUCT_OPEN), 8);
        assert_eq!(alignment_of(VARIANT), 1);
    }
}
