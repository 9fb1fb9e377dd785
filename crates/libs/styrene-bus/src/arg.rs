//! Typed message arguments.
//!
//! `Arg<'a>` either borrows its text from a receive buffer (`'a` tied to the
//! owning [`Message`](crate::Message)) or owns it. [`Arg::into_owned`] is the
//! one explicit step that detaches a value from its source buffer.

use std::borrow::Cow;
use std::fmt;

use crate::error::BusError;
use crate::names::is_legal_object_path;
use crate::signature;

/// Maximum number of elements, and maximum marshaled byte length, of an array.
pub const MAX_ARRAY_LEN: usize = 131_072;

#[derive(Debug, Clone, PartialEq)]
pub enum Arg<'a> {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(Cow<'a, str>),
    ObjectPath(Cow<'a, str>),
    Signature(Cow<'a, str>),
    /// Index into the out-of-band handle list.
    Handle(u32),
    Array(ArgArray<'a>),
    Struct(Vec<Arg<'a>>),
    DictEntry(Box<Arg<'a>>, Box<Arg<'a>>),
    Variant(Box<Arg<'a>>),
}

/// Homogeneous array. The element signature is kept even when empty so
/// that `a{sv}` and `as` stay distinguishable with zero elements.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgArray<'a> {
    elem_sig: Cow<'a, str>,
    elements: Vec<Arg<'a>>,
}

impl<'a> ArgArray<'a> {
    pub fn new(
        elem_sig: impl Into<Cow<'a, str>>,
        elements: Vec<Arg<'a>>,
    ) -> Result<Self, BusError> {
        let elem_sig = elem_sig.into();
        let array_sig = format!("a{elem_sig}");
        if !signature::is_single_complete_type(&array_sig) {
            return Err(BusError::malformed_signature(format!(
                "\"{elem_sig}\" is not a single complete element type"
            )));
        }
        if elements.len() > MAX_ARRAY_LEN {
            return Err(BusError::ArrayTooLarge(elements.len()));
        }
        if let Some(bad) = elements.iter().find(|element| !element.has_signature(&elem_sig)) {
            return Err(BusError::mismatch(elem_sig.as_ref(), bad.signature()));
        }
        Ok(Self { elem_sig, elements })
    }

    /// Used by the unmarshaler, which has already checked every element.
    pub(crate) fn from_parsed(elem_sig: &'a str, elements: Vec<Arg<'a>>) -> Self {
        Self { elem_sig: Cow::Borrowed(elem_sig), elements }
    }

    pub fn element_signature(&self) -> &str {
        &self.elem_sig
    }

    pub fn elements(&self) -> &[Arg<'a>] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn into_owned(self) -> ArgArray<'static> {
        ArgArray {
            elem_sig: Cow::Owned(self.elem_sig.into_owned()),
            elements: self.elements.into_iter().map(Arg::into_owned).collect(),
        }
    }
}

fn check_text(text: &str) -> Result<(), BusError> {
    if text.contains('\0') {
        return Err(BusError::bad_value("string contains an interior NUL"));
    }
    Ok(())
}

impl<'a> Arg<'a> {
    pub fn string(text: impl Into<Cow<'a, str>>) -> Result<Self, BusError> {
        let text = text.into();
        check_text(&text)?;
        Ok(Self::String(text))
    }

    pub fn object_path(path: impl Into<Cow<'a, str>>) -> Result<Self, BusError> {
        let path = path.into();
        if !is_legal_object_path(&path) {
            return Err(BusError::bad_value(format!("\"{path}\" is not a legal object path")));
        }
        Ok(Self::ObjectPath(path))
    }

    pub fn signature_value(sig: impl Into<Cow<'a, str>>) -> Result<Self, BusError> {
        let sig = sig.into();
        signature::validate(&sig)
            .map_err(|err| BusError::bad_value(format!("\"{sig}\" is not a signature: {err}")))?;
        Ok(Self::Signature(sig))
    }

    pub fn variant(inner: Arg<'a>) -> Self {
        Self::Variant(Box::new(inner))
    }

    pub fn array(
        elem_sig: impl Into<Cow<'a, str>>,
        elements: Vec<Arg<'a>>,
    ) -> Result<Self, BusError> {
        ArgArray::new(elem_sig, elements).map(Self::Array)
    }

    pub fn structure(members: Vec<Arg<'a>>) -> Result<Self, BusError> {
        if members.is_empty() {
            return Err(BusError::bad_value("struct must have at least one member"));
        }
        Ok(Self::Struct(members))
    }

    pub fn dict_entry(key: Arg<'a>, value: Arg<'a>) -> Result<Self, BusError> {
        if !key.is_basic() {
            return Err(BusError::bad_value(format!(
                "dict entry key of type \"{}\" is not basic",
                key.signature()
            )));
        }
        Ok(Self::DictEntry(Box::new(key), Box::new(value)))
    }

    /// Builds an argument for a one-type signature from a native value.
    /// Text and `u32` values are coerced to `o`, `g` and `h` when asked,
    /// and anything is boxed into a variant for `v`.
    pub fn set(sig: &str, value: impl IntoArg<'a>) -> Result<Self, BusError> {
        let arg = value.into_arg();
        match (sig.as_bytes(), arg) {
            ([signature::VARIANT], arg) if !matches!(arg, Arg::Variant(_)) => Ok(Self::variant(arg)),
            ([signature::OBJECT_PATH], Arg::String(text)) => Self::object_path(text),
            ([signature::SIGNATURE], Arg::String(text)) => Self::signature_value(text),
            ([signature::HANDLE], Arg::Uint32(index)) => Ok(Self::Handle(index)),
            (_, arg) if arg.has_signature(sig) => Ok(arg),
            (_, arg) => Err(BusError::mismatch(sig, arg.signature())),
        }
    }

    /// Reads this argument as a native value.
    pub fn get<'r, T: FromArg<'r>>(&'r self) -> Result<T, BusError> {
        T::from_arg(self)
    }

    pub fn is_basic(&self) -> bool {
        !matches!(self, Self::Array(_) | Self::Struct(_) | Self::DictEntry(..) | Self::Variant(_))
    }

    /// Text of a string, object path or signature.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) | Self::ObjectPath(text) | Self::Signature(text) => {
                Some(text.as_ref())
            }
            _ => None,
        }
    }

    /// Type signature of this single value.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Self::Byte(_) => out.push('y'),
            Self::Boolean(_) => out.push('b'),
            Self::Int16(_) => out.push('n'),
            Self::Uint16(_) => out.push('q'),
            Self::Int32(_) => out.push('i'),
            Self::Uint32(_) => out.push('u'),
            Self::Int64(_) => out.push('x'),
            Self::Uint64(_) => out.push('t'),
            Self::Double(_) => out.push('d'),
            Self::String(_) => out.push('s'),
            Self::ObjectPath(_) => out.push('o'),
            Self::Signature(_) => out.push('g'),
            Self::Handle(_) => out.push('h'),
            Self::Array(array) => {
                out.push('a');
                out.push_str(&array.elem_sig);
            }
            Self::Struct(members) => {
                out.push('(');
                members.iter().for_each(|member| member.write_signature(out));
                out.push(')');
            }
            Self::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            Self::Variant(_) => out.push('v'),
        }
    }

    /// `true` when this value can be marshaled as the single type `sig`.
    pub fn has_signature(&self, sig: &str) -> bool {
        match self {
            Self::Array(array) => {
                sig.strip_prefix('a').is_some_and(|elem| elem == array.elem_sig.as_ref())
            }
            Self::Struct(members) => match signature::struct_members(sig) {
                Ok(types) => {
                    types.len() == members.len()
                        && members.iter().zip(types).all(|(member, ty)| member.has_signature(ty))
                }
                Err(_) => false,
            },
            Self::DictEntry(key, value) => match signature::dict_entry_parts(sig) {
                Ok((key_ty, value_ty)) => key.has_signature(key_ty) && value.has_signature(value_ty),
                Err(_) => false,
            },
            _ => self.signature() == sig,
        }
    }

    /// Detaches every borrowed string from its source buffer.
    pub fn into_owned(self) -> Arg<'static> {
        fn owned(text: Cow<'_, str>) -> Cow<'static, str> {
            Cow::Owned(text.into_owned())
        }
        match self {
            Self::Byte(v) => Arg::Byte(v),
            Self::Boolean(v) => Arg::Boolean(v),
            Self::Int16(v) => Arg::Int16(v),
            Self::Uint16(v) => Arg::Uint16(v),
            Self::Int32(v) => Arg::Int32(v),
            Self::Uint32(v) => Arg::Uint32(v),
            Self::Int64(v) => Arg::Int64(v),
            Self::Uint64(v) => Arg::Uint64(v),
            Self::Double(v) => Arg::Double(v),
            Self::String(text) => Arg::String(owned(text)),
            Self::ObjectPath(text) => Arg::ObjectPath(owned(text)),
            Self::Signature(text) => Arg::Signature(owned(text)),
            Self::Handle(v) => Arg::Handle(v),
            Self::Array(array) => Arg::Array(array.into_owned()),
            Self::Struct(members) => Arg::Struct(members.into_iter().map(Arg::into_owned).collect()),
            Self::DictEntry(key, value) => {
                Arg::DictEntry(Box::new(key.into_owned()), Box::new(value.into_owned()))
            }
            Self::Variant(inner) => Arg::Variant(Box::new(inner.into_owned())),
        }
    }
}

/// Signature of a whole argument list.
pub fn signature_of(args: &[Arg<'_>]) -> String {
    args.iter().map(Arg::signature).collect()
}

impl fmt::Display for Arg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Uint16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Uint32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Uint64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(text) => write!(f, "{text:?}"),
            Self::ObjectPath(text) => write!(f, "{text}"),
            Self::Signature(text) => write!(f, "<{text}>"),
            Self::Handle(v) => write!(f, "handle#{v}"),
            Self::Array(array) => {
                write!(f, "[")?;
                for (i, element) in array.elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "]")
            }
            Self::Struct(members) => {
                write!(f, "(")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{member}")?;
                }
                write!(f, ")")
            }
            Self::DictEntry(key, value) => write!(f, "{key}: {value}"),
            Self::Variant(inner) => write!(f, "{}:{inner}", inner.signature()),
        }
    }
}

/// Native values that convert into an [`Arg`].
pub trait IntoArg<'a> {
    fn into_arg(self) -> Arg<'a>;
}

/// Native values readable from an [`Arg`] borrowed for `'r`.
pub trait FromArg<'r>: Sized {
    fn from_arg(arg: &'r Arg<'_>) -> Result<Self, BusError>;
}

macro_rules! scalar_conversions {
    ($($ty:ty => $variant:ident, $code:literal;)*) => {
        $(
            impl<'a> IntoArg<'a> for $ty {
                fn into_arg(self) -> Arg<'a> {
                    Arg::$variant(self)
                }
            }

            impl<'r> FromArg<'r> for $ty {
                fn from_arg(arg: &'r Arg<'_>) -> Result<Self, BusError> {
                    match arg {
                        Arg::$variant(value) => Ok(*value),
                        other => Err(BusError::mismatch($code, other.signature())),
                    }
                }
            }
        )*
    };
}

scalar_conversions! {
    u8 => Byte, "y";
    bool => Boolean, "b";
    i16 => Int16, "n";
    u16 => Uint16, "q";
    i32 => Int32, "i";
    u32 => Uint32, "u";
    i64 => Int64, "x";
    u64 => Uint64, "t";
    f64 => Double, "d";
}

impl<'a> IntoArg<'a> for &'a str {
    fn into_arg(self) -> Arg<'a> {
        Arg::String(Cow::Borrowed(self))
    }
}

impl<'a> IntoArg<'a> for String {
    fn into_arg(self) -> Arg<'a> {
        Arg::String(Cow::Owned(self))
    }
}

impl<'a> IntoArg<'a> for Arg<'a> {
    fn into_arg(self) -> Arg<'a> {
        self
    }
}

impl<'r> FromArg<'r> for &'r str {
    fn from_arg(arg: &'r Arg<'_>) -> Result<Self, BusError> {
        match arg {
            Arg::String(text) => Ok(text.as_ref()),
            other => Err(BusError::mismatch("s", other.signature())),
        }
    }
}

impl<'r> FromArg<'r> for String {
    fn from_arg(arg: &'r Arg<'_>) -> Result<Self, BusError> {
        <&str>::from_arg(arg).map(str::to_owned)
    }
}

impl<'r, T: FromArg<'r>> FromArg<'r> for Vec<T> {
    fn from_arg(arg: &'r Arg<'_>) -> Result<Self, BusError> {
        match arg {
            Arg::Array(array) => array.elements.iter().map(T::from_arg).collect(),
            other => Err(BusError::mismatch("a", other.signature())),
        }
    }
}
