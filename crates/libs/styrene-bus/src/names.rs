//! Name grammars for object paths, bus names, interfaces, members and errors.

pub const MAX_NAME_LEN: usize = 255;

fn is_path_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// `/` alone, or one or more `/segment` parts where each segment is a
/// non-empty run of `[A-Za-z0-9_]`. No trailing slash.
pub fn is_legal_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| !segment.is_empty() && segment.bytes().all(is_path_char))
}

fn is_element(element: &str, allow_leading_digit: bool, allow_dash: bool) -> bool {
    let mut bytes = element.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    let first_ok = first.is_ascii_alphabetic()
        || first == b'_'
        || (allow_dash && first == b'-')
        || (allow_leading_digit && first.is_ascii_digit());
    first_ok && bytes.all(|c| c.is_ascii_alphanumeric() || c == b'_' || (allow_dash && c == b'-'))
}

/// Connection-assigned name such as `:1.42`.
pub fn is_legal_unique_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    let Some(rest) = name.strip_prefix(':') else {
        return false;
    };
    let mut elements = rest.split('.');
    let count = elements.clone().count();
    count >= 2 && elements.all(|element| is_element(element, true, true))
}

/// Unique name or a well-known name such as `com.example.Service`.
pub fn is_legal_bus_name(name: &str) -> bool {
    if name.starts_with(':') {
        return is_legal_unique_name(name);
    }
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut elements = name.split('.');
    let count = elements.clone().count();
    count >= 2 && elements.all(|element| is_element(element, false, true))
}

pub fn is_legal_interface_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut elements = name.split('.');
    let count = elements.clone().count();
    count >= 2 && elements.all(|element| is_element(element, false, false))
}

/// Error names share the interface grammar.
pub fn is_legal_error_name(name: &str) -> bool {
    is_legal_interface_name(name)
}

pub fn is_legal_member_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && is_element(name, false, false)
}
