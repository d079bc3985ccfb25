//! Delimiter based string splitting used by device lists and checkpoint names.

/// Split `s` on every occurrence of `delim`.
///
/// Empty fields are kept, so the result always has one more entry than
/// there are delimiters and `join_str(&split_str(s, d), d) == s`.
/// Splitting the empty string yields `[""]`.
pub fn split_str(s: &str, delim: char) -> Vec<&str> {
    s.split(delim).collect()
}

/// Inverse of [`split_str`].
pub fn join_str<S: AsRef<str>>(fields: &[S], delim: char) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(delim);
        }
        out.push_str(field.as_ref());
    }
    out
}
