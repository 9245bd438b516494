//! Balanced-delimiter scanning.
//!
//! Shared by the inline tool-call codec (JSON objects embedded in free
//! text) and the `\boxed{...}` answer extractor (LaTeX groups). Both need
//! to find the delimiter that closes a given opener while ignoring nested
//! pairs and delimiters that only appear as data.

/// How quoted or escaped content is treated while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoting {
    /// JSON rules: delimiters inside `"..."` strings are data, and `\`
    /// escapes the next character only inside strings.
    Json,
    /// LaTeX rules: no string literals, but `\{` and `\}` are literal
    /// braces.
    Latex,
}

/// Returns the closing delimiter that pairs with the opener at `open_at`.
///
/// The opener must be one of `{`, `[` or `(`; any other byte (or an
/// out-of-range index) yields `None`. The returned index points at the
/// closing delimiter itself. `None` means the group is never closed.
#[must_use]
pub fn matching_close(text: &str, open_at: usize, quoting: Quoting) -> Option<usize> {
    let bytes = text.as_bytes();
    let open = *bytes.get(open_at)?;
    let close = match open {
        b'{' => b'}',
        b'[' => b']',
        b'(' => b')',
        _ => return None,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = open_at;

    while i < bytes.len() {
        let b = bytes[i];
        match quoting {
            Quoting::Json if in_string => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == b'"' {
                    in_string = false;
                }
            }
            Quoting::Json if b == b'"' => in_string = true,
            Quoting::Latex if b == b'\\' => {
                i += 2;
                continue;
            }
            _ => {
                if b == open {
                    depth += 1;
                } else if b == close {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
            }
        }
        i += 1;
    }

    None
}

/// Finds the first complete JSON object starting at or after `from`.
///
/// Returns the byte range `(start, end_exclusive)` of the object text.
/// Openers that are never closed are skipped.
#[must_use]
pub fn find_json_object(text: &str, from: usize) -> Option<(usize, usize)> {
    let mut search = from;
    while search < text.len() {
        let rel = text.get(search..)?.find('{')?;
        let start = search + rel;
        if let Some(end) = matching_close(text, start, Quoting::Json) {
            return Some((start, end + 1));
        }
        search = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_simple_object() {
        let text = r#"{"a": 1}"#;
        assert_eq!(matching_close(text, 0, Quoting::Json), Some(text.len() - 1));
    }

    #[test]
    fn test_nested_object() {
        let text = r#"{"a": {"b": {"c": [1, 2]}}} trailing"#;
        let end = matching_close(text, 0, Quoting::Json).unwrap_or_else(|| unreachable!());
        assert_eq!(&text[..=end], r#"{"a": {"b": {"c": [1, 2]}}}"#);
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let text = r#"{"code": "fn main() { println!(\"}\"); }"} after"#;
        let end = matching_close(text, 0, Quoting::Json).unwrap_or_else(|| unreachable!());
        assert!(text[end + 1..].starts_with(" after"));
    }

    #[test]
    fn test_unclosed_returns_none() {
        assert_eq!(matching_close(r#"{"a": {"b": 1}"#, 0, Quoting::Json), None);
    }

    #[test]
    fn test_non_opener_returns_none() {
        assert_eq!(matching_close("abc", 0, Quoting::Json), None);
        assert_eq!(matching_close("{", 5, Quoting::Json), None);
    }

    #[test]
    fn test_latex_escaped_braces() {
        let text = r"{\{1, 2\}} rest";
        let end = matching_close(text, 0, Quoting::Latex).unwrap_or_else(|| unreachable!());
        assert_eq!(&text[..=end], r"{\{1, 2\}}");
    }

    #[test]
    fn test_latex_quotes_are_plain_text() {
        let text = r#"{say "}" here"#;
        assert_eq!(matching_close(text, 0, Quoting::Latex), Some(6));
    }

    #[test]
    fn test_find_json_object_skips_prose() {
        let text = r#"I will call {broken and then {"name": "x"} done"#;
        let (start, end) = find_json_object(text, 0).unwrap_or_else(|| unreachable!());
        assert_eq!(&text[start..end], r#"{"name": "x"}"#);
    }

    #[test]
    fn test_find_json_object_none() {
        assert_eq!(find_json_object("no objects here", 0), None);
    }

    proptest! {
        #[test]
        fn prop_serialized_json_is_balanced(
            key in ".{0,12}",
            value in ".{0,24}",
            depth in 0usize..4,
        ) {
            let mut v = serde_json::json!({ key.clone(): value });
            for _ in 0..depth {
                v = serde_json::json!({ "inner": v, "s": "}{" });
            }
            let text = serde_json::to_string(&v).unwrap_or_default();
            let padded = format!("{text} tail }}");
            let end = matching_close(&padded, 0, Quoting::Json);
            prop_assert_eq!(end, Some(text.len() - 1));
        }
    }
}
