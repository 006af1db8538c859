//! UTF-8 safe string helpers.
//!
//! Previews and truncation take the first N Unicode scalar values (chars)
//! instead of slicing by byte index, which can panic on multibyte characters.
//! Also hosts the key-casing conversions used by schema auto-correction.

/// Return the first `n` characters of `s` as a `String` (no ellipsis).
pub fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Return a preview of `s` up to `n` characters. If `s` is longer than `n`
/// characters, the returned string will include a trailing ellipsis `...`.
pub fn preview(s: &str, n: usize) -> String {
    let mut prefix = prefix_chars(s, n);
    if s.chars().count() > n {
        prefix.push_str("...");
    }
    prefix
}

/// Truncate `s` to at most `max` characters, appending a marker that records
/// the original length. Returns `s` unchanged when it already fits.
pub fn truncate_with_marker(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_string();
    }
    format!(
        "{}\n...[truncated from {} to {} chars]",
        prefix_chars(s, max),
        total,
        max
    )
}

/// `user_name` -> `userName`. Strings without underscores are returned as-is.
pub fn snake_to_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = false;
    for (i, c) in s.chars().enumerate() {
        if c == '_' && i > 0 {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// `userName` -> `user_name`. Already-snake strings are returned as-is.
pub fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_basic_ascii() {
        let s = "hello world";
        assert_eq!(preview(s, 5), "hello...");
        assert_eq!(preview(s, 20), "hello world");
    }

    #[test]
    fn preview_multibyte_characters() {
        let s = "数据库连接超时，请稍后重试";
        let p = preview(s, 4);
        assert_eq!(p, "数据库连...");
    }

    #[test]
    fn truncate_marker_records_lengths() {
        let s = "a".repeat(30);
        let t = truncate_with_marker(&s, 10);
        assert!(t.starts_with(&"a".repeat(10)));
        assert!(t.contains("truncated from 30 to 10 chars"));
        assert_eq!(truncate_with_marker("short", 10), "short");
    }

    #[test]
    fn casing_conversions() {
        assert_eq!(snake_to_camel("file_path"), "filePath");
        assert_eq!(snake_to_camel("max_result_count"), "maxResultCount");
        assert_eq!(snake_to_camel("plain"), "plain");
        assert_eq!(snake_to_camel("_private"), "_private");
        assert_eq!(camel_to_snake("filePath"), "file_path");
        assert_eq!(camel_to_snake("maxResultCount"), "max_result_count");
        assert_eq!(camel_to_snake("plain"), "plain");
    }
}
