//! SQL literal helpers
//!
//! Values that end up inside generated statements are either quoted strings
//! or verified numbers. Nothing else is spliced into SQL text.

use crate::core::{Error, Result};

/// Escape a string for use inside a single-quoted SQL literal.
///
/// Single quotes become `\'` and backslashes become `\\`.
pub fn escape_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Quote `text` as a SQL string literal
pub fn quote(text: &str) -> String {
    format!("'{}'", escape_string(text))
}

/// Verify that `text` is a plain decimal number and return it trimmed.
///
/// Accepts an optional sign, digits and an optional fractional part.
pub fn check_number(text: &str) -> Result<String> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('+'))
        .unwrap_or(trimmed);

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    let valid = !int_part.is_empty()
        && all_digits(int_part)
        && frac_part.map_or(true, |f| !f.is_empty() && all_digits(f));

    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(Error::invalid_input(format!("Illegal numeric value: {:?}", text)))
    }
}

/// Render `value` as a literal, quoted or checked depending on the column
pub fn literal(value: &str, needs_quotes: bool) -> Result<String> {
    if needs_quotes {
        Ok(quote(value))
    } else {
        check_number(value)
    }
}
