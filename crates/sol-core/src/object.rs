//! Type names and chunk identifiers.

use crate::value::TValue;

/// Maximum size of a printable chunk id, including room for a terminator
/// in the reference layout; produced ids are at most `ID_SIZE - 1` bytes.
pub const ID_SIZE: usize = 60;

const PREFIX: &str = "[string \"";
const SUFFIX: &str = "\"]";
const DOTS: &str = "...";

/// The Sol type name for a value.
pub fn type_name(val: TValue) -> &'static str {
    match val {
        TValue::Nil => "nil",
        TValue::Boolean(_) => "boolean",
        TValue::Integer(_) | TValue::Float(_) => "number",
        TValue::Str(_) => "string",
        TValue::Table(_) => "table",
        TValue::Closure(_) | TValue::Native(_) => "function",
    }
}

/// Collapse a chunk source identifier into a printable form.
///
/// The leading marker selects the shape: `=name` keeps `name` verbatim
/// (truncated at the tail), `@file` keeps the tail of the file path with a
/// leading `...` when it does not fit, and anything else is treated as
/// chunk text and rendered `[string "first line..."]`.
pub fn chunk_id(source: &[u8]) -> String {
    let max = ID_SIZE - 1;
    match source.first() {
        Some(b'=') => {
            let body = &source[1..];
            let take = body.len().min(max);
            String::from_utf8_lossy(&body[..take]).into_owned()
        }
        Some(b'@') => {
            let body = &source[1..];
            if body.len() <= max {
                String::from_utf8_lossy(body).into_owned()
            } else {
                let keep = max - DOTS.len();
                format!(
                    "{}{}",
                    DOTS,
                    String::from_utf8_lossy(&body[body.len() - keep..])
                )
            }
        }
        _ => {
            let room = max - PREFIX.len() - SUFFIX.len() - DOTS.len();
            let nl = source.iter().position(|&b| b == b'\n');
            let line = &source[..nl.unwrap_or(source.len())];
            if nl.is_none() && line.len() < room {
                format!("{}{}{}", PREFIX, String::from_utf8_lossy(line), SUFFIX)
            } else {
                let take = line.len().min(room);
                format!(
                    "{}{}{}{}",
                    PREFIX,
                    String::from_utf8_lossy(&line[..take]),
                    DOTS,
                    SUFFIX
                )
            }
        }
    }
}
