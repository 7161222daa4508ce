//! LDIF line encoding used by the replication log.
//!
//! Values that are not plain printable ASCII are written base64-encoded
//! (`attr:: ...`) and long lines are folded, so that any byte string survives
//! a write/read cycle of the log unchanged.

use crate::error::ParseError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Maximum width of an output line before it is folded.
pub const LINE_WIDTH: usize = 76;

/// Returns true if `value` can be written verbatim after `attr: `.
pub fn is_safe(value: &[u8]) -> bool {
    if value.is_empty() {
        return true;
    }
    if matches!(value[0], b' ' | b':' | b'<') || value[value.len() - 1] == b' ' {
        return false;
    }
    value.iter().all(|b| (0x20..=0x7e).contains(b))
}

/// Append one `attr: value` line (folded, newline-terminated) to `out`.
pub fn put_value(out: &mut String, attr: &str, value: &[u8]) {
    let line = if value.is_empty() {
        format!("{}:", attr)
    } else if is_safe(value) {
        // is_safe guarantees printable ASCII
        format!("{}: {}", attr, String::from_utf8_lossy(value))
    } else {
        format!("{}:: {}", attr, STANDARD.encode(value))
    };
    put_folded(out, &line);
}

/// Append `line` to `out`, folding it at [`LINE_WIDTH`] columns.
pub fn put_folded(out: &mut String, line: &str) {
    let mut width = 0;
    for ch in line.chars() {
        if width >= LINE_WIDTH {
            out.push('\n');
            out.push(' ');
            width = 1;
        }
        out.push(ch);
        width += 1;
    }
    out.push('\n');
}

/// Split a paragraph into logical lines.
///
/// Continuation lines (leading single space) are joined to the previous
/// line, `#` comments are dropped and trailing carriage returns stripped.
pub fn logical_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut in_comment = false;
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix(' ') {
            if in_comment {
                continue;
            }
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if raw.starts_with('#') {
            in_comment = true;
            continue;
        }
        in_comment = false;
        if raw.is_empty() {
            continue;
        }
        lines.push(raw.to_string());
    }
    lines
}

/// Parse one logical line into its attribute type and raw value.
pub fn parse_line(line: &str) -> Result<(String, Vec<u8>), ParseError> {
    let colon = line
        .find(':')
        .ok_or_else(|| ParseError::new(format!("missing ':' in line {:?}", line)))?;
    let attr = line[..colon].trim();
    if attr.is_empty() {
        return Err(ParseError::new(format!("empty attribute type in line {:?}", line)));
    }
    let rest = &line[colon + 1..];
    let value = if let Some(encoded) = rest.strip_prefix(':') {
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| ParseError::new(format!("bad base64 value for {}: {}", attr, e)))?
    } else if rest.starts_with('<') {
        return Err(ParseError::new(format!(
            "URL values are not supported (attribute {})",
            attr
        )));
    } else {
        rest.trim_start_matches(' ').as_bytes().to_vec()
    };
    Ok((attr.to_string(), value))
}

/// Interpret a raw value as UTF-8 text.
pub fn value_to_string(attr: &str, value: Vec<u8>) -> Result<String, ParseError> {
    String::from_utf8(value)
        .map_err(|_| ParseError::new(format!("value of {} is not valid UTF-8", attr)))
}
