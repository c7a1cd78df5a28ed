//! Delimited row encoding and decoding.
//!
//! Exported fields are written as raw bytes with an optional double-quote
//! enclosure decided by [`QuoteMode`]; SQL NULL becomes the bare literal
//! `NULL`. Import splitting reverses the enclosure (including doubled
//! inner quotes) but deliberately nothing more; value-level escape
//! dialects are out of scope.

use crate::config::QuoteMode;
use crate::db::{FieldMeta, FieldType, Row};

/// Encodes result rows into delimited lines.
pub struct RowFormatter {
    separator: Vec<u8>,
    quote: QuoteMode,
    is_string: Vec<bool>,
}

impl RowFormatter {
    #[must_use]
    pub fn new(separator: &str, quote: QuoteMode, columns: &[FieldMeta]) -> Self {
        Self {
            separator: separator.as_bytes().to_vec(),
            quote,
            is_string: columns.iter().map(|c| c.ty == FieldType::String).collect(),
        }
    }

    /// Append one encoded row, terminated by '\n'.
    pub fn write_row(&self, out: &mut Vec<u8>, row: &Row) {
        for (index, value) in row.iter().enumerate() {
            if index > 0 {
                out.extend_from_slice(&self.separator);
            }
            match value {
                None => out.extend_from_slice(b"NULL"),
                Some(bytes) => self.write_field(out, bytes, self.is_string.get(index).copied().unwrap_or(false)),
            }
        }
        out.push(b'\n');
    }

    fn write_field(&self, out: &mut Vec<u8>, value: &[u8], is_string: bool) {
        let enclose = match self.quote {
            QuoteMode::None => false,
            QuoteMode::Force => true,
            QuoteMode::Auto => is_string && self.needs_quote(value),
        };
        if enclose {
            out.push(b'"');
            for &b in value {
                if b == b'"' {
                    out.push(b'"');
                }
                out.push(b);
            }
            out.push(b'"');
        } else {
            out.extend_from_slice(value);
        }
    }

    /// A string field is enclosed when it contains the separator, a quote,
    /// or a line terminator.
    fn needs_quote(&self, value: &[u8]) -> bool {
        value.iter().any(|&b| b == b'"' || b == b'\r' || b == b'\n')
            || (!self.separator.is_empty()
                && value
                    .windows(self.separator.len())
                    .any(|w| w == self.separator.as_slice()))
    }

    /// Header record built from column names, same quote policy as data.
    #[must_use]
    pub fn header_row(&self, columns: &[FieldMeta]) -> Vec<u8> {
        let mut out = Vec::new();
        for (index, column) in columns.iter().enumerate() {
            if index > 0 {
                out.extend_from_slice(&self.separator);
            }
            self.write_field(&mut out, column.name.as_bytes(), true);
        }
        out.push(b'\n');
        out
    }
}

/// Split one framed record into field values, undoing quote enclosure.
///
/// A field starting with '"' runs to the matching close quote, with `""`
/// decoding to one quote; anything else runs to the next separator.
#[must_use]
pub fn split_fields(line: &str, separator: &str) -> Vec<String> {
    let bytes = line.as_bytes();
    let sep = separator.as_bytes();
    let mut fields = Vec::new();
    let mut pos = 0;
    loop {
        if bytes.get(pos) == Some(&b'"') {
            let mut field = Vec::new();
            let mut i = pos + 1;
            while i < bytes.len() {
                if bytes[i] == b'"' {
                    if bytes.get(i + 1) == Some(&b'"') {
                        field.push(b'"');
                        i += 2;
                    } else {
                        i += 1;
                        break;
                    }
                } else {
                    field.push(bytes[i]);
                    i += 1;
                }
            }
            fields.push(String::from_utf8_lossy(&field).into_owned());
            if i >= bytes.len() {
                return fields;
            }
            // Skip the separator following the close quote.
            pos = i + sep.len();
        } else {
            match find_separator(bytes, sep, pos) {
                Some(next) => {
                    fields.push(String::from_utf8_lossy(&bytes[pos..next]).into_owned());
                    pos = next + sep.len();
                }
                None => {
                    fields.push(String::from_utf8_lossy(&bytes[pos..]).into_owned());
                    return fields;
                }
            }
        }
    }
}

fn find_separator(bytes: &[u8], sep: &[u8], from: usize) -> Option<usize> {
    if sep.is_empty() || bytes.len() < sep.len() {
        return None;
    }
    (from..=bytes.len() - sep.len()).find(|&i| &bytes[i..i + sep.len()] == sep)
}
