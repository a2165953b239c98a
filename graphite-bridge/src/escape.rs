//! Escaping of label text into Carbon-path-safe text and back.
//!
//! Graphite paths are flat, dot-delimited strings, and whisper stores each
//! node as a file name, so label names and values have to be squeezed into a
//! restricted alphabet before they can be written as path nodes. The grammar
//! Graphite-web uses to parse targets defines the legal set as
//! `printables - symbols + escaped(symbols)`.
//!
//! [`escape`] walks the input byte by byte:
//!
//! - `.`, `%`, `/` and `=` are percent-encoded. `.` separates path nodes,
//!   `%` introduces an encoded byte, `/` is illegal in file names and `=`
//!   separates tag names from values.
//! - `(){},='"\` are kept but prefixed with a backslash.
//! - Any other printable ASCII byte is copied as is.
//! - Everything else (space, control bytes, every byte of a multi-byte UTF-8
//!   sequence) is percent-encoded as `%XX` with uppercase hex digits.
//!
//! The encoding is the on-disk contract with a Graphite backend populated by
//! earlier writes, so it must stay byte-for-byte stable.
//!
//! ```
//! use graphite_bridge::escape::{escape, unescape};
//!
//! assert_eq!(escape("foo_bar%42"), b"foo_bar%2542");
//! assert_eq!(escape("http://example.org:8080"), b"http:%2F%2Fexample%2Eorg:8080");
//! assert_eq!(unescape("http:%2F%2Fexample%2Eorg:8080"), "http://example.org:8080");
//! ```

/// Bytes that Graphite-web accepts only when backslash-escaped.
const SYMBOLS: &[u8] = b"(){},=.'\"\\";

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

fn is_printable(b: u8) -> bool {
    b.is_ascii_graphic()
}

fn is_symbol(b: u8) -> bool {
    SYMBOLS.contains(&b)
}

fn push_percent(out: &mut Vec<u8>, b: u8) {
    out.push(b'%');
    out.push(HEX_UPPER[usize::from(b >> 4)]);
    out.push(HEX_UPPER[usize::from(b & 0x0F)]);
}

/// Escapes a label name or value for use as a plain Carbon path node.
///
/// The result is always ASCII.
///
/// # Examples
///
/// ```
/// use graphite_bridge::escape::escape;
///
/// assert_eq!(escape("foo-bar-42"), b"foo-bar-42");
/// assert_eq!(escape("日"), b"%E6%97%A5");
/// assert_eq!(escape("Björn's email"), b"Bj%C3%B6rn\\'s%20email");
/// ```
pub fn escape(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() * 2);
    for &b in value.as_bytes() {
        match b {
            b'.' | b'%' | b'/' | b'=' => push_percent(&mut out, b),
            b if is_symbol(b) => {
                out.push(b'\\');
                out.push(b);
            }
            b if is_printable(b) => out.push(b),
            b => push_percent(&mut out, b),
        }
    }
    out
}

/// Escapes a tag name or value for the Carbon tags format.
///
/// Unlike [`escape`], the tag separators `;`, `~`, space and `=` are replaced
/// with `_`, and no backslash escaping happens. This is the shape Graphite
/// clusters backed by a tag index (and the Prometheus datasources reading from
/// them) expect.
///
/// # Examples
///
/// ```
/// use graphite_bridge::escape::escape_tagged;
///
/// assert_eq!(escape_tagged("foo bar 42"), b"foo_bar_42");
/// assert_eq!(escape_tagged("foo_bar~42;bar=42"), b"foo_bar_42_bar_42");
/// assert_eq!(escape_tagged("日"), b"%E6%97%A5");
/// ```
pub fn escape_tagged(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() * 2);
    for &b in value.as_bytes() {
        match b {
            b';' | b'~' | b' ' | b'=' => out.push(b'_'),
            b if is_printable(b) => out.push(b),
            b => push_percent(&mut out, b),
        }
    }
    out
}

/// Reverses [`escape`].
///
/// Percent-encoded bytes are decoded first, then escaping backslashes are
/// removed. A backslash survives only when the byte after it is not one of
/// the escapable symbols, so a literal backslash that preceded a symbol in the
/// original text is lost. Stored paths depend on this behavior.
///
/// Malformed percent sequences (a `%` not followed by two hex digits) are
/// kept literally. Bytes that do not form valid UTF-8 after decoding are
/// replaced with U+FFFD.
pub fn unescape(value: &str) -> String {
    let decoded = percent_decode(value.as_bytes());

    let mut out = Vec::with_capacity(decoded.len());
    for (i, &b) in decoded.iter().enumerate() {
        if b == b'\\'
            && let Some(&next) = decoded.get(i + 1)
            && is_symbol(next)
        {
            continue;
        }
        out.push(b);
    }

    match String::from_utf8(out) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%'
            && let (Some(hi), Some(lo)) = (
                input.get(i + 1).copied().and_then(hex_value),
                input.get(i + 2).copied().and_then(hex_value),
            )
        {
            out.push((hi << 4) | lo);
            i += 3;
            continue;
        }
        out.push(input[i]);
        i += 1;
    }
    out
}
