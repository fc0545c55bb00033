//! Request/response envelope codec for the ASCII line-oriented RPC format.
//!
//! Requests open with `VERB <proto-version>\r\n`, followed by
//! `Name: value\r\n` header lines and a blank line; an optional binary body
//! of `Content-length` bytes follows. Responses open with
//! `OK <cseq> <status>\r\n`. The short header format abbreviates the
//! envelope-level header names (`Cseq` -> `c`, `Content-length` -> `l`,
//! `Status` -> `s`, `Status-message` -> `m`); op-specific names are shared
//! by both formats.

use std::fmt;

use crate::rpc::Properties;
use crate::utils::MetaError;

/// Protocol version stamped into every request's first line.
pub const CLIENT_PROTO_VERSION: i32 = 114;

/// Envelope-level header names that the short format abbreviates.
const SHORT_NAMES: [(&str, &str); 4] = [
    ("Cseq", "c"),
    ("Content-length", "l"),
    ("Status", "s"),
    ("Status-message", "m"),
];

/// Maps a short envelope token back to its canonical header name, if it is
/// one of the abbreviated ones.
fn normalize_name(name: &str) -> &str {
    for (long, short) in SHORT_NAMES {
        if name == short {
            return long;
        }
    }
    name
}

/// Maps a canonical envelope header name to its short token, if it has one.
fn shorten_name(name: &str) -> &str {
    for (long, short) in SHORT_NAMES {
        if name == long {
            return short;
        }
    }
    name
}

/// Incremental writer for one request envelope.
#[derive(Debug)]
pub struct RequestWriter {
    buf: String,
    short: bool,
}

impl RequestWriter {
    /// Creates a writer in long or short header format.
    pub fn new(short: bool) -> Self {
        RequestWriter {
            buf: String::with_capacity(256),
            short,
        }
    }

    /// Writes the opening `VERB <proto-version>` line.
    pub fn verb(&mut self, verb: &str) -> &mut Self {
        self.buf.push_str(verb);
        self.buf.push(' ');
        self.buf.push_str(&CLIENT_PROTO_VERSION.to_string());
        self.buf.push_str("\r\n");
        self
    }

    /// Writes one `Name: value` header line, abbreviating envelope-level
    /// names when in short format.
    pub fn header(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        let name = if self.short { shorten_name(name) } else { name };
        self.buf.push_str(name);
        self.buf.push_str(": ");
        self.buf.push_str(&value.to_string());
        self.buf.push_str("\r\n");
        self
    }

    /// Writes a header only when the flag is set (flag headers carry `1`).
    pub fn flag(&mut self, name: &str, set: bool) -> &mut Self {
        if set {
            self.header(name, 1);
        }
        self
    }

    /// Appends a preformatted block of header lines verbatim. The block must
    /// already be `\r\n` terminated per line.
    pub fn raw(&mut self, block: &str) -> &mut Self {
        self.buf.push_str(block);
        self
    }

    /// Whether this writer abbreviates header names.
    pub fn is_short(&self) -> bool {
        self.short
    }

    /// Terminates the envelope with the blank line and returns the text.
    pub fn finish(mut self) -> String {
        self.buf.push_str("\r\n");
        self.buf
    }
}

/// Composes the default header block injected once per connection lifetime,
/// carrying the effective user/group identity. The returned block is
/// passed to ops as extra headers and emitted verbatim.
pub fn add_default_request_headers(
    short: bool,
    headers: &mut String,
    euser: i64,
    egroup: i64,
) {
    let _ = short; // identity names are shared by both formats
    if euser >= 0 {
        headers.push_str(&format!("Euser: {}\r\n", euser));
    }
    if egroup >= 0 {
        headers.push_str(&format!("Egroup: {}\r\n", egroup));
    }
}

/// Checksum over a request/response content body.
pub fn content_checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Splits one `Name: value` header line. Returns `None` on lines without a
/// colon separator.
fn split_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim(), value.trim()))
}

/// Parses a response header block into a normalized property bag. The first
/// line must read `OK <cseq> <status>`; remaining lines are `Name: value`
/// headers, short envelope tokens are folded to their canonical names. The
/// block ends at the first blank line; body bytes are not consumed here.
pub fn parse_response(text: &str) -> Result<Properties, MetaError> {
    let mut lines = text.split("\r\n");
    let first = lines
        .next()
        .ok_or_else(|| MetaError::msg("empty response header block"))?;

    let mut props = Properties::new();
    let mut tokens = first.split_ascii_whitespace();
    match tokens.next() {
        Some("OK") => {
            props.set("OK", "1");
            if let Some(cseq) = tokens.next() {
                props.set("Cseq", cseq);
            }
            if let Some(status) = tokens.next() {
                props.set("Status", status);
            }
        }
        _ => {
            return Err(MetaError(format!(
                "malformed response status line '{}'",
                first
            )));
        }
    }

    for line in lines {
        if line.is_empty() {
            break; // end of header block
        }
        let (name, value) = split_header_line(line).ok_or_else(|| {
            MetaError(format!("malformed response header line '{}'", line))
        })?;
        props.set(normalize_name(name), value);
    }

    if !props.contains("Cseq") || !props.contains("Status") {
        return Err(MetaError::msg("response missing Cseq or Status"));
    }
    if !props.contains("Content-length") {
        props.set("Content-length", "0");
    }
    Ok(props)
}

/// Parses a request header block, returning the verb and the header bag.
/// The counterpart of `parse_response` for the server-side path.
pub fn parse_request(text: &str) -> Result<(String, Properties), MetaError> {
    let mut lines = text.split("\r\n");
    let first = lines
        .next()
        .ok_or_else(|| MetaError::msg("empty request header block"))?;

    let mut tokens = first.split_ascii_whitespace();
    let verb = tokens
        .next()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            MetaError(format!("malformed request verb line '{}'", first))
        })?
        .to_string();

    let mut props = Properties::new();
    if let Some(vers) = tokens.next() {
        props.set("Client-Protocol-Version", vers);
    }
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = split_header_line(line).ok_or_else(|| {
            MetaError(format!("malformed request header line '{}'", line))
        })?;
        props.set(normalize_name(name), value);
    }
    Ok((verb, props))
}

#[cfg(test)]
mod envelope_tests {
    use super::*;

    #[test]
    fn emit_long_format() {
        let mut w = RequestWriter::new(false);
        w.verb("CREATE");
        w.header("Cseq", 7).header("Parent-handle", 2).flag("Exclusive", true);
        let text = w.finish();
        assert_eq!(
            text,
            format!(
                "CREATE {}\r\nCseq: 7\r\nParent-handle: 2\r\nExclusive: 1\r\n\r\n",
                CLIENT_PROTO_VERSION
            )
        );
    }

    #[test]
    fn emit_short_format() {
        let mut w = RequestWriter::new(true);
        w.verb("CREATE");
        w.header("Cseq", 7).header("Content-length", 128);
        let text = w.finish();
        assert!(text.contains("c: 7\r\n"));
        assert!(text.contains("l: 128\r\n"));
        assert!(!text.contains("Cseq"));
    }

    #[test]
    fn parse_response_ok() -> Result<(), MetaError> {
        let props = parse_response(
            "OK 42 0\r\nContent-length: 16\r\nFile-handle: 99\r\n\r\n",
        )?;
        assert_eq!(props.get_i64("Cseq", -1), 42);
        assert_eq!(props.get_i32("Status", -1), 0);
        assert_eq!(props.get_i64("Content-length", -1), 16);
        assert_eq!(props.get_i64("File-handle", -1), 99);
        Ok(())
    }

    #[test]
    fn parse_response_short_normalized() -> Result<(), MetaError> {
        let props =
            parse_response("OK 42 -1\r\nl: 0\r\nm: no such file\r\n\r\n")?;
        assert_eq!(props.get_i64("Content-length", -1), 0);
        assert_eq!(props.get_str("Status-message"), "no such file");
        Ok(())
    }

    #[test]
    fn parse_response_malformed() {
        assert!(parse_response("NOPE 1 2\r\n\r\n").is_err());
        assert!(parse_response("OK 1 0\r\nbroken line\r\n\r\n").is_err());
    }

    #[test]
    fn parse_request_roundtrip() -> Result<(), MetaError> {
        let mut w = RequestWriter::new(false);
        w.verb("MKDIR");
        w.header("Cseq", 3).header("Directory", "logs");
        let (verb, props) = parse_request(&w.finish())?;
        assert_eq!(verb, "MKDIR");
        assert_eq!(
            props.get_i32("Client-Protocol-Version", -1),
            CLIENT_PROTO_VERSION
        );
        assert_eq!(props.get_i64("Cseq", -1), 3);
        assert_eq!(props.get_str("Directory"), "logs");
        Ok(())
    }
}
