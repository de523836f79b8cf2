//! Parses one slave reply: one or more lines terminated by an empty line.
//!
//! The first non-empty line begins with `'='` (success) or `'?'` (failure)
//! immediately followed by a decimal id, optionally a space and payload.
//! Subsequent lines continue the payload. Reading stops at the empty
//! terminator line (success: the id is returned) or at end-of-stream
//! (failure: the caller treats this identically to a transport error).

use std::io::{self, BufRead};
use std::{error, fmt};

#[derive(Debug)]
pub enum Error {
    /// The stream ended before an empty terminator line was seen.
    Eof,
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Eof => write!(f, "stream ended before reply terminator"),
            Error::Io(e) => write!(f, "{e}"),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

/// A fully-read reply: the id from its first line (`-1` if absent or
/// unparsable) and the raw bytes of every line up to (not including) the
/// empty terminator.
pub struct Reply {
    pub id: i64,
    pub raw: Vec<u8>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        self.raw.first() == Some(&b'=')
    }

    pub fn first_line(&self) -> &[u8] {
        match self.raw.iter().position(|&b| b == b'\n') {
            Some(idx) => &self.raw[..=idx],
            None => &self.raw,
        }
    }
}

/// Reads one reply from `r`. `r` should be positioned at the start of the
/// reply (i.e. right after the command that elicited it was flushed).
pub fn parse_reply<R: BufRead>(r: &mut R) -> Result<Reply, Error> {
    let mut raw = Vec::new();
    let mut id: Option<i64> = None;
    let mut first = true;

    loop {
        let mut line = String::new();
        let n = r.read_line(&mut line)?;
        if n == 0 {
            return Err(Error::Eof);
        }
        if line == "\n" {
            break;
        }
        if first {
            first = false;
            id = parse_id(&line);
        }
        raw.extend_from_slice(line.as_bytes());
    }

    Ok(Reply {
        id: id.unwrap_or(-1),
        raw,
    })
}

fn parse_id(line: &str) -> Option<i64> {
    let mut chars = line.chars();
    match chars.next() {
        Some('=') | Some('?') => {}
        _ => return None,
    }
    let digits: String = chars.take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_a_bare_success_reply() {
        let mut r = Cursor::new(b"=1234\n\n".to_vec());
        let reply = parse_reply(&mut r).unwrap();
        assert_eq!(reply.id, 1234);
        assert!(reply.is_success());
        assert_eq!(reply.raw, b"=1234\n");
    }

    #[test]
    fn parses_a_multiline_payload() {
        let mut r = Cursor::new(b"=1234 ok\nmore data\nlast line\n\n".to_vec());
        let reply = parse_reply(&mut r).unwrap();
        assert_eq!(reply.id, 1234);
        assert_eq!(reply.raw, b"=1234 ok\nmore data\nlast line\n");
    }

    #[test]
    fn parses_an_error_reply() {
        let mut r = Cursor::new(b"?1234 bad move\n\n".to_vec());
        let reply = parse_reply(&mut r).unwrap();
        assert_eq!(reply.id, 1234);
        assert!(!reply.is_success());
    }

    #[test]
    fn missing_terminator_before_eof_is_an_error() {
        let mut r = Cursor::new(b"=1234\nno terminator".to_vec());
        assert!(matches!(parse_reply(&mut r), Err(Error::Eof)));
    }

    #[test]
    fn immediate_eof_is_an_error() {
        let mut r = Cursor::new(Vec::new());
        assert!(matches!(parse_reply(&mut r), Err(Error::Eof)));
    }

    #[test]
    fn malformed_first_line_yields_id_negative_one() {
        let mut r = Cursor::new(b"garbage\n\n".to_vec());
        let reply = parse_reply(&mut r).unwrap();
        assert_eq!(reply.id, -1);
    }
}
