//! Response frame: `CODE SP DESCR CR LF DLEN SP <DLEN bytes of DATA> CR LF`.

use crate::codec::cursor::{parse_decimal, split_first_space, Cursor};
use crate::codec::{ParseOutcome, MAX_BUF};
use crate::error::{ProtocolError, ResponseCode};

/// A fully parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub descr: Vec<u8>,
    pub data: Vec<u8>,
}

impl Response {
    /// Build a response from a [`ResponseCode`] and description.
    pub fn new(code: ResponseCode, descr: impl Into<Vec<u8>>, data: Vec<u8>) -> Self {
        Response {
            code: code.code(),
            descr: descr.into(),
            data,
        }
    }
}

/// Parse one response out of the front of `buf`.
pub fn parse_response(buf: &[u8]) -> Result<ParseOutcome<Response>, ProtocolError> {
    let mut cursor = Cursor::new(buf);

    let line = match cursor.take_line() {
        Some(l) => l,
        None => return Ok(ParseOutcome::Incomplete),
    };
    let (code_token, descr) = split_first_space(line);
    let code = parse_decimal(code_token)
        .ok_or_else(|| ProtocolError::Syntax(format!("invalid response code {:?}", String::from_utf8_lossy(code_token))))?;
    if code > u16::MAX as u64 {
        return Err(ProtocolError::Syntax("response code out of range".into()));
    }

    let rem = cursor.remaining();
    let space_at = match rem.iter().position(|&b| b == b' ') {
        Some(idx) => idx,
        None => return Ok(ParseOutcome::Incomplete),
    };
    let dlen = parse_decimal(&rem[..space_at])
        .ok_or_else(|| ProtocolError::Syntax("invalid DLEN".into()))?;
    if dlen as usize > MAX_BUF {
        return Err(ProtocolError::BufferCapExceeded);
    }
    cursor.take(space_at + 1).expect("checked above");

    let data = match cursor.take(dlen as usize) {
        Some(d) => d.to_vec(),
        None => return Ok(ParseOutcome::Incomplete),
    };

    let rem = cursor.remaining();
    if rem.len() < 2 {
        return Ok(ParseOutcome::Incomplete);
    }
    if &rem[..2] != b"\r\n" {
        return Err(ProtocolError::Syntax("missing CRLF after data".into()));
    }
    cursor.take(2);

    Ok(ParseOutcome::Complete(
        Response {
            code: code as u16,
            descr: descr.to_vec(),
            data,
        },
        cursor.consumed(),
    ))
}

/// Encode a response as bytes.
pub fn emit_response(code: u16, descr: &[u8], data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() > MAX_BUF {
        return Err(ProtocolError::BufferCapExceeded);
    }
    let mut out = Vec::with_capacity(descr.len() + data.len() + 32);
    out.extend_from_slice(code.to_string().as_bytes());
    if !descr.is_empty() {
        out.push(b' ');
        out.extend_from_slice(descr);
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    if out.len() > MAX_BUF {
        return Err(ProtocolError::BufferCapExceeded);
    }
    Ok(out)
}
