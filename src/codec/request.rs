//! Request frame: `CMD SP ARG CR LF DLEN SP <DLEN bytes of DATA> CR LF`.

use std::fmt;

use crate::codec::cursor::{parse_decimal, split_first_space, Cursor};
use crate::codec::{ParseOutcome, MAX_BUF};
use crate::error::ProtocolError;

/// The set of commands a client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Append,
    Close,
    Lock,
    Open,
    OpenC,
    OpenCl,
    OpenL,
    Quit,
    Read,
    ReadN,
    Remove,
    Unlock,
    Write,
}

impl Command {
    fn from_bytes(b: &[u8]) -> Option<Command> {
        Some(match b {
            b"APPEND" => Command::Append,
            b"CLOSE" => Command::Close,
            b"LOCK" => Command::Lock,
            b"OPEN" => Command::Open,
            b"OPENC" => Command::OpenC,
            b"OPENCL" => Command::OpenCl,
            b"OPENL" => Command::OpenL,
            b"QUIT" => Command::Quit,
            b"READ" => Command::Read,
            b"READN" => Command::ReadN,
            b"REMOVE" => Command::Remove,
            b"UNLOCK" => Command::Unlock,
            b"WRITE" => Command::Write,
            _ => return None,
        })
    }

    /// The wire spelling of this command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Append => "APPEND",
            Command::Close => "CLOSE",
            Command::Lock => "LOCK",
            Command::Open => "OPEN",
            Command::OpenC => "OPENC",
            Command::OpenCl => "OPENCL",
            Command::OpenL => "OPENL",
            Command::Quit => "QUIT",
            Command::Read => "READ",
            Command::ReadN => "READN",
            Command::Remove => "REMOVE",
            Command::Unlock => "UNLOCK",
            Command::Write => "WRITE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: Command,
    pub arg: Vec<u8>,
    pub data: Vec<u8>,
}

impl Request {
    /// Interpret `arg` as a pathname. Does not validate the leading `/`;
    /// that is a dispatcher-level precondition, not a framing concern.
    pub fn arg_str(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.arg)
            .map_err(|_| ProtocolError::Syntax("argument is not valid UTF-8".into()))
    }

    /// Interpret `arg` as a signed decimal integer (used by `READN`, whose
    /// count may be `<= 0` to mean "all files").
    pub fn arg_i64(&self) -> Result<i64, ProtocolError> {
        let s = self.arg_str()?;
        s.parse::<i64>()
            .map_err(|_| ProtocolError::Syntax(format!("argument {s:?} is not an integer")))
    }
}

/// Parse one request out of the front of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<ParseOutcome<Request>, ProtocolError> {
    let mut cursor = Cursor::new(buf);

    // CMD SP ARG CR LF
    let line = match cursor.take_line() {
        Some(l) => l,
        None => return Ok(ParseOutcome::Incomplete),
    };
    let (cmd_token, arg) = split_first_space(line);
    let cmd = Command::from_bytes(cmd_token).ok_or_else(|| {
        ProtocolError::Syntax(format!(
            "unknown command {:?}",
            String::from_utf8_lossy(cmd_token)
        ))
    })?;
    if cmd == Command::Quit && !arg.is_empty() {
        return Err(ProtocolError::Syntax("QUIT must not carry an argument".into()));
    }

    // DLEN SP
    let dlen = match take_dlen(&mut cursor)? {
        Some(n) => n,
        None => return Ok(ParseOutcome::Incomplete),
    };
    if dlen as usize > MAX_BUF {
        return Err(ProtocolError::BufferCapExceeded);
    }

    // <DLEN bytes of DATA>
    let data = match cursor.take(dlen as usize) {
        Some(d) => d.to_vec(),
        None => return Ok(ParseOutcome::Incomplete),
    };

    // CR LF
    let rem = cursor.remaining();
    if rem.len() < 2 {
        return Ok(ParseOutcome::Incomplete);
    }
    if &rem[..2] != b"\r\n" {
        return Err(ProtocolError::Syntax("missing CRLF after data".into()));
    }
    cursor.take(2);

    Ok(ParseOutcome::Complete(
        Request {
            cmd,
            arg: arg.to_vec(),
            data,
        },
        cursor.consumed(),
    ))
}

/// Read `DLEN SP`, returning `None` if the digits (and following space)
/// are not yet fully buffered.
fn take_dlen(cursor: &mut Cursor<'_>) -> Result<Option<u64>, ProtocolError> {
    let rem = cursor.remaining();
    let space_at = match rem.iter().position(|&b| b == b' ') {
        Some(idx) => idx,
        None => return Ok(None),
    };
    let token = &rem[..space_at];
    let dlen = parse_decimal(token)
        .ok_or_else(|| ProtocolError::Syntax(format!("invalid DLEN {:?}", String::from_utf8_lossy(token))))?;
    cursor.take(space_at + 1).expect("checked above");
    Ok(Some(dlen))
}

/// Encode a request as bytes.
pub fn emit_request(cmd: Command, arg: &[u8], data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() > MAX_BUF {
        return Err(ProtocolError::BufferCapExceeded);
    }
    let mut out = Vec::with_capacity(cmd.as_str().len() + arg.len() + data.len() + 32);
    out.extend_from_slice(cmd.as_str().as_bytes());
    if !arg.is_empty() {
        out.push(b' ');
        out.extend_from_slice(arg);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_simple() {
        let bytes = emit_request(Command::Write, b"/a", b"hello").unwrap();
        let ParseOutcome::Complete(req, n) = parse_request(&bytes).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(n, bytes.len());
        assert_eq!(req.cmd, Command::Write);
        assert_eq!(req.arg, b"/a");
        assert_eq!(req.data, b"hello");
    }

    #[test]
    fn quit_has_no_argument() {
        let bytes = emit_request(Command::Quit, b"", b"").unwrap();
        let ParseOutcome::Complete(req, _) = parse_request(&bytes).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(req.cmd, Command::Quit);
        assert!(req.arg.is_empty());
    }

    #[test]
    fn incomplete_mid_header() {
        let bytes = b"WRITE /a\r\n";
        assert_eq!(parse_request(bytes).unwrap(), ParseOutcome::Incomplete);
    }

    #[test]
    fn incomplete_mid_data() {
        let bytes = b"WRITE /a\r\n5 he";
        assert_eq!(parse_request(bytes).unwrap(), ParseOutcome::Incomplete);
    }

    #[test]
    fn unknown_command_is_syntax_error() {
        let bytes = b"BOGUS /a\r\n0 \r\n";
        assert!(parse_request(bytes).is_err());
    }

    #[test]
    fn non_numeric_dlen_is_syntax_error() {
        let bytes = b"OPEN /a\r\nxx \r\n";
        assert!(parse_request(bytes).is_err());
    }

    #[test]
    fn concatenated_frames_parse_independently() {
        let mut bytes = emit_request(Command::Open, b"/a", b"").unwrap();
        let second = emit_request(Command::Close, b"/a", b"").unwrap();
        bytes.extend_from_slice(&second);

        let ParseOutcome::Complete(req1, n1) = parse_request(&bytes).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(req1.cmd, Command::Open);
        let ParseOutcome::Complete(req2, n2) = parse_request(&bytes[n1..]).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(req2.cmd, Command::Close);
        assert_eq!(n1 + n2, bytes.len());
    }

    #[test]
    fn readn_argument_accepts_negative() {
        let bytes = emit_request(Command::ReadN, b"-1", b"").unwrap();
        let ParseOutcome::Complete(req, _) = parse_request(&bytes).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(req.arg_i64().unwrap(), -1);
    }
}
