//! Embedded file-list payload: a concatenation of self-delimiting
//! records used inside the `DATA` field of several responses (evicted
//! files, `READ`, `READN`, ...).
//!
//! ```text
//! PATHNAME SP SIZE SP <SIZE bytes> SP
//! ```

use crate::codec::cursor::{parse_decimal, Cursor};
use crate::codec::{ParseOutcome, MAX_BUF};
use crate::error::ProtocolError;

/// One `(pathname, size, bytes)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub pathname: Vec<u8>,
    pub bytes: Vec<u8>,
}

/// Parse every record in `buf`, which is expected to hold zero or more
/// complete records and nothing else. Returns `Incomplete` if the last
/// record is truncated (relevant if a caller ever streams a `DATA`
/// field in before it is fully buffered; `storaged` itself always calls
/// this on an already-complete field, so in practice only `Complete` or
/// a hard parse error is observed).
pub fn parse_data_field(buf: &[u8]) -> Result<ParseOutcome<Vec<Record>>, ProtocolError> {
    let mut cursor = Cursor::new(buf);
    let mut records = Vec::new();

    while !cursor.remaining().is_empty() {
        let rem = cursor.remaining();
        let space_at = match rem.iter().position(|&b| b == b' ') {
            Some(idx) => idx,
            None => return Ok(ParseOutcome::Incomplete),
        };
        let pathname = rem[..space_at].to_vec();
        cursor.take(space_at + 1).expect("checked above");

        let rem = cursor.remaining();
        let space_at = match rem.iter().position(|&b| b == b' ') {
            Some(idx) => idx,
            None => return Ok(ParseOutcome::Incomplete),
        };
        let size = parse_decimal(&rem[..space_at])
            .ok_or_else(|| ProtocolError::Syntax("invalid record SIZE".into()))?;
        if size as usize > MAX_BUF {
            return Err(ProtocolError::BufferCapExceeded);
        }
        cursor.take(space_at + 1).expect("checked above");

        let bytes = match cursor.take(size as usize) {
            Some(b) => b.to_vec(),
            None => return Ok(ParseOutcome::Incomplete),
        };
        if cursor.take(1) != Some(&b" "[..]) {
            return Err(ProtocolError::Syntax("missing trailing SP after record data".into()));
        }

        records.push(Record { pathname, bytes });
    }

    Ok(ParseOutcome::Complete(records, cursor.consumed()))
}

/// Append one record (`PATHNAME SP SIZE SP <SIZE bytes> SP`) to `buf`,
/// returning the number of bytes written for this record.
pub fn emit_data_record(buf: &mut Vec<u8>, pathname: &[u8], bytes: &[u8]) -> Result<usize, ProtocolError> {
    let start = buf.len();
    let added = pathname.len() + 1 + bytes.len().to_string().len() + 1 + bytes.len() + 1;
    if buf.len() + added > MAX_BUF {
        return Err(ProtocolError::BufferCapExceeded);
    }
    buf.extend_from_slice(pathname);
    buf.push(b' ');
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(bytes);
    buf.push(b' ');
    Ok(buf.len() - start)
}

/// Encode a full list of records into a fresh buffer.
pub fn emit_records(records: &[(&[u8], &[u8])]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    for (pathname, bytes) in records {
        emit_data_record(&mut buf, pathname, bytes)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_field_parses_to_empty_list() {
        let ParseOutcome::Complete(records, n) = parse_data_field(b"").unwrap() else {
            panic!("expected complete parse");
        };
        assert!(records.is_empty());
        assert_eq!(n, 0);
    }

    #[test]
    fn round_trip_single_record() {
        let buf = emit_records(&[(b"/a", b"hello")]).unwrap();
        let ParseOutcome::Complete(records, n) = parse_data_field(&buf).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(n, buf.len());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pathname, b"/a");
        assert_eq!(records[0].bytes, b"hello");
    }

    #[test]
    fn round_trip_multiple_records() {
        let buf = emit_records(&[(b"/a", b"hello"), (b"/b", b""), (b"/c", b"xyz")]).unwrap();
        let ParseOutcome::Complete(records, _) = parse_data_field(&buf).unwrap() else {
            panic!("expected complete parse");
        };
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].pathname, b"/b");
        assert!(records[1].bytes.is_empty());
        assert_eq!(records[2].bytes, b"xyz");
    }

    #[test]
    fn truncated_record_is_incomplete() {
        let buf = b"/a 5 hel".to_vec();
        assert_eq!(parse_data_field(&buf).unwrap(), ParseOutcome::Incomplete);
    }

    #[test]
    fn missing_trailing_space_is_syntax_error() {
        let buf = b"/a 5 helloX".to_vec();
        assert!(parse_data_field(&buf).is_err());
    }
}
