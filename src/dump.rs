//! Textual interchange format shared by `cdbmake` input and `cdbdump` output.
//!
//! Each record is one line `+<key_len>,<value_len>:<key>-><value>\n` and the
//! stream ends with a single empty line. Keys and values are taken by length,
//! so they may contain arbitrary bytes including newlines.

use std::io::{BufRead, Error, ErrorKind, Read, Result, Write};

/// Writes one record line.
pub fn write_record<W: Write + ?Sized>(out: &mut W, key: &[u8], value: &[u8]) -> Result<()> {
    write!(out, "+{},{}:", key.len(), value.len())?;
    out.write_all(key)?;
    out.write_all(b"->")?;
    out.write_all(value)?;
    out.write_all(b"\n")
}

/// Writes the end-of-stream marker.
pub fn write_end<W: Write + ?Sized>(out: &mut W) -> Result<()> {
    out.write_all(b"\n")
}

/// Encodes one record into a freshly allocated line.
pub fn encode_record(key: &[u8], value: &[u8]) -> Vec<u8> {
    let prefix = format!("+{},{}:", key.len(), value.len());
    let mut line = Vec::with_capacity(prefix.len() + key.len() + value.len() + 3);
    line.extend_from_slice(prefix.as_bytes());
    line.extend_from_slice(key);
    line.extend_from_slice(b"->");
    line.extend_from_slice(value);
    line.push(b'\n');
    line
}

/// Lazily parses records from an interchange stream.
///
/// Yields `Ok((key, value))` per record and stops after the end marker.
/// Reaching end of input before the marker yields an
/// `ErrorKind::UnexpectedEof` error; malformed lines yield
/// `ErrorKind::InvalidData`. The parser is fused after the end marker or
/// the first error.
pub struct DumpParser<B: BufRead> {
    input: B,
    line: u64,
    done: bool,
}

impl<B: BufRead> DumpParser<B> {
    pub fn new(input: B) -> Self {
        DumpParser {
            input,
            line: 0,
            done: false,
        }
    }

    /// Returns the underlying reader, positioned after the last consumed byte.
    pub fn into_inner(self) -> B {
        self.input
    }

    fn invalid(&self, message: impl std::fmt::Display) -> Error {
        Error::new(
            ErrorKind::InvalidData,
            format!("bad cdb dump at record {}: {}", self.line, message),
        )
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.input.read_exact(buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("cdb dump truncated at record {}", self.line),
                )
            } else {
                e
            }
        })
    }

    fn read_length(&mut self, terminator: u8) -> Result<usize> {
        let mut digits = Vec::with_capacity(10);
        loop {
            let byte = self.read_byte()?;
            if byte == terminator {
                break;
            }
            if !byte.is_ascii_digit() {
                return Err(self.invalid(format!(
                    "expected digit or {:?}, found {:?}",
                    terminator as char, byte as char
                )));
            }
            digits.push(byte);
        }
        if digits.is_empty() {
            return Err(self.invalid("missing length"));
        }
        std::str::from_utf8(&digits)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .map(|n| n as usize)
            .ok_or_else(|| self.invalid("length out of range"))
    }

    fn expect_bytes(&mut self, expected: &[u8]) -> Result<()> {
        let mut buf = vec![0u8; expected.len()];
        self.read_exact(&mut buf)?;
        if buf != expected {
            return Err(self.invalid(format!(
                "expected {:?}, found {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&buf)
            )));
        }
        Ok(())
    }

    fn parse_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.line += 1;
        match self.read_byte()? {
            b'\n' => return Ok(None),
            b'+' => {}
            other => {
                return Err(self.invalid(format!(
                    "expected '+' or end marker, found {:?}",
                    other as char
                )));
            }
        }

        let key_length = self.read_length(b',')?;
        let value_length = self.read_length(b':')?;

        let mut key = vec![0u8; key_length];
        self.read_exact(&mut key)?;
        self.expect_bytes(b"->")?;
        let mut value = vec![0u8; value_length];
        self.read_exact(&mut value)?;
        self.expect_bytes(b"\n")?;
        Ok(Some((key, value)))
    }
}

impl<B: BufRead> Iterator for DumpParser<B> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.parse_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        DumpParser::new(input).collect()
    }

    #[test]
    fn test_encode() {
        let mut out = Vec::new();
        write_record(&mut out, b"one", b"1").unwrap();
        write_record(&mut out, b"", b"").unwrap();
        write_end(&mut out).unwrap();
        assert_eq!(out, b"+3,1:one->1\n+0,0:->\n\n");
        assert_eq!(encode_record(b"k", b"vv"), b"+1,2:k->vv\n");

        let mut written = Vec::new();
        write_record(&mut written, b"a\nb", b"").unwrap();
        assert_eq!(encode_record(b"a\nb", b""), written);
    }

    #[test]
    fn test_parse_binary_safe() {
        let mut input = Vec::new();
        write_record(&mut input, b"a\nb", b"->\n+").unwrap();
        write_record(&mut input, b"two", b"22").unwrap();
        write_end(&mut input).unwrap();
        input.extend_from_slice(b"garbage");

        let mut parser = DumpParser::new(&input[..]);
        let records = parser.by_ref().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(parser.into_inner(), b"garbage");
        assert_eq!(
            records,
            vec![
                (b"a\nb".to_vec(), b"->\n+".to_vec()),
                (b"two".to_vec(), b"22".to_vec()),
            ]
        );
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse(b"\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        let cases: &[(&[u8], ErrorKind)] = &[
            (b"", ErrorKind::UnexpectedEof),
            (b"+3,1:one->1\n", ErrorKind::UnexpectedEof),
            (b"+3,1:on", ErrorKind::UnexpectedEof),
            (b"-3,1:one->1\n\n", ErrorKind::InvalidData),
            (b"+3,1:one=>1\n\n", ErrorKind::InvalidData),
            (b"+3,1:one->1x\n", ErrorKind::InvalidData),
            (b"+,1:->1\n\n", ErrorKind::InvalidData),
            (b"+a,1:a->1\n\n", ErrorKind::InvalidData),
            (b"+99999999999,1:a->1\n\n", ErrorKind::InvalidData),
        ];
        for (input, kind) in cases {
            let err = parse(input).unwrap_err();
            assert_eq!(err.kind(), *kind, "input {:?}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn test_parser_fused_after_error() {
        let mut parser = DumpParser::new(&b"+1,1:a->1\n?"[..]);
        assert!(parser.next().unwrap().is_ok());
        assert!(parser.next().unwrap().is_err());
        assert!(parser.next().is_none());
    }
}
