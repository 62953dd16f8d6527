// https://redis.io/docs/reference/protocol-spec

use bytes::{Buf, Bytes};
use std::fmt;
use std::io::Cursor;
use std::str;
use thiserror::Error as ThisError;

const CRLF: &[u8] = b"\r\n";

/// Arrays nested deeper than this are refused, so a request cannot exhaust the stack.
pub const MAX_NESTING: usize = 32;

#[derive(Debug, ThisError, PartialEq)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("protocol error; unsupported frame type {0:?}")]
    InvalidDataType(char),
    #[error("protocol error; {0}")]
    Malformed(&'static str),
}

/// A RESP2 frame. Clients send commands as arrays of bulk strings, the server answers with any
/// of the variants below.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// `$-1\r\n`, the nil reply for a missing value.
    NullBulk,
    /// `*-1\r\n`, the nil reply of array commands, e.g. a BLPOP that timed out.
    NullArray,
    Array(Vec<Frame>),
}

impl Frame {
    pub fn ok() -> Frame {
        Frame::Simple("OK".to_string())
    }

    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        Frame::parse_nested(src, 0)
    }

    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, Error> {
        // The first byte identifies the type, the rest is the type's content.
        match get_byte(src)? {
            b'+' => Ok(Frame::Simple(get_utf8_line(src)?)),
            b'-' => Ok(Frame::Error(get_utf8_line(src)?)),
            b':' => Ok(Frame::Integer(get_decimal(src)?)),
            // $<length>\r\n<data>\r\n
            b'$' => match get_decimal(src)? {
                -1 => Ok(Frame::NullBulk),
                len if len < 0 => Err(Error::Malformed("negative bulk string length")),
                len => {
                    let data = get_exact(src, len as usize)?;
                    Ok(Frame::Bulk(Bytes::copy_from_slice(data)))
                }
            },
            // *<number-of-elements>\r\n<element-1>...<element-n>
            b'*' => match get_decimal(src)? {
                -1 => Ok(Frame::NullArray),
                len if len < 0 => Err(Error::Malformed("negative array length")),
                _ if depth >= MAX_NESTING => Err(Error::Malformed("nesting too deep")),
                len => {
                    // Do not trust the announced length for the allocation.
                    let mut frames = Vec::with_capacity(len.min(1024) as usize);
                    for _ in 0..len {
                        frames.push(Frame::parse_nested(src, depth + 1)?);
                    }
                    Ok(Frame::Array(frames))
                }
            },
            // RESP3 null, accepted from clients that send it.
            b'_' => {
                get_line(src)?;
                Ok(Frame::NullBulk)
            }
            byte => Err(Error::InvalidDataType(byte as char)),
        }
    }

    /// Exact number of bytes `serialize` produces, computed without allocating.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Simple(s) | Frame::Error(s) => 1 + s.len() + CRLF.len(),
            Frame::Integer(i) => 1 + decimal_len(*i) + CRLF.len(),
            Frame::Bulk(bytes) => {
                1 + decimal_len(bytes.len() as i64) + CRLF.len() + bytes.len() + CRLF.len()
            }
            Frame::NullBulk | Frame::NullArray => 5,
            Frame::Array(frames) => {
                1 + decimal_len(frames.len() as i64)
                    + CRLF.len()
                    + frames.iter().map(Frame::encoded_len).sum::<usize>()
            }
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Frame::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Frame::Integer(i) => {
                out.push(b':');
                out.extend_from_slice(i.to_string().as_bytes());
                out.extend_from_slice(CRLF);
            }
            Frame::Bulk(bytes) => {
                out.push(b'$');
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.extend_from_slice(CRLF);
                out.extend_from_slice(bytes);
                out.extend_from_slice(CRLF);
            }
            Frame::NullBulk => out.extend_from_slice(b"$-1\r\n"),
            Frame::NullArray => out.extend_from_slice(b"*-1\r\n"),
            Frame::Array(frames) => {
                out.push(b'*');
                out.extend_from_slice(frames.len().to_string().as_bytes());
                out.extend_from_slice(CRLF);
                for frame in frames {
                    frame.write_to(out);
                }
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out);
        out
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::NullBulk => write!(f, "$-1"),
            Frame::NullArray => write!(f, "*-1"),
            Frame::Array(frames) => {
                write!(f, "*{}", frames.len())?;
                for frame in frames {
                    write!(f, " {}", frame)?;
                }
                Ok(())
            }
        }
    }
}

fn decimal_len(i: i64) -> usize {
    let mut n = i.unsigned_abs();
    let mut len = if i < 0 { 2 } else { 1 };
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let offset = buf
        .get(start..)
        .unwrap_or_default()
        .windows(CRLF.len())
        .position(|window| window == CRLF)
        .ok_or(Error::Incomplete)?;

    src.set_position((start + offset + CRLF.len()) as u64);
    Ok(&buf[start..start + offset])
}

fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, len: usize) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = start + len;
    let buf: &'a [u8] = *src.get_ref();

    // Bulk payloads are binary safe, so they are read by length rather than up to a CRLF.
    if buf.len() < end + CRLF.len() {
        return Err(Error::Incomplete);
    }
    if &buf[end..end + CRLF.len()] != CRLF {
        return Err(Error::Malformed("bulk string is not terminated by CRLF"));
    }

    src.set_position((end + CRLF.len()) as u64);
    Ok(&buf[start..end])
}

fn get_utf8_line(src: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let line = get_line(src)?;
    String::from_utf8(line.to_vec()).map_err(|_| Error::Malformed("invalid UTF-8 string"))
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    let line = get_line(src)?;
    str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(Error::Malformed("invalid integer"))
}
