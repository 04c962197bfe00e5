//! Charset and delimiter used to frame messages on a byte stream.
//!
//! Wire format: `<payload><delimiter>`, repeated. Payloads must not contain
//! the delimiter.

use std::borrow::Cow;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_DELIMITER: &str = "\n";

/// Text encoding used to turn frames into strings and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Charset {
    #[default]
    #[serde(rename = "UTF-8")]
    Utf8,
    #[serde(rename = "ISO-8859-1")]
    Latin1,
    #[serde(rename = "US-ASCII")]
    Ascii,
}

impl Charset {
    pub fn encode<'a>(&self, text: &'a str) -> Cow<'a, [u8]> {
        match self {
            Charset::Utf8 => Cow::Borrowed(text.as_bytes()),
            Charset::Latin1 => Cow::Owned(
                text.chars()
                    .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
                    .collect(),
            ),
            Charset::Ascii => Cow::Owned(
                text.chars()
                    .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                    .collect(),
            ),
        }
    }

    /// Decode bytes, replacing anything the charset can't represent.
    pub fn decode<'a>(&self, data: &'a [u8]) -> Cow<'a, str> {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(data),
            Charset::Latin1 => Cow::Owned(data.iter().map(|&b| b as char).collect()),
            Charset::Ascii => Cow::Owned(
                data.iter()
                    .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Display for Charset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Ascii => "US-ASCII",
        };
        f.write_str(name)
    }
}

/// A value configured either as raw bytes or as text in the connection charset.
///
/// Setting one form replaces the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Token {
    Text(String),
    Bytes(Vec<u8>),
}

impl Token {
    pub fn to_bytes(&self, charset: Charset) -> Vec<u8> {
        match self {
            Token::Text(text) => charset.encode(text).into_owned(),
            Token::Bytes(bytes) => bytes.clone(),
        }
    }

    pub fn to_text(&self, charset: Charset) -> String {
        match self {
            Token::Text(text) => text.clone(),
            Token::Bytes(bytes) => charset.decode(bytes).into_owned(),
        }
    }
}

impl From<&str> for Token {
    fn from(text: &str) -> Self {
        Token::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Token {
    fn from(bytes: Vec<u8>) -> Self {
        Token::Bytes(bytes)
    }
}

/// Charset and delimiter of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataEncoding {
    pub charset: Charset,
    pub delimiter: Token,
}

impl Default for DataEncoding {
    fn default() -> Self {
        Self {
            charset: Charset::Utf8,
            delimiter: Token::Text(DEFAULT_DELIMITER.to_string()),
        }
    }
}

impl DataEncoding {
    pub fn new(charset: Charset, delimiter: impl Into<Token>) -> Self {
        Self {
            charset,
            delimiter: delimiter.into(),
        }
    }

    pub fn delimiter_bytes(&self) -> Vec<u8> {
        self.delimiter.to_bytes(self.charset)
    }

    pub fn delimiter_text(&self) -> String {
        self.delimiter.to_text(self.charset)
    }

    pub fn set_delimiter_bytes(&mut self, delimiter: Vec<u8>) {
        self.delimiter = Token::Bytes(delimiter);
    }

    pub fn set_delimiter_text(&mut self, delimiter: &str) {
        self.delimiter = Token::Text(delimiter.to_string());
    }

    pub fn codec(&self) -> DelimiterCodec {
        DelimiterCodec::new(self.delimiter_bytes())
    }
}

/// Splits a byte stream on a fixed delimiter.
///
/// Bytes that follow a delimiter in the same read stay buffered and are
/// returned by the next `decode` call, one frame per call. Empty frames
/// between two delimiters are skipped.
#[derive(Debug, Clone)]
pub struct DelimiterCodec {
    delimiter: Vec<u8>,
    // Where the next delimiter search starts; bytes before it were already scanned.
    next_index: usize,
}

impl DelimiterCodec {
    pub fn new(delimiter: Vec<u8>) -> Self {
        Self {
            delimiter,
            next_index: 0,
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Decoder for DelimiterCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        if self.delimiter.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty delimiter"));
        }
        loop {
            // Back off by delimiter length - 1 so a delimiter split across reads
            // is found. The buffer may have been replaced since the last call.
            let start = self
                .next_index
                .min(src.len())
                .saturating_sub(self.delimiter.len() - 1);
            match find(&src[start..], &self.delimiter) {
                Some(offset) => {
                    let frame = src.split_to(start + offset);
                    src.advance(self.delimiter.len());
                    self.next_index = 0;
                    if !frame.is_empty() {
                        return Ok(Some(frame));
                    }
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Incomplete data received but remote peer disconnected, data will be discarded",
            )),
        }
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for DelimiterCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload = item.as_ref();
        dst.reserve(payload.len() + self.delimiter.len());
        dst.put_slice(payload);
        dst.put_slice(&self.delimiter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut DelimiterCodec, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame.to_vec());
        }
        frames
    }

    #[test]
    fn pipelined_frames_come_out_one_by_one() {
        let mut codec = DelimiterCodec::new(b"#END#".to_vec());
        let mut buf = BytesMut::from(&b"one#END#two#END#thr"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(&buf[..], b"thr");

        buf.extend_from_slice(b"ee#END#");
        assert_eq!(decode_all(&mut codec, &mut buf), vec![b"three".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn delimiter_split_across_reads() {
        let mut codec = DelimiterCodec::new(b"#END#".to_vec());
        let mut buf = BytesMut::from(&b"payload#EN"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"D#");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().to_vec(), b"payload".to_vec());
    }

    #[test]
    fn byte_by_byte_stream() {
        let mut codec = DelimiterCodec::new(b"\r\n".to_vec());
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for b in b"ab\r\n\r\ncd\r\n" {
            buf.put_u8(*b);
            frames.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(frames, vec![b"ab".to_vec(), b"cd".to_vec()]);
    }

    #[test]
    fn empty_frames_are_skipped() {
        let mut codec = DelimiterCodec::new(b"\n".to_vec());
        let mut buf = BytesMut::from(&b"\n\none\n\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec![b"one".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn replaced_buffer_is_scanned_from_its_start() {
        let mut codec = DelimiterCodec::new(b"\n".to_vec());
        let mut buf = BytesMut::from(&b"partial"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut fresh = BytesMut::from(&b"ok\n"[..]);
        assert_eq!(codec.decode(&mut fresh).unwrap().unwrap().to_vec(), b"ok".to_vec());
    }

    #[test]
    fn eof_with_partial_frame_is_an_error() {
        let mut codec = DelimiterCodec::new(b"\n".to_vec());
        let mut buf = BytesMut::from(&b"partial"[..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn encoder_appends_delimiter() {
        let mut codec = DelimiterCodec::new(b"#".to_vec());
        let mut dst = BytesMut::new();
        codec.encode(b"hi", &mut dst).unwrap();
        assert_eq!(&dst[..], b"hi#");
    }

    #[test]
    fn latin1_roundtrips_high_bytes() {
        let text = Charset::Latin1.decode(&[0x63, 0x61, 0x66, 0xE9]);
        assert_eq!(text, "café");
        assert_eq!(Charset::Latin1.encode("café").as_ref(), &[0x63, 0x61, 0x66, 0xE9]);
        assert_eq!(Charset::Ascii.encode("café").as_ref(), b"caf?");
    }

    #[test]
    fn delimiter_forms_are_interchangeable() {
        let mut enc = DataEncoding::default();
        assert_eq!(enc.delimiter_bytes(), b"\n".to_vec());
        enc.set_delimiter_bytes(b"#-#".to_vec());
        assert_eq!(enc.delimiter_text(), "#-#");
        enc.set_delimiter_text("##");
        assert_eq!(enc.delimiter, Token::Text("##".into()));
    }
}
