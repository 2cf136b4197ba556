//! Multicast wire framing.
//!
//! ## Wire format
//!
//! ```text
//! ["JXTA"] [header]* [0u8] [payload: content-length bytes]
//!
//! header := [name_len: u8] [name: UTF-8] [value_len: u16-be] [value]
//! ```
//!
//! Two headers are mandatory: `content-type` (UTF-8 value) and
//! `content-length` (8-byte big-endian value). Any other header is carried
//! through untouched. The whole frame must fit in one datagram.

use crate::{
    error::{Result, TransportError},
    message::Message,
};

/// Leading bytes of every multicast frame.
pub const MAGIC: &[u8; 4] = b"JXTA";

/// Shortest buffer that is even looked at.
pub const MIN_FRAME_LEN: usize = MAGIC.len();

/// Header carrying the payload MIME type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Header carrying the payload length.
pub const CONTENT_LENGTH_HEADER: &str = "content-length";

/// A decoded (or to-be-encoded) multicast frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastFrame {
    /// MIME type of `payload`.
    pub content_type: String,
    /// Headers other than content-type and content-length, in wire order.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Serialized message bytes.
    pub payload: Vec<u8>,
}

impl MulticastFrame {
    pub fn new(content_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            headers: Vec::new(),
            payload,
        }
    }

    /// Attach an extra header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: Vec<u8>) -> Self {
        self.headers.push((name.into(), value));
        self
    }

    /// Value of the first extra header called `name`.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Returns `true` if `bytes` is long enough and starts with [`MAGIC`].
    pub fn has_magic(bytes: &[u8]) -> bool {
        bytes.len() >= MIN_FRAME_LEN && bytes.starts_with(MAGIC)
    }

    /// Encode the frame, refusing anything larger than `max_size`.
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>> {
        let content_length = (self.payload.len() as u64).to_be_bytes();
        let mut buf = Vec::with_capacity(max_size.min(self.payload.len().saturating_add(128)));
        buf.extend_from_slice(MAGIC);
        write_header(&mut buf, CONTENT_TYPE_HEADER, self.content_type.as_bytes())?;
        write_header(&mut buf, CONTENT_LENGTH_HEADER, &content_length)?;
        for (name, value) in &self.headers {
            write_header(&mut buf, name, value)?;
        }
        buf.push(0);
        buf.extend_from_slice(&self.payload);

        if buf.len() > max_size {
            return Err(TransportError::FrameTooLarge {
                size: buf.len(),
                max: max_size,
            });
        }
        Ok(buf)
    }

    /// Decode a frame. The payload must be exactly `content-length` bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if !Self::has_magic(bytes) {
            return Err(invalid("missing magic bytes"));
        }

        let mut reader = Reader {
            buf: bytes,
            pos: MAGIC.len(),
        };
        let mut content_type = None;
        let mut content_length = None;
        let mut headers = Vec::new();

        loop {
            let name_len = usize::from(reader.u8()?);
            if name_len == 0 {
                break;
            }
            let name = std::str::from_utf8(reader.take(name_len)?)
                .map_err(|_| invalid("header name is not UTF-8"))?
                .to_string();
            let value_len = usize::from(reader.u16()?);
            let value = reader.take(value_len)?;

            match name.as_str() {
                CONTENT_TYPE_HEADER => {
                    let value = std::str::from_utf8(value)
                        .map_err(|_| invalid("content-type is not UTF-8"))?;
                    content_type = Some(value.to_string());
                }
                CONTENT_LENGTH_HEADER => {
                    let value: [u8; 8] = value
                        .try_into()
                        .map_err(|_| invalid("content-length must be 8 bytes"))?;
                    content_length = Some(u64::from_be_bytes(value));
                }
                _ => headers.push((name, value.to_vec())),
            }
        }

        let content_type = content_type.ok_or_else(|| invalid("missing content-type"))?;
        let content_length = content_length.ok_or_else(|| invalid("missing content-length"))?;
        let remaining = reader.remaining();
        if remaining as u64 != content_length {
            return Err(TransportError::InvalidFrame(format!(
                "content-length {content_length} but {remaining} payload bytes"
            )));
        }

        Ok(Self {
            content_type,
            headers,
            payload: reader.rest().to_vec(),
        })
    }
}

/// Serialize `message` into a frame labelled `content_type`.
pub fn encode_message(message: &Message, content_type: &str, max_size: usize) -> Result<Vec<u8>> {
    MulticastFrame::new(content_type, message.serialize()?).encode(max_size)
}

/// Decode a frame and deserialize its payload.
///
/// Returns the message together with the frame it came from, so callers can
/// inspect the content type and extra headers.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, MulticastFrame)> {
    let frame = MulticastFrame::decode(bytes)?;
    let message = Message::deserialize(&frame.payload)?;
    Ok((message, frame))
}

fn invalid(reason: &str) -> TransportError {
    TransportError::InvalidFrame(reason.to_string())
}

fn write_header(buf: &mut Vec<u8>, name: &str, value: &[u8]) -> Result<()> {
    let name_len = u8::try_from(name.len())
        .ok()
        .filter(|len| *len > 0)
        .ok_or_else(|| TransportError::InvalidFrame(format!("bad header name length: {name:?}")))?;
    let value_len = u16::try_from(value.len()).map_err(|_| {
        TransportError::InvalidFrame(format!("header {name} value too long: {}", value.len()))
    })?;
    buf.push(name_len);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&value_len.to_be_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| invalid("truncated header block"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::message::MessageElement,
        assert_matches::assert_matches,
    };

    fn message() -> Message {
        Message::new().with_element(MessageElement::new(
            "",
            "greeting",
            b"hello multicast".to_vec(),
        ))
    }

    #[test]
    fn test_message_roundtrip_text_plain() {
        let msg = message();
        let payload_len = msg.serialize().unwrap().len();
        let bytes = encode_message(&msg, "text/plain", 16_384).unwrap();
        assert!(bytes.starts_with(MAGIC));

        let (decoded, frame) = decode_message(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(frame.content_type, "text/plain");
        assert_eq!(frame.payload.len(), payload_len);
    }

    #[test]
    fn test_extra_headers_preserved() {
        let frame = MulticastFrame::new("text/plain", vec![1, 2, 3])
            .with_header("srcEA", b"tcp://10.0.0.1:9701".to_vec());
        let decoded = MulticastFrame::decode(&frame.encode(1024).unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.header("srcEA"), Some(&b"tcp://10.0.0.1:9701"[..]));
    }

    #[test]
    fn test_too_large_rejected() {
        let frame = MulticastFrame::new("text/plain", vec![0; 100]);
        assert_matches!(
            frame.encode(64),
            Err(TransportError::FrameTooLarge { max: 64, .. })
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = MulticastFrame::new("text/plain", vec![7]).encode(64).unwrap();
        bytes[..4].copy_from_slice(b"ABCD");
        assert!(!MulticastFrame::has_magic(&bytes));
        assert_matches!(MulticastFrame::decode(&bytes), Err(TransportError::InvalidFrame(_)));
        assert!(!MulticastFrame::has_magic(b"JX"));
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let bytes = MulticastFrame::new("text/plain", vec![1, 2, 3, 4]).encode(64).unwrap();
        for len in MIN_FRAME_LEN..bytes.len() {
            assert!(MulticastFrame::decode(&bytes[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = MulticastFrame::new("text/plain", vec![1]).encode(64).unwrap();
        bytes.push(0);
        assert_matches!(MulticastFrame::decode(&bytes), Err(TransportError::InvalidFrame(_)));
    }

    #[test]
    fn test_missing_content_type_rejected() {
        let mut bytes = MAGIC.to_vec();
        write_header(&mut bytes, CONTENT_LENGTH_HEADER, &0u64.to_be_bytes()).unwrap();
        bytes.push(0);
        assert_matches!(MulticastFrame::decode(&bytes), Err(TransportError::InvalidFrame(_)));
    }
}
