//! Binary frame codec.
//!
//! ```text
//! [u8 opcode] ([u8 len] [bytes])*
//! ```
//!
//! Unlike a raw TCP byte stream, each inbound WebSocket binary message
//! already delimits one complete frame for us (`tokio-tungstenite`
//! reassembles fragmented WebSocket messages before handing them to the
//! reader), so decoding a frame never needs to buffer across reads — it
//! consumes exactly the bytes of one WebSocket message.

use anyhow::{anyhow, bail, Result};

/// A decoded binary frame: an opcode plus its ordered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub fields: Vec<Vec<u8>>,
}

impl Frame {
    pub fn new(opcode: u8, fields: Vec<Vec<u8>>) -> Self {
        Self { opcode, fields }
    }

    /// Encode as `opcode ‖ (len8, bytes)+`.
    ///
    /// # Errors
    ///
    /// Fails if any field exceeds 255 bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + self.fields.iter().map(|f| f.len() + 1).sum::<usize>());
        buf.push(self.opcode);
        for field in &self.fields {
            if field.len() > 255 {
                bail!("field exceeds 255 bytes: {}", field.len());
            }
            buf.push(field.len() as u8);
            buf.extend_from_slice(field);
        }
        Ok(buf)
    }

    /// Encode without length prefixes — used only for fixed-shape
    /// responses where the receiver knows the layout (§6: `USER_REGISTERED`,
    /// `USER_STATUS_CHANGED`).
    pub fn encode_raw(opcode: u8, fields: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + fields.iter().map(|f| f.len()).sum::<usize>());
        buf.push(opcode);
        for field in fields {
            buf.extend_from_slice(field);
        }
        buf
    }

    /// Decode one complete frame from `buf`.
    ///
    /// # Errors
    ///
    /// Fails with a `MalformedFrame`-equivalent error when `buf` is empty
    /// or a declared field length exceeds the remaining input.
    pub fn decode(buf: &[u8]) -> Result<Frame> {
        if buf.is_empty() {
            bail!("empty frame buffer");
        }
        let opcode = buf[0];
        let mut pos = 1;
        let mut fields = Vec::new();
        while pos < buf.len() {
            let len = buf[pos] as usize;
            pos += 1;
            if pos + len > buf.len() {
                return Err(anyhow!(
                    "field length {len} at offset {pos} exceeds remaining {} bytes",
                    buf.len() - pos
                ));
            }
            fields.push(buf[pos..pos + len].to_vec());
            pos += len;
        }
        Ok(Frame { opcode, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_simple() {
        let frame = Frame::new(1, vec![b"alice".to_vec(), vec![1]]);
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded, vec![1, 5, b'a', b'l', b'i', b'c', b'e', 1, 1]);
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_no_fields() {
        let frame = Frame::new(6, vec![]);
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded, vec![6]);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn rejects_oversized_field() {
        let frame = Frame::new(4, vec![vec![0u8; 256]]);
        assert!(frame.encode().is_err());
    }

    #[test]
    fn rejects_empty_buffer() {
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn rejects_truncated_field() {
        // Declares a 10-byte field but only 2 bytes follow.
        let buf = [4u8, 10, b'h', b'i'];
        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn encode_raw_matches_user_status_changed_layout() {
        let encoded = Frame::encode_raw(54, &[&[5], b"alice", &[1]]);
        assert_eq!(encoded, vec![54, 5, b'a', b'l', b'i', b'c', b'e', 1]);
    }

    #[test]
    fn error_response_is_single_raw_byte() {
        // ERROR_RESPONSE carries the subcode as a raw byte, no length prefix.
        let encoded = Frame::encode_raw(50, &[&[3]]);
        assert_eq!(encoded, vec![50, 3]);
    }
}
