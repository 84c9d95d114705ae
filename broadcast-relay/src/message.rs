use std::{fmt, str::Utf8Error, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};

use crate::connection::ConnectionId;

/// Marker the relay puts in front of every relayed text message by default.
pub const DEFAULT_BROADCAST_PREFIX: &str = "Server broadcast: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// One outbound unit of data.
///
/// Payloads are reference counted, so cloning a frame for every recipient
/// never copies the bytes. A `Text` frame always holds valid UTF-8.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Bytes,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            payload: Bytes::from(text.into()),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Binary,
            payload: payload.into(),
        }
    }

    /// Builds a text frame from raw bytes, checking that they are UTF-8.
    pub fn text_from_bytes(payload: Bytes) -> Result<Self, Utf8Error> {
        std::str::from_utf8(&payload)?;
        Ok(Self {
            kind: FrameKind::Text,
            payload,
        })
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            FrameKind::Text => std::str::from_utf8(&self.payload).ok(),
            FrameKind::Binary => None,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.debug_tuple("Text").field(&text).finish(),
            None => f.debug_tuple("Binary").field(&self.payload.len()).finish(),
        }
    }
}

/// An inbound message: what a connection sent, tagged with who sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    originator: ConnectionId,
    frame: Frame,
}

impl Message {
    pub fn new(originator: ConnectionId, frame: Frame) -> Self {
        Self { originator, frame }
    }

    pub fn text(originator: ConnectionId, text: impl Into<String>) -> Self {
        Self::new(originator, Frame::text(text))
    }

    pub fn originator(&self) -> ConnectionId {
        self.originator
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

/// Turns an inbound message into the frame every recipient gets.
pub type Formatter = Arc<dyn Fn(&Message) -> Frame + Send + Sync>;

/// Prepends `prefix` to text payloads. Binary payloads pass through untouched.
///
/// The classic Node relay stringified every payload and prefixed it, binary
/// included. Here binary frames keep their bytes and their kind, so a relayed
/// binary message is byte-identical to what the sender wrote.
pub fn prefix_formatter(prefix: impl Into<String>) -> Formatter {
    let prefix = Bytes::from(prefix.into());
    Arc::new(move |message: &Message| {
        let frame = message.frame();
        match frame.kind() {
            FrameKind::Text if !prefix.is_empty() => {
                let mut buf = BytesMut::with_capacity(prefix.len() + frame.len());
                buf.put_slice(&prefix);
                buf.put_slice(frame.payload());
                Frame {
                    kind: FrameKind::Text,
                    payload: buf.freeze(),
                }
            }
            _ => frame.clone(),
        }
    })
}

/// Relays payloads exactly as they were received.
pub fn passthrough_formatter() -> Formatter {
    Arc::new(|message: &Message| message.frame().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_applied_to_text_only() {
        let formatter = prefix_formatter(DEFAULT_BROADCAST_PREFIX);
        let from = ConnectionId::new(1);

        let text = formatter(&Message::text(from, "hello"));
        assert_eq!(text.as_text(), Some("Server broadcast: hello"));

        let raw = Frame::binary(vec![0u8, 159, 146, 150]);
        let binary = formatter(&Message::new(from, raw.clone()));
        assert_eq!(binary, raw);
    }

    #[test]
    fn text_from_bytes_rejects_invalid_utf8() {
        assert!(Frame::text_from_bytes(Bytes::from_static(&[0xff, 0xfe])).is_err());
        let frame = Frame::text_from_bytes(Bytes::from_static(b"ok")).expect("valid utf-8");
        assert_eq!(frame.kind(), FrameKind::Text);
    }

    #[test]
    fn clones_share_the_payload() {
        let frame = Frame::text("shared");
        let copy = frame.clone();
        assert_eq!(frame.payload().as_ptr(), copy.payload().as_ptr());
    }
}
