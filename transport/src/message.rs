//! The opaque message moved by the transports.
//!
//! A [`Message`] is an ordered list of named elements. The transport never
//! looks inside element bodies; it only serializes the whole message with
//! bincode when a wire format needs bytes.

use {
    crate::error::{Result, TransportError},
    serde::{Deserialize, Serialize},
};

/// Content type used for bincode-encoded [`Message`] payloads.
pub const DEFAULT_CONTENT_TYPE: &str = "application/x-peerlink-msg";

/// One named element of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageElement {
    /// Namespace the element name belongs to; empty for the default one.
    pub namespace: String,
    /// Element name, unique within its namespace by convention.
    pub name: String,
    /// Optional MIME type describing `body`.
    pub mime_type: Option<String>,
    /// Raw element content.
    pub body: Vec<u8>,
}

impl MessageElement {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            mime_type: None,
            body,
        }
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// An application message: an ordered list of elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    elements: Vec<MessageElement>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element.
    pub fn add_element(&mut self, element: MessageElement) {
        self.elements.push(element);
    }

    /// Builder form of [`Message::add_element`].
    #[must_use]
    pub fn with_element(mut self, element: MessageElement) -> Self {
        self.add_element(element);
        self
    }

    /// First element matching `namespace` and `name`.
    pub fn element(&self, namespace: &str, name: &str) -> Option<&MessageElement> {
        self.elements
            .iter()
            .find(|e| e.namespace == namespace && e.name == name)
    }

    pub fn elements(&self) -> &[MessageElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Serialize this message to bytes using bincode.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(TransportError::Serialization)
    }

    /// Deserialize a message from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(TransportError::Serialization)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new()
            .with_element(MessageElement::new("jxta", "EndpointSourceAddress", b"tcp://a:1".to_vec()))
            .with_element(
                MessageElement::new("", "payload", vec![0, 1, 2, 255]).with_mime_type("text/plain"),
            )
    }

    #[test]
    fn test_roundtrip() {
        let msg = sample();
        let bytes = msg.serialize().unwrap();
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_element_lookup() {
        let msg = sample();
        assert_eq!(msg.len(), 2);
        assert_eq!(
            msg.element("", "payload").unwrap().mime_type.as_deref(),
            Some("text/plain")
        );
        assert!(msg.element("jxta", "payload").is_none());
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        assert!(Message::deserialize(&[0xff; 3]).is_err());
    }
}
