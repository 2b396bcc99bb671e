//! Structured payload stand-in.
//!
//! The real binary-node domain codec is an external collaborator; this is the
//! minimal `encode(node) -> bytes` / `decode(bytes) -> node` surface the
//! session layer needs to exercise tagging, correlation, and routing. The
//! node's business meaning is never interpreted here beyond its tag and `id`
//! attribute.

use std::collections::BTreeMap;
use std::fmt;

use crate::core::NodeError;

/// Attribute name carrying the correlation tag.
pub const ATTR_ID: &str = "id";

/// A decoded structured payload: a named element with string attributes and
/// optional opaque content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Element name ("iq", "success", "ping", ...).
    pub tag: String,
    /// String attributes, deterministically ordered.
    pub attrs: BTreeMap<String, String>,
    /// Opaque content bytes.
    pub content: Option<Vec<u8>>,
}

impl Node {
    /// Create an empty node with the given element name.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: None,
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Builder-style content setter.
    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = Some(content);
        self
    }

    /// Look up an attribute.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// The correlation tag, when present.
    pub fn id(&self) -> Option<&str> {
        self.attr(ATTR_ID)
    }

    /// Serialize to wire bytes.
    ///
    /// Layout: `[tag_len u8 | tag | attr_count u8 |
    /// (key_len u8 | key | val_len u16 BE | val)* | content_flag u8 |
    /// (content_len u32 BE | content)?]`
    pub fn encode(&self) -> Result<Vec<u8>, NodeError> {
        if self.tag.len() > u8::MAX as usize || self.attrs.len() > u8::MAX as usize {
            return Err(NodeError::FieldTooLarge);
        }

        let mut out = Vec::with_capacity(64);
        out.push(self.tag.len() as u8);
        out.extend_from_slice(self.tag.as_bytes());

        out.push(self.attrs.len() as u8);
        for (key, value) in &self.attrs {
            if key.len() > u8::MAX as usize || value.len() > u16::MAX as usize {
                return Err(NodeError::FieldTooLarge);
            }
            out.push(key.len() as u8);
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }

        match &self.content {
            Some(content) => {
                if content.len() > u32::MAX as usize {
                    return Err(NodeError::FieldTooLarge);
                }
                out.push(1);
                out.extend_from_slice(&(content.len() as u32).to_be_bytes());
                out.extend_from_slice(content);
            }
            None => out.push(0),
        }

        Ok(out)
    }

    /// Deserialize from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self, NodeError> {
        let mut cursor = Cursor { data, pos: 0 };

        let tag_len = cursor.u8()? as usize;
        let tag = cursor.str(tag_len)?.to_string();

        let attr_count = cursor.u8()?;
        let mut attrs = BTreeMap::new();
        for _ in 0..attr_count {
            let key_len = cursor.u8()? as usize;
            let key = cursor.str(key_len)?.to_string();
            let val_len = cursor.u16()? as usize;
            let value = cursor.str(val_len)?.to_string();
            attrs.insert(key, value);
        }

        let content = match cursor.u8()? {
            0 => None,
            _ => {
                let len = cursor.u32()? as usize;
                Some(cursor.bytes(len)?.to_vec())
            }
        };

        // A frame holds exactly one node; leftovers mean garbage input.
        if cursor.pos != data.len() {
            return Err(NodeError::TrailingBytes);
        }

        Ok(Self { tag, attrs, content })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (key, value) in &self.attrs {
            write!(f, " {key}={value:?}")?;
        }
        match &self.content {
            Some(content) => write!(f, "> [{} bytes]", content.len()),
            None => write!(f, "/>"),
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        let end = self.pos.checked_add(len).ok_or(NodeError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(NodeError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn str(&mut self, len: usize) -> Result<&'a str, NodeError> {
        std::str::from_utf8(self.bytes(len)?).map_err(|_| NodeError::InvalidUtf8)
    }

    fn u8(&mut self) -> Result<u8, NodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, NodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, NodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_roundtrip() {
        let node = Node::new("iq")
            .with_attr("id", "1a.2b-7")
            .with_attr("type", "get")
            .with_content(vec![0xde, 0xad, 0xbe, 0xef]);

        let decoded = Node::decode(&node.encode().unwrap()).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.id(), Some("1a.2b-7"));
    }

    #[test]
    fn test_decode_truncated_input() {
        let node = Node::new("ping").with_attr("id", "x-1");
        let bytes = node.encode().unwrap();

        assert_eq!(
            Node::decode(&bytes[..bytes.len() - 1]),
            Err(NodeError::UnexpectedEof)
        );
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = Node::new("ping").encode().unwrap();
        bytes.push(0x00);

        assert_eq!(Node::decode(&bytes), Err(NodeError::TrailingBytes));
    }

    #[test]
    fn test_decode_rejects_bad_utf8() {
        // tag_len 2, invalid utf-8 tag bytes.
        assert_eq!(
            Node::decode(&[2, 0xff, 0xfe, 0, 0]),
            Err(NodeError::InvalidUtf8)
        );
    }
}
