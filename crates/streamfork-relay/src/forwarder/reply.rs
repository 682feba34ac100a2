//! Handling of bytes sent back by a destination.

use std::fmt;

use super::Role;

/// Length of the identifier the storage server sends after connecting.
pub const IDENTIFIER_LEN: usize = 36;

/// Opaque identifier assigned by the storage server.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; IDENTIFIER_LEN]);

impl Identifier {
    pub const fn as_bytes(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.0
    }
}

impl From<[u8; IDENTIFIER_LEN]> for Identifier {
    fn from(bytes: [u8; IDENTIFIER_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({self})")
    }
}

/// Accumulates the first [`IDENTIFIER_LEN`] bytes of a reply stream.
///
/// Bytes past the identifier, whether in the completing delivery or later
/// ones, are discarded.
#[derive(Debug, Default)]
pub struct IdentifierCapture {
    received: Vec<u8>,
    identifier: Option<Identifier>,
}

impl IdentifierCapture {
    /// Feed one delivery. Returns the identifier on the delivery that
    /// completes it and `None` otherwise.
    pub fn feed(&mut self, data: &[u8]) -> Option<Identifier> {
        if self.identifier.is_some() {
            return None;
        }
        let missing = IDENTIFIER_LEN - self.received.len();
        self.received
            .extend_from_slice(&data[..missing.min(data.len())]);

        let bytes: [u8; IDENTIFIER_LEN] = self.received.as_slice().try_into().ok()?;
        let identifier = Identifier(bytes);
        self.identifier = Some(identifier);
        self.received = Vec::new();
        Some(identifier)
    }

    pub const fn identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }
}

/// Role-specific treatment of destination replies.
#[derive(Debug)]
pub enum ReplyHandler {
    /// Replies are read and dropped.
    Discard,
    /// Replies open with an identifier; everything after it is dropped.
    CaptureIdentifier(IdentifierCapture),
}

impl ReplyHandler {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Media => Self::Discard,
            Role::Storage => Self::CaptureIdentifier(IdentifierCapture::default()),
        }
    }

    pub fn receive(&mut self, data: &[u8]) -> Option<Identifier> {
        match self {
            Self::Discard => None,
            Self::CaptureIdentifier(capture) => capture.feed(data),
        }
    }
}
