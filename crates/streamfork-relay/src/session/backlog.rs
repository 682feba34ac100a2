//! Bytes held for a destination that has not connected yet.

use bytes::{Bytes, BytesMut};

/// The backlog would grow past its configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("backlog limit of {limit} bytes exceeded")]
pub struct BacklogOverflow {
    pub limit: usize,
}

/// Ordered byte backlog with an optional size limit.
#[derive(Debug, Default)]
pub struct Backlog {
    buf: BytesMut,
    limit: Option<usize>,
}

impl Backlog {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Append a chunk. Nothing is appended if that would exceed the limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), BacklogOverflow> {
        if let Some(limit) = self.limit {
            if self.buf.len().saturating_add(chunk.len()) > limit {
                return Err(BacklogOverflow { limit });
            }
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Take everything held so far, leaving the backlog empty.
    pub fn take(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
