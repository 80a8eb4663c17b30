//! DNS-over-TCP message framing.
//!
//! Every message on a TCP stream is preceded by its length as a 2-byte
//! big-endian integer. UDP needs no framing: one datagram is one message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BeesError, Result};

/// Length of the big-endian size prefix
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Largest payload a 2-byte prefix can describe
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Per-connection reassembly buffer for length-prefixed messages.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every message that is now complete, in order.
    ///
    /// Incomplete prefixes and bodies stay buffered for the next call.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.next_message() {
            messages.push(message);
        }
        messages
    }

    fn next_message(&mut self) -> Option<Bytes> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return None;
        }

        let declared = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < LENGTH_PREFIX_LEN + declared {
            return None;
        }

        self.buf.advance(LENGTH_PREFIX_LEN);
        Some(self.buf.split_to(declared).freeze())
    }

    /// Prefix `message` with its 2-byte big-endian length.
    pub fn wrap(message: &[u8]) -> Result<Bytes> {
        if message.len() > MAX_MESSAGE_LEN {
            return Err(BeesError::MessageTooLarge { len: message.len() });
        }

        let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + message.len());
        out.put_u16(message.len() as u16);
        out.extend_from_slice(message);
        Ok(out.freeze())
    }

    /// Bytes received but not yet part of a complete message
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
