//! Length-discovered byte messages on a tagged slot.
//!
//! A [`Message`] owns the payload buffer of the last message it received
//! and recycles it across receives. Sends are static: the payload is
//! encoded and handed to the transport's buffered send, so the caller's
//! value can go out of scope immediately.
//!
//! This is a raw byte pipe. Interpretation is a contract between sender
//! and receiver: decoding a payload with the wrong record type yields
//! wrong answers, not errors (truncation is the only detected failure).

use crate::{
    record::{Record, SizedRecord},
    transport::Transport,
    Error,
};
use bytes::{Bytes, BytesMut};

/// Send/receive endpoint state for single byte payloads.
#[derive(Debug)]
pub struct Message {
    payload: Bytes,
    source: i32,
    tag: i32,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// Creates an empty message buffer.
    pub fn new() -> Self {
        Self {
            payload: Bytes::new(),
            source: -1,
            tag: -1,
        }
    }

    /// Sends one record to `(dest, tag)`.
    pub fn send<T: Transport, R: Record>(
        transport: &T,
        dest: i32,
        tag: i32,
        value: &R,
    ) -> Result<(), Error> {
        transport.bsend(dest, tag, &value.encode())
    }

    /// Sends a contiguous run of records to `(dest, tag)` as one payload.
    pub fn send_slice<T: Transport, R: Record>(
        transport: &T,
        dest: i32,
        tag: i32,
        values: &[R],
    ) -> Result<(), Error> {
        let total: usize = values.iter().map(Record::len_encoded).sum();
        let mut buf = BytesMut::with_capacity(total);
        for value in values {
            value.write(&mut buf);
        }
        transport.bsend(dest, tag, &buf)
    }

    /// Receives the next message matching the filters, if one is waiting.
    ///
    /// Atomic: probes, resolves the concrete source and tag, then performs
    /// a matched blocking receive for exactly that message. Returns
    /// `Ok(false)` when nothing matches, and also when the transport
    /// reports an undefined byte count (a malformed message is treated as
    /// no message).
    pub fn receive<T: Transport>(
        &mut self,
        transport: &T,
        source: Option<i32>,
        tag: Option<i32>,
    ) -> Result<bool, Error> {
        let status = transport.iprobe(source, tag)?;
        if !status.is_waiting() {
            return Ok(false);
        }
        if status.byte_count().is_none() {
            return Ok(false);
        }
        self.payload = transport.recv(status.source(), status.tag())?;
        self.source = status.source();
        self.tag = status.tag();
        Ok(true)
    }

    /// Blocks for the next message from exactly `(source, tag)`.
    ///
    /// Used for the second half of a compound pair, which is known to be
    /// in flight once the first half has arrived.
    pub(crate) fn receive_matched<T: Transport>(
        &mut self,
        transport: &T,
        source: i32,
        tag: i32,
    ) -> Result<bool, Error> {
        let status = transport.probe(Some(source), Some(tag))?;
        if status.byte_count().is_none() {
            return Ok(false);
        }
        self.payload = transport.recv(status.source(), status.tag())?;
        self.source = status.source();
        self.tag = status.tag();
        Ok(true)
    }

    /// Decodes the front of the payload as one record.
    pub fn data<R: Record>(&self) -> Result<R, Error> {
        R::decode(self.payload.clone())
    }

    /// Decodes the payload into `out`, element by element.
    pub fn data_slice<R: SizedRecord>(&self, out: &mut [R]) -> Result<(), Error> {
        let mut buf = self.payload.clone();
        for slot in out {
            *slot = R::read(&mut buf)?;
        }
        Ok(())
    }

    /// Payload size in bytes.
    pub fn data_size(&self) -> usize {
        self.payload.len()
    }

    /// Payload size in elements of `R`.
    pub fn data_size_of<R: SizedRecord>(&self) -> usize {
        self.payload.len() / R::LEN
    }

    /// Source rank of the last received message.
    pub fn source(&self) -> i32 {
        self.source
    }

    /// Transport tag of the last received message.
    pub fn tag(&self) -> i32 {
        self.tag
    }
}
