//! Compound messages: one atomic unit, two wire messages.
//!
//! A compound message pairs fixed-layout metadata with a variable-length
//! payload, sent back to back on the same `(dest, tag)` slot. Splitting
//! the unit in two lets the receiver discover the payload size at receive
//! time while keeping the metadata layout agreed in advance.
//!
//! Pairing relies on the transport's per-`(source, dest, tag)` FIFO: once
//! the metadata half from some source has arrived, that source's payload
//! half is the next message it has in flight on the slot, so the receiver
//! takes the second half from the *resolved concrete source* rather than
//! re-polling with the original filters. A channel carrying compound
//! traffic must carry nothing else.

use crate::{
    message::Message,
    record::{Record, SizedRecord},
    transport::Transport,
    Error,
};

/// Send/receive endpoint state for metadata + payload pairs.
#[derive(Debug, Default)]
pub struct Compound {
    metadata: Message,
    data: Message,
}

impl Compound {
    /// Creates an empty compound buffer.
    pub fn new() -> Self {
        Self {
            metadata: Message::new(),
            data: Message::new(),
        }
    }

    /// Sends `metadata` then one `data` record on `(dest, tag)`.
    pub fn send<T: Transport, M: Record, D: Record>(
        transport: &T,
        dest: i32,
        tag: i32,
        metadata: &M,
        data: &D,
    ) -> Result<(), Error> {
        Message::send(transport, dest, tag, metadata)?;
        Message::send(transport, dest, tag, data)
    }

    /// Sends `metadata` then a run of `data` records on `(dest, tag)`.
    pub fn send_slice<T: Transport, M: Record, D: Record>(
        transport: &T,
        dest: i32,
        tag: i32,
        metadata: &M,
        data: &[D],
    ) -> Result<(), Error> {
        Message::send(transport, dest, tag, metadata)?;
        Message::send_slice(transport, dest, tag, data)
    }

    /// Receives the next compound pair matching the filters, if waiting.
    ///
    /// Returns `Ok(false)` when no metadata half matches, or when either
    /// half reports an undefined byte count; nothing is published in that
    /// case.
    pub fn receive<T: Transport>(
        &mut self,
        transport: &T,
        source: Option<i32>,
        tag: Option<i32>,
    ) -> Result<bool, Error> {
        if !self.metadata.receive(transport, source, tag)? {
            return Ok(false);
        }
        // The payload half is already in flight from the resolved sender;
        // wait for exactly that message so the pair can never split.
        if !self
            .data
            .receive_matched(transport, self.metadata.source(), self.metadata.tag())?
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// Decodes the metadata half.
    pub fn metadata<M: Record>(&self) -> Result<M, Error> {
        self.metadata.data()
    }

    /// Decodes the front of the payload half as one record.
    pub fn data<D: Record>(&self) -> Result<D, Error> {
        self.data.data()
    }

    /// Decodes the payload half into `out`, element by element.
    pub fn data_slice<D: SizedRecord>(&self, out: &mut [D]) -> Result<(), Error> {
        self.data.data_slice(out)
    }

    /// Metadata size in bytes.
    pub fn metadata_size(&self) -> usize {
        self.metadata.data_size()
    }

    /// Metadata size in elements of `M`.
    pub fn metadata_size_of<M: SizedRecord>(&self) -> usize {
        self.metadata.data_size_of::<M>()
    }

    /// Payload size in bytes.
    pub fn data_size(&self) -> usize {
        self.data.data_size()
    }

    /// Payload size in elements of `D`.
    pub fn data_size_of<D: SizedRecord>(&self) -> usize {
        self.data.data_size_of::<D>()
    }

    /// Source rank of the last received pair.
    pub fn source(&self) -> i32 {
        self.metadata.source()
    }

    /// Transport tag of the last received pair.
    pub fn tag(&self) -> i32 {
        self.metadata.tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::Cluster;
    use bytes::{Buf, BufMut};

    struct Meta {
        x: f64,
        y: f64,
        z: i32,
    }

    impl Record for Meta {
        fn write<B: BufMut>(&self, buf: &mut B) {
            self.x.write(buf);
            self.y.write(buf);
            self.z.write(buf);
        }

        fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
            Ok(Self {
                x: f64::read(buf)?,
                y: f64::read(buf)?,
                z: i32::read(buf)?,
            })
        }

        fn len_encoded(&self) -> usize {
            Self::LEN
        }
    }

    impl SizedRecord for Meta {
        const LEN: usize = 20;
    }

    struct Payload {
        a: i32,
        b: i32,
        c: f64,
    }

    impl Record for Payload {
        fn write<B: BufMut>(&self, buf: &mut B) {
            self.a.write(buf);
            self.b.write(buf);
            self.c.write(buf);
        }

        fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
            Ok(Self {
                a: i32::read(buf)?,
                b: i32::read(buf)?,
                c: f64::read(buf)?,
            })
        }

        fn len_encoded(&self) -> usize {
            Self::LEN
        }
    }

    impl SizedRecord for Payload {
        const LEN: usize = 16;
    }

    #[test]
    fn both_halves_stay_paired_in_reverse_tag_order() {
        Cluster::run(3, |transport| {
            let rank = transport.rank();
            let size = transport.size();
            let send_rank = (rank + 1) % size;
            let recv_rank = (rank - 1 + size) % size;

            for tag in 0..5 {
                let meta = Meta {
                    x: 0.0,
                    y: 0.1 * f64::from(rank),
                    z: rank,
                };
                let payload = Payload {
                    a: rank,
                    b: tag,
                    c: 0.1,
                };
                Compound::send(&transport, send_rank, tag, &meta, &payload).unwrap();
            }
            transport.barrier().unwrap();

            let mut compound = Compound::new();
            for tag in (0..5).rev() {
                assert!(compound.receive(&transport, None, Some(tag)).unwrap());
                assert_eq!(compound.data_size(), Payload::LEN);
                assert_eq!(compound.data_size_of::<Payload>(), 1);
                assert_eq!(compound.metadata_size(), Meta::LEN);
                assert_eq!(compound.source(), recv_rank);
                assert_eq!(compound.tag(), tag);

                let payload = compound.data::<Payload>().unwrap();
                assert_eq!(payload.a, recv_rank);
                assert_eq!(payload.b, tag);
                assert!((payload.c - 0.1).abs() < 1e-4);

                let meta = compound.metadata::<Meta>().unwrap();
                assert!((meta.x - 0.0).abs() < 1e-4);
                assert!((meta.y - 0.1 * f64::from(recv_rank)).abs() < 1e-4);
                assert_eq!(meta.z, recv_rank);
            }

            assert!(!compound.receive(&transport, None, None).unwrap());
            transport.barrier().unwrap();
        });
    }

    #[test]
    fn metadata_can_carry_the_payload_length() {
        Cluster::run(2, |transport| {
            let rank = transport.rank();
            let send_rank = (rank + 1) % 2;
            let values: Vec<i32> = (0..10).collect();

            Compound::send_slice(&transport, send_rank, 0, &(values.len() as i32), &values)
                .unwrap();
            transport.barrier().unwrap();

            let mut compound = Compound::new();
            assert!(compound.receive(&transport, None, Some(0)).unwrap());

            let count = compound.metadata::<i32>().unwrap();
            assert_eq!(count, 10);

            let mut received = vec![0i32; count as usize];
            compound.data_slice(&mut received).unwrap();
            assert_eq!(received, values);
        });
    }
}
