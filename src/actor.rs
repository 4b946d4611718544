//! The actor-facing API.
//!
//! An actor is user state plus one behaviour: [`Actor::step`], invoked
//! repeatedly by the director until the actor marks itself dead. Inside a
//! step the actor talks to the world exclusively through [`Context`]: it
//! can send tagged records to peers, poll its own mailbox, spawn children,
//! and die. It must not block, touch the transport directly, or
//! communicate while being constructed or dropped.
//!
//! Addressing: a message to `peer` travels on the actor channel to rank
//! `peer.rank()` with transport tag `peer.gid()`. Because gids are unique
//! cluster-wide, receivers filter by their own gid and never see traffic
//! for anyone else; the user-level tag rides in the metadata half and is
//! free for protocol use.

use crate::{
    compound::Compound,
    id::Id,
    record::{Record, SizedRecord},
    spawn::DistributedFactory,
    transport::Transport,
    Error,
};
use bytes::{Buf, BufMut};
use tracing::warn;

/// Behaviour of one actor class.
///
/// Implementors also need [`Default`] to be registrable with the factory:
/// children are constructed on their target rank with no arguments and
/// learn everything else from messages.
pub trait Actor<T: Transport>: 'static {
    /// One scheduling quantum.
    ///
    /// Called by the director in round-robin order with every other
    /// resident actor. Must return promptly; an actor that never returns
    /// halts its whole rank.
    fn step(&mut self, ctx: &mut Context<'_, T>);
}

/// Metadata half of every actor-to-actor message.
///
/// Wire layout: `i32 sender_rank, i32 sender_gid, i32 user_tag`, native
/// endianness, 12 bytes.
pub(crate) struct Envelope {
    pub sender: Id,
    pub user_tag: i32,
}

impl Record for Envelope {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.sender.write(buf);
        self.user_tag.write(buf);
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        Ok(Self {
            sender: Id::read(buf)?,
            user_tag: i32::read(buf)?,
        })
    }

    fn len_encoded(&self) -> usize {
        Self::LEN
    }
}

impl SizedRecord for Envelope {
    const LEN: usize = 12;
}

/// A received actor message.
///
/// Reusable: allocate one, pass it to [`Context::receive`] in a loop. The
/// accessors reflect the last receive that returned `true`.
#[derive(Default)]
pub struct Delivery {
    inner: Compound,
    sender: Id,
    user_tag: i32,
}

impl Delivery {
    /// Creates an empty delivery buffer.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn receive<T: Transport>(
        &mut self,
        transport: &T,
        own_gid: i32,
    ) -> Result<bool, Error> {
        if !self.inner.receive(transport, None, Some(own_gid))? {
            return Ok(false);
        }
        match self.inner.metadata::<Envelope>() {
            Ok(envelope) => {
                self.sender = envelope.sender;
                self.user_tag = envelope.user_tag;
                Ok(true)
            }
            Err(err) => {
                warn!(?err, "discarding message with malformed envelope");
                Ok(false)
            }
        }
    }

    /// Id of the sending actor.
    pub fn sender(&self) -> Id {
        self.sender
    }

    /// User-level tag chosen by the sender.
    pub fn tag(&self) -> i32 {
        self.user_tag
    }

    /// Decodes the front of the payload as one record.
    pub fn data<R: Record>(&self) -> Result<R, Error> {
        self.inner.data()
    }

    /// Decodes the payload into `out`, element by element.
    pub fn data_slice<R: SizedRecord>(&self, out: &mut [R]) -> Result<(), Error> {
        self.inner.data_slice(out)
    }

    /// Payload size in bytes.
    pub fn data_size(&self) -> usize {
        self.inner.data_size()
    }

    /// Payload size in elements of `R`.
    pub fn data_size_of<R: SizedRecord>(&self) -> usize {
        self.inner.data_size_of::<R>()
    }
}

/// Capability surface handed to [`Actor::step`].
pub struct Context<'a, T: Transport> {
    id: Id,
    dead: &'a mut bool,
    channel: &'a T,
    factory: &'a mut DistributedFactory<T>,
}

impl<'a, T: Transport> Context<'a, T> {
    pub(crate) fn new(
        id: Id,
        dead: &'a mut bool,
        channel: &'a T,
        factory: &'a mut DistributedFactory<T>,
    ) -> Self {
        Self {
            id,
            dead,
            channel,
            factory,
        }
    }

    /// This actor's own id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Sends one record to `peer` with a user-level tag.
    pub fn send<R: Record>(&self, peer: Id, value: &R, user_tag: i32) -> Result<(), Error> {
        let envelope = Envelope {
            sender: self.id,
            user_tag,
        };
        Compound::send(self.channel, peer.rank(), peer.gid(), &envelope, value)
    }

    /// Sends a run of records to `peer` as one message.
    pub fn send_slice<R: Record>(
        &self,
        peer: Id,
        values: &[R],
        user_tag: i32,
    ) -> Result<(), Error> {
        let envelope = Envelope {
            sender: self.id,
            user_tag,
        };
        Compound::send_slice(self.channel, peer.rank(), peer.gid(), &envelope, values)
    }

    /// Polls this actor's mailbox.
    ///
    /// Fills `msg` and returns `true` iff a message was waiting.
    pub fn receive(&self, msg: &mut Delivery) -> Result<bool, Error> {
        msg.receive(self.channel, self.id.gid())
    }

    /// Spawns a child of class `A` on a runtime-chosen rank.
    ///
    /// The returned id is valid for addressing immediately.
    pub fn spawn<A: Actor<T> + Default>(&mut self) -> Result<Id, Error> {
        self.factory.request::<A>(None)
    }

    /// Marks this actor dead. Idempotent; the flag never clears.
    pub fn die(&mut self) {
        *self.dead = true;
    }

    /// Whether [`Context::die`] has been called.
    pub fn is_dead(&self) -> bool {
        *self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_layout_is_three_ints() {
        let envelope = Envelope {
            sender: Id::new(2, 6),
            user_tag: 9,
        };
        let encoded = envelope.encode();
        assert_eq!(encoded.len(), Envelope::LEN);

        let decoded = Envelope::decode(encoded).unwrap();
        assert_eq!(decoded.sender, Id::new(2, 6));
        assert_eq!(decoded.user_tag, 9);
    }
}
