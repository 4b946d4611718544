//! Cross-rank actor placement.
//!
//! The distributed factory wraps the class registry with a placement
//! protocol: a rank that wants a child picks the target rank (round-robin
//! unless the caller prefers one), mints the child's [`Id`], and sends a
//! birth request to the target over the factory's own channel. The
//! requester gets the predicted id back immediately: the transport's
//! FIFO ordering guarantees the birth request reaches the target before
//! any message the requester subsequently addresses to the child.

use crate::{
    actor::Actor,
    factory::Factory,
    id::{Id, Minter},
    message::Message,
    record::{Record, SizedRecord},
    transport::Transport,
    Error,
};
use bytes::{Buf, BufMut};
use tracing::{trace, warn};

/// Transport tag for birth requests on the factory channel.
pub const BIRTH_REQUEST: i32 = 0;

/// Wire form of one birth request: three native-endian `i32`s.
struct SpawnRequest {
    class_index: i32,
    rank: i32,
    gid: i32,
}

impl Record for SpawnRequest {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.class_index.write(buf);
        self.rank.write(buf);
        self.gid.write(buf);
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        Ok(Self {
            class_index: i32::read(buf)?,
            rank: i32::read(buf)?,
            gid: i32::read(buf)?,
        })
    }

    fn len_encoded(&self) -> usize {
        Self::LEN
    }
}

impl SizedRecord for SpawnRequest {
    const LEN: usize = 12;
}

/// Class registry plus cross-rank placement.
pub struct DistributedFactory<T: Transport> {
    channel: T,
    factory: Factory<T>,
    minter: Minter,
    cursor: i32,
}

impl<T: Transport> DistributedFactory<T> {
    /// Creates the factory, duplicating `base` for its private channel.
    ///
    /// Collective: every rank must construct its factory at the same point
    /// in its collective schedule.
    pub fn new(base: &T) -> Result<Self, Error> {
        let channel = base.dup()?;
        let rank = channel.rank();
        let size = channel.size();
        Ok(Self {
            channel,
            factory: Factory::new(),
            minter: Minter::new(rank, size),
            cursor: rank,
        })
    }

    /// Local rank.
    pub fn rank(&self) -> i32 {
        self.channel.rank()
    }

    /// Cluster size.
    pub fn size(&self) -> i32 {
        self.channel.size()
    }

    /// Registers class `A`; see [`Factory::register`].
    pub fn register<A: Actor<T> + Default>(&mut self) -> usize {
        self.factory.register::<A>()
    }

    /// Mints an id placed on `preferred`, or round-robin when `None`.
    pub fn new_id(&mut self, preferred: Option<i32>) -> Id {
        let rank = match preferred {
            Some(rank) if rank >= 0 => rank,
            _ => {
                let rank = self.cursor;
                self.cursor = (self.cursor + 1) % self.size();
                rank
            }
        };
        Id::new(rank, self.minter.next_gid())
    }

    /// Requests that an instance of `A` be created on some rank.
    ///
    /// Returns the child's id immediately; it is valid for addressing
    /// before the child exists.
    pub fn request<A: Actor<T> + Default>(&mut self, preferred: Option<i32>) -> Result<Id, Error> {
        let class_index = self.factory.class_index::<A>()?;
        let id = self.new_id(preferred);
        let request = SpawnRequest {
            class_index: class_index as i32,
            rank: id.rank(),
            gid: id.gid(),
        };
        Message::send(&self.channel, id.rank(), BIRTH_REQUEST, &request)?;
        trace!(class = class_index, id = %id, "birth requested");
        Ok(id)
    }

    /// Whether a birth request is waiting for this rank.
    pub fn has_pending(&self) -> Result<bool, Error> {
        Ok(self
            .channel
            .iprobe(None, Some(BIRTH_REQUEST))?
            .is_waiting())
    }

    /// Constructs the next requested child, if one is waiting.
    pub fn next_spawn(&mut self) -> Result<Option<(Box<dyn Actor<T>>, Id)>, Error> {
        let mut message = Message::new();
        if !message.receive(&self.channel, None, Some(BIRTH_REQUEST))? {
            return Ok(None);
        }
        let request: SpawnRequest = message.data()?;
        let actor = self.factory.create(request.class_index as usize)?;
        let id = Id::new(request.rank, request.gid);
        trace!(id = %id, "birth granted");
        Ok(Some((actor, id)))
    }

    /// Drains pending birth requests without constructing anything.
    ///
    /// Their ids are already lost; dropping the requests keeps the send
    /// buffer from leaking at shutdown.
    fn drain(&mut self) -> Result<(), Error> {
        let mut message = Message::new();
        while message.receive(&self.channel, None, Some(BIRTH_REQUEST))? {}
        Ok(())
    }
}

impl<T: Transport> Drop for DistributedFactory<T> {
    fn drop(&mut self) {
        if let Err(err) = self.drain() {
            warn!(?err, "failed to drain pending birth requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actor::Context,
        transport::memory::{Cluster, Memory},
    };

    #[derive(Default)]
    struct Null;

    impl<T: Transport> Actor<T> for Null {
        fn step(&mut self, _ctx: &mut Context<'_, T>) {}
    }

    #[test]
    fn round_robin_starts_at_the_local_rank() {
        Cluster::run(1, |transport| {
            let mut factory = DistributedFactory::new(&transport).unwrap();
            let first = factory.new_id(None);
            let second = factory.new_id(None);
            let placed = factory.new_id(Some(0));
            assert_eq!(first.rank(), 0);
            assert_eq!(second.rank(), 0);
            assert_eq!(placed.rank(), 0);
            assert_eq!(first.gid(), 0);
            assert_eq!(second.gid(), 1);
            assert_eq!(placed.gid(), 2);
        });
    }

    #[test]
    fn requests_construct_children_on_their_target_ranks() {
        Cluster::run(2, |transport| {
            let mut factory = DistributedFactory::new(&transport).unwrap();
            factory.register::<Null>();

            let requests = 5 * transport.size();
            if transport.rank() == 0 {
                for _ in 0..requests {
                    factory.request::<Null>(None).unwrap();
                }
            }
            transport.barrier().unwrap();

            // Round-robin from rank 0 lands half of the requests here.
            let mut granted = 0;
            while factory.has_pending().unwrap() {
                let (_, id) = factory.next_spawn().unwrap().unwrap();
                assert_eq!(id.rank(), transport.rank());
                assert_eq!(id.gid() % transport.size(), 0);
                granted += 1;
            }
            assert_eq!(granted, requests / 2);
            assert!(factory.next_spawn().unwrap().is_none());
        });
    }

    #[test]
    fn minted_gids_are_unique_across_the_cluster() {
        Cluster::run(3, |transport| {
            let mut factory = DistributedFactory::new(&transport).unwrap();
            for _ in 0..5 {
                let gid = factory.new_id(None).gid();
                Message::send(&transport, 0, 0, &gid).unwrap();
            }
            transport.barrier().unwrap();

            if transport.rank() == 0 {
                let total = 5 * transport.size() as usize;
                let mut message = Message::new();
                let mut gids = Vec::with_capacity(total);
                while gids.len() < total {
                    if message.receive(&transport, None, Some(0)).unwrap() {
                        let gid: i32 = message.data().unwrap();
                        assert_eq!(gid % transport.size(), message.source());
                        gids.push(gid);
                    }
                }
                for (i, a) in gids.iter().enumerate() {
                    for (j, b) in gids.iter().enumerate() {
                        assert!(i == j || a != b, "gid {a} minted twice");
                    }
                }
            }
        });
    }

    #[test]
    fn pending_requests_are_drained_on_drop() {
        Cluster::run(2, |transport| {
            let mut factory = DistributedFactory::<Memory>::new(&transport).unwrap();
            factory.register::<Null>();
            if transport.rank() == 0 {
                factory.request::<Null>(Some(1)).unwrap();
            }
            transport.barrier().unwrap();
            if transport.rank() == 1 {
                assert!(factory.has_pending().unwrap());
            }
            // Dropping the factory must consume the request without
            // constructing the child.
            drop(factory);
        });
    }

    #[test]
    fn requesting_an_unregistered_class_fails() {
        Cluster::run(1, |transport| {
            let mut factory = DistributedFactory::<Memory>::new(&transport).unwrap();
            assert!(matches!(
                factory.request::<Null>(None),
                Err(Error::ClassNotRegistered(_))
            ));
        });
    }
}
