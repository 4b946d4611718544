//! The transport port: an abstract rank/tag byte transport with collectives.
//!
//! The runtime consumes the capability set of an MPI-style communicator:
//! buffered tagged point-to-point sends, blocking and non-blocking probes,
//! matched receives, barrier, all-reduce, and duplication into logically
//! independent channels. Implementations may layer these over MPI, a socket
//! mesh, or the in-process [`memory`] cluster used by the test suite.
//!
//! Ordering contract: the transport is lossless and FIFO per
//! `(source, dest, tag)` triple. Messages from distinct sources to the same
//! destination have no guaranteed relative order.

use crate::Error;
use bytes::Bytes;

pub mod memory;

/// Probe state value for "a message is waiting".
pub const MSG_WAITING: i32 = 1;

/// Probe state value for "nothing is waiting".
pub const NO_MSG_WAITING: i32 = 0;

/// Snapshot of the next matching message, produced by a probe.
///
/// A status does not consume the message it describes; a matched receive
/// with the resolved source and tag will.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    state: i32,
    source: i32,
    tag: i32,
    bytes: Option<usize>,
}

impl Status {
    /// A status describing a waiting message.
    ///
    /// `bytes` is `None` when the transport could not determine the size
    /// (the undefined sentinel); receivers treat such messages as absent.
    pub const fn waiting(source: i32, tag: i32, bytes: Option<usize>) -> Self {
        Self {
            state: MSG_WAITING,
            source,
            tag,
            bytes,
        }
    }

    /// A status describing an empty slot.
    pub const fn idle() -> Self {
        Self {
            state: NO_MSG_WAITING,
            source: -1,
            tag: -1,
            bytes: None,
        }
    }

    /// Raw probe state, [`MSG_WAITING`] or [`NO_MSG_WAITING`].
    pub const fn state(&self) -> i32 {
        self.state
    }

    /// Whether a matching message is waiting.
    pub const fn is_waiting(&self) -> bool {
        self.state == MSG_WAITING
    }

    /// Source rank of the waiting message.
    pub const fn source(&self) -> i32 {
        self.source
    }

    /// Transport tag of the waiting message.
    pub const fn tag(&self) -> i32 {
        self.tag
    }

    /// Payload size of the waiting message, if the transport knows it.
    pub const fn byte_count(&self) -> Option<usize> {
        self.bytes
    }
}

/// Capability set consumed by the runtime.
///
/// One value of an implementing type is one endpoint of one logical
/// channel; [`Transport::dup`] derives further channels whose traffic never
/// mixes with the parent's.
pub trait Transport: Sized + 'static {
    /// Produces an independent logical channel.
    ///
    /// Collective: every rank must call `dup` on the same channel, in the
    /// same order relative to its other collectives.
    fn dup(&self) -> Result<Self, Error>;

    /// This endpoint's rank in `0..size`.
    fn rank(&self) -> i32;

    /// Number of ranks in the cluster.
    fn size(&self) -> i32;

    /// Buffered, non-blocking tagged send.
    ///
    /// The bytes are copied into the attached send buffer and the call
    /// returns immediately; delivery is asynchronous. Fails with
    /// [`Error::CapacityExceeded`] when the buffer cannot take the copy.
    fn bsend(&self, dest: i32, tag: i32, bytes: &[u8]) -> Result<(), Error>;

    /// Non-blocking probe for a matching message.
    ///
    /// `None` filters match any source or any tag.
    fn iprobe(&self, source: Option<i32>, tag: Option<i32>) -> Result<Status, Error>;

    /// Blocks until a matching message is waiting, then describes it.
    fn probe(&self, source: Option<i32>, tag: Option<i32>) -> Result<Status, Error>;

    /// Blocks until a message from `source` with `tag` arrives and takes it.
    fn recv(&self, source: i32, tag: i32) -> Result<Bytes, Error>;

    /// Blocks until every rank has entered the barrier on this channel.
    fn barrier(&self) -> Result<(), Error>;

    /// Sums `value` across all ranks; every rank receives the total.
    ///
    /// Collective, like [`Transport::barrier`].
    fn allreduce_sum(&self, value: i32) -> Result<i32, Error>;
}
