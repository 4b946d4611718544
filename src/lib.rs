#![doc = include_str!("../README.md")]

use thiserror::Error;

pub mod actor;
pub mod compound;
pub mod director;
pub mod factory;
pub mod id;
pub mod message;
pub mod record;
pub mod spawn;
pub mod transport;

pub use actor::{Actor, Context, Delivery};
pub use compound::Compound;
pub use director::{Config, Director, END};
pub use factory::Factory;
pub use id::{Id, Minter};
pub use message::Message;
pub use record::{Record, SizedRecord};
pub use spawn::{DistributedFactory, BIRTH_REQUEST};
pub use transport::{Status, Transport, MSG_WAITING};

/// Failures surfaced by the runtime.
///
/// Transport faults are fatal to the director that observes them; factory
/// lookup failures indicate that ranks registered different actor classes
/// (a protocol mismatch). Malformed receives are not represented here: the
/// message layer reports them as "nothing waiting" and the scheduler moves
/// on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A channel operation failed, typically because a peer rank went away.
    #[error("transport unavailable")]
    TransportUnavailable,
    /// A buffered send was refused because the attached send buffer is full.
    #[error("send buffer exhausted: {0} bytes in flight")]
    CapacityExceeded(usize),
    /// An actor class was looked up before being registered on this rank.
    #[error("actor class not registered: {0}")]
    ClassNotRegistered(&'static str),
    /// A birth request named a class index outside the registry.
    #[error("bad class index: {0}")]
    BadClassIndex(usize),
    /// A payload was shorter than the record type decoded from it.
    #[error("record truncated: {remaining} of {required} bytes available")]
    TruncatedRecord {
        /// Bytes the record layout requires.
        required: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },
}
