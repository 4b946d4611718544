//! In-process transport: every rank is a thread of one OS process.
//!
//! Backs the test suite and single-machine runs. Each logical channel owns
//! one mailbox per destination rank; a mailbox is a FIFO of packets under a
//! mutex, so matching scans arrival order and the per-`(source, dest, tag)`
//! FIFO contract holds by construction. Collectives (barrier, all-reduce,
//! channel duplication) rendezvous on a generation-counted slot.
//!
//! Buffered sends are accounted against a per-rank in-flight byte budget:
//! a send reserves its payload size, the matching receive releases it, and
//! a send that would exceed [`Config::send_buffer`] fails with
//! [`Error::CapacityExceeded`].
//!
//! If a rank thread panics, the cluster is marked down and every blocked
//! peer fails with [`Error::TransportUnavailable`] instead of hanging.

use super::{Status, Transport};
use crate::Error;
use bytes::Bytes;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{
    collections::VecDeque,
    fmt,
    panic,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
};
use tracing::warn;

/// Default per-rank send buffer (1 MiB).
const DEFAULT_SEND_BUFFER: usize = 1 << 20;

/// Configuration for an in-process cluster.
pub struct Config {
    /// Per-rank budget for bytes accepted by `bsend` but not yet received.
    pub send_buffer: usize,
    /// Registry for prometheus metrics.
    pub registry: Arc<Mutex<Registry>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_buffer: DEFAULT_SEND_BUFFER,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

/// One message in flight.
struct Packet {
    source: i32,
    tag: i32,
    payload: Bytes,
}

impl Packet {
    fn matches(&self, source: Option<i32>, tag: Option<i32>) -> bool {
        source.map_or(true, |source| source == self.source)
            && tag.map_or(true, |tag| tag == self.tag)
    }
}

struct Mailbox {
    queue: Mutex<VecDeque<Packet>>,
    arrived: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }
}

#[derive(Clone, Copy)]
enum Op {
    Barrier,
    Sum,
    Dup,
}

struct CollectiveState {
    arrived: i32,
    acc: i32,
    result: i32,
    generation: u64,
}

/// Rendezvous slot for one channel's collectives.
///
/// The last rank to arrive computes the result, resets the slot, and bumps
/// the generation; waiters hold the lock when they observe the bump, so the
/// result stays valid until every waiter of that generation has left.
struct Collective {
    state: Mutex<CollectiveState>,
    released: Condvar,
}

impl Collective {
    fn new() -> Self {
        Self {
            state: Mutex::new(CollectiveState {
                arrived: 0,
                acc: 0,
                result: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }
}

struct ChannelState {
    boxes: Vec<Mailbox>,
    collective: Collective,
}

impl ChannelState {
    fn new(size: i32) -> Self {
        Self {
            boxes: (0..size).map(|_| Mailbox::new()).collect(),
            collective: Collective::new(),
        }
    }
}

struct Shared {
    size: i32,
    send_buffer: usize,
    in_flight: Vec<AtomicUsize>,
    channels: Mutex<Vec<Arc<ChannelState>>>,
    down: AtomicBool,
    sent: Counter,
    received: Counter,
}

impl Shared {
    fn channel(&self, index: usize) -> Result<Arc<ChannelState>, Error> {
        let channels = self
            .channels
            .lock()
            .map_err(|_| Error::TransportUnavailable)?;
        channels.get(index).cloned().ok_or(Error::TransportUnavailable)
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Marks the cluster down and wakes every blocked rank.
    fn poison(&self) {
        self.down.store(true, Ordering::SeqCst);
        let channels: Vec<Arc<ChannelState>> = match self.channels.lock() {
            Ok(channels) => channels.iter().cloned().collect(),
            Err(_) => return,
        };
        for channel in channels {
            for mailbox in &channel.boxes {
                let _guard = mailbox.queue.lock();
                mailbox.arrived.notify_all();
            }
            let _guard = channel.collective.state.lock();
            channel.collective.released.notify_all();
        }
    }
}

/// One rank's endpoint on one logical channel of an in-process cluster.
pub struct Memory {
    shared: Arc<Shared>,
    rank: i32,
    channel: usize,
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("rank", &self.rank)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Memory {
    fn rendezvous(&self, op: Op, contribute: i32) -> Result<i32, Error> {
        if self.shared.is_down() {
            return Err(Error::TransportUnavailable);
        }
        let channel = self.shared.channel(self.channel)?;
        let mut state = channel
            .collective
            .state
            .lock()
            .map_err(|_| Error::TransportUnavailable)?;
        let generation = state.generation;
        state.acc += contribute;
        state.arrived += 1;
        if state.arrived == self.shared.size {
            state.result = match op {
                Op::Barrier => 0,
                Op::Sum => state.acc,
                Op::Dup => self.allocate_channel()? as i32,
            };
            state.acc = 0;
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            channel.collective.released.notify_all();
            Ok(state.result)
        } else {
            while state.generation == generation {
                if self.shared.is_down() {
                    return Err(Error::TransportUnavailable);
                }
                state = channel
                    .collective
                    .released
                    .wait(state)
                    .map_err(|_| Error::TransportUnavailable)?;
            }
            Ok(state.result)
        }
    }

    fn allocate_channel(&self) -> Result<usize, Error> {
        let mut channels = self
            .shared
            .channels
            .lock()
            .map_err(|_| Error::TransportUnavailable)?;
        channels.push(Arc::new(ChannelState::new(self.shared.size)));
        Ok(channels.len() - 1)
    }
}

impl Transport for Memory {
    fn dup(&self) -> Result<Self, Error> {
        let channel = self.rendezvous(Op::Dup, 0)? as usize;
        Ok(Self {
            shared: self.shared.clone(),
            rank: self.rank,
            channel,
        })
    }

    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.shared.size
    }

    fn bsend(&self, dest: i32, tag: i32, bytes: &[u8]) -> Result<(), Error> {
        assert!(
            dest >= 0 && dest < self.shared.size,
            "destination rank {dest} out of range for cluster of {}",
            self.shared.size
        );
        if self.shared.is_down() {
            return Err(Error::TransportUnavailable);
        }

        // Reserve buffer space before touching the mailbox; the receive
        // path releases it.
        let len = bytes.len();
        let in_flight = &self.shared.in_flight[self.rank as usize];
        let previous = in_flight.fetch_add(len, Ordering::SeqCst);
        if previous + len > self.shared.send_buffer {
            in_flight.fetch_sub(len, Ordering::SeqCst);
            return Err(Error::CapacityExceeded(previous + len));
        }

        let channel = self.shared.channel(self.channel)?;
        let mailbox = &channel.boxes[dest as usize];
        let mut queue = mailbox
            .queue
            .lock()
            .map_err(|_| Error::TransportUnavailable)?;
        queue.push_back(Packet {
            source: self.rank,
            tag,
            payload: Bytes::copy_from_slice(bytes),
        });
        mailbox.arrived.notify_all();
        self.shared.sent.inc();
        Ok(())
    }

    fn iprobe(&self, source: Option<i32>, tag: Option<i32>) -> Result<Status, Error> {
        if self.shared.is_down() {
            return Err(Error::TransportUnavailable);
        }
        let channel = self.shared.channel(self.channel)?;
        let queue = channel.boxes[self.rank as usize]
            .queue
            .lock()
            .map_err(|_| Error::TransportUnavailable)?;
        Ok(match queue.iter().find(|packet| packet.matches(source, tag)) {
            Some(packet) => Status::waiting(packet.source, packet.tag, Some(packet.payload.len())),
            None => Status::idle(),
        })
    }

    fn probe(&self, source: Option<i32>, tag: Option<i32>) -> Result<Status, Error> {
        let channel = self.shared.channel(self.channel)?;
        let mailbox = &channel.boxes[self.rank as usize];
        let mut queue = mailbox
            .queue
            .lock()
            .map_err(|_| Error::TransportUnavailable)?;
        loop {
            if let Some(packet) = queue.iter().find(|packet| packet.matches(source, tag)) {
                return Ok(Status::waiting(
                    packet.source,
                    packet.tag,
                    Some(packet.payload.len()),
                ));
            }
            if self.shared.is_down() {
                return Err(Error::TransportUnavailable);
            }
            queue = mailbox
                .arrived
                .wait(queue)
                .map_err(|_| Error::TransportUnavailable)?;
        }
    }

    fn recv(&self, source: i32, tag: i32) -> Result<Bytes, Error> {
        let channel = self.shared.channel(self.channel)?;
        let mailbox = &channel.boxes[self.rank as usize];
        let mut queue = mailbox
            .queue
            .lock()
            .map_err(|_| Error::TransportUnavailable)?;
        loop {
            let position = queue
                .iter()
                .position(|packet| packet.source == source && packet.tag == tag);
            if let Some(position) = position {
                if let Some(packet) = queue.remove(position) {
                    self.shared.in_flight[packet.source as usize]
                        .fetch_sub(packet.payload.len(), Ordering::SeqCst);
                    self.shared.received.inc();
                    return Ok(packet.payload);
                }
            }
            if self.shared.is_down() {
                return Err(Error::TransportUnavailable);
            }
            queue = mailbox
                .arrived
                .wait(queue)
                .map_err(|_| Error::TransportUnavailable)?;
        }
    }

    fn barrier(&self) -> Result<(), Error> {
        self.rendezvous(Op::Barrier, 0).map(|_| ())
    }

    fn allreduce_sum(&self, value: i32) -> Result<i32, Error> {
        self.rendezvous(Op::Sum, value)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        // A rank unwinding mid-collective would leave its peers blocked
        // forever; fail them instead.
        if thread::panicking() {
            warn!(rank = self.rank, "rank panicked; taking cluster down");
            self.shared.poison();
        }
    }
}

/// Builder and thread-per-rank harness for in-process clusters.
pub struct Cluster;

impl Cluster {
    /// Creates the endpoints of a `size`-rank cluster, one per rank, all on
    /// the base channel.
    pub fn new(size: i32, cfg: Config) -> Vec<Memory> {
        assert!(size > 0, "cluster size must be positive");
        let sent = Counter::default();
        let received = Counter::default();
        {
            let mut registry = cfg.registry.lock().unwrap();
            registry.register(
                "messages_sent",
                "Messages accepted for delivery",
                sent.clone(),
            );
            registry.register(
                "messages_received",
                "Messages drained by receivers",
                received.clone(),
            );
        }
        let shared = Arc::new(Shared {
            size,
            send_buffer: cfg.send_buffer,
            in_flight: (0..size).map(|_| AtomicUsize::new(0)).collect(),
            channels: Mutex::new(vec![Arc::new(ChannelState::new(size))]),
            down: AtomicBool::new(false),
            sent,
            received,
        });
        (0..size)
            .map(|rank| Memory {
                shared: shared.clone(),
                rank,
                channel: 0,
            })
            .collect()
    }

    /// Runs `f` once per rank, each on its own thread, and returns the
    /// per-rank results in rank order.
    ///
    /// A panic on any rank takes the cluster down (unblocking the others)
    /// and is then resumed on the calling thread.
    pub fn run<F, R>(size: i32, f: F) -> Vec<R>
    where
        F: Fn(Memory) -> R + Send + Sync,
        R: Send,
    {
        Self::run_with(size, Config::default(), f)
    }

    /// Like [`Cluster::run`] with explicit configuration.
    pub fn run_with<F, R>(size: i32, cfg: Config, f: F) -> Vec<R>
    where
        F: Fn(Memory) -> R + Send + Sync,
        R: Send,
    {
        let endpoints = Self::new(size, cfg);
        thread::scope(|scope| {
            let f = &f;
            let mut handles = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                let handle = thread::Builder::new()
                    .name(format!("rank-{}", endpoint.rank))
                    .spawn_scoped(scope, move || f(endpoint))
                    .expect("failed to spawn rank thread");
                handles.push(handle);
            }
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| panic::resume_unwind(payload))
                })
                .collect()
        })
    }
}
