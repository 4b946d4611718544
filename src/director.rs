//! The per-rank scheduler.
//!
//! One director runs on each rank. It owns the rank's actor queue and
//! drives it cooperatively: every tick it services arriving birth
//! requests, polls for an end signal, periodically joins the cluster-wide
//! termination check, then runs the next actor's step and either requeues
//! it or reclaims it if it died.
//!
//! Three logical channels ride the supplied base transport, duplicated at
//! construction in fixed order: the factory channel (birth requests), the
//! actor channel (user messages), and the director channel (end signals
//! and collectives). Separation keeps tag spaces independent and lets each
//! channel drain on its own at shutdown.
//!
//! Termination is decided collectively. At every `sync_interval`-th tick
//! the ranks rendezvous, drain in-flight births so nothing alive goes
//! uncounted, and all-reduce both the end votes and the global load; every
//! rank therefore reaches the same verdict on the same tick, which keeps
//! the collective schedules aligned. A rank that has observed an end
//! signal keeps ticking until that shared verdict lands.

use crate::{
    actor::{Actor, Context},
    id::Id,
    message::Message,
    spawn::DistributedFactory,
    transport::Transport,
    Error,
};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    sync::{Arc, Mutex},
};
use tracing::{debug, trace, warn};

/// Transport tag for end signals on the director channel.
pub const END: i32 = 1;

/// Director configuration.
pub struct Config {
    /// Ticks between cluster-wide termination checks. Must be positive.
    pub sync_interval: u64,
    /// Registry for prometheus metrics.
    pub registry: Arc<Mutex<Registry>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_interval: 1,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

struct Metrics {
    ticks: Counter,
    births: Counter,
    reclaimed: Counter,
    resident: Gauge,
}

impl Metrics {
    fn register(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            ticks: Counter::default(),
            births: Counter::default(),
            reclaimed: Counter::default(),
            resident: Gauge::default(),
        };
        let mut registry = registry.lock().unwrap();
        registry.register(
            "scheduler_ticks",
            "Iterations of the director loop",
            metrics.ticks.clone(),
        );
        registry.register(
            "actors_spawned",
            "Actors constructed from birth requests",
            metrics.births.clone(),
        );
        registry.register(
            "actors_reclaimed",
            "Dead actors removed from the queue",
            metrics.reclaimed.clone(),
        );
        registry.register(
            "actors_resident",
            "Actors currently scheduled on this rank",
            metrics.resident.clone(),
        );
        metrics
    }
}

/// How the queue holds an actor.
///
/// Spawned actors are owned outright and freed on death. Actors added by
/// the driver are shared: the driver's handle keeps them readable after
/// they die and leave the queue.
enum Slot<T: Transport> {
    Owned(Box<dyn Actor<T>>),
    Shared(Rc<RefCell<dyn Actor<T>>>),
}

impl<T: Transport> Slot<T> {
    fn step(&mut self, ctx: &mut Context<'_, T>) {
        match self {
            Slot::Owned(actor) => actor.step(ctx),
            Slot::Shared(actor) => actor.borrow_mut().step(ctx),
        }
    }
}

struct Cell<T: Transport> {
    slot: Slot<T>,
    id: Id,
    dead: bool,
}

/// Scheduler and lifecycle manager for one rank.
pub struct Director<T: Transport> {
    factory: DistributedFactory<T>,
    actor_channel: T,
    director_channel: T,
    rank: i32,
    size: i32,
    queue: VecDeque<Cell<T>>,
    ended: bool,
    end_seen: bool,
    sync_interval: u64,
    tick: u64,
    metrics: Metrics,
}

impl<T: Transport> Director<T> {
    /// Builds the director over `base`.
    ///
    /// Collective: every rank must construct its director at the same
    /// point, against the same base channel.
    pub fn new(base: &T, cfg: Config) -> Result<Self, Error> {
        assert!(cfg.sync_interval > 0, "sync interval must be positive");
        let factory = DistributedFactory::new(base)?;
        let actor_channel = base.dup()?;
        let director_channel = base.dup()?;
        let rank = director_channel.rank();
        let size = director_channel.size();
        debug!(rank, size, "director ready");
        Ok(Self {
            factory,
            actor_channel,
            director_channel,
            rank,
            size,
            queue: VecDeque::new(),
            ended: false,
            end_seen: false,
            sync_interval: cfg.sync_interval,
            tick: 0,
            metrics: Metrics::register(&cfg.registry),
        })
    }

    /// Whether this rank is rank 0.
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Registers class `A` for spawning; see [`DistributedFactory`].
    ///
    /// Every rank must register the same classes in the same order.
    pub fn register_actor<A: Actor<T> + Default>(&mut self) {
        self.factory.register::<A>();
    }

    /// Constructs an actor of class `A` on this rank and enqueues it.
    ///
    /// Local and non-collective. The returned handle stays valid after the
    /// actor dies, so the driver can seed state before running and inspect
    /// results afterwards. The handle must not be borrowed while the
    /// director is running.
    pub fn add_actor<A: Actor<T> + Default>(&mut self) -> Rc<RefCell<A>> {
        let id = self.factory.new_id(Some(self.rank));
        let handle = Rc::new(RefCell::new(A::default()));
        let shared: Rc<RefCell<dyn Actor<T>>> = handle.clone();
        self.queue.push_back(Cell {
            slot: Slot::Shared(shared),
            id,
            dead: false,
        });
        self.metrics.resident.inc();
        debug!(id = %id, "actor added");
        handle
    }

    /// Number of actors resident on this rank.
    pub fn local_load(&self) -> usize {
        self.queue.len()
    }

    /// Total number of actors across the cluster.
    ///
    /// Collective: every rank must call this at the same time.
    pub fn global_load(&self) -> Result<i32, Error> {
        self.director_channel
            .allreduce_sum(self.local_load() as i32)
    }

    /// Asks every rank, this one included, to stop at its next sync.
    pub fn end(&self) -> Result<(), Error> {
        debug!("broadcasting end signal");
        for rank in 0..self.size {
            Message::send(&self.director_channel, rank, END, &1i32)?;
        }
        Ok(())
    }

    /// Runs until the cluster terminates.
    ///
    /// Returns once termination is decided collectively: either the global
    /// load reached zero or some rank called [`Director::end`]. The
    /// stopped state is cleared on return, so a driver can mutate the cast
    /// and call `run` again for another phase.
    pub fn run(&mut self) -> Result<(), Error> {
        self.drive(None)
    }

    /// Runs for at most `ticks` ticks.
    ///
    /// Collective in effect: the periodic sync is a rendezvous, so every
    /// rank must spend the same number of ticks in the loop. Drivers
    /// bounding one rank must bound all of them equally.
    pub fn run_for(&mut self, ticks: u64) -> Result<(), Error> {
        self.drive(Some(ticks))
    }

    fn drive(&mut self, ticks: Option<u64>) -> Result<(), Error> {
        let deadline = ticks.map(|ticks| self.tick.saturating_add(ticks));
        let result = self.advance(deadline);
        self.ended = false;
        self.end_seen = false;
        result
    }

    fn advance(&mut self, deadline: Option<u64>) -> Result<(), Error> {
        while deadline.map_or(true, |deadline| self.tick < deadline) {
            self.tick += 1;
            self.metrics.ticks.inc();

            self.sync()?;
            if self.ended {
                break;
            }

            let Some(mut cell) = self.queue.pop_front() else {
                continue;
            };
            let mut ctx = Context::new(
                cell.id,
                &mut cell.dead,
                &self.actor_channel,
                &mut self.factory,
            );
            cell.slot.step(&mut ctx);
            if cell.dead {
                self.metrics.resident.dec();
                self.metrics.reclaimed.inc();
                trace!(id = %cell.id, "actor reclaimed");
            } else {
                self.queue.push_back(cell);
            }
        }
        Ok(())
    }

    /// Per-tick service work: births, end polling, periodic termination
    /// check.
    fn sync(&mut self) -> Result<(), Error> {
        self.service_spawns()?;
        self.poll_end()?;
        if self.tick % self.sync_interval == 0 {
            self.director_channel.barrier()?;
            // Every birth request sent before the barrier is now in its
            // target's mailbox; drain them so the load count below sees
            // every living actor.
            self.service_spawns()?;
            let votes = self
                .director_channel
                .allreduce_sum(i32::from(self.end_seen))?;
            let load = self.global_load()?;
            if votes > 0 || load == 0 {
                debug!(votes, load, tick = self.tick, "terminating");
                self.ended = true;
            }
        }
        Ok(())
    }

    fn service_spawns(&mut self) -> Result<(), Error> {
        while let Some((actor, id)) = self.factory.next_spawn()? {
            trace!(id = %id, "spawn delivered");
            self.queue.push_back(Cell {
                slot: Slot::Owned(actor),
                id,
                dead: false,
            });
            self.metrics.births.inc();
            self.metrics.resident.inc();
        }
        Ok(())
    }

    fn poll_end(&mut self) -> Result<(), Error> {
        let mut message = Message::new();
        if message.receive(&self.director_channel, None, Some(END))? {
            debug!("end signal observed");
            self.end_seen = true;
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        self.director_channel.barrier()?;
        self.queue.clear();
        // Anything still buffered for this rank is now garbage; drain it
        // so the transport's send accounting settles.
        let mut message = Message::new();
        while message.receive(&self.actor_channel, None, None)? {}
        while message.receive(&self.director_channel, None, None)? {}
        Ok(())
    }
}

impl<T: Transport> Drop for Director<T> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(?err, "director shutdown incomplete");
        }
    }
}
