//! # Simulator
//!
//! Discrete-event network used to run whole node stacks without sockets.
//!
//! ## Features
//!
//! - Virtual time taken from `tokio::time`, so `start_paused` tests run
//!   through minutes of traffic instantly
//! - Per-pair one-way latency ([`LatencyModel`])
//! - Connect, send and close are scheduled operations executed in
//!   `(execution time, sequence)` order
//! - Per-pipe ordering: an operation never runs before the previous one
//!   scheduled on the same association
//!
//! ## Association lifecycle
//!
//! | State   | Entered by                       | Leaves on                          |
//! |---------|----------------------------------|------------------------------------|
//! | Open    | `connect` / `accept`             | local `close`                      |
//! | Closing | `close` scheduled                | both sides' close operations run   |
//!
//! One [`Simulator`] handle is shared by every node under test; it is an
//! ordinary value, created and stopped by the test.

pub mod connection;
pub mod connector;
pub mod latency;

pub use connection::SimulatorConnection;
pub use connector::SimulatorConnector;
pub use latency::{region_delay_matrix, LatencyModel, REGION_COUNT};

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink_types::{NodeId, PeerDescriptor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, ConnectionId};

/// Operations executed before the drain loop yields to other tasks.
pub const MAX_OPERATIONS_PER_TURN: usize = 1000;

/// 模拟器配置
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub latency: LatencyModel,
    /// Seed for [`LatencyModel::Random`].
    pub seed: u64,
    pub max_operations_per_turn: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency: LatencyModel::None,
            seed: 0x5eed,
            max_operations_per_turn: MAX_OPERATIONS_PER_TURN,
        }
    }
}

impl SimulatorConfig {
    pub fn with_latency(mut self, latency: LatencyModel) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// One-way pipe from a source connection to its counterpart.
struct Association {
    source: Arc<SimulatorConnection>,
    destination: Option<Arc<SimulatorConnection>>,
    last_operation_at: Instant,
    closing: bool,
}

enum Operation {
    Connect {
        association: ConnectionId,
        source: Arc<SimulatorConnection>,
        target: PeerDescriptor,
    },
    Send {
        association: ConnectionId,
        data: Bytes,
    },
    Close {
        association: ConnectionId,
    },
}

impl Operation {
    fn association(&self) -> ConnectionId {
        match self {
            Operation::Connect { association, .. }
            | Operation::Send { association, .. }
            | Operation::Close { association } => *association,
        }
    }
}

struct Scheduled {
    at: Instant,
    seq: u64,
    operation: Operation,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Earliest time an operation on a pipe may run.
fn execution_time(now: Instant, latency: Duration, last_operation_at: Instant) -> Instant {
    (now + latency).max(last_operation_at)
}

struct State {
    stopped: bool,
    next_seq: u64,
    rng: StdRng,
    connectors: HashMap<NodeId, Weak<SimulatorConnector>>,
    associations: HashMap<ConnectionId, Association>,
    queue: BinaryHeap<Reverse<Scheduled>>,
}

struct Inner {
    latency: LatencyModel,
    max_operations_per_turn: usize,
    state: Mutex<State>,
    wake: Arc<Notify>,
    stop: CancellationToken,
}

/// Shared handle to one simulated network.
#[derive(Clone)]
pub struct Simulator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Simulator")
            .field("latency", &self.inner.latency)
            .field("associations", &state.associations.len())
            .field("queued", &state.queue.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl Simulator {
    /// Create a simulator and start its drain task. Must be called inside a
    /// tokio runtime.
    pub fn new(config: SimulatorConfig) -> Self {
        let inner = Arc::new(Inner {
            latency: config.latency,
            max_operations_per_turn: config.max_operations_per_turn.max(1),
            state: Mutex::new(State {
                stopped: false,
                next_seq: 0,
                rng: StdRng::seed_from_u64(config.seed),
                connectors: HashMap::new(),
                associations: HashMap::new(),
                queue: BinaryHeap::new(),
            }),
            wake: Arc::new(Notify::new()),
            stop: CancellationToken::new(),
        });
        tokio::spawn(drain(
            Arc::downgrade(&inner),
            inner.wake.clone(),
            inner.stop.clone(),
        ));
        debug!("Simulator started with {:?} latency", config.latency);
        Self { inner }
    }

    pub fn with_latency(latency: LatencyModel) -> Self {
        Self::new(SimulatorConfig::default().with_latency(latency))
    }

    pub fn latency(&self) -> LatencyModel {
        self.inner.latency
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    pub fn association_count(&self) -> usize {
        self.inner.state.lock().associations.len()
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub(crate) fn register(&self, node_id: NodeId, connector: Weak<SimulatorConnector>) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.connectors.insert(node_id, connector);
    }

    pub(crate) fn unregister(&self, node_id: &NodeId) {
        self.inner.state.lock().connectors.remove(node_id);
    }

    /// Open a pipe from `source` and schedule delivery of the connect to the
    /// connector registered for `target`.
    pub(crate) fn connect(&self, source: &Arc<SimulatorConnection>, target: PeerDescriptor) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            warn!("connect() on a stopped simulator ignored");
            return;
        }
        let id = source.connection_id();
        let latency = self
            .inner
            .latency
            .sample(&mut state.rng, source.local_peer_descriptor().region, target.region);
        let now = Instant::now();
        let at = execution_time(now, latency, now);
        state.associations.insert(
            id,
            Association {
                source: source.clone(),
                destination: None,
                last_operation_at: at,
                closing: false,
            },
        );
        self.push_locked(
            &mut state,
            at,
            Operation::Connect {
                association: id,
                source: source.clone(),
                target,
            },
        );
    }

    /// Link an inbound connection to the source of a pipe and open both.
    pub(crate) fn accept(&self, source: &Arc<SimulatorConnection>, target: &Arc<SimulatorConnection>) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            let now = Instant::now();
            match state.associations.get_mut(&source.connection_id()) {
                Some(association) => association.destination = Some(target.clone()),
                None => {
                    warn!("accept() for unknown association {}", source.connection_id());
                    return;
                }
            }
            state.associations.insert(
                target.connection_id(),
                Association {
                    source: target.clone(),
                    destination: Some(source.clone()),
                    last_operation_at: now,
                    closing: false,
                },
            );
        }
        source.handle_connected();
        target.handle_connected();
    }

    /// Schedule delivery of `data` to the counterpart of `source`.
    pub(crate) fn send(&self, source: ConnectionId, data: Bytes) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        let Some(association) = state.associations.get(&source) else {
            trace!("send() on unknown association {}", source);
            return;
        };
        if association.closing {
            trace!("send() on closing association {}", source);
            return;
        }
        let from = association.source.local_peer_descriptor().region;
        let to = association
            .destination
            .as_ref()
            .and_then(|d| d.local_peer_descriptor().region);
        let last = association.last_operation_at;
        let latency = self.inner.latency.sample(&mut state.rng, from, to);
        let at = execution_time(Instant::now(), latency, last);
        if let Some(association) = state.associations.get_mut(&source) {
            association.last_operation_at = at;
        }
        self.push_locked(
            &mut state,
            at,
            Operation::Send {
                association: source,
                data,
            },
        );
    }

    /// Mark the pipe of `source` closing and schedule its close.
    pub(crate) fn close(&self, source: ConnectionId) {
        let mut state = self.inner.state.lock();
        self.close_locked(&mut state, source);
    }

    fn close_locked(&self, state: &mut State, source: ConnectionId) {
        if state.stopped {
            return;
        }
        let Some(association) = state.associations.get(&source) else {
            return;
        };
        let from = association.source.local_peer_descriptor().region;
        let to = association
            .destination
            .as_ref()
            .and_then(|d| d.local_peer_descriptor().region);
        let last = association.last_operation_at;
        let latency = self.inner.latency.sample(&mut state.rng, from, to);
        let at = execution_time(Instant::now(), latency, last);
        if let Some(association) = state.associations.get_mut(&source) {
            association.closing = true;
            association.last_operation_at = at;
        }
        self.push_locked(state, at, Operation::Close { association: source });
    }

    fn push_locked(&self, state: &mut State, at: Instant, operation: Operation) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Reverse(Scheduled { at, seq, operation }));
        self.inner.wake.notify_one();
    }

    /// Drop all queued operations and associations. Later calls are ignored.
    pub fn stop(&self) {
        let (associations, dropped) = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.connectors.clear();
            let dropped = state.queue.len();
            state.queue.clear();
            (std::mem::take(&mut state.associations), dropped)
        };
        self.inner.stop.cancel();
        info!(
            "Simulator stopped with {} associations and {} queued operations",
            associations.len(),
            dropped
        );
    }
}

impl Inner {
    fn execute(self: &Arc<Self>, operation: Operation) {
        let simulator = Simulator { inner: self.clone() };
        match operation {
            Operation::Connect { association, source, target } => {
                simulator.execute_connect(association, source, target)
            }
            Operation::Send { association, data } => simulator.execute_send(association, data),
            Operation::Close { association } => simulator.execute_close(association),
        }
    }
}

impl Simulator {
    fn execute_connect(&self, association: ConnectionId, source: Arc<SimulatorConnection>, target: PeerDescriptor) {
        let connector = self
            .inner
            .state
            .lock()
            .connectors
            .get(&target.node_id)
            .and_then(Weak::upgrade);
        let accepted = match connector {
            Some(connector) => connector.handle_incoming_connection(&source),
            None => {
                warn!(
                    "No simulated connector for {}, failing {}",
                    target.node_id.short(),
                    association
                );
                false
            }
        };
        if !accepted {
            self.inner.state.lock().associations.remove(&association);
            source.handle_connect_failed();
        }
    }

    fn execute_send(&self, association: ConnectionId, data: Bytes) {
        let destination = self
            .inner
            .state
            .lock()
            .associations
            .get(&association)
            .and_then(|a| a.destination.clone());
        match destination {
            Some(destination) => destination.handle_incoming_data(data),
            None => trace!("dropping send on vanished association {}", association),
        }
    }

    fn execute_close(&self, association: ConnectionId) {
        let destination = {
            let mut state = self.inner.state.lock();
            let destination = match state.associations.get(&association) {
                Some(a) => a.destination.clone(),
                None => return,
            };
            let counter_closing = destination
                .as_ref()
                .and_then(|d| state.associations.get(&d.connection_id()))
                .map(|counter| counter.closing);
            match (destination, counter_closing) {
                (Some(destination), Some(false)) => destination,
                (Some(destination), Some(true)) => {
                    // acknowledgement of a close this side already mirrored
                    state.associations.remove(&destination.connection_id());
                    state.associations.remove(&association);
                    return;
                }
                _ => {
                    state.associations.remove(&association);
                    return;
                }
            }
        };
        destination.handle_incoming_disconnection();
        self.close(destination.connection_id());
    }
}

async fn drain(inner: Weak<Inner>, wake: Arc<Notify>, stop: CancellationToken) {
    loop {
        let next = match inner.upgrade() {
            Some(inner) => {
                let state = inner.state.lock();
                if state.stopped {
                    return;
                }
                state.queue.peek().map(|Reverse(s)| s.at)
            }
            None => return,
        };

        match next {
            None => {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = wake.notified() => continue,
                }
            }
            Some(at) if at > Instant::now() => {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    // an earlier operation may have been queued
                    _ = wake.notified() => continue,
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            Some(_) => {}
        }

        let Some(inner) = inner.upgrade() else { return };
        let mut executed = 0;
        loop {
            let due = {
                let mut state = inner.state.lock();
                if state.stopped {
                    return;
                }
                match state.queue.peek() {
                    Some(Reverse(s)) if s.at <= Instant::now() => state.queue.pop().map(|Reverse(s)| s),
                    _ => None,
                }
            };
            let Some(scheduled) = due else { break };
            trace!(
                "executing operation #{} on {}",
                scheduled.seq,
                scheduled.operation.association()
            );
            inner.execute(scheduled.operation);
            executed += 1;
            if executed >= inner.max_operations_per_turn {
                executed = 0;
                tokio::task::yield_now().await;
            }
        }
    }
}
