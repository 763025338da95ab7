//! # Signalling relay
//!
//! Connectors that cannot reach a peer directly (WebRTC negotiation,
//! WebSocket connection requests) exchange [`Signal`]s over a connection
//! that already exists, the carrier.
//!
//! Signals to one target are delivered in the order they were sent. Each
//! target has its own queue and drain task, so a slow send to one peer
//! never holds up signals to another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_types::{Message, MessageBody, NodeId, PeerDescriptor, Signal};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::{Transport, TransportEvent};

/// Service id of WebRTC negotiation signals.
pub const WEBRTC_SIGNAL_SERVICE_ID: &str = "system/webrtc-connector";
/// Service id of WebSocket connection requests.
pub const WEBSOCKET_SIGNAL_SERVICE_ID: &str = "system/websocket-connector";

/// A target's drain task exits after this long without signals.
const IDLE_TARGET_TIMEOUT: Duration = Duration::from_secs(60);

/// A signal and the node it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingSignal {
    pub source: PeerDescriptor,
    pub signal: Signal,
}

pub type SignalReceiver = mpsc::UnboundedReceiver<IncomingSignal>;

pub trait SignalRelay: Send + Sync {
    /// Queue `signal` for `target`. Delivery is best effort.
    fn send_signal(&self, target: &PeerDescriptor, service_id: &'static str, signal: Signal);

    /// Signals addressed to `service_id`. A later call replaces the earlier
    /// receiver.
    fn subscribe(&self, service_id: &'static str) -> SignalReceiver;

    fn stop(&self);
}

struct Outgoing {
    target: PeerDescriptor,
    service_id: &'static str,
    signal: Signal,
}

type TargetQueues = Arc<Mutex<HashMap<NodeId, mpsc::UnboundedSender<Outgoing>>>>;

/// Relays signals as messages over a carrier [`Transport`].
pub struct TransportSignalRelay {
    carrier: Arc<dyn Transport>,
    runtime: Handle,
    targets: TargetQueues,
    sinks: Arc<Mutex<HashMap<&'static str, mpsc::UnboundedSender<IncomingSignal>>>>,
    shutdown: CancellationToken,
}

impl TransportSignalRelay {
    /// Must be called inside a tokio runtime.
    pub fn new(carrier: Arc<dyn Transport>) -> Arc<Self> {
        let sinks: Arc<Mutex<HashMap<&'static str, mpsc::UnboundedSender<IncomingSignal>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let mut events = carrier.subscribe();
        let dispatch = sinks.clone();
        let stop_receiving = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop_receiving.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                let TransportEvent::Message(message) = event else { continue };
                let Message {
                    service_id,
                    source_descriptor,
                    body,
                    ..
                } = message;
                let (MessageBody::Signal(signal), Some(source)) = (body, source_descriptor) else {
                    continue;
                };
                let sinks = dispatch.lock();
                match sinks.get(service_id.as_str()) {
                    Some(sink) => {
                        trace!("Signal for {} from {}", service_id, source.node_id.short());
                        let _ = sink.send(IncomingSignal { source, signal });
                    }
                    None => warn!("No signal handler registered for {}", service_id),
                }
            }
        });

        Arc::new(Self {
            carrier,
            runtime: Handle::current(),
            targets: Arc::new(Mutex::new(HashMap::new())),
            sinks,
            shutdown,
        })
    }

    /// Targets with a live drain task.
    pub fn active_targets(&self) -> usize {
        self.targets.lock().len()
    }
}

/// Send one target's signals in order until shutdown or idle.
async fn drain_target(
    node_id: NodeId,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    carrier: Arc<dyn Transport>,
    targets: TargetQueues,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(IDLE_TARGET_TIMEOUT, queue.recv()) => next,
        };
        let outgoing = match next {
            Ok(Some(outgoing)) => outgoing,
            Ok(None) => break,
            Err(_) => {
                // senders enqueue under the map lock, so an empty queue
                // seen here stays empty once the entry is gone
                let mut targets = targets.lock();
                match queue.try_recv() {
                    Ok(outgoing) => outgoing,
                    Err(_) => {
                        targets.remove(&node_id);
                        trace!("Signal queue for {} idle, closing", node_id.short());
                        break;
                    }
                }
            }
        };
        let Outgoing {
            target,
            service_id,
            signal,
        } = outgoing;
        let message = Message::new(service_id, MessageBody::Signal(signal)).to(target);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = carrier.send(message) => {
                if let Err(e) = sent {
                    debug!("Signal to {} not delivered: {}", node_id.short(), e);
                }
            }
        }
    }
}

impl SignalRelay for TransportSignalRelay {
    fn send_signal(&self, target: &PeerDescriptor, service_id: &'static str, signal: Signal) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut outgoing = Outgoing {
            target: target.clone(),
            service_id,
            signal,
        };
        let mut targets = self.targets.lock();
        if let Some(queue) = targets.get(&target.node_id) {
            match queue.send(outgoing) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => outgoing = returned,
            }
        }
        let (queue, rx) = mpsc::unbounded_channel();
        let _ = queue.send(outgoing);
        targets.insert(target.node_id, queue);
        self.runtime.spawn(drain_target(
            target.node_id,
            rx,
            self.carrier.clone(),
            self.targets.clone(),
            self.shutdown.clone(),
        ));
    }

    fn subscribe(&self, service_id: &'static str) -> SignalReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.lock().insert(service_id, tx);
        rx
    }

    fn stop(&self) {
        self.shutdown.cancel();
        self.sinks.lock().clear();
        self.targets.lock().clear();
    }
}

impl Drop for TransportSignalRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
