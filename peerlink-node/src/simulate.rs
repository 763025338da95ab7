//! `simulate`: every node sends to every other node over one shared
//! simulator and the delivered messages are counted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use futures::future::join_all;
use peerlink_core::config::ConnectionConfig;
use peerlink_core::simulator::{LatencyModel, REGION_COUNT};
use peerlink_core::{ConnectionManager, NodeId, PeerDescriptor, Simulator, TransportEvent};
use tokio::time::Instant;
use tracing::{debug, warn};

const SERVICE_ID: &str = "simulate/payload";

pub async fn run(nodes: usize, messages: usize, latency: LatencyModel, timeout: Duration) -> anyhow::Result<()> {
    if nodes < 2 {
        bail!("need at least 2 nodes, got {}", nodes);
    }
    let simulator = Simulator::with_latency(latency);
    let delivered = Arc::new(AtomicUsize::new(0));

    let mut managers = Vec::with_capacity(nodes);
    for region in 0..nodes {
        let descriptor = PeerDescriptor::new(NodeId::random()).with_region((region % REGION_COUNT) as u32);
        let manager = ConnectionManager::simulated(descriptor, &simulator, ConnectionConfig::default());
        manager.start().await?;

        let mut events = manager.subscribe();
        let counter = delivered.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let TransportEvent::Message(message) = event {
                    if message.service_id == SERVICE_ID {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        managers.push(manager);
    }

    let descriptors: Vec<PeerDescriptor> = managers.iter().map(|m| m.local_peer_descriptor()).collect();
    let senders = managers.iter().map(|manager| {
        let targets: Vec<PeerDescriptor> = descriptors
            .iter()
            .filter(|d| d.node_id != manager.local_peer_descriptor().node_id)
            .cloned()
            .collect();
        let manager = manager.clone();
        async move {
            let mut failed = 0;
            for target in &targets {
                for i in 0..messages {
                    if let Err(e) = manager.send_payload(target, SERVICE_ID, i.to_be_bytes().to_vec()).await {
                        warn!("Send to {} failed: {}", target.node_id.short(), e);
                        failed += 1;
                    }
                }
            }
            failed
        }
    });
    let started = Instant::now();
    let failed: usize = join_all(senders).await.into_iter().sum();

    let expected = nodes * (nodes - 1) * messages;
    let deadline = started + timeout;
    while delivered.load(Ordering::SeqCst) < expected - failed && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let received = delivered.load(Ordering::SeqCst);
    let connections: usize = managers.iter().map(|m| m.connection_count()).sum();
    debug!("Simulation finished in {:?}", started.elapsed());

    for manager in &managers {
        manager.stop().await;
    }
    simulator.stop();

    println!("delivered {} of {} messages", received, expected);
    println!("connections: {}", connections / 2);
    if received < expected {
        bail!("{} messages were not delivered", expected - received);
    }
    Ok(())
}
