//! Shared helpers for the integration tests
//!
//! Nodes run a full [`TransportService`] over an in-process
//! [`MemoryNetwork`]. Tests run with paused time, so the gossip timers
//! advance as soon as every task is idle.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use presencecast_core::{
    DiscoveryEvent, EventForwarder, Jid, MemoryEngine, MemoryNetwork, NodeId, PacketForwarder,
    PresenceConfig, ReceivedPacket, Stanza, TransportConfig, TransportService,
};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;

/// Presence interval used by every test node
pub const INTERVAL: Duration = Duration::from_millis(1000);

/// How long a wait may take before the test fails
pub const WAIT: Duration = Duration::from_secs(30);

pub fn jid(s: &str) -> Jid {
    Jid::parse(s).unwrap()
}

pub fn available(client: &str) -> Stanza {
    Stanza::presence().with_from(jid(client))
}

pub fn config(node: u64, ifaces: &[&str]) -> TransportConfig {
    TransportConfig {
        node_id: node,
        send_interfaces: ifaces.iter().map(|s| s.to_string()).collect(),
        recv_interfaces: ifaces.iter().map(|s| s.to_string()).collect(),
        port_range: "10001-10020".to_string(),
        presence: PresenceConfig {
            interval_ms: INTERVAL.as_millis() as u64,
            timeout_ticks: 3,
            grtt_multiplier: 1,
            reap_after_ticks: 0,
            probe_from: "proxy".to_string(),
        },
        ..TransportConfig::default()
    }
}

/// One running node and the streams it reports on
pub struct TestNode {
    pub service: TransportService,
    pub engine: Arc<MemoryEngine>,
    pub events: Receiver<DiscoveryEvent>,
    pub packets: Receiver<ReceivedPacket>,
    pub event_loop: JoinHandle<presencecast_core::TransportResult<()>>,
}

impl TestNode {
    pub fn start(network: &MemoryNetwork, config: TransportConfig) -> Self {
        let engine = Arc::new(MemoryEngine::new(network));
        let forwarder = EventForwarder::new();
        let packet_forwarder = PacketForwarder::new();
        let events = forwarder.subscribe();
        let packets = packet_forwarder.subscribe();
        let service = TransportService::new(
            config,
            engine.clone(),
            Arc::new(forwarder),
            Arc::new(packet_forwarder),
        )
        .unwrap();
        let event_loop = service.start().unwrap();
        Self {
            service,
            engine,
            events,
            packets,
            event_loop,
        }
    }

    pub fn id(&self) -> NodeId {
        self.service.local_node()
    }

    /// Wait for the first event matching `pred`, skipping others.
    pub async fn wait_for(&mut self, pred: impl Fn(&DiscoveryEvent) -> bool) -> DiscoveryEvent {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.events.recv()).await {
                Ok(Ok(event)) if pred(&event) => return event,
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => panic!("event stream closed"),
                Err(_) => panic!("timed out waiting for discovery event"),
            }
        }
    }

    /// Wait for the next packet delivered to the sink.
    pub async fn next_packet(&mut self) -> ReceivedPacket {
        match tokio::time::timeout(WAIT, self.packets.recv()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => panic!("packet stream failed: {}", e),
            Err(_) => panic!("timed out waiting for packet"),
        }
    }

    /// Every event received so far that was not consumed yet.
    pub fn drain_events(&mut self) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }

    pub fn drain_packets(&mut self) -> Vec<ReceivedPacket> {
        let mut packets = Vec::new();
        loop {
            match self.packets.try_recv() {
                Ok(packet) => packets.push(packet),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return packets,
            }
        }
    }
}

/// Let the network run for `ticks` presence intervals.
pub async fn run_for(ticks: u32) {
    tokio::time::sleep(INTERVAL * ticks).await;
}

pub fn discovered(client: &str) -> impl Fn(&DiscoveryEvent) -> bool + '_ {
    move |event| matches!(event, DiscoveryEvent::ClientDiscovered(p) if p.from.as_ref().map(Jid::as_str) == Some(client))
}
