use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::dedup::DuplicateCache;
use super::ChannelHandler;
use crate::discovery::PacketSink;
use crate::engine::MulticastEngine;
use crate::error::{TransportError, TransportResult};
use crate::types::{NodeId, SessionId, Stanza, StanzaKind};
use crate::wire::{TransportMetadata, TransportSubType, TransportType, WireCodec};

/// Reason attached to late-delivered packets
pub const LATE_DELIVERY_REASON: &str = "Offline Message";

/// An engine session and the interface it was created on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSession {
    pub session: SessionId,
    pub iface: String,
}

/// The sessions a channel sends and receives on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSessions {
    pub sending: Vec<ChannelSession>,
    pub receiving: Vec<ChannelSession>,
}

impl ChannelSessions {
    /// Every distinct session id, senders first.
    pub fn all(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = Vec::new();
        for s in self.sending.iter().chain(self.receiving.iter()) {
            if !ids.contains(&s.session) {
                ids.push(s.session);
            }
        }
        ids
    }

    fn receiving_iface(&self, session: SessionId) -> Option<&str> {
        self.receiving
            .iter()
            .find(|s| s.session == session)
            .map(|s| s.iface.as_str())
    }
}

/// Per-channel settings
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Logical name (`room@conference.proxy`, `oneToOne@oneToOne`, ...)
    pub name: String,
    pub local_node: NodeId,
    pub compression: bool,
    pub dedup_capacity: usize,
    /// Packets older than GRTT x multiplier are marked as delayed
    pub grtt_multiplier: u32,
}

/// One logical duplex channel over one session per interface
pub struct Channel {
    options: ChannelOptions,
    engine: Arc<dyn MulticastEngine>,
    codec: WireCodec,
    sessions: ChannelSessions,
    dedup: Mutex<DuplicateCache>,
    sink: Option<Arc<dyn PacketSink>>,
    closed: AtomicBool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.options.name)
            .field("sessions", &self.sessions)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    pub fn new(
        engine: Arc<dyn MulticastEngine>,
        sessions: ChannelSessions,
        options: ChannelOptions,
        sink: Option<Arc<dyn PacketSink>>,
    ) -> Self {
        Self {
            codec: WireCodec::new(options.compression),
            dedup: Mutex::new(DuplicateCache::new(options.dedup_capacity)),
            options,
            engine,
            sessions,
            sink,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn local_node(&self) -> NodeId {
        self.options.local_node
    }

    pub fn codec(&self) -> WireCodec {
        self.codec
    }

    pub fn sessions(&self) -> &ChannelSessions {
        &self.sessions
    }

    /// Whether `session` belongs to this channel.
    pub fn owns(&self, session: SessionId) -> bool {
        self.sessions
            .sending
            .iter()
            .chain(self.sessions.receiving.iter())
            .any(|s| s.session == session)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn engine(&self) -> &Arc<dyn MulticastEngine> {
        &self.engine
    }

    /// Send a payload on every sender interface.
    pub fn send(
        &self,
        payload: &[u8],
        transport_type: TransportType,
        sub_type: TransportSubType,
    ) -> TransportResult<()> {
        self.ensure_open()?;
        let payload = Bytes::copy_from_slice(payload);
        let metadata = TransportMetadata::now(transport_type, sub_type, Some(self.local_node()));
        self.dedup.lock().register_sent(&payload);
        debug!(
            channel = %self.name(),
            transport_type = ?transport_type,
            sub_type = ?sub_type,
            len = payload.len(),
            "Sending"
        );
        self.enqueue_all(&payload, &metadata, None)
    }

    /// Send a chat message or IQ.
    pub fn send_packet(&self, packet: &Stanza) -> TransportResult<()> {
        let (transport_type, sub_type) = match packet.kind {
            StanzaKind::Message if packet.is_groupchat() => {
                (TransportType::MessageTransport, TransportSubType::GroupChat)
            }
            StanzaKind::Message => (TransportType::MessageTransport, TransportSubType::Chat),
            _ => (TransportType::IqTransport, TransportSubType::Iq),
        };
        self.send(packet.to_xml().as_bytes(), transport_type, sub_type)
    }

    /// Send an out-of-band command on every sender interface.
    pub fn send_command(&self, command: Bytes) -> TransportResult<()> {
        self.ensure_open()?;
        let mut last_err = None;
        let mut sent = 0;
        for s in &self.sessions.sending {
            match self.engine.send_command(s.session, command.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(channel = %self.name(), session = %s.session, iface = %s.iface, error = %e, "Command send failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if sent == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Duplicate check for an arriving payload; `false` means drop it.
    ///
    /// Relayed copies are always checked. Direct payloads are checked when
    /// more than one interface receives, since each one delivers a copy.
    pub fn accept(&self, session: SessionId, metadata: &TransportMetadata, payload: &Bytes) -> bool {
        let copies = self.sessions.receiving.len().max(1);
        if !metadata.is_redirect() && copies == 1 {
            return true;
        }
        if self.dedup.lock().check(payload, copies) {
            trace!(channel = %self.name(), %session, "Duplicate payload suppressed");
            return false;
        }
        true
    }

    /// Re-broadcast a direct payload onto every sender interface other than
    /// the one it arrived on, tagged as a redirect.
    pub fn relay(&self, arrival: SessionId, metadata: &TransportMetadata, payload: &Bytes) {
        if metadata.is_redirect() || self.sessions.sending.len() <= 1 || self.is_closed() {
            return;
        }
        let arrival_iface = self.sessions.receiving_iface(arrival);
        let relayed = metadata.redirected();
        self.dedup.lock().register_sent(payload);
        debug!(
            channel = %self.name(),
            from_session = %arrival,
            orig_sender = ?metadata.orig_sender_id,
            transport_type = ?relayed.transport_type,
            "Relaying to other interfaces"
        );
        if let Err(e) = self.enqueue_all(payload, &relayed, arrival_iface) {
            warn!(channel = %self.name(), error = %e, "Relay failed");
        }
    }

    /// Add a delayed-delivery stamp when the packet is older than the
    /// session's round trip times the multiplier.
    pub fn mark_late(&self, session: SessionId, metadata: &TransportMetadata, packet: &mut Stanza) {
        let Some(grtt) = self.engine.grtt_estimate(session) else {
            return;
        };
        let threshold_ms = grtt.as_millis() as i64 * i64::from(self.options.grtt_multiplier);
        let age_ms = metadata.age_ms(chrono::Utc::now().timestamp_millis());
        if age_ms > threshold_ms {
            debug!(channel = %self.name(), age_ms, threshold_ms, "Marking packet as delayed");
            let from = packet.from.clone();
            packet.add_delay(metadata.timestamp, from.as_ref(), LATE_DELIVERY_REASON);
        }
    }

    fn process_packet(&self, session: SessionId, metadata: &TransportMetadata, payload: &Bytes) {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(channel = %self.name(), %session, error = %e, "Dropping non-UTF-8 payload");
                return;
            }
        };
        let mut packet = match Stanza::from_xml(text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(channel = %self.name(), %session, error = %e, "Dropping malformed packet");
                return;
            }
        };
        if packet.is_presence() {
            warn!(channel = %self.name(), "Presence on a data channel, ignoring");
            return;
        }
        self.mark_late(session, metadata, &mut packet);
        match &self.sink {
            Some(sink) => sink.process_packet(packet.from.as_ref(), &packet),
            None => debug!(channel = %self.name(), "No packet sink, dropping packet"),
        }
    }

    fn enqueue_all(
        &self,
        payload: &Bytes,
        metadata: &TransportMetadata,
        skip_iface: Option<&str>,
    ) -> TransportResult<()> {
        let info = self.codec.encode_metadata(metadata)?;
        let data = self.codec.encode_payload(payload)?;
        let mut last_err = None;
        let mut sent = 0;
        for s in &self.sessions.sending {
            if skip_iface == Some(s.iface.as_str()) {
                continue;
            }
            match self.engine.data_enqueue(s.session, data.clone(), info.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(channel = %self.name(), session = %s.session, iface = %s.iface, error = %e, "Enqueue failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if sent == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ChannelClosed(self.name().to_string()));
        }
        Ok(())
    }

    /// Stop every owned session. Returns false if already closed.
    pub(crate) fn shutdown_sessions(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for s in &self.sessions.sending {
            self.engine.stop_sender(s.session);
        }
        for s in &self.sessions.receiving {
            self.engine.stop_receiver(s.session);
        }
        debug!(channel = %self.name(), "Stopped senders and receivers");
        true
    }
}

impl ChannelHandler for Channel {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn add_remote_node(&self, session: SessionId, node: NodeId) {
        debug!(channel = %self.name(), %session, node_id = %node, "Remote sender on data channel");
    }

    fn handle_transport_data(
        &self,
        sender: NodeId,
        session: SessionId,
        metadata: TransportMetadata,
        payload: Bytes,
    ) {
        if !self.accept(session, &metadata, &payload) {
            return;
        }
        trace!(channel = %self.name(), node_id = %sender, %session, "Packet received");
        self.process_packet(session, &metadata, &payload);
        self.relay(session, &metadata, &payload);
    }

    fn close(&self) {
        self.shutdown_sessions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineParams;
    use crate::discovery::PacketForwarder;
    use crate::engine::{EngineEvent, MemoryEngine, MemoryNetwork};
    use crate::types::Jid;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const GROUP: Ipv4Addr = Ipv4Addr::new(225, 0, 87, 4);

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn channel_on(
        engine: Arc<MemoryEngine>,
        ifaces: &[&str],
        node: u64,
        sink: Option<Arc<dyn PacketSink>>,
    ) -> Channel {
        let params = EngineParams::default();
        let mut sessions = ChannelSessions::default();
        for iface in ifaces {
            let session = engine.create_session(iface, GROUP, 10001, NodeId(node)).unwrap();
            engine.start_sender(session, &params).unwrap();
            engine.start_receiver(session, &params).unwrap();
            let cs = ChannelSession {
                session,
                iface: iface.to_string(),
            };
            sessions.sending.push(cs.clone());
            sessions.receiving.push(cs);
        }
        Channel::new(
            engine,
            sessions,
            ChannelOptions {
                name: "oneToOne@oneToOne".to_string(),
                local_node: NodeId(node),
                compression: false,
                dedup_capacity: 64,
                grtt_multiplier: 1,
            },
            sink,
        )
    }

    async fn next_object(engine: &MemoryEngine) -> (SessionId, TransportMetadata, Bytes) {
        loop {
            match engine.next_event().await.unwrap() {
                Some(EngineEvent::RxObjectCompleted { session, info, data, .. }) => {
                    let meta = WireCodec::new(false).decode_metadata(&info).unwrap();
                    return (session, meta, data);
                }
                Some(_) => continue,
                None => panic!("engine closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_packet_sub_types() {
        let net = MemoryNetwork::new();
        let a = Arc::new(MemoryEngine::new(&net));
        let b = Arc::new(MemoryEngine::new(&net));
        let tx = channel_on(a, &["net1"], 1, None);
        let _rx = channel_on(b.clone(), &["net1"], 2, None);

        let group = Stanza::new(StanzaKind::Message)
            .with_type("groupchat")
            .with_body("all");
        let chat = Stanza::new(StanzaKind::Message).with_body("one");
        let iq = Stanza::new(StanzaKind::Iq).with_type("get");
        tx.send_packet(&group).unwrap();
        tx.send_packet(&chat).unwrap();
        tx.send_packet(&iq).unwrap();

        let (_, meta, _) = next_object(&b).await;
        assert_eq!(meta.transport_sub_type, TransportSubType::GroupChat);
        assert_eq!(meta.orig_sender_id, Some(NodeId(1)));
        let (_, meta, _) = next_object(&b).await;
        assert_eq!(meta.transport_sub_type, TransportSubType::Chat);
        let (_, meta, _) = next_object(&b).await;
        assert_eq!(meta.transport_sub_type, TransportSubType::Iq);
    }

    #[tokio::test]
    async fn test_duplicate_over_two_interfaces_delivered_once() {
        let net = MemoryNetwork::new();
        let a = Arc::new(MemoryEngine::new(&net));
        let b = Arc::new(MemoryEngine::new(&net));
        let sink = PacketForwarder::new();
        let mut packets = sink.subscribe();
        let tx = channel_on(a, &["net1", "net2"], 1, None);
        let rx = channel_on(b.clone(), &["net1", "net2"], 2, Some(Arc::new(sink.clone())));

        let msg = Stanza::new(StanzaKind::Message)
            .with_from(jid("a@proxy"))
            .with_body("hi");
        tx.send_packet(&msg).unwrap();

        for _ in 0..2 {
            let (session, meta, data) = next_object(&b).await;
            rx.handle_transport_data(NodeId(1), session, meta, data);
        }

        let received = packets.recv().await.unwrap();
        assert_eq!(received.packet.body.as_deref(), Some("hi"));
        assert!(packets.try_recv().is_err());
        // Evicted after the second sighting
        assert_eq!(rx.dedup.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_relay_skips_arrival_interface_and_keeps_origin() {
        let net = MemoryNetwork::new();
        let a = Arc::new(MemoryEngine::new(&net));
        let b = Arc::new(MemoryEngine::new(&net));
        let c = Arc::new(MemoryEngine::new(&net));
        let tx = channel_on(a.clone(), &["net1"], 1, None);
        let relay = channel_on(b.clone(), &["net1", "net2"], 2, None);
        let _far = channel_on(c.clone(), &["net2"], 3, None);

        tx.send_packet(&Stanza::new(StanzaKind::Message).with_body("hop"))
            .unwrap();
        let (session, meta, data) = next_object(&b).await;
        relay.handle_transport_data(NodeId(1), session, meta, data);

        let (_, meta, data) = next_object(&c).await;
        assert_eq!(meta.transport_type, TransportType::MessageTransportRedirect);
        assert_eq!(meta.orig_sender_id, Some(NodeId(1)));
        assert!(std::str::from_utf8(&data).unwrap().contains("hop"));

        // Nothing was sent back onto net1
        a.shutdown();
        assert_eq!(a.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redirected_echo_of_own_payload_dropped() {
        let net = MemoryNetwork::new();
        let a = Arc::new(MemoryEngine::new(&net));
        let sink = PacketForwarder::new();
        let mut packets = sink.subscribe();
        let ch = channel_on(a, &["net1"], 1, Some(Arc::new(sink.clone())));

        let msg = Stanza::new(StanzaKind::Message).with_body("mine");
        ch.send_packet(&msg).unwrap();

        let mut echo = TransportMetadata::now(
            TransportType::MessageTransportRedirect,
            TransportSubType::Chat,
            Some(NodeId(1)),
        );
        echo.timestamp = chrono::Utc::now().timestamp_millis();
        ch.handle_transport_data(
            NodeId(2),
            ch.sessions().receiving[0].session,
            echo,
            Bytes::from(msg.to_xml()),
        );
        assert!(packets.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_packet_gets_delay() {
        let net = MemoryNetwork::new();
        let a = Arc::new(MemoryEngine::new(&net));
        let sink = PacketForwarder::new();
        let mut packets = sink.subscribe();
        let ch = channel_on(a.clone(), &["net1"], 1, Some(Arc::new(sink.clone())));
        let session = ch.sessions().receiving[0].session;
        a.set_grtt(session, Duration::from_millis(100)).unwrap();

        let mut old = TransportMetadata::now(
            TransportType::MessageTransport,
            TransportSubType::Chat,
            Some(NodeId(2)),
        );
        old.timestamp -= 10_000;
        let msg = Stanza::new(StanzaKind::Message)
            .with_from(jid("b@proxy"))
            .with_body("old");
        ch.handle_transport_data(NodeId(2), session, old, Bytes::from(msg.to_xml()));

        let fresh = TransportMetadata::now(
            TransportType::MessageTransport,
            TransportSubType::Chat,
            Some(NodeId(2)),
        );
        let msg2 = Stanza::new(StanzaKind::Message)
            .with_from(jid("b@proxy"))
            .with_body("new");
        ch.handle_transport_data(NodeId(2), session, fresh, Bytes::from(msg2.to_xml()));

        let late = packets.recv().await.unwrap();
        assert!(late.packet.has_delay());
        assert!(late.packet.extensions[0].contains(LATE_DELIVERY_REASON));
        let on_time = packets.recv().await.unwrap();
        assert!(!on_time.packet.has_delay());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let net = MemoryNetwork::new();
        let a = Arc::new(MemoryEngine::new(&net));
        let ch = channel_on(a.clone(), &["net1", "net2"], 1, None);
        let sessions = ch.sessions().all();

        ch.close();
        ch.close();
        assert!(ch.is_closed());
        for session in sessions {
            assert!(!a.is_active(session));
        }
        let err = ch
            .send_packet(&Stanza::new(StanzaKind::Message).with_body("late"))
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped() {
        let net = MemoryNetwork::new();
        let a = Arc::new(MemoryEngine::new(&net));
        let sink = PacketForwarder::new();
        let mut packets = sink.subscribe();
        let ch = channel_on(a, &["net1"], 1, Some(Arc::new(sink.clone())));
        let meta = TransportMetadata::now(
            TransportType::MessageTransport,
            TransportSubType::Chat,
            Some(NodeId(2)),
        );
        let session = ch.sessions().receiving[0].session;
        ch.handle_transport_data(NodeId(2), session, meta, Bytes::from_static(b"<message"));
        ch.handle_transport_data(NodeId(2), session, meta, Bytes::from_static(&[0xff, 0xfe]));
        assert!(packets.try_recv().is_err());
    }
}
