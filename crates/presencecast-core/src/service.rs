//! Transport coordinator
//!
//! [`TransportService`] owns the engine, opens channels on ports derived from
//! their logical names, and runs the one task that pulls engine events and
//! dispatches them to the channel owning the session.
//!
//! ```text
//! engine.next_event()
//!   ├── RemoteSenderNew      -> handler.add_remote_node
//!   ├── RxObjectCompleted    -> decode, own-origin guard, handler.handle_transport_data
//!   ├── RxCommandNew         -> presence channel as a snapshot
//!   ├── GrttUpdated          -> presence channel
//!   └── everything else      -> logged
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::TransportConfig;
use crate::discovery::{DiscoveryListener, PacketSink};
use crate::engine::{EngineEvent, MulticastEngine};
use crate::error::{TransportError, TransportResult};
use crate::hash::{Blake3Hasher, PresenceHasher};
use crate::presence::PresenceChannel;
use crate::transport::{
    Channel, ChannelHandler, ChannelOptions, ChannelSession, ChannelSessions, PortRange,
    ONE_TO_ONE_CHANNEL,
};
use crate::types::{Jid, NodeId, SessionId};
use crate::wire::{TransportMetadata, TransportSubType, TransportType};

/// Logical name of the presence channel
pub const PRESENCE_CHANNEL: &str = "presence@presence";

/// Who handles a session's events
#[derive(Clone)]
enum Route {
    Presence,
    Data(Arc<Channel>),
}

/// Session table plus the dispatch rules, shared with the event task
struct Router {
    engine: Arc<dyn MulticastEngine>,
    presence: Arc<PresenceChannel>,
    routes: RwLock<HashMap<SessionId, Route>>,
    local_node: NodeId,
}

impl Router {
    fn route(&self, session: SessionId) -> Option<Route> {
        self.routes.read().get(&session).cloned()
    }

    fn handler(&self, route: &Route) -> Arc<dyn ChannelHandler> {
        match route {
            Route::Presence => self.presence.clone() as Arc<dyn ChannelHandler>,
            Route::Data(channel) => channel.clone() as Arc<dyn ChannelHandler>,
        }
    }

    fn codec_channel<'a>(&'a self, route: &'a Route) -> &'a Channel {
        match route {
            Route::Presence => self.presence.channel(),
            Route::Data(channel) => channel.as_ref(),
        }
    }

    /// Whether a payload originated from this node.
    fn is_own(&self, session: SessionId, origin: Option<NodeId>) -> bool {
        match origin {
            Some(origin) => {
                origin == self.local_node || self.engine.local_node_id(session) == Some(origin)
            }
            None => false,
        }
    }

    fn dispatch(&self, event: EngineEvent) {
        match event {
            EngineEvent::RemoteSenderNew { session, sender } => {
                if sender == self.local_node {
                    return;
                }
                match self.route(session) {
                    Some(route) => self.handler(&route).add_remote_node(session, sender),
                    None => debug!(%session, node_id = %sender, "New sender on unknown session"),
                }
            }
            EngineEvent::RxObjectCompleted {
                session,
                sender,
                info,
                data,
            } => self.dispatch_object(session, sender, &info, &data),
            EngineEvent::RxCommandNew {
                session,
                sender,
                command,
            } => match self.route(session) {
                Some(Route::Presence) => {
                    let metadata = TransportMetadata::now(
                        TransportType::PresenceProbe,
                        TransportSubType::Json,
                        Some(sender),
                    );
                    self.presence
                        .handle_transport_data(sender, session, metadata, command);
                }
                _ => debug!(%session, node_id = %sender, "Command outside the presence channel ignored"),
            },
            EngineEvent::GrttUpdated { session, grtt } => {
                self.presence.update_grtt(session, grtt);
            }
            other => trace!(event = %other, "Engine event ignored"),
        }
    }

    fn dispatch_object(&self, session: SessionId, sender: NodeId, info: &Bytes, data: &Bytes) {
        let Some(route) = self.route(session) else {
            debug!(%session, node_id = %sender, "Object on unknown session dropped");
            return;
        };
        let codec = self.codec_channel(&route).codec();
        let metadata = match codec.decode_metadata(info) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(%session, node_id = %sender, error = %e, "Dropping object with bad envelope");
                return;
            }
        };
        if self.is_own(session, metadata.orig_sender_id) {
            trace!(%session, "Own payload echoed back, dropping");
            return;
        }
        let payload = match codec.decode_payload(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%session, node_id = %sender, error = %e, "Dropping undecodable payload");
                return;
            }
        };

        match route {
            Route::Presence => self
                .presence
                .handle_transport_data(sender, session, metadata, payload),
            Route::Data(channel) => match metadata.transport_type.base() {
                TransportType::MucPresence => {
                    if channel.accept(session, &metadata, &payload) {
                        self.presence.handle_room_presence(sender, &metadata, &payload);
                        channel.relay(session, &metadata, &payload);
                    }
                }
                TransportType::PresenceInit
                | TransportType::PresenceTransport
                | TransportType::PresenceProbe => {
                    trace!(channel = %channel.name(), "Presence traffic on a data port ignored");
                }
                _ => channel.handle_transport_data(sender, session, metadata, payload),
            },
        }
    }
}

/// Owns the engine, the presence channel and every data channel.
pub struct TransportService {
    config: TransportConfig,
    engine: Arc<dyn MulticastEngine>,
    ports: PortRange,
    sink: Arc<dyn PacketSink>,
    router: Arc<Router>,
    rooms: Mutex<HashMap<Jid, Arc<Channel>>>,
    one_to_one: Mutex<Option<Arc<Channel>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl TransportService {
    /// Validate `config` and open the presence channel on the first port.
    pub fn new(
        config: TransportConfig,
        engine: Arc<dyn MulticastEngine>,
        listener: Arc<dyn DiscoveryListener>,
        sink: Arc<dyn PacketSink>,
    ) -> TransportResult<Self> {
        Self::with_hasher(config, engine, listener, sink, Arc::new(Blake3Hasher))
    }

    /// Like [`new`](Self::new) with a custom presence hash.
    pub fn with_hasher(
        config: TransportConfig,
        engine: Arc<dyn MulticastEngine>,
        listener: Arc<dyn DiscoveryListener>,
        sink: Arc<dyn PacketSink>,
        hasher: Arc<dyn PresenceHasher>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let ports = config.ports()?;
        let local_node = config.local_node_id();
        info!(
            node_id = %local_node,
            group = %config.multicast_group,
            ports = %ports,
            send = ?config.send_interfaces,
            recv = ?config.recv_interfaces,
            "Opening transport"
        );

        let sessions = open_sessions(engine.as_ref(), &config, ports.first())?;
        let channel = Channel::new(
            engine.clone(),
            sessions.clone(),
            channel_options(&config, PRESENCE_CHANNEL),
            None,
        );
        let presence = PresenceChannel::new(channel, config.presence.clone(), listener, hasher)?;

        let routes = sessions
            .receiving
            .iter()
            .map(|s| (s.session, Route::Presence))
            .collect();
        let router = Arc::new(Router {
            engine: engine.clone(),
            presence,
            routes: RwLock::new(routes),
            local_node,
        });

        Ok(Self {
            config,
            engine,
            ports,
            sink,
            router,
            rooms: Mutex::new(HashMap::new()),
            one_to_one: Mutex::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Start the event loop and the presence broadcast.
    ///
    /// The handle resolves when the loop ends: `Ok` after [`close`](Self::close)
    /// or engine shutdown, `Err` when the engine failed.
    pub fn start(&self) -> TransportResult<JoinHandle<TransportResult<()>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed(PRESENCE_CHANNEL.to_string()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Session("transport already started".into()));
        }
        self.router.presence.start();
        let router = self.router.clone();
        let cancel = self.cancel.child_token();
        Ok(tokio::spawn(event_loop(router, cancel)))
    }

    pub fn local_node(&self) -> NodeId {
        self.router.local_node
    }

    pub fn ports(&self) -> PortRange {
        self.ports
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The presence channel; it is also the [`DiscoveryManager`](crate::discovery::DiscoveryManager).
    pub fn presence(&self) -> &Arc<PresenceChannel> {
        &self.router.presence
    }

    /// Open (or return) the channel for a room and register it with the
    /// presence channel.
    pub fn create_room_transport(&self, room: &Jid) -> TransportResult<Arc<Channel>> {
        let room = room.bare();
        if let Some(channel) = self.rooms.lock().get(&room) {
            return Ok(channel.clone());
        }
        let channel = self.open_data_channel(room.as_str())?;
        self.rooms.lock().insert(room.clone(), channel.clone());
        self.router
            .presence
            .register_room_channel(room, channel.clone());
        Ok(channel)
    }

    /// The channel of a room, if one was created.
    pub fn room_transport(&self, room: &Jid) -> Option<Arc<Channel>> {
        self.rooms.lock().get(&room.bare()).cloned()
    }

    /// Open (or return) the one-to-one chat channel.
    pub fn create_one_to_one_transport(&self) -> TransportResult<Arc<Channel>> {
        let mut one_to_one = self.one_to_one.lock();
        if let Some(channel) = one_to_one.as_ref() {
            return Ok(channel.clone());
        }
        let channel = self.open_data_channel(ONE_TO_ONE_CHANNEL)?;
        *one_to_one = Some(channel.clone());
        Ok(channel)
    }

    fn open_data_channel(&self, name: &str) -> TransportResult<Arc<Channel>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed(name.to_string()));
        }
        let port = self.ports.port_for(name);
        info!(channel = name, port, "Opening data channel");
        let sessions = open_sessions(self.engine.as_ref(), &self.config, port)?;
        let channel = Arc::new(Channel::new(
            self.engine.clone(),
            sessions,
            channel_options(&self.config, name),
            Some(self.sink.clone()),
        ));
        let mut routes = self.router.routes.write();
        for s in &channel.sessions().receiving {
            routes.insert(s.session, Route::Data(channel.clone()));
        }
        Ok(channel)
    }

    /// Stop the event loop, close every channel and shut the engine down.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node_id = %self.local_node(), "Closing transport");
        self.cancel.cancel();
        for (room, channel) in self.rooms.lock().drain() {
            debug!(%room, "Closing room channel");
            channel.close();
        }
        if let Some(channel) = self.one_to_one.lock().take() {
            channel.close();
        }
        self.router.presence.close();
        self.router.routes.write().clear();
        self.engine.shutdown();
    }
}

impl Drop for TransportService {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pull engine events until cancelled, shut down or failed.
async fn event_loop(router: Arc<Router>, cancel: CancellationToken) -> TransportResult<()> {
    debug!(node_id = %router.local_node, "Event loop started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = router.engine.next_event() => event,
        };
        match event {
            Ok(Some(event)) => router.dispatch(event),
            Ok(None) => {
                debug!("Engine shut down");
                break;
            }
            Err(e) => {
                error!(error = %e, "Engine failed, stopping event loop");
                return Err(e);
            }
        }
    }
    debug!(node_id = %router.local_node, "Event loop stopped");
    Ok(())
}

fn channel_options(config: &TransportConfig, name: &str) -> ChannelOptions {
    ChannelOptions {
        name: name.to_string(),
        local_node: config.local_node_id(),
        compression: config.compression,
        dedup_capacity: config.dedup_capacity,
        grtt_multiplier: config.presence.grtt_multiplier,
    }
}

/// Create and start one sender session per send interface and one receiver
/// session per receive interface on `port`.
fn open_sessions(
    engine: &dyn MulticastEngine,
    config: &TransportConfig,
    port: u16,
) -> TransportResult<ChannelSessions> {
    let mut sessions = ChannelSessions::default();
    if let Err(e) = start_sessions(engine, config, port, &mut sessions) {
        error!(port, error = %e, "Session setup failed");
        for s in &sessions.sending {
            engine.stop_sender(s.session);
        }
        for s in &sessions.receiving {
            engine.stop_receiver(s.session);
        }
        return Err(e);
    }
    Ok(sessions)
}

fn start_sessions(
    engine: &dyn MulticastEngine,
    config: &TransportConfig,
    port: u16,
    sessions: &mut ChannelSessions,
) -> TransportResult<()> {
    let local_node = config.local_node_id();
    for iface in &config.send_interfaces {
        let session = engine.create_session(iface, config.multicast_group, port, local_node)?;
        sessions.sending.push(ChannelSession {
            session,
            iface: iface.clone(),
        });
        engine.start_sender(session, &config.engine)?;
        debug!(%session, iface = %iface, port, "Sender started");
    }
    for iface in &config.recv_interfaces {
        let session = engine.create_session(iface, config.multicast_group, port, local_node)?;
        sessions.receiving.push(ChannelSession {
            session,
            iface: iface.clone(),
        });
        engine.start_receiver(session, &config.engine)?;
        debug!(%session, iface = %iface, port, "Receiver started");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{EventForwarder, PacketForwarder};
    use crate::engine::{MemoryEngine, MemoryNetwork};
    use crate::wire::WireCodec;

    fn config(node: u64) -> TransportConfig {
        TransportConfig {
            node_id: node,
            send_interfaces: vec!["lo".to_string()],
            recv_interfaces: vec!["lo".to_string()],
            port_range: "10001-10010".to_string(),
            ..TransportConfig::default()
        }
    }

    fn service(network: &MemoryNetwork, node: u64) -> (TransportService, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new(network));
        let svc = TransportService::new(
            config(node),
            engine.clone(),
            Arc::new(EventForwarder::new()),
            Arc::new(PacketForwarder::new()),
        )
        .unwrap();
        (svc, engine)
    }

    #[test]
    fn test_presence_on_first_port() {
        let network = MemoryNetwork::new();
        let (svc, engine) = service(&network, 1);
        assert_eq!(svc.ports().first(), 10001);
        assert_eq!(engine.sessions().len(), 2);
        assert_eq!(svc.presence().channel().sessions().sending.len(), 1);
        assert_eq!(svc.presence().channel().sessions().receiving.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let network = MemoryNetwork::new();
        let mut cfg = config(1);
        cfg.recv_interfaces.clear();
        let result = TransportService::new(
            cfg,
            Arc::new(MemoryEngine::new(&network)),
            Arc::new(EventForwarder::new()),
            Arc::new(PacketForwarder::new()),
        );
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[test]
    fn test_room_transport_is_cached() {
        let network = MemoryNetwork::new();
        let (svc, engine) = service(&network, 1);
        let room = Jid::parse("room@conference.proxy").unwrap();

        let a = svc.create_room_transport(&room).unwrap();
        let b = svc
            .create_room_transport(&Jid::parse("room@conference.proxy/nick").unwrap())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(engine.sessions().len(), 4);
        assert_eq!(a.name(), "room@conference.proxy");
        assert!(svc.room_transport(&room).is_some());

        let one = svc.create_one_to_one_transport().unwrap();
        assert!(Arc::ptr_eq(&one, &svc.create_one_to_one_transport().unwrap()));
        assert_eq!(one.name(), ONE_TO_ONE_CHANNEL);
    }

    #[test]
    fn test_own_origin_guard() {
        let network = MemoryNetwork::new();
        let (svc, _engine) = service(&network, 7);
        assert!(svc.router.is_own(SessionId(1), Some(NodeId(7))));
        assert!(!svc.router.is_own(SessionId(1), Some(NodeId(8))));
        assert!(!svc.router.is_own(SessionId(1), None));
    }

    #[tokio::test]
    async fn test_engine_failure_ends_loop_with_error() {
        let network = MemoryNetwork::new();
        let (svc, engine) = service(&network, 1);
        let handle = svc.start().unwrap();
        assert!(svc.start().is_err());

        engine.inject_failure("link exploded");
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TransportError::Engine(msg)) if msg == "link exploded"));
    }

    #[tokio::test]
    async fn test_close_ends_loop_cleanly() {
        let network = MemoryNetwork::new();
        let (svc, engine) = service(&network, 1);
        let handle = svc.start().unwrap();
        svc.close();
        svc.close();
        assert!(handle.await.unwrap().is_ok());
        assert!(engine.sessions().iter().all(|s| !engine.is_active(*s)));
        assert!(svc.create_one_to_one_transport().is_err());
    }

    #[tokio::test]
    async fn test_malformed_object_does_not_stop_loop() {
        let network = MemoryNetwork::new();
        let (svc, _engine) = service(&network, 1);
        let (other, other_engine) = service(&network, 2);
        let handle = svc.start().unwrap();

        let session = other.presence().channel().sessions().sending[0].session;
        other_engine
            .data_enqueue(session, Bytes::from_static(b"\x00junk"), Bytes::from_static(b"{bad"))
            .unwrap();
        other_engine
            .send_command(session, Bytes::from_static(b"not a snapshot"))
            .unwrap();
        let snapshot = crate::types::PeerSnapshot::new(NodeId(2));
        other_engine
            .send_command(session, WireCodec::encode_snapshot(&snapshot).unwrap())
            .unwrap();

        let seq = || svc.presence().peer(NodeId(2)).map(|p| p.seq);
        for _ in 0..50 {
            if seq() == Some(1) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(seq(), Some(1));
        assert!(!handle.is_finished());
        svc.close();
    }
}
