//! In-process multicast engine
//!
//! A [`MemoryNetwork`] stands in for the physical links. Interface names are
//! link names: two engines that create sessions on `"net1"` for the same
//! group and port hear each other, exactly as two hosts on one segment
//! would. Links can be taken down to simulate partitions, and round-trip
//! estimates can be injected per session.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{EngineEvent, MulticastEngine};
use crate::config::EngineParams;
use crate::error::{TransportError, TransportResult};
use crate::types::{NodeId, SessionId};

type Inbox = mpsc::UnboundedSender<TransportResult<EngineEvent>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LinkKey {
    iface: String,
    group: Ipv4Addr,
    port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Member {
    engine: u64,
    session: SessionId,
}

#[derive(Default)]
struct NetworkInner {
    next_engine: u64,
    inboxes: HashMap<u64, Inbox>,
    receivers: HashMap<LinkKey, Vec<Member>>,
    down: HashSet<String>,
    /// (member, sender) pairs that have already been announced
    announced: HashSet<(Member, NodeId)>,
}

/// Shared in-process "wire" connecting [`MemoryEngine`]s
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a link up or down. Traffic sent on a down link is lost.
    pub fn set_link_up(&self, iface: &str, up: bool) {
        let mut inner = self.inner.lock();
        if up {
            inner.down.remove(iface);
        } else {
            inner.down.insert(iface.to_string());
        }
        debug!(iface, up, "Memory link state changed");
    }

    pub fn is_link_up(&self, iface: &str) -> bool {
        !self.inner.lock().down.contains(iface)
    }

    fn register(&self, inbox: Inbox) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_engine += 1;
        let id = inner.next_engine;
        inner.inboxes.insert(id, inbox);
        id
    }

    fn unregister(&self, engine: u64) {
        let mut inner = self.inner.lock();
        inner.inboxes.remove(&engine);
        for members in inner.receivers.values_mut() {
            members.retain(|m| m.engine != engine);
        }
        inner.announced.retain(|(m, _)| m.engine != engine);
    }

    fn join(&self, key: LinkKey, member: Member) {
        let mut inner = self.inner.lock();
        let members = inner.receivers.entry(key).or_default();
        if !members.contains(&member) {
            members.push(member);
        }
    }

    fn leave(&self, key: &LinkKey, member: Member) {
        let mut inner = self.inner.lock();
        if let Some(members) = inner.receivers.get_mut(key) {
            members.retain(|m| *m != member);
        }
    }

    /// Hand an event to every other engine receiving on `key`.
    fn deliver(
        &self,
        from_engine: u64,
        key: &LinkKey,
        sender: NodeId,
        make: impl Fn(SessionId) -> EngineEvent,
    ) {
        let mut inner = self.inner.lock();
        if inner.down.contains(&key.iface) {
            trace!(iface = %key.iface, "Link down, dropping");
            return;
        }
        let members: Vec<Member> = inner
            .receivers
            .get(key)
            .map(|m| m.iter().filter(|m| m.engine != from_engine).copied().collect())
            .unwrap_or_default();

        for member in members {
            let announce = inner.announced.insert((member, sender));
            let Some(inbox) = inner.inboxes.get(&member.engine) else {
                continue;
            };
            if announce {
                let _ = inbox.send(Ok(EngineEvent::RemoteSenderNew {
                    session: member.session,
                    sender,
                }));
            }
            let _ = inbox.send(Ok(make(member.session)));
        }
    }
}

#[derive(Debug)]
struct MemorySession {
    key: LinkKey,
    node: NodeId,
    sending: bool,
    receiving: bool,
    grtt: Option<Duration>,
}

/// [`MulticastEngine`] over a [`MemoryNetwork`]
pub struct MemoryEngine {
    id: u64,
    network: MemoryNetwork,
    sessions: Mutex<HashMap<SessionId, MemorySession>>,
    next_session: AtomicU64,
    inbox: Inbox,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportResult<EngineEvent>>>,
    shutdown: CancellationToken,
}

impl MemoryEngine {
    /// Attach a new engine to `network`.
    pub fn new(network: &MemoryNetwork) -> Self {
        let (inbox, events) = mpsc::unbounded_channel();
        let id = network.register(inbox.clone());
        Self {
            id,
            network: network.clone(),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            inbox,
            events: tokio::sync::Mutex::new(events),
            shutdown: CancellationToken::new(),
        }
    }

    /// Set a session's round-trip estimate and report it as an event.
    pub fn set_grtt(&self, session: SessionId, grtt: Duration) -> TransportResult<()> {
        {
            let mut sessions = self.sessions.lock();
            let entry = sessions
                .get_mut(&session)
                .ok_or(TransportError::UnknownSession(session.0))?;
            entry.grtt = Some(grtt);
        }
        let _ = self.inbox.send(Ok(EngineEvent::GrttUpdated { session, grtt }));
        Ok(())
    }

    /// Make the event stream fail with `message`.
    pub fn inject_failure(&self, message: &str) {
        let _ = self
            .inbox
            .send(Err(TransportError::Engine(message.to_string())));
    }

    /// Sessions created so far.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Whether a session's sender or receiver is still running.
    pub fn is_active(&self, session: SessionId) -> bool {
        self.sessions
            .lock()
            .get(&session)
            .map(|s| s.sending || s.receiving)
            .unwrap_or(false)
    }

    fn sending_key(&self, session: SessionId) -> TransportResult<(LinkKey, NodeId)> {
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(&session)
            .ok_or(TransportError::UnknownSession(session.0))?;
        if !entry.sending {
            return Err(TransportError::Session(format!("sender not started on {}", session)));
        }
        Ok((entry.key.clone(), entry.node))
    }
}

impl MulticastEngine for MemoryEngine {
    fn create_session(
        &self,
        iface: &str,
        group: Ipv4Addr,
        port: u16,
        local_node: NodeId,
    ) -> TransportResult<SessionId> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Session("engine shut down".into()));
        }
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let key = LinkKey {
            iface: iface.to_string(),
            group,
            port,
        };
        debug!(%session, iface, %group, port, node_id = %local_node, "Memory session created");
        self.sessions.lock().insert(
            session,
            MemorySession {
                key,
                node: local_node,
                sending: false,
                receiving: false,
                grtt: None,
            },
        );
        Ok(session)
    }

    fn start_sender(&self, session: SessionId, _params: &EngineParams) -> TransportResult<()> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&session)
            .ok_or(TransportError::UnknownSession(session.0))?;
        entry.sending = true;
        Ok(())
    }

    fn start_receiver(&self, session: SessionId, _params: &EngineParams) -> TransportResult<()> {
        let key = {
            let mut sessions = self.sessions.lock();
            let entry = sessions
                .get_mut(&session)
                .ok_or(TransportError::UnknownSession(session.0))?;
            entry.receiving = true;
            entry.key.clone()
        };
        self.network.join(
            key,
            Member {
                engine: self.id,
                session,
            },
        );
        Ok(())
    }

    fn stop_sender(&self, session: SessionId) {
        if let Some(entry) = self.sessions.lock().get_mut(&session) {
            entry.sending = false;
        }
    }

    fn stop_receiver(&self, session: SessionId) {
        let key = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&session) {
                Some(entry) => {
                    entry.receiving = false;
                    entry.key.clone()
                }
                None => return,
            }
        };
        self.network.leave(
            &key,
            Member {
                engine: self.id,
                session,
            },
        );
    }

    fn data_enqueue(&self, session: SessionId, data: Bytes, info: Bytes) -> TransportResult<()> {
        let (key, sender) = self.sending_key(session)?;
        self.network.deliver(self.id, &key, sender, |session| {
            EngineEvent::RxObjectCompleted {
                session,
                sender,
                info: info.clone(),
                data: data.clone(),
            }
        });
        Ok(())
    }

    fn send_command(&self, session: SessionId, command: Bytes) -> TransportResult<()> {
        let (key, sender) = self.sending_key(session)?;
        self.network.deliver(self.id, &key, sender, |session| {
            EngineEvent::RxCommandNew {
                session,
                sender,
                command: command.clone(),
            }
        });
        Ok(())
    }

    fn grtt_estimate(&self, session: SessionId) -> Option<Duration> {
        self.sessions.lock().get(&session).and_then(|s| s.grtt)
    }

    fn local_node_id(&self, session: SessionId) -> Option<NodeId> {
        self.sessions.lock().get(&session).map(|s| s.node)
    }

    fn next_event(&self) -> BoxFuture<'_, TransportResult<Option<EngineEvent>>> {
        async move {
            let mut events = self.events.lock().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => Ok(None),
                event = events.recv() => match event {
                    Some(Ok(event)) => Ok(Some(event)),
                    Some(Err(e)) => Err(e),
                    None => Ok(None),
                },
            }
        }
        .boxed()
    }

    fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for entry in self.sessions.lock().values_mut() {
            entry.sending = false;
            entry.receiving = false;
        }
        self.network.unregister(self.id);
        debug!(engine = self.id, "Memory engine shut down");
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        self.network.unregister(self.id);
    }
}
