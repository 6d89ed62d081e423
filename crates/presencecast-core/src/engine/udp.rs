//! Best-effort UDP multicast engine
//!
//! Each session is one IPv4 socket bound to the group port and joined to the
//! group on the session's interface. Objects and commands are framed into
//! single datagrams:
//!
//! ```text
//! ┌───────┬─────────┬──────┬───────────┬──────────┬──────┬──────┐
//! │ "PC"  │ version │ kind │ sender u64│ info u32 │ info │ data │
//! └───────┴─────────┴──────┴───────────┴──────────┴──────┴──────┘
//! ```
//!
//! There is no retransmission, FEC or congestion control, so an object is
//! limited to one datagram and losses are final. The group round-trip
//! estimate is a fixed value supplied at construction.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{EngineEvent, MulticastEngine};
use crate::config::{EngineParams, ANY_INTERFACE};
use crate::error::{TransportError, TransportResult};
use crate::types::{NodeId, SessionId};

const MAGIC: &[u8; 2] = b"PC";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 2 + 1 + 1 + 8 + 4;
const MAX_DATAGRAM: usize = 65507;

type Inbox = mpsc::UnboundedSender<TransportResult<EngineEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Object = 1,
    Command = 2,
}

#[derive(Debug, Clone, PartialEq)]
struct Frame {
    kind: FrameKind,
    sender: NodeId,
    info: Bytes,
    data: Bytes,
}

impl Frame {
    fn encode(&self) -> TransportResult<Bytes> {
        let len = HEADER_LEN + self.info.len() + self.data.len();
        if len > MAX_DATAGRAM {
            return Err(TransportError::Engine(format!(
                "object of {} bytes exceeds one datagram",
                len
            )));
        }
        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.sender.get());
        buf.put_u32(self.info.len() as u32);
        buf.put_slice(&self.info);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    fn decode(datagram: &[u8]) -> TransportResult<Frame> {
        if datagram.len() < HEADER_LEN || &datagram[..2] != MAGIC {
            return Err(TransportError::Engine("not a presencecast datagram".into()));
        }
        let mut buf = Bytes::copy_from_slice(datagram);
        buf.advance(2);
        let version = buf.get_u8();
        if version != VERSION {
            return Err(TransportError::Engine(format!("unsupported version {}", version)));
        }
        let kind = match buf.get_u8() {
            1 => FrameKind::Object,
            2 => FrameKind::Command,
            other => return Err(TransportError::Engine(format!("unknown frame kind {}", other))),
        };
        let sender = NodeId(buf.get_u64());
        let info_len = buf.get_u32() as usize;
        if buf.remaining() < info_len {
            return Err(TransportError::Engine("truncated datagram".into()));
        }
        let info = buf.split_to(info_len);
        Ok(Frame {
            kind,
            sender,
            info,
            data: buf,
        })
    }
}

/// Resolve an interface name from the configuration to an address.
pub fn interface_addr(iface: &str) -> TransportResult<Ipv4Addr> {
    if iface.eq_ignore_ascii_case(ANY_INTERFACE) {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    iface
        .parse()
        .map_err(|_| TransportError::InvalidConfig(format!("interface {:?} is not an IPv4 address", iface)))
}

struct UdpSession {
    socket: Arc<UdpSocket>,
    dest: SocketAddrV4,
    node: NodeId,
    sending: bool,
    receiver: Option<CancellationToken>,
}

/// [`MulticastEngine`] over plain UDP multicast
pub struct UdpEngine {
    grtt: Duration,
    sessions: Mutex<HashMap<SessionId, UdpSession>>,
    next_session: AtomicU64,
    inbox: Inbox,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportResult<EngineEvent>>>,
    shutdown: CancellationToken,
}

impl UdpEngine {
    /// Create an engine reporting `grtt` as every session's round-trip estimate.
    pub fn new(grtt: Duration) -> Self {
        let (inbox, events) = mpsc::unbounded_channel();
        Self {
            grtt,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            inbox,
            events: tokio::sync::Mutex::new(events),
            shutdown: CancellationToken::new(),
        }
    }

    fn open_socket(iface: Ipv4Addr, group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
        socket.join_multicast_v4(&group, &iface)?;
        socket.set_multicast_if_v4(&iface)?;
        // Other processes on this host are peers too
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn send_frame(&self, session: SessionId, kind: FrameKind, info: Bytes, data: Bytes) -> TransportResult<()> {
        let (socket, dest, node) = {
            let sessions = self.sessions.lock();
            let entry = sessions
                .get(&session)
                .ok_or(TransportError::UnknownSession(session.0))?;
            if !entry.sending {
                return Err(TransportError::Session(format!("sender not started on {}", session)));
            }
            (entry.socket.clone(), entry.dest, entry.node)
        };
        let frame = Frame {
            kind,
            sender: node,
            info,
            data,
        }
        .encode()?;
        socket.try_send_to(&frame, SocketAddr::V4(dest))?;
        trace!(%session, bytes = frame.len(), "Datagram sent");
        Ok(())
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    session: SessionId,
    local: NodeId,
    inbox: Inbox,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut known = HashSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    let frame = match Frame::decode(&buf[..len]) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(%session, %from, error = %e, "Ignoring datagram");
                            continue;
                        }
                    };
                    if frame.sender == local {
                        continue;
                    }
                    if known.insert(frame.sender) {
                        let _ = inbox.send(Ok(EngineEvent::RemoteSenderNew {
                            session,
                            sender: frame.sender,
                        }));
                    }
                    let event = match frame.kind {
                        FrameKind::Object => EngineEvent::RxObjectCompleted {
                            session,
                            sender: frame.sender,
                            info: frame.info,
                            data: frame.data,
                        },
                        FrameKind::Command => EngineEvent::RxCommandNew {
                            session,
                            sender: frame.sender,
                            command: frame.data,
                        },
                    };
                    let _ = inbox.send(Ok(event));
                }
                Err(e) => {
                    warn!(%session, error = %e, "Multicast receive failed");
                    let _ = inbox.send(Err(e.into()));
                    break;
                }
            }
        }
    }
    debug!(%session, "Receive loop ended");
}

impl MulticastEngine for UdpEngine {
    fn create_session(
        &self,
        iface: &str,
        group: Ipv4Addr,
        port: u16,
        local_node: NodeId,
    ) -> TransportResult<SessionId> {
        if !group.is_multicast() {
            return Err(TransportError::InvalidConfig(format!("{} is not a multicast group", group)));
        }
        let iface_addr = interface_addr(iface)?;
        let std_socket = Self::open_socket(iface_addr, group, port)
            .map_err(|e| TransportError::Session(format!("{}:{} on {}: {}", group, port, iface, e)))?;
        let socket = UdpSocket::from_std(std_socket)?;

        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        info!(%session, iface, %group, port, node_id = %local_node, "UDP session created");
        self.sessions.lock().insert(
            session,
            UdpSession {
                socket: Arc::new(socket),
                dest: SocketAddrV4::new(group, port),
                node: local_node,
                sending: false,
                receiver: None,
            },
        );
        Ok(session)
    }

    fn start_sender(&self, session: SessionId, params: &EngineParams) -> TransportResult<()> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&session)
            .ok_or(TransportError::UnknownSession(session.0))?;
        SockRef::from(entry.socket.as_ref()).set_send_buffer_size(params.send_buffer_space)?;
        entry.sending = true;
        Ok(())
    }

    fn start_receiver(&self, session: SessionId, params: &EngineParams) -> TransportResult<()> {
        let (socket, node, cancel) = {
            let mut sessions = self.sessions.lock();
            let entry = sessions
                .get_mut(&session)
                .ok_or(TransportError::UnknownSession(session.0))?;
            if entry.receiver.is_some() {
                return Ok(());
            }
            SockRef::from(entry.socket.as_ref()).set_recv_buffer_size(params.recv_buffer_space)?;
            let cancel = self.shutdown.child_token();
            entry.receiver = Some(cancel.clone());
            (entry.socket.clone(), entry.node, cancel)
        };
        tokio::spawn(receive_loop(socket, session, node, self.inbox.clone(), cancel));
        let _ = self.inbox.send(Ok(EngineEvent::GrttUpdated {
            session,
            grtt: self.grtt,
        }));
        Ok(())
    }

    fn stop_sender(&self, session: SessionId) {
        if let Some(entry) = self.sessions.lock().get_mut(&session) {
            entry.sending = false;
        }
    }

    fn stop_receiver(&self, session: SessionId) {
        if let Some(entry) = self.sessions.lock().get_mut(&session) {
            if let Some(cancel) = entry.receiver.take() {
                cancel.cancel();
            }
        }
    }

    fn data_enqueue(&self, session: SessionId, data: Bytes, info: Bytes) -> TransportResult<()> {
        self.send_frame(session, FrameKind::Object, info, data)
    }

    fn send_command(&self, session: SessionId, command: Bytes) -> TransportResult<()> {
        self.send_frame(session, FrameKind::Command, Bytes::new(), command)
    }

    fn grtt_estimate(&self, session: SessionId) -> Option<Duration> {
        self.sessions.lock().contains_key(&session).then_some(self.grtt)
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
        self.shutdown.cancel();
        let mut sessions = self.sessions.lock();
        for entry in sessions.values_mut() {
            entry.sending = false;
            entry.receiver = None;
        }
        sessions.clear();
        debug!("UDP engine shut down");
    }
}
