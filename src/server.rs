//! Signaling relay
//!
//! Accepts WebSocket connections, groups them by session id and forwards
//! offer, answer and candidate frames between the members of a session
//! without interpreting their payloads.

use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::model::{
    message::{ErrorCode, SignalingMessage},
    session::{EndpointId, Session, SessionId},
};

/// Bounded queue feeding one endpoint's WebSocket writer.
pub type Outbound = mpsc::Sender<Message>;

/// The registry shared by every connection task. All operations go through
/// the one lock, so joins and leaves of the two members never interleave.
pub type SharedRegistry = Arc<Mutex<SessionRegistry>>;

/// Session membership of all connected endpoints.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session<Outbound>>,
    memberships: HashMap<EndpointId, SessionId>,
    max_members: usize,
}

impl SessionRegistry {
    pub fn new(max_members: usize) -> SessionRegistry {
        SessionRegistry {
            sessions: HashMap::new(),
            memberships: HashMap::new(),
            max_members: max_members.max(1),
        }
    }

    pub fn shared(max_members: usize) -> SharedRegistry {
        Arc::new(Mutex::new(SessionRegistry::new(max_members)))
    }

    /// Adds `endpoint` to `session_id`, creating the session on first join.
    ///
    /// The joiner receives `joined`, existing members receive `peer-joined`.
    /// An endpoint already in another session leaves it first. Returns the
    /// member count after the join.
    pub fn join(
        &mut self,
        endpoint: EndpointId,
        outbound: Outbound,
        session_id: &str,
    ) -> Result<usize, RelayError> {
        if self.session_of(endpoint) == Some(session_id) {
            debug!("Endpoint {} already in session '{}'", endpoint, session_id);
            return Ok(self.members(session_id));
        }

        // A refused join keeps the endpoint in its current session.
        if let Some(session) = self.sessions.get(session_id) {
            if session.len() >= self.max_members {
                return Err(RelayError::SessionFull {
                    session_id: session_id.to_string(),
                    members: session.len(),
                });
            }
        }

        if self.memberships.contains_key(&endpoint) {
            self.leave(endpoint);
        }

        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("Session '{}' created", session_id);
                Session::new(session_id.to_string())
            });

        if let Some(notice) = notice(&SignalingMessage::PeerJoined) {
            for (to, tx) in session.others(endpoint) {
                deliver(to, tx, notice.clone());
            }
        }

        session.insert(endpoint, outbound.clone());
        let members = session.len();
        self.memberships.insert(endpoint, session_id.to_string());

        if let Some(joined) = notice(&SignalingMessage::Joined {
            session_id: session_id.to_string(),
            members,
        }) {
            deliver(endpoint, &outbound, joined);
        }

        Ok(members)
    }

    /// Forwards `frame` unmodified to every other member of the sender's session.
    ///
    /// Returns how many members it was handed to; zero means the peer has not
    /// joined yet and the frame was dropped.
    pub fn relay(
        &mut self,
        from: EndpointId,
        frame: &Message,
        addressed: Option<&str>,
    ) -> Result<usize, RelayError> {
        let Some(session_id) = self.memberships.get(&from) else {
            return Err(RelayError::NoSession(*from));
        };

        if let Some(addressed) = addressed {
            if addressed != session_id {
                return Err(RelayError::SessionMismatch {
                    endpoint: *from,
                    addressed: addressed.to_string(),
                    joined: session_id.clone(),
                });
            }
        }

        let Some(session) = self.sessions.get(session_id) else {
            return Err(RelayError::NoSession(*from));
        };

        let mut delivered = 0;
        for (to, tx) in session.others(from) {
            if deliver(to, tx, frame.clone()) {
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Removes `endpoint` from its session, telling the remaining member.
    /// The session is destroyed once empty. Returns the session left, if any.
    pub fn leave(&mut self, endpoint: EndpointId) -> Option<SessionId> {
        let session_id = self.memberships.remove(&endpoint)?;
        let session = self.sessions.get_mut(&session_id)?;
        session.remove(endpoint);

        if let Some(notice) = notice(&SignalingMessage::PeerLeft) {
            for (to, tx) in session.others(endpoint) {
                deliver(to, tx, notice.clone());
            }
        }

        if session.is_empty() {
            let age = session.age();
            self.sessions.remove(&session_id);
            info!(
                "Session '{}' closed after {}s",
                session_id,
                age.num_seconds()
            );
        }

        Some(session_id)
    }

    pub fn session_of(&self, endpoint: EndpointId) -> Option<&str> {
        self.memberships.get(&endpoint).map(String::as_str)
    }

    pub fn members(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, Session::len)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drops every session and asks each member's writer to close its socket.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for (_, session) in self.sessions.drain() {
            for (endpoint, tx) in session.members() {
                if deliver(endpoint, tx, Message::Close(None)) {
                    closed += 1;
                }
            }
        }
        self.memberships.clear();
        closed
    }
}

/// Queues `msg` for `to` without waiting. A full queue drops the frame.
fn deliver(to: EndpointId, tx: &Outbound, msg: Message) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Outbound queue of endpoint {} is full, frame dropped", to);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Endpoint {} is gone, frame not delivered", to);
            false
        }
    }
}

fn notice(message: &SignalingMessage) -> Option<Message> {
    match message.to_json() {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!("Could not encode {} notice: {}", message.kind(), e);
            None
        }
    }
}

/// The relay's WebSocket listener.
pub struct RelayServer {
    listener: TcpListener,
    registry: SharedRegistry,
    outbound_buffer: usize,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<RelayServer> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(RelayServer {
            listener,
            registry: SessionRegistry::shared(config.max_members),
            outbound_buffer: config.outbound_buffer.max(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Serves connections until `shutdown` resolves, then closes every
    /// connected endpoint.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let closed = self.registry.lock().close_all();
                    info!("Relay shutting down, closed {} endpoints", closed);
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            self.registry.clone(),
                            self.outbound_buffer,
                        ));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }
    }
}

pub async fn run(config: RelayConfig) -> Result<()> {
    let server = RelayServer::bind(&config).await?;
    info!(
        "Signaling relay listening on ws://{} (max {} per session)",
        server.local_addr()?,
        config.max_members
    );

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: SharedRegistry,
    outbound_buffer: usize,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let endpoint = EndpointId::next();
    info!("Endpoint {} connected from {}", endpoint, addr);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(outbound_buffer);

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(frame) => {
                if !handle_frame(endpoint, &tx, frame, &registry) {
                    break;
                }
            }
            Err(e) => {
                warn!("WebSocket error on endpoint {}: {}", endpoint, e);
                break;
            }
        }
    }

    if let Some(session_id) = registry.lock().leave(endpoint) {
        info!("Endpoint {} left session '{}'", endpoint, session_id);
    }
    info!("Endpoint {} disconnected", endpoint);

    drop(tx);
    let _ = forward_task.await;
}

/// Processes one inbound frame. Returns false when the connection should close.
fn handle_frame(
    endpoint: EndpointId,
    tx: &Outbound,
    frame: Message,
    registry: &SharedRegistry,
) -> bool {
    let parsed = match &frame {
        Message::Text(text) => SignalingMessage::parse(text),
        Message::Binary(bytes) => SignalingMessage::parse_bytes(bytes),
        Message::Close(_) => return false,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return true,
    };

    let message = match parsed {
        Ok(message) => message,
        Err(e) => {
            warn!("Endpoint {} sent an invalid message: {}", endpoint, e);
            reply(endpoint, tx, ErrorCode::InvalidMessage, e.to_string());
            return true;
        }
    };

    debug!("Endpoint {} sent {}", endpoint, message.kind());

    match &message {
        SignalingMessage::Join { session_id } => {
            let joined = registry.lock().join(endpoint, tx.clone(), session_id);
            match joined {
                Ok(members) => info!(
                    "Endpoint {} joined session '{}' ({} members)",
                    endpoint, session_id, members
                ),
                Err(e) => {
                    warn!("Endpoint {} join rejected: {}", endpoint, e);
                    reply(endpoint, tx, ErrorCode::SessionFull, e.to_string());
                }
            }
        }
        SignalingMessage::Leave => {
            if let Some(session_id) = registry.lock().leave(endpoint) {
                info!("Endpoint {} left session '{}'", endpoint, session_id);
            }
        }
        message if message.is_relayed() => {
            let relayed = registry.lock().relay(endpoint, &frame, message.session_id());
            match relayed {
                Ok(0) => debug!(
                    "No peer for {} from endpoint {}, dropped",
                    message.kind(),
                    endpoint
                ),
                Ok(n) => debug!("Relayed {} from endpoint {} to {}", message.kind(), endpoint, n),
                Err(e @ RelayError::NoSession(_)) => {
                    warn!("Dropping {}: {}", message.kind(), e);
                    reply(endpoint, tx, ErrorCode::NoSession, e.to_string());
                }
                Err(e) => warn!("Dropping {}: {}", message.kind(), e),
            }
        }
        message => warn!(
            "Endpoint {} sent relay-only message {}, ignored",
            endpoint,
            message.kind()
        ),
    }

    true
}

fn reply(endpoint: EndpointId, tx: &Outbound, code: ErrorCode, reason: String) {
    if let Some(msg) = notice(&SignalingMessage::Error { code, reason }) {
        deliver(endpoint, tx, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    fn endpoint() -> (EndpointId, Outbound, Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (EndpointId::next(), tx, rx)
    }

    fn drain(rx: &mut Receiver<Message>) -> Vec<SignalingMessage> {
        let mut out = vec![];
        while let Ok(msg) = rx.try_recv() {
            out.push(SignalingMessage::parse(msg.to_text().unwrap()).unwrap());
        }
        out
    }

    #[test]
    fn third_join_is_rejected() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        let (b, b_tx, _b_rx) = endpoint();
        let (c, c_tx, _c_rx) = endpoint();

        assert_eq!(registry.join(a, a_tx, "room1").unwrap(), 1);
        assert_eq!(registry.join(b, b_tx, "room1").unwrap(), 2);
        let err = registry.join(c, c_tx, "room1").unwrap_err();
        assert!(matches!(err, RelayError::SessionFull { members: 2, .. }));
        assert_eq!(registry.session_of(c), None);
    }

    #[test]
    fn join_notifies_both_sides() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, mut a_rx) = endpoint();
        let (b, b_tx, mut b_rx) = endpoint();

        registry.join(a, a_tx, "room1").unwrap();
        registry.join(b, b_tx, "room1").unwrap();

        assert_eq!(
            drain(&mut a_rx),
            vec![
                SignalingMessage::Joined {
                    session_id: "room1".into(),
                    members: 1
                },
                SignalingMessage::PeerJoined,
            ]
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![SignalingMessage::Joined {
                session_id: "room1".into(),
                members: 2
            }]
        );
    }

    #[test]
    fn rejoining_same_session_is_a_noop() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        registry.join(a, a_tx.clone(), "room1").unwrap();
        assert_eq!(registry.join(a, a_tx, "room1").unwrap(), 1);
        assert_eq!(registry.members("room1"), 1);
    }

    #[test]
    fn joining_another_session_leaves_the_first() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        registry.join(a, a_tx.clone(), "room1").unwrap();
        registry.join(a, a_tx, "room2").unwrap();

        assert_eq!(registry.members("room1"), 0);
        assert_eq!(registry.members("room2"), 1);
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn relay_preserves_order_and_bytes() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, mut a_rx) = endpoint();
        let (b, b_tx, mut b_rx) = endpoint();
        registry.join(a, a_tx, "room1").unwrap();
        registry.join(b, b_tx, "room1").unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let frames: Vec<Message> = (0..5)
            .map(|i| {
                Message::Text(format!(
                    r#"{{"type":"candidate","candidate":{{"candidate":"candidate:{i} 1 udp 1 10.0.0.1 5000 typ host"}}}}"#
                ))
            })
            .collect();
        for frame in &frames {
            assert_eq!(registry.relay(a, frame, None).unwrap(), 1);
        }

        let mut received = vec![];
        while let Ok(msg) = b_rx.try_recv() {
            received.push(msg);
        }
        assert_eq!(received, frames);
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn relay_without_peer_drops_silently() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        registry.join(a, a_tx, "room1").unwrap();
        let frame = Message::Text(r#"{"type":"leave"}"#.into());
        assert_eq!(registry.relay(a, &frame, None).unwrap(), 0);
    }

    #[test]
    fn relay_without_session_fails() {
        let mut registry = SessionRegistry::new(2);
        let (a, _a_tx, _a_rx) = endpoint();
        let frame = Message::Text("{}".into());
        assert!(matches!(
            registry.relay(a, &frame, None),
            Err(RelayError::NoSession(_))
        ));
    }

    #[test]
    fn relay_to_wrong_session_fails() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        registry.join(a, a_tx, "room1").unwrap();
        let frame = Message::Text("{}".into());
        assert!(matches!(
            registry.relay(a, &frame, Some("room2")),
            Err(RelayError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn leave_notifies_peer_and_destroys_empty_session() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        let (b, b_tx, mut b_rx) = endpoint();
        registry.join(a, a_tx, "room1").unwrap();
        registry.join(b, b_tx, "room1").unwrap();
        drain(&mut b_rx);

        assert_eq!(registry.leave(a).as_deref(), Some("room1"));
        assert_eq!(drain(&mut b_rx), vec![SignalingMessage::PeerLeft]);
        assert_eq!(registry.session_count(), 1);

        assert_eq!(registry.leave(b).as_deref(), Some("room1"));
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.leave(b), None);
    }

    #[test]
    fn freed_slot_can_be_taken() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        let (b, b_tx, _b_rx) = endpoint();
        let (c, c_tx, _c_rx) = endpoint();
        registry.join(a, a_tx, "room1").unwrap();
        registry.join(b, b_tx, "room1").unwrap();
        registry.leave(a);
        assert_eq!(registry.join(c, c_tx, "room1").unwrap(), 2);
    }

    #[test]
    fn refused_switch_keeps_current_session() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        let (b, b_tx, _b_rx) = endpoint();
        let (c, c_tx, mut c_rx) = endpoint();
        registry.join(a, a_tx, "full").unwrap();
        registry.join(b, b_tx, "full").unwrap();
        registry.join(c, c_tx.clone(), "home").unwrap();
        drain(&mut c_rx);

        let err = registry.join(c, c_tx, "full").unwrap_err();
        assert!(matches!(err, RelayError::SessionFull { .. }));
        assert_eq!(registry.session_of(c), Some("home"));
        assert_eq!(registry.members("home"), 1);
        assert!(drain(&mut c_rx).is_empty());
    }

    #[test]
    fn full_outbound_queue_drops_frames() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, _a_rx) = endpoint();
        let (b_tx, mut b_rx) = mpsc::channel(2);
        let b = EndpointId::next();
        registry.join(a, a_tx, "room1").unwrap();
        registry.join(b, b_tx, "room1").unwrap();

        // `joined` already holds one of b's two slots.
        let frame = Message::Text(r#"{"type":"leave"}"#.into());
        assert_eq!(registry.relay(a, &frame, None).unwrap(), 1);
        assert_eq!(registry.relay(a, &frame, None).unwrap(), 0);

        assert!(b_rx.try_recv().unwrap().to_text().unwrap().contains("joined"));
        assert_eq!(b_rx.try_recv().unwrap(), frame);
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn close_all_closes_every_member() {
        let mut registry = SessionRegistry::new(2);
        let (a, a_tx, mut a_rx) = endpoint();
        let (b, b_tx, mut b_rx) = endpoint();
        registry.join(a, a_tx, "room1").unwrap();
        registry.join(b, b_tx, "room2").unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.session_of(a), None);
        assert!(matches!(a_rx.try_recv(), Ok(Message::Close(None))));
        assert!(matches!(b_rx.try_recv(), Ok(Message::Close(None))));
    }
}
