use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use rover_signal::config::{PeerConfig, RelayConfig};
use rover_signal::model::message::{IceCandidate, SignalingMessage};
use rover_signal::peer::channel::SignalingChannel;
use rover_signal::peer::controller::{CallCommand, ChannelEvent};
use rover_signal::server::{RelayServer, SharedRegistry};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(300);

struct Relay {
    addr: SocketAddr,
    registry: SharedRegistry,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Relay {
    async fn start(listen: SocketAddr) -> Relay {
        let config = RelayConfig {
            listen,
            ..RelayConfig::default()
        };
        let server = RelayServer::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));
        Relay {
            addr,
            registry,
            stop,
            task,
        }
    }

    async fn shut_down(self) {
        self.stop.send(()).unwrap();
        self.task.await.unwrap().unwrap();
    }

    async fn wait_for_members(&self, session: &str, members: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.registry.lock().members(session) != members {
            assert!(
                tokio::time::Instant::now() < deadline,
                "session '{session}' never reached {members} members"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn next_channel_event(commands: &mut mpsc::UnboundedReceiver<CallCommand>) -> ChannelEvent {
    loop {
        let command = tokio::time::timeout(WAIT, commands.recv())
            .await
            .expect("timed out waiting for a channel event")
            .expect("channel stopped");
        match command {
            CallCommand::Channel(event) => return event,
            CallCommand::Signal(_) => {}
            other => panic!("unexpected command {:?}", other),
        }
    }
}

async fn recv(ws: &mut Client) -> SignalingMessage {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return SignalingMessage::parse(&text).unwrap();
        }
    }
}

fn candidate(name: &str) -> SignalingMessage {
    SignalingMessage::Candidate {
        session_id: Some("room1".to_string()),
        candidate: IceCandidate::new(name),
    }
}

#[tokio::test]
async fn reconnects_rejoins_and_drops_stale_messages() {
    let relay = Relay::start(([127, 0, 0, 1], 0).into()).await;
    let addr = relay.addr;

    let config = PeerConfig {
        server_url: format!("ws://{addr}"),
        session_id: Some("room1".to_string()),
        reconnect_delay_ms: 300,
        ..PeerConfig::default()
    };
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let (channel, signaling) = SignalingChannel::new(&config, commands_tx);
    tokio::spawn(channel.run());

    assert_eq!(
        next_channel_event(&mut commands).await,
        ChannelEvent::Connected { epoch: 0 }
    );
    relay.wait_for_members("room1", 1).await;

    relay.shut_down().await;
    assert_eq!(
        next_channel_event(&mut commands).await,
        ChannelEvent::Lost { epoch: 1 }
    );

    // Produced for the dropped connection; must never reach the relay.
    assert!(signaling.send(0, candidate("stale")));

    let relay = Relay::start(addr).await;
    let (mut peer, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    peer.send(Message::Text(
        r#"{"type":"join","sessionId":"room1"}"#.to_string(),
    ))
    .await
    .unwrap();
    assert!(matches!(
        recv(&mut peer).await,
        SignalingMessage::Joined { members: 1, .. }
    ));

    assert_eq!(
        next_channel_event(&mut commands).await,
        ChannelEvent::Connected { epoch: 1 }
    );
    assert_eq!(recv(&mut peer).await, SignalingMessage::PeerJoined);
    relay.wait_for_members("room1", 2).await;

    let frame = tokio::time::timeout(QUIET, peer.next()).await;
    assert!(frame.is_err(), "stale message delivered: {:?}", frame);

    assert!(signaling.send(1, candidate("fresh")));
    match recv(&mut peer).await {
        SignalingMessage::Candidate { candidate, .. } => assert_eq!(candidate.candidate, "fresh"),
        other => panic!("expected the fresh candidate, got {:?}", other),
    }
}

#[tokio::test]
async fn messages_before_first_connection_are_flushed_after_join() {
    let relay = Relay::start(([127, 0, 0, 1], 0).into()).await;
    let addr = relay.addr;
    let (mut peer, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    peer.send(Message::Text(
        r#"{"type":"join","sessionId":"room1"}"#.to_string(),
    ))
    .await
    .unwrap();
    recv(&mut peer).await;

    let config = PeerConfig {
        server_url: format!("ws://{addr}"),
        session_id: Some("room1".to_string()),
        reconnect_delay_ms: 100,
        ..PeerConfig::default()
    };
    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let (channel, signaling) = SignalingChannel::new(&config, commands_tx);
    assert!(signaling.send(0, candidate("queued")));
    tokio::spawn(channel.run());

    assert_eq!(
        next_channel_event(&mut commands).await,
        ChannelEvent::Connected { epoch: 0 }
    );
    assert_eq!(recv(&mut peer).await, SignalingMessage::PeerJoined);
    match recv(&mut peer).await {
        SignalingMessage::Candidate { candidate, .. } => assert_eq!(candidate.candidate, "queued"),
        other => panic!("expected the queued candidate, got {:?}", other),
    }
}
