//! WebSocket connection to the relay.
//!
//! The channel reconnects with a fixed delay and re-joins its session on every
//! connect. Outbound messages are tagged with the epoch they were produced in;
//! the epoch advances each time an established connection drops, and messages
//! from an earlier epoch are discarded so a stale call never leaks into a new
//! connection. Messages produced before the first connection are held in a
//! bounded queue and flushed right after the join.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::SignalingChannelError;
use crate::model::message::SignalingMessage;
use crate::peer::controller::{CallCommand, ChannelEvent};

/// A message queued for the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub epoch: u64,
    pub message: SignalingMessage,
}

/// Cloneable handle for queueing messages to the relay.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl SignalingSender {
    pub fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> SignalingSender {
        SignalingSender { tx }
    }

    /// Returns false once the channel task has stopped.
    pub fn send(&self, epoch: u64, message: SignalingMessage) -> bool {
        debug!("Queueing {} (epoch {})", message.kind(), epoch);
        self.tx.send(OutboundMessage { epoch, message }).is_ok()
    }
}

/// Outbound messages waiting for a connection.
#[derive(Debug)]
pub struct OutboundQueue {
    epoch: u64,
    pending: VecDeque<SignalingMessage>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> OutboundQueue {
        OutboundQueue {
            epoch: 0,
            pending: VecDeque::new(),
            capacity,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, out: &OutboundMessage) -> bool {
        out.epoch == self.epoch
    }

    /// Holds `out` until the next connection. Stale messages and messages past
    /// capacity are dropped; returns whether it was kept.
    pub fn hold(&mut self, out: OutboundMessage) -> bool {
        if !self.is_current(&out) {
            debug!(
                "Dropping {} from epoch {} (now {})",
                out.message.kind(),
                out.epoch,
                self.epoch
            );
            return false;
        }
        if self.pending.len() >= self.capacity {
            warn!(
                "Outbound queue full ({}), dropping {}",
                self.capacity,
                out.message.kind()
            );
            return false;
        }
        self.pending.push_back(out.message);
        true
    }

    pub fn take_pending(&mut self) -> Vec<SignalingMessage> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Starts a new epoch after an established connection dropped.
    pub fn connection_lost(&mut self) -> u64 {
        self.epoch += 1;
        self.pending.clear();
        self.epoch
    }
}

/// Owns the relay connection and its reconnect loop.
pub struct SignalingChannel {
    url: String,
    session_id: Option<String>,
    reconnect_delay: Duration,
    queue: OutboundQueue,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    commands: mpsc::UnboundedSender<CallCommand>,
}

impl SignalingChannel {
    /// Creates the channel and the sender the controller uses to reach it.
    pub fn new(
        config: &PeerConfig,
        commands: mpsc::UnboundedSender<CallCommand>,
    ) -> (SignalingChannel, SignalingSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel {
            url: config.server_url.clone(),
            session_id: config.session_id.clone(),
            reconnect_delay: config.reconnect_delay(),
            queue: OutboundQueue::new(config.outbound_buffer),
            outbound: rx,
            commands,
        };
        (channel, SignalingSender::new(tx))
    }

    /// Runs until every [`SignalingSender`] is dropped or the controller stops.
    pub async fn run(mut self) {
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Connected to signaling server {}", self.url);
                    let epoch = self.queue.epoch();
                    if !self.notify(ChannelEvent::Connected { epoch }) {
                        return;
                    }

                    match self.serve(ws).await {
                        Ok(()) => {
                            info!("Signaling channel shut down");
                            return;
                        }
                        Err(e) => warn!("Signaling connection lost: {}", e),
                    }

                    let epoch = self.queue.connection_lost();
                    if !self.notify(ChannelEvent::Lost { epoch }) {
                        return;
                    }
                }
                Err(e) => warn!("Could not reach signaling server {}: {}", self.url, e),
            }

            if !self.back_off().await {
                return;
            }
        }
    }

    fn notify(&self, event: ChannelEvent) -> bool {
        self.commands.send(CallCommand::Channel(event)).is_ok()
    }

    // Sleeps for the reconnect delay while still accepting outbound messages.
    // Returns false when the controller has gone away.
    async fn back_off(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                out = self.outbound.recv() => match out {
                    Some(out) => {
                        self.queue.hold(out);
                    }
                    None => return false,
                },
            }
        }
    }

    /// Drives one established connection. `Ok` means an orderly shutdown,
    /// `Err` a lost connection.
    async fn serve<S>(&mut self, ws: S) -> Result<(), SignalingChannelError>
    where
        S: Sink<Message, Error = tungstenite::Error>
            + futures_util::Stream<Item = Result<Message, tungstenite::Error>>
            + Unpin,
    {
        let SignalingChannel {
            session_id,
            queue,
            outbound,
            commands,
            ..
        } = self;
        let (mut sink, mut stream) = ws.split();

        if let Some(session_id) = session_id.as_ref() {
            let join = SignalingMessage::Join {
                session_id: session_id.clone(),
            };
            send_message(&mut sink, &join).await?;
            info!("Joining session '{}'", session_id);
        }

        for message in queue.take_pending() {
            send_message(&mut sink, &message).await?;
        }

        loop {
            tokio::select! {
                out = outbound.recv() => match out {
                    Some(out) if queue.is_current(&out) => send_message(&mut sink, &out.message).await?,
                    Some(out) => {
                        queue.hold(out);
                    }
                    None => {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                },
                frame = stream.next() => {
                    let parsed = match frame {
                        Some(Ok(Message::Text(text))) => Some(SignalingMessage::parse(&text)),
                        Some(Ok(Message::Binary(bytes))) => Some(SignalingMessage::parse_bytes(&bytes)),
                        Some(Ok(Message::Close(_))) | None => return Err(SignalingChannelError::Closed),
                        Some(Ok(_)) => None,
                        Some(Err(e)) => return Err(e.into()),
                    };

                    match parsed {
                        Some(Ok(message)) => {
                            debug!("Received {} from relay", message.kind());
                            if commands.send(CallCommand::Signal(message)).is_err() {
                                let _ = sink.close().await;
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => warn!("Ignoring malformed signaling message: {}", e),
                        None => {}
                    }
                }
            }
        }
    }
}

async fn send_message<S>(sink: &mut S, message: &SignalingMessage) -> Result<(), SignalingChannelError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = message.to_json()?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}
