//! Call controller
//!
//! Every UI action, relay message, peer-connection event and channel event is
//! a [`CallCommand`] on one queue. The controller handles one command at a
//! time and awaits each asynchronous step (media capture, description
//! creation and application) before taking the next, so a start click racing
//! an incoming offer is simply handled in arrival order.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::PeerConfig;
use crate::error::{CallError, PeerError, ProtocolStateError};
use crate::model::media::{MediaConstraints, MediaStream};
use crate::model::message::{IceCandidate, SessionDescription, SignalingMessage};
use crate::model::negotiation::{NegotiationPhase, PhaseEvent};
use crate::peer::capability::{
    CallView, IceConnectionState, MediaSource, PeerConnection, PeerConnector, PeerEvent,
    PeerEvents,
};
use crate::peer::channel::SignalingSender;

/// Identifies one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State changes of the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { epoch: u64 },
    /// An established connection dropped; `epoch` is the new epoch.
    Lost { epoch: u64 },
}

/// Work items for the controller queue.
#[derive(Debug)]
pub enum CallCommand {
    StartCall,
    EndCall,
    Signal(SignalingMessage),
    Peer(CallId, PeerEvent),
    Channel(ChannelEvent),
    Shutdown,
}

/// Cloneable entry point into the controller queue.
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<CallCommand>,
}

impl CallHandle {
    pub fn channel() -> (CallHandle, mpsc::UnboundedReceiver<CallCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CallHandle { tx }, rx)
    }

    pub fn start_call(&self) -> bool {
        self.tx.send(CallCommand::StartCall).is_ok()
    }

    pub fn end_call(&self) -> bool {
        self.tx.send(CallCommand::EndCall).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.tx.send(CallCommand::Shutdown).is_ok()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<CallCommand> {
        self.tx.clone()
    }
}

/// Limits and capture settings of the controller.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub max_ice_restarts: u32,
    pub candidate_buffer: usize,
    pub constraints: MediaConstraints,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_ice_restarts: 3,
            candidate_buffer: 64,
            constraints: MediaConstraints::default(),
        }
    }
}

impl From<&PeerConfig> for ControllerConfig {
    fn from(config: &PeerConfig) -> Self {
        Self {
            max_ice_restarts: config.max_ice_restarts,
            candidate_buffer: config.candidate_buffer,
            constraints: config.constraints(),
        }
    }
}

/// Everything owned by one call attempt.
struct ActiveCall {
    id: CallId,
    phase: NegotiationPhase,
    peer: Option<Box<dyn PeerConnection>>,
    local: Option<MediaStream>,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    ice_restarts: u32,
    // The remote side placed the call; this side yields on restart glare.
    answerer: bool,
    // An ICE-restart offer is waiting for its answer.
    restarting: bool,
}

impl ActiveCall {
    fn new(id: CallId, peer: Box<dyn PeerConnection>) -> ActiveCall {
        ActiveCall {
            id,
            phase: NegotiationPhase::Idle,
            peer: Some(peer),
            local: None,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            ice_restarts: 0,
            answerer: false,
            restarting: false,
        }
    }

    fn advance(&mut self, event: PhaseEvent) -> Result<(), ProtocolStateError> {
        let next = self.phase.on(event)?;
        debug!("Call {}: {:?} -> {:?}", self.id, self.phase, next);
        self.phase = next;
        Ok(())
    }

    fn peer(&mut self) -> Result<&mut Box<dyn PeerConnection>, PeerError> {
        self.peer.as_mut().ok_or(PeerError::Closed)
    }
}

/// Drives the negotiation of one call at a time.
pub struct CallController {
    config: ControllerConfig,
    commands: mpsc::UnboundedSender<CallCommand>,
    connector: Box<dyn PeerConnector>,
    media: Box<dyn MediaSource>,
    view: Box<dyn CallView>,
    signaling: SignalingSender,
    call: Option<ActiveCall>,
    // Remote candidates that arrived while no call could take them.
    early_candidates: VecDeque<IceCandidate>,
    epoch: u64,
    next_call: u64,
}

impl CallController {
    pub fn new(
        config: ControllerConfig,
        handle: &CallHandle,
        connector: Box<dyn PeerConnector>,
        media: Box<dyn MediaSource>,
        view: Box<dyn CallView>,
        signaling: SignalingSender,
    ) -> CallController {
        CallController {
            config,
            commands: handle.sender(),
            connector,
            media,
            view,
            signaling,
            call: None,
            early_candidates: VecDeque::new(),
            epoch: 0,
            next_call: 0,
        }
    }

    /// Current phase; `Idle` when no call was ever started.
    pub fn phase(&self) -> NegotiationPhase {
        self.call
            .as_ref()
            .map_or(NegotiationPhase::Idle, |call| call.phase)
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.call.as_ref().map(|call| call.id)
    }

    /// Candidates waiting for a remote description.
    pub fn buffered_candidates(&self) -> usize {
        let in_call = self
            .call
            .as_ref()
            .map_or(0, |call| call.pending_candidates.len());
        in_call + self.early_candidates.len()
    }

    /// Processes commands until [`CallCommand::Shutdown`].
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CallCommand>) {
        while let Some(command) = commands.recv().await {
            if let CallCommand::Shutdown = command {
                break;
            }
            self.handle(command).await;
        }

        if self.close_call().await {
            info!("Call ended on shutdown");
        }
    }

    /// Handles a single command to completion.
    pub async fn handle(&mut self, command: CallCommand) {
        match command {
            CallCommand::StartCall => self.start_call().await,
            CallCommand::EndCall => self.end_call().await,
            CallCommand::Signal(message) => self.on_signal(message).await,
            CallCommand::Peer(id, event) => {
                if self.is_live_call(id) {
                    self.on_peer_event(event).await;
                } else {
                    debug!("Ignoring {:?} from stale call {}", event, id);
                }
            }
            CallCommand::Channel(event) => self.on_channel(event).await,
            CallCommand::Shutdown => {
                self.close_call().await;
            }
        }
    }

    fn is_live_call(&self, id: CallId) -> bool {
        self.call
            .as_ref()
            .is_some_and(|call| call.id == id && !call.phase.is_closed())
    }

    fn has_live_call(&self) -> bool {
        self.call.as_ref().is_some_and(|call| !call.phase.is_closed())
    }

    fn send(&self, message: SignalingMessage) {
        if !self.signaling.send(self.epoch, message) {
            warn!("Signaling channel stopped, message dropped");
        }
    }

    async fn new_call(&mut self) -> Result<ActiveCall, PeerError> {
        self.next_call += 1;
        let id = CallId(self.next_call);
        let events = PeerEvents::new(id, self.commands.clone());
        let peer = self.connector.connect(events).await?;
        info!("Call {} created", id);
        Ok(ActiveCall::new(id, peer))
    }

    async fn start_call(&mut self) {
        if let Some(call) = self.call.as_ref().filter(|call| !call.phase.is_closed()) {
            warn!(
                "Call {} already in progress ({:?}), start ignored",
                call.id, call.phase
            );
            return;
        }

        // Candidates gathered before our own offer cannot belong to it.
        self.early_candidates.clear();

        let mut call = match self.new_call().await {
            Ok(call) => call,
            Err(e) => {
                error!("Could not create peer connection: {}", e);
                return;
            }
        };
        if let Err(e) = call.advance(PhaseEvent::StartCall) {
            warn!("{}", e);
            return;
        }
        self.call = Some(call);

        if let Err(e) = self.place_offer().await {
            self.abandon(e).await;
        }
    }

    async fn place_offer(&mut self) -> Result<(), CallError> {
        let stream = self.media.acquire(self.config.constraints).await?;
        self.view.attach_local(&stream);

        let call = self.call.as_mut().ok_or(PeerError::Closed)?;
        call.local = Some(stream.clone());

        let peer = call.peer()?;
        peer.add_local_stream(&stream).await?;
        let offer = peer.create_offer(false).await?;
        peer.set_local_description(&offer).await?;
        call.advance(PhaseEvent::LocalOffer)?;
        info!("Call {} offering", call.id);

        self.send(SignalingMessage::Offer {
            session_id: self.view.session_id(),
            offer,
            ice_restart: false,
        });
        Ok(())
    }

    async fn end_call(&mut self) {
        if !self.close_call().await {
            warn!("No active call to end");
            return;
        }
        if let Some(id) = self.call_id() {
            info!("Call {} ended", id);
        }
    }

    /// Closes the peer connection, stops local tracks and clears the view.
    /// Returns false when there was nothing to close.
    async fn close_call(&mut self) -> bool {
        let Some(call) = self.call.as_mut() else {
            return false;
        };
        if call.phase.is_closed() {
            return false;
        }

        if let Some(mut peer) = call.peer.take() {
            peer.close().await;
        }
        if let Some(stream) = call.local.take() {
            stream.stop();
        }
        call.pending_candidates.clear();
        call.remote_description_set = false;
        call.restarting = false;
        if let Err(e) = call.advance(PhaseEvent::End) {
            warn!("{}", e);
        }
        self.early_candidates.clear();

        self.view.clear();
        true
    }

    /// Ends the current call because of `error`.
    async fn abandon(&mut self, error: CallError) {
        if error.is_user_facing() {
            error!("Call failed: {}", error);
            self.view.show_error(&error);
        } else {
            warn!("Call abandoned: {}", error);
        }
        self.close_call().await;
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer {
                offer, ice_restart, ..
            } => self.on_remote_offer(offer, ice_restart).await,
            SignalingMessage::Answer { answer, .. } => self.on_remote_answer(answer).await,
            SignalingMessage::Candidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await
            }
            SignalingMessage::Joined {
                session_id,
                members,
            } => info!("Joined session '{}' ({} members)", session_id, members),
            SignalingMessage::PeerJoined => info!("Remote peer joined the session"),
            SignalingMessage::PeerLeft => {
                info!("Remote peer left the session");
                if self.close_call().await {
                    info!("Call ended by remote peer");
                }
            }
            SignalingMessage::Error { code, reason } => {
                warn!("Relay rejected a request ({:?}): {}", code, reason)
            }
            other => warn!("Unexpected {} from relay, ignored", other.kind()),
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription, ice_restart: bool) {
        let phase = self.phase();
        match phase {
            NegotiationPhase::Stable if ice_restart => {
                info!("Remote peer restarting ICE");
                if let Err(e) = self.answer_offer(offer).await {
                    self.abandon(e).await;
                }
            }
            NegotiationPhase::Stable => {
                info!("Offer received while connected, recreating the call");
                self.close_call().await;
                self.accept_call(offer).await;
            }
            NegotiationPhase::Idle | NegotiationPhase::Closed => self.accept_call(offer).await,
            NegotiationPhase::HaveLocalOffer if ice_restart && self.restart_pending() => {
                self.on_restart_glare(offer).await
            }
            phase => {
                let e = ProtocolStateError {
                    phase,
                    event: PhaseEvent::RemoteOffer,
                };
                warn!("Discarding offer: {}", e);
            }
        }
    }

    // Both sides restarted ICE at once. The side that answered the call
    // withdraws its own offer and answers; the caller keeps waiting.
    async fn on_restart_glare(&mut self, offer: SessionDescription) {
        if !self.call.as_ref().is_some_and(|call| call.answerer) {
            info!("Both sides restarted ICE, keeping our restart offer");
            return;
        }

        info!("Both sides restarted ICE, answering the remote restart offer");
        let answered = match self.withdraw_restart_offer().await {
            Ok(()) => self.answer_offer(offer).await,
            Err(e) => Err(e),
        };
        if let Err(e) = answered {
            self.abandon(e).await;
        }
    }

    fn restart_pending(&self) -> bool {
        self.call.as_ref().is_some_and(|call| call.restarting)
    }

    async fn withdraw_restart_offer(&mut self) -> Result<(), CallError> {
        let call = self.call.as_mut().ok_or(PeerError::Closed)?;
        call.peer()?.rollback().await?;
        call.advance(PhaseEvent::Rollback)?;
        call.restarting = false;
        Ok(())
    }

    async fn accept_call(&mut self, offer: SessionDescription) {
        let mut call = match self.new_call().await {
            Ok(call) => call,
            Err(e) => {
                error!("Could not create peer connection: {}", e);
                return;
            }
        };
        call.answerer = true;
        self.call = Some(call);

        let answered = match self.apply_remote_offer(offer).await {
            Ok(()) => {
                self.attach_answer_media().await;
                self.send_answer().await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = answered {
            self.abandon(e).await;
        }
    }

    // Answers an offer on the existing connection (ICE restart).
    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        self.apply_remote_offer(offer).await?;
        self.send_answer().await
    }

    async fn apply_remote_offer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        let call = self.call.as_mut().ok_or(PeerError::Closed)?;
        call.peer()?.set_remote_description(&offer).await?;
        call.advance(PhaseEvent::RemoteOffer)?;
        call.remote_description_set = true;

        self.flush_candidates().await;
        Ok(())
    }

    // The answering side captures media too; without it the call continues
    // receive-only.
    async fn attach_answer_media(&mut self) {
        let stream = match self.media.acquire(self.config.constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                let error = CallError::from(e);
                warn!("Answering without local media: {}", error);
                self.view.show_error(&error);
                return;
            }
        };
        self.view.attach_local(&stream);

        let Some(call) = self.call.as_mut() else {
            stream.stop();
            return;
        };
        let id = call.id;
        call.local = Some(stream.clone());
        if let Ok(peer) = call.peer() {
            if let Err(e) = peer.add_local_stream(&stream).await {
                warn!("Could not add local media to call {}: {}", id, e);
            }
        }
    }

    async fn send_answer(&mut self) -> Result<(), CallError> {
        let call = self.call.as_mut().ok_or(PeerError::Closed)?;
        let peer = call.peer()?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(&answer).await?;
        call.advance(PhaseEvent::LocalAnswer)?;
        info!("Call {} answered", call.id);

        self.send(SignalingMessage::Answer {
            session_id: self.view.session_id(),
            answer,
        });
        Ok(())
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        let phase = self.phase();
        if phase != NegotiationPhase::HaveLocalOffer {
            let e = ProtocolStateError {
                phase,
                event: PhaseEvent::RemoteAnswer,
            };
            warn!("Discarding answer: {}", e);
            return;
        }

        if let Err(e) = self.apply_remote_answer(answer).await {
            self.abandon(e).await;
        }
    }

    async fn apply_remote_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        let call = self.call.as_mut().ok_or(PeerError::Closed)?;
        call.peer()?.set_remote_description(&answer).await?;
        call.advance(PhaseEvent::RemoteAnswer)?;
        call.remote_description_set = true;
        call.restarting = false;
        info!("Call {} connected", call.id);

        self.flush_candidates().await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let limit = self.config.candidate_buffer;
        match self.call.as_mut() {
            Some(call) if !call.phase.is_closed() && call.remote_description_set => {
                if let Ok(peer) = call.peer() {
                    if let Err(e) = peer.add_ice_candidate(&candidate).await {
                        warn!("Remote candidate rejected: {}", e);
                    }
                }
            }
            Some(call) if !call.phase.is_closed() => {
                buffer_candidate(&mut call.pending_candidates, candidate, limit)
            }
            Some(call) => debug!("Dropping candidate for ended call {}", call.id),
            None => buffer_candidate(&mut self.early_candidates, candidate, limit),
        }
    }

    // Applies buffered candidates in arrival order once the remote
    // description is in place.
    async fn flush_candidates(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };

        let mut queued = std::mem::take(&mut self.early_candidates);
        queued.extend(call.pending_candidates.drain(..));
        if queued.is_empty() {
            return;
        }

        let Ok(peer) = call.peer() else {
            return;
        };
        debug!("Applying {} buffered candidates", queued.len());
        for candidate in queued {
            if let Err(e) = peer.add_ice_candidate(&candidate).await {
                warn!("Buffered candidate rejected: {}", e);
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send(SignalingMessage::Candidate {
                    session_id: self.view.session_id(),
                    candidate,
                });
            }
            PeerEvent::TrackAdded(track) => {
                info!("Remote {:?} track on mid {}", track.kind, track.mid);
                self.view.attach_remote(&track);
            }
            PeerEvent::IceStateChanged(state) => {
                info!("ICE connection state: {:?}", state);
                match state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        if let Some(call) = self.call.as_mut() {
                            call.ice_restarts = 0;
                        }
                    }
                    IceConnectionState::Failed => self.restart_ice().await,
                    IceConnectionState::Closed => self.abandon(CallError::ConnectionLost).await,
                    _ => {}
                }
            }
        }
    }

    async fn restart_ice(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        // A restart offer still unanswered is withdrawn and sent again.
        let unanswered = call.phase == NegotiationPhase::HaveLocalOffer && call.restarting;
        if call.phase != NegotiationPhase::Stable && !unanswered {
            debug!(
                "ICE failed during negotiation ({:?}), not restarting",
                call.phase
            );
            return;
        }
        if call.ice_restarts >= self.config.max_ice_restarts {
            let attempts = call.ice_restarts;
            self.abandon(CallError::IceFailed { attempts }).await;
            return;
        }
        call.ice_restarts += 1;
        info!("Restarting ICE (attempt {})", call.ice_restarts);

        let restarted = if unanswered {
            match self.withdraw_restart_offer().await {
                Ok(()) => self.offer_ice_restart().await,
                Err(e) => Err(e),
            }
        } else {
            self.offer_ice_restart().await
        };
        if let Err(e) = restarted {
            self.abandon(e).await;
        }
    }

    async fn offer_ice_restart(&mut self) -> Result<(), CallError> {
        let call = self.call.as_mut().ok_or(PeerError::Closed)?;
        let peer = call.peer()?;
        let offer = peer.create_offer(true).await?;
        peer.set_local_description(&offer).await?;
        call.advance(PhaseEvent::IceRestart)?;
        call.restarting = true;

        self.send(SignalingMessage::Offer {
            session_id: self.view.session_id(),
            offer,
            ice_restart: true,
        });
        Ok(())
    }

    async fn on_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { epoch } => {
                self.epoch = epoch;
                info!("Signaling channel up");
            }
            ChannelEvent::Lost { epoch } => {
                self.epoch = epoch;
                if self.has_live_call() {
                    self.abandon(CallError::SignalingLost).await;
                    info!("Call must be restarted once signaling is back");
                }
            }
        }
    }
}

fn buffer_candidate(queue: &mut VecDeque<IceCandidate>, candidate: IceCandidate, limit: usize) {
    if queue.len() >= limit {
        warn!("Candidate buffer full ({}), dropping candidate", limit);
        return;
    }
    debug!("Buffering candidate until the remote description is set");
    queue.push_back(candidate);
}
