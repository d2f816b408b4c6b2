//! Collaborators the call controller drives but does not implement.
//!
//! A [`PeerConnection`] is the platform WebRTC stack (codec negotiation, ICE,
//! DTLS, media transport). A [`MediaSource`] captures local devices and a
//! [`CallView`] renders streams and shows errors to the user.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{CallError, MediaAccessError, PeerError};
use crate::model::media::{MediaConstraints, MediaStream, RemoteTrack};
use crate::model::message::{IceCandidate, SessionDescription};
use crate::peer::controller::{CallCommand, CallId};

/// Connectivity state reported by the ICE agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate to trickle to the remote side.
    LocalCandidate(IceCandidate),
    /// The remote side started sending a track.
    TrackAdded(RemoteTrack),
    IceStateChanged(IceConnectionState),
}

/// Where a peer connection reports its events. Events are tagged with the
/// call that created the connection so stale ones can be told apart.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    call: CallId,
    tx: mpsc::UnboundedSender<CallCommand>,
}

impl PeerEvents {
    pub fn new(call: CallId, tx: mpsc::UnboundedSender<CallCommand>) -> PeerEvents {
        PeerEvents { call, tx }
    }

    pub fn call(&self) -> CallId {
        self.call
    }

    /// Queues `event` behind any command already waiting. Returns false once the
    /// controller has stopped.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send(CallCommand::Peer(self.call, event)).is_ok()
    }
}

/// One RTCPeerConnection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Adds local tracks so they are part of the next offer or answer.
    async fn add_local_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError>;

    /// Creates an offer. With `ice_restart` the offer carries fresh ICE credentials.
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    /// Creates the answer to the applied remote offer.
    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&mut self, desc: &SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), PeerError>;

    /// Withdraws the local offer still waiting for its answer.
    async fn rollback(&mut self) -> Result<(), PeerError>;

    /// Fails with [`PeerError::InvalidState`] when no remote description is set.
    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Closes the connection. Closing twice is harmless.
    async fn close(&mut self);
}

/// Creates a fresh [`PeerConnection`] for every call attempt.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&mut self, events: PeerEvents) -> Result<Box<dyn PeerConnection>, PeerError>;
}

/// Local capture devices.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&mut self, constraints: MediaConstraints)
        -> Result<MediaStream, MediaAccessError>;
}

/// The user interface around a call.
pub trait CallView: Send + Sync {
    /// Session id typed by the user, if any.
    fn session_id(&self) -> Option<String>;

    fn attach_local(&mut self, stream: &MediaStream);

    fn attach_remote(&mut self, track: &RemoteTrack);

    /// Removes both local and remote streams from display.
    fn clear(&mut self);

    /// Shows an error the user has to act on.
    fn show_error(&mut self, error: &CallError);
}
