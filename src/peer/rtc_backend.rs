//! Native peer connections on top of str0m.
//!
//! str0m is sans-IO: each connection gets a UDP socket and a driver task that
//! shuttles datagrams and timeouts in and out of the [`Rtc`] instance, turning
//! str0m events into [`PeerEvent`]s. The controller talks to the same `Rtc`
//! through [`PeerConnection`], mapped onto str0m's SDP API:
//!
//! * `create_offer` applies pending local changes and keeps the pending offer.
//! * `set_remote_description(offer)` accepts the offer, which also produces the
//!   answer handed out by `create_answer`.
//! * `set_local_description` only checks there is something to commit, since
//!   str0m applies local changes when the description is created.

use std::{
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use str0m::{
    change::{SdpAnswer, SdpOffer, SdpPendingOffer},
    media::{Direction, MediaKind},
    net::{Protocol, Receive},
    Candidate, Event, Input, Output, Rtc,
};
use tokio::{net::UdpSocket, sync::oneshot};
use tracing::{debug, info, warn};

use crate::error::PeerError;
use crate::model::media::{MediaStream, MediaTrack, RemoteTrack, TrackKind};
use crate::model::message::{IceCandidate, SdpKind, SessionDescription};
use crate::peer::capability::{
    IceConnectionState, PeerConnection, PeerConnector, PeerEvent, PeerEvents,
};

/// Creates str0m peer connections bound to one host address.
#[derive(Debug, Clone)]
pub struct Str0mConnector {
    host: IpAddr,
}

impl Str0mConnector {
    pub fn new(host: IpAddr) -> Str0mConnector {
        Str0mConnector { host }
    }
}

#[async_trait]
impl PeerConnector for Str0mConnector {
    async fn connect(&mut self, events: PeerEvents) -> Result<Box<dyn PeerConnection>, PeerError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.host, 0)).await?;
        let addr = socket.local_addr()?;
        info!("Call {} bound UDP port: {}", events.call(), addr);

        let candidate =
            Candidate::host(addr, Protocol::Udp).map_err(|_| PeerError::NoCandidates)?;
        let local_candidate = IceCandidate {
            candidate: candidate.to_sdp_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };

        let mut rtc = Rtc::builder().build();
        rtc.add_local_candidate(candidate);
        let rtc = Arc::new(Mutex::new(rtc));

        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(drive(rtc.clone(), socket, events.clone(), close_rx));

        Ok(Box::new(Str0mPeer {
            rtc,
            events,
            local_tracks: vec![],
            negotiated_tracks: 0,
            pending_offer: None,
            prepared_answer: None,
            remote_set: false,
            local_candidates: vec![local_candidate],
            candidates_sent: false,
            close_tx: Some(close_tx),
        }))
    }
}

struct Str0mPeer {
    rtc: Arc<Mutex<Rtc>>,
    events: PeerEvents,
    local_tracks: Vec<MediaTrack>,
    // Tracks already placed in an offer.
    negotiated_tracks: usize,
    pending_offer: Option<SdpPendingOffer>,
    prepared_answer: Option<SdpAnswer>,
    remote_set: bool,
    local_candidates: Vec<IceCandidate>,
    candidates_sent: bool,
    close_tx: Option<oneshot::Sender<()>>,
}

impl Str0mPeer {
    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.close_tx.is_none() || !self.rtc.lock().is_alive() {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    // Trickles the host candidates once the first local description is set.
    fn announce_candidates(&mut self) {
        if self.candidates_sent {
            return;
        }
        self.candidates_sent = true;
        for candidate in &self.local_candidates {
            self.events
                .emit(PeerEvent::LocalCandidate(candidate.clone()));
        }
    }
}

#[async_trait]
impl PeerConnection for Str0mPeer {
    async fn add_local_stream(&mut self, stream: &MediaStream) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.local_tracks.extend(stream.tracks.iter().cloned());
        Ok(())
    }

    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.pending_offer.is_some() {
            return Err(PeerError::InvalidState("an offer is already pending"));
        }

        let mut rtc = self.rtc.lock();
        let mut change = rtc.sdp_api();

        if ice_restart {
            change.ice_restart(true);
        }
        for track in &self.local_tracks[self.negotiated_tracks..] {
            let kind = match track.kind {
                TrackKind::Audio => MediaKind::Audio,
                TrackKind::Video => MediaKind::Video,
            };
            change.add_media(kind, Direction::SendRecv, None, Some(track.id.clone()), None);
        }

        let Some((offer, pending)) = change.apply() else {
            return Err(PeerError::Sdp("nothing to negotiate".to_string()));
        };
        drop(rtc);

        self.negotiated_tracks = self.local_tracks.len();
        self.pending_offer = Some(pending);
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let answer = self
            .prepared_answer
            .take()
            .ok_or(PeerError::InvalidState("no remote offer to answer"))?;
        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    async fn set_local_description(&mut self, desc: &SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        match desc.kind {
            SdpKind::Offer if self.pending_offer.is_none() => {
                return Err(PeerError::InvalidState("offer was not created here"));
            }
            _ => {}
        }
        self.announce_candidates();
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        match desc.kind {
            SdpKind::Offer => {
                if self.pending_offer.is_some() {
                    return Err(PeerError::InvalidState("remote offer while an offer is pending"));
                }
                let offer = SdpOffer::from_sdp_string(&desc.sdp)
                    .map_err(|e| PeerError::Sdp(e.to_string()))?;
                let answer = self
                    .rtc
                    .lock()
                    .sdp_api()
                    .accept_offer(offer)
                    .map_err(|e| PeerError::Sdp(e.to_string()))?;
                self.prepared_answer = Some(answer);
            }
            SdpKind::Answer => {
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or(PeerError::InvalidState("answer without a pending offer"))?;
                let answer = SdpAnswer::from_sdp_string(&desc.sdp)
                    .map_err(|e| PeerError::Sdp(e.to_string()))?;
                self.rtc
                    .lock()
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(|e| PeerError::Sdp(e.to_string()))?;
            }
        }
        self.remote_set = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PeerError> {
        self.ensure_open()?;
        // Dropping the pending offer discards its changes in str0m.
        self.pending_offer
            .take()
            .map(drop)
            .ok_or(PeerError::InvalidState("no pending offer to roll back"))
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !self.remote_set {
            return Err(PeerError::InvalidState("remote description not set"));
        }
        let sdp = candidate.candidate.trim_start_matches("a=");
        let parsed = Candidate::from_sdp_string(sdp)
            .map_err(|e| PeerError::Candidate(format!("{e:?}")))?;
        self.rtc.lock().add_remote_candidate(parsed);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            self.rtc.lock().disconnect();
            let _ = close_tx.send(());
            debug!("Call {} peer connection closed", self.events.call());
        }
    }
}

/// Drives one `Rtc` until it dies or the connection is closed.
async fn drive(
    rtc: Arc<Mutex<Rtc>>,
    socket: UdpSocket,
    events: PeerEvents,
    mut close_rx: oneshot::Receiver<()>,
) {
    let mut buf = vec![0; 2000];

    loop {
        let Some(timeout) = poll_until_timeout(&rtc, &socket, &events) else {
            break;
        };

        // The sleep is not allowed to be 0. In case it is 0, we set 1 millisecond.
        let duration = timeout
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));

        tokio::select! {
            _ = &mut close_rx => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    let Ok(destination) = socket.local_addr() else {
                        break;
                    };
                    match buf[..n].try_into() {
                        Ok(contents) => {
                            let input = Input::Receive(
                                Instant::now(),
                                Receive {
                                    proto: Protocol::Udp,
                                    source,
                                    destination,
                                    contents,
                                },
                            );
                            handle_input(&rtc, input);
                        }
                        Err(_) => debug!("Ignoring unrecognized datagram from {}", source),
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ConnectionReset => {}
                    _ => {
                        warn!("UdpSocket read failed: {:?}", e);
                        break;
                    }
                },
            },
            _ = tokio::time::sleep(duration) => handle_input(&rtc, Input::Timeout(Instant::now())),
        }
    }

    rtc.lock().disconnect();
    events.emit(PeerEvent::IceStateChanged(IceConnectionState::Closed));
    debug!("Call {} driver stopped", events.call());
}

fn handle_input(rtc: &Mutex<Rtc>, input: Input) {
    let mut rtc = rtc.lock();
    if !rtc.is_alive() {
        return;
    }
    if let Err(e) = rtc.handle_input(input) {
        warn!("Peer connection failed: {:?}", e);
        rtc.disconnect();
    }
}

/// Poll all the output from the `Rtc` until it returns a timeout. Transmits
/// go out on the socket, events to the controller. `None` once the `Rtc` is dead.
fn poll_until_timeout(rtc: &Mutex<Rtc>, socket: &UdpSocket, events: &PeerEvents) -> Option<Instant> {
    let mut rtc = rtc.lock();

    loop {
        if !rtc.is_alive() {
            return None;
        }

        match rtc.poll_output() {
            Ok(Output::Timeout(t)) => return Some(t),
            Ok(Output::Transmit(transmit)) => {
                if let Err(e) = socket.try_send_to(&transmit.contents, transmit.destination) {
                    debug!("Dropping datagram to {}: {}", transmit.destination, e);
                }
            }
            Ok(Output::Event(event)) => {
                if let Some(event) = map_event(event) {
                    events.emit(event);
                }
            }
            Err(e) => {
                warn!("Peer connection poll_output failed: {:?}", e);
                rtc.disconnect();
                return None;
            }
        }
    }
}

fn map_event(event: Event) -> Option<PeerEvent> {
    match event {
        Event::IceConnectionStateChange(state) => {
            let state = match state {
                str0m::IceConnectionState::New => IceConnectionState::New,
                str0m::IceConnectionState::Checking => IceConnectionState::Checking,
                str0m::IceConnectionState::Connected => IceConnectionState::Connected,
                str0m::IceConnectionState::Completed => IceConnectionState::Completed,
                // str0m gives up on the candidate pairs here; treat it as a
                // failure so the call can attempt an ICE restart.
                str0m::IceConnectionState::Disconnected => IceConnectionState::Failed,
            };
            Some(PeerEvent::IceStateChanged(state))
        }
        Event::MediaAdded(added) => {
            let kind = match added.kind {
                MediaKind::Audio => TrackKind::Audio,
                MediaKind::Video => TrackKind::Video,
            };
            Some(PeerEvent::TrackAdded(RemoteTrack {
                mid: added.mid.to_string(),
                kind,
            }))
        }
        Event::Connected => {
            info!("Peer connection established");
            None
        }
        _ => None,
    }
}
