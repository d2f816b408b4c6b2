//! Terminal stand-ins for the capture devices and the video elements.

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{CallError, MediaAccessError};
use crate::model::media::{MediaConstraints, MediaStream, MediaTrack, RemoteTrack, TrackKind};
use crate::peer::capability::{CallView, MediaSource};

/// Hands out microphone and camera tracks as allowed by configuration.
#[derive(Debug, Clone)]
pub struct DeviceMedia {
    audio: bool,
    video: bool,
    acquired: u64,
}

impl DeviceMedia {
    pub fn new(available: MediaConstraints) -> DeviceMedia {
        DeviceMedia {
            audio: available.audio,
            video: available.video,
            acquired: 0,
        }
    }
}

#[async_trait]
impl MediaSource for DeviceMedia {
    async fn acquire(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        let mut tracks = vec![];
        if constraints.audio && self.audio {
            tracks.push(MediaTrack::new(format!("mic-{}", self.acquired), TrackKind::Audio));
        }
        if constraints.video && self.video {
            tracks.push(MediaTrack::new(format!("cam-{}", self.acquired), TrackKind::Video));
        }
        if tracks.is_empty() {
            return Err(MediaAccessError::NoDevice);
        }

        self.acquired += 1;
        Ok(MediaStream::new(format!("local-{}", self.acquired), tracks))
    }
}

/// Logs what a browser page would render.
#[derive(Debug, Clone, Default)]
pub struct TerminalView {
    session_id: Option<String>,
}

impl TerminalView {
    pub fn new(session_id: Option<String>) -> TerminalView {
        TerminalView { session_id }
    }
}

impl CallView for TerminalView {
    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn attach_local(&mut self, stream: &MediaStream) {
        info!(
            "Local preview: stream {} ({} tracks)",
            stream.id,
            stream.tracks.len()
        );
    }

    fn attach_remote(&mut self, track: &RemoteTrack) {
        info!("Remote {:?} track attached (mid {})", track.kind, track.mid);
    }

    fn clear(&mut self) {
        info!("Local and remote video cleared");
    }

    fn show_error(&mut self, error: &CallError) {
        error!("{}", error);
        eprintln!("call error: {error}");
    }
}
