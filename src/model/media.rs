//! Local and remote media handles
//!
//! Capture and rendering happen outside this crate. These types only carry
//! identity and the live/stopped state the call controller needs to manage.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// The kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What to capture when starting a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A captured local track. Clones share the same live flag.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> MediaTrack {
        MediaTrack {
            id: id.into(),
            kind,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stops capture. Stopping twice is harmless.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// A group of local tracks acquired together.
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> MediaStream {
        MediaStream {
            id: id.into(),
            tracks,
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }
}

/// A track announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Media line identifier the track arrived on.
    pub mid: String,
    pub kind: TrackKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_live_state() {
        let track = MediaTrack::new("cam", TrackKind::Video);
        let observer = track.clone();
        let stream = MediaStream::new("local", vec![track]);

        assert!(stream.is_live());
        stream.stop();
        stream.stop();
        assert!(!observer.is_live());
        assert!(!stream.is_live());
    }
}
