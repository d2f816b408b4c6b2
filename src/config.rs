//! Command line and environment configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::model::media::MediaConstraints;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const SIGNALING_SERVER_URL: &str = "ws://127.0.0.1:8080";

#[derive(Debug, Parser)]
#[command(name = "rover-signal", version, about = "Two-party WebRTC signaling relay and call client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the signaling relay
    Server(RelayConfig),
    /// Start an interactive call peer
    Peer(PeerConfig),
}

#[derive(Debug, Clone, Args)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to
    #[arg(long, env = "ROVER_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Maximum number of endpoints per session
    #[arg(long, env = "ROVER_MAX_MEMBERS", default_value_t = 2)]
    pub max_members: usize,

    /// Frames queued per endpoint before new ones are dropped
    #[arg(long, default_value_t = 256)]
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8080).into(),
            max_members: 2,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct PeerConfig {
    /// WebSocket URL of the signaling relay
    #[arg(long, env = "ROVER_SERVER_URL", default_value = SIGNALING_SERVER_URL)]
    pub server_url: String,

    /// Session to join on every connect
    #[arg(long, env = "ROVER_SESSION")]
    pub session_id: Option<String>,

    /// Fixed delay between reconnect attempts, in milliseconds
    #[arg(long, env = "ROVER_RECONNECT_MS", default_value_t = 3000)]
    pub reconnect_delay_ms: u64,

    /// ICE restarts attempted before a call is given up
    #[arg(long, default_value_t = 3)]
    pub max_ice_restarts: u32,

    /// Remote candidates held while no remote description is set
    #[arg(long, default_value_t = 64)]
    pub candidate_buffer: usize,

    /// Outbound messages held while the relay is unreachable
    #[arg(long, default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Do not capture audio
    #[arg(long)]
    pub no_audio: bool,

    /// Do not capture video
    #[arg(long)]
    pub no_video: bool,
}

impl PeerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: !self.no_audio,
            video: !self.no_video,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            server_url: SIGNALING_SERVER_URL.to_string(),
            session_id: None,
            reconnect_delay_ms: 3000,
            max_ice_restarts: 3,
            candidate_buffer: 64,
            outbound_buffer: 64,
            no_audio: false,
            no_video: false,
        }
    }
}
