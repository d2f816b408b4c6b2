//! Negotiation client
//!
//! A [`controller::CallController`] drives one call at a time over a
//! [`channel::SignalingChannel`], talking to the platform WebRTC stack through
//! the traits in [`capability`]. [`run`] wires everything to the str0m backend
//! and a line based terminal UI.

pub mod capability;
pub mod channel;
pub mod controller;
pub mod devices;
pub mod rtc_backend;

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::PeerConfig;
use crate::peer::channel::SignalingChannel;
use crate::peer::controller::{CallController, CallHandle, ControllerConfig};
use crate::peer::devices::{DeviceMedia, TerminalView};
use crate::peer::rtc_backend::Str0mConnector;
use crate::util::select_host_address;

const CHANNEL_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs an interactive peer until `quit`, end of input or Ctrl-C.
pub async fn run(config: PeerConfig) -> Result<()> {
    let host = select_host_address()?;
    info!("Using host address {} for ICE", host);

    let (handle, commands) = CallHandle::channel();
    let (channel, signaling) = SignalingChannel::new(&config, handle.sender());
    let channel_task = tokio::spawn(channel.run());

    let controller = CallController::new(
        ControllerConfig::from(&config),
        &handle,
        Box::new(Str0mConnector::new(host)),
        Box::new(DeviceMedia::new(config.constraints())),
        Box::new(TerminalView::new(config.session_id.clone())),
        signaling,
    );

    tokio::spawn(read_commands(handle.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            handle.shutdown();
        }
    });

    println!("Commands: start | end | quit");
    controller.run(commands).await;

    // The controller owned the last sender; the channel closes its socket.
    if tokio::time::timeout(CHANNEL_CLOSE_TIMEOUT, channel_task)
        .await
        .is_err()
    {
        warn!("Signaling channel did not close in time");
    }
    info!("Peer stopped");
    Ok(())
}

async fn read_commands(handle: CallHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Could not read stdin: {}", e);
                break;
            }
        };

        let accepted = match line.trim() {
            "" => true,
            "start" => handle.start_call(),
            "end" => handle.end_call(),
            "quit" | "exit" => break,
            other => {
                println!("Unknown command '{other}', expected start | end | quit");
                true
            }
        };
        if !accepted {
            return;
        }
    }

    handle.shutdown();
}
