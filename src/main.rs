//! livecook-viewer - Main entry point
//!
//! Watch a live stream from the command line, browse the stream catalog or
//! run the HTTP control surface.

mod args;

use anyhow::{bail, Context};
use args::{Args, Command};
use clap::Parser;
use livecook_viewer::catalog::{StreamCatalog, StreamInfo};
use livecook_viewer::config::Config;
use livecook_viewer::web::run_http_server;
use livecook_viewer::webrtc::{
    ConnectionState, HttpSignalingClient, MediaKind, MediaPacket, MediaStream, PeerConnectionFactory, RetryPolicy,
    ViewerConnectionManager,
};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const PACKET_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = args.load_config()?;

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("LIVECOOK_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("livecook-viewer v{}", env!("CARGO_PKG_VERSION"));

    match &args.command {
        Command::Join { stream_id } => watch_stream(&config, stream_id).await,
        Command::Streams => list_streams(&config).await,
        Command::Show { stream_id } => show_stream(&config, stream_id).await,
        Command::Serve { .. } => serve(&config).await,
    }
}

/// Packet subscription that follows the session's current stream
#[derive(Default)]
struct StreamTap {
    stream_id: Option<String>,
    track_count: usize,
    packets: Option<broadcast::Receiver<MediaPacket>>,
}

impl StreamTap {
    /// Resubscribe when the stream id changes; status updates may be coalesced
    /// so a new attempt's stream can appear without an intervening `None`.
    fn follow(&mut self, media: Option<&MediaStream>) {
        let Some(media) = media else {
            *self = Self::default();
            return;
        };
        if self.stream_id.as_deref() != Some(media.id()) {
            info!("Attached to stream {}", media.id());
            self.packets = Some(media.subscribe());
            self.stream_id = Some(media.id().to_string());
            self.track_count = 0;
        }
        if media.tracks().len() != self.track_count {
            self.track_count = media.tracks().len();
            let kinds: Vec<_> = media.tracks().iter().map(|t| t.kind.as_str()).collect();
            info!("Stream {} tracks: {}", media.id(), kinds.join(", "));
        }
    }
}

fn build_manager(config: &Config) -> anyhow::Result<ViewerConnectionManager> {
    let signaling = HttpSignalingClient::new(&config.signaling).context("Failed to create signaling client")?;
    info!("Signaling endpoint: {}", signaling.endpoint());

    let factory = PeerConnectionFactory::new(config.viewer.clone());
    Ok(ViewerConnectionManager::new(
        Arc::new(factory),
        Arc::new(signaling),
        RetryPolicy::from_config(&config.viewer),
    ))
}

async fn watch_stream(config: &Config, stream_id: &str) -> anyhow::Result<()> {
    let manager = build_manager(config)?;
    let mut status = manager.subscribe();
    manager.join(stream_id).await?;

    let mut report = tokio::time::interval(PACKET_REPORT_INTERVAL);
    report.tick().await;
    let mut tap = StreamTap::default();
    let mut video_packets: u64 = 0;
    let mut audio_packets: u64 = 0;
    let mut last_state = None;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown signal received");
                manager.leave().await;
                break Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let current = status.borrow_and_update().clone();
                if last_state != Some(current.state) {
                    match &current.last_error {
                        Some(err) if current.state == ConnectionState::Reconnecting => {
                            warn!("State: {} (attempt {}/{}): {}",
                                current.state.as_str(), current.attempt_count, current.max_attempts, err);
                        }
                        _ => info!("State: {}", current.state.as_str()),
                    }
                    last_state = Some(current.state);
                }
                tap.follow(current.media.as_ref());
                if current.state == ConnectionState::Failed {
                    let reason = current.last_error.unwrap_or_else(|| "unknown error".to_string());
                    error!("Giving up on stream {}: {}", stream_id, reason);
                    break Err(reason);
                }
            }
            packet = async {
                match tap.packets.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match packet {
                Ok(packet) => match packet.kind {
                    MediaKind::Video => video_packets += 1,
                    MediaKind::Audio => audio_packets += 1,
                },
                Err(RecvError::Lagged(skipped)) => warn!("Packet reader lagged, skipped {}", skipped),
                Err(RecvError::Closed) => tap.packets = None,
            },
            _ = report.tick() => {
                if manager.state() == ConnectionState::Connected {
                    info!("Received {} video / {} audio packets", video_packets, audio_packets);
                }
            }
        }
    };

    let last = manager.shutdown().await;
    info!("Session ended in state {}", last.state.as_str());
    match outcome {
        Ok(()) => Ok(()),
        Err(reason) => bail!("Could not view stream {}: {}", stream_id, reason),
    }
}

fn print_stream(stream: &StreamInfo) {
    let user = stream.username.as_deref().unwrap_or("unknown");
    let mut line = format!("{:<28} {:<32} by {}", stream.stream_id, stream.title, user);
    if let Some(started) = stream.started_at {
        line.push_str(&format!("  started {}", started.format("%Y-%m-%d %H:%M")));
    }
    if let Some(minutes) = stream.duration_minutes() {
        line.push_str(&format!("  {} min", minutes));
    }
    line.push_str(&format!("  {} likes  {} comments", stream.likes.len(), stream.comments.len()));
    println!("{}", line);
}

async fn list_streams(config: &Config) -> anyhow::Result<()> {
    let catalog = StreamCatalog::new(&config.catalog)?;
    let (live, ended) = tokio::try_join!(catalog.live_streams(), catalog.ended_streams())?;

    println!("Live ({})", live.len());
    live.iter().for_each(print_stream);
    println!();
    println!("Ended ({})", ended.len());
    ended.iter().for_each(print_stream);
    Ok(())
}

async fn show_stream(config: &Config, stream_id: &str) -> anyhow::Result<()> {
    let catalog = StreamCatalog::new(&config.catalog)?;
    let stream = catalog.stream(stream_id).await?;

    print_stream(&stream);
    if let Some(description) = &stream.description {
        println!();
        println!("{}", description);
    }
    if let (Some(started), Some(ended)) = (stream.started_at, stream.ended_at) {
        println!("{} - {}", started.format("%B %d, %Y at %H:%M"), ended.format("%H:%M"));
    }
    if !stream.comments.is_empty() {
        println!();
        for comment in &stream.comments {
            println!(
                "  {}: {}",
                comment.username.as_deref().unwrap_or("anonymous"),
                comment.text.as_deref().unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    let manager = Arc::new(build_manager(config)?);

    tokio::select! {
        result = run_http_server(&config.http, manager.clone()) => {
            if let Err(e) = &result {
                error!("HTTP server error: {}", e);
            }
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    manager.leave().await;
    Ok(())
}
