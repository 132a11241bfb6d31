//! WebRTC PeerConnection management
//!
//! Builds receive-only `RTCPeerConnection` instances and adapts them to the
//! [`Transport`] seam used by the connection supervisor.

use super::media_track::spawn_track_reader;
use super::signaling::{IceCandidate, SessionDescription};
use super::transport::{
    InboundTrack, MediaKind, Transport, TransportContext, TransportEvent, TransportFactory,
};
use super::ViewerError;
use crate::config::ViewerConfig;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

/// Creates one receive-only peer connection per connection attempt
pub struct PeerConnectionFactory {
    config: ViewerConfig,
}

impl PeerConnectionFactory {
    pub fn new(config: ViewerConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the configured ICE servers
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, ViewerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ViewerError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        // Interceptors provide NACK/RTCP reports for the inbound streams
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| ViewerError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| ViewerError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    async fn add_recvonly_transceiver(
        peer_connection: &Arc<RTCPeerConnection>,
        kind: RTPCodecType,
    ) -> Result<(), ViewerError> {
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: Vec::new(),
        };
        peer_connection
            .add_transceiver_from_kind(kind, Some(init))
            .await
            .map_err(|e| ViewerError::MediaError(format!("Failed to add {:?} transceiver: {}", kind, e)))?;
        Ok(())
    }
}

#[async_trait]
impl TransportFactory for PeerConnectionFactory {
    async fn open(&self, ctx: TransportContext) -> Result<Arc<dyn Transport>, ViewerError> {
        let peer_connection = self.create_peer_connection().await?;
        let transport = Arc::new(WebRtcTransport {
            peer_connection: peer_connection.clone(),
            readers: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
            wait_for_ice_gathering: self.config.wait_for_ice_gathering,
            ice_gathering_timeout: Duration::from_millis(self.config.ice_gathering_timeout_ms),
        });

        // Handlers go on before any transceiver exists so no event is missed
        let events = ctx.events.clone();
        transport.register_handlers(ctx);

        let opened = async {
            Self::add_recvonly_transceiver(&peer_connection, RTPCodecType::Video).await?;
            if self.config.receive_audio {
                Self::add_recvonly_transceiver(&peer_connection, RTPCodecType::Audio).await?;
            }
            Ok::<(), ViewerError>(())
        };
        if let Err(e) = opened.await {
            let _ = transport.close().await;
            return Err(e);
        }

        // The callback fires asynchronously and may be coalesced; the
        // supervisor ignores repeats for the same attempt.
        events.emit(TransportEvent::NegotiationNeeded);

        Ok(transport)
    }
}

/// A receive-only peer connection and its track readers
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    readers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    closed: AtomicBool,
    wait_for_ice_gathering: bool,
    ice_gathering_timeout: Duration,
}

impl WebRtcTransport {
    fn register_handlers(&self, ctx: TransportContext) {
        let TransportContext { events, packets } = ctx;
        let generation = events.generation();

        let track_events = events.clone();
        let readers = self.readers.clone();
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let readers = readers.clone();
                let packets = packets.clone();
                Box::pin(async move {
                    let kind = match MediaKind::try_from(track.kind()) {
                        Ok(kind) => kind,
                        Err(e) => {
                            warn!("Ignoring inbound track: {}", e);
                            return;
                        }
                    };
                    let info = InboundTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        ssrc: track.ssrc(),
                        codec: track.codec().capability.mime_type,
                    };
                    info!("Attempt {} received {} track {} ({})", generation, kind.as_str(), info.id, info.codec);
                    readers.lock().push(spawn_track_reader(track, info.clone(), packets));
                    events.emit(TransportEvent::TrackAdded(info));
                })
            },
        ));

        let ice_events = events.clone();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let events = ice_events.clone();
                Box::pin(async move {
                    debug!("Attempt {} ICE state: {}", generation, state);
                    events.emit(TransportEvent::IceStateChanged(state.into()));
                })
            }));

        let negotiation_events = events;
        self.peer_connection.on_negotiation_needed(Box::new(move || {
            let events = negotiation_events.clone();
            Box::pin(async move {
                events.emit(TransportEvent::NegotiationNeeded);
            })
        }));

        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                Box::pin(async move {
                    debug!("Attempt {} connection state: {}", generation, state);
                })
            }));
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, ViewerError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| ViewerError::SdpError(format!("Failed to create offer: {}", e)))?;

        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| ViewerError::SdpError(format!("Failed to set local description: {}", e)))?;

        // The consumer endpoint takes no trickled candidates, so the offer
        // should carry them.
        if self.wait_for_ice_gathering {
            if tokio::time::timeout(self.ice_gathering_timeout, gather_complete.recv())
                .await
                .is_err()
            {
                warn!(
                    "ICE gathering did not finish within {:?}; sending partial offer",
                    self.ice_gathering_timeout
                );
            }
        }

        let sdp = match self.peer_connection.local_description().await {
            Some(local) => local.sdp,
            None => offer.sdp,
        };
        Ok(SessionDescription::offer(sdp))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), ViewerError> {
        let answer = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| ViewerError::SdpError(format!("Invalid SDP answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| ViewerError::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), ViewerError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| ViewerError::IceError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), ViewerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }

        self.peer_connection
            .close()
            .await
            .map_err(|e| ViewerError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}
