//! Consumer signaling protocol
//!
//! The viewer posts its SDP offer together with the stream identifier to the
//! signaling service and receives the SDP answer, optionally accompanied by
//! the server's ICE candidates.

use super::ViewerError;
use crate::config::SignalingConfig;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SDP type tag as used by browsers (`RTCSdpType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in its JSON wire form: `{"type": "...", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate in `RTCIceCandidateInit` form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

/// Candidates arrive either as init objects or as bare `candidate:` lines
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CandidatePayload {
    Init(IceCandidate),
    Line(String),
}

impl From<CandidatePayload> for IceCandidate {
    fn from(payload: CandidatePayload) -> Self {
        match payload {
            CandidatePayload::Init(candidate) => candidate,
            CandidatePayload::Line(candidate) => IceCandidate {
                candidate,
                sdp_mid: None,
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        }
    }
}

/// Body of `POST /consumer`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRequest {
    pub sdp: SessionDescription,
    pub stream_id: String,
}

/// Response of `POST /consumer`
///
/// Every field is optional on the wire; [`ConsumerResponse::into_answer`]
/// decides whether the payload is usable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerResponse {
    #[serde(default)]
    pub sdp: Option<SessionDescription>,
    #[serde(default)]
    pub candidates: Option<Vec<CandidatePayload>>,
}

/// A validated answer ready to apply to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAnswer {
    pub sdp: SessionDescription,
    pub candidates: Vec<IceCandidate>,
}

impl ConsumerResponse {
    /// Validate the payload, rejecting a missing, empty or non-answer SDP
    pub fn into_answer(self) -> Result<NegotiatedAnswer, ViewerError> {
        let sdp = self
            .sdp
            .ok_or_else(|| ViewerError::SignalingError("Consumer response is missing sdp".to_string()))?;

        if sdp.kind != SdpKind::Answer {
            return Err(ViewerError::SignalingError(format!(
                "Consumer response carried {:?} instead of an answer",
                sdp.kind
            )));
        }
        if sdp.sdp.trim().is_empty() {
            return Err(ViewerError::SignalingError("Consumer response has an empty sdp".to_string()));
        }

        let candidates = self
            .candidates
            .unwrap_or_default()
            .into_iter()
            .map(IceCandidate::from)
            .filter(|c| !c.candidate.is_empty())
            .collect();

        Ok(NegotiatedAnswer { sdp, candidates })
    }
}

/// Exchange of an offer for an answer with the signaling service
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn request_consumer(&self, request: &ConsumerRequest) -> Result<ConsumerResponse, ViewerError>;
}

/// `SignalingClient` speaking JSON over HTTP
pub struct HttpSignalingClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSignalingClient {
    pub fn new(config: &SignalingConfig) -> Result<Self, ViewerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ViewerError::SignalingError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.consumer_url(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SignalingClient for HttpSignalingClient {
    async fn request_consumer(&self, request: &ConsumerRequest) -> Result<ConsumerResponse, ViewerError> {
        debug!("Posting offer for stream {} to {}", request.stream_id, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| ViewerError::SignalingError(format!("POST {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(ViewerError::SignalingError(format!(
                "{} returned {}: {}",
                self.endpoint, status, body
            )));
        }

        response
            .json::<ConsumerResponse>()
            .await
            .map_err(|e| ViewerError::SignalingError(format!("Invalid consumer response: {}", e)))
    }
}
