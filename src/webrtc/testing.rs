//! In-memory transport and signaling doubles

use super::signaling::{
    CandidatePayload, ConsumerRequest, ConsumerResponse, IceCandidate, SessionDescription, SignalingClient,
};
use super::transport::{
    EventSink, Generation, IceState, InboundTrack, MediaKind, Transport, TransportContext, TransportEvent,
    TransportFactory,
};
use super::ViewerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

pub(crate) struct MockTransport {
    sink: EventSink,
    open: AtomicBool,
    open_count: Arc<AtomicUsize>,
    answers: AtomicUsize,
    candidates: AtomicUsize,
}

impl MockTransport {
    pub fn generation(&self) -> Generation {
        self.sink.generation()
    }

    pub fn emit(&self, event: TransportEvent) {
        self.sink.emit(event);
    }

    pub fn ice(&self, state: IceState) {
        self.emit(TransportEvent::IceStateChanged(state));
    }

    pub fn track(&self, kind: MediaKind) {
        self.emit(TransportEvent::TrackAdded(InboundTrack {
            id: format!("{}-{}", kind.as_str(), self.generation()),
            stream_id: "mock-stream".to_string(),
            kind,
            ssrc: 1000 + self.generation() as u32,
            codec: match kind {
                MediaKind::Audio => "audio/opus".to_string(),
                MediaKind::Video => "video/VP8".to_string(),
            },
        }));
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn answers_applied(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn candidates_added(&self) -> usize {
        self.candidates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, ViewerError> {
        Ok(SessionDescription::offer(format!("v=0 mock offer {}", self.generation())))
    }

    async fn apply_answer(&self, _answer: &SessionDescription) -> Result<(), ViewerError> {
        if !self.is_open() {
            return Err(ViewerError::ConnectionFailed("transport closed".to_string()));
        }
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), ViewerError> {
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), ViewerError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.open_count.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub(crate) struct MockTransportFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    open_count: Arc<AtomicUsize>,
    max_open: AtomicUsize,
    calls: AtomicUsize,
    opened: watch::Sender<usize>,
    fail_open: bool,
}

impl MockTransportFactory {
    fn build(fail_open: bool) -> Arc<Self> {
        let (opened, _) = watch::channel(0);
        Arc::new(Self {
            transports: Mutex::new(Vec::new()),
            open_count: Arc::new(AtomicUsize::new(0)),
            max_open: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            opened,
            fail_open,
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// Every `open` call errors
    pub fn failing() -> Arc<Self> {
        Self::build(true)
    }

    /// Wait until the n-th transport (1-based) exists and return it
    pub async fn wait_for_transport(&self, n: usize) -> Arc<MockTransport> {
        let mut opened = self.opened.subscribe();
        opened
            .wait_for(|count| *count >= n)
            .await
            .expect("factory dropped");
        self.transport(n)
    }

    pub fn transport(&self, n: usize) -> Arc<MockTransport> {
        self.transports.lock()[n - 1].clone()
    }

    /// Transports successfully created so far
    pub fn opened(&self) -> usize {
        self.transports.lock().len()
    }

    /// Calls to `open`, failed ones included
    pub fn open_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Transports currently open
    pub fn open_now(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open transports
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(&self, ctx: TransportContext) -> Result<Arc<dyn Transport>, ViewerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(ViewerError::ConnectionFailed("mock open failure".to_string()));
        }

        let now_open = self.open_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);

        let transport = Arc::new(MockTransport {
            sink: ctx.events,
            open: AtomicBool::new(true),
            open_count: self.open_count.clone(),
            answers: AtomicUsize::new(0),
            candidates: AtomicUsize::new(0),
        });
        transport.emit(TransportEvent::NegotiationNeeded);

        let count = {
            let mut transports = self.transports.lock();
            transports.push(transport.clone());
            transports.len()
        };
        self.opened.send_replace(count);

        Ok(transport)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Answer,
    MissingSdp,
    HttpError,
}

pub(crate) struct MockSignaling {
    reply: Reply,
    gated: bool,
    gate: Notify,
    requests: watch::Sender<usize>,
    last_stream_id: Mutex<Option<String>>,
}

impl MockSignaling {
    fn build(reply: Reply, gated: bool) -> Arc<Self> {
        let (requests, _) = watch::channel(0);
        Arc::new(Self {
            reply,
            gated,
            gate: Notify::new(),
            requests,
            last_stream_id: Mutex::new(None),
        })
    }

    pub fn answering() -> Arc<Self> {
        Self::build(Reply::Answer, false)
    }

    pub fn missing_sdp() -> Arc<Self> {
        Self::build(Reply::MissingSdp, false)
    }

    pub fn http_error() -> Arc<Self> {
        Self::build(Reply::HttpError, false)
    }

    /// Answers are held back until `release` is called
    pub fn gated() -> Arc<Self> {
        Self::build(Reply::Answer, true)
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub async fn wait_for_requests(&self, n: usize) {
        let mut requests = self.requests.subscribe();
        requests
            .wait_for(|count| *count >= n)
            .await
            .expect("signaling dropped");
    }

    pub fn last_stream_id(&self) -> Option<String> {
        self.last_stream_id.lock().clone()
    }
}

#[async_trait]
impl SignalingClient for MockSignaling {
    async fn request_consumer(&self, request: &ConsumerRequest) -> Result<ConsumerResponse, ViewerError> {
        *self.last_stream_id.lock() = Some(request.stream_id.clone());
        self.requests.send_modify(|count| *count += 1);

        if self.gated {
            self.gate.notified().await;
        }

        match self.reply {
            Reply::Answer => Ok(ConsumerResponse {
                sdp: Some(SessionDescription::answer("v=0 mock answer")),
                candidates: Some(vec![CandidatePayload::Line(
                    "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
                )]),
            }),
            Reply::MissingSdp => Ok(ConsumerResponse::default()),
            Reply::HttpError => Err(ViewerError::SignalingError("POST /consumer returned 502".to_string())),
        }
    }
}
