//! Viewer connection supervision
//!
//! A [`ViewerConnectionManager`] owns one supervisor task. The supervisor is
//! the only place that touches the transport and the session state; it reacts
//! to user commands, transport events, negotiation results and its own timer.
//! Everything that arrives tagged with a generation other than the current
//! attempt's is dropped, which is what keeps a closed session closed.

use super::media_track::{MediaStream, PACKET_CHANNEL_CAPACITY};
use super::signaling::{ConsumerRequest, NegotiatedAnswer, SignalingClient};
use super::transport::{EventSink, Generation, Transport, TransportContext, TransportEvent, TransportFactory};
use super::ViewerError;
use crate::config::ViewerConfig;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No stream requested
    Idle,
    /// Transport created, offer/answer or ICE in progress
    Negotiating,
    /// ICE connected, media flowing
    Connected,
    /// Attempt failed, retry scheduled
    Reconnecting,
    /// Attempts exhausted
    Failed,
    /// Manager shut down
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// The user should see a connecting indicator
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Negotiating | ConnectionState::Reconnecting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Bounds on how long and how often a join cycle keeps trying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per join cycle, the first one included
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Fail an attempt that has not reached ICE connected in time
    pub connect_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &ViewerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ViewerConfig::default())
    }
}

/// Snapshot published to the presentation layer
#[derive(Debug, Clone)]
pub struct ViewerStatus {
    pub state: ConnectionState,
    pub stream_id: Option<String>,
    /// Generated per join, for log correlation
    pub session_id: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// The inbound stream, once the first remote track arrived
    pub media: Option<MediaStream>,
    pub last_error: Option<String>,
}

impl ViewerStatus {
    fn idle(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            stream_id: None,
            session_id: None,
            attempt_count: 0,
            max_attempts,
            media: None,
            last_error: None,
        }
    }
}

enum Command {
    Join { stream_id: String, reply: oneshot::Sender<()> },
    Leave { reply: oneshot::Sender<()> },
}

struct NegotiationOutcome {
    generation: Generation,
    result: Result<NegotiatedAnswer, ViewerError>,
}

/// Handle to one viewer session.
///
/// Dropping the handle tears the session down: the supervisor notices the
/// closed command channel, closes the transport and exits.
pub struct ViewerConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ViewerStatus>,
    supervisor: JoinHandle<()>,
}

impl ViewerConnectionManager {
    /// Spawn the supervisor. Must be called from within a tokio runtime.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingClient>,
        policy: RetryPolicy,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ViewerStatus::idle(policy.max_attempts));
        let (supervisor, events_rx, outcomes_rx) = Supervisor::new(factory, signaling, policy, status_tx);
        let supervisor = tokio::spawn(supervisor.run(commands_rx, events_rx, outcomes_rx));

        Self {
            commands,
            status,
            supervisor,
        }
    }

    /// Start viewing `stream_id`, replacing whatever session was active.
    ///
    /// Returns once the first attempt has been started; progress is visible
    /// through [`status`](Self::status) and [`subscribe`](Self::subscribe).
    pub async fn join(&self, stream_id: &str) -> Result<(), ViewerError> {
        let trimmed = stream_id.trim();
        if trimmed.is_empty() {
            return Err(ViewerError::InvalidStreamId(stream_id.to_string()));
        }

        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Join {
                stream_id: trimmed.to_string(),
                reply,
            })
            .map_err(|_| ViewerError::ManagerClosed)?;
        done.await.map_err(|_| ViewerError::ManagerClosed)
    }

    /// Stop viewing and release every resource. Idempotent.
    pub async fn leave(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Leave { reply }).is_ok() {
            let _ = done.await;
        }
    }

    pub fn status(&self) -> ViewerStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewerStatus> {
        self.status.clone()
    }

    /// Wait until the state satisfies `predicate`. Returns the last known
    /// status if the supervisor exits first.
    pub async fn wait_for_state(&self, mut predicate: impl FnMut(ConnectionState) -> bool) -> ViewerStatus {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| predicate(s.state)).await.map(|s| s.clone());
        match reached {
            Ok(status) => status,
            Err(_) => status.borrow().clone(),
        }
    }

    /// Tear the session down and wait for the supervisor to exit
    pub async fn shutdown(self) -> ViewerStatus {
        let Self {
            commands,
            status,
            supervisor,
        } = self;
        drop(commands);
        if let Err(e) = supervisor.await {
            warn!("Viewer supervisor ended abnormally: {}", e);
        }
        let last = status.borrow().clone();
        last
    }
}

/// Transport and bookkeeping of the attempt in flight
struct ActiveAttempt {
    generation: Generation,
    transport: Arc<dyn Transport>,
    negotiation: Option<JoinHandle<()>>,
    negotiation_started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Retry,
    ConnectTimeout,
}

struct Supervisor {
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingClient>,
    policy: RetryPolicy,
    status: watch::Sender<ViewerStatus>,
    events_tx: mpsc::UnboundedSender<(Generation, TransportEvent)>,
    outcomes_tx: mpsc::UnboundedSender<NegotiationOutcome>,
    next_generation: Generation,
    active: Option<ActiveAttempt>,
    state: ConnectionState,
    stream_id: Option<String>,
    session_id: Option<String>,
    attempt_count: u32,
    media: Option<MediaStream>,
    last_error: Option<String>,
    timer: Option<(Instant, TimerKind)>,
}

type EventReceiver = mpsc::UnboundedReceiver<(Generation, TransportEvent)>;
type OutcomeReceiver = mpsc::UnboundedReceiver<NegotiationOutcome>;

impl Supervisor {
    fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingClient>,
        policy: RetryPolicy,
        status: watch::Sender<ViewerStatus>,
    ) -> (Self, EventReceiver, OutcomeReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            factory,
            signaling,
            policy,
            status,
            events_tx,
            outcomes_tx,
            next_generation: 1,
            active: None,
            state: ConnectionState::Idle,
            stream_id: None,
            session_id: None,
            attempt_count: 0,
            media: None,
            last_error: None,
            timer: None,
        };
        (supervisor, events_rx, outcomes_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: EventReceiver,
        mut outcomes: OutcomeReceiver,
    ) {
        loop {
            let deadline = self.timer.map(|(at, _)| at);
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(outcome) = outcomes.recv() => self.handle_negotiation_outcome(outcome).await,
                Some((generation, event)) = events.recv() => self.handle_transport_event(generation, event).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_timer().await
                }
            }
        }

        self.reset().await;
        self.state = ConnectionState::Closed;
        self.publish();
        debug!("Viewer supervisor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { stream_id, reply } => {
                self.join(stream_id).await;
                let _ = reply.send(());
            }
            Command::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
        }
    }

    async fn join(&mut self, stream_id: String) {
        if let Some(previous) = &self.stream_id {
            info!("Replacing session for stream {} with stream {}", previous, stream_id);
        }
        self.reset().await;

        let session_id = uuid::Uuid::new_v4().to_string();
        info!("Session {} joining stream {}", session_id, stream_id);
        self.stream_id = Some(stream_id);
        self.session_id = Some(session_id);
        self.start_attempt().await;
    }

    async fn leave(&mut self) {
        let was_active = self.state != ConnectionState::Idle;
        let session_id = self.session_id.clone();
        self.reset().await;
        self.state = ConnectionState::Idle;
        self.publish();
        if was_active {
            info!("Session {} left", session_id.as_deref().unwrap_or("-"));
        }
    }

    /// Drop the transport and every piece of session state
    async fn reset(&mut self) {
        self.close_transport().await;
        self.timer = None;
        self.media = None;
        self.stream_id = None;
        self.session_id = None;
        self.attempt_count = 0;
        self.last_error = None;
    }

    async fn close_transport(&mut self) {
        if let Some(active) = self.active.take() {
            if let Some(negotiation) = active.negotiation {
                negotiation.abort();
            }
            if let Err(e) = active.transport.close().await {
                warn!("Closing transport of attempt {} failed: {}", active.generation, e);
            }
            debug!("Transport of attempt {} closed", active.generation);
        }
    }

    async fn start_attempt(&mut self) {
        // The previous transport is always gone before a new one is built
        self.close_transport().await;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.attempt_count += 1;
        self.state = ConnectionState::Negotiating;
        self.media = None;
        self.timer = None;
        self.publish();

        info!(
            "Session {} attempt {}/{} (generation {})",
            self.session_id.as_deref().unwrap_or("-"),
            self.attempt_count,
            self.policy.max_attempts,
            generation
        );

        let (packets, _) = broadcast::channel(PACKET_CHANNEL_CAPACITY);
        let ctx = TransportContext {
            events: EventSink::new(generation, self.events_tx.clone()),
            packets: packets.clone(),
        };

        match self.factory.open(ctx).await {
            Ok(transport) => {
                self.active = Some(ActiveAttempt {
                    generation,
                    transport,
                    negotiation: None,
                    negotiation_started: false,
                });
                // The stream exists for the whole attempt; tracks join it as they arrive
                self.media = Some(MediaStream::new(uuid::Uuid::new_v4().to_string(), packets));
                if let Some(timeout) = self.policy.connect_timeout {
                    self.timer = Some((Instant::now() + timeout, TimerKind::ConnectTimeout));
                }
                self.publish();
            }
            Err(e) => self.fail_attempt(e).await,
        }
    }

    fn start_negotiation(&mut self) {
        let Some(stream_id) = self.stream_id.clone() else {
            return;
        };
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.negotiation_started {
            debug!("Attempt {} already negotiating; ignoring negotiation-needed", active.generation);
            return;
        }
        active.negotiation_started = true;

        let generation = active.generation;
        let transport = active.transport.clone();
        let signaling = self.signaling.clone();
        let outcomes = self.outcomes_tx.clone();
        active.negotiation = Some(tokio::spawn(async move {
            let result = negotiate(transport.as_ref(), signaling.as_ref(), stream_id).await;
            let _ = outcomes.send(NegotiationOutcome { generation, result });
        }));
    }

    async fn handle_negotiation_outcome(&mut self, outcome: NegotiationOutcome) {
        let transport = match self.active.as_mut() {
            Some(active) if active.generation == outcome.generation => {
                active.negotiation = None;
                active.transport.clone()
            }
            _ => {
                debug!("Dropping negotiation result of stale attempt {}", outcome.generation);
                return;
            }
        };

        let answer = match outcome.result {
            Ok(answer) => answer,
            Err(e) => return self.fail_attempt(e).await,
        };

        if let Err(e) = transport.apply_answer(&answer.sdp).await {
            return self.fail_attempt(e).await;
        }
        for candidate in &answer.candidates {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Skipping remote candidate {:?}: {}", candidate.candidate, e);
            }
        }
        debug!(
            "Attempt {} applied answer with {} remote candidates",
            outcome.generation,
            answer.candidates.len()
        );
    }

    async fn handle_transport_event(&mut self, generation: Generation, event: TransportEvent) {
        if !self.active.as_ref().is_some_and(|active| active.generation == generation) {
            debug!("Ignoring {:?} from stale attempt {}", event, generation);
            return;
        }

        match event {
            TransportEvent::NegotiationNeeded => self.start_negotiation(),
            TransportEvent::TrackAdded(track) => {
                let attached = match self.media.as_mut() {
                    Some(media) => media.attach(track),
                    None => false,
                };
                if attached {
                    self.publish();
                }
            }
            TransportEvent::IceStateChanged(ice) if ice.is_up() => {
                if self.state != ConnectionState::Connected {
                    info!(
                        "Session {} connected to stream {}",
                        self.session_id.as_deref().unwrap_or("-"),
                        self.stream_id.as_deref().unwrap_or("-")
                    );
                }
                self.state = ConnectionState::Connected;
                self.attempt_count = 0;
                self.last_error = None;
                self.timer = None;
                self.publish();
            }
            TransportEvent::IceStateChanged(ice) if ice.is_down() => {
                if matches!(self.state, ConnectionState::Negotiating | ConnectionState::Connected) {
                    self.fail_attempt(ViewerError::IceError(format!("ICE connection {:?}", ice)))
                        .await;
                }
            }
            TransportEvent::IceStateChanged(ice) => {
                debug!("Attempt {} ICE state {:?}", generation, ice);
            }
        }
    }

    async fn handle_timer(&mut self) {
        let Some((_, kind)) = self.timer.take() else {
            return;
        };
        match kind {
            TimerKind::Retry => {
                if self.state == ConnectionState::Reconnecting {
                    self.start_attempt().await;
                }
            }
            TimerKind::ConnectTimeout => {
                if self.state == ConnectionState::Negotiating {
                    let timeout = self.policy.connect_timeout.unwrap_or_default();
                    self.fail_attempt(ViewerError::IceError(format!("Not connected within {:?}", timeout)))
                        .await;
                }
            }
        }
    }

    /// Release the failed attempt, then schedule a retry or give up
    async fn fail_attempt(&mut self, err: ViewerError) {
        let session_id = self.session_id.clone().unwrap_or_else(|| "-".to_string());
        warn!(
            "Session {} attempt {}/{} failed: {}",
            session_id, self.attempt_count, self.policy.max_attempts, err
        );

        self.close_transport().await;
        self.media = None;

        if err.is_retryable() && self.attempt_count < self.policy.max_attempts {
            self.state = ConnectionState::Reconnecting;
            self.last_error = Some(err.to_string());
            self.timer = Some((Instant::now() + self.policy.retry_delay, TimerKind::Retry));
        } else {
            let exhausted = ViewerError::RetriesExhausted {
                attempts: self.attempt_count,
                last: err.to_string(),
            };
            error!(
                "Session {} stream {}: {}",
                session_id,
                self.stream_id.as_deref().unwrap_or("-"),
                exhausted
            );
            self.state = ConnectionState::Failed;
            self.last_error = Some(exhausted.to_string());
            self.timer = None;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(ViewerStatus {
            state: self.state,
            stream_id: self.stream_id.clone(),
            session_id: self.session_id.clone(),
            attempt_count: self.attempt_count,
            max_attempts: self.policy.max_attempts,
            media: self.media.clone(),
            last_error: self.last_error.clone(),
        });
    }
}

/// Offer, exchange, validate. Runs off the supervisor so it never blocks it.
async fn negotiate(
    transport: &dyn Transport,
    signaling: &dyn SignalingClient,
    stream_id: String,
) -> Result<NegotiatedAnswer, ViewerError> {
    let offer = transport.create_offer().await?;
    let request = ConsumerRequest { sdp: offer, stream_id };
    signaling.request_consumer(&request).await?.into_answer()
}
