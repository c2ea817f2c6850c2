//! Connection lifecycle for one Direct Line conversation.
//!
//! [`ConnectionController`] is a cheap, cloneable handle. Every mutation is
//! sent as a [`Command`] to a single background task that owns the session,
//! the transport and all timers. Transport events and timer expiries come back
//! to that task as [`Internal`] messages; those bound to a transport carry its
//! generation and are dropped once the transport has been replaced.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, trace, warn};
use wcs_core::{
    Activity, ActivityType, Attachment, ChannelAccount, ConnectionStatus, Credential,
    ErrorDiagnosis, HealthMetrics, PersistedSession, ResumeParams, Session, SessionError,
    SessionEvent, SessionOptions, SessionStatus, TransportError, Troubleshooting,
    ValidationError, classify, validate_secret,
};
use wcs_telemetry::{
    SessionLabels, record_counter, record_gauge, span_for_activity, span_for_session,
};

use crate::dispatcher::{ActivityDispatcher, TypingAction};
use crate::health::{HEALTH_SAMPLE_INTERVAL, HealthMonitor};
use crate::network::{LatencySignals, NetworkSignals};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::send_queue::{SendQueue, SendReceipt};
use crate::sink::SharedEventSink;
use crate::store::SharedSessionStore;
use crate::token::{DEFAULT_REFRESH_INTERVAL, TokenRefresher, TransportTokenSource};
use crate::transport::{
    SharedTransport, SharedTransportProvider, TransportEvent, TransportParams,
};

/// Delay between reaching `Online` and posting the greeting activity.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const GREETING_EVENT_NAME: &str = "webchat/join";
const COMMAND_BUFFER: usize = 64;

/// Assembles a [`ConnectionController`]. Only the provider and the event sink
/// are required.
pub struct ControllerBuilder {
    provider: SharedTransportProvider,
    events: SharedEventSink,
    retry_policy: RetryPolicy,
    refresh_interval: Duration,
    settle_delay: Duration,
    health_interval: Duration,
    network_signals: Option<Arc<dyn NetworkSignals>>,
    store: Option<SharedSessionStore>,
    send_queue: SendQueue,
}

impl ControllerBuilder {
    pub fn new(provider: SharedTransportProvider, events: SharedEventSink) -> Self {
        Self {
            provider,
            events,
            retry_policy: RetryPolicy::default(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            health_interval: HEALTH_SAMPLE_INTERVAL,
            network_signals: None,
            store: None,
            send_queue: SendQueue::default(),
        }
    }

    /// `max_attempts` is always taken from `SessionOptions::max_retries`.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn network_signals(mut self, signals: Arc<dyn NetworkSignals>) -> Self {
        self.network_signals = Some(signals);
        self
    }

    pub fn store(mut self, store: SharedSessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn send_queue(mut self, queue: SendQueue) -> Self {
        self.send_queue = queue;
        self
    }

    /// Spawns the controller task. Must be called within a Tokio runtime.
    pub fn build(self) -> ConnectionController {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Uninitialized);
        let latency = Arc::new(LatencySignals::new());

        let actor = Actor {
            provider: Arc::clone(&self.provider),
            events: Arc::clone(&self.events),
            store: self.store.clone(),
            internal: internal_tx,
            status_tx,
            status: SessionStatus::Uninitialized,
            retry_policy: self.retry_policy,
            retry: RetryState::new(self.retry_policy),
            refresh_interval: self.refresh_interval,
            settle_delay: self.settle_delay,
            health_interval: self.health_interval,
            health: HealthMonitor::new(Arc::clone(&latency), self.network_signals),
            latency: Arc::clone(&latency),
            send_queue: self.send_queue,
            session: None,
            options: SessionOptions::default(),
            base_options: None,
            dispatcher: ActivityDispatcher::new(String::new(), false),
            transport: None,
            pump: None,
            generation: 0,
            greeted: false,
            caller_ended: false,
            failed_emitted: false,
            last_error: None,
            timers: Timers::default(),
            typing_seq: 0,
            idle_seq: 0,
            refresher: None,
            refresh_in_flight: false,
        };
        tokio::spawn(
            actor
                .run(command_rx, internal_rx)
                .instrument(span_for_session("controller", None)),
        );

        ConnectionController {
            commands,
            status: status_rx,
            latency,
            send_queue: self.send_queue,
            events: self.events,
            store: self.store,
            transport_name: self.provider.name().to_string(),
        }
    }
}

/// Handle to a running connection controller.
#[derive(Clone)]
pub struct ConnectionController {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    latency: Arc<LatencySignals>,
    send_queue: SendQueue,
    events: SharedEventSink,
    store: Option<SharedSessionStore>,
    transport_name: String,
}

impl ConnectionController {
    pub fn builder(provider: SharedTransportProvider, events: SharedEventSink) -> ControllerBuilder {
        ControllerBuilder::new(provider, events)
    }

    /// Validates `credential` before anything else happens, then replaces any
    /// existing session and starts connecting.
    pub async fn initialize(
        &self,
        credential: Credential,
        options: SessionOptions,
    ) -> Result<(), SessionError> {
        credential.validate()?;
        self.request(|reply| Command::Initialize {
            credential,
            options,
            resume: None,
            reply,
        })
        .await?
    }

    /// Reattaches to an existing conversation. Falls back to a fresh
    /// conversation with the token when the provider cannot resume.
    pub async fn resume_conversation(
        &self,
        params: ResumeParams,
        options: SessionOptions,
    ) -> Result<(), SessionError> {
        validate_secret(&params.token)?;
        let credential = Credential::token(params.token.clone());
        self.request(|reply| Command::Initialize {
            credential,
            options,
            resume: Some(params),
            reply,
        })
        .await?
    }

    /// Resumes the conversation saved for `options.user_id`, if any.
    pub async fn resume_saved(&self, options: SessionOptions) -> Result<bool, SessionError> {
        let (Some(store), Some(user_id)) = (&self.store, options.user_id.as_deref()) else {
            return Ok(false);
        };
        match store.load(user_id).await {
            Ok(Some(saved)) => {
                self.resume_conversation(saved.into(), options).await?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => {
                warn!(error = %err, "loading saved session failed");
                Ok(false)
            }
        }
    }

    pub async fn send_message(
        &self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<SendReceipt, SessionError> {
        let mut activity = Activity::message(text);
        activity.attachments = attachments;
        self.send_activity(activity).await
    }

    /// Posts an activity through the bounded send retry. The returned error
    /// is the transport's own; a classified `connectionError` is emitted too.
    pub async fn send_activity(&self, activity: Activity) -> Result<SendReceipt, SessionError> {
        let prepared = self
            .request(|reply| Command::PrepareSend { activity, reply })
            .await??;

        match self
            .send_queue
            .post(prepared.transport.as_ref(), &prepared.activity, &prepared.labels)
            .await
        {
            Ok(receipt) => {
                self.latency.record(receipt.latency);
                Ok(receipt)
            }
            Err(err) => {
                let diagnosis = classify(&err);
                record_counter(
                    "webchat_client_errors_total",
                    1,
                    &prepared
                        .labels
                        .clone()
                        .with("category", diagnosis.category.as_str()),
                );
                self.events.emit(&SessionEvent::error(diagnosis));
                Err(SessionError::Transport(err))
            }
        }
    }

    /// Idempotent. Cancels every timer and ends the transport.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Disconnects, then initializes again with the last options.
    pub async fn restart(&self, credential: Credential) -> Result<(), SessionError> {
        credential.validate()?;
        self.request(|reply| Command::Restart { credential, reply })
            .await?
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Online
    }

    pub fn status_receiver(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn health(&self) -> Result<HealthMetrics, SessionError> {
        self.request(|reply| Command::Health { reply }).await
    }

    pub async fn persisted_state(&self) -> Result<Option<PersistedSession>, SessionError> {
        self.request(|reply| Command::Persisted { reply }).await
    }

    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }
}

struct PreparedSend {
    transport: SharedTransport,
    activity: Activity,
    labels: SessionLabels,
}

enum Command {
    Initialize {
        credential: Credential,
        options: SessionOptions,
        resume: Option<ResumeParams>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Restart {
        credential: Credential,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    PrepareSend {
        activity: Activity,
        reply: oneshot::Sender<Result<PreparedSend, SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Health {
        reply: oneshot::Sender<HealthMetrics>,
    },
    Persisted {
        reply: oneshot::Sender<Option<PersistedSession>>,
    },
}

#[derive(Debug)]
enum Internal {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    ReconnectDue {
        generation: u64,
    },
    GreetingDue {
        generation: u64,
    },
    TypingExpired {
        seq: u64,
    },
    StreamIdle {
        seq: u64,
    },
    HealthTick,
    TokenRefreshed {
        generation: u64,
        token: String,
    },
    TokenRefreshFailed {
        generation: u64,
        error: TransportError,
    },
}

#[derive(Default)]
struct Timers {
    reconnect: Option<JoinHandle<()>>,
    greeting: Option<JoinHandle<()>>,
    typing: Option<JoinHandle<()>>,
    stream_idle: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    token_recovery: Option<JoinHandle<()>>,
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

impl Timers {
    fn cancel_transport_bound(&mut self) {
        abort(&mut self.greeting);
        abort(&mut self.token_recovery);
    }

    fn cancel_all(&mut self) {
        abort(&mut self.reconnect);
        abort(&mut self.greeting);
        abort(&mut self.typing);
        abort(&mut self.stream_idle);
        abort(&mut self.health);
        abort(&mut self.token_recovery);
    }
}

struct Actor {
    provider: SharedTransportProvider,
    events: SharedEventSink,
    store: Option<SharedSessionStore>,
    internal: mpsc::UnboundedSender<Internal>,
    status_tx: watch::Sender<SessionStatus>,
    status: SessionStatus,
    retry_policy: RetryPolicy,
    retry: RetryState,
    refresh_interval: Duration,
    settle_delay: Duration,
    health_interval: Duration,
    health: HealthMonitor,
    latency: Arc<LatencySignals>,
    send_queue: SendQueue,
    session: Option<Session>,
    options: SessionOptions,
    base_options: Option<SessionOptions>,
    dispatcher: ActivityDispatcher,
    transport: Option<SharedTransport>,
    pump: Option<JoinHandle<()>>,
    generation: u64,
    greeted: bool,
    caller_ended: bool,
    failed_emitted: bool,
    last_error: Option<ErrorDiagnosis>,
    timers: Timers,
    typing_seq: u64,
    idle_seq: u64,
    refresher: Option<TokenRefresher>,
    refresh_in_flight: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        debug!("connection controller started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
            }
        }
        self.disconnect(false).await;
        debug!("connection controller stopped");
    }

    fn emit(&self, event: SessionEvent) {
        trace!(event = event.name(), "session event");
        self.events.emit(&event);
    }

    fn labels(&self) -> SessionLabels {
        SessionLabels::new(self.provider.name()).with_conversation(
            self.session
                .as_ref()
                .and_then(|session| session.conversation_id.as_deref()),
        )
    }

    fn user_id(&self) -> &str {
        self.options.user_id.as_deref().unwrap_or_default()
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        info!(from = self.status.as_str(), to = status.as_str(), "session status changed");
        self.status = status;
        if let Some(session) = self.session.as_mut() {
            session.status = status;
        }
        self.status_tx.send_replace(status);
        self.emit(SessionEvent::status(status));
    }

    fn schedule(&self, delay: Duration, message: Internal) -> JoinHandle<()> {
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(message);
        })
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize {
                credential,
                options,
                resume,
                reply,
            } => {
                let result = self.initialize(credential, options, resume).await;
                let _ = reply.send(result);
            }
            Command::Restart { credential, reply } => {
                self.disconnect(true).await;
                let options = self.base_options.clone().unwrap_or_default();
                let result = self.initialize(credential, options, None).await;
                let _ = reply.send(result);
            }
            Command::PrepareSend { activity, reply } => {
                let _ = reply.send(self.prepare_send(activity));
            }
            Command::Disconnect { reply } => {
                self.disconnect(true).await;
                let _ = reply.send(());
            }
            Command::Health { reply } => {
                let _ = reply.send(self.health.metrics(self.dispatcher.messages_received()));
            }
            Command::Persisted { reply } => {
                let _ = reply.send(self.session.as_ref().and_then(Session::persisted));
            }
        }
    }

    async fn initialize(
        &mut self,
        credential: Credential,
        mut options: SessionOptions,
        resume: Option<ResumeParams>,
    ) -> Result<(), SessionError> {
        if self.session.is_some() || self.transport.is_some() {
            debug!("replacing existing session");
            self.timers.cancel_all();
            self.release_transport().await;
        }

        let user_id = options.ensure_user_id().to_string();
        self.dispatcher = ActivityDispatcher::new(user_id, options.debug_mode);
        self.retry = RetryState::new(self.retry_policy.with_max_attempts(options.max_retries));
        self.health.mark_offline();
        self.health.reset_reconnects();
        self.failed_emitted = false;
        self.last_error = None;
        self.caller_ended = false;

        let mut session = Session::new(credential);
        if let Some(resume) = &resume {
            session.conversation_id = Some(resume.conversation_id.clone());
            session.watermark = resume.watermark.clone();
            session.stream_url = resume.stream_url.clone();
            session.conversation_token = Some(resume.token.clone());
        }
        self.session = Some(session);
        self.base_options = Some(options.clone());
        self.options = options;

        info!(
            transport = self.provider.name(),
            web_socket = self.options.web_socket,
            resume = resume.is_some(),
            "initializing session"
        );
        let opened = self.open_transport(resume);
        if let Err(err) = &opened {
            let diagnosis = err.diagnose();
            warn!(error = %err, category = diagnosis.category.as_str(), "transport could not be opened");
            self.session = None;
            self.set_status(SessionStatus::FailedToConnect);
        } else {
            self.start_health_timer();
        }
        opened
    }

    fn open_transport(&mut self, resume: Option<ResumeParams>) -> Result<(), SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::SessionNotInitialized)?;
        if !self.provider.is_available() {
            return Err(SessionError::TransportUnavailable(
                self.provider.name().to_string(),
            ));
        }
        let params = TransportParams {
            credential: session.credential.clone(),
            options: self.options.clone(),
            resume,
        };
        let transport = if params.resume.is_some() && self.provider.supports_resume() {
            self.provider.resume(params)?
        } else {
            if params.resume.is_some() {
                debug!("provider cannot resume, starting a new conversation");
            }
            if let Some(session) = self.session.as_mut() {
                session.conversation_token = None;
                if params.resume.is_some() {
                    session.conversation_id = None;
                    session.watermark = None;
                }
            }
            self.provider.connect(TransportParams {
                resume: None,
                ..params
            })?
        };
        let events = transport
            .subscribe()
            .ok_or(SessionError::Transport(TransportError::Closed))?;

        self.generation += 1;
        self.greeted = false;
        self.caller_ended = false;
        let generation = self.generation;
        let internal = self.internal.clone();
        self.pump = Some(tokio::spawn(pump(events, internal, generation)));
        self.transport = Some(transport);
        self.set_status(SessionStatus::Connecting);
        Ok(())
    }

    /// Drops the current transport and everything bound to it.
    async fn release_transport(&mut self) {
        self.generation += 1;
        abort(&mut self.pump);
        self.timers.cancel_transport_bound();
        self.refresher = None;
        self.refresh_in_flight = false;
        if let Some(transport) = self.transport.take() {
            transport.end().await;
        }
    }

    /// `forget` also drops the persisted copy of the session.
    async fn disconnect(&mut self, forget: bool) {
        self.caller_ended = true;
        self.timers.cancel_all();
        self.release_transport().await;
        self.dispatcher.reset();
        self.health.mark_offline();
        if let Some(session) = self.session.take() {
            info!(
                conversation_id = session.conversation_id.as_deref().unwrap_or("-"),
                "session disconnected"
            );
            if forget
                && let Some(store) = &self.store
                && let Err(err) = store.clear(self.user_id()).await
            {
                warn!(error = %err, "clearing persisted session failed");
            }
        }
        self.set_status(SessionStatus::Disconnected);
    }

    fn prepare_send(&mut self, mut activity: Activity) -> Result<PreparedSend, SessionError> {
        let transport = match (&self.transport, &self.session) {
            (Some(transport), Some(_)) => Arc::clone(transport),
            _ => return Err(SessionError::SessionNotInitialized),
        };
        if activity.r#type == ActivityType::Message
            && activity.text().trim().is_empty()
            && !activity.has_attachments()
        {
            return Err(ValidationError::EmptyActivity.into());
        }
        activity.ensure_defaults();
        activity.from = Some(ChannelAccount {
            id: self.user_id().to_string(),
            ..activity.from.unwrap_or_default()
        });
        if activity.locale.is_none() {
            activity.locale = self.options.locale.clone();
        }
        if activity.r#type == ActivityType::Message {
            self.dispatcher.note_outgoing(activity.text());
        }
        Ok(PreparedSend {
            transport,
            activity,
            labels: self.labels(),
        })
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Transport { generation, event } => {
                if generation != self.generation {
                    trace!(generation, current = self.generation, "stale transport event dropped");
                    return;
                }
                self.on_transport_event(event).await;
            }
            Internal::ReconnectDue { generation } => {
                self.timers.reconnect = None;
                if generation != self.generation || self.status == SessionStatus::Disconnected {
                    debug!("reconnect timer no longer applies");
                    return;
                }
                self.reconnect().await;
            }
            Internal::GreetingDue { generation } => {
                self.timers.greeting = None;
                if generation == self.generation
                    && self.status == SessionStatus::Online
                    && !self.greeted
                {
                    self.send_greeting();
                }
            }
            Internal::TypingExpired { seq } => {
                if seq == self.typing_seq {
                    self.timers.typing = None;
                    for event in self.dispatcher.typing_expired() {
                        self.emit(event);
                    }
                }
            }
            Internal::StreamIdle { seq } => {
                if seq == self.idle_seq {
                    self.timers.stream_idle = None;
                    for event in self.dispatcher.stream_idle() {
                        self.emit(event);
                    }
                }
            }
            Internal::HealthTick => {
                if self.session.is_none() || self.status == SessionStatus::Disconnected {
                    return;
                }
                let events = self.health.sample(self.dispatcher.messages_received());
                let labels = self.labels();
                let metrics = self.health.metrics(self.dispatcher.messages_received());
                record_gauge(
                    "webchat_client_average_latency_ms",
                    metrics.average_latency_ms,
                    &labels,
                );
                for event in events {
                    self.emit(event);
                }
            }
            Internal::TokenRefreshed { generation, token } => {
                if generation != self.generation {
                    return;
                }
                self.refresh_in_flight = false;
                if let Some(session) = self.session.as_mut() {
                    if session.credential.is_token() {
                        session.credential = Credential::token(token.clone());
                    }
                    session.conversation_token = Some(token);
                }
                self.persist().await;
            }
            Internal::TokenRefreshFailed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                self.refresh_in_flight = false;
                warn!(error = %error, "token refresh after expiry failed");
                self.emit(SessionEvent::TokenRefreshRequired);
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(status) => self.on_transport_status(status).await,
            TransportEvent::Activity(activity) => self.on_activity(*activity),
            TransportEvent::Watermark(watermark) => {
                if let Some(session) = self.session.as_mut() {
                    session.watermark = Some(watermark.clone());
                }
                if let Some(store) = &self.store
                    && let Err(err) = store
                        .update_watermark(self.user_id(), Some(watermark))
                        .await
                {
                    warn!(error = %err, "persisting watermark failed");
                }
            }
            TransportEvent::Failure(err) => {
                let diagnosis = classify(&err);
                warn!(
                    error = %err,
                    category = diagnosis.category.as_str(),
                    "transport reported a failure"
                );
                record_counter(
                    "webchat_client_errors_total",
                    1,
                    &self.labels().with("category", diagnosis.category.as_str()),
                );
                self.last_error = Some(diagnosis.clone());
                self.emit(SessionEvent::error(diagnosis));
            }
        }
    }

    async fn on_transport_status(&mut self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Uninitialized => {
                trace!("ignoring uninitialized status from transport");
            }
            ConnectionStatus::Connecting => self.set_status(SessionStatus::Connecting),
            ConnectionStatus::Online => self.on_online().await,
            ConnectionStatus::ExpiredToken => {
                self.set_status(SessionStatus::ExpiredToken);
                self.on_token_expired();
            }
            ConnectionStatus::FailedToConnect => {
                self.set_status(SessionStatus::FailedToConnect);
                self.on_connection_lost().await;
            }
            ConnectionStatus::Ended => {
                self.set_status(SessionStatus::Ended);
                if self.caller_ended {
                    debug!("conversation ended by caller");
                } else {
                    self.on_connection_lost().await;
                }
            }
        }
    }

    async fn on_online(&mut self) {
        self.retry.reset();
        self.health.mark_online();
        self.health.reset_reconnects();
        self.last_error = None;

        if let (Some(session), Some(transport)) = (self.session.as_mut(), &self.transport) {
            let info = transport.conversation();
            if info.conversation_id.is_some() {
                session.conversation_id = info.conversation_id;
            }
            if info.stream_url.is_some() {
                session.stream_url = info.stream_url;
            }
            if info.watermark.is_some() {
                session.watermark = info.watermark;
            }
            // Without an issued token the transport reports the secret itself.
            if let Some(token) = info.token
                && token != session.credential.value()
            {
                if session.credential.is_token() {
                    session.credential = Credential::token(token.clone());
                }
                session.conversation_token = Some(token);
            }
            session.last_activity_at = Some(OffsetDateTime::now_utc());
        }
        self.set_status(SessionStatus::Online);

        self.ensure_refresher();
        if self.options.greeting && !self.greeted && self.timers.greeting.is_none() {
            let handle = self.schedule(
                self.settle_delay,
                Internal::GreetingDue {
                    generation: self.generation,
                },
            );
            self.timers.greeting = Some(handle);
        }
        self.persist().await;
    }

    fn can_refresh(&self) -> Option<SharedTransport> {
        let session = self.session.as_ref()?;
        let transport = self.transport.as_ref()?;
        (session.token().is_some() && transport.supports_token_refresh())
            .then(|| Arc::clone(transport))
    }

    fn ensure_refresher(&mut self) {
        if self.refresher.is_some() || !self.options.auto_token_refresh {
            return;
        }
        let Some(transport) = self.can_refresh() else {
            return;
        };
        let internal = self.internal.clone();
        let generation = self.generation;
        debug!(interval = ?self.refresh_interval, "starting token refresher");
        self.refresher = Some(TokenRefresher::spawn(
            Arc::new(TransportTokenSource(transport)),
            self.refresh_interval,
            Arc::clone(&self.events),
            move |token| {
                let _ = internal.send(Internal::TokenRefreshed { generation, token });
            },
        ));
    }

    fn on_token_expired(&mut self) {
        let Some(transport) = self.can_refresh() else {
            info!("token expired and cannot be refreshed here");
            self.emit(SessionEvent::TokenRefreshRequired);
            return;
        };
        if self.refresh_in_flight {
            return;
        }
        self.refresh_in_flight = true;
        let internal = self.internal.clone();
        let generation = self.generation;
        self.timers.token_recovery = Some(tokio::spawn(async move {
            let message = match transport.refresh_token().await {
                Ok(token) => Internal::TokenRefreshed { generation, token },
                Err(error) => Internal::TokenRefreshFailed { generation, error },
            };
            let _ = internal.send(message);
        }));
    }

    async fn on_connection_lost(&mut self) {
        self.release_transport().await;
        self.health.mark_offline();

        match self.retry.record_failure() {
            RetryDecision::Retry { attempt, delay } => {
                info!(
                    attempt,
                    max_attempts = self.options.max_retries,
                    ?delay,
                    "connection lost, scheduling reconnect"
                );
                abort(&mut self.timers.reconnect);
                let handle = self.schedule(
                    delay,
                    Internal::ReconnectDue {
                        generation: self.generation,
                    },
                );
                self.timers.reconnect = Some(handle);
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(attempts, "reconnect budget exhausted");
                if !self.failed_emitted {
                    self.failed_emitted = true;
                    let troubleshooting = self.troubleshooting();
                    self.emit(SessionEvent::ConnectionFailed {
                        retry_count: attempts,
                        max_retries: self.options.max_retries,
                        troubleshooting,
                    });
                }
                self.disconnect(true).await;
            }
        }
    }

    async fn reconnect(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let resume = match (&session.conversation_id, session.token()) {
            (Some(conversation_id), Some(token)) if self.provider.supports_resume() => {
                Some(ResumeParams {
                    conversation_id: conversation_id.clone(),
                    token: token.to_string(),
                    watermark: session.watermark.clone(),
                    stream_url: None,
                })
            }
            _ => None,
        };

        let suggestion = self.health.suggestion();
        suggestion.apply(&mut self.options);
        self.health.record_reconnect();
        record_counter("webchat_client_reconnects_total", 1, &self.labels());
        info!(
            attempt = self.retry.attempt,
            resume = resume.is_some(),
            web_socket = self.options.web_socket,
            polling_interval = ?suggestion.polling_interval,
            "reconnecting"
        );

        if let Err(err) = self.open_transport(resume) {
            let diagnosis = err.diagnose();
            warn!(error = %err, category = diagnosis.category.as_str(), "reconnect failed");
            self.last_error = Some(diagnosis.clone());
            self.emit(SessionEvent::error(diagnosis));
            self.set_status(SessionStatus::FailedToConnect);
            self.on_connection_lost().await;
        }
    }

    fn on_activity(&mut self, activity: Activity) {
        let conversation_id = self
            .session
            .as_ref()
            .and_then(|session| session.conversation_id.clone());
        let span = span_for_activity("dispatch", conversation_id.as_deref(), &activity.id);
        let _entered = span.enter();

        if let Some(session) = self.session.as_mut() {
            session.last_activity_at = Some(OffsetDateTime::now_utc());
        }
        let labels = self.labels().with("type", activity.r#type.as_str());
        let outcome = self.dispatcher.dispatch(activity, self.health.quality());
        if outcome.ignored {
            return;
        }
        record_counter("webchat_client_activities_received_total", 1, &labels);

        match outcome.typing {
            TypingAction::Arm(timeout) => {
                self.typing_seq += 1;
                abort(&mut self.timers.typing);
                let handle = self.schedule(timeout, Internal::TypingExpired { seq: self.typing_seq });
                self.timers.typing = Some(handle);
            }
            TypingAction::Clear => {
                self.typing_seq += 1;
                abort(&mut self.timers.typing);
            }
            TypingAction::None => {}
        }
        if let Some(idle) = outcome.stream_idle {
            self.idle_seq += 1;
            abort(&mut self.timers.stream_idle);
            let handle = self.schedule(idle, Internal::StreamIdle { seq: self.idle_seq });
            self.timers.stream_idle = Some(handle);
        }
        for event in outcome.events {
            if matches!(event, SessionEvent::StreamingChunk { .. }) {
                record_counter("webchat_client_streaming_chunks_total", 1, &self.labels());
            }
            self.emit(event);
        }
    }

    fn send_greeting(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        self.greeted = true;
        let mut greeting =
            Activity::event(GREETING_EVENT_NAME, Some(json!({ "locale": self.options.locale })))
                .with_from(self.user_id());
        greeting.locale = self.options.locale.clone();
        greeting.ensure_defaults();

        let queue = self.send_queue;
        let latency = Arc::clone(&self.latency);
        let labels = self.labels();
        info!(activity_id = %greeting.id, "sending greeting");
        tokio::spawn(
            async move {
                let started = Instant::now();
                match queue.post(transport.as_ref(), &greeting, &labels).await {
                    Ok(receipt) => {
                        latency.record(receipt.latency);
                        debug!(id = %receipt.id, elapsed = ?started.elapsed(), "greeting delivered");
                    }
                    Err(err) => warn!(error = %err, "greeting could not be delivered"),
                }
            }
            .in_current_span(),
        );
    }

    fn start_health_timer(&mut self) {
        abort(&mut self.timers.health);
        let internal = self.internal.clone();
        let interval = self.health_interval;
        self.timers.health = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if internal.send(Internal::HealthTick).is_err() {
                    break;
                }
            }
        }));
    }

    async fn persist(&self) {
        let (Some(store), Some(session)) = (&self.store, &self.session) else {
            return;
        };
        let Some(persisted) = session.persisted() else {
            return;
        };
        if let Err(err) = store.save(self.user_id(), persisted).await {
            warn!(error = %err, "persisting session failed");
        }
    }

    fn troubleshooting(&self) -> Troubleshooting {
        let mut steps = vec![
            "Verify the Direct Line secret or token is valid and has not expired.".to_string(),
            format!("Check that {} is reachable from this network.", self.options.domain),
        ];
        if self.options.web_socket {
            steps.push(
                "If a proxy blocks WebSockets, disable webSocket to fall back to polling."
                    .to_string(),
            );
        }
        if let Some(diagnosis) = &self.last_error {
            steps.push(diagnosis.suggestion.clone());
        }
        Troubleshooting {
            domain: self.options.domain.clone(),
            web_socket: self.options.web_socket,
            conversation_id: self
                .session
                .as_ref()
                .and_then(|session| session.conversation_id.clone()),
            last_error: self.last_error.clone(),
            steps,
        }
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        if internal
            .send(Internal::Transport { generation, event })
            .is_err()
        {
            break;
        }
    }
    trace!(generation, "transport event stream closed");
}
