//! Direct Line 3.0 adapter over reqwest (REST) and tokio-tungstenite (stream).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{Instrument, debug, info, warn};
use url::Url;
use wcs_core::{Activity, ConnectionStatus, SessionOptions, TransportError};
use wcs_telemetry::{SessionLabels, record_counter, record_histogram};

use super::{
    ConversationInfo, SharedTransport, Transport, TransportEvent, TransportParams,
    TransportProvider,
};
use crate::retry::RetryPolicy;

pub const PROVIDER_NAME: &str = "directline";
/// Consecutive transient polling failures tolerated before giving up.
pub const MAX_POLL_FAILURES: u32 = 5;
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConversation {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    stream_url: Option<String>,
    #[serde(default, rename = "expires_in")]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ActivitySet {
    #[serde(default)]
    activities: Vec<Activity>,
    #[serde(default)]
    watermark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceResponse {
    #[serde(default)]
    id: Option<String>,
}

/// Creates Direct Line transports. A shared `reqwest::Client` may be injected;
/// otherwise one is built per connection using the session timeout.
#[derive(Clone, Default)]
pub struct DirectLineProvider {
    client: Option<Client>,
}

impl DirectLineProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client: Some(client),
        }
    }

    fn open(&self, params: TransportParams) -> Result<SharedTransport, TransportError> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => Client::builder()
                .timeout(params.options.timeout())
                .build()
                .map_err(|err| TransportError::Network(err.into()))?,
        };
        let base = parse_base(&params.options.domain)?;
        let (events, rx) = mpsc::unbounded_channel();

        let mut state = ConversationInfo {
            token: Some(params.credential.value().to_string()),
            ..ConversationInfo::default()
        };
        if let Some(resume) = &params.resume {
            state.conversation_id = Some(resume.conversation_id.clone());
            state.token = Some(resume.token.clone());
            state.watermark = resume.watermark.clone();
            state.stream_url = resume.stream_url.clone();
        }

        let api = Arc::new(DirectLineApi {
            client,
            base,
            state: Mutex::new(state),
            events,
        });
        let span = tracing::info_span!(
            "webchat.directline",
            resume = params.resume.is_some(),
            web_socket = params.options.web_socket
        );
        let task = tokio::spawn(run(Arc::clone(&api), params).instrument(span));

        Ok(Arc::new(DirectLineTransport {
            api,
            rx: Mutex::new(Some(rx)),
            task: Mutex::new(Some(task)),
        }))
    }
}

impl TransportProvider for DirectLineProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn connect(&self, params: TransportParams) -> Result<SharedTransport, TransportError> {
        self.open(TransportParams {
            resume: None,
            ..params
        })
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn resume(&self, params: TransportParams) -> Result<SharedTransport, TransportError> {
        if params.resume.is_none() {
            return Err(TransportError::Unsupported("resume without conversation"));
        }
        self.open(params)
    }
}

fn parse_base(domain: &str) -> Result<Url, TransportError> {
    let mut base = Url::parse(domain.trim())
        .map_err(|err| TransportError::Unavailable(format!("invalid domain {domain:?}: {err}")))?;
    if base.cannot_be_a_base() {
        return Err(TransportError::Unavailable(format!(
            "domain {domain:?} cannot be used as a base url"
        )));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

struct DirectLineApi {
    client: Client,
    base: Url,
    state: Mutex<ConversationInfo>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl DirectLineApi {
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Unavailable("domain cannot be a base url".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn snapshot(&self) -> ConversationInfo {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    fn update(&self, apply: impl FnOnce(&mut ConversationInfo)) {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
    }

    fn labels(&self, endpoint: &'static str) -> SessionLabels {
        SessionLabels::new(PROVIDER_NAME)
            .with_conversation(self.snapshot().conversation_id.as_deref())
            .with("endpoint", endpoint)
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("transport event dropped; no subscriber");
        }
    }

    fn status(&self, status: ConnectionStatus) {
        debug!(?status, "transport status");
        self.emit(TransportEvent::Status(status));
    }

    fn fail(&self, err: TransportError, status: ConnectionStatus) {
        warn!(error = %err, ?status, "direct line failure");
        self.emit(TransportEvent::Failure(err));
        self.status(status);
    }

    fn bearer(&self) -> Result<String, TransportError> {
        self.snapshot().token.ok_or(TransportError::Closed)
    }

    fn conversation_id(&self) -> Result<String, TransportError> {
        self.snapshot().conversation_id.ok_or(TransportError::Closed)
    }

    async fn send<T>(
        &self,
        endpoint: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let started = Instant::now();
        let response = request.send().await.map_err(|err| {
            record_counter(
                "webchat_client_errors_total",
                1,
                &self.labels(endpoint).with("kind", "directline_transport"),
            );
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(err.into())
            }
        })?;

        record_histogram(
            "webchat_client_directline_roundtrip_seconds",
            started.elapsed().as_secs_f64(),
            &self
                .labels(endpoint)
                .with("status", response.status().as_str().to_string()),
        );
        map_response(endpoint, response, self.labels(endpoint)).await
    }

    async fn start(&self) -> Result<(), TransportError> {
        let url = self.endpoint(&["conversations"])?;
        let request = self
            .client
            .post(url)
            .bearer_auth(self.bearer()?)
            .json(&serde_json::json!({}));
        let raw: RawConversation = self.send("conversations.start", request).await?;
        let conversation_id = raw
            .conversation_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransportError::Decode("conversation id missing".into()))?;
        info!(%conversation_id, expires_in = ?raw.expires_in, "conversation started");
        self.update(|state| {
            state.conversation_id = Some(conversation_id);
            if let Some(token) = raw.token {
                state.token = Some(token);
            }
            state.stream_url = raw.stream_url;
        });
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let conversation_id = self.conversation_id()?;
        let mut url = self.endpoint(&["conversations", &conversation_id])?;
        if let Some(watermark) = self.snapshot().watermark {
            url.query_pairs_mut().append_pair("watermark", &watermark);
        }
        let request = self.client.get(url).bearer_auth(self.bearer()?);
        let raw: RawConversation = self.send("conversations.reconnect", request).await?;
        info!(%conversation_id, "conversation resumed");
        self.update(|state| {
            if let Some(token) = raw.token {
                state.token = Some(token);
            }
            if raw.stream_url.is_some() {
                state.stream_url = raw.stream_url;
            }
        });
        Ok(())
    }

    async fn poll_once(&self) -> Result<(), TransportError> {
        let conversation_id = self.conversation_id()?;
        let mut url = self.endpoint(&["conversations", &conversation_id, "activities"])?;
        if let Some(watermark) = self.snapshot().watermark {
            url.query_pairs_mut().append_pair("watermark", &watermark);
        }
        let request = self.client.get(url).bearer_auth(self.bearer()?);
        let set: ActivitySet = self.send("conversations.activities", request).await?;
        self.deliver(set);
        Ok(())
    }

    fn deliver(&self, set: ActivitySet) {
        for activity in set.activities {
            self.emit(TransportEvent::Activity(Box::new(activity)));
        }
        if let Some(watermark) = set.watermark.filter(|w| !w.is_empty()) {
            let changed = self.snapshot().watermark.as_deref() != Some(watermark.as_str());
            if changed {
                self.update(|state| state.watermark = Some(watermark.clone()));
                self.emit(TransportEvent::Watermark(watermark));
            }
        }
    }

    async fn post(&self, activity: &Activity) -> Result<String, TransportError> {
        let conversation_id = self.conversation_id()?;
        let url = self.endpoint(&["conversations", &conversation_id, "activities"])?;
        let request = self
            .client
            .post(url)
            .bearer_auth(self.bearer()?)
            .json(activity);
        let response: ResourceResponse = self.send("conversations.post", request).await?;
        Ok(response.id.unwrap_or_default())
    }

    async fn refresh(&self) -> Result<String, TransportError> {
        let url = self.endpoint(&["tokens", "refresh"])?;
        let request = self.client.post(url).bearer_auth(self.bearer()?);
        let raw: RawConversation = self.send("tokens.refresh", request).await?;
        let token = raw
            .token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| TransportError::Decode("token missing from refresh response".into()))?;
        self.update(|state| state.token = Some(token.clone()));
        Ok(token)
    }
}

async fn map_response<T>(
    endpoint: &'static str,
    response: reqwest::Response,
    labels: SessionLabels,
) -> Result<T, TransportError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    if !status.is_success() {
        let retry_after = retry_after(&response);
        let mut message = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".into());
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        record_counter(
            "webchat_client_errors_total",
            1,
            &labels
                .with("kind", "directline_remote")
                .with("status", status.as_str().to_string()),
        );
        debug!(endpoint, %status, "direct line returned an error");
        return Err(TransportError::Remote {
            status,
            retry_after,
            message,
        });
    }

    response.json::<T>().await.map_err(|err| {
        record_counter(
            "webchat_client_errors_total",
            1,
            &labels.with("kind", "directline_decode"),
        );
        TransportError::Decode(err.into())
    })
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn run(api: Arc<DirectLineApi>, params: TransportParams) {
    api.status(ConnectionStatus::Connecting);
    let opened = if params.resume.is_some() {
        api.reconnect().await
    } else {
        api.start().await
    };
    if let Err(err) = opened {
        api.fail(err, ConnectionStatus::FailedToConnect);
        return;
    }

    let stream_url = api.snapshot().stream_url;
    match stream_url {
        Some(stream_url) if params.options.web_socket => {
            stream(&api, &stream_url, &params.options).await
        }
        _ => poll(&api, &params.options).await,
    }
}

async fn stream(api: &DirectLineApi, stream_url: &str, options: &SessionOptions) {
    let connected = tokio::time::timeout(options.timeout(), connect_async(stream_url)).await;
    let mut socket = match connected {
        Ok(Ok((socket, _))) => socket,
        Ok(Err(err)) => {
            api.fail(
                TransportError::Network(err.into()),
                ConnectionStatus::FailedToConnect,
            );
            return;
        }
        Err(_) => {
            api.fail(TransportError::Timeout, ConnectionStatus::FailedToConnect);
            return;
        }
    };
    info!("activity stream connected");
    api.status(ConnectionStatus::Online);

    while let Some(frame) = socket.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Close(frame)) => {
                info!(?frame, "activity stream closed by service");
                api.status(ConnectionStatus::Ended);
                return;
            }
            Ok(_) => continue,
            Err(err) => {
                api.fail(
                    TransportError::Network(err.into()),
                    ConnectionStatus::FailedToConnect,
                );
                return;
            }
        };
        // Empty frames are keep-alives.
        if payload.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<ActivitySet>(&payload) {
            Ok(set) => api.deliver(set),
            Err(err) => warn!(error = %err, "undecodable activity frame skipped"),
        }
    }
    info!("activity stream finished");
    api.status(ConnectionStatus::Ended);
}

async fn poll(api: &DirectLineApi, options: &SessionOptions) {
    let backoff = RetryPolicy {
        base_delay: options.polling_interval(),
        ..RetryPolicy::default()
    };
    let mut failures = 0u32;
    let mut expired = false;
    api.status(ConnectionStatus::Online);

    loop {
        match api.poll_once().await {
            Ok(()) => {
                failures = 0;
                if expired {
                    expired = false;
                    api.status(ConnectionStatus::Online);
                }
            }
            Err(err) => match err.status() {
                Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                    if !expired {
                        expired = true;
                        warn!(error = %err, "poll rejected; token expired");
                        api.status(ConnectionStatus::ExpiredToken);
                    }
                }
                Some(StatusCode::NOT_FOUND) => {
                    api.fail(err, ConnectionStatus::Ended);
                    return;
                }
                _ if err.is_transient() => {
                    failures += 1;
                    if failures >= MAX_POLL_FAILURES {
                        api.fail(err, ConnectionStatus::FailedToConnect);
                        return;
                    }
                    let delay = match &err {
                        TransportError::Remote {
                            retry_after: Some(after),
                            ..
                        } => *after,
                        _ => backoff.delay(failures),
                    };
                    debug!(failures, ?delay, error = %err, "poll failed, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                _ => {
                    api.fail(err, ConnectionStatus::FailedToConnect);
                    return;
                }
            },
        }
        tokio::time::sleep(options.polling_interval()).await;
    }
}

/// Transport bound to one Direct Line conversation.
pub struct DirectLineTransport {
    api: Arc<DirectLineApi>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectLineTransport {
    fn stop(&self) {
        if let Ok(mut task) = self.task.lock()
            && let Some(task) = task.take()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for DirectLineTransport {
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx.lock().ok()?.take()
    }

    async fn post_activity(&self, activity: &Activity) -> Result<String, TransportError> {
        self.api.post(activity).await
    }

    fn supports_token_refresh(&self) -> bool {
        true
    }

    async fn refresh_token(&self) -> Result<String, TransportError> {
        self.api.refresh().await
    }

    fn conversation(&self) -> ConversationInfo {
        self.api.snapshot()
    }

    async fn end(&self) {
        debug!("ending direct line transport");
        self.stop();
    }
}

impl Drop for DirectLineTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
