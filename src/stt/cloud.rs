//! Streaming cloud recognizer session.
//!
//! Each session walks TokenExchange → Connecting → Starting → Streaming, and
//! falls back to a jittered exponential backoff on any transient failure.
//! Reconnection is entirely internal: the pipeline only sees the ordered
//! event stream. Audio is never sent before the server acknowledges the
//! start message, and no frame is re-sent across reconnects apart from a
//! small replay ring (at most one second) that smooths utterance boundaries.

use crate::config::CloudSettings;
use crate::defaults;
use crate::error::{Result, TranskriboError};
use crate::pipeline::types::{AudioFrame, FinalTranscript, TranscriptEvent};
use crate::stt::backend::{EventSender, FrameSource, TranscriptionBackend};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How a streaming session ended.
enum SessionEnd {
    /// Frame input drained and trailing finals collected.
    Drained,
    /// Transient failure; reconnect after backoff.
    Disconnected(String),
}

/// Outcome of one server message.
enum ServerAction {
    Continue,
    Started,
    Disconnect(String),
    Fatal(String),
}

pub struct CloudBackend {
    settings: CloudSettings,
    sample_rate: u32,
    replay_capacity: usize,
    http: reqwest::Client,
}

impl CloudBackend {
    pub fn new(settings: CloudSettings, sample_rate: u32, chunk_duration_seconds: f64) -> Self {
        let replay_capacity = (defaults::CLOUD_REPLAY_WINDOW.as_secs_f64()
            / chunk_duration_seconds)
            .ceil()
            .max(1.0) as usize;
        Self {
            settings,
            sample_rate,
            replay_capacity,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Exchange the long-lived key for a short-lived bearer.
    ///
    /// A 401/403 means the key itself is rejected, which no amount of
    /// retrying will fix; everything else is transient.
    async fn exchange_token(&self) -> Result<String> {
        let response = self
            .http
            .post(&self.settings.auth_url)
            .bearer_auth(&self.settings.api_key)
            .json(&json!({ "ttl": self.settings.jwt_ttl_seconds }))
            .send()
            .await
            .map_err(|e| TranskriboError::Backend {
                message: format!("token exchange request failed: {e}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TranskriboError::BackendFatal {
                message: format!(
                    "token exchange rejected with {status}: check CLOUD_API_KEY"
                ),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranskriboError::Backend {
                message: format!("token exchange failed ({status}): {body}"),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| TranskriboError::Backend {
            message: format!("token exchange response unreadable: {e}"),
        })?;
        body.into_token().ok_or_else(|| TranskriboError::Backend {
            message: "token exchange response carried no token".to_string(),
        })
    }

    async fn connect(&self, token: &str) -> Result<WsStream> {
        let url = augment_url_with_language(&self.settings.connection_url, &self.settings.language);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TranskriboError::Backend {
                message: format!("invalid CLOUD_CONNECTION_URL: {e}"),
            })?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
            TranskriboError::Backend {
                message: format!("bearer token not header-safe: {e}"),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _response) =
            connect_async(request)
                .await
                .map_err(|e| TranskriboError::Backend {
                    message: format!("websocket connect failed: {e}"),
                })?;
        Ok(ws)
    }

    fn start_message(&self) -> String {
        let mut transcription_config = json!({
            "language": self.settings.language,
            "enable_partials": true,
        });
        if self.settings.enable_diarization {
            transcription_config["diarization"] = json!("speaker");
        }
        json!({
            "message": "StartRecognition",
            "transcription_config": transcription_config,
            "audio_format": {
                "type": "raw",
                "encoding": "pcm_s16le",
                "sample_rate": self.sample_rate,
            },
        })
        .to_string()
    }

    /// Wait for the start acknowledgement; no audio may be sent before it.
    /// Returns None once started, or the session end on failure.
    async fn await_recognition_started(
        &self,
        source: &mut WsSource,
        events: &EventSender,
        session_id: &str,
    ) -> Result<Option<SessionEnd>> {
        let deadline = Instant::now() + defaults::CLOUD_START_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Some(SessionEnd::Disconnected(
                    "no start acknowledgement within the timeout".to_string(),
                )));
            }
            let message = tokio::time::timeout(remaining, source.next()).await;
            match message {
                Err(_) => {
                    return Ok(Some(SessionEnd::Disconnected(
                        "no start acknowledgement within the timeout".to_string(),
                    )));
                }
                Ok(None) => {
                    return Ok(Some(SessionEnd::Disconnected(
                        "socket closed during start".to_string(),
                    )));
                }
                Ok(Some(Err(e))) => {
                    return Ok(Some(SessionEnd::Disconnected(format!("socket error: {e}"))));
                }
                Ok(Some(Ok(message))) => {
                    match self.handle_server_message(&message, events, session_id).await? {
                        ServerAction::Started => return Ok(None),
                        ServerAction::Continue => continue,
                        ServerAction::Disconnect(reason) => {
                            return Ok(Some(SessionEnd::Disconnected(reason)));
                        }
                        ServerAction::Fatal(message) => {
                            return Err(TranskriboError::BackendFatal { message });
                        }
                    }
                }
            }
        }
    }

    /// Parse one server message and emit any transcript events it carries.
    async fn handle_server_message(
        &self,
        message: &Message,
        events: &EventSender,
        session_id: &str,
    ) -> Result<ServerAction> {
        let text = match message {
            Message::Text(text) => text.as_str(),
            Message::Binary(payload) => {
                debug!("Ignoring {} binary bytes from recognizer", payload.len());
                return Ok(ServerAction::Continue);
            }
            Message::Close(_) => {
                return Ok(ServerAction::Disconnect("server closed the socket".to_string()));
            }
            _ => return Ok(ServerAction::Continue),
        };

        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                // Protocol error: log and drop the event.
                warn!("Malformed recognizer payload dropped: {e}");
                return Ok(ServerAction::Continue);
            }
        };

        match event.kind() {
            "RecognitionStarted" => {
                info!("Recognition started");
                Ok(ServerAction::Started)
            }
            "AddPartialTranscript" | "AddTranscript" => {
                let is_final = event.kind() == "AddTranscript";
                if let Some(transcript) = event.into_transcript(is_final, session_id) {
                    if !events.send(transcript).await {
                        return Ok(ServerAction::Disconnect("pipeline gone".to_string()));
                    }
                }
                Ok(ServerAction::Continue)
            }
            "Warning" => {
                warn!("Recognizer warning: {text}");
                Ok(ServerAction::Continue)
            }
            "Error" | "error" => {
                error!("Recognizer error: {text}");
                if event.is_permanent_rejection() {
                    Ok(ServerAction::Fatal(format!(
                        "recognizer rejected the session permanently: {text}"
                    )))
                } else {
                    Ok(ServerAction::Disconnect("server reported an error".to_string()))
                }
            }
            other => {
                debug!("Recognizer message ignored: {other}");
                Ok(ServerAction::Continue)
            }
        }
    }

    /// One full session: start message, acknowledgement, streaming, drain.
    async fn run_session(
        &self,
        ws: WsStream,
        frames: &FrameSource,
        events: &EventSender,
        replay: &mut VecDeque<AudioFrame>,
        streamed_once: &mut bool,
    ) -> Result<SessionEnd> {
        let (mut sink, mut source) = ws.split();
        let session_id = Uuid::new_v4().to_string();

        if let Err(e) = sink.send(Message::text(self.start_message())).await {
            return Ok(SessionEnd::Disconnected(format!("start send failed: {e}")));
        }

        if let Some(ended) = self
            .await_recognition_started(&mut source, events, &session_id)
            .await?
        {
            return Ok(ended);
        }
        *streamed_once = true;

        // Audio buffered while disconnected is stale; keep only the replay
        // ring so utterance boundaries stay smooth without duplicating
        // finals (server-side utterance state restarted with the session).
        frames.clear();
        let mut sent_chunks: u64 = 0;
        for frame in replay.iter() {
            if let Err(e) = sink.send(Message::binary(frame.to_pcm_bytes())).await {
                return Ok(SessionEnd::Disconnected(format!("replay send failed: {e}")));
            }
            sent_chunks += 1;
        }

        loop {
            tokio::select! {
                maybe_frame = frames.pop() => match maybe_frame {
                    Some(frame) => {
                        let payload = frame.to_pcm_bytes();
                        push_replay(replay, frame, self.replay_capacity);
                        if let Err(e) = sink.send(Message::binary(payload)).await {
                            return Ok(SessionEnd::Disconnected(format!("audio send failed: {e}")));
                        }
                        sent_chunks += 1;
                    }
                    None => {
                        return self
                            .drain_session(sink, source, events, &session_id, sent_chunks)
                            .await;
                    }
                },
                maybe_message = source.next() => match maybe_message {
                    None => return Ok(SessionEnd::Disconnected("socket closed".to_string())),
                    Some(Err(e)) => {
                        return Ok(SessionEnd::Disconnected(format!("socket error: {e}")));
                    }
                    Some(Ok(message)) => {
                        match self.handle_server_message(&message, events, &session_id).await? {
                            ServerAction::Continue | ServerAction::Started => {}
                            ServerAction::Disconnect(reason) => {
                                return Ok(SessionEnd::Disconnected(reason));
                            }
                            ServerAction::Fatal(message) => {
                                return Err(TranskriboError::BackendFatal { message });
                            }
                        }
                    }
                },
            }
        }
    }

    /// Send end-of-stream and collect trailing finals for a bounded time.
    async fn drain_session(
        &self,
        mut sink: WsSink,
        mut source: WsSource,
        events: &EventSender,
        session_id: &str,
        sent_chunks: u64,
    ) -> Result<SessionEnd> {
        let end_message = json!({
            "message": "EndOfStream",
            "last_seq_no": sent_chunks,
        })
        .to_string();
        if let Err(e) = sink.send(Message::text(end_message)).await {
            debug!("End-of-stream send failed during drain: {e}");
            return Ok(SessionEnd::Drained);
        }

        let deadline = Instant::now() + defaults::CLOUD_DRAIN_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, source.next()).await {
                Err(_) | Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(message))) => {
                    match self.handle_server_message(&message, events, session_id).await? {
                        ServerAction::Fatal(message) => {
                            return Err(TranskriboError::BackendFatal { message });
                        }
                        ServerAction::Disconnect(_) => break,
                        _ => {}
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        Ok(SessionEnd::Drained)
    }
}

#[async_trait]
impl TranscriptionBackend for CloudBackend {
    async fn run(&self, frames: FrameSource, events: EventSender) -> Result<()> {
        let mut backoff = defaults::CLOUD_BACKOFF_INITIAL;
        let mut replay: VecDeque<AudioFrame> = VecDeque::with_capacity(self.replay_capacity);

        loop {
            if frames.is_closed() && frames.is_empty() {
                return Ok(());
            }

            let session = async {
                let token = self.exchange_token().await?;
                let ws = self.connect(&token).await?;
                let mut streamed_once = false;
                let result = self
                    .run_session(ws, &frames, &events, &mut replay, &mut streamed_once)
                    .await;
                result.map(|end| (end, streamed_once))
            }
            .await;

            match session {
                Ok((SessionEnd::Drained, _)) => return Ok(()),
                Ok((SessionEnd::Disconnected(reason), streamed_once)) => {
                    if streamed_once {
                        backoff = defaults::CLOUD_BACKOFF_INITIAL;
                    }
                    warn!("Recognizer session lost ({reason}); reconnecting in ~{backoff:?}");
                    tokio::time::sleep(with_jitter(backoff)).await;
                    backoff = (backoff * 2).min(defaults::CLOUD_BACKOFF_MAX);
                }
                Err(e @ TranskriboError::BackendFatal { .. }) => return Err(e),
                Err(e) => {
                    warn!("Recognizer session setup failed ({e}); retrying in ~{backoff:?}");
                    tokio::time::sleep(with_jitter(backoff)).await;
                    backoff = (backoff * 2).min(defaults::CLOUD_BACKOFF_MAX);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "cloud"
    }
}

/// Token exchange response; providers differ on the field name.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    key_value: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    jwt: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.key_value.or(self.token).or(self.jwt)
    }
}

/// Server event envelope.
#[derive(Debug, Deserialize)]
struct ServerEvent {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    type_field: Option<String>,
    #[serde(default)]
    metadata: Option<TranscriptMetadata>,
}

#[derive(Debug, Deserialize)]
struct TranscriptMetadata {
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    words: Vec<WordTiming>,
}

#[derive(Debug, Deserialize)]
struct WordTiming {
    #[serde(default)]
    start_time: Option<f64>,
    #[serde(default)]
    end_time: Option<f64>,
}

impl ServerEvent {
    fn kind(&self) -> &str {
        self.message
            .as_deref()
            .or(self.type_field.as_deref())
            .unwrap_or("")
    }

    /// Whether an Error message means the session can never succeed.
    fn is_permanent_rejection(&self) -> bool {
        let reason = self.type_field.as_deref().unwrap_or("").to_ascii_lowercase();
        reason.contains("not_authorised")
            || reason.contains("not_authorized")
            || reason.contains("invalid_api_key")
            || reason.contains("invalid_model")
    }

    fn into_transcript(self, is_final: bool, session_id: &str) -> Option<TranscriptEvent> {
        let metadata = self.metadata?;
        let text = metadata.transcript?.trim().to_string();
        if text.is_empty() {
            return None;
        }

        if is_final {
            let started_at = metadata.words.first().and_then(|w| w.start_time);
            let ended_at = metadata.words.last().and_then(|w| w.end_time);
            Some(TranscriptEvent::Final(FinalTranscript {
                text,
                speaker: metadata.speaker,
                utterance_id: Uuid::new_v4().to_string(),
                started_at,
                ended_at,
                session_id: session_id.to_string(),
            }))
        } else {
            Some(TranscriptEvent::Partial {
                text,
                speaker: metadata.speaker,
                session_id: session_id.to_string(),
            })
        }
    }
}

/// Append the language to the WebSocket path unless already present.
fn augment_url_with_language(base_url: &str, language: &str) -> String {
    let language = language.trim();
    if language.is_empty() || base_url.ends_with(&format!("/{language}")) {
        return base_url.to_string();
    }
    format!("{}/{}", base_url.trim_end_matches('/'), language)
}

/// Keep the replay ring bounded to the configured window.
fn push_replay(replay: &mut VecDeque<AudioFrame>, frame: AudioFrame, capacity: usize) {
    while replay.len() >= capacity {
        replay.pop_front();
    }
    replay.push_back(frame);
}

/// Add up to 30% random jitter so reconnecting clients spread out.
fn with_jitter(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.3);
    base.mul_f64(factor)
}
