//! End-to-end fan-out tests: a scripted recognizer drives the pipeline and
//! the deliveries are observed on a local HTTP server standing in for the
//! caption endpoint and the webhook.

use axum::Router;
use axum::extract::{RawQuery, State};
use axum::routing::post;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transkribo::config::Settings;
use transkribo::pipeline::{FinalTranscript, Pipeline, TranscriptEvent};
use transkribo::stt::{MockBackend, TranscriptionBackend};

#[derive(Debug, Clone)]
struct CaptionPost {
    seq: String,
    body: String,
}

#[derive(Default)]
struct Captured {
    captions: Mutex<Vec<CaptionPost>>,
    webhook_messages: Mutex<Vec<String>>,
}

async fn caption_handler(
    State(captured): State<Arc<Captured>>,
    RawQuery(query): RawQuery,
    body: String,
) -> &'static str {
    let query = query.unwrap_or_default();
    let seq = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("seq="))
        .unwrap_or("")
        .to_string();
    captured.captions.lock().unwrap().push(CaptionPost { seq, body });
    "ok"
}

async fn webhook_handler(
    State(captured): State<Arc<Captured>>,
    axum::Json(payload): axum::Json<serde_json::Value>,
) -> &'static str {
    let content = payload["content"].as_str().unwrap_or_default().to_string();
    captured.webhook_messages.lock().unwrap().push(content);
    "ok"
}

/// Local endpoint standing in for the meeting platform and the webhook.
async fn spawn_capture_server() -> (SocketAddr, Arc<Captured>) {
    let captured = Arc::new(Captured::default());
    let app = Router::new()
        .route("/cc", post(caption_handler))
        .route("/hook", post(webhook_handler))
        .with_state(Arc::clone(&captured));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("test server address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    (addr, captured)
}

fn final_event(text: &str) -> TranscriptEvent {
    TranscriptEvent::Final(FinalTranscript {
        text: text.to_string(),
        speaker: None,
        utterance_id: format!("utt-{text}"),
        started_at: None,
        ended_at: None,
        session_id: "sess-test".to_string(),
    })
}

fn base_settings(extra: &[(&str, &str)]) -> Settings {
    let mut map = HashMap::new();
    map.insert("TRANSCRIPTION_BACKEND".to_string(), "cloud".to_string());
    map.insert(
        "CLOUD_API_KEY".to_string(),
        "sk-test-key-0123456789".to_string(),
    );
    map.insert(
        "CLOUD_CONNECTION_URL".to_string(),
        "wss://rt.example.com/v2".to_string(),
    );
    map.insert("WEB_UI_ENABLED".to_string(), "false".to_string());
    for (key, value) in extra {
        map.insert(key.to_string(), value.to_string());
    }
    Settings::from_map(&map).expect("test settings")
}

async fn run_pipeline_until_quiet(settings: Settings, backend: Arc<dyn TranscriptionBackend>) {
    let shutdown = CancellationToken::new();
    let run = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { Pipeline::new(settings).run(backend, shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(1500)).await;
    shutdown.cancel();
    run.await
        .expect("pipeline task join")
        .expect("pipeline result");
}

#[tokio::test]
async fn happy_path_reaches_caption_log_and_webhook() {
    let (addr, captured) = spawn_capture_server().await;
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("meeting.log");

    let settings = base_settings(&[
        ("CAPTION_POST_URL", &format!("http://{addr}/cc")),
        ("CAPTION_MIN_POST_INTERVAL_SECONDS", "0.2"),
        ("TRANSCRIPT_LOG_PATH", &log_path.display().to_string()),
        ("WEBHOOK_ENABLED", "true"),
        ("WEBHOOK_URL", &format!("http://{addr}/hook")),
        ("WEBHOOK_FLUSH_INTERVAL", "0.2"),
    ]);

    let backend = Arc::new(
        MockBackend::new()
            .with_event(
                0,
                TranscriptEvent::Partial {
                    text: "Bonan".to_string(),
                    speaker: None,
                    session_id: "sess-test".to_string(),
                },
            )
            .with_event(0, final_event("Bonan tagon.")),
    );
    run_pipeline_until_quiet(settings, backend).await;

    // Caption endpoint: exactly one POST, body is the final, seq starts at 1.
    let captions = captured.captions.lock().unwrap().clone();
    assert_eq!(captions.len(), 1);
    assert_eq!(captions[0].seq, "1");
    assert_eq!(captions[0].body, "Bonan tagon.");

    // Transcript log: one timestamped line; the partial never lands there.
    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("[-] Bonan tagon."));

    // Webhook: a single batched message with the Esperanto section.
    let messages = captured.webhook_messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0], "Esperanto:\nBonan tagon.");
}

#[tokio::test]
async fn caption_posts_coalesce_under_min_interval() {
    let (addr, captured) = spawn_capture_server().await;

    let settings = base_settings(&[
        ("CAPTION_POST_URL", &format!("http://{addr}/cc")),
        ("CAPTION_MIN_POST_INTERVAL_SECONDS", "0.3"),
    ]);

    let backend = Arc::new(
        MockBackend::new()
            .with_event(0, final_event("A."))
            .with_event(0, final_event("B."))
            .with_event(0, final_event("C.")),
    );
    run_pipeline_until_quiet(settings, backend).await;

    let captions = captured.captions.lock().unwrap().clone();

    // Either the first final posts alone and the rest coalesce, or all three
    // coalesce into the first post; never three separate posts.
    assert!(captions.len() <= 2, "expected coalescing, got {captions:?}");
    let joined: Vec<String> = captions.iter().map(|c| c.body.clone()).collect();
    assert_eq!(joined.join("\n"), "A.\nB.\nC.");

    // The sequence advances by one per successful POST, starting at 1.
    let seqs: Vec<&str> = captions.iter().map(|c| c.seq.as_str()).collect();
    match captions.len() {
        1 => assert_eq!(seqs, ["1"]),
        _ => assert_eq!(seqs, ["1", "2"]),
    }
}

#[tokio::test]
async fn webhook_holds_fragment_until_sentence_completes() {
    let (addr, captured) = spawn_capture_server().await;

    let settings = base_settings(&[
        ("WEBHOOK_ENABLED", "true"),
        ("WEBHOOK_URL", &format!("http://{addr}/hook")),
        ("WEBHOOK_FLUSH_INTERVAL", "0.4"),
    ]);

    // "Saluton" carries no terminator; "amiko." completes the sentence
    // within the flush window, so both land in one message.
    let backend = Arc::new(
        MockBackend::new()
            .with_event(0, final_event("Saluton"))
            .with_event(0, final_event("amiko.")),
    );
    run_pipeline_until_quiet(settings, backend).await;

    let messages = captured.webhook_messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0], "Esperanto:\nSaluton\namiko.");
}

#[tokio::test]
async fn sinks_observe_finals_in_emission_order() {
    let (addr, captured) = spawn_capture_server().await;
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("meeting.log");

    let texts = ["Unu.", "Du.", "Tri.", "Kvar.", "Kvin."];
    let mut backend = MockBackend::new();
    for text in texts {
        backend = backend.with_event(0, final_event(text));
    }

    let settings = base_settings(&[
        ("CAPTION_POST_URL", &format!("http://{addr}/cc")),
        ("CAPTION_MIN_POST_INTERVAL_SECONDS", "0.1"),
        ("TRANSCRIPT_LOG_PATH", &log_path.display().to_string()),
        ("WEBHOOK_ENABLED", "true"),
        ("WEBHOOK_URL", &format!("http://{addr}/hook")),
        ("WEBHOOK_FLUSH_INTERVAL", "0.2"),
    ]);
    run_pipeline_until_quiet(settings, Arc::new(backend)).await;

    // Transcript log preserves emission order.
    let contents = std::fs::read_to_string(&log_path).unwrap();
    let logged: Vec<&str> = contents
        .lines()
        .map(|line| line.rsplit("] ").next().unwrap())
        .collect();
    assert_eq!(logged, texts);

    // Caption posts, concatenated in arrival order, equal the emission order.
    let captions = captured.captions.lock().unwrap().clone();
    let caption_lines: Vec<String> = captions
        .iter()
        .flat_map(|c| c.body.lines().map(str::to_string).collect::<Vec<_>>())
        .collect();
    assert_eq!(caption_lines, texts);

    // The webhook batch preserves order too.
    let messages = captured.webhook_messages.lock().unwrap().clone();
    let webhook_lines: Vec<&str> = messages
        .iter()
        .flat_map(|m| m.lines())
        .filter(|line| !line.ends_with(':'))
        .collect();
    assert_eq!(webhook_lines, texts);
}
