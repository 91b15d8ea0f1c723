//! Caption board tests with a live WebSocket client.

use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use transkribo::config::{TranslationSettings, WebSettings};
use transkribo::sinks::{BroadcastMessage, CaptionWebServer};

fn web_settings() -> WebSettings {
    WebSettings {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: 0,
        open_browser: false,
        web_root: std::path::PathBuf::from("web"),
    }
}

fn translation_settings() -> TranslationSettings {
    TranslationSettings {
        enabled: true,
        targets: vec!["ja".to_string()],
        ..TranslationSettings::default()
    }
}

async fn next_json(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for broadcast")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("broadcast is JSON");
        }
    }
}

#[tokio::test]
async fn client_receives_partial_then_final_with_translations() {
    let server = CaptionWebServer::start(&web_settings(), &translation_settings())
        .await
        .unwrap();

    let url = format!("ws://127.0.0.1:{}/ws", server.port());
    let (ws, _) = connect_async(url).await.expect("ws connect");
    let (_sink, mut stream) = ws.split();

    // Wait for the connection handler to register the client queue.
    for _ in 0..50 {
        if server.client_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.client_count(), 1);

    server.broadcast(&BroadcastMessage::Partial {
        text: "Bonan".to_string(),
        speaker: None,
    });
    let mut translations = HashMap::new();
    translations.insert("ja".to_string(), "こんにちは。".to_string());
    server.broadcast(&BroadcastMessage::Final {
        text: "Bonan tagon.".to_string(),
        speaker: Some("S1".to_string()),
        translations,
    });

    let partial = next_json(&mut stream).await;
    assert_eq!(partial["type"], "partial");
    assert_eq!(partial["text"], "Bonan");

    let final_message = next_json(&mut stream).await;
    assert_eq!(final_message["type"], "final");
    assert_eq!(final_message["text"], "Bonan tagon.");
    assert_eq!(final_message["speaker"], "S1");
    assert_eq!(final_message["translations"]["ja"], "こんにちは。");

    server.stop();
}

#[tokio::test]
async fn config_endpoint_reports_targets_and_visibility() {
    let mut translation = translation_settings();
    translation
        .default_visibility
        .insert("ja".to_string(), false);
    let server = CaptionWebServer::start(&web_settings(), &translation)
        .await
        .unwrap();

    let url = format!("http://127.0.0.1:{}/config", server.port());
    let payload: serde_json::Value = reqwest::get(&url)
        .await
        .expect("config request")
        .json()
        .await
        .expect("config json");

    assert_eq!(payload["targets"][0], "ja");
    assert_eq!(payload["defaultVisibility"]["ja"], false);

    server.stop();
}

#[tokio::test]
async fn disconnected_client_is_forgotten() {
    let server = CaptionWebServer::start(&web_settings(), &translation_settings())
        .await
        .unwrap();

    let url = format!("ws://127.0.0.1:{}/ws", server.port());
    let (ws, _) = connect_async(url).await.expect("ws connect");
    for _ in 0..50 {
        if server.client_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.client_count(), 1);

    drop(ws);
    for _ in 0..50 {
        if server.client_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.client_count(), 0);

    server.stop();
}
