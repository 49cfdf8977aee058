//! Session integration tests against a loopback mock provider and a shell player.
//!
//! Run with: `cargo test -p voxflow-speech --test session`

use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use voxflow_core::config::{Config, PlaybackConfig};
use voxflow_core::error::VoxflowError;
use voxflow_core::types::{SessionState, StreamItem};
use voxflow_speech::StreamSession;
use voxflow_speech::playback::Player;

/// How the mock provider treats one connection.
#[derive(Debug, Clone, Copy)]
enum Script {
    /// Voice every unit, then answer end of input with a final frame.
    Complete,
    /// Voice this many units, then close the connection.
    DropAfter(usize),
    /// Answer the first unit with a provider error frame.
    ErrorOnFirstUnit,
}

/// What one connection received.
#[derive(Debug, Clone, Default)]
struct Connection {
    api_key_header: Option<String>,
    priming: Option<Value>,
    texts: Vec<String>,
}

type Connections = Arc<Mutex<Vec<Connection>>>;

/// Start a mock provider. Connection `n` follows `scripts[n]`, or the last
/// script once they run out. Audio for unit `k` on connection `n` is the
/// two bytes `{'A' + n}{k}`.
async fn start_provider(scripts: Vec<Script>) -> (String, Connections) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections: Connections = Arc::default();

    let recorded = connections.clone();
    tokio::spawn(async move {
        let mut index = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            let script = scripts[index.min(scripts.len() - 1)];
            let letter = (b'A' + index as u8) as char;
            index += 1;
            tokio::spawn(serve(stream, script, letter, recorded.clone()));
        }
    });

    (format!("ws://{addr}"), connections)
}

async fn serve(stream: TcpStream, script: Script, letter: char, connections: Connections) {
    let header = Arc::new(Mutex::new(None));
    let captured = header.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *captured.lock().unwrap() = req
            .headers()
            .get("xi-api-key")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Ok(resp)
    };
    let mut ws = accept_hdr_async(stream, callback).await.unwrap();

    let slot = {
        let mut connections = connections.lock().unwrap();
        connections.push(Connection {
            api_key_header: header.lock().unwrap().clone(),
            ..Connection::default()
        });
        connections.len() - 1
    };

    let mut units = 0usize;
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();

        if connections.lock().unwrap()[slot].priming.is_none() {
            connections.lock().unwrap()[slot].priming = Some(frame);
            if let Script::DropAfter(0) = script {
                let _ = ws.close(None).await;
                return;
            }
            continue;
        }

        let unit = frame["text"].as_str().unwrap().to_string();
        connections.lock().unwrap()[slot].texts.push(unit.clone());

        if unit.is_empty() {
            let _ = ws
                .send(Message::text(json!({"audio": null, "isFinal": true}).to_string()))
                .await;
            let _ = ws.close(None).await;
            return;
        }

        if let Script::ErrorOnFirstUnit = script {
            let error = json!({"message": "quota exceeded", "error": "quota_exceeded", "code": 1008});
            let _ = ws.send(Message::text(error.to_string())).await;
            let _ = ws.close(None).await;
            return;
        }

        units += 1;
        let mut chars: Vec<String> = if units == 1 { vec![" ".into()] } else { vec![] };
        chars.extend(unit.chars().map(String::from));
        let audio = BASE64.encode(format!("{letter}{units}"));
        let reply = json!({
            "audio": audio,
            "isFinal": null,
            "normalizedAlignment": {"chars": chars},
        });
        let _ = ws.send(Message::text(reply.to_string())).await;

        if let Script::DropAfter(n) = script {
            if units == n {
                let _ = ws.close(None).await;
                return;
            }
        }
    }
}

fn config(base_url: &str) -> Config {
    serde_json::from_value(json!({
        "tts": {
            "base_url": base_url,
            "voice_id": "test-voice",
            "api_key": "test-key",
        },
        "retry": {
            "max_attempts": 2,
            "initial_delay_ms": 1,
            "max_delay_ms": 5,
            "jitter": false,
        },
    }))
    .unwrap()
}

fn player(out: &Path) -> Arc<Player> {
    Arc::new(
        Player::new(&PlaybackConfig {
            command: "sh".into(),
            args: vec!["-c".into(), format!("cat >> '{}'", out.display())],
        })
        .unwrap(),
    )
}

fn producer(fragments: &[&str]) -> mpsc::UnboundedReceiver<StreamItem<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    for fragment in fragments {
        tx.send(StreamItem::Item(fragment.to_string())).unwrap();
    }
    tx.send(StreamItem::End).unwrap();
    rx
}

#[tokio::test]
async fn test_speaks_whole_utterance() {
    let (url, connections) = start_provider(vec![Script::Complete]).await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("audio.raw");

    let session = StreamSession::new(&config(&url), player(&out)).unwrap();
    let report = session
        .speak(producer(&["Hel", "lo wor", "ld"]))
        .await
        .unwrap();

    assert_eq!(report.attempts, 1);
    assert_eq!(report.transcript, "Hello world");
    assert_eq!(report.audio_chunks, 2);
    assert_eq!(report.audio_bytes, 4);
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "A1A2");

    let connections = connections.lock().unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].texts, vec!["Hello ", "world ", ""]);
    assert_eq!(connections[0].api_key_header.as_deref(), Some("test-key"));

    let priming = connections[0].priming.as_ref().unwrap();
    assert_eq!(priming["text"], " ");
    assert_eq!(priming["xi_api_key"], "test-key");
    assert_eq!(priming["voice_settings"]["stability"], 0.70);
    assert_eq!(priming["voice_settings"]["similarity_boost"], 0.75);
}

#[tokio::test]
async fn test_disconnect_resends_only_unconfirmed_units() {
    let (url, connections) = start_provider(vec![Script::DropAfter(3), Script::Complete]).await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("audio.raw");

    let session = StreamSession::new(&config(&url), player(&out)).unwrap();
    let mut states = session.subscribe();
    let report = session
        .speak(producer(&["one tw", "o three fo", "ur five"]))
        .await
        .unwrap();

    assert_eq!(report.attempts, 2);
    assert_eq!(report.transcript, "one two three four five");
    assert_eq!(report.audio_chunks, 5);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "A1A2A3B1B2");
    assert_eq!(*states.borrow_and_update(), SessionState::Completed);

    let connections = connections.lock().unwrap();
    assert_eq!(connections.len(), 2);
    assert_eq!(&connections[0].texts[..3], ["one ", "two ", "three "]);
    assert_eq!(connections[1].texts, vec!["four ", "five ", ""]);
}

#[tokio::test]
async fn test_text_produced_after_disconnect_is_spoken() {
    let (url, connections) = start_provider(vec![Script::DropAfter(1), Script::Complete]).await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("audio.raw");

    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(StreamItem::Item("one two ".to_string())).unwrap();
    let late = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        tx.send(StreamItem::Item("three four".to_string())).unwrap();
        tx.send(StreamItem::End).unwrap();
    });

    let session = StreamSession::new(&config(&url), player(&out)).unwrap();
    let report = session.speak(rx).await.unwrap();
    late.await.unwrap();

    assert_eq!(report.attempts, 2);
    assert_eq!(report.transcript, "one two three four");
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "A1B1B2B3");

    let connections = connections.lock().unwrap();
    assert_eq!(connections.len(), 2);
    assert_eq!(connections[0].texts[0], "one ");
    assert_eq!(connections[1].texts, vec!["two ", "three ", "four ", ""]);
}

#[tokio::test]
async fn test_reconnect_budget_exhausted() {
    let (url, connections) = start_provider(vec![Script::DropAfter(0)]).await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("audio.raw");

    let session = StreamSession::new(&config(&url), player(&out)).unwrap();
    let err = session
        .speak(producer(&["never spoken"]))
        .await
        .unwrap_err();

    assert!(matches!(err, VoxflowError::RetriesExhausted { attempts: 2 }));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(connections.lock().unwrap().len(), 3);
    assert!(!out.exists());
}

#[tokio::test]
async fn test_provider_error_frame_fails_without_retry() {
    let (url, connections) = start_provider(vec![Script::ErrorOnFirstUnit]).await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("audio.raw");

    let session = StreamSession::new(&config(&url), player(&out)).unwrap();
    let err = session
        .speak(producer(&["hello there"]))
        .await
        .unwrap_err();

    assert!(matches!(err, VoxflowError::Transport(ref m) if m.contains("quota exceeded")));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(connections.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unreachable_provider_is_fatal() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let session = StreamSession::new(
        &config(&format!("ws://{addr}")),
        player(&dir.path().join("audio.raw")),
    )
    .unwrap();
    let err = session.speak(producer(&["hi"])).await.unwrap_err();

    assert!(matches!(err, VoxflowError::Transport(_)));
    assert_eq!(session.state(), SessionState::Failed);
}
