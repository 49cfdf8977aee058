//! Provider link: one streaming websocket connection to the TTS provider.
//!
//! Text units go out as JSON text frames; audio and alignment come back on
//! the same socket. A connection closed by the provider is reported as
//! [`VoxflowError::Disconnected`], the only condition the session retries.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use voxflow_core::config::TtsConfig;
use voxflow_core::error::{Result, VoxflowError};
use voxflow_core::protocol::{ClientFrame, ProviderFrame};
use voxflow_core::types::{AudioChunk, StreamItem, TextUnit};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Result of one connection attempt.
///
/// `confirmed` is handed back even when the attempt failed; it is what the
/// alignment tracker needs to find the resume point.
#[derive(Debug)]
pub struct LinkOutcome {
    pub confirmed: Vec<String>,
    pub result: Result<()>,
}

pub struct ProviderLink {
    socket: Socket,
}

impl ProviderLink {
    /// Open the socket and send the priming frame.
    pub async fn connect(config: &TtsConfig, api_key: &str) -> Result<Self> {
        let url = config.stream_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoxflowError::Config(format!("invalid provider URL {url}: {e}")))?;
        let key = HeaderValue::from_str(api_key)
            .map_err(|e| VoxflowError::Config(format!("invalid API key: {e}")))?;
        request.headers_mut().insert("xi-api-key", key);

        let (mut socket, _response) = connect_async(request)
            .await
            .map_err(|e| VoxflowError::Transport(format!("connect to {url} failed: {e}")))?;
        info!(voice = %config.voice_id, model = %config.model_id, "Connected to TTS provider");

        let priming = ClientFrame::priming(config.voice_settings, api_key).to_json()?;
        socket
            .send(Message::text(priming))
            .await
            .map_err(classify)?;
        debug!("Sent priming frame");

        Ok(Self { socket })
    }

    /// Run the send and receive loops until the provider's final frame or
    /// the first failure, then close the socket.
    pub async fn run(
        self,
        units_rx: mpsc::UnboundedReceiver<StreamItem<TextUnit>>,
        audio_tx: mpsc::UnboundedSender<StreamItem<AudioChunk>>,
    ) -> LinkOutcome {
        let (mut sink, mut stream) = self.socket.split();
        let mut confirmed = Vec::new();

        let result = {
            let send = send_loop(&mut sink, units_rx);
            let receive = receive_loop(&mut stream, &audio_tx, &mut confirmed);
            tokio::pin!(send, receive);

            tokio::select! {
                sent = &mut send => match sent {
                    Ok(()) => receive.await,
                    Err(e) => Err(e),
                },
                received = &mut receive => received,
            }
        };

        if let Err(e) = sink.close().await {
            trace!(error = %e, "Socket close after run");
        }
        debug!(confirmed = confirmed.len(), ok = result.is_ok(), "Provider link finished");

        LinkOutcome { confirmed, result }
    }
}

/// Forward text units as frames; the end marker becomes the empty-text frame.
pub async fn send_loop<S>(
    sink: &mut S,
    mut units_rx: mpsc::UnboundedReceiver<StreamItem<TextUnit>>,
) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    debug!("Send loop started");

    loop {
        let unit = match units_rx.recv().await {
            Some(StreamItem::Item(unit)) => unit,
            Some(StreamItem::End) => break,
            None => {
                warn!("Unit queue closed without an end marker");
                break;
            }
        };
        trace!(unit = %unit, "Sending unit");
        let frame = ClientFrame::text(unit.into_string()).to_json()?;
        sink.send(Message::text(frame)).await.map_err(classify)?;
    }

    let frame = ClientFrame::end_of_input().to_json()?;
    sink.send(Message::text(frame)).await.map_err(classify)?;
    debug!("Send loop finished, end of input sent");
    Ok(())
}

/// Decode provider frames into audio chunks and confirmed characters.
pub async fn receive_loop<St>(
    stream: &mut St,
    audio_tx: &mpsc::UnboundedSender<StreamItem<AudioChunk>>,
    confirmed: &mut Vec<String>,
) -> Result<()>
where
    St: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    debug!("Receive loop started");

    while let Some(message) = stream.next().await {
        let text = match message.map_err(classify)? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                    .unwrap_or_else(|| "no close frame".into());
                info!(%reason, "Provider closed the connection");
                return Err(VoxflowError::Disconnected(reason));
            }
            Message::Binary(data) => {
                debug!(bytes = data.len(), "Ignoring binary frame");
                continue;
            }
            _ => continue,
        };

        let frame = ProviderFrame::parse(text.as_str())
            .map_err(|e| VoxflowError::Transport(format!("malformed provider frame: {e}")))?;

        if let Some(error) = frame.provider_error() {
            return Err(VoxflowError::Transport(format!("provider error: {error}")));
        }

        if let Some(audio) = frame.audio_payload() {
            let data = BASE64
                .decode(audio)
                .map_err(|e| VoxflowError::Transport(format!("invalid audio payload: {e}")))?;
            trace!(bytes = data.len(), "Received audio");
            audio_tx
                .send(StreamItem::Item(AudioChunk::new(data, frame.is_final())))
                .map_err(|_| VoxflowError::Playback("audio sink stopped".into()))?;
        }

        let glyphs = frame.confirmed_chars();
        if !glyphs.is_empty() {
            trace!(count = glyphs.len(), "Characters confirmed");
            confirmed.extend_from_slice(glyphs);
        }

        if frame.is_final() {
            debug!("Provider sent final frame");
            let _ = audio_tx.send(StreamItem::End);
            return Ok(());
        }
    }

    Err(VoxflowError::Disconnected("stream ended".into()))
}

/// Map a websocket error onto the session's error taxonomy.
pub fn classify(error: WsError) -> VoxflowError {
    let closed = match &error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(
            ProtocolError::ResetWithoutClosingHandshake | ProtocolError::SendAfterClosing,
        ) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    };

    if closed {
        VoxflowError::Disconnected(error.to_string())
    } else {
        VoxflowError::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn text(json: &str) -> std::result::Result<Message, WsError> {
        Ok(Message::text(json.to_string()))
    }

    #[test]
    fn test_classify_closed_conditions() {
        assert!(classify(WsError::ConnectionClosed).is_recoverable());
        assert!(classify(WsError::AlreadyClosed).is_recoverable());
        assert!(
            classify(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake))
                .is_recoverable()
        );
        assert!(classify(WsError::Protocol(ProtocolError::SendAfterClosing)).is_recoverable());
        assert!(
            classify(WsError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe
            )))
            .is_recoverable()
        );
    }

    #[test]
    fn test_classify_other_errors_fatal() {
        let err = classify(WsError::Io(std::io::Error::from(
            std::io::ErrorKind::PermissionDenied,
        )));
        assert!(matches!(err, VoxflowError::Transport(_)));
        let err = classify(WsError::AttackAttempt);
        assert!(matches!(err, VoxflowError::Transport(_)));
    }

    #[tokio::test]
    async fn test_receive_decodes_audio_and_alignment() {
        let mut frames = stream::iter(vec![
            text(r#"{"audio":"AAEC","normalizedAlignment":{"chars":[" ","H","i"]},"isFinal":null}"#),
            Ok(Message::binary(vec![9, 9])),
            text(r#"{"audio":"AwQ=","normalizedAlignment":{"chars":[" "]}}"#),
            text(r#"{"audio":null,"isFinal":true}"#),
            text(r#"{"audio":"BQ=="}"#),
        ]);
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
        let mut confirmed = Vec::new();

        receive_loop(&mut frames, &audio_tx, &mut confirmed)
            .await
            .unwrap();

        assert_eq!(confirmed, vec![" ", "H", "i", " "]);
        assert_eq!(
            audio_rx.recv().await,
            Some(StreamItem::Item(AudioChunk::new(vec![0, 1, 2], false)))
        );
        assert_eq!(
            audio_rx.recv().await,
            Some(StreamItem::Item(AudioChunk::new(vec![3, 4], false)))
        );
        assert_eq!(audio_rx.recv().await, Some(StreamItem::End));
        assert!(audio_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receive_close_is_disconnect_and_keeps_confirmed() {
        let mut frames = stream::iter(vec![
            text(r#"{"audio":"AAEC","normalizedAlignment":{"chars":[" ","a"]}}"#),
            Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "going away".to_string().into(),
            }))),
        ]);
        let (audio_tx, _audio_rx) = mpsc::unbounded_channel();
        let mut confirmed = Vec::new();

        let err = receive_loop(&mut frames, &audio_tx, &mut confirmed)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(confirmed, vec![" ", "a"]);
    }

    #[tokio::test]
    async fn test_receive_stream_end_is_disconnect() {
        let mut frames = stream::iter(Vec::<std::result::Result<Message, WsError>>::new());
        let (audio_tx, _audio_rx) = mpsc::unbounded_channel();
        let err = receive_loop(&mut frames, &audio_tx, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_receive_provider_error_is_fatal() {
        let mut frames = stream::iter(vec![text(
            r#"{"message":"quota exceeded","error":"quota_exceeded","code":1008}"#,
        )]);
        let (audio_tx, _audio_rx) = mpsc::unbounded_channel();
        let err = receive_loop(&mut frames, &audio_tx, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VoxflowError::Transport(ref m) if m.contains("quota exceeded")));
    }

    #[tokio::test]
    async fn test_receive_malformed_frame_is_fatal() {
        let mut frames = stream::iter(vec![text("not json")]);
        let (audio_tx, _audio_rx) = mpsc::unbounded_channel();
        let err = receive_loop(&mut frames, &audio_tx, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_send_loop_frames_units_then_end() {
        let (frames_tx, frames_rx) = futures::channel::mpsc::unbounded::<Message>();
        let mut sink = frames_tx.sink_map_err(|_| WsError::ConnectionClosed);

        let (units_tx, units_rx) = mpsc::unbounded_channel();
        units_tx.send(StreamItem::Item(TextUnit::from_word("Hello"))).unwrap();
        units_tx.send(StreamItem::Item(TextUnit::from_word("there"))).unwrap();
        units_tx.send(StreamItem::End).unwrap();

        send_loop(&mut sink, units_rx).await.unwrap();
        drop(sink);

        let sent: Vec<String> = frames_rx
            .map(|m| m.to_text().unwrap().to_string())
            .collect()
            .await;
        assert_eq!(
            sent,
            vec![
                r#"{"text":"Hello ","try_trigger_generation":false}"#,
                r#"{"text":"there ","try_trigger_generation":false}"#,
                r#"{"text":""}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_send_failure_on_closed_socket_is_disconnect() {
        let (frames_tx, frames_rx) = futures::channel::mpsc::unbounded::<Message>();
        drop(frames_rx);
        let mut sink = frames_tx.sink_map_err(|_| WsError::ConnectionClosed);

        let (units_tx, units_rx) = mpsc::unbounded_channel();
        units_tx.send(StreamItem::Item(TextUnit::from_word("lost"))).unwrap();

        let err = send_loop(&mut sink, units_rx).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
