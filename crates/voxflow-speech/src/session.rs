//! Stream session: drives one utterance through chunker, provider link and
//! audio sink, reconnecting and resyncing when the provider drops.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use voxflow_core::config::{Config, TtsConfig};
use voxflow_core::error::{Result, VoxflowError};
use voxflow_core::types::{AudioChunk, CharacterLedger, SessionState, StreamItem, TextUnit};

use crate::alignment::compute_residual;
use crate::chunker::WordChunker;
use crate::link::ProviderLink;
use crate::playback::{AudioSink, Player, SinkStats};
use crate::retry::RetryPolicy;

/// Summary of a completed utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub utterance_id: Uuid,
    /// Connection attempts made, including the first.
    pub attempts: u32,
    /// Everything the producer submitted, in order.
    pub transcript: String,
    pub audio_chunks: usize,
    pub audio_bytes: usize,
}

/// Orchestrates one utterance at a time against the TTS provider.
pub struct StreamSession {
    tts: TtsConfig,
    api_key: String,
    retry: RetryPolicy,
    player: Arc<Player>,
    state: Arc<watch::Sender<SessionState>>,
}

impl StreamSession {
    /// Fails with a config error when no provider API key is available.
    pub fn new(config: &Config, player: Arc<Player>) -> Result<Self> {
        let tts = config.tts();
        let api_key = tts.resolve_api_key().ok_or_else(|| {
            VoxflowError::Config(format!(
                "no TTS API key (set tts.api_key or ${})",
                tts.api_key_env.as_deref().unwrap_or("ELEVENLABS_API_KEY")
            ))
        })?;
        let (state, _) = watch::channel(SessionState::Connecting);

        Ok(Self {
            tts,
            api_key,
            retry: RetryPolicy::new(config.retry()),
            player,
            state: Arc::new(state),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state");
        }
    }

    /// Speak everything the producer sends until its end marker.
    pub async fn speak(
        &self,
        producer: mpsc::UnboundedReceiver<StreamItem<String>>,
    ) -> Result<SessionReport> {
        let utterance_id = Uuid::new_v4();
        self.run(utterance_id, producer)
            .instrument(info_span!("utterance", id = %utterance_id))
            .await
    }

    async fn run(
        &self,
        utterance_id: Uuid,
        producer: mpsc::UnboundedReceiver<StreamItem<String>>,
    ) -> Result<SessionReport> {
        let mut producer = Some(producer);
        let mut residual = String::new();
        let mut transcript = String::new();
        let mut stats = SinkStats::default();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            self.set_state(SessionState::Connecting);
            info!(attempt = attempts, residual = residual.len(), "Connecting to provider");

            let link = match ProviderLink::connect(&self.tts, &self.api_key).await {
                Ok(link) => link,
                Err(e) => return self.fail(e).await,
            };
            self.set_state(SessionState::Streaming);

            let attempt = Attempt::launch(
                std::mem::take(&mut residual),
                producer.take(),
                self.player.clone(),
                self.state.clone(),
            );
            let outcome = link.run(attempt.units_rx, attempt.audio_tx.clone()).await;

            match outcome.result {
                Ok(()) => {
                    let feed = match attempt.stages.shutdown().await {
                        Ok(feed) => feed,
                        Err(e) => return self.fail(e).await,
                    };
                    transcript.push_str(&feed.fresh);
                    match attempt.sink.await {
                        Ok(Ok(sink_stats)) => stats.add(sink_stats),
                        Ok(Err(e)) => return self.fail(e).await,
                        Err(e) => return self.fail(VoxflowError::Other(e.into())).await,
                    }

                    self.set_state(SessionState::Completed);
                    info!(
                        attempts,
                        chunks = stats.chunks,
                        bytes = stats.bytes,
                        "Utterance completed"
                    );
                    return Ok(SessionReport {
                        utterance_id,
                        attempts,
                        transcript,
                        audio_chunks: stats.chunks,
                        audio_bytes: stats.bytes,
                    });
                }

                Err(e) if e.is_recoverable() => {
                    warn!(attempt = attempts, error = %e, "Provider connection dropped");
                    self.set_state(SessionState::Reconnecting);

                    // Play out what already arrived before tearing down.
                    let _ = attempt.audio_tx.send(StreamItem::End);
                    drop(attempt.audio_tx);
                    match attempt.sink.await {
                        Ok(Ok(sink_stats)) => stats.add(sink_stats),
                        Ok(Err(e)) => return self.fail(e).await,
                        Err(e) => return self.fail(VoxflowError::Other(e.into())).await,
                    }

                    let feed = match attempt.stages.shutdown().await {
                        Ok(feed) => feed,
                        Err(e) => return self.fail(e).await,
                    };
                    transcript.push_str(&feed.fresh);
                    producer = feed.producer;

                    let mut ledger = feed.ledger;
                    ledger.record_confirmed(outcome.confirmed);
                    residual = match compute_residual(&ledger.sent, &ledger.confirmed) {
                        Ok(residual) => residual,
                        Err(e) => return self.fail(e).await,
                    };

                    if residual.is_empty() && producer.is_none() {
                        self.set_state(SessionState::Completed);
                        info!(attempts, "Everything was voiced before the disconnect");
                        return Ok(SessionReport {
                            utterance_id,
                            attempts,
                            transcript,
                            audio_chunks: stats.chunks,
                            audio_bytes: stats.bytes,
                        });
                    }

                    let reconnect = attempts;
                    if !self.retry.allows(reconnect) {
                        return self
                            .fail(VoxflowError::RetriesExhausted {
                                attempts: self.retry.max_attempts(),
                            })
                            .await;
                    }
                    let delay = self.retry.delay(reconnect);
                    info!(
                        reconnect,
                        delay_ms = delay.as_millis() as u64,
                        residual = residual.len(),
                        live_producer = producer.is_some(),
                        "Reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }

                Err(e) => {
                    let _ = attempt.stages.shutdown().await;
                    drop(attempt.audio_tx);
                    let error = if attempt.sink.is_finished() {
                        match attempt.sink.await {
                            Ok(Err(sink_error)) => sink_error,
                            _ => e,
                        }
                    } else {
                        attempt.sink.abort();
                        let _ = attempt.sink.await;
                        e
                    };
                    return self.fail(error).await;
                }
            }
        }
    }

    async fn fail(&self, error: VoxflowError) -> Result<SessionReport> {
        if let Err(e) = self.player.stop().await {
            warn!(error = %e, "Failed to stop playback process");
        }
        self.set_state(SessionState::Failed);
        error!(error = %error, "Utterance failed");
        Err(error)
    }
}

/// Stage tasks of one connection attempt.
struct Attempt {
    units_rx: mpsc::UnboundedReceiver<StreamItem<TextUnit>>,
    audio_tx: mpsc::UnboundedSender<StreamItem<AudioChunk>>,
    sink: JoinHandle<Result<SinkStats>>,
    stages: TextStages,
}

/// Feed and chunker, the two stages upstream of the link.
struct TextStages {
    cancel: CancellationToken,
    feed: JoinHandle<FeedOutcome>,
    chunker: JoinHandle<()>,
}

impl Attempt {
    fn launch(
        residual: String,
        producer: Option<mpsc::UnboundedReceiver<StreamItem<String>>>,
        player: Arc<Player>,
        state: Arc<watch::Sender<SessionState>>,
    ) -> Self {
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (units_tx, units_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let feed = tokio::spawn(feed(residual, producer, text_tx, cancel.clone(), state));
        let chunker = tokio::spawn(WordChunker::new().run(text_rx, units_tx));
        let sink = tokio::spawn(AudioSink::new(player).run(audio_rx));

        Self {
            units_rx,
            audio_tx,
            sink,
            stages: TextStages {
                cancel,
                feed,
                chunker,
            },
        }
    }
}

impl TextStages {
    /// Stop both stages and wait until they have actually exited.
    async fn shutdown(self) -> Result<FeedOutcome> {
        self.cancel.cancel();
        let feed = self.feed.await.map_err(|e| VoxflowError::Other(e.into()))?;
        self.chunker.abort();
        let _ = self.chunker.await;
        Ok(feed)
    }
}

/// What the feed stage hands back when it stops.
#[derive(Debug)]
struct FeedOutcome {
    /// Characters submitted during this attempt.
    ledger: CharacterLedger,
    /// Producer text first seen during this attempt.
    fresh: String,
    /// The producer, if it has not yet sent its end marker.
    producer: Option<mpsc::UnboundedReceiver<StreamItem<String>>>,
}

/// Push the residual, then relay the live producer, recording every
/// character handed to the chunker.
async fn feed(
    residual: String,
    producer: Option<mpsc::UnboundedReceiver<StreamItem<String>>>,
    text_tx: mpsc::UnboundedSender<StreamItem<String>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
) -> FeedOutcome {
    let mut ledger = CharacterLedger::default();
    let mut fresh = String::new();

    if !residual.is_empty() {
        debug!(chars = residual.chars().count(), "Resubmitting residual text");
        ledger.record_sent(&residual);
        let _ = text_tx.send(StreamItem::Item(residual));
    }

    let Some(mut producer) = producer else {
        let _ = text_tx.send(StreamItem::End);
        enter_draining(&state);
        return FeedOutcome {
            ledger,
            fresh,
            producer: None,
        };
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return FeedOutcome { ledger, fresh, producer: Some(producer) };
            }
            item = producer.recv() => match item {
                Some(StreamItem::Item(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    ledger.record_sent(&fragment);
                    fresh.push_str(&fragment);
                    let _ = text_tx.send(StreamItem::Item(fragment));
                }
                Some(StreamItem::End) | None => {
                    let _ = text_tx.send(StreamItem::End);
                    enter_draining(&state);
                    debug!(chars = ledger.sent.len(), "Producer finished");
                    return FeedOutcome { ledger, fresh, producer: None };
                }
            },
        }
    }
}

/// Streaming moves to Draining once the producer is done. Any other state
/// (a reconnect already under way) is left alone.
fn enter_draining(state: &watch::Sender<SessionState>) {
    state.send_if_modified(|current| {
        if *current == SessionState::Streaming {
            *current = SessionState::Draining;
            true
        } else {
            false
        }
    });
}
