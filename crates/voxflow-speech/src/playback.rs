//! Audio playback through an external process fed on stdin.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, trace, warn};

use voxflow_core::config::PlaybackConfig;
use voxflow_core::error::{Result, VoxflowError};
use voxflow_core::types::{AudioChunk, StreamItem};

/// Handle to the single playback process.
///
/// Owned by the orchestrator and lent to each [`AudioSink`]. At most one
/// process is live at a time; `start` and `stop` are both idempotent.
#[derive(Debug)]
pub struct Player {
    program: PathBuf,
    args: Vec<String>,
    process: Mutex<Option<Child>>,
}

impl Player {
    /// Resolve the playback executable up front so a missing binary fails
    /// before any stage starts.
    pub fn new(config: &PlaybackConfig) -> Result<Self> {
        let program = find_executable(&config.command).ok_or_else(|| {
            VoxflowError::Config(format!(
                "playback executable '{}' not found on PATH",
                config.command
            ))
        })?;
        debug!(program = %program.display(), "Resolved playback executable");

        Ok(Self {
            program,
            args: config.args.clone(),
            process: Mutex::new(None),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub async fn is_running(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn the process unless one is already running.
    pub async fn start(&self) -> Result<()> {
        let mut process = self.process.lock().await;

        if let Some(child) = process.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => warn!(%status, "Playback process exited early, respawning"),
                Err(e) => warn!(error = %e, "Could not poll playback process, respawning"),
            }
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VoxflowError::Playback(format!("failed to spawn {}: {e}", self.program.display()))
            })?;

        info!(pid = ?child.id(), "Playback process started");
        *process = Some(child);
        Ok(())
    }

    /// Write one buffer to the process input and flush it.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut process = self.process.lock().await;
        let stdin = process
            .as_mut()
            .and_then(|child| child.stdin.as_mut())
            .ok_or_else(|| VoxflowError::Playback("playback process not started".into()))?;

        stdin
            .write_all(bytes)
            .await
            .map_err(|e| VoxflowError::Playback(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| VoxflowError::Playback(format!("flush failed: {e}")))?;
        Ok(())
    }

    /// Close the process input and wait for it to exit. No-op when idle.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.process.lock().await.take() else {
            return Ok(());
        };

        drop(child.stdin.take());
        let status = child
            .wait()
            .await
            .map_err(|e| VoxflowError::Playback(format!("wait failed: {e}")))?;
        info!(%status, "Playback process exited");
        Ok(())
    }
}

fn find_executable(command: &str) -> Option<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

/// Audio counters for one sink run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub chunks: usize,
    pub bytes: usize,
    /// A chunk flagged final by the provider came through.
    pub final_seen: bool,
}

impl SinkStats {
    pub(crate) fn add(&mut self, other: SinkStats) {
        self.chunks += other.chunks;
        self.bytes += other.bytes;
        self.final_seen |= other.final_seen;
    }
}

/// Pipeline stage writing decoded audio to the player in arrival order.
pub struct AudioSink {
    player: Arc<Player>,
}

impl AudioSink {
    pub fn new(player: Arc<Player>) -> Self {
        Self { player }
    }

    /// Drain the audio queue until its end marker, then stop the player.
    ///
    /// The player is only started once the first non-empty chunk arrives.
    pub async fn run(self, mut audio_rx: mpsc::UnboundedReceiver<StreamItem<AudioChunk>>) -> Result<SinkStats> {
        debug!("Audio sink started");
        let mut stats = SinkStats::default();

        loop {
            let chunk = match audio_rx.recv().await {
                Some(StreamItem::Item(chunk)) => chunk,
                Some(StreamItem::End) => break,
                None => {
                    warn!("Audio queue closed without an end marker");
                    break;
                }
            };
            if chunk.is_final {
                stats.final_seen = true;
                debug!(bytes = chunk.len(), "Final audio chunk");
            }
            if chunk.is_empty() {
                continue;
            }

            self.player.start().await?;
            self.player.write(&chunk.data).await?;
            stats.chunks += 1;
            stats.bytes += chunk.len();
            trace!(bytes = chunk.len(), "Wrote audio chunk");
        }

        self.player.stop().await?;
        debug!(
            chunks = stats.chunks,
            bytes = stats.bytes,
            final_seen = stats.final_seen,
            "Audio sink finished"
        );
        Ok(stats)
    }
}
