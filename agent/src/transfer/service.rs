//! Resumable transfer service
//!
//! A transfer resumes from the destination's current size: a destination larger
//! than the source is treated as corrupt and restarted from zero, an equal size
//! is a no-op. Chunks are retried in place before an attempt is abandoned, and
//! whole attempts are retried on a fresh remote session.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::AgentError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::storage::settings::TransferSettings;
use crate::transfer::path::{normalize_remote_path, remote_parent};
use crate::transfer::remote::{
    local_size, open_local_read, open_local_write, BoxedReader, BoxedWriter, RemoteSession,
    RemoteStore,
};
use crate::transfer::sink::{ProgressSink, TransferOutcome, TransferProgress};

/// Transfer tuning
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: usize,
    pub chunk_retries: u32,
    pub chunk_retry_delay: Duration,
    pub max_attempts: u32,
    pub attempt_delay: Duration,
    pub progress_step_percent: u8,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from(&TransferSettings::default())
    }
}

impl From<&TransferSettings> for TransferOptions {
    fn from(settings: &TransferSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size_bytes.max(1),
            chunk_retries: settings.chunk_retries,
            chunk_retry_delay: Duration::from_millis(settings.chunk_retry_delay_ms),
            max_attempts: settings.max_attempts.max(1),
            attempt_delay: Duration::from_secs(settings.attempt_delay_secs),
            progress_step_percent: settings.progress_step_percent.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Download,
    Upload,
}

/// One side of a transfer
enum Endpoint<'a> {
    Local(&'a Path),
    Remote {
        session: &'a dyn RemoteSession,
        path: &'a str,
    },
}

impl Endpoint<'_> {
    async fn size(&self) -> Result<Option<u64>, AgentError> {
        match self {
            Endpoint::Local(path) => local_size(path).await,
            Endpoint::Remote { session, path } => session.size(path).await,
        }
    }

    async fn open_read(&self, offset: u64) -> Result<BoxedReader, AgentError> {
        match self {
            Endpoint::Local(path) => open_local_read(path, offset).await,
            Endpoint::Remote { session, path } => session.open_read(path, offset).await,
        }
    }

    async fn open_write(&self, offset: u64) -> Result<BoxedWriter, AgentError> {
        match self {
            Endpoint::Local(path) => open_local_write(path, offset).await,
            Endpoint::Remote { session, path } => session.open_write(path, offset).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Endpoint::Local(path) => path.display().to_string(),
            Endpoint::Remote { path, .. } => format!("remote:{}", path),
        }
    }
}

/// Reports progress only when it advanced by at least `step` percent, or hit 100.
#[derive(Debug)]
pub struct ProgressThrottle {
    step: u8,
    last: Option<u8>,
}

impl ProgressThrottle {
    pub fn new(step: u8) -> Self {
        Self {
            step: step.max(1),
            last: None,
        }
    }

    pub fn should_report(&mut self, percent: u8) -> bool {
        let report = match self.last {
            None => true,
            Some(last) => percent >= last.saturating_add(self.step) || (percent == 100 && last < 100),
        };
        if report {
            self.last = Some(percent);
        }
        report
    }
}

/// State of one attempt: sizes, resume offset and progress bookkeeping
struct TransferSession {
    total: u64,
    transferred: u64,
    throttle: ProgressThrottle,
}

/// Resumable upload/download against a [`RemoteStore`]
pub struct TransferService {
    store: Arc<dyn RemoteStore>,
    options: TransferOptions,
}

impl TransferService {
    pub fn new(store: Arc<dyn RemoteStore>, options: TransferOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Fetch `remote_path` into `local_path`, resuming a partial local file.
    pub async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, AgentError> {
        let remote_path = normalize_remote_path(remote_path);
        self.run(Direction::Download, local_path, &remote_path, sink, cancel)
            .await
    }

    /// Send `local_path` to `remote_path`, resuming a partial remote file.
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, AgentError> {
        let remote_path = normalize_remote_path(remote_path);
        self.run(Direction::Upload, local_path, &remote_path, sink, cancel)
            .await
    }

    async fn run(
        &self,
        direction: Direction,
        local_path: &Path,
        remote_path: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, AgentError> {
        let policy = RetryPolicy::fixed(self.options.max_attempts, self.options.attempt_delay);

        let result = retry_with_backoff(
            &policy,
            |delay| pause(delay, cancel),
            |attempt| {
                if attempt > 0 {
                    info!(
                        "Retrying {:?} of {} (attempt {}/{})",
                        direction,
                        remote_path,
                        attempt + 1,
                        self.options.max_attempts
                    );
                }
                self.attempt(direction, local_path, remote_path, sink, cancel)
            },
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(AgentError::Cancelled) => {
                info!("{:?} of {} cancelled", direction, remote_path);
                return Err(AgentError::Cancelled);
            }
            Err(e) => {
                error!("{:?} of {} failed: {}", direction, remote_path, e);
                TransferOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        sink.finished(&outcome).await;
        Ok(outcome)
    }

    async fn attempt(
        &self,
        direction: Direction,
        local_path: &Path,
        remote_path: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let session = self.store.connect().await?;
        let remote = Endpoint::Remote {
            session: session.as_ref(),
            path: remote_path,
        };
        let local = Endpoint::Local(local_path);
        let (source, dest) = match direction {
            Direction::Download => (remote, local),
            Direction::Upload => (local, remote),
        };

        let total = source.size().await?.ok_or_else(|| {
            AgentError::TransferError(format!("{} does not exist", source.describe()))
        })?;

        let offset = match dest.size().await? {
            Some(existing) if existing == total => {
                info!("{} already transferred ({} bytes)", dest.describe(), total);
                return Ok(TransferOutcome::AlreadyTransferred { bytes: total });
            }
            Some(existing) if existing > total => {
                warn!(
                    "{} is larger than its source ({} > {}), restarting from zero",
                    dest.describe(),
                    existing,
                    total
                );
                0
            }
            Some(existing) => existing,
            None => 0,
        };

        match direction {
            Direction::Download => {
                if let Some(parent) = local_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            Direction::Upload => {
                if let Some(parent) = remote_parent(remote_path) {
                    session.create_dir_all(&parent).await?;
                }
            }
        }

        if offset > 0 {
            info!("Resuming {} at byte {} of {}", dest.describe(), offset, total);
        }

        let mut state = TransferSession {
            total,
            transferred: offset,
            throttle: ProgressThrottle::new(self.options.progress_step_percent),
        };
        let mut streams: Option<(BoxedReader, BoxedWriter)> = None;
        let mut buffer = vec![0u8; self.options.chunk_size];

        if total == 0 {
            // Materialize the empty destination
            let mut writer = dest.open_write(0).await?;
            writer.shutdown().await?;
        }

        while state.transferred < state.total {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let len = (state.total - state.transferred).min(buffer.len() as u64) as usize;
            let mut failures = 0;
            loop {
                match copy_chunk(&source, &dest, &mut streams, state.transferred, &mut buffer[..len]).await {
                    Ok(()) => break,
                    Err(e) => {
                        failures += 1;
                        // Reopen at the chunk start on the next try
                        streams = None;
                        if failures > self.options.chunk_retries {
                            return Err(e);
                        }
                        warn!(
                            "Chunk at byte {} failed ({}), retry {}/{}",
                            state.transferred, e, failures, self.options.chunk_retries
                        );
                        pause(self.options.chunk_retry_delay, cancel).await;
                        if cancel.is_cancelled() {
                            return Err(AgentError::Cancelled);
                        }
                    }
                }
            }

            state.transferred += len as u64;
            let progress = TransferProgress::new(state.transferred, state.total);
            if state.throttle.should_report(progress.percent) {
                sink.progress(progress).await;
            }
        }

        if let Some((_, mut writer)) = streams.take() {
            writer.shutdown().await?;
        }

        debug!("Copied {} bytes to {}", total - offset, dest.describe());
        Ok(TransferOutcome::Completed {
            bytes: total - offset,
        })
    }
}

/// Read one chunk from `source` and write it to `dest` at `offset`, opening
/// both streams first when needed.
async fn copy_chunk(
    source: &Endpoint<'_>,
    dest: &Endpoint<'_>,
    streams: &mut Option<(BoxedReader, BoxedWriter)>,
    offset: u64,
    buffer: &mut [u8],
) -> Result<(), AgentError> {
    if streams.is_none() {
        let reader = source.open_read(offset).await?;
        let writer = dest.open_write(offset).await?;
        *streams = Some((reader, writer));
    }

    let Some((reader, writer)) = streams.as_mut() else {
        return Err(AgentError::Internal("transfer streams missing".to_string()));
    };

    reader.read_exact(buffer).await?;
    writer.write_all(buffer).await?;
    // A reopened writer truncates to the chunk start, so nothing may still be in flight
    writer.flush().await?;
    Ok(())
}

async fn pause(delay: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
