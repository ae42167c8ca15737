use std::{fmt::Display, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// Size the indeterminate estimate is scaled against when the server does
/// not announce a length.
const INDETERMINATE_SCALE_BYTES: f64 = 10.0 * 1024.0 * 1024.0;
const INDETERMINATE_CAP_PERCENT: f64 = 99.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Idle,
    Preparing,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl DownloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub elapsed: Duration,
    /// KiB per second since the previous sample.
    pub speed_kbps: f64,
}

#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub data: Bytes,
    pub size: u64,
    pub elapsed: Duration,
    pub average_kbps: f64,
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("download cancelled after {downloaded_bytes} bytes")]
    Cancelled { downloaded_bytes: u64 },
    #[error("download stream failed: {0}")]
    Stream(String),
    #[error("download session is {0:?}, not streaming")]
    NotStreaming(DownloadPhase),
}

/// Client-side bookkeeping for one transfer.
#[derive(Debug)]
pub struct DownloadSession {
    phase: DownloadPhase,
    total_bytes: Option<u64>,
    downloaded_bytes: u64,
    started_at: Instant,
    last_sample_at: Instant,
    last_sample_bytes: u64,
    buffer: BytesMut,
}

impl Default for DownloadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadSession {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            phase: DownloadPhase::Idle,
            total_bytes: None,
            downloaded_bytes: 0,
            started_at: now,
            last_sample_at: now,
            last_sample_bytes: 0,
            buffer: BytesMut::new(),
        }
    }

    pub fn phase(&self) -> DownloadPhase {
        self.phase
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn prepare(&mut self) {
        if self.phase == DownloadPhase::Idle {
            self.phase = DownloadPhase::Preparing;
        }
    }

    /// Starts the clock. A zero length is treated as unknown.
    pub fn begin_streaming(&mut self, total_bytes: Option<u64>) {
        if self.phase.is_terminal() {
            return;
        }

        let now = Instant::now();
        self.phase = DownloadPhase::Streaming;
        self.total_bytes = total_bytes.filter(|total| *total > 0);
        if let Some(total) = self.total_bytes {
            self.buffer.reserve(usize::try_from(total).unwrap_or(0));
        }
        self.started_at = now;
        self.last_sample_at = now;
        self.last_sample_bytes = 0;
    }

    pub fn percent(&self) -> f64 {
        match self.total_bytes {
            Some(total) => (self.downloaded_bytes as f64 / total as f64 * 100.0).min(100.0),
            None => (self.downloaded_bytes as f64 / INDETERMINATE_SCALE_BYTES * 100.0)
                .min(INDETERMINATE_CAP_PERCENT),
        }
    }

    /// Appends a chunk and returns a sample if the sampling interval has
    /// elapsed since the previous one.
    pub fn record_chunk(&mut self, chunk: &[u8]) -> Option<ProgressSample> {
        if self.phase != DownloadPhase::Streaming {
            return None;
        }

        self.buffer.extend_from_slice(chunk);
        self.downloaded_bytes += chunk.len() as u64;

        let now = Instant::now();
        let since_last = now.duration_since(self.last_sample_at);
        if since_last < SAMPLE_INTERVAL {
            return None;
        }

        let recent_bytes = self.downloaded_bytes - self.last_sample_bytes;
        let sample = ProgressSample {
            percent: self.percent(),
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            elapsed: now.duration_since(self.started_at),
            speed_kbps: kib_per_second(recent_bytes, since_last),
        };

        self.last_sample_at = now;
        self.last_sample_bytes = self.downloaded_bytes;
        Some(sample)
    }

    pub fn cancel(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = DownloadPhase::Cancelled;
            self.buffer = BytesMut::new();
        }
    }

    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = DownloadPhase::Failed;
            self.buffer = BytesMut::new();
        }
    }

    /// Hands the assembled payload over and marks the session completed.
    /// Only a streaming session can complete.
    pub fn finish(&mut self) -> Result<CompletedDownload, TrackError> {
        if self.phase != DownloadPhase::Streaming {
            return Err(TrackError::NotStreaming(self.phase));
        }

        let elapsed = self.started_at.elapsed();
        let data = std::mem::take(&mut self.buffer).freeze();
        let size = data.len() as u64;
        self.phase = DownloadPhase::Completed;

        Ok(CompletedDownload {
            data,
            size,
            elapsed,
            average_kbps: kib_per_second(size, elapsed),
        })
    }
}

fn kib_per_second(bytes: u64, over: Duration) -> f64 {
    let seconds = over.as_secs_f64();
    if seconds > 0.0 {
        bytes as f64 / 1024.0 / seconds
    } else {
        0.0
    }
}

/// Drives `session` over a response body until it ends, fails or `cancel`
/// fires. Cancellation is checked before every read and also interrupts a
/// read that is still waiting.
pub async fn track<S, E>(
    session: &mut DownloadSession,
    body: S,
    cancel: &CancellationToken,
    mut on_sample: impl FnMut(&ProgressSample),
) -> Result<CompletedDownload, TrackError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    match session.phase() {
        DownloadPhase::Streaming => {}
        DownloadPhase::Idle | DownloadPhase::Preparing => session.begin_streaming(None),
        phase => return Err(TrackError::NotStreaming(phase)),
    }

    let mut body = std::pin::pin!(body);

    loop {
        if cancel.is_cancelled() {
            session.cancel();
            debug!(
                downloaded_bytes = session.downloaded_bytes(),
                "Download cancelled"
            );
            return Err(TrackError::Cancelled {
                downloaded_bytes: session.downloaded_bytes(),
            });
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => continue,
            next = body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if let Some(sample) = session.record_chunk(&chunk) {
                    on_sample(&sample);
                }
            }
            Some(Err(error)) => {
                session.fail();
                return Err(TrackError::Stream(error.to_string()));
            }
            None => break,
        }
    }

    let completed = session.finish()?;
    on_sample(&ProgressSample {
        percent: 100.0,
        downloaded_bytes: completed.size,
        total_bytes: session.total_bytes(),
        elapsed: completed.elapsed,
        speed_kbps: completed.average_kbps,
    });

    Ok(completed)
}

pub fn format_speed(kbps: f64) -> String {
    if kbps >= 1024.0 {
        format!("{:.2} MB/s", kbps / 1024.0)
    } else {
        format!("{kbps:.0} KB/s")
    }
}

pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / 1_048_576.0)
}
