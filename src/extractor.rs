use std::{io, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
    credential::{Attempt, UpstreamCredential},
    error::{RelayError, UNSUPPORTED_PLATFORM_MESSAGE},
    selector::StreamDescriptor,
};

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Metadata for one video together with the formats it can be served in.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoDetails {
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub thumbnail: Option<String>,
    pub author: Option<String>,
    pub view_count: Option<u64>,
    pub formats: Vec<StreamDescriptor>,
}

/// The upstream collaborator that knows how to talk to a video platform.
#[async_trait]
pub trait VideoExtractor: Send + Sync {
    async fn fetch_info(
        &self,
        url: &str,
        attempt: Attempt<'_>,
    ) -> Result<VideoDetails, RelayError>;

    /// Opens a byte stream for `format`. Failures that only surface once the
    /// upstream starts producing output are yielded as stream errors wrapping
    /// a [`RelayError`].
    async fn open_stream(
        &self,
        url: &str,
        format: &StreamDescriptor,
        attempt: Attempt<'_>,
    ) -> Result<ByteStream, RelayError>;
}

/// Fetches metadata, retrying once without the credential if the
/// authenticated request fails.
pub async fn fetch_info_with_fallback(
    extractor: &dyn VideoExtractor,
    url: &str,
    credential: &UpstreamCredential,
) -> Result<VideoDetails, RelayError> {
    let mut last_error = None;

    for attempt in credential.attempts() {
        match extractor.fetch_info(url, attempt).await {
            Ok(details) => return Ok(details),
            Err(error) => {
                if attempt.is_authenticated() {
                    warn!("Authenticated metadata request failed, retrying without cookies: {error}");
                }
                last_error = Some(error);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| RelayError::RelayFailure("no upstream attempt was made".to_string())))
}

/// Recovers the typed failure carried inside a stream error, if any.
pub fn relay_error_from_io(error: io::Error) -> RelayError {
    match error.into_inner() {
        Some(inner) => match inner.downcast::<RelayError>() {
            Ok(relay_error) => *relay_error,
            Err(other) => RelayError::RelayFailure(other.to_string()),
        },
        None => RelayError::RelayFailure("upstream stream failed".to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<YtDlpThumbnail>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<u64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    tbr: Option<f64>,
}

impl From<YtDlpFormat> for StreamDescriptor {
    fn from(format: YtDlpFormat) -> Self {
        Self {
            container: format.ext.unwrap_or_default(),
            bitrate: format
                .tbr
                .filter(|tbr| tbr.is_finite() && *tbr > 0.0)
                .map(|tbr| (tbr * 1000.0).round() as u64),
            height: format.height,
            has_video: codec_present(format.vcodec.as_deref()),
            has_audio: codec_present(format.acodec.as_deref()),
            format_id: format.format_id,
        }
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if value != "none")
}

fn details_from_json(stdout: &[u8]) -> Result<VideoDetails, RelayError> {
    let info: YtDlpVideoInfo = serde_json::from_slice(stdout).map_err(|error| {
        RelayError::RelayFailure(format!("could not parse yt-dlp metadata: {error}"))
    })?;

    let thumbnail = info
        .thumbnail
        .or_else(|| info.thumbnails.into_iter().rev().find_map(|item| item.url));

    Ok(VideoDetails {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Video".to_string()),
        duration_seconds: info
            .duration
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value.round() as u64),
        thumbnail,
        author: info.uploader.or(info.channel),
        view_count: info.view_count,
        formats: info.formats.into_iter().map(StreamDescriptor::from).collect(),
    })
}

fn last_error_line(stderr: &str) -> &str {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp failed without output")
}

fn classify_failure(stderr: &str) -> RelayError {
    let message = last_error_line(stderr).to_string();
    let lower = stderr.to_ascii_lowercase();

    const UNAVAILABLE_MARKERS: [&str; 6] = [
        "private video",
        "video unavailable",
        "has been removed",
        "this video is not available",
        "members-only",
        "does not exist",
    ];

    if UNAVAILABLE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        RelayError::VideoUnavailable(message)
    } else if lower.contains("unsupported url") {
        debug!("yt-dlp rejected the URL: {message}");
        RelayError::UnsupportedPlatform(UNSUPPORTED_PLATFORM_MESSAGE.to_string())
    } else {
        RelayError::RelayFailure(message)
    }
}

/// Extractor backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: PathBuf,
    info_timeout: Duration,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<PathBuf>, info_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            info_timeout,
        }
    }

    fn command(&self, mut args: Vec<String>, attempt: Attempt<'_>, url: &str) -> Command {
        if let Some(cookies) = attempt.cookies() {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args.push("--".to_string());
        args.push(url.to_string());

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, error: io::Error) -> RelayError {
        if error.kind() == io::ErrorKind::NotFound {
            RelayError::RelayFailure(format!(
                "{} is not installed or not on PATH",
                self.binary.display()
            ))
        } else {
            RelayError::RelayFailure(format!("could not run {}: {error}", self.binary.display()))
        }
    }
}

#[async_trait]
impl VideoExtractor for YtDlpExtractor {
    async fn fetch_info(
        &self,
        url: &str,
        attempt: Attempt<'_>,
    ) -> Result<VideoDetails, RelayError> {
        let args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        let output = timeout(self.info_timeout, self.command(args, attempt, url).output())
            .await
            .map_err(|_| RelayError::RelayFailure("yt-dlp metadata request timed out".to_string()))?
            .map_err(|error| self.spawn_error(error))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("yt-dlp metadata stderr: {stderr}");
            return Err(classify_failure(&stderr));
        }

        details_from_json(&output.stdout)
    }

    async fn open_stream(
        &self,
        url: &str,
        format: &StreamDescriptor,
        attempt: Attempt<'_>,
    ) -> Result<ByteStream, RelayError> {
        let args = vec![
            "-f".to_string(),
            format.format_id.clone(),
            "-o".to_string(),
            "-".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-part".to_string(),
            "--quiet".to_string(),
        ];

        let mut child = self
            .command(args, attempt, url)
            .spawn()
            .map_err(|error| self.spawn_error(error))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::RelayFailure("yt-dlp stdout was not captured".to_string()))?;
        let stderr = child.stderr.take().map(|pipe| {
            tokio::spawn(async move {
                let mut collected = String::new();
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("yt-dlp: {line}");
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let process = UpstreamProcess {
            child,
            stdout: ReaderStream::new(stdout),
            stderr,
        };

        let stream = futures::stream::unfold(Some(process), |state| async move {
            let mut process = state?;
            match process.next_chunk().await {
                Some(Ok(chunk)) => Some((Ok(chunk), Some(process))),
                Some(Err(error)) => Some((Err(error), None)),
                None => None,
            }
        });

        Ok(stream.boxed())
    }
}

/// A running `yt-dlp` child writing the video to stdout. Dropping it kills
/// the process.
struct UpstreamProcess {
    child: Child,
    stdout: ReaderStream<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
}

impl UpstreamProcess {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if let Some(item) = self.stdout.next().await {
            return Some(item);
        }

        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(error) => return Some(Err(error)),
        };
        if status.success() {
            return None;
        }

        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        warn!("yt-dlp exited with {status}: {}", last_error_line(&stderr));
        Some(Err(io::Error::other(classify_failure(&stderr))))
    }
}
