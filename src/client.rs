use std::path::Path;

use reqwest::{StatusCode, header::CONTENT_DISPOSITION};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{
    api::{InfoRequest, InfoResponse, VideoRequest},
    classifier::download_filename,
    progress::{CompletedDownload, DownloadSession, ProgressSample, TrackError, track},
    selector::QualityRequest,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server address: {0}")]
    ServerUrl(#[from] url::ParseError),
    #[error("{message} ({status})")]
    Api { status: StatusCode, message: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("download stream failed: {0}")]
    Stream(String),
    #[error("download cancelled after {downloaded_bytes} bytes")]
    Cancelled { downloaded_bytes: u64 },
}

impl From<TrackError> for ClientError {
    fn from(error: TrackError) -> Self {
        match error {
            TrackError::Cancelled { downloaded_bytes } => Self::Cancelled { downloaded_bytes },
            TrackError::Stream(message) => Self::Stream(message),
            error @ TrackError::NotStreaming(_) => Self::Stream(error.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct DownloadedVideo {
    pub filename: String,
    pub completed: CompletedDownload,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
}

/// Talks to a running relay server over HTTP.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_http(http, Url::parse(base_url)?))
    }

    pub fn with_http(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    pub async fn fetch_info(&self, video_url: &str) -> Result<InfoResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint("/api/download/info")?)
            .json(&InfoRequest {
                url: Some(video_url.to_string()),
            })
            .send()
            .await?;

        let response = ensure_success(response).await?;
        Ok(response.json::<InfoResponse>().await?)
    }

    /// Fetches the title, then streams the video into memory while `session`
    /// tracks progress. The session ends `Cancelled` when `cancel` fires.
    pub async fn download(
        &self,
        video_url: &str,
        quality: Option<&str>,
        session: &mut DownloadSession,
        cancel: &CancellationToken,
        on_sample: impl FnMut(&ProgressSample),
    ) -> Result<DownloadedVideo, ClientError> {
        session.prepare();

        let prepared = async {
            let info = self.fetch_info(video_url).await?;
            let response = self
                .http
                .post(self.endpoint("/api/download/video")?)
                .json(&VideoRequest {
                    url: Some(video_url.to_string()),
                    quality: quality.map(ToString::to_string),
                })
                .send()
                .await?;
            let response = ensure_success(response).await?;
            Ok::<_, ClientError>((info, response))
        };

        let (info, response) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                session.cancel();
                return Err(ClientError::Cancelled { downloaded_bytes: 0 });
            }
            prepared = prepared => match prepared {
                Ok(prepared) => prepared,
                Err(error) => {
                    session.fail();
                    return Err(error);
                }
            },
        };

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| {
                let label = QualityRequest::parse(quality)
                    .map(|quality| quality.label())
                    .unwrap_or_else(|_| "highest".to_string());
                download_filename(&info.info.title, &label)
            });
        let total_bytes = response.content_length();
        debug!("Streaming {filename} with length {total_bytes:?}");

        session.begin_streaming(total_bytes);
        let completed = track(session, response.bytes_stream(), cancel, on_sample).await?;

        Ok(DownloadedVideo {
            filename,
            completed,
        })
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorPayload>(&body)
        .map(|payload| payload.error)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        });

    Err(ClientError::Api { status, message })
}

/// Reads the plain `filename="..."` parameter of a Content-Disposition value.
fn filename_from_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"'))
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
}
