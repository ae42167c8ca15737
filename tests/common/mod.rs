#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{Router, extract::connect_info::MockConnectInfo};
use bytes::Bytes;
use futures::StreamExt;
use shorts_relay::{
    api::{AppState, build_router},
    config::AppConfig,
    credential::Attempt,
    error::RelayError,
    extractor::{ByteStream, VideoDetails, VideoExtractor},
    selector::StreamDescriptor,
};

pub fn muxed(format_id: &str, height: u32, bitrate: u64) -> StreamDescriptor {
    StreamDescriptor {
        container: "mp4".to_string(),
        bitrate: Some(bitrate),
        height: Some(height),
        has_video: true,
        has_audio: true,
        format_id: format_id.to_string(),
    }
}

pub fn video_only(format_id: &str, height: u32) -> StreamDescriptor {
    StreamDescriptor {
        has_audio: false,
        ..muxed(format_id, height, 5_000_000)
    }
}

pub fn details(title: &str, formats: Vec<StreamDescriptor>) -> VideoDetails {
    VideoDetails {
        title: title.to_string(),
        duration_seconds: Some(42),
        thumbnail: Some("https://i.ytimg.com/vi/abc123/hq.jpg".to_string()),
        author: Some("Shorts Channel".to_string()),
        view_count: Some(1234),
        formats,
    }
}

enum FakeInfo {
    Details(VideoDetails),
    Unavailable,
}

/// Serves canned metadata and a fixed list of chunks.
pub struct FakeExtractor {
    info: FakeInfo,
    chunks: Vec<&'static str>,
    opened_formats: Arc<std::sync::Mutex<Vec<String>>>,
    info_calls: Arc<AtomicUsize>,
}

impl FakeExtractor {
    pub fn serving(details: VideoDetails, chunks: &[&'static str]) -> Self {
        Self {
            info: FakeInfo::Details(details),
            chunks: chunks.to_vec(),
            opened_formats: Arc::default(),
            info_calls: Arc::default(),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            info: FakeInfo::Unavailable,
            chunks: Vec::new(),
            opened_formats: Arc::default(),
            info_calls: Arc::default(),
        }
    }

    pub fn opened_formats(&self) -> Arc<std::sync::Mutex<Vec<String>>> {
        self.opened_formats.clone()
    }

    pub fn info_calls(&self) -> Arc<AtomicUsize> {
        self.info_calls.clone()
    }
}

#[async_trait]
impl VideoExtractor for FakeExtractor {
    async fn fetch_info(
        &self,
        _url: &str,
        _attempt: Attempt<'_>,
    ) -> Result<VideoDetails, RelayError> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        match &self.info {
            FakeInfo::Details(details) => Ok(details.clone()),
            FakeInfo::Unavailable => Err(RelayError::VideoUnavailable(
                "ERROR: [youtube] abc123: Private video".to_string(),
            )),
        }
    }

    async fn open_stream(
        &self,
        _url: &str,
        format: &StreamDescriptor,
        _attempt: Attempt<'_>,
    ) -> Result<ByteStream, RelayError> {
        if let Ok(mut opened) = self.opened_formats.lock() {
            opened.push(format.format_id.clone());
        }

        let chunks = self.chunks.clone();
        Ok(futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes()))),
        )
        .boxed())
    }
}

pub fn test_config(static_dir: &Path, max_requests: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.static_dir = static_dir.to_path_buf();
    config.rate_limit_max_requests = max_requests;
    config.rate_limit_window = Duration::from_secs(15 * 60);
    config
}

pub fn router(extractor: FakeExtractor, config: &AppConfig) -> Router {
    let state = AppState::new(config, Arc::new(extractor));
    build_router(config, state)
        .unwrap()
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))))
}
