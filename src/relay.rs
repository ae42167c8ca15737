use std::{io, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, timeout, timeout_at},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{
    credential::{Attempt, UpstreamCredential},
    error::RelayError,
    extractor::{ByteStream, VideoExtractor, relay_error_from_io},
    selector::StreamDescriptor,
};

const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Upper bound on the wait for the first upstream chunk.
    pub connect_timeout: Duration,
    /// Upper bound on the gap between two upstream chunks.
    pub idle_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECONDS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    ClientDisconnected,
    Failed,
}

/// An open relay: `body` is handed to the HTTP response, `task` owns the
/// upstream stream until the transfer ends one way or another.
pub struct RelayHandle {
    pub body: ReceiverStream<io::Result<Bytes>>,
    pub task: JoinHandle<RelayOutcome>,
}

/// Opens the upstream stream for `format` and starts forwarding it.
///
/// Returns only once the first upstream chunk has arrived, so every failure
/// reported here happens before any response header is written. Later
/// failures abort the body instead.
pub async fn open_relay(
    extractor: &dyn VideoExtractor,
    url: &str,
    format: &StreamDescriptor,
    credential: &UpstreamCredential,
    settings: &RelaySettings,
) -> Result<RelayHandle, RelayError> {
    let (upstream, first_chunk) = open_upstream(extractor, url, format, credential, settings).await?;

    let relay_id = Uuid::new_v4();
    let (sender, receiver) = mpsc::channel(settings.channel_capacity.max(1));
    let span = info_span!("relay", %relay_id, format_id = %format.format_id);
    let task = tokio::spawn(
        forward(upstream, first_chunk, sender, settings.idle_timeout).instrument(span),
    );

    Ok(RelayHandle {
        body: ReceiverStream::new(receiver),
        task,
    })
}

async fn open_upstream(
    extractor: &dyn VideoExtractor,
    url: &str,
    format: &StreamDescriptor,
    credential: &UpstreamCredential,
    settings: &RelaySettings,
) -> Result<(ByteStream, Bytes), RelayError> {
    let mut last_error = None;

    for attempt in credential.attempts() {
        match await_first_chunk(extractor, url, format, attempt, settings.connect_timeout).await {
            Ok(opened) => return Ok(opened),
            Err(error) => {
                if attempt.is_authenticated() {
                    warn!("Authenticated upstream stream failed, retrying without cookies: {error}");
                }
                last_error = Some(error);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| RelayError::RelayFailure("no upstream attempt was made".to_string())))
}

async fn await_first_chunk(
    extractor: &dyn VideoExtractor,
    url: &str,
    format: &StreamDescriptor,
    attempt: Attempt<'_>,
    connect_timeout: Duration,
) -> Result<(ByteStream, Bytes), RelayError> {
    let deadline = Instant::now() + connect_timeout;
    let mut upstream = extractor.open_stream(url, format, attempt).await?;

    loop {
        match timeout_at(deadline, upstream.next()).await {
            Err(_) => {
                return Err(RelayError::RelayFailure(format!(
                    "upstream sent no data within {}s",
                    connect_timeout.as_secs()
                )));
            }
            Ok(None) => {
                return Err(RelayError::RelayFailure(
                    "upstream ended before sending any data".to_string(),
                ));
            }
            Ok(Some(Err(error))) => return Err(relay_error_from_io(error)),
            Ok(Some(Ok(chunk))) if chunk.is_empty() => continue,
            Ok(Some(Ok(chunk))) => return Ok((upstream, chunk)),
        }
    }
}

async fn forward(
    mut upstream: ByteStream,
    first_chunk: Bytes,
    sender: mpsc::Sender<io::Result<Bytes>>,
    idle_timeout: Duration,
) -> RelayOutcome {
    let mut relayed = first_chunk.len() as u64;
    if sender.send(Ok(first_chunk)).await.is_err() {
        debug!("Client went away before the first chunk was delivered");
        return RelayOutcome::ClientDisconnected;
    }

    let outcome = loop {
        let next = tokio::select! {
            _ = sender.closed() => break RelayOutcome::ClientDisconnected,
            next = timeout(idle_timeout, upstream.next()) => next,
        };

        match next {
            Err(_) => {
                warn!("Upstream stalled for {}s, aborting", idle_timeout.as_secs());
                let _ = sender
                    .send(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "upstream idle timeout",
                    )))
                    .await;
                break RelayOutcome::Failed;
            }
            Ok(None) => break RelayOutcome::Completed,
            Ok(Some(Ok(chunk))) => {
                relayed += chunk.len() as u64;
                if sender.send(Ok(chunk)).await.is_err() {
                    break RelayOutcome::ClientDisconnected;
                }
            }
            Ok(Some(Err(error))) => {
                warn!("Upstream stream failed mid-transfer: {error}");
                let _ = sender.send(Err(error)).await;
                break RelayOutcome::Failed;
            }
        }
    };

    drop(upstream);
    info!(?outcome, relayed_bytes = relayed, "Relay finished");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use crate::extractor::VideoDetails;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn endless(flag: Arc<AtomicBool>) -> ByteStream {
        stream::unfold(DropFlag(flag), |guard| async move {
            Some((Ok(Bytes::from_static(b"0123456789")), guard))
        })
        .boxed()
    }

    fn stalls_after_first(flag: Arc<AtomicBool>) -> ByteStream {
        stream::unfold((DropFlag(flag), false), |(guard, sent)| async move {
            if sent {
                futures::future::pending::<()>().await;
            }
            Some((Ok(Bytes::from_static(b"first")), (guard, true)))
        })
        .boxed()
    }

    fn chunks(parts: &[&'static str]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|part| Ok(Bytes::from_static(part.as_bytes())))
            .collect();
        stream::iter(items).boxed()
    }

    fn only_empty_chunks() -> ByteStream {
        stream::unfold((), |()| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Some((Ok(Bytes::new()), ()))
        })
        .boxed()
    }

    struct FakeUpstream {
        attempts: Mutex<Vec<bool>>,
        streams: Mutex<VecDeque<Result<ByteStream, RelayError>>>,
    }

    impl FakeUpstream {
        fn new(streams: Vec<Result<ByteStream, RelayError>>) -> Self {
            Self {
                attempts: Mutex::new(Vec::new()),
                streams: Mutex::new(streams.into()),
            }
        }
    }

    #[async_trait]
    impl VideoExtractor for FakeUpstream {
        async fn fetch_info(
            &self,
            _url: &str,
            _attempt: Attempt<'_>,
        ) -> Result<VideoDetails, RelayError> {
            Err(RelayError::RelayFailure("not used".into()))
        }

        async fn open_stream(
            &self,
            _url: &str,
            _format: &StreamDescriptor,
            attempt: Attempt<'_>,
        ) -> Result<ByteStream, RelayError> {
            self.attempts.lock().unwrap().push(attempt.is_authenticated());
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RelayError::RelayFailure("exhausted".into())))
        }
    }

    fn format() -> StreamDescriptor {
        StreamDescriptor {
            container: "mp4".into(),
            bitrate: Some(500_000),
            height: Some(720),
            has_video: true,
            has_audio: true,
            format_id: "22".into(),
        }
    }

    async fn collect(handle: RelayHandle) -> (Vec<io::Result<Bytes>>, RelayOutcome) {
        let items: Vec<_> = handle.body.collect().await;
        let outcome = handle.task.await.unwrap();
        (items, outcome)
    }

    #[tokio::test]
    async fn forwards_every_chunk_in_order() {
        let upstream = FakeUpstream::new(vec![Ok(chunks(&["ab", "", "cd", "ef"]))]);
        let handle = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &RelaySettings::default(),
        )
        .await
        .unwrap();

        let (items, outcome) = collect(handle).await;
        let body: Vec<u8> = items
            .into_iter()
            .flat_map(|item| item.unwrap().to_vec())
            .collect();
        assert_eq!(body, b"abcdef");
        assert_eq!(outcome, RelayOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_chunks_do_not_extend_the_connect_deadline() {
        let upstream = FakeUpstream::new(vec![Ok(only_empty_chunks())]);
        let settings = RelaySettings {
            connect_timeout: Duration::from_secs(5),
            ..RelaySettings::default()
        };

        let started = Instant::now();
        let result = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &settings,
        )
        .await;

        assert!(matches!(result, Err(RelayError::RelayFailure(_))));
        assert!(started.elapsed() <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn client_disconnect_releases_upstream() {
        let released = Arc::new(AtomicBool::new(false));
        let upstream = FakeUpstream::new(vec![Ok(endless(released.clone()))]);
        let mut handle = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &RelaySettings::default(),
        )
        .await
        .unwrap();

        assert!(handle.body.next().await.is_some());
        drop(handle.body);

        assert_eq!(handle.task.await.unwrap(), RelayOutcome::ClientDisconnected);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disconnect_is_noticed_while_upstream_is_quiet() {
        let released = Arc::new(AtomicBool::new(false));
        let upstream = FakeUpstream::new(vec![Ok(stalls_after_first(released.clone()))]);
        let settings = RelaySettings {
            idle_timeout: Duration::from_secs(3600),
            ..RelaySettings::default()
        };
        let mut handle = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &settings,
        )
        .await
        .unwrap();

        assert_eq!(
            handle.body.next().await.unwrap().unwrap(),
            Bytes::from_static(b"first")
        );
        drop(handle.body);

        assert_eq!(handle.task.await.unwrap(), RelayOutcome::ClientDisconnected);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_upstream_aborts_the_body() {
        let released = Arc::new(AtomicBool::new(false));
        let upstream = FakeUpstream::new(vec![Ok(stalls_after_first(released.clone()))]);
        let settings = RelaySettings {
            idle_timeout: Duration::from_secs(5),
            ..RelaySettings::default()
        };
        let handle = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &settings,
        )
        .await
        .unwrap();

        let (items, outcome) = collect(handle).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(
            items[1].as_ref().unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(outcome, RelayOutcome::Failed);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mid_stream_failure_is_forwarded_as_body_error() {
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ])
        .boxed();
        let upstream = FakeUpstream::new(vec![Ok(failing)]);
        let handle = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &RelaySettings::default(),
        )
        .await
        .unwrap();

        let (items, outcome) = collect(handle).await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
        assert_eq!(outcome, RelayOutcome::Failed);
    }

    #[tokio::test]
    async fn failure_before_first_chunk_keeps_its_type() {
        let failing = stream::iter(vec![Err(io::Error::other(RelayError::VideoUnavailable(
            "Private video".into(),
        )))])
        .boxed();
        let upstream = FakeUpstream::new(vec![Ok(failing)]);
        let result = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &RelaySettings::default(),
        )
        .await;

        assert!(matches!(result, Err(RelayError::VideoUnavailable(_))));
    }

    #[tokio::test]
    async fn empty_upstream_is_a_relay_failure() {
        let upstream = FakeUpstream::new(vec![Ok(chunks(&[]))]);
        let result = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &RelaySettings::default(),
        )
        .await;

        assert!(matches!(result, Err(RelayError::RelayFailure(_))));
    }

    #[tokio::test]
    async fn rejected_cookies_fall_back_to_one_anonymous_attempt() {
        let upstream = FakeUpstream::new(vec![
            Err(RelayError::RelayFailure("403 with cookies".into())),
            Ok(chunks(&["video"])),
        ]);
        let handle = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::with_cookies("cookies.txt"),
            &RelaySettings::default(),
        )
        .await
        .unwrap();

        let (_, outcome) = collect(handle).await;
        assert_eq!(outcome, RelayOutcome::Completed);
        assert_eq!(*upstream.attempts.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn anonymous_failure_is_not_retried() {
        let upstream = FakeUpstream::new(vec![
            Err(RelayError::RelayFailure("first".into())),
            Ok(chunks(&["never"])),
        ]);
        let result = open_relay(
            &upstream,
            "https://youtu.be/x",
            &format(),
            &UpstreamCredential::anonymous(),
            &RelaySettings::default(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(*upstream.attempts.lock().unwrap(), vec![false]);
    }
}
