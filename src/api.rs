use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use anyhow::anyhow;
use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit, Request, State, rejection::JsonRejection},
    handler::HandlerWithoutStateExt,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{
            ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CACHE_CONTROL, CONTENT_DISPOSITION,
            CONTENT_LENGTH, CONTENT_RANGE, CONTENT_SECURITY_POLICY, CONTENT_TYPE, RANGE,
            REFERRER_POLICY, STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS,
            X_DNS_PREFETCH_CONTROL, X_FRAME_OPTIONS,
        },
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    classifier::{Platform, VideoReference, classify, download_filename, validate_format},
    config::AppConfig,
    credential::UpstreamCredential,
    error::{ApiError, RelayError, UNSUPPORTED_PLATFORM_MESSAGE},
    extractor::{VideoExtractor, fetch_info_with_fallback},
    rate_limit::{RateDecision, RateLimiter, client_key},
    relay::{RelaySettings, open_relay},
    selector::{QualityRequest, select_format},
};

const JSON_BODY_LIMIT: usize = 100 * 1024;
const CORS_MAX_AGE_SECONDS: u64 = 24 * 60 * 60;
const INVALID_URL_MESSAGE: &str = "Please provide a valid video URL";
const INSTAGRAM_DOWNLOAD_MESSAGE: &str =
    "Instagram download coming soon. Currently only YouTube Shorts are supported.";
const INFO_FAILURE_MESSAGE: &str = "Failed to fetch video information. Please try again.";
const DOWNLOAD_FAILURE_MESSAGE: &str = "Failed to download video. Please try again.";
const CONTENT_SECURITY_POLICY_VALUE: &str = "default-src 'self'; \
    style-src 'self' 'unsafe-inline' https://cdn.jsdelivr.net; \
    script-src 'self' 'unsafe-inline'; \
    img-src 'self' data: https: blob:; \
    media-src 'self' blob: https:; \
    connect-src 'self' *";

const RATELIMIT_LIMIT: &str = "ratelimit-limit";
const RATELIMIT_REMAINING: &str = "ratelimit-remaining";
const RATELIMIT_RESET: &str = "ratelimit-reset";

#[derive(Clone)]
pub struct AppState {
    extractor: Arc<dyn VideoExtractor>,
    credential: Arc<UpstreamCredential>,
    relay: Arc<RelaySettings>,
    rate_limiter: Arc<RateLimiter>,
    trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(config: &AppConfig, extractor: Arc<dyn VideoExtractor>) -> Self {
        Self {
            extractor,
            credential: Arc::new(config.credential.clone()),
            relay: Arc::new(config.relay.clone()),
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit_window,
                config.rate_limit_max_requests,
            )),
            trust_proxy_headers: config.trust_proxy_headers,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoRequest {
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VideoRequest {
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub success: bool,
    pub platform: Platform,
    pub info: VideoInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VideoInfo {
    fn instagram_placeholder() -> Self {
        Self {
            title: "Instagram Reel".to_string(),
            platform: Some(Platform::Instagram),
            message: Some("Instagram download will be available soon".to_string()),
            ..Self::default()
        }
    }
}

pub fn build_router(config: &AppConfig, state: AppState) -> anyhow::Result<Router> {
    let cors = build_cors_layer(&config.allowed_origins)?;

    let download_routes = Router::new()
        .route("/info", post(video_info))
        .route("/video", post(download_video))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ));

    let static_files = ServeDir::new(&config.static_dir)
        .call_fallback_on_method_not_allowed(true)
        .not_found_service(endpoint_not_found.into_service());

    let router = Router::new()
        .route("/api/health", get(health))
        .nest("/api/download", download_routes)
        .fallback_service(static_files)
        .with_state(state)
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT));

    Ok(with_security_headers(router)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

fn with_security_headers(router: Router) -> Router {
    let headers = [
        (CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY_VALUE),
        (
            HeaderName::from_static("cross-origin-resource-policy"),
            "cross-origin",
        ),
        (X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (X_FRAME_OPTIONS, "SAMEORIGIN"),
        (REFERRER_POLICY, "no-referrer"),
        (X_DNS_PREFETCH_CONTROL, "off"),
        (STRICT_TRANSPORT_SECURITY, "max-age=15552000; includeSubDomains"),
    ];

    headers.into_iter().fold(router, |router, (name, value)| {
        router.layer(SetResponseHeaderLayer::if_not_present(
            name,
            HeaderValue::from_static(value),
        ))
    })
}

fn build_cors_layer(configured: &[String]) -> anyhow::Result<CorsLayer> {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::HEAD])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, RANGE, ACCEPT, ACCEPT_ENCODING])
        .expose_headers([CONTENT_LENGTH, CONTENT_TYPE, CONTENT_DISPOSITION, CONTENT_RANGE])
        .max_age(std::time::Duration::from_secs(CORS_MAX_AGE_SECONDS));

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set, accepting requests from any origin.");
        return Ok(base.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                anyhow!("Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com")
            })
        })
        .collect::<anyhow::Result<HashSet<_>>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(base.allow_origin(allow_origin))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

async fn enforce_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer, state.trust_proxy_headers);
    let limiter = &state.rate_limiter;

    match limiter.check(&key).await {
        RateDecision::Limited {
            retry_after_seconds,
        } => {
            warn!("Rate limit exceeded for {key}");
            let mut response = ApiError::too_many_requests(
                retry_after_seconds,
                limiter.window_label().to_string(),
            )
            .into_response();
            insert_rate_limit_headers(
                response.headers_mut(),
                limiter.max_requests(),
                0,
                retry_after_seconds,
            );
            response
        }
        RateDecision::Allowed {
            remaining,
            reset_after_seconds,
        } => {
            let mut response = next.run(request).await;
            insert_rate_limit_headers(
                response.headers_mut(),
                limiter.max_requests(),
                remaining,
                reset_after_seconds,
            );
            response
        }
    }
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: u64) {
    headers.insert(HeaderName::from_static(RATELIMIT_LIMIT), HeaderValue::from(limit));
    headers.insert(
        HeaderName::from_static(RATELIMIT_REMAINING),
        HeaderValue::from(remaining),
    );
    headers.insert(HeaderName::from_static(RATELIMIT_RESET), HeaderValue::from(reset));
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "OK",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn endpoint_not_found() -> ApiError {
    ApiError::not_found("Endpoint not found")
}

fn validate_request(url: Option<&str>) -> Result<VideoReference, RelayError> {
    let url = url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RelayError::InvalidInput(INVALID_URL_MESSAGE.to_string()))?;

    let platform = classify(url)
        .ok_or_else(|| RelayError::UnsupportedPlatform(UNSUPPORTED_PLATFORM_MESSAGE.to_string()))?;

    if !validate_format(url, platform) {
        return Err(RelayError::InvalidInput(format!(
            "Invalid {platform} URL format"
        )));
    }

    Ok(VideoReference {
        url: url.to_string(),
        platform,
    })
}

async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> Result<Json<InfoResponse>, ApiError> {
    let Json(request) = payload.map_err(|_| ApiError::bad_request(INVALID_URL_MESSAGE))?;
    let reference = validate_request(request.url.as_deref())
        .map_err(|error| ApiError::from_relay(error, INFO_FAILURE_MESSAGE))?;

    if reference.platform == Platform::Instagram {
        return Ok(Json(InfoResponse {
            success: true,
            platform: reference.platform,
            info: VideoInfo::instagram_placeholder(),
        }));
    }

    let details =
        fetch_info_with_fallback(state.extractor.as_ref(), &reference.url, &state.credential)
            .await
            .map_err(|error| {
                warn!("Error fetching video info for {:?}: {error}", reference.url);
                ApiError::from_relay(error, INFO_FAILURE_MESSAGE)
            })?;

    Ok(Json(InfoResponse {
        success: true,
        platform: reference.platform,
        info: VideoInfo {
            title: details.title,
            duration: details.duration_seconds,
            thumbnail: details.thumbnail,
            author: details.author,
            view_count: details.view_count,
            platform: None,
            message: None,
        },
    }))
}

async fn download_video(
    State(state): State<AppState>,
    payload: Result<Json<VideoRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|_| ApiError::bad_request(INVALID_URL_MESSAGE))?;

    prepare_download(&state, request).await.map_err(|error| {
        warn!("Error downloading video: {error}");
        ApiError::from_relay(error, DOWNLOAD_FAILURE_MESSAGE)
    })
}

async fn prepare_download(state: &AppState, request: VideoRequest) -> Result<Response, RelayError> {
    let reference = validate_request(request.url.as_deref())?;
    if reference.platform != Platform::YouTube {
        return Err(RelayError::UnsupportedPlatform(
            INSTAGRAM_DOWNLOAD_MESSAGE.to_string(),
        ));
    }

    let quality = QualityRequest::parse(request.quality.as_deref())?;
    let details =
        fetch_info_with_fallback(state.extractor.as_ref(), &reference.url, &state.credential)
            .await?;
    let format = select_format(&details.formats, &quality)?;
    info!(
        "Relaying {:?} as format {} ({}, {:?}p) for quality {quality}",
        reference.url, format.format_id, format.container, format.height
    );

    let relay = open_relay(
        state.extractor.as_ref(),
        &reference.url,
        format,
        &state.credential,
        &state.relay,
    )
    .await?;

    let filename = download_filename(&details.title, &quality.label());
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|error| RelayError::RelayFailure(format!("content disposition: {error}")))?,
    );

    Ok((headers, Body::from_stream(relay.body)).into_response())
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
