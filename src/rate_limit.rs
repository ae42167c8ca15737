use std::{collections::HashMap, net::SocketAddr, time::Duration};

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

const PRUNE_THRESHOLD: usize = 10_000;
const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        remaining: u32,
        reset_after_seconds: u64,
    },
    Limited {
        retry_after_seconds: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct FixedWindow {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Fixed-window request counter keyed by client address.
#[derive(Debug)]
pub struct RateLimiter {
    window: chrono::Duration,
    window_label: String,
    max_requests: u32,
    windows: Mutex<HashMap<String, FixedWindow>>,
}

impl RateLimiter {
    /// Windows longer than a year are clamped to one year.
    pub fn new(window: Duration, max_requests: u32) -> Self {
        if window > MAX_WINDOW {
            warn!(
                "Rate limit window of {}s is too long, clamping to {}s",
                window.as_secs(),
                MAX_WINDOW.as_secs()
            );
        }
        let window = window.min(MAX_WINDOW);

        Self {
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            window_label: describe_window(window),
            max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Human readable window length, e.g. `"15 minutes"`.
    pub fn window_label(&self) -> &str {
        &self.window_label
    }

    pub async fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Utc::now()).await
    }

    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> RateDecision {
        let mut windows = self.windows.lock().await;

        if windows.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, entry| now - entry.started_at < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(FixedWindow {
            started_at: now,
            count: 0,
        });
        if now - entry.started_at >= self.window {
            *entry = FixedWindow {
                started_at: now,
                count: 0,
            };
        }

        let reset_after_seconds = (entry.started_at + self.window - now).num_seconds().max(1) as u64;

        if entry.count >= self.max_requests {
            return RateDecision::Limited {
                retry_after_seconds: reset_after_seconds,
            };
        }

        entry.count += 1;
        RateDecision::Allowed {
            remaining: self.max_requests - entry.count,
            reset_after_seconds,
        }
    }
}

fn describe_window(window: Duration) -> String {
    let seconds = window.as_secs();
    let (amount, unit) = if seconds >= 86_400 && seconds % 86_400 == 0 {
        (seconds / 86_400, "day")
    } else if seconds >= 3600 && seconds % 3600 == 0 {
        (seconds / 3600, "hour")
    } else if seconds >= 60 && seconds % 60 == 0 {
        (seconds / 60, "minute")
    } else {
        (seconds, "second")
    };

    if amount == 1 {
        format!("1 {unit}")
    } else {
        format!("{amount} {unit}s")
    }
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

/// The key a request is counted under. Proxy headers are only honoured
/// when the deployment says a trusted proxy sits in front of us.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy_headers: bool) -> String {
    let peer_ip = peer.map(|addr| addr.ip().to_string());

    if trust_proxy_headers {
        forwarded_client_ip(headers)
            .or(peer_ip)
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        peer_ip.unwrap_or_else(|| "unknown".to_string())
    }
}
