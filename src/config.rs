use std::{path::PathBuf, time::Duration};

use tracing::warn;

use crate::{credential::UpstreamCredential, relay::RelaySettings};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 15 * 60 * 1000;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 10;
const DEFAULT_STATIC_DIR: &str = "frontend";
const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
const DEFAULT_INFO_TIMEOUT_SECONDS: u64 = 180;

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub trust_proxy_headers: bool,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u32,
    pub static_dir: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub info_timeout: Duration,
    pub credential: UpstreamCredential,
    pub relay: RelaySettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };
        let relay_defaults = RelaySettings::default();

        let rate_limit_window_ms = read_number::<u64>(&read, "RATE_LIMIT_WINDOW_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_MS);
        let rate_limit_max_requests = read_number::<u32>(&read, "RATE_LIMIT_MAX_REQUESTS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS);

        let credential = match read("YTDLP_COOKIES") {
            Some(path) => UpstreamCredential::with_cookies(path),
            None => UpstreamCredential::anonymous(),
        };

        Self {
            bind_addr: resolve_bind_addr(&read),
            allowed_origins: read("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            trust_proxy_headers: read_bool(&read, "TRUST_PROXY_HEADERS").unwrap_or(false),
            rate_limit_window: Duration::from_millis(rate_limit_window_ms),
            rate_limit_max_requests,
            static_dir: read("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR)),
            ytdlp_bin: read("YTDLP_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN)),
            info_timeout: Duration::from_secs(
                read_number::<u64>(&read, "YTDLP_INFO_TIMEOUT_SECS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_INFO_TIMEOUT_SECONDS),
            ),
            credential,
            relay: RelaySettings {
                connect_timeout: read_number::<u64>(&read, "UPSTREAM_CONNECT_TIMEOUT_SECS")
                    .filter(|value| *value > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(relay_defaults.connect_timeout),
                idle_timeout: read_number::<u64>(&read, "UPSTREAM_IDLE_TIMEOUT_SECS")
                    .filter(|value| *value > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(relay_defaults.idle_timeout),
                ..relay_defaults
            },
        }
    }
}

fn resolve_bind_addr(read: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = read("APP_ADDR") {
        return configured;
    }

    if let Some(port) = read_number::<u16>(read, "PORT") {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn read_bool(read: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let value = read(name)?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("{name}={value:?} is not a boolean, using the default");
            None
        }
    }
}

fn read_number<T: std::str::FromStr>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let value = read(name)?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("{name}={value:?} is not a valid number, using the default");
            None
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
