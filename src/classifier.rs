use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

const MAX_TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Instagram,
    /// Only ever chosen by a front end; the backend never classifies into it.
    Pinterest,
    Unknown,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::Instagram => "instagram",
            Self::Pinterest => "pinterest",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A URL submitted by a client together with the platform it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoReference {
    pub url: String,
    pub platform: Platform,
}

static YOUTUBE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"^(https?://)?(www\.)?(youtube\.com|youtu\.be)/.+$",
        r"^(https?://)?(www\.)?youtube\.com/shorts/.+$",
        r"^(https?://)?(www\.)?youtube\.com/watch\?v=.+$",
        r"^(https?://)?youtu\.be/.+$",
    ])
});

static INSTAGRAM_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"^(https?://)?(www\.)?instagram\.com/(reel|reels|p)/.+$",
        r"^(https?://)?(www\.)?instagr\.am/(reel|reels|p)/.+$",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}

pub fn classify(raw: &str) -> Option<Platform> {
    let lower = raw.to_ascii_lowercase();

    if lower.contains("youtube.com") || lower.contains("youtu.be") {
        return Some(Platform::YouTube);
    }

    if lower.contains("instagram.com") || lower.contains("instagr.am") {
        return Some(Platform::Instagram);
    }

    None
}

/// Checks the URL against the shapes each platform actually serves videos
/// from. Strings that do not parse as absolute URLs are rejected.
pub fn validate_format(url: &str, platform: Platform) -> bool {
    if Url::parse(url).is_err() {
        return false;
    }

    let patterns: &[Regex] = match platform {
        Platform::YouTube => &YOUTUBE_PATTERNS,
        Platform::Instagram => &INSTAGRAM_PATTERNS,
        Platform::Pinterest | Platform::Unknown => return false,
    };

    patterns.iter().any(|pattern| pattern.is_match(url))
}

pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() {
                character
            } else {
                '_'
            }
        })
        .take(MAX_TITLE_CHARS)
        .collect()
}

pub fn download_filename(title: &str, quality_label: &str) -> String {
    format!("{}_{quality_label}.mp4", sanitize_title(title))
}
