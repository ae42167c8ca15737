use std::fmt;

use serde::Serialize;

use crate::error::RelayError;

/// One encoded track the upstream source can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDescriptor {
    pub container: String,
    /// Bits per second.
    pub bitrate: Option<u64>,
    pub height: Option<u32>,
    pub has_video: bool,
    pub has_audio: bool,
    pub format_id: String,
}

impl StreamDescriptor {
    fn is_eligible(&self) -> bool {
        self.has_video && self.has_audio
    }

    fn is_mp4(&self) -> bool {
        self.container.eq_ignore_ascii_case("mp4")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityRequest {
    Highest,
    Height(u32),
}

impl QualityRequest {
    /// Absent or `"highest"` selects the best bitrate; otherwise the leading
    /// digits are taken as a target height, so `"720p"` means 720.
    pub fn parse(raw: Option<&str>) -> Result<Self, RelayError> {
        let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
            return Ok(Self::Highest);
        };

        if raw.eq_ignore_ascii_case("highest") {
            return Ok(Self::Highest);
        }

        let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
        digits
            .parse::<u32>()
            .map(Self::Height)
            .map_err(|_| RelayError::InvalidInput(format!("Invalid quality: {raw}")))
    }

    pub fn label(&self) -> String {
        match self {
            Self::Highest => "highest".to_string(),
            Self::Height(height) => height.to_string(),
        }
    }
}

impl fmt::Display for QualityRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

pub fn select_format<'a>(
    formats: &'a [StreamDescriptor],
    quality: &QualityRequest,
) -> Result<&'a StreamDescriptor, RelayError> {
    let eligible: Vec<&StreamDescriptor> =
        formats.iter().filter(|format| format.is_eligible()).collect();

    if eligible.is_empty() {
        return Err(RelayError::NoPlayableFormat);
    }

    let selected = match quality {
        QualityRequest::Highest => highest(&eligible),
        QualityRequest::Height(target) => {
            nearest_height(&eligible, *target).unwrap_or_else(|| highest(&eligible))
        }
    };

    Ok(selected)
}

// Strict comparisons keep the first entry on ties, so the result never
// depends on sort stability.
fn highest<'a>(eligible: &[&'a StreamDescriptor]) -> &'a StreamDescriptor {
    let mut best: Option<&StreamDescriptor> = None;
    for format in eligible.iter().copied().filter(|format| format.is_mp4()) {
        let bitrate = format.bitrate.unwrap_or_default();
        if best.is_none_or(|current| bitrate > current.bitrate.unwrap_or_default()) {
            best = Some(format);
        }
    }

    best.unwrap_or(eligible[0])
}

fn nearest_height<'a>(
    eligible: &[&'a StreamDescriptor],
    target: u32,
) -> Option<&'a StreamDescriptor> {
    let mut best: Option<(u32, &StreamDescriptor)> = None;
    for format in eligible.iter().copied().filter(|format| format.is_mp4()) {
        let distance = format.height.unwrap_or_default().abs_diff(target);
        if best.is_none_or(|(current, _)| distance < current) {
            best = Some((distance, format));
        }
    }

    best.map(|(_, format)| format)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, container: &str, height: u32, bitrate: u64) -> StreamDescriptor {
        StreamDescriptor {
            container: container.to_string(),
            bitrate: Some(bitrate),
            height: Some(height),
            has_video: true,
            has_audio: true,
            format_id: id.to_string(),
        }
    }

    fn sample_list() -> Vec<StreamDescriptor> {
        vec![
            descriptor("18", "mp4", 720, 5),
            descriptor("22", "mp4", 1080, 8),
            descriptor("43", "webm", 1080, 9),
        ]
    }

    #[test]
    fn highest_prefers_mp4_over_higher_bitrate_webm() {
        let formats = sample_list();
        let selected = select_format(&formats, &QualityRequest::Highest).unwrap();
        assert_eq!(selected.format_id, "22");
    }

    #[test]
    fn target_height_picks_nearest_mp4() {
        let formats = sample_list();
        let selected = select_format(&formats, &QualityRequest::Height(480)).unwrap();
        assert_eq!(selected.format_id, "18");
    }

    #[test]
    fn empty_eligible_list_is_no_playable_format() {
        let mut video_only = descriptor("137", "mp4", 1080, 10);
        video_only.has_audio = false;

        assert!(matches!(
            select_format(&[], &QualityRequest::Highest),
            Err(RelayError::NoPlayableFormat)
        ));
        assert!(matches!(
            select_format(&[video_only], &QualityRequest::Height(720)),
            Err(RelayError::NoPlayableFormat)
        ));
    }

    #[test]
    fn falls_back_to_first_eligible_without_mp4() {
        let formats = vec![
            descriptor("43", "webm", 360, 3),
            descriptor("44", "webm", 480, 9),
        ];
        let selected = select_format(&formats, &QualityRequest::Highest).unwrap();
        assert_eq!(selected.format_id, "43");

        let selected = select_format(&formats, &QualityRequest::Height(480)).unwrap();
        assert_eq!(selected.format_id, "43");
    }

    #[test]
    fn ties_resolve_to_list_order() {
        let formats = vec![
            descriptor("a", "mp4", 600, 4),
            descriptor("b", "mp4", 400, 4),
        ];
        for _ in 0..10 {
            assert_eq!(
                select_format(&formats, &QualityRequest::Height(500))
                    .unwrap()
                    .format_id,
                "a"
            );
            assert_eq!(
                select_format(&formats, &QualityRequest::Highest)
                    .unwrap()
                    .format_id,
                "a"
            );
        }
    }

    #[test]
    fn missing_height_counts_as_zero() {
        let mut unknown = descriptor("x", "mp4", 0, 1);
        unknown.height = None;
        let formats = vec![unknown, descriptor("y", "mp4", 1080, 2)];
        let selected = select_format(&formats, &QualityRequest::Height(144)).unwrap();
        assert_eq!(selected.format_id, "x");
    }

    #[test]
    fn parses_quality_requests() {
        assert_eq!(QualityRequest::parse(None).unwrap(), QualityRequest::Highest);
        assert_eq!(
            QualityRequest::parse(Some("HIGHEST")).unwrap(),
            QualityRequest::Highest
        );
        assert_eq!(
            QualityRequest::parse(Some("720")).unwrap(),
            QualityRequest::Height(720)
        );
        assert_eq!(
            QualityRequest::parse(Some("1080p")).unwrap(),
            QualityRequest::Height(1080)
        );
        assert!(QualityRequest::parse(Some("best")).is_err());
        assert_eq!(QualityRequest::Height(360).label(), "360");
    }
}
