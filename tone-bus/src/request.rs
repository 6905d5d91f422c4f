use std::fmt::{Display, Formatter};

use crate::error::{PipelineError, PipelineResult};

pub const MAX_VIDEO_ID_LEN: usize = 64;

/// Opaque token naming a remote video, restricted to URL-safe characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VideoId(String);

impl VideoId {
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "no video id provided".to_string(),
            ));
        }
        if raw.len() > MAX_VIDEO_ID_LEN {
            return Err(PipelineError::InvalidRequest(format!(
                "video id longer than {} characters",
                MAX_VIDEO_ID_LEN
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(PipelineError::InvalidRequest(format!(
                "video id {:?} contains invalid characters",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VideoId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target encoder bitrate in kbps.
///
/// Values outside [`Bitrate::MIN`]..=[`Bitrate::MAX`] are rejected, never clamped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Bitrate(u32);

impl Bitrate {
    pub const MIN: u32 = 64;
    pub const MAX: u32 = 320;
    pub const DEFAULT: Bitrate = Bitrate(128);

    pub fn new(kbps: u32) -> PipelineResult<Self> {
        if (Self::MIN..=Self::MAX).contains(&kbps) {
            Ok(Self(kbps))
        } else {
            Err(PipelineError::InvalidRequest(format!(
                "bitrate {} kbps is outside the accepted range {}-{}",
                kbps,
                Self::MIN,
                Self::MAX
            )))
        }
    }

    /// Parse an optional query value; `None` or blank means the default.
    pub fn parse(raw: Option<&str>) -> PipelineResult<Self> {
        let raw = match raw.map(str::trim) {
            None | Some("") => return Ok(Self::DEFAULT),
            Some(raw) => raw,
        };
        // "192k" is accepted as a convenience
        let digits = raw.strip_suffix(['k', 'K']).unwrap_or(raw);
        let kbps = digits.parse::<u32>().map_err(|_| {
            PipelineError::InvalidRequest(format!("bitrate {:?} is not a number", raw))
        })?;
        Self::new(kbps)
    }

    pub fn kbps(&self) -> u32 {
        self.0
    }
}

impl Default for Bitrate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for Bitrate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}k", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineRequest {
    pub video_id: VideoId,
    pub bitrate: Bitrate,
}

impl PipelineRequest {
    pub fn new(video_id: VideoId, bitrate: Bitrate) -> Self {
        Self { video_id, bitrate }
    }

    /// Validate raw query parameters.
    pub fn parse(video_id: Option<&str>, bitrate: Option<&str>) -> PipelineResult<Self> {
        let video_id = VideoId::parse(video_id.unwrap_or_default())?;
        let bitrate = Bitrate::parse(bitrate)?;
        Ok(Self { video_id, bitrate })
    }
}
