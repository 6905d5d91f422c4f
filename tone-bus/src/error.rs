use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("source tool {program:?} could not be started: {source}")]
    ProviderUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder {program:?} could not be started: {source}")]
    TranscoderUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("source fetch failed: {diagnostic}")]
    SourceFetchFailed { diagnostic: String },

    /// The source died after some bytes were already handed to the transcoder.
    #[error("source stream broke after {after_bytes} bytes: {diagnostic}")]
    SourceInterrupted { after_bytes: u64, diagnostic: String },

    #[error("transcode failed: {diagnostic}")]
    TranscodeFailed { diagnostic: String },

    #[error("client went away")]
    ClientAborted,

    /// Torn down from outside while the consumer was still reading, e.g. on
    /// server shutdown.
    #[error("pipeline cancelled")]
    Cancelled,

    #[error("pipeline exceeded its deadline of {0:?}")]
    TimedOut(Duration),

    #[error("pipeline produced no output for {0:?}")]
    Stalled(Duration),

    #[error("too many concurrent downloads, try again later")]
    Busy,
}

impl PipelineError {
    /// Caused by the caller's parameters rather than the environment.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }

    /// Missing or broken local tooling, worth an operator's attention.
    pub fn is_environment_error(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } | Self::TranscoderUnavailable { .. }
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_diagnostic() {
        let err = PipelineError::SourceFetchFailed {
            diagnostic: "ERROR: Video unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "source fetch failed: ERROR: Video unavailable"
        );
    }

    #[test]
    fn test_classification() {
        assert!(PipelineError::InvalidRequest("x".into()).is_client_error());
        assert!(!PipelineError::Busy.is_client_error());

        let missing = PipelineError::TranscoderUnavailable {
            program: "ffmpeg".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(missing.is_environment_error());
        assert!(!PipelineError::ClientAborted.is_environment_error());
    }
}
