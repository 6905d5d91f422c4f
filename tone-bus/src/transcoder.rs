use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{ChildStdin, ChildStdout};

use crate::{
    error::{PipelineError, PipelineResult},
    process::{ExternalProcess, ToolCommand},
    request::Bitrate,
};

/// The single encoded format the pipeline delivers.
pub struct OutputFormat;

impl OutputFormat {
    pub const CONTENT_TYPE: &'static str = "audio/mpeg";
    pub const EXTENSION: &'static str = "mp3";
}

/// Transcoder configuration. Args may use `{bitrate}` (kbps),
/// `{sample_rate}` and `{channels}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: String,
    pub args: Vec<String>,
    pub sample_rate_hz: u32,
    pub channels: u32,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: [
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                "pipe:0",
                "-vn",
                "-codec:a",
                "libmp3lame",
                "-b:a",
                "{bitrate}k",
                "-ar",
                "{sample_rate}",
                "-ac",
                "{channels}",
                "-f",
                "mp3",
                "pipe:1",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            sample_rate_hz: 44_100,
            channels: 2,
        }
    }
}

impl TranscoderConfig {
    pub fn command(&self, bitrate: Bitrate) -> ToolCommand {
        let kbps = bitrate.kbps().to_string();
        let sample_rate = self.sample_rate_hz.to_string();
        let channels = self.channels.to_string();
        ToolCommand::new(self.program.as_str(), self.args.iter().cloned()).render(&[
            ("bitrate", kbps.as_str()),
            ("sample_rate", sample_rate.as_str()),
            ("channels", channels.as_str()),
        ])
    }
}

/// One running transcoder: raw audio in on stdin, encoded audio out on stdout.
pub struct TranscodeHandle {
    process: ExternalProcess,
    input: Option<ChildStdin>,
    output: Option<ChildStdout>,
}

impl TranscodeHandle {
    /// Writer side for raw audio. Dropping it signals end of input.
    pub fn take_input(&mut self) -> Option<ChildStdin> {
        self.input.take()
    }

    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.output.take()
    }

    pub fn process(&mut self) -> &mut ExternalProcess {
        &mut self.process
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TranscoderAdapter {
    config: TranscoderConfig,
}

impl TranscoderAdapter {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    pub fn spawn(&self, bitrate: Bitrate) -> PipelineResult<TranscodeHandle> {
        let cmd = self.config.command(bitrate);
        let mut process =
            ExternalProcess::spawn("transcoder", &cmd, Stdio::piped()).map_err(|e| {
                PipelineError::TranscoderUnavailable {
                    program: cmd.program.clone(),
                    source: e,
                }
            })?;
        let input = process.take_stdin();
        let output = process.take_stdout();
        log::debug!("transcoder: {} started at {}", cmd.program, bitrate);
        Ok(TranscodeHandle {
            process,
            input,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_default_command_carries_fixed_parameters() {
        let cmd = TranscoderConfig::default().command(Bitrate::new(192).unwrap());
        assert_eq!(cmd.program, "ffmpeg");
        let args = cmd.args.join(" ");
        assert!(args.contains("-i pipe:0"));
        assert!(args.contains("-b:a 192k"));
        assert!(args.contains("-ar 44100"));
        assert!(args.contains("-ac 2"));
        assert!(args.ends_with("-f mp3 pipe:1"));
    }

    #[tokio::test]
    async fn test_missing_engine_is_transcoder_unavailable() {
        let adapter = TranscoderAdapter::new(TranscoderConfig {
            program: "/nonexistent/ffmpeg".to_string(),
            ..TranscoderConfig::default()
        });
        let err = adapter.spawn(Bitrate::DEFAULT).err().unwrap();
        assert!(matches!(err, PipelineError::TranscoderUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_streams_through_stub_engine() -> anyhow::Result<()> {
        let adapter = TranscoderAdapter::new(TranscoderConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exec tr a-z A-Z".to_string()],
            ..TranscoderConfig::default()
        });
        let mut handle = adapter.spawn(Bitrate::DEFAULT)?;
        let mut input = handle.take_input().unwrap();
        let mut output = handle.take_output().unwrap();

        input.write_all(b"hello").await?;
        drop(input);

        let mut encoded = Vec::new();
        output.read_to_end(&mut encoded).await?;
        assert_eq!(encoded, b"HELLO");

        let exit = handle.process().finish(Duration::from_secs(5)).await?;
        assert!(!exit.failed());
        Ok(())
    }
}
