use std::{process::Stdio, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::process::ChildStdout;

use crate::{
    error::{PipelineError, PipelineResult},
    process::{ExternalProcess, ToolCommand, run_to_completion},
    request::VideoId,
};

/// Fetch tool configuration. `{url}` and `{id}` are expanded in every arg.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub program: String,
    pub args: Vec<String>,
    pub url_template: String,
    /// Args for the title lookup; empty disables it.
    pub title_args: Vec<String>,
    pub title_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            args: [
                "-f",
                "bestaudio/best",
                "--no-playlist",
                "--quiet",
                "--no-warnings",
                "-o",
                "-",
                "--",
                "{url}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            url_template: "https://www.youtube.com/watch?v={id}".to_string(),
            title_args: [
                "--skip-download",
                "--no-playlist",
                "--no-warnings",
                "--print",
                "title",
                "--",
                "{url}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            title_timeout_ms: 15_000,
        }
    }
}

impl SourceConfig {
    pub fn video_url(&self, id: &VideoId) -> String {
        self.url_template.replace("{id}", id.as_str())
    }

    fn command(&self, args: &[String], id: &VideoId) -> ToolCommand {
        let url = self.video_url(id);
        ToolCommand::new(self.program.as_str(), args.iter().cloned())
            .render(&[("url", url.as_str()), ("id", id.as_str())])
    }

    pub fn fetch_command(&self, id: &VideoId) -> ToolCommand {
        self.command(&self.args, id)
    }

    pub fn title_command(&self, id: &VideoId) -> Option<ToolCommand> {
        if self.title_args.is_empty() {
            return None;
        }
        Some(self.command(&self.title_args, id))
    }
}

/// One running fetch process and its raw audio output.
pub struct SourceHandle {
    process: ExternalProcess,
    output: Option<ChildStdout>,
}

impl SourceHandle {
    /// The raw byte stream. Finite and single-use.
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
pub struct SourceProvider {
    config: SourceConfig,
}

impl SourceProvider {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Start fetching. Existence of the video is not checked here; a missing
    /// or restricted video shows up later as a failed exit.
    pub fn open(&self, id: &VideoId) -> PipelineResult<SourceHandle> {
        let cmd = self.config.fetch_command(id);
        let mut process = ExternalProcess::spawn("source", &cmd, Stdio::null()).map_err(|e| {
            PipelineError::ProviderUnavailable {
                program: cmd.program.clone(),
                source: e,
            }
        })?;
        let output = process.take_stdout();
        log::info!("source: fetching {} via {}", id, cmd.program);
        Ok(SourceHandle { process, output })
    }

    /// Best-effort title lookup; `None` on any failure.
    pub async fn fetch_title(&self, id: &VideoId) -> Option<String> {
        let cmd = self.config.title_command(id)?;
        let timeout = Duration::from_millis(self.config.title_timeout_ms);
        match run_to_completion(&cmd, timeout).await {
            Ok(output) if output.status.success() => {
                let title = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                (!title.is_empty()).then_some(title)
            }
            Ok(output) => {
                log::warn!(
                    "source: title lookup for {} exited with {}: {}",
                    id,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                log::warn!("source: title lookup for {} failed: {}", id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(script: &str) -> SourceConfig {
        SourceConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            title_args: vec!["-c".to_string(), script.to_string()],
            title_timeout_ms: 2_000,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn test_default_fetch_command() {
        let config = SourceConfig::default();
        let id = VideoId::parse("abc123").unwrap();
        let cmd = config.fetch_command(&id);
        assert_eq!(cmd.program, "yt-dlp");
        assert_eq!(
            cmd.args.last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=abc123")
        );
        assert!(cmd.args.windows(2).any(|w| w[0] == "-o" && w[1] == "-"));
    }

    #[test]
    fn test_empty_title_args_disable_lookup() {
        let config = SourceConfig {
            title_args: Vec::new(),
            ..SourceConfig::default()
        };
        assert!(config.title_command(&VideoId::parse("x").unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_open_missing_tool_is_provider_unavailable() {
        let provider = SourceProvider::new(SourceConfig {
            program: "/nonexistent/yt-dlp".to_string(),
            ..SourceConfig::default()
        });
        let err = provider.open(&VideoId::parse("abc123").unwrap()).err().unwrap();
        assert!(matches!(err, PipelineError::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_fetch_title() {
        let id = VideoId::parse("abc123").unwrap();

        let provider = SourceProvider::new(stub("echo 'Never Gonna Give You Up'"));
        assert_eq!(
            provider.fetch_title(&id).await.as_deref(),
            Some("Never Gonna Give You Up")
        );

        let provider = SourceProvider::new(stub("echo 'ERROR: unavailable' >&2; exit 1"));
        assert_eq!(provider.fetch_title(&id).await, None);
    }
}
