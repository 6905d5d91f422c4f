//! Thin supervision layer over external tool processes.
//!
//! Every tool the pipeline talks to (fetcher, transcoder) goes through
//! [`ExternalProcess`]: spawn with piped stdio, hand out the data pipes,
//! capture stderr on its own task, then wait / finish / kill. Nothing above
//! this module touches `tokio::process` directly.

use std::{
    collections::VecDeque,
    io,
    process::{ExitStatus, Output, Stdio},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
};

/// How much of a tool's stderr is kept for error reports.
pub const DIAGNOSTIC_TAIL_BYTES: usize = 8 * 1024;

/// A program plus argument templates. `{name}` placeholders are expanded by
/// [`ToolCommand::render`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn render(&self, vars: &[(&str, &str)]) -> ToolCommand {
        let args = self
            .args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{}}}", name), value)
                })
            })
            .collect();
        ToolCommand {
            program: self.program.clone(),
            args,
        }
    }
}

/// Exit of a supervised process. `killed` is set when we sent the kill, so a
/// signal exit caused by teardown is not mistaken for a tool failure.
#[derive(Clone, Copy, Debug)]
pub struct Exit {
    pub status: ExitStatus,
    pub killed: bool,
}

impl Exit {
    pub fn failed(&self) -> bool {
        !self.killed && !self.status.success()
    }
}

pub struct ExternalProcess {
    label: &'static str,
    program: String,
    child: Child,
    pid: Option<u32>,
    status: Option<ExitStatus>,
    killed: bool,
    diagnostics: Option<JoinHandle<String>>,
}

impl ExternalProcess {
    /// Spawn `cmd` with stdout/stderr piped. The child is killed if this
    /// value is dropped while it is still running.
    ///
    /// On unix the child leads a fresh process group, so killing it also
    /// takes down helpers it started (yt-dlp may run ffmpeg itself).
    pub fn spawn(label: &'static str, cmd: &ToolCommand, stdin: Stdio) -> io::Result<Self> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;

        let pid = child.id();
        let diagnostics = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(capture_diagnostics(label, pid, stderr)));

        log::debug!("{}: spawned {} (pid {:?})", label, cmd.program, pid);
        Ok(Self {
            label,
            program: cmd.program.clone(),
            child,
            pid,
            status: None,
            killed: false,
            diagnostics,
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Pid while the process is alive (and not yet reaped).
    pub fn pid(&self) -> Option<u32> {
        if self.status.is_some() { None } else { self.pid }
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        log::debug!("{}: pid {:?} exited with {}", self.label, self.pid, status);
        self.status = Some(status);
        Ok(status)
    }

    /// SIGKILL the process group and reap. Safe to call on a process that
    /// already exited.
    pub async fn kill(&mut self) -> io::Result<Exit> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.status = Some(status),
                _ => {
                    self.killed = true;
                    if let Err(e) = self.child.start_kill() {
                        log::warn!("{}: kill pid {:?} failed: {}", self.label, self.pid, e);
                    }
                }
            }
            // leftovers in the group outlive a leader that exited on its own
            self.kill_group();
        }
        let status = self.wait().await?;
        Ok(Exit {
            status,
            killed: self.killed,
        })
    }

    /// Give the process `grace` to exit on its own, then kill it.
    pub async fn finish(&mut self, grace: Duration) -> io::Result<Exit> {
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => Ok(Exit {
                status: status?,
                killed: self.killed,
            }),
            Err(_) => {
                log::warn!(
                    "{}: pid {:?} still running after {:?}, killing",
                    self.label,
                    self.pid,
                    grace
                );
                self.kill().await
            }
        }
    }

    /// Captured stderr tail. Only meaningful once the process is gone; the
    /// capture task is abandoned if a grandchild keeps the pipe open longer
    /// than `grace`.
    pub async fn diagnostics(&mut self, grace: Duration) -> String {
        let Some(mut handle) = self.diagnostics.take() else {
            return String::new();
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                log::warn!("{}: diagnostic capture task failed: {}", self.label, e);
                String::new()
            }
            Err(_) => {
                handle.abort();
                String::new()
            }
        }
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        // the group id equals the leader pid, see `spawn`
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                log::debug!("{}: killpg {} failed: {}", self.label, pid, err);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}
}

impl Drop for ExternalProcess {
    fn drop(&mut self) {
        // kill_on_drop only reaches the leader
        if self.status.is_none() {
            self.kill_group();
        }
    }
}

async fn capture_diagnostics(label: &'static str, pid: Option<u32>, stderr: ChildStderr) -> String {
    let mut reader = BufReader::new(stderr);
    let mut tail = DiagnosticTail::new(DIAGNOSTIC_TAIL_BYTES);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                log::debug!(target: "tone_bus::tool", "{}[{:?}]: {}", label, pid, line);
                tail.push(line);
            }
            Err(e) => {
                log::debug!("{}: stderr read error: {}", label, e);
                break;
            }
        }
    }
    tail.into_string()
}

/// Keeps the most recent lines within a byte budget.
struct DiagnosticTail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl DiagnosticTail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
            }
        }
    }

    fn into_string(self) -> String {
        Vec::from(self.lines).join("\n")
    }
}

/// Run a short-lived command to completion with a hard timeout. The child
/// is killed when the timeout fires.
pub async fn run_to_completion(cmd: &ToolCommand, timeout: Duration) -> io::Result<Output> {
    let output = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, output).await {
        Ok(output) => output,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out after {:?}", cmd.program, timeout),
        )),
    }
}

/// First line of `<program> <arg>` output, e.g. `ffmpeg -version`.
pub async fn probe_version(program: &str, arg: &str, timeout: Duration) -> io::Result<String> {
    let output = run_to_completion(&ToolCommand::new(program, [arg]), timeout).await?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{} {} exited with {}",
            program, arg, output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_expands_placeholders() {
        let cmd = ToolCommand::new("ffmpeg", ["-b:a", "{bitrate}k", "-ar", "{sample_rate}", "{missing}"]);
        let rendered = cmd.render(&[("bitrate", "192"), ("sample_rate", "44100")]);
        assert_eq!(rendered.program, "ffmpeg");
        assert_eq!(rendered.args, vec!["-b:a", "192k", "-ar", "44100", "{missing}"]);
    }

    #[test]
    fn test_diagnostic_tail_keeps_latest_lines() {
        let mut tail = DiagnosticTail::new(10);
        tail.push("aaaa".to_string());
        tail.push("bbbb".to_string());
        tail.push("cccc".to_string());
        assert_eq!(tail.into_string(), "bbbb\ncccc");
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let cmd = ToolCommand::new("/nonexistent/tool-that-is-not-here", Vec::<String>::new());
        let err = ExternalProcess::spawn("test", &cmd, Stdio::null()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_failed_exit_keeps_stderr() -> anyhow::Result<()> {
        let cmd = ToolCommand::new("sh", ["-c", "echo first >&2; echo boom >&2; exit 3"]);
        let mut process = ExternalProcess::spawn("test", &cmd, Stdio::null())?;
        let exit = process.finish(Duration::from_secs(5)).await?;
        assert!(exit.failed());
        assert_eq!(exit.status.code(), Some(3));
        assert_eq!(process.diagnostics(Duration::from_secs(1)).await, "first\nboom");
        Ok(())
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() -> anyhow::Result<()> {
        let cmd = ToolCommand::new("sh", ["-c", "exec sleep 30"]);
        let mut process = ExternalProcess::spawn("test", &cmd, Stdio::null())?;
        assert!(process.pid().is_some());
        let first = process.kill().await?;
        assert!(first.killed);
        let second = process.kill().await?;
        assert!(!second.status.success());
        assert!(process.pid().is_none());
        let exit = process.finish(Duration::from_millis(10)).await?;
        assert!(exit.killed);
        assert!(!exit.failed());
        Ok(())
    }

    /// Alive and not a zombie; init may be slow to reap orphans in containers.
    #[cfg(target_os = "linux")]
    fn running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                let state = stat.rsplit_once(')')?.1.trim_start().chars().next()?;
                Some(state != 'Z' && state != 'X')
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kill_reaches_grandchildren() -> anyhow::Result<()> {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let cmd = ToolCommand::new("sh", ["-c", "sleep 30 & echo $!; wait"]);
        let mut process = ExternalProcess::spawn("test", &cmd, Stdio::null())?;
        let mut line = String::new();
        BufReader::new(process.take_stdout().unwrap())
            .read_line(&mut line)
            .await?;
        let grandchild: u32 = line.trim().parse()?;
        assert!(running(grandchild));

        assert!(process.kill().await?.killed);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while running(grandchild) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(grandchild), "pid {} outlived its group leader", grandchild);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_drop_reaches_grandchildren() -> anyhow::Result<()> {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let cmd = ToolCommand::new("sh", ["-c", "sleep 30 & echo $!; wait"]);
        let mut process = ExternalProcess::spawn("test", &cmd, Stdio::null())?;
        let mut line = String::new();
        BufReader::new(process.take_stdout().unwrap())
            .read_line(&mut line)
            .await?;
        let grandchild: u32 = line.trim().parse()?;

        drop(process);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while running(grandchild) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(grandchild));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_to_completion_times_out() {
        let cmd = ToolCommand::new("sh", ["-c", "exec sleep 30"]);
        let err = run_to_completion(&cmd, Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
