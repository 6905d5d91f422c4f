//! Pipeline session: one fetch process feeding one transcoder, supervised
//! as a unit.
//!
//! ```text
//!  source stdout ──pump──► transcoder stdin
//!                          transcoder stdout ──forward──► bounded channel ──► PipelineSession (Stream)
//!  source stderr ──► capture task
//!  transcoder stderr ──► capture task
//! ```
//!
//! The supervisor task owns both processes. It ends on natural EOF, on any
//! stage error, when the session is dropped or closed, when the parent
//! token is cancelled, or when the total / idle deadline passes. In every
//! case both processes are killed (if still alive) and reaped before the
//! supervisor returns.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, ChildStdout},
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    admission::Permit,
    error::{PipelineError, PipelineResult},
    process::{Exit, ExternalProcess},
    request::PipelineRequest,
    source::{SourceConfig, SourceHandle, SourceProvider},
    transcoder::{TranscodeHandle, TranscoderAdapter, TranscoderConfig},
};

const PUMP_BUFFER: usize = 16 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub source: SourceConfig,
    pub transcoder: TranscoderConfig,
    /// Encoded chunks buffered between the transcoder and the consumer.
    pub channel_capacity: usize,
    /// Upper bound of a single encoded chunk.
    pub chunk_size: usize,
    /// Total lifetime of a session, 0 = unbounded.
    pub max_duration_ms: u64,
    /// Longest gap between two transcoder reads, 0 = unbounded.
    pub idle_timeout_ms: u64,
    /// Time a process gets to exit on its own before it is killed.
    pub kill_grace_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            transcoder: TranscoderConfig::default(),
            channel_capacity: 8,
            chunk_size: 16 * 1024,
            max_duration_ms: 60 * 60 * 1000,
            idle_timeout_ms: 60 * 1000,
            kill_grace_ms: 2000,
        }
    }
}

impl PipelineSettings {
    fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_ms > 0).then(|| Duration::from_millis(self.max_duration_ms))
    }

    fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Live counters of a session, readable while it runs.
#[derive(Debug, Default)]
pub struct SessionStats {
    source_bytes: AtomicU64,
    output_bytes: AtomicU64,
    source_pid: AtomicU32,
    transcoder_pid: AtomicU32,
}

impl SessionStats {
    fn new(source_pid: Option<u32>, transcoder_pid: Option<u32>) -> Self {
        Self {
            source_pid: AtomicU32::new(source_pid.unwrap_or(0)),
            transcoder_pid: AtomicU32::new(transcoder_pid.unwrap_or(0)),
            ..Self::default()
        }
    }

    /// Raw bytes read from the source.
    pub fn source_bytes(&self) -> u64 {
        self.source_bytes.load(Ordering::Relaxed)
    }

    /// Encoded bytes read from the transcoder.
    pub fn output_bytes(&self) -> u64 {
        self.output_bytes.load(Ordering::Relaxed)
    }

    /// Pids of tool processes that have not been reaped yet.
    pub fn process_ids(&self) -> Vec<u32> {
        [&self.source_pid, &self.transcoder_pid]
            .into_iter()
            .map(|pid| pid.load(Ordering::Relaxed))
            .filter(|pid| *pid != 0)
            .collect()
    }

    fn clear_pids(&self) {
        self.source_pid.store(0, Ordering::Relaxed);
        self.transcoder_pid.store(0, Ordering::Relaxed);
    }
}

/// A running pipeline. Yields encoded chunks in transcoder order; a
/// terminal `Err` means the bytes already yielded are not a complete file.
pub struct PipelineSession {
    id: String,
    request: PipelineRequest,
    cancel: CancellationToken,
    output: mpsc::Receiver<PipelineResult<Bytes>>,
    supervisor: Option<JoinHandle<()>>,
    stats: Arc<SessionStats>,
}

impl PipelineSession {
    /// Start source and transcoder and wire them together. Cancelling
    /// `parent` tears the session down.
    pub fn start(
        request: PipelineRequest,
        settings: &PipelineSettings,
        permit: Option<Permit>,
        parent: &CancellationToken,
    ) -> PipelineResult<Self> {
        let mut source = SourceProvider::new(settings.source.clone()).open(&request.video_id)?;
        let transcode =
            match TranscoderAdapter::new(settings.transcoder.clone()).spawn(request.bitrate) {
                Ok(transcode) => transcode,
                Err(e) => {
                    tokio::spawn(async move {
                        if let Err(e) = source.process().kill().await {
                            log::warn!("session: reaping orphaned source failed: {}", e);
                        }
                    });
                    return Err(e);
                }
            };

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = parent.child_token();
        let (tx, output) = mpsc::channel(settings.channel_capacity.max(1));
        let stats = Arc::new(SessionStats::new(source.pid(), transcode.pid()));

        log::info!(
            "session {}: {} at {} (source pid {:?}, transcoder pid {:?})",
            id,
            request.video_id,
            request.bitrate,
            source.pid(),
            transcode.pid()
        );

        let supervisor = Supervisor {
            id: id.clone(),
            source,
            transcode,
            tx,
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
            chunk_size: settings.chunk_size.max(1),
            max_duration: settings.max_duration(),
            idle_timeout: settings.idle_timeout(),
            kill_grace: settings.kill_grace(),
            permit,
        };
        let supervisor = tokio::spawn(supervisor.run());

        Ok(Self {
            id,
            request,
            cancel,
            output,
            supervisor: Some(supervisor),
            stats,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &PipelineRequest {
        &self.request
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_closed(&self) -> bool {
        self.supervisor.is_none()
    }

    /// Cancel and wait until both processes are reaped. Idempotent.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.output.close();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                log::error!("session {}: supervisor task failed: {}", self.id, e);
            }
        }
    }
}

impl Stream for PipelineSession {
    type Item = PipelineResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.output.poll_recv(cx)
    }
}

impl Drop for PipelineSession {
    fn drop(&mut self) {
        // the supervisor notices and tears down on its own
        self.cancel.cancel();
    }
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

enum PumpError {
    Read(std::io::Error),
    Write(std::io::Error),
}

enum Forward {
    Eof,
    ClientGone,
    Stalled(Duration),
    ReadError(std::io::Error),
}

enum Drive {
    Interrupted(Interrupt),
    Finished {
        pump: Option<Result<u64, PumpError>>,
        forward: Forward,
    },
}

impl Drive {
    /// The transcoder closed its output by itself.
    fn is_natural_end(&self) -> bool {
        matches!(
            self,
            Drive::Finished {
                forward: Forward::Eof,
                ..
            }
        )
    }

    /// Natural end and the source output was consumed to its end (or error).
    fn source_drained(&self) -> bool {
        matches!(
            self,
            Drive::Finished {
                forward: Forward::Eof,
                pump: Some(_),
            }
        )
    }
}

struct Supervisor {
    id: String,
    source: SourceHandle,
    transcode: TranscodeHandle,
    tx: mpsc::Sender<PipelineResult<Bytes>>,
    cancel: CancellationToken,
    stats: Arc<SessionStats>,
    chunk_size: usize,
    max_duration: Option<Duration>,
    idle_timeout: Option<Duration>,
    kill_grace: Duration,
    permit: Option<Permit>,
}

impl Supervisor {
    async fn run(mut self) {
        let started = Instant::now();
        let drive = self.drive(started).await;
        let grace = self.kill_grace;
        let (source_exit, transcode_exit) = tokio::join!(
            reap(self.source.process(), drive.source_drained(), grace),
            reap(self.transcode.process(), drive.is_natural_end(), grace)
        );
        self.stats.clear_pids();
        let (source_diag, transcode_diag) = tokio::join!(
            self.source.process().diagnostics(grace),
            self.transcode.process().diagnostics(grace)
        );
        // processes are gone, free the slot before a possibly slow final send
        drop(self.permit.take());

        let outcome = classify(
            drive,
            source_exit,
            transcode_exit,
            source_diag,
            transcode_diag,
            &self.stats,
        );
        match outcome {
            None => log::info!(
                "session {}: completed, {} bytes out in {:?}",
                self.id,
                self.stats.output_bytes(),
                started.elapsed()
            ),
            Some(PipelineError::ClientAborted) if self.tx.is_closed() => log::debug!(
                "session {}: consumer went away after {} bytes",
                self.id,
                self.stats.output_bytes()
            ),
            Some(PipelineError::ClientAborted) => {
                // parent token cancelled under a live consumer, which must
                // not mistake the truncated output for a complete file
                log::info!(
                    "session {}: cancelled after {} bytes",
                    self.id,
                    self.stats.output_bytes()
                );
                let _ = self.tx.send(Err(PipelineError::Cancelled)).await;
            }
            Some(err) => {
                if err.is_environment_error() {
                    log::error!("session {}: {}", self.id, err);
                } else {
                    log::warn!(
                        "session {}: failed after {} bytes: {}",
                        self.id,
                        self.stats.output_bytes(),
                        err
                    );
                }
                let _ = self.tx.send(Err(err)).await;
            }
        }
    }

    async fn drive(&mut self, started: Instant) -> Drive {
        let (Some(source_out), Some(transcode_in), Some(transcode_out)) = (
            self.source.take_output(),
            self.transcode.take_input(),
            self.transcode.take_output(),
        ) else {
            return Drive::Finished {
                pump: None,
                forward: Forward::ReadError(std::io::Error::other("process pipes already taken")),
            };
        };

        let deadline = self.max_duration.map(|d| started + d);
        let pump = pump(source_out, transcode_in, &self.stats);
        let forward = forward(
            transcode_out,
            &self.tx,
            self.chunk_size,
            self.idle_timeout,
            &self.stats,
        );
        tokio::pin!(pump);
        tokio::pin!(forward);

        let mut pumped = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Drive::Interrupted(Interrupt::Cancelled);
                }
                _ = sleep_until(deadline) => {
                    return Drive::Interrupted(Interrupt::TimedOut(self.max_duration.unwrap_or_default()));
                }
                result = &mut pump, if pumped.is_none() => {
                    if let Err(PumpError::Write(e)) = &result {
                        log::debug!("session {}: transcoder stopped taking input: {}", self.id, e);
                    }
                    pumped = Some(result);
                }
                outcome = &mut forward => {
                    return Drive::Finished { pump: pumped, forward: outcome };
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Copy raw bytes into the transcoder. Blocks whenever the transcoder is
/// not draining its stdin, which in turn stalls the source on its stdout.
async fn pump(
    mut reader: ChildStdout,
    mut writer: ChildStdin,
    stats: &SessionStats,
) -> Result<u64, PumpError> {
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(PumpError::Read)?;
        if n == 0 {
            break;
        }
        stats.source_bytes.fetch_add(n as u64, Ordering::Relaxed);
        writer
            .write_all(&buf[..n])
            .await
            .map_err(PumpError::Write)?;
        total += n as u64;
    }
    writer.shutdown().await.map_err(PumpError::Write)?;
    Ok(total)
}

/// Move encoded chunks into the channel. A full channel parks this loop, so
/// nothing more is read from the transcoder until the consumer catches up.
async fn forward(
    mut reader: ChildStdout,
    tx: &mpsc::Sender<PipelineResult<Bytes>>,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
    stats: &SessionStats,
) -> Forward {
    loop {
        let mut buf = BytesMut::with_capacity(chunk_size);
        let read = match idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, reader.read_buf(&mut buf)).await {
                Ok(read) => read,
                Err(_) => return Forward::Stalled(idle),
            },
            None => reader.read_buf(&mut buf).await,
        };
        match read {
            Ok(0) => return Forward::Eof,
            Ok(n) => {
                stats.output_bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => return Forward::ReadError(e),
        }
        if tx.send(Ok(buf.freeze())).await.is_err() {
            return Forward::ClientGone;
        }
    }
}

/// Natural end: let the process exit on its own within `grace`. Otherwise
/// kill it right away.
async fn reap(process: &mut ExternalProcess, natural: bool, grace: Duration) -> Option<Exit> {
    let result = if natural {
        process.finish(grace).await
    } else {
        process.kill().await
    };
    match result {
        Ok(exit) => Some(exit),
        Err(e) => {
            log::error!(
                "{}: could not reap {}: {}",
                process.label(),
                process.program(),
                e
            );
            None
        }
    }
}

fn failure_text(diagnostic: String, exit: Option<Exit>) -> String {
    if !diagnostic.is_empty() {
        return diagnostic;
    }
    match exit {
        Some(exit) => format!("exited with {}", exit.status),
        None => "exit status unknown".to_string(),
    }
}

fn classify(
    drive: Drive,
    source_exit: Option<Exit>,
    transcode_exit: Option<Exit>,
    source_diag: String,
    transcode_diag: String,
    stats: &SessionStats,
) -> Option<PipelineError> {
    let (pump, forward) = match drive {
        Drive::Interrupted(Interrupt::Cancelled) => return Some(PipelineError::ClientAborted),
        Drive::Interrupted(Interrupt::TimedOut(limit)) => {
            return Some(PipelineError::TimedOut(limit));
        }
        Drive::Finished { pump, forward } => (pump, forward),
    };

    match forward {
        Forward::Eof => {}
        Forward::ClientGone => return Some(PipelineError::ClientAborted),
        Forward::Stalled(idle) => return Some(PipelineError::Stalled(idle)),
        Forward::ReadError(e) => {
            return Some(PipelineError::TranscodeFailed {
                diagnostic: format!("reading transcoder output: {}", e),
            });
        }
    }

    let source_failed = source_exit.is_some_and(|exit| exit.failed());
    let transcode_failed = transcode_exit.is_some_and(|exit| exit.failed());
    let source_bytes = stats.source_bytes();

    if source_failed && source_bytes == 0 {
        return Some(PipelineError::SourceFetchFailed {
            diagnostic: failure_text(source_diag, source_exit),
        });
    }
    if transcode_failed {
        return Some(PipelineError::TranscodeFailed {
            diagnostic: failure_text(transcode_diag, transcode_exit),
        });
    }
    if source_failed {
        return Some(PipelineError::SourceInterrupted {
            after_bytes: source_bytes,
            diagnostic: failure_text(source_diag, source_exit),
        });
    }
    if let Some(Err(PumpError::Read(e))) = pump {
        return Some(PipelineError::SourceInterrupted {
            after_bytes: source_bytes,
            diagnostic: format!("reading source output: {}", e),
        });
    }
    if stats.output_bytes() == 0 {
        return Some(PipelineError::TranscodeFailed {
            diagnostic: "transcoder produced no output".to_string(),
        });
    }
    None
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
