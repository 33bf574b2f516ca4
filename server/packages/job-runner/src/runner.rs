//! Job orchestration and the Output Streamer.
//!
//! `JobRunner::start` spawns the resolved command as its own process group,
//! registers it and hands back a frame receiver. A driver task per job owns the
//! child: it forwards merged stdout/stderr line by line, reaps the process and
//! emits exactly one terminal frame followed by `end`.

use std::io::{BufRead, BufReader, Read};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_stream::wrappers::ReceiverStream;
use toolbox_error::ToolboxError;

use crate::cancel::{CancelConfig, CancellationHandler, StopOutcome};
use crate::job::{Job, JobId, JobStatus, StreamFrame};
use crate::launcher::{LaunchPlan, ScriptLauncher};
use crate::process_tree::{self, ProcessTreeKiller};
use crate::registry::{ProcessHandle, ProcessRegistry, RegistryEntry};
use crate::tools::{ToolCatalog, ToolParams};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Idle time after which a `ping` frame is sent.
    pub ping_interval: Duration,
    /// How long to keep forwarding output after the root process exited.
    /// Grandchildren may still hold the pipe open.
    pub drain_timeout: Duration,
    /// Jobs allowed to run at once. Zero means no limit.
    pub max_concurrent_jobs: usize,
    pub frame_buffer: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_concurrent_jobs: 1,
            frame_buffer: 64,
        }
    }
}

/// Frames of one job, in order. Dropping it counts as a client disconnect and
/// stops the job.
#[derive(Debug)]
pub struct JobStream {
    id: JobId,
    frames: mpsc::Receiver<StreamFrame>,
}

impl JobStream {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        self.frames.recv().await
    }

    pub async fn collect_frames(mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.frames.recv().await {
            frames.push(frame);
        }
        frames
    }

    pub fn into_stream(self) -> ReceiverStream<StreamFrame> {
        ReceiverStream::new(self.frames)
    }
}

#[derive(Debug)]
pub struct JobRunner {
    launcher: ScriptLauncher,
    registry: Arc<ProcessRegistry>,
    canceller: Arc<CancellationHandler>,
    config: RunnerConfig,
    slots: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(launcher: ScriptLauncher, config: RunnerConfig, cancel: CancelConfig) -> Self {
        Self::with_killer(launcher, config, cancel, process_tree::platform_killer())
    }

    pub fn with_killer(
        launcher: ScriptLauncher,
        config: RunnerConfig,
        cancel: CancelConfig,
        killer: Arc<dyn ProcessTreeKiller>,
    ) -> Self {
        let registry = Arc::new(ProcessRegistry::new());
        let canceller = Arc::new(CancellationHandler::new(registry.clone(), killer, cancel));
        let permits = match config.max_concurrent_jobs {
            0 => Semaphore::MAX_PERMITS,
            limit => limit,
        };
        Self {
            launcher,
            registry,
            canceller,
            config,
            slots: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn canceller(&self) -> &Arc<CancellationHandler> {
        &self.canceller
    }

    pub fn catalog(&self) -> &ToolCatalog {
        self.launcher.catalog()
    }

    pub fn launcher(&self) -> &ScriptLauncher {
        &self.launcher
    }

    pub fn config(&self) -> RunnerConfig {
        self.config
    }

    /// Start `tool`. Rejections come back as errors with nothing spawned; once
    /// this returns `Ok` the job is already visible to stop requests.
    pub async fn start(&self, tool: &str, params: ToolParams) -> Result<JobStream, ToolboxError> {
        let plan = self.launcher.resolve(tool, &params)?;
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|err| match err {
                TryAcquireError::NoPermits | TryAcquireError::Closed => {
                    tracing::info!(tool, limit = self.config.max_concurrent_jobs, "job limit reached");
                    ToolboxError::JobLimitReached {
                        limit: self.config.max_concurrent_jobs,
                    }
                }
            })?;

        let mut job = Job::new(self.registry.next_job_id(), tool, params);
        tracing::info!(
            job_id = %job.id(),
            tool,
            command = %plan.display(),
            cwd = %plan.cwd.display(),
            "spawning job"
        );

        let spawn_start = Instant::now();
        let (mut child, output) = match spawn(&plan) {
            Ok(spawned) => spawned,
            Err(err) => {
                tracing::error!(job_id = %job.id(), tool, error = %err, "failed to spawn job");
                if let Err(transition) = job.advance(JobStatus::Failed) {
                    tracing::warn!(job_id = %job.id(), error = %transition, "unexpected job state");
                }
                let err = ToolboxError::SpawnFailed {
                    tool: tool.to_string(),
                    message: err.to_string(),
                };
                return Ok(failed_to_start(job.id().clone(), &err));
            }
        };

        // Only `None` once the child has been reaped, which cannot have happened yet.
        let pid = child.id().unwrap_or_default();
        if let Err(err) = job.mark_running(Some(pid)) {
            tracing::warn!(job_id = %job.id(), error = %err, "unexpected job state");
        }
        tracing::info!(
            job_id = %job.id(),
            tool,
            pid,
            spawn_ms = spawn_start.elapsed().as_millis() as u64,
            "job started"
        );

        let cancelled = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = watch::channel(false);
        self.registry
            .register(RegistryEntry {
                info: job.info().clone(),
                handle: ProcessHandle::new(pid, cancelled.clone(), exited_rx),
            })
            .await;

        write_stdin(&mut child, plan.stdin, job.id().clone());
        let lines = forward_lines(output, self.config.frame_buffer, job.id().clone());

        let (frames_tx, frames_rx) = mpsc::channel(self.config.frame_buffer.max(1));
        let id = job.id().clone();
        let driver = JobDriver {
            _permit: permit,
            job,
            pid,
            lines,
            frames: frames_tx,
            exited: exited_tx,
            cancelled,
            registry: self.registry.clone(),
            canceller: self.canceller.clone(),
            config: self.config,
        };
        tokio::spawn(driver.run(child));

        Ok(JobStream { id, frames: frames_rx })
    }

    pub async fn stop(&self, job_id: &JobId) -> Result<StopOutcome, ToolboxError> {
        self.canceller.stop(job_id).await
    }

    pub async fn stop_all(&self) -> Result<StopOutcome, ToolboxError> {
        self.canceller.stop_all().await
    }

    /// Stop everything that is still running. Called on server shutdown.
    pub async fn shutdown(&self) {
        match self.canceller.stop_all().await {
            Ok(StopOutcome::Stopped(reports)) => {
                tracing::info!(count = reports.len(), "stopped running jobs on shutdown");
            }
            Ok(StopOutcome::NothingRunning) => {}
            Err(err) => tracing::error!(error = %err, "failed to stop jobs on shutdown"),
        }
    }
}

/// Spawn with stdout and stderr on the same pipe so their relative order is kept.
fn spawn(plan: &LaunchPlan) -> std::io::Result<(Child, std::io::PipeReader)> {
    let (reader, writer) = std::io::pipe()?;
    let writer_err = writer.try_clone()?;

    let mut command = Command::new(&plan.program);
    command
        .args(&plan.args)
        .current_dir(&plan.cwd)
        .envs(&plan.env)
        .stdin(Stdio::piped())
        .stdout(writer)
        .stderr(writer_err);
    process_tree::configure_command(&mut command);

    let child = command.spawn()?;
    // Releases our copies of the write end; otherwise the reader never sees EOF.
    drop(command);
    Ok((child, reader))
}

/// The request was already accepted, so a spawn failure travels in-band.
fn failed_to_start(id: JobId, err: &ToolboxError) -> JobStream {
    let (tx, rx) = mpsc::channel(2);
    let _ = tx.try_send(StreamFrame::error(format!("=== {err} ===")));
    let _ = tx.try_send(StreamFrame::end());
    JobStream { id, frames: rx }
}

/// Feed the prepared answers and close stdin so prompts never block forever.
fn write_stdin(child: &mut Child, payload: Option<String>, job_id: JobId) {
    let Some(mut stdin) = child.stdin.take() else {
        return;
    };
    let Some(payload) = payload else {
        drop(stdin);
        return;
    };
    tokio::spawn(async move {
        if let Err(err) = stdin.write_all(payload.as_bytes()).await {
            // the script may exit without reading its prompts
            tracing::debug!(job_id = %job_id, error = %err, "failed to write job stdin");
            return;
        }
        if let Err(err) = stdin.shutdown().await {
            tracing::debug!(job_id = %job_id, error = %err, "failed to close job stdin");
        }
    });
}

fn forward_lines<R>(output: R, buffer: usize, job_id: JobId) -> mpsc::Receiver<String>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(output);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches('\n').trim_end_matches('\r');
                    if tx.blocking_send(line.to_string()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "failed to read job output");
                    break;
                }
            }
        }
        tracing::debug!(job_id = %job_id, "job output closed");
    });
    rx
}

struct JobDriver {
    // Dropped before `frames`, so the slot is free once the stream closes.
    _permit: OwnedSemaphorePermit,
    job: Job,
    pid: u32,
    lines: mpsc::Receiver<String>,
    frames: mpsc::Sender<StreamFrame>,
    exited: watch::Sender<bool>,
    cancelled: Arc<AtomicBool>,
    registry: Arc<ProcessRegistry>,
    canceller: Arc<CancellationHandler>,
    config: RunnerConfig,
}

impl JobDriver {
    async fn run(mut self, mut child: Child) {
        let started = Instant::now();
        let mut emitted: u64 = 0;
        let mut lines_open = true;
        let mut disconnected = false;

        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let wait = child.wait();
        tokio::pin!(wait);

        let result = loop {
            tokio::select! {
                result = &mut wait => break result,
                line = self.lines.recv(), if lines_open => match line {
                    Some(line) => {
                        ping.reset();
                        emitted += 1;
                        if !disconnected && self.frames.send(StreamFrame::output(line)).await.is_err() {
                            disconnected = true;
                            self.client_gone();
                        }
                    }
                    None => lines_open = false,
                },
                _ = ping.tick(), if !disconnected => {
                    if self.frames.send(StreamFrame::ping()).await.is_err() {
                        disconnected = true;
                        self.client_gone();
                    }
                }
                _ = self.frames.closed(), if !disconnected => {
                    disconnected = true;
                    self.client_gone();
                }
            }
        };

        // A stop request may be waiting on this.
        let _ = self.exited.send(true);
        self.registry.lookup_and_remove(self.job.id()).await;

        if lines_open {
            // Idle deadline: only silence counts, never time spent blocked on a slow client.
            let idle = self.config.drain_timeout;
            let deadline = tokio::time::sleep(idle);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    biased;
                    line = self.lines.recv() => match line {
                        Some(line) => {
                            emitted += 1;
                            if !disconnected && self.frames.send(StreamFrame::output(line)).await.is_err() {
                                disconnected = true;
                            }
                            deadline.as_mut().reset(tokio::time::Instant::now() + idle);
                        }
                        None => break,
                    },
                    _ = &mut deadline => {
                        tracing::debug!(
                            job_id = %self.job.id(),
                            idle_ms = idle.as_millis() as u64,
                            "output still open after exit, giving up"
                        );
                        break;
                    }
                }
            }
        }

        let (frame, status, exit_code) = self.classify(result);
        if let Err(err) = self.job.finish(status, exit_code) {
            tracing::warn!(job_id = %self.job.id(), error = %err, "unexpected job state");
        }
        tracing::info!(
            job_id = %self.job.id(),
            tool = %self.job.tool(),
            pid = self.pid,
            status = ?status,
            exit_code = ?exit_code,
            lines = emitted,
            disconnected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );

        if !disconnected && self.frames.send(frame).await.is_ok() {
            let _ = self.frames.send(StreamFrame::end()).await;
        }
    }

    fn classify(&self, result: std::io::Result<ExitStatus>) -> (StreamFrame, JobStatus, Option<i32>) {
        match result {
            Err(err) => {
                tracing::error!(job_id = %self.job.id(), error = %err, "failed to wait for job");
                (
                    StreamFrame::error(format!("=== failed to wait for script: {err} ===")),
                    JobStatus::Failed,
                    None,
                )
            }
            Ok(status) if self.cancelled.load(Ordering::SeqCst) => {
                (StreamFrame::terminated(), JobStatus::Terminated, status.code())
            }
            Ok(status) if status.success() => (StreamFrame::success(0), JobStatus::Completed, Some(0)),
            Ok(status) => {
                let code = status.code();
                (
                    StreamFrame::failed(code, &describe_exit(status)),
                    JobStatus::Failed,
                    code,
                )
            }
        }
    }

    // Stopping waits on the exit watch this task publishes, so it runs apart.
    fn client_gone(&self) {
        let id = self.job.id().clone();
        tracing::info!(job_id = %id, "client disconnected, stopping job");
        let canceller = self.canceller.clone();
        tokio::spawn(async move {
            if let Err(err) = canceller.stop(&id).await {
                tracing::error!(job_id = %id, error = %err, "failed to stop orphaned job");
            }
        });
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code: {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }
    "exit status unknown".to_string()
}
