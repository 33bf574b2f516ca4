use std::sync::Arc;
use std::time::{Duration, Instant};

use toolbox_error::ToolboxError;

use crate::job::JobId;
use crate::process_tree::ProcessTreeKiller;
use crate::registry::{ProcessRegistry, RegistryEntry};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct CancelConfig {
    /// How long the tree gets to exit after the graceful signal.
    pub grace: Duration,
    /// How long to wait for the exit after the forceful kill.
    pub kill_wait: Duration,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            grace: DEFAULT_STOP_GRACE,
            kill_wait: DEFAULT_KILL_WAIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub job_id: JobId,
    pub pid: u32,
    /// The graceful signal was not enough and the tree had to be killed.
    pub escalated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(Vec<StopReport>),
    NothingRunning,
}

#[derive(Debug)]
pub struct CancellationHandler {
    registry: Arc<ProcessRegistry>,
    killer: Arc<dyn ProcessTreeKiller>,
    config: CancelConfig,
}

impl CancellationHandler {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        killer: Arc<dyn ProcessTreeKiller>,
        config: CancelConfig,
    ) -> Self {
        Self {
            registry,
            killer,
            config,
        }
    }

    pub fn config(&self) -> CancelConfig {
        self.config
    }

    pub async fn stop(&self, job_id: &JobId) -> Result<StopOutcome, ToolboxError> {
        let Some(entry) = self.registry.lookup_and_remove(job_id).await else {
            tracing::info!(job_id = %job_id, "stop requested but job is not running");
            return Ok(StopOutcome::NothingRunning);
        };
        let report = self.stop_entry(entry).await?;
        Ok(StopOutcome::Stopped(vec![report]))
    }

    /// Stop every live job. Keeps going past individual failures and reports
    /// the first one.
    pub async fn stop_all(&self) -> Result<StopOutcome, ToolboxError> {
        let entries = self.registry.remove_all().await;
        if entries.is_empty() {
            tracing::info!("stop requested but no job is running");
            return Ok(StopOutcome::NothingRunning);
        }

        let results = futures::future::join_all(
            entries.into_iter().map(|entry| self.stop_entry(entry)),
        )
        .await;

        let mut reports = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(StopOutcome::Stopped(reports)),
        }
    }

    // The entry is already out of the registry, so nothing here holds the lock.
    async fn stop_entry(&self, entry: RegistryEntry) -> Result<StopReport, ToolboxError> {
        let RegistryEntry { info, mut handle } = entry;
        let pid = handle.pid();
        let started = Instant::now();
        handle.request_cancel();

        tracing::info!(job_id = %info.id, tool = %info.tool, pid, "stopping job");

        if let Err(err) = self.killer.terminate(pid) {
            tracing::warn!(job_id = %info.id, pid, error = %err, "graceful terminate failed");
        }

        let escalated = match tokio::time::timeout(self.config.grace, handle.wait_exited()).await {
            Ok(()) => {
                // The root is reaped, so `pid` is only ours while members
                // that ignored the signal keep the group alive.
                if self.killer.has_survivors(pid) {
                    tracing::debug!(job_id = %info.id, pid, "sweeping leftover group members");
                    let _ = self.killer.kill(pid);
                }
                false
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %info.id,
                    pid,
                    grace_ms = self.config.grace.as_millis() as u64,
                    "job did not exit in time, killing process tree"
                );
                self.killer.kill(pid).map_err(|err| ToolboxError::StopFailed {
                    job_id: info.id.to_string(),
                    message: err.to_string(),
                })?;
                if tokio::time::timeout(self.config.kill_wait, handle.wait_exited())
                    .await
                    .is_err()
                {
                    tracing::error!(job_id = %info.id, pid, "job survived forceful kill");
                    return Err(ToolboxError::StopFailed {
                        job_id: info.id.to_string(),
                        message: format!(
                            "process {pid} still running {}ms after kill",
                            self.config.kill_wait.as_millis()
                        ),
                    });
                }
                true
            }
        };

        tracing::info!(
            job_id = %info.id,
            pid,
            escalated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job stopped"
        );

        Ok(StopReport {
            job_id: info.id,
            pid,
            escalated,
        })
    }
}
