use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::tools::ToolParams;

/// Opaque job identifier. Issued by the registry and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Command resolved, process handle not obtained yet
    Starting,
    /// Process is running
    Running,
    /// Exited with code 0
    Completed,
    /// Exited on its own with a failure, or could not be spawned
    Failed,
    /// Stopped by the cancellation handler
    Terminated,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Starting, Self::Running | Self::Failed) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Terminated) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid job transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Public view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: JobId,
    pub tool: String,
    #[schema(value_type = Object)]
    pub params: ToolParams,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// One invocation of a tool, owned by the task driving it.
#[derive(Debug, Clone)]
pub struct Job {
    info: JobInfo,
}

impl Job {
    pub fn new(id: JobId, tool: &str, params: ToolParams) -> Self {
        Self {
            info: JobInfo {
                id,
                tool: tool.to_string(),
                params,
                status: JobStatus::Starting,
                pid: None,
                started_at: format_timestamp(),
                exit_code: None,
            },
        }
    }

    pub fn id(&self) -> &JobId {
        &self.info.id
    }

    pub fn tool(&self) -> &str {
        &self.info.tool
    }

    pub fn status(&self) -> JobStatus {
        self.info.status
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn mark_running(&mut self, pid: Option<u32>) -> Result<(), InvalidTransition> {
        self.advance(JobStatus::Running)?;
        self.info.pid = pid;
        Ok(())
    }

    pub fn finish(&mut self, status: JobStatus, exit_code: Option<i32>) -> Result<(), InvalidTransition> {
        self.advance(status)?;
        self.info.exit_code = exit_code;
        Ok(())
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.info.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.info.status,
                to: next,
            });
        }
        self.info.status = next;
        Ok(())
    }
}

fn format_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Output,
    Success,
    Warning,
    Error,
    End,
    /// Keep-alive sent while the job is silent; carries no content.
    Ping,
}

impl FrameKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Warning | Self::Error)
    }
}

/// A single record of a job's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl StreamFrame {
    pub fn output(line: impl Into<String>) -> Self {
        Self::new(FrameKind::Output, line)
    }

    pub fn success(exit_code: i32) -> Self {
        Self {
            kind: FrameKind::Success,
            content: format!("=== script finished, exit code: {exit_code} ==="),
            exit_code: Some(exit_code),
        }
    }

    pub fn terminated() -> Self {
        Self::new(FrameKind::Warning, "=== script terminated by user ===")
    }

    pub fn failed(exit_code: Option<i32>, detail: &str) -> Self {
        Self {
            kind: FrameKind::Error,
            content: format!("=== script failed, {detail} ==="),
            exit_code,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FrameKind::Error, message)
    }

    pub fn end() -> Self {
        Self::new(FrameKind::End, "")
    }

    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, "")
    }

    fn new(kind: FrameKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            exit_code: None,
        }
    }

    /// Serialize as one newline-terminated JSON line.
    pub fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|err| {
            format!(r#"{{"type":"error","content":"failed to encode frame: {err}"}}"#)
        });
        line.push('\n');
        line
    }
}
