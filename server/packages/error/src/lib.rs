use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnsupportedMediaType,
    UnknownTool,
    MissingParameter,
    MissingResource,
    JobLimitReached,
    SpawnFailed,
    StopFailed,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:toolbox:error:invalid_request",
            Self::UnsupportedMediaType => "urn:toolbox:error:unsupported_media_type",
            Self::UnknownTool => "urn:toolbox:error:unknown_tool",
            Self::MissingParameter => "urn:toolbox:error:missing_parameter",
            Self::MissingResource => "urn:toolbox:error:missing_resource",
            Self::JobLimitReached => "urn:toolbox:error:job_limit_reached",
            Self::SpawnFailed => "urn:toolbox:error:spawn_failed",
            Self::StopFailed => "urn:toolbox:error:stop_failed",
            Self::StreamError => "urn:toolbox:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::UnknownTool => "Unknown Tool",
            Self::MissingParameter => "Missing Parameter",
            Self::MissingResource => "Missing Resource",
            Self::JobLimitReached => "Job Limit Reached",
            Self::SpawnFailed => "Spawn Failed",
            Self::StopFailed => "Stop Failed",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnsupportedMediaType => 415,
            Self::UnknownTool => 404,
            Self::MissingParameter => 400,
            Self::MissingResource => 500,
            Self::JobLimitReached => 409,
            Self::SpawnFailed => 500,
            Self::StopFailed => 500,
            Self::StreamError => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolboxError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String },
    #[error("no such tool: {tool}")]
    UnknownTool { tool: String },
    #[error("tool {tool} requires parameter `{parameter}`")]
    MissingParameter { tool: String, parameter: String },
    #[error("script for tool {tool} not found: {path}")]
    MissingResource { tool: String, path: String },
    #[error("job limit reached ({limit} running)")]
    JobLimitReached { limit: usize },
    #[error("failed to start {tool}: {message}")]
    SpawnFailed { tool: String, message: String },
    #[error("failed to stop {job_id}: {message}")]
    StopFailed { job_id: String, message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl ToolboxError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnsupportedMediaType { .. } => ErrorType::UnsupportedMediaType,
            Self::UnknownTool { .. } => ErrorType::UnknownTool,
            Self::MissingParameter { .. } => ErrorType::MissingParameter,
            Self::MissingResource { .. } => ErrorType::MissingResource,
            Self::JobLimitReached { .. } => ErrorType::JobLimitReached,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::StopFailed { .. } => ErrorType::StopFailed,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    /// Structured fields attached to the problem document next to `detail`.
    fn extensions(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Self::InvalidRequest { .. }
            | Self::UnsupportedMediaType { .. }
            | Self::StreamError { .. } => {}
            Self::UnknownTool { tool } | Self::SpawnFailed { tool, .. } => {
                map.insert("tool".to_string(), Value::String(tool.clone()));
            }
            Self::MissingParameter { tool, parameter } => {
                map.insert("tool".to_string(), Value::String(tool.clone()));
                map.insert("parameter".to_string(), Value::String(parameter.clone()));
            }
            Self::MissingResource { tool, path } => {
                map.insert("tool".to_string(), Value::String(tool.clone()));
                map.insert("path".to_string(), Value::String(path.clone()));
            }
            Self::JobLimitReached { limit } => {
                map.insert("limit".to_string(), Value::from(*limit as u64));
            }
            Self::StopFailed { job_id, .. } => {
                map.insert("jobId".to_string(), Value::String(job_id.clone()));
            }
        }
        map
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.extensions = self.extensions();
        problem
    }
}

impl From<ToolboxError> for ProblemDetails {
    fn from(value: ToolboxError) -> Self {
        value.to_problem_details()
    }
}

impl From<&ToolboxError> for ProblemDetails {
    fn from(value: &ToolboxError) -> Self {
        value.to_problem_details()
    }
}
