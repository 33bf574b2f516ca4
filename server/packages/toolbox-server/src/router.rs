use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolbox_error::{ErrorType, ProblemDetails, ToolboxError};
use toolbox_job_runner::{
    FrameKind, JobId, JobInfo, JobRunner, JobStatus, StopOutcome, StreamFrame, ToolParams,
};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};

use crate::ui;

pub const JOB_ID_HEADER: &str = "x-job-id";
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson; charset=utf-8";

#[derive(Debug)]
pub struct AppState {
    runner: JobRunner,
}

impl AppState {
    pub fn new(runner: JobRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    fn site_root(&self) -> PathBuf {
        self.runner.launcher().config().scripts_root.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let api_router = Router::new()
        .route("/run-script", post(run_script))
        .route("/stop-script", post(stop_script))
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone());

    let mut router = Router::new()
        .nest("/api", api_router)
        .merge(ui::router(shared.site_root()))
        .fallback(not_found);

    let http_logging = match std::env::var("TOOLBOX_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::debug!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Stop every job that is still running.
pub async fn shutdown_jobs(state: &Arc<AppState>) {
    state.runner.shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(run_script, stop_script, get_status, get_health),
    components(
        schemas(
            RunScriptRequest,
            StopResponse,
            StopStatus,
            StatusResponse,
            HealthResponse,
            JobInfo,
            JobStatus,
            JobId,
            StreamFrame,
            FrameKind,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "jobs", description = "Running and stopping tools")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8000")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Toolbox(#[from] ToolboxError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Toolbox(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

fn invalid_request(message: impl Into<String>) -> ApiError {
    ToolboxError::InvalidRequest {
        message: message.into(),
    }
    .into()
}

/// JSON form of a run request. Form and multipart bodies carry the same
/// fields flat: `script` plus one field per parameter.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunScriptRequest {
    /// Tool name. `tool` is accepted as an alias.
    #[serde(alias = "tool")]
    pub script: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: BTreeMap<String, Value>,
}

/// Tool name and parameters, from any of the accepted body encodings.
#[derive(Debug)]
pub struct RunRequest {
    pub tool: String,
    pub params: ToolParams,
}

impl RunRequest {
    fn from_fields(mut fields: ToolParams) -> Result<Self, ApiError> {
        let tool = fields
            .remove("script")
            .or_else(|| fields.remove("tool"))
            .map(|tool| tool.trim().to_string())
            .filter(|tool| !tool.is_empty())
            .ok_or_else(|| invalid_request("missing `script` field"))?;
        Ok(Self {
            tool,
            params: fields,
        })
    }

    fn from_json(body: Value) -> Result<Self, ApiError> {
        let Value::Object(mut object) = body else {
            return Err(invalid_request("request body must be a JSON object"));
        };
        let nested = match object.remove("params") {
            Some(Value::Object(params)) => params,
            Some(Value::Null) | None => Default::default(),
            Some(_) => return Err(invalid_request("`params` must be an object")),
        };
        let mut fields = ToolParams::new();
        for (key, value) in object.into_iter().chain(nested) {
            let value = match value {
                Value::Null => continue,
                Value::String(value) => value,
                other => other.to_string(),
            };
            fields.insert(key, value);
        }
        Self::from_fields(fields)
    }
}

#[axum::async_trait]
impl<S> FromRequest<S> for RunRequest
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|err| invalid_request(err.body_text()))?;
            let mut fields = ToolParams::new();
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|err| invalid_request(err.body_text()))?
            {
                let Some(name) = field.name().map(str::to_string) else {
                    continue;
                };
                let value = field
                    .text()
                    .await
                    .map_err(|err| invalid_request(err.body_text()))?;
                fields.insert(name, value);
            }
            Self::from_fields(fields)
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(fields) = Form::<ToolParams>::from_request(req, state)
                .await
                .map_err(|err| invalid_request(err.body_text()))?;
            Self::from_fields(fields)
        } else if content_type.starts_with("application/json") {
            let Json(body) = Json::<Value>::from_request(req, state)
                .await
                .map_err(|err| invalid_request(err.body_text()))?;
            Self::from_json(body)
        } else {
            Err(ToolboxError::UnsupportedMediaType {
                message: if content_type.is_empty() {
                    "missing content type".to_string()
                } else {
                    content_type
                },
            }
            .into())
        }
    }
}

#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StopQuery {
    /// Job to stop. Without it every running job is stopped.
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StopStatus {
    Success,
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopResponse {
    pub status: StopStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stopped: Vec<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
    pub working_directory: String,
    pub version: String,
    pub interpreter: String,
    pub available_scripts: Vec<String>,
    pub active_jobs: Vec<JobInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[utoipa::path(
    post,
    path = "/api/run-script",
    request_body(
        content = RunScriptRequest,
        description = "Also accepted as form-urlencoded or multipart fields",
        content_type = "application/json"
    ),
    responses(
        (status = 200, description = "Newline-delimited stream of frames", body = StreamFrame, content_type = "application/x-ndjson"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails),
        (status = 415, body = ProblemDetails),
        (status = 500, body = ProblemDetails)
    ),
    tag = "jobs"
)]
async fn run_script(
    State(state): State<Arc<AppState>>,
    request: RunRequest,
) -> Result<Response, ApiError> {
    let RunRequest { tool, params } = request;
    let stream = state.runner.start(&tool, params).await?;
    let job_id = HeaderValue::from_str(stream.id().as_str())
        .map_err(|err| ToolboxError::StreamError {
            message: err.to_string(),
        })?;

    let body = Body::from_stream(
        stream
            .into_stream()
            .map(|frame| Ok::<_, Infallible>(frame.to_ndjson())),
    );
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(JOB_ID_HEADER, job_id);
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/api/stop-script",
    params(StopQuery),
    responses(
        (status = 200, body = StopResponse),
        (status = 500, body = StopResponse)
    ),
    tag = "jobs"
)]
async fn stop_script(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StopQuery>,
    form: Option<Form<StopQuery>>,
) -> (StatusCode, Json<StopResponse>) {
    let job_id = query
        .job_id
        .or_else(|| form.and_then(|Form(body)| body.job_id))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(JobId::new);

    let result = match &job_id {
        Some(id) => state.runner.stop(id).await,
        None => state.runner.stop_all().await,
    };

    match result {
        Ok(StopOutcome::Stopped(reports)) => {
            let stopped: Vec<JobId> = reports.into_iter().map(|report| report.job_id).collect();
            let names: Vec<&str> = stopped.iter().map(JobId::as_str).collect();
            (
                StatusCode::OK,
                Json(StopResponse {
                    status: StopStatus::Success,
                    message: format!("stopped {}", names.join(", ")),
                    stopped,
                }),
            )
        }
        Ok(StopOutcome::NothingRunning) => {
            let message = match &job_id {
                Some(id) => format!("job {id} is not running"),
                None => "no script is running".to_string(),
            };
            (
                StatusCode::OK,
                Json(StopResponse {
                    status: StopStatus::Info,
                    message,
                    stopped: Vec::new(),
                }),
            )
        }
        Err(err) => {
            tracing::error!(error = %err, "stop request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StopResponse {
                    status: StopStatus::Error,
                    message: err.to_string(),
                    stopped: Vec::new(),
                }),
            )
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/status",
    responses((status = 200, body = StatusResponse)),
    tag = "meta"
)]
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let working_directory = std::env::current_dir()
        .unwrap_or_else(|_| state.site_root())
        .display()
        .to_string();
    Json(StatusResponse {
        status: "running".to_string(),
        message: "toolbox server is running".to_string(),
        working_directory,
        version: env!("CARGO_PKG_VERSION").to_string(),
        interpreter: state.runner.launcher().config().interpreter.clone(),
        available_scripts: state.runner.catalog().names(),
        active_jobs: state.runner.registry().snapshot().await,
    })
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

const SERVER_INFO: &str = "\
This is a toolbox server. Available endpoints:\n\
  - GET  /                 - Web UI\n\
  - POST /api/run-script   - Run a tool, streams NDJSON frames\n\
  - POST /api/stop-script  - Stop running tools\n\
  - GET  /api/status       - Server status and tool list\n\
  - GET  /api/openapi.json - OpenAPI document\n";

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}
