#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use toolbox_job_runner::{
    CancelConfig, JobRunner, LauncherConfig, RunnerConfig, ScriptLauncher, ToolCatalog,
};
use toolbox_server::router::{build_router, AppState};

const BUILD_FOLDER: &str = "read base\nread count\ni=1\nwhile [ \"$i\" -le \"$count\" ]; do\n  mkdir -p \"$base/$i\"\n  echo \"created $i\"\n  i=$((i+1))\ndone\n";
const UNZIP: &str = "read path\nread overwrite\nif [ ! -d \"$path\" ]; then\n  echo \"invalid path: $path\"\n  exit 2\nfi\necho \"overwrite=$overwrite\"\n";
const STOP_BUTTON: &str = "echo ready\nwhile true; do sleep 0.1; done\n";
const FRAME_TIMEOUT: Duration = Duration::from_secs(15);

struct TestApp {
    app: Router,
    root: TempDir,
}

impl TestApp {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("create scripts root");
        write_file(root.path(), "Claude/Build_folder.py", BUILD_FOLDER);
        write_file(root.path(), "Claude/Unzip.py", UNZIP);
        write_file(root.path(), "Claude/Test_stop_button.py", STOP_BUTTON);
        write_file(root.path(), "index.html", "<!doctype html><title>toolbox</title>");
        write_file(root.path(), "environment/app.js", "console.log('toolbox');");
        write_file(root.path(), "secret.txt", "do not serve");

        let launcher = ScriptLauncher::new(
            ToolCatalog::builtin(),
            LauncherConfig {
                scripts_root: root.path().to_path_buf(),
                interpreter: "sh".to_string(),
                interpreter_args: Vec::new(),
                env: BTreeMap::new(),
            },
        );
        let runner = JobRunner::new(
            launcher,
            RunnerConfig {
                max_concurrent_jobs: 0,
                ..RunnerConfig::default()
            },
            CancelConfig {
                grace: Duration::from_secs(1),
                kill_wait: Duration::from_secs(2),
            },
        );
        Self {
            app: build_router(AppState::new(runner)),
            root,
        }
    }
}

fn write_file(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create dir");
    }
    std::fs::write(path, body).expect("write file");
}

fn form_encode(pairs: &[(&str, &str)]) -> String {
    fn encode(value: &str) -> String {
        value
            .bytes()
            .map(|byte| match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (byte as char).to_string()
                }
                other => format!("%{other:02X}"),
            })
            .collect()
    }
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn form_request(path: &str, pairs: &[(&str, &str)]) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form_encode(pairs)))
        .expect("request")
}

fn multipart_request(path: &str, pairs: &[(&str, &str)]) -> Request<Body> {
    const BOUNDARY: &str = "toolbox-test-boundary";
    let mut body = String::new();
    for (name, value) in pairs {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request")
}

async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = tokio::time::timeout(FRAME_TIMEOUT, response.into_body().collect())
        .await
        .expect("body finished in time")
        .expect("read body")
        .to_bytes();
    (status, headers, bytes)
}

async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let (status, _, bytes) = send_request(app, builder.body(body).expect("request")).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

fn parse_frames(bytes: &[u8]) -> Vec<Value> {
    let text = std::str::from_utf8(bytes).expect("utf8 body");
    assert!(text.is_empty() || text.ends_with('\n'), "unterminated frame: {text:?}");
    text.lines()
        .map(|line| serde_json::from_str(line).expect("frame json"))
        .filter(|frame: &Value| frame["type"] != "ping")
        .collect()
}

fn frame_types(frames: &[Value]) -> Vec<&str> {
    frames
        .iter()
        .map(|frame| frame["type"].as_str().unwrap_or_default())
        .collect()
}

/// Reads NDJSON frames off a live response body.
struct FrameReader {
    body: Body,
    buffer: Vec<u8>,
}

impl FrameReader {
    fn new(body: Body) -> Self {
        Self {
            body,
            buffer: Vec::new(),
        }
    }

    async fn next(&mut self) -> Option<Value> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Some(serde_json::from_slice(&line).expect("frame json"));
            }
            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.body.frame())
                .await
                .expect("frame in time")?
                .expect("body frame");
            if let Ok(data) = frame.into_data() {
                self.buffer.extend_from_slice(&data);
            }
        }
    }

    async fn rest(mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next().await {
            if frame["type"] != "ping" {
                frames.push(frame);
            }
        }
        frames
    }
}

#[tokio::test]
async fn health_and_status_describe_the_server() {
    let test_app = TestApp::new();

    let (status, body) = send_json(&test_app.app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));

    let (status, body) = send_json(&test_app.app, Method::GET, "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["interpreter"], "sh");
    let scripts = body["available_scripts"].as_array().expect("scripts");
    assert_eq!(scripts.len(), 10);
    assert!(scripts.contains(&json!("test_stop_button")));
    assert_eq!(body["active_jobs"], json!([]));
}

#[tokio::test]
async fn openapi_document_is_served() {
    let test_app = TestApp::new();
    let (status, body) = send_json(&test_app.app, Method::GET, "/api/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/run-script"]["post"].is_object());
    assert!(body["components"]["schemas"]["ProblemDetails"].is_object());
}

#[tokio::test]
async fn rejected_runs_return_problem_details_and_spawn_nothing() {
    let test_app = TestApp::new();

    let (status, _, bytes) = send_request(
        &test_app.app,
        form_request("/api/run-script", &[("script", "format_disk")]),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let problem: Value = serde_json::from_slice(&bytes).expect("problem");
    assert_eq!(problem["type"], "urn:toolbox:error:unknown_tool");
    assert_eq!(problem["tool"], "format_disk");

    let (status, _, bytes) = send_request(
        &test_app.app,
        form_request("/api/run-script", &[("script", "copy_files"), ("source_path", "/a")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let problem: Value = serde_json::from_slice(&bytes).expect("problem");
    assert_eq!(problem["parameter"], "target_path");

    let (status, _, bytes) = send_request(
        &test_app.app,
        form_request("/api/run-script", &[("script", "rename_files"), ("path", "/tmp")]),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let problem: Value = serde_json::from_slice(&bytes).expect("problem");
    assert_eq!(problem["type"], "urn:toolbox:error:missing_resource");

    let (status, _, _) = send_request(
        &test_app.app,
        form_request("/api/run-script", &[("path", "/tmp")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/run-script")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("script=unzip"))
        .expect("request");
    let (status, _, _) = send_request(&test_app.app, request).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let (_, body) = send_json(&test_app.app, Method::GET, "/api/status", None).await;
    assert_eq!(body["active_jobs"], json!([]));
}

#[tokio::test]
async fn form_run_streams_ndjson_frames() {
    let test_app = TestApp::new();
    let target = test_app.root.path().join("out");
    let target_str = target.display().to_string();

    let (status, headers, bytes) = send_request(
        &test_app.app,
        form_request(
            "/api/run-script",
            &[("script", "build_folder"), ("path", &target_str), ("count", "3")],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok()),
        Some("application/x-ndjson; charset=utf-8")
    );
    assert!(headers.contains_key("x-job-id"));

    let frames = parse_frames(&bytes);
    assert_eq!(
        frame_types(&frames),
        vec!["output", "output", "output", "success", "end"]
    );
    assert_eq!(frames[0]["content"], "created 1");
    assert_eq!(frames[3]["exitCode"], 0);
    for n in 1..=3 {
        assert!(target.join(n.to_string()).is_dir());
    }
}

#[tokio::test]
async fn multipart_run_reports_script_failures() {
    let test_app = TestApp::new();
    let (status, _, bytes) = send_request(
        &test_app.app,
        multipart_request(
            "/api/run-script",
            &[("script", "unzip"), ("path", "/tmp/nonexistent-toolbox-dir")],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let frames = parse_frames(&bytes);
    assert_eq!(frame_types(&frames), vec!["output", "error", "end"]);
    assert_eq!(frames[0]["content"], "invalid path: /tmp/nonexistent-toolbox-dir");
    assert_eq!(frames[1]["exitCode"], 2);
}

#[tokio::test]
async fn json_run_accepts_nested_params() {
    let test_app = TestApp::new();
    let zips = test_app.root.path().join("zips");
    std::fs::create_dir_all(&zips).expect("mkdir");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/run-script")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "script": "unzip",
                "params": { "path": zips.display().to_string(), "overwrite": true }
            })
            .to_string(),
        ))
        .expect("request");
    let (status, _, bytes) = send_request(&test_app.app, request).await;

    assert_eq!(status, StatusCode::OK);
    let frames = parse_frames(&bytes);
    assert_eq!(frames[0]["content"], "overwrite=y");
    assert_eq!(frame_types(&frames), vec!["output", "success", "end"]);
}

#[tokio::test]
async fn stop_without_a_running_job_is_informational() {
    let test_app = TestApp::new();
    let (status, body) = send_json(&test_app.app, Method::POST, "/api/stop-script", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "info");

    let (status, body) =
        send_json(&test_app.app, Method::POST, "/api/stop-script?job_id=job-99", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "info");
    assert_eq!(body["message"], "job job-99 is not running");
}

#[tokio::test]
async fn stop_ends_a_running_stream_with_a_warning() {
    let test_app = TestApp::new();

    let response = test_app
        .app
        .clone()
        .oneshot(form_request("/api/run-script", &[("script", "test_stop_button")]))
        .await
        .expect("run handled");
    assert_eq!(response.status(), StatusCode::OK);
    let job_id = response
        .headers()
        .get("x-job-id")
        .and_then(|value| value.to_str().ok())
        .expect("job id header")
        .to_string();

    let mut reader = FrameReader::new(response.into_body());
    let first = reader.next().await.expect("first frame");
    assert_eq!(first["content"], "ready");

    let (_, body) = send_json(&test_app.app, Method::GET, "/api/status", None).await;
    assert_eq!(body["active_jobs"][0]["id"], job_id.as_str());
    assert_eq!(body["active_jobs"][0]["status"], "running");

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/api/stop-script?job_id={job_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["stopped"], json!([job_id]));

    let rest = reader.rest().await;
    let types = frame_types(&rest);
    assert_eq!(&types[types.len() - 2..], &["warning", "end"]);

    let (_, body) = send_json(&test_app.app, Method::GET, "/api/status", None).await;
    assert_eq!(body["active_jobs"], json!([]));
}

#[tokio::test]
async fn stop_accepts_a_form_body() {
    let test_app = TestApp::new();
    let response = test_app
        .app
        .clone()
        .oneshot(form_request("/api/run-script", &[("script", "test_stop_button")]))
        .await
        .expect("run handled");
    let job_id = response
        .headers()
        .get("x-job-id")
        .and_then(|value| value.to_str().ok())
        .expect("job id header")
        .to_string();
    let mut reader = FrameReader::new(response.into_body());
    reader.next().await.expect("first frame");

    let (status, _, bytes) = send_request(
        &test_app.app,
        form_request("/api/stop-script", &[("job_id", &job_id)]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["status"], "success");
    assert_eq!(frame_types(&reader.rest().await).last(), Some(&"end"));
}

#[tokio::test]
async fn ui_files_are_served_from_the_scripts_root() {
    let test_app = TestApp::new();

    let request = Request::builder().uri("/").body(Body::empty()).expect("request");
    let (status, headers, bytes) = send_request(&test_app.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok()),
        Some("text/html; charset=utf-8")
    );
    assert!(String::from_utf8_lossy(&bytes).contains("<title>toolbox</title>"));

    let request = Request::builder()
        .uri("/environment/app.js")
        .body(Body::empty())
        .expect("request");
    let (status, headers, _) = send_request(&test_app.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok()),
        Some("text/javascript; charset=utf-8")
    );

    for path in ["/environment/../secret.txt", "/environment/%2E%2E/secret.txt", "/environment/missing.js", "/nope"] {
        let request = Request::builder().uri(path).body(Body::empty()).expect("request");
        let (status, _, _) = send_request(&test_app.app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
    }
}
