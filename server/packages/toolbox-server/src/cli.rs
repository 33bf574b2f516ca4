use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use thiserror::Error;
use toolbox_job_runner::{
    CancelConfig, JobRunner, LauncherConfig, RunnerConfig, ScriptLauncher, ToolCatalog,
};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{build_router_with_state, shutdown_jobs, AppState, JOB_ID_HEADER};
use crate::server_logs::ServerLogs;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_INTERPRETER: &str = if cfg!(windows) { "python" } else { "python3" };
const LOGS_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Parser, Debug)]
#[command(name = "toolbox", bin_name = "toolbox")]
#[command(about = "Runs local automation scripts from a browser", version)]
#[command(arg_required_else_help = true)]
pub struct ToolboxCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Server(ServerArgs),
    /// List the known tools and whether their scripts are present.
    Tools(ToolsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ScriptArgs {
    /// Directory holding the tool scripts, `index.html` and `environment/`.
    #[arg(long, short = 'r', default_value = ".")]
    scripts_root: PathBuf,

    #[arg(long, default_value = DEFAULT_INTERPRETER)]
    interpreter: String,

    /// Argument passed to the interpreter before the script. Repeatable.
    #[arg(long = "interpreter-arg", default_values_t = ["-u".to_string()], allow_hyphen_values = true)]
    interpreter_args: Vec<String>,
}

impl ScriptArgs {
    fn launcher(&self) -> ScriptLauncher {
        let config = LauncherConfig {
            scripts_root: self.scripts_root.clone(),
            interpreter: self.interpreter.clone(),
            interpreter_args: self.interpreter_args.clone(),
            ..LauncherConfig::default()
        };
        ScriptLauncher::new(ToolCatalog::builtin(), config)
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(flatten)]
    scripts: ScriptArgs,

    /// Jobs allowed to run at once; 0 removes the limit.
    #[arg(long, default_value_t = 1)]
    max_jobs: usize,

    /// Time a stopped job gets to exit before it is killed.
    #[arg(long, default_value_t = 3000)]
    stop_grace_ms: u64,

    /// Time to wait for the exit after a forced kill.
    #[arg(long, default_value_t = 2000)]
    kill_wait_ms: u64,

    /// Idle seconds before a keep-alive frame is streamed.
    #[arg(long, default_value_t = 15)]
    ping_interval_secs: u64,

    /// Allowed origin. Repeatable; any origin is allowed when omitted.
    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    /// Write stdout/stderr to daily files in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write logs to files under TOOLBOX_LOG_DIR or the user data directory.
    #[arg(long, conflicts_with = "log_dir")]
    log_to_file: bool,
}

#[derive(Args, Debug)]
pub struct ToolsArgs {
    #[command(flatten)]
    scripts: ScriptArgs,

    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors {kind}: {value}")]
    InvalidCors { kind: &'static str, value: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_toolbox() -> Result<(), CliError> {
    let ToolboxCli { command } = ToolboxCli::parse();
    if let Command::Server(args) = &command {
        maybe_redirect_server_logs(args);
    }
    init_logging();
    run_command(&command)
}

/// logfmt on stderr, filtered by `RUST_LOG` (default `info`). When server
/// logs are redirected, stderr already points at the day's file.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let logfmt = tracing_logfmt::builder().layer().with_writer(std::io::stderr);
    if let Err(err) = tracing_subscriber::registry().with(filter).with(logfmt).try_init() {
        eprintln!("failed to init logging: {err}");
    }
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Tools(args) => run_tools(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let launcher = server.scripts.launcher();
    for check in launcher.check_scripts() {
        if !check.exists {
            tracing::warn!(tool = %check.tool, path = %check.path.display(), "script missing");
        }
    }

    let runner = JobRunner::new(
        launcher,
        RunnerConfig {
            ping_interval: Duration::from_secs(server.ping_interval_secs.max(1)),
            max_concurrent_jobs: server.max_jobs,
            ..RunnerConfig::default()
        },
        CancelConfig {
            grace: Duration::from_millis(server.stop_grace_ms),
            kill_wait: Duration::from_millis(server.kill_wait_ms),
        },
    );
    let state = Arc::new(AppState::new(runner));
    let (mut router, state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let display_host = match server.host.as_str() {
        "0.0.0.0" | "::" => "localhost",
        other => other,
    };
    let ui_url = format!("http://{}:{}/", display_host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            scripts_root = %server.scripts.scripts_root.display(),
            "server listening"
        );
        tracing::info!(url = %ui_url, "ui available");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
                shutdown_jobs(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_tools(args: &ToolsArgs) -> Result<(), CliError> {
    let launcher = args.scripts.launcher();
    let checks = launcher.check_scripts();

    if args.json {
        let tools: Vec<_> = checks
            .iter()
            .map(|check| {
                json!({
                    "tool": check.tool,
                    "script": check.path.display().to_string(),
                    "present": check.exists,
                    "description": launcher
                        .catalog()
                        .get(&check.tool)
                        .map(|spec| spec.description.as_str())
                        .unwrap_or_default(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    let width = checks.iter().map(|check| check.tool.len()).max().unwrap_or(0);
    for check in &checks {
        let marker = if check.exists { "ok" } else { "missing" };
        println!(
            "{:<width$}  {:<7}  {}",
            check.tool,
            marker,
            check.path.display()
        );
    }
    Ok(())
}

fn default_server_log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLBOX_LOG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("toolbox").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".").join(".toolbox").join("logs"))
}

fn maybe_redirect_server_logs(server: &ServerArgs) {
    let log_dir = match (&server.log_dir, server.log_to_file) {
        (Some(dir), _) => dir.clone(),
        (None, true) => default_server_log_dir(),
        (None, false) => return,
    };
    if let Err(err) = ServerLogs::new(log_dir, LOGS_RETENTION).start_sync() {
        eprintln!("failed to redirect logs: {err}");
    }
}

/// `None` means the flag was not given, which allows anything.
fn parse_cors_list<T: FromStr>(kind: &'static str, values: &[String]) -> Result<Option<Vec<T>>, CliError> {
    if values.is_empty() {
        return Ok(None);
    }
    values
        .iter()
        .map(|value| {
            value.parse().map_err(|_| CliError::InvalidCors {
                kind,
                value: value.clone(),
            })
        })
        .collect::<Result<Vec<T>, _>>()
        .map(Some)
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let origins = parse_cors_list::<HeaderValue>("origin", &server.cors_allow_origin)?;
    let methods = parse_cors_list::<Method>("method", &server.cors_allow_method)?;
    let headers = parse_cors_list::<HeaderName>("header", &server.cors_allow_header)?;

    // The page reads the job id header, and may be opened straight from disk.
    let cors = CorsLayer::new().expose_headers([HeaderName::from_static(JOB_ID_HEADER)]);
    let cors = match origins {
        Some(origins) => cors.allow_origin(origins),
        None => cors.allow_origin(Any),
    };
    let cors = match methods {
        Some(methods) => cors.allow_methods(methods),
        None => cors.allow_methods(Any),
    };
    Ok(match headers {
        Some(headers) => cors.allow_headers(headers),
        None => cors.allow_headers(Any),
    })
}
