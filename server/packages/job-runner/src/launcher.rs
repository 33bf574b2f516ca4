//! Script Launcher: turns a tool name and its parameters into a concrete
//! command line without spawning anything.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use toolbox_error::ToolboxError;

use crate::tools::{ToolCatalog, ToolParams};

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Directory the catalog's script paths are relative to.
    pub scripts_root: PathBuf,
    pub interpreter: String,
    /// Arguments placed before the script path.
    pub interpreter_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LauncherConfig {
    pub fn new(scripts_root: impl Into<PathBuf>) -> Self {
        Self {
            scripts_root: scripts_root.into(),
            ..Self::default()
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let interpreter = if cfg!(windows) { "python" } else { "python3" };
        let mut env = BTreeMap::new();
        env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        Self {
            scripts_root: PathBuf::from("."),
            interpreter: interpreter.to_string(),
            interpreter_args: vec!["-u".to_string()],
            env,
        }
    }
}

/// Everything needed to spawn one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub tool: String,
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub script: PathBuf,
}

impl LaunchPlan {
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_./=:".contains(ch))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCheck {
    pub tool: String,
    pub path: PathBuf,
    pub exists: bool,
}

#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    catalog: ToolCatalog,
    config: LauncherConfig,
}

impl ScriptLauncher {
    pub fn new(catalog: ToolCatalog, config: LauncherConfig) -> Self {
        Self { catalog, config }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn resolve(&self, tool: &str, params: &ToolParams) -> Result<LaunchPlan, ToolboxError> {
        let spec = self.catalog.get(tool).ok_or_else(|| ToolboxError::UnknownTool {
            tool: tool.to_string(),
        })?;
        let input = spec.build_input(params)?;

        let script = self.script_path(&spec.script);
        if !script.is_file() {
            tracing::warn!(tool, script = %script.display(), "script file missing");
            return Err(ToolboxError::MissingResource {
                tool: tool.to_string(),
                path: script.display().to_string(),
            });
        }
        let cwd = script
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.scripts_root.clone());

        let mut args = self.config.interpreter_args.clone();
        args.push(script.display().to_string());
        args.extend(input.args);

        Ok(LaunchPlan {
            tool: spec.name.clone(),
            program: self.config.interpreter.clone(),
            args,
            stdin: input.stdin,
            cwd,
            env: self.config.env.clone(),
            script,
        })
    }

    pub fn check_scripts(&self) -> Vec<ScriptCheck> {
        self.catalog
            .iter()
            .map(|spec| {
                let path = self.script_path(&spec.script);
                ScriptCheck {
                    tool: spec.name.clone(),
                    exists: path.is_file(),
                    path,
                }
            })
            .collect()
    }

    // The child runs from the script's own directory, so the path handed to
    // the interpreter must not depend on our working directory.
    fn script_path(&self, relative: &str) -> PathBuf {
        let joined = self.config.scripts_root.join(relative);
        std::path::absolute(&joined).unwrap_or(joined)
    }
}
