//! Runs allow-listed automation scripts as child process trees and streams
//! their merged output as frames.

pub mod cancel;
pub mod job;
pub mod launcher;
pub mod process_tree;
pub mod registry;
pub mod runner;
pub mod tools;

pub use cancel::{CancelConfig, CancellationHandler, StopOutcome, StopReport};
pub use job::{FrameKind, Job, JobId, JobInfo, JobStatus, StreamFrame};
pub use launcher::{LaunchPlan, LauncherConfig, ScriptCheck, ScriptLauncher};
pub use process_tree::{platform_killer, ProcessTreeKiller};
pub use registry::{ProcessHandle, ProcessRegistry, RegistryEntry};
pub use runner::{JobRunner, JobStream, RunnerConfig};
pub use tools::{ToolCatalog, ToolInput, ToolParams, ToolSpec};
