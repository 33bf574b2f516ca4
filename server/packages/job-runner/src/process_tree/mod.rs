//! Tree-wide process termination.
//!
//! Tools may start their own children (ffmpeg for the video tools), so a stop
//! request has to reach the whole tree, not only the script we spawned.

use std::fmt::Debug;
use std::io;
use std::sync::Arc;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{configure_command, ProcessGroupKiller as PlatformKiller};
#[cfg(windows)]
pub use windows::{configure_command, TaskkillKiller as PlatformKiller};

pub trait ProcessTreeKiller: Debug + Send + Sync {
    /// Ask every process in the tree rooted at `pid` to exit.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forcefully end every process in the tree rooted at `pid`.
    fn kill(&self, pid: u32) -> io::Result<()>;

    /// Whether anything started under `pid` is still running after the root
    /// itself has been reaped. Only while this holds can `pid` not have been
    /// handed to a newer job.
    fn has_survivors(&self, pid: u32) -> bool;
}

pub fn platform_killer() -> Arc<dyn ProcessTreeKiller> {
    Arc::new(PlatformKiller)
}
