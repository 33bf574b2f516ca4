use std::io;
use std::process::{Command as StdCommand, Stdio};

use tokio::process::Command;

use super::ProcessTreeKiller;

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Uses `taskkill /T`, which walks the parent/child links of the tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskkillKiller;

impl TaskkillKiller {
    fn taskkill(pid: u32, force: bool) -> io::Result<()> {
        let mut command = StdCommand::new("taskkill");
        if force {
            command.arg("/F");
        }
        let status = command
            .args(["/T", "/PID", &pid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        // 128: no such process
        if status.success() || status.code() == Some(128) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("taskkill exited with {status}"),
            ))
        }
    }
}

impl ProcessTreeKiller for TaskkillKiller {
    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, false)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, true)
    }

    // `/T` cannot walk the tree from a root that has exited, and the pid may
    // already belong to someone else.
    fn has_survivors(&self, _pid: u32) -> bool {
        false
    }
}

pub fn configure_command(command: &mut Command) {
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}
