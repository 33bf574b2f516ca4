use std::io;

use tokio::process::Command;

use super::ProcessTreeKiller;

/// Every job is spawned as the leader of its own process group, so the group
/// id equals the child's pid and one signal reaches all of its descendants.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupKiller;

impl ProcessGroupKiller {
    fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
        let pgid = pid as libc::pid_t;
        if pgid <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid process group"));
        }
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // group already empty
            return Ok(());
        }
        Err(err)
    }
}

impl ProcessTreeKiller for ProcessGroupKiller {
    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::signal_group(pid, libc::SIGTERM)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::signal_group(pid, libc::SIGKILL)
    }

    // A group id stays reserved while any member lives, so a hit here is
    // still our tree.
    fn has_survivors(&self, pid: u32) -> bool {
        let pgid = pid as libc::pid_t;
        if pgid <= 0 {
            return false;
        }
        // SAFETY: signal 0 only checks for existence.
        if unsafe { libc::kill(-pgid, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

pub fn configure_command(command: &mut Command) {
    command.process_group(0);
}
