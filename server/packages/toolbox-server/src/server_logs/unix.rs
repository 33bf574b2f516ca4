use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::{log_file_name, prune_logs};

const RETRY_DELAY: Duration = Duration::from_secs(60);

pub struct ServerLogs {
    path: PathBuf,
    retention: Duration,
    next_rotation: DateTime<Utc>,
}

impl ServerLogs {
    pub fn new(path: PathBuf, retention: Duration) -> Self {
        Self {
            path,
            retention,
            next_rotation: Utc::now(),
        }
    }

    /// Performs the first redirection before returning, so a bad log
    /// directory is reported while stderr still reaches the terminal.
    pub fn start_sync(mut self) -> Result<std::thread::JoinHandle<()>, std::io::Error> {
        std::fs::create_dir_all(&self.path)?;
        self.rotate_sync()?;

        Ok(std::thread::spawn(move || self.run_sync()))
    }

    fn run_sync(mut self) {
        loop {
            match (self.next_rotation - Utc::now()).to_std() {
                Ok(wait) if !wait.is_zero() => std::thread::sleep(wait),
                _ => {
                    if let Err(err) = self.rotate_sync() {
                        tracing::error!(?err, "failed logs rotation");
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }
    }

    fn rotate_sync(&mut self) -> Result<(), std::io::Error> {
        let now = Utc::now();
        let tomorrow = now
            .date_naive()
            .succ_opt()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "invalid date"))?;
        self.next_rotation = tomorrow.and_utc();

        let path = self.path.join(log_file_name(now.date_naive()));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let log_fd = log_file.as_raw_fd();

        // SAFETY: both descriptors are valid; dup2 leaves `log_fd` open until the file drops.
        let redirected = unsafe {
            libc::dup2(log_fd, libc::STDOUT_FILENO) != -1 && libc::dup2(log_fd, libc::STDERR_FILENO) != -1
        };
        if !redirected {
            return Err(std::io::Error::last_os_error());
        }

        let pruned = prune_logs(&self.path, self.retention)?;
        if pruned != 0 {
            tracing::debug!(pruned, "pruned old log files");
        }
        tracing::debug!(
            path = %path.display(),
            next_rotation_in = ?(self.next_rotation - now).max(TimeDelta::zero()),
            "rotated server logs"
        );
        Ok(())
    }
}
