//! Redirects the server's stdout/stderr into daily log files.

use std::path::Path;
use std::time::Duration;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::ServerLogs;

pub const LOG_FILE_PREFIX: &str = "toolbox-";

/// Redirection needs `dup2`; elsewhere the logs stay on the console.
#[cfg(not(unix))]
pub struct ServerLogs {
    path: std::path::PathBuf,
}

#[cfg(not(unix))]
impl ServerLogs {
    pub fn new(path: std::path::PathBuf, _retention: Duration) -> Self {
        Self { path }
    }

    pub fn start_sync(self) -> Result<std::thread::JoinHandle<()>, std::io::Error> {
        eprintln!(
            "log redirection to {} is not supported on this platform",
            self.path.display()
        );
        Ok(std::thread::spawn(|| {}))
    }
}

pub fn log_file_name(date: chrono::NaiveDate) -> String {
    format!("{LOG_FILE_PREFIX}{}.log", date.format("%Y-%m-%d"))
}

/// Deletes our log files last modified before `now - retention`.
pub fn prune_logs(dir: &Path, retention: Duration) -> Result<usize, std::io::Error> {
    let cutoff = std::time::SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(std::time::UNIX_EPOCH);
    let mut pruned = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        if entry.metadata()?.modified()? < cutoff && std::fs::remove_file(entry.path()).is_ok() {
            pruned += 1;
        }
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn file_names_sort_by_date() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 9).expect("date");
        assert_eq!(log_file_name(date), "toolbox-2024-03-09.log");
    }

    #[test]
    fn prune_only_touches_old_log_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = SystemTime::now() - Duration::from_secs(10 * 24 * 60 * 60);

        let stale = dir.path().join("toolbox-2020-01-01.log");
        File::create(&stale).expect("create").set_modified(old).expect("mtime");
        let unrelated = dir.path().join("notes.txt");
        File::create(&unrelated).expect("create").set_modified(old).expect("mtime");
        let fresh = dir.path().join("toolbox-2099-01-01.log");
        File::create(&fresh).expect("create");

        let pruned = prune_logs(dir.path(), Duration::from_secs(7 * 24 * 60 * 60)).expect("prune");
        assert_eq!(pruned, 1);
        assert!(!stale.exists());
        assert!(unrelated.exists());
        assert!(fresh.exists());
    }
}
