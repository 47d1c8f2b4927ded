use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    time::{Duration, SystemTime},
};

use futures_util::future::join_all;
use tracing::{debug, warn};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    Copy,
    Move,
}

impl IoOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Move => "move",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub modified: SystemTime,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub entries: Vec<DirectoryEntry>,
    pub newest: Option<DirectoryEntry>,
}

#[derive(Debug)]
pub struct RemovePathsError {
    pub failures: Vec<(PathBuf, io::Error)>,
}

impl std::fmt::Display for RemovePathsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to remove {} path(s):", self.failures.len())?;
        for (path, err) in &self.failures {
            write!(f, " {} ({err})", path.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for RemovePathsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|(_, err)| err as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug)]
pub struct IoRetriesExhausted {
    pub operation: IoOperation,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub attempts: u32,
    pub last_error: io::Error,
}

impl std::fmt::Display for IoRetriesExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {} failed after {} attempt(s): {}",
            self.operation.as_str(),
            self.source.display(),
            self.destination.display(),
            self.attempts,
            self.last_error
        )
    }
}

impl std::error::Error for IoRetriesExhausted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Lists `root` and picks the most recently modified entry accepted by `filter`.
///
/// Entries are visited in name order so that equal modification times resolve
/// the same way on every run. A missing `root` is an empty scan.
pub async fn find_newest_entry<F>(root: &Path, filter: F) -> io::Result<Scan>
where
    F: Fn(&str) -> bool,
{
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Scan::default()),
        Err(err) => return Err(err),
    };

    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            // Vanished between listing and stat.
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        entries.push(DirectoryEntry {
            name,
            modified: meta.modified()?,
            is_dir: meta.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut newest: Option<&DirectoryEntry> = None;
    for entry in entries.iter().filter(|e| filter(&e.name)) {
        if newest.is_none_or(|n| entry.modified > n.modified) {
            newest = Some(entry);
        }
    }
    let newest = newest.cloned();

    Ok(Scan { entries, newest })
}

async fn remove_path(path: &Path) -> io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let res = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match res {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Recursively deletes every path, skipping those that do not exist.
///
/// A failure does not stop the remaining deletions; all failures are reported
/// together.
pub async fn remove_paths<P>(paths: &[P]) -> Result<(), RemovePathsError>
where
    P: AsRef<Path>,
{
    let mut failures = Vec::new();
    for path in paths {
        let path = path.as_ref();
        match remove_path(path).await {
            Ok(true) => debug!(path = %path.display(), "removed"),
            Ok(false) => {}
            Err(err) => {
                debug!(path = %path.display(), error = %err, "could not remove");
                failures.push((path.to_path_buf(), err));
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(RemovePathsError { failures })
    }
}

fn copy_recursive<'a>(
    source: &'a Path,
    destination: &'a Path,
) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let meta = tokio::fs::metadata(source).await?;
        if !meta.is_dir() {
            tokio::fs::copy(source, destination).await?;
            return Ok(());
        }

        tokio::fs::create_dir_all(destination).await?;
        let mut dir = tokio::fs::read_dir(source).await?;
        while let Some(entry) = dir.next_entry().await? {
            let child_dst = destination.join(entry.file_name());
            copy_recursive(&entry.path(), &child_dst).await?;
        }
        Ok(())
    })
}

async fn move_path(source: &Path, destination: &Path) -> io::Result<()> {
    match tokio::fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            copy_recursive(source, destination).await?;
            remove_path(source).await.map(|_| ())
        }
        Err(err) => Err(err),
    }
}

async fn run_once(operation: IoOperation, source: &Path, destination: &Path) -> io::Result<()> {
    match operation {
        IoOperation::Copy => copy_recursive(source, destination).await,
        IoOperation::Move => move_path(source, destination).await,
    }
}

/// Performs one copy or move, retrying after `policy.delay` until
/// `policy.attempts` attempts have failed.
pub async fn io_operation_with_retries(
    operation: IoOperation,
    source: &Path,
    destination: &Path,
    policy: RetryPolicy,
) -> Result<(), IoRetriesExhausted> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match run_once(operation, source, destination).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= attempts => {
                return Err(IoRetriesExhausted {
                    operation,
                    source: source.to_path_buf(),
                    destination: destination.to_path_buf(),
                    attempts: attempt,
                    last_error: err,
                });
            }
            Err(err) => {
                warn!(
                    operation = operation.as_str(),
                    source = %source.display(),
                    destination = %destination.display(),
                    attempt,
                    error = %err,
                    "io operation failed; retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// Runs [`io_operation_with_retries`] for every pair concurrently.
///
/// Every operation is allowed to settle; the first failure in pair order is
/// returned. Nothing is rolled back.
pub async fn batch_io_operation_with_retries(
    operation: IoOperation,
    pairs: &[(PathBuf, PathBuf)],
    policy: RetryPolicy,
) -> Result<(), IoRetriesExhausted> {
    let tasks = pairs
        .iter()
        .map(|(src, dst)| io_operation_with_retries(operation, src, dst, policy));
    join_all(tasks).await.into_iter().collect()
}
