use std::{io, path::PathBuf};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    io_helper::{
        IoOperation, IoRetriesExhausted, RemovePathsError, RetryPolicy,
        batch_io_operation_with_retries, find_newest_entry, remove_paths,
    },
    storage::{BackendKind, StorageBackend, extract_port},
};

#[derive(Debug)]
pub enum MigrationError {
    DirectoryScan { root: PathBuf, source: io::Error },
    /// The newest generation lacks its primary entry, so there is nothing safe
    /// to relocate.
    SourceMissing { path: PathBuf },
    TargetClear(RemovePathsError),
    Move(IoRetriesExhausted),
}

impl MigrationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DirectoryScan { .. } => "directory_scan",
            Self::SourceMissing { .. } => "source_missing",
            Self::TargetClear(_) => "target_clear",
            Self::Move(_) => "move",
        }
    }
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectoryScan { root, source } => {
                write!(f, "could not scan {}: {source}", root.display())
            }
            Self::SourceMissing { path } => {
                write!(f, "newest generation has no {}", path.display())
            }
            Self::TargetClear(e) => write!(f, "could not clear stale target: {e}"),
            Self::Move(e) => write!(f, "could not relocate storage: {e}"),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DirectoryScan { source, .. } => Some(source),
            Self::SourceMissing { .. } => None,
            Self::TargetClear(e) => Some(e),
            Self::Move(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    NoPriorData,
    /// The newest entry does not carry a recognizable port.
    UnrecognizedEntry {
        name: String,
    },
    AlreadyCurrent {
        port: u16,
    },
    Migrated {
        from: u16,
        to: u16,
        operation: IoOperation,
        pruned: usize,
    },
}

#[derive(Debug)]
pub struct BackendReport {
    pub kind: BackendKind,
    pub result: Result<MigrationOutcome, MigrationError>,
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub target_port: u16,
    pub last_port: Option<u16>,
    pub backends: Vec<BackendReport>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.backends.iter().all(|b| b.result.is_ok())
    }

    pub fn backend(&self, kind: BackendKind) -> Option<&BackendReport> {
        self.backends.iter().find(|b| b.kind == kind)
    }

    pub fn to_view(&self) -> MigrationReportView {
        MigrationReportView {
            target_port: self.target_port,
            last_port: self.last_port,
            success: self.is_success(),
            finished_at: Utc::now(),
            backends: self
                .backends
                .iter()
                .map(|b| match &b.result {
                    Ok(outcome) => BackendReportView {
                        backend: b.kind.as_str(),
                        status: match outcome {
                            MigrationOutcome::NoPriorData => "no_prior_data",
                            MigrationOutcome::UnrecognizedEntry { .. } => "unrecognized_entry",
                            MigrationOutcome::AlreadyCurrent { .. } => "already_current",
                            MigrationOutcome::Migrated { .. } => "migrated",
                        },
                        from_port: match outcome {
                            MigrationOutcome::Migrated { from, .. } => Some(*from),
                            MigrationOutcome::AlreadyCurrent { port } => Some(*port),
                            _ => None,
                        },
                        error: None,
                    },
                    Err(err) => BackendReportView {
                        backend: b.kind.as_str(),
                        status: err.code(),
                        from_port: None,
                        error: Some(err.to_string()),
                    },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MigrationReportView {
    pub target_port: u16,
    pub last_port: Option<u16>,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
    pub backends: Vec<BackendReportView>,
}

#[derive(Debug, Serialize)]
pub struct BackendReportView {
    pub backend: &'static str,
    pub status: &'static str,
    pub from_port: Option<u16>,
    pub error: Option<String>,
}

/// Relocates browser storage generations so they match the port the app is
/// about to be served on.
#[derive(Debug)]
pub struct StorageMigrationEngine {
    backends: Vec<StorageBackend>,
    retry: RetryPolicy,
    // Serializes overlapping triggers; backends within one run stay concurrent.
    running: Mutex<()>,
}

impl StorageMigrationEngine {
    pub fn new(backends: Vec<StorageBackend>, retry: RetryPolicy) -> Self {
        Self {
            backends,
            retry,
            running: Mutex::new(()),
        }
    }

    pub fn backends(&self) -> &[StorageBackend] {
        &self.backends
    }

    /// Migrates every backend to `target_port`. Never fails as a whole; inspect
    /// the per-backend results in the returned report.
    ///
    /// When `last_port` is known the app is being restarted in place and the
    /// previous page may still hold the files, so data is copied rather than
    /// moved and the `last_port` generation survives pruning.
    pub async fn migrate(&self, target_port: u16, last_port: Option<u16>) -> MigrationReport {
        let _guard = self.running.lock().await;

        let tasks = self
            .backends
            .iter()
            .map(|backend| self.migrate_single_backend(backend, target_port, last_port));
        let results = join_all(tasks).await;

        let backends = self
            .backends
            .iter()
            .zip(results)
            .map(|(backend, result)| {
                if let Err(err) = &result {
                    error!(
                        backend = backend.kind.as_str(),
                        port = target_port,
                        error = %err,
                        "storage migration failed, the storage may be outdated"
                    );
                }
                BackendReport {
                    kind: backend.kind,
                    result,
                }
            })
            .collect();

        MigrationReport {
            target_port,
            last_port,
            backends,
        }
    }

    pub async fn migrate_single_backend(
        &self,
        backend: &StorageBackend,
        target_port: u16,
        last_port: Option<u16>,
    ) -> Result<MigrationOutcome, MigrationError> {
        let name = backend.kind.as_str();
        let scan = find_newest_entry(&backend.root, |entry| backend.matches(entry))
            .await
            .map_err(|source| MigrationError::DirectoryScan {
                root: backend.root.clone(),
                source,
            })?;

        let Some(newest) = scan.newest else {
            debug!(backend = name, "no prior storage found");
            return Ok(MigrationOutcome::NoPriorData);
        };

        let Some(newest_port) = extract_port(&newest.name) else {
            warn!(
                backend = name,
                entry = %newest.name,
                "newest storage entry has no recognizable port; leaving it untouched"
            );
            return Ok(MigrationOutcome::UnrecognizedEntry { name: newest.name });
        };

        if newest_port == target_port {
            debug!(backend = name, port = target_port, "port did not change, no migration needed");
            return Ok(MigrationOutcome::AlreadyCurrent { port: target_port });
        }

        // Only secondary entries (journals) may be absent. Without the primary
        // entry the newest generation is not relocatable and older ones must
        // not be pruned.
        let source_paths = backend.paths_for_port(newest_port);
        let mut present = Vec::with_capacity(source_paths.len());
        for (idx, src) in source_paths.iter().enumerate() {
            let exists = tokio::fs::symlink_metadata(src).await.is_ok();
            if idx == 0 && !exists {
                return Err(MigrationError::SourceMissing { path: src.clone() });
            }
            if !exists {
                debug!(backend = name, path = %src.display(), "source entry absent; skipping");
            }
            present.push(exists);
        }

        let target_paths = backend.paths_for_port(target_port);
        remove_paths(&target_paths)
            .await
            .map_err(MigrationError::TargetClear)?;

        let pairs = source_paths
            .into_iter()
            .zip(target_paths)
            .zip(present)
            .filter_map(|(pair, exists)| exists.then_some(pair))
            .collect::<Vec<_>>();

        let operation = if last_port.is_some() {
            IoOperation::Copy
        } else {
            IoOperation::Move
        };
        batch_io_operation_with_retries(operation, &pairs, self.retry)
            .await
            .map_err(MigrationError::Move)?;
        info!(
            backend = name,
            from = newest_port,
            to = target_port,
            operation = operation.as_str(),
            "storage migrated"
        );

        let keep = [Some(target_port), Some(newest_port), last_port]
            .into_iter()
            .flatten()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();
        let obsolete = scan
            .entries
            .iter()
            .filter(|e| backend.matches(&e.name))
            .filter(|e| !keep.iter().any(|p| e.name.contains(p.as_str())))
            .map(|e| backend.root.join(&e.name))
            .collect::<Vec<_>>();
        let pruned = obsolete.len();
        if let Err(err) = remove_paths(&obsolete).await {
            warn!(
                backend = name,
                error = %err,
                "could not delete redundant storage entries; this has no side effects"
            );
        }

        Ok(MigrationOutcome::Migrated {
            from: newest_port,
            to: target_port,
            operation,
            pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::Path,
        time::{Duration, SystemTime},
    };

    use pretty_assertions::assert_eq;

    use super::*;

    fn write_aged(path: &Path, content: &[u8], secs_ago: u64) {
        fs::write(path, content).unwrap();
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    fn engine(dir: &Path) -> StorageMigrationEngine {
        StorageMigrationEngine::new(
            StorageBackend::builtin(dir),
            RetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(1),
            },
        )
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut out: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn missing_roots_are_noops() {
        let tmp = tempfile::tempdir().unwrap();
        let report = engine(tmp.path()).migrate(57300, None).await;

        assert!(report.is_success());
        for b in &report.backends {
            assert_eq!(b.result.as_ref().unwrap(), &MigrationOutcome::NoPriorData);
        }
        assert!(!tmp.path().join("Local Storage").exists());
        assert!(!tmp.path().join("IndexedDB").exists());
    }

    #[tokio::test]
    async fn unrecognized_newest_entry_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("Local Storage");
        fs::create_dir_all(&root).unwrap();
        write_aged(&root.join("http_127.0.0.1_.localstorage"), b"?", 0);

        let engine = engine(tmp.path());
        let outcome = engine
            .migrate_single_backend(&engine.backends()[0], 57300, None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::UnrecognizedEntry {
                name: "http_127.0.0.1_.localstorage".to_string()
            }
        );
        assert_eq!(names(&root), vec!["http_127.0.0.1_.localstorage"]);
    }

    #[tokio::test]
    async fn moves_newest_generation_and_prunes_others() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("Local Storage");
        fs::create_dir_all(&root).unwrap();
        write_aged(&root.join("http_127.0.0.1_57100.localstorage"), b"old", 600);
        write_aged(&root.join("http_127.0.0.1_57200.localstorage"), b"data", 5);
        write_aged(
            &root.join("http_127.0.0.1_57200.localstorage-journal"),
            b"journal",
            5,
        );

        let engine = engine(tmp.path());
        let outcome = engine
            .migrate_single_backend(&engine.backends()[0], 57300, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                from: 57200,
                to: 57300,
                operation: IoOperation::Move,
                pruned: 1,
            }
        );
        assert_eq!(
            names(&root),
            vec![
                "http_127.0.0.1_57300.localstorage",
                "http_127.0.0.1_57300.localstorage-journal",
            ]
        );
        assert_eq!(
            fs::read(root.join("http_127.0.0.1_57300.localstorage")).unwrap(),
            b"data"
        );
    }

    #[tokio::test]
    async fn missing_journal_is_not_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("Local Storage");
        fs::create_dir_all(&root).unwrap();
        write_aged(&root.join("http_127.0.0.1_57200.localstorage"), b"data", 5);

        let engine = engine(tmp.path());
        let outcome = engine
            .migrate_single_backend(&engine.backends()[0], 57220, None)
            .await
            .unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { from: 57200, .. }));
        assert_eq!(names(&root), vec!["http_127.0.0.1_57220.localstorage"]);
    }

    #[tokio::test]
    async fn missing_primary_source_aborts_before_clearing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("Local Storage");
        fs::create_dir_all(&root).unwrap();
        write_aged(&root.join("http_127.0.0.1_57300.localstorage"), b"kept", 600);
        write_aged(
            &root.join("http_127.0.0.1_57200.localstorage-journal"),
            b"journal",
            5,
        );

        let engine = engine(tmp.path());
        let err = engine
            .migrate_single_backend(&engine.backends()[0], 57300, None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "source_missing");
        assert_eq!(
            fs::read(root.join("http_127.0.0.1_57300.localstorage")).unwrap(),
            b"kept"
        );
        assert_eq!(
            names(&root),
            vec![
                "http_127.0.0.1_57200.localstorage-journal",
                "http_127.0.0.1_57300.localstorage",
            ]
        );
    }

    #[tokio::test]
    async fn last_port_switches_to_copy_and_survives_pruning() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("IndexedDB");
        let newest = root.join("http_127.0.0.1_57240.indexeddb.leveldb");
        fs::create_dir_all(&newest).unwrap();
        fs::write(newest.join("CURRENT"), b"MANIFEST-000004").unwrap();
        let stale = root.join("http_127.0.0.1_57100.indexeddb.leveldb");
        fs::create_dir_all(&stale).unwrap();
        fs::File::open(&stale)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let engine = engine(tmp.path());
        let outcome = engine
            .migrate_single_backend(&engine.backends()[1], 57260, Some(57240))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                from: 57240,
                to: 57260,
                operation: IoOperation::Copy,
                pruned: 1,
            }
        );
        assert_eq!(
            names(&root),
            vec![
                "http_127.0.0.1_57240.indexeddb.leveldb",
                "http_127.0.0.1_57260.indexeddb.leveldb",
            ]
        );
        assert_eq!(
            fs::read(root.join("http_127.0.0.1_57260.indexeddb.leveldb/CURRENT")).unwrap(),
            b"MANIFEST-000004"
        );
    }

    #[test]
    fn report_view_names_failures() {
        let report = MigrationReport {
            target_port: 57300,
            last_port: None,
            backends: vec![
                BackendReport {
                    kind: BackendKind::LocalStorage,
                    result: Err(MigrationError::TargetClear(RemovePathsError {
                        failures: vec![(
                            PathBuf::from("/x"),
                            io::Error::from(io::ErrorKind::PermissionDenied),
                        )],
                    })),
                },
                BackendReport {
                    kind: BackendKind::IndexedDb,
                    result: Ok(MigrationOutcome::NoPriorData),
                },
            ],
        };

        assert!(!report.is_success());
        let view = report.to_view();
        assert_eq!(view.backends[0].status, "target_clear");
        assert!(view.backends[0].error.as_deref().unwrap().contains("/x"));
        assert_eq!(view.backends[1].status, "no_prior_data");
    }
}
