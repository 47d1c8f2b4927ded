use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;

pub const ENTRY_PREFIX: &str = "http_127.0.0.1_";
pub const LOCAL_STORAGE_DIR: &str = "Local Storage";
pub const INDEXED_DB_DIR: &str = "IndexedDB";

static PORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\.\d+)_(\d+)").expect("valid port pattern"));

pub type PathGenerator = fn(u16) -> String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    LocalStorage,
    IndexedDb,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalStorage => "local_storage",
            Self::IndexedDb => "indexed_db",
        }
    }
}

fn local_storage_file(port: u16) -> String {
    format!("{ENTRY_PREFIX}{port}.localstorage")
}

fn local_storage_journal(port: u16) -> String {
    format!("{ENTRY_PREFIX}{port}.localstorage-journal")
}

fn indexed_db_dir(port: u16) -> String {
    format!("{ENTRY_PREFIX}{port}.indexeddb.leveldb")
}

/// On-disk layout of one browser storage backend.
#[derive(Debug, Clone)]
pub struct StorageBackend {
    pub kind: BackendKind,
    pub root: PathBuf,
    pub entry_prefix: &'static str,
    /// Positionally aligned: generator `i` for the source pairs with generator
    /// `i` for the target.
    pub path_generators: Vec<PathGenerator>,
}

impl StorageBackend {
    pub fn local_storage(user_data_dir: &Path) -> Self {
        Self {
            kind: BackendKind::LocalStorage,
            root: user_data_dir.join(LOCAL_STORAGE_DIR),
            entry_prefix: ENTRY_PREFIX,
            path_generators: vec![local_storage_file as PathGenerator, local_storage_journal],
        }
    }

    pub fn indexed_db(user_data_dir: &Path) -> Self {
        Self {
            kind: BackendKind::IndexedDb,
            root: user_data_dir.join(INDEXED_DB_DIR),
            entry_prefix: ENTRY_PREFIX,
            path_generators: vec![indexed_db_dir as PathGenerator],
        }
    }

    pub fn builtin(user_data_dir: &Path) -> Vec<Self> {
        vec![
            Self::local_storage(user_data_dir),
            Self::indexed_db(user_data_dir),
        ]
    }

    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(self.entry_prefix)
    }

    pub fn paths_for_port(&self, port: u16) -> Vec<PathBuf> {
        self.path_generators
            .iter()
            .map(|g| self.root.join(g(port)))
            .collect()
    }
}

/// Reads the port embedded in a storage entry name, e.g.
/// `http_127.0.0.1_57200.localstorage` -> `57200`.
pub fn extract_port(name: &str) -> Option<u16> {
    let caps = PORT_PATTERN.captures(name)?;
    let port = caps.get(1)?.as_str().parse::<u16>().ok()?;
    (port > 0).then_some(port)
}
