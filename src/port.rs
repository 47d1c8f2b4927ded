use std::{
    fs,
    io::{self, Write},
    net::{Ipv4Addr, SocketAddrV4, TcpListener},
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{debug, info};

pub const PORT_FILE_NAME: &str = "port.cfg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
    /// Width of each window searched before moving on.
    pub step: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 57200,
            end: 57400,
            step: 20,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    InvalidRange { start: u16, end: u16 },
    NoFreePort { start: u16, end: u16 },
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRange { start, end } => write!(f, "invalid port range: {start}..={end}"),
            Self::NoFreePort { start, end } => {
                write!(f, "could not find free port in {start}..={end}")
            }
        }
    }
}

impl std::error::Error for PortError {}

/// Remembers the last port the local server listened on.
#[derive(Debug, Clone)]
pub struct PortFile {
    path: PathBuf,
}

impl PortFile {
    pub fn new(user_data_dir: &Path) -> Self {
        Self {
            path: user_data_dir.join(PORT_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self, range: PortRange) -> Option<u16> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "no last used port");
                return None;
            }
        };
        match raw.trim().parse::<u16>() {
            Ok(port) if range.contains(port) => {
                info!(port, "last used port");
                Some(port)
            }
            _ => {
                debug!(content = raw.trim(), "ignoring invalid last used port");
                None
            }
        }
    }

    pub fn save(&self, port: u16) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        write_atomic(&self.path, port.to_string().as_bytes())
            .with_context(|| format!("write {}", self.path.display()))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp_path, path)
}

fn is_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Picks a loopback port, preferring `last_used` so storage keeps its origin.
///
/// Otherwise scans `range` in windows of `range.step` ports and takes the
/// first free one.
pub fn find_free_port(range: PortRange, last_used: Option<u16>) -> Result<u16, PortError> {
    if range.start == 0 || range.start > range.end || range.step == 0 {
        return Err(PortError::InvalidRange {
            start: range.start,
            end: range.end,
        });
    }

    if let Some(port) = last_used.filter(|p| range.contains(*p))
        && is_free(port)
    {
        info!(port, "assigned port");
        return Ok(port);
    }

    let mut window_start = range.start;
    loop {
        let window_end = window_start.saturating_add(range.step).min(range.end);
        if let Some(port) = (window_start..=window_end).find(|p| is_free(*p)) {
            info!(port, "assigned port");
            return Ok(port);
        }
        if window_end >= range.end {
            break;
        }
        window_start = window_end.saturating_add(1);
    }

    Err(PortError::NoFreePort {
        start: range.start,
        end: range.end,
    })
}
