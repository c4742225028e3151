use crate::storage::read_json;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info, warn};

/// Resolves the file a [`SessionTailer`] should follow.
#[async_trait]
pub trait TailSource: Send + Sync {
    /// Current path of the log, or `None` while it does not exist yet.
    async fn resolve(&self) -> Option<PathBuf>;
    fn describe(&self) -> String;
}

/// A log at a fixed location.
pub struct FixedPath {
    path: PathBuf,
}

impl FixedPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TailSource for FixedPath {
    async fn resolve(&self) -> Option<PathBuf> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => Some(self.path.clone()),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// The JSON-lines session file registered under `key` in `<dir>/sessions.json`.
pub struct SessionIndex {
    dir: PathBuf,
    key: String,
}

impl SessionIndex {
    pub fn new(dir: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl TailSource for SessionIndex {
    async fn resolve(&self) -> Option<PathBuf> {
        let index: JsonValue = read_json(&self.dir.join("sessions.json")).await?;
        let entry = index
            .get(&self.key)
            .or_else(|| index.get(format!("agent:main:{}", self.key)))?;
        let session_id = entry.get("sessionId")?.as_str()?;

        let path = self.dir.join(format!("{}.jsonl", session_id));
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        format!("session '{}' in {}", self.key, self.dir.display())
    }
}

/// Device and inode of an open file, used to notice a log replaced in place.
type FileIdentity = Option<(u64, u64)>;

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> FileIdentity {
    None
}

enum TailState {
    Waiting,
    Following {
        path: PathBuf,
        reader: BufReader<File>,
        offset: u64,
        identity: FileIdentity,
    },
}

enum Step {
    Line(String),
    Idle,
    Lost,
}

/// Follows an append-only text log from its end, surviving the file being
/// absent, removed or replaced.
///
/// The first file is read from its end. A file that shows up after the
/// followed one was lost is new content and is read from its start.
///
/// `next_line` is not cancel-safe mid-read: drop it only on shutdown.
pub struct SessionTailer {
    source: Box<dyn TailSource>,
    poll_interval: Duration,
    max_wait: Duration,
    state: TailState,
    pending: Vec<u8>,
    from_start: bool,
}

impl SessionTailer {
    pub fn new(source: Box<dyn TailSource>, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            source,
            poll_interval,
            max_wait: max_wait.max(poll_interval),
            state: TailState::Waiting,
            pending: Vec::new(),
            from_start: false,
        }
    }

    pub fn current_path(&self) -> Option<&Path> {
        match &self.state {
            TailState::Following { path, .. } => Some(path),
            TailState::Waiting => None,
        }
    }

    /// Next complete line, without its line terminator.
    pub async fn next_line(&mut self) -> String {
        loop {
            if matches!(self.state, TailState::Waiting) {
                self.wait_for_source().await;
            }

            match self.step().await {
                Step::Line(line) => return line,
                Step::Idle => tokio::time::sleep(self.poll_interval).await,
                Step::Lost => {
                    self.state = TailState::Waiting;
                    self.pending.clear();
                    self.from_start = true;
                }
            }
        }
    }

    async fn wait_for_source(&mut self) {
        let mut backoff = self.poll_interval;
        let mut announced = false;

        loop {
            if let Some(path) = self.source.resolve().await {
                match Self::open(&path, !self.from_start).await {
                    Ok((reader, offset, identity)) => {
                        info!("Following {} from offset {}", path.display(), offset);
                        self.state = TailState::Following {
                            path,
                            reader,
                            offset,
                            identity,
                        };
                        return;
                    }
                    Err(e) => debug!("Failed to open {}: {}", path.display(), e),
                }
            }

            if !announced {
                info!("Waiting for {}", self.source.describe());
                announced = true;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_wait);
        }
    }

    async fn open(
        path: &Path,
        at_end: bool,
    ) -> std::io::Result<(BufReader<File>, u64, FileIdentity)> {
        let mut file = File::open(path).await?;
        let identity = file_identity(&file.metadata().await?);
        let offset = if at_end {
            file.seek(SeekFrom::End(0)).await?
        } else {
            0
        };
        Ok((BufReader::new(file), offset, identity))
    }

    async fn step(&mut self) -> Step {
        let TailState::Following {
            path,
            reader,
            offset,
            identity,
        } = &mut self.state
        else {
            return Step::Lost;
        };

        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {}
            Ok(n) => {
                *offset += n as u64;
                self.pending.extend_from_slice(&buf);
                if self.pending.last() == Some(&b'\n') {
                    let raw = std::mem::take(&mut self.pending);
                    let line = String::from_utf8_lossy(&raw);
                    return Step::Line(line.trim_end_matches(['\n', '\r']).to_string());
                }
                return Step::Idle;
            }
            Err(e) => {
                warn!("Error reading {}: {}", path.display(), e);
                return Step::Lost;
            }
        }

        // Nothing new: make sure we are still reading the right file.
        if self.source.resolve().await.as_deref() != Some(path.as_path()) {
            info!("{} disappeared, waiting for it to return", path.display());
            return Step::Lost;
        }

        let meta = match tokio::fs::metadata(&*path).await {
            Ok(meta) => meta,
            Err(_) => return Step::Lost,
        };
        if file_identity(&meta) != *identity {
            info!("{} was replaced, following the new file", path.display());
            return Step::Lost;
        }

        if meta.len() < *offset {
            info!("{} was truncated, reading from the start", path.display());
            match Self::open(path.as_path(), false).await {
                Ok((fresh, _, fresh_identity)) => {
                    *reader = fresh;
                    *offset = 0;
                    *identity = fresh_identity;
                    self.pending.clear();
                }
                Err(e) => {
                    warn!("Failed to reopen {}: {}", path.display(), e);
                    return Step::Lost;
                }
            }
        }

        Step::Idle
    }
}
