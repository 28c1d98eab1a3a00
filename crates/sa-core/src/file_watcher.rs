use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Returns `true` for files the log watcher cares about.
pub fn is_log_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "log")
}

// ---------------------------------------------------------------------------
// LogWatcher
// ---------------------------------------------------------------------------

/// Watches one directory (non-recursively) for writes to `*.log` files.
pub struct LogWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
}

impl LogWatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, notify::Error> {
        let dir = dir.into();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            dir,
            _watcher: watcher,
            rx,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Wait up to `timeout` for changes, then drain whatever else is queued.
    /// Returns the distinct log files that were created or modified.
    pub fn recv_changed(&self, timeout: Duration) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        let first = match self.rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return changed,
        };
        for res in std::iter::once(first).chain(self.rx.try_iter()) {
            let Ok(event) = res else { continue };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            for path in event.paths {
                if is_log_file(&path) && !changed.contains(&path) {
                    changed.push(path);
                }
            }
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// LogTailer
// ---------------------------------------------------------------------------

/// Remembers how far each log has been read and returns only new lines.
#[derive(Debug, Default)]
pub struct LogTailer {
    offsets: HashMap<PathBuf, u64>,
}

impl LogTailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip existing content of every log in `dir` so only lines written
    /// from now on are reported.
    pub fn prime(&mut self, dir: &Path) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if is_log_file(&path) {
                let len = std::fs::metadata(&path)?.len();
                self.offsets.insert(path, len);
            }
        }
        Ok(())
    }

    pub fn offset(&self, path: &Path) -> u64 {
        self.offsets.get(path).copied().unwrap_or(0)
    }

    /// Read complete lines appended since the last call. A file that shrank
    /// was truncated or rotated and is read again from the start. A trailing
    /// partial line is left for the next call.
    pub fn read_new(&mut self, path: &Path) -> std::io::Result<Vec<String>> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut offset = self.offset(path);
        if len < offset {
            offset = 0;
        }
        if len == offset {
            self.offsets.insert(path.to_path_buf(), offset);
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        file.take(len - offset).read_to_end(&mut buf)?;

        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        self.offsets
            .insert(path.to_path_buf(), offset + complete as u64);

        Ok(String::from_utf8_lossy(&buf[..complete])
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn forget(&mut self, path: &Path) {
        self.offsets.remove(path);
    }
}
