//! Log watcher: tails configured files across rotation and publishes lines.
//!
//! A one-second tick drives the scan; filesystem notify events only wake the
//! loop early. A shrinking file means rotation, which resets the read offset
//! to the start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the published line queue; producers drop on overflow.
const EVENT_QUEUE_CAPACITY: usize = 1000;

/// Fallback scan period when no notify event arrives.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub source: String,
    pub line: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct LogWatcher {
    paths: Mutex<Vec<PathBuf>>,
    offsets: tokio::sync::Mutex<HashMap<PathBuf, u64>>,
    event_tx: mpsc::Sender<LogEvent>,
    fs_watcher: Mutex<Option<RecommendedWatcher>>,
    running: AtomicBool,
}

impl LogWatcher {
    /// Returns the watcher and the receiver carrying published lines.
    pub fn new(paths: Vec<PathBuf>) -> (Arc<Self>, mpsc::Receiver<LogEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        (
            Arc::new(Self {
                paths: Mutex::new(paths),
                offsets: tokio::sync::Mutex::new(HashMap::new()),
                event_tx,
                fs_watcher: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            event_rx,
        )
    }

    /// Install directory watches, seed offsets at the current end of each
    /// file, and spawn the scan loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (poke_tx, mut poke_rx) = mpsc::channel::<()>(16);

        // Notify events only wake the scan loop; the scan decides what to
        // read.
        let fs_watcher = {
            let poke = poke_tx.clone();
            notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        let _ = poke.try_send(());
                    }
                }
            })
            .ok()
        };

        let paths: Vec<PathBuf> = self.paths.lock().unwrap().clone();
        if let Some(mut watcher) = fs_watcher {
            for path in &paths {
                if let Some(dir) = path.parent() {
                    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                        debug!(dir = %dir.display(), error = %e, "directory watch failed");
                    }
                }
            }
            *self.fs_watcher.lock().unwrap() = Some(watcher);
        }

        // Start from the end of existing files; history is not replayed.
        {
            let mut offsets = self.offsets.lock().await;
            for path in &paths {
                if let Ok(meta) = std::fs::metadata(path) {
                    offsets.insert(path.clone(), meta.len());
                }
            }
        }

        info!(paths = paths.len(), "log watcher started");

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SCAN_INTERVAL);
            loop {
                if !watcher.running.load(Ordering::SeqCst) {
                    return;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = poke_rx.recv() => {}
                }
                watcher.scan_all().await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.fs_watcher.lock().unwrap().take();
        info!("log watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }

    /// Add a path at runtime, installing a directory watch when running.
    pub async fn add_path(&self, path: PathBuf) {
        {
            let mut paths = self.paths.lock().unwrap();
            if paths.contains(&path) {
                return;
            }
            paths.push(path.clone());
        }
        if self.running.load(Ordering::SeqCst) {
            if let Some(watcher) = self.fs_watcher.lock().unwrap().as_mut() {
                if let Some(dir) = path.parent() {
                    let _ = watcher.watch(dir, RecursiveMode::NonRecursive);
                }
            }
            if let Ok(meta) = std::fs::metadata(&path) {
                self.offsets.lock().await.insert(path, meta.len());
            }
        }
    }

    pub async fn remove_path(&self, path: &Path) {
        self.paths.lock().unwrap().retain(|p| p != path);
        self.offsets.lock().await.remove(path);
    }

    async fn scan_all(&self) {
        let paths: Vec<PathBuf> = self.paths.lock().unwrap().clone();
        for path in paths {
            self.scan_one(&path).await;
        }
    }

    /// Read any new bytes of one file and publish complete lines.
    async fn scan_one(&self, path: &Path) {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return;
        };
        let size = meta.len();

        let mut offsets = self.offsets.lock().await;
        let offset = offsets.entry(path.to_path_buf()).or_insert(size);

        if size < *offset {
            // The file shrank: it was rotated or truncated.
            debug!(path = %path.display(), "file shrank, resetting offset");
            *offset = 0;
        }
        if size == *offset {
            return;
        }

        let Ok(mut file) = tokio::fs::File::open(path).await else {
            return;
        };
        if file.seek(std::io::SeekFrom::Start(*offset)).await.is_err() {
            return;
        }
        let mut buf = Vec::with_capacity((size - *offset) as usize);
        if file.read_to_end(&mut buf).await.is_err() {
            return;
        }
        *offset = size;
        drop(offsets);

        let text = String::from_utf8_lossy(&buf);
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let event = LogEvent {
                source: path.to_string_lossy().to_string(),
                line: line.to_string(),
                timestamp: chrono::Utc::now(),
            };
            if self.event_tx.try_send(event).is_err() {
                warn!("log event queue full, line dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn recv_line(rx: &mut mpsc::Receiver<LogEvent>, secs: u64) -> Option<LogEvent> {
        tokio::time::timeout(Duration::from_secs(secs), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn appended_lines_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "historic line\n").unwrap();

        let (watcher, mut rx) = LogWatcher::new(vec![log.clone()]);
        watcher.start().await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "fresh line one").unwrap();
        writeln!(file, "fresh line two").unwrap();
        file.flush().unwrap();

        let first = recv_line(&mut rx, 5).await.expect("no line published");
        assert_eq!(first.line, "fresh line one");
        assert_eq!(first.source, log.to_string_lossy());
        let second = recv_line(&mut rx, 5).await.expect("no second line");
        assert_eq!(second.line, "fresh line two");

        watcher.stop();
    }

    #[tokio::test]
    async fn history_is_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "old one\nold two\n").unwrap();

        let (watcher, mut rx) = LogWatcher::new(vec![log.clone()]);
        watcher.start().await;

        // Nothing appended: nothing published.
        assert!(recv_line(&mut rx, 2).await.is_none());
        watcher.stop();
    }

    #[tokio::test]
    async fn rotation_resets_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "a somewhat long pre-existing line\n").unwrap();

        let (watcher, mut rx) = LogWatcher::new(vec![log.clone()]);
        watcher.start().await;

        // Simulate rotation: replace with a shorter file.
        std::fs::write(&log, "post-rotate\n").unwrap();

        let event = recv_line(&mut rx, 5).await.expect("no line after rotation");
        assert_eq!(event.line, "post-rotate");
        watcher.stop();
    }

    #[tokio::test]
    async fn runtime_added_path_is_tailed() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("late.log");

        let (watcher, mut rx) = LogWatcher::new(vec![]);
        watcher.start().await;

        std::fs::write(&log, "").unwrap();
        watcher.add_path(log.clone()).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "late arrival").unwrap();
        file.flush().unwrap();

        let event = recv_line(&mut rx, 5).await.expect("no line from added path");
        assert_eq!(event.line, "late arrival");

        watcher.remove_path(&log).await;
        assert!(watcher.paths().is_empty());
        watcher.stop();
    }

    #[tokio::test]
    async fn missing_files_are_skipped() {
        let (watcher, mut rx) = LogWatcher::new(vec![PathBuf::from("/nonexistent/file.log")]);
        watcher.start().await;
        assert!(recv_line(&mut rx, 2).await.is_none());
        assert!(watcher.is_running());
        watcher.stop();
        assert!(!watcher.is_running());
    }
}
