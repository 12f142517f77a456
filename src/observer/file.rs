//! File-backed observer.
//!
//! Tails a single file, broadcasting every complete line appended after the
//! observer starts. The watch is registered on the containing directory
//! rather than the file itself, because the file may be recreated (log
//! rotation); a create event for the watched path triggers a reopen. Lines
//! written between an unlink and the reopen may be lost.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ObserverError;
use crate::observer::{Broadcaster, Observer};

/// How long to sleep between read attempts when the file has no new data,
/// and between open attempts while the file does not exist yet.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub struct FileObserver {
    path: PathBuf,
    broadcaster: Broadcaster,
}

impl FileObserver {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileObserver {
            path: path.as_ref().to_path_buf(),
            broadcaster: Broadcaster::new(),
        }
    }

    /// Opens the file and seeks to its end so that pre-existing content is
    /// ignored.
    async fn open_reader(&self) -> Result<BufReader<File>, ObserverError> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::End(0)).await?;
        Ok(BufReader::new(file))
    }

    /// Polls until the file can be opened, or the token is cancelled.
    async fn wait_for_reader(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<BufReader<File>> {
        loop {
            match self.open_reader().await {
                Ok(reader) => return Some(reader),
                Err(err) => {
                    if !matches!(
                        &err,
                        ObserverError::Io(io) if io.kind() == std::io::ErrorKind::NotFound
                    ) {
                        debug!("{}: failed initializing reader: {}", self.identifier(), err);
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl Observer for FileObserver {
    fn subscribe(&self) -> mpsc::Receiver<String> {
        self.broadcaster.subscribe()
    }

    fn identifier(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ObserverError> {
        let identifier = self.identifier();

        let Some(mut reader) = self.wait_for_reader(&shutdown).await else {
            return Ok(());
        };
        info!("{}: initialized reader", identifier);

        // Watch the containing directory so that a recreated file is
        // observed even though the original inode is gone.
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<Event, notify::Error>| {
                let _ = fs_tx.send(result);
            },
        )?;
        let watch_dir = self.path.parent().unwrap_or_else(|| Path::new("/"));
        watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

        let mut pending = String::new();
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            match reader.read_line(&mut pending).await {
                Ok(_) if pending.ends_with('\n') => {
                    self.broadcaster.broadcast(&identifier, pending.trim());
                    pending.clear();
                }
                Ok(_) => {
                    // End of stream, possibly with a partial line buffered.
                    // Wait for a filesystem event or retry shortly.
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        event = fs_rx.recv() => match event {
                            Some(Ok(event)) => {
                                if matches!(event.kind, EventKind::Create(_))
                                    && event.paths.iter().any(|p| p == &self.path)
                                {
                                    match self.open_reader().await {
                                        Ok(new_reader) => {
                                            debug!("{}: file recreated, reopening", identifier);
                                            reader = new_reader;
                                            pending.clear();
                                        }
                                        Err(err) => {
                                            warn!(
                                                "{}: failed to reopen after create event: {}",
                                                identifier, err
                                            );
                                        }
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                warn!("{}: filesystem watch error: {}", identifier, err);
                            }
                            None => return Ok(()),
                        },
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
                Err(err) => {
                    warn!("{}: failed to read file: {}", identifier, err);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    async fn append(path: &Path, content: &str) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(content.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_line_received_only_after_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observed.log");

        let observer = Arc::new(FileObserver::new(&path));
        let mut subscription = observer.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let observer = Arc::clone(&observer);
            let shutdown = shutdown.clone();
            async move { observer.run(shutdown).await }
        });

        // The file does not exist yet; create it empty and give the observer
        // time to open it.
        tokio::time::sleep(Duration::from_millis(300)).await;
        append(&path, "").await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(subscription.try_recv().is_err(), "no line before append");

        append(&path, "hello\n").await;
        let line = timeout(RECV_TIMEOUT, subscription.recv()).await.unwrap();
        assert_eq!(line.unwrap(), "hello");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_preexisting_content_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observed.log");
        append(&path, "old line\n").await;

        let observer = Arc::new(FileObserver::new(&path));
        let mut subscription = observer.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let observer = Arc::clone(&observer);
            let shutdown = shutdown.clone();
            async move { observer.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        append(&path, "new line\n").await;

        let line = timeout(RECV_TIMEOUT, subscription.recv()).await.unwrap();
        assert_eq!(line.unwrap(), "new line");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_survives_file_recreation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotated.log");
        append(&path, "").await;

        let observer = Arc::new(FileObserver::new(&path));
        let mut subscription = observer.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let observer = Arc::clone(&observer);
            let shutdown = shutdown.clone();
            async move { observer.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        append(&path, "before rotation\n").await;
        let line = timeout(RECV_TIMEOUT, subscription.recv()).await.unwrap();
        assert_eq!(line.unwrap(), "before rotation");

        tokio::fs::remove_file(&path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        append(&path, "").await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        append(&path, "after rotation\n").await;

        let line = timeout(RECV_TIMEOUT, subscription.recv()).await.unwrap();
        assert_eq!(line.unwrap(), "after rotation");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_identifier() {
        let observer = FileObserver::new("/var/log/test.log");
        assert_eq!(observer.identifier(), "file:/var/log/test.log");
    }
}
