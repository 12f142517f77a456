//! Journal-backed observer.
//!
//! Tails journal entries scoped to a single syslog identifier by streaming
//! the output of a `journalctl` follow subprocess. The stream starts at the
//! current wall-clock time, so history is never replayed. If the subprocess
//! exits it is restarted with exponential backoff.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ObserverError;
use crate::observer::{Broadcaster, Observer};

const INITIAL_RESTART_DELAY: Duration = Duration::from_secs(1);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

pub struct JournalObserver {
    service_name: String,
    command: Vec<String>,
    broadcaster: Broadcaster,
}

impl JournalObserver {
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let command = vec![
            "journalctl".to_string(),
            "--follow".to_string(),
            "--since".to_string(),
            "now".to_string(),
            "--output".to_string(),
            "cat".to_string(),
            "--identifier".to_string(),
            service_name.clone(),
        ];
        JournalObserver {
            service_name,
            command,
            broadcaster: Broadcaster::new(),
        }
    }

    /// Constructs an observer that streams an arbitrary command instead of
    /// `journalctl`. Used by tests to substitute a deterministic source.
    #[cfg(test)]
    pub(crate) fn with_command(service_name: impl Into<String>, command: Vec<String>) -> Self {
        JournalObserver {
            service_name: service_name.into(),
            command,
            broadcaster: Broadcaster::new(),
        }
    }

    fn spawn_journal_stream(&self) -> Result<tokio::process::Child, ObserverError> {
        Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ObserverError::SubprocessSpawn(format!("{}: {}", self.command[0], e)))
    }

    /// Broadcasts lines from the subprocess stdout until the stream ends or
    /// the token is cancelled. Returns true when cancelled.
    async fn stream_lines(
        &self,
        child: &mut tokio::process::Child,
        shutdown: &CancellationToken,
    ) -> Result<bool, ObserverError> {
        let stdout = child.stdout.take().ok_or_else(|| {
            ObserverError::SubprocessSpawn("subprocess stdout unavailable".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();
        let identifier = self.identifier();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(true),
                line = lines.next_line() => match line? {
                    Some(line) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            self.broadcaster.broadcast(&identifier, trimmed);
                        }
                    }
                    None => return Ok(false),
                },
            }
        }
    }
}

#[async_trait]
impl Observer for JournalObserver {
    fn subscribe(&self) -> mpsc::Receiver<String> {
        self.broadcaster.subscribe()
    }

    fn identifier(&self) -> String {
        format!("journal:{}", self.service_name)
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ObserverError> {
        let identifier = self.identifier();
        let mut restart_delay = INITIAL_RESTART_DELAY;

        while !shutdown.is_cancelled() {
            match self.spawn_journal_stream() {
                Ok(mut child) => {
                    info!("{}: journal stream started", identifier);
                    restart_delay = INITIAL_RESTART_DELAY;
                    match self.stream_lines(&mut child, &shutdown).await {
                        Ok(true) => {
                            let _ = child.kill().await;
                            return Ok(());
                        }
                        Ok(false) => {
                            warn!("{}: journal stream ended, restarting", identifier);
                        }
                        Err(err) => {
                            warn!("{}: error reading journal stream: {}", identifier, err);
                        }
                    }
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                Err(err) => {
                    warn!("{}: failed to start journal stream: {}", identifier, err);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(restart_delay) => {}
            }
            restart_delay = std::cmp::min(restart_delay * 2, MAX_RESTART_DELAY);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_identifier() {
        let observer = JournalObserver::new("kubelet");
        assert_eq!(observer.identifier(), "journal:kubelet");
    }

    #[tokio::test]
    async fn test_streams_subprocess_lines() {
        let observer = Arc::new(JournalObserver::with_command(
            "test",
            vec![
                "printf".to_string(),
                "first entry\nsecond entry\n".to_string(),
            ],
        ));
        let mut subscription = observer.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let observer = Arc::clone(&observer);
            let shutdown = shutdown.clone();
            async move { observer.run(shutdown).await }
        });

        let first = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap();
        assert_eq!(first.unwrap(), "first entry");
        let second = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap();
        assert_eq!(second.unwrap(), "second entry");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_lines_not_broadcast() {
        let observer = Arc::new(JournalObserver::with_command(
            "test",
            vec!["printf".to_string(), "\n\nreal entry\n".to_string()],
        ));
        let mut subscription = observer.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let observer = Arc::clone(&observer);
            let shutdown = shutdown.clone();
            async move { observer.run(shutdown).await }
        });

        let line = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap();
        assert_eq!(line.unwrap(), "real entry");

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_crash_run_loop() {
        let observer = Arc::new(JournalObserver::with_command(
            "test",
            vec!["/nonexistent/binary".to_string()],
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let observer = Arc::clone(&observer);
            let shutdown = shutdown.clone();
            async move { observer.run(shutdown).await }
        });

        // Give the loop a chance to fail and enter backoff, then cancel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
