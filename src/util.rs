//! Shared async helpers.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;

/// Returns an interval ticking every `base`, with the first tick delayed by
/// a random jitter of up to 20% of `base` so that periodic work started on
/// many hosts at once does not synchronize.
///
/// Panics if `base` is zero.
pub fn jittered_interval(base: Duration) -> Interval {
    assert!(!base.is_zero(), "interval base must be positive");
    let jitter = initial_jitter(base, rand::thread_rng().gen_range(0.0..1.0));
    interval_at(Instant::now() + base + jitter, base)
}

fn initial_jitter(base: Duration, fraction: f64) -> Duration {
    base.mul_f64(0.2 * fraction)
}

/// Spawns a task that feeds every line from a subscription to `handler`
/// until the subscription closes or the token is cancelled.
pub fn spawn_subscription_handler<F, Fut>(
    mut subscription: mpsc::Receiver<String>,
    shutdown: CancellationToken,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut(String) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                line = subscription.recv() => match line {
                    Some(line) => handler(line).await,
                    None => return,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::timeout;

    #[test]
    #[should_panic(expected = "interval base must be positive")]
    fn test_jittered_interval_rejects_zero_base() {
        let _ = jittered_interval(Duration::ZERO);
    }

    #[test]
    fn test_initial_jitter_bounded_by_one_fifth_of_base() {
        let base = Duration::from_secs(300);
        assert_eq!(initial_jitter(base, 0.0), Duration::ZERO);
        assert_eq!(initial_jitter(base, 1.0), Duration::from_secs(60));
        assert!(initial_jitter(base, 0.5) < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_subscription_handler_processes_lines() {
        let (tx, rx) = mpsc::channel(10);
        let shutdown = CancellationToken::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let task = spawn_subscription_handler(rx, shutdown.clone(), {
            let seen = Arc::clone(&seen);
            move |_line| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tx.send("one".to_string()).await.unwrap();
        tx.send("two".to_string()).await.unwrap();
        drop(tx);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscription_handler_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel::<String>(10);
        let shutdown = CancellationToken::new();
        let task = spawn_subscription_handler(rx, shutdown.clone(), |_line| async {});
        shutdown.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
