//! Fixed-interval execution of driver passes.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::Result;

/// Runs `pass` now and then every `period` until shutdown.
///
/// A slow pass delays the next tick instead of bunching ticks up. A failed
/// pass is logged and retried on the next tick. Shutdown never interrupts a
/// running pass.
pub async fn every<F, Fut, R>(
    task: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R>>,
    R: Debug,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match pass().await {
                    Ok(report) => info!(task, ?report, "pass finished"),
                    Err(err) => error!(task, error = %err, "pass failed"),
                }
            }
        }
    }
    debug!(task, "periodic task stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::DriverError;

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_on_every_tick() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let counter = runs.clone();
        let task = tokio::spawn(every("count", Duration::from_secs(10), shutdown_rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DriverError>(())
            }
        }));

        time::sleep(Duration::from_secs(25)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_pass_keeps_the_task_alive() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let counter = runs.clone();
        let task = tokio::spawn(every("fail", Duration::from_secs(1), shutdown_rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DriverError::Store(anyhow::anyhow!("database is down")))
            }
        }));

        time::sleep(Duration::from_millis(2_500)).await;
        drop(shutdown_tx);
        task.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
