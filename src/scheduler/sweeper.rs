//! Periodic maintenance task.
//!
//! Closes idle connections, frees closing ones that have drained, and
//! retries pending queues that stalled after a rejected submission.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dispatch::Dispatcher;

/// Spawn the sweeper on the current tokio runtime. Returns a handle for
/// shutdown; cancel `shutdown` to stop it.
pub fn spawn_sweeper(
    dispatcher: Dispatcher,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sweeper_loop(dispatcher, interval, shutdown).await;
    })
}

async fn sweeper_loop(dispatcher: Dispatcher, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!("sweeper: shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let d = dispatcher.clone();
                // Table and connection locks are blocking.
                match tokio::task::spawn_blocking(move || d.sweep(Instant::now())).await {
                    Ok(report) if report.closed > 0 => {
                        tracing::info!(closed = report.closed, rescheduled = report.rescheduled, "sweep closed connections");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "sweep task failed"),
                }
            }
        }
    }
}
