//! Coalescing periodic-tick helper.
//!
//! Grounded on the original's APScheduler jobs, each configured with
//! `max_instances=1, coalesce=true`: a tick that is still running when the
//! next one comes due is skipped rather than queued, and any ticks missed
//! while the process was busy collapse into a single catch-up tick instead
//! of firing once per missed interval. `tokio::time::interval`'s
//! `MissedTickBehavior::Skip` gives the coalescing; the `AtomicBool` guard
//! gives `max_instances=1` for a tick spawned onto its own task so a slow
//! tick can't overlap the next one.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Spawn a background task that calls `tick` on every `period`, skipping a
/// scheduled tick if the previous one is still in flight.
pub fn spawn_periodic<F, Fut>(period: Duration, label: &'static str, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = sdcloud_core::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let running = Arc::new(AtomicBool::new(false));

        loop {
            interval.tick().await;

            if running.swap(true, Ordering::SeqCst) {
                debug!(label, "previous tick still in flight, skipping");
                continue;
            }

            let running = Arc::clone(&running);
            let fut = tick();
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    error!(label, error = %e, "periodic tick failed");
                }
                running.store(false, Ordering::SeqCst);
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn overlapping_slow_ticks_are_skipped_not_queued() {
        let calls = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let calls2 = Arc::clone(&calls);
        let in_flight2 = Arc::clone(&in_flight);
        let max_concurrent2 = Arc::clone(&max_concurrent);

        let handle = spawn_periodic(Duration::from_millis(10), "test", move || {
            let calls = Arc::clone(&calls2);
            let in_flight = Arc::clone(&in_flight2);
            let max_concurrent = Arc::clone(&max_concurrent2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let now_in_flight = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now_in_flight, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        handle.abort();

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
