//! Bounded fan-out over a shared backlog.
//!
//! A fixed number of workers drain one shared cursor, so at most `limit`
//! handler calls are in flight at any time. Workers are polled on the calling
//! task; they only suspend inside the handler.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::future::join_all;
use parking_lot::Mutex;

/// Run `handler` once per item with at most `min(limit, items.len())` calls
/// in flight.
///
/// `limit == 0` is treated as 1. On the first failure no worker claims new
/// items; calls already claimed run to completion, then the first error is
/// returned.
pub async fn for_each_bounded<'a, T, F, Fut, E>(
    items: &'a [T],
    limit: usize,
    handler: F,
) -> Result<(), E>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let total = items.len();
    if total == 0 {
        return Ok(());
    }

    let workers = limit.max(1).min(total);
    let cursor = AtomicUsize::new(0);
    let stopped = AtomicBool::new(false);
    let first_error: Mutex<Option<E>> = Mutex::new(None);

    let handler = &handler;
    let cursor = &cursor;
    let stopped = &stopped;
    let first_error_slot = &first_error;

    tracing::trace!(total, workers, "starting bounded fan-out");

    join_all((0..workers).map(|_| async move {
        loop {
            if stopped.load(Ordering::Acquire) {
                break;
            }
            let index = cursor.fetch_add(1, Ordering::AcqRel);
            if index >= total {
                break;
            }
            if let Err(e) = handler(&items[index]).await {
                stopped.store(true, Ordering::Release);
                let mut slot = first_error_slot.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
        }
    }))
    .await;

    match first_error.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Tracker {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<usize>>,
    }

    impl Tracker {
        async fn run(&self, item: usize, work: Duration) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().push(item);
            tokio::time::sleep(work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        fn sorted_calls(&self) -> Vec<usize> {
            let mut calls = self.calls.lock().clone();
            calls.sort_unstable();
            calls
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ten_items_limit_three() {
        let items: Vec<usize> = (0..10).collect();
        let tracker = Tracker::default();

        let result: Result<(), ()> = for_each_bounded(&items, 3, |&i| {
            let tracker = &tracker;
            async move {
                tracker.run(i, Duration::from_millis(10 + (i as u64 % 3) * 5)).await;
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(tracker.sorted_calls(), items);
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_input_never_calls_handler() {
        let items: Vec<usize> = Vec::new();
        // The handler always fails, so Ok means it never ran.
        let result = for_each_bounded(&items, 4, |_| async { Err::<(), _>("handler ran") }).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_runs_one_at_a_time() {
        let items: Vec<usize> = (0..4).collect();
        let tracker = Tracker::default();

        let result: Result<(), ()> = for_each_bounded(&items, 0, |&i| {
            let tracker = &tracker;
            async move {
                tracker.run(i, Duration::from_millis(5)).await;
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
        // A single worker walks the cursor in order.
        assert_eq!(*tracker.calls.lock(), items);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_above_len_is_clamped() {
        let items: Vec<usize> = (0..3).collect();
        let tracker = Tracker::default();

        let result: Result<(), ()> = for_each_bounded(&items, 64, |&i| {
            let tracker = &tracker;
            async move {
                tracker.run(i, Duration::from_millis(5)).await;
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(tracker.sorted_calls(), items);
        assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn failure_stops_new_claims() {
        let items: Vec<usize> = (0..10).collect();
        let calls = Mutex::new(Vec::new());

        let result = for_each_bounded(&items, 2, |&i| {
            let calls = &calls;
            async move {
                calls.lock().push(i);
                tokio::task::yield_now().await;
                if i == 3 {
                    Err(format!("item {i} failed"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(result, Err("item 3 failed".to_string()));
        let calls = calls.into_inner();
        assert!(calls.contains(&3));
        assert!(calls.len() < items.len(), "kept claiming after failure: {calls:?}");
        let mut unique = calls.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), calls.len(), "item claimed twice: {calls:?}");
    }

    #[tokio::test]
    async fn first_failure_wins() {
        let items: Vec<usize> = (0..5).collect();
        let calls = Mutex::new(Vec::new());

        let result = for_each_bounded(&items, 1, |&i| {
            let calls = &calls;
            async move {
                calls.lock().push(i);
                if i >= 1 {
                    Err(i)
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(result, Err(1));
        assert_eq!(calls.into_inner(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_work_finishes_after_failure() {
        let items: Vec<usize> = (0..2).collect();
        let finished = Mutex::new(Vec::new());

        let result = for_each_bounded(&items, 2, |&i| {
            let finished = &finished;
            async move {
                if i == 0 {
                    return Err("fast failure");
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished.lock().push(i);
                Ok(())
            }
        })
        .await;

        assert_eq!(result, Err("fast failure"));
        assert_eq!(finished.into_inner(), vec![1]);
    }
}
