//! Bounded fan-out for per-host work.
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run `f` over `items` with at most `jobs` in flight, returning results in
/// input order. `jobs <= 1` runs sequentially on the current task.
///
/// A slot is `None` only if its task panicked.
pub async fn map_bounded<T, R, F, Fut>(items: Vec<T>, jobs: usize, f: F) -> Vec<Option<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    if jobs <= 1 {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(Some(f(item).await));
        }
        return out;
    }

    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(items.len()).collect();
    let permits = Arc::new(Semaphore::new(jobs));
    let mut js: JoinSet<(usize, R)> = JoinSet::new();

    for (idx, item) in items.into_iter().enumerate() {
        let fut = f(item);
        let permits = permits.clone();
        js.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (idx, fut.await)
        });
    }

    while let Some(res) = js.join_next().await {
        match res {
            Ok((idx, r)) => slots[idx] = Some(r),
            Err(e) => tracing::error!(error = %e, "worker task failed"),
        }
    }

    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequential_preserves_order() {
        let out = map_bounded(vec![3, 1, 2], 1, |n| async move { n * 10 }).await;
        assert_eq!(out, vec![Some(30), Some(10), Some(20)]);
    }

    #[tokio::test]
    async fn test_parallel_preserves_order_despite_finish_order() {
        let items: Vec<u64> = vec![50, 10, 30, 0, 20];
        let out = map_bounded(items, 3, |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ms
        })
        .await;
        assert_eq!(out, vec![Some(50), Some(10), Some(30), Some(0), Some(20)]);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items: Vec<usize> = (0..10).collect();

        let out = map_bounded(items, 3, |_| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(out.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panicking_task_leaves_empty_slot() {
        let out = map_bounded(vec![1, 2, 3], 2, |n| async move {
            if n == 2 {
                panic!("boom");
            }
            n
        })
        .await;
        assert_eq!(out, vec![Some(1), None, Some(3)]);
    }
}
