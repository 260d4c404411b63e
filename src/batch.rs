use std::{future::Future, time::Duration};

use futures::future::join_all;
use tokio::time::Instant;
use tracing::info;

/// Logs `done/total` with an ETA projected from the elapsed time.
#[derive(Debug)]
pub struct Progress {
    label: String,
    total: usize,
    started: Instant,
}

impl Progress {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        Self {
            label: label.into(),
            total,
            started: Instant::now(),
        }
    }

    pub fn eta(&self, done: usize) -> Option<Duration> {
        if done == 0 || done > self.total {
            return None;
        }
        let per_item = self.started.elapsed().as_secs_f64() / done as f64;
        Some(Duration::from_secs_f64(per_item * (self.total - done) as f64))
    }

    pub fn report(&self, done: usize) {
        let percent = if self.total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / self.total as f64
        };
        let eta_secs = self.eta(done).map(|d| d.as_secs()).unwrap_or(0);
        info!(
            done,
            total = self.total,
            eta_secs,
            "{}: {percent:.1}%",
            self.label
        );
    }
}

/// Runs `processor` over `items` in consecutive batches of `limit`.
///
/// Each batch runs concurrently and must fully settle before the next one
/// starts. Results come back in input order, one per item.
pub async fn process_with_concurrency<T, R, F, Fut>(
    items: impl IntoIterator<Item = T>,
    limit: usize,
    progress: Option<&Progress>,
    mut processor: F,
) -> Vec<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    let limit = limit.max(1);
    let mut items = items.into_iter();
    let mut results = Vec::new();

    loop {
        let batch: Vec<T> = items.by_ref().take(limit).collect();
        if batch.is_empty() {
            break;
        }

        let settled = join_all(batch.into_iter().map(&mut processor)).await;
        results.extend(settled);

        if let Some(progress) = progress {
            progress.report(results.len());
        }
    }

    results
}
