use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::api::FlagsApi;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts how often each feature is evaluated and periodically reports the counts to the API.
pub struct AnalyticsProcessor {
    api: Arc<dyn FlagsApi>,
    counts: Mutex<HashMap<String, u32>>,
    last_flushed: Mutex<Instant>,
    flush_interval: Duration,
    flush_requested: Notify,
}

impl AnalyticsProcessor {
    pub fn new(api: Arc<dyn FlagsApi>, flush_interval: Duration) -> Self {
        AnalyticsProcessor {
            api,
            counts: Mutex::new(HashMap::new()),
            last_flushed: Mutex::new(Instant::now()),
            flush_interval,
            flush_requested: Notify::new(),
        }
    }

    pub fn track_feature(&self, feature_name: &str) {
        *lock(&self.counts)
            .entry(feature_name.to_string())
            .or_insert(0) += 1;

        if lock(&self.last_flushed).elapsed() > self.flush_interval {
            self.flush_requested.notify_one();
        }
    }

    /// Counts not yet reported.
    pub fn pending_counts(&self) -> HashMap<String, u32> {
        lock(&self.counts).clone()
    }

    /// Reports the pending counts. If the API can't be reached the counts are kept for the
    /// next flush.
    #[instrument(skip_all)]
    pub async fn flush(&self) {
        let counts = std::mem::take(&mut *lock(&self.counts));
        if counts.is_empty() {
            return;
        }

        match self.api.post_analytics(&counts).await {
            Ok(()) => debug!(features = counts.len(), "flushed flag analytics"),
            Err(e) => {
                warn!(error = %e, "Temporarily unable to access flag analytics endpoint");
                let mut pending = lock(&self.counts);
                for (feature_name, count) in counts {
                    *pending.entry(feature_name).or_insert(0) += count;
                }
            }
        }

        *lock(&self.last_flushed) = Instant::now();
    }

    /// Flushes every `flush_interval`, whenever tracking finds the last flush is overdue, and
    /// one final time when cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.flush_interval.max(Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush().await;
                    return;
                }
                _ = interval.tick() => self.flush().await,
                _ = self.flush_requested.notified() => self.flush().await,
            }
        }
    }
}
