//! Publish-rate limiting for watched cells
//!
//! Semantics are coalesce-to-last-write: while a timer is pending, a new
//! trigger replaces it with a fresh timer of the full window length, so a
//! hot entity publishes at most once per window and the window's final
//! state is what gets published. Changing the frequency cancels the
//! pending timer and re-publishes the current value on the next turn, so
//! no observer is left waiting out a stale schedule.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// One scheduler per cell; holds at most one pending timer.
pub(crate) struct DebounceScheduler {
    /// Debounce window in milliseconds; `None` publishes immediately.
    /// Shared with the publish callback so snapshots carry the frequency.
    freq: Arc<Mutex<Option<u64>>>,
    pending: Mutex<PendingTimer>,
    publish: Arc<dyn Fn() + Send + Sync>,
}

struct PendingTimer {
    /// Generation counter; a timer only fires if it is still current.
    seq: u64,
    handle: Option<JoinHandle<()>>,
}

impl DebounceScheduler {
    pub(crate) fn new(
        freq: Arc<Mutex<Option<u64>>>,
        publish: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            freq,
            pending: Mutex::new(PendingTimer {
                seq: 0,
                handle: None,
            }),
            publish,
        })
    }

    pub(crate) fn frequency(&self) -> Option<u64> {
        *self.freq.lock().unwrap()
    }

    /// An accepted event arrived: publish now, or (re)start the timer.
    pub(crate) fn trigger(self: &Arc<Self>) {
        let freq = self.frequency();
        match freq {
            None => (*self.publish)(),
            Some(ms) => {
                let mut pending = self.pending.lock().unwrap();
                pending.seq += 1;
                let seq = pending.seq;
                if let Some(handle) = pending.handle.take() {
                    handle.abort();
                }
                let scheduler = Arc::clone(self);
                pending.handle = Some(tokio::spawn(async move {
                    sleep(Duration::from_millis(ms)).await;
                    scheduler.fire(seq);
                }));
            }
        }
    }

    fn fire(&self, seq: u64) {
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.seq != seq {
                return;
            }
            pending.handle = None;
        }
        (*self.publish)();
    }

    /// Adopt a new frequency. A pending timer is cancelled and replaced by
    /// a zero-delay re-publish of the current value.
    pub(crate) fn set_frequency(&self, freq: Option<u64>) {
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(handle) = pending.handle.take() {
                pending.seq += 1;
                handle.abort();
                let publish = Arc::clone(&self.publish);
                tokio::spawn(async move {
                    (*publish)();
                });
            }
        }
        *self.freq.lock().unwrap() = freq;
    }

    /// Cancel any pending timer without publishing.
    pub(crate) fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.seq += 1;
        if let Some(handle) = pending.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_scheduler(freq: Option<u64>) -> (Arc<DebounceScheduler>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let publish = {
            let count = Arc::clone(&count);
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }) as Arc<dyn Fn() + Send + Sync>
        };
        let scheduler = DebounceScheduler::new(Arc::new(Mutex::new(freq)), publish);
        (scheduler, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_mode_publishes_per_trigger() {
        let (scheduler, count) = counting_scheduler(None);
        scheduler.trigger();
        scheduler.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_coalesces_to_one_publish() {
        let (scheduler, count) = counting_scheduler(Some(100));
        scheduler.trigger();
        scheduler.trigger();
        scheduler.trigger();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_trigger_restarts_the_window() {
        let (scheduler, count) = counting_scheduler(Some(100));
        scheduler.trigger();
        sleep(Duration::from_millis(30)).await;
        scheduler.trigger();

        // 120ms in: the first timer would have fired at 100, but the second
        // trigger replaced it with one due at 130.
        sleep(Duration::from_millis(90)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_change_republishes_pending_value() {
        let (scheduler, count) = counting_scheduler(Some(100));
        scheduler.trigger();
        scheduler.set_frequency(Some(500));

        // The pending timer is gone; a zero-delay re-publish replaces it.
        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // No second publish from the aborted timer.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Subsequent triggers use the new window.
        scheduler.trigger();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_change_without_pending_timer_is_silent() {
        let (scheduler, count) = counting_scheduler(Some(100));
        scheduler.set_frequency(None);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending_timer() {
        let (scheduler, count) = counting_scheduler(Some(100));
        scheduler.trigger();
        scheduler.cancel();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
