use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Keyed trailing-edge scheduler shared by every debounced write path.
///
/// Scheduling a key that already has a pending task cancels it and
/// restarts the timer. A task that has started running is never
/// cancelled by a later schedule.
#[derive(Clone, Default)]
pub struct Debouncer {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once `delay` passes without another schedule for `key`.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: impl Into<String>, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let task_key = key.clone();

        // Hold the lock across spawn so the task cannot claim its slot
        // before it is recorded.
        let mut slots = self.pending.lock().unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slots = pending.lock().unwrap();
                match slots.get(&task_key) {
                    Some(p) if p.generation == generation => {
                        slots.remove(&task_key);
                    }
                    _ => return,
                }
            }
            task().await;
        });

        if let Some(previous) = slots.insert(key, Pending { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the pending task for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match self.pending.lock().unwrap().remove(key) {
            Some(p) => {
                p.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, p) in self.pending.lock().unwrap().drain() {
            p.handle.abort();
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().unwrap().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_run() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(2000);

        for _ in 0..10 {
            debouncer.schedule("blob", delay, counter_task(&runs));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending("blob"));

        tokio::time::sleep(Duration::from_millis(1899)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending("blob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule("book:a", Duration::from_millis(10), counter_task(&runs));
        debouncer.schedule("book:b", Duration::from_millis(10), counter_task(&runs));
        assert_eq!(debouncer.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule("k", Duration::from_millis(10), counter_task(&runs));
        assert!(debouncer.cancel("k"));
        assert!(!debouncer.cancel("k"));

        debouncer.schedule("k2", Duration::from_millis(10), counter_task(&runs));
        debouncer.cancel_all();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
