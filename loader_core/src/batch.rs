use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{BatchConfig, LoaderError};
use crate::notify::Notification;
use crate::render::Bitmap;
use crate::sync::{lock_unpoisoned, wait_timeout_unpoisoned, wait_unpoisoned};

struct BatchItem {
    notification: Notification,
    bitmap: Arc<Bitmap>,
    joined: Instant,
}

struct BatchState {
    items: Vec<BatchItem>,
    deadline: Option<Instant>,
    count_triggered: bool,
    quantity_limit: usize,
    time_limit: Duration,
    batches_delivered: u64,
    shutdown: bool,
}

impl BatchState {
    fn live_items(&self) -> usize {
        self.items
            .iter()
            .filter(|item| !item.notification.is_cancelled())
            .count()
    }

    fn earliest_live_join(&self) -> Option<Instant> {
        self.items
            .iter()
            .filter(|item| !item.notification.is_cancelled())
            .map(|item| item.joined)
            .min()
    }

    fn check_quotas(&mut self, now: Instant) {
        let live = self.live_items();
        if live == 0 {
            return;
        }
        if live >= self.quantity_limit {
            self.deadline = Some(now);
            self.count_triggered = true;
        } else if live == 1 {
            if let Some(joined) = self.earliest_live_join() {
                self.deadline = Some(joined + self.time_limit);
                self.count_triggered = false;
            }
        }
    }
}

struct BatchShared {
    state: Mutex<BatchState>,
    wake: Condvar,
}

struct BatchWorker {
    shared: Arc<BatchShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for BatchWorker {
    fn drop(&mut self) {
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.shutdown = true;
        }
        self.shared.wake.notify_all();
        let handle = lock_unpoisoned(&self.handle).take();
        if let Some(handle) = handle {
            // The last handle can be dropped by the batch thread itself while
            // it delivers; it exits on its own once it sees the flag.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Coalesces render deliveries for batched notifications. Pending renders are
/// flushed together once `quantity_limit` live items are waiting or the
/// oldest live item has waited `time_limit`.
#[derive(Clone)]
pub struct NotificationBatcher {
    shared: Arc<BatchShared>,
    _worker: Arc<BatchWorker>,
}

impl NotificationBatcher {
    pub fn new(config: BatchConfig) -> Result<Self, LoaderError> {
        config.validate()?;
        let shared = Arc::new(BatchShared {
            state: Mutex::new(BatchState {
                items: Vec::new(),
                deadline: None,
                count_triggered: false,
                quantity_limit: config.quantity_limit,
                time_limit: config.time_limit(),
                batches_delivered: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let name = "loader-batch".to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || batch_loop(&worker_shared))
            .map_err(|source| LoaderError::Spawn { name, source })?;
        let worker = Arc::new(BatchWorker {
            shared: Arc::clone(&shared),
            handle: Mutex::new(Some(handle)),
        });
        Ok(Self {
            shared,
            _worker: worker,
        })
    }

    /// Queues `bitmap` for `notification`, replacing any render still pending
    /// for the same notification.
    pub fn submit(&self, bitmap: Arc<Bitmap>, notification: Notification) {
        let now = Instant::now();
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            if state.shutdown || notification.is_cancelled() {
                return;
            }
            match state
                .items
                .iter_mut()
                .find(|item| item.notification.same_as(&notification))
            {
                Some(item) => item.bitmap = bitmap,
                None => state.items.push(BatchItem {
                    notification,
                    bitmap,
                    joined: now,
                }),
            }
            state.check_quotas(now);
        }
        self.shared.wake.notify_all();
    }

    pub fn quantity_limit(&self) -> usize {
        lock_unpoisoned(&self.shared.state).quantity_limit
    }

    pub fn time_limit(&self) -> Duration {
        lock_unpoisoned(&self.shared.state).time_limit
    }

    /// Lowering the limit flushes immediately when enough items are pending.
    pub fn set_quantity_limit(&self, limit: usize) {
        let limit = limit.max(1);
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            let lowered = limit < state.quantity_limit;
            state.quantity_limit = limit;
            if lowered && state.live_items() >= limit {
                state.deadline = Some(Instant::now());
                state.count_triggered = true;
            }
        }
        self.shared.wake.notify_all();
    }

    pub fn set_time_limit(&self, limit: Duration) {
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.time_limit = limit;
            if !state.count_triggered {
                if let Some(joined) = state.earliest_live_join() {
                    state.deadline = Some(joined + limit);
                }
            }
        }
        self.shared.wake.notify_all();
    }

    pub fn pending(&self) -> usize {
        lock_unpoisoned(&self.shared.state).items.len()
    }

    pub fn batches_delivered(&self) -> u64 {
        lock_unpoisoned(&self.shared.state).batches_delivered
    }
}

impl std::fmt::Debug for NotificationBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.shared.state);
        f.debug_struct("NotificationBatcher")
            .field("pending", &state.items.len())
            .field("quantity_limit", &state.quantity_limit)
            .field("time_limit", &state.time_limit)
            .finish()
    }
}

fn batch_loop(shared: &BatchShared) {
    let mut state = lock_unpoisoned(&shared.state);
    loop {
        if state.shutdown {
            break;
        }
        let Some(deadline) = state.deadline else {
            state = wait_unpoisoned(&shared.wake, state);
            continue;
        };
        let now = Instant::now();
        if now < deadline {
            state = wait_timeout_unpoisoned(&shared.wake, state, deadline - now);
            continue;
        }
        state.deadline = None;
        let by_count = std::mem::take(&mut state.count_triggered);
        if !by_count {
            match state.earliest_live_join() {
                None => {
                    // Dropping a notification can drop the last batcher handle,
                    // which takes this lock.
                    let stale = std::mem::take(&mut state.items);
                    drop(state);
                    drop(stale);
                    state = lock_unpoisoned(&shared.state);
                    continue;
                }
                Some(joined) => {
                    let due = joined + state.time_limit;
                    if due > now {
                        state.deadline = Some(due);
                        continue;
                    }
                }
            }
        }
        let batch = std::mem::take(&mut state.items);
        state.batches_delivered += 1;
        drop(state);
        let pending = batch.len();
        let delivered = batch
            .into_iter()
            .filter(|item| item.notification.deliver(Arc::clone(&item.bitmap)))
            .count();
        log::debug!("batch delivered {} of {} pending renders", delivered, pending);
        state = lock_unpoisoned(&shared.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn bitmap(size: u32) -> Arc<Bitmap> {
        Arc::new(Bitmap::new(size, size, vec![0; (size * size * 4) as usize]))
    }

    fn recording(
        batcher: &NotificationBatcher,
        tx: &mpsc::Sender<(u64, u32, Instant)>,
        tag: u64,
    ) -> Notification {
        let tx = Mutex::new(tx.clone());
        Notification::batched(
            move |bitmap: Arc<Bitmap>| {
                let _ = lock_unpoisoned(&tx).send((tag, bitmap.width(), Instant::now()));
            },
            batcher,
        )
    }

    #[test]
    fn quantity_limit_flushes_one_batch() {
        let batcher = NotificationBatcher::new(BatchConfig {
            quantity_limit: 6,
            time_limit_ms: 60_000,
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        for tag in 0..6 {
            let notification = recording(&batcher, &tx, tag);
            batcher.submit(bitmap(2), notification);
        }
        let mut tags: Vec<u64> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().0)
            .collect();
        tags.sort_unstable();
        assert_eq!(tags, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(batcher.batches_delivered(), 1);
    }

    #[test]
    fn single_item_waits_for_time_limit() {
        let batcher = NotificationBatcher::new(BatchConfig {
            quantity_limit: 6,
            time_limit_ms: 150,
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let submitted = Instant::now();
        batcher.submit(bitmap(2), recording(&batcher, &tx, 1));
        let (_, _, delivered_at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(delivered_at.duration_since(submitted) >= Duration::from_millis(150));
    }

    #[test]
    fn resubmission_replaces_pending_render() {
        let batcher = NotificationBatcher::new(BatchConfig {
            quantity_limit: 2,
            time_limit_ms: 60_000,
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let first = recording(&batcher, &tx, 1);
        batcher.submit(bitmap(2), first.clone());
        batcher.submit(bitmap(8), first);
        assert_eq!(batcher.pending(), 1);
        batcher.submit(bitmap(3), recording(&batcher, &tx, 2));
        let mut got: Vec<(u64, u32)> = (0..2)
            .map(|_| {
                let (tag, width, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                (tag, width)
            })
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![(1, 8), (2, 3)]);
    }

    #[test]
    fn cancelled_items_are_dropped() {
        let batcher = NotificationBatcher::new(BatchConfig {
            quantity_limit: 4,
            time_limit_ms: 30,
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let gone = recording(&batcher, &tx, 1);
        batcher.submit(bitmap(2), gone.clone());
        gone.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.batches_delivered(), 0);
    }

    #[test]
    fn cancelled_head_rearms_for_next_live_item() {
        let batcher = NotificationBatcher::new(BatchConfig {
            quantity_limit: 6,
            time_limit_ms: 300,
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let first = recording(&batcher, &tx, 1);
        batcher.submit(bitmap(2), first.clone());
        thread::sleep(Duration::from_millis(150));
        let second_joined = Instant::now();
        batcher.submit(bitmap(3), recording(&batcher, &tx, 2));
        first.cancel();
        let (tag, _, delivered_at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tag, 2);
        assert!(delivered_at.duration_since(second_joined) >= Duration::from_millis(300));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(batcher.batches_delivered(), 1);
    }

    #[test]
    fn time_limit_changes_move_the_pending_deadline() {
        let batcher = NotificationBatcher::new(BatchConfig {
            quantity_limit: 6,
            time_limit_ms: 60_000,
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let submitted = Instant::now();
        batcher.submit(bitmap(2), recording(&batcher, &tx, 1));
        batcher.set_time_limit(Duration::from_millis(100));
        assert_eq!(batcher.time_limit(), Duration::from_millis(100));
        let (_, _, delivered_at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(delivered_at.duration_since(submitted) >= Duration::from_millis(100));

        let submitted = Instant::now();
        batcher.submit(bitmap(2), recording(&batcher, &tx, 2));
        batcher.set_time_limit(Duration::from_millis(400));
        let (tag, _, delivered_at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tag, 2);
        assert!(delivered_at.duration_since(submitted) >= Duration::from_millis(400));
    }

    #[test]
    fn lowering_quantity_limit_flushes_pending() {
        let batcher = NotificationBatcher::new(BatchConfig {
            quantity_limit: 10,
            time_limit_ms: 60_000,
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        for tag in 0..3 {
            batcher.submit(bitmap(2), recording(&batcher, &tx, tag));
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        batcher.set_quantity_limit(3);
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }
}
