use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::batch::NotificationBatcher;
use crate::render::Bitmap;
use crate::sync::lock_unpoisoned;
use crate::task::RenderTask;

/// Consumer of progressive renders.
pub trait RenderSink: Send + Sync {
    fn on_render(&self, bitmap: Arc<Bitmap>);

    /// Checked right before every delivery.
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl<F> RenderSink for F
where
    F: Fn(Arc<Bitmap>) + Send + Sync,
{
    fn on_render(&self, bitmap: Arc<Bitmap>) {
        self(bitmap)
    }
}

static NEXT_NOTIFICATION_ID: AtomicU64 = AtomicU64::new(1);

struct NotificationInner {
    id: u64,
    sink: Arc<dyn RenderSink>,
    batcher: Option<NotificationBatcher>,
    cancelled: AtomicBool,
    task: Mutex<Option<Weak<RenderTask>>>,
}

/// Registration of a sink with a render task. Cloning shares the
/// registration; cancelling any clone cancels it and gives up the interest it
/// holds on its task.
#[derive(Clone)]
pub struct Notification {
    inner: Arc<NotificationInner>,
}

impl Notification {
    pub fn new(sink: impl RenderSink + 'static) -> Self {
        Self::build(Arc::new(sink), None)
    }

    /// Deliveries go through `batcher` instead of straight to the sink.
    pub fn batched(sink: impl RenderSink + 'static, batcher: &NotificationBatcher) -> Self {
        Self::build(Arc::new(sink), Some(batcher.clone()))
    }

    fn build(sink: Arc<dyn RenderSink>, batcher: Option<NotificationBatcher>) -> Self {
        Self {
            inner: Arc::new(NotificationInner {
                id: NEXT_NOTIFICATION_ID.fetch_add(1, Ordering::Relaxed),
                sink,
                batcher,
                cancelled: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire) || self.inner.sink.is_cancelled()
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = lock_unpoisoned(&self.inner.task).take();
        if let Some(task) = task.and_then(|weak| weak.upgrade()) {
            task.release();
        }
    }

    pub fn same_as(&self, other: &Notification) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Records the task this notification now holds interest on, releasing
    /// the interest held on a previous, different task.
    pub(crate) fn attach(&self, task: &Arc<RenderTask>) {
        let previous = lock_unpoisoned(&self.inner.task).replace(Arc::downgrade(task));
        if let Some(previous) = previous.and_then(|weak| weak.upgrade()) {
            if !Arc::ptr_eq(&previous, task) {
                previous.release();
            }
        }
    }

    pub(crate) fn dispatch(&self, bitmap: Arc<Bitmap>) {
        match &self.inner.batcher {
            Some(batcher) => batcher.submit(bitmap, self.clone()),
            None => {
                self.deliver(bitmap);
            }
        }
    }

    pub(crate) fn deliver(&self, bitmap: Arc<Bitmap>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.inner.sink.on_render(bitmap);
        true
    }
}

impl PartialEq for Notification {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Notification {}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .field("batched", &self.inner.batcher.is_some())
            .finish()
    }
}
