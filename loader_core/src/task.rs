use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::notify::Notification;
use crate::render::{effective_priority, Bitmap, Priority, RenderStage, Renderer};
use crate::sync::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Schedule {
    Idle,
    Queued,
    Running,
}

/// Result of [`RenderTask::revive`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Revival {
    /// The task was cancelled before the new interest arrived.
    pub(crate) resumed: bool,
    pub(crate) queue_at: Option<u32>,
}

struct TaskState {
    base_priority: Priority,
    stage: RenderStage,
    is_final: bool,
    has_rendered: bool,
    current: Option<Arc<Bitmap>>,
    schedule: Schedule,
}

impl TaskState {
    fn priority(&self) -> u32 {
        effective_priority(self.base_priority, self.stage, self.has_rendered)
    }

    fn can_run(&self) -> bool {
        !self.is_final && self.stage != RenderStage::Done
    }
}

/// Drives one payload through the render stages.
///
/// Interest is an atomic count of submitters and registered notifications.
/// Hitting zero flags the task cancelled; the scheduler reaps it lazily.
pub struct RenderTask {
    uid: u64,
    payload: Arc<[u8]>,
    interest: AtomicUsize,
    cancelled: AtomicBool,
    forced_out: AtomicBool,
    unheard_renders: AtomicU64,
    state: Mutex<TaskState>,
    notifications: Mutex<VecDeque<Notification>>,
}

impl RenderTask {
    pub(crate) fn new(uid: u64, payload: Arc<[u8]>, priority: Priority) -> Self {
        Self {
            uid,
            payload,
            interest: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
            forced_out: AtomicBool::new(false),
            unheard_renders: AtomicU64::new(0),
            state: Mutex::new(TaskState {
                base_priority: priority,
                stage: RenderStage::FastPreview,
                is_final: false,
                has_rendered: false,
                current: None,
                schedule: Schedule::Idle,
            }),
            notifications: Mutex::new(VecDeque::new()),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn priority(&self) -> u32 {
        lock_unpoisoned(&self.state).priority()
    }

    pub fn base_priority(&self) -> Priority {
        lock_unpoisoned(&self.state).base_priority
    }

    pub fn stage(&self) -> RenderStage {
        lock_unpoisoned(&self.state).stage
    }

    pub fn is_final(&self) -> bool {
        lock_unpoisoned(&self.state).is_final
    }

    pub fn has_rendered(&self) -> bool {
        lock_unpoisoned(&self.state).has_rendered
    }

    pub fn current_render(&self) -> Option<Arc<Bitmap>> {
        lock_unpoisoned(&self.state).current.clone()
    }

    pub fn interest(&self) -> usize {
        self.interest.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_forced_out(&self) -> bool {
        self.forced_out.load(Ordering::Acquire)
    }

    pub fn notification_count(&self) -> usize {
        lock_unpoisoned(&self.notifications).len()
    }

    /// Drops one unit of interest. Returns true while interest remains.
    pub fn release(&self) -> bool {
        let previous = self
            .interest
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match previous {
            Ok(1) => {
                // Interest only grows under the state lock, so a revive that
                // slipped in after the decrement keeps the flag clear.
                let _state = lock_unpoisoned(&self.state);
                if self.interest() == 0 {
                    self.cancelled.store(true, Ordering::Release);
                }
                false
            }
            Ok(_) => true,
            Err(_) => {
                log::debug!("task {} released with no interest left", self.uid);
                false
            }
        }
    }

    /// Adds one unit of interest and clears the cancelled flag. A parked task
    /// moves to queued; `queue_at` is then the bucket to push it into.
    pub(crate) fn revive(&self) -> Revival {
        let mut state = lock_unpoisoned(&self.state);
        self.interest.fetch_add(1, Ordering::AcqRel);
        let resumed = self.cancelled.swap(false, Ordering::AcqRel);
        let queue_at = if state.schedule == Schedule::Idle && state.can_run() {
            state.schedule = Schedule::Queued;
            Some(state.priority())
        } else {
            None
        };
        Revival { resumed, queue_at }
    }

    /// Takes a dequeued task for a run. A task nobody wants is parked idle and
    /// cancelled instead, and false is returned.
    pub(crate) fn claim(&self) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if self.interest() == 0 {
            self.cancelled.store(true, Ordering::Release);
            state.schedule = Schedule::Idle;
            false
        } else {
            state.schedule = Schedule::Running;
            true
        }
    }

    pub(crate) fn clear_interest(&self) {
        let _state = lock_unpoisoned(&self.state);
        self.interest.store(0, Ordering::Release);
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn mark_forced_out(&self) {
        self.forced_out.store(true, Ordering::Release);
    }

    pub(crate) fn take_unheard_renders(&self) -> u64 {
        self.unheard_renders.swap(0, Ordering::AcqRel)
    }

    /// Raises the base priority when `priority` is more urgent.
    pub(crate) fn raise_priority(&self, priority: Priority) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if priority.is_more_urgent_than(state.base_priority) {
            state.base_priority = priority;
            true
        } else {
            false
        }
    }

    /// Moves an idle, unfinished task to queued and returns the priority to
    /// queue it under.
    pub(crate) fn try_queue(&self) -> Option<u32> {
        let mut state = lock_unpoisoned(&self.state);
        if state.schedule != Schedule::Idle || !state.can_run() {
            return None;
        }
        state.schedule = Schedule::Queued;
        Some(state.priority())
    }

    pub(crate) fn mark_idle(&self) {
        lock_unpoisoned(&self.state).schedule = Schedule::Idle;
    }

    #[cfg(test)]
    pub(crate) fn schedule(&self) -> Schedule {
        lock_unpoisoned(&self.state).schedule
    }

    /// Ends a stage run. The task goes back to queued when it is still
    /// attached, unfinished and wanted; the returned priority is the bucket to
    /// requeue it in. Deciding under the state lock means a concurrent revive
    /// either sees `Running` and leaves the requeue to us, or sees `Idle` and
    /// queues the task itself.
    pub(crate) fn finish_stage(&self, attached: bool) -> Option<u32> {
        let mut state = lock_unpoisoned(&self.state);
        if attached && state.can_run() && self.interest() > 0 {
            state.schedule = Schedule::Queued;
            Some(state.priority())
        } else {
            state.schedule = Schedule::Idle;
            None
        }
    }

    pub(crate) fn drop_current(&self) {
        lock_unpoisoned(&self.state).current = None;
    }

    /// Adds `notification` to the front of the list. Returns false when it is
    /// already registered.
    pub(crate) fn register(&self, notification: &Notification) -> bool {
        let mut list = lock_unpoisoned(&self.notifications);
        if list.iter().any(|existing| existing.same_as(notification)) {
            return false;
        }
        list.push_front(notification.clone());
        true
    }

    /// Runs the next stage that produces something, falling through stages
    /// whose renderer call returns nothing.
    pub fn advance(&self, renderer: &dyn Renderer, preview_max: u32) -> Option<Arc<Bitmap>> {
        loop {
            let stage = {
                let mut state = lock_unpoisoned(&self.state);
                let stage = state.stage;
                state.stage = match stage {
                    RenderStage::FastPreview => RenderStage::RefinedPreview,
                    RenderStage::RefinedPreview => RenderStage::Final,
                    RenderStage::Final | RenderStage::Done => RenderStage::Done,
                };
                stage
            };
            match stage {
                RenderStage::FastPreview => {
                    let Some(bitmap) = renderer.render_preview(&self.payload, preview_max, true)
                    else {
                        continue;
                    };
                    let bitmap = Arc::new(bitmap);
                    {
                        let mut state = lock_unpoisoned(&self.state);
                        // A preview already at full preview size makes the refined pass redundant.
                        if bitmap.width() >= preview_max || bitmap.height() >= preview_max {
                            state.stage = RenderStage::Final;
                        }
                        state.has_rendered = true;
                        state.current = Some(Arc::clone(&bitmap));
                    }
                    self.fan_out(&bitmap);
                    return Some(bitmap);
                }
                RenderStage::RefinedPreview => {
                    let Some(bitmap) = renderer.render_preview(&self.payload, preview_max, false)
                    else {
                        continue;
                    };
                    let bitmap = Arc::new(bitmap);
                    {
                        let mut state = lock_unpoisoned(&self.state);
                        state.has_rendered = true;
                        state.current = Some(Arc::clone(&bitmap));
                    }
                    self.fan_out(&bitmap);
                    return Some(bitmap);
                }
                RenderStage::Final => {
                    let previous = lock_unpoisoned(&self.state).current.clone();
                    let rendered = renderer.render_final(&self.payload);
                    let mut state = lock_unpoisoned(&self.state);
                    state.is_final = true;
                    let bitmap = rendered?;
                    if previous.is_some_and(|prev| prev.dimensions() == bitmap.dimensions()) {
                        return None;
                    }
                    let bitmap = Arc::new(bitmap);
                    state.has_rendered = true;
                    state.current = Some(Arc::clone(&bitmap));
                    drop(state);
                    self.fan_out(&bitmap);
                    return Some(bitmap);
                }
                RenderStage::Done => return None,
            }
        }
    }

    fn fan_out(&self, bitmap: &Arc<Bitmap>) {
        let listeners: Vec<Notification> = {
            let mut list = lock_unpoisoned(&self.notifications);
            list.retain(|notification| !notification.is_cancelled());
            list.iter().cloned().collect()
        };
        if listeners.is_empty() {
            self.unheard_renders.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "task {} rendered {}x{} with no listeners",
                self.uid,
                bitmap.width(),
                bitmap.height()
            );
            return;
        }
        for notification in listeners {
            notification.dispatch(Arc::clone(bitmap));
        }
    }
}

impl std::fmt::Debug for RenderTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTask")
            .field("uid", &self.uid)
            .field("interest", &self.interest())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
