use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::batch::NotificationBatcher;
use crate::cache::{CacheEntry, IdentityTable};
use crate::config::{ExecutionMode, LoaderConfig, LoaderError};
use crate::content_id::ContentIdentity;
use crate::eviction::Quota;
use crate::notify::Notification;
use crate::observability::{self, panic_payload_to_string};
use crate::render::{Bitmap, Lane, Priority, RenderStage, Renderer};
use crate::scheduler::{Dispatch, QueueTelemetry, QueuedWork, Scheduler};
use crate::sync::lock_unpoisoned;
use crate::task::{RenderTask, Revival};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New identity; a task was created and scheduled.
    Created,
    /// Joined the live task for this identity.
    Joined,
    /// Joined a cancelled task and put it back in the queues.
    Resumed,
    /// Renders are cached and no task is live; nothing to do.
    AlreadyCached,
}

impl EnqueueOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            EnqueueOutcome::Created => "created",
            EnqueueOutcome::Joined => "joined",
            EnqueueOutcome::Resumed => "resumed",
            EnqueueOutcome::AlreadyCached => "already_cached",
        }
    }
}

impl fmt::Display for EnqueueOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub uid: u64,
    pub base_priority: Priority,
    pub priority: u32,
    pub stage: RenderStage,
    pub interest: usize,
    pub cancelled: bool,
    pub forced_out: bool,
    pub is_final: bool,
    pub notifications: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub identity: ContentIdentity,
    pub task: Option<TaskSnapshot>,
    /// Cached render sizes, smallest first.
    pub resolutions: Vec<(u32, u32)>,
    pub estimated_bytes: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderTelemetry {
    pub entries: usize,
    pub cached_bytes: usize,
    pub queue: QueueTelemetry,
    pub critical_limit: usize,
    pub critical_workers: usize,
    pub stages_executed: u64,
    pub wasted_renders: u64,
    pub entries_evicted: u64,
}

#[derive(Clone, Copy, Debug)]
struct Limits {
    preview_max_dimension: u32,
    max_cached_images: usize,
    max_cached_bytes: usize,
}

struct EngineShared {
    renderer: Arc<dyn Renderer>,
    limits: Mutex<Limits>,
    table: Mutex<IdentityTable>,
    scheduler: Scheduler,
    eviction: Mutex<()>,
    next_uid: AtomicU64,
    stages_executed: AtomicU64,
    wasted_renders: AtomicU64,
    entries_evicted: AtomicU64,
}

struct Workers {
    handles: Vec<JoinHandle<()>>,
    critical_spawned: usize,
}

/// Progressive loader: deduplicates payloads by content identity, runs their
/// render stages on a critical pool and a single standard worker, and keeps
/// the renders under count and byte quotas.
pub struct LoaderEngine {
    shared: Arc<EngineShared>,
    mode: ExecutionMode,
    batcher: NotificationBatcher,
    workers: Mutex<Workers>,
}

impl LoaderEngine {
    pub fn new(config: LoaderConfig, renderer: Arc<dyn Renderer>) -> Result<Self, LoaderError> {
        config.validate()?;
        let batcher = NotificationBatcher::new(config.batch)?;
        let shared = Arc::new(EngineShared {
            renderer,
            limits: Mutex::new(Limits {
                preview_max_dimension: config.preview_max_dimension,
                max_cached_images: config.max_cached_images,
                max_cached_bytes: config.max_cached_bytes,
            }),
            table: Mutex::new(IdentityTable::default()),
            scheduler: Scheduler::new(config.critical_concurrency),
            eviction: Mutex::new(()),
            next_uid: AtomicU64::new(1),
            stages_executed: AtomicU64::new(0),
            wasted_renders: AtomicU64::new(0),
            entries_evicted: AtomicU64::new(0),
        });
        let engine = Self {
            shared,
            mode: config.mode,
            batcher,
            workers: Mutex::new(Workers {
                handles: Vec::new(),
                critical_spawned: 0,
            }),
        };
        if config.mode == ExecutionMode::Threaded {
            let standard = spawn_worker(&engine.shared, "loader-standard".to_string(), Lane::Standard)?;
            lock_unpoisoned(&engine.workers).handles.push(standard);
            engine.spawn_critical_workers(config.critical_concurrency)?;
        }
        log::debug!(
            "loader engine started ({:?}, {} critical, preview {} px)",
            config.mode,
            config.critical_concurrency,
            config.preview_max_dimension
        );
        Ok(engine)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Batcher built from the engine's batch config, for
    /// `Notification::batched`.
    pub fn batcher(&self) -> &NotificationBatcher {
        &self.batcher
    }

    pub fn enqueue(&self, payload: &[u8], priority: Priority) -> EnqueueOutcome {
        let identity = ContentIdentity::of(payload);
        let mut table = lock_unpoisoned(&self.shared.table);
        if let Some(entry) = table.get(&identity) {
            if let Some(task) = entry.task() {
                let task = Arc::clone(task);
                task.raise_priority(priority);
                let revival = task.revive();
                drop(table);
                self.shared.requeue(identity, &task, revival);
                if revival.resumed {
                    log::debug!("resuming task {} for {}", task.uid(), identity);
                    return EnqueueOutcome::Resumed;
                }
                return EnqueueOutcome::Joined;
            }
            if entry.resolutions() > 0 {
                return EnqueueOutcome::AlreadyCached;
            }
            log::debug!("replacing dead entry for {}", identity);
        }
        let uid = self.shared.next_uid.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(RenderTask::new(uid, Arc::from(payload), priority));
        table.insert(identity, CacheEntry::with_task(Arc::clone(&task)));
        drop(table);
        log::debug!("task {} created for {} at {}", uid, identity, priority);
        self.shared.schedule(identity, &task);
        self.shared.enforce_quota();
        EnqueueOutcome::Created
    }

    pub fn cancel(&self, payload: &[u8]) {
        let identity = ContentIdentity::of(payload);
        let (task, orphaned) = {
            let table = lock_unpoisoned(&self.shared.table);
            let Some(entry) = table.get(&identity) else {
                return;
            };
            let found = match entry.task() {
                Some(task) if task.release() => return,
                Some(task) => (Some(Arc::clone(task)), false),
                None => (None, entry.resolutions() == 0),
            };
            found
        };
        let Some(task) = task else {
            if orphaned {
                observability::invariant_violation(format!(
                    "entry {} has neither a task nor renders",
                    identity
                ));
                lock_unpoisoned(&self.shared.table).remove(&identity);
            }
            return;
        };
        if !self.shared.scheduler.remove(&task) {
            log::debug!("task {} not queued at cancel; it is running or already reaped", task.uid());
            return;
        }
        let mut table = lock_unpoisoned(&self.shared.table);
        let unwanted = table.get(&identity).is_some_and(|entry| {
            entry.holds(&task) && entry.resolutions() == 0 && task.interest() == 0
        });
        if unwanted {
            table.remove(&identity);
            log::debug!("cancelled task {} before its first render", task.uid());
        }
    }

    /// Returns the largest cached render. When a task is live and a
    /// notification is supplied, the notification receives the task's
    /// remaining renders and holds interest on it until cancelled.
    pub fn lookup(&self, payload: &[u8], notification: Option<&Notification>) -> Option<Arc<Bitmap>> {
        let identity = ContentIdentity::of(payload);
        let mut table = lock_unpoisoned(&self.shared.table);
        let entry = table.get(&identity)?;
        let mut revived = None;
        if let (Some(task), Some(notification)) = (entry.task(), notification) {
            if !notification.is_cancelled() && task.register(notification) {
                let revival = task.revive();
                notification.attach(task);
                revived = Some((Arc::clone(task), revival));
            }
        }
        let best = entry.best_render().cloned();
        table.touch(&identity);
        drop(table);
        if let Some((task, revival)) = revived {
            if revival.resumed {
                log::debug!("notification resumed task {} for {}", task.uid(), identity);
            }
            self.shared.requeue(identity, &task, revival);
        }
        best
    }

    /// Drops every queued stage, all interest and every cached render.
    pub fn flush(&self) {
        let drained = self.shared.scheduler.clear();
        let mut table = lock_unpoisoned(&self.shared.table);
        for entry in table.entries.values() {
            if let Some(task) = entry.task() {
                task.clear_interest();
            }
        }
        let entries = table.len();
        table.clear();
        drop(table);
        log::debug!("flushed {} entries and {} queued stages", entries, drained.len());
    }

    /// Runs one stage on the calling thread. Only meaningful in manual mode.
    /// Returns false when nothing was runnable.
    pub fn step(&self) -> bool {
        if self.mode != ExecutionMode::Manual {
            log::warn!("step() ignored: engine runs its own workers");
            return false;
        }
        let scheduler = &self.shared.scheduler;
        loop {
            let critical = scheduler.try_next(Lane::Critical);
            if critical.work.is_some() {
                self.shared.process(critical, Lane::Critical);
                return true;
            }
            let reaped_critical = !critical.reaped.is_empty();
            self.shared.reap(critical.reaped);
            let standard = scheduler.try_next(Lane::Standard);
            if standard.work.is_some() {
                self.shared.process(standard, Lane::Standard);
                return true;
            }
            let reaped_standard = !standard.reaped.is_empty();
            self.shared.reap(standard.reaped);
            if !reaped_critical && !reaped_standard {
                return false;
            }
        }
    }

    /// Runs stages until the queues are empty. Returns the number run.
    pub fn pump(&self) -> usize {
        let mut steps = 0;
        while self.step() {
            steps += 1;
        }
        steps
    }

    /// Waits until nothing is queued or running. Manual engines pump instead.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        if self.mode == ExecutionMode::Manual {
            self.pump();
            return self.shared.scheduler.is_idle();
        }
        self.shared.scheduler.wait_idle(timeout)
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.shared.table).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.shared.table).is_empty()
    }

    pub fn snapshot(&self, payload: &[u8]) -> Option<EntrySnapshot> {
        let identity = ContentIdentity::of(payload);
        let table = lock_unpoisoned(&self.shared.table);
        let entry = table.get(&identity)?;
        let task = entry.task().map(|task| TaskSnapshot {
            uid: task.uid(),
            base_priority: task.base_priority(),
            priority: task.priority(),
            stage: task.stage(),
            interest: task.interest(),
            cancelled: task.is_cancelled(),
            forced_out: task.is_forced_out(),
            is_final: task.is_final(),
            notifications: task.notification_count(),
        });
        Some(EntrySnapshot {
            identity,
            task,
            resolutions: entry
                .renders
                .values()
                .map(|bitmap| bitmap.dimensions())
                .collect(),
            estimated_bytes: entry.estimated_bytes(),
        })
    }

    pub fn telemetry(&self) -> LoaderTelemetry {
        let (entries, cached_bytes) = {
            let table = lock_unpoisoned(&self.shared.table);
            (table.len(), table.cached_bytes())
        };
        LoaderTelemetry {
            entries,
            cached_bytes,
            queue: self.shared.scheduler.telemetry(),
            critical_limit: self.shared.scheduler.permits.limit(),
            critical_workers: lock_unpoisoned(&self.workers).critical_spawned,
            stages_executed: self.shared.stages_executed.load(Ordering::Relaxed),
            wasted_renders: self.shared.wasted_renders.load(Ordering::Relaxed),
            entries_evicted: self.shared.entries_evicted.load(Ordering::Relaxed),
        }
    }

    pub fn preview_max_dimension(&self) -> u32 {
        self.shared.limits().preview_max_dimension
    }

    /// Applies to stages started after the call.
    pub fn set_preview_max_dimension(&self, dimension: u32) {
        lock_unpoisoned(&self.shared.limits).preview_max_dimension = dimension.max(1);
    }

    pub fn set_max_cached_images(&self, count: usize) {
        lock_unpoisoned(&self.shared.limits).max_cached_images = count.max(1);
        self.shared.enforce_quota();
    }

    pub fn set_max_cached_bytes(&self, bytes: usize) {
        lock_unpoisoned(&self.shared.limits).max_cached_bytes = bytes.max(1);
        self.shared.enforce_quota();
    }

    pub fn critical_concurrency_limit(&self) -> usize {
        self.shared.scheduler.permits.limit()
    }

    /// Raising the limit spawns workers as needed; lowering it takes effect as
    /// running stages finish.
    pub fn set_critical_concurrency_limit(&self, limit: usize) -> Result<(), LoaderError> {
        let limit = limit.max(1);
        self.shared.scheduler.permits.set_limit(limit);
        if self.mode == ExecutionMode::Threaded {
            self.spawn_critical_workers(limit)?;
        }
        Ok(())
    }

    fn spawn_critical_workers(&self, target: usize) -> Result<(), LoaderError> {
        let mut workers = lock_unpoisoned(&self.workers);
        while workers.critical_spawned < target {
            let name = format!("loader-critical-{}", workers.critical_spawned);
            let handle = spawn_worker(&self.shared, name, Lane::Critical)?;
            workers.handles.push(handle);
            workers.critical_spawned += 1;
        }
        Ok(())
    }
}

impl Drop for LoaderEngine {
    fn drop(&mut self) {
        self.shared.scheduler.shutdown();
        let handles = std::mem::take(&mut lock_unpoisoned(&self.workers).handles);
        for handle in handles {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for LoaderEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderEngine")
            .field("mode", &self.mode)
            .field("telemetry", &self.telemetry())
            .finish()
    }
}

fn spawn_worker(
    shared: &Arc<EngineShared>,
    name: String,
    lane: Lane,
) -> Result<JoinHandle<()>, LoaderError> {
    let worker_shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(&worker_shared, lane))
        .map_err(|source| LoaderError::Spawn { name, source })
}

fn worker_loop(shared: &EngineShared, lane: Lane) {
    loop {
        let permit = match lane {
            Lane::Critical => match shared.scheduler.permits.acquire() {
                Some(permit) => Some(permit),
                None => break,
            },
            Lane::Standard => None,
        };
        let Some(dispatch) = shared.scheduler.wait_next(lane) else {
            break;
        };
        shared.process(dispatch, lane);
        drop(permit);
    }
}

impl EngineShared {
    fn limits(&self) -> Limits {
        *lock_unpoisoned(&self.limits)
    }

    fn quota(&self) -> Quota {
        let limits = self.limits();
        Quota {
            max_images: limits.max_cached_images,
            max_bytes: limits.max_cached_bytes,
        }
    }

    fn schedule(&self, identity: ContentIdentity, task: &Arc<RenderTask>) {
        if let Some(priority) = task.try_queue() {
            self.scheduler.push(
                QueuedWork {
                    identity,
                    task: Arc::clone(task),
                },
                priority,
            );
        }
    }

    fn requeue(&self, identity: ContentIdentity, task: &Arc<RenderTask>, revival: Revival) {
        if let Some(priority) = revival.queue_at {
            self.scheduler.push(
                QueuedWork {
                    identity,
                    task: Arc::clone(task),
                },
                priority,
            );
        }
    }

    fn process(&self, dispatch: Dispatch, lane: Lane) {
        self.reap(dispatch.reaped);
        if let Some(work) = dispatch.work {
            self.execute(work, lane);
        }
    }

    fn reap(&self, reaped: Vec<QueuedWork>) {
        if reaped.is_empty() {
            return;
        }
        let mut table = lock_unpoisoned(&self.table);
        for work in &reaped {
            // A resubmission can revive the task between dequeue and here.
            if work.task.interest() == 0 {
                table.detach_task(&work.identity, &work.task);
            }
        }
    }

    fn execute(&self, work: QueuedWork, lane: Lane) {
        let identity = work.identity;
        let task = Arc::clone(&work.task);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_stage(work)));
        if let Err(payload) = result {
            observability::set_sticky_error(format!(
                "render stage panic in task {} ({})",
                task.uid(),
                panic_payload_to_string(payload.as_ref())
            ));
            lock_unpoisoned(&self.table).detach_task(&identity, &task);
            task.mark_idle();
        }
        self.scheduler.finish(lane);
    }

    fn run_stage(&self, work: QueuedWork) {
        let QueuedWork { identity, task } = work;
        if !lock_unpoisoned(&self.table).is_attached(&identity, &task) {
            log::debug!("skipping task {}: no longer attached", task.uid());
            task.mark_idle();
            return;
        }
        let stage = task.stage();
        let produced = task.advance(self.renderer.as_ref(), self.limits().preview_max_dimension);
        self.stages_executed.fetch_add(1, Ordering::Relaxed);
        self.wasted_renders
            .fetch_add(task.take_unheard_renders(), Ordering::Relaxed);
        if let Some(bitmap) = &produced {
            log::debug!(
                "task {} {} -> {}x{}",
                task.uid(),
                stage,
                bitmap.width(),
                bitmap.height()
            );
        }
        if self.commit(&identity, &task, produced) {
            self.enforce_quota();
        }
        let attached = lock_unpoisoned(&self.table).is_attached(&identity, &task);
        if let Some(priority) = task.finish_stage(attached) {
            self.scheduler.push(QueuedWork { identity, task }, priority);
        }
    }

    /// Stores a stage result and detaches the task once it has nothing left to
    /// produce. Returns whether a render was stored.
    fn commit(
        &self,
        identity: &ContentIdentity,
        task: &Arc<RenderTask>,
        produced: Option<Arc<Bitmap>>,
    ) -> bool {
        let mut violation = None;
        let stored = {
            let mut table = lock_unpoisoned(&self.table);
            if !table.is_attached(identity, task) {
                if task.is_forced_out() {
                    log::debug!("task {} was forced out by eviction", task.uid());
                } else if produced.is_some() {
                    log::debug!("dropping render of detached task {}", task.uid());
                }
                return false;
            }
            let stored = match produced {
                Some(bitmap) => table.store_render(identity, bitmap),
                None => false,
            };
            if !stored {
                let cached = table.get(identity).map_or(0, |entry| entry.resolutions());
                if cached == 0 && task.interest() > 0 {
                    if task.has_rendered() {
                        violation = Some(format!(
                            "task {} ended with nothing cached for {}",
                            task.uid(),
                            identity
                        ));
                    } else {
                        log::warn!("payload {} produced no render; dropping it", identity);
                    }
                }
            }
            if !stored || task.is_final() {
                table.detach_task(identity, task);
            }
            stored
        };
        if let Some(message) = violation {
            observability::invariant_violation(message);
        }
        stored
    }

    fn enforce_quota(&self) {
        let quota = self.quota();
        if !lock_unpoisoned(&self.table).over_quota(quota) {
            return;
        }
        let _eviction = lock_unpoisoned(&self.eviction);
        let report = lock_unpoisoned(&self.table).evict_to_quota(quota);
        if report.renders_dropped > 0 || report.entries_removed > 0 {
            self.entries_evicted
                .fetch_add(report.entries_removed as u64, Ordering::Relaxed);
            log::debug!(
                "eviction: {} passes, {} entries removed, {} renders dropped, {} bytes freed, {} tasks forced out",
                report.passes,
                report.entries_removed,
                report.renders_dropped,
                report.bytes_freed,
                report.tasks_forced_out
            );
        }
        if report.stalled {
            observability::invariant_violation(format!(
                "eviction stalled above {} cached bytes",
                quota.max_bytes
            ));
        }
    }
}
