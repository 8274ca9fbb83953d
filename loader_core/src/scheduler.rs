use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::content_id::ContentIdentity;
use crate::render::Lane;
use crate::sync::{lock_unpoisoned, wait_timeout_unpoisoned, wait_unpoisoned};
use crate::task::RenderTask;

pub(crate) struct QueuedWork {
    pub identity: ContentIdentity,
    pub task: Arc<RenderTask>,
}

/// Result of one dequeue: the work to run, if any, plus items reaped because
/// nobody wants them anymore. Reaped tasks still need detaching from the
/// identity table.
pub(crate) struct Dispatch {
    pub work: Option<QueuedWork>,
    pub reaped: Vec<QueuedWork>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueTelemetry {
    pub queued_critical: usize,
    pub queued_standard: usize,
    pub critical_active: usize,
    pub standard_active: bool,
    pub standard_gate_open: bool,
}

struct QueueState {
    buckets: BTreeMap<u32, VecDeque<QueuedWork>>,
    critical_active: usize,
    standard_active: bool,
    gate_open: bool,
    shutdown: bool,
}

impl QueueState {
    fn lane_buckets(&self, lane: Lane) -> impl Iterator<Item = (&u32, &VecDeque<QueuedWork>)> {
        self.buckets
            .iter()
            .filter(move |(priority, _)| Lane::for_priority(**priority) == lane)
    }

    fn queued(&self, lane: Lane) -> usize {
        self.lane_buckets(lane).map(|(_, bucket)| bucket.len()).sum()
    }

    fn has_queued(&self, lane: Lane) -> bool {
        self.lane_buckets(lane).any(|(_, bucket)| !bucket.is_empty())
    }

    fn ready(&self, lane: Lane) -> bool {
        match lane {
            Lane::Critical => self.has_queued(Lane::Critical),
            Lane::Standard => {
                self.gate_open && !self.standard_active && self.has_queued(Lane::Standard)
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.buckets.is_empty() && self.critical_active == 0 && !self.standard_active
    }

    /// Reopens the standard lane once no critical work is queued or running.
    fn refresh_gate(&mut self) -> bool {
        if !self.gate_open && self.critical_active == 0 && !self.has_queued(Lane::Critical) {
            self.gate_open = true;
            log::debug!("standard lane reopened");
            return true;
        }
        false
    }

    fn pop(&mut self, lane: Lane) -> Dispatch {
        let mut reaped = Vec::new();
        let mut work = None;
        let priorities: Vec<u32> = self
            .lane_buckets(lane)
            .map(|(priority, _)| *priority)
            .collect();
        'scan: for priority in priorities {
            let Some(bucket) = self.buckets.get_mut(&priority) else {
                continue;
            };
            while let Some(candidate) = bucket.pop_front() {
                if !candidate.task.claim() {
                    log::debug!("reaped unwanted task {}", candidate.task.uid());
                    reaped.push(candidate);
                    continue;
                }
                work = Some(candidate);
                break;
            }
            if bucket.is_empty() {
                self.buckets.remove(&priority);
            }
            if work.is_some() {
                break 'scan;
            }
        }
        if work.is_some() {
            match lane {
                Lane::Critical => self.critical_active += 1,
                Lane::Standard => self.standard_active = true,
            }
        }
        if !reaped.is_empty() {
            self.refresh_gate();
        }
        Dispatch { work, reaped }
    }
}

/// Priority buckets feeding the two execution lanes, plus the permits that
/// bound critical-lane parallelism.
pub(crate) struct Scheduler {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
    pub(crate) permits: Permits,
}

impl Scheduler {
    pub(crate) fn new(critical_limit: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buckets: BTreeMap::new(),
                critical_active: 0,
                standard_active: false,
                gate_open: true,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            permits: Permits::new(critical_limit),
        }
    }

    pub(crate) fn push(&self, work: QueuedWork, priority: u32) {
        {
            let mut state = lock_unpoisoned(&self.state);
            if Lane::for_priority(priority) == Lane::Critical && state.gate_open {
                state.gate_open = false;
                log::debug!("critical task {} closed the standard lane", work.task.uid());
            }
            state.buckets.entry(priority).or_default().push_back(work);
        }
        self.work_ready.notify_all();
    }

    /// Removes `task` from its bucket, falling back to a full scan when its
    /// priority moved since it was queued. Returns false when it is not queued.
    pub(crate) fn remove(&self, task: &Arc<RenderTask>) -> bool {
        let expected = task.priority();
        let mut state = lock_unpoisoned(&self.state);
        let mut found = take_from_bucket(&mut state.buckets, expected, task);
        if !found {
            let priorities: Vec<u32> = state.buckets.keys().copied().collect();
            for priority in priorities {
                if take_from_bucket(&mut state.buckets, priority, task) {
                    log::debug!("task {} found outside bucket {}", task.uid(), expected);
                    found = true;
                    break;
                }
            }
        }
        if !found {
            return false;
        }
        task.mark_idle();
        let reopened = state.refresh_gate();
        let idle = state.is_idle();
        drop(state);
        if reopened {
            self.work_ready.notify_all();
        }
        if idle {
            self.idle.notify_all();
        }
        true
    }

    pub(crate) fn try_next(&self, lane: Lane) -> Dispatch {
        let mut state = lock_unpoisoned(&self.state);
        if state.shutdown || !state.ready(lane) {
            return Dispatch {
                work: None,
                reaped: Vec::new(),
            };
        }
        let dispatch = state.pop(lane);
        self.after_pop(&state, &dispatch);
        dispatch
    }

    /// Blocks until `lane` has work or the scheduler shuts down.
    pub(crate) fn wait_next(&self, lane: Lane) -> Option<Dispatch> {
        let mut state = lock_unpoisoned(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            if state.ready(lane) {
                let dispatch = state.pop(lane);
                self.after_pop(&state, &dispatch);
                return Some(dispatch);
            }
            state = wait_unpoisoned(&self.work_ready, state);
        }
    }

    fn after_pop(&self, state: &QueueState, dispatch: &Dispatch) {
        if dispatch.reaped.is_empty() {
            return;
        }
        self.work_ready.notify_all();
        if state.is_idle() {
            self.idle.notify_all();
        }
    }

    /// Marks a stage run in `lane` as finished.
    pub(crate) fn finish(&self, lane: Lane) {
        let mut state = lock_unpoisoned(&self.state);
        match lane {
            Lane::Critical => state.critical_active = state.critical_active.saturating_sub(1),
            Lane::Standard => state.standard_active = false,
        }
        let reopened = state.refresh_gate();
        let idle = state.is_idle();
        drop(state);
        if reopened || lane == Lane::Standard {
            self.work_ready.notify_all();
        }
        if idle {
            self.idle.notify_all();
        }
    }

    pub(crate) fn clear(&self) -> Vec<QueuedWork> {
        let mut state = lock_unpoisoned(&self.state);
        let drained: Vec<QueuedWork> = std::mem::take(&mut state.buckets)
            .into_values()
            .flatten()
            .collect();
        for work in &drained {
            work.task.mark_idle();
        }
        state.refresh_gate();
        let idle = state.is_idle();
        drop(state);
        self.work_ready.notify_all();
        if idle {
            self.idle.notify_all();
        }
        drained
    }

    pub(crate) fn is_idle(&self) -> bool {
        lock_unpoisoned(&self.state).is_idle()
    }

    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock_unpoisoned(&self.state);
        loop {
            if state.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || state.shutdown {
                return false;
            }
            state = wait_timeout_unpoisoned(&self.idle, state, deadline - now);
        }
    }

    pub(crate) fn telemetry(&self) -> QueueTelemetry {
        let state = lock_unpoisoned(&self.state);
        QueueTelemetry {
            queued_critical: state.queued(Lane::Critical),
            queued_standard: state.queued(Lane::Standard),
            critical_active: state.critical_active,
            standard_active: state.standard_active,
            standard_gate_open: state.gate_open,
        }
    }

    pub(crate) fn shutdown(&self) {
        lock_unpoisoned(&self.state).shutdown = true;
        self.work_ready.notify_all();
        self.idle.notify_all();
        self.permits.shutdown();
    }
}

fn take_from_bucket(
    buckets: &mut BTreeMap<u32, VecDeque<QueuedWork>>,
    priority: u32,
    task: &Arc<RenderTask>,
) -> bool {
    let Some(bucket) = buckets.get_mut(&priority) else {
        return false;
    };
    let Some(position) = bucket
        .iter()
        .position(|work| Arc::ptr_eq(&work.task, task))
    else {
        return false;
    };
    bucket.remove(position);
    if bucket.is_empty() {
        buckets.remove(&priority);
    }
    true
}

struct PermitState {
    limit: usize,
    in_use: usize,
    shutdown: bool,
}

/// Counting semaphore whose limit can move at runtime. Lowering the limit
/// never revokes permits already handed out.
pub(crate) struct Permits {
    state: Mutex<PermitState>,
    released: Condvar,
}

pub(crate) struct Permit<'a> {
    permits: &'a Permits,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut state = lock_unpoisoned(&self.permits.state);
        state.in_use = state.in_use.saturating_sub(1);
        drop(state);
        self.permits.released.notify_one();
    }
}

impl Permits {
    fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(PermitState {
                limit: limit.max(1),
                in_use: 0,
                shutdown: false,
            }),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) -> Option<Permit<'_>> {
        let mut state = lock_unpoisoned(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            if state.in_use < state.limit {
                state.in_use += 1;
                return Some(Permit { permits: self });
            }
            state = wait_unpoisoned(&self.released, state);
        }
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        lock_unpoisoned(&self.state).limit = limit.max(1);
        self.released.notify_all();
    }

    pub(crate) fn limit(&self) -> usize {
        lock_unpoisoned(&self.state).limit
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        lock_unpoisoned(&self.state).in_use
    }

    fn shutdown(&self) {
        lock_unpoisoned(&self.state).shutdown = true;
        self.released.notify_all();
    }
}
