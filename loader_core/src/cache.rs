use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::content_id::ContentIdentity;
use crate::render::Bitmap;
use crate::task::RenderTask;

/// Live task plus every render kept for one identity, keyed by render height.
#[derive(Default)]
pub(crate) struct CacheEntry {
    pub(crate) task: Option<Arc<RenderTask>>,
    pub(crate) renders: BTreeMap<u32, Arc<Bitmap>>,
}

impl CacheEntry {
    pub(crate) fn with_task(task: Arc<RenderTask>) -> Self {
        Self {
            task: Some(task),
            renders: BTreeMap::new(),
        }
    }

    pub(crate) fn task(&self) -> Option<&Arc<RenderTask>> {
        self.task.as_ref()
    }

    pub(crate) fn holds(&self, task: &Arc<RenderTask>) -> bool {
        self.task
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, task))
    }

    pub(crate) fn best_render(&self) -> Option<&Arc<Bitmap>> {
        self.renders.last_key_value().map(|(_, bitmap)| bitmap)
    }

    pub(crate) fn resolutions(&self) -> usize {
        self.renders.len()
    }

    pub(crate) fn estimated_bytes(&self) -> usize {
        self.renders
            .values()
            .map(|bitmap| bitmap.estimated_bytes())
            .sum()
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.task.is_none() && self.renders.is_empty()
    }

    /// No live task, or the live task lost all interest.
    pub(crate) fn no_longer_needed(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_cancelled())
    }
}

/// Identity table, recency order and byte accounting. Guarded as one unit by
/// the engine.
#[derive(Default)]
pub(crate) struct IdentityTable {
    pub(crate) entries: HashMap<ContentIdentity, CacheEntry>,
    pub(crate) lru: VecDeque<ContentIdentity>,
    pub(crate) cached_bytes: usize,
}

impl IdentityTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    pub(crate) fn get(&self, identity: &ContentIdentity) -> Option<&CacheEntry> {
        self.entries.get(identity)
    }

    pub(crate) fn insert(&mut self, identity: ContentIdentity, entry: CacheEntry) {
        let bytes = entry.estimated_bytes();
        if let Some(previous) = self.entries.insert(identity, entry) {
            self.cached_bytes = self.cached_bytes.saturating_sub(previous.estimated_bytes());
        }
        self.cached_bytes += bytes;
        self.touch(&identity);
    }

    pub(crate) fn remove(&mut self, identity: &ContentIdentity) -> Option<CacheEntry> {
        let entry = self.entries.remove(identity)?;
        self.cached_bytes = self.cached_bytes.saturating_sub(entry.estimated_bytes());
        self.forget_recency(identity);
        Some(entry)
    }

    /// Moves `identity` to the most-recent end. Unknown identities are left out
    /// of the order.
    pub(crate) fn touch(&mut self, identity: &ContentIdentity) {
        self.forget_recency(identity);
        if self.entries.contains_key(identity) {
            self.lru.push_back(*identity);
        }
    }

    fn forget_recency(&mut self, identity: &ContentIdentity) {
        if let Some(position) = self.lru.iter().position(|known| known == identity) {
            self.lru.remove(position);
        }
    }

    /// Stores `bitmap` under its height. Returns false when the entry is gone.
    pub(crate) fn store_render(&mut self, identity: &ContentIdentity, bitmap: Arc<Bitmap>) -> bool {
        let Some(entry) = self.entries.get_mut(identity) else {
            return false;
        };
        let added = bitmap.estimated_bytes();
        if let Some(replaced) = entry.renders.insert(bitmap.height(), bitmap) {
            self.cached_bytes = self.cached_bytes.saturating_sub(replaced.estimated_bytes());
        }
        self.cached_bytes += added;
        true
    }

    /// Drops the entry's task when it is still `task`; removes the entry if
    /// that leaves it dead. Returns whether the task was attached.
    pub(crate) fn detach_task(&mut self, identity: &ContentIdentity, task: &Arc<RenderTask>) -> bool {
        let Some(entry) = self.entries.get_mut(identity) else {
            return false;
        };
        if !entry.holds(task) {
            return false;
        }
        entry.task = None;
        if entry.is_dead() {
            self.remove(identity);
        }
        true
    }

    pub(crate) fn is_attached(&self, identity: &ContentIdentity, task: &Arc<RenderTask>) -> bool {
        self.entries
            .get(identity)
            .is_some_and(|entry| entry.holds(task))
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
        self.cached_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::Priority;

    fn identity(seed: u8) -> ContentIdentity {
        ContentIdentity::of(&[seed, seed.wrapping_add(1), seed.wrapping_add(2)])
    }

    fn render(width: u32, height: u32) -> Arc<Bitmap> {
        Arc::new(Bitmap::new(width, height, Vec::new()))
    }

    fn task() -> Arc<RenderTask> {
        Arc::new(RenderTask::new(1, Arc::from(&b"x"[..]), Priority::Medium))
    }

    #[test]
    fn byte_accounting_follows_renders() {
        let mut table = IdentityTable::default();
        let id = identity(1);
        table.insert(id, CacheEntry::default());
        assert!(table.store_render(&id, render(16, 10)));
        assert!(table.store_render(&id, render(32, 20)));
        assert_eq!(table.cached_bytes(), 64 * 10 + 128 * 20);
        // Same height replaces the previous render.
        assert!(table.store_render(&id, render(17, 10)));
        assert_eq!(table.cached_bytes(), 128 * 10 + 128 * 20);
        assert_eq!(table.get(&id).unwrap().best_render().unwrap().height(), 20);
        table.remove(&id);
        assert_eq!(table.cached_bytes(), 0);
        assert!(!table.store_render(&id, render(1, 1)));
    }

    #[test]
    fn touch_moves_identity_to_tail() {
        let mut table = IdentityTable::default();
        for seed in 1..=3 {
            table.insert(identity(seed), CacheEntry::default());
        }
        table.touch(&identity(1));
        assert_eq!(
            table.lru.iter().copied().collect::<Vec<_>>(),
            vec![identity(2), identity(3), identity(1)]
        );
        table.touch(&identity(9));
        assert_eq!(table.lru.len(), 3);
    }

    #[test]
    fn detaching_last_task_removes_dead_entry() {
        let mut table = IdentityTable::default();
        let id = identity(4);
        let live = task();
        let other = task();
        table.insert(id, CacheEntry::with_task(Arc::clone(&live)));
        assert!(!table.detach_task(&id, &other));
        assert!(table.is_attached(&id, &live));
        assert!(table.detach_task(&id, &live));
        assert!(table.get(&id).is_none());
        assert!(table.lru.is_empty());
    }

    #[test]
    fn detaching_keeps_entry_with_renders() {
        let mut table = IdentityTable::default();
        let id = identity(5);
        let live = task();
        table.insert(id, CacheEntry::with_task(Arc::clone(&live)));
        table.store_render(&id, render(8, 8));
        assert!(table.detach_task(&id, &live));
        let entry = table.get(&id).unwrap();
        assert!(entry.task().is_none());
        assert!(entry.no_longer_needed());
        assert_eq!(entry.resolutions(), 1);
    }
}
