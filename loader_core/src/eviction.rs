use crate::cache::IdentityTable;
use crate::content_id::ContentIdentity;

const FINAL_PASS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Quota {
    pub max_images: usize,
    pub max_bytes: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct EvictionReport {
    pub passes: usize,
    pub entries_removed: usize,
    pub renders_dropped: usize,
    pub bytes_freed: usize,
    pub tasks_forced_out: usize,
    /// Every pass ran and the byte quota still could not be met.
    pub stalled: bool,
}

impl IdentityTable {
    pub(crate) fn over_quota(&self, quota: Quota) -> bool {
        self.over_count(quota) || self.over_bytes(quota)
    }

    fn over_count(&self, quota: Quota) -> bool {
        self.entries.len() > quota.max_images
    }

    fn over_bytes(&self, quota: Quota) -> bool {
        self.cached_bytes > quota.max_bytes
    }

    /// Walks the recency order oldest first in escalating passes until both
    /// limits hold. Early passes only touch entries nobody wants in the older
    /// half of the order; later passes take wanted entries under byte pressure.
    pub(crate) fn evict_to_quota(&mut self, quota: Quota) -> EvictionReport {
        let mut report = EvictionReport::default();
        if !self.over_quota(quota) {
            return report;
        }
        for pass in 0..=FINAL_PASS {
            report.passes = pass + 1;
            let freed = self.eviction_pass(pass, quota, &mut report);
            if !self.over_quota(quota) || self.is_empty() {
                return report;
            }
            if pass == FINAL_PASS && freed == 0 && self.over_bytes(quota) {
                report.stalled = true;
            }
        }
        report
    }

    fn eviction_pass(&mut self, pass: usize, quota: Quota, report: &mut EvictionReport) -> usize {
        let mut freed = 0;
        let mut index = 0;
        let mut count = self.lru.len();
        while index < count {
            let identity = self.lru[index];
            let Some(entry) = self.entries.get(&identity) else {
                log::debug!("recency order held unknown identity {}", identity);
                self.lru.remove(index);
                count -= 1;
                continue;
            };
            let over_count = self.over_count(quota);
            let over_bytes = self.over_bytes(quota);
            let not_needed = entry.no_longer_needed();
            let older_half = index < count / 2;
            let several = entry.resolutions() > 1;
            // Byte pressure only justifies taking entries that hold bytes.
            let pressured = not_needed || (over_bytes && entry.resolutions() > 0);
            let eligible = (over_count && not_needed)
                || match pass {
                    0 | 2 | 4 => not_needed && several && older_half,
                    1 | 3 | 5 => not_needed && older_half,
                    6 => pressured && several && older_half,
                    7 => pressured && older_half,
                    _ => pressured,
                };
            if !eligible {
                index += 1;
                continue;
            }
            let (bytes, removed) = self.evict_entry(&identity, quota, not_needed, report);
            freed += bytes;
            if removed {
                self.lru.remove(index);
                count -= 1;
            } else {
                index += 1;
            }
            if !self.over_quota(quota) {
                break;
            }
        }
        freed
    }

    /// Drops renders from the highest resolution down until the entry is empty
    /// or the quota holds, then detaches its task. Returns bytes freed and
    /// whether the entry left the table.
    fn evict_entry(
        &mut self,
        identity: &ContentIdentity,
        quota: Quota,
        not_needed: bool,
        report: &mut EvictionReport,
    ) -> (usize, bool) {
        let entry_count = self.entries.len();
        let Some(entry) = self.entries.get_mut(identity) else {
            return (0, false);
        };
        let mut freed = 0;
        while let Some((_, bitmap)) = entry.renders.pop_last() {
            let bytes = bitmap.estimated_bytes();
            self.cached_bytes = self.cached_bytes.saturating_sub(bytes);
            freed += bytes;
            report.renders_dropped += 1;
            if entry_count <= quota.max_images && self.cached_bytes <= quota.max_bytes {
                break;
            }
        }
        report.bytes_freed += freed;
        if let Some(task) = entry.task.take() {
            if entry.renders.is_empty() && !not_needed {
                task.mark_forced_out();
                report.tasks_forced_out += 1;
                log::debug!("task {} forced out of {}", task.uid(), identity);
            }
            task.drop_current();
        }
        if entry.renders.is_empty() {
            self.entries.remove(identity);
            report.entries_removed += 1;
            (freed, true)
        } else {
            (freed, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::render::{Bitmap, Priority};
    use crate::task::RenderTask;
    use std::sync::Arc;

    fn identity(seed: u32) -> ContentIdentity {
        ContentIdentity::of(&seed.to_le_bytes())
    }

    fn render(height: u32) -> Arc<Bitmap> {
        Arc::new(Bitmap::new(16, height, Vec::new()))
    }

    fn task() -> Arc<RenderTask> {
        Arc::new(RenderTask::new(1, Arc::from(&b"x"[..]), Priority::Medium))
    }

    fn filled(count: u32, heights: &[u32]) -> IdentityTable {
        let mut table = IdentityTable::default();
        for seed in 0..count {
            let id = identity(seed);
            table.insert(id, CacheEntry::default());
            for height in heights {
                table.store_render(&id, render(*height));
            }
        }
        table
    }

    #[test]
    fn count_pressure_removes_oldest_unwanted_entries() {
        let mut table = filled(9, &[10]);
        let report = table.evict_to_quota(Quota {
            max_images: 6,
            max_bytes: usize::MAX,
        });
        assert_eq!(table.len(), 6);
        assert_eq!(report.entries_removed, 3);
        for seed in 0..3 {
            assert!(table.get(&identity(seed)).is_none());
        }
        for seed in 3..9 {
            assert!(table.get(&identity(seed)).is_some());
        }
        assert_eq!(table.lru.len(), 6);
    }

    #[test]
    fn count_pressure_spares_wanted_entries() {
        let mut table = IdentityTable::default();
        for seed in 0..4 {
            table.insert(identity(seed), CacheEntry::with_task(task()));
        }
        let report = table.evict_to_quota(Quota {
            max_images: 2,
            max_bytes: usize::MAX,
        });
        assert_eq!(table.len(), 4);
        assert!(!report.stalled);
        assert_eq!(report.passes, FINAL_PASS + 1);
    }

    #[test]
    fn byte_pressure_trims_highest_resolutions_first() {
        let mut table = filled(4, &[10, 100]);
        // 4 entries * (640 + 6400) bytes; drop enough for one large render.
        let quota = Quota {
            max_images: 10,
            max_bytes: 4 * 7040 - 6400,
        };
        let report = table.evict_to_quota(quota);
        assert_eq!(report.passes, 1);
        assert_eq!(report.renders_dropped, 1);
        let oldest = table.get(&identity(0)).unwrap();
        assert_eq!(oldest.resolutions(), 1);
        assert_eq!(oldest.best_render().unwrap().height(), 10);
        assert_eq!(table.cached_bytes(), quota.max_bytes);
    }

    #[test]
    fn byte_pressure_eventually_forces_out_wanted_tasks() {
        let mut table = IdentityTable::default();
        let wanted = task();
        let id = identity(1);
        table.insert(id, CacheEntry::with_task(Arc::clone(&wanted)));
        table.store_render(&id, render(100));
        let report = table.evict_to_quota(Quota {
            max_images: 10,
            max_bytes: 10,
        });
        assert!(table.is_empty());
        assert!(wanted.is_forced_out());
        assert_eq!(report.tasks_forced_out, 1);
        assert_eq!(report.passes, FINAL_PASS + 1);
        assert!(!report.stalled);
    }

    #[test]
    fn stale_recency_entries_are_healed() {
        let mut table = filled(3, &[10]);
        table.lru.push_front(identity(99));
        table.evict_to_quota(Quota {
            max_images: 2,
            max_bytes: usize::MAX,
        });
        assert_eq!(table.len(), 2);
        assert_eq!(table.lru.len(), 2);
        assert!(!table.lru.contains(&identity(99)));
    }
}
