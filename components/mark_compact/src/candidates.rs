//! Evacuation candidate selection.
//!
//! A page qualifies when its free bytes exceed a target fragmentation of
//! its area. Qualifying pages are taken emptiest first until the live bytes
//! to move would exceed the evacuation budget. Selecting pages that would
//! not free at least one page overall is skipped, since compacting them
//! would just allocate as many pages as it releases.

use crate::config::{HeapConfig, MemoryMode, StartCompactionMode};
use crate::heap::Heap;
use crate::page::{EvacuationState, Page, PageFlags};
use crate::space::{Space, SpaceKind};
use std::sync::Arc;

const MB: usize = 1 << 20;

const TARGET_FRAGMENTATION_PERCENT_FOR_REDUCE_MEMORY: usize = 20;
const MAX_EVACUATED_BYTES_FOR_REDUCE_MEMORY: usize = 12 * MB;
const TARGET_FRAGMENTATION_PERCENT_FOR_OPTIMIZE_MEMORY: usize = 20;
const MAX_EVACUATED_BYTES_FOR_OPTIMIZE_MEMORY: usize = 6 * MB;
const TARGET_FRAGMENTATION_PERCENT: usize = 70;
const MAX_EVACUATED_BYTES: usize = 4 * MB;
/// Compaction time goal for one page area, used once speed samples exist.
const TARGET_MS_PER_AREA: f64 = 0.5;

/// Fragmentation threshold and evacuation budget for one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvacuationHeuristics {
    /// Minimum free percentage of a page's area
    pub target_fragmentation_percent: usize,
    /// Upper bound on the live bytes moved out of one space
    pub max_evacuated_bytes: usize,
}

impl EvacuationHeuristics {
    /// Derives the heuristics from the memory mode and, in regular mode, from
    /// the measured compaction speed.
    pub fn compute(memory_mode: MemoryMode, area_size: usize, compaction_speed: Option<f64>) -> Self {
        match memory_mode {
            MemoryMode::ReduceMemory => EvacuationHeuristics {
                target_fragmentation_percent: TARGET_FRAGMENTATION_PERCENT_FOR_REDUCE_MEMORY,
                max_evacuated_bytes: MAX_EVACUATED_BYTES_FOR_REDUCE_MEMORY,
            },
            MemoryMode::OptimizeMemory => EvacuationHeuristics {
                target_fragmentation_percent: TARGET_FRAGMENTATION_PERCENT_FOR_OPTIMIZE_MEMORY,
                max_evacuated_bytes: MAX_EVACUATED_BYTES_FOR_OPTIMIZE_MEMORY,
            },
            MemoryMode::Regular => {
                let target_fragmentation_percent = match compaction_speed.filter(|&s| s > 0.0) {
                    Some(speed) => {
                        let estimated_ms_per_area = 1.0 + area_size as f64 / speed;
                        let percent = 100.0 - 100.0 * TARGET_MS_PER_AREA / estimated_ms_per_area;
                        (percent as usize).max(TARGET_FRAGMENTATION_PERCENT_FOR_REDUCE_MEMORY)
                    }
                    None => TARGET_FRAGMENTATION_PERCENT,
                };
                EvacuationHeuristics {
                    target_fragmentation_percent,
                    max_evacuated_bytes: MAX_EVACUATED_BYTES,
                }
            }
        }
    }

    /// Free bytes a page needs to qualify.
    pub fn free_bytes_threshold(&self, area_size: usize) -> usize {
        self.target_fragmentation_percent * (area_size / 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionMode {
    Standard,
    Manual,
    Stress,
    EveryFullGc,
}

impl SelectionMode {
    fn from_config(config: &HeapConfig) -> Self {
        if config.manual_evacuation_candidates_selection {
            SelectionMode::Manual
        } else if config.stress_compaction {
            SelectionMode::Stress
        } else if config.compact_on_every_full_gc {
            SelectionMode::EveryFullGc
        } else {
            SelectionMode::Standard
        }
    }
}

fn add_evacuation_candidate(page: &Arc<Page>, candidates: &mut Vec<Arc<Page>>) {
    debug_assert!(!page.has_flag(PageFlags::NEVER_EVACUATE));
    log::trace!(
        "evacuation candidate {:?}: {} free bytes",
        page.start(),
        page.free_bytes()
    );
    page.set_flag(PageFlags::EVACUATION_CANDIDATE);
    page.set_evacuation_state(EvacuationState::Pending);
    candidates.push(Arc::clone(page));
}

/// Selects and flags the evacuation candidates of `space`.
pub fn collect_evacuation_candidates(
    space: &Space,
    config: &HeapConfig,
    compaction_speed: Option<f64>,
) -> Vec<Arc<Page>> {
    let area_size = space.area_size();
    let mode = SelectionMode::from_config(config);
    let heuristics = EvacuationHeuristics::compute(config.memory_mode, area_size, compaction_speed);
    let free_bytes_threshold = heuristics.free_bytes_threshold(area_size);

    let mut pages: Vec<(usize, Arc<Page>)> = space
        .pages()
        .into_iter()
        .filter(|p| !p.has_flag(PageFlags::NEVER_EVACUATE | PageFlags::PINNED))
        .filter(|p| p.can_allocate() && p.sweeping_done() && !p.is_large())
        .filter(|p| mode != SelectionMode::Standard || p.free_bytes() >= free_bytes_threshold)
        .map(|p| (p.allocated_bytes(), p))
        .collect();

    let mut candidates = Vec::new();
    let mut total_live_bytes = 0;
    match mode {
        SelectionMode::Manual => {
            for (live_bytes, page) in &pages {
                if page.has_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING) {
                    total_live_bytes += live_bytes;
                    page.clear_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
                    add_evacuation_candidate(page, &mut candidates);
                }
            }
        }
        SelectionMode::Stress => {
            for (live_bytes, page) in pages.iter().step_by(2) {
                total_live_bytes += live_bytes;
                add_evacuation_candidate(page, &mut candidates);
            }
        }
        SelectionMode::Standard | SelectionMode::EveryFullGc => {
            let ignore_budget = mode == SelectionMode::EveryFullGc;
            pages.sort_by_key(|(live_bytes, _)| *live_bytes);
            let mut candidate_count: usize = 0;
            for (live_bytes, _) in &pages {
                if ignore_budget || total_live_bytes + live_bytes <= heuristics.max_evacuated_bytes {
                    candidate_count += 1;
                    total_live_bytes += live_bytes;
                }
            }
            let estimated_new_pages = (total_live_bytes + area_size / 2) / area_size;
            let estimated_released_pages = candidate_count.saturating_sub(estimated_new_pages);
            if estimated_released_pages == 0 && !ignore_budget {
                candidate_count = 0;
                total_live_bytes = 0;
            }
            for (_, page) in pages.iter().take(candidate_count) {
                add_evacuation_candidate(page, &mut candidates);
            }
        }
    }

    log::debug!(
        "compaction selection: space={} mode={:?} fragmentation={}% pages={} live_bytes={}",
        space.kind().name(),
        mode,
        heuristics.target_fragmentation_percent,
        candidates.len(),
        total_live_bytes
    );
    candidates
}

/// Chooses the evacuation candidates of every compactable space of `heap`.
///
/// Returns no pages when compaction is disabled, or when an atomic pause
/// runs with a conservative stack and compaction with a stack is not
/// allowed. Code pages are skipped whenever a stack is present.
pub fn start_compaction(heap: &Heap, mode: StartCompactionMode) -> Vec<Arc<Page>> {
    let config = heap.config();
    let gc_with_stack = heap.roots().has_conservative_stack();
    if !config.compact || (mode == StartCompactionMode::Atomic && gc_with_stack && !config.compact_with_stack) {
        return Vec::new();
    }
    let compaction_speed = heap.tracer().lock().compaction_speed_in_bytes_per_ms();
    let mut spaces = vec![SpaceKind::Old];
    if heap.is_shared_owner() {
        spaces.push(SpaceKind::Shared);
    }
    if config.compact_code_space && !gc_with_stack {
        spaces.push(SpaceKind::Code);
    }
    spaces
        .into_iter()
        .filter_map(|kind| heap.space(kind))
        .flat_map(|space| collect_evacuation_candidates(space, config, compaction_speed))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{HeapId, PageTable, PAGE_AREA_SIZE};

    fn space() -> Space {
        Space::new(SpaceKind::Old, HeapId(1), PageTable::new(), 1024)
    }

    fn page_with_live_percent(space: &Space, percent: usize) -> Arc<Page> {
        let page = space.expand().unwrap();
        let bytes = PAGE_AREA_SIZE * percent / 100 / 8 * 8;
        if bytes > 0 {
            page.try_allocate(bytes).unwrap();
        }
        page
    }

    #[test]
    fn test_heuristics_per_memory_mode() {
        let reduce = EvacuationHeuristics::compute(MemoryMode::ReduceMemory, PAGE_AREA_SIZE, None);
        assert_eq!(reduce.target_fragmentation_percent, 20);
        assert_eq!(reduce.max_evacuated_bytes, 12 * MB);

        let optimize = EvacuationHeuristics::compute(MemoryMode::OptimizeMemory, PAGE_AREA_SIZE, None);
        assert_eq!(optimize.target_fragmentation_percent, 20);
        assert_eq!(optimize.max_evacuated_bytes, 6 * MB);

        let regular = EvacuationHeuristics::compute(MemoryMode::Regular, PAGE_AREA_SIZE, None);
        assert_eq!(regular.target_fragmentation_percent, 70);
        assert_eq!(regular.max_evacuated_bytes, 4 * MB);
    }

    #[test]
    fn test_heuristics_follow_compaction_speed() {
        let fast = EvacuationHeuristics::compute(MemoryMode::Regular, PAGE_AREA_SIZE, Some(1e12));
        assert_eq!(fast.target_fragmentation_percent, 50);
        let slow = EvacuationHeuristics::compute(MemoryMode::Regular, PAGE_AREA_SIZE, Some(1.0));
        assert!(slow.target_fragmentation_percent > 90);
    }

    #[test]
    fn test_sparse_page_is_selected() {
        let space = space();
        let sparse = page_with_live_percent(&space, 10);
        let full_a = page_with_live_percent(&space, 100);
        let full_b = page_with_live_percent(&space, 100);

        let candidates = collect_evacuation_candidates(&space, &HeapConfig::default(), None);
        assert_eq!(candidates.len(), 1);
        assert!(sparse.is_evacuation_candidate());
        assert_eq!(sparse.evacuation_state(), EvacuationState::Pending);
        assert!(!full_a.is_evacuation_candidate());
        assert!(!full_b.is_evacuation_candidate());
    }

    #[test]
    fn test_budget_is_respected() {
        let space = space();
        for _ in 0..100 {
            page_with_live_percent(&space, 25);
        }
        let candidates = collect_evacuation_candidates(&space, &HeapConfig::default(), None);
        let live: usize = candidates.iter().map(|p| p.allocated_bytes()).sum();
        assert!(!candidates.is_empty());
        assert!(candidates.len() < 100);
        assert!(live <= MAX_EVACUATED_BYTES);
    }

    #[test]
    fn test_every_full_gc_ignores_budget() {
        let space = space();
        for _ in 0..100 {
            page_with_live_percent(&space, 25);
        }
        let config = HeapConfig {
            compact_on_every_full_gc: true,
            ..HeapConfig::default()
        };
        assert_eq!(collect_evacuation_candidates(&space, &config, None).len(), 100);
    }

    #[test]
    fn test_selection_without_net_gain_is_dropped() {
        let space = space();
        let page = page_with_live_percent(&space, 75);
        let config = HeapConfig {
            memory_mode: MemoryMode::ReduceMemory,
            ..HeapConfig::default()
        };
        assert!(collect_evacuation_candidates(&space, &config, None).is_empty());
        assert!(!page.is_evacuation_candidate());
    }

    #[test]
    fn test_pinned_and_never_evacuate_pages_are_skipped() {
        let space = space();
        let pinned = page_with_live_percent(&space, 5);
        pinned.set_flag(PageFlags::PINNED);
        let never = page_with_live_percent(&space, 5);
        never.set_flag(PageFlags::NEVER_EVACUATE);
        let config = HeapConfig {
            stress_compaction: true,
            ..HeapConfig::default()
        };
        assert!(collect_evacuation_candidates(&space, &config, None).is_empty());
    }

    #[test]
    fn test_manual_selection_consumes_force_flag() {
        let space = space();
        let forced = page_with_live_percent(&space, 90);
        forced.set_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
        let other = page_with_live_percent(&space, 5);
        let config = HeapConfig {
            manual_evacuation_candidates_selection: true,
            ..HeapConfig::default()
        };
        let candidates = collect_evacuation_candidates(&space, &config, None);
        assert_eq!(candidates.len(), 1);
        assert!(forced.is_evacuation_candidate());
        assert!(!forced.has_flag(PageFlags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING));
        assert!(!other.is_evacuation_candidate());
    }

    #[test]
    fn test_stress_selects_every_second_page() {
        let space = space();
        let pages: Vec<_> = (0..5).map(|_| page_with_live_percent(&space, 50)).collect();
        let config = HeapConfig {
            stress_compaction: true,
            ..HeapConfig::default()
        };
        assert_eq!(collect_evacuation_candidates(&space, &config, None).len(), 3);
        assert!(pages[0].is_evacuation_candidate());
        assert!(!pages[1].is_evacuation_candidate());
    }

    #[test]
    fn test_atomic_pause_with_stack_does_not_compact() {
        let heap = Heap::new(HeapConfig::single_threaded());
        let sparse = heap.space(SpaceKind::Old).unwrap().expand().unwrap();
        sparse.try_allocate(64).unwrap();
        heap.roots().set_conservative_stack(vec![0x1234]);
        assert!(start_compaction(&heap, StartCompactionMode::Atomic).is_empty());
        assert_eq!(start_compaction(&heap, StartCompactionMode::Incremental).len(), 1);
    }
}
