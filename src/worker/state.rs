//! Worker bookkeeping: live segments per index, the preload window, and
//! distance-based eviction.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, trace};

use crate::segment::{OwnedSegment, Release};

// ---------------------------------------------------------------------------
// PreloadWindow
// ---------------------------------------------------------------------------

/// Indices to materialize around a centre, nearest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadWindow {
    center: usize,
    pending: VecDeque<usize>,
}

impl PreloadWindow {
    /// Build the window for `center`.
    ///
    /// Order: `c+1, c-1, c+2, c-2, …` up to `radius`, wrapping modulo `count`
    /// (the carousel wraps), without duplicates. The centre itself is only
    /// included when `include_center` is set.
    pub fn around(center: usize, radius: usize, count: usize, include_center: bool) -> Self {
        let mut pending = VecDeque::new();
        if count == 0 {
            return Self { center, pending };
        }
        let center = center % count;
        if include_center {
            pending.push_back(center);
        }
        for d in 1..=radius.min(count) {
            let forward = (center + d) % count;
            let backward = (center + count - d % count) % count;
            for idx in [forward, backward] {
                if idx != center && !pending.contains(&idx) {
                    pending.push_back(idx);
                }
            }
        }
        Self { center, pending }
    }

    pub fn center(&self) -> usize {
        self.center
    }

    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending.iter().copied()
    }

    fn pop(&mut self) -> Option<usize> {
        self.pending.pop_front()
    }

    fn is_exhausted(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Shortest distance between two positions on a ring of `count` entries.
pub fn circular_distance(a: usize, b: usize, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let d = a.abs_diff(b) % count;
    d.min(count - d)
}

/// Order cached indices for eviction: farthest from `pivot` first, ties broken
/// by evicting the lower index first.
pub fn eviction_order(cached: impl IntoIterator<Item = usize>, pivot: usize) -> Vec<usize> {
    let mut order: Vec<usize> = cached.into_iter().collect();
    order.sort_by_key(|&i| (Reverse(i.abs_diff(pivot)), i));
    order
}

// ---------------------------------------------------------------------------
// CacheState
// ---------------------------------------------------------------------------

/// A live segment and whether its name has been sent to the manager.
struct Entry {
    seg: OwnedSegment,
    announced: bool,
}

fn announce_entry(entry: Option<&mut Entry>) -> Option<&OwnedSegment> {
    let entry = entry?;
    if entry.announced || entry.seg.is_claimed() {
        return None;
    }
    entry.announced = true;
    Some(&entry.seg)
}

/// Everything the worker owns. Created once per worker and threaded through
/// every operation.
#[derive(Default)]
pub(crate) struct CacheState {
    entries: BTreeMap<usize, Entry>,
    logo: Option<Entry>,
    /// Most recent explicitly requested index.
    pivot: Option<usize>,
    window: Option<PreloadWindow>,
}

impl CacheState {
    pub(crate) fn pivot(&self) -> Option<usize> {
        self.pivot
    }

    pub(crate) fn set_pivot(&mut self, index: usize) {
        self.pivot = Some(index);
    }

    /// Hand out the preloaded segment for `index` if it was never announced.
    ///
    /// A name goes to the manager at most once. A repeated request gets a
    /// fresh segment (see [`insert`](Self::insert)), so the stale `Ready`
    /// still in flight fails to open instead of shadowing the new one.
    pub(crate) fn announce(&mut self, index: usize) -> Option<&OwnedSegment> {
        announce_entry(self.entries.get_mut(&index))
    }

    pub(crate) fn announce_logo(&mut self) -> Option<&OwnedSegment> {
        announce_entry(self.logo.as_mut())
    }

    /// Record a segment for `index`. A previous segment for the same index is
    /// released, so there is never more than one per index.
    pub(crate) fn insert(&mut self, index: usize, seg: OwnedSegment, announced: bool) -> &OwnedSegment {
        if let Some(old) = self.entries.remove(&index) {
            trace!("cache: replacing segment {} for index {index}", old.seg.name());
            old.seg.release();
        }
        &self.entries.entry(index).or_insert(Entry { seg, announced }).seg
    }

    /// Record a freshly announced logo segment, releasing the previous one.
    pub(crate) fn set_logo(&mut self, seg: OwnedSegment) -> &OwnedSegment {
        if let Some(old) = self.logo.take() {
            old.seg.release();
        }
        &self.logo.insert(Entry { seg, announced: true }).seg
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.entries.len()
    }

    /// Cached indices in ascending order.
    pub(crate) fn cached_indices(&self) -> Vec<usize> {
        self.entries.keys().copied().collect()
    }

    /// Unclaimed indexed segments.
    pub(crate) fn live_count(&self) -> usize {
        self.entries.values().filter(|e| !e.seg.is_claimed()).count()
    }

    /// Replace the preload window if the pivot moved materially: no window
    /// yet, or the pivot is more than half a radius away from its centre.
    pub(crate) fn maybe_recenter(&mut self, index: usize, radius: usize, count: usize) -> bool {
        let stale = match &self.window {
            None => true,
            Some(w) => circular_distance(w.center(), index, count) > radius / 2,
        };
        if stale {
            self.recenter(index, radius, count, false);
        }
        stale
    }

    pub(crate) fn recenter(&mut self, index: usize, radius: usize, count: usize, include_center: bool) {
        let window = PreloadWindow::around(index, radius, count, include_center);
        debug!(
            "cache: preload window around {index}: {:?}",
            window.pending().collect::<Vec<_>>()
        );
        self.window = Some(window);
    }

    #[cfg(test)]
    pub(crate) fn window(&self) -> Option<&PreloadWindow> {
        self.window.as_ref()
    }

    /// Next window index that still needs materializing.
    ///
    /// The window wraps but eviction does not, so near the ends of the list
    /// some window indices would be evicted right after being decoded. Only
    /// indices among the `max_cache` nearest to the pivot (counting cached
    /// entries and the rest of the window) are handed out.
    pub(crate) fn next_pending(&mut self, count: usize, max_cache: usize) -> Option<usize> {
        let window = self.window.as_ref()?;
        let pivot = self.pivot.unwrap_or(window.center());
        let candidates: BTreeSet<usize> = self
            .entries
            .keys()
            .copied()
            .chain(window.pending().filter(|&i| i < count))
            .chain([pivot])
            .collect();
        let order = eviction_order(candidates, pivot);
        let keep: BTreeSet<usize> = order[order.len().saturating_sub(max_cache)..]
            .iter()
            .copied()
            .collect();

        let window = self.window.as_mut()?;
        while let Some(idx) = window.pop() {
            if idx >= count || self.entries.contains_key(&idx) {
                continue;
            }
            if !keep.contains(&idx) {
                trace!("cache: skipping preload of {idx}, outside the {max_cache} nearest to {pivot}");
                continue;
            }
            return Some(idx);
        }
        None
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.window.as_ref().is_some_and(|w| !w.is_exhausted())
    }

    /// Forget segments the manager has claimed; it unlinks them itself.
    pub(crate) fn reap_claimed(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|idx, e| {
            let keep = !e.seg.is_claimed();
            if !keep {
                trace!("cache: index {idx} consumed by manager ({})", e.seg.name());
            }
            keep
        });
        if self.logo.as_ref().is_some_and(|e| e.seg.is_claimed()) {
            self.logo = None;
        }
        before - self.entries.len()
    }

    /// Evict farthest-from-pivot entries until at most `max_cache` remain.
    /// Returns the evicted indices in eviction order.
    pub(crate) fn evict(&mut self, max_cache: usize) -> Vec<usize> {
        let excess = self.entries.len().saturating_sub(max_cache);
        if excess == 0 {
            return Vec::new();
        }
        let pivot = self.pivot.unwrap_or(0);
        let victims: Vec<usize> = eviction_order(self.entries.keys().copied(), pivot)
            .into_iter()
            .filter(|&i| i != pivot)
            .take(excess)
            .collect();
        for idx in &victims {
            if let Some(Entry { seg, .. }) = self.entries.remove(idx) {
                let name = seg.name().to_string();
                match seg.release() {
                    Release::Unlinked => trace!("cache: evicted index {idx} ({name})"),
                    Release::ClaimedElsewhere => {
                        trace!("cache: index {idx} ({name}) already consumed, dropped")
                    }
                }
            }
        }
        debug!("cache: evicted {victims:?} (pivot={pivot}, max={max_cache})");
        victims
    }

    /// Release every segment, logo included. Returns how many were unlinked
    /// by the worker.
    pub(crate) fn release_all(&mut self) -> usize {
        let segments = std::mem::take(&mut self.entries)
            .into_values()
            .chain(self.logo.take());
        let unlinked = segments
            .map(|e| e.seg.release())
            .filter(|r| *r == Release::Unlinked)
            .count();
        self.window = None;
        unlinked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_nearest_first_forward_before_backward() {
        let w = PreloadWindow::around(10, 3, 100, false);
        assert_eq!(w.pending().collect::<Vec<_>>(), vec![11, 9, 12, 8, 13, 7]);
    }

    #[test]
    fn window_wraps_around_ends() {
        let w = PreloadWindow::around(0, 2, 10, false);
        assert_eq!(w.pending().collect::<Vec<_>>(), vec![1, 9, 2, 8]);
        let w = PreloadWindow::around(9, 2, 10, true);
        assert_eq!(w.pending().collect::<Vec<_>>(), vec![9, 0, 8, 1, 7]);
    }

    #[test]
    fn window_small_list_has_no_duplicates() {
        let w = PreloadWindow::around(1, 5, 3, true);
        assert_eq!(w.pending().collect::<Vec<_>>(), vec![1, 2, 0]);
        let w = PreloadWindow::around(0, 4, 1, false);
        assert_eq!(w.pending().count(), 0);
    }

    #[test]
    fn window_empty_list() {
        let w = PreloadWindow::around(0, 4, 0, true);
        assert_eq!(w.pending().count(), 0);
    }

    #[test]
    fn circular_distance_wraps() {
        assert_eq!(circular_distance(0, 9, 10), 1);
        assert_eq!(circular_distance(2, 7, 10), 5);
        assert_eq!(circular_distance(3, 3, 10), 0);
        assert_eq!(circular_distance(1, 2, 0), 0);
    }

    #[test]
    fn eviction_order_farthest_first() {
        assert_eq!(eviction_order([0, 1, 2, 3, 4], 0), vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn eviction_ties_evict_lower_index_first() {
        // 3 and 7 are both 2 away from 5; 4 and 6 both 1 away.
        assert_eq!(eviction_order([3, 4, 5, 6, 7], 5), vec![3, 7, 4, 6, 5]);
    }

    #[test]
    fn eviction_distance_is_absolute_not_circular() {
        // On a ring of 10, index 9 is adjacent to 0, but eviction ignores wrap.
        assert_eq!(eviction_order([1, 9], 0), vec![9, 1]);
    }

    #[test]
    fn recenter_only_on_material_move() {
        let mut state = CacheState::default();
        assert!(state.maybe_recenter(10, 4, 100));
        assert!(!state.maybe_recenter(12, 4, 100));
        assert_eq!(state.window().unwrap().center(), 10);
        assert!(state.maybe_recenter(13, 4, 100));
        assert_eq!(state.window().unwrap().center(), 13);
    }
}
