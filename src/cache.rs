//! Per-thread allocation cache.
//!
//! One LIFO free list per size class, exclusively owned by one thread — no
//! locks on the hot path. Empty lists refill from the back end a run at a
//! time; a list that reaches twice its class budget drains its hottest half
//! back. Cross-thread access is limited to draining a cache whose owner is
//! known-quiescent (thread exit), which is an ownership question, not a
//! locking one: the cache moves, it is never shared.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::free_list::FreeList;
use crate::primary::SizeClassAllocator;
use crate::size_class::SizeClassMap;

pub struct AllocatorCache<M: SizeClassMap> {
    free_lists: Vec<FreeList>,
    _schedule: PhantomData<M>,
}

// Safety: the cached blocks are owned by the cache and move with it; a
// cache is only ever used from one thread at a time.
unsafe impl<M: SizeClassMap> Send for AllocatorCache<M> {}

impl<M: SizeClassMap> AllocatorCache<M> {
    /// A fresh cache: every class list empty. Equivalent to the
    /// zero-initialized state, so caches need no per-thread setup beyond
    /// construction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            free_lists: (0..M::NUM_CLASSES).map(|_| FreeList::new()).collect(),
            _schedule: PhantomData,
        }
    }

    /// Pop a block of `class`, refilling from the back end if the class
    /// list is empty. Panics if a refill yields nothing (the back end
    /// aborts first in every reachable case).
    pub fn allocate(&mut self, primary: &SizeClassAllocator<M>, class: usize) -> NonNull<u8> {
        assert!(class < M::NUM_CLASSES, "class {class} out of range");
        let list = &mut self.free_lists[class];
        if list.is_empty() {
            primary.bulk_allocate(class, list);
        }
        match list.pop_front() {
            Some(p) => p,
            None => panic!("refill of class {class} produced no blocks"),
        }
    }

    /// Push a freed block of `class`. When the list reaches twice the
    /// class budget, the hottest half is drained back to the back end, so
    /// the list length stays below `2 * max_cached(class)` at every
    /// observation point.
    pub fn deallocate(
        &mut self,
        primary: &SizeClassAllocator<M>,
        class: usize,
        p: NonNull<u8>,
    ) {
        assert!(class < M::NUM_CLASSES, "class {class} out of range");
        let list = &mut self.free_lists[class];
        list.push_front(p);
        if list.len() >= 2 * M::max_cached(class) {
            let count = list.len() / 2;
            let mut half = FreeList::new();
            half.splice_front_n(list, count);
            primary.bulk_deallocate(class, &mut half);
            debug_assert!(half.is_empty());
        }
    }

    /// Return every cached block to the back end. Used on thread exit and
    /// by the facade's cache-swallowing path; all lists are empty
    /// afterwards.
    pub fn drain(&mut self, primary: &SizeClassAllocator<M>) {
        for (class, list) in self.free_lists.iter_mut().enumerate() {
            if !list.is_empty() {
                primary.bulk_deallocate(class, list);
            }
            debug_assert!(list.is_empty());
        }
    }

    /// Blocks currently cached for `class`.
    #[must_use]
    pub fn cached_blocks(&self, class: usize) -> usize {
        self.free_lists[class].len()
    }
}

impl<M: SizeClassMap> Default for AllocatorCache<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::primary::PrimaryConfig;
    use crate::size_class::CompactSizeClassMap;

    type Map = CompactSizeClassMap;

    fn small_primary() -> SizeClassAllocator<Map> {
        SizeClassAllocator::with_config(PrimaryConfig {
            region_size: 1 << 20,
        })
        .unwrap()
    }

    #[test]
    fn test_allocate_refills_and_pops() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let primary = small_primary();
        let mut cache = AllocatorCache::<Map>::new();
        let class = Map::class_of(64);
        let budget = Map::max_cached(class);

        let p = cache.allocate(&primary, class);
        // The refill brought a run and one block was popped off it.
        let left = cache.cached_blocks(class);
        assert!(left <= budget - 1);

        let q = cache.allocate(&primary, class);
        assert_ne!(p, q, "two live blocks share an address");

        cache.deallocate(&primary, class, p);
        cache.deallocate(&primary, class, q);
        cache.drain(&primary);
    }

    #[test]
    fn test_cache_is_lifo() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let primary = small_primary();
        let mut cache = AllocatorCache::<Map>::new();
        let class = Map::class_of(128);

        let p = cache.allocate(&primary, class);
        cache.deallocate(&primary, class, p);
        let q = cache.allocate(&primary, class);
        assert_eq!(p, q, "freshly freed block was not reused first");
        cache.deallocate(&primary, class, q);
        cache.drain(&primary);
    }

    #[test]
    fn test_half_drain_at_twice_budget() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let primary = small_primary();
        let mut cache = AllocatorCache::<Map>::new();
        let class = 0;
        let budget = Map::max_cached(class);

        // Gather 2*budget live blocks (several refills), then free them
        // one by one watching the bound.
        let mut live = Vec::new();
        for _ in 0..2 * budget {
            live.push(cache.allocate(&primary, class));
        }
        // Make the cache list exactly empty before the controlled frees.
        cache.drain(&primary);

        for (i, p) in live.drain(..).enumerate() {
            cache.deallocate(&primary, class, p);
            let len = cache.cached_blocks(class);
            assert!(
                len < 2 * budget,
                "cache bound violated after {} frees: {len}",
                i + 1
            );
        }
        // 2*budget frees: the bound tripped exactly once, leaving half.
        assert_eq!(cache.cached_blocks(class), budget);
        cache.drain(&primary);
    }

    #[test]
    fn test_drain_empties_every_class() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let primary = small_primary();
        let mut cache = AllocatorCache::<Map>::new();

        let mut live = Vec::new();
        for size in [8, 16, 64, 256, 4096, 32768] {
            let class = Map::class_of(size);
            live.push((class, cache.allocate(&primary, class)));
        }
        for (class, p) in live {
            cache.deallocate(&primary, class, p);
        }
        cache.drain(&primary);
        for class in 0..Map::NUM_CLASSES {
            assert_eq!(cache.cached_blocks(class), 0);
        }
    }

    #[test]
    fn test_smallest_budget_class_still_bounded() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let primary = small_primary();
        let mut cache = AllocatorCache::<Map>::new();
        // The largest class has a budget of one: every second free drains.
        let class = Map::class_of(Map::MAX_SIZE);
        assert_eq!(Map::max_cached(class), 1);

        let a = cache.allocate(&primary, class);
        let b = cache.allocate(&primary, class);
        cache.deallocate(&primary, class, a);
        assert_eq!(cache.cached_blocks(class), 1);
        cache.deallocate(&primary, class, b);
        // Hit 2 * budget → drained half.
        assert_eq!(cache.cached_blocks(class), 1);
        cache.drain(&primary);
    }

    #[test]
    fn test_caches_move_between_threads() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let primary = crate::sync::Arc::new(small_primary());
        let class = Map::class_of(64);

        let p1 = primary.clone();
        let mut cache = crate::sync::thread::spawn(move || {
            let mut cache = AllocatorCache::<Map>::new();
            let p = cache.allocate(&p1, class);
            cache.deallocate(&p1, class, p);
            cache
        })
        .join()
        .unwrap();

        // The exiting thread's cache is swallowed by another thread.
        assert!(cache.cached_blocks(class) >= 1);
        cache.drain(&primary);
        assert_eq!(cache.cached_blocks(class), 0);
    }
}
