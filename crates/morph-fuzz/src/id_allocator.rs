//! Fresh id allocation and overflow id sources.
//!
//! Fresh ids are handed out while records are being built. Overflow ids are
//! drawn during `apply` by transformations that only learn how many ids they
//! need once they inspect the instructions they touch.

use morph_ir::Id;

/// Hands out ids in `[next, limit)`. The limit is where the overflow range
/// begins, so the two never collide.
#[derive(Debug, Clone)]
pub struct FreshIdAllocator {
    next: u32,
    limit: u32,
}

impl FreshIdAllocator {
    pub fn new(first: u32, limit: u32) -> Self {
        assert!(first > 0, "id 0 is reserved");
        Self { next: first, limit }
    }

    pub fn fresh_id(&mut self) -> Id {
        assert!(
            self.next < self.limit,
            "fresh ids exhausted: the overflow range starts at {}",
            self.limit
        );
        let id = Id(self.next);
        self.next += 1;
        id
    }

    pub fn fresh_ids(&mut self, count: usize) -> Vec<Id> {
        (0..count).map(|_| self.fresh_id()).collect()
    }

    /// The id the next call to `fresh_id` returns
    pub fn peek(&self) -> u32 {
        self.next
    }
}

/// A reservoir of ids for use during `apply`
pub trait OverflowIdSource {
    fn has_overflow_ids(&self) -> bool;

    /// Take the next overflow id. Panics if the source is exhausted; callers
    /// check `num_available` in `is_applicable` first.
    fn get_next_overflow_id(&mut self) -> Id;

    /// How many ids can still be drawn; `None` if unbounded
    fn num_available(&self) -> Option<usize>;

    /// Every id handed out so far
    fn issued_overflow_ids(&self) -> &[Id];
}

/// Unbounded overflow ids counting up from a fixed first id, used by the
/// fuzzer and the replayer so both issue the same ids in the same order
#[derive(Debug, Clone)]
pub struct CounterOverflowIdSource {
    next: u32,
    issued: Vec<Id>,
}

impl CounterOverflowIdSource {
    pub fn new(first_overflow_id: u32) -> Self {
        Self {
            next: first_overflow_id,
            issued: Vec::new(),
        }
    }
}

impl OverflowIdSource for CounterOverflowIdSource {
    fn has_overflow_ids(&self) -> bool {
        true
    }

    fn get_next_overflow_id(&mut self) -> Id {
        let id = Id(self.next);
        self.next = self
            .next
            .checked_add(1)
            .expect("overflow id counter wrapped");
        self.issued.push(id);
        id
    }

    fn num_available(&self) -> Option<usize> {
        None
    }

    fn issued_overflow_ids(&self) -> &[Id] {
        &self.issued
    }
}

/// A finite, explicitly listed pool
#[derive(Debug, Clone, Default)]
pub struct OverflowIdPool {
    remaining: Vec<Id>,
    issued: Vec<Id>,
}

impl OverflowIdPool {
    pub fn new(ids: Vec<Id>) -> Self {
        let mut remaining = ids;
        remaining.reverse();
        Self {
            remaining,
            issued: Vec::new(),
        }
    }
}

impl OverflowIdSource for OverflowIdPool {
    fn has_overflow_ids(&self) -> bool {
        !self.remaining.is_empty()
    }

    fn get_next_overflow_id(&mut self) -> Id {
        let id = self.remaining.pop().expect("overflow id pool exhausted");
        self.issued.push(id);
        id
    }

    fn num_available(&self) -> Option<usize> {
        Some(self.remaining.len())
    }

    fn issued_overflow_ids(&self) -> &[Id] {
        &self.issued
    }
}

/// True if `source` can supply at least `count` ids
pub fn has_enough_overflow_ids(source: &dyn OverflowIdSource, count: usize) -> bool {
    count == 0 || source.num_available().map_or(true, |available| available >= count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids() {
        let mut allocator = FreshIdAllocator::new(10, 100);
        assert_eq!(allocator.fresh_id(), Id(10));
        assert_eq!(allocator.fresh_ids(3), vec![Id(11), Id(12), Id(13)]);
        assert_eq!(allocator.peek(), 14);
    }

    #[test]
    #[should_panic(expected = "fresh ids exhausted")]
    fn test_fresh_ids_stop_at_overflow_range() {
        let mut allocator = FreshIdAllocator::new(10, 11);
        allocator.fresh_id();
        allocator.fresh_id();
    }

    #[test]
    fn test_counter_source() {
        let mut source = CounterOverflowIdSource::new(1000);
        assert!(source.has_overflow_ids());
        assert_eq!(source.get_next_overflow_id(), Id(1000));
        assert_eq!(source.get_next_overflow_id(), Id(1001));
        assert_eq!(source.issued_overflow_ids(), &[Id(1000), Id(1001)]);
        assert!(has_enough_overflow_ids(&source, 1_000_000));
    }

    #[test]
    fn test_pool_source() {
        let mut pool = OverflowIdPool::new(vec![Id(5), Id(6)]);
        assert!(has_enough_overflow_ids(&pool, 2));
        assert!(!has_enough_overflow_ids(&pool, 3));
        assert_eq!(pool.get_next_overflow_id(), Id(5));
        assert_eq!(pool.get_next_overflow_id(), Id(6));
        assert!(!pool.has_overflow_ids());
        assert!(has_enough_overflow_ids(&pool, 0));
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_pool_exhaustion_panics() {
        let mut pool = OverflowIdPool::default();
        pool.get_next_overflow_id();
    }
}
