//! Randomness and fresh ids for a fuzzing run.

use morph_core::{FuzzerConfig, PassChances};
use morph_ir::Id;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::id_allocator::FreshIdAllocator;

/// The random decisions a fuzzer makes
pub trait RandomGenerator {
    /// A value in `1..=100`
    fn random_percentage(&mut self) -> u32;

    /// A value in `0..len`; `len` must be positive
    fn random_index(&mut self, len: usize) -> usize;

    fn random_bool(&mut self) -> bool;

    /// A value in `0..bound`; `bound` must be positive
    fn random_u32_below(&mut self, bound: u32) -> u32;
}

impl RandomGenerator for ChaCha8Rng {
    fn random_percentage(&mut self) -> u32 {
        self.gen_range(1..=100)
    }

    fn random_index(&mut self, len: usize) -> usize {
        assert!(len > 0, "cannot pick from an empty collection");
        self.gen_range(0..len)
    }

    fn random_bool(&mut self) -> bool {
        self.gen()
    }

    fn random_u32_below(&mut self, bound: u32) -> u32 {
        assert!(bound > 0, "bound must be positive");
        self.gen_range(0..bound)
    }
}

pub struct FuzzerContext {
    rng: Box<dyn RandomGenerator>,
    ids: FreshIdAllocator,
    chances: PassChances,
    first_overflow_id: u32,
}

impl FuzzerContext {
    /// `id_bound` is the bound of the module being fuzzed; fresh ids start
    /// there and stop short of the overflow range
    pub fn new(config: &FuzzerConfig, id_bound: u32) -> Self {
        let first_overflow_id = id_bound.saturating_add(config.overflow_id_gap);
        Self::with_generator(
            Box::new(ChaCha8Rng::seed_from_u64(config.seed)),
            config.chances.clone(),
            id_bound,
            first_overflow_id,
        )
    }

    pub fn with_generator(
        rng: Box<dyn RandomGenerator>,
        chances: PassChances,
        id_bound: u32,
        first_overflow_id: u32,
    ) -> Self {
        Self {
            rng,
            ids: FreshIdAllocator::new(id_bound.max(1), first_overflow_id),
            chances,
            first_overflow_id,
        }
    }

    pub fn chances(&self) -> &PassChances {
        &self.chances
    }

    pub fn first_overflow_id(&self) -> u32 {
        self.first_overflow_id
    }

    /// True with probability `percentage`/100
    pub fn choose_percentage(&mut self, percentage: u32) -> bool {
        assert!(percentage <= 100, "percentages are at most 100");
        self.rng.random_percentage() <= percentage
    }

    pub fn random_index(&mut self, len: usize) -> usize {
        self.rng.random_index(len)
    }

    pub fn random_bool(&mut self) -> bool {
        self.rng.random_bool()
    }

    pub fn random_u32_below(&mut self, bound: u32) -> u32 {
        self.rng.random_u32_below(bound)
    }

    /// A random element of a non-empty slice
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.random_index(items.len())]
    }

    pub fn fresh_id(&mut self) -> Id {
        self.ids.fresh_id()
    }

    pub fn fresh_ids(&mut self, count: usize) -> Vec<Id> {
        self.ids.fresh_ids(count)
    }

    /// Fresh ids left before the overflow range
    pub fn num_fresh_ids_left(&self) -> u32 {
        self.first_overflow_id.saturating_sub(self.ids.peek())
    }
}
