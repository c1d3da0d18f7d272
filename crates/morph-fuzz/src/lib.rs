//! Semantics-preserving mutation of structured SSA modules.
//!
//! A [`Fuzzer`] runs randomly chosen passes over a module. Each pass builds
//! transformation records and applies the ones whose legality check holds,
//! so the result computes what the input did. The applied records form a
//! [`TransformationSequence`] that the [`Replayer`] can re-apply to the
//! original module, or to a variant of it while shrinking a test case.

pub mod descriptors;
pub mod fact_manager;
pub mod fuzzer;
pub mod fuzzer_context;
pub mod fuzzer_pass;
pub mod id_allocator;
pub mod region;
pub mod replayer;
pub mod transformation;
pub mod util;

#[cfg(test)]
mod test_modules;

pub use descriptors::{IdUseDescriptor, InstructionDescriptor};
pub use fact_manager::{DataDescriptor, Fact, FactManager};
pub use fuzzer::{Fuzzer, FuzzerResult, FuzzerStatus};
pub use fuzzer_context::{FuzzerContext, RandomGenerator};
pub use fuzzer_pass::{FuzzerPass, FuzzerPassContext};
pub use id_allocator::{CounterOverflowIdSource, FreshIdAllocator, OverflowIdPool, OverflowIdSource};
pub use replayer::{ReplayResult, Replayer};
pub use transformation::{Transformation, TransformationContext, TransformationSequence};
