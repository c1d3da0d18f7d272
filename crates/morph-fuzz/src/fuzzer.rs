//! The fuzzer driver: runs randomly chosen passes over a module and records
//! every transformation it applies.

use morph_core::{FuzzerConfig, Result};
use morph_ir::{validate_module, IrContext, Module};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::fact_manager::{Fact, FactManager};
use crate::fuzzer_context::FuzzerContext;
use crate::fuzzer_pass::{FuzzerPass, FuzzerPassContext};
use crate::id_allocator::CounterOverflowIdSource;
use crate::transformation::{TransformationContext, TransformationSequence};

/// Fewer fresh ids than this left and no further pass is started
const MIN_FRESH_IDS_PER_PASS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzerStatus {
    /// Every pass ran
    Complete,
    /// Stopped because enough transformations were applied, or fresh ids ran low
    TransformationLimitReached,
    /// Validation after a pass failed; the module is returned as it was then
    FuzzerPassLedToInvalidModule,
}

#[derive(Debug)]
pub struct FuzzerResult {
    pub module: Module,
    pub transformations: TransformationSequence,
    pub status: FuzzerStatus,
    /// Replaying `transformations` must start overflow ids here
    pub first_overflow_id: u32,
    /// Facts known at the end of the run, initial facts included
    pub facts: Vec<Fact>,
}

pub struct Fuzzer {
    config: FuzzerConfig,
}

impl Fuzzer {
    pub fn new(config: FuzzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FuzzerConfig {
        &self.config
    }

    /// Fuzz `module`. Initial facts that do not fit the module are dropped.
    ///
    /// Fails only if `module` is invalid to begin with.
    #[instrument(skip(self, module, initial_facts), fields(seed = self.config.seed))]
    pub fn run(&self, module: Module, initial_facts: &[Fact]) -> Result<FuzzerResult> {
        let mut ir = IrContext::new(module);
        validate_module(&ir)?;

        let mut fuzzer_context = FuzzerContext::new(&self.config, ir.id_bound());
        let first_overflow_id = fuzzer_context.first_overflow_id();
        let mut transformation_context = TransformationContext::new(
            FactManager::new(),
            Box::new(CounterOverflowIdSource::new(first_overflow_id)),
        );
        for fact in initial_facts {
            if !transformation_context
                .fact_manager
                .maybe_add_fact(fact.clone(), &ir)
            {
                warn!(?fact, "Ignoring initial fact that does not fit the module");
            }
        }

        info!(
            "Starting fuzzer: up to {} passes, {} transformations",
            self.config.max_passes, self.config.transformation_limit
        );

        let mut transformations = TransformationSequence::new();
        let mut status = FuzzerStatus::Complete;
        for pass_number in 0..self.config.max_passes {
            if transformations.len() >= self.config.transformation_limit {
                status = FuzzerStatus::TransformationLimitReached;
                break;
            }
            if fuzzer_context.num_fresh_ids_left() < MIN_FRESH_IDS_PER_PASS {
                warn!(
                    "Stopping after {} passes: fresh ids are running out",
                    pass_number
                );
                status = FuzzerStatus::TransformationLimitReached;
                break;
            }

            let pass = *fuzzer_context.choose(&FuzzerPass::ALL);
            let applied_before = transformations.len();
            let mut pass_context = FuzzerPassContext::new(
                &mut ir,
                &mut transformation_context,
                &mut fuzzer_context,
                &mut transformations,
            );
            pass.apply(&mut pass_context);
            debug!(
                pass = pass.name(),
                pass_number,
                applied = transformations.len() - applied_before,
                "Finished fuzzer pass"
            );

            if self.config.validate_after_each_pass {
                if let Err(e) = validate_module(&ir) {
                    warn!(pass = pass.name(), "Pass produced an invalid module: {}", e);
                    status = FuzzerStatus::FuzzerPassLedToInvalidModule;
                    break;
                }
            }
        }
        if status == FuzzerStatus::Complete
            && transformations.len() >= self.config.transformation_limit
        {
            status = FuzzerStatus::TransformationLimitReached;
        }

        info!(
            "Fuzzer finished with {:?} after {} transformations",
            status,
            transformations.len()
        );
        Ok(FuzzerResult {
            module: ir.into_module(),
            transformations,
            status,
            first_overflow_id,
            facts: transformation_context.fact_manager.all_facts().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_modules as tm;

    fn config(seed: u64) -> FuzzerConfig {
        FuzzerConfig {
            seed,
            max_passes: 12,
            validate_after_each_pass: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_fuzzing_keeps_module_valid() {
        let result = Fuzzer::new(config(1)).run(tm::all_features(), &[]).unwrap();
        assert_eq!(result.status, FuzzerStatus::Complete);
        tm::assert_valid(&IrContext::new(result.module));
    }

    #[test]
    fn test_every_pass_at_full_chance_keeps_module_valid() {
        for seed in 0..16 {
            let config = FuzzerConfig {
                chances: crate::fuzzer_pass::test_support::always(),
                max_passes: 6,
                ..config(seed)
            };
            let result = Fuzzer::new(config).run(tm::all_features(), &[]).unwrap();
            assert_ne!(
                result.status,
                FuzzerStatus::FuzzerPassLedToInvalidModule,
                "seed {seed}"
            );
            tm::assert_valid(&IrContext::new(result.module));
        }
    }

    #[test]
    fn test_same_seed_same_transformations() {
        let a = Fuzzer::new(config(42)).run(tm::all_features(), &[]).unwrap();
        let b = Fuzzer::new(config(42)).run(tm::all_features(), &[]).unwrap();
        assert_eq!(a.transformations, b.transformations);
        assert_eq!(a.module, b.module);
    }

    #[test]
    fn test_transformation_limit() {
        let config = FuzzerConfig {
            transformation_limit: 1,
            max_passes: 200,
            chances: crate::fuzzer_pass::test_support::always(),
            ..Default::default()
        };
        let result = Fuzzer::new(config).run(tm::all_features(), &[]).unwrap();
        assert_eq!(result.status, FuzzerStatus::TransformationLimitReached);
        assert!(!result.transformations.is_empty());
    }

    #[test]
    fn test_initial_facts_are_kept() {
        let facts = [
            Fact::IdIsIrrelevant { id: tm::INT_TEN },
            // Not an id of the module
            Fact::BlockIsDead {
                block_id: morph_ir::Id(9_999),
            },
        ];
        let result = Fuzzer::new(config(3)).run(tm::all_features(), &facts).unwrap();
        assert!(result.facts.contains(&facts[0]));
        assert!(!result.facts.contains(&facts[1]));
    }

    #[test]
    fn test_invalid_module_is_rejected() {
        let mut module = tm::diamond_with_store();
        module.functions[0].blocks[1].instructions.pop();
        assert!(Fuzzer::new(config(0)).run(module, &[]).is_err());
    }
}
