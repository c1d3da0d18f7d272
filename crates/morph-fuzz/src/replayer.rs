//! Re-applying a recorded transformation sequence.

use morph_core::{ReplayConfig, Result};
use morph_ir::{validate_module, IrContext, Module};
use tracing::{debug, info, instrument};

use crate::fact_manager::{Fact, FactManager};
use crate::id_allocator::CounterOverflowIdSource;
use crate::transformation::{TransformationContext, TransformationSequence};

#[derive(Debug)]
pub struct ReplayResult {
    pub module: Module,
    /// The records that applied, in order
    pub applied: TransformationSequence,
    /// How many records were skipped as inapplicable
    pub skipped: usize,
    pub facts: Vec<Fact>,
}

pub struct Replayer;

impl Replayer {
    /// Apply each record of `sequence` that is applicable at its turn and
    /// skip the rest. Overflow ids count up from `config.first_overflow_id`,
    /// as they did when the sequence was recorded.
    #[instrument(skip_all, fields(records = sequence.len()))]
    pub fn replay(
        module: Module,
        initial_facts: &[Fact],
        sequence: &TransformationSequence,
        config: &ReplayConfig,
    ) -> Result<ReplayResult> {
        let mut ir = IrContext::new(module);
        validate_module(&ir)?;
        if config.first_overflow_id < ir.id_bound() {
            return Err(morph_core::Error::InvalidState(format!(
                "first overflow id {} is below the module id bound {}",
                config.first_overflow_id,
                ir.id_bound()
            )));
        }

        let mut transformation_context = TransformationContext::new(
            FactManager::new(),
            Box::new(CounterOverflowIdSource::new(config.first_overflow_id)),
        );
        for fact in initial_facts {
            transformation_context
                .fact_manager
                .maybe_add_fact(fact.clone(), &ir);
        }

        let limit = config
            .num_transformations_to_apply
            .unwrap_or(sequence.len())
            .min(sequence.len());
        info!("Replaying {} of {} transformations", limit, sequence.len());

        let mut applied = TransformationSequence::new();
        let mut skipped = 0;
        for (index, transformation) in sequence.iter().take(limit).enumerate() {
            if !transformation.is_applicable(&ir, &transformation_context) {
                debug!(
                    index,
                    transformation = transformation.name(),
                    "Skipping inapplicable transformation"
                );
                skipped += 1;
                continue;
            }
            transformation.apply(&mut ir, &mut transformation_context);
            applied.push(transformation.clone());

            if config.validate_after_each_transformation {
                validate_module(&ir).map_err(|e| {
                    morph_core::Error::Validation(format!(
                        "transformation {} ({}) produced an invalid module: {}",
                        index,
                        transformation.name(),
                        e
                    ))
                })?;
            }
        }

        info!("Replay applied {} transformations, skipped {}", applied.len(), skipped);
        Ok(ReplayResult {
            module: ir.into_module(),
            applied,
            skipped,
            facts: transformation_context.fact_manager.all_facts().to_vec(),
        })
    }
}
