//! Fuzzer passes.
//!
//! A pass walks the module, makes random decisions and turns them into
//! transformation records. Every record that applies is appended to the
//! sequence, so the run can be replayed from the sequence alone. Passes
//! collect their candidate sites before they start changing the module.

mod add_bit_instruction_synonyms;
mod add_copy_object_synonyms;
mod add_loop_preheaders;
mod add_loops_to_create_int_constant_synonyms;
mod add_opphi_synonyms;
mod flatten_conditional_branches;
mod merge_function_returns;
mod outline_functions;
mod replace_irrelevant_ids;

use morph_ir::{Id, IrContext, Type};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::fuzzer_context::FuzzerContext;
use crate::transformation::{
    AddConstantScalar, Transformation, TransformationContext, TransformationSequence,
};
use crate::util;

/// Everything a pass needs: the module, the facts and overflow ids, the
/// random source, and the sequence applied records are appended to
pub struct FuzzerPassContext<'a> {
    pub ir: &'a mut IrContext,
    pub transformation_context: &'a mut TransformationContext,
    pub fuzzer_context: &'a mut FuzzerContext,
    pub transformations: &'a mut TransformationSequence,
}

impl<'a> FuzzerPassContext<'a> {
    pub fn new(
        ir: &'a mut IrContext,
        transformation_context: &'a mut TransformationContext,
        fuzzer_context: &'a mut FuzzerContext,
        transformations: &'a mut TransformationSequence,
    ) -> Self {
        Self {
            ir,
            transformation_context,
            fuzzer_context,
            transformations,
        }
    }

    /// Apply a record the pass has built to be applicable
    pub fn apply_transformation(&mut self, transformation: impl Into<Transformation>) {
        let transformation = transformation.into();
        assert!(
            transformation.is_applicable(self.ir, self.transformation_context),
            "{} was expected to be applicable",
            transformation.name()
        );
        self.apply_unchecked(transformation);
    }

    /// Apply a record if it is applicable; returns whether it was
    pub fn maybe_apply_transformation(
        &mut self,
        transformation: impl Into<Transformation>,
    ) -> bool {
        let transformation = transformation.into();
        if !transformation.is_applicable(self.ir, self.transformation_context) {
            return false;
        }
        self.apply_unchecked(transformation);
        true
    }

    fn apply_unchecked(&mut self, transformation: Transformation) {
        trace!(transformation = transformation.name(), "Applying transformation");
        transformation.apply(self.ir, self.transformation_context);
        self.transformations.push(transformation);
    }

    /// A scalar integer constant with the given value, declared first if
    /// needed. `None` if the module has no such integer type.
    pub fn find_or_create_int_constant(
        &mut self,
        bits: u64,
        width: u32,
        signed: bool,
        is_irrelevant: bool,
    ) -> Option<Id> {
        let facts = &self.transformation_context.fact_manager;
        if let Some(id) =
            util::find_int_constant(self.ir, facts, bits, width, signed, is_irrelevant)
        {
            return Some(id);
        }
        let type_id = self.ir.find_int_type(width, signed)?;
        let fresh_id = self.fuzzer_context.fresh_id();
        self.apply_transformation(AddConstantScalar {
            fresh_id,
            type_id,
            value: bits & morph_ir::types::width_mask(width),
            is_irrelevant,
        });
        Some(fresh_id)
    }

    /// `true` or `false`, declared first if needed. `None` without a bool type.
    pub fn find_or_create_bool_constant(&mut self, value: bool, is_irrelevant: bool) -> Option<Id> {
        let facts = &self.transformation_context.fact_manager;
        if let Some(id) = util::find_bool_constant(self.ir, facts, value, is_irrelevant) {
            return Some(id);
        }
        let type_id = self.ir.find_bool_type()?;
        let fresh_id = self.fuzzer_context.fresh_id();
        self.apply_transformation(AddConstantScalar {
            fresh_id,
            type_id,
            value: u64::from(value),
            is_irrelevant,
        });
        Some(fresh_id)
    }

    /// A constant of the scalar integer type `type_id` holding `bits`
    pub fn find_or_create_constant_of_type(
        &mut self,
        type_id: Id,
        bits: u64,
        is_irrelevant: bool,
    ) -> Option<Id> {
        match self.ir.get_type(type_id)? {
            Type::Int { width, signed } => {
                self.find_or_create_int_constant(bits, width, signed, is_irrelevant)
            }
            Type::Bool => self.find_or_create_bool_constant(bits != 0, is_irrelevant),
            _ => None,
        }
    }
}

/// The pass catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzerPass {
    AddBitInstructionSynonyms,
    AddCopyObjectSynonyms,
    AddOpPhiSynonyms,
    AddLoopsToCreateIntConstantSynonyms,
    AddLoopPreheaders,
    ReplaceIrrelevantIds,
    FlattenConditionalBranches,
    MergeFunctionReturns,
    OutlineFunctions,
}

impl FuzzerPass {
    pub const ALL: [FuzzerPass; 9] = [
        FuzzerPass::AddBitInstructionSynonyms,
        FuzzerPass::AddCopyObjectSynonyms,
        FuzzerPass::AddOpPhiSynonyms,
        FuzzerPass::AddLoopsToCreateIntConstantSynonyms,
        FuzzerPass::AddLoopPreheaders,
        FuzzerPass::ReplaceIrrelevantIds,
        FuzzerPass::FlattenConditionalBranches,
        FuzzerPass::MergeFunctionReturns,
        FuzzerPass::OutlineFunctions,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FuzzerPass::AddBitInstructionSynonyms => "add_bit_instruction_synonyms",
            FuzzerPass::AddCopyObjectSynonyms => "add_copy_object_synonyms",
            FuzzerPass::AddOpPhiSynonyms => "add_opphi_synonyms",
            FuzzerPass::AddLoopsToCreateIntConstantSynonyms => {
                "add_loops_to_create_int_constant_synonyms"
            }
            FuzzerPass::AddLoopPreheaders => "add_loop_preheaders",
            FuzzerPass::ReplaceIrrelevantIds => "replace_irrelevant_ids",
            FuzzerPass::FlattenConditionalBranches => "flatten_conditional_branches",
            FuzzerPass::MergeFunctionReturns => "merge_function_returns",
            FuzzerPass::OutlineFunctions => "outline_functions",
        }
    }

    pub fn apply(&self, ctx: &mut FuzzerPassContext<'_>) {
        match self {
            FuzzerPass::AddBitInstructionSynonyms => add_bit_instruction_synonyms::apply(ctx),
            FuzzerPass::AddCopyObjectSynonyms => add_copy_object_synonyms::apply(ctx),
            FuzzerPass::AddOpPhiSynonyms => add_opphi_synonyms::apply(ctx),
            FuzzerPass::AddLoopsToCreateIntConstantSynonyms => {
                add_loops_to_create_int_constant_synonyms::apply(ctx)
            }
            FuzzerPass::AddLoopPreheaders => add_loop_preheaders::apply(ctx),
            FuzzerPass::ReplaceIrrelevantIds => replace_irrelevant_ids::apply(ctx),
            FuzzerPass::FlattenConditionalBranches => flatten_conditional_branches::apply(ctx),
            FuzzerPass::MergeFunctionReturns => merge_function_returns::apply(ctx),
            FuzzerPass::OutlineFunctions => outline_functions::apply(ctx),
        }
    }
}

/// Labels of every block in the module, function by function
fn all_block_labels(ir: &IrContext) -> Vec<Id> {
    ir.module()
        .functions
        .iter()
        .flat_map(|f| f.blocks.iter().map(|b| b.label))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use morph_core::{FuzzerConfig, PassChances};
    use morph_ir::IrContext;

    use super::{FuzzerPass, FuzzerPassContext};
    use crate::fuzzer_context::FuzzerContext;
    use crate::test_modules as tm;
    use crate::transformation::{TransformationContext, TransformationSequence};

    /// Every chance at 100
    pub fn always() -> PassChances {
        PassChances {
            adding_bit_instruction_synonym: 100,
            adding_copy_object_synonym: 100,
            adding_opphi_synonym: 100,
            adding_loop_to_create_int_constant_synonym: 100,
            adding_loop_preheader: 100,
            replacing_irrelevant_id: 100,
            flattening_conditional_branch: 100,
            merging_function_returns: 100,
            outlining_function: 100,
        }
    }

    /// Run one pass over `ctx` and return the records it applied
    pub fn run_pass(
        pass: FuzzerPass,
        ctx: &mut IrContext,
        tc: &mut TransformationContext,
        seed: u64,
    ) -> TransformationSequence {
        let config = FuzzerConfig {
            seed,
            chances: always(),
            ..Default::default()
        };
        let mut fuzzer_context = FuzzerContext::new(&config, ctx.id_bound());
        let mut sequence = TransformationSequence::new();
        let mut pass_ctx = FuzzerPassContext::new(ctx, tc, &mut fuzzer_context, &mut sequence);
        pass.apply(&mut pass_ctx);
        tm::assert_valid(ctx);
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_modules as tm;
    use morph_core::FuzzerConfig;

    #[test]
    fn test_find_or_create_constants() {
        let mut ir = IrContext::new(tm::diamond_with_store());
        let mut tc = tm::transformation_context();
        let mut fuzzer_context = FuzzerContext::new(&FuzzerConfig::default(), ir.id_bound());
        let mut sequence = TransformationSequence::new();
        let mut ctx = FuzzerPassContext::new(&mut ir, &mut tc, &mut fuzzer_context, &mut sequence);

        assert_eq!(ctx.find_or_create_int_constant(2, 32, true, false), Some(tm::INT_TWO));
        let created = ctx.find_or_create_int_constant(77, 32, true, true).unwrap();
        assert_eq!(ctx.find_or_create_int_constant(77, 32, true, true), Some(created));
        assert!(ctx.transformation_context.fact_manager.id_is_irrelevant(created));
        assert_eq!(ctx.find_or_create_bool_constant(true, false), Some(tm::TRUE));
        // No 64-bit integer type to put the constant in
        assert_eq!(ctx.find_or_create_int_constant(1, 64, true, false), None);
        assert_eq!(sequence.len(), 1);
    }

    #[test]
    fn test_maybe_apply_skips_inapplicable_records() {
        let mut ir = IrContext::new(tm::diamond_with_store());
        let mut tc = tm::transformation_context();
        let mut fuzzer_context = FuzzerContext::new(&FuzzerConfig::default(), ir.id_bound());
        let mut sequence = TransformationSequence::new();
        let mut ctx = FuzzerPassContext::new(&mut ir, &mut tc, &mut fuzzer_context, &mut sequence);
        let taken = AddConstantScalar {
            fresh_id: tm::INT_ONE,
            type_id: tm::INT,
            value: 5,
            is_irrelevant: false,
        };
        assert!(!ctx.maybe_apply_transformation(taken));
        assert!(ctx.transformations.is_empty());
    }

    #[test]
    fn test_pass_names_are_distinct() {
        let names: std::collections::HashSet<&str> =
            FuzzerPass::ALL.iter().map(FuzzerPass::name).collect();
        assert_eq!(names.len(), FuzzerPass::ALL.len());
    }
}
