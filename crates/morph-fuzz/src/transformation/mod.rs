//! The transformation catalog.
//!
//! Every transformation is a plain record. `is_applicable` decides, without
//! side effects, whether the record makes sense for the current module and
//! facts; `apply` performs it and must only be called right after
//! `is_applicable` returned true for the same state. A record that fails its
//! applicability check is expected during search and is simply skipped;
//! `apply` itself never fails.

mod add_bit_instruction_synonym;
mod add_constant_scalar;
mod add_copy_object_synonym;
mod add_loop_preheader;
mod add_loop_to_create_int_constant_synonym;
mod add_opphi_synonym;
mod flatten_conditional_branch;
mod merge_function_returns;
mod outline_function;
mod replace_irrelevant_id;
mod split_block;

pub use add_bit_instruction_synonym::AddBitInstructionSynonym;
pub use add_constant_scalar::AddConstantScalar;
pub use add_copy_object_synonym::AddCopyObjectSynonym;
pub use add_loop_preheader::AddLoopPreheader;
pub use add_loop_to_create_int_constant_synonym::{
    AddLoopToCreateIntConstantSynonym, MAX_LOOP_ITERATIONS,
};
pub use add_opphi_synonym::AddOpPhiSynonym;
pub use flatten_conditional_branch::{instructions_to_enclose, FlattenConditionalBranch};
pub use merge_function_returns::{MergeFunctionReturns, ReturnMergingInfo};
pub use outline_function::{region_input_ids, region_output_ids, OutlineFunction};
pub use replace_irrelevant_id::ReplaceIrrelevantId;
pub use split_block::SplitBlock;

use morph_core::Result;
use morph_ir::IrContext;
use serde::{Deserialize, Serialize};

use crate::fact_manager::FactManager;
use crate::id_allocator::OverflowIdSource;

/// State a transformation may consult and update besides the module
pub struct TransformationContext {
    pub fact_manager: FactManager,
    pub overflow_id_source: Box<dyn OverflowIdSource>,
}

impl TransformationContext {
    pub fn new(fact_manager: FactManager, overflow_id_source: Box<dyn OverflowIdSource>) -> Self {
        Self {
            fact_manager,
            overflow_id_source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    AddBitInstructionSynonym(AddBitInstructionSynonym),
    AddConstantScalar(AddConstantScalar),
    AddCopyObjectSynonym(AddCopyObjectSynonym),
    AddLoopPreheader(AddLoopPreheader),
    AddLoopToCreateIntConstantSynonym(AddLoopToCreateIntConstantSynonym),
    AddOpPhiSynonym(AddOpPhiSynonym),
    FlattenConditionalBranch(FlattenConditionalBranch),
    MergeFunctionReturns(MergeFunctionReturns),
    OutlineFunction(OutlineFunction),
    ReplaceIrrelevantId(ReplaceIrrelevantId),
    SplitBlock(SplitBlock),
}

impl Transformation {
    pub fn is_applicable(&self, ctx: &IrContext, tc: &TransformationContext) -> bool {
        match self {
            Transformation::AddBitInstructionSynonym(t) => t.is_applicable(ctx, tc),
            Transformation::AddConstantScalar(t) => t.is_applicable(ctx, tc),
            Transformation::AddCopyObjectSynonym(t) => t.is_applicable(ctx, tc),
            Transformation::AddLoopPreheader(t) => t.is_applicable(ctx, tc),
            Transformation::AddLoopToCreateIntConstantSynonym(t) => t.is_applicable(ctx, tc),
            Transformation::AddOpPhiSynonym(t) => t.is_applicable(ctx, tc),
            Transformation::FlattenConditionalBranch(t) => t.is_applicable(ctx, tc),
            Transformation::MergeFunctionReturns(t) => t.is_applicable(ctx, tc),
            Transformation::OutlineFunction(t) => t.is_applicable(ctx, tc),
            Transformation::ReplaceIrrelevantId(t) => t.is_applicable(ctx, tc),
            Transformation::SplitBlock(t) => t.is_applicable(ctx, tc),
        }
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        match self {
            Transformation::AddBitInstructionSynonym(t) => t.apply(ctx, tc),
            Transformation::AddConstantScalar(t) => t.apply(ctx, tc),
            Transformation::AddCopyObjectSynonym(t) => t.apply(ctx, tc),
            Transformation::AddLoopPreheader(t) => t.apply(ctx, tc),
            Transformation::AddLoopToCreateIntConstantSynonym(t) => t.apply(ctx, tc),
            Transformation::AddOpPhiSynonym(t) => t.apply(ctx, tc),
            Transformation::FlattenConditionalBranch(t) => t.apply(ctx, tc),
            Transformation::MergeFunctionReturns(t) => t.apply(ctx, tc),
            Transformation::OutlineFunction(t) => t.apply(ctx, tc),
            Transformation::ReplaceIrrelevantId(t) => t.apply(ctx, tc),
            Transformation::SplitBlock(t) => t.apply(ctx, tc),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transformation::AddBitInstructionSynonym(_) => "add_bit_instruction_synonym",
            Transformation::AddConstantScalar(_) => "add_constant_scalar",
            Transformation::AddCopyObjectSynonym(_) => "add_copy_object_synonym",
            Transformation::AddLoopPreheader(_) => "add_loop_preheader",
            Transformation::AddLoopToCreateIntConstantSynonym(_) => {
                "add_loop_to_create_int_constant_synonym"
            }
            Transformation::AddOpPhiSynonym(_) => "add_opphi_synonym",
            Transformation::FlattenConditionalBranch(_) => "flatten_conditional_branch",
            Transformation::MergeFunctionReturns(_) => "merge_function_returns",
            Transformation::OutlineFunction(_) => "outline_function",
            Transformation::ReplaceIrrelevantId(_) => "replace_irrelevant_id",
            Transformation::SplitBlock(_) => "split_block",
        }
    }
}

macro_rules! impl_from_record {
    ($($record:ident),* $(,)?) => {
        $(
            impl From<$record> for Transformation {
                fn from(record: $record) -> Self {
                    Transformation::$record(record)
                }
            }
        )*
    };
}

impl_from_record!(
    AddBitInstructionSynonym,
    AddConstantScalar,
    AddCopyObjectSynonym,
    AddLoopPreheader,
    AddLoopToCreateIntConstantSynonym,
    AddOpPhiSynonym,
    FlattenConditionalBranch,
    MergeFunctionReturns,
    OutlineFunction,
    ReplaceIrrelevantId,
    SplitBlock,
);

/// An ordered log of applied transformations; replaying it against the
/// original module reproduces the transformed one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationSequence {
    pub transformations: Vec<Transformation>,
}

impl TransformationSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transformation: Transformation) {
        self.transformations.push(transformation);
    }

    pub fn len(&self) -> usize {
        self.transformations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transformation> {
        self.transformations.iter()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
