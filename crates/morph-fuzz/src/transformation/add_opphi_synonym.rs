use std::collections::HashSet;

use morph_ir::{Id, Instruction, IrContext, Type};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::fact_manager::DataDescriptor;
use crate::util;

/// Merge one synonymous value per predecessor into a new phi at the start of
/// `block_id`. The phi is then a synonym of all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOpPhiSynonym {
    pub block_id: Id,
    /// `(predecessor, id)` pairs, one per predecessor
    pub pred_to_id: Vec<(Id, Id)>,
    pub fresh_id: Id,
}

impl AddOpPhiSynonym {
    pub fn is_applicable(&self, ctx: &IrContext, tc: &TransformationContext) -> bool {
        if !util::is_fresh_id(ctx, self.fresh_id) || ctx.block(self.block_id).is_none() {
            return false;
        }
        let preds = ctx.predecessors(self.block_id);
        if preds.is_empty() || preds.len() != self.pred_to_id.len() {
            return false;
        }
        let mapped: HashSet<Id> = self.pred_to_id.iter().map(|(pred, _)| *pred).collect();
        if mapped.len() != preds.len() || !preds.iter().all(|pred| mapped.contains(pred)) {
            return false;
        }

        let (_, first) = self.pred_to_id[0];
        let Some(type_id) = ctx.type_id_of(first) else {
            return false;
        };
        if !type_is_allowed(ctx, type_id) {
            return false;
        }
        self.pred_to_id.iter().all(|(pred, id)| {
            ctx.type_id_of(*id) == Some(type_id)
                && tc.fact_manager.ids_are_synonymous(first, *id)
                && !tc.fact_manager.id_is_irrelevant(*id)
                && util::id_is_available_at_end_of_block(ctx, *pred, *id)
        })
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let (_, first) = self.pred_to_id[0];
        let type_id = ctx.type_id_of(first).expect("phi inputs must have a type");
        let pairs: Vec<(Id, Id)> = self.pred_to_id.iter().map(|(pred, id)| (*id, *pred)).collect();

        let module = ctx.module_mut();
        let function = module
            .function_containing_block_mut(self.block_id)
            .expect("phi block must exist");
        let block = function
            .block_mut(self.block_id)
            .expect("phi block must exist");
        block
            .instructions
            .insert(0, Instruction::phi(type_id, self.fresh_id, &pairs));
        module.update_id_bound(self.fresh_id);

        tc.fact_manager.add_fact_data_synonym(
            DataDescriptor::whole(self.fresh_id),
            DataDescriptor::whole(first),
            ctx,
        );
    }
}

/// Phis may merge plain data, never pointers or opaque handles
fn type_is_allowed(ctx: &IrContext, type_id: Id) -> bool {
    matches!(
        ctx.get_type(type_id),
        Some(
            Type::Bool
                | Type::Int { .. }
                | Type::Float { .. }
                | Type::Vector { .. }
                | Type::Matrix { .. }
                | Type::Array { .. }
                | Type::RuntimeArray { .. }
                | Type::Struct { .. }
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::InstructionDescriptor;
    use crate::test_modules as tm;
    use crate::transformation::AddCopyObjectSynonym;
    use morph_ir::Opcode;

    /// Copy `1` into the true block so the merge block sees a synonym of `1`
    /// on each incoming edge
    fn with_copy() -> (IrContext, crate::transformation::TransformationContext) {
        let mut ctx = IrContext::new(tm::diamond_with_store());
        let mut tc = tm::transformation_context();
        let copy = AddCopyObjectSynonym {
            existing_id: tm::INT_ONE,
            insert_before: InstructionDescriptor::new(tm::TRUE_BLOCK, Opcode::Branch, 0),
            fresh_id: Id(500),
        };
        assert!(copy.is_applicable(&ctx, &tc));
        copy.apply(&mut ctx, &mut tc);
        (ctx, tc)
    }

    #[test]
    fn test_phi_synonym() {
        let (mut ctx, mut tc) = with_copy();
        let t = AddOpPhiSynonym {
            block_id: tm::MERGE_BLOCK,
            pred_to_id: vec![(tm::TRUE_BLOCK, Id(500)), (tm::FALSE_BLOCK, tm::INT_ONE)],
            fresh_id: Id(501),
        };
        assert!(t.is_applicable(&ctx, &tc));
        t.apply(&mut ctx, &mut tc);

        tm::assert_valid(&ctx);
        assert!(tc.fact_manager.ids_are_synonymous(Id(501), tm::INT_ONE));
        assert!(tc.fact_manager.ids_are_synonymous(Id(501), Id(500)));
        assert_eq!(ctx.block(tm::MERGE_BLOCK).unwrap().phis().count(), 2);
    }

    #[test]
    fn test_phi_synonym_rejections() {
        let (ctx, tc) = with_copy();
        let base = AddOpPhiSynonym {
            block_id: tm::MERGE_BLOCK,
            pred_to_id: vec![(tm::TRUE_BLOCK, Id(500)), (tm::FALSE_BLOCK, tm::INT_ONE)],
            fresh_id: Id(501),
        };
        // The copy is not available on the false edge
        let unavailable = AddOpPhiSynonym {
            pred_to_id: vec![(tm::TRUE_BLOCK, tm::INT_ONE), (tm::FALSE_BLOCK, Id(500))],
            ..base.clone()
        };
        assert!(!unavailable.is_applicable(&ctx, &tc));
        // Not synonymous
        let unrelated = AddOpPhiSynonym {
            pred_to_id: vec![(tm::TRUE_BLOCK, Id(500)), (tm::FALSE_BLOCK, tm::INT_TWO)],
            ..base.clone()
        };
        assert!(!unrelated.is_applicable(&ctx, &tc));
        // A predecessor is missing
        let missing = AddOpPhiSynonym {
            pred_to_id: vec![(tm::TRUE_BLOCK, Id(500))],
            ..base.clone()
        };
        assert!(!missing.is_applicable(&ctx, &tc));
        // The same predecessor twice
        let duplicated = AddOpPhiSynonym {
            pred_to_id: vec![(tm::TRUE_BLOCK, Id(500)), (tm::TRUE_BLOCK, tm::INT_ONE)],
            ..base.clone()
        };
        assert!(!duplicated.is_applicable(&ctx, &tc));
        assert!(base.is_applicable(&ctx, &tc));
    }

    #[test]
    fn test_single_predecessor_phi_of_itself() {
        let mut ctx = IrContext::new(tm::diamond_with_store());
        let mut tc = tm::transformation_context();
        let t = AddOpPhiSynonym {
            block_id: tm::TRUE_BLOCK,
            pred_to_id: vec![(tm::ENTRY, tm::INT_TEN)],
            fresh_id: Id(500),
        };
        assert!(t.is_applicable(&ctx, &tc));
        t.apply(&mut ctx, &mut tc);
        tm::assert_valid(&ctx);
        assert!(tc.fact_manager.ids_are_synonymous(Id(500), tm::INT_TEN));
    }
}
