use morph_ir::{Id, InstructionLocation, IrContext, Opcode};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::descriptors::{find_instruction, InstructionDescriptor};
use crate::util;

/// Split a block in two before the given instruction. The first half
/// branches unconditionally to the second, labelled `fresh_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitBlock {
    pub instruction_to_split_before: InstructionDescriptor,
    pub fresh_id: Id,
}

impl SplitBlock {
    pub fn is_applicable(&self, ctx: &IrContext, _tc: &TransformationContext) -> bool {
        if !util::is_fresh_id(ctx, self.fresh_id) {
            return false;
        }
        let Some(InstructionLocation::Block {
            function, block, index,
        }) = find_instruction(&self.instruction_to_split_before, ctx)
        else {
            return false;
        };
        let block = &ctx.module().functions[function].blocks[block];
        // Back edges target the header's label, which stays with the first half
        if block.is_loop_header() {
            return false;
        }
        let inst = &block.instructions[index];
        if matches!(inst.opcode, Opcode::Phi | Opcode::Variable) {
            return false;
        }
        !(inst.opcode.is_terminator() && block.merge_instruction().is_some())
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let Some(InstructionLocation::Block {
            function, block, index,
        }) = find_instruction(&self.instruction_to_split_before, ctx)
        else {
            panic!("split point must be a block instruction");
        };
        let label = ctx.module().functions[function].blocks[block].label;

        let module = ctx.module_mut();
        module.functions[function].split_block(label, index, self.fresh_id);
        module.update_id_bound(self.fresh_id);

        if tc.fact_manager.block_is_dead(label) {
            tc.fact_manager.add_fact_block_is_dead(self.fresh_id, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_modules as tm;

    fn split(base: Id, opcode: Opcode, skip: u32, fresh: u32) -> SplitBlock {
        SplitBlock {
            instruction_to_split_before: InstructionDescriptor::new(base, opcode, skip),
            fresh_id: Id(fresh),
        }
    }

    #[test]
    fn test_split_retargets_successor_phis() {
        let mut ctx = IrContext::new(tm::diamond_with_store());
        let mut tc = tm::transformation_context();
        let t = split(tm::ADD_RESULT, Opcode::Store, 0, 500);
        assert!(t.is_applicable(&ctx, &tc));
        t.apply(&mut ctx, &mut tc);

        tm::assert_valid(&ctx);
        assert_eq!(ctx.successors(tm::TRUE_BLOCK), &[Id(500)]);
        let phi = &ctx.block(tm::MERGE_BLOCK).unwrap().instructions[0];
        assert_eq!(phi.phi_pairs()[0], (tm::ADD_RESULT, Id(500)));
        assert_eq!(ctx.id_bound(), 501);
    }

    #[test]
    fn test_split_before_first_instruction() {
        let mut ctx = IrContext::new(tm::straight_line());
        let mut tc = tm::transformation_context();
        let t = split(tm::OUT_SUM, Opcode::IAdd, 0, 500);
        assert!(t.is_applicable(&ctx, &tc));
        t.apply(&mut ctx, &mut tc);
        tm::assert_valid(&ctx);
        assert_eq!(ctx.block(tm::OUT_A).unwrap().len(), 1);
    }

    #[test]
    fn test_split_rejections() {
        let ctx = IrContext::new(tm::all_features());
        let tc = tm::transformation_context();
        // Before a phi
        assert!(!split(tm::PHI_RESULT, Opcode::Phi, 0, 500).is_applicable(&ctx, &tc));
        // Before a variable
        assert!(!split(tm::VAR, Opcode::Variable, 0, 500).is_applicable(&ctx, &tc));
        // Between a merge instruction and its terminator
        assert!(!split(tm::ENTRY, Opcode::BranchConditional, 0, 500).is_applicable(&ctx, &tc));
        // Inside a loop header
        assert!(!split(tm::PRE_PHI, Opcode::LoopMerge, 0, 500).is_applicable(&ctx, &tc));
        // Id in use
        assert!(!split(tm::ADD_RESULT, Opcode::Store, 0, 31).is_applicable(&ctx, &tc));
        // Before a selection merge is fine: the second half becomes the header
        assert!(split(tm::VAR, Opcode::SelectionMerge, 0, 500).is_applicable(&ctx, &tc));
    }

    #[test]
    fn test_split_propagates_dead_blocks() {
        let mut ctx = IrContext::new(tm::diamond_with_store());
        let mut tc = tm::transformation_context();
        tc.fact_manager.add_fact_block_is_dead(tm::FALSE_BLOCK, &ctx);
        let t = split(tm::FALSE_BLOCK, Opcode::Branch, 0, 500);
        assert!(t.is_applicable(&ctx, &tc));
        t.apply(&mut ctx, &mut tc);
        tm::assert_valid(&ctx);
        assert!(tc.fact_manager.block_is_dead(Id(500)));
    }
}
