use morph_ir::{BasicBlock, Id, Instruction, IrContext, Operand};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::util;

/// Give a loop header a new block, `fresh_id`, as its only predecessor from
/// outside the loop. With several outside predecessors, each header phi gets
/// a partner phi in the preheader (ids taken from `phi_ids`, in phi order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLoopPreheader {
    pub loop_block_id: Id,
    pub fresh_id: Id,
    pub phi_ids: Vec<Id>,
}

impl AddLoopPreheader {
    pub fn is_applicable(&self, ctx: &IrContext, _tc: &TransformationContext) -> bool {
        if !ctx.structured_cfg().is_loop_header(self.loop_block_id)
            || !ctx.is_reachable(self.loop_block_id)
        {
            return false;
        }
        let Some(function) = ctx.function_of_block(self.loop_block_id) else {
            return false;
        };
        if function.entry().map(|b| b.label) == Some(self.loop_block_id) {
            return false;
        }

        let outside = outside_predecessors(ctx, self.loop_block_id);
        if outside.is_empty() {
            return false;
        }
        let mut ids = vec![self.fresh_id];
        if outside.len() > 1 {
            let num_phis = ctx
                .block(self.loop_block_id)
                .map_or(0, |b| b.phis().count());
            if self.phi_ids.len() < num_phis {
                return false;
            }
            ids.extend(self.phi_ids.iter().take(num_phis));
        }
        util::ids_are_fresh_and_distinct(ctx, &ids)
    }

    pub fn apply(&self, ctx: &mut IrContext, _tc: &mut TransformationContext) {
        let header = self.loop_block_id;
        let outside = outside_predecessors(ctx, header);
        let needs_phis = outside.len() > 1;

        let module = ctx.module_mut();
        let function = module
            .function_containing_block_mut(header)
            .expect("loop header must exist");

        let mut preheader = BasicBlock::new(self.fresh_id);
        let header_block = function.block_mut(header).expect("loop header must exist");
        let num_phis = header_block.phis().count();
        for (phi_index, phi) in header_block.instructions[..num_phis].iter_mut().enumerate() {
            let (from_outside, from_inside): (Vec<(Id, Id)>, Vec<(Id, Id)>) = phi
                .phi_pairs()
                .into_iter()
                .partition(|(_, pred)| outside.contains(pred));

            let incoming = if needs_phis {
                let phi_id = self.phi_ids[phi_index];
                let ty = phi.result_type.expect("phi must have a type");
                preheader.add_instruction(Instruction::phi(ty, phi_id, &from_outside));
                phi_id
            } else {
                from_outside[0].0
            };

            phi.operands.clear();
            for (value, pred) in std::iter::once((incoming, self.fresh_id)).chain(from_inside) {
                phi.operands.push(Operand::Id(value));
                phi.operands.push(Operand::Id(pred));
            }
        }
        preheader.add_instruction(Instruction::branch(header));

        for pred in &outside {
            if let Some(block) = function.block_mut(*pred) {
                if let Some(terminator) = block.terminator_mut() {
                    terminator.replace_label(header, self.fresh_id);
                }
            }
        }
        // Constructs that merged at the header now merge at the preheader
        for block in &mut function.blocks {
            let len = block.instructions.len();
            if len >= 2 && block.label != header {
                let merge = &mut block.instructions[len - 2];
                if merge.opcode.is_merge() && merge.id_operand(0) == Some(header) {
                    merge.set_operand(0, Operand::Id(self.fresh_id));
                }
            }
        }
        function.insert_block_before(header, preheader);

        module.update_id_bound(self.fresh_id);
        if needs_phis {
            for id in self.phi_ids.iter().take(num_phis) {
                module.update_id_bound(*id);
            }
        }
    }
}

/// Predecessors of a loop header that are not back-edge blocks
fn outside_predecessors(ctx: &IrContext, header: Id) -> Vec<Id> {
    ctx.predecessors(header)
        .iter()
        .copied()
        .filter(|pred| !ctx.block_dominates(header, *pred))
        .collect()
}
