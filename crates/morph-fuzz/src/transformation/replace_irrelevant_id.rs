use morph_ir::{Id, Instruction, IrContext, Opcode, Operand};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::descriptors::{find_instruction_containing_use, IdUseDescriptor};
use crate::util;

/// Replace one use of an irrelevant id with another id of the same type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceIrrelevantId {
    pub id_use_descriptor: IdUseDescriptor,
    pub replacement_id: Id,
}

impl ReplaceIrrelevantId {
    pub fn is_applicable(&self, ctx: &IrContext, tc: &TransformationContext) -> bool {
        let id = self.id_use_descriptor.id_of_interest;
        if !tc.fact_manager.id_is_irrelevant(id) || id == self.replacement_id {
            return false;
        }
        let Some(location) = find_instruction_containing_use(&self.id_use_descriptor, ctx) else {
            return false;
        };

        let Some(type_id) = ctx.type_id_of(id) else {
            return false;
        };
        if ctx.type_id_of(self.replacement_id) != Some(type_id) {
            return false;
        }
        if ctx.get_type(type_id).map_or(true, |ty| ty.is_pointer()) {
            return false;
        }

        let operand_index = self.id_use_descriptor.in_operand_index as usize;
        let Some(inst) = ctx.module().instruction(location) else {
            return false;
        };
        use_can_be_replaced(inst, operand_index)
            && util::id_is_available_at_use(ctx, location, operand_index, self.replacement_id)
    }

    pub fn apply(&self, ctx: &mut IrContext, _tc: &mut TransformationContext) {
        let location = find_instruction_containing_use(&self.id_use_descriptor, ctx)
            .expect("use must exist");
        let inst = ctx
            .module_mut()
            .instruction_mut(location)
            .expect("use must exist");
        inst.set_operand(
            self.id_use_descriptor.in_operand_index as usize,
            Operand::Id(self.replacement_id),
        );
    }
}

/// Whether operand `index` of `inst` may hold any value of the right type
fn use_can_be_replaced(inst: &Instruction, index: usize) -> bool {
    if inst.opcode.operand_is_label(index) || inst.opcode.is_merge() {
        return false;
    }
    match inst.opcode {
        // The callee is not a value
        Opcode::FunctionCall => index > 0,
        // Indices into structs must stay constant
        Opcode::AccessChain => index == 0,
        Opcode::Variable => false,
        _ => true,
    }
}
