use morph_ir::{Id, Instruction, InstructionLocation, IrContext};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::descriptors::{find_instruction, InstructionDescriptor};
use crate::fact_manager::DataDescriptor;
use crate::util;

/// Insert `fresh_id = CopyObject existing_id` before an instruction and
/// record the two as synonyms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddCopyObjectSynonym {
    pub existing_id: Id,
    pub insert_before: InstructionDescriptor,
    pub fresh_id: Id,
}

impl AddCopyObjectSynonym {
    pub fn is_applicable(&self, ctx: &IrContext, tc: &TransformationContext) -> bool {
        if !util::is_fresh_id(ctx, self.fresh_id) {
            return false;
        }
        if tc.fact_manager.id_is_irrelevant(self.existing_id) {
            return false;
        }
        let Some(inst) = ctx.get_def(self.existing_id) else {
            return false;
        };
        if inst.opcode.is_type_declaration() {
            return false;
        }
        match ctx.type_of(self.existing_id) {
            Some(ty) if !ty.is_pointer() && !ty.is_void() && !ty.is_opaque() => {}
            _ => return false,
        }

        let Some(InstructionLocation::Block {
            function, block, index,
        }) = find_instruction(&self.insert_before, ctx)
        else {
            return false;
        };
        let label = ctx.module().functions[function].blocks[block].label;
        util::can_insert_before(ctx, label, index)
            && util::id_is_available_before_instruction(ctx, label, index, self.existing_id)
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let Some(InstructionLocation::Block {
            function, block, index,
        }) = find_instruction(&self.insert_before, ctx)
        else {
            panic!("insertion point must be a block instruction");
        };
        let type_id = ctx
            .type_id_of(self.existing_id)
            .expect("copied id must have a type");

        let module = ctx.module_mut();
        module.functions[function].blocks[block].instructions.insert(
            index,
            Instruction::copy_object(type_id, self.fresh_id, self.existing_id),
        );
        module.update_id_bound(self.fresh_id);

        tc.fact_manager.add_fact_data_synonym(
            DataDescriptor::whole(self.fresh_id),
            DataDescriptor::whole(self.existing_id),
            ctx,
        );
    }
}
