use morph_ir::{Id, InstructionLocation};

use super::FuzzerPassContext;
use crate::descriptors::{
    find_instruction_containing_use, make_instruction_descriptor, IdUseDescriptor,
};
use crate::transformation::ReplaceIrrelevantId;
use crate::util;

/// Replace uses of irrelevant ids with other available ids of the same type
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx.fuzzer_context.chances().replacing_irrelevant_id;

    // Replacing an operand moves no instruction, so descriptors built up
    // front stay valid for the whole pass
    let mut candidate_uses: Vec<(IdUseDescriptor, Id)> = Vec::new();
    for id in ctx.transformation_context.fact_manager.get_irrelevant_ids() {
        for usage in ctx.ir.def_use().uses(id) {
            let InstructionLocation::Block {
                function,
                block,
                index,
            } = usage.location
            else {
                continue;
            };
            let f = &ctx.ir.module().functions[function];
            let label = f.blocks[block].label;
            if let Some(descriptor) = make_instruction_descriptor(ctx.ir, label, index) {
                candidate_uses.push((
                    IdUseDescriptor::new(id, descriptor, usage.operand_index as u32),
                    f.id,
                ));
            }
        }
    }

    for (id_use_descriptor, function) in candidate_uses {
        if !ctx.fuzzer_context.choose_percentage(chance) {
            continue;
        }
        let replacements = replacement_candidates(ctx, &id_use_descriptor, function);
        if replacements.is_empty() {
            continue;
        }
        let replacement_id = *ctx.fuzzer_context.choose(&replacements);
        ctx.maybe_apply_transformation(ReplaceIrrelevantId {
            id_use_descriptor,
            replacement_id,
        });
    }
}

fn replacement_candidates(
    ctx: &FuzzerPassContext<'_>,
    id_use: &IdUseDescriptor,
    function: Id,
) -> Vec<Id> {
    let ir = &*ctx.ir;
    let Some(location) = find_instruction_containing_use(id_use, ir) else {
        return Vec::new();
    };
    let Some(type_id) = ir.type_id_of(id_use.id_of_interest) else {
        return Vec::new();
    };
    let operand_index = id_use.in_operand_index as usize;
    util::value_ids_in_function(ir, function)
        .into_iter()
        .filter(|id| *id != id_use.id_of_interest && ir.type_id_of(*id) == Some(type_id))
        .filter(|id| util::id_is_available_at_use(ir, location, operand_index, *id))
        .collect()
}
