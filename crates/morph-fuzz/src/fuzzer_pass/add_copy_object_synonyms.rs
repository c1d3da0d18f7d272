use morph_ir::{Id, IrContext};

use super::FuzzerPassContext;
use crate::descriptors::make_instruction_descriptor;
use crate::transformation::AddCopyObjectSynonym;
use crate::util;

/// Before randomly chosen instructions, copy a random available value
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx.fuzzer_context.chances().adding_copy_object_synonym;
    let functions: Vec<Id> = ctx.ir.module().functions.iter().map(|f| f.id).collect();

    for function in functions {
        let labels: Vec<Id> = ctx
            .ir
            .function(function)
            .map(|f| f.blocks.iter().map(|b| b.label).collect())
            .unwrap_or_default();
        for label in labels {
            let mut index = 0;
            while index < ctx.ir.block(label).map_or(0, |b| b.len()) {
                if util::can_insert_before(ctx.ir, label, index)
                    && ctx.fuzzer_context.choose_percentage(chance)
                {
                    let candidates = copyable_ids(ctx, function, label, index);
                    if !candidates.is_empty() {
                        let existing_id = *ctx.fuzzer_context.choose(&candidates);
                        let insert_before = make_instruction_descriptor(ctx.ir, label, index)
                            .expect("index is inside the block");
                        let fresh_id = ctx.fuzzer_context.fresh_id();
                        if ctx.maybe_apply_transformation(AddCopyObjectSynonym {
                            existing_id,
                            insert_before,
                            fresh_id,
                        }) {
                            // Step over the copy
                            index += 1;
                        }
                    }
                }
                index += 1;
            }
        }
    }
}

fn copyable_ids(ctx: &FuzzerPassContext<'_>, function: Id, label: Id, index: usize) -> Vec<Id> {
    let ir: &IrContext = &*ctx.ir;
    let facts = &ctx.transformation_context.fact_manager;
    util::value_ids_in_function(ir, function)
        .into_iter()
        .filter(|id| !facts.id_is_irrelevant(*id))
        .filter(|id| {
            ir.type_of(*id)
                .is_some_and(|ty| !ty.is_pointer() && !ty.is_opaque())
        })
        .filter(|id| util::id_is_available_before_instruction(ir, label, index, *id))
        .collect()
}
