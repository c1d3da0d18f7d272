use morph_ir::{Id, IrContext, Opcode};

use super::add_loop_preheaders::has_dedicated_preheader;
use super::FuzzerPassContext;
use crate::descriptors::make_instruction_descriptor;
use crate::region;
use crate::transformation::{
    region_input_ids, region_output_ids, AddLoopPreheader, OutlineFunction, SplitBlock,
};
use crate::util;

/// Move randomly chosen single-entry/single-exit regions into new functions
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx.fuzzer_context.chances().outlining_function;
    let functions: Vec<Id> = ctx.ir.module().functions.iter().map(|f| f.id).collect();

    for function_id in functions {
        if !ctx.fuzzer_context.choose_percentage(chance) {
            continue;
        }
        let blocks: Vec<Id> = ctx
            .ir
            .function(function_id)
            .map(|f| f.blocks.iter().map(|b| b.label).collect())
            .unwrap_or_default();
        let blocks: Vec<Id> = blocks.into_iter().filter(|b| ctx.ir.is_reachable(*b)).collect();
        if blocks.is_empty() {
            continue;
        }
        let chosen = *ctx.fuzzer_context.choose(&blocks);
        let Some(entry) = suitable_entry_block(ctx, chosen) else {
            continue;
        };

        let exits = candidate_exit_blocks(ctx.ir, function_id, entry);
        if exits.is_empty() {
            continue;
        }
        let chosen_exit = *ctx.fuzzer_context.choose(&exits);
        let Some(exit) = suitable_exit_block(ctx, chosen_exit) else {
            continue;
        };

        let region = region::outline_region(ctx.ir, entry, exit);
        let inputs = region_input_ids(ctx.ir, &region, exit);
        let outputs = region_output_ids(ctx.ir, &region, exit);
        let input_id_to_fresh_id = inputs
            .into_iter()
            .map(|id| (id, ctx.fuzzer_context.fresh_id()))
            .collect();
        let output_id_to_fresh_id = outputs
            .into_iter()
            .map(|id| (id, ctx.fuzzer_context.fresh_id()))
            .collect();
        let ids = ctx.fuzzer_context.fresh_ids(6);
        ctx.maybe_apply_transformation(OutlineFunction {
            entry_block: entry,
            exit_block: exit,
            new_function_struct_return_type_id: ids[0],
            new_function_type_id: ids[1],
            new_function_id: ids[2],
            new_function_region_entry_block: ids[3],
            new_caller_result_id: ids[4],
            new_callee_result_id: ids[5],
            input_id_to_fresh_id,
            output_id_to_fresh_id,
        });
    }
}

/// A region may not start at a loop header or with phis and variables.
/// Loop headers are replaced by their preheader, created if needed, and the
/// block is split after any leading phis and variables.
fn suitable_entry_block(ctx: &mut FuzzerPassContext<'_>, block: Id) -> Option<Id> {
    let mut entry = block;
    if ctx.ir.structured_cfg().is_loop_header(entry) {
        if !has_dedicated_preheader(ctx.ir, entry) {
            let num_phis = ctx.ir.block(entry).map_or(0, |b| b.phis().count());
            let fresh_id = ctx.fuzzer_context.fresh_id();
            let phi_ids = ctx.fuzzer_context.fresh_ids(num_phis);
            if !ctx.maybe_apply_transformation(AddLoopPreheader {
                loop_block_id: entry,
                fresh_id,
                phi_ids,
            }) {
                return None;
            }
        }
        entry = util::find_loop_preheader(ctx.ir, entry)?;
    }

    let index = ctx
        .ir
        .block(entry)?
        .instructions
        .iter()
        .position(|inst| !matches!(inst.opcode, Opcode::Phi | Opcode::Variable))?;
    if index == 0 {
        return Some(entry);
    }
    split_before(ctx, entry, index)
}

/// Blocks that post-dominate `entry` and that `entry` dominates, nearest
/// first, `entry` included
fn candidate_exit_blocks(ir: &IrContext, function_id: Id, entry: Id) -> Vec<Id> {
    let Some(post_dominators) = ir.post_dominators(function_id) else {
        return Vec::new();
    };
    let scfg = ir.structured_cfg();
    let mut exits = Vec::new();
    let mut current = Some(entry);
    while let Some(block) = current {
        if ir.block(block).is_some()
            && !scfg.is_continue_block(block)
            && ir.block_dominates(entry, block)
        {
            exits.push(block);
        }
        current = post_dominators.immediate_dominator(block);
    }
    exits
}

/// A merge block cannot end a region on its own; split it after its phis
/// and end the region at the second half
fn suitable_exit_block(ctx: &mut FuzzerPassContext<'_>, block: Id) -> Option<Id> {
    if !ctx.ir.structured_cfg().is_merge_block(block) {
        return Some(block);
    }
    let index = ctx.ir.block(block)?.first_non_phi_index();
    split_before(ctx, block, index)
}

/// Split `block` before instruction `index`; the label of the second half
fn split_before(ctx: &mut FuzzerPassContext<'_>, block: Id, index: usize) -> Option<Id> {
    let instruction_to_split_before = make_instruction_descriptor(ctx.ir, block, index)?;
    let fresh_id = ctx.fuzzer_context.fresh_id();
    ctx.maybe_apply_transformation(SplitBlock {
        instruction_to_split_before,
        fresh_id,
    })
    .then_some(fresh_id)
}
