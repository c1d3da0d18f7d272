use morph_ir::{BasicBlock, Id, Opcode};

use super::FuzzerPassContext;
use crate::descriptors::make_instruction_descriptor;
use crate::transformation::{MergeFunctionReturns, ReturnMergingInfo, SplitBlock};
use crate::util;

/// Give randomly chosen functions with several returns a single return
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx.fuzzer_context.chances().merging_function_returns;
    let functions: Vec<Id> = ctx.ir.module().functions.iter().map(|f| f.id).collect();

    for function_id in functions {
        if util::reachable_return_blocks(ctx.ir, function_id).len() < 2
            || !ctx.fuzzer_context.choose_percentage(chance)
        {
            continue;
        }

        prepare_entry_block(ctx, function_id);
        let merge_blocks = prepare_merge_blocks(ctx, function_id);

        let Some(function) = ctx.ir.function(function_id) else {
            continue;
        };
        let return_type = function.return_type;
        let returns_value = ctx.ir.get_type(return_type).is_some_and(|ty| !ty.is_void());

        let any_returnable_val_id = if returns_value {
            ctx.find_or_create_constant_of_type(return_type, 0, true)
        } else {
            None
        };

        let available = util::available_ids_after_entry_block(ctx.ir, function_id);
        let mut returns_merging_info = Vec::with_capacity(merge_blocks.len());
        for merge_block_id in merge_blocks {
            let opphi_to_suitable_id = ctx
                .ir
                .block(merge_block_id)
                .map(|block| {
                    block
                        .phis()
                        .filter_map(|phi| {
                            let suitable = available.get(&phi.result_type?)?;
                            Some((phi.result_id?, *suitable))
                        })
                        .collect()
                })
                .unwrap_or_default();
            returns_merging_info.push(ReturnMergingInfo {
                merge_block_id,
                is_returning_id: ctx.fuzzer_context.fresh_id(),
                maybe_return_val_id: returns_value.then(|| ctx.fuzzer_context.fresh_id()),
                opphi_to_suitable_id,
            });
        }

        let outer_header_id = ctx.fuzzer_context.fresh_id();
        let outer_return_id = ctx.fuzzer_context.fresh_id();
        let return_val_id = returns_value.then(|| ctx.fuzzer_context.fresh_id());
        ctx.maybe_apply_transformation(MergeFunctionReturns {
            function_id,
            outer_header_id,
            outer_return_id,
            return_val_id,
            any_returnable_val_id,
            returns_merging_info,
        });
    }
}

/// The entry block must end in an unconditional branch and head no
/// construct; split it after its variables otherwise
fn prepare_entry_block(ctx: &mut FuzzerPassContext<'_>, function_id: Id) {
    let Some(entry) = ctx.ir.function(function_id).and_then(|f| f.entry()) else {
        return;
    };
    let conforms = entry.merge_instruction().is_none()
        && entry.terminator().is_some_and(|t| t.opcode == Opcode::Branch);
    if conforms {
        return;
    }
    let label = entry.label;
    let index = entry
        .instructions
        .iter()
        .position(|inst| !matches!(inst.opcode, Opcode::Phi | Opcode::Variable))
        .unwrap_or(0);
    split_before(ctx, label, index);
}

/// Merge blocks of the loops that returns break out of, split so that each
/// holds only phis and a branch
fn prepare_merge_blocks(ctx: &mut FuzzerPassContext<'_>, function_id: Id) -> Vec<Id> {
    let mut merge_blocks = Vec::new();
    for label in util::reachable_return_blocks(ctx.ir, function_id) {
        let mut current = ctx.ir.structured_cfg().loop_merge_block(label);
        while let Some(merge_block) = current {
            if merge_blocks.contains(&merge_block) {
                break;
            }
            merge_blocks.push(merge_block);
            current = ctx.ir.structured_cfg().loop_merge_block(merge_block);
        }
    }

    for merge_block in &merge_blocks {
        let Some(block) = ctx.ir.block(*merge_block) else {
            continue;
        };
        if !only_phis_and_branch(block) {
            let index = block.first_non_phi_index();
            split_before(ctx, *merge_block, index);
        }
    }
    merge_blocks
}

fn only_phis_and_branch(block: &BasicBlock) -> bool {
    let index = block.first_non_phi_index();
    index + 1 == block.len()
        && block.terminator().is_some_and(|t| t.opcode == Opcode::Branch)
}

fn split_before(ctx: &mut FuzzerPassContext<'_>, label: Id, index: usize) {
    let Some(instruction_to_split_before) = make_instruction_descriptor(ctx.ir, label, index) else {
        return;
    };
    let fresh_id = ctx.fuzzer_context.fresh_id();
    ctx.maybe_apply_transformation(SplitBlock {
        instruction_to_split_before,
        fresh_id,
    });
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run_pass;
    use super::super::FuzzerPass;
    use super::*;
    use crate::test_modules as tm;
    use crate::transformation::Transformation;
    use morph_ir::IrContext;

    #[test]
    fn test_returns_are_merged() {
        let mut ir = IrContext::new(tm::all_features());
        let mut tc = tm::transformation_context();
        let sequence = run_pass(FuzzerPass::MergeFunctionReturns, &mut ir, &mut tc, 13);

        let merged: Vec<Id> = sequence
            .iter()
            .filter_map(|t| match t {
                Transformation::MergeFunctionReturns(m) => Some(m.function_id),
                _ => None,
            })
            .collect();
        assert_eq!(merged, vec![tm::RET_FN, tm::RETV_FN]);
        for function in merged {
            assert_eq!(util::reachable_return_blocks(&ir, function).len(), 1);
        }
        // Functions with a single return are left alone
        assert_eq!(util::reachable_return_blocks(&ir, tm::MAIN), vec![tm::MERGE_BLOCK]);
    }

    #[test]
    fn test_merge_block_with_code_is_split() {
        let mut module = tm::loop_with_returns(false);
        let merge = Id(tm::RET_BASE + 4);
        let function = module.function_mut(tm::RET_FN).unwrap();
        let block = function.block_mut(merge).unwrap();
        block.instructions.insert(
            0,
            morph_ir::Instruction::binary(Opcode::IAdd, tm::INT, Id(80), tm::INT_ONE, tm::INT_ONE),
        );
        module.recompute_id_bound();
        let mut ir = IrContext::new(module);
        let mut tc = tm::transformation_context();

        let sequence = run_pass(FuzzerPass::MergeFunctionReturns, &mut ir, &mut tc, 13);

        assert!(matches!(sequence.iter().next(), Some(Transformation::SplitBlock(_))));
        assert!(sequence
            .iter()
            .any(|t| matches!(t, Transformation::MergeFunctionReturns(_))));
        assert_eq!(util::reachable_return_blocks(&ir, tm::RET_FN).len(), 1);
    }
}
