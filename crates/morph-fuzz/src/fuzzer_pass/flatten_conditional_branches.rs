use morph_ir::Id;

use super::{all_block_labels, FuzzerPassContext};
use crate::descriptors::make_instruction_descriptor;
use crate::transformation::{instructions_to_enclose, FlattenConditionalBranch};

/// Flatten randomly chosen selections, innermost first so that flattening an
/// inner selection can make its enclosing one flattenable
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx.fuzzer_context.chances().flattening_conditional_branch;
    let mut headers: Vec<Id> = all_block_labels(ctx.ir)
        .into_iter()
        .filter(|label| ctx.ir.block(*label).is_some_and(|b| b.is_selection_header()))
        .collect();
    let scfg = ctx.ir.structured_cfg();
    headers.sort_by_key(|header| std::cmp::Reverse(scfg.nesting_depth(*header)));

    for header in headers {
        if !ctx.fuzzer_context.choose_percentage(chance) {
            continue;
        }
        let Some(to_enclose) = instructions_to_enclose(ctx.ir, header) else {
            continue;
        };
        let mut instructions_to_fresh_ids = Vec::with_capacity(to_enclose.len());
        for (block, index, needed) in to_enclose {
            let Some(descriptor) = make_instruction_descriptor(ctx.ir, block, index) else {
                continue;
            };
            instructions_to_fresh_ids.push((descriptor, ctx.fuzzer_context.fresh_ids(needed)));
        }
        ctx.maybe_apply_transformation(FlattenConditionalBranch {
            header_block_id: header,
            instructions_to_fresh_ids,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run_pass;
    use super::super::FuzzerPass;
    use crate::test_modules as tm;
    use crate::transformation::Transformation;
    use morph_ir::IrContext;

    #[test]
    fn test_flattens_diamond() {
        let mut ir = IrContext::new(tm::diamond_with_store());
        let mut tc = tm::transformation_context();
        let sequence = run_pass(FuzzerPass::FlattenConditionalBranches, &mut ir, &mut tc, 7);

        assert!(sequence
            .iter()
            .any(|t| matches!(
                t,
                Transformation::FlattenConditionalBranch(f) if f.header_block_id == tm::ENTRY
            )));
        assert!(!ir.block(tm::ENTRY).unwrap().is_selection_header());
    }

    #[test]
    fn test_loops_are_left_alone() {
        let mut ir = IrContext::new(tm::loop_with_returns(false));
        let mut tc = tm::transformation_context();
        let sequence = run_pass(FuzzerPass::FlattenConditionalBranches, &mut ir, &mut tc, 7);
        assert!(sequence.is_empty());
    }
}
