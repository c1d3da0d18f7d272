use morph_ir::{Id, IrContext};

use super::{all_block_labels, FuzzerPassContext};
use crate::transformation::AddLoopPreheader;
use crate::util;

/// Give randomly chosen loops a dedicated preheader
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx.fuzzer_context.chances().adding_loop_preheader;
    let headers: Vec<Id> = all_block_labels(ctx.ir)
        .into_iter()
        .filter(|label| ctx.ir.structured_cfg().is_loop_header(*label))
        .collect();

    for header in headers {
        if has_dedicated_preheader(ctx.ir, header) || !ctx.fuzzer_context.choose_percentage(chance)
        {
            continue;
        }
        let num_phis = ctx.ir.block(header).map_or(0, |b| b.phis().count());
        let fresh_id = ctx.fuzzer_context.fresh_id();
        let phi_ids = ctx.fuzzer_context.fresh_ids(num_phis);
        ctx.maybe_apply_transformation(AddLoopPreheader {
            loop_block_id: header,
            fresh_id,
            phi_ids,
        });
    }
}

/// The only way into the loop is a block that does nothing but enter it
pub(super) fn has_dedicated_preheader(ir: &IrContext, header: Id) -> bool {
    util::find_loop_preheader(ir, header)
        .is_some_and(|pred| ir.successors(pred) == [header].as_slice())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run_pass;
    use super::super::FuzzerPass;
    use super::*;
    use crate::test_modules as tm;
    use crate::transformation::Transformation;

    #[test]
    fn test_loop_with_two_entries_gets_preheader() {
        let mut ir = IrContext::new(tm::loop_with_two_entries());
        let mut tc = tm::transformation_context();
        assert!(!has_dedicated_preheader(&ir, tm::PRE_HEADER));

        let sequence = run_pass(FuzzerPass::AddLoopPreheaders, &mut ir, &mut tc, 5);

        assert_eq!(sequence.len(), 1);
        let Some(Transformation::AddLoopPreheader(t)) = sequence.iter().next() else {
            panic!("expected a preheader record");
        };
        assert_eq!(t.phi_ids.len(), 1);
        assert_eq!(util::find_loop_preheader(&ir, tm::PRE_HEADER), Some(t.fresh_id));
        assert!(has_dedicated_preheader(&ir, tm::PRE_HEADER));
    }

    #[test]
    fn test_existing_preheader_is_kept() {
        let mut ir = IrContext::new(tm::loop_with_returns(false));
        let mut tc = tm::transformation_context();
        let sequence = run_pass(FuzzerPass::AddLoopPreheaders, &mut ir, &mut tc, 5);
        assert!(sequence.is_empty());
    }
}
