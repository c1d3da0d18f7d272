use morph_ir::types::width_mask;
use morph_ir::{Id, Opcode};
use tracing::trace;

use super::{all_block_labels, FuzzerPassContext};
use crate::transformation::{AddLoopToCreateIntConstantSynonym, MAX_LOOP_ITERATIONS};

/// Largest magnitude of a randomly chosen step
const MAX_STEP: i64 = 16;

/// Insert counting loops whose result equals an existing integer constant
/// before randomly chosen blocks
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx
        .fuzzer_context
        .chances()
        .adding_loop_to_create_int_constant_synonym;
    if ctx.ir.find_bool_type().is_none() {
        return;
    }

    let blocks: Vec<Id> = all_block_labels(ctx.ir)
        .into_iter()
        .filter(|label| {
            ctx.ir.predecessors(*label).len() == 1
                && ctx.ir.is_reachable(*label)
                && !ctx.ir.structured_cfg().is_merge_block(*label)
        })
        .collect();

    for block in blocks {
        if !ctx.fuzzer_context.choose_percentage(chance) {
            continue;
        }
        let constants = scalar_int_constants(ctx);
        if constants.is_empty() {
            return;
        }
        let (constant_id, type_id, width, value) = *ctx.fuzzer_context.choose(&constants);

        let num_iterations = 1 + i64::from(
            ctx.fuzzer_context
                .random_u32_below(MAX_LOOP_ITERATIONS as u32),
        );
        let step =
            i64::from(ctx.fuzzer_context.random_u32_below(2 * MAX_STEP as u32 + 1)) - MAX_STEP;
        // I = C + S * N, so the loop leaves I - S * N = C behind
        let Some(initial) = step
            .checked_mul(num_iterations)
            .and_then(|product| value.checked_add(product))
            .filter(|initial| fits_in_width(*initial, width))
        else {
            trace!(constant = constant_id.0, "Loop initial value overflows");
            continue;
        };

        let (Some(initial_val_id), Some(step_val_id)) = (
            ctx.find_or_create_constant_of_type(type_id, initial as u64 & width_mask(width), false),
            ctx.find_or_create_constant_of_type(type_id, step as u64 & width_mask(width), false),
        ) else {
            continue;
        };
        // The loop counter counts in 32-bit signed integers
        let counter_constants = [0, 1, num_iterations as u64]
            .map(|bits| ctx.find_or_create_int_constant(bits, 32, true, false));
        let [Some(_), Some(_), Some(num_iterations_id)] = counter_constants else {
            continue;
        };

        let additional_block_id = ctx
            .ir
            .structured_cfg()
            .is_continue_block(block)
            .then(|| ctx.fuzzer_context.fresh_id());
        let ids = ctx.fuzzer_context.fresh_ids(7);
        ctx.maybe_apply_transformation(AddLoopToCreateIntConstantSynonym {
            constant_id,
            initial_val_id,
            step_val_id,
            num_iterations_id,
            block_after_loop_id: block,
            syn_id: ids[0],
            loop_id: ids[1],
            ctr_id: ids[2],
            temp_id: ids[3],
            eventual_syn_id: ids[4],
            incremented_ctr_id: ids[5],
            cond_id: ids[6],
            additional_block_id,
        });
    }
}

/// `(id, type, width, sign-extended value)` of each relevant scalar integer
/// constant of at most 64 bits
fn scalar_int_constants(ctx: &FuzzerPassContext<'_>) -> Vec<(Id, Id, u32, i64)> {
    let ir = &*ctx.ir;
    let facts = &ctx.transformation_context.fact_manager;
    ir.module()
        .globals
        .iter()
        .filter(|inst| inst.opcode == Opcode::Constant)
        .filter_map(|inst| {
            let (id, type_id) = (inst.result_id?, inst.result_type?);
            let (width, _) = ir.get_type(type_id)?.as_int()?;
            let value = ir.find_declared_constant(id)?.sign_extended_value()?;
            (width <= 64 && !facts.id_is_irrelevant(id)).then_some((id, type_id, width, value))
        })
        .collect()
}

/// Whether `value` survives truncation to `width` bits and sign extension
fn fits_in_width(value: i64, width: u32) -> bool {
    if width >= 64 {
        return true;
    }
    let half = 1i64 << (width - 1);
    (-half..half).contains(&value)
}
