use std::collections::BTreeSet;

use morph_ir::Id;

use super::{all_block_labels, FuzzerPassContext};
use crate::transformation::AddOpPhiSynonym;
use crate::util;

/// At the start of random blocks, merge one member of a synonym class per
/// incoming edge into a new phi
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx.fuzzer_context.chances().adding_opphi_synonym;

    for label in all_block_labels(ctx.ir) {
        let preds = ctx.ir.predecessors(label).to_vec();
        if preds.is_empty() || !ctx.fuzzer_context.choose_percentage(chance) {
            continue;
        }
        let options = synonym_options(ctx, &preds);
        if options.is_empty() {
            continue;
        }
        let per_pred = ctx.fuzzer_context.choose(&options).clone();
        let pred_to_id = preds
            .iter()
            .zip(&per_pred)
            .map(|(pred, ids)| (*pred, *ctx.fuzzer_context.choose(ids)))
            .collect();
        let fresh_id = ctx.fuzzer_context.fresh_id();
        ctx.maybe_apply_transformation(AddOpPhiSynonym {
            block_id: label,
            pred_to_id,
            fresh_id,
        });
    }
}

/// For each synonym class usable on every edge, the members available at
/// the end of each predecessor, in predecessor order
fn synonym_options(ctx: &FuzzerPassContext<'_>, preds: &[Id]) -> Vec<Vec<Vec<Id>>> {
    let ir = &*ctx.ir;
    let facts = &ctx.transformation_context.fact_manager;
    let mut seen_classes: BTreeSet<Id> = BTreeSet::new();
    let mut options = Vec::new();

    for id in facts.get_ids_for_which_synonyms_are_known() {
        let Some(type_id) = ir.type_id_of(id) else {
            continue;
        };
        let class: BTreeSet<Id> = std::iter::once(id)
            .chain(
                facts
                    .get_synonyms_for_id(id)
                    .into_iter()
                    .filter(|d| d.index.is_empty())
                    .map(|d| d.object),
            )
            .filter(|member| ir.type_id_of(*member) == Some(type_id))
            .filter(|member| !facts.id_is_irrelevant(*member))
            .collect();
        // One option per class, keyed by its smallest member
        let Some(key) = class.first() else {
            continue;
        };
        if !seen_classes.insert(*key) {
            continue;
        }

        let per_pred: Vec<Vec<Id>> = preds
            .iter()
            .map(|pred| {
                class
                    .iter()
                    .copied()
                    .filter(|member| util::id_is_available_at_end_of_block(ir, *pred, *member))
                    .collect()
            })
            .collect();
        if per_pred.iter().all(|ids: &Vec<Id>| !ids.is_empty()) {
            options.push(per_pred);
        }
    }
    options
}
