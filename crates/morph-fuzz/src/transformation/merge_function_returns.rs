use std::cmp::Reverse;
use std::collections::HashMap;

use morph_ir::{BasicBlock, Id, Instruction, InstructionLocation, IrContext, Opcode, Operand};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::id_allocator::has_enough_overflow_ids;
use crate::util;

/// Ids for one loop merge block that a return now flows through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnMergingInfo {
    pub merge_block_id: Id,
    /// Result of the new boolean phi telling whether the function is returning
    pub is_returning_id: Id,
    /// Result of the new phi carrying the return value; non-void functions only
    pub maybe_return_val_id: Option<Id>,
    /// `(existing phi, placeholder)` pairs used to extend the block's phis for
    /// its new predecessors
    pub opphi_to_suitable_id: Vec<(Id, Id)>,
}

impl ReturnMergingInfo {
    fn suitable_id_for(&self, phi: Id) -> Option<Id> {
        self.opphi_to_suitable_id
            .iter()
            .find(|(from, _)| *from == phi)
            .map(|(_, to)| *to)
    }
}

/// Give a function a single return by wrapping its body in a loop that runs
/// once. Every return becomes a break out of its innermost loop; loop merge
/// blocks on the way out test an "is returning" flag and keep breaking
/// outwards until control reaches the new outer merge block, which returns.
///
/// Merge blocks without an entry in `returns_merging_info` take their ids
/// from the overflow pool and their phi placeholders from the values
/// available right after the entry block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeFunctionReturns {
    pub function_id: Id,
    pub outer_header_id: Id,
    pub outer_return_id: Id,
    pub return_val_id: Option<Id>,
    pub any_returnable_val_id: Option<Id>,
    pub returns_merging_info: Vec<ReturnMergingInfo>,
}

/// The shape of the function, independent of the ids in the record
struct Layout {
    entry: Id,
    block_after_entry: Id,
    /// `None` for void functions
    return_type: Option<Id>,
    /// Reachable returning blocks with their return value, in layout order
    returns: Vec<(Id, Option<Id>)>,
    /// Merge blocks of loops a return breaks out of, innermost first
    merge_blocks: Vec<Id>,
}

#[derive(Clone, Copy)]
struct MergeIds {
    is_returning: Id,
    return_val: Option<Id>,
}

/// One edge into a merge block along which the function may be returning
#[derive(Clone, Copy)]
struct Incoming {
    pred: Id,
    value: Option<Id>,
    is_returning: Id,
}

impl MergeFunctionReturns {
    pub fn is_applicable(&self, ctx: &IrContext, tc: &TransformationContext) -> bool {
        let Some(layout) = self.analyze(ctx) else {
            return false;
        };
        let facts = &tc.fact_manager;
        if util::find_bool_constant(ctx, facts, true, false).is_none()
            || util::find_bool_constant(ctx, facts, false, false).is_none()
        {
            return false;
        }

        let mut fresh = vec![self.outer_header_id, self.outer_return_id];
        if layout.return_type.is_some() {
            let Some(return_val_id) = self.return_val_id else {
                return false;
            };
            fresh.push(return_val_id);
            if self.returnable_value(ctx, &layout).is_none() {
                return false;
            }
        }

        let infos = self.info_by_merge_block();
        let available = util::available_ids_after_entry_block(ctx, self.function_id);
        let mut overflow_ids_needed = 0;
        for merge_block in &layout.merge_blocks {
            let info = infos.get(merge_block).copied();
            match info {
                Some(info) => {
                    fresh.push(info.is_returning_id);
                    if layout.return_type.is_some() {
                        let Some(id) = info.maybe_return_val_id else {
                            return false;
                        };
                        fresh.push(id);
                    }
                }
                None => overflow_ids_needed += if layout.return_type.is_some() { 2 } else { 1 },
            }

            let Some(block) = ctx.block(*merge_block) else {
                return false;
            };
            for phi in block.phis() {
                let (Some(result_id), Some(ty)) = (phi.result_id, phi.result_type) else {
                    return false;
                };
                let placeholder_ok = match info.and_then(|i| i.suitable_id_for(result_id)) {
                    Some(id) => {
                        ctx.type_id_of(id) == Some(ty)
                            && util::id_is_available_at_end_of_block(ctx, layout.entry, id)
                    }
                    None => available.contains_key(&ty),
                };
                if !placeholder_ok {
                    return false;
                }
            }
        }

        util::ids_are_fresh_and_distinct(ctx, &fresh)
            && has_enough_overflow_ids(tc.overflow_id_source.as_ref(), overflow_ids_needed)
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let layout = self
            .analyze(ctx)
            .expect("function returns must be mergeable");
        let true_id = util::find_bool_constant(ctx, &tc.fact_manager, true, false)
            .expect("a relevant true constant must exist");
        let false_id = util::find_bool_constant(ctx, &tc.fact_manager, false, false)
            .expect("a relevant false constant must exist");
        let bool_type = ctx.type_id_of(true_id).expect("constants have types");
        let returnable = layout.return_type.map(|_| {
            self.returnable_value(ctx, &layout)
                .expect("a returnable value must be available")
        });

        let infos = self.info_by_merge_block();
        let mut merge_ids = HashMap::new();
        for merge_block in &layout.merge_blocks {
            let ids = match infos.get(merge_block) {
                Some(info) => MergeIds {
                    is_returning: info.is_returning_id,
                    return_val: layout.return_type.and(info.maybe_return_val_id),
                },
                None => {
                    let is_returning = tc.overflow_id_source.get_next_overflow_id();
                    let return_val = layout
                        .return_type
                        .map(|_| tc.overflow_id_source.get_next_overflow_id());
                    MergeIds {
                        is_returning,
                        return_val,
                    }
                }
            };
            merge_ids.insert(*merge_block, ids);
        }

        // Where each return and each merge block breaks to
        let scfg = ctx.structured_cfg();
        let break_target = |block: Id| scfg.loop_merge_block(block).unwrap_or(self.outer_return_id);
        let mut incoming: HashMap<Id, Vec<Incoming>> = HashMap::new();
        let mut return_edits = Vec::new();
        for (label, value) in &layout.returns {
            let target = break_target(*label);
            return_edits.push((*label, target));
            incoming.entry(target).or_default().push(Incoming {
                pred: *label,
                value: *value,
                is_returning: true_id,
            });
        }
        for merge_block in &layout.merge_blocks {
            let ids = merge_ids[merge_block];
            incoming
                .entry(break_target(*merge_block))
                .or_default()
                .push(Incoming {
                    pred: *merge_block,
                    value: ids.return_val,
                    is_returning: ids.is_returning,
                });
        }

        let available = util::available_ids_after_entry_block(ctx, self.function_id);
        let mut merge_edits = Vec::new();
        for merge_block in &layout.merge_blocks {
            let ids = merge_ids[merge_block];
            let block = ctx.block(*merge_block).expect("merge block must exist");
            let original_preds = ctx.predecessors(*merge_block).to_vec();
            let returning = incoming.get(merge_block).map(Vec::as_slice).unwrap_or(&[]);
            let not_returning: Vec<Id> = original_preds
                .iter()
                .copied()
                .filter(|pred| returning.iter().all(|r| r.pred != *pred))
                .collect();
            let new_preds: Vec<Id> = returning
                .iter()
                .map(|r| r.pred)
                .filter(|pred| !original_preds.contains(pred))
                .collect();

            let flag_pairs: Vec<(Id, Id)> = returning
                .iter()
                .map(|r| (r.is_returning, r.pred))
                .chain(not_returning.iter().map(|pred| (false_id, *pred)))
                .collect();
            let mut new_phis = vec![Instruction::phi(bool_type, ids.is_returning, &flag_pairs)];
            if let (Some(ty), Some(return_val), Some(returnable)) =
                (layout.return_type, ids.return_val, returnable)
            {
                let value_pairs: Vec<(Id, Id)> = returning
                    .iter()
                    .map(|r| (r.value.expect("non-void returns carry a value"), r.pred))
                    .chain(not_returning.iter().map(|pred| (returnable, *pred)))
                    .collect();
                new_phis.push(Instruction::phi(ty, return_val, &value_pairs));
            }

            let info = infos.get(merge_block).copied();
            let placeholders: Vec<Id> = block
                .phis()
                .map(|phi| {
                    phi.result_id
                        .and_then(|id| info.and_then(|i| i.suitable_id_for(id)))
                        .or_else(|| phi.result_type.and_then(|ty| available.get(&ty).copied()))
                        .expect("every phi must have a placeholder")
                })
                .collect();

            let enclosing = break_target(*merge_block);
            let original_succ = block
                .terminator()
                .and_then(|t| t.id_operand(0))
                .expect("merge block must end in a branch");
            let terminator = (original_succ != enclosing).then(|| {
                Instruction::branch_conditional(ids.is_returning, enclosing, original_succ)
            });

            merge_edits.push((*merge_block, new_phis, placeholders, new_preds, terminator));
        }

        let outer_pairs: Vec<(Id, Id)> = incoming
            .get(&self.outer_return_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter_map(|r| r.value.map(|value| (value, r.pred)))
            .collect();

        let module = ctx.module_mut();
        let function = module
            .function_mut(self.function_id)
            .expect("function must exist");

        for (label, target) in return_edits {
            let block = function.block_mut(label).expect("return block must exist");
            if let Some(terminator) = block.terminator_mut() {
                *terminator = Instruction::branch(target);
            }
        }

        for (label, new_phis, placeholders, new_preds, terminator) in merge_edits {
            let block = function.block_mut(label).expect("merge block must exist");
            for (phi, placeholder) in block.instructions.iter_mut().zip(placeholders) {
                for pred in &new_preds {
                    phi.operands.push(Operand::Id(placeholder));
                    phi.operands.push(Operand::Id(*pred));
                }
            }
            block.instructions.splice(0..0, new_phis);
            if let Some(terminator) = terminator {
                *block.terminator_mut().expect("merge block must end in a branch") = terminator;
            }
        }

        if let Some(block) = function.block_mut(layout.block_after_entry) {
            block.replace_phi_predecessor(layout.entry, self.outer_header_id);
        }
        if let Some(terminator) = function
            .block_mut(layout.entry)
            .and_then(BasicBlock::terminator_mut)
        {
            *terminator = Instruction::branch(self.outer_header_id);
        }

        // The back edge of the outer loop is never taken
        let outer_header = BasicBlock::with_instructions(
            self.outer_header_id,
            vec![
                Instruction::loop_merge(self.outer_return_id, self.outer_header_id),
                Instruction::branch_conditional(
                    true_id,
                    layout.block_after_entry,
                    self.outer_header_id,
                ),
            ],
        );
        function.insert_block_after(layout.entry, outer_header);

        let mut outer_return = BasicBlock::new(self.outer_return_id);
        match (layout.return_type, self.return_val_id) {
            (Some(ty), Some(return_val_id)) => {
                outer_return.add_instruction(Instruction::phi(ty, return_val_id, &outer_pairs));
                outer_return.add_instruction(Instruction::return_value(return_val_id));
                module.update_id_bound(return_val_id);
            }
            _ => outer_return.add_instruction(Instruction::return_void()),
        }
        let function = module
            .function_mut(self.function_id)
            .expect("function must exist");
        function.add_block(outer_return);

        module.update_id_bound(self.outer_header_id);
        module.update_id_bound(self.outer_return_id);
        for ids in merge_ids.values() {
            module.update_id_bound(ids.is_returning);
            if let Some(id) = ids.return_val {
                module.update_id_bound(id);
            }
        }
    }

    fn info_by_merge_block(&self) -> HashMap<Id, &ReturnMergingInfo> {
        self.returns_merging_info
            .iter()
            .map(|info| (info.merge_block_id, info))
            .collect()
    }

    /// A value of the return type usable anywhere after the entry block
    fn returnable_value(&self, ctx: &IrContext, layout: &Layout) -> Option<Id> {
        let ty = layout.return_type?;
        match self.any_returnable_val_id {
            Some(id) => (ctx.type_id_of(id) == Some(ty)
                && util::id_is_available_at_end_of_block(ctx, layout.entry, id))
            .then_some(id),
            None => util::available_ids_after_entry_block(ctx, self.function_id)
                .get(&ty)
                .copied(),
        }
    }

    fn analyze(&self, ctx: &IrContext) -> Option<Layout> {
        let function = ctx.function(self.function_id)?;
        let entry = function.entry()?;
        if entry.merge_instruction().is_some() {
            return None;
        }
        let terminator = entry.terminator()?;
        if terminator.opcode != Opcode::Branch {
            return None;
        }
        let block_after_entry = terminator.id_operand(0)?;
        let return_type =
            (!ctx.get_type(function.return_type)?.is_void()).then_some(function.return_type);

        let scfg = ctx.structured_cfg();
        let mut returns = Vec::new();
        for label in util::reachable_return_blocks(ctx, self.function_id) {
            if scfg.is_in_continue_construct(label) {
                return None;
            }
            let value = ctx.block(label)?.terminator()?.id_operand(0);
            if return_type.is_some() && value.is_none() {
                return None;
            }
            returns.push((label, value));
        }
        if returns.is_empty() {
            return None;
        }

        let mut merge_blocks = Vec::new();
        for (label, _) in &returns {
            let mut current = scfg.loop_merge_block(*label);
            while let Some(merge_block) = current {
                if merge_blocks.contains(&merge_block) {
                    break;
                }
                merge_blocks.push(merge_block);
                current = scfg.loop_merge_block(merge_block);
            }
        }
        for merge_block in &merge_blocks {
            if !ctx.is_reachable(*merge_block)
                || scfg.is_in_continue_construct(*merge_block)
                || !only_phis_and_branch(ctx.block(*merge_block)?)
            {
                return None;
            }
        }
        merge_blocks.sort_by_key(|label| {
            (
                Reverse(scfg.loop_nesting_depth(*label)),
                function.block_index(*label),
            )
        });
        if !breaks_keep_dominance(ctx, &merge_blocks) {
            return None;
        }

        Some(Layout {
            entry: entry.label,
            block_after_entry,
            return_type,
            returns,
            merge_blocks,
        })
    }
}

fn only_phis_and_branch(block: &BasicBlock) -> bool {
    let Some((last, rest)) = block.instructions.split_last() else {
        return false;
    };
    last.opcode == Opcode::Branch && rest.iter().all(|inst| inst.opcode == Opcode::Phi)
}

/// New edges into a loop's merge block must not strip a definition inside the
/// loop of its dominance over a use after the loop. Uses inside the loop and
/// phi inputs arriving from inside the loop are unaffected.
fn breaks_keep_dominance(ctx: &IrContext, merge_blocks: &[Id]) -> bool {
    let scfg = ctx.structured_cfg();
    let module = ctx.module();
    for merge_block in merge_blocks {
        let Some(header) = scfg
            .headers_merging_at(*merge_block)
            .iter()
            .copied()
            .find(|h| scfg.is_loop_header(*h))
        else {
            return false;
        };
        let inside =
            |b: Id| ctx.block_dominates(header, b) && !ctx.block_dominates(*merge_block, b);
        let Some(function) = ctx.function_of_block(header) else {
            return false;
        };
        for block in &function.blocks {
            if block.label == header || !inside(block.label) {
                continue;
            }
            for id in block.defined_ids() {
                for used in ctx.def_use().uses(id) {
                    let InstructionLocation::Block {
                        function: f,
                        block: b,
                        index,
                    } = used.location
                    else {
                        continue;
                    };
                    let use_block = &module.functions[f].blocks[b];
                    if inside(use_block.label) {
                        continue;
                    }
                    let inst = &use_block.instructions[index];
                    let from_inside = inst.opcode == Opcode::Phi
                        && inst
                            .id_operand(used.operand_index + 1)
                            .is_some_and(|pred| inside(pred));
                    if !from_inside {
                        return false;
                    }
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_modules as tm;

    fn label(base: u32, k: u32) -> Id {
        Id(base + k)
    }

    fn merge(function_id: Id, info: Vec<ReturnMergingInfo>) -> MergeFunctionReturns {
        MergeFunctionReturns {
            function_id,
            outer_header_id: Id(500),
            outer_return_id: Id(501),
            return_val_id: None,
            any_returnable_val_id: None,
            returns_merging_info: info,
        }
    }

    fn layout(ctx: &IrContext, function: Id) -> Vec<Id> {
        ctx.function(function)
            .unwrap()
            .blocks
            .iter()
            .map(|b| b.label)
            .collect()
    }

    #[test]
    fn test_merge_void_returns() {
        let mut ctx = IrContext::new(tm::loop_with_returns(false));
        let mut tc = tm::transformation_context();
        let base = tm::RET_BASE;
        let t = merge(
            tm::RET_FN,
            vec![ReturnMergingInfo {
                merge_block_id: label(base, 4),
                is_returning_id: Id(502),
                maybe_return_val_id: None,
                opphi_to_suitable_id: vec![],
            }],
        );
        assert!(t.is_applicable(&ctx, &tc));
        t.apply(&mut ctx, &mut tc);

        tm::assert_valid(&ctx);
        assert_eq!(util::reachable_return_blocks(&ctx, tm::RET_FN), vec![Id(501)]);
        assert_eq!(
            layout(&ctx, tm::RET_FN),
            vec![
                label(base, 0),
                Id(500),
                label(base, 1),
                label(base, 2),
                label(base, 3),
                label(base, 4),
                label(base, 5),
                Id(501),
            ]
        );

        // The return inside the loop breaks to the loop's merge block
        let body = ctx.block(label(base, 2)).unwrap();
        assert_eq!(body.terminator().unwrap().successors(), vec![label(base, 4)]);

        let loop_merge = ctx.block(label(base, 4)).unwrap();
        assert_eq!(
            loop_merge.instructions[0].phi_pairs(),
            vec![(tm::TRUE, label(base, 2)), (tm::FALSE, label(base, 3))]
        );
        let terminator = loop_merge.terminator().unwrap();
        assert_eq!(terminator.opcode, Opcode::BranchConditional);
        assert_eq!(terminator.id_operand(0), Some(Id(502)));
        assert_eq!(terminator.successors(), vec![Id(501), label(base, 5)]);

        assert!(ctx.structured_cfg().is_loop_header(Id(500)));
        assert_eq!(ctx.structured_cfg().merge_block(Id(500)), Some(Id(501)));
        assert_eq!(ctx.id_bound(), 503);
    }

    #[test]
    fn test_merge_value_returns() {
        let mut ctx = IrContext::new(tm::loop_with_returns(true));
        let mut tc = tm::transformation_context();
        let base = tm::RETV_BASE;
        let t = MergeFunctionReturns {
            return_val_id: Some(Id(502)),
            any_returnable_val_id: Some(tm::INT_TEN),
            ..merge(
                tm::RETV_FN,
                vec![ReturnMergingInfo {
                    merge_block_id: label(base, 4),
                    is_returning_id: Id(503),
                    maybe_return_val_id: Some(Id(504)),
                    opphi_to_suitable_id: vec![],
                }],
            )
        };
        assert!(t.is_applicable(&ctx, &tc));
        // A non-void function needs somewhere to collect the value
        let no_return_val = MergeFunctionReturns {
            return_val_id: None,
            ..t.clone()
        };
        assert!(!no_return_val.is_applicable(&ctx, &tc));

        t.apply(&mut ctx, &mut tc);
        tm::assert_valid(&ctx);
        assert_eq!(util::reachable_return_blocks(&ctx, tm::RETV_FN), vec![Id(501)]);

        let loop_merge = ctx.block(label(base, 4)).unwrap();
        assert_eq!(loop_merge.phis().count(), 2);
        assert_eq!(
            ctx.get_def(Id(504)).unwrap().phi_pairs(),
            vec![(tm::INT_ONE, label(base, 2)), (tm::INT_TEN, label(base, 3))]
        );

        let outer_return = ctx.block(Id(501)).unwrap();
        assert_eq!(
            outer_return.instructions[0].phi_pairs(),
            vec![(tm::INT_TWO, label(base, 5)), (Id(504), label(base, 4))]
        );
        assert_eq!(
            outer_return.terminator().unwrap().id_operand(0),
            Some(Id(502))
        );
        assert_eq!(ctx.id_bound(), 505);
    }

    #[test]
    fn test_merge_uses_overflow_ids_without_info() {
        let mut ctx = IrContext::new(tm::loop_with_returns(false));
        let mut tc = tm::transformation_context();
        let t = merge(tm::RET_FN, vec![]);
        assert!(t.is_applicable(&ctx, &tc));
        t.apply(&mut ctx, &mut tc);

        tm::assert_valid(&ctx);
        let flag = Id(tm::FIRST_OVERFLOW_ID);
        let loop_merge = ctx.block(label(tm::RET_BASE, 4)).unwrap();
        assert_eq!(loop_merge.instructions[0].result_id, Some(flag));
        assert_eq!(ctx.id_bound(), tm::FIRST_OVERFLOW_ID + 1);
    }

    #[test]
    fn test_single_return_is_wrapped() {
        let mut ctx = IrContext::new(tm::straight_line());
        let mut tc = tm::transformation_context();
        let t = merge(tm::OUT_FN, vec![]);
        assert!(t.is_applicable(&ctx, &tc));
        t.apply(&mut ctx, &mut tc);

        tm::assert_valid(&ctx);
        assert_eq!(util::reachable_return_blocks(&ctx, tm::OUT_FN), vec![Id(501)]);
        assert_eq!(
            ctx.block(tm::OUT_EXIT).unwrap().terminator().unwrap().successors(),
            vec![Id(501)]
        );
    }

    #[test]
    fn test_merge_rejections() {
        let ctx = IrContext::new(tm::all_features());
        let tc = tm::transformation_context();

        // The entry block ends in a conditional branch
        assert!(!merge(tm::MAIN, vec![]).is_applicable(&ctx, &tc));
        // Ids already in use
        let taken = MergeFunctionReturns {
            outer_header_id: tm::ENTRY,
            ..merge(tm::RET_FN, vec![])
        };
        assert!(!taken.is_applicable(&ctx, &tc));
        let same = MergeFunctionReturns {
            outer_return_id: Id(500),
            ..merge(tm::RET_FN, vec![])
        };
        assert!(!same.is_applicable(&ctx, &tc));
        // Not a function
        assert!(!merge(tm::ENTRY, vec![]).is_applicable(&ctx, &tc));
    }

    #[test]
    fn test_merge_block_with_side_effects_is_rejected() {
        let mut f = tm::returns_function(tm::RET_FN, tm::RET_BASE, false);
        f.block_mut(label(tm::RET_BASE, 4)).unwrap().instructions.insert(
            0,
            Instruction::binary(Opcode::IAdd, tm::INT, Id(300), tm::INT_ONE, tm::INT_ONE),
        );
        let mut module = tm::globals();
        module.add_function(f);
        let ctx = IrContext::new(module);
        let tc = tm::transformation_context();
        assert!(!merge(tm::RET_FN, vec![]).is_applicable(&ctx, &tc));
    }
}
