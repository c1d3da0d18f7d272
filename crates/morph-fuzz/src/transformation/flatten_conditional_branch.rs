use std::collections::{HashMap, HashSet};

use morph_ir::{BasicBlock, Id, Instruction, InstructionLocation, IrContext, Opcode, Operand, Type};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::descriptors::{find_instruction, InstructionDescriptor};
use crate::id_allocator::has_enough_overflow_ids;
use crate::region;
use crate::util;

/// Ids used to enclose an instruction with a result: execute block, merge
/// block, alternative block, renamed result, placeholder undef
const IDS_FOR_VALUE: usize = 5;
/// Ids used to enclose an instruction without a usable result: execute
/// block, merge block
const IDS_FOR_EFFECT: usize = 2;

/// Turn an if/else selection into straight-line code. Both sides run one
/// after the other; instructions with side effects are each guarded by a
/// small selection on the original condition, and the phis where the sides
/// converge become selects.
///
/// Each guarded instruction takes its ids from `instructions_to_fresh_ids`
/// or, failing that, from the overflow id source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenConditionalBranch {
    pub header_block_id: Id,
    pub instructions_to_fresh_ids: Vec<(InstructionDescriptor, Vec<Id>)>,
}

/// What flattening a header touches, computed before any mutation
struct FlattenPlan {
    condition: Id,
    convergence: Id,
    true_chain: Vec<Id>,
    false_chain: Vec<Id>,
    /// `(block, index, ids needed)` of instructions to guard, false side
    /// first
    to_enclose: Vec<(Id, usize, usize)>,
}

impl FlattenConditionalBranch {
    pub fn is_applicable(&self, ctx: &IrContext, tc: &TransformationContext) -> bool {
        let Some(plan) = plan(ctx, self.header_block_id) else {
            return false;
        };
        let mapped = self.mapped_fresh_ids(ctx);

        let mut used = Vec::new();
        let mut from_overflow = 0;
        for (block, index, needed) in &plan.to_enclose {
            match mapped.get(&(*block, *index)) {
                Some(ids) if ids.len() >= *needed => used.extend_from_slice(&ids[..*needed]),
                Some(_) => return false,
                None => from_overflow += needed,
            }
        }
        util::ids_are_fresh_and_distinct(ctx, &used)
            && has_enough_overflow_ids(tc.overflow_id_source.as_ref(), from_overflow)
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let header = self.header_block_id;
        let plan = plan(ctx, header).expect("selection must be flattenable");

        let mapped = self.mapped_fresh_ids(ctx);
        let mut ids_for: HashMap<(Id, usize), Vec<Id>> = HashMap::new();
        for (block, index, needed) in &plan.to_enclose {
            let ids = match mapped.get(&(*block, *index)) {
                Some(ids) => ids[..*needed].to_vec(),
                None => (0..*needed)
                    .map(|_| tc.overflow_id_source.get_next_overflow_id())
                    .collect(),
            };
            ids_for.insert((*block, *index), ids);
        }

        let originals: HashMap<Id, BasicBlock> = plan
            .true_chain
            .iter()
            .chain(&plan.false_chain)
            .filter_map(|label| ctx.block(*label).map(|b| (*label, b.clone())))
            .collect();
        let dead: HashSet<Id> = originals
            .keys()
            .copied()
            .filter(|label| tc.fact_manager.block_is_dead(*label))
            .collect();

        // The sides no longer branch separately, so each phi picks its value
        // by the condition instead of by the incoming edge
        let true_pred = plan.true_chain.last().copied().unwrap_or(header);
        let false_pred = plan.false_chain.last().copied().unwrap_or(header);
        let selects: Vec<Instruction> = ctx
            .block(plan.convergence)
            .expect("convergence block must exist")
            .phis()
            .map(|phi| {
                let pairs = phi.phi_pairs();
                let value_from = |pred: Id| {
                    pairs
                        .iter()
                        .find(|(_, p)| *p == pred)
                        .map(|(value, _)| *value)
                        .expect("phi must have a value for each side")
                };
                Instruction::select(
                    phi.result_type.expect("phi must have a type"),
                    phi.result_id.expect("phi must have a result"),
                    plan.condition,
                    value_from(true_pred),
                    value_from(false_pred),
                )
            })
            .collect();

        let mut new_dead = Vec::new();
        let mut true_blocks = enclose_chain(
            &plan.true_chain,
            &originals,
            &ids_for,
            &dead,
            plan.condition,
            true,
            &mut new_dead,
        );
        let false_blocks = enclose_chain(
            &plan.false_chain,
            &originals,
            &ids_for,
            &dead,
            plan.condition,
            false,
            &mut new_dead,
        );

        if let (Some(tail), Some(&false_head)) =
            (true_blocks.last_mut(), plan.false_chain.first())
        {
            if let Some(terminator) = tail.terminator_mut() {
                terminator.set_operand(0, Operand::Id(false_head));
            }
        }
        let first = plan
            .true_chain
            .first()
            .or(plan.false_chain.first())
            .copied()
            .unwrap_or(plan.convergence);

        let (function_index, _) = ctx.cfg().location(header).expect("header must exist");
        let module = ctx.module_mut();
        let function = &mut module.functions[function_index];

        let header_block = function.block_mut(header).expect("header must exist");
        let len = header_block.len();
        header_block.instructions.truncate(len - 2);
        header_block.add_instruction(Instruction::branch(first));

        let convergence = function
            .block_mut(plan.convergence)
            .expect("convergence block must exist");
        let num_phis = convergence.first_non_phi_index();
        convergence.instructions.splice(0..num_phis, selects);

        function
            .blocks
            .retain(|block| !originals.contains_key(&block.label));
        let position = function.block_index(header).expect("header must exist") + 1;
        function
            .blocks
            .splice(position..position, true_blocks.into_iter().chain(false_blocks));

        for id in ids_for.values().flatten() {
            module.update_id_bound(*id);
        }
        for label in new_dead {
            tc.fact_manager.add_fact_block_is_dead(label, ctx);
        }
    }

    /// Mapping entries that resolve, keyed by `(block, index)`
    fn mapped_fresh_ids(&self, ctx: &IrContext) -> HashMap<(Id, usize), &Vec<Id>> {
        self.instructions_to_fresh_ids
            .iter()
            .filter_map(|(descriptor, ids)| match find_instruction(descriptor, ctx)? {
                InstructionLocation::Block {
                    function,
                    block,
                    index,
                } => {
                    let label = ctx.module().functions[function].blocks[block].label;
                    Some(((label, index), ids))
                }
                _ => None,
            })
            .collect()
    }
}

/// `(block, index, ids needed)` of each instruction that flattening
/// `header` would guard; `None` if the selection cannot be flattened
pub fn instructions_to_enclose(ctx: &IrContext, header: Id) -> Option<Vec<(Id, usize, usize)>> {
    plan(ctx, header).map(|plan| plan.to_enclose)
}

fn plan(ctx: &IrContext, header: Id) -> Option<FlattenPlan> {
    let header_block = ctx.block(header)?;
    if !header_block.is_selection_header() || !ctx.is_reachable(header) {
        return None;
    }
    let terminator = header_block.terminator()?;
    if terminator.opcode != Opcode::BranchConditional {
        return None;
    }
    let condition = terminator.id_operand(0)?;
    let (if_true, if_false) = (terminator.id_operand(1)?, terminator.id_operand(2)?);

    let convergence = region::find_convergence_block(ctx, header)?;
    if convergence == header || !region::is_single_entry_single_exit(ctx, header, convergence) {
        return None;
    }

    let region: HashSet<Id> = region::blocks_between(ctx, header, convergence)
        .into_iter()
        .collect();
    let true_chain = chain(ctx, if_true, convergence, &region)?;
    let false_chain = chain(ctx, if_false, convergence, &region)?;
    // Every region block lies on exactly one side
    if true_chain.len() + false_chain.len() != region.len()
        || true_chain.iter().any(|label| false_chain.contains(label))
    {
        return None;
    }

    let convergence_block = ctx.block(convergence)?;
    if !ctx
        .predecessors(convergence)
        .iter()
        .all(|pred| *pred == header || region.contains(pred))
    {
        return None;
    }
    if convergence_block
        .phis()
        .any(|phi| {
            phi.result_type
                .and_then(|ty| ctx.get_type(ty))
                .map_or(true, |ty| ty.is_pointer())
        })
    {
        return None;
    }

    let scfg = ctx.structured_cfg();
    let mut to_enclose = Vec::new();
    for label in false_chain.iter().chain(&true_chain) {
        let block = ctx.block(*label)?;
        if ctx.predecessors(*label).len() != 1
            || block.merge_instruction().is_some()
            || block.first_non_phi_index() != 0
            || scfg.is_merge_block(*label)
            || scfg.is_continue_block(*label)
        {
            return None;
        }
        let body = &block.instructions[..block.len() - 1];
        for (index, inst) in body.iter().enumerate() {
            if util::instruction_has_no_side_effects(inst) {
                continue;
            }
            if !can_be_enclosed(ctx, inst) {
                return None;
            }
            to_enclose.push((*label, index, fresh_ids_needed(ctx, inst)));
        }
    }

    Some(FlattenPlan {
        condition,
        convergence,
        true_chain,
        false_chain,
        to_enclose,
    })
}

/// Blocks from `start` up to, not including, `convergence`; every block
/// must be in `region` and end in an unconditional branch
fn chain(ctx: &IrContext, start: Id, convergence: Id, region: &HashSet<Id>) -> Option<Vec<Id>> {
    let mut blocks = Vec::new();
    let mut current = start;
    while current != convergence {
        if !region.contains(&current) || blocks.contains(&current) {
            return None;
        }
        blocks.push(current);
        let terminator = ctx.block(current)?.terminator()?;
        if terminator.opcode != Opcode::Branch {
            return None;
        }
        current = terminator.id_operand(0)?;
    }
    Some(blocks)
}

/// Side-effecting instructions that may be guarded by a selection
fn can_be_enclosed(ctx: &IrContext, inst: &Instruction) -> bool {
    if !matches!(inst.opcode, Opcode::Load | Opcode::Store | Opcode::FunctionCall) {
        return false;
    }
    let Some(result) = inst.result_id else {
        return true;
    };
    match inst.result_type.and_then(|ty| ctx.get_type(ty)) {
        // A void result can only stay where it is if nothing refers to it
        Some(Type::Void) => !ctx.def_use().is_used(result),
        Some(ty) => !ty.is_pointer() && !ty.is_opaque(),
        None => false,
    }
}

fn fresh_ids_needed(ctx: &IrContext, inst: &Instruction) -> usize {
    let has_value = inst
        .result_type
        .and_then(|ty| ctx.get_type(ty))
        .is_some_and(|ty| !ty.is_void());
    if inst.result_id.is_some() && has_value {
        IDS_FOR_VALUE
    } else {
        IDS_FOR_EFFECT
    }
}

/// Rebuild one side of the selection, guarding each side-effecting
/// instruction. The first block keeps its label.
fn enclose_chain(
    chain: &[Id],
    originals: &HashMap<Id, BasicBlock>,
    ids_for: &HashMap<(Id, usize), Vec<Id>>,
    dead: &HashSet<Id>,
    condition: Id,
    exec_if_true: bool,
    new_dead: &mut Vec<Id>,
) -> Vec<BasicBlock> {
    let mut blocks = Vec::new();
    for label in chain {
        let original = &originals[label];
        let (body, terminator) = original.instructions.split_at(original.len() - 1);
        let mut current = BasicBlock::new(*label);

        for (index, inst) in body.iter().enumerate() {
            let Some(ids) = ids_for.get(&(*label, index)) else {
                current.add_instruction(inst.clone());
                continue;
            };
            let (execute, merge) = (ids[0], ids[1]);
            let mut enclosed = inst.clone();
            let mut next = BasicBlock::new(merge);

            let alternative = if ids.len() == IDS_FOR_VALUE {
                let ty = inst.result_type.expect("enclosed value must have a type");
                let original_id = inst.result_id.expect("enclosed value must have an id");
                enclosed.result_id = Some(ids[3]);
                next.add_instruction(Instruction::phi(
                    ty,
                    original_id,
                    &[(ids[3], execute), (ids[4], ids[2])],
                ));
                Some(BasicBlock::with_instructions(
                    ids[2],
                    vec![Instruction::undef(ty, ids[4]), Instruction::branch(merge)],
                ))
            } else {
                None
            };
            let skip = alternative.as_ref().map_or(merge, |b| b.label);
            let (if_true, if_false) = if exec_if_true {
                (execute, skip)
            } else {
                (skip, execute)
            };

            current.add_instruction(Instruction::selection_merge(merge));
            current.add_instruction(Instruction::branch_conditional(condition, if_true, if_false));
            blocks.push(std::mem::replace(&mut current, next));
            blocks.push(BasicBlock::with_instructions(
                execute,
                vec![enclosed, Instruction::branch(merge)],
            ));
            if dead.contains(label) {
                new_dead.extend([execute, merge]);
                new_dead.extend(alternative.as_ref().map(|b| b.label));
            }
            blocks.extend(alternative);
        }

        current.instructions.extend_from_slice(terminator);
        blocks.push(current);
    }
    blocks
}
