//! Validation for IR modules.
//!
//! This is test tooling and a debugging aid for the fuzzer; it checks the
//! invariants every transformation must preserve rather than the complete
//! rules of the IR.

use std::collections::{HashMap, HashSet};

use morph_core::{Error, Result};

use crate::context::IrContext;
use crate::def_use::Definition;
use crate::instruction::{Id, Opcode};
use crate::module::{Function, InstructionLocation};

/// Validate that a module is well-formed
pub fn validate_module(ctx: &IrContext) -> Result<()> {
    validate_ids(ctx)?;
    for (index, function) in ctx.module().functions.iter().enumerate() {
        validate_block_shapes(function)?;
        validate_branch_targets(function)?;
        validate_phis(ctx, function)?;
        validate_dominance(ctx, function, index)?;
        validate_structure(ctx, function)?;
    }
    Ok(())
}

fn invalid(message: String) -> Error {
    Error::Validation(message)
}

fn validate_ids(ctx: &IrContext) -> Result<()> {
    let module = ctx.module();
    let mut seen = HashSet::new();
    let mut check = |id: Id| -> Result<()> {
        if id.0 == 0 || id.0 >= module.id_bound {
            return Err(invalid(format!(
                "{} is outside the id bound {}",
                id, module.id_bound
            )));
        }
        if !seen.insert(id) {
            return Err(invalid(format!("{} is defined more than once", id)));
        }
        Ok(())
    };

    for inst in &module.globals {
        if let Some(id) = inst.result_id {
            check(id)?;
        }
    }
    for function in &module.functions {
        for id in function.defined_ids() {
            check(id)?;
        }
    }
    Ok(())
}

fn validate_block_shapes(function: &Function) -> Result<()> {
    if function.blocks.is_empty() {
        return Err(invalid(format!("Function {} has no blocks", function.id)));
    }
    for block in &function.blocks {
        if block.terminator().is_none() {
            return Err(invalid(format!("Block {} has no terminator", block.label)));
        }
        let last = block.len() - 1;
        let mut seen_non_phi = false;
        for (index, inst) in block.instructions.iter().enumerate() {
            if inst.opcode == Opcode::Phi {
                if seen_non_phi {
                    return Err(invalid(format!(
                        "Block {} has a phi after a non-phi instruction",
                        block.label
                    )));
                }
            } else {
                seen_non_phi = true;
            }
            if inst.opcode.is_terminator() && index != last {
                return Err(invalid(format!(
                    "Block {} has a terminator before its end",
                    block.label
                )));
            }
            if inst.opcode.is_merge() && index + 1 != last {
                return Err(invalid(format!(
                    "Block {} has a merge instruction not directly before its terminator",
                    block.label
                )));
            }
        }
    }
    Ok(())
}

fn validate_branch_targets(function: &Function) -> Result<()> {
    let labels: HashSet<Id> = function.blocks.iter().map(|b| b.label).collect();
    for block in &function.blocks {
        for inst in &block.instructions {
            for (index, id) in inst.id_operands() {
                if inst.opcode.operand_is_label(index) && !labels.contains(&id) {
                    return Err(invalid(format!(
                        "Block {} refers to {} which is not a block of function {}",
                        block.label, id, function.id
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_phis(ctx: &IrContext, function: &Function) -> Result<()> {
    for block in &function.blocks {
        if !ctx.is_reachable(block.label) {
            continue;
        }
        let mut preds: Vec<Id> = ctx.predecessors(block.label).to_vec();
        preds.sort();
        for phi in block.phis() {
            let mut incoming: Vec<Id> = phi.phi_pairs().iter().map(|(_, pred)| *pred).collect();
            incoming.sort();
            if incoming != preds {
                return Err(invalid(format!(
                    "Phi {:?} in block {} does not match the block's predecessors",
                    phi.result_id, block.label
                )));
            }
        }
    }
    Ok(())
}

fn validate_dominance(ctx: &IrContext, function: &Function, f_index: usize) -> Result<()> {
    let Some(tree) = ctx.dominators(function.id) else {
        return Ok(());
    };
    let def_use = ctx.def_use();

    for block in &function.blocks {
        if !tree.contains(block.label) {
            continue;
        }
        for (index, inst) in block.instructions.iter().enumerate() {
            let phi_preds: HashMap<usize, Id> = if inst.opcode == Opcode::Phi {
                inst.id_operands()
                    .filter(|(i, _)| i % 2 == 1)
                    .map(|(i, pred)| (i - 1, pred))
                    .collect()
            } else {
                HashMap::new()
            };

            for (operand_index, id) in inst.value_operands() {
                let definition = def_use.definition(id).ok_or_else(|| {
                    invalid(format!("{} is used in block {} but never defined", id, block.label))
                })?;
                match definition {
                    Definition::Instruction(InstructionLocation::Global(_))
                    | Definition::Function(_) => {}
                    Definition::Instruction(InstructionLocation::Parameter { function, .. }) => {
                        if function != f_index {
                            return Err(invalid(format!(
                                "{} is a parameter of another function",
                                id
                            )));
                        }
                    }
                    Definition::Label { .. } => {
                        return Err(invalid(format!("Label {} is used as a value", id)));
                    }
                    Definition::Instruction(InstructionLocation::Block {
                        function,
                        block: def_block,
                        index: def_index,
                    }) => {
                        if function != f_index {
                            return Err(invalid(format!(
                                "{} is defined in another function",
                                id
                            )));
                        }
                        let def_label = ctx.module().functions[function].blocks[def_block].label;
                        let dominated = match phi_preds.get(&operand_index) {
                            Some(pred) => !tree.contains(*pred) || tree.dominates(def_label, *pred),
                            None if def_label == block.label => def_index < index,
                            None => tree.dominates(def_label, block.label),
                        };
                        if !dominated {
                            return Err(invalid(format!(
                                "Definition of {} does not dominate its use in block {}",
                                id, block.label
                            )));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_structure(ctx: &IrContext, function: &Function) -> Result<()> {
    let Some(tree) = ctx.dominators(function.id) else {
        return Ok(());
    };
    let scfg = ctx.structured_cfg();

    for block in &function.blocks {
        if let Some(merge) = block.merge_instruction() {
            let header = block.label;
            let terminator = block.terminator().map(|t| t.opcode);
            if merge.opcode == Opcode::SelectionMerge
                && terminator != Some(Opcode::BranchConditional)
            {
                return Err(invalid(format!(
                    "Selection header {} does not end in a conditional branch",
                    header
                )));
            }
            let targets = [block.merge_block(), block.continue_target()];
            for target in targets.into_iter().flatten() {
                if tree.contains(target)
                    && tree.contains(header)
                    && !tree.dominates(header, target)
                {
                    return Err(invalid(format!(
                        "Header {} does not dominate its merge or continue block {}",
                        header, target
                    )));
                }
            }
        }

        if scfg.headers_merging_at(block.label).len() > 1 {
            return Err(invalid(format!(
                "Block {} is the merge block of more than one header",
                block.label
            )));
        }

        if !tree.contains(block.label) {
            continue;
        }
        for successor in ctx.successors(block.label) {
            if tree.dominates(*successor, block.label) && !scfg.is_loop_header(*successor) {
                return Err(invalid(format!(
                    "Back edge from {} targets {} which is not a loop header",
                    block.label, successor
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::module::{BasicBlock, Module};

    fn base_module() -> Module {
        let mut module = Module::new();
        module.add_global(Instruction::type_void(Id(1)));
        module.add_global(Instruction::type_function(Id(2), Id(1), &[]));
        module.add_global(Instruction::type_int(Id(3), 32, true));
        module.add_global(Instruction::type_bool(Id(4)));
        module.add_global(Instruction::constant(Id(3), Id(5), 1));
        module.add_global(Instruction::constant_bool(Id(4), Id(6), true));
        module
    }

    fn diamond(merge_phi: bool) -> Module {
        let mut module = base_module();
        let mut f = Function::new(Id(10), Id(1), Id(2));
        f.add_block(BasicBlock::with_instructions(
            Id(11),
            vec![
                Instruction::selection_merge(Id(14)),
                Instruction::branch_conditional(Id(6), Id(12), Id(13)),
            ],
        ));
        f.add_block(BasicBlock::with_instructions(
            Id(12),
            vec![
                Instruction::binary(Opcode::IAdd, Id(3), Id(20), Id(5), Id(5)),
                Instruction::branch(Id(14)),
            ],
        ));
        f.add_block(BasicBlock::with_instructions(
            Id(13),
            vec![Instruction::branch(Id(14))],
        ));
        let mut merge = vec![Instruction::return_void()];
        if merge_phi {
            merge.insert(
                0,
                Instruction::phi(Id(3), Id(21), &[(Id(20), Id(12)), (Id(5), Id(13))]),
            );
        } else {
            // Uses %20 which does not dominate the merge block
            merge.insert(0, Instruction::copy_object(Id(3), Id(21), Id(20)));
        }
        f.add_block(BasicBlock::with_instructions(Id(14), merge));
        module.add_function(f);
        module
    }

    #[test]
    fn test_validate_valid_module() {
        let ctx = IrContext::new(diamond(true));
        validate_module(&ctx).unwrap();
    }

    #[test]
    fn test_validate_dominance_violation() {
        let ctx = IrContext::new(diamond(false));
        assert!(matches!(validate_module(&ctx), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_phi_predecessor_mismatch() {
        let mut module = diamond(true);
        let merge = &mut module.functions[0].blocks[3];
        merge.instructions[0] = Instruction::phi(Id(3), Id(21), &[(Id(5), Id(13))]);
        let ctx = IrContext::new(module);
        assert!(validate_module(&ctx).is_err());
    }

    #[test]
    fn test_validate_duplicate_definition() {
        let mut module = diamond(true);
        module.functions[0].blocks[2]
            .instructions
            .insert(0, Instruction::copy_object(Id(3), Id(20), Id(5)));
        let ctx = IrContext::new(module);
        assert!(validate_module(&ctx).is_err());
    }

    #[test]
    fn test_validate_missing_terminator() {
        let mut module = diamond(true);
        module.functions[0].blocks[2].instructions.clear();
        let ctx = IrContext::new(module);
        assert!(validate_module(&ctx).is_err());
    }

    #[test]
    fn test_validate_back_edge_to_non_loop_header() {
        let mut module = base_module();
        let mut f = Function::new(Id(10), Id(1), Id(2));
        f.add_block(BasicBlock::with_instructions(
            Id(11),
            vec![Instruction::branch(Id(12))],
        ));
        f.add_block(BasicBlock::with_instructions(
            Id(12),
            vec![Instruction::branch_conditional(Id(6), Id(12), Id(13))],
        ));
        f.add_block(BasicBlock::with_instructions(
            Id(13),
            vec![Instruction::return_void()],
        ));
        module.add_function(f);
        let ctx = IrContext::new(module);
        assert!(validate_module(&ctx).is_err());
    }
}
