//! Position-independent ways of naming instructions and operand uses.
//!
//! Raw `(function, block, index)` positions shift as soon as anything is
//! inserted, so records name an instruction relative to a nearby instruction
//! that has a result id instead.

use morph_ir::{Id, InstructionLocation, IrContext, Opcode};
use serde::{Deserialize, Serialize};

/// Names an instruction as "skip `num_opcodes_to_ignore` instructions with
/// opcode `target_instruction_opcode`, starting at the instruction whose
/// result id is `base_instruction_result_id`". The base may be a block
/// label, in which case the search starts at the block's first instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstructionDescriptor {
    pub base_instruction_result_id: Id,
    pub target_instruction_opcode: Opcode,
    pub num_opcodes_to_ignore: u32,
}

impl InstructionDescriptor {
    pub fn new(base: Id, opcode: Opcode, num_opcodes_to_ignore: u32) -> Self {
        Self {
            base_instruction_result_id: base,
            target_instruction_opcode: opcode,
            num_opcodes_to_ignore,
        }
    }
}

/// Resolve a descriptor to the block instruction it names
pub fn find_instruction(
    descriptor: &InstructionDescriptor,
    ctx: &IrContext,
) -> Option<InstructionLocation> {
    let base = descriptor.base_instruction_result_id;
    let (function, block, start) = match ctx.cfg().location(base) {
        Some((function, block)) => (function, block, 0),
        None => match ctx.def_use().definition(base)? {
            morph_ir::Definition::Instruction(InstructionLocation::Block {
                function,
                block,
                index,
            }) => (function, block, index),
            _ => return None,
        },
    };

    let instructions = &ctx.module().functions[function].blocks[block].instructions;
    let mut skipped = 0;
    for (index, inst) in instructions.iter().enumerate().skip(start) {
        if inst.opcode != descriptor.target_instruction_opcode {
            continue;
        }
        if skipped == descriptor.num_opcodes_to_ignore {
            return Some(InstructionLocation::Block {
                function,
                block,
                index,
            });
        }
        skipped += 1;
    }
    None
}

/// Build a descriptor for instruction `index` of the block labelled `block`
pub fn make_instruction_descriptor(
    ctx: &IrContext,
    block: Id,
    index: usize,
) -> Option<InstructionDescriptor> {
    let instructions = &ctx.block(block)?.instructions;
    let target = instructions.get(index)?;

    let mut base = block;
    let mut base_index = 0;
    for i in (0..=index).rev() {
        if let Some(id) = instructions[i].result_id {
            base = id;
            base_index = i;
            break;
        }
    }

    let skipped = instructions[base_index..index]
        .iter()
        .filter(|inst| inst.opcode == target.opcode)
        .count();
    Some(InstructionDescriptor::new(
        base,
        target.opcode,
        skipped as u32,
    ))
}

/// Names the use of `id_of_interest` at operand `in_operand_index` of the
/// instruction named by `enclosing_instruction`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdUseDescriptor {
    pub id_of_interest: Id,
    pub enclosing_instruction: InstructionDescriptor,
    pub in_operand_index: u32,
}

impl IdUseDescriptor {
    pub fn new(
        id_of_interest: Id,
        enclosing_instruction: InstructionDescriptor,
        in_operand_index: u32,
    ) -> Self {
        Self {
            id_of_interest,
            enclosing_instruction,
            in_operand_index,
        }
    }
}

/// Resolve a use descriptor, checking the operand really is the id of
/// interest
pub fn find_instruction_containing_use(
    descriptor: &IdUseDescriptor,
    ctx: &IrContext,
) -> Option<InstructionLocation> {
    let location = find_instruction(&descriptor.enclosing_instruction, ctx)?;
    let inst = ctx.module().instruction(location)?;
    if inst.id_operand(descriptor.in_operand_index as usize) != Some(descriptor.id_of_interest) {
        return None;
    }
    Some(location)
}
