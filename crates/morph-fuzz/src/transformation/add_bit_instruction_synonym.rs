use morph_ir::{Definition, Id, Instruction, InstructionLocation, IrContext, Opcode, Type};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::fact_manager::DataDescriptor;
use crate::util;

/// Rebuild the result of a bitwise instruction one bit at a time and record
/// the rebuilt value as a synonym of the original.
///
/// For `%r = BitwiseOr %a %b` over a `w`-bit integer the new code, inserted
/// right before the instruction, is
///
/// ```text
/// %a_i = BitFieldUExtract %a i 1          for i in 0..w
/// %b_i = BitFieldUExtract %b i 1          for i in 0..w
/// %c_i = BitwiseOr %a_i %b_i              for i in 0..w
/// %s_1 = BitFieldInsert %c_0 %c_1 1 1
/// %s_i = BitFieldInsert %s_(i-1) %c_i i 1 for i in 2..w
/// ```
///
/// and `%s_(w-1)` is recorded as synonymous with `%r`. `Not` has a single
/// operand, so there is no second row of extracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddBitInstructionSynonym {
    pub instruction_result_id: Id,
    /// Exactly [`AddBitInstructionSynonym::required_fresh_id_count`] ids
    pub fresh_ids: Vec<Id>,
}

impl AddBitInstructionSynonym {
    /// How many fresh ids rebuilding the instruction defining `result_id`
    /// takes; `None` if the instruction is not a supported bit instruction
    pub fn required_fresh_id_count(ctx: &IrContext, result_id: Id) -> Option<usize> {
        let inst = ctx.get_def(result_id)?;
        let width = scalar_int_width(ctx, inst)? as usize;
        let per_bit = match inst.opcode {
            Opcode::BitwiseOr | Opcode::BitwiseXor | Opcode::BitwiseAnd => 4,
            Opcode::Not => 3,
            _ => return None,
        };
        // One insert fewer than bits: bit 0 is the base of the chain
        Some(per_bit * width - 1)
    }

    pub fn is_applicable(&self, ctx: &IrContext, tc: &TransformationContext) -> bool {
        if block_location(ctx, self.instruction_result_id).is_none() {
            return false;
        }
        let Some(inst) = ctx.get_def(self.instruction_result_id) else {
            return false;
        };
        let Some(width) = scalar_int_width(ctx, inst) else {
            return false;
        };
        if width > 64 {
            return false;
        }
        let Some(required) = Self::required_fresh_id_count(ctx, self.instruction_result_id)
        else {
            return false;
        };

        // Operands of another signedness would need bitcasts
        let all_operands_match = inst.operands.iter().all(|operand| {
            operand
                .as_id()
                .is_some_and(|id| ctx.type_id_of(id) == inst.result_type)
        });
        if !all_operands_match {
            return false;
        }
        if tc.fact_manager.id_is_irrelevant(self.instruction_result_id) {
            return false;
        }
        if bit_index_constants(ctx, tc, width).is_none() {
            return false;
        }

        self.fresh_ids.len() == required
            && util::ids_are_fresh_and_distinct(ctx, &self.fresh_ids)
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let Some(InstructionLocation::Block {
            function,
            block,
            index,
        }) = block_location(ctx, self.instruction_result_id)
        else {
            panic!("bit instruction must live in a block");
        };
        let inst = ctx
            .get_def(self.instruction_result_id)
            .expect("bit instruction must exist")
            .clone();
        let result_type = inst.result_type.expect("bit instruction must have a type");
        let width = scalar_int_width(ctx, &inst).expect("bit instruction must be an integer");
        let bit = bit_index_constants(ctx, tc, width).expect("bit index constants must exist");
        let width = width as usize;
        let one = bit[1];
        let operands: Vec<Id> = inst.operands.iter().filter_map(|o| o.as_id()).collect();

        let mut fresh = self.fresh_ids.iter().copied();
        let mut next_id = || fresh.next().expect("fresh id count was checked");
        let mut new_instructions = Vec::with_capacity(self.fresh_ids.len());

        // One row of single-bit extracts per operand
        let mut rows: Vec<Vec<Id>> = Vec::with_capacity(operands.len());
        for operand in &operands {
            let mut row = Vec::with_capacity(width);
            for offset in &bit[..width] {
                let id = next_id();
                new_instructions.push(Instruction::bit_field_u_extract(
                    result_type,
                    id,
                    *operand,
                    *offset,
                    one,
                ));
                row.push(id);
            }
            rows.push(row);
        }

        // The operation applied bit by bit
        let mut bits = Vec::with_capacity(width);
        for i in 0..width {
            let id = next_id();
            let inputs: Vec<Id> = rows.iter().map(|row| row[i]).collect();
            new_instructions.push(
                Instruction::new(inst.opcode)
                    .with_result(result_type, id)
                    .with_id_operands(&inputs),
            );
            bits.push(id);
        }

        // Put the bits back together, starting from bit 0
        let mut rebuilt = bits[0];
        for (i, bit_id) in bits.iter().enumerate().skip(1) {
            let id = next_id();
            new_instructions.push(Instruction::bit_field_insert(
                result_type,
                id,
                rebuilt,
                *bit_id,
                bit[i],
                one,
            ));
            rebuilt = id;
        }

        let module = ctx.module_mut();
        let instructions = &mut module.functions[function].blocks[block].instructions;
        instructions.splice(index..index, new_instructions);
        for id in &self.fresh_ids {
            module.update_id_bound(*id);
        }

        tc.fact_manager.add_fact_data_synonym(
            DataDescriptor::whole(rebuilt),
            DataDescriptor::whole(self.instruction_result_id),
            ctx,
        );
    }
}

fn block_location(ctx: &IrContext, id: Id) -> Option<InstructionLocation> {
    match ctx.def_use().definition(id)? {
        Definition::Instruction(location @ InstructionLocation::Block { .. }) => Some(location),
        _ => None,
    }
}

/// Width of the result of a supported bit instruction with a scalar
/// integer type
fn scalar_int_width(ctx: &IrContext, inst: &Instruction) -> Option<u32> {
    if !matches!(
        inst.opcode,
        Opcode::BitwiseOr | Opcode::BitwiseXor | Opcode::BitwiseAnd | Opcode::Not
    ) {
        return None;
    }
    match ctx.get_type(inst.result_type?)? {
        Type::Int { width, .. } if width > 0 => Some(width),
        _ => None,
    }
}

/// Relevant 32-bit unsigned constants `0..max(width, 2)`, indexed by value
fn bit_index_constants(
    ctx: &IrContext,
    tc: &TransformationContext,
    width: u32,
) -> Option<Vec<Id>> {
    (0..width.max(2))
        .map(|i| {
            util::find_int_constant(ctx, &tc.fact_manager, u64::from(i), 32, false, false)
        })
        .collect()
}
