use morph_ir::{Id, Opcode, Type};

use super::FuzzerPassContext;
use crate::transformation::AddBitInstructionSynonym;

/// Rebuild randomly chosen bitwise instructions bit by bit
pub(super) fn apply(ctx: &mut FuzzerPassContext<'_>) {
    let chance = ctx.fuzzer_context.chances().adding_bit_instruction_synonym;

    for (result_id, width) in bit_instructions(ctx) {
        if !ctx.fuzzer_context.choose_percentage(chance) {
            continue;
        }
        // Bit offsets and the count of one are 32-bit unsigned constants
        let have_indices = (0..width.max(2))
            .all(|i| ctx.find_or_create_int_constant(u64::from(i), 32, false, false).is_some());
        if !have_indices {
            continue;
        }
        let Some(count) = AddBitInstructionSynonym::required_fresh_id_count(ctx.ir, result_id)
        else {
            continue;
        };
        let fresh_ids = ctx.fuzzer_context.fresh_ids(count);
        ctx.maybe_apply_transformation(AddBitInstructionSynonym {
            instruction_result_id: result_id,
            fresh_ids,
        });
    }
}

/// Results of the scalar integer bitwise instructions in function bodies,
/// with their widths
fn bit_instructions(ctx: &FuzzerPassContext<'_>) -> Vec<(Id, u32)> {
    ctx.ir
        .module()
        .functions
        .iter()
        .flat_map(|f| f.blocks.iter())
        .flat_map(|b| b.instructions.iter())
        .filter(|inst| {
            matches!(
                inst.opcode,
                Opcode::BitwiseOr | Opcode::BitwiseXor | Opcode::BitwiseAnd | Opcode::Not
            )
        })
        .filter_map(|inst| {
            let result_id = inst.result_id?;
            match ctx.ir.get_type(inst.result_type?)? {
                Type::Int { width, .. } if (1..=64).contains(&width) => Some((result_id, width)),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::test_support::run_pass;
    use super::super::FuzzerPass;
    use crate::test_modules as tm;
    use crate::transformation::Transformation;
    use morph_ir::{Id, IrContext};

    #[test]
    fn test_bit_instructions_get_synonyms() {
        let mut ir = IrContext::new(tm::bit_operations());
        let mut tc = tm::transformation_context();
        let sequence = run_pass(FuzzerPass::AddBitInstructionSynonyms, &mut ir, &mut tc, 5);

        let rebuilt: Vec<Id> = sequence
            .iter()
            .filter_map(|t| match t {
                Transformation::AddBitInstructionSynonym(t) => Some(t.instruction_result_id),
                _ => None,
            })
            .collect();
        // The mixed-signedness And cannot be rebuilt
        assert_eq!(rebuilt, vec![tm::BITS_OR, tm::BITS_NOT]);
        for t in sequence.iter() {
            if let Transformation::AddBitInstructionSynonym(t) = t {
                let last = *t.fresh_ids.last().unwrap();
                assert!(tc.fact_manager.ids_are_synonymous(last, t.instruction_result_id));
            }
        }
    }

    #[test]
    fn test_missing_bit_indices_are_declared() {
        let mut module = tm::bit_operations();
        module.globals.retain(|inst| {
            inst.result_id
                .map_or(true, |id| !(tm::BITS_INDEX_ZERO..tm::BITS_INDEX_ZERO + 8).contains(&id.0))
        });
        let mut ir = IrContext::new(module);
        let mut tc = tm::transformation_context();
        let sequence = run_pass(FuzzerPass::AddBitInstructionSynonyms, &mut ir, &mut tc, 9);

        // Every index but 5, which the module already declares
        let declared = sequence
            .iter()
            .filter(|t| matches!(t, Transformation::AddConstantScalar(_)))
            .count();
        assert_eq!(declared, 7);
        assert!(sequence
            .iter()
            .any(|t| matches!(t, Transformation::AddBitInstructionSynonym(_))));
    }
}
