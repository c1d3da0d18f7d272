use morph_ir::{BasicBlock, Constant, Id, Instruction, IrContext, Opcode, Operand, Type};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::fact_manager::DataDescriptor;
use crate::util;

/// Upper bound on the number of iterations of a synonym loop
pub const MAX_LOOP_ITERATIONS: i64 = 32;

/// Prove `constant_id` synonymous with the value left behind by a counting
/// loop inserted right before `block_after_loop_id`:
///
/// ```text
/// loop_id:
///   %ctr  = phi %int_0 pred, %incremented_ctr loop_id
///   %temp = phi %initial pred, %eventual_syn loop_id
///   %eventual_syn = temp - step
///   %incremented_ctr = ctr + 1
///   %cond = incremented_ctr < num_iterations
///   loop merge, back edge on %cond
/// block_after_loop_id:
///   %syn = phi %eventual_syn ...
/// ```
///
/// The loop runs `N` times, so `syn = I - S * N`, which must equal the
/// constant component-wise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLoopToCreateIntConstantSynonym {
    pub constant_id: Id,
    pub initial_val_id: Id,
    pub step_val_id: Id,
    pub num_iterations_id: Id,
    pub block_after_loop_id: Id,
    pub syn_id: Id,
    pub loop_id: Id,
    pub ctr_id: Id,
    pub temp_id: Id,
    pub eventual_syn_id: Id,
    pub incremented_ctr_id: Id,
    pub cond_id: Id,
    /// Merge block for the new loop, required when the block after the loop
    /// is a continue target
    pub additional_block_id: Option<Id>,
}

impl AddLoopToCreateIntConstantSynonym {
    pub fn is_applicable(&self, ctx: &IrContext, tc: &TransformationContext) -> bool {
        let (Some(constant), Some(initial), Some(step)) = (
            ctx.find_declared_constant(self.constant_id),
            ctx.find_declared_constant(self.initial_val_id),
            ctx.find_declared_constant(self.step_val_id),
        ) else {
            return false;
        };
        if tc.fact_manager.id_is_irrelevant(self.constant_id) {
            return false;
        }

        let Some(constant_type) = ctx.type_id_of(self.constant_id) else {
            return false;
        };
        if component_width(ctx, constant_type).map_or(true, |width| width > 64) {
            return false;
        }
        let same_shape = |id: Id| {
            ctx.type_id_of(id)
                .is_some_and(|ty| util::types_equal_up_to_sign(ctx, constant_type, ty))
        };
        if !same_shape(self.initial_val_id) || !same_shape(self.step_val_id) {
            return false;
        }

        let Some(num_iterations) = self.num_iterations(ctx) else {
            return false;
        };
        if !(1..=MAX_LOOP_ITERATIONS).contains(&num_iterations) {
            return false;
        }

        // The counter is built from existing 32-bit signed constants
        if util::find_int_constant(ctx, &tc.fact_manager, 0, 32, true, false).is_none()
            || util::find_int_constant(ctx, &tc.fact_manager, 1, 32, true, false).is_none()
            || ctx.find_bool_type().is_none()
        {
            return false;
        }

        // Values are compared sign-extended whatever the declared signedness.
        // `I - S * N` must equal `C` exactly; overflow of the 64-bit
        // arithmetic rejects the record.
        let (Some(c), Some(i), Some(s)) = (
            components(ctx, &constant),
            components(ctx, &initial),
            components(ctx, &step),
        ) else {
            return false;
        };
        if c.len() != i.len() || c.len() != s.len() {
            return false;
        }
        let holds = c.iter().zip(&i).zip(&s).all(|((c, i), s)| {
            s.checked_mul(num_iterations)
                .and_then(|product| i.checked_sub(product))
                == Some(*c)
        });
        if !holds {
            return false;
        }

        let block = self.block_after_loop_id;
        if ctx.block(block).is_none() || ctx.predecessors(block).len() != 1 {
            return false;
        }
        let scfg = ctx.structured_cfg();
        if scfg.is_merge_block(block) {
            return false;
        }

        let mut fresh = vec![
            self.syn_id,
            self.loop_id,
            self.ctr_id,
            self.temp_id,
            self.eventual_syn_id,
            self.incremented_ctr_id,
            self.cond_id,
        ];
        match self.additional_block_id {
            Some(id) => fresh.push(id),
            None if scfg.is_continue_block(block) => return false,
            None => {}
        }
        util::ids_are_fresh_and_distinct(ctx, &fresh)
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let block_after_loop = self.block_after_loop_id;
        let pred = ctx.predecessors(block_after_loop)[0];
        let int_type = ctx
            .find_int_type(32, true)
            .expect("32-bit signed integer type must exist");
        let bool_type = ctx.find_bool_type().expect("bool type must exist");
        let zero = util::find_int_constant(ctx, &tc.fact_manager, 0, 32, true, false)
            .expect("constant 0 must exist");
        let one = util::find_int_constant(ctx, &tc.fact_manager, 1, 32, true, false)
            .expect("constant 1 must exist");
        let value_type = ctx
            .type_id_of(self.initial_val_id)
            .expect("initial value must have a type");
        let continue_headers: Vec<Id> = ctx
            .structured_cfg()
            .headers_continuing_at(block_after_loop)
            .to_vec();
        let loop_merge = self.additional_block_id.unwrap_or(block_after_loop);
        // The block after the loop is entered from the loop or the extra block
        let phi_pred = self.additional_block_id.unwrap_or(self.loop_id);
        let dead = tc.fact_manager.block_is_dead(block_after_loop);

        let loop_block = BasicBlock::with_instructions(
            self.loop_id,
            vec![
                Instruction::phi(
                    int_type,
                    self.ctr_id,
                    &[(zero, pred), (self.incremented_ctr_id, self.loop_id)],
                ),
                Instruction::phi(
                    value_type,
                    self.temp_id,
                    &[(self.initial_val_id, pred), (self.eventual_syn_id, self.loop_id)],
                ),
                Instruction::binary(
                    Opcode::ISub,
                    value_type,
                    self.eventual_syn_id,
                    self.temp_id,
                    self.step_val_id,
                ),
                Instruction::binary(
                    Opcode::IAdd,
                    int_type,
                    self.incremented_ctr_id,
                    self.ctr_id,
                    one,
                ),
                Instruction::binary(
                    Opcode::SLessThan,
                    bool_type,
                    self.cond_id,
                    self.incremented_ctr_id,
                    self.num_iterations_id,
                ),
                Instruction::loop_merge(loop_merge, self.loop_id),
                Instruction::branch_conditional(self.cond_id, self.loop_id, loop_merge),
            ],
        );

        let module = ctx.module_mut();
        let function = module
            .function_containing_block_mut(block_after_loop)
            .expect("block after the loop must exist");

        if let Some(terminator) = function
            .block_mut(pred)
            .and_then(BasicBlock::terminator_mut)
        {
            terminator.replace_label(block_after_loop, self.loop_id);
        }
        // The new loop takes over as continue target
        for header in &continue_headers {
            if let Some(block) = function.block_mut(*header) {
                let index = block.len() - 2;
                block.instructions[index].set_operand(1, Operand::Id(self.loop_id));
            }
        }

        let after = function
            .block_mut(block_after_loop)
            .expect("block after the loop must exist");
        after.replace_phi_predecessor(pred, phi_pred);
        after.instructions.insert(
            0,
            Instruction::phi(value_type, self.syn_id, &[(self.eventual_syn_id, phi_pred)]),
        );

        function.insert_block_before(block_after_loop, loop_block);
        if let Some(additional) = self.additional_block_id {
            function.insert_block_before(
                block_after_loop,
                BasicBlock::with_instructions(
                    additional,
                    vec![Instruction::branch(block_after_loop)],
                ),
            );
        }

        for id in [
            self.syn_id,
            self.loop_id,
            self.ctr_id,
            self.temp_id,
            self.eventual_syn_id,
            self.incremented_ctr_id,
            self.cond_id,
        ]
        .into_iter()
        .chain(self.additional_block_id)
        {
            module.update_id_bound(id);
        }

        if dead {
            tc.fact_manager.add_fact_block_is_dead(self.loop_id, ctx);
            if let Some(additional) = self.additional_block_id {
                tc.fact_manager.add_fact_block_is_dead(additional, ctx);
            }
        }
        tc.fact_manager.add_fact_data_synonym(
            DataDescriptor::whole(self.syn_id),
            DataDescriptor::whole(self.constant_id),
            ctx,
        );
    }

    fn num_iterations(&self, ctx: &IrContext) -> Option<i64> {
        match ctx.find_declared_constant(self.num_iterations_id)? {
            constant @ Constant::Int { width: 32, .. } => constant.sign_extended_value(),
            _ => None,
        }
    }
}

/// Bit width of an integer scalar or of the components of an integer vector
fn component_width(ctx: &IrContext, type_id: Id) -> Option<u32> {
    match ctx.get_type(type_id)? {
        Type::Int { width, .. } => Some(width),
        Type::Vector { component, .. } => ctx.get_type(component)?.as_int().map(|(w, _)| w),
        _ => None,
    }
}

/// Sign-extended integer values of a scalar or vector constant
fn components(ctx: &IrContext, constant: &Constant) -> Option<Vec<i64>> {
    match constant {
        Constant::Int { .. } => Some(vec![constant.sign_extended_value()?]),
        Constant::Composite { components } => components
            .iter()
            .map(|id| ctx.find_declared_constant(*id)?.sign_extended_value())
            .collect(),
        _ => None,
    }
}
