use morph_ir::types::width_mask;
use morph_ir::{Id, Instruction, IrContext, Type};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::util;

/// Declare a new boolean, integer or float constant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddConstantScalar {
    pub fresh_id: Id,
    pub type_id: Id,
    /// Bit pattern of the value; booleans use 0 and 1
    pub value: u64,
    pub is_irrelevant: bool,
}

impl AddConstantScalar {
    pub fn is_applicable(&self, ctx: &IrContext, _tc: &TransformationContext) -> bool {
        if !util::is_fresh_id(ctx, self.fresh_id) {
            return false;
        }
        match ctx.get_type(self.type_id) {
            Some(Type::Bool) => self.value <= 1,
            Some(Type::Int { width, .. }) | Some(Type::Float { width }) => {
                width <= 64 && self.value & !width_mask(width) == 0
            }
            _ => false,
        }
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let inst = match ctx.get_type(self.type_id) {
            Some(Type::Bool) => {
                Instruction::constant_bool(self.type_id, self.fresh_id, self.value == 1)
            }
            _ => Instruction::constant(self.type_id, self.fresh_id, self.value),
        };
        ctx.module_mut().add_global(inst);

        if self.is_irrelevant {
            tc.fact_manager.add_fact_id_is_irrelevant(self.fresh_id, ctx);
        }
    }
}
