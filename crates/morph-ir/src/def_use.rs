//! Definition and use index over a module.

use std::collections::HashMap;

use crate::instruction::{Id, Instruction};
use crate::module::{InstructionLocation, Module};

/// Where an id is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definition {
    Instruction(InstructionLocation),
    Label { function: usize, block: usize },
    Function(usize),
}

/// One operand that refers to an id. Only operands are recorded; result
/// types are reachable through the defining instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub location: InstructionLocation,
    pub operand_index: usize,
}

#[derive(Debug, Default)]
pub struct DefUse {
    definitions: HashMap<Id, Definition>,
    uses: HashMap<Id, Vec<Use>>,
}

impl DefUse {
    pub fn build(module: &Module) -> Self {
        let mut def_use = Self::default();

        for (index, inst) in module.globals.iter().enumerate() {
            def_use.record(inst, InstructionLocation::Global(index));
        }

        for (f_index, function) in module.functions.iter().enumerate() {
            def_use
                .definitions
                .insert(function.id, Definition::Function(f_index));
            for (index, param) in function.params.iter().enumerate() {
                def_use.record(
                    param,
                    InstructionLocation::Parameter {
                        function: f_index,
                        index,
                    },
                );
            }
            for (b_index, block) in function.blocks.iter().enumerate() {
                def_use.definitions.insert(
                    block.label,
                    Definition::Label {
                        function: f_index,
                        block: b_index,
                    },
                );
                for (index, inst) in block.instructions.iter().enumerate() {
                    def_use.record(
                        inst,
                        InstructionLocation::Block {
                            function: f_index,
                            block: b_index,
                            index,
                        },
                    );
                }
            }
        }

        def_use
    }

    fn record(&mut self, inst: &Instruction, location: InstructionLocation) {
        if let Some(id) = inst.result_id {
            self.definitions.insert(id, Definition::Instruction(location));
        }
        for (operand_index, id) in inst.id_operands() {
            self.uses.entry(id).or_default().push(Use {
                location,
                operand_index,
            });
        }
    }

    pub fn definition(&self, id: Id) -> Option<Definition> {
        self.definitions.get(&id).copied()
    }

    pub fn is_defined(&self, id: Id) -> bool {
        self.definitions.contains_key(&id)
    }

    /// All operand uses of `id`, in module order
    pub fn uses(&self, id: Id) -> &[Use] {
        self.uses.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_used(&self, id: Id) -> bool {
        !self.uses(id).is_empty()
    }
}
