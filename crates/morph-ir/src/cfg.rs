//! Control-flow graph over the blocks of every function.

use std::collections::HashMap;

use crate::instruction::Id;
use crate::module::Module;

/// Predecessor and successor lists for every block. Both are deduplicated;
/// predecessors appear in block layout order.
#[derive(Debug, Default)]
pub struct Cfg {
    predecessors: HashMap<Id, Vec<Id>>,
    successors: HashMap<Id, Vec<Id>>,
    locations: HashMap<Id, (usize, usize)>,
}

impl Cfg {
    pub fn build(module: &Module) -> Self {
        let mut cfg = Self::default();
        for (f_index, function) in module.functions.iter().enumerate() {
            for (b_index, block) in function.blocks.iter().enumerate() {
                cfg.locations.insert(block.label, (f_index, b_index));
                cfg.predecessors.entry(block.label).or_default();
            }
            for block in &function.blocks {
                let successors = block.successors();
                for successor in &successors {
                    let preds = cfg.predecessors.entry(*successor).or_default();
                    if !preds.contains(&block.label) {
                        preds.push(block.label);
                    }
                }
                cfg.successors.insert(block.label, successors);
            }
        }
        cfg
    }

    pub fn predecessors(&self, block: Id) -> &[Id] {
        self.predecessors
            .get(&block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn successors(&self, block: Id) -> &[Id] {
        self.successors.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `(function index, block index)` of a block label
    pub fn location(&self, block: Id) -> Option<(usize, usize)> {
        self.locations.get(&block).copied()
    }

    pub fn contains(&self, block: Id) -> bool {
        self.locations.contains_key(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::module::{BasicBlock, Function};

    #[test]
    fn test_predecessors_are_deduplicated() {
        let mut module = Module::new();
        let mut f = Function::new(Id(1), Id(2), Id(3));
        f.add_block(BasicBlock::with_instructions(
            Id(10),
            vec![
                Instruction::selection_merge(Id(11)),
                Instruction::branch_conditional(Id(4), Id(11), Id(11)),
            ],
        ));
        f.add_block(BasicBlock::with_instructions(
            Id(11),
            vec![Instruction::return_void()],
        ));
        module.add_function(f);

        let cfg = Cfg::build(&module);
        assert_eq!(cfg.predecessors(Id(11)), &[Id(10)]);
        assert_eq!(cfg.successors(Id(10)), &[Id(11)]);
        assert!(cfg.predecessors(Id(10)).is_empty());
        assert_eq!(cfg.location(Id(11)), Some((0, 1)));
        assert!(!cfg.contains(Id(12)));
    }
}
