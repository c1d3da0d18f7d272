//! Module structure: blocks, functions and the module itself.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::instruction::{Id, Instruction, Opcode};

/// Position of an instruction inside a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionLocation {
    Global(usize),
    Parameter { function: usize, index: usize },
    Block { function: usize, block: usize, index: usize },
}

/// A labelled sequence of instructions: phis first, then ordinary
/// instructions, then an optional merge instruction right before the single
/// terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub label: Id,
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(label: Id) -> Self {
        Self {
            label,
            instructions: Vec::new(),
        }
    }

    pub fn with_instructions(label: Id, instructions: Vec<Instruction>) -> Self {
        Self {
            label,
            instructions,
        }
    }

    pub fn add_instruction(&mut self, inst: Instruction) {
        self.instructions.push(inst);
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions
            .last()
            .filter(|inst| inst.opcode.is_terminator())
    }

    pub fn terminator_mut(&mut self) -> Option<&mut Instruction> {
        self.instructions
            .last_mut()
            .filter(|inst| inst.opcode.is_terminator())
    }

    /// The selection or loop merge instruction, if this block is a header
    pub fn merge_instruction(&self) -> Option<&Instruction> {
        let len = self.instructions.len();
        if len < 2 {
            return None;
        }
        Some(&self.instructions[len - 2]).filter(|inst| inst.opcode.is_merge())
    }

    pub fn merge_block(&self) -> Option<Id> {
        self.merge_instruction().and_then(|inst| inst.id_operand(0))
    }

    pub fn continue_target(&self) -> Option<Id> {
        self.merge_instruction()
            .filter(|inst| inst.opcode == Opcode::LoopMerge)
            .and_then(|inst| inst.id_operand(1))
    }

    pub fn is_loop_header(&self) -> bool {
        matches!(self.merge_instruction(), Some(inst) if inst.opcode == Opcode::LoopMerge)
    }

    pub fn is_selection_header(&self) -> bool {
        matches!(self.merge_instruction(), Some(inst) if inst.opcode == Opcode::SelectionMerge)
    }

    pub fn phis(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions
            .iter()
            .take_while(|inst| inst.opcode == Opcode::Phi)
    }

    /// Index of the first instruction that is not a phi
    pub fn first_non_phi_index(&self) -> usize {
        self.phis().count()
    }

    pub fn successors(&self) -> Vec<Id> {
        self.terminator()
            .map(Instruction::successors)
            .unwrap_or_default()
    }

    /// Rewrite the predecessor operands of every phi from `old` to `new`
    pub fn replace_phi_predecessor(&mut self, old: Id, new: Id) {
        for inst in self
            .instructions
            .iter_mut()
            .take_while(|inst| inst.opcode == Opcode::Phi)
        {
            inst.replace_label(old, new);
        }
    }

    /// Every id this block defines, the label included
    pub fn defined_ids(&self) -> impl Iterator<Item = Id> + '_ {
        std::iter::once(self.label).chain(self.instructions.iter().filter_map(|i| i.result_id))
    }
}

/// A function: parameters and an ordered list of blocks, the first being the
/// entry block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: Id,
    pub return_type: Id,
    pub function_type: Id,
    pub params: Vec<Instruction>,
    pub blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn new(id: Id, return_type: Id, function_type: Id) -> Self {
        Self {
            id,
            return_type,
            function_type,
            params: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn add_param(&mut self, param: Instruction) {
        debug_assert_eq!(param.opcode, Opcode::FunctionParameter);
        self.params.push(param);
    }

    pub fn add_block(&mut self, block: BasicBlock) {
        self.blocks.push(block);
    }

    pub fn entry(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    pub fn block(&self, label: Id) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn block_mut(&mut self, label: Id) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|b| b.label == label)
    }

    pub fn block_index(&self, label: Id) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Count total instructions in the function
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    /// Insert `block` immediately after the block labelled `after`
    pub fn insert_block_after(&mut self, after: Id, block: BasicBlock) {
        let index = self
            .block_index(after)
            .expect("insertion point must be a block of this function");
        self.blocks.insert(index + 1, block);
    }

    /// Insert `block` immediately before the block labelled `before`
    pub fn insert_block_before(&mut self, before: Id, block: BasicBlock) {
        let index = self
            .block_index(before)
            .expect("insertion point must be a block of this function");
        self.blocks.insert(index, block);
    }

    pub fn remove_block(&mut self, label: Id) -> Option<BasicBlock> {
        let index = self.block_index(label)?;
        Some(self.blocks.remove(index))
    }

    /// Move the block labelled `label` so it directly follows `after`
    pub fn move_block_after(&mut self, label: Id, after: Id) {
        if label == after {
            return;
        }
        let block = self
            .remove_block(label)
            .expect("moved block must belong to this function");
        self.insert_block_after(after, block);
    }

    /// Split the block labelled `label` before instruction `index`. The tail
    /// moves to a new block `new_label` laid out right after the original,
    /// which falls through to it with an unconditional branch. Phis in the
    /// tail's successors are retargeted to the new block.
    pub fn split_block(&mut self, label: Id, index: usize, new_label: Id) {
        let position = self
            .block_index(label)
            .expect("split block must belong to this function");
        let tail = self.blocks[position].instructions.split_off(index);
        self.blocks[position]
            .instructions
            .push(Instruction::branch(new_label));
        let new_block = BasicBlock::with_instructions(new_label, tail);
        for successor in new_block.successors() {
            if let Some(block) = self.block_mut(successor) {
                block.replace_phi_predecessor(label, new_label);
            }
        }
        self.blocks.insert(position + 1, new_block);
    }

    /// Every id this function defines
    pub fn defined_ids(&self) -> impl Iterator<Item = Id> + '_ {
        std::iter::once(self.id)
            .chain(self.params.iter().filter_map(|p| p.result_id))
            .chain(self.blocks.iter().flat_map(BasicBlock::defined_ids))
    }
}

/// A complete module: global declarations followed by functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// One more than the largest id in use
    pub id_bound: u32,
    pub globals: Vec<Instruction>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Self {
        Self {
            id_bound: 1,
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Raise the id bound so that `id` lies below it
    pub fn update_id_bound(&mut self, id: Id) {
        self.id_bound = self.id_bound.max(id.0 + 1);
    }

    /// Recompute the id bound from the ids that are actually defined
    pub fn recompute_id_bound(&mut self) {
        let max = self
            .globals
            .iter()
            .filter_map(|g| g.result_id)
            .chain(self.functions.iter().flat_map(Function::defined_ids))
            .map(|id| id.0)
            .max()
            .unwrap_or(0);
        self.id_bound = self.id_bound.max(max + 1);
    }

    pub fn add_global(&mut self, inst: Instruction) {
        if let Some(id) = inst.result_id {
            self.update_id_bound(id);
        }
        self.globals.push(inst);
    }

    pub fn add_function(&mut self, function: Function) {
        let max = function.defined_ids().map(|id| id.0).max().unwrap_or(0);
        self.id_bound = self.id_bound.max(max + 1);
        self.functions.push(function);
    }

    pub fn function(&self, id: Id) -> Option<&Function> {
        self.functions.iter().find(|f| f.id == id)
    }

    pub fn function_mut(&mut self, id: Id) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.id == id)
    }

    pub fn function_index(&self, id: Id) -> Option<usize> {
        self.functions.iter().position(|f| f.id == id)
    }

    /// Find the function that owns the block labelled `label`
    pub fn function_containing_block_mut(&mut self, label: Id) -> Option<&mut Function> {
        self.functions
            .iter_mut()
            .find(|f| f.blocks.iter().any(|b| b.label == label))
    }

    pub fn instruction(&self, location: InstructionLocation) -> Option<&Instruction> {
        match location {
            InstructionLocation::Global(index) => self.globals.get(index),
            InstructionLocation::Parameter { function, index } => {
                self.functions.get(function)?.params.get(index)
            }
            InstructionLocation::Block {
                function,
                block,
                index,
            } => self
                .functions
                .get(function)?
                .blocks
                .get(block)?
                .instructions
                .get(index),
        }
    }

    pub fn instruction_mut(&mut self, location: InstructionLocation) -> Option<&mut Instruction> {
        match location {
            InstructionLocation::Global(index) => self.globals.get_mut(index),
            InstructionLocation::Parameter { function, index } => {
                self.functions.get_mut(function)?.params.get_mut(index)
            }
            InstructionLocation::Block {
                function,
                block,
                index,
            } => self
                .functions
                .get_mut(function)?
                .blocks
                .get_mut(block)?
                .instructions
                .get_mut(index),
        }
    }

    /// Count total instructions in the module
    pub fn total_instructions(&self) -> usize {
        self.globals.len()
            + self
                .functions
                .iter()
                .map(|f| f.params.len() + f.instruction_count())
                .sum::<usize>()
    }

    /// Serialize the module to bytes
    pub fn to_bytes(&self) -> morph_core::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a module from bytes
    pub fn from_bytes(bytes: &[u8]) -> morph_core::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_json(&self) -> morph_core::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> morph_core::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a module from disk. `.bin` files hold bincode, anything else JSON.
    pub fn load(path: &Path) -> morph_core::Result<Self> {
        if is_binary(path) {
            Self::from_bytes(&fs::read(path)?)
        } else {
            Self::from_json(&fs::read_to_string(path)?)
        }
    }

    /// Write a module to disk in the format [`Module::load`] expects
    pub fn save(&self, path: &Path) -> morph_core::Result<()> {
        if is_binary(path) {
            fs::write(path, self.to_bytes()?)?;
        } else {
            fs::write(path, self.to_json()?)?;
        }
        Ok(())
    }
}

fn is_binary(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "bin")
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
