//! The module together with its lazily derived analyses.
//!
//! Analyses are computed on first access and cached until the module is
//! borrowed mutably. `IrContext::module_mut` drops every cache and bumps the
//! generation, and because analyses are borrowed from the context a stale
//! analysis cannot be held across a mutation.

use std::cell::OnceCell;
use std::collections::HashMap;

use tracing::trace;

use crate::cfg::Cfg;
use crate::def_use::{DefUse, Definition};
use crate::dominators::DominatorTree;
use crate::instruction::{Id, Instruction, Opcode};
use crate::module::{BasicBlock, Function, Module};
use crate::structured::StructuredCfg;
use crate::types::{width_mask, Constant, Type};

#[derive(Debug)]
pub struct IrContext {
    module: Module,
    generation: u64,
    def_use: OnceCell<DefUse>,
    cfg: OnceCell<Cfg>,
    dominators: OnceCell<HashMap<Id, DominatorTree>>,
    post_dominators: OnceCell<HashMap<Id, DominatorTree>>,
    structured_cfg: OnceCell<StructuredCfg>,
}

impl IrContext {
    pub fn new(module: Module) -> Self {
        Self {
            module,
            generation: 0,
            def_use: OnceCell::new(),
            cfg: OnceCell::new(),
            dominators: OnceCell::new(),
            post_dominators: OnceCell::new(),
            structured_cfg: OnceCell::new(),
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Mutable access to the module. Every cached analysis is discarded.
    pub fn module_mut(&mut self) -> &mut Module {
        self.invalidate_analyses();
        &mut self.module
    }

    pub fn into_module(self) -> Module {
        self.module
    }

    /// Number of times the module has been handed out for mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn invalidate_analyses(&mut self) {
        self.generation += 1;
        self.def_use.take();
        self.cfg.take();
        self.dominators.take();
        self.post_dominators.take();
        self.structured_cfg.take();
    }

    pub fn id_bound(&self) -> u32 {
        self.module.id_bound
    }

    // Analyses

    pub fn def_use(&self) -> &DefUse {
        self.def_use.get_or_init(|| {
            trace!(generation = self.generation, "computing def-use");
            DefUse::build(&self.module)
        })
    }

    pub fn cfg(&self) -> &Cfg {
        self.cfg.get_or_init(|| Cfg::build(&self.module))
    }

    fn dominator_trees(&self) -> &HashMap<Id, DominatorTree> {
        self.dominators.get_or_init(|| {
            trace!(generation = self.generation, "computing dominators");
            let cfg = self.cfg();
            self.module
                .functions
                .iter()
                .map(|f| (f.id, DominatorTree::dominators(f, cfg)))
                .collect()
        })
    }

    fn post_dominator_trees(&self) -> &HashMap<Id, DominatorTree> {
        self.post_dominators.get_or_init(|| {
            let cfg = self.cfg();
            self.module
                .functions
                .iter()
                .map(|f| (f.id, DominatorTree::post_dominators(f, cfg)))
                .collect()
        })
    }

    pub fn dominators(&self, function: Id) -> Option<&DominatorTree> {
        self.dominator_trees().get(&function)
    }

    pub fn post_dominators(&self, function: Id) -> Option<&DominatorTree> {
        self.post_dominator_trees().get(&function)
    }

    pub fn structured_cfg(&self) -> &StructuredCfg {
        self.structured_cfg
            .get_or_init(|| StructuredCfg::build(&self.module, self.dominator_trees()))
    }

    // Lookups

    pub fn function(&self, id: Id) -> Option<&Function> {
        self.module.function(id)
    }

    /// The function that owns the block labelled `label`
    pub fn function_of_block(&self, label: Id) -> Option<&Function> {
        let (function, _) = self.cfg().location(label)?;
        self.module.functions.get(function)
    }

    pub fn block(&self, label: Id) -> Option<&BasicBlock> {
        let (function, block) = self.cfg().location(label)?;
        self.module.functions.get(function)?.blocks.get(block)
    }

    pub fn predecessors(&self, label: Id) -> &[Id] {
        self.cfg().predecessors(label)
    }

    pub fn successors(&self, label: Id) -> &[Id] {
        self.cfg().successors(label)
    }

    pub fn is_reachable(&self, label: Id) -> bool {
        self.function_of_block(label)
            .and_then(|f| self.dominators(f.id))
            .is_some_and(|tree| tree.contains(label))
    }

    /// True if block `a` dominates block `b`; both must be in one function
    pub fn block_dominates(&self, a: Id, b: Id) -> bool {
        match (self.function_of_block(a), self.function_of_block(b)) {
            (Some(fa), Some(fb)) if fa.id == fb.id => self
                .dominators(fa.id)
                .is_some_and(|tree| tree.dominates(a, b)),
            _ => false,
        }
    }

    /// True if block `a` post-dominates block `b`; both must be in one function
    pub fn block_post_dominates(&self, a: Id, b: Id) -> bool {
        match (self.function_of_block(a), self.function_of_block(b)) {
            (Some(fa), Some(fb)) if fa.id == fb.id => self
                .post_dominators(fa.id)
                .is_some_and(|tree| tree.dominates(a, b)),
            _ => false,
        }
    }

    pub fn is_defined(&self, id: Id) -> bool {
        self.def_use().is_defined(id)
    }

    /// The instruction defining `id`; `None` for labels, functions and
    /// unknown ids
    pub fn get_def(&self, id: Id) -> Option<&Instruction> {
        match self.def_use().definition(id)? {
            Definition::Instruction(location) => self.module.instruction(location),
            Definition::Label { .. } | Definition::Function(_) => None,
        }
    }

    /// Label of the block containing the definition of `id`, if it is defined
    /// by an instruction inside a block
    pub fn block_of_definition(&self, id: Id) -> Option<Id> {
        match self.def_use().definition(id)? {
            Definition::Instruction(crate::module::InstructionLocation::Block {
                function,
                block,
                ..
            }) => Some(self.module.functions[function].blocks[block].label),
            _ => None,
        }
    }

    /// Type id of the value `id`
    pub fn type_id_of(&self, id: Id) -> Option<Id> {
        self.get_def(id)?.result_type
    }

    /// Decode the type declared by `type_id`
    pub fn get_type(&self, type_id: Id) -> Option<Type> {
        self.get_def(type_id).and_then(Type::from_instruction)
    }

    /// Decoded type of the value `id`
    pub fn type_of(&self, id: Id) -> Option<Type> {
        self.get_type(self.type_id_of(id)?)
    }

    /// Decode the constant `id`, if it is a declared constant
    pub fn find_declared_constant(&self, id: Id) -> Option<Constant> {
        let inst = self.get_def(id)?;
        if !inst.opcode.is_constant() {
            return None;
        }
        let ty = self.get_type(inst.result_type?)?;
        Constant::from_instruction(inst, &ty)
    }

    fn find_global(&self, predicate: impl Fn(&Instruction) -> bool) -> Option<Id> {
        self.module
            .globals
            .iter()
            .find(|inst| predicate(inst))
            .and_then(|inst| inst.result_id)
    }

    pub fn find_type(&self, ty: &Type) -> Option<Id> {
        self.find_global(|inst| Type::from_instruction(inst).as_ref() == Some(ty))
    }

    pub fn find_void_type(&self) -> Option<Id> {
        self.find_type(&Type::Void)
    }

    pub fn find_bool_type(&self) -> Option<Id> {
        self.find_type(&Type::Bool)
    }

    pub fn find_int_type(&self, width: u32, signed: bool) -> Option<Id> {
        self.find_type(&Type::Int { width, signed })
    }

    pub fn find_function_type(&self, return_type: Id, params: &[Id]) -> Option<Id> {
        self.find_type(&Type::Function {
            return_type,
            params: params.to_vec(),
        })
    }

    /// Find a scalar integer constant of the given type with value `bits`
    /// (truncated to `width`)
    pub fn find_int_constant(&self, bits: u64, width: u32, signed: bool) -> Option<Id> {
        let type_id = self.find_int_type(width, signed)?;
        let bits = bits & width_mask(width);
        self.find_global(|inst| {
            inst.opcode == Opcode::Constant
                && inst.result_type == Some(type_id)
                && inst.literal_operand(0).map(|v| v & width_mask(width)) == Some(bits)
        })
    }

    pub fn find_bool_constant(&self, value: bool) -> Option<Id> {
        let type_id = self.find_bool_type()?;
        let opcode = if value {
            Opcode::ConstantTrue
        } else {
            Opcode::ConstantFalse
        };
        self.find_global(|inst| inst.opcode == opcode && inst.result_type == Some(type_id))
    }

    /// Find an `Undef` of the given type
    pub fn find_undef(&self, type_id: Id) -> Option<Id> {
        self.find_global(|inst| inst.opcode == Opcode::Undef && inst.result_type == Some(type_id))
    }
}
