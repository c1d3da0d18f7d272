//! Structured control-flow queries: constructs, merge and continue blocks.
//!
//! A construct is the set of blocks dominated by its header and not dominated
//! by its merge block. A block's containing construct is the innermost
//! construct it belongs to, the header itself excluded.

use std::collections::{HashMap, HashSet};

use crate::dominators::DominatorTree;
use crate::instruction::Id;
use crate::module::Module;

/// A selection or loop construct, keyed by its header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Construct {
    pub header: Id,
    pub merge: Id,
    /// Present for loops only
    pub continue_target: Option<Id>,
}

impl Construct {
    pub fn is_loop(&self) -> bool {
        self.continue_target.is_some()
    }
}

#[derive(Debug, Default)]
pub struct StructuredCfg {
    constructs: HashMap<Id, Construct>,
    merge_headers: HashMap<Id, Vec<Id>>,
    continue_headers: HashMap<Id, Vec<Id>>,
    containing_construct: HashMap<Id, Id>,
    containing_loop: HashMap<Id, Id>,
    nesting_depth: HashMap<Id, usize>,
    loop_nesting_depth: HashMap<Id, usize>,
    in_continue_construct: HashSet<Id>,
}

impl StructuredCfg {
    pub fn build(module: &Module, dominators: &HashMap<Id, DominatorTree>) -> Self {
        let mut scfg = Self::default();

        for function in &module.functions {
            let mut headers = Vec::new();
            for block in &function.blocks {
                let Some(merge) = block.merge_block() else {
                    continue;
                };
                let construct = Construct {
                    header: block.label,
                    merge,
                    continue_target: block.continue_target(),
                };
                scfg.constructs.insert(block.label, construct);
                scfg.merge_headers.entry(merge).or_default().push(block.label);
                if let Some(target) = construct.continue_target {
                    scfg.continue_headers
                        .entry(target)
                        .or_default()
                        .push(block.label);
                }
                headers.push(construct);
            }

            let Some(tree) = dominators.get(&function.id) else {
                continue;
            };
            for block in &function.blocks {
                let b = block.label;
                if !tree.contains(b) {
                    continue;
                }
                let enclosing: Vec<&Construct> = headers
                    .iter()
                    .filter(|c| {
                        c.header != b
                            && tree.dominates(c.header, b)
                            && !tree.dominates(c.merge, b)
                    })
                    .collect();

                scfg.nesting_depth.insert(b, enclosing.len());
                scfg.loop_nesting_depth
                    .insert(b, enclosing.iter().filter(|c| c.is_loop()).count());

                if let Some(innermost) = enclosing.iter().max_by_key(|c| tree.depth(c.header)) {
                    scfg.containing_construct.insert(b, innermost.header);
                }
                let innermost_loop = enclosing
                    .iter()
                    .filter(|c| c.is_loop())
                    .max_by_key(|c| tree.depth(c.header));
                if let Some(innermost_loop) = innermost_loop {
                    scfg.containing_loop.insert(b, innermost_loop.header);
                    let target = innermost_loop.continue_target.unwrap_or(innermost_loop.header);
                    if target != innermost_loop.header && tree.dominates(target, b) {
                        scfg.in_continue_construct.insert(b);
                    }
                }
                if block.continue_target() == Some(b) {
                    scfg.in_continue_construct.insert(b);
                }
            }
        }

        scfg
    }

    /// The construct headed by `header`, if it is a header
    pub fn construct(&self, header: Id) -> Option<&Construct> {
        self.constructs.get(&header)
    }

    pub fn is_header(&self, block: Id) -> bool {
        self.constructs.contains_key(&block)
    }

    pub fn is_loop_header(&self, block: Id) -> bool {
        self.construct(block).is_some_and(Construct::is_loop)
    }

    pub fn merge_block(&self, header: Id) -> Option<Id> {
        self.construct(header).map(|c| c.merge)
    }

    pub fn continue_target(&self, header: Id) -> Option<Id> {
        self.construct(header).and_then(|c| c.continue_target)
    }

    pub fn is_merge_block(&self, block: Id) -> bool {
        self.merge_headers.contains_key(&block)
    }

    pub fn is_continue_block(&self, block: Id) -> bool {
        self.continue_headers.contains_key(&block)
    }

    /// Headers that declare `block` as their merge block
    pub fn headers_merging_at(&self, block: Id) -> &[Id] {
        self.merge_headers
            .get(&block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Headers that declare `block` as their continue target
    pub fn headers_continuing_at(&self, block: Id) -> &[Id] {
        self.continue_headers
            .get(&block)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Header of the innermost construct containing `block`
    pub fn containing_construct(&self, block: Id) -> Option<Id> {
        self.containing_construct.get(&block).copied()
    }

    /// Header of the innermost loop containing `block`
    pub fn containing_loop(&self, block: Id) -> Option<Id> {
        self.containing_loop.get(&block).copied()
    }

    /// Merge block of the innermost loop containing `block`
    pub fn loop_merge_block(&self, block: Id) -> Option<Id> {
        self.containing_loop(block)
            .and_then(|header| self.merge_block(header))
    }

    pub fn nesting_depth(&self, block: Id) -> usize {
        self.nesting_depth.get(&block).copied().unwrap_or(0)
    }

    pub fn loop_nesting_depth(&self, block: Id) -> usize {
        self.loop_nesting_depth.get(&block).copied().unwrap_or(0)
    }

    pub fn is_in_continue_construct(&self, block: Id) -> bool {
        self.in_continue_construct.contains(&block)
    }
}
