//! Dominator and post-dominator trees.
//!
//! A block `a` dominates `b` if every path from the function entry to `b`
//! passes through `a`; post-dominance is the same relation on paths from `b`
//! to a function exit. Both trees are computed with the iterative algorithm of
//! Cooper, Harvey and Kennedy over a reverse postorder of the reachable
//! blocks. Post-dominators use a virtual exit node joined to every block that
//! has no successors, so functions with several returns still form a tree.
//!
//! Blocks that are unreachable from the root (from the entry, or for
//! post-dominance: that cannot reach an exit) are not part of the tree and
//! neither dominate nor are dominated by anything.

use std::collections::{HashMap, HashSet};

use crate::cfg::Cfg;
use crate::instruction::Id;
use crate::module::Function;

/// Virtual root of post-dominator trees. `Id(0)` never names a block.
const VIRTUAL_EXIT: Id = Id(0);

#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// The root of the tree: the entry block, or the virtual exit
    root: Id,
    /// Immediate dominator of every node in the tree; the root maps to itself
    idom: HashMap<Id, Id>,
    /// Nodes in reverse postorder from the root
    order: Vec<Id>,
}

impl DominatorTree {
    /// Compute the dominator tree of `function`
    pub fn dominators(function: &Function, cfg: &Cfg) -> Self {
        let Some(entry) = function.entry() else {
            return Self::empty(VIRTUAL_EXIT);
        };
        compute(
            entry.label,
            |node| cfg.successors(node).to_vec(),
            |node| cfg.predecessors(node).to_vec(),
        )
    }

    /// Compute the post-dominator tree of `function`
    pub fn post_dominators(function: &Function, cfg: &Cfg) -> Self {
        let exits: Vec<Id> = function
            .blocks
            .iter()
            .filter(|b| cfg.successors(b.label).is_empty())
            .map(|b| b.label)
            .collect();
        let successors = |node: Id| {
            if node == VIRTUAL_EXIT {
                exits.clone()
            } else {
                cfg.predecessors(node).to_vec()
            }
        };
        let predecessors = |node: Id| {
            if exits.contains(&node) {
                vec![VIRTUAL_EXIT]
            } else {
                cfg.successors(node).to_vec()
            }
        };
        compute(VIRTUAL_EXIT, successors, predecessors)
    }

    fn empty(root: Id) -> Self {
        Self {
            root,
            idom: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn contains(&self, node: Id) -> bool {
        node != VIRTUAL_EXIT && self.idom.contains_key(&node)
    }

    /// Returns the immediate dominator of a block, or `None` for the root
    /// and for blocks outside the tree.
    pub fn immediate_dominator(&self, node: Id) -> Option<Id> {
        if node == self.root {
            return None;
        }
        self.idom
            .get(&node)
            .copied()
            .filter(|idom| *idom != VIRTUAL_EXIT)
    }

    /// Checks if `a` dominates `b`. A block dominates itself.
    pub fn dominates(&self, a: Id, b: Id) -> bool {
        if !self.contains(a) || !self.contains(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            if current == self.root {
                return false;
            }
            current = self.idom[&current];
        }
    }

    pub fn strictly_dominates(&self, a: Id, b: Id) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Depth of a block in the tree; the root has depth 0
    pub fn depth(&self, node: Id) -> usize {
        let mut depth = 0;
        let mut current = node;
        while current != self.root {
            match self.idom.get(&current) {
                Some(idom) => current = *idom,
                None => return 0,
            }
            depth += 1;
        }
        depth
    }

    /// Blocks of the tree in reverse postorder, root excluded when virtual
    pub fn reverse_postorder(&self) -> impl Iterator<Item = Id> + '_ {
        self.order.iter().copied().filter(|id| *id != VIRTUAL_EXIT)
    }
}

fn compute<S, P>(root: Id, successors: S, predecessors: P) -> DominatorTree
where
    S: Fn(Id) -> Vec<Id>,
    P: Fn(Id) -> Vec<Id>,
{
    // Iterative depth-first search producing a postorder
    let mut postorder = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(Id, Vec<Id>, usize)> = vec![(root, successors(root), 0)];
    visited.insert(root);
    while let Some((node, succs, next)) = stack.last_mut() {
        let node = *node;
        let succ = succs.get(*next).copied();
        *next += 1;
        match succ {
            Some(succ) => {
                if visited.insert(succ) {
                    stack.push((succ, successors(succ), 0));
                }
            }
            None => {
                postorder.push(node);
                stack.pop();
            }
        }
    }

    let order: Vec<Id> = postorder.into_iter().rev().collect();
    let rpo_index: HashMap<Id, usize> = order.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let mut idom: HashMap<Id, Id> = HashMap::new();
    idom.insert(root, root);

    let intersect = |idom: &HashMap<Id, Id>, mut a: Id, mut b: Id| {
        while a != b {
            while rpo_index[&a] > rpo_index[&b] {
                a = idom[&a];
            }
            while rpo_index[&b] > rpo_index[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for node in order.iter().skip(1) {
            let mut new_idom: Option<Id> = None;
            for pred in predecessors(*node) {
                if !idom.contains_key(&pred) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, pred, current),
                });
            }
            if let Some(new_idom) = new_idom {
                if idom.get(node) != Some(&new_idom) {
                    idom.insert(*node, new_idom);
                    changed = true;
                }
            }
        }
    }

    DominatorTree { root, idom, order }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::module::{BasicBlock, Module};

    fn block(label: u32, terminator: Instruction) -> BasicBlock {
        BasicBlock::with_instructions(Id(label), vec![terminator])
    }

    /// 10 -> 11 -> 12 <-> 13 (loop, 13 is the back edge block) ; 12 -> 14 ;
    /// 10 -> 15 (early return)
    fn module() -> Module {
        let mut f = Function::new(Id(1), Id(2), Id(3));
        f.add_block(block(10, Instruction::branch_conditional(Id(4), Id(11), Id(15))));
        f.add_block(block(11, Instruction::branch(Id(12))));
        f.add_block(block(12, Instruction::branch_conditional(Id(4), Id(13), Id(14))));
        f.add_block(block(13, Instruction::branch(Id(12))));
        f.add_block(block(14, Instruction::return_void()));
        f.add_block(block(15, Instruction::return_void()));
        f.add_block(block(16, Instruction::branch(Id(14))));
        let mut module = Module::new();
        module.add_function(f);
        module
    }

    #[test]
    fn test_dominators() {
        let module = module();
        let cfg = Cfg::build(&module);
        let tree = DominatorTree::dominators(&module.functions[0], &cfg);

        assert!(tree.dominates(Id(10), Id(14)));
        assert!(tree.dominates(Id(12), Id(13)));
        assert!(tree.dominates(Id(12), Id(12)));
        assert!(!tree.strictly_dominates(Id(12), Id(12)));
        assert!(!tree.dominates(Id(13), Id(14)));
        assert_eq!(tree.immediate_dominator(Id(14)), Some(Id(12)));
        assert_eq!(tree.immediate_dominator(Id(10)), None);
        assert_eq!(tree.depth(Id(13)), 3);

        // Unreachable blocks are outside the tree
        assert!(!tree.contains(Id(16)));
        assert!(!tree.dominates(Id(10), Id(16)));
    }

    #[test]
    fn test_post_dominators() {
        let module = module();
        let cfg = Cfg::build(&module);
        let tree = DominatorTree::post_dominators(&module.functions[0], &cfg);

        assert!(tree.dominates(Id(12), Id(11)));
        assert!(tree.dominates(Id(14), Id(13)));
        assert!(tree.dominates(Id(14), Id(16)));
        // Two exits: neither post-dominates the entry
        assert!(!tree.dominates(Id(14), Id(10)));
        assert!(!tree.dominates(Id(15), Id(10)));
        assert_eq!(tree.immediate_dominator(Id(10)), None);
        assert_eq!(tree.immediate_dominator(Id(11)), Some(Id(12)));
    }
}
