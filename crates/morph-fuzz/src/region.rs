//! Single-entry/single-exit region analysis.

use std::collections::HashSet;

use morph_ir::{Id, IrContext};

/// The block where the two sides of a selection really reconverge.
///
/// Starting from the declared merge block, walk up while the current block
/// has exactly one predecessor: such a merge block only exists to satisfy
/// the structured-control-flow rules and control has already reconverged at
/// its predecessor. The walk never climbs past the header.
pub fn find_convergence_block(ctx: &IrContext, header: Id) -> Option<Id> {
    let mut current = ctx.block(header)?.merge_block()?;
    loop {
        match ctx.predecessors(current) {
            [pred] if *pred != header && *pred != current => current = *pred,
            _ => return Some(current),
        }
    }
}

/// `header` dominates `exit` and `exit` post-dominates `header`
pub fn is_single_entry_single_exit(ctx: &IrContext, header: Id, exit: Id) -> bool {
    ctx.block_dominates(header, exit) && ctx.block_post_dominates(exit, header)
}

/// Blocks reachable from `header` without passing through `convergence`,
/// in discovery order, both ends excluded
pub fn blocks_between(ctx: &IrContext, header: Id, convergence: Id) -> Vec<Id> {
    let mut visited = HashSet::from([header, convergence]);
    let mut worklist: Vec<Id> = ctx.successors(header).iter().rev().copied().collect();
    let mut blocks = Vec::new();
    while let Some(block) = worklist.pop() {
        if !visited.insert(block) {
            continue;
        }
        blocks.push(block);
        worklist.extend(ctx.successors(block).iter().rev().copied());
    }
    blocks
}

/// Blocks of the function dominated by `entry` and post-dominated by `exit`,
/// in layout order
pub fn outline_region(ctx: &IrContext, entry: Id, exit: Id) -> Vec<Id> {
    let Some(function) = ctx.function_of_block(entry) else {
        return Vec::new();
    };
    function
        .blocks
        .iter()
        .map(|b| b.label)
        .filter(|b| ctx.block_dominates(entry, *b) && ctx.block_post_dominates(exit, *b))
        .collect()
}
