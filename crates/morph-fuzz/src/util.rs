//! Helpers shared by transformations and passes.

use std::collections::{BTreeMap, HashSet};

use morph_ir::types::width_mask;
use morph_ir::{Definition, Id, Instruction, InstructionLocation, IrContext, Opcode, Type};

use crate::fact_manager::FactManager;

/// An id is fresh if it is nonzero and nothing in the module defines it
pub fn is_fresh_id(ctx: &IrContext, id: Id) -> bool {
    id.0 != 0 && !ctx.is_defined(id)
}

/// True if every id is fresh and no id appears twice
pub fn ids_are_fresh_and_distinct(ctx: &IrContext, ids: &[Id]) -> bool {
    let mut seen = HashSet::new();
    ids.iter().all(|id| is_fresh_id(ctx, *id) && seen.insert(*id))
}

/// Whether executing the instruction can only compute a value. Everything
/// else (memory access, calls, barriers, ...) must not be executed
/// speculatively.
pub fn instruction_has_no_side_effects(inst: &Instruction) -> bool {
    if inst.opcode.is_type_declaration() || inst.opcode.is_constant() {
        return true;
    }
    matches!(
        inst.opcode,
        Opcode::Undef
            | Opcode::AccessChain
            | Opcode::IAdd
            | Opcode::ISub
            | Opcode::IMul
            | Opcode::SDiv
            | Opcode::UDiv
            | Opcode::SNegate
            | Opcode::FAdd
            | Opcode::FSub
            | Opcode::FMul
            | Opcode::FDiv
            | Opcode::BitwiseOr
            | Opcode::BitwiseXor
            | Opcode::BitwiseAnd
            | Opcode::Not
            | Opcode::BitFieldInsert
            | Opcode::BitFieldUExtract
            | Opcode::ShiftLeftLogical
            | Opcode::ShiftRightLogical
            | Opcode::LogicalAnd
            | Opcode::LogicalOr
            | Opcode::LogicalNot
            | Opcode::IEqual
            | Opcode::INotEqual
            | Opcode::SLessThan
            | Opcode::SGreaterThan
            | Opcode::ULessThan
            | Opcode::CompositeConstruct
            | Opcode::CompositeExtract
            | Opcode::CompositeInsert
            | Opcode::CopyObject
            | Opcode::Select
            | Opcode::Nop
    )
}

/// True if `id` may be used by the instruction at `index` in `block`. An
/// `index` equal to the block length asks about the end of the block.
pub fn id_is_available_before_instruction(
    ctx: &IrContext,
    block: Id,
    index: usize,
    id: Id,
) -> bool {
    let Some((function, _)) = ctx.cfg().location(block) else {
        return false;
    };
    match ctx.def_use().definition(id) {
        Some(Definition::Instruction(InstructionLocation::Global(_))) => true,
        Some(Definition::Instruction(InstructionLocation::Parameter { function: f, .. })) => {
            f == function
        }
        Some(Definition::Instruction(InstructionLocation::Block {
            function: f,
            block: b,
            index: def_index,
        })) => {
            if f != function {
                return false;
            }
            let def_block = ctx.module().functions[f].blocks[b].label;
            if def_block == block {
                return def_index < index;
            }
            if !ctx.is_reachable(block) {
                // Code that never runs may refer to anything in its function
                return true;
            }
            ctx.block_dominates(def_block, block)
        }
        Some(Definition::Label { .. }) | Some(Definition::Function(_)) | None => false,
    }
}

pub fn id_is_available_at_end_of_block(ctx: &IrContext, block: Id, id: Id) -> bool {
    let len = ctx.block(block).map_or(0, |b| b.len());
    id_is_available_before_instruction(ctx, block, len, id)
}

/// True if `id` may replace the operand `operand_index` of the instruction at
/// `location`. Phi operands are checked at the end of the matching
/// predecessor.
pub fn id_is_available_at_use(
    ctx: &IrContext,
    location: InstructionLocation,
    operand_index: usize,
    id: Id,
) -> bool {
    let InstructionLocation::Block {
        function,
        block,
        index,
    } = location
    else {
        return false;
    };
    let Some(inst) = ctx.module().instruction(location) else {
        return false;
    };
    let label = ctx.module().functions[function].blocks[block].label;
    if inst.opcode == Opcode::Phi {
        if inst.result_id == Some(id) {
            return false;
        }
        return match inst.id_operand(operand_index + 1) {
            Some(pred) => id_is_available_at_end_of_block(ctx, pred, id),
            None => false,
        };
    }
    id_is_available_before_instruction(ctx, label, index, id)
}

/// True if a new instruction may be inserted at `index` of `block`
pub fn can_insert_before(ctx: &IrContext, block: Id, index: usize) -> bool {
    let Some(b) = ctx.block(block) else {
        return false;
    };
    let Some(inst) = b.instructions.get(index) else {
        return false;
    };
    if matches!(inst.opcode, Opcode::Phi | Opcode::Variable) {
        return false;
    }
    // Nothing may come between a merge instruction and its terminator
    !(inst.opcode.is_terminator() && b.merge_instruction().is_some())
}

/// Types are equal, or are integer scalars or vectors differing only in
/// signedness
pub fn types_equal_up_to_sign(ctx: &IrContext, a: Id, b: Id) -> bool {
    if a == b {
        return true;
    }
    match (ctx.get_type(a), ctx.get_type(b)) {
        (Some(Type::Int { width: wa, .. }), Some(Type::Int { width: wb, .. })) => wa == wb,
        (
            Some(Type::Vector {
                component: ca,
                count: na,
            }),
            Some(Type::Vector {
                component: cb,
                count: nb,
            }),
        ) => na == nb && types_equal_up_to_sign(ctx, ca, cb),
        (Some(ta), Some(tb)) => ta == tb,
        _ => false,
    }
}

/// Reachable blocks of `function` that end in a return
pub fn reachable_return_blocks(ctx: &IrContext, function: Id) -> Vec<Id> {
    let Some(f) = ctx.function(function) else {
        return Vec::new();
    };
    f.blocks
        .iter()
        .filter(|b| b.terminator().is_some_and(|t| t.opcode.is_return()))
        .map(|b| b.label)
        .filter(|label| ctx.is_reachable(*label))
        .collect()
}

/// Values usable anywhere after the entry block of `function`, keyed by
/// type id; the first such value of each type is kept
pub fn available_ids_after_entry_block(ctx: &IrContext, function: Id) -> BTreeMap<Id, Id> {
    let mut available = BTreeMap::new();
    let Some(f) = ctx.function(function) else {
        return available;
    };
    let entry = f.entry().map(|b| b.instructions.as_slice()).unwrap_or(&[]);
    let candidates = ctx
        .module()
        .globals
        .iter()
        .chain(f.params.iter())
        .chain(entry.iter());
    for inst in candidates {
        let (Some(ty), Some(id)) = (inst.result_type, inst.result_id) else {
            continue;
        };
        if ctx.get_type(ty).is_some_and(|t| t.is_void()) {
            continue;
        }
        available.entry(ty).or_insert(id);
    }
    available
}

/// Every id in scope somewhere in `function` that holds a value: global
/// constants, undefs and variables, parameters and instruction results
pub fn value_ids_in_function(ctx: &IrContext, function: Id) -> Vec<Id> {
    let Some(f) = ctx.function(function) else {
        return Vec::new();
    };
    ctx.module()
        .globals
        .iter()
        .chain(f.params.iter())
        .chain(f.blocks.iter().flat_map(|b| b.instructions.iter()))
        .filter(|inst| {
            inst.result_type
                .and_then(|ty| ctx.get_type(ty))
                .is_some_and(|ty| !ty.is_void())
        })
        .filter_map(|inst| inst.result_id)
        .collect()
}

/// The unique predecessor of a loop header from outside the loop
pub fn find_loop_preheader(ctx: &IrContext, header: Id) -> Option<Id> {
    if !ctx.structured_cfg().is_loop_header(header) {
        return None;
    }
    let mut preheader = None;
    for pred in ctx.predecessors(header) {
        if ctx.block_dominates(header, *pred) {
            continue;
        }
        if preheader.is_some() {
            return None;
        }
        preheader = Some(*pred);
    }
    preheader
}

/// A declared scalar integer constant whose irrelevance matches
/// `is_irrelevant`
pub fn find_int_constant(
    ctx: &IrContext,
    facts: &FactManager,
    bits: u64,
    width: u32,
    signed: bool,
    is_irrelevant: bool,
) -> Option<Id> {
    let type_id = ctx.find_int_type(width, signed)?;
    let bits = bits & width_mask(width);
    ctx.module()
        .globals
        .iter()
        .filter(|inst| {
            inst.opcode == Opcode::Constant
                && inst.result_type == Some(type_id)
                && inst.literal_operand(0).map(|v| v & width_mask(width)) == Some(bits)
        })
        .filter_map(|inst| inst.result_id)
        .find(|id| facts.id_is_irrelevant(*id) == is_irrelevant)
}

pub fn find_bool_constant(
    ctx: &IrContext,
    facts: &FactManager,
    value: bool,
    is_irrelevant: bool,
) -> Option<Id> {
    let type_id = ctx.find_bool_type()?;
    let opcode = if value {
        Opcode::ConstantTrue
    } else {
        Opcode::ConstantFalse
    };
    ctx.module()
        .globals
        .iter()
        .filter(|inst| inst.opcode == opcode && inst.result_type == Some(type_id))
        .filter_map(|inst| inst.result_id)
        .find(|id| facts.id_is_irrelevant(*id) == is_irrelevant)
}
