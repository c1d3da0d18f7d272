use std::collections::HashMap;

use morph_ir::{Function, Id, Instruction, InstructionLocation, IrContext, Opcode, Operand};
use serde::{Deserialize, Serialize};

use super::TransformationContext;
use crate::fact_manager::Fact;
use crate::region;
use crate::util;

/// Move the single-entry/single-exit region from `entry_block` to
/// `exit_block` into a new function and call it in its place.
///
/// Values flowing into the region become parameters; values flowing out are
/// returned in a struct and extracted again by the caller under their
/// original ids. The exit block's merge instruction and terminator stay in
/// the caller, which keeps the entry block's label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineFunction {
    pub entry_block: Id,
    pub exit_block: Id,
    pub new_function_struct_return_type_id: Id,
    /// Used only when no function type with the right signature exists
    pub new_function_type_id: Id,
    pub new_function_id: Id,
    pub new_function_region_entry_block: Id,
    pub new_caller_result_id: Id,
    pub new_callee_result_id: Id,
    pub input_id_to_fresh_id: Vec<(Id, Id)>,
    pub output_id_to_fresh_id: Vec<(Id, Id)>,
}

/// Ids defined in the function outside `region` and used inside it. The
/// exit block's merge instruction and terminator do not count: they stay
/// with the caller.
pub fn region_input_ids(ctx: &IrContext, region: &[Id], exit: Id) -> Vec<Id> {
    let mut inputs = Vec::new();
    for label in region {
        let Some(block) = ctx.block(*label) else {
            continue;
        };
        for inst in &block.instructions {
            if *label == exit && (inst.opcode.is_merge() || inst.opcode.is_terminator()) {
                continue;
            }
            for (_, id) in inst.value_operands() {
                if inputs.contains(&id) || !is_local_value(ctx, id) {
                    continue;
                }
                let defined_inside = ctx
                    .block_of_definition(id)
                    .is_some_and(|b| region.contains(&b));
                if !defined_inside {
                    inputs.push(id);
                }
            }
        }
    }
    inputs
}

/// Ids defined inside `region` that are used outside it, or by the exit
/// block's merge instruction or terminator
pub fn region_output_ids(ctx: &IrContext, region: &[Id], exit: Id) -> Vec<Id> {
    let module = ctx.module();
    let mut outputs = Vec::new();
    for label in region {
        let Some(block) = ctx.block(*label) else {
            continue;
        };
        for id in block.instructions.iter().filter_map(|inst| inst.result_id) {
            let escapes = ctx.def_use().uses(id).iter().any(|used| {
                let InstructionLocation::Block {
                    function,
                    block,
                    index,
                } = used.location
                else {
                    return false;
                };
                let use_block = &module.functions[function].blocks[block];
                if !region.contains(&use_block.label) {
                    return true;
                }
                let opcode = use_block.instructions[index].opcode;
                use_block.label == exit && (opcode.is_merge() || opcode.is_terminator())
            });
            if escapes {
                outputs.push(id);
            }
        }
    }
    outputs
}

/// Parameters and results of instructions inside blocks
fn is_local_value(ctx: &IrContext, id: Id) -> bool {
    match ctx.def_use().definition(id) {
        Some(morph_ir::Definition::Instruction(
            InstructionLocation::Parameter { .. } | InstructionLocation::Block { .. },
        )) => true,
        _ => false,
    }
}

fn lookup(map: &[(Id, Id)], id: Id) -> Option<Id> {
    map.iter().find(|(from, _)| *from == id).map(|(_, to)| *to)
}

impl OutlineFunction {
    pub fn is_applicable(&self, ctx: &IrContext, _tc: &TransformationContext) -> bool {
        let (entry, exit) = (self.entry_block, self.exit_block);
        let (Some(function), Some(exit_function)) =
            (ctx.function_of_block(entry), ctx.function_of_block(exit))
        else {
            return false;
        };
        if function.id != exit_function.id
            || !ctx.is_reachable(entry)
            || !region::is_single_entry_single_exit(ctx, entry, exit)
        {
            return false;
        }
        let scfg = ctx.structured_cfg();
        if scfg.is_loop_header(entry) || scfg.is_loop_header(exit) {
            return false;
        }
        if ctx
            .block(entry)
            .and_then(|b| b.instructions.first())
            .map_or(true, |first| first.opcode == Opcode::Phi)
        {
            return false;
        }

        let region = region::outline_region(ctx, entry, exit);
        for label in &region {
            let Some(block) = ctx.block(*label) else {
                return false;
            };
            // Variables must stay in the caller's entry block
            if block.instructions.iter().any(|i| i.opcode == Opcode::Variable) {
                return false;
            }
            if *label != exit {
                let Some(terminator) = block.terminator() else {
                    return false;
                };
                if terminator.opcode.is_return()
                    || !terminator.successors().iter().all(|s| region.contains(s))
                {
                    return false;
                }
                if let Some(construct) = scfg.construct(*label) {
                    let inside = region.contains(&construct.merge)
                        && construct.continue_target.map_or(true, |c| region.contains(&c));
                    if !inside {
                        return false;
                    }
                }
            }
            if *label != entry {
                let outside_header = scfg
                    .headers_merging_at(*label)
                    .iter()
                    .chain(scfg.headers_continuing_at(*label))
                    .any(|header| !region.contains(header));
                if outside_header {
                    return false;
                }
            }
        }

        let mut fresh = vec![
            self.new_function_struct_return_type_id,
            self.new_function_type_id,
            self.new_function_id,
            self.new_function_region_entry_block,
            self.new_caller_result_id,
            self.new_callee_result_id,
        ];
        for input in region_input_ids(ctx, &region, exit) {
            let Some(fresh_id) = lookup(&self.input_id_to_fresh_id, input) else {
                return false;
            };
            if ctx.type_of(input).is_some_and(|ty| ty.is_pointer()) {
                let is_variable_or_param = ctx.get_def(input).is_some_and(|def| {
                    matches!(def.opcode, Opcode::Variable | Opcode::FunctionParameter)
                });
                if !is_variable_or_param {
                    return false;
                }
            }
            fresh.push(fresh_id);
        }
        let outputs = region_output_ids(ctx, &region, exit);
        for output in &outputs {
            let Some(fresh_id) = lookup(&self.output_id_to_fresh_id, *output) else {
                return false;
            };
            match ctx.type_of(*output) {
                Some(ty) if !ty.is_pointer() && !ty.is_void() && !ty.is_opaque() => {}
                _ => return false,
            }
            fresh.push(fresh_id);
        }
        if outputs.is_empty() && ctx.find_void_type().is_none() {
            return false;
        }
        util::ids_are_fresh_and_distinct(ctx, &fresh)
    }

    pub fn apply(&self, ctx: &mut IrContext, tc: &mut TransformationContext) {
        let (entry, exit) = (self.entry_block, self.exit_block);
        let function_id = ctx
            .function_of_block(entry)
            .expect("region entry must exist")
            .id;
        let region = region::outline_region(ctx, entry, exit);
        let inputs = region_input_ids(ctx, &region, exit);
        let outputs = region_output_ids(ctx, &region, exit);
        let type_of = |id: &Id| ctx.type_id_of(*id).expect("region values have types");
        let input_types: Vec<Id> = inputs.iter().map(type_of).collect();
        let output_types: Vec<Id> = outputs.iter().map(type_of).collect();

        let return_type = if outputs.is_empty() {
            ctx.find_void_type().expect("void type must exist")
        } else {
            self.new_function_struct_return_type_id
        };
        let existing_function_type = if outputs.is_empty() {
            ctx.find_function_type(return_type, &input_types)
        } else {
            None
        };
        let function_type = existing_function_type.unwrap_or(self.new_function_type_id);

        let mut rename: HashMap<Id, Id> = HashMap::new();
        rename.insert(entry, self.new_function_region_entry_block);
        for id in &inputs {
            rename.insert(*id, lookup(&self.input_id_to_fresh_id, *id).expect("input is mapped"));
        }
        for id in &outputs {
            rename.insert(*id, lookup(&self.output_id_to_fresh_id, *id).expect("output is mapped"));
        }

        let mut callee = Function::new(self.new_function_id, return_type, function_type);
        for (id, ty) in inputs.iter().zip(&input_types) {
            callee.add_param(Instruction::function_parameter(*ty, rename[id]));
        }

        let exit_block = ctx.block(exit).expect("region exit must exist");
        let exit_tail_len = 1 + usize::from(exit_block.merge_instruction().is_some());
        let exit_tail = exit_block.instructions[exit_block.len() - exit_tail_len..].to_vec();

        let ordered = std::iter::once(entry).chain(region.iter().copied().filter(|l| *l != entry));
        for label in ordered {
            let mut block = ctx.block(label).expect("region block must exist").clone();
            if label == exit {
                let keep = block.len() - exit_tail_len;
                block.instructions.truncate(keep);
            }
            block.label = rename.get(&label).copied().unwrap_or(label);
            for inst in &mut block.instructions {
                if let Some(result) = inst.result_id.and_then(|id| rename.get(&id)) {
                    inst.result_id = Some(*result);
                }
                for operand in &mut inst.operands {
                    if let Operand::Id(id) = operand {
                        if let Some(renamed) = rename.get(id) {
                            *id = *renamed;
                        }
                    }
                }
            }
            if label == exit {
                if outputs.is_empty() {
                    block.add_instruction(Instruction::return_void());
                } else {
                    let returned: Vec<Id> = outputs.iter().map(|id| rename[id]).collect();
                    block.add_instruction(Instruction::composite_construct(
                        return_type,
                        self.new_callee_result_id,
                        &returned,
                    ));
                    block.add_instruction(Instruction::return_value(self.new_callee_result_id));
                }
            }
            callee.add_block(block);
        }

        let mut caller_entry = vec![Instruction::function_call(
            return_type,
            self.new_caller_result_id,
            self.new_function_id,
            &inputs,
        )];
        for (index, (id, ty)) in outputs.iter().zip(&output_types).enumerate() {
            caller_entry.push(Instruction::composite_extract(
                *ty,
                *id,
                self.new_caller_result_id,
                &[index as u32],
            ));
        }
        caller_entry.extend(exit_tail);

        let dead_entry = tc.fact_manager.block_is_dead(entry);
        let module = ctx.module_mut();
        if !outputs.is_empty() {
            module.add_global(Instruction::type_struct(return_type, &output_types));
        }
        if existing_function_type.is_none() {
            module.add_global(Instruction::type_function(
                function_type,
                return_type,
                &input_types,
            ));
        }

        let function = module
            .function_mut(function_id)
            .expect("caller must exist");
        for label in region.iter().filter(|l| **l != entry) {
            function.remove_block(*label);
        }
        let entry_block = function.block_mut(entry).expect("region entry must exist");
        entry_block.instructions = caller_entry;
        if exit != entry {
            for successor in entry_block.successors() {
                if let Some(block) = function.block_mut(successor) {
                    block.replace_phi_predecessor(exit, entry);
                }
            }
        }

        module.add_function(callee);
        for id in [
            self.new_function_struct_return_type_id,
            self.new_function_type_id,
            self.new_function_id,
            self.new_function_region_entry_block,
            self.new_caller_result_id,
            self.new_callee_result_id,
        ] {
            module.update_id_bound(id);
        }

        for (original, fresh) in inputs.iter().chain(&outputs).map(|id| (*id, rename[id])) {
            if tc.fact_manager.id_is_irrelevant(original) {
                tc.fact_manager
                    .maybe_add_fact(Fact::IdIsIrrelevant { id: fresh }, ctx);
            }
            if tc.fact_manager.pointee_value_is_irrelevant(original) {
                tc.fact_manager
                    .maybe_add_fact(Fact::PointeeValueIsIrrelevant { pointer_id: fresh }, ctx);
            }
        }
        if dead_entry {
            tc.fact_manager
                .add_fact_block_is_dead(self.new_function_region_entry_block, ctx);
        }
    }
}
