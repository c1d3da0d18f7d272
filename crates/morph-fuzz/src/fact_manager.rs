//! Facts the fuzzer knows about a module beyond what the IR itself states.
//!
//! Facts are only ever added, never retracted. Four kinds are tracked:
//! irrelevant ids, pointers whose pointee value is irrelevant, dead blocks and
//! data synonyms. Synonyms form an equivalence relation over data
//! descriptors, so `a = b` and `b = c` imply `a = c`.
//!
//! An id is never both irrelevant and part of a synonym fact; adding a fact
//! that would break this is a caller bug and panics.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use morph_ir::{Id, IrContext, Type};
use serde::{Deserialize, Serialize};

use crate::util;

/// An id, or a component of a composite id reached through `index`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataDescriptor {
    pub object: Id,
    pub index: Vec<u32>,
}

impl DataDescriptor {
    pub fn new(object: Id, index: Vec<u32>) -> Self {
        Self { object, index }
    }

    /// Descriptor for the whole of `object`
    pub fn whole(object: Id) -> Self {
        Self::new(object, Vec::new())
    }

    fn child(&self, component: u32) -> Self {
        let mut index = self.index.clone();
        index.push(component);
        Self::new(self.object, index)
    }
}

impl fmt::Display for DataDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object)?;
        for component in &self.index {
            write!(f, "[{}]", component)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fact {
    IdIsIrrelevant { id: Id },
    PointeeValueIsIrrelevant { pointer_id: Id },
    BlockIsDead { block_id: Id },
    DataSynonym { first: DataDescriptor, second: DataDescriptor },
}

/// Union-find with eager path compression: every element maps straight to
/// the representative of its class.
#[derive(Debug, Clone)]
struct EquivalenceRelation<T: Ord + Clone> {
    representative: BTreeMap<T, T>,
    classes: BTreeMap<T, BTreeSet<T>>,
}

impl<T: Ord + Clone> Default for EquivalenceRelation<T> {
    fn default() -> Self {
        Self {
            representative: BTreeMap::new(),
            classes: BTreeMap::new(),
        }
    }
}

impl<T: Ord + Clone> EquivalenceRelation<T> {
    fn contains(&self, value: &T) -> bool {
        self.representative.contains_key(value)
    }

    fn register(&mut self, value: &T) {
        if !self.contains(value) {
            self.representative.insert(value.clone(), value.clone());
            self.classes
                .insert(value.clone(), BTreeSet::from([value.clone()]));
        }
    }

    fn make_equivalent(&mut self, a: &T, b: &T) {
        self.register(a);
        self.register(b);
        let root_a = self.representative[a].clone();
        let root_b = self.representative[b].clone();
        if root_a == root_b {
            return;
        }
        // Fold the smaller class into the larger one
        let (keep, fold) = if self.classes[&root_a].len() >= self.classes[&root_b].len() {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        let moved = self.classes.remove(&fold).unwrap_or_default();
        for member in &moved {
            self.representative.insert(member.clone(), keep.clone());
        }
        if let Some(class) = self.classes.get_mut(&keep) {
            class.extend(moved);
        }
    }

    fn is_equivalent(&self, a: &T, b: &T) -> bool {
        if a == b {
            return true;
        }
        match (self.representative.get(a), self.representative.get(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    fn class_of(&self, value: &T) -> impl Iterator<Item = &T> {
        self.representative
            .get(value)
            .and_then(|root| self.classes.get(root))
            .into_iter()
            .flatten()
    }

    fn classes(&self) -> impl Iterator<Item = &BTreeSet<T>> {
        self.classes.values()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FactManager {
    irrelevant_ids: BTreeSet<Id>,
    irrelevant_pointees: BTreeSet<Id>,
    dead_blocks: BTreeSet<Id>,
    synonyms: EquivalenceRelation<DataDescriptor>,
    facts: Vec<Fact>,
}

impl FactManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `fact` if it is well-formed for the module; returns false and
    /// leaves the manager untouched otherwise
    pub fn maybe_add_fact(&mut self, fact: Fact, ctx: &IrContext) -> bool {
        if !self.fact_is_well_formed(&fact, ctx) {
            return false;
        }
        match &fact {
            Fact::IdIsIrrelevant { id } => {
                if !self.irrelevant_ids.insert(*id) {
                    return true;
                }
            }
            Fact::PointeeValueIsIrrelevant { pointer_id } => {
                if !self.irrelevant_pointees.insert(*pointer_id) {
                    return true;
                }
            }
            Fact::BlockIsDead { block_id } => {
                if !self.dead_blocks.insert(*block_id) {
                    return true;
                }
            }
            Fact::DataSynonym { first, second } => {
                if self.synonyms.is_equivalent(first, second) {
                    return true;
                }
                self.add_synonym_with_components(first, second, ctx);
            }
        }
        self.facts.push(fact);
        true
    }

    /// Add a fact the caller knows to be well-formed
    pub fn add_fact(&mut self, fact: Fact, ctx: &IrContext) {
        let description = format!("{:?}", fact);
        assert!(
            self.maybe_add_fact(fact, ctx),
            "fact is not well-formed for this module: {}",
            description
        );
    }

    pub fn add_fact_id_is_irrelevant(&mut self, id: Id, ctx: &IrContext) {
        self.add_fact(Fact::IdIsIrrelevant { id }, ctx);
    }

    pub fn add_fact_value_of_pointee_is_irrelevant(&mut self, pointer_id: Id, ctx: &IrContext) {
        self.add_fact(Fact::PointeeValueIsIrrelevant { pointer_id }, ctx);
    }

    pub fn add_fact_block_is_dead(&mut self, block_id: Id, ctx: &IrContext) {
        self.add_fact(Fact::BlockIsDead { block_id }, ctx);
    }

    pub fn add_fact_data_synonym(
        &mut self,
        first: DataDescriptor,
        second: DataDescriptor,
        ctx: &IrContext,
    ) {
        self.add_fact(Fact::DataSynonym { first, second }, ctx);
    }

    fn fact_is_well_formed(&self, fact: &Fact, ctx: &IrContext) -> bool {
        match fact {
            Fact::IdIsIrrelevant { id } => {
                let non_pointer = ctx.type_of(*id).is_some_and(|ty| !ty.is_pointer());
                non_pointer && !self.takes_part_in_synonyms(*id)
            }
            Fact::PointeeValueIsIrrelevant { pointer_id } => {
                ctx.type_of(*pointer_id).is_some_and(|ty| ty.is_pointer())
            }
            Fact::BlockIsDead { block_id } => ctx.block(*block_id).is_some(),
            Fact::DataSynonym { first, second } => {
                if self.id_is_irrelevant(first.object) || self.id_is_irrelevant(second.object) {
                    return false;
                }
                match (
                    descriptor_type(ctx, first),
                    descriptor_type(ctx, second),
                ) {
                    (Some(a), Some(b)) => util::types_equal_up_to_sign(ctx, a, b),
                    _ => false,
                }
            }
        }
    }

    fn takes_part_in_synonyms(&self, id: Id) -> bool {
        self.synonyms.classes().any(|class| {
            class.len() > 1 && class.iter().any(|descriptor| descriptor.object == id)
        })
    }

    /// Record `first = second`, then the same for their components where the
    /// component count is known from the type
    fn add_synonym_with_components(
        &mut self,
        first: &DataDescriptor,
        second: &DataDescriptor,
        ctx: &IrContext,
    ) {
        self.synonyms.make_equivalent(first, second);
        let Some(type_id) = descriptor_type(ctx, first) else {
            return;
        };
        let count = match ctx.get_type(type_id) {
            Some(Type::Vector { count, .. }) | Some(Type::Matrix { count, .. }) => count,
            Some(Type::Struct { members }) => members.len() as u32,
            // Only arrays whose length is a declared constant
            Some(Type::Array { length, .. }) => ctx
                .find_declared_constant(length)
                .and_then(|c| c.sign_extended_value())
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            _ => 0,
        };
        for component in 0..count {
            let a = first.child(component);
            let b = second.child(component);
            if !self.synonyms.is_equivalent(&a, &b) {
                self.add_synonym_with_components(&a, &b, ctx);
            }
        }
    }

    // Queries

    pub fn id_is_irrelevant(&self, id: Id) -> bool {
        self.irrelevant_ids.contains(&id)
    }

    pub fn pointee_value_is_irrelevant(&self, pointer_id: Id) -> bool {
        self.irrelevant_pointees.contains(&pointer_id)
    }

    pub fn block_is_dead(&self, block_id: Id) -> bool {
        self.dead_blocks.contains(&block_id)
    }

    pub fn is_synonymous(&self, a: &DataDescriptor, b: &DataDescriptor) -> bool {
        self.synonyms.is_equivalent(a, b)
    }

    /// True if the whole values of `a` and `b` are known to be equal
    pub fn ids_are_synonymous(&self, a: Id, b: Id) -> bool {
        self.is_synonymous(&DataDescriptor::whole(a), &DataDescriptor::whole(b))
    }

    /// Every descriptor known to equal `descriptor`, itself excluded
    pub fn get_synonyms_for_data_descriptor(
        &self,
        descriptor: &DataDescriptor,
    ) -> Vec<DataDescriptor> {
        self.synonyms
            .class_of(descriptor)
            .filter(|other| *other != descriptor)
            .cloned()
            .collect()
    }

    pub fn get_synonyms_for_id(&self, id: Id) -> Vec<DataDescriptor> {
        self.get_synonyms_for_data_descriptor(&DataDescriptor::whole(id))
    }

    /// Ids whose whole value has at least one known synonym
    pub fn get_ids_for_which_synonyms_are_known(&self) -> Vec<Id> {
        let mut ids = BTreeSet::new();
        for class in self.synonyms.classes().filter(|class| class.len() > 1) {
            ids.extend(
                class
                    .iter()
                    .filter(|descriptor| descriptor.index.is_empty())
                    .map(|descriptor| descriptor.object),
            );
        }
        ids.into_iter().collect()
    }

    pub fn get_irrelevant_ids(&self) -> Vec<Id> {
        self.irrelevant_ids.iter().copied().collect()
    }

    pub fn get_dead_blocks(&self) -> Vec<Id> {
        self.dead_blocks.iter().copied().collect()
    }

    /// Every fact added so far, in insertion order
    pub fn all_facts(&self) -> &[Fact] {
        &self.facts
    }
}

/// Type id of the value a descriptor names
fn descriptor_type(ctx: &IrContext, descriptor: &DataDescriptor) -> Option<Id> {
    let mut type_id = ctx.type_id_of(descriptor.object)?;
    for component in &descriptor.index {
        type_id = match ctx.get_type(type_id)? {
            Type::Vector { component: c, count } | Type::Matrix { column: c, count } => {
                if *component >= count {
                    return None;
                }
                c
            }
            Type::Array { element, .. } | Type::RuntimeArray { element } => element,
            Type::Struct { members } => *members.get(*component as usize)?,
            _ => return None,
        };
    }
    Some(type_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_ir::{BasicBlock, Function, Instruction, Module, Opcode, StorageClass};

    fn module() -> Module {
        let mut module = Module::new();
        module.add_global(Instruction::type_void(Id(1)));
        module.add_global(Instruction::type_function(Id(2), Id(1), &[]));
        module.add_global(Instruction::type_int(Id(3), 32, true));
        module.add_global(Instruction::type_int(Id(4), 32, false));
        module.add_global(Instruction::type_vector(Id(5), Id(3), 2));
        module.add_global(Instruction::type_pointer(Id(6), StorageClass::Function, Id(3)));
        module.add_global(Instruction::constant(Id(3), Id(7), 1));
        module.add_global(Instruction::constant(Id(4), Id(8), 1));
        module.add_global(Instruction::constant(Id(3), Id(9), 2));
        module.add_global(Instruction::constant_composite(Id(5), Id(10), &[Id(7), Id(9)]));
        module.add_global(Instruction::type_bool(Id(11)));
        module.add_global(Instruction::type_array(Id(12), Id(3), Id(9)));
        module.add_global(Instruction::constant_composite(Id(12), Id(13), &[Id(7), Id(9)]));

        let mut f = Function::new(Id(20), Id(1), Id(2));
        f.add_block(BasicBlock::with_instructions(
            Id(21),
            vec![
                Instruction::variable(Id(6), Id(22), StorageClass::Function),
                Instruction::binary(Opcode::IAdd, Id(3), Id(23), Id(7), Id(9)),
                Instruction::composite_construct(Id(5), Id(24), &[Id(7), Id(9)]),
                Instruction::composite_construct(Id(12), Id(25), &[Id(9), Id(7)]),
                Instruction::return_void(),
            ],
        ));
        module.add_function(f);
        module
    }

    #[test]
    fn test_irrelevance_facts() {
        let ctx = IrContext::new(module());
        let mut facts = FactManager::new();

        facts.add_fact_id_is_irrelevant(Id(23), &ctx);
        assert!(facts.id_is_irrelevant(Id(23)));
        assert!(!facts.id_is_irrelevant(Id(7)));

        // Pointers cannot be irrelevant themselves, only their pointees
        assert!(!facts.maybe_add_fact(Fact::IdIsIrrelevant { id: Id(22) }, &ctx));
        facts.add_fact_value_of_pointee_is_irrelevant(Id(22), &ctx);
        assert!(facts.pointee_value_is_irrelevant(Id(22)));
        assert!(!facts.maybe_add_fact(Fact::PointeeValueIsIrrelevant { pointer_id: Id(23) }, &ctx));

        facts.add_fact_block_is_dead(Id(21), &ctx);
        assert!(facts.block_is_dead(Id(21)));
        assert!(!facts.maybe_add_fact(Fact::BlockIsDead { block_id: Id(99) }, &ctx));

        assert_eq!(facts.all_facts().len(), 3);
        assert_eq!(facts.get_irrelevant_ids(), vec![Id(23)]);
    }

    #[test]
    fn test_synonyms_are_an_equivalence_relation() {
        let ctx = IrContext::new(module());
        let mut facts = FactManager::new();
        let a = DataDescriptor::whole(Id(7));
        let b = DataDescriptor::whole(Id(8));
        let c = DataDescriptor::new(Id(24), vec![0]);

        // Signedness is ignored when comparing types
        facts.add_fact_data_synonym(a.clone(), b.clone(), &ctx);
        facts.add_fact_data_synonym(b.clone(), c.clone(), &ctx);

        assert!(facts.is_synonymous(&a, &c));
        assert!(facts.is_synonymous(&c, &a));
        assert!(facts.is_synonymous(&a, &a));
        assert!(!facts.is_synonymous(&a, &DataDescriptor::whole(Id(9))));
        assert_eq!(facts.get_synonyms_for_id(Id(7)).len(), 2);
        assert_eq!(facts.get_ids_for_which_synonyms_are_known(), vec![Id(7), Id(8)]);
    }

    #[test]
    fn test_composite_synonyms_imply_component_synonyms() {
        let ctx = IrContext::new(module());
        let mut facts = FactManager::new();
        facts.add_fact_data_synonym(
            DataDescriptor::whole(Id(10)),
            DataDescriptor::whole(Id(24)),
            &ctx,
        );
        assert!(facts.is_synonymous(
            &DataDescriptor::new(Id(10), vec![1]),
            &DataDescriptor::new(Id(24), vec![1]),
        ));
        assert!(!facts.is_synonymous(
            &DataDescriptor::new(Id(10), vec![0]),
            &DataDescriptor::new(Id(24), vec![1]),
        ));
    }

    #[test]
    fn test_array_synonyms_imply_element_synonyms() {
        let ctx = IrContext::new(module());
        let mut facts = FactManager::new();
        facts.add_fact_data_synonym(
            DataDescriptor::whole(Id(13)),
            DataDescriptor::whole(Id(25)),
            &ctx,
        );
        for element in 0..2 {
            assert!(facts.is_synonymous(
                &DataDescriptor::new(Id(13), vec![element]),
                &DataDescriptor::new(Id(25), vec![element]),
            ));
        }
        assert!(!facts.is_synonymous(
            &DataDescriptor::new(Id(13), vec![2]),
            &DataDescriptor::new(Id(25), vec![2]),
        ));
    }

    #[test]
    fn test_default_fact_manager_is_empty() {
        let facts = FactManager::default();
        assert!(facts.all_facts().is_empty());
        assert!(facts.get_ids_for_which_synonyms_are_known().is_empty());
    }

    #[test]
    fn test_irrelevant_and_synonymous_are_exclusive() {
        let ctx = IrContext::new(module());
        let mut facts = FactManager::new();
        facts.add_fact_id_is_irrelevant(Id(23), &ctx);
        assert!(!facts.maybe_add_fact(
            Fact::DataSynonym {
                first: DataDescriptor::whole(Id(23)),
                second: DataDescriptor::whole(Id(9)),
            },
            &ctx
        ));

        facts.add_fact_data_synonym(
            DataDescriptor::whole(Id(7)),
            DataDescriptor::whole(Id(8)),
            &ctx,
        );
        assert!(!facts.maybe_add_fact(Fact::IdIsIrrelevant { id: Id(7) }, &ctx));
    }

    #[test]
    fn test_mismatched_synonym_types_are_rejected() {
        let ctx = IrContext::new(module());
        let mut facts = FactManager::new();
        assert!(!facts.maybe_add_fact(
            Fact::DataSynonym {
                first: DataDescriptor::whole(Id(7)),
                second: DataDescriptor::whole(Id(10)),
            },
            &ctx
        ));
        assert!(facts.all_facts().is_empty());
    }

    #[test]
    #[should_panic(expected = "not well-formed")]
    fn test_add_fact_panics_on_precondition_violation() {
        let ctx = IrContext::new(module());
        let mut facts = FactManager::new();
        facts.add_fact_id_is_irrelevant(Id(22), &ctx);
    }

    #[test]
    fn test_fact_serialization() {
        let fact = Fact::DataSynonym {
            first: DataDescriptor::new(Id(3), vec![1, 0]),
            second: DataDescriptor::whole(Id(4)),
        };
        let json = serde_json::to_string(&fact).unwrap();
        assert!(json.contains("data_synonym"));
        let restored: Fact = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, fact);
        assert_eq!(format!("{}", DataDescriptor::new(Id(3), vec![1, 0])), "%3[1][0]");
    }
}
