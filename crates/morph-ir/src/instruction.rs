//! Instruction set for the structured SSA IR.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a definition: an instruction result, a type, a function or
/// a block label. `Id(0)` never names anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(pub u32);

impl Id {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Storage class of a pointer or variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    Function,
    Private,
    Workgroup,
    Uniform,
    StorageBuffer,
    Input,
    Output,
}

impl StorageClass {
    pub fn to_literal(self) -> u64 {
        match self {
            StorageClass::Input => 1,
            StorageClass::Uniform => 2,
            StorageClass::Output => 3,
            StorageClass::Workgroup => 4,
            StorageClass::Private => 6,
            StorageClass::Function => 7,
            StorageClass::StorageBuffer => 12,
        }
    }

    pub fn from_literal(literal: u64) -> Option<Self> {
        match literal {
            1 => Some(StorageClass::Input),
            2 => Some(StorageClass::Uniform),
            3 => Some(StorageClass::Output),
            4 => Some(StorageClass::Workgroup),
            6 => Some(StorageClass::Private),
            7 => Some(StorageClass::Function),
            12 => Some(StorageClass::StorageBuffer),
            _ => None,
        }
    }
}

/// IR Opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // Types
    TypeVoid,
    TypeBool,
    TypeInt, // width, signedness
    TypeFloat, // width
    TypeVector, // component type, count
    TypeMatrix, // column type, count
    TypeArray, // element type, length constant
    TypeRuntimeArray,
    TypeStruct, // member types
    TypePointer, // storage class, pointee type
    TypeFunction, // return type, parameter types
    TypeImage,
    TypeSampler,
    TypeSampledImage,

    // Constants
    ConstantTrue,
    ConstantFalse,
    Constant, // literal bits
    ConstantComposite,
    Undef,

    // Memory
    Variable, // storage class
    Load,
    Store,
    AccessChain,

    // Functions
    FunctionParameter,
    FunctionCall, // function, arguments

    // Arithmetic
    IAdd,
    ISub,
    IMul,
    SDiv,
    UDiv,
    SNegate,
    FAdd,
    FSub,
    FMul,
    FDiv,

    // Bitwise
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    Not,
    BitFieldInsert, // base, insert, offset, count
    BitFieldUExtract, // base, offset, count
    ShiftLeftLogical,
    ShiftRightLogical,

    // Logical and comparison
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    IEqual,
    INotEqual,
    SLessThan,
    SGreaterThan,
    ULessThan,

    // Composites
    CompositeConstruct,
    CompositeExtract, // composite, literal indices
    CompositeInsert,
    CopyObject,
    Select,

    // SSA
    Phi, // (value, predecessor) pairs

    // Structured control flow
    SelectionMerge, // merge block
    LoopMerge, // merge block, continue target

    // Terminators
    Branch,
    BranchConditional,
    Return,
    ReturnValue,
    Kill,
    Unreachable,

    // Operations that cannot be predicated
    ControlBarrier,
    MemoryBarrier,
    SampledImage,

    Nop,
}

impl Opcode {
    /// Returns true if this opcode declares a type
    pub fn is_type_declaration(&self) -> bool {
        matches!(
            self,
            Opcode::TypeVoid
                | Opcode::TypeBool
                | Opcode::TypeInt
                | Opcode::TypeFloat
                | Opcode::TypeVector
                | Opcode::TypeMatrix
                | Opcode::TypeArray
                | Opcode::TypeRuntimeArray
                | Opcode::TypeStruct
                | Opcode::TypePointer
                | Opcode::TypeFunction
                | Opcode::TypeImage
                | Opcode::TypeSampler
                | Opcode::TypeSampledImage
        )
    }

    /// Returns true if this opcode declares a constant
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            Opcode::ConstantTrue
                | Opcode::ConstantFalse
                | Opcode::Constant
                | Opcode::ConstantComposite
        )
    }

    /// Returns true if this opcode ends a block
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Branch
                | Opcode::BranchConditional
                | Opcode::Return
                | Opcode::ReturnValue
                | Opcode::Kill
                | Opcode::Unreachable
        )
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Opcode::Branch | Opcode::BranchConditional)
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Opcode::Return | Opcode::ReturnValue)
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, Opcode::SelectionMerge | Opcode::LoopMerge)
    }

    /// Returns true if the operand at `index` refers to a block label rather
    /// than a value
    pub fn operand_is_label(&self, index: usize) -> bool {
        match self {
            Opcode::Phi => index % 2 == 1,
            Opcode::Branch | Opcode::SelectionMerge => index == 0,
            Opcode::BranchConditional => index == 1 || index == 2,
            Opcode::LoopMerge => index <= 1,
            _ => false,
        }
    }
}

/// A single operand: either a reference to an id or a literal word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Id(Id),
    Literal(u64),
}

impl Operand {
    pub fn as_id(&self) -> Option<Id> {
        match self {
            Operand::Id(id) => Some(*id),
            Operand::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<u64> {
        match self {
            Operand::Literal(value) => Some(*value),
            Operand::Id(_) => None,
        }
    }
}

/// A single instruction in the IR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub result_type: Option<Id>,
    pub result_id: Option<Id>,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            result_type: None,
            result_id: None,
            operands: Vec::new(),
        }
    }

    pub fn with_result(mut self, result_type: Id, result_id: Id) -> Self {
        self.result_type = Some(result_type);
        self.result_id = Some(result_id);
        self
    }

    pub fn with_result_id(mut self, result_id: Id) -> Self {
        self.result_id = Some(result_id);
        self
    }

    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    pub fn with_id_operands(mut self, ids: &[Id]) -> Self {
        self.operands.extend(ids.iter().map(|id| Operand::Id(*id)));
        self
    }

    // Type declarations

    pub fn type_void(id: Id) -> Self {
        Self::new(Opcode::TypeVoid).with_result_id(id)
    }

    pub fn type_bool(id: Id) -> Self {
        Self::new(Opcode::TypeBool).with_result_id(id)
    }

    pub fn type_int(id: Id, width: u32, signed: bool) -> Self {
        Self::new(Opcode::TypeInt)
            .with_result_id(id)
            .with_operand(Operand::Literal(width as u64))
            .with_operand(Operand::Literal(signed as u64))
    }

    pub fn type_float(id: Id, width: u32) -> Self {
        Self::new(Opcode::TypeFloat)
            .with_result_id(id)
            .with_operand(Operand::Literal(width as u64))
    }

    pub fn type_vector(id: Id, component: Id, count: u32) -> Self {
        Self::new(Opcode::TypeVector)
            .with_result_id(id)
            .with_operand(Operand::Id(component))
            .with_operand(Operand::Literal(count as u64))
    }

    pub fn type_array(id: Id, element: Id, length: Id) -> Self {
        Self::new(Opcode::TypeArray)
            .with_result_id(id)
            .with_operand(Operand::Id(element))
            .with_operand(Operand::Id(length))
    }

    pub fn type_struct(id: Id, members: &[Id]) -> Self {
        Self::new(Opcode::TypeStruct)
            .with_result_id(id)
            .with_id_operands(members)
    }

    pub fn type_pointer(id: Id, storage: StorageClass, pointee: Id) -> Self {
        Self::new(Opcode::TypePointer)
            .with_result_id(id)
            .with_operand(Operand::Literal(storage.to_literal()))
            .with_operand(Operand::Id(pointee))
    }

    pub fn type_function(id: Id, return_type: Id, params: &[Id]) -> Self {
        Self::new(Opcode::TypeFunction)
            .with_result_id(id)
            .with_operand(Operand::Id(return_type))
            .with_id_operands(params)
    }

    // Constants

    pub fn constant(result_type: Id, id: Id, bits: u64) -> Self {
        Self::new(Opcode::Constant)
            .with_result(result_type, id)
            .with_operand(Operand::Literal(bits))
    }

    pub fn constant_bool(result_type: Id, id: Id, value: bool) -> Self {
        let opcode = if value {
            Opcode::ConstantTrue
        } else {
            Opcode::ConstantFalse
        };
        Self::new(opcode).with_result(result_type, id)
    }

    pub fn constant_composite(result_type: Id, id: Id, components: &[Id]) -> Self {
        Self::new(Opcode::ConstantComposite)
            .with_result(result_type, id)
            .with_id_operands(components)
    }

    pub fn undef(result_type: Id, id: Id) -> Self {
        Self::new(Opcode::Undef).with_result(result_type, id)
    }

    // Memory

    pub fn variable(pointer_type: Id, id: Id, storage: StorageClass) -> Self {
        Self::new(Opcode::Variable)
            .with_result(pointer_type, id)
            .with_operand(Operand::Literal(storage.to_literal()))
    }

    pub fn load(result_type: Id, id: Id, pointer: Id) -> Self {
        Self::new(Opcode::Load)
            .with_result(result_type, id)
            .with_operand(Operand::Id(pointer))
    }

    pub fn store(pointer: Id, value: Id) -> Self {
        Self::new(Opcode::Store).with_id_operands(&[pointer, value])
    }

    // Values

    pub fn function_parameter(result_type: Id, id: Id) -> Self {
        Self::new(Opcode::FunctionParameter).with_result(result_type, id)
    }

    pub fn function_call(result_type: Id, id: Id, function: Id, args: &[Id]) -> Self {
        Self::new(Opcode::FunctionCall)
            .with_result(result_type, id)
            .with_operand(Operand::Id(function))
            .with_id_operands(args)
    }

    /// Create a two-operand arithmetic, bitwise or comparison instruction
    pub fn binary(opcode: Opcode, result_type: Id, id: Id, a: Id, b: Id) -> Self {
        Self::new(opcode)
            .with_result(result_type, id)
            .with_id_operands(&[a, b])
    }

    pub fn unary(opcode: Opcode, result_type: Id, id: Id, a: Id) -> Self {
        Self::new(opcode)
            .with_result(result_type, id)
            .with_operand(Operand::Id(a))
    }

    /// `count` bits of `base` starting at bit `offset`, zero-extended
    pub fn bit_field_u_extract(
        result_type: Id,
        id: Id,
        base: Id,
        offset: Id,
        count: Id,
    ) -> Self {
        Self::new(Opcode::BitFieldUExtract)
            .with_result(result_type, id)
            .with_id_operands(&[base, offset, count])
    }

    /// `base` with bits `offset..offset + count` replaced by the low bits of
    /// `insert`
    pub fn bit_field_insert(
        result_type: Id,
        id: Id,
        base: Id,
        insert: Id,
        offset: Id,
        count: Id,
    ) -> Self {
        Self::new(Opcode::BitFieldInsert)
            .with_result(result_type, id)
            .with_id_operands(&[base, insert, offset, count])
    }

    pub fn copy_object(result_type: Id, id: Id, source: Id) -> Self {
        Self::unary(Opcode::CopyObject, result_type, id, source)
    }

    pub fn select(result_type: Id, id: Id, condition: Id, if_true: Id, if_false: Id) -> Self {
        Self::new(Opcode::Select)
            .with_result(result_type, id)
            .with_id_operands(&[condition, if_true, if_false])
    }

    pub fn composite_construct(result_type: Id, id: Id, components: &[Id]) -> Self {
        Self::new(Opcode::CompositeConstruct)
            .with_result(result_type, id)
            .with_id_operands(components)
    }

    pub fn composite_extract(result_type: Id, id: Id, composite: Id, indices: &[u32]) -> Self {
        let mut inst = Self::new(Opcode::CompositeExtract)
            .with_result(result_type, id)
            .with_operand(Operand::Id(composite));
        inst.operands
            .extend(indices.iter().map(|i| Operand::Literal(*i as u64)));
        inst
    }

    /// Create a phi from `(value, predecessor)` pairs
    pub fn phi(result_type: Id, id: Id, pairs: &[(Id, Id)]) -> Self {
        let mut inst = Self::new(Opcode::Phi).with_result(result_type, id);
        for (value, pred) in pairs {
            inst.operands.push(Operand::Id(*value));
            inst.operands.push(Operand::Id(*pred));
        }
        inst
    }

    // Control flow

    pub fn selection_merge(merge_block: Id) -> Self {
        Self::new(Opcode::SelectionMerge).with_operand(Operand::Id(merge_block))
    }

    pub fn loop_merge(merge_block: Id, continue_target: Id) -> Self {
        Self::new(Opcode::LoopMerge).with_id_operands(&[merge_block, continue_target])
    }

    pub fn branch(target: Id) -> Self {
        Self::new(Opcode::Branch).with_operand(Operand::Id(target))
    }

    pub fn branch_conditional(condition: Id, if_true: Id, if_false: Id) -> Self {
        Self::new(Opcode::BranchConditional).with_id_operands(&[condition, if_true, if_false])
    }

    pub fn return_void() -> Self {
        Self::new(Opcode::Return)
    }

    pub fn return_value(value: Id) -> Self {
        Self::new(Opcode::ReturnValue).with_operand(Operand::Id(value))
    }

    pub fn unreachable() -> Self {
        Self::new(Opcode::Unreachable)
    }

    // Accessors

    pub fn id_operand(&self, index: usize) -> Option<Id> {
        self.operands.get(index).and_then(Operand::as_id)
    }

    pub fn literal_operand(&self, index: usize) -> Option<u64> {
        self.operands.get(index).and_then(Operand::as_literal)
    }

    pub fn set_operand(&mut self, index: usize, operand: Operand) {
        self.operands[index] = operand;
    }

    /// All id operands, including block labels, with their operand index
    pub fn id_operands(&self) -> impl Iterator<Item = (usize, Id)> + '_ {
        self.operands
            .iter()
            .enumerate()
            .filter_map(|(index, operand)| operand.as_id().map(|id| (index, id)))
    }

    /// Id operands that refer to values, skipping block labels
    pub fn value_operands(&self) -> impl Iterator<Item = (usize, Id)> + '_ {
        self.id_operands()
            .filter(move |(index, _)| !self.opcode.operand_is_label(*index))
    }

    /// `(value, predecessor)` pairs of a phi
    pub fn phi_pairs(&self) -> Vec<(Id, Id)> {
        debug_assert_eq!(self.opcode, Opcode::Phi);
        self.operands
            .chunks(2)
            .filter_map(|pair| match pair {
                [Operand::Id(value), Operand::Id(pred)] => Some((*value, *pred)),
                _ => None,
            })
            .collect()
    }

    /// Labels this terminator may transfer control to
    pub fn successors(&self) -> Vec<Id> {
        match self.opcode {
            Opcode::Branch => self.id_operand(0).into_iter().collect(),
            Opcode::BranchConditional => {
                let mut targets = Vec::with_capacity(2);
                for target in [self.id_operand(1), self.id_operand(2)].into_iter().flatten() {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
                targets
            }
            _ => Vec::new(),
        }
    }

    /// Replace every label operand equal to `old` with `new`
    pub fn replace_label(&mut self, old: Id, new: Id) {
        for index in 0..self.operands.len() {
            if self.opcode.operand_is_label(index) && self.operands[index] == Operand::Id(old) {
                self.operands[index] = Operand::Id(new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_class_literals() {
        for storage in [
            StorageClass::Function,
            StorageClass::Private,
            StorageClass::Workgroup,
            StorageClass::Uniform,
            StorageClass::StorageBuffer,
            StorageClass::Input,
            StorageClass::Output,
        ] {
            assert_eq!(StorageClass::from_literal(storage.to_literal()), Some(storage));
        }
        assert_eq!(StorageClass::from_literal(99), None);
    }

    #[test]
    fn test_opcode_properties() {
        assert!(Opcode::Branch.is_terminator());
        assert!(Opcode::ReturnValue.is_terminator());
        assert!(!Opcode::IAdd.is_terminator());
        assert!(Opcode::LoopMerge.is_merge());
        assert!(Opcode::TypeStruct.is_type_declaration());
        assert!(Opcode::ConstantComposite.is_constant());
        assert!(!Opcode::Undef.is_constant());

        assert!(Opcode::Phi.operand_is_label(1));
        assert!(!Opcode::Phi.operand_is_label(2));
        assert!(Opcode::BranchConditional.operand_is_label(2));
        assert!(!Opcode::BranchConditional.operand_is_label(0));
    }

    #[test]
    fn test_phi_pairs() {
        let phi = Instruction::phi(Id(1), Id(10), &[(Id(5), Id(20)), (Id(6), Id(21))]);
        assert_eq!(phi.phi_pairs(), vec![(Id(5), Id(20)), (Id(6), Id(21))]);
        let values: Vec<Id> = phi.value_operands().map(|(_, id)| id).collect();
        assert_eq!(values, vec![Id(5), Id(6)]);
    }

    #[test]
    fn test_successors() {
        let inst = Instruction::branch_conditional(Id(3), Id(4), Id(5));
        assert_eq!(inst.successors(), vec![Id(4), Id(5)]);

        let inst = Instruction::branch_conditional(Id(3), Id(4), Id(4));
        assert_eq!(inst.successors(), vec![Id(4)]);

        assert!(Instruction::return_void().successors().is_empty());
    }

    #[test]
    fn test_replace_label() {
        let mut inst = Instruction::branch_conditional(Id(4), Id(4), Id(5));
        inst.replace_label(Id(4), Id(9));
        // The condition shares the numeric value but is not a label
        assert_eq!(inst.id_operand(0), Some(Id(4)));
        assert_eq!(inst.id_operand(1), Some(Id(9)));
        assert_eq!(inst.id_operand(2), Some(Id(5)));
    }
}
