//! Decoded views of type and constant declarations.

use crate::instruction::{Id, Instruction, Opcode, StorageClass};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: Id, count: u32 },
    Matrix { column: Id, count: u32 },
    Array { element: Id, length: Id },
    RuntimeArray { element: Id },
    Struct { members: Vec<Id> },
    Pointer { storage: StorageClass, pointee: Id },
    Function { return_type: Id, params: Vec<Id> },
    Image,
    Sampler,
    SampledImage { image: Id },
}

impl Type {
    /// Decode a type declaration; returns `None` for anything else
    pub fn from_instruction(inst: &Instruction) -> Option<Self> {
        let ids = || inst.id_operands().map(|(_, id)| id);
        let ty = match inst.opcode {
            Opcode::TypeVoid => Type::Void,
            Opcode::TypeBool => Type::Bool,
            Opcode::TypeInt => Type::Int {
                width: inst.literal_operand(0)? as u32,
                signed: inst.literal_operand(1)? != 0,
            },
            Opcode::TypeFloat => Type::Float {
                width: inst.literal_operand(0)? as u32,
            },
            Opcode::TypeVector => Type::Vector {
                component: inst.id_operand(0)?,
                count: inst.literal_operand(1)? as u32,
            },
            Opcode::TypeMatrix => Type::Matrix {
                column: inst.id_operand(0)?,
                count: inst.literal_operand(1)? as u32,
            },
            Opcode::TypeArray => Type::Array {
                element: inst.id_operand(0)?,
                length: inst.id_operand(1)?,
            },
            Opcode::TypeRuntimeArray => Type::RuntimeArray {
                element: inst.id_operand(0)?,
            },
            Opcode::TypeStruct => Type::Struct {
                members: ids().collect(),
            },
            Opcode::TypePointer => Type::Pointer {
                storage: StorageClass::from_literal(inst.literal_operand(0)?)?,
                pointee: inst.id_operand(1)?,
            },
            Opcode::TypeFunction => Type::Function {
                return_type: inst.id_operand(0)?,
                params: ids().skip(1).collect(),
            },
            Opcode::TypeImage => Type::Image,
            Opcode::TypeSampler => Type::Sampler,
            Opcode::TypeSampledImage => Type::SampledImage {
                image: inst.id_operand(0)?,
            },
            _ => return None,
        };
        Some(ty)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Type::Bool)
    }

    /// Image, sampler and sampled-image values cannot be copied or merged
    pub fn is_opaque(&self) -> bool {
        matches!(self, Type::Image | Type::Sampler | Type::SampledImage { .. })
    }

    pub fn as_int(&self) -> Option<(u32, bool)> {
        match self {
            Type::Int { width, signed } => Some((*width, *signed)),
            _ => None,
        }
    }
}

/// A decoded constant declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Bool(bool),
    Int { width: u32, signed: bool, bits: u64 },
    Float { width: u32, bits: u64 },
    Composite { components: Vec<Id> },
}

impl Constant {
    /// Decode a constant given the already-decoded type of its result
    pub fn from_instruction(inst: &Instruction, ty: &Type) -> Option<Self> {
        match (inst.opcode, ty) {
            (Opcode::ConstantTrue, Type::Bool) => Some(Constant::Bool(true)),
            (Opcode::ConstantFalse, Type::Bool) => Some(Constant::Bool(false)),
            (Opcode::Constant, Type::Int { width, signed }) => Some(Constant::Int {
                width: *width,
                signed: *signed,
                bits: inst.literal_operand(0)? & width_mask(*width),
            }),
            (Opcode::Constant, Type::Float { width }) => Some(Constant::Float {
                width: *width,
                bits: inst.literal_operand(0)?,
            }),
            (Opcode::ConstantComposite, _) => Some(Constant::Composite {
                components: inst.id_operands().map(|(_, id)| id).collect(),
            }),
            _ => None,
        }
    }

    /// The value of an integer constant, sign-extended from its width
    /// regardless of the declared signedness
    pub fn sign_extended_value(&self) -> Option<i64> {
        match self {
            Constant::Int { width, bits, .. } => Some(sign_extend(*bits, *width)),
            _ => None,
        }
    }
}

pub fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

pub fn sign_extend(bits: u64, width: u32) -> i64 {
    if width >= 64 || width == 0 {
        bits as i64
    } else {
        let shift = 64 - width;
        ((bits << shift) as i64) >> shift
    }
}
