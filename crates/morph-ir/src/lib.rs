//! Structured SSA intermediate representation.
//!
//! Modules are plain data (`Module`, `Function`, `BasicBlock`, `Instruction`)
//! that serialize with serde. Analyses over a module live in an `IrContext`,
//! which recomputes them lazily after every mutation.

pub mod cfg;
pub mod context;
pub mod def_use;
pub mod dominators;
pub mod instruction;
pub mod module;
pub mod structured;
pub mod types;
pub mod validation;

pub use cfg::Cfg;
pub use context::IrContext;
pub use def_use::{DefUse, Definition, Use};
pub use dominators::DominatorTree;
pub use instruction::{Id, Instruction, Opcode, Operand, StorageClass};
pub use module::{BasicBlock, Function, InstructionLocation, Module};
pub use structured::{Construct, StructuredCfg};
pub use types::{Constant, Type};
pub use validation::validate_module;
