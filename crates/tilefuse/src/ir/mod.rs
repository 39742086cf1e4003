//! Tile IR: the block-level program a kernel emitter produces.
//!
//! The operation set mirrors the Triton dialect closely enough that the
//! printed form can be handed to an external Triton compiler, while staying
//! small enough for the reference interpreter to execute directly.

mod func;
pub mod passes;
mod printer;
mod ops;
mod types;
mod verify;

pub use func::{ArgAttrs, Func, FuncBuilder, Module};
pub use ops::{
    BinaryOp, Block, CastOp, CmpFPredicate, CmpIPredicate, Constant, OpKind, Operation, Padding,
    ProgramIdDim, UnaryOp, ValueId,
};
pub use printer::print_module;
pub use types::{ScalarType, TensorType, Type};
pub use verify::{verify_func, verify_module, VerifyError};
