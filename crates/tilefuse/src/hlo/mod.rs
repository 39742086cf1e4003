//! Computation-graph model consumed by the kernel emitters.
//!
//! A [`HloModule`] owns every node of a fusion: the fused computation itself,
//! nested fusions, and reducer computations. Node ids are unique module-wide so
//! value environments can key on them across nested computations.

mod dot;
mod module;
mod opcode;
mod types;

pub use dot::{
    non_contracting_dims, DotAlgorithm, DotAttrs, DotDimensionNumbers, Precision,
    PrecisionConfig, SparsityDescriptor,
};
pub use module::{
    scalar_reducer, Computation, ComputationBuilder, ComputationId, HloModule, Node, NodeAttrs,
    NodeId,
};
pub use opcode::{ComparisonDirection, Opcode};
pub use types::{ArrayShape, Literal, PrimitiveType, Shape};
