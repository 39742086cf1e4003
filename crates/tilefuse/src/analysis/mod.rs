//! Read-only analysis results consumed by the kernel emitters.

mod iter_spec;
mod tiling;

pub use iter_spec::{
    contiguous, row_major_specs, DimIterationSpec, IterationSpecFragment, Scope,
    TritonFusionAnalysis,
};
pub use tiling::{
    AffineExpr, RowTileAnalysis, SymbolicTiling, TiledComputation, TiledId, TiledInstruction,
};
