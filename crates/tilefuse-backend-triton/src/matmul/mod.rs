//! Tiled matmul kernels with fused prologues and epilogues.

mod addressing;
mod dims;
mod kernel;
mod launch;
pub mod precision;

pub use addressing::{input_arguments, multi_select, scope_inputs, Addressing, Side};
pub use dims::{validate_matmul_config, MatMulDims};
pub use kernel::{emit_matmul, tiling_complexity, MAX_TILING_COMPLEXITY};
pub use launch::MatMulLaunchConfig;
