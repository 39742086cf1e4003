//! Tiled Triton kernel generation for matmul and row-reduction fusions.
//!
//! The entry points are [`create_triton_module`], which turns one fusion
//! computation into a verified tile-IR module together with its launch grid,
//! and [`triton_wrapper`], which additionally lowers the module through a
//! [`LoweringPipeline`] and validates the device resources it needs.

pub mod artifact;
pub mod codegen;
pub mod compiler;
mod dump;
pub mod error;
mod launch;
pub mod matmul;
pub mod module;
pub mod softmax;

pub use artifact::{KernelArtifact, KERNEL_ARTIFACT_VERSION};
pub use compiler::{
    compile_triton_module, triton_wrapper, AnalyticLowering, KernelResources, LoweredKernel,
    LoweringPipeline, TritonWrapperResult, TritonccLowering,
};
pub use error::{EmitError, EmitResult};
pub use launch::LaunchDimensions;
pub use module::{create_triton_module, EmitRequest, EmittedModule, EmitterKind};
