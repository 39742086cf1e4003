use serde::{Deserialize, Serialize};
use tilefuse::ir::print_module;

use crate::compiler::TritonWrapperResult;
use crate::launch::LaunchDimensions;

pub const KERNEL_ARTIFACT_VERSION: u32 = 1;

/// Serializable summary of a generated kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelArtifact {
    pub artifact_version: u32,
    pub name: String,
    pub launch_dimensions: LaunchDimensions,
    pub shared_mem_bytes: i64,
    #[serde(default)]
    pub cluster_dim: Option<[i64; 3]>,
    /// Printed tile-IR module.
    pub ir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asm: Option<String>,
}

impl KernelArtifact {
    pub fn new(result: &TritonWrapperResult) -> Self {
        Self {
            artifact_version: KERNEL_ARTIFACT_VERSION,
            name: result.module.name.clone(),
            launch_dimensions: result.launch_dimensions,
            shared_mem_bytes: result.shared_mem_bytes,
            cluster_dim: result.cluster_dim,
            ir: print_module(&result.module),
            asm: result.asm.clone(),
        }
    }
}
