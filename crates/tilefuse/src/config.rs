use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tiling parameters chosen by the autotuner for one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TritonGemmConfig {
    pub block_m: i64,
    pub block_n: i64,
    pub block_k: i64,
    pub split_k: i64,
    #[serde(default = "default_num_stages")]
    pub num_stages: i64,
    pub num_warps: i64,
    #[serde(default = "default_num_ctas")]
    pub num_ctas: i64,
}

fn default_num_stages() -> i64 {
    1
}

fn default_num_ctas() -> i64 {
    1
}

impl TritonGemmConfig {
    pub fn new(block_m: i64, block_n: i64, block_k: i64, split_k: i64, num_warps: i64) -> Self {
        Self {
            block_m,
            block_n,
            block_k,
            split_k,
            num_stages: 1,
            num_warps,
            num_ctas: 1,
        }
    }

    pub fn with_stages(mut self, num_stages: i64) -> Self {
        self.num_stages = num_stages;
        self
    }

    pub fn with_ctas(mut self, num_ctas: i64) -> Self {
        self.num_ctas = num_ctas;
        self
    }
}

impl Default for TritonGemmConfig {
    fn default() -> Self {
        Self::new(64, 64, 32, 1, 4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "vendor", rename_all = "lowercase")]
pub enum GpuComputeCapability {
    Cuda { major: u32, minor: u32 },
    Rocm { gfx: String },
}

impl GpuComputeCapability {
    pub fn cuda(major: u32, minor: u32) -> Self {
        GpuComputeCapability::Cuda { major, minor }
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, GpuComputeCapability::Cuda { .. })
    }

    pub fn is_at_least_ampere(&self) -> bool {
        matches!(self, GpuComputeCapability::Cuda { major, .. } if *major >= 8)
    }

    pub fn is_at_least_hopper(&self) -> bool {
        matches!(self, GpuComputeCapability::Cuda { major, .. } if *major >= 9)
    }

    /// Target name understood by the external Triton compiler driver.
    pub fn arch_name(&self) -> String {
        match self {
            GpuComputeCapability::Cuda { major, minor } => format!("sm_{major}{minor}"),
            GpuComputeCapability::Rocm { gfx } => gfx.clone(),
        }
    }
}

/// Capabilities of the GPU a kernel is generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub name: String,
    pub compute_capability: GpuComputeCapability,
    /// Opt-in shared memory limit per block, in bytes.
    pub shared_memory_per_block_optin: i64,
    pub threads_per_warp: i64,
    /// Location of the device math library linked for extern elementwise calls.
    #[serde(default)]
    pub libdevice_path: String,
}

impl DeviceDescription {
    pub fn a100() -> Self {
        Self {
            name: "NVIDIA A100-SXM4-80GB".to_string(),
            compute_capability: GpuComputeCapability::cuda(8, 0),
            shared_memory_per_block_optin: 166_912,
            threads_per_warp: 32,
            libdevice_path: "/usr/local/cuda/nvvm/libdevice/libdevice.10.bc".to_string(),
        }
    }

    pub fn h100() -> Self {
        Self {
            name: "NVIDIA H100 80GB HBM3".to_string(),
            compute_capability: GpuComputeCapability::cuda(9, 0),
            shared_memory_per_block_optin: 232_448,
            threads_per_warp: 32,
            libdevice_path: "/usr/local/cuda/nvvm/libdevice/libdevice.10.bc".to_string(),
        }
    }

    pub fn rtx3090() -> Self {
        Self {
            name: "NVIDIA GeForce RTX 3090".to_string(),
            compute_capability: GpuComputeCapability::cuda(8, 6),
            shared_memory_per_block_optin: 101_376,
            threads_per_warp: 32,
            libdevice_path: "/usr/local/cuda/nvvm/libdevice/libdevice.10.bc".to_string(),
        }
    }

    pub fn v100() -> Self {
        Self {
            name: "Tesla V100-SXM2-16GB".to_string(),
            compute_capability: GpuComputeCapability::cuda(7, 0),
            shared_memory_per_block_optin: 98_304,
            threads_per_warp: 32,
            libdevice_path: "/usr/local/cuda/nvvm/libdevice/libdevice.10.bc".to_string(),
        }
    }

    pub fn mi200() -> Self {
        Self {
            name: "AMD Instinct MI210".to_string(),
            compute_capability: GpuComputeCapability::Rocm {
                gfx: "gfx90a".to_string(),
            },
            shared_memory_per_block_optin: 65_536,
            threads_per_warp: 64,
            libdevice_path: "/opt/rocm/amdgcn/bitcode".to_string(),
        }
    }

    /// Looks up a preset by short name (`a100`, `h100`, `rtx3090`, `v100`, `mi200`).
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "a100" => Some(Self::a100()),
            "h100" => Some(Self::h100()),
            "rtx3090" => Some(Self::rtx3090()),
            "v100" => Some(Self::v100()),
            "mi200" => Some(Self::mi200()),
            _ => None,
        }
    }
}

/// Debug switches that alter kernel generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugOptions {
    pub enable_bf16_6way_gemm: bool,
    pub enable_bf16_3way_gemm: bool,
    /// Allows TF32 execution of f32 dots with default operand precision.
    pub enable_tf32: bool,
    pub enable_triton_hopper: bool,
    /// Directory receiving generated kernel text and lowering logs.
    pub dump_dir: Option<PathBuf>,
    /// Emits generated kernel text through `tracing` when no dump directory is set.
    pub dump_ir_to_log: bool,
}

impl DebugOptions {
    /// Reads `TILEFUSE_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            enable_bf16_6way_gemm: env_flag("TILEFUSE_ENABLE_BF16_6WAY_GEMM"),
            enable_bf16_3way_gemm: env_flag("TILEFUSE_ENABLE_BF16_3WAY_GEMM"),
            enable_tf32: env_string("TILEFUSE_ENABLE_TF32")
                .map(|value| parse_flag(&value))
                .unwrap_or(true),
            enable_triton_hopper: env_flag("TILEFUSE_ENABLE_TRITON_HOPPER"),
            dump_dir: env_string("TILEFUSE_DUMP_DIR").map(PathBuf::from),
            dump_ir_to_log: env_flag("TILEFUSE_DUMP_IR"),
        }
    }
}

/// Trimmed value of `key`, `None` when unset or blank.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_flag(key: &str) -> bool {
    env_string(key).map(|value| parse_flag(&value)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
    }

    #[test]
    fn presets_resolve_by_name() {
        let a100 = DeviceDescription::preset(" A100 ").unwrap();
        assert!(a100.compute_capability.is_at_least_ampere());
        assert!(!a100.compute_capability.is_at_least_hopper());
        assert_eq!(a100.compute_capability.arch_name(), "sm_80");
        assert!(DeviceDescription::preset("unknown").is_none());
    }

    #[test]
    fn gemm_config_deserializes_with_defaults() {
        let config: TritonGemmConfig = serde_json::from_str(
            r#"{"block_m":64,"block_n":32,"block_k":16,"split_k":1,"num_warps":4}"#,
        )
        .unwrap();
        assert_eq!(config.num_stages, 1);
        assert_eq!(config.num_ctas, 1);
    }
}
