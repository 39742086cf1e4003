//! Lowering of assembled modules and post-lowering resource validation.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tilefuse::config::{env_string, DeviceDescription, TritonGemmConfig};
use tilefuse::ir::{print_module, Func, Module, OpKind, Operation, Type};
use tracing::{debug, trace};

use crate::dump;
use crate::error::{EmitError, EmitResult};
use crate::launch::LaunchDimensions;
use crate::module::{create_triton_module, EmitRequest, EmittedModule};
use crate::ret_check;

/// What the downstream compiler reports about a lowered kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoweredKernel {
    pub shared_mem_bytes: i64,
    pub cluster_dims: [i64; 3],
    /// Device assembly, when the pipeline produces one.
    #[serde(default)]
    pub asm: Option<String>,
    #[serde(default)]
    pub log: String,
}

/// Lowers a verified tile-IR module to device code.
pub trait LoweringPipeline: Send + Sync {
    fn name(&self) -> &'static str;

    fn lower(
        &self,
        module: &Module,
        device: &DeviceDescription,
        config: &TritonGemmConfig,
    ) -> EmitResult<LoweredKernel>;
}

/// Estimates kernel resources from the module structure without producing
/// device code.
///
/// Shared memory covers every tile loaded inside a pipelined loop, buffered
/// once per stage, plus scratch for each reduction input.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyticLowering;

impl AnalyticLowering {
    pub fn shared_memory_bytes(func: &Func, config: &TritonGemmConfig) -> i64 {
        let stages = config.num_stages.max(1);
        let mut loop_tiles = 0i64;
        let mut reduce_scratch = 0i64;
        func.body.walk(&mut |op: &Operation| match op.kind {
            OpKind::For => {
                for region in &op.regions {
                    region.walk(&mut |inner: &Operation| {
                        if matches!(inner.kind, OpKind::Load { .. }) {
                            loop_tiles += result_bytes(func, inner);
                        }
                    });
                }
            }
            OpKind::Reduce { .. } => {
                reduce_scratch += op
                    .operands
                    .first()
                    .and_then(|value| func.value_type(*value))
                    .map(tensor_bytes)
                    .unwrap_or(0);
            }
            _ => {}
        });
        loop_tiles * stages + reduce_scratch
    }

    pub fn cluster_dims(device: &DeviceDescription, config: &TritonGemmConfig) -> [i64; 3] {
        if config.num_ctas > 1 && device.compute_capability.is_at_least_hopper() {
            [config.num_ctas, 1, 1]
        } else {
            [1, 1, 1]
        }
    }
}

fn tensor_bytes(ty: &Type) -> i64 {
    let elements: i64 = ty.shape().iter().product();
    elements * ty.element_type().size_in_bytes() as i64
}

fn result_bytes(func: &Func, op: &Operation) -> i64 {
    op.result()
        .and_then(|value| func.value_type(value))
        .map(tensor_bytes)
        .unwrap_or(0)
}

impl LoweringPipeline for AnalyticLowering {
    fn name(&self) -> &'static str {
        "analytic"
    }

    fn lower(
        &self,
        module: &Module,
        device: &DeviceDescription,
        config: &TritonGemmConfig,
    ) -> EmitResult<LoweredKernel> {
        let shared_mem_bytes = Self::shared_memory_bytes(&module.func, config);
        let cluster_dims = Self::cluster_dims(device, config);
        Ok(LoweredKernel {
            shared_mem_bytes,
            cluster_dims,
            asm: None,
            log: format!(
                "analytic lowering of {}: {} ops, shared memory {} bytes",
                module.name,
                module.func.op_count(),
                shared_mem_bytes
            ),
        })
    }
}

/// Lowers through an external `tritoncc` driver, caching results in memory
/// and on disk by module fingerprint.
#[derive(Default)]
pub struct TritonccLowering {
    compiler: Option<String>,
    cache_dir: Option<PathBuf>,
    arch: Option<String>,
    compiled: Mutex<HashMap<u64, Arc<LoweredKernel>>>,
    compile_gates: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl TritonccLowering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = Some(compiler.into());
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    fn compiler(&self) -> String {
        self.compiler.clone().unwrap_or_else(tritoncc_binary)
    }

    fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(triton_cache_dir)
    }

    fn arch(&self, device: &DeviceDescription) -> String {
        self.arch
            .clone()
            .or_else(|| env_string("TILEFUSE_TRITON_ARCH"))
            .unwrap_or_else(|| device.compute_capability.arch_name())
    }

    fn cached(&self, fingerprint: u64) -> Option<Arc<LoweredKernel>> {
        self.compiled
            .lock()
            .expect("triton kernel cache poisoned")
            .get(&fingerprint)
            .cloned()
    }
}

impl LoweringPipeline for TritonccLowering {
    fn name(&self) -> &'static str {
        "tritoncc"
    }

    fn lower(
        &self,
        module: &Module,
        device: &DeviceDescription,
        config: &TritonGemmConfig,
    ) -> EmitResult<LoweredKernel> {
        let compiler = self.compiler();
        let arch = self.arch(device);
        let source = print_module(module);
        let fingerprint = kernel_fingerprint(&source, config, &arch, &compiler);

        if let Some(found) = self.cached(fingerprint) {
            trace!(fingerprint = %format!("{fingerprint:016x}"), "tritoncc memory cache hit");
            return Ok(found.as_ref().clone());
        }

        let gate = {
            let mut guard = self
                .compile_gates
                .lock()
                .expect("triton compile gate cache poisoned");
            guard
                .entry(fingerprint)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _gate_lock = gate.lock().expect("triton compile gate poisoned");

        if let Some(found) = self.cached(fingerprint) {
            return Ok(found.as_ref().clone());
        }

        let cache_dir = self.cache_dir();
        std::fs::create_dir_all(&cache_dir).map_err(io_error)?;

        let source_path = cache_dir.join(format!("kernel_{fingerprint:016x}.ttir"));
        let asm_path = cache_dir.join(format!("kernel_{fingerprint:016x}_{arch}.asm"));
        let meta_path = cache_dir.join(format!("kernel_{fingerprint:016x}_{arch}.meta.json"));

        if !asm_path.exists() || !meta_path.exists() {
            debug!(compiler = %compiler, arch = %arch, path = %source_path.display(), "running tritoncc");
            std::fs::write(&source_path, &source).map_err(io_error)?;
            run_tritoncc_compile(
                &compiler,
                &arch,
                config,
                &source_path,
                &asm_path,
                &meta_path,
            )?;
        } else {
            trace!(path = %meta_path.display(), "tritoncc disk cache hit");
        }

        let asm = std::fs::read_to_string(&asm_path).map_err(io_error)?;
        let meta = std::fs::read_to_string(&meta_path).map_err(io_error)?;
        let parsed: TritonccMeta = serde_json::from_str(&meta)
            .map_err(|err| EmitError::internal(format!("invalid tritoncc metadata: {err}")))?;

        let lowered = Arc::new(LoweredKernel {
            shared_mem_bytes: parsed.shared_mem_bytes,
            cluster_dims: parsed.cluster_dims.unwrap_or([1, 1, 1]),
            asm: Some(asm),
            log: parsed.log,
        });
        self.compiled
            .lock()
            .expect("triton kernel cache poisoned")
            .insert(fingerprint, Arc::clone(&lowered));
        Ok(lowered.as_ref().clone())
    }
}

#[derive(Debug, Deserialize)]
struct TritonccMeta {
    shared_mem_bytes: i64,
    #[serde(default)]
    cluster_dims: Option<[i64; 3]>,
    #[serde(default)]
    log: String,
}

fn io_error(err: std::io::Error) -> EmitError {
    EmitError::internal(err.to_string())
}

fn run_tritoncc_compile(
    compiler: &str,
    arch: &str,
    config: &TritonGemmConfig,
    source: &Path,
    asm: &Path,
    meta: &Path,
) -> EmitResult<()> {
    let output = Command::new(compiler)
        .arg("compile")
        .arg("--arch")
        .arg(arch)
        .arg("--num-warps")
        .arg(config.num_warps.to_string())
        .arg("--num-stages")
        .arg(config.num_stages.to_string())
        .arg("--num-ctas")
        .arg(config.num_ctas.to_string())
        .arg("--in")
        .arg(source)
        .arg("--out")
        .arg(asm)
        .arg("--meta")
        .arg(meta)
        .output()
        .map_err(|err| EmitError::internal(format!("failed to run {compiler}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(EmitError::internal(format!(
            "tritoncc compile failed (status={}): stdout='{}' stderr='{}'",
            output.status,
            stdout.trim(),
            stderr.trim()
        )));
    }

    Ok(())
}

fn triton_cache_dir() -> PathBuf {
    env_string("TILEFUSE_TRITON_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".cache/tilefuse-triton"))
}

fn tritoncc_binary() -> String {
    ["TILEFUSE_TRITONCC", "TRITONCC"]
        .into_iter()
        .find_map(env_string)
        .unwrap_or_else(|| "tritoncc".to_string())
}

fn kernel_fingerprint(source: &str, config: &TritonGemmConfig, arch: &str, compiler: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);
    config.num_warps.hash(&mut hasher);
    config.num_stages.hash(&mut hasher);
    config.num_ctas.hash(&mut hasher);
    arch.hash(&mut hasher);
    compiler.hash(&mut hasher);
    hasher.finish()
}

/// Resources a lowered kernel needs at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelResources {
    pub shared_mem_bytes: i64,
    /// Set only when the configuration asked for multi-CTA clusters.
    pub cluster_dim: Option<[i64; 3]>,
}

/// Checks what the lowering reported against the device limits and extracts
/// the cluster shape.
pub fn compile_triton_module(
    lowered: &LoweredKernel,
    device: &DeviceDescription,
    config: &TritonGemmConfig,
) -> EmitResult<KernelResources> {
    if lowered.shared_mem_bytes > device.shared_memory_per_block_optin {
        return Err(EmitError::resource_exhausted(format!(
            "Shared memory size limit exceeded: requested {}, available: {}",
            lowered.shared_mem_bytes, device.shared_memory_per_block_optin
        )));
    }

    let cluster_dim = if config.num_ctas > 1 {
        Some(lowered.cluster_dims)
    } else {
        ret_check!(
            lowered.cluster_dims == [1, 1, 1],
            "cluster {:?} without multi-CTA configuration",
            lowered.cluster_dims
        );
        None
    };
    Ok(KernelResources {
        shared_mem_bytes: lowered.shared_mem_bytes,
        cluster_dim,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct TritonWrapperResult {
    pub module: Module,
    pub launch_dimensions: LaunchDimensions,
    pub shared_mem_bytes: i64,
    pub cluster_dim: Option<[i64; 3]>,
    pub asm: Option<String>,
}

/// Generates, lowers and validates the kernel for one fusion.
pub fn triton_wrapper(
    request: &EmitRequest<'_>,
    pipeline: &dyn LoweringPipeline,
) -> EmitResult<TritonWrapperResult> {
    let capability = &request.device.compute_capability;
    if capability.is_cuda() && !capability.is_at_least_ampere() {
        return Err(EmitError::uncompilable(
            "Triton support is only enabled for Ampere GPUs and up.",
        ));
    }

    let EmittedModule {
        module,
        launch_dimensions,
    } = create_triton_module(request)?;

    let lowered = pipeline.lower(&module, request.device, request.config)?;
    dump::dump_lowering_log(request.debug, request.fusion_name, &lowered.log);
    let resources = compile_triton_module(&lowered, request.device, request.config)?;
    debug!(
        fusion = request.fusion_name,
        pipeline = pipeline.name(),
        shared_mem_bytes = resources.shared_mem_bytes,
        cluster = ?resources.cluster_dim,
        "kernel lowered"
    );

    Ok(TritonWrapperResult {
        module,
        launch_dimensions,
        shared_mem_bytes: resources.shared_mem_bytes,
        cluster_dim: resources.cluster_dim,
        asm: lowered.asm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lowered(shared_mem_bytes: i64, cluster_dims: [i64; 3]) -> LoweredKernel {
        LoweredKernel {
            shared_mem_bytes,
            cluster_dims,
            asm: None,
            log: String::new(),
        }
    }

    #[test]
    fn shared_memory_over_budget_is_exhausted() {
        let device = DeviceDescription::a100();
        let config = TritonGemmConfig::default();
        let limit = device.shared_memory_per_block_optin;
        assert!(compile_triton_module(&lowered(limit, [1, 1, 1]), &device, &config).is_ok());
        let err = compile_triton_module(&lowered(limit + 1, [1, 1, 1]), &device, &config)
            .unwrap_err();
        assert!(err.is_resource_exhausted());
        assert!(err.to_string().contains("Shared memory size limit exceeded"));
    }

    #[test]
    fn cluster_is_reported_only_for_multi_cta_configs() {
        let device = DeviceDescription::h100();
        let single = TritonGemmConfig::default();
        let resources = compile_triton_module(&lowered(0, [1, 1, 1]), &device, &single).unwrap();
        assert_eq!(resources.cluster_dim, None);
        assert!(compile_triton_module(&lowered(0, [2, 1, 1]), &device, &single)
            .unwrap_err()
            .is_internal());

        let multi = TritonGemmConfig::default().with_ctas(2);
        let resources = compile_triton_module(&lowered(0, [2, 1, 1]), &device, &multi).unwrap();
        assert_eq!(resources.cluster_dim, Some([2, 1, 1]));
    }

    #[test]
    fn analytic_cluster_needs_hopper() {
        let config = TritonGemmConfig::default().with_ctas(2);
        assert_eq!(
            AnalyticLowering::cluster_dims(&DeviceDescription::h100(), &config),
            [2, 1, 1]
        );
        assert_eq!(
            AnalyticLowering::cluster_dims(&DeviceDescription::a100(), &config),
            [1, 1, 1]
        );
    }
}
