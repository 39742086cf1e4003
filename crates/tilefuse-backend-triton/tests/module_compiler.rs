mod support;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use support::{matmul, softmax, Fusion};
use tilefuse::config::{DebugOptions, DeviceDescription, TritonGemmConfig};
use tilefuse::hlo::DotAttrs;
use tilefuse::ir::{ScalarType, Type};
use tilefuse_backend_triton::module::{kernel_signature, ARGUMENT_DIVISIBILITY};
use tilefuse_backend_triton::{
    create_triton_module, triton_wrapper, AnalyticLowering, EmitRequest, EmitterKind,
    KernelArtifact, LoweringPipeline, TritonccLowering, KERNEL_ARTIFACT_VERSION,
};

static SCRATCH: AtomicUsize = AtomicUsize::new(0);

fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "tilefuse-{label}-{}-{}",
        std::process::id(),
        SCRATCH.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn request<'a>(
    fusion: &'a Fusion,
    fusion_name: &'a str,
    device: &'a DeviceDescription,
    config: &'a TritonGemmConfig,
    debug: &'a DebugOptions,
) -> EmitRequest<'a> {
    EmitRequest {
        fusion_name,
        module: &fusion.module,
        computation: fusion.computation,
        analysis: Some(&fusion.analysis),
        device,
        config,
        debug,
        emitter: EmitterKind::MatMul,
    }
}

#[test]
fn every_argument_is_an_aligned_pointer() {
    let fusion = matmul(64, 64, 64, false, DotAttrs::new(1, 0));
    let signature = kernel_signature(&fusion.module, fusion.computation).unwrap();
    assert_eq!(signature, vec![Type::Ptr(ScalarType::F32); 3]);

    let emitted = fusion
        .emit(
            EmitterKind::MatMul,
            &TritonGemmConfig::new(64, 64, 32, 1, 4),
            &DebugOptions::default(),
        )
        .unwrap();
    let func = &emitted.module.func;
    assert_eq!(func.arg_types(), signature.iter().collect::<Vec<_>>());
    assert!(func
        .arg_attrs
        .iter()
        .all(|attrs| attrs.divisibility == Some(ARGUMENT_DIVISIBILITY)));
    assert_eq!(emitted.module.name, "triton_fusion");
}

#[test]
fn matmul_requests_need_an_analysis() {
    let fusion = matmul(64, 64, 64, false, DotAttrs::new(1, 0));
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::default();
    let debug = DebugOptions::default();
    let mut request = request(&fusion, "gemm", &device, &config, &debug);
    request.analysis = None;
    assert!(create_triton_module(&request).unwrap_err().is_internal());
}

#[test]
fn pre_ampere_devices_are_rejected() {
    let fusion = matmul(64, 64, 64, false, DotAttrs::new(1, 0));
    let device = DeviceDescription::v100();
    let config = TritonGemmConfig::default();
    let debug = DebugOptions::default();
    let err = triton_wrapper(
        &request(&fusion, "gemm", &device, &config, &debug),
        &AnalyticLowering,
    )
    .unwrap_err();
    assert!(err.is_uncompilable());
    assert_eq!(
        err.to_string(),
        "uncompilable: Triton support is only enabled for Ampere GPUs and up."
    );
}

#[test]
fn analytic_lowering_counts_pipelined_tiles() {
    let fusion = matmul(128, 128, 128, false, DotAttrs::new(1, 0));
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::new(64, 64, 32, 1, 4).with_stages(3);
    let debug = DebugOptions::default();
    let result = triton_wrapper(
        &request(&fusion, "gemm", &device, &config, &debug),
        &AnalyticLowering,
    )
    .unwrap();

    // Two 64x32 f32 tiles per stage.
    assert_eq!(result.shared_mem_bytes, 2 * 64 * 32 * 4 * 3);
    assert_eq!(result.cluster_dim, None);
    assert_eq!(result.asm, None);
    assert_eq!(result.launch_dimensions.block_counts, [4, 1, 1]);
}

#[test]
fn kernels_over_the_shared_memory_limit_are_rejected() {
    let fusion = matmul(128, 128, 128, false, DotAttrs::new(1, 0));
    let device = DeviceDescription {
        shared_memory_per_block_optin: 1024,
        ..DeviceDescription::a100()
    };
    let config = TritonGemmConfig::new(64, 64, 32, 1, 4);
    let debug = DebugOptions::default();
    let err = triton_wrapper(
        &request(&fusion, "gemm", &device, &config, &debug),
        &AnalyticLowering,
    )
    .unwrap_err();
    assert!(err.is_resource_exhausted());
    assert_eq!(
        err.to_string(),
        "resource exhausted: Shared memory size limit exceeded: requested 16384, available: 1024"
    );
}

#[test]
fn multi_cta_configurations_report_a_cluster_on_hopper() {
    let fusion = matmul(128, 128, 128, false, DotAttrs::new(1, 0));
    let device = DeviceDescription::h100();
    let mut config = TritonGemmConfig::new(64, 64, 32, 1, 4);
    config.num_ctas = 2;
    let debug = DebugOptions::default();
    let result = triton_wrapper(
        &request(&fusion, "gemm", &device, &config, &debug),
        &AnalyticLowering,
    )
    .unwrap();
    assert_eq!(result.cluster_dim, Some([2, 1, 1]));
}

#[test]
fn artifacts_survive_a_json_round_trip() {
    let fusion = softmax(4, 100);
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::default();
    let debug = DebugOptions::default();
    let mut request = request(&fusion, "softmax_fusion", &device, &config, &debug);
    request.emitter = EmitterKind::SoftMax;
    let result = triton_wrapper(&request, &AnalyticLowering).unwrap();

    let artifact = KernelArtifact::new(&result);
    assert_eq!(artifact.artifact_version, KERNEL_ARTIFACT_VERSION);
    assert_eq!(artifact.name, "softmax_fusion");
    assert!(artifact.ir.contains("tt.func public @softmax_fusion"));

    let json = serde_json::to_string_pretty(&artifact).unwrap();
    assert!(!json.contains("\"asm\""));
    let parsed: KernelArtifact = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, artifact);
}

#[test]
fn dump_directory_receives_module_and_lowering_log() {
    let dir = scratch_dir("dump");
    let fusion = matmul(64, 64, 64, false, DotAttrs::new(1, 0));
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::new(64, 64, 32, 1, 4);
    let debug = DebugOptions {
        dump_dir: Some(dir.clone()),
        ..DebugOptions::default()
    };
    triton_wrapper(
        &request(&fusion, "fusion.7", &device, &config, &debug),
        &AnalyticLowering,
    )
    .unwrap();

    let module_text = std::fs::read_to_string(dir.join("fusion.7.triton_ir.ttir")).unwrap();
    assert!(module_text.contains("tt.func public @fusion.7"));
    let log = std::fs::read_to_string(dir.join("fusion.7.lowering.log")).unwrap();
    assert!(log.starts_with("analytic lowering of fusion.7"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(unix)]
#[test]
fn tritoncc_results_are_cached_by_fingerprint() {
    use std::os::unix::fs::PermissionsExt;

    let dir = scratch_dir("tritoncc");
    let script = dir.join("fake-tritoncc");
    std::fs::write(
        &script,
        r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --out) out="$2"; shift 2 ;;
    --meta) meta="$2"; shift 2 ;;
    *) shift ;;
  esac
done
printf 'fake device code\n' > "$out"
printf '{"shared_mem_bytes": 4096, "log": "lowered"}\n' > "$meta"
"#,
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let cache = dir.join("cache");
    let pipeline = TritonccLowering::new()
        .with_compiler(script.to_string_lossy().into_owned())
        .with_cache_dir(&cache)
        .with_arch("sm_80");
    assert_eq!(pipeline.name(), "tritoncc");

    let fusion = matmul(64, 64, 64, false, DotAttrs::new(1, 0));
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::new(64, 64, 32, 1, 4);
    let debug = DebugOptions::default();
    let request = request(&fusion, "gemm", &device, &config, &debug);

    let first = triton_wrapper(&request, &pipeline).unwrap();
    assert_eq!(first.shared_mem_bytes, 4096);
    assert_eq!(first.asm.as_deref(), Some("fake device code\n"));

    let cached: Vec<PathBuf> = std::fs::read_dir(&cache)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(cached.len(), 3, "{cached:?}");
    assert!(cached
        .iter()
        .any(|path| path.to_string_lossy().ends_with("_sm_80.meta.json")));

    // Later lowerings of the same module come from memory.
    for path in &cached {
        std::fs::remove_file(path).unwrap();
    }
    let second = triton_wrapper(&request, &pipeline).unwrap();
    assert_eq!(second.asm, first.asm);
    let _ = std::fs::remove_dir_all(&dir);
}
