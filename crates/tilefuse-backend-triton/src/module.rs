//! Wraps an emitted kernel body into a verified tile-IR module.

use serde::{Deserialize, Serialize};
use tilefuse::analysis::TritonFusionAnalysis;
use tilefuse::config::{DebugOptions, DeviceDescription, TritonGemmConfig};
use tilefuse::hlo::{ComputationId, HloModule};
use tilefuse::ir::{self, passes, FuncBuilder, Module, Type};
use tracing::debug;

use crate::codegen::types::argument_type;
use crate::codegen::EmitContext;
use crate::dump;
use crate::error::{EmitError, EmitResult};
use crate::launch::LaunchDimensions;
use crate::matmul::emit_matmul;
use crate::softmax::emit_softmax;

/// Alignment hint attached to every kernel argument, in elements.
pub const ARGUMENT_DIVISIBILITY: u32 = 16;

/// Which kernel generator handles a fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitterKind {
    MatMul,
    SoftMax,
}

impl EmitterKind {
    pub fn name(self) -> &'static str {
        match self {
            EmitterKind::MatMul => "matmul",
            EmitterKind::SoftMax => "softmax",
        }
    }
}

impl std::str::FromStr for EmitterKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "matmul" | "gemm" => Ok(EmitterKind::MatMul),
            "softmax" => Ok(EmitterKind::SoftMax),
            other => Err(format!("unknown emitter '{other}'")),
        }
    }
}

/// Everything needed to generate one fusion kernel.
#[derive(Debug, Clone, Copy)]
pub struct EmitRequest<'a> {
    pub fusion_name: &'a str,
    pub module: &'a HloModule,
    pub computation: ComputationId,
    /// Iteration specs. Required for matmuls; optional for row reductions,
    /// which prefer the tiled addressing path.
    pub analysis: Option<&'a TritonFusionAnalysis>,
    pub device: &'a DeviceDescription,
    pub config: &'a TritonGemmConfig,
    pub debug: &'a DebugOptions,
    pub emitter: EmitterKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedModule {
    pub module: Module,
    pub launch_dimensions: LaunchDimensions,
}

/// One pointer per computation parameter followed by one per result leaf.
pub fn kernel_signature(module: &HloModule, computation: ComputationId) -> EmitResult<Vec<Type>> {
    let computation = module.computation(computation);
    let mut signature = Vec::with_capacity(computation.parameters.len() + 1);
    for &parameter in &computation.parameters {
        let element = module.shape(parameter).element_type().ok_or_else(|| {
            EmitError::internal(format!(
                "parameter {} has no array shape",
                module.node(parameter).name
            ))
        })?;
        signature.push(Type::Ptr(argument_type(element)?));
    }
    for leaf in module.shape(computation.root).leaf_shapes() {
        signature.push(Type::Ptr(argument_type(leaf.element_type)?));
    }
    Ok(signature)
}

/// Builds the kernel signature, runs `emit` for the body, then cleans up and
/// verifies the result.
pub fn assemble_module<F>(request: &EmitRequest<'_>, emit: F) -> EmitResult<EmittedModule>
where
    F: FnOnce(&mut FuncBuilder, &EmitContext<'_>) -> EmitResult<LaunchDimensions>,
{
    let signature = kernel_signature(request.module, request.computation)?;
    let mut builder = FuncBuilder::new(request.fusion_name, &signature);
    for index in 0..builder.num_args() {
        builder.set_arg_divisibility(index, ARGUMENT_DIVISIBILITY);
    }

    let cx = EmitContext {
        module: request.module,
        device: request.device,
    };
    let launch_dimensions = emit(&mut builder, &cx)?;
    builder.ret();

    let mut func = builder.finish()?;
    let cleanup = passes::run_cleanup_pipeline(&mut func);
    debug!(
        fusion = request.fusion_name,
        iterations = cleanup.iterations,
        erased = cleanup.erased_ops,
        ops = func.op_count(),
        "kernel cleanup finished"
    );

    let module = Module {
        name: request.fusion_name.to_string(),
        func,
    };
    dump::dump_module(request.debug, request.fusion_name, &module);
    ir::verify_module(&module)?;
    debug!(
        fusion = request.fusion_name,
        launch = %launch_dimensions,
        "kernel module assembled"
    );
    Ok(EmittedModule {
        module,
        launch_dimensions,
    })
}

/// Generates the kernel module for one fusion with the requested emitter.
pub fn create_triton_module(request: &EmitRequest<'_>) -> EmitResult<EmittedModule> {
    match request.emitter {
        EmitterKind::MatMul => {
            let analysis = request.analysis.ok_or_else(|| {
                EmitError::internal("matmul fusions need an iteration-spec analysis")
            })?;
            assemble_module(request, |b, cx| {
                emit_matmul(
                    b,
                    cx,
                    request.computation,
                    analysis,
                    request.config,
                    request.debug,
                )
            })
        }
        EmitterKind::SoftMax => assemble_module(request, |b, cx| {
            emit_softmax(b, cx, request.computation, request.analysis, request.config)
        }),
    }
}
