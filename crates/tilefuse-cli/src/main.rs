mod request;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tilefuse::config::DebugOptions;
use tilefuse_backend_triton::{
    triton_wrapper, AnalyticLowering, EmitterKind, KernelArtifact, LaunchDimensions,
    LoweringPipeline, TritonccLowering,
};
use tracing_subscriber::EnvFilter;

use crate::request::{resolve_device, FusionRequest};

#[derive(Parser)]
#[command(name = "tilefuse")]
#[command(about = "Generates tiled Triton kernels for fusion computations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate, lower and validate the kernel for one fusion request
    Emit(EmitArgs),
    /// List the built-in device presets
    Devices,
}

#[derive(clap::Args)]
struct EmitArgs {
    /// JSON fusion request
    #[arg(long, value_name = "JSON")]
    request: PathBuf,

    /// Device preset; overrides the request's device
    #[arg(long)]
    device: Option<String>,

    /// Kernel emitter (matmul or softmax); overrides the request's emitter
    #[arg(long)]
    emitter: Option<EmitterKind>,

    /// Print the generated module text before the summary
    #[arg(long)]
    print_ir: bool,

    #[arg(long, value_enum, default_value_t = Lowering::Analytic)]
    lowering: Lowering,

    /// Write the full kernel artifact JSON to this file
    #[arg(long, value_name = "PATH")]
    artifact: Option<PathBuf>,

    /// Directory receiving module and lowering-log dumps
    #[arg(long, value_name = "DIR")]
    dump_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Lowering {
    /// Estimate resources without producing device code
    Analytic,
    /// Compile through the external tritoncc driver
    Tritoncc,
}

#[derive(Serialize)]
struct Summary<'a> {
    name: &'a str,
    emitter: EmitterKind,
    device: &'a str,
    lowering: &'static str,
    launch_dimensions: LaunchDimensions,
    shared_mem_bytes: i64,
    cluster_dim: Option<[i64; 3]>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Emit(args) => emit(args),
        Command::Devices => {
            for name in ["a100", "h100", "rtx3090", "v100", "mi200"] {
                let device = resolve_device(name)?;
                println!("{name:<8} {}", device.name);
            }
            Ok(())
        }
    }
}

fn emit(args: EmitArgs) -> Result<()> {
    let request = FusionRequest::load(&args.request)?;
    let device = match (&args.device, &request.device) {
        (Some(name), _) => resolve_device(name)?,
        (None, Some(spec)) => spec.resolve()?,
        (None, None) => resolve_device("a100")?,
    };
    let emitter = args.emitter.unwrap_or_else(|| request.default_emitter());
    let mut debug = DebugOptions::from_env();
    if args.dump_dir.is_some() {
        debug.dump_dir = args.dump_dir.clone();
    }

    let pipeline: Box<dyn LoweringPipeline> = match args.lowering {
        Lowering::Analytic => Box::new(AnalyticLowering),
        Lowering::Tritoncc => Box::new(TritonccLowering::new()),
    };
    tracing::info!(
        fusion = %request.name,
        emitter = emitter.name(),
        device = %device.name,
        pipeline = pipeline.name(),
        "generating kernel"
    );

    let result = triton_wrapper(
        &request.emit_request(&device, &debug, emitter),
        pipeline.as_ref(),
    )
    .with_context(|| format!("kernel generation failed for {}", request.name))?;
    let artifact = KernelArtifact::new(&result);

    if args.print_ir {
        print!("{}", artifact.ir);
    }
    if let Some(path) = &args.artifact {
        let json = serde_json::to_string_pretty(&artifact)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write artifact {}", path.display()))?;
    }

    let summary = Summary {
        name: &request.name,
        emitter,
        device: &device.name,
        lowering: pipeline.name(),
        launch_dimensions: result.launch_dimensions,
        shared_mem_bytes: result.shared_mem_bytes,
        cluster_dim: result.cluster_dim,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
