mod support;

use support::f32_array;
use tilefuse::analysis::{row_major_specs, Scope, TritonFusionAnalysis};
use tilefuse::config::{DeviceDescription, TritonGemmConfig};
use tilefuse::hlo::{DotAttrs, HloModule, NodeId, Opcode};
use tilefuse::ir::ProgramIdDim;
use tilefuse_backend_triton::matmul::{validate_matmul_config, MatMulDims, MatMulLaunchConfig};

struct SplitDot {
    module: HloModule,
    analysis: TritonFusionAnalysis,
    root: NodeId,
}

impl SplitDot {
    fn dims(&self, config: &TritonGemmConfig) -> tilefuse_backend_triton::EmitResult<MatMulDims> {
        let dot = self.module.node(self.root);
        validate_matmul_config(config, &self.module, dot)?;
        MatMulDims::create(config, &self.module, &self.analysis, self.root, dot)
    }
}

/// `out[s, m, n] = lhs[m, s, k] . rhs[s, k, n]` with `s` the split-K batch
/// dimension. With `padded_k` the RHS is `bitcast(pad(rhs[padded_k, n]))`.
fn split_dot(m: i64, split: i64, k_per_split: i64, n: i64, padded_k: Option<i64>) -> SplitDot {
    let mut module = HloModule::new("split_k");
    let mut b = module.builder("triton_gemm");
    let lhs = b.parameter(0, f32_array(&[m, split, k_per_split]));
    let rhs_shape = f32_array(&[split, k_per_split, n]);
    let rhs = match padded_k {
        Some(unpadded) => {
            let p1 = b.parameter(1, f32_array(&[unpadded, n]));
            let pad = b.reshape_like(Opcode::Pad, p1, f32_array(&[split * k_per_split, n]));
            b.reshape_like(Opcode::Bitcast, pad, rhs_shape)
        }
        None => b.parameter(1, rhs_shape),
    };
    let attrs = DotAttrs::new(2, 1).with_batch(&[1], &[0]);
    let dot = b.dot(&[lhs, rhs], attrs, f32_array(&[split, m, n]));
    b.finish(dot);

    let mut analysis = TritonFusionAnalysis::new();
    analysis.set_node_specs(Scope::Lhs, lhs, row_major_specs(&[m, split, k_per_split]));
    analysis.add_scope_parameter(Scope::Lhs, lhs);
    analysis.set_node_specs(Scope::Output, dot, row_major_specs(&[split, m, n]));
    SplitDot {
        module,
        analysis,
        root: dot,
    }
}

#[test]
fn split_k_puts_the_split_dimension_first_in_the_output() {
    let fusion = split_dot(64, 2, 64, 32, None);
    let config = TritonGemmConfig::new(32, 32, 32, 2, 4);
    let dims = fusion.dims(&config).unwrap();

    assert_eq!((dims.m, dims.n, dims.k), (64, 32, 128));
    assert_eq!(dims.out_split_k_dim_idx, Some(0));
    assert_eq!(dims.out_batch_dim_idx, None);
    assert_eq!(dims.out_lhs_noncontracting_dim_idx, 1);
    assert_eq!(dims.out_rhs_noncontracting_dim_idx, 2);
    assert_eq!(dims.lhs_noncontracting_dim_idx, 0);
    assert_eq!(dims.rhs_noncontracting_dim_idx, 2);
}

#[test]
fn padded_split_k_uses_the_unpadded_contracting_size() {
    let fusion = split_dot(64, 2, 32, 32, Some(60));
    let config = TritonGemmConfig::new(32, 32, 32, 2, 4);
    let dims = fusion.dims(&config).unwrap();
    assert_eq!(dims.k, 60);
}

#[test]
fn split_k_requires_a_split_batch_dimension() {
    let mut module = HloModule::new("m");
    let mut b = module.builder("triton_gemm");
    let lhs = b.parameter(0, f32_array(&[64, 64]));
    let rhs = b.parameter(1, f32_array(&[64, 64]));
    let dot = b.dot(&[lhs, rhs], DotAttrs::new(1, 0), f32_array(&[64, 64]));
    b.finish(dot);

    let config = TritonGemmConfig::new(32, 32, 32, 2, 4);
    let err = validate_matmul_config(&config, &module, module.node(dot)).unwrap_err();
    assert!(err.is_uncompilable());
    assert_eq!(
        err.to_string(),
        "uncompilable: Split-K requires a split batch dimension."
    );
}

#[test]
fn mismatched_split_sizes_are_uncompilable() {
    let fusion = split_dot(64, 2, 64, 32, None);
    let config = TritonGemmConfig::new(32, 32, 32, 4, 4);
    assert!(fusion.dims(&config).unwrap_err().is_uncompilable());
}

fn plain_dims(m: i64, n: i64) -> MatMulDims {
    MatMulDims {
        out_lhs_noncontracting_dim_idx: 0,
        out_rhs_noncontracting_dim_idx: 1,
        out_batch_dim_idx: None,
        out_split_k_dim_idx: None,
        lhs_contracting_dim_idx: 1,
        lhs_noncontracting_dim_idx: 0,
        lhs_batch_dim_idx: None,
        lhs_noncontracting_split: None,
        rhs_contracting_dim_idx: 0,
        rhs_noncontracting_dim_idx: 1,
        rhs_batch_dim_idx: None,
        m,
        n,
        k: 64,
    }
}

#[test]
fn grid_covers_every_output_tile() {
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::new(64, 32, 32, 1, 8);
    for (m, n) in [(64, 32), (100, 33), (1, 1), (1000, 7)] {
        let launch = MatMulLaunchConfig::new(&config, &plain_dims(m, n), 1, &device).unwrap();
        assert!(launch.grid_m * config.block_m >= m);
        assert!((launch.grid_m - 1) * config.block_m < m);
        assert!(launch.grid_n * config.block_n >= n);
        assert!((launch.grid_n - 1) * config.block_n < n);
        assert_eq!(
            launch.launch_dims.block_counts,
            [launch.grid_m * launch.grid_n, 1, 1]
        );
        assert_eq!(launch.launch_dims.thread_counts_per_block, 256);
        assert_eq!(launch.noncontracting_program_id_dim, ProgramIdDim::X);
        assert_eq!(launch.batch_program_id_dim, ProgramIdDim::Y);
    }
}

#[test]
fn large_batches_move_to_the_x_axis() {
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::new(64, 64, 32, 1, 4);
    let dims = plain_dims(128, 64);

    let small = MatMulLaunchConfig::new(&config, &dims, 100, &device).unwrap();
    assert_eq!(small.launch_dims.block_counts, [2, 100, 1]);

    let large = MatMulLaunchConfig::new(&config, &dims, 70_000, &device).unwrap();
    assert_eq!(large.launch_dims.block_counts, [70_000, 2, 1]);
    assert_eq!(large.batch_program_id_dim, ProgramIdDim::X);
    assert_eq!(large.noncontracting_program_id_dim, ProgramIdDim::Y);
}

#[test]
fn split_k_is_the_z_extent() {
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::new(64, 64, 32, 4, 4);
    let launch = MatMulLaunchConfig::new(&config, &plain_dims(64, 64), 1, &device).unwrap();
    assert_eq!(launch.launch_dims.block_counts, [1, 1, 4]);
}

#[test]
fn oversized_grids_are_rejected() {
    let device = DeviceDescription::a100();
    let config = TritonGemmConfig::new(16, 16, 16, 1, 4);
    let err = MatMulLaunchConfig::new(&config, &plain_dims(1 << 24, 1 << 24), 1, &device)
        .unwrap_err();
    assert!(err.is_internal(), "{err}");
}
