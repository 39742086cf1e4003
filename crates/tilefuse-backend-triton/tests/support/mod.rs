#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilefuse::analysis::{contiguous, row_major_specs, Scope, TritonFusionAnalysis};
use tilefuse::config::{DebugOptions, DeviceDescription, TritonGemmConfig};
use tilefuse::hlo::{
    scalar_reducer, ComputationId, DotAttrs, HloModule, Literal, NodeId, Opcode, PrimitiveType,
    Shape, SparsityDescriptor,
};
use tilefuse::ir::{Constant, Func, OpKind, Operation, ProgramIdDim, ScalarType, ValueId};
use tilefuse_backend_ref_cpu::{HostBuffer, Interpreter};
use tilefuse_backend_triton::{create_triton_module, EmitRequest, EmittedModule, EmitterKind};

/// A fusion computation together with the analysis the emitters read.
pub struct Fusion {
    pub module: HloModule,
    pub computation: ComputationId,
    pub analysis: TritonFusionAnalysis,
}

impl Fusion {
    pub fn emit(
        &self,
        emitter: EmitterKind,
        config: &TritonGemmConfig,
        debug: &DebugOptions,
    ) -> tilefuse_backend_triton::EmitResult<EmittedModule> {
        let device = DeviceDescription::a100();
        create_triton_module(&EmitRequest {
            fusion_name: "triton_fusion",
            module: &self.module,
            computation: self.computation,
            analysis: Some(&self.analysis),
            device: &device,
            config,
            debug,
            emitter,
        })
    }

    pub fn root(&self) -> NodeId {
        self.module.computation(self.computation).root
    }
}

pub fn f32_array(dims: &[i64]) -> Shape {
    Shape::array(PrimitiveType::F32, dims)
}

/// `C[m, n] = op(A[m, k]) . B[k, n]` where `op` is a negation when
/// `negate_lhs` is set.
pub fn matmul(m: i64, k: i64, n: i64, negate_lhs: bool, attrs: DotAttrs) -> Fusion {
    let mut module = HloModule::new("matmul");
    let mut b = module.builder("triton_gemm");
    let p0 = b.parameter(0, f32_array(&[m, k]));
    let p1 = b.parameter(1, f32_array(&[k, n]));
    let lhs = if negate_lhs {
        b.elementwise(Opcode::Negate, &[p0])
    } else {
        p0
    };
    let dot = b.dot(&[lhs, p1], attrs, f32_array(&[m, n]));
    let computation = b.finish(dot);

    let mut analysis = TritonFusionAnalysis::new();
    analysis.set_node_specs(Scope::Lhs, p0, row_major_specs(&[m, k]));
    analysis.set_node_specs(Scope::Lhs, lhs, row_major_specs(&[m, k]));
    analysis.add_scope_parameter(Scope::Lhs, p0);
    analysis.set_node_specs(Scope::Rhs, p1, row_major_specs(&[k, n]));
    analysis.add_scope_parameter(Scope::Rhs, p1);
    analysis.set_node_specs(Scope::Output, dot, row_major_specs(&[m, n]));
    Fusion {
        module,
        computation,
        analysis,
    }
}

/// `C = A . B + broadcast(bias)` with the bias broadcast along rows.
pub fn matmul_with_bias(m: i64, k: i64, n: i64) -> Fusion {
    let mut module = HloModule::new("matmul_bias");
    let mut b = module.builder("triton_gemm");
    let p0 = b.parameter(0, f32_array(&[m, k]));
    let p1 = b.parameter(1, f32_array(&[k, n]));
    let bias = b.parameter(2, f32_array(&[n]));
    let dot = b.dot(&[p0, p1], DotAttrs::new(1, 0), f32_array(&[m, n]));
    let spread = b.broadcast(bias, f32_array(&[m, n]), &[1]);
    let root = b.elementwise(Opcode::Add, &[dot, spread]);
    let computation = b.finish(root);

    let mut analysis = TritonFusionAnalysis::new();
    analysis.set_node_specs(Scope::Lhs, p0, row_major_specs(&[m, k]));
    analysis.add_scope_parameter(Scope::Lhs, p0);
    analysis.set_node_specs(Scope::Rhs, p1, row_major_specs(&[k, n]));
    analysis.add_scope_parameter(Scope::Rhs, p1);
    for node in [dot, spread, root] {
        analysis.set_node_specs(Scope::Output, node, row_major_specs(&[m, n]));
    }
    analysis.set_sparse_node_specs(Scope::Output, bias, [(1, contiguous(1, n))]);
    analysis.add_scope_parameter(Scope::Output, bias);
    Fusion {
        module,
        computation,
        analysis,
    }
}

/// LHS rows come from two `[half_m, k]` parameters concatenated along M.
pub fn concat_matmul(half_m: i64, k: i64, n: i64) -> Fusion {
    let m = 2 * half_m;
    let mut module = HloModule::new("concat_matmul");
    let mut b = module.builder("triton_gemm");
    let top = b.parameter(0, f32_array(&[half_m, k]));
    let bottom = b.parameter(1, f32_array(&[half_m, k]));
    let rhs = b.parameter(2, f32_array(&[k, n]));
    let lhs = b.concatenate(&[top, bottom], 0, f32_array(&[m, k]));
    let dot = b.dot(&[lhs, rhs], DotAttrs::new(1, 0), f32_array(&[m, n]));
    let computation = b.finish(dot);

    let mut analysis = TritonFusionAnalysis::new();
    let mut top_specs = row_major_specs(&[half_m, k]);
    top_specs[0][0] = top_specs[0][0].clone().sliced(0, half_m);
    let mut bottom_specs = row_major_specs(&[half_m, k]);
    bottom_specs[0][0] = bottom_specs[0][0].clone().sliced(-half_m, half_m);
    analysis.set_node_specs(Scope::Lhs, top, top_specs);
    analysis.set_node_specs(Scope::Lhs, bottom, bottom_specs);
    analysis.set_node_specs(Scope::Lhs, lhs, row_major_specs(&[m, k]));
    analysis.add_scope_parameter(Scope::Lhs, top);
    analysis.add_scope_parameter(Scope::Lhs, bottom);
    analysis.set_node_specs(Scope::Rhs, rhs, row_major_specs(&[k, n]));
    analysis.add_scope_parameter(Scope::Rhs, rhs);
    analysis.set_node_specs(Scope::Output, dot, row_major_specs(&[m, n]));
    Fusion {
        module,
        computation,
        analysis,
    }
}

/// `C[m, n] = A . B` stored through a root `bitcast` to `[1, m, n]`.
pub fn matmul_with_unit_batch_root(m: i64, k: i64, n: i64) -> Fusion {
    let mut module = HloModule::new("matmul_bitcast");
    let mut b = module.builder("triton_gemm");
    let p0 = b.parameter(0, f32_array(&[m, k]));
    let p1 = b.parameter(1, f32_array(&[k, n]));
    let dot = b.dot(&[p0, p1], DotAttrs::new(1, 0), f32_array(&[m, n]));
    let root = b.reshape_like(Opcode::Bitcast, dot, f32_array(&[1, m, n]));
    let computation = b.finish(root);

    // Output dimensions keep the numbering of the dot.
    let mut analysis = TritonFusionAnalysis::new();
    analysis.set_node_specs(Scope::Lhs, p0, row_major_specs(&[m, k]));
    analysis.add_scope_parameter(Scope::Lhs, p0);
    analysis.set_node_specs(Scope::Rhs, p1, row_major_specs(&[k, n]));
    analysis.add_scope_parameter(Scope::Rhs, p1);
    for node in [dot, root] {
        analysis.set_node_specs(Scope::Output, node, row_major_specs(&[m, n]));
    }
    Fusion {
        module,
        computation,
        analysis,
    }
}

/// `C[s, m, n] = A[s, m, k] . B[s, k, n]` batched over `s`.
pub fn batched_matmul(batch: i64, m: i64, k: i64, n: i64) -> Fusion {
    let mut module = HloModule::new("batched_matmul");
    let mut b = module.builder("triton_gemm");
    let p0 = b.parameter(0, f32_array(&[batch, m, k]));
    let p1 = b.parameter(1, f32_array(&[batch, k, n]));
    let attrs = DotAttrs::new(2, 1).with_batch(&[0], &[0]);
    let dot = b.dot(&[p0, p1], attrs, f32_array(&[batch, m, n]));
    let computation = b.finish(dot);

    let mut analysis = TritonFusionAnalysis::new();
    analysis.set_node_specs(Scope::Lhs, p0, row_major_specs(&[batch, m, k]));
    analysis.add_scope_parameter(Scope::Lhs, p0);
    analysis.set_node_specs(Scope::Rhs, p1, row_major_specs(&[batch, k, n]));
    analysis.add_scope_parameter(Scope::Rhs, p1);
    analysis.set_node_specs(Scope::Output, dot, row_major_specs(&[batch, m, n]));
    Fusion {
        module,
        computation,
        analysis,
    }
}

/// `C[s, m, n] = A[m, s, k / s] . B[s, k / s, n]`, the split-K form of
/// `A[m, k] . B[k, n]`. Each operand's contracting spec covers all of `k`,
/// so program `z` reads every `split`-th block of K.
pub fn split_k_matmul(m: i64, split: i64, k_per_split: i64, n: i64) -> Fusion {
    let k = split * k_per_split;
    let mut module = HloModule::new("split_k_matmul");
    let mut b = module.builder("triton_gemm");
    let p0 = b.parameter(0, f32_array(&[m, split, k_per_split]));
    let p1 = b.parameter(1, f32_array(&[split, k_per_split, n]));
    let attrs = DotAttrs::new(2, 1).with_batch(&[1], &[0]);
    let dot = b.dot(&[p0, p1], attrs, f32_array(&[split, m, n]));
    let computation = b.finish(dot);

    let mut analysis = TritonFusionAnalysis::new();
    analysis.set_sparse_node_specs(
        Scope::Lhs,
        p0,
        [(0, contiguous(k, m)), (2, contiguous(1, k))],
    );
    analysis.add_scope_parameter(Scope::Lhs, p0);
    analysis.set_sparse_node_specs(
        Scope::Rhs,
        p1,
        [(1, contiguous(n, k)), (2, contiguous(1, n))],
    );
    analysis.add_scope_parameter(Scope::Rhs, p1);
    analysis.set_node_specs(Scope::Output, dot, row_major_specs(&[split, m, n]));
    Fusion {
        module,
        computation,
        analysis,
    }
}

/// 2:4 sparse `C[m, n] = A . B[k, n]` with `A` stored compressed as
/// `[m, k / 2]` and its `[m, k / 16]` u16 metadata as the third operand.
pub fn sparse_matmul(m: i64, k: i64, n: i64) -> Fusion {
    let mut module = HloModule::new("sparse_matmul");
    let mut b = module.builder("triton_gemm");
    let p0 = b.parameter(0, f32_array(&[m, k / 2]));
    let p1 = b.parameter(1, f32_array(&[k, n]));
    let meta = b.parameter(2, Shape::array(PrimitiveType::U16, &[m, k / 16]));
    let attrs = DotAttrs {
        sparsity: Some(SparsityDescriptor {
            dimension: 1,
            n: 2,
            m: 4,
        }),
        ..DotAttrs::new(1, 0)
    };
    let dot = b.dot(&[p0, p1, meta], attrs, f32_array(&[m, n]));
    let computation = b.finish(dot);

    let mut analysis = TritonFusionAnalysis::new();
    analysis.set_node_specs(Scope::Lhs, p0, row_major_specs(&[m, k / 2]));
    analysis.add_scope_parameter(Scope::Lhs, p0);
    analysis.set_node_specs(Scope::Rhs, p1, row_major_specs(&[k, n]));
    analysis.add_scope_parameter(Scope::Rhs, p1);
    analysis.set_node_specs(Scope::Meta, meta, row_major_specs(&[m, k / 16]));
    analysis.add_scope_parameter(Scope::Meta, meta);
    analysis.set_node_specs(Scope::Output, dot, row_major_specs(&[m, n]));
    Fusion {
        module,
        computation,
        analysis,
    }
}

/// `softmax(x)` over the rows of `x[rows, row_len]`.
pub fn softmax(rows: i64, row_len: i64) -> Fusion {
    let mut module = HloModule::new("softmax");
    let max = scalar_reducer(&mut module, "max", Opcode::Maximum);
    let add = scalar_reducer(&mut module, "add", Opcode::Add);
    let mut b = module.builder("triton_softmax");
    let row_shape = f32_array(&[rows, row_len]);
    let x = b.parameter(0, row_shape.clone());
    let neg_inf = b.constant(Literal::Float(f64::NEG_INFINITY), PrimitiveType::F32);
    let row_max = b.reduce(x, neg_inf, &[1], max, f32_array(&[rows]));
    let max_spread = b.broadcast(row_max, row_shape.clone(), &[0]);
    let shifted = b.elementwise(Opcode::Subtract, &[x, max_spread]);
    let exp = b.elementwise(Opcode::Exp, &[shifted]);
    let zero = b.constant(Literal::Float(0.0), PrimitiveType::F32);
    let row_sum = b.reduce(exp, zero, &[1], add, f32_array(&[rows]));
    let sum_spread = b.broadcast(row_sum, row_shape, &[0]);
    let root = b.elementwise(Opcode::Divide, &[exp, sum_spread]);
    let computation = b.finish(root);

    // Dimension 0 walks a row, dimension 1 walks the rows.
    let mut analysis = TritonFusionAnalysis::new();
    let row_specs = vec![contiguous(1, row_len), contiguous(row_len, rows)];
    for node in [x, max_spread, shifted, exp, sum_spread, root] {
        analysis.set_node_specs(Scope::Output, node, row_specs.clone());
    }
    for reduce in [row_max, row_sum] {
        analysis.set_sparse_node_specs(Scope::Output, reduce, [(1, contiguous(1, rows))]);
    }
    analysis.add_scope_parameter(Scope::Output, x);
    Fusion {
        module,
        computation,
        analysis,
    }
}

/// Small integers make every f32 product and partial sum exact.
pub fn small_int_matrix(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-3i32..=3) as f32).collect()
}

pub fn uniform_matrix(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Row-major `a[m, k] . b[k, n]` in f64.
pub fn reference_matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k)
                .map(|l| f64::from(a[i * k + l]) * f64::from(b[l * n + j]))
                .sum();
        }
    }
    out
}

/// Row-major `sum |a[i, l] * b[l, j]|`, the scale of the rounding error of each output.
pub fn reference_magnitude(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f64> {
    let abs_a: Vec<f32> = a.iter().map(|v| v.abs()).collect();
    let abs_b: Vec<f32> = b.iter().map(|v| v.abs()).collect();
    reference_matmul(&abs_a, &abs_b, m, k, n)
}

/// Runs `emitted` over its launch grid and returns the f32 contents of the
/// last buffer.
pub fn run_last_output(emitted: &EmittedModule, inputs: &[&[f32]], output_len: usize) -> Vec<f32> {
    let buffers = inputs.iter().map(|data| HostBuffer::from_f32(data)).collect();
    run_with_buffers(emitted, buffers, output_len)
}

/// Like [`run_last_output`] for inputs of any element type.
pub fn run_with_buffers(
    emitted: &EmittedModule,
    mut buffers: Vec<HostBuffer>,
    output_len: usize,
) -> Vec<f32> {
    buffers.push(HostBuffer::zeros(ScalarType::F32, output_len));
    Interpreter::new(&emitted.module.func)
        .launch(emitted.launch_dimensions.block_counts, &mut buffers)
        .expect("kernel should run on the reference interpreter");
    buffers
        .last()
        .map(HostBuffer::to_f32_vec)
        .unwrap_or_default()
}

/// Whether the kernel reads the program id along `dim`.
pub fn reads_program_id(func: &Func, dim: ProgramIdDim) -> bool {
    func.ops_named("tt.get_program_id")
        .iter()
        .any(|op| matches!(op.kind, OpKind::GetProgramId(d) if d == dim))
}

/// Integer value of a constant op result, if `value` is one.
pub fn constant_int(func: &Func, value: ValueId) -> Option<i64> {
    let mut found = None;
    func.body.walk(&mut |op: &Operation| {
        if op.result() == Some(value) {
            if let OpKind::Constant(Constant::Int(v)) = op.kind {
                found = Some(v);
            }
        }
    });
    found
}

/// `(lower, upper, step)` of the single K loop.
pub fn loop_bounds(func: &Func) -> (i64, i64, i64) {
    let loops = func.ops_named("scf.for");
    assert_eq!(loops.len(), 1, "expected one K loop");
    let operands = &loops[0].operands;
    let bound = |index: usize| {
        constant_int(func, operands[index]).expect("loop bounds should be constants")
    };
    (bound(0), bound(1), bound(2))
}

pub fn store_boundary_checks(func: &Func) -> Vec<Vec<usize>> {
    func.ops_named("tt.store")
        .into_iter()
        .map(|op| match &op.kind {
            OpKind::Store { boundary_check } => boundary_check.clone(),
            _ => unreachable!(),
        })
        .collect()
}

pub fn load_boundary_checks(func: &Func) -> Vec<Vec<usize>> {
    func.ops_named("tt.load")
        .into_iter()
        .map(|op| match &op.kind {
            OpKind::Load { boundary_check, .. } => boundary_check.clone(),
            _ => unreachable!(),
        })
        .collect()
}
