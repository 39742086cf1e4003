use std::collections::HashSet;

use tilefuse::analysis::{Scope, TritonFusionAnalysis};
use tilefuse::config::{DebugOptions, TritonGemmConfig};
use tilefuse::hlo::{
    ComputationId, DotAlgorithm, DotAttrs, HloModule, Node, NodeId, Opcode, Precision,
    PrimitiveType,
};
use tilefuse::ir::{
    BinaryOp, CmpIPredicate, FuncBuilder, ProgramIdDim, ScalarType, Type, ValueId,
};

use super::addressing::{input_arguments, scope_inputs, Addressing, Side};
use super::dims::{dot_attrs, validate_matmul_config, MatMulDims};
use super::launch::MatMulLaunchConfig;
use super::precision::{emit_3x_dot, emit_6x_dot};
use crate::codegen::types::{cast, node_type, triton_type, zeros_like};
use crate::codegen::{emit_parameter_load, emit_scope, DimProperties, EmitContext, ValueEnv};
use crate::error::{EmitError, EmitResult};
use crate::launch::LaunchDimensions;
use crate::ret_check;

/// Upper bound of [`tiling_complexity`]; larger tilings take too long to compile.
pub const MAX_TILING_COMPLEXITY: i64 = 9000;

/// Programs along M grouped together so neighbouring programs reuse RHS blocks.
const GROUP_M: i64 = 8;

/// Rough per-warp cost of a tiling: tile elements plus operand block elements.
pub fn tiling_complexity(config: &TritonGemmConfig) -> i64 {
    let output = config.block_m * config.block_n;
    let inputs = (config.block_m + config.block_n) * config.block_k;
    (output + inputs) / config.num_warps.max(1)
}

fn is_tf32_allowed(attrs: &DotAttrs, debug: &DebugOptions) -> bool {
    match attrs.precision.algorithm {
        DotAlgorithm::Unset => {
            debug.enable_tf32
                && attrs
                    .precision
                    .operand_precision
                    .iter()
                    .all(|precision| *precision == Precision::Default)
        }
        algorithm => algorithm.has_tf32_input(),
    }
}

/// Whether some dot operand widens 8-bit (or narrower) data to `f32`.
fn has_8bit_input(module: &HloModule, dot: &Node) -> bool {
    dot.operands.iter().any(|&operand| {
        let node = module.node(operand);
        node.opcode == Opcode::Convert
            && node.element_type() == Some(PrimitiveType::F32)
            && module
                .operand(operand, 0)
                .and_then(|input| input.element_type())
                .is_some_and(|ty| ty.bit_width() <= 8)
    })
}

fn needs_64bit_indexing(module: &HloModule, dot: &Node, split_k: i64) -> bool {
    let limit = i64::from(i32::MAX);
    dot.operands
        .iter()
        .take(2)
        .any(|&operand| module.shape(operand).element_count() > limit)
        || dot.shape.element_count() * split_k > limit
}

fn accumulator_type(module: &HloModule, dot: &Node, attrs: &DotAttrs) -> EmitResult<ScalarType> {
    let ty = match attrs.precision.algorithm.accumulator_type() {
        Some(ty) => ty,
        None => {
            let all_f64 = dot.element_type() == Some(PrimitiveType::F64)
                && dot
                    .operands
                    .iter()
                    .take(2)
                    .all(|&operand| module.node(operand).element_type() == Some(PrimitiveType::F64));
            if all_f64 {
                PrimitiveType::F64
            } else {
                PrimitiveType::F32
            }
        }
    };
    triton_type(ty)
}

/// Nodes the root depends on without going through `dot`, in post order.
fn epilogue_nodes(
    module: &HloModule,
    computation: ComputationId,
    root: NodeId,
    dot: NodeId,
) -> Vec<NodeId> {
    let mut reachable = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if id == dot || !reachable.insert(id) {
            continue;
        }
        stack.extend(module.node(id).operands.iter().copied());
    }
    module
        .post_order(computation)
        .into_iter()
        .filter(|id| reachable.contains(id))
        .collect()
}

/// Groups of [`GROUP_M`] rows of programs walk N before moving down M.
fn swizzle_program_ids(
    b: &mut FuncBuilder,
    pid_nc: ValueId,
    grid_m: i64,
    grid_n: i64,
) -> (ValueId, ValueId) {
    let width = b.const_i32(GROUP_M * grid_n);
    let group_id = b.binary(BinaryOp::DivSI, pid_nc, width);
    let group_m = b.const_i32(GROUP_M);
    let first_pid_m = b.binary(BinaryOp::MulI, group_id, group_m);
    let grid_m_value = b.const_i32(grid_m);
    let remaining = b.binary(BinaryOp::SubI, grid_m_value, first_pid_m);
    let is_partial = b.cmpi(CmpIPredicate::Slt, remaining, group_m);
    let group_size = b.select(is_partial, remaining, group_m);

    let in_group = b.binary(BinaryOp::RemSI, pid_nc, group_size);
    let pid_m = b.binary(BinaryOp::AddI, first_pid_m, in_group);
    let in_width = b.binary(BinaryOp::RemSI, pid_nc, width);
    let pid_n = b.binary(BinaryOp::DivSI, in_width, group_size);
    (pid_m, pid_n)
}

struct LoopInput {
    scope: Scope,
    node: NodeId,
    boundary_checks: Vec<usize>,
}

fn scope_slot(scope: Scope) -> usize {
    match scope {
        Scope::Lhs => 0,
        Scope::Rhs => 1,
        Scope::Meta => 2,
        Scope::Output => 3,
    }
}

/// Zeroes the K positions of a block that lie past the end of the
/// contracting dimension.
#[allow(clippy::too_many_arguments)]
fn mask_contracting_tail(
    b: &mut FuncBuilder,
    input: ValueId,
    is_lhs: bool,
    k: i64,
    block_k: i64,
    split_k: i64,
    ki: ValueId,
    pid_k: Option<ValueId>,
) -> ValueId {
    let limit = b.const_i32(k);
    let elements_in_tile = b.binary(BinaryOp::SubI, limit, ki);
    let mut range = b.make_range(0, block_k as i32);
    if let Some(pid_k) = pid_k.filter(|_| split_k > 1) {
        let block = b.const_i32(block_k);
        let start = b.binary(BinaryOp::MulI, pid_k, block);
        let start = b.splat(start, &[block_k]);
        range = b.binary(BinaryOp::AddI, range, start);
    }
    let expanded = b.expand_dims(range, if is_lhs { 0 } else { 1 });
    let expanded_shape = b.ty(expanded).shape().to_vec();
    let bound = b.splat(elements_in_tile, &expanded_shape);
    let mask = b.cmpi(CmpIPredicate::Slt, expanded, bound);
    let input_shape = b.ty(input).shape().to_vec();
    let mask = b.broadcast(mask, &input_shape);
    let zeros = zeros_like(b, input);
    b.select(mask, input, zeros)
}

/// Emits the kernel body of a matmul fusion into `b` and returns its launch grid.
///
/// The kernel arguments are the fusion parameters followed by the outputs.
pub fn emit_matmul(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    computation: ComputationId,
    analysis: &TritonFusionAnalysis,
    config: &TritonGemmConfig,
    debug: &DebugOptions,
) -> EmitResult<LaunchDimensions> {
    let complexity = tiling_complexity(config);
    if complexity > MAX_TILING_COMPLEXITY {
        return Err(EmitError::resource_exhausted(format!(
            "Tiling complexity heuristic exceeded: {complexity} > {MAX_TILING_COMPLEXITY}"
        )));
    }

    let module = cx.module;
    let comp = module.computation(computation);
    let root = comp.root;
    let dot_id = module
        .find_in_post_order(computation, Opcode::Dot)
        .ok_or_else(|| EmitError::internal(format!("no dot in {}", comp.name)))?;
    let dot = module.node(dot_id);
    let attrs = dot_attrs(dot)?;
    let is_sparse = attrs.is_sparse();
    ret_check!(
        !module.shape(root).is_tuple(),
        "matmul fusions with tuple roots are not supported"
    );

    let index_ty = if needs_64bit_indexing(module, dot, config.split_k) {
        ScalarType::I64
    } else {
        ScalarType::I32
    };
    let is_8bit = has_8bit_input(module, dot);

    validate_matmul_config(config, module, dot)?;
    let dims = MatMulDims::create(config, module, analysis, root, dot)?;
    let batch_size = match (dims.lhs_noncontracting_split, dims.out_batch_dim_idx) {
        (Some(split), _) => split,
        (None, Some(index)) => *dot.shape.dims().get(index).ok_or_else(|| {
            EmitError::internal(format!("dot has no batch dimension {index}"))
        })?,
        (None, None) => 1,
    };
    let launch = MatMulLaunchConfig::new(config, &dims, batch_size, cx.device)?;

    let (block_m, block_n, block_k) = (config.block_m, config.block_n, config.block_k);
    let split_k = config.split_k;

    let pid_nc = b.program_id(launch.noncontracting_program_id_dim);
    // The grid only has a z extent when splitting K.
    let pid_k = (split_k > 1).then(|| b.program_id(ProgramIdDim::Z));
    let (pid_m, pid_n) = swizzle_program_ids(b, pid_nc, launch.grid_m, launch.grid_n);

    let acc_elem = accumulator_type(module, dot, attrs)?;
    let acc_init = b.float_const(&Type::tensor(&[block_m, block_n], acc_elem), 0.0);

    let lhs_block_k = block_k / if is_sparse { 2 } else { 1 };
    let lhs_side = Side {
        scope: Scope::Lhs,
        tiled_dims: vec![
            DimProperties::new(dims.lhs_noncontracting_dim_idx, Some(pid_m), block_m, 1),
            DimProperties::new(dims.lhs_contracting_dim_idx, pid_k, lhs_block_k, split_k),
        ],
        batch_dim_idx: dims.lhs_batch_dim_idx,
    };
    let rhs_side = Side {
        scope: Scope::Rhs,
        tiled_dims: vec![
            DimProperties::new(dims.rhs_contracting_dim_idx, pid_k, block_k, split_k),
            DimProperties::new(dims.rhs_noncontracting_dim_idx, Some(pid_n), block_n, 1),
        ],
        batch_dim_idx: dims.rhs_batch_dim_idx,
    };
    let out_side = Side {
        scope: Scope::Output,
        tiled_dims: vec![
            DimProperties::new(dims.out_lhs_noncontracting_dim_idx, Some(pid_m), block_m, 1),
            DimProperties::new(dims.out_rhs_noncontracting_dim_idx, Some(pid_n), block_n, 1),
        ],
        batch_dim_idx: dims.out_batch_dim_idx,
    };
    let meta_side = Side {
        scope: Scope::Meta,
        tiled_dims: vec![
            DimProperties::new(dims.lhs_noncontracting_dim_idx, Some(pid_m), block_m, 1),
            DimProperties::new(dims.lhs_contracting_dim_idx, pid_k, block_k / 16, split_k),
        ],
        batch_dim_idx: dims.lhs_batch_dim_idx,
    };
    let side_of = |scope: Scope| match scope {
        Scope::Lhs => &lhs_side,
        Scope::Rhs => &rhs_side,
        Scope::Meta => &meta_side,
        Scope::Output => &out_side,
    };

    let addressing = Addressing {
        module,
        analysis,
        dims: &dims,
        index_ty,
        batch_program_id_dim: launch.batch_program_id_dim,
    };

    let mut loop_scopes = vec![Scope::Lhs, Scope::Rhs];
    if is_sparse {
        loop_scopes.push(Scope::Meta);
    }
    let mut loop_inputs = Vec::new();
    let mut inits = Vec::new();
    for &scope in &loop_scopes {
        for input in scope_inputs(module, analysis, scope) {
            let bases = input_arguments(module, b, input)?;
            let mut boundary_checks = Vec::new();
            let pointer = addressing.emit_tensor_pointer(
                b,
                input,
                side_of(scope),
                &bases,
                pid_k,
                &mut boundary_checks,
            )?;
            loop_inputs.push(LoopInput {
                scope,
                node: input,
                boundary_checks,
            });
            inits.push(pointer);
        }
    }
    inits.push(acc_init);

    let lower = b.const_i32(0);
    let upper = b.const_i32(dims.k);
    let step = b.const_i32(block_k * split_k);
    let needs_mask = dims.k % (block_k * split_k) > 0;

    let mut block_types = vec![Type::Scalar(ScalarType::I32)];
    block_types.extend(inits.iter().map(|value| b.ty(*value).clone()));
    let args = b.begin_block(&block_types);
    let ki = args[0];
    let acc = args[args.len() - 1];

    let mut scope_values: [ValueEnv; 4] = Default::default();
    let mut yields = Vec::with_capacity(inits.len());
    for (i, input) in loop_inputs.iter().enumerate() {
        let pointer = args[1 + i];
        let node = module.node(input.node);
        let param_elem = if input.scope == Scope::Meta {
            ScalarType::I16
        } else {
            node_type(node.element_type())?
        };
        let loaded = emit_parameter_load(b, pointer, &input.boundary_checks);
        let value = cast(b, loaded, param_elem)?;
        scope_values[scope_slot(input.scope)].insert(input.node, value)?;

        let side = side_of(input.scope);
        let contracting_dim = if input.scope == Scope::Rhs {
            dims.rhs_contracting_dim_idx
        } else {
            dims.lhs_contracting_dim_idx
        };
        let mut increments = Vec::new();
        for dim in &side.tiled_dims {
            let Some(spec) = analysis.iter_spec(input.scope, input.node, dim.index) else {
                continue;
            };
            let step = if dim.index == contracting_dim && spec[0].stride != 0 {
                dim.block_size * dim.split_value
            } else {
                0
            };
            increments.push(b.const_i32(step));
        }
        yields.push(if increments.is_empty() {
            pointer
        } else {
            b.advance(pointer, &increments)
        });
    }

    let mut operand_values = Vec::with_capacity(3);
    for (index, scope) in loop_scopes.iter().copied().enumerate() {
        let operand = dot
            .operand(index)
            .ok_or_else(|| EmitError::internal(format!("dot has no operand {index}")))?;
        let side = side_of(scope);
        let mut value = emit_scope(
            b,
            cx,
            Some(analysis),
            scope,
            &side.tiled_dims,
            &module.post_order_from(operand),
            &mut scope_values[scope_slot(scope)],
        )?;
        if needs_mask && scope != Scope::Meta {
            let is_lhs = scope == Scope::Lhs;
            let denominator = if is_lhs && is_sparse { 2 } else { 1 };
            value = mask_contracting_tail(
                b,
                value,
                is_lhs,
                dims.k / denominator,
                block_k / denominator,
                split_k,
                ki,
                pid_k,
            );
        }
        operand_values.push(value);
    }
    let (lhs, rhs) = (operand_values[0], operand_values[1]);

    let acc_next = if is_sparse {
        b.sparse_dot(lhs, rhs, acc, operand_values[2])
    } else {
        let algorithm = attrs.precision.algorithm;
        if debug.enable_bf16_6way_gemm && debug.enable_bf16_3way_gemm {
            tracing::warn!("both 6-way and 3-way bf16 gemm emulation are enabled, using 6-way");
        }
        let f32_inputs = b.elem(lhs) == ScalarType::F32 && b.elem(rhs) == ScalarType::F32;
        let unset = algorithm == DotAlgorithm::Unset;
        if (unset && debug.enable_bf16_6way_gemm && f32_inputs)
            || algorithm == DotAlgorithm::Bf16Bf16F32X6
        {
            emit_6x_dot(b, lhs, rhs, acc)?
        } else if (unset && debug.enable_bf16_3way_gemm && f32_inputs)
            || algorithm == DotAlgorithm::Bf16Bf16F32X3
        {
            emit_3x_dot(b, lhs, rhs, acc)?
        } else {
            let allow_tf32 = is_tf32_allowed(attrs, debug) && !is_8bit;
            b.dot(lhs, rhs, acc, allow_tf32)
        }
    };
    yields.push(acc_next);
    b.yield_values(&yields);
    let body = b
        .end_block()
        .ok_or_else(|| EmitError::internal("loop body was not open"))?;
    let results = b.for_loop(lower, upper, step, &inits, body);
    let acc_final = *results
        .last()
        .ok_or_else(|| EmitError::internal("loop produced no accumulator"))?;

    let out_values = &mut scope_values[scope_slot(Scope::Output)];
    let dot_value = cast(b, acc_final, node_type(dot.element_type())?)?;
    out_values.insert(dot_id, dot_value)?;

    let to_emit = epilogue_nodes(module, computation, root, dot_id);
    if !to_emit.is_empty() {
        for input in scope_inputs(module, analysis, Scope::Output) {
            let bases = input_arguments(module, b, input)?;
            let mut boundary_checks = Vec::new();
            let pointer = addressing.emit_tensor_pointer(
                b,
                input,
                &out_side,
                &bases,
                pid_k,
                &mut boundary_checks,
            )?;
            let loaded = emit_parameter_load(b, pointer, &boundary_checks);
            let value = cast(b, loaded, node_type(module.node(input).element_type())?)?;
            out_values.insert(input, value)?;
        }
        emit_scope(
            b,
            cx,
            Some(analysis),
            Scope::Output,
            &out_side.tiled_dims,
            &to_emit,
            out_values,
        )?;
    }

    let num_params = comp.parameters.len();
    ret_check!(
        b.num_args() > num_params,
        "kernel has no output arguments"
    );
    let result = out_values.require(root)?;
    for output in num_params..b.num_args() {
        let base = b.arg(output);
        let mut boundary_checks = Vec::new();
        let pointer =
            addressing.emit_tensor_pointer(b, root, &out_side, &[base], pid_k, &mut boundary_checks)?;
        let storage_elem = b.elem(pointer);
        let stored = cast(b, result, storage_elem)?;
        b.store(pointer, stored, &boundary_checks);
    }

    tracing::debug!(
        computation = %comp.name,
        m = dims.m,
        n = dims.n,
        k = dims.k,
        launch = %launch.launch_dims,
        "emitted matmul kernel"
    );
    Ok(launch.launch_dims)
}
