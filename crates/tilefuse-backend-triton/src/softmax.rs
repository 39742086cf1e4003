//! Row-reduction kernels: one program per output row.
//!
//! Addresses come from a symbolic row tiling when the computation can be tiled
//! that way, and from the fusion analysis iteration specs otherwise.

use tilefuse::analysis::{
    AffineExpr, RowTileAnalysis, Scope, SymbolicTiling, TiledComputation, TiledInstruction,
    TritonFusionAnalysis,
};
use tilefuse::config::TritonGemmConfig;
use tilefuse::hlo::{ArrayShape, ComputationId, HloModule, NodeId, Opcode};
use tilefuse::ir::{BinaryOp, CastOp, FuncBuilder, ProgramIdDim, ScalarType, ValueId};

use crate::codegen::types::{cast, node_type};
use crate::codegen::{
    emit_parameter_load, emit_scope, emit_tiled_scope, DimProperties, EmitContext, ValueEnv,
};
use crate::error::{EmitError, EmitResult};
use crate::launch::LaunchDimensions;
use crate::ret_check;

/// Row geometry shared by both addressing schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowShape {
    pub row_len: i64,
    /// `row_len` rounded up to a power of two.
    pub block_size: i64,
    pub rows: i64,
}

impl RowShape {
    pub fn is_padded(&self) -> bool {
        self.block_size != self.row_len
    }

    fn boundary_checks(&self) -> Vec<usize> {
        if self.is_padded() {
            vec![0]
        } else {
            Vec::new()
        }
    }
}

/// Checks that `computation` is a single-output row reduction and returns
/// its row geometry.
pub fn row_shape(module: &HloModule, computation: ComputationId) -> EmitResult<RowShape> {
    let reduce = module
        .find_in_post_order(computation, Opcode::Reduce)
        .ok_or_else(|| EmitError::unsupported("No reduce instruction found."))?;
    let reduce = module.node(reduce);
    let input = reduce
        .operand(0)
        .ok_or_else(|| EmitError::internal(format!("reduce {} has no input", reduce.name)))?;
    let input_rank = module.shape(input).rank();
    if input_rank == 0 || reduce.reduce_dimensions() != Some(&[input_rank as i64 - 1][..]) {
        return Err(EmitError::unsupported(
            "Only a single innermost reduction dimension is supported.",
        ));
    }

    let root = module.computation(computation).root;
    let root_shape = module
        .shape(root)
        .as_array()
        .filter(|array| array.has_canonical_layout())
        .ok_or_else(|| EmitError::unsupported("Root shape is not supported."))?;

    let row_len = module.shape(input).dims()[input_rank - 1];
    ret_check!(row_len > 0, "empty rows");
    let rows = root_shape.element_count() / row_len;
    Ok(RowShape {
        row_len,
        block_size: (row_len as u64).next_power_of_two() as i64,
        rows,
    })
}

fn launch_dimensions(
    shape: &RowShape,
    config: &TritonGemmConfig,
    cx: &EmitContext<'_>,
) -> LaunchDimensions {
    LaunchDimensions::new(
        [shape.rows, 1, 1],
        config.num_warps * cx.device.threads_per_warp,
    )
}

/// Emits a row-reduction kernel, preferring tiled addressing.
pub fn emit_softmax(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    computation: ComputationId,
    analysis: Option<&TritonFusionAnalysis>,
    config: &TritonGemmConfig,
) -> EmitResult<LaunchDimensions> {
    let shape = row_shape(cx.module, computation)?;
    match tile_rows(cx.module, computation, &shape) {
        Ok(tiled) => emit_tiled_rows(b, cx, computation, &shape, &tiled, config),
        Err(reason) => {
            tracing::debug!(%reason, "row tiling failed, using iteration specs");
            let analysis = analysis.ok_or_else(|| {
                EmitError::internal(format!(
                    "no fusion analysis to fall back to after row tiling failed: {reason}"
                ))
            })?;
            emit_legacy_rows(b, cx, computation, &shape, analysis, config)
        }
    }
}

/// Row-reduction kernel addressed through the symbolic row tiling only.
pub fn emit_softmax_tiled(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    computation: ComputationId,
    config: &TritonGemmConfig,
) -> EmitResult<LaunchDimensions> {
    let shape = row_shape(cx.module, computation)?;
    let tiled = tile_rows(cx.module, computation, &shape).map_err(EmitError::unsupported)?;
    emit_tiled_rows(b, cx, computation, &shape, &tiled, config)
}

/// Row-reduction kernel addressed through the fusion analysis iteration specs.
pub fn emit_softmax_legacy(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    computation: ComputationId,
    analysis: &TritonFusionAnalysis,
    config: &TritonGemmConfig,
) -> EmitResult<LaunchDimensions> {
    let shape = row_shape(cx.module, computation)?;
    emit_legacy_rows(b, cx, computation, &shape, analysis, config)
}

fn tile_rows(
    module: &HloModule,
    computation: ComputationId,
    shape: &RowShape,
) -> Result<TiledComputation, String> {
    let root = module.computation(computation).root;
    let rank = module.shape(root).rank();
    let mut tile_sizes = vec![1; rank];
    if let Some(last) = tile_sizes.last_mut() {
        *last = shape.row_len;
    }
    RowTileAnalysis::new(module, computation).compute_tiled_computation(&tile_sizes)
}

fn program_id_i64(b: &mut FuncBuilder) -> ValueId {
    let pid = b.program_id(ProgramIdDim::X);
    b.cast(CastOp::ExtSI, pid, ScalarType::I64)
}

fn materialize(b: &mut FuncBuilder, expr: &AffineExpr, pid: ValueId) -> ValueId {
    match expr {
        AffineExpr::Pid => pid,
        AffineExpr::Const(value) => b.const_i64(*value),
        AffineExpr::Add(lhs, rhs) => {
            let lhs = materialize(b, lhs, pid);
            let rhs = materialize(b, rhs, pid);
            b.binary(BinaryOp::AddI, lhs, rhs)
        }
        AffineExpr::Mul(inner, factor) => {
            let inner = materialize(b, inner, pid);
            let factor = b.const_i64(*factor);
            b.binary(BinaryOp::MulI, inner, factor)
        }
        // Program ids are non-negative, so truncating division and remainder
        // agree with the floor forms.
        AffineExpr::FloorDiv(inner, divisor) => {
            let inner = materialize(b, inner, pid);
            let divisor = b.const_i64(*divisor);
            b.binary(BinaryOp::DivSI, inner, divisor)
        }
        AffineExpr::Mod(inner, modulus) => {
            let inner = materialize(b, inner, pid);
            let modulus = b.const_i64(*modulus);
            b.binary(BinaryOp::RemSI, inner, modulus)
        }
    }
}

/// Element strides of an array in its memory layout.
fn memory_strides(array: &ArrayShape) -> Vec<i64> {
    let mut strides = vec![0; array.dims.len()];
    let mut stride = 1;
    for &dim in &array.minor_to_major {
        strides[dim as usize] = stride;
        stride *= array.dims[dim as usize];
    }
    strides
}

/// Linear element offset of the tile start: tile offsets dotted with the
/// memory strides, accumulated minor to major.
fn tile_base_offset(
    b: &mut FuncBuilder,
    array: &ArrayShape,
    tile_offsets: &[AffineExpr],
    pid: ValueId,
) -> EmitResult<ValueId> {
    ret_check!(
        tile_offsets.len() == array.dims.len(),
        "{} tile offsets for rank {}",
        tile_offsets.len(),
        array.dims.len()
    );
    let strides = memory_strides(array);
    let mut offset = None;
    for &dim in &array.minor_to_major {
        let expr = &tile_offsets[dim as usize];
        if *expr == AffineExpr::Const(0) {
            continue;
        }
        let term = materialize(b, expr, pid);
        let stride = b.const_i64(strides[dim as usize]);
        let term = b.binary(BinaryOp::MulI, term, stride);
        offset = Some(match offset {
            Some(sum) => b.binary(BinaryOp::AddI, sum, term),
            None => term,
        });
    }
    Ok(offset.unwrap_or_else(|| b.const_i64(0)))
}

fn array_shape<'m>(module: &'m HloModule, node: NodeId) -> EmitResult<&'m ArrayShape> {
    module.shape(node).as_array().ok_or_else(|| {
        EmitError::internal(format!("{} does not have an array shape", module.node(node).name))
    })
}

fn load_tiled_parameter(
    b: &mut FuncBuilder,
    module: &HloModule,
    instruction: &TiledInstruction,
    pid: ValueId,
) -> EmitResult<ValueId> {
    let node = module.node(instruction.node);
    let number = node
        .parameter_number()
        .ok_or_else(|| EmitError::internal(format!("{} is not a parameter", node.name)))?;
    let array = array_shape(module, instruction.node)?;
    ret_check!(
        instruction.tile_sizes.len() == array.dims.len(),
        "tile rank of {} does not match its shape",
        node.name
    );
    let strides = memory_strides(array);

    let offset = tile_base_offset(b, array, &instruction.tile_offsets, pid)?;
    let argument = b.arg(number);
    let base = b.add_ptr(argument, offset);

    let mut bounds = Vec::new();
    let mut tile_strides = Vec::new();
    let mut offsets = Vec::new();
    let mut block = Vec::new();
    let mut boundary_checks = Vec::new();
    for (dim, &size) in instruction.tile_sizes.iter().enumerate() {
        if size == 1 {
            continue;
        }
        let padded = (size as u64).next_power_of_two() as i64;
        if padded != size {
            boundary_checks.push(block.len());
        }
        bounds.push(b.const_i64(size));
        tile_strides.push(b.const_i64(instruction.tile_strides[dim] * strides[dim]));
        offsets.push(b.const_i32(0));
        block.push(padded);
    }

    let pointer = if block.is_empty() {
        base
    } else {
        let order: Vec<i32> = (0..block.len() as i32).rev().collect();
        b.make_tensor_ptr(base, &bounds, &tile_strides, &offsets, &block, &order)
    };
    let loaded = emit_parameter_load(b, pointer, &boundary_checks);
    cast(b, loaded, node_type(node.element_type())?)
}

/// Stores one row of the result at `row_base` elements into the output.
fn store_row(
    b: &mut FuncBuilder,
    output_number: usize,
    row_base: ValueId,
    shape: &RowShape,
    value: ValueId,
) -> EmitResult<()> {
    let argument = b.arg(output_number);
    let base = b.add_ptr(argument, row_base);
    let row_len = b.const_i64(shape.row_len);
    let unit = b.const_i64(1);
    let zero = b.const_i32(0);
    let pointer = b.make_tensor_ptr(base, &[row_len], &[unit], &[zero], &[shape.block_size], &[0]);
    let storage = b.elem(pointer);
    let stored = cast(b, value, storage)?;
    b.store(pointer, stored, &shape.boundary_checks());
    Ok(())
}

fn emit_tiled_rows(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    computation: ComputationId,
    shape: &RowShape,
    tiled: &TiledComputation,
    config: &TritonGemmConfig,
) -> EmitResult<LaunchDimensions> {
    let comp = cx.module.computation(computation);
    let pid = program_id_i64(b);

    let mut values = ValueEnv::new();
    let result = emit_tiled_scope(
        b,
        cx,
        tiled,
        |b, instruction| load_tiled_parameter(b, cx.module, instruction, pid),
        &mut values,
    )?;

    let root = tiled
        .root()
        .map(|id| tiled.get(id))
        .ok_or_else(|| EmitError::internal("tiled computation is empty"))?;
    let root_array = array_shape(cx.module, root.node)?;
    let root_offset = tile_base_offset(b, root_array, &root.tile_offsets, pid)?;
    store_row(b, comp.parameters.len(), root_offset, shape, result)?;

    let launch = launch_dimensions(shape, config, cx);
    tracing::debug!(computation = %comp.name, row_len = shape.row_len, %launch, "emitted tiled row kernel");
    Ok(launch)
}

fn emit_legacy_rows(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    computation: ComputationId,
    shape: &RowShape,
    analysis: &TritonFusionAnalysis,
    config: &TritonGemmConfig,
) -> EmitResult<LaunchDimensions> {
    let comp = cx.module.computation(computation);
    let pid = b.program_id(ProgramIdDim::X);
    let pid64 = b.cast(CastOp::ExtSI, pid, ScalarType::I64);
    let row_len = b.const_i64(shape.row_len);
    let row_offset = b.binary(BinaryOp::MulI, pid64, row_len);

    let mut values = ValueEnv::new();
    for &parameter in &comp.parameters {
        let node = cx.module.node(parameter);
        let number = node
            .parameter_number()
            .ok_or_else(|| EmitError::internal(format!("{} is not a parameter", node.name)))?;
        let row_spec = analysis.iter_spec(Scope::Output, parameter, 0);
        let batch_spec = analysis.iter_spec(Scope::Output, parameter, 1);
        ret_check!(
            analysis.iter_spec(Scope::Output, parameter, 2).is_none(),
            "parameter {} has more than two iterated dimensions",
            node.name
        );
        let argument = b.arg(number);

        let loaded = match row_spec {
            None => {
                // Constant along the row: one element per row, or one overall.
                let offset = match batch_spec.and_then(|spec| spec.first()) {
                    Some(fragment) => {
                        let stride = b.const_i64(fragment.stride);
                        b.binary(BinaryOp::MulI, pid64, stride)
                    }
                    None => b.const_i64(0),
                };
                let pointer = b.add_ptr(argument, offset);
                emit_parameter_load(b, pointer, &[])
            }
            Some(spec) => {
                ret_check!(
                    spec.len() == 1
                        && spec[0].count == shape.row_len
                        && spec[0].subfragments.len() == 1,
                    "row of {} is not one contiguous fragment of length {}",
                    node.name,
                    shape.row_len
                );
                let fragment = &spec[0];
                let offset = if batch_spec.is_some() {
                    row_offset
                } else {
                    b.const_i64(0)
                };
                let base = b.add_ptr(argument, offset);
                let count = b.const_i64(fragment.count);
                let stride = b.const_i64(fragment.stride);
                let start = b.const_i32(fragment.slice_start);
                let pointer =
                    b.make_tensor_ptr(base, &[count], &[stride], &[start], &[shape.block_size], &[0]);
                emit_parameter_load(b, pointer, &shape.boundary_checks())
            }
        };
        let value = cast(b, loaded, node_type(node.element_type())?)?;
        values.insert(parameter, value)?;
    }

    let tiled_dims = [DimProperties::new(0, Some(pid), shape.block_size, 1)];
    let result = emit_scope(
        b,
        cx,
        Some(analysis),
        Scope::Output,
        &tiled_dims,
        &cx.module.post_order(computation),
        &mut values,
    )?;
    store_row(b, comp.parameters.len(), row_offset, shape, result)?;

    let launch = launch_dimensions(shape, config, cx);
    tracing::debug!(computation = %comp.name, row_len = shape.row_len, %launch, "emitted row kernel from iteration specs");
    Ok(launch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilefuse::hlo::{PrimitiveType, Shape};

    #[test]
    fn memory_strides_follow_the_layout() {
        let row_major = Shape::array(PrimitiveType::F32, &[4, 100]);
        assert_eq!(memory_strides(row_major.as_array().unwrap()), vec![100, 1]);
        let column_major = Shape::with_layout(PrimitiveType::F32, &[4, 100], &[0, 1]);
        assert_eq!(memory_strides(column_major.as_array().unwrap()), vec![1, 4]);
    }
}
