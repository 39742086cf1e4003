use std::collections::BTreeSet;

use tilefuse::analysis::{DimIterationSpec, Scope, TritonFusionAnalysis};
use tilefuse::hlo::{HloModule, NodeId, Opcode};
use tilefuse::ir::{BinaryOp, CastOp, CmpIPredicate, FuncBuilder, ProgramIdDim, ScalarType, ValueId};

use super::dims::MatMulDims;
use crate::codegen::DimProperties;
use crate::error::{EmitError, EmitResult};
use crate::ret_check;

/// Picks `choices[i]` for the first `i` with `index < limits[i]`, or the last
/// choice when `index` is past every limit.
pub fn multi_select(
    b: &mut FuncBuilder,
    index: ValueId,
    limits: &[ValueId],
    choices: &[ValueId],
) -> EmitResult<ValueId> {
    ret_check!(
        choices.len() == limits.len() + 1,
        "{} choices for {} limits",
        choices.len(),
        limits.len()
    );
    let mut result = choices[0];
    for (limit, &choice) in limits.iter().zip(&choices[1..]) {
        let below = b.cmpi(CmpIPredicate::Slt, index, *limit);
        result = b.select(below, result, choice);
    }
    Ok(result)
}

/// One operand role of the matmul: which dimensions are tiled and how.
#[derive(Debug, Clone)]
pub struct Side {
    pub scope: Scope,
    pub tiled_dims: Vec<DimProperties>,
    pub batch_dim_idx: Option<usize>,
}

/// Nodes a scope reads from memory: parameters, or the concatenations they feed.
pub fn scope_inputs(
    module: &HloModule,
    analysis: &TritonFusionAnalysis,
    scope: Scope,
) -> Vec<NodeId> {
    let mut inputs = BTreeSet::new();
    for parameter in analysis.scope_parameters(scope) {
        let concat = module
            .users(parameter)
            .into_iter()
            .find(|user| module.node(*user).opcode == Opcode::Concatenate);
        inputs.insert(concat.unwrap_or(parameter));
    }
    inputs.into_iter().collect()
}

/// Kernel arguments backing a scope input, one per concatenated operand.
pub fn input_arguments(
    module: &HloModule,
    b: &FuncBuilder,
    input: NodeId,
) -> EmitResult<Vec<ValueId>> {
    let node = module.node(input);
    let argument = |id: NodeId| {
        let parameter = module.node(id);
        let number = parameter.parameter_number().ok_or_else(|| {
            EmitError::internal(format!("{} is not a parameter", parameter.name))
        })?;
        ret_check!(number < b.num_args(), "no argument for parameter {number}");
        Ok(b.arg(number))
    };
    match node.opcode {
        Opcode::Concatenate => node.operands.iter().map(|&id| argument(id)).collect(),
        _ => Ok(vec![argument(input)?]),
    }
}

/// Builds block pointers into the operands and result of a matmul fusion.
pub struct Addressing<'a> {
    pub module: &'a HloModule,
    pub analysis: &'a TritonFusionAnalysis,
    pub dims: &'a MatMulDims,
    /// Integer type of address arithmetic: `i64` when any operand exceeds `i32` indexing.
    pub index_ty: ScalarType,
    pub batch_program_id_dim: ProgramIdDim,
}

struct ConcatSelect {
    pid_offset: ValueId,
    boundaries: Vec<ValueId>,
    dim_idx: usize,
}

impl Addressing<'_> {
    fn spec(&self, scope: Scope, node: NodeId, dim: usize) -> Option<&DimIterationSpec> {
        self.analysis.iter_spec(scope, node, dim)
    }

    fn index_const(&self, b: &mut FuncBuilder, value: i64) -> ValueId {
        b.int_const(&tilefuse::ir::Type::Scalar(self.index_ty), value)
    }

    /// Widens an `i32` scalar to the index type.
    fn to_index(&self, b: &mut FuncBuilder, value: ValueId) -> ValueId {
        if self.index_ty == ScalarType::I64 {
            b.cast(CastOp::ExtSI, value, ScalarType::I64)
        } else {
            value
        }
    }

    fn select_per_input(
        &self,
        b: &mut FuncBuilder,
        concat: Option<&ConcatSelect>,
        index: Option<ValueId>,
        choices: &[ValueId],
    ) -> EmitResult<ValueId> {
        match concat {
            Some(concat) => multi_select(
                b,
                index.unwrap_or(concat.pid_offset),
                &concat.boundaries,
                choices,
            ),
            None => choices
                .first()
                .copied()
                .ok_or_else(|| EmitError::internal("no choices to select from")),
        }
    }

    /// Batch stride and offset of one input of `side`, if it has a batch dimension.
    fn batch_stride(&self, side: &Side, input: NodeId) -> EmitResult<Option<(i64, i64)>> {
        if side.scope != Scope::Rhs {
            if let Some(split) = self.dims.lhs_noncontracting_split {
                let Some(first_dim) = side.tiled_dims.first() else {
                    return Ok(None);
                };
                let Some(spec) = self.spec(side.scope, input, first_dim.index) else {
                    return Ok(None);
                };
                let stride = if spec.len() > 1 {
                    spec[1].stride
                } else {
                    spec[0].stride * (spec[0].count / split)
                };
                ret_check!(stride != 0, "zero stride for the non-contracting split");
                return Ok(Some((stride, 0)));
            }
        }
        let Some(batch_dim) = side.batch_dim_idx else {
            return Ok(None);
        };
        Ok(self
            .spec(side.scope, input, batch_dim)
            .and_then(|spec| spec.first())
            .map(|fragment| (fragment.stride, fragment.slice_start)))
    }

    /// Emits a pointer to the block of `input` processed by this program.
    ///
    /// `bases` holds one kernel argument per concatenated operand (a single one
    /// otherwise). Dimensions whose block may run past the tensor end are
    /// appended to `boundary_checks`.
    pub fn emit_tensor_pointer(
        &self,
        b: &mut FuncBuilder,
        input: NodeId,
        side: &Side,
        bases: &[ValueId],
        pid_k: Option<ValueId>,
        boundary_checks: &mut Vec<usize>,
    ) -> EmitResult<ValueId> {
        let node = self.module.node(input);
        let is_concat = node.opcode == Opcode::Concatenate;
        let inputs: Vec<NodeId> = if is_concat {
            node.operands.clone()
        } else {
            vec![input]
        };
        ret_check!(
            bases.len() == inputs.len(),
            "{} bases for {} inputs",
            bases.len(),
            inputs.len()
        );

        let mut concat = None;
        let mut base = bases[0];
        if is_concat {
            let dim_idx = if side.scope == Scope::Lhs {
                self.dims.lhs_noncontracting_dim_idx
            } else {
                self.dims.rhs_noncontracting_dim_idx
            };
            let properties = side
                .tiled_dims
                .iter()
                .find(|dim| dim.index == dim_idx)
                .ok_or_else(|| EmitError::internal("concatenation along an untiled dimension"))?;
            let pid = properties
                .pid
                .ok_or_else(|| EmitError::internal("concatenated dimension has no program id"))?;

            let mut boundaries = Vec::with_capacity(inputs.len() - 1);
            for &operand in &inputs[..inputs.len() - 1] {
                let fragment = self
                    .spec(side.scope, operand, dim_idx)
                    .and_then(|spec| spec.first())
                    .ok_or_else(|| EmitError::internal("concatenated operand has no spec"))?;
                if fragment.sliced_count % properties.block_size != 0 {
                    return Err(EmitError::uncompilable(
                        "Operand is not divisible by the block size.",
                    ));
                }
                boundaries.push(b.const_i32(fragment.sliced_count - fragment.slice_start));
            }
            let block_size = b.const_i32(properties.block_size);
            let pid_offset = b.binary(BinaryOp::MulI, pid, block_size);
            base = multi_select(b, pid_offset, &boundaries, bases)?;
            concat = Some(ConcatSelect {
                pid_offset,
                boundaries,
                dim_idx,
            });
        }

        let mut bounds = Vec::new();
        let mut strides = Vec::new();
        let mut tensor_offsets = Vec::new();
        let mut block_offsets = Vec::new();
        let mut block_dims = Vec::new();
        let mut dim_order: Vec<i32> = Vec::new();

        for dim in &side.tiled_dims {
            let Some(spec) = self.spec(side.scope, input, dim.index) else {
                continue;
            };
            let pid_offset = match dim.pid {
                Some(pid) => {
                    let block_size = b.const_i32(dim.block_size);
                    b.binary(BinaryOp::MulI, pid, block_size)
                }
                None => b.const_i32(0),
            };

            let mut input_strides = Vec::with_capacity(inputs.len());
            let mut input_offsets = Vec::with_capacity(inputs.len());
            let mut input_bounds = Vec::with_capacity(inputs.len());
            for &operand in &inputs {
                let fragment = self
                    .spec(side.scope, operand, dim.index)
                    .and_then(|spec| spec.first())
                    .ok_or_else(|| {
                        EmitError::internal(format!(
                            "{} has no spec for dimension {}",
                            self.module.node(operand).name,
                            dim.index
                        ))
                    })?;
                input_strides.push(b.const_i64(fragment.stride));
                let start = b.const_i32(fragment.slice_start);
                input_offsets.push(b.binary(BinaryOp::AddI, pid_offset, start));
                input_bounds.push(b.const_i64(fragment.count));
            }
            strides.push(self.select_per_input(b, concat.as_ref(), None, &input_strides)?);

            match concat.as_ref().filter(|concat| concat.dim_idx == dim.index) {
                Some(concat) => {
                    block_offsets.push(multi_select(
                        b,
                        pid_offset,
                        &concat.boundaries,
                        &input_offsets,
                    )?);
                    bounds.push(multi_select(
                        b,
                        pid_offset,
                        &concat.boundaries,
                        &input_bounds,
                    )?);
                }
                None => {
                    block_offsets.push(pid_offset);
                    let mut count = spec[0].count;
                    if side.scope == Scope::Output
                        && dim.index == self.dims.out_lhs_noncontracting_dim_idx
                        && spec.len() == 1
                    {
                        if let Some(split) = self.dims.lhs_noncontracting_split {
                            count /= split;
                        }
                    }
                    bounds.push(b.const_i64(count));
                    if count % (dim.block_size * dim.split_value) != 0 {
                        boundary_checks.push(bounds.len() - 1);
                    }
                }
            }
            tensor_offsets.push(b.const_i32(spec[0].slice_start));
            block_dims.push(dim.block_size);
            dim_order.insert(0, dim_order.len() as i32);
        }

        let mut batch = Vec::with_capacity(inputs.len());
        for &operand in &inputs {
            batch.push(self.batch_stride(side, operand)?);
        }
        if batch.iter().any(|entry| entry.is_some_and(|(stride, _)| stride != 0)) {
            let mut stride_values = Vec::with_capacity(batch.len());
            let mut offset_values = Vec::with_capacity(batch.len());
            for entry in &batch {
                let (stride, offset) = entry.unwrap_or((0, 0));
                stride_values.push(self.index_const(b, stride));
                offset_values.push(self.index_const(b, offset));
            }
            let stride = self.select_per_input(b, concat.as_ref(), None, &stride_values)?;
            let offset = self.select_per_input(b, concat.as_ref(), None, &offset_values)?;
            let pid_batch = b.program_id(self.batch_program_id_dim);
            let pid_batch = self.to_index(b, pid_batch);
            let batch_index = b.binary(BinaryOp::AddI, offset, pid_batch);
            let batch_offset = b.binary(BinaryOp::MulI, batch_index, stride);
            base = b.add_ptr(base, batch_offset);
        }

        if side.scope == Scope::Output {
            if let (Some(split_dim), Some(pid_k)) = (self.dims.out_split_k_dim_idx, pid_k) {
                if let Some(fragment) = self
                    .spec(Scope::Output, input, split_dim)
                    .and_then(|spec| spec.first())
                {
                    let stride = self.index_const(b, fragment.stride);
                    let pid_k = self.to_index(b, pid_k);
                    let offset = b.binary(BinaryOp::MulI, pid_k, stride);
                    base = b.add_ptr(base, offset);
                }
            }
        }

        if block_dims.is_empty() {
            return Ok(base);
        }
        let tensor_ptr =
            b.make_tensor_ptr(base, &bounds, &strides, &tensor_offsets, &block_dims, &dim_order);
        Ok(b.advance(tensor_ptr, &block_offsets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilefuse::ir::{OpKind, Type};

    #[test]
    fn multi_select_chains_one_select_per_limit() {
        let mut b = FuncBuilder::new("k", &[]);
        let index = b.const_i32(5);
        let limits = [b.const_i32(4), b.const_i32(8)];
        let choices = [b.const_i32(10), b.const_i32(20), b.const_i32(30)];
        let picked = multi_select(&mut b, index, &limits, &choices).unwrap();
        assert_eq!(b.ty(picked), &Type::Scalar(ScalarType::I32));
        b.ret();
        let func = b.finish().unwrap();
        assert_eq!(func.ops_named(OpKind::Select.name()).len(), 2);
    }

    #[test]
    fn multi_select_requires_one_more_choice_than_limits() {
        let mut b = FuncBuilder::new("k", &[]);
        let index = b.const_i32(0);
        let choice = b.const_i32(1);
        let err = multi_select(&mut b, index, &[index], &[choice]).unwrap_err();
        assert!(err.is_internal());
    }
}
