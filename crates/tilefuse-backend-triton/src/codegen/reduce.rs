use tilefuse::analysis::Scope;
use tilefuse::hlo::{Node, Opcode, PrimitiveType};
use tilefuse::ir::{CmpIPredicate, FuncBuilder, ScalarType, Type, ValueId};

use super::scope::{emit_constant, emit_scope, EmitContext, ValueEnv};
use super::types::{cast, node_type};
use crate::error::{EmitError, EmitResult};
use crate::ret_check;

/// Neutral element of the reduction, cast to `elem`.
fn emit_neutral(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    reduce: &Node,
    elem: ScalarType,
) -> EmitResult<ValueId> {
    let init = cx
        .module
        .operand(reduce.id, 1)
        .ok_or_else(|| EmitError::internal(format!("reduce {} has no init", reduce.name)))?;
    let neutral = if init.opcode == Opcode::Convert {
        let inner = cx
            .module
            .operand(init.id, 0)
            .ok_or_else(|| EmitError::internal("convert without operand"))?;
        ret_check!(
            inner.opcode == Opcode::Constant,
            "reduce init {} must convert a constant",
            init.name
        );
        ret_check!(
            inner.element_type() == Some(PrimitiveType::Bf16)
                && init.element_type() == Some(PrimitiveType::F32),
            "only bf16 -> f32 converted init values are supported"
        );
        let constant = emit_constant(b, inner)?;
        cast(b, constant, ScalarType::F32)?
    } else {
        ret_check!(
            init.opcode == Opcode::Constant,
            "reduce init {} is not a constant",
            init.name
        );
        emit_constant(b, init)?
    };
    cast(b, neutral, elem)
}

/// Emits an innermost-axis reduction of `input`.
///
/// Blocks padded past the row length fill the padding with the neutral
/// element. The reduction itself runs in `f32` and the result is cast back
/// to the node's element type.
pub fn emit_reduce(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    reduce: &Node,
    input: ValueId,
) -> EmitResult<ValueId> {
    ret_check!(
        reduce.operands.len() == 2,
        "reduce {} must have exactly one input and one init",
        reduce.name
    );
    let operand_shape = cx.module.shape(reduce.operands[0]);
    let operand_rank = operand_shape.rank();
    ret_check!(operand_rank > 0);
    ret_check!(
        reduce.reduce_dimensions() == Some(&[operand_rank as i64 - 1][..]),
        "reduce {} must reduce the innermost dimension",
        reduce.name
    );

    let input_shape = b.ty(input).shape().to_vec();
    let block_row = *input_shape
        .last()
        .ok_or_else(|| EmitError::internal("reduce input tile has rank 0"))?;
    let row_len = operand_shape.dims()[operand_rank - 1];
    ret_check!(
        block_row >= row_len,
        "block row {block_row} is shorter than the reduced row {row_len}"
    );

    let input_elem = b.elem(input);
    let neutral = emit_neutral(b, cx, reduce, input_elem)?;

    let mut input = input;
    if block_row != row_len {
        let range = b.make_range(0, block_row as i32);
        let row_len_value = b.const_i32(row_len);
        let bound = b.splat(row_len_value, &[block_row]);
        let mut mask = b.cmpi(CmpIPredicate::Slt, range, bound);
        if input_shape.len() > 1 {
            for _ in 1..input_shape.len() {
                mask = b.expand_dims(mask, 0);
            }
            mask = b.broadcast(mask, &input_shape);
        }
        let padding = b.splat(neutral, &input_shape);
        input = b.select(mask, input, padding);
    }

    let casted = cast(b, input, ScalarType::F32)?;

    let reducer = reduce
        .called_computation()
        .ok_or_else(|| EmitError::internal(format!("reduce {} has no reducer", reduce.name)))?;
    let scalar = Type::Scalar(ScalarType::F32);
    let args = b.begin_block(&[scalar.clone(), scalar]);
    let mut region_values = ValueEnv::new();
    let mut to_emit = Vec::new();
    for id in cx.module.post_order(reducer) {
        let node = cx.module.node(id);
        match node.parameter_number() {
            Some(number) => {
                ret_check!(number < 2, "reducer parameter {number} out of range");
                region_values.insert(id, args[number])?;
            }
            None => to_emit.push(id),
        }
    }
    ret_check!(!to_emit.is_empty(), "reducer has no body");
    let combined = emit_scope(b, cx, None, Scope::Output, &[], &to_emit, &mut region_values)?;
    let combined = cast(b, combined, ScalarType::F32)?;
    b.reduce_return(combined);
    let region = b
        .end_block()
        .ok_or_else(|| EmitError::internal("reduce region was not open"))?;

    let mut result = b.reduce(casted, input_shape.len() - 1, region);
    if !b.ty(result).is_tensor() {
        result = b.splat(result, &[]);
    }
    cast(b, result, node_type(reduce.element_type())?)
}
