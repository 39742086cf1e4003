use tilefuse::hlo::{ComparisonDirection, Node, Opcode};
use tilefuse::ir::{BinaryOp, CmpFPredicate, CmpIPredicate, FuncBuilder, ScalarType, UnaryOp, ValueId};

use super::device_functions::device_function_name;
use super::scope::EmitContext;
use super::types::{cast, node_type, zeros_like};
use crate::error::{EmitError, EmitResult};

fn arg(node: &Node, inputs: &[ValueId], index: usize) -> EmitResult<ValueId> {
    inputs.get(index).copied().ok_or_else(|| {
        EmitError::internal(format!(
            "{} expects at least {} operands, got {}",
            node.name,
            index + 1,
            inputs.len()
        ))
    })
}

fn int_predicate(direction: ComparisonDirection, unsigned: bool) -> CmpIPredicate {
    match (direction, unsigned) {
        (ComparisonDirection::Eq, _) => CmpIPredicate::Eq,
        (ComparisonDirection::Ne, _) => CmpIPredicate::Ne,
        (ComparisonDirection::Lt, false) => CmpIPredicate::Slt,
        (ComparisonDirection::Lt, true) => CmpIPredicate::Ult,
        (ComparisonDirection::Le, false) => CmpIPredicate::Sle,
        (ComparisonDirection::Le, true) => CmpIPredicate::Ule,
        (ComparisonDirection::Gt, false) => CmpIPredicate::Sgt,
        (ComparisonDirection::Gt, true) => CmpIPredicate::Ugt,
        (ComparisonDirection::Ge, false) => CmpIPredicate::Sge,
        (ComparisonDirection::Ge, true) => CmpIPredicate::Uge,
    }
}

fn float_predicate(direction: ComparisonDirection) -> CmpFPredicate {
    match direction {
        ComparisonDirection::Eq => CmpFPredicate::Oeq,
        ComparisonDirection::Ne => CmpFPredicate::Une,
        ComparisonDirection::Lt => CmpFPredicate::Olt,
        ComparisonDirection::Le => CmpFPredicate::Ole,
        ComparisonDirection::Gt => CmpFPredicate::Ogt,
        ComparisonDirection::Ge => CmpFPredicate::Oge,
    }
}

/// Compares two values of the same element type. Integers compare signed,
/// predicates unsigned.
fn compare(
    b: &mut FuncBuilder,
    direction: ComparisonDirection,
    lhs: ValueId,
    rhs: ValueId,
) -> ValueId {
    let elem = b.elem(lhs);
    if elem.is_float() {
        b.cmpf(float_predicate(direction), lhs, rhs)
    } else {
        b.cmpi(int_predicate(direction, elem == ScalarType::I1), lhs, rhs)
    }
}

/// Maximum or minimum that propagates NaN from either side.
fn min_max(b: &mut FuncBuilder, is_max: bool, lhs: ValueId, rhs: ValueId) -> ValueId {
    if b.elem(lhs).is_float() {
        // lhs wins when it is NaN, or when rhs is not NaN and lhs compares favourably.
        let lhs_is_nan = b.cmpf(CmpFPredicate::Une, lhs, lhs);
        let rhs_is_not_nan = b.cmpf(CmpFPredicate::Oeq, rhs, rhs);
        let pred = if is_max {
            CmpFPredicate::Oge
        } else {
            CmpFPredicate::Ole
        };
        let lhs_wins = b.cmpf(pred, lhs, rhs);
        let ordered_wins = b.binary(BinaryOp::AndI, rhs_is_not_nan, lhs_wins);
        let take_lhs = b.binary(BinaryOp::OrI, lhs_is_nan, ordered_wins);
        b.select(take_lhs, lhs, rhs)
    } else {
        let pred = if is_max {
            CmpIPredicate::Sge
        } else {
            CmpIPredicate::Sle
        };
        let take_lhs = b.cmpi(pred, lhs, rhs);
        b.select(take_lhs, lhs, rhs)
    }
}

fn arith(b: &mut FuncBuilder, int_op: BinaryOp, float_op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
    let op = if b.elem(lhs).is_float() {
        float_op
    } else {
        int_op
    };
    b.binary(op, lhs, rhs)
}

/// Emits one elementwise node over already-emitted operand values.
pub fn emit_elementwise(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    node: &Node,
    inputs: &[ValueId],
) -> EmitResult<ValueId> {
    let first = arg(node, inputs, 0)?;
    let input_elem = b.elem(first);

    if matches!(input_elem, ScalarType::F32 | ScalarType::F64) {
        if let Some(element_type) = node.element_type() {
            if let Some(symbol) =
                device_function_name(node.opcode, element_type, &cx.device.compute_capability)
            {
                return Ok(b.extern_elementwise(
                    "libdevice",
                    &cx.device.libdevice_path,
                    &symbol,
                    true,
                    inputs,
                    input_elem,
                ));
            }
        }
    }

    let value = match node.opcode {
        Opcode::Copy => first,
        Opcode::Abs => {
            let op = if input_elem.is_float() {
                UnaryOp::AbsF
            } else {
                UnaryOp::AbsI
            };
            b.unary(op, first)
        }
        Opcode::Not => {
            let ty = b.ty(first).clone();
            let all_ones = b.int_const(&ty, -1);
            b.binary(BinaryOp::XOrI, first, all_ones)
        }
        Opcode::Negate => {
            let zero = zeros_like(b, first);
            arith(b, BinaryOp::SubI, BinaryOp::SubF, zero, first)
        }
        Opcode::Convert => cast(b, first, node_type(node.element_type())?)?,
        Opcode::Add => {
            let rhs = arg(node, inputs, 1)?;
            arith(b, BinaryOp::AddI, BinaryOp::AddF, first, rhs)
        }
        Opcode::Subtract => {
            let rhs = arg(node, inputs, 1)?;
            arith(b, BinaryOp::SubI, BinaryOp::SubF, first, rhs)
        }
        Opcode::Multiply => {
            let rhs = arg(node, inputs, 1)?;
            arith(b, BinaryOp::MulI, BinaryOp::MulF, first, rhs)
        }
        Opcode::Divide => {
            let rhs = arg(node, inputs, 1)?;
            arith(b, BinaryOp::DivSI, BinaryOp::DivF, first, rhs)
        }
        Opcode::Maximum => {
            let rhs = arg(node, inputs, 1)?;
            min_max(b, true, first, rhs)
        }
        Opcode::Minimum => {
            let rhs = arg(node, inputs, 1)?;
            min_max(b, false, first, rhs)
        }
        Opcode::And => {
            let rhs = arg(node, inputs, 1)?;
            b.binary(BinaryOp::AndI, first, rhs)
        }
        Opcode::Or => {
            let rhs = arg(node, inputs, 1)?;
            b.binary(BinaryOp::OrI, first, rhs)
        }
        Opcode::Xor => {
            let rhs = arg(node, inputs, 1)?;
            b.binary(BinaryOp::XOrI, first, rhs)
        }
        Opcode::Compare => {
            let rhs = arg(node, inputs, 1)?;
            let direction = node.comparison_direction().ok_or_else(|| {
                EmitError::internal(format!("compare {} has no direction", node.name))
            })?;
            compare(b, direction, first, rhs)
        }
        Opcode::Select => {
            let on_true = arg(node, inputs, 1)?;
            let on_false = arg(node, inputs, 2)?;
            let zero = zeros_like(b, first);
            let pred = b.cmpi(CmpIPredicate::Ne, first, zero);
            b.select(pred, on_true, on_false)
        }
        other => {
            return Err(EmitError::unsupported(format!(
                "Unsupported elementwise operation {} ({other})",
                node.name
            )))
        }
    };
    Ok(value)
}
