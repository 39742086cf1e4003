//! f32 matmul emulation from several bf16 products.
//!
//! Each f32 operand is split into bf16 parts `hi + mid + lo` (or `hi + lo`)
//! by repeatedly truncating the mantissa. The partial products are summed from
//! the smallest upwards so the large `hi * hi` term is added last.

use tilefuse::ir::{BinaryOp, CastOp, CmpFPredicate, FuncBuilder, ScalarType, UnaryOp, ValueId};

use crate::codegen::types::{cast, constant_like, zeros_like};
use crate::error::EmitResult;
use crate::ret_check;

/// Keeps the sign, exponent and upper 7 mantissa bits of an `f32`.
fn truncate(b: &mut FuncBuilder, value: ValueId) -> ValueId {
    let bits = b.cast(CastOp::Bitcast, value, ScalarType::I32);
    let mask_ty = b.ty(bits).clone();
    let mask = b.int_const(&mask_ty, 0xFFFF_0000u32 as i32 as i64);
    let kept = b.binary(BinaryOp::AndI, bits, mask);
    b.cast(CastOp::Bitcast, kept, ScalarType::F32)
}

/// What truncation drops.
fn middle(b: &mut FuncBuilder, value: ValueId) -> ValueId {
    let high = truncate(b, value);
    b.binary(BinaryOp::SubF, value, high)
}

fn low(b: &mut FuncBuilder, value: ValueId) -> ValueId {
    let mid = middle(b, value);
    middle(b, mid)
}

fn round_to_bf16(b: &mut FuncBuilder, value: ValueId) -> EmitResult<ValueId> {
    cast(b, value, ScalarType::Bf16)
}

/// Zeroes non-finite partial sums so that `inf * 0` in the small terms does
/// not poison a finite result.
fn zero_non_finite(b: &mut FuncBuilder, value: ValueId, zero: ValueId) -> ValueId {
    let magnitude = b.unary(UnaryOp::AbsF, value);
    let inf = constant_like(b, value, ScalarType::F32, f64::INFINITY);
    let finite = b.cmpf(CmpFPredicate::Ogt, inf, magnitude);
    b.select(finite, value, zero)
}

fn check_f32(b: &FuncBuilder, lhs: ValueId, rhs: ValueId, acc: ValueId) -> EmitResult<()> {
    ret_check!(
        b.elem(lhs) == ScalarType::F32
            && b.elem(rhs) == ScalarType::F32
            && b.elem(acc) == ScalarType::F32,
        "bf16 emulation expects f32 operands and accumulator"
    );
    Ok(())
}

struct Parts {
    hi: ValueId,
    mid: ValueId,
    lo: ValueId,
}

fn split3(b: &mut FuncBuilder, value: ValueId) -> EmitResult<Parts> {
    let hi = truncate(b, value);
    let hi = round_to_bf16(b, hi)?;
    let mid = middle(b, value);
    let mid = truncate(b, mid);
    let mid = round_to_bf16(b, mid)?;
    let lo = low(b, value);
    let lo = truncate(b, lo);
    let lo = round_to_bf16(b, lo)?;
    Ok(Parts { hi, mid, lo })
}

/// `acc + lhs . rhs` from six bf16 products; accurate to about f32 precision.
pub fn emit_6x_dot(
    b: &mut FuncBuilder,
    lhs: ValueId,
    rhs: ValueId,
    acc: ValueId,
) -> EmitResult<ValueId> {
    check_f32(b, lhs, rhs, acc)?;
    let l = split3(b, lhs)?;
    let r = split3(b, rhs)?;
    let zero = zeros_like(b, acc);

    let mut result = b.dot(l.mid, r.mid, zero, false);
    result = b.dot(l.lo, r.hi, result, false);
    result = b.dot(l.hi, r.lo, result, false);
    result = b.dot(l.mid, r.hi, result, false);
    result = b.dot(l.hi, r.mid, result, false);
    result = zero_non_finite(b, result, zero);
    result = b.dot(l.hi, r.hi, result, false);
    Ok(b.binary(BinaryOp::AddF, acc, result))
}

/// `acc + lhs . rhs` from three bf16 products.
pub fn emit_3x_dot(
    b: &mut FuncBuilder,
    lhs: ValueId,
    rhs: ValueId,
    acc: ValueId,
) -> EmitResult<ValueId> {
    check_f32(b, lhs, rhs, acc)?;
    let split2 = |b: &mut FuncBuilder, value: ValueId| -> EmitResult<(ValueId, ValueId)> {
        let hi = truncate(b, value);
        let hi = round_to_bf16(b, hi)?;
        let lo = middle(b, value);
        let lo = round_to_bf16(b, lo)?;
        Ok((hi, lo))
    };
    let (lhs_hi, lhs_lo) = split2(b, lhs)?;
    let (rhs_hi, rhs_lo) = split2(b, rhs)?;
    let zero = zeros_like(b, acc);

    let mut result = b.dot(lhs_lo, rhs_hi, zero, false);
    result = b.dot(lhs_hi, rhs_lo, result, false);
    result = zero_non_finite(b, result, zero);
    result = b.dot(lhs_hi, rhs_hi, result, false);
    Ok(b.binary(BinaryOp::AddF, acc, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilefuse::ir::{OpKind, Type};

    fn dot_count(emit: fn(&mut FuncBuilder, ValueId, ValueId, ValueId) -> EmitResult<ValueId>) -> usize {
        let ty = Type::tensor(&[16, 16], ScalarType::F32);
        let mut b = FuncBuilder::new("k", &[]);
        let lhs = b.float_const(&ty, 1.5);
        let rhs = b.float_const(&ty, 0.25);
        let acc = b.float_const(&ty, 0.0);
        let result = emit(&mut b, lhs, rhs, acc).unwrap();
        assert_eq!(b.elem(result), ScalarType::F32);
        b.ret();
        let func = b.finish().unwrap();
        let dots = func.ops_named("tt.dot");
        assert!(dots
            .iter()
            .all(|op| op.kind == OpKind::Dot { allow_tf32: false }));
        dots.len()
    }

    #[test]
    fn emulations_issue_the_expected_number_of_products() {
        assert_eq!(dot_count(emit_6x_dot), 6);
        assert_eq!(dot_count(emit_3x_dot), 3);
    }

    #[test]
    fn non_f32_operands_are_rejected() {
        let ty = Type::tensor(&[16, 16], ScalarType::F16);
        let mut b = FuncBuilder::new("k", &[]);
        let lhs = b.float_const(&ty, 1.0);
        let acc = b.float_const(&ty.with_element(ScalarType::F32), 0.0);
        assert!(emit_3x_dot(&mut b, lhs, lhs, acc).unwrap_err().is_internal());
    }
}
