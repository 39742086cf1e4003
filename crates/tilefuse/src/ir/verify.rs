use std::collections::HashSet;

use thiserror::Error;

use super::func::{Func, Module};
use super::ops::{Block, CastOp, Constant, OpKind, Operation, ValueId};
use super::types::{ScalarType, Type};

/// Structural problems found in a tile-IR function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("{op}: value {value} used before definition")]
    UndefinedValue { op: &'static str, value: ValueId },
    #[error("{op}: {message}")]
    Invalid { op: &'static str, message: String },
}

impl VerifyError {
    pub fn structure(op: &'static str, message: impl Into<String>) -> Self {
        VerifyError::Invalid {
            op,
            message: message.into(),
        }
    }
}

type VerifyResult<T> = Result<T, VerifyError>;

pub fn verify_module(module: &Module) -> VerifyResult<()> {
    verify_func(&module.func)
}

pub fn verify_func(func: &Func) -> VerifyResult<()> {
    if func.arg_attrs.len() != func.args().len() {
        return Err(VerifyError::structure(
            "tt.func",
            "argument attribute count does not match argument count",
        ));
    }
    let mut verifier = Verifier {
        func,
        defined: HashSet::new(),
    };
    verifier.block(&func.body, Terminator::Return)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Terminator {
    Return,
    Yield,
    ReduceReturn,
}

struct Verifier<'f> {
    func: &'f Func,
    defined: HashSet<ValueId>,
}

impl<'f> Verifier<'f> {
    fn ty(&self, op: &'static str, value: ValueId) -> VerifyResult<&'f Type> {
        self.func
            .value_type(value)
            .ok_or(VerifyError::UndefinedValue { op, value })
    }

    fn block(&mut self, block: &Block, terminator: Terminator) -> VerifyResult<()> {
        let saved = self.defined.clone();
        self.defined.extend(block.args.iter().copied());
        for (index, op) in block.ops.iter().enumerate() {
            let is_last = index + 1 == block.ops.len();
            if op.kind.is_terminator() != is_last {
                return Err(VerifyError::structure(
                    op.kind.name(),
                    "terminators must appear exactly once at the end of a block",
                ));
            }
            self.op(op)?;
            self.defined.extend(op.results.iter().copied());
        }
        let expected = match block.terminator().map(|op| &op.kind) {
            Some(OpKind::Return) => Terminator::Return,
            Some(OpKind::Yield) => Terminator::Yield,
            Some(OpKind::ReduceReturn) => Terminator::ReduceReturn,
            _ => {
                return Err(VerifyError::structure("block", "missing terminator"));
            }
        };
        if expected != terminator {
            return Err(VerifyError::structure(
                block.ops.last().map(|op| op.kind.name()).unwrap_or("block"),
                "terminator does not match the enclosing operation",
            ));
        }
        self.defined = saved;
        Ok(())
    }

    fn op(&mut self, op: &Operation) -> VerifyResult<()> {
        let name = op.kind.name();
        for operand in &op.operands {
            if !self.defined.contains(operand) {
                return Err(VerifyError::UndefinedValue {
                    op: name,
                    value: *operand,
                });
            }
        }
        let fail = |message: String| Err(VerifyError::structure(name, message));
        let operand_types = op
            .operands
            .iter()
            .map(|v| self.ty(name, *v))
            .collect::<VerifyResult<Vec<_>>>()?;
        let result_types = op
            .results
            .iter()
            .map(|v| self.ty(name, *v))
            .collect::<VerifyResult<Vec<_>>>()?;
        let expect_counts = |operands: usize, results: usize| -> VerifyResult<()> {
            if operand_types.len() != operands || result_types.len() != results {
                return Err(VerifyError::structure(
                    name,
                    format!(
                        "expected {operands} operands and {results} results, got {} and {}",
                        operand_types.len(),
                        result_types.len()
                    ),
                ));
            }
            Ok(())
        };

        match &op.kind {
            OpKind::Constant(value) => {
                expect_counts(0, 1)?;
                let result = result_types[0];
                if result.is_pointer() {
                    return fail("constants cannot have pointer type".into());
                }
                let is_float = result.element_type().is_float();
                if matches!(value, Constant::Float(_)) != is_float {
                    return fail(format!("literal kind does not match {result}"));
                }
            }
            OpKind::Binary(binary) => {
                expect_counts(2, 1)?;
                same_types(name, &[operand_types[0], operand_types[1], result_types[0]])?;
                if binary.is_float() != operand_types[0].element_type().is_float() {
                    return fail(format!("operand type {} has wrong kind", operand_types[0]));
                }
            }
            OpKind::Unary(_) => {
                expect_counts(1, 1)?;
                same_types(name, &[operand_types[0], result_types[0]])?;
            }
            OpKind::CmpI(_) | OpKind::CmpF(_) => {
                expect_counts(2, 1)?;
                same_types(name, &[operand_types[0], operand_types[1]])?;
                let float = matches!(op.kind, OpKind::CmpF(_));
                if operand_types[0].element_type().is_float() != float {
                    return fail(format!("operand type {} has wrong kind", operand_types[0]));
                }
                if *result_types[0] != operand_types[0].with_element(ScalarType::I1) {
                    return fail(format!("result type {} is not i1-shaped", result_types[0]));
                }
            }
            OpKind::Select => {
                expect_counts(3, 1)?;
                same_types(name, &[operand_types[1], operand_types[2], result_types[0]])?;
                let cond = operand_types[0];
                if cond.element_type() != ScalarType::I1
                    || !(cond.is_scalar() || cond.shape() == result_types[0].shape())
                {
                    return fail(format!("condition type {cond} is invalid"));
                }
            }
            OpKind::Cast(cast) => {
                expect_counts(1, 1)?;
                verify_cast(name, *cast, operand_types[0], result_types[0])?;
            }
            OpKind::ExternElementwise { .. } => {
                if operand_types.is_empty() || result_types.len() != 1 {
                    return fail("expects at least one operand and one result".into());
                }
                for ty in &operand_types {
                    if ty.shape() != result_types[0].shape() {
                        return fail(format!("operand {ty} does not match result shape"));
                    }
                }
            }
            OpKind::Splat => {
                expect_counts(1, 1)?;
                if !operand_types[0].is_scalar() || !result_types[0].is_tensor() {
                    return fail("splat expects a scalar operand and tensor result".into());
                }
                if operand_types[0].element_type() != result_types[0].element_type() {
                    return fail("element types differ".into());
                }
            }
            OpKind::Broadcast => {
                expect_counts(1, 1)?;
                let (from, to) = (operand_types[0], result_types[0]);
                if !from.is_tensor() || !to.is_tensor() || from.shape().len() != to.shape().len()
                {
                    return fail(format!("cannot broadcast {from} to {to}"));
                }
                for (a, b) in from.shape().iter().zip(to.shape()) {
                    if a != b && *a != 1 {
                        return fail(format!("cannot broadcast {from} to {to}"));
                    }
                }
            }
            OpKind::ExpandDims { axis } => {
                expect_counts(1, 1)?;
                let mut expected = operand_types[0].shape().to_vec();
                if *axis > expected.len() {
                    return fail(format!("axis {axis} out of range"));
                }
                expected.insert(*axis, 1);
                if result_types[0].shape() != expected.as_slice() {
                    return fail(format!("unexpected result type {}", result_types[0]));
                }
            }
            OpKind::MakeRange { start, end } => {
                expect_counts(0, 1)?;
                let expected = Type::tensor(&[i64::from(end - start)], ScalarType::I32);
                if *result_types[0] != expected || end <= start {
                    return fail(format!("invalid range [{start}, {end})"));
                }
            }
            OpKind::GetProgramId(_) => {
                expect_counts(0, 1)?;
                if *result_types[0] != Type::Scalar(ScalarType::I32) {
                    return fail("program id must be i32".into());
                }
            }
            OpKind::AddPtr => {
                expect_counts(2, 1)?;
                if !matches!(operand_types[0], Type::Ptr(_))
                    || !operand_types[1].is_scalar()
                    || !operand_types[1].element_type().is_integer()
                    || result_types[0] != operand_types[0]
                {
                    return fail("expects a scalar pointer and integer offset".into());
                }
            }
            OpKind::MakeTensorPtr { order } => {
                let Type::BlockPtr(block) = result_types.first().copied().ok_or_else(|| {
                    VerifyError::structure(name, "missing result")
                })?
                else {
                    return fail("result must be a block pointer".into());
                };
                let rank = block.rank();
                expect_counts(1 + 3 * rank, 1)?;
                if order.len() != rank {
                    return fail(format!("order has {} entries for rank {rank}", order.len()));
                }
                if !matches!(operand_types[0], Type::Ptr(elem) if *elem == block.elem) {
                    return fail("base pointer element type differs from block".into());
                }
                for ty in &operand_types[1..1 + 2 * rank] {
                    if **ty != Type::Scalar(ScalarType::I64) {
                        return fail(format!("shape and strides must be i64, got {ty}"));
                    }
                }
                for ty in &operand_types[1 + 2 * rank..] {
                    if **ty != Type::Scalar(ScalarType::I32) {
                        return fail(format!("offsets must be i32, got {ty}"));
                    }
                }
            }
            OpKind::Advance => {
                let Some(Type::BlockPtr(block)) = operand_types.first().copied() else {
                    return fail("expects a block pointer".into());
                };
                expect_counts(1 + block.rank(), 1)?;
                if result_types[0] != operand_types[0] {
                    return fail("result type must match the pointer".into());
                }
                for ty in &operand_types[1..] {
                    if **ty != Type::Scalar(ScalarType::I32) {
                        return fail(format!("offsets must be i32, got {ty}"));
                    }
                }
            }
            OpKind::Load { boundary_check, .. } => {
                expect_counts(1, 1)?;
                let ptr = operand_types[0];
                let Some(pointee) = ptr.pointee() else {
                    return fail(format!("cannot load through {ptr}"));
                };
                if pointee != *result_types[0] {
                    return fail(format!("loads {pointee}, declared {}", result_types[0]));
                }
                check_boundary(name, boundary_check, ptr)?;
            }
            OpKind::Store { boundary_check } => {
                expect_counts(2, 0)?;
                let ptr = operand_types[0];
                let Some(pointee) = ptr.pointee() else {
                    return fail(format!("cannot store through {ptr}"));
                };
                let value = operand_types[1];
                let widened_bool = value.element_type() == ScalarType::I1
                    && pointee.element_type() == ScalarType::I8
                    && value.shape() == pointee.shape();
                if pointee != *value && !widened_bool {
                    return fail(format!("stores {value} through {ptr}"));
                }
                check_boundary(name, boundary_check, ptr)?;
            }
            OpKind::Dot { .. } | OpKind::SparseDot => {
                let sparse = matches!(op.kind, OpKind::SparseDot);
                expect_counts(if sparse { 4 } else { 3 }, 1)?;
                let (a, b, c) = (
                    operand_types[0].shape(),
                    operand_types[1].shape(),
                    operand_types[2].shape(),
                );
                if a.len() != 2 || b.len() != 2 || c.len() != 2 {
                    return fail("dot operands must be rank-2 tensors".into());
                }
                let k = if sparse { a[1] * 2 } else { a[1] };
                if k != b[0] || a[0] != c[0] || b[1] != c[1] {
                    return fail(format!(
                        "incompatible dot shapes {} x {} + {}",
                        operand_types[0], operand_types[1], operand_types[2]
                    ));
                }
                if operand_types[0].element_type() != operand_types[1].element_type() {
                    return fail("dot inputs must share an element type".into());
                }
                if result_types[0] != operand_types[2] {
                    return fail("result type must match the accumulator".into());
                }
                if sparse {
                    let meta = operand_types[3];
                    if meta.element_type() != ScalarType::I16
                        || meta.shape() != [a[0], k / 16].as_slice()
                    {
                        return fail(format!("invalid sparsity metadata {meta}"));
                    }
                }
            }
            OpKind::Reduce { axis } => {
                expect_counts(1, 1)?;
                let input = operand_types[0];
                if *axis >= input.shape().len() {
                    return fail(format!("axis {axis} out of range for {input}"));
                }
                let [region] = op.regions.as_slice() else {
                    return fail("expects exactly one region".into());
                };
                let elem = input.element_type();
                let scalar = Type::Scalar(elem);
                if region.args.len() != 2
                    || region
                        .args
                        .iter()
                        .any(|arg| self.func.value_type(*arg) != Some(&scalar))
                {
                    return fail("reducer region takes two scalar arguments".into());
                }
                let mut shape = input.shape().to_vec();
                shape.remove(*axis);
                let expected = if shape.is_empty() {
                    scalar.clone()
                } else {
                    Type::tensor(&shape, elem)
                };
                if *result_types[0] != expected {
                    return fail(format!("expected result {expected}, got {}", result_types[0]));
                }
                self.block(region, Terminator::ReduceReturn)?;
                if let Some(ret) = region.terminator() {
                    let returned = ret
                        .operands
                        .first()
                        .and_then(|v| self.func.value_type(*v));
                    if ret.operands.len() != 1 || returned != Some(&scalar) {
                        return fail("reducer must return one scalar".into());
                    }
                }
                return Ok(());
            }
            OpKind::For => {
                if operand_types.len() < 3 {
                    return fail("expects lower, upper and step".into());
                }
                let bound_ty = operand_types[0];
                if !bound_ty.is_scalar()
                    || !bound_ty.element_type().is_integer()
                    || operand_types[1] != bound_ty
                    || operand_types[2] != bound_ty
                {
                    return fail("loop bounds must share one integer scalar type".into());
                }
                let inits = &operand_types[3..];
                if result_types.len() != inits.len()
                    || result_types.iter().zip(inits).any(|(r, i)| r != i)
                {
                    return fail("results must match iteration arguments".into());
                }
                let [body] = op.regions.as_slice() else {
                    return fail("expects exactly one region".into());
                };
                let arg_types = body
                    .args
                    .iter()
                    .map(|arg| self.func.value_type(*arg))
                    .collect::<Vec<_>>();
                if arg_types.len() != inits.len() + 1
                    || arg_types[0] != Some(bound_ty)
                    || arg_types[1..].iter().zip(inits).any(|(a, i)| *a != Some(*i))
                {
                    return fail("body arguments must be the induction variable and iteration arguments".into());
                }
                self.block(body, Terminator::Yield)?;
                if let Some(yielded) = body.terminator() {
                    let yielded_types = yielded
                        .operands
                        .iter()
                        .map(|v| self.func.value_type(*v))
                        .collect::<Vec<_>>();
                    if yielded_types.len() != inits.len()
                        || yielded_types.iter().zip(inits).any(|(y, i)| *y != Some(*i))
                    {
                        return fail("yielded values must match iteration arguments".into());
                    }
                }
                return Ok(());
            }
            OpKind::ReduceReturn | OpKind::Yield | OpKind::Return => {
                if !result_types.is_empty() {
                    return fail("terminators have no results".into());
                }
            }
        }
        if !op.regions.is_empty() {
            return fail("operation does not take regions".into());
        }
        Ok(())
    }
}

fn same_types(op: &'static str, types: &[&Type]) -> VerifyResult<()> {
    if let Some((first, rest)) = types.split_first() {
        if let Some(other) = rest.iter().find(|ty| **ty != *first) {
            return Err(VerifyError::structure(
                op,
                format!("type mismatch: {first} vs {other}"),
            ));
        }
    }
    Ok(())
}

fn check_boundary(op: &'static str, dims: &[usize], ptr: &Type) -> VerifyResult<()> {
    if dims.is_empty() {
        return Ok(());
    }
    match ptr {
        Type::BlockPtr(block) if dims.iter().all(|dim| *dim < block.rank()) => Ok(()),
        _ => Err(VerifyError::structure(
            op,
            format!("boundary check {dims:?} invalid for {ptr}"),
        )),
    }
}

fn verify_cast(op: &'static str, cast: CastOp, from: &Type, to: &Type) -> VerifyResult<()> {
    if from.shape() != to.shape() || from.is_tensor() != to.is_tensor() {
        return Err(VerifyError::structure(
            op,
            format!("cast changes shape: {from} -> {to}"),
        ));
    }
    let (src, dst) = (from.element_type(), to.element_type());
    let ok = match cast {
        CastOp::ExtF => src.is_float() && dst.is_float() && dst.mantissa_width() > src.mantissa_width(),
        CastOp::TruncF => {
            src.is_float() && dst.is_float() && dst.mantissa_width() < src.mantissa_width()
        }
        CastOp::ExtSI | CastOp::ExtUI => {
            src.is_integer() && dst.is_integer() && dst.bit_width() > src.bit_width()
        }
        CastOp::TruncI => src.is_integer() && dst.is_integer() && dst.bit_width() < src.bit_width(),
        CastOp::SIToFP | CastOp::UIToFP => src.is_integer() && dst.is_float(),
        CastOp::FPToSI => src.is_float() && dst.is_integer(),
        CastOp::Bitcast => src.bit_width() == dst.bit_width() && src != dst,
    };
    if ok {
        Ok(())
    } else {
        Err(VerifyError::structure(
            op,
            format!("invalid cast {from} -> {to}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::func::FuncBuilder;
    use crate::ir::ops::BinaryOp;

    #[test]
    fn rejects_mismatched_binary_operands() {
        let mut b = FuncBuilder::new("k", &[]);
        let lhs = b.const_i32(1);
        let rhs = b.const_i64(2);
        b.binary(BinaryOp::AddI, lhs, rhs);
        b.ret();
        let func = b.finish().unwrap();
        let err = verify_func(&func).unwrap_err();
        assert!(err.to_string().contains("type mismatch"), "{err}");
    }

    #[test]
    fn rejects_missing_return() {
        let mut b = FuncBuilder::new("k", &[]);
        b.const_i32(1);
        let func = b.finish().unwrap();
        assert!(verify_func(&func).is_err());
    }
}
