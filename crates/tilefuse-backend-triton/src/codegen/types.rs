use tilefuse::hlo::PrimitiveType;
use tilefuse::ir::{CastOp, FuncBuilder, ScalarType, Type, ValueId};

use crate::error::{EmitError, EmitResult};

/// Kernel element type of a graph element type.
pub fn triton_type(ty: PrimitiveType) -> EmitResult<ScalarType> {
    match ty {
        PrimitiveType::F64 => Ok(ScalarType::F64),
        PrimitiveType::F32 => Ok(ScalarType::F32),
        PrimitiveType::F16 => Ok(ScalarType::F16),
        PrimitiveType::Bf16 => Ok(ScalarType::Bf16),
        PrimitiveType::S64 => Ok(ScalarType::I64),
        PrimitiveType::S32 => Ok(ScalarType::I32),
        PrimitiveType::S16 => Ok(ScalarType::I16),
        PrimitiveType::Pred => Ok(ScalarType::I1),
        PrimitiveType::S8 => Ok(ScalarType::I8),
        other => Err(EmitError::internal(format!(
            "This type is not supported yet: {other:?}"
        ))),
    }
}

/// Element type used in memory: predicates are stored as bytes.
pub fn storage_type(elem: ScalarType) -> ScalarType {
    if elem == ScalarType::I1 {
        ScalarType::I8
    } else {
        elem
    }
}

/// Pointer element type of a kernel argument. Unsigned 16-bit data is passed
/// through as `i16`.
pub fn argument_type(ty: PrimitiveType) -> EmitResult<ScalarType> {
    let elem = match ty {
        PrimitiveType::U16 => ScalarType::I16,
        other => triton_type(other)?,
    };
    Ok(storage_type(elem))
}

/// Element type of a node's value.
pub fn node_type(ty: Option<PrimitiveType>) -> EmitResult<ScalarType> {
    ty.ok_or_else(|| EmitError::internal("node has no element type"))
        .and_then(triton_type)
}

/// `ty` shaped like `value` (scalar or tensor).
fn like(b: &FuncBuilder, value: ValueId, elem: ScalarType) -> Type {
    b.ty(value).with_element(elem)
}

/// Zero constant with the type of `value`.
pub fn zeros_like(b: &mut FuncBuilder, value: ValueId) -> ValueId {
    let ty = b.ty(value).clone();
    b.int_const(&ty, 0)
}

/// One constant with the type of `value`.
pub fn ones_like(b: &mut FuncBuilder, value: ValueId) -> ValueId {
    let ty = b.ty(value).clone();
    b.int_const(&ty, 1)
}

/// Converts `value` to `dst`, choosing the conversion by kind and width.
pub fn cast(b: &mut FuncBuilder, value: ValueId, dst: ScalarType) -> EmitResult<ValueId> {
    if b.ty(value).is_pointer() {
        return Err(EmitError::internal("cannot cast a pointer value"));
    }
    let src = b.elem(value);
    if src == dst {
        return Ok(value);
    }

    // bf16 conversions go through f32, except for the direct i8 -> bf16 path.
    if src == ScalarType::Bf16 {
        let widened = b.cast(CastOp::ExtF, value, ScalarType::F32);
        return cast(b, widened, dst);
    }
    if dst == ScalarType::Bf16 && src != ScalarType::I8 {
        let as_f32 = cast(b, value, ScalarType::F32)?;
        return Ok(b.cast(CastOp::TruncF, as_f32, ScalarType::Bf16));
    }

    let result = match (src.is_float(), dst.is_float()) {
        (true, true) => {
            if src.mantissa_width() > dst.mantissa_width() {
                b.cast(CastOp::TruncF, value, dst)
            } else {
                b.cast(CastOp::ExtF, value, dst)
            }
        }
        (false, false) => {
            if src.bit_width() < dst.bit_width() {
                let op = if src == ScalarType::I1 {
                    CastOp::ExtUI
                } else {
                    CastOp::ExtSI
                };
                b.cast(op, value, dst)
            } else {
                b.cast(CastOp::TruncI, value, dst)
            }
        }
        (false, true) => {
            let op = if src == ScalarType::I1 {
                CastOp::UIToFP
            } else {
                CastOp::SIToFP
            };
            b.cast(op, value, dst)
        }
        (true, false) => {
            if dst == ScalarType::I1 {
                let zero = zeros_like(b, value);
                b.cmpf(tilefuse::ir::CmpFPredicate::Une, value, zero)
            } else {
                b.cast(CastOp::FPToSI, value, dst)
            }
        }
    };
    Ok(result)
}

/// Constant `value` of element type `elem` shaped like `shape_of`.
pub fn constant_like(
    b: &mut FuncBuilder,
    shape_of: ValueId,
    elem: ScalarType,
    value: f64,
) -> ValueId {
    let ty = like(b, shape_of, elem);
    b.float_const(&ty, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilefuse::ir::{verify_func, OpKind};

    fn cast_ops(src: ScalarType, dst: ScalarType) -> Vec<&'static str> {
        let mut b = FuncBuilder::new("k", &[]);
        let ty = Type::tensor(&[4], src);
        let value = b.int_const(&ty, 1);
        let _ = cast(&mut b, value, dst).unwrap();
        b.ret();
        let func = b.finish().unwrap();
        verify_func(&func).unwrap();
        func.body
            .ops
            .iter()
            .filter(|op| !matches!(op.kind, OpKind::Constant(_) | OpKind::Return))
            .map(|op| op.kind.name())
            .collect()
    }

    #[test]
    fn casts_follow_the_conversion_table() {
        assert!(cast_ops(ScalarType::F32, ScalarType::F32).is_empty());
        assert_eq!(cast_ops(ScalarType::Bf16, ScalarType::F32), vec!["arith.extf"]);
        assert_eq!(
            cast_ops(ScalarType::Bf16, ScalarType::F16),
            vec!["arith.extf", "arith.truncf"]
        );
        assert_eq!(
            cast_ops(ScalarType::I32, ScalarType::Bf16),
            vec!["arith.sitofp", "arith.truncf"]
        );
        assert_eq!(cast_ops(ScalarType::I8, ScalarType::Bf16), vec!["arith.sitofp"]);
        assert_eq!(cast_ops(ScalarType::F16, ScalarType::F64), vec!["arith.extf"]);
        assert_eq!(cast_ops(ScalarType::F64, ScalarType::F32), vec!["arith.truncf"]);
        assert_eq!(cast_ops(ScalarType::I1, ScalarType::I32), vec!["arith.extui"]);
        assert_eq!(cast_ops(ScalarType::I8, ScalarType::I64), vec!["arith.extsi"]);
        assert_eq!(cast_ops(ScalarType::I64, ScalarType::I16), vec!["arith.trunci"]);
        assert_eq!(cast_ops(ScalarType::I1, ScalarType::F32), vec!["arith.uitofp"]);
        assert_eq!(cast_ops(ScalarType::I16, ScalarType::F32), vec!["arith.sitofp"]);
        assert_eq!(cast_ops(ScalarType::F32, ScalarType::I1), vec!["arith.cmpf"]);
        assert_eq!(cast_ops(ScalarType::F16, ScalarType::I32), vec!["arith.fptosi"]);
    }

    #[test]
    fn graph_types_map_to_kernel_types() {
        assert_eq!(triton_type(PrimitiveType::Pred).unwrap(), ScalarType::I1);
        assert_eq!(storage_type(ScalarType::I1), ScalarType::I8);
        assert_eq!(argument_type(PrimitiveType::Pred).unwrap(), ScalarType::I8);
        assert_eq!(argument_type(PrimitiveType::U16).unwrap(), ScalarType::I16);
        assert!(triton_type(PrimitiveType::U16).unwrap_err().is_internal());
    }
}
