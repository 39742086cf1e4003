use std::collections::{HashMap, HashSet};

use crate::ir::func::Func;
use crate::ir::ops::{BinaryOp, Constant, OpKind, Operation, ValueId};

use super::{FunctionPass, PassResult};

/// Folds operations that forward one of their operands unchanged.
///
/// Rewrites uses only; the folded operations become dead and are removed by
/// [`super::DeadCodeEliminationPass`].
#[derive(Default)]
pub struct CanonicalizePass;

impl CanonicalizePass {
    const NAME: &'static str = "canonicalize";
}

fn int_constants(func: &Func) -> HashMap<ValueId, i64> {
    let mut constants = HashMap::new();
    func.body.walk(&mut |op| {
        if let (OpKind::Constant(Constant::Int(value)), Some(result)) = (&op.kind, op.result()) {
            constants.insert(result, *value);
        }
    });
    constants
}

fn used_values(func: &Func) -> HashSet<ValueId> {
    let mut used = HashSet::new();
    func.body.walk(&mut |op| used.extend(op.operands.iter().copied()));
    used
}

fn forwarded_operand(
    func: &Func,
    op: &Operation,
    constants: &HashMap<ValueId, i64>,
) -> Option<ValueId> {
    let result = op.result()?;
    let is_const = |value: ValueId, expected: i64| constants.get(&value) == Some(&expected);
    match (&op.kind, op.operands.as_slice()) {
        (OpKind::Cast(_) | OpKind::Broadcast, [operand]) => {
            (func.value_type(*operand) == func.value_type(result)).then_some(*operand)
        }
        (OpKind::Advance, [ptr, offsets @ ..]) => offsets
            .iter()
            .all(|offset| is_const(*offset, 0))
            .then_some(*ptr),
        (OpKind::AddPtr, [ptr, offset]) => is_const(*offset, 0).then_some(*ptr),
        (OpKind::Select, [cond, on_true, on_false]) => {
            if on_true == on_false {
                return Some(*on_true);
            }
            let is_scalar_cond = func.value_type(*cond).is_some_and(|ty| ty.is_scalar());
            match constants.get(cond) {
                Some(value) if is_scalar_cond => {
                    Some(if *value != 0 { *on_true } else { *on_false })
                }
                _ => None,
            }
        }
        (OpKind::Binary(binary), [lhs, rhs]) => {
            let (lhs, rhs) = (*lhs, *rhs);
            match binary {
                BinaryOp::AddI | BinaryOp::OrI | BinaryOp::XOrI => {
                    if is_const(rhs, 0) {
                        Some(lhs)
                    } else if is_const(lhs, 0) {
                        Some(rhs)
                    } else {
                        None
                    }
                }
                BinaryOp::SubI => is_const(rhs, 0).then_some(lhs),
                BinaryOp::MulI => {
                    if is_const(rhs, 1) {
                        Some(lhs)
                    } else if is_const(lhs, 1) {
                        Some(rhs)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }
        _ => None,
    }
}

impl FunctionPass for CanonicalizePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, func: &mut Func) -> PassResult {
        let constants = int_constants(func);
        let used = used_values(func);

        let mut replacements = Vec::new();
        func.body.walk(&mut |op| {
            if let (Some(result), Some(forwarded)) =
                (op.result(), forwarded_operand(func, op, &constants))
            {
                if used.contains(&result) && result != forwarded {
                    replacements.push((result, forwarded));
                }
            }
        });

        for (from, to) in &replacements {
            func.body.replace_all_uses(*from, *to);
        }

        PassResult {
            changed: !replacements.is_empty(),
            iterations: 1,
            rewrites_applied: replacements.len(),
            erased_ops: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::func::FuncBuilder;
    use crate::ir::passes::DeadCodeEliminationPass;
    use crate::ir::types::{ScalarType, TensorType, Type};

    #[test]
    fn zero_advance_is_folded_away() {
        let ptr_ty = Type::Ptr(ScalarType::F32);
        let mut b = FuncBuilder::new("k", &[ptr_ty]);
        let base = b.arg(0);
        let one = b.const_i64(1);
        let zero = b.const_i32(0);
        let block = b.make_tensor_ptr(base, &[one], &[one], &[zero], &[16], &[0]);
        let advanced = b.advance(block, &[zero]);
        let loaded = b.load(advanced, &[], None);
        b.store(block, loaded, &[]);
        b.ret();
        let mut func = b.finish().unwrap();

        let result = CanonicalizePass.run(&mut func);
        assert!(result.changed);
        DeadCodeEliminationPass.run(&mut func);
        assert!(func.ops_named("tt.advance").is_empty());
        assert_eq!(
            func.value_type(block),
            Some(&Type::BlockPtr(TensorType::new(&[16], ScalarType::F32)))
        );
    }
}
