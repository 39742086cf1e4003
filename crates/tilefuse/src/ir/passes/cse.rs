use std::collections::HashMap;

use crate::ir::func::Func;
use crate::ir::ops::{Block, ValueId};

use super::{FunctionPass, PassResult};

/// Common-subexpression elimination for pure operations.
///
/// Keys every candidate by `(kind, operands, result types)` and replaces later
/// duplicates with the first occurrence. Values defined in an enclosing block
/// are visible inside nested regions, never the other way around.
#[derive(Default)]
pub struct CommonSubexpressionEliminationPass;

impl CommonSubexpressionEliminationPass {
    const NAME: &'static str = "cse";
}

struct Cse<'a> {
    types: &'a Func,
    substitutions: HashMap<ValueId, ValueId>,
    stats: PassResult,
}

impl Cse<'_> {
    fn block(&mut self, block: &mut Block, visible: &HashMap<String, Vec<ValueId>>) {
        let mut seen = visible.clone();
        let mut kept = Vec::with_capacity(block.ops.len());
        for mut op in block.ops.drain(..) {
            for operand in &mut op.operands {
                if let Some(replacement) = self.substitutions.get(operand) {
                    *operand = *replacement;
                }
            }
            for region in &mut op.regions {
                self.block(region, &seen);
            }
            if !op.kind.is_cse_candidate() || !op.regions.is_empty() {
                kept.push(op);
                continue;
            }
            let result_types = op
                .results
                .iter()
                .map(|r| self.types.value_type(*r))
                .collect::<Vec<_>>();
            let key = format!("{:?}|{:?}|{:?}", op.kind, op.operands, result_types);
            if let Some(existing) = seen.get(&key) {
                for (from, to) in op.results.iter().zip(existing) {
                    self.substitutions.insert(*from, *to);
                }
                self.stats.changed = true;
                self.stats.rewrites_applied += 1;
                self.stats.erased_ops += 1;
                continue;
            }
            seen.insert(key, op.results.clone());
            kept.push(op);
        }
        block.ops = kept;
    }
}

impl FunctionPass for CommonSubexpressionEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, func: &mut Func) -> PassResult {
        let mut body = std::mem::take(&mut func.body);
        let mut cse = Cse {
            types: func,
            substitutions: HashMap::new(),
            stats: PassResult {
                iterations: 1,
                ..Default::default()
            },
        };
        cse.block(&mut body, &HashMap::new());
        let stats = cse.stats;
        func.body = body;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::func::FuncBuilder;
    use crate::ir::ops::BinaryOp;

    #[test]
    fn duplicate_constants_and_arith_are_merged() {
        let mut b = FuncBuilder::new("k", &[]);
        let a = b.const_i32(3);
        let a2 = b.const_i32(3);
        let s1 = b.binary(BinaryOp::AddI, a, a);
        let s2 = b.binary(BinaryOp::AddI, a2, a2);
        let _ = b.binary(BinaryOp::MulI, s1, s2);
        b.ret();
        let mut func = b.finish().unwrap();

        let result = CommonSubexpressionEliminationPass.run(&mut func);
        assert!(result.changed);
        assert_eq!(func.ops_named("arith.constant").len(), 1);
        assert_eq!(func.ops_named("arith.addi").len(), 1);
        let mul = func.ops_named("arith.muli")[0];
        assert_eq!(mul.operands[0], mul.operands[1]);
    }
}
