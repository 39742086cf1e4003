use std::collections::HashSet;

use crate::ir::func::Func;
use crate::ir::ops::{Block, ValueId};

use super::{FunctionPass, PassResult};

/// Removes operations whose results are unused and which write no memory.
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

fn collect_uses(block: &Block, used: &mut HashSet<ValueId>) {
    block.walk(&mut |op| used.extend(op.operands.iter().copied()));
}

fn sweep(block: &mut Block, used: &HashSet<ValueId>) -> usize {
    let before = block.ops.len();
    block.ops.retain(|op| {
        op.kind.has_side_effects()
            || op.writes_memory()
            || op.results.iter().any(|result| used.contains(result))
    });
    let mut removed = before - block.ops.len();
    for op in &mut block.ops {
        for region in &mut op.regions {
            removed += sweep(region, used);
        }
    }
    removed
}

impl FunctionPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, func: &mut Func) -> PassResult {
        let mut stats = PassResult::default();
        loop {
            let mut used = HashSet::new();
            collect_uses(&func.body, &mut used);
            let removed = sweep(&mut func.body, &used);
            stats.iterations += 1;
            if removed == 0 {
                break;
            }
            stats.changed = true;
            stats.erased_ops += removed;
        }
        stats
    }
}
