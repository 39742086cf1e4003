//! Structural cleanups run on assembled kernels.

mod canonicalize;
mod cse;
mod dce;

pub use canonicalize::CanonicalizePass;
pub use cse::CommonSubexpressionEliminationPass;
pub use dce::DeadCodeEliminationPass;

use super::func::Func;

/// Result returned by a [`FunctionPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR.
    pub changed: bool,
    /// Number of fixed-point iterations executed.
    pub iterations: usize,
    pub rewrites_applied: usize,
    pub erased_ops: usize,
}

impl PassResult {
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_ops: self.erased_ops + other.erased_ops,
        }
    }
}

pub trait FunctionPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, func: &mut Func) -> PassResult;
}

const CLEANUP_MAX_ITERS: usize = 8;

/// Canonicalization, CSE and DCE repeated until nothing changes.
pub fn run_cleanup_pipeline(func: &mut Func) -> PassResult {
    let passes: [&dyn FunctionPass; 3] = [
        &CanonicalizePass,
        &CommonSubexpressionEliminationPass,
        &DeadCodeEliminationPass,
    ];
    let mut total = PassResult::default();
    for _ in 0..CLEANUP_MAX_ITERS {
        let mut round = PassResult::default();
        for pass in passes {
            let result = pass.run(func);
            tracing::trace!(
                pass = pass.name(),
                changed = result.changed,
                erased = result.erased_ops,
                "cleanup pass finished"
            );
            round = round.merge(result);
        }
        total = total.merge(round);
        total.iterations += 1;
        if !round.changed {
            break;
        }
    }
    total
}
