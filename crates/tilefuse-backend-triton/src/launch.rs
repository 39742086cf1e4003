use serde::{Deserialize, Serialize};

/// Grid and block shape a generated kernel is launched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDimensions {
    /// Program counts along x, y and z.
    pub block_counts: [i64; 3],
    pub thread_counts_per_block: i64,
}

impl LaunchDimensions {
    pub fn new(block_counts: [i64; 3], thread_counts_per_block: i64) -> Self {
        Self {
            block_counts,
            thread_counts_per_block,
        }
    }

    pub fn num_programs(&self) -> i64 {
        self.block_counts.iter().product()
    }
}

impl std::fmt::Display for LaunchDimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [x, y, z] = self.block_counts;
        write!(
            f,
            "blocks: {{{x}, {y}, {z}}}, threads/block: {}",
            self.thread_counts_per_block
        )
    }
}
