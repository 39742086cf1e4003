use tilefuse::config::{DeviceDescription, TritonGemmConfig};
use tilefuse::ir::ProgramIdDim;

use super::dims::MatMulDims;
use crate::error::EmitResult;
use crate::launch::LaunchDimensions;
use crate::ret_check;

/// Largest grid extent along y and z.
const MAX_GRID_YZ: i64 = 65536;

/// Launch grid of a matmul kernel and the program id dimensions that index it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulLaunchConfig {
    pub launch_dims: LaunchDimensions,
    pub batch_program_id_dim: ProgramIdDim,
    pub noncontracting_program_id_dim: ProgramIdDim,
    pub grid_m: i64,
    pub grid_n: i64,
}

impl MatMulLaunchConfig {
    /// `batch_size` is the dot's batch extent (or the non-contracting split), 1 otherwise.
    pub fn new(
        config: &TritonGemmConfig,
        dims: &MatMulDims,
        batch_size: i64,
        device: &DeviceDescription,
    ) -> EmitResult<Self> {
        let grid_m = (dims.m + config.block_m - 1) / config.block_m;
        let grid_n = (dims.n + config.block_n - 1) / config.block_n;
        let noncontracting_programs = grid_m * grid_n;
        ret_check!(
            batch_size * noncontracting_programs < MAX_GRID_YZ * MAX_GRID_YZ,
            "grid of {batch_size}x{noncontracting_programs} programs is too large"
        );

        let threads = config.num_warps * device.threads_per_warp;
        let (block_counts, batch_dim, noncontracting_dim) = if batch_size >= MAX_GRID_YZ {
            // Large batches go on x, the only axis without the 65535 limit.
            (
                [batch_size, noncontracting_programs, config.split_k],
                ProgramIdDim::X,
                ProgramIdDim::Y,
            )
        } else {
            (
                [noncontracting_programs, batch_size, config.split_k],
                ProgramIdDim::Y,
                ProgramIdDim::X,
            )
        };

        Ok(Self {
            launch_dims: LaunchDimensions::new(block_counts, threads),
            batch_program_id_dim: batch_dim,
            noncontracting_program_id_dim: noncontracting_dim,
            grid_m,
            grid_n,
        })
    }
}
