//! Shared data model for the tilefuse kernel generator.
//!
//! - [`hlo`]: the fusion computation graph.
//! - [`analysis`]: iteration specs and tilings computed for a fusion.
//! - [`ir`]: the tile IR kernels are emitted into.
//! - [`config`]: tiling configuration, device descriptions and debug options.

pub mod analysis;
pub mod config;
pub mod hlo;
pub mod ir;
