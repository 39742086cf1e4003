//! Translation of fusion graph nodes into tile-IR values.

pub mod device_functions;
mod elementwise;
mod reduce;
mod scope;
mod tiled;
pub mod types;

pub use elementwise::emit_elementwise;
pub use reduce::emit_reduce;
pub use scope::{
    emit_broadcast, emit_constant, emit_parameter_load, emit_scope, DimProperties, EmitContext,
    ValueEnv,
};
pub use tiled::emit_tiled_scope;
