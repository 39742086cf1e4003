//! Host interpreter for tile-IR kernels.
//!
//! Executes every program instance of a launch grid sequentially against
//! host buffers, with the rounding and wrapping behaviour of the declared
//! element types. Used to check generated kernels numerically.

mod buffer;
mod interpreter;
mod numeric;

pub use buffer::{Elems, HostBuffer, Scalar};
pub use interpreter::{InterpError, InterpResult, Interpreter};
pub use numeric::round_float;
