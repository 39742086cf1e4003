use std::collections::HashMap;

use once_cell::sync::Lazy;
use tilefuse::config::GpuComputeCapability;
use tilefuse::hlo::{Opcode, PrimitiveType};

/// Math library routine names, without vendor prefix or precision suffix.
static DEVICE_FUNCTIONS: Lazy<HashMap<Opcode, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (Opcode::Atan2, "atan2"),
        (Opcode::Cbrt, "cbrt"),
        (Opcode::Cos, "cos"),
        (Opcode::Exp, "exp"),
        (Opcode::Expm1, "expm1"),
        (Opcode::Log, "log"),
        (Opcode::Log1p, "log1p"),
        (Opcode::Power, "pow"),
        (Opcode::Remainder, "fmod"),
        (Opcode::Rsqrt, "rsqrt"),
        (Opcode::Sin, "sin"),
        (Opcode::Sqrt, "sqrt"),
        (Opcode::Tan, "tan"),
        (Opcode::Tanh, "tanh"),
    ])
});

/// Base routine name for `opcode`, if the math library implements it.
pub fn device_function_id(opcode: Opcode) -> Option<&'static str> {
    DEVICE_FUNCTIONS.get(&opcode).copied()
}

/// Target-specific symbol of the routine implementing `opcode` for `ty`.
///
/// Only `f32` and `f64` have library routines.
pub fn device_function_name(
    opcode: Opcode,
    ty: PrimitiveType,
    target: &GpuComputeCapability,
) -> Option<String> {
    let base = device_function_id(opcode)?;
    let (nv_suffix, amd_suffix) = match ty {
        PrimitiveType::F32 => ("f", "_f32"),
        PrimitiveType::F64 => ("", "_f64"),
        _ => return None,
    };
    Some(match target {
        GpuComputeCapability::Cuda { .. } => format!("__nv_{base}{nv_suffix}"),
        GpuComputeCapability::Rocm { .. } => format!("__ocml_{base}{amd_suffix}"),
    })
}
