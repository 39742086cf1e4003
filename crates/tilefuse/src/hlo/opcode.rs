use serde::{Deserialize, Serialize};

/// Closed set of node kinds a fusion computation may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Parameter,
    Constant,
    Tuple,
    Fusion,

    // Data movement. These never change tile contents.
    Copy,
    Bitcast,
    Transpose,
    Slice,
    Reshape,
    Pad,
    Broadcast,
    Concatenate,

    Reduce,
    Dot,

    // Elementwise.
    Convert,
    Abs,
    Not,
    Negate,
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    And,
    Or,
    Xor,
    Compare,
    Select,

    // Elementwise ops lowered to device math routines.
    Atan2,
    Cbrt,
    Cos,
    Exp,
    Expm1,
    Log,
    Log1p,
    Power,
    Remainder,
    Rsqrt,
    Sin,
    Sqrt,
    Tan,
    Tanh,

    // Present in graphs but never accepted by the kernel emitters.
    Iota,
    Gather,
    Sort,
}

impl Opcode {
    pub fn is_elementwise(self) -> bool {
        matches!(
            self,
            Opcode::Copy
                | Opcode::Convert
                | Opcode::Abs
                | Opcode::Not
                | Opcode::Negate
                | Opcode::Add
                | Opcode::Subtract
                | Opcode::Multiply
                | Opcode::Divide
                | Opcode::Maximum
                | Opcode::Minimum
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Compare
                | Opcode::Select
        ) || self.is_math_library_op()
    }

    /// Elementwise ops implemented by a device math library routine.
    pub fn is_math_library_op(self) -> bool {
        matches!(
            self,
            Opcode::Atan2
                | Opcode::Cbrt
                | Opcode::Cos
                | Opcode::Exp
                | Opcode::Expm1
                | Opcode::Log
                | Opcode::Log1p
                | Opcode::Power
                | Opcode::Remainder
                | Opcode::Rsqrt
                | Opcode::Sin
                | Opcode::Sqrt
                | Opcode::Tan
                | Opcode::Tanh
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Parameter => "parameter",
            Opcode::Constant => "constant",
            Opcode::Tuple => "tuple",
            Opcode::Fusion => "fusion",
            Opcode::Copy => "copy",
            Opcode::Bitcast => "bitcast",
            Opcode::Transpose => "transpose",
            Opcode::Slice => "slice",
            Opcode::Reshape => "reshape",
            Opcode::Pad => "pad",
            Opcode::Broadcast => "broadcast",
            Opcode::Concatenate => "concatenate",
            Opcode::Reduce => "reduce",
            Opcode::Dot => "dot",
            Opcode::Convert => "convert",
            Opcode::Abs => "abs",
            Opcode::Not => "not",
            Opcode::Negate => "negate",
            Opcode::Add => "add",
            Opcode::Subtract => "subtract",
            Opcode::Multiply => "multiply",
            Opcode::Divide => "divide",
            Opcode::Maximum => "maximum",
            Opcode::Minimum => "minimum",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Compare => "compare",
            Opcode::Select => "select",
            Opcode::Atan2 => "atan2",
            Opcode::Cbrt => "cbrt",
            Opcode::Cos => "cosine",
            Opcode::Exp => "exponential",
            Opcode::Expm1 => "exponential-minus-one",
            Opcode::Log => "log",
            Opcode::Log1p => "log-plus-one",
            Opcode::Power => "power",
            Opcode::Remainder => "remainder",
            Opcode::Rsqrt => "rsqrt",
            Opcode::Sin => "sine",
            Opcode::Sqrt => "sqrt",
            Opcode::Tan => "tan",
            Opcode::Tanh => "tanh",
            Opcode::Iota => "iota",
            Opcode::Gather => "gather",
            Opcode::Sort => "sort",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComparisonDirection {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}
