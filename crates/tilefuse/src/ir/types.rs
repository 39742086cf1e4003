use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar element types of the tile IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    I1,
    I8,
    I16,
    I32,
    I64,
    F16,
    Bf16,
    F32,
    F64,
}

impl ScalarType {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            ScalarType::F16 | ScalarType::Bf16 | ScalarType::F32 | ScalarType::F64
        )
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    pub fn bit_width(self) -> u32 {
        match self {
            ScalarType::I1 => 1,
            ScalarType::I8 => 8,
            ScalarType::I16 | ScalarType::F16 | ScalarType::Bf16 => 16,
            ScalarType::I32 | ScalarType::F32 => 32,
            ScalarType::I64 | ScalarType::F64 => 64,
        }
    }

    /// Significand precision including the implicit bit. Zero for integers.
    pub fn mantissa_width(self) -> u32 {
        match self {
            ScalarType::Bf16 => 8,
            ScalarType::F16 => 11,
            ScalarType::F32 => 24,
            ScalarType::F64 => 53,
            _ => 0,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            ScalarType::I1 | ScalarType::I8 => 1,
            other => (other.bit_width() / 8) as usize,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::I1 => "i1",
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F16 => "f16",
            ScalarType::Bf16 => "bf16",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ranked tensor type. A rank-0 tensor is distinct from a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub shape: Vec<i64>,
    pub elem: ScalarType,
}

impl TensorType {
    pub fn new(shape: &[i64], elem: ScalarType) -> Self {
        Self {
            shape: shape.to_vec(),
            elem,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tensor<")?;
        for dim in &self.shape {
            write!(f, "{dim}x")?;
        }
        write!(f, "{}>", self.elem)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Scalar(ScalarType),
    Tensor(TensorType),
    /// Global memory pointer to scalars.
    Ptr(ScalarType),
    /// Block pointer addressing a tensor tile.
    BlockPtr(TensorType),
}

impl Type {
    pub fn tensor(shape: &[i64], elem: ScalarType) -> Type {
        Type::Tensor(TensorType::new(shape, elem))
    }

    /// Element type of scalars and tensors, pointee element type of pointers.
    pub fn element_type(&self) -> ScalarType {
        match self {
            Type::Scalar(elem) | Type::Ptr(elem) => *elem,
            Type::Tensor(tensor) | Type::BlockPtr(tensor) => tensor.elem,
        }
    }

    /// Tensor shape; empty for scalars and plain pointers.
    pub fn shape(&self) -> &[i64] {
        match self {
            Type::Tensor(tensor) | Type::BlockPtr(tensor) => &tensor.shape,
            Type::Scalar(_) | Type::Ptr(_) => &[],
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Type::Tensor(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Scalar(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_) | Type::BlockPtr(_))
    }

    /// Same shape with a different element type.
    pub fn with_element(&self, elem: ScalarType) -> Type {
        match self {
            Type::Scalar(_) => Type::Scalar(elem),
            Type::Tensor(tensor) => Type::tensor(&tensor.shape, elem),
            Type::Ptr(_) => Type::Ptr(elem),
            Type::BlockPtr(tensor) => Type::BlockPtr(TensorType::new(&tensor.shape, elem)),
        }
    }

    /// Value type obtained by loading through this pointer type.
    pub fn pointee(&self) -> Option<Type> {
        match self {
            Type::Ptr(elem) => Some(Type::Scalar(*elem)),
            Type::BlockPtr(tensor) => Some(Type::Tensor(tensor.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(elem) => write!(f, "{elem}"),
            Type::Tensor(tensor) => write!(f, "{tensor}"),
            Type::Ptr(elem) => write!(f, "!tt.ptr<{elem}>"),
            Type::BlockPtr(tensor) => write!(f, "!tt.ptr<{tensor}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_display_matches_mlir_spelling() {
        assert_eq!(Type::tensor(&[64, 32], ScalarType::F32).to_string(), "tensor<64x32xf32>");
        assert_eq!(Type::tensor(&[], ScalarType::Bf16).to_string(), "tensor<bf16>");
        assert_eq!(Type::Ptr(ScalarType::I8).to_string(), "!tt.ptr<i8>");
        assert_eq!(
            Type::BlockPtr(TensorType::new(&[16], ScalarType::F16)).to_string(),
            "!tt.ptr<tensor<16xf16>>"
        );
    }
}
