use serde::{Deserialize, Serialize};

/// Element types understood by the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U16,
    F16,
    Bf16,
    F32,
    F64,
}

impl PrimitiveType {
    /// Returns `true` for the floating-point element types.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            PrimitiveType::F16 | PrimitiveType::Bf16 | PrimitiveType::F32 | PrimitiveType::F64
        )
    }

    /// Returns `true` for signed and unsigned integers (predicates excluded).
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            PrimitiveType::S8
                | PrimitiveType::S16
                | PrimitiveType::S32
                | PrimitiveType::S64
                | PrimitiveType::U16
        )
    }

    pub fn bit_width(self) -> u32 {
        match self {
            PrimitiveType::Pred => 1,
            PrimitiveType::S8 => 8,
            PrimitiveType::S16 | PrimitiveType::U16 | PrimitiveType::F16 | PrimitiveType::Bf16 => {
                16
            }
            PrimitiveType::S32 | PrimitiveType::F32 => 32,
            PrimitiveType::S64 | PrimitiveType::F64 => 64,
        }
    }

    /// Size of one element in memory. Predicates occupy a full byte.
    pub fn size_in_bytes(self) -> usize {
        match self {
            PrimitiveType::Pred | PrimitiveType::S8 => 1,
            other => (other.bit_width() / 8) as usize,
        }
    }
}

/// Array shape with a physical layout, or a tuple of shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    Array(ArrayShape),
    Tuple { elements: Vec<Shape> },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayShape {
    pub element_type: PrimitiveType,
    pub dims: Vec<i64>,
    /// Physical dimension order, most minor first.
    pub minor_to_major: Vec<i64>,
}

impl ArrayShape {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> i64 {
        self.dims.iter().product()
    }

    /// Row-major layouts list dimensions in descending order, most minor first.
    pub fn has_canonical_layout(&self) -> bool {
        self.minor_to_major
            .iter()
            .copied()
            .eq((0..self.rank() as i64).rev())
    }
}

impl Shape {
    /// Array shape with the default row-major layout.
    pub fn array(element_type: PrimitiveType, dims: &[i64]) -> Self {
        Shape::Array(ArrayShape {
            element_type,
            dims: dims.to_vec(),
            minor_to_major: (0..dims.len() as i64).rev().collect(),
        })
    }

    pub fn with_layout(element_type: PrimitiveType, dims: &[i64], minor_to_major: &[i64]) -> Self {
        Shape::Array(ArrayShape {
            element_type,
            dims: dims.to_vec(),
            minor_to_major: minor_to_major.to_vec(),
        })
    }

    pub fn scalar(element_type: PrimitiveType) -> Self {
        Shape::array(element_type, &[])
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple { elements }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple { .. })
    }

    pub fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Shape::Array(array) => Some(array),
            Shape::Tuple { .. } => None,
        }
    }

    /// Element type of an array shape. Tuples report the type of their first leaf.
    pub fn element_type(&self) -> Option<PrimitiveType> {
        self.leaf_shapes().first().map(|leaf| leaf.element_type)
    }

    pub fn dims(&self) -> &[i64] {
        match self {
            Shape::Array(array) => &array.dims,
            Shape::Tuple { .. } => &[],
        }
    }

    pub fn rank(&self) -> usize {
        self.dims().len()
    }

    pub fn element_count(&self) -> i64 {
        match self {
            Shape::Array(array) => array.element_count(),
            Shape::Tuple { .. } => 0,
        }
    }

    /// Array leaves in depth-first order.
    pub fn leaf_shapes(&self) -> Vec<&ArrayShape> {
        let mut leaves = Vec::new();
        collect_leaves(self, &mut leaves);
        leaves
    }

    /// An array shape whose element count is one.
    pub fn is_effective_scalar(&self) -> bool {
        matches!(self, Shape::Array(array) if array.element_count() == 1)
    }
}

fn collect_leaves<'a>(shape: &'a Shape, out: &mut Vec<&'a ArrayShape>) {
    match shape {
        Shape::Array(array) => out.push(array),
        Shape::Tuple { elements } => {
            for element in elements {
                collect_leaves(element, out);
            }
        }
    }
}

/// Scalar literal value attached to constant nodes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Literal {
    pub fn as_i64(self) -> i64 {
        match self {
            Literal::Bool(value) => value as i64,
            Literal::Int(value) => value,
            Literal::Float(value) => value as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Literal::Bool(value) => {
                if value {
                    1.0
                } else {
                    0.0
                }
            }
            Literal::Int(value) => value as f64,
            Literal::Float(value) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_canonical() {
        let shape = Shape::array(PrimitiveType::F32, &[4, 8, 16]);
        let array = shape.as_array().unwrap();
        assert_eq!(array.minor_to_major, vec![2, 1, 0]);
        assert!(array.has_canonical_layout());

        let transposed = Shape::with_layout(PrimitiveType::F32, &[4, 8], &[0, 1]);
        assert!(!transposed.as_array().unwrap().has_canonical_layout());
    }

    #[test]
    fn tuple_leaves_are_flattened_in_order() {
        let shape = Shape::tuple(vec![
            Shape::array(PrimitiveType::F32, &[2]),
            Shape::tuple(vec![Shape::array(PrimitiveType::S32, &[3])]),
        ]);
        let leaves = shape.leaf_shapes();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[1].element_type, PrimitiveType::S32);
        assert_eq!(shape.element_type(), Some(PrimitiveType::F32));
    }
}
