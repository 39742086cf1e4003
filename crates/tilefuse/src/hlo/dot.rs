use serde::{Deserialize, Serialize};

use super::types::PrimitiveType;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DotDimensionNumbers {
    #[serde(default)]
    pub lhs_batch_dimensions: Vec<i64>,
    #[serde(default)]
    pub rhs_batch_dimensions: Vec<i64>,
    pub lhs_contracting_dimensions: Vec<i64>,
    pub rhs_contracting_dimensions: Vec<i64>,
}

/// Requested operand precision of a dot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Default,
    High,
    Highest,
}

/// Explicit dot algorithm. `Unset` defers to operand precision and debug options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DotAlgorithm {
    #[default]
    Unset,
    F16F16F32,
    Bf16Bf16F32,
    Bf16Bf16F32X3,
    Bf16Bf16F32X6,
    Tf32Tf32F32,
    Tf32Tf32F32X3,
    F32F32F32,
    F64F64F64,
}

impl DotAlgorithm {
    /// Accumulator type fixed by the algorithm, `None` when unset.
    pub fn accumulator_type(self) -> Option<PrimitiveType> {
        match self {
            DotAlgorithm::Unset => None,
            DotAlgorithm::F64F64F64 => Some(PrimitiveType::F64),
            _ => Some(PrimitiveType::F32),
        }
    }

    pub fn has_tf32_input(self) -> bool {
        matches!(
            self,
            DotAlgorithm::Tf32Tf32F32 | DotAlgorithm::Tf32Tf32F32X3
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecisionConfig {
    #[serde(default)]
    pub operand_precision: Vec<Precision>,
    #[serde(default)]
    pub algorithm: DotAlgorithm,
}

/// 2:4 structured sparsity of the LHS operand along its contracting dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SparsityDescriptor {
    pub dimension: i64,
    pub n: i64,
    pub m: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DotAttrs {
    pub dimension_numbers: DotDimensionNumbers,
    #[serde(default)]
    pub precision: PrecisionConfig,
    /// Present when the LHS is stored compressed and a metadata operand follows RHS.
    #[serde(default)]
    pub sparsity: Option<SparsityDescriptor>,
}

impl DotAttrs {
    pub fn new(lhs_contracting: i64, rhs_contracting: i64) -> Self {
        Self {
            dimension_numbers: DotDimensionNumbers {
                lhs_contracting_dimensions: vec![lhs_contracting],
                rhs_contracting_dimensions: vec![rhs_contracting],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_batch(mut self, lhs_batch: &[i64], rhs_batch: &[i64]) -> Self {
        self.dimension_numbers.lhs_batch_dimensions = lhs_batch.to_vec();
        self.dimension_numbers.rhs_batch_dimensions = rhs_batch.to_vec();
        self
    }

    pub fn with_algorithm(mut self, algorithm: DotAlgorithm) -> Self {
        self.precision.algorithm = algorithm;
        self
    }

    pub fn is_sparse(&self) -> bool {
        self.sparsity.is_some()
    }
}

/// Dimensions of `rank` that are neither batch nor contracting, in ascending order.
pub fn non_contracting_dims(rank: usize, batch: &[i64], contracting: &[i64]) -> Vec<i64> {
    (0..rank as i64)
        .filter(|dim| !batch.contains(dim) && !contracting.contains(dim))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_contracting_dims_skip_batch_and_contracting() {
        assert_eq!(non_contracting_dims(3, &[0], &[2]), vec![1]);
        assert_eq!(non_contracting_dims(2, &[], &[0]), vec![1]);
    }
}
