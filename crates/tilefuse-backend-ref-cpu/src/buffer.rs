use half::bf16;
use tilefuse::ir::ScalarType;

use crate::numeric::{round_float, wrap_int};

/// Element storage shared by host buffers and interpreter tiles.
///
/// Floats of every width are held as `f64` already rounded to their element
/// type; integers as `i64` already wrapped to their width.
#[derive(Debug, Clone, PartialEq)]
pub enum Elems {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl Elems {
    pub fn zeros(elem: ScalarType, len: usize) -> Self {
        if elem.is_float() {
            Elems::Float(vec![0.0; len])
        } else {
            Elems::Int(vec![0; len])
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Elems::Int(values) => values.len(),
            Elems::Float(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Scalar {
        match self {
            Elems::Int(values) => Scalar::Int(values[index]),
            Elems::Float(values) => Scalar::Float(values[index]),
        }
    }

    /// Writes `value` converted to the storage kind and rounded to `elem`.
    pub fn set(&mut self, elem: ScalarType, index: usize, value: Scalar) {
        match self {
            Elems::Int(values) => values[index] = wrap_int(elem, value.as_i64()),
            Elems::Float(values) => values[index] = round_float(elem, value.as_f64()),
        }
    }
}

/// One element read out of a tile or buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn as_i64(self) -> i64 {
        match self {
            Scalar::Int(value) => value,
            Scalar::Float(value) => value as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(value) => value as f64,
            Scalar::Float(value) => value,
        }
    }
}

/// A kernel argument living in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBuffer {
    elem: ScalarType,
    data: Elems,
}

impl HostBuffer {
    pub fn zeros(elem: ScalarType, len: usize) -> Self {
        Self {
            elem,
            data: Elems::zeros(elem, len),
        }
    }

    pub fn from_f32(values: &[f32]) -> Self {
        Self {
            elem: ScalarType::F32,
            data: Elems::Float(values.iter().map(|v| f64::from(*v)).collect()),
        }
    }

    pub fn from_f64(values: &[f64]) -> Self {
        Self {
            elem: ScalarType::F64,
            data: Elems::Float(values.to_vec()),
        }
    }

    pub fn from_bf16(values: &[bf16]) -> Self {
        Self {
            elem: ScalarType::Bf16,
            data: Elems::Float(values.iter().map(|v| v.to_f64()).collect()),
        }
    }

    pub fn from_i32(values: &[i32]) -> Self {
        Self {
            elem: ScalarType::I32,
            data: Elems::Int(values.iter().map(|v| i64::from(*v)).collect()),
        }
    }

    pub fn from_i16(values: &[i16]) -> Self {
        Self {
            elem: ScalarType::I16,
            data: Elems::Int(values.iter().map(|v| i64::from(*v)).collect()),
        }
    }

    pub fn from_i8(values: &[i8]) -> Self {
        Self {
            elem: ScalarType::I8,
            data: Elems::Int(values.iter().map(|v| i64::from(*v)).collect()),
        }
    }

    pub fn elem(&self) -> ScalarType {
        self.elem
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Scalar {
        self.data.get(index)
    }

    pub fn set(&mut self, index: usize, value: Scalar) {
        self.data.set(self.elem, index, value);
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.to_f64_vec().into_iter().map(|v| v as f32).collect()
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.data {
            Elems::Int(values) => values.iter().map(|v| *v as f64).collect(),
            Elems::Float(values) => values.clone(),
        }
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        match &self.data {
            Elems::Int(values) => values.clone(),
            Elems::Float(values) => values.iter().map(|v| *v as i64).collect(),
        }
    }
}
