use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::hlo::NodeId;

/// Operand role of a tiled matmul fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Lhs,
    Rhs,
    Meta,
    Output,
}

impl Scope {
    pub fn name(self) -> &'static str {
        match self {
            Scope::Lhs => "LHS",
            Scope::Rhs => "RHS",
            Scope::Meta => "META",
            Scope::Output => "OUTPUT",
        }
    }
}

/// One physical fragment of a logical dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterationSpecFragment {
    pub stride: i64,
    /// Logical element count of the fragment before slicing.
    pub count: i64,
    #[serde(default)]
    pub slice_start: i64,
    pub sliced_count: i64,
    #[serde(default)]
    pub subfragments: Vec<i64>,
}

impl IterationSpecFragment {
    pub fn new(stride: i64, count: i64) -> Self {
        Self {
            stride,
            count,
            slice_start: 0,
            sliced_count: count,
            subfragments: vec![count],
        }
    }

    pub fn sliced(mut self, slice_start: i64, sliced_count: i64) -> Self {
        self.slice_start = slice_start;
        self.sliced_count = sliced_count;
        self
    }
}

/// Fragments of one logical dimension, most minor first.
pub type DimIterationSpec = SmallVec<[IterationSpecFragment; 2]>;

/// Contiguous single-fragment spec.
pub fn contiguous(stride: i64, count: i64) -> DimIterationSpec {
    smallvec![IterationSpecFragment::new(stride, count)]
}

/// Specs of every dimension of a dense row-major array.
pub fn row_major_specs(dims: &[i64]) -> Vec<DimIterationSpec> {
    let mut stride = 1;
    let mut specs = vec![DimIterationSpec::new(); dims.len()];
    for (index, &count) in dims.iter().enumerate().rev() {
        specs[index] = contiguous(stride, count);
        stride *= count;
    }
    specs
}

/// Per (scope, node, logical dimension) iteration specs of a tiled fusion.
///
/// Produced by the fusion analysis. A missing entry means the dimension is not
/// iterated for that node, typically because the node is broadcast along it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TritonFusionAnalysis {
    specs: HashMap<Scope, HashMap<NodeId, BTreeMap<usize, DimIterationSpec>>>,
    parameters: BTreeMap<Scope, BTreeSet<NodeId>>,
}

impl TritonFusionAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter_spec(&self, scope: Scope, node: NodeId, dim: usize) -> Option<&DimIterationSpec> {
        self.specs
            .get(&scope)
            .and_then(|nodes| nodes.get(&node))
            .and_then(|dims| dims.get(&dim))
    }

    pub fn set_iter_spec(&mut self, scope: Scope, node: NodeId, dim: usize, spec: DimIterationSpec) {
        self.specs
            .entry(scope)
            .or_default()
            .entry(node)
            .or_default()
            .insert(dim, spec);
    }

    /// Records the spec of every logical dimension of `node`, indexed in order.
    pub fn set_node_specs(&mut self, scope: Scope, node: NodeId, specs: Vec<DimIterationSpec>) {
        for (dim, spec) in specs.into_iter().enumerate() {
            self.set_iter_spec(scope, node, dim, spec);
        }
    }

    /// Records specs only for the listed dimensions.
    pub fn set_sparse_node_specs(
        &mut self,
        scope: Scope,
        node: NodeId,
        specs: impl IntoIterator<Item = (usize, DimIterationSpec)>,
    ) {
        for (dim, spec) in specs {
            self.set_iter_spec(scope, node, dim, spec);
        }
    }

    pub fn add_scope_parameter(&mut self, scope: Scope, parameter: NodeId) {
        self.parameters.entry(scope).or_default().insert(parameter);
    }

    /// Parameters read by `scope`, ordered by node id.
    pub fn scope_parameters(&self, scope: Scope) -> Vec<NodeId> {
        self.parameters
            .get(&scope)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.parameters.contains_key(&scope) || self.specs.contains_key(&scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_specs_accumulate_strides() {
        let specs = row_major_specs(&[3, 4, 5]);
        assert_eq!(specs[2][0].stride, 1);
        assert_eq!(specs[1][0].stride, 5);
        assert_eq!(specs[0][0].stride, 20);
        assert_eq!(specs[0][0].count, 3);
    }

    #[test]
    fn missing_specs_read_as_none() {
        let mut analysis = TritonFusionAnalysis::new();
        analysis.set_sparse_node_specs(Scope::Output, NodeId(3), [(1, contiguous(1, 64))]);
        assert!(analysis.iter_spec(Scope::Output, NodeId(3), 0).is_none());
        assert_eq!(
            analysis.iter_spec(Scope::Output, NodeId(3), 1).map(|s| s[0].count),
            Some(64)
        );
    }
}
