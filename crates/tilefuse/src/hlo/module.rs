use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::dot::DotAttrs;
use super::opcode::{ComparisonDirection, Opcode};
use super::types::{Literal, PrimitiveType, Shape};

/// Identifier of a node, unique across every computation of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Opcode-specific payload of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeAttrs {
    #[default]
    None,
    Parameter {
        number: usize,
    },
    Constant {
        literal: Literal,
    },
    Broadcast {
        dimensions: Vec<i64>,
    },
    Transpose {
        permutation: Vec<i64>,
    },
    Concatenate {
        dimension: i64,
    },
    Compare {
        direction: ComparisonDirection,
    },
    Dot(DotAttrs),
    Reduce {
        dimensions: Vec<i64>,
        to_apply: ComputationId,
    },
    Fusion {
        called: ComputationId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub opcode: Opcode,
    pub operands: Vec<NodeId>,
    pub shape: Shape,
    #[serde(default)]
    pub attrs: NodeAttrs,
    pub parent: ComputationId,
}

impl Node {
    pub fn operand(&self, index: usize) -> Option<NodeId> {
        self.operands.get(index).copied()
    }

    pub fn element_type(&self) -> Option<PrimitiveType> {
        self.shape.element_type()
    }

    pub fn parameter_number(&self) -> Option<usize> {
        match self.attrs {
            NodeAttrs::Parameter { number } => Some(number),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<Literal> {
        match self.attrs {
            NodeAttrs::Constant { literal } => Some(literal),
            _ => None,
        }
    }

    pub fn dot_attrs(&self) -> Option<&DotAttrs> {
        match &self.attrs {
            NodeAttrs::Dot(attrs) => Some(attrs),
            _ => None,
        }
    }

    pub fn comparison_direction(&self) -> Option<ComparisonDirection> {
        match self.attrs {
            NodeAttrs::Compare { direction } => Some(direction),
            _ => None,
        }
    }

    pub fn called_computation(&self) -> Option<ComputationId> {
        match self.attrs {
            NodeAttrs::Fusion { called } => Some(called),
            NodeAttrs::Reduce { to_apply, .. } => Some(to_apply),
            _ => None,
        }
    }

    pub fn reduce_dimensions(&self) -> Option<&[i64]> {
        match &self.attrs {
            NodeAttrs::Reduce { dimensions, .. } => Some(dimensions),
            _ => None,
        }
    }

    pub fn broadcast_dimensions(&self) -> Option<&[i64]> {
        match &self.attrs {
            NodeAttrs::Broadcast { dimensions } => Some(dimensions),
            _ => None,
        }
    }

    pub fn concatenate_dimension(&self) -> Option<i64> {
        match self.attrs {
            NodeAttrs::Concatenate { dimension } => Some(dimension),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    pub id: ComputationId,
    pub name: String,
    /// Nodes in insertion order. Builders add producers before consumers.
    pub nodes: Vec<NodeId>,
    /// Parameters indexed by parameter number.
    pub parameters: Vec<NodeId>,
    pub root: NodeId,
}

/// Arena holding every node and computation of a fusion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HloModule {
    pub name: String,
    nodes: Vec<Node>,
    computations: Vec<Computation>,
}

impl HloModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            computations: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn computation(&self, id: ComputationId) -> &Computation {
        &self.computations[id.0 as usize]
    }

    pub fn get_computation(&self, id: ComputationId) -> Option<&Computation> {
        self.computations.get(id.0 as usize)
    }

    pub fn computations(&self) -> &[Computation] {
        &self.computations
    }

    pub fn find_computation(&self, name: &str) -> Option<&Computation> {
        self.computations.iter().find(|comp| comp.name == name)
    }

    /// Starts a new computation. The builder borrows the module until `finish`.
    pub fn builder(&mut self, name: impl Into<String>) -> ComputationBuilder<'_> {
        let id = ComputationId(self.computations.len() as u32);
        ComputationBuilder {
            module: self,
            id,
            name: name.into(),
            nodes: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn shape(&self, id: NodeId) -> &Shape {
        &self.node(id).shape
    }

    pub fn operand(&self, id: NodeId, index: usize) -> Option<&Node> {
        self.node(id)
            .operand(index)
            .and_then(|operand| self.get_node(operand))
    }

    /// Users of `id` inside its computation, in insertion order.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        let parent = self.node(id).parent;
        self.computation(parent)
            .nodes
            .iter()
            .copied()
            .filter(|candidate| self.node(*candidate).operands.contains(&id))
            .collect()
    }

    /// Every node of `computation`, each after all of its operands.
    pub fn post_order(&self, computation: ComputationId) -> Vec<NodeId> {
        let comp = self.computation(computation);
        let mut visited = HashSet::with_capacity(comp.nodes.len());
        let mut order = Vec::with_capacity(comp.nodes.len());
        // The root goes last so scope evaluation ends on it.
        for &start in comp.nodes.iter().filter(|id| **id != comp.root) {
            self.visit_post_order(start, &mut visited, &mut order);
        }
        self.visit_post_order(comp.root, &mut visited, &mut order);
        order
    }

    /// Nodes reachable from `root` through operands, operands first.
    pub fn post_order_from(&self, root: NodeId) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        self.visit_post_order(root, &mut visited, &mut order);
        order
    }

    fn visit_post_order(
        &self,
        start: NodeId,
        visited: &mut HashSet<NodeId>,
        order: &mut Vec<NodeId>,
    ) {
        if visited.contains(&start) {
            return;
        }
        let mut stack = vec![(start, 0usize)];
        visited.insert(start);
        while let Some((id, next)) = stack.pop() {
            let operands = &self.node(id).operands;
            if next < operands.len() {
                stack.push((id, next + 1));
                let operand = operands[next];
                if visited.insert(operand) {
                    stack.push((operand, 0));
                }
            } else {
                order.push(id);
            }
        }
    }

    /// First node with `opcode` in post order, if any.
    pub fn find_in_post_order(&self, computation: ComputationId, opcode: Opcode) -> Option<NodeId> {
        self.post_order(computation)
            .into_iter()
            .find(|id| self.node(*id).opcode == opcode)
    }
}

/// Appends nodes to one computation of an [`HloModule`].
pub struct ComputationBuilder<'m> {
    module: &'m mut HloModule,
    id: ComputationId,
    name: String,
    nodes: Vec<NodeId>,
    parameters: Vec<(usize, NodeId)>,
}

impl<'m> ComputationBuilder<'m> {
    pub fn id(&self) -> ComputationId {
        self.id
    }

    pub fn add(
        &mut self,
        opcode: Opcode,
        operands: &[NodeId],
        shape: Shape,
        attrs: NodeAttrs,
    ) -> NodeId {
        let id = NodeId(self.module.nodes.len() as u32);
        self.module.nodes.push(Node {
            id,
            name: format!("{}.{}", opcode.name(), id.0),
            opcode,
            operands: operands.to_vec(),
            shape,
            attrs,
            parent: self.id,
        });
        self.nodes.push(id);
        id
    }

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) {
        self.module.nodes[id.0 as usize].name = name.into();
    }

    pub fn shape(&self, id: NodeId) -> &Shape {
        self.module.shape(id)
    }

    pub fn parameter(&mut self, number: usize, shape: Shape) -> NodeId {
        let id = self.add(
            Opcode::Parameter,
            &[],
            shape,
            NodeAttrs::Parameter { number },
        );
        self.parameters.push((number, id));
        id
    }

    pub fn constant(&mut self, literal: Literal, element_type: PrimitiveType) -> NodeId {
        self.add(
            Opcode::Constant,
            &[],
            Shape::scalar(element_type),
            NodeAttrs::Constant { literal },
        )
    }

    /// Elementwise op whose result has the shape of its first operand.
    pub fn elementwise(&mut self, opcode: Opcode, operands: &[NodeId]) -> NodeId {
        let shape = self.module.shape(operands[0]).clone();
        self.add(opcode, operands, shape, NodeAttrs::None)
    }

    pub fn convert(&mut self, operand: NodeId, element_type: PrimitiveType) -> NodeId {
        let dims = self.module.shape(operand).dims().to_vec();
        self.add(
            Opcode::Convert,
            &[operand],
            Shape::array(element_type, &dims),
            NodeAttrs::None,
        )
    }

    pub fn compare(&mut self, direction: ComparisonDirection, lhs: NodeId, rhs: NodeId) -> NodeId {
        let dims = self.module.shape(lhs).dims().to_vec();
        self.add(
            Opcode::Compare,
            &[lhs, rhs],
            Shape::array(PrimitiveType::Pred, &dims),
            NodeAttrs::Compare { direction },
        )
    }

    pub fn select(&mut self, pred: NodeId, on_true: NodeId, on_false: NodeId) -> NodeId {
        let shape = self.module.shape(on_true).clone();
        self.add(Opcode::Select, &[pred, on_true, on_false], shape, NodeAttrs::None)
    }

    pub fn broadcast(&mut self, operand: NodeId, shape: Shape, dimensions: &[i64]) -> NodeId {
        self.add(
            Opcode::Broadcast,
            &[operand],
            shape,
            NodeAttrs::Broadcast {
                dimensions: dimensions.to_vec(),
            },
        )
    }

    /// Layout-only op (bitcast, reshape, copy, slice, pad, transpose) producing `shape`.
    pub fn reshape_like(&mut self, opcode: Opcode, operand: NodeId, shape: Shape) -> NodeId {
        self.add(opcode, &[operand], shape, NodeAttrs::None)
    }

    pub fn reduce(
        &mut self,
        operand: NodeId,
        init: NodeId,
        dimensions: &[i64],
        to_apply: ComputationId,
        shape: Shape,
    ) -> NodeId {
        self.add(
            Opcode::Reduce,
            &[operand, init],
            shape,
            NodeAttrs::Reduce {
                dimensions: dimensions.to_vec(),
                to_apply,
            },
        )
    }

    pub fn dot(&mut self, operands: &[NodeId], attrs: DotAttrs, shape: Shape) -> NodeId {
        self.add(Opcode::Dot, operands, shape, NodeAttrs::Dot(attrs))
    }

    pub fn concatenate(&mut self, operands: &[NodeId], dimension: i64, shape: Shape) -> NodeId {
        self.add(
            Opcode::Concatenate,
            operands,
            shape,
            NodeAttrs::Concatenate { dimension },
        )
    }

    pub fn fusion(&mut self, operands: &[NodeId], called: ComputationId, shape: Shape) -> NodeId {
        self.add(Opcode::Fusion, operands, shape, NodeAttrs::Fusion { called })
    }

    pub fn tuple(&mut self, operands: &[NodeId]) -> NodeId {
        let shape = Shape::tuple(
            operands
                .iter()
                .map(|operand| self.module.shape(*operand).clone())
                .collect(),
        );
        self.add(Opcode::Tuple, operands, shape, NodeAttrs::None)
    }

    /// Seals the computation with `root` and returns its id.
    pub fn finish(self, root: NodeId) -> ComputationId {
        let mut parameters = self.parameters;
        parameters.sort_by_key(|(number, _)| *number);
        self.module.computations.push(Computation {
            id: self.id,
            name: self.name,
            nodes: self.nodes,
            parameters: parameters.into_iter().map(|(_, id)| id).collect(),
            root,
        });
        self.id
    }
}

/// Builds a scalar `f32` reducer computation applying `opcode` to its two parameters.
pub fn scalar_reducer(module: &mut HloModule, name: &str, opcode: Opcode) -> ComputationId {
    let mut b = module.builder(name);
    let lhs = b.parameter(0, Shape::scalar(PrimitiveType::F32));
    let rhs = b.parameter(1, Shape::scalar(PrimitiveType::F32));
    let root = b.elementwise(opcode, &[lhs, rhs]);
    b.finish(root)
}
