use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use tilefuse::analysis::{Scope, TritonFusionAnalysis};
use tilefuse::config::DeviceDescription;
use tilefuse::hlo::{HloModule, Literal, Node, NodeId, Opcode};
use tilefuse::ir::{FuncBuilder, Padding, Type, ValueId};

use super::elementwise::emit_elementwise;
use super::reduce::emit_reduce;
use super::types::node_type;
use crate::error::{EmitError, EmitResult};
use crate::ret_check;

/// Graph and device shared by every scope evaluation of one kernel.
#[derive(Debug, Clone, Copy)]
pub struct EmitContext<'a> {
    pub module: &'a HloModule,
    pub device: &'a DeviceDescription,
}

/// A tiled logical dimension of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimProperties {
    /// Logical index of the dimension at the node defining the tiling.
    pub index: usize,
    /// Program id selecting the block along this dimension, if any.
    pub pid: Option<ValueId>,
    pub block_size: i64,
    /// Size of the major part when the dimension is split (split-K).
    pub split_value: i64,
}

impl DimProperties {
    pub fn new(index: usize, pid: Option<ValueId>, block_size: i64, split_value: i64) -> Self {
        Self {
            index,
            pid,
            block_size,
            split_value,
        }
    }
}

/// Emitted kernel values keyed by the graph node (or tiled instruction)
/// they were produced for. Every key is written at most once.
#[derive(Debug, Clone)]
pub struct ValueEnv<K = NodeId> {
    values: HashMap<K, ValueId>,
}

impl<K> Default for ValueEnv<K> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash + Debug> ValueEnv<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: K, value: ValueId) -> EmitResult<()> {
        if self.values.insert(key, value).is_some() {
            return Err(EmitError::internal(format!(
                "value for {key:?} emitted twice"
            )));
        }
        Ok(())
    }

    pub fn get(&self, key: K) -> Option<ValueId> {
        self.values.get(&key).copied()
    }

    pub fn require(&self, key: K) -> EmitResult<ValueId> {
        self.get(key)
            .ok_or_else(|| EmitError::internal(format!("no value emitted for {key:?}")))
    }

    pub fn contains(&self, key: K) -> bool {
        self.values.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Loads through `pointer`. Block pointers honour `boundary_checks` with zero
/// padding; scalar pointers produce a rank-0 tensor.
pub fn emit_parameter_load(
    b: &mut FuncBuilder,
    pointer: ValueId,
    boundary_checks: &[usize],
) -> ValueId {
    if matches!(b.ty(pointer), Type::BlockPtr(_)) {
        let padding = (!boundary_checks.is_empty()).then_some(Padding::Zero);
        return b.load(pointer, boundary_checks, padding);
    }
    let scalar = b.load(pointer, &[], None);
    b.splat(scalar, &[])
}

/// Scalar constant holding the literal of a constant node.
pub fn emit_constant(b: &mut FuncBuilder, node: &Node) -> EmitResult<ValueId> {
    let literal = node.literal().ok_or_else(|| {
        EmitError::internal(format!("constant {} carries no literal", node.name))
    })?;
    let ty = Type::Scalar(node_type(node.element_type())?);
    Ok(match literal {
        Literal::Float(value) => b.float_const(&ty, value),
        Literal::Int(_) | Literal::Bool(_) => b.int_const(&ty, literal.as_i64()),
    })
}

/// Expands `input` with unit axes where the broadcast adds dimensions, then
/// broadcasts it to the block shape of the tiled dimensions it varies along.
pub fn emit_broadcast(
    b: &mut FuncBuilder,
    analysis: Option<&TritonFusionAnalysis>,
    scope: Scope,
    tiled_dims: &[DimProperties],
    broadcast: &Node,
    input: ValueId,
) -> EmitResult<ValueId> {
    let analysis = analysis.ok_or_else(|| {
        EmitError::internal(format!(
            "broadcast {} needs a fusion analysis",
            broadcast.name
        ))
    })?;
    let operand = broadcast
        .operand(0)
        .ok_or_else(|| EmitError::internal("broadcast without operand"))?;
    let varies = |node: NodeId, dim: &DimProperties| {
        analysis
            .iter_spec(scope, node, dim.index)
            .is_some_and(|spec| spec.first().is_some_and(|fragment| fragment.stride > 0))
    };

    let out_shape: Vec<i64> = tiled_dims
        .iter()
        .filter(|dim| varies(broadcast.id, dim))
        .map(|dim| dim.block_size)
        .collect();

    if !b.ty(input).is_tensor() {
        return Ok(b.splat(input, &out_shape));
    }
    if b.ty(input).shape().len() == out_shape.len() {
        return Ok(input);
    }

    let mut expanded = input;
    let mut dim_idx = 0;
    for dim in tiled_dims.iter().filter(|dim| varies(broadcast.id, dim)) {
        if analysis.iter_spec(scope, operand, dim.index).is_none() {
            expanded = b.expand_dims(expanded, dim_idx);
        }
        dim_idx += 1;
    }
    Ok(b.broadcast(expanded, &out_shape))
}

fn is_layout_only(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Bitcast | Opcode::Transpose | Opcode::Slice | Opcode::Reshape | Opcode::Pad
    )
}

fn operand_values<K: Copy + Eq + Hash + Debug>(
    values: &ValueEnv<K>,
    operands: impl IntoIterator<Item = K>,
) -> EmitResult<Vec<ValueId>> {
    operands
        .into_iter()
        .map(|operand| values.require(operand))
        .collect()
}

pub(crate) fn first_operand<K: Copy + Eq + Hash + Debug>(
    values: &ValueEnv<K>,
    operands: &[K],
    node: &Node,
) -> EmitResult<ValueId> {
    let operand = operands
        .first()
        .ok_or_else(|| EmitError::internal(format!("{} has no operands", node.name)))?;
    values.require(*operand)
}

/// Emits `nodes`, ordered producers first, into the current block of `b`.
///
/// Parameters (and concatenations of them) must already be loaded into
/// `values`. Returns the value of the last node.
pub fn emit_scope(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    analysis: Option<&TritonFusionAnalysis>,
    scope: Scope,
    tiled_dims: &[DimProperties],
    nodes: &[NodeId],
    values: &mut ValueEnv,
) -> EmitResult<ValueId> {
    let last = *nodes
        .last()
        .ok_or_else(|| EmitError::internal("empty scope"))?;

    for &id in nodes {
        let node = cx.module.node(id);
        let result = match node.opcode {
            Opcode::Concatenate => {
                ret_check!(values.contains(id), "concatenation {} was not loaded", node.name);
                continue;
            }
            Opcode::Parameter => {
                let feeds_concat = cx
                    .module
                    .users(id)
                    .first()
                    .is_some_and(|user| cx.module.node(*user).opcode == Opcode::Concatenate);
                if !feeds_concat {
                    ret_check!(values.contains(id), "parameter {} was not loaded", node.name);
                }
                continue;
            }
            Opcode::Tuple => {
                ret_check!(
                    cx.module.computation(node.parent).root == id,
                    "tuple {} is not the root",
                    node.name
                );
                continue;
            }
            Opcode::Constant => {
                let constant = emit_constant(b, node)?;
                b.splat(constant, &[])
            }
            Opcode::Broadcast => {
                let input = first_operand(values, &node.operands, node)?;
                emit_broadcast(b, analysis, scope, tiled_dims, node, input)?
            }
            Opcode::Reduce => {
                let input = first_operand(values, &node.operands, node)?;
                emit_reduce(b, cx, node, input)?
            }
            Opcode::Fusion => emit_nested_fusion(b, cx, node, values)?,
            opcode if is_layout_only(opcode) => first_operand(values, &node.operands, node)?,
            opcode if opcode.is_elementwise() => {
                let inputs = operand_values(values, node.operands.iter().copied())?;
                emit_elementwise(b, cx, node, &inputs)?
            }
            _ => {
                return Err(EmitError::unsupported(format!(
                    "Unsupported operation {} ({})",
                    node.name, node.opcode
                )))
            }
        };
        values.insert(id, result)?;
        tracing::trace!(node = %node.name, opcode = %node.opcode, "emitted");
    }
    values.require(last)
}

/// Inlines a nested fusion: its parameters take the values of the fusion's
/// operands and its body is emitted without tiling information.
fn emit_nested_fusion(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    fusion: &Node,
    values: &ValueEnv,
) -> EmitResult<ValueId> {
    let called = fusion.called_computation().ok_or_else(|| {
        EmitError::internal(format!("fusion {} has no called computation", fusion.name))
    })?;
    let mut region_values = ValueEnv::new();
    let mut to_emit = Vec::new();
    for id in cx.module.post_order(called) {
        let node = cx.module.node(id);
        match node.parameter_number() {
            Some(number) => {
                let operand = fusion.operand(number).ok_or_else(|| {
                    EmitError::internal(format!(
                        "fusion {} has no operand {number}",
                        fusion.name
                    ))
                })?;
                region_values.insert(id, values.require(operand)?)?;
            }
            None => to_emit.push(id),
        }
    }
    ret_check!(
        to_emit.last() == Some(&cx.module.computation(called).root),
        "nested fusion {} does not end on its root",
        fusion.name
    );
    emit_scope(b, cx, None, Scope::Output, &[], &to_emit, &mut region_values)
}
