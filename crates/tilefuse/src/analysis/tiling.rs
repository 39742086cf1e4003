use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::hlo::{ComputationId, HloModule, NodeId, Opcode};

/// Integer expression over the program id, used for tile offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffineExpr {
    Pid,
    Const(i64),
    Add(Box<AffineExpr>, Box<AffineExpr>),
    Mul(Box<AffineExpr>, i64),
    FloorDiv(Box<AffineExpr>, i64),
    Mod(Box<AffineExpr>, i64),
}

impl AffineExpr {
    pub fn add(lhs: AffineExpr, rhs: AffineExpr) -> AffineExpr {
        match (lhs, rhs) {
            (AffineExpr::Const(0), other) | (other, AffineExpr::Const(0)) => other,
            (AffineExpr::Const(a), AffineExpr::Const(b)) => AffineExpr::Const(a + b),
            (lhs, rhs) => AffineExpr::Add(Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn mul(self, factor: i64) -> AffineExpr {
        match (self, factor) {
            (_, 0) => AffineExpr::Const(0),
            (expr, 1) => expr,
            (AffineExpr::Const(value), factor) => AffineExpr::Const(value * factor),
            (expr, factor) => AffineExpr::Mul(Box::new(expr), factor),
        }
    }

    pub fn floor_div(self, divisor: i64) -> AffineExpr {
        match (self, divisor) {
            (expr, 1) => expr,
            (AffineExpr::Const(value), divisor) => AffineExpr::Const(value.div_euclid(divisor)),
            (expr, divisor) => AffineExpr::FloorDiv(Box::new(expr), divisor),
        }
    }

    pub fn modulo(self, modulus: i64) -> AffineExpr {
        match (self, modulus) {
            (_, 1) => AffineExpr::Const(0),
            (AffineExpr::Const(value), modulus) => AffineExpr::Const(value.rem_euclid(modulus)),
            (expr, modulus) => AffineExpr::Mod(Box::new(expr), modulus),
        }
    }

    pub fn eval(&self, pid: i64) -> i64 {
        match self {
            AffineExpr::Pid => pid,
            AffineExpr::Const(value) => *value,
            AffineExpr::Add(lhs, rhs) => lhs.eval(pid) + rhs.eval(pid),
            AffineExpr::Mul(expr, factor) => expr.eval(pid) * factor,
            AffineExpr::FloorDiv(expr, divisor) => expr.eval(pid).div_euclid(*divisor),
            AffineExpr::Mod(expr, modulus) => expr.eval(pid).rem_euclid(*modulus),
        }
    }
}

/// Index of an instruction inside a [`TiledComputation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TiledId(pub usize);

/// A graph node together with the tile one program instance processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiledInstruction {
    pub node: NodeId,
    pub operands: Vec<TiledId>,
    pub tile_sizes: Vec<i64>,
    pub tile_strides: Vec<i64>,
    /// Offset of the tile along each dimension as a function of the program id.
    pub tile_offsets: Vec<AffineExpr>,
}

/// Tiled instructions in def-before-use order; the root comes last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TiledComputation {
    pub instructions: Vec<TiledInstruction>,
}

impl TiledComputation {
    pub fn get(&self, id: TiledId) -> &TiledInstruction {
        &self.instructions[id.0]
    }

    pub fn root(&self) -> Option<TiledId> {
        self.instructions.len().checked_sub(1).map(TiledId)
    }

    pub fn ids(&self) -> impl Iterator<Item = TiledId> {
        (0..self.instructions.len()).map(TiledId)
    }
}

/// Source of pre-tiled instructions for a fusion.
///
/// An error means the computation cannot be tiled this way and callers should
/// fall back to their own addressing.
pub trait SymbolicTiling {
    fn compute_tiled_computation(&self, output_tile_sizes: &[i64])
        -> Result<TiledComputation, String>;
}

/// Tiling for computations that process whole rows of their root.
///
/// Tile sizes are propagated from the root to the leaves through elementwise
/// ops, broadcasts and innermost-axis reductions. The program id is
/// delinearized over the root's tile grid in row-major order.
pub struct RowTileAnalysis<'a> {
    module: &'a HloModule,
    computation: ComputationId,
}

#[derive(Debug, Clone, PartialEq)]
struct NodeTiling {
    sizes: Vec<i64>,
    offsets: Vec<AffineExpr>,
}

impl<'a> RowTileAnalysis<'a> {
    pub fn new(module: &'a HloModule, computation: ComputationId) -> Self {
        Self {
            module,
            computation,
        }
    }

    fn assign(
        tilings: &mut HashMap<NodeId, NodeTiling>,
        node: NodeId,
        tiling: NodeTiling,
    ) -> Result<(), String> {
        match tilings.get(&node) {
            Some(existing) if *existing != tiling => {
                Err(format!("conflicting tilings for node {node}"))
            }
            Some(_) => Ok(()),
            None => {
                tilings.insert(node, tiling);
                Ok(())
            }
        }
    }

    fn propagate(
        &self,
        id: NodeId,
        tiling: &NodeTiling,
        tilings: &mut HashMap<NodeId, NodeTiling>,
    ) -> Result<(), String> {
        let node = self.module.node(id);
        match node.opcode {
            Opcode::Parameter | Opcode::Constant => Ok(()),
            Opcode::Broadcast => {
                let dimensions = node.broadcast_dimensions().unwrap_or_default();
                let operand_tiling = NodeTiling {
                    sizes: dimensions.iter().map(|&d| tiling.sizes[d as usize]).collect(),
                    offsets: dimensions
                        .iter()
                        .map(|&d| tiling.offsets[d as usize].clone())
                        .collect(),
                };
                Self::assign(tilings, node.operands[0], operand_tiling)
            }
            Opcode::Reduce => {
                let input = node.operands[0];
                let input_dims = self.module.shape(input).dims();
                let innermost = input_dims.len() as i64 - 1;
                if node.reduce_dimensions() != Some(&[innermost][..]) {
                    return Err(format!(
                        "row tiling requires an innermost-axis reduction, got {:?}",
                        node.reduce_dimensions()
                    ));
                }
                let mut sizes = tiling.sizes.clone();
                sizes.push(input_dims[innermost as usize]);
                let mut offsets = tiling.offsets.clone();
                offsets.push(AffineExpr::Const(0));
                Self::assign(tilings, input, NodeTiling { sizes, offsets })?;
                for &init in &node.operands[1..] {
                    Self::assign(tilings, init, NodeTiling::scalar())?;
                }
                Ok(())
            }
            opcode
                if opcode.is_elementwise()
                    || matches!(
                        opcode,
                        Opcode::Bitcast | Opcode::Reshape | Opcode::Transpose | Opcode::Slice
                    ) =>
            {
                for &operand in &node.operands {
                    let operand_shape = self.module.shape(operand);
                    if operand_shape.rank() == 0 {
                        Self::assign(tilings, operand, NodeTiling::scalar())?;
                    } else if operand_shape.dims() == node.shape.dims() {
                        Self::assign(tilings, operand, tiling.clone())?;
                    } else {
                        return Err(format!(
                            "row tiling cannot propagate through {} with operand dims {:?}",
                            opcode,
                            operand_shape.dims()
                        ));
                    }
                }
                Ok(())
            }
            other => Err(format!("row tiling does not support {other}")),
        }
    }
}

impl NodeTiling {
    fn scalar() -> Self {
        Self {
            sizes: Vec::new(),
            offsets: Vec::new(),
        }
    }
}

impl SymbolicTiling for RowTileAnalysis<'_> {
    fn compute_tiled_computation(
        &self,
        output_tile_sizes: &[i64],
    ) -> Result<TiledComputation, String> {
        let comp = self.module.computation(self.computation);
        let root_dims = self.module.shape(comp.root).dims().to_vec();
        if root_dims.len() != output_tile_sizes.len() {
            return Err(format!(
                "tile sizes {:?} do not match root rank {}",
                output_tile_sizes,
                root_dims.len()
            ));
        }

        let tile_counts: Vec<i64> = root_dims
            .iter()
            .zip(output_tile_sizes)
            .map(|(dim, tile)| (dim + tile - 1) / tile)
            .collect();
        let mut offsets = Vec::with_capacity(root_dims.len());
        let mut inner = 1i64;
        for (index, &count) in tile_counts.iter().enumerate().rev() {
            let offset = AffineExpr::Pid
                .floor_div(inner)
                .modulo(count)
                .mul(output_tile_sizes[index]);
            offsets.push(offset);
            inner *= count;
        }
        offsets.reverse();

        let mut tilings = HashMap::new();
        tilings.insert(
            comp.root,
            NodeTiling {
                sizes: output_tile_sizes.to_vec(),
                offsets,
            },
        );

        let order = self.module.post_order_from(comp.root);
        for &id in order.iter().rev() {
            let Some(tiling) = tilings.get(&id).cloned() else {
                return Err(format!("node {id} has no tiling"));
            };
            self.propagate(id, &tiling, &mut tilings)?;
        }

        let mut index_of = HashMap::with_capacity(order.len());
        let mut instructions = Vec::with_capacity(order.len());
        for id in order {
            let tiling = tilings
                .remove(&id)
                .ok_or_else(|| format!("node {id} has no tiling"))?;
            let operands = self
                .module
                .node(id)
                .operands
                .iter()
                .map(|operand| {
                    index_of
                        .get(operand)
                        .copied()
                        .ok_or_else(|| format!("operand {operand} tiled after its user"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            index_of.insert(id, TiledId(instructions.len()));
            instructions.push(TiledInstruction {
                node: id,
                operands,
                tile_strides: vec![1; tiling.sizes.len()],
                tile_sizes: tiling.sizes,
                tile_offsets: tiling.offsets,
            });
        }
        Ok(TiledComputation { instructions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_helpers_fold_trivial_terms() {
        assert_eq!(AffineExpr::Pid.floor_div(1), AffineExpr::Pid);
        assert_eq!(AffineExpr::Pid.modulo(1), AffineExpr::Const(0));
        assert_eq!(AffineExpr::Pid.mul(0), AffineExpr::Const(0));
        let expr = AffineExpr::Pid.floor_div(4).modulo(3).mul(2);
        assert_eq!(expr.eval(13), 6);
    }
}
