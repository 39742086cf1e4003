use tilefuse::analysis::{TiledComputation, TiledId, TiledInstruction};
use tilefuse::hlo::{Node, Opcode};
use tilefuse::ir::{FuncBuilder, ValueId};

use super::elementwise::emit_elementwise;
use super::reduce::emit_reduce;
use super::scope::{emit_constant, first_operand, EmitContext, ValueEnv};
use crate::error::{EmitError, EmitResult};
use crate::ret_check;

/// Block dimensions of a tile: unit dimensions are dropped, the others are
/// padded to a power of two.
pub(crate) fn padded_tile_shape(tile_sizes: &[i64]) -> Vec<i64> {
    tile_sizes
        .iter()
        .filter(|&&size| size != 1)
        .map(|&size| (size as u64).next_power_of_two() as i64)
        .collect()
}

fn emit_tiled_broadcast(
    b: &mut FuncBuilder,
    tiled: &TiledComputation,
    instruction: &TiledInstruction,
    node: &Node,
    input: ValueId,
) -> EmitResult<ValueId> {
    let operand = instruction
        .operands
        .first()
        .map(|id| tiled.get(*id))
        .ok_or_else(|| EmitError::internal(format!("broadcast {} has no operand", node.name)))?;
    let dimensions = node
        .broadcast_dimensions()
        .ok_or_else(|| EmitError::internal(format!("broadcast {} has no dimensions", node.name)))?;

    let mut expanded = input;
    let mut expanded_idx = 0;
    let mut input_idx = 0;
    for (out_dim, &out_tile) in instruction.tile_sizes.iter().enumerate() {
        if dimensions.contains(&(out_dim as i64)) {
            let in_tile = operand.tile_sizes.get(input_idx).copied();
            ret_check!(
                in_tile == Some(out_tile),
                "broadcast {} changes the tile of dimension {out_dim}",
                node.name
            );
            input_idx += 1;
            if out_tile != 1 {
                expanded_idx += 1;
            }
        } else if out_tile != 1 {
            expanded = b.expand_dims(expanded, expanded_idx);
            expanded_idx += 1;
        }
    }
    Ok(b.broadcast(expanded, &padded_tile_shape(&instruction.tile_sizes)))
}

/// Emits a pre-tiled computation in def-before-use order.
///
/// `load_parameter` produces the tile of a parameter instruction. Returns the
/// value of the root instruction.
pub fn emit_tiled_scope<F>(
    b: &mut FuncBuilder,
    cx: &EmitContext<'_>,
    tiled: &TiledComputation,
    mut load_parameter: F,
    values: &mut ValueEnv<TiledId>,
) -> EmitResult<ValueId>
where
    F: FnMut(&mut FuncBuilder, &TiledInstruction) -> EmitResult<ValueId>,
{
    let root = tiled
        .root()
        .ok_or_else(|| EmitError::internal("tiled computation is empty"))?;

    for id in tiled.ids() {
        let instruction = tiled.get(id);
        let node = cx.module.node(instruction.node);
        let result = match node.opcode {
            Opcode::Parameter => load_parameter(b, instruction)?,
            Opcode::Constant if node.shape.is_effective_scalar() => {
                let constant = emit_constant(b, node)?;
                b.splat(constant, &[])
            }
            Opcode::Broadcast => {
                let input = first_operand(values, &instruction.operands, node)?;
                emit_tiled_broadcast(b, tiled, instruction, node, input)?
            }
            Opcode::Reduce => {
                let input = first_operand(values, &instruction.operands, node)?;
                emit_reduce(b, cx, node, input)?
            }
            Opcode::Transpose
            | Opcode::Slice
            | Opcode::Pad
            | Opcode::Bitcast
            | Opcode::Reshape => first_operand(values, &instruction.operands, node)?,
            opcode if opcode.is_elementwise() => {
                let inputs = instruction
                    .operands
                    .iter()
                    .map(|operand| values.require(*operand))
                    .collect::<EmitResult<Vec<_>>>()?;
                emit_elementwise(b, cx, node, &inputs)?
            }
            other => {
                return Err(EmitError::unsupported(format!(
                    "Unsupported opcode: {other}"
                )))
            }
        };
        values.insert(id, result)?;
        tracing::trace!(node = %node.name, tile = ?instruction.tile_sizes, "emitted tile");
    }
    values.require(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_dimensions_leave_the_block_shape() {
        assert_eq!(padded_tile_shape(&[1, 100]), vec![128]);
        assert_eq!(padded_tile_shape(&[4, 1, 17]), vec![4, 32]);
        assert!(padded_tile_shape(&[1, 1]).is_empty());
    }
}
