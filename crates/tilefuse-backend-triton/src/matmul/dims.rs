use tilefuse::analysis::{Scope, TritonFusionAnalysis};
use tilefuse::config::TritonGemmConfig;
use tilefuse::hlo::{non_contracting_dims, DotAttrs, HloModule, Node, NodeId, Opcode};

use crate::error::{EmitError, EmitResult};
use crate::ret_check;

pub(crate) fn dot_attrs(dot: &Node) -> EmitResult<&DotAttrs> {
    dot.dot_attrs()
        .ok_or_else(|| EmitError::internal(format!("{} is not a dot", dot.name)))
}

fn operand_dims<'m>(module: &'m HloModule, dot: &Node, index: usize) -> EmitResult<&'m [i64]> {
    let operand = dot
        .operand(index)
        .ok_or_else(|| EmitError::internal(format!("{} has no operand {index}", dot.name)))?;
    Ok(module.shape(operand).dims())
}

/// Rejects configurations the matmul emitter cannot express for `dot`.
pub fn validate_matmul_config(
    config: &TritonGemmConfig,
    module: &HloModule,
    dot: &Node,
) -> EmitResult<()> {
    let numbers = &dot_attrs(dot)?.dimension_numbers;

    if config.split_k < 1 {
        return Err(EmitError::uncompilable(format!(
            "Invalid split_k: {}",
            config.split_k
        )));
    }
    if config.block_m < 16 || config.block_k < 16 || config.block_n < 16 {
        return Err(EmitError::uncompilable(format!(
            "Blocks smaller than 16x16x16 are not supported: {}x{}x{}",
            config.block_m, config.block_n, config.block_k
        )));
    }

    let split = config.split_k > 1;
    let num_batch_dims = numbers
        .lhs_batch_dimensions
        .len()
        .checked_sub(usize::from(split))
        .ok_or_else(|| EmitError::uncompilable("Split-K requires a split batch dimension."))?;
    if num_batch_dims > 1 {
        return Err(EmitError::uncompilable(
            "Only one batch dimension is supported.",
        ));
    }
    if numbers.lhs_contracting_dimensions.len() != 1
        || numbers.rhs_contracting_dimensions.len() != 1
    {
        return Err(EmitError::uncompilable(
            "Exactly one contracting dimension per operand is required.",
        ));
    }
    let lhs_contracting = numbers.lhs_contracting_dimensions[0];
    let rhs_contracting = numbers.rhs_contracting_dimensions[0];

    if split {
        // The split dimension is the batch dimension right before contracting.
        if numbers.lhs_batch_dimensions.first() != Some(&(lhs_contracting - 1))
            || numbers.rhs_batch_dimensions.first() != Some(&(rhs_contracting - 1))
        {
            return Err(EmitError::uncompilable(
                "The split-K dimension must directly precede the contracting dimension.",
            ));
        }
        let lhs_split = operand_dims(module, dot, 0)?
            .get((lhs_contracting - 1) as usize)
            .copied();
        let rhs_split = operand_dims(module, dot, 1)?
            .get((rhs_contracting - 1) as usize)
            .copied();
        if lhs_split != Some(config.split_k) || rhs_split != Some(config.split_k) {
            return Err(EmitError::uncompilable(format!(
                "Split dimensions {lhs_split:?}/{rhs_split:?} do not match split_k {}",
                config.split_k
            )));
        }
    }

    let lhs_rank = operand_dims(module, dot, 0)?.len();
    if lhs_rank != 2 + usize::from(split) + num_batch_dims {
        return Err(EmitError::uncompilable(format!(
            "Unexpected LHS rank {lhs_rank} for {num_batch_dims} batch dimensions"
        )));
    }
    Ok(())
}

/// Dimension indices and problem sizes of a matmul fusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatMulDims {
    pub out_lhs_noncontracting_dim_idx: usize,
    pub out_rhs_noncontracting_dim_idx: usize,
    pub out_batch_dim_idx: Option<usize>,
    pub out_split_k_dim_idx: Option<usize>,

    pub lhs_contracting_dim_idx: usize,
    pub lhs_noncontracting_dim_idx: usize,
    pub lhs_batch_dim_idx: Option<usize>,
    /// Size of the major part of the LHS non-contracting dimension when the
    /// analysis found it split into two fragments.
    pub lhs_noncontracting_split: Option<i64>,

    pub rhs_contracting_dim_idx: usize,
    pub rhs_noncontracting_dim_idx: usize,
    pub rhs_batch_dim_idx: Option<usize>,

    pub m: i64,
    pub n: i64,
    pub k: i64,
}

impl MatMulDims {
    pub fn create(
        config: &TritonGemmConfig,
        module: &HloModule,
        analysis: &TritonFusionAnalysis,
        root: NodeId,
        dot: &Node,
    ) -> EmitResult<Self> {
        let numbers = &dot_attrs(dot)?.dimension_numbers;
        // Output specs are numbered by the dot's dimensions, whatever the
        // epilogue does to the rank.
        let out_rank = dot.shape.rank();
        ret_check!(out_rank >= 2, "dot rank {out_rank} is below 2");

        let split = config.split_k > 1;
        let out_split_k_dim_idx = split.then_some(0);
        let num_split_k_batch_dims = usize::from(split);

        let lhs_rank = operand_dims(module, dot, 0)?.len();
        let rhs_rank = operand_dims(module, dot, 1)?.len();
        let lhs_contracting = *numbers
            .lhs_contracting_dimensions
            .first()
            .ok_or_else(|| EmitError::internal("dot without LHS contracting dimension"))?;
        let rhs_contracting = *numbers
            .rhs_contracting_dimensions
            .first()
            .ok_or_else(|| EmitError::internal("dot without RHS contracting dimension"))?;
        let lhs_noncontracting = *non_contracting_dims(
            lhs_rank,
            &numbers.lhs_batch_dimensions,
            &numbers.lhs_contracting_dimensions,
        )
        .first()
        .ok_or_else(|| EmitError::internal("dot without LHS non-contracting dimension"))?;
        let rhs_noncontracting = *non_contracting_dims(
            rhs_rank,
            &numbers.rhs_batch_dimensions,
            &numbers.rhs_contracting_dimensions,
        )
        .first()
        .ok_or_else(|| EmitError::internal("dot without RHS non-contracting dimension"))?;

        let (lhs_batch_dim_idx, rhs_batch_dim_idx, out_batch_dim_idx) =
            if numbers.lhs_batch_dimensions.len() > num_split_k_batch_dims {
                (
                    numbers.lhs_batch_dimensions.last().map(|&d| d as usize),
                    numbers.rhs_batch_dimensions.last().map(|&d| d as usize),
                    Some(num_split_k_batch_dims),
                )
            } else {
                (None, None, None)
            };

        let out_rhs_noncontracting_dim_idx = out_rank - 1;
        let out_lhs_noncontracting_dim_idx = out_rank - 2;

        let n = analysis
            .iter_spec(Scope::Output, root, out_rhs_noncontracting_dim_idx)
            .and_then(|spec| spec.first())
            .map(|fragment| fragment.count)
            .ok_or_else(|| EmitError::internal("output has no RHS non-contracting spec"))?;

        let rhs_operand = dot
            .operand(1)
            .ok_or_else(|| EmitError::internal("dot without RHS"))?;
        let padded_rhs = module
            .operand(rhs_operand, 0)
            .filter(|inner| split && inner.opcode == Opcode::Pad);
        let k = match padded_rhs {
            Some(pad) => {
                // Split-K over a padded contracting dimension: K is the unpadded size.
                ret_check!(
                    module.node(rhs_operand).opcode == Opcode::Bitcast,
                    "padded split-K RHS must be bitcast after padding"
                );
                let unpadded = module
                    .operand(pad.id, 0)
                    .ok_or_else(|| EmitError::internal("pad without operand"))?;
                let index = (rhs_contracting - 1) as usize;
                *unpadded
                    .shape
                    .dims()
                    .get(index)
                    .ok_or_else(|| EmitError::internal("unpadded RHS rank too small"))?
            }
            None => {
                let dims = module.shape(rhs_operand).dims();
                dims.get(rhs_contracting as usize)
                    .copied()
                    .ok_or_else(|| EmitError::internal("RHS contracting index out of range"))?
                    * config.split_k
            }
        };

        let mut lhs_noncontracting_split = None;
        let mut m = None;
        for parameter in analysis.scope_parameters(Scope::Lhs) {
            let Some(spec) =
                analysis.iter_spec(Scope::Lhs, parameter, lhs_noncontracting as usize)
            else {
                continue;
            };
            if spec.len() > 1 {
                ret_check!(
                    spec.len() == 2,
                    "non-contracting dimension split into {} fragments",
                    spec.len()
                );
                m = Some(spec[0].count);
                lhs_noncontracting_split = Some(spec[1].count);
                break;
            }
        }
        let m = match m {
            Some(m) => m,
            None => analysis
                .iter_spec(Scope::Output, root, out_lhs_noncontracting_dim_idx)
                .and_then(|spec| spec.first())
                .map(|fragment| fragment.count)
                .ok_or_else(|| EmitError::internal("output has no LHS non-contracting spec"))?,
        };

        ret_check!(
            out_batch_dim_idx.is_none() || lhs_noncontracting_split.is_none(),
            "batch dimension and non-contracting split cannot coexist"
        );
        ret_check!(m >= 1 && n >= 1, "empty matmul {m}x{n}");

        Ok(Self {
            out_lhs_noncontracting_dim_idx,
            out_rhs_noncontracting_dim_idx,
            out_batch_dim_idx,
            out_split_k_dim_idx,
            lhs_contracting_dim_idx: lhs_contracting as usize,
            lhs_noncontracting_dim_idx: lhs_noncontracting as usize,
            lhs_batch_dim_idx,
            lhs_noncontracting_split,
            rhs_contracting_dim_idx: rhs_contracting as usize,
            rhs_noncontracting_dim_idx: rhs_noncontracting as usize,
            rhs_batch_dim_idx,
            m,
            n,
            k,
        })
    }
}
