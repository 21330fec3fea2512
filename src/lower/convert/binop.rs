//! Conversion of elementwise `quantized::add` / `quantized::mul` and their
//! relu-fused variants.

use super::ConvertCtx;
use crate::{
    error::LowerError,
    graph::{TracedNode, Wire},
    params::{QuantScale, QuantZeroPoint},
    qir::{DType, QirNode, ValueId},
};

#[derive(Debug, Clone, Copy)]
pub(super) enum BinOp {
    Add,
    Mul,
}

/// Materialized operand layout:
/// 0 lhs, 1 rhs, 2 output_scale, 3 output_zero_point,
/// 4 lhs_scale, 5 lhs_zero_point, 6 rhs_scale, 7 rhs_zero_point.
#[tracing::instrument(name = "convert::binop", skip_all, fields(node = node.idx))]
pub(super) fn quantized_binop(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
    op: BinOp,
    with_relu: bool,
) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 8)?;

    let (output_scale, output_zero_point) = ctx.scale_zp(node, 2)?;
    let lhs = real_operand(ctx, node, node.inputs[0], 4)?;
    let rhs = real_operand(ctx, node, node.inputs[1], 6)?;

    let real_out = match op {
        BinOp::Add => ctx.qir.push(QirNode::Add { lhs, rhs }),
        BinOp::Mul => ctx.qir.push(QirNode::Multiply { lhs, rhs }),
    };
    let real_out = if with_relu {
        ctx.qir.push(QirNode::Relu { value: real_out })
    } else {
        real_out
    };

    Ok(ctx.qir.push(QirNode::Quantize {
        value: real_out,
        scale: QuantScale::PerTensor(output_scale),
        zero_point: QuantZeroPoint::PerTensor(output_zero_point),
        axis: 1,
        dtype: DType::U8,
    }))
}

/// Real-domain view of a quantized operand.
///
/// When the operand is the direct output of a quantize step, its
/// pre-quantization real value is reused to avoid a redundant round-trip
/// error; otherwise the operand is dequantized with its own resolved params.
fn real_operand(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
    operand: Wire,
    params_at: usize,
) -> Result<ValueId, LowerError> {
    let value = ctx.value(operand)?;
    if let QirNode::Quantize { value: pre, .. } = ctx.qir.node(value) {
        return Ok(*pre);
    }
    let (scale, zero_point) = ctx.scale_zp(node, params_at)?;
    Ok(ctx.qir.push(QirNode::Dequantize {
        value,
        scale,
        zero_point,
    }))
}
