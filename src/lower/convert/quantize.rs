//! Conversion of the terminal `aten::quantize_per_tensor` and
//! `aten::dequantize` ops.

use super::ConvertCtx;
use crate::{
    error::LowerError,
    graph::TracedNode,
    params::{QuantScale, QuantZeroPoint},
    qir::{DType, QirNode, ValueId},
};

/// Operand layout (not materialized; the params are literal operands):
/// 0 value, 1 scale, 2 zero_point.
pub(super) fn quantize_per_tensor(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 3)?;
    let value = ctx.value(node.inputs[0])?;
    let (scale, zero_point) = ctx.scale_zp(node, 1)?;
    Ok(ctx.qir.push(QirNode::Quantize {
        value,
        scale: QuantScale::PerTensor(scale),
        zero_point: QuantZeroPoint::PerTensor(zero_point),
        axis: 1,
        dtype: DType::U8,
    }))
}

/// Materialized operand layout: 0 value, 1 input_scale, 2 input_zero_point.
pub(super) fn dequantize(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 3)?;
    let value = ctx.value(node.inputs[0])?;
    let (scale, zero_point) = ctx.scale_zp(node, 1)?;
    Ok(ctx.qir.push(QirNode::Dequantize {
        value,
        scale,
        zero_point,
    }))
}
