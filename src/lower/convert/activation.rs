//! Conversion of the bounded and plain relu activations.

use super::ConvertCtx;
use crate::{
    error::LowerError,
    graph::TracedNode,
    qir::{QirNode, ValueId},
};

/// Quantize a real scalar into an affine u8 domain.
pub(crate) fn quantize_scalar(value: f64, scale: f64, zero_point: i32) -> f64 {
    (zero_point as f64 + value / scale).round().clamp(0.0, 255.0)
}

/// `quantized::relu6`. Materialized operand layout:
/// 0 value, 1 inplace flag, 2 input_scale, 3 input_zero_point.
///
/// The literal upper bound 6.0 is quantized into the input's own domain and
/// the input clipped between its zero point and that bound.
#[tracing::instrument(name = "convert::relu6", skip_all, fields(node = node.idx))]
pub(super) fn relu6(ctx: &mut ConvertCtx<'_>, node: &TracedNode) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 4)?;
    let value = ctx.value(node.inputs[0])?;
    let (scale, zero_point) = ctx.scale_zp(node, 2)?;
    let six = quantize_scalar(6.0, scale, zero_point);
    Ok(ctx.qir.push(QirNode::Clip {
        value,
        min: zero_point as f64,
        max: six,
    }))
}

/// `aten::relu` on a quantized tensor. Materialized operand layout:
/// 0 value, 1 input_scale, 2 input_zero_point.
///
/// In the quantized domain a relu is a lower clamp at the zero point.
#[tracing::instrument(name = "convert::relu", skip_all, fields(node = node.idx))]
pub(super) fn relu(ctx: &mut ConvertCtx<'_>, node: &TracedNode) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 3)?;
    let value = ctx.value(node.inputs[0])?;
    let (_, zero_point) = ctx.scale_zp(node, 1)?;
    Ok(ctx.qir.push(QirNode::Clip {
        value,
        min: zero_point as f64,
        max: 255.0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_scalar_rounds_and_clamps() {
        // 6.0 at scale 0.1, zero point 10 => 70.
        assert_eq!(quantize_scalar(6.0, 0.1, 10), 70.0);
        // Saturates at the u8 bound.
        assert_eq!(quantize_scalar(6.0, 0.01, 200), 255.0);
        assert_eq!(quantize_scalar(-100.0, 0.1, 0), 0.0);
    }
}
