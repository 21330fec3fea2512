//! Conversion of `quantized::add_scalar` and `quantized::mul_scalar`.
//!
//! Both ops were given computed output quant params by the materializer.
//! A scalar multiply, and a scalar add whose zero-point shift stayed in
//! range, change only the descriptor: the stored 8-bit values are reused
//! untouched and no arithmetic is emitted.

use super::ConvertCtx;
use crate::{
    error::LowerError,
    graph::TracedNode,
    params::{QuantScale, QuantZeroPoint},
    qir::{DType, QirNode, ValueId},
};

/// Materialized operand layout (both ops):
/// 0 value, 1 scalar, 2 output_scale, 3 output_zero_point,
/// 4 input_scale, 5 input_zero_point.
#[tracing::instrument(name = "convert::add_scalar", skip_all, fields(node = node.idx))]
pub(super) fn add_scalar(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 6)?;

    let scalar = ctx.graph.expect_f64(node.inputs[1])?;
    let (output_scale, output_zero_point) = ctx.scale_zp(node, 2)?;
    let (input_scale, input_zero_point) = ctx.scale_zp(node, 4)?;

    let c_q = (scalar / input_scale).round();
    let shift = input_zero_point as f64 - c_q;
    if (0.0..=255.0).contains(&shift) {
        // In-range shift: pure rescale, the value passes through unchanged.
        return ctx.value(node.inputs[0]);
    }

    // Out of range: fall back to real-domain addition with the quantized
    // units of the scalar, then requantize to the computed output params.
    let value = ctx.value(node.inputs[0])?;
    let dequantized = ctx.qir.push(QirNode::Dequantize {
        value,
        scale: input_scale,
        zero_point: input_zero_point,
    });
    let addend = ctx.qir.push(QirNode::Constant {
        value: c_q * input_scale,
    });
    let sum = ctx.qir.push(QirNode::Add {
        lhs: dequantized,
        rhs: addend,
    });
    Ok(ctx.qir.push(QirNode::Quantize {
        value: sum,
        scale: QuantScale::PerTensor(output_scale),
        zero_point: QuantZeroPoint::PerTensor(output_zero_point),
        axis: 1,
        dtype: DType::U8,
    }))
}

/// Pure rescale in all cases: the stored values are untouched, only the
/// descriptor scale changed (zero point is invariant under scaling).
#[tracing::instrument(name = "convert::mul_scalar", skip_all, fields(node = node.idx))]
pub(super) fn mul_scalar(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 6)?;
    ctx.value(node.inputs[0])
}
