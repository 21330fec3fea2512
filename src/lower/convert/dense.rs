//! Conversion of `quantized::linear` and `quantized::linear_relu`.
//!
//! Identical fixed-point arithmetic to the convolution conversion, over a
//! dense contraction instead of a sliding window, and with no padding step.

use super::{conv2d::requantize_clip_cast, ConvertCtx};
use crate::{
    error::LowerError,
    graph::TracedNode,
    params::QuantZeroPoint,
    qir::{DType, QirNode, ValueId},
};

/// Materialized operand layout:
/// 0 input, 1 packed param symbol, 2 output_scale, 3 output_zero_point,
/// 4 input_scale, 5 input_zero_point.
#[tracing::instrument(name = "convert::linear", skip_all, fields(node = node.idx))]
pub(super) fn quantized_linear(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
    with_relu: bool,
) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 6)?;

    let data = ctx.value(node.inputs[0])?;
    let packed_name = ctx.graph.expect_symbol(node.inputs[1])?;
    let qparam = ctx.registry.get(packed_name).ok_or_else(|| {
        LowerError::invariant(
            node.idx,
            node.kind,
            format!("no packed parameter `{packed_name}` in the registry"),
        )
    })?;
    let (output_scale, output_zero_point) = ctx.scale_zp(node, 2)?;
    let (input_scale, input_zero_point) = ctx.scale_zp(node, 4)?;

    let weight_var = ctx.qir.push(QirNode::Param {
        name: qparam.weight_handle.clone(),
    });
    let qweight = ctx.qir.push(QirNode::Quantize {
        value: weight_var,
        scale: qparam.scale.clone(),
        zero_point: qparam.zero_point.clone(),
        axis: 0,
        dtype: DType::I8,
    });

    let dense = ctx.qir.push(QirNode::AffineDense {
        input: data,
        weight: qweight,
        input_zero_point,
        weight_zero_point: qparam.zero_point.clone(),
    });

    let accum_scale = qparam.scale.scaled_by(input_scale);
    let biased = match &qparam.bias_handle {
        Some(handle) => {
            let bias_var = ctx.qir.push(QirNode::Param {
                name: handle.clone(),
            });
            let qbias = ctx.qir.push(QirNode::Quantize {
                value: bias_var,
                scale: accum_scale.clone(),
                zero_point: QuantZeroPoint::PerTensor(0),
                axis: 0,
                dtype: DType::I32,
            });
            ctx.qir.push(QirNode::BiasAdd {
                value: dense,
                bias: qbias,
            })
        }
        None => dense,
    };

    Ok(requantize_clip_cast(
        ctx,
        biased,
        accum_scale,
        output_scale,
        output_zero_point,
        with_relu,
    ))
}
