//! Conversion of `quantized::conv2d` and `quantized::conv2d_relu`.

use super::ConvertCtx;
use crate::{
    error::LowerError,
    graph::TracedNode,
    params::{QuantScale, QuantZeroPoint},
    qir::{DType, QirNode, ValueId},
};

/// Materialized operand layout:
/// 0 input, 1 packed param symbol, 2 stride, 3 padding, 4 dilation,
/// 5 groups, 6 output_scale, 7 output_zero_point, 8 input_scale,
/// 9 input_zero_point.
#[tracing::instrument(name = "convert::conv2d", skip_all, fields(node = node.idx))]
pub(super) fn quantized_conv2d(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
    with_relu: bool,
) -> Result<ValueId, LowerError> {
    ctx.expect_arity(node, 10)?;

    let data = ctx.value(node.inputs[0])?;
    let packed_name = ctx.graph.expect_symbol(node.inputs[1])?;
    let qparam = ctx.registry.get(packed_name).ok_or_else(|| {
        LowerError::invariant(
            node.idx,
            node.kind,
            format!("no packed parameter `{packed_name}` in the registry"),
        )
    })?;
    let strides = ctx.int_pair(node, 2)?;
    let padding = ctx.int_pair(node, 3)?;
    let dilation = ctx.int_pair(node, 4)?;
    let groups = ctx.graph.expect_i64(node.inputs[5])? as usize;
    let (output_scale, output_zero_point) = ctx.scale_zp(node, 6)?;
    let (input_scale, input_zero_point) = ctx.scale_zp(node, 8)?;

    // The weight enters the IR as its symbolic handle, quantized back into
    // its own affine domain (i8; per-channel along the output channel axis).
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

    // Explicit padding fills with the input zero point, not zero; a zero
    // fill would silently shift the affine result.
    let data = if padding != (0, 0) {
        ctx.qir.push(QirNode::Pad {
            value: data,
            padding,
            pad_value: input_zero_point as f64,
        })
    } else {
        data
    };

    let conv = ctx.qir.push(QirNode::AffineConv2d {
        input: data,
        weight: qweight,
        input_zero_point,
        weight_zero_point: qparam.zero_point.clone(),
        strides,
        dilation,
        groups,
    });

    // Accumulator domain: input_scale * weight_scale, zero point 0.
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
                value: conv,
                bias: qbias,
            })
        }
        None => conv,
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

/// Requantize an i32 accumulator to the declared output domain, clip to the
/// u8 range (a fused relu raises the lower bound to the output zero point
/// instead of emitting a separate max), and cast to u8.
///
/// Shared with the linear conversion, whose accumulator semantics are
/// identical.
pub(super) fn requantize_clip_cast(
    ctx: &mut ConvertCtx<'_>,
    value: ValueId,
    accum_scale: QuantScale,
    output_scale: f64,
    output_zero_point: i32,
    with_relu: bool,
) -> ValueId {
    let requantized = ctx.qir.push(QirNode::Requantize {
        value,
        in_scale: accum_scale,
        in_zero_point: 0,
        out_scale: output_scale,
        out_zero_point: output_zero_point,
        axis: 1,
    });
    let clip_min = if with_relu {
        output_zero_point as f64
    } else {
        0.0
    };
    let clipped = ctx.qir.push(QirNode::Clip {
        value: requantized,
        min: clip_min,
        max: 255.0,
    });
    ctx.qir.push(QirNode::Cast {
        value: clipped,
        dtype: DType::U8,
    })
}
